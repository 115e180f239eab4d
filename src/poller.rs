//! Fixed-interval refresh loop.
//!
//! The poller owns every driver. Each tick refreshes the ready devices and
//! tries to reconnect the ones that dropped to `Disconnected`; a failing
//! device never stops the others from being polled.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use tracing::{debug, info, warn};

use crate::device::{DeviceDriver, DeviceState};

/// Longest single sleep, so a stop request is noticed quickly.
const SLEEP_SLICE: Duration = Duration::from_millis(100);

/// Outcome of one tick.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TickSummary {
    pub refreshed: usize,
    pub reconnected: usize,
    pub failed: usize,
}

/// Drives `refresh` on every device at a fixed interval.
pub struct Poller {
    drivers: Vec<Box<dyn DeviceDriver>>,
    interval: Duration,
    running: Arc<AtomicBool>,
}

impl Poller {
    pub fn new(drivers: Vec<Box<dyn DeviceDriver>>, interval: Duration) -> Self {
        Self {
            drivers,
            interval,
            running: Arc::new(AtomicBool::new(true)),
        }
    }

    /// Flag that stops [`Poller::run`] when cleared, e.g. from a Ctrl+C
    /// handler.
    pub fn running_flag(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.running)
    }

    pub fn drivers(&self) -> &[Box<dyn DeviceDriver>] {
        &self.drivers
    }

    /// Connect every device; returns how many came up.
    pub fn connect_all(&mut self) -> usize {
        let mut connected = 0;
        for driver in &mut self.drivers {
            if driver.connect() {
                connected += 1;
            }
        }
        connected
    }

    /// Refresh ready devices and reconnect disconnected ones.
    pub fn tick(&mut self) -> TickSummary {
        let mut summary = TickSummary::default();

        for driver in &mut self.drivers {
            match driver.state() {
                DeviceState::Disconnected => {
                    debug!(device = %driver.unique_id(), "Attempting reconnect");
                    if driver.connect() {
                        summary.reconnected += 1;
                    } else {
                        summary.failed += 1;
                    }
                }
                DeviceState::Ready => match driver.refresh() {
                    Ok(()) => summary.refreshed += 1,
                    Err(e) => {
                        warn!(device = %driver.unique_id(), error = %e, "Refresh failed");
                        summary.failed += 1;
                    }
                },
                state => debug!(device = %driver.unique_id(), ?state, "Skipping device"),
            }
        }
        summary
    }

    /// Tick until the running flag is cleared, calling `on_tick` after each
    /// tick with the drivers and the tick's summary.
    pub fn run(&mut self, mut on_tick: impl FnMut(&[Box<dyn DeviceDriver>], TickSummary)) {
        info!(devices = self.drivers.len(), interval_ms = self.interval.as_millis() as u64, "Poller started");

        while self.running.load(Ordering::SeqCst) {
            let started = Instant::now();
            let summary = self.tick();
            on_tick(&self.drivers, summary);

            let deadline = started + self.interval;
            while self.running.load(Ordering::SeqCst) {
                let now = Instant::now();
                if now >= deadline {
                    break;
                }
                std::thread::sleep((deadline - now).min(SLEEP_SLICE));
            }
        }
        info!("Poller stopped");
    }

    /// Disconnect every device.
    pub fn shutdown(&mut self) {
        for driver in &mut self.drivers {
            driver.disconnect();
        }
    }
}

impl std::fmt::Debug for Poller {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Poller")
            .field("devices", &self.drivers.len())
            .field("interval", &self.interval)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::test_support::scripted_core;
    use crate::device::{CommanderPro, DeviceFamily, DriverOptions};
    use crate::transport::mock::ScriptHandle;

    /// Commander Pro with only fan 1 connected.
    fn responder(req: &[u8]) -> Vec<Vec<u8>> {
        let mut r = vec![0u8; 16];
        match req[1] {
            0x20 => r[1] = 0x02,
            0x21 => r[1..3].copy_from_slice(&1500u16.to_be_bytes()),
            _ => {}
        }
        vec![r]
    }

    fn device() -> (Box<dyn DeviceDriver>, ScriptHandle) {
        let (core, handle) = scripted_core(DeviceFamily::CommanderPro, DriverOptions::default(), responder);
        (Box::new(CommanderPro::new(core)), handle)
    }

    #[test]
    fn test_tick_refreshes_and_reconnects() {
        let (a, handle_a) = device();
        let (b, _) = device();
        let mut poller = Poller::new(vec![a, b], Duration::from_millis(10));
        assert_eq!(poller.connect_all(), 2);

        assert_eq!(
            poller.tick(),
            TickSummary {
                refreshed: 2,
                ..TickSummary::default()
            }
        );

        // A transport failure drops only the affected device.
        handle_a.fail_next_reads(1);
        let summary = poller.tick();
        assert_eq!(summary.failed, 1);
        assert_eq!(summary.refreshed, 1);
        assert_eq!(poller.drivers()[0].state(), DeviceState::Disconnected);
        assert_eq!(poller.drivers()[0].speed_sensors()[0].rpm, None);

        let summary = poller.tick();
        assert_eq!(summary.reconnected, 1);
        assert_eq!(poller.drivers()[0].state(), DeviceState::Ready);
        assert_eq!(poller.drivers()[0].speed_sensors()[0].rpm, Some(1500));
    }

    #[test]
    fn test_run_stops_on_flag() {
        let (a, _) = device();
        let mut poller = Poller::new(vec![a], Duration::from_millis(1));
        poller.connect_all();

        let running = poller.running_flag();
        let mut ticks = 0;
        poller.run(|drivers, summary| {
            ticks += 1;
            assert_eq!(drivers.len(), 1);
            assert_eq!(summary.refreshed, 1);
            if ticks == 3 {
                running.store(false, Ordering::SeqCst);
            }
        });
        assert_eq!(ticks, 3);

        poller.shutdown();
        assert_eq!(poller.drivers()[0].state(), DeviceState::Disconnected);
    }
}
