//! System-wide exclusive access to the USB bus.
//!
//! Every driver instance, in this process or any other, must wrap each
//! write-then-read transaction in [`ExclusiveGuard::acquire_exclusive`].
//! The guard nests on the owning thread and is backed by a [`SystemLock`]
//! that serializes across processes.

use std::marker::PhantomData;
use std::path::{Path, PathBuf};
use std::sync::{Arc, OnceLock};
use std::thread::ThreadId;

use parking_lot::{Condvar, Mutex, MutexGuard};
use tracing::{error, trace, warn};

use crate::error::{LinkError, Result};

/// File name of the default system-wide lock, created in the temp directory.
pub const LOCK_NAME: &str = "corsair-link-bus.lock";

/// Result of taking a [`SystemLock`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockOutcome {
    /// The lock was free or released cleanly by its previous holder.
    Acquired,
    /// The previous holder terminated while holding the lock. Ownership has
    /// been taken over anyway.
    Abandoned,
}

/// A named lock shared by every process on the host.
pub trait SystemLock: Send + Sync {
    /// Block until the lock is held by this process.
    fn lock(&self) -> Result<LockOutcome>;

    /// Release the lock taken by [`SystemLock::lock`].
    fn unlock(&self) -> Result<()>;
}

/// Lock that only serializes within this process.
///
/// Cross-thread exclusion is already provided by [`ExclusiveGuard`], so this
/// is a no-op. Used where no system-wide primitive is available and in tests.
#[derive(Debug, Default, Clone, Copy)]
pub struct ProcessLocalLock;

impl SystemLock for ProcessLocalLock {
    fn lock(&self) -> Result<LockOutcome> {
        Ok(LockOutcome::Acquired)
    }

    fn unlock(&self) -> Result<()> {
        Ok(())
    }
}

/// `flock(2)`-based system lock on a well-known file.
///
/// The holder writes its PID into the file and truncates it on release, so a
/// non-empty file found right after locking means the previous holder died
/// with the lock held.
#[cfg(unix)]
#[derive(Debug)]
pub struct FileLock {
    path: PathBuf,
    held: Mutex<Option<std::fs::File>>,
}

#[cfg(unix)]
impl FileLock {
    /// Create a lock backed by the file at `path`. Nothing is opened yet.
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            held: Mutex::new(None),
        }
    }

    /// Path of the backing lock file.
    pub fn path(&self) -> &Path {
        &self.path
    }

    fn flock(file: &std::fs::File, operation: libc::c_int) -> Result<()> {
        use std::os::unix::io::AsRawFd;

        loop {
            // SAFETY: the descriptor belongs to `file`, which outlives the call.
            let rc = unsafe { libc::flock(file.as_raw_fd(), operation) };
            if rc == 0 {
                return Ok(());
            }
            let err = std::io::Error::last_os_error();
            if err.kind() != std::io::ErrorKind::Interrupted {
                return Err(LinkError::Lock(format!("flock failed: {}", err)));
            }
        }
    }
}

#[cfg(unix)]
impl SystemLock for FileLock {
    fn lock(&self) -> Result<LockOutcome> {
        use std::io::{Read, Seek, SeekFrom, Write};

        let lock_err =
            |e: std::io::Error| LinkError::Lock(format!("{}: {}", self.path.display(), e));

        let mut file = std::fs::OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(&self.path)
            .map_err(lock_err)?;

        Self::flock(&file, libc::LOCK_EX)?;

        let mut previous = String::new();
        file.read_to_string(&mut previous).map_err(lock_err)?;
        let outcome = if previous.trim().is_empty() {
            LockOutcome::Acquired
        } else {
            LockOutcome::Abandoned
        };

        file.set_len(0).map_err(lock_err)?;
        file.seek(SeekFrom::Start(0)).map_err(lock_err)?;
        write!(file, "{}", std::process::id()).map_err(lock_err)?;
        file.flush().map_err(lock_err)?;

        *self.held.lock() = Some(file);
        Ok(outcome)
    }

    fn unlock(&self) -> Result<()> {
        let Some(file) = self.held.lock().take() else {
            return Ok(());
        };
        file.set_len(0)
            .map_err(|e| LinkError::Lock(format!("{}: {}", self.path.display(), e)))?;
        Self::flock(&file, libc::LOCK_UN)
    }
}

/// Default lock path: `<temp dir>/corsair-link-bus.lock`.
pub fn default_lock_path() -> PathBuf {
    std::env::temp_dir().join(LOCK_NAME)
}

/// Default system lock for this platform at `path`.
#[cfg(unix)]
pub fn system_lock_at(path: impl Into<PathBuf>) -> Box<dyn SystemLock> {
    Box::new(FileLock::new(path))
}

/// Default system lock for this platform at `path`.
#[cfg(not(unix))]
pub fn system_lock_at(path: impl Into<PathBuf>) -> Box<dyn SystemLock> {
    let path = path.into();
    warn!(
        path = %path.display(),
        "No system-wide lock on this platform; serializing within this process only"
    );
    Box::new(ProcessLocalLock)
}

#[derive(Debug, Default)]
struct Ownership {
    owner: Option<ThreadId>,
    depth: usize,
}

struct GuardInner {
    system: Box<dyn SystemLock>,
    state: Mutex<Ownership>,
    released: Condvar,
}

/// Reentrant, cross-process exclusive access guard.
///
/// Cloning is cheap and every clone guards the same lock.
#[derive(Clone)]
pub struct ExclusiveGuard {
    inner: Arc<GuardInner>,
}

static GLOBAL_GUARD: OnceLock<ExclusiveGuard> = OnceLock::new();

impl ExclusiveGuard {
    /// Create a guard over the given system lock.
    pub fn new(system: Box<dyn SystemLock>) -> Self {
        Self {
            inner: Arc::new(GuardInner {
                system,
                state: Mutex::new(Ownership::default()),
                released: Condvar::new(),
            }),
        }
    }

    /// Guard that serializes only within this process.
    pub fn process_local() -> Self {
        Self::new(Box::new(ProcessLocalLock))
    }

    /// Install the process-wide guard. Returns `false` if one already exists.
    pub fn init_global(system: Box<dyn SystemLock>) -> bool {
        GLOBAL_GUARD.set(Self::new(system)).is_ok()
    }

    /// The process-wide guard, created at [`default_lock_path`] on first use.
    pub fn global() -> Self {
        GLOBAL_GUARD
            .get_or_init(|| Self::new(system_lock_at(default_lock_path())))
            .clone()
    }

    /// Take exclusive access to the bus.
    ///
    /// Nested calls on the thread that already holds the guard return
    /// immediately. The returned token releases the lock when dropped.
    pub fn acquire_exclusive(&self) -> Result<ScopedAccess> {
        let me = std::thread::current().id();
        let mut state = self.inner.state.lock();

        while matches!(state.owner, Some(owner) if owner != me) {
            self.inner.released.wait(&mut state);
        }

        if state.owner == Some(me) {
            state.depth += 1;
            return Ok(self.token());
        }

        state.owner = Some(me);
        state.depth = 1;

        // Same-process waiters park on `released`; the state mutex stays free
        // while the system lock blocks.
        let outcome = MutexGuard::unlocked(&mut state, || self.inner.system.lock());
        match outcome {
            Ok(LockOutcome::Acquired) => {
                trace!("Bus lock acquired");
            }
            Ok(LockOutcome::Abandoned) => {
                warn!("Previous bus lock holder terminated while holding it; taking ownership");
            }
            Err(e) => {
                state.owner = None;
                state.depth = 0;
                self.inner.released.notify_one();
                return Err(e);
            }
        }

        Ok(self.token())
    }

    fn token(&self) -> ScopedAccess {
        ScopedAccess {
            inner: Arc::clone(&self.inner),
            _not_send: PhantomData,
        }
    }
}

impl std::fmt::Debug for ExclusiveGuard {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.inner.state.lock();
        f.debug_struct("ExclusiveGuard")
            .field("held", &state.owner.is_some())
            .field("depth", &state.depth)
            .finish()
    }
}

/// Token proving exclusive bus access. Releases on drop.
#[must_use = "the bus is released as soon as the access token is dropped"]
pub struct ScopedAccess {
    inner: Arc<GuardInner>,
    // Ownership is tracked per thread; the token must stay on it.
    _not_send: PhantomData<*const ()>,
}

impl Drop for ScopedAccess {
    fn drop(&mut self) {
        let mut state = self.inner.state.lock();
        state.depth = state.depth.saturating_sub(1);
        if state.depth == 0 {
            if let Err(e) = self.inner.system.unlock() {
                error!(error = %e, "Failed to release bus lock");
            }
            state.owner = None;
            self.inner.released.notify_one();
            trace!("Bus lock released");
        }
    }
}
