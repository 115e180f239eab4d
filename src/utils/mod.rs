pub mod parsing;

// Re-export commonly used items
pub use parsing::{parse_channel_power, parse_product_id};
