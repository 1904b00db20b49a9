//! Wireless M-Bus receiver core
//!
//! This library turns raw radio symbols into structured, authenticated,
//! decrypted meter readings: radio receive loop, link-layer framing,
//! telegram parsing with the security layer, DIF/VIF record decoding and
//! per-meter field extraction.

pub mod config;
pub mod dvparser;
pub mod link;
pub mod meters;
pub mod radio;
pub mod telegram;
pub mod units;
pub mod utils;

// Re-export common types for easier access
pub use config::{Config, CONFIG};
pub use link::{Frame, FrameFormat, LinkMode, LinkModeSet};
pub use meters::{init_drivers, AddressExpression, Meter, MeterManager, RenderedRecord};
pub use radio::{RawPacket, Receiver, Transceiver};
pub use telegram::{AboutTelegram, MeterKeys, Telegram};

pub fn get_unix_ts() -> u64 {
    return std::time::SystemTime::now()
        .duration_since(std::time::SystemTime::UNIX_EPOCH)
        .unwrap()
        .as_secs();
}
