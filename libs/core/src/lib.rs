//! Channel relay core contracts and pipeline stages.
//!
//! This crate holds the data exchanged between the Telegram adapter and the outbound
//! queue: channel references and the tracked set, inbound update shapes, the filter
//! that picks tracked channel posts, and the envelope builder with its dedup key.
pub mod channel;
pub mod envelope;
pub mod filter;
pub mod registry;
pub mod subjects;
pub mod update;

pub use channel::*;
pub use envelope::*;
pub use filter::*;
pub use registry::*;
pub use subjects::*;
pub use update::*;
