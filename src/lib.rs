#![doc = include_str!("RUSTDOC.md")]

pub mod backup;
pub mod durable;
pub mod logger;
pub mod notifier;
pub mod options;
pub mod platform;
pub mod realtime;
pub mod schema;
pub mod session;
pub mod store;
pub mod util;
