pub mod backoff;
pub mod subscribe;
pub mod time;

pub use backoff::{BackoffConfig, BackoffState};
pub use subscribe::{Listener, ListenerSet, Subscription};
pub use time::{system_clock, Clock, ManualClock, SystemClock};
