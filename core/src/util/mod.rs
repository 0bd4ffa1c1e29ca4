// Small shared helpers: clocks and bounded retry.

pub mod retry;
pub mod time;

pub use retry::{bounded, retry, with_retry, RetryPolicy};
pub use time::{Clock, ManualClock, SystemClock};
