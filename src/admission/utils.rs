//! # Time Utilities (utils.rs)
//!
//! Every time-driven piece of the crate (rate windows, queue size samples)
//! reads the same monotonic millisecond clock, so that a wall-clock jump
//! never refills a window early or expires a sample twice. It also holds
//! the helper that turns a caught panic payload into loggable text.
//!
//! ```text
//!     Clock model:
//!
//!     process start ──► capture (Instant, epoch_ms)
//!                              │
//!     now_ms = epoch_ms + Instant::elapsed()   (never goes backwards)
//! ```

use std::any::Any;
use std::sync::OnceLock;
use std::time::{Instant, SystemTime, UNIX_EPOCH};

// Wall-clock epoch milliseconds captured once, advanced by a monotonic Instant.
static START_TIME_BASE: OnceLock<(Instant, u64)> = OnceLock::new();

/// Returns the current time in milliseconds since UNIX epoch.
///
/// The value is anchored to the wall clock at first use and then advanced
/// monotonically, so consecutive calls never decrease.
///
/// # Example
///
/// ```rust
/// use admission::current_time_ms;
///
/// let earlier = current_time_ms();
/// let later = current_time_ms();
/// assert!(later >= earlier);
/// ```
#[inline(always)]
pub fn current_time_ms() -> u64 {
    let (start, base_ms) = START_TIME_BASE.get_or_init(|| {
        let epoch_ms = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_millis() as u64;
        (Instant::now(), epoch_ms)
    });
    base_ms.saturating_add(start.elapsed().as_millis() as u64)
}

/// Converts whole seconds to milliseconds without overflowing.
#[inline]
pub(crate) fn secs_to_ms(secs: u64) -> u64 {
    secs.saturating_mul(1000)
}

/// Text of a caught panic payload, for logging.
pub(crate) fn panic_message(payload: &(dyn Any + Send)) -> &str {
    if let Some(message) = payload.downcast_ref::<&str>() {
        message
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message
    } else {
        "non-string panic payload"
    }
}
