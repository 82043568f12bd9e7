//! # Rate Limiter Chain
//!
//! A chain is an ordered set of fixed leaky-bucket windows. An event is
//! admitted only if every window has budget for it, and a rejection by any
//! window hands back the budget the earlier windows already gave.
//!
//! ```text
//!     check() with windows (1s, 5) and (60s, 1):
//!
//!     call 1:  1s: 5 ─► 4  ✅   60s: 1 ─► 0  ✅   ──► admitted
//!     call 2:  1s: 4 ─► 3  ✅   60s: 0       ❌
//!              1s: 3 ─► 4  (rollback)           ──► rejected
//! ```
//!
//! ## Windows
//!
//! A window holds `allowance` tokens. A token is taken per event while any
//! remain. Once empty, the window refills in full only when its interval
//! has elapsed since it was last (re)armed; refilling spends one token
//! immediately for the event that triggered it.
//!
//! ## Serialization
//!
//! The whole check (including any rollback) runs under one lock per chain,
//! so two callers can never interleave their spend-then-rollback sequences.

use super::{
    alarm::ThrottleListener,
    config::{validate_windows, WindowSpec},
    error::ConfigError,
    metrics::LimiterStats,
    utils::{current_time_ms, secs_to_ms},
};
use parking_lot::Mutex;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{debug, info};

/// One leaky-bucket window of a chain.
#[derive(Debug, Clone)]
struct RateWindow {
    interval_ms: u64,
    allowance: u64,
    remaining: u64,
    window_start_ms: u64,
    window_end_ms: u64,
    active: bool,
}

impl RateWindow {
    fn from_spec(spec: &WindowSpec) -> Self {
        // Validated positive before this point.
        let interval_ms = secs_to_ms(spec.interval_secs as u64);
        let allowance = spec.allowance as u64;
        Self {
            interval_ms,
            allowance,
            remaining: allowance,
            window_start_ms: 0,
            window_end_ms: 0,
            active: false,
        }
    }

    fn start(&mut self, now_ms: u64) {
        self.window_start_ms = now_ms;
        self.window_end_ms = now_ms.saturating_add(self.interval_ms);
        self.remaining = self.allowance;
        self.active = true;
    }

    fn stop(&mut self) {
        self.active = false;
    }

    /// Takes one token; `true` means this window approves the event.
    #[inline]
    fn take(&mut self, now_ms: u64) -> bool {
        if !self.active {
            return true;
        }
        if self.remaining > 0 {
            self.remaining -= 1;
            return true;
        }
        if now_ms >= self.window_end_ms {
            debug!(
                interval_ms = self.interval_ms,
                idle_ms = now_ms.saturating_sub(self.window_start_ms),
                "refilled rate window"
            );
            self.remaining = self.allowance - 1;
            self.window_start_ms = now_ms;
            self.window_end_ms = now_ms.saturating_add(self.interval_ms);
            return true;
        }
        false
    }

    /// Returns a token taken earlier in the same check.
    #[inline]
    fn rollback(&mut self) {
        if self.active && self.remaining < self.allowance {
            self.remaining += 1;
        }
    }
}

#[derive(Debug)]
struct ChainState {
    windows: Vec<RateWindow>,
    running: bool,
    throttled: bool,
}

/// Transition produced by a check, reported after the lock is released.
enum Transition {
    None,
    Throttled,
    Released,
}

/// Multi-window admission limiter.
///
/// A freshly built chain is stopped and admits everything; call
/// [`start`](Self::start) to arm it.
///
/// # Example
///
/// ```rust
/// use admission::{RateLimiterChain, WindowSpec};
///
/// let chain = RateLimiterChain::new(
///     "inbound",
///     &[WindowSpec::new(60, 1), WindowSpec::new(1, 5)],
/// ).unwrap();
/// chain.start();
///
/// assert!(chain.check());
/// assert!(!chain.check()); // the 60s window is spent
/// ```
pub struct RateLimiterChain {
    name: String,
    state: Mutex<ChainState>,
    listener: Mutex<Option<Arc<dyn ThrottleListener>>>,
    total_admitted: AtomicU64,
    total_rejected: AtomicU64,
}

impl RateLimiterChain {
    /// Builds a stopped chain from a window list.
    ///
    /// Windows are sorted so the narrowest interval is evaluated first.
    ///
    /// # Errors
    ///
    /// [`ConfigError::EmptyWindows`] for an empty list, or
    /// [`ConfigError::NonPositiveWindow`] for the first invalid window.
    pub fn new(name: impl Into<String>, windows: &[WindowSpec]) -> Result<Self, ConfigError> {
        let windows = build_windows(windows)?;
        Ok(Self {
            name: name.into(),
            state: Mutex::new(ChainState {
                windows,
                running: false,
                throttled: false,
            }),
            listener: Mutex::new(None),
            total_admitted: AtomicU64::new(0),
            total_rejected: AtomicU64::new(0),
        })
    }

    /// Builds a stopped chain from text such as `"1:5, 60:100"`.
    ///
    /// # Errors
    ///
    /// See [`parse_windows`](crate::parse_windows).
    pub fn parse(name: impl Into<String>, windows: &str) -> Result<Self, ConfigError> {
        Self::new(name, &super::config::parse_windows(windows)?)
    }

    /// Chain name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Attaches a listener for throttle engage/release transitions.
    pub fn set_listener(&self, listener: Arc<dyn ThrottleListener>) {
        *self.listener.lock() = Some(listener);
    }

    /// Arms every window against the current time.
    pub fn start(&self) {
        let now_ms = current_time_ms();
        let mut state = self.state.lock();
        for window in state.windows.iter_mut() {
            window.start(now_ms);
        }
        state.running = true;
        state.throttled = false;
        info!(limiter = %self.name, windows = state.windows.len(), "rate limiter started");
    }

    /// Disarms every window; `check()` admits everything until restarted.
    pub fn stop(&self) {
        let mut state = self.state.lock();
        for window in state.windows.iter_mut() {
            window.stop();
        }
        state.running = false;
        info!(limiter = %self.name, "rate limiter stopped");
    }

    /// Whether the chain is armed.
    pub fn is_running(&self) -> bool {
        self.state.lock().running
    }

    /// Replaces the window set.
    ///
    /// # Errors
    ///
    /// [`ConfigError::LimiterRunning`] if the chain has not been stopped,
    /// otherwise the same validation errors as [`new`](Self::new). On error
    /// the previous windows are kept.
    pub fn reconfigure(&self, windows: &[WindowSpec]) -> Result<(), ConfigError> {
        let mut state = self.state.lock();
        if state.running {
            return Err(ConfigError::LimiterRunning(self.name.clone()));
        }
        state.windows = build_windows(windows)?;
        debug!(limiter = %self.name, windows = state.windows.len(), "rate limiter reconfigured");
        Ok(())
    }

    /// Consumes one event's worth of budget from every window.
    ///
    /// Returns `true` if all windows admit the event. On the first window
    /// that refuses, tokens taken by the windows before it are returned and
    /// `false` is returned. A stopped chain always returns `true`.
    #[inline]
    pub fn check(&self) -> bool {
        self.check_at(current_time_ms())
    }

    pub(crate) fn check_at(&self, now_ms: u64) -> bool {
        let (admitted, transition) = {
            let mut state = self.state.lock();
            if !state.running {
                return true;
            }

            let admitted = admit_all(&mut state.windows, now_ms);

            let transition = match (admitted, state.throttled) {
                (false, false) => {
                    state.throttled = true;
                    Transition::Throttled
                }
                (true, true) => {
                    state.throttled = false;
                    Transition::Released
                }
                _ => Transition::None,
            };
            (admitted, transition)
        };

        if admitted {
            self.total_admitted.fetch_add(1, Ordering::Relaxed);
        } else {
            self.total_rejected.fetch_add(1, Ordering::Relaxed);
        }

        match transition {
            Transition::None => {}
            Transition::Throttled => {
                debug!(limiter = %self.name, "throttle engaged");
                if let Some(listener) = self.listener.lock().clone() {
                    listener.flow_exceeds_threshold(&self.name);
                }
            }
            Transition::Released => {
                debug!(limiter = %self.name, "throttle released");
                if let Some(listener) = self.listener.lock().clone() {
                    listener.flow_ok_again(&self.name);
                }
            }
        }

        admitted
    }

    /// Remaining tokens per window, narrowest interval first.
    pub fn remaining(&self) -> Vec<u64> {
        self.state.lock().windows.iter().map(|w| w.remaining).collect()
    }

    /// Current window settings, narrowest interval first.
    pub fn windows(&self) -> Vec<WindowSpec> {
        self.state
            .lock()
            .windows
            .iter()
            .map(|w| WindowSpec::new((w.interval_ms / 1000) as i64, w.allowance as i64))
            .collect()
    }

    /// Snapshot of admission counters.
    pub fn stats(&self) -> LimiterStats {
        let state = self.state.lock();
        LimiterStats {
            name: self.name.clone(),
            running: state.running,
            throttled: state.throttled,
            windows: state.windows.len(),
            total_admitted: self.total_admitted.load(Ordering::Relaxed),
            total_rejected: self.total_rejected.load(Ordering::Relaxed),
        }
    }
}

/// Runs one event through every window, rolling back on the first refusal.
fn admit_all(windows: &mut [RateWindow], now_ms: u64) -> bool {
    for index in 0..windows.len() {
        if !windows[index].take(now_ms) {
            for earlier in windows[..index].iter_mut() {
                earlier.rollback();
            }
            return false;
        }
    }
    true
}

fn build_windows(specs: &[WindowSpec]) -> Result<Vec<RateWindow>, ConfigError> {
    validate_windows(specs)?;

    let mut windows: Vec<RateWindow> = specs.iter().map(RateWindow::from_spec).collect();
    windows.sort_by_key(|w| w.interval_ms);
    Ok(windows)
}

impl fmt::Debug for RateLimiterChain {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.state.lock();
        f.debug_struct("RateLimiterChain")
            .field("name", &self.name)
            .field("running", &state.running)
            .field("windows", &state.windows.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::super::alarm::testing::{Alarm, RecordingSink};
    use super::*;
    use std::thread;
    use std::time::Duration;

    fn started(windows: &[WindowSpec]) -> RateLimiterChain {
        let chain = RateLimiterChain::new("test", windows).unwrap();
        chain.start();
        chain
    }

    #[test]
    fn test_single_window_exhaustion() {
        let chain = started(&[WindowSpec::new(1, 3)]);

        assert!(chain.check());
        assert!(chain.check());
        assert!(chain.check());
        assert!(!chain.check());
    }

    #[test]
    fn test_single_window_refills_after_interval() {
        let chain = started(&[WindowSpec::new(1, 3)]);
        for _ in 0..3 {
            assert!(chain.check());
        }
        assert!(!chain.check());

        thread::sleep(Duration::from_millis(1100));

        assert!(chain.check());
        assert_eq!(chain.remaining(), vec![2]);
    }

    #[test]
    fn test_refill_with_explicit_clock() {
        let chain = started(&[WindowSpec::new(1, 2)]);
        let now = current_time_ms();

        assert!(chain.check_at(now));
        assert!(chain.check_at(now));
        assert!(!chain.check_at(now + 500));
        assert!(chain.check_at(now + 1500));
        assert_eq!(chain.remaining(), vec![1]);
    }

    #[test]
    fn test_rollback_on_slow_window_denial() {
        let chain = started(&[WindowSpec::new(1, 5), WindowSpec::new(60, 1)]);

        assert!(chain.check());
        assert_eq!(chain.remaining(), vec![4, 0]);

        let before = chain.remaining()[0];
        assert!(!chain.check());
        assert_eq!(chain.remaining()[0], before);
    }

    #[test]
    fn test_windows_sorted_ascending() {
        let chain = RateLimiterChain::new(
            "sorted",
            &[
                WindowSpec::new(20, 40),
                WindowSpec::new(6, 20),
                WindowSpec::new(1, 6),
            ],
        )
        .unwrap();

        assert_eq!(
            chain.windows(),
            vec![
                WindowSpec::new(1, 6),
                WindowSpec::new(6, 20),
                WindowSpec::new(20, 40)
            ]
        );
    }

    #[test]
    fn test_stopped_chain_passes_everything() {
        let chain = RateLimiterChain::new("idle", &[WindowSpec::new(60, 1)]).unwrap();
        assert!(!chain.is_running());
        for _ in 0..10 {
            assert!(chain.check());
        }

        chain.start();
        assert!(chain.check());
        assert!(!chain.check());

        chain.stop();
        assert!(chain.check());
    }

    #[test]
    fn test_invalid_windows_rejected() {
        assert_eq!(
            RateLimiterChain::new("bad", &[]).unwrap_err(),
            ConfigError::EmptyWindows
        );
        assert!(matches!(
            RateLimiterChain::new("bad", &[WindowSpec::new(1, 0)]),
            Err(ConfigError::NonPositiveWindow { .. })
        ));
        assert!(matches!(
            RateLimiterChain::parse("bad", "1:5, 7"),
            Err(ConfigError::MalformedWindow(_))
        ));
    }

    #[test]
    fn test_reconfigure_requires_stop() {
        let chain = started(&[WindowSpec::new(1, 1)]);

        assert_eq!(
            chain.reconfigure(&[WindowSpec::new(1, 10)]),
            Err(ConfigError::LimiterRunning("test".to_string()))
        );

        chain.stop();
        chain
            .reconfigure(&[WindowSpec::new(10, 2), WindowSpec::new(1, 10)])
            .unwrap();
        assert_eq!(
            chain.windows(),
            vec![WindowSpec::new(1, 10), WindowSpec::new(10, 2)]
        );

        assert!(chain.reconfigure(&[WindowSpec::new(-1, 2)]).is_err());
        assert_eq!(chain.windows().len(), 2);
    }

    #[test]
    fn test_throttle_listener_edges() {
        let sink = Arc::new(RecordingSink::default());
        let chain = started(&[WindowSpec::new(1, 1)]);
        chain.set_listener(sink.clone());
        let now = current_time_ms();

        assert!(chain.check_at(now));
        assert!(!chain.check_at(now));
        assert!(!chain.check_at(now));
        assert!(chain.check_at(now + 1000));
        assert!(!chain.check_at(now + 1000));

        assert_eq!(
            sink.events(),
            vec![
                Alarm::Throttled("test".into()),
                Alarm::Unthrottled("test".into()),
                Alarm::Throttled("test".into()),
            ]
        );
    }

    #[test]
    fn test_stats() {
        let chain = started(&[WindowSpec::new(60, 2)]);
        chain.check();
        chain.check();
        chain.check();

        let stats = chain.stats();
        assert_eq!(stats.total_admitted, 2);
        assert_eq!(stats.total_rejected, 1);
        assert!(stats.running);
        assert!(stats.throttled);
    }

    #[test]
    fn test_concurrent_checks_never_overspend() {
        let chain = Arc::new(started(&[WindowSpec::new(60, 100), WindowSpec::new(120, 150)]));
        let mut handles = vec![];

        for _ in 0..8 {
            let chain = chain.clone();
            handles.push(thread::spawn(move || {
                (0..50).filter(|_| chain.check()).count()
            }));
        }

        let admitted: usize = handles.into_iter().map(|h| h.join().unwrap()).sum();
        assert_eq!(admitted, 100);
        assert_eq!(chain.remaining(), vec![0, 50]);
    }
}
