//! Passive-side ack throttling
//!
//! A passive that falls behind slows the active down by delaying its
//! acknowledgements. Throttling is graded by how far past the configured
//! threshold the pending-transaction count is:
//!
//! - `factor < 1`: no throttling
//! - `1 <= factor < 3`: sleep up to `factor * max_sleep` in total, polling
//!   the pending count every second and returning early once it drops
//!   below the threshold
//! - `factor >= 3`: halt acks entirely until the pending count falls below
//!   three times the threshold, polling every second indefinitely
//!
//! This is bounded, logged degradation, never dropped data.

use std::time::Duration;

use tracing::{info, warn};

use crate::config::RelayConfig;

const POLL_INTERVAL: Duration = Duration::from_secs(1);
const HALT_LOG_EVERY: u32 = 10;

/// Graded ack throttle
pub struct AckThrottle {
    enabled: bool,
    threshold: usize,
    max_sleep: Duration,
}

impl AckThrottle {
    /// Create a throttle from relay configuration
    pub fn new(config: &RelayConfig) -> Self {
        Self {
            enabled: config.throttle_enabled,
            threshold: config.throttle_threshold,
            max_sleep: config.throttle_max_sleep,
        }
    }

    /// Delay the caller according to the current pending count
    pub async fn apply(&self, pending: impl Fn() -> usize) {
        if !self.enabled || self.threshold == 0 {
            return;
        }

        let count = pending();
        let factor = count as f64 / self.threshold as f64;
        if factor < 1.0 {
            return;
        }

        if factor >= 3.0 {
            warn!(
                "halting acks: {count} transactions pending (threshold {})",
                self.threshold
            );
            let mut polls = 0u32;
            loop {
                tokio::time::sleep(POLL_INTERVAL).await;
                let now = pending();
                if now < self.threshold * 3 {
                    info!("resuming acks: {now} transactions pending");
                    return;
                }
                polls += 1;
                if polls % HALT_LOG_EVERY == 0 {
                    warn!("acks still halted: {now} transactions pending");
                }
            }
        }

        let total = self.max_sleep.mul_f64(factor.min(3.0));
        info!(
            "throttling acks for up to {total:?}: {count} transactions pending (threshold {})",
            self.threshold
        );
        let deadline = tokio::time::Instant::now() + total;
        loop {
            let now = tokio::time::Instant::now();
            if now >= deadline {
                return;
            }
            tokio::time::sleep(POLL_INTERVAL.min(deadline - now)).await;
            if pending() < self.threshold {
                return;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    fn throttle(threshold: usize, max_sleep_secs: u64) -> AckThrottle {
        AckThrottle::new(&RelayConfig {
            throttle_enabled: true,
            throttle_threshold: threshold,
            throttle_max_sleep: Duration::from_secs(max_sleep_secs),
        })
    }

    #[tokio::test(start_paused = true)]
    async fn test_below_threshold_does_not_sleep() {
        let before = tokio::time::Instant::now();
        throttle(1000, 5).apply(|| 999).await;
        assert_eq!(tokio::time::Instant::now(), before);
    }

    #[tokio::test(start_paused = true)]
    async fn test_graded_region_sleeps_factor_times_max_sleep() {
        // factor 1.5 -> up to 7.5s of sleep, polled every second
        let before = tokio::time::Instant::now();
        throttle(1000, 5).apply(|| 1500).await;
        let slept = tokio::time::Instant::now() - before;
        assert_eq!(slept, Duration::from_millis(7500));
    }

    #[tokio::test(start_paused = true)]
    async fn test_graded_region_returns_early_when_pending_drops() {
        let pending = Arc::new(AtomicUsize::new(1500));
        let p = pending.clone();
        let handle = tokio::spawn(async move {
            let before = tokio::time::Instant::now();
            throttle(1000, 5).apply(move || p.load(Ordering::SeqCst)).await;
            tokio::time::Instant::now() - before
        });
        // Drop below the threshold after two seconds
        tokio::time::sleep(Duration::from_millis(2500)).await;
        pending.store(999, Ordering::SeqCst);
        let slept = handle.await.unwrap();
        assert!(slept < Duration::from_secs(4));
    }

    #[tokio::test(start_paused = true)]
    async fn test_factor_three_halts_until_below_triple_threshold() {
        // pending 3500 with threshold 1000 halts until pending < 3000,
        // well past what the graded region would ever sleep
        let pending = Arc::new(AtomicUsize::new(3500));
        let p = pending.clone();
        let handle = tokio::spawn(async move {
            let before = tokio::time::Instant::now();
            throttle(1000, 5).apply(move || p.load(Ordering::SeqCst)).await;
            tokio::time::Instant::now() - before
        });
        // Stays halted far beyond 3 * max_sleep while pending is high
        tokio::time::sleep(Duration::from_secs(60)).await;
        assert!(!handle.is_finished());
        pending.store(2999, Ordering::SeqCst);
        let halted = handle.await.unwrap();
        assert!(halted >= Duration::from_secs(60));
    }

    #[tokio::test(start_paused = true)]
    async fn test_disabled_throttle_never_sleeps() {
        let throttle = AckThrottle::new(&RelayConfig {
            throttle_enabled: false,
            throttle_threshold: 1000,
            throttle_max_sleep: Duration::from_secs(5),
        });
        let before = tokio::time::Instant::now();
        throttle.apply(|| 1_000_000).await;
        assert_eq!(tokio::time::Instant::now(), before);
    }
}
