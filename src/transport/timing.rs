//! Round-trip time estimation (RFC 6298).

use std::time::Duration;

use crate::core::{INITIAL_RTO, MAX_RTO, MIN_RTO};

/// Alpha for SRTT smoothing (1/8).
const SRTT_ALPHA: f64 = 0.125;
/// Beta for RTTVAR smoothing (1/4).
const RTTVAR_BETA: f64 = 0.25;
/// K multiplier for RTO calculation.
const RTO_K: f64 = 4.0;
/// Clock granularity floor for the variance term, in milliseconds.
const GRANULARITY_MS: f64 = 10.0;

/// Smoothed RTT / RTO estimator shared by a session's flows.
///
/// Only fragments acknowledged without a retransmission contribute
/// samples (Karn's algorithm).
#[derive(Debug, Clone)]
pub struct RttEstimator {
    srtt_ms: f64,
    rttvar_ms: f64,
    rto: Duration,
    initialized: bool,
}

impl Default for RttEstimator {
    fn default() -> Self {
        Self::new()
    }
}

impl RttEstimator {
    /// Create an estimator with the initial RTO and no samples.
    pub fn new() -> Self {
        Self {
            srtt_ms: 0.0,
            rttvar_ms: 0.0,
            rto: INITIAL_RTO,
            initialized: false,
        }
    }

    /// Fold in one RTT sample and recompute the RTO.
    pub fn sample(&mut self, rtt: Duration) {
        let rtt_ms = rtt.as_secs_f64() * 1000.0;
        if self.initialized {
            self.rttvar_ms =
                (1.0 - RTTVAR_BETA) * self.rttvar_ms + RTTVAR_BETA * (self.srtt_ms - rtt_ms).abs();
            self.srtt_ms = (1.0 - SRTT_ALPHA) * self.srtt_ms + SRTT_ALPHA * rtt_ms;
        } else {
            self.srtt_ms = rtt_ms;
            self.rttvar_ms = rtt_ms / 2.0;
            self.initialized = true;
        }
        self.rto = Self::clamp_rto(
            self.srtt_ms + f64::max(GRANULARITY_MS, RTO_K * self.rttvar_ms),
        );
    }

    /// Current retransmission timeout.
    pub fn rto(&self) -> Duration {
        self.rto
    }

    /// Smoothed RTT, if at least one sample arrived.
    pub fn srtt(&self) -> Option<Duration> {
        self.initialized
            .then(|| Duration::from_secs_f64(self.srtt_ms / 1000.0))
    }

    /// Double the RTO after a retransmission timeout, capped at the maximum.
    pub fn backoff(&mut self) -> Duration {
        self.rto = (self.rto * 2).min(MAX_RTO);
        self.rto
    }

    fn clamp_rto(rto_ms: f64) -> Duration {
        let ms = rto_ms.clamp(MIN_RTO.as_millis() as f64, MAX_RTO.as_millis() as f64);
        Duration::from_millis(ms as u64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn starts_with_initial_rto() {
        let est = RttEstimator::new();
        assert_eq!(est.rto(), INITIAL_RTO);
        assert!(est.srtt().is_none());
    }

    #[test]
    fn first_sample_seeds_estimate() {
        let mut est = RttEstimator::new();
        est.sample(Duration::from_millis(80));
        let srtt = est.srtt().unwrap();
        assert_eq!(srtt, Duration::from_millis(80));
        // RTO = SRTT + 4 * RTTVAR = 80 + 4 * 40 = 240ms
        assert_eq!(est.rto(), Duration::from_millis(240));
    }

    #[test]
    fn smoothing_converges() {
        let mut est = RttEstimator::new();
        for _ in 0..100 {
            est.sample(Duration::from_millis(50));
        }
        let srtt = est.srtt().unwrap().as_millis();
        assert!((49..=51).contains(&srtt));
        // Variance collapses toward zero; granularity floor keeps RTO sane.
        assert!(est.rto() >= MIN_RTO);
    }

    #[test]
    fn backoff_doubles_and_caps() {
        let mut est = RttEstimator::new();
        let first = est.backoff();
        assert_eq!(first, INITIAL_RTO * 2);
        for _ in 0..16 {
            est.backoff();
        }
        assert_eq!(est.rto(), MAX_RTO);
    }

    #[test]
    fn rto_is_clamped_low() {
        let mut est = RttEstimator::new();
        est.sample(Duration::from_millis(1));
        assert!(est.rto() >= MIN_RTO);
    }
}
