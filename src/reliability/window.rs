//! AIMD congestion window.

use crate::core::MAX_FRAGMENT_PAYLOAD;

/// Initial window: 4 segments, in the spirit of RFC 3390.
const INITIAL_SEGMENTS: usize = 4;
/// Initial slow-start threshold: effectively unbounded until first loss.
const INITIAL_SSTHRESH: usize = usize::MAX / 2;

/// Byte-denominated congestion window with additive-increase /
/// multiplicative-decrease dynamics.
///
/// Slow start doubles per RTT (one MSS per acked segment) until the
/// threshold, then congestion avoidance adds roughly one MSS per window
/// per RTT. Loss halves the window unless rate control is disabled,
/// in which case the decrease is skipped entirely. That bypass exists
/// for P2P links where a halved window causes peers to drop us; the
/// trade-off belongs to the caller.
#[derive(Debug, Clone)]
pub struct CongestionWindow {
    cwnd: usize,
    ssthresh: usize,
    mss: usize,
    disable_rate_control: bool,
}

impl CongestionWindow {
    /// New window with the default MSS.
    pub fn new(disable_rate_control: bool) -> Self {
        Self::with_mss(MAX_FRAGMENT_PAYLOAD, disable_rate_control)
    }

    /// New window over a custom segment size.
    pub fn with_mss(mss: usize, disable_rate_control: bool) -> Self {
        Self {
            cwnd: INITIAL_SEGMENTS * mss,
            ssthresh: INITIAL_SSTHRESH,
            mss,
            disable_rate_control,
        }
    }

    /// Current window in bytes.
    pub fn window(&self) -> usize {
        self.cwnd
    }

    /// Whether `bytes` more may enter the network given what is already
    /// in flight.
    pub fn can_send(&self, in_flight: usize, bytes: usize) -> bool {
        in_flight + bytes <= self.cwnd
    }

    /// Grow the window for acknowledged bytes.
    pub fn on_ack(&mut self, bytes_acked: usize) {
        if self.cwnd < self.ssthresh {
            // Slow start: window grows by the acked volume.
            self.cwnd += bytes_acked.min(self.mss);
        } else {
            // Congestion avoidance: ~one MSS per window per RTT.
            self.cwnd += (self.mss * self.mss / self.cwnd).max(1);
        }
    }

    /// React to a loss signal (retransmission timeout).
    ///
    /// With rate control disabled this is a no-op; otherwise the window
    /// halves and the threshold follows.
    pub fn on_loss(&mut self) {
        if self.disable_rate_control {
            return;
        }
        self.ssthresh = (self.cwnd / 2).max(2 * self.mss);
        self.cwnd = (self.cwnd / 2).max(self.mss);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn slow_start_grows_by_acked_volume() {
        let mut w = CongestionWindow::with_mss(1000, false);
        let initial = w.window();
        w.on_ack(1000);
        assert_eq!(w.window(), initial + 1000);
    }

    #[test]
    fn loss_halves_window_with_floor() {
        let mut w = CongestionWindow::with_mss(1000, false);
        w.on_loss();
        assert_eq!(w.window(), 2000);
        // Repeated loss bottoms out at one MSS.
        for _ in 0..10 {
            w.on_loss();
        }
        assert_eq!(w.window(), 1000);
    }

    #[test]
    fn disabled_rate_control_skips_decrease() {
        let mut w = CongestionWindow::with_mss(1000, true);
        let before = w.window();
        w.on_loss();
        assert_eq!(w.window(), before);
        // Growth still works.
        w.on_ack(1000);
        assert_eq!(w.window(), before + 1000);
    }

    #[test]
    fn congestion_avoidance_after_loss_is_additive() {
        let mut w = CongestionWindow::with_mss(1000, false);
        w.on_loss(); // cwnd 2000, ssthresh 2000 -> avoidance regime
        let before = w.window();
        w.on_ack(1000);
        let grown = w.window() - before;
        assert!(grown <= 1000 / 2, "additive growth expected, got {grown}");
    }

    #[test]
    fn gating_respects_in_flight() {
        let w = CongestionWindow::with_mss(1000, false);
        assert!(w.can_send(0, 4000));
        assert!(!w.can_send(3500, 1000));
    }
}
