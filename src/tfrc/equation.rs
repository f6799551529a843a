//! The TCP throughput equation (RFC 3448 3.1).
//! TCP 吞吐量方程（RFC 3448 3.1）。

use super::P_SCALE;
use std::time::Duration;

/// Computes the allowed sending rate in bytes per second:
///
/// `X = s / (R·√(2p/3) + t_RTO·min(1, 3·√(3p/8))·p·(1 + 32p²))` with `t_RTO = 4R`.
///
/// Returns `None` when the equation is undefined (`p == 0` or `R == 0`).
///
/// 计算允许的发送速率（字节/秒）。当方程无定义时返回 `None`。
pub fn throughput(packet_size: usize, rtt: Duration, loss_event_rate: u32) -> Option<u64> {
    if loss_event_rate == 0 || rtt.is_zero() {
        return None;
    }
    let s = packet_size as f64;
    let r = rtt.as_secs_f64();
    let p = (loss_event_rate.min(P_SCALE) as f64) / P_SCALE as f64;
    let t_rto = 4.0 * r;

    let denominator = r * (2.0 * p / 3.0).sqrt()
        + t_rto * (3.0 * (3.0 * p / 8.0).sqrt()).min(1.0) * p * (1.0 + 32.0 * p * p);
    if denominator <= 0.0 || !denominator.is_finite() {
        return None;
    }
    Some(((s / denominator) as u64).max(1))
}
