//! 定义了速率控制与冻结机制的可配置参数。
//! Defines configurable parameters for rate control and the freeze machinery.

use std::time::Duration;

/// A structure containing all configurable parameters for a connection.
///
/// 包含所有连接可配置参数的结构体。
#[derive(Debug, Clone, Default)]
pub struct Config {
    /// TFRC rate-control parameters.
    /// TFRC 速率控制参数。
    pub tfrc: TfrcConfig,

    /// Freeze-TFRC parameters.
    /// Freeze-TFRC 参数。
    pub freeze: FreezeConfig,

    /// Parameters of the window-based freeze variant.
    /// 基于窗口的冻结变体参数。
    pub window: WindowFreezeConfig,
}

/// TFRC rate-control parameters (RFC 3448, RFC 4342).
///
/// TFRC 速率控制参数。
#[derive(Debug, Clone)]
pub struct TfrcConfig {
    /// The nominal packet size `s` in bytes.
    /// 名义包大小 `s`（字节）。
    pub packet_size: usize,
    /// The no-feedback timeout used before any feedback arrives (RFC 3448 4.2).
    /// 收到任何反馈之前使用的无反馈超时（RFC 3448 4.2）。
    pub initial_no_feedback_timeout: Duration,
    /// The maximum backoff interval `t_mbi` (RFC 3448 4.3).
    /// 最大退避间隔 `t_mbi`（RFC 3448 4.3）。
    pub t_mbi: Duration,
    /// The RTT assumed before the first sample is taken.
    /// 获得第一个样本之前假定的RTT。
    pub fallback_rtt: Duration,
    /// Lower bound of the no-feedback timeout once feedback has been seen.
    /// 收到反馈后无反馈超时的下限。
    pub min_no_feedback_timeout: Duration,
    /// Weight of the previous estimate in the RTT moving average.
    /// RTT 移动平均中旧估计值的权重。
    pub rtt_ewma_weight: f64,
    /// Half the scheduling granularity of the host (RFC 3448 4.6).
    /// 主机调度粒度的一半（RFC 3448 4.6）。
    pub half_time_granularity: Duration,
}

/// Freeze-TFRC parameters.
///
/// Freeze-TFRC 参数。
#[derive(Debug, Clone)]
pub struct FreezeConfig {
    /// Emit a debug event for every freeze state transition.
    /// 为每次冻结状态转换输出调试事件。
    pub trace_transitions: bool,
    /// How many consecutive outgoing packets repeat a freeze request.
    /// 冻结请求在多少个连续发出的包中重复。
    pub signal_packets: u32,
    /// Variation of the loss event rate that ends probing early.
    /// 使探测阶段提前结束的丢包事件率变化量。
    pub probing_delta_p: f64,
}

/// Parameters of the window-based freeze variant.
///
/// 基于窗口的冻结变体参数。
#[derive(Debug, Clone)]
pub struct WindowFreezeConfig {
    /// Number of zero-window acknowledgements sent on freeze.
    /// 冻结时发送的零窗口确认数量。
    pub freeze_ack_count: u32,
}

impl Default for TfrcConfig {
    fn default() -> Self {
        Self {
            packet_size: 1460,
            initial_no_feedback_timeout: Duration::from_secs(2),
            t_mbi: Duration::from_secs(64),
            fallback_rtt: Duration::from_millis(200),
            min_no_feedback_timeout: Duration::from_secs(1),
            rtt_ewma_weight: 0.9,
            half_time_granularity: Duration::from_micros(500),
        }
    }
}

impl Default for FreezeConfig {
    fn default() -> Self {
        Self {
            trace_transitions: false,
            signal_packets: 3,
            probing_delta_p: 0.1,
        }
    }
}

impl Default for WindowFreezeConfig {
    fn default() -> Self {
        Self {
            freeze_ack_count: 2,
        }
    }
}
