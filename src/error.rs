//! 定义了库中所有可能的错误类型。
//! Defines all possible error types in the library.

use thiserror::Error;

/// Which half of a connection raised an error.
/// 引发错误的半连接。
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Side {
    /// The sending half (rate-controlled data sender).
    /// 发送方半连接。
    Sender,
    /// The receiving half (feedback generator).
    /// 接收方半连接。
    Receiver,
}

impl std::fmt::Display for Side {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Side::Sender => write!(f, "sender"),
            Side::Receiver => write!(f, "receiver"),
        }
    }
}

/// Failures reported by the external collaborators the rate controller relies on.
/// 速率控制器所依赖的外部协作者报告的失败。
#[derive(Debug, Error)]
pub enum CollaboratorError {
    /// The packet-arrival history rejected an operation.
    /// 包到达历史拒绝了操作。
    #[error("packet history: {0}")]
    PacketHistory(String),

    /// The loss-interval database rejected an operation.
    /// 丢包间隔数据库拒绝了操作。
    #[error("loss interval history: {0}")]
    LossHistory(String),

    /// No tokio runtime is available to drive timers.
    /// 没有可用于驱动定时器的 tokio 运行时。
    #[error("no runtime available to drive timers")]
    TimerUnavailable,

    /// The outbound signal channel was closed.
    /// 出站信令通道已关闭。
    #[error("signal channel closed")]
    ChannelClosed,

    /// An acknowledgement could not be emitted by the window transport.
    /// 窗口传输无法发送确认。
    #[error("acknowledgement could not be sent: {0}")]
    Ack(String),
}

/// The primary error type for the freeze-aware congestion control library.
/// 支持冻结的拥塞控制库的主要错误类型。
#[derive(Debug, Error)]
pub enum Error {
    /// A signal arrived in a state from which the requested transition is not defined.
    /// 信号在未定义所请求转换的状态下到达。
    #[error("{side} received {event} while in {mode} mode")]
    UnexpectedState {
        side: Side,
        mode: &'static str,
        event: &'static str,
    },

    /// A collaborator (history, timer, transport) failed.
    /// 协作者（历史、定时器、传输）失败。
    #[error("collaborator failure: {0}")]
    CollaboratorFailure(#[from] CollaboratorError),

    /// An option carried a value of the wrong length.
    /// 选项携带的值长度错误。
    #[error("invalid option {kind}")]
    InvalidOption { kind: u8 },

    /// An option claims more bytes than the buffer holds.
    /// 选项声明的字节数超过缓冲区内容。
    #[error("truncated option {kind}")]
    TruncatedOption { kind: u8 },

    /// A socket option was set to a value it does not understand.
    /// 套接字选项被设置为无法识别的值。
    #[error("unsupported option value {0}")]
    InvalidOptionValue(u32),

    /// The half-connection has been terminated.
    /// 半连接已终止。
    #[error("half-connection terminated")]
    Terminated,
}

/// A specialized `Result` type for this library.
/// 本库专用的 `Result` 类型。
pub type Result<T> = std::result::Result<T, Error>;

impl From<Error> for std::io::Error {
    fn from(err: Error) -> Self {
        use std::io::ErrorKind;
        match err {
            Error::UnexpectedState { .. } => std::io::Error::new(ErrorKind::InvalidInput, err),
            Error::CollaboratorFailure(CollaboratorError::ChannelClosed) => {
                ErrorKind::BrokenPipe.into()
            }
            Error::CollaboratorFailure(e) => std::io::Error::other(e),
            Error::InvalidOption { .. } | Error::TruncatedOption { .. } => {
                std::io::Error::new(ErrorKind::InvalidData, err)
            }
            Error::InvalidOptionValue(_) => std::io::Error::new(ErrorKind::InvalidInput, err),
            Error::Terminated => ErrorKind::NotConnected.into(),
        }
    }
}
