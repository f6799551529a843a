//! 定义 TFRC/Freeze-TFRC 选项及其编解码。
//! Defines the TFRC / Freeze-TFRC options and their codec.
//!
//! Options use the DCCP layout: one type byte, one length byte that counts the
//! two header bytes, then the value. Types below 32 are single-byte options and
//! carry no length.

use crate::error::{Error, Result};
use crate::signal::SignalKind;
use crate::tfrc::FeedbackReport;
use bytes::{Buf, BufMut};
use std::fmt;

/// Freeze sequence numbers are carried as 48-bit values.
/// 冻结序列号以48位值传输。
const SEQNO_LEN: usize = 6;

/// Types at or below this value have no length byte.
const SINGLE_BYTE_LIMIT: u8 = 31;

/// The type of an option. The first byte on the wire.
/// 选项类型，网络传输的第一个字节。
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum OptionType {
    /// Loss event rate reported by the receiver (RFC 4342 8.5).
    /// 接收方报告的丢包事件率。
    LossEventRate = 192,
    /// Loss intervals (RFC 4342 8.6). Recognised but not interpreted here.
    /// 丢包间隔。此处只识别不解析。
    LossIntervals = 193,
    /// Receive rate reported by the receiver (RFC 4342 8.3).
    /// 接收方报告的接收速率。
    ReceiveRate = 194,
    /// Receiver asks the sender to freeze.
    /// 接收方请求发送方冻结。
    Freeze = 246,
    /// Receiver asks the sender to unfreeze.
    /// 接收方请求发送方解冻。
    Unfreeze = 247,
    /// Receiver finished its restoration phase.
    /// 接收方完成了恢复阶段。
    Unfrozen = 248,
    /// Sender restored its pre-freeze rate.
    /// 发送方恢复了冻结前的速率。
    Restoring = 249,
    /// Sender is probing the restored rate.
    /// 发送方正在探测恢复的速率。
    Probing = 250,
}

impl OptionType {
    /// 从一个字节尝试转换成 `OptionType`。
    /// Tries to convert a byte into an `OptionType`.
    pub fn from_u8(byte: u8) -> Option<Self> {
        match byte {
            192 => Some(OptionType::LossEventRate),
            193 => Some(OptionType::LossIntervals),
            194 => Some(OptionType::ReceiveRate),
            246 => Some(OptionType::Freeze),
            247 => Some(OptionType::Unfreeze),
            248 => Some(OptionType::Unfrozen),
            249 => Some(OptionType::Restoring),
            250 => Some(OptionType::Probing),
            _ => None,
        }
    }

    /// The freeze signal this option carries, if any.
    /// 该选项携带的冻结信号（如果有）。
    pub fn signal_kind(&self) -> Option<SignalKind> {
        match self {
            OptionType::Freeze => Some(SignalKind::Freeze),
            OptionType::Unfreeze => Some(SignalKind::Unfreeze),
            OptionType::Unfrozen => Some(SignalKind::Unfrozen),
            OptionType::Restoring => Some(SignalKind::Restoring),
            OptionType::Probing => Some(SignalKind::Probing),
            _ => None,
        }
    }
}

impl From<SignalKind> for OptionType {
    fn from(kind: SignalKind) -> Self {
        match kind {
            SignalKind::Freeze => OptionType::Freeze,
            SignalKind::Unfreeze => OptionType::Unfreeze,
            SignalKind::Unfrozen => OptionType::Unfrozen,
            SignalKind::Restoring => OptionType::Restoring,
            SignalKind::Probing => OptionType::Probing,
        }
    }
}

impl fmt::Display for OptionType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            OptionType::LossEventRate => "LOSS_EVENT_RATE",
            OptionType::LossIntervals => "LOSS_INTERVALS",
            OptionType::ReceiveRate => "RECEIVE_RATE",
            OptionType::Freeze => "FREEZE",
            OptionType::Unfreeze => "UNFREEZE",
            OptionType::Unfrozen => "UNFROZEN",
            OptionType::Restoring => "RESTORING",
            OptionType::Probing => "PROBING",
        };
        write!(f, "{}", s)
    }
}

/// A freeze indication: which signal and the sequence number it belongs to.
/// 冻结指示：信号类型及其所属的序列号。
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FreezeIndication {
    pub kind: SignalKind,
    pub seqno: u64,
}

/// A decoded option understood by the rate controller.
/// 速率控制器可理解的已解码选项。
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TfrcOption {
    /// Loss event rate, scaled by 1e6.
    LossEventRate(u32),
    /// Receive rate in bytes per second.
    ReceiveRate(u32),
    Freeze(FreezeIndication),
}

impl TfrcOption {
    fn option_type(&self) -> OptionType {
        match self {
            TfrcOption::LossEventRate(_) => OptionType::LossEventRate,
            TfrcOption::ReceiveRate(_) => OptionType::ReceiveRate,
            TfrcOption::Freeze(indication) => indication.kind.into(),
        }
    }

    /// The number of bytes this option occupies on the wire.
    /// 该选项在线路上占用的字节数。
    pub fn encoded_len(&self) -> usize {
        2 + match self {
            TfrcOption::LossEventRate(_) | TfrcOption::ReceiveRate(_) => 4,
            TfrcOption::Freeze(_) => SEQNO_LEN,
        }
    }

    /// 将选项编码到缓冲区。
    /// Encodes the option into a buffer.
    pub fn encode<B: BufMut>(&self, buf: &mut B) {
        buf.put_u8(self.option_type() as u8);
        buf.put_u8(self.encoded_len() as u8);
        match self {
            TfrcOption::LossEventRate(value) | TfrcOption::ReceiveRate(value) => {
                buf.put_u32(*value)
            }
            TfrcOption::Freeze(indication) => buf.put_uint(indication.seqno, SEQNO_LEN),
        }
    }

    /// Decodes every option in `buf`. Unknown and padding options are skipped.
    ///
    /// 解码 `buf` 中的所有选项。未知选项和填充选项会被跳过。
    pub fn decode_all<B: Buf>(buf: &mut B) -> Result<Vec<TfrcOption>> {
        let mut options = Vec::new();
        while buf.has_remaining() {
            let kind = buf.get_u8();
            if kind <= SINGLE_BYTE_LIMIT {
                continue;
            }
            if !buf.has_remaining() {
                return Err(Error::TruncatedOption { kind });
            }
            let len = buf.get_u8() as usize;
            if len < 2 {
                return Err(Error::InvalidOption { kind });
            }
            let value_len = len - 2;
            if buf.remaining() < value_len {
                return Err(Error::TruncatedOption { kind });
            }
            let mut value = buf.copy_to_bytes(value_len);

            let Some(option_type) = OptionType::from_u8(kind) else {
                continue;
            };
            let option = match option_type {
                OptionType::LossEventRate | OptionType::ReceiveRate => {
                    if value_len != 4 {
                        return Err(Error::InvalidOption { kind });
                    }
                    let v = value.get_u32();
                    if option_type == OptionType::LossEventRate {
                        TfrcOption::LossEventRate(v)
                    } else {
                        TfrcOption::ReceiveRate(v)
                    }
                }
                OptionType::LossIntervals => continue,
                _ => {
                    if value_len != SEQNO_LEN {
                        return Err(Error::InvalidOption { kind });
                    }
                    let Some(signal) = option_type.signal_kind() else {
                        continue;
                    };
                    TfrcOption::Freeze(FreezeIndication {
                        kind: signal,
                        seqno: value.get_uint(SEQNO_LEN),
                    })
                }
            };
            options.push(option);
        }
        Ok(options)
    }
}

impl FeedbackReport {
    /// Writes the report as a sequence of options.
    /// 将反馈报告写为一系列选项。
    pub fn encode<B: BufMut>(&self, buf: &mut B) {
        TfrcOption::LossEventRate(self.loss_event_rate).encode(buf);
        TfrcOption::ReceiveRate(self.x_recv).encode(buf);
        if let Some(indication) = self.freeze {
            TfrcOption::Freeze(indication).encode(buf);
        }
    }

    /// Rebuilds a report from the options of a feedback packet. Missing
    /// rate options read as zero.
    ///
    /// 从反馈包的选项重建报告。缺失的速率选项视为零。
    pub fn decode<B: Buf>(buf: &mut B) -> Result<Self> {
        let mut report = FeedbackReport::default();
        for option in TfrcOption::decode_all(buf)? {
            match option {
                TfrcOption::LossEventRate(p) => report.loss_event_rate = p,
                TfrcOption::ReceiveRate(x) => report.x_recv = x,
                TfrcOption::Freeze(indication) => report.freeze = Some(indication),
            }
        }
        Ok(report)
    }
}
