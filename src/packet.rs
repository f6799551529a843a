//! The packet module, containing the TFRC option types and their codec.
//! packet 模块，包含 TFRC 选项类型及其编解码。

pub mod option;

pub use option::{FreezeIndication, OptionType, TfrcOption};
