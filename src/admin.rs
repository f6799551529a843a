//! 全局冻结管理控制
//! Global freeze administrative control
//!
//! A single integer knob. Writing a value different from the stored one thaws
//! every frozen window connection and releases the registry.

use crate::freeze::FrozenRegistry;
use std::sync::{Arc, Mutex, PoisonError};
use tracing::info;

/// The administrative freeze control over one [`FrozenRegistry`].
///
/// 作用于一个 [`FrozenRegistry`] 的冻结管理控制。
#[derive(Debug)]
pub struct FreezeControl {
    value: Mutex<i32>,
    registry: Arc<FrozenRegistry>,
}

impl FreezeControl {
    pub fn new(registry: Arc<FrozenRegistry>) -> Self {
        Self {
            value: Mutex::new(0),
            registry,
        }
    }

    /// The last value written.
    pub fn get(&self) -> i32 {
        *self.value.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Stores `value`. A change unfreezes every registered connection and
    /// clears the registry; returns the number of connections unfrozen.
    ///
    /// 保存 `value`。值发生变化时解冻所有已注册的连接并清空注册表。
    pub fn set(&self, value: i32) -> usize {
        let mut current = self.value.lock().unwrap_or_else(PoisonError::into_inner);
        if *current == value {
            return 0;
        }
        *current = value;
        drop(current);

        let thawed = self.registry.unfreeze_all();
        let released = self.registry.clear();
        info!(value, thawed, released, "Global freeze control changed");
        thawed
    }
}
