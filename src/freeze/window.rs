//! 基于窗口的传输的冻结
//! Freeze for a window-based transport
//!
//! A single frozen bit per connection. Freezing advertises a zero window so
//! the peer neither times out nor shrinks its window; unfreezing advertises
//! the window again. Frozen connections are tracked in a [`FrozenRegistry`]
//! so that an administrator can thaw all of them at once.
//!
//! Locking: a connection's state lock is always taken before the registry
//! lock, and [`FrozenRegistry::unfreeze_all`] never holds the registry lock
//! while it touches a connection.

use super::Transition;
use crate::config::WindowFreezeConfig;
use crate::connection::ConnectionId;
use crate::error::Result;
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use tracing::{debug, info, warn};

/// 窗口确认的类型
/// Kind of window acknowledgement
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AckKind {
    /// Advertises a zero receive window.
    ZeroWindow,
    /// Advertises the current receive window again.
    WindowUpdate,
}

/// Emits acknowledgements on behalf of a window-based connection.
///
/// 代表基于窗口的连接发送确认。
pub trait AckSink: Send + Sync + 'static {
    fn send_ack(&self, connection: ConnectionId, kind: AckKind) -> Result<()>;
}

/// The frozen bit and the connection's place in the registry.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FreezeWindowState {
    pub frozen: bool,
    pub registry_key: Option<RegistryKey>,
}

/// A window-based connection that can be frozen.
///
/// 可以被冻结的基于窗口的连接。
pub struct WindowConnection {
    id: ConnectionId,
    state: Mutex<FreezeWindowState>,
    acks: Arc<dyn AckSink>,
    registry: Arc<FrozenRegistry>,
    ack_count: u32,
}

impl fmt::Debug for WindowConnection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WindowConnection")
            .field("id", &self.id)
            .field("state", &*self.lock_state())
            .finish()
    }
}

impl WindowConnection {
    pub fn new(
        id: ConnectionId,
        config: &WindowFreezeConfig,
        acks: Arc<dyn AckSink>,
        registry: Arc<FrozenRegistry>,
    ) -> Arc<Self> {
        Arc::new(Self {
            id,
            state: Mutex::new(FreezeWindowState::default()),
            acks,
            registry,
            ack_count: config.freeze_ack_count,
        })
    }

    pub fn id(&self) -> ConnectionId {
        self.id
    }

    pub fn is_frozen(&self) -> bool {
        self.lock_state().frozen
    }

    pub fn state(&self) -> FreezeWindowState {
        *self.lock_state()
    }

    fn lock_state(&self) -> MutexGuard<'_, FreezeWindowState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Freezes or thaws the connection. Reaching the state it is already in
    /// changes nothing and sends nothing.
    ///
    /// 冻结或解冻连接。已处于目标状态时不做任何事。
    pub fn set_frozen(self: &Arc<Self>, frozen: bool) -> Result<Transition> {
        let mut state = self.lock_state();
        if state.frozen == frozen {
            return Ok(Transition::AlreadyInTargetState);
        }

        if frozen {
            // Only the first zero-window ack decides the outcome; the rest
            // are repetitions of it.
            if self.ack_count > 0 {
                self.acks.send_ack(self.id, AckKind::ZeroWindow)?;
            }
            for _ in 1..self.ack_count {
                if let Err(error) = self.acks.send_ack(self.id, AckKind::ZeroWindow) {
                    warn!(connection = self.id, %error, "Repeated zero-window ack failed");
                }
            }
            let key = self.registry.insert(self.id, Arc::downgrade(self));
            state.frozen = true;
            state.registry_key = Some(key);
            debug!(connection = self.id, "Window connection frozen");
        } else {
            self.acks.send_ack(self.id, AckKind::WindowUpdate)?;
            state.frozen = false;
            if let Some(key) = state.registry_key.take() {
                self.registry.remove(key);
            }
            debug!(connection = self.id, "Window connection unfrozen");
        }
        Ok(Transition::Applied)
    }

    /// Thaws the connection on behalf of the registry, which already dropped
    /// the node under `key`. Does nothing if the connection has since moved on.
    pub(crate) fn release_from_registry(&self, key: RegistryKey) -> bool {
        let mut state = self.lock_state();
        if state.registry_key != Some(key) {
            return false;
        }
        state.registry_key = None;
        state.frozen = false;
        if let Err(error) = self.acks.send_ack(self.id, AckKind::WindowUpdate) {
            warn!(connection = self.id, %error, "Window update after mass unfreeze failed");
        }
        true
    }
}

impl Drop for WindowConnection {
    fn drop(&mut self) {
        let state = self.state.get_mut().unwrap_or_else(PoisonError::into_inner);
        if let Some(key) = state.registry_key.take() {
            self.registry.remove(key);
        }
    }
}

/// Generational index of a registry node.
///
/// 注册表节点的带代数索引。
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct RegistryKey {
    index: usize,
    generation: u64,
}

struct Node {
    connection: ConnectionId,
    handle: Weak<WindowConnection>,
}

struct Slot {
    generation: u64,
    node: Option<Node>,
}

#[derive(Default)]
struct Arena {
    slots: Vec<Slot>,
    free: Vec<usize>,
    len: usize,
    /// No slot below this index is occupied.
    cursor: usize,
}

impl Arena {
    fn take(&mut self, index: usize) -> Option<(RegistryKey, Node)> {
        let slot = self.slots.get_mut(index)?;
        let node = slot.node.take()?;
        let key = RegistryKey {
            index,
            generation: slot.generation,
        };
        slot.generation += 1;
        self.free.push(index);
        self.len -= 1;
        Some((key, node))
    }
}

/// The process-wide set of frozen window connections.
///
/// The registry owns its nodes; each node only holds a weak back-reference
/// to its connection, which is upgraded before use.
///
/// 进程范围内已冻结的窗口连接集合。注册表拥有其节点，节点只持有连接的弱引用。
#[derive(Default)]
pub struct FrozenRegistry {
    inner: Mutex<Arena>,
}

impl fmt::Debug for FrozenRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FrozenRegistry")
            .field("members", &self.members())
            .finish()
    }
}

impl FrozenRegistry {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    fn lock(&self) -> MutexGuard<'_, Arena> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn len(&self) -> usize {
        self.lock().len
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Ids of the registered connections.
    pub fn members(&self) -> Vec<ConnectionId> {
        self.lock()
            .slots
            .iter()
            .filter_map(|slot| slot.node.as_ref().map(|node| node.connection))
            .collect()
    }

    fn insert(&self, connection: ConnectionId, handle: Weak<WindowConnection>) -> RegistryKey {
        let mut arena = self.lock();
        let node = Node { connection, handle };
        arena.len += 1;
        if let Some(index) = arena.free.pop() {
            arena.cursor = arena.cursor.min(index);
            let slot = &mut arena.slots[index];
            slot.node = Some(node);
            return RegistryKey {
                index,
                generation: slot.generation,
            };
        }
        arena.slots.push(Slot {
            generation: 0,
            node: Some(node),
        });
        RegistryKey {
            index: arena.slots.len() - 1,
            generation: 0,
        }
    }

    fn remove(&self, key: RegistryKey) -> bool {
        let mut arena = self.lock();
        let current = arena
            .slots
            .get(key.index)
            .is_some_and(|slot| slot.generation == key.generation && slot.node.is_some());
        current && arena.take(key.index).is_some()
    }

    fn pop(&self) -> Option<(RegistryKey, Node)> {
        let mut arena = self.lock();
        let start = arena.cursor.min(arena.slots.len());
        let found = arena.slots[start..].iter().position(|slot| slot.node.is_some());
        let Some(offset) = found else {
            arena.cursor = arena.slots.len();
            return None;
        };
        let index = start + offset;
        arena.cursor = index + 1;
        arena.take(index)
    }

    /// Thaws every registered connection and returns how many were thawed.
    ///
    /// Nodes are detached one at a time, so stopping after any step leaves
    /// the registry consistent. Connections that were already torn down are
    /// skipped.
    ///
    /// 解冻所有已注册的连接，返回解冻的数量。
    pub fn unfreeze_all(&self) -> usize {
        let mut thawed = 0;
        while let Some((key, node)) = self.pop() {
            match node.handle.upgrade() {
                Some(connection) => {
                    if connection.release_from_registry(key) {
                        thawed += 1;
                    }
                }
                None => debug!(connection = node.connection, "Registry node outlived its connection"),
            }
        }
        if thawed > 0 {
            info!(count = thawed, "Unfroze all window connections");
        }
        thawed
    }

    /// Releases every remaining node without touching the connections.
    /// Returns the number of nodes released.
    ///
    /// 释放所有剩余节点而不触及连接。
    pub fn clear(&self) -> usize {
        let mut arena = self.lock();
        let released = arena.len;
        for index in 0..arena.slots.len() {
            arena.take(index);
        }
        released
    }
}
