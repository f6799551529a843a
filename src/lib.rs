#![deny(clippy::expect_used, clippy::unwrap_used)]

//! TFRC rate control with the Freeze extension.
//! 带冻结扩展的 TFRC 速率控制。
//!
//! [`tfrc`] holds the sender and receiver rate state, [`freeze`] the freeze
//! state machines layered on top of them, the window-based variant with its
//! registry and the per-connection dispatcher. [`connection`] ties both
//! halves of one connection together.

pub mod admin;
pub mod config;
pub mod connection;
pub mod error;
pub mod freeze;
pub mod packet;
pub mod signal;
pub mod tfrc;
pub mod timer;

#[cfg(test)]
mod testing;
