//! src/dataloader/common/mod.rs
//!
//! Common utilities shared across DataLoader implementations.

pub mod thread;
