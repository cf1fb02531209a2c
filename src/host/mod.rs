//! 宿主文档边界
//!
//! - `document`: 句柄/标识类型和 [`HostDocument`] 特性
//! - `dispatcher`: 宿主API线程和显式执行上下文
//! - `memory`: 基于快照的内存文档实现

pub mod dispatcher;
pub mod document;
pub mod memory;

pub use dispatcher::{ApiContext, HostApiThread};
pub use document::{CategoryId, ElementHandle, FieldId, HostDocument, HostError, ViewId};
pub use memory::{DocumentSnapshot, InMemoryDocument};
