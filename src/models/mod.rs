//! Core data model: transient download tasks and persistent cached assets.

mod asset;
mod task;

pub use asset::{AssetCategory, CachedAsset, NewAsset};
pub use task::{Priority, Task, TaskId, TaskStatus};
