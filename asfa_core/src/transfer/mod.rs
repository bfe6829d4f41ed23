//! Local copy/move engine.
//!
//! This module provides:
//! - [`TransferJob`], a single file copy or move run by the transfers queue
//! - chunked copying with progress, cooperative cancellation and duplicate
//!   detection
//! - rename for moves that stay on one filesystem
//! - folder planning for recursive transfers

pub mod constants;
pub mod folder;
pub mod fs_ops;
mod job;

// Re-export public API
pub use constants::BUFFER_SIZE;
pub use folder::{FolderEntry, plan_folder};
pub use job::{TransferError, TransferJob};
