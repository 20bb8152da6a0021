//! Shared helpers.

mod format;
mod mime;

pub use format::format_size;
pub use mime::{extension_to_mime, mime_to_extension};
