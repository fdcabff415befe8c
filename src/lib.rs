//! # macho_rebind
//! Rebind dynamically-resolved symbols in the Mach-O images of a running process.
//!
//! Every call an image makes into another image goes through a pointer slot in one
//! of its lazy or non-lazy symbol-pointer sections. The loader fills these slots
//! in; this crate finds the slots whose symbol carries a requested name and
//! overwrites them with a replacement address. Neither the on-disk binaries nor
//! the build need to cooperate.
//!
//! ## Usage
//! On Apple targets [`rebind_symbols`] records a batch in a process-wide registry
//! and applies it to every image that is loaded now or later; [`rebind_symbols_image`]
//! patches one image without recording anything. The same machinery is exposed
//! through [`ImageEnumerator`] and the [`ImageLoader`] trait, so it can be driven
//! over images that some other loader mapped.
//!
//! ## Limits
//! * Calls resolved inside a single image have no slot and cannot be rebound.
//! * A rebinding cannot be undone, and images being unloaded are not tracked.
//! * Only images with the host's pointer width are considered.
#![no_std]
extern crate alloc;

mod error;
mod loader;
pub mod macho;
pub mod os;
mod patcher;
mod rebinding;
mod registry;
mod scanner;

pub use error::*;
pub use loader::{AddImageHook, ImageEnumerator, ImageLoader, LoadedImage, apply_to_one_image};
pub use patcher::{PointerSection, patch_image, patch_section, pointer_sections};
pub use rebinding::Rebinding;
pub use registry::{Batches, RebindBatch, RebindRegistry, Submission};
pub use scanner::ImageTables;

#[cfg(target_vendor = "apple")]
pub use os::{Dyld, GLOBAL_REGISTRY, rebind_symbols, rebind_symbols_image};

/// A type alias for `Result`s returned by `macho_rebind` functions.
pub type Result<T> = core::result::Result<T, Error>;
