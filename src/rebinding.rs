use crate::{Result, allocation_error};
use alloc::{boxed::Box, string::String};
use core::{
    fmt::Debug,
    ptr::null_mut,
    sync::atomic::{AtomicPtr, Ordering},
};

/// A request to redirect every imported reference to one symbol.
///
/// `name` is the symbol as written in source, without the leading underscore the
/// platform adds to every C symbol: a request for `open` matches the pointer slot
/// named `_open`.
///
/// # Examples
/// ```no_run
/// use core::sync::atomic::AtomicPtr;
/// use macho_rebind::Rebinding;
///
/// static ORIGINAL_OPEN: AtomicPtr<()> = AtomicPtr::new(core::ptr::null_mut());
///
/// extern "C" fn my_open() {}
///
/// let rebinding = Rebinding::new("open", my_open as *const ()).capture_original(&ORIGINAL_OPEN);
/// assert_eq!(rebinding.name(), "open");
/// ```
#[derive(Clone)]
pub struct Rebinding {
    name: Box<str>,
    replacement: *const (),
    original: Option<&'static AtomicPtr<()>>,
}

// A rebinding only carries addresses; nothing is dereferenced through them
// except by the patched program itself.
unsafe impl Send for Rebinding {}
unsafe impl Sync for Rebinding {}

impl Rebinding {
    /// Creates a request that points `name` at `replacement`.
    pub fn new(name: &str, replacement: *const ()) -> Self {
        Self {
            name: name.into(),
            replacement,
            original: None,
        }
    }

    /// Asks for the value found in a slot to be stored in `cell` before the
    /// slot is overwritten.
    ///
    /// A slot that already holds the replacement is not captured, so scanning an
    /// image twice leaves the genuine original in `cell`.
    pub fn capture_original(mut self, cell: &'static AtomicPtr<()>) -> Self {
        self.original = Some(cell);
        self
    }

    #[inline]
    pub fn name(&self) -> &str {
        &self.name
    }

    #[inline]
    pub fn replacement(&self) -> *const () {
        self.replacement
    }

    #[inline]
    pub fn original(&self) -> Option<&'static AtomicPtr<()>> {
        self.original
    }

    /// Whether a slot whose symbol-table name is `symbol` is meant by this request.
    ///
    /// The first byte of `symbol` is the platform prefix and is ignored; names of
    /// one byte or less never match.
    #[inline]
    pub fn matches(&self, symbol: &[u8]) -> bool {
        symbol.len() > 1 && &symbol[1..] == self.name.as_bytes()
    }

    /// Records `current` in the capture cell, unless it is already the replacement.
    #[inline]
    pub(crate) fn capture(&self, current: *const ()) {
        if let Some(cell) = self.original {
            if current != self.replacement {
                cell.store(current as *mut (), Ordering::Release);
            }
        }
    }

    /// Clones the request, reporting an allocation failure instead of aborting.
    pub(crate) fn try_clone(&self) -> Result<Self> {
        let mut name = String::new();
        name.try_reserve_exact(self.name.len())
            .map_err(|_| allocation_error("failed to copy a rebinding name"))?;
        name.push_str(&self.name);
        Ok(Self {
            name: name.into_boxed_str(),
            replacement: self.replacement,
            original: self.original,
        })
    }
}

impl Debug for Rebinding {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Rebinding")
            .field("name", &self.name)
            .field("replacement", &self.replacement)
            .field(
                "original",
                &self
                    .original
                    .map(|cell| cell.load(Ordering::Acquire))
                    .unwrap_or(null_mut()),
            )
            .finish()
    }
}
