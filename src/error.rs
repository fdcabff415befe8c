use alloc::borrow::Cow;
use core::fmt::Display;

/// Error types used throughout the `macho_rebind` library.
///
/// Most failure conditions met while scanning an image are not errors at all:
/// an image without the required tables, or a symbol that no image imports,
/// is skipped silently. Only the conditions below are reported.
#[derive(Debug)]
pub enum Error {
    /// Memory for a rebinding batch could not be obtained.
    ///
    /// This is the only error the rebinding entry points return to the caller.
    /// When recording the batch fails, nothing was recorded or patched. When
    /// installing the image load hook fails, the batch stays recorded and the
    /// next global rebinding retries the install.
    Allocation {
        /// A descriptive message about the allocation failure.
        msg: Cow<'static, str>,
    },

    /// Changing the protection of a pointer section failed.
    ///
    /// Returned by [`ImageLoader::mprotect`](crate::ImageLoader::mprotect). The patcher
    /// treats it as a reason to skip the affected section and keeps going.
    Protect {
        /// A descriptive message about the protection error.
        msg: Cow<'static, str>,
    },
}

impl Display for Error {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            Error::Allocation { msg } => write!(f, "Allocation error: {msg}"),
            Error::Protect { msg } => write!(f, "Memory protection error: {msg}"),
        }
    }
}

impl core::error::Error for Error {}

/// Creates an allocation error with the specified message.
///
/// Custom [`ImageLoader`](crate::ImageLoader) implementations return it when a
/// hook cannot be registered for lack of memory.
#[cold]
#[inline(never)]
pub fn allocation_error(msg: impl Into<Cow<'static, str>>) -> Error {
    Error::Allocation { msg: msg.into() }
}

/// Creates a memory protection error with the specified message.
///
/// Public so that custom [`ImageLoader`](crate::ImageLoader) implementations can
/// report failures the same way the built-in ones do.
#[cold]
#[inline(never)]
pub fn protect_error(msg: impl Into<Cow<'static, str>>) -> Error {
    Error::Protect { msg: msg.into() }
}
