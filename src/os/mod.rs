//! Platform seam.
//!
//! Protection changes go through `libc` on unix hosts. The `dyld` backend, which
//! enumerates real loaded images and receives load events, only exists on Apple
//! targets; everywhere else callers bring their own [`ImageLoader`](crate::ImageLoader).

use bitflags::bitflags;
use core::ffi::c_int;

bitflags! {
    #[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
    /// Memory protection flags for pointer sections.
    ///
    /// The values match the POSIX `PROT_*` constants.
    pub struct ProtFlags: c_int {
        /// No access allowed.
        const PROT_NONE = 0;

        /// Allow reading from the memory region.
        const PROT_READ = 1;

        /// Allow writing to the memory region.
        const PROT_WRITE = 2;

        /// Allow executing code in the memory region.
        const PROT_EXEC = 4;
    }
}

cfg_if::cfg_if! {
    if #[cfg(unix)] {
        pub(crate) mod unix;
        pub use unix::mprotect;
    } else {
        pub(crate) mod baremetal;
        pub use baremetal::mprotect;
    }
}

cfg_if::cfg_if! {
    if #[cfg(target_vendor = "apple")] {
        pub(crate) mod dyld;
        pub use dyld::{Dyld, GLOBAL_REGISTRY, rebind_symbols, rebind_symbols_image};
    }
}
