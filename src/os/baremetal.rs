use super::ProtFlags;
use crate::{Result, protect_error};

/// There is no page protection to change without an OS; every request fails
/// and the affected section is left alone.
///
/// # Safety
/// Kept `unsafe` to match the unix version.
pub unsafe fn mprotect(_addr: usize, _len: usize, _prot: ProtFlags) -> Result<()> {
    Err(protect_error("memory protection is not supported on this target"))
}
