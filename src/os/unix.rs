use super::ProtFlags;
use crate::{Result, protect_error};

#[inline]
fn page_size() -> usize {
    let size = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
    if size <= 0 { 0x1000 } else { size as usize }
}

/// Changes the protection of every page overlapping `[addr, addr + len)`.
///
/// # Safety
/// The range must belong to a live mapping. Dropping `PROT_WRITE` or `PROT_READ`
/// from memory that other code still uses will fault that code.
pub unsafe fn mprotect(addr: usize, len: usize, prot: ProtFlags) -> Result<()> {
    if len == 0 {
        return Ok(());
    }
    let page = page_size();
    let start = addr & !(page - 1);
    let end = (addr + len + page - 1) & !(page - 1);
    let res = unsafe { libc::mprotect(start as *mut libc::c_void, end - start, prot.bits()) };
    if res != 0 {
        return Err(protect_error("mprotect failed"));
    }
    #[cfg(feature = "log")]
    log::trace!(
        "[Mprotect] address: 0x{:x}, length: {}, prot: {:?}",
        start,
        end - start,
        prot
    );
    Ok(())
}
