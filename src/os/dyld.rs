//! dyld-backed [`ImageLoader`].

use super::ProtFlags;
use crate::{
    AddImageHook, ImageEnumerator, ImageLoader, LoadedImage, RebindRegistry, Rebinding, Result,
    loader::apply_to_one_image, registry::try_box,
};
use core::{
    ffi::c_void,
    ptr::{NonNull, null_mut},
    sync::atomic::{AtomicPtr, Ordering},
};

unsafe extern "C" {
    fn _dyld_image_count() -> u32;
    fn _dyld_get_image_header(image_index: u32) -> *const c_void;
    fn _dyld_get_image_vmaddr_slide(image_index: u32) -> isize;
    fn _dyld_register_func_for_add_image(func: extern "C" fn(*const c_void, isize));
}

/// Registry used by [`rebind_symbols`].
pub static GLOBAL_REGISTRY: RebindRegistry = RebindRegistry::new();

static GLOBAL_ENUMERATOR: ImageEnumerator<Dyld> = ImageEnumerator::new(&GLOBAL_REGISTRY, &Dyld);

struct HookNode {
    hook: &'static dyn AddImageHook,
    next: *mut HookNode,
}

/// Every hook ever registered through [`Dyld`], newest first. Never shrinks.
static HOOKS: AtomicPtr<HookNode> = AtomicPtr::new(null_mut());

extern "C" fn add_image(header: *const c_void, slide: isize) {
    let Some(header) = NonNull::new(header as *mut u8) else {
        return;
    };
    let image = LoadedImage::new(header, slide);
    let mut cur = HOOKS.load(Ordering::Acquire);
    while let Some(node) = unsafe { cur.as_ref() } {
        node.hook.image_added(image);
        cur = node.next;
    }
}

/// The dynamic loader of the running process.
#[derive(Debug, Clone, Copy, Default)]
pub struct Dyld;

impl ImageLoader for Dyld {
    fn image_count(&self) -> u32 {
        unsafe { _dyld_image_count() }
    }

    fn image(&self, index: u32) -> Option<LoadedImage> {
        let header = NonNull::new(unsafe { _dyld_get_image_header(index) } as *mut u8)?;
        let slide = unsafe { _dyld_get_image_vmaddr_slide(index) };
        Some(LoadedImage::new(header, slide))
    }

    fn contains(&self, addr: *const u8) -> bool {
        let mut info: libc::Dl_info = unsafe { core::mem::zeroed() };
        unsafe { libc::dladdr(addr as *const c_void, &mut info) != 0 }
    }

    /// dyld keeps its callbacks forever and offers no context argument, so one
    /// trampoline is registered on first use and fans out to every hook. A hook
    /// added after that is replayed here over the images already mapped, which
    /// is what dyld does for the first one.
    fn on_image_added(&self, hook: &'static dyn AddImageHook) -> Result<()> {
        let node = alloc::boxed::Box::into_raw(try_box(HookNode {
            hook,
            next: null_mut(),
        })?);
        let mut head = HOOKS.load(Ordering::Acquire);
        loop {
            unsafe { (*node).next = head };
            match HOOKS.compare_exchange_weak(head, node, Ordering::AcqRel, Ordering::Acquire) {
                Ok(_) => break,
                Err(current) => head = current,
            }
        }
        if head.is_null() {
            unsafe { _dyld_register_func_for_add_image(add_image) };
        } else {
            self.images().for_each(|image| hook.image_added(image));
        }
        Ok(())
    }

    unsafe fn mprotect(&self, addr: usize, len: usize, prot: ProtFlags) -> Result<()> {
        unsafe { super::mprotect(addr, len, prot) }
    }
}

/// Rebinds symbols in every image of the process, now and in the future.
///
/// Batches accumulate in [`GLOBAL_REGISTRY`]; a later call applies the
/// enlarged registry to the images already loaded.
///
/// # Examples
/// ```no_run
/// use core::sync::atomic::{AtomicPtr, Ordering};
/// use macho_rebind::{Rebinding, rebind_symbols};
///
/// static ORIGINAL_CLOSE: AtomicPtr<()> = AtomicPtr::new(core::ptr::null_mut());
///
/// extern "C" fn my_close(fd: i32) -> i32 {
///     let original: extern "C" fn(i32) -> i32 =
///         unsafe { core::mem::transmute(ORIGINAL_CLOSE.load(Ordering::Acquire)) };
///     original(fd)
/// }
///
/// unsafe {
///     rebind_symbols(&[
///         Rebinding::new("close", my_close as *const ()).capture_original(&ORIGINAL_CLOSE),
///     ])
/// }
/// .unwrap();
/// ```
///
/// # Safety
/// See [`ImageEnumerator::apply_globally`].
pub unsafe fn rebind_symbols(rebindings: &[Rebinding]) -> Result<()> {
    unsafe { GLOBAL_ENUMERATOR.apply_globally(rebindings) }
}

/// Rebinds symbols in the single image at `header`, without recording them.
///
/// # Safety
/// See [`ImageEnumerator::apply_globally`].
pub unsafe fn rebind_symbols_image(
    header: NonNull<u8>,
    slide: isize,
    rebindings: &[Rebinding],
) -> Result<()> {
    unsafe { apply_to_one_image(&Dyld, LoadedImage::new(header, slide), rebindings) }
}
