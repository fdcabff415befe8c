//! Rewriting the symbol-pointer sections of one image.

use crate::{
    ImageLoader, LoadedImage, RebindRegistry,
    macho::{
        MachImage, POINTER_SIZE, S_LAZY_SYMBOL_POINTERS, S_NON_LAZY_SYMBOL_POINTERS, SECTION_TYPE,
        SEG_DATA, SEG_DATA_CONST, Section, fixed_name, is_reserved_index,
    },
    os::ProtFlags,
    scanner::ImageTables,
};
use object::NativeEndian;

/// A lazy or non-lazy symbol-pointer section of a writable data segment.
#[derive(Clone, Copy)]
pub struct PointerSection<'a> {
    section: &'a Section,
    read_only: bool,
}

impl<'a> PointerSection<'a> {
    #[inline]
    pub fn name(&self) -> &'a [u8] {
        fixed_name(&self.section.sectname)
    }

    /// Whether the section lives in `__DATA_CONST`, which the loader remaps
    /// read-only once binding is done.
    #[inline]
    pub fn is_read_only(&self) -> bool {
        self.read_only
    }

    #[inline]
    pub fn addr(&self) -> usize {
        self.section.addr.get(NativeEndian) as usize
    }

    #[inline]
    pub fn size(&self) -> usize {
        self.section.size.get(NativeEndian) as usize
    }

    /// Index of the section's first slot in the indirect-symbol table.
    #[inline]
    pub fn indirect_start(&self) -> usize {
        self.section.reserved1.get(NativeEndian) as usize
    }

    /// Number of whole pointer slots; a trailing partial slot is ignored.
    #[inline]
    pub fn slot_count(&self) -> usize {
        self.size() / POINTER_SIZE
    }
}

/// Iterates over every symbol-pointer section of `__DATA` and `__DATA_CONST`.
pub fn pointer_sections<'a>(
    image: &MachImage<'a>,
) -> impl Iterator<Item = PointerSection<'a>> + use<'a> {
    image
        .segments()
        .filter(|segment| segment.name() == SEG_DATA || segment.name() == SEG_DATA_CONST)
        .flat_map(|segment| {
            let read_only = segment.name() == SEG_DATA_CONST;
            segment.sections().iter().filter_map(move |section| {
                let kind = section.flags.get(NativeEndian) & SECTION_TYPE;
                (kind == S_LAZY_SYMBOL_POINTERS || kind == S_NON_LAZY_SYMBOL_POINTERS)
                    .then_some(PointerSection { section, read_only })
            })
        })
}

/// The mapped pointer slots of one section.
struct SlotTable {
    base: *mut *const (),
    len: usize,
}

impl SlotTable {
    #[inline]
    unsafe fn get(&self, idx: usize) -> *const () {
        debug_assert!(idx < self.len);
        unsafe { self.base.add(idx).read_unaligned() }
    }

    #[inline]
    unsafe fn set(&self, idx: usize, value: *const ()) {
        debug_assert!(idx < self.len);
        unsafe { self.base.add(idx).write_unaligned(value) }
    }
}

/// Rewrites every slot of `section` whose symbol is named in `registry`.
///
/// A read-only section is made writable before its first matching slot and
/// put back to read-only afterwards. No protection is queried: `__DATA_CONST`
/// is always read-only by the time an image is reported as loaded. A failure
/// to restore the protection is logged and leaves the slots patched.
///
/// Returns the number of slots written.
///
/// # Safety
/// The section must belong to the image `tables` were located in, and that
/// image must be mapped. Replacement addresses are installed as-is.
pub unsafe fn patch_section<L: ImageLoader + ?Sized>(
    registry: &RebindRegistry,
    loader: &L,
    image: &MachImage<'_>,
    tables: &ImageTables<'_>,
    section: &PointerSection<'_>,
) -> usize {
    let start = image.runtime_addr(section.addr());
    let slots = SlotTable {
        base: start as *mut *const (),
        len: section.slot_count(),
    };
    let first = section.indirect_start();
    let mut unprotected = false;
    let mut patched = 0;

    for idx in 0..slots.len {
        let Some(index) = first.checked_add(idx).and_then(|entry| tables.indirect_index(entry))
        else {
            break;
        };
        if is_reserved_index(index) {
            continue;
        }
        let Some(symbol) = tables.symbol_name(index) else {
            continue;
        };
        let Some(rebinding) = registry.find(symbol) else {
            continue;
        };

        if section.is_read_only() && !unprotected {
            let res = unsafe {
                loader.mprotect(
                    start,
                    section.size(),
                    ProtFlags::PROT_READ | ProtFlags::PROT_WRITE,
                )
            };
            if let Err(_err) = res {
                #[cfg(feature = "log")]
                log::debug!(
                    "skip section [{}]: {}",
                    core::str::from_utf8(section.name()).unwrap_or("?"),
                    _err
                );
                return patched;
            }
            unprotected = true;
        }

        let current = unsafe { slots.get(idx) };
        rebinding.capture(current);
        unsafe { slots.set(idx, rebinding.replacement()) };
        patched += 1;
        #[cfg(feature = "log")]
        log::trace!(
            "rebinding slot [0x{:x}]: symbol [{}] 0x{:x} -> 0x{:x}",
            start + idx * POINTER_SIZE,
            rebinding.name(),
            current as usize,
            rebinding.replacement() as usize
        );
    }

    // dyld maps `__DATA_CONST` read-only once binding is done, and that is
    // the only state this section can have been found in.
    if unprotected {
        let res = unsafe { loader.mprotect(start, section.size(), ProtFlags::PROT_READ) };
        if let Err(_err) = res {
            #[cfg(feature = "log")]
            log::debug!(
                "section [{}] left writable: {}",
                core::str::from_utf8(section.name()).unwrap_or("?"),
                _err
            );
        }
    }
    patched
}

/// Scans one image and rewrites its matching slots against `registry`.
///
/// Images that the loader does not recognise, that were built for another
/// pointer width, or that lack the linkedit tables are skipped silently.
/// Returns the number of slots written.
///
/// # Safety
/// `image` must describe an image the loader currently has mapped, and no other
/// thread may be reading the slots being rewritten.
pub unsafe fn patch_image<L: ImageLoader + ?Sized>(
    registry: &RebindRegistry,
    loader: &L,
    image: LoadedImage,
) -> usize {
    if registry.is_empty() {
        return 0;
    }
    if !loader.contains(image.header().as_ptr()) {
        #[cfg(feature = "log")]
        log::debug!(
            "skip image [0x{:x}]: not a mapped image",
            image.header().as_ptr() as usize
        );
        return 0;
    }
    let Some(view) = (unsafe { MachImage::from_loaded(image) }) else {
        return 0;
    };
    let Some(tables) = (unsafe { ImageTables::locate(&view) }) else {
        return 0;
    };
    pointer_sections(&view)
        .map(|section| unsafe { patch_section(registry, loader, &view, &tables, &section) })
        .sum()
}
