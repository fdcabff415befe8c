//! Locating the linkedit tables of one image.

use crate::macho::{IndirectIndex, LoadCommand, MachImage, Nlist, SEG_LINKEDIT, Segment};
use core::{ffi::CStr, slice};
use object::{NativeEndian, pod};

/// The symbol, string and indirect-symbol tables of a loaded image.
pub struct ImageTables<'a> {
    symbols: &'a [Nlist],
    strings: &'a [u8],
    indirect: &'a [IndirectIndex],
}

impl<'a> ImageTables<'a> {
    /// Walks the load commands once and resolves the three tables.
    ///
    /// Returns `None`, without reporting anything, when the image lacks a
    /// `__LINKEDIT` segment, an `LC_SYMTAB` or an `LC_DYSYMTAB` command, or has
    /// no indirect symbols at all. If several `__LINKEDIT` segments are present
    /// the last one is used.
    ///
    /// # Safety
    /// The offsets recorded in the image must describe memory that is mapped for
    /// as long as `'a`, which holds for any image the OS loader has mapped.
    pub unsafe fn locate(image: &MachImage<'a>) -> Option<ImageTables<'a>> {
        let mut linkedit: Option<Segment<'a>> = None;
        let mut symtab = None;
        let mut dysymtab = None;
        for command in image.load_commands() {
            match command {
                LoadCommand::Segment(segment) if segment.name() == SEG_LINKEDIT => {
                    linkedit = Some(segment)
                }
                LoadCommand::Symtab(command) => symtab = Some(command),
                LoadCommand::Dysymtab(command) => dysymtab = Some(command),
                _ => {}
            }
        }
        let (Some(linkedit), Some(symtab), Some(dysymtab)) = (linkedit, symtab, dysymtab) else {
            #[cfg(feature = "log")]
            log::debug!("skip image: missing __LINKEDIT, LC_SYMTAB or LC_DYSYMTAB");
            return None;
        };
        let nindirect = dysymtab.nindirectsyms.get(NativeEndian) as usize;
        if nindirect == 0 {
            #[cfg(feature = "log")]
            log::debug!("skip image: no indirect symbols");
            return None;
        }

        let base = image
            .runtime_addr(linkedit.vmaddr())
            .wrapping_sub(linkedit.fileoff());
        let e = NativeEndian;
        let nsyms = symtab.nsyms.get(e) as usize;
        let symbols = unsafe {
            table::<Nlist>(base.wrapping_add(symtab.symoff.get(e) as usize), nsyms)
        }?;
        let strings = unsafe {
            table::<u8>(
                base.wrapping_add(symtab.stroff.get(e) as usize),
                symtab.strsize.get(e) as usize,
            )
        }?;
        let indirect = unsafe {
            table::<IndirectIndex>(
                base.wrapping_add(dysymtab.indirectsymoff.get(e) as usize),
                nindirect,
            )
        }?;
        #[cfg(feature = "log")]
        log::trace!(
            "[Tables] linkedit base: 0x{:x}, nsyms: {}, strsize: {}, nindirectsyms: {}",
            base,
            nsyms,
            strings.len(),
            nindirect
        );
        Some(ImageTables {
            symbols,
            strings,
            indirect,
        })
    }

    /// Builds tables from slices that are already in hand.
    pub fn from_parts(
        symbols: &'a [Nlist],
        strings: &'a [u8],
        indirect: &'a [IndirectIndex],
    ) -> Self {
        Self {
            symbols,
            strings,
            indirect,
        }
    }

    /// The symbol-table index recorded for indirect entry `entry`, if in range.
    #[inline]
    pub fn indirect_index(&self, entry: usize) -> Option<u32> {
        self.indirect.get(entry).map(|index| index.get(NativeEndian))
    }

    /// The NUL-terminated name of symbol `index`, without the terminator.
    ///
    /// Returns `None` for an out-of-range index or string offset, and for a name
    /// that is not terminated inside the string table.
    pub fn symbol_name(&self, index: u32) -> Option<&'a [u8]> {
        let symbol = self.symbols.get(index as usize)?;
        let strx = symbol.n_strx.get(NativeEndian) as usize;
        let bytes = self.strings.get(strx..)?;
        CStr::from_bytes_until_nul(bytes).ok().map(CStr::to_bytes)
    }

    #[inline]
    pub fn indirect_len(&self) -> usize {
        self.indirect.len()
    }
}

unsafe fn table<'a, T: pod::Pod>(addr: usize, count: usize) -> Option<&'a [T]> {
    let len = count.checked_mul(core::mem::size_of::<T>())?;
    if len == 0 {
        return Some(&[]);
    }
    let bytes = unsafe { slice::from_raw_parts(addr as *const u8, len) };
    pod::slice_from_bytes(bytes, count).ok().map(|(table, _)| table)
}
