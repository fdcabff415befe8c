//! Mach-O layout definitions for the host pointer width.
//!
//! Only images whose pointer width matches the running process can be rebound,
//! so every record type here is fixed to the host's 32-bit or 64-bit flavour
//! and to native byte order. The record layouts themselves come from
//! `object::macho`.

use object::{NativeEndian, macho};

pub use object::macho::{
    INDIRECT_SYMBOL_ABS, INDIRECT_SYMBOL_LOCAL, LC_DYSYMTAB, LC_SYMTAB, S_LAZY_SYMBOL_POINTERS,
    S_NON_LAZY_SYMBOL_POINTERS, SECTION_TYPE,
};

cfg_if::cfg_if! {
    if #[cfg(target_pointer_width = "64")]{
        pub type MachHeader = macho::MachHeader64<NativeEndian>;
        pub type SegmentCommand = macho::SegmentCommand64<NativeEndian>;
        pub type Section = macho::Section64<NativeEndian>;
        pub type Nlist = macho::Nlist64<NativeEndian>;
        pub const LC_SEGMENT_ARCH: u32 = macho::LC_SEGMENT_64;
        pub const MH_MAGIC_ARCH: u32 = macho::MH_MAGIC_64;
    }else{
        pub type MachHeader = macho::MachHeader32<NativeEndian>;
        pub type SegmentCommand = macho::SegmentCommand32<NativeEndian>;
        pub type Section = macho::Section32<NativeEndian>;
        pub type Nlist = macho::Nlist32<NativeEndian>;
        pub const LC_SEGMENT_ARCH: u32 = macho::LC_SEGMENT;
        pub const MH_MAGIC_ARCH: u32 = macho::MH_MAGIC;
    }
}

pub type LoadCommandHeader = macho::LoadCommand<NativeEndian>;
pub type SymtabCommand = macho::SymtabCommand<NativeEndian>;
pub type DysymtabCommand = macho::DysymtabCommand<NativeEndian>;
pub type IndirectIndex = object::U32<NativeEndian>;

pub const SEG_LINKEDIT: &[u8] = b"__LINKEDIT";
pub const SEG_DATA: &[u8] = b"__DATA";
pub const SEG_DATA_CONST: &[u8] = b"__DATA_CONST";

pub const MACH_HEADER_SIZE: usize = core::mem::size_of::<MachHeader>();
pub const POINTER_SIZE: usize = core::mem::size_of::<usize>();

/// Indirect-table entries that do not name a symbol table record.
#[inline]
pub fn is_reserved_index(index: u32) -> bool {
    index == INDIRECT_SYMBOL_ABS
        || index == INDIRECT_SYMBOL_LOCAL
        || index == (INDIRECT_SYMBOL_LOCAL | INDIRECT_SYMBOL_ABS)
}

/// Trims a fixed 16-byte segment or section name at its first NUL.
#[inline]
pub fn fixed_name(name: &[u8; 16]) -> &[u8] {
    let len = name.iter().position(|&b| b == 0).unwrap_or(name.len());
    &name[..len]
}
