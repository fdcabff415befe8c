#![allow(dead_code)]

use macho_rebind::{
    AddImageHook, ImageLoader, LoadedImage, Result,
    macho::{
        DysymtabCommand, LC_DYSYMTAB, LC_SEGMENT_ARCH, LC_SYMTAB, MH_MAGIC_ARCH, MachHeader,
        Nlist, S_LAZY_SYMBOL_POINTERS, S_NON_LAZY_SYMBOL_POINTERS, Section, SegmentCommand,
        SymtabCommand,
    },
    allocation_error,
    os::ProtFlags,
    protect_error,
};
use object::{BigEndian, NativeEndian, U32, pod::bytes_of};
use std::{
    mem::size_of,
    ptr::NonNull,
    sync::{
        Mutex,
        atomic::{AtomicBool, AtomicUsize, Ordering},
    },
};

pub const PTR: usize = size_of::<usize>();

pub fn init_log() {
    let _ = env_logger::builder().is_test(true).try_init();
}

/// Address used as a stand-in for a function.
pub fn addr(value: usize) -> *const () {
    value as *const ()
}

/// What an indirect-table entry points at.
#[derive(Clone, Copy)]
pub enum Entry {
    /// A symbol-table record with this exact name (prefix included).
    Symbol(&'static str),
    /// A raw index, for the reserved values and out-of-range indices.
    Raw(u32),
}

struct SectionSpec {
    segment: &'static str,
    name: &'static str,
    kind: u32,
    slots: Vec<(Entry, usize)>,
    trailing: usize,
}

/// Lays out a complete Mach-O image for the host pointer width in one buffer.
///
/// Link-time addresses equal buffer offsets, so the slide of the mapped image is
/// simply the buffer's address.
pub struct ImageBuilder {
    sections: Vec<SectionSpec>,
    symtab: bool,
    dysymtab: bool,
    linkedit: bool,
    force_no_indirect: bool,
}

impl ImageBuilder {
    pub fn new() -> Self {
        Self {
            sections: Vec::new(),
            symtab: true,
            dysymtab: true,
            linkedit: true,
            force_no_indirect: false,
        }
    }

    /// Adds a section holding one pointer slot per `(entry, initial value)`.
    pub fn section(
        mut self,
        segment: &'static str,
        name: &'static str,
        kind: u32,
        slots: &[(Entry, usize)],
    ) -> Self {
        self.sections.push(SectionSpec {
            segment,
            name,
            kind,
            slots: slots.to_vec(),
            trailing: 0,
        });
        self
    }

    pub fn lazy(self, slots: &[(Entry, usize)]) -> Self {
        self.section("__DATA", "__la_symbol_ptr", S_LAZY_SYMBOL_POINTERS, slots)
    }

    pub fn got(self, slots: &[(Entry, usize)]) -> Self {
        self.section("__DATA_CONST", "__got", S_NON_LAZY_SYMBOL_POINTERS, slots)
    }

    /// Appends `bytes` (less than a pointer) to the last section's size.
    pub fn trailing_bytes(mut self, bytes: usize) -> Self {
        self.sections.last_mut().unwrap().trailing = bytes;
        self
    }

    pub fn without_symtab(mut self) -> Self {
        self.symtab = false;
        self
    }

    pub fn without_dysymtab(mut self) -> Self {
        self.dysymtab = false;
        self
    }

    pub fn without_linkedit(mut self) -> Self {
        self.linkedit = false;
        self
    }

    pub fn without_indirect_symbols(mut self) -> Self {
        self.force_no_indirect = true;
        self
    }

    pub fn build(self) -> &'static TestImage {
        let e = NativeEndian;

        // Symbol and string tables.
        let mut names: Vec<&'static str> = Vec::new();
        let mut indirect: Vec<u32> = Vec::new();
        for spec in &self.sections {
            for (entry, _) in &spec.slots {
                indirect.push(match *entry {
                    Entry::Symbol(name) => match names.iter().position(|n| *n == name) {
                        Some(idx) => idx as u32,
                        None => {
                            names.push(name);
                            (names.len() - 1) as u32
                        }
                    },
                    Entry::Raw(raw) => raw,
                });
            }
        }
        let mut strtab = vec![0u8];
        let mut symbols = Vec::new();
        for name in &names {
            let mut nlist: Nlist = unsafe { std::mem::zeroed() };
            nlist.n_strx = U32::new(e, strtab.len() as u32);
            strtab.extend_from_slice(name.as_bytes());
            strtab.push(0);
            symbols.push(nlist);
        }

        // Segments in command order.
        let mut segments: Vec<&'static str> = vec!["__TEXT"];
        for spec in &self.sections {
            if !segments.contains(&spec.segment) {
                segments.push(spec.segment);
            }
        }
        let seg_size = |name: &str| {
            size_of::<SegmentCommand>()
                + self.sections.iter().filter(|s| s.segment == name).count() * size_of::<Section>()
        };
        let mut cmds_size: usize = segments.iter().map(|&s| seg_size(s)).sum();
        if self.linkedit {
            cmds_size += size_of::<SegmentCommand>();
        }
        if self.symtab {
            cmds_size += size_of::<SymtabCommand>();
        }
        if self.dysymtab {
            cmds_size += size_of::<DysymtabCommand>();
        }

        // Data layout after the commands.
        let mut cursor = align(size_of::<MachHeader>() + cmds_size, 16);
        let mut slot_offsets = Vec::new();
        for spec in &self.sections {
            slot_offsets.push(cursor);
            cursor = align(cursor + spec.slots.len() * PTR + spec.trailing, 16);
        }
        let linkedit_off = cursor;
        let symoff = linkedit_off;
        let stroff = align(symoff + symbols.len() * size_of::<Nlist>(), 8);
        let indirectoff = align(stroff + strtab.len(), 8);
        let total = align(indirectoff + indirect.len() * 4, 8);

        let mut bytes = vec![0u8; total];
        let mut put = |offset: usize, data: &[u8]| {
            bytes[offset..offset + data.len()].copy_from_slice(data);
        };

        let mut header: MachHeader = unsafe { std::mem::zeroed() };
        header.magic = U32::new(BigEndian, u32::from_be_bytes(MH_MAGIC_ARCH.to_ne_bytes()));
        let ncmds = segments.len()
            + self.linkedit as usize
            + self.symtab as usize
            + self.dysymtab as usize;
        header.ncmds = U32::new(e, ncmds as u32);
        header.sizeofcmds = U32::new(e, cmds_size as u32);
        put(0, bytes_of(&header));

        let mut off = size_of::<MachHeader>();
        for &segment in &segments {
            let mut command: SegmentCommand = unsafe { std::mem::zeroed() };
            command.cmd = U32::new(e, LC_SEGMENT_ARCH);
            command.cmdsize = U32::new(e, seg_size(segment) as u32);
            command.segname[..segment.len()].copy_from_slice(segment.as_bytes());
            let sections: Vec<_> = self
                .sections
                .iter()
                .enumerate()
                .filter(|(_, s)| s.segment == segment)
                .collect();
            command.nsects = U32::new(e, sections.len() as u32);
            put(off, bytes_of(&command));
            off += size_of::<SegmentCommand>();
            for (idx, spec) in sections {
                let mut section: Section = unsafe { std::mem::zeroed() };
                section.sectname[..spec.name.len()].copy_from_slice(spec.name.as_bytes());
                section.segname[..segment.len()].copy_from_slice(segment.as_bytes());
                section.addr = to_addr(slot_offsets[idx]);
                section.size = to_addr(spec.slots.len() * PTR + spec.trailing);
                section.flags = U32::new(e, spec.kind);
                let before: usize = self.sections[..idx].iter().map(|s| s.slots.len()).sum();
                section.reserved1 = U32::new(e, before as u32);
                put(off, bytes_of(&section));
                off += size_of::<Section>();
            }
        }

        if self.linkedit {
            let mut command: SegmentCommand = unsafe { std::mem::zeroed() };
            command.cmd = U32::new(e, LC_SEGMENT_ARCH);
            command.cmdsize = U32::new(e, size_of::<SegmentCommand>() as u32);
            command.segname[..10].copy_from_slice(b"__LINKEDIT");
            command.vmaddr = to_addr(linkedit_off);
            command.fileoff = to_addr(linkedit_off);
            put(off, bytes_of(&command));
            off += size_of::<SegmentCommand>();
        }
        if self.symtab {
            let mut command: SymtabCommand = unsafe { std::mem::zeroed() };
            command.cmd = U32::new(e, LC_SYMTAB);
            command.cmdsize = U32::new(e, size_of::<SymtabCommand>() as u32);
            command.symoff = U32::new(e, symoff as u32);
            command.nsyms = U32::new(e, symbols.len() as u32);
            command.stroff = U32::new(e, stroff as u32);
            command.strsize = U32::new(e, strtab.len() as u32);
            put(off, bytes_of(&command));
            off += size_of::<SymtabCommand>();
        }
        if self.dysymtab {
            let mut command: DysymtabCommand = unsafe { std::mem::zeroed() };
            command.cmd = U32::new(e, LC_DYSYMTAB);
            command.cmdsize = U32::new(e, size_of::<DysymtabCommand>() as u32);
            command.indirectsymoff = U32::new(e, indirectoff as u32);
            let count = if self.force_no_indirect { 0 } else { indirect.len() };
            command.nindirectsyms = U32::new(e, count as u32);
            put(off, bytes_of(&command));
        }

        for (idx, symbol) in symbols.iter().enumerate() {
            put(symoff + idx * size_of::<Nlist>(), bytes_of(symbol));
        }
        put(stroff, &strtab);
        for (idx, entry) in indirect.iter().enumerate() {
            put(indirectoff + idx * 4, &entry.to_ne_bytes());
        }
        for (spec, offset) in self.sections.iter().zip(&slot_offsets) {
            for (idx, (_, initial)) in spec.slots.iter().enumerate() {
                put(offset + idx * PTR, &initial.to_ne_bytes());
            }
        }

        // u64 words keep every record naturally aligned.
        let mut words = vec![0u64; total / 8].into_boxed_slice();
        unsafe {
            std::ptr::copy_nonoverlapping(bytes.as_ptr(), words.as_mut_ptr() as *mut u8, total)
        };
        let base = Box::into_raw(words) as *mut u8;
        Box::leak(Box::new(TestImage {
            base: NonNull::new(base).unwrap(),
            len: total,
            slot_offsets,
        }))
    }
}

fn align(value: usize, to: usize) -> usize {
    value.div_ceil(to) * to
}

#[cfg(target_pointer_width = "64")]
fn to_addr(value: usize) -> object::U64<NativeEndian> {
    object::U64::new(NativeEndian, value as u64)
}

#[cfg(target_pointer_width = "32")]
fn to_addr(value: usize) -> U32<NativeEndian> {
    U32::new(NativeEndian, value as u32)
}

/// A built image. Leaked: it stays mapped for the rest of the test process.
pub struct TestImage {
    base: NonNull<u8>,
    len: usize,
    slot_offsets: Vec<usize>,
}

unsafe impl Send for TestImage {}
unsafe impl Sync for TestImage {}

impl TestImage {
    pub fn loaded(&self) -> LoadedImage {
        LoadedImage::new(self.base, self.base.as_ptr() as isize)
    }

    pub fn range(&self) -> std::ops::Range<usize> {
        let start = self.base.as_ptr() as usize;
        start..start + self.len
    }

    fn slot_ptr(&self, section: usize, idx: usize) -> *mut usize {
        unsafe { self.base.as_ptr().add(self.slot_offsets[section] + idx * PTR) as *mut usize }
    }

    pub fn slot(&self, section: usize, idx: usize) -> usize {
        unsafe { self.slot_ptr(section, idx).read_volatile() }
    }

    pub fn set_slot(&self, section: usize, idx: usize, value: usize) {
        unsafe { self.slot_ptr(section, idx).write_volatile(value) }
    }

    pub fn section_addr(&self, section: usize) -> usize {
        self.base.as_ptr() as usize + self.slot_offsets[section]
    }

    /// Reads the machine word right after the last whole slot of `section`.
    pub fn word_after(&self, section: usize, slots: usize) -> usize {
        self.slot(section, slots)
    }
}

/// An in-memory loader: images are "mapped" by calling [`FakeLoader::map`].
pub struct FakeLoader {
    images: Mutex<Vec<(LoadedImage, std::ops::Range<usize>, bool)>>,
    hooks: Mutex<Vec<&'static dyn AddImageHook>>,
    protects: Mutex<Vec<(usize, usize, ProtFlags)>>,
    fail_protect: AtomicBool,
    fail_restore: AtomicBool,
    refused_hooks: AtomicUsize,
    hook_attempts: AtomicUsize,
}

impl FakeLoader {
    pub fn new() -> &'static Self {
        Box::leak(Box::new(Self {
            images: Mutex::new(Vec::new()),
            hooks: Mutex::new(Vec::new()),
            protects: Mutex::new(Vec::new()),
            fail_protect: AtomicBool::new(false),
            fail_restore: AtomicBool::new(false),
            refused_hooks: AtomicUsize::new(0),
            hook_attempts: AtomicUsize::new(0),
        }))
    }

    /// Maps `image` and reports it to every registered hook.
    pub fn map(&self, image: &TestImage) {
        self.insert(image, true);
    }

    /// Lists `image` without letting the reverse lookup find it.
    pub fn map_unresolvable(&self, image: &TestImage) {
        self.insert(image, false);
    }

    fn insert(&self, image: &TestImage, resolvable: bool) {
        self.images
            .lock()
            .unwrap()
            .push((image.loaded(), image.range(), resolvable));
        let hooks = self.hooks.lock().unwrap().clone();
        for hook in hooks {
            hook.image_added(image.loaded());
        }
    }

    pub fn hook_count(&self) -> usize {
        self.hooks.lock().unwrap().len()
    }

    pub fn protects(&self) -> Vec<(usize, usize, ProtFlags)> {
        self.protects.lock().unwrap().clone()
    }

    pub fn fail_protect(&self, fail: bool) {
        self.fail_protect.store(fail, Ordering::SeqCst);
    }

    /// Fails only requests that drop write access again.
    pub fn fail_restore(&self, fail: bool) {
        self.fail_restore.store(fail, Ordering::SeqCst);
    }

    /// Makes the next `count` hook registrations fail as if out of memory.
    pub fn refuse_hooks(&self, count: usize) {
        self.refused_hooks.store(count, Ordering::SeqCst);
    }

    pub fn hook_attempts(&self) -> usize {
        self.hook_attempts.load(Ordering::SeqCst)
    }
}

impl ImageLoader for FakeLoader {
    fn image_count(&self) -> u32 {
        self.images.lock().unwrap().len() as u32
    }

    fn image(&self, index: u32) -> Option<LoadedImage> {
        self.images
            .lock()
            .unwrap()
            .get(index as usize)
            .map(|(image, _, _)| *image)
    }

    fn contains(&self, addr: *const u8) -> bool {
        let addr = addr as usize;
        self.images
            .lock()
            .unwrap()
            .iter()
            .any(|(_, range, resolvable)| *resolvable && range.contains(&addr))
    }

    fn on_image_added(&self, hook: &'static dyn AddImageHook) -> Result<()> {
        self.hook_attempts.fetch_add(1, Ordering::SeqCst);
        let refused = self
            .refused_hooks
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1));
        if refused.is_ok() {
            return Err(allocation_error("hook node"));
        }
        self.hooks.lock().unwrap().push(hook);
        let current: Vec<_> = self.images.lock().unwrap().iter().map(|(i, _, _)| *i).collect();
        for image in current {
            hook.image_added(image);
        }
        Ok(())
    }

    unsafe fn mprotect(&self, addr: usize, len: usize, prot: ProtFlags) -> Result<()> {
        if self.fail_protect.load(Ordering::SeqCst) {
            return Err(protect_error("protection change refused"));
        }
        if self.fail_restore.load(Ordering::SeqCst) && !prot.contains(ProtFlags::PROT_WRITE) {
            return Err(protect_error("restore refused"));
        }
        self.protects.lock().unwrap().push((addr, len, prot));
        Ok(())
    }
}
