//! Read-only, bounds-checked views over a loaded Mach-O image.
//!
//! A loaded image is never parsed from a file: the header, the load commands and
//! the linkedit tables are all read in place from the process's own memory. Each
//! record is obtained through `object::pod`, which rejects short or misaligned
//! data, so a corrupt command list ends the walk instead of reading past it.

mod defs;

pub use defs::*;

use crate::LoadedImage;
use core::slice;
use object::{NativeEndian, pod};

/// A loaded image whose header has been validated.
#[derive(Clone, Copy)]
pub struct MachImage<'a> {
    header: &'a MachHeader,
    commands: &'a [u8],
    slide: isize,
}

impl<'a> MachImage<'a> {
    /// Builds a view over the image at `image.header()`.
    ///
    /// Returns `None` when the magic does not match the host's pointer width.
    ///
    /// # Safety
    /// `image.header()` must point at a mapped Mach-O header followed by its
    /// `sizeofcmds` bytes of load commands, and the mapping must outlive `'a`.
    pub unsafe fn from_loaded(image: LoadedImage) -> Option<MachImage<'a>> {
        let base = image.header().as_ptr() as *const u8;
        let magic = u32::from_ne_bytes(unsafe { *(base as *const [u8; 4]) });
        if magic != MH_MAGIC_ARCH {
            #[cfg(feature = "log")]
            log::debug!(
                "skip image [0x{:x}]: magic 0x{:x} does not match the host",
                base as usize,
                magic
            );
            return None;
        }
        let header_bytes = unsafe { slice::from_raw_parts(base, MACH_HEADER_SIZE) };
        let (header, _) = pod::from_bytes::<MachHeader>(header_bytes).ok()?;
        let sizeofcmds = header.sizeofcmds.get(NativeEndian) as usize;
        let commands = unsafe { slice::from_raw_parts(base.add(MACH_HEADER_SIZE), sizeofcmds) };
        Some(MachImage {
            header,
            commands,
            slide: image.slide(),
        })
    }

    /// The load bias applied to every address recorded in the image.
    #[inline]
    pub fn slide(&self) -> isize {
        self.slide
    }

    /// Translates a link-time address into the address it is mapped at.
    #[inline]
    pub fn runtime_addr(&self, vmaddr: usize) -> usize {
        (self.slide as usize).wrapping_add(vmaddr)
    }

    /// Iterates over the load commands in file order.
    #[inline]
    pub fn load_commands(&self) -> LoadCommands<'a> {
        LoadCommands {
            data: self.commands,
            remaining: self.header.ncmds.get(NativeEndian),
        }
    }

    /// Iterates over the segment commands only.
    pub fn segments(&self) -> impl Iterator<Item = Segment<'a>> + use<'a> {
        self.load_commands().filter_map(|cmd| match cmd {
            LoadCommand::Segment(segment) => Some(segment),
            _ => None,
        })
    }
}

/// One decoded load command.
#[derive(Clone, Copy)]
pub enum LoadCommand<'a> {
    Segment(Segment<'a>),
    Symtab(&'a SymtabCommand),
    Dysymtab(&'a DysymtabCommand),
    /// Any command this crate does not look at, with its `cmd` value.
    Other(u32),
}

/// A segment command together with the sections that follow it.
#[derive(Clone, Copy)]
pub struct Segment<'a> {
    command: &'a SegmentCommand,
    sections: &'a [Section],
}

impl<'a> Segment<'a> {
    #[inline]
    pub fn name(&self) -> &'a [u8] {
        fixed_name(&self.command.segname)
    }

    #[inline]
    pub fn vmaddr(&self) -> usize {
        self.command.vmaddr.get(NativeEndian) as usize
    }

    #[inline]
    pub fn fileoff(&self) -> usize {
        self.command.fileoff.get(NativeEndian) as usize
    }

    #[inline]
    pub fn sections(&self) -> &'a [Section] {
        self.sections
    }
}

/// Iterator over the load-command list, stepping by each command's `cmdsize`.
///
/// The walk stops early when a command is truncated, misaligned, or declares a
/// size smaller than its own header.
pub struct LoadCommands<'a> {
    data: &'a [u8],
    remaining: u32,
}

impl<'a> LoadCommands<'a> {
    #[cold]
    fn stop(&mut self) -> Option<LoadCommand<'a>> {
        self.remaining = 0;
        self.data = &[];
        None
    }

    fn decode(cmd: u32, bytes: &'a [u8]) -> Option<LoadCommand<'a>> {
        Some(match cmd {
            LC_SEGMENT_ARCH => {
                let (command, tail) = pod::from_bytes::<SegmentCommand>(bytes).ok()?;
                let nsects = command.nsects.get(NativeEndian) as usize;
                let sections = match pod::slice_from_bytes::<Section>(tail, nsects) {
                    Ok((sections, _)) => sections,
                    Err(()) => &[],
                };
                LoadCommand::Segment(Segment { command, sections })
            }
            LC_SYMTAB => LoadCommand::Symtab(pod::from_bytes::<SymtabCommand>(bytes).ok()?.0),
            LC_DYSYMTAB => {
                LoadCommand::Dysymtab(pod::from_bytes::<DysymtabCommand>(bytes).ok()?.0)
            }
            other => LoadCommand::Other(other),
        })
    }
}

impl<'a> Iterator for LoadCommands<'a> {
    type Item = LoadCommand<'a>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.remaining == 0 {
            return None;
        }
        let Ok((header, _)) = pod::from_bytes::<LoadCommandHeader>(self.data) else {
            return self.stop();
        };
        let cmdsize = header.cmdsize.get(NativeEndian) as usize;
        if cmdsize < core::mem::size_of::<LoadCommandHeader>() || cmdsize > self.data.len() {
            return self.stop();
        }
        let (bytes, rest) = self.data.split_at(cmdsize);
        let Some(command) = Self::decode(header.cmd.get(NativeEndian), bytes) else {
            return self.stop();
        };
        self.data = rest;
        self.remaining -= 1;
        Some(command)
    }
}
