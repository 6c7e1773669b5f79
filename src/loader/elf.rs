use alloc::vec::Vec;
use bitflags::bitflags;
use core::fmt;

use crate::fs::file::File;
use crate::memory::{is_user_vaddr, PGMASK, PGSIZE};

// ══════════════════════════════════════════════════════════════
//  ELF64 constants
// ══════════════════════════════════════════════════════════════

const ELF_MAGIC: [u8; 4] = [0x7F, b'E', b'L', b'F'];
const ELFCLASS64: u8 = 2;
const ELFDATA2LSB: u8 = 1;
const EV_CURRENT: u8 = 1;
const ET_EXEC: u16 = 2;
const EM_X86_64: u16 = 62;

const PT_LOAD: u32 = 1;
const PT_DYNAMIC: u32 = 2;
const PT_INTERP: u32 = 3;
const PT_SHLIB: u32 = 5;

const EHDR_SIZE: usize = 64;
const PHDR_SIZE: usize = 56;
const PHNUM_MAX: u16 = 1024;

bitflags! {
    #[derive(Debug, Clone, Copy)]
    pub struct SegFlags: u32 {
        const X = 1;
        const W = 2;
        const R = 4;
    }
}

// ══════════════════════════════════════════════════════════════
//  ExecError
// ══════════════════════════════════════════════════════════════

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExecError {
    FileNotFound,
    InvalidFormat,
    UnsupportedArch,
    UnsupportedType,
    BadSegment,
    ReadError,
    MemoryError,
}

impl fmt::Display for ExecError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            ExecError::FileNotFound => write!(f, "File not found"),
            ExecError::InvalidFormat => write!(f, "Invalid ELF format"),
            ExecError::UnsupportedArch => write!(f, "Unsupported architecture"),
            ExecError::UnsupportedType => write!(f, "Unsupported ELF or segment type"),
            ExecError::BadSegment => write!(f, "Malformed loadable segment"),
            ExecError::ReadError => write!(f, "File read error"),
            ExecError::MemoryError => write!(f, "Memory allocation error"),
        }
    }
}

// ══════════════════════════════════════════════════════════════
//  ELF64 structures
// ══════════════════════════════════════════════════════════════

struct Elf64Ehdr {
    e_entry: u64,
    e_phoff: u64,
    e_phentsize: u16,
    e_phnum: u16,
}

impl Elf64Ehdr {
    fn parse(data: &[u8]) -> Result<Self, ExecError> {
        if data.len() < EHDR_SIZE {
            return Err(ExecError::InvalidFormat);
        }
        if data[0..4] != ELF_MAGIC {
            return Err(ExecError::InvalidFormat);
        }
        if data[4] != ELFCLASS64 || data[5] != ELFDATA2LSB || data[6] != EV_CURRENT {
            return Err(ExecError::UnsupportedArch);
        }

        let e_type = u16::from_le_bytes([data[16], data[17]]);
        let e_machine = u16::from_le_bytes([data[18], data[19]]);
        let e_version = u32::from_le_bytes(data[20..24].try_into().unwrap());
        if e_type != ET_EXEC {
            return Err(ExecError::UnsupportedType);
        }
        if e_machine != EM_X86_64 {
            return Err(ExecError::UnsupportedArch);
        }
        if e_version != EV_CURRENT as u32 {
            return Err(ExecError::InvalidFormat);
        }

        let hdr = Elf64Ehdr {
            e_entry: u64::from_le_bytes(data[24..32].try_into().unwrap()),
            e_phoff: u64::from_le_bytes(data[32..40].try_into().unwrap()),
            e_phentsize: u16::from_le_bytes([data[54], data[55]]),
            e_phnum: u16::from_le_bytes([data[56], data[57]]),
        };
        if hdr.e_phentsize as usize != PHDR_SIZE || hdr.e_phnum > PHNUM_MAX {
            return Err(ExecError::InvalidFormat);
        }
        Ok(hdr)
    }
}

struct Elf64Phdr {
    p_type: u32,
    p_flags: SegFlags,
    p_offset: u64,
    p_vaddr: u64,
    p_filesz: u64,
    p_memsz: u64,
}

impl Elf64Phdr {
    fn parse(data: &[u8]) -> Result<Self, ExecError> {
        if data.len() < PHDR_SIZE {
            return Err(ExecError::InvalidFormat);
        }
        Ok(Elf64Phdr {
            p_type: u32::from_le_bytes(data[0..4].try_into().unwrap()),
            p_flags: SegFlags::from_bits_truncate(u32::from_le_bytes(
                data[4..8].try_into().unwrap(),
            )),
            p_offset: u64::from_le_bytes(data[8..16].try_into().unwrap()),
            p_vaddr: u64::from_le_bytes(data[16..24].try_into().unwrap()),
            p_filesz: u64::from_le_bytes(data[32..40].try_into().unwrap()),
            p_memsz: u64::from_le_bytes(data[40..48].try_into().unwrap()),
        })
    }
}

/// A validated PT_LOAD segment.
#[derive(Debug, Clone, PartialEq)]
pub struct Segment {
    pub vaddr: u64,
    pub offset: u64,
    pub filesz: u64,
    pub memsz: u64,
    pub writable: bool,
}

/// Everything the process loader needs from an executable.
#[derive(Debug, Clone, PartialEq)]
pub struct Image {
    pub entry: u64,
    pub segments: Vec<Segment>,
}

/// Whether PHDR describes a sane, loadable user segment.
fn validate_segment(phdr: &Elf64Phdr, file_len: u64) -> bool {
    // p_offset and p_vaddr must have the same page offset.
    if (phdr.p_offset & PGMASK) != (phdr.p_vaddr & PGMASK) {
        return false;
    }
    // p_offset must point within the file.
    if phdr.p_offset > file_len {
        return false;
    }
    // p_memsz must be at least as big as p_filesz, and nonzero.
    if phdr.p_memsz < phdr.p_filesz || phdr.p_memsz == 0 {
        return false;
    }
    // The region must sit inside user space and must not wrap.
    if !is_user_vaddr(phdr.p_vaddr) || !is_user_vaddr(phdr.p_vaddr + phdr.p_memsz) {
        return false;
    }
    if phdr.p_vaddr + phdr.p_memsz < phdr.p_vaddr {
        return false;
    }
    // Mapping page 0 would let null pointers reach mapped memory.
    if phdr.p_vaddr < PGSIZE as u64 {
        return false;
    }
    true
}

/// Parse and validate FILE's headers and enumerate its loadable segments.
/// No segment contents are read here; that happens page by page on first
/// fault.
pub fn read_image(file: &File) -> Result<Image, ExecError> {
    let mut hdr = [0u8; EHDR_SIZE];
    if file.read_at(0, &mut hdr) != EHDR_SIZE {
        return Err(ExecError::InvalidFormat);
    }
    let ehdr = Elf64Ehdr::parse(&hdr)?;

    let file_len = file.length() as u64;
    let mut segments = Vec::new();
    let mut phdr_buf = [0u8; PHDR_SIZE];
    for i in 0..ehdr.e_phnum as u64 {
        let off = ehdr
            .e_phoff
            .checked_add(i * PHDR_SIZE as u64)
            .ok_or(ExecError::InvalidFormat)?;
        if off + PHDR_SIZE as u64 > file_len {
            return Err(ExecError::InvalidFormat);
        }
        if file.read_at(off as usize, &mut phdr_buf) != PHDR_SIZE {
            return Err(ExecError::ReadError);
        }
        let phdr = Elf64Phdr::parse(&phdr_buf)?;
        match phdr.p_type {
            PT_LOAD => {
                if !validate_segment(&phdr, file_len) {
                    return Err(ExecError::BadSegment);
                }
                segments.push(Segment {
                    vaddr: phdr.p_vaddr,
                    offset: phdr.p_offset,
                    filesz: phdr.p_filesz,
                    memsz: phdr.p_memsz,
                    writable: phdr.p_flags.contains(SegFlags::W),
                });
            }
            PT_DYNAMIC | PT_INTERP | PT_SHLIB => return Err(ExecError::UnsupportedType),
            // PT_NULL, PT_NOTE, PT_PHDR, PT_STACK and vendor segments are
            // ignored.
            _ => {}
        }
    }

    Ok(Image {
        entry: ehdr.e_entry,
        segments,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fs::file::Node;

    fn put_u16(buf: &mut [u8], off: usize, v: u16) {
        buf[off..off + 2].copy_from_slice(&v.to_le_bytes());
    }

    fn put_u32(buf: &mut [u8], off: usize, v: u32) {
        buf[off..off + 4].copy_from_slice(&v.to_le_bytes());
    }

    fn put_u64(buf: &mut [u8], off: usize, v: u64) {
        buf[off..off + 8].copy_from_slice(&v.to_le_bytes());
    }

    fn phdr_bytes(p_type: u32, flags: u32, offset: u64, vaddr: u64, filesz: u64, memsz: u64) -> [u8; PHDR_SIZE] {
        let mut p = [0u8; PHDR_SIZE];
        put_u32(&mut p, 0, p_type);
        put_u32(&mut p, 4, flags);
        put_u64(&mut p, 8, offset);
        put_u64(&mut p, 16, vaddr);
        put_u64(&mut p, 32, filesz);
        put_u64(&mut p, 40, memsz);
        p
    }

    fn image_with_phdrs(phdrs: &[[u8; PHDR_SIZE]]) -> File {
        let mut data = alloc::vec![0u8; EHDR_SIZE + phdrs.len() * PHDR_SIZE + PGSIZE];
        data[0..4].copy_from_slice(&ELF_MAGIC);
        data[4] = ELFCLASS64;
        data[5] = ELFDATA2LSB;
        data[6] = EV_CURRENT;
        put_u16(&mut data, 16, ET_EXEC);
        put_u16(&mut data, 18, EM_X86_64);
        put_u32(&mut data, 20, 1);
        put_u64(&mut data, 24, 0x40_0000); // entry
        put_u64(&mut data, 32, EHDR_SIZE as u64); // phoff
        put_u16(&mut data, 54, PHDR_SIZE as u16);
        put_u16(&mut data, 56, phdrs.len() as u16);
        for (i, p) in phdrs.iter().enumerate() {
            let off = EHDR_SIZE + i * PHDR_SIZE;
            data[off..off + PHDR_SIZE].copy_from_slice(p);
        }

        let node = Node::new(0);
        node.lock().data = data;
        File::new(node)
    }

    #[test]
    fn accepts_a_minimal_executable() {
        let f = image_with_phdrs(&[phdr_bytes(PT_LOAD, 5, 0x120, 0x40_0120, 64, 128)]);
        let image = read_image(&f).unwrap();
        assert_eq!(image.entry, 0x40_0000);
        assert_eq!(image.segments.len(), 1);
        assert!(!image.segments[0].writable);
    }

    #[test]
    fn writable_flag_comes_from_pf_w() {
        let f = image_with_phdrs(&[phdr_bytes(PT_LOAD, 6, 0x120, 0x40_0120, 64, 64)]);
        assert!(read_image(&f).unwrap().segments[0].writable);
    }

    #[test]
    fn rejects_wrong_machine() {
        let f = image_with_phdrs(&[]);
        // Patch the machine field to something that is not AMD64.
        let node_write = f.duplicate();
        node_write.write_at(18, &3u16.to_le_bytes());
        assert_eq!(read_image(&f), Err(ExecError::UnsupportedArch));
    }

    #[test]
    fn rejects_dynamic_executables() {
        let f = image_with_phdrs(&[phdr_bytes(PT_DYNAMIC, 0, 0, 0x40_0000, 0, 8)]);
        assert_eq!(read_image(&f), Err(ExecError::UnsupportedType));
    }

    #[test]
    fn ignores_note_segments() {
        let f = image_with_phdrs(&[
            phdr_bytes(4, 0, 0, 0, 0, 8), // PT_NOTE
            phdr_bytes(PT_LOAD, 5, 0x120, 0x40_0120, 64, 64),
        ]);
        assert_eq!(read_image(&f).unwrap().segments.len(), 1);
    }

    #[test]
    fn rejects_memsz_smaller_than_filesz() {
        let f = image_with_phdrs(&[phdr_bytes(PT_LOAD, 5, 0x120, 0x40_0120, 128, 64)]);
        assert_eq!(read_image(&f), Err(ExecError::BadSegment));
    }

    #[test]
    fn rejects_segments_mapping_page_zero() {
        let f = image_with_phdrs(&[phdr_bytes(PT_LOAD, 5, 0x10, 0x10, 8, 8)]);
        assert_eq!(read_image(&f), Err(ExecError::BadSegment));
    }

    #[test]
    fn rejects_kernel_range_segments() {
        let f = image_with_phdrs(&[phdr_bytes(
            PT_LOAD,
            5,
            0,
            crate::memory::KERN_BASE,
            8,
            8,
        )]);
        assert_eq!(read_image(&f), Err(ExecError::BadSegment));
    }

    #[test]
    fn rejects_misaligned_offset_vaddr_pair() {
        let f = image_with_phdrs(&[phdr_bytes(PT_LOAD, 5, 0x100, 0x40_0120, 8, 8)]);
        assert_eq!(read_image(&f), Err(ExecError::BadSegment));
    }
}
