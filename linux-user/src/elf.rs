//! Minimal ELF parsing for static ARM and AArch64 executables.

use std::fmt;

const ELF_MAGIC: [u8; 4] = [0x7f, b'E', b'L', b'F'];
const ELFCLASS32: u8 = 1;
const ELFCLASS64: u8 = 2;
const ELFDATA2LSB: u8 = 1;

pub const ET_EXEC: u16 = 2;
pub const EM_ARM: u16 = 40;
pub const EM_AARCH64: u16 = 183;

pub const PT_LOAD: u32 = 1;

pub const PF_X: u32 = 1;
pub const PF_W: u32 = 2;
pub const PF_R: u32 = 4;

// Auxiliary vector types
pub const AT_NULL: usize = 0;
pub const AT_PHDR: usize = 3;
pub const AT_PHENT: usize = 4;
pub const AT_PHNUM: usize = 5;
pub const AT_PAGESZ: usize = 6;
pub const AT_ENTRY: usize = 9;
pub const AT_RANDOM: usize = 25;

#[derive(Debug)]
pub enum ElfError {
    TooSmall,
    InvalidMagic,
    UnsupportedEndian,
    UnsupportedMachine,
    UnsupportedType,
    InvalidPhdr,
}

impl fmt::Display for ElfError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::TooSmall => write!(f, "file too small"),
            Self::InvalidMagic => write!(f, "invalid ELF magic"),
            Self::UnsupportedEndian => write!(f, "not little-endian"),
            Self::UnsupportedMachine => write!(f, "not ARM or AArch64"),
            Self::UnsupportedType => write!(f, "not a static executable"),
            Self::InvalidPhdr => write!(f, "invalid program header"),
        }
    }
}

impl std::error::Error for ElfError {}

/// One loadable segment, class-independent.
#[derive(Debug, Clone, Copy)]
pub struct Segment {
    pub vaddr: usize,
    pub offset: usize,
    pub filesz: usize,
    pub memsz: usize,
    pub flags: u32,
}

/// Parsed image description.
#[derive(Debug)]
pub struct ElfImage {
    pub machine: u16,
    pub entry: usize,
    pub phoff: usize,
    pub phentsize: usize,
    pub phnum: usize,
    pub segments: Vec<Segment>,
}

impl ElfImage {
    pub fn is_aarch64(&self) -> bool {
        self.machine == EM_AARCH64
    }
}

fn read_u16(data: &[u8], off: usize) -> u16 {
    u16::from_le_bytes([data[off], data[off + 1]])
}

fn read_u32(data: &[u8], off: usize) -> u32 {
    u32::from_le_bytes(data[off..off + 4].try_into().unwrap())
}

fn read_u64(data: &[u8], off: usize) -> u64 {
    u64::from_le_bytes(data[off..off + 8].try_into().unwrap())
}

/// Parse and validate an executable image.
pub fn parse(data: &[u8]) -> Result<ElfImage, ElfError> {
    if data.len() < 52 {
        return Err(ElfError::TooSmall);
    }
    if data[0..4] != ELF_MAGIC {
        return Err(ElfError::InvalidMagic);
    }
    if data[5] != ELFDATA2LSB {
        return Err(ElfError::UnsupportedEndian);
    }
    let class = data[4];
    let machine = read_u16(data, 18);
    let e_type = read_u16(data, 16);
    match (class, machine) {
        (ELFCLASS32, EM_ARM) | (ELFCLASS64, EM_AARCH64) => {}
        _ => return Err(ElfError::UnsupportedMachine),
    }
    if e_type != ET_EXEC {
        return Err(ElfError::UnsupportedType);
    }

    let (entry, phoff, phentsize, phnum, min_phent) = if class == ELFCLASS64 {
        if data.len() < 64 {
            return Err(ElfError::TooSmall);
        }
        (
            read_u64(data, 24) as usize,
            read_u64(data, 32) as usize,
            read_u16(data, 54) as usize,
            read_u16(data, 56) as usize,
            56,
        )
    } else {
        (
            read_u32(data, 24) as usize,
            read_u32(data, 28) as usize,
            read_u16(data, 42) as usize,
            read_u16(data, 44) as usize,
            32,
        )
    };
    if phentsize < min_phent {
        return Err(ElfError::InvalidPhdr);
    }
    let table_end = phoff
        .checked_add(phnum.checked_mul(phentsize).ok_or(ElfError::InvalidPhdr)?)
        .ok_or(ElfError::InvalidPhdr)?;
    if table_end > data.len() {
        return Err(ElfError::InvalidPhdr);
    }

    let mut segments = Vec::new();
    for i in 0..phnum {
        let p = phoff + i * phentsize;
        let p_type = read_u32(data, p);
        if p_type != PT_LOAD {
            continue;
        }
        let seg = if class == ELFCLASS64 {
            Segment {
                flags: read_u32(data, p + 4),
                offset: read_u64(data, p + 8) as usize,
                vaddr: read_u64(data, p + 16) as usize,
                filesz: read_u64(data, p + 32) as usize,
                memsz: read_u64(data, p + 40) as usize,
            }
        } else {
            Segment {
                offset: read_u32(data, p + 4) as usize,
                vaddr: read_u32(data, p + 8) as usize,
                filesz: read_u32(data, p + 16) as usize,
                memsz: read_u32(data, p + 20) as usize,
                flags: read_u32(data, p + 24),
            }
        };
        if seg.filesz > seg.memsz
            || seg.offset.checked_add(seg.filesz).ok_or(ElfError::InvalidPhdr)?
                > data.len()
        {
            return Err(ElfError::InvalidPhdr);
        }
        segments.push(seg);
    }
    Ok(ElfImage {
        machine,
        entry,
        phoff,
        phentsize,
        phnum,
        segments,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn minimal_elf64() -> Vec<u8> {
        let mut buf = vec![0u8; 64 + 56];
        buf[0..4].copy_from_slice(&ELF_MAGIC);
        buf[4] = ELFCLASS64;
        buf[5] = ELFDATA2LSB;
        buf[6] = 1;
        buf[16..18].copy_from_slice(&ET_EXEC.to_le_bytes());
        buf[18..20].copy_from_slice(&EM_AARCH64.to_le_bytes());
        buf[24..32].copy_from_slice(&0x40_0000u64.to_le_bytes()); // entry
        buf[32..40].copy_from_slice(&64u64.to_le_bytes()); // phoff
        buf[54..56].copy_from_slice(&56u16.to_le_bytes()); // phentsize
        buf[56..58].copy_from_slice(&1u16.to_le_bytes()); // phnum
        // One PT_LOAD at 0x40_0000, RX.
        buf[64..68].copy_from_slice(&PT_LOAD.to_le_bytes());
        buf[68..72].copy_from_slice(&(PF_R | PF_X).to_le_bytes());
        buf[80..88].copy_from_slice(&0x40_0000u64.to_le_bytes()); // vaddr
        buf[96..104].copy_from_slice(&0u64.to_le_bytes()); // filesz
        buf[104..112].copy_from_slice(&0x1000u64.to_le_bytes()); // memsz
        buf
    }

    #[test]
    fn parse_minimal_aarch64() {
        let img = parse(&minimal_elf64()).unwrap();
        assert!(img.is_aarch64());
        assert_eq!(img.entry, 0x40_0000);
        assert_eq!(img.segments.len(), 1);
        assert_eq!(img.segments[0].memsz, 0x1000);
        assert_eq!(img.segments[0].flags, PF_R | PF_X);
    }

    #[test]
    fn rejects_wrong_machine() {
        let mut buf = minimal_elf64();
        buf[18] = 0x3e; // x86-64
        buf[19] = 0;
        assert!(matches!(parse(&buf), Err(ElfError::UnsupportedMachine)));
    }

    #[test]
    fn rejects_dynamic_executables() {
        let mut buf = minimal_elf64();
        buf[16] = 3; // ET_DYN
        assert!(matches!(parse(&buf), Err(ElfError::UnsupportedType)));
    }

    #[test]
    fn rejects_truncated_phdr_table() {
        let mut buf = minimal_elf64();
        buf[56..58].copy_from_slice(&8u16.to_le_bytes()); // phnum
        assert!(matches!(parse(&buf), Err(ElfError::InvalidPhdr)));
    }
}
