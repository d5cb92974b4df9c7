use core::fmt;

// ══════════════════════════════════════════════════════════════
//  ELF64 constants
// ══════════════════════════════════════════════════════════════

const ELF_MAGIC: [u8; 4] = [0x7F, b'E', b'L', b'F'];
const ELFCLASS64: u8 = 2;
const ELFDATA2LSB: u8 = 1;
const EV_CURRENT: u32 = 1;
const ET_EXEC: u16 = 2;
const EM_X86_64: u16 = 62;

pub const PT_NULL: u32 = 0;
pub const PT_LOAD: u32 = 1;
pub const PT_DYNAMIC: u32 = 2;
pub const PT_INTERP: u32 = 3;
pub const PT_NOTE: u32 = 4;
pub const PT_SHLIB: u32 = 5;
pub const PT_PHDR: u32 = 6;
pub const PT_STACK: u32 = 0x6474e551;

pub const PF_W: u32 = 2;

/// On-disk size of one program header; `e_phentsize` must match.
pub const PHDR_SIZE: usize = 56;
/// Header-count ceiling; anything larger is rejected outright.
pub const PHNUM_MAX: u16 = 1024;

pub const EHDR_SIZE: usize = 64;

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
    TooManyArgs,
    MemoryError,
    ReadError,
}

impl fmt::Display for ExecError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            ExecError::FileNotFound => write!(f, "File not found"),
            ExecError::InvalidFormat => write!(f, "Invalid ELF format"),
            ExecError::UnsupportedArch => write!(f, "Unsupported architecture"),
            ExecError::UnsupportedType => write!(f, "Unsupported ELF type (need ET_EXEC)"),
            ExecError::BadSegment => write!(f, "Disallowed or malformed segment"),
            ExecError::TooManyArgs => write!(f, "Too many arguments"),
            ExecError::MemoryError => write!(f, "Memory allocation error"),
            ExecError::ReadError => write!(f, "File read error"),
        }
    }
}

// ══════════════════════════════════════════════════════════════
//  ELF64 structures
// ══════════════════════════════════════════════════════════════

#[derive(Debug, PartialEq)]
pub struct ElfHeader {
    pub e_entry: u64,
    pub e_phoff: u64,
    pub e_phentsize: u16,
    pub e_phnum: u16,
}

impl ElfHeader {
    /// Parse and validate an executable header: ELF64, little-endian,
    /// version 1, x86-64 executable, sane program-header geometry.
    pub fn parse(data: &[u8]) -> Result<Self, ExecError> {
        if data.len() < EHDR_SIZE {
            return Err(ExecError::InvalidFormat);
        }
        if data[0..4] != ELF_MAGIC {
            return Err(ExecError::InvalidFormat);
        }
        if data[4] != ELFCLASS64 || data[5] != ELFDATA2LSB {
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
        if e_version != EV_CURRENT {
            return Err(ExecError::InvalidFormat);
        }

        let hdr = ElfHeader {
            e_entry: u64::from_le_bytes(data[24..32].try_into().unwrap()),
            e_phoff: u64::from_le_bytes(data[32..40].try_into().unwrap()),
            e_phentsize: u16::from_le_bytes([data[54], data[55]]),
            e_phnum: u16::from_le_bytes([data[56], data[57]]),
        };
        if hdr.e_phentsize as usize != PHDR_SIZE {
            return Err(ExecError::InvalidFormat);
        }
        if hdr.e_phnum > PHNUM_MAX {
            return Err(ExecError::InvalidFormat);
        }
        Ok(hdr)
    }
}

pub struct ProgramHeader {
    pub p_type: u32,
    pub p_flags: u32,
    pub p_offset: u64,
    pub p_vaddr: u64,
    pub p_filesz: u64,
    pub p_memsz: u64,
}

impl ProgramHeader {
    pub fn parse(data: &[u8]) -> Result<Self, ExecError> {
        if data.len() < PHDR_SIZE {
            return Err(ExecError::InvalidFormat);
        }
        Ok(ProgramHeader {
            p_type: u32::from_le_bytes(data[0..4].try_into().unwrap()),
            p_flags: u32::from_le_bytes(data[4..8].try_into().unwrap()),
            p_offset: u64::from_le_bytes(data[8..16].try_into().unwrap()),
            p_vaddr: u64::from_le_bytes(data[16..24].try_into().unwrap()),
            p_filesz: u64::from_le_bytes(data[32..40].try_into().unwrap()),
            p_memsz: u64::from_le_bytes(data[40..48].try_into().unwrap()),
        })
    }

    pub fn writable(&self) -> bool {
        self.p_flags & PF_W != 0
    }
}

/// How the loader reacts to a segment type.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SegmentAction {
    Ignore,
    Load,
    Reject,
}

pub fn classify_segment(p_type: u32) -> SegmentAction {
    match p_type {
        PT_LOAD => SegmentAction::Load,
        PT_DYNAMIC | PT_INTERP | PT_SHLIB => SegmentAction::Reject,
        // PT_NULL, PT_NOTE, PT_PHDR, PT_STACK, and anything unknown
        _ => SegmentAction::Ignore,
    }
}

/// Validate a LOAD segment: congruent file/virtual alignment, offset inside
/// the file, non-empty, entirely in user space with no wrap-around, and not
/// touching page zero.
pub fn validate_segment(phdr: &ProgramHeader, file_len: u64) -> Result<(), ExecError> {
    let page_mask = crate::memory::PAGE_SIZE - 1;

    if (phdr.p_offset & page_mask) != (phdr.p_vaddr & page_mask) {
        return Err(ExecError::BadSegment);
    }
    if phdr.p_offset > file_len {
        return Err(ExecError::BadSegment);
    }
    if phdr.p_memsz < phdr.p_filesz || phdr.p_memsz == 0 {
        return Err(ExecError::BadSegment);
    }

    let end = match phdr.p_vaddr.checked_add(phdr.p_memsz) {
        Some(end) => end,
        None => return Err(ExecError::BadSegment), // wrap-around
    };
    if phdr.p_vaddr >= crate::memory::USER_LIMIT || end > crate::memory::USER_LIMIT {
        return Err(ExecError::BadSegment);
    }
    if phdr.p_vaddr < crate::memory::PAGE_SIZE {
        return Err(ExecError::BadSegment);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn valid_header_bytes() -> [u8; EHDR_SIZE] {
        let mut h = [0u8; EHDR_SIZE];
        h[0..4].copy_from_slice(&ELF_MAGIC);
        h[4] = ELFCLASS64;
        h[5] = ELFDATA2LSB;
        h[16..18].copy_from_slice(&ET_EXEC.to_le_bytes());
        h[18..20].copy_from_slice(&EM_X86_64.to_le_bytes());
        h[20..24].copy_from_slice(&EV_CURRENT.to_le_bytes());
        h[24..32].copy_from_slice(&0x40_1000u64.to_le_bytes()); // entry
        h[32..40].copy_from_slice(&(EHDR_SIZE as u64).to_le_bytes()); // phoff
        h[54..56].copy_from_slice(&(PHDR_SIZE as u16).to_le_bytes());
        h[56..58].copy_from_slice(&1u16.to_le_bytes());
        h
    }

    #[test]
    fn accepts_a_valid_header() {
        let hdr = ElfHeader::parse(&valid_header_bytes()).unwrap();
        assert_eq!(hdr.e_entry, 0x40_1000);
        assert_eq!(hdr.e_phnum, 1);
    }

    #[test]
    fn rejects_bad_magic_and_class() {
        let mut h = valid_header_bytes();
        h[0] = 0x7E;
        assert_eq!(ElfHeader::parse(&h), Err(ExecError::InvalidFormat));

        let mut h = valid_header_bytes();
        h[4] = 1; // 32-bit
        assert_eq!(ElfHeader::parse(&h), Err(ExecError::UnsupportedArch));
    }

    #[test]
    fn rejects_non_executables_and_foreign_machines() {
        let mut h = valid_header_bytes();
        h[16..18].copy_from_slice(&3u16.to_le_bytes()); // ET_DYN
        assert_eq!(ElfHeader::parse(&h), Err(ExecError::UnsupportedType));

        let mut h = valid_header_bytes();
        h[18..20].copy_from_slice(&0x28u16.to_le_bytes()); // aarch64
        assert_eq!(ElfHeader::parse(&h), Err(ExecError::UnsupportedArch));
    }

    #[test]
    fn phnum_boundary_is_exact() {
        let mut h = valid_header_bytes();
        h[56..58].copy_from_slice(&1024u16.to_le_bytes());
        assert!(ElfHeader::parse(&h).is_ok());

        h[56..58].copy_from_slice(&1025u16.to_le_bytes());
        assert_eq!(ElfHeader::parse(&h), Err(ExecError::InvalidFormat));
    }

    #[test]
    fn segment_classification() {
        assert_eq!(classify_segment(PT_LOAD), SegmentAction::Load);
        assert_eq!(classify_segment(PT_NULL), SegmentAction::Ignore);
        assert_eq!(classify_segment(PT_NOTE), SegmentAction::Ignore);
        assert_eq!(classify_segment(PT_PHDR), SegmentAction::Ignore);
        assert_eq!(classify_segment(PT_STACK), SegmentAction::Ignore);
        assert_eq!(classify_segment(PT_DYNAMIC), SegmentAction::Reject);
        assert_eq!(classify_segment(PT_INTERP), SegmentAction::Reject);
        assert_eq!(classify_segment(PT_SHLIB), SegmentAction::Reject);
    }

    fn load_phdr(vaddr: u64, offset: u64, filesz: u64, memsz: u64) -> ProgramHeader {
        ProgramHeader {
            p_type: PT_LOAD,
            p_flags: PF_W,
            p_offset: offset,
            p_vaddr: vaddr,
            p_filesz: filesz,
            p_memsz: memsz,
        }
    }

    #[test]
    fn segment_validation_rules() {
        // Fine: aligned congruently, inside the file, user space.
        assert!(validate_segment(&load_phdr(0x40_1000, 0x1000, 64, 128), 4096).is_ok());
        // File offset and vaddr not congruent modulo page size.
        assert!(validate_segment(&load_phdr(0x40_1001, 0x1000, 64, 128), 4096).is_err());
        // Empty segment.
        assert!(validate_segment(&load_phdr(0x40_1000, 0x1000, 0, 0), 4096).is_err());
        // memsz smaller than filesz.
        assert!(validate_segment(&load_phdr(0x40_1000, 0x1000, 128, 64), 4096).is_err());
        // Wrap-around.
        assert!(validate_segment(&load_phdr(u64::MAX - 0xFFF, 0x1000, 8, 0x2000), 4096).is_err());
        // Page zero.
        assert!(validate_segment(&load_phdr(0x10, 0x10, 8, 8), 4096).is_err());
    }
}
