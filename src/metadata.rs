//! Metadata sections and the per-binary handle.
//!
//! The Popcorn toolchain's post-processor emits packed little-endian record
//! arrays into a family of `.stack_transform.*` ELF sections. The loader
//! finds those sections with `object`, keeps the raw file bytes alive (mmap
//! or owned buffer), and hands out typed slices over them; nothing is copied
//! and nothing is parsed lazily on the rewrite path.
//!
//! Record layouts are byte-exact with the on-disk format: `#[repr(C)]`
//! structs built from zerocopy's little-endian field types, so the casts are
//! alignment- and endian-independent.

use std::fs::File;
use std::ops::Range;
use std::path::Path;

use memmap2::Mmap;
use object::read::{Object, ObjectSection};
use zerocopy::byteorder::little_endian as le;
use zerocopy::FromBytes;
use zerocopy_derive::{FromBytes, Immutable, KnownLayout, Unaligned};

use crate::arch::{self, Arch};
use crate::error::Error;

/// Common prefix of all metadata section names.
pub const SECTION_PREFIX: &str = ".stack_transform";

const SECTION_FUNCTIONS: &str = ".stack_transform.functions";
const SECTION_UNWIND: &str = ".stack_transform.unwind";
const SECTION_ID: &str = ".stack_transform.id";
const SECTION_ADDR: &str = ".stack_transform.addr";
const SECTION_LIVE: &str = ".stack_transform.live";
const SECTION_ARCH_LIVE: &str = ".stack_transform.arch_live";

/// Call-site IDs at and above this value mark the call-chain boundary:
/// process entry, thread entry, and the entry functions' start pseudo-sites.
/// The post-processor's ID counter skips them.
pub const FIRST_RESERVED_ID: u64 = u64::MAX - 2;

/// Does this call-site ID terminate unwinding?
pub fn is_entry_id(id: u64) -> bool {
    id >= FIRST_RESERVED_ID
}

/// Per-function record: address range, frame size, and the function's slice
/// of the unwind section. Sorted by `addr`.
#[derive(FromBytes, KnownLayout, Immutable, Unaligned, Clone, Copy, Debug)]
#[repr(C)]
pub struct FunctionRecord {
    pub addr: le::U64,
    pub code_size: le::U32,
    pub frame_size: le::U32,
    pub unwind_off: le::U32,
    pub unwind_num: le::U16,
    pub stack_slot_off: le::U32,
    pub stack_slot_num: le::U16,
}

/// Where a function's prologue spilled one callee-saved register, as an
/// offset from the frame base pointer.
#[derive(FromBytes, KnownLayout, Immutable, Unaligned, Clone, Copy, Debug)]
#[repr(C)]
pub struct UnwindRecord {
    pub reg: le::U16,
    pub offset: le::I16,
}

/// One call site. The same records appear twice in the file, once sorted by
/// `id` and once by `addr` (the return address).
#[derive(FromBytes, KnownLayout, Immutable, Unaligned, Clone, Copy, Debug)]
#[repr(C)]
pub struct CallSiteRecord {
    pub id: le::U64,
    pub func_index: le::U32,
    pub flags: u8,
    pub addr: le::U64,
    pub live_off: le::U32,
    pub live_num: le::U16,
    pub arch_live_off: le::U32,
    pub arch_live_num: le::U16,
}

/// Location descriptor for one live value at a call site.
#[derive(FromBytes, KnownLayout, Immutable, Unaligned, Clone, Copy, Debug)]
#[repr(C)]
pub struct LiveValueRecord {
    pub flags: u8,
    pub size: u8,
    pub reg: le::U16,
    pub offset_or_constant: le::I32,
    pub alloca_size: le::U32,
}

/// Destination-side recipe for an architecture-specific value.
#[derive(FromBytes, KnownLayout, Immutable, Unaligned, Clone, Copy, Debug)]
#[repr(C)]
pub struct ArchLiveValueRecord {
    pub dst_flags: u8,
    pub dst_size: u8,
    pub dst_reg: le::U16,
    pub dst_offset: le::U32,
    pub op_flags: u8,
    pub op_size: u8,
    pub op_reg: le::U16,
    pub op_value: le::I64,
}

bitflags::bitflags! {
    /// Single-bit live-value flags; the high nibble holds the location kind.
    #[derive(Clone, Copy, Debug, PartialEq, Eq)]
    pub struct LiveValueFlags: u8 {
        const DUPLICATE = 1 << 0;
        const ALLOCA = 1 << 1;
        const POINTER = 1 << 2;
    }
}

/// Where a live value lives.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LocationKind {
    Register,
    Direct,
    Indirect,
    Constant,
    ConstIndex,
}

impl LocationKind {
    pub fn from_nibble(nibble: u8) -> Option<Self> {
        match nibble {
            1 => Some(LocationKind::Register),
            2 => Some(LocationKind::Direct),
            3 => Some(LocationKind::Indirect),
            4 => Some(LocationKind::Constant),
            5 => Some(LocationKind::ConstIndex),
            _ => None,
        }
    }
}

/// Recipe instruction kinds.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Inst {
    Set,
    Add,
    Subtract,
    Multiply,
    Divide,
    LeftShift,
    RightShiftLog,
    RightShiftArith,
    Mask,
    Load64,
}

impl Inst {
    fn from_nibble(nibble: u8) -> Option<Self> {
        match nibble {
            0 => Some(Inst::Set),
            1 => Some(Inst::Add),
            2 => Some(Inst::Subtract),
            3 => Some(Inst::Multiply),
            4 => Some(Inst::Divide),
            5 => Some(Inst::LeftShift),
            6 => Some(Inst::RightShiftLog),
            7 => Some(Inst::RightShiftArith),
            8 => Some(Inst::Mask),
            9 => Some(Inst::Load64),
            _ => None,
        }
    }
}

impl LiveValueRecord {
    pub fn is_duplicate(&self) -> bool {
        LiveValueFlags::from_bits_truncate(self.flags).contains(LiveValueFlags::DUPLICATE)
    }

    pub fn is_alloca(&self) -> bool {
        LiveValueFlags::from_bits_truncate(self.flags).contains(LiveValueFlags::ALLOCA)
    }

    pub fn is_ptr(&self) -> bool {
        LiveValueFlags::from_bits_truncate(self.flags).contains(LiveValueFlags::POINTER)
    }

    pub fn kind(&self) -> Option<LocationKind> {
        LocationKind::from_nibble(self.flags >> 4)
    }

    /// Bytes the value occupies: the alloca's full extent for stack
    /// allocations, the scalar size otherwise.
    pub fn val_size(&self) -> u32 {
        if self.is_alloca() {
            self.alloca_size.get()
        } else {
            self.size as u32
        }
    }
}

impl ArchLiveValueRecord {
    pub fn dst_kind(&self) -> Option<LocationKind> {
        LocationKind::from_nibble(self.dst_flags >> 4)
    }

    pub fn operand_kind(&self) -> Option<LocationKind> {
        LocationKind::from_nibble(self.op_flags & 0x7)
    }

    pub fn is_generative(&self) -> bool {
        self.op_flags & (1 << 3) != 0
    }

    pub fn inst(&self) -> Option<Inst> {
        Inst::from_nibble(self.op_flags >> 4)
    }
}

enum Buffer {
    Mmap(Mmap),
    Owned(Vec<u8>),
}

impl std::ops::Deref for Buffer {
    type Target = [u8];
    fn deref(&self) -> &[u8] {
        match self {
            Buffer::Mmap(m) => m,
            Buffer::Owned(v) => v,
        }
    }
}

/// A per-binary metadata handle.
///
/// Immutable once initialized; any number of concurrent rewrites may share
/// one. Must outlive every rewrite that uses it, which the borrow on
/// [`rewrite_stack`](crate::rewrite_stack) enforces.
pub struct Handle {
    data: Buffer,
    arch: &'static dyn Arch,
    functions: Range<usize>,
    unwind: Range<usize>,
    sites_id: Range<usize>,
    sites_addr: Range<usize>,
    live: Range<usize>,
    arch_live: Range<usize>,
}

impl Handle {
    /// Open a binary on disk and build the metadata indices.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self, Error> {
        let path = path.as_ref();
        let file =
            File::open(path).map_err(|e| Error::OpenFile(path.to_path_buf(), e))?;
        let mmap = unsafe { Mmap::map(&file) }
            .map_err(|e| Error::OpenFile(path.to_path_buf(), e))?;
        Self::load(Buffer::Mmap(mmap))
    }

    /// Build a handle from a binary image already in memory.
    pub fn parse(data: Vec<u8>) -> Result<Self, Error> {
        Self::load(Buffer::Owned(data))
    }

    fn load(data: Buffer) -> Result<Self, Error> {
        let (arch, functions, unwind, sites_id, sites_addr, live, arch_live) = {
            let file = object::File::parse(&data[..]).map_err(Error::InvalidElf)?;
            if !file.is_little_endian() {
                return Err(Error::InvalidMetadata("big-endian binaries are not supported"));
            }
            let arch = arch::for_architecture(file.architecture())
                .ok_or(Error::UnsupportedArch(file.architecture()))?;
            (
                arch,
                section_range::<FunctionRecord>(&file, SECTION_FUNCTIONS, true)?,
                section_range::<UnwindRecord>(&file, SECTION_UNWIND, true)?,
                section_range::<CallSiteRecord>(&file, SECTION_ID, true)?,
                section_range::<CallSiteRecord>(&file, SECTION_ADDR, true)?,
                section_range::<LiveValueRecord>(&file, SECTION_LIVE, true)?,
                // A binary with no architecture-specific values simply omits
                // the section.
                section_range::<ArchLiveValueRecord>(&file, SECTION_ARCH_LIVE, false)?,
            )
        };
        let handle = Handle {
            data,
            arch,
            functions,
            unwind,
            sites_id,
            sites_addr,
            live,
            arch_live,
        };
        handle.validate()?;
        log::debug!(
            "loaded {} metadata: {} functions, {} call sites, {} live values, {} arch values",
            handle.arch.name(),
            handle.functions().len(),
            handle.sites_by_id().len(),
            handle.live_values().len(),
            handle.arch_live_values().len(),
        );
        Ok(handle)
    }

    pub fn arch(&self) -> &'static dyn Arch {
        self.arch
    }

    fn typed<T>(&self, range: &Range<usize>) -> &[T]
    where
        T: FromBytes + zerocopy::KnownLayout + zerocopy::Immutable,
    {
        // Size and bounds were checked when the handle was built.
        <[T]>::ref_from_bytes(&self.data[range.clone()])
            .expect("section validated at load time")
    }

    pub(crate) fn functions(&self) -> &[FunctionRecord] {
        self.typed(&self.functions)
    }

    pub(crate) fn unwind_records(&self) -> &[UnwindRecord] {
        self.typed(&self.unwind)
    }

    pub(crate) fn sites_by_id(&self) -> &[CallSiteRecord] {
        self.typed(&self.sites_id)
    }

    pub(crate) fn sites_by_addr(&self) -> &[CallSiteRecord] {
        self.typed(&self.sites_addr)
    }

    pub(crate) fn live_values(&self) -> &[LiveValueRecord] {
        self.typed(&self.live)
    }

    pub(crate) fn arch_live_values(&self) -> &[ArchLiveValueRecord] {
        self.typed(&self.arch_live)
    }

    /// Cross-record validation; runs once at init so the rewrite path can
    /// slice without checking.
    fn validate(&self) -> Result<(), Error> {
        let functions = self.functions();
        let unwind_len = self.unwind_records().len();
        let sites_id = self.sites_by_id();
        let sites_addr = self.sites_by_addr();
        let live = self.live_values();
        let arch_live_len = self.arch_live_values().len();

        if sites_id.len() != sites_addr.len() {
            return Err(Error::InvalidMetadata("call-site views differ in length"));
        }
        if !sites_id.windows(2).all(|w| w[0].id.get() <= w[1].id.get()) {
            return Err(Error::InvalidMetadata("ID call-site view is not sorted"));
        }
        if !sites_addr.windows(2).all(|w| w[0].addr.get() <= w[1].addr.get()) {
            return Err(Error::InvalidMetadata("address call-site view is not sorted"));
        }
        if !functions.windows(2).all(|w| w[0].addr.get() <= w[1].addr.get()) {
            return Err(Error::InvalidMetadata("function records are not sorted"));
        }
        for func in functions {
            let end = func.unwind_off.get() as usize + func.unwind_num.get() as usize;
            if end > unwind_len {
                return Err(Error::InvalidMetadata("function unwind slice out of bounds"));
            }
        }
        for site in sites_id.iter().chain(sites_addr) {
            if site.func_index.get() as usize >= functions.len() {
                return Err(Error::InvalidMetadata("call-site function index out of bounds"));
            }
            let live_end = site.live_off.get() as usize + site.live_num.get() as usize;
            if live_end > live.len() {
                return Err(Error::InvalidMetadata("call-site live slice out of bounds"));
            }
            let arch_end =
                site.arch_live_off.get() as usize + site.arch_live_num.get() as usize;
            if arch_end > arch_live_len {
                return Err(Error::InvalidMetadata("call-site arch-live slice out of bounds"));
            }
            let slice = &live[site.live_off.get() as usize..live_end];
            let mut primary_size = None;
            for val in slice {
                if val.is_duplicate() {
                    match primary_size {
                        None => {
                            return Err(Error::InvalidMetadata(
                                "duplicate live value without a primary",
                            ))
                        }
                        Some(size) if size != val.size => {
                            return Err(Error::InvalidMetadata(
                                "duplicate live value disagrees with its primary's size",
                            ))
                        }
                        Some(_) => {}
                    }
                } else {
                    primary_size = Some(val.size);
                }
            }
        }
        Ok(())
    }

    /// The function record at `index`.
    pub(crate) fn function(&self, index: u32) -> Result<&FunctionRecord, Error> {
        self.functions()
            .get(index as usize)
            .ok_or(Error::InvalidMetadata("call-site function index out of bounds"))
    }

    /// The unwind slice describing where `func`'s prologue spilled registers.
    pub(crate) fn unwind_slice(&self, func: &FunctionRecord) -> &[UnwindRecord] {
        let start = func.unwind_off.get() as usize;
        let end = start + func.unwind_num.get() as usize;
        &self.unwind_records()[start..end]
    }

    /// The live values recorded at `site`.
    pub(crate) fn live_slice(&self, site: &CallSiteRecord) -> &[LiveValueRecord] {
        let start = site.live_off.get() as usize;
        let end = start + site.live_num.get() as usize;
        &self.live_values()[start..end]
    }

    /// The architecture-specific value recipes recorded at `site`.
    pub(crate) fn arch_live_slice(&self, site: &CallSiteRecord) -> &[ArchLiveValueRecord] {
        let start = site.arch_live_off.get() as usize;
        let end = start + site.arch_live_num.get() as usize;
        &self.arch_live_values()[start..end]
    }
}

impl std::fmt::Debug for Handle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Handle")
            .field("arch", &self.arch.name())
            .field("functions", &self.functions().len())
            .field("sites", &self.sites_by_id().len())
            .finish()
    }
}

fn section_range<T>(
    file: &object::File,
    name: &'static str,
    required: bool,
) -> Result<Range<usize>, Error> {
    let Some(section) = file.section_by_name(name) else {
        if required {
            return Err(Error::MissingSection(name));
        }
        return Ok(0..0);
    };
    // An empty section is legal (a binary may have no records of some kind).
    let (offset, size) = section.file_range().unwrap_or((0, 0));
    if size % std::mem::size_of::<T>() as u64 != 0 {
        return Err(Error::SectionTooSmall(name));
    }
    let start = offset as usize;
    let end = start + size as usize;
    Ok(start..end)
}
