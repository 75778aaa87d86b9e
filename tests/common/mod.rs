//! Shared fixtures: build synthetic binaries carrying `.stack_transform.*`
//! sections, plus helpers for assembling stack images in heap buffers.

#![allow(dead_code)]

use object::{Architecture, BinaryFormat, Endianness, SectionKind};

pub const ENTRY_ID: u64 = u64::MAX;

// Location kind nibbles, as the post-processor packs them.
pub const KIND_REGISTER: u8 = 1;
pub const KIND_DIRECT: u8 = 2;
pub const KIND_INDIRECT: u8 = 3;
pub const KIND_CONSTANT: u8 = 4;

// Recipe instruction nibbles.
pub const INST_SET: u8 = 0;
pub const INST_ADD: u8 = 1;
pub const INST_LOAD64: u8 = 9;

#[derive(Clone)]
pub struct Func {
    pub addr: u64,
    pub code_size: u32,
    pub frame_size: u32,
    /// (reg, offset-from-FBP) spill records for the prologue.
    pub unwind: Vec<(u16, i16)>,
}

#[derive(Clone, Copy)]
pub struct Live {
    pub kind: u8,
    pub dup: bool,
    pub alloca: bool,
    pub ptr: bool,
    pub size: u8,
    pub reg: u16,
    pub off: i32,
    pub alloca_size: u32,
}

impl Live {
    pub fn reg(reg: u16, size: u8) -> Self {
        Live {
            kind: KIND_REGISTER,
            dup: false,
            alloca: false,
            ptr: false,
            size,
            reg,
            off: 0,
            alloca_size: 0,
        }
    }

    pub fn direct(reg: u16, off: i32, size: u8) -> Self {
        Live { kind: KIND_DIRECT, off, ..Live::reg(reg, size) }
    }

    pub fn indirect(reg: u16, off: i32, size: u8) -> Self {
        Live { kind: KIND_INDIRECT, off, ..Live::reg(reg, size) }
    }

    pub fn constant(value: i32, size: u8) -> Self {
        Live { kind: KIND_CONSTANT, off: value, ..Live::reg(0, size) }
    }

    pub fn alloca(reg: u16, off: i32, alloca_size: u32) -> Self {
        Live {
            kind: KIND_DIRECT,
            alloca: true,
            size: 8,
            off,
            alloca_size,
            ..Live::reg(reg, 8)
        }
    }

    pub fn ptr(mut self) -> Self {
        self.ptr = true;
        self
    }

    pub fn dup(mut self) -> Self {
        self.dup = true;
        self
    }
}

#[derive(Clone, Copy)]
pub struct ArchLive {
    pub dst_kind: u8,
    pub dst_size: u8,
    pub dst_reg: u16,
    pub dst_off: u32,
    pub op_kind: u8,
    pub generative: bool,
    pub inst: u8,
    pub op_size: u8,
    pub op_reg: u16,
    pub op_value: i64,
}

#[derive(Clone)]
pub struct Site {
    pub id: u64,
    pub func: u32,
    pub addr: u64,
    pub frame_size: u32,
    pub live: Vec<Live>,
    pub arch_live: Vec<ArchLive>,
}

impl Site {
    pub fn new(id: u64, func: u32, addr: u64, frame_size: u32) -> Self {
        Site { id, func, addr, frame_size, live: Vec::new(), arch_live: Vec::new() }
    }

    pub fn live(mut self, vals: Vec<Live>) -> Self {
        self.live = vals;
        self
    }

    pub fn arch_live(mut self, vals: Vec<ArchLive>) -> Self {
        self.arch_live = vals;
        self
    }
}

pub struct BinaryBuilder {
    arch: Architecture,
    funcs: Vec<Func>,
    sites: Vec<Site>,
    /// When set, the two call-site views are emitted as-is, unsorted.
    pub skip_sorting: bool,
}

impl BinaryBuilder {
    pub fn new(arch: Architecture) -> Self {
        BinaryBuilder { arch, funcs: Vec::new(), sites: Vec::new(), skip_sorting: false }
    }

    pub fn func(mut self, func: Func) -> Self {
        self.funcs.push(func);
        self
    }

    pub fn site(mut self, site: Site) -> Self {
        self.sites.push(site);
        self
    }

    /// Serialize all records and wrap them in an ELF image. Functions must
    /// be supplied in address order; sites reference them by index.
    pub fn build(self) -> Vec<u8> {
        // Function records reference slices of the unwind section.
        let mut functions = Vec::new();
        let mut unwind = Vec::new();
        let mut unwind_count: u32 = 0;
        for func in &self.funcs {
            functions.extend_from_slice(&func.addr.to_le_bytes());
            functions.extend_from_slice(&func.code_size.to_le_bytes());
            functions.extend_from_slice(&func.frame_size.to_le_bytes());
            functions.extend_from_slice(&unwind_count.to_le_bytes());
            functions.extend_from_slice(&(func.unwind.len() as u16).to_le_bytes());
            functions.extend_from_slice(&0u32.to_le_bytes()); // stack_slot_off
            functions.extend_from_slice(&0u16.to_le_bytes()); // stack_slot_num
            for (reg, off) in &func.unwind {
                unwind.extend_from_slice(&reg.to_le_bytes());
                unwind.extend_from_slice(&off.to_le_bytes());
                unwind_count += 1;
            }
        }

        // Call sites reference slices of the live / arch-live sections.
        let mut live = Vec::new();
        let mut live_count: u32 = 0;
        let mut arch_live = Vec::new();
        let mut arch_live_count: u32 = 0;
        let mut site_records: Vec<(u64, u64, Vec<u8>)> = Vec::new();
        for site in &self.sites {
            let mut rec = Vec::new();
            rec.extend_from_slice(&site.id.to_le_bytes());
            rec.extend_from_slice(&site.func.to_le_bytes());
            rec.push(0); // flags
            rec.extend_from_slice(&site.addr.to_le_bytes());
            rec.extend_from_slice(&live_count.to_le_bytes());
            rec.extend_from_slice(&(site.live.len() as u16).to_le_bytes());
            rec.extend_from_slice(&arch_live_count.to_le_bytes());
            rec.extend_from_slice(&(site.arch_live.len() as u16).to_le_bytes());
            site_records.push((site.id, site.addr, rec));

            for val in &site.live {
                let flags = (val.kind << 4)
                    | (val.dup as u8)
                    | ((val.alloca as u8) << 1)
                    | ((val.ptr as u8) << 2);
                live.push(flags);
                live.push(val.size);
                live.extend_from_slice(&val.reg.to_le_bytes());
                live.extend_from_slice(&val.off.to_le_bytes());
                live.extend_from_slice(&val.alloca_size.to_le_bytes());
                live_count += 1;
            }
            for val in &site.arch_live {
                arch_live.push(val.dst_kind << 4);
                arch_live.push(val.dst_size);
                arch_live.extend_from_slice(&val.dst_reg.to_le_bytes());
                arch_live.extend_from_slice(&val.dst_off.to_le_bytes());
                arch_live.push((val.op_kind & 0x7) | ((val.generative as u8) << 3) | (val.inst << 4));
                arch_live.push(val.op_size);
                arch_live.extend_from_slice(&val.op_reg.to_le_bytes());
                arch_live.extend_from_slice(&val.op_value.to_le_bytes());
                arch_live_count += 1;
            }
        }

        let mut by_id = site_records.clone();
        let mut by_addr = site_records;
        if !self.skip_sorting {
            by_id.sort_by_key(|(id, _, _)| *id);
            by_addr.sort_by_key(|(_, addr, _)| *addr);
        }
        let flatten =
            |records: Vec<(u64, u64, Vec<u8>)>| records.into_iter().flat_map(|(_, _, r)| r).collect();

        let mut obj = object::write::Object::new(BinaryFormat::Elf, self.arch, Endianness::Little);
        let mut add = |name: &str, data: Vec<u8>| {
            let id = obj.add_section(Vec::new(), name.as_bytes().to_vec(), SectionKind::ReadOnlyData);
            obj.set_section_data(id, data, 1);
        };
        add(".stack_transform.functions", functions);
        add(".stack_transform.unwind", unwind);
        add(".stack_transform.id", flatten(by_id));
        add(".stack_transform.addr", flatten(by_addr));
        add(".stack_transform.live", live);
        if arch_live_count > 0 {
            add(".stack_transform.arch_live", arch_live);
        }
        obj.write().expect("ELF assembly failed")
    }
}

/// A heap-backed stack image. Addresses grow downward from `base()`.
pub struct StackImage {
    buf: Vec<u8>,
}

impl StackImage {
    pub fn new(len: usize) -> Self {
        StackImage { buf: vec![0; len] }
    }

    /// Highest address (one past the buffer).
    pub fn base(&self) -> u64 {
        self.buf.as_ptr() as u64 + self.buf.len() as u64
    }

    /// Write a u64 at `base() - down`.
    pub fn set_u64(&mut self, down: usize, value: u64) {
        let at = self.buf.len() - down;
        self.buf[at..at + 8].copy_from_slice(&value.to_le_bytes());
    }

    pub fn set_u32(&mut self, down: usize, value: u32) {
        let at = self.buf.len() - down;
        self.buf[at..at + 4].copy_from_slice(&value.to_le_bytes());
    }

    /// Read a u64 at absolute address `addr` (must be inside the buffer).
    pub fn u64_at(&self, addr: u64) -> u64 {
        let at = (addr - self.buf.as_ptr() as u64) as usize;
        u64::from_le_bytes(self.buf[at..at + 8].try_into().unwrap())
    }

    pub fn u32_at(&self, addr: u64) -> u32 {
        let at = (addr - self.buf.as_ptr() as u64) as usize;
        u32::from_le_bytes(self.buf[at..at + 4].try_into().unwrap())
    }

    pub fn bytes(&mut self) -> &mut [u8] {
        &mut self.buf
    }

    pub fn is_all_zero(&self) -> bool {
        self.buf.iter().all(|&b| b == 0)
    }

    pub fn snapshot(&self) -> Vec<u8> {
        self.buf.clone()
    }
}
