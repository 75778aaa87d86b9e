//! PowerPC64 (ELFv2) register layout and stack properties.
//!
//! DWARF numbering: 0-31 r0-r31, 32-63 f0-f31, 65 lr, 66 ctr; the PC has a
//! dedicated slot. The return address lives in the link register; the
//! caller's save slot for it sits at CFA + 16. r1 is the stack pointer and
//! r31 the frame pointer, which the prologue parks at the CFA itself.

use super::{Arch, CalleeSaved};

pub const R1_SP: u16 = 1;
pub const R31_FP: u16 = 31;
pub const LR: u16 = 65;
pub const CTR: u16 = 66;

const GP_OFFSET: usize = 8; // pc slot first
const FP_OFFSET: usize = GP_OFFSET + 32 * 8;
const LR_OFFSET: usize = FP_OFFSET + 32 * 8;
const CTR_OFFSET: usize = LR_OFFSET + 8;

static CALLEE_SAVED: [CalleeSaved; 37] = {
    let mut table = [CalleeSaved { reg: LR, size: 8 }; 37];
    let mut i = 0;
    while i < 18 {
        table[i] = CalleeSaved { reg: 14 + i as u16, size: 8 };
        table[i + 18] = CalleeSaved { reg: 46 + i as u16, size: 8 };
        i += 1;
    }
    // The link register's save slot lives in the caller's frame; treating it
    // as callee-saved lets the unwinder restore it like any spilled register.
    table
};

#[derive(Debug)]
pub struct PowerPc64;

impl Arch for PowerPc64 {
    fn name(&self) -> &'static str {
        "powerpc64"
    }

    fn num_regs(&self) -> u16 {
        CTR + 1
    }

    fn regset_size(&self) -> usize {
        CTR_OFFSET + 8
    }

    fn reg_offset(&self, reg: u16) -> Option<usize> {
        match reg {
            0..=63 => Some(GP_OFFSET + reg as usize * 8),
            LR => Some(LR_OFFSET),
            CTR => Some(CTR_OFFSET),
            _ => None,
        }
    }

    fn reg_size(&self, reg: u16) -> usize {
        match reg {
            0..=63 | LR | CTR => 8,
            _ => 0,
        }
    }

    fn pc_offset(&self) -> usize {
        0
    }

    fn sp_reg(&self) -> u16 {
        R1_SP
    }

    fn fbp_reg(&self) -> u16 {
        R31_FP
    }

    fn ra_reg(&self) -> Option<u16> {
        Some(LR)
    }

    fn callee_saved(&self) -> &'static [CalleeSaved] {
        &CALLEE_SAVED
    }

    fn sp_align(&self) -> u64 {
        16
    }

    fn entry_sp_fixup(&self) -> u64 {
        0
    }

    fn ra_offset(&self) -> i64 {
        16
    }

    fn cfa_correction(&self) -> u64 {
        0
    }

    fn fbp_offset(&self) -> u64 {
        0
    }
}
