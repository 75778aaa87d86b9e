//! RISC-V 64 register layout and stack properties.
//!
//! DWARF numbering: 0-31 x0-x31, 32-63 f0-f31; the PC has a dedicated slot.
//! The return address lives in x1 (ra); the prologue's save slot for it sits
//! at CFA - 8. x2 is the stack pointer and x8 (s0) the frame pointer.

use super::{Arch, CalleeSaved};

pub const X1_RA: u16 = 1;
pub const X2_SP: u16 = 2;
pub const X8_FP: u16 = 8;

const GP_OFFSET: usize = 8; // pc slot first

static CALLEE_SAVED: [CalleeSaved; 25] = [
    CalleeSaved { reg: X1_RA, size: 8 },
    CalleeSaved { reg: X8_FP, size: 8 },
    CalleeSaved { reg: 9, size: 8 },
    CalleeSaved { reg: 18, size: 8 },
    CalleeSaved { reg: 19, size: 8 },
    CalleeSaved { reg: 20, size: 8 },
    CalleeSaved { reg: 21, size: 8 },
    CalleeSaved { reg: 22, size: 8 },
    CalleeSaved { reg: 23, size: 8 },
    CalleeSaved { reg: 24, size: 8 },
    CalleeSaved { reg: 25, size: 8 },
    CalleeSaved { reg: 26, size: 8 },
    CalleeSaved { reg: 27, size: 8 },
    // fs0-fs11
    CalleeSaved { reg: 40, size: 8 },
    CalleeSaved { reg: 41, size: 8 },
    CalleeSaved { reg: 50, size: 8 },
    CalleeSaved { reg: 51, size: 8 },
    CalleeSaved { reg: 52, size: 8 },
    CalleeSaved { reg: 53, size: 8 },
    CalleeSaved { reg: 54, size: 8 },
    CalleeSaved { reg: 55, size: 8 },
    CalleeSaved { reg: 56, size: 8 },
    CalleeSaved { reg: 57, size: 8 },
    CalleeSaved { reg: 58, size: 8 },
    CalleeSaved { reg: 59, size: 8 },
];

#[derive(Debug)]
pub struct Riscv64;

impl Arch for Riscv64 {
    fn name(&self) -> &'static str {
        "riscv64"
    }

    fn num_regs(&self) -> u16 {
        64
    }

    fn regset_size(&self) -> usize {
        GP_OFFSET + 64 * 8
    }

    fn reg_offset(&self, reg: u16) -> Option<usize> {
        if reg < 64 {
            Some(GP_OFFSET + reg as usize * 8)
        } else {
            None
        }
    }

    fn reg_size(&self, reg: u16) -> usize {
        if reg < 64 {
            8
        } else {
            0
        }
    }

    fn pc_offset(&self) -> usize {
        0
    }

    fn sp_reg(&self) -> u16 {
        X2_SP
    }

    fn fbp_reg(&self) -> u16 {
        X8_FP
    }

    fn ra_reg(&self) -> Option<u16> {
        Some(X1_RA)
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
        -8
    }

    fn cfa_correction(&self) -> u64 {
        0
    }

    fn fbp_offset(&self) -> u64 {
        16
    }
}
