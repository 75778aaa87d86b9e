//! AArch64 register layout and stack properties.
//!
//! DWARF numbering: 0-30 x0-x30, 31 sp, 64-95 v0-v31; the PC has no DWARF
//! number and gets a dedicated slot at the start of the blob. The return
//! address lives in x30 (the link register); once the prologue has stored
//! the fp/lr pair, the saved copy sits at CFA - 8.

use super::{Arch, CalleeSaved};

pub const X29_FP: u16 = 29;
pub const X30_LR: u16 = 30;
pub const SP: u16 = 31;

const V_BASE: u16 = 64;
const NUM_V: u16 = 32;
const GP_OFFSET: usize = 8; // pc slot first
const V_OFFSET: usize = GP_OFFSET + 32 * 8;

static CALLEE_SAVED: [CalleeSaved; 20] = [
    CalleeSaved { reg: 19, size: 8 },
    CalleeSaved { reg: 20, size: 8 },
    CalleeSaved { reg: 21, size: 8 },
    CalleeSaved { reg: 22, size: 8 },
    CalleeSaved { reg: 23, size: 8 },
    CalleeSaved { reg: 24, size: 8 },
    CalleeSaved { reg: 25, size: 8 },
    CalleeSaved { reg: 26, size: 8 },
    CalleeSaved { reg: 27, size: 8 },
    CalleeSaved { reg: 28, size: 8 },
    CalleeSaved { reg: X29_FP, size: 8 },
    CalleeSaved { reg: X30_LR, size: 8 },
    // v8-v15: only the low 8 bytes are preserved.
    CalleeSaved { reg: 72, size: 8 },
    CalleeSaved { reg: 73, size: 8 },
    CalleeSaved { reg: 74, size: 8 },
    CalleeSaved { reg: 75, size: 8 },
    CalleeSaved { reg: 76, size: 8 },
    CalleeSaved { reg: 77, size: 8 },
    CalleeSaved { reg: 78, size: 8 },
    CalleeSaved { reg: 79, size: 8 },
];

#[derive(Debug)]
pub struct Aarch64;

impl Arch for Aarch64 {
    fn name(&self) -> &'static str {
        "aarch64"
    }

    fn num_regs(&self) -> u16 {
        V_BASE + NUM_V
    }

    fn regset_size(&self) -> usize {
        V_OFFSET + NUM_V as usize * 16
    }

    fn reg_offset(&self, reg: u16) -> Option<usize> {
        if reg <= SP {
            Some(GP_OFFSET + reg as usize * 8)
        } else if (V_BASE..V_BASE + NUM_V).contains(&reg) {
            Some(V_OFFSET + (reg - V_BASE) as usize * 16)
        } else {
            None
        }
    }

    fn reg_size(&self, reg: u16) -> usize {
        if reg <= SP {
            8
        } else if (V_BASE..V_BASE + NUM_V).contains(&reg) {
            16
        } else {
            0
        }
    }

    fn pc_offset(&self) -> usize {
        0
    }

    fn sp_reg(&self) -> u16 {
        SP
    }

    fn fbp_reg(&self) -> u16 {
        X29_FP
    }

    fn ra_reg(&self) -> Option<u16> {
        Some(X30_LR)
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
