//! x86-64 register layout and stack properties.
//!
//! DWARF numbering: 0 rax, 1 rdx, 2 rcx, 3 rbx, 4 rsi, 5 rdi, 6 rbp, 7 rsp,
//! 8-15 r8-r15, 16 return-address column (rip), 17-32 xmm0-xmm15. The PC
//! shares the register-16 slot. The return address lives on the stack at
//! CFA - 8, and stackmap frame sizes exclude it, hence the +8 CFA correction.

use super::{Arch, CalleeSaved};

pub const RAX: u16 = 0;
pub const RDX: u16 = 1;
pub const RCX: u16 = 2;
pub const RBX: u16 = 3;
pub const RSI: u16 = 4;
pub const RDI: u16 = 5;
pub const RBP: u16 = 6;
pub const RSP: u16 = 7;
pub const RIP: u16 = 16;

const NUM_GP: u16 = 17; // rax..r15 + rip
const NUM_XMM: u16 = 16;
const XMM_BASE: u16 = 17;
const XMM_OFFSET: usize = NUM_GP as usize * 8;

static CALLEE_SAVED: [CalleeSaved; 6] = [
    CalleeSaved { reg: RBX, size: 8 },
    CalleeSaved { reg: RBP, size: 8 },
    CalleeSaved { reg: 12, size: 8 },
    CalleeSaved { reg: 13, size: 8 },
    CalleeSaved { reg: 14, size: 8 },
    CalleeSaved { reg: 15, size: 8 },
];

#[derive(Debug)]
pub struct X86_64;

impl Arch for X86_64 {
    fn name(&self) -> &'static str {
        "x86-64"
    }

    fn num_regs(&self) -> u16 {
        NUM_GP + NUM_XMM
    }

    fn regset_size(&self) -> usize {
        XMM_OFFSET + NUM_XMM as usize * 16
    }

    fn reg_offset(&self, reg: u16) -> Option<usize> {
        if reg < NUM_GP {
            Some(reg as usize * 8)
        } else if reg < NUM_GP + NUM_XMM {
            Some(XMM_OFFSET + (reg - XMM_BASE) as usize * 16)
        } else {
            None
        }
    }

    fn reg_size(&self, reg: u16) -> usize {
        if reg < NUM_GP {
            8
        } else if reg < NUM_GP + NUM_XMM {
            16
        } else {
            0
        }
    }

    fn pc_offset(&self) -> usize {
        RIP as usize * 8
    }

    fn sp_reg(&self) -> u16 {
        RSP
    }

    fn fbp_reg(&self) -> u16 {
        RBP
    }

    fn ra_reg(&self) -> Option<u16> {
        None
    }

    fn callee_saved(&self) -> &'static [CalleeSaved] {
        &CALLEE_SAVED
    }

    fn sp_align(&self) -> u64 {
        16
    }

    fn entry_sp_fixup(&self) -> u64 {
        8
    }

    fn ra_offset(&self) -> i64 {
        -8
    }

    fn cfa_correction(&self) -> u64 {
        8
    }

    fn fbp_offset(&self) -> u64 {
        16
    }
}
