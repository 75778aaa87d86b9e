//! Frame data access: reading and writing live values, the points-to
//! predicates, callee-saved propagation, and the architecture-specific
//! recipe interpreter.

use log::{debug, trace, warn};

use crate::error::Error;
use crate::mem;
use crate::metadata::{ArchLiveValueRecord, Inst, LiveValueRecord, LocationKind};
use crate::unwind::Context;

/// A resolved live-value location: register storage or a stack address.
#[derive(Debug, Clone, Copy)]
enum ValueLoc {
    Reg(u16),
    Addr(u64),
}

/// Resolve a location descriptor against one activation's registers.
/// `Direct` and `Indirect` locations resolve identically for data movement;
/// they differ only in points-to interpretation.
fn val_loc(
    ctx: &Context,
    kind: LocationKind,
    reg: u16,
    offset: i32,
    act: usize,
) -> Result<ValueLoc, Error> {
    match kind {
        LocationKind::Register => Ok(ValueLoc::Reg(reg)),
        LocationKind::Direct | LocationKind::Indirect => {
            let base = ctx.acts[act].regs.read_u64(reg)?;
            Ok(ValueLoc::Addr(base.wrapping_add_signed(offset as i64)))
        }
        LocationKind::Constant | LocationKind::ConstIndex => {
            Err(Error::InvalidMetadata("constants have no addressable location"))
        }
    }
}

fn live_val_loc(ctx: &Context, val: &LiveValueRecord, act: usize) -> Result<ValueLoc, Error> {
    let kind = val
        .kind()
        .ok_or(Error::InvalidMetadata("unknown live value location kind"))?;
    val_loc(ctx, kind, val.reg.get(), val.offset_or_constant.get(), act)
}

/// Write `bytes` to a destination location in activation `act`, propagating
/// callee-saved registers to the outer frame that spilled them.
fn write_dest(ctx: &mut Context, loc: ValueLoc, act: usize, bytes: &[u8]) -> Result<(), Error> {
    match loc {
        ValueLoc::Addr(addr) => {
            unsafe { mem::write(addr, bytes) };
        }
        ValueLoc::Reg(reg) => {
            {
                let dst = ctx.acts[act].regs.reg_mut(reg)?;
                if bytes.len() > dst.len() {
                    return Err(Error::InvalidMetadata("live value larger than its register"));
                }
                dst[..bytes.len()].copy_from_slice(bytes);
            }
            if ctx.handle.arch().is_callee_saved(reg) {
                propagate_callee_saved(ctx, reg, act, bytes)?;
            }
        }
    }
    Ok(())
}

/// Keep the memory-materialized copy of a callee-saved register consistent:
/// find the first inner activation whose prologue spilled `reg` and update
/// its save slot; if none did, the register is still live in the innermost
/// frame's register set.
fn propagate_callee_saved(
    ctx: &mut Context,
    reg: u16,
    act: usize,
    bytes: &[u8],
) -> Result<(), Error> {
    if act == 0 {
        return Ok(());
    }
    for inner in (0..act).rev() {
        if !ctx.acts[inner].callee_saved.is_set(reg) {
            continue;
        }
        let slot = register_save_slot(ctx, inner, reg)?;
        trace!("propagating callee-saved reg {reg} to slot {slot:#x} (frame {inner})");
        unsafe { mem::write(slot, bytes) };
        return Ok(());
    }
    trace!("callee-saved reg {reg} still live in innermost frame");
    let dst = ctx.acts[0].regs.reg_mut(reg)?;
    let n = bytes.len().min(dst.len());
    dst[..n].copy_from_slice(&bytes[..n]);
    Ok(())
}

/// Address of activation `act`'s spill slot for `reg`.
fn register_save_slot(ctx: &Context, act: usize, reg: u16) -> Result<u64, Error> {
    let func = ctx.handle.function(ctx.acts[act].site.func_index.get())?;
    let loc = ctx
        .handle
        .unwind_slice(func)
        .iter()
        .find(|u| u.reg.get() == reg)
        .ok_or(Error::UnwindFailed("callee-saved register has no save slot"))?;
    Ok(ctx.acts[act]
        .regs
        .fbp()
        .wrapping_add_signed(loc.offset.get() as i64))
}

/// Copy one live value from its source location to its destination location.
/// Both contexts must be focused on the same frame.
pub(crate) fn put_val(
    src: &Context,
    src_val: &LiveValueRecord,
    dest: &mut Context,
    dest_val: &LiveValueRecord,
) -> Result<(), Error> {
    debug_assert_eq!(src.act, dest.act);

    // Nothing to copy when the destination regenerates the value itself.
    let dest_kind = dest_val
        .kind()
        .ok_or(Error::InvalidMetadata("unknown live value location kind"))?;
    if matches!(dest_kind, LocationKind::Constant | LocationKind::ConstIndex) {
        trace!("skipping live value (destination is a constant)");
        return Ok(());
    }

    let size = dest_val.val_size() as usize;
    let dest_act = dest.act;
    let dest_loc = val_loc(
        dest,
        dest_kind,
        dest_val.reg.get(),
        dest_val.offset_or_constant.get(),
        dest_act,
    )?;

    let src_kind = src_val
        .kind()
        .ok_or(Error::InvalidMetadata("unknown live value location kind"))?;
    match src_kind {
        LocationKind::Register => {
            let bytes = src.cur().regs.reg(src_val.reg.get())?;
            let n = size.min(bytes.len());
            // Borrow ends before the destination write below.
            let mut word = [0u8; 16];
            word[..n].copy_from_slice(&bytes[..n]);
            write_dest(dest, dest_loc, dest_act, &word[..n])
        }
        LocationKind::Direct | LocationKind::Indirect => {
            let ValueLoc::Addr(src_addr) = live_val_loc(src, src_val, src.act)? else {
                unreachable!();
            };
            match dest_loc {
                ValueLoc::Addr(dest_addr) => {
                    unsafe { mem::copy(src_addr, dest_addr, size) };
                    Ok(())
                }
                ValueLoc::Reg(_) => {
                    if size > 16 {
                        return Err(Error::InvalidMetadata("live value larger than its register"));
                    }
                    let mut word = [0u8; 16];
                    unsafe { mem::read(src_addr, &mut word[..size]) };
                    write_dest(dest, dest_loc, dest_act, &word[..size])
                }
            }
        }
        LocationKind::Constant => {
            if size > 8 {
                return Err(Error::InvalidMetadata("constant live value larger than 8 bytes"));
            }
            let constant = src_val.offset_or_constant.get() as i64;
            trace!("constant live value: {constant}");
            write_dest(dest, dest_loc, dest_act, &constant.to_le_bytes()[..size])
        }
        LocationKind::ConstIndex => {
            Err(Error::InvalidMetadata("constant pool entries are not supported"))
        }
    }
}

/// Write raw data (a reified pointer) into a live value's location in
/// activation `act`.
pub(crate) fn put_val_data(
    dest: &mut Context,
    val: &LiveValueRecord,
    act: usize,
    data: u64,
) -> Result<(), Error> {
    let kind = val
        .kind()
        .ok_or(Error::InvalidMetadata("unknown live value location kind"))?;
    if matches!(kind, LocationKind::Constant | LocationKind::ConstIndex) {
        trace!("skipping fixup write (destination is a constant)");
        return Ok(());
    }
    let loc = val_loc(dest, kind, val.reg.get(), val.offset_or_constant.get(), act)?;
    trace!("fixup write {data:#x} into frame {act}");
    write_dest(dest, loc, act, &data.to_le_bytes())
}

/// If `val` is a pointer onto the source stack, return the pointed-to
/// address.
pub(crate) fn points_to_stack(
    ctx: &Context,
    val: &LiveValueRecord,
) -> Result<Option<u64>, Error> {
    if !val.is_ptr() {
        return Ok(None);
    }
    let kind = val
        .kind()
        .ok_or(Error::InvalidMetadata("unknown live value location kind"))?;
    let addr = match kind {
        LocationKind::Register => ctx.cur().regs.read_u64(val.reg.get())?,
        LocationKind::Direct | LocationKind::Indirect => {
            // The slot holds the pointer; read it.
            let ValueLoc::Addr(slot) = live_val_loc(ctx, val, ctx.act)? else {
                unreachable!();
            };
            unsafe { mem::read_u64(slot) }
        }
        LocationKind::Constant | LocationKind::ConstIndex => {
            return Err(Error::InvalidMetadata(
                "directly-encoded constants are too small to hold stack pointers",
            ));
        }
    };
    if addr >= ctx.stack_top && addr < ctx.stack_base {
        Ok(Some(addr))
    } else {
        Ok(None)
    }
}

/// If `ptr` lands inside the source stack allocation `src_val`, return the
/// equivalent destination address inside `dest_val`.
pub(crate) fn points_to_data(
    src: &Context,
    src_val: &LiveValueRecord,
    dest: &Context,
    dest_val: &LiveValueRecord,
    ptr: u64,
) -> Result<Option<u64>, Error> {
    if src_val.kind() != Some(LocationKind::Direct) || dest_val.kind() != Some(LocationKind::Direct)
    {
        return Ok(None);
    }
    let ValueLoc::Addr(src_addr) = live_val_loc(src, src_val, src.act)? else {
        unreachable!();
    };
    if ptr < src_addr || ptr >= src_addr + src_val.alloca_size.get() as u64 {
        return Ok(None);
    }
    let ValueLoc::Addr(dest_addr) = live_val_loc(dest, dest_val, dest.act)? else {
        unreachable!();
    };
    Ok(Some(dest_addr + (ptr - src_addr)))
}

/// Evaluate one architecture-specific value recipe against the destination
/// context's current frame.
pub(crate) fn put_val_arch(dest: &mut Context, val: &ArchLiveValueRecord) -> Result<(), Error> {
    let dst_kind = val
        .dst_kind()
        .ok_or(Error::BadRecipe("unknown destination location kind"))?;
    if !matches!(dst_kind, LocationKind::Register | LocationKind::Indirect) {
        return Err(Error::BadRecipe("destination must be a register or stack slot"));
    }
    if val.op_size > 8 || val.dst_size > 8 {
        return Err(Error::BadRecipe("operand wider than 8 bytes"));
    }
    let dest_act = dest.act;
    let loc = val_loc(
        dest,
        dst_kind,
        val.dst_reg.get(),
        val.dst_offset.get() as i32,
        dest_act,
    )?;
    let op_kind = val
        .operand_kind()
        .ok_or(Error::BadRecipe("unknown operand location kind"))?;
    let inst = val.inst().ok_or(Error::BadRecipe("unknown instruction kind"))?;

    if val.is_generative() {
        if val.dst_size != val.op_size {
            return Err(Error::BadRecipe("operand and destination sizes differ"));
        }
        // Generated values are 64-bit unsigned; smaller operands were
        // zero-extended when the metadata was emitted.
        let orig = match loc {
            ValueLoc::Reg(reg) => dest.cur().regs.read_u64(reg)?,
            ValueLoc::Addr(addr) => unsafe { mem::read_u64(addr) },
        };
        let operand = match op_kind {
            LocationKind::Register => dest.cur().regs.read_u64(val.op_reg.get())?,
            LocationKind::Constant => val.op_value.get() as u64,
            _ => return Err(Error::BadRecipe("generative operand must be register or constant")),
        };
        let result = apply_inst(inst, orig, operand)?;
        trace!("arch value: {inst:?}({orig:#x}, {operand:#x}) = {result:#x}");
        write_dest(dest, loc, dest_act, &result.to_le_bytes()[..val.dst_size as usize])
    } else {
        let size = val.op_size as usize;
        let mut word = [0u8; 8];
        match op_kind {
            LocationKind::Register => {
                let bytes = dest.cur().regs.reg(val.op_reg.get())?;
                let n = size.min(bytes.len());
                word[..n].copy_from_slice(&bytes[..n]);
            }
            LocationKind::Direct => {
                let base = dest.cur().regs.read_u64(val.op_reg.get())?;
                let slot = base.wrapping_add_signed(val.op_value.get());
                unsafe { mem::read(slot, &mut word[..size]) };
            }
            LocationKind::Indirect => {
                // A reference to the slot, not its contents.
                let base = dest.cur().regs.read_u64(val.op_reg.get())?;
                let slot = base.wrapping_add_signed(val.op_value.get());
                word[..size].copy_from_slice(&slot.to_le_bytes()[..size]);
            }
            LocationKind::Constant => {
                if inst == Inst::Load64 {
                    // Rematerialize a global through its absolute address.
                    let addr = val.op_value.get() as u64;
                    debug!("arch value: load from {addr:#x}");
                    unsafe { mem::read(addr, &mut word) };
                } else {
                    word[..size].copy_from_slice(&val.op_value.get().to_le_bytes()[..size]);
                }
            }
            LocationKind::ConstIndex => {
                return Err(Error::BadRecipe("constant pool entries are not supported"));
            }
        }
        let n = if inst == Inst::Load64 { 8 } else { size };
        write_dest(dest, loc, dest_act, &word[..n])
    }
}

fn apply_inst(inst: Inst, orig: u64, x: u64) -> Result<u64, Error> {
    Ok(match inst {
        Inst::Set => x,
        Inst::Add => orig.wrapping_add(x),
        Inst::Subtract => orig.wrapping_sub(x),
        Inst::Multiply => orig.wrapping_mul(x),
        Inst::Divide => orig.checked_div(x).ok_or(Error::BadRecipe("division by zero"))?,
        Inst::LeftShift => orig.wrapping_shl(x as u32),
        Inst::RightShiftLog => orig.wrapping_shr(x as u32),
        Inst::RightShiftArith => ((orig as i64).wrapping_shr(x as u32)) as u64,
        Inst::Mask => orig & x,
        Inst::Load64 => return Err(Error::BadRecipe("Load64 cannot be generative")),
    })
}

/// Emit a warning for every fixup that never matched a destination value.
/// A stale pointer in source memory can legitimately cause this, so it does
/// not fail the rewrite.
pub(crate) fn warn_unresolved_fixups(ctx: &Context) {
    for fixup in &ctx.fixups {
        warn!(
            "could not find stack pointer fixup for {:#x} (in activation {})",
            fixup.src_addr, fixup.act
        );
    }
}

#[cfg(test)]
mod tests {
    use super::apply_inst;
    use crate::metadata::Inst;

    #[test]
    fn instruction_semantics() {
        assert_eq!(apply_inst(Inst::Set, 5, 3).unwrap(), 3);
        assert_eq!(apply_inst(Inst::Add, 5, 3).unwrap(), 8);
        assert_eq!(apply_inst(Inst::Subtract, 5, 3).unwrap(), 2);
        assert_eq!(apply_inst(Inst::Multiply, 5, 3).unwrap(), 15);
        assert_eq!(apply_inst(Inst::Divide, 6, 3).unwrap(), 2);
        assert_eq!(apply_inst(Inst::LeftShift, 1, 4).unwrap(), 16);
        assert_eq!(apply_inst(Inst::RightShiftLog, u64::MAX, 63).unwrap(), 1);
        assert_eq!(apply_inst(Inst::RightShiftArith, u64::MAX, 63).unwrap(), u64::MAX);
        assert_eq!(apply_inst(Inst::Mask, 0xff, 0x0f).unwrap(), 0x0f);
        assert!(apply_inst(Inst::Divide, 1, 0).is_err());
        assert!(apply_inst(Inst::Load64, 0, 0).is_err());
    }
}
