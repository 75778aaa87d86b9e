//! Top-level rewrite orchestration.
//!
//! A rewrite runs in strict phases: build the two contexts, unwind the source
//! stack to discover live activations and size the destination stack, then
//! re-materialize each frame inner-to-outer, and finally serialize the
//! destination register set. The ordering is load-bearing: a frame must be
//! fully rewritten before the destination pops it, and pointer fixups resolve
//! as the data they target is placed.

use log::{debug, warn};

use crate::data::{
    points_to_data, points_to_stack, put_val, put_val_arch, put_val_data, warn_unresolved_fixups,
};
use crate::error::Error;
use crate::mem;
use crate::metadata::{is_entry_id, Handle, LiveValueRecord};
use crate::unwind::{Context, Fixup};

/// Rewrite a suspended thread's stack from one binary's layout to another's.
///
/// `src_regs` is the captured register blob in the source architecture's
/// layout; `src_stack_base` is the highest address of the source stack. The
/// destination register set is produced into `dest_regs_out` (which must be
/// sized for the destination architecture) and the destination stack is built
/// downward from the end of `dest_stack`.
///
/// # Safety
///
/// The rewrite dereferences addresses found in `src_regs` and in the source
/// binary's metadata. The caller must guarantee that every address in
/// `[SP, src_stack_base)` of the captured thread is readable, that addresses
/// named by `Load64` recipes are readable, and that the captured thread does
/// not run (or its stack otherwise change) for the duration of the call.
pub unsafe fn rewrite_stack(
    src_handle: &Handle,
    src_regs: &[u8],
    src_stack_base: u64,
    dest_handle: &Handle,
    dest_regs_out: &mut [u8],
    dest_stack: &mut [u8],
) -> Result<(), Error> {
    if src_stack_base == 0 {
        return Err(Error::InvalidArgument("source stack base is null"));
    }
    if dest_stack.is_empty() {
        return Err(Error::InvalidArgument("destination stack buffer is empty"));
    }
    if dest_regs_out.len() != dest_handle.arch().regset_size() {
        return Err(Error::InvalidArgument("destination register blob has the wrong size"));
    }

    debug!(
        "initializing rewrite ({} -> {})",
        src_handle.arch().name(),
        dest_handle.arch().name()
    );

    /* Initialize rewriting contexts. */
    // The toolchain lays functions out at the same address in every binary,
    // so the destination resumes at the source function's start address.
    let mut src = Context::source(src_handle, src_regs, src_stack_base)?;
    let func = src_handle.function(src.cur().site.func_index.get())?;
    let func_start = func.addr.get();
    debug!("rewriting destination as if entering function @ {func_start:#x}");
    let mut dest = Context::dest(
        dest_handle,
        dest_stack.as_ptr() as u64 + dest_stack.len() as u64,
        func_start,
    )?;

    unwind_and_size(&mut src, &mut dest, dest_stack)?;

    debug!("rewriting {} activations", src.acts.len());

    /* Rewrite the outermost frame: entry arguments only. */
    src.act = 0;
    dest.act = 0;
    rewrite_frame_outer(&mut src, &mut dest)?;

    let num_acts = src.acts.len();
    if num_acts > 1 {
        dest.set_return_address_funcentry(dest.acts[1].site.addr.get())?;
        dest.pop_frame_funcentry()?;
        // The outermost frame never ran its prologue, so its FBP register
        // still holds the caller's frame pointer.
        let caller_fbp = dest.cur().regs.fbp();
        dest.acts[0].regs.set_fbp(caller_fbp);

        /* Rewrite the remaining frames; the thread-entry frame carries no
         * state to reconstruct. */
        for act in 1..num_acts - 1 {
            debug!("rewriting frame {act}");
            src.act = act;
            rewrite_frame(&mut src, &mut dest)?;

            dest.set_return_address(dest.acts[act + 1].site.addr.get());
            let saved_fbp = dest.saved_fbp_slot()?;
            dest.pop_frame_prepared(true)?;
            // Stitch the destination's dynamic FBP chain together.
            unsafe { mem::write_u64(saved_fbp, dest.cur().regs.fbp()) };
        }
    }

    /* Copy out the destination register state. */
    dest.acts[0].regs.copy_out(dest_regs_out)?;
    warn_unresolved_fixups(&dest);

    debug!("finished rewrite");
    Ok(())
}

/// Phase 3: pop source frames top-to-bottom, pairing each newly discovered
/// call site with its destination twin and accumulating the destination
/// stack size, until the thread-entry site appears. Ends by placing the
/// destination SP and bootstrapping its outermost frame.
fn unwind_and_size(
    src: &mut Context,
    dest: &mut Context,
    dest_stack: &mut [u8],
) -> Result<(), Error> {
    let mut stack_size: u64 = 0;

    while !is_entry_id(src.cur().site.id.get()) {
        src.pop_frame()?;
        let ret_addr = src.cur().regs.pc();

        // Call-site metadata supplies return addresses, frame sizes and
        // frame pointer save locations for both stacks.
        let src_site = *src
            .handle
            .site_by_addr(ret_addr)
            .ok_or(Error::SiteNotFoundByAddr(ret_addr))?;
        let dest_site = *dest
            .handle
            .site_by_id(src_site.id.get())
            .ok_or(Error::SiteNotFoundById(src_site.id.get()))?;

        let sp = src.cur().regs.sp();
        let src_frame_size = src.handle.function(src_site.func_index.get())?.frame_size.get();
        let cfa = sp + src_frame_size as u64 + src.handle.arch().cfa_correction();
        let act = src.cur_mut();
        act.site = src_site;
        act.cfa = cfa;

        let dest_frame_size = dest.handle.function(dest_site.func_index.get())?.frame_size.get();
        stack_size += dest_frame_size as u64;
        dest.push_site(dest_site)?;
    }

    debug!("number of live activations: {}", src.acts.len());
    debug!("destination stack size: {stack_size}");

    let available = dest_stack.len() as u64;
    if stack_size > available {
        return Err(Error::StackOverflow { needed: stack_size, available });
    }

    /* Reset to the outermost frame. */
    src.act = 0;
    dest.act = 0;

    /* Set the destination stack pointer, aligned for function entry. */
    let mut sp = dest.stack_base - stack_size;
    sp = dest.handle.arch().align_sp(sp);
    if sp < dest_stack.as_ptr() as u64 {
        return Err(Error::StackOverflow {
            needed: dest.stack_base - sp,
            available,
        });
    }
    debug!("top of new stack: {sp:#x}");

    dest.bootstrap_funcentry(sp);
    Ok(())
}

/// Phase 4, one frame: copy live values in paired order (applying duplicate
/// destination records), run the destination's arch-specific recipes, then
/// resolve any same-frame pointer fixups.
fn rewrite_frame(src: &mut Context, dest: &mut Context) -> Result<(), Error> {
    debug!(
        "rewriting frame (CFA: {:#x} -> {:#x})",
        src.cur().cfa,
        dest.cur().cfa
    );

    let needs_local_fixup = copy_live_values(src, dest)?;

    /* Set architecture-specific live values. */
    for arch_val in dest.handle.arch_live_slice(&dest.cur().site) {
        put_val_arch(dest, arch_val)?;
    }

    if needs_local_fixup {
        fixup_local_pointers(src, dest)?;
    }
    Ok(())
}

/// The outermost frame is at function entry: only the arguments recorded at
/// the function-start pseudo-site exist, no stack space has been allocated
/// for locals yet, and no arch-specific state needs synthesizing.
fn rewrite_frame_outer(src: &mut Context, dest: &mut Context) -> Result<(), Error> {
    debug!(
        "rewriting outermost frame (CFA: {:#x} -> {:#x})",
        src.cur().cfa,
        dest.cur().cfa
    );

    if copy_live_values(src, dest)? {
        warn!("entry arguments should not point at each other");
    }
    Ok(())
}

/// Walk the source and destination live-value slices in paired order,
/// rewriting each primary and fanning the source value out to duplicate
/// destination records. Returns whether a same-frame fixup was queued.
fn copy_live_values(src: &mut Context, dest: &mut Context) -> Result<bool, Error> {
    let src_vals = src.handle.live_slice(&src.cur().site);
    let dest_vals = dest.handle.live_slice(&dest.cur().site);

    let mut needs_local_fixup = false;
    let mut si = 0;
    let mut di = 0;
    while di < dest_vals.len() {
        if si >= src_vals.len() {
            return Err(Error::TypeMismatch("live value records are not paired"));
        }
        let val_src = &src_vals[si];
        needs_local_fixup |= rewrite_val(src, val_src, dest, &dest_vals[di])?;

        /* Apply the same source value to duplicate destination records. */
        while di + 1 < dest_vals.len() && dest_vals[di + 1].is_duplicate() {
            di += 1;
            needs_local_fixup |= rewrite_val(src, val_src, dest, &dest_vals[di])?;
        }
        /* Source-side duplicates carry no independent data. */
        while si + 1 < src_vals.len() && src_vals[si + 1].is_duplicate() {
            si += 1;
        }
        si += 1;
        di += 1;
    }
    if si != src_vals.len() {
        return Err(Error::TypeMismatch("live value records are not paired"));
    }
    Ok(needs_local_fixup)
}

/// Rewrite one live value. Returns whether a fixup pointing into the current
/// frame was queued.
fn rewrite_val(
    src: &Context,
    val_src: &LiveValueRecord,
    dest: &mut Context,
    val_dest: &LiveValueRecord,
) -> Result<bool, Error> {
    let src_size = val_src.val_size();
    let dest_size = val_dest.val_size();

    // va_list is a different type (and size) per architecture; the compiler
    // cannot pair its bytes across binaries, so those records are skipped.
    if val_src.is_alloca()
        && val_dest.is_alloca()
        && matches!((src_size, dest_size), (24, 32) | (32, 24) | (24, 8) | (8, 24))
    {
        warn!("skipping va_list live value ({src_size} vs. {dest_size} bytes)");
        return Ok(false);
    }

    if src_size != dest_size {
        return Err(Error::SizeMismatch { src: src_size, dest: dest_size });
    }
    if val_src.is_ptr() != val_dest.is_ptr() {
        return Err(Error::TypeMismatch("pointer paired with non-pointer"));
    }
    if val_src.is_alloca() != val_dest.is_alloca() {
        return Err(Error::TypeMismatch("stack allocation paired with non-allocation"));
    }

    let mut needs_local_fixup = false;
    if let Some(stack_addr) = points_to_stack(src, val_src)? {
        if src.act == 0 || stack_addr >= src.acts[src.act - 1].cfa {
            debug!("adding fixup for pointer-to-stack {stack_addr:#x}");
            dest.fixups.push(Fixup {
                src_addr: stack_addr,
                act: dest.act,
                dest_loc: *val_dest,
            });
            /* Pointing at a value within the same frame? */
            if stack_addr < src.cur().cfa {
                needs_local_fixup = true;
            }
        } else {
            // Pointers into frames deeper in the call chain are most likely
            // stale data; leave the destination untouched.
            warn!("pointer-to-stack {stack_addr:#x} points into an already-rewritten frame");
        }
    } else {
        put_val(src, val_src, dest, val_dest)?;
    }

    /* If this value is a stack allocation, earlier frames may hold pointers
     * into it; resolve any that match. */
    if val_src.is_alloca() {
        let mut i = 0;
        while i < dest.fixups.len() {
            let src_addr = dest.fixups[i].src_addr;
            match points_to_data(src, val_src, dest, val_dest, src_addr)? {
                Some(dest_addr) => {
                    let fixup = dest.fixups.remove(i);
                    debug!("found fixup for {src_addr:#x} (in frame {})", fixup.act);
                    put_val_data(dest, &fixup.dest_loc, fixup.act, dest_addr)?;
                }
                None => i += 1,
            }
        }
    }

    Ok(needs_local_fixup)
}

/// Post-frame pass: resolve fixups that point into the frame that was just
/// rewritten (a pointer was processed before the allocation it targets).
fn fixup_local_pointers(src: &Context, dest: &mut Context) -> Result<(), Error> {
    debug!("resolving local fix-ups");

    let src_vals = src.handle.live_slice(&src.cur().site);
    let dest_vals = dest.handle.live_slice(&dest.cur().site);

    let mut i = 0;
    'fixups: while i < dest.fixups.len() {
        let fixup = dest.fixups[i];
        if fixup.src_addr >= src.cur().cfa {
            i += 1;
            continue;
        }
        // Fixups for frames deeper in the call chain should have resolved by
        // now; anything left is likely a pointer to garbage data.
        if fixup.act != dest.act {
            warn!(
                "unresolved fixup for {:#x} (frame {})",
                fixup.src_addr, fixup.act
            );
            i += 1;
            continue;
        }

        let mut si = 0;
        let mut di = 0;
        while si < src_vals.len() && di < dest_vals.len() {
            let val_src = &src_vals[si];
            let val_dest = &dest_vals[di];
            /* Only allocas can be pointed at. */
            if val_src.is_alloca() && val_dest.is_alloca() {
                if let Some(dest_addr) =
                    points_to_data(src, val_src, dest, val_dest, fixup.src_addr)?
                {
                    debug!("found local fixup for {:#x}", fixup.src_addr);
                    dest.fixups.remove(i);
                    put_val_data(dest, &fixup.dest_loc, fixup.act, dest_addr)?;
                    continue 'fixups;
                }
            }
            while si + 1 < src_vals.len() && src_vals[si + 1].is_duplicate() {
                si += 1;
            }
            while di + 1 < dest_vals.len() && dest_vals[di + 1].is_duplicate() {
                di += 1;
            }
            si += 1;
            di += 1;
        }
        i += 1;
    }
    Ok(())
}
