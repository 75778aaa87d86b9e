//! Frame unwinding and the per-rewrite context.
//!
//! A [`Context`] tracks one side of a rewrite: the activation list, the
//! current activation index, and the stack bounds. Popping a frame clones the
//! current register set, restores the registers the frame's prologue spilled
//! (per the function's unwind slice), recovers the return address, and moves
//! the stack pointer to the current frame's CFA.
//!
//! Two variants exist for frames that are conceptually *at function entry*,
//! before any prologue has run: they touch neither the frame base pointer nor
//! the spill slots, because neither is set up yet.

use log::{debug, trace};
use zerocopy::FromZeros;

use crate::bitmap::RegBitmap;
use crate::error::Error;
use crate::mem;
use crate::metadata::{CallSiteRecord, Handle, LiveValueRecord};
use crate::regset::RegSet;

/// Hard cap on live activations per rewrite; the activation pool is sized for
/// this many up front so the rewrite itself never allocates per frame.
pub const MAX_FRAMES: usize = 512;

/// A deferred pointer-resolution record: a source-stack pointer whose
/// destination value is unknown until the pointed-to data is placed.
#[derive(Debug, Clone, Copy)]
pub(crate) struct Fixup {
    pub src_addr: u64,
    pub act: usize,
    pub dest_loc: LiveValueRecord,
}

/// One stack frame's worth of rewrite state.
pub(crate) struct Activation {
    pub site: CallSiteRecord,
    pub cfa: u64,
    pub regs: RegSet,
    /// Callee-saved registers this frame's prologue spilled.
    pub callee_saved: RegBitmap,
}

/// One side (source or destination) of an in-flight rewrite. Never shared;
/// lives on the rewriting thread's stack for the duration of one call.
pub(crate) struct Context<'h> {
    pub handle: &'h Handle,
    /// Highest stack address.
    pub stack_base: u64,
    /// Lowest stack address (the innermost frame's SP).
    pub stack_top: u64,
    pub acts: Vec<Activation>,
    pub act: usize,
    pub fixups: Vec<Fixup>,
}

impl<'h> Context<'h> {
    /// Build the source context from the captured register blob. The
    /// outermost PC is mid-function, so an exact call-site hit is optional;
    /// the enclosing function's start pseudo-site is the fallback.
    pub fn source(handle: &'h Handle, regs: &[u8], stack_base: u64) -> Result<Self, Error> {
        let regs = RegSet::from_bytes(handle.arch(), regs)?;
        let pc = regs.pc();
        // A PC that is not itself a recorded migration point falls back to
        // the enclosing function's start pseudo-site; the frame size then
        // comes from the function record, since the frame is fully built.
        let (site, frame_size) = match handle.site_by_addr(pc) {
            Some(site) => {
                let func = handle.function(site.func_index.get())?;
                (*site, func.frame_size.get())
            }
            None => {
                let (_, func) = handle
                    .function_for_pc(pc)
                    .ok_or(Error::SiteNotFoundByAddr(pc))?;
                let site = *handle
                    .site_by_addr(func.addr.get())
                    .ok_or(Error::SiteNotFoundByAddr(func.addr.get()))?;
                (site, func.frame_size.get())
            }
        };
        let sp = regs.sp();
        if sp == 0 || sp >= stack_base {
            return Err(Error::InvalidArgument("captured SP is outside the stack"));
        }
        let cfa = sp + frame_size as u64 + handle.arch().cfa_correction();
        debug!("source context: pc={pc:#x} sp={sp:#x} cfa={cfa:#x} site={}", site.id.get());

        let mut acts = Vec::with_capacity(MAX_FRAMES);
        let num_regs = handle.arch().num_regs();
        acts.push(Activation {
            site,
            cfa,
            regs,
            callee_saved: RegBitmap::new(num_regs),
        });
        Ok(Context {
            handle,
            stack_base,
            stack_top: sp,
            acts,
            act: 0,
            fixups: Vec::new(),
        })
    }

    /// Build the destination context. `pc` is the start address of the
    /// function the thread resumes in; its stack pointer is unknown until
    /// unwind-and-size finishes.
    pub fn dest(handle: &'h Handle, stack_base: u64, pc: u64) -> Result<Self, Error> {
        let site = *handle.site_by_addr(pc).ok_or(Error::SiteNotFoundByAddr(pc))?;
        let mut regs = RegSet::new(handle.arch());
        regs.set_pc(pc);
        debug!("destination context: pc={pc:#x} stack base={stack_base:#x}");

        let mut acts = Vec::with_capacity(MAX_FRAMES);
        let num_regs = handle.arch().num_regs();
        acts.push(Activation {
            site,
            cfa: 0,
            regs,
            callee_saved: RegBitmap::new(num_regs),
        });
        Ok(Context {
            handle,
            stack_base,
            stack_top: 0,
            acts,
            act: 0,
            fixups: Vec::new(),
        })
    }

    pub fn cur(&self) -> &Activation {
        &self.acts[self.act]
    }

    pub fn cur_mut(&mut self) -> &mut Activation {
        &mut self.acts[self.act]
    }

    fn check_pool(&self) -> Result<(), Error> {
        if self.acts.len() >= MAX_FRAMES {
            return Err(Error::StackOverflow {
                needed: self.acts.len() as u64 + 1,
                available: MAX_FRAMES as u64,
            });
        }
        Ok(())
    }

    /// Append a site-only activation for a frame whose registers will be
    /// materialized later (destination side of unwind-and-size). Does not
    /// advance the activation index.
    pub fn push_site(&mut self, site: CallSiteRecord) -> Result<(), Error> {
        self.check_pool()?;
        let num_regs = self.handle.arch().num_regs();
        self.acts.push(Activation {
            site,
            cfa: 0,
            regs: RegSet::new(self.handle.arch()),
            callee_saved: RegBitmap::new(num_regs),
        });
        Ok(())
    }

    /// Pop the current source frame: produce the next outer activation's
    /// register set with callee-saved registers restored from their spill
    /// slots. The caller assigns the new activation's site and CFA once the
    /// return address has been matched to a call site.
    pub fn pop_frame(&mut self) -> Result<(), Error> {
        self.check_pool()?;
        let mut next_regs = self.cur().regs.clone();
        self.restore_callee_saved(&mut next_regs)?;
        self.finish_pop(&mut next_regs);
        let num_regs = self.handle.arch().num_regs();
        self.acts.push(Activation {
            site: CallSiteRecord::new_zeroed(),
            cfa: 0,
            regs: next_regs,
            callee_saved: RegBitmap::new(num_regs),
        });
        self.act += 1;
        Ok(())
    }

    /// Pop the current destination frame into the next, already-sited
    /// activation. `fixup_fbp` synthesizes the new frame's FBP from its CFA;
    /// destination frames need this because their own spill slots have not
    /// been written yet.
    pub fn pop_frame_prepared(&mut self, fixup_fbp: bool) -> Result<(), Error> {
        debug_assert!(self.act + 1 < self.acts.len());
        let mut next_regs = self.cur().regs.clone();
        self.restore_callee_saved(&mut next_regs)?;
        self.finish_pop(&mut next_regs);
        self.act += 1;
        let arch = self.handle.arch();
        let site = self.cur().site;
        let frame_size = self.handle.function(site.func_index.get())?.frame_size.get();
        let cfa = next_regs.sp() + frame_size as u64 + arch.cfa_correction();
        if fixup_fbp {
            next_regs.set_fbp(cfa - arch.fbp_offset());
        }
        let act = self.cur_mut();
        act.regs = next_regs;
        act.cfa = cfa;
        Ok(())
    }

    /// Pop a frame that is still at function entry: no prologue has run, so
    /// nothing is restored from memory and the FBP keeps the caller's value.
    pub fn pop_frame_funcentry(&mut self) -> Result<(), Error> {
        debug_assert!(self.act + 1 < self.acts.len());
        let mut next_regs = self.cur().regs.clone();
        self.finish_pop(&mut next_regs);
        self.act += 1;
        let arch = self.handle.arch();
        let site = self.cur().site;
        let frame_size = self.handle.function(site.func_index.get())?.frame_size.get();
        let cfa = next_regs.sp() + frame_size as u64 + arch.cfa_correction();
        next_regs.set_fbp(cfa - arch.fbp_offset());
        let act = self.cur_mut();
        act.regs = next_regs;
        act.cfa = cfa;
        Ok(())
    }

    /// Restore the registers the current frame's prologue spilled and record
    /// them in the activation's callee-saved bitmap.
    fn restore_callee_saved(&mut self, next_regs: &mut RegSet) -> Result<(), Error> {
        let handle = self.handle;
        let arch = handle.arch();
        let func = handle.function(self.cur().site.func_index.get())?;
        let slice = handle.unwind_slice(func);
        let fbp = self.cur().regs.fbp();
        for saved in arch.callee_saved() {
            let Some(loc) = slice.iter().find(|u| u.reg.get() == saved.reg) else {
                continue;
            };
            let addr = fbp.wrapping_add_signed(loc.offset.get() as i64);
            let dst = next_regs.reg_mut(saved.reg)?;
            let size = (saved.size as usize).min(dst.len());
            unsafe { mem::read(addr, &mut dst[..size]) };
            self.cur_mut().callee_saved.set(saved.reg);
            trace!("restored callee-saved reg {} from {addr:#x}", saved.reg);
        }
        Ok(())
    }

    /// Shared tail of every pop: recover the return address into the PC and
    /// move the SP to the current frame's CFA.
    fn finish_pop(&self, next_regs: &mut RegSet) {
        let arch = self.handle.arch();
        let cfa = self.cur().cfa;
        let ra = if arch.ra_reg().is_some() {
            next_regs.ra_reg()
        } else {
            unsafe { mem::read_u64(cfa.wrapping_add_signed(arch.ra_offset())) }
        };
        next_regs.set_pc(ra);
        next_regs.set_sp(cfa);
        trace!("popped frame: ra={ra:#x} sp={cfa:#x}");
    }

    /// Write the current frame's return address through its stack slot.
    pub fn set_return_address(&mut self, retaddr: u64) {
        let slot = self
            .cur()
            .cfa
            .wrapping_add_signed(self.handle.arch().ra_offset());
        unsafe { mem::write_u64(slot, retaddr) };
    }

    /// Function-entry variant: the return address goes in the RA register
    /// when the architecture has one, otherwise in the stack slot the call
    /// just pushed.
    pub fn set_return_address_funcentry(&mut self, retaddr: u64) -> Result<(), Error> {
        if self.handle.arch().ra_reg().is_some() {
            self.cur_mut().regs.set_ra_reg(retaddr)
        } else {
            self.set_return_address(retaddr);
            Ok(())
        }
    }

    /// Address of the slot where the current frame's prologue saved the
    /// caller's frame pointer.
    pub fn saved_fbp_slot(&self) -> Result<u64, Error> {
        let arch = self.handle.arch();
        let func = self.handle.function(self.cur().site.func_index.get())?;
        let slice = self.handle.unwind_slice(func);
        // The frame pointer tends to sit at the end of the slice.
        let loc = slice
            .iter()
            .rev()
            .find(|u| u.reg.get() == arch.fbp_reg())
            .ok_or(Error::UnwindFailed("no saved frame pointer in unwind records"))?;
        Ok(self.cur().regs.fbp().wrapping_add_signed(loc.offset.get() as i64))
    }

    /// Set up the destination's outermost frame once the stack pointer is
    /// known. The frame is at function entry: CFA and FBP are synthesized.
    pub fn bootstrap_funcentry(&mut self, sp: u64) {
        let arch = self.handle.arch();
        let site = self.cur().site;
        let frame_size = self
            .handle
            .function(site.func_index.get())
            .expect("call-site func_index is validated at load time")
            .frame_size
            .get();
        let cfa = sp + frame_size as u64 + arch.cfa_correction();
        let fbp = cfa - arch.fbp_offset();
        self.stack_top = sp;
        let act = self.cur_mut();
        act.regs.set_sp(sp);
        act.regs.set_fbp(fbp);
        act.cfa = cfa;
        debug!("destination bootstrap: sp={sp:#x} cfa={cfa:#x} fbp={fbp:#x}");
    }
}
