//! Flat register blobs.
//!
//! A `RegSet` pairs an architecture descriptor with the descriptor's flat
//! byte layout. The rewrite engine clones one per activation (out of a
//! pre-sized pool in the context), and callers use the same type to assemble
//! the captured source registers and to pick apart the produced destination
//! registers.

use crate::arch::Arch;
use crate::error::Error;

#[derive(Clone)]
pub struct RegSet {
    arch: &'static dyn Arch,
    data: Box<[u8]>,
}

impl RegSet {
    /// An all-zero register set.
    pub fn new(arch: &'static dyn Arch) -> Self {
        RegSet {
            arch,
            data: vec![0; arch.regset_size()].into_boxed_slice(),
        }
    }

    /// A register set initialized from a flat blob of the architecture's
    /// layout.
    pub fn from_bytes(arch: &'static dyn Arch, blob: &[u8]) -> Result<Self, Error> {
        if blob.len() != arch.regset_size() {
            return Err(Error::InvalidArgument("register blob has the wrong size"));
        }
        let mut set = RegSet::new(arch);
        set.data.copy_from_slice(blob);
        Ok(set)
    }

    pub fn arch(&self) -> &'static dyn Arch {
        self.arch
    }

    /// Serialize into a caller-provided flat blob.
    pub fn copy_out(&self, blob: &mut [u8]) -> Result<(), Error> {
        if blob.len() != self.data.len() {
            return Err(Error::InvalidArgument("register blob has the wrong size"));
        }
        blob.copy_from_slice(&self.data);
        Ok(())
    }

    pub fn pc(&self) -> u64 {
        let off = self.arch.pc_offset();
        u64::from_le_bytes(self.data[off..off + 8].try_into().unwrap())
    }

    pub fn set_pc(&mut self, pc: u64) {
        let off = self.arch.pc_offset();
        self.data[off..off + 8].copy_from_slice(&pc.to_le_bytes());
    }

    pub fn sp(&self) -> u64 {
        self.read_u64(self.arch.sp_reg()).unwrap_or(0)
    }

    pub fn set_sp(&mut self, sp: u64) {
        let _ = self.write_u64(self.arch.sp_reg(), sp);
    }

    pub fn fbp(&self) -> u64 {
        self.read_u64(self.arch.fbp_reg()).unwrap_or(0)
    }

    pub fn set_fbp(&mut self, fbp: u64) {
        let _ = self.write_u64(self.arch.fbp_reg(), fbp);
    }

    /// Value of the return-address register, or 0 for stack-RA ABIs.
    pub fn ra_reg(&self) -> u64 {
        match self.arch.ra_reg() {
            Some(reg) => self.read_u64(reg).unwrap_or(0),
            None => 0,
        }
    }

    pub fn set_ra_reg(&mut self, ra: u64) -> Result<(), Error> {
        match self.arch.ra_reg() {
            Some(reg) => self.write_u64(reg, ra),
            None => Err(Error::InvalidArgument("architecture has no return-address register")),
        }
    }

    /// Borrow a numbered register's storage.
    pub fn reg(&self, reg: u16) -> Result<&[u8], Error> {
        let range = self.arch.reg_range(reg).ok_or(Error::BadRegister(reg))?;
        Ok(&self.data[range])
    }

    pub fn reg_mut(&mut self, reg: u16) -> Result<&mut [u8], Error> {
        let range = self.arch.reg_range(reg).ok_or(Error::BadRegister(reg))?;
        Ok(&mut self.data[range])
    }

    /// Read a register's low 64 bits (zero-extending smaller registers).
    pub fn read_u64(&self, reg: u16) -> Result<u64, Error> {
        let bytes = self.reg(reg)?;
        let mut word = [0u8; 8];
        let n = bytes.len().min(8);
        word[..n].copy_from_slice(&bytes[..n]);
        Ok(u64::from_le_bytes(word))
    }

    /// Write a register's low 64 bits, leaving any wider lanes untouched.
    pub fn write_u64(&mut self, reg: u16, value: u64) -> Result<(), Error> {
        let bytes = self.reg_mut(reg)?;
        let n = bytes.len().min(8);
        bytes[..n].copy_from_slice(&value.to_le_bytes()[..n]);
        Ok(())
    }
}

impl std::fmt::Debug for RegSet {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RegSet")
            .field("arch", &self.arch.name())
            .field("pc", &format_args!("{:#x}", self.pc()))
            .field("sp", &format_args!("{:#x}", self.sp()))
            .field("fbp", &format_args!("{:#x}", self.fbp()))
            .finish()
    }
}
