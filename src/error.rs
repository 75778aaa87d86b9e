use std::path::PathBuf;

use thiserror::Error;

/// The error type used in this crate.
///
/// Loader faults (`OpenFile` through `InvalidMetadata`) can only occur while
/// a [`Handle`](crate::Handle) is being initialized; everything else aborts
/// an in-flight rewrite, whose transient state is dropped before the error
/// is returned.
#[derive(Error, Debug)]
#[non_exhaustive]
pub enum Error {
    #[error("Invalid argument: {0}")]
    InvalidArgument(&'static str),

    #[error("Could not open {0}: {1}")]
    OpenFile(PathBuf, #[source] std::io::Error),

    #[error("Object could not parse the file as ELF: {0}")]
    InvalidElf(#[source] object::read::Error),

    #[error("ELF machine type {0:?} has no registered architecture descriptor")]
    UnsupportedArch(object::Architecture),

    #[error("Required metadata section {0} is missing")]
    MissingSection(&'static str),

    #[error("Section {0} size is not a multiple of its record size")]
    SectionTooSmall(&'static str),

    #[error("Metadata validation failed: {0}")]
    InvalidMetadata(&'static str),

    #[error("No call site record for return address {0:#x}")]
    SiteNotFoundByAddr(u64),

    #[error("No call site record for ID {0}")]
    SiteNotFoundById(u64),

    #[error("Unwind failed: {0}")]
    UnwindFailed(&'static str),

    #[error("Live value sizes differ between binaries ({src} vs. {dest})")]
    SizeMismatch { src: u32, dest: u32 },

    #[error("Live value records disagree between binaries: {0}")]
    TypeMismatch(&'static str),

    #[error("Rewrite exceeded its stack resources (needed {needed}, available {available})")]
    StackOverflow { needed: u64, available: u64 },

    #[error("Register {0} has no slot in the architecture descriptor")]
    BadRegister(u16),

    #[error("Malformed architecture-specific value recipe: {0}")]
    BadRecipe(&'static str),
}
