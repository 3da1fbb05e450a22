use snafu::Snafu;

use crate::buffer::AllocMode;
use crate::memory::MemFlags;

pub type Result<T, E = Error> = std::result::Result<T, E>;

#[derive(Debug, Snafu)]
#[snafu(visibility(pub))]
pub enum Error {
    /// Driver could not satisfy a device storage request.
    #[snafu(display("allocation of {size} bytes failed on device {device}: {reason}"))]
    AllocationFailed { device: usize, size: usize, reason: String },

    /// Driver could not satisfy a pinned host allocation.
    #[snafu(display("pinned host allocation of {size} bytes failed: {reason}"))]
    PinnedAllocationFailed { size: usize, reason: String },

    #[snafu(display("size mismatch: expected {expected}, got {actual}"))]
    SizeMismatch { expected: usize, actual: usize },

    /// Requested sub-region does not fit inside the parent object.
    #[snafu(display("invalid region: origin {origin} + size {size} exceeds buffer size {buffer_size}"))]
    InvalidRegion { origin: usize, size: usize, buffer_size: usize },

    #[snafu(display("invalid device index {index} for context with {count} devices"))]
    InvalidDevice { index: usize, count: usize },

    #[snafu(display("memory object size must be non-zero"))]
    ZeroSized,

    #[snafu(display("allocation mode {mode:?} requires a host pointer"))]
    MissingHostPointer { mode: AllocMode },

    #[snafu(display("allocation mode {mode:?} does not accept a host pointer"))]
    UnexpectedHostPointer { mode: AllocMode },

    /// Sub-buffer access flags must be a subset of what the parent permits.
    #[snafu(display("sub-buffer flags {flags:?} conflict with parent flags {parent:?}"))]
    IncompatibleFlags { flags: MemFlags, parent: MemFlags },

    #[snafu(display("sub-buffers cannot be partitioned further"))]
    NestedSubBuffer,

    #[snafu(display("copy of {size} bytes failed: {reason}"))]
    CopyFailed { size: usize, reason: String },

    /// Storage release failed; teardown continues past this and reports it.
    #[snafu(display("release of device {device} storage failed: {reason}"))]
    ReleaseFailed { device: usize, reason: String },

    /// Address does not resolve to a live driver allocation.
    #[snafu(display("address {addr:#x} does not belong to a live allocation"))]
    UnknownAddress { addr: u64 },
}
