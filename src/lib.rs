//! Memory objects for multi-device accelerator contexts.
//!
//! A memory object is a logical block of data that may need a physical
//! allocation on several devices of one context at the same time. Allocations
//! are made lazily per device, contents are kept consistent by tracking the
//! completion event of the last write and migrating on demand, and host
//! access goes through an exclusive map/unmap window. The `buffer` module is
//! the engine; `image` is the simpler single-device variant.
//!
//! The device driver is a trait boundary (`driver::DeviceDriver`); the crate
//! ships `HostDriver`, an in-process host-memory implementation used by
//! CPU-only contexts and the test suite.

pub mod buffer;
pub mod context;
pub mod driver;
pub mod error;
pub mod image;
pub mod memory;

#[cfg(test)]
pub mod test;

pub use buffer::{AllocMode, Buffer};
pub use context::{Context, Device, Event};
pub use driver::{DeviceDriver, DevicePtr, HostDriver, HostPtr, SurfaceHandle};
pub use error::{Error, Result};
pub use image::{ChannelType, Image, ImageDesc, ImageKind};
pub use memory::{MapFlags, MemFlags, MemObject};
