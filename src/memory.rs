//! The memory object capability surface shared by buffers and images.

use std::sync::Arc;

use bitflags::bitflags;

use crate::buffer::Buffer;
use crate::context::{Context, Device};
use crate::error::Result;
use crate::image::Image;

bitflags! {
    /// Access-mode flags declared when a memory object is created.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct MemFlags: u32 {
        const READ_WRITE = 1;
        const WRITE_ONLY = 1 << 1;
        const READ_ONLY = 1 << 2;
    }
}

impl Default for MemFlags {
    fn default() -> Self {
        MemFlags::READ_WRITE
    }
}

bitflags! {
    /// Access-mode flags for an active mapped region.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct MapFlags: u32 {
        const READ = 1;
        const WRITE = 1 << 1;
    }
}

/// A logical block of data that may have physical backing on several devices.
///
/// The two concrete kinds form a closed set, so capability dispatch is by tag
/// rather than a trait object. Handles are shared ownership: cloning retains,
/// dropping releases, and the drop that observes the last reference drives
/// teardown of the underlying storage.
#[derive(Debug, Clone)]
pub enum MemObject {
    Buffer(Arc<Buffer>),
    Image(Arc<Image>),
}

impl MemObject {
    pub fn is_buffer(&self) -> bool {
        matches!(self, MemObject::Buffer(_))
    }

    pub fn is_image(&self) -> bool {
        matches!(self, MemObject::Image(_))
    }

    pub fn context(&self) -> &Arc<Context> {
        match self {
            MemObject::Buffer(buffer) => buffer.context(),
            MemObject::Image(image) => image.context(),
        }
    }

    /// Ensure a native allocation exists for `device`, creating it lazily.
    pub fn allocate_if_needed(&self, device: &Device) -> Result<()> {
        match self {
            MemObject::Buffer(buffer) => buffer.allocate_if_needed(device).map(|_| ()),
            MemObject::Image(image) => image.allocate_if_needed(device),
        }
    }

    /// Ensure `device`'s allocation holds the current contents.
    pub fn migrate_if_needed(&self, device: &Device) -> Result<()> {
        match self {
            MemObject::Buffer(buffer) => buffer.migrate_if_needed(device),
            MemObject::Image(image) => image.migrate_if_needed(device),
        }
    }
}

impl From<Arc<Buffer>> for MemObject {
    fn from(buffer: Arc<Buffer>) -> Self {
        MemObject::Buffer(buffer)
    }
}

impl From<Arc<Image>> for MemObject {
    fn from(image: Arc<Image>) -> Self {
        MemObject::Image(image)
    }
}
