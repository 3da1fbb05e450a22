//! Single-device image surfaces.
//!
//! Images are the simple memory object variant: one device-resident surface,
//! materialized once on the first device of the context, with no per-device
//! replication or migration tracking.

use std::sync::Arc;

use parking_lot::Mutex;
use tracing::{debug, error, trace};

use crate::context::{Context, Device};
use crate::driver::SurfaceHandle;
use crate::error::{Result, SizeMismatchSnafu, ZeroSizedSnafu};
use crate::memory::MemFlags;

/// Per-channel storage type. Images always carry four (RGBA) channels.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelType {
    U8,
    I8,
    U16,
    I16,
    F16,
    U32,
    I32,
    F32,
}

impl ChannelType {
    pub fn bytes(self) -> usize {
        match self {
            ChannelType::U8 | ChannelType::I8 => 1,
            ChannelType::U16 | ChannelType::I16 | ChannelType::F16 => 2,
            ChannelType::U32 | ChannelType::I32 | ChannelType::F32 => 4,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ImageKind {
    D1,
    D2,
    D3,
}

/// Image dimensions. Unused dimensions must be 1.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ImageDesc {
    pub kind: ImageKind,
    pub width: usize,
    pub height: usize,
    pub depth: usize,
}

impl ImageDesc {
    pub fn d1(width: usize) -> Self {
        Self { kind: ImageKind::D1, width, height: 1, depth: 1 }
    }

    pub fn d2(width: usize, height: usize) -> Self {
        Self { kind: ImageKind::D2, width, height, depth: 1 }
    }

    pub fn d3(width: usize, height: usize, depth: usize) -> Self {
        Self { kind: ImageKind::D3, width, height, depth }
    }

    pub fn pixel_count(&self) -> usize {
        self.width * self.height * self.depth
    }
}

/// A single-device image surface.
#[derive(Debug)]
pub struct Image {
    context: Arc<Context>,
    flags: MemFlags,
    channel: ChannelType,
    desc: ImageDesc,
    /// Initial contents, uploaded once when the surface is materialized.
    host_data: Option<Box<[u8]>>,
    surface: Mutex<Option<SurfaceHandle>>,
}

impl Image {
    /// Create an image over `context` with four `channel`-typed channels.
    ///
    /// `host_data`, when given, must hold exactly one full image worth of
    /// bytes; it is uploaded when the surface is first materialized.
    pub fn new(
        context: Arc<Context>,
        flags: MemFlags,
        channel: ChannelType,
        desc: ImageDesc,
        host_data: Option<&[u8]>,
    ) -> Result<Arc<Self>> {
        snafu::ensure!(desc.pixel_count() != 0, ZeroSizedSnafu);
        let byte_size = desc.pixel_count() * channel.bytes() * 4;
        if let Some(data) = host_data {
            snafu::ensure!(data.len() == byte_size, SizeMismatchSnafu { expected: byte_size, actual: data.len() });
        }

        let image = Arc::new(Self {
            context,
            flags,
            channel,
            desc,
            host_data: host_data.map(|data| data.to_vec().into_boxed_slice()),
            surface: Mutex::new(None),
        });

        // A single-device context can materialize right away.
        if image.context.device_count() == 1 {
            image.allocate_if_needed(&image.context.devices()[0].clone())?;
        }

        Ok(image)
    }

    pub fn context(&self) -> &Arc<Context> {
        &self.context
    }

    pub fn flags(&self) -> MemFlags {
        self.flags
    }

    pub fn channel(&self) -> ChannelType {
        self.channel
    }

    pub fn desc(&self) -> &ImageDesc {
        &self.desc
    }

    /// Total surface size in bytes (four channels per pixel).
    pub fn byte_size(&self) -> usize {
        self.desc.pixel_count() * self.channel.bytes() * 4
    }

    /// The materialized surface handle, if any.
    pub fn surface(&self) -> Option<SurfaceHandle> {
        *self.surface.lock()
    }

    /// Materialize the surface if it does not exist yet.
    ///
    /// Images live on the first device of the context regardless of which
    /// device asks; there is no per-device replication for surfaces.
    pub fn allocate_if_needed(&self, _device: &Device) -> Result<()> {
        let mut surface = self.surface.lock();
        if surface.is_some() {
            trace!("surface already materialized");
            return Ok(());
        }

        let home = self.context.devices()[0].index();
        let driver = self.context.driver();
        let handle = driver.alloc_surface(home, self.byte_size())?;
        if let Some(data) = &self.host_data
            && let Err(err) = driver.write_surface(home, handle, data.as_ptr(), data.len())
        {
            let _ = driver.free_surface(home, handle);
            return Err(err);
        }

        *surface = Some(handle);
        debug!(device = home, size = self.byte_size(), "surface materialized");
        Ok(())
    }

    /// Surfaces live on a single device; there is nothing to migrate.
    pub fn migrate_if_needed(&self, _device: &Device) -> Result<()> {
        Ok(())
    }

    /// Destroy the surface handle, if materialized.
    pub(crate) fn clear(&self) -> Result<()> {
        let home = self.context.devices()[0].index();
        match self.surface.lock().take() {
            Some(handle) => self.context.driver().free_surface(home, handle),
            None => Ok(()),
        }
    }
}

impl Drop for Image {
    fn drop(&mut self) {
        if let Err(err) = self.clear() {
            error!(%err, "image teardown failed");
        }
    }
}
