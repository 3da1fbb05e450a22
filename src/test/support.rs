//! Test instrumentation: a driver wrapper that records every primitive call
//! and can inject per-device failures.

use std::collections::HashSet;
use std::sync::Arc;

use parking_lot::Mutex;

use crate::driver::{DeviceDriver, DevicePtr, HostDriver, HostPtr, SurfaceHandle};
use crate::error::{AllocationFailedSnafu, ReleaseFailedSnafu, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DriverOp {
    Alloc { device: usize, size: usize },
    Free { device: usize },
    RegisterHost { device: usize, size: usize },
    UnregisterHost,
    AllocPinned { size: usize },
    FreePinned,
    DevicePtrForHost { device: usize },
    CopyToDevice { device: usize, size: usize },
    CopyFromDevice { device: usize, size: usize },
    CopyDeviceToDevice { from: usize, to: usize, size: usize },
    AllocSurface { device: usize, size: usize },
    FreeSurface { device: usize },
    WriteSurface { device: usize, size: usize },
}

/// Delegates to a [`HostDriver`] while recording the call sequence.
#[derive(Debug, Default)]
pub struct RecordingDriver {
    inner: HostDriver,
    ops: Mutex<Vec<DriverOp>>,
    fail_alloc: Mutex<HashSet<usize>>,
    fail_free: Mutex<HashSet<usize>>,
}

impl RecordingDriver {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn ops(&self) -> Vec<DriverOp> {
        self.ops.lock().clone()
    }

    pub fn count(&self, pred: impl Fn(&DriverOp) -> bool) -> usize {
        self.ops.lock().iter().filter(|op| pred(op)).count()
    }

    pub fn allocs_on(&self, device: usize) -> usize {
        self.count(|op| matches!(op, DriverOp::Alloc { device: d, .. } if *d == device))
    }

    pub fn frees(&self) -> usize {
        self.count(|op| matches!(op, DriverOp::Free { .. }))
    }

    pub fn d2d_copies(&self) -> usize {
        self.count(|op| matches!(op, DriverOp::CopyDeviceToDevice { .. }))
    }

    /// Make every allocation on `device` fail until allowed again.
    pub fn fail_alloc_on(&self, device: usize) {
        self.fail_alloc.lock().insert(device);
    }

    pub fn allow_alloc_on(&self, device: usize) {
        self.fail_alloc.lock().remove(&device);
    }

    /// Make every free on `device` fail.
    pub fn fail_free_on(&self, device: usize) {
        self.fail_free.lock().insert(device);
    }

    fn record(&self, op: DriverOp) {
        self.ops.lock().push(op);
    }
}

impl DeviceDriver for RecordingDriver {
    fn alloc(&self, device: usize, size: usize) -> Result<DevicePtr> {
        self.record(DriverOp::Alloc { device, size });
        if self.fail_alloc.lock().contains(&device) {
            return AllocationFailedSnafu { device, size, reason: "injected failure" }.fail();
        }
        self.inner.alloc(device, size)
    }

    fn free(&self, device: usize, ptr: DevicePtr) -> Result<()> {
        self.record(DriverOp::Free { device });
        if self.fail_free.lock().contains(&device) {
            return ReleaseFailedSnafu { device, reason: "injected failure" }.fail();
        }
        self.inner.free(device, ptr)
    }

    fn register_host(&self, device: usize, host: HostPtr, size: usize) -> Result<DevicePtr> {
        self.record(DriverOp::RegisterHost { device, size });
        self.inner.register_host(device, host, size)
    }

    fn unregister_host(&self, host: HostPtr) -> Result<()> {
        self.record(DriverOp::UnregisterHost);
        self.inner.unregister_host(host)
    }

    fn alloc_pinned(&self, size: usize) -> Result<HostPtr> {
        self.record(DriverOp::AllocPinned { size });
        self.inner.alloc_pinned(size)
    }

    fn free_pinned(&self, host: HostPtr) -> Result<()> {
        self.record(DriverOp::FreePinned);
        self.inner.free_pinned(host)
    }

    fn device_ptr_for_host(&self, device: usize, host: HostPtr) -> Result<DevicePtr> {
        self.record(DriverOp::DevicePtrForHost { device });
        self.inner.device_ptr_for_host(device, host)
    }

    fn copy_to_device(&self, device: usize, dst: DevicePtr, src: *const u8, size: usize) -> Result<()> {
        self.record(DriverOp::CopyToDevice { device, size });
        self.inner.copy_to_device(device, dst, src, size)
    }

    fn copy_from_device(&self, device: usize, dst: *mut u8, src: DevicePtr, size: usize) -> Result<()> {
        self.record(DriverOp::CopyFromDevice { device, size });
        self.inner.copy_from_device(device, dst, src, size)
    }

    fn copy_device_to_device(
        &self,
        dst_device: usize,
        dst: DevicePtr,
        src_device: usize,
        src: DevicePtr,
        size: usize,
    ) -> Result<()> {
        self.record(DriverOp::CopyDeviceToDevice { from: src_device, to: dst_device, size });
        self.inner.copy_device_to_device(dst_device, dst, src_device, src, size)
    }

    fn alloc_surface(&self, device: usize, size: usize) -> Result<SurfaceHandle> {
        self.record(DriverOp::AllocSurface { device, size });
        self.inner.alloc_surface(device, size)
    }

    fn free_surface(&self, device: usize, surface: SurfaceHandle) -> Result<()> {
        self.record(DriverOp::FreeSurface { device });
        self.inner.free_surface(device, surface)
    }

    fn write_surface(&self, device: usize, surface: SurfaceHandle, src: *const u8, size: usize) -> Result<()> {
        self.record(DriverOp::WriteSurface { device, size });
        self.inner.write_surface(device, surface, src, size)
    }
}

/// Context over `devices` simulated devices, reached through `driver`.
pub fn context(driver: &Arc<RecordingDriver>, devices: usize) -> Arc<crate::Context> {
    crate::Context::new(Arc::clone(driver) as Arc<dyn DeviceDriver>, devices)
}
