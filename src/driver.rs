//! Driver boundary: the primitives a backend must provide for memory objects.
//!
//! The [`DeviceDriver`] trait covers exactly what the object model needs:
//! allocate and free device storage, make caller host memory device-visible,
//! manage pinned host memory, move bytes in the three directions, and handle
//! image surfaces. [`HostDriver`] is the in-process reference implementation
//! backing every "device" with host memory under synthetic addresses; it is
//! what CPU-only contexts and the test suite run on.

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::Mutex;

use crate::error::{Result, UnknownAddressSnafu};

/// Opaque device-visible address returned by a driver allocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct DevicePtr(u64);

impl DevicePtr {
    pub fn addr(self) -> u64 {
        self.0
    }

    /// Address `bytes` past this one, used to view into an allocation.
    pub fn offset(self, bytes: usize) -> DevicePtr {
        DevicePtr(self.0 + bytes as u64)
    }
}

/// Opaque handle to a device-resident image surface.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SurfaceHandle(u64);

impl SurfaceHandle {
    pub fn addr(self) -> u64 {
        self.0
    }
}

/// Caller-owned host memory crossing the driver boundary.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HostPtr(*mut u8);

impl HostPtr {
    /// Wrap a caller-owned host pointer.
    ///
    /// The caller keeps ownership and must keep the memory valid for as long
    /// as any memory object or driver registration refers to it.
    pub fn new(ptr: *mut u8) -> Self {
        assert!(!ptr.is_null(), "host pointer must not be null");
        Self(ptr)
    }

    pub fn as_ptr(self) -> *mut u8 {
        self.0
    }

    /// Pointer `bytes` past this one.
    pub fn offset(self, bytes: usize) -> *mut u8 {
        // SAFETY: callers only offset within the registered region, which the
        // owner guarantees is a single live allocation.
        unsafe { self.0.add(bytes) }
    }
}

// SAFETY: a HostPtr is an address, not an access. All reads and writes through
// it happen inside driver calls whose callers uphold the registration
// contract (the memory stays live and unaliased for the registered length).
unsafe impl Send for HostPtr {}
unsafe impl Sync for HostPtr {}

/// Allocation, copy and registration primitives for one backend.
///
/// Every call is synchronous: when it returns, the effect (or failure) is
/// established, even if the backend queues the work internally.
pub trait DeviceDriver: Send + Sync + fmt::Debug {
    /// Allocate `size` bytes of storage on `device`.
    fn alloc(&self, device: usize, size: usize) -> Result<DevicePtr>;

    /// Release a device allocation previously returned by [`alloc`](Self::alloc).
    fn free(&self, device: usize, ptr: DevicePtr) -> Result<()>;

    /// Make `size` bytes of caller host memory visible to `device` without
    /// copying. The returned pointer aliases the host memory.
    fn register_host(&self, device: usize, host: HostPtr, size: usize) -> Result<DevicePtr>;

    /// Drop every device-visibility registration of `host`.
    fn unregister_host(&self, host: HostPtr) -> Result<()>;

    /// Allocate `size` bytes of pinned host memory, directly device-accessible.
    fn alloc_pinned(&self, size: usize) -> Result<HostPtr>;

    /// Release a pinned host allocation.
    fn free_pinned(&self, host: HostPtr) -> Result<()>;

    /// Device-visible address of a pinned host allocation on `device`.
    fn device_ptr_for_host(&self, device: usize, host: HostPtr) -> Result<DevicePtr>;

    fn copy_to_device(&self, device: usize, dst: DevicePtr, src: *const u8, size: usize) -> Result<()>;

    fn copy_from_device(&self, device: usize, dst: *mut u8, src: DevicePtr, size: usize) -> Result<()>;

    fn copy_device_to_device(
        &self,
        dst_device: usize,
        dst: DevicePtr,
        src_device: usize,
        src: DevicePtr,
        size: usize,
    ) -> Result<()>;

    /// Allocate a `size`-byte image surface on `device`.
    fn alloc_surface(&self, device: usize, size: usize) -> Result<SurfaceHandle>;

    fn free_surface(&self, device: usize, surface: SurfaceHandle) -> Result<()>;

    fn write_surface(&self, device: usize, surface: SurfaceHandle, src: *const u8, size: usize) -> Result<()>;
}

/// What a [`HostDriver`] region is backed by.
#[derive(Debug)]
enum Backing {
    /// Driver-owned storage standing in for device memory or a surface.
    Owned(Box<[u8]>),
    /// Driver-owned pinned host memory; the caller holds a [`HostPtr`] into it.
    Pinned(Box<[u8]>),
    /// Caller host memory registered for device visibility.
    Registered { host: HostPtr, len: usize },
}

#[derive(Debug)]
struct Region {
    device: usize,
    len: usize,
    backing: Backing,
}

impl Region {
    /// Read `dst.len()` bytes starting `offset` into the region.
    fn read(&self, offset: usize, dst: &mut [u8]) {
        match &self.backing {
            Backing::Owned(data) | Backing::Pinned(data) => {
                dst.copy_from_slice(&data[offset..offset + dst.len()]);
            }
            Backing::Registered { host, .. } => {
                // SAFETY: the registration contract keeps `host` live for
                // `len` bytes and `locate` bounds-checked offset + dst.len().
                let src = unsafe { std::slice::from_raw_parts(host.as_ptr(), self.len) };
                dst.copy_from_slice(&src[offset..offset + dst.len()]);
            }
        }
    }

    /// Write `src` starting `offset` into the region.
    fn write(&mut self, offset: usize, src: &[u8]) {
        match &mut self.backing {
            Backing::Owned(data) | Backing::Pinned(data) => {
                data[offset..offset + src.len()].copy_from_slice(src);
            }
            Backing::Registered { host, .. } => {
                // SAFETY: see `read`; registered memory is writable by contract.
                let dst = unsafe { std::slice::from_raw_parts_mut(host.as_ptr(), self.len) };
                dst[offset..offset + src.len()].copy_from_slice(src);
            }
        }
    }
}

/// In-process driver backing every device with host memory.
///
/// Addresses are synthetic and never reused, so a stale pointer fails with
/// [`Error::UnknownAddress`](crate::Error::UnknownAddress) instead of aliasing
/// a newer allocation.
#[derive(Debug)]
pub struct HostDriver {
    regions: Mutex<HashMap<u64, Region>>,
    next_addr: AtomicU64,
}

impl Default for HostDriver {
    fn default() -> Self {
        Self::new()
    }
}

impl HostDriver {
    pub fn new() -> Self {
        Self { regions: Mutex::new(HashMap::new()), next_addr: AtomicU64::new(0x1000) }
    }

    /// Reserve an address range for `len` bytes, with a guard gap so that
    /// out-of-range offsets never land in a neighbouring region.
    fn reserve(&self, len: usize) -> u64 {
        let span = (len.max(1) as u64).next_multiple_of(0x1000) + 0x1000;
        self.next_addr.fetch_add(span, Ordering::Relaxed)
    }

    fn insert(&self, device: usize, len: usize, backing: Backing) -> u64 {
        let base = self.reserve(len);
        self.regions.lock().insert(base, Region { device, len, backing });
        base
    }

    /// Resolve `addr` to `(base, offset)` of the region containing it.
    fn locate(regions: &HashMap<u64, Region>, addr: u64, len: usize) -> Result<(u64, usize)> {
        regions
            .iter()
            .find(|(base, region)| {
                addr >= **base && addr + len as u64 <= **base + region.len as u64
            })
            .map(|(base, _)| (*base, (addr - base) as usize))
            .ok_or_else(|| UnknownAddressSnafu { addr }.build())
    }

    fn read_at(&self, addr: u64, dst: &mut [u8]) -> Result<()> {
        let regions = self.regions.lock();
        let (base, offset) = Self::locate(&regions, addr, dst.len())?;
        regions[&base].read(offset, dst);
        Ok(())
    }

    fn write_at(&self, addr: u64, src: &[u8]) -> Result<()> {
        let mut regions = self.regions.lock();
        let (base, offset) = Self::locate(&regions, addr, src.len())?;
        regions.get_mut(&base).expect("located region is present").write(offset, src);
        Ok(())
    }
}

impl DeviceDriver for HostDriver {
    fn alloc(&self, device: usize, size: usize) -> Result<DevicePtr> {
        let backing = Backing::Owned(vec![0u8; size].into_boxed_slice());
        Ok(DevicePtr(self.insert(device, size, backing)))
    }

    fn free(&self, _device: usize, ptr: DevicePtr) -> Result<()> {
        match self.regions.lock().remove(&ptr.addr()) {
            Some(_) => Ok(()),
            None => UnknownAddressSnafu { addr: ptr.addr() }.fail(),
        }
    }

    fn register_host(&self, device: usize, host: HostPtr, size: usize) -> Result<DevicePtr> {
        let backing = Backing::Registered { host, len: size };
        Ok(DevicePtr(self.insert(device, size, backing)))
    }

    fn unregister_host(&self, host: HostPtr) -> Result<()> {
        let mut regions = self.regions.lock();
        let before = regions.len();
        regions.retain(|_, region| !matches!(&region.backing, Backing::Registered { host: h, .. } if *h == host));
        if regions.len() == before {
            return UnknownAddressSnafu { addr: host.as_ptr() as u64 }.fail();
        }
        Ok(())
    }

    fn alloc_pinned(&self, size: usize) -> Result<HostPtr> {
        let mut data = vec![0u8; size].into_boxed_slice();
        let host = HostPtr::new(data.as_mut_ptr());
        self.insert(usize::MAX, size, Backing::Pinned(data));
        Ok(host)
    }

    fn free_pinned(&self, host: HostPtr) -> Result<()> {
        let mut regions = self.regions.lock();
        let base = regions
            .iter()
            .find(|(_, region)| {
                matches!(&region.backing, Backing::Pinned(data) if data.as_ptr() == host.as_ptr().cast_const())
            })
            .map(|(base, _)| *base);
        match base {
            Some(base) => {
                regions.remove(&base);
                Ok(())
            }
            None => UnknownAddressSnafu { addr: host.as_ptr() as u64 }.fail(),
        }
    }

    fn device_ptr_for_host(&self, _device: usize, host: HostPtr) -> Result<DevicePtr> {
        let regions = self.regions.lock();
        regions
            .iter()
            .find(|(_, region)| {
                matches!(&region.backing, Backing::Pinned(data) if data.as_ptr() == host.as_ptr().cast_const())
            })
            .map(|(base, _)| DevicePtr(*base))
            .ok_or_else(|| UnknownAddressSnafu { addr: host.as_ptr() as u64 }.build())
    }

    fn copy_to_device(&self, _device: usize, dst: DevicePtr, src: *const u8, size: usize) -> Result<()> {
        // SAFETY: the caller guarantees `src` is valid for `size` bytes for
        // the duration of this synchronous call.
        let src = unsafe { std::slice::from_raw_parts(src, size) };
        self.write_at(dst.addr(), src)
    }

    fn copy_from_device(&self, _device: usize, dst: *mut u8, src: DevicePtr, size: usize) -> Result<()> {
        // SAFETY: the caller guarantees `dst` is valid for `size` bytes.
        let dst = unsafe { std::slice::from_raw_parts_mut(dst, size) };
        self.read_at(src.addr(), dst)
    }

    fn copy_device_to_device(
        &self,
        _dst_device: usize,
        dst: DevicePtr,
        _src_device: usize,
        src: DevicePtr,
        size: usize,
    ) -> Result<()> {
        // Staged through a scratch buffer; source and destination may belong
        // to overlapping registrations of the same host memory.
        let mut scratch = vec![0u8; size];
        self.read_at(src.addr(), &mut scratch)?;
        self.write_at(dst.addr(), &scratch)
    }

    fn alloc_surface(&self, device: usize, size: usize) -> Result<SurfaceHandle> {
        let backing = Backing::Owned(vec![0u8; size].into_boxed_slice());
        Ok(SurfaceHandle(self.insert(device, size, backing)))
    }

    fn free_surface(&self, _device: usize, surface: SurfaceHandle) -> Result<()> {
        match self.regions.lock().remove(&surface.addr()) {
            Some(_) => Ok(()),
            None => UnknownAddressSnafu { addr: surface.addr() }.fail(),
        }
    }

    fn write_surface(&self, _device: usize, surface: SurfaceHandle, src: *const u8, size: usize) -> Result<()> {
        // SAFETY: the caller guarantees `src` is valid for `size` bytes.
        let src = unsafe { std::slice::from_raw_parts(src, size) };
        self.write_at(surface.addr(), src)
    }
}
