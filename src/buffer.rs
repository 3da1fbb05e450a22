//! Multi-device buffers: lazy allocation, on-demand migration, host mapping
//! and sub-buffer views.
//!
//! A [`Buffer`] belongs to a [`Context`] that may contain several devices, so
//! it keeps one native allocation slot per device. No slot is filled at
//! creation; the submission layer calls [`Buffer::allocate_if_needed`] right
//! before a device first touches the buffer. When a kernel writes through the
//! buffer, the submission layer records the completion event with
//! [`Buffer::set_last_writer`]; from then on only the writing device holds
//! current contents. Any other device must pass through
//! [`Buffer::migrate_if_needed`] before reading, which waits on the writer
//! event and copies device-to-device exactly once per write. Writes are never
//! broadcast eagerly; the copy cost is paid only when a different device
//! actually needs the data.
//!
//! A sub-buffer is a view over a byte range of a parent buffer. It holds one
//! shared reference on the parent for its whole lifetime, never owns device
//! storage itself, and resolves allocations through the parent's slots with
//! its origin applied.

use std::sync::Arc;

use parking_lot::Mutex;
use smallvec::{SmallVec, smallvec};
use tracing::{debug, error, trace};

use crate::context::{Context, Device, Event};
use crate::driver::{DevicePtr, HostPtr};
use crate::error::{
    IncompatibleFlagsSnafu, InvalidRegionSnafu, MissingHostPointerSnafu, NestedSubBufferSnafu, Result,
    UnexpectedHostPointerSnafu, ZeroSizedSnafu,
};
use crate::memory::{MapFlags, MemFlags};

/// How device storage for a buffer is obtained.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AllocMode {
    /// Fresh device allocation per device.
    Classic,
    /// Caller host memory registered for device visibility, no copy.
    UseHostPtr,
    /// Fresh device allocation seeded once from the caller's initial
    /// contents; the caller's pointer is not retained.
    CopyIn,
    /// Driver-managed pinned host allocation visible to every device.
    AllocHostPtr,
}

/// Ownership edge from a sub-buffer to the buffer whose storage it aliases.
#[derive(Debug)]
struct SubBufferLink {
    parent: Arc<Buffer>,
    origin: usize,
}

/// Writer tracking, guarded by the migration mutex.
#[derive(Debug)]
struct Coherence {
    /// Per-device "holds current contents since the last write" flags.
    valid: SmallVec<[bool; 4]>,
    /// Completion event of the most recent write, if any.
    last_writer: Option<Arc<Event>>,
}

/// The single active mapped region, if any.
#[derive(Debug)]
struct MapRegion {
    ptr: *mut u8,
    size: usize,
    offset: usize,
    flags: MapFlags,
    /// Staging storage backing the view when no host pointer does.
    #[allow(dead_code)]
    staging: Option<Box<[u8]>>,
}

// SAFETY: `ptr` points either into `staging` (owned by the region) or into
// caller host memory whose liveness the mapping contract guarantees. The
// region itself only moves under the map mutex.
unsafe impl Send for MapRegion {}

/// A logical buffer with at most one native allocation per context device.
#[derive(Debug)]
pub struct Buffer {
    context: Arc<Context>,
    flags: MemFlags,
    mode: AllocMode,
    size: usize,
    /// Host memory backing the buffer, when the mode implies one.
    host_ptr: Option<HostPtr>,
    /// Snapshot of the caller's initial contents (CopyIn only), used to seed
    /// each device allocation exactly once.
    seed: Option<Box<[u8]>>,
    link: Option<SubBufferLink>,
    /// Per-device allocation slots. The lock is the allocation mutex: it
    /// serializes check-then-create so two threads cannot double-allocate.
    slots: Mutex<SmallVec<[Option<DevicePtr>; 4]>>,
    /// Writer tracking. The lock is the migration mutex: it serializes
    /// check-then-copy-then-mark against writer updates. Independent from the
    /// allocation mutex so allocation on one device can proceed concurrently
    /// with a migration decision for another.
    coherence: Mutex<Coherence>,
    map: Mutex<Option<MapRegion>>,
}

impl Buffer {
    /// Create a buffer of `size` bytes over every device in `context`.
    ///
    /// `host_ptr` is required by [`AllocMode::UseHostPtr`] and
    /// [`AllocMode::CopyIn`] and rejected otherwise. `AllocHostPtr` obtains
    /// its pinned host allocation eagerly here; device visibility of it is
    /// still resolved lazily. A single-device context with initial contents
    /// allocates and seeds eagerly, since there is only one device the buffer
    /// can ever live on.
    pub fn new(
        context: Arc<Context>,
        flags: MemFlags,
        mode: AllocMode,
        host_ptr: Option<HostPtr>,
        size: usize,
    ) -> Result<Arc<Self>> {
        snafu::ensure!(size != 0, ZeroSizedSnafu);
        match mode {
            AllocMode::UseHostPtr | AllocMode::CopyIn => {
                snafu::ensure!(host_ptr.is_some(), MissingHostPointerSnafu { mode });
            }
            AllocMode::Classic | AllocMode::AllocHostPtr => {
                snafu::ensure!(host_ptr.is_none(), UnexpectedHostPointerSnafu { mode });
            }
        }

        let device_count = context.device_count();
        let (host_ptr, seed) = match mode {
            AllocMode::UseHostPtr => (host_ptr, None),
            AllocMode::CopyIn => {
                let host = host_ptr.expect("checked above");
                // SAFETY: the creation contract guarantees `host` is valid
                // for `size` bytes for the duration of this call. The bytes
                // are snapshotted; the pointer is not retained.
                let seed = unsafe { std::slice::from_raw_parts(host.as_ptr(), size) }.to_vec();
                (None, Some(seed.into_boxed_slice()))
            }
            AllocMode::AllocHostPtr => (Some(context.driver().alloc_pinned(size)?), None),
            AllocMode::Classic => (None, None),
        };

        let buffer = Self {
            context,
            flags,
            mode,
            size,
            host_ptr,
            seed,
            link: None,
            slots: Mutex::new(smallvec![None; device_count]),
            coherence: Mutex::new(Coherence { valid: smallvec![false; device_count], last_writer: None }),
            map: Mutex::new(None),
        };

        if device_count == 1 && mode == AllocMode::CopyIn {
            let device = Arc::clone(&buffer.context.devices()[0]);
            buffer.allocate_if_needed(&device)?;
        }

        Ok(Arc::new(buffer))
    }

    /// Create a view over `[origin, origin + size)` of this buffer.
    ///
    /// The view retains the parent and aliases its storage; it never owns
    /// device allocations of its own. Empty `flags` inherit the parent's.
    pub fn sub_buffer(self: &Arc<Self>, flags: MemFlags, origin: usize, size: usize) -> Result<Arc<Self>> {
        snafu::ensure!(self.link.is_none(), NestedSubBufferSnafu);
        snafu::ensure!(size != 0, ZeroSizedSnafu);
        snafu::ensure!(
            origin + size <= self.size,
            InvalidRegionSnafu { origin, size, buffer_size: self.size }
        );

        let flags = if flags.is_empty() { self.flags } else { flags };
        let incompatible = (self.flags.contains(MemFlags::WRITE_ONLY)
            && flags.intersects(MemFlags::READ_WRITE | MemFlags::READ_ONLY))
            || (self.flags.contains(MemFlags::READ_ONLY)
                && flags.intersects(MemFlags::READ_WRITE | MemFlags::WRITE_ONLY));
        snafu::ensure!(!incompatible, IncompatibleFlagsSnafu { flags, parent: self.flags });

        let device_count = self.context.device_count();
        Ok(Arc::new(Self {
            context: Arc::clone(&self.context),
            flags,
            mode: self.mode,
            size,
            host_ptr: self.host_ptr.map(|host| HostPtr::new(host.offset(origin))),
            seed: None,
            link: Some(SubBufferLink { parent: Arc::clone(self), origin }),
            slots: Mutex::new(smallvec![None; device_count]),
            coherence: Mutex::new(Coherence { valid: smallvec![false; device_count], last_writer: None }),
            map: Mutex::new(None),
        }))
    }

    pub fn context(&self) -> &Arc<Context> {
        &self.context
    }

    pub fn flags(&self) -> MemFlags {
        self.flags
    }

    pub fn mode(&self) -> AllocMode {
        self.mode
    }

    /// Total size of this buffer (or view) in bytes.
    pub fn size(&self) -> usize {
        self.size
    }

    pub fn is_sub_buffer(&self) -> bool {
        self.link.is_some()
    }

    /// The parent buffer, if this is a sub-buffer view.
    pub fn parent(&self) -> Option<&Arc<Buffer>> {
        self.link.as_ref().map(|link| &link.parent)
    }

    /// Origin offset into the parent, if this is a sub-buffer view.
    pub fn origin(&self) -> Option<usize> {
        self.link.as_ref().map(|link| link.origin)
    }

    /// The host pointer backing this buffer, if the mode implies one.
    pub fn host_ptr(&self) -> Option<HostPtr> {
        self.host_ptr
    }

    /// The native allocation for `device`, if one exists.
    pub fn device_ptr(&self, device: &Device) -> Option<DevicePtr> {
        self.device_ptr_at(device.index())
    }

    fn device_ptr_at(&self, index: usize) -> Option<DevicePtr> {
        if let Some(link) = &self.link {
            return link.parent.device_ptr_at(index).map(|base| base.offset(link.origin));
        }
        self.slots.lock()[index]
    }

    /// Ensure a native allocation exists for `device`, creating it per the
    /// allocation-mode policy if the slot is empty.
    ///
    /// Idempotent: a filled slot is returned as-is with no driver call. On
    /// failure the slot stays empty and the call is safe to retry. A
    /// sub-buffer delegates to its parent and applies its origin.
    pub fn allocate_if_needed(&self, device: &Device) -> Result<DevicePtr> {
        if let Some(link) = &self.link {
            let base = link.parent.allocate_if_needed(device)?;
            return Ok(base.offset(link.origin));
        }

        let index = device.index();
        let mut slots = self.slots.lock();
        if let Some(ptr) = slots[index] {
            trace!(device = index, "allocation already present");
            return Ok(ptr);
        }

        let driver = self.context.driver();
        let ptr = match self.mode {
            AllocMode::Classic => driver.alloc(index, self.size)?,
            AllocMode::CopyIn => {
                let ptr = driver.alloc(index, self.size)?;
                let seed = self.seed.as_ref().expect("copy-in buffer keeps its initial contents");
                if let Err(err) = driver.copy_to_device(index, ptr, seed.as_ptr(), self.size) {
                    // Leave the slot empty and retryable.
                    let _ = driver.free(index, ptr);
                    return Err(err);
                }
                ptr
            }
            AllocMode::UseHostPtr => {
                let host = self.host_ptr.expect("use-host-ptr buffer keeps its host pointer");
                driver.register_host(index, host, self.size)?
            }
            AllocMode::AllocHostPtr => {
                let host = self.host_ptr.expect("pinned buffer keeps its host pointer");
                driver.device_ptr_for_host(index, host)?
            }
        };

        slots[index] = Some(ptr);
        debug!(device = index, size = self.size, mode = ?self.mode, "device storage allocated");
        Ok(ptr)
    }

    /// Ensure `device`'s allocation holds the current contents.
    ///
    /// If the device is already up to date this is a no-op with zero copies.
    /// Otherwise, when a tracked writer on a different device exists, the
    /// writer event is waited on (blocking) and the full content of this
    /// buffer (or view) is copied from the writer device's allocation.
    ///
    /// # Panics
    ///
    /// Panics if `device` has no allocation; ensuring one exists first is the
    /// caller's responsibility.
    pub fn migrate_if_needed(&self, device: &Device) -> Result<()> {
        let index = device.index();
        let dst = self
            .device_ptr_at(index)
            .unwrap_or_else(|| panic!("migration requires an allocation on device {index}"));

        let mut coherence = self.coherence.lock();
        if coherence.valid[index] {
            trace!(device = index, "contents already current");
            return Ok(());
        }

        if let Some(writer) = coherence.last_writer.clone() {
            let src_index = writer.device().index();
            if src_index != index {
                writer.wait();
                let src = self
                    .device_ptr_at(src_index)
                    .expect("writer device holds an allocation");
                self.context
                    .driver()
                    .copy_device_to_device(index, dst, src_index, src, self.size)?;
                debug!(from = src_index, to = index, size = self.size, "migrated buffer contents");
            }
        }

        coherence.valid[index] = true;
        Ok(())
    }

    /// Record `event` as the most recent write to this buffer.
    ///
    /// Replaces (releasing) any previously tracked event and resets every
    /// device's up-to-date flag except the writing device's: only one device
    /// is authoritative at a time, and every other device must migrate before
    /// reading.
    pub fn set_last_writer(&self, event: Arc<Event>) {
        let writer_index = event.device().index();
        let mut coherence = self.coherence.lock();
        coherence.last_writer = Some(event);
        for (index, valid) in coherence.valid.iter_mut().enumerate() {
            *valid = index == writer_index;
        }
        debug!(device = writer_index, "writer recorded");
    }

    /// Whether `device`'s allocation holds current contents.
    pub fn is_up_to_date(&self, device: &Device) -> bool {
        self.coherence.lock().valid[device.index()]
    }

    /// The tracked writer event, if any.
    pub fn last_writer(&self) -> Option<Arc<Event>> {
        self.coherence.lock().last_writer.clone()
    }

    /// Establish the unique active mapping over `[offset, offset + size)` and
    /// return a host pointer for it.
    ///
    /// A host-pointer-backed buffer aliases `host + offset` directly with no
    /// copy or staging; otherwise a staging allocation of the full buffer
    /// size backs the view.
    ///
    /// # Panics
    ///
    /// Panics if a mapping is already active or the region is out of bounds;
    /// both are programmer errors in the submission layer.
    pub fn map_to_ptr(&self, size: usize, offset: usize, flags: MapFlags) -> *mut u8 {
        assert!(offset + size <= self.size, "mapped region exceeds buffer size");
        let mut map = self.map.lock();
        assert!(map.is_none(), "buffer is already mapped");

        let (ptr, staging) = match self.host_ptr {
            Some(host) => (host.offset(offset), None),
            None => {
                let mut staging = vec![0u8; self.size].into_boxed_slice();
                (staging.as_mut_ptr(), Some(staging))
            }
        };

        *map = Some(MapRegion { ptr, size, offset, flags, staging });
        ptr
    }

    /// Release the active mapping.
    ///
    /// Frees the staging allocation if one was made; an aliased host pointer
    /// is never freed.
    ///
    /// # Panics
    ///
    /// Panics if no mapping is active or `ptr` is not the mapped pointer.
    pub fn unmap(&self, ptr: *mut u8) {
        let mut map = self.map.lock();
        let region = map.take().expect("buffer is not mapped");
        assert_eq!(region.ptr, ptr, "unmap pointer does not match the active mapping");
        // Staging storage drops with the region.
    }

    pub fn map_ptr(&self) -> Option<*mut u8> {
        self.map.lock().as_ref().map(|region| region.ptr)
    }

    pub fn map_size(&self) -> Option<usize> {
        self.map.lock().as_ref().map(|region| region.size)
    }

    pub fn map_offset(&self) -> Option<usize> {
        self.map.lock().as_ref().map(|region| region.offset)
    }

    pub fn map_flags(&self) -> Option<MapFlags> {
        self.map.lock().as_ref().map(|region| region.flags)
    }

    /// Release the underlying storage.
    ///
    /// A sub-buffer owns no storage, so this is a no-op for it. Otherwise the
    /// release follows the allocation mode. Every device's release is
    /// attempted even when an earlier one fails; the first failure is
    /// returned and the rest are logged.
    pub(crate) fn clear(&self) -> Result<()> {
        if self.is_sub_buffer() {
            return Ok(());
        }
        let driver = self.context.driver();
        match self.mode {
            AllocMode::Classic | AllocMode::CopyIn => {
                let mut slots = self.slots.lock();
                let mut first_failure = None;
                for (index, slot) in slots.iter_mut().enumerate() {
                    if let Some(ptr) = slot.take()
                        && let Err(err) = driver.free(index, ptr)
                    {
                        error!(device = index, %err, "device storage release failed");
                        first_failure.get_or_insert(err);
                    }
                }
                match first_failure {
                    Some(err) => Err(err),
                    None => Ok(()),
                }
            }
            AllocMode::UseHostPtr => {
                // Registration happens lazily per device; nothing to undo if
                // no device ever touched the buffer.
                let mut slots = self.slots.lock();
                let registered = slots.iter_mut().filter_map(|slot| slot.take()).count();
                if registered == 0 {
                    return Ok(());
                }
                let host = self.host_ptr.expect("use-host-ptr buffer keeps its host pointer");
                driver.unregister_host(host)
            }
            AllocMode::AllocHostPtr => {
                let host = self.host_ptr.expect("pinned buffer keeps its host pointer");
                driver.free_pinned(host)
            }
        }
    }
}

impl Drop for Buffer {
    fn drop(&mut self) {
        if let Err(err) = self.clear() {
            error!(%err, "buffer teardown failed");
        }
        // The parent reference (if a sub-buffer) and the tracked writer event
        // (if any) are released when their fields drop.
    }
}
