//! Collaborator handles supplied by the submission layer.
//!
//! A [`Context`] owns an ordered list of devices and the driver used to reach
//! them. Memory objects are created against a context and may end up with a
//! physical allocation on every device in it. An [`Event`] is a waitable
//! completion signal for queued device work; buffers track the event of the
//! last write so that later migrations can be ordered after it.

use std::sync::Arc;

use parking_lot::{Condvar, Mutex};

use crate::driver::DeviceDriver;
use crate::error::{InvalidDeviceSnafu, Result};

/// A single accelerator device, identified by its stable index within the
/// owning context.
#[derive(Debug)]
pub struct Device {
    index: usize,
}

impl Device {
    pub fn index(&self) -> usize {
        self.index
    }
}

/// A multi-device execution context.
#[derive(Debug)]
pub struct Context {
    devices: Vec<Arc<Device>>,
    driver: Arc<dyn DeviceDriver>,
}

impl Context {
    /// Create a context over `device_count` devices reached through `driver`.
    ///
    /// # Panics
    ///
    /// Panics if `device_count` is zero.
    pub fn new(driver: Arc<dyn DeviceDriver>, device_count: usize) -> Arc<Self> {
        assert!(device_count > 0, "a context needs at least one device");
        let devices = (0..device_count).map(|index| Arc::new(Device { index })).collect();
        Arc::new(Self { devices, driver })
    }

    pub fn device_count(&self) -> usize {
        self.devices.len()
    }

    /// Ordered device list; a device's position equals its index.
    pub fn devices(&self) -> &[Arc<Device>] {
        &self.devices
    }

    pub fn device(&self, index: usize) -> Result<&Arc<Device>> {
        self.devices.get(index).ok_or_else(|| {
            InvalidDeviceSnafu { index, count: self.devices.len() }.build()
        })
    }

    pub fn driver(&self) -> &Arc<dyn DeviceDriver> {
        &self.driver
    }
}

/// Completion signal for work queued on a device.
///
/// Events are produced by the submission layer when it enqueues a write and
/// handed to [`Buffer::set_last_writer`](crate::Buffer::set_last_writer).
/// Migration blocks on [`Event::wait`] before copying from the writer device.
#[derive(Debug)]
pub struct Event {
    device: Arc<Device>,
    done: Mutex<bool>,
    cond: Condvar,
}

impl Event {
    /// Create a pending event originating from `device`.
    pub fn new(device: Arc<Device>) -> Arc<Self> {
        Arc::new(Self { device, done: Mutex::new(false), cond: Condvar::new() })
    }

    /// Create an already-completed event, for work that finished synchronously.
    pub fn completed(device: Arc<Device>) -> Arc<Self> {
        Arc::new(Self { device, done: Mutex::new(true), cond: Condvar::new() })
    }

    /// The device the tracked write was queued on.
    pub fn device(&self) -> &Arc<Device> {
        &self.device
    }

    /// Mark the tracked work as complete and wake all waiters.
    pub fn complete(&self) {
        let mut done = self.done.lock();
        *done = true;
        self.cond.notify_all();
    }

    pub fn is_complete(&self) -> bool {
        *self.done.lock()
    }

    /// Block until the tracked work has completed.
    pub fn wait(&self) {
        let mut done = self.done.lock();
        self.cond.wait_while(&mut done, |done| !*done);
    }
}
