use std::collections::HashMap;
use thiserror::Error;

/// Identity of a host-memory region, used as a cache tag.
///
/// The cache never dereferences a key; it is an address-like integer whose
/// only job is equality comparison and set mapping. Reusing a key for
/// different data without forcing a refresh is a caller contract the cache
/// does not detect.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct HostKey(usize);

impl HostKey {
    pub const fn new(raw: usize) -> Self {
        Self(raw)
    }

    /// The raw integer value, used by the address mapper
    pub const fn raw(self) -> usize {
        self.0
    }

    /// Builds a key from a real pointer. The pointer is only taken for its
    /// address, never read through
    pub fn from_ptr<T>(ptr: *const T) -> Self {
        Self(ptr as usize)
    }
}

/// Errors surfaced by a device backend. These propagate through the cache
/// verbatim; the cache adds no retry or recovery logic of its own.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum BackendError {
    #[error("no host region registered for key {key:#x}", key = .0.raw())]
    UnknownHostRegion(HostKey),

    #[error("host region too small: need {needed} bytes, have {available}")]
    ShortHostRegion { needed: usize, available: usize },

    #[error("device buffer too small: need {needed} bytes, have {available}")]
    ShortDeviceBuffer { needed: usize, available: usize },

    #[error("stale or released device buffer handle")]
    StaleHandle,

    #[error("device allocation failed: {0}")]
    Allocation(String),
}

/// The accelerator memory API the cache delegates data movement to.
///
/// Three capabilities, nothing more: create a device buffer (optionally
/// copying host bytes in at creation time), copy a buffer's contents back
/// out to the host, and discard a buffer. All calls are synchronous and
/// blocking. A handle must be released at most once; the cache guarantees
/// this for every handle it stores.
pub trait DeviceBackend {
    /// Opaque device-buffer handle. Clone is required so the cache can hand
    /// out the handle while keeping ownership of the stored copy.
    type Handle: Clone;

    /// Creates a device buffer of `size` bytes. When `copy_in` names a host
    /// region, the backend also copies that region's bytes host-to-device.
    fn allocate(&mut self, size: usize, copy_in: Option<HostKey>) -> Result<Self::Handle, BackendError>;

    /// Copies `size` bytes device-to-host into the region named by `dst`.
    fn copy_out(&mut self, handle: &Self::Handle, dst: HostKey, size: usize) -> Result<(), BackendError>;

    /// Discards a device buffer.
    fn release(&mut self, handle: Self::Handle);
}

// Lets a caller lend the backend to the cache and keep using it afterwards,
// e.g. to count releases once the cache has been dropped.
impl<B: DeviceBackend + ?Sized> DeviceBackend for &mut B {
    type Handle = B::Handle;

    fn allocate(&mut self, size: usize, copy_in: Option<HostKey>) -> Result<Self::Handle, BackendError> {
        (**self).allocate(size, copy_in)
    }

    fn copy_out(&mut self, handle: &Self::Handle, dst: HostKey, size: usize) -> Result<(), BackendError> {
        (**self).copy_out(handle, dst, size)
    }

    fn release(&mut self, handle: Self::Handle) {
        (**self).release(handle)
    }
}

/// Handle type used by [`HostBackend`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct BufferId(u64);

/// An in-process reference backend.
///
/// Models host regions and device buffers as byte vectors so the cache can
/// be exercised end to end without device hardware: the demo program and
/// the test suite both stand in for a real accelerator with this. Host
/// regions must be registered before they can be copied in or out of.
#[derive(Debug, Default)]
pub struct HostBackend {
    host: HashMap<HostKey, Vec<u8>>,
    device: HashMap<BufferId, Vec<u8>>,
    next_id: u64,
    allocations: u64,
    releases: u64,
}

impl HostBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers (or replaces) the host region identified by `key`
    pub fn register(&mut self, key: HostKey, bytes: Vec<u8>) {
        let _ = self.host.insert(key, bytes);
    }

    pub fn host_bytes(&self, key: HostKey) -> Option<&[u8]> {
        self.host.get(&key).map(Vec::as_slice)
    }

    pub fn device_bytes(&self, id: BufferId) -> Option<&[u8]> {
        self.device.get(&id).map(Vec::as_slice)
    }

    /// Overwrites a device buffer in place. Stands in for a kernel writing
    /// its result; the buffer keeps its allocated length.
    pub fn write_device(&mut self, id: BufferId, bytes: &[u8]) -> Result<(), BackendError> {
        let buffer = self.device.get_mut(&id).ok_or(BackendError::StaleHandle)?;
        if buffer.len() < bytes.len() {
            return Err(BackendError::ShortDeviceBuffer {
                needed: bytes.len(),
                available: buffer.len(),
            });
        }
        buffer[..bytes.len()].copy_from_slice(bytes);
        Ok(())
    }

    /// Number of device buffers currently live
    pub fn live_buffers(&self) -> usize {
        self.device.len()
    }

    /// Total `allocate` calls that succeeded
    pub fn allocations(&self) -> u64 {
        self.allocations
    }

    /// Total `release` calls that discarded a live buffer
    pub fn releases(&self) -> u64 {
        self.releases
    }
}

impl DeviceBackend for HostBackend {
    type Handle = BufferId;

    fn allocate(&mut self, size: usize, copy_in: Option<HostKey>) -> Result<Self::Handle, BackendError> {
        let bytes = match copy_in {
            Some(key) => {
                let region = self
                    .host
                    .get(&key)
                    .ok_or(BackendError::UnknownHostRegion(key))?;
                if region.len() < size {
                    return Err(BackendError::ShortHostRegion {
                        needed: size,
                        available: region.len(),
                    });
                }
                region[..size].to_vec()
            }
            None => vec![0; size],
        };
        let id = BufferId(self.next_id);
        self.next_id += 1;
        let _ = self.device.insert(id, bytes);
        self.allocations += 1;
        Ok(id)
    }

    fn copy_out(&mut self, handle: &Self::Handle, dst: HostKey, size: usize) -> Result<(), BackendError> {
        let buffer = self.device.get(handle).ok_or(BackendError::StaleHandle)?;
        if buffer.len() < size {
            return Err(BackendError::ShortDeviceBuffer {
                needed: size,
                available: buffer.len(),
            });
        }
        let region = self
            .host
            .get_mut(&dst)
            .ok_or(BackendError::UnknownHostRegion(dst))?;
        if region.len() < size {
            return Err(BackendError::ShortHostRegion {
                needed: size,
                available: region.len(),
            });
        }
        region[..size].copy_from_slice(&self.device[handle][..size]);
        Ok(())
    }

    fn release(&mut self, handle: Self::Handle) {
        if self.device.remove(&handle).is_some() {
            self.releases += 1;
        }
    }
}
