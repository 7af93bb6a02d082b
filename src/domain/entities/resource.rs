//! Decoded resources and their shared-ownership handles.
//!
//! A [`ManagedResource`] is the unit stored in the memory cache. Nobody
//! outside the cache reads it directly: callers hold a [`ResourceHandle`]
//! (a pending use) or a [`DisplayRef`] (an active display). Each handle bumps
//! an atomic counter on creation and drops it on `Drop`, and the payload is
//! only handed back to the pool once the resource has left the cache and both
//! counters are zero. A live handle therefore always sees a live payload.

use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Weak};

use parking_lot::RwLock;
use tracing::{error, trace};

use super::options::Size;
use super::request_key::RequestKey;

/// Pixel layout of a decoded buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PixelFormat {
    /// 8 bits per channel, RGBA.
    Rgba8888,
    /// 5-6-5 packed RGB.
    Rgb565,
    /// Single 8-bit luminance channel.
    Gray8,
}

impl PixelFormat {
    /// Bytes used by a single pixel.
    #[must_use]
    pub const fn bytes_per_pixel(self) -> usize {
        match self {
            Self::Rgba8888 => 4,
            Self::Rgb565 => 2,
            Self::Gray8 => 1,
        }
    }

    /// Bytes needed for an image of `size`.
    #[must_use]
    #[allow(clippy::cast_possible_truncation)]
    pub const fn bytes_for(self, size: Size) -> usize {
        size.area() as usize * self.bytes_per_pixel()
    }
}

impl fmt::Display for PixelFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Rgba8888 => write!(f, "rgba8888"),
            Self::Rgb565 => write!(f, "rgb565"),
            Self::Gray8 => write!(f, "gray8"),
        }
    }
}

/// A (dimensions, format) bucket in the resource pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SizeClass {
    /// Pixel dimensions.
    pub size: Size,
    /// Pixel format.
    pub format: PixelFormat,
}

impl SizeClass {
    /// Creates a size class.
    #[must_use]
    pub const fn new(size: Size, format: PixelFormat) -> Self {
        Self { size, format }
    }

    /// Bytes a buffer of this class holds.
    #[must_use]
    pub const fn byte_len(self) -> usize {
        self.format.bytes_for(self.size)
    }
}

/// A reusable decode-target buffer.
///
/// Ownership is the in-use flag: a buffer held by a payload has been moved
/// out of the pool and cannot be handed out again until it is moved back.
pub struct PooledBuffer {
    class: SizeClass,
    data: Vec<u8>,
}

impl PooledBuffer {
    /// Allocates a zeroed buffer for `class`.
    #[must_use]
    pub fn allocate(class: SizeClass) -> Self {
        Self {
            class,
            data: vec![0; class.byte_len()],
        }
    }

    /// Wraps already-filled pixel data.
    ///
    /// The vector is truncated or zero-extended to the class length.
    #[must_use]
    pub fn from_pixels(class: SizeClass, mut data: Vec<u8>) -> Self {
        data.resize(class.byte_len(), 0);
        Self { class, data }
    }

    /// Re-labels the buffer for a smaller or equal class, reusing its memory.
    #[must_use]
    pub fn reshape(mut self, class: SizeClass) -> Self {
        self.data.clear();
        self.data.resize(class.byte_len(), 0);
        self.class = class;
        self
    }

    /// The size class currently described by the buffer.
    #[must_use]
    pub const fn class(&self) -> SizeClass {
        self.class
    }

    /// Allocated bytes, which may exceed the class length after a reshape.
    #[must_use]
    pub fn capacity(&self) -> usize {
        self.data.capacity()
    }

    /// The pixel bytes.
    #[must_use]
    pub fn pixels(&self) -> &[u8] {
        &self.data
    }

    /// Mutable pixel bytes.
    pub fn pixels_mut(&mut self) -> &mut [u8] {
        &mut self.data
    }
}

impl fmt::Debug for PooledBuffer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PooledBuffer")
            .field("class", &self.class)
            .field("capacity", &self.data.capacity())
            .finish()
    }
}

/// Output of the codec: pixels plus the metadata the engine needs.
#[derive(Debug)]
pub struct DecodedPayload {
    buffer: PooledBuffer,
    source_size: Size,
}

impl DecodedPayload {
    /// Creates a payload from a filled buffer.
    #[must_use]
    pub const fn new(buffer: PooledBuffer, source_size: Size) -> Self {
        Self {
            buffer,
            source_size,
        }
    }

    /// Decoded dimensions.
    #[must_use]
    pub const fn size(&self) -> Size {
        self.buffer.class().size
    }

    /// Dimensions of the original image before any down-sampling.
    #[must_use]
    pub const fn source_size(&self) -> Size {
        self.source_size
    }

    /// Pixel format.
    #[must_use]
    pub const fn format(&self) -> PixelFormat {
        self.buffer.class().format
    }

    /// Bytes of pixel data.
    #[must_use]
    pub fn byte_size(&self) -> usize {
        self.buffer.class().byte_len()
    }

    /// The pixel bytes.
    #[must_use]
    pub fn pixels(&self) -> &[u8] {
        self.buffer.pixels()
    }

    /// Gives the backing buffer back, e.g. for the pool.
    #[must_use]
    pub fn into_buffer(self) -> PooledBuffer {
        self.buffer
    }
}

/// Receives buffers from recycled resources.
pub trait BufferRecycler: Send + Sync {
    /// Takes ownership of a buffer nobody references anymore.
    fn recycle(&self, buffer: PooledBuffer);
}

/// Reading a resource after it was recycled.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("resource {key} was already recycled")]
pub struct RecycledError {
    /// Key of the recycled resource.
    pub key: RequestKey,
}

struct ResourceCell {
    key: RequestKey,
    size: Size,
    source_size: Size,
    format: PixelFormat,
    byte_size: usize,
    payload: RwLock<Option<DecodedPayload>>,
    display_refs: AtomicUsize,
    pending_uses: AtomicUsize,
    resident: AtomicBool,
    recycled: AtomicBool,
    recycler: Option<Weak<dyn BufferRecycler>>,
}

impl ResourceCell {
    fn try_recycle(&self) -> bool {
        if self.resident.load(Ordering::SeqCst)
            || self.display_refs.load(Ordering::SeqCst) != 0
            || self.pending_uses.load(Ordering::SeqCst) != 0
        {
            return false;
        }
        if self
            .recycled
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return false;
        }

        let payload = self.payload.write().take();
        if let Some(payload) = payload {
            trace!(key = %self.key, bytes = self.byte_size, "Recycled resource");
            if let Some(recycler) = self.recycler.as_ref().and_then(Weak::upgrade) {
                recycler.recycle(payload.into_buffer());
            }
        }
        true
    }

    fn read<R>(&self, f: impl FnOnce(&DecodedPayload) -> R) -> Result<R, RecycledError> {
        let guard = self.payload.read();
        match guard.as_ref() {
            Some(payload) if !self.recycled.load(Ordering::SeqCst) => Ok(f(payload)),
            _ => {
                error!(key = %self.key, "Read of recycled resource");
                Err(RecycledError {
                    key: self.key.clone(),
                })
            }
        }
    }
}

/// A decoded, ref-counted resource as owned by the memory cache.
#[derive(Clone)]
pub struct ManagedResource {
    cell: Arc<ResourceCell>,
}

impl ManagedResource {
    /// Wraps a freshly decoded payload.
    ///
    /// The resource starts detached: it is recycled as soon as its last
    /// handle drops unless the memory cache adopts it first.
    #[must_use]
    pub fn new(
        key: RequestKey,
        payload: DecodedPayload,
        recycler: Option<Weak<dyn BufferRecycler>>,
    ) -> Self {
        Self {
            cell: Arc::new(ResourceCell {
                key,
                size: payload.size(),
                source_size: payload.source_size(),
                format: payload.format(),
                byte_size: payload.byte_size(),
                payload: RwLock::new(Some(payload)),
                display_refs: AtomicUsize::new(0),
                pending_uses: AtomicUsize::new(0),
                resident: AtomicBool::new(false),
                recycled: AtomicBool::new(false),
                recycler,
            }),
        }
    }

    /// Registers a pending use and returns its handle.
    #[must_use]
    pub fn acquire(&self) -> ResourceHandle {
        self.cell.pending_uses.fetch_add(1, Ordering::SeqCst);
        ResourceHandle {
            cell: Arc::clone(&self.cell),
        }
    }

    /// The key this resource was decoded for.
    #[must_use]
    pub fn key(&self) -> &RequestKey {
        &self.cell.key
    }

    /// Payload bytes counted against the cache budget.
    #[must_use]
    pub fn byte_size(&self) -> usize {
        self.cell.byte_size
    }

    /// Number of active display references.
    #[must_use]
    pub fn display_ref_count(&self) -> usize {
        self.cell.display_refs.load(Ordering::SeqCst)
    }

    /// Number of pending uses.
    #[must_use]
    pub fn pending_use_count(&self) -> usize {
        self.cell.pending_uses.load(Ordering::SeqCst)
    }

    /// Whether the payload has been given back.
    #[must_use]
    pub fn is_recycled(&self) -> bool {
        self.cell.recycled.load(Ordering::SeqCst)
    }

    /// Returns true if both handles point at the same resource.
    #[must_use]
    pub fn ptr_eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.cell, &other.cell)
    }

    /// Marks the resource as held by the cache.
    pub(crate) fn adopt(&self) {
        self.cell.resident.store(true, Ordering::SeqCst);
    }

    /// Marks the resource as dropped by the cache, recycling it right away
    /// when nobody else holds it.
    pub(crate) fn release(&self) -> bool {
        self.cell.resident.store(false, Ordering::SeqCst);
        self.cell.try_recycle()
    }
}

impl fmt::Debug for ManagedResource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ManagedResource")
            .field("key", &self.cell.key)
            .field("byte_size", &self.cell.byte_size)
            .field("display_refs", &self.display_ref_count())
            .field("pending_uses", &self.pending_use_count())
            .field("recycled", &self.is_recycled())
            .finish()
    }
}

/// A pending use of a resource, as returned by the memory cache and
/// delivered to listeners.
pub struct ResourceHandle {
    cell: Arc<ResourceCell>,
}

impl ResourceHandle {
    /// The resource key.
    #[must_use]
    pub fn key(&self) -> &RequestKey {
        &self.cell.key
    }

    /// Decoded dimensions.
    #[must_use]
    pub fn size(&self) -> Size {
        self.cell.size
    }

    /// Dimensions of the source image.
    #[must_use]
    pub fn source_size(&self) -> Size {
        self.cell.source_size
    }

    /// Pixel format.
    #[must_use]
    pub fn format(&self) -> PixelFormat {
        self.cell.format
    }

    /// Payload bytes.
    #[must_use]
    pub fn byte_size(&self) -> usize {
        self.cell.byte_size
    }

    /// Whether the payload has been given back.
    #[must_use]
    pub fn is_recycled(&self) -> bool {
        self.cell.recycled.load(Ordering::SeqCst)
    }

    /// Runs `f` against the payload.
    ///
    /// # Errors
    /// Returns [`RecycledError`] if the payload is gone.
    pub fn with_payload<R>(&self, f: impl FnOnce(&DecodedPayload) -> R) -> Result<R, RecycledError> {
        self.cell.read(f)
    }

    /// Starts displaying the resource. Eviction skips it until every
    /// [`DisplayRef`] is dropped.
    #[must_use]
    pub fn display(&self) -> DisplayRef {
        self.cell.display_refs.fetch_add(1, Ordering::SeqCst);
        DisplayRef {
            cell: Arc::clone(&self.cell),
        }
    }

    /// Returns true if both handles point at the same resource.
    #[must_use]
    pub fn same_resource(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.cell, &other.cell)
    }
}

impl Clone for ResourceHandle {
    fn clone(&self) -> Self {
        self.cell.pending_uses.fetch_add(1, Ordering::SeqCst);
        Self {
            cell: Arc::clone(&self.cell),
        }
    }
}

impl Drop for ResourceHandle {
    fn drop(&mut self) {
        if self.cell.pending_uses.fetch_sub(1, Ordering::SeqCst) == 1 {
            self.cell.try_recycle();
        }
    }
}

impl fmt::Debug for ResourceHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ResourceHandle")
            .field("key", &self.cell.key)
            .field("size", &self.cell.size)
            .field("format", &self.cell.format)
            .finish_non_exhaustive()
    }
}

/// An active display of a resource.
pub struct DisplayRef {
    cell: Arc<ResourceCell>,
}

impl DisplayRef {
    /// The resource key.
    #[must_use]
    pub fn key(&self) -> &RequestKey {
        &self.cell.key
    }

    /// Runs `f` against the payload.
    ///
    /// # Errors
    /// Returns [`RecycledError`] if the payload is gone.
    pub fn with_payload<R>(&self, f: impl FnOnce(&DecodedPayload) -> R) -> Result<R, RecycledError> {
        self.cell.read(f)
    }
}

impl Drop for DisplayRef {
    fn drop(&mut self) {
        if self.cell.display_refs.fetch_sub(1, Ordering::SeqCst) == 1 {
            self.cell.try_recycle();
        }
    }
}

impl fmt::Debug for DisplayRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DisplayRef")
            .field("key", &self.cell.key)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;

    #[derive(Default)]
    struct CollectingRecycler {
        buffers: Mutex<Vec<PooledBuffer>>,
    }

    impl BufferRecycler for CollectingRecycler {
        fn recycle(&self, buffer: PooledBuffer) {
            self.buffers.lock().push(buffer);
        }
    }

    fn payload(w: u32, h: u32) -> DecodedPayload {
        let class = SizeClass::new(Size::new(w, h), PixelFormat::Rgba8888);
        DecodedPayload::new(PooledBuffer::allocate(class), Size::new(w, h))
    }

    fn resource(recycler: &Arc<CollectingRecycler>) -> ManagedResource {
        let weak: Weak<dyn BufferRecycler> = Arc::downgrade(recycler) as Weak<dyn BufferRecycler>;
        ManagedResource::new(RequestKey::from("k"), payload(4, 4), Some(weak))
    }

    #[test]
    fn test_byte_size_from_class() {
        let p = payload(10, 5);
        assert_eq!(p.byte_size(), 200);
        assert_eq!(PixelFormat::Rgb565.bytes_for(Size::new(10, 5)), 100);
    }

    #[test]
    fn test_detached_resource_recycles_when_last_handle_drops() {
        let recycler = Arc::new(CollectingRecycler::default());
        let res = resource(&recycler);
        let handle = res.acquire();
        let second = handle.clone();

        drop(handle);
        assert!(!res.is_recycled());
        drop(second);
        assert!(res.is_recycled());
        assert_eq!(recycler.buffers.lock().len(), 1);
    }

    #[test]
    fn test_resident_resource_survives_handle_drop() {
        let recycler = Arc::new(CollectingRecycler::default());
        let res = resource(&recycler);
        res.adopt();
        drop(res.acquire());
        assert!(!res.is_recycled());

        assert!(res.release());
        assert!(res.is_recycled());
    }

    #[test]
    fn test_display_ref_defers_recycle() {
        let recycler = Arc::new(CollectingRecycler::default());
        let res = resource(&recycler);
        res.adopt();
        let handle = res.acquire();
        let shown = handle.display();
        drop(handle);

        assert!(!res.release());
        assert_eq!(res.display_ref_count(), 1);
        assert!(shown.with_payload(DecodedPayload::byte_size).is_ok());

        drop(shown);
        assert!(res.is_recycled());
        assert!(recycler.buffers.lock().len() == 1);
    }

    #[test]
    fn test_recycle_happens_once() {
        let recycler = Arc::new(CollectingRecycler::default());
        let res = resource(&recycler);
        assert!(res.release());
        assert!(!res.release());
        assert_eq!(recycler.buffers.lock().len(), 1);
    }

    #[test]
    fn test_missing_recycler_just_drops() {
        let res = ManagedResource::new(RequestKey::from("k"), payload(2, 2), None);
        assert!(res.release());
        assert!(res.is_recycled());
    }
}
