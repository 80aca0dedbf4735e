// src/kms/buffer.rs

//! Scanout buffer allocation, framebuffer registration and CPU mapping.
//!
//! Ownership nests the same way the hardware objects depend on each other:
//! a [`ScanoutBuffer`] borrows its [`BufferAllocator`], a
//! [`FramebufferRegistration`] borrows its buffer, and a mapping only exists
//! for the duration of a [`ScanoutBuffer::map`] call. Dropping happens in the
//! reverse order, so a framebuffer is always removed before its buffer is
//! destroyed and a mapping is always gone before either.

use std::cell::{Cell, RefCell};
use std::io;

use log::{debug, info, trace, warn};

use crate::error::PipelineError;
use crate::kms::backend::KmsBackend;
use crate::kms::device::DeviceHandle;
use crate::kms::types::{BufferLayout, BufferRequest, BufferUsage, FramebufferId, PixelFormat};

/// Writable CPU view of a mapped buffer, exactly `stride * height` bytes long.
///
/// Writes go straight to buffer memory; reading back is not guaranteed to
/// return what the device holds.
#[derive(Debug)]
pub struct MappedView<'a> {
    bytes: &'a mut [u8],
    width: u32,
    height: u32,
    stride: u32,
}

impl<'a> MappedView<'a> {
    /// Wraps a mapping. Fails when the mapping cannot hold `height` rows of
    /// `stride` bytes or when `stride` cannot hold `width` 32-bit pixels.
    pub fn new(bytes: &'a mut [u8], width: u32, height: u32, stride: u32) -> io::Result<Self> {
        if u64::from(stride) < u64::from(width) * 4 {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("stride {stride} cannot hold {width} pixels"),
            ));
        }
        let len = stride as usize * height as usize;
        if bytes.len() < len {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                format!("mapping is {} bytes, expected {}", bytes.len(), len),
            ));
        }
        Ok(Self {
            bytes: &mut bytes[..len],
            width,
            height,
            stride,
        })
    }

    pub fn width(&self) -> u32 {
        self.width
    }

    pub fn height(&self) -> u32 {
        self.height
    }

    /// Bytes per row, including padding.
    pub fn stride(&self) -> u32 {
        self.stride
    }

    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }

    pub fn as_bytes_mut(&mut self) -> &mut [u8] {
        self.bytes
    }

    /// Row `y`, padding included.
    pub fn row_mut(&mut self, y: u32) -> &mut [u8] {
        let start = y as usize * self.stride as usize;
        &mut self.bytes[start..start + self.stride as usize]
    }

    /// Stores a 32-bit pixel in little-endian byte order.
    pub fn put_pixel(&mut self, x: u32, y: u32, value: u32) {
        debug_assert!(x < self.width && y < self.height);
        let offset = y as usize * self.stride as usize + x as usize * 4;
        self.bytes[offset..offset + 4].copy_from_slice(&value.to_le_bytes());
    }
}

/// Buffer-producing context bound to an open device.
pub struct BufferAllocator<'a, B: KmsBackend> {
    device: &'a DeviceHandle<'a, B>,
    allocator: Option<B::Allocator>,
}

impl<'a, B: KmsBackend> BufferAllocator<'a, B> {
    pub fn create(device: &'a DeviceHandle<'a, B>) -> Result<Self, PipelineError> {
        let raw = device.raw().map_err(PipelineError::AllocatorInitFailed)?;
        let allocator = device
            .backend()
            .create_allocator(raw)
            .map_err(PipelineError::AllocatorInitFailed)?;
        info!("Created buffer allocator on {}", device.path().display());
        Ok(Self {
            device,
            allocator: Some(allocator),
        })
    }

    /// Allocates a `width x height` buffer.
    pub fn allocate(
        &self,
        width: u32,
        height: u32,
        format: PixelFormat,
        usage: BufferUsage,
    ) -> Result<ScanoutBuffer<'_, B>, PipelineError> {
        let failed = |source| PipelineError::AllocationFailed {
            width,
            height,
            source,
        };
        if width == 0 || height == 0 {
            return Err(failed(io::Error::new(
                io::ErrorKind::InvalidInput,
                "buffer dimensions must be non-zero",
            )));
        }
        let allocator = self.inner().map_err(failed)?;
        let backend = self.device.backend();
        let request = BufferRequest {
            width,
            height,
            format,
            usage,
        };
        let buffer = backend.create_buffer(allocator, &request).map_err(failed)?;
        let layout = match backend.buffer_layout(&buffer) {
            Ok(layout) => layout,
            Err(source) => {
                backend.destroy_buffer(allocator, buffer);
                return Err(failed(source));
            }
        };
        info!(
            "Allocated {}x{} {:?} buffer, stride {}",
            width, height, format, layout.stride
        );
        Ok(ScanoutBuffer {
            allocator: self,
            buffer: RefCell::new(Some(buffer)),
            request,
            layout,
            framebuffer: Cell::new(None),
        })
    }

    /// Destroys the allocator. Equivalent to dropping it.
    pub fn destroy(self) {
        drop(self);
    }

    fn inner(&self) -> io::Result<&B::Allocator> {
        self.allocator
            .as_ref()
            .ok_or_else(|| io::Error::new(io::ErrorKind::NotConnected, "allocator destroyed"))
    }
}

impl<B: KmsBackend> Drop for BufferAllocator<'_, B> {
    fn drop(&mut self) {
        if let Some(allocator) = self.allocator.take() {
            self.device.backend().destroy_allocator(allocator);
            debug!("Destroyed buffer allocator");
        }
    }
}

/// One allocated pixel buffer, optionally registered as a framebuffer.
pub struct ScanoutBuffer<'a, B: KmsBackend> {
    allocator: &'a BufferAllocator<'a, B>,
    // Borrowed mutably only while mapped.
    buffer: RefCell<Option<B::Buffer>>,
    request: BufferRequest,
    layout: BufferLayout,
    framebuffer: Cell<Option<FramebufferId>>,
}

impl<'a, B: KmsBackend> ScanoutBuffer<'a, B> {
    pub fn width(&self) -> u32 {
        self.request.width
    }

    pub fn height(&self) -> u32 {
        self.request.height
    }

    pub fn format(&self) -> PixelFormat {
        self.request.format
    }

    pub fn stride(&self) -> u32 {
        self.layout.stride
    }

    pub fn handle(&self) -> u32 {
        self.layout.handle
    }

    /// Set only while a [`FramebufferRegistration`] for this buffer is alive.
    pub fn framebuffer_id(&self) -> Option<FramebufferId> {
        self.framebuffer.get()
    }

    /// Registers the buffer as a framebuffer on the device. A buffer can be
    /// registered once at a time; a second attempt fails without touching the
    /// device.
    pub fn register_framebuffer(&self) -> Result<FramebufferRegistration<'_, B>, PipelineError> {
        if let Some(existing) = self.framebuffer.get() {
            return Err(PipelineError::FramebufferRegistrationFailed(io::Error::new(
                io::ErrorKind::AlreadyExists,
                format!("buffer is already registered as {existing}"),
            )));
        }
        let device = self.allocator.device;
        let raw = device
            .raw()
            .map_err(PipelineError::FramebufferRegistrationFailed)?;
        let slot = self.buffer.try_borrow().map_err(|_| {
            PipelineError::FramebufferRegistrationFailed(io::Error::new(
                io::ErrorKind::ResourceBusy,
                "buffer is mapped",
            ))
        })?;
        let buffer = slot.as_ref().ok_or_else(|| {
            PipelineError::FramebufferRegistrationFailed(released_buffer())
        })?;
        let id = device
            .backend()
            .add_framebuffer(raw, buffer, self.request.format)
            .map_err(PipelineError::FramebufferRegistrationFailed)?;
        self.framebuffer.set(Some(id));
        info!("Registered {} ({}x{})", id, self.width(), self.height());
        Ok(FramebufferRegistration { buffer: self, id })
    }

    /// Maps the buffer, hands the view to `render`, and unmaps before
    /// returning. The view must not outlive the call.
    pub fn map<R>(&self, render: R) -> Result<(), PipelineError>
    where
        R: FnOnce(&mut MappedView<'_>),
    {
        let mut slot = self.buffer.try_borrow_mut().map_err(|_| {
            PipelineError::MapFailed(io::Error::new(
                io::ErrorKind::ResourceBusy,
                "buffer is already mapped",
            ))
        })?;
        let buffer = slot
            .as_mut()
            .ok_or_else(|| PipelineError::MapFailed(released_buffer()))?;
        let mut render = Some(render);
        self.allocator
            .device
            .backend()
            .map_buffer(buffer, &mut |view: &mut MappedView<'_>| {
                if let Some(render) = render.take() {
                    trace!(
                        "Rendering into {}x{} mapping, stride {}",
                        view.width(),
                        view.height(),
                        view.stride()
                    );
                    render(view);
                }
            })
            .map_err(PipelineError::MapFailed)?;
        debug!("Buffer unmapped");
        Ok(())
    }

    /// Releases the buffer. Equivalent to dropping it.
    pub fn release(self) {
        drop(self);
    }

    fn unregister(&self, id: FramebufferId) {
        if self.framebuffer.replace(None) != Some(id) {
            warn!("{} was not the registered framebuffer", id);
        }
        let device = self.allocator.device;
        let Ok(raw) = device.raw() else {
            return;
        };
        match device.backend().remove_framebuffer(raw, id) {
            Ok(()) => debug!("Removed {}", id),
            Err(e) => warn!("Failed to remove {}: {}", id, e),
        }
    }
}

impl<B: KmsBackend> Drop for ScanoutBuffer<'_, B> {
    fn drop(&mut self) {
        // Only reachable when a registration guard was leaked.
        if let Some(id) = self.framebuffer.get() {
            warn!("{} still registered while releasing its buffer", id);
            self.unregister(id);
        }
        let Some(buffer) = self.buffer.get_mut().take() else {
            return;
        };
        match self.allocator.inner() {
            Ok(allocator) => {
                self.allocator
                    .device
                    .backend()
                    .destroy_buffer(allocator, buffer);
                debug!("Released scanout buffer");
            }
            Err(e) => warn!("Cannot release scanout buffer: {}", e),
        }
    }
}

/// Scope guard for a framebuffer id; dropping it unregisters the framebuffer.
pub struct FramebufferRegistration<'a, B: KmsBackend> {
    buffer: &'a ScanoutBuffer<'a, B>,
    id: FramebufferId,
}

impl<'a, B: KmsBackend> FramebufferRegistration<'a, B> {
    pub fn id(&self) -> FramebufferId {
        self.id
    }

    pub fn buffer(&self) -> &'a ScanoutBuffer<'a, B> {
        self.buffer
    }

    pub fn unregister(self) {
        drop(self);
    }
}

impl<B: KmsBackend> Drop for FramebufferRegistration<'_, B> {
    fn drop(&mut self) {
        self.buffer.unregister(self.id);
    }
}

fn released_buffer() -> io::Error {
    io::Error::new(io::ErrorKind::NotConnected, "buffer already released")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kms::mock::{MockBackend, MockCall, MockOp};
    use std::path::Path;

    fn open(backend: &MockBackend) -> DeviceHandle<'_, MockBackend> {
        DeviceHandle::open(backend, Path::new("/dev/dri/card0")).unwrap()
    }

    #[test_log::test]
    fn view_is_exactly_stride_times_height() {
        let mut backing = vec![0u8; 4096];
        let view = MappedView::new(&mut backing, 10, 8, 64).unwrap();
        assert_eq!(view.len(), 64 * 8);
    }

    #[test_log::test]
    fn view_rejects_short_mappings_and_narrow_strides() {
        let mut backing = vec![0u8; 100];
        assert!(MappedView::new(&mut backing, 10, 8, 64).is_err());
        let mut backing = vec![0u8; 4096];
        assert!(MappedView::new(&mut backing, 20, 8, 64).is_err());
    }

    #[test_log::test]
    fn put_pixel_honours_stride() {
        let mut backing = vec![0u8; 128];
        let mut view = MappedView::new(&mut backing, 2, 2, 64).unwrap();
        view.put_pixel(1, 1, 0x00FF_0000);
        assert_eq!(&backing[68..72], &[0x00, 0x00, 0xFF, 0x00]);
    }

    #[test_log::test]
    fn zero_sized_allocation_is_refused() {
        let backend = MockBackend::new();
        let device = open(&backend);
        let allocator = BufferAllocator::create(&device).unwrap();
        let err = allocator
            .allocate(0, 720, PixelFormat::Xrgb8888, BufferUsage::default())
            .err()
            .unwrap();
        assert!(matches!(err, PipelineError::AllocationFailed { width: 0, .. }));
        assert_eq!(backend.attempts(MockOp::CreateBuffer), 0);
    }

    #[test_log::test]
    fn layout_failure_releases_the_fresh_buffer() {
        let backend = MockBackend::new();
        backend.fail_call(MockOp::BufferLayout, 1);
        let device = open(&backend);
        let allocator = BufferAllocator::create(&device).unwrap();
        assert!(allocator
            .allocate(64, 64, PixelFormat::Xrgb8888, BufferUsage::default())
            .is_err());
        drop(allocator);
        drop(device);
        backend.assert_balanced();
    }

    #[test_log::test]
    fn double_registration_fails_fast() {
        let backend = MockBackend::new();
        let device = open(&backend);
        let allocator = BufferAllocator::create(&device).unwrap();
        let buffer = allocator
            .allocate(64, 32, PixelFormat::Xrgb8888, BufferUsage::default())
            .unwrap();

        let registration = buffer.register_framebuffer().unwrap();
        assert_eq!(buffer.framebuffer_id(), Some(registration.id()));
        let err = buffer.register_framebuffer().err().unwrap();
        assert!(matches!(err, PipelineError::FramebufferRegistrationFailed(_)));
        assert_eq!(backend.attempts(MockOp::AddFramebuffer), 1);

        registration.unregister();
        assert_eq!(buffer.framebuffer_id(), None);
    }

    #[test_log::test]
    fn nested_mapping_is_refused() {
        let backend = MockBackend::new();
        let device = open(&backend);
        let allocator = BufferAllocator::create(&device).unwrap();
        let buffer = allocator
            .allocate(16, 16, PixelFormat::Xrgb8888, BufferUsage::default())
            .unwrap();

        let mut inner = None;
        buffer
            .map(|_view| {
                inner = Some(buffer.map(|_| {}));
            })
            .unwrap();
        assert!(matches!(inner, Some(Err(PipelineError::MapFailed(_)))));
    }

    #[test_log::test]
    fn teardown_runs_in_reverse_acquisition_order() {
        let backend = MockBackend::new();
        {
            let device = open(&backend);
            let allocator = BufferAllocator::create(&device).unwrap();
            let buffer = allocator
                .allocate(64, 32, PixelFormat::Xrgb8888, BufferUsage::default())
                .unwrap();
            let registration = buffer.register_framebuffer().unwrap();
            buffer.map(|view| view.put_pixel(0, 0, 0xFFFFFF)).unwrap();
            let _ = registration.id();
        }

        let fb = match backend.calls()[3] {
            MockCall::AddFramebuffer(id) => id,
            ref other => panic!("unexpected call {other:?}"),
        };
        assert_eq!(
            backend.calls(),
            vec![
                MockCall::Open,
                MockCall::CreateAllocator,
                MockCall::CreateBuffer { width: 64, height: 32 },
                MockCall::AddFramebuffer(fb),
                MockCall::Map,
                MockCall::Unmap,
                MockCall::RemoveFramebuffer(fb),
                MockCall::DestroyBuffer,
                MockCall::DestroyAllocator,
                MockCall::Close,
            ]
        );
        backend.assert_balanced();
    }

    #[test_log::test]
    fn leaked_registration_is_still_removed_before_the_buffer() {
        let backend = MockBackend::new();
        {
            let device = open(&backend);
            let allocator = BufferAllocator::create(&device).unwrap();
            let buffer = allocator
                .allocate(8, 8, PixelFormat::Xrgb8888, BufferUsage::default())
                .unwrap();
            std::mem::forget(buffer.register_framebuffer().unwrap());
        }
        backend.assert_balanced();
    }
}
