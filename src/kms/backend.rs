// src/kms/backend.rs

//! The capability interface the pipeline drives.
//!
//! Every `get_*`/`create_*` call that hands out a descriptor has a matching
//! release call. The guards in [`crate::kms::device`], [`crate::kms::discovery`]
//! and [`crate::kms::buffer`] are the only callers of the release side, which
//! is what keeps acquisitions and releases paired.

use std::fmt;
use std::io;
use std::mem::ManuallyDrop;
use std::ops::Deref;
use std::path::Path;

use crate::kms::buffer::MappedView;
use crate::kms::types::{
    BufferLayout, BufferRequest, ConnectorId, ConnectorInfo, CrtcId, CrtcInfo, DisplayMode,
    EncoderId, EncoderInfo, FramebufferId, ModeResourceSet, PixelFormat,
};

/// Operations on a display controller device and its buffer allocator.
///
/// Methods take `&self`: one backend value can serve several devices, and
/// guards only need a shared borrow of it.
pub trait KmsBackend {
    /// An open device node.
    type Device;
    /// A buffer-producing context bound to a device.
    type Allocator;
    /// One allocated pixel buffer.
    type Buffer;
    /// Native mode payload carried inside [`DisplayMode`].
    type Mode: Clone + fmt::Debug;

    fn open(&self, path: &Path) -> io::Result<Self::Device>;
    fn close(&self, device: Self::Device);

    /// Claims exclusive mode-setting rights. Never blocks.
    fn set_master(&self, device: &Self::Device) -> io::Result<()>;
    fn drop_master(&self, device: &Self::Device) -> io::Result<()>;

    fn get_resources(&self, device: &Self::Device) -> io::Result<ModeResourceSet>;
    fn free_resources(&self, resources: ModeResourceSet);

    fn get_connector(
        &self,
        device: &Self::Device,
        id: ConnectorId,
    ) -> io::Result<ConnectorInfo<Self::Mode>>;
    fn free_connector(&self, connector: ConnectorInfo<Self::Mode>);

    fn get_encoder(&self, device: &Self::Device, id: EncoderId) -> io::Result<EncoderInfo>;
    fn free_encoder(&self, encoder: EncoderInfo);

    fn get_crtc(&self, device: &Self::Device, id: CrtcId) -> io::Result<CrtcInfo<Self::Mode>>;
    fn free_crtc(&self, crtc: CrtcInfo<Self::Mode>);

    fn create_allocator(&self, device: &Self::Device) -> io::Result<Self::Allocator>;
    fn destroy_allocator(&self, allocator: Self::Allocator);

    fn create_buffer(
        &self,
        allocator: &Self::Allocator,
        request: &BufferRequest,
    ) -> io::Result<Self::Buffer>;
    fn destroy_buffer(&self, allocator: &Self::Allocator, buffer: Self::Buffer);

    fn buffer_layout(&self, buffer: &Self::Buffer) -> io::Result<BufferLayout>;

    /// Maps `buffer` for CPU writes, runs `access` on the mapping, and unmaps
    /// before returning, whether `access` returns or unwinds.
    fn map_buffer(
        &self,
        buffer: &mut Self::Buffer,
        access: &mut dyn FnMut(&mut MappedView<'_>),
    ) -> io::Result<()>;

    fn add_framebuffer(
        &self,
        device: &Self::Device,
        buffer: &Self::Buffer,
        format: PixelFormat,
    ) -> io::Result<FramebufferId>;
    fn remove_framebuffer(&self, device: &Self::Device, framebuffer: FramebufferId)
        -> io::Result<()>;

    /// Programs `crtc` in one call. `None` framebuffer and mode blank it.
    fn set_crtc(
        &self,
        device: &Self::Device,
        crtc: CrtcId,
        framebuffer: Option<FramebufferId>,
        position: (u32, u32),
        connectors: &[ConnectorId],
        mode: Option<&DisplayMode<Self::Mode>>,
    ) -> io::Result<()>;
}

/// A value handed out by a backend that must go back through `release`.
///
/// Dropping the guard releases the value; [`Held::into_inner`] disarms it once
/// ownership has moved somewhere that releases it later.
pub(crate) struct Held<'a, B: KmsBackend, T> {
    backend: &'a B,
    value: ManuallyDrop<T>,
    release: fn(&B, T),
}

impl<'a, B: KmsBackend, T> Held<'a, B, T> {
    pub(crate) fn new(backend: &'a B, value: T, release: fn(&B, T)) -> Self {
        Self {
            backend,
            value: ManuallyDrop::new(value),
            release,
        }
    }

    pub(crate) fn into_inner(self) -> T {
        let mut this = ManuallyDrop::new(self);
        // SAFETY: `this` is never dropped, so `value` is taken exactly once.
        unsafe { ManuallyDrop::take(&mut this.value) }
    }
}

impl<B: KmsBackend, T> Deref for Held<'_, B, T> {
    type Target = T;

    fn deref(&self) -> &T {
        &self.value
    }
}

impl<B: KmsBackend, T> Drop for Held<'_, B, T> {
    fn drop(&mut self) {
        // SAFETY: `value` is only taken here or in `into_inner`, which skips drop.
        let value = unsafe { ManuallyDrop::take(&mut self.value) };
        (self.release)(self.backend, value);
    }
}
