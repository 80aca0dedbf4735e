// src/kms/drm_backend.rs

//! [`KmsBackend`] over the kernel DRM/KMS interface, with GBM for buffers.

use std::fs::{File, OpenOptions};
use std::io;
use std::os::fd::{AsFd, BorrowedFd};
use std::path::Path;
use std::sync::Arc;

use drm::buffer::DrmFourcc;
use drm::control::{
    self, connector, crtc, encoder, framebuffer, Device as ControlDevice, Mode, ModeTypeFlags,
};
use drm::Device as _;
use gbm::{BufferObject, BufferObjectFlags};
use log::{debug, trace};

use crate::kms::backend::KmsBackend;
use crate::kms::buffer::MappedView;
use crate::kms::types::{
    BufferLayout, BufferRequest, BufferUsage, ConnectionState, ConnectorId, ConnectorInfo, CrtcId,
    CrtcInfo, DisplayMode, EncoderId, EncoderInfo, FramebufferId, ModeResourceSet, PixelFormat,
};

/// An open DRM card node. Cloning shares the file descriptor, which is how the
/// GBM device and the mode-setting calls reach the same card.
#[derive(Debug, Clone)]
pub struct Card(Arc<File>);

impl AsFd for Card {
    fn as_fd(&self) -> BorrowedFd<'_> {
        self.0.as_fd()
    }
}

impl drm::Device for Card {}
impl ControlDevice for Card {}

/// The real display controller.
#[derive(Debug, Default, Clone, Copy)]
pub struct DrmBackend;

impl DrmBackend {
    pub fn new() -> Self {
        Self
    }
}

fn handle<T: From<control::RawResourceHandle>>(raw: u32) -> io::Result<T> {
    control::from_u32(raw)
        .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidInput, "object id 0 is not valid"))
}

fn convert_mode(mode: &Mode) -> DisplayMode<Mode> {
    let (width, height) = mode.size();
    DisplayMode {
        width: u32::from(width),
        height: u32::from(height),
        refresh_hz: mode.vrefresh(),
        name: mode.name().to_string_lossy().into_owned(),
        preferred: mode.mode_type().contains(ModeTypeFlags::PREFERRED),
        native: *mode,
    }
}

fn fourcc(format: PixelFormat) -> DrmFourcc {
    match format {
        PixelFormat::Xrgb8888 => DrmFourcc::Xrgb8888,
        PixelFormat::Argb8888 => DrmFourcc::Argb8888,
    }
}

fn bo_flags(usage: BufferUsage) -> BufferObjectFlags {
    let mut flags = BufferObjectFlags::empty();
    if usage.contains(BufferUsage::SCANOUT) {
        flags |= BufferObjectFlags::SCANOUT;
    }
    if usage.contains(BufferUsage::RENDERING) {
        flags |= BufferObjectFlags::RENDERING;
    }
    flags
}

impl KmsBackend for DrmBackend {
    type Device = Card;
    type Allocator = gbm::Device<Card>;
    type Buffer = BufferObject<()>;
    type Mode = Mode;

    fn open(&self, path: &Path) -> io::Result<Card> {
        let file = OpenOptions::new().read(true).write(true).open(path)?;
        Ok(Card(Arc::new(file)))
    }

    fn close(&self, device: Card) {
        trace!("Closing DRM card ({} references)", Arc::strong_count(&device.0));
    }

    fn set_master(&self, device: &Card) -> io::Result<()> {
        device.acquire_master_lock()
    }

    fn drop_master(&self, device: &Card) -> io::Result<()> {
        device.release_master_lock()
    }

    fn get_resources(&self, device: &Card) -> io::Result<ModeResourceSet> {
        let handles = device.resource_handles()?;
        Ok(ModeResourceSet {
            connectors: handles
                .connectors()
                .iter()
                .map(|&h| ConnectorId(u32::from(h)))
                .collect(),
            encoders: handles
                .encoders()
                .iter()
                .map(|&h| EncoderId(u32::from(h)))
                .collect(),
            crtcs: handles
                .crtcs()
                .iter()
                .map(|&h| CrtcId(u32::from(h)))
                .collect(),
        })
    }

    fn free_resources(&self, _resources: ModeResourceSet) {
        trace!("Freed mode resources");
    }

    fn get_connector(&self, device: &Card, id: ConnectorId) -> io::Result<ConnectorInfo<Mode>> {
        let info = device.get_connector(handle::<connector::Handle>(id.0)?, true)?;
        let state = match info.state() {
            connector::State::Connected => ConnectionState::Connected,
            connector::State::Disconnected => ConnectionState::Disconnected,
            connector::State::Unknown => ConnectionState::Unknown,
        };
        Ok(ConnectorInfo {
            id,
            name: format!("{}-{}", info.interface().as_str(), info.interface_id()),
            state,
            modes: info.modes().iter().map(convert_mode).collect(),
            encoders: info
                .encoders()
                .iter()
                .map(|&h| EncoderId(u32::from(h)))
                .collect(),
        })
    }

    fn free_connector(&self, connector: ConnectorInfo<Mode>) {
        trace!("Freed {}", connector.id);
    }

    fn get_encoder(&self, device: &Card, id: EncoderId) -> io::Result<EncoderInfo> {
        let info = device.get_encoder(handle::<encoder::Handle>(id.0)?)?;
        Ok(EncoderInfo {
            id,
            crtc: info.crtc().map(|h| CrtcId(u32::from(h))),
        })
    }

    fn free_encoder(&self, encoder: EncoderInfo) {
        trace!("Freed {}", encoder.id);
    }

    fn get_crtc(&self, device: &Card, id: CrtcId) -> io::Result<CrtcInfo<Mode>> {
        let info = device.get_crtc(handle::<crtc::Handle>(id.0)?)?;
        Ok(CrtcInfo {
            id,
            mode: info.mode().as_ref().map(convert_mode),
            framebuffer: info.framebuffer().map(|h| FramebufferId(u32::from(h))),
            position: info.position(),
        })
    }

    fn free_crtc(&self, crtc: CrtcInfo<Mode>) {
        trace!("Freed {}", crtc.id);
    }

    fn create_allocator(&self, device: &Card) -> io::Result<gbm::Device<Card>> {
        gbm::Device::new(device.clone())
    }

    fn destroy_allocator(&self, allocator: gbm::Device<Card>) {
        drop(allocator);
        trace!("Destroyed GBM device");
    }

    fn create_buffer(
        &self,
        allocator: &gbm::Device<Card>,
        request: &BufferRequest,
    ) -> io::Result<BufferObject<()>> {
        allocator.create_buffer_object::<()>(
            request.width,
            request.height,
            fourcc(request.format),
            bo_flags(request.usage),
        )
    }

    fn destroy_buffer(&self, _allocator: &gbm::Device<Card>, buffer: BufferObject<()>) {
        drop(buffer);
        trace!("Destroyed GBM buffer object");
    }

    fn buffer_layout(&self, buffer: &BufferObject<()>) -> io::Result<BufferLayout> {
        let stride = drm::buffer::Buffer::pitch(buffer);
        if stride == 0 {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                "buffer reports a zero stride",
            ));
        }
        Ok(BufferLayout {
            stride,
            handle: u32::from(drm::buffer::Buffer::handle(buffer)),
        })
    }

    fn map_buffer(
        &self,
        buffer: &mut BufferObject<()>,
        access: &mut dyn FnMut(&mut MappedView<'_>),
    ) -> io::Result<()> {
        let (width, height) = drm::buffer::Buffer::size(buffer);
        buffer.map_mut(0, 0, width, height, |mapping| {
            let stride = mapping.stride();
            let mut view = MappedView::new(mapping.buffer_mut(), width, height, stride)?;
            access(&mut view);
            Ok(())
        })?
    }

    fn add_framebuffer(
        &self,
        device: &Card,
        buffer: &BufferObject<()>,
        format: PixelFormat,
    ) -> io::Result<FramebufferId> {
        let fb = device.add_framebuffer(buffer, format.depth(), format.bits_per_pixel())?;
        Ok(FramebufferId(u32::from(fb)))
    }

    fn remove_framebuffer(&self, device: &Card, framebuffer: FramebufferId) -> io::Result<()> {
        device.destroy_framebuffer(handle::<framebuffer::Handle>(framebuffer.0)?)
    }

    fn set_crtc(
        &self,
        device: &Card,
        crtc: CrtcId,
        framebuffer: Option<FramebufferId>,
        position: (u32, u32),
        connectors: &[ConnectorId],
        mode: Option<&DisplayMode<Mode>>,
    ) -> io::Result<()> {
        let framebuffer = framebuffer
            .map(|fb| handle::<framebuffer::Handle>(fb.0))
            .transpose()?;
        let connectors = connectors
            .iter()
            .map(|c| handle::<connector::Handle>(c.0))
            .collect::<io::Result<Vec<_>>>()?;
        debug!(
            "set_crtc {} fb={:?} mode={:?}",
            crtc,
            framebuffer,
            mode.map(|m| m.to_string())
        );
        device.set_crtc(
            handle::<crtc::Handle>(crtc.0)?,
            framebuffer,
            position,
            &connectors,
            mode.map(|m| m.native),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn usage_maps_onto_gbm_flags() {
        assert_eq!(
            bo_flags(BufferUsage::default()),
            BufferObjectFlags::SCANOUT | BufferObjectFlags::RENDERING
        );
        assert_eq!(bo_flags(BufferUsage::SCANOUT), BufferObjectFlags::SCANOUT);
    }

    #[test]
    fn zero_is_not_a_valid_object_id() {
        assert!(handle::<crtc::Handle>(0).is_err());
        assert!(handle::<crtc::Handle>(42).is_ok());
    }

    #[test]
    fn opening_a_missing_node_fails() {
        let err = DrmBackend::new()
            .open(Path::new("/nonexistent/dri/card0"))
            .unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::NotFound);
    }
}
