// src/probe.rs

//! Allocation probe: allocate, map and fill a buffer without touching the
//! display. Needs neither master rights nor a connected output.

use std::path::Path;

use log::info;

use crate::error::PipelineError;
use crate::kms::{BufferAllocator, BufferUsage, DeviceHandle, KmsBackend, PixelFormat};
use crate::render::fill_solid;

/// Parameters for [`probe_allocation`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProbeRequest {
    pub width: u32,
    pub height: u32,
    pub format: PixelFormat,
    pub usage: BufferUsage,
    /// 0xRRGGBB written to every pixel.
    pub color: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProbeReport {
    pub width: u32,
    pub height: u32,
    pub stride: u32,
}

pub fn probe_allocation<B: KmsBackend>(
    backend: &B,
    path: &Path,
    request: &ProbeRequest,
) -> Result<ProbeReport, PipelineError> {
    let device = DeviceHandle::open(backend, path)?;
    let allocator = BufferAllocator::create(&device)?;
    let buffer = allocator.allocate(request.width, request.height, request.format, request.usage)?;
    buffer.map(|view| fill_solid(view, request.color))?;

    let report = ProbeReport {
        width: buffer.width(),
        height: buffer.height(),
        stride: buffer.stride(),
    };
    info!(
        "Probe filled {}x{} buffer, stride {}",
        report.width, report.height, report.stride
    );
    Ok(report)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kms::{MockBackend, MockCall, MockOp};

    fn request() -> ProbeRequest {
        ProbeRequest {
            width: 100,
            height: 10,
            format: PixelFormat::Xrgb8888,
            usage: BufferUsage::default(),
            color: 0x00FF0000,
        }
    }

    #[test_log::test]
    fn probe_maps_fills_and_releases() {
        let backend = MockBackend::new();
        let report = probe_allocation(&backend, Path::new("/dev/dri/card0"), &request()).unwrap();

        assert_eq!(report.stride, 448);
        assert_eq!(
            backend.calls(),
            vec![
                MockCall::Open,
                MockCall::CreateAllocator,
                MockCall::CreateBuffer {
                    width: 100,
                    height: 10
                },
                MockCall::Map,
                MockCall::Unmap,
                MockCall::DestroyBuffer,
                MockCall::DestroyAllocator,
                MockCall::Close,
            ]
        );
        let frame = backend.last_frame().unwrap();
        assert_eq!(&frame[..4], &[0x00, 0x00, 0xFF, 0x00]);
        assert_eq!(&frame[396..400], &[0x00, 0x00, 0xFF, 0x00]);
        backend.assert_balanced();
    }

    #[test_log::test]
    fn probe_never_claims_master() {
        let backend = MockBackend::new();
        probe_allocation(&backend, Path::new("/dev/dri/card0"), &request()).unwrap();
        assert_eq!(backend.attempts(MockOp::SetMaster), 0);
        assert_eq!(backend.attempts(MockOp::AddFramebuffer), 0);
    }

    #[test_log::test]
    fn map_failure_still_releases_everything() {
        let backend = MockBackend::new();
        backend.fail_call(MockOp::MapBuffer, 1);
        let err = probe_allocation(&backend, Path::new("/dev/dri/card0"), &request()).unwrap_err();
        assert!(matches!(err, PipelineError::MapFailed(_)));
        backend.assert_balanced();
    }
}
