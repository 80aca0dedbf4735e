// src/kms/types.rs

//! Backend-neutral descriptions of mode-setting objects.
//!
//! Descriptors carry plain ids so discovery and orchestration never touch a
//! concrete ioctl layer. `M` is the backend's native mode payload, kept next to
//! the decoded fields so a selected mode can be handed back to the controller
//! untouched.

use std::fmt;

use bitflags::bitflags;
use serde::{Deserialize, Serialize};

macro_rules! object_id {
    ($(#[$meta:meta])* $name:ident, $label:literal) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
        pub struct $name(pub u32);

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, concat!($label, " {}"), self.0)
            }
        }
    };
}

object_id!(
    /// A display connector (HDMI-A-1, eDP-1, ...).
    ConnectorId,
    "connector"
);
object_id!(EncoderId, "encoder");
object_id!(
    /// A scanout engine.
    CrtcId,
    "crtc"
);
object_id!(FramebufferId, "framebuffer");

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Connected,
    Disconnected,
    Unknown,
}

/// A video mode as reported by a connector or CRTC.
#[derive(Debug, Clone, PartialEq)]
pub struct DisplayMode<M> {
    pub width: u32,
    pub height: u32,
    pub refresh_hz: u32,
    pub name: String,
    /// Flagged by the sink as its preferred timing.
    pub preferred: bool,
    pub native: M,
}

impl<M> fmt::Display for DisplayMode<M> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}x{}@{}", self.width, self.height, self.refresh_hz)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ConnectorInfo<M> {
    pub id: ConnectorId,
    pub name: String,
    pub state: ConnectionState,
    /// Ordered by priority; the first entry is the one a sink prefers.
    pub modes: Vec<DisplayMode<M>>,
    pub encoders: Vec<EncoderId>,
}

impl<M> ConnectorInfo<M> {
    /// Connected and advertising at least one mode.
    pub fn is_usable(&self) -> bool {
        self.state == ConnectionState::Connected && !self.modes.is_empty()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EncoderInfo {
    pub id: EncoderId,
    /// CRTC currently bound to the encoder; `None` when unbound.
    pub crtc: Option<CrtcId>,
}

/// CRTC state at the time it was queried. Restoring a display means
/// programming this state back.
#[derive(Debug, Clone, PartialEq)]
pub struct CrtcInfo<M> {
    pub id: CrtcId,
    pub mode: Option<DisplayMode<M>>,
    pub framebuffer: Option<FramebufferId>,
    pub position: (u32, u32),
}

/// Snapshot of the objects a device exposes, in enumeration order.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ModeResourceSet {
    pub connectors: Vec<ConnectorId>,
    pub encoders: Vec<EncoderId>,
    pub crtcs: Vec<CrtcId>,
}

/// The connector/encoder/CRTC chain and mode chosen for scanout.
#[derive(Debug, Clone, PartialEq)]
pub struct OutputConfig<M> {
    pub connector: ConnectorInfo<M>,
    pub encoder: EncoderInfo,
    pub crtc: CrtcInfo<M>,
    pub mode: DisplayMode<M>,
}

impl<M> OutputConfig<M> {
    pub fn crtc_id(&self) -> CrtcId {
        self.crtc.id
    }

    pub fn connector_id(&self) -> ConnectorId {
        self.connector.id
    }
}

/// 32-bit packed pixel layouts the controller can scan out.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PixelFormat {
    /// 8 bits per channel RGB, top byte unused.
    #[default]
    Xrgb8888,
    Argb8888,
}

impl PixelFormat {
    /// Colour depth passed to legacy framebuffer registration.
    pub fn depth(self) -> u32 {
        match self {
            PixelFormat::Xrgb8888 => 24,
            PixelFormat::Argb8888 => 32,
        }
    }

    pub fn bits_per_pixel(self) -> u32 {
        32
    }

    pub fn bytes_per_pixel(self) -> u32 {
        self.bits_per_pixel() / 8
    }
}

bitflags! {
    /// What an allocated buffer will be used for.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
    pub struct BufferUsage: u32 {
        const SCANOUT = 1 << 0;
        const RENDERING = 1 << 1;
    }
}

impl Default for BufferUsage {
    fn default() -> Self {
        BufferUsage::SCANOUT | BufferUsage::RENDERING
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BufferRequest {
    pub width: u32,
    pub height: u32,
    pub format: PixelFormat,
    pub usage: BufferUsage,
}

/// Memory layout of an allocated buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BufferLayout {
    /// Bytes per row, padding included.
    pub stride: u32,
    /// Driver-local buffer handle.
    pub handle: u32,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn mode(width: u32, height: u32) -> DisplayMode<()> {
        DisplayMode {
            width,
            height,
            refresh_hz: 60,
            name: format!("{width}x{height}"),
            preferred: false,
            native: (),
        }
    }

    #[test]
    fn connector_without_modes_is_not_usable() {
        let mut connector = ConnectorInfo {
            id: ConnectorId(31),
            name: "HDMI-A-1".into(),
            state: ConnectionState::Connected,
            modes: Vec::new(),
            encoders: vec![EncoderId(40)],
        };
        assert!(!connector.is_usable());

        connector.modes.push(mode(1280, 720));
        assert!(connector.is_usable());

        connector.state = ConnectionState::Unknown;
        assert!(!connector.is_usable());
    }

    #[test]
    fn xrgb_registers_as_depth_24_bpp_32() {
        assert_eq!(PixelFormat::default(), PixelFormat::Xrgb8888);
        assert_eq!(PixelFormat::Xrgb8888.depth(), 24);
        assert_eq!(PixelFormat::Xrgb8888.bits_per_pixel(), 32);
        assert_eq!(PixelFormat::Argb8888.depth(), 32);
    }

    #[test]
    fn mode_displays_as_resolution_and_refresh() {
        assert_eq!(mode(1920, 1080).to_string(), "1920x1080@60");
        assert_eq!(CrtcId(7).to_string(), "crtc 7");
    }
}
