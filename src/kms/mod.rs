// src/kms/mod.rs

//! Display controller resources and their lifetimes.

pub mod backend;
pub mod buffer;
pub mod device;
pub mod discovery;
pub mod drm_backend;
pub mod mock;
pub mod types;

pub use backend::KmsBackend;
pub use buffer::{BufferAllocator, FramebufferRegistration, MappedView, ScanoutBuffer};
pub use device::{DeviceHandle, MasterClaim};
pub use discovery::{enumerate, find_output, ModeResources, SelectedOutput};
pub use drm_backend::{Card, DrmBackend};
pub use mock::{MockBackend, MockCall, MockOp, ResourceKind};
pub use types::{
    BufferLayout, BufferRequest, BufferUsage, ConnectionState, ConnectorId, ConnectorInfo,
    CrtcId, CrtcInfo, DisplayMode, EncoderId, EncoderInfo, FramebufferId, ModeResourceSet,
    OutputConfig, PixelFormat,
};
