// src/error.rs

//! Error kinds raised while acquiring, using and releasing display resources.
//!
//! Every variant except [`PipelineError::RestoreFailed`] aborts forward
//! progress. `RestoreFailed` only ever reaches the log: teardown has to run to
//! completion no matter what the controller says.

use std::fmt;
use std::io;
use std::path::PathBuf;

use thiserror::Error;

/// The step of the acquisition pipeline an error belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Stage {
    OpenDevice,
    AcquireMaster,
    QueryResources,
    SelectOutput,
    CreateAllocator,
    AllocateBuffer,
    RegisterFramebuffer,
    MapBuffer,
    Commit,
    Restore,
    Lifecycle,
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Stage::OpenDevice => "open device",
            Stage::AcquireMaster => "acquire master",
            Stage::QueryResources => "query resources",
            Stage::SelectOutput => "select output",
            Stage::CreateAllocator => "create allocator",
            Stage::AllocateBuffer => "allocate buffer",
            Stage::RegisterFramebuffer => "register framebuffer",
            Stage::MapBuffer => "map buffer",
            Stage::Commit => "commit mode",
            Stage::Restore => "restore CRTC",
            Stage::Lifecycle => "pipeline lifecycle",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("cannot open {}: {source}", path.display())]
    DeviceUnavailable {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("cannot become DRM master: {0}")]
    MasterUnavailable(#[source] io::Error),

    #[error("cannot query mode resources: {0}")]
    QueryFailed(#[source] io::Error),

    #[error("no connected connector with a usable encoder and CRTC")]
    NoSuitableOutput,

    #[error("cannot create buffer allocator: {0}")]
    AllocatorInitFailed(#[source] io::Error),

    #[error("cannot allocate {width}x{height} buffer: {source}")]
    AllocationFailed {
        width: u32,
        height: u32,
        #[source]
        source: io::Error,
    },

    #[error("cannot register framebuffer: {0}")]
    FramebufferRegistrationFailed(#[source] io::Error),

    #[error("cannot map buffer: {0}")]
    MapFailed(#[source] io::Error),

    #[error("mode set rejected: {0}")]
    CommitFailed(#[source] io::Error),

    #[error("cannot restore CRTC: {0}")]
    RestoreFailed(#[source] io::Error),

    #[error("pipeline already ran; construct a new one")]
    PipelineClosed,
}

impl PipelineError {
    pub fn stage(&self) -> Stage {
        match self {
            PipelineError::DeviceUnavailable { .. } => Stage::OpenDevice,
            PipelineError::MasterUnavailable(_) => Stage::AcquireMaster,
            PipelineError::QueryFailed(_) => Stage::QueryResources,
            PipelineError::NoSuitableOutput => Stage::SelectOutput,
            PipelineError::AllocatorInitFailed(_) => Stage::CreateAllocator,
            PipelineError::AllocationFailed { .. } => Stage::AllocateBuffer,
            PipelineError::FramebufferRegistrationFailed(_) => Stage::RegisterFramebuffer,
            PipelineError::MapFailed(_) => Stage::MapBuffer,
            PipelineError::CommitFailed(_) => Stage::Commit,
            PipelineError::RestoreFailed(_) => Stage::Restore,
            PipelineError::PipelineClosed => Stage::Lifecycle,
        }
    }

    /// Whether the error stops the run. Only a failed restore is tolerated.
    pub fn is_fatal(&self) -> bool {
        !matches!(self, PipelineError::RestoreFailed(_))
    }

    /// One-line diagnostic naming the failed stage and its cause.
    pub fn diagnostic(&self) -> String {
        format!("{} failed: {}", self.stage(), self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn diagnostic_names_the_stage_and_the_cause() {
        let err = PipelineError::DeviceUnavailable {
            path: PathBuf::from("/dev/dri/card9"),
            source: io::Error::from(io::ErrorKind::NotFound),
        };
        let line = err.diagnostic();
        assert!(line.starts_with("open device failed: cannot open /dev/dri/card9"));
        assert!(!line.contains('\n'));
    }

    #[test]
    fn only_restore_failures_are_tolerated() {
        assert!(!PipelineError::RestoreFailed(io::Error::other("busy")).is_fatal());
        assert!(PipelineError::CommitFailed(io::Error::other("busy")).is_fatal());
        assert!(PipelineError::NoSuitableOutput.is_fatal());
    }
}
