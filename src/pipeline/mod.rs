// src/pipeline/mod.rs

//! The display pipeline: open, claim, discover, allocate, register, render,
//! commit, wait, and unwind.
//!
//! Every acquired resource is a scope guard declared as a local in
//! [`DisplayPipeline::run`]'s driver, in acquisition order. Rust drops locals in
//! reverse declaration order, so whichever stage fails (or panics), teardown
//! runs backwards from the last resource that was actually acquired:
//!
//! ```text
//! restore CRTC -> remove framebuffer -> destroy buffer -> destroy allocator
//!   -> free CRTC/encoder/connector -> free resources -> drop master -> close
//! ```
//!
//! Mapping is scoped to the render call, so it is gone before any of the above.

use std::fmt;
use std::ops::{Deref, DerefMut};
use std::path::PathBuf;

use log::{debug, info, warn};

use crate::error::PipelineError;
use crate::kms::discovery::{enumerate, find_output};
use crate::kms::{
    BufferAllocator, BufferUsage, ConnectorId, CrtcId, DeviceHandle, FramebufferId,
    FramebufferRegistration, KmsBackend, MappedView, OutputConfig, PixelFormat,
};
use crate::release::{ReleaseReason, ReleaseSignal};


/// Lifecycle states, in forward order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum PipelineState {
    Idle,
    DeviceOpen,
    Mastered,
    ResourcesEnumerated,
    OutputSelected,
    BufferAllocated,
    FramebufferRegistered,
    Rendered,
    Committed,
    Running,
    Unwinding,
    Closed,
}

impl fmt::Display for PipelineState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// Records state transitions. Transitions only move forward.
#[derive(Debug, Clone)]
pub struct StateTracker {
    state: PipelineState,
    history: Vec<PipelineState>,
}

impl Default for StateTracker {
    fn default() -> Self {
        Self {
            state: PipelineState::Idle,
            history: vec![PipelineState::Idle],
        }
    }
}

impl StateTracker {
    pub fn state(&self) -> PipelineState {
        self.state
    }

    pub fn history(&self) -> &[PipelineState] {
        &self.history
    }

    /// Moves to `next`. Backward or repeated transitions are ignored.
    pub fn advance(&mut self, next: PipelineState) {
        if next == self.state {
            return;
        }
        if next < self.state {
            warn!("Ignoring transition {} -> {}", self.state, next);
            return;
        }
        debug!("Pipeline {} -> {}", self.state, next);
        self.state = next;
        self.history.push(next);
    }

    /// Passes `result` through, switching to `Unwinding` if it is an error.
    pub fn check<T>(&mut self, result: Result<T, PipelineError>) -> Result<T, PipelineError> {
        if let Err(e) = &result {
            debug!("{} (in state {})", e.diagnostic(), self.state);
            self.advance(PipelineState::Unwinding);
        }
        result
    }

    /// Like [`check`](Self::check), and advances to `next` on success.
    pub fn attempt<T>(
        &mut self,
        next: PipelineState,
        result: Result<T, PipelineError>,
    ) -> Result<T, PipelineError> {
        let value = self.check(result)?;
        self.advance(next);
        Ok(value)
    }
}

/// Moves the tracker to `Closed` once everything inside has been dropped,
/// including when unwinding from a panic.
struct Closing<'t>(&'t mut StateTracker);

impl Deref for Closing<'_> {
    type Target = StateTracker;

    fn deref(&self) -> &StateTracker {
        self.0
    }
}

impl DerefMut for Closing<'_> {
    fn deref_mut(&mut self) -> &mut StateTracker {
        self.0
    }
}

impl Drop for Closing<'_> {
    fn drop(&mut self) {
        self.0.advance(PipelineState::Unwinding);
        self.0.advance(PipelineState::Closed);
    }
}

/// What the pipeline needs besides the backend.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PipelineSettings {
    pub device_path: PathBuf,
    pub format: PixelFormat,
    pub usage: BufferUsage,
}

impl Default for PipelineSettings {
    fn default() -> Self {
        Self {
            device_path: PathBuf::from("/dev/dri/card0"),
            format: PixelFormat::default(),
            usage: BufferUsage::default(),
        }
    }
}

/// Summary of a completed run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunReport {
    pub connector: ConnectorId,
    pub connector_name: String,
    pub crtc: CrtcId,
    /// `WIDTHxHEIGHT@HZ`.
    pub mode: String,
    pub framebuffer: FramebufferId,
    pub stride: u32,
    pub reason: ReleaseReason,
}

/// Single-use owner of one run against one device.
pub struct DisplayPipeline<'a, B: KmsBackend> {
    backend: &'a B,
    settings: PipelineSettings,
    tracker: StateTracker,
}

impl<'a, B: KmsBackend> DisplayPipeline<'a, B> {
    pub fn new(backend: &'a B, settings: PipelineSettings) -> Self {
        Self {
            backend,
            settings,
            tracker: StateTracker::default(),
        }
    }

    pub fn state(&self) -> PipelineState {
        self.tracker.state()
    }

    pub fn history(&self) -> &[PipelineState] {
        self.tracker.history()
    }

    pub fn settings(&self) -> &PipelineSettings {
        &self.settings
    }

    /// Runs the pipeline once. `render` is called exactly once with the
    /// mapped buffer, after framebuffer registration and before the mode
    /// switch. Everything acquired is released before this returns, on every
    /// path. A second call fails with [`PipelineError::PipelineClosed`].
    pub fn run<R>(
        &mut self,
        render: R,
        release: &mut dyn ReleaseSignal,
    ) -> Result<RunReport, PipelineError>
    where
        R: FnOnce(&mut MappedView<'_>),
    {
        if self.tracker.state() != PipelineState::Idle {
            return Err(PipelineError::PipelineClosed);
        }
        let mut tracker = Closing(&mut self.tracker);
        let result = drive(self.backend, &self.settings, &mut tracker, render, release);
        drop(tracker);
        if result.is_ok() {
            info!("Display pipeline closed cleanly");
        }
        result
    }
}

fn drive<B, R>(
    backend: &B,
    settings: &PipelineSettings,
    tracker: &mut StateTracker,
    render: R,
    release: &mut dyn ReleaseSignal,
) -> Result<RunReport, PipelineError>
where
    B: KmsBackend,
    R: FnOnce(&mut MappedView<'_>),
{
    use PipelineState::*;

    let device = tracker.attempt(DeviceOpen, DeviceHandle::open(backend, &settings.device_path))?;
    let _master = tracker.attempt(Mastered, device.acquire_master())?;
    let resources = tracker.attempt(ResourcesEnumerated, enumerate(&device))?;
    let output = tracker.attempt(OutputSelected, find_output(&device, &resources))?;

    let allocator = tracker.check(BufferAllocator::create(&device))?;
    let buffer = tracker.attempt(
        BufferAllocated,
        allocator.allocate(
            output.mode.width,
            output.mode.height,
            settings.format,
            settings.usage,
        ),
    )?;
    let registration = tracker.attempt(FramebufferRegistered, buffer.register_framebuffer())?;
    tracker.attempt(Rendered, buffer.map(render))?;
    let _committed = tracker.attempt(Committed, commit(&device, &*output, &registration))?;
    tracker.advance(Running);

    let reason = match release.wait() {
        Ok(reason) => reason,
        Err(e) => {
            warn!("Release wait failed, tearing down: {:#}", e);
            ReleaseReason::Cancelled
        }
    };
    info!("Released by {}", reason);

    let report = RunReport {
        connector: output.connector_id(),
        connector_name: output.connector.name.clone(),
        crtc: output.crtc_id(),
        mode: output.mode.to_string(),
        framebuffer: registration.id(),
        stride: buffer.stride(),
        reason,
    };
    tracker.advance(Unwinding);
    Ok(report)
}

/// Restores the CRTC when dropped.
pub struct CommitGuard<'a, B: KmsBackend> {
    device: &'a DeviceHandle<'a, B>,
    output: &'a OutputConfig<B::Mode>,
}

impl<B: KmsBackend> Drop for CommitGuard<'_, B> {
    fn drop(&mut self) {
        if let Err(e) = restore(self.device, self.output) {
            warn!("{}", e.diagnostic());
        }
    }
}

/// Programs the output's CRTC to scan out `framebuffer` in the selected mode,
/// in one all-or-nothing call.
pub fn commit<'a, B: KmsBackend>(
    device: &'a DeviceHandle<'a, B>,
    output: &'a OutputConfig<B::Mode>,
    framebuffer: &FramebufferRegistration<'_, B>,
) -> Result<CommitGuard<'a, B>, PipelineError> {
    let raw = device.raw().map_err(PipelineError::CommitFailed)?;
    device
        .backend()
        .set_crtc(
            raw,
            output.crtc_id(),
            Some(framebuffer.id()),
            (0, 0),
            &[output.connector_id()],
            Some(&output.mode),
        )
        .map_err(PipelineError::CommitFailed)?;
    info!(
        "Showing {} on {} via {} at {}",
        framebuffer.id(),
        output.connector.name,
        output.crtc_id(),
        output.mode
    );
    Ok(CommitGuard { device, output })
}

/// Puts the CRTC back the way discovery found it, or blanks it when it was
/// not scanning anything out. One attempt, no retry.
pub fn restore<B: KmsBackend>(
    device: &DeviceHandle<'_, B>,
    output: &OutputConfig<B::Mode>,
) -> Result<(), PipelineError> {
    let raw = device.raw().map_err(PipelineError::RestoreFailed)?;
    let previous = &output.crtc;
    let backend = device.backend();
    let result = match (&previous.mode, previous.framebuffer) {
        (Some(mode), Some(framebuffer)) => {
            info!("Restoring {} to {} in {}", previous.id, framebuffer, mode);
            backend.set_crtc(
                raw,
                previous.id,
                Some(framebuffer),
                previous.position,
                &[output.connector_id()],
                Some(mode),
            )
        }
        _ => {
            info!("Blanking {}", previous.id);
            backend.set_crtc(raw, previous.id, None, (0, 0), &[], None)
        }
    };
    result.map_err(PipelineError::RestoreFailed)
}
