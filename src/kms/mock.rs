// src/kms/mock.rs

//! In-memory [`KmsBackend`] for exercising discovery and the pipeline without
//! hardware.
//!
//! The mock keeps an ordered log of every successful call, can fail the N-th
//! call of any operation, and records lifecycle violations (double releases,
//! releasing a buffer that is still registered, closing a device that still
//! owns objects) instead of panicking, so tests can assert on them afterwards.

use std::cell::RefCell;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::io;
use std::path::Path;

use log::trace;

use crate::kms::backend::KmsBackend;
use crate::kms::buffer::MappedView;
use crate::kms::types::{
    BufferLayout, BufferRequest, ConnectionState, ConnectorId, ConnectorInfo, CrtcId, CrtcInfo,
    DisplayMode, EncoderId, EncoderInfo, FramebufferId, ModeResourceSet, PixelFormat,
};

/// Row pitch alignment applied to mock buffers.
const STRIDE_ALIGN: u32 = 64;

/// Operations that can be made to fail.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MockOp {
    Open,
    SetMaster,
    DropMaster,
    GetResources,
    GetConnector,
    GetEncoder,
    GetCrtc,
    CreateAllocator,
    CreateBuffer,
    BufferLayout,
    MapBuffer,
    AddFramebuffer,
    RemoveFramebuffer,
    SetCrtc,
}

/// One successful backend call, in the order it happened.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MockCall {
    Open,
    Close,
    SetMaster,
    DropMaster,
    GetResources,
    FreeResources,
    GetConnector(ConnectorId),
    FreeConnector(ConnectorId),
    GetEncoder(EncoderId),
    FreeEncoder(EncoderId),
    GetCrtc(CrtcId),
    FreeCrtc(CrtcId),
    CreateAllocator,
    DestroyAllocator,
    CreateBuffer { width: u32, height: u32 },
    DestroyBuffer,
    Map,
    Unmap,
    AddFramebuffer(FramebufferId),
    RemoveFramebuffer(FramebufferId),
    SetCrtc {
        crtc: CrtcId,
        framebuffer: Option<FramebufferId>,
    },
}

/// Resource classes whose acquisitions and releases must pair up.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum ResourceKind {
    Device,
    Master,
    Resources,
    Connector,
    Encoder,
    Crtc,
    Allocator,
    Buffer,
    Mapping,
    Framebuffer,
}

impl MockCall {
    /// The resource this call acquires (+1) or releases (-1), if any.
    pub fn effect(&self) -> Option<(ResourceKind, i64)> {
        let effect = match self {
            MockCall::Open => (ResourceKind::Device, 1),
            MockCall::Close => (ResourceKind::Device, -1),
            MockCall::SetMaster => (ResourceKind::Master, 1),
            MockCall::DropMaster => (ResourceKind::Master, -1),
            MockCall::GetResources => (ResourceKind::Resources, 1),
            MockCall::FreeResources => (ResourceKind::Resources, -1),
            MockCall::GetConnector(_) => (ResourceKind::Connector, 1),
            MockCall::FreeConnector(_) => (ResourceKind::Connector, -1),
            MockCall::GetEncoder(_) => (ResourceKind::Encoder, 1),
            MockCall::FreeEncoder(_) => (ResourceKind::Encoder, -1),
            MockCall::GetCrtc(_) => (ResourceKind::Crtc, 1),
            MockCall::FreeCrtc(_) => (ResourceKind::Crtc, -1),
            MockCall::CreateAllocator => (ResourceKind::Allocator, 1),
            MockCall::DestroyAllocator => (ResourceKind::Allocator, -1),
            MockCall::CreateBuffer { .. } => (ResourceKind::Buffer, 1),
            MockCall::DestroyBuffer => (ResourceKind::Buffer, -1),
            MockCall::Map => (ResourceKind::Mapping, 1),
            MockCall::Unmap => (ResourceKind::Mapping, -1),
            MockCall::AddFramebuffer(_) => (ResourceKind::Framebuffer, 1),
            MockCall::RemoveFramebuffer(_) => (ResourceKind::Framebuffer, -1),
            MockCall::SetCrtc { .. } => return None,
        };
        Some(effect)
    }

    pub fn is_release(&self) -> bool {
        matches!(self.effect(), Some((_, -1)))
    }
}

#[derive(Debug, Clone)]
struct MockConnector {
    id: ConnectorId,
    state: ConnectionState,
    modes: Vec<(u32, u32)>,
    encoders: Vec<EncoderId>,
}

#[derive(Debug, Clone)]
struct MockCrtc {
    id: CrtcId,
    mode: Option<(u32, u32)>,
    framebuffer: Option<FramebufferId>,
}

#[derive(Debug, Clone, Default)]
struct MockTopology {
    connectors: Vec<MockConnector>,
    encoders: Vec<(EncoderId, Option<CrtcId>)>,
    crtcs: Vec<MockCrtc>,
}

#[derive(Debug)]
pub struct MockDevice {
    id: u32,
}

#[derive(Debug)]
pub struct MockAllocator {
    id: u32,
}

#[derive(Debug)]
pub struct MockBuffer {
    id: u32,
    allocator: u32,
    width: u32,
    height: u32,
    stride: u32,
    pixels: Vec<u8>,
}

#[derive(Debug, Default)]
struct MockState {
    calls: Vec<MockCall>,
    violations: Vec<String>,
    attempts: HashMap<MockOp, usize>,
    failures: Vec<(MockOp, usize)>,
    next_id: u32,
    open_devices: BTreeSet<u32>,
    master: Option<u32>,
    allocators: BTreeSet<u32>,
    buffers: BTreeMap<u32, u32>,
    framebuffers: BTreeMap<FramebufferId, u32>,
    last_frame: Option<Vec<u8>>,
}

impl MockState {
    fn next_id(&mut self) -> u32 {
        self.next_id += 1;
        self.next_id
    }

    fn record(&mut self, call: MockCall) {
        trace!("mock: {:?}", call);
        self.calls.push(call);
    }

    fn violation(&mut self, message: String) {
        log::warn!("mock lifecycle violation: {}", message);
        self.violations.push(message);
    }

    /// Counts an attempt at `op` and fails it if it was scripted to fail.
    fn attempt(&mut self, op: MockOp) -> io::Result<()> {
        let count = self.attempts.entry(op).or_insert(0);
        *count += 1;
        if self.failures.contains(&(op, *count)) {
            trace!("mock: injecting failure into {:?} call #{}", op, count);
            return Err(io::Error::other(format!("injected {op:?} failure")));
        }
        Ok(())
    }
}

/// Scriptable in-memory display controller.
#[derive(Debug, Default)]
pub struct MockBackend {
    topology: MockTopology,
    state: RefCell<MockState>,
}

impl MockBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a connector. `modes` is in priority order.
    pub fn with_connector(
        mut self,
        id: u32,
        state: ConnectionState,
        modes: &[(u32, u32)],
        encoders: &[u32],
    ) -> Self {
        self.topology.connectors.push(MockConnector {
            id: ConnectorId(id),
            state,
            modes: modes.to_vec(),
            encoders: encoders.iter().copied().map(EncoderId).collect(),
        });
        self
    }

    /// Adds an encoder. A `crtc` of 0 means no CRTC is bound.
    pub fn with_encoder(mut self, id: u32, crtc: u32) -> Self {
        let crtc = (crtc != 0).then_some(CrtcId(crtc));
        self.topology.encoders.push((EncoderId(id), crtc));
        self
    }

    /// Adds an idle CRTC.
    pub fn with_crtc(mut self, id: u32) -> Self {
        self.topology.crtcs.push(MockCrtc {
            id: CrtcId(id),
            mode: None,
            framebuffer: None,
        });
        self
    }

    /// Adds a CRTC that is already scanning out `framebuffer` in `mode`.
    pub fn with_active_crtc(mut self, id: u32, mode: (u32, u32), framebuffer: u32) -> Self {
        self.topology.crtcs.push(MockCrtc {
            id: CrtcId(id),
            mode: Some(mode),
            framebuffer: Some(FramebufferId(framebuffer)),
        });
        self
    }

    /// A single connected output: connector 31 -> encoder 40 -> crtc 50.
    pub fn single_output(modes: &[(u32, u32)]) -> Self {
        Self::new()
            .with_connector(31, ConnectionState::Connected, modes, &[40])
            .with_encoder(40, 50)
            .with_crtc(50)
    }

    /// Makes the `nth` (1-based) call of `op` fail.
    pub fn fail_call(&self, op: MockOp, nth: usize) {
        self.state.borrow_mut().failures.push((op, nth));
    }

    pub fn calls(&self) -> Vec<MockCall> {
        self.state.borrow().calls.clone()
    }

    /// Releases only, in the order they happened.
    pub fn releases(&self) -> Vec<MockCall> {
        self.calls().into_iter().filter(MockCall::is_release).collect()
    }

    pub fn attempts(&self, op: MockOp) -> usize {
        self.state.borrow().attempts.get(&op).copied().unwrap_or(0)
    }

    pub fn violations(&self) -> Vec<String> {
        self.state.borrow().violations.clone()
    }

    /// Pixels of the most recently unmapped buffer.
    pub fn last_frame(&self) -> Option<Vec<u8>> {
        self.state.borrow().last_frame.clone()
    }

    /// Acquisitions minus releases, per resource class, omitting balanced ones.
    pub fn outstanding(&self) -> BTreeMap<ResourceKind, i64> {
        let mut totals = BTreeMap::new();
        for (kind, delta) in self.state.borrow().calls.iter().filter_map(MockCall::effect) {
            *totals.entry(kind).or_insert(0) += delta;
        }
        totals.retain(|_, count| *count != 0);
        totals
    }

    /// Panics unless every acquisition was released exactly once and no
    /// ordering violation was seen.
    pub fn assert_balanced(&self) {
        let outstanding = self.outstanding();
        let violations = self.violations();
        assert!(
            outstanding.is_empty() && violations.is_empty(),
            "unbalanced mock backend: outstanding={:?} violations={:?} calls={:?}",
            outstanding,
            violations,
            self.calls()
        );
    }

    fn mode(width: u32, height: u32, preferred: bool) -> DisplayMode<()> {
        DisplayMode {
            width,
            height,
            refresh_hz: 60,
            name: format!("{width}x{height}"),
            preferred,
            native: (),
        }
    }

    fn not_found(what: impl std::fmt::Display) -> io::Error {
        io::Error::new(io::ErrorKind::NotFound, format!("no such {what}"))
    }
}

impl KmsBackend for MockBackend {
    type Device = MockDevice;
    type Allocator = MockAllocator;
    type Buffer = MockBuffer;
    type Mode = ();

    fn open(&self, _path: &Path) -> io::Result<MockDevice> {
        let mut state = self.state.borrow_mut();
        state.attempt(MockOp::Open)?;
        let id = state.next_id();
        state.open_devices.insert(id);
        state.record(MockCall::Open);
        Ok(MockDevice { id })
    }

    fn close(&self, device: MockDevice) {
        let mut state = self.state.borrow_mut();
        if !state.open_devices.remove(&device.id) {
            state.violation(format!("device {} closed twice", device.id));
        }
        if state.master == Some(device.id) {
            state.violation(format!("device {} closed while still master", device.id));
            state.master = None;
        }
        let live: Vec<ResourceKind> = {
            let mut totals: BTreeMap<ResourceKind, i64> = BTreeMap::new();
            for (kind, delta) in state.calls.iter().filter_map(MockCall::effect) {
                *totals.entry(kind).or_insert(0) += delta;
            }
            totals
                .into_iter()
                .filter(|(kind, count)| {
                    *count > 0 && !matches!(kind, ResourceKind::Device | ResourceKind::Master)
                })
                .map(|(kind, _)| kind)
                .collect()
        };
        if !live.is_empty() && state.open_devices.is_empty() {
            state.violation(format!(
                "device {} closed while {:?} still held",
                device.id, live
            ));
        }
        state.record(MockCall::Close);
    }

    fn set_master(&self, device: &MockDevice) -> io::Result<()> {
        let mut state = self.state.borrow_mut();
        state.attempt(MockOp::SetMaster)?;
        match state.master {
            Some(holder) if holder != device.id => {
                return Err(io::Error::from_raw_os_error(libc::EBUSY));
            }
            Some(_) => return Ok(()),
            None => {}
        }
        state.master = Some(device.id);
        state.record(MockCall::SetMaster);
        Ok(())
    }

    fn drop_master(&self, device: &MockDevice) -> io::Result<()> {
        let mut state = self.state.borrow_mut();
        state.attempt(MockOp::DropMaster)?;
        if state.master != Some(device.id) {
            state.violation(format!("device {} dropped master it does not hold", device.id));
        }
        state.master = None;
        state.record(MockCall::DropMaster);
        Ok(())
    }

    fn get_resources(&self, _device: &MockDevice) -> io::Result<ModeResourceSet> {
        let mut state = self.state.borrow_mut();
        state.attempt(MockOp::GetResources)?;
        state.record(MockCall::GetResources);
        Ok(ModeResourceSet {
            connectors: self.topology.connectors.iter().map(|c| c.id).collect(),
            encoders: self.topology.encoders.iter().map(|(id, _)| *id).collect(),
            crtcs: self.topology.crtcs.iter().map(|c| c.id).collect(),
        })
    }

    fn free_resources(&self, _resources: ModeResourceSet) {
        self.state.borrow_mut().record(MockCall::FreeResources);
    }

    fn get_connector(&self, _device: &MockDevice, id: ConnectorId) -> io::Result<ConnectorInfo<()>> {
        let mut state = self.state.borrow_mut();
        state.attempt(MockOp::GetConnector)?;
        let connector = self
            .topology
            .connectors
            .iter()
            .find(|c| c.id == id)
            .ok_or_else(|| Self::not_found(id))?;
        state.record(MockCall::GetConnector(id));
        Ok(ConnectorInfo {
            id,
            name: format!("Mock-{}", id.0),
            state: connector.state,
            modes: connector
                .modes
                .iter()
                .enumerate()
                .map(|(index, &(w, h))| Self::mode(w, h, index == 0))
                .collect(),
            encoders: connector.encoders.clone(),
        })
    }

    fn free_connector(&self, connector: ConnectorInfo<()>) {
        self.state
            .borrow_mut()
            .record(MockCall::FreeConnector(connector.id));
    }

    fn get_encoder(&self, _device: &MockDevice, id: EncoderId) -> io::Result<EncoderInfo> {
        let mut state = self.state.borrow_mut();
        state.attempt(MockOp::GetEncoder)?;
        let (_, crtc) = self
            .topology
            .encoders
            .iter()
            .find(|(encoder, _)| *encoder == id)
            .ok_or_else(|| Self::not_found(id))?;
        state.record(MockCall::GetEncoder(id));
        Ok(EncoderInfo { id, crtc: *crtc })
    }

    fn free_encoder(&self, encoder: EncoderInfo) {
        self.state
            .borrow_mut()
            .record(MockCall::FreeEncoder(encoder.id));
    }

    fn get_crtc(&self, _device: &MockDevice, id: CrtcId) -> io::Result<CrtcInfo<()>> {
        let mut state = self.state.borrow_mut();
        state.attempt(MockOp::GetCrtc)?;
        let crtc = self
            .topology
            .crtcs
            .iter()
            .find(|c| c.id == id)
            .ok_or_else(|| Self::not_found(id))?;
        state.record(MockCall::GetCrtc(id));
        Ok(CrtcInfo {
            id,
            mode: crtc.mode.map(|(w, h)| Self::mode(w, h, false)),
            framebuffer: crtc.framebuffer,
            position: (0, 0),
        })
    }

    fn free_crtc(&self, crtc: CrtcInfo<()>) {
        self.state.borrow_mut().record(MockCall::FreeCrtc(crtc.id));
    }

    fn create_allocator(&self, _device: &MockDevice) -> io::Result<MockAllocator> {
        let mut state = self.state.borrow_mut();
        state.attempt(MockOp::CreateAllocator)?;
        let id = state.next_id();
        state.allocators.insert(id);
        state.record(MockCall::CreateAllocator);
        Ok(MockAllocator { id })
    }

    fn destroy_allocator(&self, allocator: MockAllocator) {
        let mut state = self.state.borrow_mut();
        if !state.allocators.remove(&allocator.id) {
            state.violation(format!("allocator {} destroyed twice", allocator.id));
        }
        if state.buffers.values().any(|owner| *owner == allocator.id) {
            state.violation(format!(
                "allocator {} destroyed with live buffers",
                allocator.id
            ));
        }
        state.record(MockCall::DestroyAllocator);
    }

    fn create_buffer(
        &self,
        allocator: &MockAllocator,
        request: &BufferRequest,
    ) -> io::Result<MockBuffer> {
        let mut state = self.state.borrow_mut();
        state.attempt(MockOp::CreateBuffer)?;
        let row = request.width * request.format.bytes_per_pixel();
        let stride = row.div_ceil(STRIDE_ALIGN) * STRIDE_ALIGN;
        let id = state.next_id();
        state.buffers.insert(id, allocator.id);
        state.record(MockCall::CreateBuffer {
            width: request.width,
            height: request.height,
        });
        Ok(MockBuffer {
            id,
            allocator: allocator.id,
            width: request.width,
            height: request.height,
            stride,
            pixels: vec![0; stride as usize * request.height as usize],
        })
    }

    fn destroy_buffer(&self, allocator: &MockAllocator, buffer: MockBuffer) {
        let mut state = self.state.borrow_mut();
        if state.buffers.remove(&buffer.id).is_none() {
            state.violation(format!("buffer {} destroyed twice", buffer.id));
        }
        if buffer.allocator != allocator.id {
            state.violation(format!(
                "buffer {} destroyed through a foreign allocator",
                buffer.id
            ));
        }
        if state.framebuffers.values().any(|b| *b == buffer.id) {
            state.violation(format!(
                "buffer {} destroyed while registered as a framebuffer",
                buffer.id
            ));
        }
        state.record(MockCall::DestroyBuffer);
    }

    fn buffer_layout(&self, buffer: &MockBuffer) -> io::Result<BufferLayout> {
        self.state.borrow_mut().attempt(MockOp::BufferLayout)?;
        Ok(BufferLayout {
            stride: buffer.stride,
            handle: buffer.id,
        })
    }

    fn map_buffer(
        &self,
        buffer: &mut MockBuffer,
        access: &mut dyn FnMut(&mut MappedView<'_>),
    ) -> io::Result<()> {
        {
            let mut state = self.state.borrow_mut();
            state.attempt(MockOp::MapBuffer)?;
            state.record(MockCall::Map);
        }

        struct Unmap<'m> {
            state: &'m RefCell<MockState>,
            frame: Option<Vec<u8>>,
        }
        impl Drop for Unmap<'_> {
            fn drop(&mut self) {
                let mut state = self.state.borrow_mut();
                if let Some(frame) = self.frame.take() {
                    state.last_frame = Some(frame);
                }
                state.record(MockCall::Unmap);
            }
        }

        // Armed before `access` runs so a panicking renderer still unmaps.
        let mut unmap = Unmap {
            state: &self.state,
            frame: None,
        };
        let (width, height, stride) = (buffer.width, buffer.height, buffer.stride);
        {
            let mut view = MappedView::new(&mut buffer.pixels, width, height, stride)?;
            access(&mut view);
        }
        unmap.frame = Some(buffer.pixels.clone());
        Ok(())
    }

    fn add_framebuffer(
        &self,
        _device: &MockDevice,
        buffer: &MockBuffer,
        format: PixelFormat,
    ) -> io::Result<FramebufferId> {
        let mut state = self.state.borrow_mut();
        state.attempt(MockOp::AddFramebuffer)?;
        if format.bits_per_pixel() != 32 {
            return Err(io::Error::from_raw_os_error(libc::EINVAL));
        }
        let id = FramebufferId(100 + state.next_id());
        state.framebuffers.insert(id, buffer.id);
        state.record(MockCall::AddFramebuffer(id));
        Ok(id)
    }

    fn remove_framebuffer(&self, _device: &MockDevice, framebuffer: FramebufferId) -> io::Result<()> {
        let mut state = self.state.borrow_mut();
        state.attempt(MockOp::RemoveFramebuffer)?;
        if state.framebuffers.remove(&framebuffer).is_none() {
            state.violation(format!("{framebuffer} removed but not registered"));
        }
        state.record(MockCall::RemoveFramebuffer(framebuffer));
        Ok(())
    }

    fn set_crtc(
        &self,
        device: &MockDevice,
        crtc: CrtcId,
        framebuffer: Option<FramebufferId>,
        _position: (u32, u32),
        _connectors: &[ConnectorId],
        _mode: Option<&DisplayMode<()>>,
    ) -> io::Result<()> {
        let mut state = self.state.borrow_mut();
        state.attempt(MockOp::SetCrtc)?;
        if state.master != Some(device.id) {
            return Err(io::Error::from_raw_os_error(libc::EACCES));
        }
        if !self.topology.crtcs.iter().any(|c| c.id == crtc) {
            return Err(Self::not_found(crtc));
        }
        state.record(MockCall::SetCrtc { crtc, framebuffer });
        Ok(())
    }
}
