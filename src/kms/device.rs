// src/kms/device.rs

//! Ownership of an open display controller device and its master claim.

use std::cell::Cell;
use std::io;
use std::path::{Path, PathBuf};

use log::{debug, info, warn};

use crate::error::PipelineError;
use crate::kms::backend::KmsBackend;

/// An open device node. Root of every other display resource.
///
/// Dropping the handle drops mastership if it is still held and then closes
/// the device. Guards that depend on the device borrow it, so the borrow
/// checker refuses to close it while any of them is alive.
pub struct DeviceHandle<'a, B: KmsBackend> {
    backend: &'a B,
    device: Option<B::Device>,
    path: PathBuf,
    is_master: Cell<bool>,
}

impl<'a, B: KmsBackend> DeviceHandle<'a, B> {
    /// Opens `path` read/write.
    pub fn open(backend: &'a B, path: &Path) -> Result<Self, PipelineError> {
        let device = backend
            .open(path)
            .map_err(|source| PipelineError::DeviceUnavailable {
                path: path.to_path_buf(),
                source,
            })?;
        info!("Opened display device {}", path.display());
        Ok(Self {
            backend,
            device: Some(device),
            path: path.to_path_buf(),
            is_master: Cell::new(false),
        })
    }

    /// Claims exclusive mode-setting rights. Fails immediately when another
    /// client holds them; there is no queueing.
    pub fn acquire_master(&self) -> Result<MasterClaim<'_, B>, PipelineError> {
        let device = self.raw().map_err(PipelineError::MasterUnavailable)?;
        self.backend
            .set_master(device)
            .map_err(PipelineError::MasterUnavailable)?;
        self.is_master.set(true);
        info!("Became DRM master on {}", self.path.display());
        Ok(MasterClaim { device: self })
    }

    /// Drops mastership. No-op when not master.
    pub fn release_master(&self) {
        if !self.is_master.replace(false) {
            return;
        }
        let Ok(device) = self.raw() else {
            return;
        };
        match self.backend.drop_master(device) {
            Ok(()) => debug!("Dropped DRM master on {}", self.path.display()),
            Err(e) => warn!("Failed to drop DRM master on {}: {}", self.path.display(), e),
        }
    }

    pub fn is_master(&self) -> bool {
        self.is_master.get()
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Closes the device. Equivalent to dropping the handle.
    pub fn close(self) {
        drop(self);
    }

    pub(crate) fn backend(&self) -> &'a B {
        self.backend
    }

    pub(crate) fn raw(&self) -> io::Result<&B::Device> {
        self.device
            .as_ref()
            .ok_or_else(|| io::Error::new(io::ErrorKind::NotConnected, "device already closed"))
    }
}

impl<B: KmsBackend> Drop for DeviceHandle<'_, B> {
    fn drop(&mut self) {
        self.release_master();
        if let Some(device) = self.device.take() {
            self.backend.close(device);
            debug!("Closed display device {}", self.path.display());
        }
    }
}

/// Scope guard for a master claim; dropping it releases mastership.
pub struct MasterClaim<'a, B: KmsBackend> {
    device: &'a DeviceHandle<'a, B>,
}

impl<B: KmsBackend> MasterClaim<'_, B> {
    pub fn release(self) {
        drop(self);
    }
}

impl<B: KmsBackend> Drop for MasterClaim<'_, B> {
    fn drop(&mut self) {
        self.device.release_master();
    }
}
