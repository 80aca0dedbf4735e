// src/kms/discovery.rs

//! Output discovery: enumerate mode-setting objects and pick the first
//! connector with a working encoder/CRTC chain.

use std::mem::ManuallyDrop;
use std::ops::Deref;

use log::{debug, info, trace};

use crate::error::PipelineError;
use crate::kms::backend::{Held, KmsBackend};
use crate::kms::device::DeviceHandle;
use crate::kms::types::{ModeResourceSet, OutputConfig};

/// Enumerated resources, freed when dropped.
pub struct ModeResources<'a, B: KmsBackend> {
    set: Held<'a, B, ModeResourceSet>,
}

impl<B: KmsBackend> Deref for ModeResources<'_, B> {
    type Target = ModeResourceSet;

    fn deref(&self) -> &ModeResourceSet {
        &self.set
    }
}

/// Queries the connectors, encoders and CRTCs exposed by `device`.
pub fn enumerate<'a, B: KmsBackend>(
    device: &'a DeviceHandle<'a, B>,
) -> Result<ModeResources<'a, B>, PipelineError> {
    let raw = device.raw().map_err(PipelineError::QueryFailed)?;
    let backend = device.backend();
    let set = backend
        .get_resources(raw)
        .map_err(PipelineError::QueryFailed)?;
    info!(
        "Found {} connectors, {} encoders, {} CRTCs",
        set.connectors.len(),
        set.encoders.len(),
        set.crtcs.len()
    );
    Ok(ModeResources {
        set: Held::new(backend, set, B::free_resources),
    })
}

/// The chosen output. Owns the connector, encoder and CRTC descriptors and
/// frees them, CRTC first, when dropped.
pub struct SelectedOutput<'a, B: KmsBackend> {
    backend: &'a B,
    config: ManuallyDrop<OutputConfig<B::Mode>>,
}

impl<B: KmsBackend> Deref for SelectedOutput<'_, B> {
    type Target = OutputConfig<B::Mode>;

    fn deref(&self) -> &OutputConfig<B::Mode> {
        &self.config
    }
}

impl<B: KmsBackend> Drop for SelectedOutput<'_, B> {
    fn drop(&mut self) {
        // SAFETY: `config` is taken only here, and drop runs once.
        let config = unsafe { ManuallyDrop::take(&mut self.config) };
        let OutputConfig {
            connector,
            encoder,
            crtc,
            mode: _,
        } = config;
        self.backend.free_crtc(crtc);
        self.backend.free_encoder(encoder);
        self.backend.free_connector(connector);
        debug!("Released output descriptors");
    }
}

/// Walks connectors in enumeration order and returns the first one that is
/// connected, has modes, and has an encoder bound to a retrievable CRTC.
/// The connector's first mode becomes the active mode.
///
/// Descriptors fetched for rejected candidates are released before moving on.
/// A connector, encoder or CRTC that cannot be fetched is skipped.
pub fn find_output<'a, B: KmsBackend>(
    device: &'a DeviceHandle<'a, B>,
    resources: &ModeResourceSet,
) -> Result<SelectedOutput<'a, B>, PipelineError> {
    let backend = device.backend();
    let Ok(raw) = device.raw() else {
        return Err(PipelineError::NoSuitableOutput);
    };

    for &connector_id in &resources.connectors {
        let connector = match backend.get_connector(raw, connector_id) {
            Ok(connector) => Held::new(backend, connector, B::free_connector),
            Err(e) => {
                debug!("Skipping {}: {}", connector_id, e);
                continue;
            }
        };
        if !connector.is_usable() {
            trace!(
                "Skipping {} ({}): {:?}, {} modes",
                connector.id,
                connector.name,
                connector.state,
                connector.modes.len()
            );
            continue;
        }

        for &encoder_id in &connector.encoders {
            let encoder = match backend.get_encoder(raw, encoder_id) {
                Ok(encoder) => Held::new(backend, encoder, B::free_encoder),
                Err(e) => {
                    debug!("Skipping {}: {}", encoder_id, e);
                    continue;
                }
            };
            let Some(crtc_id) = encoder.crtc else {
                trace!("Skipping {}: no CRTC bound", encoder_id);
                continue;
            };
            let crtc = match backend.get_crtc(raw, crtc_id) {
                Ok(crtc) => Held::new(backend, crtc, B::free_crtc),
                Err(e) => {
                    debug!("Skipping {}: {}", crtc_id, e);
                    continue;
                }
            };

            let mode = connector.modes[0].clone();
            info!(
                "Selected {} ({}) via {} on {}, mode {}",
                connector.id, connector.name, encoder_id, crtc_id, mode
            );
            let crtc = crtc.into_inner();
            let encoder = encoder.into_inner();
            let connector = connector.into_inner();
            return Ok(SelectedOutput {
                backend,
                config: ManuallyDrop::new(OutputConfig {
                    connector,
                    encoder,
                    crtc,
                    mode,
                }),
            });
        }
    }

    Err(PipelineError::NoSuitableOutput)
}
