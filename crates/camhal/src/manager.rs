//! Registry of camera adapters keyed by device index.

use crate::adapter::{self, CaptureAdapter};
use crate::config::{AdapterConfig, Facing};
use crate::error::{CameraError, Result};
use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;

/// Highest `/dev/videoN` index probed by [`SessionManager::discover`].
pub const MAX_DEVICES: u32 = 8;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CameraInfo {
    pub id: u32,
    pub facing: Facing,
    /// Mounting orientation in degrees.
    pub orientation: u32,
}

struct Entry {
    info: CameraInfo,
    adapter: Arc<dyn CaptureAdapter>,
}

/// Cameras known at startup. The set is fixed once built.
pub struct SessionManager {
    cameras: BTreeMap<u32, Entry>,
}

impl SessionManager {
    /// One adapter per configuration. Duplicate device ids are rejected.
    pub fn new(configs: impl IntoIterator<Item = AdapterConfig>) -> Result<Self> {
        let mut cameras = BTreeMap::new();
        for config in configs {
            let id = config.device_id;
            if cameras.contains_key(&id) {
                return Err(CameraError::invalid_parameter(
                    "device_id",
                    format!("camera {id} configured twice"),
                ));
            }
            let info = CameraInfo {
                id,
                facing: config.facing,
                orientation: config.orientation.unwrap_or(match config.facing {
                    Facing::Back => 90,
                    Facing::Front => 270,
                }),
            };
            cameras.insert(
                id,
                Entry {
                    info,
                    adapter: adapter::create(config),
                },
            );
        }
        tracing::info!(cameras = cameras.len(), "Camera registry built");
        Ok(Self { cameras })
    }

    /// Probes `/dev/video0..MAX_DEVICES` and registers every node present,
    /// using `template` for everything but the device id. A virtual template
    /// yields exactly one camera.
    pub fn discover(template: &AdapterConfig) -> Result<Self> {
        if template.use_virtual {
            return Self::new([template.clone()]);
        }
        let configs: Vec<AdapterConfig> = (0..MAX_DEVICES)
            .filter(|index| Path::new(&format!("/dev/video{index}")).exists())
            .map(|index| AdapterConfig {
                device_id: index,
                device_path: None,
                ..template.clone()
            })
            .collect();
        if configs.is_empty() {
            tracing::warn!("No video devices found");
        }
        Self::new(configs)
    }

    pub fn camera_count(&self) -> usize {
        self.cameras.len()
    }

    pub fn ids(&self) -> impl Iterator<Item = u32> + '_ {
        self.cameras.keys().copied()
    }

    pub fn info(&self, id: u32) -> Option<CameraInfo> {
        self.cameras.get(&id).map(|e| e.info)
    }

    pub fn get(&self, id: u32) -> Option<Arc<dyn CaptureAdapter>> {
        self.cameras.get(&id).map(|e| e.adapter.clone())
    }

    /// Opens camera `id` and returns its adapter.
    pub fn open(&self, id: u32) -> Result<Arc<dyn CaptureAdapter>> {
        let adapter = self.get(id).ok_or_else(|| CameraError::DeviceOpenFailed {
            device: format!("camera {id}"),
            reason: crate::error::OpenFailure::NotFound,
        })?;
        adapter.open()?;
        Ok(adapter)
    }

    pub fn release_all(&self) {
        for entry in self.cameras.values() {
            if entry.adapter.is_open() {
                entry.adapter.release();
            }
        }
    }
}
