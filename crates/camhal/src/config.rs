use crate::format::{PixelFormat, Resolution};
use crate::pacing::{LimitedRateTable, PacingPolicy};
use crate::recovery::RecoveryPolicy;
use anyhow::bail;
use common::config::parse_flag;
use std::env;
use std::str::FromStr;
use std::time::Duration;

pub use common::Environment;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Facing {
    Back,
    Front,
}

impl FromStr for Facing {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "back" => Ok(Facing::Back),
            "front" => Ok(Facing::Front),
            other => Err(format!("unknown facing {other:?}")),
        }
    }
}

#[derive(Debug, Clone)]
pub struct AdapterConfig {
    pub environment: Environment,
    pub device_id: u32,
    /// Overrides `/dev/video{device_id}`.
    pub device_path: Option<String>,
    /// Use the software camera instead of a kernel node.
    pub use_virtual: bool,
    pub preview_size: Resolution,
    /// Sizes above this are not offered for preview.
    pub preview_max_size: Option<Resolution>,
    pub preview_format: PixelFormat,
    pub preview_buffers: u32,
    pub preview_fps: u32,
    pub use_mjpeg: bool,
    /// Forces YUYV even when MJPEG would be usable.
    pub debug_mjpeg: bool,
    pub limited_rates: LimitedRateTable,
    /// Mounting orientation in degrees.
    pub orientation: Option<u32>,
    pub facing: Facing,
    pub recovery: RecoveryPolicy,
    pub pacing: PacingPolicy,
}

impl Default for AdapterConfig {
    fn default() -> Self {
        Self {
            environment: Environment::Development,
            device_id: 0,
            device_path: None,
            use_virtual: false,
            preview_size: Resolution::new(640, 480),
            preview_max_size: None,
            preview_format: PixelFormat::Nv21,
            preview_buffers: 6,
            preview_fps: 15,
            use_mjpeg: true,
            debug_mjpeg: false,
            limited_rates: LimitedRateTable::default(),
            orientation: None,
            facing: Facing::Back,
            recovery: RecoveryPolicy::default(),
            pacing: PacingPolicy::default(),
        }
    }
}

fn parsed<T: FromStr>(lookup: &impl Fn(&str) -> Option<String>, key: &str) -> Option<T> {
    let raw = lookup(key)?;
    match raw.trim().parse() {
        Ok(value) => Some(value),
        Err(_) => {
            tracing::warn!(key, value = %raw, "Ignoring malformed setting");
            None
        }
    }
}

fn flag(lookup: &impl Fn(&str) -> Option<String>, key: &str) -> Option<bool> {
    let raw = lookup(key)?;
    let value = parse_flag(&raw);
    if value.is_none() {
        tracing::warn!(key, value = %raw, "Ignoring malformed flag");
    }
    value
}

impl AdapterConfig {
    pub fn from_env() -> anyhow::Result<Self> {
        let mut config = Self::from_lookup(|key| env::var(key).ok())?;
        config.environment = Environment::from_env();
        Ok(config)
    }

    /// Reads every `CAMHAL_*` key through `lookup`; absent or malformed
    /// values keep their defaults.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> anyhow::Result<Self> {
        let defaults = Self::default();

        let preview_format = match lookup("CAMHAL_PREVIEW_FORMAT") {
            Some(key) => match PixelFormat::from_preview_key(&key) {
                Some(PixelFormat::Mjpeg) | None => bail!("unsupported preview format {key:?}"),
                Some(format) => format,
            },
            None => defaults.preview_format,
        };

        let preview_buffers = parsed(&lookup, "CAMHAL_PREVIEW_BUFFERS").unwrap_or(defaults.preview_buffers);
        if preview_buffers == 0 {
            bail!("CAMHAL_PREVIEW_BUFFERS must be at least 1");
        }
        let preview_fps = parsed(&lookup, "CAMHAL_PREVIEW_FPS").unwrap_or(defaults.preview_fps);
        if preview_fps == 0 {
            bail!("CAMHAL_PREVIEW_FPS must be at least 1");
        }

        let orientation = parsed::<u32>(&lookup, "CAMHAL_ORIENTATION");
        if let Some(degrees) = orientation {
            if degrees % 90 != 0 || degrees >= 360 {
                bail!("CAMHAL_ORIENTATION must be 0, 90, 180 or 270, got {degrees}");
            }
        }

        let recovery = RecoveryPolicy {
            initial_grace: parsed(&lookup, "CAMHAL_RESET_GRACE_MS")
                .map(Duration::from_millis)
                .unwrap_or(defaults.recovery.initial_grace),
            reset_threshold: parsed(&lookup, "CAMHAL_RESET_THRESHOLD_MS")
                .map(Duration::from_millis)
                .unwrap_or(defaults.recovery.reset_threshold),
        };

        Ok(Self {
            environment: defaults.environment,
            device_id: parsed(&lookup, "CAMHAL_DEVICE_ID").unwrap_or(defaults.device_id),
            device_path: lookup("CAMHAL_DEVICE_PATH").filter(|p| !p.trim().is_empty()),
            use_virtual: flag(&lookup, "CAMHAL_VIRTUAL").unwrap_or(defaults.use_virtual),
            preview_size: parsed(&lookup, "CAMHAL_PREVIEW_SIZE").unwrap_or(defaults.preview_size),
            preview_max_size: parsed(&lookup, "CAMHAL_PREVIEW_MAX_SIZE"),
            preview_format,
            preview_buffers,
            preview_fps,
            use_mjpeg: flag(&lookup, "CAMHAL_USE_MJPEG").unwrap_or(defaults.use_mjpeg),
            debug_mjpeg: flag(&lookup, "CAMHAL_DEBUG_MJPEG").unwrap_or(defaults.debug_mjpeg),
            limited_rates: lookup("CAMHAL_LIMITED_RATE")
                .map(|list| LimitedRateTable::parse(&list))
                .unwrap_or_default(),
            orientation,
            facing: parsed(&lookup, "CAMHAL_FACING").unwrap_or(defaults.facing),
            recovery,
            pacing: defaults.pacing,
        })
    }

    /// MJPEG is considered only when enabled and not overridden for debugging.
    pub fn mjpeg_allowed(&self) -> bool {
        self.use_mjpeg && !self.debug_mjpeg
    }

    pub fn device_path(&self) -> String {
        self.device_path
            .clone()
            .unwrap_or_else(|| format!("/dev/video{}", self.device_id))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;
    use std::collections::HashMap;

    fn lookup(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn test_defaults() {
        let config = AdapterConfig::from_lookup(lookup(&[])).unwrap();
        assert_eq!(config.preview_size, Resolution::new(640, 480));
        assert_eq!(config.preview_buffers, 6);
        assert_eq!(config.preview_fps, 15);
        assert_eq!(config.device_path(), "/dev/video0");
        assert!(config.mjpeg_allowed());
        assert!(config.limited_rates.is_empty());
        assert_eq!(config.recovery, RecoveryPolicy::default());
    }

    #[test]
    fn test_overrides() {
        let config = AdapterConfig::from_lookup(lookup(&[
            ("CAMHAL_DEVICE_ID", "2"),
            ("CAMHAL_PREVIEW_SIZE", "1280x720"),
            ("CAMHAL_PREVIEW_FORMAT", "yuv420p"),
            ("CAMHAL_DEBUG_MJPEG", "1"),
            ("CAMHAL_LIMITED_RATE", "1920x1080x5,1280x720x10"),
            ("CAMHAL_FACING", "front"),
            ("CAMHAL_ORIENTATION", "270"),
            ("CAMHAL_RESET_THRESHOLD_MS", "1500"),
        ]))
        .unwrap();
        assert_eq!(config.device_path(), "/dev/video2");
        assert_eq!(config.preview_size, Resolution::new(1280, 720));
        assert_eq!(config.preview_format, PixelFormat::Yv12);
        assert!(!config.mjpeg_allowed());
        assert_eq!(config.limited_rates.lookup(Resolution::new(1280, 720)), Some(10));
        assert_eq!(config.facing, Facing::Front);
        assert_eq!(config.orientation, Some(270));
        assert_eq!(config.recovery.reset_threshold, Duration::from_millis(1500));
        assert_eq!(config.recovery.initial_grace, Duration::from_secs(5));
    }

    #[test]
    fn test_malformed_values_fall_back() {
        let config = AdapterConfig::from_lookup(lookup(&[
            ("CAMHAL_PREVIEW_SIZE", "huge"),
            ("CAMHAL_VIRTUAL", "maybe"),
        ]))
        .unwrap();
        assert_eq!(config.preview_size, Resolution::new(640, 480));
        assert!(!config.use_virtual);
    }

    #[test]
    fn test_invalid_values_rejected() {
        assert!(AdapterConfig::from_lookup(lookup(&[("CAMHAL_PREVIEW_BUFFERS", "0")])).is_err());
        assert!(AdapterConfig::from_lookup(lookup(&[("CAMHAL_PREVIEW_FORMAT", "jpeg")])).is_err());
        assert!(AdapterConfig::from_lookup(lookup(&[("CAMHAL_ORIENTATION", "45")])).is_err());
    }

    #[test]
    #[serial]
    fn test_from_env() {
        unsafe {
            env::set_var("CAMHAL_VIRTUAL", "true");
            env::set_var("CAMHAL_PREVIEW_BUFFERS", "4");
        }
        let config = AdapterConfig::from_env().unwrap();
        assert!(config.use_virtual);
        assert_eq!(config.preview_buffers, 4);
        unsafe {
            env::remove_var("CAMHAL_VIRTUAL");
            env::remove_var("CAMHAL_PREVIEW_BUFFERS");
        }
    }
}
