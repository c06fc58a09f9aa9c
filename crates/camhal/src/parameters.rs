//! The host's `key=value;key=value` parameter string.

use crate::error::CameraError;
use crate::exif::GpsFix;
use crate::format::{PixelFormat, Resolution};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

pub mod keys {
    pub const PREVIEW_SIZE: &str = "preview-size";
    pub const PREVIEW_SIZE_VALUES: &str = "preview-size-values";
    pub const PREVIEW_FORMAT: &str = "preview-format";
    pub const PREVIEW_FORMAT_VALUES: &str = "preview-format-values";
    pub const PREVIEW_FRAME_RATE: &str = "preview-frame-rate";
    pub const PREVIEW_FPS_RANGE: &str = "preview-fps-range";
    pub const PICTURE_SIZE: &str = "picture-size";
    pub const PICTURE_SIZE_VALUES: &str = "picture-size-values";
    pub const PICTURE_FORMAT: &str = "picture-format";
    pub const ROTATION: &str = "rotation";
    pub const ZOOM: &str = "zoom";
    pub const MAX_ZOOM: &str = "max-zoom";
    pub const ZOOM_RATIOS: &str = "zoom-ratios";
    pub const ZOOM_SUPPORTED: &str = "zoom-supported";
    pub const EXPOSURE_COMPENSATION: &str = "exposure-compensation";
    pub const MAX_EXPOSURE_COMPENSATION: &str = "max-exposure-compensation";
    pub const MIN_EXPOSURE_COMPENSATION: &str = "min-exposure-compensation";
    pub const WHITE_BALANCE: &str = "whitebalance";
    pub const WHITE_BALANCE_VALUES: &str = "whitebalance-values";
    pub const EFFECT: &str = "effect";
    pub const EFFECT_VALUES: &str = "effect-values";
    pub const ANTIBANDING: &str = "antibanding";
    pub const ANTIBANDING_VALUES: &str = "antibanding-values";
    pub const FLASH_MODE: &str = "flash-mode";
    pub const FLASH_MODE_VALUES: &str = "flash-mode-values";
    pub const FOCUS_MODE: &str = "focus-mode";
    pub const FOCUS_MODE_VALUES: &str = "focus-mode-values";
    pub const FOCAL_LENGTH: &str = "focal-length";
    pub const GPS_LATITUDE: &str = "gps-latitude";
    pub const GPS_LONGITUDE: &str = "gps-longitude";
    pub const GPS_ALTITUDE: &str = "gps-altitude";
    pub const GPS_TIMESTAMP: &str = "gps-timestamp";
    pub const GPS_PROCESSING_METHOD: &str = "gps-processing-method";
    pub const RECORDING_HINT: &str = "recording-hint";
    pub const VIDEO_SIZE: &str = "video-size";
}

/// Ordered key/value set. Keys and values never contain `;`, keys never `=`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CameraParameters {
    entries: BTreeMap<String, String>,
}

impl CameraParameters {
    pub fn new() -> Self {
        Self::default()
    }

    /// Parses `k=v;k=v`. Items without `=` are skipped; later keys win.
    pub fn unflatten(flat: &str) -> Self {
        let entries = flat
            .split(';')
            .filter_map(|item| item.split_once('='))
            .filter(|(k, _)| !k.trim().is_empty())
            .map(|(k, v)| (k.trim().to_string(), v.trim().to_string()))
            .collect();
        Self { entries }
    }

    pub fn flatten(&self) -> String {
        self.to_string()
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.entries.get(key).map(String::as_str)
    }

    pub fn set(&mut self, key: &str, value: impl fmt::Display) {
        let value = value.to_string().replace([';', '='], "");
        self.entries.insert(key.to_string(), value);
    }

    pub fn remove(&mut self, key: &str) -> Option<String> {
        self.entries.remove(key)
    }

    pub fn contains(&self, key: &str) -> bool {
        self.entries.contains_key(key)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Overwrites with every entry of `other`.
    pub fn merge(&mut self, other: &CameraParameters) {
        for (k, v) in &other.entries {
            self.entries.insert(k.clone(), v.clone());
        }
    }

    pub fn get_parsed<T: FromStr>(&self, key: &str) -> Option<T> {
        self.get(key)?.parse().ok()
    }

    pub fn get_int(&self, key: &str) -> Option<i64> {
        self.get_parsed(key)
    }

    pub fn get_float(&self, key: &str) -> Option<f64> {
        self.get_parsed(key)
    }

    pub fn get_size(&self, key: &str) -> Option<Resolution> {
        self.get_parsed(key)
    }

    pub fn set_size(&mut self, key: &str, size: Resolution) {
        self.set(key, size);
    }

    /// `min,max` in frames per second times 1000.
    pub fn fps_range(&self) -> Option<(i64, i64)> {
        let (min, max) = self.get(keys::PREVIEW_FPS_RANGE)?.split_once(',')?;
        Some((min.trim().parse().ok()?, max.trim().parse().ok()?))
    }

    pub fn preview_format(&self) -> Option<PixelFormat> {
        PixelFormat::from_preview_key(self.get(keys::PREVIEW_FORMAT)?)
    }

    /// A fix needs both latitude and longitude.
    pub fn gps(&self) -> Option<GpsFix> {
        Some(GpsFix {
            latitude: self.get_float(keys::GPS_LATITUDE)?,
            longitude: self.get_float(keys::GPS_LONGITUDE)?,
            altitude: self.get_float(keys::GPS_ALTITUDE).unwrap_or(0.0),
            timestamp: self.get_int(keys::GPS_TIMESTAMP).unwrap_or(0),
        })
    }

    pub fn flag(&self, key: &str) -> bool {
        self.get(key).is_some_and(|v| v.eq_ignore_ascii_case("true"))
    }
}

impl fmt::Display for CameraParameters {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, (k, v)) in self.entries.iter().enumerate() {
            if i > 0 {
                f.write_str(";")?;
            }
            write!(f, "{k}={v}")?;
        }
        Ok(())
    }
}

impl FromStr for CameraParameters {
    type Err = std::convert::Infallible;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(Self::unflatten(s))
    }
}

/// Outcome of checking a parameter set. `params` is what gets stored: values
/// out of range have been clamped or dropped, and each such fix is listed in
/// `violations`.
#[derive(Debug)]
pub struct Validated {
    pub params: CameraParameters,
    pub violations: Vec<CameraError>,
}

impl Validated {
    /// First violation as the error the host sees; everything valid has
    /// already been kept.
    pub fn into_result(self) -> (CameraParameters, Result<(), CameraError>) {
        let mut violations = self.violations.into_iter();
        let result = match violations.next() {
            Some(first) => Err(first),
            None => Ok(()),
        };
        (self.params, result)
    }
}

/// Checks zoom, fps range, sizes, formats and rotation.
pub fn validate(mut params: CameraParameters, max_zoom: u32) -> Validated {
    let mut violations = Vec::new();

    if let Some(zoom) = params.get_int(keys::ZOOM) {
        let clamped = zoom.clamp(0, max_zoom as i64);
        if clamped != zoom {
            violations.push(CameraError::invalid_parameter(
                keys::ZOOM,
                format!("{zoom} outside 0..={max_zoom}, using {clamped}"),
            ));
            params.set(keys::ZOOM, clamped);
        }
    } else if params.contains(keys::ZOOM) {
        violations.push(CameraError::invalid_parameter(keys::ZOOM, "not an integer"));
        params.remove(keys::ZOOM);
    }

    if params.contains(keys::PREVIEW_FPS_RANGE) {
        match params.fps_range() {
            Some((min, max)) if min >= 0 && max >= 0 && max >= min => {}
            _ => violations.push(CameraError::invalid_parameter(
                keys::PREVIEW_FPS_RANGE,
                format!("bad range {:?}", params.get(keys::PREVIEW_FPS_RANGE).unwrap_or_default()),
            )),
        }
    }

    if let Some(rate) = params.get(keys::PREVIEW_FRAME_RATE) {
        if !rate.parse::<u32>().is_ok_and(|r| r > 0) {
            violations.push(CameraError::invalid_parameter(
                keys::PREVIEW_FRAME_RATE,
                format!("bad rate {rate:?}"),
            ));
            params.remove(keys::PREVIEW_FRAME_RATE);
        }
    }

    for key in [keys::PREVIEW_SIZE, keys::PICTURE_SIZE, keys::VIDEO_SIZE] {
        if params.contains(key) && params.get_size(key).is_none() {
            violations.push(CameraError::invalid_parameter(
                key,
                format!("expected WxH, got {:?}", params.get(key).unwrap_or_default()),
            ));
            params.remove(key);
        }
    }

    if let Some(format) = params.get(keys::PREVIEW_FORMAT) {
        let usable = PixelFormat::from_preview_key(format).is_some_and(|f| f != PixelFormat::Mjpeg);
        if !usable {
            violations.push(CameraError::invalid_parameter(
                keys::PREVIEW_FORMAT,
                format!("unsupported {format:?}"),
            ));
            params.remove(keys::PREVIEW_FORMAT);
        }
    }

    if params.contains(keys::ROTATION) {
        let valid = params
            .get_int(keys::ROTATION)
            .is_some_and(|r| (0..360).contains(&r) && r % 90 == 0);
        if !valid {
            violations.push(CameraError::invalid_parameter(
                keys::ROTATION,
                format!("{:?} is not 0, 90, 180 or 270", params.get(keys::ROTATION).unwrap_or_default()),
            ));
            params.remove(keys::ROTATION);
        }
    }

    Validated { params, violations }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_flatten_is_sorted_and_reparses() {
        let params = CameraParameters::unflatten("zoom=2;preview-size=640x480; effect = mono ;junk");
        assert_eq!(params.len(), 3);
        assert_eq!(params.get(keys::EFFECT), Some("mono"));
        assert_eq!(params.flatten(), "effect=mono;preview-size=640x480;zoom=2");
        assert_eq!(CameraParameters::unflatten(&params.flatten()), params);
    }

    #[test]
    fn test_set_strips_separators() {
        let mut params = CameraParameters::new();
        params.set("gps-processing-method", "GPS;x=1");
        assert_eq!(params.get("gps-processing-method"), Some("GPSx1"));
    }

    #[test]
    fn test_typed_getters() {
        let params = CameraParameters::unflatten(
            "preview-size=1280x720;preview-fps-range=5000,30000;preview-format=yuv420p;recording-hint=true",
        );
        assert_eq!(params.get_size(keys::PREVIEW_SIZE), Some(Resolution::new(1280, 720)));
        assert_eq!(params.fps_range(), Some((5000, 30000)));
        assert_eq!(params.preview_format(), Some(PixelFormat::Yv12));
        assert!(params.flag(keys::RECORDING_HINT));
    }

    #[test]
    fn test_gps_requires_both_coordinates() {
        let params = CameraParameters::unflatten("gps-latitude=37.5");
        assert!(params.gps().is_none());
        let params = CameraParameters::unflatten("gps-latitude=37.5;gps-longitude=-122.25;gps-timestamp=100");
        let fix = params.gps().unwrap();
        assert_eq!(fix.longitude, -122.25);
        assert_eq!(fix.altitude, 0.0);
        assert_eq!(fix.timestamp, 100);
    }

    #[test]
    fn test_zoom_clamped_high_and_low() {
        let checked = validate(CameraParameters::unflatten("zoom=999"), 8);
        assert_eq!(checked.params.get_int(keys::ZOOM), Some(8));
        assert_eq!(checked.violations.len(), 1);

        let checked = validate(CameraParameters::unflatten("zoom=-3"), 8);
        assert_eq!(checked.params.get_int(keys::ZOOM), Some(0));
        assert!(matches!(
            checked.violations[0],
            CameraError::InvalidParameter { ref key, .. } if key == keys::ZOOM
        ));
    }

    #[test]
    fn test_fps_range_validation() {
        for bad in ["30000,5000", "-1,30000", "abc"] {
            let checked = validate(
                CameraParameters::unflatten(&format!("preview-fps-range={bad}")),
                8,
            );
            assert_eq!(checked.violations.len(), 1, "{bad}");
        }
        let checked = validate(CameraParameters::unflatten("preview-fps-range=15000,15000"), 8);
        assert!(checked.violations.is_empty());
    }

    #[test]
    fn test_bad_sizes_and_rotation_dropped() {
        let checked = validate(
            CameraParameters::unflatten("picture-size=big;rotation=45;preview-size=640x480"),
            8,
        );
        assert_eq!(checked.violations.len(), 2);
        assert!(!checked.params.contains(keys::PICTURE_SIZE));
        assert!(!checked.params.contains(keys::ROTATION));
        assert!(checked.params.contains(keys::PREVIEW_SIZE));
    }

    #[test]
    fn test_first_violation_is_reported() {
        let (params, result) = validate(CameraParameters::unflatten("zoom=20;effect=sepia"), 8).into_result();
        assert!(result.is_err());
        assert_eq!(params.get(keys::EFFECT), Some("sepia"));
        assert_eq!(params.get(keys::ZOOM), Some("8"));
    }
}
