//! EXIF side-table attached to still captures. Values are pre-formatted the
//! way the JPEG encoder downstream expects them (`num/den` rationals).

use chrono::{DateTime, Local, Utc};
use std::collections::BTreeMap;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct GpsFix {
    pub latitude: f64,
    pub longitude: f64,
    pub altitude: f64,
    /// Seconds since the Unix epoch, UTC.
    pub timestamp: i64,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ExifInput {
    pub make: String,
    pub model: String,
    /// Requested picture rotation in degrees.
    pub rotation: u32,
    /// The sensor rotates the image itself, so pixels are already upright.
    pub rotated_by_device: bool,
    pub width: u32,
    pub height: u32,
    pub focal_length: Option<f64>,
    pub gps: Option<GpsFix>,
    pub gps_method: Option<String>,
    pub taken_at: DateTime<Local>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ExifTable {
    entries: BTreeMap<&'static str, String>,
}

impl ExifTable {
    pub fn get(&self, tag: &str) -> Option<&str> {
        self.entries.get(tag).map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&'static str, &str)> {
        self.entries.iter().map(|(k, v)| (*k, v.as_str()))
    }

    fn set(&mut self, tag: &'static str, value: impl Into<String>) {
        self.entries.insert(tag, value.into());
    }
}

pub fn orientation_tag(rotation: u32) -> u32 {
    match rotation % 360 {
        90 => 6,
        180 => 3,
        270 => 8,
        _ => 1,
    }
}

fn thousandths(value: f64) -> String {
    format!("{}/1000", (value * 1000.0).round() as i64)
}

/// `d/1,m/1,s/1` with seconds rounded to the nearest integer.
fn dms(value: f64) -> String {
    let value = value.abs();
    let degrees = value.trunc();
    let minutes_f = (value - degrees) * 60.0;
    let minutes = minutes_f.trunc();
    let seconds = ((minutes_f - minutes) * 60.0 + 0.5).trunc();
    format!("{}/1,{}/1,{}/1", degrees as i64, minutes as i64, seconds as i64)
}

pub fn build(input: &ExifInput) -> ExifTable {
    let mut table = ExifTable::default();
    table.set("Make", input.make.clone());
    table.set("Model", input.model.clone());

    let (width, height, orientation) = if input.rotated_by_device {
        let swap = matches!(input.rotation % 360, 90 | 270);
        let (w, h) = if swap {
            (input.height, input.width)
        } else {
            (input.width, input.height)
        };
        (w, h, 1)
    } else {
        (input.width, input.height, orientation_tag(input.rotation))
    };
    table.set("Orientation", orientation.to_string());
    table.set("ImageWidth", width.to_string());
    table.set("ImageLength", height.to_string());

    if let Some(focal) = input.focal_length {
        table.set("FocalLength", thousandths(focal));
    }
    table.set(
        "DateTime",
        input.taken_at.format("%Y:%m:%d %H:%M:%S").to_string(),
    );

    if let Some(gps) = input.gps {
        table.set("GPSLatitude", dms(gps.latitude));
        table.set("GPSLatitudeRef", if gps.latitude < 0.0 { "S" } else { "N" });
        table.set("GPSLongitude", dms(gps.longitude));
        table.set("GPSLongitudeRef", if gps.longitude < 0.0 { "W" } else { "E" });
        table.set("GPSAltitude", thousandths(gps.altitude.abs()));
        table.set("GPSAltitudeRef", if gps.altitude < 0.0 { "1" } else { "0" });

        if let Some(utc) = DateTime::<Utc>::from_timestamp(gps.timestamp, 0) {
            table.set("GPSDateStamp", utc.format("%Y:%m:%d").to_string());
            table.set("GPSTimeStamp", utc.format("%-H/1,%-M/1,%-S/1").to_string());
        }
    }
    if let Some(method) = &input.gps_method {
        table.set("GPSProcessingMethod", format!("ASCII\0\0\0{method}"));
    }
    table
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn input() -> ExifInput {
        ExifInput {
            make: "camhal".into(),
            model: "virtual".into(),
            rotation: 0,
            rotated_by_device: false,
            width: 1920,
            height: 1080,
            focal_length: Some(4.35),
            gps: None,
            gps_method: None,
            taken_at: Local.with_ymd_and_hms(2024, 3, 9, 14, 5, 7).unwrap(),
        }
    }

    #[test]
    fn test_orientation_mapping() {
        assert_eq!(orientation_tag(0), 1);
        assert_eq!(orientation_tag(90), 6);
        assert_eq!(orientation_tag(180), 3);
        assert_eq!(orientation_tag(270), 8);
    }

    #[test]
    fn test_basic_tags() {
        let table = build(&input());
        assert_eq!(table.get("Make"), Some("camhal"));
        assert_eq!(table.get("FocalLength"), Some("4350/1000"));
        assert_eq!(table.get("DateTime"), Some("2024:03:09 14:05:07"));
        assert_eq!(table.get("ImageWidth"), Some("1920"));
        assert!(table.get("GPSLatitude").is_none());
    }

    #[test]
    fn test_device_rotation_swaps_dimensions() {
        let table = build(&ExifInput {
            rotation: 90,
            rotated_by_device: true,
            ..input()
        });
        assert_eq!(table.get("Orientation"), Some("1"));
        assert_eq!(table.get("ImageWidth"), Some("1080"));
        assert_eq!(table.get("ImageLength"), Some("1920"));

        let table = build(&ExifInput {
            rotation: 270,
            ..input()
        });
        assert_eq!(table.get("Orientation"), Some("8"));
        assert_eq!(table.get("ImageWidth"), Some("1920"));
    }

    #[test]
    fn test_gps_tags() {
        let table = build(&ExifInput {
            gps: Some(GpsFix {
                latitude: -33.8568,
                longitude: 151.2153,
                altitude: -12.5,
                timestamp: 1_700_000_000,
            }),
            gps_method: Some("GPS".into()),
            ..input()
        });
        assert_eq!(table.get("GPSLatitude"), Some("33/1,51/1,24/1"));
        assert_eq!(table.get("GPSLatitudeRef"), Some("S"));
        assert_eq!(table.get("GPSLongitudeRef"), Some("E"));
        assert_eq!(table.get("GPSAltitude"), Some("12500/1000"));
        assert_eq!(table.get("GPSAltitudeRef"), Some("1"));
        assert_eq!(table.get("GPSDateStamp"), Some("2023:11:14"));
        assert_eq!(table.get("GPSTimeStamp"), Some("22/1,13/1,20/1"));
        assert_eq!(table.get("GPSProcessingMethod"), Some("ASCII\0\0\0GPS"));
    }
}
