use std::fmt;
use std::str::FromStr;

/// Pixel layouts understood by the pipeline, on either side of a conversion.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PixelFormat {
    /// Packed 4:2:2, `[Y0 U Y1 V]`.
    Yuyv,
    /// Semi-planar 4:2:0, interleaved `VU` plane.
    Nv21,
    /// Semi-planar 4:2:0, interleaved `UV` plane.
    Nv12,
    /// Planar 4:2:0, `Y V U`.
    Yv12,
    /// Planar 4:2:0, `Y U V`.
    I420,
    Mjpeg,
    Rgb24,
}

impl PixelFormat {
    pub fn fourcc(self) -> [u8; 4] {
        match self {
            PixelFormat::Yuyv => *b"YUYV",
            PixelFormat::Nv21 => *b"NV21",
            PixelFormat::Nv12 => *b"NV12",
            PixelFormat::Yv12 => *b"YV12",
            PixelFormat::I420 => *b"YU12",
            PixelFormat::Mjpeg => *b"MJPG",
            PixelFormat::Rgb24 => *b"RGB3",
        }
    }

    pub fn from_fourcc(repr: &[u8; 4]) -> Option<Self> {
        match repr {
            b"YUYV" => Some(PixelFormat::Yuyv),
            b"NV21" => Some(PixelFormat::Nv21),
            b"NV12" => Some(PixelFormat::Nv12),
            b"YV12" => Some(PixelFormat::Yv12),
            b"YU12" => Some(PixelFormat::I420),
            b"MJPG" | b"JPEG" => Some(PixelFormat::Mjpeg),
            b"RGB3" => Some(PixelFormat::Rgb24),
            _ => None,
        }
    }

    pub fn is_compressed(self) -> bool {
        self == PixelFormat::Mjpeg
    }

    pub fn is_planar_420(self) -> bool {
        matches!(
            self,
            PixelFormat::Nv21 | PixelFormat::Nv12 | PixelFormat::Yv12 | PixelFormat::I420
        )
    }

    /// Bytes per line of the luma (or only) plane for a tightly packed image.
    pub fn min_bytes_per_line(self, width: u32) -> u32 {
        match self {
            PixelFormat::Yuyv => width * 2,
            PixelFormat::Rgb24 => width * 3,
            PixelFormat::Mjpeg => 0,
            _ => width,
        }
    }

    /// Size of a tightly packed frame. Compressed frames get a raw-sized upper bound.
    pub fn frame_size(self, width: u32, height: u32) -> usize {
        let (w, h) = (width as usize, height as usize);
        match self {
            PixelFormat::Yuyv | PixelFormat::Mjpeg => w * h * 2,
            PixelFormat::Rgb24 => w * h * 3,
            _ => w * h * 3 / 2,
        }
    }

    /// Preview format keys used in the parameter string.
    pub fn from_preview_key(key: &str) -> Option<Self> {
        match key.trim() {
            "yuv420sp" => Some(PixelFormat::Nv21),
            "yuv420p" => Some(PixelFormat::Yv12),
            "yuv422i-yuyv" | "yuv422" => Some(PixelFormat::Yuyv),
            "rgb" | "rgb24" => Some(PixelFormat::Rgb24),
            "jpeg" => Some(PixelFormat::Mjpeg),
            _ => None,
        }
    }

    pub fn preview_key(self) -> &'static str {
        match self {
            PixelFormat::Nv21 | PixelFormat::Nv12 => "yuv420sp",
            PixelFormat::Yv12 | PixelFormat::I420 => "yuv420p",
            PixelFormat::Yuyv => "yuv422i-yuyv",
            PixelFormat::Rgb24 => "rgb",
            PixelFormat::Mjpeg => "jpeg",
        }
    }
}

impl fmt::Display for PixelFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let repr = self.fourcc();
        write!(f, "{}", String::from_utf8_lossy(&repr))
    }
}

/// A width/height pair as spelled in configuration, `640x480`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Resolution {
    pub width: u32,
    pub height: u32,
}

impl Resolution {
    pub const fn new(width: u32, height: u32) -> Self {
        Self { width, height }
    }

    pub fn swapped(self) -> Self {
        Self::new(self.height, self.width)
    }

    pub fn area(self) -> u64 {
        self.width as u64 * self.height as u64
    }
}

impl fmt::Display for Resolution {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}x{}", self.width, self.height)
    }
}

impl FromStr for Resolution {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (w, h) = s
            .trim()
            .split_once(['x', 'X'])
            .ok_or_else(|| format!("expected WxH, got {s:?}"))?;
        let width: u32 = w.trim().parse().map_err(|_| format!("bad width in {s:?}"))?;
        let height: u32 = h.trim().parse().map_err(|_| format!("bad height in {s:?}"))?;
        if width == 0 || height == 0 {
            return Err(format!("zero dimension in {s:?}"));
        }
        Ok(Self { width, height })
    }
}

/// Negotiated frame layout. The device reply is authoritative: width, height
/// and stride may differ from what was asked for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FormatDescriptor {
    pub width: u32,
    pub height: u32,
    pub pixel_format: PixelFormat,
    /// Bytes per line of the first plane.
    pub stride: u32,
    /// Bytes per frame as reported by the device.
    pub size: u32,
}

impl FormatDescriptor {
    /// A tightly packed candidate for negotiation.
    pub fn new(width: u32, height: u32, pixel_format: PixelFormat) -> Self {
        Self {
            width,
            height,
            pixel_format,
            stride: pixel_format.min_bytes_per_line(width),
            size: pixel_format.frame_size(width, height) as u32,
        }
    }

    pub fn resolution(&self) -> Resolution {
        Resolution::new(self.width, self.height)
    }

    /// Stride and size agree with width/height for this pixel format.
    pub fn is_consistent(&self) -> bool {
        if self.width == 0 || self.height == 0 {
            return false;
        }
        if self.pixel_format.is_compressed() {
            return self.size > 0;
        }
        let min_stride = self.pixel_format.min_bytes_per_line(self.width);
        let rows = match self.pixel_format {
            f if f.is_planar_420() => self.height as u64 * 3 / 2,
            _ => self.height as u64,
        };
        self.stride >= min_stride && self.size as u64 >= self.stride as u64 * rows
    }

    /// Raw frames carry row padding when the device aligned the stride.
    pub fn is_padded(&self) -> bool {
        !self.pixel_format.is_compressed()
            && self.stride > self.pixel_format.min_bytes_per_line(self.width)
    }
}

impl fmt::Display for FormatDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}x{} {} (stride {})",
            self.width, self.height, self.pixel_format, self.stride
        )
    }
}

/// How slot memory is provided to the device.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MemoryKind {
    /// Driver-allocated buffers mapped into the process.
    Mmap,
    /// Caller-provided buffers imported by file descriptor.
    DmaBuf,
}

impl MemoryKind {
    /// `enum v4l2_memory` value.
    pub fn as_raw(self) -> u32 {
        match self {
            MemoryKind::Mmap => 1,
            MemoryKind::DmaBuf => 4,
        }
    }
}

pub fn align_up(value: u32, align: u32) -> u32 {
    value.div_ceil(align) * align
}
