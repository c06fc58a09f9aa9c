use super::{
    BytesView, CaptureDevice, ControlInfo, ControlKind, DequeuedBuffer, DeviceCaps, MenuEntry,
    SlotMemory,
};
use crate::error::{CameraError, OpenFailure, Result};
use crate::format::{FormatDescriptor, MemoryKind, PixelFormat, Resolution};
use std::io;
use std::mem;
use std::os::fd::RawFd;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use v4l::{
    Device, Format, FourCC,
    control::{Control, Flags as ControlFlags, MenuItem, Type as ControlType, Value},
    frameinterval::FrameIntervalEnum,
    framesize::FrameSizeEnum,
    v4l_sys,
    v4l2::vidioc,
    video::Capture,
};

// videodev2.h
const V4L2_BUF_TYPE_VIDEO_CAPTURE: u32 = 1;
const V4L2_FIELD_ANY: u32 = 0;
const V4L2_CAP_VIDEO_CAPTURE: u32 = 0x0000_0001;
const V4L2_CAP_VIDEO_M2M: u32 = 0x0000_8000;
const V4L2_CAP_STREAMING: u32 = 0x0400_0000;

/// `ioctl` with `EINTR` retry, returning the errno as `io::Error`.
///
/// # Safety
/// `arg` must be the structure the request expects.
unsafe fn xioctl<T>(fd: RawFd, request: u64, arg: &mut T) -> io::Result<()> {
    loop {
        let ret = unsafe { libc::ioctl(fd, request as _, arg as *mut T) };
        if ret != -1 {
            return Ok(());
        }
        let err = io::Error::last_os_error();
        if err.kind() != io::ErrorKind::Interrupted {
            return Err(err);
        }
    }
}

fn fourcc(format: PixelFormat) -> FourCC {
    FourCC::new(&format.fourcc())
}

fn unknown_fourcc(repr: [u8; 4]) -> io::Error {
    io::Error::new(
        io::ErrorKind::InvalidData,
        format!("unsupported pixel format {}", String::from_utf8_lossy(&repr)),
    )
}

fn descriptor_from(format: &Format) -> io::Result<FormatDescriptor> {
    let pixel_format =
        PixelFormat::from_fourcc(&format.fourcc.repr).ok_or_else(|| unknown_fourcc(format.fourcc.repr))?;
    Ok(FormatDescriptor {
        width: format.width,
        height: format.height,
        pixel_format,
        stride: format.stride,
        size: format.size,
    })
}

/// A driver buffer mapped into the process with `mmap`.
struct MappedRegion {
    ptr: *mut u8,
    len: usize,
}

// The region is plain shared memory; the pool serializes who reads it.
unsafe impl Send for MappedRegion {}
unsafe impl Sync for MappedRegion {}

impl MappedRegion {
    fn map(fd: RawFd, len: usize, offset: i64) -> io::Result<Self> {
        let ptr = unsafe {
            libc::mmap(
                std::ptr::null_mut(),
                len,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_SHARED,
                fd,
                offset as libc::off_t,
            )
        };
        if ptr == libc::MAP_FAILED {
            return Err(io::Error::last_os_error());
        }
        Ok(Self {
            ptr: ptr as *mut u8,
            len,
        })
    }
}

impl SlotMemory for MappedRegion {
    fn len(&self) -> usize {
        self.len
    }

    fn bytes(&self) -> BytesView<'_> {
        BytesView::Borrowed(unsafe { std::slice::from_raw_parts(self.ptr, self.len) })
    }
}

impl Drop for MappedRegion {
    fn drop(&mut self) {
        if unsafe { libc::munmap(self.ptr as *mut libc::c_void, self.len) } != 0 {
            tracing::warn!("munmap failed: {}", io::Error::last_os_error());
        }
    }
}

/// A V4L2 capture node.
///
/// Format, control and capability queries go through the `v4l` crate; the
/// buffer table is driven with raw ioctls so the pool can own each slot.
pub struct KernelDevice {
    device: Device,
    fd: RawFd,
    path: String,
}

impl KernelDevice {
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let name = path.display().to_string();

        let device = Device::with_path(path).map_err(|e| match e.kind() {
            io::ErrorKind::NotFound => CameraError::DeviceOpenFailed {
                device: name.clone(),
                reason: OpenFailure::NotFound,
            },
            _ => CameraError::from_io("open", e),
        })?;
        let fd = device.handle().fd();

        tracing::debug!(device = %name, fd, "Opened capture node");
        Ok(Self {
            device,
            fd,
            path: name,
        })
    }

    pub fn open_index(index: u32) -> Result<Self> {
        Self::open(format!("/dev/video{index}"))
    }

    fn raw_buffer(index: u32, memory: MemoryKind) -> v4l_sys::v4l2_buffer {
        let mut buf: v4l_sys::v4l2_buffer = unsafe { mem::zeroed() };
        buf.index = index;
        buf.type_ = V4L2_BUF_TYPE_VIDEO_CAPTURE;
        buf.memory = memory.as_raw();
        buf
    }

    fn wait_readable(&self, timeout: Duration) -> io::Result<bool> {
        let mut pfd = libc::pollfd {
            fd: self.fd,
            events: libc::POLLIN,
            revents: 0,
        };
        let millis = timeout.as_millis().min(i32::MAX as u128) as libc::c_int;
        loop {
            let ret = unsafe { libc::poll(&mut pfd, 1, millis) };
            if ret >= 0 {
                if pfd.revents & (libc::POLLERR | libc::POLLHUP | libc::POLLNVAL) != 0
                    && pfd.revents & libc::POLLIN == 0
                {
                    return Err(io::Error::from_raw_os_error(libc::EIO));
                }
                return Ok(ret > 0);
            }
            let err = io::Error::last_os_error();
            if err.kind() != io::ErrorKind::Interrupted {
                return Err(err);
            }
        }
    }
}

impl CaptureDevice for KernelDevice {
    fn name(&self) -> &str {
        &self.path
    }

    fn caps(&self) -> io::Result<DeviceCaps> {
        let caps = self.device.query_caps()?;
        let bits = caps.capabilities.bits();
        Ok(DeviceCaps {
            driver: caps.driver,
            card: caps.card,
            bus: caps.bus,
            video_capture: bits & V4L2_CAP_VIDEO_CAPTURE != 0,
            streaming: bits & V4L2_CAP_STREAMING != 0,
            mem_to_mem: bits & V4L2_CAP_VIDEO_M2M != 0,
        })
    }

    fn enum_formats(&self) -> io::Result<Vec<PixelFormat>> {
        let formats = self.device.enum_formats()?;
        for fmt in &formats {
            tracing::debug!("  {:?}: {}", fmt.fourcc, fmt.description);
        }
        Ok(formats
            .iter()
            .filter_map(|f| PixelFormat::from_fourcc(&f.fourcc.repr))
            .collect())
    }

    fn frame_sizes(&self, format: PixelFormat) -> io::Result<Vec<Resolution>> {
        let sizes = self.device.enum_framesizes(fourcc(format))?;
        let mut out = Vec::new();
        for size in sizes {
            match size.size {
                FrameSizeEnum::Discrete(d) => out.push(Resolution::new(d.width, d.height)),
                FrameSizeEnum::Stepwise(s) => {
                    out.push(Resolution::new(s.max_width, s.max_height));
                    out.push(Resolution::new(s.min_width, s.min_height));
                }
            }
        }
        Ok(out)
    }

    fn frame_intervals(&self, format: PixelFormat, size: Resolution) -> io::Result<Vec<Duration>> {
        let intervals =
            self.device
                .enum_frameintervals(fourcc(format), size.width, size.height)?;
        let mut out: Vec<Duration> = intervals
            .into_iter()
            .filter_map(|fi| {
                let fraction = match fi.interval {
                    FrameIntervalEnum::Discrete(f) => f,
                    FrameIntervalEnum::Stepwise(s) => s.min,
                };
                (fraction.denominator != 0).then(|| {
                    Duration::from_secs_f64(fraction.numerator as f64 / fraction.denominator as f64)
                })
            })
            .collect();
        out.sort();
        Ok(out)
    }

    fn try_format(&self, candidate: &FormatDescriptor) -> io::Result<FormatDescriptor> {
        let mut raw: v4l_sys::v4l2_format = unsafe { mem::zeroed() };
        raw.type_ = V4L2_BUF_TYPE_VIDEO_CAPTURE;
        let pix = unsafe {
            raw.fmt.pix.width = candidate.width;
            raw.fmt.pix.height = candidate.height;
            raw.fmt.pix.pixelformat = u32::from_le_bytes(candidate.pixel_format.fourcc());
            raw.fmt.pix.field = V4L2_FIELD_ANY;
            xioctl(self.fd, vidioc::VIDIOC_TRY_FMT as u64, &mut raw)?;
            raw.fmt.pix
        };
        let repr = pix.pixelformat.to_le_bytes();
        Ok(FormatDescriptor {
            width: pix.width,
            height: pix.height,
            pixel_format: PixelFormat::from_fourcc(&repr).ok_or_else(|| unknown_fourcc(repr))?,
            stride: pix.bytesperline,
            size: pix.sizeimage,
        })
    }

    fn set_format(&self, candidate: &FormatDescriptor) -> io::Result<FormatDescriptor> {
        let requested = Format::new(candidate.width, candidate.height, fourcc(candidate.pixel_format));
        let accepted = self.device.set_format(&requested)?;
        descriptor_from(&accepted)
    }

    fn format(&self) -> io::Result<FormatDescriptor> {
        descriptor_from(&self.device.format()?)
    }

    fn query_controls(&self) -> io::Result<Vec<ControlInfo>> {
        let controls = self.device.query_controls()?;
        Ok(controls
            .into_iter()
            .map(|desc| {
                let kind = match desc.typ {
                    ControlType::Integer | ControlType::Integer64 => ControlKind::Integer,
                    ControlType::Boolean => ControlKind::Boolean,
                    ControlType::Menu | ControlType::IntegerMenu => ControlKind::Menu,
                    ControlType::Button => ControlKind::Button,
                    _ => ControlKind::Other,
                };
                let menu = desc
                    .items
                    .unwrap_or_default()
                    .into_iter()
                    .map(|(index, item)| MenuEntry {
                        index,
                        name: match item {
                            MenuItem::Name(name) => name,
                            MenuItem::Value(value) => value.to_string(),
                        },
                    })
                    .collect();
                ControlInfo {
                    id: desc.id,
                    name: desc.name,
                    kind,
                    minimum: desc.minimum,
                    maximum: desc.maximum,
                    step: desc.step,
                    default: desc.default,
                    disabled: desc.flags.intersects(ControlFlags::DISABLED),
                    menu,
                }
            })
            .collect())
    }

    fn control(&self, id: u32) -> io::Result<i64> {
        match self.device.control(id)?.value {
            Value::Integer(v) => Ok(v),
            Value::Boolean(b) => Ok(b as i64),
            other => Err(io::Error::new(
                io::ErrorKind::InvalidData,
                format!("control {id:#x} is not numeric: {other:?}"),
            )),
        }
    }

    fn set_control(&self, id: u32, value: i64) -> io::Result<()> {
        self.device.set_control(Control {
            id,
            value: Value::Integer(value),
        })
    }

    fn request_buffers(&self, count: u32, memory: MemoryKind) -> io::Result<u32> {
        let mut req: v4l_sys::v4l2_requestbuffers = unsafe { mem::zeroed() };
        req.count = count;
        req.type_ = V4L2_BUF_TYPE_VIDEO_CAPTURE;
        req.memory = memory.as_raw();
        unsafe { xioctl(self.fd, vidioc::VIDIOC_REQBUFS as u64, &mut req)? };
        Ok(req.count)
    }

    fn map_buffer(
        &self,
        index: u32,
        memory: MemoryKind,
        import: Option<RawFd>,
    ) -> io::Result<Arc<dyn SlotMemory>> {
        let mut buf = Self::raw_buffer(index, memory);
        unsafe { xioctl(self.fd, vidioc::VIDIOC_QUERYBUF as u64, &mut buf)? };

        let region = match (memory, import) {
            (MemoryKind::Mmap, _) => {
                let offset = unsafe { buf.m.offset };
                MappedRegion::map(self.fd, buf.length as usize, offset as i64)?
            }
            (MemoryKind::DmaBuf, Some(fd)) => {
                let len = unsafe { libc::lseek(fd, 0, libc::SEEK_END) };
                if len <= 0 {
                    return Err(io::Error::last_os_error());
                }
                MappedRegion::map(fd, len as usize, 0)?
            }
            (MemoryKind::DmaBuf, None) => {
                return Err(io::Error::new(
                    io::ErrorKind::InvalidInput,
                    "dmabuf slot without an imported fd",
                ));
            }
        };
        Ok(Arc::new(region))
    }

    fn queue_buffer(&self, index: u32, memory: MemoryKind, import: Option<RawFd>) -> io::Result<()> {
        let mut buf = Self::raw_buffer(index, memory);
        if let (MemoryKind::DmaBuf, Some(fd)) = (memory, import) {
            buf.m.fd = fd;
        }
        unsafe { xioctl(self.fd, vidioc::VIDIOC_QBUF as u64, &mut buf) }
    }

    fn dequeue_buffer(
        &self,
        memory: MemoryKind,
        timeout: Duration,
    ) -> io::Result<Option<DequeuedBuffer>> {
        if !self.wait_readable(timeout)? {
            return Ok(None);
        }
        let mut buf = Self::raw_buffer(0, memory);
        match unsafe { xioctl(self.fd, vidioc::VIDIOC_DQBUF as u64, &mut buf) } {
            Ok(()) => Ok(Some(DequeuedBuffer {
                index: buf.index,
                bytes_used: buf.bytesused,
                length: buf.length,
                sequence: buf.sequence,
                timestamp: Duration::new(
                    buf.timestamp.tv_sec.max(0) as u64,
                    (buf.timestamp.tv_usec.max(0) as u32).saturating_mul(1000),
                ),
            })),
            Err(e) if e.raw_os_error() == Some(libc::EAGAIN) => Ok(None),
            Err(e) => Err(e),
        }
    }

    fn stream_on(&self) -> io::Result<()> {
        let mut typ = V4L2_BUF_TYPE_VIDEO_CAPTURE;
        unsafe { xioctl(self.fd, vidioc::VIDIOC_STREAMON as u64, &mut typ) }
    }

    fn stream_off(&self) -> io::Result<()> {
        let mut typ = V4L2_BUF_TYPE_VIDEO_CAPTURE;
        unsafe { xioctl(self.fd, vidioc::VIDIOC_STREAMOFF as u64, &mut typ) }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_missing_node_is_not_found() {
        match KernelDevice::open("/dev/video-does-not-exist") {
            Err(CameraError::DeviceOpenFailed { reason, .. }) => {
                assert_eq!(reason, OpenFailure::NotFound)
            }
            Err(other) => panic!("unexpected error: {other}"),
            Ok(_) => panic!("opened a missing device"),
        }
    }

    #[test]
    fn test_anonymous_mapping_round_trip() {
        let fd = unsafe { libc::memfd_create(c"camhal-test".as_ptr(), 0) };
        assert!(fd >= 0);
        assert_eq!(unsafe { libc::ftruncate(fd, 4096) }, 0);

        let region = MappedRegion::map(fd, 4096, 0).unwrap();
        assert_eq!(region.len(), 4096);
        assert!(region.bytes().iter().all(|b| *b == 0));

        unsafe { libc::close(fd) };
    }
}
