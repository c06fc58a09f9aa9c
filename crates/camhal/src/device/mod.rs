//! Capture device boundary.
//!
//! [`CaptureDevice`] is the minimal V4L2 surface the pipeline drives: format
//! negotiation, controls, the buffer table and the queue/dequeue/stream calls.
//! Methods take `&self` so one device can be shared between the control thread
//! and the producer thread; implementations serialize internally where the
//! hardware needs it. Errors are raw `io::Error`s carrying the errno, and are
//! classified by the caller.

pub mod kernel;
pub mod virtual_device;

use crate::format::{FormatDescriptor, MemoryKind, PixelFormat, Resolution};
use std::io;
use std::ops::Deref;
use std::os::fd::RawFd;
use std::sync::{Arc, RwLockReadGuard};
use std::time::Duration;

pub use kernel::KernelDevice;
pub use virtual_device::{Fault, VirtualDevice, VirtualDeviceBuilder};

/// Result of `VIDIOC_QUERYCAP`, reduced to what the session needs.
#[derive(Debug, Clone, Default)]
pub struct DeviceCaps {
    pub driver: String,
    pub card: String,
    pub bus: String,
    pub video_capture: bool,
    pub streaming: bool,
    pub mem_to_mem: bool,
}

impl DeviceCaps {
    /// Memory-to-memory devices get caller buffers imported by fd.
    pub fn preferred_memory(&self) -> MemoryKind {
        if self.mem_to_mem {
            MemoryKind::DmaBuf
        } else {
            MemoryKind::Mmap
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControlKind {
    Integer,
    Boolean,
    Menu,
    Button,
    Other,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MenuEntry {
    pub index: u32,
    pub name: String,
}

/// Result of `VIDIOC_QUERYCTRL` plus its `VIDIOC_QUERYMENU` entries.
#[derive(Debug, Clone)]
pub struct ControlInfo {
    pub id: u32,
    pub name: String,
    pub kind: ControlKind,
    pub minimum: i64,
    pub maximum: i64,
    pub step: u64,
    pub default: i64,
    pub disabled: bool,
    pub menu: Vec<MenuEntry>,
}

impl ControlInfo {
    pub fn integer(id: u32, name: &str, minimum: i64, maximum: i64, default: i64) -> Self {
        Self {
            id,
            name: name.to_string(),
            kind: ControlKind::Integer,
            minimum,
            maximum,
            step: 1,
            default,
            disabled: false,
            menu: Vec::new(),
        }
    }

    pub fn menu(id: u32, name: &str, entries: &[(u32, &str)], default: i64) -> Self {
        let menu: Vec<MenuEntry> = entries
            .iter()
            .map(|(index, name)| MenuEntry {
                index: *index,
                name: name.to_string(),
            })
            .collect();
        Self {
            id,
            name: name.to_string(),
            kind: ControlKind::Menu,
            minimum: menu.iter().map(|e| e.index as i64).min().unwrap_or(0),
            maximum: menu.iter().map(|e| e.index as i64).max().unwrap_or(0),
            step: 1,
            default,
            disabled: false,
            menu,
        }
    }

    pub fn menu_index(&self, name: &str) -> Option<u32> {
        self.menu
            .iter()
            .find(|e| e.name.eq_ignore_ascii_case(name))
            .map(|e| e.index)
    }
}

/// A buffer handed back by `VIDIOC_DQBUF`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DequeuedBuffer {
    pub index: u32,
    pub bytes_used: u32,
    pub length: u32,
    pub sequence: u32,
    /// Driver timestamp on the monotonic clock.
    pub timestamp: Duration,
}

/// Read access to one slot's backing memory.
pub enum BytesView<'a> {
    Borrowed(&'a [u8]),
    Locked(RwLockReadGuard<'a, Vec<u8>>),
}

impl Deref for BytesView<'_> {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        match self {
            BytesView::Borrowed(bytes) => bytes,
            BytesView::Locked(guard) => guard.as_slice(),
        }
    }
}

/// Backing memory of a mapped slot. Dropping the last reference unmaps it.
pub trait SlotMemory: Send + Sync {
    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn bytes(&self) -> BytesView<'_>;
}

pub trait CaptureDevice: Send + Sync {
    /// Device node path, or a label for software devices.
    fn name(&self) -> &str;

    fn caps(&self) -> io::Result<DeviceCaps>;

    /// Pixel formats from `VIDIOC_ENUM_FMT` that the pipeline understands.
    fn enum_formats(&self) -> io::Result<Vec<PixelFormat>>;

    fn frame_sizes(&self, format: PixelFormat) -> io::Result<Vec<Resolution>>;

    /// Frame intervals offered for a size, fastest first.
    fn frame_intervals(&self, format: PixelFormat, size: Resolution) -> io::Result<Vec<Duration>>;

    fn try_format(&self, candidate: &FormatDescriptor) -> io::Result<FormatDescriptor>;

    fn set_format(&self, candidate: &FormatDescriptor) -> io::Result<FormatDescriptor>;

    fn format(&self) -> io::Result<FormatDescriptor>;

    fn query_controls(&self) -> io::Result<Vec<ControlInfo>>;

    fn control(&self, id: u32) -> io::Result<i64>;

    fn set_control(&self, id: u32, value: i64) -> io::Result<()>;

    /// `VIDIOC_REQBUFS`. Returns the count the driver granted; zero frees the table.
    fn request_buffers(&self, count: u32, memory: MemoryKind) -> io::Result<u32>;

    /// `VIDIOC_QUERYBUF` plus the mapping of the slot's memory.
    fn map_buffer(
        &self,
        index: u32,
        memory: MemoryKind,
        import: Option<RawFd>,
    ) -> io::Result<Arc<dyn SlotMemory>>;

    fn queue_buffer(&self, index: u32, memory: MemoryKind, import: Option<RawFd>) -> io::Result<()>;

    /// Waits at most `timeout` for a filled buffer. `Ok(None)` is a would-block.
    fn dequeue_buffer(
        &self,
        memory: MemoryKind,
        timeout: Duration,
    ) -> io::Result<Option<DequeuedBuffer>>;

    fn stream_on(&self) -> io::Result<()>;

    fn stream_off(&self) -> io::Result<()>;
}
