use crate::error::Result;
use crate::exif::ExifTable;
use crate::format::PixelFormat;
use crate::pool::{BufferKey, BufferPool, LeaseTicket};
use std::fmt;
use std::ops::{BitOr, BitOrAssign, Deref};
use std::sync::Arc;
use std::time::Duration;

/// Which consumers a frame is for.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub struct FrameRoles(u8);

impl FrameRoles {
    pub const PREVIEW: FrameRoles = FrameRoles(1);
    pub const VIDEO: FrameRoles = FrameRoles(1 << 1);
    pub const SNAPSHOT: FrameRoles = FrameRoles(1 << 2);

    pub const fn empty() -> Self {
        FrameRoles(0)
    }

    pub const fn contains(self, other: FrameRoles) -> bool {
        self.0 & other.0 == other.0
    }

    pub const fn is_empty(self) -> bool {
        self.0 == 0
    }

    pub const fn bits(self) -> u8 {
        self.0
    }
}

impl BitOr for FrameRoles {
    type Output = FrameRoles;

    fn bitor(self, rhs: FrameRoles) -> FrameRoles {
        FrameRoles(self.0 | rhs.0)
    }
}

impl BitOrAssign for FrameRoles {
    fn bitor_assign(&mut self, rhs: FrameRoles) {
        self.0 |= rhs.0;
    }
}

/// One converted frame.
#[derive(Clone)]
pub struct FrameDescriptor {
    pub index: u32,
    pub key: BufferKey,
    pub canvas: Option<u32>,
    /// Capture time on the monotonic clock.
    pub timestamp: Duration,
    pub sequence: u32,
    /// Bytes the device wrote into the slot.
    pub bytes_used: u32,
    pub pixel_format: PixelFormat,
    pub width: u32,
    pub height: u32,
    pub roles: FrameRoles,
    pub exif: Option<ExifTable>,
    pub data: Vec<u8>,
}

impl fmt::Debug for FrameDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FrameDescriptor")
            .field("index", &self.index)
            .field("key", &self.key)
            .field("sequence", &self.sequence)
            .field("timestamp", &self.timestamp)
            .field("format", &self.pixel_format)
            .field("size", &format_args!("{}x{}", self.width, self.height))
            .field("roles", &self.roles)
            .field("bytes", &self.data.len())
            .finish()
    }
}

/// A delivered frame. Releasing or dropping it hands the slot back to the
/// driver exactly once.
pub struct FrameLease {
    frame: FrameDescriptor,
    owner: Option<(Arc<BufferPool>, LeaseTicket)>,
}

impl FrameLease {
    pub(crate) fn new(pool: Arc<BufferPool>, ticket: LeaseTicket, frame: FrameDescriptor) -> Self {
        Self {
            frame,
            owner: Some((pool, ticket)),
        }
    }

    /// A frame whose slot is already gone, such as a still capture.
    pub fn detached(frame: FrameDescriptor) -> Self {
        Self { frame, owner: None }
    }

    pub fn frame(&self) -> &FrameDescriptor {
        &self.frame
    }

    /// Returns the slot now and reports requeue failures.
    pub fn release(mut self) -> Result<()> {
        match self.owner.take() {
            Some((pool, ticket)) => pool.return_lease(ticket),
            None => Ok(()),
        }
    }

    /// Keeps the pixels and returns the slot.
    pub fn into_frame(mut self) -> FrameDescriptor {
        self.return_slot();
        let header = self.frame.clone_header();
        std::mem::replace(&mut self.frame, header)
    }

    fn return_slot(&mut self) {
        if let Some((pool, ticket)) = self.owner.take() {
            if let Err(e) = pool.return_lease(ticket) {
                tracing::warn!(index = ticket.index, error = %e, "Frame requeue failed");
            }
        }
    }
}

impl FrameDescriptor {
    fn clone_header(&self) -> FrameDescriptor {
        FrameDescriptor {
            index: self.index,
            key: self.key,
            canvas: self.canvas,
            timestamp: self.timestamp,
            sequence: self.sequence,
            bytes_used: self.bytes_used,
            pixel_format: self.pixel_format,
            width: self.width,
            height: self.height,
            roles: self.roles,
            exif: None,
            data: Vec::new(),
        }
    }
}

impl Deref for FrameLease {
    type Target = FrameDescriptor;

    fn deref(&self) -> &FrameDescriptor {
        &self.frame
    }
}

impl Drop for FrameLease {
    fn drop(&mut self) {
        self.return_slot();
    }
}

impl fmt::Debug for FrameLease {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FrameLease")
            .field("frame", &self.frame)
            .field("pooled", &self.owner.is_some())
            .finish()
    }
}
