//! Software camera with the same buffer rules a V4L2 driver enforces.
//!
//! It produces test patterns at a fixed rate, refuses format changes while a
//! buffer table exists, refuses double queueing, and can be scripted with
//! [`Fault`]s to reproduce stalls, corrupt compressed frames and device loss.

use super::{
    BytesView, CaptureDevice, ControlInfo, DequeuedBuffer, DeviceCaps, SlotMemory,
};
use crate::controls::cid;
use crate::format::{FormatDescriptor, MemoryKind, PixelFormat, Resolution, align_up};
use std::collections::{HashMap, VecDeque};
use std::io;
use std::os::fd::RawFd;
use std::sync::{Arc, Condvar, Mutex, MutexGuard, RwLock};
use std::time::{Duration, Instant};

/// Scripted misbehaviour, consumed in order by `dequeue_buffer`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Fault {
    /// The next `n` dequeues report would-block.
    WouldBlock(u32),
    /// Every dequeue would-block until the stream is switched off.
    Stall,
    /// The next dequeue fails with `EIO`; the device is gone afterwards.
    DeviceLost,
    /// The next `n` compressed frames are not valid JPEG.
    CorruptFrames(u32),
    /// The next `n` frames report fewer bytes than the buffer holds.
    ShortFrames(u32),
}

struct VirtualMemory {
    bytes: RwLock<Vec<u8>>,
}

impl SlotMemory for VirtualMemory {
    fn len(&self) -> usize {
        self.bytes.read().map(|b| b.len()).unwrap_or(0)
    }

    fn bytes(&self) -> BytesView<'_> {
        match self.bytes.read() {
            Ok(guard) => BytesView::Locked(guard),
            Err(poisoned) => BytesView::Locked(poisoned.into_inner()),
        }
    }
}

/// Counters a test can assert on.
#[derive(Debug, Clone, Default)]
pub struct VirtualStats {
    pub stream_on: u32,
    pub stream_off: u32,
    pub set_format: Vec<FormatDescriptor>,
    pub request_buffers: Vec<u32>,
    pub control_writes: HashMap<u32, u32>,
    pub frames: u64,
}

impl VirtualStats {
    pub fn writes(&self, id: u32) -> u32 {
        self.control_writes.get(&id).copied().unwrap_or(0)
    }
}

struct VirtualState {
    format: FormatDescriptor,
    buffers: Vec<Arc<VirtualMemory>>,
    queued: VecDeque<u32>,
    streaming: bool,
    sequence: u32,
    next_frame_at: Instant,
    faults: VecDeque<Fault>,
    stalled: bool,
    gone: bool,
    controls: HashMap<u32, i64>,
    reject_next_format: bool,
    fail_next_stream_on: bool,
    stats: VirtualStats,
}

pub struct VirtualDeviceBuilder {
    name: String,
    caps: DeviceCaps,
    formats: Vec<PixelFormat>,
    sizes: Vec<Resolution>,
    frame_interval: Duration,
    stride_align: u32,
    controls: Vec<ControlInfo>,
}

impl Default for VirtualDeviceBuilder {
    fn default() -> Self {
        Self {
            name: "virtual0".to_string(),
            caps: DeviceCaps {
                driver: "camhal-virtual".to_string(),
                card: "Virtual Camera".to_string(),
                bus: "platform:virtual".to_string(),
                video_capture: true,
                streaming: true,
                mem_to_mem: false,
            },
            formats: vec![PixelFormat::Nv21, PixelFormat::Yuyv, PixelFormat::Mjpeg],
            sizes: vec![
                Resolution::new(320, 240),
                Resolution::new(640, 480),
                Resolution::new(1280, 720),
                Resolution::new(1920, 1080),
            ],
            frame_interval: Duration::from_millis(5),
            stride_align: 1,
            controls: Vec::new(),
        }
    }
}

impl VirtualDeviceBuilder {
    pub fn name(mut self, name: &str) -> Self {
        self.name = name.to_string();
        self
    }

    pub fn caps(mut self, caps: DeviceCaps) -> Self {
        self.caps = caps;
        self
    }

    pub fn formats(mut self, formats: &[PixelFormat]) -> Self {
        self.formats = formats.to_vec();
        self
    }

    pub fn sizes(mut self, sizes: &[Resolution]) -> Self {
        self.sizes = sizes.to_vec();
        self
    }

    pub fn fps(mut self, fps: u32) -> Self {
        self.frame_interval = Duration::from_secs_f64(1.0 / fps.max(1) as f64);
        self
    }

    /// Pad each line to a multiple of `align` bytes.
    pub fn stride_align(mut self, align: u32) -> Self {
        self.stride_align = align.max(1);
        self
    }

    pub fn control(mut self, info: ControlInfo) -> Self {
        self.controls.push(info);
        self
    }

    /// Zoom, rotate, exposure, white balance, flash, focus, focus status and
    /// horizontal flip, as an integrated sensor module exposes them.
    pub fn with_sensor_controls(self) -> Self {
        self.control(ControlInfo::integer(cid::ZOOM_ABSOLUTE, "Zoom, Absolute", 100, 400, 100))
            .control(ControlInfo::integer(cid::ROTATE, "Rotate", 0, 270, 0))
            .control(ControlInfo::integer(cid::EXPOSURE, "Exposure", 0, 8, 4))
            .control(ControlInfo::menu(
                cid::AUTO_N_PRESET_WHITE_BALANCE,
                "White Balance, Auto & Preset",
                &[
                    (0, "Manual"),
                    (1, "Auto"),
                    (2, "Incandescent"),
                    (3, "Fluorescent"),
                    (6, "Daylight"),
                    (8, "Cloudy"),
                ],
                1,
            ))
            .control(ControlInfo::menu(
                cid::FLASH_LED_MODE,
                "LED Mode",
                &[(0, "Off"), (1, "Flash"), (2, "Torch")],
                0,
            ))
            .control(ControlInfo::integer(cid::FOCUS_AUTO, "Focus, Automatic", 0, 7, 0))
            .control(ControlInfo::integer(cid::AUTO_FOCUS_STATUS, "Auto Focus, Status", 0, 7, 0))
            .control(ControlInfo::integer(cid::HFLIP, "Horizontal Flip", 0, 1, 0))
            .control(ControlInfo::menu(
                cid::POWER_LINE_FREQUENCY,
                "Power Line Frequency",
                &[(0, "Disabled"), (1, "50 Hz"), (2, "60 Hz"), (3, "Auto")],
                1,
            ))
            .control(ControlInfo::menu(
                cid::COLORFX,
                "Color Effects",
                &[(0, "None"), (1, "Black & White"), (2, "Sepia"), (3, "Negative")],
                0,
            ))
    }

    pub fn build(self) -> Arc<VirtualDevice> {
        let initial_size = self.sizes.first().copied().unwrap_or(Resolution::new(640, 480));
        let initial_format = self.formats.first().copied().unwrap_or(PixelFormat::Yuyv);
        let format = aligned(
            FormatDescriptor::new(initial_size.width, initial_size.height, initial_format),
            self.stride_align,
        );
        let controls_state = self.controls.iter().map(|c| (c.id, c.default)).collect();

        Arc::new(VirtualDevice {
            name: self.name,
            caps: self.caps,
            formats: self.formats,
            sizes: self.sizes,
            frame_interval: self.frame_interval,
            stride_align: self.stride_align,
            controls: self.controls,
            epoch: Instant::now(),
            state: Mutex::new(VirtualState {
                format,
                buffers: Vec::new(),
                queued: VecDeque::new(),
                streaming: false,
                sequence: 0,
                next_frame_at: Instant::now(),
                faults: VecDeque::new(),
                stalled: false,
                gone: false,
                controls: controls_state,
                reject_next_format: false,
                fail_next_stream_on: false,
                stats: VirtualStats::default(),
            }),
            frame_ready: Condvar::new(),
        })
    }
}

fn aligned(mut format: FormatDescriptor, align: u32) -> FormatDescriptor {
    if format.pixel_format.is_compressed() || align <= 1 {
        return format;
    }
    format.stride = align_up(format.pixel_format.min_bytes_per_line(format.width), align);
    let rows = if format.pixel_format.is_planar_420() {
        format.height * 3 / 2
    } else {
        format.height
    };
    format.size = format.stride * rows;
    format
}

fn errno(code: i32) -> io::Error {
    io::Error::from_raw_os_error(code)
}

pub struct VirtualDevice {
    name: String,
    caps: DeviceCaps,
    formats: Vec<PixelFormat>,
    sizes: Vec<Resolution>,
    frame_interval: Duration,
    stride_align: u32,
    controls: Vec<ControlInfo>,
    epoch: Instant,
    state: Mutex<VirtualState>,
    frame_ready: Condvar,
}

impl VirtualDevice {
    pub fn builder() -> VirtualDeviceBuilder {
        VirtualDeviceBuilder::default()
    }

    fn lock(&self) -> MutexGuard<'_, VirtualState> {
        self.state.lock().unwrap_or_else(|p| p.into_inner())
    }

    fn alive(&self, state: &VirtualState) -> io::Result<()> {
        if state.gone {
            Err(errno(libc::ENODEV))
        } else {
            Ok(())
        }
    }

    pub fn inject(&self, fault: Fault) {
        let mut state = self.lock();
        state.faults.push_back(fault);
        self.frame_ready.notify_all();
    }

    pub fn reject_next_format(&self) {
        self.lock().reject_next_format = true;
    }

    pub fn fail_next_stream_on(&self) {
        self.lock().fail_next_stream_on = true;
    }

    /// Brings a lost device back with no buffers, as after a USB replug.
    pub fn replug(&self) {
        let mut state = self.lock();
        state.gone = false;
        state.streaming = false;
        state.stalled = false;
        state.buffers.clear();
        state.queued.clear();
        state.faults.clear();
    }

    /// Value the focus status register reports next.
    pub fn set_focus_status(&self, status: i64) {
        self.lock().controls.insert(cid::AUTO_FOCUS_STATUS, status);
    }

    pub fn stats(&self) -> VirtualStats {
        self.lock().stats.clone()
    }

    pub fn queued_count(&self) -> usize {
        self.lock().queued.len()
    }

    pub fn is_streaming(&self) -> bool {
        self.lock().streaming
    }

    pub fn buffer_count(&self) -> usize {
        self.lock().buffers.len()
    }

    fn closest_size(&self, requested: Resolution) -> Resolution {
        if self.sizes.contains(&requested) {
            return requested;
        }
        self.sizes
            .iter()
            .copied()
            .min_by_key(|s| s.area().abs_diff(requested.area()))
            .unwrap_or(requested)
    }

    fn negotiate(&self, candidate: &FormatDescriptor) -> FormatDescriptor {
        let pixel_format = if self.formats.contains(&candidate.pixel_format) {
            candidate.pixel_format
        } else {
            self.formats.first().copied().unwrap_or(PixelFormat::Yuyv)
        };
        let size = self.closest_size(candidate.resolution());
        aligned(
            FormatDescriptor::new(size.width, size.height, pixel_format),
            self.stride_align,
        )
    }

    fn render(&self, state: &mut VirtualState, index: usize) -> (u32, u32) {
        let format = state.format;
        let sequence = state.sequence;
        let corrupt = matches!(state.faults.front(), Some(Fault::CorruptFrames(_)));
        if corrupt {
            consume(&mut state.faults);
        }
        let short = matches!(state.faults.front(), Some(Fault::ShortFrames(_)));
        if short {
            consume(&mut state.faults);
        }

        let memory = &state.buffers[index];
        let mut bytes = match memory.bytes.write() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        let length = bytes.len() as u32;

        let used = if format.pixel_format.is_compressed() {
            let jpeg = if corrupt {
                vec![0xFF, 0xD8, 0x00, 0x13, 0x37, 0x00, 0x00]
            } else {
                patterns::jpeg(format.width, format.height, sequence)
            };
            let n = jpeg.len().min(bytes.len());
            bytes[..n].copy_from_slice(&jpeg[..n]);
            n as u32
        } else {
            patterns::raw(&format, sequence, &mut bytes);
            length
        };

        let used = if short { used / 2 } else { used };
        (used, length)
    }
}

fn consume(faults: &mut VecDeque<Fault>) {
    let remaining = match faults.front() {
        Some(Fault::WouldBlock(n)) | Some(Fault::CorruptFrames(n)) | Some(Fault::ShortFrames(n)) => {
            n.saturating_sub(1)
        }
        _ => 0,
    };
    match faults.front_mut() {
        Some(Fault::WouldBlock(n)) | Some(Fault::CorruptFrames(n)) | Some(Fault::ShortFrames(n))
            if remaining > 0 =>
        {
            *n = remaining
        }
        _ => {
            faults.pop_front();
        }
    }
}

impl CaptureDevice for VirtualDevice {
    fn name(&self) -> &str {
        &self.name
    }

    fn caps(&self) -> io::Result<DeviceCaps> {
        self.alive(&self.lock())?;
        Ok(self.caps.clone())
    }

    fn enum_formats(&self) -> io::Result<Vec<PixelFormat>> {
        Ok(self.formats.clone())
    }

    fn frame_sizes(&self, format: PixelFormat) -> io::Result<Vec<Resolution>> {
        if !self.formats.contains(&format) {
            return Err(errno(libc::EINVAL));
        }
        Ok(self.sizes.clone())
    }

    fn frame_intervals(&self, format: PixelFormat, size: Resolution) -> io::Result<Vec<Duration>> {
        if !self.formats.contains(&format) || !self.sizes.contains(&size) {
            return Err(errno(libc::EINVAL));
        }
        Ok(vec![self.frame_interval])
    }

    fn try_format(&self, candidate: &FormatDescriptor) -> io::Result<FormatDescriptor> {
        self.alive(&self.lock())?;
        Ok(self.negotiate(candidate))
    }

    fn set_format(&self, candidate: &FormatDescriptor) -> io::Result<FormatDescriptor> {
        let mut state = self.lock();
        self.alive(&state)?;
        if !state.buffers.is_empty() || state.streaming {
            return Err(errno(libc::EBUSY));
        }
        if std::mem::take(&mut state.reject_next_format) {
            return Err(errno(libc::EINVAL));
        }
        let accepted = self.negotiate(candidate);
        state.format = accepted;
        state.stats.set_format.push(accepted);
        Ok(accepted)
    }

    fn format(&self) -> io::Result<FormatDescriptor> {
        let state = self.lock();
        self.alive(&state)?;
        Ok(state.format)
    }

    fn query_controls(&self) -> io::Result<Vec<ControlInfo>> {
        Ok(self.controls.clone())
    }

    fn control(&self, id: u32) -> io::Result<i64> {
        let state = self.lock();
        self.alive(&state)?;
        state.controls.get(&id).copied().ok_or_else(|| errno(libc::EINVAL))
    }

    fn set_control(&self, id: u32, value: i64) -> io::Result<()> {
        let mut state = self.lock();
        self.alive(&state)?;
        let info = self
            .controls
            .iter()
            .find(|c| c.id == id)
            .ok_or_else(|| errno(libc::EINVAL))?;
        if value < info.minimum || value > info.maximum {
            return Err(errno(libc::ERANGE));
        }
        state.controls.insert(id, value);
        *state.stats.control_writes.entry(id).or_default() += 1;
        Ok(())
    }

    fn request_buffers(&self, count: u32, _memory: MemoryKind) -> io::Result<u32> {
        let mut state = self.lock();
        self.alive(&state)?;
        if state.streaming {
            return Err(errno(libc::EBUSY));
        }
        state.stats.request_buffers.push(count);
        state.queued.clear();
        let size = state.format.size as usize;
        state.buffers = (0..count.min(32))
            .map(|_| {
                Arc::new(VirtualMemory {
                    bytes: RwLock::new(vec![0u8; size]),
                })
            })
            .collect();
        Ok(state.buffers.len() as u32)
    }

    fn map_buffer(
        &self,
        index: u32,
        _memory: MemoryKind,
        _import: Option<RawFd>,
    ) -> io::Result<Arc<dyn SlotMemory>> {
        let state = self.lock();
        self.alive(&state)?;
        let memory = state
            .buffers
            .get(index as usize)
            .cloned()
            .ok_or_else(|| errno(libc::EINVAL))?;
        Ok(memory)
    }

    fn queue_buffer(&self, index: u32, _memory: MemoryKind, _import: Option<RawFd>) -> io::Result<()> {
        let mut state = self.lock();
        self.alive(&state)?;
        if index as usize >= state.buffers.len() || state.queued.contains(&index) {
            return Err(errno(libc::EINVAL));
        }
        state.queued.push_back(index);
        self.frame_ready.notify_all();
        Ok(())
    }

    fn dequeue_buffer(
        &self,
        _memory: MemoryKind,
        timeout: Duration,
    ) -> io::Result<Option<DequeuedBuffer>> {
        let deadline = Instant::now() + timeout;
        let mut state = self.lock();
        loop {
            self.alive(&state)?;
            match state.faults.front() {
                Some(Fault::DeviceLost) => {
                    state.faults.pop_front();
                    state.gone = true;
                    state.streaming = false;
                    return Err(errno(libc::EIO));
                }
                Some(Fault::WouldBlock(_)) => {
                    consume(&mut state.faults);
                    return Ok(None);
                }
                Some(Fault::Stall) => {
                    state.faults.pop_front();
                    state.stalled = true;
                }
                _ => {}
            }
            if state.stalled || !state.streaming {
                return Ok(None);
            }

            let now = Instant::now();
            if !state.queued.is_empty() && now >= state.next_frame_at {
                break;
            }
            if now >= deadline {
                return Ok(None);
            }
            let wake = if state.queued.is_empty() {
                deadline
            } else {
                state.next_frame_at.min(deadline)
            };
            state = self
                .frame_ready
                .wait_timeout(state, wake.saturating_duration_since(now))
                .map(|(guard, _)| guard)
                .unwrap_or_else(|p| p.into_inner().0);
        }

        let Some(index) = state.queued.pop_front() else {
            return Ok(None);
        };
        let (bytes_used, length) = self.render(&mut state, index as usize);
        let sequence = state.sequence;
        state.sequence = state.sequence.wrapping_add(1);
        state.next_frame_at = Instant::now() + self.frame_interval;
        state.stats.frames += 1;

        Ok(Some(DequeuedBuffer {
            index,
            bytes_used,
            length,
            sequence,
            timestamp: self.epoch.elapsed(),
        }))
    }

    fn stream_on(&self) -> io::Result<()> {
        let mut state = self.lock();
        self.alive(&state)?;
        if std::mem::take(&mut state.fail_next_stream_on) {
            return Err(errno(libc::EBUSY));
        }
        if state.buffers.is_empty() {
            return Err(errno(libc::EINVAL));
        }
        state.streaming = true;
        state.next_frame_at = Instant::now();
        state.stats.stream_on += 1;
        self.frame_ready.notify_all();
        Ok(())
    }

    fn stream_off(&self) -> io::Result<()> {
        let mut state = self.lock();
        self.alive(&state)?;
        state.streaming = false;
        state.stalled = false;
        state.queued.clear();
        state.stats.stream_off += 1;
        self.frame_ready.notify_all();
        Ok(())
    }
}

/// Frame content generators.
pub(crate) mod patterns {
    use crate::format::{FormatDescriptor, PixelFormat};

    const BARS: [(u8, u8, u8); 8] = [
        (235, 128, 128),
        (210, 16, 146),
        (170, 166, 16),
        (145, 54, 34),
        (106, 202, 222),
        (81, 90, 240),
        (41, 240, 110),
        (16, 128, 128),
    ];

    fn bar(x: u32, width: u32, shift: u32) -> (u8, u8, u8) {
        let pos = (x + shift) % width.max(1);
        BARS[(pos * 8 / width.max(1)) as usize % 8]
    }

    /// Moving color bars; the first luma bytes carry the sequence number.
    pub fn raw(format: &FormatDescriptor, sequence: u32, out: &mut [u8]) {
        let (w, h) = (format.width, format.height);
        let stride = format.stride as usize;
        let shift = sequence * 4;
        match format.pixel_format {
            PixelFormat::Yuyv => {
                for y in 0..h as usize {
                    let row = &mut out[y * stride..y * stride + w as usize * 2];
                    for (i, px) in row.chunks_exact_mut(4).enumerate() {
                        let (luma, u, v) = bar(i as u32 * 2, w, shift);
                        px.copy_from_slice(&[luma, u, luma, v]);
                    }
                }
            }
            PixelFormat::Rgb24 => {
                for y in 0..h as usize {
                    let row = &mut out[y * stride..y * stride + w as usize * 3];
                    for (x, px) in row.chunks_exact_mut(3).enumerate() {
                        let (luma, _, _) = bar(x as u32, w, shift);
                        px.copy_from_slice(&[luma, luma, luma]);
                    }
                }
            }
            _ => {
                let luma_size = stride * h as usize;
                for y in 0..h as usize {
                    for x in 0..w as usize {
                        out[y * stride + x] = bar(x as u32, w, shift).0;
                    }
                }
                let chroma_rows = h as usize / 2;
                for y in 0..chroma_rows {
                    let start = luma_size + y * stride;
                    let end = (start + w as usize).min(out.len());
                    for (i, b) in out[start..end].iter_mut().enumerate() {
                        let (_, u, v) = bar((i as u32 / 2) * 2, w, shift);
                        *b = if i % 2 == 0 { v } else { u };
                    }
                }
            }
        }
        let tag = sequence.to_le_bytes();
        let n = tag.len().min(out.len());
        out[..n].copy_from_slice(&tag[..n]);
    }

    pub fn jpeg(width: u32, height: u32, sequence: u32) -> Vec<u8> {
        let (w, h) = (width as usize, height as usize);
        let mut rgb = vec![0u8; w * h * 3];
        for y in 0..h {
            for x in 0..w {
                let i = (y * w + x) * 3;
                rgb[i] = ((x * 255) / w.max(1)) as u8;
                rgb[i + 1] = ((y * 255) / h.max(1)) as u8;
                rgb[i + 2] = (sequence % 256) as u8;
            }
        }
        let image = turbojpeg::Image {
            pixels: rgb.as_slice(),
            width: w,
            pitch: w * 3,
            height: h,
            format: turbojpeg::PixelFormat::RGB,
        };
        match turbojpeg::compress(image, 80, turbojpeg::Subsamp::Sub2x2) {
            Ok(buf) => buf.to_vec(),
            Err(e) => {
                tracing::warn!("Virtual JPEG encode failed: {}", e);
                Vec::new()
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn device() -> Arc<VirtualDevice> {
        VirtualDevice::builder().fps(500).build()
    }

    fn configure(dev: &VirtualDevice, count: u32) {
        dev.set_format(&FormatDescriptor::new(640, 480, PixelFormat::Nv21))
            .unwrap();
        dev.request_buffers(count, MemoryKind::Mmap).unwrap();
    }

    #[test]
    fn test_rejects_format_change_with_buffers() {
        let dev = device();
        configure(&dev, 2);
        let err = dev
            .set_format(&FormatDescriptor::new(320, 240, PixelFormat::Nv21))
            .unwrap_err();
        assert_eq!(err.raw_os_error(), Some(libc::EBUSY));
    }

    #[test]
    fn test_rejects_double_queue() {
        let dev = device();
        configure(&dev, 2);
        dev.queue_buffer(0, MemoryKind::Mmap, None).unwrap();
        let err = dev.queue_buffer(0, MemoryKind::Mmap, None).unwrap_err();
        assert_eq!(err.raw_os_error(), Some(libc::EINVAL));
    }

    #[test]
    fn test_adjusts_unknown_size() {
        let dev = device();
        let accepted = dev
            .set_format(&FormatDescriptor::new(630, 470, PixelFormat::Nv21))
            .unwrap();
        assert_eq!(accepted.resolution(), Resolution::new(640, 480));
    }

    #[test]
    fn test_frames_carry_sequence_and_monotonic_time() {
        let dev = device();
        configure(&dev, 2);
        dev.queue_buffer(0, MemoryKind::Mmap, None).unwrap();
        dev.queue_buffer(1, MemoryKind::Mmap, None).unwrap();
        dev.stream_on().unwrap();

        let timeout = Duration::from_millis(200);
        let a = dev.dequeue_buffer(MemoryKind::Mmap, timeout).unwrap().unwrap();
        let b = dev.dequeue_buffer(MemoryKind::Mmap, timeout).unwrap().unwrap();
        assert_eq!(a.sequence + 1, b.sequence);
        assert!(b.timestamp > a.timestamp);
        assert_eq!(a.bytes_used, a.length);
    }

    #[test]
    fn test_would_block_without_queued_buffers() {
        let dev = device();
        configure(&dev, 1);
        dev.stream_on().unwrap();
        let got = dev
            .dequeue_buffer(MemoryKind::Mmap, Duration::from_millis(5))
            .unwrap();
        assert!(got.is_none());
    }

    #[test]
    fn test_device_lost_is_permanent() {
        let dev = device();
        configure(&dev, 1);
        dev.queue_buffer(0, MemoryKind::Mmap, None).unwrap();
        dev.stream_on().unwrap();
        dev.inject(Fault::DeviceLost);

        let err = dev
            .dequeue_buffer(MemoryKind::Mmap, Duration::from_millis(5))
            .unwrap_err();
        assert_eq!(err.raw_os_error(), Some(libc::EIO));
        let err = dev.stream_off().unwrap_err();
        assert_eq!(err.raw_os_error(), Some(libc::ENODEV));
    }

    #[test]
    fn test_stall_clears_on_stream_off() {
        let dev = device();
        configure(&dev, 1);
        dev.queue_buffer(0, MemoryKind::Mmap, None).unwrap();
        dev.stream_on().unwrap();
        dev.inject(Fault::Stall);
        let timeout = Duration::from_millis(20);
        assert!(dev.dequeue_buffer(MemoryKind::Mmap, timeout).unwrap().is_none());

        dev.stream_off().unwrap();
        dev.queue_buffer(0, MemoryKind::Mmap, None).unwrap();
        dev.stream_on().unwrap();
        assert!(dev.dequeue_buffer(MemoryKind::Mmap, timeout).unwrap().is_some());
    }

    #[test]
    fn test_control_range_checked() {
        let dev = VirtualDevice::builder().with_sensor_controls().build();
        dev.set_control(cid::ZOOM_ABSOLUTE, 200).unwrap();
        assert_eq!(dev.control(cid::ZOOM_ABSOLUTE).unwrap(), 200);
        assert!(dev.set_control(cid::ZOOM_ABSOLUTE, 9000).is_err());
        assert!(dev.set_control(0x1234, 1).is_err());
        assert_eq!(dev.stats().writes(cid::ZOOM_ABSOLUTE), 1);
    }

    #[test]
    fn test_mjpeg_frames_are_decodable_jpeg() {
        let jpeg = patterns::jpeg(64, 48, 3);
        assert_eq!(&jpeg[..2], &[0xFF, 0xD8]);
    }
}
