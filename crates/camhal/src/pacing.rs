//! Preview pacing on the monotonic clock.
//!
//! The producer polls the device faster than the target rate and lets
//! [`FramePacer`] decide, per poll, whether to deliver the new frame, park it
//! as the single cached "ahead" frame, or replay the cached one.

use crate::format::Resolution;
use std::fmt;
use std::str::FromStr;
use std::sync::{Condvar, Mutex};
use std::time::{Duration, Instant};

/// Most entries accepted in a limited-rate table.
pub const MAX_LIMITED_RATES: usize = 4;

/// Tie-break thresholds for the delivery window.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PacingPolicy {
    /// Accumulated time may fall this short of the expected interval.
    pub slop: Duration,
    /// A frame this early relative to the paced duration still goes out.
    pub early_margin: Duration,
    /// Leftover above `duration - adjust_margin` is carried as a credit.
    pub adjust_margin: Duration,
    /// Sleep between polls when the device is not on the fast path.
    pub poll_interval: Duration,
}

impl Default for PacingPolicy {
    fn default() -> Self {
        Self {
            slop: Duration::from_millis(20),
            early_margin: Duration::from_millis(5),
            adjust_margin: Duration::from_millis(10),
            poll_interval: Duration::from_millis(5),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PacingDecision {
    /// Send the frame just dequeued; drop any cached one.
    Deliver,
    /// Nothing new arrived; send the cached frame.
    DeliverCached,
    /// Too early; keep the new frame as the cached one.
    Cache,
    /// Nothing to send this round.
    Skip,
}

pub struct FramePacer {
    policy: PacingPolicy,
    expected_us: i64,
    duration_us: i64,
    frame_inv_us: i64,
    adjust_us: i64,
    last: Option<Instant>,
}

fn interval_us(fps: u32) -> i64 {
    1_000_000 / fps.max(1) as i64
}

impl FramePacer {
    /// `limited_fps` caps the delivery rate below `fps` for sizes the sensor
    /// cannot sustain.
    pub fn new(fps: u32, limited_fps: Option<u32>, policy: PacingPolicy) -> Self {
        let expected_us = interval_us(fps);
        let duration_us = match limited_fps {
            Some(limit) if limit > 0 => expected_us.max(interval_us(limit)),
            _ => expected_us,
        };
        Self {
            policy,
            expected_us,
            duration_us,
            frame_inv_us: 0,
            adjust_us: 0,
            last: None,
        }
    }

    pub fn frame_duration(&self) -> Duration {
        Duration::from_micros(self.duration_us as u64)
    }

    pub fn policy(&self) -> &PacingPolicy {
        &self.policy
    }

    /// Forget history; the next frame is delivered as a first frame.
    pub fn reset(&mut self) {
        self.last = None;
        self.frame_inv_us = 0;
        self.adjust_us = 0;
    }

    pub fn observe(&mut self, now: Instant, have_frame: bool, have_cached: bool) -> PacingDecision {
        let Some(last) = self.last else {
            if !have_frame {
                return PacingDecision::Skip;
            }
            self.last = Some(now);
            self.frame_inv_us = 0;
            self.adjust_us = 0;
            return PacingDecision::Deliver;
        };

        self.frame_inv_us += now.saturating_duration_since(last).as_micros() as i64;
        self.last = Some(now);
        let mut active = self.frame_inv_us - self.adjust_us;

        let slop = self.policy.slop.as_micros() as i64;
        let early = self.policy.early_margin.as_micros() as i64;
        let due = self.frame_inv_us + slop > self.expected_us
            && (active > self.duration_us || active + early > self.duration_us);
        if !due {
            return if have_frame {
                PacingDecision::Cache
            } else {
                PacingDecision::Skip
            };
        }

        let decision = if have_frame {
            PacingDecision::Deliver
        } else if have_cached {
            PacingDecision::DeliverCached
        } else {
            return PacingDecision::Skip;
        };

        if self.duration_us > 0 {
            active %= self.duration_us;
        }
        let margin = self.policy.adjust_margin.as_micros() as i64;
        self.adjust_us = if active + margin > self.duration_us {
            self.duration_us - active
        } else {
            -active
        };
        self.frame_inv_us = 0;
        decision
    }
}

/// One `WxHxR` entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LimitedRate {
    pub size: Resolution,
    pub fps: u32,
}

impl FromStr for LimitedRate {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        let (size, fps) = s
            .rsplit_once(['x', 'X'])
            .ok_or_else(|| format!("expected WxHxR, got {s:?}"))?;
        let size: Resolution = size.parse()?;
        let fps: u32 = fps
            .trim()
            .parse()
            .map_err(|_| format!("bad rate in {s:?}"))?;
        Ok(Self { size, fps })
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LimitedRateTable {
    entries: Vec<LimitedRate>,
}

impl LimitedRateTable {
    /// Parses `WxHxR[,WxHxR...]`. Malformed entries are skipped and entries
    /// past the fourth are ignored.
    pub fn parse(list: &str) -> Self {
        let mut entries = Vec::new();
        for item in list.split(',').filter(|s| !s.trim().is_empty()) {
            if entries.len() == MAX_LIMITED_RATES {
                tracing::warn!("Limited rate table full, ignoring {}", item.trim());
                break;
            }
            match item.parse::<LimitedRate>() {
                Ok(rate) => entries.push(rate),
                Err(e) => tracing::warn!("Ignoring limited rate entry: {}", e),
            }
        }
        Self { entries }
    }

    pub fn lookup(&self, size: Resolution) -> Option<u32> {
        self.entries.iter().find(|r| r.size == size).map(|r| r.fps)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl fmt::Display for LimitedRateTable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, r) in self.entries.iter().enumerate() {
            if i > 0 {
                f.write_str(",")?;
            }
            write!(f, "{}x{}", r.size, r.fps)?;
        }
        Ok(())
    }
}

/// Interruptible sleep shared between a worker and whoever stops it.
#[derive(Default)]
pub struct StopSignal {
    stopped: Mutex<bool>,
    wake: Condvar,
}

impl StopSignal {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn stop(&self) {
        let mut stopped = self.stopped.lock().unwrap_or_else(|p| p.into_inner());
        *stopped = true;
        self.wake.notify_all();
    }

    pub fn reset(&self) {
        *self.stopped.lock().unwrap_or_else(|p| p.into_inner()) = false;
    }

    pub fn is_stopped(&self) -> bool {
        *self.stopped.lock().unwrap_or_else(|p| p.into_inner())
    }

    /// Sleeps up to `timeout`. Returns `true` if stop was requested.
    pub fn wait(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut stopped = self.stopped.lock().unwrap_or_else(|p| p.into_inner());
        while !*stopped {
            let now = Instant::now();
            if now >= deadline {
                break;
            }
            stopped = match self.wake.wait_timeout(stopped, deadline - now) {
                Ok((guard, _)) => guard,
                Err(p) => p.into_inner().0,
            };
        }
        *stopped
    }
}

/// Frame rate as a cumulative moving average, refreshed every 30 frames.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct PreviewStats {
    pub frames: u64,
    pub fps: f64,
}

pub struct FpsMeter {
    checkpoint: Option<Instant>,
    windows: u64,
    stats: PreviewStats,
}

impl FpsMeter {
    const WINDOW: u64 = 30;

    pub fn new() -> Self {
        Self {
            checkpoint: None,
            windows: 0,
            stats: PreviewStats::default(),
        }
    }

    pub fn tick(&mut self, now: Instant) -> PreviewStats {
        self.stats.frames += 1;
        let checkpoint = *self.checkpoint.get_or_insert(now);
        if self.stats.frames.is_multiple_of(Self::WINDOW) {
            let elapsed = now.saturating_duration_since(checkpoint).as_secs_f64();
            if elapsed > 0.0 {
                let current = Self::WINDOW as f64 / elapsed;
                self.windows += 1;
                self.stats.fps += (current - self.stats.fps) / self.windows as f64;
            }
            self.checkpoint = Some(now);
        }
        self.stats
    }

    pub fn stats(&self) -> PreviewStats {
        self.stats
    }
}

impl Default for FpsMeter {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    fn ms(n: u64) -> Duration {
        Duration::from_millis(n)
    }

    #[test]
    fn test_first_frame_is_delivered() {
        let mut pacer = FramePacer::new(30, None, PacingPolicy::default());
        let t0 = Instant::now();
        assert_eq!(pacer.observe(t0, false, false), PacingDecision::Skip);
        assert_eq!(pacer.observe(t0, true, false), PacingDecision::Deliver);
    }

    #[test]
    fn test_limited_rate_caches_early_frames() {
        // 30 fps sensor limited to 10 fps: duration 100ms.
        let mut pacer = FramePacer::new(30, Some(10), PacingPolicy::default());
        assert_eq!(pacer.frame_duration(), ms(100));
        let t0 = Instant::now();
        assert_eq!(pacer.observe(t0, true, false), PacingDecision::Deliver);
        assert_eq!(pacer.observe(t0 + ms(33), true, false), PacingDecision::Cache);
        assert_eq!(pacer.observe(t0 + ms(66), true, true), PacingDecision::Cache);
        assert_eq!(pacer.observe(t0 + ms(99), false, true), PacingDecision::DeliverCached);
    }

    #[test]
    fn test_on_time_frames_are_delivered() {
        let mut pacer = FramePacer::new(30, None, PacingPolicy::default());
        let t0 = Instant::now();
        pacer.observe(t0, true, false);
        let mut t = t0;
        for _ in 0..10 {
            t += ms(34);
            assert_eq!(pacer.observe(t, true, false), PacingDecision::Deliver);
        }
    }

    #[test]
    fn test_reset_restarts_window() {
        let mut pacer = FramePacer::new(10, None, PacingPolicy::default());
        let t0 = Instant::now();
        pacer.observe(t0, true, false);
        assert_eq!(pacer.observe(t0 + ms(10), true, false), PacingDecision::Cache);
        pacer.reset();
        assert_eq!(pacer.observe(t0 + ms(20), true, false), PacingDecision::Deliver);
    }

    #[test]
    fn test_limited_rate_table() {
        let table = LimitedRateTable::parse("1920x1080x15, 1280x720x20,bogus,640x480x30,320x240x30,160x120x30");
        assert_eq!(table.len(), 4);
        assert_eq!(table.lookup(Resolution::new(1920, 1080)), Some(15));
        assert_eq!(table.lookup(Resolution::new(1280, 720)), Some(20));
        assert_eq!(table.lookup(Resolution::new(160, 120)), None);
        assert_eq!(table.to_string(), "1920x1080x15,1280x720x20,640x480x30,320x240x30");
    }

    #[test]
    fn test_stop_signal_wakes_sleeper() {
        let signal = Arc::new(StopSignal::new());
        let sleeper = {
            let signal = signal.clone();
            std::thread::spawn(move || {
                let start = Instant::now();
                let stopped = signal.wait(Duration::from_secs(10));
                (stopped, start.elapsed())
            })
        };
        std::thread::sleep(ms(20));
        signal.stop();
        let (stopped, elapsed) = sleeper.join().unwrap();
        assert!(stopped);
        assert!(elapsed < Duration::from_secs(5));

        signal.reset();
        assert!(!signal.wait(ms(1)));
    }

    #[test]
    fn test_fps_meter_average() {
        let mut meter = FpsMeter::new();
        let t0 = Instant::now();
        for i in 0..60u64 {
            meter.tick(t0 + ms(i * 50));
        }
        let stats = meter.stats();
        assert_eq!(stats.frames, 60);
        assert!(stats.fps > 15.0 && stats.fps < 25.0, "fps {}", stats.fps);
    }
}
