//! Device controls with last-value debouncing and the focus state machine.
//!
//! Focus has two layers. The requested [`FocusMode`] comes from the host;
//! the [`FocusSubState`] records what was last written to the focus control
//! for continuous operation. Writes happen only on sub-state transitions:
//!
//! | requested mode                    | sub-state before   | write / after    |
//! |-----------------------------------|--------------------|------------------|
//! | Auto, ContinuousPicture/Video     | not ContinuousVideo| ContinuousVideo  |
//! | Infinity                          | not Infinity       | Infinity         |
//! | Fixed, Macro, EDOF, Released      | not Released       | Released         |
//!
//! Nothing happens while an autofocus sweep owns the control (sub-state
//! `Auto`). `cancel_auto_focus` leaves `Auto` for ContinuousVideo, or
//! Infinity when that is the requested mode.

use crate::device::{CaptureDevice, ControlInfo, ControlKind};
use crate::error::{CameraError, Result};
use crate::pacing::StopSignal;
use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

/// V4L2 control ids.
pub mod cid {
    pub const EXPOSURE: u32 = 0x0098_0911;
    pub const HFLIP: u32 = 0x0098_0914;
    pub const POWER_LINE_FREQUENCY: u32 = 0x0098_0918;
    pub const COLORFX: u32 = 0x0098_091f;
    pub const ROTATE: u32 = 0x0098_0922;
    pub const FOCUS_AUTO: u32 = 0x009a_090c;
    pub const ZOOM_ABSOLUTE: u32 = 0x009a_090d;
    pub const AUTO_N_PRESET_WHITE_BALANCE: u32 = 0x009a_0914;
    pub const AUTO_FOCUS_START: u32 = 0x009a_091c;
    pub const AUTO_FOCUS_STOP: u32 = 0x009a_091d;
    pub const AUTO_FOCUS_STATUS: u32 = 0x009a_091e;
    pub const FLASH_LED_MODE: u32 = 0x009c_0901;
}

/// `V4L2_AUTO_FOCUS_STATUS_*` bits.
pub mod focus_status {
    pub const BUSY: i64 = 1;
    pub const REACHED: i64 = 2;
    pub const FAILED: i64 = 4;
}

/// Preview frames to let pass after a continuous-focus write before the
/// status register is read again.
pub const FOCUS_PROCESS_FRAMES: i32 = 1;

const AUTO_FOCUS_POLLS: u32 = 70;
const AUTO_FOCUS_POLL_INTERVAL: Duration = Duration::from_millis(30);

/// Default zoom ratio table, in hundredths.
pub const DEFAULT_ZOOM_RATIOS: [i64; 9] = [100, 120, 140, 160, 200, 220, 260, 280, 300];

/// Exposure range assumed when the device has no exposure control.
pub const DEFAULT_EXPOSURE: ExposureRange = ExposureRange {
    minimum: 0,
    maximum: 8,
    default: 4,
};

const WHITE_BALANCE: &[(&str, i64)] = &[
    ("auto", 1),
    ("incandescent", 2),
    ("fluorescent", 3),
    ("warm-fluorescent", 4),
    ("twilight", 5),
    ("daylight", 6),
    ("cloudy-daylight", 8),
    ("shade", 9),
];

const EFFECTS: &[(&str, i64)] = &[("none", 0), ("mono", 1), ("sepia", 2), ("negative", 3)];

const BANDING: &[(&str, i64)] = &[("off", 0), ("50hz", 1), ("60hz", 2), ("auto", 3)];

fn lookup(table: &[(&str, i64)], key: &str) -> Option<i64> {
    table
        .iter()
        .find(|(name, _)| name.eq_ignore_ascii_case(key.trim()))
        .map(|(_, v)| *v)
}

pub fn white_balance_values() -> impl Iterator<Item = &'static str> {
    WHITE_BALANCE.iter().map(|(n, _)| *n)
}

pub fn effect_values() -> impl Iterator<Item = &'static str> {
    EFFECTS.iter().map(|(n, _)| *n)
}

pub fn banding_values() -> impl Iterator<Item = &'static str> {
    BANDING.iter().map(|(n, _)| *n)
}

/// Optional controls the device exposes.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub struct CapabilitySet(u32);

impl CapabilitySet {
    pub const ZOOM: CapabilitySet = CapabilitySet(1);
    pub const ROTATE: CapabilitySet = CapabilitySet(1 << 1);
    pub const EXPOSURE: CapabilitySet = CapabilitySet(1 << 2);
    pub const WHITE_BALANCE: CapabilitySet = CapabilitySet(1 << 3);
    pub const FLASH: CapabilitySet = CapabilitySet(1 << 4);
    pub const FOCUS: CapabilitySet = CapabilitySet(1 << 5);
    pub const FOCUS_MOVE: CapabilitySet = CapabilitySet(1 << 6);
    pub const HFLIP: CapabilitySet = CapabilitySet(1 << 7);
    pub const EFFECT: CapabilitySet = CapabilitySet(1 << 8);
    pub const BANDING: CapabilitySet = CapabilitySet(1 << 9);

    pub const fn empty() -> Self {
        CapabilitySet(0)
    }

    pub const fn contains(self, other: CapabilitySet) -> bool {
        self.0 & other.0 == other.0
    }

    pub fn insert(&mut self, other: CapabilitySet) {
        self.0 |= other.0;
    }

    pub const fn bits(self) -> u32 {
        self.0
    }

    fn for_control(id: u32) -> Option<CapabilitySet> {
        Some(match id {
            cid::ZOOM_ABSOLUTE => Self::ZOOM,
            cid::ROTATE => Self::ROTATE,
            cid::EXPOSURE => Self::EXPOSURE,
            cid::AUTO_N_PRESET_WHITE_BALANCE => Self::WHITE_BALANCE,
            cid::FLASH_LED_MODE => Self::FLASH,
            cid::FOCUS_AUTO => Self::FOCUS,
            cid::AUTO_FOCUS_STATUS => Self::FOCUS_MOVE,
            cid::HFLIP => Self::HFLIP,
            cid::COLORFX => Self::EFFECT,
            cid::POWER_LINE_FREQUENCY => Self::BANDING,
            _ => return None,
        })
    }

    /// Builds the set from `VIDIOC_QUERYCTRL` results. Disabled controls do
    /// not count, and menu-driven features need a menu.
    pub fn from_controls(controls: &[ControlInfo]) -> Self {
        let mut caps = Self::empty();
        for info in controls.iter().filter(|c| !c.disabled) {
            let Some(bit) = Self::for_control(info.id) else {
                continue;
            };
            let needs_menu = bit == Self::WHITE_BALANCE || bit == Self::FLASH;
            if needs_menu && info.kind != ControlKind::Menu {
                continue;
            }
            caps.insert(bit);
        }
        caps
    }
}

impl fmt::Display for CapabilitySet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#06x}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExposureRange {
    pub minimum: i64,
    pub maximum: i64,
    pub default: i64,
}

impl ExposureRange {
    /// Compensation steps either side of the midpoint.
    pub fn half_span(&self) -> i64 {
        (self.maximum - self.minimum) / 2
    }

    /// Device value for a compensation level.
    pub fn device_value(&self, level: i64) -> i64 {
        (level + self.minimum + self.half_span()).clamp(self.minimum, self.maximum)
    }

    pub fn default_level(&self) -> i64 {
        self.default - self.minimum - self.half_span()
    }
}

/// Values of the focus control.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FocusMode {
    Release = 0,
    Fixed = 1,
    Infinity = 2,
    Auto = 3,
    Macro = 4,
    Edof = 5,
    ContinuousVideo = 6,
    ContinuousPicture = 7,
}

impl FocusMode {
    pub fn raw(self) -> i64 {
        self as i64
    }

    /// Unknown names fall back to `Fixed`.
    pub fn from_param(name: &str) -> Self {
        match name.trim().to_ascii_lowercase().as_str() {
            "auto" => FocusMode::Auto,
            "infinity" => FocusMode::Infinity,
            "macro" => FocusMode::Macro,
            "edof" => FocusMode::Edof,
            "continuous-video" => FocusMode::ContinuousVideo,
            "continuous-picture" => FocusMode::ContinuousPicture,
            _ => FocusMode::Fixed,
        }
    }

    pub fn as_param(self) -> &'static str {
        match self {
            FocusMode::Release | FocusMode::Fixed => "fixed",
            FocusMode::Infinity => "infinity",
            FocusMode::Auto => "auto",
            FocusMode::Macro => "macro",
            FocusMode::Edof => "edof",
            FocusMode::ContinuousVideo => "continuous-video",
            FocusMode::ContinuousPicture => "continuous-picture",
        }
    }

    fn tracks_continuously(self) -> bool {
        matches!(
            self,
            FocusMode::Auto | FocusMode::ContinuousPicture | FocusMode::ContinuousVideo
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FocusSubState {
    Released,
    ContinuousVideo,
    Infinity,
    Auto,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlashMode {
    Off,
    On,
    Torch,
}

impl FlashMode {
    pub fn from_param(name: &str) -> Option<Self> {
        match name.trim().to_ascii_lowercase().as_str() {
            "off" => Some(FlashMode::Off),
            "on" | "auto" => Some(FlashMode::On),
            "torch" => Some(FlashMode::Torch),
            _ => None,
        }
    }

    pub fn as_param(self) -> &'static str {
        match self {
            FlashMode::Off => "off",
            FlashMode::On => "on",
            FlashMode::Torch => "torch",
        }
    }
}

/// `V4L2_FLASH_LED_MODE_*`.
const LED_NONE: i64 = 0;
const LED_FLASH: i64 = 1;
const LED_TORCH: i64 = 2;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FocusMove {
    Started,
    Stopped,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControlOutcome {
    Applied,
    /// Same as the last applied value; nothing written.
    Unchanged,
    /// The device lacks the control; nothing written.
    Unsupported,
    /// Out of range; the clamped value was applied.
    Clamped { requested: i64, applied: i64 },
}

/// Snapshot of the regulated controls.
#[derive(Debug, Clone, PartialEq)]
pub struct ControlState {
    pub zoom: u32,
    pub exposure: i64,
    pub white_balance: String,
    pub effect: String,
    pub banding: String,
    pub flash: FlashMode,
    pub focus_mode: FocusMode,
    pub focus_sub_state: FocusSubState,
    pub rotation: u32,
    pub mirror: bool,
    pub capabilities: CapabilitySet,
}

struct RegulatorState {
    snapshot: ControlState,
    applied: HashMap<u32, i64>,
    focus_wait: i32,
    focus_moving: bool,
}

pub struct ControlRegulator {
    device: Arc<dyn CaptureDevice>,
    controls: HashMap<u32, ControlInfo>,
    zoom_ratios: Vec<i64>,
    state: Mutex<RegulatorState>,
}

impl ControlRegulator {
    /// Queries the device controls once and builds the capability set.
    pub fn probe(device: Arc<dyn CaptureDevice>) -> Self {
        let controls = match device.query_controls() {
            Ok(controls) => controls,
            Err(e) => {
                tracing::warn!(device = device.name(), error = %e, "Control query failed");
                Vec::new()
            }
        };
        Self::new(device, controls, DEFAULT_ZOOM_RATIOS.to_vec())
    }

    pub fn new(device: Arc<dyn CaptureDevice>, controls: Vec<ControlInfo>, zoom_ratios: Vec<i64>) -> Self {
        let capabilities = CapabilitySet::from_controls(&controls);
        let controls: HashMap<u32, ControlInfo> = controls
            .into_iter()
            .filter(|c| !c.disabled)
            .map(|c| (c.id, c))
            .collect();
        tracing::info!(
            device = device.name(),
            capabilities = %capabilities,
            controls = controls.len(),
            "Controls probed"
        );

        let snapshot = ControlState {
            zoom: 0,
            exposure: 0,
            white_balance: "auto".to_string(),
            effect: "none".to_string(),
            banding: "auto".to_string(),
            flash: FlashMode::Off,
            focus_mode: FocusMode::Fixed,
            focus_sub_state: FocusSubState::Released,
            rotation: 0,
            mirror: false,
            capabilities,
        };
        Self {
            device,
            controls,
            zoom_ratios: if zoom_ratios.is_empty() {
                vec![100]
            } else {
                zoom_ratios
            },
            state: Mutex::new(RegulatorState {
                snapshot,
                applied: HashMap::new(),
                focus_wait: 0,
                focus_moving: false,
            }),
        }
    }

    fn state(&self) -> MutexGuard<'_, RegulatorState> {
        self.state.lock().unwrap_or_else(|p| p.into_inner())
    }

    pub fn snapshot(&self) -> ControlState {
        self.state().snapshot.clone()
    }

    pub fn capabilities(&self) -> CapabilitySet {
        self.state().snapshot.capabilities
    }

    pub fn info(&self, id: u32) -> Option<&ControlInfo> {
        self.controls.get(&id)
    }

    pub fn exposure_range(&self) -> ExposureRange {
        self.controls
            .get(&cid::EXPOSURE)
            .map(|c| ExposureRange {
                minimum: c.minimum,
                maximum: c.maximum,
                default: c.default,
            })
            .unwrap_or(DEFAULT_EXPOSURE)
    }

    pub fn zoom_ratios(&self) -> &[i64] {
        &self.zoom_ratios
    }

    pub fn max_zoom(&self) -> u32 {
        self.zoom_ratios.len().saturating_sub(1) as u32
    }

    /// The focus control accepts the continuous modes.
    pub fn continuous_focus_supported(&self) -> bool {
        self.controls
            .get(&cid::FOCUS_AUTO)
            .is_some_and(|c| c.maximum >= FocusMode::ContinuousPicture.raw())
    }

    /// Probed, enabled and counted in the capability set.
    pub fn supports(&self, id: u32) -> bool {
        self.controls.contains_key(&id)
            && CapabilitySet::for_control(id).is_none_or(|bit| self.capabilities().contains(bit))
    }

    /// Writes `value` unless it equals the last value written.
    pub fn apply(&self, id: u32, value: i64) -> Result<ControlOutcome> {
        if !self.supports(id) {
            return Ok(ControlOutcome::Unsupported);
        }
        if self.state().applied.get(&id) == Some(&value) {
            return Ok(ControlOutcome::Unchanged);
        }
        self.write(id, value)?;
        Ok(ControlOutcome::Applied)
    }

    /// Writes without debouncing, for trigger-style controls.
    fn write(&self, id: u32, value: i64) -> Result<()> {
        if !self.supports(id) {
            return Err(CameraError::ControlUnsupported(id));
        }
        self.device
            .set_control(id, value)
            .map_err(|e| CameraError::from_io("VIDIOC_S_CTRL", e))?;
        self.state().applied.insert(id, value);
        tracing::debug!(control = format_args!("{id:#010x}"), value, "Control written");
        Ok(())
    }

    pub fn read(&self, id: u32) -> Result<i64> {
        if !self.supports(id) {
            return Err(CameraError::ControlUnsupported(id));
        }
        self.device
            .control(id)
            .map_err(|e| CameraError::from_io("VIDIOC_G_CTRL", e))
    }

    /// Clamps `level` to the ratio table and writes the matching ratio.
    pub fn set_zoom(&self, level: i64) -> Result<ControlOutcome> {
        let max = self.max_zoom() as i64;
        let clamped = level.clamp(0, max);
        if clamped != level {
            tracing::debug!(level, max, "Zoom out of range");
        }
        let outcome = self.apply(cid::ZOOM_ABSOLUTE, self.zoom_ratios[clamped as usize])?;
        if outcome == ControlOutcome::Unsupported {
            return Ok(outcome);
        }
        self.state().snapshot.zoom = clamped as u32;
        if clamped != level {
            return Ok(ControlOutcome::Clamped {
                requested: level,
                applied: clamped,
            });
        }
        Ok(outcome)
    }

    pub fn set_exposure(&self, level: i64) -> Result<ControlOutcome> {
        let value = self.exposure_range().device_value(level);
        let outcome = self.apply(cid::EXPOSURE, value)?;
        if outcome != ControlOutcome::Unsupported {
            self.state().snapshot.exposure = level;
        }
        Ok(outcome)
    }

    fn set_menu(
        &self,
        id: u32,
        table: &[(&str, i64)],
        key: &'static str,
        name: &str,
    ) -> Result<(ControlOutcome, String)> {
        let value = lookup(table, name)
            .ok_or_else(|| CameraError::invalid_parameter(key, format!("unknown value {name:?}")))?;
        let offered = self.controls.get(&id).is_none_or(|info| {
            info.menu.is_empty() || info.menu.iter().any(|e| e.index as i64 == value)
        });
        if !offered {
            return Ok((ControlOutcome::Unsupported, name.to_string()));
        }
        Ok((self.apply(id, value)?, name.trim().to_ascii_lowercase()))
    }

    pub fn set_white_balance(&self, name: &str) -> Result<ControlOutcome> {
        let (outcome, value) =
            self.set_menu(cid::AUTO_N_PRESET_WHITE_BALANCE, WHITE_BALANCE, "whitebalance", name)?;
        if outcome != ControlOutcome::Unsupported {
            self.state().snapshot.white_balance = value;
        }
        Ok(outcome)
    }

    pub fn set_effect(&self, name: &str) -> Result<ControlOutcome> {
        let (outcome, value) = self.set_menu(cid::COLORFX, EFFECTS, "effect", name)?;
        if outcome != ControlOutcome::Unsupported {
            self.state().snapshot.effect = value;
        }
        Ok(outcome)
    }

    pub fn set_banding(&self, name: &str) -> Result<ControlOutcome> {
        let (outcome, value) = self.set_menu(cid::POWER_LINE_FREQUENCY, BANDING, "antibanding", name)?;
        if outcome != ControlOutcome::Unsupported {
            self.state().snapshot.banding = value;
        }
        Ok(outcome)
    }

    /// Torch lights immediately; `On` only arms the flash for captures.
    pub fn set_flash_mode(&self, mode: FlashMode) -> Result<ControlOutcome> {
        if !self.capabilities().contains(CapabilitySet::FLASH) {
            return Ok(ControlOutcome::Unsupported);
        }
        let previous = self.state().snapshot.flash;
        let outcome = match mode {
            FlashMode::Torch => self.apply(cid::FLASH_LED_MODE, LED_TORCH)?,
            FlashMode::On if previous == FlashMode::Torch => self.apply(cid::FLASH_LED_MODE, LED_NONE)?,
            FlashMode::On => ControlOutcome::Unchanged,
            FlashMode::Off => self.apply(cid::FLASH_LED_MODE, LED_NONE)?,
        };
        self.state().snapshot.flash = mode;
        Ok(outcome)
    }

    /// Fires or douses the flash when the mode is `On`.
    pub fn fire_flash(&self, on: bool) {
        if self.state().snapshot.flash != FlashMode::On {
            return;
        }
        let value = if on { LED_FLASH } else { LED_NONE };
        if let Err(e) = self.apply(cid::FLASH_LED_MODE, value) {
            tracing::warn!(on, error = %e, "Flash control failed");
        }
    }

    /// The rotate control is written by the capture sequence only.
    pub fn set_rotation(&self, degrees: u32) -> Result<ControlOutcome> {
        let outcome = self.apply(cid::ROTATE, (degrees % 360) as i64)?;
        if outcome != ControlOutcome::Unsupported {
            self.state().snapshot.rotation = degrees % 360;
        }
        Ok(outcome)
    }

    pub fn set_mirror(&self, on: bool) -> Result<ControlOutcome> {
        let outcome = self.apply(cid::HFLIP, on as i64)?;
        if outcome != ControlOutcome::Unsupported {
            self.state().snapshot.mirror = on;
        }
        Ok(outcome)
    }

    /// Records the requested focus mode and moves the continuous sub-state.
    pub fn set_focus_mode(&self, mode: FocusMode) -> Result<()> {
        let sub_state = {
            let mut state = self.state();
            state.snapshot.focus_mode = mode;
            state.snapshot.focus_sub_state
        };
        if !self.continuous_focus_supported() || sub_state == FocusSubState::Auto {
            return Ok(());
        }

        let (target, raw) = if mode.tracks_continuously() {
            (FocusSubState::ContinuousVideo, FocusMode::ContinuousVideo)
        } else if mode == FocusMode::Infinity {
            (FocusSubState::Infinity, FocusMode::Infinity)
        } else {
            (FocusSubState::Released, FocusMode::Release)
        };
        if target == sub_state {
            return Ok(());
        }
        self.write(cid::FOCUS_AUTO, raw.raw())?;
        let mut state = self.state();
        state.snapshot.focus_sub_state = target;
        if target == FocusSubState::ContinuousVideo {
            state.focus_wait = FOCUS_PROCESS_FRAMES;
            state.focus_moving = true;
        }
        Ok(())
    }

    /// Resumes continuous focus when preview starts.
    pub fn on_preview_start(&self) {
        let state = self.snapshot();
        if !self.continuous_focus_supported()
            || !state.focus_mode.tracks_continuously()
            || matches!(
                state.focus_sub_state,
                FocusSubState::Auto | FocusSubState::Infinity
            )
        {
            return;
        }
        match self.write(cid::FOCUS_AUTO, FocusMode::ContinuousVideo.raw()) {
            Ok(()) => self.state().snapshot.focus_sub_state = FocusSubState::ContinuousVideo,
            Err(e) => tracing::warn!(error = %e, "Could not resume continuous focus"),
        }
    }

    /// Releases the lens when preview stops.
    pub fn on_preview_stop(&self) {
        let state = self.snapshot();
        if !self.continuous_focus_supported()
            || state.focus_sub_state != FocusSubState::ContinuousVideo
        {
            return;
        }
        match self.write(cid::FOCUS_AUTO, FocusMode::Release.raw()) {
            Ok(()) => self.state().snapshot.focus_sub_state = FocusSubState::Released,
            Err(e) => tracing::warn!(error = %e, "Could not release focus"),
        }
    }

    /// Runs one autofocus sweep. Returns whether focus was reached.
    pub fn run_auto_focus(&self, cancel: &StopSignal) -> bool {
        let caps = self.capabilities();
        if !caps.contains(CapabilitySet::FOCUS) {
            return true;
        }
        self.fire_flash(true);
        self.state().snapshot.focus_sub_state = FocusSubState::Auto;

        let reached = match self.write(cid::FOCUS_AUTO, FocusMode::Auto.raw()) {
            Err(e) => {
                tracing::warn!(error = %e, "Autofocus trigger failed");
                false
            }
            Ok(()) if !caps.contains(CapabilitySet::FOCUS_MOVE) => true,
            Ok(()) => self.wait_for_focus(cancel),
        };

        self.fire_flash(false);
        tracing::info!(reached, "Autofocus finished");
        reached
    }

    fn wait_for_focus(&self, cancel: &StopSignal) -> bool {
        for _ in 0..AUTO_FOCUS_POLLS {
            match self.read(cid::AUTO_FOCUS_STATUS) {
                Ok(status) if status & focus_status::REACHED != 0 => return true,
                Ok(status) if status & focus_status::FAILED != 0 => return false,
                Ok(_) => {}
                Err(e) => {
                    tracing::warn!(error = %e, "Focus status read failed");
                    return false;
                }
            }
            if cancel.wait(AUTO_FOCUS_POLL_INTERVAL) {
                return false;
            }
        }
        false
    }

    pub fn cancel_auto_focus(&self) -> Result<()> {
        if !self.capabilities().contains(CapabilitySet::FOCUS) {
            return Ok(());
        }
        if !self.continuous_focus_supported() {
            return self.write(cid::FOCUS_AUTO, FocusMode::Release.raw());
        }
        let state = self.snapshot();
        if state.focus_sub_state != FocusSubState::Auto {
            return Ok(());
        }
        let (target, raw) = if state.focus_mode == FocusMode::Infinity {
            (FocusSubState::Infinity, FocusMode::Infinity)
        } else {
            (FocusSubState::ContinuousVideo, FocusMode::ContinuousVideo)
        };
        self.write(cid::FOCUS_AUTO, raw.raw())?;
        self.state().snapshot.focus_sub_state = target;
        Ok(())
    }

    /// Called after each preview frame. Reports lens movement edges.
    pub fn poll_focus_move(&self) -> Option<FocusMove> {
        {
            let mut state = self.state();
            if !state.snapshot.capabilities.contains(CapabilitySet::FOCUS_MOVE)
                || !state.snapshot.focus_mode.tracks_continuously()
            {
                return None;
            }
            state.focus_wait -= 1;
            if state.focus_wait >= 0 {
                return None;
            }
            state.focus_wait = 0;
        }

        let status = match self.read(cid::AUTO_FOCUS_STATUS) {
            Ok(status) => status,
            Err(e) => {
                tracing::debug!(error = %e, "Focus status read failed");
                return None;
            }
        };

        let mut state = self.state();
        if status == focus_status::BUSY {
            if !state.focus_moving {
                state.focus_moving = true;
                return Some(FocusMove::Started);
            }
            None
        } else {
            state.focus_wait = FOCUS_PROCESS_FRAMES;
            if state.focus_moving {
                state.focus_moving = false;
                return Some(FocusMove::Stopped);
            }
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::VirtualDevice;

    fn regulator() -> (Arc<VirtualDevice>, ControlRegulator) {
        let device = VirtualDevice::builder().with_sensor_controls().build();
        (device.clone(), ControlRegulator::probe(device))
    }

    #[test]
    fn test_capabilities_from_controls() {
        let (_device, reg) = regulator();
        let caps = reg.capabilities();
        for bit in [
            CapabilitySet::ZOOM,
            CapabilitySet::ROTATE,
            CapabilitySet::EXPOSURE,
            CapabilitySet::WHITE_BALANCE,
            CapabilitySet::FLASH,
            CapabilitySet::FOCUS,
            CapabilitySet::FOCUS_MOVE,
            CapabilitySet::HFLIP,
            CapabilitySet::EFFECT,
            CapabilitySet::BANDING,
        ] {
            assert!(caps.contains(bit), "missing {bit}");
        }

        let bare = ControlRegulator::probe(VirtualDevice::builder().build());
        assert_eq!(bare.capabilities(), CapabilitySet::empty());
    }

    #[test]
    fn test_disabled_control_is_not_a_capability() {
        let mut zoom = ControlInfo::integer(cid::ZOOM_ABSOLUTE, "zoom", 100, 300, 100);
        zoom.disabled = true;
        let caps = CapabilitySet::from_controls(&[zoom]);
        assert!(!caps.contains(CapabilitySet::ZOOM));
    }

    #[test]
    fn test_zoom_debounced() {
        let (device, reg) = regulator();
        assert_eq!(reg.set_zoom(3).unwrap(), ControlOutcome::Applied);
        assert_eq!(reg.set_zoom(3).unwrap(), ControlOutcome::Unchanged);
        assert_eq!(device.stats().writes(cid::ZOOM_ABSOLUTE), 1);
        assert_eq!(device.control(cid::ZOOM_ABSOLUTE).unwrap(), 160);
    }

    #[test]
    fn test_zoom_clamped() {
        let (device, reg) = regulator();
        assert_eq!(
            reg.set_zoom(999).unwrap(),
            ControlOutcome::Clamped {
                requested: 999,
                applied: 8
            }
        );
        assert_eq!(reg.snapshot().zoom, 8);
        assert_eq!(device.control(cid::ZOOM_ABSOLUTE).unwrap(), 300);

        assert!(matches!(
            reg.set_zoom(-2).unwrap(),
            ControlOutcome::Clamped { applied: 0, .. }
        ));
    }

    #[test]
    fn test_unsupported_control_is_noop() {
        let reg = ControlRegulator::probe(VirtualDevice::builder().build());
        assert_eq!(reg.set_zoom(2).unwrap(), ControlOutcome::Unsupported);
        assert_eq!(reg.set_white_balance("daylight").unwrap(), ControlOutcome::Unsupported);
    }

    #[test]
    fn test_menu_features_need_a_menu() {
        let device = VirtualDevice::builder()
            .control(ControlInfo::integer(cid::AUTO_N_PRESET_WHITE_BALANCE, "wb", 0, 9, 1))
            .control(ControlInfo::integer(cid::FLASH_LED_MODE, "led", 0, 2, 0))
            .build();
        let reg = ControlRegulator::probe(device.clone());
        assert!(!reg.supports(cid::AUTO_N_PRESET_WHITE_BALANCE));
        assert_eq!(reg.apply(cid::AUTO_N_PRESET_WHITE_BALANCE, 6).unwrap(), ControlOutcome::Unsupported);
        assert_eq!(reg.apply(cid::FLASH_LED_MODE, 2).unwrap(), ControlOutcome::Unsupported);
        assert_eq!(reg.set_white_balance("daylight").unwrap(), ControlOutcome::Unsupported);
        assert_eq!(device.stats().writes(cid::AUTO_N_PRESET_WHITE_BALANCE), 0);
        assert_eq!(device.stats().writes(cid::FLASH_LED_MODE), 0);
        assert_eq!(reg.snapshot().white_balance, "auto");
    }

    #[test]
    fn test_snapshot_untouched_without_control() {
        let reg = ControlRegulator::probe(VirtualDevice::builder().build());
        assert_eq!(reg.set_zoom(999).unwrap(), ControlOutcome::Unsupported);
        assert_eq!(reg.set_exposure(3).unwrap(), ControlOutcome::Unsupported);
        assert_eq!(reg.set_mirror(true).unwrap(), ControlOutcome::Unsupported);
        let snapshot = reg.snapshot();
        assert_eq!((snapshot.zoom, snapshot.exposure, snapshot.mirror), (0, 0, false));
    }

    #[test]
    fn test_exposure_maps_to_device_range() {
        let (device, reg) = regulator();
        reg.set_exposure(-2).unwrap();
        assert_eq!(device.control(cid::EXPOSURE).unwrap(), 2);
        reg.set_exposure(9).unwrap();
        assert_eq!(device.control(cid::EXPOSURE).unwrap(), 8);
        assert_eq!(reg.exposure_range().default_level(), 0);
    }

    #[test]
    fn test_white_balance_menu() {
        let (device, reg) = regulator();
        assert_eq!(reg.set_white_balance("Daylight").unwrap(), ControlOutcome::Applied);
        assert_eq!(device.control(cid::AUTO_N_PRESET_WHITE_BALANCE).unwrap(), 6);
        // Not in this device's menu.
        assert_eq!(reg.set_white_balance("shade").unwrap(), ControlOutcome::Unsupported);
        assert_eq!(reg.snapshot().white_balance, "daylight");
        assert!(reg.set_white_balance("purple").is_err());
    }

    #[test]
    fn test_flash_modes() {
        let (device, reg) = regulator();
        reg.set_flash_mode(FlashMode::Torch).unwrap();
        assert_eq!(device.control(cid::FLASH_LED_MODE).unwrap(), LED_TORCH);
        reg.set_flash_mode(FlashMode::On).unwrap();
        assert_eq!(device.control(cid::FLASH_LED_MODE).unwrap(), LED_NONE);

        reg.fire_flash(true);
        assert_eq!(device.control(cid::FLASH_LED_MODE).unwrap(), LED_FLASH);
        reg.fire_flash(false);
        assert_eq!(device.control(cid::FLASH_LED_MODE).unwrap(), LED_NONE);

        reg.set_flash_mode(FlashMode::Off).unwrap();
        let writes = device.stats().writes(cid::FLASH_LED_MODE);
        reg.fire_flash(true);
        assert_eq!(device.stats().writes(cid::FLASH_LED_MODE), writes);
    }

    #[test]
    fn test_continuous_focus_transitions() {
        let (device, reg) = regulator();
        reg.set_focus_mode(FocusMode::ContinuousPicture).unwrap();
        assert_eq!(reg.snapshot().focus_sub_state, FocusSubState::ContinuousVideo);
        assert_eq!(device.control(cid::FOCUS_AUTO).unwrap(), 6);

        // Already tracking: no second write.
        reg.set_focus_mode(FocusMode::Auto).unwrap();
        assert_eq!(device.stats().writes(cid::FOCUS_AUTO), 1);

        reg.set_focus_mode(FocusMode::Infinity).unwrap();
        assert_eq!(reg.snapshot().focus_sub_state, FocusSubState::Infinity);
        assert_eq!(device.control(cid::FOCUS_AUTO).unwrap(), 2);

        reg.set_focus_mode(FocusMode::Macro).unwrap();
        assert_eq!(reg.snapshot().focus_sub_state, FocusSubState::Released);
        assert_eq!(device.control(cid::FOCUS_AUTO).unwrap(), 0);
    }

    #[test]
    fn test_auto_focus_then_cancel() {
        let (device, reg) = regulator();
        reg.set_focus_mode(FocusMode::ContinuousVideo).unwrap();
        device.set_focus_status(focus_status::REACHED);

        assert!(reg.run_auto_focus(&StopSignal::new()));
        assert_eq!(reg.snapshot().focus_sub_state, FocusSubState::Auto);

        // Mode changes are held off while the sweep owns the lens.
        reg.set_focus_mode(FocusMode::Macro).unwrap();
        assert_eq!(reg.snapshot().focus_sub_state, FocusSubState::Auto);

        reg.set_focus_mode(FocusMode::ContinuousVideo).unwrap();
        reg.cancel_auto_focus().unwrap();
        assert_eq!(reg.snapshot().focus_sub_state, FocusSubState::ContinuousVideo);
        assert_eq!(device.control(cid::FOCUS_AUTO).unwrap(), 6);
    }

    #[test]
    fn test_auto_focus_failure_reported() {
        let (device, reg) = regulator();
        device.set_focus_status(focus_status::FAILED);
        assert!(!reg.run_auto_focus(&StopSignal::new()));
    }

    #[test]
    fn test_auto_focus_cancelled_while_busy() {
        let (device, reg) = regulator();
        device.set_focus_status(focus_status::BUSY);
        let cancel = StopSignal::new();
        cancel.stop();
        assert!(!reg.run_auto_focus(&cancel));
    }

    #[test]
    fn test_focus_move_edges() {
        let (device, reg) = regulator();
        reg.set_focus_mode(FocusMode::ContinuousVideo).unwrap();
        device.set_focus_status(focus_status::BUSY);

        // The first poll after the mode write is skipped.
        assert_eq!(reg.poll_focus_move(), None);
        // Already marked moving by the mode write, so no start edge.
        assert_eq!(reg.poll_focus_move(), None);

        device.set_focus_status(focus_status::REACHED);
        assert_eq!(reg.poll_focus_move(), Some(FocusMove::Stopped));

        device.set_focus_status(focus_status::BUSY);
        assert_eq!(reg.poll_focus_move(), None);
        assert_eq!(reg.poll_focus_move(), Some(FocusMove::Started));
    }

    #[test]
    fn test_preview_hooks() {
        let (device, reg) = regulator();
        reg.set_focus_mode(FocusMode::ContinuousVideo).unwrap();
        reg.on_preview_stop();
        assert_eq!(reg.snapshot().focus_sub_state, FocusSubState::Released);
        assert_eq!(device.control(cid::FOCUS_AUTO).unwrap(), 0);
        reg.on_preview_start();
        assert_eq!(reg.snapshot().focus_sub_state, FocusSubState::ContinuousVideo);
    }
}
