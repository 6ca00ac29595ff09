//! Simulated microscope.
//!
//! Keeps the state the session reads and writes (presets, beam, stage,
//! focus, apertures) and records every call in order, so tests can assert
//! on what was sent. Scripted values drive the feedback loops:
//!
//! - autofocus readings are popped from a queue; an empty queue means the
//!   autofocus lands exactly on the target defocus
//! - the dose rate halves per spot-size step above the configured spot
//! - a measure-only autofocus reports the autofocus offset plus a
//!   non-linear image of the stage Z error, so eucentric-height searches
//!   converge the way they do on a real column
//! - residual coma and astigmatism after CTF fitting scale with the image
//!   shift, as on a column with an imperfect image-shift calibration
//!
//! Capabilities the simulated instrument lacks make the corresponding
//! queries fail, exactly like a server that does not support them.

use anyhow::{anyhow, bail, Result};
use async_trait::async_trait;
use std::collections::{HashMap, VecDeque};
use std::sync::{Mutex, MutexGuard};

use super::{
    ApertureKind, EucentricityMode, FocusMode, Microscope, Preset, ProbeMode, Processing,
    ReadoutMode, SensorArea,
};

/// Gain between stage Z error and the defocus a measure-only autofocus
/// reports. Above 1 so a single damped correction never overshoots to zero.
const Z_TO_DEFOCUS_GAIN: f64 = 1.2;
/// Residual coma and astigmatism grow linearly with image shift.
const COMA_MRAD_PER_UM_SHIFT: f64 = 0.01;
const ASTIGMATISM_PER_UM_SHIFT: f64 = 0.0005;

/// Static description of the simulated instrument.
#[derive(Debug, Clone)]
pub struct SimConfig {
    /// Report an illuminated area instead of C2 percent
    pub three_condenser: bool,
    /// Dewars report autofill state
    pub autofill: bool,
    /// Apertures can be read and set
    pub aperture_control: bool,
    /// Camera names in server order
    pub cameras: Vec<String>,
    /// Readout modes the camera accepts
    pub readout_modes: Vec<ReadoutMode>,
    /// Starting magnification
    pub magnification: u32,
    /// Starting spot size
    pub spot_size: u32,
    /// Starting probe mode
    pub probe_mode: ProbeMode,
    /// Dose rate (e/px/s) measured at `spot_size`
    pub dose_rate_eps: f64,
    /// Field of view in microns at the starting magnification
    pub field_of_view_um: f64,
    /// Column valves open at start
    pub column_valves_open: bool,
    /// Starting stage tilt, degrees
    pub tilt_angle: f64,
    /// Starting image shift, um
    pub image_shift: (f64, f64),
    /// Stage Z distance from eucentric height, microns
    pub z_error: f64,
    /// Inserted aperture sizes, um
    pub aperture_sizes: HashMap<ApertureKind, u32>,
    /// Seconds until the next dewar refill
    pub dewar_remaining_s: f64,
    /// Result reported by the server-side drift wait
    pub drift_wait_reaches_target: bool,
    /// Mean counts of every image
    pub mean_counts: f64,
}

impl Default for SimConfig {
    fn default() -> Self {
        Self {
            three_condenser: true,
            autofill: true,
            aperture_control: true,
            cameras: vec!["Ceta".to_string(), "Falcon 4i".to_string()],
            readout_modes: vec![ReadoutMode::Linear, ReadoutMode::Counting],
            magnification: 75000,
            spot_size: 3,
            probe_mode: ProbeMode::Nano,
            dose_rate_eps: 100.0,
            field_of_view_um: 20.0,
            column_valves_open: true,
            tilt_angle: 0.0,
            image_shift: (0.0, 0.0),
            z_error: 0.0,
            aperture_sizes: [(ApertureKind::C2, 50), (ApertureKind::Objective, 100)]
                .into_iter()
                .collect(),
            dewar_remaining_s: 3600.0,
            drift_wait_reaches_target: true,
            mean_counts: 100.0,
        }
    }
}

/// Camera settings of one preset.
#[derive(Debug, Clone, PartialEq)]
pub struct PresetState {
    /// Seconds
    pub exposure: f64,
    /// Binning
    pub binning: u32,
    /// Sensor area
    pub area: SensorArea,
    /// Processing
    pub processing: Processing,
    /// Readout mode
    pub readout: ReadoutMode,
    /// Frame time when frames are saved
    pub frame_time: Option<f64>,
    /// Save frames
    pub dose_fractionation: bool,
}

impl Default for PresetState {
    fn default() -> Self {
        Self {
            exposure: 1.0,
            binning: 1,
            area: SensorArea::Full,
            processing: Processing::GainNormalized,
            readout: ReadoutMode::Linear,
            frame_time: None,
            dose_fractionation: false,
        }
    }
}

#[derive(Debug)]
struct SimState {
    config: SimConfig,
    calls: Vec<String>,
    /// Method name to the number of calls that still succeed
    failing: HashMap<String, u32>,
    presets: HashMap<Preset, PresetState>,
    selected_camera: Option<usize>,
    dialogs_suppressed: bool,
    user_settings: HashMap<String, f64>,
    low_dose: bool,
    frame_alignment: bool,
    magnification: u32,
    spot_size: u32,
    probe_mode: ProbeMode,
    percent_c2: f64,
    illuminated_area: f64,
    stage: (f64, f64, f64),
    tilt_angle: f64,
    image_shift: (f64, f64),
    autofocus_offset: f64,
    target_defocus: f64,
    saved_focus: Option<f64>,
    defocus: f64,
    last_autofocus: f64,
    autofocus_readings: VecDeque<f64>,
    drift_readings: VecDeque<(f64, f64)>,
    last_drift: (f64, f64),
    last_eps: f64,
    dewars_busy_polls: u32,
    pump_busy_polls: u32,
    exited: bool,
}

/// In-memory microscope implementing [`Microscope`].
#[derive(Debug)]
pub struct SimulatedScope {
    state: Mutex<SimState>,
}

impl Default for SimulatedScope {
    fn default() -> Self {
        Self::new(SimConfig::default())
    }
}

impl SimulatedScope {
    /// Simulated scope in the state `config` describes.
    pub fn new(config: SimConfig) -> Self {
        let state = SimState {
            magnification: config.magnification,
            spot_size: config.spot_size,
            probe_mode: config.probe_mode,
            tilt_angle: config.tilt_angle,
            image_shift: config.image_shift,
            stage: (0.0, 0.0, config.z_error),
            config,
            calls: Vec::new(),
            failing: HashMap::new(),
            presets: HashMap::new(),
            selected_camera: None,
            dialogs_suppressed: false,
            user_settings: HashMap::new(),
            low_dose: true,
            frame_alignment: false,
            percent_c2: 50.0,
            illuminated_area: 1.0,
            autofocus_offset: 0.0,
            target_defocus: 0.0,
            saved_focus: None,
            defocus: 0.0,
            last_autofocus: 0.0,
            autofocus_readings: VecDeque::new(),
            drift_readings: VecDeque::new(),
            last_drift: (0.0, 0.0),
            last_eps: 0.0,
            dewars_busy_polls: 0,
            pump_busy_polls: 0,
            exited: false,
        };
        Self {
            state: Mutex::new(state),
        }
    }

    fn state(&self) -> MutexGuard<'_, SimState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Record a call and fail it if it was marked as failing.
    fn enter(&self, name: &str, detail: String) -> Result<MutexGuard<'_, SimState>> {
        let mut state = self.state();
        if detail.is_empty() {
            state.calls.push(name.to_string());
        } else {
            state.calls.push(format!("{}({})", name, detail));
        }
        if let Some(successes) = state.failing.get_mut(name) {
            if *successes == 0 {
                bail!("{} failed (simulated)", name);
            }
            *successes -= 1;
        }
        Ok(state)
    }

    // --- scripting -------------------------------------------------------

    /// Make every later call of `method` fail.
    pub fn fail(&self, method: &str) {
        self.fail_after(method, 0);
    }

    /// Let `successes` more calls of `method` through, then fail every later one.
    pub fn fail_after(&self, method: &str, successes: u32) {
        self.state().failing.insert(method.to_string(), successes);
    }

    /// Defocus readings returned by successive autofocus calls, um.
    pub fn push_autofocus_readings(&self, readings: &[f64]) {
        self.state().autofocus_readings.extend(readings.iter().copied());
    }

    /// Drift (x, y) in nm/s reported by successive drift-only autofocus calls.
    pub fn push_drift_readings(&self, readings: &[(f64, f64)]) {
        self.state().drift_readings.extend(readings.iter().copied());
    }

    /// Drift returned by `focus_drift`.
    pub fn set_last_drift(&self, drift: (f64, f64)) {
        self.state().last_drift = drift;
    }

    /// Dose rate measured at the configured spot size from now on.
    pub fn set_dose_rate(&self, eps: f64) {
        self.state().config.dose_rate_eps = eps;
    }

    /// Dewars report filling for the next `polls` queries.
    pub fn dewars_busy_for(&self, polls: u32) {
        self.state().dewars_busy_polls = polls;
    }

    /// The pump reports running for the next `polls` queries.
    pub fn pump_busy_for(&self, polls: u32) {
        self.state().pump_busy_polls = polls;
    }

    // --- inspection ------------------------------------------------------

    /// Every recorded call, oldest first.
    pub fn calls(&self) -> Vec<String> {
        self.state().calls.clone()
    }

    /// Number of recorded calls of `method`.
    pub fn count(&self, method: &str) -> usize {
        self.state()
            .calls
            .iter()
            .filter(|c| c.as_str() == method || c.starts_with(&format!("{}(", method)))
            .count()
    }

    /// Forget recorded calls.
    pub fn clear_calls(&self) {
        self.state().calls.clear();
    }

    /// Camera settings of `preset`.
    pub fn preset(&self, preset: Preset) -> PresetState {
        self.state().presets.get(&preset).cloned().unwrap_or_default()
    }

    /// 1-based number of the selected camera.
    pub fn selected_camera(&self) -> Option<usize> {
        self.state().selected_camera
    }

    /// Whether frame alignment is on.
    pub fn frame_alignment(&self) -> bool {
        self.state().frame_alignment
    }

    /// Whether low dose mode is on.
    pub fn low_dose(&self) -> bool {
        self.state().low_dose
    }

    /// Whether the column valves are open.
    pub fn valves_open(&self) -> bool {
        self.state().config.column_valves_open
    }

    /// Whether server error dialogs are suppressed.
    pub fn dialogs_suppressed(&self) -> bool {
        self.state().dialogs_suppressed
    }

    /// Last value written to a user setting.
    pub fn user_setting(&self, name: &str) -> Option<f64> {
        self.state().user_settings.get(name).copied()
    }

    /// Current spot size.
    pub fn current_spot(&self) -> u32 {
        self.state().spot_size
    }

    /// Current magnification.
    pub fn current_magnification(&self) -> u32 {
        self.state().magnification
    }

    /// Current illuminated area, server units.
    pub fn current_illuminated_area(&self) -> f64 {
        self.state().illuminated_area
    }

    /// Current autofocus offset, um.
    pub fn current_autofocus_offset(&self) -> f64 {
        self.state().autofocus_offset
    }

    /// Stage Z distance from eucentric height, um.
    pub fn z_error(&self) -> f64 {
        self.state().stage.2
    }

    /// Inserted size of an aperture, um.
    pub fn aperture(&self, kind: ApertureKind) -> Option<u32> {
        self.state().config.aperture_sizes.get(&kind).copied()
    }

    /// Whether the scripting session was ended.
    pub fn exited(&self) -> bool {
        self.state().exited
    }
}

#[async_trait]
impl Microscope for SimulatedScope {
    async fn suppress_error_dialogs(&self, suppress: bool) -> Result<()> {
        let mut s = self.enter("suppress_error_dialogs", suppress.to_string())?;
        s.dialogs_suppressed = suppress;
        Ok(())
    }

    async fn set_user_setting(&self, name: &str, value: f64) -> Result<()> {
        let mut s = self.enter("set_user_setting", format!("{}={}", name, value))?;
        s.user_settings.insert(name.to_string(), value);
        Ok(())
    }

    async fn pause(&self, message: &str) -> Result<()> {
        let _state = self.enter("pause", message.to_string())?;
        Ok(())
    }

    async fn exit(&self) -> Result<()> {
        let mut s = self.enter("exit", String::new())?;
        s.exited = true;
        Ok(())
    }

    async fn camera_names(&self) -> Result<Vec<String>> {
        let s = self.enter("camera_names", String::new())?;
        Ok(s.config.cameras.clone())
    }

    async fn select_camera(&self, number: usize) -> Result<()> {
        let mut s = self.enter("select_camera", number.to_string())?;
        if number == 0 || number > s.config.cameras.len() {
            bail!("No camera number {}", number);
        }
        s.selected_camera = Some(number);
        Ok(())
    }

    async fn field_of_view(&self) -> Result<f64> {
        let s = self.enter("field_of_view", String::new())?;
        // Field of view scales inversely with magnification.
        Ok(s.config.field_of_view_um * f64::from(s.config.magnification)
            / f64::from(s.magnification.max(1)))
    }

    async fn column_valves_open(&self) -> Result<bool> {
        let s = self.enter("column_valves_open", String::new())?;
        Ok(s.config.column_valves_open)
    }

    async fn set_column_valves(&self, open: bool) -> Result<()> {
        let mut s = self.enter("set_column_valves", open.to_string())?;
        s.config.column_valves_open = open;
        Ok(())
    }

    async fn dewars_filling(&self) -> Result<bool> {
        let mut s = self.enter("dewars_filling", String::new())?;
        if !s.config.autofill {
            bail!("AreDewarsFilling is not supported on this microscope");
        }
        if s.dewars_busy_polls > 0 {
            s.dewars_busy_polls -= 1;
            return Ok(true);
        }
        Ok(false)
    }

    async fn dewars_remaining_time(&self) -> Result<f64> {
        let s = self.enter("dewars_remaining_time", String::new())?;
        if !s.config.autofill {
            bail!("DewarsRemainingTime is not supported on this microscope");
        }
        Ok(s.config.dewar_remaining_s)
    }

    async fn pump_running(&self) -> Result<bool> {
        let mut s = self.enter("pump_running", String::new())?;
        if s.pump_busy_polls > 0 {
            s.pump_busy_polls -= 1;
            return Ok(true);
        }
        Ok(false)
    }

    async fn set_low_dose(&self, enabled: bool) -> Result<()> {
        let mut s = self.enter("set_low_dose", enabled.to_string())?;
        s.low_dose = enabled;
        Ok(())
    }

    async fn exposure(&self, preset: Preset) -> Result<f64> {
        let s = self.enter("exposure", preset.to_string())?;
        Ok(s.presets.get(&preset).cloned().unwrap_or_default().exposure)
    }

    async fn set_exposure(&self, preset: Preset, seconds: f64) -> Result<()> {
        let mut s = self.enter("set_exposure", format!("{}, {}", preset, seconds))?;
        s.presets.entry(preset).or_default().exposure = seconds;
        Ok(())
    }

    async fn binning(&self, preset: Preset) -> Result<u32> {
        let s = self.enter("binning", preset.to_string())?;
        Ok(s.presets.get(&preset).cloned().unwrap_or_default().binning)
    }

    async fn set_binning(&self, preset: Preset, binning: u32) -> Result<()> {
        let mut s = self.enter("set_binning", format!("{}, {}", preset, binning))?;
        s.presets.entry(preset).or_default().binning = binning;
        Ok(())
    }

    async fn set_camera_area(&self, preset: Preset, area: SensorArea) -> Result<()> {
        let mut s = self.enter("set_camera_area", format!("{}, {:?}", preset, area))?;
        s.presets.entry(preset).or_default().area = area;
        Ok(())
    }

    async fn set_processing(&self, preset: Preset, processing: Processing) -> Result<()> {
        let mut s = self.enter("set_processing", format!("{}, {:?}", preset, processing))?;
        s.presets.entry(preset).or_default().processing = processing;
        Ok(())
    }

    async fn set_readout_mode(&self, preset: Preset, mode: ReadoutMode) -> Result<()> {
        let mut s = self.enter("set_readout_mode", format!("{}, {:?}", preset, mode))?;
        if !s.config.readout_modes.contains(&mode) {
            bail!("{:?} readout is not supported by this camera", mode);
        }
        s.presets.entry(preset).or_default().readout = mode;
        Ok(())
    }

    async fn set_frame_time(&self, preset: Preset, seconds: f64) -> Result<()> {
        let mut s = self.enter("set_frame_time", format!("{}, {}", preset, seconds))?;
        s.presets.entry(preset).or_default().frame_time = Some(seconds);
        Ok(())
    }

    async fn set_frame_alignment(&self, enabled: bool) -> Result<()> {
        let mut s = self.enter("set_frame_alignment", enabled.to_string())?;
        s.frame_alignment = enabled;
        Ok(())
    }

    async fn set_dose_fractionation(&self, preset: Preset, enabled: bool) -> Result<()> {
        let mut s = self.enter("set_dose_fractionation", format!("{}, {}", preset, enabled))?;
        s.presets.entry(preset).or_default().dose_fractionation = enabled;
        Ok(())
    }

    async fn probe_mode(&self) -> Result<ProbeMode> {
        let s = self.enter("probe_mode", String::new())?;
        Ok(s.probe_mode)
    }

    async fn set_probe_mode(&self, mode: ProbeMode) -> Result<()> {
        let mut s = self.enter("set_probe_mode", mode.as_str().to_string())?;
        s.probe_mode = mode;
        Ok(())
    }

    async fn magnification(&self) -> Result<u32> {
        let s = self.enter("magnification", String::new())?;
        Ok(s.magnification)
    }

    async fn set_magnification(&self, mag: u32) -> Result<()> {
        let mut s = self.enter("set_magnification", mag.to_string())?;
        s.magnification = mag;
        Ok(())
    }

    async fn spot_size(&self) -> Result<u32> {
        let s = self.enter("spot_size", String::new())?;
        Ok(s.spot_size)
    }

    async fn set_spot_size(&self, spot: u32) -> Result<()> {
        let mut s = self.enter("set_spot_size", spot.to_string())?;
        if !(1..=12).contains(&spot) {
            bail!("Spot size {} out of range", spot);
        }
        s.spot_size = spot;
        Ok(())
    }

    async fn percent_c2(&self) -> Result<f64> {
        let s = self.enter("percent_c2", String::new())?;
        Ok(s.percent_c2)
    }

    async fn set_percent_c2(&self, percent: f64) -> Result<()> {
        let mut s = self.enter("set_percent_c2", percent.to_string())?;
        s.percent_c2 = percent;
        Ok(())
    }

    async fn illuminated_area(&self) -> Result<f64> {
        let s = self.enter("illuminated_area", String::new())?;
        if !s.config.three_condenser {
            bail!("ReportIlluminatedArea requires three-condenser optics");
        }
        Ok(s.illuminated_area)
    }

    async fn set_illuminated_area(&self, area: f64) -> Result<()> {
        let mut s = self.enter("set_illuminated_area", area.to_string())?;
        if !s.config.three_condenser {
            bail!("SetIlluminatedArea requires three-condenser optics");
        }
        s.illuminated_area = area;
        Ok(())
    }

    async fn normalize_lenses(&self) -> Result<()> {
        let _state = self.enter("normalize_lenses", String::new())?;
        Ok(())
    }

    async fn focus_shot(&self) -> Result<()> {
        let mut s = self.enter("focus_shot", String::new())?;
        let steps = f64::from(s.spot_size) - f64::from(s.config.spot_size);
        s.last_eps = s.config.dose_rate_eps * 0.5_f64.powf(steps);
        Ok(())
    }

    async fn electrons_per_pixel_per_second(&self) -> Result<f64> {
        let s = self.enter("electrons_per_pixel_per_second", String::new())?;
        Ok(s.last_eps)
    }

    async fn mean_counts(&self) -> Result<f64> {
        let s = self.enter("mean_counts", String::new())?;
        Ok(s.config.mean_counts)
    }

    async fn autofocus(&self, mode: FocusMode) -> Result<()> {
        let mut s = self.enter("autofocus", format!("{:?}", mode))?;
        match mode {
            FocusMode::Apply => {
                let reading = s
                    .autofocus_readings
                    .pop_front()
                    .unwrap_or(s.target_defocus);
                s.last_autofocus = reading;
                s.defocus = reading;
            }
            FocusMode::Measure => {
                let reading = match s.autofocus_readings.pop_front() {
                    Some(reading) => reading,
                    None => s.autofocus_offset + s.stage.2 * Z_TO_DEFOCUS_GAIN,
                };
                s.last_autofocus = reading;
            }
            FocusMode::DriftOnly => {
                if let Some(drift) = s.drift_readings.pop_front() {
                    s.last_drift = drift;
                }
            }
        }
        Ok(())
    }

    async fn last_autofocus(&self) -> Result<f64> {
        let s = self.enter("last_autofocus", String::new())?;
        Ok(s.last_autofocus)
    }

    async fn focus_drift(&self) -> Result<(f64, f64)> {
        let s = self.enter("focus_drift", String::new())?;
        Ok(s.last_drift)
    }

    async fn autofocus_offset(&self) -> Result<f64> {
        let s = self.enter("autofocus_offset", String::new())?;
        Ok(s.autofocus_offset)
    }

    async fn set_autofocus_offset(&self, microns: f64) -> Result<()> {
        let mut s = self.enter("set_autofocus_offset", microns.to_string())?;
        s.autofocus_offset = microns;
        Ok(())
    }

    async fn set_target_defocus(&self, microns: f64) -> Result<()> {
        let mut s = self.enter("set_target_defocus", microns.to_string())?;
        s.target_defocus = microns;
        Ok(())
    }

    async fn save_focus(&self) -> Result<()> {
        let mut s = self.enter("save_focus", String::new())?;
        s.saved_focus = Some(s.defocus);
        Ok(())
    }

    async fn restore_focus(&self) -> Result<()> {
        let mut s = self.enter("restore_focus", String::new())?;
        let saved = s
            .saved_focus
            .take()
            .ok_or_else(|| anyhow!("No saved focus to restore"))?;
        s.defocus = saved;
        Ok(())
    }

    async fn set_eucentric_focus(&self) -> Result<()> {
        let mut s = self.enter("set_eucentric_focus", String::new())?;
        s.defocus = 0.0;
        Ok(())
    }

    async fn fix_astigmatism_by_ctf(&self) -> Result<()> {
        let _state = self.enter("fix_astigmatism_by_ctf", String::new())?;
        Ok(())
    }

    async fn fix_coma_by_ctf(&self) -> Result<()> {
        let _state = self.enter("fix_coma_by_ctf", String::new())?;
        Ok(())
    }

    async fn stigmator_needed(&self) -> Result<(f64, f64)> {
        let s = self.enter("stigmator_needed", String::new())?;
        let (x, y) = s.image_shift;
        Ok((x * ASTIGMATISM_PER_UM_SHIFT, y * ASTIGMATISM_PER_UM_SHIFT))
    }

    async fn coma_tilt_needed(&self) -> Result<(f64, f64)> {
        let s = self.enter("coma_tilt_needed", String::new())?;
        let (x, y) = s.image_shift;
        Ok((x * COMA_MRAD_PER_UM_SHIFT, y * COMA_MRAD_PER_UM_SHIFT))
    }

    async fn drift_wait(&self, criterion: f64, timeout_s: f64, interval_s: f64) -> Result<bool> {
        let mut s = self.enter(
            "drift_wait",
            format!("{}, {}, {}", criterion, timeout_s, interval_s),
        )?;
        let reached = s.config.drift_wait_reaches_target;
        if reached {
            let scale = criterion / 20.0;
            s.last_drift = (scale, 0.0);
        }
        Ok(reached)
    }

    async fn stage_position(&self) -> Result<(f64, f64, f64)> {
        let s = self.enter("stage_position", String::new())?;
        Ok(s.stage)
    }

    async fn move_stage(&self, dx: f64, dy: f64, dz: f64) -> Result<()> {
        let mut s = self.enter("move_stage", format!("{}, {}, {}", dx, dy, dz))?;
        s.stage.0 += dx;
        s.stage.1 += dy;
        s.stage.2 += dz;
        Ok(())
    }

    async fn tilt_angle(&self) -> Result<f64> {
        let s = self.enter("tilt_angle", String::new())?;
        Ok(s.tilt_angle)
    }

    async fn tilt_to(&self, degrees: f64) -> Result<()> {
        let mut s = self.enter("tilt_to", degrees.to_string())?;
        s.tilt_angle = degrees;
        Ok(())
    }

    async fn image_shift(&self) -> Result<(f64, f64)> {
        let s = self.enter("image_shift", String::new())?;
        Ok(s.image_shift)
    }

    async fn set_image_shift(&self, x: f64, y: f64) -> Result<()> {
        let mut s = self.enter("set_image_shift", format!("{}, {}", x, y))?;
        s.image_shift = (x, y);
        Ok(())
    }

    async fn eucentricity(&self, mode: EucentricityMode) -> Result<()> {
        let mut s = self.enter("eucentricity", format!("{:?}", mode))?;
        let residual: f64 = match mode {
            EucentricityMode::Rough => 0.5,
            EucentricityMode::RoughAndFine => 0.1,
        };
        s.stage.2 = s.stage.2.signum() * residual.min(s.stage.2.abs());
        Ok(())
    }

    async fn aperture_size(&self, kind: ApertureKind) -> Result<u32> {
        let s = self.enter("aperture_size", kind.to_string())?;
        if !s.config.aperture_control {
            bail!("ReportApertureSize is not supported on this microscope");
        }
        s.config
            .aperture_sizes
            .get(&kind)
            .copied()
            .ok_or_else(|| anyhow!("No {} aperture fitted", kind))
    }

    async fn set_aperture_size(&self, kind: ApertureKind, microns: u32) -> Result<()> {
        let mut s = self.enter("set_aperture_size", format!("{}, {}", kind, microns))?;
        if !s.config.aperture_control {
            bail!("SetApertureSize is not supported on this microscope");
        }
        s.config.aperture_sizes.insert(kind, microns);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn missing_capabilities_fail_their_queries() {
        let sim = SimulatedScope::new(SimConfig {
            three_condenser: false,
            autofill: false,
            aperture_control: false,
            ..SimConfig::default()
        });
        assert!(sim.illuminated_area().await.is_err());
        assert!(sim.dewars_filling().await.is_err());
        assert!(sim.aperture_size(ApertureKind::C2).await.is_err());
        assert!(sim.pump_running().await.is_ok());
    }

    #[tokio::test]
    async fn dose_rate_halves_per_spot_step() {
        let sim = SimulatedScope::new(SimConfig {
            spot_size: 3,
            dose_rate_eps: 400.0,
            ..SimConfig::default()
        });
        sim.focus_shot().await.unwrap();
        assert_eq!(sim.electrons_per_pixel_per_second().await.unwrap(), 400.0);

        sim.set_spot_size(5).await.unwrap();
        sim.focus_shot().await.unwrap();
        assert_eq!(sim.electrons_per_pixel_per_second().await.unwrap(), 100.0);
    }

    #[tokio::test]
    async fn failing_method_is_recorded_and_rejected() {
        let sim = SimulatedScope::default();
        sim.fail("fix_coma_by_ctf");
        assert!(sim.fix_coma_by_ctf().await.is_err());
        assert_eq!(sim.count("fix_coma_by_ctf"), 1);
    }

    #[tokio::test]
    async fn empty_autofocus_queue_lands_on_target() {
        let sim = SimulatedScope::default();
        sim.set_target_defocus(-1.5).await.unwrap();
        sim.push_autofocus_readings(&[-0.9]);

        sim.autofocus(FocusMode::Apply).await.unwrap();
        assert_eq!(sim.last_autofocus().await.unwrap(), -0.9);
        sim.autofocus(FocusMode::Apply).await.unwrap();
        assert_eq!(sim.last_autofocus().await.unwrap(), -1.5);
    }

    #[tokio::test]
    async fn eucentricity_leaves_mode_dependent_residual() {
        let sim = SimulatedScope::new(SimConfig {
            z_error: -4.0,
            ..SimConfig::default()
        });
        sim.eucentricity(EucentricityMode::Rough).await.unwrap();
        assert_eq!(sim.z_error(), -0.5);
        sim.eucentricity(EucentricityMode::RoughAndFine).await.unwrap();
        assert_eq!(sim.z_error(), -0.1);
        sim.eucentricity(EucentricityMode::Rough).await.unwrap();
        assert_eq!(sim.z_error(), -0.1);
    }

    #[tokio::test]
    async fn scripted_dose_rate_applies_to_next_shot() {
        let sim = SimulatedScope::default();
        sim.set_dose_rate(250.0);
        sim.focus_shot().await.unwrap();
        assert_eq!(sim.electrons_per_pixel_per_second().await.unwrap(), 250.0);
        assert_eq!(
            sim.calls(),
            vec!["focus_shot".to_string(), "electrons_per_pixel_per_second".to_string()]
        );
    }
}
