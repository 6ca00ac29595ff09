//! The remote microscope contract.
//!
//! Everything the diagnostics do to the instrument goes through the
//! [`Microscope`] trait: one method per call the automation server exposes.
//! Two implementations exist:
//!
//! - [`SemClient`](client::SemClient) talks to a live automation server over a
//!   socket.
//! - [`SimulatedScope`](sim::SimulatedScope) keeps a simulated instrument in
//!   memory, for tests and dry runs.
//!
//! Methods take `&self`; implementations serialise access internally. Every
//! call is a blocking round-trip from the session's point of view and the
//! session never issues two at once.
//!
//! Units follow the automation server: stage and defocus in microns, drift
//! in nm/s, exposure in seconds, tilt in degrees.

pub mod client;
pub mod sim;

use std::fmt;
use std::str::FromStr;

use anyhow::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::EmError;

/// Camera parameter sets of the automation server.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Preset {
    /// Low magnification search
    View,
    /// Autofocus shots
    Focus,
    /// Tracking and tuning shots
    Trial,
    /// Data acquisition
    Record,
    /// Preview
    Preview,
}

impl Preset {
    /// Single-letter code used on the wire.
    pub fn code(&self) -> &'static str {
        match self {
            Preset::View => "V",
            Preset::Focus => "F",
            Preset::Trial => "T",
            Preset::Record => "R",
            Preset::Preview => "A",
        }
    }
}

impl fmt::Display for Preset {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}", self)
    }
}

/// Portion of the sensor read out.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum SensorArea {
    /// Whole sensor
    #[default]
    Full,
    /// Central half
    Half,
    /// Central quarter
    Quarter,
}

impl SensorArea {
    /// Single-letter code used on the wire.
    pub fn code(&self) -> &'static str {
        match self {
            SensorArea::Full => "F",
            SensorArea::Half => "H",
            SensorArea::Quarter => "Q",
        }
    }
}

/// Camera readout mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ReadoutMode {
    /// Integrating readout
    Linear,
    /// Electron counting
    Counting,
}

impl ReadoutMode {
    /// Numeric code used on the wire.
    pub fn code(&self) -> i64 {
        match self {
            ReadoutMode::Linear => 0,
            ReadoutMode::Counting => 1,
        }
    }
}

/// Image processing applied by the camera software.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Processing {
    /// Raw frames
    Unprocessed,
    /// Dark reference subtracted
    DarkSubtracted,
    /// Dark subtracted and gain normalised
    GainNormalized,
}

impl Processing {
    /// Numeric code used on the wire.
    pub fn code(&self) -> i64 {
        match self {
            Processing::Unprocessed => 0,
            Processing::DarkSubtracted => 1,
            Processing::GainNormalized => 2,
        }
    }
}

/// Condenser probe mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ProbeMode {
    /// Nanoprobe
    Nano,
    /// Microprobe
    Micro,
}

impl ProbeMode {
    /// Name the server uses for the mode.
    pub fn as_str(&self) -> &'static str {
        match self {
            ProbeMode::Nano => "nano",
            ProbeMode::Micro => "micro",
        }
    }
}

impl FromStr for ProbeMode {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "nano" | "nanoprobe" | "0" => Ok(ProbeMode::Nano),
            "micro" | "microprobe" | "1" => Ok(ProbeMode::Micro),
            other => Err(anyhow::anyhow!("Unknown probe mode '{}'", other)),
        }
    }
}

/// What an autofocus call does with the measured defocus.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FocusMode {
    /// Measure and change focus to the target
    Apply,
    /// Measure only
    Measure,
    /// Measure drift only
    DriftOnly,
}

impl FocusMode {
    /// Numeric code used on the wire.
    pub fn code(&self) -> i64 {
        match self {
            FocusMode::Apply => 0,
            FocusMode::Measure => -1,
            FocusMode::DriftOnly => -2,
        }
    }
}

/// How far the server-side eucentricity routine goes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EucentricityMode {
    /// Stage-tilt based
    Rough,
    /// Stage tilt followed by beam-tilt refinement
    RoughAndFine,
}

impl EucentricityMode {
    /// Numeric code used on the wire.
    pub fn code(&self) -> i64 {
        match self {
            EucentricityMode::Rough => 1,
            EucentricityMode::RoughAndFine => 3,
        }
    }
}

/// Motorised apertures, numbered as the automation server numbers them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ApertureKind {
    /// First condenser
    C1,
    /// Second condenser
    C2,
    /// Third condenser
    C3,
    /// Objective
    Objective,
}

impl ApertureKind {
    /// Aperture number on the wire.
    pub fn number(&self) -> i64 {
        match self {
            ApertureKind::C1 => 0,
            ApertureKind::C2 => 1,
            ApertureKind::C3 => 3,
            ApertureKind::Objective => 2,
        }
    }
}

impl fmt::Display for ApertureKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ApertureKind::C1 => f.write_str("C1"),
            ApertureKind::C2 => f.write_str("C2"),
            ApertureKind::C3 => f.write_str("C3"),
            ApertureKind::Objective => f.write_str("objective"),
        }
    }
}

impl FromStr for ApertureKind {
    type Err = EmError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "c1" => Ok(ApertureKind::C1),
            "c2" => Ok(ApertureKind::C2),
            "c3" => Ok(ApertureKind::C3),
            "obj" | "objective" => Ok(ApertureKind::Objective),
            other => Err(EmError::Configuration(format!(
                "Unknown aperture '{}'. Expected c1, c2, c3 or obj",
                other
            ))),
        }
    }
}

/// Calls exposed by the automation server.
///
/// Implementations return an error for anything the server rejects; the
/// session decides which failures are fatal.
#[async_trait]
pub trait Microscope: Send + Sync {
    // --- session ---------------------------------------------------------

    /// Route server errors to its log instead of modal dialogs (`true`), or
    /// restore normal error reporting (`false`).
    async fn suppress_error_dialogs(&self, suppress: bool) -> Result<()>;
    /// Change a server-side user setting by name.
    async fn set_user_setting(&self, name: &str, value: f64) -> Result<()>;
    /// Show a blocking message on the microscope PC until the operator
    /// dismisses it.
    async fn pause(&self, message: &str) -> Result<()>;
    /// End the scripting session and release the server.
    async fn exit(&self) -> Result<()>;

    // --- cameras ---------------------------------------------------------

    /// Names of the configured cameras, in server order.
    async fn camera_names(&self) -> Result<Vec<String>>;
    /// Select a camera by its 1-based number.
    async fn select_camera(&self, number: usize) -> Result<()>;
    /// Field of view of the current camera and magnification, in microns.
    async fn field_of_view(&self) -> Result<f64>;

    // --- vacuum and cryogens ---------------------------------------------

    /// True when the column valves are open.
    async fn column_valves_open(&self) -> Result<bool>;
    /// Open or close the column valves.
    async fn set_column_valves(&self, open: bool) -> Result<()>;
    /// True while an autofill cycle is running.
    async fn dewars_filling(&self) -> Result<bool>;
    /// Seconds until the next autofill cycle.
    async fn dewars_remaining_time(&self) -> Result<f64>;
    /// True while the turbo pump runs.
    async fn pump_running(&self) -> Result<bool>;

    // --- presets ---------------------------------------------------------

    /// Turn low dose mode on or off.
    async fn set_low_dose(&self, enabled: bool) -> Result<()>;
    /// Exposure time of `preset`, seconds.
    async fn exposure(&self, preset: Preset) -> Result<f64>;
    /// Set the exposure time of `preset`.
    async fn set_exposure(&self, preset: Preset, seconds: f64) -> Result<()>;
    /// Binning of `preset`.
    async fn binning(&self, preset: Preset) -> Result<u32>;
    /// Set the binning of `preset`.
    async fn set_binning(&self, preset: Preset, binning: u32) -> Result<()>;
    /// Sensor area read out by `preset`.
    async fn set_camera_area(&self, preset: Preset, area: SensorArea) -> Result<()>;
    /// Processing applied to `preset` images.
    async fn set_processing(&self, preset: Preset, processing: Processing) -> Result<()>;
    /// Readout mode of `preset`.
    async fn set_readout_mode(&self, preset: Preset, mode: ReadoutMode) -> Result<()>;
    /// Frame time of `preset` when saving frames.
    async fn set_frame_time(&self, preset: Preset, seconds: f64) -> Result<()>;
    /// Align frames on the camera PC.
    async fn set_frame_alignment(&self, enabled: bool) -> Result<()>;
    /// Save dose-fractionated frames with `preset`.
    async fn set_dose_fractionation(&self, preset: Preset, enabled: bool) -> Result<()>;

    // --- illumination ----------------------------------------------------

    /// Current probe mode.
    async fn probe_mode(&self) -> Result<ProbeMode>;
    /// Switch probe mode.
    async fn set_probe_mode(&self, mode: ProbeMode) -> Result<()>;
    /// Nominal magnification.
    async fn magnification(&self) -> Result<u32>;
    /// Set the nominal magnification.
    async fn set_magnification(&self, mag: u32) -> Result<()>;
    /// Condenser spot size.
    async fn spot_size(&self) -> Result<u32>;
    /// Set the condenser spot size.
    async fn set_spot_size(&self, spot: u32) -> Result<()>;
    /// C2 strength in percent (two-condenser optics).
    async fn percent_c2(&self) -> Result<f64>;
    /// Set C2 strength in percent.
    async fn set_percent_c2(&self, percent: f64) -> Result<()>;
    /// Illuminated area in server units, 0.01 per micron of beam diameter
    /// (three-condenser optics only).
    async fn illuminated_area(&self) -> Result<f64>;
    /// Set the illuminated area, server units.
    async fn set_illuminated_area(&self, area: f64) -> Result<()>;
    /// Normalise all lenses.
    async fn normalize_lenses(&self) -> Result<()>;

    // --- acquisition -----------------------------------------------------

    /// Acquire with the Focus preset.
    async fn focus_shot(&self) -> Result<()>;
    /// Electrons per unbinned pixel per second of the last image.
    async fn electrons_per_pixel_per_second(&self) -> Result<f64>;
    /// Mean counts of the last image.
    async fn mean_counts(&self) -> Result<f64>;

    // --- focus -----------------------------------------------------------

    /// Run an autofocus.
    async fn autofocus(&self, mode: FocusMode) -> Result<()>;
    /// Defocus in microns measured by the last autofocus.
    async fn last_autofocus(&self) -> Result<f64>;
    /// (x, y) drift measured by the last autofocus, in nm/s.
    async fn focus_drift(&self) -> Result<(f64, f64)>;
    /// Defocus offset applied during autofocus, um.
    async fn autofocus_offset(&self) -> Result<f64>;
    /// Set the autofocus defocus offset.
    async fn set_autofocus_offset(&self, microns: f64) -> Result<()>;
    /// Set the defocus autofocus drives to, um.
    async fn set_target_defocus(&self, microns: f64) -> Result<()>;
    /// Remember the current focus.
    async fn save_focus(&self) -> Result<()>;
    /// Return to the focus saved last.
    async fn restore_focus(&self) -> Result<()>;
    /// Reset defocus to the eucentric focus.
    async fn set_eucentric_focus(&self) -> Result<()>;
    /// Correct astigmatism from a CTF fit.
    async fn fix_astigmatism_by_ctf(&self) -> Result<()>;
    /// Correct coma from a CTF fit.
    async fn fix_coma_by_ctf(&self) -> Result<()>;
    /// Objective stigmator change (x, y) the last CTF fit still asks for.
    async fn stigmator_needed(&self) -> Result<(f64, f64)>;
    /// Beam tilt (x, y) in mrad the last coma fit still asks for.
    async fn coma_tilt_needed(&self) -> Result<(f64, f64)>;
    /// Wait on the server side until drift is below `criterion` Å/s.
    /// Returns whether the criterion was reached before `timeout_s`.
    async fn drift_wait(&self, criterion: f64, timeout_s: f64, interval_s: f64) -> Result<bool>;

    // --- stage -----------------------------------------------------------

    /// Stage (x, y, z) in um.
    async fn stage_position(&self) -> Result<(f64, f64, f64)>;
    /// Move the stage relative to its position, um.
    async fn move_stage(&self, dx: f64, dy: f64, dz: f64) -> Result<()>;
    /// Stage tilt, degrees.
    async fn tilt_angle(&self) -> Result<f64>;
    /// Tilt the stage to an absolute angle.
    async fn tilt_to(&self, degrees: f64) -> Result<()>;
    /// Image shift (x, y), um.
    async fn image_shift(&self) -> Result<(f64, f64)>;
    /// Set the image shift, um.
    async fn set_image_shift(&self, x: f64, y: f64) -> Result<()>;
    /// Run the server-side eucentricity routine.
    async fn eucentricity(&self, mode: EucentricityMode) -> Result<()>;

    // --- apertures -------------------------------------------------------

    /// Size of an aperture, um; errors when the aperture is not motorised.
    async fn aperture_size(&self, kind: ApertureKind) -> Result<u32>;
    /// Insert the aperture of the given size.
    async fn set_aperture_size(&self, kind: ApertureKind, microns: u32) -> Result<()>;
}
