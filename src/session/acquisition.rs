//! Camera preset and beam configuration.

use tracing::{debug, info, warn};

use super::{AcquisitionDefaults, Change, Session};
use crate::error::AppResult;
use crate::scope::{Preset, ProbeMode, Processing, ReadoutMode, SensorArea};

/// Tolerance when comparing intensity readbacks, in microns or percent.
const INTENSITY_EPSILON: f64 = 1e-4;
/// Server illuminated-area units per micron of beam diameter.
const ILLUMINATED_AREA_PER_UM: f64 = 0.01;

/// Camera settings applied to one preset.
#[derive(Debug, Clone, PartialEq)]
pub struct AreaSettings {
    /// Seconds
    pub exposure: f64,
    /// Binning
    pub binning: u32,
    /// Sensor area
    pub area: SensorArea,
    /// Preset to change
    pub preset: Preset,
    /// `None` uses the camera's native readout
    pub readout: Option<ReadoutMode>,
    /// Save dose-fractionated frames
    pub frame_saving: bool,
}

impl AreaSettings {
    /// Full-sensor Record settings.
    pub fn new(exposure: f64, binning: u32) -> Self {
        Self {
            exposure,
            binning,
            area: SensorArea::Full,
            preset: Preset::Record,
            readout: None,
            frame_saving: false,
        }
    }

    /// Apply to `preset` instead of Record.
    pub fn with_preset(mut self, preset: Preset) -> Self {
        self.preset = preset;
        self
    }

    /// Read out `area` of the sensor.
    pub fn with_area(mut self, area: SensorArea) -> Self {
        self.area = area;
        self
    }

    /// Use `readout` instead of the native mode.
    pub fn with_readout(mut self, readout: ReadoutMode) -> Self {
        self.readout = Some(readout);
        self
    }

    /// Save frames with the exposure.
    pub fn with_frame_saving(mut self, enabled: bool) -> Self {
        self.frame_saving = enabled;
        self
    }
}

/// Illumination settings.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BeamSettings {
    /// Nominal magnification
    pub magnification: u32,
    /// Condenser spot size
    pub spot: u32,
    /// Beam diameter in microns or C2 percent, see [`Session::illumination`]
    pub intensity: f64,
    /// Nanoprobe or microprobe
    pub probe: ProbeMode,
}

impl BeamSettings {
    /// Nanoprobe beam.
    pub fn new(magnification: u32, spot: u32, intensity: f64) -> Self {
        Self {
            magnification,
            spot,
            intensity,
            probe: ProbeMode::Nano,
        }
    }

    /// Use `probe` mode.
    pub fn with_probe(mut self, probe: ProbeMode) -> Self {
        self.probe = probe;
        self
    }
}

impl From<&AcquisitionDefaults> for BeamSettings {
    fn from(defaults: &AcquisitionDefaults) -> Self {
        Self::new(defaults.magnification, defaults.spot, defaults.intensity)
    }
}

/// How beam intensity is expressed on this instrument.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Illumination {
    /// Three-condenser optics, in the server's illuminated-area units
    IlluminatedArea(f64),
    /// Two-condenser optics, percent
    PercentC2(f64),
}

impl Session {
    /// Express `intensity` in the representation the optics support.
    ///
    /// On three-condenser optics `intensity` is a beam diameter in microns.
    pub fn illumination(&self, intensity: f64) -> Illumination {
        if self.capabilities.three_condenser {
            Illumination::IlluminatedArea(intensity * ILLUMINATED_AREA_PER_UM)
        } else {
            Illumination::PercentC2(intensity)
        }
    }

    /// Apply camera settings to a preset.
    ///
    /// The readout mode is best effort: a camera that refuses it leaves the
    /// preset in whatever mode it accepted and the result is
    /// [`Change::Skipped`].
    pub async fn configure_area(&self, settings: &AreaSettings) -> AppResult<Change> {
        let scope = self.scope();
        let preset = settings.preset;

        scope.set_exposure(preset, settings.exposure).await?;
        scope.set_binning(preset, settings.binning).await?;
        scope.set_camera_area(preset, settings.area).await?;
        scope
            .set_processing(preset, Processing::GainNormalized)
            .await?;

        let mode = settings
            .readout
            .unwrap_or(self.camera.quirks.native_readout);
        let change = match scope.set_readout_mode(preset, mode).await {
            Ok(()) => Change::Applied,
            Err(e) => {
                let reason = format!("{:?} readout rejected on {}: {:#}", mode, preset, e);
                warn!("{}", reason);
                Change::Skipped(reason)
            }
        };

        if settings.frame_saving {
            scope
                .set_frame_time(preset, self.camera.quirks.min_frame_time)
                .await?;
            scope.set_frame_alignment(true).await?;
            scope.set_dose_fractionation(preset, true).await?;
        } else {
            scope.set_dose_fractionation(preset, false).await?;
        }

        debug!(
            %preset,
            exposure = settings.exposure,
            binning = settings.binning,
            "Configured camera area"
        );
        Ok(change)
    }

    /// Set up the illumination, sending only what differs from the
    /// instrument's current state.
    ///
    /// Lenses are normalised when the probe mode or spot size changed.
    pub async fn configure_beam(&self, beam: &BeamSettings, verify_dose_rate: bool) -> AppResult<()> {
        let scope = self.scope();

        let probe_changed = scope.probe_mode().await? != beam.probe;
        if probe_changed {
            scope.set_probe_mode(beam.probe).await?;
        }
        let spot_changed = scope.spot_size().await? != beam.spot;
        if spot_changed {
            scope.set_spot_size(beam.spot).await?;
        }
        let mag_changed = scope.magnification().await? != beam.magnification;
        if mag_changed {
            scope.set_magnification(beam.magnification).await?;
        }
        if probe_changed || spot_changed {
            scope.normalize_lenses().await?;
        }

        let intensity_changed = match self.illumination(beam.intensity) {
            Illumination::IlluminatedArea(area) => {
                let changed = (scope.illuminated_area().await? - area).abs()
                    > INTENSITY_EPSILON * ILLUMINATED_AREA_PER_UM;
                if changed {
                    scope.set_illuminated_area(area).await?;
                }
                changed
            }
            Illumination::PercentC2(percent) => {
                let changed = (scope.percent_c2().await? - percent).abs() > INTENSITY_EPSILON;
                if changed {
                    scope.set_percent_c2(percent).await?;
                }
                changed
            }
        };

        if probe_changed || spot_changed || mag_changed || intensity_changed {
            info!(
                mag = beam.magnification,
                spot = beam.spot,
                intensity = beam.intensity,
                probe = beam.probe.as_str(),
                "Beam configured"
            );
            self.settle().await;
        }

        if verify_dose_rate {
            self.regulate_dose_rate().await?;
        }
        Ok(())
    }

    /// Read back the current illumination, for restoring it later.
    ///
    /// Intensity comes back in the units [`BeamSettings`] uses, so passing
    /// the result to [`Session::configure_beam`] sends nothing.
    pub async fn current_beam(&self) -> AppResult<BeamSettings> {
        let scope = self.scope();
        let intensity = if self.capabilities.three_condenser {
            scope.illuminated_area().await? / ILLUMINATED_AREA_PER_UM
        } else {
            scope.percent_c2().await?
        };
        Ok(BeamSettings {
            magnification: scope.magnification().await?,
            spot: scope.spot_size().await?,
            intensity,
            probe: scope.probe_mode().await?,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scope::sim::SimConfig;
    use crate::session::test_support::session_with;

    #[tokio::test(start_paused = true)]
    async fn unchanged_beam_sends_no_settings() {
        let dir = tempfile::tempdir().unwrap();
        let (sim, session) = session_with(SimConfig::default(), dir.path()).await;
        let beam = session.current_beam().await.unwrap();
        sim.clear_calls();

        session.configure_beam(&beam, false).await.unwrap();

        assert_eq!(sim.count("set_spot_size"), 0);
        assert_eq!(sim.count("set_magnification"), 0);
        assert_eq!(sim.count("set_illuminated_area"), 0);
        assert_eq!(sim.count("normalize_lenses"), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn spot_change_normalises_lenses() {
        let dir = tempfile::tempdir().unwrap();
        let (sim, session) = session_with(SimConfig::default(), dir.path()).await;

        session
            .configure_beam(&BeamSettings::new(75000, 5, 1.1), false)
            .await
            .unwrap();

        assert_eq!(sim.current_spot(), 5);
        assert_eq!(sim.count("set_magnification"), 0);
        assert_eq!(sim.count("normalize_lenses"), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn beam_diameter_is_sent_in_server_units() {
        let dir = tempfile::tempdir().unwrap();
        let (sim, session) = session_with(SimConfig::default(), dir.path()).await;

        session
            .configure_beam(&BeamSettings::new(75000, 3, 1.1), false)
            .await
            .unwrap();
        assert!((sim.current_illuminated_area() - 0.011).abs() < 1e-12);

        let readback = session.current_beam().await.unwrap();
        assert!((readback.intensity - 1.1).abs() < 1e-9);
        sim.clear_calls();
        session.configure_beam(&readback, false).await.unwrap();
        assert_eq!(sim.count("set_illuminated_area"), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn two_condenser_optics_use_percent_c2() {
        let dir = tempfile::tempdir().unwrap();
        let (sim, session) = session_with(
            SimConfig {
                three_condenser: false,
                ..SimConfig::default()
            },
            dir.path(),
        )
        .await;

        session
            .configure_beam(&BeamSettings::new(92000, 3, 44.46), false)
            .await
            .unwrap();

        assert_eq!(sim.count("set_percent_c2"), 1);
        assert_eq!(sim.count("set_illuminated_area"), 0);
    }

    #[tokio::test]
    async fn rejected_readout_is_skipped() {
        let dir = tempfile::tempdir().unwrap();
        let (sim, session) = session_with(
            SimConfig {
                readout_modes: vec![ReadoutMode::Linear],
                ..SimConfig::default()
            },
            dir.path(),
        )
        .await;

        let change = session
            .configure_area(&AreaSettings::new(0.5, 2).with_readout(ReadoutMode::Counting))
            .await
            .unwrap();

        assert!(matches!(change, Change::Skipped(_)));
        assert_eq!(sim.preset(Preset::Record).readout, ReadoutMode::Linear);
        assert_eq!(sim.preset(Preset::Record).exposure, 0.5);
    }

    #[tokio::test]
    async fn frame_saving_enables_fractionation() {
        let dir = tempfile::tempdir().unwrap();
        let (sim, session) = session_with(SimConfig::default(), dir.path()).await;

        session
            .configure_area(&AreaSettings::new(2.0, 1).with_frame_saving(true))
            .await
            .unwrap();
        let record = sim.preset(Preset::Record);
        assert!(record.dose_fractionation);
        assert_eq!(record.frame_time, Some(0.004));
        assert!(sim.frame_alignment());

        session
            .configure_area(&AreaSettings::new(2.0, 1))
            .await
            .unwrap();
        assert!(!sim.preset(Preset::Record).dose_fractionation);
    }
}
