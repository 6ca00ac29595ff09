//! Autofocus to a target defocus and eucentric height searches.

use std::sync::Arc;
use std::time::Duration;

use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use super::{BeamSettings, Session};
use crate::error::{AppResult, EmError};
use crate::scope::{EucentricityMode, FocusMode, Microscope, Preset, ProbeMode};

/// Defocus of the first astigmatism pass, um.
const COARSE_CORRECTION_DEFOCUS: f64 = -1.0;
/// Defocus of the extra astigmatism pass at high magnification, um.
const FINE_CORRECTION_DEFOCUS: f64 = -0.5;
/// The built-in eucentricity routine is unreliable below this field of view, um.
const MIN_EUCENTRIC_FOV_UM: f64 = 10.0;

const BEAM_TILT_OFFSET_UM: f64 = -30.0;
const BEAM_TILT_MAX_ITERATIONS: u32 = 2;
/// Autofocus overestimates Z error at large offsets.
const BEAM_TILT_DAMPING: f64 = 0.72;
const BEAM_TILT_RESIDUAL: f64 = 0.3;

/// One reading of a convergence loop.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct FocusSample {
    /// Reading
    pub value: f64,
    /// Time since the loop started
    pub elapsed: Duration,
}

/// Request for [`Session::autofocus_to`].
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct FocusTarget {
    /// Target defocus, um
    pub defocus: f64,
    /// Accepted distance from the target, um
    pub precision: f64,
    /// Correct astigmatism once in focus
    pub astigmatism: bool,
    /// Also correct coma
    pub coma: bool,
    /// Reduce precision for the high magnification presets
    pub high_magnification: bool,
}

impl FocusTarget {
    /// Focus target without aberration corrections.
    pub fn new(defocus: f64, precision: f64) -> Self {
        Self {
            defocus,
            precision,
            astigmatism: false,
            coma: false,
            high_magnification: false,
        }
    }

    /// Correct astigmatism, and coma when `coma` is set.
    pub fn with_astigmatism(mut self, coma: bool) -> Self {
        self.astigmatism = true;
        self.coma = coma;
        self
    }

    /// Use high magnification tolerances.
    pub fn at_high_magnification(mut self) -> Self {
        self.high_magnification = true;
        self
    }
}

/// Residuals seen by [`Session::find_eucentric_height_by_beam_tilt`].
#[derive(Debug, Clone, PartialEq, Default)]
pub struct EucentricTrace {
    /// Residual Z error per iteration
    pub samples: Vec<FocusSample>,
    /// True when the residual fell under tolerance
    pub converged: bool,
    /// Total Z correction applied, um
    pub z_moved: f64,
}

impl Session {
    /// Autofocus until the measured defocus is within `precision` of the
    /// target.
    ///
    /// A failed astigmatism or coma correction ends the remote session and
    /// returns [`EmError::Correction`]: nothing measured afterwards would be
    /// valid. Autofocus attempts are capped by the session tuning.
    pub async fn autofocus_to(&mut self, target: &FocusTarget) -> AppResult<f64> {
        if target.astigmatism {
            self.correct_aberrations(COARSE_CORRECTION_DEFOCUS, target.coma)
                .await?;
            if target.high_magnification && target.defocus <= FINE_CORRECTION_DEFOCUS {
                self.correct_aberrations(FINE_CORRECTION_DEFOCUS, false)
                    .await?;
            }
        }

        let scope = self.scope();
        scope.set_target_defocus(target.defocus).await?;
        scope.set_autofocus_offset(target.defocus / 2.0).await?;

        let cap = self.tuning.autofocus_max_iterations;
        let mut value = f64::NAN;
        for iteration in 1..=cap {
            scope.autofocus(FocusMode::Apply).await?;
            value = scope.last_autofocus().await?;
            debug!(iteration, defocus = value, "Autofocus");
            if (value - target.defocus).abs() <= target.precision {
                info!(
                    "Defocus {:.2} um reached after {} autofocus call(s)",
                    value, iteration
                );
                return Ok(value);
            }
        }

        Err(EmError::NotConverged {
            operation: "Autofocus",
            iterations: cap,
            last: value,
        })
    }

    async fn correct_aberrations(&mut self, defocus: f64, coma: bool) -> AppResult<()> {
        let scope: Arc<dyn Microscope> = Arc::clone(&self.scope);
        scope.set_autofocus_offset(0.0).await?;
        scope.set_target_defocus(defocus).await?;
        scope.autofocus(FocusMode::Apply).await?;

        info!("Correcting astigmatism...");
        if let Err(e) = scope.fix_astigmatism_by_ctf().await {
            return Err(self.abort_on_correction("Astigmatism", e).await);
        }
        if coma {
            info!("Correcting coma...");
            if let Err(e) = scope.fix_coma_by_ctf().await {
                return Err(self.abort_on_correction("Coma", e).await);
            }
        }
        Ok(())
    }

    async fn abort_on_correction(&mut self, kind: &'static str, e: anyhow::Error) -> EmError {
        error!("{} correction failed: {:#}", kind, e);
        self.terminate().await;
        EmError::Correction {
            kind,
            reason: format!("{:#}", e),
        }
    }

    /// Bring the specimen to eucentric height with the server's tilt-based
    /// routine, rough only or rough then fine.
    ///
    /// The autofocus offset is zeroed for the routine and restored after it,
    /// also when it fails.
    pub async fn find_eucentric_height_by_stage(&self, fine: bool) -> AppResult<()> {
        let scope = self.scope();
        let fov = scope.field_of_view().await?;
        if fov < MIN_EUCENTRIC_FOV_UM {
            warn!(
                "Field of view {:.1} um is below {} um, rough eucentricity may fail",
                fov, MIN_EUCENTRIC_FOV_UM
            );
        }

        let old_offset = scope.autofocus_offset().await?;
        scope.set_eucentric_focus().await?;
        scope.set_autofocus_offset(0.0).await?;

        let mode = if fine {
            EucentricityMode::RoughAndFine
        } else {
            EucentricityMode::Rough
        };
        info!(?mode, "Finding eucentric height by stage tilt");
        let result = scope.eucentricity(mode).await;

        scope.set_autofocus_offset(old_offset).await?;
        result?;
        Ok(())
    }

    /// Wide beam the beam-tilt eucentricity search runs with.
    pub fn low_magnification_beam(&self) -> BeamSettings {
        if self.capabilities.three_condenser {
            BeamSettings::new(6500, 3, 11.0)
        } else {
            BeamSettings::new(6700, 3, 58.329).with_probe(ProbeMode::Micro)
        }
    }

    /// Bring the specimen to eucentric height by measuring defocus at a
    /// large autofocus offset and moving Z by a damped correction.
    ///
    /// Only exposure and binning of the Focus preset are changed. They are
    /// restored on exit together with beam, focus and autofocus offset,
    /// whether or not the search succeeds.
    pub async fn find_eucentric_height_by_beam_tilt(&self) -> AppResult<EucentricTrace> {
        let scope = self.scope();
        let old_beam = self.current_beam().await?;
        let old_exposure = scope.exposure(Preset::Focus).await?;
        let old_binning = scope.binning(Preset::Focus).await?;

        let searched = self.beam_tilt_search().await;

        let restored = async {
            self.configure_beam(&old_beam, false).await?;
            scope.set_exposure(Preset::Focus, old_exposure).await?;
            scope.set_binning(Preset::Focus, old_binning).await?;
            Ok::<_, EmError>(())
        }
        .await;

        let trace = searched?;
        restored?;
        Ok(trace)
    }

    async fn beam_tilt_search(&self) -> AppResult<EucentricTrace> {
        let scope = self.scope();
        self.configure_beam(&self.low_magnification_beam(), false)
            .await?;
        scope.set_exposure(Preset::Focus, 0.5).await?;
        scope.set_binning(Preset::Focus, 2).await?;

        scope.save_focus().await?;
        let old_offset = scope.autofocus_offset().await?;

        let trace = self.beam_tilt_iterations().await;

        scope.restore_focus().await?;
        scope.set_autofocus_offset(old_offset).await?;
        trace
    }

    async fn beam_tilt_iterations(&self) -> AppResult<EucentricTrace> {
        let scope = self.scope();
        scope.set_eucentric_focus().await?;
        scope.set_autofocus_offset(BEAM_TILT_OFFSET_UM).await?;

        let start = Instant::now();
        let mut trace = EucentricTrace::default();
        for _ in 0..BEAM_TILT_MAX_ITERATIONS {
            scope.autofocus(FocusMode::Measure).await?;
            let residual = scope.last_autofocus().await? - BEAM_TILT_OFFSET_UM;
            trace.samples.push(FocusSample {
                value: residual,
                elapsed: start.elapsed(),
            });
            if residual.abs() < BEAM_TILT_RESIDUAL {
                trace.converged = true;
                break;
            }

            let dz = -BEAM_TILT_DAMPING * residual;
            scope.move_stage(0.0, 0.0, dz).await?;
            trace.z_moved += dz;
            info!("Z changed by {:.2} um", dz);
        }

        if !trace.converged {
            warn!(
                "Eucentric height not within {} after {} iterations, continuing",
                BEAM_TILT_RESIDUAL, BEAM_TILT_MAX_ITERATIONS
            );
        }
        Ok(trace)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scope::sim::SimConfig;
    use crate::scope::{ReadoutMode, SensorArea};
    use crate::session::test_support::session_with;

    #[tokio::test(start_paused = true)]
    async fn autofocus_stops_within_precision() {
        let dir = tempfile::tempdir().unwrap();
        let (sim, mut session) = session_with(SimConfig::default(), dir.path()).await;
        sim.push_autofocus_readings(&[-2.5, -2.2, -2.08, -1.98]);

        let value = session
            .autofocus_to(&FocusTarget::new(-2.0, 0.05))
            .await
            .unwrap();

        assert_eq!(value, -1.98);
        assert_eq!(sim.count("autofocus"), 4);
    }

    #[tokio::test(start_paused = true)]
    async fn autofocus_gives_up_after_cap() {
        let dir = tempfile::tempdir().unwrap();
        let (sim, mut session) = session_with(SimConfig::default(), dir.path()).await;
        sim.push_autofocus_readings(&[-2.5; 25]);

        let result = session.autofocus_to(&FocusTarget::new(-2.0, 0.05)).await;

        assert!(matches!(
            result,
            Err(EmError::NotConverged { iterations: 20, .. })
        ));
        assert_eq!(sim.count("autofocus"), 20);
    }

    #[tokio::test(start_paused = true)]
    async fn high_magnification_adds_fine_astigmatism_pass() {
        let dir = tempfile::tempdir().unwrap();
        let (sim, mut session) = session_with(SimConfig::default(), dir.path()).await;

        session
            .autofocus_to(
                &FocusTarget::new(-1.0, 0.05)
                    .with_astigmatism(true)
                    .at_high_magnification(),
            )
            .await
            .unwrap();

        assert_eq!(sim.count("fix_astigmatism_by_ctf"), 2);
        assert_eq!(sim.count("fix_coma_by_ctf"), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn failed_correction_terminates_session() {
        let dir = tempfile::tempdir().unwrap();
        let (sim, mut session) = session_with(SimConfig::default(), dir.path()).await;
        sim.fail("fix_coma_by_ctf");

        let result = session
            .autofocus_to(&FocusTarget::new(-2.0, 0.1).with_astigmatism(true))
            .await;

        assert!(matches!(result, Err(EmError::Correction { kind: "Coma", .. })));
        assert!(session.is_terminated());
        assert_eq!(sim.count("exit"), 1);
        assert_eq!(sim.count("set_target_defocus(-2)"), 0);
    }

    #[tokio::test]
    async fn stage_eucentricity_restores_offset_on_failure() {
        let dir = tempfile::tempdir().unwrap();
        let (sim, session) = session_with(SimConfig::default(), dir.path()).await;
        sim.set_autofocus_offset(-1.5).await.unwrap();
        sim.fail("eucentricity");

        assert!(session.find_eucentric_height_by_stage(true).await.is_err());
        assert_eq!(sim.current_autofocus_offset(), -1.5);
    }

    #[tokio::test]
    async fn small_field_of_view_only_warns() {
        let dir = tempfile::tempdir().unwrap();
        let (sim, session) = session_with(
            SimConfig {
                field_of_view_um: 2.0,
                z_error: 3.0,
                ..SimConfig::default()
            },
            dir.path(),
        )
        .await;

        session.find_eucentric_height_by_stage(false).await.unwrap();
        assert_eq!(sim.count("eucentricity(Rough)"), 1);
        assert!(sim.z_error() <= 0.5);
    }

    #[tokio::test(start_paused = true)]
    async fn beam_tilt_search_converges_and_restores() {
        let dir = tempfile::tempdir().unwrap();
        let (sim, session) = session_with(
            SimConfig {
                z_error: 1.0,
                ..SimConfig::default()
            },
            dir.path(),
        )
        .await;
        sim.set_exposure(Preset::Focus, 1.0).await.unwrap();
        sim.set_binning(Preset::Focus, 1).await.unwrap();
        sim.set_autofocus_offset(-2.0).await.unwrap();

        let trace = session.find_eucentric_height_by_beam_tilt().await.unwrap();

        assert!(trace.converged);
        assert_eq!(trace.samples.len(), 2);
        assert_eq!(sim.count("move_stage"), 1);
        assert!(sim.z_error().abs() < 0.2);
        assert_eq!(sim.current_magnification(), 75000);
        assert_eq!(sim.current_autofocus_offset(), -2.0);
        assert_eq!(sim.preset(Preset::Focus).exposure, 1.0);
        assert_eq!(sim.preset(Preset::Focus).binning, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn beam_tilt_search_keeps_focus_preset_layout() {
        let dir = tempfile::tempdir().unwrap();
        let (sim, session) = session_with(SimConfig::default(), dir.path()).await;
        sim.set_camera_area(Preset::Focus, SensorArea::Quarter)
            .await
            .unwrap();
        sim.set_readout_mode(Preset::Focus, ReadoutMode::Counting)
            .await
            .unwrap();
        sim.set_dose_fractionation(Preset::Focus, true).await.unwrap();

        session.find_eucentric_height_by_beam_tilt().await.unwrap();

        let focus = sim.preset(Preset::Focus);
        assert_eq!(focus.area, SensorArea::Quarter);
        assert_eq!(focus.readout, ReadoutMode::Counting);
        assert!(focus.dose_fractionation);
        assert_eq!(sim.count("set_exposure(Focus, 0.5)"), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn beam_tilt_search_restores_after_stage_failure() {
        let dir = tempfile::tempdir().unwrap();
        let (sim, session) = session_with(
            SimConfig {
                z_error: 1.0,
                ..SimConfig::default()
            },
            dir.path(),
        )
        .await;
        sim.set_exposure(Preset::Focus, 1.0).await.unwrap();
        sim.set_autofocus_offset(-2.0).await.unwrap();
        sim.fail("move_stage");

        let result = session.find_eucentric_height_by_beam_tilt().await;

        assert!(matches!(result, Err(EmError::Remote(_))));
        assert_eq!(sim.current_magnification(), 75000);
        assert_eq!(sim.current_autofocus_offset(), -2.0);
        assert_eq!(sim.preset(Preset::Focus).exposure, 1.0);
        assert_eq!(sim.count("restore_focus"), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn beam_tilt_search_stops_after_two_iterations() {
        let dir = tempfile::tempdir().unwrap();
        let (sim, session) = session_with(
            SimConfig {
                z_error: 5.0,
                ..SimConfig::default()
            },
            dir.path(),
        )
        .await;

        let trace = session.find_eucentric_height_by_beam_tilt().await.unwrap();

        assert!(!trace.converged);
        assert_eq!(trace.samples.len(), 2);
        assert_eq!(sim.count("move_stage"), 2);
    }
}
