//! AFIS calibration check.
//!
//! Image shift is applied at six positions around the optical axis. At each
//! one the server fits astigmatism and coma by CTF, and the residual
//! stigmator and beam tilt it still asks for are recorded. A well calibrated
//! aberration-free image shift leaves both close to zero everywhere.

use async_trait::async_trait;
use tracing::{error, info};

use crate::error::AppResult;
use crate::lifecycle::Diagnostic;
use crate::profiles::Specification;
use crate::scope::{FocusMode, Microscope, Preset};
use crate::session::{AreaSettings, BeamSettings, FocusTarget, Session};

const DRIFT_PROTECTION: &str = "DriftProtection";
const DEFAULT_MAX_SHIFT_UM: f64 = 12.0;
const DEFAULT_DEFOCUS_UM: f64 = -2.0;
const FOCUS_PRECISION_UM: f64 = 0.05;

/// Residuals measured at one image-shift position.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct AfisPoint {
    /// Image shift (x, y), um
    pub shift: (f64, f64),
    /// Residual beam tilt (x, y), mrad
    pub beam_tilt: (f64, f64),
    /// Residual stigmator (x, y)
    pub astigmatism: (f64, f64),
    /// False when the CTF corrections at this position failed
    pub corrected: bool,
}

/// Residual aberrations across the image-shift range used for AFIS.
#[derive(Debug, Clone, Default)]
pub struct Afis {
    /// Residuals in the order the positions were visited
    pub points: Vec<AfisPoint>,
}

impl Afis {
    fn positions(shift: f64) -> [(f64, f64); 6] {
        [
            (-shift, -shift),
            (-shift, 0.0),
            (shift, 0.0),
            (0.0, -shift),
            (0.0, shift),
            (shift, shift),
        ]
    }

    /// Largest residual beam tilt (mrad) and astigmatism over all positions.
    pub fn max_residuals(&self) -> (f64, f64) {
        self.points.iter().fold((0.0_f64, 0.0_f64), |(bt, ast), p| {
            (
                bt.max(p.beam_tilt.0.hypot(p.beam_tilt.1)),
                ast.max(p.astigmatism.0.hypot(p.astigmatism.1)),
            )
        })
    }

    async fn correct_at_position(scope: &dyn Microscope) -> anyhow::Result<()> {
        scope.autofocus(FocusMode::Measure).await?;
        scope.fix_astigmatism_by_ctf().await?;
        scope.fix_coma_by_ctf().await
    }

    async fn measure(&mut self, session: &mut Session, defocus: f64, shift: f64) -> AppResult<()> {
        session
            .autofocus_to(&FocusTarget::new(defocus, FOCUS_PRECISION_UM).with_astigmatism(true))
            .await?;

        session.scope().suppress_error_dialogs(true).await?;
        session.wait_until_ready_to_acquire().await?;

        for position in Self::positions(shift) {
            session.scope().set_image_shift(position.0, position.1).await?;
            session.settle().await;

            let scope = session.scope();
            let corrected = match Self::correct_at_position(scope).await {
                Ok(()) => true,
                Err(e) => {
                    error!("Correction at {:?} um failed: {:#}", position, e);
                    false
                }
            };
            let astigmatism = scope.stigmator_needed().await?;
            let beam_tilt = scope.coma_tilt_needed().await?;
            info!(
                "Residual beam tilt at {:?} um: {:.3}, {:.3} mrad",
                position, beam_tilt.0, beam_tilt.1
            );
            info!(
                "Residual astigmatism at {:?} um: {:.3}, {:.3}",
                position, astigmatism.0, astigmatism.1
            );
            self.points.push(AfisPoint {
                shift: position,
                beam_tilt,
                astigmatism,
                corrected,
            });
        }
        Ok(())
    }
}

#[async_trait]
impl Diagnostic for Afis {
    fn name(&self) -> &str {
        "AFIS"
    }

    async fn execute(&mut self, session: &mut Session) -> AppResult<()> {
        let defaults = *session.defaults();
        let shift = defaults.bundle.max_image_shift.unwrap_or(DEFAULT_MAX_SHIFT_UM);
        let defocus = defaults.bundle.defocus.unwrap_or(DEFAULT_DEFOCUS_UM);
        let beam = BeamSettings::from(&defaults);

        session
            .scope()
            .pause("Open EPU and set Acquisition mode = Faster in the Session Setup")
            .await?;
        session.set_aperture("c2", 50).await?;
        session.configure_beam(&beam, false).await?;
        session
            .scope()
            .pause("Please center the beam, roughly focus the image, check beam tilt pp and rotation center")
            .await?;
        session.configure_beam(&beam, true).await?;
        session
            .configure_area(&AreaSettings::new(defaults.exposure, defaults.binning))
            .await?;
        session
            .configure_area(&AreaSettings::new(1.0, 2).with_preset(Preset::Focus))
            .await?;

        let scope = session.scope();
        scope.set_image_shift(0.0, 0.0).await?;
        scope.set_user_setting(DRIFT_PROTECTION, 0.0).await?;

        self.points.clear();
        let measured = self.measure(session, defocus, shift).await;

        let scope = session.scope();
        let restored = async {
            scope.set_image_shift(0.0, 0.0).await?;
            scope.suppress_error_dialogs(false).await?;
            scope.set_user_setting(DRIFT_PROTECTION, 1.0).await
        }
        .await;
        measured?;
        restored?;

        let (beam_tilt, astigmatism) = self.max_residuals();
        match defaults.bundle.spec {
            Some(Specification::Pair(coma_spec, astig_spec)) => info!(
                "Max residual beam tilt {:.3} mrad, astigmatism {:.3} at +/-{} um \
                 (spec: coma < {} nm, astigmatism < {} nm)",
                beam_tilt, astigmatism, shift, coma_spec, astig_spec
            ),
            _ => info!(
                "Max residual beam tilt {:.3} mrad, astigmatism {:.3} at +/-{} um",
                beam_tilt, astigmatism, shift
            ),
        }
        Ok(())
    }
}
