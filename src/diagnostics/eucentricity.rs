//! Stage eucentricity.
//!
//! Tilts the stage from 0 to +/-70 degrees in 5 degree steps and records how
//! far X, Y and defocus move away from the untilted position.

use std::time::Duration;

use async_trait::async_trait;
use tracing::info;

use crate::error::AppResult;
use crate::lifecycle::Diagnostic;
use crate::profiles::Specification;
use crate::scope::{FocusMode, Preset};
use crate::session::{AreaSettings, BeamSettings, FocusTarget, Session};

/// Images darker than this are over a grid bar.
const MIN_MEAN_COUNTS: f64 = 5.0;
const REFERENCE_DEFOCUS: f64 = -2.0;
/// Spot size of the rough eucentricity beam on three-condenser optics.
const ROUGH_EUCENTRICITY_SPOT: u32 = 7;

/// Offsets at one tilt angle, um.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TiltPoint {
    /// Stage tilt, degrees
    pub tilt: f64,
    /// Image offset along x
    pub dx: f64,
    /// Image offset along y
    pub dy: f64,
    /// Measured defocus
    pub defocus: f64,
}

/// Image movement and defocus change over a tilt series.
#[derive(Debug, Clone)]
pub struct Eucentricity {
    /// Tilt step, degrees
    pub increment: u32,
    /// Largest tilt, degrees
    pub max_tilt: u32,
    /// Offsets of the tilts that were measured
    pub points: Vec<TiltPoint>,
    /// Tilts skipped because the image was over a grid bar
    pub skipped: Vec<f64>,
}

impl Default for Eucentricity {
    fn default() -> Self {
        Self {
            increment: 5,
            max_tilt: 70,
            points: Vec::new(),
            skipped: Vec::new(),
        }
    }
}

impl Eucentricity {
    fn tilts(&self, sign: f64) -> Vec<f64> {
        (1..=self.max_tilt / self.increment.max(1))
            .map(|step| sign * f64::from(step * self.increment))
            .collect()
    }

    async fn measure_at(
        &self,
        session: &Session,
        tilt: f64,
        origin: (f64, f64),
    ) -> AppResult<Option<TiltPoint>> {
        let scope = session.scope();
        scope.tilt_to(tilt).await?;
        info!("Tilting to {} deg.", tilt);
        let (x, y, _) = scope.stage_position().await?;
        scope.autofocus(FocusMode::Measure).await?;
        let defocus = scope.last_autofocus().await?;
        if scope.mean_counts().await? < MIN_MEAN_COUNTS {
            return Ok(None);
        }
        Ok(Some(TiltPoint {
            tilt,
            dx: (x - origin.0).abs(),
            dy: (y - origin.1).abs(),
            defocus: (defocus - REFERENCE_DEFOCUS).abs(),
        }))
    }

    /// Largest X/Y and defocus offsets measured.
    pub fn max_offsets(&self) -> (f64, f64) {
        self.points.iter().fold((0.0_f64, 0.0_f64), |(xy, df), p| {
            (xy.max(p.dx).max(p.dy), df.max(p.defocus))
        })
    }
}

#[async_trait]
impl Diagnostic for Eucentricity {
    fn name(&self) -> &str {
        "Eucentricity"
    }

    async fn execute(&mut self, session: &mut Session) -> AppResult<()> {
        let defaults = *session.defaults();

        session.set_aperture("c2", 50).await?;
        let mut rough_beam = session.low_magnification_beam();
        if session.capabilities().three_condenser {
            rough_beam.spot = ROUGH_EUCENTRICITY_SPOT;
        }
        session.configure_beam(&rough_beam, false).await?;
        session
            .configure_area(
                &AreaSettings::new(defaults.exposure, defaults.binning).with_preset(Preset::Trial),
            )
            .await?;
        session.wait_until_ready_to_acquire().await?;
        session.find_eucentric_height_by_stage(false).await?;

        session
            .configure_beam(&BeamSettings::from(&defaults), true)
            .await?;
        session
            .configure_area(
                &AreaSettings::new(defaults.exposure, defaults.binning).with_preset(Preset::Focus),
            )
            .await?;
        session
            .autofocus_to(&FocusTarget::new(REFERENCE_DEFOCUS, 0.1))
            .await?;

        let scope = session.scope();
        scope.tilt_to(0.0).await?;
        let (x0, y0, z0) = scope.stage_position().await?;
        info!("Current stage position: {}, {}, {}", x0, y0, z0);

        self.points = vec![TiltPoint {
            tilt: 0.0,
            dx: 0.0,
            dy: 0.0,
            defocus: 0.0,
        }];
        self.skipped.clear();

        for sign in [-1.0, 1.0] {
            for tilt in self.tilts(sign) {
                let measured = self.measure_at(session, tilt, (x0, y0)).await?;
                match measured {
                    Some(point) => self.points.push(point),
                    None => self.skipped.push(tilt),
                }
            }
            session.scope().tilt_to(0.0).await?;
            tokio::time::sleep(Duration::from_secs(3)).await;
        }

        self.points
            .sort_by(|a, b| a.tilt.partial_cmp(&b.tilt).unwrap_or(std::cmp::Ordering::Equal));
        info!("{:>8} {:>10} {:>10} {:>14}", "Tilt", "dX (um)", "dY (um)", "dDefocus (um)");
        for p in &self.points {
            info!("{:>8.1} {:>10.3} {:>10.3} {:>14.3}", p.tilt, p.dx, p.dy, p.defocus);
        }
        if !self.skipped.is_empty() {
            info!("Skipped over grid bars: {:?}", self.skipped);
        }

        let (xy, defocus) = self.max_offsets();
        match defaults.bundle.spec {
            Some(Specification::Pair(xy_spec, defocus_spec)) => info!(
                "Max XY offset {:.2} um (spec < {} um), max defocus offset {:.2} um (spec < {} um)",
                xy, xy_spec, defocus, defocus_spec
            ),
            _ => info!(
                "Max XY offset {:.2} um, max defocus offset {:.2} um",
                xy, defocus
            ),
        }
        Ok(())
    }
}
