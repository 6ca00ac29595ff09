//! Regulation and waiting loops.
//!
//! Every loop here has a bound except the readiness gate, which waits as
//! long as the dewars or pumps are busy: those cycles end on their own and
//! aborting would waste the run.

use std::time::Duration;

use tracing::{debug, info, warn};

use super::{AreaSettings, Change, Session};
use crate::error::AppResult;
use crate::scope::{ApertureKind, FocusMode, Preset};

/// Largest spot size the condenser accepts.
pub const MAX_SPOT_SIZE: u32 = 12;

/// Outcome of [`Session::regulate_dose_rate`].
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DoseRegulation {
    /// Measured at the starting spot size, e/px/s
    pub measured_eps: f64,
    /// Expected at `spot`
    pub estimated_eps: f64,
    /// Spot size when regulation started
    pub initial_spot: u32,
    /// Spot size regulation settled on
    pub spot: u32,
    /// Spot size steps taken
    pub iterations: u32,
}

/// Outcome of [`Session::wait_for_drift_below`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DriftSettle {
    /// Drift was already under the criterion; nothing was waited for.
    AlreadySettled,
    /// Drift fell under the criterion while waiting.
    Settled,
    /// The server-side wait timed out.
    GaveUp,
}

/// Step the spot size up, halving the expected dose rate each step, until
/// the rate is at or under `ceiling` or the spot size is at its maximum.
///
/// Returns `(estimated_eps, spot, iterations)`.
pub fn plan_spot_size(measured_eps: f64, spot: u32, ceiling: f64) -> (f64, u32, u32) {
    let mut estimate = measured_eps;
    let mut candidate = spot;
    let mut iterations = 0;
    while estimate > ceiling && candidate < MAX_SPOT_SIZE {
        estimate /= 2.0;
        candidate += 1;
        iterations += 1;
    }
    (estimate, candidate, iterations)
}

impl Session {
    /// Keep the dose rate on the camera under the configured ceiling by
    /// raising the spot size.
    ///
    /// Measures with a short Focus exposure and restores the Focus exposure
    /// and binning afterwards. An unreachable ceiling is not an error: the
    /// spot stops at [`MAX_SPOT_SIZE`].
    pub async fn regulate_dose_rate(&self) -> AppResult<DoseRegulation> {
        let scope = self.scope();
        let old_exposure = scope.exposure(Preset::Focus).await?;
        let old_binning = scope.binning(Preset::Focus).await?;

        let measured = self.measure_and_set_spot().await;

        scope.set_exposure(Preset::Focus, old_exposure).await?;
        scope.set_binning(Preset::Focus, old_binning).await?;
        measured
    }

    async fn measure_and_set_spot(&self) -> AppResult<DoseRegulation> {
        let scope = self.scope();
        self.configure_area(&AreaSettings::new(0.1, 1).with_preset(Preset::Focus))
            .await?;
        scope.focus_shot().await?;
        let measured_eps = scope.electrons_per_pixel_per_second().await?;
        let initial_spot = scope.spot_size().await?;

        let ceiling = self.tuning.dose_ceiling_eps;
        let (estimated_eps, spot, iterations) = plan_spot_size(measured_eps, initial_spot, ceiling);

        if spot != initial_spot && spot <= MAX_SPOT_SIZE {
            info!(
                "Increasing spot size to {} to reduce dose rate below {} eps",
                spot, ceiling
            );
            scope.set_spot_size(spot).await?;
        } else if estimated_eps > ceiling {
            warn!(
                "Dose rate {:.1} eps stays above {} eps at spot size {}",
                estimated_eps, ceiling, spot
            );
        } else {
            debug!(eps = measured_eps, spot, "Dose rate within limit");
        }

        Ok(DoseRegulation {
            measured_eps,
            estimated_eps,
            initial_spot,
            spot,
            iterations,
        })
    }

    /// Current drift in Å/s, measured by a drift-only autofocus.
    pub async fn measure_drift(&self) -> AppResult<f64> {
        let scope = self.scope();
        scope.autofocus(FocusMode::DriftOnly).await?;
        let (x, y) = scope.focus_drift().await?;
        Ok(10.0 * x.hypot(y))
    }

    /// Wait until drift is under `criterion` Å/s.
    ///
    /// Uses the drift reported by the last autofocus as a pre-check and only
    /// starts the server-side wait when it exceeds the criterion.
    pub async fn wait_for_drift_below(
        &self,
        criterion: f64,
        interval: Duration,
        timeout: Duration,
    ) -> AppResult<DriftSettle> {
        let scope = self.scope();
        let (x, y) = scope.focus_drift().await?;
        let drift = 10.0 * x.hypot(y);
        if drift - criterion <= 0.01 {
            debug!(drift, criterion, "Drift already below criterion");
            return Ok(DriftSettle::AlreadySettled);
        }

        info!("Drift {:.2} A/s, waiting for {} A/s", drift, criterion);
        let reached = scope
            .drift_wait(criterion, timeout.as_secs_f64(), interval.as_secs_f64())
            .await?;
        if reached {
            Ok(DriftSettle::Settled)
        } else {
            warn!(
                "Drift did not reach {} A/s within {:?}, giving up",
                criterion, timeout
            );
            Ok(DriftSettle::GaveUp)
        }
    }

    /// Block until neither a dewar refill nor the pre-vacuum pump is running.
    ///
    /// Dewars are only consulted on instruments with autofill. Returns the
    /// number of poll intervals waited.
    pub async fn wait_until_ready_to_acquire(&self) -> AppResult<u32> {
        let scope = self.scope();
        let mut waits = 0;
        loop {
            let dewars = if self.capabilities.autofill {
                scope.dewars_filling().await?
            } else {
                false
            };
            let pump = scope.pump_running().await?;
            if !dewars && !pump {
                return Ok(waits);
            }

            info!(
                "Dewars are filling or pump running, waiting for {:?}",
                self.tuning.readiness_poll
            );
            tokio::time::sleep(self.tuning.readiness_poll).await;
            waits += 1;
        }
    }

    /// Make the named aperture `microns` wide.
    ///
    /// Without motorised apertures the operator is asked to change it and
    /// the call returns once they dismiss the message.
    pub async fn set_aperture(&self, name: &str, microns: u32) -> AppResult<Change> {
        let kind: ApertureKind = name.parse()?;
        let scope = self.scope();

        if !self.capabilities.aperture_control {
            let message = format!("Please insert the {} um {} aperture", microns, kind);
            info!("{}", message);
            scope.pause(&message).await?;
            return Ok(Change::DeferredToOperator(message));
        }

        let current = scope.aperture_size(kind).await?;
        if current == microns {
            return Ok(Change::Skipped(format!(
                "{} aperture is already {} um",
                kind, microns
            )));
        }

        info!("Changing {} aperture from {} to {} um", kind, current, microns);
        scope.set_aperture_size(kind, microns).await?;
        Ok(Change::Applied)
    }

    /// Seconds until the next dewar refill, when the instrument reports it.
    pub async fn dewar_time_remaining(&self) -> AppResult<Option<f64>> {
        if !self.capabilities.autofill {
            return Ok(None);
        }
        Ok(Some(self.scope().dewars_remaining_time().await?))
    }
}
