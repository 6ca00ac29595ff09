//! Stage drift.
//!
//! From a starting position the stage moves 1 um in each direction and
//! drift is sampled until it falls below the criterion; then the same after
//! tilting to +/-45 degrees. Reports the average time to settle per
//! direction.

use std::time::Duration;

use async_trait::async_trait;
use tokio::time::Instant;
use tracing::info;

use crate::error::{AppResult, EmError};
use crate::lifecycle::Diagnostic;
use crate::scope::Preset;
use crate::session::{AreaSettings, BeamSettings, FocusSample, FocusTarget, Session};

/// Refuse to start this close to a dewar refill, seconds.
const MIN_DEWAR_TIME_S: f64 = 600.0;

/// A stage move whose drift is followed.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Movement {
    /// Relative move in um
    Shift {
        /// Along x, um
        dx: f64,
        /// Along y, um
        dy: f64,
    },
    /// Tilt to an absolute angle
    Tilt {
        /// Target angle
        degrees: f64,
    },
}

/// Drift samples of one direction, one trace per repeat.
#[derive(Debug, Clone, PartialEq)]
pub struct DirectionResult {
    /// Direction name, e.g. `+X`
    pub label: &'static str,
    /// Drift readings of each repeat
    pub trials: Vec<Vec<FocusSample>>,
    /// Mean time to settle over the trials that settled
    pub average_settle: Option<Duration>,
}

/// Drift settling time after stage shifts and tilts.
#[derive(Debug, Clone)]
pub struct StageDrift {
    /// Drift to settle to, A/s
    pub criterion: f64,
    /// Give up on a trial after this long
    pub max_time: Duration,
    /// Stage shift, um
    pub shift: f64,
    /// Stage tilt, degrees
    pub tilt: f64,
    /// Repeats per shift direction
    pub repeats: usize,
    /// Time between drift readings
    pub sample_interval: Duration,
    /// One entry per direction, in the order measured
    pub results: Vec<DirectionResult>,
}

impl Default for StageDrift {
    fn default() -> Self {
        Self {
            criterion: 1.0,
            max_time: Duration::from_secs(180),
            shift: 1.0,
            tilt: 45.0,
            repeats: 3,
            sample_interval: Duration::from_secs(2),
            results: Vec::new(),
        }
    }
}

impl StageDrift {
    fn movements(&self) -> [(&'static str, Movement); 6] {
        let s = self.shift;
        [
            ("+X", Movement::Shift { dx: s, dy: 0.0 }),
            ("-X", Movement::Shift { dx: -s, dy: 0.0 }),
            ("+Y", Movement::Shift { dx: 0.0, dy: s }),
            ("-Y", Movement::Shift { dx: 0.0, dy: -s }),
            ("-A", Movement::Tilt { degrees: -self.tilt }),
            ("+A", Movement::Tilt { degrees: self.tilt }),
        ]
    }

    /// Sample drift until it is under the criterion or time runs out.
    async fn time_to_settle(&self, session: &Session) -> AppResult<Vec<FocusSample>> {
        let start = Instant::now();
        let mut samples = Vec::new();
        loop {
            let drift = session.measure_drift().await?;
            let elapsed = start.elapsed();
            samples.push(FocusSample {
                value: drift,
                elapsed,
            });

            if drift <= self.criterion {
                info!(
                    "--> Drift reached {} A/s after {:.2}s",
                    self.criterion,
                    elapsed.as_secs_f64()
                );
                break;
            }
            info!(
                "--> Elapsed time {:.2}s: drift {:.2} A/s",
                elapsed.as_secs_f64(),
                drift
            );
            if elapsed > self.max_time {
                info!("--> Reached {:?} limit. Giving up.", self.max_time);
                break;
            }
            tokio::time::sleep(self.sample_interval).await;
        }
        Ok(samples)
    }

    fn average_settle(&self, trials: &[Vec<FocusSample>]) -> Option<Duration> {
        let settled: Vec<Duration> = trials
            .iter()
            .filter_map(|trial| trial.last())
            .filter(|last| last.value <= self.criterion)
            .map(|last| last.elapsed)
            .collect();
        if settled.is_empty() {
            return None;
        }
        Some(settled.iter().sum::<Duration>() / settled.len() as u32)
    }
}

#[async_trait]
impl Diagnostic for StageDrift {
    fn name(&self) -> &str {
        "Stage drift"
    }

    async fn execute(&mut self, session: &mut Session) -> AppResult<()> {
        if let Some(remaining) = session.dewar_time_remaining().await? {
            if remaining < MIN_DEWAR_TIME_S {
                return Err(EmError::Aborted(
                    "<10 min left before the next LN autofill cycle".to_string(),
                ));
            }
        }

        session.set_aperture("c2", 50).await?;
        let defaults = *session.defaults();
        let beam = BeamSettings::from(&defaults);
        session.configure_beam(&beam, false).await?;
        session
            .scope()
            .pause("Please center the beam, roughly focus the image, check beam tilt pp and rotation center")
            .await?;
        session.configure_beam(&beam, true).await?;
        session
            .configure_area(
                &AreaSettings::new(defaults.exposure, defaults.binning).with_preset(Preset::Focus),
            )
            .await?;

        session.autofocus_to(&FocusTarget::new(-2.0, 0.1)).await?;
        session.wait_until_ready_to_acquire().await?;

        let position = session.scope().stage_position().await?;
        info!("Current position is: {:?}", position);

        self.results.clear();
        for (label, movement) in self.movements() {
            let mut trials = Vec::new();
            match movement {
                Movement::Shift { dx, dy } => {
                    info!("Moving {} um in {} direction", self.shift, label);
                    for repeat in 1..=self.repeats {
                        info!("Measure #{}", repeat);
                        session.scope().move_stage(dx, dy, 0.0).await?;
                        trials.push(self.time_to_settle(session).await?);
                    }
                }
                Movement::Tilt { degrees } => {
                    info!("Tilting in {} direction", label);
                    session.scope().tilt_to(degrees).await?;
                    trials.push(self.time_to_settle(session).await?);
                    session.scope().tilt_to(0.0).await?;
                }
            }
            let average_settle = self.average_settle(&trials);
            self.results.push(DirectionResult {
                label,
                trials,
                average_settle,
            });
        }

        info!("Average of {} trials:", self.repeats);
        for result in &self.results {
            match result.average_settle {
                Some(avg) => info!(
                    "{} drift reached {} A/s in {:.2}s",
                    result.label,
                    self.criterion,
                    avg.as_secs_f64()
                ),
                None => info!("{}: target {} A/s never reached", result.label, self.criterion),
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lifecycle::{run, Outcome};
    use crate::scope::sim::SimConfig;
    use crate::scope::Microscope;
    use crate::session::test_support::session_with;

    #[tokio::test(start_paused = true)]
    async fn settles_in_every_direction() {
        let dir = tempfile::tempdir().unwrap();
        let (sim, mut session) = session_with(SimConfig::default(), dir.path()).await;
        // first +X trial drifts for two samples, everything else is settled
        sim.push_drift_readings(&[(0.5, 0.0), (0.2, 0.0), (0.05, 0.0)]);
        let mut test = StageDrift::default();

        let outcome = run(&mut session, &mut test).await;

        assert_eq!(outcome, Outcome::Success);
        assert_eq!(test.results.len(), 6);
        assert_eq!(test.results[0].trials.len(), 3);
        assert_eq!(test.results[0].trials[0].len(), 3);
        assert_eq!(test.results[4].trials.len(), 1);
        assert!(test.results.iter().all(|r| r.average_settle.is_some()));
        assert_eq!(sim.count("move_stage"), 12);
        assert_eq!(sim.tilt_angle().await.unwrap(), 0.0);
    }

    #[tokio::test(start_paused = true)]
    async fn gives_up_after_max_time() {
        let dir = tempfile::tempdir().unwrap();
        let (sim, session) = session_with(SimConfig::default(), dir.path()).await;
        sim.set_last_drift((1.0, 0.0));
        let test = StageDrift {
            max_time: Duration::from_secs(10),
            ..StageDrift::default()
        };

        let samples = test.time_to_settle(&session).await.unwrap();

        assert!(samples.len() > 5);
        assert!(samples.iter().all(|s| s.value > test.criterion));
        assert_eq!(test.average_settle(&[samples]), None);
    }

    #[tokio::test(start_paused = true)]
    async fn refuses_to_start_before_refill() {
        let dir = tempfile::tempdir().unwrap();
        let (sim, mut session) = session_with(
            SimConfig {
                dewar_remaining_s: 300.0,
                ..SimConfig::default()
            },
            dir.path(),
        )
        .await;
        let mut test = StageDrift::default();

        let outcome = run(&mut session, &mut test).await;

        assert!(matches!(outcome, Outcome::Failed(ref r) if r.contains("autofill")));
        assert_eq!(sim.count("move_stage"), 0);
        assert_eq!(sim.count("exit"), 1);
    }
}
