//! The lifecycle wrapper releases the instrument exactly once, whatever the
//! diagnostic does.

mod common;

use async_trait::async_trait;
use common::simulated_session;
use perfectem::error::{AppResult, EmError};
use perfectem::lifecycle::{run, Diagnostic, Outcome};
use perfectem::scope::sim::SimConfig;
use perfectem::session::{FocusTarget, Session};

/// Completes `steps` stage moves, then finishes, fails or panics.
struct PartialProcedure {
    steps: usize,
    ending: Ending,
}

#[derive(Clone, Copy)]
enum Ending {
    Complete,
    Error,
    Panic,
}

#[async_trait]
impl Diagnostic for PartialProcedure {
    fn name(&self) -> &str {
        "Partial procedure"
    }

    async fn execute(&mut self, session: &mut Session) -> AppResult<()> {
        for _ in 0..self.steps {
            session.scope().move_stage(0.5, 0.0, 0.0).await?;
        }
        match self.ending {
            Ending::Complete => Ok(()),
            Ending::Error => Err(EmError::Aborted("operator stopped the run".to_string())),
            Ending::Panic => panic!("unexpected reply"),
        }
    }
}

#[tokio::test]
async fn test_teardown_exactly_once_for_every_ending() {
    let dir = tempfile::tempdir().unwrap();
    for ending in [Ending::Complete, Ending::Error, Ending::Panic] {
        for steps in [0, 3] {
            let (sim, mut session) = simulated_session(SimConfig::default(), dir.path()).await;
            let mut procedure = PartialProcedure { steps, ending };

            let outcome = run(&mut session, &mut procedure).await;

            assert_eq!(outcome.is_success(), matches!(ending, Ending::Complete));
            assert_eq!(sim.count("move_stage"), steps);
            assert_eq!(sim.count("exit"), 1);
            assert!(sim.exited());
        }
    }
}

/// Fails its correction pass, which ends the remote session early.
struct FailingFocus;

#[async_trait]
impl Diagnostic for FailingFocus {
    fn name(&self) -> &str {
        "Failing focus"
    }

    async fn execute(&mut self, session: &mut Session) -> AppResult<()> {
        session
            .autofocus_to(&FocusTarget::new(-1.0, 0.05).with_astigmatism(false))
            .await?;
        Ok(())
    }
}

#[tokio::test]
async fn test_correction_failure_does_not_release_twice() {
    let dir = tempfile::tempdir().unwrap();
    let (sim, mut session) = simulated_session(SimConfig::default(), dir.path()).await;
    sim.fail("fix_astigmatism_by_ctf");

    let outcome = run(&mut session, &mut FailingFocus).await;

    match outcome {
        Outcome::Failed(reason) => assert!(reason.contains("Astigmatism correction failed")),
        Outcome::Success => panic!("correction failure should fail the run"),
    }
    assert_eq!(sim.count("exit"), 1);
}
