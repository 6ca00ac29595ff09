//! Running a diagnostic from start to teardown.
//!
//! [`run`] is the only way diagnostics are executed. Whatever the procedure
//! does (finishes, returns an error or panics), the run logs its start and
//! completion and releases the automation server exactly once. Failures are
//! reported as [`Outcome::Failed`] and never propagate: a half-finished
//! diagnostic still leaves a usable log and a released instrument.

use std::any::Any;
use std::fmt;
use std::panic::AssertUnwindSafe;

use async_trait::async_trait;
use futures::FutureExt;
use tokio::time::Instant;
use tracing::{error, info, info_span, Instrument};

use crate::error::AppResult;
use crate::session::Session;

/// A diagnostic procedure composed from session primitives.
#[async_trait]
pub trait Diagnostic: Send {
    /// Name used in log lines.
    fn name(&self) -> &str;

    /// Run the procedure. The session is terminated by the caller.
    async fn execute(&mut self, session: &mut Session) -> AppResult<()>;
}

/// How a diagnostic run ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    /// The procedure finished
    Success,
    /// The procedure stopped with this error
    Failed(String),
}

impl Outcome {
    /// True when the run finished.
    pub fn is_success(&self) -> bool {
        matches!(self, Outcome::Success)
    }
}

impl fmt::Display for Outcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Outcome::Success => f.write_str("success"),
            Outcome::Failed(reason) => write!(f, "failed: {}", reason),
        }
    }
}

fn panic_message(payload: Box<dyn Any + Send>) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        format!("panicked: {}", message)
    } else if let Some(message) = payload.downcast_ref::<String>() {
        format!("panicked: {}", message)
    } else {
        "panicked".to_string()
    }
}

/// Tilt to zero and clear image shift, if either is set.
async fn neutralise_stage(session: &Session) -> AppResult<()> {
    let scope = session.scope();
    if scope.tilt_angle().await? != 0.0 {
        info!("Resetting stage tilt to 0");
        scope.tilt_to(0.0).await?;
    }
    let (x, y) = scope.image_shift().await?;
    if x != 0.0 || y != 0.0 {
        info!("Resetting image shift");
        scope.set_image_shift(0.0, 0.0).await?;
    }
    Ok(())
}

/// Execute `diagnostic` and tear the session down.
pub async fn run(session: &mut Session, diagnostic: &mut dyn Diagnostic) -> Outcome {
    let name = diagnostic.name().to_string();
    let span = info_span!("run", test = %name, run_id = %session.run_id());

    async move {
        info!("{} started", name);
        let start = Instant::now();

        let result = AssertUnwindSafe(async {
            neutralise_stage(session).await?;
            diagnostic.execute(session).await
        })
        .catch_unwind()
        .await;

        let outcome = match result {
            Ok(Ok(())) => Outcome::Success,
            Ok(Err(e)) => Outcome::Failed(e.to_string()),
            Err(payload) => Outcome::Failed(panic_message(payload)),
        };
        if let Outcome::Failed(reason) = &outcome {
            error!("{} failed: {}", name, reason);
        }

        info!(
            "{} completed in {:.1} s ({})",
            name,
            start.elapsed().as_secs_f64(),
            outcome
        );
        session.terminate().await;
        outcome
    }
    .instrument(span)
    .await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::EmError;
    use crate::scope::sim::SimConfig;
    use crate::scope::Microscope;
    use crate::session::test_support::session_with;
    use tracing_test::traced_test;

    enum Behaviour {
        Finish,
        Fail,
        Panic,
    }

    struct Stub {
        behaviour: Behaviour,
        executed: bool,
    }

    impl Stub {
        fn new(behaviour: Behaviour) -> Self {
            Self {
                behaviour,
                executed: false,
            }
        }
    }

    #[async_trait]
    impl Diagnostic for Stub {
        fn name(&self) -> &str {
            "Stub"
        }

        async fn execute(&mut self, session: &mut Session) -> AppResult<()> {
            self.executed = true;
            session.scope().move_stage(1.0, 0.0, 0.0).await?;
            match self.behaviour {
                Behaviour::Finish => Ok(()),
                Behaviour::Fail => Err(EmError::Aborted("stage stuck".to_string())),
                Behaviour::Panic => panic!("index out of range"),
            }
        }
    }

    #[tokio::test]
    #[traced_test]
    async fn successful_run_logs_and_terminates_once() {
        let dir = tempfile::tempdir().unwrap();
        let (sim, mut session) = session_with(SimConfig::default(), dir.path()).await;
        let mut stub = Stub::new(Behaviour::Finish);

        let outcome = run(&mut session, &mut stub).await;

        assert_eq!(outcome, Outcome::Success);
        assert!(stub.executed);
        assert_eq!(sim.count("exit"), 1);
        assert!(logs_contain("Stub started"));
        assert!(logs_contain("Stub completed"));
    }

    #[tokio::test]
    #[traced_test]
    async fn failing_run_is_contained() {
        let dir = tempfile::tempdir().unwrap();
        let (sim, mut session) = session_with(SimConfig::default(), dir.path()).await;
        let mut stub = Stub::new(Behaviour::Fail);

        let outcome = run(&mut session, &mut stub).await;

        assert!(matches!(outcome, Outcome::Failed(ref r) if r.contains("stage stuck")));
        assert_eq!(sim.count("exit"), 1);
        assert!(logs_contain("Stub failed"));
        assert!(logs_contain("Stub completed"));
    }

    #[tokio::test]
    #[traced_test]
    async fn panicking_run_still_tears_down() {
        let dir = tempfile::tempdir().unwrap();
        let (sim, mut session) = session_with(SimConfig::default(), dir.path()).await;
        let mut stub = Stub::new(Behaviour::Panic);

        let outcome = run(&mut session, &mut stub).await;

        assert_eq!(
            outcome,
            Outcome::Failed("panicked: index out of range".to_string())
        );
        assert_eq!(sim.count("exit"), 1);
        assert!(logs_contain("Stub started"));
        assert!(logs_contain("Stub completed"));
    }

    #[tokio::test]
    async fn terminated_session_is_not_released_twice() {
        let dir = tempfile::tempdir().unwrap();
        let (sim, mut session) = session_with(SimConfig::default(), dir.path()).await;
        session.terminate().await;

        run(&mut session, &mut Stub::new(Behaviour::Finish)).await;
        assert_eq!(sim.count("exit"), 1);
    }

    #[tokio::test]
    async fn tilt_and_image_shift_are_neutralised() {
        let dir = tempfile::tempdir().unwrap();
        let (sim, mut session) = session_with(
            SimConfig {
                tilt_angle: 30.0,
                image_shift: (0.5, -0.2),
                ..SimConfig::default()
            },
            dir.path(),
        )
        .await;

        run(&mut session, &mut Stub::new(Behaviour::Finish)).await;

        assert_eq!(sim.tilt_angle().await.unwrap(), 0.0);
        assert_eq!(sim.image_shift().await.unwrap(), (0.0, 0.0));
        assert_eq!(sim.count("tilt_to"), 1);
    }
}
