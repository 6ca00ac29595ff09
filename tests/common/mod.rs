//! Shared helpers for integration tests.

use std::path::Path;
use std::sync::Arc;

use perfectem::config::Settings;
use perfectem::operator::ScriptedOperator;
use perfectem::profiles::TestId;
use perfectem::scope::sim::{SimConfig, SimulatedScope};
use perfectem::session::{Session, SessionOptions};

/// Session against a simulated scope, with the bootstrap calls cleared.
pub async fn simulated_session(config: SimConfig, root: &Path) -> (Arc<SimulatedScope>, Session) {
    let settings = Settings::default();
    let mut options = SessionOptions::from_settings(&settings, TestId::StageDrift)
        .expect("Default settings should resolve");
    options.camera = Some(1);
    options.output_root = root.to_path_buf();

    let sim = Arc::new(SimulatedScope::new(config));
    let mut operator = ScriptedOperator::default();
    let session = Session::initialize(sim.clone(), options, &mut operator)
        .await
        .expect("Bootstrap against the simulated scope should succeed");
    sim.clear_calls();
    (sim, session)
}
