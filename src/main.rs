//! `perfectem`: run one microscope diagnostic.
//!
//! ```bash
//! perfectem --config krios.toml stage-drift
//! perfectem --profile krios3_k3 --list
//! perfectem --simulate --camera 2 eucentricity
//! perfectem --profile glacios_falcon3 afis
//! ```

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use clap::{Parser, ValueEnum};
use tracing::{error, info};

use perfectem::config::Settings;
use perfectem::diagnostics;
use perfectem::lifecycle;
use perfectem::logging;
use perfectem::operator::ConsoleOperator;
use perfectem::profiles::{self, TestId};
use perfectem::scope::sim::SimulatedScope;
use perfectem::session::{Session, SessionOptions};

#[derive(Debug, Clone, Copy, ValueEnum)]
enum Test {
    StageDrift,
    Afis,
    Eucentricity,
}

impl From<Test> for TestId {
    fn from(test: Test) -> Self {
        match test {
            Test::StageDrift => TestId::StageDrift,
            Test::Afis => TestId::Afis,
            Test::Eucentricity => TestId::Eucentricity,
        }
    }
}

#[derive(Parser, Debug)]
#[command(name = "perfectem")]
#[command(about = "Automated performance diagnostics for electron microscopes")]
struct Args {
    /// TOML settings file
    #[arg(long)]
    config: Option<PathBuf>,

    /// Instrument profile, overrides the settings file
    #[arg(long)]
    profile: Option<String>,

    /// 1-based camera number; asks when omitted
    #[arg(long)]
    camera: Option<usize>,

    /// Run against a simulated microscope
    #[arg(long)]
    simulate: bool,

    /// Print the parameter table of the profile and exit
    #[arg(long)]
    list: bool,

    /// Diagnostic to run
    #[arg(value_enum, required_unless_present = "list")]
    test: Option<Test>,
}

fn print_profile(profile: &str) -> Result<()> {
    println!(
        "{:<14} {:>8} {:>5} {:>8} {:>9} {:>4} {:>9}  spec",
        "test", "beam", "spot", "mag", "exposure", "bin", "defocus"
    );
    for test in TestId::ALL {
        let b = profiles::resolve(profile, test)?;
        println!(
            "{:<14} {:>8} {:>5} {:>8} {:>9} {:>4} {:>9}  {}",
            test.as_str(),
            b.beam,
            b.spot,
            b.mag,
            b.exposure,
            b.binning,
            b.defocus.map(|d| d.to_string()).unwrap_or_default(),
            b.spec.map(|s| format!("{:?}", s)).unwrap_or_default()
        );
    }
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let mut settings = Settings::load(args.config.as_deref()).context("Failed to load settings")?;
    if let Some(profile) = args.profile {
        settings.scope.profile = profile;
    }
    if args.camera.is_some() {
        settings.scope.camera = args.camera;
    }
    settings.validate()?;

    if args.list {
        return print_profile(&settings.scope.profile);
    }
    let Some(test) = args.test.map(TestId::from) else {
        bail!("No diagnostic given");
    };

    logging::init(&settings.log)?;

    let Some(mut diagnostic) = diagnostics::for_test(test) else {
        bail!("{} is not available in this tool", test);
    };

    let options = SessionOptions::from_settings(&settings, test)?;
    let mut operator = ConsoleOperator;
    let session = if args.simulate {
        info!("Running against a simulated microscope");
        Session::initialize(Arc::new(SimulatedScope::default()), options, &mut operator).await
    } else {
        Session::connect(&settings, options, &mut operator).await
    };
    let mut session = match session {
        Ok(session) => session,
        Err(e) => {
            error!("Session setup failed: {}", e);
            if e.is_fatal() {
                error!("Check the connection and scope settings before retrying");
            }
            return Err(e.into());
        }
    };

    let outcome = lifecycle::run(&mut session, diagnostic.as_mut()).await;
    info!("{}: {}", test, outcome);
    Ok(())
}
