//! The instrument session shared by every diagnostic.
//!
//! A [`Session`] is created once per run by [`Session::initialize`], which
//! establishes the baseline every diagnostic assumes:
//!
//! 1. a run directory `<output_root>/<scope>-<ddmmyy>` receives the log file
//! 2. optional capabilities of the instrument are detected once and frozen
//! 3. a camera is selected and its quirks derived from its name
//! 4. user settings are pushed, column valves opened, low dose switched off
//!
//! The primitives diagnostics compose live in the submodules:
//! [`acquisition`] for presets and beam, [`feedback`] for the regulation and
//! waiting loops, [`focus`] for autofocus and eucentric height.
//!
//! A session is owned by one procedure at a time and issues one remote call
//! at a time; nothing here is shared between tasks.

pub mod acquisition;
pub mod feedback;
pub mod focus;

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Local};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::config::{SessionSettings, Settings};
use crate::error::{AppResult, EmError};
use crate::logging;
use crate::operator::Operator;
use crate::profiles::{self, ParameterBundle, TestId};
use crate::scope::client::SemClient;
use crate::scope::{ApertureKind, Microscope, ReadoutMode};

pub use acquisition::{AreaSettings, BeamSettings, Illumination};
pub use feedback::{DoseRegulation, DriftSettle};
pub use focus::{EucentricTrace, FocusSample, FocusTarget};

/// Result of a best-effort change to the instrument.
#[derive(Debug, Clone, PartialEq)]
pub enum Change {
    /// The instrument now has the requested setting.
    Applied,
    /// Nothing was sent, or the instrument refused; the run continues.
    Skipped(String),
    /// The operator was asked to make the change by hand.
    DeferredToOperator(String),
}

impl Change {
    /// True when the setting was applied.
    pub fn is_applied(&self) -> bool {
        matches!(self, Change::Applied)
    }
}

/// Optional features of the instrument, detected once at bootstrap.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Capabilities {
    /// Three-condenser optics: intensity is set as illuminated area.
    pub three_condenser: bool,
    /// Autofill dewars that report their state.
    pub autofill: bool,
    /// Motorised apertures the server can read and set.
    pub aperture_control: bool,
}

impl Capabilities {
    /// Test each capability with a harmless query.
    ///
    /// Any failure means the capability is absent. Never returns an error.
    pub async fn detect(scope: &dyn Microscope) -> Self {
        let three_condenser = scope.illuminated_area().await.is_ok();
        let autofill = scope.dewars_filling().await.is_ok();
        let aperture_control = scope.aperture_size(ApertureKind::C2).await.is_ok();

        let capabilities = Self {
            three_condenser,
            autofill,
            aperture_control,
        };
        debug!(?capabilities, "Detected instrument capabilities");
        capabilities
    }
}

/// Camera behaviour derived from its model name.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CameraQuirks {
    /// Electron counting readout is available.
    pub counting: bool,
    /// Super-resolution frames are binned by two on the camera PC.
    pub divide_by_two: bool,
    /// Readout mode used unless a preset asks otherwise.
    pub native_readout: ReadoutMode,
    /// Shortest frame time in seconds when saving frames.
    pub min_frame_time: f64,
}

impl CameraQuirks {
    /// Quirks of the camera called `name`.
    pub fn from_name(name: &str) -> Self {
        let lower = name.to_ascii_lowercase();
        if lower.contains("k2") || lower.contains("k3") {
            Self {
                counting: true,
                divide_by_two: true,
                native_readout: ReadoutMode::Counting,
                min_frame_time: 0.025,
            }
        } else if lower.contains("falcon 4") || lower.contains("falcon4") {
            Self {
                counting: true,
                divide_by_two: false,
                native_readout: ReadoutMode::Counting,
                min_frame_time: 0.004,
            }
        } else {
            Self {
                counting: false,
                divide_by_two: false,
                native_readout: ReadoutMode::Linear,
                min_frame_time: 0.025,
            }
        }
    }
}

/// The camera a session acquires with.
#[derive(Debug, Clone, PartialEq)]
pub struct CameraInfo {
    /// 1-based number as the server counts cameras
    pub number: usize,
    /// Name reported by the server
    pub name: String,
    /// Behaviour derived from the name
    pub quirks: CameraQuirks,
}

/// Timing and limits of the feedback loops.
#[derive(Debug, Clone, PartialEq)]
pub struct SessionTuning {
    /// Pause after lens or stage changes
    pub settle_delay: Duration,
    /// Highest dose rate the camera may see, e/px/s
    pub dose_ceiling_eps: f64,
    /// Interval between dewar and pump checks
    pub readiness_poll: Duration,
    /// Iteration limit of the autofocus loop
    pub autofocus_max_iterations: u32,
}

impl From<&SessionSettings> for SessionTuning {
    fn from(settings: &SessionSettings) -> Self {
        Self {
            settle_delay: settings.settle_delay,
            dose_ceiling_eps: settings.dose_ceiling_eps,
            readiness_poll: settings.readiness_poll,
            autofocus_max_iterations: settings.autofocus_max_iterations,
        }
    }
}

/// Acquisition parameters the diagnostic runs with unless told otherwise.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct AcquisitionDefaults {
    /// Seconds
    pub exposure: f64,
    /// Binning
    pub binning: u32,
    /// Nominal magnification
    pub magnification: u32,
    /// Illuminated area or C2 percentage, see [`Illumination`]
    pub intensity: f64,
    /// Spot size
    pub spot: u32,
    /// Profile entry these were taken from
    pub bundle: ParameterBundle,
}

impl From<ParameterBundle> for AcquisitionDefaults {
    fn from(bundle: ParameterBundle) -> Self {
        Self {
            exposure: bundle.exposure,
            binning: bundle.binning,
            magnification: bundle.mag,
            intensity: bundle.beam,
            spot: bundle.spot,
            bundle,
        }
    }
}

/// Where a run writes its log and artifacts.
#[derive(Debug, Clone, PartialEq)]
pub struct RunDirectory {
    /// Run directory
    pub path: PathBuf,
    /// Run log inside `path`
    pub log_file: PathBuf,
}

impl RunDirectory {
    /// Create `<root>/<scope>-<ddmmyy>` and name the log `<test>_<ddmmyy_HHMM>.log`.
    pub fn create(
        root: &Path,
        scope_name: &str,
        test: TestId,
        now: DateTime<Local>,
    ) -> AppResult<Self> {
        let path = root.join(format!("{}-{}", scope_name, now.format("%d%m%y")));
        fs::create_dir_all(&path)?;
        let log_file = path.join(format!(
            "{}_{}.log",
            test.as_str().to_ascii_lowercase(),
            now.format("%d%m%y_%H%M")
        ));
        Ok(Self { path, log_file })
    }
}

/// Everything [`Session::initialize`] needs besides the instrument.
#[derive(Debug, Clone)]
pub struct SessionOptions {
    /// Instrument name used in the run directory
    pub scope_name: String,
    /// Diagnostic to run
    pub test: TestId,
    /// 1-based camera number; `None` asks the operator
    pub camera: Option<usize>,
    /// Acquisition parameters of `test`
    pub defaults: AcquisitionDefaults,
    /// Feedback loop timing
    pub tuning: SessionTuning,
    /// Parent of the run directory
    pub output_root: PathBuf,
    /// Server user settings written at bootstrap
    pub user_settings: BTreeMap<String, f64>,
}

impl SessionOptions {
    /// Resolve the options of `test` from validated settings.
    pub fn from_settings(settings: &Settings, test: TestId) -> AppResult<Self> {
        let bundle = profiles::resolve(&settings.scope.profile, test)?;
        Ok(Self {
            scope_name: settings.scope.name.clone(),
            test,
            camera: settings.scope.camera,
            defaults: bundle.into(),
            tuning: SessionTuning::from(&settings.session),
            output_root: settings.session.output_root.clone(),
            user_settings: settings.user_settings.clone(),
        })
    }
}

/// Validate a 1-based camera choice against the discovered cameras.
pub fn select_camera_number(
    names: &[String],
    selector: Option<usize>,
    operator: &mut dyn Operator,
) -> AppResult<usize> {
    if names.is_empty() {
        return Err(EmError::Configuration(
            "The automation server reports no cameras".to_string(),
        ));
    }

    let number = match selector {
        Some(number) => number,
        None => operator
            .choose("Select camera", names)
            .ok_or_else(|| EmError::Configuration("No camera selected".to_string()))?,
    };

    if number == 0 || number > names.len() {
        return Err(EmError::Configuration(format!(
            "Camera {} out of range, {} camera(s) available",
            number,
            names.len()
        )));
    }
    Ok(number)
}

/// One diagnostic run against one instrument.
pub struct Session {
    scope: Arc<dyn Microscope>,
    run_id: Uuid,
    test: TestId,
    scope_name: String,
    capabilities: Capabilities,
    camera: CameraInfo,
    tuning: SessionTuning,
    defaults: AcquisitionDefaults,
    run_dir: RunDirectory,
    terminated: bool,
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("run_id", &self.run_id)
            .field("test", &self.test)
            .field("capabilities", &self.capabilities)
            .field("camera", &self.camera)
            .field("terminated", &self.terminated)
            .finish()
    }
}

impl Session {
    /// Connect to the automation server and bootstrap a session.
    ///
    /// Fails with [`EmError::Connection`] when the server is unreachable.
    /// No retry: an unreachable server is an environment problem.
    pub async fn connect(
        settings: &Settings,
        options: SessionOptions,
        operator: &mut dyn Operator,
    ) -> AppResult<Self> {
        let client = SemClient::connect(&settings.connection).await?;
        Self::initialize(Arc::new(client), options, operator).await
    }

    /// Bring the instrument into the baseline state every diagnostic assumes.
    pub async fn initialize(
        scope: Arc<dyn Microscope>,
        options: SessionOptions,
        operator: &mut dyn Operator,
    ) -> AppResult<Self> {
        let run_dir = RunDirectory::create(
            &options.output_root,
            &options.scope_name,
            options.test,
            Local::now(),
        )?;
        if logging::redirect_to(&run_dir.log_file)? {
            info!(path = %run_dir.log_file.display(), "Logging to file");
        }

        // Capability queries that fail must not open dialogs on the microscope PC.
        scope.suppress_error_dialogs(true).await?;
        let capabilities = Capabilities::detect(scope.as_ref()).await;
        scope.suppress_error_dialogs(false).await?;

        let names = scope.camera_names().await?;
        let number = select_camera_number(&names, options.camera, operator)?;
        scope.select_camera(number).await?;
        let name = names[number - 1].clone();
        let camera = CameraInfo {
            number,
            quirks: CameraQuirks::from_name(&name),
            name,
        };
        info!(camera = %camera.name, number, "Selected camera");

        for (key, value) in &options.user_settings {
            scope.set_user_setting(key, *value).await?;
        }

        if !scope.column_valves_open().await? {
            info!("Opening column valves");
            scope.set_column_valves(true).await?;
        }
        scope.set_low_dose(false).await?;

        let session = Self {
            scope,
            run_id: Uuid::new_v4(),
            test: options.test,
            scope_name: options.scope_name,
            capabilities,
            camera,
            tuning: options.tuning,
            defaults: options.defaults,
            run_dir,
            terminated: false,
        };
        info!(
            run_id = %session.run_id,
            scope = %session.scope_name,
            three_condenser = capabilities.three_condenser,
            autofill = capabilities.autofill,
            aperture_control = capabilities.aperture_control,
            "Session initialised"
        );
        Ok(session)
    }

    /// Release the automation server. Only the first call reaches it.
    pub async fn terminate(&mut self) {
        if self.terminated {
            return;
        }
        self.terminated = true;
        if let Err(e) = self.scope.exit().await {
            warn!("Failed to end the remote session: {:#}", e);
        }
    }

    /// True once the remote session has been ended.
    pub fn is_terminated(&self) -> bool {
        self.terminated
    }

    /// The instrument.
    pub fn scope(&self) -> &dyn Microscope {
        self.scope.as_ref()
    }

    /// Identifier of this run in log lines.
    pub fn run_id(&self) -> Uuid {
        self.run_id
    }

    /// Diagnostic this session runs.
    pub fn test(&self) -> TestId {
        self.test
    }

    /// Instrument name.
    pub fn scope_name(&self) -> &str {
        &self.scope_name
    }

    /// Optional features found at bootstrap.
    pub fn capabilities(&self) -> Capabilities {
        self.capabilities
    }

    /// Selected camera.
    pub fn camera(&self) -> &CameraInfo {
        &self.camera
    }

    /// Feedback loop timing.
    pub fn tuning(&self) -> &SessionTuning {
        &self.tuning
    }

    /// Acquisition defaults of the diagnostic.
    pub fn defaults(&self) -> &AcquisitionDefaults {
        &self.defaults
    }

    /// Where logs and artifacts go.
    pub fn run_dir(&self) -> &RunDirectory {
        &self.run_dir
    }

    /// Wait for lenses and stage to settle after a change.
    pub(crate) async fn settle(&self) {
        tokio::time::sleep(self.tuning.settle_delay).await;
    }
}
