//! Tracing setup for a diagnostic run.
//!
//! Two `fmt` layers are installed: a coloured one on stderr and a plain one
//! writing to the run's log file. The file does not exist until the session
//! has created its run directory, so the file layer writes through a
//! [`LogRedirect`] that drops output until [`redirect_to`] attaches a file.
//!
//! `RUST_LOG` overrides the configured level:
//!
//! ```bash
//! RUST_LOG=perfectem=debug perfectem stage-drift
//! ```

use std::fs::{File, OpenOptions};
use std::io::{self, Write};
use std::path::Path;
use std::sync::{Arc, Mutex};

use once_cell::sync::OnceCell;
use tracing_subscriber::{fmt::MakeWriter, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use crate::config::LogSettings;
use crate::error::{AppResult, EmError};

static REDIRECT: OnceCell<LogRedirect> = OnceCell::new();

/// Shared file sink for the log-file layer.
#[derive(Clone, Default)]
pub struct LogRedirect {
    file: Arc<Mutex<Option<File>>>,
}

impl LogRedirect {
    /// Start appending log output to `path`, replacing any previous file.
    pub fn attach(&self, path: &Path) -> io::Result<()> {
        let file = OpenOptions::new().create(true).append(true).open(path)?;
        if let Ok(mut slot) = self.file.lock() {
            *slot = Some(file);
        }
        Ok(())
    }

    /// True once a run log file receives events.
    pub fn is_attached(&self) -> bool {
        self.file.lock().map(|slot| slot.is_some()).unwrap_or(false)
    }
}

/// Writer handed out per event by [`LogRedirect`].
pub struct RedirectWriter {
    file: Arc<Mutex<Option<File>>>,
}

impl Write for RedirectWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        match self.file.lock() {
            Ok(mut slot) => match slot.as_mut() {
                Some(file) => file.write(buf),
                None => Ok(buf.len()),
            },
            // poisoned: drop the line rather than fail the caller
            Err(_) => Ok(buf.len()),
        }
    }

    fn flush(&mut self) -> io::Result<()> {
        match self.file.lock() {
            Ok(mut slot) => slot.as_mut().map_or(Ok(()), |file| file.flush()),
            Err(_) => Ok(()),
        }
    }
}

impl<'a> MakeWriter<'a> for LogRedirect {
    type Writer = RedirectWriter;

    fn make_writer(&'a self) -> Self::Writer {
        RedirectWriter {
            file: Arc::clone(&self.file),
        }
    }
}

/// Install the global subscriber. Call once, from `main`.
pub fn init(settings: &LogSettings) -> AppResult<()> {
    let redirect = REDIRECT.get_or_init(LogRedirect::default).clone();

    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&settings.level))
        .map_err(|e| EmError::Configuration(format!("Invalid log filter: {}", e)))?;

    tracing_subscriber::registry()
        .with(filter)
        .with(
            tracing_subscriber::fmt::layer()
                .with_writer(io::stderr)
                .with_target(false),
        )
        .with(
            tracing_subscriber::fmt::layer()
                .with_writer(redirect)
                .with_ansi(false)
                .with_target(false),
        )
        .try_init()
        .map_err(|e| EmError::Configuration(format!("Logging already initialised: {}", e)))?;

    Ok(())
}

/// Send the file layer's output to `path`.
///
/// Returns `false` without touching the filesystem when [`init`] was never
/// called, which is the case in unit tests.
pub fn redirect_to(path: &Path) -> io::Result<bool> {
    match REDIRECT.get() {
        Some(redirect) => {
            redirect.attach(path)?;
            Ok(true)
        }
        None => Ok(false),
    }
}
