//! Core library for the perfectem diagnostics suite.
//!
//! The suite drives a transmission electron microscope through a remote
//! automation server and measures its performance against published
//! specifications. The library holds the instrument session every
//! diagnostic builds on, the remote call contract with its socket and
//! simulated implementations, and the diagnostics themselves. It is used by
//! the `perfectem` command-line tool.

pub mod config;
pub mod diagnostics;
pub mod error;
pub mod lifecycle;
pub mod logging;
pub mod operator;
pub mod profiles;
pub mod scope;
pub mod session;
