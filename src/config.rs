//! CLI arguments, environment fallbacks and the resolved server settings.

use clap::{ArgAction, Parser};
use shadow_rs::formatcp;
use std::fmt;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::str::FromStr;

use crate::build;

const VERSION_INFO: &str = formatcp!(
    r#"{}\ncommit_hash: {}\nbuild_time: {}\nbuild_env: {},{}"#,
    build::PKG_VERSION,
    build::SHORT_COMMIT,
    build::BUILD_TIME,
    build::RUST_VERSION,
    build::RUST_CHANNEL
);

pub const DEFAULT_ADDR: &str = "0.0.0.0:4000";
pub const DEFAULT_DIR: &str = ".";
pub const DEFAULT_MODE: &str = "http";
pub const UPLOAD_ENV: &str = "GOUP_UPLOAD";

const AFTER_HELP: &str = "Environment variables (get overridden by command line arguments):
  GOUP_UPLOAD=false: disable uploads
  GOUP_DIR=<path>: see --dir
  GOUP_MODE=(http|fcgi): see --mode";

/// CLI arguments and environment configuration for the server.
#[derive(Parser, Debug)]
#[command(
    name = "goup",
    version = VERSION_INFO,
    about = "Minimal file listing and upload server",
    after_help = AFTER_HELP
)]
pub struct Args {
    #[arg(
        short = 'm',
        long,
        env = "GOUP_MODE",
        default_value = DEFAULT_MODE,
        help = "Run either standalone (http) or as FCGI application (fcgi)"
    )]
    pub mode: String,
    #[arg(
        short = 'a',
        long,
        default_value = DEFAULT_ADDR,
        help = "Listen on this address"
    )]
    pub addr: SocketAddr,
    #[arg(
        short = 'd',
        long,
        env = "GOUP_DIR",
        default_value = DEFAULT_DIR,
        help = "Directory for storing and serving files"
    )]
    pub dir: PathBuf,
    #[arg(
        long,
        num_args = 0..=1,
        require_equals = true,
        default_missing_value = "true",
        action = ArgAction::Set,
        value_name = "BOOL",
        help = "Disable uploads [default: GOUP_UPLOAD=false, otherwise enabled]"
    )]
    pub noupload: Option<bool>,
    #[arg(
        short = 'v',
        long,
        num_args = 0..=1,
        require_equals = true,
        default_value_t = true,
        default_missing_value = "true",
        action = ArgAction::Set,
        value_name = "BOOL",
        help = "Verbose output (no output at all when false)"
    )]
    pub verbose: bool,
}

impl Args {
    /// Resolves the upload switch: the flag wins, then `GOUP_UPLOAD`, then enabled.
    pub fn uploads_enabled(&self, upload_env: Option<&str>) -> bool {
        match self.noupload {
            Some(noupload) => !noupload,
            None => upload_env != Some("false"),
        }
    }

    /// Builds the per-request settings handed to the router.
    pub fn server_config(&self, upload_env: Option<&str>) -> ServerConfig {
        ServerConfig {
            root: self.dir.clone(),
            upload_enabled: self.uploads_enabled(upload_env),
        }
    }
}

/// Settings shared read-only by every request handler.
#[derive(Clone, Debug)]
pub struct ServerConfig {
    pub root: PathBuf,
    pub upload_enabled: bool,
}

/// Transport the router is exposed through.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Mode {
    Http,
    Fcgi,
}

#[derive(Debug)]
pub struct UnknownMode(pub String);

impl fmt::Display for UnknownMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Unknown mode '{}'!", self.0)
    }
}

impl std::error::Error for UnknownMode {}

impl FromStr for Mode {
    type Err = UnknownMode;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value {
            "http" => Ok(Mode::Http),
            "fcgi" => Ok(Mode::Fcgi),
            other => Err(UnknownMode(other.to_string())),
        }
    }
}
