//! Application configuration module
//!
//! Command line flags, with `PG*` environment variables (optionally from a
//! `.env` file) as fallbacks, resolved into validated settings.

use clap::{ArgAction, Parser};
use std::path::PathBuf;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Missing required environment variable: {0}")]
    MissingVar(String),

    #[error("Invalid configuration value: {0}")]
    InvalidValue(String),
}

/// Command line arguments
#[derive(Parser, Debug, Clone)]
#[command(name = "pg_dump_sample")]
#[command(version)]
#[command(about = "Dump a referentially consistent sample of a PostgreSQL database")]
#[command(override_usage = "pg_dump_sample [OPTIONS] --manifest-file <FILE> <DATABASE>")]
#[command(disable_help_flag = true)]
pub struct Args {
    /// Database to dump
    #[arg(value_name = "DATABASE")]
    pub database: String,

    /// Database server host or socket directory
    #[arg(short = 'h', long, env = "PGHOST", default_value = "/tmp")]
    pub host: String,

    /// Database server port
    #[arg(short = 'p', long, env = "PGPORT", default_value_t = 5432)]
    pub port: u16,

    /// Database user name (defaults to the current user)
    #[arg(short = 'U', long, env = "PGUSER")]
    pub username: Option<String>,

    /// Never prompt for password
    #[arg(short = 'w', long)]
    pub no_password: bool,

    /// Path to manifest file
    #[arg(short = 'm', long, value_name = "FILE")]
    pub manifest_file: PathBuf,

    /// Path to output file (defaults to standard output)
    #[arg(short = 'f', long = "file", value_name = "FILE")]
    pub output_file: Option<PathBuf>,

    /// Use SSL/TLS database connection
    #[arg(short = 's', long = "tls")]
    pub use_tls: bool,

    /// Show help
    #[arg(long, action = ArgAction::Help)]
    pub help: Option<bool>,
}

/// Complete, validated run settings
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Settings {
    pub database: String,
    pub host: String,
    pub port: u16,
    pub username: String,
    pub no_password: bool,
    pub manifest_file: PathBuf,
    pub output_file: Option<PathBuf>,
    pub use_tls: bool,
}

impl Settings {
    /// Parse the process arguments into settings
    ///
    /// Usage errors print to stderr and exit non-zero; `--help` prints to
    /// stdout and exits zero.
    pub fn load() -> Result<Self, ConfigError> {
        // Load .env file if it exists (ignore errors if file not found)
        let _ = dotenvy::dotenv();
        Self::from_args(Args::parse())
    }

    pub fn from_args(args: Args) -> Result<Self, ConfigError> {
        if args.database.trim().is_empty() {
            return Err(ConfigError::InvalidValue("database name is empty".to_string()));
        }
        if args.host.trim().is_empty() {
            return Err(ConfigError::InvalidValue("host is empty".to_string()));
        }

        let username = match args.username.filter(|u| !u.is_empty()) {
            Some(user) => user,
            None => current_user()?,
        };

        Ok(Self {
            database: args.database,
            host: args.host,
            port: args.port,
            username,
            no_password: args.no_password,
            manifest_file: args.manifest_file,
            output_file: args.output_file,
            use_tls: args.use_tls,
        })
    }
}

/// Login name of the invoking user, from the account database first and
/// the environment second
fn current_user() -> Result<String, ConfigError> {
    if let Some(user) = os_user() {
        return Ok(user);
    }
    std::env::var("USER")
        .or_else(|_| std::env::var("USERNAME"))
        .map_err(|_| ConfigError::MissingVar("USER".to_string()))
}

#[cfg(unix)]
fn os_user() -> Option<String> {
    use std::ffi::CStr;

    let mut pwd = std::mem::MaybeUninit::<libc::passwd>::uninit();
    let mut buf = vec![0 as libc::c_char; 4096];
    let mut found: *mut libc::passwd = std::ptr::null_mut();

    // SAFETY: every pointer refers to live storage sized as passed, and
    // `pw_name` is only read when the lookup filled `pwd`.
    unsafe {
        let rc = libc::getpwuid_r(
            libc::getuid(),
            pwd.as_mut_ptr(),
            buf.as_mut_ptr(),
            buf.len(),
            &mut found,
        );
        if rc != 0 || found.is_null() {
            return None;
        }
        let name = (*found).pw_name;
        if name.is_null() {
            return None;
        }
        let user = CStr::from_ptr(name).to_string_lossy().into_owned();
        (!user.is_empty()).then_some(user)
    }
}

#[cfg(not(unix))]
fn os_user() -> Option<String> {
    None
}
