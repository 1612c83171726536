//! CLI arguments and server configuration defaults.

use clap::{Parser, ValueEnum};

pub const STAGING_DIR: &str = ".staging";
pub const DEFAULT_STORAGE_DIR: &str = "/tmp/uploads";
pub const DEFAULT_MAX_FILE_SIZE: u64 = 4 * 1024 * 1024;
pub const DEFAULT_UPLOAD_RATE_LIMIT: &str = "5 per minute; 50 per hour; 200 per day";
pub const DEFAULT_STAGING_TTL_SECS: u64 = 60 * 60;
pub const AUTH_REALM: &str = "filegate";
/// Allowance on top of the file ceiling for multipart framing.
pub const MULTIPART_OVERHEAD: u64 = 64 * 1024;
pub const STAGING_CLEAN_INTERVAL_SECS: u64 = 900;
pub const RATE_LIMIT_PRUNE_INTERVAL_SECS: u64 = 300;

/// Which identity upload attempts are counted against.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, ValueEnum)]
pub enum RateLimitScope {
    /// One counter set for the whole process.
    #[default]
    Global,
    /// One counter set per client IP.
    Client,
}

/// CLI arguments and environment configuration for the server.
#[derive(Parser, Debug)]
#[command(name = "filegate", version, about = "Authenticated file upload gateway")]
pub struct Args {
    #[arg(
        short = 's',
        long,
        env = "UPLOAD_FOLDER",
        default_value = DEFAULT_STORAGE_DIR,
        help = "Storage directory for uploaded files"
    )]
    pub storage_dir: String,
    #[arg(
        long,
        env = "MAX_FILE_SIZE",
        default_value_t = DEFAULT_MAX_FILE_SIZE,
        help = "Max upload size in bytes"
    )]
    pub max_file_size: u64,
    #[arg(
        long,
        env = "API_KEY",
        hide_env_values = true,
        help = "Shared secret expected in the X-API-Key header"
    )]
    pub api_key: String,
    #[arg(long, env = "AUTH_USERNAME", help = "Web UI username")]
    pub auth_user: String,
    #[arg(
        long,
        env = "AUTH_PASSWORD",
        hide_env_values = true,
        help = "Web UI password (hashed at startup)"
    )]
    pub auth_pass: String,
    #[arg(
        short = 'b',
        long,
        env = "HOST",
        default_value = "0.0.0.0",
        help = "Bind address"
    )]
    pub host: String,
    #[arg(
        short = 'p',
        long,
        env = "PORT",
        default_value_t = 8080,
        help = "HTTP port"
    )]
    pub port: u16,
    #[arg(
        long,
        env = "UPLOAD_RATE_LIMIT",
        default_value = DEFAULT_UPLOAD_RATE_LIMIT,
        help = "Layered upload limits, e.g. \"5 per minute; 50 per hour\""
    )]
    pub upload_rate_limit: String,
    #[arg(
        long,
        env = "UPLOAD_RATE_SCOPE",
        value_enum,
        default_value_t = RateLimitScope::Global,
        help = "Count upload attempts globally or per client IP"
    )]
    pub upload_rate_scope: RateLimitScope,
    #[arg(
        long,
        env = "STAGING_TTL_SECS",
        default_value_t = DEFAULT_STAGING_TTL_SECS,
        help = "Age after which abandoned staged uploads are removed (0 to disable)"
    )]
    pub staging_ttl_secs: u64,
}

impl Args {
    /// Rejects values clap cannot check on its own.
    pub fn validate(&self) -> Result<(), String> {
        if self.api_key.trim().is_empty() {
            return Err("API_KEY must not be empty".into());
        }
        if self.auth_user.is_empty() || self.auth_pass.is_empty() {
            return Err("AUTH_USERNAME and AUTH_PASSWORD must not be empty".into());
        }
        if self.max_file_size == 0 {
            return Err("MAX_FILE_SIZE must be greater than zero".into());
        }
        Ok(())
    }
}
