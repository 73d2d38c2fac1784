//! CLI arguments and server configuration defaults.

use clap::Parser;
use shadow_rs::formatcp;
use std::time::Duration;

use crate::build;

const VERSION_INFO: &str = formatcp!(
    r#"{}\ncommit_hash: {}\nbuild_time: {}\nbuild_env: {},{}"#,
    build::PKG_VERSION,
    build::SHORT_COMMIT,
    build::BUILD_TIME,
    build::RUST_VERSION,
    build::RUST_CHANNEL
);

pub const MIB: u64 = 1024 * 1024;
pub const DEFAULT_STATE_DIR: &str = ".upload_state";
pub const DEFAULT_MAX_CHUNK_BYTES: u64 = 128 * MIB;
pub const DEFAULT_MAX_FILE_BYTES: u64 = 100 * 1024 * MIB;
pub const MIN_PERSIST_THRESHOLD: u64 = 64 * MIB;
pub const STALE_SESSION_SWEEP_INTERVAL_SECS: u64 = 900;

/// CLI arguments and environment configuration for the server.
#[derive(Parser, Debug)]
#[command(name = "resume-drive", version = VERSION_INFO, about = "Resumable upload server")]
pub struct Args {
    #[arg(
        short = 's',
        long,
        env = "RESUME_DRIVE_STORAGE_DIR",
        default_value = "./uploads",
        help = "Storage root; every upload lands below it"
    )]
    pub storage_dir: String,
    #[arg(
        long,
        env = "RESUME_DRIVE_STATE_DIR",
        default_value = DEFAULT_STATE_DIR,
        help = "Name of the session state directory inside the storage root"
    )]
    pub state_dir: String,
    #[arg(
        short = 'b',
        long,
        env = "RESUME_DRIVE_BIND",
        default_value = "127.0.0.1",
        help = "Bind address for HTTP/HTTPS"
    )]
    pub host: String,
    #[arg(
        short = 'p',
        long,
        env = "RESUME_DRIVE_HTTP_PORT",
        default_value_t = 8088,
        help = "HTTP port"
    )]
    pub http_port: u16,
    #[arg(
        short = 'P',
        long,
        env = "RESUME_DRIVE_HTTPS_PORT",
        default_value_t = 8443,
        help = "HTTPS port (used only when a cert and key are given)"
    )]
    pub https_port: u16,
    #[arg(short = 'c', long, env = "RESUME_DRIVE_TLS_CERT", help = "TLS cert path")]
    pub tls_cert: Option<String>,
    #[arg(short = 'k', long, env = "RESUME_DRIVE_TLS_KEY", help = "TLS key path")]
    pub tls_key: Option<String>,
    #[arg(
        long,
        env = "RESUME_DRIVE_CORS_ORIGINS",
        help = "Comma separated CORS origins (default allows any origin)"
    )]
    pub cors_origins: Option<String>,
    #[arg(
        long,
        env = "RESUME_DRIVE_MAX_CHUNK_BYTES",
        default_value_t = DEFAULT_MAX_CHUNK_BYTES,
        value_parser = clap::value_parser!(u64).range(1..),
        help = "Max bytes per chunk request"
    )]
    pub max_chunk_bytes: u64,
    #[arg(
        long,
        env = "RESUME_DRIVE_MAX_FILE_BYTES",
        default_value_t = DEFAULT_MAX_FILE_BYTES,
        help = "Max declared upload size in bytes (0 to disable)"
    )]
    pub max_file_bytes: u64,
    #[arg(
        long,
        env = "RESUME_DRIVE_PERSIST_THRESHOLD_BYTES",
        help = "Progress in bytes between metadata flushes (default: max(64 MiB, max chunk / 2))"
    )]
    pub persist_threshold_bytes: Option<u64>,
    #[arg(
        long,
        env = "RESUME_DRIVE_STALE_SESSION_TTL_SECS",
        default_value_t = 0,
        help = "Cancel unfinished uploads idle for this many seconds (0 to disable)"
    )]
    pub stale_session_ttl_secs: u64,
}

/// 上传引擎的限额与节流参数。
#[derive(Clone, Debug)]
pub struct UploadConfig {
    pub max_chunk_bytes: u64,
    /// 0 表示不限制。
    pub max_file_bytes: u64,
    pub persist_threshold: u64,
    pub stale_session_ttl: Duration,
}

impl UploadConfig {
    pub fn new(max_chunk_bytes: u64, max_file_bytes: u64) -> Self {
        Self {
            max_chunk_bytes,
            max_file_bytes,
            persist_threshold: default_persist_threshold(max_chunk_bytes),
            stale_session_ttl: Duration::ZERO,
        }
    }

    pub fn from_args(args: &Args) -> Self {
        let mut config = Self::new(args.max_chunk_bytes, args.max_file_bytes);
        if let Some(threshold) = args.persist_threshold_bytes {
            config.persist_threshold = threshold;
        }
        config.stale_session_ttl = Duration::from_secs(args.stale_session_ttl_secs);
        config
    }
}

impl Default for UploadConfig {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_CHUNK_BYTES, DEFAULT_MAX_FILE_BYTES)
    }
}

pub fn default_persist_threshold(max_chunk_bytes: u64) -> u64 {
    (max_chunk_bytes / 2).max(MIN_PERSIST_THRESHOLD)
}
