//! Configuration parsing – reads a KEY=VALUE file shared by the server and
//! the recorder CLI.
//!
//! Both binaries load the same file; each ignores fields it does not need.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use tracing::info;

/// Container extensions accepted by the store.
pub const ALLOWED_EXTENSIONS: [&str; 3] = ["mp4", "webm", "mkv"];

/// Extension used when a client cannot report an allowed container type.
pub const DEFAULT_EXTENSION: &str = "mp4";

/// Whether to record the whole shared surface or a user-drawn region of it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CaptureMode {
    #[default]
    Screen,
    Region,
}

impl CaptureMode {
    fn parse(value: &str) -> Self {
        if value.eq_ignore_ascii_case("region") {
            Self::Region
        } else {
            Self::Screen
        }
    }
}

/// Which backend holds the rate limiter's sliding windows.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RateStoreKind {
    /// JSON document under `state_dir`, survives restarts.
    #[default]
    File,
    /// Process-local map; lost on restart.
    Memory,
}

/// Per-action admission limits, all counted over `window`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ActionLimits {
    pub upload: u32,
    pub delete: u32,
    pub rename: u32,
    pub clean: u32,
    pub window: Duration,
}

impl Default for ActionLimits {
    fn default() -> Self {
        Self {
            upload: 20,
            delete: 30,
            rename: 30,
            clean: 10,
            window: Duration::from_secs(3600),
        }
    }
}

/// Application configuration.
#[derive(Debug, Clone)]
pub struct Config {
    // ── server ───────────────────────────────────────────────────────
    pub listen_addr: String,
    pub recordings_dir: PathBuf,
    /// Rate-limit windows and other server-side state.
    pub state_dir: PathBuf,
    /// URL prefix under which stored recordings are served.
    pub public_path: String,
    pub max_file_size: u64,
    pub quota_bytes: u64,
    pub limits: ActionLimits,
    pub rate_store: RateStoreKind,
    pub session_ttl: Duration,

    // ── recorder ─────────────────────────────────────────────────────
    pub server_url: String,
    pub capture_width: u32,
    pub capture_height: u32,
    pub capture_fps: u32,
    pub video_bitrate: u64,
    /// Ask the platform for system/tab audio alongside the display.
    pub capture_audio: bool,
    pub microphone: bool,
    pub capture_mode: CaptureMode,
    pub auto_stop: Option<Duration>,
    /// Where the recorder keeps its local copy of every artifact.
    pub save_dir: PathBuf,
}

impl Config {
    /// Default config path.
    pub fn default_path() -> &'static str {
        "/etc/screenreel/screenreel.conf"
    }

    /// Location of the persisted rate-limit windows.
    pub fn rate_limit_file(&self) -> PathBuf {
        self.state_dir.join("rate_limit.json")
    }
}

impl Default for Config {
    fn default() -> Self {
        from_map(&HashMap::new())
    }
}

/// Parse a `KEY=VALUE` configuration file.
///
/// Lines starting with `#` are comments.  Values may be optionally
/// double-quoted.  Unknown keys are silently ignored.
pub fn load(path: &Path) -> Result<Config> {
    let text = std::fs::read_to_string(path)
        .with_context(|| format!("Cannot read config: {}", path.display()))?;

    let map = parse_conf(&text);
    info!("Loaded config from {}", path.display());
    Ok(from_map(&map))
}

fn from_map(map: &HashMap<String, String>) -> Config {
    let get = |key: &str| -> Option<String> { map.get(key).cloned().filter(|v| !v.is_empty()) };
    let get_u64 = |key: &str, default: u64| -> u64 {
        get(key).and_then(|v| v.parse().ok()).unwrap_or(default)
    };
    let get_u32 = |key: &str, default: u32| -> u32 {
        get(key).and_then(|v| v.parse().ok()).unwrap_or(default)
    };
    let get_bool = |key: &str| -> bool {
        get(key)
            .map(|v| v == "1" || v.eq_ignore_ascii_case("true"))
            .unwrap_or(false)
    };

    let defaults = ActionLimits::default();
    let limits = ActionLimits {
        upload: get_u32("UPLOAD_LIMIT", defaults.upload),
        delete: get_u32("DELETE_LIMIT", defaults.delete),
        rename: get_u32("RENAME_LIMIT", defaults.rename),
        clean: get_u32("CLEAN_LIMIT", defaults.clean),
        window: Duration::from_secs(get_u64("RATE_WINDOW_SECS", defaults.window.as_secs())),
    };

    let rate_store = match get("RATE_STORE").as_deref() {
        Some(v) if v.eq_ignore_ascii_case("memory") => RateStoreKind::Memory,
        _ => RateStoreKind::File,
    };

    let public_path = get("PUBLIC_PATH").unwrap_or_else(|| "/recordings".into());

    Config {
        listen_addr: get("LISTEN_ADDR").unwrap_or_else(|| "0.0.0.0:8090".into()),
        recordings_dir: PathBuf::from(
            get("RECORDINGS_DIR").unwrap_or_else(|| "./recordings".into()),
        ),
        state_dir: PathBuf::from(get("STATE_DIR").unwrap_or_else(|| "./state".into())),
        public_path: format!("/{}", public_path.trim_matches('/')),
        max_file_size: get_u64("MAX_FILE_SIZE", 500 * 1024 * 1024),
        quota_bytes: get_u64("QUOTA_BYTES", 10 * 1024 * 1024 * 1024),
        limits,
        rate_store,
        session_ttl: Duration::from_secs(get_u64("SESSION_TTL_SECS", 24 * 60 * 60)),

        server_url: get("SERVER_URL")
            .map(|u| u.trim_end_matches('/').to_string())
            .unwrap_or_else(|| "http://127.0.0.1:8090".into()),
        capture_width: get_u32("CAPTURE_WIDTH", 1920),
        capture_height: get_u32("CAPTURE_HEIGHT", 1080),
        capture_fps: get_u32("CAPTURE_FPS", 30),
        video_bitrate: get_u64("VIDEO_BITRATE", 5_000_000),
        capture_audio: get_bool("CAPTURE_AUDIO"),
        microphone: get_bool("MICROPHONE"),
        capture_mode: get("CAPTURE_MODE")
            .map(|v| CaptureMode::parse(&v))
            .unwrap_or_default(),
        auto_stop: get("AUTO_STOP_SECS")
            .and_then(|v| v.parse::<u64>().ok())
            .filter(|&secs| secs > 0)
            .map(Duration::from_secs),
        save_dir: PathBuf::from(get("SAVE_DIR").unwrap_or_else(|| "./downloads".into())),
    }
}

/// Parse `KEY=VALUE` lines into a map, stripping optional double-quotes.
fn parse_conf(text: &str) -> HashMap<String, String> {
    let mut map = HashMap::new();
    for line in text.lines() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        if let Some((key, val)) = line.split_once('=') {
            let key = key.trim();
            let val = val.trim().trim_matches('"');
            map.insert(key.to_string(), val.to_string());
        }
    }
    map
}

// ─── tests ───────────────────────────────────────────────────────────────
