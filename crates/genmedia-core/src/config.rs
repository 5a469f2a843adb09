//! Runtime configuration, loaded from environment variables once at startup.
//!
//! Components never read the environment themselves; the binary builds a
//! [`Config`] and hands each component the values it needs.

use std::path::{Path, PathBuf};
use std::time::Duration;

use strum::{AsRefStr, Display, EnumString};

pub const DEFAULT_BASE_URL: &str = "https://generativelanguage.googleapis.com/v1beta";
pub const DEFAULT_VIDEO_MODEL: &str = "veo-3.1-generate-preview";
pub const DEFAULT_IMAGE_MODEL: &str = "gemini-2.5-flash-image";

/// What to do when the dedup lock cannot be obtained.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Display, EnumString, AsRefStr)]
#[strum(serialize_all = "kebab-case", ascii_case_insensitive)]
pub enum LockPolicy {
    /// Proceed without exclusivity and accept possible duplicate work.
    #[default]
    FailOpen,
    /// Reject the request with `LockUnavailable`.
    FailClosed,
}

/// When redirect hops receive the provider API key as a header.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Display, EnumString, AsRefStr)]
#[strum(serialize_all = "kebab-case", ascii_case_insensitive)]
pub enum RedirectCredentials {
    /// Only hops on the provider's own host.
    #[default]
    SameHost,
    /// Every hop, including third-party storage hosts.
    Always,
    /// No hop after the first request.
    Never,
}

/// Runtime configuration for the generation core.
///
/// Every field except the API key has a default.
#[derive(Debug, Clone)]
pub struct Config {
    /// Provider API key (`GEMINI_API_KEY`). Required for generation only.
    pub api_key: Option<String>,

    /// Provider API root, without trailing slash.
    pub base_url: String,

    pub video_model: String,
    pub image_model: String,

    /// Directory relative local source paths resolve against.
    pub media_root: PathBuf,

    /// Directory artifacts are stored in.
    pub store_root: PathBuf,

    /// Directory holding lock files shared between processes.
    pub lock_dir: PathBuf,

    pub lock_ttl: Duration,
    pub lock_retries: u32,
    pub lock_retry_interval: Duration,
    pub lock_policy: LockPolicy,

    /// Timeout for the submit call and for remote source downloads.
    pub submit_timeout: Duration,
    pub poll_interval: Duration,
    pub poll_max_wait: Duration,
    pub download_timeout: Duration,

    pub max_redirects: usize,
    pub redirect_credentials: RedirectCredentials,

    /// Reject downloads whose magic bytes contradict the expected type.
    pub verify_signature: bool,

    /// `tracing` filter string, e.g. `"info"` or `"debug,hyper=warn"`.
    pub log_level: String,

    /// When `true`, emit log records as newline-delimited JSON.
    pub log_json: bool,
}

impl Default for Config {
    fn default() -> Self {
        let store_root = PathBuf::from("pub/media/genai");
        Self {
            api_key: None,
            base_url: DEFAULT_BASE_URL.to_owned(),
            video_model: DEFAULT_VIDEO_MODEL.to_owned(),
            image_model: DEFAULT_IMAGE_MODEL.to_owned(),
            media_root: PathBuf::from("pub/media"),
            lock_dir: store_root.join(".locks"),
            store_root,
            lock_ttl: Duration::from_secs(30),
            lock_retries: 3,
            lock_retry_interval: Duration::from_millis(1000),
            lock_policy: LockPolicy::FailOpen,
            submit_timeout: Duration::from_secs(30),
            poll_interval: Duration::from_secs(10),
            poll_max_wait: Duration::from_secs(300),
            download_timeout: Duration::from_secs(300),
            max_redirects: 5,
            redirect_credentials: RedirectCredentials::SameHost,
            verify_signature: true,
            log_level: "info".to_owned(),
            log_json: false,
        }
    }
}

impl Config {
    /// Build [`Config`] from environment variables, falling back to defaults.
    pub fn from_env() -> Self {
        let defaults = Self::default();
        let store_root = path_env("GENMEDIA_STORE_ROOT", &defaults.store_root);
        let lock_dir = path_env("GENMEDIA_LOCK_DIR", &store_root.join(".locks"));
        let image_model = std::env::var("GENMEDIA_IMAGE_MODEL")
            .or_else(|_| std::env::var("MODEL_NAME"))
            .unwrap_or(defaults.image_model);

        Self {
            api_key: std::env::var("GEMINI_API_KEY").ok().filter(|k| !k.trim().is_empty()),
            base_url: env_or("GOOGLE_API_DOMAIN", DEFAULT_BASE_URL)
                .trim_end_matches('/')
                .to_owned(),
            video_model: env_or("GENMEDIA_VIDEO_MODEL", DEFAULT_VIDEO_MODEL),
            image_model,
            media_root: path_env("GENMEDIA_MEDIA_ROOT", &defaults.media_root),
            store_root,
            lock_dir,
            lock_ttl: secs_env("GENMEDIA_LOCK_TTL_SECS", defaults.lock_ttl),
            lock_retries: parse_env("GENMEDIA_LOCK_RETRIES", defaults.lock_retries),
            lock_retry_interval: Duration::from_millis(parse_env(
                "GENMEDIA_LOCK_RETRY_INTERVAL_MS",
                1000,
            )),
            lock_policy: parse_env("GENMEDIA_LOCK_POLICY", defaults.lock_policy),
            submit_timeout: secs_env("GENMEDIA_SUBMIT_TIMEOUT_SECS", defaults.submit_timeout),
            poll_interval: secs_env("GENMEDIA_POLL_INTERVAL_SECS", defaults.poll_interval),
            poll_max_wait: secs_env("GENMEDIA_POLL_MAX_WAIT_SECS", defaults.poll_max_wait),
            download_timeout: secs_env(
                "GENMEDIA_DOWNLOAD_TIMEOUT_SECS",
                defaults.download_timeout,
            ),
            max_redirects: parse_env("GENMEDIA_MAX_REDIRECTS", defaults.max_redirects),
            redirect_credentials: parse_env(
                "GENMEDIA_REDIRECT_CREDENTIALS",
                defaults.redirect_credentials,
            ),
            verify_signature: bool_env("GENMEDIA_VERIFY_SIGNATURE", true),
            log_level: env_or("GENMEDIA_LOG", "info"),
            log_json: bool_env("GENMEDIA_LOG_JSON", false),
        }
    }

    /// Lock TTL for provider-backed generation: long enough to outlive the
    /// longest legal job.
    pub fn generation_lock_ttl(&self) -> Duration {
        self.poll_max_wait + self.submit_timeout + self.download_timeout
    }
}

// ── private helpers ──────────────────────────────────────────────────────────

fn env_or(key: &str, default: &str) -> String {
    std::env::var(key).unwrap_or_else(|_| default.to_owned())
}

fn parse_env<T: std::str::FromStr>(key: &str, default: T) -> T {
    std::env::var(key)
        .ok()
        .and_then(|v| v.trim().parse().ok())
        .unwrap_or(default)
}

fn secs_env(key: &str, default: Duration) -> Duration {
    Duration::from_secs(parse_env(key, default.as_secs()))
}

fn bool_env(key: &str, default: bool) -> bool {
    std::env::var(key)
        .map(|v| v == "1" || v.eq_ignore_ascii_case("true"))
        .unwrap_or(default)
}

fn path_env(key: &str, default: &Path) -> PathBuf {
    std::env::var_os(key)
        .map(PathBuf::from)
        .unwrap_or_else(|| default.to_path_buf())
}
