//! Broker configuration.
//!
//! All tunables live in one immutable [`BrokerConfig`] constructed once at
//! startup (normally via [`BrokerConfig::from_env`]) and threaded explicitly
//! into each component's constructor. Components never read the environment
//! themselves, so tests can build isolated configurations literally.

use std::path::PathBuf;
use std::time::Duration;

/// Default VistA listener port.
pub const DEFAULT_PORT: u16 = 9430;

/// Default connect timeout.
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(8);

/// Default per-RPC read timeout.
pub const DEFAULT_RPC_TIMEOUT: Duration = Duration::from_secs(10);

/// Default idle window within which a ready session is reused without
/// re-authenticating.
pub const DEFAULT_IDLE_WINDOW: Duration = Duration::from_secs(300);

/// Default multi-part accumulation guard (512 KiB).
pub const DEFAULT_MULTIPART_MAX_BYTES: usize = 512 * 1024;

/// Immutable broker configuration.
#[derive(Debug, Clone)]
pub struct BrokerConfig {
    /// Target VistA host.
    pub host: String,
    /// Target VistA broker port.
    pub port: u16,
    /// Access code half of the sign-on credential pair.
    pub access_code: String,
    /// Verify code half of the sign-on credential pair.
    pub verify_code: String,
    /// Clinical context option name (empty skips context establishment).
    pub context: String,
    /// Experimental mode: real socket transport and live RPC attempts.
    /// When off, `call` serves deterministic mock data with no transport.
    pub experimental: bool,
    /// Frame outbound RPCs in the synthetic length-prefixed format.
    pub length_prefix: bool,
    /// Use the provisional XWB binary codec instead of the synthetic one.
    pub xwb_codec: bool,
    /// Route XWB decode through the header state machine.
    pub xwb_real_decode: bool,
    /// Use the strict two-byte start-marker header strategy.
    pub strict_header: bool,
    /// Socket connect timeout.
    pub connect_timeout: Duration,
    /// Per-RPC read timeout.
    pub rpc_timeout: Duration,
    /// Idle window for ready-session reuse.
    pub idle_window: Duration,
    /// Multi-part accumulation guard in bytes.
    pub multipart_max_bytes: usize,
    /// Capture the first inbound buffer (greeting banner) in memory.
    pub capture_greeting: bool,
    /// Keep a bounded rolling capture of inbound frame chunks.
    pub capture_frames: bool,
    /// Persist every send/receive as a redacted JSON artifact.
    pub capture_raw: bool,
    /// Directory for raw capture artifacts.
    pub capture_dir: PathBuf,
    /// Apply PHI redaction rules before any capture persistence.
    pub redact: bool,
    /// Operator-supplied extra redaction patterns.
    pub redact_extra: Vec<String>,
    /// Drop patient records whose DOB fails validation.
    pub strict_dob: bool,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            host: "localhost".to_string(),
            port: DEFAULT_PORT,
            access_code: "ACCESS".to_string(),
            verify_code: "VERIFY".to_string(),
            context: "OR CPRS GUI CHART".to_string(),
            experimental: true,
            length_prefix: true,
            xwb_codec: false,
            xwb_real_decode: false,
            strict_header: false,
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            rpc_timeout: DEFAULT_RPC_TIMEOUT,
            idle_window: DEFAULT_IDLE_WINDOW,
            multipart_max_bytes: DEFAULT_MULTIPART_MAX_BYTES,
            capture_greeting: false,
            capture_frames: false,
            capture_raw: false,
            capture_dir: PathBuf::from("./captures"),
            redact: false,
            redact_extra: Vec::new(),
            strict_dob: false,
        }
    }
}

impl BrokerConfig {
    /// Build a configuration from environment variables.
    ///
    /// Unset or unparseable values fall back to the defaults above.
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            host: env_string("VISTA_HOST", defaults.host),
            port: env_parse("VISTA_PORT", defaults.port),
            access_code: env_string("VISTA_ACCESS_CODE", defaults.access_code),
            verify_code: env_string("VISTA_VERIFY_CODE", defaults.verify_code),
            context: env_string("VISTA_CONTEXT", defaults.context),
            experimental: env_flag_default_on("VISTA_BROKER_EXPERIMENTAL"),
            length_prefix: env_flag_default_on("VISTA_BROKER_PHASE3_ENABLE"),
            xwb_codec: env_flag("VISTA_BROKER_XWB_ENABLE"),
            xwb_real_decode: env_flag("VISTA_BROKER_XWB_REAL_ENABLE"),
            strict_header: env_flag("VISTA_BROKER_XWB_REAL_STRICT"),
            connect_timeout: env_millis("VISTA_BROKER_CONNECT_TIMEOUT", defaults.connect_timeout),
            rpc_timeout: env_millis("VISTA_BROKER_RPC_TIMEOUT", defaults.rpc_timeout),
            idle_window: env_millis("VISTA_BROKER_IDLE_MS", defaults.idle_window),
            multipart_max_bytes: env_parse::<usize>("VISTA_BROKER_MULTIPART_MAX_KB", 512)
                .saturating_mul(1024),
            capture_greeting: env_flag("VISTA_BROKER_CAPTURE"),
            capture_frames: env_flag("VISTA_BROKER_FRAME_CAPTURE"),
            capture_raw: env_flag("VISTA_BROKER_CAPTURE_RAW"),
            capture_dir: PathBuf::from(env_string(
                "VISTA_BROKER_CAPTURE_DIR",
                "./captures".to_string(),
            )),
            redact: env_flag("VISTA_BROKER_CAPTURE_REDACT"),
            redact_extra: env_patterns("VISTA_BROKER_REDACT_EXTRA"),
            strict_dob: env_flag("VISTA_PARSE_STRICT_DOB"),
        }
    }
}

fn env_string(name: &str, default: String) -> String {
    std::env::var(name).ok().filter(|v| !v.is_empty()).unwrap_or(default)
}

fn env_parse<T: std::str::FromStr>(name: &str, default: T) -> T {
    std::env::var(name)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

/// Flag that is off unless explicitly set to `true`.
fn env_flag(name: &str) -> bool {
    std::env::var(name).map(|v| v == "true").unwrap_or(false)
}

/// Flag that is on unless explicitly set to `false`.
fn env_flag_default_on(name: &str) -> bool {
    std::env::var(name).map(|v| v != "false").unwrap_or(true)
}

fn env_millis(name: &str, default: Duration) -> Duration {
    std::env::var(name)
        .ok()
        .and_then(|v| v.parse::<u64>().ok())
        .map(Duration::from_millis)
        .unwrap_or(default)
}

fn env_patterns(name: &str) -> Vec<String> {
    std::env::var(name)
        .map(|v| {
            v.split(';')
                .map(|s| s.trim().to_string())
                .filter(|s| !s.is_empty())
                .collect()
        })
        .unwrap_or_default()
}
