//! Options resolution for the wrapper
//!
//! Configuration is layered from three sources, resolved once at startup and
//! immutable afterwards: the add-on options file, the secrets file (with
//! generate-on-first-use semantics), and the supervisor's host-info endpoint
//! for the timezone. Any source failing independently aborts startup; the
//! wrapped server is never spawned from partial configuration.

use crate::secrets::{Secrets, SECRETS_FILE_DEFAULT, SECRETS_FILE_ENV};
use anyhow::{bail, Context, Result};
use serde::de::Error as _;
use serde::{Deserialize, Deserializer};
use std::fmt;
use std::path::Path;
use tracing_subscriber::filter::LevelFilter;

/// Default location of the add-on options file
pub const OPTIONS_FILE_DEFAULT: &str = "/data/options.json";
/// Environment variable overriding the options file location
pub const OPTIONS_FILE_ENV: &str = "OPTIONS_FILE";
/// Default URL of the host-info endpoint
pub const HOST_INFO_URL_DEFAULT: &str = "http://supervisor/info";
/// Environment variable overriding the host-info URL
pub const HOST_INFO_URL_ENV: &str = "HA_INFO_URL";
/// Environment variable carrying the bearer token for the host-info endpoint
pub const SUPERVISOR_TOKEN_ENV: &str = "SUPERVISOR_TOKEN";

/// Timezone used when the host reports none, or one we cannot recognize
const TIMEZONE_FALLBACK: &str = "Etc/UTC";

/// Immutable configuration snapshot shared by every component.
#[derive(Debug, Clone)]
pub struct Options {
    /// Which bundled web UI the wrapped server should present
    pub gui: GuiFlavor,
    /// URL of an alternate server build to install before spawning
    pub custom_release: Option<String>,
    /// Log verbosity forwarded to the wrapped server
    pub log_level: ServerLogLevel,
    /// Log verbosity of the wrapper itself
    pub wrapper_log_level: WrapperLogLevel,
    /// Timezone reported by the host, validated against the IANA database
    pub timezone: String,
    /// Resolved secret bundle
    pub secrets: Secrets,
}

/// Shape of the options file. Every field is optional and defaults.
#[derive(Debug, Default, Deserialize)]
struct OptionsPayload {
    #[serde(default)]
    gui: GuiFlavor,
    #[serde(default)]
    custom_release: Option<String>,
    #[serde(default)]
    log_level: ServerLogLevel,
    #[serde(default)]
    wrapper_log_level: WrapperLogLevel,
}

#[derive(Debug, Deserialize)]
struct HostInfoPayload {
    #[serde(default)]
    data: HostInfoData,
}

#[derive(Debug, Default, Deserialize)]
struct HostInfoData {
    #[serde(default)]
    timezone: String,
}

impl Options {
    /// Resolve the full snapshot from the default locations, honoring the
    /// environment overrides.
    pub async fn load() -> Result<Self> {
        let options_path = env_or(OPTIONS_FILE_ENV, OPTIONS_FILE_DEFAULT);
        let secrets_path = env_or(SECRETS_FILE_ENV, SECRETS_FILE_DEFAULT);
        let info_url = env_or(HOST_INFO_URL_ENV, HOST_INFO_URL_DEFAULT);
        let token = std::env::var(SUPERVISOR_TOKEN_ENV).ok();

        Self::resolve(
            Path::new(&options_path),
            Path::new(&secrets_path),
            &info_url,
            token.as_deref(),
        )
        .await
    }

    /// Resolve the snapshot from explicit sources.
    pub async fn resolve(
        options_path: &Path,
        secrets_path: &Path,
        info_url: &str,
        token: Option<&str>,
    ) -> Result<Self> {
        let payload = read_options_file(options_path)?;
        let secrets = Secrets::load_or_generate(secrets_path)?;
        let timezone = fetch_timezone(info_url, token).await?;

        Ok(Self {
            gui: payload.gui,
            custom_release: payload.custom_release.filter(|url| !url.is_empty()),
            log_level: payload.log_level,
            wrapper_log_level: payload.wrapper_log_level,
            timezone,
            secrets,
        })
    }
}

fn env_or(var: &str, default: &str) -> String {
    match std::env::var(var) {
        Ok(v) if !v.is_empty() => v,
        _ => default.to_string(),
    }
}

fn read_options_file(path: &Path) -> Result<OptionsPayload> {
    let bytes = std::fs::read(path)
        .with_context(|| format!("could not open options file {}", path.display()))?;
    serde_json::from_slice(&bytes)
        .with_context(|| format!("could not decode options file {}", path.display()))
}

/// Query the host-info endpoint and resolve the timezone, falling back to
/// UTC when the host reports nothing usable.
async fn fetch_timezone(url: &str, token: Option<&str>) -> Result<String> {
    let client = reqwest::Client::new();
    let mut request = client.get(url);
    if let Some(token) = token.filter(|t| !t.is_empty()) {
        request = request.bearer_auth(token);
    }

    let response = request
        .send()
        .await
        .with_context(|| format!("could not query host info {url}"))?;

    let status = response.status();
    if !status.is_success() {
        bail!("could not query host info {url}: got {status}");
    }

    let payload: HostInfoPayload = response
        .json()
        .await
        .with_context(|| format!("could not decode host info from {url}"))?;

    Ok(resolve_timezone(&payload.data.timezone))
}

fn resolve_timezone(raw: &str) -> String {
    if raw.is_empty() || raw.parse::<chrono_tz::Tz>().is_err() {
        return TIMEZONE_FALLBACK.to_string();
    }
    raw.to_string()
}

/// Web UI flavor bundled with the wrapped server.
///
/// Anything that is not an exact (case-insensitive) known flavor falls back
/// to the default, so stale options files never block startup.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum GuiFlavor {
    #[default]
    Ngax,
    Ngclient,
}

impl GuiFlavor {
    fn from_name(name: &str) -> Self {
        if name.eq_ignore_ascii_case("ngclient") {
            GuiFlavor::Ngclient
        } else {
            GuiFlavor::Ngax
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            GuiFlavor::Ngax => "ngax",
            GuiFlavor::Ngclient => "ngclient",
        }
    }

    /// Path under which the selected UI serves its entry point.
    pub fn init_path(&self) -> String {
        format!("/{}/", self.as_str())
    }
}

impl<'de> Deserialize<'de> for GuiFlavor {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let name = String::deserialize(deserializer)?;
        Ok(GuiFlavor::from_name(&name))
    }
}

/// Log verbosity of the wrapped server, spelled the way its CLI expects.
///
/// Accepts the aliases operators actually write (`warn`, `debug`, `trace`);
/// unknown values coerce to the default rather than failing startup.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum ServerLogLevel {
    Error,
    Warning,
    #[default]
    Information,
    Verbose,
    Profiling,
}

impl ServerLogLevel {
    fn from_name(name: &str) -> Self {
        match name.to_ascii_lowercase().as_str() {
            "error" => ServerLogLevel::Error,
            "warning" | "warn" => ServerLogLevel::Warning,
            "verbose" | "debug" => ServerLogLevel::Verbose,
            "profiling" | "trace" => ServerLogLevel::Profiling,
            _ => ServerLogLevel::Information,
        }
    }
}

impl fmt::Display for ServerLogLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ServerLogLevel::Error => "Error",
            ServerLogLevel::Warning => "Warning",
            ServerLogLevel::Information => "Information",
            ServerLogLevel::Verbose => "Verbose",
            ServerLogLevel::Profiling => "Profiling",
        };
        f.write_str(name)
    }
}

impl<'de> Deserialize<'de> for ServerLogLevel {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let name = String::deserialize(deserializer)?;
        Ok(ServerLogLevel::from_name(&name))
    }
}

/// Log verbosity of the wrapper itself, mapped onto tracing level filters.
///
/// Unlike the server level this is strict: a typo here silences or floods
/// the only diagnostics channel the wrapper has, so unknown names are a
/// decode error.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum WrapperLogLevel {
    Trace,
    Debug,
    #[default]
    Info,
    Warn,
    Error,
}

impl WrapperLogLevel {
    pub fn level_filter(&self) -> LevelFilter {
        match self {
            WrapperLogLevel::Trace => LevelFilter::TRACE,
            WrapperLogLevel::Debug => LevelFilter::DEBUG,
            WrapperLogLevel::Info => LevelFilter::INFO,
            WrapperLogLevel::Warn => LevelFilter::WARN,
            WrapperLogLevel::Error => LevelFilter::ERROR,
        }
    }
}

impl<'de> Deserialize<'de> for WrapperLogLevel {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let name = String::deserialize(deserializer)?;
        match name.to_ascii_lowercase().as_str() {
            "trace" => Ok(WrapperLogLevel::Trace),
            "debug" => Ok(WrapperLogLevel::Debug),
            "info" => Ok(WrapperLogLevel::Info),
            "warn" | "warning" => Ok(WrapperLogLevel::Warn),
            "error" | "fatal" => Ok(WrapperLogLevel::Error),
            other => Err(D::Error::custom(format!(
                "unknown wrapper log level {other:?}"
            ))),
        }
    }
}
