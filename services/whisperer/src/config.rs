use std::collections::HashMap;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use discovery::{ServiceListing, Url};
use schema::SchemaVersionRange;

pub const CONFIG_PATH_ENV: &str = "WHISPER_CONFIG_PATH";
pub const DEFAULT_PORT: u16 = 9127;

#[derive(Debug, Clone, PartialEq)]
pub struct StartupError {
    pub code: &'static str,
    pub message: String,
}

impl std::fmt::Display for StartupError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.code, self.message)
    }
}

impl std::error::Error for StartupError {}

/// Where a collaborator service lives.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ServiceTarget {
    Static(Url),
    Discovered(String),
}

#[derive(Debug, Clone, PartialEq)]
pub struct DiscoveryConfig {
    pub coordinator: Url,
    pub poll_interval: Duration,
    pub publish: Option<ServiceListing>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct WhisperConfig {
    pub bind_addr: SocketAddr,
    pub http_workers: usize,
    pub schema_versions: SchemaVersionRange,
    pub store_path: Option<PathBuf>,
    pub store_pool_size: usize,
    pub store_timeout: Duration,
    pub upstream_timeout: Duration,
    pub shoreline: ServiceTarget,
    pub gatekeeper: ServiceTarget,
    pub seagull: ServiceTarget,
    pub discovery: Option<DiscoveryConfig>,
    pub server_name: String,
    pub server_secret: String,
    pub token_refresh: Duration,
}

impl WhisperConfig {
    /// Reads the optional config file named by `WHISPER_CONFIG_PATH`, then
    /// lets process environment variables override it.
    pub fn load() -> Result<Self, StartupError> {
        let mut merged = HashMap::new();

        if let Ok(config_path) = std::env::var(CONFIG_PATH_ENV) {
            let config_path = config_path.trim();
            if !config_path.is_empty() {
                merged.extend(parse_env_file(config_path)?);
            }
        }

        merged.extend(std::env::vars());

        Self::from_kv(&merged)
    }

    pub fn from_kv(kv: &HashMap<String, String>) -> Result<Self, StartupError> {
        let bind_addr = setting(
            kv,
            "WHISPER_BIND_ADDR",
            SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), DEFAULT_PORT),
            "a host:port socket address",
        )?;
        let http_workers: usize =
            setting(kv, "WHISPER_HTTP_WORKERS", default_http_workers(), "an integer")?.max(1);

        let schema_min: i64 = setting(kv, "WHISPER_SCHEMA_VERSION_MIN", 0, "an integer")?;
        let schema_max: i64 = setting(kv, "WHISPER_SCHEMA_VERSION_MAX", 99, "an integer")?;
        let schema_versions = SchemaVersionRange::new(schema_min, schema_max).ok_or_else(|| {
            invalid(format!(
                "WHISPER_SCHEMA_VERSION_MIN ({schema_min}) must not exceed WHISPER_SCHEMA_VERSION_MAX ({schema_max})"
            ))
        })?;

        let store_path = nonempty(kv, "WHISPER_STORE_PATH").map(PathBuf::from);
        let store_pool_size: usize = setting(kv, "WHISPER_STORE_POOL_SIZE", 16, "an integer")?;
        if store_pool_size == 0 {
            return Err(invalid("WHISPER_STORE_POOL_SIZE must be at least 1"));
        }
        let store_timeout = millis(kv, "WHISPER_STORE_TIMEOUT_MS", 30_000)?;
        let upstream_timeout = millis(kv, "WHISPER_UPSTREAM_TIMEOUT_MS", 5_000)?;

        let discovery = parse_discovery(kv)?;
        let discovery_enabled = discovery.is_some();
        let shoreline = parse_service_target(
            kv,
            "WHISPER_SHORELINE_URL",
            "WHISPER_SHORELINE_SERVICE",
            "shoreline",
            discovery_enabled,
        )?;
        let gatekeeper = parse_service_target(
            kv,
            "WHISPER_GATEKEEPER_URL",
            "WHISPER_GATEKEEPER_SERVICE",
            "gatekeeper",
            discovery_enabled,
        )?;
        let seagull = parse_service_target(
            kv,
            "WHISPER_SEAGULL_URL",
            "WHISPER_SEAGULL_SERVICE",
            "seagull",
            discovery_enabled,
        )?;

        let server_name = nonempty(kv, "WHISPER_SERVER_NAME")
            .unwrap_or("tide-whisperer")
            .to_string();
        let server_secret = nonempty(kv, "WHISPER_SERVER_SECRET")
            .map(str::to_string)
            .ok_or_else(|| StartupError {
                code: "ERR_MISSING_CONFIG",
                message: "WHISPER_SERVER_SECRET is required for server login".to_string(),
            })?;
        let token_refresh =
            Duration::from_secs(setting(kv, "WHISPER_TOKEN_REFRESH_SECS", 3_600, "an integer")?);

        Ok(Self {
            bind_addr,
            http_workers,
            schema_versions,
            store_path,
            store_pool_size,
            store_timeout,
            upstream_timeout,
            shoreline,
            gatekeeper,
            seagull,
            discovery,
            server_name,
            server_secret,
            token_refresh,
        })
    }
}

fn parse_discovery(kv: &HashMap<String, String>) -> Result<Option<DiscoveryConfig>, StartupError> {
    let Some(raw) = nonempty(kv, "WHISPER_DISCOVERY_URL") else {
        return Ok(None);
    };
    let coordinator = parse_url(raw, "WHISPER_DISCOVERY_URL")?;
    let poll_interval = millis(kv, "WHISPER_DISCOVERY_POLL_MS", 10_000)?.max(Duration::from_millis(1));
    let publish = nonempty(kv, "WHISPER_PUBLISH_HOST").map(|host| {
        let service = nonempty(kv, "WHISPER_SERVICE_NAME").unwrap_or("tide-whisperer");
        ServiceListing::new(service, host)
    });
    Ok(Some(DiscoveryConfig {
        coordinator,
        poll_interval,
        publish,
    }))
}

fn parse_service_target(
    kv: &HashMap<String, String>,
    url_key: &'static str,
    service_key: &'static str,
    default_service: &'static str,
    discovery_enabled: bool,
) -> Result<ServiceTarget, StartupError> {
    if let Some(raw) = nonempty(kv, url_key) {
        return parse_url(raw, url_key).map(ServiceTarget::Static);
    }
    if discovery_enabled {
        let service = nonempty(kv, service_key).unwrap_or(default_service);
        return Ok(ServiceTarget::Discovered(service.to_string()));
    }
    Err(invalid(format!(
        "{url_key} is required when WHISPER_DISCOVERY_URL is not set"
    )))
}

fn default_http_workers() -> usize {
    std::thread::available_parallelism()
        .map(|parallelism| parallelism.get().clamp(1, 32))
        .unwrap_or(4)
}

/// Reads `KEY=VALUE` lines. Blank lines and `#` comments are skipped and
/// values may be wrapped in matching quotes.
fn parse_env_file(path: &str) -> Result<HashMap<String, String>, StartupError> {
    let contents = std::fs::read_to_string(path).map_err(|err| StartupError {
        code: "ERR_CONFIG_FILE_READ",
        message: format!("cannot read {path}: {err}"),
    })?;

    contents
        .lines()
        .enumerate()
        .filter_map(|(idx, line)| env_entry(idx + 1, line.trim()).transpose())
        .collect()
}

fn env_entry(line_no: usize, line: &str) -> Result<Option<(String, String)>, StartupError> {
    if line.is_empty() || line.starts_with('#') {
        return Ok(None);
    }
    match line.split_once('=') {
        Some((key, value)) if !key.trim().is_empty() => Ok(Some((
            key.trim().to_string(),
            unquote(value.trim()).to_string(),
        ))),
        _ => Err(StartupError {
            code: "ERR_CONFIG_FILE_PARSE",
            message: format!("line {line_no}: expected KEY=VALUE"),
        }),
    }
}

fn unquote(value: &str) -> &str {
    ['"', '\'']
        .into_iter()
        .find_map(|quote| value.strip_prefix(quote)?.strip_suffix(quote))
        .unwrap_or(value)
}

fn nonempty<'a>(kv: &'a HashMap<String, String>, key: &str) -> Option<&'a str> {
    kv.get(key).map(|value| value.trim()).filter(|value| !value.is_empty())
}

fn invalid(message: impl Into<String>) -> StartupError {
    StartupError {
        code: "ERR_INVALID_CONFIG",
        message: message.into(),
    }
}

/// Parses `key` when set, otherwise returns `default`.
fn setting<T: FromStr>(
    kv: &HashMap<String, String>,
    key: &str,
    default: T,
    expected: &str,
) -> Result<T, StartupError> {
    nonempty(kv, key).map_or(Ok(default), |raw| {
        raw.parse()
            .map_err(|_| invalid(format!("{key} must be {expected}, got {raw:?}")))
    })
}

fn millis(kv: &HashMap<String, String>, key: &str, default: u64) -> Result<Duration, StartupError> {
    setting(kv, key, default, "a whole number of milliseconds").map(Duration::from_millis)
}

fn parse_url(raw: &str, key: &str) -> Result<Url, StartupError> {
    Url::parse(raw).map_err(|err| invalid(format!("{key} is not an absolute URL: {err}")))
}
