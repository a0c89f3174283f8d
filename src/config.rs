use std::time::Duration;

use anyhow::{Context, Result, bail};
use url::Url;

use crate::sse::ReconnectBackoff;

const DEFAULT_BASE_URL: &str = "http://localhost:8080";
const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(10);
const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);
const DEFAULT_NOTICE_TTL: Duration = Duration::from_secs(10);
const MIN_NOTICE_TTL: Duration = Duration::from_secs(5);
const MAX_NOTICE_TTL: Duration = Duration::from_secs(10);
const DEFAULT_RECONNECT_MAX_ATTEMPTS: usize = 6;
const DEFAULT_RECONNECT_BASE_DELAY: Duration = Duration::from_millis(250);
const DEFAULT_RECONNECT_MAX_DELAY: Duration = Duration::from_secs(8);

const CAPABILITIES_PATH: &str = "/api/v1/capabilities";
const TOOLS_STATE_PATH: &str = "/api/v1/capabilities/tools/state";
const RESOURCES_STATE_PATH: &str = "/api/v1/capabilities/resources/state";
const CAPABILITY_NOTIFICATIONS_PATH: &str = "/api/v1/capabilities/notifications";
const CODE_EXECUTION_PATH: &str = "/api/v2/code-execution-engine";
const TOOL_CALL_NOTIFICATIONS_PATH: &str = "/api/v2/tool-calls/notifications";
const NAMESPACES_PATH: &str = "/api/v1/namespaces/list";
const FORWARDS_PATH: &str = "/api/v1/forwards";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConsoleConfig {
    base_url: Url,
    pub request_timeout: Duration,
    pub connect_timeout: Duration,
    pub notice_ttl: Duration,
    pub reconnect: ReconnectBackoff,
}

impl Default for ConsoleConfig {
    fn default() -> Self {
        Self {
            base_url: Url::parse(DEFAULT_BASE_URL).expect("default base url should always parse"),
            request_timeout: DEFAULT_REQUEST_TIMEOUT,
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            notice_ttl: DEFAULT_NOTICE_TTL,
            reconnect: ReconnectBackoff::new(
                DEFAULT_RECONNECT_MAX_ATTEMPTS,
                DEFAULT_RECONNECT_BASE_DELAY,
                DEFAULT_RECONNECT_MAX_DELAY,
            ),
        }
    }
}

impl ConsoleConfig {
    pub fn new(base_url: &str) -> Result<Self> {
        Ok(Self {
            base_url: validate_base_url(base_url)?,
            ..Self::default()
        })
    }

    pub fn from_env() -> Result<Self> {
        let mut cfg = match env_string("CAPSYNC_BASE_URL")? {
            Some(raw) => Self::new(&raw).context("invalid CAPSYNC_BASE_URL")?,
            None => Self::default(),
        };

        if let Some(timeout) = env_duration_ms("CAPSYNC_REQUEST_TIMEOUT_MS")? {
            cfg.request_timeout = timeout;
        }
        if let Some(timeout) = env_duration_ms("CAPSYNC_CONNECT_TIMEOUT_MS")? {
            cfg.connect_timeout = timeout;
        }
        if let Some(ttl) = env_duration_ms("CAPSYNC_NOTICE_TTL_MS")? {
            cfg.notice_ttl = ttl;
        }

        let max_attempts = env_usize("CAPSYNC_RECONNECT_MAX_ATTEMPTS")?
            .unwrap_or(DEFAULT_RECONNECT_MAX_ATTEMPTS);
        let base_delay = env_duration_ms("CAPSYNC_RECONNECT_BASE_DELAY_MS")?
            .unwrap_or(DEFAULT_RECONNECT_BASE_DELAY);
        let max_delay = env_duration_ms("CAPSYNC_RECONNECT_MAX_DELAY_MS")?
            .unwrap_or(DEFAULT_RECONNECT_MAX_DELAY);
        cfg.reconnect = ReconnectBackoff::new(max_attempts, base_delay, max_delay);

        cfg.validate()?;
        Ok(cfg)
    }

    pub fn with_notice_ttl(mut self, ttl: Duration) -> Self {
        self.notice_ttl = ttl;
        self
    }

    pub fn with_reconnect(mut self, reconnect: ReconnectBackoff) -> Self {
        self.reconnect = reconnect;
        self
    }

    pub fn base_url(&self) -> &Url {
        &self.base_url
    }

    /// Visibility window for notices, clamped to the 5-10 second range.
    pub fn effective_notice_ttl(&self) -> Duration {
        self.notice_ttl.clamp(MIN_NOTICE_TTL, MAX_NOTICE_TTL)
    }

    pub fn capabilities_url(&self) -> String {
        self.endpoint(CAPABILITIES_PATH)
    }

    pub fn tools_state_url(&self) -> String {
        self.endpoint(TOOLS_STATE_PATH)
    }

    pub fn resources_state_url(&self) -> String {
        self.endpoint(RESOURCES_STATE_PATH)
    }

    pub fn capability_notifications_url(&self) -> String {
        self.endpoint(CAPABILITY_NOTIFICATIONS_PATH)
    }

    pub fn code_execution_url(&self, engine_type: &str, language: &str) -> String {
        format!(
            "{}/{}/{}",
            self.endpoint(CODE_EXECUTION_PATH),
            engine_type.trim(),
            language.trim()
        )
    }

    pub fn tool_call_notifications_url(&self, connection_id: Option<&str>) -> String {
        match connection_id.map(str::trim).filter(|id| !id.is_empty()) {
            Some(id) => format!("{}/{id}", self.endpoint(TOOL_CALL_NOTIFICATIONS_PATH)),
            None => self.endpoint(TOOL_CALL_NOTIFICATIONS_PATH),
        }
    }

    pub fn namespaces_url(&self) -> String {
        self.endpoint(NAMESPACES_PATH)
    }

    pub fn forwards_url(&self) -> String {
        self.endpoint(FORWARDS_PATH)
    }

    /// Resolves a server-provided stream URL, which may be absolute or
    /// relative to the router base URL.
    pub fn resolve_stream_url(&self, stream_url: &str) -> Result<String> {
        let stream_url = stream_url.trim();
        if stream_url.starts_with("http://") || stream_url.starts_with("https://") {
            let parsed =
                Url::parse(stream_url).with_context(|| format!("invalid stream url '{stream_url}'"))?;
            return Ok(parsed.to_string());
        }
        let resolved = self
            .base_url
            .join(stream_url)
            .with_context(|| format!("cannot resolve stream url '{stream_url}'"))?;
        Ok(resolved.to_string())
    }

    fn endpoint(&self, path: &str) -> String {
        format!("{}{path}", self.base_url.as_str().trim_end_matches('/'))
    }

    fn validate(&self) -> Result<()> {
        if self.request_timeout.is_zero() {
            bail!("request timeout must be greater than zero");
        }
        if self.connect_timeout.is_zero() {
            bail!("connect timeout must be greater than zero");
        }
        if self.reconnect.base_delay() > self.reconnect.max_delay() {
            bail!("reconnect base delay cannot exceed reconnect max delay");
        }
        Ok(())
    }
}

fn validate_base_url(raw: &str) -> Result<Url> {
    let raw = raw.trim();
    if raw.is_empty() {
        bail!("base url cannot be empty");
    }

    let parsed = Url::parse(raw).with_context(|| format!("invalid base url '{raw}'"))?;
    match parsed.scheme() {
        "http" | "https" => {}
        other => bail!("unsupported base url scheme '{other}', expected http/https"),
    }
    if parsed.host_str().is_none() {
        bail!("base url must include a host");
    }

    Ok(parsed)
}

fn env_string(key: &str) -> Result<Option<String>> {
    match std::env::var(key) {
        Ok(value) if value.trim().is_empty() => Ok(None),
        Ok(value) => Ok(Some(value)),
        Err(std::env::VarError::NotPresent) => Ok(None),
        Err(std::env::VarError::NotUnicode(_)) => bail!("{key} must be valid UTF-8"),
    }
}

fn env_usize(key: &str) -> Result<Option<usize>> {
    let Some(raw) = env_string(key)? else {
        return Ok(None);
    };
    raw.trim()
        .parse::<usize>()
        .map(Some)
        .with_context(|| format!("invalid {key} value '{raw}', expected a non-negative integer"))
}

fn env_duration_ms(key: &str) -> Result<Option<Duration>> {
    let Some(raw) = env_string(key)? else {
        return Ok(None);
    };
    raw.trim()
        .parse::<u64>()
        .map(|ms| Some(Duration::from_millis(ms)))
        .with_context(|| format!("invalid {key} value '{raw}', expected milliseconds"))
}
