//! Configuration loading, validation and constants.
//!
//! `AppConfig` mirrors the TOML file as written by operators. It is validated
//! once at startup into a `ServerIdentity`, the immutable view that every
//! listener, the agent channel and the scheduler are constructed from. Nothing
//! reads configuration after that point and nothing writes it.

use std::fmt;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use const_format::formatcp;
use http::Uri;
use serde::Deserialize;

// =============================================================================
// HTTP / TLS Constants
// =============================================================================

/// HSTS lifetime sent with every HTTP->HTTPS redirect (one year)
pub const HSTS_MAX_AGE_SECS: u32 = 31_536_000;

/// Pre-formatted Strict-Transport-Security header value
pub const STRICT_TRANSPORT_SECURITY: &str = formatcp!("max-age={}", HSTS_MAX_AGE_SECS);

/// ALPN protocols offered by the ACME TLS listener
pub const TLS_ALPN_PROTOCOLS: [&[u8]; 2] = [b"h2", b"http/1.1"];

/// How long listeners may drain in-flight requests after cancellation
pub const SHUTDOWN_GRACE_SECS: u64 = 30;

// =============================================================================
// Agent Channel Constants
// =============================================================================

/// Default lifetime of an issued agent access token (one hour)
pub const DEFAULT_TOKEN_TTL_SECS: u64 = 3600;

/// Maximum lifetime of an issued agent access token (30 days)
pub const MAX_TOKEN_TTL_SECS: u64 = 30 * 24 * 3600;

/// Default HTTP/2 and TCP keepalive interval on agent connections
pub const DEFAULT_KEEPALIVE_INTERVAL_SECS: u64 = 10;

/// Maximum concurrent HTTP/2 streams a single agent connection may open
pub const GRPC_MAX_CONCURRENT_STREAMS: u32 = 128;

/// Protocol version reported to agents by the Version RPC
pub const GRPC_PROTOCOL_VERSION: i32 = 1;

// =============================================================================
// Scheduler Constants
// =============================================================================

/// Default delay between scheduler runs
pub const DEFAULT_SCHEDULER_INTERVAL_SECS: u64 = 30;

// =============================================================================
// Default Paths and Strings
// =============================================================================

/// Default configuration file path
pub const DEFAULT_CONFIG_PATH: &str = "config/default.toml";

/// Default log filter when RUST_LOG is not set
pub const DEFAULT_LOG_FILTER: &str = "runway=info,tower_http=info";

/// Default log format (text or json)
pub const DEFAULT_LOG_FORMAT: &str = "text";

/// Default plain HTTP listener address
pub const DEFAULT_HTTP_ADDR: &str = "0.0.0.0:8000";

/// Default TLS listener address
pub const DEFAULT_TLS_ADDR: &str = "0.0.0.0:443";

/// Default agent channel address
pub const DEFAULT_GRPC_ADDR: &str = "0.0.0.0:9000";

/// Default directory for cached ACME account keys and certificates
pub const DEFAULT_ACME_CACHE_DIR: &str = "/var/lib/runway/acme";

/// Environment variable overriding `grpc.secret`
pub const ENV_GRPC_SECRET: &str = "RUNWAY_GRPC_SECRET";

/// Environment variable overriding `grpc.agent_secret`
pub const ENV_AGENT_SECRET: &str = "RUNWAY_AGENT_SECRET";

#[derive(Debug, Clone, Deserialize)]
pub struct AppConfig {
    /// Public identity and listener addresses
    pub server: ServerSection,
    /// TLS termination settings
    #[serde(default)]
    pub tls: TlsConfig,
    /// Agent channel settings
    pub grpc: GrpcConfig,
    #[serde(default)]
    pub scheduler: SchedulerConfig,
    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// `[server]` section
#[derive(Debug, Clone, Deserialize)]
pub struct ServerSection {
    /// Public URL in `<scheme>://<hostname>[/path]` form
    pub host: String,
    /// Path prefix the UI is served under; derived from `host` when unset
    pub root_path: Option<String>,
    #[serde(default = "ServerSection::default_addr")]
    pub addr: String,
    #[serde(default = "ServerSection::default_tls_addr")]
    pub tls_addr: String,
    /// Separate `/metrics` listener; disabled when unset
    pub metrics_addr: Option<String>,
}

impl ServerSection {
    fn default_addr() -> String {
        DEFAULT_HTTP_ADDR.to_string()
    }

    fn default_tls_addr() -> String {
        DEFAULT_TLS_ADDR.to_string()
    }
}

/// `[tls]` section
#[derive(Debug, Clone, Deserialize)]
pub struct TlsConfig {
    /// PEM certificate chain path
    pub cert: Option<String>,
    /// PEM private key path
    pub key: Option<String>,
    /// Obtain certificates automatically via ACME
    #[serde(default)]
    pub lets_encrypt: bool,
    /// ACME account contact email
    pub lets_encrypt_email: Option<String>,
    #[serde(default = "TlsConfig::default_acme_cache_dir")]
    pub acme_cache_dir: String,
    /// Use the Let's Encrypt production directory (staging otherwise)
    #[serde(default = "TlsConfig::default_true")]
    pub acme_production: bool,
    /// Redirect plain HTTP to HTTPS when ACME is active
    #[serde(default = "TlsConfig::default_true")]
    pub redirect_http: bool,
}

impl Default for TlsConfig {
    fn default() -> Self {
        Self {
            cert: None,
            key: None,
            lets_encrypt: false,
            lets_encrypt_email: None,
            acme_cache_dir: Self::default_acme_cache_dir(),
            acme_production: true,
            redirect_http: true,
        }
    }
}

impl TlsConfig {
    fn default_acme_cache_dir() -> String {
        DEFAULT_ACME_CACHE_DIR.to_string()
    }

    fn default_true() -> bool {
        true
    }
}

/// `[grpc]` section
#[derive(Clone, Deserialize)]
pub struct GrpcConfig {
    #[serde(default = "GrpcConfig::default_addr")]
    pub addr: String,
    /// Secret used to sign and verify agent access tokens
    pub secret: Option<String>,
    /// Shared secret agents present to obtain an access token
    pub agent_secret: Option<String>,
    #[serde(default = "GrpcConfig::default_token_ttl")]
    pub token_ttl_seconds: u64,
    /// Interval of server-sent keepalive pings; 0 disables them
    #[serde(default = "GrpcConfig::default_keepalive_interval")]
    pub keepalive_interval_seconds: u64,
}

impl GrpcConfig {
    fn default_addr() -> String {
        DEFAULT_GRPC_ADDR.to_string()
    }

    fn default_token_ttl() -> u64 {
        DEFAULT_TOKEN_TTL_SECS
    }

    fn default_keepalive_interval() -> u64 {
        DEFAULT_KEEPALIVE_INTERVAL_SECS
    }
}

impl fmt::Debug for GrpcConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("GrpcConfig")
            .field("addr", &self.addr)
            .field("secret", &redacted(&self.secret))
            .field("agent_secret", &redacted(&self.agent_secret))
            .field("token_ttl_seconds", &self.token_ttl_seconds)
            .field("keepalive_interval_seconds", &self.keepalive_interval_seconds)
            .finish()
    }
}

fn redacted(secret: &Option<String>) -> &'static str {
    if secret.is_some() {
        "<redacted>"
    } else {
        "<unset>"
    }
}

/// `[scheduler]` section
///
/// Disabled unless `enabled = true` and a job is registered with the server.
#[derive(Debug, Clone, Deserialize)]
pub struct SchedulerConfig {
    #[serde(default = "SchedulerConfig::default_enabled")]
    pub enabled: bool,
    #[serde(default = "SchedulerConfig::default_interval")]
    pub interval_seconds: u64,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            interval_seconds: DEFAULT_SCHEDULER_INTERVAL_SECS,
        }
    }
}

impl SchedulerConfig {
    fn default_enabled() -> bool {
        false
    }

    fn default_interval() -> u64 {
        DEFAULT_SCHEDULER_INTERVAL_SECS
    }
}

/// Logging configuration
#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    /// Log format: "text" (human-readable, default) or "json" (structured)
    #[serde(default = "LoggingConfig::default_format")]
    pub format: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            format: DEFAULT_LOG_FORMAT.to_string(),
        }
    }
}

impl LoggingConfig {
    fn default_format() -> String {
        DEFAULT_LOG_FORMAT.to_string()
    }
}

impl AppConfig {
    /// Read and parse a TOML configuration file, applying environment overrides
    /// for secrets.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path)?;
        let mut config = Self::parse(&contents)?;
        config.apply_secret_overrides(|name| std::env::var(name).ok());
        Ok(config)
    }

    pub fn parse(contents: &str) -> Result<Self, ConfigError> {
        Ok(toml::from_str(contents)?)
    }

    /// Replace configured secrets with values from `lookup` when present.
    pub fn apply_secret_overrides<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(secret) = lookup(ENV_GRPC_SECRET).filter(|s| !s.is_empty()) {
            self.grpc.secret = Some(secret);
        }
        if let Some(secret) = lookup(ENV_AGENT_SECRET).filter(|s| !s.is_empty()) {
            self.grpc.agent_secret = Some(secret);
        }
    }

    /// Validate the configuration into the immutable identity used at runtime.
    ///
    /// Runs before any socket is opened; every error here is fatal at startup.
    pub fn identity(&self) -> Result<ServerIdentity, ConfigError> {
        let public = PublicUrl::parse(&self.server.host)?;
        if public.is_localhost() {
            tracing::warn!(
                host = %public.url,
                "server.host should probably be publicly accessible (not localhost)"
            );
        }

        let root_path = normalize_root_path(
            self.server
                .root_path
                .as_deref()
                .unwrap_or(public.path.as_str()),
        );
        validate_root_path(&root_path)?;

        let tls = TlsSettings {
            cert: non_empty(&self.tls.cert).map(PathBuf::from),
            key: non_empty(&self.tls.key).map(PathBuf::from),
            acme: self.tls.lets_encrypt,
            acme_email: non_empty(&self.tls.lets_encrypt_email).map(str::to_string),
            acme_cache_dir: PathBuf::from(&self.tls.acme_cache_dir),
            acme_production: self.tls.acme_production,
            redirect_http: self.tls.redirect_http,
        };
        if tls.cert.is_some() != tls.key.is_some() {
            return Err(ConfigError::Validation(
                "tls.cert and tls.key must be configured together".to_string(),
            ));
        }

        let secret = non_empty(&self.grpc.secret).ok_or_else(|| {
            ConfigError::Validation(format!(
                "grpc.secret is required (or set {})",
                ENV_GRPC_SECRET
            ))
        })?;
        let agent_secret = non_empty(&self.grpc.agent_secret).ok_or_else(|| {
            ConfigError::Validation(format!(
                "grpc.agent_secret is required (or set {})",
                ENV_AGENT_SECRET
            ))
        })?;

        let token_ttl = self.grpc.token_ttl_seconds;
        if !(1..=MAX_TOKEN_TTL_SECS).contains(&token_ttl) {
            return Err(ConfigError::Validation(format!(
                "grpc.token_ttl_seconds must be between 1 and {}, got {}",
                MAX_TOKEN_TTL_SECS, token_ttl
            )));
        }

        let scheduler = self
            .scheduler
            .enabled
            .then(|| Duration::from_secs(self.scheduler.interval_seconds.max(1)));

        Ok(ServerIdentity {
            public,
            root_path,
            http_addr: parse_addr("server.addr", &self.server.addr)?,
            tls_addr: parse_addr("server.tls_addr", &self.server.tls_addr)?,
            metrics_addr: non_empty(&self.server.metrics_addr)
                .map(|addr| parse_addr("server.metrics_addr", addr))
                .transpose()?,
            tls,
            grpc: GrpcSettings {
                addr: parse_addr("grpc.addr", &self.grpc.addr)?,
                secret: secret.to_string(),
                agent_secret: agent_secret.to_string(),
                token_ttl: Duration::from_secs(token_ttl),
                keepalive_interval: Duration::from_secs(self.grpc.keepalive_interval_seconds),
            },
            scheduler,
        })
    }
}

/// Validated, immutable server configuration shared by every task.
#[derive(Debug, Clone)]
pub struct ServerIdentity {
    pub public: PublicUrl,
    /// Normalized path prefix: empty or `/segment[/segment]` without trailing slash
    pub root_path: String,
    pub http_addr: SocketAddr,
    pub tls_addr: SocketAddr,
    pub metrics_addr: Option<SocketAddr>,
    pub tls: TlsSettings,
    pub grpc: GrpcSettings,
    /// Scheduler interval, `None` when the scheduler is disabled
    pub scheduler: Option<Duration>,
}

/// The parsed public URL of the server.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PublicUrl {
    /// Full URL with any trailing slash removed
    pub url: String,
    pub scheme: String,
    /// Host and optional port, as used in redirect targets
    pub authority: String,
    /// Host name only, as used for certificate acquisition
    pub hostname: String,
    pub path: String,
}

impl PublicUrl {
    pub fn parse(host: &str) -> Result<Self, ConfigError> {
        if host.is_empty() {
            return Err(ConfigError::Validation(
                "server.host is not properly configured".to_string(),
            ));
        }
        if !host.contains("://") {
            return Err(ConfigError::Validation(
                "server.host must be <scheme>://<hostname> format".to_string(),
            ));
        }

        let url = host.strip_suffix('/').unwrap_or(host);
        let uri: Uri = url
            .parse()
            .map_err(|e| ConfigError::Validation(format!("could not parse server.host: {}", e)))?;
        let (Some(scheme), Some(authority)) = (uri.scheme_str(), uri.authority()) else {
            return Err(ConfigError::Validation(format!(
                "server.host '{}' has no scheme or host",
                host
            )));
        };

        Ok(Self {
            url: url.to_string(),
            scheme: scheme.to_string(),
            authority: authority.as_str().to_string(),
            hostname: authority.host().to_string(),
            path: uri.path().to_string(),
        })
    }

    pub fn is_localhost(&self) -> bool {
        self.hostname == "localhost"
    }
}

/// TLS material and ACME settings.
#[derive(Debug, Clone)]
pub struct TlsSettings {
    pub cert: Option<PathBuf>,
    pub key: Option<PathBuf>,
    pub acme: bool,
    pub acme_email: Option<String>,
    pub acme_cache_dir: PathBuf,
    pub acme_production: bool,
    pub redirect_http: bool,
}

/// Agent channel settings.
#[derive(Clone)]
pub struct GrpcSettings {
    pub addr: SocketAddr,
    pub secret: String,
    pub agent_secret: String,
    pub token_ttl: Duration,
    /// Server keepalive ping and TCP keepalive interval, zero when disabled
    pub keepalive_interval: Duration,
}

impl fmt::Debug for GrpcSettings {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("GrpcSettings")
            .field("addr", &self.addr)
            .field("secret", &"<redacted>")
            .field("agent_secret", &"<redacted>")
            .field("token_ttl", &self.token_ttl)
            .field("keepalive_interval", &self.keepalive_interval)
            .finish()
    }
}

/// Normalize a root path: strip trailing slashes and ensure a leading one.
pub fn normalize_root_path(path: &str) -> String {
    let path = path.trim_end_matches('/');
    if path.is_empty() || path.starts_with('/') {
        path.to_string()
    } else {
        format!("/{}", path)
    }
}

/// Reject root paths the web router cannot be nested under.
fn validate_root_path(path: &str) -> Result<(), ConfigError> {
    let invalid = path.contains("//")
        || path.chars().any(|c| {
            matches!(c, '*' | '{' | '}' | '?' | '#') || c.is_whitespace() || c.is_control()
        });
    if invalid {
        return Err(ConfigError::Validation(format!(
            "server.root_path '{}' is not a valid path prefix",
            path
        )));
    }
    Ok(())
}

fn non_empty(value: &Option<String>) -> Option<&str> {
    value.as_deref().map(str::trim).filter(|s| !s.is_empty())
}

fn parse_addr(field: &str, value: &str) -> Result<SocketAddr, ConfigError> {
    value
        .parse()
        .map_err(|e| ConfigError::Validation(format!("invalid {} '{}': {}", field, value, e)))
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    Io(#[from] std::io::Error),
    #[error("Failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("Configuration error: {0}")]
    Validation(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    const MINIMAL: &str = r#"
        [server]
        host = "https://ci.example.com"

        [grpc]
        secret = "signing-secret"
        agent_secret = "agent-secret"
    "#;

    fn with_host(host: &str) -> AppConfig {
        let mut config = AppConfig::parse(MINIMAL).unwrap();
        config.server.host = host.to_string();
        config
    }

    #[test]
    fn test_minimal_config_uses_defaults() {
        let identity = AppConfig::parse(MINIMAL).unwrap().identity().unwrap();
        assert_eq!(identity.public.authority, "ci.example.com");
        assert_eq!(identity.root_path, "");
        assert_eq!(identity.http_addr, DEFAULT_HTTP_ADDR.parse::<SocketAddr>().unwrap());
        assert_eq!(identity.tls_addr, DEFAULT_TLS_ADDR.parse::<SocketAddr>().unwrap());
        assert_eq!(identity.grpc.addr, DEFAULT_GRPC_ADDR.parse::<SocketAddr>().unwrap());
        assert!(identity.metrics_addr.is_none());
        assert_eq!(identity.grpc.token_ttl, Duration::from_secs(DEFAULT_TOKEN_TTL_SECS));
        assert_eq!(
            identity.grpc.keepalive_interval,
            Duration::from_secs(DEFAULT_KEEPALIVE_INTERVAL_SECS)
        );
        assert!(identity.scheduler.is_none());
        assert!(identity.tls.redirect_http);
    }

    #[test]
    fn test_host_without_scheme_is_rejected() {
        let err = with_host("ci.example.com").identity().unwrap_err();
        assert!(err.to_string().contains("<scheme>://<hostname>"));
    }

    #[test]
    fn test_empty_host_is_rejected() {
        assert!(matches!(
            with_host("").identity(),
            Err(ConfigError::Validation(_))
        ));
    }

    #[test]
    fn test_unparseable_host_is_rejected() {
        assert!(with_host("https://ci example com").identity().is_err());
    }

    #[test]
    fn test_host_trailing_slash_is_trimmed() {
        let identity = with_host("https://ci.example.com:8443/").identity().unwrap();
        assert_eq!(identity.public.url, "https://ci.example.com:8443");
        assert_eq!(identity.public.authority, "ci.example.com:8443");
        assert_eq!(identity.public.hostname, "ci.example.com");
    }

    #[test]
    fn test_root_path_derived_from_host() {
        let identity = with_host("https://example.com/ci/").identity().unwrap();
        assert_eq!(identity.root_path, "/ci");
    }

    #[test]
    fn test_explicit_root_path_is_normalized() {
        let mut config = with_host("https://example.com/ignored");
        config.server.root_path = Some("woodshed/".to_string());
        assert_eq!(config.identity().unwrap().root_path, "/woodshed");
    }

    #[test]
    fn test_normalize_root_path() {
        assert_eq!(normalize_root_path(""), "");
        assert_eq!(normalize_root_path("/"), "");
        assert_eq!(normalize_root_path("/ci"), "/ci");
        assert_eq!(normalize_root_path("ci/"), "/ci");
        assert_eq!(normalize_root_path("//"), "");
        assert_eq!(normalize_root_path("/ci//"), "/ci");
    }

    #[test]
    fn test_repeated_slashes_in_root_path_collapse() {
        let mut config = with_host("https://ci.example.com");
        config.server.root_path = Some("//".to_string());
        assert_eq!(config.identity().unwrap().root_path, "");

        config.server.root_path = Some("/ci//".to_string());
        assert_eq!(config.identity().unwrap().root_path, "/ci");
    }

    #[test]
    fn test_unmountable_root_path_is_rejected() {
        for path in ["/ci/*rest", "/ci/{id}", "//ci", "/ci//builds", "/c i", "/ci?x=1"] {
            let mut config = with_host("https://ci.example.com");
            config.server.root_path = Some(path.to_string());
            assert!(
                matches!(config.identity(), Err(ConfigError::Validation(msg)) if msg.contains("root_path")),
                "{} was accepted",
                path
            );
        }
    }

    #[test]
    fn test_cert_without_key_is_rejected() {
        let mut config = with_host("https://ci.example.com");
        config.tls.cert = Some("/etc/runway/cert.pem".to_string());
        assert!(matches!(
            config.identity(),
            Err(ConfigError::Validation(msg)) if msg.contains("together")
        ));
    }

    #[test]
    fn test_missing_secret_is_rejected() {
        let mut config = with_host("https://ci.example.com");
        config.grpc.secret = Some("   ".to_string());
        assert!(config.identity().is_err());
    }

    #[test]
    fn test_invalid_listener_address_is_rejected() {
        let mut config = with_host("https://ci.example.com");
        config.server.metrics_addr = Some(":9001".to_string());
        let err = config.identity().unwrap_err();
        assert!(err.to_string().contains("server.metrics_addr"));
    }

    #[test]
    fn test_secret_overrides_from_environment() {
        let mut config = with_host("https://ci.example.com");
        config.apply_secret_overrides(|name| match name {
            ENV_GRPC_SECRET => Some("from-env".to_string()),
            ENV_AGENT_SECRET => Some(String::new()),
            _ => None,
        });
        assert_eq!(config.grpc.secret.as_deref(), Some("from-env"));
        assert_eq!(config.grpc.agent_secret.as_deref(), Some("agent-secret"));
    }

    #[test]
    fn test_debug_output_redacts_secrets() {
        let identity = with_host("https://ci.example.com").identity().unwrap();
        let rendered = format!("{:?}", identity);
        assert!(!rendered.contains("signing-secret"));
        assert!(!rendered.contains("agent-secret"));
        assert!(rendered.contains("<redacted>"));
    }

    #[test]
    fn test_token_ttl_out_of_range_is_rejected() {
        for ttl in [0, MAX_TOKEN_TTL_SECS + 1, u64::MAX] {
            let mut config = with_host("https://ci.example.com");
            config.grpc.token_ttl_seconds = ttl;
            assert!(
                matches!(config.identity(), Err(ConfigError::Validation(msg)) if msg.contains("token_ttl_seconds")),
                "ttl {} was accepted",
                ttl
            );
        }

        let mut config = with_host("https://ci.example.com");
        config.grpc.token_ttl_seconds = MAX_TOKEN_TTL_SECS;
        assert_eq!(
            config.identity().unwrap().grpc.token_ttl,
            Duration::from_secs(MAX_TOKEN_TTL_SECS)
        );
    }

    #[test]
    fn test_keepalive_interval_is_read_from_grpc_section() {
        let toml = MINIMAL.replace(
            r#"agent_secret = "agent-secret""#,
            "agent_secret = \"agent-secret\"\nkeepalive_interval_seconds = 0",
        );
        let identity = AppConfig::parse(&toml).unwrap().identity().unwrap();
        assert!(identity.grpc.keepalive_interval.is_zero());
    }

    #[test]
    fn test_scheduler_is_off_unless_enabled() {
        let toml = format!("{}\n[scheduler]\ninterval_seconds = 5\n", MINIMAL);
        let config = AppConfig::parse(&toml).unwrap();
        assert!(config.identity().unwrap().scheduler.is_none());

        let mut config = with_host("https://ci.example.com");
        config.scheduler.enabled = true;
        config.scheduler.interval_seconds = 5;
        assert_eq!(
            config.identity().unwrap().scheduler,
            Some(Duration::from_secs(5))
        );
    }
}
