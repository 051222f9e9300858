//! Configuration types for token-exchange-gateway.
//!
//! Config is loaded once at startup from a TOML file and validated before the
//! server opens any ports. Invalid configs are rejected with a clear error
//! rather than silently falling back to defaults.
//!
//! # Example
//! ```toml
//! [gateway]
//! listen_port = 8080
//!
//! [auth]
//! verification_url = "http://users-api:8000/verify"
//! production       = true
//!
//! [forward]
//! base_url = "http://protected-app:3000"
//! ```

use std::path::Path;

use anyhow::Context;
use reqwest::Url;
use serde::{Deserialize, Serialize};

use crate::error::ConfigError;

/// Top-level gateway configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Config {
    #[serde(default)]
    pub gateway: GatewayConfig,

    /// Settings for the token-exchange filter itself.
    pub auth: FilterConfig,

    /// The protected origin that verified requests are proxied to.
    pub forward: ForwardConfig,
}

impl Config {
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let content =
            std::fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))?;
        let config: Self = toml::from_str(&content).context("parsing config TOML")?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> anyhow::Result<()> {
        self.auth.validate().context("invalid [auth] section")?;

        let origin = Url::parse(&self.forward.base_url)
            .with_context(|| format!("[forward] base_url `{}` is not a valid URL", self.forward.base_url))?;
        anyhow::ensure!(
            matches!(origin.scheme(), "http" | "https"),
            "[forward] base_url `{}` must use http or https",
            self.forward.base_url
        );

        Ok(())
    }
}

/// Core gateway settings.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct GatewayConfig {
    /// Port the gateway listens on (default: 8080).
    #[serde(default = "defaults::listen_port")]
    pub listen_port: u16,

    /// Log level override (also controlled by `RUST_LOG` env var).
    #[serde(default)]
    pub log_level: Option<String>,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            listen_port: defaults::listen_port(),
            log_level: None,
        }
    }
}

/// Immutable settings for one [`TokenExchange`](crate::api::auth::TokenExchange)
/// instance.
///
/// Validated once at construction and shared read-only across every request
/// the instance handles.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct FilterConfig {
    /// Absolute URL of the introspection endpoint. Required.
    #[serde(default)]
    pub verification_url: String,

    /// When `false` the `test-token` bypass credential is honoured.
    #[serde(default)]
    pub production: bool,

    /// Per-attempt timeout for the verification call in milliseconds (default: 10 000).
    #[serde(default = "defaults::verify_timeout_ms")]
    pub timeout_ms: u64,

    /// Identity field promoted to its own `X-User-Id` header, if present.
    ///
    /// A convenience only: the full identity object always travels in
    /// `X-User-Info`. Set to an empty string to disable promotion.
    #[serde(default = "defaults::user_id_field")]
    pub user_id_field: Option<String>,
}

impl FilterConfig {
    /// Build a config with defaults for everything except the endpoint.
    pub fn new(verification_url: impl Into<String>) -> Self {
        Self {
            verification_url: verification_url.into(),
            production: false,
            timeout_ms: defaults::verify_timeout_ms(),
            user_id_field: defaults::user_id_field(),
        }
    }

    pub fn production(mut self, production: bool) -> Self {
        self.production = production;
        self
    }

    /// Check that the endpoint is present and parses as an absolute http(s) URL.
    pub fn validate(&self) -> Result<Url, ConfigError> {
        let raw = self.verification_url.trim();
        if raw.is_empty() {
            return Err(ConfigError::MissingVerificationUrl);
        }

        let url = Url::parse(raw).map_err(|e| ConfigError::InvalidVerificationUrl {
            url: raw.to_owned(),
            reason: e.to_string(),
        })?;

        if !matches!(url.scheme(), "http" | "https") {
            return Err(ConfigError::InvalidVerificationUrl {
                url: raw.to_owned(),
                reason: format!("unsupported scheme `{}`", url.scheme()),
            });
        }

        Ok(url)
    }

    /// The promoted identity field, with an empty name treated as disabled.
    pub fn user_id_field(&self) -> Option<&str> {
        self.user_id_field.as_deref().filter(|f| !f.is_empty())
    }
}

/// The origin behind the gateway.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ForwardConfig {
    /// Base URL requests are proxied to; the inbound path and query are appended.
    pub base_url: String,

    /// Request timeout in milliseconds (default: 30 000).
    #[serde(default = "defaults::forward_timeout_ms")]
    pub timeout_ms: u64,
}

mod defaults {
    pub fn listen_port() -> u16 { 8080 }
    pub fn verify_timeout_ms() -> u64 { 10_000 }
    pub fn forward_timeout_ms() -> u64 { 30_000 }
    pub fn user_id_field() -> Option<String> { Some("id".to_owned()) }
}

#[cfg(test)]
mod tests {
    use super::*;

    // -----------------------------------------------------------------------
    // Helpers
    // -----------------------------------------------------------------------

    fn minimal_config() -> Config {
        toml::from_str(
            r#"
            [auth]
            verification_url = "http://users-api/verify"

            [forward]
            base_url = "http://localhost:3000"
            "#,
        )
        .expect("minimal config should parse")
    }

    // -----------------------------------------------------------------------
    // Parsing & validation
    // -----------------------------------------------------------------------

    #[test]
    fn parse_example_config() {
        let content = include_str!("../config.example.toml");
        let config: Config = toml::from_str(content).expect("example config should parse");
        config.validate().expect("example config should be valid");
    }

    #[test]
    fn defaults_are_applied_when_sections_are_minimal() {
        let config = minimal_config();
        assert_eq!(config.gateway.listen_port, 8080);
        assert!(!config.auth.production);
        assert_eq!(config.auth.timeout_ms, 10_000);
        assert_eq!(config.auth.user_id_field(), Some("id"));
        assert_eq!(config.forward.timeout_ms, 30_000);
        config.validate().expect("minimal config should be valid");
    }

    #[test]
    fn validation_rejects_missing_verification_url() {
        let mut config = minimal_config();
        config.auth.verification_url = "   ".into();
        assert!(matches!(
            config.auth.validate(),
            Err(ConfigError::MissingVerificationUrl)
        ));
        assert!(config.validate().is_err());
    }

    #[test]
    fn validation_rejects_unparseable_verification_url() {
        let cfg = FilterConfig::new("not a url");
        let err = cfg.validate().unwrap_err();
        assert!(matches!(err, ConfigError::InvalidVerificationUrl { .. }));
        assert!(err.to_string().contains("not a url"), "error: {err}");
    }

    #[test]
    fn validation_rejects_non_http_scheme() {
        let cfg = FilterConfig::new("ftp://users-api/verify");
        assert!(matches!(
            cfg.validate(),
            Err(ConfigError::InvalidVerificationUrl { .. })
        ));
    }

    #[test]
    fn validation_rejects_bad_forward_url() {
        let mut config = minimal_config();
        config.forward.base_url = "localhost:3000/no-scheme".into();
        assert!(config.validate().is_err());
    }

    #[test]
    fn production_flag_deserializes() {
        let config: Config = toml::from_str(
            r#"
            [auth]
            verification_url = "https://users-api/verify"
            production = true
            [forward]
            base_url = "http://x"
            "#,
        )
        .unwrap();
        assert!(config.auth.production);
    }

    #[test]
    fn empty_user_id_field_disables_promotion() {
        let mut cfg = FilterConfig::new("http://x");
        cfg.user_id_field = Some(String::new());
        assert_eq!(cfg.user_id_field(), None);
        cfg.user_id_field = None;
        assert_eq!(cfg.user_id_field(), None);
    }
}
