//! TOML config file loading, environment overrides and validation.

use anyhow::{bail, Context, Result};
use serde::Deserialize;
use std::path::Path;
use std::time::Duration;

// ---------------------------------------------------------------------------
// Config file structures
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Config {
    pub web_port: u16,
    pub db_url: String,
    pub api: ApiConfig,
    pub sms: SmsConfig,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ApiConfig {
    /// Telemetry API root; sensor ids are appended as a path segment.
    pub base_url: String,
    pub timeout_secs: u64,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct SmsConfig {
    /// HTTP SMS gateway endpoint. Unset means commands are only logged.
    pub gateway_url: Option<String>,
    pub gateway_token: Option<String>,
    pub timeout_secs: Option<u64>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            web_port: 8080,
            db_url: "sqlite:panel.db".into(),
            api: ApiConfig::default(),
            sms: SmsConfig::default(),
        }
    }
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            base_url: "https://api.example.com".into(),
            timeout_secs: 10,
        }
    }
}

impl ApiConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

impl SmsConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs.unwrap_or(15))
    }
}

// ---------------------------------------------------------------------------
// Validation
// ---------------------------------------------------------------------------

impl Config {
    /// Validate all settings. Returns `Ok(())` or an error describing every
    /// violation found (not just the first one).
    pub fn validate(&self) -> Result<()> {
        let mut errors: Vec<String> = Vec::new();

        if self.web_port == 0 {
            errors.push("web_port must be non-zero".into());
        }
        if !self.db_url.starts_with("sqlite:") {
            errors.push(format!("db_url '{}' is not a sqlite url", self.db_url));
        }

        let base = self.api.base_url.trim();
        if base.is_empty() {
            errors.push("api.base_url is empty".into());
        } else if !(base.starts_with("http://") || base.starts_with("https://")) {
            errors.push(format!("api.base_url '{base}' must start with http:// or https://"));
        }
        if self.api.timeout_secs == 0 {
            errors.push("api.timeout_secs must be positive".into());
        }

        if let Some(url) = self.sms.gateway_url.as_deref().map(str::trim) {
            if !url.is_empty() && !(url.starts_with("http://") || url.starts_with("https://")) {
                errors.push(format!("sms.gateway_url '{url}' must start with http:// or https://"));
            }
        }
        if self.sms.timeout_secs == Some(0) {
            errors.push("sms.timeout_secs must be positive".into());
        }

        if errors.is_empty() {
            Ok(())
        } else {
            bail!(
                "config validation failed ({} error{}):\n  - {}",
                errors.len(),
                if errors.len() == 1 { "" } else { "s" },
                errors.join("\n  - ")
            );
        }
    }

    /// Apply `WEB_PORT`, `DB_URL`, `TELEMETRY_BASE_URL`, `SMS_GATEWAY_URL`
    /// and `SMS_GATEWAY_TOKEN` from `lookup` over the file values.
    pub fn apply_overrides<F>(&mut self, lookup: F) -> Result<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(port) = lookup("WEB_PORT") {
            self.web_port = port
                .parse()
                .with_context(|| format!("WEB_PORT '{port}' is not a port number"))?;
        }
        if let Some(url) = lookup("DB_URL") {
            self.db_url = url;
        }
        if let Some(url) = lookup("TELEMETRY_BASE_URL") {
            self.api.base_url = url;
        }
        if let Some(url) = lookup("SMS_GATEWAY_URL") {
            self.sms.gateway_url = Some(url);
        }
        if let Some(token) = lookup("SMS_GATEWAY_TOKEN") {
            self.sms.gateway_token = Some(token);
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Load
// ---------------------------------------------------------------------------

/// Read and parse a TOML config file. A missing file yields the defaults.
pub fn load(path: &str) -> Result<Config> {
    if !Path::new(path).exists() {
        tracing::info!(path, "no config file, using defaults");
        return Ok(Config::default());
    }
    let contents =
        std::fs::read_to_string(path).with_context(|| format!("failed to read config: {path}"))?;
    let config: Config =
        toml::from_str(&contents).with_context(|| format!("failed to parse config: {path}"))?;
    Ok(config)
}

// ===========================================================================
// Tests
// ===========================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    /// Assert validation fails and the error message contains `needle`.
    fn assert_validation_err(cfg: &Config, needle: &str) {
        let err = cfg.validate().unwrap_err();
        let msg = format!("{err:#}");
        assert!(
            msg.contains(needle),
            "expected error containing {needle:?}, got: {msg}"
        );
    }

    // -- Parsing ----------------------------------------------------------

    #[test]
    fn parse_full_config() {
        let toml_str = r#"
web_port = 9000
db_url = "sqlite:/var/lib/panel/panel.db"

[api]
base_url = "http://127.0.0.1:8090"
timeout_secs = 3

[sms]
gateway_url = "https://sms.example.net/send"
gateway_token = "abc"
"#;
        let config: Config = toml::from_str(toml_str).unwrap();
        assert_eq!(config.web_port, 9000);
        assert_eq!(config.api.base_url, "http://127.0.0.1:8090");
        assert_eq!(config.api.timeout(), Duration::from_secs(3));
        assert_eq!(config.sms.gateway_token.as_deref(), Some("abc"));
        assert_eq!(config.sms.timeout(), Duration::from_secs(15));
        config.validate().unwrap();
    }

    #[test]
    fn parse_empty_config_gives_defaults() {
        let config: Config = toml::from_str("").unwrap();
        assert_eq!(config.web_port, 8080);
        assert_eq!(config.db_url, "sqlite:panel.db");
        assert_eq!(config.api.timeout_secs, 10);
        assert!(config.sms.gateway_url.is_none());
        config.validate().unwrap();
    }

    #[test]
    fn parse_partial_section_keeps_other_defaults() {
        let config: Config = toml::from_str("[api]\ntimeout_secs = 2\n").unwrap();
        assert_eq!(config.api.timeout_secs, 2);
        assert_eq!(config.api.base_url, ApiConfig::default().base_url);
    }

    #[test]
    fn missing_file_gives_defaults() {
        let config = load("/nonexistent/panel.toml").unwrap();
        assert_eq!(config.web_port, 8080);
    }

    // -- Validation -------------------------------------------------------

    #[test]
    fn zero_port_rejected() {
        let cfg = Config {
            web_port: 0,
            ..Default::default()
        };
        assert_validation_err(&cfg, "web_port");
    }

    #[test]
    fn non_sqlite_db_rejected() {
        let cfg = Config {
            db_url: "postgres://localhost/panel".into(),
            ..Default::default()
        };
        assert_validation_err(&cfg, "not a sqlite url");
    }

    #[test]
    fn base_url_scheme_required() {
        let mut cfg = Config::default();
        cfg.api.base_url = "api.example.com".into();
        assert_validation_err(&cfg, "must start with http");
    }

    #[test]
    fn blank_gateway_url_is_allowed() {
        let mut cfg = Config::default();
        cfg.sms.gateway_url = Some("  ".into());
        cfg.validate().unwrap();
    }

    #[test]
    fn multiple_errors_collected() {
        let mut cfg = Config {
            web_port: 0,
            db_url: "mysql://x".into(),
            ..Default::default()
        };
        cfg.api.base_url = "".into();
        cfg.api.timeout_secs = 0;
        cfg.sms.gateway_url = Some("ftp://sms".into());

        let msg = format!("{:#}", cfg.validate().unwrap_err());
        assert!(msg.contains("5 errors"), "unexpected count in: {msg}");
        assert!(msg.contains("api.base_url is empty"), "{msg}");
        assert!(msg.contains("sms.gateway_url"), "{msg}");
    }

    // -- Overrides --------------------------------------------------------

    #[test]
    fn env_overrides_replace_file_values() {
        let env: HashMap<&str, &str> = HashMap::from([
            ("WEB_PORT", "9100"),
            ("TELEMETRY_BASE_URL", "http://sim:8090"),
            ("SMS_GATEWAY_URL", "http://gw/send"),
        ]);
        let mut cfg = Config::default();
        cfg.apply_overrides(|k| env.get(k).map(|v| v.to_string()))
            .unwrap();
        assert_eq!(cfg.web_port, 9100);
        assert_eq!(cfg.api.base_url, "http://sim:8090");
        assert_eq!(cfg.sms.gateway_url.as_deref(), Some("http://gw/send"));
        assert_eq!(cfg.db_url, "sqlite:panel.db");
    }

    #[test]
    fn bad_port_override_is_an_error() {
        let mut cfg = Config::default();
        let err = cfg
            .apply_overrides(|k| (k == "WEB_PORT").then(|| "eighty".to_string()))
            .unwrap_err();
        assert!(format!("{err:#}").contains("WEB_PORT"));
    }
}
