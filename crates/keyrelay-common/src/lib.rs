use std::str::FromStr;

use serde::{Deserialize, Serialize};

pub const DEFAULT_UPSTREAM_BASE_URL: &str = "https://openrouter.ai/api/v1";
pub const DEFAULT_MODEL: &str = "deepseek/deepseek-chat-v3-0324:free";
pub const DEFAULT_HTTP_REFERER: &str = "https://openrouter-apikey-manager.workers.dev";
pub const DEFAULT_APP_TITLE: &str = "OpenRouter API Key Manager";

#[derive(Debug, thiserror::Error)]
pub enum GlobalConfigError {
    #[error("missing required global config field: {0}")]
    MissingField(&'static str),
    #[error("invalid global config field {field}: {message}")]
    Invalid {
        field: &'static str,
        message: String,
    },
}

/// What the selector does when every stored key is marked unhealthy.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExhaustedPolicy {
    /// Hand out a key anyway so a stale probe result cannot take the proxy down.
    #[default]
    FallbackFirst,
    /// Fail the request with "no healthy key".
    Reject,
}

impl ExhaustedPolicy {
    pub fn as_str(&self) -> &'static str {
        match self {
            ExhaustedPolicy::FallbackFirst => "fallback_first",
            ExhaustedPolicy::Reject => "reject",
        }
    }
}

impl FromStr for ExhaustedPolicy {
    type Err = GlobalConfigError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().replace('-', "_").as_str() {
            "fallback_first" | "fallback" => Ok(ExhaustedPolicy::FallbackFirst),
            "reject" | "strict" => Ok(ExhaustedPolicy::Reject),
            other => Err(GlobalConfigError::Invalid {
                field: "exhausted_policy",
                message: format!("unknown policy {other:?}"),
            }),
        }
    }
}

/// Argon2 cost parameters for the admin password hash.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PasswordCost {
    pub memory_kib: u32,
    pub iterations: u32,
    pub parallelism: u32,
}

impl Default for PasswordCost {
    fn default() -> Self {
        Self {
            memory_kib: 19 * 1024,
            iterations: 2,
            parallelism: 1,
        }
    }
}

/// Final, merged global configuration used by the running process.
///
/// Merge order: CLI > ENV > defaults.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GlobalConfig {
    pub host: String,
    pub port: u16,
    /// Storage DSN (`memory://` or any SeaORM DSN).
    pub dsn: String,
    /// Optional outbound proxy (for upstream egress).
    pub proxy: Option<String>,
    pub upstream_base_url: String,
    /// Injected into chat requests that carry no model.
    pub default_model: String,
    pub http_referer: String,
    pub app_title: String,
    pub health_check_interval_secs: u64,
    pub health_probe_timeout_secs: u64,
    /// How long a key stays out of rotation after a quota failure, unless a sweep
    /// clears it sooner.
    pub quota_cooldown_secs: u64,
    pub upstream_timeout_secs: u64,
    pub exhausted_policy: ExhaustedPolicy,
    pub password_cost: PasswordCost,
}

/// Optional layer used for merging global config.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct GlobalConfigPatch {
    pub host: Option<String>,
    pub port: Option<u16>,
    pub dsn: Option<String>,
    pub proxy: Option<String>,
    pub upstream_base_url: Option<String>,
    pub default_model: Option<String>,
    pub http_referer: Option<String>,
    pub app_title: Option<String>,
    pub health_check_interval_secs: Option<u64>,
    pub health_probe_timeout_secs: Option<u64>,
    pub quota_cooldown_secs: Option<u64>,
    pub upstream_timeout_secs: Option<u64>,
    pub exhausted_policy: Option<ExhaustedPolicy>,
    pub password_cost: Option<PasswordCost>,
}

impl GlobalConfigPatch {
    pub fn overlay(&mut self, other: GlobalConfigPatch) {
        if other.host.is_some() {
            self.host = other.host;
        }
        if other.port.is_some() {
            self.port = other.port;
        }
        if other.dsn.is_some() {
            self.dsn = other.dsn;
        }
        if other.proxy.is_some() {
            self.proxy = other.proxy;
        }
        if other.upstream_base_url.is_some() {
            self.upstream_base_url = other.upstream_base_url;
        }
        if other.default_model.is_some() {
            self.default_model = other.default_model;
        }
        if other.http_referer.is_some() {
            self.http_referer = other.http_referer;
        }
        if other.app_title.is_some() {
            self.app_title = other.app_title;
        }
        if other.health_check_interval_secs.is_some() {
            self.health_check_interval_secs = other.health_check_interval_secs;
        }
        if other.health_probe_timeout_secs.is_some() {
            self.health_probe_timeout_secs = other.health_probe_timeout_secs;
        }
        if other.quota_cooldown_secs.is_some() {
            self.quota_cooldown_secs = other.quota_cooldown_secs;
        }
        if other.upstream_timeout_secs.is_some() {
            self.upstream_timeout_secs = other.upstream_timeout_secs;
        }
        if other.exhausted_policy.is_some() {
            self.exhausted_policy = other.exhausted_policy;
        }
        if other.password_cost.is_some() {
            self.password_cost = other.password_cost;
        }
    }

    pub fn into_config(self) -> Result<GlobalConfig, GlobalConfigError> {
        let upstream_base_url = self
            .upstream_base_url
            .unwrap_or_else(|| DEFAULT_UPSTREAM_BASE_URL.to_string())
            .trim_end_matches('/')
            .to_string();
        if upstream_base_url.is_empty() {
            return Err(GlobalConfigError::Invalid {
                field: "upstream_base_url",
                message: "must not be empty".to_string(),
            });
        }
        Ok(GlobalConfig {
            host: self.host.unwrap_or_else(|| "0.0.0.0".to_string()),
            port: self.port.unwrap_or(8787),
            dsn: self.dsn.ok_or(GlobalConfigError::MissingField("dsn"))?,
            proxy: self.proxy,
            upstream_base_url,
            default_model: self
                .default_model
                .unwrap_or_else(|| DEFAULT_MODEL.to_string()),
            http_referer: self
                .http_referer
                .unwrap_or_else(|| DEFAULT_HTTP_REFERER.to_string()),
            app_title: self
                .app_title
                .unwrap_or_else(|| DEFAULT_APP_TITLE.to_string()),
            health_check_interval_secs: self.health_check_interval_secs.unwrap_or(300),
            health_probe_timeout_secs: self.health_probe_timeout_secs.unwrap_or(10),
            quota_cooldown_secs: self.quota_cooldown_secs.unwrap_or(300),
            upstream_timeout_secs: self.upstream_timeout_secs.unwrap_or(120),
            exhausted_policy: self.exhausted_policy.unwrap_or_default(),
            password_cost: self.password_cost.unwrap_or_default(),
        })
    }
}

impl From<GlobalConfig> for GlobalConfigPatch {
    fn from(value: GlobalConfig) -> Self {
        Self {
            host: Some(value.host),
            port: Some(value.port),
            dsn: Some(value.dsn),
            proxy: value.proxy,
            upstream_base_url: Some(value.upstream_base_url),
            default_model: Some(value.default_model),
            http_referer: Some(value.http_referer),
            app_title: Some(value.app_title),
            health_check_interval_secs: Some(value.health_check_interval_secs),
            health_probe_timeout_secs: Some(value.health_probe_timeout_secs),
            quota_cooldown_secs: Some(value.quota_cooldown_secs),
            upstream_timeout_secs: Some(value.upstream_timeout_secs),
            exhausted_policy: Some(value.exhausted_policy),
            password_cost: Some(value.password_cost),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn overlay_prefers_later_layer() {
        let mut base = GlobalConfigPatch {
            host: Some("127.0.0.1".to_string()),
            port: Some(1),
            dsn: Some("memory://".to_string()),
            ..Default::default()
        };
        base.overlay(GlobalConfigPatch {
            port: Some(9000),
            exhausted_policy: Some(ExhaustedPolicy::Reject),
            ..Default::default()
        });
        let config = base.into_config().unwrap();
        assert_eq!(config.host, "127.0.0.1");
        assert_eq!(config.port, 9000);
        assert_eq!(config.exhausted_policy, ExhaustedPolicy::Reject);
        assert_eq!(config.upstream_base_url, DEFAULT_UPSTREAM_BASE_URL);
        assert_eq!(config.health_check_interval_secs, 300);
        assert_eq!(config.quota_cooldown_secs, 300);
    }

    #[test]
    fn missing_dsn_is_an_error() {
        let err = GlobalConfigPatch::default().into_config().unwrap_err();
        assert!(matches!(err, GlobalConfigError::MissingField("dsn")));
    }

    #[test]
    fn base_url_trailing_slash_is_trimmed() {
        let config = GlobalConfigPatch {
            dsn: Some("memory://".to_string()),
            upstream_base_url: Some("http://127.0.0.1:9/api/v1/".to_string()),
            ..Default::default()
        }
        .into_config()
        .unwrap();
        assert_eq!(config.upstream_base_url, "http://127.0.0.1:9/api/v1");
    }

    #[test]
    fn exhausted_policy_parses_aliases() {
        assert_eq!(
            "fallback-first".parse::<ExhaustedPolicy>().unwrap(),
            ExhaustedPolicy::FallbackFirst
        );
        assert_eq!(
            "STRICT".parse::<ExhaustedPolicy>().unwrap(),
            ExhaustedPolicy::Reject
        );
        assert!("sometimes".parse::<ExhaustedPolicy>().is_err());
    }
}
