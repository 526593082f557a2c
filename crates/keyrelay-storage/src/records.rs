use serde::{Deserialize, Serialize};
use time::OffsetDateTime;

/// An upstream OpenRouter key as persisted under `api_keys`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UpstreamKey {
    pub name: String,
    pub value: String,
    /// Last known probe result; the in-process health board is authoritative.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub is_healthy: Option<bool>,
}

impl UpstreamKey {
    pub fn new(name: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            value: value.into(),
            is_healthy: None,
        }
    }

    /// `sk-or-v1-1234…cdef` style rendering for listings and logs.
    pub fn masked_value(&self) -> String {
        mask_secret(&self.value)
    }
}

/// A client-facing access token as persisted under `client_tokens`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClientToken {
    pub name: String,
    pub token: String,
    pub enabled: bool,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
}

pub fn mask_secret(secret: &str) -> String {
    let chars: Vec<char> = secret.chars().collect();
    if chars.len() <= 12 {
        return "*".repeat(chars.len());
    }
    let head: String = chars[..8].iter().collect();
    let tail: String = chars[chars.len() - 4..].iter().collect();
    format!("{head}…{tail}")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn upstream_key_reads_legacy_shape() {
        let key: UpstreamKey =
            serde_json::from_str(r#"{"name":"main","value":"sk-or-v1-abc","isHealthy":false}"#)
                .unwrap();
        assert_eq!(key.is_healthy, Some(false));

        let key: UpstreamKey = serde_json::from_str(r#"{"name":"b","value":"v"}"#).unwrap();
        assert_eq!(key.is_healthy, None);
        assert_eq!(
            serde_json::to_value(&key).unwrap(),
            serde_json::json!({"name":"b","value":"v"})
        );
    }

    #[test]
    fn client_token_uses_iso_created_at() {
        let token: ClientToken = serde_json::from_str(
            r#"{"name":"t","token":"sk-x","enabled":true,"createdAt":"2024-05-01T10:20:30.123Z"}"#,
        )
        .unwrap();
        assert_eq!(token.created_at.year(), 2024);
        let value = serde_json::to_value(&token).unwrap();
        assert!(value["createdAt"].as_str().unwrap().starts_with("2024-05-01T10:20:30"));
    }

    #[test]
    fn masking_keeps_only_edges() {
        assert_eq!(mask_secret("short"), "*****");
        assert_eq!(
            mask_secret("sk-or-v1-0123456789abcdef"),
            "sk-or-v1…cdef"
        );
    }
}
