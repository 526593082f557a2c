use serde_json::Value;

use crate::upstream::UpstreamHttpResponse;

const QUOTA_TYPES: &[&str] = &["insufficient_quota", "rate_limit", "quota_exceeded"];
const QUOTA_MESSAGE_MARKERS: &[&str] = &[
    "quota",
    "rate limit",
    "rate-limit",
    "rate_limit",
    "ratelimit",
    "too many requests",
];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureClass {
    Success,
    /// Worth retrying once on another key.
    Quota,
    /// Relayed to the caller as-is.
    Other,
}

pub fn classify_failure(resp: &UpstreamHttpResponse) -> FailureClass {
    if resp.is_success() {
        return FailureClass::Success;
    }
    if is_quota_error(resp.status, &resp.body) {
        FailureClass::Quota
    } else {
        FailureClass::Other
    }
}

/// A 429, or an error envelope whose type/code/message reads as quota or rate limiting.
pub fn is_quota_error(status: u16, body: &[u8]) -> bool {
    if (200..300).contains(&status) {
        return false;
    }
    if status == 429 {
        return true;
    }
    let Ok(value) = serde_json::from_slice::<Value>(body) else {
        return false;
    };

    let quota_kind = error_kinds(&value).any(|kind| {
        let kind = kind.to_ascii_lowercase();
        QUOTA_TYPES.iter().any(|t| kind.contains(t))
    });
    if quota_kind {
        return true;
    }
    error_message(body)
        .map(|message| {
            let message = message.to_ascii_lowercase();
            QUOTA_MESSAGE_MARKERS.iter().any(|m| message.contains(m))
        })
        .unwrap_or(false)
}

/// `error.message` (or a bare string `error`) from an upstream body.
pub fn error_message(body: &[u8]) -> Option<String> {
    let value = serde_json::from_slice::<Value>(body).ok()?;
    match value.get("error")? {
        Value::String(s) => Some(s.clone()),
        err => err
            .get("message")
            .and_then(Value::as_str)
            .map(str::to_string),
    }
}

/// `error.type` and `error.code`, whichever are present.
fn error_kinds(value: &Value) -> impl Iterator<Item = String> + '_ {
    ["type", "code"].into_iter().filter_map(|field| {
        match value.get("error")?.get(field)? {
            Value::String(s) => Some(s.clone()),
            Value::Number(n) => Some(n.to_string()),
            _ => None,
        }
    })
}
