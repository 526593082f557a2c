use std::sync::{Mutex, PoisonError};

use keyrelay_common::ExhaustedPolicy;

use crate::health::HealthStatus;

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum RotationError {
    #[error("no API keys configured")]
    NoKeysConfigured,
    #[error("no healthy API key available")]
    NoHealthyKey,
    /// Only one key is stored, so there is nothing to rotate to.
    #[error("no alternative API key to rotate to")]
    NoAlternativeKey,
}

/// Picks the next usable key after `cursor`, scanning at most `health.len()` slots.
///
/// A cursor that no longer fits the list (keys were deleted) is wrapped into range.
pub fn select(
    health: &[HealthStatus],
    cursor: usize,
    policy: ExhaustedPolicy,
) -> Result<usize, RotationError> {
    let len = health.len();
    if len == 0 {
        return Err(RotationError::NoKeysConfigured);
    }
    let start = (cursor % len + 1) % len;
    for step in 0..len {
        let idx = (start + step) % len;
        if health[idx].is_usable() {
            return Ok(idx);
        }
    }
    match policy {
        ExhaustedPolicy::FallbackFirst => Ok(0),
        ExhaustedPolicy::Reject => Err(RotationError::NoHealthyKey),
    }
}

/// Like [`select`], starting after the key that just failed and never returning it.
pub fn select_after_failure(
    health: &[HealthStatus],
    failed: usize,
    policy: ExhaustedPolicy,
) -> Result<usize, RotationError> {
    let len = health.len();
    match len {
        0 => return Err(RotationError::NoKeysConfigured),
        1 => return Err(RotationError::NoAlternativeKey),
        _ => {}
    }
    let failed = failed % len;
    for step in 1..len {
        let idx = (failed + step) % len;
        if health[idx].is_usable() {
            return Ok(idx);
        }
    }
    match policy {
        ExhaustedPolicy::FallbackFirst => Ok((failed + 1) % len),
        ExhaustedPolicy::Reject => Err(RotationError::NoHealthyKey),
    }
}

/// Process-local position of the last handed-out key.
#[derive(Debug, Default)]
pub struct RotationCursor {
    inner: Mutex<usize>,
}

impl RotationCursor {
    pub fn new(initial: usize) -> Self {
        Self {
            inner: Mutex::new(initial),
        }
    }

    pub fn get(&self) -> usize {
        *self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Selects and advances under one lock so concurrent callers see distinct steps.
    pub fn advance(
        &self,
        health: &[HealthStatus],
        policy: ExhaustedPolicy,
    ) -> Result<usize, RotationError> {
        let mut guard = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
        let idx = select(health, *guard, policy)?;
        *guard = idx;
        Ok(idx)
    }

    pub fn advance_after_failure(
        &self,
        health: &[HealthStatus],
        failed: usize,
        policy: ExhaustedPolicy,
    ) -> Result<usize, RotationError> {
        let mut guard = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
        let idx = select_after_failure(health, failed, policy)?;
        *guard = idx;
        Ok(idx)
    }
}
