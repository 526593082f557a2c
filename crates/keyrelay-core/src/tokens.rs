use rand::Rng;
use rand::distr::Alphanumeric;
use time::OffsetDateTime;

use keyrelay_storage::ClientToken;

pub const TOKEN_PREFIX: &str = "sk-";
pub const TOKEN_RANDOM_LEN: usize = 32;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TokenError {
    #[error("token name must not be empty")]
    InvalidName,
    #[error("token name already exists")]
    NameTaken,
    #[error("token value already exists, use a different token")]
    TokenTaken,
    #[error("token not found")]
    NotFound,
}

pub fn generate_token() -> String {
    let random: String = rand::rng()
        .sample_iter(Alphanumeric)
        .take(TOKEN_RANDOM_LEN)
        .map(char::from)
        .collect();
    format!("{TOKEN_PREFIX}{random}")
}

/// Client tokens loaded for one request. Mutations validate before touching the list,
/// so a failed call leaves it unchanged.
#[derive(Debug, Clone, Default)]
pub struct TokenRegistry {
    tokens: Vec<ClientToken>,
}

impl TokenRegistry {
    pub fn new(tokens: Vec<ClientToken>) -> Self {
        Self { tokens }
    }

    pub fn tokens(&self) -> &[ClientToken] {
        &self.tokens
    }

    pub fn create(&mut self, name: &str, custom: Option<&str>) -> Result<ClientToken, TokenError> {
        let name = name.trim();
        if name.is_empty() {
            return Err(TokenError::InvalidName);
        }
        if self.tokens.iter().any(|t| t.name == name) {
            return Err(TokenError::NameTaken);
        }
        let token = match custom.map(str::trim).filter(|value| !value.is_empty()) {
            Some(value) => {
                if self.tokens.iter().any(|t| t.token == value) {
                    return Err(TokenError::TokenTaken);
                }
                value.to_string()
            }
            None => self.unused_token(),
        };

        let entry = ClientToken {
            name: name.to_string(),
            token,
            enabled: true,
            created_at: OffsetDateTime::now_utc(),
        };
        self.tokens.push(entry.clone());
        Ok(entry)
    }

    pub fn set_enabled(&mut self, name: &str, enabled: bool) -> Result<&ClientToken, TokenError> {
        let entry = self
            .tokens
            .iter_mut()
            .find(|t| t.name == name)
            .ok_or(TokenError::NotFound)?;
        entry.enabled = enabled;
        Ok(entry)
    }

    pub fn delete(&mut self, name: &str) -> Result<ClientToken, TokenError> {
        let idx = self
            .tokens
            .iter()
            .position(|t| t.name == name)
            .ok_or(TokenError::NotFound)?;
        Ok(self.tokens.remove(idx))
    }

    /// Exact match on an enabled token.
    pub fn verify(&self, presented: &str) -> bool {
        self.find_enabled(presented).is_some()
    }

    pub fn find_enabled(&self, presented: &str) -> Option<&ClientToken> {
        if presented.is_empty() {
            return None;
        }
        self.tokens
            .iter()
            .find(|t| t.enabled && t.token == presented)
    }

    fn unused_token(&self) -> String {
        loop {
            let candidate = generate_token();
            if !self.tokens.iter().any(|t| t.token == candidate) {
                return candidate;
            }
        }
    }
}
