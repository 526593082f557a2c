pub mod admin;
pub mod auth;
pub mod bootstrap;
pub mod error;
pub mod forwarder;
pub mod health;
pub mod password;
pub mod state;
pub mod tokens;
pub mod upstream_client;

pub use admin::{AdminError, AdminSession, AuthStatus, KeyView};
pub use auth::{authenticate_client, extract_bearer};
pub use bootstrap::{Bootstrap, CliArgs, bootstrap, bootstrap_from_env};
pub use error::ProxyError;
pub use forwarder::ProxyResponse;
pub use password::{PasswordHashing, Verification};
pub use state::AppState;
pub use tokens::{TokenError, TokenRegistry, generate_token};
pub use upstream_client::{UpstreamClient, UpstreamClientConfig, WreqUpstreamClient};
