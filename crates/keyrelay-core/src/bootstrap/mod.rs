use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::Parser;

use keyrelay_common::{ExhaustedPolicy, GlobalConfig, GlobalConfigPatch, PasswordCost};
use keyrelay_storage::{CredentialStore, connect_kv};

use crate::password::{PasswordHashing, is_acceptable_password};
use crate::state::AppState;
use crate::upstream_client::{UpstreamClientConfig, WreqUpstreamClient};

#[derive(Debug, Clone, Default, Parser)]
#[command(
    name = "keyrelay",
    version,
    about = "OpenAI-compatible proxy that rotates OpenRouter API keys"
)]
pub struct CliArgs {
    /// Storage DSN: `memory://` or a SeaORM DSN such as `sqlite://keyrelay.db?mode=rwc`.
    #[arg(long, env = "KEYRELAY_DSN")]
    pub dsn: Option<String>,

    /// Bind host.
    #[arg(long, env = "KEYRELAY_HOST")]
    pub host: Option<String>,

    /// Bind port.
    #[arg(long, env = "KEYRELAY_PORT")]
    pub port: Option<String>,

    /// Optional outbound proxy for upstream requests.
    #[arg(long, env = "KEYRELAY_PROXY")]
    pub proxy: Option<String>,

    #[arg(long, env = "KEYRELAY_UPSTREAM_BASE_URL")]
    pub upstream_base_url: Option<String>,

    /// Model used when a chat request names none.
    #[arg(long, env = "KEYRELAY_DEFAULT_MODEL")]
    pub default_model: Option<String>,

    #[arg(long, env = "KEYRELAY_HTTP_REFERER")]
    pub http_referer: Option<String>,

    #[arg(long, env = "KEYRELAY_APP_TITLE")]
    pub app_title: Option<String>,

    /// Seconds between key health sweeps; 0 disables them.
    #[arg(long, env = "KEYRELAY_HEALTH_CHECK_INTERVAL_SECS")]
    pub health_check_interval_secs: Option<String>,

    #[arg(long, env = "KEYRELAY_HEALTH_PROBE_TIMEOUT_SECS")]
    pub health_probe_timeout_secs: Option<String>,

    /// Seconds a key sits out after a quota failure.
    #[arg(long, env = "KEYRELAY_QUOTA_COOLDOWN_SECS")]
    pub quota_cooldown_secs: Option<String>,

    #[arg(long, env = "KEYRELAY_UPSTREAM_TIMEOUT_SECS")]
    pub upstream_timeout_secs: Option<String>,

    /// `fallback_first` or `reject`, applied when every key is unhealthy.
    #[arg(long, env = "KEYRELAY_EXHAUSTED_POLICY")]
    pub exhausted_policy: Option<String>,

    /// Initial admin password, stored (hashed) only when none is set yet.
    #[arg(long, env = "KEYRELAY_ADMIN_PASSWORD")]
    pub admin_password: Option<String>,

    #[arg(long, env = "KEYRELAY_PASSWORD_MEMORY_KIB")]
    pub password_memory_kib: Option<String>,

    #[arg(long, env = "KEYRELAY_PASSWORD_ITERATIONS")]
    pub password_iterations: Option<String>,
}

pub struct Bootstrap {
    pub state: Arc<AppState>,
}

pub async fn bootstrap_from_env() -> anyhow::Result<Bootstrap> {
    let args = CliArgs::parse();
    bootstrap(args).await
}

pub async fn bootstrap(args: CliArgs) -> anyhow::Result<Bootstrap> {
    let global = config_from_args(&args)?;
    ensure_sqlite_parent_dir(&global.dsn)?;

    let kv = connect_kv(&global.dsn).await.context("connect storage")?;
    let store = CredentialStore::new(kv.clone());
    let cursor = store.load_cursor().await.context("load rotation cursor")?;

    if let Some(password) = sanitize_optional_env_value(args.admin_password.clone()) {
        seed_admin_password(&store, &global, &password).await?;
    }

    let upstream = WreqUpstreamClient::new(UpstreamClientConfig::from_global(&global))
        .context("build upstream client")?;
    let state =
        AppState::new(global, kv, Arc::new(upstream), cursor).context("build app state")?;

    Ok(Bootstrap {
        state: Arc::new(state),
    })
}

/// CLI/ENV values (clap resolves CLI > ENV per field) overlaid on defaults.
pub fn config_from_args(args: &CliArgs) -> anyhow::Result<GlobalConfig> {
    let dsn = sanitize_dsn_value(args.dsn.clone());
    let defaults = PasswordCost::default();
    let memory_kib = parse_env_value::<u32>(
        args.password_memory_kib.clone(),
        "KEYRELAY_PASSWORD_MEMORY_KIB",
    )?;
    let iterations = parse_env_value::<u32>(
        args.password_iterations.clone(),
        "KEYRELAY_PASSWORD_ITERATIONS",
    )?;
    let password_cost = (memory_kib.is_some() || iterations.is_some()).then(|| PasswordCost {
        memory_kib: memory_kib.unwrap_or(defaults.memory_kib),
        iterations: iterations.unwrap_or(defaults.iterations),
        parallelism: defaults.parallelism,
    });

    let mut merged = GlobalConfigPatch::default();
    merged.overlay(GlobalConfigPatch {
        host: sanitize_optional_env_value(args.host.clone()),
        port: parse_env_value::<u16>(args.port.clone(), "KEYRELAY_PORT")?,
        dsn: Some(dsn),
        proxy: sanitize_optional_env_value(args.proxy.clone()),
        upstream_base_url: sanitize_optional_env_value(args.upstream_base_url.clone()),
        default_model: sanitize_optional_env_value(args.default_model.clone()),
        http_referer: sanitize_optional_env_value(args.http_referer.clone()),
        app_title: sanitize_optional_env_value(args.app_title.clone()),
        health_check_interval_secs: parse_env_value::<u64>(
            args.health_check_interval_secs.clone(),
            "KEYRELAY_HEALTH_CHECK_INTERVAL_SECS",
        )?,
        health_probe_timeout_secs: parse_env_value::<u64>(
            args.health_probe_timeout_secs.clone(),
            "KEYRELAY_HEALTH_PROBE_TIMEOUT_SECS",
        )?,
        quota_cooldown_secs: parse_env_value::<u64>(
            args.quota_cooldown_secs.clone(),
            "KEYRELAY_QUOTA_COOLDOWN_SECS",
        )?,
        upstream_timeout_secs: parse_env_value::<u64>(
            args.upstream_timeout_secs.clone(),
            "KEYRELAY_UPSTREAM_TIMEOUT_SECS",
        )?,
        exhausted_policy: parse_env_value::<ExhaustedPolicy>(
            args.exhausted_policy.clone(),
            "KEYRELAY_EXHAUSTED_POLICY",
        )?,
        password_cost,
    });

    merged
        .into_config()
        .context("finalize merged global config")
}

async fn seed_admin_password(
    store: &CredentialStore,
    global: &GlobalConfig,
    password: &str,
) -> anyhow::Result<()> {
    if store
        .load_admin_hash()
        .await
        .context("load admin hash")?
        .is_some()
    {
        tracing::info!(event = "admin_password_seed_skipped", reason = "already set");
        return Ok(());
    }
    if !is_acceptable_password(password) {
        anyhow::bail!("KEYRELAY_ADMIN_PASSWORD must be at least 8 characters");
    }
    let hash = PasswordHashing::new(global.password_cost)
        .context("build password hasher")?
        .hash(password)
        .context("hash admin password")?;
    store
        .save_admin_hash(&hash)
        .await
        .context("store admin hash")?;
    tracing::info!(event = "admin_password_seeded");
    Ok(())
}

fn sanitize_optional_env_value(value: Option<String>) -> Option<String> {
    let trimmed = value?.trim().to_string();
    if trimmed.is_empty() {
        return None;
    }
    // Some PaaS systems may inject unresolved placeholders like `${VAR}`.
    if trimmed.starts_with("${") && trimmed.ends_with('}') {
        return None;
    }
    Some(trimmed)
}

fn sanitize_dsn_value(value: Option<String>) -> String {
    sanitize_optional_env_value(value).unwrap_or_else(default_dsn)
}

fn default_dsn() -> String {
    if let Some(data_dir) = sanitize_optional_env_value(std::env::var("KEYRELAY_DATA_DIR").ok()) {
        let dir = data_dir.trim_end_matches('/');
        return format!("sqlite://{dir}/keyrelay.db?mode=rwc");
    }
    "sqlite://keyrelay.db?mode=rwc".to_string()
}

fn ensure_sqlite_parent_dir(dsn: &str) -> anyhow::Result<()> {
    let Some(db_path) = sqlite_file_path_from_dsn(dsn) else {
        return Ok(());
    };
    let Some(parent) = db_path.parent() else {
        return Ok(());
    };
    if parent.as_os_str().is_empty() {
        return Ok(());
    }

    std::fs::create_dir_all(parent)
        .with_context(|| format!("create sqlite parent dir {}", parent.display()))?;
    Ok(())
}

fn sqlite_file_path_from_dsn(dsn: &str) -> Option<PathBuf> {
    let rest = dsn.strip_prefix("sqlite:")?;
    let path_part = rest.split(['?', '#']).next()?.trim();
    if path_part.is_empty() {
        return None;
    }
    let normalized = path_part.strip_prefix("//").unwrap_or(path_part);
    if normalized.eq_ignore_ascii_case(":memory:") {
        return None;
    }
    Some(PathBuf::from(normalized))
}

fn parse_env_value<T>(value: Option<String>, env_name: &str) -> anyhow::Result<Option<T>>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    let Some(raw) = sanitize_optional_env_value(value) else {
        return Ok(None);
    };
    let parsed = raw
        .parse::<T>()
        .map_err(|err| anyhow::anyhow!("invalid {env_name} value: {raw} ({err})"))?;
    Ok(Some(parsed))
}
