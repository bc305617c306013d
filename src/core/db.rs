//! Database connectivity: credential resolution, a bounded pool with
//! connection-layer timeouts, and the runtime the CLI drives it on.

use crate::core::config::DatabaseConfig;
use crate::core::error::GuardError;
use sqlx::PgPool;
use sqlx::postgres::{PgConnectOptions, PgPoolOptions};
use std::str::FromStr;
use std::time::Duration;

/// Where the connection parameters came from. Secrets are never logged.
#[derive(Clone, PartialEq, Eq)]
pub enum Credentials {
    Url(String),
    Parts {
        host: String,
        port: u16,
        user: String,
        password: String,
        dbname: String,
    },
}

impl std::fmt::Debug for Credentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Credentials::Url(_) => f.write_str("Credentials::Url([REDACTED])"),
            Credentials::Parts {
                host, port, user, ..
            } => f
                .debug_struct("Credentials::Parts")
                .field("host", host)
                .field("port", port)
                .field("user", user)
                .field("password", &"[REDACTED]")
                .finish(),
        }
    }
}

/// Resolve credentials from the environment via `lookup`: a full URL from the
/// first non-empty `url_env` variable, else project ref + password.
pub fn resolve_credentials<F>(config: &DatabaseConfig, lookup: F) -> Result<Credentials, GuardError>
where
    F: Fn(&str) -> Option<String>,
{
    let present = |name: &str| lookup(name).filter(|v| !v.trim().is_empty());

    for name in &config.url_env {
        if let Some(url) = present(name) {
            return Ok(Credentials::Url(url));
        }
    }

    match (
        present(&config.project_ref_env),
        present(&config.password_env),
    ) {
        (Some(project_ref), Some(password)) => Ok(Credentials::Parts {
            host: config.host_template.replace("{project_ref}", &project_ref),
            port: config.port,
            user: config.user.clone(),
            password,
            dbname: config.dbname.clone(),
        }),
        (Some(_), None) => Err(GuardError::MissingCredentials(format!(
            "{} is set but {} is not",
            config.project_ref_env, config.password_env
        ))),
        _ => Err(GuardError::MissingCredentials(format!(
            "set one of {} or both {} and {}",
            config.url_env.join(", "),
            config.project_ref_env,
            config.password_env
        ))),
    }
}

pub fn connect_options(
    credentials: &Credentials,
    config: &DatabaseConfig,
) -> Result<PgConnectOptions, GuardError> {
    let base = match credentials {
        Credentials::Url(url) => PgConnectOptions::from_str(url)
            .map_err(|e| GuardError::Config(format!("invalid database URL: {}", e)))?,
        Credentials::Parts {
            host,
            port,
            user,
            password,
            dbname,
        } => PgConnectOptions::new()
            .host(host)
            .port(*port)
            .username(user)
            .password(password)
            .database(dbname),
    };
    Ok(base.application_name("rlsguard").options([(
        "statement_timeout",
        format!("{}s", config.statement_timeout_secs),
    )]))
}

/// Open the bounded pool. A pool that cannot connect within the connect
/// timeout is a tool failure, never a finding.
pub async fn connect(config: &DatabaseConfig) -> Result<PgPool, GuardError> {
    let credentials = resolve_credentials(config, |name| std::env::var(name).ok())?;
    tracing::debug!(?credentials, "connecting");
    let options = connect_options(&credentials, config)?;
    PgPoolOptions::new()
        .max_connections(config.max_connections)
        .acquire_timeout(Duration::from_secs(config.connect_timeout_secs))
        .connect_with(options)
        .await
        .map_err(|err| match err {
            sqlx::Error::PoolTimedOut => GuardError::Timeout(format!(
                "no database connection within {}s",
                config.connect_timeout_secs
            )),
            other => GuardError::Database(other),
        })
}

/// Server-side statement timeout (`query_canceled`).
pub fn is_statement_timeout(err: &sqlx::Error) -> bool {
    matches!(err, sqlx::Error::Database(db) if db.code().as_deref() == Some("57014"))
}

/// Single-threaded runtime; checks run sequentially.
pub fn runtime() -> Result<tokio::runtime::Runtime, GuardError> {
    Ok(tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()?)
}
