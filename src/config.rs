use clap::Parser;
use serde::Deserialize;
use sqlx::SqlitePool;
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions};
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;
use tracing::Level;

use crate::envelope::EnvelopeRules;
use crate::ledger::LedgerConfig;
use crate::module::{AliasError, ModuleAliases, ModuleKind};
use crate::telemetry::{TelemetryConfig, TelemetryCtx, TelemetrySecrets};

#[derive(Parser, Debug)]
pub struct Env {
    /// Path to plaintext TOML configuration file
    #[clap(long, env = "DECISIONS_CONFIG")]
    pub config: PathBuf,
    /// Path to TOML secrets file
    #[clap(long, env = "DECISIONS_SECRETS")]
    pub secrets: Option<PathBuf>,
}

/// Non-secret settings deserialized from the plaintext config TOML.
#[derive(Deserialize)]
struct Config {
    database_url: String,
    log_level: Option<LogLevel>,
    worker: WorkerConfig,
    aliases: Option<AliasConfig>,
    telemetry: Option<TelemetryConfig>,
}

/// Secret credentials deserialized from the secrets TOML.
#[derive(Deserialize, Default)]
struct Secrets {
    telemetry: Option<TelemetrySecrets>,
}

#[derive(Deserialize)]
struct WorkerConfig {
    module: ModuleKind,
    schema_version: Option<u32>,
    batch_size: Option<u32>,
    concurrency: Option<usize>,
    poll_interval_ms: Option<u64>,
    heartbeat_interval_ms: Option<u64>,
    processing_stale_ms: Option<u64>,
    retry_delay_ms: Option<u64>,
    lock_lease_ms: Option<u64>,
}

/// Legacy names accepted per canonical module. Replaces the built-in table
/// when present.
#[derive(Deserialize)]
struct AliasConfig {
    #[serde(default)]
    allocation: Vec<String>,
    #[serde(default)]
    risk: Vec<String>,
}

#[derive(Debug, Clone)]
pub struct WorkerCtx {
    pub module: ModuleKind,
    pub schema_version: u32,
    pub batch_size: u32,
    pub concurrency: usize,
    pub poll_interval: Duration,
    pub heartbeat_interval: Duration,
    pub processing_stale: Duration,
    pub retry_delay: Duration,
    pub lock_lease: Duration,
}

/// Runtime settings assembled from config and secrets.
#[derive(Debug, Clone)]
pub struct Ctx {
    pub database_url: String,
    pub log_level: LogLevel,
    pub worker: WorkerCtx,
    pub aliases: ModuleAliases,
    pub telemetry: Option<TelemetryCtx>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Trace,
    Debug,
    Info,
    Warn,
    Error,
}

impl From<LogLevel> for Level {
    fn from(log_level: LogLevel) -> Self {
        (&log_level).into()
    }
}

impl From<&LogLevel> for Level {
    fn from(log_level: &LogLevel) -> Self {
        match log_level {
            LogLevel::Trace => Self::TRACE,
            LogLevel::Debug => Self::DEBUG,
            LogLevel::Info => Self::INFO,
            LogLevel::Warn => Self::WARN,
            LogLevel::Error => Self::ERROR,
        }
    }
}

/// WAL lets readers proceed while one writer holds the database. The busy
/// timeout makes a blocked writer wait up to 10s instead of failing with
/// "database is locked". Both are applied to every pooled connection.
pub async fn configure_sqlite_pool(database_url: &str) -> Result<SqlitePool, sqlx::Error> {
    let options = SqliteConnectOptions::from_str(database_url)?
        .create_if_missing(true)
        .journal_mode(SqliteJournalMode::Wal)
        .busy_timeout(Duration::from_secs(10));

    SqlitePoolOptions::new().connect_with(options).await
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read config file")]
    Io(#[from] std::io::Error),
    #[error("failed to parse TOML")]
    Toml(#[from] toml::de::Error),
    #[error("worker.{0} must be greater than zero")]
    ZeroSetting(&'static str),
    #[error(
        "worker.heartbeat_interval_ms ({heartbeat_ms}) must be shorter than \
         worker.processing_stale_ms ({stale_ms})"
    )]
    HeartbeatTooSlow { heartbeat_ms: u64, stale_ms: u64 },
    #[error(
        "worker.lock_lease_ms ({lease_ms}) must be at least \
         worker.processing_stale_ms ({stale_ms})"
    )]
    LockLeaseTooShort { lease_ms: u64, stale_ms: u64 },
    #[error(transparent)]
    Alias(#[from] AliasError),
    #[error("telemetry config present in config but telemetry secrets missing")]
    TelemetrySecretsMissing,
    #[error("telemetry secrets present but telemetry config missing in config")]
    TelemetryConfigMissing,
}

impl Ctx {
    pub fn load_files(config: &Path, secrets: Option<&Path>) -> Result<Self, ConfigError> {
        let config_str = std::fs::read_to_string(config)?;
        let secrets_str = secrets.map(std::fs::read_to_string).transpose()?;
        Self::from_toml(&config_str, secrets_str.as_deref())
    }

    pub fn from_toml(config_toml: &str, secrets_toml: Option<&str>) -> Result<Self, ConfigError> {
        let config: Config = toml::from_str(config_toml)?;
        let secrets: Secrets = secrets_toml
            .map(toml::from_str)
            .transpose()?
            .unwrap_or_default();

        let worker = assemble_worker(config.worker)?;
        let aliases = assemble_aliases(config.aliases)?;
        let telemetry = assemble_telemetry(config.telemetry, secrets.telemetry)?;

        Ok(Self {
            database_url: config.database_url,
            log_level: config.log_level.unwrap_or(LogLevel::Info),
            worker,
            aliases,
            telemetry,
        })
    }

    pub async fn get_sqlite_pool(&self) -> Result<SqlitePool, sqlx::Error> {
        configure_sqlite_pool(&self.database_url).await
    }

    pub fn envelope_rules(&self) -> EnvelopeRules {
        EnvelopeRules {
            expected_version: self.worker.schema_version,
            module: self.worker.module,
            aliases: self.aliases.clone(),
        }
    }

    pub const fn ledger_config(&self) -> LedgerConfig {
        LedgerConfig {
            processing_stale: self.worker.processing_stale,
            retry_delay: self.worker.retry_delay,
        }
    }
}

fn assemble_worker(config: WorkerConfig) -> Result<WorkerCtx, ConfigError> {
    let nonzero = |value: u64, name: &'static str| {
        if value == 0 {
            Err(ConfigError::ZeroSetting(name))
        } else {
            Ok(value)
        }
    };

    let stale_ms = nonzero(
        config.processing_stale_ms.unwrap_or(120_000),
        "processing_stale_ms",
    )?;
    let heartbeat_ms = nonzero(
        config.heartbeat_interval_ms.unwrap_or(30_000),
        "heartbeat_interval_ms",
    )?;
    let poll_ms = nonzero(config.poll_interval_ms.unwrap_or(1_000), "poll_interval_ms")?;
    let lease_ms = nonzero(config.lock_lease_ms.unwrap_or(stale_ms), "lock_lease_ms")?;

    let batch_size = config.batch_size.unwrap_or(10);
    if batch_size == 0 {
        return Err(ConfigError::ZeroSetting("batch_size"));
    }

    let concurrency = config.concurrency.unwrap_or(4);
    if concurrency == 0 {
        return Err(ConfigError::ZeroSetting("concurrency"));
    }

    let schema_version = config.schema_version.unwrap_or(1);
    if schema_version == 0 {
        return Err(ConfigError::ZeroSetting("schema_version"));
    }

    if heartbeat_ms >= stale_ms {
        return Err(ConfigError::HeartbeatTooSlow {
            heartbeat_ms,
            stale_ms,
        });
    }

    if lease_ms < stale_ms {
        return Err(ConfigError::LockLeaseTooShort { lease_ms, stale_ms });
    }

    Ok(WorkerCtx {
        module: config.module,
        schema_version,
        batch_size,
        concurrency,
        poll_interval: Duration::from_millis(poll_ms),
        heartbeat_interval: Duration::from_millis(heartbeat_ms),
        processing_stale: Duration::from_millis(stale_ms),
        retry_delay: Duration::from_millis(config.retry_delay_ms.unwrap_or(0)),
        lock_lease: Duration::from_millis(lease_ms),
    })
}

fn assemble_aliases(config: Option<AliasConfig>) -> Result<ModuleAliases, ConfigError> {
    let Some(config) = config else {
        return Ok(ModuleAliases::legacy());
    };

    let mut aliases = ModuleAliases::new();
    for alias in &config.allocation {
        aliases.insert(alias, ModuleKind::Allocation)?;
    }
    for alias in &config.risk {
        aliases.insert(alias, ModuleKind::Risk)?;
    }

    Ok(aliases)
}

fn assemble_telemetry(
    config: Option<TelemetryConfig>,
    secrets: Option<TelemetrySecrets>,
) -> Result<Option<TelemetryCtx>, ConfigError> {
    match (config, secrets) {
        (Some(config), Some(secrets)) => Ok(Some(TelemetryCtx::new(config, secrets))),
        (None, None) => Ok(None),
        (Some(_), None) => Err(ConfigError::TelemetrySecretsMissing),
        (None, Some(_)) => Err(ConfigError::TelemetryConfigMissing),
    }
}
