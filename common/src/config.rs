//! Configuración explícita del sistema. No hay estado global: cada cliente
//! recibe su `Config` (o las partes que necesita) al construirse.

use std::{env, path::PathBuf, time::Duration};

use crate::cluster::TxId;
use crate::error::{ErrorKind, TmError};
use crate::retry::RetryPolicy;

pub const DEFAULT_MASTER_URL: &str = "http://localhost:8080";
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(10);
pub const DEFAULT_TRANSACTION_TIMEOUT: Duration = Duration::from_secs(60);

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("valor inválido para {var}: {value:?}")]
    InvalidVar { var: &'static str, value: String },
    #[error("no se pudo leer {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("configuración mal formada: {0}")]
    Parse(#[from] serde_json::Error),
}

impl From<ConfigError> for TmError {
    fn from(e: ConfigError) -> Self {
        TmError::invalid_request(e.to_string())
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct HttpConfig {
    pub request_timeout: Duration,
    pub retry: RetryPolicy,
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self {
            request_timeout: DEFAULT_REQUEST_TIMEOUT,
            retry: RetryPolicy::default(),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct TransactionConfig {
    pub timeout: Duration,
    pub ping_period: Duration,
}

impl TransactionConfig {
    pub fn with_timeout(timeout: Duration) -> Self {
        Self {
            timeout,
            ping_period: timeout / 3,
        }
    }
}

impl Default for TransactionConfig {
    fn default() -> Self {
        Self::with_timeout(DEFAULT_TRANSACTION_TIMEOUT)
    }
}

#[derive(Debug, Clone)]
pub struct Config {
    pub master_url: String,
    pub token: Option<String>,
    pub proxy: Option<String>,
    pub log_exit_code: bool,
    pub clusters_config: Option<PathBuf>,
    pub http: HttpConfig,
    pub transaction: TransactionConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            master_url: DEFAULT_MASTER_URL.to_string(),
            token: None,
            proxy: None,
            log_exit_code: false,
            clusters_config: None,
            http: HttpConfig::default(),
            transaction: TransactionConfig::default(),
        }
    }
}

impl Config {
    /// Lee la configuración de las variables de entorno del proceso.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|name| env::var(name).ok())
    }

    /// Igual que `from_env`, con una fuente de variables arbitraria.
    /// Las variables `YT_*` no reconocidas se ignoran.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = Config::default();

        if let Some(url) = lookup("MASTER_URL").filter(|s| !s.is_empty()) {
            config.master_url = url.trim_end_matches('/').to_string();
        }
        config.token = lookup("YT_TOKEN").filter(|s| !s.is_empty());
        config.proxy = lookup("YT_PROXY").filter(|s| !s.is_empty());
        config.log_exit_code = match lookup("YT_LOG_EXIT_CODE") {
            None => false,
            Some(v) => parse_flag("YT_LOG_EXIT_CODE", &v)?,
        };
        if let Some(ms) = lookup("TM_REQUEST_TIMEOUT_MS") {
            let ms: u64 = ms.trim().parse().map_err(|_| ConfigError::InvalidVar {
                var: "TM_REQUEST_TIMEOUT_MS",
                value: ms.clone(),
            })?;
            config.http.request_timeout = Duration::from_millis(ms);
        }
        config.clusters_config = lookup("TM_CLUSTERS_CONFIG")
            .filter(|s| !s.is_empty())
            .map(PathBuf::from);

        Ok(config)
    }
}

fn parse_flag(var: &'static str, value: &str) -> Result<bool, ConfigError> {
    match value.trim().to_ascii_lowercase().as_str() {
        "" | "0" | "false" | "no" => Ok(false),
        "1" | "true" | "yes" => Ok(true),
        _ => Err(ConfigError::InvalidVar {
            var,
            value: value.to_string(),
        }),
    }
}

/// Contexto por llamada a un `ClusterClient`: transacción actual y modo de
/// ping de ancestros.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Context {
    pub transaction: Option<TxId>,
    pub ping_ancestors: bool,
}

impl Context {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn in_transaction(tx: TxId) -> Self {
        Self {
            transaction: Some(tx),
            ping_ancestors: false,
        }
    }

    pub fn with_ping_ancestors(mut self, value: bool) -> Self {
        self.ping_ancestors = value;
        self
    }

    pub fn require_transaction(&self) -> Result<&TxId, TmError> {
        self.transaction.as_ref().ok_or_else(|| {
            TmError::new(
                ErrorKind::NoSuchTransaction,
                "Operation requires a transaction",
            )
        })
    }
}
