//! Directorio de clústeres: nombre → cliente y metadatos de red.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::{collections::BTreeMap, fmt, fs, path::Path, sync::Arc};
use tracing::info;

use super::{ClusterClient, ClusterKind, InMemoryCluster};
use crate::config::ConfigError;
use crate::error::{Result, TmError};

/// Entrada del fichero de configuración de clústeres.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClusterConfig {
    #[serde(rename = "type")]
    pub kind: ClusterKind,
    #[serde(default)]
    pub proxy: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub network: Option<String>,
    /// Opciones base de `kwworm` para clústeres kiwi.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub kwworm_options: Vec<Value>,
}

/// Lo que devuelve `GET /api/v1/config/`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct BackendConfig {
    #[serde(default)]
    pub backend_tag: String,
    #[serde(default)]
    pub clusters: BTreeMap<String, ClusterConfig>,
}

impl BackendConfig {
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let raw = fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Ok(serde_json::from_str(&raw)?)
    }
}

#[derive(Clone)]
pub struct ClusterEntry {
    pub client: Arc<dyn ClusterClient>,
    pub config: ClusterConfig,
}

impl ClusterEntry {
    pub fn kind(&self) -> ClusterKind {
        self.config.kind
    }

    /// Dos entradas se alcanzan con remote_copy nativo si comparten red.
    pub fn same_network(&self, other: &ClusterEntry) -> bool {
        self.config.network == other.config.network
    }
}

impl fmt::Debug for ClusterEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ClusterEntry")
            .field("name", &self.client.name())
            .field("config", &self.config)
            .finish()
    }
}

#[derive(Debug, Clone, Default)]
pub struct ClusterDirectory {
    backend_tag: String,
    entries: BTreeMap<String, ClusterEntry>,
}

impl ClusterDirectory {
    pub fn new(backend_tag: &str) -> Self {
        Self {
            backend_tag: backend_tag.to_string(),
            entries: BTreeMap::new(),
        }
    }

    /// Un `InMemoryCluster` por entrada de la configuración.
    pub fn in_memory(config: &BackendConfig) -> Self {
        let mut directory = Self::new(&config.backend_tag);
        for (name, cluster) in &config.clusters {
            let client = InMemoryCluster::with_proxy(name, cluster.kind, &cluster.proxy, None);
            directory.insert(Arc::new(client), cluster.clone());
        }
        info!(
            backend_tag = %config.backend_tag,
            clusters = directory.entries.len(),
            "directorio de clústeres en memoria"
        );
        directory
    }

    pub fn insert(&mut self, client: Arc<dyn ClusterClient>, config: ClusterConfig) {
        self.entries.insert(
            client.name().to_string(),
            ClusterEntry { client, config },
        );
    }

    pub fn with(mut self, client: Arc<dyn ClusterClient>, network: Option<&str>) -> Self {
        let config = ClusterConfig {
            kind: client.kind(),
            proxy: client.proxy_address().to_string(),
            network: network.map(str::to_string),
            kwworm_options: Vec::new(),
        };
        self.insert(client, config);
        self
    }

    pub fn get(&self, name: &str) -> Result<&ClusterEntry> {
        self.entries.get(name).ok_or_else(|| {
            TmError::invalid_request(format!("Unknown cluster name {name:?}"))
                .with_attribute("cluster", name)
        })
    }

    pub fn client(&self, name: &str) -> Result<Arc<dyn ClusterClient>> {
        Ok(self.get(name)?.client.clone())
    }

    pub fn backend_tag(&self) -> &str {
        &self.backend_tag
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.entries.keys().map(String::as_str)
    }

    pub fn config(&self) -> BackendConfig {
        BackendConfig {
            backend_tag: self.backend_tag.clone(),
            clusters: self
                .entries
                .iter()
                .map(|(name, entry)| (name.clone(), entry.config.clone()))
                .collect(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn config_se_lee_desde_json() {
        let raw = json!({
            "backend_tag": "production",
            "clusters": {
                "hahn": {"type": "yt", "proxy": "hahn.yt.net", "network": "fastbone"},
                "cedar": {"type": "yamr", "proxy": "cedar00"},
            }
        });
        let config: BackendConfig = serde_json::from_value(raw).unwrap();
        assert_eq!(config.clusters["hahn"].kind, ClusterKind::Yt);
        assert_eq!(config.clusters["cedar"].network, None);

        let directory = ClusterDirectory::in_memory(&config);
        assert_eq!(directory.backend_tag(), "production");
        assert_eq!(directory.names().collect::<Vec<_>>(), vec!["cedar", "hahn"]);
        assert_eq!(directory.client("hahn").unwrap().proxy_address(), "hahn.yt.net");
        assert_eq!(directory.config(), config);
    }

    #[test]
    fn cluster_desconocido_es_error() {
        let directory = ClusterDirectory::new("test");
        let err = directory.get("nope").unwrap_err();
        assert!(err.message.contains("Unknown cluster name"));
    }

    #[test]
    fn fichero_inexistente_da_error_de_io() {
        let err = BackendConfig::load(Path::new("/nonexistent/clusters.json")).unwrap_err();
        assert!(matches!(err, ConfigError::Io { .. }));
    }
}
