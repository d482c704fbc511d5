//! Expansión de patrones origen/destino en pares de tablas.
//!
//! - Ruta con `*` o `?`: se busca en el origen con semántica de `glob`
//!   (los comodines no cruzan `/`) y lo capturado por el `*` sustituye al
//!   `*` del destino.
//! - Ruta a un directorio: todas las tablas debajo, y el destino conserva
//!   la ruta relativa.
//! - Cualquier otra ruta: un único par.

use glob::{MatchOptions, Pattern};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::debug;

use crate::cluster::{ClusterClient, ClusterKind, NodeType, SearchFilter};
use crate::config::Context;
use crate::copy::table_path;
use crate::error::{Result, TmError};

/// Cuerpo de `POST /match/`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MatchRequest {
    pub source_cluster: String,
    pub source_pattern: String,
    pub destination_cluster: String,
    pub destination_pattern: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MatchPair {
    pub source: String,
    pub destination: String,
}

const WILDCARDS: [char; 2] = ['*', '?'];

fn has_wildcards(path: &str) -> bool {
    path.contains(WILDCARDS)
}

fn options() -> MatchOptions {
    MatchOptions {
        case_sensitive: true,
        require_literal_separator: true,
        require_literal_leading_dot: false,
    }
}

/// Vuelve a la forma con la que el usuario nombra las tablas del clúster.
fn user_path(kind: ClusterKind, path: &str) -> String {
    if kind == ClusterKind::Yamr {
        path.trim_start_matches('/').to_string()
    } else {
        path.to_string()
    }
}

async fn tables_under(source: &Arc<dyn ClusterClient>, root: &str) -> Result<Vec<String>> {
    let filter = SearchFilter {
        node_types: vec![NodeType::Table],
        depth_bound: None,
    };
    source.search(&Context::new(), root, &filter).await
}

/// Expande `src_pattern`/`dst_pattern` contra el espacio de nombres de
/// `source`. Los pares salen ordenados por ruta de origen.
pub async fn match_src_dst_pattern(
    source: &Arc<dyn ClusterClient>,
    src_pattern: &str,
    dst_pattern: &str,
) -> Result<Vec<MatchPair>> {
    let kind = source.kind();
    let src = table_path(kind, src_pattern);
    let root = Context::new();

    if has_wildcards(&src) {
        return match_glob(source, &src, dst_pattern).await;
    }
    if has_wildcards(dst_pattern) {
        return Err(TmError::invalid_request(format!(
            "Destination pattern {dst_pattern} has wildcards but source {src_pattern} has none"
        )));
    }

    if !source.exists(&root, &src).await? {
        return Err(TmError::resolve(&src).with_attribute("cluster", source.name()));
    }
    let node_type = source.get_attribute(&root, &src, "type").await?;
    if node_type.as_str() != Some(NodeType::MapNode.as_str()) {
        return Ok(vec![MatchPair {
            source: user_path(kind, &src),
            destination: dst_pattern.to_string(),
        }]);
    }

    let dst_root = dst_pattern.trim_end_matches('/');
    let pairs = tables_under(source, &src)
        .await?
        .into_iter()
        .map(|table| {
            let relative = &table[src.trim_end_matches('/').len()..];
            MatchPair {
                source: user_path(kind, &table),
                destination: format!("{dst_root}{relative}"),
            }
        })
        .collect::<Vec<_>>();
    debug!(source = %src, tables = pairs.len(), "directorio expandido");
    Ok(pairs)
}

async fn match_glob(
    source: &Arc<dyn ClusterClient>,
    src: &str,
    dst_pattern: &str,
) -> Result<Vec<MatchPair>> {
    if src.matches('*').count() > 1 || dst_pattern.matches('*').count() != src.matches('*').count() {
        return Err(TmError::invalid_request(format!(
            "Source {src} and destination {dst_pattern} must contain the same single '*'"
        )));
    }
    let pattern = Pattern::new(src)
        .map_err(|e| TmError::invalid_request(format!("Invalid pattern {src}: {e}")))?;

    // raíz de búsqueda: el directorio anterior al primer comodín
    let first = src.find(WILDCARDS).unwrap_or(src.len());
    let search_root = match src[..first].rfind('/') {
        Some(idx) if idx > 1 => &src[..idx],
        _ => "/",
    };
    if !source.exists(&Context::new(), search_root).await? {
        return Ok(Vec::new());
    }

    let (prefix, suffix) = src.split_once('*').unwrap_or((src, ""));
    let (prefix_len, suffix_len) = (prefix.chars().count(), suffix.chars().count());
    let kind = source.kind();
    let pairs = tables_under(source, search_root)
        .await?
        .into_iter()
        .filter(|table| pattern.matches_with(table, options()))
        .map(|table| {
            let total = table.chars().count();
            let captured: String = table
                .chars()
                .skip(prefix_len)
                .take(total.saturating_sub(prefix_len + suffix_len))
                .collect();
            MatchPair {
                source: user_path(kind, &table),
                destination: dst_pattern.replacen('*', &captured, 1),
            }
        })
        .collect();
    Ok(pairs)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cluster::{CreateOptions, InMemoryCluster};
    use rstest::rstest;

    async fn namespace(kind: ClusterKind, tables: &[&str]) -> Arc<dyn ClusterClient> {
        let client: Arc<dyn ClusterClient> = Arc::new(InMemoryCluster::new("src", kind));
        for t in tables {
            client
                .create(&Context::new(), NodeType::Table, t, &CreateOptions::recursive())
                .await
                .unwrap();
        }
        client
    }

    fn pairs(list: &[(&str, &str)]) -> Vec<MatchPair> {
        list.iter()
            .map(|(s, d)| MatchPair {
                source: s.to_string(),
                destination: d.to_string(),
            })
            .collect()
    }

    #[tokio::test]
    async fn tabla_suelta_da_un_par() {
        let src = namespace(ClusterKind::Yt, &["//a/t"]).await;
        let got = match_src_dst_pattern(&src, "//a/t", "//b/t").await.unwrap();
        assert_eq!(got, pairs(&[("//a/t", "//b/t")]));
    }

    #[tokio::test]
    async fn directorio_conserva_rutas_relativas() {
        let src = namespace(ClusterKind::Yt, &["//tmp/d/t1", "//tmp/d/sub/t2"]).await;
        let got = match_src_dst_pattern(&src, "//tmp/d", "//backup/d/").await.unwrap();
        assert_eq!(
            got,
            pairs(&[("//tmp/d/sub/t2", "//backup/d/sub/t2"), ("//tmp/d/t1", "//backup/d/t1")])
        );
    }

    #[rstest]
    #[case("//logs/2024-*", "//arch/*/log", &[("//logs/2024-01", "//arch/01/log"), ("//logs/2024-02", "//arch/02/log")])]
    #[case("//logs/*-01", "//arch/*", &[("//logs/2023-01", "//arch/2023"), ("//logs/2024-01", "//arch/2024")])]
    #[case("//logs/2025-*", "//arch/*", &[])]
    #[tokio::test]
    async fn comodin_sustituye_lo_capturado(
        #[case] src_pattern: &str,
        #[case] dst_pattern: &str,
        #[case] expected: &[(&str, &str)],
    ) {
        let src = namespace(
            ClusterKind::Yt,
            &["//logs/2023-01", "//logs/2024-01", "//logs/2024-02", "//logs/2024-01x/deep"],
        )
        .await;
        let got = match_src_dst_pattern(&src, src_pattern, dst_pattern).await.unwrap();
        assert_eq!(got, pairs(expected));
    }

    #[tokio::test]
    async fn rutas_de_yamr_sin_barras() {
        let src = namespace(ClusterKind::Yamr, &["//home/t1", "//home/t2"]).await;
        let got = match_src_dst_pattern(&src, "home/t*", "//yt/t*").await.unwrap();
        assert_eq!(got, pairs(&[("home/t1", "//yt/t1"), ("home/t2", "//yt/t2")]));
    }

    #[rstest]
    #[case("//a/*", "//b/c")]
    #[case("//a/*/*", "//b/*/*")]
    #[case("//a/t", "//b/*")]
    #[tokio::test]
    async fn comodines_inconsistentes_son_invalid_request(#[case] src_pattern: &str, #[case] dst_pattern: &str) {
        let src = namespace(ClusterKind::Yt, &["//a/t"]).await;
        let err = match_src_dst_pattern(&src, src_pattern, dst_pattern).await.unwrap_err();
        assert!(err.message.contains(src_pattern) || err.message.contains(dst_pattern));
    }

    #[tokio::test]
    async fn origen_inexistente_es_error_de_resolucion() {
        let src = namespace(ClusterKind::Yt, &[]).await;
        let err = match_src_dst_pattern(&src, "//nope", "//b").await.unwrap_err();
        assert!(err.is(crate::error::ErrorKind::Resolve));
    }
}
