//! Importación hive→yt: un job por fichero exportado de la tabla de hive.

use serde_json::{json, Value};
use tracing::info;

use super::readers::HiveFileReader;
use super::{scripts, CopyContext, GB};
use crate::cluster::{CreateOptions, NodeType, OperationOptions, TablePath};
use crate::config::Context;
use crate::error::{Result, TmError};
use crate::format::{Format, Row};
use crate::job::UserJob;
use crate::transaction::retry_in_transaction;

/// Formato de los ficheros exportados, según el campo `format` de la
/// configuración del split (json si falta).
fn export_format(config: &Value) -> Result<Format> {
    let name = config.get("format").and_then(Value::as_str).unwrap_or("json");
    serde_json::from_value(json!({ "name": name }))
        .map_err(|e| TmError::format(format!("unsupported hive export format {name:?}: {e}")))
}

pub(super) async fn copy_hive_to_yt(ctx: &CopyContext) -> Result<()> {
    let hive = &ctx.source.client;
    let yt = &ctx.destination.client;
    let src = ctx.source_path();
    let dst = ctx.destination_path();
    let (src, dst) = (src.as_str(), dst.as_str());

    let root = &Context::new();
    let engine = ctx.retry_engine();

    // 1) ficheros y configuración del export
    let export = engine.run(move |_| hive.hive_table_files(root, src)).await?;
    let format = export_format(&export.config)?;
    info!(table = src, files = export.files.len(), format = format.name(), "importando desde hive");
    let config = export.config.to_string();
    let files: Vec<Row> = export
        .files
        .iter()
        .map(|file| {
            let mut row = Row::new();
            row.insert("file".into(), json!(file));
            row
        })
        .collect();
    let (files, config, format) = (&files, config.as_str(), &format);

    retry_in_transaction(&engine, yt, root, &ctx.transaction, |tx| async move {
        ctx.lock_destination(yt, &tx, dst).await?;
        let options = CreateOptions {
            ignore_existing: true,
            ..Default::default()
        };
        yt.create(&tx, NodeType::Table, dst, &options).await?;
        let file_table = yt.create_temp_table(&tx, None).await?;
        yt.write_rows(&tx, &TablePath::new(&file_table), files).await?;

        // 2) un job por fichero
        let reader = HiveFileReader {
            hive: hive.clone(),
            format: format.clone(),
        };
        let job = UserJob::mapper(reader, scripts::hive_read_command(config))
            .with_formats(
                Format::SchemafulDsv {
                    columns: vec!["file".into()],
                },
                Format::Json,
            )
            .with_memory_limit(2 * GB);
        let base = ctx.copy_options(format!("Import {src} from hive {}", hive.name()));
        let spec = OperationOptions {
            data_size_per_job: Some(1),
            ..base
        };
        let op = yt
            .run_map(&tx, job, vec![TablePath::new(&file_table)], TablePath::new(dst), spec)
            .await?;
        ctx.wait(op, yt.name()).await?;

        // 3) códecs pedidos
        ctx.set_codecs(
            yt,
            &tx,
            dst,
            ctx.attributes.destination_compression_codec.as_deref(),
            ctx.attributes.destination_erasure_codec.as_deref(),
        )
        .await
    })
    .await
}

#[cfg(test)]
mod tests {
    use super::super::testing::*;
    use super::super::execute_task;
    use super::*;
    use crate::cluster::{ClusterClient, ClusterKind, InMemoryCluster};
    use crate::task::TaskAttributes;
    use bytes::Bytes;
    use std::sync::Arc;

    #[test]
    fn formato_del_export() {
        assert_eq!(export_format(&json!({})).unwrap(), Format::Json);
        assert_eq!(export_format(&json!({"format": "dsv"})).unwrap(), Format::Dsv);
        assert!(export_format(&json!({"format": "orc"})).is_err());
    }

    #[tokio::test]
    async fn ficheros_de_hive_llegan_a_yt() {
        let hive = InMemoryCluster::new("hive", ClusterKind::Hive);
        let yt = InMemoryCluster::new("hahn", ClusterKind::Yt);
        let client: Arc<dyn ClusterClient> = Arc::new(hive.clone());
        let root = Context::new();
        client.mkdir(&root, "//warehouse/logs", true).await.unwrap();
        for (name, data) in [("part-0", "{\"a\":1}\n{\"a\":2}\n"), ("part-1", "{\"a\":3}\n")] {
            client
                .write_file(&root, &format!("//warehouse/logs/{name}"), Bytes::from(data))
                .await
                .unwrap();
        }

        let mut attrs = TaskAttributes::new("hive", "//warehouse/logs", "hahn", Some("//home/logs"));
        attrs.destination_compression_codec = Some("zstd_6".into());
        let ctx = CopyContext::new(entry(&hive, None), entry(&yt, None), attrs);
        execute_task(&ctx).await.unwrap();

        let mut values: Vec<i64> = read(&yt, "//home/logs")
            .await
            .iter()
            .map(|row| row["a"].as_i64().unwrap())
            .collect();
        values.sort();
        assert_eq!(values, vec![1, 2, 3]);
        let yt_client: Arc<dyn ClusterClient> = Arc::new(yt.clone());
        let codec = yt_client
            .get_attribute(&root, "//home/logs", "compression_codec")
            .await
            .unwrap();
        assert_eq!(codec, "zstd_6");
        assert_eq!(yt.active_transactions(), 0);
    }
}
