//! Copias entre yamr y yt, en ambos sentidos.

use serde_json::json;
use std::sync::Arc;
use tracing::{info, warn};
use uuid::Uuid;

use super::readers::{RangeReader, YamrWriter};
use super::{scripts, CopyContext, GB, MB, RANGE_SIZE};
use crate::cluster::{ClusterClient, LockMode, OperationOptions, TablePath};
use crate::config::Context;
use crate::error::{Result, TmError};
use crate::format::{Format, Row};
use crate::job::{JobDescriptor, UserJob};
use crate::ranges::{split_row_ranges, RowRange};
use crate::transaction::retry_in_transaction;

const YAMR_TEMP_DIR: &str = "//tmp/yt";
const YAMR_PULL_JOB_COUNT: u64 = 200;

fn yamr_temp_table() -> String {
    format!("{YAMR_TEMP_DIR}/{}", Uuid::new_v4())
}

/// Nombre de la tabla tal como lo entiende el binario de yamr.
fn yamr_name(path: &str) -> &str {
    path.trim_start_matches('/')
}

/// Comprueba el número de filas de un destino yamr; si no cuadra, borra el
/// destino para no dejar una copia a medias.
async fn check_or_drop(client: &Arc<dyn ClusterClient>, table: &str, expected: u64) -> Result<()> {
    let root = Context::new();
    let actual = client.records_count(&root, table).await?;
    if actual == expected {
        return Ok(());
    }
    warn!(table, expected, actual, "número de filas incorrecto, se borra el destino");
    client.remove(&root, table, false, true).await?;
    Err(TmError::incorrect_row_count(expected, actual).with_attribute("table", table))
}

/// yamr→yt: se congela el origen copiándolo a una tabla temporal de yamr y
/// los jobs del destino leen sus rangos.
pub(super) async fn copy_yamr_to_yt_pull(ctx: &CopyContext) -> Result<()> {
    let yamr = &ctx.source.client;
    let src = ctx.source_path();
    let src = src.as_str();
    let root = &Context::new();
    let engine = ctx.retry_engine();

    let (row_count, sorted) = engine
        .run(move |_| async move {
            Ok::<_, TmError>((yamr.records_count(root, src).await?, yamr.is_sorted(root, src).await?))
        })
        .await?;
    info!(table = %src, rows = row_count, sorted, "importando tabla de yamr");

    engine.run(move |_| yamr.mkdir(root, YAMR_TEMP_DIR, true)).await?;
    let temp = yamr_temp_table();
    let temp_path = temp.as_str();
    engine.run(move |_| yamr.copy(root, src, temp_path, false)).await?;

    let result = pull_from_yamr(ctx, &temp, row_count, sorted).await;
    // la copia temporal se borra siempre
    if let Err(e) = yamr.remove(root, &temp, false, true).await {
        warn!(table = %temp, "no se pudo borrar la tabla temporal: {e}");
    }
    result
}

async fn pull_from_yamr(ctx: &CopyContext, temp: &str, row_count: u64, sorted: bool) -> Result<()> {
    let yamr = &ctx.source.client;
    let yt = &ctx.destination.client;
    let dst = ctx.destination_path();
    let dst = dst.as_str();
    let engine = ctx.retry_engine();
    let root = &Context::new();

    let data_size = engine.run(move |_| yamr.data_size(root, temp)).await?;
    let fastbone = ctx.source.config.network.is_some();
    let commands: Vec<Row> = split_row_ranges(row_count, data_size, RANGE_SIZE)
        .into_iter()
        .map(|RowRange { lower, upper }| {
            let command = scripts::read_from_yamr_command(
                yamr.proxy_address(),
                yamr_name(temp),
                (lower, upper),
                fastbone,
            );
            let mut row = Row::new();
            row.insert("command".into(), json!(command));
            row.insert("start".into(), json!(lower));
            row.insert("end".into(), json!(upper));
            row
        })
        .collect();
    let commands = &commands;

    retry_in_transaction(&engine, yt, root, &ctx.transaction, |tx| async move {
        ctx.lock_destination(yt, &tx, dst).await?;
        let range_table = yt.create_temp_table(&tx, None).await?;
        yt.write_rows(&tx, &TablePath::new(&range_table), commands).await?;

        let job = UserJob::mapper(
            RangeReader::new(yamr.clone(), temp, None).to_yamr(),
            scripts::RUN_COMMANDS_SCRIPT,
        )
        .with_formats(
            Format::SchemafulDsv {
                columns: vec!["command".into()],
            },
            Format::yamr_lenval(),
        )
        .with_memory_limit(2500 * MB);
        let options = OperationOptions {
            data_size_per_job: Some(1),
            max_row_weight: Some(128 * MB),
            ..ctx.copy_options(format!("Import {} from {}", yamr_name(temp), yamr.name()))
        };
        let op = yt
            .run_map(&tx, job, vec![TablePath::new(&range_table)], TablePath::new(dst), options)
            .await?;
        ctx.wait(op, yt.name()).await?;

        ctx.check_row_count(yt, &tx, dst, row_count).await?;
        if sorted || ctx.attributes.destination_force_sort == Some(true) {
            ctx.ensure_sorted(yt, &tx, dst, &["key".to_string(), "subkey".to_string()])
                .await?;
        }
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

/// yt→yamr tirando desde yamr: los jobs de yamr leen rangos del origen yt
/// bajo un snapshot.
pub(super) async fn copy_yt_to_yamr_pull(ctx: &CopyContext) -> Result<()> {
    let yt = &ctx.source.client;
    let yamr = &ctx.destination.client;
    let src = ctx.source_path();
    let dst = ctx.destination_path();
    let (src, dst) = (src.as_str(), dst.as_str());
    let engine = ctx.retry_engine();

    retry_in_transaction(&engine, yt, &Context::new(), &ctx.transaction, |tx| async move {
        let root = Context::new();
        yt.lock(&tx, src, &LockMode::Snapshot).await?;
        let row_count = yt.records_count(&tx, src).await?;
        let data_size = yt.data_size(&tx, src).await?;
        let ranges: Vec<Row> = split_row_ranges(row_count, data_size, RANGE_SIZE)
            .into_iter()
            .map(|r| {
                let mut row = Row::new();
                row.insert("key".into(), json!(r.lower.to_string()));
                row.insert("subkey".into(), json!(""));
                row.insert("value".into(), json!(r.upper.to_string()));
                row
            })
            .collect();

        yamr.mkdir(&root, YAMR_TEMP_DIR, true).await?;
        let temp = yamr_temp_table();
        yamr.write_rows(&root, &TablePath::new(&temp), &ranges).await?;

        let result = async {
            let read_command = scripts::read_from_yt_command(
                yt.proxy_address(),
                src,
                "<has_subkey=true;lenval=true>yamr",
                tx.transaction.as_ref(),
                ctx.source.config.network.is_some(),
            );
            let mut job = UserJob::mapper(
                RangeReader::new(yt.clone(), src, tx.transaction.clone())
                    .with_columns("key", "value")
                    .to_yamr(),
                format!("./tm-lenval-to-nums | bash {}", scripts::READ_FROM_YT_SCRIPT),
            )
            .with_formats(Format::yamr_lenval(), Format::yamr_lenval());
            for file in scripts::read_from_yt_files(ctx.source_token().as_deref(), &read_command) {
                job = job.with_file(file);
            }
            let base = ctx.copy_options(format!("Export {src} from {}", yt.name()));
            let options = OperationOptions {
                job_count: base.job_count.or(Some(YAMR_PULL_JOB_COUNT)),
                ..base
            };
            let op = yamr
                .run_map(&root, job, vec![TablePath::new(&temp)], TablePath::new(dst), options)
                .await?;
            ctx.wait(op, yamr.name()).await?;
            check_or_drop(yamr, dst, row_count).await
        }
        .await;

        if let Err(e) = yamr.remove(&root, &temp, false, true).await {
            warn!(table = %temp, "no se pudo borrar la tabla temporal: {e}");
        }
        result
    })
    .await
}

/// yt→yamr empujando desde yt: un map en yt escribe cada job en yamr.
pub(super) async fn copy_yt_to_yamr_push(ctx: &CopyContext) -> Result<()> {
    let yt = &ctx.source.client;
    let yamr = &ctx.destination.client;
    let src = ctx.source_path();
    let dst = ctx.destination_path();
    let (src, dst) = (src.as_str(), dst.as_str());
    let root = &Context::new();
    let engine = ctx.retry_engine();

    let occupied = engine
        .run(move |_| async move {
            Ok::<_, TmError>(yamr.exists(root, dst).await? && !yamr.is_empty(root, dst).await?)
        })
        .await?;
    if occupied {
        info!(table = dst, "el destino de yamr no está vacío, se borra");
        engine.run(move |_| yamr.remove(root, dst, false, true)).await?;
    }

    let row_count = retry_in_transaction(&engine, yt, root, &ctx.transaction, |tx| async move {
        yt.lock(&tx, src, &LockMode::Snapshot).await?;
        let row_count = yt.records_count(&tx, src).await?;
        let output = yt.create_temp_table(&tx, None).await?;

        let writer = YamrWriter {
            target: yamr.clone(),
            table: dst.to_string(),
        };
        let job = UserJob::new(
            JobDescriptor::Aggregator(Arc::new(writer)),
            scripts::write_to_yamr_command(
                yamr.proxy_address(),
                yamr_name(dst),
                ctx.destination.config.network.is_some(),
            ),
        )
        .with_formats(Format::yamr_lenval(), Format::yamr_lenval())
        .with_memory_limit(2000 * MB);
        let options = OperationOptions {
            data_size_per_job: Some(2 * GB),
            ..ctx.copy_options(format!("Push {src} to {}", yamr.name()))
        };
        let op = yt
            .run_map(&tx, job, vec![TablePath::new(src)], TablePath::new(&output), options)
            .await?;
        ctx.wait(op, yt.name()).await?;
        Ok(row_count)
    })
    .await?;

    check_or_drop(yamr, dst, row_count).await
}

#[cfg(test)]
mod tests {
    use super::super::testing::*;
    use super::super::execute_task;
    use super::*;
    use crate::cluster::{ClusterKind, InMemoryCluster, OperationKind};
    use crate::error::ErrorKind;
    use crate::task::{CopyMethod, TaskAttributes};

    fn clusters() -> (InMemoryCluster, InMemoryCluster) {
        (
            InMemoryCluster::new("cedar", ClusterKind::Yamr),
            InMemoryCluster::new("hahn", ClusterKind::Yt),
        )
    }

    fn client(cluster: &InMemoryCluster) -> Arc<dyn ClusterClient> {
        Arc::new(cluster.clone())
    }

    #[tokio::test]
    async fn yamr_a_yt_importa_y_borra_la_temporal() {
        let (yamr, yt) = clusters();
        write(&yamr, "//home/t", &yamr_rows(30)).await;

        let mut attrs = TaskAttributes::new("cedar", "home/t", "hahn", Some("//home/import/t"));
        attrs.destination_force_sort = Some(true);
        let ctx = CopyContext::new(entry(&yamr, None), entry(&yt, None), attrs);
        execute_task(&ctx).await.unwrap();

        let yt_client = client(&yt);
        let root = Context::new();
        assert_eq!(yt_client.records_count(&root, "//home/import/t").await.unwrap(), 30);
        assert_eq!(
            yt_client.sorted_by(&root, "//home/import/t").await.unwrap(),
            vec!["key", "subkey"]
        );
        assert!(client(&yamr).list(&root, YAMR_TEMP_DIR).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn yt_a_yamr_pull_lee_rangos_desde_yamr() {
        let (yamr, yt) = clusters();
        write(&yt, "//home/t", &yamr_rows(12)).await;

        let attrs = TaskAttributes::new("hahn", "//home/t", "cedar", Some("home/export"));
        let ctx = CopyContext::new(entry(&yt, None), entry(&yamr, None), attrs);
        execute_task(&ctx).await.unwrap();

        assert_eq!(read(&yamr, "//home/export").await.len(), 12);
        assert_eq!(yamr.started_operations(), vec![OperationKind::Map]);
        assert!(yt.started_operations().is_empty());
        assert_eq!(yt.active_transactions(), 0);
    }

    #[tokio::test]
    async fn yt_a_yamr_push_reemplaza_un_destino_no_vacio() {
        let (yamr, yt) = clusters();
        write(&yt, "//home/t", &yamr_rows(8)).await;
        write(&yamr, "//home/export", &yamr_rows(3)).await;

        let mut attrs = TaskAttributes::new("hahn", "//home/t", "cedar", Some("home/export"));
        attrs.copy_method = CopyMethod::Push;
        let ctx = CopyContext::new(entry(&yt, None), entry(&yamr, None), attrs);
        execute_task(&ctx).await.unwrap();

        assert_eq!(read(&yamr, "//home/export").await.len(), 8);
        assert_eq!(yt.started_operations(), vec![OperationKind::Map]);
    }

    #[tokio::test]
    async fn filas_no_representables_en_yamr_rompen_la_copia() {
        let (yamr, yt) = clusters();
        let mut row = Row::new();
        row.insert("key".into(), json!(1));
        row.insert("value".into(), json!("v"));
        write(&yt, "//home/t", &[row]).await;

        let attrs = TaskAttributes::new("hahn", "//home/t", "cedar", Some("home/export"));
        let ctx = CopyContext::new(entry(&yt, None), entry(&yamr, None), attrs);
        let err = execute_task(&ctx).await.unwrap_err();
        assert!(err.contains_code(crate::error::codes::FORMAT_ERROR));
    }

    #[tokio::test]
    async fn numero_de_filas_incorrecto_borra_el_destino() {
        let (yamr, _) = clusters();
        write(&yamr, "//home/export", &yamr_rows(3)).await;

        let err = check_or_drop(&client(&yamr), "//home/export", 5).await.unwrap_err();
        assert!(err.is(ErrorKind::IncorrectRowCount));
        assert!(!client(&yamr).exists(&Context::new(), "//home/export").await.unwrap());
    }
}
