//! Copias con destino yt desde el mismo clúster o desde otro clúster yt.

use serde_json::Value;
use std::sync::Arc;
use tracing::{debug, info};

use super::readers::{range_rows, RangeReader};
use super::{scripts, CopyContext, RANGE_SIZE};
use crate::cluster::{
    ClusterClient, CreateOptions, LockMode, MergeMode, NodeType, OperationOptions, RemoteSource,
    TablePath,
};
use crate::config::Context;
use crate::error::{Result, TmError};
use crate::format::Format;
use crate::job::UserJob;
use crate::ranges::split_row_ranges;
use crate::transaction::{retry_in_transaction, run_in_transaction};

/// Lo que se captura del origen bajo el lock snapshot.
struct SourceInfo {
    row_count: u64,
    data_size: u64,
    sorted_by: Vec<String>,
    compression_codec: Option<String>,
    erasure_codec: Option<String>,
}

async fn source_info(
    client: &Arc<dyn ClusterClient>,
    ctx: &Context,
    table: &str,
) -> Result<SourceInfo> {
    let codec = |v: Value| v.as_str().map(str::to_string);
    Ok(SourceInfo {
        row_count: client.records_count(ctx, table).await?,
        data_size: client.data_size(ctx, table).await?,
        sorted_by: client.sorted_by(ctx, table).await?,
        compression_codec: codec(client.get_attribute(ctx, table, "compression_codec").await?),
        erasure_codec: codec(client.get_attribute(ctx, table, "erasure_codec").await?),
    })
}

impl CopyContext {
    /// Códecs finales: los pedidos en la tarea o, si no, los del origen.
    async fn finish_codecs(
        &self,
        client: &Arc<dyn ClusterClient>,
        ctx: &Context,
        table: &str,
        source: &SourceInfo,
    ) -> Result<()> {
        let compression = self
            .attributes
            .destination_compression_codec
            .as_deref()
            .or(source.compression_codec.as_deref());
        let erasure = self
            .attributes
            .destination_erasure_codec
            .as_deref()
            .or(source.erasure_codec.as_deref());
        self.set_codecs(client, ctx, table, compression, erasure).await
    }
}

/// Copia dentro del mismo clúster: copia de nodo, o merge si se pide
/// `force_copy_with_operation`.
pub(super) async fn copy_same_cluster(ctx: &CopyContext) -> Result<()> {
    let client = &ctx.destination.client;
    let src = ctx.source_path();
    let dst = ctx.destination_path();
    if src == dst {
        debug!(table = %src, "origen y destino coinciden");
        return Ok(());
    }
    let (src, dst) = (src.as_str(), dst.as_str());
    let engine = ctx.retry_engine();

    retry_in_transaction(&engine, client, &Context::new(), &ctx.transaction, |tx| async move {
        client.lock(&tx, src, &LockMode::Snapshot).await?;
        ctx.lock_destination(client, &tx, dst).await?;
        let source = source_info(client, &tx, src).await?;

        if ctx.attributes.force_copy_with_operation {
            client
                .create(&tx, NodeType::Table, dst, &CreateOptions { ignore_existing: true, ..Default::default() })
                .await?;
            let options = ctx.copy_options(format!("Copy {src} to {dst}"));
            let op = client
                .run_merge(&tx, vec![TablePath::new(src)], TablePath::new(dst), MergeMode::Auto, options)
                .await?;
            ctx.wait(op, client.name()).await?;
        } else {
            if client.exists(&tx, dst).await? {
                client.remove(&tx, dst, true, false).await?;
            }
            client.copy(&tx, src, dst, false).await?;
        }

        ctx.check_row_count(client, &tx, dst, source.row_count).await?;
        ctx.ensure_sorted(client, &tx, dst, &source.sorted_by).await?;
        ctx.finish_codecs(client, &tx, dst, &source).await
    })
    .await
}

/// Copia yt→yt con `remote_copy` nativo; ambos clústeres comparten red.
pub(super) async fn copy_remote(ctx: &CopyContext) -> Result<()> {
    let src_client = &ctx.source.client;
    let dst_client = &ctx.destination.client;
    let src = ctx.source_path();
    let dst = ctx.destination_path();
    let (src, dst) = (src.as_str(), dst.as_str());
    let root = &Context::new();
    let engine = ctx.retry_engine();

    // 1) compactar los chunks del origen, fuera de cualquier transacción
    let chunk_count = engine
        .run(move |_| async move {
            let count = src_client.get_attribute(root, src, "chunk_count").await?;
            Ok::<_, TmError>(count.as_u64().unwrap_or(0))
        })
        .await?;
    if chunk_count > 1 {
        engine
            .run(move |_| async move {
                let options = OperationOptions {
                    combine_chunks: true,
                    ..ctx.copy_options(format!("Combine chunks of {src}"))
                };
                let op = src_client
                    .run_merge(root, vec![TablePath::new(src)], TablePath::new(src), MergeMode::Auto, options)
                    .await?;
                ctx.wait(op, src_client.name()).await.map(drop)
            })
            .await?;
    }

    // 2) snapshot del origen y copia dentro de la transacción del destino
    retry_in_transaction(&engine, src_client, root, &ctx.transaction, |src_tx| async move {
        src_client.lock(&src_tx, src, &LockMode::Snapshot).await?;
        let source = source_info(src_client, &src_tx, src).await?;
        info!(table = src, rows = source.row_count, "remote copy");
        let (src_tx, source) = (&src_tx, &source);

        run_in_transaction(dst_client, &Context::new(), &ctx.transaction, |dst_tx| async move {
            ctx.lock_destination(dst_client, &dst_tx, dst).await?;
            let remote = RemoteSource {
                cluster_name: src_client.name().to_string(),
                network_name: ctx.destination.config.network.clone(),
                token: ctx.source_token(),
                transaction: src_tx.transaction.clone(),
                client: Some(src_client.clone()),
            };
            let op = dst_client
                .run_remote_copy(
                    &dst_tx,
                    TablePath::new(src),
                    TablePath::new(dst),
                    remote,
                    ctx.copy_options(format!("Remote copy {src} to {dst}")),
                )
                .await?;
            ctx.wait(op, dst_client.name()).await?;

            // 3) comprobaciones y códecs
            ctx.check_row_count(dst_client, &dst_tx, dst, source.row_count).await?;
            ctx.ensure_sorted(dst_client, &dst_tx, dst, &source.sorted_by).await?;
            ctx.finish_codecs(dst_client, &dst_tx, dst, source).await
        })
        .await
    })
    .await
}

/// Copia yt→yt leyendo rangos de filas a través del proxy del origen, con un
/// job por rango en el destino.
pub(super) async fn copy_through_proxy(ctx: &CopyContext) -> Result<()> {
    let src_client = &ctx.source.client;
    let dst_client = &ctx.destination.client;
    let src = ctx.source_path();
    let dst = ctx.destination_path();
    let (src, dst) = (src.as_str(), dst.as_str());
    let engine = ctx.retry_engine();

    retry_in_transaction(&engine, src_client, &Context::new(), &ctx.transaction, |src_tx| async move {
        // 1) snapshot y metadatos del origen
        src_client.lock(&src_tx, src, &LockMode::Snapshot).await?;
        let source = source_info(src_client, &src_tx, src).await?;
        let ranges = split_row_ranges(source.row_count, source.data_size, RANGE_SIZE);
        info!(table = src, rows = source.row_count, ranges = ranges.len(), "copia a través del proxy");
        let (src_tx, source, ranges) = (&src_tx, &source, &ranges);

        run_in_transaction(dst_client, &Context::new(), &ctx.transaction, |dst_tx| async move {
            ctx.lock_destination(dst_client, &dst_tx, dst).await?;

            // 2) tabla de rangos y destino
            let range_table = dst_client.create_temp_table(&dst_tx, None).await?;
            dst_client
                .write_rows(&dst_tx, &TablePath::new(&range_table), &range_rows(ranges))
                .await?;
            dst_client
                .create(&dst_tx, NodeType::Table, dst, &CreateOptions { ignore_existing: true, ..Default::default() })
                .await?;

            // 3) un job por rango
            let format = ctx.attributes.intermediate_format.as_deref().unwrap_or("json");
            let read_command = scripts::read_from_yt_command(
                src_client.proxy_address(),
                src,
                format,
                src_tx.transaction.as_ref(),
                ctx.source.config.network.is_some(),
            );
            let mut job = UserJob::mapper(
                RangeReader::new(src_client.clone(), src, src_tx.transaction.clone()),
                format!("bash {}", scripts::READ_FROM_YT_SCRIPT),
            )
            .with_formats(
                Format::SchemafulDsv {
                    columns: vec!["start".into(), "end".into()],
                },
                Format::Json,
            );
            for file in scripts::read_from_yt_files(ctx.source_token().as_deref(), &read_command) {
                job = job.with_file(file);
            }
            let options = OperationOptions {
                data_size_per_job: Some(1),
                ..ctx.copy_options(format!("Copy {src} from {}", src_client.name()))
            };
            let op = dst_client
                .run_map(&dst_tx, job, vec![TablePath::new(&range_table)], TablePath::new(dst), options)
                .await?;
            ctx.wait(op, dst_client.name()).await?;

            // 4) comprobaciones, orden y códecs
            ctx.check_row_count(dst_client, &dst_tx, dst, source.row_count).await?;
            ctx.ensure_sorted(dst_client, &dst_tx, dst, &source.sorted_by).await?;
            ctx.finish_codecs(dst_client, &dst_tx, dst, source).await
        })
        .await
    })
    .await
}

#[cfg(test)]
mod tests {
    use super::super::testing::*;
    use super::super::{execute_task, CopyEvent, CopyOutcome};
    use super::*;
    use crate::cluster::{ClusterKind, InMemoryCluster, OperationKind};
    use crate::error::{ErrorKind, TmError};
    use crate::cluster::TxId;
    use crate::retry::{Backoff, RetryPolicy};
    use crate::task::TaskAttributes;
    use rstest::rstest;
    use serde_json::json;
    use std::time::Duration;
    use tokio::sync::mpsc;
    use tokio_util::sync::CancellationToken;

    fn quick_retry(max_attempts: u32) -> RetryPolicy {
        RetryPolicy {
            max_attempts,
            backoff: Backoff {
                floor: Duration::from_millis(10),
                jitter: 0.0,
                ..Backoff::default()
            },
        }
    }

    fn clusters() -> (InMemoryCluster, InMemoryCluster) {
        (
            InMemoryCluster::new("plato", ClusterKind::Yt),
            InMemoryCluster::new("hahn", ClusterKind::Yt),
        )
    }

    async fn sort_source(cluster: &InMemoryCluster, path: &str) {
        let client: Arc<dyn ClusterClient> = Arc::new(cluster.clone());
        let root = Context::new();
        client
            .run_sort(&root, path.into(), path.into(), vec!["key".into()], Default::default())
            .await
            .unwrap()
            .wait(&Default::default(), Duration::from_millis(5), |_| {})
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn remote_copy_conserva_filas_y_orden() {
        let (src, dst) = clusters();
        write(&src, "//home/t", &yamr_rows(20)).await;
        sort_source(&src, "//home/t").await;

        let attrs = TaskAttributes::new("plato", "//home/t", "hahn", Some("//home/copy/t"));
        let (events_tx, mut events) = mpsc::unbounded_channel();
        let ctx = CopyContext::new(entry(&src, Some("fb")), entry(&dst, Some("fb")), attrs)
            .with_events(events_tx);

        assert_eq!(execute_task(&ctx).await.unwrap(), CopyOutcome::Completed);
        let rows = read(&dst, "//home/copy/t").await;
        assert_eq!(rows.len(), 20);
        assert_eq!(rows[0]["key"], "k0001");
        assert!(dst.started_operations().contains(&OperationKind::RemoteCopy));
        assert_eq!(src.active_transactions(), 0);
        assert_eq!(dst.active_transactions(), 0);

        let mut started = Vec::new();
        while let Ok(event) = events.try_recv() {
            if let CopyEvent::OperationStarted { cluster_name, .. } = event {
                started.push(cluster_name);
            }
        }
        assert!(started.contains(&"hahn".to_string()));
    }

    #[tokio::test]
    async fn copia_por_proxy_ordena_y_aplica_codecs() {
        let (src, dst) = clusters();
        write(&src, "//home/t", &yamr_rows(50)).await;
        sort_source(&src, "//home/t").await;

        let mut attrs = TaskAttributes::new("plato", "//home/t", "hahn", Some("//home/copy/t"));
        attrs.destination_compression_codec = Some("zstd_3".into());
        attrs.destination_erasure_codec = Some("lrc_12_2_2".into());
        let ctx = CopyContext::new(entry(&src, Some("fb")), entry(&dst, None), attrs);

        execute_task(&ctx).await.unwrap();
        let client: Arc<dyn ClusterClient> = Arc::new(dst.clone());
        let root = Context::new();
        assert_eq!(client.records_count(&root, "//home/copy/t").await.unwrap(), 50);
        assert_eq!(client.sorted_by(&root, "//home/copy/t").await.unwrap(), vec!["key"]);
        assert_eq!(
            client.get_attribute(&root, "//home/copy/t", "erasure_codec").await.unwrap(),
            json!("lrc_12_2_2")
        );
        let ops = dst.started_operations();
        assert!(ops.contains(&OperationKind::Map));
        assert!(ops.contains(&OperationKind::Sort));
        assert!(ops.contains(&OperationKind::Merge));
        assert!(!ops.contains(&OperationKind::RemoteCopy));
    }

    #[tokio::test]
    async fn fallo_de_la_operacion_aborta_y_no_deja_destino() {
        let (src, dst) = clusters();
        write(&src, "//home/t", &yamr_rows(5)).await;
        dst.inject_operation_failure(TmError::new(ErrorKind::TooManyFailedJobs, "Failed jobs limit exceeded"));

        let attrs = TaskAttributes::new("plato", "//home/t", "hahn", Some("//home/copy/t"));
        let ctx = CopyContext::new(entry(&src, None), entry(&dst, None), attrs).with_retry_policy(quick_retry(4));
        let err = execute_task(&ctx).await.unwrap_err();
        assert!(err.contains_code(ErrorKind::TooManyFailedJobs.code()));
        assert_eq!(dst.started_operations().len(), 1);

        let client: Arc<dyn ClusterClient> = Arc::new(dst.clone());
        assert!(!client.exists(&Context::new(), "//home/copy/t").await.unwrap());
        assert_eq!(dst.active_transactions(), 0);
    }

    #[tokio::test]
    async fn mismo_cluster_copia_el_nodo() {
        let (src, _) = clusters();
        write(&src, "//home/t", &yamr_rows(4)).await;
        write(&src, "//home/old", &yamr_rows(1)).await;

        let attrs = TaskAttributes::new("plato", "//home/t", "plato", Some("//home/old"));
        let ctx = CopyContext::new(entry(&src, None), entry(&src, None), attrs);
        execute_task(&ctx).await.unwrap();
        assert_eq!(read(&src, "//home/old").await.len(), 4);
        assert!(src.started_operations().is_empty());
    }

    #[tokio::test]
    async fn mismo_cluster_con_operacion_usa_merge() {
        let (src, _) = clusters();
        write(&src, "//home/t", &yamr_rows(4)).await;

        let mut attrs = TaskAttributes::new("plato", "//home/t", "plato", Some("//home/t2"));
        attrs.force_copy_with_operation = true;
        let ctx = CopyContext::new(entry(&src, None), entry(&src, None), attrs);
        execute_task(&ctx).await.unwrap();
        assert_eq!(read(&src, "//home/t2").await.len(), 4);
        assert_eq!(src.started_operations(), vec![OperationKind::Merge]);
    }

    #[rstest]
    #[case::limite_de_operaciones(false, "start_operation", ErrorKind::ConcurrentOperationsLimit)]
    #[case::conflicto_de_lock(false, "lock", ErrorKind::LockConflict)]
    #[case::transaccion_perdida(true, "lock", ErrorKind::NoSuchTransaction)]
    #[case::rate_limit(true, "exists", ErrorKind::RateLimit)]
    #[case::timeout(false, "start_operation", ErrorKind::Timeout)]
    #[tokio::test]
    async fn fallo_transitorio_se_reintenta(
        #[case] on_source: bool,
        #[case] method: &str,
        #[case] kind: ErrorKind,
    ) {
        let (src, dst) = clusters();
        write(&src, "//home/t", &yamr_rows(6)).await;
        let faulty = if on_source { &src } else { &dst };
        faulty.inject_request_failure(method, TmError::new(kind, "transient failure"));

        let attrs = TaskAttributes::new("plato", "//home/t", "hahn", Some("//home/copy/t"));
        let ctx = CopyContext::new(entry(&src, Some("fb")), entry(&dst, Some("fb")), attrs)
            .with_retry_policy(quick_retry(4));

        assert_eq!(execute_task(&ctx).await.unwrap(), CopyOutcome::Completed);
        assert_eq!(read(&dst, "//home/copy/t").await.len(), 6);
        assert_eq!(src.active_transactions(), 0);
        assert_eq!(dst.active_transactions(), 0);
    }

    #[tokio::test]
    async fn operacion_fallida_por_chunk_perdido_se_repite() {
        let (src, dst) = clusters();
        write(&src, "//home/t", &yamr_rows(5)).await;
        dst.inject_operation_failure(TmError::new(ErrorKind::ChunkUnavailable, "chunk lost"));

        let attrs = TaskAttributes::new("plato", "//home/t", "hahn", Some("//home/copy/t"));
        let ctx = CopyContext::new(entry(&src, None), entry(&dst, None), attrs).with_retry_policy(quick_retry(4));
        assert_eq!(execute_task(&ctx).await.unwrap(), CopyOutcome::Completed);
        assert_eq!(read(&dst, "//home/copy/t").await.len(), 5);
        assert_eq!(dst.active_transactions(), 0);
    }

    /// Otra tarea con el mismo destino tiene el lock compartido del padre.
    async fn lock_held_by_other(dst: &InMemoryCluster) -> (Arc<dyn ClusterClient>, TxId) {
        let client: Arc<dyn ClusterClient> = Arc::new(dst.clone());
        let root = Context::new();
        client.mkdir(&root, "//home/copy", true).await.unwrap();
        let other = client.begin_transaction(&root, Duration::from_secs(60)).await.unwrap();
        client
            .lock(
                &Context::in_transaction(other.clone()),
                "//home/copy",
                &LockMode::Shared { child_key: Some("t".into()) },
            )
            .await
            .unwrap();
        (client, other)
    }

    #[tokio::test]
    async fn destino_bloqueado_espera_a_que_se_libere() {
        let (src, dst) = clusters();
        write(&src, "//home/t", &yamr_rows(3)).await;
        let (client, other) = lock_held_by_other(&dst).await;
        let releaser = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(30)).await;
            client.abort_transaction(&Context::new(), &other).await.unwrap();
        });

        let attrs = TaskAttributes::new("plato", "//home/t", "hahn", Some("//home/copy/t"));
        let ctx = CopyContext::new(entry(&src, None), entry(&dst, None), attrs).with_retry_policy(quick_retry(8));
        assert_eq!(execute_task(&ctx).await.unwrap(), CopyOutcome::Completed);
        releaser.await.unwrap();
        assert_eq!(read(&dst, "//home/copy/t").await.len(), 3);
    }

    #[tokio::test]
    async fn destino_bloqueado_agota_los_reintentos() {
        let (src, dst) = clusters();
        write(&src, "//home/t", &yamr_rows(3)).await;
        let _held = lock_held_by_other(&dst).await;

        let attrs = TaskAttributes::new("plato", "//home/t", "hahn", Some("//home/copy/t"));
        let ctx = CopyContext::new(entry(&src, None), entry(&dst, None), attrs).with_retry_policy(quick_retry(3));
        let err = execute_task(&ctx).await.unwrap_err();
        assert!(err.is(ErrorKind::LockConflict));
        // solo queda la transacción de la otra tarea
        assert_eq!(dst.active_transactions(), 1);
        assert_eq!(src.active_transactions(), 0);
    }

    #[tokio::test]
    async fn cancelar_la_tarea_corta_la_espera_entre_intentos() {
        let (src, dst) = clusters();
        write(&src, "//home/t", &yamr_rows(3)).await;
        let _held = lock_held_by_other(&dst).await;

        let cancel = CancellationToken::new();
        let attrs = TaskAttributes::new("plato", "//home/t", "hahn", Some("//home/copy/t"));
        let ctx = CopyContext::new(entry(&src, None), entry(&dst, None), attrs)
            .with_cancel(cancel.clone())
            .with_retry_policy(RetryPolicy {
                max_attempts: 5,
                backoff: Backoff {
                    floor: Duration::from_secs(60),
                    jitter: 0.0,
                    ..Backoff::default()
                },
            });
        let canceller = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            cancel.cancel();
        });

        let err = tokio::time::timeout(Duration::from_secs(5), execute_task(&ctx))
            .await
            .expect("la espera entre intentos no atendió la cancelación")
            .unwrap_err();
        canceller.await.unwrap();
        assert!(err.is(ErrorKind::Cancelled));
        assert_eq!(src.active_transactions(), 0);
    }
}
