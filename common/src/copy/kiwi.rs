//! Exportación yt→kiwi. El map corre en el propio clúster yt de origen; cada
//! job lee su rango y entrega la columna `value` al escritor de kiwi.

use async_trait::async_trait;
use serde_json::{json, Value};
use std::sync::Arc;
use tracing::{info, warn};

use super::readers::{range_rows, row_range};
use super::{scripts, CopyContext, KIWI_RANGE_SIZE, MB};
use crate::cluster::{ClusterClient, LockMode, OperationOptions, TablePath, TxId};
use crate::config::Context;
use crate::error::{Result, TmError};
use crate::format::{Format, Row};
use crate::job::{JobContext, JobFile, Mapper, UserJob};
use crate::ranges::{split_row_ranges, TableRange};
use crate::transaction::retry_in_transaction;

/// Raíz donde el clúster kiwi en memoria guarda lo recibido, una tabla por
/// usuario.
pub const KIWI_STORAGE_ROOT: &str = "//kiwi";
pub const DEFAULT_KIWI_USER: &str = "kwworm";
const DEFAULT_MAX_FAILED_JOBS: u64 = 1000;
/// Errores de escritura que se adjuntan al fallo de la tarea.
const REPORTED_ERRORS: usize = 10;

/* ---------------- opciones de kwworm ---------------- */

fn option_key(option: &Value) -> Option<&str> {
    match option {
        Value::String(s) => Some(s),
        Value::Array(items) => items.first().and_then(Value::as_str),
        _ => None,
    }
}

fn option_text(option: &Value) -> String {
    match option {
        Value::String(s) => s.clone(),
        Value::Array(items) => items
            .iter()
            .map(|v| v.as_str().map(str::to_string).unwrap_or_else(|| v.to_string()))
            .collect::<Vec<_>>()
            .join(" "),
        other => other.to_string(),
    }
}

/// Cada opción es un texto o una lista `[clave, valor...]`. Una opción de
/// `extra` con la misma clave reemplaza a la base en su posición; el resto
/// se añade al final.
pub fn merge_kwworm_options(base: &[Value], extra: &[Value]) -> Vec<Value> {
    let mut result = base.to_vec();
    for option in extra {
        let key = option_key(option);
        match result
            .iter()
            .position(|existing| key.is_some() && option_key(existing) == key)
        {
            Some(index) => result[index] = option.clone(),
            None => result.push(option.clone()),
        }
    }
    result
}

/// Línea de comandos de `kwworm` con `{kiwi_url}` y `{kiwi_user}`
/// sustituidos.
pub fn kwworm_command(options: &[Value], kiwi_url: &str, kiwi_user: &str) -> String {
    let args: Vec<String> = options.iter().map(option_text).collect();
    format!("./kwworm {}", args.join(" "))
        .replace("{kiwi_url}", kiwi_url)
        .replace("{kiwi_user}", kiwi_user)
}

pub fn kiwi_table(user: &str) -> String {
    format!("{KIWI_STORAGE_ROOT}/{user}")
}

/* ---------------- job ---------------- */

/// Lee un rango del origen y escribe la columna `value` de cada fila en
/// kiwi. Los registros rechazados salen como filas `{error}`; un fallo del
/// propio kiwi hace fallar el job.
pub struct KiwiWriter {
    pub source: Arc<dyn ClusterClient>,
    pub table: String,
    pub transaction: Option<TxId>,
    pub kiwi: Arc<dyn ClusterClient>,
    pub user: String,
}

#[async_trait]
impl Mapper for KiwiWriter {
    async fn map(&self, row: Row, _ctx: &JobContext) -> Result<Vec<Row>> {
        let range = row_range(&row, "start", "end")?;
        let ctx = Context {
            transaction: self.transaction.clone(),
            ping_ancestors: false,
        };
        let path = TablePath::new(&self.table).with_ranges(vec![TableRange::Rows(range)]);
        let records = self.source.read_rows(&ctx, &path).await?;

        let mut accepted = Vec::new();
        let mut errors = Vec::new();
        for (offset, record) in records.into_iter().enumerate() {
            match record.get("value") {
                Some(Value::String(value)) => {
                    let mut out = Row::new();
                    out.insert("value".into(), json!(value));
                    accepted.push(out);
                }
                other => {
                    let mut out = Row::new();
                    out.insert(
                        "error".into(),
                        json!(format!(
                            "record #{} has no string value: {other:?}",
                            range.lower + offset as u64
                        )),
                    );
                    errors.push(out);
                }
            }
        }
        if !accepted.is_empty() {
            let target = TablePath::new(&kiwi_table(&self.user)).with_append(true);
            self.kiwi.write_rows(&Context::new(), &target, &accepted).await?;
        }
        Ok(errors)
    }
}

/* ---------------- estrategia ---------------- */

pub(super) async fn copy_yt_to_kiwi(ctx: &CopyContext) -> Result<()> {
    let yt = &ctx.source.client;
    let kiwi = &ctx.destination.client;
    let src = ctx.source_path();
    let src = src.as_str();
    let user = ctx
        .attributes
        .kiwi_user
        .clone()
        .unwrap_or_else(|| DEFAULT_KIWI_USER.to_string());
    let user = user.as_str();

    let root = &Context::new();
    let engine = ctx.retry_engine();
    engine.run(move |_| kiwi.mkdir(root, KIWI_STORAGE_ROOT, true)).await?;

    retry_in_transaction(&engine, yt, root, &ctx.transaction, |tx| async move {
        // 1) snapshot y rangos
        yt.lock(&tx, src, &LockMode::Snapshot).await?;
        let row_count = yt.records_count(&tx, src).await?;
        let data_size = yt.data_size(&tx, src).await?;
        let ranges = split_row_ranges(row_count, data_size, KIWI_RANGE_SIZE);
        info!(table = src, rows = row_count, ranges = ranges.len(), "exportando a kiwi");

        let range_table = yt.create_temp_table(&tx, None).await?;
        yt.write_rows(&tx, &TablePath::new(&range_table), &range_rows(&ranges)).await?;
        let output = yt.create_temp_table(&tx, None).await?;
        yt.set_attribute(&tx, &output, "replication_factor", json!(1)).await?;

        // 2) comando del job
        let options = merge_kwworm_options(
            &ctx.destination.config.kwworm_options,
            ctx.attributes.kwworm_options.as_deref().unwrap_or(&[]),
        );
        let read_command = scripts::read_from_yt_command(
            yt.proxy_address(),
            src,
            "<lenval=true>yamr",
            tx.transaction.as_ref(),
            ctx.source.config.network.is_some(),
        );
        let command = scripts::kiwi_job_command(
            &format!("bash {}", scripts::READ_FROM_YT_SCRIPT),
            &kwworm_command(&options, kiwi.proxy_address(), user),
        );
        let writer = KiwiWriter {
            source: yt.clone(),
            table: src.to_string(),
            transaction: tx.transaction.clone(),
            kiwi: kiwi.clone(),
            user: user.to_string(),
        };
        let mut job = UserJob::mapper(writer, "bash -ux command.sh")
            .with_file(JobFile::new("command.sh", command))
            .with_formats(
                Format::SchemafulDsv {
                    columns: vec!["start".into(), "end".into()],
                },
                Format::SchemafulDsv {
                    columns: vec!["error".into()],
                },
            )
            .with_memory_limit(1000 * MB);
        for file in scripts::read_from_yt_files(ctx.source_token().as_deref(), &read_command) {
            job = job.with_file(file);
        }

        // 3) map sobre los rangos
        let base = ctx.copy_options(format!("Export {src} to kiwi {}", kiwi.name()));
        let spec = OperationOptions {
            data_size_per_job: Some(1),
            locality_timeout: Some(0),
            max_failed_job_count: base.max_failed_job_count.or(Some(DEFAULT_MAX_FAILED_JOBS)),
            ..base
        };
        let op = yt
            .run_map(&tx, job, vec![TablePath::new(&range_table)], TablePath::new(&output), spec)
            .await?;
        ctx.wait(op, yt.name()).await?;

        // 4) ningún registro rechazado
        let errors = yt.read_rows(&tx, &TablePath::new(&output)).await?;
        if !errors.is_empty() {
            warn!(table = src, rejected = errors.len(), "kiwi rechazó registros");
            let sample: Vec<Value> = errors
                .iter()
                .take(REPORTED_ERRORS)
                .filter_map(|row| row.get("error").cloned())
                .collect();
            return Err(TmError::generic(format!(
                "{} records of {src} were not written to kiwi",
                errors.len()
            ))
            .with_attribute("errors", Value::Array(sample)));
        }
        Ok(())
    })
    .await
}

#[cfg(test)]
mod tests {
    use super::super::testing::*;
    use super::super::execute_task;
    use super::*;
    use crate::cluster::{ClusterKind, InMemoryCluster};
    use crate::task::TaskAttributes;

    #[test]
    fn opciones_se_fusionan_por_clave() {
        let base = vec![json!("--fast"), json!(["--server", "{kiwi_url}"]), json!(["--user", "{kiwi_user}"])];
        let extra = vec![json!(["--server", "other"]), json!("--verbose")];
        let merged = merge_kwworm_options(&base, &extra);
        assert_eq!(
            merged,
            vec![
                json!("--fast"),
                json!(["--server", "other"]),
                json!(["--user", "{kiwi_user}"]),
                json!("--verbose"),
            ]
        );
        assert_eq!(
            kwworm_command(&base, "kiwi.net", "robot"),
            "./kwworm --fast --server kiwi.net --user robot"
        );
    }

    async fn setup(values: Vec<Value>) -> (InMemoryCluster, InMemoryCluster, CopyContext) {
        let yt = InMemoryCluster::new("hahn", ClusterKind::Yt);
        let kiwi = InMemoryCluster::new("kiwi", ClusterKind::Kiwi);
        let rows: Vec<Row> = values
            .into_iter()
            .map(|v| {
                let mut row = Row::new();
                row.insert("value".into(), v);
                row
            })
            .collect();
        write(&yt, "//home/t", &rows).await;
        let mut attrs = TaskAttributes::new("hahn", "//home/t", "kiwi", None);
        attrs.kiwi_user = Some("robot".into());
        let ctx = CopyContext::new(entry(&yt, None), entry(&kiwi, None), attrs);
        (yt, kiwi, ctx)
    }

    #[tokio::test]
    async fn valores_llegan_a_kiwi() {
        let (yt, kiwi, ctx) = setup(vec![json!("a"), json!("b"), json!("c")]).await;
        execute_task(&ctx).await.unwrap();
        assert_eq!(read(&kiwi, "//kiwi/robot").await.len(), 3);
        assert_eq!(yt.active_transactions(), 0);
    }

    #[tokio::test]
    async fn registros_rechazados_fallan_la_tarea() {
        let (_, _, ctx) = setup(vec![json!("a"), json!(7)]).await;
        let err = execute_task(&ctx).await.unwrap_err();
        assert!(err.message.starts_with("1 records of //home/t"));
        assert_eq!(err.attributes["errors"].as_array().unwrap().len(), 1);
    }
}
