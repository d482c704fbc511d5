//! Cola atómica sobre un nodo lista del clúster.
//!
//! `push` inserta por la cabeza (`queue/begin`) y `pop` extrae por la cola
//! (`queue/-1`) bajo lock exclusivo, de modo que varios consumidores
//! concurrentes reciben cada elemento exactamente una vez.

use rand::Rng;
use serde_json::Value;
use std::{collections::HashSet, future::Future, sync::Arc, time::Duration};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::cluster::{ClusterClient, LockMode};
use crate::config::{Context, TransactionConfig};
use crate::error::{ErrorKind, Result, TmError};
use crate::transaction::run_in_transaction;

pub const DEFAULT_RETRIES_COUNT: u32 = 10;
pub const DEFAULT_DELAY_CAP: Duration = Duration::from_secs(5);
const MIN_DELAY: Duration = Duration::from_millis(100);
pub const DEFAULT_PROCESS_LIMIT: usize = 10_000;
const IDLE_SLEEP: Duration = Duration::from_secs(1);

/// Qué hacer con un elemento después de procesarlo.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ActionOutcome {
    Done,
    /// Devolverlo a la cola.
    Repeat,
    /// Descartarlo sin más.
    Cancel,
}

#[derive(Debug, Clone)]
pub struct ProcessOptions {
    pub limit: usize,
    /// Con la cola vacía, esperar en vez de terminar.
    pub forever: bool,
}

impl Default for ProcessOptions {
    fn default() -> Self {
        Self {
            limit: DEFAULT_PROCESS_LIMIT,
            forever: false,
        }
    }
}

#[derive(Clone)]
pub struct AtomicQueue {
    client: Arc<dyn ClusterClient>,
    path: String,
    retries_count: u32,
    delay_cap: Duration,
    transaction: TransactionConfig,
    cancel: CancellationToken,
}

impl AtomicQueue {
    pub fn new(client: Arc<dyn ClusterClient>, path: &str) -> Self {
        Self {
            client,
            path: path.to_string(),
            retries_count: DEFAULT_RETRIES_COUNT,
            delay_cap: DEFAULT_DELAY_CAP,
            transaction: TransactionConfig::default(),
            cancel: CancellationToken::new(),
        }
    }

    pub fn with_retries(mut self, retries_count: u32, delay_cap: Duration) -> Self {
        self.retries_count = retries_count;
        self.delay_cap = delay_cap.max(MIN_DELAY);
        self
    }

    pub fn with_cancel(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    /// Extrae el elemento más antiguo, o `None` si la cola está vacía.
    ///
    /// Cada reintento por conflicto de lock usa una transacción nueva.
    pub async fn pop(&self) -> Result<Option<Value>> {
        let mut attempt = 0;
        loop {
            match self.try_pop().await {
                Err(err) if err.is(ErrorKind::LockConflict) && attempt < self.retries_count => {
                    attempt += 1;
                    debug!(queue = %self.path, attempt, "conflicto de lock en pop, reintentando");
                    self.conflict_sleep().await?;
                }
                result => return result,
            }
        }
    }

    async fn try_pop(&self) -> Result<Option<Value>> {
        let client = &self.client;
        let tail = format!("{}/-1", self.path);
        let tail = tail.as_str();
        run_in_transaction(client, &Context::new(), &self.transaction, |tx| async move {
            // 1) cola vacía
            let count = client.get(&tx, &format!("{}/@count", self.path), &[]).await?;
            if count.as_u64().unwrap_or(0) == 0 {
                return Ok(None);
            }
            // 2) lock del último elemento; otro consumidor pudo vaciarla
            match client.lock(&tx, tail, &LockMode::Exclusive).await {
                Err(err) if err.is(ErrorKind::Resolve) => return Ok(None),
                other => other?,
            };
            // 3) leer y quitar
            let value = client.get(&tx, tail, &[]).await?;
            client.remove(&tx, tail, false, false).await?;
            Ok(Some(value))
        })
        .await
    }

    /// Inserta `value` por la cabeza de la cola.
    pub async fn push(&self, value: Value) -> Result<()> {
        let head = format!("{}/begin", self.path);
        let mut attempt = 0;
        loop {
            match self.client.set(&Context::new(), &head, value.clone()).await {
                Err(err) if err.is(ErrorKind::LockConflict) && attempt < self.retries_count => {
                    attempt += 1;
                    debug!(queue = %self.path, attempt, "conflicto de lock en push, reintentando");
                    self.conflict_sleep().await?;
                }
                result => return result,
            }
        }
    }

    async fn conflict_sleep(&self) -> Result<()> {
        let delay = rand::thread_rng().gen_range(MIN_DELAY.as_secs_f64()..=self.delay_cap.as_secs_f64());
        tokio::select! {
            _ = self.cancel.cancelled() => Err(TmError::cancelled()),
            _ = tokio::time::sleep(Duration::from_secs_f64(delay)) => Ok(()),
        }
    }

    /// Consume elementos y ejecuta `action` sobre cada uno hasta vaciar la
    /// cola o llegar a `options.limit`. Devuelve cuántos se procesaron.
    ///
    /// Si un elemento vuelve a aparecer (se repitió sin avanzar), se
    /// devuelve a la cola y se para. Si `action` falla o se cancela, el
    /// elemento vuelve a la cola antes de propagar el error.
    pub async fn process_tasks<F, Fut>(&self, mut action: F, options: ProcessOptions) -> Result<usize>
    where
        F: FnMut(Value) -> Fut,
        Fut: Future<Output = Result<ActionOutcome>>,
    {
        let mut seen = HashSet::new();
        let mut processed = 0;
        while processed < options.limit {
            if self.cancel.is_cancelled() {
                return Err(TmError::cancelled());
            }
            let Some(value) = self.pop().await? else {
                if !options.forever {
                    break;
                }
                tokio::select! {
                    _ = self.cancel.cancelled() => return Err(TmError::cancelled()),
                    _ = tokio::time::sleep(IDLE_SLEEP) => continue,
                }
            };

            if !seen.insert(canonical(&value)) {
                info!(queue = %self.path, "elemento repetido sin progreso, se detiene el proceso");
                self.push(value).await?;
                break;
            }

            let outcome = tokio::select! {
                r = action(value.clone()) => r,
                _ = self.cancel.cancelled() => Err(TmError::cancelled()),
            };
            match outcome {
                Ok(ActionOutcome::Done) => {}
                Ok(ActionOutcome::Repeat) => self.push(value).await?,
                Ok(ActionOutcome::Cancel) => debug!(queue = %self.path, "elemento descartado"),
                Err(err) => {
                    if let Err(push_err) = self.push(value).await {
                        warn!(queue = %self.path, "no se pudo devolver el elemento: {push_err}");
                    }
                    return Err(err);
                }
            }
            processed += 1;
        }
        Ok(processed)
    }
}

/// Representación estable de un valor: los mapas de `serde_json` serializan
/// sus claves ordenadas.
fn canonical(value: &Value) -> String {
    value.to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cluster::{CreateOptions, InMemoryCluster, NodeType, ClusterKind};
    use serde_json::json;
    use std::sync::Mutex;

    async fn queue(items: &[Value]) -> AtomicQueue {
        let client: Arc<dyn ClusterClient> = Arc::new(InMemoryCluster::new("local", ClusterKind::Yt));
        client
            .create(&Context::new(), NodeType::ListNode, "//queue", &CreateOptions::default())
            .await
            .unwrap();
        let q = AtomicQueue::new(client, "//queue").with_retries(50, Duration::from_millis(100));
        for item in items {
            q.push(item.clone()).await.unwrap();
        }
        q
    }

    #[tokio::test]
    async fn pop_devuelve_en_orden_de_llegada() {
        let q = queue(&[json!(1), json!({"b": 2, "a": 1}), json!("x")]).await;
        assert_eq!(q.pop().await.unwrap(), Some(json!(1)));
        assert_eq!(q.pop().await.unwrap(), Some(json!({"a": 1, "b": 2})));
        assert_eq!(q.pop().await.unwrap(), Some(json!("x")));
        assert_eq!(q.pop().await.unwrap(), None);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn consumidores_concurrentes_reciben_cada_elemento_una_vez() {
        let items: Vec<Value> = (0..40).map(|i| json!(i)).collect();
        let q = queue(&items).await;
        let mut handles = Vec::new();
        for _ in 0..4 {
            let q = q.clone();
            handles.push(tokio::spawn(async move {
                let mut got = Vec::new();
                while let Some(v) = q.pop().await.unwrap() {
                    got.push(v.as_i64().unwrap());
                }
                got
            }));
        }
        let mut all = Vec::new();
        for h in handles {
            all.extend(h.await.unwrap());
        }
        all.sort();
        assert_eq!(all, (0..40).collect::<Vec<i64>>());
    }

    #[tokio::test]
    async fn repeat_devuelve_y_se_detiene_al_repetirse() {
        let q = queue(&[json!("a"), json!("b")]).await;
        let calls = Arc::new(Mutex::new(Vec::new()));
        let seen = calls.clone();
        let processed = q
            .process_tasks(
                move |v| {
                    let seen = seen.clone();
                    async move {
                        seen.lock().unwrap().push(v.clone());
                        Ok(if v == json!("a") {
                            ActionOutcome::Repeat
                        } else {
                            ActionOutcome::Done
                        })
                    }
                },
                ProcessOptions::default(),
            )
            .await
            .unwrap();
        assert_eq!(processed, 2);
        assert_eq!(*calls.lock().unwrap(), vec![json!("a"), json!("b")]);
        // "a" sigue en la cola
        assert_eq!(q.pop().await.unwrap(), Some(json!("a")));
        assert_eq!(q.pop().await.unwrap(), None);
    }

    #[tokio::test]
    async fn error_en_la_accion_no_pierde_el_elemento() {
        let q = queue(&[json!({"task": 1})]).await;
        let err = q
            .process_tasks(
                |_| async { Err::<ActionOutcome, _>(TmError::generic("boom")) },
                ProcessOptions::default(),
            )
            .await
            .unwrap_err();
        assert_eq!(err.message, "boom");
        assert_eq!(q.pop().await.unwrap(), Some(json!({"task": 1})));
    }

    #[tokio::test]
    async fn cancel_descarta_y_limit_corta() {
        let q = queue(&[json!(1), json!(2), json!(3)]).await;
        let processed = q
            .process_tasks(
                |_| async { Ok(ActionOutcome::Cancel) },
                ProcessOptions {
                    limit: 2,
                    forever: false,
                },
            )
            .await
            .unwrap();
        assert_eq!(processed, 2);
        assert_eq!(q.pop().await.unwrap(), Some(json!(3)));
    }

    #[test]
    fn forma_canonica_ignora_el_orden_de_claves() {
        assert_eq!(
            canonical(&json!({"b": [1, 2], "a": {"y": 1, "x": 2}})),
            canonical(&json!({"a": {"x": 2, "y": 1}, "b": [1, 2]}))
        );
    }
}
