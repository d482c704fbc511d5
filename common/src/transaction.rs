//! Transacciones con pinger en segundo plano.
//!
//! Mientras la transacción vive, una tarea de tokio renueva su lease cada
//! `ping_period`. Si el bloque que la usa falla, o el valor se suelta sin
//! confirmar, la transacción se aborta y con ella desaparecen las tablas
//! temporales y los locks que cuelgan de ella.

use std::{future::Future, sync::Arc};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::cluster::{ClusterClient, TxId};
use crate::config::{Context, TransactionConfig};
use crate::error::{ErrorKind, Result, TmError};
use crate::retry::{default_classify, RetryDecision, RetryEngine};

pub struct PingableTransaction {
    client: Arc<dyn ClusterClient>,
    id: TxId,
    ping_ancestors: bool,
    stop: CancellationToken,
    pinger: Option<JoinHandle<()>>,
    finished: bool,
}

impl PingableTransaction {
    /// Abre una transacción hija de `parent.transaction` (si la hay) y
    /// arranca el pinger.
    pub async fn begin(
        client: Arc<dyn ClusterClient>,
        parent: &Context,
        config: &TransactionConfig,
    ) -> Result<Self> {
        let id = client.begin_transaction(parent, config.timeout).await?;
        debug!(cluster = client.name(), transaction = %id, "transacción con ping iniciada");

        let stop = CancellationToken::new();
        let pinger = tokio::spawn(ping_loop(
            client.clone(),
            id.clone(),
            parent.ping_ancestors,
            config.clone(),
            stop.clone(),
        ));

        Ok(Self {
            client,
            id,
            ping_ancestors: parent.ping_ancestors,
            stop,
            pinger: Some(pinger),
            finished: false,
        })
    }

    pub fn id(&self) -> &TxId {
        &self.id
    }

    /// Contexto para las llamadas que deben ir dentro de la transacción.
    pub fn context(&self) -> Context {
        Context::in_transaction(self.id.clone()).with_ping_ancestors(self.ping_ancestors)
    }

    async fn stop_pinger(&mut self) {
        self.stop.cancel();
        if let Some(handle) = self.pinger.take() {
            let _ = handle.await;
        }
    }

    pub async fn commit(mut self) -> Result<()> {
        self.stop_pinger().await;
        self.finished = true;
        self.client
            .commit_transaction(&Context::new(), &self.id)
            .await
    }

    pub async fn abort(mut self) -> Result<()> {
        self.stop_pinger().await;
        self.finished = true;
        self.client.abort_transaction(&Context::new(), &self.id).await
    }
}

impl Drop for PingableTransaction {
    fn drop(&mut self) {
        if self.finished {
            return;
        }
        self.stop.cancel();
        // soltada sin commit: se aborta en segundo plano si hay runtime
        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            return;
        };
        let client = self.client.clone();
        let id = self.id.clone();
        runtime.spawn(async move {
            match client.abort_transaction(&Context::new(), &id).await {
                Ok(()) => debug!(transaction = %id, "transacción abortada al soltarse"),
                Err(e) if e.is(ErrorKind::NoSuchTransaction) => {}
                Err(e) => warn!(transaction = %id, "no se pudo abortar la transacción: {e}"),
            }
        });
    }
}

async fn ping_loop(
    client: Arc<dyn ClusterClient>,
    id: TxId,
    ping_ancestors: bool,
    config: TransactionConfig,
    stop: CancellationToken,
) {
    let ctx = Context::new().with_ping_ancestors(ping_ancestors);
    loop {
        tokio::select! {
            _ = stop.cancelled() => return,
            _ = tokio::time::sleep(config.ping_period) => {}
        }
        match client.ping_transaction(&ctx, &id).await {
            Ok(()) => {}
            Err(e) if e.is(ErrorKind::NoSuchTransaction) => {
                warn!(transaction = %id, "la transacción ya no existe, se detiene el pinger");
                return;
            }
            Err(e) => warn!(transaction = %id, "fallo al hacer ping: {e}"),
        }
    }
}

/// Ejecuta `body` dentro de una transacción con ping. Confirma si `body`
/// termina bien; si falla, aborta antes de devolver el error.
pub async fn run_in_transaction<T, F, Fut>(
    client: &Arc<dyn ClusterClient>,
    parent: &Context,
    config: &TransactionConfig,
    body: F,
) -> Result<T>
where
    F: FnOnce(Context) -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let tx = PingableTransaction::begin(client.clone(), parent, config).await?;
    match body(tx.context()).await {
        Ok(value) => {
            tx.commit().await?;
            Ok(value)
        }
        Err(err) => {
            let id = tx.id().clone();
            if let Err(abort_err) = tx.abort().await {
                warn!(transaction = %id, "no se pudo abortar tras el error: {abort_err}");
            }
            Err(err)
        }
    }
}

/// Un bloque transaccional se repite si falla de forma transitoria o si su
/// transacción desapareció por el camino.
pub fn transaction_retry(err: &TmError) -> RetryDecision {
    if err.find(&|e| e.is(ErrorKind::NoSuchTransaction)).is_some() {
        RetryDecision::Retry
    } else {
        default_classify(err)
    }
}

/// Como `run_in_transaction`, pero repite `body` entero bajo una transacción
/// nueva mientras `engine` lo permita. Cada intento aborta la transacción
/// anterior antes de esperar.
pub async fn retry_in_transaction<T, F, Fut>(
    engine: &RetryEngine,
    client: &Arc<dyn ClusterClient>,
    parent: &Context,
    config: &TransactionConfig,
    mut body: F,
) -> Result<T>
where
    F: FnMut(Context) -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let engine = engine.clone().classify(transaction_retry);
    let mut attempt = 1;
    loop {
        if engine.cancel_token().is_cancelled() {
            return Err(TmError::cancelled());
        }
        match run_in_transaction(client, parent, config, &mut body).await {
            Ok(value) => return Ok(value),
            Err(err) => {
                if err.contains_code(ErrorKind::NoSuchTransaction.code()) {
                    info!(cluster = client.name(), attempt, "transacción perdida, se repite el bloque");
                }
                engine.backoff_or_fail(attempt, err).await?;
                attempt += 1;
            }
        }
    }
}
