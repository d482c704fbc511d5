//! Motor de reintentos: backoff exponencial con jitter, clasificación de
//! errores y manejo de `mutation_id` para peticiones mutantes.

use rand::Rng;
use serde::{Deserialize, Serialize};
use std::{fmt, future::Future, sync::Arc, time::Duration};
use tokio_util::sync::CancellationToken;
use tracing::warn;

use crate::error::{ErrorKind, Result, TmError};

pub const MIN_BACKOFF: Duration = Duration::from_millis(100);
pub const MAX_BACKOFF: Duration = Duration::from_secs(30);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDecision {
    Retry,
    Fail,
}

/// Clasificador por defecto: reintenta los tipos transitorios de la taxonomía.
pub fn default_classify(err: &TmError) -> RetryDecision {
    if err.is_retriable() {
        RetryDecision::Retry
    } else {
        RetryDecision::Fail
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Backoff {
    pub floor: Duration,
    pub cap: Duration,
    pub multiplier: f64,
    /// Fracción de jitter: el retardo se multiplica por `U(1-j, 1+j)`.
    pub jitter: f64,
}

impl Default for Backoff {
    fn default() -> Self {
        Self {
            floor: MIN_BACKOFF,
            cap: MAX_BACKOFF,
            multiplier: 2.0,
            jitter: 0.25,
        }
    }
}

impl Backoff {
    /// Retardo antes del intento `attempt + 1` (attempt empieza en 1).
    pub fn delay(&self, attempt: u32) -> Duration {
        let floor = self.floor.max(MIN_BACKOFF).as_secs_f64();
        let cap = self.cap.min(MAX_BACKOFF).as_secs_f64().max(floor);

        let exp = floor * self.multiplier.powi(attempt.saturating_sub(1).min(64) as i32);
        let base = exp.min(cap);
        let factor = if self.jitter > 0.0 {
            rand::thread_rng().gen_range((1.0 - self.jitter)..=(1.0 + self.jitter))
        } else {
            1.0
        };
        Duration::from_secs_f64((base * factor).clamp(floor, cap))
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub backoff: Backoff,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 6,
            backoff: Backoff::default(),
        }
    }
}

impl RetryPolicy {
    pub fn no_retries() -> Self {
        Self {
            max_attempts: 1,
            backoff: Backoff::default(),
        }
    }
}

/// Token de deduplicación que el servidor usa para no ejecutar dos veces
/// la misma mutación.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct MutationId(String);

impl MutationId {
    pub fn generate() -> Self {
        Self(uuid::Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for MutationId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl fmt::Display for MutationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// Contenido de la cabecera `X-TM-Parameters`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MutationParams {
    pub mutation_id: MutationId,
    #[serde(default)]
    pub retry: bool,
}

impl MutationParams {
    pub fn fresh() -> Self {
        Self {
            mutation_id: MutationId::generate(),
            retry: false,
        }
    }

    /// Parámetros para el siguiente intento tras `err`.
    ///
    /// Si el transporte no estaba disponible la petición pudo no llegar al
    /// servidor: se genera un id nuevo. En otro caso se reenvía el mismo id
    /// marcado como reintento.
    pub fn next_after(&self, err: &TmError) -> Self {
        if err.is(ErrorKind::TransportUnavailable) {
            Self::fresh()
        } else {
            Self {
                mutation_id: self.mutation_id.clone(),
                retry: true,
            }
        }
    }
}

type Classifier = Arc<dyn Fn(&TmError) -> RetryDecision + Send + Sync>;
type AttemptHook = Arc<dyn Fn(u32, &TmError, Duration) + Send + Sync>;

/// Ejecuta operaciones con reintentos. Los intentos son estrictamente
/// secuenciales y la espera entre intentos se despierta al cancelar.
#[derive(Clone)]
pub struct RetryEngine {
    policy: RetryPolicy,
    cancel: CancellationToken,
    classify: Classifier,
    on_attempt: Option<AttemptHook>,
}

impl RetryEngine {
    pub fn new(policy: RetryPolicy, cancel: CancellationToken) -> Self {
        Self {
            policy,
            cancel,
            classify: Arc::new(default_classify),
            on_attempt: None,
        }
    }

    pub fn classify<F>(mut self, f: F) -> Self
    where
        F: Fn(&TmError) -> RetryDecision + Send + Sync + 'static,
    {
        self.classify = Arc::new(f);
        self
    }

    /// Hook invocado antes de cada espera: `(intento, error, retardo)`.
    pub fn on_attempt<F>(mut self, f: F) -> Self
    where
        F: Fn(u32, &TmError, Duration) + Send + Sync + 'static,
    {
        self.on_attempt = Some(Arc::new(f));
        self
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    pub fn cancel_token(&self) -> &CancellationToken {
        &self.cancel
    }

    pub async fn run<T, F, Fut>(&self, mut op: F) -> Result<T>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let mut attempt = 1;
        loop {
            if self.cancel.is_cancelled() {
                return Err(TmError::cancelled());
            }
            match op(attempt).await {
                Ok(value) => return Ok(value),
                Err(err) => {
                    self.backoff_or_fail(attempt, err).await?;
                    attempt += 1;
                }
            }
        }
    }

    /// Igual que `run`, pero gestiona `mutation_id`/`retry` para cada intento.
    pub async fn run_mutating<T, F, Fut>(&self, mut op: F) -> Result<T>
    where
        F: FnMut(MutationParams) -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let mut params = MutationParams::fresh();
        let mut attempt = 1;
        loop {
            if self.cancel.is_cancelled() {
                return Err(TmError::cancelled());
            }
            match op(params.clone()).await {
                Ok(value) => return Ok(value),
                Err(err) => {
                    let next = params.next_after(&err);
                    self.backoff_or_fail(attempt, err).await?;
                    params = next;
                    attempt += 1;
                }
            }
        }
    }

    /// Duerme `delay` salvo que se cancele antes.
    pub async fn sleep(&self, delay: Duration) -> Result<()> {
        tokio::select! {
            _ = self.cancel.cancelled() => Err(TmError::cancelled()),
            _ = tokio::time::sleep(delay) => Ok(()),
        }
    }

    /// Espera antes del intento `attempt + 1`, o devuelve `err` si no toca
    /// reintentar.
    pub(crate) async fn backoff_or_fail(&self, attempt: u32, err: TmError) -> Result<()> {
        if (self.classify)(&err) == RetryDecision::Fail || attempt >= self.policy.max_attempts {
            return Err(err);
        }
        let delay = self.policy.backoff.delay(attempt);
        if let Some(hook) = &self.on_attempt {
            hook(attempt, &err, delay);
        }
        warn!(
            attempt,
            max_attempts = self.policy.max_attempts,
            "intento fallido: {err}; reintentando en {delay:?}"
        );
        self.sleep(delay).await
    }
}
