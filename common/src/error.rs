use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fmt;

/// Códigos numéricos de error. Son los que viajan en el cuerpo JSON y los
/// que el cliente usa para clasificar (nunca el texto del mensaje).
pub mod codes {
    pub const GENERIC: i32 = 1;
    pub const TIMEOUT: i32 = 3;
    pub const CANCELLED: i32 = 4;
    pub const TRANSPORT_UNAVAILABLE: i32 = 100;
    pub const REQUEST_BEING_PROCESSED: i32 = 109;
    pub const CONCURRENT_OPERATIONS_LIMIT: i32 = 202;
    pub const TOO_MANY_FAILED_JOBS: i32 = 215;
    pub const SCHEMA_MISMATCH: i32 = 307;
    pub const FORMAT_ERROR: i32 = 308;
    pub const INVALID_REQUEST: i32 = 309;
    pub const LOCK_CONFLICT: i32 = 402;
    pub const RESOLVE: i32 = 500;
    pub const CHUNK_UNAVAILABLE: i32 = 716;
    pub const AUTH: i32 = 900;
    pub const ACCESS_DENIED: i32 = 901;
    pub const RATE_LIMIT: i32 = 904;
    pub const REQUEST_QUEUE_SIZE_LIMIT: i32 = 108;
    pub const INCORRECT_ROW_COUNT: i32 = 1300;
    pub const TASK_DIED_SILENTLY: i32 = 1301;
    pub const MASTER_NOT_RESPONDING: i32 = 1302;
    pub const NO_SUCH_TRANSACTION: i32 = 11000;
}

/// Clasificación cerrada de errores (ver tabla de errores del transfer manager).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    TransportUnavailable,
    RequestBeingProcessed,
    Timeout,
    Auth,
    Resolve,
    AccessDenied,
    LockConflict,
    RateLimit,
    ChunkUnavailable,
    NoSuchTransaction,
    ConcurrentOperationsLimit,
    IncorrectRowCount,
    /// Esquemas incompatibles, formato inválido o petición mal formada.
    SchemaMismatch,
    TooManyFailedJobs,
    /// El worker que ejecutaba la tarea dejó de dar señales.
    TaskDiedSilently,
    MasterNotResponding,
    Cancelled,
}

impl ErrorKind {
    pub fn code(self) -> i32 {
        match self {
            ErrorKind::TransportUnavailable => codes::TRANSPORT_UNAVAILABLE,
            ErrorKind::RequestBeingProcessed => codes::REQUEST_BEING_PROCESSED,
            ErrorKind::Timeout => codes::TIMEOUT,
            ErrorKind::Auth => codes::AUTH,
            ErrorKind::Resolve => codes::RESOLVE,
            ErrorKind::AccessDenied => codes::ACCESS_DENIED,
            ErrorKind::LockConflict => codes::LOCK_CONFLICT,
            ErrorKind::RateLimit => codes::RATE_LIMIT,
            ErrorKind::ChunkUnavailable => codes::CHUNK_UNAVAILABLE,
            ErrorKind::NoSuchTransaction => codes::NO_SUCH_TRANSACTION,
            ErrorKind::ConcurrentOperationsLimit => codes::CONCURRENT_OPERATIONS_LIMIT,
            ErrorKind::IncorrectRowCount => codes::INCORRECT_ROW_COUNT,
            ErrorKind::SchemaMismatch => codes::SCHEMA_MISMATCH,
            ErrorKind::TooManyFailedJobs => codes::TOO_MANY_FAILED_JOBS,
            ErrorKind::TaskDiedSilently => codes::TASK_DIED_SILENTLY,
            ErrorKind::MasterNotResponding => codes::MASTER_NOT_RESPONDING,
            ErrorKind::Cancelled => codes::CANCELLED,
        }
    }

    pub fn from_code(code: i32) -> Option<Self> {
        let kind = match code {
            codes::TRANSPORT_UNAVAILABLE => ErrorKind::TransportUnavailable,
            codes::TASK_DIED_SILENTLY => ErrorKind::TaskDiedSilently,
            codes::MASTER_NOT_RESPONDING => ErrorKind::MasterNotResponding,
            codes::REQUEST_BEING_PROCESSED => ErrorKind::RequestBeingProcessed,
            codes::TIMEOUT => ErrorKind::Timeout,
            codes::AUTH => ErrorKind::Auth,
            codes::RESOLVE => ErrorKind::Resolve,
            codes::ACCESS_DENIED => ErrorKind::AccessDenied,
            codes::LOCK_CONFLICT => ErrorKind::LockConflict,
            codes::RATE_LIMIT | codes::REQUEST_QUEUE_SIZE_LIMIT => ErrorKind::RateLimit,
            codes::CHUNK_UNAVAILABLE => ErrorKind::ChunkUnavailable,
            codes::NO_SUCH_TRANSACTION => ErrorKind::NoSuchTransaction,
            codes::CONCURRENT_OPERATIONS_LIMIT => ErrorKind::ConcurrentOperationsLimit,
            codes::INCORRECT_ROW_COUNT => ErrorKind::IncorrectRowCount,
            codes::SCHEMA_MISMATCH | codes::FORMAT_ERROR | codes::INVALID_REQUEST => {
                ErrorKind::SchemaMismatch
            }
            codes::TOO_MANY_FAILED_JOBS => ErrorKind::TooManyFailedJobs,
            codes::CANCELLED => ErrorKind::Cancelled,
            _ => return None,
        };
        Some(kind)
    }

    /// Tipos que el motor de reintentos maneja de forma uniforme. Los fallos
    /// de tarea (1301, 1302) no entran: solo el poller los reinicia.
    pub fn is_retriable(self) -> bool {
        matches!(
            self,
            ErrorKind::TransportUnavailable
                | ErrorKind::RequestBeingProcessed
                | ErrorKind::Timeout
                | ErrorKind::LockConflict
                | ErrorKind::RateLimit
                | ErrorKind::ChunkUnavailable
                | ErrorKind::ConcurrentOperationsLimit
        )
    }
}

/// Error estructurado: `{code, message, attributes, inner_errors}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TmError {
    pub code: i32,
    pub message: String,
    #[serde(default, skip_serializing_if = "Map::is_empty")]
    pub attributes: Map<String, Value>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub inner_errors: Vec<TmError>,
}

pub type Result<T, E = TmError> = std::result::Result<T, E>;

impl TmError {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self::with_code(kind.code(), message)
    }

    pub fn with_code(code: i32, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            attributes: Map::new(),
            inner_errors: Vec::new(),
        }
    }

    pub fn generic(message: impl Into<String>) -> Self {
        Self::with_code(codes::GENERIC, message)
    }

    pub fn resolve(path: &str) -> Self {
        Self::new(
            ErrorKind::Resolve,
            format!("Error resolving path {path}"),
        )
        .with_attribute("path", path)
    }

    pub fn cancelled() -> Self {
        Self::new(ErrorKind::Cancelled, "Operation was cancelled")
    }

    pub fn incorrect_row_count(expected: u64, actual: u64) -> Self {
        Self::new(
            ErrorKind::IncorrectRowCount,
            format!("Incorrect record count (expected: {expected}, actual: {actual})"),
        )
        .with_attribute("expected", expected)
        .with_attribute("actual", actual)
    }

    pub fn invalid_request(message: impl Into<String>) -> Self {
        Self::with_code(codes::INVALID_REQUEST, message)
    }

    pub fn format(message: impl Into<String>) -> Self {
        Self::with_code(codes::FORMAT_ERROR, message)
    }

    pub fn with_attribute(mut self, key: &str, value: impl Into<Value>) -> Self {
        self.attributes.insert(key.to_string(), value.into());
        self
    }

    pub fn with_inner(mut self, inner: TmError) -> Self {
        self.inner_errors.push(inner);
        self
    }

    /// Envuelve `self` como causa de un error nuevo.
    pub fn wrap(self, kind: ErrorKind, message: impl Into<String>) -> Self {
        TmError::new(kind, message).with_inner(self)
    }

    pub fn kind(&self) -> Option<ErrorKind> {
        ErrorKind::from_code(self.code)
    }

    pub fn is(&self, kind: ErrorKind) -> bool {
        self.kind() == Some(kind)
    }

    /// Recorre el error y todas sus causas (preorden).
    pub fn find(&self, pred: &dyn Fn(&TmError) -> bool) -> Option<&TmError> {
        if pred(self) {
            return Some(self);
        }
        self.inner_errors.iter().find_map(|inner| inner.find(pred))
    }

    pub fn contains_code(&self, code: i32) -> bool {
        self.find(&|e| e.code == code).is_some()
    }

    /// Un error sin tipo propio hereda la reintentabilidad de sus causas.
    pub fn is_retriable(&self) -> bool {
        match self.kind() {
            Some(kind) => kind.is_retriable(),
            None => self.inner_errors.iter().any(TmError::is_retriable),
        }
    }

    pub fn root_cause(&self) -> &TmError {
        match self.inner_errors.first() {
            Some(inner) => inner.root_cause(),
            None => self,
        }
    }
}

impl fmt::Display for TmError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.message)?;
        for inner in &self.inner_errors {
            write!(f, "; caused by: {inner}")?;
        }
        Ok(())
    }
}

impl std::error::Error for TmError {}

impl From<serde_json::Error> for TmError {
    fn from(e: serde_json::Error) -> Self {
        TmError::format(format!("invalid JSON: {e}"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case::transport(ErrorKind::TransportUnavailable, true)]
    #[case::processing(ErrorKind::RequestBeingProcessed, true)]
    #[case::timeout(ErrorKind::Timeout, true)]
    #[case::lock(ErrorKind::LockConflict, true)]
    #[case::rate(ErrorKind::RateLimit, true)]
    #[case::chunk(ErrorKind::ChunkUnavailable, true)]
    #[case::ops_limit(ErrorKind::ConcurrentOperationsLimit, true)]
    #[case::auth(ErrorKind::Auth, false)]
    #[case::resolve(ErrorKind::Resolve, false)]
    #[case::no_tx(ErrorKind::NoSuchTransaction, false)]
    #[case::rows(ErrorKind::IncorrectRowCount, false)]
    #[case::jobs(ErrorKind::TooManyFailedJobs, false)]
    #[case::died(ErrorKind::TaskDiedSilently, false)]
    #[case::master(ErrorKind::MasterNotResponding, false)]
    #[case::cancelled(ErrorKind::Cancelled, false)]
    fn clasificacion_de_tipos(#[case] kind: ErrorKind, #[case] retriable: bool) {
        assert_eq!(kind.is_retriable(), retriable);
        assert_eq!(ErrorKind::from_code(kind.code()), Some(kind));
    }

    #[test]
    fn error_generico_hereda_reintentabilidad_de_la_causa() {
        let err = TmError::generic("request failed")
            .with_inner(TmError::new(ErrorKind::ChunkUnavailable, "chunk 1-2-3 unavailable"));
        assert_eq!(err.kind(), None);
        assert!(err.is_retriable());
        assert!(err.contains_code(codes::CHUNK_UNAVAILABLE));
        assert_eq!(err.root_cause().code, codes::CHUNK_UNAVAILABLE);
    }

    #[test]
    fn fallos_de_tarea_no_son_de_transporte() {
        let died = TmError::with_code(codes::TASK_DIED_SILENTLY, "Task died silently");
        assert!(died.is(ErrorKind::TaskDiedSilently));
        assert!(!died.is(ErrorKind::TransportUnavailable));
        assert!(!died.is_retriable());
        let master = TmError::with_code(codes::MASTER_NOT_RESPONDING, "Master is not responding");
        assert!(!master.is_retriable());
    }

    #[test]
    fn display_incluye_la_cadena_de_causas() {
        let err = TmError::incorrect_row_count(3, 2).wrap(ErrorKind::Cancelled, "copy aborted");
        assert_eq!(
            err.to_string(),
            "copy aborted; caused by: Incorrect record count (expected: 3, actual: 2)"
        );
    }

    #[test]
    fn serializa_como_json_estructurado() {
        let err = TmError::resolve("//tmp/t");
        let v = serde_json::to_value(&err).unwrap();
        assert_eq!(v["code"], 500);
        assert_eq!(v["attributes"]["path"], "//tmp/t");
        assert!(v.get("inner_errors").is_none());

        let back: TmError = serde_json::from_value(v).unwrap();
        assert_eq!(back, err);
    }
}
