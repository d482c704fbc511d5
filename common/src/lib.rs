//! Núcleo compartido del transfer manager: modelo de tareas, errores,
//! reintentos, capacidad de clúster y estrategias de copia.

pub mod atomic;
pub mod cluster;
pub mod config;
pub mod copy;
pub mod dynamic;
pub mod error;
pub mod format;
pub mod job;
pub mod pattern;
pub mod ranges;
pub mod retry;
pub mod task;
pub mod transaction;
pub mod worker;

pub use cluster::{BackendConfig, ClusterClient, ClusterDirectory, ClusterKind, InMemoryCluster};
pub use config::{Config, Context, HttpConfig, TransactionConfig};
pub use copy::{execute_task, CopyContext, CopyEvent, CopyOutcome, CopyStrategy};
pub use error::{codes, ErrorKind, Result, TmError};
pub use pattern::{match_src_dst_pattern, MatchPair, MatchRequest};
pub use retry::{MutationId, MutationParams, RetryEngine, RetryPolicy};
pub use task::{TaskAttributes, TaskId, TaskInfo, TaskProgress, TaskState, WorkerId};
pub use worker::*;
