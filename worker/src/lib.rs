//! Worker del transfer manager: pide tareas al master y ejecuta las copias.

pub mod api;
pub mod worker;

pub use api::MasterApi;
pub use worker::{run, WorkerSettings};
