//! Cliente del transfer manager: transporte HTTP con mutaciones
//! idempotentes, API de tareas y seguimiento de envíos masivos.

pub mod cli;
pub mod http;
pub mod poller;
pub mod task_client;

pub use http::{mask_headers, HttpTransport};
pub use poller::{is_restartable, PollerOptions};
pub use task_client::TaskClient;
