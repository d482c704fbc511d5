//! Master del transfer manager: API HTTP de tareas, reparto a workers y
//! monitor de heartbeats y leases.

pub mod handlers;
pub mod monitor;
pub mod state;

use std::time::Duration;

pub use handlers::build_router;
pub use state::{AppState, MasterSettings};

pub const WORKER_DEAD_TIMEOUT: Duration = Duration::from_secs(20);
pub const SWEEP_INTERVAL: Duration = Duration::from_secs(5);
pub const MUTATION_TTL: Duration = Duration::from_secs(600);
