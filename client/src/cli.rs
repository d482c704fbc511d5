use clap::{Args, Parser, Subcommand};
use serde_json::{Map, Value};
use std::time::Duration;
use tm_common::{MatchPair, Result, TaskInfo, TmError};

use crate::poller::PollerOptions;
use crate::task_client::TaskClient;

#[derive(Parser)]
#[command(name = "tm-client")]
#[command(about = "CLI para hablar con el transfer manager")]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Crea una tarea de copia
    AddTask {
        source_cluster: String,
        source_table: String,
        destination_cluster: String,
        destination_table: Option<String>,

        /// Atributos extra en JSON, p. ej. '{"pool": "transfer"}'
        #[arg(long)]
        params: Option<String>,

        /// Espera a que la tarea termine
        #[arg(long)]
        sync: bool,
    },
    /// Crea una tarea por cada tabla que casa con el patrón
    AddTasks {
        source_cluster: String,
        source_pattern: String,
        destination_cluster: String,
        destination_pattern: String,

        #[arg(long)]
        params: Option<String>,

        #[command(flatten)]
        poller: PollerArgs,
    },
    /// Crea una tarea por cada par de un fichero `origen<TAB>destino`
    AddPairs {
        source_cluster: String,
        destination_cluster: String,

        #[arg(long, value_name = "FICHERO")]
        pairs_file: std::path::PathBuf,

        #[arg(long)]
        params: Option<String>,

        #[command(flatten)]
        poller: PollerArgs,
    },
    /// Aborta una tarea
    Abort {
        #[arg(value_name = "TASK_ID")]
        id: String,
    },
    /// Reinicia una tarea terminada como tarea nueva
    Restart {
        #[arg(value_name = "TASK_ID")]
        id: String,
    },
    /// Consulta el estado de una tarea
    Get {
        #[arg(value_name = "TASK_ID")]
        id: String,
    },
    /// Lista tareas
    List {
        #[arg(long)]
        user: Option<String>,

        /// Campos a devolver (repetible)
        #[arg(long = "field")]
        fields: Vec<String>,
    },
    /// Muestra el directorio de clústeres del master
    Config,
    /// Métricas de los workers
    Workers,
}

#[derive(Args)]
pub struct PollerArgs {
    /// Solo crea las tareas, sin seguirlas
    #[arg(long)]
    pub no_sync: bool,

    #[arg(long, default_value_t = 10)]
    pub running_tasks_limit: usize,

    /// Segundos entre consultas
    #[arg(long, default_value_t = 5)]
    pub poll_period: u64,

    #[arg(long)]
    pub enable_failed_tasks_restarting: bool,

    #[arg(long, default_value_t = 3)]
    pub max_failed_tasks_restart_count: u32,

    /// Segundos de espera antes de reiniciar una tarea
    #[arg(long, default_value_t = 10)]
    pub failed_tasks_restart_sleep: u64,

    #[arg(long)]
    pub enable_early_skip_if_destination_exists: bool,
}

impl From<&PollerArgs> for PollerOptions {
    fn from(args: &PollerArgs) -> Self {
        Self {
            sync: !args.no_sync,
            poll_period: Duration::from_secs(args.poll_period),
            running_tasks_limit: args.running_tasks_limit,
            enable_failed_tasks_restarting: args.enable_failed_tasks_restarting,
            max_failed_tasks_restart_count: args.max_failed_tasks_restart_count,
            failed_tasks_restart_sleep: Duration::from_secs(args.failed_tasks_restart_sleep),
            enable_early_skip_if_destination_exists: args.enable_early_skip_if_destination_exists,
        }
    }
}

fn parse_params(raw: Option<&str>) -> Result<Map<String, Value>> {
    match raw {
        None => Ok(Map::new()),
        Some(raw) => serde_json::from_str(raw)
            .map_err(|e| TmError::invalid_request(format!("--params is not a JSON object: {e}"))),
    }
}

fn print_task(info: &TaskInfo) {
    println!("Tarea {}:", info.id);
    println!("  estado : {}", info.state);
    println!(
        "  origen : {}:{}",
        info.attributes.source_cluster, info.attributes.source_table
    );
    println!(
        "  destino: {}:{}",
        info.attributes.destination_cluster,
        info.attributes.destination_table.as_deref().unwrap_or("-")
    );
    println!("  creada : {}", info.creation_time);
    if let Some(finished) = info.finish_time {
        println!("  fin    : {}", finished);
    }
    if let Some(progress) = &info.progress {
        for op in &progress.operations {
            println!(
                "  operación {} en {}: {} (jobs {}/{})",
                op.id, op.cluster_name, op.state, op.jobs.completed, op.jobs.total
            );
        }
    }
    if let Some(next) = &info.restarted_as {
        println!("  reiniciada como {}", next);
    }
    if let Some(error) = &info.error {
        println!("  error  : {}", error);
    }
}

pub async fn run(cli: Cli, client: &TaskClient) -> Result<()> {
    match cli.command {
        Commands::AddTask {
            source_cluster,
            source_table,
            destination_cluster,
            destination_table,
            params,
            sync,
        } => {
            let params = parse_params(params.as_deref())?;
            let id = client
                .add_task(
                    &source_cluster,
                    &source_table,
                    &destination_cluster,
                    destination_table.as_deref(),
                    &params,
                    sync,
                )
                .await?;
            println!("{id}");
        }

        Commands::AddTasks {
            source_cluster,
            source_pattern,
            destination_cluster,
            destination_pattern,
            params,
            poller,
        } => {
            let params = parse_params(params.as_deref())?;
            let ids = client
                .add_tasks(
                    &source_cluster,
                    &source_pattern,
                    &destination_cluster,
                    &destination_pattern,
                    &params,
                    &PollerOptions::from(&poller),
                )
                .await?;
            for id in ids {
                println!("{id}");
            }
        }

        Commands::AddPairs {
            source_cluster,
            destination_cluster,
            pairs_file,
            params,
            poller,
        } => {
            let params = parse_params(params.as_deref())?;
            let text = std::fs::read_to_string(&pairs_file).map_err(|e| {
                TmError::invalid_request(format!("Cannot read {}: {e}", pairs_file.display()))
            })?;
            let pairs = parse_pairs(&text)?;
            let ids = client
                .add_tasks_from_src_dst_pairs(
                    &pairs,
                    &source_cluster,
                    &destination_cluster,
                    &params,
                    &PollerOptions::from(&poller),
                )
                .await?;
            for id in ids {
                println!("{id}");
            }
        }

        Commands::Abort { id } => client.abort_task(&id).await?,

        Commands::Restart { id } => {
            let new_id = client.restart_task(&id).await?;
            println!("{new_id}");
        }

        Commands::Get { id } => print_task(&client.get_task_info(&id).await?),

        Commands::List { user, fields } => {
            let fields: Vec<&str> = fields.iter().map(String::as_str).collect();
            for task in client.get_tasks(user.as_deref(), &fields).await? {
                println!("{task}");
            }
        }

        Commands::Config => {
            let config = client.get_backend_config().await?;
            println!("backend_tag: {}", config.backend_tag);
            for (name, cluster) in &config.clusters {
                println!(
                    "  {:<12} {:<5} {} {}",
                    name,
                    cluster.kind,
                    cluster.proxy,
                    cluster.network.as_deref().unwrap_or("")
                );
            }
        }

        Commands::Workers => {
            let workers = client.get_workers().await?;
            if workers.is_empty() {
                println!("No hay workers registrados.");
            }
            for w in workers {
                println!("Worker {}", w.worker_id);
                println!("  host           : {}", w.hostname);
                println!("  dead           : {}", w.dead);
                println!("  last_heartbeat : {} s ago", w.last_heartbeat_secs_ago);
                println!(
                    "  tareas         : activas={}/{}, started={}, ok={}, failed={}",
                    w.active_tasks, w.max_concurrency, w.tasks_started, w.tasks_succeeded, w.tasks_failed
                );
                match w.avg_task_ms {
                    Some(avg) => println!("  avg_task_ms    : {:.1}", avg),
                    None => println!("  avg_task_ms    : (sin datos)"),
                }
                if let Some(cpu) = w.cpu_percent {
                    println!("  cpu_percent    : {:.1}%", cpu);
                }
                if let Some(mem) = w.mem_bytes {
                    println!("  mem_bytes      : {}", mem);
                }
                println!();
            }
        }
    }

    Ok(())
}

/// Pares origen/destino en formato `origen\tdestino`, uno por línea.
pub fn parse_pairs(text: &str) -> Result<Vec<MatchPair>> {
    text.lines()
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .map(|line| match line.split_once('\t') {
            Some((source, destination)) => Ok(MatchPair {
                source: source.trim().to_string(),
                destination: destination.trim().to_string(),
            }),
            None => Err(TmError::invalid_request(format!(
                "Line {line:?} is not 'source<TAB>destination'"
            ))),
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn params_vacios_o_json() {
        assert!(parse_params(None).unwrap().is_empty());
        let params = parse_params(Some(r#"{"pool": "transfer", "lease_timeout": 60}"#)).unwrap();
        assert_eq!(params["pool"], "transfer");
        assert!(parse_params(Some("[1, 2]")).is_err());
    }

    #[test]
    fn add_tasks_con_opciones_del_poller() {
        let cli = Cli::try_parse_from([
            "tm-client",
            "add-tasks",
            "plato",
            "//tmp/d",
            "hahn",
            "//tmp/d",
            "--running-tasks-limit",
            "2",
            "--enable-failed-tasks-restarting",
        ])
        .unwrap();
        let Commands::AddTasks { poller, .. } = cli.command else {
            panic!("subcomando inesperado");
        };
        let options = PollerOptions::from(&poller);
        assert!(options.sync);
        assert_eq!(options.running_tasks_limit, 2);
        assert!(options.enable_failed_tasks_restarting);
        assert_eq!(options.failed_tasks_restart_sleep, Duration::from_secs(10));
    }

    #[test]
    fn pares_separados_por_tabulador() {
        let pairs = parse_pairs("//a/t\t//b/t\n\n//a/u\t//b/u\n").unwrap();
        assert_eq!(pairs.len(), 2);
        assert_eq!(pairs[1].destination, "//b/u");
        assert!(parse_pairs("//a/t //b/t").is_err());
    }
}
