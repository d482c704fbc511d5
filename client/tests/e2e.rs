use serde_json::{json, Map};
use std::sync::Arc;
use std::time::Duration;
use tm_client::{PollerOptions, TaskClient};
use tm_common::cluster::TablePath;
use tm_common::format::Row;
use tm_common::{
    ClusterClient, ClusterDirectory, ClusterKind, Config, Context, ErrorKind, HttpConfig,
    InMemoryCluster, MatchPair, RetryPolicy, TaskState, TmError, TransactionConfig,
};
use tm_master::{build_router, AppState, MasterSettings};
use tm_worker::WorkerSettings;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;

const TOKEN: &str = "e2e-token";

struct Harness {
    src: InMemoryCluster,
    dst: InMemoryCluster,
    state: AppState,
    client: TaskClient,
    cancel: CancellationToken,
}

impl Drop for Harness {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

fn directory(src: &InMemoryCluster, dst: &InMemoryCluster) -> ClusterDirectory {
    let src: Arc<dyn ClusterClient> = Arc::new(src.clone());
    let dst: Arc<dyn ClusterClient> = Arc::new(dst.clone());
    ClusterDirectory::new("testing").with(src, None).with(dst, None)
}

/// Master real en un puerto libre, un worker y un cliente apuntando a él.
async fn harness(worker_concurrency: u32) -> Harness {
    let src = InMemoryCluster::new("src", ClusterKind::Yt);
    let dst = InMemoryCluster::new("dst", ClusterKind::Yt);
    let state = AppState::new(directory(&src, &dst), MasterSettings::default());

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let url = format!("http://{}", listener.local_addr().unwrap());
    let app = build_router(state.clone());
    tokio::spawn(async move { axum::serve(listener, app).await });

    let cancel = CancellationToken::new();
    let settings = WorkerSettings {
        master_url: url.clone(),
        hostname: "e2e-host".into(),
        max_concurrency: worker_concurrency,
        heartbeat_period: Duration::from_millis(50),
        idle_sleep: Duration::from_millis(20),
        request_timeout: Duration::from_secs(5),
        transaction: TransactionConfig::with_timeout(Duration::from_secs(30)),
    };
    tokio::spawn(tm_worker::run(
        settings,
        Arc::new(directory(&src, &dst)),
        cancel.child_token(),
    ));

    let config = Config {
        master_url: url,
        token: Some(TOKEN.into()),
        http: HttpConfig {
            request_timeout: Duration::from_secs(5),
            retry: RetryPolicy::default(),
        },
        ..Config::default()
    };
    let client = TaskClient::new(&config, cancel.child_token())
        .unwrap()
        .with_directory(Arc::new(directory(&src, &dst)))
        .with_poll_period(Duration::from_millis(50));

    Harness {
        src,
        dst,
        state,
        client,
        cancel,
    }
}

fn options() -> PollerOptions {
    PollerOptions {
        poll_period: Duration::from_millis(50),
        failed_tasks_restart_sleep: Duration::from_millis(50),
        ..PollerOptions::default()
    }
}

fn client_of(cluster: &InMemoryCluster) -> Arc<dyn ClusterClient> {
    Arc::new(cluster.clone())
}

async fn write(cluster: &InMemoryCluster, dir: &str, table: &str, rows: &[Row]) {
    let client = client_of(cluster);
    let root = Context::new();
    client.mkdir(&root, dir, true).await.unwrap();
    client
        .write_rows(&root, &TablePath::new(table), rows)
        .await
        .unwrap();
}

fn rows_x(values: &[i64]) -> Vec<Row> {
    values
        .iter()
        .map(|x| {
            let mut row = Row::new();
            row.insert("x".into(), json!(x));
            row
        })
        .collect()
}

fn task_count(state: &AppState) -> usize {
    state.tasks.lock().unwrap().len()
}

fn running_count(state: &AppState) -> usize {
    let tasks = state.tasks.lock().unwrap();
    let ids: Vec<String> = tasks.ids().cloned().collect();
    ids.iter()
        .filter(|id| tasks.get(id).map(|t| t.state == TaskState::Running).unwrap_or(false))
        .count()
}

async fn wait_until<F: Fn() -> bool>(what: &str, check: F) {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(20);
    while !check() {
        assert!(tokio::time::Instant::now() < deadline, "timeout esperando: {what}");
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn copia_ordenada_entre_clusteres_yt() {
    let h = harness(2).await;
    write(&h.src, "//a", "//a/t", &rows_x(&[1, 2, 100])).await;
    let src = client_of(&h.src);
    src.run_sort(&Context::new(), "//a/t".into(), "//a/t".into(), vec!["x".into()], Default::default())
        .await
        .unwrap()
        .wait(&CancellationToken::new(), Duration::from_millis(5), |_| {})
        .await
        .unwrap();

    let id = h
        .client
        .add_task("src", "//a/t", "dst", Some("//b/t"), &Map::new(), true)
        .await
        .unwrap();

    let dst = client_of(&h.dst);
    let root = Context::new();
    assert!(dst.exists(&root, "//b/t").await.unwrap());
    assert_eq!(
        dst.read_rows(&root, &TablePath::new("//b/t")).await.unwrap(),
        rows_x(&[1, 2, 100])
    );
    assert_eq!(dst.sorted_by(&root, "//b/t").await.unwrap(), vec!["x".to_string()]);
    let info = h.client.get_task_info(&id).await.unwrap();
    assert_eq!(info.state, TaskState::Completed);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn directorio_con_concurrencia_limitada() {
    let h = harness(4).await;
    for i in 0..10 {
        write(&h.src, "//tmp/d", &format!("//tmp/d/t{i}"), &[]).await;
    }
    h.dst.set_operation_latency(Duration::from_millis(100));

    // muestreo de tareas en running mientras dura el envío
    let sampler_state = h.state.clone();
    let stop = CancellationToken::new();
    let sampler_stop = stop.clone();
    let sampler = tokio::spawn(async move {
        let mut max_running = 0;
        while !sampler_stop.is_cancelled() {
            max_running = max_running.max(running_count(&sampler_state));
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        max_running
    });

    let ids = h
        .client
        .add_tasks(
            "src",
            "//tmp/d",
            "dst",
            "//tmp/d",
            &Map::new(),
            &PollerOptions {
                running_tasks_limit: 2,
                ..options()
            },
        )
        .await
        .unwrap();
    stop.cancel();
    let max_running = sampler.await.unwrap();

    assert_eq!(ids.len(), 10);
    assert!(max_running <= 2, "hubo {max_running} tareas en running");
    let dst = client_of(&h.dst);
    for i in 0..10 {
        assert!(dst.exists(&Context::new(), &format!("//tmp/d/t{i}")).await.unwrap());
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn salto_anticipado_no_crea_tareas() {
    let h = harness(2).await;
    write(&h.src, "//a", "//a/t", &rows_x(&[1])).await;
    write(&h.dst, "//b", "//b/t", &rows_x(&[7])).await;

    let mut params = Map::new();
    params.insert("skip_if_destination_exists".into(), json!(true));
    let ids = h
        .client
        .add_tasks(
            "src",
            "//a/t",
            "dst",
            "//b/t",
            &params,
            &PollerOptions {
                enable_early_skip_if_destination_exists: true,
                ..options()
            },
        )
        .await
        .unwrap();

    assert!(ids.is_empty());
    assert_eq!(task_count(&h.state), 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn abortar_y_reiniciar() {
    let h = harness(2).await;
    write(&h.src, "//a", "//a/t", &rows_x(&[1, 2, 3])).await;
    h.dst.set_operation_latency(Duration::from_secs(30));

    let id = h
        .client
        .add_task("src", "//a/t", "dst", Some("//b/t"), &Map::new(), false)
        .await
        .unwrap();
    let state = h.state.clone();
    let running_id = id.clone();
    wait_until("tarea en running", || {
        state.tasks.lock().unwrap().get(&running_id).map(|t| t.state).ok() == Some(TaskState::Running)
    })
    .await;

    h.client.abort_task(&id).await.unwrap();
    let info = h.client.wait_task(&id, Duration::from_millis(20)).await.unwrap();
    assert_eq!(info.state, TaskState::Aborted);

    // el worker suelta la copia cancelada antes de reintentar
    let in_flight = h.state.in_flight.clone();
    wait_until("worker libre", || in_flight.lock().unwrap().is_empty()).await;
    h.dst.set_operation_latency(Duration::ZERO);

    let new_id = h.client.restart_task(&id).await.unwrap();
    assert_ne!(new_id, id);
    let info = h.client.get_task_info(&new_id).await.unwrap();
    assert_ne!(info.state, TaskState::Aborted);

    let info = h.client.wait_task(&new_id, Duration::from_millis(20)).await.unwrap();
    assert_eq!(info.state, TaskState::Completed);
    assert!(client_of(&h.dst).exists(&Context::new(), "//b/t").await.unwrap());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn fallo_pasajero_se_reinicia() {
    let h = harness(2).await;
    write(&h.src, "//a", "//a/t", &rows_x(&[1, 2])).await;
    h.dst.inject_operation_failure(TmError::new(
        ErrorKind::TooManyFailedJobs,
        "Failed jobs limit exceeded",
    ));

    let pairs = vec![MatchPair {
        source: "//a/t".into(),
        destination: "//b/t".into(),
    }];
    let ids = h
        .client
        .add_tasks_from_src_dst_pairs(
            &pairs,
            "src",
            "dst",
            &Map::new(),
            &PollerOptions {
                enable_failed_tasks_restarting: true,
                max_failed_tasks_restart_count: 3,
                ..options()
            },
        )
        .await
        .unwrap();

    assert_eq!(ids.len(), 1);
    assert!(task_count(&h.state) <= 2);
    let info = h.client.get_task_info(&ids[0]).await.unwrap();
    assert_eq!(info.state, TaskState::Completed);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn demasiados_fallos_cortan_el_envio() {
    let h = harness(8).await;
    let mut pairs = Vec::new();
    for i in 0..100 {
        let table = format!("//tmp/f/t{i:03}");
        write(&h.src, "//tmp/f", &table, &[]).await;
        h.dst.inject_operation_failure(TmError::new(
            ErrorKind::TooManyFailedJobs,
            "Failed jobs limit exceeded",
        ));
        pairs.push(MatchPair {
            source: table.clone(),
            destination: table,
        });
    }

    let result = tokio::time::timeout(
        Duration::from_secs(60),
        h.client.add_tasks_from_src_dst_pairs(
            &pairs,
            "src",
            "dst",
            &Map::new(),
            &PollerOptions {
                running_tasks_limit: 100,
                enable_failed_tasks_restarting: true,
                failed_tasks_restart_sleep: Duration::from_secs(60),
                ..options()
            },
        ),
    )
    .await
    .unwrap();

    let err = result.unwrap_err();
    assert_eq!(err.message, "More than 60.0% of tasks failed");
    // ningún reinicio: como mucho una tarea remota por par
    assert!(task_count(&h.state) <= 100);
}
