use tandem::{
    Config, Dispatcher, HealthChecker, HttpForwarder, ServerPool, serve, shutdown_signal,
    spawn_health_checker,
};
use tokio::net::TcpListener;
use tokio::sync::watch;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

const CONFIG_FILE_PATH: &str = "./Config.yml";

fn init_tracing(default_level: &str) {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

#[tokio::main]
async fn main() {
    let config_path = std::env::args()
        .nth(1)
        .unwrap_or_else(|| CONFIG_FILE_PATH.to_owned());

    let config = Config::load_from_file(&config_path)
        .and_then(|c| c.into_runtime())
        .unwrap_or_else(|e| {
            eprintln!("fatal: {e}");
            std::process::exit(1);
        });

    init_tracing(&config.log_level);

    let forwarder = HttpForwarder::from_config(&config);
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let mut pools = Vec::with_capacity(config.pools.len());
    let mut servers = Vec::with_capacity(config.pools.len());

    for pool_config in &config.pools {
        let listener = TcpListener::bind(pool_config.listen)
            .await
            .unwrap_or_else(|e| {
                error!(addr = %pool_config.listen, %e, "failed to bind listener");
                std::process::exit(1);
            });

        let pool = ServerPool::from_config(pool_config);
        for backend in pool.all() {
            info!(
                upstream = %backend.uri(),
                weight = backend.weight(),
                strategy = %pool.strategy(),
                "configured server"
            );
        }

        let dispatcher = Dispatcher::new(
            pool.clone(),
            forwarder.clone(),
            config.retry,
            config.max_body_size,
        );

        let mut stop = shutdown_rx.clone();
        servers.push(tokio::spawn(serve(listener, dispatcher, async move {
            let _ = stop.wait_for(|stopped| *stopped).await;
        })));
        pools.push(pool);
    }

    let health = spawn_health_checker(
        HealthChecker::new(pools, config.probe_timeout),
        config.health_check_interval,
    );

    shutdown_signal().await;
    let _ = shutdown_tx.send(true);

    for server in servers {
        if let Err(e) = server.await {
            error!(%e, "listener task failed");
        }
    }
    health.abort();
}
