use std::sync::Arc;

use discovery::{DiscoveryClient, HostGetter, StaticHosts};
use store::{MemoryStore, StorePool};
use tokio::net::TcpListener;
use tracing_subscriber::EnvFilter;
use whisperer::{
    Gateway, PipelineSettings,
    clients::{self, GatekeeperClient, SeagullClient, ShorelineClient},
    config::{ServiceTarget, StartupError, WhisperConfig},
    transport_axum,
};

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let config = match WhisperConfig::load() {
        Ok(config) => config,
        Err(err) => {
            eprintln!("STARTUP_ERROR {err}");
            std::process::exit(1);
        }
    };

    let runtime = match tokio::runtime::Builder::new_multi_thread()
        .worker_threads(config.http_workers)
        .enable_all()
        .build()
    {
        Ok(runtime) => runtime,
        Err(err) => {
            eprintln!("STARTUP_ERROR ERR_RUNTIME: {err}");
            std::process::exit(1);
        }
    };

    if let Err(err) = runtime.block_on(run(config)) {
        eprintln!("STARTUP_ERROR {err}");
        std::process::exit(1);
    }
}

async fn run(config: WhisperConfig) -> Result<(), StartupError> {
    let pool = StorePool::new(Arc::new(open_store(&config)?), config.store_pool_size);

    let discovery_client = match &config.discovery {
        Some(discovery) => Some(
            DiscoveryClient::new(discovery.coordinator.clone(), config.upstream_timeout).map_err(
                |err| StartupError {
                    code: "ERR_DISCOVERY",
                    message: err.to_string(),
                },
            )?,
        ),
        None => None,
    };

    let mut background = Vec::new();
    if let (Some(client), Some(discovery)) = (&discovery_client, &config.discovery) {
        let services: Vec<String> = [&config.shoreline, &config.gatekeeper, &config.seagull]
            .into_iter()
            .filter_map(|target| match target {
                ServiceTarget::Discovered(service) => Some(service.clone()),
                ServiceTarget::Static(_) => None,
            })
            .collect();
        for service in &services {
            if let Err(err) = client.refresh(service).await {
                tracing::warn!(service = %service, error = %err, "initial discovery refresh failed");
            }
        }
        background.push(client.spawn_polling(
            services,
            discovery.publish.clone(),
            discovery.poll_interval,
        ));
    }

    let hosts_for = |target: &ServiceTarget| -> Result<Arc<dyn HostGetter>, StartupError> {
        match target {
            ServiceTarget::Static(url) => Ok(Arc::new(StaticHosts::single(url.clone()))),
            ServiceTarget::Discovered(service) => discovery_client
                .as_ref()
                .map(|client| Arc::new(client.watch(service.clone())) as Arc<dyn HostGetter>)
                .ok_or_else(|| StartupError {
                    code: "ERR_INVALID_CONFIG",
                    message: format!("service {service} needs WHISPER_DISCOVERY_URL"),
                }),
        }
    };

    let http = clients::http_client(config.upstream_timeout).map_err(|err| StartupError {
        code: "ERR_HTTP_CLIENT",
        message: err.to_string(),
    })?;

    let shoreline = Arc::new(ShorelineClient::new(
        hosts_for(&config.shoreline)?,
        http.clone(),
        config.server_name.clone(),
        config.server_secret.clone(),
    ));
    if let Err(err) = shoreline.login().await {
        tracing::warn!(error = %err, "initial server login failed; retrying in background");
    }
    background.push(shoreline.spawn_token_refresh(config.token_refresh));

    let gatekeeper = Arc::new(GatekeeperClient::new(
        hosts_for(&config.gatekeeper)?,
        http.clone(),
        shoreline.clone(),
    ));
    let seagull = Arc::new(SeagullClient::new(hosts_for(&config.seagull)?, http));

    let gateway = Arc::new(Gateway::new(
        shoreline.clone(),
        shoreline,
        gatekeeper,
        seagull,
        pool,
        PipelineSettings {
            schema_versions: config.schema_versions,
            upstream_timeout: config.upstream_timeout,
            store_timeout: config.store_timeout,
        },
    ));

    let listener = TcpListener::bind(config.bind_addr)
        .await
        .map_err(|err| StartupError {
            code: "ERR_BIND_FAILED",
            message: format!("failed to bind {}: {err}", config.bind_addr),
        })?;
    tracing::info!(
        bind_addr = %config.bind_addr,
        http_workers = config.http_workers,
        store_pool_size = config.store_pool_size,
        "whisperer listening"
    );

    let served = transport_axum::serve(listener, gateway, transport_axum::shutdown_signal()).await;
    for task in background {
        task.abort();
    }
    served.map_err(|err| StartupError {
        code: "ERR_SERVER_FAILED",
        message: err.to_string(),
    })
}

fn open_store(config: &WhisperConfig) -> Result<MemoryStore, StartupError> {
    let Some(path) = &config.store_path else {
        tracing::warn!("WHISPER_STORE_PATH not set; serving an empty store");
        return Ok(MemoryStore::new());
    };
    let (store, stats) = MemoryStore::load_jsonl(path).map_err(|err| StartupError {
        code: "ERR_STORE_LOAD",
        message: format!("failed to load {}: {err}", path.display()),
    })?;
    tracing::info!(
        path = %path.display(),
        documents = stats.documents,
        groups = stats.groups,
        ungrouped = stats.ungrouped,
        "store loaded"
    );
    Ok(store)
}
