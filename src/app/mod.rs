//! Process wiring: construct the collaborators, restore persisted users,
//! serve the control API, wait for a signal.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use tracing::{info, warn};

use crate::api::AppState;
use crate::common::IpPolicy;
use crate::dns::Resolver;
use crate::filter::{DomainFilter, DEFAULT_SOURCES};
use crate::proxy::ServerContext;
use crate::registry::Registry;
use crate::store::UserStore;

pub struct AppConfig {
    pub rpc_listen: String,
    pub store_path: PathBuf,
    pub hijack: Option<String>,
    pub filter_urls: Vec<String>,
}

pub struct App {
    registry: Arc<Registry>,
    store: Arc<UserStore>,
    filter: Arc<DomainFilter>,
    rpc_listen: String,
}

impl App {
    /// Construct every collaborator. The domain filter, resolver and policy
    /// are plain values wired through the server context; nothing global.
    /// A store that fails to open is fatal.
    pub fn new(config: AppConfig) -> Result<Self> {
        let store = Arc::new(UserStore::open(&config.store_path).context("open user store")?);

        let mut sources: Vec<String> = DEFAULT_SOURCES.iter().map(|s| s.to_string()).collect();
        sources.extend(config.filter_urls);
        let filter = Arc::new(DomainFilter::new(sources));

        let policy = Arc::new(IpPolicy::new());
        let resolver = Arc::new(Resolver::new(filter.clone(), policy.clone()));
        let ctx = Arc::new(ServerContext {
            resolver,
            filter: filter.clone(),
            policy,
            hijack: config.hijack,
        });
        let registry = Arc::new(Registry::new(ctx));

        Ok(Self {
            registry,
            store,
            filter,
            rpc_listen: config.rpc_listen,
        })
    }

    pub fn registry(&self) -> &Arc<Registry> {
        &self.registry
    }

    pub fn store(&self) -> &Arc<UserStore> {
        &self.store
    }

    /// Restore persisted users, serve the control API, then wait for
    /// SIGINT/SIGTERM and shut every tenant down.
    pub async fn run(self) -> Result<()> {
        let report = restore_users(&self.registry, &self.store).await;
        info!(
            started = report.started,
            failed = report.failed,
            "fast restore finished"
        );

        let state = AppState {
            registry: self.registry.clone(),
            store: self.store.clone(),
            filter: self.filter.clone(),
        };
        let api_handle = crate::api::start(&self.rpc_listen, state)
            .await
            .context("bind control API")?;

        wait_for_shutdown().await;
        info!("shutting down");

        self.registry.shutdown_all().await;
        api_handle.abort();
        Ok(())
    }
}

#[derive(Debug, Default)]
pub struct RestoreReport {
    pub started: usize,
    pub failed: usize,
}

/// Start every persisted user, overwriting counters with the stored values.
/// Users that are already running are left alone; a record that fails to
/// start is logged and removed.
pub async fn restore_users(registry: &Arc<Registry>, store: &Arc<UserStore>) -> RestoreReport {
    let mut report = RestoreReport::default();
    for (name, record) in store.load_all() {
        if registry.exists(&name).await {
            continue;
        }
        match registry
            .add(&name, &record.cipher, &record.password, record.port)
            .await
        {
            Ok(tenant) => {
                tenant.set_counters(record.traffic, record.time);
                report.started += 1;
            }
            Err(e) => {
                warn!(user = name.as_str(), error = %e, "restore failed, dropping record");
                if let Err(e) = store.delete(&name) {
                    warn!(user = name.as_str(), error = %e, "store delete failed");
                }
                report.failed += 1;
            }
        }
    }
    report
}

async fn wait_for_shutdown() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut term) => {
                tokio::select! {
                    _ = tokio::signal::ctrl_c() => {}
                    _ = term.recv() => {}
                }
            }
            Err(_) => {
                let _ = tokio::signal::ctrl_c().await;
            }
        }
    }
    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
    }
}
