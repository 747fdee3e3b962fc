//! Proxy lifecycle: init → load persisted state → serve → shutdown.

use crate::config::{RuntimeModes, Settings};
use crate::local::LocalResource;
use crate::persist::{self, StoreKind};
use crate::rules::{BlockRule, EditRule, FilterRule};
use crate::server::{self, ProxyState};
use anyhow::Result;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::Notify;
use tracing::{error, info, warn};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

/// CLI arguments forwarded from `main()`.
pub struct BootstrapArgs {
    pub config_path: std::path::PathBuf,
    pub listen: String,
}

pub async fn run(args: BootstrapArgs) -> Result<()> {
    // Phase 1: configuration and logging.
    let mut settings = Settings::load(&args.config_path)?;
    if let Some(port) = listen_port(&args.listen) {
        settings.port = port;
    }
    init_tracing(settings.debug_log_enabled);
    info!(
        "config: loaded settings, storage_dir={}, port={}",
        settings.storage_dir.display(),
        settings.port
    );

    if !crate::codec::zstd_available() {
        warn!("codec: zstd unavailable, zstd rewrites disabled");
    }

    for dir in [
        settings.storage_dir.clone(),
        settings.logs_dir(),
        settings.certs_dir(),
        settings.resources_dir(),
    ] {
        std::fs::create_dir_all(&dir)?;
    }

    // Phase 2: build state (generates the CA on first start).
    let state = ProxyState::new(settings)?;

    // Phase 3: load persisted stores.
    load_persisted_state(&state);

    // Phase 4: background persistence writer.
    let shutdown = Arc::new(Notify::new());
    start_persistence_flusher(&state, &shutdown);

    info!("server: starting proxy, listen={}", args.listen);
    let proxy_handle = tokio::spawn({
        let listen = args.listen.clone();
        let state = state.clone();
        let shutdown = shutdown.clone();
        async move { server::run_proxy_server(&listen, state, shutdown).await }
    });

    // Phase 5: block until signal, then drain.
    wait_for_shutdown(&shutdown).await;

    flush_dirty_stores(&state);
    if let Err(e) = proxy_handle.await {
        error!("server: proxy task error: {}", e);
    }

    info!("server: shutdown complete");
    Ok(())
}

fn listen_port(listen: &str) -> Option<u16> {
    listen.rsplit_once(':')?.1.parse().ok()
}

fn init_tracing(debug_enabled: bool) {
    let default_filter = if debug_enabled { "debug" } else { "info" };

    let (non_blocking, guard) = tracing_appender::non_blocking::NonBlockingBuilder::default()
        .buffered_lines_limit(128_000)
        .lossy(true)
        .finish(std::io::stdout());

    tracing_subscriber::registry()
        .with(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new(default_filter)),
        )
        .with(
            tracing_subscriber::fmt::layer()
                .with_writer(non_blocking)
                .with_ansi(false)
                .with_target(false)
                .json(),
        )
        .init();

    std::mem::forget(guard);
}

fn load_persisted_state(state: &ProxyState) {
    let storage = &state.settings.storage_dir;

    let edit_rules: Vec<EditRule> =
        persist::load_json_or_default(&storage.join(persist::EDIT_RULES_FILE));
    if !edit_rules.is_empty() {
        info!("config: loaded edit rules, count={}", edit_rules.len());
    }
    state.rules.load_edit_rules(edit_rules);

    let block_rules: Vec<BlockRule> =
        persist::load_json_or_default(&storage.join(persist::BLOCK_RULES_FILE));
    if !block_rules.is_empty() {
        info!("config: loaded block rules, count={}", block_rules.len());
    }
    state.rules.load_block_rules(block_rules);

    let (filter_rules, from_legacy): (Vec<FilterRule>, bool) =
        persist::load_filter_rules_file(storage);
    if !filter_rules.is_empty() {
        info!(
            "config: loaded filter rules, count={}, legacy={}",
            filter_rules.len(),
            from_legacy
        );
    }
    state.rules.load_filter_rules(filter_rules);
    if from_legacy {
        // Rewrite under the canonical filename right away.
        state.writer.mark(StoreKind::FilterRules);
    }

    let resources: HashMap<String, LocalResource> =
        persist::load_json_or_default(&storage.join(persist::RESOURCES_FILE));
    if !resources.is_empty() {
        info!("config: loaded local resources, count={}", resources.len());
    }
    state.local.load(resources);

    let modes: Option<RuntimeModes> = match std::fs::read_to_string(
        storage.join(persist::CONFIG_FILE),
    ) {
        Ok(content) => match serde_json::from_str(&content) {
            Ok(modes) => Some(modes),
            Err(e) => {
                warn!("config: failed to parse config.json, using defaults, error={}", e);
                None
            }
        },
        Err(_) => None,
    };
    if let Some(modes) = modes {
        state.modes.store(Arc::new(modes));
    }
}

/// Background writer: mutations mark stores dirty; this loop debounces and
/// writes each dirty file once per burst.
fn start_persistence_flusher(state: &ProxyState, shutdown: &Arc<Notify>) {
    let state = state.clone();
    let shutdown = shutdown.clone();

    tokio::spawn(async move {
        loop {
            tokio::select! {
                _ = state.writer.wait_dirty() => {}
                _ = shutdown.notified() => return,
            }
            // Collapse bursts of mutations into one write per store.
            tokio::time::sleep(std::time::Duration::from_millis(200)).await;
            flush_dirty_stores(&state);
        }
    });
}

fn flush_dirty_stores(state: &ProxyState) {
    for kind in state.writer.drain() {
        let result = match kind {
            StoreKind::EditRules => state
                .writer
                .write_json(kind, &*state.rules.edit_rules()),
            StoreKind::BlockRules => state
                .writer
                .write_json(kind, &*state.rules.block_rules()),
            StoreKind::FilterRules => state
                .writer
                .write_json(kind, &*state.rules.filter_rules()),
            StoreKind::Resources => state.writer.write_json(kind, &*state.local.snapshot()),
            StoreKind::Config => state.writer.write_json(kind, &state.modes()),
        };
        if let Err(e) = result {
            error!(
                "persist: write failed, file={}, error={}",
                kind.file_name(),
                e
            );
        }
    }
}

async fn wait_for_shutdown(shutdown: &Arc<Notify>) {
    let ctrl_c = tokio::signal::ctrl_c();

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("server: received SIGINT, shutting down"),
        _ = terminate => info!("server: received SIGTERM, shutting down"),
    }

    shutdown.notify_waiters();
}
