use crate::config::{RuntimeModes, Settings};
use crate::local::LocalResourceStore;
use crate::logstore::store::LogStore;
use crate::metrics::Metrics;
use crate::persist::{StoreKind, StoreWriter};
use crate::protowire::projection::ProjectionLimits;
use crate::proxy::upstream::{build_proxy_client, ProxyClient};
use crate::rewrite::connect::ConnectLimits;
use crate::routing::RoutingModes;
use crate::rules::store::RuleStore;
use crate::tls::CertificateAuthority;
use anyhow::Result;
use arc_swap::ArcSwap;
use std::sync::Arc;
use tracing::info;

/// Shared proxy state, cheaply cloneable.
///
/// Mode toggles live behind an ArcSwap so every flow reads one consistent
/// snapshot; rule and resource stores carry their own snapshot discipline.
#[derive(Clone)]
pub struct ProxyState {
    pub settings: Arc<Settings>,
    pub modes: Arc<ArcSwap<RuntimeModes>>,
    pub rules: Arc<RuleStore>,
    pub local: Arc<LocalResourceStore>,
    pub logs: Arc<LogStore>,
    pub authority: Arc<CertificateAuthority>,
    pub client: ProxyClient,
    pub writer: Arc<StoreWriter>,
    pub metrics: Metrics,
}

impl ProxyState {
    pub fn new(settings: Settings) -> Result<Self> {
        let authority = CertificateAuthority::load_or_create(&settings.certs_dir())?;
        info!(
            "tls: certificate authority ready, certs_dir={}",
            settings.certs_dir().display()
        );

        let client = build_proxy_client(&settings)?;
        let metrics = Metrics::install();

        Ok(Self {
            logs: Arc::new(LogStore::new(settings.max_log_entries)),
            local: Arc::new(LocalResourceStore::new(settings.resources_dir())),
            writer: Arc::new(StoreWriter::new(settings.storage_dir.clone())),
            rules: Arc::new(RuleStore::new()),
            modes: Arc::new(ArcSwap::new(Arc::new(RuntimeModes::default()))),
            authority: Arc::new(authority),
            client,
            metrics,
            settings: Arc::new(settings),
        })
    }

    pub fn modes(&self) -> RuntimeModes {
        **self.modes.load()
    }

    /// Swap in an updated mode set and queue config persistence.
    pub fn update_modes(&self, f: impl FnOnce(&mut RuntimeModes)) -> RuntimeModes {
        let mut modes = self.modes();
        f(&mut modes);
        self.modes.store(Arc::new(modes));
        self.writer.mark(StoreKind::Config);
        modes
    }

    pub fn routing_modes(&self) -> RoutingModes {
        let modes = self.modes();
        RoutingModes {
            interactive_mode_enabled: modes.interactive_mode_enabled,
            blocked_rules_enabled: modes.blocked_rules_enabled,
            filter_rules_enabled: modes.filter_rules_enabled,
            filter_mode: modes.filter_mode,
        }
    }

    pub fn connect_limits(&self) -> ConnectLimits {
        ConnectLimits {
            max_frames: self.settings.connect_max_frames,
            max_frame_bytes: self.settings.connect_max_frame_bytes,
            preview_max_bytes: self.settings.log_preview_max_bytes,
            projection: self.projection_limits(),
        }
    }

    pub fn projection_limits(&self) -> ProjectionLimits {
        ProjectionLimits {
            max_fields: self.settings.protobuf_max_fields,
            max_bytes: self.settings.protobuf_max_bytes,
        }
    }

    pub fn listen_port(&self) -> u16 {
        self.settings.port
    }
}
