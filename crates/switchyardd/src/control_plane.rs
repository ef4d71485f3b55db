//! Control plane assembly — wires every subsystem from one config.
//!
//! ```text
//!                  ┌──────────────── http port ────────────────┐
//! clients ───────► │ /mcp-router        ConnectionRouter       │
//! operators ─────► │ /registry-dashboard Dashboard (if merged) │
//! scrapers/CI ───► │ /health /api/v1/* /metrics                │
//!                  └───────────────────────────────────────────┘
//!
//! background: session sweeper · autoscaler · usage monitor · broadcaster
//! ```
//!
//! Every background loop watches the same shutdown channel.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;

use axum::Router;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{error, info};

use switchyard_api::ApiState;
use switchyard_autoscale::Autoscaler;
use switchyard_core::{StaticTokenValidator, SwitchyardConfig, TokenValidator};
use switchyard_dashboard::Dashboard;
use switchyard_health::UsageMonitor;
use switchyard_registry::{InstanceRegistry, provisioner};
use switchyard_router::ConnectionRouter;
use switchyard_sessions::SessionStore;

/// Every subsystem of one Switchyard process.
pub struct ControlPlane {
    pub config: SwitchyardConfig,
    pub registry: Arc<InstanceRegistry>,
    pub sessions: Arc<SessionStore>,
    pub autoscaler: Arc<Autoscaler>,
    pub router: Arc<ConnectionRouter>,
    pub dashboard: Arc<Dashboard>,
    pub usage: Option<Arc<UsageMonitor>>,
    started: Instant,
}

impl ControlPlane {
    /// Build every subsystem. Nothing runs until [`serve`](Self::serve).
    pub fn build(config: SwitchyardConfig) -> anyhow::Result<Self> {
        let validator = StaticTokenValidator::from_config(&config.auth.tokens);
        Self::with_validator(config, Arc::new(validator))
    }

    /// Like [`build`](Self::build) with a caller-supplied token validator.
    pub fn with_validator(
        config: SwitchyardConfig,
        validator: Arc<dyn TokenValidator>,
    ) -> anyhow::Result<Self> {
        config.validate()?;

        let registry = Arc::new(InstanceRegistry::new(&config.registry));
        info!(
            max_instances = config.registry.max_instances,
            max_connections = config.registry.max_connections_per_instance,
            strategy = config.registry.strategy.as_str(),
            "instance registry initialized"
        );

        let liveness = registry.clone();
        let sessions = Arc::new(
            SessionStore::from_config(&config.sessions)?
                .with_liveness(Arc::new(move |id: &str| liveness.is_live(id))),
        );
        info!(ttl = %config.sessions.ttl, restored = sessions.len(), "session store initialized");

        let mut autoscaler = Autoscaler::new(registry.clone(), config.registry.auto_scaling.clone());
        if let Some(provisioner_config) = &config.provisioner {
            autoscaler = autoscaler.with_provisioner(provisioner::from_config(provisioner_config)?);
            info!("worker provisioner configured");
        }
        let autoscaler = Arc::new(autoscaler);

        let router = Arc::new(ConnectionRouter::new(
            registry.clone(),
            sessions.clone(),
            validator,
        ));

        let dashboard = Arc::new(Dashboard::new(
            registry.clone(),
            sessions.clone(),
            autoscaler.clone(),
            config.dashboard.broadcast_interval(),
        ));

        let usage = config
            .usage
            .enabled
            .then(|| Arc::new(UsageMonitor::new(registry.clone(), &config.usage)));

        Ok(Self {
            config,
            registry,
            sessions,
            autoscaler,
            router,
            dashboard,
            usage,
            started: Instant::now(),
        })
    }

    /// Whether the dashboard shares the HTTP listener.
    pub fn dashboard_merged(&self) -> bool {
        self.config.dashboard.enabled && self.config.dashboard.port == self.config.http.port
    }

    /// Routes served on the HTTP port.
    pub fn http_app(&self) -> Router {
        let api = switchyard_api::build_router(ApiState {
            registry: self.registry.clone(),
            sessions: self.sessions.clone(),
            autoscaler: self.autoscaler.clone(),
            connections: self.router.connections(),
            started: self.started,
        });
        let app = self.router.clone().routes().merge(api);
        if self.dashboard_merged() {
            app.merge(self.dashboard.clone().routes())
        } else {
            app
        }
    }

    /// Routes served on a separate dashboard port.
    pub fn dashboard_app(&self) -> Router {
        self.dashboard.clone().routes()
    }

    /// Start every background loop.
    pub fn spawn_background(&self, shutdown: &watch::Receiver<bool>) -> Vec<JoinHandle<()>> {
        let mut handles = vec![
            tokio::spawn(self.sessions.clone().run_sweeper(shutdown.clone())),
            tokio::spawn(self.autoscaler.clone().run(shutdown.clone())),
        ];
        if let Some(usage) = &self.usage {
            handles.push(tokio::spawn(usage.clone().run(shutdown.clone())));
        }
        if self.config.dashboard.enabled {
            handles.push(tokio::spawn(
                self.dashboard.clone().run_broadcaster(shutdown.clone()),
            ));
        }
        handles
    }

    /// Serve until `shutdown` flips to `true`.
    ///
    /// `dashboard` is the separate dashboard listener. Pass `None` when the
    /// dashboard is merged into the HTTP port or disabled.
    pub async fn serve(
        self,
        http: TcpListener,
        dashboard: Option<TcpListener>,
        shutdown: watch::Receiver<bool>,
    ) -> anyhow::Result<()> {
        let background = self.spawn_background(&shutdown);

        let dashboard_handle = dashboard.map(|listener| {
            let app = self.dashboard_app();
            let shutdown = shutdown.clone();
            tokio::spawn(async move {
                if let Ok(addr) = listener.local_addr() {
                    info!(%addr, "dashboard server listening");
                }
                let server = axum::serve(listener, app).with_graceful_shutdown(wait_for(shutdown));
                if let Err(e) = server.await {
                    error!(error = %e, "dashboard server error");
                }
            })
        });

        info!(addr = %http.local_addr()?, merged_dashboard = self.dashboard_merged(), "http server listening");
        axum::serve(http, self.http_app())
            .with_graceful_shutdown(wait_for(shutdown))
            .await?;

        if let Some(handle) = dashboard_handle {
            let _ = handle.await;
        }
        for handle in background {
            let _ = handle.await;
        }
        info!("control plane stopped");
        Ok(())
    }

    /// Bind the configured listeners.
    pub async fn bind(&self) -> anyhow::Result<(TcpListener, Option<TcpListener>)> {
        let host: std::net::IpAddr = self.config.http.host.parse()?;
        let http = TcpListener::bind(SocketAddr::new(host, self.config.http.port)).await?;
        let dashboard = if self.config.dashboard.enabled && !self.dashboard_merged() {
            Some(TcpListener::bind(SocketAddr::new(host, self.config.dashboard.port)).await?)
        } else {
            None
        };
        Ok((http, dashboard))
    }
}

async fn wait_for(mut shutdown: watch::Receiver<bool>) {
    let _ = shutdown.wait_for(|stop| *stop).await;
}
