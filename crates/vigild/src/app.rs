//! Component wiring and lifecycle.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use vigil_announcer::bird::BirdClient;
use vigil_announcer::{AnnounceClient, Announcer};
use vigil_balancer::yanet::YanetClient;
use vigil_balancer::{Balancer, LoadBalancerClient};
use vigil_core::{Core, Manager, TlsSettings};

use crate::config::AppConfig;
use crate::server;

/// How long a graceful shutdown may take before the process gives up.
const SHUTDOWN_BUDGET: Duration = Duration::from_secs(10);

/// The assembled daemon.
pub struct App {
    config: AppConfig,
    announcer: Arc<Announcer>,
    balancer: Arc<Balancer>,
    core: Arc<Core>,
    manager: Arc<Manager>,
}

impl App {
    /// Wires all components together. Fails when the announce sockets
    /// cannot be created with the required permissions.
    pub fn new(config: AppConfig) -> anyhow::Result<Self> {
        let tls = TlsSettings {
            min_version: match config.tls_min_version.parse() {
                Ok(version) => version,
                Err(err) => {
                    warn!(error = %err, "falling back to the default probe TLS version");
                    Default::default()
                }
            },
            sni_enabled: config.experiments.tls_sni_enabled(),
        };

        let bird = Arc::new(
            BirdClient::new(&config.bird, &config.announcer.announce_group)
                .context("failed to create bird client")?,
        );
        let bird_client: Arc<dyn AnnounceClient> = Arc::<BirdClient>::clone(&bird);
        let announcer = Arc::new(Announcer::with_stater(
            config.announcer.clone(),
            bird_client,
            bird,
        ));

        let yanet = Arc::new(YanetClient::new(&config.yanet));
        let yanet_client: Arc<dyn LoadBalancerClient> = Arc::<YanetClient>::clone(&yanet);
        let balancer = Arc::new(Balancer::with_stater(
            config.balancer.clone(),
            yanet_client,
            yanet,
        ));

        let core = Arc::new(Core::new(
            Arc::clone(&announcer),
            Arc::clone(&balancer),
            tls,
        ));
        let manager = Arc::new(Manager::new(
            config.service.clone(),
            config.experiments.clone(),
            Arc::clone(&core),
        ));

        Ok(App {
            config,
            announcer,
            balancer,
            core,
            manager,
        })
    }

    /// Runs the daemon until `shutdown` fires, then tears the components
    /// down in dependency order: the management server first, then the
    /// core (cascading Disable/Shutdown events through reals and
    /// checkers), then the balancer so its final batch disables those
    /// reals downstream, and the announcer last to withdraw every prefix.
    pub async fn run(self, shutdown: CancellationToken) -> anyhow::Result<()> {
        let announcer_task = tokio::spawn({
            let announcer = Arc::clone(&self.announcer);
            async move { announcer.run().await }
        });
        let balancer_task = tokio::spawn({
            let balancer = Arc::clone(&self.balancer);
            async move { balancer.run().await }
        });

        let server_cancel = CancellationToken::new();
        let server_task = tokio::spawn(server::run(
            self.config.server.clone(),
            Arc::clone(&self.manager),
            server_cancel.clone(),
        ));

        // Apply the services configuration present at startup. A broken
        // config is not fatal: the daemon stays up, empty, until a reload
        // brings a valid one.
        if let Err(err) = self.manager.reload().await {
            error!(error = %err, "failed to load initial services configuration");
        }

        shutdown.cancelled().await;
        info!("shutting down");

        let graceful = tokio::time::timeout(SHUTDOWN_BUDGET, async {
            server_cancel.cancel();
            if let Ok(Err(err)) = server_task.await {
                error!(error = %err, "management server failed");
            }

            self.core.stop().await;

            self.balancer.stop();
            let _ = balancer_task.await;

            self.announcer.stop().await;
            let _ = announcer_task.await;
        })
        .await;

        if graceful.is_err() {
            warn!("graceful shutdown budget exceeded");
        }
        Ok(())
    }
}
