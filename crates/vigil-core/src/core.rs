//! Top-level supervisor of the configured services.

use std::collections::HashMap;
use std::sync::Arc;

use thiserror::Error;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use vigil_announcer::{AnnounceError, Announcer};
use vigil_balancer::Balancer;
use vigil_common::ServiceKey;

use crate::check::TlsSettings;
use crate::config::ServicesConfig;
use crate::service::Service;
use crate::status::ServiceStatus;

#[derive(Debug, Error)]
pub enum CoreError {
    #[error("failed to reload announcer: {0}")]
    Announcer(#[from] AnnounceError),
}

struct ServiceHandle {
    service: Arc<Service>,
    task: JoinHandle<()>,
}

/// Owns the set of services and drives configuration reloads.
pub struct Core {
    services: tokio::sync::Mutex<HashMap<ServiceKey, ServiceHandle>>,
    announcer: Arc<Announcer>,
    balancer: Arc<Balancer>,
    tls: TlsSettings,
    cancel: CancellationToken,
}

impl Core {
    pub fn new(announcer: Arc<Announcer>, balancer: Arc<Balancer>, tls: TlsSettings) -> Self {
        Core {
            services: tokio::sync::Mutex::new(HashMap::new()),
            announcer,
            balancer,
            tls,
            cancel: CancellationToken::new(),
        }
    }

    /// Applies a new services configuration.
    ///
    /// The announcer is rebound first: services gone from the config stop
    /// counting toward their prefixes right away, queueing the withdrawals
    /// before any service teardown starts. Then services are diffed by
    /// key: retained ones reload in place, new ones are created and
    /// launched, vanished ones are stopped.
    pub async fn reload(&self, config: &ServicesConfig) -> Result<(), CoreError> {
        let mut services = self.services.lock().await;

        self.announcer.reload_services(&config.announce_groups())?;

        let mut current = std::mem::take(&mut *services);
        let mut next = HashMap::new();
        for service_config in &config.services {
            if self.cancel.is_cancelled() {
                warn!("core reload aborted");
                current.extend(next);
                *services = current;
                return Ok(());
            }

            let key = service_config.key();
            let service_config = Arc::new(service_config.clone());
            if let Some(handle) = current.remove(&key) {
                handle.service.reload(service_config).await;
                next.insert(key, handle);
                continue;
            }

            let service = Arc::new(Service::new(
                service_config,
                Arc::clone(&self.announcer),
                Arc::clone(&self.balancer),
                self.tls,
            ));
            let task = tokio::spawn(Arc::clone(&service).run());
            next.insert(key, ServiceHandle { service, task });
        }

        for (_, handle) in current {
            handle.service.stop().await;
            let _ = handle.task.await;
        }

        *services = next;
        Ok(())
    }

    /// Stops every service; each teardown cascades the proper Disable and
    /// Shutdown events through reals and checkers before this returns.
    pub async fn stop(&self) {
        info!("stopping core");
        self.cancel.cancel();

        let mut services = self.services.lock().await;
        for (_, handle) in services.drain() {
            handle.service.stop().await;
            let _ = handle.task.await;
        }
        info!("core stopped");
    }

    /// Snapshot of every service for the management surface.
    pub async fn status(&self) -> Vec<ServiceStatus> {
        let services = self.services.lock().await;
        let mut statuses = Vec::with_capacity(services.len());
        for handle in services.values() {
            statuses.push(handle.service.status().await);
        }
        statuses
    }
}
