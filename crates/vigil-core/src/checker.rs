//! Checker: one probe and its reactive state machine.

use std::sync::{Arc, Mutex};
use std::time::SystemTime;

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use vigil_common::{CheckerEvent, EventKind, Status, Weight};

use crate::check::{
    ForwardingData, GrpcProbe, HttpProbe, Metadata, Probe, ProbeError, TcpProbe, TlsSettings,
};
use crate::config::{CheckerConfig, CheckerFingerprint, CheckerKind};
use crate::scheduler::Scheduler;
use crate::status::{unix_seconds, CheckerStatus};

/// Why a check attempt is treated as failed.
pub(crate) enum CheckError {
    /// The probe itself failed.
    Probe(ProbeError),
    /// The checker is being torn down.
    Shutdown,
}

/// Check-level state.
#[derive(Debug, Clone)]
pub struct CheckerState {
    pub alive: bool,
    pub weight: Weight,
    pub failed_attempts: u32,
    pub last_check: Option<SystemTime>,
}

/// Runs one probe on a schedule and turns its results into state
/// transitions reported to the parent real.
///
/// The machine has two states, Disabled (initial) and Enabled. A success
/// enables the checker and refreshes the weight; failures count against
/// the retry threshold and disable it once exceeded. Stopping emits a
/// terminal Shutdown event so the parent can settle its counters.
pub struct Checker {
    config: CheckerConfig,
    fingerprint: CheckerFingerprint,
    probe: Box<dyn Probe>,
    state: Mutex<CheckerState>,
    events: mpsc::UnboundedSender<CheckerEvent>,
    cancel: CancellationToken,
}

impl Checker {
    /// Creates a checker. `init_weight` is the real's static weight, used
    /// until a probe supplies a dynamic one.
    pub fn new(
        config: CheckerConfig,
        events: mpsc::UnboundedSender<CheckerEvent>,
        init_weight: Weight,
        forwarding: ForwardingData,
        tls: &TlsSettings,
    ) -> Self {
        let probe: Box<dyn Probe> = match config.kind {
            CheckerKind::Tcp => Box::new(TcpProbe::new(&config, forwarding)),
            CheckerKind::Http => Box::new(HttpProbe::new(&config, forwarding, None)),
            CheckerKind::Https => Box::new(HttpProbe::new(&config, forwarding, Some(tls))),
            CheckerKind::Grpc => Box::new(GrpcProbe::new(&config, forwarding, tls)),
        };

        Checker {
            fingerprint: config.fingerprint(),
            state: Mutex::new(CheckerState {
                alive: false,
                weight: init_weight,
                failed_attempts: 0,
                last_check: None,
            }),
            config,
            probe,
            events,
            cancel: CancellationToken::new(),
        }
    }

    /// The identity this checker was configured with.
    pub fn fingerprint(&self) -> &CheckerFingerprint {
        &self.fingerprint
    }

    /// Signals the run loop to terminate. The loop emits the terminal
    /// Shutdown event before its task finishes.
    pub fn stop(&self) {
        self.cancel.cancel();
    }

    /// Runs the probe loop until stopped. The first attempt is randomly
    /// delayed within the loop period so a fleet of checkers spreads out.
    pub async fn run(self: Arc<Self>) {
        let scheduler = Scheduler::new(&self.config.scheduler).with_initial_delay();
        info!(
            uri = %self.probe.uri(),
            kind = %self.config.kind,
            delay = ?scheduler.initial_delay(),
            "running checker",
        );

        let this = Arc::clone(&self);
        scheduler
            .run(&self.cancel, move || {
                let this = Arc::clone(&this);
                async move { this.run_check().await }
            })
            .await;

        // Terminal event: the parent real reverses this checker's
        // contribution before the actor goes away.
        self.process_check(Metadata::inactive(), Some(CheckError::Shutdown));
        info!(uri = %self.probe.uri(), "checker stopped");
    }

    async fn run_check(&self) -> Result<(), ()> {
        let state = self.state();
        let mut metadata = Metadata::from_state(state.alive, state.weight);

        match self.probe.probe(&mut metadata).await {
            Ok(()) => {
                self.process_check(metadata, None);
                Ok(())
            }
            Err(err) => {
                self.process_check(metadata, Some(CheckError::Probe(err)));
                Err(())
            }
        }
    }

    /// Applies one probe result to the state machine.
    pub(crate) fn process_check(&self, metadata: Metadata, error: Option<CheckError>) {
        if metadata.alive {
            self.process_success(metadata);
        } else {
            self.process_fail(error.unwrap_or(CheckError::Shutdown));
        }
    }

    /// A successful check enables the checker, recalculates the weight
    /// when dynamic weight is on, and reports the transition if anything
    /// changed (or the probe demands processing regardless).
    fn process_success(&self, metadata: Metadata) {
        let mut state = self.state.lock().expect("checker state poisoned");
        state.last_check = Some(SystemTime::now());

        let status_changed = !state.alive;
        if status_changed {
            state.alive = true;
            state.failed_attempts = 0;
        }

        let mut weight_changed = false;
        if self.config.weight.dynamic_weight {
            let new_weight = metadata
                .weight
                .recalculate(state.weight, self.config.weight.dynamic_weight_coeff);
            if state.weight != new_weight {
                state.weight = new_weight;
                weight_changed = true;
            }
        }

        if !status_changed && !weight_changed && !metadata.force {
            return;
        }

        let event = CheckerEvent {
            kind: EventKind::Enable,
            new: Status {
                enable: true,
                weight: state.weight,
            },
        };
        drop(state);

        debug!(uri = %self.probe.uri(), "checker enabled");
        let _ = self.events.send(event);
    }

    /// A failed check counts towards the retry threshold; past it the
    /// checker disables and reports. The report is repeated for every
    /// further over-threshold failure: the parent may have changed its
    /// inhibit policy across a reload and must re-learn the state.
    fn process_fail(&self, error: CheckError) {
        let mut state = self.state.lock().expect("checker state poisoned");
        state.last_check = Some(SystemTime::now());

        let kind = match &error {
            CheckError::Shutdown => EventKind::Shutdown,
            CheckError::Probe(err) => {
                state.failed_attempts += 1;
                error!(
                    uri = %self.probe.uri(),
                    error = %err,
                    attempt = state.failed_attempts,
                    "check failed",
                );
                if state.failed_attempts <= self.config.scheduler.retries() {
                    return;
                }
                state.alive = false;
                EventKind::Disable
            }
        };

        let event = CheckerEvent {
            kind,
            new: Status {
                enable: false,
                weight: Weight::OMITTED,
            },
        };
        drop(state);

        let _ = self.events.send(event);
    }

    /// The current check-level state.
    pub fn state(&self) -> CheckerState {
        self.state.lock().expect("checker state poisoned").clone()
    }

    /// Snapshot for the management surface.
    pub fn status(&self) -> CheckerStatus {
        let state = self.state();
        CheckerStatus {
            kind: self.config.kind.to_string(),
            connect_ip: self.config.net.connect_ip,
            connect_port: self.config.net.connect_port.as_option(),
            bind_ip: self.config.net.bind_ip,
            connect_timeout: self.config.net.connect_timeout().as_secs_f64(),
            check_timeout: self.config.net.check_timeout().as_secs_f64(),
            fwmark: self.config.net.fwmark,
            path: self.config.url.path.clone(),
            status_code: self.config.url.status_code,
            digest: self.config.url.digest.clone(),
            virtualhost: self.config.url.virtualhost.clone(),
            dynamic_weight: self.config.weight.dynamic_weight,
            dynamic_weight_header: self.config.weight.dynamic_weight_header,
            dynamic_weight_coeff: self.config.weight.dynamic_weight_coeff,
            delay_loop: self.config.scheduler.delay_loop().as_secs_f64(),
            retries: self.config.scheduler.retries(),
            retry_delay: self.config.scheduler.retry_delay().as_secs_f64(),
            alive: state.alive,
            failed_attempts: state.failed_attempts,
            last_check_ts: state.last_check.map(unix_seconds),
        }
    }
}
