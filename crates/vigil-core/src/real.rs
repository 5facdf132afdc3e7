//! Real server: aggregates checkers and applies the inhibit policy.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use futures::future::BoxFuture;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use vigil_common::{CheckerEvent, EventKind, RealEvent, RealKey, Status, Weight};

use crate::check::{ForwardingData, TlsSettings};
use crate::checker::Checker;
use crate::config::{CheckerFingerprint, RealConfig};
use crate::status::RealStatus;

/// Gate deciding whether a real may start its checkers. The future
/// resolves to `false` when the wait was cancelled.
pub type ActivationGate = Box<dyn Fn(CancellationToken) -> BoxFuture<'static, bool> + Send + Sync>;

/// Real-level state.
#[derive(Debug, Clone)]
pub struct RealState {
    pub alive: bool,
    pub weight: Weight,
    pub transitions: u64,
    /// Whether any checker supplies a dynamic weight. Recomputed on every
    /// reload, under the state lock.
    pub dyn_weight: bool,
    /// A failed real under inhibit-on-failure stays enabled at weight
    /// zero. The stored weight is kept as-is so a later recovery restores
    /// the pre-inhibition value.
    pub inhibited: bool,
}

impl Default for RealState {
    fn default() -> Self {
        RealState {
            alive: false,
            weight: Weight::ZERO,
            transitions: 0,
            dyn_weight: false,
            inhibited: false,
        }
    }
}

impl RealState {
    /// The status this real reports downstream. An inhibited real is
    /// enabled with weight zero.
    pub fn status(&self) -> Status {
        if self.inhibited {
            return Status {
                enable: true,
                weight: Weight::ZERO,
            };
        }
        Status {
            enable: self.alive,
            weight: self.weight,
        }
    }
}

struct CheckerHandle {
    checker: Arc<Checker>,
    task: JoinHandle<()>,
}

/// A real server: a set of checkers probing one backend, folded into a
/// single alive/weight status reported to the parent service.
pub struct Real {
    key: RealKey,
    config: Mutex<Arc<RealConfig>>,
    state: Mutex<RealState>,
    checkers: tokio::sync::Mutex<HashMap<CheckerFingerprint, CheckerHandle>>,
    /// Sender cloned into every checker; dropped on stop to close the
    /// event channel.
    checker_tx: Mutex<Option<mpsc::UnboundedSender<CheckerEvent>>>,
    checker_rx: Mutex<Option<mpsc::UnboundedReceiver<CheckerEvent>>>,
    events: mpsc::UnboundedSender<RealEvent>,
    activation: Option<ActivationGate>,
    tls: TlsSettings,
    cancel: CancellationToken,
}

impl Real {
    pub fn new(
        config: Arc<RealConfig>,
        events: mpsc::UnboundedSender<RealEvent>,
        tls: TlsSettings,
        activation: Option<ActivationGate>,
    ) -> Self {
        let (checker_tx, checker_rx) = mpsc::unbounded_channel();
        let real = Real {
            key: config.key(),
            config: Mutex::new(config),
            state: Mutex::new(RealState::default()),
            checkers: tokio::sync::Mutex::new(HashMap::new()),
            checker_tx: Mutex::new(Some(checker_tx)),
            checker_rx: Mutex::new(Some(checker_rx)),
            events,
            activation,
            tls,
            cancel: CancellationToken::new(),
        };
        info!(real = %real.key, "real created");
        real
    }

    pub fn key(&self) -> RealKey {
        self.key
    }

    pub fn state(&self) -> RealState {
        self.state.lock().expect("real state poisoned").clone()
    }

    /// Runs the real: waits for downstream admission when gated, starts
    /// the configured checkers, then drains their events until stopped.
    pub async fn run(self: Arc<Self>) {
        if let Some(gate) = &self.activation {
            if !gate(self.cancel.child_token()).await {
                info!(real = %self.key, "real was not activated");
                return;
            }
        }

        info!(real = %self.key, "running real");
        let config = Arc::clone(&self.config.lock().expect("real config poisoned"));
        self.apply_config(&config).await;

        let receiver = self.checker_rx.lock().expect("real channel poisoned").take();
        let Some(mut receiver) = receiver else { return };
        while let Some(event) = receiver.recv().await {
            self.handle_event(event);
        }
        info!(real = %self.key, "real stopped");
    }

    /// Applies a new configuration: checkers whose fingerprint survives
    /// are kept running, new ones are created, and the rest are stopped.
    pub async fn reload(&self, config: Arc<RealConfig>) {
        *self.config.lock().expect("real config poisoned") = Arc::clone(&config);
        self.apply_config(&config).await;
    }

    async fn apply_config(&self, config: &RealConfig) {
        let mut checkers = self.checkers.lock().await;

        let forwarding = ForwardingData {
            real_ip: config.ip,
            method: config.forwarding_method.unwrap_or_default(),
        };

        let mut current = std::mem::take(&mut *checkers);
        let mut next = HashMap::new();
        for checker_config in config.checkers() {
            if self.cancel.is_cancelled() {
                warn!(real = %self.key, "reload aborted");
                current.extend(next);
                *checkers = current;
                return;
            }

            let fingerprint = checker_config.fingerprint();
            if let Some(handle) = current.remove(&fingerprint) {
                next.insert(fingerprint, handle);
                continue;
            }

            let sender = self.checker_tx.lock().expect("real channel poisoned").clone();
            let Some(sender) = sender else {
                current.extend(next);
                *checkers = current;
                return;
            };
            let checker = Arc::new(Checker::new(
                checker_config.clone(),
                sender,
                config.weight,
                forwarding,
                &self.tls,
            ));
            let task = tokio::spawn(Arc::clone(&checker).run());
            next.insert(fingerprint, CheckerHandle { checker, task });
        }

        // Checkers absent from the new configuration are stopped; each
        // queues its terminal Shutdown event before its task finishes.
        for (_, handle) in current {
            handle.checker.stop();
            let _ = handle.task.await;
        }

        self.state.lock().expect("real state poisoned").dyn_weight = config.dynamic_weight();
        *checkers = next;
    }

    /// Stops the real: terminates every checker, waits for their terminal
    /// events to be queued, and closes the event channel so the drain
    /// loop exits after consuming them.
    pub async fn stop(&self) {
        self.cancel.cancel();

        let mut checkers = self.checkers.lock().await;
        for (_, handle) in checkers.drain() {
            handle.checker.stop();
            let _ = handle.task.await;
        }
        drop(checkers);

        self.checker_tx.lock().expect("real channel poisoned").take();
    }

    /// Folds one checker transition into the real's state and forwards
    /// the resulting real-level transition, if any, to the service.
    pub fn handle_event(&self, event: CheckerEvent) {
        let (inhibit, static_weight) = {
            let config = self.config.lock().expect("real config poisoned");
            (config.inhibit_on_failure, config.weight)
        };

        let forwarded = {
            let mut state = self.state.lock().expect("real state poisoned");
            match event.kind {
                EventKind::Enable => self.process_success(&mut state, static_weight, event),
                EventKind::Disable => self.process_fail(&mut state, inhibit),
                EventKind::Shutdown => self.process_shutdown(&state),
            }
        };

        if let Some(event) = forwarded {
            let _ = self.events.send(event);
        }
    }

    fn process_success(
        &self,
        state: &mut RealState,
        static_weight: Weight,
        event: CheckerEvent,
    ) -> Option<RealEvent> {
        let init = state.status();

        // Without dynamic weight the static config weight applies; with
        // it, an omitted probe weight keeps the current value.
        let new_weight = if !state.dyn_weight {
            static_weight
        } else if !event.new.weight.is_omitted() {
            event.new.weight
        } else {
            state.weight
        };

        let weight_changed = state.weight != new_weight;
        if weight_changed {
            state.weight = new_weight;
            info!(real = %self.key, weight = %state.weight, "real weight changed");
        }

        let status_changed = !state.alive;
        if status_changed {
            state.alive = true;
            state.inhibited = false;
            state.transitions += 1;
            info!(real = %self.key, weight = %state.weight, "real enabled");
        }

        if !status_changed && !weight_changed {
            return None;
        }

        Some(RealEvent {
            kind: EventKind::Enable,
            real: self.key,
            init,
            new: state.status(),
        })
    }

    fn process_fail(&self, state: &mut RealState, inhibit: bool) -> Option<RealEvent> {
        let init = state.status();

        // An already-disabled real normally has nothing to report. The
        // inhibit flag may have flipped across a reload though: with
        // inhibit now on, a repeated checker failure must re-surface as
        // enabled-at-zero, so it is only dropped once inhibition took
        // effect.
        if !state.alive && !inhibit {
            return None;
        }
        if !state.alive && state.inhibited {
            return None;
        }

        if inhibit {
            state.inhibited = true;
        }
        state.alive = false;
        state.transitions += 1;
        info!(real = %self.key, inhibited = state.inhibited, "real disabled");

        // Under inhibition the balancer keeps the real, drained to zero.
        let (kind, new) = if state.inhibited {
            (
                EventKind::Enable,
                Status {
                    enable: true,
                    weight: Weight::ZERO,
                },
            )
        } else {
            (
                EventKind::Disable,
                Status {
                    enable: false,
                    weight: Weight::OMITTED,
                },
            )
        };

        Some(RealEvent {
            kind,
            real: self.key,
            init,
            new,
        })
    }

    fn process_shutdown(&self, state: &RealState) -> Option<RealEvent> {
        // A disabled, uninhibited real contributes nothing to reverse.
        if !state.alive && !state.inhibited {
            return None;
        }

        Some(RealEvent {
            kind: EventKind::Shutdown,
            real: self.key,
            init: state.status(),
            new: Status {
                enable: false,
                weight: Weight::OMITTED,
            },
        })
    }

    /// Snapshot for the management surface.
    pub async fn status(&self) -> RealStatus {
        let checkers = self.checkers.lock().await;
        let state = self.state();

        RealStatus {
            ip: self.key.addr,
            port: self.key.port.as_option(),
            alive: state.alive,
            weight: state.weight.as_u32(),
            transitions: state.transitions,
            checkers: checkers.values().map(|handle| handle.checker.status()).collect(),
        }
    }

    #[cfg(test)]
    pub(crate) fn set_dynamic_weight(&self, enabled: bool) {
        self.state.lock().unwrap().dyn_weight = enabled;
    }

    #[cfg(test)]
    pub(crate) fn set_config(&self, config: Arc<RealConfig>) {
        *self.config.lock().unwrap() = config;
    }
}
