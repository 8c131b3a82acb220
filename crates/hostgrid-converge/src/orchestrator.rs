//! Per-shard convergence with single-flight coalescing.
//!
//! Every `converge(shard)` call bumps the shard's requested generation. At
//! most one driver task runs per shard; it snapshots the ledger at the
//! latest requested generation, dispatches, publishes the outcome and
//! repeats while newer requests arrived meanwhile. A caller returns the
//! first outcome whose generation covers its own request, so overlapping
//! triggers collapse into one run and no run ever dispatches a snapshot
//! older than one already dispatched.
//!
//! A completed dispatch counts as an acknowledgement only if its output
//! echoes the fingerprint of the document this run sent.

use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use serde_json::{Value, json};
use tokio::sync::{Mutex, watch};
use tracing::{debug, error, info, warn};

use hostgrid_ledger::{Ledger, ResourceStatus, ShardStatus, truncate_message};
use hostgrid_workflow::{WorkflowExecutor, WorkflowKey, WorkflowStatus};

use crate::desired::{DesiredState, compute_desired_state};
use crate::error::{ConvergeError, ConvergeResult};

/// Tuning for the orchestrator.
#[derive(Debug, Clone)]
pub struct ConvergeConfig {
    /// How long to wait for nodes to acknowledge a dispatched document.
    pub ack_timeout: Duration,
}

impl Default for ConvergeConfig {
    fn default() -> Self {
        Self {
            ack_timeout: Duration::from_secs(120),
        }
    }
}

impl ConvergeConfig {
    pub fn with_ack_timeout(mut self, timeout: Duration) -> Self {
        self.ack_timeout = timeout;
        self
    }
}

/// How fire-and-forget triggers are handled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TriggerMode {
    /// Spawn a convergence task per trigger.
    Spawn,
    /// Record the shard as dirty until [`Orchestrator::flush`].
    Deferred,
}

/// Outcome of one dispatched convergence run.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ConvergeReport {
    pub shard_id: String,
    pub generation: u64,
    pub fingerprint: String,
    pub acknowledged: Vec<String>,
    pub unacknowledged: Vec<String>,
    /// `kind/id` of every resource promoted to active.
    pub promoted: Vec<String>,
}

impl ConvergeReport {
    /// Every node acknowledged the document.
    pub fn is_complete(&self) -> bool {
        self.unacknowledged.is_empty()
    }
}

type Published = Option<(u64, ConvergeResult<ConvergeReport>)>;

struct Flight {
    requested: u64,
    running: bool,
    outcome: watch::Sender<Published>,
}

impl Flight {
    fn new() -> Self {
        let (outcome, _) = watch::channel(None);
        Self {
            requested: 0,
            running: false,
            outcome,
        }
    }
}

struct Inner {
    ledger: Ledger,
    executor: Arc<dyn WorkflowExecutor>,
    config: ConvergeConfig,
    mode: TriggerMode,
    flights: Mutex<HashMap<String, Flight>>,
    dirty: Mutex<BTreeSet<String>>,
}

/// The convergence orchestrator. Cheap to clone.
#[derive(Clone)]
pub struct Orchestrator {
    inner: Arc<Inner>,
}

impl Orchestrator {
    pub fn new(ledger: Ledger, executor: Arc<dyn WorkflowExecutor>) -> Self {
        Self::with_config(ledger, executor, ConvergeConfig::default(), TriggerMode::Spawn)
    }

    pub fn with_config(
        ledger: Ledger,
        executor: Arc<dyn WorkflowExecutor>,
        config: ConvergeConfig,
        mode: TriggerMode,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                ledger,
                executor,
                config,
                mode,
                flights: Mutex::new(HashMap::new()),
                dirty: Mutex::new(BTreeSet::new()),
            }),
        }
    }

    pub fn mode(&self) -> TriggerMode {
        self.inner.mode
    }

    /// Compute the shard's document without dispatching it.
    pub fn desired_state(&self, shard_id: &str) -> ConvergeResult<DesiredState> {
        compute_desired_state(&self.inner.ledger, shard_id)
    }

    /// Converge a shard and wait for a run that covers this request.
    pub async fn converge(&self, shard_id: &str) -> ConvergeResult<ConvergeReport> {
        let (generation, mut rx, start_driver) = {
            let mut flights = self.inner.flights.lock().await;
            let flight = flights
                .entry(shard_id.to_string())
                .or_insert_with(Flight::new);
            flight.requested += 1;
            let start_driver = !flight.running;
            flight.running = true;
            (flight.requested, flight.outcome.subscribe(), start_driver)
        };

        if start_driver {
            let this = self.clone();
            let shard = shard_id.to_string();
            tokio::spawn(async move { this.drive(shard).await });
        } else {
            debug!(%shard_id, generation, "converge coalesced onto running flight");
        }

        let published = rx
            .wait_for(|p| p.as_ref().is_some_and(|(g, _)| *g >= generation))
            .await
            .map_err(|_| ConvergeError::Dispatch("convergence driver stopped".into()))?;
        match published.as_ref() {
            Some((_, outcome)) => outcome.clone(),
            None => Err(ConvergeError::Dispatch("convergence driver stopped".into())),
        }
    }

    /// Request convergence without waiting for it.
    pub async fn trigger(&self, shard_id: &str) {
        match self.inner.mode {
            TriggerMode::Spawn => {
                let this = self.clone();
                let shard = shard_id.to_string();
                tokio::spawn(async move {
                    if let Err(e) = this.converge(&shard).await {
                        error!(shard_id = %shard, error = %e, "triggered convergence failed");
                    }
                });
            }
            TriggerMode::Deferred => {
                self.inner.dirty.lock().await.insert(shard_id.to_string());
                debug!(%shard_id, "shard marked dirty");
            }
        }
    }

    /// Shards awaiting a deferred convergence.
    pub async fn pending(&self) -> Vec<String> {
        self.inner.dirty.lock().await.iter().cloned().collect()
    }

    /// Converge every dirty shard, in id order.
    pub async fn flush(&self) -> Vec<(String, ConvergeResult<ConvergeReport>)> {
        let shards = std::mem::take(&mut *self.inner.dirty.lock().await);
        let mut results = Vec::with_capacity(shards.len());
        for shard in shards {
            let outcome = self.converge(&shard).await;
            results.push((shard, outcome));
        }
        results
    }

    async fn drive(&self, shard_id: String) {
        loop {
            let generation = {
                let flights = self.inner.flights.lock().await;
                match flights.get(&shard_id) {
                    Some(f) => f.requested,
                    None => return,
                }
            };

            let outcome = self.run_once(&shard_id, generation).await;

            let mut flights = self.inner.flights.lock().await;
            let Some(flight) = flights.get_mut(&shard_id) else {
                return;
            };
            flight.outcome.send_replace(Some((generation, outcome)));
            if flight.requested == generation {
                flight.running = false;
                return;
            }
        }
    }

    async fn run_once(&self, shard_id: &str, generation: u64) -> ConvergeResult<ConvergeReport> {
        let ledger = &self.inner.ledger;
        let doc = compute_desired_state(ledger, shard_id)?;
        ledger.set_shard_status(shard_id, ShardStatus::Converging, None)?;

        if doc.nodes.is_empty() {
            ledger.set_shard_status(
                shard_id,
                ShardStatus::Failed,
                Some("shard has no nodes".into()),
            )?;
            warn!(%shard_id, "convergence failed: no nodes");
            return Err(ConvergeError::NoNodes(shard_id.to_string()));
        }

        let key = WorkflowKey::new("converge", "shard", shard_id);
        let node_ids = doc.node_ids();
        let input = json!({
            "shard_id": shard_id,
            "fingerprint": doc.fingerprint,
            "nodes": node_ids,
            "document": doc,
        });
        info!(
            %shard_id,
            generation,
            fingerprint = %doc.fingerprint,
            resources = doc.resources.len(),
            nodes = node_ids.len(),
            "dispatching desired state"
        );

        let mut joined = self.dispatch(shard_id, &key, &input).await?;
        if joined {
            // An earlier document is still out under this key; let it finish first.
            debug!(%shard_id, generation, "previous dispatch still running");
            let _ = self
                .inner
                .executor
                .await_completion(&key, self.inner.config.ack_timeout)
                .await;
            joined = self.dispatch(shard_id, &key, &input).await?;
        }

        let (acknowledged, dispatch_error) = match self
            .inner
            .executor
            .await_completion(&key, self.inner.config.ack_timeout)
            .await
        {
            Ok(WorkflowStatus::Completed { output })
                if output.get("fingerprint").and_then(|v| v.as_str())
                    != Some(doc.fingerprint.as_str()) =>
            {
                warn!(%shard_id, generation, joined, "acknowledgement is for a superseded document");
                (Vec::new(), Some("acknowledged a superseded document".to_string()))
            }
            Ok(WorkflowStatus::Completed { output }) => {
                let acked: BTreeSet<String> = output
                    .get("acknowledged")
                    .and_then(|v| v.as_array())
                    .map(|ids| {
                        ids.iter()
                            .filter_map(|v| v.as_str().map(str::to_string))
                            .collect()
                    })
                    .unwrap_or_default();
                let acked: Vec<String> =
                    node_ids.iter().filter(|id| acked.contains(*id)).cloned().collect();
                (acked, None)
            }
            Ok(WorkflowStatus::Failed { error }) => (Vec::new(), Some(error)),
            Ok(WorkflowStatus::Running) => (Vec::new(), Some("still running".to_string())),
            Err(e) => (Vec::new(), Some(e.to_string())),
        };
        let unacknowledged: Vec<String> = node_ids
            .iter()
            .filter(|id| !acknowledged.contains(*id))
            .cloned()
            .collect();

        let mut promoted = Vec::new();
        if !acknowledged.is_empty() {
            for entry in doc.provisioning() {
                let outcome = ledger.compare_and_swap(
                    entry.kind,
                    &entry.id,
                    &[ResourceStatus::Provisioning],
                    |r| {
                        if r.is_migrating() {
                            return Err("migration in flight".into());
                        }
                        r.status = ResourceStatus::Active;
                        r.status_message = None;
                        Ok(())
                    },
                )?;
                if let Some(current) = outcome.into_current() {
                    info!(resource = %current.reference(), %shard_id, "resource promoted to active");
                    promoted.push(current.reference());
                }
            }
        }

        if unacknowledged.is_empty() {
            ledger.set_shard_status(shard_id, ShardStatus::Active, None)?;
            info!(%shard_id, generation, promoted = promoted.len(), "shard converged");
        } else {
            let mut message = format!("nodes did not acknowledge: {}", unacknowledged.join(", "));
            if let Some(err) = &dispatch_error {
                message.push_str(&format!(" ({err})"));
            }
            warn!(%shard_id, generation, %message, "shard convergence incomplete");
            ledger.set_shard_status(
                shard_id,
                ShardStatus::Failed,
                Some(truncate_message(&message)),
            )?;
        }

        Ok(ConvergeReport {
            shard_id: shard_id.to_string(),
            generation,
            fingerprint: doc.fingerprint,
            acknowledged,
            unacknowledged,
            promoted,
        })
    }

    /// Hand `input` to the executor. Returns whether it was folded into an
    /// execution that was already running.
    async fn dispatch(&self, shard_id: &str, key: &WorkflowKey, input: &Value) -> ConvergeResult<bool> {
        match self.inner.executor.start_or_signal(key, input.clone()).await {
            Ok(execution) => Ok(execution.joined),
            Err(e) => {
                let message = truncate_message(&e.to_string());
                self.inner
                    .ledger
                    .set_shard_status(shard_id, ShardStatus::Failed, Some(message))?;
                Err(ConvergeError::Dispatch(e.to_string()))
            }
        }
    }
}
