//! In-process workflow backend.
//!
//! `MemoryExecutor` runs each accepted execution inline through a pluggable
//! runner, so callers observe a terminal status as soon as `start_or_signal`
//! returns. Tests can hold executions open by key prefix and resolve them by
//! hand, inject failures, or make the engine refuse new work.
//!
//! Finished executions are kept for status queries until more than
//! `run_retention` executions are tracked; the oldest finished ones are
//! then dropped. Running executions are never dropped.

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{Value, json};
use tokio::sync::{Mutex, watch};
use tracing::{debug, info, warn};

use crate::{Execution, ExecutorError, ExecutorResult, WorkflowExecutor, WorkflowKey, WorkflowStatus};

/// Performs the remote work of one execution.
pub type Runner = Arc<
    dyn Fn(WorkflowKey, Value) -> Pin<Box<dyn Future<Output = Result<Value, String>> + Send>>
        + Send
        + Sync,
>;

/// Record of one accepted (non-joined) execution.
#[derive(Debug, Clone, PartialEq)]
pub struct StartedRun {
    pub key: WorkflowKey,
    pub run_id: String,
    pub input: Value,
}

struct RunState {
    run_id: String,
    status: watch::Sender<WorkflowStatus>,
    signals: u32,
}

/// Tracked executions and history entries kept by default.
pub const DEFAULT_RUN_RETENTION: usize = 10_000;

#[derive(Default)]
struct Inner {
    runs: HashMap<WorkflowKey, RunState>,
    /// Keys of tracked runs, oldest start first.
    order: VecDeque<WorkflowKey>,
    history: Vec<StartedRun>,
    held: Vec<String>,
    failures: BTreeMap<String, String>,
    unavailable: Option<String>,
}

/// Acknowledge every node listed in a convergence input along with the
/// fingerprint it carried; echo nothing else.
fn default_runner() -> Runner {
    Arc::new(|_key, input| {
        Box::pin(async move {
            match input.get("nodes") {
                Some(nodes) => Ok(json!({
                    "acknowledged": nodes,
                    "fingerprint": input.get("fingerprint").cloned().unwrap_or(Value::Null),
                })),
                None => Ok(json!({})),
            }
        })
    })
}

/// Drop the oldest finished runs while more than `limit` are tracked, and
/// trim history to the latest `limit` starts.
fn prune(inner: &mut Inner, limit: usize) {
    if inner.history.len() > limit {
        let excess = inner.history.len() - limit;
        inner.history.drain(..excess);
    }
    let mut excess = inner.runs.len().saturating_sub(limit);
    if excess == 0 {
        return;
    }
    for key in std::mem::take(&mut inner.order) {
        let finished = inner
            .runs
            .get(&key)
            .is_some_and(|run| !run.status.borrow().is_running());
        if excess > 0 && finished {
            inner.runs.remove(&key);
            excess -= 1;
            debug!(%key, "dropped finished run");
            continue;
        }
        inner.order.push_back(key);
    }
}

/// In-memory workflow executor.
#[derive(Clone)]
pub struct MemoryExecutor {
    inner: Arc<Mutex<Inner>>,
    runner: Runner,
    retention: usize,
}

impl Default for MemoryExecutor {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryExecutor {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Mutex::new(Inner::default())),
            runner: default_runner(),
            retention: DEFAULT_RUN_RETENTION,
        }
    }

    /// Bound the number of tracked executions and history entries.
    pub fn with_run_retention(mut self, limit: usize) -> Self {
        self.retention = limit.max(1);
        self
    }

    /// Replace the runner that performs each execution.
    pub fn with_runner(mut self, runner: Runner) -> Self {
        self.runner = runner;
        self
    }

    /// Keep executions whose key starts with `prefix` running until
    /// [`MemoryExecutor::resolve`] is called.
    pub async fn hold(&self, prefix: &str) {
        self.inner.lock().await.held.push(prefix.to_string());
    }

    pub async fn release_holds(&self) {
        self.inner.lock().await.held.clear();
    }

    /// Fail every execution whose key starts with `prefix`.
    pub async fn fail_matching(&self, prefix: &str, error: &str) {
        self.inner
            .lock()
            .await
            .failures
            .insert(prefix.to_string(), error.to_string());
    }

    pub async fn clear_failures(&self) {
        self.inner.lock().await.failures.clear();
    }

    /// Refuse (`Some(reason)`) or accept (`None`) new start requests.
    pub async fn set_unavailable(&self, reason: Option<&str>) {
        self.inner.lock().await.unavailable = reason.map(str::to_string);
    }

    /// Complete a held execution. Returns false if nothing is running under `key`.
    pub async fn resolve(&self, key: &WorkflowKey, outcome: Result<Value, String>) -> bool {
        let inner = self.inner.lock().await;
        let Some(run) = inner.runs.get(key) else {
            return false;
        };
        if !run.status.borrow().is_running() {
            return false;
        }
        let status = match outcome {
            Ok(output) => WorkflowStatus::Completed { output },
            Err(error) => WorkflowStatus::Failed { error },
        };
        run.status.send_replace(status);
        true
    }

    /// Accepted executions in start order, the latest `run_retention` of them.
    pub async fn history(&self) -> Vec<StartedRun> {
        self.inner.lock().await.history.clone()
    }

    /// Number of executions started (not joined) whose key starts with `prefix`.
    pub async fn started_count(&self, prefix: &str) -> usize {
        self.inner
            .lock()
            .await
            .history
            .iter()
            .filter(|r| r.key.as_str().starts_with(prefix))
            .count()
    }

    /// Number of executions currently running.
    pub async fn running_count(&self) -> usize {
        self.inner
            .lock()
            .await
            .runs
            .values()
            .filter(|r| r.status.borrow().is_running())
            .count()
    }

    /// How many start requests were folded into the running execution.
    pub async fn signal_count(&self, key: &WorkflowKey) -> u32 {
        self.inner
            .lock()
            .await
            .runs
            .get(key)
            .map(|r| r.signals)
            .unwrap_or(0)
    }

    /// The input the latest execution under `key` was started with.
    pub async fn last_input(&self, key: &WorkflowKey) -> Option<Value> {
        self.inner
            .lock()
            .await
            .history
            .iter()
            .rev()
            .find(|r| &r.key == key)
            .map(|r| r.input.clone())
    }

    async fn finish(&self, key: &WorkflowKey, run_id: &str, outcome: Result<Value, String>) {
        let inner = self.inner.lock().await;
        if let Some(run) = inner.runs.get(key)
            && run.run_id == run_id
        {
            let status = match outcome {
                Ok(output) => WorkflowStatus::Completed { output },
                Err(error) => {
                    warn!(%key, %error, "workflow execution failed");
                    WorkflowStatus::Failed { error }
                }
            };
            run.status.send_replace(status);
        }
    }
}

#[async_trait]
impl WorkflowExecutor for MemoryExecutor {
    async fn start_or_signal(&self, key: &WorkflowKey, input: Value) -> ExecutorResult<Execution> {
        let (run_id, held, injected) = {
            let mut inner = self.inner.lock().await;
            if let Some(reason) = &inner.unavailable {
                return Err(ExecutorError::Unavailable(reason.clone()));
            }
            if let Some(run) = inner.runs.get_mut(key) {
                let running = run.status.borrow().is_running();
                if running {
                    run.signals += 1;
                    debug!(%key, run_id = %run.run_id, "signalled running execution");
                    return Ok(Execution {
                        key: key.clone(),
                        run_id: run.run_id.clone(),
                        joined: true,
                    });
                }
            }

            let run_id = uuid::Uuid::new_v4().to_string();
            let (status, _) = watch::channel(WorkflowStatus::Running);
            inner.runs.insert(
                key.clone(),
                RunState {
                    run_id: run_id.clone(),
                    status,
                    signals: 0,
                },
            );
            inner.order.retain(|k| k != key);
            inner.order.push_back(key.clone());
            inner.history.push(StartedRun {
                key: key.clone(),
                run_id: run_id.clone(),
                input: input.clone(),
            });
            prune(&mut inner, self.retention);
            let held = inner.held.iter().any(|p| key.as_str().starts_with(p.as_str()));
            let injected = inner
                .failures
                .iter()
                .find(|(prefix, _)| key.as_str().starts_with(prefix.as_str()))
                .map(|(_, error)| error.clone());
            (run_id, held, injected)
        };

        info!(%key, %run_id, "workflow execution started");
        if !held {
            let outcome = match injected {
                Some(error) => Err(error),
                None => (self.runner)(key.clone(), input).await,
            };
            self.finish(key, &run_id, outcome).await;
        }

        Ok(Execution {
            key: key.clone(),
            run_id,
            joined: false,
        })
    }

    async fn await_completion(
        &self,
        key: &WorkflowKey,
        timeout: Duration,
    ) -> ExecutorResult<WorkflowStatus> {
        let mut rx = {
            let inner = self.inner.lock().await;
            let run = inner
                .runs
                .get(key)
                .ok_or_else(|| ExecutorError::NotFound(key.clone()))?;
            run.status.subscribe()
        };
        let waited = tokio::time::timeout(timeout, async {
            rx.wait_for(|s| !s.is_running()).await.ok().map(|s| s.clone())
        })
        .await;
        match waited {
            Ok(Some(status)) => Ok(status),
            // Sender dropped: a newer run replaced the one we watched.
            Ok(None) => self
                .get_status(key)
                .await?
                .ok_or_else(|| ExecutorError::NotFound(key.clone())),
            Err(_) => Err(ExecutorError::Timeout {
                key: key.clone(),
                waited: timeout,
            }),
        }
    }

    async fn get_status(&self, key: &WorkflowKey) -> ExecutorResult<Option<WorkflowStatus>> {
        let inner = self.inner.lock().await;
        Ok(inner.runs.get(key).map(|r| r.status.borrow().clone()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key(s: &str) -> WorkflowKey {
        WorkflowKey::from(s)
    }

    #[tokio::test]
    async fn default_runner_acknowledges_listed_nodes() {
        let exec = MemoryExecutor::new();
        let k = key("converge-shard-web-1");
        exec.start_or_signal(&k, json!({"nodes": ["n1", "n2"], "fingerprint": "abc"}))
            .await
            .unwrap();
        let status = exec.get_status(&k).await.unwrap().unwrap();
        assert_eq!(
            status,
            WorkflowStatus::Completed {
                output: json!({"acknowledged": ["n1", "n2"], "fingerprint": "abc"})
            }
        );
    }

    #[tokio::test]
    async fn duplicate_start_joins_running_execution() {
        let exec = MemoryExecutor::new();
        exec.hold("provision-").await;
        let k = key("provision-tenant-acme");
        let first = exec.start_or_signal(&k, json!({})).await.unwrap();
        let second = exec.start_or_signal(&k, json!({})).await.unwrap();
        assert!(!first.joined);
        assert!(second.joined);
        assert_eq!(first.run_id, second.run_id);
        assert_eq!(exec.started_count("provision-tenant-acme").await, 1);
        assert_eq!(exec.signal_count(&k).await, 1);
        assert_eq!(exec.running_count().await, 1);
    }

    #[tokio::test]
    async fn terminal_execution_is_replaced_by_a_new_run() {
        let exec = MemoryExecutor::new();
        let k = key("provision-tenant-acme");
        let first = exec.start_or_signal(&k, json!({})).await.unwrap();
        let second = exec.start_or_signal(&k, json!({})).await.unwrap();
        assert_ne!(first.run_id, second.run_id);
        assert!(!second.joined);
        assert_eq!(exec.started_count("provision-").await, 2);
    }

    #[tokio::test]
    async fn await_completion_sees_resolution() {
        let exec = MemoryExecutor::new();
        exec.hold("migrate_copy-").await;
        let k = key("migrate_copy-tenant-acme");
        exec.start_or_signal(&k, json!({})).await.unwrap();

        let waiter = {
            let exec = exec.clone();
            let k = k.clone();
            tokio::spawn(async move { exec.await_completion(&k, Duration::from_secs(5)).await })
        };
        tokio::task::yield_now().await;
        assert!(exec.resolve(&k, Err("rsync exited 23".into())).await);
        let status = waiter.await.unwrap().unwrap();
        assert_eq!(
            status,
            WorkflowStatus::Failed {
                error: "rsync exited 23".into()
            }
        );
    }

    #[tokio::test]
    async fn await_completion_times_out() {
        let exec = MemoryExecutor::new();
        exec.hold("").await;
        let k = key("provision-zone-example");
        exec.start_or_signal(&k, json!({})).await.unwrap();
        let err = exec
            .await_completion(&k, Duration::from_millis(20))
            .await
            .unwrap_err();
        assert!(matches!(err, ExecutorError::Timeout { .. }));
        assert!(matches!(
            exec.await_completion(&key("nope"), Duration::from_millis(1)).await,
            Err(ExecutorError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn injected_failure_and_unavailability() {
        let exec = MemoryExecutor::new();
        exec.fail_matching("deprovision-", "host unreachable").await;
        let k = key("deprovision-webroot-site");
        exec.start_or_signal(&k, json!({})).await.unwrap();
        assert_eq!(
            exec.get_status(&k).await.unwrap(),
            Some(WorkflowStatus::Failed {
                error: "host unreachable".into()
            })
        );

        exec.set_unavailable(Some("engine down")).await;
        let err = exec
            .start_or_signal(&key("provision-tenant-x"), json!({}))
            .await
            .unwrap_err();
        assert_eq!(err, ExecutorError::Unavailable("engine down".into()));
        assert_eq!(exec.started_count("provision-").await, 0);
    }

    #[tokio::test]
    async fn custom_runner_receives_input() {
        let exec = MemoryExecutor::new().with_runner(Arc::new(|key, input| {
            Box::pin(async move { Ok(json!({"key": key.as_str(), "echo": input})) })
        }));
        let k = key("update-database-shop");
        exec.start_or_signal(&k, json!({"x": 1})).await.unwrap();
        assert_eq!(exec.last_input(&k).await, Some(json!({"x": 1})));
        match exec.get_status(&k).await.unwrap() {
            Some(WorkflowStatus::Completed { output }) => {
                assert_eq!(output["echo"]["x"], 1);
                assert_eq!(output["key"], "update-database-shop");
            }
            other => panic!("unexpected status {other:?}"),
        }
    }

    #[tokio::test]
    async fn finished_runs_are_dropped_beyond_retention() {
        let exec = MemoryExecutor::new().with_run_retention(2);
        exec.hold("held-").await;
        let held = key("held-tenant-acme");
        exec.start_or_signal(&held, json!({})).await.unwrap();
        for k in ["provision-tenant-a", "provision-tenant-b", "provision-tenant-c"] {
            exec.start_or_signal(&key(k), json!({})).await.unwrap();
        }

        assert_eq!(exec.get_status(&key("provision-tenant-a")).await.unwrap(), None);
        assert_eq!(exec.get_status(&key("provision-tenant-b")).await.unwrap(), None);
        assert!(exec.get_status(&key("provision-tenant-c")).await.unwrap().is_some());
        assert_eq!(
            exec.get_status(&held).await.unwrap(),
            Some(WorkflowStatus::Running)
        );
        assert_eq!(exec.history().await.len(), 2);

        assert!(exec.resolve(&held, Ok(json!({}))).await);
        exec.start_or_signal(&key("provision-tenant-d"), json!({})).await.unwrap();
        assert_eq!(exec.get_status(&held).await.unwrap(), None);
        assert!(exec.get_status(&key("provision-tenant-d")).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn restarted_key_keeps_its_latest_run() {
        let exec = MemoryExecutor::new().with_run_retention(1);
        let k = key("converge-shard-web-1");
        for _ in 0..3 {
            exec.start_or_signal(&k, json!({"nodes": ["n1"]})).await.unwrap();
        }
        assert!(exec.get_status(&k).await.unwrap().is_some());
        assert_eq!(exec.started_count("converge-").await, 1);
    }
}
