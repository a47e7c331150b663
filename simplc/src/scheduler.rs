//! Cooperative tasks driving simulation logic through [`VariableApi`].
//!
//! A task yields only at its activation point and inside API calls. Cancelling
//! a task never leaves a variable half-written: once a write holds the
//! variable's scope it completes on its own.

use std::collections::HashMap;
use std::future::Future;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, warn};

use crate::api::VariableApi;
use crate::error::Result;

/// When a task runs its step.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Activation {
    /// Once per period. Late ticks are delayed, not bunched up.
    Every(Duration),
    /// Re-arm as soon as the previous step finished.
    Continuous,
}

pub struct Scheduler {
    api: VariableApi,
    tasks: Mutex<HashMap<String, JoinHandle<()>>>,
}

impl Scheduler {
    pub fn new(api: VariableApi) -> Self {
        Self {
            api,
            tasks: Mutex::new(HashMap::new()),
        }
    }

    /// Start `step` under `label`, replacing a task already running under it.
    ///
    /// A failing step is logged and the task keeps going.
    pub fn spawn<F, Fut>(&self, label: impl Into<String>, activation: Activation, mut step: F)
    where
        F: FnMut(VariableApi) -> Fut + Send + 'static,
        Fut: Future<Output = Result<()>> + Send + 'static,
    {
        let label = label.into();
        let api = self.api.clone();
        let task_label = label.clone();
        let handle = tokio::spawn(async move {
            let mut interval = match activation {
                Activation::Every(period) => {
                    let mut interval = tokio::time::interval(period);
                    interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
                    Some(interval)
                }
                Activation::Continuous => None,
            };
            loop {
                match interval.as_mut() {
                    Some(interval) => {
                        interval.tick().await;
                    }
                    None => tokio::task::yield_now().await,
                }
                if let Err(err) = step(api.clone()).await {
                    warn!(task = %task_label, error = %err, "step failed");
                }
            }
        });
        debug!(task = %label, ?activation, "task scheduled");
        if let Some(previous) = self.tasks.lock().insert(label, handle) {
            previous.abort();
        }
    }

    /// Remove a task. Returns `false` if no task runs under `label`.
    pub fn cancel(&self, label: &str) -> bool {
        match self.tasks.lock().remove(label) {
            Some(handle) => {
                handle.abort();
                debug!(task = label, "task cancelled");
                true
            }
            None => false,
        }
    }

    pub fn labels(&self) -> Vec<String> {
        let mut labels: Vec<String> = self.tasks.lock().keys().cloned().collect();
        labels.sort();
        labels
    }

    /// Cancel every task and wait until all of them stopped.
    pub async fn shutdown(&self) {
        let tasks: Vec<_> = self.tasks.lock().drain().collect();
        for (_, handle) in &tasks {
            handle.abort();
        }
        for (label, handle) in tasks {
            if let Err(err) = handle.await {
                if !err.is_cancelled() {
                    warn!(task = %label, error = %err, "task ended abnormally");
                }
            }
        }
    }
}

impl Drop for Scheduler {
    fn drop(&mut self) {
        for handle in self.tasks.get_mut().values() {
            handle.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    use super::*;
    use crate::codec::WordLayout;
    use crate::error::Error;
    use crate::modbus::DataStore;
    use crate::opcua::MemoryAddressSpace;
    use crate::registry::{VariableRegistry, VariableSpec};
    use crate::sync::SyncEngine;
    use crate::value::Value;

    async fn scheduler() -> Scheduler {
        let mut registry = VariableRegistry::new(
            Arc::new(DataStore::new()),
            Arc::new(MemoryAddressSpace::new()),
            WordLayout::default(),
        );
        registry
            .register(VariableSpec::new("Ticks", 0i64))
            .await
            .unwrap();
        Scheduler::new(VariableApi::new(SyncEngine::new(registry)))
    }

    async fn increment(api: VariableApi) -> Result<()> {
        let ticks = api.read_variable("Ticks").await?;
        let next = ticks.as_int().unwrap_or_default() + 1;
        api.write_variable("Ticks", next).await?;
        Ok(())
    }

    async fn idle(_api: VariableApi) -> Result<()> {
        Ok(())
    }

    #[tokio::test(start_paused = true)]
    async fn periodic_task_runs_once_per_period() {
        let scheduler = scheduler().await;
        let api = scheduler.api.clone();
        scheduler.spawn("counter", Activation::Every(Duration::from_secs(1)), increment);
        // The first tick fires immediately.
        tokio::time::sleep(Duration::from_millis(3500)).await;
        assert_eq!(api.read_variable("Ticks").await.unwrap(), Value::Int(4));
        scheduler.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn cancelled_task_stops() {
        let scheduler = scheduler().await;
        let api = scheduler.api.clone();
        scheduler.spawn("counter", Activation::Every(Duration::from_secs(1)), increment);
        assert_eq!(scheduler.labels(), ["counter"]);
        tokio::time::sleep(Duration::from_millis(1500)).await;
        assert!(scheduler.cancel("counter"));
        assert!(!scheduler.cancel("counter"));
        let stopped_at = api.read_variable("Ticks").await.unwrap();
        tokio::time::sleep(Duration::from_secs(5)).await;
        assert_eq!(api.read_variable("Ticks").await.unwrap(), stopped_at);
        assert!(scheduler.labels().is_empty());
    }

    #[tokio::test]
    async fn continuous_task_rearms_and_survives_errors() {
        let scheduler = scheduler().await;
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = calls.clone();
        scheduler.spawn("flaky", Activation::Continuous, move |api: VariableApi| {
            let counter = counter.clone();
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
                api.write_variable("Missing", true).await.map(|_| ())
            }
        });
        tokio::time::timeout(Duration::from_secs(1), async {
            while calls.load(Ordering::SeqCst) < 10 {
                tokio::task::yield_now().await;
            }
        })
        .await
        .unwrap();
        scheduler.shutdown().await;
        assert!(scheduler.labels().is_empty());
        assert!(matches!(
            scheduler.api.read_variable("Missing").await,
            Err(Error::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn respawning_a_label_replaces_the_task() {
        let scheduler = scheduler().await;
        scheduler.spawn("a", Activation::Continuous, idle);
        scheduler.spawn("a", Activation::Every(Duration::from_secs(60)), idle);
        scheduler.spawn("b", Activation::Continuous, idle);
        assert_eq!(scheduler.labels(), ["a", "b"]);
        scheduler.shutdown().await;
    }
}
