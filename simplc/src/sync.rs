//! Bidirectional propagation between canonical values and the protocol stores.
//!
//! Every change to a variable happens inside its exclusive scope:
//!
//! 1. coerce the new value to the canonical type, round it to the precision of
//!    its stores, and short-circuit if unchanged,
//! 2. encode it for every store other than the one it came from,
//! 3. commit it as the canonical value,
//! 4. write it to those stores.
//!
//! Steps 1 and 2 fail without touching the canonical value. Failures in step 4
//! are reported as [`Error::Propagation`] but the committed value stays:
//! canonical state is authoritative and the stores catch up on the next change.

use std::sync::Arc;

use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::codec;
use crate::error::{Error, Result, Store};
use crate::modbus::RegisterWrite;
use crate::opcua::{self, NodeWrite, Variant};
use crate::registry::VariableRegistry;
use crate::value::Value;
use crate::variable::{Origin, VariableModel};

/// Result of a write that reached the canonical value.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteOutcome {
    /// The value was already current; no store was touched.
    Unchanged,
    Propagated,
}

pub struct SyncEngine {
    registry: VariableRegistry,
}

impl SyncEngine {
    pub fn new(registry: VariableRegistry) -> Arc<Self> {
        Arc::new(Self { registry })
    }

    pub fn registry(&self) -> &VariableRegistry {
        &self.registry
    }

    /// Canonical-origin write.
    ///
    /// Callers queue for the variable's scope in arrival order. Once the scope is
    /// held the write runs to completion on its own task, so abandoning the
    /// returned future after that point does not leave it half-applied.
    pub async fn write(
        self: &Arc<Self>,
        qualified_name: &str,
        value: Value,
    ) -> Result<WriteOutcome> {
        let variable = self.registry.lookup(qualified_name)?.clone();
        let scope = variable.acquire().await;
        let engine = Arc::clone(self);
        tokio::spawn(async move {
            let _scope = scope;
            engine.apply(&variable, value, Origin::Canonical).await
        })
        .await
        .map_err(|err| Error::Task(err.to_string()))?
    }

    /// Handle a write made by an external Modbus master.
    ///
    /// Returns how many variables changed.
    pub async fn on_modbus_write(&self, event: RegisterWrite) -> usize {
        let variables = self
            .registry
            .by_modbus_range(event.slave, event.kind, event.address, event.count);
        if variables.is_empty() {
            debug!(?event, "write to untracked registers");
        }
        let mut changed = 0;
        for variable in variables {
            let _scope = variable.acquire().await;
            match self.pull_modbus(&variable).await {
                Ok(value) => {
                    if self.apply_external(&variable, value, Origin::Modbus).await {
                        changed += 1;
                    }
                }
                Err(err) => warn!(
                    variable = variable.qualified_name(),
                    error = %err,
                    "dropping Modbus update"
                ),
            }
        }
        changed
    }

    /// Handle a write made by an external OPC UA client.
    ///
    /// Returns whether the variable changed.
    pub async fn on_opcua_write(&self, event: NodeWrite) -> bool {
        let Some(variable) = self.registry.by_node(&event.node).cloned() else {
            debug!(node = %event.node, "write to untracked node");
            return false;
        };
        let _scope = variable.acquire().await;
        match opcua::pull(self.registry.space().as_ref(), &variable).await {
            Ok(value) => self.apply_external(&variable, value, Origin::Opcua).await,
            Err(err) => {
                warn!(
                    variable = variable.qualified_name(),
                    error = %err,
                    "dropping OPC UA update"
                );
                false
            }
        }
    }

    /// Feed protocol-origin writes from both stores into the engine until the
    /// stores drop their notification channels.
    pub fn spawn_listeners(self: &Arc<Self>) -> Vec<JoinHandle<()>> {
        let mut register_writes = self.registry.bank().subscribe();
        let mut node_writes = self.registry.space().subscribe();
        let modbus = {
            let engine = Arc::clone(self);
            tokio::spawn(async move {
                while let Some(event) = register_writes.recv().await {
                    engine.on_modbus_write(event).await;
                }
            })
        };
        let opcua = {
            let engine = Arc::clone(self);
            tokio::spawn(async move {
                while let Some(event) = node_writes.recv().await {
                    engine.on_opcua_write(event).await;
                }
            })
        };
        vec![modbus, opcua]
    }

    async fn pull_modbus(&self, variable: &VariableModel) -> Result<Value> {
        let binding = variable.modbus().ok_or_else(|| {
            Error::Binding(format!("`{}` has no Modbus binding", variable.qualified_name()))
        })?;
        let words = self
            .registry
            .bank()
            .read(binding.slave, binding.kind, binding.address, binding.quantity())
            .await?;
        codec::decode(
            &words,
            variable.value_type(),
            binding.width(),
            self.registry.layout(),
        )
    }

    async fn apply_external(&self, variable: &VariableModel, value: Value, origin: Origin) -> bool {
        match self.apply(variable, value, origin).await {
            Ok(WriteOutcome::Unchanged) => false,
            Ok(WriteOutcome::Propagated) => true,
            // Already logged; the canonical value did change.
            Err(Error::Propagation { .. }) => true,
            Err(err) => {
                warn!(
                    variable = variable.qualified_name(),
                    %origin,
                    error = %err,
                    "dropping update"
                );
                false
            }
        }
    }

    /// Change `variable` to `value`. The caller holds the variable's scope.
    async fn apply(
        &self,
        variable: &VariableModel,
        value: Value,
        origin: Origin,
    ) -> Result<WriteOutcome> {
        let name = variable.qualified_name();
        let value = variable.narrow(value.coerce(variable.value_type())?)?;
        if value.is_same(&variable.value()) {
            debug!(variable = name, %value, %origin, "unchanged");
            return Ok(WriteOutcome::Unchanged);
        }

        let modbus = match variable.modbus() {
            Some(binding) if origin != Origin::Modbus => {
                let words = codec::encode(
                    value,
                    variable.value_type(),
                    binding.width(),
                    self.registry.layout(),
                )?;
                Some((binding, words))
            }
            _ => None,
        };
        let push_opcua = match variable.opcua() {
            Some(binding) if origin != Origin::Opcua => {
                Variant::from_value(value, binding.variant_type)?;
                true
            }
            _ => false,
        };

        let record = variable.commit(value, origin);
        match origin {
            Origin::Canonical => debug!(variable = name, %value, "committed"),
            _ => info!(
                variable = name,
                %value,
                "updated by external {origin} source"
            ),
        }

        let mut failures = Vec::new();
        if let Some((binding, words)) = modbus {
            if let Err(err) = self
                .registry
                .bank()
                .write(binding.slave, binding.kind, binding.address, &words)
                .await
            {
                failures.push(Error::propagation(name, Store::Modbus, err));
            }
        }
        if push_opcua {
            let pushed = opcua::push(self.registry.space().as_ref(), variable, record.origin).await;
            if let Err(err) = pushed {
                failures.push(Error::propagation(name, Store::Opcua, err));
            }
        }
        variable.settle();

        for failure in &failures {
            warn!(variable = name, error = %failure, "stores out of sync until the next change");
        }
        match failures.into_iter().next() {
            Some(failure) => Err(failure),
            None => Ok(WriteOutcome::Propagated),
        }
    }
}
