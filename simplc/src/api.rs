//! Name-based access to variables for simulation logic and the REST surface.

use std::sync::Arc;

use serde::Serialize;

use crate::error::Result;
use crate::registry::VariableRegistry;
use crate::sync::{SyncEngine, WriteOutcome};
use crate::value::{Value, ValueType};
use crate::variable::VariableModel;

/// Public view of a variable.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct VariableView {
    pub qualified_name: String,
    #[serde(rename = "type")]
    pub value_type: ValueType,
    pub value: Value,
}

impl From<&VariableModel> for VariableView {
    fn from(variable: &VariableModel) -> Self {
        Self {
            qualified_name: variable.qualified_name().to_owned(),
            value_type: variable.value_type(),
            value: variable.value(),
        }
    }
}

/// Cheap to clone; every clone talks to the same engine.
///
/// Reads are served from canonical state and never wait. Writes to one variable
/// are serialized in arrival order, writes to different variables run in parallel.
#[derive(Clone)]
pub struct VariableApi {
    engine: Arc<SyncEngine>,
}

impl VariableApi {
    pub fn new(engine: Arc<SyncEngine>) -> Self {
        Self { engine }
    }

    pub fn engine(&self) -> &Arc<SyncEngine> {
        &self.engine
    }

    pub fn registry(&self) -> &VariableRegistry {
        self.engine.registry()
    }

    pub async fn read_variable(&self, qualified_name: &str) -> Result<Value> {
        Ok(self.registry().lookup(qualified_name)?.value())
    }

    /// Returns [`Error::Propagation`](crate::Error::Propagation) if a store
    /// rejected the value; the canonical value is committed regardless.
    pub async fn write_variable(
        &self,
        qualified_name: &str,
        value: impl Into<Value>,
    ) -> Result<WriteOutcome> {
        self.engine.write(qualified_name, value.into()).await
    }

    pub fn list_variables(&self) -> Vec<VariableView> {
        self.registry()
            .all_variables()
            .iter()
            .map(|variable| VariableView::from(variable.as_ref()))
            .collect()
    }

    pub fn get_variable(&self, qualified_name: &str) -> Result<VariableView> {
        self.registry()
            .lookup(qualified_name)
            .map(|variable| VariableView::from(variable.as_ref()))
    }

    /// Write and return the variable as it stands afterwards.
    pub async fn set_variable(&self, qualified_name: &str, value: Value) -> Result<VariableView> {
        self.write_variable(qualified_name, value).await?;
        self.get_variable(qualified_name)
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::codec::WordLayout;
    use crate::error::Error;
    use crate::modbus::DataStore;
    use crate::opcua::MemoryAddressSpace;
    use crate::registry::VariableSpec;

    async fn api() -> VariableApi {
        let mut registry = VariableRegistry::new(
            Arc::new(DataStore::new()),
            Arc::new(MemoryAddressSpace::new()),
            WordLayout::default(),
        );
        registry
            .register(VariableSpec::new("Counter", 0i64).with_opcua(1, "Counter"))
            .await
            .unwrap();
        registry
            .register(VariableSpec::new("Temperature", 20.0).with_opcua(1, "Temperature"))
            .await
            .unwrap();
        VariableApi::new(SyncEngine::new(registry))
    }

    #[tokio::test]
    async fn read_after_write() {
        let api = api().await;
        assert_eq!(api.read_variable("Counter").await.unwrap(), Value::Int(0));
        api.write_variable("Counter", 5i64).await.unwrap();
        assert_eq!(api.read_variable("Counter").await.unwrap(), Value::Int(5));
        // Int widens into a float variable.
        api.write_variable("Temperature", 21i64).await.unwrap();
        assert_eq!(api.read_variable("Temperature").await.unwrap(), Value::Float(21.0));
    }

    #[tokio::test]
    async fn unknown_names() {
        let api = api().await;
        assert!(matches!(api.read_variable("x").await, Err(Error::NotFound(_))));
        assert!(matches!(api.get_variable("x"), Err(Error::NotFound(_))));
        assert!(matches!(
            api.write_variable("x", true).await,
            Err(Error::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn list_in_registration_order() {
        let api = api().await;
        let names: Vec<_> = api
            .list_variables()
            .into_iter()
            .map(|view| view.qualified_name)
            .collect();
        assert_eq!(names, ["Counter", "Temperature"]);
        let json = serde_json::to_value(api.get_variable("Counter").unwrap()).unwrap();
        assert_eq!(
            json,
            serde_json::json!({"qualified_name": "Counter", "type": "int", "value": 0})
        );
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_writers_serialize_in_arrival_order() {
        let api = api().await;
        let variable = api.registry().lookup("Counter").unwrap().clone();
        // Hold the scope so the writers queue up behind it one by one.
        let scope = variable.acquire().await;
        let mut writers = Vec::new();
        for i in 1..=20i64 {
            let api = api.clone();
            writers.push(tokio::spawn(async move {
                api.write_variable("Counter", i).await
            }));
            // Let writer `i` reach the queue before the next one starts.
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        assert_eq!(api.read_variable("Counter").await.unwrap(), Value::Int(0));
        drop(scope);
        for writer in writers {
            writer.await.unwrap().unwrap();
        }
        assert_eq!(api.read_variable("Counter").await.unwrap(), Value::Int(20));
    }

    #[tokio::test]
    async fn set_variable_returns_the_new_view() {
        let api = api().await;
        let view = api.set_variable("Temperature", Value::Float(22.5)).await.unwrap();
        assert_eq!(view.value, Value::Float(22.5));
        assert_eq!(view.value_type, ValueType::Float);
        assert!(matches!(
            api.set_variable("Temperature", Value::Bool(true)).await,
            Err(Error::TypeMismatch { .. })
        ));
    }
}
