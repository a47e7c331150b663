//! OPC UA side of a variable: the address-space collaborator interface, an
//! in-process address space, and the push/pull conversion between canonical
//! values and OPC UA variants.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::atomic::{AtomicUsize, Ordering};

use async_trait::async_trait;
use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use tokio::sync::mpsc;
use tracing::debug;

use crate::error::{Error, Result};
use crate::value::{Value, ValueType};
use crate::variable::{Origin, VariableModel};

/// `(namespace index, qualified name)` of a node, rendered as `ns=<i>;s=<name>`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct NodeKey {
    pub namespace_index: u16,
    pub name: String,
}

impl NodeKey {
    pub fn new(namespace_index: u16, name: impl Into<String>) -> Self {
        Self {
            namespace_index,
            name: name.into(),
        }
    }
}

impl fmt::Display for NodeKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ns={};s={}", self.namespace_index, self.name)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum VariantType {
    Boolean,
    Int16,
    Int32,
    Int64,
    Float,
    Double,
}

/// Typed value held by an OPC UA variable node.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
#[serde(tag = "type", content = "value")]
pub enum Variant {
    Boolean(bool),
    Int16(i16),
    Int32(i32),
    Int64(i64),
    Float(f32),
    Double(f64),
}

impl Variant {
    pub fn variant_type(&self) -> VariantType {
        match self {
            Variant::Boolean(_) => VariantType::Boolean,
            Variant::Int16(_) => VariantType::Int16,
            Variant::Int32(_) => VariantType::Int32,
            Variant::Int64(_) => VariantType::Int64,
            Variant::Float(_) => VariantType::Float,
            Variant::Double(_) => VariantType::Double,
        }
    }

    /// Convert a canonical value into a variant of type `ty`.
    pub fn from_value(value: Value, ty: VariantType) -> Result<Variant> {
        let target = || format!("OPC UA {ty:?}");
        match (value, ty) {
            (Value::Bool(b), VariantType::Boolean) => Ok(Variant::Boolean(b)),
            (Value::Int(i), VariantType::Int16) => i16::try_from(i)
                .map(Variant::Int16)
                .map_err(|_| Error::range(i, target())),
            (Value::Int(i), VariantType::Int32) => i32::try_from(i)
                .map(Variant::Int32)
                .map_err(|_| Error::range(i, target())),
            (Value::Int(i), VariantType::Int64) => Ok(Variant::Int64(i)),
            (Value::Float(x), VariantType::Float) => {
                let v = x as f32;
                if x.is_finite() && v.is_infinite() {
                    return Err(Error::range(x, target()));
                }
                Ok(Variant::Float(v))
            }
            (Value::Float(x), VariantType::Double) => Ok(Variant::Double(x)),
            (value, ty) => Err(Error::Binding(format!(
                "a {} value cannot be stored in an OPC UA {ty:?} node",
                value.value_type()
            ))),
        }
    }

    /// Convert into canonical type `ty`, failing unless the conversion is lossless.
    pub fn to_value(self, ty: ValueType) -> Result<Value> {
        let value = match self {
            Variant::Boolean(b) => Value::Bool(b),
            Variant::Int16(i) => Value::Int(i.into()),
            Variant::Int32(i) => Value::Int(i.into()),
            Variant::Int64(i) => Value::Int(i),
            Variant::Float(x) => Value::Float(x.into()),
            Variant::Double(x) => Value::Float(x),
        };
        value.coerce(ty)
    }
}

/// Default variant type for a canonical type when no register width pins it.
pub fn default_variant_type(ty: ValueType) -> VariantType {
    match ty {
        ValueType::Bool => VariantType::Boolean,
        ValueType::Int => VariantType::Int64,
        ValueType::Float => VariantType::Double,
    }
}

/// Notification that an external OPC UA client wrote a node.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NodeWrite {
    pub node: NodeKey,
}

/// Address space of the OPC UA engine. The engine owns it; the sync engine only
/// goes through this interface.
#[async_trait]
pub trait AddressSpace: Send + Sync {
    /// Create a variable node unless one already exists under `node`.
    async fn add_variable(&self, node: &NodeKey, initial: Variant, writeable: bool) -> Result<()>;

    async fn get_value(&self, node: &NodeKey) -> Result<Variant>;

    /// Server-side write. Does not raise a [`NodeWrite`] notification.
    async fn set_value(&self, node: &NodeKey, value: Variant) -> Result<()>;

    /// Receive a notification for every write made by an external client.
    fn subscribe(&self) -> mpsc::UnboundedReceiver<NodeWrite>;
}

/// Write the canonical value of `variable` into its bound node.
///
/// Writes coming from the canonical side are server-internal and may target
/// read-only nodes; a change that arrived over Modbus may not.
pub async fn push(
    space: &dyn AddressSpace,
    variable: &VariableModel,
    origin: Origin,
) -> Result<()> {
    let Some(binding) = variable.opcua() else {
        return Ok(());
    };
    if !binding.writeable && origin != Origin::Canonical {
        return Err(Error::Binding(format!(
            "node {} is not writeable",
            binding.node
        )));
    }
    let variant = Variant::from_value(variable.value(), binding.variant_type)?;
    space.set_value(&binding.node, variant).await
}

/// Read the bound node and convert it to the variable's canonical type.
pub async fn pull(space: &dyn AddressSpace, variable: &VariableModel) -> Result<Value> {
    let binding = variable.opcua().ok_or_else(|| {
        Error::Binding(format!(
            "`{}` has no OPC UA binding",
            variable.qualified_name()
        ))
    })?;
    let variant = space.get_value(&binding.node).await?;
    variant.to_value(variable.value_type())
}

#[derive(Debug, Clone, Serialize)]
pub struct NodeInfo {
    pub node: NodeKey,
    pub value: Variant,
    pub writeable: bool,
}

#[derive(Debug, Clone)]
struct Node {
    value: Variant,
    writeable: bool,
}

/// In-process address space standing in for the OPC UA engine's node store.
#[derive(Debug, Default)]
pub struct MemoryAddressSpace {
    nodes: RwLock<BTreeMap<NodeKey, Node>>,
    subscribers: Mutex<Vec<mpsc::UnboundedSender<NodeWrite>>>,
    writes: AtomicUsize,
}

impl MemoryAddressSpace {
    pub fn new() -> Self {
        Self::default()
    }

    /// Write made by an external OPC UA client. Subscribers are notified.
    pub fn client_write(&self, node: &NodeKey, value: Variant) -> Result<()> {
        {
            let mut nodes = self.nodes.write();
            let entry = nodes
                .get_mut(node)
                .ok_or_else(|| Error::Binding(format!("unknown node {node}")))?;
            if !entry.writeable {
                return Err(Error::Binding(format!("node {node} is not writeable")));
            }
            if entry.value.variant_type() != value.variant_type() {
                return Err(Error::Binding(format!(
                    "node {node} holds {:?}, got {:?}",
                    entry.value.variant_type(),
                    value.variant_type()
                )));
            }
            entry.value = value;
        }
        debug!(%node, ?value, "client write");
        self.subscribers
            .lock()
            .retain(|tx| tx.send(NodeWrite { node: node.clone() }).is_ok());
        Ok(())
    }

    /// Number of server-side writes made through [`AddressSpace::set_value`].
    pub fn write_count(&self) -> usize {
        self.writes.load(Ordering::SeqCst)
    }

    pub fn nodes(&self) -> Vec<NodeInfo> {
        self.nodes
            .read()
            .iter()
            .map(|(key, node)| NodeInfo {
                node: key.clone(),
                value: node.value,
                writeable: node.writeable,
            })
            .collect()
    }
}

#[async_trait]
impl AddressSpace for MemoryAddressSpace {
    async fn add_variable(&self, node: &NodeKey, initial: Variant, writeable: bool) -> Result<()> {
        self.nodes.write().entry(node.clone()).or_insert_with(|| {
            debug!(%node, ?initial, writeable, "node added");
            Node {
                value: initial,
                writeable,
            }
        });
        Ok(())
    }

    async fn get_value(&self, node: &NodeKey) -> Result<Variant> {
        self.nodes
            .read()
            .get(node)
            .map(|n| n.value)
            .ok_or_else(|| Error::Binding(format!("unknown node {node}")))
    }

    async fn set_value(&self, node: &NodeKey, value: Variant) -> Result<()> {
        let mut nodes = self.nodes.write();
        let entry = nodes
            .get_mut(node)
            .ok_or_else(|| Error::Binding(format!("unknown node {node}")))?;
        entry.value = value;
        self.writes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn subscribe(&self) -> mpsc::UnboundedReceiver<NodeWrite> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.subscribers.lock().push(tx);
        rx
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::variable::OpcuaBinding;

    fn bound(
        name: &str,
        value: Value,
        writeable: bool,
        variant_type: VariantType,
    ) -> VariableModel {
        VariableModel::new(
            name.to_owned(),
            value,
            None,
            Some(OpcuaBinding {
                node: NodeKey::new(1, name),
                writeable,
                variant_type,
            }),
        )
    }

    #[test]
    fn variant_conversion_is_lossless() {
        assert_eq!(
            Variant::Int16(-3).to_value(ValueType::Int).unwrap(),
            Value::Int(-3)
        );
        assert_eq!(
            Variant::Float(1.5).to_value(ValueType::Float).unwrap(),
            Value::Float(1.5)
        );
        assert!(matches!(
            Variant::Double(1.0).to_value(ValueType::Int),
            Err(Error::TypeMismatch { .. })
        ));
        assert!(matches!(
            Variant::Boolean(true).to_value(ValueType::Float),
            Err(Error::TypeMismatch { .. })
        ));
    }

    #[test]
    fn narrow_variants_check_range() {
        assert!(matches!(
            Variant::from_value(Value::Int(70_000), VariantType::Int16),
            Err(Error::Range { .. })
        ));
        assert_eq!(
            Variant::from_value(Value::Int(70_000), VariantType::Int32).unwrap(),
            Variant::Int32(70_000)
        );
    }

    #[test]
    fn node_key_display() {
        assert_eq!(NodeKey::new(2, "Tank Level").to_string(), "ns=2;s=Tank Level");
    }

    #[tokio::test]
    async fn push_then_pull() {
        let space = MemoryAddressSpace::new();
        let variable = bound("Level", Value::Float(2.5), true, VariantType::Double);
        space
            .add_variable(&NodeKey::new(1, "Level"), Variant::Double(0.0), true)
            .await
            .unwrap();
        push(&space, &variable, Origin::Canonical).await.unwrap();
        assert_eq!(pull(&space, &variable).await.unwrap(), Value::Float(2.5));
        assert_eq!(space.write_count(), 1);
    }

    #[tokio::test]
    async fn read_only_node_rejects_foreign_origin() {
        let space = MemoryAddressSpace::new();
        let variable = bound("Sensor", Value::Bool(true), false, VariantType::Boolean);
        space
            .add_variable(&NodeKey::new(1, "Sensor"), Variant::Boolean(false), false)
            .await
            .unwrap();
        assert!(matches!(
            push(&space, &variable, Origin::Modbus).await,
            Err(Error::Binding(_))
        ));
        push(&space, &variable, Origin::Canonical).await.unwrap();
        assert_eq!(
            space.get_value(&NodeKey::new(1, "Sensor")).await.unwrap(),
            Variant::Boolean(true)
        );
    }

    #[tokio::test]
    async fn push_resolves_node_late() {
        let space = MemoryAddressSpace::new();
        let variable = bound("Late", Value::Int(4), true, VariantType::Int64);
        assert!(matches!(
            push(&space, &variable, Origin::Canonical).await,
            Err(Error::Binding(_))
        ));
        space
            .add_variable(&NodeKey::new(1, "Late"), Variant::Int64(0), true)
            .await
            .unwrap();
        push(&space, &variable, Origin::Canonical).await.unwrap();
    }

    #[tokio::test]
    async fn client_write_notifies_subscribers() {
        let space = MemoryAddressSpace::new();
        let node = NodeKey::new(1, "Valve");
        space
            .add_variable(&node, Variant::Boolean(false), true)
            .await
            .unwrap();
        let mut rx = space.subscribe();
        space.client_write(&node, Variant::Boolean(true)).unwrap();
        assert_eq!(rx.recv().await.unwrap(), NodeWrite { node: node.clone() });
        assert_eq!(space.write_count(), 0);
    }

    #[tokio::test]
    async fn client_write_to_read_only_node_fails() {
        let space = MemoryAddressSpace::new();
        let node = NodeKey::new(1, "Level");
        space
            .add_variable(&node, Variant::Double(0.0), false)
            .await
            .unwrap();
        assert!(space.client_write(&node, Variant::Double(1.0)).is_err());
    }
}
