use std::collections::HashMap;
use std::sync::Arc;

use tokio_modbus::slave::SlaveId;
use tracing::info;

use crate::codec::{self, Address, Quantity, RegisterSize, Width, Word, WordLayout};
use crate::error::{Error, Result};
use crate::modbus::RegisterBank;
use crate::opcua::{default_variant_type, AddressSpace, NodeKey, Variant, VariantType};
use crate::value::{Value, ValueType};
use crate::variable::{narrow, ModbusBinding, OpcuaBinding, RegisterKind, VariableModel};

/// OPC UA part of a [`VariableSpec`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OpcuaSpec {
    pub namespace_index: u16,
    pub node_qualified_name: String,
    /// Whether external clients may write the node. Defaults to the
    /// writeability of the Modbus kind, or `true` without a Modbus binding.
    pub writeable: Option<bool>,
}

/// Everything needed to register one variable.
#[derive(Debug, Clone, PartialEq)]
pub struct VariableSpec {
    pub qualified_name: String,
    pub value: Value,
    /// Declared canonical type; inferred from `value` when absent.
    pub value_type: Option<ValueType>,
    pub modbus: Option<ModbusBinding>,
    pub opcua: Option<OpcuaSpec>,
}

impl VariableSpec {
    pub fn new(qualified_name: impl Into<String>, value: impl Into<Value>) -> Self {
        Self {
            qualified_name: qualified_name.into(),
            value: value.into(),
            value_type: None,
            modbus: None,
            opcua: None,
        }
    }

    pub fn with_type(mut self, value_type: ValueType) -> Self {
        self.value_type = Some(value_type);
        self
    }

    pub fn with_modbus(mut self, binding: ModbusBinding) -> Self {
        self.modbus = Some(binding);
        self
    }

    pub fn with_opcua(
        mut self,
        namespace_index: u16,
        node_qualified_name: impl Into<String>,
    ) -> Self {
        self.opcua = Some(OpcuaSpec {
            namespace_index,
            node_qualified_name: node_qualified_name.into(),
            writeable: None,
        });
        self
    }

    /// Override the writeability of the OPC UA node. No effect without an OPC UA binding.
    pub fn writeable(mut self, writeable: bool) -> Self {
        if let Some(opcua) = self.opcua.as_mut() {
            opcua.writeable = Some(writeable);
        }
        self
    }
}

/// A validated [`VariableSpec`], ready to be allocated in the stores.
#[derive(Debug)]
pub(crate) struct Prepared {
    pub model: VariableModel,
    pub words: Option<Vec<Word>>,
    pub variant: Option<Variant>,
}

fn config_error(name: &str, err: impl std::fmt::Display) -> Error {
    Error::Config(format!("`{name}`: {err}"))
}

fn variant_type_for(ty: ValueType, width: Option<Width>) -> VariantType {
    match (ty, width) {
        (ValueType::Int, Some(Width::Register(RegisterSize::Bits16))) => VariantType::Int16,
        (ValueType::Int, Some(Width::Register(RegisterSize::Bits32))) => VariantType::Int32,
        (ValueType::Float, Some(Width::Register(RegisterSize::Bits32))) => VariantType::Float,
        (ty, _) => default_variant_type(ty),
    }
}

/// Validate `spec` on its own, without looking at other variables.
pub(crate) fn prepare(spec: VariableSpec, layout: WordLayout) -> Result<Prepared> {
    let name = spec.qualified_name.as_str();
    if name.trim().is_empty() {
        return Err(Error::Config("qualified name must not be empty".to_owned()));
    }
    let value_type = spec.value_type.unwrap_or(spec.value.value_type());
    let value = spec
        .value
        .coerce(value_type)
        .map_err(|err| config_error(name, err))?;

    let opcua = spec.opcua.as_ref().map(|opcua| OpcuaBinding {
        node: NodeKey::new(opcua.namespace_index, opcua.node_qualified_name.clone()),
        writeable: opcua.writeable.unwrap_or_else(|| {
            spec.modbus
                .as_ref()
                .map_or(true, |binding| binding.kind.is_writeable())
        }),
        variant_type: variant_type_for(value_type, spec.modbus.as_ref().map(ModbusBinding::width)),
    });
    let value = narrow(value, spec.modbus.as_ref(), opcua.as_ref())
        .map_err(|err| config_error(name, err))?;

    let words = match &spec.modbus {
        Some(binding) => {
            if binding.kind.is_bit() {
                if let Some(size) = binding.size {
                    return Err(config_error(
                        name,
                        format!(
                            "a {} does not take a register size ({} bits given)",
                            binding.kind,
                            size.bits()
                        ),
                    ));
                }
                if value_type != ValueType::Bool {
                    return Err(config_error(
                        name,
                        format!("a {} holds a bool, not a {value_type}", binding.kind),
                    ));
                }
            } else if value_type == ValueType::Bool {
                return Err(config_error(
                    name,
                    format!("a {} holds an int or a float, not a bool", binding.kind),
                ));
            }
            let end = u32::from(binding.address) + u32::from(binding.quantity());
            if end > u32::from(Address::MAX) + 1 {
                return Err(config_error(
                    name,
                    format!("{binding} runs past the end of the address space"),
                ));
            }
            let words = codec::encode(value, value_type, binding.width(), layout)
                .map_err(|err| config_error(name, err))?;
            Some(words)
        }
        None => None,
    };

    let variant = match &opcua {
        Some(binding) => Some(
            Variant::from_value(value, binding.variant_type)
                .map_err(|err| config_error(name, err))?,
        ),
        None => None,
    };

    Ok(Prepared {
        model: VariableModel::new(spec.qualified_name, value, spec.modbus, opcua),
        words,
        variant,
    })
}

/// Tracks which names, Modbus addresses and OPC UA nodes are taken.
///
/// Multi-word registers occupy every address they span.
#[derive(Debug, Default)]
pub struct AddressPlan {
    names: Vec<String>,
    by_name: HashMap<String, usize>,
    modbus: HashMap<(SlaveId, RegisterKind, Address), usize>,
    opcua: HashMap<NodeKey, usize>,
}

impl AddressPlan {
    /// Fail if any identity of the variable is already taken.
    pub fn check(
        &self,
        name: &str,
        modbus: Option<&ModbusBinding>,
        node: Option<&NodeKey>,
    ) -> Result<()> {
        if self.by_name.contains_key(name) {
            return Err(Error::Config(format!("duplicate qualified name `{name}`")));
        }
        if let Some(binding) = modbus {
            for address in span(binding) {
                if let Some(&other) = self.modbus.get(&(binding.slave, binding.kind, address)) {
                    return Err(Error::Config(format!(
                        "`{name}` at {binding} collides with `{}` at slave {} {} {address}",
                        self.names[other], binding.slave, binding.kind
                    )));
                }
            }
        }
        if let Some(node) = node {
            if let Some(&other) = self.opcua.get(node) {
                return Err(Error::Config(format!(
                    "`{name}` and `{}` are both bound to node {node}",
                    self.names[other]
                )));
            }
        }
        Ok(())
    }

    /// Check, then record the variable. Returns its index.
    pub fn claim(
        &mut self,
        name: &str,
        modbus: Option<&ModbusBinding>,
        node: Option<&NodeKey>,
    ) -> Result<usize> {
        self.check(name, modbus, node)?;
        let index = self.names.len();
        self.names.push(name.to_owned());
        self.by_name.insert(name.to_owned(), index);
        if let Some(binding) = modbus {
            for address in span(binding) {
                self.modbus.insert((binding.slave, binding.kind, address), index);
            }
        }
        if let Some(node) = node {
            self.opcua.insert(node.clone(), index);
        }
        Ok(index)
    }

    fn index_of(&self, name: &str) -> Option<usize> {
        self.by_name.get(name).copied()
    }
}

fn span(binding: &ModbusBinding) -> impl Iterator<Item = Address> {
    (binding.address..=Address::MAX).take(binding.quantity().into())
}

/// Owns every [`VariableModel`] of a process.
///
/// Constructed once at startup and shared by reference with the sync engine.
pub struct VariableRegistry {
    plan: AddressPlan,
    variables: Vec<Arc<VariableModel>>,
    bank: Arc<dyn RegisterBank>,
    space: Arc<dyn AddressSpace>,
    layout: WordLayout,
}

impl VariableRegistry {
    pub fn new(
        bank: Arc<dyn RegisterBank>,
        space: Arc<dyn AddressSpace>,
        layout: WordLayout,
    ) -> Self {
        Self {
            plan: AddressPlan::default(),
            variables: Vec::new(),
            bank,
            space,
            layout,
        }
    }

    /// Validate and add a variable, allocating its register and node in the stores.
    pub async fn register(&mut self, spec: VariableSpec) -> Result<Arc<VariableModel>> {
        let Prepared {
            model,
            words,
            variant,
        } = prepare(spec, self.layout)?;
        let node = model.opcua().map(|binding| &binding.node);
        self.plan.check(model.qualified_name(), model.modbus(), node)?;

        if let (Some(binding), Some(words)) = (model.modbus(), &words) {
            self.bank
                .allocate(binding.slave, binding.kind, binding.address, words)
                .await?;
        }
        if let (Some(binding), Some(variant)) = (model.opcua(), variant) {
            self.space
                .add_variable(&binding.node, variant, binding.writeable)
                .await?;
        }

        self.plan.claim(model.qualified_name(), model.modbus(), node)?;
        info!(
            variable = model.qualified_name(),
            value = %model.value(),
            modbus = ?model.modbus(),
            opcua = ?model.opcua().map(|binding| binding.node.to_string()),
            "variable registered"
        );
        let model = Arc::new(model);
        self.variables.push(model.clone());
        Ok(model)
    }

    pub fn lookup(&self, qualified_name: &str) -> Result<&Arc<VariableModel>> {
        self.plan
            .index_of(qualified_name)
            .map(|index| &self.variables[index])
            .ok_or_else(|| Error::NotFound(qualified_name.to_owned()))
    }

    /// Variables in registration order.
    pub fn all_variables(&self) -> &[Arc<VariableModel>] {
        &self.variables
    }

    /// Variables occupying any of `address..address + count`, in address order.
    pub fn by_modbus_range(
        &self,
        slave: SlaveId,
        kind: RegisterKind,
        address: Address,
        count: Quantity,
    ) -> Vec<Arc<VariableModel>> {
        let mut indices: Vec<usize> = (address..=Address::MAX)
            .take(count.into())
            .filter_map(|addr| self.plan.modbus.get(&(slave, kind, addr)).copied())
            .collect();
        indices.dedup();
        indices
            .into_iter()
            .map(|index| self.variables[index].clone())
            .collect()
    }

    pub fn by_node(&self, node: &NodeKey) -> Option<&Arc<VariableModel>> {
        self.plan.opcua.get(node).map(|&index| &self.variables[index])
    }

    pub fn bank(&self) -> &Arc<dyn RegisterBank> {
        &self.bank
    }

    pub fn space(&self) -> &Arc<dyn AddressSpace> {
        &self.space
    }

    pub fn layout(&self) -> WordLayout {
        self.layout
    }

    pub fn len(&self) -> usize {
        self.variables.len()
    }

    pub fn is_empty(&self) -> bool {
        self.variables.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::Endian;
    use crate::modbus::DataStore;
    use crate::opcua::MemoryAddressSpace;

    fn registry() -> (VariableRegistry, Arc<DataStore>, Arc<MemoryAddressSpace>) {
        let bank = Arc::new(DataStore::new());
        let space = Arc::new(MemoryAddressSpace::new());
        let registry = VariableRegistry::new(
            bank.clone(),
            space.clone(),
            WordLayout::new(Endian::Big, Endian::Big),
        );
        (registry, bank, space)
    }

    #[tokio::test]
    async fn registration_allocates_in_both_stores() {
        let (mut registry, bank, space) = registry();
        registry
            .register(
                VariableSpec::new("Tank Level", 12.5)
                    .with_modbus(ModbusBinding::holding_register(0, 4, RegisterSize::Bits32))
                    .with_opcua(1, "Tank Level"),
            )
            .await
            .unwrap();
        assert_eq!(
            bank.read(0, RegisterKind::HoldingRegister, 4, 2).await.unwrap(),
            codec::Encode::to_words(12.5f32, WordLayout::default())
        );
        assert_eq!(
            space.get_value(&NodeKey::new(1, "Tank Level")).await.unwrap(),
            Variant::Float(12.5)
        );
    }

    #[tokio::test]
    async fn single_precision_initial_value_is_rounded() {
        let (mut registry, bank, _) = registry();
        let flow = registry
            .register(
                VariableSpec::new("Flow", 0.1)
                    .with_modbus(ModbusBinding::holding_register(0, 0, RegisterSize::Bits32))
                    .with_opcua(1, "Flow"),
            )
            .await
            .unwrap();
        assert_eq!(flow.value(), Value::Float(f64::from(0.1f32)));
        let words = bank.read(0, RegisterKind::HoldingRegister, 0, 2).await.unwrap();
        assert_eq!(
            codec::decode(
                &words,
                ValueType::Float,
                Width::Register(RegisterSize::Bits32),
                WordLayout::default()
            )
            .unwrap(),
            flow.value()
        );
    }

    #[tokio::test]
    async fn same_coil_twice_is_a_config_error() {
        let (mut registry, _, _) = registry();
        registry
            .register(
                VariableSpec::new("Inlet Valve", false).with_modbus(ModbusBinding::coil(0, 0)),
            )
            .await
            .unwrap();
        let err = registry
            .register(
                VariableSpec::new("Outlet Valve", false).with_modbus(ModbusBinding::coil(0, 0)),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Config(_)));
        assert_eq!(registry.len(), 1);
    }

    #[tokio::test]
    async fn overlapping_multi_word_registers_collide() {
        let (mut registry, _, _) = registry();
        registry
            .register(
                VariableSpec::new("A", 0i64)
                    .with_modbus(ModbusBinding::holding_register(0, 0, RegisterSize::Bits64)),
            )
            .await
            .unwrap();
        let err = registry
            .register(
                VariableSpec::new("B", 0i64)
                    .with_modbus(ModbusBinding::holding_register(0, 3, RegisterSize::Bits16)),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Config(_)));
        // Same address, different kind: fine.
        registry
            .register(
                VariableSpec::new("C", 0i64)
                    .with_modbus(ModbusBinding::input_register(0, 3, RegisterSize::Bits16)),
            )
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn rejects_invalid_specs() {
        let (mut registry, _, _) = registry();
        let cases = [
            VariableSpec::new("coil with size", true).with_modbus(ModbusBinding::new(
                0,
                RegisterKind::Coil,
                0,
                Some(RegisterSize::Bits16),
            )),
            VariableSpec::new("numeric coil", 1i64).with_modbus(ModbusBinding::coil(0, 1)),
            VariableSpec::new("bool register", true)
                .with_modbus(ModbusBinding::holding_register(0, 0, RegisterSize::Bits16)),
            VariableSpec::new("half float", 1.0)
                .with_modbus(ModbusBinding::holding_register(0, 0, RegisterSize::Bits16)),
            VariableSpec::new("too big", 100_000i64)
                .with_modbus(ModbusBinding::holding_register(0, 0, RegisterSize::Bits16)),
            VariableSpec::new("past the end", 0i64).with_modbus(ModbusBinding::holding_register(
                0,
                Address::MAX,
                RegisterSize::Bits32,
            )),
            VariableSpec::new("wrong declared type", 1.5).with_type(ValueType::Int),
            VariableSpec::new("  ", true),
        ];
        for spec in cases {
            let name = spec.qualified_name.clone();
            let err = registry.register(spec).await.unwrap_err();
            assert!(matches!(err, Error::Config(_)), "{name}: {err}");
        }
        assert!(registry.is_empty());
    }

    #[tokio::test]
    async fn duplicate_names_and_nodes_are_rejected() {
        let (mut registry, _, _) = registry();
        registry
            .register(VariableSpec::new("Blender", false).with_opcua(1, "Blender"))
            .await
            .unwrap();
        assert!(matches!(
            registry.register(VariableSpec::new("Blender", true)).await,
            Err(Error::Config(_))
        ));
        assert!(matches!(
            registry
                .register(VariableSpec::new("Mixer", false).with_opcua(1, "Blender"))
                .await,
            Err(Error::Config(_))
        ));
        registry
            .register(VariableSpec::new("Mixer", false).with_opcua(2, "Blender"))
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn lookup_and_order() {
        let (mut registry, _, _) = registry();
        for name in ["b", "a", "c"] {
            registry.register(VariableSpec::new(name, 0i64)).await.unwrap();
        }
        let names: Vec<&str> = registry
            .all_variables()
            .iter()
            .map(|v| v.qualified_name())
            .collect();
        assert_eq!(names, vec!["b", "a", "c"]);
        assert_eq!(registry.lookup("a").unwrap().qualified_name(), "a");
        assert!(matches!(registry.lookup("z"), Err(Error::NotFound(_))));
    }

    #[tokio::test]
    async fn opcua_defaults_follow_modbus_kind() {
        let (mut registry, _, _) = registry();
        let sensor = registry
            .register(
                VariableSpec::new("Level Switch", false)
                    .with_modbus(ModbusBinding::discrete_input(0, 0))
                    .with_opcua(1, "Level Switch"),
            )
            .await
            .unwrap();
        let setpoint = registry
            .register(
                VariableSpec::new("Setpoint", 0i64)
                    .with_modbus(ModbusBinding::holding_register(0, 0, RegisterSize::Bits32))
                    .with_opcua(1, "Setpoint"),
            )
            .await
            .unwrap();
        let free = registry
            .register(VariableSpec::new("Free", 0.0).with_opcua(1, "Free"))
            .await
            .unwrap();
        assert!(!sensor.opcua().unwrap().writeable);
        assert!(setpoint.opcua().unwrap().writeable);
        assert_eq!(setpoint.opcua().unwrap().variant_type, VariantType::Int32);
        assert_eq!(free.opcua().unwrap().variant_type, VariantType::Double);
    }

    #[tokio::test]
    async fn range_lookup_finds_every_covered_variable() {
        let (mut registry, _, _) = registry();
        registry
            .register(
                VariableSpec::new("A", 0i64)
                    .with_modbus(ModbusBinding::holding_register(0, 0, RegisterSize::Bits32)),
            )
            .await
            .unwrap();
        registry
            .register(
                VariableSpec::new("B", 0i64)
                    .with_modbus(ModbusBinding::holding_register(0, 2, RegisterSize::Bits16)),
            )
            .await
            .unwrap();
        let hits = registry.by_modbus_range(0, RegisterKind::HoldingRegister, 1, 2);
        let names: Vec<&str> = hits.iter().map(|v| v.qualified_name()).collect();
        assert_eq!(names, vec!["A", "B"]);
        assert!(registry
            .by_modbus_range(0, RegisterKind::HoldingRegister, 3, 5)
            .is_empty());
    }
}
