use std::fmt;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tokio::sync::{Mutex, OwnedMutexGuard};
use tokio_modbus::slave::SlaveId;

use crate::codec::{Address, Quantity, RegisterSize, Width};
use crate::error::{Error, Result};
use crate::opcua::{NodeKey, VariantType};
use crate::value::{Value, ValueType};

/// The four Modbus object kinds, each with its own address space.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RegisterKind {
    Coil,
    DiscreteInput,
    HoldingRegister,
    InputRegister,
}

impl RegisterKind {
    pub const ALL: [RegisterKind; 4] = [
        RegisterKind::Coil,
        RegisterKind::DiscreteInput,
        RegisterKind::HoldingRegister,
        RegisterKind::InputRegister,
    ];

    pub const fn is_bit(self) -> bool {
        matches!(self, RegisterKind::Coil | RegisterKind::DiscreteInput)
    }

    /// Whether a Modbus master may write this kind.
    pub const fn is_writeable(self) -> bool {
        matches!(self, RegisterKind::Coil | RegisterKind::HoldingRegister)
    }
}

impl fmt::Display for RegisterKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RegisterKind::Coil => f.write_str("coil"),
            RegisterKind::DiscreteInput => f.write_str("discrete input"),
            RegisterKind::HoldingRegister => f.write_str("holding register"),
            RegisterKind::InputRegister => f.write_str("input register"),
        }
    }
}

/// Location of a variable in the Modbus register space.
///
/// `size` is only meaningful for holding and input registers; it defaults to 16 bits.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ModbusBinding {
    pub slave: SlaveId,
    pub kind: RegisterKind,
    pub address: Address,
    pub size: Option<RegisterSize>,
}

impl ModbusBinding {
    pub fn coil(slave: SlaveId, address: Address) -> Self {
        Self::new(slave, RegisterKind::Coil, address, None)
    }

    pub fn discrete_input(slave: SlaveId, address: Address) -> Self {
        Self::new(slave, RegisterKind::DiscreteInput, address, None)
    }

    pub fn holding_register(slave: SlaveId, address: Address, size: RegisterSize) -> Self {
        Self::new(slave, RegisterKind::HoldingRegister, address, Some(size))
    }

    pub fn input_register(slave: SlaveId, address: Address, size: RegisterSize) -> Self {
        Self::new(slave, RegisterKind::InputRegister, address, Some(size))
    }

    pub fn new(
        slave: SlaveId,
        kind: RegisterKind,
        address: Address,
        size: Option<RegisterSize>,
    ) -> Self {
        Self {
            slave,
            kind,
            address,
            size,
        }
    }

    pub fn width(&self) -> Width {
        if self.kind.is_bit() {
            Width::Bit
        } else {
            Width::Register(self.size.unwrap_or(RegisterSize::Bits16))
        }
    }

    pub fn quantity(&self) -> Quantity {
        self.width().words()
    }

}

impl fmt::Display for ModbusBinding {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "slave {} {} {}", self.slave, self.kind, self.address)
    }
}

/// Symbolic reference to an OPC UA node, resolved against the live address space
/// each time a value is propagated.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OpcuaBinding {
    pub node: NodeKey,
    pub writeable: bool,
    pub variant_type: VariantType,
}

/// Round a float to the precision of the narrowest store it is bound to.
///
/// A 32-bit register or an OPC UA `Float` node only holds an `f32`, so the
/// canonical value keeps that rounding too and reads back unchanged.
pub(crate) fn narrow(
    value: Value,
    modbus: Option<&ModbusBinding>,
    opcua: Option<&OpcuaBinding>,
) -> Result<Value> {
    let single = modbus
        .is_some_and(|binding| binding.width() == Width::Register(RegisterSize::Bits32))
        || opcua.is_some_and(|binding| binding.variant_type == VariantType::Float);
    match value {
        Value::Float(x) if single => {
            let rounded = x as f32;
            if x.is_finite() && rounded.is_infinite() {
                return Err(Error::range(x, "a 32-bit float"));
            }
            Ok(Value::Float(rounded.into()))
        }
        value => Ok(value),
    }
}

/// Where a change to the canonical value came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Origin {
    Canonical,
    Modbus,
    Opcua,
}

impl fmt::Display for Origin {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Origin::Canonical => f.write_str("canonical"),
            Origin::Modbus => f.write_str("Modbus"),
            Origin::Opcua => f.write_str("OPC UA"),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ChangeRecord {
    pub qualified_name: String,
    pub new_value: Value,
    pub origin: Origin,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncState {
    Idle,
    Propagating,
}

#[derive(Debug)]
struct Canonical {
    value: Value,
    state: SyncState,
    last_change: Option<ChangeRecord>,
}

/// One named process variable.
///
/// The canonical value is mutated only by the sync engine while it holds the
/// variable's exclusive scope. Readers never wait for that scope.
#[derive(Debug)]
pub struct VariableModel {
    qualified_name: String,
    value_type: ValueType,
    modbus: Option<ModbusBinding>,
    opcua: Option<OpcuaBinding>,
    canonical: RwLock<Canonical>,
    scope: Arc<Mutex<()>>,
}

impl VariableModel {
    pub(crate) fn new(
        qualified_name: String,
        value: Value,
        modbus: Option<ModbusBinding>,
        opcua: Option<OpcuaBinding>,
    ) -> Self {
        Self {
            qualified_name,
            value_type: value.value_type(),
            modbus,
            opcua,
            canonical: RwLock::new(Canonical {
                value,
                state: SyncState::Idle,
                last_change: None,
            }),
            scope: Arc::new(Mutex::new(())),
        }
    }

    pub fn qualified_name(&self) -> &str {
        &self.qualified_name
    }

    pub fn value_type(&self) -> ValueType {
        self.value_type
    }

    pub fn value(&self) -> Value {
        self.canonical.read().value
    }

    pub fn modbus(&self) -> Option<&ModbusBinding> {
        self.modbus.as_ref()
    }

    pub fn opcua(&self) -> Option<&OpcuaBinding> {
        self.opcua.as_ref()
    }

    /// Round `value` the way the bound stores will hold it.
    pub(crate) fn narrow(&self, value: Value) -> Result<Value> {
        narrow(value, self.modbus(), self.opcua())
    }

    pub fn state(&self) -> SyncState {
        self.canonical.read().state
    }

    pub fn last_change(&self) -> Option<ChangeRecord> {
        self.canonical.read().last_change.clone()
    }

    /// Wait for the exclusive scope. Waiters are served in arrival order.
    pub(crate) async fn acquire(&self) -> OwnedMutexGuard<()> {
        self.scope.clone().lock_owned().await
    }

    /// Commit a new canonical value and enter `Propagating`.
    ///
    /// Must be called with the scope held.
    pub(crate) fn commit(&self, value: Value, origin: Origin) -> ChangeRecord {
        let record = ChangeRecord {
            qualified_name: self.qualified_name.clone(),
            new_value: value,
            origin,
            timestamp: Utc::now(),
        };
        let mut canonical = self.canonical.write();
        canonical.value = value;
        canonical.state = SyncState::Propagating;
        canonical.last_change = Some(record.clone());
        record
    }

    pub(crate) fn settle(&self) {
        self.canonical.write().state = SyncState::Idle;
    }
}
