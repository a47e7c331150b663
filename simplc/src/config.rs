//! YAML configuration of a simplc process.
//!
//! ```yaml
//! modbus:
//!   byte_order: big
//!   word_order: little
//! opcua:
//!   url: opc.tcp://0.0.0.0:14840/simplc/
//! variables:
//!   - qualified_name: Tank Level
//!     value: 0.0
//!     modbus: { type: h, slave: 0, address: 2, register_size: 64 }
//!     opcua: { namespace: 1 }
//! ```

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::Path;
use std::sync::Arc;

use serde::Deserialize;
use tokio_modbus::slave::SlaveId;

use crate::codec::{Address, Endian, RegisterSize, WordLayout};
use crate::error::{Error, Result};
use crate::modbus::RegisterBank;
use crate::opcua::AddressSpace;
use crate::registry::{prepare, AddressPlan, OpcuaSpec, VariableRegistry, VariableSpec};
use crate::value::{Value, ValueType};
use crate::variable::ModbusBinding;

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
    #[serde(default)]
    pub modbus: ModbusConfig,

    #[serde(default)]
    pub opcua: OpcuaConfig,

    #[serde(default)]
    pub http: HttpConfig,

    #[serde(default)]
    pub variables: Vec<VariableConfig>,
}

impl Config {
    /// Parse a YAML document. Schema violations are configuration errors.
    pub fn parse(yaml: &str) -> Result<Self> {
        serde_yaml::from_str(yaml).map_err(|err| Error::Config(err.to_string()))
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let yaml = std::fs::read_to_string(path)?;
        Self::parse(&yaml)
    }

    /// Check every variable against the others and report all problems at once.
    pub fn validate(&self) -> Result<()> {
        let layout = self.modbus.layout();
        let mut plan = AddressPlan::default();
        let mut problems = Vec::new();
        for variable in &self.variables {
            let claimed = prepare(variable.to_spec(), layout).and_then(|prepared| {
                let model = prepared.model;
                plan.claim(
                    model.qualified_name(),
                    model.modbus(),
                    model.opcua().map(|binding| &binding.node),
                )
            });
            if let Err(err) = claimed {
                problems.push(match err {
                    Error::Config(msg) => msg,
                    other => other.to_string(),
                });
            }
        }
        if problems.is_empty() {
            Ok(())
        } else {
            Err(Error::Config(problems.join("; ")))
        }
    }

    /// Validate, then register every variable in declaration order.
    pub async fn build_registry(
        &self,
        bank: Arc<dyn RegisterBank>,
        space: Arc<dyn AddressSpace>,
    ) -> Result<VariableRegistry> {
        self.validate()?;
        let mut registry = VariableRegistry::new(bank, space, self.modbus.layout());
        for variable in &self.variables {
            registry.register(variable.to_spec()).await?;
        }
        Ok(registry)
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ModbusConfig {
    #[serde(default = "default_modbus_address")]
    pub address: IpAddr,

    #[serde(default = "default_modbus_port")]
    pub port: u16,

    #[serde(default)]
    pub byte_order: Endian,

    #[serde(default)]
    pub word_order: Endian,
}

fn default_modbus_address() -> IpAddr {
    IpAddr::V4(Ipv4Addr::UNSPECIFIED)
}

fn default_modbus_port() -> u16 {
    1502
}

impl ModbusConfig {
    pub fn socket_addr(&self) -> SocketAddr {
        SocketAddr::new(self.address, self.port)
    }

    pub fn layout(&self) -> WordLayout {
        WordLayout::new(self.byte_order, self.word_order)
    }
}

impl Default for ModbusConfig {
    fn default() -> Self {
        Self {
            address: default_modbus_address(),
            port: default_modbus_port(),
            byte_order: Endian::default(),
            word_order: Endian::default(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
pub enum SecurityPolicy {
    #[serde(alias = "None")]
    NoSecurity,
    #[serde(rename = "Basic128Rsa15_Sign")]
    Basic128Rsa15Sign,
    #[serde(rename = "Basic128Rsa15_SignAndEncrypt")]
    Basic128Rsa15SignAndEncrypt,
    #[serde(rename = "Basic256_Sign")]
    Basic256Sign,
    #[serde(rename = "Basic256_SignAndEncrypt")]
    Basic256SignAndEncrypt,
    #[serde(rename = "Basic256Sha256_Sign")]
    Basic256Sha256Sign,
    #[serde(rename = "Basic256Sha256_SignAndEncrypt")]
    Basic256Sha256SignAndEncrypt,
    #[serde(rename = "Aes128Sha256RsaOaep_Sign")]
    Aes128Sha256RsaOaepSign,
    #[serde(rename = "Aes128Sha256RsaOaep_SignAndEncrypt")]
    Aes128Sha256RsaOaepSignAndEncrypt,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct OpcuaConfig {
    #[serde(default = "default_opcua_url")]
    pub url: String,

    #[serde(default = "default_security_policy")]
    pub security_policy: Vec<SecurityPolicy>,
}

fn default_opcua_url() -> String {
    "opc.tcp://0.0.0.0:14840/simplc/".to_owned()
}

fn default_security_policy() -> Vec<SecurityPolicy> {
    vec![SecurityPolicy::NoSecurity]
}

impl Default for OpcuaConfig {
    fn default() -> Self {
        Self {
            url: default_opcua_url(),
            security_policy: default_security_policy(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct HttpConfig {
    #[serde(default = "default_http_address")]
    pub address: SocketAddr,
}

fn default_http_address() -> SocketAddr {
    SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), 8080)
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self {
            address: default_http_address(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct VariableConfig {
    pub qualified_name: String,

    pub value: Value,

    /// Inferred from `value` when absent.
    #[serde(default)]
    pub data_type: Option<ValueType>,

    #[serde(default)]
    pub modbus: Option<ModbusVariableConfig>,

    #[serde(default)]
    pub opcua: Option<OpcuaVariableConfig>,
}

impl VariableConfig {
    pub fn to_spec(&self) -> VariableSpec {
        VariableSpec {
            qualified_name: self.qualified_name.clone(),
            value: self.value,
            value_type: self.data_type,
            modbus: self.modbus.map(ModbusBinding::from),
            opcua: self.opcua.as_ref().map(|opcua| OpcuaSpec {
                namespace_index: opcua.namespace,
                node_qualified_name: opcua
                    .node_qualified_name
                    .clone()
                    .unwrap_or_else(|| self.qualified_name.clone()),
                writeable: opcua.writeable,
            }),
        }
    }
}

/// Modbus binding of a variable, one variant per object kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(tag = "type", deny_unknown_fields)]
pub enum ModbusVariableConfig {
    #[serde(rename = "c", alias = "coil")]
    Coil { slave: SlaveId, address: Address },

    #[serde(rename = "d", alias = "discrete_input")]
    DiscreteInput { slave: SlaveId, address: Address },

    #[serde(rename = "h", alias = "holding_register")]
    HoldingRegister {
        slave: SlaveId,
        address: Address,
        #[serde(default = "default_register_size")]
        register_size: RegisterSize,
    },

    #[serde(rename = "i", alias = "input_register")]
    InputRegister {
        slave: SlaveId,
        address: Address,
        #[serde(default = "default_register_size")]
        register_size: RegisterSize,
    },
}

fn default_register_size() -> RegisterSize {
    RegisterSize::Bits16
}

impl From<ModbusVariableConfig> for ModbusBinding {
    fn from(config: ModbusVariableConfig) -> Self {
        match config {
            ModbusVariableConfig::Coil { slave, address } => ModbusBinding::coil(slave, address),
            ModbusVariableConfig::DiscreteInput { slave, address } => {
                ModbusBinding::discrete_input(slave, address)
            }
            ModbusVariableConfig::HoldingRegister {
                slave,
                address,
                register_size,
            } => ModbusBinding::holding_register(slave, address, register_size),
            ModbusVariableConfig::InputRegister {
                slave,
                address,
                register_size,
            } => ModbusBinding::input_register(slave, address, register_size),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct OpcuaVariableConfig {
    pub namespace: u16,

    /// Defaults to the variable's qualified name.
    #[serde(default)]
    pub node_qualified_name: Option<String>,

    #[serde(default)]
    pub writeable: Option<bool>,
}
