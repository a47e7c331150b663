use std::fmt;

use thiserror::Error;

use crate::value::ValueType;

pub type Result<T> = std::result::Result<T, Error>;

/// Protocol-side store touched by a propagation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Store {
    Modbus,
    Opcua,
}

impl fmt::Display for Store {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Store::Modbus => f.write_str("Modbus register bank"),
            Store::Opcua => f.write_str("OPC UA address space"),
        }
    }
}

#[derive(Debug, Error)]
pub enum Error {
    /// Invalid or ambiguous configuration. Fatal at startup.
    #[error("configuration error: {0}")]
    Config(String),

    #[error("variable `{0}` not found")]
    NotFound(String),

    #[error("type mismatch: expected {expected}, got {found}")]
    TypeMismatch { expected: ValueType, found: ValueType },

    #[error("value {value} does not fit into {target}")]
    Range { value: String, target: String },

    /// Malformed protocol-side data.
    #[error("cannot decode: {0}")]
    Decode(String),

    #[error("binding error: {0}")]
    Binding(String),

    /// A downstream store rejected the new value. The canonical value is already committed.
    #[error("propagation of `{name}` to {store} failed: {source}")]
    Propagation {
        name: String,
        store: Store,
        #[source]
        source: Box<Error>,
    },

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error("task failed: {0}")]
    Task(String),
}

impl Error {
    pub(crate) fn range(value: impl fmt::Display, target: impl fmt::Display) -> Self {
        Self::Range {
            value: value.to_string(),
            target: target.to_string(),
        }
    }

    pub(crate) fn propagation(name: &str, store: Store, source: Error) -> Self {
        Self::Propagation {
            name: name.to_owned(),
            store,
            source: Box::new(source),
        }
    }
}
