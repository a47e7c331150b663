use std::fmt;

use serde::{Deserialize, Serialize};

pub use tokio_modbus::{Address, Quantity};

use crate::error::{Error, Result};
use crate::value::{Value, ValueType};

/// 16-bit value stored in Modbus register.
pub type Word = u16;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Endian {
    #[default]
    #[serde(alias = "b")]
    Big,
    #[serde(alias = "l")]
    Little,
}

/// Byte order inside each word and order of the words of a multi-word value.
/// The two knobs are independent.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct WordLayout {
    pub byte_order: Endian,
    pub word_order: Endian,
}

impl WordLayout {
    pub const fn new(byte_order: Endian, word_order: Endian) -> Self {
        Self {
            byte_order,
            word_order,
        }
    }
}

/// Register width of a holding or input register variable.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "u16", into = "u16")]
pub enum RegisterSize {
    Bits16,
    Bits32,
    Bits64,
}

impl RegisterSize {
    /// Number of consecutive registers the value occupies.
    pub const fn words(self) -> Quantity {
        match self {
            RegisterSize::Bits16 => 1,
            RegisterSize::Bits32 => 2,
            RegisterSize::Bits64 => 4,
        }
    }

    pub const fn bits(self) -> u16 {
        self.words() * 16
    }
}

impl TryFrom<u16> for RegisterSize {
    type Error = String;

    fn try_from(bits: u16) -> std::result::Result<Self, Self::Error> {
        match bits {
            16 => Ok(RegisterSize::Bits16),
            32 => Ok(RegisterSize::Bits32),
            64 => Ok(RegisterSize::Bits64),
            other => Err(format!("register size must be 16, 32 or 64, got {other}")),
        }
    }
}

impl From<RegisterSize> for u16 {
    fn from(size: RegisterSize) -> Self {
        size.bits()
    }
}

/// Modbus representation of a variable: a single bit or a group of registers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Width {
    Bit,
    Register(RegisterSize),
}

impl Width {
    pub const fn words(self) -> Quantity {
        match self {
            Width::Bit => 1,
            Width::Register(size) => size.words(),
        }
    }
}

impl fmt::Display for Width {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Width::Bit => f.write_str("bit"),
            Width::Register(size) => write!(f, "{}-bit register", size.bits()),
        }
    }
}

#[derive(Debug)]
pub struct WordsCountError {}

/// Decode a value from `Word`s arranged according to a [`WordLayout`].
pub trait Decode: Sized {
    fn from_words(words: &[Word], layout: WordLayout) -> std::result::Result<Self, WordsCountError>;
}

macro_rules! impl_decode {
    ($num_type:ty) => {
        impl Decode for $num_type {
            fn from_words(
                words: &[Word],
                layout: WordLayout,
            ) -> std::result::Result<Self, WordsCountError> {
                let mut words = words.to_vec();
                if layout.word_order == Endian::Little {
                    words.reverse();
                }
                let bytes = words
                    .into_iter()
                    .map(|word| match layout.byte_order {
                        Endian::Big => word,
                        Endian::Little => word.swap_bytes(),
                    })
                    .flat_map(u16::to_be_bytes)
                    .collect::<Vec<u8>>();
                let array = bytes.try_into().or(Err(WordsCountError {}))?;
                Ok(<$num_type>::from_be_bytes(array))
            }
        }
    };
}

impl_decode!(i16);
impl_decode!(i32);
impl_decode!(i64);
impl_decode!(u16);
impl_decode!(u32);
impl_decode!(u64);
impl_decode!(f32);
impl_decode!(f64);

/// Encode a value into `Word`s arranged according to a [`WordLayout`].
pub trait Encode {
    fn to_words(self, layout: WordLayout) -> Vec<Word>;
}

macro_rules! impl_encode {
    ($num_type:ty) => {
        impl Encode for $num_type {
            fn to_words(self, layout: WordLayout) -> Vec<Word> {
                let mut words = self
                    .to_be_bytes()
                    .chunks_exact(2)
                    .map(|chunk| u16::from_be_bytes([chunk[0], chunk[1]]))
                    .map(|word| match layout.byte_order {
                        Endian::Big => word,
                        Endian::Little => word.swap_bytes(),
                    })
                    .collect::<Vec<Word>>();
                if layout.word_order == Endian::Little {
                    words.reverse();
                }
                words
            }
        }
    };
}

impl_encode!(i16);
impl_encode!(i32);
impl_encode!(i64);
impl_encode!(u16);
impl_encode!(u32);
impl_encode!(u64);
impl_encode!(f32);
impl_encode!(f64);

/// Encode a canonical value into its Modbus representation.
///
/// Bits are returned as a single word holding `0` or `1`. A 16-bit register is
/// written as is; `layout` applies to 32- and 64-bit values only.
pub fn encode(value: Value, ty: ValueType, width: Width, layout: WordLayout) -> Result<Vec<Word>> {
    if value.value_type() != ty {
        return Err(Error::TypeMismatch {
            expected: ty,
            found: value.value_type(),
        });
    }
    match (value, width) {
        (Value::Bool(b), Width::Bit) => Ok(vec![Word::from(b)]),
        (Value::Int(i), Width::Register(RegisterSize::Bits16)) => {
            let v = i16::try_from(i).map_err(|_| Error::range(i, width))?;
            Ok(vec![v as Word])
        }
        (Value::Int(i), Width::Register(RegisterSize::Bits32)) => {
            let v = i32::try_from(i).map_err(|_| Error::range(i, width))?;
            Ok(v.to_words(layout))
        }
        (Value::Int(i), Width::Register(RegisterSize::Bits64)) => Ok(i.to_words(layout)),
        (Value::Float(x), Width::Register(RegisterSize::Bits32)) => {
            let v = x as f32;
            if x.is_finite() && v.is_infinite() {
                return Err(Error::range(x, width));
            }
            Ok(v.to_words(layout))
        }
        (Value::Float(x), Width::Register(RegisterSize::Bits64)) => Ok(x.to_words(layout)),
        (Value::Float(_), Width::Register(RegisterSize::Bits16)) => Err(Error::Binding(
            "16-bit float registers are not supported".to_owned(),
        )),
        (value, width) => Err(Error::Binding(format!(
            "a {} value cannot be stored in a {width}",
            value.value_type()
        ))),
    }
}

/// Decode the Modbus representation of a variable back into its canonical value.
pub fn decode(words: &[Word], ty: ValueType, width: Width, layout: WordLayout) -> Result<Value> {
    if words.len() != usize::from(width.words()) {
        return Err(Error::Decode(format!(
            "a {width} needs {} word(s), got {}",
            width.words(),
            words.len()
        )));
    }
    let count_error = |_| Error::Decode(format!("malformed {width}"));
    match (ty, width) {
        (ValueType::Bool, Width::Bit) => match words[0] {
            0 => Ok(Value::Bool(false)),
            1 => Ok(Value::Bool(true)),
            other => Err(Error::Decode(format!("bit holds {other}"))),
        },
        (ValueType::Int, Width::Register(RegisterSize::Bits16)) => {
            Ok(Value::Int((words[0] as i16).into()))
        }
        (ValueType::Int, Width::Register(RegisterSize::Bits32)) => Ok(Value::Int(
            i32::from_words(words, layout).map_err(count_error)?.into(),
        )),
        (ValueType::Int, Width::Register(RegisterSize::Bits64)) => Ok(Value::Int(
            i64::from_words(words, layout).map_err(count_error)?,
        )),
        (ValueType::Float, Width::Register(RegisterSize::Bits32)) => Ok(Value::Float(
            f32::from_words(words, layout).map_err(count_error)?.into(),
        )),
        (ValueType::Float, Width::Register(RegisterSize::Bits64)) => Ok(Value::Float(
            f64::from_words(words, layout).map_err(count_error)?,
        )),
        (ty, width) => Err(Error::Decode(format!("a {width} cannot hold a {ty} value"))),
    }
}
