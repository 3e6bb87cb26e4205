//! Core data types shared by the engine and its collaborators

use crate::error::{Result, VdsError};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Element types a dataset can store
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u8)]
pub enum DataType {
    /// Unsigned 8-bit integer
    U8 = 1,
    /// Unsigned 16-bit integer
    U16 = 2,
    /// Unsigned 32-bit integer
    U32 = 3,
    /// Unsigned 64-bit integer
    U64 = 4,
    /// Signed 8-bit integer
    I8 = 5,
    /// Signed 16-bit integer
    I16 = 6,
    /// Signed 32-bit integer
    I32 = 7,
    /// Signed 64-bit integer
    I64 = 8,
    /// 32-bit floating point
    F32 = 9,
    /// 64-bit floating point
    F64 = 10,
}

impl DataType {
    /// Size in bytes of this data type
    pub fn size_in_bytes(&self) -> usize {
        match self {
            DataType::U8 | DataType::I8 => 1,
            DataType::U16 | DataType::I16 => 2,
            DataType::U32 | DataType::I32 | DataType::F32 => 4,
            DataType::U64 | DataType::I64 | DataType::F64 => 8,
        }
    }

    /// Check if this is a floating point type
    pub fn is_float(&self) -> bool {
        matches!(self, DataType::F32 | DataType::F64)
    }
}

impl fmt::Display for DataType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}", self)
    }
}

/// A Rust value type that maps onto a [`DataType`].
///
/// Elements are stored little-endian regardless of the host.
pub trait Element: Copy + Send + Sync + num_traits::Zero + 'static {
    const DATA_TYPE: DataType;

    fn write_le(self, out: &mut [u8]);

    fn read_le(bytes: &[u8]) -> Self;
}

macro_rules! impl_element {
    ($($ty:ty => $dt:ident),* $(,)?) => {
        $(
            impl Element for $ty {
                const DATA_TYPE: DataType = DataType::$dt;

                fn write_le(self, out: &mut [u8]) {
                    out.copy_from_slice(&self.to_le_bytes());
                }

                fn read_le(bytes: &[u8]) -> Self {
                    let mut raw = [0u8; std::mem::size_of::<$ty>()];
                    raw.copy_from_slice(bytes);
                    <$ty>::from_le_bytes(raw)
                }
            }
        )*
    };
}

impl_element!(
    u8 => U8, u16 => U16, u32 => U32, u64 => U64,
    i8 => I8, i16 => I16, i32 => I32, i64 => I64,
    f32 => F32, f64 => F64,
);

/// Access intent of an open file
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Intent {
    ReadOnly,
    ReadWrite,
}

impl Intent {
    pub fn is_writable(&self) -> bool {
        matches!(self, Intent::ReadWrite)
    }
}

/// How unlimited virtual dimensions resolve against absent or short sources
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ViewPolicy {
    /// Stop at the first missing data.
    FirstMissing,
    /// Extend to the last data any source provides.
    #[default]
    LastAvailable,
}

impl ViewPolicy {
    pub fn parse(value: &str) -> Result<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "first_missing" | "first-missing" => Ok(ViewPolicy::FirstMissing),
            "last_available" | "last-available" => Ok(ViewPolicy::LastAvailable),
            other => Err(VdsError::Configuration(format!("Unknown VDS view: {}", other))),
        }
    }
}

/// Per-dataset fill value used for unmapped regions on read
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum FillValue {
    /// No fill value: unmapped bytes of the caller's buffer are left untouched.
    Undefined,
    /// All-zero elements.
    #[default]
    Default,
    /// Little-endian bytes of one element.
    UserDefined(Vec<u8>),
}

impl FillValue {
    /// A user-defined fill value of element type `T`.
    pub fn user<T: Element>(value: T) -> Self {
        let mut raw = vec![0u8; T::DATA_TYPE.size_in_bytes()];
        value.write_le(&mut raw);
        FillValue::UserDefined(raw)
    }

    pub fn is_defined(&self) -> bool {
        !matches!(self, FillValue::Undefined)
    }

    /// Bytes of a single fill element for `dtype`, or `None` when undefined.
    pub fn element_bytes(&self, dtype: DataType) -> Result<Option<Vec<u8>>> {
        match self {
            FillValue::Undefined => Ok(None),
            FillValue::Default => Ok(Some(vec![0u8; dtype.size_in_bytes()])),
            FillValue::UserDefined(raw) => {
                if raw.len() != dtype.size_in_bytes() {
                    return Err(VdsError::BadValue(format!(
                        "Fill value has {} bytes, {} elements need {}",
                        raw.len(),
                        dtype,
                        dtype.size_in_bytes()
                    )));
                }
                Ok(Some(raw.clone()))
            }
        }
    }
}

/// Storage layout classes recorded in a dataset's layout message
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[repr(u8)]
pub enum StorageKind {
    Compact = 0,
    Contiguous = 1,
    Chunked = 2,
    Virtual = 3,
}
