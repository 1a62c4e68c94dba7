use crate::error::{StorageError, StorageResult};
use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use std::io::{Read, Write};

/// Data types supported by the database.
///
/// Every type has a fixed on-disk length so that tuple slots within a page
/// are uniformly sized. Integers are stored as little-endian `i32`. A
/// `Varchar(n)` occupies a fixed region of `4 + n` bytes: a little-endian
/// length prefix followed by `n` capacity bytes, unused tail zero-filled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DataType {
    Int,
    Varchar(usize),
}

impl DataType {
    /// On-disk byte length of a field of this type.
    pub fn byte_len(&self) -> usize {
        match self {
            DataType::Int => 4,
            DataType::Varchar(capacity) => 4 + capacity,
        }
    }
}

impl std::fmt::Display for DataType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DataType::Int => write!(f, "INT"),
            DataType::Varchar(n) => write!(f, "VARCHAR({})", n),
        }
    }
}

/// A single field value within a tuple.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Field {
    Int(i32),
    Varchar(String),
}

impl Field {
    /// The data type this value belongs to, with `Varchar` capacity taken
    /// from the string's current length (compatibility is checked against
    /// the schema's declared capacity, not this).
    pub fn matches(&self, ty: DataType) -> bool {
        match (self, ty) {
            (Field::Int(_), DataType::Int) => true,
            (Field::Varchar(s), DataType::Varchar(capacity)) => s.len() <= capacity,
            _ => false,
        }
    }

    /// Encodes this field into `w` using exactly `ty.byte_len()` bytes.
    pub fn encode<W: Write>(&self, ty: DataType, w: &mut W) -> StorageResult<()> {
        if !self.matches(ty) {
            return Err(StorageError::SchemaMismatch(format!(
                "cannot encode {:?} as {}",
                self, ty
            )));
        }
        match (self, ty) {
            (Field::Int(v), DataType::Int) => w.write_i32::<LittleEndian>(*v)?,
            (Field::Varchar(s), DataType::Varchar(capacity)) => {
                w.write_u32::<LittleEndian>(s.len() as u32)?;
                w.write_all(s.as_bytes())?;
                let pad = capacity - s.len();
                w.write_all(&vec![0u8; pad])?;
            }
            _ => unreachable!("compatibility already checked"),
        }
        Ok(())
    }

    /// Decodes a field of type `ty`, consuming exactly `ty.byte_len()` bytes.
    pub fn decode<R: Read>(ty: DataType, r: &mut R) -> StorageResult<Field> {
        match ty {
            DataType::Int => Ok(Field::Int(r.read_i32::<LittleEndian>()?)),
            DataType::Varchar(capacity) => {
                let len = r.read_u32::<LittleEndian>()? as usize;
                let mut region = vec![0u8; capacity];
                r.read_exact(&mut region)?;
                if len > capacity {
                    return Err(StorageError::Io(std::io::Error::new(
                        std::io::ErrorKind::InvalidData,
                        format!("varchar length {} exceeds capacity {}", len, capacity),
                    )));
                }
                region.truncate(len);
                let s = String::from_utf8(region).map_err(|e| {
                    StorageError::Io(std::io::Error::new(std::io::ErrorKind::InvalidData, e))
                })?;
                Ok(Field::Varchar(s))
            }
        }
    }
}

impl std::fmt::Display for Field {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Field::Int(v) => write!(f, "{}", v),
            Field::Varchar(s) => write!(f, "{}", s),
        }
    }
}
