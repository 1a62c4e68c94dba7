use crate::access::schema::Schema;
use crate::access::value::Field;
use crate::error::{StorageError, StorageResult};
use crate::storage::page::PageId;
use std::io::{Read, Write};

/// The physical location of a tuple: its page and slot index.
///
/// Assigned at physical insertion and invalidated at deletion.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct RecordId {
    pub page_id: PageId,
    pub slot: usize,
}

impl RecordId {
    pub fn new(page_id: PageId, slot: usize) -> Self {
        Self { page_id, slot }
    }
}

impl std::fmt::Display for RecordId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.page_id, self.slot)
    }
}

/// A row: ordered field values conforming to a [`Schema`].
///
/// Fields are positional and start out unset; writing a field whose type
/// disagrees with the schema slot is a [`StorageError::SchemaMismatch`].
/// The record id is present only once the tuple has been persisted.
#[derive(Debug, Clone)]
pub struct Tuple {
    schema: Schema,
    fields: Vec<Option<Field>>,
    rid: Option<RecordId>,
}

impl Tuple {
    /// Creates a tuple with every field unset.
    pub fn new(schema: Schema) -> Self {
        let fields = vec![None; schema.len()];
        Self {
            schema,
            fields,
            rid: None,
        }
    }

    /// Builds a fully-set tuple, checking each value against the schema.
    pub fn from_fields(schema: Schema, values: Vec<Field>) -> StorageResult<Self> {
        if values.len() != schema.len() {
            return Err(StorageError::SchemaMismatch(format!(
                "{} values for {} columns",
                values.len(),
                schema.len()
            )));
        }
        let mut tuple = Tuple::new(schema);
        for (i, value) in values.into_iter().enumerate() {
            tuple.set_field(i, value)?;
        }
        Ok(tuple)
    }

    pub fn schema(&self) -> &Schema {
        &self.schema
    }

    /// Sets field `i`, failing on out-of-range index or type disagreement.
    pub fn set_field(&mut self, i: usize, value: Field) -> StorageResult<()> {
        let column = self.schema.column(i).ok_or_else(|| {
            StorageError::SchemaMismatch(format!(
                "field index {} out of range for {} columns",
                i,
                self.schema.len()
            ))
        })?;
        if !value.matches(column.ty) {
            return Err(StorageError::SchemaMismatch(format!(
                "field {} expects {}, got {:?}",
                i, column.ty, value
            )));
        }
        self.fields[i] = Some(value);
        Ok(())
    }

    /// The value of field `i`, or `None` if unset.
    pub fn field(&self, i: usize) -> Option<&Field> {
        self.fields.get(i).and_then(|f| f.as_ref())
    }

    /// True when every field has been written.
    pub fn is_complete(&self) -> bool {
        self.fields.iter().all(|f| f.is_some())
    }

    pub fn record_id(&self) -> Option<RecordId> {
        self.rid
    }

    pub fn set_record_id(&mut self, rid: Option<RecordId>) {
        self.rid = rid;
    }

    /// Encodes all fields in schema order, `schema.tuple_bytes()` bytes total.
    /// Every field must be set.
    pub fn encode<W: Write>(&self, w: &mut W) -> StorageResult<()> {
        for (i, (field, column)) in self.fields.iter().zip(self.schema.columns()).enumerate() {
            let field = field
                .as_ref()
                .ok_or_else(|| StorageError::SchemaMismatch(format!("field {} is unset", i)))?;
            field.encode(column.ty, w)?;
        }
        Ok(())
    }

    /// Decodes a tuple of `schema` from `r`, consuming `schema.tuple_bytes()`
    /// bytes.
    pub fn decode<R: Read>(schema: Schema, r: &mut R) -> StorageResult<Tuple> {
        let mut fields = Vec::with_capacity(schema.len());
        for column in schema.columns() {
            fields.push(Some(Field::decode(column.ty, r)?));
        }
        Ok(Tuple {
            schema,
            fields,
            rid: None,
        })
    }
}

/// Value equality: structural schema equality plus field-by-field equality.
/// The record id is a physical property and does not participate.
impl PartialEq for Tuple {
    fn eq(&self, other: &Self) -> bool {
        self.schema == other.schema && self.fields == other.fields
    }
}

impl Eq for Tuple {}

impl std::fmt::Display for Tuple {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        for (i, field) in self.fields.iter().enumerate() {
            if i > 0 {
                write!(f, "\t")?;
            }
            match field {
                Some(v) => write!(f, "{}", v)?,
                None => write!(f, "<unset>")?,
            }
        }
        Ok(())
    }
}
