use crate::access::schema::Schema;
use crate::access::tuple::{RecordId, Tuple};
use crate::error::{StorageError, StorageResult};
use crate::storage::page::{PageId, PAGE_SIZE};
use crate::transaction::TransactionId;
use std::io::Cursor;

/// A decoded 4096-byte slotted page.
///
/// Layout, bit-exact:
/// - bytes `0..ceil(slot_count/8)`: occupancy bitmap, bit `i` (LSB-first
///   within each byte) covers slot `i`, 1 = occupied;
/// - then `slot_count` fixed-size tuple records in schema field order;
///   vacant slots and trailing padding are zero-filled.
///
/// `slot_count` is the largest n with `n * tuple_bytes + ceil(n/8) <= 4096`.
///
/// Beyond the slot data the page carries its transient state: the dirty
/// flag with the owning transaction, and the before-image byte snapshot
/// used to undo uncommitted changes on abort.
pub struct HeapPage {
    pid: PageId,
    schema: Schema,
    bitmap: Vec<u8>,
    slots: Vec<Option<Tuple>>,
    dirty: Option<TransactionId>,
    before_image: Vec<u8>,
}

/// Number of tuple slots a page of the given schema holds.
pub fn slot_count(schema: &Schema) -> usize {
    (PAGE_SIZE * 8) / (schema.tuple_bytes() * 8 + 1)
}

fn header_bytes(slot_count: usize) -> usize {
    slot_count.div_ceil(8)
}

impl HeapPage {
    /// Creates an empty page. An empty page serializes to all zeroes.
    pub fn new(pid: PageId, schema: Schema) -> Self {
        let n = slot_count(&schema);
        Self {
            pid,
            schema,
            bitmap: vec![0u8; header_bytes(n)],
            slots: (0..n).map(|_| None).collect(),
            dirty: None,
            before_image: vec![0u8; PAGE_SIZE],
        }
    }

    /// Decodes a page from its on-disk bytes. The snapshot becomes the
    /// page's before-image.
    pub fn from_bytes(pid: PageId, schema: Schema, bytes: &[u8]) -> StorageResult<Self> {
        if bytes.len() != PAGE_SIZE {
            return Err(StorageError::Io(std::io::Error::new(
                std::io::ErrorKind::InvalidData,
                format!("page must be {} bytes, got {}", PAGE_SIZE, bytes.len()),
            )));
        }
        let (bitmap, slots) = decode_slots(pid, &schema, bytes)?;
        Ok(Self {
            pid,
            schema,
            bitmap,
            slots,
            dirty: None,
            before_image: bytes.to_vec(),
        })
    }

    /// Encodes the page into exactly [`PAGE_SIZE`] bytes.
    pub fn to_bytes(&self) -> StorageResult<Vec<u8>> {
        let mut buf = vec![0u8; PAGE_SIZE];
        buf[..self.bitmap.len()].copy_from_slice(&self.bitmap);

        let tuple_bytes = self.schema.tuple_bytes();
        let header = self.bitmap.len();
        for (i, slot) in self.slots.iter().enumerate() {
            if let Some(tuple) = slot {
                let start = header + i * tuple_bytes;
                let mut cursor = Cursor::new(&mut buf[start..start + tuple_bytes]);
                tuple.encode(&mut cursor)?;
            }
        }
        Ok(buf)
    }

    pub fn page_id(&self) -> PageId {
        self.pid
    }

    pub fn schema(&self) -> &Schema {
        &self.schema
    }

    pub fn slot_count(&self) -> usize {
        self.slots.len()
    }

    /// Number of vacant slots.
    pub fn free_slots(&self) -> usize {
        self.slots.iter().filter(|s| s.is_none()).count()
    }

    pub fn is_occupied(&self, slot: usize) -> bool {
        slot < self.slots.len() && self.bit(slot)
    }

    /// The tuple at `slot`, if occupied.
    pub fn tuple(&self, slot: usize) -> Option<&Tuple> {
        self.slots.get(slot).and_then(|s| s.as_ref())
    }

    /// Occupied tuples in slot-index order.
    pub fn iter(&self) -> impl Iterator<Item = &Tuple> {
        self.slots.iter().filter_map(|s| s.as_ref())
    }

    /// Places `tuple` into the first vacant slot, assigning its record id.
    ///
    /// The tuple's schema must structurally equal the page's and every
    /// field must be set.
    pub fn insert_tuple(&mut self, mut tuple: Tuple) -> StorageResult<RecordId> {
        if tuple.schema() != &self.schema {
            return Err(StorageError::SchemaMismatch(format!(
                "tuple schema {} does not match page schema {}",
                tuple.schema(),
                self.schema
            )));
        }
        if !tuple.is_complete() {
            return Err(StorageError::SchemaMismatch(
                "cannot insert a tuple with unset fields".into(),
            ));
        }
        let slot = self
            .slots
            .iter()
            .position(|s| s.is_none())
            .ok_or(StorageError::PageFull(self.pid))?;

        let rid = RecordId::new(self.pid, slot);
        tuple.set_record_id(Some(rid));
        self.set_bit(slot, true);
        self.slots[slot] = Some(tuple);
        Ok(rid)
    }

    /// Clears the slot named by `rid`.
    pub fn delete_tuple(&mut self, rid: RecordId) -> StorageResult<()> {
        if rid.page_id != self.pid {
            return Err(StorageError::TupleNotFound {
                page_id: rid.page_id,
                slot: rid.slot,
            });
        }
        match self.slots.get_mut(rid.slot) {
            Some(slot @ Some(_)) => {
                *slot = None;
                self.set_bit(rid.slot, false);
                Ok(())
            }
            _ => Err(StorageError::TupleNotFound {
                page_id: rid.page_id,
                slot: rid.slot,
            }),
        }
    }

    /// The transaction that dirtied this page, if any.
    pub fn dirty_owner(&self) -> Option<TransactionId> {
        self.dirty
    }

    pub fn is_dirty(&self) -> bool {
        self.dirty.is_some()
    }

    pub fn mark_dirty(&mut self, tid: TransactionId) {
        self.dirty = Some(tid);
    }

    pub fn clear_dirty(&mut self) {
        self.dirty = None;
    }

    /// Re-captures the before-image from the current contents. Called after
    /// a successful flush: subsequent aborts roll back to this state.
    pub fn set_before_image(&mut self) -> StorageResult<()> {
        self.before_image = self.to_bytes()?;
        Ok(())
    }

    /// Byte snapshot taken when the page was last read, created, or flushed.
    pub fn before_image(&self) -> &[u8] {
        &self.before_image
    }

    /// Replaces the page contents with the before-image and clears the
    /// dirty flag. Used by abort; touches no disk state.
    pub fn restore_before_image(&mut self) -> StorageResult<()> {
        let (bitmap, slots) = decode_slots(self.pid, &self.schema, &self.before_image)?;
        self.bitmap = bitmap;
        self.slots = slots;
        self.dirty = None;
        Ok(())
    }

    fn bit(&self, slot: usize) -> bool {
        self.bitmap[slot / 8] >> (slot % 8) & 1 == 1
    }

    fn set_bit(&mut self, slot: usize, occupied: bool) {
        if occupied {
            self.bitmap[slot / 8] |= 1 << (slot % 8);
        } else {
            self.bitmap[slot / 8] &= !(1 << (slot % 8));
        }
    }
}

fn decode_slots(
    pid: PageId,
    schema: &Schema,
    bytes: &[u8],
) -> StorageResult<(Vec<u8>, Vec<Option<Tuple>>)> {
    let n = slot_count(schema);
    let header = header_bytes(n);
    let tuple_bytes = schema.tuple_bytes();
    let bitmap = bytes[..header].to_vec();

    let mut slots = Vec::with_capacity(n);
    for i in 0..n {
        let occupied = bitmap[i / 8] >> (i % 8) & 1 == 1;
        if occupied {
            let start = header + i * tuple_bytes;
            let mut cursor = Cursor::new(&bytes[start..start + tuple_bytes]);
            let mut tuple = Tuple::decode(schema.clone(), &mut cursor)?;
            tuple.set_record_id(Some(RecordId::new(pid, i)));
            slots.push(Some(tuple));
        } else {
            slots.push(None);
        }
    }
    Ok((bitmap, slots))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::access::schema::Column;
    use crate::access::value::{DataType, Field};

    fn schema() -> Schema {
        // 4 + (4 + 4) = 12 bytes per tuple
        Schema::new(vec![
            Column::new("id", DataType::Int),
            Column::new("tag", DataType::Varchar(4)),
        ])
    }

    fn pid() -> PageId {
        PageId::new(1, 0)
    }

    fn tuple(id: i32, tag: &str) -> Tuple {
        Tuple::from_fields(schema(), vec![Field::Int(id), Field::Varchar(tag.into())]).unwrap()
    }

    #[test]
    fn test_slot_count_arithmetic() {
        // 12-byte tuples: n = 4096*8 / (12*8 + 1) = 337,
        // 337 * 12 + ceil(337/8) = 4044 + 43 = 4087 <= 4096.
        let n = slot_count(&schema());
        assert_eq!(n, 337);
        assert!(n * schema().tuple_bytes() + n.div_ceil(8) <= PAGE_SIZE);
        // One more slot would overflow the page.
        assert!((n + 1) * schema().tuple_bytes() + (n + 1).div_ceil(8) > PAGE_SIZE);
    }

    #[test]
    fn test_empty_page_is_all_zeroes() -> StorageResult<()> {
        let page = HeapPage::new(pid(), schema());
        assert_eq!(page.free_slots(), page.slot_count());
        assert!(page.to_bytes()?.iter().all(|&b| b == 0));
        Ok(())
    }

    #[test]
    fn test_insert_assigns_record_id() -> StorageResult<()> {
        let mut page = HeapPage::new(pid(), schema());
        let rid0 = page.insert_tuple(tuple(1, "a"))?;
        let rid1 = page.insert_tuple(tuple(2, "b"))?;

        assert_eq!(rid0, RecordId::new(pid(), 0));
        assert_eq!(rid1, RecordId::new(pid(), 1));
        assert!(page.is_occupied(0));
        assert!(page.is_occupied(1));
        assert_eq!(page.tuple(0).unwrap().field(0), Some(&Field::Int(1)));
        assert_eq!(page.tuple(0).unwrap().record_id(), Some(rid0));
        Ok(())
    }

    #[test]
    fn test_insert_reuses_freed_slot() -> StorageResult<()> {
        let mut page = HeapPage::new(pid(), schema());
        let rid0 = page.insert_tuple(tuple(1, "a"))?;
        page.insert_tuple(tuple(2, "b"))?;
        page.delete_tuple(rid0)?;

        // First free slot wins.
        let rid = page.insert_tuple(tuple(3, "c"))?;
        assert_eq!(rid.slot, 0);
        Ok(())
    }

    #[test]
    fn test_delete_restores_bitmap() -> StorageResult<()> {
        let mut page = HeapPage::new(pid(), schema());
        let before = page.to_bytes()?[..page.bitmap.len()].to_vec();

        let rid = page.insert_tuple(tuple(1, "a"))?;
        assert_ne!(page.to_bytes()?[..page.bitmap.len()].to_vec(), before);

        page.delete_tuple(rid)?;
        assert_eq!(page.to_bytes()?[..page.bitmap.len()].to_vec(), before);
        assert!(!page.is_occupied(rid.slot));
        Ok(())
    }

    #[test]
    fn test_delete_vacant_slot_fails() {
        let mut page = HeapPage::new(pid(), schema());
        let err = page.delete_tuple(RecordId::new(pid(), 3));
        assert!(matches!(err, Err(StorageError::TupleNotFound { .. })));
    }

    #[test]
    fn test_delete_foreign_rid_fails() -> StorageResult<()> {
        let mut page = HeapPage::new(pid(), schema());
        page.insert_tuple(tuple(1, "a"))?;
        let foreign = RecordId::new(PageId::new(9, 9), 0);
        assert!(matches!(
            page.delete_tuple(foreign),
            Err(StorageError::TupleNotFound { .. })
        ));
        Ok(())
    }

    #[test]
    fn test_insert_until_full() -> StorageResult<()> {
        let mut page = HeapPage::new(pid(), schema());
        let n = page.slot_count();
        for i in 0..n {
            page.insert_tuple(tuple(i as i32, "x"))?;
        }
        assert_eq!(page.free_slots(), 0);
        assert!(matches!(
            page.insert_tuple(tuple(-1, "y")),
            Err(StorageError::PageFull(_))
        ));
        Ok(())
    }

    #[test]
    fn test_schema_mismatch_rejected() {
        let mut page = HeapPage::new(pid(), schema());
        let other = Schema::new(vec![Column::new("only", DataType::Int)]);
        let t = Tuple::from_fields(other, vec![Field::Int(1)]).unwrap();
        assert!(matches!(
            page.insert_tuple(t),
            Err(StorageError::SchemaMismatch(_))
        ));
    }

    #[test]
    fn test_codec_round_trip() -> StorageResult<()> {
        let mut page = HeapPage::new(pid(), schema());
        page.insert_tuple(tuple(10, "aa"))?;
        let rid = page.insert_tuple(tuple(20, "bb"))?;
        page.insert_tuple(tuple(30, "cc"))?;
        page.delete_tuple(rid)?;

        let bytes = page.to_bytes()?;
        assert_eq!(bytes.len(), PAGE_SIZE);

        let decoded = HeapPage::from_bytes(pid(), schema(), &bytes)?;
        assert!(decoded.is_occupied(0));
        assert!(!decoded.is_occupied(1));
        assert!(decoded.is_occupied(2));
        assert_eq!(decoded.tuple(0).unwrap(), &tuple(10, "aa"));
        assert_eq!(decoded.tuple(2).unwrap(), &tuple(30, "cc"));
        assert_eq!(
            decoded.tuple(2).unwrap().record_id(),
            Some(RecordId::new(pid(), 2))
        );
        Ok(())
    }

    #[test]
    fn test_iter_slot_order() -> StorageResult<()> {
        let mut page = HeapPage::new(pid(), schema());
        page.insert_tuple(tuple(1, "a"))?;
        let rid = page.insert_tuple(tuple(2, "b"))?;
        page.insert_tuple(tuple(3, "c"))?;
        page.delete_tuple(rid)?;

        let ids: Vec<i32> = page
            .iter()
            .map(|t| match t.field(0) {
                Some(Field::Int(v)) => *v,
                _ => panic!("expected int"),
            })
            .collect();
        assert_eq!(ids, vec![1, 3]);
        Ok(())
    }

    #[test]
    fn test_restore_before_image() -> StorageResult<()> {
        let mut page = HeapPage::new(pid(), schema());
        let rid = page.insert_tuple(tuple(1, "a"))?;
        page.set_before_image()?;

        let tid = TransactionId::new(7);
        page.insert_tuple(tuple(2, "b"))?;
        page.delete_tuple(rid)?;
        page.mark_dirty(tid);
        assert_eq!(page.dirty_owner(), Some(tid));

        page.restore_before_image()?;
        assert!(page.is_occupied(0));
        assert!(!page.is_occupied(1));
        assert_eq!(page.tuple(0).unwrap(), &tuple(1, "a"));
        assert_eq!(page.dirty_owner(), None);
        Ok(())
    }

    #[test]
    fn test_before_image_tracks_flush_not_every_write() -> StorageResult<()> {
        let mut page = HeapPage::new(pid(), schema());
        page.insert_tuple(tuple(1, "a"))?;

        // Not yet flushed: rollback goes all the way to the empty page.
        page.restore_before_image()?;
        assert_eq!(page.free_slots(), page.slot_count());
        Ok(())
    }
}
