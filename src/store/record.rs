//! Fixed-size record layouts. All integers are big-endian; 4-byte links use
//! [`NO_LINK`](crate::types::NO_LINK) for "no next".

use std::fmt::Debug;
use std::hash::Hash;

use smallvec::SmallVec;

use crate::store::property::PropertyType;
use crate::types::{
    decode_link, encode_link, BlockId, NodeId, PropertyId, PropertyKeyId, RelId, RelTypeId,
    Result, StoreError,
};

/// Version string written after every store's type descriptor.
pub const STORE_VERSION: &str = "v0.1";

const IN_USE: u8 = 0x1;

/// Byte layout and identity of one kind of fixed-size record.
pub trait RecordFormat: Send + Sync + 'static {
    /// Typed id of the record.
    type Id: Copy + Debug + Eq + Hash + Into<u64> + From<u64> + Send + Sync;
    /// Decoded record.
    type Record: Clone + Debug + PartialEq + Send + Sync;

    /// Type descriptor written before the version at the end of the file.
    const TYPE_DESCRIPTOR: &'static str;
    /// Encoded size of one record.
    const RECORD_SIZE: usize;

    /// Decodes the record stored at `id`. Unused slots decode with
    /// `in_use == false`.
    fn decode(id: Self::Id, src: &[u8]) -> Result<Self::Record>;
    /// Encodes `record` into exactly [`Self::RECORD_SIZE`] bytes.
    fn encode(record: &Self::Record, dst: &mut [u8]);
    /// Id of `record`.
    fn id(record: &Self::Record) -> Self::Id;
    /// In-use flag of `record`.
    fn in_use(record: &Self::Record) -> bool;
}

/// True if the in-use bit of an encoded record is set.
pub fn raw_in_use(src: &[u8]) -> bool {
    src.first().map(|b| b & IN_USE != 0).unwrap_or(false)
}

fn flag(in_use: bool) -> u8 {
    if in_use {
        IN_USE
    } else {
        0
    }
}

fn u32_at(src: &[u8], at: usize) -> u32 {
    let mut arr = [0u8; 4];
    arr.copy_from_slice(&src[at..at + 4]);
    u32::from_be_bytes(arr)
}

fn u64_at(src: &[u8], at: usize) -> u64 {
    let mut arr = [0u8; 8];
    arr.copy_from_slice(&src[at..at + 8]);
    u64::from_be_bytes(arr)
}

fn put_u32(dst: &mut [u8], at: usize, value: u32) {
    dst[at..at + 4].copy_from_slice(&value.to_be_bytes());
}

fn put_u64(dst: &mut [u8], at: usize, value: u64) {
    dst[at..at + 8].copy_from_slice(&value.to_be_bytes());
}

fn required_link<T: From<u64>>(raw: u32, what: &'static str) -> Result<T> {
    decode_link(raw).ok_or(StoreError::Corruption(what))
}

/// Node record: head of the relationship chain and the property chain.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct NodeRecord {
    /// Slot id.
    pub id: NodeId,
    /// In-use flag.
    pub in_use: bool,
    /// First relationship in this node's chain.
    pub next_rel: Option<RelId>,
    /// First property.
    pub next_prop: Option<PropertyId>,
}

impl NodeRecord {
    /// A new in-use node with empty chains.
    pub fn new(id: NodeId) -> Self {
        Self {
            id,
            in_use: true,
            next_rel: None,
            next_prop: None,
        }
    }
}

/// Format of [`NodeRecord`].
pub struct NodeFormat;

impl RecordFormat for NodeFormat {
    type Id = NodeId;
    type Record = NodeRecord;
    const TYPE_DESCRIPTOR: &'static str = "NodeStore";
    const RECORD_SIZE: usize = 9;

    fn decode(id: NodeId, src: &[u8]) -> Result<NodeRecord> {
        Ok(NodeRecord {
            id,
            in_use: raw_in_use(src),
            next_rel: decode_link(u32_at(src, 1)),
            next_prop: decode_link(u32_at(src, 5)),
        })
    }

    fn encode(record: &NodeRecord, dst: &mut [u8]) {
        dst[0] = flag(record.in_use);
        put_u32(dst, 1, encode_link(record.next_rel));
        put_u32(dst, 5, encode_link(record.next_prop));
    }

    fn id(record: &NodeRecord) -> NodeId {
        record.id
    }

    fn in_use(record: &NodeRecord) -> bool {
        record.in_use
    }
}

/// Relationship record. Each relationship sits in two doubly linked chains,
/// one per endpoint node.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RelationshipRecord {
    /// Slot id.
    pub id: RelId,
    /// In-use flag.
    pub in_use: bool,
    /// Start node.
    pub first_node: NodeId,
    /// End node.
    pub second_node: NodeId,
    /// Relationship type.
    pub rel_type: RelTypeId,
    /// Previous relationship in the first node's chain.
    pub first_prev: Option<RelId>,
    /// Next relationship in the first node's chain.
    pub first_next: Option<RelId>,
    /// Previous relationship in the second node's chain.
    pub second_prev: Option<RelId>,
    /// Next relationship in the second node's chain.
    pub second_next: Option<RelId>,
    /// First property.
    pub next_prop: Option<PropertyId>,
}

impl RelationshipRecord {
    /// A new in-use relationship with unlinked chains.
    pub fn new(id: RelId, first_node: NodeId, second_node: NodeId, rel_type: RelTypeId) -> Self {
        Self {
            id,
            in_use: true,
            first_node,
            second_node,
            rel_type,
            first_prev: None,
            first_next: None,
            second_prev: None,
            second_next: None,
            next_prop: None,
        }
    }

    /// Previous link in the chain belonging to `node`.
    pub fn prev_for(&self, node: NodeId) -> Option<RelId> {
        if self.first_node == node {
            self.first_prev
        } else {
            self.second_prev
        }
    }

    /// Next link in the chain belonging to `node`.
    pub fn next_for(&self, node: NodeId) -> Option<RelId> {
        if self.first_node == node {
            self.first_next
        } else {
            self.second_next
        }
    }

    /// Sets the previous link in `node`'s chain (both chains for a loop).
    pub fn set_prev_for(&mut self, node: NodeId, prev: Option<RelId>) {
        if self.first_node == node {
            self.first_prev = prev;
        }
        if self.second_node == node {
            self.second_prev = prev;
        }
    }

    /// Sets the next link in `node`'s chain (both chains for a loop).
    pub fn set_next_for(&mut self, node: NodeId, next: Option<RelId>) {
        if self.first_node == node {
            self.first_next = next;
        }
        if self.second_node == node {
            self.second_next = next;
        }
    }
}

/// Format of [`RelationshipRecord`].
pub struct RelationshipFormat;

impl RecordFormat for RelationshipFormat {
    type Id = RelId;
    type Record = RelationshipRecord;
    const TYPE_DESCRIPTOR: &'static str = "RelationshipStore";
    const RECORD_SIZE: usize = 33;

    fn decode(id: RelId, src: &[u8]) -> Result<RelationshipRecord> {
        let in_use = raw_in_use(src);
        if !in_use {
            return Ok(RelationshipRecord {
                in_use: false,
                ..RelationshipRecord::new(id, NodeId(0), NodeId(0), RelTypeId(0))
            });
        }
        Ok(RelationshipRecord {
            id,
            in_use,
            first_node: required_link(u32_at(src, 1), "relationship without first node")?,
            second_node: required_link(u32_at(src, 5), "relationship without second node")?,
            rel_type: required_link(u32_at(src, 9), "relationship without type")?,
            first_prev: decode_link(u32_at(src, 13)),
            first_next: decode_link(u32_at(src, 17)),
            second_prev: decode_link(u32_at(src, 21)),
            second_next: decode_link(u32_at(src, 25)),
            next_prop: decode_link(u32_at(src, 29)),
        })
    }

    fn encode(record: &RelationshipRecord, dst: &mut [u8]) {
        dst[0] = flag(record.in_use);
        put_u32(dst, 1, encode_link(Some(record.first_node)));
        put_u32(dst, 5, encode_link(Some(record.second_node)));
        put_u32(dst, 9, encode_link(Some(record.rel_type)));
        put_u32(dst, 13, encode_link(record.first_prev));
        put_u32(dst, 17, encode_link(record.first_next));
        put_u32(dst, 21, encode_link(record.second_prev));
        put_u32(dst, 25, encode_link(record.second_next));
        put_u32(dst, 29, encode_link(record.next_prop));
    }

    fn id(record: &RelationshipRecord) -> RelId {
        record.id
    }

    fn in_use(record: &RelationshipRecord) -> bool {
        record.in_use
    }
}

/// Block of a dynamic (string, array or name) store.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DynamicRecord {
    /// Block id.
    pub id: BlockId,
    /// In-use flag.
    pub in_use: bool,
    /// Next block of the chain.
    pub next_block: Option<BlockId>,
    /// Payload bytes held by this block.
    pub data: Vec<u8>,
}

impl DynamicRecord {
    /// An unused block, as written when a chain is deleted.
    pub fn unused(id: BlockId) -> Self {
        Self {
            id,
            in_use: false,
            next_block: None,
            data: Vec::new(),
        }
    }

    /// Encodes into `9 + block_size` bytes.
    pub fn encode(&self, block_size: usize, dst: &mut [u8]) -> Result<()> {
        if self.data.len() > block_size {
            return Err(StoreError::Invalid("dynamic block data exceeds block size"));
        }
        dst[0] = flag(self.in_use);
        put_u32(dst, 1, self.data.len() as u32);
        put_u32(dst, 5, encode_link(self.next_block));
        dst[9..9 + self.data.len()].copy_from_slice(&self.data);
        dst[9 + self.data.len()..].fill(0);
        Ok(())
    }

    /// Decodes a block of `9 + block_size` bytes.
    pub fn decode(id: BlockId, block_size: usize, src: &[u8]) -> Result<Self> {
        let in_use = raw_in_use(src);
        if !in_use {
            return Ok(Self::unused(id));
        }
        let len = u32_at(src, 1) as usize;
        if len > block_size {
            return Err(StoreError::Corruption("dynamic block length exceeds block size"));
        }
        Ok(Self {
            id,
            in_use,
            next_block: decode_link(u32_at(src, 5)),
            data: src[9..9 + len].to_vec(),
        })
    }
}

/// Blocks written together with a record that owns a dynamic chain.
pub type DynamicBlocks = SmallVec<[DynamicRecord; 2]>;

/// Property record. Inline values live in `value`; strings and arrays store
/// the first block id of their chain there.
#[derive(Clone, Debug, PartialEq)]
pub struct PropertyRecord {
    /// Slot id.
    pub id: PropertyId,
    /// In-use flag.
    pub in_use: bool,
    /// Value type; `None` only for unused records.
    pub prop_type: Option<PropertyType>,
    /// Property key.
    pub key: PropertyKeyId,
    /// Inline value bits or first block id.
    pub value: u64,
    /// Previous property of the owning entity.
    pub prev_prop: Option<PropertyId>,
    /// Next property of the owning entity.
    pub next_prop: Option<PropertyId>,
    /// Dynamic blocks changed together with this record. Not part of the
    /// fixed-size encoding; carried by commands only.
    pub value_blocks: DynamicBlocks,
}

impl PropertyRecord {
    /// An unused record for `id`.
    pub fn unused(id: PropertyId) -> Self {
        Self {
            id,
            in_use: false,
            prop_type: None,
            key: PropertyKeyId(0),
            value: 0,
            prev_prop: None,
            next_prop: None,
            value_blocks: DynamicBlocks::new(),
        }
    }
}

/// Format of [`PropertyRecord`].
pub struct PropertyFormat;

impl RecordFormat for PropertyFormat {
    type Id = PropertyId;
    type Record = PropertyRecord;
    const TYPE_DESCRIPTOR: &'static str = "PropertyStore";
    const RECORD_SIZE: usize = 25;

    fn decode(id: PropertyId, src: &[u8]) -> Result<PropertyRecord> {
        if !raw_in_use(src) {
            return Ok(PropertyRecord::unused(id));
        }
        let code = u32_at(src, 1);
        let prop_type = PropertyType::from_code(code)
            .ok_or(StoreError::Corruption("unknown property type"))?;
        Ok(PropertyRecord {
            id,
            in_use: true,
            prop_type: Some(prop_type),
            key: required_link(u32_at(src, 5), "property without key")?,
            value: u64_at(src, 9),
            prev_prop: decode_link(u32_at(src, 17)),
            next_prop: decode_link(u32_at(src, 21)),
            value_blocks: DynamicBlocks::new(),
        })
    }

    fn encode(record: &PropertyRecord, dst: &mut [u8]) {
        dst[0] = flag(record.in_use);
        put_u32(dst, 1, record.prop_type.map(PropertyType::code).unwrap_or(0));
        put_u32(dst, 5, encode_link(Some(record.key)));
        put_u64(dst, 9, record.value);
        put_u32(dst, 17, encode_link(record.prev_prop));
        put_u32(dst, 21, encode_link(record.next_prop));
    }

    fn id(record: &PropertyRecord) -> PropertyId {
        record.id
    }

    fn in_use(record: &PropertyRecord) -> bool {
        record.in_use
    }
}

/// Property key record: interned key name plus a usage counter.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PropertyKeyRecord {
    /// Slot id.
    pub id: PropertyKeyId,
    /// In-use flag.
    pub in_use: bool,
    /// Number of properties using this key.
    pub prop_count: u32,
    /// First block of the key name.
    pub key_block: Option<BlockId>,
    /// Name blocks written together with this record.
    pub name_blocks: DynamicBlocks,
}

/// Format of [`PropertyKeyRecord`].
pub struct PropertyKeyFormat;

impl RecordFormat for PropertyKeyFormat {
    type Id = PropertyKeyId;
    type Record = PropertyKeyRecord;
    const TYPE_DESCRIPTOR: &'static str = "PropertyIndexStore";
    const RECORD_SIZE: usize = 9;

    fn decode(id: PropertyKeyId, src: &[u8]) -> Result<PropertyKeyRecord> {
        Ok(PropertyKeyRecord {
            id,
            in_use: raw_in_use(src),
            prop_count: u32_at(src, 1),
            key_block: decode_link(u32_at(src, 5)),
            name_blocks: DynamicBlocks::new(),
        })
    }

    fn encode(record: &PropertyKeyRecord, dst: &mut [u8]) {
        dst[0] = flag(record.in_use);
        put_u32(dst, 1, record.prop_count);
        put_u32(dst, 5, encode_link(record.key_block));
    }

    fn id(record: &PropertyKeyRecord) -> PropertyKeyId {
        record.id
    }

    fn in_use(record: &PropertyKeyRecord) -> bool {
        record.in_use
    }
}

/// Relationship type record: interned type name.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RelationshipTypeRecord {
    /// Slot id.
    pub id: RelTypeId,
    /// In-use flag.
    pub in_use: bool,
    /// First block of the type name.
    pub name_block: Option<BlockId>,
    /// Name blocks written together with this record.
    pub name_blocks: DynamicBlocks,
}

/// Format of [`RelationshipTypeRecord`].
pub struct RelationshipTypeFormat;

impl RecordFormat for RelationshipTypeFormat {
    type Id = RelTypeId;
    type Record = RelationshipTypeRecord;
    const TYPE_DESCRIPTOR: &'static str = "RelationshipTypeStore";
    const RECORD_SIZE: usize = 5;

    fn decode(id: RelTypeId, src: &[u8]) -> Result<RelationshipTypeRecord> {
        Ok(RelationshipTypeRecord {
            id,
            in_use: raw_in_use(src),
            name_block: decode_link(u32_at(src, 1)),
            name_blocks: DynamicBlocks::new(),
        })
    }

    fn encode(record: &RelationshipTypeRecord, dst: &mut [u8]) {
        dst[0] = flag(record.in_use);
        put_u32(dst, 1, encode_link(record.name_block));
    }

    fn id(record: &RelationshipTypeRecord) -> RelTypeId {
        record.id
    }

    fn in_use(record: &RelationshipTypeRecord) -> bool {
        record.in_use
    }
}

/// Meta store record: a single `u64` value at a fixed slot.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct MetaRecord {
    /// Slot.
    pub id: u64,
    /// In-use flag.
    pub in_use: bool,
    /// Stored value.
    pub value: u64,
}

/// Format of [`MetaRecord`].
pub struct MetaFormat;

impl RecordFormat for MetaFormat {
    type Id = u64;
    type Record = MetaRecord;
    const TYPE_DESCRIPTOR: &'static str = "MetaStore";
    const RECORD_SIZE: usize = 9;

    fn decode(id: u64, src: &[u8]) -> Result<MetaRecord> {
        Ok(MetaRecord {
            id,
            in_use: raw_in_use(src),
            value: u64_at(src, 1),
        })
    }

    fn encode(record: &MetaRecord, dst: &mut [u8]) {
        dst[0] = flag(record.in_use);
        put_u64(dst, 1, record.value);
    }

    fn id(record: &MetaRecord) -> u64 {
        record.id
    }

    fn in_use(record: &MetaRecord) -> bool {
        record.in_use
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::NO_LINK;

    #[test]
    fn node_layout_uses_sentinel_for_missing_links() {
        let mut buf = [0u8; NodeFormat::RECORD_SIZE];
        let rec = NodeRecord {
            next_rel: Some(RelId(3)),
            ..NodeRecord::new(NodeId(1))
        };
        NodeFormat::encode(&rec, &mut buf);
        assert_eq!(buf[0], 1);
        assert_eq!(&buf[1..5], &3u32.to_be_bytes());
        assert_eq!(&buf[5..9], &NO_LINK.to_be_bytes());
        assert_eq!(NodeFormat::decode(NodeId(1), &buf).unwrap(), rec);
    }

    #[test]
    fn relationship_chain_helpers_follow_endpoint() {
        let mut rel = RelationshipRecord::new(RelId(0), NodeId(1), NodeId(2), RelTypeId(0));
        rel.set_next_for(NodeId(2), Some(RelId(9)));
        rel.set_prev_for(NodeId(1), Some(RelId(4)));
        assert_eq!(rel.second_next, Some(RelId(9)));
        assert_eq!(rel.first_prev, Some(RelId(4)));
        assert_eq!(rel.next_for(NodeId(1)), None);

        let mut looped = RelationshipRecord::new(RelId(1), NodeId(5), NodeId(5), RelTypeId(0));
        looped.set_next_for(NodeId(5), Some(RelId(2)));
        assert_eq!(looped.first_next, Some(RelId(2)));
        assert_eq!(looped.second_next, Some(RelId(2)));
    }

    #[test]
    fn in_use_relationship_without_endpoint_is_corrupt() {
        let mut buf = [0xFFu8; RelationshipFormat::RECORD_SIZE];
        buf[0] = 1;
        assert!(matches!(
            RelationshipFormat::decode(RelId(0), &buf),
            Err(StoreError::Corruption(_))
        ));
        buf[0] = 0;
        assert!(!RelationshipFormat::decode(RelId(0), &buf).unwrap().in_use);
    }

    #[test]
    fn dynamic_block_pads_and_bounds_data() {
        let block = DynamicRecord {
            id: BlockId(2),
            in_use: true,
            next_block: Some(BlockId(3)),
            data: b"abc".to_vec(),
        };
        let mut buf = vec![0xAAu8; 9 + 8];
        block.encode(8, &mut buf).unwrap();
        assert_eq!(&buf[12..], &[0u8; 5]);
        assert_eq!(DynamicRecord::decode(BlockId(2), 8, &buf).unwrap(), block);

        let too_big = DynamicRecord {
            data: vec![1u8; 9],
            ..block
        };
        assert!(too_big.encode(8, &mut buf).is_err());
    }

    #[test]
    fn property_record_keeps_inline_value() {
        let rec = PropertyRecord {
            id: PropertyId(7),
            in_use: true,
            prop_type: Some(PropertyType::Long),
            key: PropertyKeyId(2),
            value: (-5i64) as u64,
            prev_prop: None,
            next_prop: Some(PropertyId(8)),
            value_blocks: DynamicBlocks::new(),
        };
        let mut buf = [0u8; PropertyFormat::RECORD_SIZE];
        PropertyFormat::encode(&rec, &mut buf);
        assert_eq!(PropertyFormat::decode(PropertyId(7), &buf).unwrap(), rec);
    }
}
