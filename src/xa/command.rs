//! Commands written to the logical log at prepare and applied at commit.
//!
//! Every command carries an absolute record image, so applying one twice
//! leaves the store as applying it once.

use crate::store::property::PropertyType;
use crate::store::record::{
    DynamicBlocks, DynamicRecord, NodeRecord, PropertyKeyRecord, PropertyRecord,
    RelationshipRecord, RelationshipTypeRecord,
};
use crate::types::{
    BlockId, NodeId, PropertyId, PropertyKeyId, RelId, RelTypeId, Result, StoreError,
};

/// A command a resource can log and read back.
pub trait LogCommand: Sized + Send + 'static {
    /// Appends the encoded command to `out`.
    fn write_to(&self, out: &mut Vec<u8>);

    /// Decodes a command. `Ok(None)` means the bytes end before the command
    /// does; recovery treats that as the end of the log.
    fn read_from(src: &[u8]) -> Result<Option<Self>>;
}

const TAG_REL_TYPE: u8 = 1;
const TAG_PROPERTY_KEY: u8 = 2;
const TAG_NODE: u8 = 3;
const TAG_RELATIONSHIP: u8 = 4;
const TAG_PROPERTY: u8 = 5;

/// Change to one record of the graph store.
#[derive(Clone, Debug, PartialEq)]
pub enum StoreCommand {
    /// Relationship type plus its name blocks.
    RelationshipType(RelationshipTypeRecord),
    /// Property key plus its name blocks.
    PropertyKey(PropertyKeyRecord),
    /// Node.
    Node(NodeRecord),
    /// Relationship.
    Relationship(RelationshipRecord),
    /// Property plus its value blocks.
    Property(PropertyRecord),
}

impl StoreCommand {
    /// Leading tag byte.
    pub fn tag(&self) -> u8 {
        match self {
            StoreCommand::RelationshipType(_) => TAG_REL_TYPE,
            StoreCommand::PropertyKey(_) => TAG_PROPERTY_KEY,
            StoreCommand::Node(_) => TAG_NODE,
            StoreCommand::Relationship(_) => TAG_RELATIONSHIP,
            StoreCommand::Property(_) => TAG_PROPERTY,
        }
    }
}

impl LogCommand for StoreCommand {
    fn write_to(&self, out: &mut Vec<u8>) {
        out.push(self.tag());
        match self {
            StoreCommand::RelationshipType(r) => {
                put_u64(out, r.id.0);
                out.push(r.in_use as u8);
                put_link(out, r.name_block);
                put_blocks(out, &r.name_blocks);
            }
            StoreCommand::PropertyKey(r) => {
                put_u64(out, r.id.0);
                out.push(r.in_use as u8);
                put_u32(out, r.prop_count);
                put_link(out, r.key_block);
                put_blocks(out, &r.name_blocks);
            }
            StoreCommand::Node(r) => {
                put_u64(out, r.id.0);
                out.push(r.in_use as u8);
                put_link(out, r.next_rel);
                put_link(out, r.next_prop);
            }
            StoreCommand::Relationship(r) => {
                put_u64(out, r.id.0);
                out.push(r.in_use as u8);
                put_u64(out, r.first_node.0);
                put_u64(out, r.second_node.0);
                put_u64(out, r.rel_type.0);
                put_link(out, r.first_prev);
                put_link(out, r.first_next);
                put_link(out, r.second_prev);
                put_link(out, r.second_next);
                put_link(out, r.next_prop);
            }
            StoreCommand::Property(r) => {
                put_u64(out, r.id.0);
                out.push(r.in_use as u8);
                // Written for unused records too: deleted value blocks are
                // routed by type on replay.
                put_u32(out, r.prop_type.map(PropertyType::code).unwrap_or(0));
                put_u64(out, r.key.0);
                put_u64(out, r.value);
                put_link(out, r.prev_prop);
                put_link(out, r.next_prop);
                put_blocks(out, &r.value_blocks);
            }
        }
    }

    fn read_from(src: &[u8]) -> Result<Option<Self>> {
        let mut cur = Reader { src, pos: 0 };
        let Some(tag) = cur.u8() else {
            return Ok(None);
        };
        let command = match tag {
            TAG_REL_TYPE => read_rel_type(&mut cur).map(StoreCommand::RelationshipType),
            TAG_PROPERTY_KEY => read_property_key(&mut cur).map(StoreCommand::PropertyKey),
            TAG_NODE => read_node(&mut cur).map(StoreCommand::Node),
            TAG_RELATIONSHIP => read_relationship(&mut cur).map(StoreCommand::Relationship),
            TAG_PROPERTY => read_property(&mut cur)?.map(StoreCommand::Property),
            _ => {
                return Err(StoreError::InvalidOwned(format!(
                    "unknown command tag {tag}"
                )))
            }
        };
        Ok(command)
    }
}

fn read_rel_type(cur: &mut Reader<'_>) -> Option<RelationshipTypeRecord> {
    Some(RelationshipTypeRecord {
        id: RelTypeId(cur.u64()?),
        in_use: cur.flag()?,
        name_block: cur.link()?,
        name_blocks: cur.blocks()?,
    })
}

fn read_property_key(cur: &mut Reader<'_>) -> Option<PropertyKeyRecord> {
    Some(PropertyKeyRecord {
        id: PropertyKeyId(cur.u64()?),
        in_use: cur.flag()?,
        prop_count: cur.u32()?,
        key_block: cur.link()?,
        name_blocks: cur.blocks()?,
    })
}

fn read_node(cur: &mut Reader<'_>) -> Option<NodeRecord> {
    Some(NodeRecord {
        id: NodeId(cur.u64()?),
        in_use: cur.flag()?,
        next_rel: cur.link()?,
        next_prop: cur.link()?,
    })
}

fn read_relationship(cur: &mut Reader<'_>) -> Option<RelationshipRecord> {
    Some(RelationshipRecord {
        id: RelId(cur.u64()?),
        in_use: cur.flag()?,
        first_node: NodeId(cur.u64()?),
        second_node: NodeId(cur.u64()?),
        rel_type: RelTypeId(cur.u64()?),
        first_prev: cur.link()?,
        first_next: cur.link()?,
        second_prev: cur.link()?,
        second_next: cur.link()?,
        next_prop: cur.link()?,
    })
}

fn read_property(cur: &mut Reader<'_>) -> Result<Option<PropertyRecord>> {
    let (Some(id), Some(in_use), Some(code)) = (cur.u64(), cur.flag(), cur.u32()) else {
        return Ok(None);
    };
    let prop_type = match code {
        0 => None,
        code => Some(
            PropertyType::from_code(code)
                .ok_or(StoreError::Corruption("unknown property type in command"))?,
        ),
    };
    Ok(read_property_tail(cur, PropertyId(id), in_use, prop_type))
}

fn read_property_tail(
    cur: &mut Reader<'_>,
    id: PropertyId,
    in_use: bool,
    prop_type: Option<PropertyType>,
) -> Option<PropertyRecord> {
    Some(PropertyRecord {
        id,
        in_use,
        prop_type,
        key: PropertyKeyId(cur.u64()?),
        value: cur.u64()?,
        prev_prop: cur.link()?,
        next_prop: cur.link()?,
        value_blocks: cur.blocks()?,
    })
}

fn put_u32(out: &mut Vec<u8>, value: u32) {
    out.extend_from_slice(&value.to_be_bytes());
}

fn put_u64(out: &mut Vec<u8>, value: u64) {
    out.extend_from_slice(&value.to_be_bytes());
}

/// `0` for none, else `1` followed by the id.
fn put_link<T: Into<u64>>(out: &mut Vec<u8>, link: Option<T>) {
    match link {
        Some(id) => {
            out.push(1);
            put_u64(out, id.into());
        }
        None => out.push(0),
    }
}

fn put_blocks(out: &mut Vec<u8>, blocks: &[DynamicRecord]) {
    put_u32(out, blocks.len() as u32);
    for block in blocks {
        put_u64(out, block.id.0);
        out.push(block.in_use as u8);
        put_link(out, block.next_block);
        put_u32(out, block.data.len() as u32);
        out.extend_from_slice(&block.data);
    }
}

struct Reader<'a> {
    src: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    fn take(&mut self, n: usize) -> Option<&'a [u8]> {
        let end = self.pos.checked_add(n)?;
        let bytes = self.src.get(self.pos..end)?;
        self.pos = end;
        Some(bytes)
    }

    fn u8(&mut self) -> Option<u8> {
        self.take(1).map(|b| b[0])
    }

    fn flag(&mut self) -> Option<bool> {
        self.u8().map(|b| b != 0)
    }

    fn u32(&mut self) -> Option<u32> {
        let mut arr = [0u8; 4];
        arr.copy_from_slice(self.take(4)?);
        Some(u32::from_be_bytes(arr))
    }

    fn u64(&mut self) -> Option<u64> {
        let mut arr = [0u8; 8];
        arr.copy_from_slice(self.take(8)?);
        Some(u64::from_be_bytes(arr))
    }

    /// Outer `None` when truncated, inner `None` for an absent link.
    fn link<T: From<u64>>(&mut self) -> Option<Option<T>> {
        match self.u8()? {
            0 => Some(None),
            _ => Some(Some(T::from(self.u64()?))),
        }
    }

    fn blocks(&mut self) -> Option<DynamicBlocks> {
        let count = self.u32()? as usize;
        // Every block needs at least 14 bytes; a larger count is truncation.
        if count > self.src.len().saturating_sub(self.pos) / 14 {
            return None;
        }
        let mut blocks = DynamicBlocks::with_capacity(count);
        for _ in 0..count {
            let id = BlockId(self.u64()?);
            let in_use = self.flag()?;
            let next_block = self.link()?;
            let len = self.u32()? as usize;
            let data = self.take(len)?.to_vec();
            blocks.push(DynamicRecord {
                id,
                in_use,
                next_block,
                data,
            });
        }
        Some(blocks)
    }
}
