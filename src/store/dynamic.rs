//! Stores of variable-length values split over chains of fixed-size blocks.
//!
//! Block 0 is a header whose length field holds the block size, so the
//! record size is known before the store is opened.

use std::path::Path;

use smallvec::SmallVec;

use crate::primitives::io::{FileIo, StdFileIo};
use crate::store::common::{Store, StoreFile};
use crate::store::config::StoreConfig;
use crate::store::record::{DynamicBlocks, DynamicRecord};
use crate::types::{BlockId, Result, StoreError};

const BLOCK_HEADER_LEN: usize = 9;

/// String store.
pub const STRING_STORE: &str = "StringPropertyStore";
/// Array store.
pub const ARRAY_STORE: &str = "ArrayPropertyStore";
/// Property key name store.
pub const PROPERTY_KEY_NAME_STORE: &str = "PropertyIndexKeyStore";
/// Relationship type name store.
pub const REL_TYPE_NAME_STORE: &str = "RelationshipTypeNameStore";

/// A dynamic store of one kind.
pub struct DynamicStore {
    file: StoreFile,
    block_size: usize,
}

impl DynamicStore {
    /// Creates the store with the header block.
    pub fn create(
        path: impl AsRef<Path>,
        type_descriptor: &'static str,
        block_size: usize,
    ) -> Result<()> {
        if block_size == 0 || block_size > u32::MAX as usize {
            return Err(StoreError::Invalid("dynamic block size out of range"));
        }
        let mut header = vec![0u8; BLOCK_HEADER_LEN + block_size];
        header[0] = 1;
        header[1..5].copy_from_slice(&(block_size as u32).to_be_bytes());
        header[5..9].copy_from_slice(&u32::MAX.to_be_bytes());
        StoreFile::create_storage(path, type_descriptor, BLOCK_HEADER_LEN + block_size, &header)
    }

    /// Opens the store, taking the block size from the header block.
    pub fn open(
        path: impl AsRef<Path>,
        type_descriptor: &'static str,
        config: &StoreConfig,
    ) -> Result<Self> {
        let path = path.as_ref();
        let block_size = {
            let probe = StdFileIo::open_existing(path, true)?;
            let mut header = [0u8; BLOCK_HEADER_LEN];
            probe
                .read_at(0, &mut header)
                .map_err(|_| StoreError::Corruption("dynamic store header missing"))?;
            u32::from_be_bytes([header[1], header[2], header[3], header[4]]) as usize
        };
        if block_size == 0 {
            return Err(StoreError::Corruption("dynamic store block size is zero"));
        }
        let file =
            StoreFile::open_storage(path, type_descriptor, BLOCK_HEADER_LEN + block_size, config)?;
        Ok(Self { file, block_size })
    }

    /// Payload bytes per block.
    pub fn block_size(&self) -> usize {
        self.block_size
    }

    /// Splits `data` over freshly issued blocks and returns the linked chain.
    /// Nothing is written until the blocks are updated.
    pub fn allocate_records(&self, data: &[u8]) -> Result<DynamicBlocks> {
        let mut chunks: SmallVec<[&[u8]; 2]> = data.chunks(self.block_size).collect();
        if chunks.is_empty() {
            chunks.push(&[]);
        }
        let mut ids = SmallVec::<[BlockId; 2]>::with_capacity(chunks.len());
        for _ in 0..chunks.len() {
            match self.file.next_id() {
                Ok(id) => ids.push(BlockId(id)),
                Err(err) => {
                    for id in ids {
                        self.free_block(id)?;
                    }
                    return Err(err);
                }
            }
        }
        Ok(chunks
            .iter()
            .enumerate()
            .map(|(i, chunk)| DynamicRecord {
                id: ids[i],
                in_use: true,
                next_block: ids.get(i + 1).copied(),
                data: chunk.to_vec(),
            })
            .collect())
    }

    /// Block `id`, in use or not.
    pub fn get_record(&self, id: BlockId) -> Result<DynamicRecord> {
        if id.0 == 0 {
            return Err(StoreError::Invalid("block 0 is the store header"));
        }
        let mut buf = vec![0u8; BLOCK_HEADER_LEN + self.block_size];
        self.file.read_raw(id.0, &mut buf)?;
        DynamicRecord::decode(id, self.block_size, &buf)
    }

    /// Every block of the chain starting at `first`.
    pub fn get_chain(&self, first: BlockId) -> Result<Vec<DynamicRecord>> {
        let limit = self.file.high_id()?;
        let mut chain = Vec::new();
        let mut next = Some(first);
        while let Some(id) = next {
            if chain.len() as u64 >= limit {
                return Err(StoreError::Corruption("dynamic chain cycle"));
            }
            let block = self.get_record(id)?;
            if !block.in_use {
                return Err(StoreError::Corruption("dynamic chain reaches unused block"));
            }
            next = block.next_block;
            chain.push(block);
        }
        Ok(chain)
    }

    /// Concatenated payload of the chain starting at `first`.
    pub fn read_bytes(&self, first: BlockId) -> Result<Vec<u8>> {
        Ok(self
            .get_chain(first)?
            .into_iter()
            .flat_map(|block| block.data)
            .collect())
    }

    /// Unused images of every block in the chain, for deletion.
    pub fn delete_chain(&self, first: BlockId) -> Result<DynamicBlocks> {
        Ok(self
            .get_chain(first)?
            .into_iter()
            .map(|block| DynamicRecord::unused(block.id))
            .collect())
    }

    /// Writes `block`; an unused block gives its id back.
    pub fn update_record(&self, block: &DynamicRecord) -> Result<()> {
        self.write_block(block)?;
        self.file.reconcile_id(block.id.0, block.in_use)
    }

    /// Writes `block` during log replay.
    pub fn update_record_recovered(&self, block: &DynamicRecord) -> Result<()> {
        self.write_block(block)?;
        self.file.note_recovered(block.id.0, block.in_use)
    }

    /// Returns a never-written block to the id generator.
    pub fn free_block(&self, id: BlockId) -> Result<()> {
        self.file.free_id(id.0)
    }

    fn write_block(&self, block: &DynamicRecord) -> Result<()> {
        if block.id.0 == 0 {
            return Err(StoreError::Invalid("block 0 is the store header"));
        }
        let mut buf = vec![0u8; BLOCK_HEADER_LEN + self.block_size];
        block.encode(self.block_size, &mut buf)?;
        self.file.write_raw(block.id.0, &buf)
    }
}

impl Store for DynamicStore {
    fn file(&self) -> &StoreFile {
        &self.file
    }
}
