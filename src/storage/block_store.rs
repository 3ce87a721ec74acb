use log::debug;
use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::Path;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Mutex, MutexGuard, RwLock};

use crate::buffer::{BlockId, BLOCK_SIZE, INVALID_BLOCK_ID};
use crate::error::{BlockTreeError, BlockTreeResult};

const BLOCK_STORE_MAGIC: u32 = 0xB10C_7EE5;
const BLOCK_STORE_VERSION: u32 = 1;

/// Meta block at file offset 0. Blocks proper start right after it and are
/// addressed 1-based, so `INVALID_BLOCK_ID` (0) never aliases real storage.
const META_BLOCK_SIZE: usize = BLOCK_SIZE;

static EMPTY_BLOCK: [u8; BLOCK_SIZE] = [0; BLOCK_SIZE];

#[derive(Debug, Clone, Copy)]
pub struct MetaBlock {
    pub freelist_block_id: BlockId,
    pub superblock_id: BlockId,
}

impl MetaBlock {
    fn encode(&self) -> [u8; META_BLOCK_SIZE] {
        let mut bytes = [0u8; META_BLOCK_SIZE];
        bytes[0..4].copy_from_slice(&BLOCK_STORE_MAGIC.to_le_bytes());
        bytes[4..8].copy_from_slice(&BLOCK_STORE_VERSION.to_le_bytes());
        bytes[8..12].copy_from_slice(&self.freelist_block_id.to_le_bytes());
        bytes[12..16].copy_from_slice(&self.superblock_id.to_le_bytes());
        bytes
    }

    fn decode(bytes: &[u8]) -> BlockTreeResult<Self> {
        if bytes.len() < 16 {
            return Err(BlockTreeError::Corruption(format!(
                "meta block too short: {} bytes",
                bytes.len()
            )));
        }
        let magic = u32::from_le_bytes(bytes[0..4].try_into().unwrap());
        if magic != BLOCK_STORE_MAGIC {
            return Err(BlockTreeError::Corruption(format!(
                "bad block store magic: {:#x}",
                magic
            )));
        }
        let version = u32::from_le_bytes(bytes[4..8].try_into().unwrap());
        if version != BLOCK_STORE_VERSION {
            return Err(BlockTreeError::Corruption(format!(
                "unsupported block store version: {}",
                version
            )));
        }
        Ok(MetaBlock {
            freelist_block_id: u32::from_le_bytes(bytes[8..12].try_into().unwrap()),
            superblock_id: u32::from_le_bytes(bytes[12..16].try_into().unwrap()),
        })
    }
}

/// Linked list of reusable block ids, threaded through dedicated blocks.
struct FreelistBlock {
    next_block_id: BlockId,
    entries: Vec<BlockId>,
}

impl FreelistBlock {
    const CAPACITY: usize = (BLOCK_SIZE - 8) / 4;

    fn new() -> Self {
        FreelistBlock {
            next_block_id: INVALID_BLOCK_ID,
            entries: Vec::new(),
        }
    }

    fn is_full(&self) -> bool {
        self.entries.len() >= Self::CAPACITY
    }

    fn encode(&self) -> [u8; BLOCK_SIZE] {
        let mut bytes = [0u8; BLOCK_SIZE];
        bytes[0..4].copy_from_slice(&self.next_block_id.to_le_bytes());
        bytes[4..8].copy_from_slice(&(self.entries.len() as u32).to_le_bytes());
        for (i, id) in self.entries.iter().enumerate() {
            let off = 8 + i * 4;
            bytes[off..off + 4].copy_from_slice(&id.to_le_bytes());
        }
        bytes
    }

    fn decode(bytes: &[u8]) -> BlockTreeResult<Self> {
        let next_block_id = u32::from_le_bytes(bytes[0..4].try_into().unwrap());
        let count = u32::from_le_bytes(bytes[4..8].try_into().unwrap()) as usize;
        if count > Self::CAPACITY {
            return Err(BlockTreeError::Corruption(format!(
                "freelist block claims {} entries, capacity is {}",
                count,
                Self::CAPACITY
            )));
        }
        let mut entries = Vec::with_capacity(count);
        for i in 0..count {
            let off = 8 + i * 4;
            entries.push(u32::from_le_bytes(bytes[off..off + 4].try_into().unwrap()));
        }
        Ok(FreelistBlock {
            next_block_id,
            entries,
        })
    }
}

/// File-backed block store: maps a `BlockId` to a fixed `BLOCK_SIZE` buffer.
///
/// All access goes through the file mutex so concurrent scheduler workers
/// never interleave a seek with another worker's read/write.
#[derive(Debug)]
pub struct BlockStore {
    next_block_id: AtomicU32,
    db_file: Mutex<File>,
    meta: RwLock<MetaBlock>,
}

impl BlockStore {
    pub fn try_new(path: impl AsRef<Path>) -> BlockTreeResult<Self> {
        let path = path.as_ref();
        let exists = path.exists();
        let mut db_file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .open(path)?;

        let meta = if exists {
            let mut buf = vec![0u8; META_BLOCK_SIZE];
            db_file.read_exact(&mut buf)?;
            MetaBlock::decode(&buf)?
        } else {
            let meta = MetaBlock {
                freelist_block_id: INVALID_BLOCK_ID,
                superblock_id: INVALID_BLOCK_ID,
            };
            db_file.write_all(&meta.encode())?;
            db_file.flush()?;
            meta
        };

        let file_len = db_file.metadata()?.len();
        if (file_len - META_BLOCK_SIZE as u64) % BLOCK_SIZE as u64 != 0 {
            return Err(BlockTreeError::Corruption(format!(
                "store file length {} is not meta + a multiple of {}",
                file_len, BLOCK_SIZE
            )));
        }
        let next_block_id =
            (((file_len - META_BLOCK_SIZE as u64) / BLOCK_SIZE as u64) + 1) as BlockId;
        debug!("block store opened, next_block_id={}", next_block_id);

        Ok(BlockStore {
            next_block_id: AtomicU32::new(next_block_id),
            db_file: Mutex::new(db_file),
            meta: RwLock::new(meta),
        })
    }

    pub fn read_block(&self, block_id: BlockId) -> BlockTreeResult<[u8; BLOCK_SIZE]> {
        if block_id == INVALID_BLOCK_ID {
            return Err(BlockTreeError::Storage(
                "read_block: null block id".to_string(),
            ));
        }
        let mut guard = self.db_file.lock().unwrap();
        guard.seek(SeekFrom::Start(Self::block_offset(block_id)))?;
        let mut block = [0u8; BLOCK_SIZE];
        guard.read_exact(&mut block)?;
        Ok(block)
    }

    pub fn write_block(&self, block_id: BlockId, data: &[u8]) -> BlockTreeResult<()> {
        if block_id == INVALID_BLOCK_ID {
            return Err(BlockTreeError::Storage(
                "write_block: null block id".to_string(),
            ));
        }
        if data.len() != BLOCK_SIZE {
            return Err(BlockTreeError::Internal(format!(
                "write_block: payload is {} bytes, expected {}",
                data.len(),
                BLOCK_SIZE
            )));
        }
        let mut guard = self.db_file.lock().unwrap();
        Self::write_block_internal(&mut guard, block_id, data)
    }

    /// Reserves a block id, reusing a freed block when one is available.
    /// Fresh blocks are zero-filled on allocation.
    pub fn allocate_block(&self) -> BlockTreeResult<BlockId> {
        if let Some(block_id) = self.freelist_pop()? {
            return Ok(block_id);
        }
        let mut guard = self.db_file.lock().unwrap();
        let block_id = self.next_block_id.fetch_add(1, Ordering::SeqCst);
        Self::write_block_internal(&mut guard, block_id, &EMPTY_BLOCK).map_err(|e| {
            BlockTreeError::ResourceExhausted(format!(
                "cannot extend store for block {}: {}",
                block_id, e
            ))
        })?;
        Ok(block_id)
    }

    pub fn deallocate_block(&self, block_id: BlockId) -> BlockTreeResult<()> {
        if block_id == INVALID_BLOCK_ID {
            return Err(BlockTreeError::Storage(
                "deallocate_block: null block id".to_string(),
            ));
        }
        {
            let mut guard = self.db_file.lock().unwrap();
            Self::write_block_internal(&mut guard, block_id, &EMPTY_BLOCK)?;
        }
        self.freelist_push(block_id)
    }

    pub fn superblock_id(&self) -> BlockId {
        self.meta.read().unwrap().superblock_id
    }

    pub fn set_superblock_id(&self, block_id: BlockId) -> BlockTreeResult<()> {
        self.meta.write().unwrap().superblock_id = block_id;
        self.write_meta_block()
    }

    pub fn file_len(&self) -> BlockTreeResult<u64> {
        let guard = self.db_file.lock().unwrap();
        Ok(guard.metadata()?.len())
    }

    fn block_offset(block_id: BlockId) -> u64 {
        (META_BLOCK_SIZE + (block_id - 1) as usize * BLOCK_SIZE) as u64
    }

    fn write_block_internal(
        guard: &mut MutexGuard<File>,
        block_id: BlockId,
        data: &[u8],
    ) -> BlockTreeResult<()> {
        guard.seek(SeekFrom::Start(Self::block_offset(block_id)))?;
        guard.write_all(data)?;
        guard.flush()?;
        Ok(())
    }

    fn allocate_freelist_block(&self) -> BlockTreeResult<BlockId> {
        let block_id = self.allocate_block()?;
        self.write_block(block_id, &FreelistBlock::new().encode())?;
        Ok(block_id)
    }

    fn freelist_push(&self, block_id: BlockId) -> BlockTreeResult<()> {
        let mut curr_block_id = INVALID_BLOCK_ID;
        let mut next_block_id = self.meta.read().unwrap().freelist_block_id;
        loop {
            let mut freelist = if next_block_id == INVALID_BLOCK_ID {
                next_block_id = self.allocate_freelist_block()?;
                if curr_block_id == INVALID_BLOCK_ID {
                    self.meta.write().unwrap().freelist_block_id = next_block_id;
                    self.write_meta_block()?;
                } else {
                    let mut tail = FreelistBlock::decode(&self.read_block(curr_block_id)?)?;
                    tail.next_block_id = next_block_id;
                    self.write_block(curr_block_id, &tail.encode())?;
                }
                FreelistBlock::new()
            } else {
                FreelistBlock::decode(&self.read_block(next_block_id)?)?
            };

            if freelist.is_full() {
                curr_block_id = next_block_id;
                next_block_id = freelist.next_block_id;
            } else {
                freelist.entries.push(block_id);
                self.write_block(next_block_id, &freelist.encode())?;
                return Ok(());
            }
        }
    }

    fn freelist_pop(&self) -> BlockTreeResult<Option<BlockId>> {
        let mut freelist_block_id = self.meta.read().unwrap().freelist_block_id;
        loop {
            if freelist_block_id == INVALID_BLOCK_ID {
                return Ok(None);
            }
            let mut freelist = FreelistBlock::decode(&self.read_block(freelist_block_id)?)?;
            if let Some(block_id) = freelist.entries.pop() {
                self.write_block(freelist_block_id, &freelist.encode())?;
                return Ok(Some(block_id));
            }
            freelist_block_id = freelist.next_block_id;
        }
    }

    fn write_meta_block(&self) -> BlockTreeResult<()> {
        let mut guard = self.db_file.lock().unwrap();
        guard.seek(SeekFrom::Start(0))?;
        guard.write_all(&self.meta.read().unwrap().encode())?;
        guard.flush()?;
        Ok(())
    }
}
