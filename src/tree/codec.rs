//! Fixed-layout block codecs.
//!
//! Node layout (little endian):
//!   [0]        tag: 1 = leaf, 2 = internal
//!   [1]        reserved
//!   [2..4]     nkeys (u16)
//!   [4..132]   keys, 16 slots of u64
//!   [132..]    leaf: 16 value slots of u64; internal: 17 child ids of u32
//!
//! Superblock layout: magic (u32) at 0, root block id (u32) at 4.

use crate::buffer::{BlockId, BLOCK_SIZE, INVALID_BLOCK_ID};
use crate::error::{BlockTreeError, BlockTreeResult};
use crate::tree::node::{InternalNode, LeafNode, Node};

const TAG_LEAF: u8 = 1;
const TAG_INTERNAL: u8 = 2;

const NKEYS_OFFSET: usize = 2;
const KEYS_OFFSET: usize = 4;
const PAYLOAD_OFFSET: usize = KEYS_OFFSET + Node::ORDER * 8;

pub const SUPERBLOCK_MAGIC: u32 = 0xB7EE_5B0C;

pub struct NodeCodec;

impl NodeCodec {
    pub fn encode(node: &Node, buf: &mut [u8]) {
        debug_assert!(buf.len() >= BLOCK_SIZE);
        buf[..BLOCK_SIZE].fill(0);
        match node {
            Node::Leaf(leaf) => {
                buf[0] = TAG_LEAF;
                put_u16(buf, NKEYS_OFFSET, leaf.keys.len() as u16);
                for (i, key) in leaf.keys.iter().enumerate() {
                    put_u64(buf, KEYS_OFFSET + i * 8, *key);
                }
                for (i, value) in leaf.values.iter().enumerate() {
                    put_u64(buf, PAYLOAD_OFFSET + i * 8, *value);
                }
            }
            Node::Internal(internal) => {
                buf[0] = TAG_INTERNAL;
                put_u16(buf, NKEYS_OFFSET, internal.keys.len() as u16);
                for (i, key) in internal.keys.iter().enumerate() {
                    put_u64(buf, KEYS_OFFSET + i * 8, *key);
                }
                for (i, child) in internal.children.iter().enumerate() {
                    put_u32(buf, PAYLOAD_OFFSET + i * 4, *child);
                }
            }
        }
    }

    pub fn decode(buf: &[u8]) -> BlockTreeResult<Node> {
        if buf.len() < BLOCK_SIZE {
            return Err(BlockTreeError::Corruption(format!(
                "node block truncated: {} bytes",
                buf.len()
            )));
        }
        let tag = buf[0];
        let nkeys = get_u16(buf, NKEYS_OFFSET) as usize;
        if nkeys > Node::ORDER {
            return Err(BlockTreeError::Corruption(format!(
                "node key count {} exceeds order {}",
                nkeys,
                Node::ORDER
            )));
        }
        let mut keys = Vec::with_capacity(nkeys);
        for i in 0..nkeys {
            keys.push(get_u64(buf, KEYS_OFFSET + i * 8));
        }
        if !keys.windows(2).all(|w| w[0] < w[1]) {
            return Err(BlockTreeError::Corruption(
                "node keys are not strictly ascending".to_string(),
            ));
        }

        match tag {
            TAG_LEAF => {
                let mut values = Vec::with_capacity(nkeys);
                for i in 0..nkeys {
                    values.push(get_u64(buf, PAYLOAD_OFFSET + i * 8));
                }
                Ok(Node::Leaf(LeafNode { keys, values }))
            }
            TAG_INTERNAL => {
                let mut children = Vec::with_capacity(nkeys + 1);
                for i in 0..=nkeys {
                    let child = get_u32(buf, PAYLOAD_OFFSET + i * 4);
                    if child == INVALID_BLOCK_ID {
                        return Err(BlockTreeError::Corruption(format!(
                            "internal node child {} is null",
                            i
                        )));
                    }
                    children.push(child);
                }
                Ok(Node::Internal(InternalNode { keys, children }))
            }
            other => Err(BlockTreeError::Corruption(format!(
                "unknown node tag {}",
                other
            ))),
        }
    }
}

pub struct SuperblockCodec;

impl SuperblockCodec {
    pub fn encode(root_block_id: BlockId, buf: &mut [u8]) {
        debug_assert!(buf.len() >= BLOCK_SIZE);
        buf[..BLOCK_SIZE].fill(0);
        put_u32(buf, 0, SUPERBLOCK_MAGIC);
        put_u32(buf, 4, root_block_id);
    }

    /// A null root id is a valid, empty tree.
    pub fn decode(buf: &[u8]) -> BlockTreeResult<BlockId> {
        if buf.len() < 8 {
            return Err(BlockTreeError::Corruption(format!(
                "superblock truncated: {} bytes",
                buf.len()
            )));
        }
        let magic = get_u32(buf, 0);
        if magic != SUPERBLOCK_MAGIC {
            return Err(BlockTreeError::Corruption(format!(
                "bad superblock magic {:#x}",
                magic
            )));
        }
        Ok(get_u32(buf, 4))
    }
}

fn put_u16(buf: &mut [u8], offset: usize, v: u16) {
    buf[offset..offset + 2].copy_from_slice(&v.to_le_bytes());
}

fn put_u32(buf: &mut [u8], offset: usize, v: u32) {
    buf[offset..offset + 4].copy_from_slice(&v.to_le_bytes());
}

fn put_u64(buf: &mut [u8], offset: usize, v: u64) {
    buf[offset..offset + 8].copy_from_slice(&v.to_le_bytes());
}

fn get_u16(buf: &[u8], offset: usize) -> u16 {
    u16::from_le_bytes([buf[offset], buf[offset + 1]])
}

fn get_u32(buf: &[u8], offset: usize) -> u32 {
    u32::from_le_bytes([
        buf[offset],
        buf[offset + 1],
        buf[offset + 2],
        buf[offset + 3],
    ])
}

fn get_u64(buf: &[u8], offset: usize) -> u64 {
    let mut raw = [0u8; 8];
    raw.copy_from_slice(&buf[offset..offset + 8]);
    u64::from_le_bytes(raw)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn block() -> Vec<u8> {
        vec![0u8; BLOCK_SIZE]
    }

    #[test]
    fn leaf_round_trip() {
        let mut leaf = LeafNode::new();
        for k in [2u64, 5, 11] {
            leaf.insert(k, k * 100);
        }
        let node = Node::Leaf(leaf);
        let mut buf = block();
        NodeCodec::encode(&node, &mut buf);
        assert_eq!(NodeCodec::decode(&buf).unwrap(), node);
    }

    #[test]
    fn internal_round_trip() {
        let node = Node::Internal(InternalNode {
            keys: vec![10, 20, 30],
            children: vec![4, 8, 15, 16],
        });
        let mut buf = block();
        NodeCodec::encode(&node, &mut buf);
        assert_eq!(NodeCodec::decode(&buf).unwrap(), node);
    }

    #[test]
    fn decode_rejects_garbage() {
        let mut buf = block();
        buf[0] = 9;
        assert!(matches!(
            NodeCodec::decode(&buf),
            Err(BlockTreeError::Corruption(_))
        ));

        let mut buf = block();
        buf[0] = TAG_LEAF;
        put_u16(&mut buf, NKEYS_OFFSET, (Node::ORDER + 1) as u16);
        assert!(matches!(
            NodeCodec::decode(&buf),
            Err(BlockTreeError::Corruption(_))
        ));

        // Internal node with a null child pointer.
        let mut buf = block();
        NodeCodec::encode(
            &Node::Internal(InternalNode {
                keys: vec![7],
                children: vec![1, 2],
            }),
            &mut buf,
        );
        put_u32(&mut buf, PAYLOAD_OFFSET + 4, INVALID_BLOCK_ID);
        assert!(matches!(
            NodeCodec::decode(&buf),
            Err(BlockTreeError::Corruption(_))
        ));
    }

    #[test]
    fn decode_rejects_unsorted_keys() {
        let mut buf = block();
        buf[0] = TAG_LEAF;
        put_u16(&mut buf, NKEYS_OFFSET, 2);
        put_u64(&mut buf, KEYS_OFFSET, 9);
        put_u64(&mut buf, KEYS_OFFSET + 8, 3);
        assert!(matches!(
            NodeCodec::decode(&buf),
            Err(BlockTreeError::Corruption(_))
        ));
    }

    #[test]
    fn superblock_round_trip_and_magic_check() {
        let mut buf = block();
        SuperblockCodec::encode(42, &mut buf);
        assert_eq!(SuperblockCodec::decode(&buf).unwrap(), 42);

        SuperblockCodec::encode(INVALID_BLOCK_ID, &mut buf);
        assert_eq!(SuperblockCodec::decode(&buf).unwrap(), INVALID_BLOCK_ID);

        put_u32(&mut buf, 0, 0xDEAD_BEEF);
        assert!(matches!(
            SuperblockCodec::decode(&buf),
            Err(BlockTreeError::Corruption(_))
        ));
    }
}
