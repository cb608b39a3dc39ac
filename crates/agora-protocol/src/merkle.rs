//! Merkle inclusion paths reconstructed from compact (TSC-style) proof data.
//!
//! The explorer's proof gives a transaction's index in the block and one
//! sibling hash per tree level, with `"*"` marking the standard duplicate
//! padding used for odd leaf counts. `build` expands that into the full
//! per-level offset layout, and `to_binary` emits the compact binary path
//! encoding the overlay stack consumes for SPV verification.

use crate::error::ProtocolError;

/// Marker used in proof node lists for "duplicate the left hash".
pub const DUPLICATE_MARKER: &str = "*";

/// One entry in a merkle path level.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PathElement {
    /// Position within the level.
    pub offset: u64,
    /// Hash in internal byte order; absent for duplicate placeholders.
    hash: Option<[u8; 32]>,
    /// True for the subject transaction's own leaf.
    pub txid: bool,
    /// True when this position duplicates its left sibling (odd-count padding).
    pub duplicate: bool,
}

impl PathElement {
    /// Hash in display order (reversed hex), if present.
    pub fn hash_hex(&self) -> Option<String> {
        self.hash.map(|h| {
            let mut bytes = h;
            bytes.reverse();
            hex::encode(bytes)
        })
    }
}

/// A merkle inclusion path: the leaf level plus one sibling per level above.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MerklePath {
    pub block_height: u32,
    /// Level 0 first. Entries within a level are sorted by offset.
    pub levels: Vec<Vec<PathElement>>,
}

/// Decode a display-order hex hash into internal byte order.
fn hash_bytes(hex_str: &str, level: usize) -> Result<[u8; 32], ProtocolError> {
    let bytes = hex::decode(hex_str)
        .map_err(|e| ProtocolError::InvalidMerkleNode { level, reason: e.to_string() })?;
    let mut arr: [u8; 32] = bytes.try_into().map_err(|b: Vec<u8>| {
        ProtocolError::InvalidMerkleNode {
            level,
            reason: format!("expected 32 bytes, got {}", b.len()),
        }
    })?;
    arr.reverse();
    Ok(arr)
}

/// Reconstruct a merkle path from compact proof data.
///
/// `index` is the transaction's position in the block; `nodes` holds one
/// sibling hash (or `"*"`) per level, leaf level first.
pub fn build(
    txid: &str,
    index: u64,
    nodes: &[String],
    block_height: u32,
) -> Result<MerklePath, ProtocolError> {
    let mut levels = Vec::with_capacity(nodes.len().max(1));

    // Level 0: the leaf itself plus its immediate sibling.
    let mut level0 = vec![PathElement {
        offset: index,
        hash: Some(hash_bytes(txid, 0)?),
        txid: true,
        duplicate: false,
    }];
    if let Some(first) = nodes.first() {
        level0.push(sibling_element(index ^ 1, first, 0)?);
    }
    level0.sort_by_key(|e| e.offset);
    levels.push(level0);

    // Higher levels carry exactly one sibling each.
    for (i, node) in nodes.iter().enumerate().skip(1) {
        let sibling_offset = (index >> i) ^ 1;
        levels.push(vec![sibling_element(sibling_offset, node, i)?]);
    }

    Ok(MerklePath { block_height, levels })
}

fn sibling_element(offset: u64, node: &str, level: usize) -> Result<PathElement, ProtocolError> {
    if node == DUPLICATE_MARKER {
        Ok(PathElement { offset, hash: None, txid: false, duplicate: true })
    } else {
        Ok(PathElement { offset, hash: Some(hash_bytes(node, level)?), txid: false, duplicate: false })
    }
}

// Element flag bits in the binary encoding.
const FLAG_DUPLICATE: u8 = 0x01;
const FLAG_TXID: u8 = 0x02;

fn write_varint(out: &mut Vec<u8>, n: u64) {
    match n {
        0..=0xfc => out.push(n as u8),
        0xfd..=0xffff => {
            out.push(0xfd);
            out.extend_from_slice(&(n as u16).to_le_bytes());
        }
        0x10000..=0xffff_ffff => {
            out.push(0xfe);
            out.extend_from_slice(&(n as u32).to_le_bytes());
        }
        _ => {
            out.push(0xff);
            out.extend_from_slice(&n.to_le_bytes());
        }
    }
}

impl MerklePath {
    /// Compact binary encoding: varint block height, tree height byte, then
    /// per level a varint leaf count followed by varint offset + flag byte +
    /// hash (omitted for duplicate placeholders) per entry.
    pub fn to_binary(&self) -> Vec<u8> {
        let mut out = Vec::new();
        write_varint(&mut out, self.block_height as u64);
        out.push(self.levels.len() as u8);
        for level in &self.levels {
            write_varint(&mut out, level.len() as u64);
            for el in level {
                write_varint(&mut out, el.offset);
                let mut flags = 0u8;
                if el.duplicate {
                    flags |= FLAG_DUPLICATE;
                }
                if el.txid {
                    flags |= FLAG_TXID;
                }
                out.push(flags);
                if let Some(hash) = &el.hash {
                    out.extend_from_slice(hash);
                }
            }
        }
        out
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.to_binary())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn h(byte: u8) -> String {
        hex::encode([byte; 32])
    }

    #[test]
    fn sibling_offsets_follow_index_bits() {
        // index 5 = 0b101 with three proof levels.
        let nodes = vec![h(0xaa), h(0xbb), h(0xcc)];
        let path = build(&h(0x11), 5, &nodes, 850_000).unwrap();

        assert_eq!(path.levels.len(), 3);
        // Level 0 sorted ascending: sibling at 4, leaf at 5.
        let offsets: Vec<u64> = path.levels[0].iter().map(|e| e.offset).collect();
        assert_eq!(offsets, vec![4, 5]);
        assert!(path.levels[0][1].txid);
        assert!(!path.levels[0][0].txid);
        // Level 1 sibling: (5 >> 1) ^ 1 = 3. Level 2 sibling: (5 >> 2) ^ 1 = 0.
        assert_eq!(path.levels[1][0].offset, 3);
        assert_eq!(path.levels[2][0].offset, 0);
    }

    #[test]
    fn wildcard_becomes_duplicate_placeholder() {
        let nodes = vec![DUPLICATE_MARKER.to_owned(), h(0xbb)];
        let path = build(&h(0x11), 2, &nodes, 100).unwrap();

        let dup = &path.levels[0][1]; // sibling at offset 3
        assert_eq!(dup.offset, 3);
        assert!(dup.duplicate);
        assert_eq!(dup.hash_hex(), None);
    }

    #[test]
    fn hash_hex_round_trips_display_order() {
        let nodes = vec![h(0xaa)];
        let path = build(&h(0x11), 0, &nodes, 1).unwrap();
        assert_eq!(path.levels[0][0].hash_hex().unwrap(), h(0x11));
        assert_eq!(path.levels[0][1].hash_hex().unwrap(), h(0xaa));
    }

    #[test]
    fn invalid_node_hex_is_rejected() {
        let nodes = vec!["nothex".to_owned()];
        assert!(matches!(
            build(&h(0x11), 0, &nodes, 1),
            Err(ProtocolError::InvalidMerkleNode { level: 0, .. })
        ));
    }

    #[test]
    fn binary_encoding_layout() {
        let nodes = vec![h(0xaa)];
        let path = build(&h(0x11), 0, &nodes, 300).unwrap();
        let bin = path.to_binary();

        // Block height 300 needs the 0xfd two-byte varint form.
        assert_eq!(&bin[..3], &[0xfd, 0x2c, 0x01]);
        // One level, two entries.
        assert_eq!(bin[3], 1);
        assert_eq!(bin[4], 2);
        // Leaf at offset 0 with the txid flag, then 32 hash bytes.
        assert_eq!(bin[5], 0);
        assert_eq!(bin[6], FLAG_TXID);
        assert_eq!(&bin[7..39], &[0x11; 32]);
        // Sibling at offset 1, plain hash entry.
        assert_eq!(bin[39], 1);
        assert_eq!(bin[40], 0);
        assert_eq!(&bin[41..73], &[0xaa; 32]);
        assert_eq!(bin.len(), 73);
    }

    #[test]
    fn duplicate_entries_carry_no_hash_bytes() {
        let nodes = vec![DUPLICATE_MARKER.to_owned()];
        let path = build(&h(0x11), 0, &nodes, 1).unwrap();
        let bin = path.to_binary();
        // height(1) + tree height + count + leaf(2 + 32) + dup entry(2 bytes).
        assert_eq!(bin.len(), 1 + 1 + 1 + 34 + 2);
        assert_eq!(bin[bin.len() - 1], FLAG_DUPLICATE);
    }
}
