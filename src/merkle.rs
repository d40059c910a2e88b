//! Merkle commitment over execution-trace rows.
//!
//! Leaves and interior nodes use domain-separated BLAKE2b-256.  An odd node
//! at the end of a level is promoted unchanged.

use blake2::digest::{consts::U32, Digest as _};

use crate::types::Digest;

type Blake2b256 = blake2::Blake2b<U32>;

const MERKLE_DOMAIN: &[u8] = b"QBRIDGE_TRACE_MERKLE";

const LEAF: u8 = 0;
const EMPTY: u8 = 1;
const NODE: u8 = 2;

fn tagged(tag: u8, parts: &[&Digest]) -> Digest {
    let mut hasher = Blake2b256::new();
    hasher.update(MERKLE_DOMAIN);
    hasher.update([tag]);
    for part in parts {
        hasher.update(part);
    }
    hasher.finalize().into()
}

fn hash_pair(left: &Digest, right: &Digest) -> Digest {
    tagged(NODE, &[left, right])
}

fn hash_leaf(leaf: &Digest) -> Digest {
    tagged(LEAF, &[leaf])
}

fn next_level(level: &[Digest]) -> Vec<Digest> {
    let mut next = Vec::with_capacity(level.len().div_ceil(2));
    for pair in level.chunks(2) {
        next.push(match pair {
            [left, right] => hash_pair(left, right),
            [single, ..] => *single,
            [] => continue,
        });
    }
    next
}

/// Root over the given leaf digests.
pub fn merkle_root(leaves: &[Digest]) -> Digest {
    let mut level: Vec<Digest> = leaves.iter().map(hash_leaf).collect();
    loop {
        match level.len() {
            0 => return tagged(EMPTY, &[]),
            1 => return level[0],
            _ => level = next_level(&level),
        }
    }
}
