//! Merkle inclusion proofs over a batch of sibling leaf hashes, used by
//! the event-chain engine to let an external proof-bundle producer verify
//! a single event's membership without replaying an entire stream.

use crate::canon::sha256_hex;

fn hash_pair(left: &str, right: &str) -> String {
    sha256_hex(format!("{left}{right}").as_bytes())
}

pub fn merkle_root(leaves: &[String]) -> Option<String> {
    if leaves.is_empty() {
        return None;
    }
    let mut layer: Vec<String> = leaves.to_vec();
    while layer.len() > 1 {
        let mut next = Vec::with_capacity(layer.len().div_ceil(2));
        for chunk in layer.chunks(2) {
            let left = &chunk[0];
            let right = chunk.get(1).unwrap_or(left);
            next.push(hash_pair(left, right));
        }
        layer = next;
    }
    layer.into_iter().next()
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MerkleStep {
    pub is_left_sibling: bool,
    pub hash: String,
}

pub fn merkle_proof(leaves: &[String], index: usize) -> Vec<MerkleStep> {
    if leaves.is_empty() || index >= leaves.len() {
        return Vec::new();
    }

    let mut proof = Vec::new();
    let mut layer: Vec<String> = leaves.to_vec();
    let mut idx = index;

    while layer.len() > 1 {
        let sibling_idx = if idx % 2 == 0 { idx + 1 } else { idx - 1 };
        if sibling_idx < layer.len() {
            proof.push(MerkleStep {
                is_left_sibling: idx % 2 == 1,
                hash: layer[sibling_idx].clone(),
            });
        } else {
            proof.push(MerkleStep {
                is_left_sibling: false,
                hash: layer[idx].clone(),
            });
        }

        let mut next = Vec::with_capacity(layer.len().div_ceil(2));
        for chunk in layer.chunks(2) {
            let left = &chunk[0];
            let right = chunk.get(1).unwrap_or(left);
            next.push(hash_pair(left, right));
        }
        layer = next;
        idx /= 2;
    }

    proof
}

pub fn verify_merkle_proof(leaf: &str, proof: &[MerkleStep], root: &str) -> bool {
    let mut current = leaf.to_string();
    for step in proof {
        current = if step.is_left_sibling {
            hash_pair(&step.hash, &current)
        } else {
            hash_pair(&current, &step.hash)
        };
    }
    current == root
}

#[cfg(test)]
mod tests {
    use super::*;

    fn leaves(n: usize) -> Vec<String> {
        (0..n).map(|i| sha256_hex(&[i as u8])).collect()
    }

    #[test]
    fn root_is_deterministic() {
        let l = leaves(4);
        let root1 = merkle_root(&l).unwrap();
        let root2 = merkle_root(&l).unwrap();
        assert_eq!(root1, root2);
    }

    #[test]
    fn proofs_verify_for_every_leaf() {
        let l = leaves(5);
        let root = merkle_root(&l).unwrap();
        for (i, leaf) in l.iter().enumerate() {
            let proof = merkle_proof(&l, i);
            assert!(verify_merkle_proof(leaf, &proof, &root));
        }
    }

    #[test]
    fn tampered_leaf_fails_verification() {
        let l = leaves(4);
        let root = merkle_root(&l).unwrap();
        let proof = merkle_proof(&l, 0);
        let wrong_leaf = sha256_hex(b"wrong");
        assert!(!verify_merkle_proof(&wrong_leaf, &proof, &root));
    }
}
