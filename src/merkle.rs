//! Allow-list Merkle tree.
//!
//! Leaves are `sha256(sha256(address))`, interior nodes hash the sorted pair
//! of their children, and an odd node at the end of a level is promoted
//! unchanged. Sorting the pair means a proof is just the list of sibling
//! hashes, with no left/right flags.

use sha2::{Digest, Sha256};
use solana_sdk::pubkey::Pubkey;

use crate::error::{PlatformError, Result};
use crate::membership::MerkleRoot;

pub type ProofNode = [u8; 32];

pub fn hash_leaf(account: &Pubkey) -> [u8; 32] {
    let inner = Sha256::digest(account.as_ref());
    Sha256::digest(inner).into()
}

pub fn hash_pair(a: &[u8; 32], b: &[u8; 32]) -> [u8; 32] {
    let mut hasher = Sha256::new();
    if a <= b {
        hasher.update(a);
        hasher.update(b);
    } else {
        hasher.update(b);
        hasher.update(a);
    }
    hasher.finalize().into()
}

pub fn verify_proof(root: &MerkleRoot, account: &Pubkey, proof: &[ProofNode]) -> bool {
    let computed = proof
        .iter()
        .fold(hash_leaf(account), |current, sibling| hash_pair(&current, sibling));
    computed == root.0
}

/// Off-chain builder for allow-list roots and membership proofs.
#[derive(Debug, Clone)]
pub struct MerkleTree {
    levels: Vec<Vec<[u8; 32]>>,
}

impl MerkleTree {
    pub fn from_accounts(accounts: &[Pubkey]) -> Result<Self> {
        if accounts.is_empty() {
            return Err(PlatformError::EmptyAllowList);
        }

        let mut leaves: Vec<[u8; 32]> = accounts.iter().map(hash_leaf).collect();
        leaves.sort();
        leaves.dedup();

        let mut levels = vec![leaves];
        while levels.last().map_or(0, Vec::len) > 1 {
            let current = &levels[levels.len() - 1];
            let next = current
                .chunks(2)
                .map(|chunk| match chunk {
                    [left, right] => hash_pair(left, right),
                    _ => chunk[0],
                })
                .collect();
            levels.push(next);
        }

        Ok(Self { levels })
    }

    pub fn root(&self) -> MerkleRoot {
        MerkleRoot(self.levels[self.levels.len() - 1][0])
    }

    pub fn leaf_count(&self) -> usize {
        self.levels[0].len()
    }

    /// Sibling path for `account`, or `None` if it is not a leaf.
    pub fn proof(&self, account: &Pubkey) -> Option<Vec<ProofNode>> {
        let leaf = hash_leaf(account);
        let mut index = self.levels[0].iter().position(|node| *node == leaf)?;

        let mut proof = Vec::new();
        for level in &self.levels[..self.levels.len() - 1] {
            let sibling = index ^ 1;
            if sibling < level.len() {
                proof.push(level[sibling]);
            }
            index /= 2;
        }
        Some(proof)
    }
}
