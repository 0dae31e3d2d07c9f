use std::collections::{HashMap, HashSet};
use std::fmt;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use solana_sdk::pubkey::Pubkey;
use solana_sdk::signature::Signature;
use tracing::{debug, info, warn};

use crate::error::{PlatformError, Result};
use crate::merkle::{self, ProofNode};
use crate::models::TxContext;

/// Content hash committing to an allow-listed address set.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct MerkleRoot(pub [u8; 32]);

impl fmt::Display for MerkleRoot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "0x{}", hex::encode(self.0))
    }
}

impl fmt::Debug for MerkleRoot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "MerkleRoot({})", self)
    }
}

impl Serialize for MerkleRoot {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for MerkleRoot {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        let bytes = hex::decode(raw.trim_start_matches("0x")).map_err(serde::de::Error::custom)?;
        let array: [u8; 32] = bytes
            .try_into()
            .map_err(|_| serde::de::Error::custom("merkle root must be 32 bytes"))?;
        Ok(MerkleRoot(array))
    }
}

/// Digest the oracle signer signs to activate `root` on chain `chain_id` until `expiry`.
///
/// Each field is laid out as a 32-byte big-endian word, so the payload for one
/// chain can never be replayed on another.
pub fn activation_digest(chain_id: u64, root: &MerkleRoot, expiry: i64) -> [u8; 32] {
    let mut chain_word = [0u8; 32];
    chain_word[24..].copy_from_slice(&chain_id.to_be_bytes());
    let mut expiry_word = [0u8; 32];
    expiry_word[24..].copy_from_slice(&expiry.to_be_bytes());

    let mut hasher = Sha256::new();
    hasher.update(chain_word);
    hasher.update(root.0);
    hasher.update(expiry_word);
    hasher.finalize().into()
}

/// Allow-list registry: active roots, per-address revocation, and
/// signature-activated roots.
#[derive(Debug, Clone)]
pub struct MembershipRegistry {
    owner: Pubkey,
    admins: HashSet<Pubkey>,
    roots: HashMap<MerkleRoot, bool>,
    disabled: HashSet<Pubkey>,
    oracle: Option<Pubkey>,
    chain_id: u64,
}

impl MembershipRegistry {
    pub fn new(owner: Pubkey, chain_id: u64) -> Self {
        Self {
            owner,
            admins: HashSet::new(),
            roots: HashMap::new(),
            disabled: HashSet::new(),
            oracle: None,
            chain_id,
        }
    }

    pub fn owner(&self) -> Pubkey {
        self.owner
    }

    pub fn oracle(&self) -> Option<Pubkey> {
        self.oracle
    }

    pub fn chain_id(&self) -> u64 {
        self.chain_id
    }

    pub fn is_admin(&self, account: &Pubkey) -> bool {
        *account == self.owner || self.admins.contains(account)
    }

    /// Whether `root` currently admits depositors.
    pub fn is_root_active(&self, root: &MerkleRoot) -> bool {
        self.roots.get(root).copied().unwrap_or(false)
    }

    /// Whether `account` is barred regardless of proofs.
    pub fn is_disabled(&self, account: &Pubkey) -> bool {
        self.disabled.contains(account)
    }

    /// Adds or removes a registry admin. Owner only.
    pub fn set_admin(&mut self, ctx: &TxContext, account: Pubkey, enabled: bool) -> Result<()> {
        self.require_owner(ctx)?;
        if enabled {
            self.admins.insert(account);
        } else {
            self.admins.remove(&account);
        }
        info!("Membership admin {} set to {}", account, enabled);
        Ok(())
    }

    /// Sets the signer accepted for root activation. Owner only.
    pub fn set_oracle(&mut self, ctx: &TxContext, oracle: Pubkey) -> Result<()> {
        self.require_owner(ctx)?;
        if oracle == Pubkey::default() {
            return Err(PlatformError::BadAddress(oracle));
        }
        self.oracle = Some(oracle);
        info!("Membership oracle signer set to {}", oracle);
        Ok(())
    }

    /// Activates or deactivates an allow-list root. Admin only.
    pub fn set_root(&mut self, ctx: &TxContext, root: MerkleRoot, active: bool) -> Result<()> {
        self.require_admin(ctx)?;
        self.roots.insert(root, active);
        info!("Allow-list root {} set active={}", root, active);
        Ok(())
    }

    /// Bars or re-admits a single account. Admin only.
    pub fn set_status_disable_address(&mut self, ctx: &TxContext, account: Pubkey, disabled: bool) -> Result<()> {
        self.require_admin(ctx)?;
        if disabled {
            self.disabled.insert(account);
        } else {
            self.disabled.remove(&account);
        }
        info!("Address {} disabled={}", account, disabled);
        Ok(())
    }

    /// `active[root] && proof verifies account ∈ root && !disabled[account]`.
    pub fn is_in_whitelist(&self, root: &MerkleRoot, account: &Pubkey, proof: &[ProofNode]) -> bool {
        let member = self.is_root_active(root)
            && !self.is_disabled(account)
            && merkle::verify_proof(root, account, proof);
        debug!("Whitelist check root={} account={} -> {}", root, account, member);
        member
    }

    /// Activates `root` without an admin call when the configured oracle signed
    /// `(chain_id, root, expiry)` and the signature has not expired. Anyone may submit.
    pub fn set_root_active_by_signature(
        &mut self,
        ctx: &TxContext,
        root: MerkleRoot,
        signature: &Signature,
        expiry: i64,
    ) -> Result<()> {
        if ctx.timestamp > expiry {
            return Err(PlatformError::ExpiredSignature { expiry, now: ctx.timestamp });
        }

        let oracle = self.oracle.ok_or(PlatformError::BadSignature)?;
        let digest = activation_digest(self.chain_id, &root, expiry);
        if !signature.verify(oracle.as_ref(), &digest) {
            warn!("Rejected root activation signature for {} from {}", root, ctx.caller);
            return Err(PlatformError::BadSignature);
        }

        self.roots.insert(root, true);
        info!("Allow-list root {} activated by oracle signature (expiry {})", root, expiry);
        Ok(())
    }

    fn require_owner(&self, ctx: &TxContext) -> Result<()> {
        if ctx.caller != self.owner {
            return Err(PlatformError::NotAdmin(ctx.caller));
        }
        Ok(())
    }

    fn require_admin(&self, ctx: &TxContext) -> Result<()> {
        if !self.is_admin(&ctx.caller) {
            warn!("Rejected membership admin call from {}", ctx.caller);
            return Err(PlatformError::NotAdmin(ctx.caller));
        }
        Ok(())
    }
}
