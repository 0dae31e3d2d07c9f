use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::json;
use solana_sdk::pubkey::Pubkey;
use tracing::{debug, info, warn};

use crate::error::{PlatformError, Result};
use crate::models::{serde_pubkey, TxContext};

pub const DEFAULT_CLAIM_NAME_PREFIX: &str = "VaporFund Withdraw NFT";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ClaimState {
    Requested,
    Approved,
    Redeemed,
}

/// Bearer withdrawal ticket. Redemption pays whoever `owner` is at that time.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WithdrawalClaim {
    pub id: u64,
    #[serde(with = "serde_pubkey")]
    pub owner: Pubkey,
    #[serde(with = "serde_pubkey")]
    pub yield_token: Pubkey,
    pub shares: u64,
    pub state: ClaimState,
    pub requested_at: i64,
}

/// Arena of withdrawal claims keyed by id. Ids start at 1 and are never reused.
#[derive(Debug, Clone)]
pub struct ClaimLedger {
    name_prefix: String,
    next_id: u64,
    claims: BTreeMap<u64, WithdrawalClaim>,
}

impl ClaimLedger {
    /// Creates an empty ledger; the first claim id is 1.
    pub fn new(name_prefix: impl Into<String>) -> Self {
        Self {
            name_prefix: name_prefix.into(),
            next_id: 1,
            claims: BTreeMap::new(),
        }
    }

    pub fn len(&self) -> usize {
        self.claims.len()
    }

    pub fn is_empty(&self) -> bool {
        self.claims.is_empty()
    }

    /// Looks up a claim by id.
    pub fn claim(&self, id: u64) -> Result<&WithdrawalClaim> {
        self.claims.get(&id).ok_or(PlatformError::ClaimNotFound(id))
    }

    /// Current owner of the claim ticket.
    pub fn owner_of(&self, id: u64) -> Result<Pubkey> {
        self.claim(id).map(|claim| claim.owner)
    }

    /// Ids of every claim ticket held by `owner`.
    pub fn claims_of(&self, owner: &Pubkey) -> Vec<u64> {
        self.claims
            .values()
            .filter(|claim| claim.owner == *owner)
            .map(|claim| claim.id)
            .collect()
    }

    /// Shares held by claims for `yield_token` that are not yet redeemed.
    pub fn outstanding_shares(&self, yield_token: &Pubkey) -> u64 {
        self.claims
            .values()
            .filter(|claim| claim.yield_token == *yield_token && claim.state != ClaimState::Redeemed)
            .map(|claim| claim.shares)
            .sum()
    }

    pub(crate) fn open(&mut self, owner: Pubkey, yield_token: Pubkey, shares: u64, timestamp: i64) -> u64 {
        let id = self.next_id;
        self.next_id += 1;
        self.claims.insert(
            id,
            WithdrawalClaim {
                id,
                owner,
                yield_token,
                shares,
                state: ClaimState::Requested,
                requested_at: timestamp,
            },
        );
        info!("Opened withdrawal claim {} for {} ({} shares of {})", id, owner, shares, yield_token);
        id
    }

    pub fn transfer_claim(&mut self, ctx: &TxContext, id: u64, to: Pubkey) -> Result<()> {
        if to == Pubkey::default() {
            return Err(PlatformError::BadAddress(to));
        }
        let claim = self.claims.get_mut(&id).ok_or(PlatformError::ClaimNotFound(id))?;
        if claim.owner != ctx.caller {
            warn!("Claim {} transfer rejected: {} is not the owner", id, ctx.caller);
            return Err(PlatformError::NotOwner { claim_id: id, caller: ctx.caller });
        }
        if claim.state == ClaimState::Redeemed {
            return Err(PlatformError::AlreadyRedeemed(id));
        }

        claim.owner = to;
        info!("Withdrawal claim {} transferred from {} to {}", id, ctx.caller, to);
        Ok(())
    }

    /// All-or-nothing: every id must exist and be `Requested` before any is approved.
    pub(crate) fn approve_batch(&mut self, ids: &[u64]) -> Result<()> {
        for (index, id) in ids.iter().enumerate() {
            let claim = self.claim(*id)?;
            if claim.state != ClaimState::Requested || ids[..index].contains(id) {
                return Err(PlatformError::AlreadyApproved(*id));
            }
        }

        for id in ids {
            if let Some(claim) = self.claims.get_mut(id) {
                claim.state = ClaimState::Approved;
            }
        }
        info!("Approved withdrawal claims {:?}", ids);
        Ok(())
    }

    /// Checks that the caller owns the claim and that it is approved. Returns a copy.
    pub(crate) fn redeemable(&self, ctx: &TxContext, id: u64) -> Result<WithdrawalClaim> {
        let claim = self.claim(id)?;
        if claim.owner != ctx.caller {
            warn!("Claim {} redemption rejected: {} is not the owner", id, ctx.caller);
            return Err(PlatformError::NotOwner { claim_id: id, caller: ctx.caller });
        }
        match claim.state {
            ClaimState::Redeemed => Err(PlatformError::AlreadyRedeemed(id)),
            ClaimState::Requested => Err(PlatformError::NotApproved(id)),
            ClaimState::Approved => Ok(claim.clone()),
        }
    }

    /// Moves a claim that passed `redeemable` to `Redeemed`.
    pub(crate) fn mark_redeemed(&mut self, id: u64) -> Result<()> {
        let claim = self.claims.get_mut(&id).ok_or(PlatformError::ClaimNotFound(id))?;
        claim.state = ClaimState::Redeemed;
        debug!("Withdrawal claim {} marked redeemed", id);
        Ok(())
    }

    /// Display name of the claim ticket.
    pub fn token_name(&self, id: u64) -> String {
        format!("{} #{}", self.name_prefix, id)
    }

    /// JSON metadata document for the claim ticket.
    pub fn token_uri(&self, id: u64) -> Result<String> {
        let claim = self.claim(id)?;
        let metadata = json!({
            "name": self.token_name(id),
            "description": format!("Withdrawal claim for {} shares", claim.shares),
            "attributes": [
                { "trait_type": "yield_token", "value": claim.yield_token.to_string() },
                { "trait_type": "shares", "value": claim.shares },
                { "trait_type": "state", "value": claim.state },
            ],
        });
        serde_json::to_string(&metadata).map_err(|e| PlatformError::InvariantViolated(e.to_string()))
    }
}
