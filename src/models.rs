use serde::{Deserialize, Serialize};
use solana_sdk::pubkey::Pubkey;
use solana_sdk::signature::Signature;

use crate::access::Role;
use crate::membership::MerkleRoot;

/// Asset id standing in for the chain's native value.
pub const NATIVE_ASSET: Pubkey = Pubkey::new_from_array([0u8; 32]);

/// Signer and ledger timestamp of the transaction currently executing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TxContext {
    pub caller: Pubkey,
    pub timestamp: i64,
}

impl TxContext {
    pub fn new(caller: Pubkey, timestamp: i64) -> Self {
        Self { caller, timestamp }
    }
}

/// One hop of a swap path: the token entering the hop and the pool fee tier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SwapHop {
    #[serde(with = "serde_pubkey")]
    pub token: Pubkey,
    pub pool_fee: u32,
}

impl SwapHop {
    pub fn new(token: Pubkey, pool_fee: u32) -> Self {
        Self { token, pool_fee }
    }
}

/// Full swap path handed to the external swap service.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SwapPath {
    pub hops: Vec<SwapHop>,
    #[serde(with = "serde_pubkey")]
    pub output: Pubkey,
}

impl SwapPath {
    pub fn input(&self) -> Option<Pubkey> {
        self.hops.first().map(|hop| hop.token)
    }
}

/// Value tuple carried by an oracle record.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct OracleValues {
    pub apr: u64,
    pub total_share: u64,
    pub total_value: u64,
}

impl OracleValues {
    pub fn new(apr: u64, total_share: u64, total_value: u64) -> Self {
        Self { apr, total_share, total_value }
    }
}

/// Arguments of `Runtime::deposit`.
#[derive(Debug, Clone)]
pub struct DepositRequest {
    pub root: MerkleRoot,
    pub proof: Vec<[u8; 32]>,
    pub yield_token: Pubkey,
    /// Empty means the caller pays in the order's settlement asset.
    pub route: Vec<SwapHop>,
    pub amount_in: u64,
    pub min_out: u64,
    /// Oracle signature activating `root`; `None` for the plain proof path.
    pub signature: Option<Signature>,
    pub signature_expiry: i64,
}

impl DepositRequest {
    pub fn with_proof(root: MerkleRoot, proof: Vec<[u8; 32]>, yield_token: Pubkey, amount_in: u64) -> Self {
        Self {
            root,
            proof,
            yield_token,
            route: Vec::new(),
            amount_in,
            min_out: 0,
            signature: None,
            signature_expiry: 0,
        }
    }

    pub fn routed(mut self, route: Vec<SwapHop>, min_out: u64) -> Self {
        self.route = route;
        self.min_out = min_out;
        self
    }

    pub fn signed(mut self, signature: Signature, expiry: i64) -> Self {
        self.signature = Some(signature);
        self.signature_expiry = expiry;
        self
    }
}

/// Where a redemption is paid: the settlement asset directly, or swapped along `route`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Payout {
    pub route: Vec<SwapHop>,
    pub output_token: Pubkey,
    pub min_out: u64,
}

impl Payout {
    pub fn direct(settlement_asset: Pubkey) -> Self {
        Self { route: Vec::new(), output_token: settlement_asset, min_out: 0 }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DepositReceipt {
    pub shares: u64,
    pub value: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RedemptionReceipt {
    pub shares: u64,
    pub value: u64,
    pub paid: u64,
    #[serde(with = "serde_pubkey")]
    pub paid_token: Pubkey,
}

/// Audit events appended by the vault flows. Reverted transactions leave none behind.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum PlatformEvent {
    OrderCreated {
        #[serde(with = "serde_pubkey")]
        yield_token: Pubkey,
        #[serde(with = "serde_pubkey")]
        settlement_asset: Pubkey,
        #[serde(with = "serde_pubkey")]
        beneficiary: Pubkey,
        minimum_deposit: u64,
        timestamp: i64,
    },
    Deposited {
        #[serde(with = "serde_pubkey")]
        user: Pubkey,
        #[serde(with = "serde_pubkey")]
        yield_token: Pubkey,
        value: u64,
        shares: u64,
        new_total_shares: u64,
        new_total_pooled: u64,
        timestamp: i64,
    },
    WithdrawRequested {
        claim_id: u64,
        #[serde(with = "serde_pubkey")]
        owner: Pubkey,
        #[serde(with = "serde_pubkey")]
        yield_token: Pubkey,
        shares: u64,
        timestamp: i64,
    },
    WithdrawApproved {
        claim_ids: Vec<u64>,
        #[serde(with = "serde_pubkey")]
        operator: Pubkey,
        timestamp: i64,
    },
    Withdrawn {
        claim_id: u64,
        #[serde(with = "serde_pubkey")]
        owner: Pubkey,
        shares: u64,
        value: u64,
        paid: u64,
        #[serde(with = "serde_pubkey")]
        paid_token: Pubkey,
        timestamp: i64,
    },
    RedirectWithdrawn {
        #[serde(with = "serde_pubkey")]
        user: Pubkey,
        #[serde(with = "serde_pubkey")]
        yield_token: Pubkey,
        shares: u64,
        value: u64,
        paid: u64,
        timestamp: i64,
    },
    ClaimTransferred {
        claim_id: u64,
        #[serde(with = "serde_pubkey")]
        from: Pubkey,
        #[serde(with = "serde_pubkey")]
        to: Pubkey,
        timestamp: i64,
    },
    Rebased {
        #[serde(with = "serde_pubkey")]
        yield_token: Pubkey,
        added_value: u64,
        new_total_pooled: u64,
        timestamp: i64,
    },
    LiquidityReturned {
        #[serde(with = "serde_pubkey")]
        yield_token: Pubkey,
        amount: u64,
        timestamp: i64,
    },
    LiquidityTransferred {
        #[serde(with = "serde_pubkey")]
        yield_token: Pubkey,
        amount: u64,
        #[serde(with = "serde_pubkey")]
        recipient: Pubkey,
        timestamp: i64,
    },
    TellerBought {
        #[serde(with = "serde_pubkey")]
        yield_token: Pubkey,
        amount: u64,
        units: u64,
        timestamp: i64,
    },
    TellerSold {
        #[serde(with = "serde_pubkey")]
        yield_token: Pubkey,
        units: u64,
        proceeds: u64,
        timestamp: i64,
    },
    RootActivatedBySignature {
        root: MerkleRoot,
        expiry: i64,
        timestamp: i64,
    },
    RoleChanged {
        role: Role,
        #[serde(with = "serde_pubkey")]
        account: Pubkey,
        granted: bool,
        timestamp: i64,
    },
}

/// Serializes a `Pubkey` as its base58 string.
pub mod serde_pubkey {
    use serde::{Deserialize, Deserializer, Serializer};
    use solana_sdk::pubkey::Pubkey;
    use std::str::FromStr;

    pub fn serialize<S: Serializer>(key: &Pubkey, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(key)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Pubkey, D::Error> {
        let raw = String::deserialize(deserializer)?;
        Pubkey::from_str(&raw).map_err(serde::de::Error::custom)
    }
}
