pub mod access;
pub mod authority;
pub mod claims;
pub mod config;
pub mod error;
pub mod external;
pub mod membership;
pub mod merkle;
pub mod models;
pub mod oracle;
pub mod runtime;
pub mod vault;

pub use access::{AccessControl, Role};
pub use authority::{CallOutcome, CallRequest, PrivilegedCall, RequestId, RoleChange, RoleRequest, ThresholdAuthority};
pub use claims::{ClaimLedger, ClaimState, WithdrawalClaim};
pub use config::PlatformConfig;
pub use error::{ErrorKind, PlatformError, Result};
pub use external::{AssetLedger, FixedRateSwap, FixedRateTeller, ServiceError, SwapService, YieldTeller};
pub use membership::{activation_digest, MembershipRegistry, MerkleRoot};
pub use merkle::MerkleTree;
pub use models::*;
pub use oracle::{CommittedRecord, ConsensusOracle, Submission};
pub use runtime::{AssetTransfer, Genesis, PlatformState, Runtime, TransferHook};
pub use vault::{Order, Pool, Vault};
