use solana_sdk::pubkey::Pubkey;
use thiserror::Error;

/// Failure classes surfaced to callers. Every `PlatformError` maps onto one.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    Authorization,
    State,
    Threshold,
    Validation,
    ExternalService,
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum PlatformError {
    // Authorization
    #[error("Caller {0} is neither an operator nor a registered caller")]
    NotAuthorized(Pubkey),

    #[error("Caller {0} is not an operator")]
    NotOperator(Pubkey),

    #[error("Caller {0} is not an admin")]
    NotAdmin(Pubkey),

    #[error("Only confirmer: {0}")]
    OnlyConfirmer(Pubkey),

    #[error("Caller {caller} does not own claim {claim_id}")]
    NotOwner { claim_id: u64, caller: Pubkey },

    #[error("Caller {caller} is missing role {role}")]
    MissingRole { role: String, caller: Pubkey },

    // State
    #[error("Request {0} not found")]
    RequestNotFound(u64),

    #[error("Request {0} already executed")]
    AlreadyExecuted(u64),

    #[error("Request {id} already confirmed by {operator}")]
    AlreadyConfirmed { id: u64, operator: Pubkey },

    #[error("Account {0} is already an operator")]
    AlreadyOperator(Pubkey),

    #[error("Account {0} is not in the operator ring")]
    UnknownOperator(Pubkey),

    #[error("Submission {0} not found")]
    SubmissionNotFound(u64),

    #[error("Submission {0} was superseded by a newer submission for the same key pair")]
    SupersededSubmission(u64),

    #[error("Oracle data is stale: updated at {updated_at}, limit {update_limit}s")]
    StaleOracleData { updated_at: i64, update_limit: i64 },

    #[error("No committed oracle data for this key pair")]
    NoOracleData,

    #[error("Withdrawal claim {0} not found")]
    ClaimNotFound(u64),

    #[error("Withdrawal claim {0} is not in the requested state")]
    AlreadyApproved(u64),

    #[error("Withdrawal claim {0} is not approved")]
    NotApproved(u64),

    #[error("Withdrawal claim {0} already redeemed")]
    AlreadyRedeemed(u64),

    #[error("No pool registered for yield token {0}")]
    PoolNotFound(Pubkey),

    #[error("Pool already registered for yield token {0}")]
    PoolAlreadyExists(Pubkey),

    #[error("Order for yield token {0} is disabled")]
    OrderDisabled(Pubkey),

    #[error("Redirect mode is disabled for yield token {0}")]
    RedirectDisabled(Pubkey),

    #[error("Pool for yield token {0} has no outstanding shares")]
    EmptyPool(Pubkey),

    // Threshold
    #[error("Threshold not met: confirmations={confirmations}, required={required}")]
    ThresholdNotMet { confirmations: u32, required: u32 },

    #[error("Invalid threshold {threshold} for {members} members")]
    InvalidThreshold { threshold: u32, members: u32 },

    // Validation
    #[error("Bad amount: {0}")]
    BadAmount(u64),

    #[error("Bad address: {0}")]
    BadAddress(Pubkey),

    #[error("Address {0} is not whitelisted")]
    NotWhitelisted(Pubkey),

    #[error("Signature expired at {expiry}, now {now}")]
    ExpiredSignature { expiry: i64, now: i64 },

    #[error("Signature does not match the configured oracle signer")]
    BadSignature,

    #[error("Insufficient shares: available={available}, required={required}")]
    InsufficientShares { available: u64, required: u64 },

    #[error("Insufficient balance of {asset}: available={available}, required={required}")]
    InsufficientBalance { asset: Pubkey, available: u64, required: u64 },

    #[error("Insufficient pool liquidity: available={available}, required={required}")]
    InsufficientLiquidity { available: u64, required: u64 },

    #[error("Allow-list must contain at least one address")]
    EmptyAllowList,

    #[error("Bad swap route: {0}")]
    BadRoute(String),

    #[error("Math overflow occurred")]
    Overflow,

    #[error("Math underflow occurred")]
    Underflow,

    #[error("Invariant violated: {0}")]
    InvariantViolated(String),

    #[error("Configuration error: {0}")]
    ConfigurationError(String),

    // External services
    #[error("Swap failed: {0}")]
    SwapFailed(String),

    #[error("Teller call failed: {0}")]
    TellerFailed(String),

    #[error("Slippage exceeded: min_out={min_out}, actual={actual}")]
    SlippageExceeded { min_out: u64, actual: u64 },
}

impl PlatformError {
    pub fn kind(&self) -> ErrorKind {
        use PlatformError::*;
        match self {
            NotAuthorized(_) | NotOperator(_) | NotAdmin(_) | OnlyConfirmer(_)
            | NotOwner { .. } | MissingRole { .. } => ErrorKind::Authorization,

            RequestNotFound(_) | AlreadyExecuted(_) | AlreadyConfirmed { .. }
            | AlreadyOperator(_) | UnknownOperator(_) | SubmissionNotFound(_)
            | SupersededSubmission(_) | StaleOracleData { .. } | NoOracleData
            | ClaimNotFound(_) | AlreadyApproved(_) | NotApproved(_) | AlreadyRedeemed(_)
            | PoolNotFound(_) | PoolAlreadyExists(_) | OrderDisabled(_)
            | RedirectDisabled(_) | EmptyPool(_) => ErrorKind::State,

            ThresholdNotMet { .. } | InvalidThreshold { .. } => ErrorKind::Threshold,

            BadAmount(_) | BadAddress(_) | NotWhitelisted(_) | ExpiredSignature { .. }
            | BadSignature | InsufficientShares { .. } | InsufficientBalance { .. }
            | InsufficientLiquidity { .. } | EmptyAllowList | BadRoute(_) | Overflow | Underflow
            | InvariantViolated(_) | ConfigurationError(_) => ErrorKind::Validation,

            SwapFailed(_) | TellerFailed(_) | SlippageExceeded { .. } => {
                ErrorKind::ExternalService
            }
        }
    }
}

pub type Result<T> = std::result::Result<T, PlatformError>;
