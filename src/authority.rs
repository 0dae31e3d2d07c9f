//! M-of-N threshold authority.
//!
//! Every privileged action is a request that operators confirm across
//! separate transactions and any operator executes once the confirmation
//! count reaches the threshold. Role requests mutate the operator ring
//! itself (admin, membership, threshold); call requests carry one
//! [`PrivilegedCall`] for a known target.
//!
//! Requests are never executed implicitly when the threshold is reached, are
//! never deleted, and flip to `executed` exactly once.

use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};
use solana_sdk::pubkey::Pubkey;
use tracing::{info, warn};

use crate::access::Role;
use crate::error::{PlatformError, Result};
use crate::models::{serde_pubkey, TxContext};

/// Mutation of the operator ring carried by a role request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "value", rename_all = "snake_case")]
pub enum RoleChange {
    SetAdmin(#[serde(with = "serde_pubkey")] Pubkey),
    AddOperator(#[serde(with = "serde_pubkey")] Pubkey),
    RemoveOperator(#[serde(with = "serde_pubkey")] Pubkey),
    SetThreshold(u32),
}

/// Closed set of effects a call request may dispatch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "call", rename_all = "snake_case")]
pub enum PrivilegedCall {
    /// Move pooled settlement asset out of the vault to `recipient`.
    TransferLiquidity {
        #[serde(with = "serde_pubkey")]
        yield_token: Pubkey,
        amount: u64,
        #[serde(with = "serde_pubkey")]
        recipient: Pubkey,
    },
    TellerBuy {
        #[serde(with = "serde_pubkey")]
        yield_token: Pubkey,
        amount: u64,
    },
    TellerSell {
        #[serde(with = "serde_pubkey")]
        yield_token: Pubkey,
        units: u64,
    },
    GrantRole {
        role: Role,
        #[serde(with = "serde_pubkey")]
        account: Pubkey,
    },
    RevokeRole {
        role: Role,
        #[serde(with = "serde_pubkey")]
        account: Pubkey,
    },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", content = "reason", rename_all = "snake_case")]
pub enum CallOutcome {
    /// Role request applied.
    Applied,
    Succeeded,
    /// The dispatched effect failed and was rolled back; the request stays executed.
    Reverted(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RequestId {
    Role(u64),
    Call(u64),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RoleRequest {
    pub id: u64,
    pub change: RoleChange,
    pub submitter: Pubkey,
    pub confirmations: BTreeSet<Pubkey>,
    pub executed: bool,
    pub created_at: i64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CallRequest {
    pub id: u64,
    pub target: Pubkey,
    pub call: PrivilegedCall,
    pub submitter: Pubkey,
    pub confirmations: BTreeSet<Pubkey>,
    pub executed: bool,
    pub outcome: Option<CallOutcome>,
    pub created_at: i64,
}

impl RoleRequest {
    pub fn num_confirmations(&self) -> u32 {
        self.confirmations.len() as u32
    }
}

impl CallRequest {
    pub fn num_confirmations(&self) -> u32 {
        self.confirmations.len() as u32
    }
}

#[derive(Debug, Clone)]
pub struct ThresholdAuthority {
    address: Pubkey,
    admin: Pubkey,
    operators: Vec<Pubkey>,
    threshold: u32,
    callers: BTreeSet<Pubkey>,
    role_requests: Vec<RoleRequest>,
    call_requests: Vec<CallRequest>,
}

impl ThresholdAuthority {
    /// Creates the ring. Fails unless `1 <= threshold <= operators`.
    pub fn new(address: Pubkey, admin: Pubkey, operators: &[Pubkey], threshold: u32) -> Result<Self> {
        let mut ring = Vec::with_capacity(operators.len());
        for operator in operators {
            if *operator == Pubkey::default() {
                return Err(PlatformError::BadAddress(*operator));
            }
            if !ring.contains(operator) {
                ring.push(*operator);
            }
        }
        validate_threshold(threshold, ring.len())?;

        Ok(Self {
            address,
            admin,
            operators: ring,
            threshold,
            callers: BTreeSet::new(),
            role_requests: Vec::new(),
            call_requests: Vec::new(),
        })
    }

    /// Address of the authority itself, used as a role admin.
    pub fn address(&self) -> Pubkey {
        self.address
    }

    /// Account managing the registered-caller list.
    pub fn admin(&self) -> Pubkey {
        self.admin
    }

    pub fn is_admin(&self, account: &Pubkey) -> bool {
        self.admin == *account
    }

    /// Current operator ring.
    pub fn operators(&self) -> &[Pubkey] {
        &self.operators
    }

    /// Whether `account` is in the operator ring.
    pub fn is_operator(&self, account: &Pubkey) -> bool {
        self.operators.contains(account)
    }

    /// Confirmations required to execute a request.
    pub fn threshold(&self) -> u32 {
        self.threshold
    }

    /// Whether `account` may submit call requests without being an operator.
    pub fn is_registered_caller(&self, account: &Pubkey) -> bool {
        self.callers.contains(account)
    }

    /// Number of role requests ever submitted.
    pub fn role_request_count(&self) -> u64 {
        self.role_requests.len() as u64
    }

    /// Number of call requests ever submitted.
    pub fn call_request_count(&self) -> u64 {
        self.call_requests.len() as u64
    }

    /// Looks up a role request by id.
    pub fn role_request(&self, id: u64) -> Option<&RoleRequest> {
        self.role_requests.get(id as usize)
    }

    /// Looks up a call request by id.
    pub fn call_request(&self, id: u64) -> Option<&CallRequest> {
        self.call_requests.get(id as usize)
    }

    /// Registers a caller contract. Admin only.
    pub fn add_caller(&mut self, ctx: &TxContext, caller: Pubkey) -> Result<()> {
        self.require_admin(ctx)?;
        if caller == Pubkey::default() {
            return Err(PlatformError::BadAddress(caller));
        }
        self.callers.insert(caller);
        info!("Registered caller contract {}", caller);
        Ok(())
    }

    /// Unregisters a caller contract. Admin only.
    pub fn remove_caller(&mut self, ctx: &TxContext, caller: Pubkey) -> Result<()> {
        self.require_admin(ctx)?;
        self.callers.remove(&caller);
        info!("Unregistered caller contract {}", caller);
        Ok(())
    }

    /// Only operators may submit role requests.
    pub fn submit_role_request(&mut self, ctx: &TxContext, change: RoleChange) -> Result<u64> {
        if !self.is_operator(&ctx.caller) {
            warn!("Rejected role request from {}", ctx.caller);
            return Err(PlatformError::NotAuthorized(ctx.caller));
        }
        match change {
            RoleChange::SetAdmin(account)
            | RoleChange::AddOperator(account)
            | RoleChange::RemoveOperator(account)
                if account == Pubkey::default() =>
            {
                return Err(PlatformError::BadAddress(account));
            }
            RoleChange::SetThreshold(0) => {
                return Err(PlatformError::InvalidThreshold {
                    threshold: 0,
                    members: self.operators.len() as u32,
                });
            }
            _ => {}
        }

        let id = self.role_requests.len() as u64;
        self.role_requests.push(RoleRequest {
            id,
            change,
            submitter: ctx.caller,
            confirmations: BTreeSet::new(),
            executed: false,
            created_at: ctx.timestamp,
        });
        info!("Role request {} submitted by {}: {:?}", id, ctx.caller, change);
        Ok(id)
    }

    /// Operators and registered caller contracts may submit call requests.
    pub fn submit_call_request(&mut self, ctx: &TxContext, target: Pubkey, call: PrivilegedCall) -> Result<u64> {
        if !self.is_operator(&ctx.caller) && !self.is_registered_caller(&ctx.caller) {
            warn!("Rejected call request from {}", ctx.caller);
            return Err(PlatformError::NotAuthorized(ctx.caller));
        }
        if target == Pubkey::default() {
            return Err(PlatformError::BadAddress(target));
        }

        let id = self.call_requests.len() as u64;
        self.call_requests.push(CallRequest {
            id,
            target,
            call,
            submitter: ctx.caller,
            confirmations: BTreeSet::new(),
            executed: false,
            outcome: None,
            created_at: ctx.timestamp,
        });
        info!("Call request {} submitted by {} for {}: {:?}", id, ctx.caller, target, call);
        Ok(id)
    }

    /// Adds the caller's confirmation and returns the new confirmation count.
    pub fn confirm(&mut self, ctx: &TxContext, request: RequestId) -> Result<u32> {
        self.require_operator(ctx)?;
        let (id, executed, confirmations) = match request {
            RequestId::Role(id) => {
                let r = self.role_requests.get_mut(id as usize).ok_or(PlatformError::RequestNotFound(id))?;
                (id, r.executed, &mut r.confirmations)
            }
            RequestId::Call(id) => {
                let r = self.call_requests.get_mut(id as usize).ok_or(PlatformError::RequestNotFound(id))?;
                (id, r.executed, &mut r.confirmations)
            }
        };

        if executed {
            return Err(PlatformError::AlreadyExecuted(id));
        }
        if !confirmations.insert(ctx.caller) {
            return Err(PlatformError::AlreadyConfirmed { id, operator: ctx.caller });
        }

        let count = confirmations.len() as u32;
        info!("{:?} confirmed by {} ({}/{})", request, ctx.caller, count, self.threshold);
        Ok(count)
    }

    /// Applies a role request once it holds at least the current threshold of
    /// confirmations. A change that would break the ring's invariants fails
    /// and leaves the request pending.
    pub fn execute_role_request(&mut self, ctx: &TxContext, id: u64) -> Result<RoleChange> {
        self.require_operator(ctx)?;
        let request = self.role_requests.get(id as usize).ok_or(PlatformError::RequestNotFound(id))?;
        if request.executed {
            return Err(PlatformError::AlreadyExecuted(id));
        }
        self.require_threshold(request.num_confirmations())?;

        let change = request.change;
        self.apply(change)?;
        self.role_requests[id as usize].executed = true;

        info!("Role request {} executed by {}: {:?}", id, ctx.caller, change);
        Ok(change)
    }

    /// Marks a call request executed and hands back the request for dispatch.
    ///
    /// The executed flag is set before anything is dispatched and is never
    /// cleared, whatever the dispatch outcome.
    pub fn execute_call_request(&mut self, ctx: &TxContext, id: u64) -> Result<CallRequest> {
        self.require_operator(ctx)?;
        let threshold = self.threshold;
        let request = self.call_requests.get_mut(id as usize).ok_or(PlatformError::RequestNotFound(id))?;
        if request.executed {
            return Err(PlatformError::AlreadyExecuted(id));
        }
        let confirmations = request.num_confirmations();
        if confirmations < threshold {
            return Err(PlatformError::ThresholdNotMet { confirmations, required: threshold });
        }

        request.executed = true;
        info!("Call request {} executed by {}", id, ctx.caller);
        Ok(request.clone())
    }

    /// Stores the dispatch result of an executed call request.
    pub fn record_outcome(&mut self, id: u64, outcome: CallOutcome) -> Result<()> {
        let request = self.call_requests.get_mut(id as usize).ok_or(PlatformError::RequestNotFound(id))?;
        if let CallOutcome::Reverted(reason) = &outcome {
            warn!("Call request {} dispatch reverted: {}", id, reason);
        }
        request.outcome = Some(outcome);
        Ok(())
    }

    fn apply(&mut self, change: RoleChange) -> Result<()> {
        match change {
            RoleChange::SetAdmin(account) => {
                self.admin = account;
            }
            RoleChange::AddOperator(account) => {
                if self.is_operator(&account) {
                    return Err(PlatformError::AlreadyOperator(account));
                }
                self.operators.push(account);
            }
            RoleChange::RemoveOperator(account) => {
                if !self.is_operator(&account) {
                    return Err(PlatformError::UnknownOperator(account));
                }
                validate_threshold(self.threshold, self.operators.len() - 1)?;
                self.operators.retain(|operator| *operator != account);
            }
            RoleChange::SetThreshold(threshold) => {
                validate_threshold(threshold, self.operators.len())?;
                self.threshold = threshold;
            }
        }
        Ok(())
    }

    fn require_threshold(&self, confirmations: u32) -> Result<()> {
        if confirmations < self.threshold {
            return Err(PlatformError::ThresholdNotMet {
                confirmations,
                required: self.threshold,
            });
        }
        Ok(())
    }

    fn require_operator(&self, ctx: &TxContext) -> Result<()> {
        if !self.is_operator(&ctx.caller) {
            warn!("Rejected authority call from non-operator {}", ctx.caller);
            return Err(PlatformError::NotOperator(ctx.caller));
        }
        Ok(())
    }

    fn require_admin(&self, ctx: &TxContext) -> Result<()> {
        if !self.is_admin(&ctx.caller) {
            return Err(PlatformError::NotAdmin(ctx.caller));
        }
        Ok(())
    }
}

fn validate_threshold(threshold: u32, members: usize) -> Result<()> {
    if threshold == 0 || threshold as usize > members {
        return Err(PlatformError::InvalidThreshold {
            threshold,
            members: members as u32,
        });
    }
    Ok(())
}
