use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

use serde::{Deserialize, Serialize};
use solana_sdk::pubkey::Pubkey;
use tracing::{info, warn};

use crate::error::{PlatformError, Result};
use crate::models::TxContext;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    /// Order setup, withdrawal approval, rebase and liquidity moves.
    VaultOperator,
    /// Teller buy/sell on behalf of the vault.
    TriggerCaller,
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Role::VaultOperator => write!(f, "VAULT_OPERATOR"),
            Role::TriggerCaller => write!(f, "TRIGGER_CALLER"),
        }
    }
}

/// Role registry shared by the vault flows.
///
/// The super admin grants and revokes roles. When the super admin is the
/// threshold authority's address, grants only happen through executed
/// call requests.
#[derive(Debug, Clone)]
pub struct AccessControl {
    address: Pubkey,
    super_admin: Pubkey,
    members: BTreeMap<Role, BTreeSet<Pubkey>>,
}

impl AccessControl {
    /// Creates the role table with `super_admin` as the only admin.
    pub fn new(address: Pubkey, super_admin: Pubkey) -> Self {
        Self {
            address,
            super_admin,
            members: BTreeMap::new(),
        }
    }

    /// Address call requests target to reach this role table.
    pub fn address(&self) -> Pubkey {
        self.address
    }

    /// Account allowed to grant and revoke roles.
    pub fn super_admin(&self) -> Pubkey {
        self.super_admin
    }

    /// Whether `account` currently holds `role`.
    pub fn has_role(&self, role: Role, account: &Pubkey) -> bool {
        self.members
            .get(&role)
            .map_or(false, |accounts| accounts.contains(account))
    }

    /// Accounts holding `role`, in key order.
    pub fn members(&self, role: Role) -> Vec<Pubkey> {
        self.members
            .get(&role)
            .map(|accounts| accounts.iter().copied().collect())
            .unwrap_or_default()
    }

    /// Fails with `MissingRole` unless the caller holds `role`.
    pub fn require_role(&self, role: Role, ctx: &TxContext) -> Result<()> {
        if !self.has_role(role, &ctx.caller) {
            warn!("Caller {} rejected: missing role {}", ctx.caller, role);
            return Err(PlatformError::MissingRole {
                role: role.to_string(),
                caller: ctx.caller,
            });
        }
        Ok(())
    }

    /// Grants `role` to `account`. Super admin only.
    pub fn grant_role(&mut self, ctx: &TxContext, role: Role, account: Pubkey) -> Result<()> {
        self.require_super_admin(ctx)?;
        if account == Pubkey::default() {
            return Err(PlatformError::BadAddress(account));
        }
        self.members.entry(role).or_default().insert(account);
        info!("Granted role {} to {}", role, account);
        Ok(())
    }

    /// Revokes `role` from `account`. Super admin only.
    pub fn revoke_role(&mut self, ctx: &TxContext, role: Role, account: Pubkey) -> Result<()> {
        self.require_super_admin(ctx)?;
        if let Some(accounts) = self.members.get_mut(&role) {
            accounts.remove(&account);
        }
        info!("Revoked role {} from {}", role, account);
        Ok(())
    }

    /// Hands the super admin seat to `new_admin`.
    pub fn transfer_super_admin(&mut self, ctx: &TxContext, new_admin: Pubkey) -> Result<()> {
        self.require_super_admin(ctx)?;
        if new_admin == Pubkey::default() {
            return Err(PlatformError::BadAddress(new_admin));
        }
        self.super_admin = new_admin;
        info!("Role super admin transferred to {}", new_admin);
        Ok(())
    }

    fn require_super_admin(&self, ctx: &TxContext) -> Result<()> {
        if ctx.caller != self.super_admin {
            return Err(PlatformError::NotAdmin(ctx.caller));
        }
        Ok(())
    }
}
