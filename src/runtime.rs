//! Host ledger for the platform.
//!
//! `Runtime` owns every component's state and executes each public entry
//! point as one transaction: the state is snapshotted first and restored if
//! the entry point fails, so no partial effects or events survive an error.
//!
//! Entry points book their state transition (share mint/burn/lock, claim
//! state, request executed flag) before any asset transfer, swap, teller
//! call or call-request dispatch. Asset transfers invoke the transfer hook
//! registered for the asset with the runtime itself, so hostile assets can
//! re-enter any entry point mid-flow and observe the already-updated state.

use std::collections::HashMap;

use solana_sdk::pubkey::Pubkey;
use solana_sdk::signature::Signature;
use tracing::{debug, info, warn};

use crate::access::{AccessControl, Role};
use crate::authority::{CallOutcome, CallRequest, PrivilegedCall, RequestId, RoleChange, ThresholdAuthority};
use crate::config::PlatformConfig;
use crate::error::{PlatformError, Result};
use crate::external::{AssetLedger, ServiceError, SwapService, YieldTeller};
use crate::membership::{MembershipRegistry, MerkleRoot};
use crate::models::{
    DepositReceipt, DepositRequest, OracleValues, Payout, PlatformEvent, RedemptionReceipt, SwapPath, TxContext,
};
use crate::oracle::ConsensusOracle;
use crate::vault::{Order, Vault};

/// Asset movement handed to a transfer hook after the balances changed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AssetTransfer {
    pub asset: Pubkey,
    pub from: Pubkey,
    pub to: Pubkey,
    pub amount: u64,
}

/// Callback run after every transfer of the asset it is registered for.
/// An error aborts the transaction that made the transfer.
pub trait TransferHook {
    fn on_transfer(&mut self, rt: &mut Runtime, transfer: &AssetTransfer) -> Result<()>;
}

/// Accounts the platform is created with.
#[derive(Debug, Clone)]
pub struct Genesis {
    /// Authority admin, oracle owner, membership owner and role super admin.
    pub deployer: Pubkey,
    pub operators: Vec<Pubkey>,
    pub oracle_confirmers: Vec<Pubkey>,
    pub timestamp: i64,
}

/// Component state a transaction can change. Cloned for snapshots; the
/// append-only event log is kept outside and truncated on rollback.
#[derive(Debug, Clone)]
pub struct PlatformState {
    pub authority: ThresholdAuthority,
    pub oracle: ConsensusOracle,
    pub membership: MembershipRegistry,
    pub access: AccessControl,
    pub vault: Vault,
    pub assets: AssetLedger,
}

pub struct Runtime {
    config: PlatformConfig,
    clock: i64,
    state: PlatformState,
    events: Vec<PlatformEvent>,
    swap: Box<dyn SwapService>,
    tellers: HashMap<Pubkey, Box<dyn YieldTeller>>,
    hooks: HashMap<Pubkey, Box<dyn TransferHook>>,
}

impl Runtime {
    pub fn new(config: PlatformConfig, genesis: Genesis, swap: Box<dyn SwapService>) -> Result<Self> {
        config.validate()?;

        let authority_address = Pubkey::new_unique();
        let vault_address = Pubkey::new_unique();
        let access_address = Pubkey::new_unique();
        let ctx = TxContext::new(genesis.deployer, genesis.timestamp);

        let mut authority = ThresholdAuthority::new(
            authority_address,
            genesis.deployer,
            &genesis.operators,
            config.authority_threshold,
        )?;
        authority.add_caller(&ctx, vault_address)?;

        let mut oracle = ConsensusOracle::new(genesis.deployer);
        for confirmer in &genesis.oracle_confirmers {
            oracle.set_is_confirmer(&ctx, *confirmer, true)?;
        }
        if config.oracle_threshold != oracle.threshold() {
            oracle.set_num_confirmations_required(&ctx, config.oracle_threshold)?;
        }
        oracle.set_update_limit(&ctx, config.oracle_update_limit_seconds)?;

        let state = PlatformState {
            authority,
            oracle,
            membership: MembershipRegistry::new(genesis.deployer, config.chain_id),
            access: AccessControl::new(access_address, genesis.deployer),
            vault: Vault::new(vault_address, config.claim_name_prefix.clone()),
            assets: AssetLedger::new(),
        };

        info!(
            "Platform initialized: authority={}, vault={}, access={}, chain_id={}",
            authority_address, vault_address, access_address, config.chain_id
        );
        Ok(Self {
            config,
            clock: genesis.timestamp,
            state,
            events: Vec::new(),
            swap,
            tellers: HashMap::new(),
            hooks: HashMap::new(),
        })
    }

    pub fn config(&self) -> &PlatformConfig {
        &self.config
    }

    pub fn state(&self) -> &PlatformState {
        &self.state
    }

    pub fn authority(&self) -> &ThresholdAuthority {
        &self.state.authority
    }

    pub fn oracle(&self) -> &ConsensusOracle {
        &self.state.oracle
    }

    pub fn membership(&self) -> &MembershipRegistry {
        &self.state.membership
    }

    pub fn access(&self) -> &AccessControl {
        &self.state.access
    }

    pub fn vault(&self) -> &Vault {
        &self.state.vault
    }

    pub fn assets(&self) -> &AssetLedger {
        &self.state.assets
    }

    pub fn events(&self) -> &[PlatformEvent] {
        &self.events
    }

    pub fn events_json(&self) -> Result<serde_json::Value> {
        serde_json::to_value(&self.events).map_err(|e| PlatformError::InvariantViolated(e.to_string()))
    }

    pub fn balance_of(&self, asset: &Pubkey, owner: &Pubkey) -> u64 {
        self.state.assets.balance_of(asset, owner)
    }

    pub fn share_balance(&self, yield_token: &Pubkey, account: &Pubkey) -> u64 {
        self.state.vault.share_balance(yield_token, account)
    }

    pub fn redeemable_value(&self, yield_token: &Pubkey, account: &Pubkey) -> Result<u64> {
        self.state.vault.redeemable_value(yield_token, account)
    }

    pub fn check_invariants(&self, yield_token: &Pubkey) -> Result<()> {
        self.state.vault.check_invariants(yield_token)
    }

    pub fn timestamp(&self) -> i64 {
        self.clock
    }

    pub fn set_timestamp(&mut self, timestamp: i64) {
        self.clock = timestamp;
    }

    pub fn advance_time(&mut self, seconds: i64) {
        self.clock = self.clock.saturating_add(seconds);
    }

    pub fn register_teller(&mut self, yield_token: Pubkey, teller: Box<dyn YieldTeller>) {
        info!("Teller for {} registered (yield asset {})", yield_token, teller.yield_asset());
        self.tellers.insert(yield_token, teller);
    }

    pub fn set_transfer_hook(&mut self, asset: Pubkey, hook: Box<dyn TransferHook>) {
        self.hooks.insert(asset, hook);
    }

    pub fn clear_transfer_hook(&mut self, asset: &Pubkey) {
        self.hooks.remove(asset);
    }

    /// Credits `amount` of `asset` to `to` outside any platform flow.
    pub fn fund_account(&mut self, asset: Pubkey, to: Pubkey, amount: u64) -> Result<()> {
        self.state.assets.mint(&asset, &to, amount)
    }

    // ---- threshold authority ----

    pub fn submit_role_request(&mut self, caller: Pubkey, change: RoleChange) -> Result<u64> {
        self.transact("submit_role_request", |rt| {
            let ctx = rt.ctx(caller);
            rt.state.authority.submit_role_request(&ctx, change)
        })
    }

    pub fn submit_call_request(&mut self, caller: Pubkey, target: Pubkey, call: PrivilegedCall) -> Result<u64> {
        self.transact("submit_call_request", |rt| {
            let ctx = rt.ctx(caller);
            rt.state.authority.submit_call_request(&ctx, target, call)
        })
    }

    pub fn confirm(&mut self, caller: Pubkey, request: RequestId) -> Result<u32> {
        self.transact("confirm", |rt| {
            let ctx = rt.ctx(caller);
            rt.state.authority.confirm(&ctx, request)
        })
    }

    /// Executes a request whose confirmations meet the current threshold.
    ///
    /// A call request is marked executed before its effect is dispatched. The
    /// effect runs in a nested savepoint: if it fails only the effect is
    /// rolled back and the failure comes back as `CallOutcome::Reverted`,
    /// with the request still executed.
    pub fn execute(&mut self, caller: Pubkey, request: RequestId) -> Result<CallOutcome> {
        self.transact("execute", |rt| {
            let ctx = rt.ctx(caller);
            match request {
                RequestId::Role(id) => {
                    rt.state.authority.execute_role_request(&ctx, id)?;
                    Ok(CallOutcome::Applied)
                }
                RequestId::Call(id) => {
                    let call = rt.state.authority.execute_call_request(&ctx, id)?;
                    let outcome = match rt.transact("dispatch", |rt| rt.dispatch(&call)) {
                        Ok(()) => CallOutcome::Succeeded,
                        Err(err) => CallOutcome::Reverted(err.to_string()),
                    };
                    rt.state.authority.record_outcome(id, outcome.clone())?;
                    Ok(outcome)
                }
            }
        })
    }

    pub fn add_caller(&mut self, caller: Pubkey, contract: Pubkey) -> Result<()> {
        self.transact("add_caller", |rt| {
            let ctx = rt.ctx(caller);
            rt.state.authority.add_caller(&ctx, contract)
        })
    }

    pub fn remove_caller(&mut self, caller: Pubkey, contract: Pubkey) -> Result<()> {
        self.transact("remove_caller", |rt| {
            let ctx = rt.ctx(caller);
            rt.state.authority.remove_caller(&ctx, contract)
        })
    }

    // ---- oracle ----

    /// Flags or unflags an oracle confirmer.
    pub fn set_oracle_confirmer(&mut self, caller: Pubkey, account: Pubkey, enabled: bool) -> Result<()> {
        self.transact("set_oracle_confirmer", |rt| {
            let ctx = rt.ctx(caller);
            rt.state.oracle.set_is_confirmer(&ctx, account, enabled)
        })
    }

    pub fn set_oracle_threshold(&mut self, caller: Pubkey, threshold: u32) -> Result<()> {
        self.transact("set_oracle_threshold", |rt| {
            let ctx = rt.ctx(caller);
            rt.state.oracle.set_num_confirmations_required(&ctx, threshold)
        })
    }

    pub fn set_oracle_update_limit(&mut self, caller: Pubkey, seconds: i64) -> Result<()> {
        self.transact("set_oracle_update_limit", |rt| {
            let ctx = rt.ctx(caller);
            rt.state.oracle.set_update_limit(&ctx, seconds)
        })
    }

    /// Opens a new oracle submission for `(key_a, key_b)`.
    pub fn submit_data(&mut self, caller: Pubkey, key_a: Pubkey, key_b: Pubkey, values: OracleValues) -> Result<u64> {
        self.transact("submit_data", |rt| {
            let ctx = rt.ctx(caller);
            rt.state.oracle.submit_data(&ctx, key_a, key_b, values)
        })
    }

    /// Confirms an oracle submission.
    pub fn confirm_submit(&mut self, caller: Pubkey, id: u64) -> Result<u32> {
        self.transact("confirm_submit", |rt| {
            let ctx = rt.ctx(caller);
            rt.state.oracle.confirm_submit(&ctx, id)
        })
    }

    // ---- membership ----

    /// Activates or deactivates an allow-list root.
    pub fn set_root(&mut self, caller: Pubkey, root: MerkleRoot, active: bool) -> Result<()> {
        self.transact("set_root", |rt| {
            let ctx = rt.ctx(caller);
            rt.state.membership.set_root(&ctx, root, active)
        })
    }

    pub fn set_status_disable_address(&mut self, caller: Pubkey, account: Pubkey, disabled: bool) -> Result<()> {
        self.transact("set_status_disable_address", |rt| {
            let ctx = rt.ctx(caller);
            rt.state.membership.set_status_disable_address(&ctx, account, disabled)
        })
    }

    pub fn set_membership_admin(&mut self, caller: Pubkey, account: Pubkey, enabled: bool) -> Result<()> {
        self.transact("set_membership_admin", |rt| {
            let ctx = rt.ctx(caller);
            rt.state.membership.set_admin(&ctx, account, enabled)
        })
    }

    pub fn set_membership_oracle(&mut self, caller: Pubkey, oracle: Pubkey) -> Result<()> {
        self.transact("set_membership_oracle", |rt| {
            let ctx = rt.ctx(caller);
            rt.state.membership.set_oracle(&ctx, oracle)
        })
    }

    pub fn set_root_active_by_signature(
        &mut self,
        caller: Pubkey,
        root: MerkleRoot,
        signature: &Signature,
        expiry: i64,
    ) -> Result<()> {
        self.transact("set_root_active_by_signature", |rt| rt.activate_root(caller, root, signature, expiry))
    }

    // ---- roles ----

    /// Grants `role` to `account` as the role super admin.
    pub fn grant_role(&mut self, caller: Pubkey, role: Role, account: Pubkey) -> Result<()> {
        self.transact("grant_role", |rt| rt.apply_role(caller, role, account, true))
    }

    /// Revokes `role` from `account` as the role super admin.
    pub fn revoke_role(&mut self, caller: Pubkey, role: Role, account: Pubkey) -> Result<()> {
        self.transact("revoke_role", |rt| rt.apply_role(caller, role, account, false))
    }

    pub fn transfer_role_admin(&mut self, caller: Pubkey, new_admin: Pubkey) -> Result<()> {
        self.transact("transfer_role_admin", |rt| {
            let ctx = rt.ctx(caller);
            rt.state.access.transfer_super_admin(&ctx, new_admin)
        })
    }

    // ---- vault: orders and claims ----

    /// Registers the deposit order for `yield_token`. The beneficiary defaults
    /// to the vault and the minimum to the configured default.
    pub fn setup_order(
        &mut self,
        caller: Pubkey,
        yield_token: Pubkey,
        settlement_asset: Pubkey,
        minimum_deposit: Option<u64>,
        beneficiary: Option<Pubkey>,
    ) -> Result<()> {
        self.transact("setup_order", |rt| {
            let ctx = rt.ctx(caller);
            rt.require_vault_operator(&ctx)?;

            let order = Order {
                settlement_asset,
                minimum_deposit: minimum_deposit.unwrap_or(rt.config.default_minimum_deposit),
                beneficiary: beneficiary.unwrap_or_else(|| rt.state.vault.address()),
                enabled: true,
                redirect: false,
            };
            let event = PlatformEvent::OrderCreated {
                yield_token,
                settlement_asset,
                beneficiary: order.beneficiary,
                minimum_deposit: order.minimum_deposit,
                timestamp: ctx.timestamp,
            };
            rt.state.vault.setup_order(yield_token, order)?;
            rt.emit(event);
            Ok(())
        })
    }

    pub fn set_order_enabled(&mut self, caller: Pubkey, yield_token: Pubkey, enabled: bool) -> Result<()> {
        self.transact("set_order_enabled", |rt| {
            let ctx = rt.ctx(caller);
            rt.require_vault_operator(&ctx)?;
            rt.state.vault.set_order_enabled(&yield_token, enabled)
        })
    }

    /// Redirect mode needs a teller registered for the yield token.
    pub fn set_redirect(&mut self, caller: Pubkey, yield_token: Pubkey, redirect: bool) -> Result<()> {
        self.transact("set_redirect", |rt| {
            let ctx = rt.ctx(caller);
            rt.require_vault_operator(&ctx)?;
            if redirect && !rt.tellers.contains_key(&yield_token) {
                return Err(PlatformError::TellerFailed(format!("no teller registered for {}", yield_token)));
            }
            rt.state.vault.set_redirect(&yield_token, redirect)
        })
    }

    /// Transfers a claim ticket to `to`.
    pub fn transfer_claim(&mut self, caller: Pubkey, claim_id: u64, to: Pubkey) -> Result<()> {
        self.transact("transfer_claim", |rt| {
            let ctx = rt.ctx(caller);
            rt.state.vault.transfer_claim(&ctx, claim_id, to)?;
            rt.emit(PlatformEvent::ClaimTransferred {
                claim_id,
                from: caller,
                to,
                timestamp: ctx.timestamp,
            });
            Ok(())
        })
    }

    // ---- vault: deposit and withdrawal ----

    /// Deposits into the pool for `request.yield_token`.
    ///
    /// Checks:
    /// - Caller must prove membership of an active root (optionally activating
    ///   the root with an oracle signature in the same transaction)
    /// - Order must exist and be enabled
    /// - Amount must be non-zero and at least the order minimum after any swap
    pub fn deposit(&mut self, caller: Pubkey, request: DepositRequest) -> Result<DepositReceipt> {
        self.transact("deposit", |rt| {
            let ctx = rt.ctx(caller);
            if request.amount_in == 0 {
                return Err(PlatformError::BadAmount(0));
            }

            if let Some(signature) = &request.signature {
                rt.activate_root(caller, request.root, signature, request.signature_expiry)?;
            }
            if !rt.state.membership.is_in_whitelist(&request.root, &caller, &request.proof) {
                warn!("Deposit rejected: {} is not whitelisted under {}", caller, request.root);
                return Err(PlatformError::NotWhitelisted(caller));
            }

            let order = rt.state.vault.pool(&request.yield_token)?.order.clone();
            if !order.enabled {
                return Err(PlatformError::OrderDisabled(request.yield_token));
            }
            let vault = rt.state.vault.address();

            let receipt = if request.route.is_empty() {
                let receipt = rt.state.vault.credit_deposit(&caller, &request.yield_token, request.amount_in)?;
                rt.move_asset(order.settlement_asset, caller, vault, request.amount_in)?;
                receipt
            } else {
                let path = SwapPath {
                    hops: request.route.clone(),
                    output: order.settlement_asset,
                };
                let input = path
                    .input()
                    .ok_or_else(|| PlatformError::BadRoute("empty deposit route".to_string()))?;
                rt.move_asset(input, caller, vault, request.amount_in)?;
                let value = rt.swap_on_vault(&path, request.amount_in, request.min_out)?;
                rt.state.vault.credit_deposit(&caller, &request.yield_token, value)?
            };

            rt.forward_deposit(&request.yield_token, &order, receipt.value)?;

            let pool = rt.state.vault.pool(&request.yield_token)?;
            let event = PlatformEvent::Deposited {
                user: caller,
                yield_token: request.yield_token,
                value: receipt.value,
                shares: receipt.shares,
                new_total_shares: pool.total_shares,
                new_total_pooled: pool.total_pooled,
                timestamp: ctx.timestamp,
            };
            rt.emit(event);
            Ok(receipt)
        })
    }

    /// Locks shares into a new withdrawal claim owned by the caller. Returns the claim id.
    pub fn request_withdraw(&mut self, caller: Pubkey, yield_token: Pubkey, shares: u64) -> Result<u64> {
        self.transact("request_withdraw", |rt| {
            let ctx = rt.ctx(caller);
            let claim_id = rt.state.vault.lock_for_withdrawal(&ctx, &yield_token, shares)?;
            rt.emit(PlatformEvent::WithdrawRequested {
                claim_id,
                owner: caller,
                yield_token,
                shares,
                timestamp: ctx.timestamp,
            });
            Ok(claim_id)
        })
    }

    /// All-or-nothing batch approval.
    pub fn approve_request_withdraw(&mut self, caller: Pubkey, claim_ids: &[u64]) -> Result<()> {
        self.transact("approve_request_withdraw", |rt| {
            let ctx = rt.ctx(caller);
            rt.require_vault_operator(&ctx)?;
            rt.state.vault.approve_request_withdraw(claim_ids)?;
            rt.emit(PlatformEvent::WithdrawApproved {
                claim_ids: claim_ids.to_vec(),
                operator: caller,
                timestamp: ctx.timestamp,
            });
            Ok(())
        })
    }

    /// Redeems an approved claim for its current owner.
    pub fn withdraw(&mut self, caller: Pubkey, claim_id: u64, payout: Payout) -> Result<RedemptionReceipt> {
        self.transact("withdraw", |rt| {
            let ctx = rt.ctx(caller);
            let (claim, value) = rt.state.vault.redeem_claim(&ctx, claim_id)?;
            let settlement = rt.state.vault.pool(&claim.yield_token)?.order.settlement_asset;

            let (paid, paid_token) = rt.pay_out(claim.owner, settlement, value, &payout)?;
            rt.emit(PlatformEvent::Withdrawn {
                claim_id,
                owner: claim.owner,
                shares: claim.shares,
                value,
                paid,
                paid_token,
                timestamp: ctx.timestamp,
            });
            Ok(RedemptionReceipt {
                shares: claim.shares,
                value,
                paid,
                paid_token,
            })
        })
    }

    /// Ticket-less withdrawal for orders in redirect mode: burns shares and
    /// settles by selling teller holdings in the same transaction.
    ///
    /// The last position in the pool sells every remaining unit and is paid
    /// the full proceeds plus any liquid value left. Otherwise the user is
    /// paid the booked value and any sale surplus stays in the pool as liquid
    /// value.
    pub fn redirect_withdraw(
        &mut self,
        caller: Pubkey,
        yield_token: Pubkey,
        shares: u64,
        payout: Payout,
    ) -> Result<RedemptionReceipt> {
        self.transact("redirect_withdraw", |rt| {
            let ctx = rt.ctx(caller);
            let value = rt.state.vault.preview_redirect(&caller, &yield_token, shares)?;
            let pool = rt.state.vault.pool(&yield_token)?;
            let settlement = pool.order.settlement_asset;
            let last_position = shares == pool.total_shares;
            let held_units = pool.teller_units;

            let units = if last_position {
                held_units
            } else {
                rt.teller(&yield_token)?.units_for_value(value).map_err(teller_error)?
            };

            let liquid = rt.state.vault.burn_for_redirect(&caller, &yield_token, shares, units)?;
            let proceeds = if units == 0 {
                0
            } else {
                rt.sell_through_teller(&yield_token, &settlement, units)?
            };

            let owed = if last_position {
                proceeds.checked_add(liquid).ok_or(PlatformError::Overflow)?
            } else {
                if proceeds < value {
                    return Err(PlatformError::TellerFailed(format!(
                        "sale of {} units returned {}, owed {}",
                        units, proceeds, value
                    )));
                }
                rt.state.vault.book_redirect_surplus(&yield_token, proceeds - value)?;
                value
            };

            let (paid, paid_token) = rt.pay_out(caller, settlement, owed, &payout)?;
            rt.emit(PlatformEvent::RedirectWithdrawn {
                user: caller,
                yield_token,
                shares,
                value,
                paid,
                timestamp: ctx.timestamp,
            });
            Ok(RedemptionReceipt {
                shares,
                value,
                paid,
                paid_token,
            })
        })
    }

    // ---- vault: value and liquidity ----

    /// Adds `added_value` to the pool without minting shares, pulling the
    /// settlement asset from the operator.
    pub fn rebase(&mut self, caller: Pubkey, yield_token: Pubkey, added_value: u64) -> Result<u64> {
        self.transact("rebase", |rt| {
            let ctx = rt.ctx(caller);
            rt.require_vault_operator(&ctx)?;

            let new_total = rt.state.vault.rebase(&yield_token, added_value)?;
            let settlement = rt.state.vault.pool(&yield_token)?.order.settlement_asset;
            let vault = rt.state.vault.address();
            rt.move_asset(settlement, caller, vault, added_value)?;

            rt.emit(PlatformEvent::Rebased {
                yield_token,
                added_value,
                new_total_pooled: new_total,
                timestamp: ctx.timestamp,
            });
            Ok(new_total)
        })
    }

    /// Raises the pool to the fresh oracle total for `(yield_token, settlement)`.
    /// Returns the value added, zero when the submission was already applied.
    pub fn sync_oracle_yield(&mut self, caller: Pubkey, yield_token: Pubkey) -> Result<u64> {
        self.transact("sync_oracle_yield", |rt| {
            let ctx = rt.ctx(caller);
            rt.require_vault_operator(&ctx)?;

            let settlement = rt.state.vault.pool(&yield_token)?.order.settlement_asset;
            let record = rt.state.oracle.get_fresh_data(&yield_token, &settlement, ctx.timestamp)?;
            let added = rt
                .state
                .vault
                .accrue_to_oracle(&yield_token, record.values.total_value, record.submission_id)?;

            if added > 0 {
                let new_total_pooled = rt.state.vault.pool(&yield_token)?.total_pooled;
                rt.emit(PlatformEvent::Rebased {
                    yield_token,
                    added_value: added,
                    new_total_pooled,
                    timestamp: ctx.timestamp,
                });
            }
            Ok(added)
        })
    }

    /// Returns deployed value to the vault from the operator's balance.
    pub fn return_liquidity(&mut self, caller: Pubkey, yield_token: Pubkey, amount: u64) -> Result<()> {
        self.transact("return_liquidity", |rt| {
            let ctx = rt.ctx(caller);
            rt.require_vault_operator(&ctx)?;

            rt.state.vault.return_liquidity(&yield_token, amount)?;
            let settlement = rt.state.vault.pool(&yield_token)?.order.settlement_asset;
            let vault = rt.state.vault.address();
            rt.move_asset(settlement, caller, vault, amount)?;

            rt.emit(PlatformEvent::LiquidityReturned {
                yield_token,
                amount,
                timestamp: ctx.timestamp,
            });
            Ok(())
        })
    }

    /// Files a `TransferLiquidity` call request with the vault as submitter.
    /// Nothing moves until the request is confirmed and executed.
    pub fn request_liquidity_transfer(
        &mut self,
        caller: Pubkey,
        yield_token: Pubkey,
        amount: u64,
        recipient: Pubkey,
    ) -> Result<u64> {
        self.transact("request_liquidity_transfer", |rt| {
            let ctx = rt.ctx(caller);
            rt.require_vault_operator(&ctx)?;
            if amount == 0 {
                return Err(PlatformError::BadAmount(0));
            }
            if recipient == Pubkey::default() {
                return Err(PlatformError::BadAddress(recipient));
            }
            rt.state.vault.pool(&yield_token)?;

            let vault = rt.state.vault.address();
            let vault_ctx = TxContext::new(vault, ctx.timestamp);
            let call = PrivilegedCall::TransferLiquidity {
                yield_token,
                amount,
                recipient,
            };
            rt.state.authority.submit_call_request(&vault_ctx, vault, call)
        })
    }

    /// Buys teller units with liquid value. Needs `TriggerCaller`.
    pub fn teller_buy(&mut self, caller: Pubkey, yield_token: Pubkey, amount: u64) -> Result<u64> {
        self.transact("teller_buy", |rt| {
            let ctx = rt.ctx(caller);
            rt.state.access.require_role(Role::TriggerCaller, &ctx)?;
            rt.apply_teller_buy(yield_token, amount)
        })
    }

    /// Sells teller units back into liquid value. Needs `TriggerCaller`.
    pub fn teller_sell(&mut self, caller: Pubkey, yield_token: Pubkey, units: u64) -> Result<u64> {
        self.transact("teller_sell", |rt| {
            let ctx = rt.ctx(caller);
            rt.state.access.require_role(Role::TriggerCaller, &ctx)?;
            rt.apply_teller_sell(yield_token, units)
        })
    }

    // ---- internals ----

    fn transact<T>(&mut self, label: &'static str, op: impl FnOnce(&mut Self) -> Result<T>) -> Result<T> {
        let snapshot = self.state.clone();
        let event_count = self.events.len();
        match op(self) {
            Ok(value) => Ok(value),
            Err(err) => {
                warn!("{} reverted: {}", label, err);
                self.state = snapshot;
                self.events.truncate(event_count);
                Err(err)
            }
        }
    }

    fn ctx(&self, caller: Pubkey) -> TxContext {
        TxContext::new(caller, self.clock)
    }

    fn emit(&mut self, event: PlatformEvent) {
        debug!("Event: {:?}", event);
        self.events.push(event);
    }

    fn require_vault_operator(&self, ctx: &TxContext) -> Result<()> {
        if !self.state.access.has_role(Role::VaultOperator, &ctx.caller) {
            warn!("Vault operator call rejected for {}", ctx.caller);
            return Err(PlatformError::NotOperator(ctx.caller));
        }
        Ok(())
    }

    fn activate_root(&mut self, caller: Pubkey, root: MerkleRoot, signature: &Signature, expiry: i64) -> Result<()> {
        let ctx = self.ctx(caller);
        self.state
            .membership
            .set_root_active_by_signature(&ctx, root, signature, expiry)?;
        self.emit(PlatformEvent::RootActivatedBySignature {
            root,
            expiry,
            timestamp: ctx.timestamp,
        });
        Ok(())
    }

    fn apply_role(&mut self, caller: Pubkey, role: Role, account: Pubkey, granted: bool) -> Result<()> {
        let ctx = self.ctx(caller);
        if granted {
            self.state.access.grant_role(&ctx, role, account)?;
        } else {
            self.state.access.revoke_role(&ctx, role, account)?;
        }
        self.emit(PlatformEvent::RoleChanged {
            role,
            account,
            granted,
            timestamp: ctx.timestamp,
        });
        Ok(())
    }

    /// Runs the effect of an executed call request against its target.
    fn dispatch(&mut self, request: &CallRequest) -> Result<()> {
        let vault = self.state.vault.address();
        let access = self.state.access.address();
        let authority = self.state.authority.address();
        debug!("Dispatching call request {} to {}", request.id, request.target);

        match request.call {
            PrivilegedCall::TransferLiquidity {
                yield_token,
                amount,
                recipient,
            } if request.target == vault => self.apply_liquidity_transfer(yield_token, amount, recipient),
            PrivilegedCall::TellerBuy { yield_token, amount } if request.target == vault => {
                self.apply_teller_buy(yield_token, amount).map(|_| ())
            }
            PrivilegedCall::TellerSell { yield_token, units } if request.target == vault => {
                self.apply_teller_sell(yield_token, units).map(|_| ())
            }
            PrivilegedCall::GrantRole { role, account } if request.target == access => {
                self.apply_role(authority, role, account, true)
            }
            PrivilegedCall::RevokeRole { role, account } if request.target == access => {
                self.apply_role(authority, role, account, false)
            }
            _ => Err(PlatformError::BadAddress(request.target)),
        }
    }

    fn apply_liquidity_transfer(&mut self, yield_token: Pubkey, amount: u64, recipient: Pubkey) -> Result<()> {
        self.state.vault.move_liquidity_out(&yield_token, amount)?;
        let settlement = self.state.vault.pool(&yield_token)?.order.settlement_asset;
        let vault = self.state.vault.address();
        self.move_asset(settlement, vault, recipient, amount)?;

        self.emit(PlatformEvent::LiquidityTransferred {
            yield_token,
            amount,
            recipient,
            timestamp: self.clock,
        });
        Ok(())
    }

    fn apply_teller_buy(&mut self, yield_token: Pubkey, amount: u64) -> Result<u64> {
        self.state.vault.move_liquidity_out(&yield_token, amount)?;
        let settlement = self.state.vault.pool(&yield_token)?.order.settlement_asset;
        let units = self.buy_through_teller(&yield_token, &settlement, amount)?;
        self.state.vault.record_teller_buy(&yield_token, units)?;

        self.emit(PlatformEvent::TellerBought {
            yield_token,
            amount,
            units,
            timestamp: self.clock,
        });
        Ok(units)
    }

    fn apply_teller_sell(&mut self, yield_token: Pubkey, units: u64) -> Result<u64> {
        self.state.vault.release_teller_units(&yield_token, units)?;
        let settlement = self.state.vault.pool(&yield_token)?.order.settlement_asset;
        let proceeds = self.sell_through_teller(&yield_token, &settlement, units)?;
        self.state.vault.record_teller_proceeds(&yield_token, proceeds)?;

        self.emit(PlatformEvent::TellerSold {
            yield_token,
            units,
            proceeds,
            timestamp: self.clock,
        });
        Ok(proceeds)
    }

    fn forward_deposit(&mut self, yield_token: &Pubkey, order: &Order, value: u64) -> Result<()> {
        let vault = self.state.vault.address();
        if order.redirect {
            let units = self.buy_through_teller(yield_token, &order.settlement_asset, value)?;
            self.state.vault.record_teller_buy(yield_token, units)?;
            self.emit(PlatformEvent::TellerBought {
                yield_token: *yield_token,
                amount: value,
                units,
                timestamp: self.clock,
            });
        } else if order.beneficiary != vault {
            self.move_asset(order.settlement_asset, vault, order.beneficiary, value)?;
        }
        Ok(())
    }

    /// Pays `value` of the settlement asset to `recipient`, swapped along the
    /// payout route when one is given.
    fn pay_out(&mut self, recipient: Pubkey, settlement: Pubkey, value: u64, payout: &Payout) -> Result<(u64, Pubkey)> {
        let vault = self.state.vault.address();
        if payout.route.is_empty() {
            if payout.output_token != settlement {
                return Err(PlatformError::BadRoute(format!(
                    "direct payout must be in {}, got {}",
                    settlement, payout.output_token
                )));
            }
            self.move_asset(settlement, vault, recipient, value)?;
            return Ok((value, settlement));
        }

        if payout.route[0].token != settlement {
            return Err(PlatformError::BadRoute(format!(
                "payout route must start at {}",
                settlement
            )));
        }
        let path = SwapPath {
            hops: payout.route.clone(),
            output: payout.output_token,
        };
        let paid = self.swap_on_vault(&path, value, payout.min_out)?;
        self.move_asset(payout.output_token, vault, recipient, paid)?;
        Ok((paid, payout.output_token))
    }

    /// Swaps vault-held input along `path`. The received amount is the vault's
    /// balance delta in the output asset, not the service's quote.
    fn swap_on_vault(&mut self, path: &SwapPath, amount_in: u64, min_out: u64) -> Result<u64> {
        let vault = self.state.vault.address();
        let before = self.state.assets.balance_of(&path.output, &vault);
        let quoted = self
            .swap
            .swap_exact_input(&mut self.state.assets, &vault, path, amount_in, min_out)
            .map_err(swap_error)?;
        let after = self.state.assets.balance_of(&path.output, &vault);

        let received = after.checked_sub(before).ok_or(PlatformError::Underflow)?;
        if received < min_out {
            return Err(PlatformError::SlippageExceeded { min_out, actual: received });
        }
        debug!("Swap quoted {} and delivered {} of {}", quoted, received, path.output);
        Ok(received)
    }

    fn teller(&self, yield_token: &Pubkey) -> Result<&dyn YieldTeller> {
        self.tellers
            .get(yield_token)
            .map(|teller| teller.as_ref())
            .ok_or_else(|| PlatformError::TellerFailed(format!("no teller registered for {}", yield_token)))
    }

    fn buy_through_teller(&mut self, yield_token: &Pubkey, settlement: &Pubkey, amount: u64) -> Result<u64> {
        let vault = self.state.vault.address();
        let teller = self
            .tellers
            .get_mut(yield_token)
            .ok_or_else(|| PlatformError::TellerFailed(format!("no teller registered for {}", yield_token)))?;
        teller
            .buy(&mut self.state.assets, &vault, settlement, amount)
            .map_err(teller_error)
    }

    fn sell_through_teller(&mut self, yield_token: &Pubkey, settlement: &Pubkey, units: u64) -> Result<u64> {
        let vault = self.state.vault.address();
        let teller = self
            .tellers
            .get_mut(yield_token)
            .ok_or_else(|| PlatformError::TellerFailed(format!("no teller registered for {}", yield_token)))?;
        teller
            .sell(&mut self.state.assets, &vault, settlement, units)
            .map_err(teller_error)
    }

    /// Moves an asset on the ledger, then runs the asset's transfer hook.
    /// The hook is detached while it runs, so it cannot recurse into itself.
    fn move_asset(&mut self, asset: Pubkey, from: Pubkey, to: Pubkey, amount: u64) -> Result<()> {
        self.state.assets.transfer(&asset, &from, &to, amount)?;

        if let Some(mut hook) = self.hooks.remove(&asset) {
            let transfer = AssetTransfer { asset, from, to, amount };
            let result = hook.on_transfer(self, &transfer);
            self.hooks.insert(asset, hook);
            result?;
        }
        Ok(())
    }
}

fn swap_error(err: ServiceError) -> PlatformError {
    match err {
        ServiceError::Slippage { min_out, actual } => PlatformError::SlippageExceeded { min_out, actual },
        other => PlatformError::SwapFailed(other.to_string()),
    }
}

fn teller_error(err: ServiceError) -> PlatformError {
    PlatformError::TellerFailed(err.to_string())
}
