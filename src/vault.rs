use std::collections::BTreeMap;

use solana_sdk::pubkey::Pubkey;
use tracing::{debug, info};

use crate::claims::{ClaimLedger, ClaimState, WithdrawalClaim};
use crate::error::{PlatformError, Result};
use crate::models::{DepositReceipt, TxContext, NATIVE_ASSET};

/// Shares minted for `amount` of value: `amount * total_shares / total_pooled`,
/// or 1:1 into an empty pool. Rounds down.
pub fn shares_for_deposit(amount: u64, total_shares: u64, total_pooled: u64) -> Result<u64> {
    if total_shares == 0 {
        return Ok(amount);
    }
    if total_pooled == 0 {
        return Err(PlatformError::InvariantViolated(
            "outstanding shares with no pooled value".to_string(),
        ));
    }
    let shares = u128::from(amount)
        .checked_mul(u128::from(total_shares))
        .ok_or(PlatformError::Overflow)?
        / u128::from(total_pooled);
    u64::try_from(shares).map_err(|_| PlatformError::Overflow)
}

/// Value redeemable for `shares`: `shares * total_pooled / total_shares`. Rounds down.
pub fn value_for_shares(shares: u64, total_shares: u64, total_pooled: u64) -> Result<u64> {
    if total_shares == 0 {
        return Ok(0);
    }
    let value = u128::from(shares)
        .checked_mul(u128::from(total_pooled))
        .ok_or(PlatformError::Overflow)?
        / u128::from(total_shares);
    u64::try_from(value).map_err(|_| PlatformError::Overflow)
}

/// Deposit terms for one yield token.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Order {
    pub settlement_asset: Pubkey,
    pub minimum_deposit: u64,
    /// Receives deposited settlement asset. The vault itself keeps it liquid.
    pub beneficiary: Pubkey,
    pub enabled: bool,
    /// Deposits are converted through the teller and redirect withdrawals are allowed.
    pub redirect: bool,
}

#[derive(Debug, Clone)]
pub struct Pool {
    pub order: Order,
    pub total_shares: u64,
    pub total_pooled: u64,
    /// Settlement asset held by the vault.
    pub value_in: u64,
    /// Value deployed outside the vault.
    pub value_out: u64,
    pub teller_units: u64,
    pub locked_shares: u64,
    pub last_oracle_submission: Option<u64>,
    accounts: BTreeMap<Pubkey, u64>,
}

impl Pool {
    fn new(order: Order) -> Self {
        Self {
            order,
            total_shares: 0,
            total_pooled: 0,
            value_in: 0,
            value_out: 0,
            teller_units: 0,
            locked_shares: 0,
            last_oracle_submission: None,
            accounts: BTreeMap::new(),
        }
    }

    pub fn share_balance(&self, account: &Pubkey) -> u64 {
        self.accounts.get(account).copied().unwrap_or(0)
    }

    pub fn accounts(&self) -> impl Iterator<Item = (&Pubkey, &u64)> {
        self.accounts.iter()
    }

    /// Value `shares` redeem for at the pool's current rate.
    pub fn value_of(&self, shares: u64) -> Result<u64> {
        value_for_shares(shares, self.total_shares, self.total_pooled)
    }

    fn debit_account(&mut self, account: &Pubkey, shares: u64) -> Result<()> {
        let available = self.share_balance(account);
        if available < shares {
            return Err(PlatformError::InsufficientShares { available, required: shares });
        }
        let remaining = available - shares;
        if remaining == 0 {
            self.accounts.remove(account);
        } else {
            self.accounts.insert(*account, remaining);
        }
        Ok(())
    }

    fn move_out(&mut self, amount: u64) -> Result<()> {
        if self.value_in < amount {
            return Err(PlatformError::InsufficientLiquidity {
                available: self.value_in,
                required: amount,
            });
        }
        self.value_in -= amount;
        self.value_out = self.value_out.checked_add(amount).ok_or(PlatformError::Overflow)?;
        Ok(())
    }

    fn move_in(&mut self, amount: u64) -> Result<()> {
        if self.value_out < amount {
            return Err(PlatformError::InsufficientLiquidity {
                available: self.value_out,
                required: amount,
            });
        }
        self.value_out -= amount;
        self.value_in = self.value_in.checked_add(amount).ok_or(PlatformError::Overflow)?;
        Ok(())
    }
}

/// Share accounting for every yield token plus the withdrawal claim arena.
///
/// The vault only books value; asset movement, role checks and external
/// services are driven by the runtime around these calls, always after the
/// booking has been applied.
#[derive(Debug, Clone)]
pub struct Vault {
    address: Pubkey,
    pools: BTreeMap<Pubkey, Pool>,
    claims: ClaimLedger,
}

impl Vault {
    pub fn new(address: Pubkey, claim_name_prefix: impl Into<String>) -> Self {
        Self {
            address,
            pools: BTreeMap::new(),
            claims: ClaimLedger::new(claim_name_prefix),
        }
    }

    pub fn address(&self) -> Pubkey {
        self.address
    }

    /// Pool for `yield_token`, or `PoolNotFound`.
    pub fn pool(&self, yield_token: &Pubkey) -> Result<&Pool> {
        self.pools.get(yield_token).ok_or(PlatformError::PoolNotFound(*yield_token))
    }

    fn pool_mut(&mut self, yield_token: &Pubkey) -> Result<&mut Pool> {
        self.pools.get_mut(yield_token).ok_or(PlatformError::PoolNotFound(*yield_token))
    }

    pub fn yield_tokens(&self) -> Vec<Pubkey> {
        self.pools.keys().copied().collect()
    }

    pub fn claims(&self) -> &ClaimLedger {
        &self.claims
    }

    pub fn share_balance(&self, yield_token: &Pubkey, account: &Pubkey) -> u64 {
        self.pools
            .get(yield_token)
            .map_or(0, |pool| pool.share_balance(account))
    }

    /// Value the account's unlocked shares would redeem for right now.
    pub fn redeemable_value(&self, yield_token: &Pubkey, account: &Pubkey) -> Result<u64> {
        let pool = self.pool(yield_token)?;
        pool.value_of(pool.share_balance(account))
    }

    /// Opens a pool for `yield_token` with its order.
    pub fn setup_order(&mut self, yield_token: Pubkey, order: Order) -> Result<()> {
        if yield_token == Pubkey::default() {
            return Err(PlatformError::BadAddress(yield_token));
        }
        if order.settlement_asset == NATIVE_ASSET {
            return Err(PlatformError::BadAddress(order.settlement_asset));
        }
        if self.pools.contains_key(&yield_token) {
            return Err(PlatformError::PoolAlreadyExists(yield_token));
        }

        info!(
            "Order set up for {}: settlement={}, minimum={}, beneficiary={}",
            yield_token, order.settlement_asset, order.minimum_deposit, order.beneficiary
        );
        self.pools.insert(yield_token, Pool::new(order));
        Ok(())
    }

    /// Opens or closes the order to deposits.
    pub fn set_order_enabled(&mut self, yield_token: &Pubkey, enabled: bool) -> Result<()> {
        self.pool_mut(yield_token)?.order.enabled = enabled;
        info!("Order {} enabled={}", yield_token, enabled);
        Ok(())
    }

    /// Switches the order in or out of redirect mode.
    pub fn set_redirect(&mut self, yield_token: &Pubkey, redirect: bool) -> Result<()> {
        self.pool_mut(yield_token)?.order.redirect = redirect;
        info!("Order {} redirect={}", yield_token, redirect);
        Ok(())
    }

    /// Mints shares for `value` at the current exchange rate.
    ///
    /// Checks:
    /// - Order must exist and be enabled
    /// - Value must be non-zero and at least the order minimum
    /// - Must mint at least one share
    pub fn credit_deposit(&mut self, user: &Pubkey, yield_token: &Pubkey, value: u64) -> Result<DepositReceipt> {
        let vault = self.address;
        let pool = self.pool_mut(yield_token)?;
        if !pool.order.enabled {
            return Err(PlatformError::OrderDisabled(*yield_token));
        }
        if value == 0 || value < pool.order.minimum_deposit {
            return Err(PlatformError::BadAmount(value));
        }

        let shares = shares_for_deposit(value, pool.total_shares, pool.total_pooled)?;
        if shares == 0 {
            return Err(PlatformError::BadAmount(value));
        }

        pool.total_shares = pool.total_shares.checked_add(shares).ok_or(PlatformError::Overflow)?;
        pool.total_pooled = pool.total_pooled.checked_add(value).ok_or(PlatformError::Overflow)?;
        if pool.order.beneficiary == vault && !pool.order.redirect {
            pool.value_in = pool.value_in.checked_add(value).ok_or(PlatformError::Overflow)?;
        } else {
            pool.value_out = pool.value_out.checked_add(value).ok_or(PlatformError::Overflow)?;
        }
        let balance = pool.share_balance(user).checked_add(shares).ok_or(PlatformError::Overflow)?;
        pool.accounts.insert(*user, balance);

        info!("Credited {} shares of {} to {} for value {}", shares, yield_token, user, value);
        Ok(DepositReceipt { shares, value })
    }

    /// Locks `shares` out of the caller's account into a new `Requested` claim.
    pub fn lock_for_withdrawal(&mut self, ctx: &TxContext, yield_token: &Pubkey, shares: u64) -> Result<u64> {
        if shares == 0 {
            return Err(PlatformError::BadAmount(0));
        }
        let pool = self.pool_mut(yield_token)?;
        pool.debit_account(&ctx.caller, shares)?;
        pool.locked_shares = pool.locked_shares.checked_add(shares).ok_or(PlatformError::Overflow)?;

        Ok(self.claims.open(ctx.caller, *yield_token, shares, ctx.timestamp))
    }

    /// Approves a non-empty batch of requested claims.
    pub fn approve_request_withdraw(&mut self, ids: &[u64]) -> Result<()> {
        if ids.is_empty() {
            return Err(PlatformError::BadAmount(0));
        }
        self.claims.approve_batch(ids)
    }

    /// Hands a claim ticket to another owner.
    pub fn transfer_claim(&mut self, ctx: &TxContext, id: u64, to: Pubkey) -> Result<()> {
        self.claims.transfer_claim(ctx, id, to)
    }

    /// Redeems an approved claim owned by the caller, burning its locked shares
    /// at the current exchange rate. Paid out of the vault's liquid value.
    /// Nothing changes unless every check passes.
    pub fn redeem_claim(&mut self, ctx: &TxContext, id: u64) -> Result<(WithdrawalClaim, u64)> {
        let mut claim = self.claims.redeemable(ctx, id)?;
        let pool = self.pool(&claim.yield_token)?;

        let value = pool.value_of(claim.shares)?;
        if pool.value_in < value {
            return Err(PlatformError::InsufficientLiquidity {
                available: pool.value_in,
                required: value,
            });
        }
        let locked_shares = pool.locked_shares.checked_sub(claim.shares).ok_or(PlatformError::Underflow)?;
        let total_shares = pool.total_shares.checked_sub(claim.shares).ok_or(PlatformError::Underflow)?;
        let total_pooled = pool.total_pooled.checked_sub(value).ok_or(PlatformError::Underflow)?;

        self.claims.mark_redeemed(id)?;
        claim.state = ClaimState::Redeemed;
        let pool = self.pool_mut(&claim.yield_token)?;
        pool.locked_shares = locked_shares;
        pool.total_shares = total_shares;
        pool.total_pooled = total_pooled;
        pool.value_in -= value;

        info!("Claim {} redeemed: {} shares for value {}", id, claim.shares, value);
        Ok((claim, value))
    }

    /// Value `shares` of the caller's account would settle for through the redirect path.
    pub fn preview_redirect(&self, user: &Pubkey, yield_token: &Pubkey, shares: u64) -> Result<u64> {
        let pool = self.pool(yield_token)?;
        if !pool.order.redirect {
            return Err(PlatformError::RedirectDisabled(*yield_token));
        }
        let available = pool.share_balance(user);
        if shares == 0 || available < shares {
            return Err(PlatformError::InsufficientShares { available, required: shares });
        }
        pool.value_of(shares)
    }

    /// Burns shares immediately against deployed value, releasing `units` of
    /// teller holdings to be sold for the payout.
    ///
    /// The pool's last position also takes whatever liquid value is left.
    /// Returns that liquid part, zero for any other position.
    pub fn burn_for_redirect(&mut self, user: &Pubkey, yield_token: &Pubkey, shares: u64, units: u64) -> Result<u64> {
        let value = self.preview_redirect(user, yield_token, shares)?;
        let pool = self.pool_mut(yield_token)?;
        let deployed = if shares == pool.total_shares {
            pool.value_out.min(value)
        } else {
            value
        };
        let liquid = value - deployed;
        if pool.value_out < deployed || pool.value_in < liquid || pool.teller_units < units {
            return Err(PlatformError::InsufficientLiquidity {
                available: pool.value_out,
                required: value,
            });
        }

        pool.debit_account(user, shares)?;
        pool.total_shares -= shares;
        pool.total_pooled = pool.total_pooled.checked_sub(value).ok_or(PlatformError::Underflow)?;
        pool.value_out -= deployed;
        pool.value_in -= liquid;
        pool.teller_units -= units;

        info!("Redirect burn of {} shares of {} by {} for value {}", shares, yield_token, user, value);
        Ok(liquid)
    }

    /// Books settlement left over from a redirect sale as liquid pool value.
    pub fn book_redirect_surplus(&mut self, yield_token: &Pubkey, surplus: u64) -> Result<()> {
        if surplus == 0 {
            return Ok(());
        }
        let pool = self.pool_mut(yield_token)?;
        pool.total_pooled = pool.total_pooled.checked_add(surplus).ok_or(PlatformError::Overflow)?;
        pool.value_in = pool.value_in.checked_add(surplus).ok_or(PlatformError::Overflow)?;
        debug!("Booked redirect surplus {} to {}", surplus, yield_token);
        Ok(())
    }

    /// Adds liquid value without minting shares. Returns the new pooled total.
    pub fn rebase(&mut self, yield_token: &Pubkey, added_value: u64) -> Result<u64> {
        if added_value == 0 {
            return Err(PlatformError::BadAmount(0));
        }
        let pool = self.pool_mut(yield_token)?;
        if pool.total_shares == 0 {
            return Err(PlatformError::EmptyPool(*yield_token));
        }

        pool.total_pooled = pool.total_pooled.checked_add(added_value).ok_or(PlatformError::Overflow)?;
        pool.value_in = pool.value_in.checked_add(added_value).ok_or(PlatformError::Overflow)?;

        info!("Rebased {} by {} (pooled now {})", yield_token, added_value, pool.total_pooled);
        Ok(pool.total_pooled)
    }

    /// Raises pooled value to the oracle-reported total, accruing the gain to
    /// deployed value. Applies at most once per oracle submission and never
    /// lowers the pool. Returns the value added.
    pub fn accrue_to_oracle(&mut self, yield_token: &Pubkey, reported_total: u64, submission_id: u64) -> Result<u64> {
        let pool = self.pool_mut(yield_token)?;
        if pool.last_oracle_submission == Some(submission_id) {
            debug!("Oracle submission {} already applied to {}", submission_id, yield_token);
            return Ok(0);
        }
        if pool.total_shares == 0 {
            return Err(PlatformError::EmptyPool(*yield_token));
        }

        pool.last_oracle_submission = Some(submission_id);
        let added = reported_total.saturating_sub(pool.total_pooled);
        pool.total_pooled = pool.total_pooled.checked_add(added).ok_or(PlatformError::Overflow)?;
        pool.value_out = pool.value_out.checked_add(added).ok_or(PlatformError::Overflow)?;

        info!("Accrued {} to {} from oracle submission {}", added, yield_token, submission_id);
        Ok(added)
    }

    /// Moves `amount` of liquid value to deployed value.
    pub fn move_liquidity_out(&mut self, yield_token: &Pubkey, amount: u64) -> Result<()> {
        if amount == 0 {
            return Err(PlatformError::BadAmount(0));
        }
        self.pool_mut(yield_token)?.move_out(amount)
    }

    /// Moves `amount` of deployed value back to liquid value.
    pub fn return_liquidity(&mut self, yield_token: &Pubkey, amount: u64) -> Result<()> {
        if amount == 0 {
            return Err(PlatformError::BadAmount(0));
        }
        self.pool_mut(yield_token)?.move_in(amount)
    }

    /// Adds teller units bought with deployed value.
    pub fn record_teller_buy(&mut self, yield_token: &Pubkey, units: u64) -> Result<()> {
        let pool = self.pool_mut(yield_token)?;
        pool.teller_units = pool.teller_units.checked_add(units).ok_or(PlatformError::Overflow)?;
        Ok(())
    }

    /// Releases `units` of teller holdings ahead of a sale.
    pub fn release_teller_units(&mut self, yield_token: &Pubkey, units: u64) -> Result<()> {
        if units == 0 {
            return Err(PlatformError::BadAmount(0));
        }
        let pool = self.pool_mut(yield_token)?;
        if pool.teller_units < units {
            return Err(PlatformError::InsufficientLiquidity {
                available: pool.teller_units,
                required: units,
            });
        }
        pool.teller_units -= units;
        Ok(())
    }

    /// Brings up to `proceeds` of deployed value back in. Returns the amount booked.
    pub fn record_teller_proceeds(&mut self, yield_token: &Pubkey, proceeds: u64) -> Result<u64> {
        let pool = self.pool_mut(yield_token)?;
        let returned = proceeds.min(pool.value_out);
        pool.move_in(returned)?;
        Ok(returned)
    }

    /// Share and value conservation for one pool:
    /// accounts + locked == total_shares, locked == outstanding claims,
    /// value_in + value_out == total_pooled.
    pub fn check_invariants(&self, yield_token: &Pubkey) -> Result<()> {
        let pool = self.pool(yield_token)?;

        let account_total = pool
            .accounts
            .values()
            .try_fold(0u64, |sum, shares| sum.checked_add(*shares))
            .ok_or(PlatformError::Overflow)?;
        let share_total = account_total.checked_add(pool.locked_shares).ok_or(PlatformError::Overflow)?;
        if share_total != pool.total_shares {
            return Err(PlatformError::InvariantViolated(format!(
                "{}: accounts {} + locked {} != total shares {}",
                yield_token, account_total, pool.locked_shares, pool.total_shares
            )));
        }

        let outstanding = self.claims.outstanding_shares(yield_token);
        if outstanding != pool.locked_shares {
            return Err(PlatformError::InvariantViolated(format!(
                "{}: outstanding claims {} != locked shares {}",
                yield_token, outstanding, pool.locked_shares
            )));
        }

        let value_total = pool.value_in.checked_add(pool.value_out).ok_or(PlatformError::Overflow)?;
        if value_total != pool.total_pooled {
            return Err(PlatformError::InvariantViolated(format!(
                "{}: value in {} + out {} != pooled {}",
                yield_token, pool.value_in, pool.value_out, pool.total_pooled
            )));
        }
        Ok(())
    }
}
