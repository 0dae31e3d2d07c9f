//! External collaborators at their interface boundary: the fungible asset
//! ledger, the swap service and the yield teller, plus deterministic
//! fixed-rate stand-ins for the services.

use std::collections::HashMap;

use solana_sdk::pubkey::Pubkey;
use thiserror::Error;
use tracing::debug;

use crate::error::{PlatformError, Result};
use crate::models::SwapPath;

/// Fee tiers are expressed in millionths, so 3000 is 0.3%.
pub const FEE_DENOMINATOR: u64 = 1_000_000;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ServiceError {
    #[error("output {actual} below minimum {min_out}")]
    Slippage { min_out: u64, actual: u64 },

    #[error("no route: {0}")]
    NoRoute(String),

    #[error("insufficient funds: available={available}, required={required}")]
    InsufficientFunds { available: u64, required: u64 },

    #[error("service unavailable: {0}")]
    Unavailable(String),
}

/// Fungible balances for every asset the platform touches, keyed by (asset, owner).
#[derive(Debug, Clone, Default)]
pub struct AssetLedger {
    balances: HashMap<(Pubkey, Pubkey), u64>,
    supply: HashMap<Pubkey, u64>,
}

impl AssetLedger {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn balance_of(&self, asset: &Pubkey, owner: &Pubkey) -> u64 {
        self.balances.get(&(*asset, *owner)).copied().unwrap_or(0)
    }

    pub fn total_supply(&self, asset: &Pubkey) -> u64 {
        self.supply.get(asset).copied().unwrap_or(0)
    }

    pub fn transfer(&mut self, asset: &Pubkey, from: &Pubkey, to: &Pubkey, amount: u64) -> Result<()> {
        if amount == 0 || from == to {
            return Ok(());
        }
        let available = self.balance_of(asset, from);
        let remaining = available.checked_sub(amount).ok_or(PlatformError::InsufficientBalance {
            asset: *asset,
            available,
            required: amount,
        })?;
        let credited = self
            .balance_of(asset, to)
            .checked_add(amount)
            .ok_or(PlatformError::Overflow)?;

        self.balances.insert((*asset, *from), remaining);
        self.balances.insert((*asset, *to), credited);
        debug!("Asset {} moved {} from {} to {}", asset, amount, from, to);
        Ok(())
    }

    pub fn mint(&mut self, asset: &Pubkey, to: &Pubkey, amount: u64) -> Result<()> {
        let supply = self.total_supply(asset).checked_add(amount).ok_or(PlatformError::Overflow)?;
        let balance = self.balance_of(asset, to).checked_add(amount).ok_or(PlatformError::Overflow)?;
        self.supply.insert(*asset, supply);
        self.balances.insert((*asset, *to), balance);
        Ok(())
    }

    pub fn burn(&mut self, asset: &Pubkey, from: &Pubkey, amount: u64) -> Result<()> {
        let available = self.balance_of(asset, from);
        let balance = available.checked_sub(amount).ok_or(PlatformError::InsufficientBalance {
            asset: *asset,
            available,
            required: amount,
        })?;
        let supply = self.total_supply(asset).checked_sub(amount).ok_or(PlatformError::Underflow)?;
        self.supply.insert(*asset, supply);
        self.balances.insert((*asset, *from), balance);
        Ok(())
    }
}

/// Price-taking swap executor. Spends `amount_in` of the path's input asset
/// held by `payer` and credits the path's output asset back to `payer`.
pub trait SwapService {
    fn swap_exact_input(
        &mut self,
        assets: &mut AssetLedger,
        payer: &Pubkey,
        path: &SwapPath,
        amount_in: u64,
        min_out: u64,
    ) -> std::result::Result<u64, ServiceError>;
}

/// Yield-protocol teller exchanging the settlement asset for its yield-bearing asset.
pub trait YieldTeller {
    fn yield_asset(&self) -> Pubkey;

    fn buy(
        &mut self,
        assets: &mut AssetLedger,
        holder: &Pubkey,
        settlement_asset: &Pubkey,
        amount: u64,
    ) -> std::result::Result<u64, ServiceError>;

    fn sell(
        &mut self,
        assets: &mut AssetLedger,
        holder: &Pubkey,
        settlement_asset: &Pubkey,
        units: u64,
    ) -> std::result::Result<u64, ServiceError>;

    /// Units that must be sold to raise at least `value` of the settlement asset.
    fn units_for_value(&self, value: u64) -> std::result::Result<u64, ServiceError>;
}

/// Swap stand-in quoting every hop at a fixed rate, less the hop's pool fee.
#[derive(Debug, Clone, Default)]
pub struct FixedRateSwap {
    rates: HashMap<(Pubkey, Pubkey), (u64, u64)>,
}

impl FixedRateSwap {
    pub fn new() -> Self {
        Self::default()
    }

    /// `amount_out = amount_in * numerator / denominator` before fees.
    pub fn with_rate(mut self, from: Pubkey, to: Pubkey, numerator: u64, denominator: u64) -> Self {
        self.rates.insert((from, to), (numerator, denominator));
        self
    }

    fn quote_hop(&self, from: &Pubkey, to: &Pubkey, amount: u64, fee: u32) -> std::result::Result<u64, ServiceError> {
        let (numerator, denominator) = self
            .rates
            .get(&(*from, *to))
            .copied()
            .ok_or_else(|| ServiceError::NoRoute(format!("{} -> {}", from, to)))?;
        if denominator == 0 || u64::from(fee) >= FEE_DENOMINATOR {
            return Err(ServiceError::NoRoute(format!("bad pool {} -> {}", from, to)));
        }

        let gross = u128::from(amount) * u128::from(numerator) / u128::from(denominator);
        let net = gross * u128::from(FEE_DENOMINATOR - u64::from(fee)) / u128::from(FEE_DENOMINATOR);
        u64::try_from(net).map_err(|_| ServiceError::Unavailable("quote overflow".to_string()))
    }
}

impl SwapService for FixedRateSwap {
    fn swap_exact_input(
        &mut self,
        assets: &mut AssetLedger,
        payer: &Pubkey,
        path: &SwapPath,
        amount_in: u64,
        min_out: u64,
    ) -> std::result::Result<u64, ServiceError> {
        let input = path.input().ok_or_else(|| ServiceError::NoRoute("empty path".to_string()))?;

        let mut amount = amount_in;
        for (index, hop) in path.hops.iter().enumerate() {
            let next = path.hops.get(index + 1).map_or(path.output, |next| next.token);
            amount = self.quote_hop(&hop.token, &next, amount, hop.pool_fee)?;
        }
        if amount < min_out {
            return Err(ServiceError::Slippage { min_out, actual: amount });
        }

        let available = assets.balance_of(&input, payer);
        assets.burn(&input, payer, amount_in).map_err(|_| ServiceError::InsufficientFunds {
            available,
            required: amount_in,
        })?;
        assets
            .mint(&path.output, payer, amount)
            .map_err(|e| ServiceError::Unavailable(e.to_string()))?;
        Ok(amount)
    }
}

/// Teller stand-in pricing one yield unit at `price_numerator / price_denominator`
/// of the settlement asset.
#[derive(Debug, Clone)]
pub struct FixedRateTeller {
    yield_asset: Pubkey,
    price_numerator: u64,
    price_denominator: u64,
}

impl FixedRateTeller {
    pub fn new(yield_asset: Pubkey) -> Self {
        Self {
            yield_asset,
            price_numerator: 1,
            price_denominator: 1,
        }
    }

    pub fn set_price(&mut self, numerator: u64, denominator: u64) {
        self.price_numerator = numerator;
        self.price_denominator = denominator.max(1);
    }

    fn value_of(&self, units: u64) -> std::result::Result<u64, ServiceError> {
        let value = u128::from(units) * u128::from(self.price_numerator) / u128::from(self.price_denominator);
        u64::try_from(value).map_err(|_| ServiceError::Unavailable("price overflow".to_string()))
    }
}

impl YieldTeller for FixedRateTeller {
    fn yield_asset(&self) -> Pubkey {
        self.yield_asset
    }

    fn buy(
        &mut self,
        assets: &mut AssetLedger,
        holder: &Pubkey,
        settlement_asset: &Pubkey,
        amount: u64,
    ) -> std::result::Result<u64, ServiceError> {
        if self.price_numerator == 0 {
            return Err(ServiceError::Unavailable("teller price unset".to_string()));
        }
        let units = u128::from(amount) * u128::from(self.price_denominator) / u128::from(self.price_numerator);
        let units = u64::try_from(units).map_err(|_| ServiceError::Unavailable("units overflow".to_string()))?;

        let available = assets.balance_of(settlement_asset, holder);
        assets
            .burn(settlement_asset, holder, amount)
            .map_err(|_| ServiceError::InsufficientFunds { available, required: amount })?;
        assets
            .mint(&self.yield_asset, holder, units)
            .map_err(|e| ServiceError::Unavailable(e.to_string()))?;
        Ok(units)
    }

    fn sell(
        &mut self,
        assets: &mut AssetLedger,
        holder: &Pubkey,
        settlement_asset: &Pubkey,
        units: u64,
    ) -> std::result::Result<u64, ServiceError> {
        let proceeds = self.value_of(units)?;

        let available = assets.balance_of(&self.yield_asset, holder);
        assets
            .burn(&self.yield_asset, holder, units)
            .map_err(|_| ServiceError::InsufficientFunds { available, required: units })?;
        assets
            .mint(settlement_asset, holder, proceeds)
            .map_err(|e| ServiceError::Unavailable(e.to_string()))?;
        Ok(proceeds)
    }

    fn units_for_value(&self, value: u64) -> std::result::Result<u64, ServiceError> {
        if self.price_numerator == 0 {
            return Err(ServiceError::Unavailable("teller price unset".to_string()));
        }
        let numerator = u128::from(value) * u128::from(self.price_denominator);
        let units = (numerator + u128::from(self.price_numerator) - 1) / u128::from(self.price_numerator);
        u64::try_from(units).map_err(|_| ServiceError::Unavailable("units overflow".to_string()))
    }
}
