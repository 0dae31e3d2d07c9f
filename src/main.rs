use anyhow::{Context, Result};
use rwa_vault_core::{
    DepositRequest, FixedRateSwap, FixedRateTeller, Genesis, MerkleTree, Payout, PlatformConfig, Role, Runtime,
};
use solana_sdk::pubkey::Pubkey;
use solana_sdk::signature::{Keypair, Signer};
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

fn main() -> Result<()> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    info!("Starting RWA vault core");

    let config = PlatformConfig::from_env().context("loading platform configuration")?;
    info!("Configuration loaded: {:?}", config);

    let deployer = Keypair::new();
    let operators: Vec<Pubkey> = (0..config.authority_threshold.max(2)).map(|_| Keypair::new().pubkey()).collect();
    let confirmers: Vec<Pubkey> = (0..config.oracle_threshold).map(|_| Keypair::new().pubkey()).collect();

    let genesis = Genesis {
        deployer: deployer.pubkey(),
        operators: operators.clone(),
        oracle_confirmers: confirmers,
        timestamp: chrono::Utc::now().timestamp(),
    };
    let mut runtime = Runtime::new(config.clone(), genesis, Box::new(FixedRateSwap::new()))?;

    // Seed one order so the platform can be exercised end to end
    let settlement = Pubkey::new_unique();
    let yield_token = Pubkey::new_unique();
    let operator = operators[0];
    runtime.grant_role(deployer.pubkey(), Role::VaultOperator, operator)?;
    runtime.register_teller(yield_token, Box::new(FixedRateTeller::new(Pubkey::new_unique())));
    runtime.setup_order(operator, yield_token, settlement, None, None)?;

    let depositor = Keypair::new().pubkey();
    let tree = MerkleTree::from_accounts(&[depositor, operator])?;
    let proof = tree.proof(&depositor).context("depositor missing from allow-list")?;
    runtime.set_root(deployer.pubkey(), tree.root(), true)?;

    let amount = config.default_minimum_deposit.max(100);
    runtime.fund_account(settlement, depositor, amount)?;
    runtime.fund_account(settlement, operator, amount / 10)?;

    let receipt = runtime.deposit(depositor, DepositRequest::with_proof(tree.root(), proof, yield_token, amount))?;
    runtime.rebase(operator, yield_token, amount / 10)?;
    info!(
        "Deposited {} for {} shares; redeemable now {}",
        receipt.value,
        receipt.shares,
        runtime.redeemable_value(&yield_token, &depositor)?
    );

    let claim_id = runtime.request_withdraw(depositor, yield_token, receipt.shares)?;
    runtime.approve_request_withdraw(operator, &[claim_id])?;
    let redemption = runtime.withdraw(depositor, claim_id, Payout::direct(settlement))?;
    info!(
        "Claim {} ({}) redeemed for {}",
        claim_id,
        runtime.vault().claims().token_name(claim_id),
        redemption.paid
    );

    runtime.check_invariants(&yield_token)?;
    println!("{}", serde_json::to_string_pretty(&runtime.events_json()?)?);

    info!("RWA vault core finished");
    Ok(())
}
