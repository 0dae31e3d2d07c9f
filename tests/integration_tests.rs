use rwa_vault_core::{
    activation_digest, error::PlatformError, CallOutcome, ClaimState, DepositRequest, FixedRateSwap, FixedRateTeller,
    Genesis, MerkleTree, OracleValues, Payout, PlatformConfig, PrivilegedCall, RequestId, Role, RoleChange, Runtime,
    SwapHop,
};
use solana_sdk::pubkey::Pubkey;
use solana_sdk::signature::{Keypair, Signer};

const GENESIS_TIME: i64 = 1_700_000_000;
const STARTING_BALANCE: u64 = 1_000_000;

struct Fixture {
    rt: Runtime,
    deployer: Pubkey,
    operators: Vec<Pubkey>,
    confirmers: Vec<Pubkey>,
    settlement: Pubkey,
    quote: Pubkey,
    yield_token: Pubkey,
    users: Vec<Pubkey>,
    tree: MerkleTree,
}

impl Fixture {
    fn operator(&self) -> Pubkey {
        self.operators[0]
    }

    fn deposit(&mut self, user: Pubkey, amount: u64) -> Result<u64, PlatformError> {
        let proof = self.tree.proof(&user).unwrap();
        let request = DepositRequest::with_proof(self.tree.root(), proof, self.yield_token, amount);
        self.rt.deposit(user, request).map(|receipt| receipt.shares)
    }

    fn confirm_by(&mut self, request: RequestId, count: usize) {
        for operator in self.operators.clone().into_iter().take(count) {
            self.rt.confirm(operator, request).unwrap();
        }
    }

    fn settlement_balance(&self, owner: &Pubkey) -> u64 {
        self.rt.balance_of(&self.settlement, owner)
    }
}

fn setup_platform() -> Fixture {
    let deployer = Pubkey::new_unique();
    let operators: Vec<Pubkey> = (0..4).map(|_| Pubkey::new_unique()).collect();
    let confirmers: Vec<Pubkey> = (0..3).map(|_| Pubkey::new_unique()).collect();
    let settlement = Pubkey::new_unique();
    let quote = Pubkey::new_unique();
    let yield_token = Pubkey::new_unique();

    let swap = FixedRateSwap::new()
        .with_rate(quote, settlement, 1, 1)
        .with_rate(settlement, quote, 2, 1);
    let genesis = Genesis {
        deployer,
        operators: operators.clone(),
        oracle_confirmers: confirmers.clone(),
        timestamp: GENESIS_TIME,
    };
    let mut rt = Runtime::new(PlatformConfig::default(), genesis, Box::new(swap)).unwrap();

    rt.register_teller(yield_token, Box::new(FixedRateTeller::new(Pubkey::new_unique())));
    rt.grant_role(deployer, Role::VaultOperator, operators[0]).unwrap();
    rt.grant_role(deployer, Role::TriggerCaller, operators[0]).unwrap();
    rt.setup_order(operators[0], yield_token, settlement, Some(1), None).unwrap();

    let users: Vec<Pubkey> = (0..3).map(|_| Pubkey::new_unique()).collect();
    let tree = MerkleTree::from_accounts(&users).unwrap();
    rt.set_root(deployer, tree.root(), true).unwrap();
    for user in &users {
        rt.fund_account(settlement, *user, STARTING_BALANCE).unwrap();
        rt.fund_account(quote, *user, STARTING_BALANCE).unwrap();
    }
    rt.fund_account(settlement, operators[0], STARTING_BALANCE).unwrap();

    Fixture {
        rt,
        deployer,
        operators,
        confirmers,
        settlement,
        quote,
        yield_token,
        users,
        tree,
    }
}

#[cfg(test)]
mod authority_flow_tests {
    use super::*;

    #[test]
    fn test_operator_ring_add_and_remove() {
        let mut fx = setup_platform();
        let (a, b, c) = (fx.operators[0], fx.operators[1], fx.operators[2]);
        let e = Pubkey::new_unique();

        let add = fx.rt.submit_role_request(a, RoleChange::AddOperator(e)).unwrap();
        fx.rt.confirm(a, RequestId::Role(add)).unwrap();
        fx.rt.confirm(b, RequestId::Role(add)).unwrap();
        assert_eq!(fx.rt.execute(a, RequestId::Role(add)).unwrap(), CallOutcome::Applied);
        assert_eq!(fx.rt.authority().operators().len(), 5);
        assert!(fx.rt.authority().is_operator(&e));

        let remove = fx.rt.submit_role_request(a, RoleChange::RemoveOperator(e)).unwrap();
        for operator in [a, b, c] {
            fx.rt.confirm(operator, RequestId::Role(remove)).unwrap();
        }
        fx.rt.execute(a, RequestId::Role(remove)).unwrap();
        assert_eq!(fx.rt.authority().operators().len(), 4);
        assert!(!fx.rt.authority().is_operator(&e));
    }

    #[test]
    fn test_role_grant_through_call_request() {
        let mut fx = setup_platform();
        let authority = fx.rt.authority().address();
        let access = fx.rt.access().address();
        let trigger = Pubkey::new_unique();

        fx.rt.transfer_role_admin(fx.deployer, authority).unwrap();
        assert_eq!(
            fx.rt.grant_role(fx.deployer, Role::TriggerCaller, trigger),
            Err(PlatformError::NotAdmin(fx.deployer))
        );

        let call = PrivilegedCall::GrantRole { role: Role::TriggerCaller, account: trigger };
        let id = fx.rt.submit_call_request(fx.operator(), access, call).unwrap();
        fx.confirm_by(RequestId::Call(id), 2);
        assert_eq!(fx.rt.execute(fx.operators[1], RequestId::Call(id)).unwrap(), CallOutcome::Succeeded);
        assert!(fx.rt.access().has_role(Role::TriggerCaller, &trigger));

        let request = fx.rt.authority().call_request(id).unwrap();
        assert!(request.executed);
        assert_eq!(request.outcome, Some(CallOutcome::Succeeded));
    }

    #[test]
    fn test_call_to_wrong_target_reverts() {
        let mut fx = setup_platform();
        let vault = fx.rt.vault().address();
        let call = PrivilegedCall::GrantRole { role: Role::VaultOperator, account: Pubkey::new_unique() };

        let id = fx.rt.submit_call_request(fx.operator(), vault, call).unwrap();
        fx.confirm_by(RequestId::Call(id), 2);
        let outcome = fx.rt.execute(fx.operator(), RequestId::Call(id)).unwrap();

        assert!(matches!(outcome, CallOutcome::Reverted(_)));
        assert!(fx.rt.authority().call_request(id).unwrap().executed);
    }
}

#[cfg(test)]
mod vault_flow_tests {
    use super::*;

    #[test]
    fn test_deposit_rebase_withdraw() {
        let mut fx = setup_platform();
        let user = fx.users[0];
        let operator = fx.operator();

        assert_eq!(fx.deposit(user, 100).unwrap(), 100);
        assert_eq!(fx.settlement_balance(&user), STARTING_BALANCE - 100);

        fx.rt.rebase(operator, fx.yield_token, 10).unwrap();
        assert_eq!(fx.rt.share_balance(&fx.yield_token, &user), 100);
        assert_eq!(fx.rt.redeemable_value(&fx.yield_token, &user).unwrap(), 110);

        let claim_id = fx.rt.request_withdraw(user, fx.yield_token, 100).unwrap();
        assert_eq!(claim_id, 1);
        fx.rt.approve_request_withdraw(operator, &[claim_id]).unwrap();
        let receipt = fx.rt.withdraw(user, claim_id, Payout::direct(fx.settlement)).unwrap();

        assert_eq!(receipt.value, 110);
        assert_eq!(receipt.paid, 110);
        assert_eq!(fx.settlement_balance(&user), STARTING_BALANCE + 10);
        assert_eq!(fx.rt.vault().claims().claim(claim_id).unwrap().state, ClaimState::Redeemed);
        fx.rt.check_invariants(&fx.yield_token).unwrap();
    }

    #[test]
    fn test_transferred_claim_pays_current_owner() {
        let mut fx = setup_platform();
        let (x, y) = (fx.users[0], fx.users[1]);
        let operator = fx.operator();

        fx.deposit(x, 500).unwrap();
        let claim_id = fx.rt.request_withdraw(x, fx.yield_token, 200).unwrap();
        fx.rt.transfer_claim(x, claim_id, y).unwrap();
        fx.rt.approve_request_withdraw(operator, &[claim_id]).unwrap();

        assert_eq!(
            fx.rt.withdraw(x, claim_id, Payout::direct(fx.settlement)),
            Err(PlatformError::NotOwner { claim_id, caller: x })
        );
        let before = fx.settlement_balance(&y);
        fx.rt.withdraw(y, claim_id, Payout::direct(fx.settlement)).unwrap();
        assert_eq!(fx.settlement_balance(&y), before + 200);
        assert_eq!(fx.rt.share_balance(&fx.yield_token, &x), 300);
        assert_eq!(fx.rt.vault().claims().owner_of(claim_id).unwrap(), y);
    }

    #[test]
    fn test_approval_gates() {
        let mut fx = setup_platform();
        let user = fx.users[0];
        fx.deposit(user, 100).unwrap();
        let claim_id = fx.rt.request_withdraw(user, fx.yield_token, 50).unwrap();

        assert_eq!(
            fx.rt.withdraw(user, claim_id, Payout::direct(fx.settlement)),
            Err(PlatformError::NotApproved(claim_id))
        );
        assert_eq!(
            fx.rt.approve_request_withdraw(user, &[claim_id]),
            Err(PlatformError::NotOperator(user))
        );
        // Authority operators are not vault operators unless granted the role
        assert_eq!(
            fx.rt.approve_request_withdraw(fx.operators[1], &[claim_id]),
            Err(PlatformError::NotOperator(fx.operators[1]))
        );
        assert_eq!(
            fx.rt.request_withdraw(user, fx.yield_token, 51),
            Err(PlatformError::InsufficientShares { available: 50, required: 51 })
        );
    }

    #[test]
    fn test_deposit_requires_membership() {
        let mut fx = setup_platform();
        let outsider = Pubkey::new_unique();
        fx.rt.fund_account(fx.settlement, outsider, 1_000).unwrap();
        let proof = fx.tree.proof(&fx.users[0]).unwrap();

        let request = DepositRequest::with_proof(fx.tree.root(), proof, fx.yield_token, 100);
        assert_eq!(fx.rt.deposit(outsider, request), Err(PlatformError::NotWhitelisted(outsider)));

        fx.rt.set_status_disable_address(fx.deployer, fx.users[1], true).unwrap();
        assert_eq!(fx.deposit(fx.users[1], 100), Err(PlatformError::NotWhitelisted(fx.users[1])));
        assert_eq!(fx.settlement_balance(&fx.users[1]), STARTING_BALANCE);
    }

    #[test]
    fn test_deposit_with_signature_activated_root() {
        let mut fx = setup_platform();
        let newcomer = Pubkey::new_unique();
        fx.rt.fund_account(fx.settlement, newcomer, 1_000).unwrap();
        let oracle = Keypair::new();
        fx.rt.set_membership_oracle(fx.deployer, oracle.pubkey()).unwrap();

        let tree = MerkleTree::from_accounts(&[newcomer]).unwrap();
        let expiry = GENESIS_TIME + 3_600;
        let chain_id = fx.rt.config().chain_id;
        let signature = oracle.sign_message(&activation_digest(chain_id, &tree.root(), expiry));

        let stale = DepositRequest::with_proof(tree.root(), vec![], fx.yield_token, 100)
            .signed(signature, GENESIS_TIME - 1);
        assert!(matches!(
            fx.rt.deposit(newcomer, stale),
            Err(PlatformError::ExpiredSignature { .. })
        ));
        assert!(!fx.rt.membership().is_root_active(&tree.root()));

        let request = DepositRequest::with_proof(tree.root(), vec![], fx.yield_token, 100).signed(signature, expiry);
        fx.rt.deposit(newcomer, request).unwrap();
        assert!(fx.rt.membership().is_root_active(&tree.root()));
        assert_eq!(fx.rt.share_balance(&fx.yield_token, &newcomer), 100);
    }

    #[test]
    fn test_routed_deposit_and_payout() {
        let mut fx = setup_platform();
        let user = fx.users[2];

        let request = DepositRequest::with_proof(fx.tree.root(), fx.tree.proof(&user).unwrap(), fx.yield_token, 300)
            .routed(vec![SwapHop::new(fx.quote, 0)], 300);
        let receipt = fx.rt.deposit(user, request).unwrap();
        assert_eq!(receipt.value, 300);
        assert_eq!(fx.rt.balance_of(&fx.quote, &user), STARTING_BALANCE - 300);
        assert_eq!(fx.settlement_balance(&user), STARTING_BALANCE);

        let greedy = DepositRequest::with_proof(fx.tree.root(), fx.tree.proof(&user).unwrap(), fx.yield_token, 10)
            .routed(vec![SwapHop::new(fx.quote, 0)], 11);
        assert_eq!(
            fx.rt.deposit(user, greedy),
            Err(PlatformError::SlippageExceeded { min_out: 11, actual: 10 })
        );
        assert_eq!(fx.rt.balance_of(&fx.quote, &user), STARTING_BALANCE - 300);

        let claim_id = fx.rt.request_withdraw(user, fx.yield_token, 100).unwrap();
        fx.rt.approve_request_withdraw(fx.operator(), &[claim_id]).unwrap();
        let payout = Payout {
            route: vec![SwapHop::new(fx.settlement, 0)],
            output_token: fx.quote,
            min_out: 200,
        };
        let receipt = fx.rt.withdraw(user, claim_id, payout).unwrap();
        assert_eq!(receipt.value, 100);
        assert_eq!(receipt.paid, 200);
        assert_eq!(receipt.paid_token, fx.quote);
        assert_eq!(fx.rt.balance_of(&fx.quote, &user), STARTING_BALANCE - 100);
    }

    #[test]
    fn test_direct_payout_must_use_settlement_asset() {
        let mut fx = setup_platform();
        let user = fx.users[0];
        fx.deposit(user, 100).unwrap();
        let claim_id = fx.rt.request_withdraw(user, fx.yield_token, 100).unwrap();
        fx.rt.approve_request_withdraw(fx.operator(), &[claim_id]).unwrap();

        assert!(matches!(
            fx.rt.withdraw(user, claim_id, Payout::direct(fx.quote)),
            Err(PlatformError::BadRoute(_))
        ));
        // The failed attempt left the claim redeemable
        assert_eq!(fx.rt.vault().claims().claim(claim_id).unwrap().state, ClaimState::Approved);
        fx.rt.withdraw(user, claim_id, Payout::direct(fx.settlement)).unwrap();
    }

    #[test]
    fn test_redirect_mode() {
        let mut fx = setup_platform();
        let user = fx.users[0];
        let operator = fx.operator();
        fx.deposit(user, 100).unwrap();

        assert_eq!(
            fx.rt.redirect_withdraw(user, fx.yield_token, 10, Payout::direct(fx.settlement)),
            Err(PlatformError::RedirectDisabled(fx.yield_token))
        );

        fx.rt.set_redirect(operator, fx.yield_token, true).unwrap();
        fx.deposit(user, 200).unwrap();
        let pool = fx.rt.vault().pool(&fx.yield_token).unwrap();
        assert_eq!(pool.teller_units, 200);
        assert_eq!((pool.value_in, pool.value_out), (100, 200));

        let before = fx.settlement_balance(&user);
        let receipt = fx
            .rt
            .redirect_withdraw(user, fx.yield_token, 150, Payout::direct(fx.settlement))
            .unwrap();
        assert_eq!(receipt.value, 150);
        assert_eq!(fx.settlement_balance(&user), before + 150);
        assert_eq!(fx.rt.share_balance(&fx.yield_token, &user), 150);
        assert_eq!(fx.rt.vault().claims().len(), 0);
        fx.rt.check_invariants(&fx.yield_token).unwrap();
    }

    #[test]
    fn test_redirect_rounding_settles_every_unit() {
        let mut fx = setup_platform();
        let (early, late) = (fx.users[0], fx.users[1]);
        let operator = fx.operator();

        let mut teller = FixedRateTeller::new(Pubkey::new_unique());
        teller.set_price(3, 2);
        fx.rt.register_teller(fx.yield_token, Box::new(teller));
        fx.rt.set_redirect(operator, fx.yield_token, true).unwrap();

        fx.deposit(early, 100).unwrap();
        fx.deposit(late, 50).unwrap();
        assert_eq!(fx.rt.vault().pool(&fx.yield_token).unwrap().teller_units, 99);

        // 34 units rounded up sell for 51; the extra 1 stays with the pool
        let receipt = fx
            .rt
            .redirect_withdraw(late, fx.yield_token, 50, Payout::direct(fx.settlement))
            .unwrap();
        assert_eq!((receipt.value, receipt.paid), (50, 50));
        let pool = fx.rt.vault().pool(&fx.yield_token).unwrap();
        assert_eq!((pool.value_in, pool.value_out, pool.teller_units), (1, 100, 65));
        fx.rt.check_invariants(&fx.yield_token).unwrap();

        // Last position sells what is left instead of failing on a rounded-up quote
        let receipt = fx
            .rt
            .redirect_withdraw(early, fx.yield_token, 100, Payout::direct(fx.settlement))
            .unwrap();
        assert_eq!((receipt.value, receipt.paid), (101, 98));
        assert_eq!(fx.settlement_balance(&early), STARTING_BALANCE - 2);

        let pool = fx.rt.vault().pool(&fx.yield_token).unwrap();
        assert_eq!(
            (pool.total_shares, pool.total_pooled, pool.value_in, pool.value_out, pool.teller_units),
            (0, 0, 0, 0, 0)
        );
        assert_eq!(fx.settlement_balance(&fx.rt.vault().address()), 0);
        fx.rt.check_invariants(&fx.yield_token).unwrap();
    }

    #[test]
    fn test_liquidity_transfer_requires_threshold_execution() {
        let mut fx = setup_platform();
        let user = fx.users[0];
        let operator = fx.operator();
        let treasury = Pubkey::new_unique();
        fx.deposit(user, 100).unwrap();

        let id = fx.rt.request_liquidity_transfer(operator, fx.yield_token, 60, treasury).unwrap();
        let request = fx.rt.authority().call_request(id).unwrap();
        assert_eq!(request.submitter, fx.rt.vault().address());
        assert_eq!(fx.rt.balance_of(&fx.settlement, &treasury), 0);

        fx.confirm_by(RequestId::Call(id), 1);
        assert!(matches!(
            fx.rt.execute(operator, RequestId::Call(id)),
            Err(PlatformError::ThresholdNotMet { confirmations: 1, required: 2 })
        ));
        fx.rt.confirm(fx.operators[1], RequestId::Call(id)).unwrap();
        assert_eq!(fx.rt.execute(operator, RequestId::Call(id)).unwrap(), CallOutcome::Succeeded);
        assert_eq!(fx.rt.balance_of(&fx.settlement, &treasury), 60);

        // Only 40 is liquid, so the full redemption has to wait for returned liquidity
        let claim_id = fx.rt.request_withdraw(user, fx.yield_token, 100).unwrap();
        fx.rt.approve_request_withdraw(operator, &[claim_id]).unwrap();
        assert_eq!(
            fx.rt.withdraw(user, claim_id, Payout::direct(fx.settlement)),
            Err(PlatformError::InsufficientLiquidity { available: 40, required: 100 })
        );

        fx.rt.return_liquidity(operator, fx.yield_token, 60).unwrap();
        let receipt = fx.rt.withdraw(user, claim_id, Payout::direct(fx.settlement)).unwrap();
        assert_eq!(receipt.paid, 100);
        fx.rt.check_invariants(&fx.yield_token).unwrap();
    }

    #[test]
    fn test_teller_buy_and_sell() {
        let mut fx = setup_platform();
        let operator = fx.operator();
        fx.deposit(fx.users[0], 100).unwrap();

        assert_eq!(fx.rt.teller_buy(operator, fx.yield_token, 40).unwrap(), 40);
        let pool = fx.rt.vault().pool(&fx.yield_token).unwrap();
        assert_eq!((pool.value_in, pool.value_out, pool.teller_units), (60, 40, 40));

        assert_eq!(fx.rt.teller_sell(operator, fx.yield_token, 40).unwrap(), 40);
        let pool = fx.rt.vault().pool(&fx.yield_token).unwrap();
        assert_eq!((pool.value_in, pool.value_out, pool.teller_units), (100, 0, 0));

        let stranger = fx.operators[1];
        assert!(matches!(
            fx.rt.teller_buy(stranger, fx.yield_token, 10),
            Err(PlatformError::MissingRole { .. })
        ));
        fx.rt.check_invariants(&fx.yield_token).unwrap();
    }

    #[test]
    fn test_oracle_yield_sync() {
        let mut fx = setup_platform();
        let operator = fx.operator();
        let user = fx.users[0];
        fx.deposit(user, 100).unwrap();

        assert_eq!(
            fx.rt.sync_oracle_yield(operator, fx.yield_token),
            Err(PlatformError::NoOracleData)
        );
        fx.rt
            .submit_data(fx.confirmers[0], fx.yield_token, fx.settlement, OracleValues::new(800, 100, 150))
            .unwrap();

        assert_eq!(fx.rt.sync_oracle_yield(operator, fx.yield_token).unwrap(), 50);
        assert_eq!(fx.rt.sync_oracle_yield(operator, fx.yield_token).unwrap(), 0);
        assert_eq!(fx.rt.redeemable_value(&fx.yield_token, &user).unwrap(), 150);
        fx.rt.check_invariants(&fx.yield_token).unwrap();

        fx.rt.advance_time(7_201);
        assert!(matches!(
            fx.rt.sync_oracle_yield(operator, fx.yield_token),
            Err(PlatformError::StaleOracleData { .. })
        ));
    }

    #[test]
    fn test_events_are_exported_as_json() {
        let mut fx = setup_platform();
        let user = fx.users[0];
        fx.deposit(user, 100).unwrap();
        let claim_id = fx.rt.request_withdraw(user, fx.yield_token, 100).unwrap();

        let events = fx.rt.events_json().unwrap();
        let events = events.as_array().unwrap();
        let deposited = events.iter().find(|e| e["event"] == "deposited").unwrap();
        assert_eq!(deposited["user"], user.to_string());
        assert_eq!(deposited["shares"], 100);
        let requested = events.iter().find(|e| e["event"] == "withdraw_requested").unwrap();
        assert_eq!(requested["claim_id"], claim_id);

        let uri: serde_json::Value =
            serde_json::from_str(&fx.rt.vault().claims().token_uri(claim_id).unwrap()).unwrap();
        assert_eq!(uri["name"], "VaporFund Withdraw NFT #1");
    }
}
