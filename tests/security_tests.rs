use std::cell::RefCell;
use std::rc::Rc;

use mockall::mock;
use rwa_vault_core::{
    activation_digest,
    error::{ErrorKind, PlatformError},
    AssetLedger, AssetTransfer, CallOutcome, ClaimState, DepositRequest, FixedRateSwap, Genesis, MerkleTree, Payout,
    PlatformConfig, PrivilegedCall, RequestId, Role, Runtime, ServiceError, SwapHop, SwapPath, SwapService,
    TransferHook, YieldTeller,
};
use solana_sdk::pubkey::Pubkey;
use solana_sdk::signature::{Keypair, Signer};

const GENESIS_TIME: i64 = 1_700_000_000;

mock! {
    pub Swap {}
    impl SwapService for Swap {
        fn swap_exact_input(
            &mut self,
            assets: &mut AssetLedger,
            payer: &Pubkey,
            path: &SwapPath,
            amount_in: u64,
            min_out: u64,
        ) -> std::result::Result<u64, ServiceError>;
    }
}

mock! {
    pub Teller {}
    impl YieldTeller for Teller {
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
        fn units_for_value(&self, value: u64) -> std::result::Result<u64, ServiceError>;
    }
}

struct Platform {
    rt: Runtime,
    deployer: Pubkey,
    operators: Vec<Pubkey>,
    settlement: Pubkey,
    yield_token: Pubkey,
    users: Vec<Pubkey>,
    tree: MerkleTree,
}

impl Platform {
    fn request(&self, user: Pubkey, amount: u64) -> DepositRequest {
        DepositRequest::with_proof(self.tree.root(), self.tree.proof(&user).unwrap(), self.yield_token, amount)
    }

    /// Deposits, requests and approves a full withdrawal. Returns the claim id.
    fn approved_claim(&mut self, user: Pubkey, amount: u64) -> u64 {
        let request = self.request(user, amount);
        let receipt = self.rt.deposit(user, request).unwrap();
        let claim_id = self.rt.request_withdraw(user, self.yield_token, receipt.shares).unwrap();
        self.rt.approve_request_withdraw(self.operators[0], &[claim_id]).unwrap();
        claim_id
    }
}

fn setup_with_swap(config: PlatformConfig, swap: Box<dyn SwapService>) -> Platform {
    let deployer = Pubkey::new_unique();
    let operators: Vec<Pubkey> = (0..3).map(|_| Pubkey::new_unique()).collect();
    let settlement = Pubkey::new_unique();
    let yield_token = Pubkey::new_unique();

    let genesis = Genesis {
        deployer,
        operators: operators.clone(),
        oracle_confirmers: vec![],
        timestamp: GENESIS_TIME,
    };
    let mut rt = Runtime::new(config, genesis, swap).unwrap();
    rt.grant_role(deployer, Role::VaultOperator, operators[0]).unwrap();
    rt.setup_order(operators[0], yield_token, settlement, Some(1), None).unwrap();

    let users: Vec<Pubkey> = (0..2).map(|_| Pubkey::new_unique()).collect();
    let tree = MerkleTree::from_accounts(&users).unwrap();
    rt.set_root(deployer, tree.root(), true).unwrap();
    for user in &users {
        rt.fund_account(settlement, *user, 10_000).unwrap();
    }
    rt.fund_account(settlement, operators[0], 10_000).unwrap();

    Platform {
        rt,
        deployer,
        operators,
        settlement,
        yield_token,
        users,
        tree,
    }
}

fn setup_platform() -> Platform {
    setup_with_swap(PlatformConfig::default(), Box::new(FixedRateSwap::new()))
}

#[cfg(test)]
mod reentrancy_tests {
    use super::*;

    /// Settlement asset that re-enters `withdraw` when the vault pays the attacker.
    struct ReentrantWithdraw {
        vault: Pubkey,
        attacker: Pubkey,
        claim_id: u64,
        observed: Rc<RefCell<Vec<Result<(), PlatformError>>>>,
    }

    impl TransferHook for ReentrantWithdraw {
        fn on_transfer(&mut self, rt: &mut Runtime, transfer: &AssetTransfer) -> rwa_vault_core::Result<()> {
            if transfer.from == self.vault && transfer.to == self.attacker {
                let result = rt
                    .withdraw(self.attacker, self.claim_id, Payout::direct(transfer.asset))
                    .map(|_| ());
                self.observed.borrow_mut().push(result);
            }
            Ok(())
        }
    }

    /// Records the caller's share balance when their deposit funds arrive.
    struct ShareObserver {
        yield_token: Pubkey,
        seen: Rc<RefCell<Vec<u64>>>,
    }

    impl TransferHook for ShareObserver {
        fn on_transfer(&mut self, rt: &mut Runtime, transfer: &AssetTransfer) -> rwa_vault_core::Result<()> {
            self.seen
                .borrow_mut()
                .push(rt.share_balance(&self.yield_token, &transfer.from));
            Ok(())
        }
    }

    /// Asset whose hook rejects every outgoing vault transfer.
    struct FrozenAsset {
        vault: Pubkey,
    }

    impl TransferHook for FrozenAsset {
        fn on_transfer(&mut self, _rt: &mut Runtime, transfer: &AssetTransfer) -> rwa_vault_core::Result<()> {
            if transfer.from == self.vault {
                return Err(PlatformError::InvariantViolated("asset frozen".to_string()));
            }
            Ok(())
        }
    }

    #[test]
    fn test_reentrant_withdraw_sees_redeemed_claim() {
        let mut platform = setup_platform();
        let attacker = platform.users[0];
        let claim_id = platform.approved_claim(attacker, 1_000);
        let observed = Rc::new(RefCell::new(Vec::new()));

        let hook = ReentrantWithdraw {
            vault: platform.rt.vault().address(),
            attacker,
            claim_id,
            observed: Rc::clone(&observed),
        };
        platform.rt.set_transfer_hook(platform.settlement, Box::new(hook));

        platform
            .rt
            .withdraw(attacker, claim_id, Payout::direct(platform.settlement))
            .unwrap();

        assert_eq!(*observed.borrow(), vec![Err(PlatformError::AlreadyRedeemed(claim_id))]);
        // Paid exactly once
        assert_eq!(platform.rt.balance_of(&platform.settlement, &attacker), 10_000);
        platform.rt.check_invariants(&platform.yield_token).unwrap();
    }

    #[test]
    fn test_shares_are_credited_before_funds_are_pulled() {
        let mut platform = setup_platform();
        let user = platform.users[1];
        let seen = Rc::new(RefCell::new(Vec::new()));
        platform.rt.set_transfer_hook(
            platform.settlement,
            Box::new(ShareObserver {
                yield_token: platform.yield_token,
                seen: Rc::clone(&seen),
            }),
        );

        let request = platform.request(user, 250);
        platform.rt.deposit(user, request).unwrap();
        assert_eq!(*seen.borrow(), vec![250]);
    }

    #[test]
    fn test_hook_failure_rolls_back_whole_withdrawal() {
        let mut platform = setup_platform();
        let user = platform.users[0];
        let claim_id = platform.approved_claim(user, 500);
        let events_before = platform.rt.events().len();
        let vault = platform.rt.vault().address();

        platform
            .rt
            .set_transfer_hook(platform.settlement, Box::new(FrozenAsset { vault }));
        let result = platform.rt.withdraw(user, claim_id, Payout::direct(platform.settlement));
        assert_eq!(result, Err(PlatformError::InvariantViolated("asset frozen".to_string())));

        assert_eq!(
            platform.rt.vault().claims().claim(claim_id).unwrap().state,
            ClaimState::Approved
        );
        assert_eq!(platform.rt.vault().pool(&platform.yield_token).unwrap().locked_shares, 500);
        assert_eq!(platform.rt.events().len(), events_before);

        platform.rt.clear_transfer_hook(&platform.settlement);
        platform
            .rt
            .withdraw(user, claim_id, Payout::direct(platform.settlement))
            .unwrap();
    }
}

#[cfg(test)]
mod authorization_tests {
    use super::*;

    #[test]
    fn test_reverted_dispatch_stays_executed() {
        let mut platform = setup_platform();
        let operator = platform.operators[0];
        let request = platform.request(platform.users[0], 100);
        platform.rt.deposit(platform.users[0], request).unwrap();

        let id = platform
            .rt
            .request_liquidity_transfer(operator, platform.yield_token, 1_000, Pubkey::new_unique())
            .unwrap();
        platform.rt.confirm(platform.operators[0], RequestId::Call(id)).unwrap();
        platform.rt.confirm(platform.operators[1], RequestId::Call(id)).unwrap();

        let outcome = platform.rt.execute(operator, RequestId::Call(id)).unwrap();
        assert!(matches!(outcome, CallOutcome::Reverted(ref reason) if reason.contains("liquidity")));

        let request = platform.rt.authority().call_request(id).unwrap();
        assert!(request.executed);
        assert_eq!(request.outcome, Some(outcome));
        assert_eq!(
            platform.rt.execute(platform.operators[1], RequestId::Call(id)),
            Err(PlatformError::AlreadyExecuted(id))
        );
        assert_eq!(platform.rt.vault().pool(&platform.yield_token).unwrap().value_in, 100);
    }

    #[test]
    fn test_rollback_keeps_earlier_events() {
        let mut platform = setup_platform();
        let user = platform.users[0];
        let request = platform.request(user, 100);
        platform.rt.deposit(user, request).unwrap();
        let history = platform.rt.events().to_vec();

        // Liquidity transfer larger than the pool reverts inside execute
        let id = platform
            .rt
            .request_liquidity_transfer(platform.operators[0], platform.yield_token, 500, Pubkey::new_unique())
            .unwrap();
        platform.rt.confirm(platform.operators[0], RequestId::Call(id)).unwrap();
        platform.rt.confirm(platform.operators[1], RequestId::Call(id)).unwrap();
        let outcome = platform.rt.execute(platform.operators[0], RequestId::Call(id)).unwrap();
        assert!(matches!(outcome, CallOutcome::Reverted(_)));
        assert_eq!(platform.rt.events(), history.as_slice());

        assert!(platform.rt.request_withdraw(user, platform.yield_token, 101).is_err());
        assert_eq!(platform.rt.events(), history.as_slice());

        let claim_id = platform.rt.request_withdraw(user, platform.yield_token, 40).unwrap();
        let events = platform.rt.events();
        assert_eq!(events.len(), history.len() + 1);
        assert_eq!(&events[..history.len()], history.as_slice());
        assert!(matches!(
            events.last(),
            Some(rwa_vault_core::PlatformEvent::WithdrawRequested { claim_id: id, .. }) if *id == claim_id
        ));
    }

    #[test]
    fn test_privileged_calls_reject_outsiders() {
        let mut platform = setup_platform();
        let outsider = Pubkey::new_unique();
        let vault = platform.rt.vault().address();
        let call = PrivilegedCall::TransferLiquidity {
            yield_token: platform.yield_token,
            amount: 1,
            recipient: outsider,
        };

        let result = platform.rt.submit_call_request(outsider, vault, call);
        assert_eq!(result, Err(PlatformError::NotAuthorized(outsider)));
        assert_eq!(result.unwrap_err().kind(), ErrorKind::Authorization);

        assert_eq!(
            platform.rt.rebase(outsider, platform.yield_token, 10),
            Err(PlatformError::NotOperator(outsider))
        );
        assert_eq!(
            platform.rt.set_root(outsider, platform.tree.root(), false),
            Err(PlatformError::NotAdmin(outsider))
        );
        assert_eq!(
            platform.rt.grant_role(outsider, Role::VaultOperator, outsider),
            Err(PlatformError::NotAdmin(outsider))
        );
        assert_eq!(
            platform.rt.request_liquidity_transfer(outsider, platform.yield_token, 1, outsider),
            Err(PlatformError::NotOperator(outsider))
        );
        assert_eq!(platform.rt.authority().call_request_count(), 0);
    }

    #[test]
    fn test_vault_cannot_confirm_its_own_request() {
        let mut platform = setup_platform();
        let vault = platform.rt.vault().address();
        let id = platform
            .rt
            .request_liquidity_transfer(platform.operators[0], platform.yield_token, 1, Pubkey::new_unique())
            .unwrap();

        assert_eq!(
            platform.rt.confirm(vault, RequestId::Call(id)),
            Err(PlatformError::NotOperator(vault))
        );
        assert_eq!(
            platform.rt.execute(vault, RequestId::Call(id)),
            Err(PlatformError::NotOperator(vault))
        );
    }

    #[test]
    fn test_signature_cannot_be_replayed_on_another_chain_or_root() {
        let mut config = PlatformConfig::default();
        config.chain_id = 56;
        let mut platform = setup_with_swap(config, Box::new(FixedRateSwap::new()));
        let oracle = Keypair::new();
        platform.rt.set_membership_oracle(platform.deployer, oracle.pubkey()).unwrap();

        let root = MerkleTree::from_accounts(&[Pubkey::new_unique()]).unwrap().root();
        let other_root = MerkleTree::from_accounts(&[Pubkey::new_unique()]).unwrap().root();
        let expiry = GENESIS_TIME + 60;

        let foreign = oracle.sign_message(&activation_digest(1, &root, expiry));
        assert_eq!(
            platform.rt.set_root_active_by_signature(platform.users[0], root, &foreign, expiry),
            Err(PlatformError::BadSignature)
        );

        let signature = oracle.sign_message(&activation_digest(56, &root, expiry));
        assert_eq!(
            platform.rt.set_root_active_by_signature(platform.users[0], other_root, &signature, expiry),
            Err(PlatformError::BadSignature)
        );
        assert_eq!(
            platform.rt.set_root_active_by_signature(platform.users[0], root, &signature, expiry + 1),
            Err(PlatformError::BadSignature)
        );

        platform.rt.advance_time(61);
        assert!(matches!(
            platform.rt.set_root_active_by_signature(platform.users[0], root, &signature, expiry),
            Err(PlatformError::ExpiredSignature { .. })
        ));
        platform.rt.set_timestamp(GENESIS_TIME);
        platform
            .rt
            .set_root_active_by_signature(platform.users[0], root, &signature, expiry)
            .unwrap();
        assert!(platform.rt.membership().is_root_active(&root));
        assert!(!platform.rt.membership().is_root_active(&other_root));
    }
}

#[cfg(test)]
mod external_failure_tests {
    use super::*;

    #[test]
    fn test_swap_failure_surfaces_as_swap_failed() {
        let mut swap = MockSwap::new();
        swap.expect_swap_exact_input()
            .times(1)
            .returning(|_, _, _, _, _| Err(ServiceError::Unavailable("pool paused".to_string())));
        let mut platform = setup_with_swap(PlatformConfig::default(), Box::new(swap));
        let user = platform.users[0];
        let quote = Pubkey::new_unique();
        platform.rt.fund_account(quote, user, 500).unwrap();

        let request = platform.request(user, 500).routed(vec![SwapHop::new(quote, 3000)], 1);
        let result = platform.rt.deposit(user, request);

        assert!(matches!(result, Err(PlatformError::SwapFailed(ref reason)) if reason.contains("pool paused")));
        assert_eq!(result.unwrap_err().kind(), ErrorKind::ExternalService);
        assert_eq!(platform.rt.balance_of(&quote, &user), 500);
        assert_eq!(platform.rt.share_balance(&platform.yield_token, &user), 0);
    }

    #[test]
    fn test_swap_output_measured_by_balance_delta() {
        let mut swap = MockSwap::new();
        // Reports a fill but delivers nothing
        swap.expect_swap_exact_input()
            .returning(|_, _, _, amount_in, _| Ok(amount_in));
        let mut platform = setup_with_swap(PlatformConfig::default(), Box::new(swap));
        let user = platform.users[0];
        let quote = Pubkey::new_unique();
        platform.rt.fund_account(quote, user, 500).unwrap();

        let request = platform.request(user, 500).routed(vec![SwapHop::new(quote, 0)], 400);
        assert_eq!(
            platform.rt.deposit(user, request),
            Err(PlatformError::SlippageExceeded { min_out: 400, actual: 0 })
        );
        assert_eq!(platform.rt.balance_of(&quote, &user), 500);
    }

    #[test]
    fn test_teller_failure_blocks_redirect_deposit() {
        let mut platform = setup_platform();
        let mut teller = MockTeller::new();
        teller.expect_yield_asset().return_const(Pubkey::new_unique());
        teller
            .expect_buy()
            .returning(|_, _, _, _| Err(ServiceError::Unavailable("teller halted".to_string())));
        platform.rt.register_teller(platform.yield_token, Box::new(teller));
        platform
            .rt
            .set_redirect(platform.operators[0], platform.yield_token, true)
            .unwrap();

        let user = platform.users[1];
        let request = platform.request(user, 300);
        let result = platform.rt.deposit(user, request);
        assert!(matches!(result, Err(PlatformError::TellerFailed(_))));
        assert_eq!(platform.rt.balance_of(&platform.settlement, &user), 10_000);
        assert_eq!(platform.rt.vault().pool(&platform.yield_token).unwrap().total_shares, 0);
    }

    #[test]
    fn test_redirect_requires_registered_teller() {
        let mut platform = setup_platform();
        assert!(matches!(
            platform.rt.set_redirect(platform.operators[0], platform.yield_token, true),
            Err(PlatformError::TellerFailed(_))
        ));
        assert!(!platform.rt.vault().pool(&platform.yield_token).unwrap().order.redirect);
    }
}
