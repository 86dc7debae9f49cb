//! End-to-end ledger scenarios through the service layer.

use std::sync::Arc;
use zeratul_lending::{
    Account, AssetId, Custody, HealthFactor, LedgerConfig, LendingError, LendingEvent, Ledger,
    ManualClock, PriceBook, RateModel, RiskParams, UserId, Wad, SECONDS_PER_YEAR,
};

const T0: u64 = 1_700_000_000;

type TestLedger = Ledger<Arc<PriceBook>, Arc<Custody>, Arc<ManualClock>>;

fn usdc() -> AssetId {
    AssetId::from_symbol("USDC")
}

fn eth() -> AssetId {
    AssetId::from_symbol("ETH")
}

fn params(collateral_factor_bps: u32, reserve_factor_bps: u32) -> RiskParams {
    RiskParams {
        collateral_factor_bps,
        liquidation_bonus_bps: 500,
        reserve_factor_bps,
    }
}

fn ledger_with(config: LedgerConfig) -> TestLedger {
    let prices = Arc::new(PriceBook::new());
    prices.set_price(usdc(), Wad::ONE, T0);
    prices.set_price(eth(), Wad::from_int(2_000).unwrap(), T0);
    Ledger::new(
        config,
        prices,
        Arc::new(Custody::new()),
        Arc::new(ManualClock::new(T0)),
    )
    .unwrap()
}

fn fund(ledger: &TestLedger, user: UserId, asset: AssetId, amount: u128) {
    ledger.custody().mint(Account::User(user), asset, amount).unwrap();
}

#[test]
fn scenario_a_borrow_limit() {
    let ledger = ledger_with(LedgerConfig::default());
    ledger.create_market(usdc(), params(7_500, 0)).unwrap();

    let alice = UserId::from_name("alice");
    fund(&ledger, alice, usdc(), 1_000);
    ledger.deposit(alice, usdc(), 1_000).unwrap();
    ledger.toggle_collateral(alice, usdc(), true).unwrap();
    ledger.borrow(alice, usdc(), 700).unwrap();

    let hf = ledger.health_factor(&alice).unwrap();
    // 750 / 700 ≈ 1.0714
    assert_eq!(hf, HealthFactor::Finite(Wad(1_071_428_571_428_571_428)));

    assert!(matches!(
        ledger.borrow(alice, usdc(), 51),
        Err(LendingError::Insolvency { .. })
    ));
    // the rejected borrow moved no funds
    assert_eq!(ledger.custody().balance(Account::User(alice), usdc()), 700);
    assert_eq!(ledger.market_data(&usdc()).unwrap().total_borrows, 700);
}

#[test]
fn scenario_b_kink_boundary() {
    assert_eq!(RateModel::default().borrow_rate_bps(8_000).unwrap(), 600);

    let ledger = ledger_with(LedgerConfig::default());
    ledger.create_market(usdc(), params(9_000, 0)).unwrap();
    let alice = UserId::from_name("alice");
    fund(&ledger, alice, usdc(), 10_000);
    ledger.deposit(alice, usdc(), 10_000).unwrap();
    ledger.toggle_collateral(alice, usdc(), true).unwrap();
    ledger.borrow(alice, usdc(), 8_000).unwrap();

    let data = ledger.market_data(&usdc()).unwrap();
    assert_eq!(data.utilization_bps, 8_000);
    assert_eq!(data.borrow_rate_bps, 600);
    assert_eq!(data.liquidity, 2_000);
}

#[test]
fn scenario_c_one_year_flat_rate() {
    let config = LedgerConfig {
        rate_model: RateModel::flat(1_000),
        ..LedgerConfig::default()
    };
    let ledger = ledger_with(config);
    ledger.create_market(usdc(), params(9_000, 0)).unwrap();

    let alice = UserId::from_name("alice");
    fund(&ledger, alice, usdc(), 10_000);
    ledger.deposit(alice, usdc(), 10_000).unwrap();
    ledger.toggle_collateral(alice, usdc(), true).unwrap();
    ledger.borrow(alice, usdc(), 1_000).unwrap();

    ledger.clock().advance(SECONDS_PER_YEAR);
    let debt = ledger.position(&alice, &usdc()).unwrap().debt_balance;
    assert_eq!(debt, 1_100);

    // committing the accrual gives the same figure
    let data = ledger.accrue_interest(usdc()).unwrap();
    assert_eq!(data.borrow_index, Wad(1_100_000_000_000_000_000));
    assert_eq!(data.total_borrows, 1_100);
    assert_eq!(data.total_deposits, 10_100);
}

#[test]
fn scenario_d_self_liquidation_rejected() {
    let ledger = ledger_with(LedgerConfig::default());
    ledger.create_market(usdc(), params(7_500, 0)).unwrap();
    let alice = UserId::from_name("alice");

    assert!(matches!(
        ledger.liquidate(alice, alice, usdc(), usdc(), 1),
        Err(LendingError::Validation(_))
    ));

    fund(&ledger, alice, usdc(), 1_000);
    ledger.deposit(alice, usdc(), 1_000).unwrap();
    ledger.toggle_collateral(alice, usdc(), true).unwrap();
    ledger.borrow(alice, usdc(), 750).unwrap();
    ledger.oracle().set_price(usdc(), Wad::from_ratio(1, 2).unwrap(), T0);

    assert!(matches!(
        ledger.liquidate(alice, alice, usdc(), usdc(), 100),
        Err(LendingError::Validation(_))
    ));
}

#[test]
fn scenario_e_no_debt_is_infinite() {
    let ledger = ledger_with(LedgerConfig::default());
    ledger.create_market(usdc(), params(7_500, 0)).unwrap();

    let nobody = UserId::from_name("nobody");
    assert_eq!(ledger.health_factor(&nobody).unwrap(), HealthFactor::Infinite);

    let saver = UserId::from_name("saver");
    fund(&ledger, saver, usdc(), 500);
    ledger.deposit(saver, usdc(), 500).unwrap();
    ledger.toggle_collateral(saver, usdc(), true).unwrap();
    let summary = ledger.account_summary(&saver).unwrap();
    assert_eq!(summary.health_factor, HealthFactor::Infinite);
    assert_eq!(summary.debt_value, 0);
    assert_eq!(summary.collateral_value, 375);
}

#[test]
fn deposit_withdraw_round_trip() {
    let ledger = ledger_with(LedgerConfig::default());
    ledger.create_market(usdc(), params(7_500, 1_000)).unwrap();
    let alice = UserId::from_name("alice");
    fund(&ledger, alice, usdc(), 123_456_789);

    ledger.deposit(alice, usdc(), 123_456_789).unwrap();
    assert_eq!(ledger.withdraw(alice, usdc(), 123_456_789).unwrap(), 123_456_789);
    assert_eq!(ledger.custody().balance(Account::User(alice), usdc()), 123_456_789);
    assert!(ledger.positions_of(&alice).unwrap().is_empty());
}

#[test]
fn interest_flows_to_depositors() {
    let ledger = ledger_with(LedgerConfig::default());
    ledger.create_market(usdc(), params(9_000, 1_000)).unwrap();
    ledger.create_market(eth(), params(8_000, 0)).unwrap();

    let lender = UserId::from_name("lender");
    let borrower = UserId::from_name("borrower");
    fund(&ledger, lender, usdc(), 100_000);
    fund(&ledger, borrower, eth(), 100);

    ledger.deposit(lender, usdc(), 100_000).unwrap();
    ledger.deposit(borrower, eth(), 100).unwrap();
    ledger.toggle_collateral(borrower, eth(), true).unwrap();
    ledger.borrow(borrower, usdc(), 50_000).unwrap();

    ledger.clock().advance(SECONDS_PER_YEAR / 2);
    ledger.oracle().set_price(usdc(), Wad::ONE, T0 + SECONDS_PER_YEAR / 2);
    ledger.oracle().set_price(eth(), Wad::from_int(2_000).unwrap(), T0 + SECONDS_PER_YEAR / 2);

    let debt = ledger.position(&borrower, &usdc()).unwrap().debt_balance;
    let supplied = ledger.position(&lender, &usdc()).unwrap().deposit_balance;
    let data = ledger.market_data(&usdc()).unwrap();

    // 50% utilization: 200 + 50% * 400 * 10000 / 8000 = 450 bps for half a year
    assert_eq!(debt, 51_125);
    assert_eq!(data.reserves, 112);
    // depositors get the interest minus the reserve cut (floored)
    assert!(supplied > 100_000 && supplied <= 100_000 + 1_125 - 112);

    // borrower repays everything; extra funds stay in the wallet
    fund(&ledger, borrower, usdc(), 2_000);
    assert_eq!(ledger.repay(borrower, usdc(), 60_000).unwrap(), 51_125);
    assert_eq!(ledger.custody().balance(Account::User(borrower), usdc()), 875);
    assert_eq!(ledger.health_factor(&borrower).unwrap(), HealthFactor::Infinite);
}

#[test]
fn liquidation_moves_funds_and_conserves_value() {
    let ledger = ledger_with(LedgerConfig::default());
    ledger.create_market(usdc(), params(9_000, 0)).unwrap();
    ledger.create_market(eth(), params(8_000, 0)).unwrap();

    let lender = UserId::from_name("lender");
    let borrower = UserId::from_name("borrower");
    let keeper = UserId::from_name("keeper");
    fund(&ledger, lender, usdc(), 100_000);
    fund(&ledger, borrower, eth(), 10);
    fund(&ledger, keeper, usdc(), 20_000);

    ledger.deposit(lender, usdc(), 100_000).unwrap();
    ledger.deposit(borrower, eth(), 10).unwrap();
    ledger.toggle_collateral(borrower, eth(), true).unwrap();
    ledger.borrow(borrower, usdc(), 15_000).unwrap();

    assert!(matches!(
        ledger.liquidate(keeper, borrower, eth(), usdc(), 5_000),
        Err(LendingError::NotLiquidatable(_))
    ));

    ledger.oracle().set_price(eth(), Wad::from_int(1_800).unwrap(), T0);
    let outcome = ledger.liquidate(keeper, borrower, eth(), usdc(), 20_000).unwrap();
    assert_eq!(outcome.debt_repaid, 7_500);
    assert_eq!(outcome.collateral_seized, 4);
    assert!(outcome.health_factor_before.is_liquidatable());
    assert!(outcome.health_factor_after > outcome.health_factor_before);

    // seized value never exceeds repaid value plus the bonus
    let repaid_value = outcome.debt_repaid * 10_500 / 10_000;
    assert!(outcome.collateral_seized * 1_800 <= repaid_value);

    assert_eq!(ledger.custody().balance(Account::User(keeper), usdc()), 12_500);
    assert_eq!(ledger.custody().balance(Account::User(keeper), eth()), 4);
    assert_eq!(ledger.custody().balance(Account::Pool, eth()), 6);

    let events = ledger.take_events().unwrap();
    assert!(events.iter().any(|e| matches!(
        e,
        LendingEvent::Liquidated { debt_repaid: 7_500, collateral_seized: 4, .. }
    )));
}

#[test]
fn liquidator_without_funds_leaves_no_trace() {
    let ledger = ledger_with(LedgerConfig::default());
    ledger.create_market(usdc(), params(9_000, 0)).unwrap();
    ledger.create_market(eth(), params(8_000, 0)).unwrap();

    let lender = UserId::from_name("lender");
    let borrower = UserId::from_name("borrower");
    let keeper = UserId::from_name("keeper");
    fund(&ledger, lender, usdc(), 100_000);
    fund(&ledger, borrower, eth(), 10);

    ledger.deposit(lender, usdc(), 100_000).unwrap();
    ledger.deposit(borrower, eth(), 10).unwrap();
    ledger.toggle_collateral(borrower, eth(), true).unwrap();
    ledger.borrow(borrower, usdc(), 15_000).unwrap();
    ledger.oracle().set_price(eth(), Wad::from_int(1_800).unwrap(), T0);

    let before = ledger.snapshot().unwrap();
    assert!(matches!(
        ledger.liquidate(keeper, borrower, eth(), usdc(), 1_000),
        Err(LendingError::Transfer(_))
    ));
    let after = ledger.snapshot().unwrap();
    assert_eq!(before.markets(), after.markets());
    assert_eq!(before.positions(), after.positions());
    assert_eq!(before.totals(), after.totals());
    assert_eq!(ledger.custody().balance(Account::Pool, eth()), 10);
}

#[test]
fn zero_and_stale_prices_block_solvency_checks() {
    let ledger = ledger_with(LedgerConfig::default());
    ledger.create_market(usdc(), params(9_000, 0)).unwrap();
    ledger.create_market(eth(), params(8_000, 0)).unwrap();

    let alice = UserId::from_name("alice");
    fund(&ledger, alice, eth(), 10);
    ledger.deposit(alice, eth(), 10).unwrap();
    ledger.toggle_collateral(alice, eth(), true).unwrap();

    ledger.oracle().set_price(eth(), Wad::ZERO, T0);
    assert!(matches!(
        ledger.borrow(alice, usdc(), 1),
        Err(LendingError::Oracle { .. })
    ));

    // with the feed cleared, the admin fallback prices the collateral
    ledger.oracle().clear_price(&eth());
    ledger.oracle().set_fallback(eth(), Wad::from_int(1_500).unwrap());
    assert!(matches!(
        ledger.borrow(alice, usdc(), 1),
        Err(LendingError::InsufficientLiquidity { .. })
    ));
}

#[test]
fn reserves_are_paid_out_to_treasury() {
    let config = LedgerConfig {
        rate_model: RateModel::flat(1_000),
        ..LedgerConfig::default()
    };
    let ledger = ledger_with(config);
    ledger.create_market(usdc(), params(9_000, 2_000)).unwrap();

    let alice = UserId::from_name("alice");
    let treasury = Account::User(UserId::from_name("treasury"));
    fund(&ledger, alice, usdc(), 10_000);
    ledger.deposit(alice, usdc(), 10_000).unwrap();
    ledger.toggle_collateral(alice, usdc(), true).unwrap();
    ledger.borrow(alice, usdc(), 5_000).unwrap();

    ledger.clock().advance(SECONDS_PER_YEAR);
    // 500 interest, 20% reserved
    assert_eq!(ledger.market_data(&usdc()).unwrap().reserves, 100);
    assert_eq!(ledger.withdraw_reserves(usdc(), 100, treasury).unwrap(), 100);
    assert_eq!(ledger.custody().balance(treasury, usdc()), 100);
    assert!(ledger.withdraw_reserves(usdc(), 1, treasury).is_err());
    assert!(matches!(
        ledger.withdraw_reserves(usdc(), 1, Account::Pool),
        Err(LendingError::Validation(_))
    ));
}
