//! Concurrency and settlement behavior of the ledger service.

use parking_lot::Mutex;
use std::sync::{Arc, OnceLock, Weak};
use std::thread;
use zeratul_lending::{
    Account, Amount, AssetId, AssetTransfer, Custody, HealthFactor, LedgerConfig, LendingError,
    LendingEvent, Ledger, ManualClock, MarketFlags, PriceBook, Result, RiskParams, Shares,
    Transfer, UserId, Wad,
};

const T0: u64 = 1_700_000_000;

fn usdc() -> AssetId {
    AssetId::from_symbol("USDC")
}

fn eth() -> AssetId {
    AssetId::from_symbol("ETH")
}

/// Custody that refuses payments into one account
#[derive(Default)]
struct FlakyCustody {
    inner: Custody,
    refuse_to: Mutex<Option<Account>>,
    log: Mutex<Vec<Transfer>>,
}

impl AssetTransfer for FlakyCustody {
    fn transfer(&self, transfer: &Transfer) -> Result<()> {
        if *self.refuse_to.lock() == Some(transfer.to) {
            return Err(LendingError::Transfer(format!("{} is frozen", transfer.to)));
        }
        self.inner.transfer(transfer)?;
        self.log.lock().push(*transfer);
        Ok(())
    }
}

type CallbackLedger = Ledger<Arc<PriceBook>, Arc<CallbackCustody>, Arc<ManualClock>>;

/// Custody that, while paying USDC into the pool, has another thread use
/// the same ledger and waits for it
#[derive(Default)]
struct CallbackCustody {
    inner: Custody,
    ledger: OnceLock<Weak<CallbackLedger>>,
    /// Refuse the USDC transfer once the other thread is done
    refuse: bool,
    seen: Mutex<Option<(Amount, Result<Shares>)>>,
}

impl AssetTransfer for CallbackCustody {
    fn transfer(&self, transfer: &Transfer) -> Result<()> {
        let ledger = self.ledger.get().and_then(Weak::upgrade);
        if let (Some(ledger), true) = (ledger, transfer.asset == usdc()) {
            let seen = thread::scope(|s| {
                s.spawn(|| {
                    let in_flight = ledger.market_data(&usdc()).map(|m| m.total_deposits);
                    let bob = UserId::from_name("bob");
                    let deposited = ledger.deposit(bob, eth(), 5);
                    (in_flight.unwrap_or_default(), deposited)
                })
                .join()
                .unwrap()
            });
            *self.seen.lock() = Some(seen);
            if self.refuse {
                return Err(LendingError::Transfer("usdc transfers suspended".into()));
            }
        }
        self.inner.transfer(transfer)
    }
}

fn callback_ledger(refuse: bool) -> Arc<CallbackLedger> {
    let custody = Arc::new(CallbackCustody {
        refuse,
        ..CallbackCustody::default()
    });
    custody.inner.mint(Account::User(UserId::from_name("alice")), usdc(), 1_000).unwrap();
    custody.inner.mint(Account::User(UserId::from_name("bob")), eth(), 5).unwrap();
    let ledger = Arc::new(
        Ledger::new(config(), prices(), custody.clone(), Arc::new(ManualClock::new(T0))).unwrap(),
    );
    assert!(custody.ledger.set(Arc::downgrade(&ledger)).is_ok());
    ledger
}

fn config() -> LedgerConfig {
    LedgerConfig::from_yaml_str(
        r#"
markets:
  - { symbol: USDC, collateral_factor_bps: 9000, liquidation_bonus_bps: 500 }
  - { symbol: ETH, collateral_factor_bps: 8000, liquidation_bonus_bps: 500 }
"#,
    )
    .unwrap()
}

fn prices() -> Arc<PriceBook> {
    let prices = Arc::new(PriceBook::new());
    prices.set_price(usdc(), Wad::ONE, T0);
    prices.set_price(eth(), Wad::from_int(2_000).unwrap(), T0);
    prices
}

#[test]
fn concurrent_deposits_are_all_booked() {
    let custody = Arc::new(Custody::new());
    let ledger = Arc::new(
        Ledger::new(config(), prices(), custody.clone(), Arc::new(ManualClock::new(T0))).unwrap(),
    );

    let users: Vec<UserId> = (0..8).map(|i| UserId::from_name(&format!("user-{}", i))).collect();
    for user in &users {
        custody.mint(Account::User(*user), usdc(), 1_000).unwrap();
    }

    thread::scope(|s| {
        for user in &users {
            let ledger = ledger.clone();
            s.spawn(move || {
                for _ in 0..10 {
                    ledger.deposit(*user, usdc(), 100).unwrap();
                }
            });
        }
    });

    let data = ledger.market_data(&usdc()).unwrap();
    assert_eq!(data.total_deposits, 8_000);
    assert_eq!(custody.balance(Account::Pool, usdc()), 8_000);
    for user in &users {
        assert_eq!(ledger.position(user, &usdc()).unwrap().deposit_balance, 1_000);
    }
    assert_eq!(ledger.totals().unwrap().total_value_locked, 8_000);
}

#[test]
fn concurrent_borrowers_never_overdraw_the_pool() {
    let custody = Arc::new(Custody::new());
    let ledger = Arc::new(
        Ledger::new(config(), prices(), custody.clone(), Arc::new(ManualClock::new(T0))).unwrap(),
    );

    let lender = UserId::from_name("lender");
    custody.mint(Account::User(lender), usdc(), 5_000).unwrap();
    ledger.deposit(lender, usdc(), 5_000).unwrap();

    let borrowers: Vec<UserId> = (0..6).map(|i| UserId::from_name(&format!("b-{}", i))).collect();
    for b in &borrowers {
        custody.mint(Account::User(*b), eth(), 10).unwrap();
        ledger.deposit(*b, eth(), 10).unwrap();
        ledger.toggle_collateral(*b, eth(), true).unwrap();
    }

    // six borrowers race for 1000 each from a 5000 pool
    let results: Vec<_> = thread::scope(|s| {
        let handles: Vec<_> = borrowers
            .iter()
            .map(|b| {
                let ledger = ledger.clone();
                s.spawn(move || ledger.borrow(*b, usdc(), 1_000))
            })
            .collect();
        handles.into_iter().map(|h| h.join().unwrap()).collect()
    });

    let ok = results.iter().filter(|r| r.is_ok()).count();
    assert_eq!(ok, 5);
    assert!(results
        .iter()
        .filter_map(|r| r.as_ref().err())
        .all(|e| matches!(e, LendingError::InsufficientLiquidity { .. })));

    let data = ledger.market_data(&usdc()).unwrap();
    assert_eq!(data.total_borrows, 5_000);
    assert!(data.total_borrows <= data.total_deposits);
}

#[test]
fn state_rolls_back_when_payout_bounces() {
    let custody = Arc::new(FlakyCustody::default());
    let ledger = Ledger::new(config(), prices(), custody.clone(), Arc::new(ManualClock::new(T0)))
        .unwrap();

    let lender = UserId::from_name("lender");
    let borrower = UserId::from_name("borrower");
    let keeper = UserId::from_name("keeper");
    custody.inner.mint(Account::User(lender), usdc(), 100_000).unwrap();
    custody.inner.mint(Account::User(borrower), eth(), 10).unwrap();
    custody.inner.mint(Account::User(keeper), usdc(), 10_000).unwrap();

    ledger.deposit(lender, usdc(), 100_000).unwrap();
    ledger.deposit(borrower, eth(), 10).unwrap();
    ledger.toggle_collateral(borrower, eth(), true).unwrap();
    ledger.borrow(borrower, usdc(), 15_000).unwrap();
    ledger.oracle().set_price(eth(), Wad::from_int(1_800).unwrap(), T0);

    let before = ledger.snapshot().unwrap();
    *custody.refuse_to.lock() = Some(Account::User(keeper));

    // keeper pays in, the collateral payout bounces
    assert!(matches!(
        ledger.liquidate(keeper, borrower, eth(), usdc(), 5_000),
        Err(LendingError::Transfer(_))
    ));

    // only the keeper's payment went through; the refund to the frozen
    // keeper is refused as well and merely logged
    let log = custody.log.lock().clone();
    let last = log.last().unwrap();
    assert_eq!(last.to, Account::Pool);
    assert_eq!(last.amount, 5_000);

    let after = ledger.snapshot().unwrap();
    assert_eq!(before.markets(), after.markets());
    assert_eq!(before.positions(), after.positions());
}

#[test]
fn compensation_refunds_the_first_leg() {
    let custody = Arc::new(FlakyCustody::default());
    let ledger = Ledger::new(config(), prices(), custody.clone(), Arc::new(ManualClock::new(T0)))
        .unwrap();

    let lender = UserId::from_name("lender");
    let borrower = UserId::from_name("borrower");
    let keeper = UserId::from_name("keeper");
    custody.inner.mint(Account::User(lender), usdc(), 100_000).unwrap();
    custody.inner.mint(Account::User(borrower), eth(), 10).unwrap();
    custody.inner.mint(Account::User(keeper), usdc(), 10_000).unwrap();

    ledger.deposit(lender, usdc(), 100_000).unwrap();
    ledger.deposit(borrower, eth(), 10).unwrap();
    ledger.toggle_collateral(borrower, eth(), true).unwrap();
    ledger.borrow(borrower, usdc(), 15_000).unwrap();
    ledger.oracle().set_price(eth(), Wad::from_int(1_800).unwrap(), T0);

    // the pool's ETH account cannot send: drain it out from under the ledger
    custody
        .inner
        .transfer(&Transfer {
            asset: eth(),
            from: Account::Pool,
            to: Account::User(UserId::from_name("thief")),
            amount: 10,
        })
        .unwrap();

    assert!(matches!(
        ledger.liquidate(keeper, borrower, eth(), usdc(), 5_000),
        Err(LendingError::Transfer(_))
    ));
    // keeper got the 5000 USDC back
    assert_eq!(custody.inner.balance(Account::User(keeper), usdc()), 10_000);
    assert_eq!(ledger.position(&borrower, &usdc()).unwrap().debt_balance, 15_000);
    assert_eq!(ledger.position(&borrower, &eth()).unwrap().deposit_balance, 10);
}

#[test]
fn inactive_market_rejects_new_exposure() {
    let custody = Arc::new(Custody::new());
    let ledger =
        Ledger::new(config(), prices(), custody.clone(), Arc::new(ManualClock::new(T0))).unwrap();
    let alice = UserId::from_name("alice");
    custody.mint(Account::User(alice), usdc(), 1_000).unwrap();
    ledger.deposit(alice, usdc(), 500).unwrap();

    ledger
        .set_market_flags(
            usdc(),
            MarketFlags {
                active: false,
                ..MarketFlags::default()
            },
        )
        .unwrap();
    assert!(matches!(
        ledger.deposit(alice, usdc(), 100),
        Err(LendingError::MarketInactive(_))
    ));
    assert_eq!(ledger.withdraw(alice, usdc(), 500).unwrap(), 500);
    assert_eq!(custody.balance(Account::User(alice), usdc()), 1_000);
}

#[test]
fn collateral_disabled_market_cannot_be_flagged() {
    let custody = Arc::new(Custody::new());
    let ledger =
        Ledger::new(config(), prices(), custody.clone(), Arc::new(ManualClock::new(T0))).unwrap();
    let alice = UserId::from_name("alice");
    custody.mint(Account::User(alice), eth(), 1).unwrap();
    ledger.deposit(alice, eth(), 1).unwrap();

    ledger
        .set_market_flags(
            eth(),
            MarketFlags {
                can_collateral: false,
                ..MarketFlags::default()
            },
        )
        .unwrap();
    assert!(matches!(
        ledger.toggle_collateral(alice, eth(), true),
        Err(LendingError::Validation(_))
    ));

    // toggling without a position is rejected outright
    assert!(matches!(
        ledger.toggle_collateral(UserId::from_name("bob"), usdc(), true),
        Err(LendingError::Validation(_))
    ));
}

#[test]
fn risk_params_are_range_checked() {
    let ledger = Ledger::new(
        config(),
        prices(),
        Arc::new(Custody::new()),
        Arc::new(ManualClock::new(T0)),
    )
    .unwrap();

    let too_generous = RiskParams {
        collateral_factor_bps: 9_100,
        liquidation_bonus_bps: 500,
        reserve_factor_bps: 0,
    };
    assert!(matches!(
        ledger.create_market(AssetId::from_symbol("DOGE"), too_generous),
        Err(LendingError::Validation(_))
    ));
    assert!(matches!(
        ledger.update_risk_params(usdc(), too_generous),
        Err(LendingError::Validation(_))
    ));
    assert!(matches!(
        ledger.create_market(usdc(), RiskParams { collateral_factor_bps: 5_000, ..too_generous }),
        Err(LendingError::Validation(_))
    ));
}

#[test]
fn custody_can_use_the_ledger_from_another_thread() {
    let ledger = callback_ledger(false);
    let alice = UserId::from_name("alice");
    let bob = UserId::from_name("bob");

    ledger.deposit(alice, usdc(), 1_000).unwrap();

    let (in_flight, deposited) = ledger.custody().seen.lock().take().unwrap();
    // the settling deposit is already visible to readers
    assert_eq!(in_flight, 1_000);
    assert_eq!(deposited, Ok(5));

    assert_eq!(ledger.position(&alice, &usdc()).unwrap().deposit_balance, 1_000);
    assert_eq!(ledger.position(&bob, &eth()).unwrap().deposit_balance, 5);
    assert_eq!(ledger.totals().unwrap().total_value_locked, 11_000);
    let deposits = ledger
        .take_events()
        .unwrap()
        .into_iter()
        .filter(|e| matches!(e, LendingEvent::Deposited { .. }))
        .count();
    assert_eq!(deposits, 2);
}

#[test]
fn aborted_settlement_keeps_other_commits() {
    let ledger = callback_ledger(true);
    let alice = UserId::from_name("alice");
    let bob = UserId::from_name("bob");

    assert!(matches!(
        ledger.deposit(alice, usdc(), 1_000),
        Err(LendingError::Transfer(_))
    ));
    let (_, deposited) = ledger.custody().seen.lock().take().unwrap();
    assert_eq!(deposited, Ok(5));

    // alice's deposit is undone, bob's survives
    assert_eq!(ledger.market_data(&usdc()).unwrap().total_deposits, 0);
    assert!(ledger.snapshot().unwrap().positions().get(&alice, &usdc()).is_none());
    assert_eq!(ledger.position(&bob, &eth()).unwrap().deposit_balance, 5);
    assert_eq!(ledger.totals().unwrap().total_value_locked, 10_000);
    let events = ledger.take_events().unwrap();
    assert!(events
        .iter()
        .all(|e| !matches!(e, LendingEvent::Deposited { user, .. } if *user == alice)));
    assert_eq!(ledger.custody().inner.balance(Account::User(alice), usdc()), 1_000);
}

#[test]
fn plain_deposits_need_no_price() {
    let custody = Arc::new(Custody::new());
    let clock = Arc::new(ManualClock::new(T0));
    let oracle = prices();
    let dai = AssetId::from_symbol("DAI");
    oracle.set_price(dai, Wad::ONE, T0);
    let ledger = Ledger::new(config(), oracle.clone(), custody.clone(), clock.clone()).unwrap();
    ledger
        .create_market(
            dai,
            RiskParams {
                collateral_factor_bps: 8_000,
                liquidation_bonus_bps: 500,
                reserve_factor_bps: 1_000,
            },
        )
        .unwrap();

    let lender = UserId::from_name("lender");
    let bob = UserId::from_name("bob");
    custody.mint(Account::User(lender), usdc(), 50_000).unwrap();
    custody.mint(Account::User(bob), eth(), 10).unwrap();
    custody.mint(Account::User(bob), dai, 500).unwrap();
    ledger.deposit(lender, usdc(), 50_000).unwrap();
    ledger.deposit(bob, eth(), 10).unwrap();
    ledger.toggle_collateral(bob, eth(), true).unwrap();
    ledger.deposit(bob, dai, 500).unwrap();

    // the DAI feed goes stale; only ETH and USDC keep updating
    let later = T0 + 2 * 3_600;
    clock.set(later);
    oracle.set_price(usdc(), Wad::ONE, later);
    oracle.set_price(eth(), Wad::from_int(2_000).unwrap(), later);

    ledger.borrow(bob, usdc(), 5_000).unwrap();
    assert_eq!(ledger.withdraw(bob, eth(), 2).unwrap(), 2);
    assert!(matches!(ledger.health_factor(&bob).unwrap(), HealthFactor::Finite(_)));

    // pricing DAI into the account still needs a fresh quote
    assert!(matches!(
        ledger.toggle_collateral(bob, dai, true),
        Err(LendingError::Oracle { .. })
    ));
    assert!(!ledger.position(&bob, &dai).unwrap().is_collateral);
}
