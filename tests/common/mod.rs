//! Common test utilities
//!
//! A small bank-account domain plus in-memory store fixtures, shared by the
//! integration tests.

#![allow(dead_code)]

use chrono::Utc;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use eventum::aggregate::{Aggregate, AggregateRoot};
use eventum::domain::{Event, EventMetadata, OperationContext, UniqueConstraint};
use eventum::error::{AppError, AppResult};
use eventum::event_store::SqliteEventStore;

pub const OPENED: &str = "accounts.v1.AccountOpened";
pub const DEPOSITED: &str = "accounts.v1.MoneyDeposited";
pub const WITHDRAWN: &str = "accounts.v1.MoneyWithdrawn";
pub const CLOSED: &str = "accounts.v1.AccountClosed";

/// Test aggregate: a bank account with a decimal balance.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BankAccount {
    pub owner: String,
    pub balance: Decimal,
    pub closed: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum BankAccountEvent {
    AccountOpened { owner: String, initial: Decimal },
    MoneyDeposited { amount: Decimal },
    MoneyWithdrawn { amount: Decimal },
    AccountClosed,
}

impl Aggregate for BankAccount {
    type Event = BankAccountEvent;

    fn aggregate_type() -> &'static str {
        "BankAccount"
    }

    fn event_type(event: &Self::Event) -> &'static str {
        match event {
            BankAccountEvent::AccountOpened { .. } => OPENED,
            BankAccountEvent::MoneyDeposited { .. } => DEPOSITED,
            BankAccountEvent::MoneyWithdrawn { .. } => WITHDRAWN,
            BankAccountEvent::AccountClosed => CLOSED,
        }
    }

    fn apply(mut self, event: Self::Event) -> Self {
        match event {
            BankAccountEvent::AccountOpened { owner, initial } => {
                self.owner = owner;
                self.balance = initial;
                self.closed = false;
            }
            BankAccountEvent::MoneyDeposited { amount } => self.balance += amount,
            BankAccountEvent::MoneyWithdrawn { amount } => self.balance -= amount,
            BankAccountEvent::AccountClosed => self.closed = true,
        }
        self
    }
}

/// Open an account, optionally claiming an email uniqueness entry.
pub fn open_account(
    root: &mut AggregateRoot<BankAccount>,
    ctx: &OperationContext,
    owner: &str,
    initial: Decimal,
    constraints: Vec<UniqueConstraint>,
) -> AppResult<()> {
    root.apply_change(
        ctx,
        BankAccountEvent::AccountOpened {
            owner: owner.to_string(),
            initial,
        },
        constraints,
    )?;
    Ok(())
}

pub fn deposit(
    root: &mut AggregateRoot<BankAccount>,
    ctx: &OperationContext,
    amount: Decimal,
) -> AppResult<()> {
    if root.state().closed {
        return Err(AppError::new("ACCOUNT_CLOSED", "account is closed"));
    }
    root.apply_change(ctx, BankAccountEvent::MoneyDeposited { amount }, vec![])?;
    Ok(())
}

pub fn withdraw(
    root: &mut AggregateRoot<BankAccount>,
    ctx: &OperationContext,
    amount: Decimal,
) -> AppResult<()> {
    if root.state().closed {
        return Err(AppError::new("ACCOUNT_CLOSED", "account is closed"));
    }
    if root.state().balance < amount {
        return Err(AppError::new("INSUFFICIENT_FUNDS", "balance too low"));
    }
    root.apply_change(ctx, BankAccountEvent::MoneyWithdrawn { amount }, vec![])?;
    Ok(())
}

pub fn close_account(
    root: &mut AggregateRoot<BankAccount>,
    ctx: &OperationContext,
    constraints: Vec<UniqueConstraint>,
) -> AppResult<()> {
    root.apply_change(ctx, BankAccountEvent::AccountClosed, constraints)?;
    Ok(())
}

/// Fresh in-memory event store with the schema applied.
pub async fn memory_store() -> SqliteEventStore {
    let pool = eventum::db::connect_memory()
        .await
        .expect("failed to open in-memory database");
    let store = SqliteEventStore::new(pool);
    store.migrate().await.expect("failed to apply schema");
    store
}

pub fn test_ctx() -> OperationContext {
    OperationContext::new()
        .with_principal("tester")
        .with_correlation_id("corr-test")
}

/// Raw event record for low-level store tests; the store assigns versions
/// and positions on append.
pub fn raw_event(
    aggregate_id: &str,
    event_type: &str,
    data: serde_json::Value,
    constraints: Vec<UniqueConstraint>,
) -> Event {
    Event {
        id: eventum::domain::random_event_id(),
        aggregate_id: aggregate_id.to_string(),
        aggregate_type: "BankAccount".to_string(),
        event_type: event_type.to_string(),
        version: 0,
        timestamp: Utc::now(),
        data: serde_json::to_vec(&data).expect("payload serializes"),
        metadata: EventMetadata::default(),
        unique_constraints: constraints,
        position: 0,
    }
}
