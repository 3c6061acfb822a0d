//! A small bank-account domain exercising single- and multi-aggregate
//! commands, rejections and snapshots.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use async_trait::async_trait;
use sequent_core::aggregate::{AggregateRoot, Snapshotable};
use sequent_core::command::{Command, Rejection};
use sequent_core::error::EngineError;
use sequent_core::event::{DomainEvent, EventStream};
use sequent_core::snapshot::SnapshotPolicy;
use sequent_engine::{
    CommandContext, CommandEnvelope, CommandHandler, HandlerError, HandlerResult, ProcessManager,
    Registry, derive_command_id,
};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Events recorded by [`Account`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum AccountEvent {
    /// The account was opened.
    Opened { owner: String },
    /// Money came in.
    Deposited { amount: i64 },
    /// Money went out.
    Withdrawn { amount: i64 },
    /// The account was closed.
    Closed,
}

impl DomainEvent for AccountEvent {
    fn event_type(&self) -> &'static str {
        match self {
            Self::Opened { .. } => "account.opened",
            Self::Deposited { .. } => "account.deposited",
            Self::Withdrawn { .. } => "account.withdrawn",
            Self::Closed => "account.closed",
        }
    }
}

/// Everything an account knows, and its snapshot payload.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AccountState {
    /// Account holder.
    pub owner: String,
    /// Current balance.
    pub balance: i64,
    /// Whether the account was closed.
    pub closed: bool,
}

/// Bank account aggregate.
#[derive(Debug, Clone)]
pub struct Account {
    id: Uuid,
    version: i64,
    state: AccountState,
    uncommitted: Vec<AccountEvent>,
}

impl Account {
    /// Opens a new account.
    #[must_use]
    pub fn open(id: Uuid, owner: &str) -> Self {
        let mut account = Self::blank(id);
        account.record(AccountEvent::Opened {
            owner: owner.to_owned(),
        });
        account
    }

    /// Current state.
    #[must_use]
    pub fn state(&self) -> &AccountState {
        &self.state
    }

    /// Current balance.
    #[must_use]
    pub fn balance(&self) -> i64 {
        self.state.balance
    }

    /// Adds money.
    ///
    /// # Errors
    ///
    /// Rejects non-positive amounts and closed accounts.
    pub fn deposit(&mut self, amount: i64) -> Result<(), Rejection> {
        self.ensure_open()?;
        ensure_positive(amount)?;
        self.record(AccountEvent::Deposited { amount });
        Ok(())
    }

    /// Takes money out.
    ///
    /// # Errors
    ///
    /// Rejects non-positive amounts, closed accounts and overdrafts.
    pub fn withdraw(&mut self, amount: i64) -> Result<(), Rejection> {
        self.ensure_open()?;
        ensure_positive(amount)?;
        if amount > self.state.balance {
            return Err(Rejection::new(
                "insufficient_funds",
                format!("balance {} is below {amount}", self.state.balance),
            )
            .with_details(serde_json::json!({ "balance": self.state.balance })));
        }
        self.record(AccountEvent::Withdrawn { amount });
        Ok(())
    }

    /// Closes the account.
    ///
    /// # Errors
    ///
    /// Rejects closing twice or with money left.
    pub fn close(&mut self) -> Result<(), Rejection> {
        self.ensure_open()?;
        if self.state.balance != 0 {
            return Err(Rejection::new(
                "balance_not_zero",
                format!("balance is {}", self.state.balance),
            ));
        }
        self.record(AccountEvent::Closed);
        Ok(())
    }

    fn ensure_open(&self) -> Result<(), Rejection> {
        if self.state.closed {
            return Err(Rejection::new(
                "account_closed",
                format!("account {} is closed", self.id),
            ));
        }
        Ok(())
    }

    fn record(&mut self, event: AccountEvent) {
        self.apply(&event);
        self.uncommitted.push(event);
    }
}

fn ensure_positive(amount: i64) -> Result<(), Rejection> {
    if amount <= 0 {
        return Err(Rejection::new(
            "invalid_amount",
            format!("amount must be positive, got {amount}"),
        ));
    }
    Ok(())
}

impl AggregateRoot for Account {
    type Event = AccountEvent;
    const AGGREGATE_TYPE: &'static str = "account";

    fn blank(id: Uuid) -> Self {
        Self {
            id,
            version: 0,
            state: AccountState::default(),
            uncommitted: Vec::new(),
        }
    }

    fn aggregate_id(&self) -> Uuid {
        self.id
    }

    fn version(&self) -> i64 {
        self.version
    }

    fn apply(&mut self, event: &AccountEvent) {
        match event {
            AccountEvent::Opened { owner } => self.state.owner.clone_from(owner),
            AccountEvent::Deposited { amount } => self.state.balance += amount,
            AccountEvent::Withdrawn { amount } => self.state.balance -= amount,
            AccountEvent::Closed => self.state.closed = true,
        }
        self.version += 1;
    }

    fn uncommitted_events(&self) -> &[AccountEvent] {
        &self.uncommitted
    }

    fn take_uncommitted_events(&mut self) -> Vec<AccountEvent> {
        std::mem::take(&mut self.uncommitted)
    }
}

impl Snapshotable for Account {
    fn capture_snapshot(&self) -> Result<serde_json::Value, EngineError> {
        Ok(serde_json::to_value(&self.state)?)
    }

    fn restore(id: Uuid, version: i64, payload: &serde_json::Value) -> Result<Self, EngineError> {
        Ok(Self {
            id,
            version,
            state: serde_json::from_value(payload.clone())?,
            uncommitted: Vec::new(),
        })
    }
}

macro_rules! account_command {
    ($name:ident, $type:literal, $target:ident { $($field:ident : $ty:ty),* $(,)? }) => {
        #[doc = concat!("The `", $type, "` command.")]
        #[derive(Debug, Clone)]
        pub struct $name {
            /// Idempotency key.
            pub command_id: Uuid,
            $(pub $field: $ty,)*
        }

        impl Command for $name {
            const COMMAND_TYPE: &'static str = $type;

            fn command_id(&self) -> Uuid {
                self.command_id
            }

            fn aggregate_id(&self) -> Uuid {
                self.$target
            }
        }
    };
}

account_command!(OpenAccount, "account.open", account_id { account_id: Uuid, owner: String });
account_command!(Deposit, "account.deposit", account_id { account_id: Uuid, amount: i64 });
account_command!(Withdraw, "account.withdraw", account_id { account_id: Uuid, amount: i64 });
account_command!(Transfer, "account.transfer", from { from: Uuid, to: Uuid, amount: i64 });
account_command!(CloseAccount, "account.close", account_id { account_id: Uuid });

impl OpenAccount {
    /// Opens `account_id` with a fresh command ID.
    #[must_use]
    pub fn new(account_id: Uuid, owner: &str) -> Self {
        Self {
            command_id: Uuid::new_v4(),
            account_id,
            owner: owner.to_owned(),
        }
    }
}

impl Deposit {
    /// Deposits into `account_id` with a fresh command ID.
    #[must_use]
    pub fn new(account_id: Uuid, amount: i64) -> Self {
        Self {
            command_id: Uuid::new_v4(),
            account_id,
            amount,
        }
    }
}

impl Withdraw {
    /// Withdraws from `account_id` with a fresh command ID.
    #[must_use]
    pub fn new(account_id: Uuid, amount: i64) -> Self {
        Self {
            command_id: Uuid::new_v4(),
            account_id,
            amount,
        }
    }
}

impl Transfer {
    /// Moves `amount` from `from` to `to`, sequenced on `from`.
    #[must_use]
    pub fn new(from: Uuid, to: Uuid, amount: i64) -> Self {
        Self {
            command_id: Uuid::new_v4(),
            from,
            to,
            amount,
        }
    }
}

/// Handlers for every account command. Clones share an invocation counter.
#[derive(Debug, Clone, Default)]
pub struct AccountHandlers {
    invocations: Arc<AtomicUsize>,
}

impl AccountHandlers {
    /// Creates handlers with a zeroed counter.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// How many times any handler ran, retries included.
    #[must_use]
    pub fn invocations(&self) -> usize {
        self.invocations.load(Ordering::SeqCst)
    }

    fn count(&self) {
        self.invocations.fetch_add(1, Ordering::SeqCst);
    }
}

async fn existing(ctx: &mut CommandContext, account_id: Uuid) -> Result<&mut Account, HandlerError> {
    ctx.load::<Account>(account_id).await?.ok_or_else(|| {
        Rejection::new(
            "account_not_found",
            format!("account {account_id} does not exist"),
        )
        .into()
    })
}

#[async_trait]
impl CommandHandler<OpenAccount> for AccountHandlers {
    async fn handle(&self, command: &OpenAccount, ctx: &mut CommandContext) -> HandlerResult {
        self.count();
        if ctx.load::<Account>(command.account_id).await?.is_some() {
            return Err(Rejection::new(
                "already_open",
                format!("account {} already exists", command.account_id),
            )
            .into());
        }
        ctx.create(Account::open(command.account_id, &command.owner))?;
        Ok(())
    }
}

#[async_trait]
impl CommandHandler<Deposit> for AccountHandlers {
    async fn handle(&self, command: &Deposit, ctx: &mut CommandContext) -> HandlerResult {
        self.count();
        let account = existing(ctx, command.account_id).await?;
        account.deposit(command.amount)?;
        let balance = account.balance();
        ctx.set_result(&serde_json::json!({ "balance": balance }))?;
        Ok(())
    }
}

#[async_trait]
impl CommandHandler<Withdraw> for AccountHandlers {
    async fn handle(&self, command: &Withdraw, ctx: &mut CommandContext) -> HandlerResult {
        self.count();
        let account = existing(ctx, command.account_id).await?;
        account.withdraw(command.amount)?;
        let balance = account.balance();
        ctx.set_result(&serde_json::json!({ "balance": balance }))?;
        Ok(())
    }
}

#[async_trait]
impl CommandHandler<Transfer> for AccountHandlers {
    async fn handle(&self, command: &Transfer, ctx: &mut CommandContext) -> HandlerResult {
        self.count();
        if command.from == command.to {
            return Err(Rejection::new("same_account", "cannot transfer to the same account").into());
        }
        existing(ctx, command.from).await?.withdraw(command.amount)?;
        existing(ctx, command.to).await?.deposit(command.amount)?;
        Ok(())
    }
}

#[async_trait]
impl CommandHandler<CloseAccount> for AccountHandlers {
    async fn handle(&self, command: &CloseAccount, ctx: &mut CommandContext) -> HandlerResult {
        self.count();
        existing(ctx, command.account_id).await?.close()?;
        Ok(())
    }
}

/// Registry with every account handler and the given snapshot policy.
///
/// # Panics
///
/// Never; the registrations do not collide.
#[must_use]
pub fn account_registry(handlers: &AccountHandlers, policy: SnapshotPolicy) -> Registry {
    Registry::builder()
        .snapshotted::<Account>(policy)
        .handler::<OpenAccount, _>(handlers.clone())
        .handler::<Deposit, _>(handlers.clone())
        .handler::<Withdraw, _>(handlers.clone())
        .handler::<Transfer, _>(handlers.clone())
        .handler::<CloseAccount, _>(handlers.clone())
        .build()
        .expect("account registry is valid")
}

/// Credits every newly opened account with a fixed bonus.
#[derive(Debug, Clone)]
pub struct WelcomeBonus {
    /// Amount deposited.
    pub amount: i64,
}

#[async_trait]
impl ProcessManager for WelcomeBonus {
    fn name(&self) -> &str {
        "welcome-bonus"
    }

    fn accepts(&self, stream: &EventStream) -> bool {
        stream.aggregate_type == Account::AGGREGATE_TYPE
    }

    async fn react(&self, stream: &EventStream) -> Result<Vec<CommandEnvelope>, EngineError> {
        let opened = stream
            .events
            .iter()
            .any(|event| event.event_type == "account.opened");
        if !opened {
            return Ok(Vec::new());
        }
        Ok(vec![CommandEnvelope::new(Deposit {
            command_id: derive_command_id(stream, "welcome-bonus"),
            account_id: stream.aggregate_id,
            amount: self.amount,
        })])
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_open_records_one_event() {
        let id = Uuid::new_v4();

        let account = Account::open(id, "ada");

        assert_eq!(account.version(), 1);
        assert_eq!(account.state().owner, "ada");
        assert_eq!(account.uncommitted_events().len(), 1);
    }

    #[test]
    fn test_withdraw_rejects_overdraft() {
        let mut account = Account::open(Uuid::new_v4(), "ada");
        account.deposit(10).unwrap();

        let rejection = account.withdraw(11).unwrap_err();

        assert_eq!(rejection.code, "insufficient_funds");
        assert_eq!(rejection.details["balance"], 10);
        assert_eq!(account.balance(), 10);
    }

    #[test]
    fn test_closed_account_refuses_deposits() {
        let mut account = Account::open(Uuid::new_v4(), "ada");
        account.close().unwrap();

        assert_eq!(account.deposit(5).unwrap_err().code, "account_closed");
    }

    #[test]
    fn test_snapshot_restores_state() {
        let mut account = Account::open(Uuid::new_v4(), "ada");
        account.deposit(42).unwrap();

        let payload = account.capture_snapshot().unwrap();
        let restored = Account::restore(account.aggregate_id(), account.version(), &payload).unwrap();

        assert_eq!(restored.state(), account.state());
        assert_eq!(restored.version(), 2);
        assert!(restored.uncommitted_events().is_empty());
    }

    #[test]
    fn test_events_round_trip_through_payload() {
        let event = AccountEvent::Withdrawn { amount: 7 };

        let decoded = AccountEvent::from_payload(&event.to_payload().unwrap()).unwrap();

        assert_eq!(decoded, event);
        assert_eq!(event.event_type(), "account.withdrawn");
    }
}
