//! Storage strategy for the ledger.
//!
//! A single [`LedgerStore`] backend is chosen at startup and used for every
//! operation. Writes go through a [`LedgerTx`]: one store transaction that the
//! service layer opens, passes explicitly to the core ledger functions and
//! commits at the operation boundary. Dropping a `LedgerTx` without calling
//! [`LedgerTx::commit`] rolls it back.
//!
//! `lock_*` methods take a row lock that is held until commit or rollback, so
//! "read balance, validate, write balance" is a single step per account.

pub mod memory;
pub mod postgres;

pub use memory::MemoryLedgerStore;
pub use postgres::PgLedgerStore;

use crate::error::StoreResult;
use crate::models::{
    AuditRecord, EntryType, EscrowPosition, EscrowRelease, EscrowType, LedgerEntry,
    PartnerWallet, PaymentStatus, PaymentTransaction, ReferenceType, SettlementBatch,
    SettlementFilter, SettlementStatus, WalletAccount,
};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Which entry log an aggregate runs over
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LedgerKind {
    User,
    Partner,
}

/// Sum and count of entries sharing a reference type and direction
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EntryTotal {
    pub reference_type: ReferenceType,
    pub entry_type: EntryType,
    pub count: i64,
    pub amount: Decimal,
}

/// Gross released, fees kept and refunds paid out by escrow releases
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct EscrowReleaseTotals {
    pub count: i64,
    pub released: Decimal,
    pub fees: Decimal,
    pub refunded: Decimal,
}

/// Projected balance of an account next to the signed sum of its entries
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BalanceCheck {
    pub kind: LedgerKind,
    pub account_id: String,
    pub projected_balance: Decimal,
    pub ledger_balance: Decimal,
}

impl BalanceCheck {
    pub fn drift(&self) -> Decimal {
        self.projected_balance - self.ledger_balance
    }

    pub fn is_consistent(&self) -> bool {
        self.drift().is_zero()
    }
}

/// One open store transaction
#[async_trait]
pub trait LedgerTx: Send {
    // ---------------------------------------------------------------------
    // Wallet accounts
    // ---------------------------------------------------------------------

    async fn lock_account(&mut self, account_id: &str) -> StoreResult<Option<WalletAccount>>;

    /// Insert unless the account already exists. Returns true when inserted.
    async fn insert_account(&mut self, account: &WalletAccount) -> StoreResult<bool>;

    async fn update_account(&mut self, account: &WalletAccount) -> StoreResult<()>;

    // ---------------------------------------------------------------------
    // User ledger
    // ---------------------------------------------------------------------

    async fn find_entry_by_reference(
        &mut self,
        account_id: &str,
        reference_type: ReferenceType,
        reference_id: &str,
    ) -> StoreResult<Option<LedgerEntry>>;

    /// Append an entry. A reused `(account, reference_type, reference_id)`
    /// fails with `StoreError::Duplicate`.
    async fn insert_entry(&mut self, entry: &LedgerEntry) -> StoreResult<()>;

    async fn sum_entries_since(
        &mut self,
        account_id: &str,
        reference_type: ReferenceType,
        since: DateTime<Utc>,
    ) -> StoreResult<Decimal>;

    // ---------------------------------------------------------------------
    // Escrow
    // ---------------------------------------------------------------------

    async fn escrow_position(
        &mut self,
        account_id: &str,
        escrow_type: EscrowType,
        escrow_ref: Option<&str>,
    ) -> StoreResult<EscrowPosition>;

    async fn find_escrow_release(
        &mut self,
        account_id: &str,
        escrow_type: EscrowType,
        escrow_ref: &str,
    ) -> StoreResult<Option<EscrowRelease>>;

    async fn insert_escrow_release(&mut self, release: &EscrowRelease) -> StoreResult<()>;

    // ---------------------------------------------------------------------
    // Partners
    // ---------------------------------------------------------------------

    async fn lock_partner(&mut self, partner_id: &str) -> StoreResult<Option<PartnerWallet>>;

    async fn insert_partner(&mut self, partner: &PartnerWallet) -> StoreResult<bool>;

    async fn update_partner(&mut self, partner: &PartnerWallet) -> StoreResult<()>;

    async fn find_partner_entry_by_reference(
        &mut self,
        partner_id: &str,
        reference_type: ReferenceType,
        reference_id: &str,
    ) -> StoreResult<Option<LedgerEntry>>;

    async fn insert_partner_entry(&mut self, entry: &LedgerEntry) -> StoreResult<()>;

    async fn count_partner_entries(
        &mut self,
        partner_id: &str,
        reference_type: ReferenceType,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> StoreResult<i64>;

    // ---------------------------------------------------------------------
    // Settlement batches
    // ---------------------------------------------------------------------

    async fn insert_batch(&mut self, batch: &SettlementBatch) -> StoreResult<()>;

    async fn lock_batch(&mut self, batch_id: Uuid) -> StoreResult<Option<SettlementBatch>>;

    async fn find_open_batch(&mut self, partner_id: &str) -> StoreResult<Option<SettlementBatch>>;

    /// Write `batch` only if the stored status still equals `expected`.
    /// Returns false when the guard did not match and nothing was written.
    async fn update_batch(
        &mut self,
        batch: &SettlementBatch,
        expected: SettlementStatus,
    ) -> StoreResult<bool>;

    // ---------------------------------------------------------------------
    // Payment transactions
    // ---------------------------------------------------------------------

    async fn insert_payment(&mut self, payment: &PaymentTransaction) -> StoreResult<()>;

    async fn lock_payment(&mut self, payment_id: Uuid) -> StoreResult<Option<PaymentTransaction>>;

    async fn lock_payment_by_gateway_ref(
        &mut self,
        gateway_txn_ref: &str,
    ) -> StoreResult<Option<PaymentTransaction>>;

    /// Conditional write, same contract as [`LedgerTx::update_batch`]
    async fn update_payment(
        &mut self,
        payment: &PaymentTransaction,
        expected: PaymentStatus,
    ) -> StoreResult<bool>;

    // ---------------------------------------------------------------------
    // Audit
    // ---------------------------------------------------------------------

    async fn insert_audit(&mut self, record: &AuditRecord) -> StoreResult<()>;

    async fn commit(&mut self) -> StoreResult<()>;
}

/// The ledger's backing store
#[async_trait]
pub trait LedgerStore: Send + Sync {
    async fn begin(&self) -> StoreResult<Box<dyn LedgerTx>>;

    async fn get_account(&self, account_id: &str) -> StoreResult<Option<WalletAccount>>;

    /// Newest first
    async fn list_entries(
        &self,
        account_id: &str,
        limit: i64,
        offset: i64,
    ) -> StoreResult<Vec<LedgerEntry>>;

    async fn find_entry_by_reference(
        &self,
        account_id: &str,
        reference_type: ReferenceType,
        reference_id: &str,
    ) -> StoreResult<Option<LedgerEntry>>;

    async fn escrow_position(
        &self,
        account_id: &str,
        escrow_type: EscrowType,
        escrow_ref: Option<&str>,
    ) -> StoreResult<EscrowPosition>;

    async fn get_partner(&self, partner_id: &str) -> StoreResult<Option<PartnerWallet>>;

    /// Active partners with positive pending settlement and no open batch
    async fn list_partners_due(&self) -> StoreResult<Vec<PartnerWallet>>;

    /// Newest first
    async fn list_partner_entries(
        &self,
        partner_id: &str,
        limit: i64,
        offset: i64,
    ) -> StoreResult<Vec<LedgerEntry>>;

    async fn get_batch(&self, batch_id: Uuid) -> StoreResult<Option<SettlementBatch>>;

    /// Newest first
    async fn list_batches(&self, filter: &SettlementFilter) -> StoreResult<Vec<SettlementBatch>>;

    /// End of the most recent batch period that was not cancelled
    async fn last_period_end(&self, partner_id: &str) -> StoreResult<Option<DateTime<Utc>>>;

    async fn get_payment(&self, payment_id: Uuid) -> StoreResult<Option<PaymentTransaction>>;

    async fn find_payment_by_gateway_ref(
        &self,
        gateway_txn_ref: &str,
    ) -> StoreResult<Option<PaymentTransaction>>;

    /// Newest first
    async fn list_payments_for_user(
        &self,
        user_id: &str,
        limit: i64,
    ) -> StoreResult<Vec<PaymentTransaction>>;

    /// Entry sums grouped by reference type and direction, `from <= created_at < to`
    async fn entry_totals(
        &self,
        kind: LedgerKind,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> StoreResult<Vec<EntryTotal>>;

    async fn escrow_release_totals(
        &self,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> StoreResult<EscrowReleaseTotals>;

    /// Projection vs. entry-log balances. `account_id` narrows to one account;
    /// `only_drifted` keeps just the inconsistent ones.
    async fn balance_checks(
        &self,
        kind: LedgerKind,
        account_id: Option<&str>,
        only_drifted: bool,
    ) -> StoreResult<Vec<BalanceCheck>>;

    /// Newest first
    async fn list_audit(
        &self,
        subject_type: Option<&str>,
        subject_id: Option<&str>,
        limit: i64,
    ) -> StoreResult<Vec<AuditRecord>>;
}
