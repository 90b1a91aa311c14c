//! PostgreSQL ledger store.
//!
//! Row locks are `SELECT ... FOR UPDATE` inside the open transaction. Status
//! changes on batches and payments are conditional `UPDATE ... WHERE status =`
//! statements so a lost race shows up as zero affected rows.

use super::{
    BalanceCheck, EntryTotal, EscrowReleaseTotals, LedgerKind, LedgerStore, LedgerTx,
};
use crate::error::{StoreError, StoreResult};
use crate::models::{
    AuditRecord, EntryType, EscrowPosition, EscrowRelease, EscrowType, LedgerEntry,
    PartnerStatus, PartnerType, PartnerWallet, PaymentMethod, PaymentStatus, PaymentTransaction,
    PaymentTransactionType, ReferenceType, SettlementBatch, SettlementFilter, SettlementStatus,
    WalletAccount,
};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use sqlx::postgres::PgRow;
use sqlx::{PgConnection, PgExecutor, PgPool, Postgres, Row, Transaction};
use uuid::Uuid;

const ACCOUNT_COLUMNS: &str = "account_id, balance, frozen, daily_withdrawal_limit, \
     monthly_withdrawal_limit, created_at, updated_at";

const ENTRY_COLUMNS: &str = "ledger_id, account_id, entry_type, amount, balance_before, \
     balance_after, reference_type, reference_id, description, metadata, created_at";

const RELEASE_COLUMNS: &str = "release_id, account_id, escrow_type, escrow_ref, amount, fee, \
     refund_amount, ledger_id, created_at";

const PARTNER_COLUMNS: &str = "partner_id, partner_type, balance, pending_settlement, \
     total_earned, commission_rate, status, bank_account, created_at, updated_at";

const BATCH_COLUMNS: &str = "batch_id, partner_id, period_start, period_end, \
     total_transactions, gross_amount, commission_rate, commission_amount, net_amount, status, \
     approved_by, approved_at, paid_at, payment_reference, failure_reason, created_at, updated_at";

const PAYMENT_COLUMNS: &str = "payment_id, user_id, amount, payment_method, transaction_type, \
     status, external_transaction_id, gateway_txn_ref, error_message, ledger_entry_id, \
     created_at, updated_at, completed_at";

const AUDIT_COLUMNS: &str =
    "audit_id, action, actor, subject_type, subject_id, details, created_at";

fn entry_table(kind: LedgerKind) -> &'static str {
    match kind {
        LedgerKind::User => "ledger_entries",
        LedgerKind::Partner => "partner_ledger_entries",
    }
}

// =============================================================================
// Row mapping
// =============================================================================

fn decode<T>(value: Option<T>, column: &str, raw: &str) -> StoreResult<T> {
    value.ok_or_else(|| StoreError::Decode(format!("unknown {} value '{}'", column, raw)))
}

fn account_from_row(row: &PgRow) -> StoreResult<WalletAccount> {
    Ok(WalletAccount {
        account_id: row.try_get("account_id")?,
        balance: row.try_get("balance")?,
        frozen: row.try_get("frozen")?,
        daily_withdrawal_limit: row.try_get("daily_withdrawal_limit")?,
        monthly_withdrawal_limit: row.try_get("monthly_withdrawal_limit")?,
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
    })
}

fn entry_from_row(row: &PgRow) -> StoreResult<LedgerEntry> {
    let entry_type: String = row.try_get("entry_type")?;
    let reference_type: String = row.try_get("reference_type")?;
    Ok(LedgerEntry {
        ledger_id: row.try_get("ledger_id")?,
        account_id: row.try_get("account_id")?,
        entry_type: decode(EntryType::from_str(&entry_type), "entry_type", &entry_type)?,
        amount: row.try_get("amount")?,
        balance_before: row.try_get("balance_before")?,
        balance_after: row.try_get("balance_after")?,
        reference_type: decode(
            ReferenceType::from_str(&reference_type),
            "reference_type",
            &reference_type,
        )?,
        reference_id: row.try_get("reference_id")?,
        description: row.try_get("description")?,
        metadata: row.try_get("metadata")?,
        created_at: row.try_get("created_at")?,
    })
}

fn release_from_row(row: &PgRow) -> StoreResult<EscrowRelease> {
    let escrow_type: String = row.try_get("escrow_type")?;
    Ok(EscrowRelease {
        release_id: row.try_get("release_id")?,
        account_id: row.try_get("account_id")?,
        escrow_type: decode(EscrowType::from_str(&escrow_type), "escrow_type", &escrow_type)?,
        escrow_ref: row.try_get("escrow_ref")?,
        amount: row.try_get("amount")?,
        fee: row.try_get("fee")?,
        refund_amount: row.try_get("refund_amount")?,
        ledger_id: row.try_get("ledger_id")?,
        created_at: row.try_get("created_at")?,
    })
}

fn partner_from_row(row: &PgRow) -> StoreResult<PartnerWallet> {
    let partner_type: String = row.try_get("partner_type")?;
    let status: String = row.try_get("status")?;
    Ok(PartnerWallet {
        partner_id: row.try_get("partner_id")?,
        partner_type: decode(
            PartnerType::from_str(&partner_type),
            "partner_type",
            &partner_type,
        )?,
        balance: row.try_get("balance")?,
        pending_settlement: row.try_get("pending_settlement")?,
        total_earned: row.try_get("total_earned")?,
        commission_rate: row.try_get("commission_rate")?,
        status: decode(PartnerStatus::from_str(&status), "partner status", &status)?,
        bank_account: row.try_get("bank_account")?,
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
    })
}

fn batch_from_row(row: &PgRow) -> StoreResult<SettlementBatch> {
    let status: String = row.try_get("status")?;
    Ok(SettlementBatch {
        batch_id: row.try_get("batch_id")?,
        partner_id: row.try_get("partner_id")?,
        period_start: row.try_get("period_start")?,
        period_end: row.try_get("period_end")?,
        total_transactions: row.try_get("total_transactions")?,
        gross_amount: row.try_get("gross_amount")?,
        commission_rate: row.try_get("commission_rate")?,
        commission_amount: row.try_get("commission_amount")?,
        net_amount: row.try_get("net_amount")?,
        status: decode(SettlementStatus::from_str(&status), "settlement status", &status)?,
        approved_by: row.try_get("approved_by")?,
        approved_at: row.try_get("approved_at")?,
        paid_at: row.try_get("paid_at")?,
        payment_reference: row.try_get("payment_reference")?,
        failure_reason: row.try_get("failure_reason")?,
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
    })
}

fn payment_from_row(row: &PgRow) -> StoreResult<PaymentTransaction> {
    let method: String = row.try_get("payment_method")?;
    let transaction_type: String = row.try_get("transaction_type")?;
    let status: String = row.try_get("status")?;
    Ok(PaymentTransaction {
        payment_id: row.try_get("payment_id")?,
        user_id: row.try_get("user_id")?,
        amount: row.try_get("amount")?,
        payment_method: decode(PaymentMethod::from_str(&method), "payment_method", &method)?,
        transaction_type: decode(
            PaymentTransactionType::from_str(&transaction_type),
            "transaction_type",
            &transaction_type,
        )?,
        status: decode(PaymentStatus::from_str(&status), "payment status", &status)?,
        external_transaction_id: row.try_get("external_transaction_id")?,
        gateway_txn_ref: row.try_get("gateway_txn_ref")?,
        error_message: row.try_get("error_message")?,
        ledger_entry_id: row.try_get("ledger_entry_id")?,
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
        completed_at: row.try_get("completed_at")?,
    })
}

fn audit_from_row(row: &PgRow) -> StoreResult<AuditRecord> {
    Ok(AuditRecord {
        audit_id: row.try_get("audit_id")?,
        action: row.try_get("action")?,
        actor: row.try_get("actor")?,
        subject_type: row.try_get("subject_type")?,
        subject_id: row.try_get("subject_id")?,
        details: row.try_get("details")?,
        created_at: row.try_get("created_at")?,
    })
}

fn collect<T>(rows: Vec<PgRow>, map: fn(&PgRow) -> StoreResult<T>) -> StoreResult<Vec<T>> {
    rows.iter().map(map).collect()
}

// =============================================================================
// Shared queries (pool reads and in-transaction reads)
// =============================================================================

async fn fetch_account<'e, E: PgExecutor<'e>>(
    exec: E,
    account_id: &str,
    for_update: bool,
) -> StoreResult<Option<WalletAccount>> {
    let sql = format!(
        "SELECT {} FROM wallet_accounts WHERE account_id = $1{}",
        ACCOUNT_COLUMNS,
        if for_update { " FOR UPDATE" } else { "" }
    );
    let row = sqlx::query(&sql)
        .bind(account_id)
        .fetch_optional(exec)
        .await?;
    row.as_ref().map(account_from_row).transpose()
}

async fn fetch_entry_by_reference<'e, E: PgExecutor<'e>>(
    exec: E,
    kind: LedgerKind,
    account_id: &str,
    reference_type: ReferenceType,
    reference_id: &str,
) -> StoreResult<Option<LedgerEntry>> {
    let sql = format!(
        "SELECT {} FROM {} WHERE account_id = $1 AND reference_type = $2 AND reference_id = $3",
        ENTRY_COLUMNS,
        entry_table(kind)
    );
    let row = sqlx::query(&sql)
        .bind(account_id)
        .bind(reference_type.as_str())
        .bind(reference_id)
        .fetch_optional(exec)
        .await?;
    row.as_ref().map(entry_from_row).transpose()
}

async fn insert_entry_into<'e, E: PgExecutor<'e>>(
    exec: E,
    kind: LedgerKind,
    entry: &LedgerEntry,
) -> StoreResult<()> {
    let sql = format!(
        "INSERT INTO {} ({}) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11)",
        entry_table(kind),
        ENTRY_COLUMNS
    );
    sqlx::query(&sql)
        .bind(entry.ledger_id)
        .bind(&entry.account_id)
        .bind(entry.entry_type.as_str())
        .bind(entry.amount)
        .bind(entry.balance_before)
        .bind(entry.balance_after)
        .bind(entry.reference_type.as_str())
        .bind(&entry.reference_id)
        .bind(&entry.description)
        .bind(&entry.metadata)
        .bind(entry.created_at)
        .execute(exec)
        .await?;
    Ok(())
}

async fn fetch_escrow_position<'e, E: PgExecutor<'e>>(
    exec: E,
    account_id: &str,
    escrow_type: EscrowType,
    escrow_ref: Option<&str>,
) -> StoreResult<EscrowPosition> {
    let row = sqlx::query(
        r#"
        SELECT
            (SELECT COALESCE(SUM(amount), 0) FROM ledger_entries
              WHERE account_id = $1 AND reference_type = $2
                AND ($4::TEXT IS NULL OR reference_id = $4)) AS held,
            (SELECT COALESCE(SUM(amount), 0) FROM escrow_releases
              WHERE account_id = $1 AND escrow_type = $3
                AND ($4::TEXT IS NULL OR escrow_ref = $4)) AS released
        "#,
    )
    .bind(account_id)
    .bind(escrow_type.hold_reference().as_str())
    .bind(escrow_type.as_str())
    .bind(escrow_ref)
    .fetch_one(exec)
    .await?;
    Ok(EscrowPosition {
        held: row.try_get("held")?,
        released: row.try_get("released")?,
    })
}

async fn fetch_partner<'e, E: PgExecutor<'e>>(
    exec: E,
    partner_id: &str,
    for_update: bool,
) -> StoreResult<Option<PartnerWallet>> {
    let sql = format!(
        "SELECT {} FROM partner_wallets WHERE partner_id = $1{}",
        PARTNER_COLUMNS,
        if for_update { " FOR UPDATE" } else { "" }
    );
    let row = sqlx::query(&sql)
        .bind(partner_id)
        .fetch_optional(exec)
        .await?;
    row.as_ref().map(partner_from_row).transpose()
}

async fn fetch_batch<'e, E: PgExecutor<'e>>(
    exec: E,
    batch_id: Uuid,
    for_update: bool,
) -> StoreResult<Option<SettlementBatch>> {
    let sql = format!(
        "SELECT {} FROM settlement_batches WHERE batch_id = $1{}",
        BATCH_COLUMNS,
        if for_update { " FOR UPDATE" } else { "" }
    );
    let row = sqlx::query(&sql).bind(batch_id).fetch_optional(exec).await?;
    row.as_ref().map(batch_from_row).transpose()
}

async fn fetch_payment<'e, E: PgExecutor<'e>>(
    exec: E,
    column: &str,
    key: PaymentKey<'_>,
    for_update: bool,
) -> StoreResult<Option<PaymentTransaction>> {
    let sql = format!(
        "SELECT {} FROM payment_transactions WHERE {} = $1{}",
        PAYMENT_COLUMNS,
        column,
        if for_update { " FOR UPDATE" } else { "" }
    );
    let query = sqlx::query(&sql);
    let query = match key {
        PaymentKey::Id(id) => query.bind(id),
        PaymentKey::GatewayRef(gateway_ref) => query.bind(gateway_ref),
    };
    let row = query.fetch_optional(exec).await?;
    row.as_ref().map(payment_from_row).transpose()
}

enum PaymentKey<'a> {
    Id(Uuid),
    GatewayRef(&'a str),
}

// =============================================================================
// Store
// =============================================================================

/// Authoritative store backed by PostgreSQL
#[derive(Clone)]
pub struct PgLedgerStore {
    pool: PgPool,
}

impl PgLedgerStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

/// Open PostgreSQL transaction. Dropping it without commit rolls back.
pub struct PgLedgerTx {
    tx: Option<Transaction<'static, Postgres>>,
}

impl PgLedgerTx {
    fn conn(&mut self) -> StoreResult<&mut PgConnection> {
        self.tx.as_deref_mut().ok_or(StoreError::TransactionClosed)
    }
}

#[async_trait]
impl LedgerTx for PgLedgerTx {
    async fn lock_account(&mut self, account_id: &str) -> StoreResult<Option<WalletAccount>> {
        fetch_account(self.conn()?, account_id, true).await
    }

    async fn insert_account(&mut self, account: &WalletAccount) -> StoreResult<bool> {
        let sql = format!(
            "INSERT INTO wallet_accounts ({}) VALUES ($1, $2, $3, $4, $5, $6, $7) \
             ON CONFLICT (account_id) DO NOTHING",
            ACCOUNT_COLUMNS
        );
        let result = sqlx::query(&sql)
            .bind(&account.account_id)
            .bind(account.balance)
            .bind(account.frozen)
            .bind(account.daily_withdrawal_limit)
            .bind(account.monthly_withdrawal_limit)
            .bind(account.created_at)
            .bind(account.updated_at)
            .execute(self.conn()?)
            .await?;
        Ok(result.rows_affected() == 1)
    }

    async fn update_account(&mut self, account: &WalletAccount) -> StoreResult<()> {
        sqlx::query(
            r#"
            UPDATE wallet_accounts
            SET balance = $2, frozen = $3, daily_withdrawal_limit = $4,
                monthly_withdrawal_limit = $5, updated_at = $6
            WHERE account_id = $1
            "#,
        )
        .bind(&account.account_id)
        .bind(account.balance)
        .bind(account.frozen)
        .bind(account.daily_withdrawal_limit)
        .bind(account.monthly_withdrawal_limit)
        .bind(account.updated_at)
        .execute(self.conn()?)
        .await?;
        Ok(())
    }

    async fn find_entry_by_reference(
        &mut self,
        account_id: &str,
        reference_type: ReferenceType,
        reference_id: &str,
    ) -> StoreResult<Option<LedgerEntry>> {
        fetch_entry_by_reference(
            self.conn()?,
            LedgerKind::User,
            account_id,
            reference_type,
            reference_id,
        )
        .await
    }

    async fn insert_entry(&mut self, entry: &LedgerEntry) -> StoreResult<()> {
        insert_entry_into(self.conn()?, LedgerKind::User, entry).await
    }

    async fn sum_entries_since(
        &mut self,
        account_id: &str,
        reference_type: ReferenceType,
        since: DateTime<Utc>,
    ) -> StoreResult<Decimal> {
        let total: Decimal = sqlx::query_scalar(
            r#"
            SELECT COALESCE(SUM(amount), 0)
            FROM ledger_entries
            WHERE account_id = $1 AND reference_type = $2 AND created_at >= $3
            "#,
        )
        .bind(account_id)
        .bind(reference_type.as_str())
        .bind(since)
        .fetch_one(self.conn()?)
        .await?;
        Ok(total)
    }

    async fn escrow_position(
        &mut self,
        account_id: &str,
        escrow_type: EscrowType,
        escrow_ref: Option<&str>,
    ) -> StoreResult<EscrowPosition> {
        fetch_escrow_position(self.conn()?, account_id, escrow_type, escrow_ref).await
    }

    async fn find_escrow_release(
        &mut self,
        account_id: &str,
        escrow_type: EscrowType,
        escrow_ref: &str,
    ) -> StoreResult<Option<EscrowRelease>> {
        let sql = format!(
            "SELECT {} FROM escrow_releases \
             WHERE account_id = $1 AND escrow_type = $2 AND escrow_ref = $3",
            RELEASE_COLUMNS
        );
        let row = sqlx::query(&sql)
            .bind(account_id)
            .bind(escrow_type.as_str())
            .bind(escrow_ref)
            .fetch_optional(self.conn()?)
            .await?;
        row.as_ref().map(release_from_row).transpose()
    }

    async fn insert_escrow_release(&mut self, release: &EscrowRelease) -> StoreResult<()> {
        let sql = format!(
            "INSERT INTO escrow_releases ({}) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)",
            RELEASE_COLUMNS
        );
        sqlx::query(&sql)
            .bind(release.release_id)
            .bind(&release.account_id)
            .bind(release.escrow_type.as_str())
            .bind(&release.escrow_ref)
            .bind(release.amount)
            .bind(release.fee)
            .bind(release.refund_amount)
            .bind(release.ledger_id)
            .bind(release.created_at)
            .execute(self.conn()?)
            .await?;
        Ok(())
    }

    async fn lock_partner(&mut self, partner_id: &str) -> StoreResult<Option<PartnerWallet>> {
        fetch_partner(self.conn()?, partner_id, true).await
    }

    async fn insert_partner(&mut self, partner: &PartnerWallet) -> StoreResult<bool> {
        let sql = format!(
            "INSERT INTO partner_wallets ({}) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10) \
             ON CONFLICT (partner_id) DO NOTHING",
            PARTNER_COLUMNS
        );
        let result = sqlx::query(&sql)
            .bind(&partner.partner_id)
            .bind(partner.partner_type.as_str())
            .bind(partner.balance)
            .bind(partner.pending_settlement)
            .bind(partner.total_earned)
            .bind(partner.commission_rate)
            .bind(partner.status.as_str())
            .bind(&partner.bank_account)
            .bind(partner.created_at)
            .bind(partner.updated_at)
            .execute(self.conn()?)
            .await?;
        Ok(result.rows_affected() == 1)
    }

    async fn update_partner(&mut self, partner: &PartnerWallet) -> StoreResult<()> {
        sqlx::query(
            r#"
            UPDATE partner_wallets
            SET balance = $2, pending_settlement = $3, total_earned = $4,
                commission_rate = $5, status = $6, bank_account = $7, updated_at = $8
            WHERE partner_id = $1
            "#,
        )
        .bind(&partner.partner_id)
        .bind(partner.balance)
        .bind(partner.pending_settlement)
        .bind(partner.total_earned)
        .bind(partner.commission_rate)
        .bind(partner.status.as_str())
        .bind(&partner.bank_account)
        .bind(partner.updated_at)
        .execute(self.conn()?)
        .await?;
        Ok(())
    }

    async fn find_partner_entry_by_reference(
        &mut self,
        partner_id: &str,
        reference_type: ReferenceType,
        reference_id: &str,
    ) -> StoreResult<Option<LedgerEntry>> {
        fetch_entry_by_reference(
            self.conn()?,
            LedgerKind::Partner,
            partner_id,
            reference_type,
            reference_id,
        )
        .await
    }

    async fn insert_partner_entry(&mut self, entry: &LedgerEntry) -> StoreResult<()> {
        insert_entry_into(self.conn()?, LedgerKind::Partner, entry).await
    }

    async fn count_partner_entries(
        &mut self,
        partner_id: &str,
        reference_type: ReferenceType,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> StoreResult<i64> {
        let count: i64 = sqlx::query_scalar(
            r#"
            SELECT COUNT(*)
            FROM partner_ledger_entries
            WHERE account_id = $1 AND reference_type = $2
              AND created_at >= $3 AND created_at < $4
            "#,
        )
        .bind(partner_id)
        .bind(reference_type.as_str())
        .bind(from)
        .bind(to)
        .fetch_one(self.conn()?)
        .await?;
        Ok(count)
    }

    async fn insert_batch(&mut self, batch: &SettlementBatch) -> StoreResult<()> {
        let sql = format!(
            "INSERT INTO settlement_batches ({}) VALUES \
             ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16, $17)",
            BATCH_COLUMNS
        );
        sqlx::query(&sql)
            .bind(batch.batch_id)
            .bind(&batch.partner_id)
            .bind(batch.period_start)
            .bind(batch.period_end)
            .bind(batch.total_transactions)
            .bind(batch.gross_amount)
            .bind(batch.commission_rate)
            .bind(batch.commission_amount)
            .bind(batch.net_amount)
            .bind(batch.status.as_str())
            .bind(&batch.approved_by)
            .bind(batch.approved_at)
            .bind(batch.paid_at)
            .bind(&batch.payment_reference)
            .bind(&batch.failure_reason)
            .bind(batch.created_at)
            .bind(batch.updated_at)
            .execute(self.conn()?)
            .await?;
        Ok(())
    }

    async fn lock_batch(&mut self, batch_id: Uuid) -> StoreResult<Option<SettlementBatch>> {
        fetch_batch(self.conn()?, batch_id, true).await
    }

    async fn find_open_batch(&mut self, partner_id: &str) -> StoreResult<Option<SettlementBatch>> {
        let sql = format!(
            "SELECT {} FROM settlement_batches \
             WHERE partner_id = $1 AND status IN ('pending', 'approved', 'processing') \
             ORDER BY created_at DESC LIMIT 1 FOR UPDATE",
            BATCH_COLUMNS
        );
        let row = sqlx::query(&sql)
            .bind(partner_id)
            .fetch_optional(self.conn()?)
            .await?;
        row.as_ref().map(batch_from_row).transpose()
    }

    async fn update_batch(
        &mut self,
        batch: &SettlementBatch,
        expected: SettlementStatus,
    ) -> StoreResult<bool> {
        let result = sqlx::query(
            r#"
            UPDATE settlement_batches
            SET status = $3, approved_by = $4, approved_at = $5, paid_at = $6,
                payment_reference = $7, failure_reason = $8, updated_at = $9
            WHERE batch_id = $1 AND status = $2
            "#,
        )
        .bind(batch.batch_id)
        .bind(expected.as_str())
        .bind(batch.status.as_str())
        .bind(&batch.approved_by)
        .bind(batch.approved_at)
        .bind(batch.paid_at)
        .bind(&batch.payment_reference)
        .bind(&batch.failure_reason)
        .bind(batch.updated_at)
        .execute(self.conn()?)
        .await?;
        Ok(result.rows_affected() == 1)
    }

    async fn insert_payment(&mut self, payment: &PaymentTransaction) -> StoreResult<()> {
        let sql = format!(
            "INSERT INTO payment_transactions ({}) VALUES \
             ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13)",
            PAYMENT_COLUMNS
        );
        sqlx::query(&sql)
            .bind(payment.payment_id)
            .bind(&payment.user_id)
            .bind(payment.amount)
            .bind(payment.payment_method.as_str())
            .bind(payment.transaction_type.as_str())
            .bind(payment.status.as_str())
            .bind(&payment.external_transaction_id)
            .bind(&payment.gateway_txn_ref)
            .bind(&payment.error_message)
            .bind(payment.ledger_entry_id)
            .bind(payment.created_at)
            .bind(payment.updated_at)
            .bind(payment.completed_at)
            .execute(self.conn()?)
            .await?;
        Ok(())
    }

    async fn lock_payment(&mut self, payment_id: Uuid) -> StoreResult<Option<PaymentTransaction>> {
        fetch_payment(self.conn()?, "payment_id", PaymentKey::Id(payment_id), true).await
    }

    async fn lock_payment_by_gateway_ref(
        &mut self,
        gateway_txn_ref: &str,
    ) -> StoreResult<Option<PaymentTransaction>> {
        fetch_payment(
            self.conn()?,
            "gateway_txn_ref",
            PaymentKey::GatewayRef(gateway_txn_ref),
            true,
        )
        .await
    }

    async fn update_payment(
        &mut self,
        payment: &PaymentTransaction,
        expected: PaymentStatus,
    ) -> StoreResult<bool> {
        let result = sqlx::query(
            r#"
            UPDATE payment_transactions
            SET status = $3, external_transaction_id = $4, error_message = $5,
                ledger_entry_id = $6, updated_at = $7, completed_at = $8
            WHERE payment_id = $1 AND status = $2
            "#,
        )
        .bind(payment.payment_id)
        .bind(expected.as_str())
        .bind(payment.status.as_str())
        .bind(&payment.external_transaction_id)
        .bind(&payment.error_message)
        .bind(payment.ledger_entry_id)
        .bind(payment.updated_at)
        .bind(payment.completed_at)
        .execute(self.conn()?)
        .await?;
        Ok(result.rows_affected() == 1)
    }

    async fn insert_audit(&mut self, record: &AuditRecord) -> StoreResult<()> {
        let sql = format!(
            "INSERT INTO audit_log ({}) VALUES ($1, $2, $3, $4, $5, $6, $7)",
            AUDIT_COLUMNS
        );
        sqlx::query(&sql)
            .bind(record.audit_id)
            .bind(&record.action)
            .bind(&record.actor)
            .bind(&record.subject_type)
            .bind(&record.subject_id)
            .bind(&record.details)
            .bind(record.created_at)
            .execute(self.conn()?)
            .await?;
        Ok(())
    }

    async fn commit(&mut self) -> StoreResult<()> {
        let tx = self.tx.take().ok_or(StoreError::TransactionClosed)?;
        tx.commit().await?;
        Ok(())
    }
}

#[async_trait]
impl LedgerStore for PgLedgerStore {
    async fn begin(&self) -> StoreResult<Box<dyn LedgerTx>> {
        let tx = self.pool.begin().await?;
        Ok(Box::new(PgLedgerTx { tx: Some(tx) }))
    }

    async fn get_account(&self, account_id: &str) -> StoreResult<Option<WalletAccount>> {
        fetch_account(&self.pool, account_id, false).await
    }

    async fn list_entries(
        &self,
        account_id: &str,
        limit: i64,
        offset: i64,
    ) -> StoreResult<Vec<LedgerEntry>> {
        let sql = format!(
            "SELECT {} FROM ledger_entries WHERE account_id = $1 \
             ORDER BY created_at DESC LIMIT $2 OFFSET $3",
            ENTRY_COLUMNS
        );
        let rows = sqlx::query(&sql)
            .bind(account_id)
            .bind(limit)
            .bind(offset)
            .fetch_all(&self.pool)
            .await?;
        collect(rows, entry_from_row)
    }

    async fn find_entry_by_reference(
        &self,
        account_id: &str,
        reference_type: ReferenceType,
        reference_id: &str,
    ) -> StoreResult<Option<LedgerEntry>> {
        fetch_entry_by_reference(
            &self.pool,
            LedgerKind::User,
            account_id,
            reference_type,
            reference_id,
        )
        .await
    }

    async fn escrow_position(
        &self,
        account_id: &str,
        escrow_type: EscrowType,
        escrow_ref: Option<&str>,
    ) -> StoreResult<EscrowPosition> {
        fetch_escrow_position(&self.pool, account_id, escrow_type, escrow_ref).await
    }

    async fn get_partner(&self, partner_id: &str) -> StoreResult<Option<PartnerWallet>> {
        fetch_partner(&self.pool, partner_id, false).await
    }

    async fn list_partners_due(&self) -> StoreResult<Vec<PartnerWallet>> {
        let sql = format!(
            "SELECT {} FROM partner_wallets p \
             WHERE p.status = 'active' AND p.pending_settlement > 0 \
               AND NOT EXISTS (SELECT 1 FROM settlement_batches b \
                   WHERE b.partner_id = p.partner_id \
                     AND b.status IN ('pending', 'approved', 'processing')) \
             ORDER BY p.partner_id",
            PARTNER_COLUMNS
        );
        let rows = sqlx::query(&sql).fetch_all(&self.pool).await?;
        collect(rows, partner_from_row)
    }

    async fn list_partner_entries(
        &self,
        partner_id: &str,
        limit: i64,
        offset: i64,
    ) -> StoreResult<Vec<LedgerEntry>> {
        let sql = format!(
            "SELECT {} FROM partner_ledger_entries WHERE account_id = $1 \
             ORDER BY created_at DESC LIMIT $2 OFFSET $3",
            ENTRY_COLUMNS
        );
        let rows = sqlx::query(&sql)
            .bind(partner_id)
            .bind(limit)
            .bind(offset)
            .fetch_all(&self.pool)
            .await?;
        collect(rows, entry_from_row)
    }

    async fn get_batch(&self, batch_id: Uuid) -> StoreResult<Option<SettlementBatch>> {
        fetch_batch(&self.pool, batch_id, false).await
    }

    async fn list_batches(&self, filter: &SettlementFilter) -> StoreResult<Vec<SettlementBatch>> {
        let sql = format!(
            "SELECT {} FROM settlement_batches \
             WHERE ($1::TEXT IS NULL OR partner_id = $1) \
               AND ($2::TEXT IS NULL OR status = $2) \
             ORDER BY created_at DESC",
            BATCH_COLUMNS
        );
        let rows = sqlx::query(&sql)
            .bind(filter.partner_id.as_deref())
            .bind(filter.status.map(|s| s.as_str()))
            .fetch_all(&self.pool)
            .await?;
        collect(rows, batch_from_row)
    }

    async fn last_period_end(&self, partner_id: &str) -> StoreResult<Option<DateTime<Utc>>> {
        let end: Option<DateTime<Utc>> = sqlx::query_scalar(
            r#"
            SELECT MAX(period_end)
            FROM settlement_batches
            WHERE partner_id = $1 AND status <> 'cancelled'
            "#,
        )
        .bind(partner_id)
        .fetch_one(&self.pool)
        .await?;
        Ok(end)
    }

    async fn get_payment(&self, payment_id: Uuid) -> StoreResult<Option<PaymentTransaction>> {
        fetch_payment(&self.pool, "payment_id", PaymentKey::Id(payment_id), false).await
    }

    async fn find_payment_by_gateway_ref(
        &self,
        gateway_txn_ref: &str,
    ) -> StoreResult<Option<PaymentTransaction>> {
        fetch_payment(
            &self.pool,
            "gateway_txn_ref",
            PaymentKey::GatewayRef(gateway_txn_ref),
            false,
        )
        .await
    }

    async fn list_payments_for_user(
        &self,
        user_id: &str,
        limit: i64,
    ) -> StoreResult<Vec<PaymentTransaction>> {
        let sql = format!(
            "SELECT {} FROM payment_transactions WHERE user_id = $1 \
             ORDER BY created_at DESC LIMIT $2",
            PAYMENT_COLUMNS
        );
        let rows = sqlx::query(&sql)
            .bind(user_id)
            .bind(limit)
            .fetch_all(&self.pool)
            .await?;
        collect(rows, payment_from_row)
    }

    async fn entry_totals(
        &self,
        kind: LedgerKind,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> StoreResult<Vec<EntryTotal>> {
        let sql = format!(
            "SELECT reference_type, entry_type, COUNT(*) AS count, \
                    COALESCE(SUM(amount), 0) AS amount \
             FROM {} WHERE created_at >= $1 AND created_at < $2 \
             GROUP BY reference_type, entry_type \
             ORDER BY reference_type, entry_type",
            entry_table(kind)
        );
        let rows = sqlx::query(&sql)
            .bind(from)
            .bind(to)
            .fetch_all(&self.pool)
            .await?;
        rows.iter()
            .map(|row| -> StoreResult<EntryTotal> {
                let reference_type: String = row.try_get("reference_type")?;
                let entry_type: String = row.try_get("entry_type")?;
                Ok(EntryTotal {
                    reference_type: decode(
                        ReferenceType::from_str(&reference_type),
                        "reference_type",
                        &reference_type,
                    )?,
                    entry_type: decode(EntryType::from_str(&entry_type), "entry_type", &entry_type)?,
                    count: row.try_get("count")?,
                    amount: row.try_get("amount")?,
                })
            })
            .collect()
    }

    async fn escrow_release_totals(
        &self,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> StoreResult<EscrowReleaseTotals> {
        let row = sqlx::query(
            r#"
            SELECT COUNT(*) AS count,
                   COALESCE(SUM(amount), 0) AS released,
                   COALESCE(SUM(fee), 0) AS fees,
                   COALESCE(SUM(refund_amount), 0) AS refunded
            FROM escrow_releases
            WHERE created_at >= $1 AND created_at < $2
            "#,
        )
        .bind(from)
        .bind(to)
        .fetch_one(&self.pool)
        .await?;
        Ok(EscrowReleaseTotals {
            count: row.try_get("count")?,
            released: row.try_get("released")?,
            fees: row.try_get("fees")?,
            refunded: row.try_get("refunded")?,
        })
    }

    async fn balance_checks(
        &self,
        kind: LedgerKind,
        account_id: Option<&str>,
        only_drifted: bool,
    ) -> StoreResult<Vec<BalanceCheck>> {
        let (projection, id_column) = match kind {
            LedgerKind::User => ("wallet_accounts", "account_id"),
            LedgerKind::Partner => ("partner_wallets", "partner_id"),
        };
        let sql = format!(
            "SELECT a.{id} AS account_id, a.balance AS projected_balance, \
                    COALESCE(SUM(CASE WHEN e.entry_type = 'credit' THEN e.amount \
                                      ELSE -e.amount END), 0) AS ledger_balance \
             FROM {projection} a \
             LEFT JOIN {entries} e ON e.account_id = a.{id} \
             WHERE ($1::TEXT IS NULL OR a.{id} = $1) \
             GROUP BY a.{id}, a.balance \
             HAVING NOT $2 OR a.balance <> COALESCE(SUM(CASE WHEN e.entry_type = 'credit' \
                    THEN e.amount ELSE -e.amount END), 0) \
             ORDER BY a.{id}",
            id = id_column,
            projection = projection,
            entries = entry_table(kind)
        );
        let rows = sqlx::query(&sql)
            .bind(account_id)
            .bind(only_drifted)
            .fetch_all(&self.pool)
            .await?;
        rows.iter()
            .map(|row| -> StoreResult<BalanceCheck> {
                Ok(BalanceCheck {
                    kind,
                    account_id: row.try_get("account_id")?,
                    projected_balance: row.try_get("projected_balance")?,
                    ledger_balance: row.try_get("ledger_balance")?,
                })
            })
            .collect()
    }

    async fn list_audit(
        &self,
        subject_type: Option<&str>,
        subject_id: Option<&str>,
        limit: i64,
    ) -> StoreResult<Vec<AuditRecord>> {
        let sql = format!(
            "SELECT {} FROM audit_log \
             WHERE ($1::TEXT IS NULL OR subject_type = $1) \
               AND ($2::TEXT IS NULL OR subject_id = $2) \
             ORDER BY created_at DESC LIMIT $3",
            AUDIT_COLUMNS
        );
        let rows = sqlx::query(&sql)
            .bind(subject_type)
            .bind(subject_id)
            .bind(limit)
            .fetch_all(&self.pool)
            .await?;
        collect(rows, audit_from_row)
    }
}
