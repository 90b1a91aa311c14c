//! In-process ledger store for development and tests.
//!
//! Every transaction holds the single state mutex from `begin` until it is
//! committed or dropped, and works on a private copy of the state. Commit
//! swaps the copy in; drop discards it. Transactions are therefore fully
//! serialized, which satisfies the per-account locking contract trivially.

use super::{
    BalanceCheck, EntryTotal, EscrowReleaseTotals, LedgerKind, LedgerStore, LedgerTx,
};
use crate::error::{StoreError, StoreResult};
use crate::models::{
    AuditRecord, EscrowPosition, EscrowRelease, EscrowType, LedgerEntry,
    PartnerWallet, PaymentStatus, PaymentTransaction, ReferenceType, SettlementBatch,
    SettlementFilter, SettlementStatus, WalletAccount,
};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;
use tokio::sync::{Mutex, OwnedMutexGuard};
use uuid::Uuid;

type ReferenceKey = (String, ReferenceType, String);

#[derive(Debug, Clone, Default)]
struct MemoryState {
    accounts: HashMap<String, WalletAccount>,
    entries: Vec<LedgerEntry>,
    entry_keys: HashSet<ReferenceKey>,
    escrow_releases: Vec<EscrowRelease>,
    partners: HashMap<String, PartnerWallet>,
    partner_entries: Vec<LedgerEntry>,
    partner_entry_keys: HashSet<ReferenceKey>,
    batches: HashMap<Uuid, SettlementBatch>,
    payments: HashMap<Uuid, PaymentTransaction>,
    payment_refs: HashMap<String, Uuid>,
    audit: Vec<AuditRecord>,
}

impl MemoryState {
    fn entries_of(&self, kind: LedgerKind) -> &[LedgerEntry] {
        match kind {
            LedgerKind::User => &self.entries,
            LedgerKind::Partner => &self.partner_entries,
        }
    }

    fn find_reference(
        entries: &[LedgerEntry],
        account_id: &str,
        reference_type: ReferenceType,
        reference_id: &str,
    ) -> Option<LedgerEntry> {
        entries
            .iter()
            .find(|e| {
                e.account_id == account_id
                    && e.reference_type == reference_type
                    && e.reference_id.as_deref() == Some(reference_id)
            })
            .cloned()
    }

    fn escrow_position(
        &self,
        account_id: &str,
        escrow_type: EscrowType,
        escrow_ref: Option<&str>,
    ) -> EscrowPosition {
        let hold_reference = escrow_type.hold_reference();
        let held = self
            .entries
            .iter()
            .filter(|e| e.account_id == account_id && e.reference_type == hold_reference)
            .filter(|e| escrow_ref.map_or(true, |r| e.reference_id.as_deref() == Some(r)))
            .map(|e| e.amount)
            .sum();
        let released = self
            .escrow_releases
            .iter()
            .filter(|r| r.account_id == account_id && r.escrow_type == escrow_type)
            .filter(|r| escrow_ref.map_or(true, |want| r.escrow_ref.as_deref() == Some(want)))
            .map(|r| r.amount)
            .sum();
        EscrowPosition { held, released }
    }
}

/// Newest first, then paginate
fn page(mut entries: Vec<LedgerEntry>, limit: i64, offset: i64) -> Vec<LedgerEntry> {
    // appended in order, so ties on created_at keep the later entry first
    entries.reverse();
    entries.sort_by(|a, b| b.created_at.cmp(&a.created_at));
    entries
        .into_iter()
        .skip(offset.max(0) as usize)
        .take(limit.max(0) as usize)
        .collect()
}

/// Shared in-memory store. Cloning shares the same state.
#[derive(Clone, Default)]
pub struct MemoryLedgerStore {
    state: Arc<Mutex<MemoryState>>,
}

impl MemoryLedgerStore {
    pub fn new() -> Self {
        Self::default()
    }
}

/// Transaction over [`MemoryLedgerStore`]
pub struct MemoryLedgerTx {
    guard: Option<OwnedMutexGuard<MemoryState>>,
    working: MemoryState,
}

impl MemoryLedgerTx {
    fn state(&mut self) -> StoreResult<&mut MemoryState> {
        if self.guard.is_none() {
            return Err(StoreError::TransactionClosed);
        }
        Ok(&mut self.working)
    }
}

#[async_trait]
impl LedgerTx for MemoryLedgerTx {
    async fn lock_account(&mut self, account_id: &str) -> StoreResult<Option<WalletAccount>> {
        Ok(self.state()?.accounts.get(account_id).cloned())
    }

    async fn insert_account(&mut self, account: &WalletAccount) -> StoreResult<bool> {
        let state = self.state()?;
        if state.accounts.contains_key(&account.account_id) {
            return Ok(false);
        }
        state
            .accounts
            .insert(account.account_id.clone(), account.clone());
        Ok(true)
    }

    async fn update_account(&mut self, account: &WalletAccount) -> StoreResult<()> {
        let state = self.state()?;
        match state.accounts.get_mut(&account.account_id) {
            Some(existing) => {
                *existing = account.clone();
                Ok(())
            }
            None => Err(StoreError::ConstraintViolation(format!(
                "wallet account {} does not exist",
                account.account_id
            ))),
        }
    }

    async fn find_entry_by_reference(
        &mut self,
        account_id: &str,
        reference_type: ReferenceType,
        reference_id: &str,
    ) -> StoreResult<Option<LedgerEntry>> {
        let state = self.state()?;
        Ok(MemoryState::find_reference(
            &state.entries,
            account_id,
            reference_type,
            reference_id,
        ))
    }

    async fn insert_entry(&mut self, entry: &LedgerEntry) -> StoreResult<()> {
        let state = self.state()?;
        if !state.accounts.contains_key(&entry.account_id) {
            return Err(StoreError::ConstraintViolation(format!(
                "wallet account {} does not exist",
                entry.account_id
            )));
        }
        if let Some(reference_id) = &entry.reference_id {
            let key = (
                entry.account_id.clone(),
                entry.reference_type,
                reference_id.clone(),
            );
            if !state.entry_keys.insert(key) {
                return Err(StoreError::Duplicate(format!(
                    "ledger entry {}/{} already exists for {}",
                    entry.reference_type.as_str(),
                    reference_id,
                    entry.account_id
                )));
            }
        }
        state.entries.push(entry.clone());
        Ok(())
    }

    async fn sum_entries_since(
        &mut self,
        account_id: &str,
        reference_type: ReferenceType,
        since: DateTime<Utc>,
    ) -> StoreResult<Decimal> {
        let state = self.state()?;
        Ok(state
            .entries
            .iter()
            .filter(|e| {
                e.account_id == account_id
                    && e.reference_type == reference_type
                    && e.created_at >= since
            })
            .map(|e| e.amount)
            .sum())
    }

    async fn escrow_position(
        &mut self,
        account_id: &str,
        escrow_type: EscrowType,
        escrow_ref: Option<&str>,
    ) -> StoreResult<EscrowPosition> {
        Ok(self
            .state()?
            .escrow_position(account_id, escrow_type, escrow_ref))
    }

    async fn find_escrow_release(
        &mut self,
        account_id: &str,
        escrow_type: EscrowType,
        escrow_ref: &str,
    ) -> StoreResult<Option<EscrowRelease>> {
        let state = self.state()?;
        Ok(state
            .escrow_releases
            .iter()
            .find(|r| {
                r.account_id == account_id
                    && r.escrow_type == escrow_type
                    && r.escrow_ref.as_deref() == Some(escrow_ref)
            })
            .cloned())
    }

    async fn insert_escrow_release(&mut self, release: &EscrowRelease) -> StoreResult<()> {
        let state = self.state()?;
        if let Some(escrow_ref) = &release.escrow_ref {
            let duplicate = state.escrow_releases.iter().any(|r| {
                r.account_id == release.account_id
                    && r.escrow_type == release.escrow_type
                    && r.escrow_ref.as_deref() == Some(escrow_ref.as_str())
            });
            if duplicate {
                return Err(StoreError::Duplicate(format!(
                    "escrow {} already released",
                    escrow_ref
                )));
            }
        }
        state.escrow_releases.push(release.clone());
        Ok(())
    }

    async fn lock_partner(&mut self, partner_id: &str) -> StoreResult<Option<PartnerWallet>> {
        Ok(self.state()?.partners.get(partner_id).cloned())
    }

    async fn insert_partner(&mut self, partner: &PartnerWallet) -> StoreResult<bool> {
        let state = self.state()?;
        if state.partners.contains_key(&partner.partner_id) {
            return Ok(false);
        }
        state
            .partners
            .insert(partner.partner_id.clone(), partner.clone());
        Ok(true)
    }

    async fn update_partner(&mut self, partner: &PartnerWallet) -> StoreResult<()> {
        let state = self.state()?;
        match state.partners.get_mut(&partner.partner_id) {
            Some(existing) => {
                *existing = partner.clone();
                Ok(())
            }
            None => Err(StoreError::ConstraintViolation(format!(
                "partner wallet {} does not exist",
                partner.partner_id
            ))),
        }
    }

    async fn find_partner_entry_by_reference(
        &mut self,
        partner_id: &str,
        reference_type: ReferenceType,
        reference_id: &str,
    ) -> StoreResult<Option<LedgerEntry>> {
        let state = self.state()?;
        Ok(MemoryState::find_reference(
            &state.partner_entries,
            partner_id,
            reference_type,
            reference_id,
        ))
    }

    async fn insert_partner_entry(&mut self, entry: &LedgerEntry) -> StoreResult<()> {
        let state = self.state()?;
        if !state.partners.contains_key(&entry.account_id) {
            return Err(StoreError::ConstraintViolation(format!(
                "partner wallet {} does not exist",
                entry.account_id
            )));
        }
        if let Some(reference_id) = &entry.reference_id {
            let key = (
                entry.account_id.clone(),
                entry.reference_type,
                reference_id.clone(),
            );
            if !state.partner_entry_keys.insert(key) {
                return Err(StoreError::Duplicate(format!(
                    "partner entry {}/{} already exists for {}",
                    entry.reference_type.as_str(),
                    reference_id,
                    entry.account_id
                )));
            }
        }
        state.partner_entries.push(entry.clone());
        Ok(())
    }

    async fn count_partner_entries(
        &mut self,
        partner_id: &str,
        reference_type: ReferenceType,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> StoreResult<i64> {
        let state = self.state()?;
        Ok(state
            .partner_entries
            .iter()
            .filter(|e| {
                e.account_id == partner_id
                    && e.reference_type == reference_type
                    && e.created_at >= from
                    && e.created_at < to
            })
            .count() as i64)
    }

    async fn insert_batch(&mut self, batch: &SettlementBatch) -> StoreResult<()> {
        let state = self.state()?;
        if state.batches.contains_key(&batch.batch_id) {
            return Err(StoreError::Duplicate(format!(
                "settlement batch {} already exists",
                batch.batch_id
            )));
        }
        if batch.status.is_open()
            && state
                .batches
                .values()
                .any(|b| b.partner_id == batch.partner_id && b.status.is_open())
        {
            return Err(StoreError::Duplicate(format!(
                "open settlement batch for {}",
                batch.partner_id
            )));
        }
        state.batches.insert(batch.batch_id, batch.clone());
        Ok(())
    }

    async fn lock_batch(&mut self, batch_id: Uuid) -> StoreResult<Option<SettlementBatch>> {
        Ok(self.state()?.batches.get(&batch_id).cloned())
    }

    async fn find_open_batch(&mut self, partner_id: &str) -> StoreResult<Option<SettlementBatch>> {
        let state = self.state()?;
        Ok(state
            .batches
            .values()
            .find(|b| b.partner_id == partner_id && b.status.is_open())
            .cloned())
    }

    async fn update_batch(
        &mut self,
        batch: &SettlementBatch,
        expected: SettlementStatus,
    ) -> StoreResult<bool> {
        let state = self.state()?;
        match state.batches.get_mut(&batch.batch_id) {
            Some(existing) if existing.status == expected => {
                *existing = batch.clone();
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn insert_payment(&mut self, payment: &PaymentTransaction) -> StoreResult<()> {
        let state = self.state()?;
        if state.payment_refs.contains_key(&payment.gateway_txn_ref) {
            return Err(StoreError::Duplicate(format!(
                "gateway reference {} already exists",
                payment.gateway_txn_ref
            )));
        }
        state
            .payment_refs
            .insert(payment.gateway_txn_ref.clone(), payment.payment_id);
        state.payments.insert(payment.payment_id, payment.clone());
        Ok(())
    }

    async fn lock_payment(&mut self, payment_id: Uuid) -> StoreResult<Option<PaymentTransaction>> {
        Ok(self.state()?.payments.get(&payment_id).cloned())
    }

    async fn lock_payment_by_gateway_ref(
        &mut self,
        gateway_txn_ref: &str,
    ) -> StoreResult<Option<PaymentTransaction>> {
        let state = self.state()?;
        Ok(state
            .payment_refs
            .get(gateway_txn_ref)
            .and_then(|id| state.payments.get(id))
            .cloned())
    }

    async fn update_payment(
        &mut self,
        payment: &PaymentTransaction,
        expected: PaymentStatus,
    ) -> StoreResult<bool> {
        let state = self.state()?;
        match state.payments.get_mut(&payment.payment_id) {
            Some(existing) if existing.status == expected => {
                *existing = payment.clone();
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn insert_audit(&mut self, record: &AuditRecord) -> StoreResult<()> {
        self.state()?.audit.push(record.clone());
        Ok(())
    }

    async fn commit(&mut self) -> StoreResult<()> {
        let mut guard = self.guard.take().ok_or(StoreError::TransactionClosed)?;
        *guard = std::mem::take(&mut self.working);
        Ok(())
    }
}

#[async_trait]
impl LedgerStore for MemoryLedgerStore {
    async fn begin(&self) -> StoreResult<Box<dyn LedgerTx>> {
        let guard = self.state.clone().lock_owned().await;
        let working = MemoryState::clone(&guard);
        Ok(Box::new(MemoryLedgerTx {
            guard: Some(guard),
            working,
        }))
    }

    async fn get_account(&self, account_id: &str) -> StoreResult<Option<WalletAccount>> {
        Ok(self.state.lock().await.accounts.get(account_id).cloned())
    }

    async fn list_entries(
        &self,
        account_id: &str,
        limit: i64,
        offset: i64,
    ) -> StoreResult<Vec<LedgerEntry>> {
        let state = self.state.lock().await;
        let entries = state
            .entries
            .iter()
            .filter(|e| e.account_id == account_id)
            .cloned()
            .collect();
        Ok(page(entries, limit, offset))
    }

    async fn find_entry_by_reference(
        &self,
        account_id: &str,
        reference_type: ReferenceType,
        reference_id: &str,
    ) -> StoreResult<Option<LedgerEntry>> {
        let state = self.state.lock().await;
        Ok(MemoryState::find_reference(
            &state.entries,
            account_id,
            reference_type,
            reference_id,
        ))
    }

    async fn escrow_position(
        &self,
        account_id: &str,
        escrow_type: EscrowType,
        escrow_ref: Option<&str>,
    ) -> StoreResult<EscrowPosition> {
        let state = self.state.lock().await;
        Ok(state.escrow_position(account_id, escrow_type, escrow_ref))
    }

    async fn get_partner(&self, partner_id: &str) -> StoreResult<Option<PartnerWallet>> {
        Ok(self.state.lock().await.partners.get(partner_id).cloned())
    }

    async fn list_partners_due(&self) -> StoreResult<Vec<PartnerWallet>> {
        let state = self.state.lock().await;
        let mut due: Vec<PartnerWallet> = state
            .partners
            .values()
            .filter(|p| p.is_active() && p.pending_settlement > Decimal::ZERO)
            .filter(|p| {
                !state
                    .batches
                    .values()
                    .any(|b| b.partner_id == p.partner_id && b.status.is_open())
            })
            .cloned()
            .collect();
        due.sort_by(|a, b| a.partner_id.cmp(&b.partner_id));
        Ok(due)
    }

    async fn list_partner_entries(
        &self,
        partner_id: &str,
        limit: i64,
        offset: i64,
    ) -> StoreResult<Vec<LedgerEntry>> {
        let state = self.state.lock().await;
        let entries = state
            .partner_entries
            .iter()
            .filter(|e| e.account_id == partner_id)
            .cloned()
            .collect();
        Ok(page(entries, limit, offset))
    }

    async fn get_batch(&self, batch_id: Uuid) -> StoreResult<Option<SettlementBatch>> {
        Ok(self.state.lock().await.batches.get(&batch_id).cloned())
    }

    async fn list_batches(&self, filter: &SettlementFilter) -> StoreResult<Vec<SettlementBatch>> {
        let state = self.state.lock().await;
        let mut batches: Vec<SettlementBatch> = state
            .batches
            .values()
            .filter(|b| {
                filter
                    .partner_id
                    .as_deref()
                    .map_or(true, |p| b.partner_id == p)
            })
            .filter(|b| filter.status.map_or(true, |s| b.status == s))
            .cloned()
            .collect();
        batches.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(batches)
    }

    async fn last_period_end(&self, partner_id: &str) -> StoreResult<Option<DateTime<Utc>>> {
        let state = self.state.lock().await;
        Ok(state
            .batches
            .values()
            .filter(|b| b.partner_id == partner_id && b.status != SettlementStatus::Cancelled)
            .map(|b| b.period_end)
            .max())
    }

    async fn get_payment(&self, payment_id: Uuid) -> StoreResult<Option<PaymentTransaction>> {
        Ok(self.state.lock().await.payments.get(&payment_id).cloned())
    }

    async fn find_payment_by_gateway_ref(
        &self,
        gateway_txn_ref: &str,
    ) -> StoreResult<Option<PaymentTransaction>> {
        let state = self.state.lock().await;
        Ok(state
            .payment_refs
            .get(gateway_txn_ref)
            .and_then(|id| state.payments.get(id))
            .cloned())
    }

    async fn list_payments_for_user(
        &self,
        user_id: &str,
        limit: i64,
    ) -> StoreResult<Vec<PaymentTransaction>> {
        let state = self.state.lock().await;
        let mut payments: Vec<PaymentTransaction> = state
            .payments
            .values()
            .filter(|p| p.user_id == user_id)
            .cloned()
            .collect();
        payments.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        payments.truncate(limit.max(0) as usize);
        Ok(payments)
    }

    async fn entry_totals(
        &self,
        kind: LedgerKind,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> StoreResult<Vec<EntryTotal>> {
        let state = self.state.lock().await;
        let mut totals: BTreeMap<(&'static str, &'static str), EntryTotal> = BTreeMap::new();
        for entry in state
            .entries_of(kind)
            .iter()
            .filter(|e| e.created_at >= from && e.created_at < to)
        {
            let total = totals
                .entry((entry.reference_type.as_str(), entry.entry_type.as_str()))
                .or_insert_with(|| EntryTotal {
                    reference_type: entry.reference_type,
                    entry_type: entry.entry_type,
                    count: 0,
                    amount: Decimal::ZERO,
                });
            total.count += 1;
            total.amount += entry.amount;
        }
        Ok(totals.into_values().collect())
    }

    async fn escrow_release_totals(
        &self,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> StoreResult<EscrowReleaseTotals> {
        let state = self.state.lock().await;
        Ok(state
            .escrow_releases
            .iter()
            .filter(|r| r.created_at >= from && r.created_at < to)
            .fold(EscrowReleaseTotals::default(), |mut acc, r| {
                acc.count += 1;
                acc.released += r.amount;
                acc.fees += r.fee;
                acc.refunded += r.refund_amount;
                acc
            }))
    }

    async fn balance_checks(
        &self,
        kind: LedgerKind,
        account_id: Option<&str>,
        only_drifted: bool,
    ) -> StoreResult<Vec<BalanceCheck>> {
        let state = self.state.lock().await;
        let projections: Vec<(String, Decimal)> = match kind {
            LedgerKind::User => state
                .accounts
                .values()
                .map(|a| (a.account_id.clone(), a.balance))
                .collect(),
            LedgerKind::Partner => state
                .partners
                .values()
                .map(|p| (p.partner_id.clone(), p.balance))
                .collect(),
        };

        let mut ledger_sums: HashMap<&str, Decimal> = HashMap::new();
        for entry in state.entries_of(kind) {
            *ledger_sums.entry(entry.account_id.as_str()).or_default() +=
                entry.entry_type.signed(entry.amount);
        }

        let mut checks: Vec<BalanceCheck> = projections
            .into_iter()
            .filter(|(id, _)| account_id.map_or(true, |want| id == want))
            .map(|(id, projected)| {
                let ledger_balance = ledger_sums.get(id.as_str()).copied().unwrap_or_default();
                BalanceCheck {
                    kind,
                    account_id: id,
                    projected_balance: projected,
                    ledger_balance,
                }
            })
            .filter(|c| !only_drifted || !c.is_consistent())
            .collect();
        checks.sort_by(|a, b| a.account_id.cmp(&b.account_id));
        Ok(checks)
    }

    async fn list_audit(
        &self,
        subject_type: Option<&str>,
        subject_id: Option<&str>,
        limit: i64,
    ) -> StoreResult<Vec<AuditRecord>> {
        let state = self.state.lock().await;
        let mut records: Vec<AuditRecord> = state
            .audit
            .iter()
            .filter(|r| subject_type.map_or(true, |t| r.subject_type == t))
            .filter(|r| subject_id.map_or(true, |id| r.subject_id == id))
            .cloned()
            .collect();
        records.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        records.truncate(limit.max(0) as usize);
        Ok(records)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{NewEntry, WithdrawalLimits};

    fn limits() -> WithdrawalLimits {
        WithdrawalLimits {
            daily: Decimal::new(1_000, 0),
            monthly: Decimal::new(10_000, 0),
        }
    }

    #[tokio::test]
    async fn test_dropped_transaction_rolls_back() {
        let store = MemoryLedgerStore::new();
        {
            let mut tx = store.begin().await.unwrap();
            tx.insert_account(&WalletAccount::new("u1", limits())).await.unwrap();
            // dropped without commit
        }
        assert!(store.get_account("u1").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_commit_publishes_changes() {
        let store = MemoryLedgerStore::new();
        let mut tx = store.begin().await.unwrap();
        tx.insert_account(&WalletAccount::new("u1", limits())).await.unwrap();
        tx.commit().await.unwrap();
        drop(tx);
        assert!(store.get_account("u1").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_reference_uniqueness_is_enforced_on_insert() {
        let store = MemoryLedgerStore::new();
        let mut tx = store.begin().await.unwrap();
        tx.insert_account(&WalletAccount::new("u1", limits())).await.unwrap();
        let request = NewEntry::credit("u1", Decimal::new(10, 0), ReferenceType::Topup)
            .with_reference("pay-1");
        tx.insert_entry(&request.to_entry(Decimal::ZERO, Utc::now()))
            .await
            .unwrap();
        let second = tx
            .insert_entry(&request.to_entry(Decimal::new(10, 0), Utc::now()))
            .await;
        assert!(matches!(second, Err(StoreError::Duplicate(_))));
    }

    #[tokio::test]
    async fn test_use_after_commit_is_rejected() {
        let store = MemoryLedgerStore::new();
        let mut tx = store.begin().await.unwrap();
        tx.commit().await.unwrap();
        assert!(matches!(
            tx.lock_account("u1").await,
            Err(StoreError::TransactionClosed)
        ));
    }
}
