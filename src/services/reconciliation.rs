//! Read-only reconciliation over both entry logs.

use crate::error::{LedgerError, LedgerResult};
use crate::models::{EntryType, ReferenceType};
use crate::store::{BalanceCheck, EntryTotal, LedgerKind, LedgerStore};
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{error, info};

/// Money flows over one period plus every account whose projection drifted
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReconciliationReport {
    pub period_start: DateTime<Utc>,
    pub period_end: DateTime<Utc>,
    pub topups: Decimal,
    pub withdrawals: Decimal,
    pub refunds: Decimal,
    pub escrow_holds: Decimal,
    pub escrow_release_credits: Decimal,
    pub escrow_fees_retained: Decimal,
    pub commissions: Decimal,
    pub settlement_payouts: Decimal,
    /// Credits minus debits of admin balance corrections
    pub corrections_net: Decimal,
    /// `topups - withdrawals`
    pub net_flow: Decimal,
    pub entry_totals: Vec<EntryTotal>,
    pub partner_entry_totals: Vec<EntryTotal>,
    pub user_drift: Vec<BalanceCheck>,
    pub partner_drift: Vec<BalanceCheck>,
    pub generated_at: DateTime<Utc>,
}

impl ReconciliationReport {
    /// True when no account drifted from its entry log
    pub fn is_balanced(&self) -> bool {
        self.user_drift.is_empty() && self.partner_drift.is_empty()
    }
}

fn sum_where(
    totals: &[EntryTotal],
    entry_type: EntryType,
    matches: impl Fn(ReferenceType) -> bool,
) -> Decimal {
    totals
        .iter()
        .filter(|t| t.entry_type == entry_type && matches(t.reference_type))
        .map(|t| t.amount)
        .sum()
}

#[derive(Clone)]
pub struct ReconciliationService {
    store: Arc<dyn LedgerStore>,
}

impl ReconciliationService {
    pub fn new(store: Arc<dyn LedgerStore>) -> Self {
        Self { store }
    }

    /// Sum every flow in `[period_start, period_end)` and list drifted accounts.
    ///
    /// Drift is computed over all time, not just the period: a projection is
    /// either consistent with its whole log or it is not.
    pub async fn reconciliation_report(
        &self,
        period_start: DateTime<Utc>,
        period_end: DateTime<Utc>,
    ) -> LedgerResult<ReconciliationReport> {
        if period_start >= period_end {
            return Err(LedgerError::Validation(
                "period_start must be before period_end".to_string(),
            ));
        }

        let entry_totals = self
            .store
            .entry_totals(LedgerKind::User, period_start, period_end)
            .await?;
        let partner_entry_totals = self
            .store
            .entry_totals(LedgerKind::Partner, period_start, period_end)
            .await?;
        let releases = self
            .store
            .escrow_release_totals(period_start, period_end)
            .await?;
        let user_drift = self.store.balance_checks(LedgerKind::User, None, true).await?;
        let partner_drift = self
            .store
            .balance_checks(LedgerKind::Partner, None, true)
            .await?;

        let topups = sum_where(&entry_totals, EntryType::Credit, |r| r == ReferenceType::Topup);
        let withdrawals = sum_where(&entry_totals, EntryType::Debit, |r| {
            r == ReferenceType::Withdrawal
        });
        let corrections_net = sum_where(&entry_totals, EntryType::Credit, |r| {
            r == ReferenceType::BalanceCorrection
        }) - sum_where(&entry_totals, EntryType::Debit, |r| {
            r == ReferenceType::BalanceCorrection
        });

        let report = ReconciliationReport {
            period_start,
            period_end,
            topups,
            withdrawals,
            refunds: sum_where(&entry_totals, EntryType::Credit, |r| r == ReferenceType::Refund),
            escrow_holds: sum_where(&entry_totals, EntryType::Debit, |r| r.is_escrow_hold()),
            escrow_release_credits: sum_where(&entry_totals, EntryType::Credit, |r| {
                r.is_escrow_release()
            }),
            escrow_fees_retained: releases.fees,
            commissions: sum_where(&partner_entry_totals, EntryType::Credit, |r| {
                r == ReferenceType::Commission
            }),
            settlement_payouts: sum_where(&partner_entry_totals, EntryType::Debit, |r| {
                r == ReferenceType::SettlementPayout
            }),
            corrections_net,
            net_flow: topups - withdrawals,
            entry_totals,
            partner_entry_totals,
            user_drift,
            partner_drift,
            generated_at: Utc::now(),
        };

        if report.is_balanced() {
            info!(
                "Reconciliation {} .. {}: topups {}, withdrawals {}, net {}",
                period_start, period_end, report.topups, report.withdrawals, report.net_flow
            );
        } else {
            error!(
                "Reconciliation found drift: {} user accounts, {} partner accounts",
                report.user_drift.len(),
                report.partner_drift.len()
            );
        }
        Ok(report)
    }

    /// Projection vs. entry log for one user account
    pub async fn verify_account(&self, account_id: &str) -> LedgerResult<BalanceCheck> {
        self.verify(LedgerKind::User, account_id).await
    }

    /// Projection vs. entry log for one partner wallet
    pub async fn verify_partner(&self, partner_id: &str) -> LedgerResult<BalanceCheck> {
        self.verify(LedgerKind::Partner, partner_id).await
    }

    async fn verify(&self, kind: LedgerKind, id: &str) -> LedgerResult<BalanceCheck> {
        let check = self
            .store
            .balance_checks(kind, Some(id), false)
            .await?
            .into_iter()
            .next()
            .ok_or_else(|| LedgerError::AccountNotFound(id.to_string()))?;
        if !check.is_consistent() {
            error!(
                "Balance drift on {}: projected {}, ledger {}",
                id, check.projected_balance, check.ledger_balance
            );
        }
        Ok(check)
    }
}
