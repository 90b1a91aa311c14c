//! Escrow holds and releases for cup deposits, e-bike deposits and
//! transport prepayments.
//!
//! A hold is a debit tagged with the escrow type's hold reference. A release
//! records the gross amount leaving escrow and credits back `amount - fee`.

use crate::config::{LedgerConfig, PenaltyPolicy};
use crate::error::{LedgerError, LedgerResult, StoreError};
use crate::models::money::{validate_amount, validate_non_negative};
use crate::models::{
    Actor, EscrowHoldReceipt, EscrowPosition, EscrowRelease, EscrowReleaseReceipt, EscrowType,
    LedgerEntry, NewEntry, PostedEntry,
};
use crate::notifications::LedgerEvents;
use crate::services::ledger::post_entry_in;
use crate::services::AuditTrailService;
use crate::store::LedgerStore;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{debug, info};
use uuid::Uuid;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HoldRequest {
    pub account_id: String,
    pub escrow_type: EscrowType,
    pub amount: Decimal,
    /// Cup id, rental id or ticket id the deposit belongs to
    #[serde(default)]
    pub escrow_ref: Option<String>,
    #[serde(default)]
    pub initiated_by: Actor,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReleaseRequest {
    pub account_id: String,
    pub escrow_type: EscrowType,
    /// Gross amount leaving escrow
    pub amount: Decimal,
    /// Kept by the platform, `0 <= fee <= amount`
    #[serde(default)]
    pub fee: Decimal,
    #[serde(default)]
    pub escrow_ref: Option<String>,
    #[serde(default)]
    pub initiated_by: Actor,
}

/// Release priced by the late-return penalty policy
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReturnRequest {
    pub account_id: String,
    pub escrow_type: EscrowType,
    pub amount: Decimal,
    #[serde(default)]
    pub escrow_ref: Option<String>,
    pub due_at: DateTime<Utc>,
    pub returned_at: DateTime<Utc>,
    #[serde(default)]
    pub initiated_by: Actor,
}

/// Late-return fee: every started hour past `due_at + grace` costs
/// `per_hour`, capped at the deposit amount.
pub fn penalty_fee(
    policy: &PenaltyPolicy,
    amount: Decimal,
    due_at: DateTime<Utc>,
    returned_at: DateTime<Utc>,
) -> Decimal {
    let late_secs = (returned_at - due_at).num_seconds() - policy.grace_minutes * 60;
    if late_secs <= 0 {
        return Decimal::ZERO;
    }
    let hours = (late_secs + 3_599) / 3_600;
    let fee = policy.per_hour * Decimal::from(hours);
    fee.min(amount)
}

#[derive(Clone)]
pub struct EscrowService {
    store: Arc<dyn LedgerStore>,
    config: Arc<LedgerConfig>,
    events: LedgerEvents,
    audit: AuditTrailService,
}

impl EscrowService {
    pub fn new(
        store: Arc<dyn LedgerStore>,
        config: Arc<LedgerConfig>,
        events: LedgerEvents,
        audit: AuditTrailService,
    ) -> Self {
        Self {
            store,
            config,
            events,
            audit,
        }
    }

    /// Move `amount` from spendable balance into escrow
    pub async fn hold_escrow(&self, request: HoldRequest) -> LedgerResult<EscrowHoldReceipt> {
        let mut entry = NewEntry::debit(
            &request.account_id,
            request.amount,
            request.escrow_type.hold_reference(),
        )
        .with_metadata(serde_json::json!({ "escrow_type": request.escrow_type }))
        .initiated_by(request.initiated_by.clone());
        if let Some(escrow_ref) = &request.escrow_ref {
            entry = entry.with_reference(escrow_ref);
        }

        let posted = match self.hold_once(&entry).await {
            Err(LedgerError::DuplicateReference { .. }) => self.find_replayed_hold(&entry).await?,
            other => other?,
        };

        if !posted.replayed {
            info!(
                "Held {} {} from {} ({:?})",
                request.amount,
                request.escrow_type.as_str(),
                request.account_id,
                request.escrow_ref
            );
            self.events.entry_posted(&posted.entry);
            self.audit
                .record(
                    "escrow_held",
                    &request.initiated_by,
                    "wallet_account",
                    &request.account_id,
                    serde_json::json!({
                        "escrow_type": request.escrow_type,
                        "escrow_ref": request.escrow_ref,
                        "amount": request.amount,
                        "ledger_id": posted.ledger_id(),
                    }),
                )
                .await;
        }

        Ok(EscrowHoldReceipt {
            ledger_id: posted.ledger_id(),
            balance_after: posted.balance_after(),
            replayed: posted.replayed,
        })
    }

    async fn hold_once(&self, entry: &NewEntry) -> LedgerResult<PostedEntry> {
        let mut tx = self.store.begin().await?;
        let posted = post_entry_in(tx.as_mut(), &self.config, entry).await?;
        tx.commit().await?;
        Ok(posted)
    }

    async fn find_replayed_hold(&self, entry: &NewEntry) -> LedgerResult<PostedEntry> {
        let reference_id = entry.reference_id.as_deref().unwrap_or_default();
        self.store
            .find_entry_by_reference(&entry.account_id, entry.reference_type, reference_id)
            .await?
            .map(PostedEntry::replayed)
            .ok_or_else(|| LedgerError::DuplicateReference {
                account_id: entry.account_id.clone(),
                reference_type: entry.reference_type.as_str().to_string(),
                reference_id: reference_id.to_string(),
            })
    }

    /// Release escrowed funds, refunding `amount - fee` to the wallet
    pub async fn release_escrow(&self, request: ReleaseRequest) -> LedgerResult<EscrowReleaseReceipt> {
        let scale = self.config.currency_scale;
        validate_amount(request.amount, scale)?;
        validate_non_negative(request.fee, scale, "fee")?;
        if request.fee > request.amount {
            return Err(LedgerError::InvalidAmount(format!(
                "fee {} exceeds released amount {}",
                request.fee, request.amount
            )));
        }

        let (receipt, refund_entry) = match self.release_once(&request).await {
            Err(LedgerError::DuplicateReference { .. }) => (self.replayed_release(&request).await?, None),
            other => other?,
        };

        if receipt.replayed {
            debug!("Replayed escrow release {:?} on {}", request.escrow_ref, request.account_id);
            return Ok(receipt);
        }

        info!(
            "Released {} {} to {} (fee {}, refund {})",
            request.amount,
            request.escrow_type.as_str(),
            request.account_id,
            receipt.fee,
            receipt.refund_amount
        );
        if let Some(entry) = &refund_entry {
            self.events.entry_posted(entry);
        }
        self.audit
            .record(
                "escrow_released",
                &request.initiated_by,
                "wallet_account",
                &request.account_id,
                serde_json::json!({
                    "release_id": receipt.release_id,
                    "escrow_type": request.escrow_type,
                    "escrow_ref": request.escrow_ref,
                    "amount": request.amount,
                    "fee": receipt.fee,
                    "refund_amount": receipt.refund_amount,
                }),
            )
            .await;
        Ok(receipt)
    }

    async fn release_once(
        &self,
        request: &ReleaseRequest,
    ) -> LedgerResult<(EscrowReleaseReceipt, Option<LedgerEntry>)> {
        let mut tx = self.store.begin().await?;
        let account = tx
            .lock_account(&request.account_id)
            .await?
            .ok_or_else(|| LedgerError::AccountNotFound(request.account_id.clone()))?;

        if let Some(escrow_ref) = &request.escrow_ref {
            if let Some(existing) = tx
                .find_escrow_release(&account.account_id, request.escrow_type, escrow_ref)
                .await?
            {
                let balance_after = match existing.ledger_id {
                    Some(_) => tx
                        .find_entry_by_reference(
                            &account.account_id,
                            request.escrow_type.release_reference(),
                            escrow_ref,
                        )
                        .await?
                        .map(|e| e.balance_after)
                        .unwrap_or(account.balance),
                    None => account.balance,
                };
                return Ok((receipt_for(&existing, balance_after, true), None));
            }
        }

        // unreferenced releases draw on every hold of the type, so a
        // referenced release must fit both its own and the type-wide balance
        let mut positions = vec![
            tx.escrow_position(&account.account_id, request.escrow_type, None)
                .await?,
        ];
        if let Some(escrow_ref) = &request.escrow_ref {
            positions.push(
                tx.escrow_position(&account.account_id, request.escrow_type, Some(escrow_ref))
                    .await?,
            );
        }
        if let Some(short) = positions.iter().find(|p| request.amount > p.outstanding()) {
            return Err(LedgerError::EscrowOverRelease {
                account_id: account.account_id,
                held: short.held,
                released: short.released,
                requested: request.amount,
            });
        }

        let refund_amount = request.amount - request.fee;
        let mut balance_after = account.balance;
        let mut refund_entry = None;
        if refund_amount > Decimal::ZERO {
            let mut credit = NewEntry::credit(
                &account.account_id,
                refund_amount,
                request.escrow_type.release_reference(),
            )
            .with_metadata(serde_json::json!({
                "escrow_type": request.escrow_type,
                "escrow_amount": request.amount,
                "fee": request.fee,
            }))
            .initiated_by(request.initiated_by.clone());
            if let Some(escrow_ref) = &request.escrow_ref {
                credit = credit.with_reference(escrow_ref);
            }
            let posted = post_entry_in(tx.as_mut(), &self.config, &credit).await?;
            balance_after = posted.balance_after();
            refund_entry = Some(posted.entry);
        }

        let release = EscrowRelease {
            release_id: Uuid::new_v4(),
            account_id: account.account_id.clone(),
            escrow_type: request.escrow_type,
            escrow_ref: request.escrow_ref.clone(),
            amount: request.amount,
            fee: request.fee,
            refund_amount,
            ledger_id: refund_entry.as_ref().map(|e| e.ledger_id),
            created_at: Utc::now(),
        };
        tx.insert_escrow_release(&release).await.map_err(|e| match e {
            StoreError::Duplicate(_) => LedgerError::DuplicateReference {
                account_id: release.account_id.clone(),
                reference_type: request.escrow_type.release_reference().as_str().to_string(),
                reference_id: release.escrow_ref.clone().unwrap_or_default(),
            },
            other => LedgerError::Store(other),
        })?;
        tx.commit().await?;

        Ok((receipt_for(&release, balance_after, false), refund_entry))
    }

    async fn replayed_release(&self, request: &ReleaseRequest) -> LedgerResult<EscrowReleaseReceipt> {
        // the winning release committed, so a fresh attempt replays it
        match self.release_once(request).await? {
            (receipt, _) if receipt.replayed => Ok(receipt),
            _ => Err(LedgerError::DuplicateReference {
                account_id: request.account_id.clone(),
                reference_type: request.escrow_type.release_reference().as_str().to_string(),
                reference_id: request.escrow_ref.clone().unwrap_or_default(),
            }),
        }
    }

    /// Release a deposit on return, pricing the fee with the penalty policy
    pub async fn release_on_return(&self, request: ReturnRequest) -> LedgerResult<EscrowReleaseReceipt> {
        let fee = penalty_fee(
            &self.config.penalty,
            request.amount,
            request.due_at,
            request.returned_at,
        );
        self.release_escrow(ReleaseRequest {
            account_id: request.account_id,
            escrow_type: request.escrow_type,
            amount: request.amount,
            fee,
            escrow_ref: request.escrow_ref,
            initiated_by: request.initiated_by,
        })
        .await
    }

    pub async fn escrow_position(
        &self,
        account_id: &str,
        escrow_type: EscrowType,
        escrow_ref: Option<&str>,
    ) -> LedgerResult<EscrowPosition> {
        Ok(self
            .store
            .escrow_position(account_id, escrow_type, escrow_ref)
            .await?)
    }
}

fn receipt_for(release: &EscrowRelease, balance_after: Decimal, replayed: bool) -> EscrowReleaseReceipt {
    EscrowReleaseReceipt {
        release_id: release.release_id,
        refund_amount: release.refund_amount,
        fee: release.fee,
        ledger_id: release.ledger_id,
        balance_after,
        replayed,
    }
}
