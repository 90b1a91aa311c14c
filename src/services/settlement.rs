//! Partner settlement batches: snapshot pending commission, approve, pay out.
//!
//! Every transition is a conditional write on the status the batch was read
//! in, so a lost race surfaces as `InvalidStateTransition` and changes nothing.

use crate::config::LedgerConfig;
use crate::error::{LedgerError, LedgerResult, StoreError};
use crate::models::{
    split_commission, Actor, NewEntry, PartnerWallet, ReferenceType, SettlementBatch,
    SettlementFilter, SettlementStatus,
};
use crate::notifications::{LedgerEvent, LedgerEvents};
use crate::services::ledger::require_admin;
use crate::services::partner::post_partner_entry_in;
use crate::services::AuditTrailService;
use crate::store::{LedgerStore, LedgerTx};
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use std::sync::Arc;
use tracing::{error, info, warn};
use uuid::Uuid;

/// Validate a batch transition and build the next row
fn transition(batch: &SettlementBatch, next: SettlementStatus) -> LedgerResult<SettlementBatch> {
    if !batch.status.can_transition_to(next) {
        return Err(invalid_transition(batch, next));
    }
    Ok(batch.with_status(next))
}

fn invalid_transition(batch: &SettlementBatch, next: SettlementStatus) -> LedgerError {
    LedgerError::InvalidStateTransition {
        entity: "settlement_batch",
        id: batch.batch_id,
        from: batch.status.as_str().to_string(),
        to: next.as_str().to_string(),
    }
}

async fn lock_batch(tx: &mut dyn LedgerTx, batch_id: Uuid) -> LedgerResult<SettlementBatch> {
    tx.lock_batch(batch_id)
        .await?
        .ok_or_else(|| LedgerError::NotFound(format!("settlement batch {}", batch_id)))
}

/// Conditional write guarded by the status the batch was read in
async fn write_transition(
    tx: &mut dyn LedgerTx,
    current: &SettlementBatch,
    next: &SettlementBatch,
) -> LedgerResult<()> {
    if !tx.update_batch(next, current.status).await? {
        return Err(invalid_transition(current, next.status));
    }
    Ok(())
}

/// Settlement batch processor: snapshots partner pending settlement into a
/// batch and walks it through approval and payout.
#[derive(Clone)]
pub struct SettlementService {
    store: Arc<dyn LedgerStore>,
    config: Arc<LedgerConfig>,
    events: LedgerEvents,
    audit: AuditTrailService,
}

impl SettlementService {
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

    /// Snapshot the partner's pending settlement into a new pending batch
    pub async fn create_settlement_batch(
        &self,
        partner_id: &str,
        period_start: DateTime<Utc>,
        period_end: DateTime<Utc>,
        actor: &Actor,
    ) -> LedgerResult<SettlementBatch> {
        if period_start >= period_end {
            return Err(LedgerError::Validation(
                "period_start must be before period_end".to_string(),
            ));
        }

        let mut tx = self.store.begin().await?;
        // the partner row lock serializes batch creation per partner
        let partner = tx
            .lock_partner(partner_id)
            .await?
            .ok_or_else(|| LedgerError::AccountNotFound(partner_id.to_string()))?;
        if !partner.is_active() {
            return Err(LedgerError::Validation(format!(
                "partner {} is {}",
                partner_id,
                partner.status.as_str()
            )));
        }
        if partner.pending_settlement <= Decimal::ZERO {
            return Err(LedgerError::NothingToSettle(partner_id.to_string()));
        }
        if let Some(open) = tx.find_open_batch(partner_id).await? {
            return Err(LedgerError::SettlementInProgress {
                partner_id: partner_id.to_string(),
                batch_id: open.batch_id,
            });
        }

        let total_transactions = tx
            .count_partner_entries(partner_id, ReferenceType::Commission, period_start, period_end)
            .await?;
        let gross_amount = partner.pending_settlement;
        let (commission_amount, net_amount) =
            split_commission(gross_amount, partner.commission_rate, self.config.currency_scale);
        let now = Utc::now();
        let batch = SettlementBatch {
            batch_id: Uuid::new_v4(),
            partner_id: partner_id.to_string(),
            period_start,
            period_end,
            total_transactions,
            gross_amount,
            commission_rate: partner.commission_rate,
            commission_amount,
            net_amount,
            status: SettlementStatus::Pending,
            approved_by: None,
            approved_at: None,
            paid_at: None,
            payment_reference: None,
            failure_reason: None,
            created_at: now,
            updated_at: now,
        };
        if let Err(e) = tx.insert_batch(&batch).await {
            drop(tx);
            return Err(match e {
                StoreError::Duplicate(_) => self.open_batch_conflict(partner_id).await,
                other => LedgerError::Store(other),
            });
        }
        tx.commit().await?;

        info!(
            "Created settlement batch {} for {}: gross {}, commission {}, net {}",
            batch.batch_id, partner_id, gross_amount, commission_amount, net_amount
        );
        self.status_changed(&batch, actor, "settlement_created", serde_json::json!({
            "gross_amount": gross_amount,
            "commission_amount": commission_amount,
            "net_amount": net_amount,
            "total_transactions": total_transactions,
        }))
        .await;
        Ok(batch)
    }

    /// A concurrent creator won the open-batch index; report its batch
    async fn open_batch_conflict(&self, partner_id: &str) -> LedgerError {
        let filter = SettlementFilter {
            partner_id: Some(partner_id.to_string()),
            status: None,
        };
        match self.store.list_batches(&filter).await {
            Ok(batches) => match batches.into_iter().find(|b| b.status.is_open()) {
                Some(open) => LedgerError::SettlementInProgress {
                    partner_id: partner_id.to_string(),
                    batch_id: open.batch_id,
                },
                None => LedgerError::Store(StoreError::Duplicate(format!(
                    "open settlement batch for {}",
                    partner_id
                ))),
            },
            Err(e) => LedgerError::Store(e),
        }
    }

    /// `pending -> approved`, admin only
    pub async fn approve_settlement(&self, batch_id: Uuid, admin: &Actor) -> LedgerResult<SettlementBatch> {
        let admin_id = require_admin(&self.config, admin)?;

        let mut tx = self.store.begin().await?;
        let current = lock_batch(tx.as_mut(), batch_id).await?;
        let mut next = transition(&current, SettlementStatus::Approved)?;
        next.approved_by = Some(admin_id.to_string());
        next.approved_at = Some(next.updated_at);
        write_transition(tx.as_mut(), &current, &next).await?;
        tx.commit().await?;

        info!("Settlement batch {} approved by {}", batch_id, admin_id);
        self.status_changed(&next, admin, "settlement_approved", serde_json::json!({}))
            .await;
        Ok(next)
    }

    /// Pay out an approved batch.
    ///
    /// The batch is moved to `processing` with `payment_reference` recorded
    /// and committed first. The partner debit of `net_amount` and the move to
    /// `paid` then commit together. A business failure in that second step
    /// marks the batch `failed`. A store error leaves it in `processing`,
    /// where only [`Self::resume_settlement_payout`] can finish it.
    pub async fn process_settlement_payout(
        &self,
        batch_id: Uuid,
        payment_reference: &str,
        actor: &Actor,
    ) -> LedgerResult<SettlementBatch> {
        if payment_reference.trim().is_empty() {
            return Err(LedgerError::Validation(
                "payment_reference must not be empty".to_string(),
            ));
        }

        let processing = self.begin_processing(batch_id, payment_reference, actor).await?;
        self.finish_payout(&processing, payment_reference, actor).await
    }

    /// Finish a payout left in `processing`, admin only.
    ///
    /// `payment_reference` must be the one recorded when processing began.
    /// The payout entry is keyed on the batch id, so a debit that already
    /// landed is replayed rather than posted twice.
    pub async fn resume_settlement_payout(
        &self,
        batch_id: Uuid,
        payment_reference: &str,
        admin: &Actor,
    ) -> LedgerResult<SettlementBatch> {
        require_admin(&self.config, admin)?;

        let current = self.get_settlement_batch(batch_id).await?;
        if current.status != SettlementStatus::Processing {
            return Err(invalid_transition(&current, SettlementStatus::Paid));
        }
        if current.payment_reference.as_deref() != Some(payment_reference) {
            return Err(LedgerError::ExternalReferenceMismatch(format!(
                "settlement batch {} is being paid under {:?}, not {}",
                batch_id, current.payment_reference, payment_reference
            )));
        }

        warn!("Resuming payout of settlement batch {}", batch_id);
        self.finish_payout(&current, payment_reference, admin).await
    }

    async fn finish_payout(
        &self,
        processing: &SettlementBatch,
        payment_reference: &str,
        actor: &Actor,
    ) -> LedgerResult<SettlementBatch> {
        let batch_id = processing.batch_id;
        match self.pay_out(processing, payment_reference).await {
            Ok(paid) => {
                info!(
                    "Settlement batch {} paid: {} to {} ({})",
                    batch_id, paid.net_amount, paid.partner_id, payment_reference
                );
                self.status_changed(&paid, actor, "settlement_paid", serde_json::json!({
                    "net_amount": paid.net_amount,
                    "payment_reference": payment_reference,
                }))
                .await;
                Ok(paid)
            }
            Err(LedgerError::Store(e)) => {
                error!(
                    "Settlement batch {} payout interrupted, left in processing: {}",
                    batch_id, e
                );
                Err(LedgerError::Store(e))
            }
            Err(e @ LedgerError::InvalidStateTransition { .. }) => Err(e),
            Err(e) => {
                warn!("Settlement batch {} payout failed: {}", batch_id, e);
                if let Err(mark_err) = self.fail_settlement(batch_id, &e.to_string(), actor).await {
                    error!("Could not mark settlement batch {} failed: {}", batch_id, mark_err);
                }
                Err(e)
            }
        }
    }

    async fn begin_processing(
        &self,
        batch_id: Uuid,
        payment_reference: &str,
        actor: &Actor,
    ) -> LedgerResult<SettlementBatch> {
        let mut tx = self.store.begin().await?;
        let current = lock_batch(tx.as_mut(), batch_id).await?;
        let mut next = transition(&current, SettlementStatus::Processing)?;
        next.payment_reference = Some(payment_reference.to_string());
        write_transition(tx.as_mut(), &current, &next).await?;
        tx.commit().await?;

        self.status_changed(&next, actor, "settlement_processing", serde_json::json!({
            "payment_reference": payment_reference,
        }))
        .await;
        Ok(next)
    }

    async fn pay_out(&self, processing: &SettlementBatch, payment_reference: &str) -> LedgerResult<SettlementBatch> {
        let mut tx = self.store.begin().await?;
        let current = lock_batch(tx.as_mut(), processing.batch_id).await?;
        let mut next = transition(&current, SettlementStatus::Paid)?;

        let gross = current.gross_amount;
        let reduce_pending = move |partner: &mut PartnerWallet| {
            partner.pending_settlement = (partner.pending_settlement - gross).max(Decimal::ZERO);
        };

        if current.net_amount > Decimal::ZERO {
            let payout = NewEntry::debit(&current.partner_id, current.net_amount, ReferenceType::SettlementPayout)
                .with_reference(current.batch_id.to_string())
                .with_description(format!("Settlement payout {}", payment_reference))
                .with_metadata(serde_json::json!({
                    "gross_amount": current.gross_amount,
                    "commission_amount": current.commission_amount,
                    "payment_reference": payment_reference,
                }));
            post_partner_entry_in(tx.as_mut(), &self.config, &payout, reduce_pending).await?;
        } else {
            // fully withheld: nothing to pay, only clear the pending amount
            let mut partner = tx
                .lock_partner(&current.partner_id)
                .await?
                .ok_or_else(|| LedgerError::AccountNotFound(current.partner_id.clone()))?;
            reduce_pending(&mut partner);
            partner.updated_at = Utc::now();
            tx.update_partner(&partner).await?;
        }

        next.paid_at = Some(next.updated_at);
        next.payment_reference = Some(payment_reference.to_string());
        write_transition(tx.as_mut(), &current, &next).await?;
        tx.commit().await?;
        Ok(next)
    }

    /// `pending|approved -> cancelled`, admin only
    pub async fn cancel_settlement(
        &self,
        batch_id: Uuid,
        admin: &Actor,
        reason: &str,
    ) -> LedgerResult<SettlementBatch> {
        require_admin(&self.config, admin)?;

        let mut tx = self.store.begin().await?;
        let current = lock_batch(tx.as_mut(), batch_id).await?;
        let mut next = transition(&current, SettlementStatus::Cancelled)?;
        next.failure_reason = Some(reason.to_string());
        write_transition(tx.as_mut(), &current, &next).await?;
        tx.commit().await?;

        info!("Settlement batch {} cancelled by {}: {}", batch_id, admin, reason);
        self.status_changed(&next, admin, "settlement_cancelled", serde_json::json!({ "reason": reason }))
            .await;
        Ok(next)
    }

    /// `processing -> failed`
    pub async fn fail_settlement(
        &self,
        batch_id: Uuid,
        reason: &str,
        actor: &Actor,
    ) -> LedgerResult<SettlementBatch> {
        let mut tx = self.store.begin().await?;
        let current = lock_batch(tx.as_mut(), batch_id).await?;
        let mut next = transition(&current, SettlementStatus::Failed)?;
        next.failure_reason = Some(reason.to_string());
        write_transition(tx.as_mut(), &current, &next).await?;
        tx.commit().await?;

        warn!("Settlement batch {} failed: {}", batch_id, reason);
        self.status_changed(&next, actor, "settlement_failed", serde_json::json!({ "reason": reason }))
            .await;
        Ok(next)
    }

    pub async fn get_settlement_batch(&self, batch_id: Uuid) -> LedgerResult<SettlementBatch> {
        self.store
            .get_batch(batch_id)
            .await?
            .ok_or_else(|| LedgerError::NotFound(format!("settlement batch {}", batch_id)))
    }

    /// Newest first
    pub async fn get_settlement_batches(&self, filter: &SettlementFilter) -> LedgerResult<Vec<SettlementBatch>> {
        Ok(self.store.list_batches(filter).await?)
    }

    async fn status_changed(
        &self,
        batch: &SettlementBatch,
        actor: &Actor,
        action: &str,
        details: serde_json::Value,
    ) {
        self.events.publish(LedgerEvent::SettlementStatusChanged {
            batch_id: batch.batch_id,
            partner_id: batch.partner_id.clone(),
            status: batch.status,
        });
        self.audit
            .record(action, actor, "settlement_batch", batch.batch_id.to_string(), details)
            .await;
    }
}
