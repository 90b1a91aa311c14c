//! Gateway payment tracker.
//!
//! A payment row is created before the gateway redirect and driven by the
//! gateway's callbacks. Only the move into `completed` touches the ledger, and
//! it does so in the same store transaction as the status write.

use crate::config::LedgerConfig;
use crate::error::{LedgerError, LedgerResult, StoreError};
use crate::models::money::validate_amount;
use crate::models::{
    Actor, EntryType, GatewayCallback, NewEntry, NewPayment, PaymentStatus, PaymentTransaction,
    PaymentUpdate, PostedEntry,
};
use crate::notifications::{LedgerEvent, LedgerEvents};
use crate::services::ledger::{post_entry_in, require_admin};
use crate::services::AuditTrailService;
use crate::store::{LedgerStore, LedgerTx};
use chrono::Utc;
use std::sync::Arc;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

fn invalid_transition(payment: &PaymentTransaction, next: PaymentStatus) -> LedgerError {
    LedgerError::InvalidStateTransition {
        entity: "payment_transaction",
        id: payment.payment_id,
        from: payment.status.as_str().to_string(),
        to: next.as_str().to_string(),
    }
}

/// A completed callback for a pending payment steps through `processing`
fn check_transition(payment: &PaymentTransaction, next: PaymentStatus) -> LedgerResult<()> {
    let allowed = payment.status.can_transition_to(next)
        || (payment.status == PaymentStatus::Pending
            && next == PaymentStatus::Completed
            && PaymentStatus::Processing.can_transition_to(next));
    if allowed {
        Ok(())
    } else {
        Err(invalid_transition(payment, next))
    }
}

async fn lock_payment(tx: &mut dyn LedgerTx, payment_id: Uuid) -> LedgerResult<PaymentTransaction> {
    tx.lock_payment(payment_id)
        .await?
        .ok_or_else(|| LedgerError::NotFound(format!("payment {}", payment_id)))
}

async fn write_transition(
    tx: &mut dyn LedgerTx,
    current: &PaymentTransaction,
    next: &PaymentTransaction,
) -> LedgerResult<()> {
    if !tx.update_payment(next, current.status).await? {
        return Err(invalid_transition(current, next.status));
    }
    Ok(())
}

/// A replayed creation must describe the same payment
fn ensure_same_payment(existing: &PaymentTransaction, request: &NewPayment) -> LedgerResult<()> {
    if existing.user_id != request.user_id
        || existing.amount != request.amount
        || existing.transaction_type != request.transaction_type
    {
        return Err(LedgerError::ExternalReferenceMismatch(format!(
            "gateway reference {} already tracks a different payment",
            request.gateway_txn_ref
        )));
    }
    Ok(())
}

/// Posting errors that reject the payment rather than abort the callback
fn rejects_payment(err: &LedgerError) -> bool {
    !matches!(err, LedgerError::Store(_) | LedgerError::DuplicateReference { .. })
}

enum CallbackOutcome {
    Applied(PaymentUpdate),
    Rejected {
        payment: PaymentTransaction,
        error: LedgerError,
    },
}

#[derive(Clone)]
pub struct PaymentService {
    store: Arc<dyn LedgerStore>,
    config: Arc<LedgerConfig>,
    events: LedgerEvents,
    audit: AuditTrailService,
}

impl PaymentService {
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

    /// Track a payment before redirecting to the gateway.
    ///
    /// The gateway reference is the idempotency key: repeating the same
    /// request returns the stored row.
    pub async fn create_payment_transaction(&self, request: NewPayment) -> LedgerResult<PaymentTransaction> {
        validate_amount(request.amount, self.config.currency_scale)?;
        if request.user_id.trim().is_empty() {
            return Err(LedgerError::Validation("user_id must not be empty".to_string()));
        }
        if request.gateway_txn_ref.trim().is_empty() {
            return Err(LedgerError::Validation(
                "gateway_txn_ref must not be empty".to_string(),
            ));
        }

        let (payment, created) = match self.create_once(&request).await {
            Err(LedgerError::Store(StoreError::Duplicate(_))) => {
                let existing = self
                    .store
                    .find_payment_by_gateway_ref(&request.gateway_txn_ref)
                    .await?
                    .ok_or_else(|| {
                        LedgerError::ExternalReferenceMismatch(request.gateway_txn_ref.clone())
                    })?;
                ensure_same_payment(&existing, &request)?;
                (existing, false)
            }
            other => other?,
        };

        if !created {
            debug!(
                "Payment for gateway reference {} already tracked as {}",
                payment.gateway_txn_ref, payment.payment_id
            );
            return Ok(payment);
        }

        info!(
            "Tracking {} {} of {} for {} ({})",
            payment.payment_method.as_str(),
            payment.transaction_type.as_str(),
            payment.amount,
            payment.user_id,
            payment.gateway_txn_ref
        );
        self.status_changed(
            &payment,
            &Actor::User(payment.user_id.clone()),
            "payment_created",
            serde_json::json!({
                "amount": payment.amount,
                "transaction_type": payment.transaction_type,
                "payment_method": payment.payment_method,
                "gateway_txn_ref": payment.gateway_txn_ref,
            }),
        )
        .await;
        Ok(payment)
    }

    async fn create_once(&self, request: &NewPayment) -> LedgerResult<(PaymentTransaction, bool)> {
        let mut tx = self.store.begin().await?;
        if let Some(existing) = tx.lock_payment_by_gateway_ref(&request.gateway_txn_ref).await? {
            ensure_same_payment(&existing, request)?;
            return Ok((existing, false));
        }
        let payment = request.clone().into_transaction();
        tx.insert_payment(&payment).await?;
        tx.commit().await?;
        Ok((payment, true))
    }

    /// `pending -> processing` once the user has been handed to the gateway
    pub async fn mark_payment_processing(&self, payment_id: Uuid) -> LedgerResult<PaymentTransaction> {
        let mut tx = self.store.begin().await?;
        let current = lock_payment(tx.as_mut(), payment_id).await?;
        if current.status == PaymentStatus::Processing {
            return Ok(current);
        }
        check_transition(&current, PaymentStatus::Processing)?;

        let mut next = current.clone();
        next.status = PaymentStatus::Processing;
        next.updated_at = Utc::now();
        write_transition(tx.as_mut(), &current, &next).await?;
        tx.commit().await?;

        debug!("Payment {} is processing", payment_id);
        self.status_changed(&next, &Actor::System, "payment_processing", serde_json::json!({}))
            .await;
        Ok(next)
    }

    /// Apply a gateway callback to the payment tracked under `gateway_ref`.
    ///
    /// Repeating an already applied status is a no-op. If the ledger posting
    /// for a completed payment is rejected, the payment is marked failed with
    /// the rejection message and the rejection is returned.
    pub async fn update_payment_by_gateway_ref(
        &self,
        gateway_ref: &str,
        callback: GatewayCallback,
    ) -> LedgerResult<PaymentUpdate> {
        match self.apply_callback(gateway_ref, &callback).await? {
            CallbackOutcome::Applied(update) => {
                if update.replayed {
                    debug!(
                        "Replayed {} callback for payment {}",
                        callback.status.as_str(),
                        update.payment.payment_id
                    );
                    return Ok(update);
                }

                info!(
                    "Payment {} is {} ({})",
                    update.payment.payment_id,
                    update.payment.status.as_str(),
                    gateway_ref
                );
                self.status_changed(
                    &update.payment,
                    &Actor::System,
                    "payment_status_changed",
                    serde_json::json!({
                        "status": update.payment.status,
                        "external_transaction_id": update.payment.external_transaction_id,
                        "ledger_entry_id": update.ledger_entry_id,
                        "error_message": update.payment.error_message,
                    }),
                )
                .await;
                Ok(update)
            }
            CallbackOutcome::Rejected { payment, error } => {
                warn!(
                    "Ledger posting for payment {} rejected: {}",
                    payment.payment_id, error
                );
                if let Err(e) = self.fail_rejected(&payment, &error).await {
                    error!(
                        "Could not mark payment {} failed after rejected posting: {}",
                        payment.payment_id, e
                    );
                }
                Err(error)
            }
        }
    }

    async fn apply_callback(
        &self,
        gateway_ref: &str,
        callback: &GatewayCallback,
    ) -> LedgerResult<CallbackOutcome> {
        let mut tx = self.store.begin().await?;
        let current = tx
            .lock_payment_by_gateway_ref(gateway_ref)
            .await?
            .ok_or_else(|| {
                LedgerError::ExternalReferenceMismatch(format!(
                    "unknown gateway reference {}",
                    gateway_ref
                ))
            })?;

        if let Some(amount) = callback.amount {
            if amount != current.amount {
                return Err(LedgerError::ExternalReferenceMismatch(format!(
                    "gateway reported {} for {}, tracked amount is {}",
                    amount, gateway_ref, current.amount
                )));
            }
        }

        if current.status == callback.status {
            return Ok(CallbackOutcome::Applied(PaymentUpdate {
                ledger_entry_id: current.ledger_entry_id,
                payment: current,
                balance_after: None,
                replayed: true,
            }));
        }
        check_transition(&current, callback.status)?;

        let now = Utc::now();
        let mut next = current.clone();
        next.status = callback.status;
        next.updated_at = now;
        if callback.external_transaction_id.is_some() {
            next.external_transaction_id = callback.external_transaction_id.clone();
        }
        if callback.status == PaymentStatus::Failed {
            next.error_message = callback.error_message.clone();
        }

        let mut posted: Option<PostedEntry> = None;
        if callback.status == PaymentStatus::Completed {
            let request = self.completion_entry(&next);
            match post_entry_in(tx.as_mut(), &self.config, &request).await {
                Ok(entry) => {
                    next.ledger_entry_id = Some(entry.ledger_id());
                    next.completed_at = Some(now);
                    posted = Some(entry);
                }
                Err(e) if rejects_payment(&e) => {
                    return Ok(CallbackOutcome::Rejected {
                        payment: current,
                        error: e,
                    });
                }
                Err(e) => return Err(e),
            }
        }

        write_transition(tx.as_mut(), &current, &next).await?;
        tx.commit().await?;

        if let Some(entry) = &posted {
            if !entry.replayed {
                self.events.entry_posted(&entry.entry);
            }
        }
        Ok(CallbackOutcome::Applied(PaymentUpdate {
            ledger_entry_id: next.ledger_entry_id,
            balance_after: posted.as_ref().map(PostedEntry::balance_after),
            payment: next,
            replayed: false,
        }))
    }

    fn completion_entry(&self, payment: &PaymentTransaction) -> NewEntry {
        let (entry_type, reference_type) = payment.transaction_type.ledger_posting();
        let entry = match entry_type {
            EntryType::Credit => NewEntry::credit(&payment.user_id, payment.amount, reference_type),
            EntryType::Debit => NewEntry::debit(&payment.user_id, payment.amount, reference_type),
        };
        entry
            .with_reference(payment.payment_id.to_string())
            .with_description(format!(
                "{} {}",
                payment.payment_method.as_str(),
                payment.transaction_type.as_str()
            ))
            .with_metadata(serde_json::json!({
                "payment_method": payment.payment_method,
                "gateway_txn_ref": payment.gateway_txn_ref,
                "external_transaction_id": payment.external_transaction_id,
            }))
            .initiated_by(Actor::System)
    }

    /// Record a rejected completion as `failed`, in its own transaction
    async fn fail_rejected(&self, rejected: &PaymentTransaction, error: &LedgerError) -> LedgerResult<()> {
        let mut tx = self.store.begin().await?;
        let current = lock_payment(tx.as_mut(), rejected.payment_id).await?;
        if current.status.is_terminal() {
            return Ok(());
        }
        check_transition(&current, PaymentStatus::Failed)?;

        let mut next = current.clone();
        next.status = PaymentStatus::Failed;
        next.error_message = Some(error.to_string());
        next.updated_at = Utc::now();
        write_transition(tx.as_mut(), &current, &next).await?;
        tx.commit().await?;

        self.status_changed(
            &next,
            &Actor::System,
            "payment_failed",
            serde_json::json!({ "code": error.code(), "error_message": next.error_message }),
        )
        .await;
        Ok(())
    }

    /// Cancel a payment that has not reached the ledger yet.
    ///
    /// Users may cancel their own payments; admins must be allowlisted.
    pub async fn cancel_payment(&self, payment_id: Uuid, actor: &Actor) -> LedgerResult<PaymentTransaction> {
        if actor.admin_id().is_some() {
            require_admin(&self.config, actor)?;
        }

        let mut tx = self.store.begin().await?;
        let current = lock_payment(tx.as_mut(), payment_id).await?;
        if let Actor::User(user_id) = actor {
            if *user_id != current.user_id {
                return Err(LedgerError::Unauthorized(format!(
                    "{} cannot cancel payment {}",
                    actor, payment_id
                )));
            }
        }
        if current.status == PaymentStatus::Cancelled {
            return Ok(current);
        }
        check_transition(&current, PaymentStatus::Cancelled)?;

        let mut next = current.clone();
        next.status = PaymentStatus::Cancelled;
        next.updated_at = Utc::now();
        write_transition(tx.as_mut(), &current, &next).await?;
        tx.commit().await?;

        info!("Payment {} cancelled by {}", payment_id, actor);
        self.status_changed(&next, actor, "payment_cancelled", serde_json::json!({}))
            .await;
        Ok(next)
    }

    pub async fn get_payment(&self, payment_id: Uuid) -> LedgerResult<PaymentTransaction> {
        self.store
            .get_payment(payment_id)
            .await?
            .ok_or_else(|| LedgerError::NotFound(format!("payment {}", payment_id)))
    }

    /// Newest first
    pub async fn payments_for_user(&self, user_id: &str, limit: i64) -> LedgerResult<Vec<PaymentTransaction>> {
        Ok(self.store.list_payments_for_user(user_id, limit).await?)
    }

    async fn status_changed(
        &self,
        payment: &PaymentTransaction,
        actor: &Actor,
        action: &str,
        details: serde_json::Value,
    ) {
        self.events.publish(LedgerEvent::PaymentStatusChanged {
            payment_id: payment.payment_id,
            user_id: payment.user_id.clone(),
            status: payment.status,
        });
        self.audit
            .record(action, actor, "payment_transaction", payment.payment_id.to_string(), details)
            .await;
    }
}
