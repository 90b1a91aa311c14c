//! Partner wallets and the partner commission ledger

use crate::config::LedgerConfig;
use crate::error::{LedgerError, LedgerResult, StoreError};
use crate::models::money::validate_amount;
use crate::models::{
    Actor, EntryType, LedgerEntry, NewEntry, NewPartner, PartnerStatus, PartnerWallet,
    PostedEntry, ReferenceType,
};
use crate::notifications::{LedgerEvent, LedgerEvents};
use crate::services::ledger::{post_entry_in, require_admin};
use crate::services::AuditTrailService;
use crate::store::{LedgerStore, LedgerTx};
use chrono::Utc;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{debug, info};
use uuid::Uuid;

/// Append one entry to a partner ledger inside `tx`.
///
/// `adjust` runs on the locked wallet after the balance moved and before it
/// is written back; it is skipped on replays.
pub async fn post_partner_entry_in(
    tx: &mut dyn LedgerTx,
    config: &LedgerConfig,
    request: &NewEntry,
    adjust: impl FnOnce(&mut PartnerWallet) + Send,
) -> LedgerResult<PostedEntry> {
    validate_amount(request.amount, config.currency_scale)?;

    let mut partner = tx
        .lock_partner(&request.account_id)
        .await?
        .ok_or_else(|| LedgerError::AccountNotFound(request.account_id.clone()))?;

    if let Some(reference_id) = &request.reference_id {
        if let Some(existing) = tx
            .find_partner_entry_by_reference(&partner.partner_id, request.reference_type, reference_id)
            .await?
        {
            return Ok(PostedEntry::replayed(existing));
        }
    }

    if request.entry_type == EntryType::Debit {
        if partner.status == PartnerStatus::Suspended {
            return Err(LedgerError::WalletFrozen(partner.partner_id));
        }
        if partner.balance < request.amount {
            return Err(LedgerError::InsufficientFunds {
                account_id: partner.partner_id,
                available: partner.balance,
                requested: request.amount,
            });
        }
    }

    let now = Utc::now();
    let entry = request.to_entry(partner.balance, now);
    tx.insert_partner_entry(&entry).await.map_err(|e| match e {
        StoreError::Duplicate(_) => LedgerError::DuplicateReference {
            account_id: entry.account_id.clone(),
            reference_type: entry.reference_type.as_str().to_string(),
            reference_id: entry.reference_id.clone().unwrap_or_default(),
        },
        other => LedgerError::Store(other),
    })?;

    partner.balance = entry.balance_after;
    adjust(&mut partner);
    partner.updated_at = now;
    tx.update_partner(&partner).await?;

    Ok(PostedEntry::fresh(entry))
}

fn ensure_accepting(partner: &PartnerWallet) -> LedgerResult<()> {
    match partner.status {
        PartnerStatus::Active => Ok(()),
        PartnerStatus::Suspended => Err(LedgerError::WalletFrozen(partner.partner_id.clone())),
        PartnerStatus::PendingVerification => Err(LedgerError::Validation(format!(
            "partner {} is not verified yet",
            partner.partner_id
        ))),
    }
}

/// Credit commission earned by a partner: balance, pending settlement and
/// lifetime earnings all rise by `amount`.
async fn credit_commission_in(
    tx: &mut dyn LedgerTx,
    config: &LedgerConfig,
    request: &NewEntry,
) -> LedgerResult<PostedEntry> {
    let partner = tx
        .lock_partner(&request.account_id)
        .await?
        .ok_or_else(|| LedgerError::AccountNotFound(request.account_id.clone()))?;
    if let Some(reference_id) = &request.reference_id {
        if let Some(existing) = tx
            .find_partner_entry_by_reference(&partner.partner_id, request.reference_type, reference_id)
            .await?
        {
            return Ok(PostedEntry::replayed(existing));
        }
    }
    ensure_accepting(&partner)?;

    let amount = request.amount;
    post_partner_entry_in(tx, config, request, move |partner| {
        partner.pending_settlement += amount;
        partner.total_earned += amount;
    })
    .await
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CommissionRequest {
    pub partner_id: String,
    pub amount: Decimal,
    #[serde(default)]
    pub reference_id: Option<String>,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub initiated_by: Actor,
}

impl CommissionRequest {
    fn to_entry(&self) -> NewEntry {
        let mut entry = NewEntry::credit(&self.partner_id, self.amount, ReferenceType::Commission)
            .initiated_by(self.initiated_by.clone());
        if let Some(reference_id) = &self.reference_id {
            entry = entry.with_reference(reference_id);
        }
        if let Some(description) = &self.description {
            entry = entry.with_description(description);
        }
        entry
    }
}

/// User pays a partner: the user wallet is debited and the partner earns the
/// same amount as commission, in one transaction.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PartnerChargeRequest {
    pub user_id: String,
    pub partner_id: String,
    pub amount: Decimal,
    #[serde(default)]
    pub reference_id: Option<String>,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub initiated_by: Actor,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PartnerChargeReceipt {
    pub reference_id: String,
    pub user_entry: LedgerEntry,
    pub partner_entry: LedgerEntry,
    pub replayed: bool,
}

#[derive(Clone)]
pub struct PartnerService {
    store: Arc<dyn LedgerStore>,
    config: Arc<LedgerConfig>,
    events: LedgerEvents,
    audit: AuditTrailService,
}

impl PartnerService {
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

    /// Onboard a partner. New partners start in `pending_verification`.
    pub async fn register_partner(&self, request: NewPartner, actor: &Actor) -> LedgerResult<PartnerWallet> {
        request.validate().map_err(LedgerError::Validation)?;

        let partner = PartnerWallet::new(
            &request.partner_id,
            request.partner_type,
            request.commission_rate,
            request.bank_account.clone(),
        );
        let mut tx = self.store.begin().await?;
        if !tx.insert_partner(&partner).await? {
            return Err(LedgerError::Validation(format!(
                "partner {} is already registered",
                request.partner_id
            )));
        }
        tx.commit().await?;

        info!(
            "Registered partner {} ({}, commission rate {})",
            partner.partner_id,
            partner.partner_type.as_str(),
            partner.commission_rate
        );
        self.audit
            .record(
                "partner_registered",
                actor,
                "partner_wallet",
                &partner.partner_id,
                serde_json::json!({
                    "partner_type": partner.partner_type,
                    "commission_rate": partner.commission_rate,
                }),
            )
            .await;
        Ok(partner)
    }

    pub async fn get_partner(&self, partner_id: &str) -> LedgerResult<PartnerWallet> {
        self.store
            .get_partner(partner_id)
            .await?
            .ok_or_else(|| LedgerError::AccountNotFound(partner_id.to_string()))
    }

    /// Admin-only status change (verification, suspension, reinstatement)
    pub async fn set_partner_status(
        &self,
        partner_id: &str,
        status: PartnerStatus,
        admin: &Actor,
    ) -> LedgerResult<PartnerWallet> {
        require_admin(&self.config, admin)?;

        let mut tx = self.store.begin().await?;
        let mut partner = tx
            .lock_partner(partner_id)
            .await?
            .ok_or_else(|| LedgerError::AccountNotFound(partner_id.to_string()))?;
        let previous = partner.status;
        if previous == status {
            return Ok(partner);
        }
        partner.status = status;
        partner.updated_at = Utc::now();
        tx.update_partner(&partner).await?;
        tx.commit().await?;

        info!(
            "Partner {} status {} -> {} by {}",
            partner_id,
            previous.as_str(),
            status.as_str(),
            admin
        );
        self.audit
            .record(
                "partner_status_changed",
                admin,
                "partner_wallet",
                partner_id,
                serde_json::json!({ "from": previous, "to": status }),
            )
            .await;
        Ok(partner)
    }

    pub async fn update_bank_account(
        &self,
        partner_id: &str,
        bank_account: Option<String>,
        actor: &Actor,
    ) -> LedgerResult<PartnerWallet> {
        let mut tx = self.store.begin().await?;
        let mut partner = tx
            .lock_partner(partner_id)
            .await?
            .ok_or_else(|| LedgerError::AccountNotFound(partner_id.to_string()))?;
        partner.bank_account = bank_account;
        partner.updated_at = Utc::now();
        tx.update_partner(&partner).await?;
        tx.commit().await?;

        self.audit
            .record(
                "partner_bank_account_changed",
                actor,
                "partner_wallet",
                partner_id,
                serde_json::json!({ "has_bank_account": partner.bank_account.is_some() }),
            )
            .await;
        Ok(partner)
    }

    /// Credit commission to an active partner
    pub async fn credit_commission(&self, request: CommissionRequest) -> LedgerResult<PostedEntry> {
        let entry = request.to_entry();
        let posted = match self.commission_once(&entry).await {
            Err(LedgerError::DuplicateReference { .. }) => self.replayed_partner_entry(&entry).await?,
            other => other?,
        };

        if !posted.replayed {
            self.commission_accrued(&posted.entry, &request.initiated_by).await;
        } else {
            debug!("Replayed commission {} for {}", posted.ledger_id(), request.partner_id);
        }
        Ok(posted)
    }

    async fn commission_once(&self, entry: &NewEntry) -> LedgerResult<PostedEntry> {
        let mut tx = self.store.begin().await?;
        let posted = credit_commission_in(tx.as_mut(), &self.config, entry).await?;
        tx.commit().await?;
        Ok(posted)
    }

    async fn replayed_partner_entry(&self, entry: &NewEntry) -> LedgerResult<PostedEntry> {
        let reference_id = entry.reference_id.as_deref().unwrap_or_default();
        let mut tx = self.store.begin().await?;
        tx.find_partner_entry_by_reference(&entry.account_id, entry.reference_type, reference_id)
            .await?
            .map(PostedEntry::replayed)
            .ok_or_else(|| LedgerError::DuplicateReference {
                account_id: entry.account_id.clone(),
                reference_type: entry.reference_type.as_str().to_string(),
                reference_id: reference_id.to_string(),
            })
    }

    async fn commission_accrued(&self, entry: &LedgerEntry, actor: &Actor) {
        let pending = match self.store.get_partner(&entry.account_id).await {
            Ok(Some(partner)) => partner.pending_settlement,
            _ => entry.amount,
        };
        info!(
            "Credited commission {} to partner {} (pending settlement {})",
            entry.amount, entry.account_id, pending
        );
        self.events.publish(LedgerEvent::CommissionAccrued {
            partner_id: entry.account_id.clone(),
            amount: entry.amount,
            pending_settlement: pending,
        });
        self.audit
            .record(
                "commission_credited",
                actor,
                "partner_wallet",
                &entry.account_id,
                serde_json::json!({
                    "ledger_id": entry.ledger_id,
                    "amount": entry.amount,
                    "reference_id": entry.reference_id,
                }),
            )
            .await;
    }

    /// Debit the user and credit the partner in one transaction
    pub async fn charge_for_partner(&self, request: PartnerChargeRequest) -> LedgerResult<PartnerChargeReceipt> {
        let reference_id = request
            .reference_id
            .clone()
            .unwrap_or_else(|| Uuid::new_v4().to_string());
        let mut user_entry = NewEntry::debit(&request.user_id, request.amount, ReferenceType::PartnerPayment)
            .with_reference(&reference_id)
            .with_metadata(serde_json::json!({ "partner_id": request.partner_id }))
            .initiated_by(request.initiated_by.clone());
        let mut partner_entry = NewEntry::credit(&request.partner_id, request.amount, ReferenceType::Commission)
            .with_reference(&reference_id)
            .with_metadata(serde_json::json!({ "user_id": request.user_id }))
            .initiated_by(request.initiated_by.clone());
        if let Some(description) = &request.description {
            user_entry = user_entry.with_description(description);
            partner_entry = partner_entry.with_description(description);
        }

        let (user_posted, partner_posted) = match self.charge_once(&user_entry, &partner_entry).await {
            Err(LedgerError::DuplicateReference { .. }) => {
                let user_posted = self
                    .store
                    .find_entry_by_reference(&request.user_id, ReferenceType::PartnerPayment, &reference_id)
                    .await?
                    .map(PostedEntry::replayed)
                    .ok_or_else(|| LedgerError::DuplicateReference {
                        account_id: request.user_id.clone(),
                        reference_type: ReferenceType::PartnerPayment.as_str().to_string(),
                        reference_id: reference_id.clone(),
                    })?;
                (user_posted, self.replayed_partner_entry(&partner_entry).await?)
            }
            other => other?,
        };
        let replayed = user_posted.replayed && partner_posted.replayed;

        if !replayed {
            info!(
                "Charged {} from {} for partner {} ({})",
                request.amount, request.user_id, request.partner_id, reference_id
            );
            self.events.entry_posted(&user_posted.entry);
            self.commission_accrued(&partner_posted.entry, &request.initiated_by).await;
        }

        Ok(PartnerChargeReceipt {
            reference_id,
            user_entry: user_posted.entry,
            partner_entry: partner_posted.entry,
            replayed,
        })
    }

    async fn charge_once(
        &self,
        user_entry: &NewEntry,
        partner_entry: &NewEntry,
    ) -> LedgerResult<(PostedEntry, PostedEntry)> {
        let mut tx = self.store.begin().await?;
        let user_posted = post_entry_in(tx.as_mut(), &self.config, user_entry).await?;
        let partner_posted = credit_commission_in(tx.as_mut(), &self.config, partner_entry).await?;
        tx.commit().await?;
        Ok((user_posted, partner_posted))
    }

    /// Newest first
    pub async fn partner_entries(
        &self,
        partner_id: &str,
        limit: i64,
        offset: i64,
    ) -> LedgerResult<Vec<LedgerEntry>> {
        self.get_partner(partner_id).await?;
        Ok(self.store.list_partner_entries(partner_id, limit, offset).await?)
    }
}
