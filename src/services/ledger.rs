//! The atomic entry operation and the wallet account registry.
//!
//! `post_entry_in` is the only code path that writes a user ledger entry or
//! moves a wallet balance. It runs inside a caller-owned [`LedgerTx`] so that
//! escrow, payment and partner flows can combine several postings into one
//! commit.

use crate::config::LedgerConfig;
use crate::error::{LedgerError, LedgerResult, StoreError};
use crate::models::money::validate_amount;
use crate::models::{
    Actor, EntryType, LedgerEntry, NewEntry, PostedEntry, ReferenceType, WalletAccount,
    WithdrawalLimits,
};
use crate::notifications::LedgerEvents;
use crate::services::AuditTrailService;
use crate::store::{LedgerStore, LedgerTx};
use chrono::{DateTime, Datelike, NaiveTime, TimeZone, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Resolve an admin actor against the allowlist
pub(crate) fn require_admin<'a>(config: &LedgerConfig, actor: &'a Actor) -> LedgerResult<&'a str> {
    match actor.admin_id() {
        Some(id) if config.is_admin(id) => Ok(id),
        _ => Err(LedgerError::Unauthorized(format!(
            "{} is not an allowlisted admin",
            actor
        ))),
    }
}

fn day_start(now: DateTime<Utc>) -> DateTime<Utc> {
    Utc.from_utc_datetime(&now.date_naive().and_time(NaiveTime::MIN))
}

fn month_start(now: DateTime<Utc>) -> DateTime<Utc> {
    let today = now.date_naive();
    let first = today.with_day(1).unwrap_or(today);
    Utc.from_utc_datetime(&first.and_time(NaiveTime::MIN))
}

async fn check_withdrawal_limits(
    tx: &mut dyn LedgerTx,
    account: &WalletAccount,
    amount: Decimal,
    now: DateTime<Utc>,
) -> LedgerResult<()> {
    let windows = [
        ("daily", day_start(now), account.daily_withdrawal_limit),
        ("monthly", month_start(now), account.monthly_withdrawal_limit),
    ];
    for (period, since, limit) in windows {
        let used = tx
            .sum_entries_since(&account.account_id, ReferenceType::Withdrawal, since)
            .await?;
        if used + amount > limit {
            return Err(LedgerError::WithdrawalLimitExceeded {
                account_id: account.account_id.clone(),
                period,
                limit,
                used,
                requested: amount,
            });
        }
    }
    Ok(())
}

/// Lock an account, creating it with the default limits when missing
pub(crate) async fn lock_or_open_account(
    tx: &mut dyn LedgerTx,
    config: &LedgerConfig,
    account_id: &str,
) -> LedgerResult<WalletAccount> {
    if let Some(account) = tx.lock_account(account_id).await? {
        return Ok(account);
    }
    if account_id.trim().is_empty() {
        return Err(LedgerError::Validation("account_id must not be empty".to_string()));
    }
    let account = WalletAccount::new(account_id, config.default_withdrawal_limits());
    if tx.insert_account(&account).await? {
        debug!("Opened wallet account {}", account_id);
    }
    tx.lock_account(account_id)
        .await?
        .ok_or_else(|| LedgerError::AccountNotFound(account_id.to_string()))
}

/// Append one entry to a user account and move its balance, inside `tx`.
///
/// A request whose `(account, reference_type, reference_id)` was already
/// posted returns the original entry with `replayed = true` before any
/// balance or frozen check runs.
pub async fn post_entry_in(
    tx: &mut dyn LedgerTx,
    config: &LedgerConfig,
    request: &NewEntry,
) -> LedgerResult<PostedEntry> {
    validate_amount(request.amount, config.currency_scale)?;

    let is_correction = request.reference_type == ReferenceType::BalanceCorrection;
    if is_correction {
        require_admin(config, &request.initiated_by)?;
    }

    let mut account = match request.entry_type {
        EntryType::Credit => lock_or_open_account(tx, config, &request.account_id).await?,
        EntryType::Debit => tx
            .lock_account(&request.account_id)
            .await?
            .ok_or_else(|| LedgerError::AccountNotFound(request.account_id.clone()))?,
    };

    if let Some(reference_id) = &request.reference_id {
        if let Some(existing) = tx
            .find_entry_by_reference(&account.account_id, request.reference_type, reference_id)
            .await?
        {
            if existing.amount != request.amount || existing.entry_type != request.entry_type {
                warn!(
                    "Replayed {}/{} on {} with different amount ({} {} vs {} {})",
                    request.reference_type.as_str(),
                    reference_id,
                    account.account_id,
                    request.entry_type.as_str(),
                    request.amount,
                    existing.entry_type.as_str(),
                    existing.amount
                );
            }
            return Ok(PostedEntry::replayed(existing));
        }
    }

    if request.entry_type == EntryType::Debit && !is_correction {
        if account.frozen {
            return Err(LedgerError::WalletFrozen(account.account_id));
        }
        if account.balance < request.amount {
            return Err(LedgerError::InsufficientFunds {
                account_id: account.account_id,
                available: account.balance,
                requested: request.amount,
            });
        }
    }

    let now = Utc::now();
    if request.entry_type == EntryType::Debit && request.reference_type == ReferenceType::Withdrawal {
        check_withdrawal_limits(tx, &account, request.amount, now).await?;
    }

    let entry = request.to_entry(account.balance, now);
    tx.insert_entry(&entry).await.map_err(|e| match e {
        StoreError::Duplicate(_) => LedgerError::DuplicateReference {
            account_id: entry.account_id.clone(),
            reference_type: entry.reference_type.as_str().to_string(),
            reference_id: entry.reference_id.clone().unwrap_or_default(),
        },
        other => LedgerError::Store(other),
    })?;

    account.balance = entry.balance_after;
    account.updated_at = now;
    tx.update_account(&account).await?;

    Ok(PostedEntry::fresh(entry))
}

/// Two legs of a wallet-to-wallet transfer
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransferRequest {
    pub from_account: String,
    pub to_account: String,
    pub amount: Decimal,
    #[serde(default)]
    pub reference_id: Option<String>,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub initiated_by: Actor,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransferReceipt {
    pub reference_id: String,
    pub debit: LedgerEntry,
    pub credit: LedgerEntry,
    pub replayed: bool,
}

/// Public face of the user ledger
#[derive(Clone)]
pub struct LedgerService {
    store: Arc<dyn LedgerStore>,
    config: Arc<LedgerConfig>,
    events: LedgerEvents,
    audit: AuditTrailService,
}

impl LedgerService {
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

    /// Run the atomic entry operation in its own transaction
    pub async fn post_entry(&self, request: NewEntry) -> LedgerResult<PostedEntry> {
        let posted = match self.post_once(&request).await {
            Err(LedgerError::DuplicateReference { .. }) => self.resolve_replay(&request).await?,
            other => other?,
        };

        if posted.replayed {
            debug!(
                "Replayed entry {} for {}",
                posted.ledger_id(),
                request.account_id
            );
            return Ok(posted);
        }

        info!(
            "Posted {} {} {} on {} (balance {})",
            posted.entry.reference_type.as_str(),
            posted.entry.entry_type.as_str(),
            posted.entry.amount,
            posted.entry.account_id,
            posted.balance_after()
        );
        self.events.entry_posted(&posted.entry);
        self.audit
            .record(
                "entry_posted",
                &request.initiated_by,
                "wallet_account",
                &posted.entry.account_id,
                serde_json::json!({
                    "ledger_id": posted.ledger_id(),
                    "entry_type": posted.entry.entry_type,
                    "reference_type": posted.entry.reference_type,
                    "reference_id": posted.entry.reference_id,
                    "amount": posted.entry.amount,
                    "balance_after": posted.balance_after(),
                }),
            )
            .await;
        Ok(posted)
    }

    async fn post_once(&self, request: &NewEntry) -> LedgerResult<PostedEntry> {
        let mut tx = self.store.begin().await?;
        let posted = post_entry_in(tx.as_mut(), &self.config, request).await?;
        tx.commit().await?;
        Ok(posted)
    }

    /// Lost a uniqueness race: the winner's entry is the answer
    async fn resolve_replay(&self, request: &NewEntry) -> LedgerResult<PostedEntry> {
        let reference_id = request.reference_id.as_deref().unwrap_or_default();
        self.store
            .find_entry_by_reference(&request.account_id, request.reference_type, reference_id)
            .await?
            .map(PostedEntry::replayed)
            .ok_or_else(|| LedgerError::DuplicateReference {
                account_id: request.account_id.clone(),
                reference_type: request.reference_type.as_str().to_string(),
                reference_id: reference_id.to_string(),
            })
    }

    /// Open an account explicitly. Opening an existing account returns it unchanged.
    pub async fn open_account(
        &self,
        account_id: &str,
        limits: Option<WithdrawalLimits>,
    ) -> LedgerResult<WalletAccount> {
        if account_id.trim().is_empty() {
            return Err(LedgerError::Validation("account_id must not be empty".to_string()));
        }
        let limits = limits.unwrap_or_else(|| self.config.default_withdrawal_limits());
        limits.validate().map_err(LedgerError::Validation)?;

        let mut tx = self.store.begin().await?;
        if let Some(existing) = tx.lock_account(account_id).await? {
            return Ok(existing);
        }
        let account = WalletAccount::new(account_id, limits);
        let inserted = tx.insert_account(&account).await?;
        let account = tx
            .lock_account(account_id)
            .await?
            .ok_or_else(|| LedgerError::AccountNotFound(account_id.to_string()))?;
        tx.commit().await?;

        if inserted {
            info!("Opened wallet account {}", account_id);
        }
        Ok(account)
    }

    pub async fn get_account(&self, account_id: &str) -> LedgerResult<WalletAccount> {
        self.store
            .get_account(account_id)
            .await?
            .ok_or_else(|| LedgerError::AccountNotFound(account_id.to_string()))
    }

    pub async fn balance(&self, account_id: &str) -> LedgerResult<Decimal> {
        Ok(self.get_account(account_id).await?.balance)
    }

    /// Newest first
    pub async fn account_entries(
        &self,
        account_id: &str,
        limit: i64,
        offset: i64,
    ) -> LedgerResult<Vec<LedgerEntry>> {
        self.get_account(account_id).await?;
        Ok(self.store.list_entries(account_id, limit, offset).await?)
    }

    pub async fn freeze_account(&self, account_id: &str, admin: &Actor) -> LedgerResult<WalletAccount> {
        self.set_frozen(account_id, true, admin).await
    }

    pub async fn unfreeze_account(&self, account_id: &str, admin: &Actor) -> LedgerResult<WalletAccount> {
        self.set_frozen(account_id, false, admin).await
    }

    async fn set_frozen(&self, account_id: &str, frozen: bool, admin: &Actor) -> LedgerResult<WalletAccount> {
        require_admin(&self.config, admin)?;

        let mut tx = self.store.begin().await?;
        let mut account = tx
            .lock_account(account_id)
            .await?
            .ok_or_else(|| LedgerError::AccountNotFound(account_id.to_string()))?;
        if account.frozen == frozen {
            return Ok(account);
        }
        account.frozen = frozen;
        account.updated_at = Utc::now();
        tx.update_account(&account).await?;
        tx.commit().await?;

        let action = if frozen { "wallet_frozen" } else { "wallet_unfrozen" };
        info!("{} {} by {}", action, account_id, admin);
        self.audit
            .record(action, admin, "wallet_account", account_id, serde_json::json!({}))
            .await;
        Ok(account)
    }

    pub async fn set_withdrawal_limits(
        &self,
        account_id: &str,
        limits: WithdrawalLimits,
        admin: &Actor,
    ) -> LedgerResult<WalletAccount> {
        require_admin(&self.config, admin)?;
        limits.validate().map_err(LedgerError::Validation)?;

        let mut tx = self.store.begin().await?;
        let mut account = tx
            .lock_account(account_id)
            .await?
            .ok_or_else(|| LedgerError::AccountNotFound(account_id.to_string()))?;
        let previous = account.limits();
        account.daily_withdrawal_limit = limits.daily;
        account.monthly_withdrawal_limit = limits.monthly;
        account.updated_at = Utc::now();
        tx.update_account(&account).await?;
        tx.commit().await?;

        self.audit
            .record(
                "withdrawal_limits_changed",
                admin,
                "wallet_account",
                account_id,
                serde_json::json!({ "previous": previous, "current": limits }),
            )
            .await;
        Ok(account)
    }

    async fn transfer_once(
        &self,
        request: &TransferRequest,
        debit: &NewEntry,
        credit: &NewEntry,
    ) -> LedgerResult<(PostedEntry, PostedEntry)> {
        let mut tx = self.store.begin().await?;
        let mut ordered = [request.from_account.as_str(), request.to_account.as_str()];
        ordered.sort_unstable();
        for account_id in ordered {
            if account_id == request.from_account {
                tx.lock_account(account_id).await?;
            } else {
                lock_or_open_account(tx.as_mut(), &self.config, account_id).await?;
            }
        }
        let out = post_entry_in(tx.as_mut(), &self.config, debit).await?;
        let into = post_entry_in(tx.as_mut(), &self.config, credit).await?;
        tx.commit().await?;
        Ok((out, into))
    }

    /// Move funds between two wallets in one transaction.
    ///
    /// Both rows are locked in sorted order before either leg is posted.
    pub async fn transfer(&self, request: TransferRequest) -> LedgerResult<TransferReceipt> {
        if request.from_account == request.to_account {
            return Err(LedgerError::Validation(
                "cannot transfer to the same account".to_string(),
            ));
        }
        validate_amount(request.amount, self.config.currency_scale)?;

        let reference_id = request
            .reference_id
            .clone()
            .unwrap_or_else(|| Uuid::new_v4().to_string());
        let debit = NewEntry::debit(&request.from_account, request.amount, ReferenceType::TransferOut)
            .with_reference(&reference_id)
            .with_metadata(serde_json::json!({ "counterparty": request.to_account }))
            .initiated_by(request.initiated_by.clone());
        let credit = NewEntry::credit(&request.to_account, request.amount, ReferenceType::TransferIn)
            .with_reference(&reference_id)
            .with_metadata(serde_json::json!({ "counterparty": request.from_account }))
            .initiated_by(request.initiated_by.clone());
        let (debit, credit) = match &request.description {
            Some(description) => (
                debit.with_description(description),
                credit.with_description(description),
            ),
            None => (debit, credit),
        };

        let (out, into) = match self.transfer_once(&request, &debit, &credit).await {
            Err(LedgerError::DuplicateReference { .. }) => (
                self.resolve_replay(&debit).await?,
                self.resolve_replay(&credit).await?,
            ),
            other => other?,
        };
        let replayed = out.replayed && into.replayed;

        if !replayed {
            info!(
                "Transferred {} from {} to {} ({})",
                request.amount, request.from_account, request.to_account, reference_id
            );
            self.events.entry_posted(&out.entry);
            self.events.entry_posted(&into.entry);
            self.audit
                .record(
                    "transfer",
                    &request.initiated_by,
                    "wallet_account",
                    &request.from_account,
                    serde_json::json!({
                        "to_account": request.to_account,
                        "amount": request.amount,
                        "reference_id": reference_id,
                    }),
                )
                .await;
        }

        Ok(TransferReceipt {
            reference_id,
            debit: out.entry,
            credit: into.entry,
            replayed,
        })
    }
}
