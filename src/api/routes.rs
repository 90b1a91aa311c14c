use super::ApiError;
use crate::models::{
    Actor, EscrowHoldReceipt, EscrowPosition, EscrowReleaseReceipt, EscrowType, GatewayCallback,
    LedgerEntry, NewEntry, NewPartner, NewPayment, PartnerStatus, PartnerWallet,
    PaymentTransaction, PaymentUpdate, PostedEntry, SettlementBatch, SettlementFilter,
    WalletAccount, WithdrawalLimits,
};
use crate::services::{
    CommissionRequest, HoldRequest, PartnerChargeReceipt, PartnerChargeRequest,
    ReconciliationReport, ReleaseRequest, ReturnRequest, TransferReceipt, TransferRequest,
};
use crate::store::BalanceCheck;
use crate::AppState;
use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::routing::{get, post, put};
use axum::{Json, Router};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

type ApiResult<T> = Result<Json<T>, ApiError>;

const DEFAULT_PAGE: i64 = 50;
const MAX_PAGE: i64 = 500;

pub fn routes() -> Router<AppState> {
    Router::new()
        .route("/health", get(health))
        // wallets
        .route("/wallets", post(open_wallet))
        .route("/wallets/:account_id", get(get_wallet))
        .route("/wallets/:account_id/entries", get(wallet_entries))
        .route("/wallets/:account_id/freeze", post(freeze_wallet))
        .route("/wallets/:account_id/unfreeze", post(unfreeze_wallet))
        .route("/wallets/:account_id/limits", put(set_limits))
        .route("/entries", post(post_entry))
        .route("/transfers", post(transfer))
        // escrow
        .route("/escrow/holds", post(hold_escrow))
        .route("/escrow/releases", post(release_escrow))
        .route("/escrow/returns", post(release_on_return))
        .route("/escrow/:account_id/:escrow_type", get(escrow_position))
        // partners
        .route("/partners", post(register_partner))
        .route("/partners/charges", post(charge_for_partner))
        .route("/partners/:partner_id", get(get_partner))
        .route("/partners/:partner_id/status", put(set_partner_status))
        .route("/partners/:partner_id/bank-account", put(update_bank_account))
        .route("/partners/:partner_id/commissions", post(credit_commission))
        .route("/partners/:partner_id/entries", get(partner_entries))
        // settlements
        .route("/settlements", post(create_settlement).get(list_settlements))
        .route("/settlements/:batch_id", get(get_settlement))
        .route("/settlements/:batch_id/approve", post(approve_settlement))
        .route("/settlements/:batch_id/payout", post(payout_settlement))
        .route("/settlements/:batch_id/resume", post(resume_settlement))
        .route("/settlements/:batch_id/cancel", post(cancel_settlement))
        .route("/settlements/:batch_id/fail", post(fail_settlement))
        // payments
        .route("/payments", post(create_payment).get(user_payments))
        .route("/payments/:payment_id", get(get_payment))
        .route("/payments/:payment_id/processing", post(mark_processing))
        .route("/payments/:payment_id/cancel", post(cancel_payment))
        .route("/payments/callbacks/:gateway_ref", post(gateway_callback))
        // reconciliation
        .route("/reconciliation", get(reconciliation_report))
        .route("/reconciliation/accounts/:account_id", get(verify_account))
        .route("/reconciliation/partners/:partner_id", get(verify_partner))
}

// ===== Request/Response Types =====

#[derive(Serialize)]
struct HealthResponse {
    status: String,
    version: String,
}

#[derive(Debug, Deserialize)]
struct PageQuery {
    limit: Option<i64>,
    offset: Option<i64>,
}

impl PageQuery {
    fn limit(&self) -> i64 {
        self.limit.unwrap_or(DEFAULT_PAGE).clamp(1, MAX_PAGE)
    }

    fn offset(&self) -> i64 {
        self.offset.unwrap_or(0).max(0)
    }
}

#[derive(Debug, Deserialize)]
struct OpenWalletRequest {
    account_id: String,
    #[serde(default)]
    limits: Option<WithdrawalLimits>,
}

/// Body of admin-only actions that carry nothing else
#[derive(Debug, Deserialize)]
struct ActorBody {
    #[serde(default)]
    actor: Actor,
}

#[derive(Debug, Deserialize)]
struct LimitsBody {
    limits: WithdrawalLimits,
    actor: Actor,
}

#[derive(Debug, Deserialize)]
struct EscrowRefQuery {
    escrow_ref: Option<String>,
}

#[derive(Debug, Deserialize)]
struct RegisterPartnerBody {
    partner: NewPartner,
    #[serde(default)]
    actor: Actor,
}

#[derive(Debug, Deserialize)]
struct PartnerStatusBody {
    status: PartnerStatus,
    actor: Actor,
}

#[derive(Debug, Deserialize)]
struct BankAccountBody {
    bank_account: Option<String>,
    #[serde(default)]
    actor: Actor,
}

#[derive(Debug, Deserialize)]
struct CommissionBody {
    amount: rust_decimal::Decimal,
    #[serde(default)]
    reference_id: Option<String>,
    #[serde(default)]
    description: Option<String>,
    #[serde(default)]
    initiated_by: Actor,
}

#[derive(Debug, Deserialize)]
struct CreateSettlementBody {
    partner_id: String,
    period_start: DateTime<Utc>,
    period_end: DateTime<Utc>,
    #[serde(default)]
    actor: Actor,
}

#[derive(Debug, Deserialize)]
struct PayoutBody {
    payment_reference: String,
    #[serde(default)]
    actor: Actor,
}

#[derive(Debug, Deserialize)]
struct ReasonBody {
    reason: String,
    #[serde(default)]
    actor: Actor,
}

#[derive(Debug, Deserialize)]
struct UserPaymentsQuery {
    user_id: String,
    limit: Option<i64>,
}

#[derive(Debug, Deserialize)]
struct PeriodQuery {
    period_start: DateTime<Utc>,
    period_end: DateTime<Utc>,
}

// ===== Handlers =====

async fn health() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "healthy".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
    })
}

async fn open_wallet(
    State(state): State<AppState>,
    Json(body): Json<OpenWalletRequest>,
) -> Result<(StatusCode, Json<WalletAccount>), ApiError> {
    let account = state.ledger.open_account(&body.account_id, body.limits).await?;
    Ok((StatusCode::CREATED, Json(account)))
}

async fn get_wallet(
    State(state): State<AppState>,
    Path(account_id): Path<String>,
) -> ApiResult<WalletAccount> {
    Ok(Json(state.ledger.get_account(&account_id).await?))
}

async fn wallet_entries(
    State(state): State<AppState>,
    Path(account_id): Path<String>,
    Query(page): Query<PageQuery>,
) -> ApiResult<Vec<LedgerEntry>> {
    let entries = state
        .ledger
        .account_entries(&account_id, page.limit(), page.offset())
        .await?;
    Ok(Json(entries))
}

async fn freeze_wallet(
    State(state): State<AppState>,
    Path(account_id): Path<String>,
    Json(body): Json<ActorBody>,
) -> ApiResult<WalletAccount> {
    Ok(Json(state.ledger.freeze_account(&account_id, &body.actor).await?))
}

async fn unfreeze_wallet(
    State(state): State<AppState>,
    Path(account_id): Path<String>,
    Json(body): Json<ActorBody>,
) -> ApiResult<WalletAccount> {
    Ok(Json(state.ledger.unfreeze_account(&account_id, &body.actor).await?))
}

async fn set_limits(
    State(state): State<AppState>,
    Path(account_id): Path<String>,
    Json(body): Json<LimitsBody>,
) -> ApiResult<WalletAccount> {
    let account = state
        .ledger
        .set_withdrawal_limits(&account_id, body.limits, &body.actor)
        .await?;
    Ok(Json(account))
}

async fn post_entry(
    State(state): State<AppState>,
    Json(entry): Json<NewEntry>,
) -> ApiResult<PostedEntry> {
    Ok(Json(state.ledger.post_entry(entry).await?))
}

async fn transfer(
    State(state): State<AppState>,
    Json(request): Json<TransferRequest>,
) -> ApiResult<TransferReceipt> {
    Ok(Json(state.ledger.transfer(request).await?))
}

async fn hold_escrow(
    State(state): State<AppState>,
    Json(request): Json<HoldRequest>,
) -> ApiResult<EscrowHoldReceipt> {
    Ok(Json(state.escrow.hold_escrow(request).await?))
}

async fn release_escrow(
    State(state): State<AppState>,
    Json(request): Json<ReleaseRequest>,
) -> ApiResult<EscrowReleaseReceipt> {
    Ok(Json(state.escrow.release_escrow(request).await?))
}

async fn release_on_return(
    State(state): State<AppState>,
    Json(request): Json<ReturnRequest>,
) -> ApiResult<EscrowReleaseReceipt> {
    Ok(Json(state.escrow.release_on_return(request).await?))
}

async fn escrow_position(
    State(state): State<AppState>,
    Path((account_id, escrow_type)): Path<(String, EscrowType)>,
    Query(query): Query<EscrowRefQuery>,
) -> ApiResult<EscrowPosition> {
    let position = state
        .escrow
        .escrow_position(&account_id, escrow_type, query.escrow_ref.as_deref())
        .await?;
    Ok(Json(position))
}

async fn register_partner(
    State(state): State<AppState>,
    Json(body): Json<RegisterPartnerBody>,
) -> Result<(StatusCode, Json<PartnerWallet>), ApiError> {
    let partner = state.partners.register_partner(body.partner, &body.actor).await?;
    Ok((StatusCode::CREATED, Json(partner)))
}

async fn get_partner(
    State(state): State<AppState>,
    Path(partner_id): Path<String>,
) -> ApiResult<PartnerWallet> {
    Ok(Json(state.partners.get_partner(&partner_id).await?))
}

async fn set_partner_status(
    State(state): State<AppState>,
    Path(partner_id): Path<String>,
    Json(body): Json<PartnerStatusBody>,
) -> ApiResult<PartnerWallet> {
    let partner = state
        .partners
        .set_partner_status(&partner_id, body.status, &body.actor)
        .await?;
    Ok(Json(partner))
}

async fn update_bank_account(
    State(state): State<AppState>,
    Path(partner_id): Path<String>,
    Json(body): Json<BankAccountBody>,
) -> ApiResult<PartnerWallet> {
    let partner = state
        .partners
        .update_bank_account(&partner_id, body.bank_account, &body.actor)
        .await?;
    Ok(Json(partner))
}

async fn credit_commission(
    State(state): State<AppState>,
    Path(partner_id): Path<String>,
    Json(body): Json<CommissionBody>,
) -> ApiResult<PostedEntry> {
    let request = CommissionRequest {
        partner_id,
        amount: body.amount,
        reference_id: body.reference_id,
        description: body.description,
        initiated_by: body.initiated_by,
    };
    Ok(Json(state.partners.credit_commission(request).await?))
}

async fn charge_for_partner(
    State(state): State<AppState>,
    Json(request): Json<PartnerChargeRequest>,
) -> ApiResult<PartnerChargeReceipt> {
    Ok(Json(state.partners.charge_for_partner(request).await?))
}

async fn partner_entries(
    State(state): State<AppState>,
    Path(partner_id): Path<String>,
    Query(page): Query<PageQuery>,
) -> ApiResult<Vec<LedgerEntry>> {
    let entries = state
        .partners
        .partner_entries(&partner_id, page.limit(), page.offset())
        .await?;
    Ok(Json(entries))
}

async fn create_settlement(
    State(state): State<AppState>,
    Json(body): Json<CreateSettlementBody>,
) -> Result<(StatusCode, Json<SettlementBatch>), ApiError> {
    let batch = state
        .settlements
        .create_settlement_batch(&body.partner_id, body.period_start, body.period_end, &body.actor)
        .await?;
    Ok((StatusCode::CREATED, Json(batch)))
}

async fn list_settlements(
    State(state): State<AppState>,
    Query(filter): Query<SettlementFilter>,
) -> ApiResult<Vec<SettlementBatch>> {
    Ok(Json(state.settlements.get_settlement_batches(&filter).await?))
}

async fn get_settlement(
    State(state): State<AppState>,
    Path(batch_id): Path<Uuid>,
) -> ApiResult<SettlementBatch> {
    Ok(Json(state.settlements.get_settlement_batch(batch_id).await?))
}

async fn approve_settlement(
    State(state): State<AppState>,
    Path(batch_id): Path<Uuid>,
    Json(body): Json<ActorBody>,
) -> ApiResult<SettlementBatch> {
    Ok(Json(state.settlements.approve_settlement(batch_id, &body.actor).await?))
}

async fn payout_settlement(
    State(state): State<AppState>,
    Path(batch_id): Path<Uuid>,
    Json(body): Json<PayoutBody>,
) -> ApiResult<SettlementBatch> {
    let batch = state
        .settlements
        .process_settlement_payout(batch_id, &body.payment_reference, &body.actor)
        .await?;
    Ok(Json(batch))
}

async fn resume_settlement(
    State(state): State<AppState>,
    Path(batch_id): Path<Uuid>,
    Json(body): Json<PayoutBody>,
) -> ApiResult<SettlementBatch> {
    let batch = state
        .settlements
        .resume_settlement_payout(batch_id, &body.payment_reference, &body.actor)
        .await?;
    Ok(Json(batch))
}

async fn cancel_settlement(
    State(state): State<AppState>,
    Path(batch_id): Path<Uuid>,
    Json(body): Json<ReasonBody>,
) -> ApiResult<SettlementBatch> {
    let batch = state
        .settlements
        .cancel_settlement(batch_id, &body.actor, &body.reason)
        .await?;
    Ok(Json(batch))
}

async fn fail_settlement(
    State(state): State<AppState>,
    Path(batch_id): Path<Uuid>,
    Json(body): Json<ReasonBody>,
) -> ApiResult<SettlementBatch> {
    let batch = state
        .settlements
        .fail_settlement(batch_id, &body.reason, &body.actor)
        .await?;
    Ok(Json(batch))
}

async fn create_payment(
    State(state): State<AppState>,
    Json(request): Json<NewPayment>,
) -> Result<(StatusCode, Json<PaymentTransaction>), ApiError> {
    let payment = state.payments.create_payment_transaction(request).await?;
    Ok((StatusCode::CREATED, Json(payment)))
}

async fn user_payments(
    State(state): State<AppState>,
    Query(query): Query<UserPaymentsQuery>,
) -> ApiResult<Vec<PaymentTransaction>> {
    let limit = query.limit.unwrap_or(DEFAULT_PAGE).clamp(1, MAX_PAGE);
    Ok(Json(state.payments.payments_for_user(&query.user_id, limit).await?))
}

async fn get_payment(
    State(state): State<AppState>,
    Path(payment_id): Path<Uuid>,
) -> ApiResult<PaymentTransaction> {
    Ok(Json(state.payments.get_payment(payment_id).await?))
}

async fn mark_processing(
    State(state): State<AppState>,
    Path(payment_id): Path<Uuid>,
) -> ApiResult<PaymentTransaction> {
    Ok(Json(state.payments.mark_payment_processing(payment_id).await?))
}

async fn cancel_payment(
    State(state): State<AppState>,
    Path(payment_id): Path<Uuid>,
    Json(body): Json<ActorBody>,
) -> ApiResult<PaymentTransaction> {
    Ok(Json(state.payments.cancel_payment(payment_id, &body.actor).await?))
}

async fn gateway_callback(
    State(state): State<AppState>,
    Path(gateway_ref): Path<String>,
    Json(callback): Json<GatewayCallback>,
) -> ApiResult<PaymentUpdate> {
    let update = state
        .payments
        .update_payment_by_gateway_ref(&gateway_ref, callback)
        .await?;
    Ok(Json(update))
}

async fn reconciliation_report(
    State(state): State<AppState>,
    Query(period): Query<PeriodQuery>,
) -> ApiResult<ReconciliationReport> {
    let report = state
        .reconciliation
        .reconciliation_report(period.period_start, period.period_end)
        .await?;
    Ok(Json(report))
}

async fn verify_account(
    State(state): State<AppState>,
    Path(account_id): Path<String>,
) -> ApiResult<BalanceCheck> {
    Ok(Json(state.reconciliation.verify_account(&account_id).await?))
}

async fn verify_partner(
    State(state): State<AppState>,
    Path(partner_id): Path<String>,
) -> ApiResult<BalanceCheck> {
    Ok(Json(state.reconciliation.verify_partner(&partner_id).await?))
}
