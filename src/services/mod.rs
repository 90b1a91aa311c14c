pub mod audit;
pub mod escrow;
pub mod ledger;
pub mod partner;
pub mod payment;
pub mod reconciliation;
pub mod settlement;
pub mod settlement_scheduler;

pub use audit::AuditTrailService;
pub use escrow::{penalty_fee, EscrowService, HoldRequest, ReleaseRequest, ReturnRequest};
pub use ledger::{post_entry_in, LedgerService, TransferReceipt, TransferRequest};
pub use partner::{
    CommissionRequest, PartnerChargeReceipt, PartnerChargeRequest, PartnerService,
};
pub use payment::PaymentService;
pub use reconciliation::{ReconciliationReport, ReconciliationService};
pub use settlement::SettlementService;
pub use settlement_scheduler::SettlementScheduler;
