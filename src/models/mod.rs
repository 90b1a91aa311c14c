//! Domain models for the EcoCup ledger.
//!
//! Wallets, partner wallets, the append-only entry log and the records that
//! drive escrow, settlement and gateway payments.

pub mod actor;
pub mod audit;
pub mod escrow;
pub mod ledger_entry;
pub mod money;
pub mod partner;
pub mod payment;
pub mod settlement;
pub mod wallet;

// Re-export all models for convenient access
pub use actor::Actor;
pub use audit::AuditRecord;
pub use escrow::{
    EscrowHoldReceipt, EscrowPosition, EscrowRelease, EscrowReleaseReceipt, EscrowType,
};
pub use ledger_entry::{EntryType, LedgerEntry, NewEntry, PostedEntry, ReferenceType};
pub use partner::{NewPartner, PartnerStatus, PartnerType, PartnerWallet};
pub use payment::{
    GatewayCallback, NewPayment, PaymentMethod, PaymentStatus, PaymentTransaction,
    PaymentTransactionType, PaymentUpdate,
};
pub use settlement::{split_commission, SettlementBatch, SettlementFilter, SettlementStatus};
pub use wallet::{WalletAccount, WithdrawalLimits};
