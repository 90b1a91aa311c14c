//! In-process event bus for ledger notifications.
//!
//! Services publish after commit. Delivery (push, email, websocket) happens
//! outside this crate; the binary only runs a dispatcher that logs events.

use crate::models::{LedgerEntry, PaymentStatus, ReferenceType, SettlementStatus};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Event published after a committed ledger operation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum LedgerEvent {
    BalanceChanged {
        account_id: String,
        ledger_id: Uuid,
        reference_type: ReferenceType,
        amount: Decimal,
        balance: Decimal,
    },
    LowBalance {
        account_id: String,
        balance: Decimal,
        threshold: Decimal,
    },
    CommissionAccrued {
        partner_id: String,
        amount: Decimal,
        pending_settlement: Decimal,
    },
    SettlementStatusChanged {
        batch_id: Uuid,
        partner_id: String,
        status: SettlementStatus,
    },
    PaymentStatusChanged {
        payment_id: Uuid,
        user_id: String,
        status: PaymentStatus,
    },
}

/// Broadcast sender shared by all services
#[derive(Clone)]
pub struct LedgerEvents {
    tx: broadcast::Sender<LedgerEvent>,
    low_balance_threshold: Decimal,
}

impl LedgerEvents {
    pub fn new(capacity: usize, low_balance_threshold: Decimal) -> Self {
        let (tx, _) = broadcast::channel(capacity);
        Self {
            tx,
            low_balance_threshold,
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<LedgerEvent> {
        self.tx.subscribe()
    }

    /// Publish to current subscribers. No subscribers is not an error.
    pub fn publish(&self, event: LedgerEvent) {
        if self.tx.send(event).is_err() {
            debug!("No ledger event subscribers");
        }
    }

    /// Publish the balance change for a freshly written user entry, plus a
    /// low-balance warning when the entry crossed the threshold downwards.
    pub fn entry_posted(&self, entry: &LedgerEntry) {
        self.publish(LedgerEvent::BalanceChanged {
            account_id: entry.account_id.clone(),
            ledger_id: entry.ledger_id,
            reference_type: entry.reference_type,
            amount: entry.signed_amount(),
            balance: entry.balance_after,
        });

        if entry.balance_before >= self.low_balance_threshold
            && entry.balance_after < self.low_balance_threshold
        {
            self.publish(LedgerEvent::LowBalance {
                account_id: entry.account_id.clone(),
                balance: entry.balance_after,
                threshold: self.low_balance_threshold,
            });
        }
    }
}

/// Drain the bus until the sender side is gone, logging every event
pub async fn run_dispatcher(mut rx: broadcast::Receiver<LedgerEvent>) {
    loop {
        match rx.recv().await {
            Ok(event) => match serde_json::to_string(&event) {
                Ok(json) => info!(target: "ecocup_ledger::notifications", "{}", json),
                Err(e) => warn!("Failed to serialize ledger event: {}", e),
            },
            Err(broadcast::error::RecvError::Lagged(skipped)) => {
                warn!("Notification dispatcher lagged, skipped {} events", skipped);
            }
            Err(broadcast::error::RecvError::Closed) => break,
        }
    }
    info!("Notification dispatcher stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::NewEntry;
    use chrono::Utc;

    #[tokio::test]
    async fn test_low_balance_fires_only_when_crossing() {
        let events = LedgerEvents::new(16, Decimal::new(20_000, 0));
        let mut rx = events.subscribe();

        let debit = NewEntry::debit("u1", Decimal::new(15_000, 0), ReferenceType::PartnerPayment);
        events.entry_posted(&debit.to_entry(Decimal::new(30_000, 0), Utc::now()));

        assert!(matches!(rx.recv().await.unwrap(), LedgerEvent::BalanceChanged { .. }));
        assert!(matches!(rx.recv().await.unwrap(), LedgerEvent::LowBalance { .. }));

        // already below threshold, no second warning
        let debit = NewEntry::debit("u1", Decimal::new(1_000, 0), ReferenceType::PartnerPayment);
        events.entry_posted(&debit.to_entry(Decimal::new(15_000, 0), Utc::now()));
        assert!(matches!(rx.recv().await.unwrap(), LedgerEvent::BalanceChanged { .. }));
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn test_publish_without_subscribers_is_silent() {
        let events = LedgerEvents::new(4, Decimal::ZERO);
        events.publish(LedgerEvent::PaymentStatusChanged {
            payment_id: Uuid::new_v4(),
            user_id: "u1".to_string(),
            status: PaymentStatus::Completed,
        });
    }
}
