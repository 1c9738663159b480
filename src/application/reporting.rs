use serde::{Deserialize, Serialize};

use crate::domain::{Cents, Entry, Month, flow_totals};

/// Inflows and outflows of one calendar month.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MonthlySummary {
    pub period: Month,
    pub inflows: Cents,
    pub outflows: Cents,
    pub net: Cents,
}

impl MonthlySummary {
    pub fn from_entries(period: Month, entries: &[Entry]) -> Self {
        let (inflows, outflows) = flow_totals(entries);
        Self {
            period,
            inflows,
            outflows,
            net: inflows - outflows,
        }
    }
}

/// Outcome of a transfer: both ledger lines plus a message for the caller.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransferReceipt {
    pub sent: Entry,
    pub received: Entry,
    pub recipient_email: String,
    pub message: String,
}
