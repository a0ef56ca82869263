use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// What a credit change was for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CreditReference {
    /// Charge for one extraction run; `reference_id` is the document.
    Document,
    /// Return of a charge whose run failed.
    DocumentRefund,
    ManualAddition,
}

impl CreditReference {
    pub fn as_str(self) -> &'static str {
        match self {
            CreditReference::Document => "document",
            CreditReference::DocumentRefund => "document_refund",
            CreditReference::ManualAddition => "manual_addition",
        }
    }
}

impl fmt::Display for CreditReference {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for CreditReference {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "document" => Ok(CreditReference::Document),
            "document_refund" => Ok(CreditReference::DocumentRefund),
            "manual_addition" => Ok(CreditReference::ManualAddition),
            other => Err(format!("unknown credit reference '{}'", other)),
        }
    }
}

/// One row of a user's credit ledger. `amount` is negative for charges.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CreditTransaction {
    pub id: i64,
    pub user_id: i64,
    pub amount: i64,
    pub balance_before: i64,
    pub balance_after: i64,
    pub description: String,
    pub reference_type: CreditReference,
    pub reference_id: Option<i64>,
    pub created_at: String,
}
