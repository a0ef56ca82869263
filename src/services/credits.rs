use crate::config::CreditConfig;
use crate::db::Db;
use crate::error::{IntakeError, Result};
use crate::models::{CreditReference, CreditTransaction};
use crate::types::{CreditCheck, CreditSummary, DocumentCreditUsage};
use std::sync::Arc;
use tracing::{info, warn};

const RECENT_TRANSACTIONS: usize = 20;

/// Per-user credit balance. Each extraction run costs
/// [`CreditConfig::cost_per_document`]; a run that errors is refunded.
pub struct CreditService {
    db: Arc<Db>,
    config: CreditConfig,
}

impl CreditService {
    pub fn new(db: Arc<Db>, config: CreditConfig) -> Self {
        Self { db, config }
    }

    pub fn check(&self, user_id: i64, required: i64) -> Result<CreditCheck> {
        if required <= 0 {
            return Err(IntakeError::Validation("required credits must be positive".to_string()));
        }
        let current_balance = self.db.credit_balance(user_id)?;
        let sufficient = current_balance >= required;
        let message = if sufficient {
            "Sufficient credits available".to_string()
        } else {
            format!("Insufficient credits. Required: {}, Available: {}", required, current_balance)
        };
        Ok(CreditCheck {
            user_id,
            required,
            current_balance,
            sufficient,
            message,
        })
    }

    pub fn add(&self, user_id: i64, amount: i64, description: Option<&str>) -> Result<CreditTransaction> {
        if amount <= 0 {
            return Err(IntakeError::Validation("amount must be positive".to_string()));
        }
        let description = description
            .map(str::trim)
            .filter(|d| !d.is_empty())
            .unwrap_or("Manual credit addition");
        let entry = self.db.add_credits(user_id, amount, description)?;
        info!(user_id, amount, balance = entry.balance_after, "credits added");
        Ok(entry)
    }

    /// Grants the configured opening balance to a new user.
    pub fn open_account(&self, user_id: i64) -> Result<Option<CreditTransaction>> {
        if self.config.starting_balance == 0 {
            return Ok(None);
        }
        self.db
            .add_credits(user_id, self.config.starting_balance, "Opening balance")
            .map(Some)
    }

    pub fn summary(&self, user_id: i64) -> Result<CreditSummary> {
        let current_balance = self.db.credit_balance(user_id)?;
        let all = self.db.credit_transactions(user_id, None)?;
        let mut total_added = 0;
        let mut total_spent = 0;
        let mut total_refunded = 0;
        for t in &all {
            match t.reference_type {
                CreditReference::DocumentRefund => total_refunded += t.amount,
                _ if t.amount < 0 => total_spent -= t.amount,
                _ => total_added += t.amount,
            }
        }
        Ok(CreditSummary {
            user_id,
            current_balance,
            total_added,
            total_spent,
            total_refunded,
            transaction_count: all.len(),
            recent_transactions: all.into_iter().take(RECENT_TRANSACTIONS).collect(),
        })
    }

    /// `None` when the document was never charged.
    pub fn document_usage(&self, document_id: i64) -> Result<Option<DocumentCreditUsage>> {
        let transactions = self.db.document_credit_transactions(document_id)?;
        if transactions.is_empty() {
            return Ok(None);
        }
        let net: i64 = transactions.iter().map(|t| t.amount).sum();
        Ok(Some(DocumentCreditUsage {
            document_id,
            net_cost: net.abs(),
            has_refund: transactions
                .iter()
                .any(|t| t.reference_type == CreditReference::DocumentRefund),
            transactions,
        }))
    }

    /// Charges the document's owner, runs `run`, and refunds the charge if it
    /// returns an error.
    pub fn charged<T>(&self, document_id: i64, run: impl FnOnce() -> Result<T>) -> Result<T> {
        let cost = self.config.cost_per_document;
        if cost == 0 {
            return run();
        }
        let charge = self.db.charge_document(document_id, cost)?;
        info!(document_id, cost, balance = charge.balance_after, "credits charged");
        let result = run();
        if result.is_err() {
            match self.db.refund_document(document_id) {
                Ok(Some(refund)) => info!(document_id, amount = refund.amount, "credits refunded"),
                Ok(None) => {}
                Err(err) => warn!(document_id, error = %err, "refund failed"),
            }
        }
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn service(cost: i64, starting_balance: i64) -> (CreditService, Arc<Db>, i64) {
        let db = Arc::new(Db::open_in_memory().unwrap());
        let user = db.create_user("ana", "ana@example.com").unwrap();
        let svc = CreditService::new(db.clone(), CreditConfig { cost_per_document: cost, starting_balance });
        svc.open_account(user).unwrap();
        (svc, db, user)
    }

    #[test]
    fn check_reports_shortfall() {
        let (svc, _, user) = service(1, 2);
        assert!(svc.check(user, 2).unwrap().sufficient);
        let short = svc.check(user, 5).unwrap();
        assert!(!short.sufficient);
        assert_eq!(short.message, "Insufficient credits. Required: 5, Available: 2");
        assert!(matches!(svc.check(user, 0), Err(IntakeError::Validation(_))));
        assert!(matches!(svc.add(user, -1, None), Err(IntakeError::Validation(_))));
    }

    #[test]
    fn failed_run_is_refunded_and_summarized() {
        let (svc, db, user) = service(1, 3);
        let doc = db.insert_document(user, "/tmp/a.pdf", "a.pdf").unwrap();

        svc.charged(doc, || Ok(())).unwrap();
        let err = svc
            .charged(doc, || -> Result<()> { Err(IntakeError::State("busy".into())) })
            .unwrap_err();
        assert!(matches!(err, IntakeError::State(_)));
        assert_eq!(db.credit_balance(user).unwrap(), 2);

        let usage = svc.document_usage(doc).unwrap().unwrap();
        assert_eq!(usage.net_cost, 1);
        assert!(usage.has_refund);
        assert_eq!(usage.transactions.len(), 3);

        let summary = svc.summary(user).unwrap();
        assert_eq!(
            (summary.current_balance, summary.total_added, summary.total_spent, summary.total_refunded),
            (2, 3, 2, 1)
        );
        assert_eq!(summary.transaction_count, 4);
        assert!(svc.document_usage(999).unwrap().is_none());
    }

    #[test]
    fn empty_balance_blocks_the_run() {
        let (svc, db, user) = service(1, 0);
        let doc = db.insert_document(user, "/tmp/a.pdf", "a.pdf").unwrap();
        let mut ran = false;
        let err = svc
            .charged(doc, || {
                ran = true;
                Ok(())
            })
            .unwrap_err();
        assert!(matches!(err, IntakeError::InsufficientCredits { required: 1, available: 0 }));
        assert!(!ran);

        let free = CreditService::new(db.clone(), CreditConfig { cost_per_document: 0, starting_balance: 0 });
        free.charged(doc, || Ok(())).unwrap();
        assert!(db.credit_transactions(user, None).unwrap().is_empty());
    }
}
