//! Runtime configuration, read from the environment.
//!
//! `.env` files are loaded from the per-user data directory first (so an
//! installed build can keep credentials there), then from the working directory.
//! Variables already set in the process environment win over both.

use crate::error::{IntakeError, Result};
use std::path::PathBuf;
use std::time::Duration;

pub const APP_DIR_NAME: &str = "invoice-intake";

#[derive(Debug, Clone)]
pub struct GeminiConfig {
    pub api_key: Option<String>,
    pub model: String,
    pub endpoint: String,
    pub timeout: Duration,
}

impl GeminiConfig {
    pub fn is_configured(&self) -> bool {
        self.api_key.as_deref().map(|k| !k.trim().is_empty()).unwrap_or(false)
    }
}

/// Master-data defaults used when mapping invoices onto vouchers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VoucherDefaults {
    pub unit: String,
    pub godown: String,
    pub batch: String,
    pub purchase_ledger: String,
    pub supplier_group: String,
    pub stock_group: String,
}

impl Default for VoucherDefaults {
    fn default() -> Self {
        Self {
            unit: "PCS".to_string(),
            godown: "Main Location".to_string(),
            batch: "Primary Batch".to_string(),
            purchase_ledger: "Imported Goods".to_string(),
            supplier_group: "Sundry Creditors".to_string(),
            stock_group: "Primary".to_string(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct TallyConfig {
    pub url: String,
    pub company: Option<String>,
    pub timeout: Duration,
    pub defaults: VoucherDefaults,
}

/// Credit accounting for extraction runs. A zero cost turns charging off.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CreditConfig {
    pub cost_per_document: i64,
    pub starting_balance: i64,
}

impl Default for CreditConfig {
    fn default() -> Self {
        Self {
            cost_per_document: 1,
            starting_balance: 0,
        }
    }
}

#[derive(Debug, Clone)]
pub struct Config {
    pub database_path: PathBuf,
    pub gemini: GeminiConfig,
    /// A PROCESSING document older than this may be taken over or failed.
    pub processing_timeout: Duration,
    pub tally: TallyConfig,
    pub credits: CreditConfig,
}

/// Per-user data directory for the app, if the platform has one.
pub fn app_data_dir() -> Option<PathBuf> {
    dirs::data_dir().map(|d| d.join(APP_DIR_NAME))
}

pub fn load_env() {
    if let Some(dir) = app_data_dir() {
        let env_path = dir.join(".env");
        if env_path.exists() {
            let _ = dotenvy::from_path(&env_path);
        }
    }
    let _ = dotenvy::dotenv();
}

fn var(name: &str) -> Option<String> {
    std::env::var(name).ok().map(|v| v.trim().to_string()).filter(|v| !v.is_empty())
}

fn var_or(name: &str, default: &str) -> String {
    var(name).unwrap_or_else(|| default.to_string())
}

fn credits_var(name: &str, default: i64) -> Result<i64> {
    match var(name) {
        None => Ok(default),
        Some(raw) => raw
            .parse::<i64>()
            .ok()
            .filter(|n| *n >= 0)
            .ok_or_else(|| IntakeError::Config(format!("{} must be a non-negative whole number, got '{}'", name, raw))),
    }
}

fn secs_var(name: &str, default: u64) -> Result<Duration> {
    match var(name) {
        None => Ok(Duration::from_secs(default)),
        Some(raw) => raw
            .parse::<u64>()
            .map(Duration::from_secs)
            .map_err(|_| IntakeError::Config(format!("{} must be a whole number of seconds, got '{}'", name, raw))),
    }
}

impl Config {
    /// Loads `.env` files, then reads the environment.
    pub fn from_env() -> Result<Self> {
        load_env();
        Self::from_current_env()
    }

    /// Reads the process environment without touching `.env` files.
    pub fn from_current_env() -> Result<Self> {
        let database_path = match var("INTAKE_DATABASE_PATH") {
            Some(p) => PathBuf::from(p),
            None => app_data_dir()
                .map(|d| d.join("intake.db"))
                .ok_or_else(|| IntakeError::Config("no data directory; set INTAKE_DATABASE_PATH".to_string()))?,
        };
        let gemini = GeminiConfig {
            api_key: var("GEMINI_API_KEY"),
            model: var_or("GEMINI_MODEL", "gemini-2.0-flash"),
            endpoint: var_or("GEMINI_ENDPOINT", "https://generativelanguage.googleapis.com/v1beta")
                .trim_end_matches('/')
                .to_string(),
            timeout: secs_var("GEMINI_TIMEOUT_SECS", 120)?,
        };
        let base = VoucherDefaults::default();
        let tally = TallyConfig {
            url: var_or("TALLY_URL", "http://localhost:9000"),
            company: var("TALLY_COMPANY"),
            timeout: secs_var("TALLY_TIMEOUT_SECS", 30)?,
            defaults: VoucherDefaults {
                unit: var_or("TALLY_DEFAULT_UNIT", &base.unit),
                godown: var_or("TALLY_DEFAULT_GODOWN", &base.godown),
                batch: var_or("TALLY_DEFAULT_BATCH", &base.batch),
                purchase_ledger: var_or("TALLY_PURCHASE_LEDGER", &base.purchase_ledger),
                supplier_group: var_or("TALLY_SUPPLIER_GROUP", &base.supplier_group),
                stock_group: var_or("TALLY_STOCK_GROUP", &base.stock_group),
            },
        };
        Ok(Config {
            database_path,
            gemini,
            processing_timeout: secs_var("PROCESSING_TIMEOUT_SECS", 300)?,
            tally,
            credits: CreditConfig {
                cost_per_document: credits_var("OCR_CREDIT_COST", 1)?,
                starting_balance: credits_var("STARTING_CREDITS", 0)?,
            },
        })
    }

    /// `"configured"` or `"not_configured"` for the AI credentials.
    pub fn extraction_status(&self) -> &'static str {
        if self.gemini.is_configured() {
            "configured"
        } else {
            "not_configured"
        }
    }
}
