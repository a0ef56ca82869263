//! Command-line front end. Every command prints one JSON document on stdout;
//! logs go to stderr.

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use invoice_intake_lib::commands::{
    self, AddCreditsPayload, CommandResult, CreateUserPayload, UpdateCellPayload, UpdateFieldPayload,
};
use invoice_intake_lib::types::{FieldPayload, TemplatePayload};
use invoice_intake_lib::{AppState, Config};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::path::{Path, PathBuf};
use std::process::ExitCode;

#[derive(Parser)]
#[command(name = "invoice-intake")]
#[command(about = "Template-driven invoice extraction, correction and ledger push")]
struct Cli {
    /// SQLite database file
    #[arg(long, global = true, env = "INTAKE_DATABASE_PATH")]
    database: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Whether AI credentials are configured
    ExtractionStatus,

    CreateUser { username: String, email: String },

    DeleteUser { user_id: i64 },

    /// Credit balance, totals and recent transactions
    Credits { user_id: i64 },

    AddCredits {
        user_id: i64,
        amount: i64,
        #[arg(long)]
        description: Option<String>,
    },

    CheckCredits {
        user_id: i64,
        #[arg(long, default_value_t = 1)]
        amount: i64,
    },

    /// Charges and refunds recorded for one document
    CreditUsage { document_id: i64 },

    /// Known field names and accepted type tags
    FieldVocabulary,

    /// Create a template from a JSON definition file
    CreateTemplate { user_id: i64, file: PathBuf },

    ShowTemplate { template_id: i64 },

    ListTemplates {
        #[arg(long)]
        user: Option<i64>,
    },

    DeleteTemplate { template_id: i64 },

    /// Add a field from a JSON definition file
    AddField { template_id: i64, file: PathBuf },

    RemoveField { template_id: i64, field_name: String },

    /// Register a document file for a user
    Upload { user_id: i64, path: String },

    ListDocuments { user_id: i64 },

    DeleteDocument { document_id: i64 },

    /// Extract a document against a template
    Process {
        document_id: i64,
        template_id: i64,
        /// Discard prior results first
        #[arg(long)]
        reprocess: bool,
    },

    Results { document_id: i64 },

    Status { document_id: i64 },

    /// Correct a field, or a table cell with --row and --column
    Correct {
        document_id: i64,
        field_name: String,
        value: String,
        #[arg(long, requires = "column")]
        row: Option<i64>,
        #[arg(long, requires = "row")]
        column: Option<String>,
    },

    /// Fail documents stuck in PROCESSING
    Sweep,

    /// Build the ledger voucher for a processed document; --push submits it
    Voucher {
        document_id: i64,
        #[arg(long)]
        push: bool,
    },
}

fn read_json<T: DeserializeOwned>(path: &Path) -> Result<T> {
    let text = std::fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))?;
    serde_json::from_str(&text).with_context(|| format!("parsing {}", path.display()))
}

fn emit<T: Serialize>(result: CommandResult<T>) -> Result<ExitCode> {
    match result {
        Ok(value) => {
            println!("{}", serde_json::to_string_pretty(&value)?);
            Ok(ExitCode::SUCCESS)
        }
        Err(err) => {
            println!("{}", serde_json::to_string_pretty(&serde_json::json!({ "error": err }))?);
            Ok(ExitCode::FAILURE)
        }
    }
}

fn main() -> Result<ExitCode> {
    invoice_intake_lib::init_tracing();
    let cli = Cli::parse();

    let mut config = Config::from_env().context("Failed to load configuration")?;
    if let Some(path) = cli.database {
        config.database_path = path;
    }
    let state = AppState::new(config).context("Failed to initialize")?;

    match cli.command {
        Commands::ExtractionStatus => emit(Ok(commands::get_extraction_status(&state))),
        Commands::CreateUser { username, email } => {
            emit(commands::create_user(&state, CreateUserPayload { username, email }))
        }
        Commands::DeleteUser { user_id } => emit(commands::delete_user(&state, user_id)),
        Commands::Credits { user_id } => emit(commands::get_credit_summary(&state, user_id)),
        Commands::AddCredits {
            user_id,
            amount,
            description,
        } => emit(commands::add_credits(
            &state,
            AddCreditsPayload {
                user_id,
                amount,
                description,
            },
        )),
        Commands::CheckCredits { user_id, amount } => emit(commands::check_credits(&state, user_id, amount)),
        Commands::CreditUsage { document_id } => emit(commands::get_document_credit_usage(&state, document_id)),
        Commands::FieldVocabulary => emit(Ok(commands::list_field_vocabulary())),
        Commands::CreateTemplate { user_id, file } => {
            let payload: TemplatePayload = read_json(&file)?;
            emit(commands::create_template(&state, user_id, payload))
        }
        Commands::ShowTemplate { template_id } => emit(commands::get_template(&state, template_id)),
        Commands::ListTemplates { user } => emit(commands::list_templates(&state, user)),
        Commands::DeleteTemplate { template_id } => emit(commands::delete_template(&state, template_id)),
        Commands::AddField { template_id, file } => {
            let payload: FieldPayload = read_json(&file)?;
            emit(commands::add_field(&state, template_id, payload))
        }
        Commands::RemoveField { template_id, field_name } => {
            emit(commands::remove_field(&state, template_id, &field_name))
        }
        Commands::Upload { user_id, path } => emit(commands::upload_document(&state, user_id, &path)),
        Commands::ListDocuments { user_id } => emit(commands::list_documents(&state, user_id)),
        Commands::DeleteDocument { document_id } => emit(commands::delete_document(&state, document_id)),
        Commands::Process {
            document_id,
            template_id,
            reprocess,
        } => {
            if reprocess {
                emit(commands::reprocess_document(&state, document_id, template_id))
            } else {
                emit(commands::process_document(&state, document_id, template_id))
            }
        }
        Commands::Results { document_id } => emit(commands::get_results(&state, document_id)),
        Commands::Status { document_id } => emit(commands::get_status(&state, document_id)),
        Commands::Correct {
            document_id,
            field_name,
            value,
            row,
            column,
        } => match (row, column) {
            (Some(row_index), Some(column_name)) => emit(commands::update_table_cell_value(
                &state,
                UpdateCellPayload {
                    document_id,
                    field_name,
                    row_index,
                    column_name,
                    value,
                },
            )),
            _ => emit(commands::update_field_value(
                &state,
                UpdateFieldPayload {
                    document_id,
                    field_name,
                    value,
                },
            )),
        },
        Commands::Sweep => emit(commands::sweep_stale(&state)),
        Commands::Voucher { document_id, push } => {
            if push {
                emit(commands::push_voucher(&state, document_id))
            } else {
                emit(commands::preview_voucher(&state, document_id))
            }
        }
    }
}
