pub mod correction;
pub mod credits;
pub mod ingestion;
pub mod schema_registry;
pub mod sink;

pub use correction::CorrectionService;
pub use credits::CreditService;
pub use ingestion::{IngestionEngine, IngestionMode};
pub use schema_registry::SchemaRegistry;
pub use sink::{LedgerConnector, SinkReport, SinkService};
