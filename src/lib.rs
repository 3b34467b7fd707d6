// Vote Reconcile - Core Library
// Checks merger-aware municipal vote aggregates against the published
// raw results. Used by the CLI, the API server and the tests.

pub mod model;
pub mod error;
pub mod config;
pub mod db;
pub mod merger_graph;   // Merger Graph Resolver
pub mod dataset;        // Dataset artifacts + store
pub mod locator;        // Raw Result Locator
pub mod aggregate;      // Aggregate Fetcher
pub mod reconciliation; // Reconciliation Engine

#[cfg(feature = "server")]
pub mod api;

// Re-export commonly used types
pub use model::{
    AggregatedTally, BfsCode, MergeableMunicipality, ProposalCode, RawTally, VotingDateSummary,
    compact_date, parse_voting_date,
};
pub use error::{ReconcileError, Result};
pub use config::Config;
pub use db::{get_voting_dates, open_read_only, setup_database};
pub use merger_graph::{MergerEdge, MergerGraph, Predecessor, PredecessorSet};
pub use dataset::{Dataset, DatasetStore};
pub use locator::{LocatedTallies, ProposalTallies};
pub use aggregate::AggregateSource;
pub use reconciliation::{
    FieldComparison, ProposalOutcome, ProposalReconciliation, ReconciliationEngine,
    ReconciliationVerdict, TallyField, ValidationRow, ValidationSummary, VerdictStatus,
};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
