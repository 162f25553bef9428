//! Query execution and result presentation.

mod executor;
mod visualization;

pub use executor::{ExecutedQuery, QueryExecutor, SqlExecutor};
pub use visualization::{enrich_visualization, LegendEntry, Visualization, PALETTE};
