//! # dbfan-query
//!
//! Core of the dbfan multi-backend query fan-out.
//!
//! The crate turns heterogeneous database results into uniform records and runs
//! one query against many configured targets at once:
//!
//! - **RowCursor / materialize**: drain a backend cursor into `Vec<Record>`, with a row limit
//! - **BackendHandle**: lazily connected executor for one configured target
//! - **HandleRegistry**: identifier to handle mapping shared by dispatches
//! - **Dispatcher**: concurrent fan-out with one `Outcome` per request
//!
//! ## Example
//!
//! ```rust,no_run
//! use dbfan_query::{BatchTemplate, Dispatcher, HandleRegistry};
//! use std::sync::Arc;
//!
//! # async fn example() -> dbfan_query::Result<()> {
//! let registry = Arc::new(HandleRegistry::new());
//! // registry.register("main", Arc::new(connector)).await;
//!
//! let dispatcher = Dispatcher::new(registry);
//! let template = BatchTemplate::new(vec!["main".to_string()], "SELECT 1 AS one", 10);
//!
//! for outcome in dispatcher.dispatch_batch(&template).await? {
//!     println!("{}: {:?}", outcome.target, outcome.result());
//! }
//! # Ok(())
//! # }
//! ```
//!
//! ## Backend Implementation
//!
//! Backend crates provide a `Connector` that builds an `Executor`. The executor
//! returns a `RowCursor`; the materializer and dispatcher do the rest.
//! - `dbfan-query-postgres`
//! - `dbfan-query-sqlite`
//! - `dbfan-query-mongodb`
//! - `dbfan-query-elasticsearch`
//! - `dbfan-query-redis`

pub mod backend;
pub mod cursor;
pub mod dispatcher;
pub mod error;
pub mod escape;
pub mod registry;
pub mod request;
pub mod types;

// Re-export commonly used items
pub use backend::{BackendHandle, Connector, Executor};
pub use cursor::{decode_json, materialize, BufferedCursor, RowCursor};
pub use dispatcher::{DispatchOptions, Dispatcher, Outcome};
pub use error::{DataError, Result};
pub use registry::HandleRegistry;
pub use request::{BatchTemplate, QueryRequest, Statement};
pub use types::{
    effective_limit, BackendFamily, BackendKind, Column, Query, Record, ScanKind, Scanned, Value,
    DEFAULT_LIMIT,
};
