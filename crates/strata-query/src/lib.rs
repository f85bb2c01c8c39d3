//! Strata Query Federation
//!
//! Single entry point for range queries. A [`QueryEngine`] reads the local
//! Block Store and the object archive concurrently and returns one merged,
//! deduplicated series set at the resolution the range calls for.
//!
//! ```ignore
//! let engine = QueryEngine::new(store, remote, QueryConfig::default());
//! let request = QueryRequest::new(SeriesMatcher::parse(r#"cpu{host="a"}"#)?, start, end);
//! let response = engine.query(&request).await?;
//! if response.partial {
//!     // the archive was unreachable; response.warnings says why
//! }
//! ```

pub mod config;
pub mod engine;
pub mod error;

pub use config::QueryConfig;
pub use engine::{QueryEngine, QueryRequest, QueryResponse};
pub use error::{QueryError, Result};
