//! Gapwatch request surface - parameter parsing, validation and responses
//! for every public operation.
//!
//! The surface is transport-neutral: callers build an [`ApiRequest`] from
//! whatever front end they run and receive an [`ApiResponse`] carrying a
//! status code, a content type and a body.
//!
//! | method | route | operation |
//! |---|---|---|
//! | POST | `/bootstrap` | create the schema (idempotent) |
//! | POST | `/configure` | register collections, record tolerances, backfill |
//! | GET | `/gaps` | query gaps |
//! | GET | `/known-gaps` | list known-gap reasons |
//! | PUT | `/known-gaps` | create, update or delete reasons |
//! | GET | `/report` | latest completeness report |
//!
//! # Examples
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use gapwatch_api::{ApiRequest, GapApi, Method};
//! use gapwatch_core::catalog::StaticCatalog;
//! use gapwatch_core::{Gapwatch, GapwatchConfig};
//!
//! # async fn example() -> anyhow::Result<()> {
//! let gapwatch = Gapwatch::open(GapwatchConfig::default(), Arc::new(StaticCatalog::new())).await?;
//! let api = GapApi::new(gapwatch);
//!
//! let request = ApiRequest::new()
//!     .param("short_name", "MOD09")
//!     .param("version", "6.1")
//!     .param("tolerance", "true");
//! let response = api.handle(Method::Get, "/gaps", &request).await;
//! println!("{} {}", response.status, response.body);
//! # Ok(())
//! # }
//! ```

pub mod error;
pub mod handlers;
pub mod params;
pub mod request;

pub use error::{ApiError, Result};
pub use handlers::GapApi;
pub use request::{ApiRequest, ApiResponse, Method};
