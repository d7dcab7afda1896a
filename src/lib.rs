//! Ledgerlink core library
//!
//! Keeps stock levels, purchases, sales, derived items and the relationship
//! graph between them consistent over pluggable storage backends.
#![forbid(unsafe_code)]
#![deny(rust_2018_idioms)]
#![warn(clippy::all, clippy::perf, clippy::dbg_macro)]

pub mod cache;
pub mod config;
pub mod db;
pub mod entities;
pub mod errors;
pub mod handlers;
pub mod models;
pub mod providers;
pub mod repositories;
pub mod schema;
pub mod services;
pub mod storage;

pub use errors::ServiceError;
pub use handlers::{router, AppState};
pub use providers::ProviderRegistry;
pub use services::{ServiceContainer, ServiceFactory};
