//! CAF onboarding correlation engine
//!
//! Takes customer-acquisition-form events off a partitioned queue, starts
//! exactly one process instance per CAF reference, forwards the human
//! approval, routes each activation step to an API or staging table, and
//! turns asynchronous acknowledgments back into engine signals.
//!
//! ## Layout
//! - [`onboarding`]: the engine: ingestion gate, lifecycle manager, zone
//!   routing, correlation tokens, activation router, signal dispatcher
//! - [`clients`]: reqwest adapters for Flowable and the activation backends
//! - `database`: Postgres stores (feature `database`)
//! - `api`: axum routes (feature `server`)

pub mod clients;
pub mod config;
pub mod error;
pub mod onboarding;

#[cfg(feature = "database")]
pub mod database;

#[cfg(feature = "server")]
pub mod api;

pub use config::OnboardingConfig;
pub use error::{OnboardingError, OnboardingResult};
pub use onboarding::{OnboardingDeps, OnboardingServices};
