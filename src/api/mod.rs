//! HTTP surface (feature `server`).

pub mod onboarding_routes;

pub use onboarding_routes::{onboarding_router, ApiError, OnboardingApiState};
