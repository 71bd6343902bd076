//! HTTP adapters for the external systems.

pub mod activation;
pub mod flowable;
pub mod provisioning;

pub use activation::HttpActivationApi;
pub use flowable::FlowableClient;
pub use provisioning::HttpIdentityProvisioner;
