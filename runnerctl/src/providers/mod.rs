pub mod azure;
pub mod fake;
pub mod gcp;
pub mod provider;
pub mod token;
