pub mod client;
pub mod credentials;
pub mod dispatcher;
pub mod error;
pub mod inline;
pub mod mutations;
pub mod reconciler;
pub mod session;
pub mod store;
pub mod telemetry;
pub mod transport;
pub mod types;

pub use client::CreditsClient;
