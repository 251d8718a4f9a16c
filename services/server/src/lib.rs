// thand control plane server: authentication gateway, elevation engine and
// provider registry.

pub mod elevation;
pub mod error;
pub mod handlers;
pub mod llm;
pub mod metrics;
pub mod middleware;
pub mod providers;
pub mod routes;
pub mod saml;
pub mod server;
pub mod services;

pub use services::{AppState, Services};
