// thand local agent: holds provider sessions on the user's machine and
// bridges the CLI to the login server.

pub mod client;
pub mod handlers;
pub mod routes;
pub mod server;
pub mod state;

pub use state::{AgentState, AgentServices};
