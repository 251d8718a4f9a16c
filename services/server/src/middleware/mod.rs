// HTTP middleware: request IDs, CORS, setup gate, auth extraction, rate
// limiting

pub mod auth;
pub mod cors;
pub mod rate_limit;
pub mod request_id;
pub mod setup_gate;
