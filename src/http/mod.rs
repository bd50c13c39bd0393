//! HTTP surface: identity resolution, the admission gate and the server.

mod identity;
mod middleware;
mod server;

pub use identity::{
    extract_client_ip, extract_token, token_tier, IdentityPolicy, RejectReason, Resolution,
    API_KEY_HEADER,
};
pub use middleware::{admission_gate, Gate, RATE_LIMITED_MESSAGE};
pub use server::{default_downstream, gated, HttpServer};
