use super::handlers;
use super::types::{AppState, Request};
use crate::ipc::error::err;

type Handler = fn(&mut AppState, &Request) -> Option<serde_json::Value>;

// First family claiming the method wins; method prefixes never overlap.
const CHAIN: &[Handler] = &[
    handlers::core::try_handle,
    handlers::students::try_handle,
    handlers::teachers::try_handle,
    handlers::programs::try_handle,
    handlers::enrollments::try_handle,
    handlers::payments::try_handle,
    handlers::cash::try_handle,
    handlers::invoices::try_handle,
    handlers::documents::try_handle,
    handlers::users::try_handle,
    handlers::company::try_handle,
    handlers::settings::try_handle,
    handlers::reports::try_handle,
    handlers::dashboard::try_handle,
    handlers::backup_exchange::try_handle,
];

pub fn handle_request(state: &mut AppState, req: Request) -> serde_json::Value {
    for try_handle in CHAIN {
        if let Some(resp) = try_handle(state, &req) {
            return resp;
        }
    }

    err(
        &req.id,
        "not_implemented",
        format!("unknown method: {}", req.method),
        None,
    )
}
