//! HTTP interface to the transaction engine.

pub mod server;

pub use server::{
    bind_listener, build_router, serve, start_server, AccountResponse, AppState, EventsResponse,
    RawTransactionRequest, SubmitTransactionResponse,
};
