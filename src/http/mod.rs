//! HTTP surface: the admission middleware in front of the application routes.

mod server;
mod service;

pub use server::HttpServer;
pub use service::{admission_middleware, client_address, router, AppState, ErrorResponse};
