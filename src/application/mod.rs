pub mod admin_api;
pub mod engine;
pub mod runtime;
