// Public API for the HTTP route layer and the backend contract test suite

pub mod backend;
pub mod config;
pub mod credential;
pub mod csrf;
pub mod error;
pub mod rate_limit;
pub mod session;
pub mod store;
pub mod types;
