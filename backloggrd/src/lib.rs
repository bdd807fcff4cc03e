pub mod config;
pub mod connectivity;
pub mod library;
pub mod runtime;
pub mod session;
pub mod store;
pub mod sync;
