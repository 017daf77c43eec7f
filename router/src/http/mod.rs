pub mod server;
pub(crate) mod types;
