pub mod app_state;
pub mod config;
pub mod handlers;
pub mod models;
pub mod providers;
pub mod refresher;
pub mod server;
pub mod session;
pub mod store;

#[cfg(test)]
pub(crate) mod test_util;
