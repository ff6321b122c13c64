pub mod assets;
pub mod config;
pub mod errors;
pub mod jobs;
pub mod logging;
pub mod model;
pub mod ops;
pub mod server;
pub mod services;

#[cfg(test)]
pub(crate) mod testing;
