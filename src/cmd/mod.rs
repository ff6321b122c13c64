//! CLI command implementations.
//!
//! | Module   | Commands handled  |
//! |----------|-------------------|
//! | `serve`  | `Serve`           |
//! | `fleet`  | `Sync`, `Stale`   |
//! | `config` | `Config`          |

pub mod config;
pub mod fleet;
pub mod serve;

pub use config::cmd_config;
pub use fleet::{cmd_stale, cmd_sync};
pub use serve::cmd_serve;
