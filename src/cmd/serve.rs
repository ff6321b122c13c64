//! HTTP server command: `buildyard serve`.

use anyhow::Result;

use buildyard::config::ServerConfig;

pub async fn cmd_serve(config: ServerConfig) -> Result<()> {
    buildyard::server::start_server(config).await
}
