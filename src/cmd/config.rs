//! Configuration view command: `buildyard config`.

use anyhow::Result;

use buildyard::config::ServerConfig;

pub fn cmd_config(config: &ServerConfig) -> Result<()> {
    print!("{}", config.to_toml()?);
    if config.github_token.is_some() {
        println!("# github_token is set (hidden)");
    }
    Ok(())
}
