#[global_allocator]
static GLOBAL: mimalloc::MiMalloc = mimalloc::MiMalloc;

use std::sync::Arc;

use fscp_node::config::Config;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = Arc::new(Config::load()?);
    simple_logger::init_with_level(config.log.level.as_level())?;

    if config.tap.enabled {
        log::warn!(
            "no platform virtual interface driver is wired into this build; \
             running as a pure relay node"
        );
    }

    let handle = fscp_node::startup(config, None).await?;

    // The node runs entirely on background tasks; keep the process alive
    // until it is killed.
    let _handle = handle;
    std::future::pending::<()>().await;

    Ok(())
}
