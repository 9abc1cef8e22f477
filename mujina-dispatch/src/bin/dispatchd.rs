use mujina_dispatch::config::Config;
use mujina_dispatch::daemon::Daemon;
use mujina_dispatch::tracing::{self, prelude::*};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing::init_journald_or_stdout();

    let config = match Config::from_env() {
        Ok(config) => config,
        Err(e) => {
            error!("Invalid configuration: {e:#}");
            return Err(e);
        }
    };

    let daemon = Daemon::start(config).await?;
    daemon.run().await
}
