use clap::Parser;
use log::info;

use svn_operator::config::OperatorConfig;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize the logger
    env_logger::init();

    let config = OperatorConfig::parse();
    info!(
        "Starting the SVN operator, version {}",
        env!("CARGO_PKG_VERSION")
    );

    let client = kube::Client::try_default().await?;
    svn_operator::operator::run(client, config).await?;
    Ok(())
}
