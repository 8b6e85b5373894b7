use clap::Parser;
use log::info;

use svn_operator::config::UpdaterConfig;
use svn_operator::updater::{watch, Updater};

// Events are handled strictly one after the other, a single thread is enough
#[tokio::main(flavor = "current_thread")]
async fn main() -> anyhow::Result<()> {
    // Initialize the logger
    env_logger::init();

    let config = UpdaterConfig::parse();
    info!(
        "Starting the SVN server updater, version {}",
        env!("CARGO_PKG_VERSION")
    );
    info!(
        "Reloading with [{}], creating repositories with [{}] in [{}]",
        config.initd_script.display(),
        config.svnadmin.display(),
        config.repos_dir.display()
    );

    let updater = Updater::new(&config)?;
    watch::run(updater).await?;
    Ok(())
}
