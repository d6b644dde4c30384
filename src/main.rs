use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;
use tracing::info;
use tracing_subscriber::EnvFilter;

use storaged::store::PersistentStore;
use storaged::{bus, Collaborators, Config, Daemon};

#[derive(Debug, Parser)]
#[command(name = "storaged", about = "Daemon for managing local storage")]
struct Args {
    /// Path to the configuration file.
    #[arg(long, default_value = storaged::config::CONFIG_FILE)]
    config: PathBuf,
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_env("STORAGED_LOG").unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let _ = gettextrs::setlocale(gettextrs::LocaleCategory::LcAll, "");
    let _ = gettextrs::bindtextdomain("storaged", "/usr/share/locale");
    let _ = gettextrs::textdomain("storaged");

    let args = Args::parse();
    let config = Config::load(&args.config)?;

    let store = Arc::new(PersistentStore::new(
        &config.durable_state_dir,
        &config.runtime_state_dir,
    )?);
    let collaborators = Collaborators::system()?;
    let bus_name = config.bus_name.clone();
    let daemon = Daemon::new(config, store, collaborators);
    daemon.start();

    info!("storaged version {} starting", env!("CARGO_PKG_VERSION"));

    zbus::block_on(serve(daemon, bus_name))?;
    Ok(())
}

async fn serve(daemon: Arc<Daemon>, bus_name: String) -> zbus::Result<()> {
    let connection = zbus::connection::Builder::system()?
        .name(bus_name.as_str())?
        .build()
        .await?;

    for object_path in daemon.mdraid_object_paths() {
        bus::export_mdraid(&connection, Arc::clone(&daemon), &object_path).await?;
    }

    std::future::pending::<()>().await;
    Ok(())
}
