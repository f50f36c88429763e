//! Headless field simulator

use clap::Parser as _;
use color_eyre::eyre::Result;
use tracing_subscriber::{layer::SubscriberExt as _, util::SubscriberInitExt as _, Layer as _};

mod config;
mod controller;
mod rule;
mod seed;
/// Various ways to output data.
mod output {
    pub mod png;
}

/// How many ticks pass between progress reports.
const REPORT_EVERY: u32 = 20;

fn main() -> Result<()> {
    color_eyre::install()?;
    setup_logging()?;

    let config = crate::config::Config::parse();
    tracing::info!("Initialising with config: {config:?}");

    let context = cellfield::ExecutionContext::new(config.compute)?;
    let mut controller = crate::controller::FieldController::new(context, config.settings())?;
    tracing::info!("Seeded field has a mean energy of {}", controller.average());

    tracing::info!("Starting simulation");
    for tick in 1..=config.ticks {
        if let (Some(at), Some(size)) = (config.resize_at, config.resize_to) {
            if tick == at {
                controller.resize(size)?;
            }
        }
        let average = controller.tick()?;
        if tick % REPORT_EVERY == 0 || tick == config.ticks {
            tracing::info!(
                "Tick {tick}, generation {}: mean energy {average:.4}",
                controller.engine().generation()
            );
        }
    }

    let field = controller.field()?;
    let energy = field.channel(0)?;
    let path = config.output_dir.join("field.png");
    crate::output::png::save(&energy, field.width(), field.height(), &path)?;

    tracing::debug!("Final engine stats: {:?}", controller.engine().stats());
    controller.dispose()?;

    Ok(())
}

/// Setup logging.
fn setup_logging() -> Result<()> {
    let filters = tracing_subscriber::EnvFilter::builder()
        .with_default_directive("info".parse()?)
        .from_env_lossy();
    let filter_layer = tracing_subscriber::fmt::layer().with_filter(filters);
    let tracing_setup = tracing_subscriber::registry().with(filter_layer);
    tracing_setup.init();

    Ok(())
}
