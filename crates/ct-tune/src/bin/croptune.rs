use std::sync::Arc;

use clap::Parser;
use tracing_subscriber::EnvFilter;

use ct_data::DataManager;
use ct_model::ModelRegistry;
use ct_tune::{CropTrainable, ExperimentCatalog, TuneArgs, TuneRunner};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let args = TuneArgs::parse();
    let config = args.tune_config()?;
    let data_root = ct_data::data_root()?;

    let catalog = ExperimentCatalog::new(&data_root).with_metric(&config.metric, config.direction);
    let mut definition = catalog.definition(&args.experiment, &config.experiment_dir())?;
    definition.template = args.apply(definition.template);

    let registry = Arc::new(ModelRegistry::new());
    definition.template.check_model(&registry)?;

    let data = Arc::new(DataManager::with_data_root(&data_root));
    let factory = CropTrainable::factory(data, registry);

    let mut runner = TuneRunner::new(config, definition, factory);
    if let Some(path) = &args.export {
        runner = runner.with_export(path);
    }

    let stop = runner.stop_handle();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::warn!("Interrupted; checkpointing running trials");
            stop.request_stop();
        }
    });

    let analysis = tokio::task::spawn_blocking(move || runner.run()).await??;
    match analysis.best_config() {
        Some(best) => println!("Best config is {best}"),
        None => println!("No trial finished with a {} value", analysis.metric),
    }
    Ok(())
}
