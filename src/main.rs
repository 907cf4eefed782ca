use anyhow::{Context, Result, bail};
use atnsim::batch::{BatchDispatcher, BatchError, BatchSettings};
use atnsim::config::{ModelConfig, SimulationParameters, check_num};
use atnsim::foodweb::FoodWeb;
use clap::Parser;
use std::{fs::File, io::BufReader, path::PathBuf, sync::Arc};

#[derive(Debug, Parser)]
#[command(version, about)]
struct CLI {
    /// Initial biomass of each simulation, one JSON object per line
    #[arg(short = 'n', long)]
    node_config_file: PathBuf,

    /// Food web in JSON format
    #[arg(short = 'f', long)]
    food_web: PathBuf,

    /// Factor applied to every node-config biomass
    #[arg(short = 'b', long, default_value_t = 1000.0)]
    node_config_biomass_scale: f64,

    #[arg(short = 't', long)]
    timesteps: usize,

    /// Time between recorded timesteps
    #[arg(short = 'i', long, default_value_t = 0.1)]
    step_interval: f64,

    #[arg(short = 'o', long)]
    output_dir: PathBuf,

    /// Always simulate every timestep
    #[arg(short = 'c', long)]
    no_stop_on_steady_state: bool,

    /// Leave the biomass series out of the results
    #[arg(short = 'r', long)]
    no_record_biomass: bool,

    #[arg(short = 'T', long, default_value_t = 4)]
    threads: usize,

    /// Model constants, integrator and detector settings in TOML format
    #[arg(short = 'm', long)]
    model_config: Option<PathBuf>,
}

fn main() {
    env_logger::Builder::new()
        .format_timestamp_millis()
        .filter_level(log::LevelFilter::Info)
        .parse_default_env()
        .init();

    if let Err(error) = run_cli() {
        log::error!("{error:#?}");
        let interrupted = matches!(
            error.downcast_ref::<BatchError>(),
            Some(BatchError::Interrupted)
        );
        std::process::exit(if interrupted { 130 } else { 1 });
    }
}

fn run_cli() -> Result<()> {
    let args = CLI::parse();
    log::info!("{args:#?}");

    let parameters = SimulationParameters {
        timesteps: args.timesteps,
        step_size: args.step_interval,
        stop_on_steady_state: !args.no_stop_on_steady_state,
        record_biomass: !args.no_record_biomass,
    };
    parameters
        .validate()
        .context("invalid simulation parameters")?;
    check_num(args.node_config_biomass_scale, 0.0..f64::INFINITY)
        .context("invalid biomass scale")?;
    check_num(args.threads, 1..=1024).context("invalid number of threads")?;

    let model = match &args.model_config {
        Some(file) => ModelConfig::from_file(file).context("failed to load model config")?,
        None => ModelConfig::default(),
    };

    let web = FoodWeb::from_file(&args.food_web)
        .with_context(|| format!("failed to load food web {:?}", args.food_web))?;
    log::info!(
        "loaded food web with {} nodes and {} links",
        web.node_count(),
        web.link_count()
    );

    let file = &args.node_config_file;
    let records = File::open(file).with_context(|| format!("failed to open {file:?}"))?;

    let mut settings = BatchSettings::new(parameters, &args.output_dir);
    settings.model = model;
    settings.biomass_scale = args.node_config_biomass_scale;
    settings.threads = args.threads;

    let dispatcher = BatchDispatcher::new(Arc::new(web), settings);
    let handle = dispatcher.handle();
    ctrlc::set_handler(move || {
        log::warn!("interrupt received, stopping batch");
        handle.interrupt();
    })
    .context("failed to install interrupt handler")?;

    let reports = dispatcher
        .run(BufReader::new(records))
        .context("failed to run batch")?;

    let failed = reports.iter().filter(|r| r.outcome.is_err()).count();
    log::info!(
        "{} of {} simulations completed",
        reports.len() - failed,
        reports.len()
    );
    if failed > 0 {
        bail!("{failed} simulations failed");
    }

    Ok(())
}
