use std::{
    path::PathBuf,
    process,
    sync::{Arc, Mutex},
    thread,
    time::Duration,
};

use structopt::StructOpt;
use tracing::info;
use tracing_subscriber::{filter::EnvFilter, FmtSubscriber};

use anoq_node::{run_client, settings::DEFAULT_CONFIG_FILE, Settings};
use anoq_smart_meters::{meter_data_source, DeviceConfig, SimSmartMeter};

#[derive(Debug, StructOpt)]
#[structopt(
    name = "smart-meter-client",
    about = "A simulated smart meter participating in anonymous aggregation queries"
)]
struct Opt {
    /// Device power-cycle data table
    #[structopt(parse(from_os_str))]
    power_file: PathBuf,
    /// Device usage-frequency data table
    #[structopt(parse(from_os_str))]
    frequency_file: PathBuf,
    /// Device hourly start-probability data table
    #[structopt(parse(from_os_str))]
    probability_file: PathBuf,
    /// Device household-saturation data table
    #[structopt(parse(from_os_str))]
    saturation_file: PathBuf,
    /// Path of the configuration file
    #[structopt(parse(from_os_str))]
    config_file: Option<PathBuf>,
}

#[tokio::main]
async fn main() {
    let opt = Opt::from_args();
    let config_path = opt
        .config_file
        .unwrap_or_else(|| PathBuf::from(DEFAULT_CONFIG_FILE));

    let settings = Settings::new(&config_path).unwrap_or_else(|err| {
        eprintln!("{}", err);
        process::exit(1);
    });
    FmtSubscriber::builder()
        .with_env_filter(EnvFilter::new(&settings.log.filter))
        .init();

    let simulation = settings.simulation.unwrap_or_else(|| {
        eprintln!("the [Simulation] section is required to run a simulated meter");
        process::exit(1);
    });
    let device_config = DeviceConfig::load(
        &opt.power_file,
        &opt.frequency_file,
        &opt.probability_file,
        &opt.saturation_file,
    )
    .unwrap_or_else(|err| {
        eprintln!("{:#}", err);
        process::exit(1);
    });

    let meter = Arc::new(Mutex::new(SimSmartMeter::generate(
        &device_config,
        simulation.percent_poor_homes,
        simulation.percent_rich_homes,
        simulation.usage_timestep_min,
        &mut rand::thread_rng(),
    )));

    // The household lives on its own thread; the protocol only ever reads
    // the usage it has accumulated so far.
    let simulated_meter = meter.clone();
    let total_timesteps = simulation.total_timesteps * simulation.simulation_days;
    let timestep = Duration::from_millis(simulation.ms_per_timestep);
    thread::spawn(move || {
        for _ in 0..total_timesteps {
            simulated_meter.lock().unwrap().simulate_usage_timestep();
            thread::sleep(timestep);
        }
        info!("simulation finished after {} timesteps", total_timesteps);
    });

    if let Err(err) = run_client(&settings, meter_data_source(meter)).await {
        eprintln!("{:#}", err);
        process::exit(1);
    }
}
