use std::{path::PathBuf, process};

use structopt::StructOpt;
use tokio::sync::mpsc;
use tracing::info;
use tracing_subscriber::{filter::EnvFilter, FmtSubscriber};

use anoq_core::message::QueryRequest;
use anoq_node::{run_server, settings::DEFAULT_CONFIG_FILE, ServerCommand, Settings};
use anoq_smart_meters::{
    UsageVector, MEASURE_CONSUMPTION, MEASURE_DAILY_CONSUMPTION,
    MEASURE_SHIFTABLE_CONSUMPTION, NO_FILTER, SUM_VECTORS,
};

#[derive(Debug, StructOpt)]
#[structopt(
    name = "smart-meter-server",
    about = "The utility issuing anonymous aggregation queries to a fleet of smart meters"
)]
struct Opt {
    /// Path of the configuration file
    #[structopt(parse(from_os_str))]
    config_file: Option<PathBuf>,
}

/// One query per timestep window, cycling through the measurement kinds.
fn build_queries(num_queries: u32, window_minutes: u32) -> Vec<QueryRequest> {
    (0..num_queries)
        .map(|index| {
            let select = match index % 3 {
                0 => MEASURE_CONSUMPTION,
                1 => MEASURE_SHIFTABLE_CONSUMPTION,
                _ => MEASURE_DAILY_CONSUMPTION,
            };
            QueryRequest {
                query_number: index as i32,
                select_function_opcode: select,
                filter_function_opcode: NO_FILTER,
                aggregate_function_opcode: SUM_VECTORS,
                select_serialized_args: window_minutes.to_le_bytes().to_vec(),
                filter_serialized_args: Vec::new(),
                aggregate_serialized_args: Vec::new(),
            }
        })
        .collect()
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
        eprintln!("the [Simulation] section is required to issue simulation queries");
        process::exit(1);
    });

    let (commands_tx, commands_rx) = mpsc::channel(8);
    commands_tx
        .send(ServerCommand::RegisterCallback(Box::new(
            |query_num, result: Option<&UsageVector>| match result {
                Some(value) => info!(query_num, total = %value.total(), "query result"),
                None => info!(query_num, "query produced no result"),
            },
        )))
        .await
        .expect("server not started yet");
    commands_tx
        .send(ServerCommand::StartQueries(build_queries(
            simulation.num_queries,
            simulation.usage_timestep_min,
        )))
        .await
        .expect("server not started yet");
    // Closing the channel lets the server exit once the batch completes.
    drop(commands_tx);

    if let Err(err) = run_server::<UsageVector>(&settings, commands_rx).await {
        eprintln!("{:#}", err);
        process::exit(1);
    }
}
