use std::path::PathBuf;
use std::sync::Arc;

use cd11::connection::config::DataConsumerConfig;
use cd11::connection::publisher::ChannelPublisher;
use cd11::connection::station_connection::DataConsumer;
use cd11::connman::{ConnMan, ConnManConfig, StationRegistration};
use cd11::frames::FrameBody;
use clap::Parser;
use clap_derive::Parser;
use tokio::select;
use tracing::{info, Level};

/// Receives CD-1.1 data for a single station: a connection manager on the well-known port
///  redirects the station to a data consumer, which logs every DATA frame it receives.
#[derive(Parser)]
struct Args {
    station: String,
    connman_address: String,
    data_consumer_address: String,

    /// persist gap state in this directory instead of keeping it in memory
    #[clap(long)]
    gap_state_dir: Option<PathBuf>,

    /// ignore CUSTOM_RESET_FRAME
    #[clap(long, default_value_t = false)]
    disable_custom_reset: bool,

    #[clap(short, long, default_value_t = false)]
    verbose: bool,

    #[clap(long, default_value_t = false)]
    very_verbose: bool,
}

#[tokio::main]
pub async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let level = match (args.verbose, args.very_verbose) {
        (_, true) => Level::TRACE,
        (true, _) => Level::DEBUG,
        (false, false) => Level::INFO,
    };

    tracing_subscriber::fmt()
        .with_max_level(level)
        .try_init()
        .ok();

    let mut consumer_config = DataConsumerConfig::new(&args.station, args.data_consumer_address.parse()?);
    consumer_config.gap_state_dir = args.gap_state_dir;
    consumer_config.custom_reset_enabled = !args.disable_custom_reset;
    let (publisher, mut received) = ChannelPublisher::new(consumer_config.publisher_queue_capacity);
    let consumer = Arc::new(DataConsumer::bind(consumer_config, Arc::new(publisher)).await?);

    let mut connman_config = ConnManConfig::new(args.connman_address.parse()?);
    connman_config.stations.push(StationRegistration {
        station_name: args.station.clone(),
        data_consumer_addr: consumer.local_addr()?,
        acquired: true,
    });
    let connman = ConnMan::bind(connman_config).await?;

    let log_data = async move {
        while let Some(data) = received.recv().await {
            if let FrameBody::Data(body) = data.frame.body() {
                let channels = body.subframes.iter()
                    .map(|s| format!("{}.{}.{} ({} samples)", s.site, s.channel, s.location, s.samples))
                    .collect::<Vec<_>>();
                info!("{} DATA #{}: {}", data.station, data.frame.sequence_number(), channels.join(", "));
            }
        }
    };

    let consumer_shutdown = consumer.shutdown_token();
    let connman_shutdown = connman.shutdown_token();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("shutting down");
            consumer_shutdown.cancel();
            connman_shutdown.cancel();
        }
    });

    select! {
        result = consumer.run() => result,
        result = connman.run() => result,
        _ = log_data => Ok(()),
    }
}
