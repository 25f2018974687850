use std::{net::{IpAddr, Ipv4Addr}, time::Duration};

use anyhow::{Context, Result};
use arctic_spa::{discovery::{default_route_address, search, Subnet}, MessageKind, Record, SearchOptions};
use clap::Parser;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;


/// Poll an Arctic Spa controller and print its status
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Address of the controller
    ///
    /// When omitted, the local network is searched and the first controller found is polled.
    #[arg(env = "ARCTIC_SPA_HOST")]
    host: Option<IpAddr>,

    /// Prefix length of the local network to search
    #[arg(long, default_value_t = 24, env = "ARCTIC_SPA_PREFIX")]
    prefix: u8,

    /// Seconds to wait for the requested records
    #[arg(long, default_value_t = 5, env = "ARCTIC_SPA_TIMEOUT")]
    timeout: u64,

    /// Print every record received
    #[arg(short, long)]
    verbose: bool,
}


async fn find_spa(prefix: u8) -> Result<Option<IpAddr>> {
    let local = default_route_address().await.unwrap_or_else(|err| {
        warn!("can't determine local address ({err}), searching from localhost");
        Ipv4Addr::LOCALHOST
    });

    let subnet = Subnet::from_prefix(local, prefix)?;
    println!("Searching for hot tub from {local}/{prefix}...");

    let devices = search(local, subnet.mask(), &SearchOptions::default()).await
        .with_context(|| format!("failed to search {}/{prefix}", subnet.network()))?;

    match devices.as_slice() {
        [] => {
            println!("No hot tubs found");
            Ok(None)
        },
        [first, rest @ ..] => {
            if !rest.is_empty() {
                println!("Multiple hot tubs found, using the first");
            }
            println!("Found a hot tub at {}", first.address);
            Ok(Some(IpAddr::V4(first.address)))
        }
    }
}


#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let args = Args::parse();

    let host = match args.host {
        Some(host) => host,
        None => match find_spa(args.prefix).await? {
            Some(host) => host,
            None => return Ok(()),
        },
    };

    println!("Polling {host}...");

    let records = arctic_spa::poll(host, &[MessageKind::Live, MessageKind::OnzenLive], Duration::from_secs(args.timeout)).await
        .with_context(|| format!("failed to poll {host}"))?;

    info!("received {} records", records.len());

    for record in &records {
        match record {
            Record::Live(live) => {
                println!("Temperature(F): {}", display(live.temperature_fahrenheit));
                println!("Pump 1: {}", display(live.pump_1));
                println!("Heater 1: {}", display(live.heater_1));
            },
            Record::OnzenLive(onzen) => {
                println!("pH: {}", onzen.ph().map_or("-".to_string(), |ph| format!("{ph:.02}")));
                println!("pH color: {}", display(onzen.ph_color));
            },
            _ => ()
        }

        if args.verbose {
            println!("{record:#?}");
        }
    }

    Ok(())
}

fn display<T: ToString>(value: Option<T>) -> String {
    value.map_or("-".to_string(), |value| value.to_string())
}
