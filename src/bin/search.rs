use std::{net::Ipv4Addr, time::Duration};

use anyhow::{Context, Result};
use arctic_spa::{discovery::{default_route_address, search, Subnet}, SearchOptions};
use clap::Parser;
use tracing_subscriber::EnvFilter;


/// Search the local network for Arctic Spa controllers
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Local address to search from (defaults to the address with the default route)
    #[arg(long, env = "ARCTIC_SPA_LOCAL_ADDRESS")]
    local: Option<Ipv4Addr>,

    /// Prefix length of the network to search
    #[arg(long, default_value_t = 24, env = "ARCTIC_SPA_PREFIX")]
    prefix: u8,

    /// Milliseconds to wait for each host to respond
    #[arg(long, default_value_t = 1000)]
    host_timeout: u64,

    /// Seconds before the search gives up
    #[arg(long, default_value_t = 10)]
    timeout: u64,

    /// Maximum number of hosts probed at once
    #[arg(long, default_value_t = 256)]
    concurrency: usize,
}


#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let args = Args::parse();

    let local = match args.local {
        Some(local) => local,
        None => default_route_address().await.context("can't determine local address, use --local")?,
    };

    let subnet = Subnet::from_prefix(local, args.prefix)?;

    let options = SearchOptions {
        per_host_timeout: Duration::from_millis(args.host_timeout),
        overall_timeout: Duration::from_secs(args.timeout),
        concurrency: args.concurrency,
        ..Default::default()
    };

    let devices = search(local, subnet.mask(), &options).await
        .with_context(|| format!("failed to search {}/{}", subnet.network(), subnet.prefix()))?;

    println!("Found {} devices", devices.len());

    for device in devices {
        println!(
            "{:15} guid: {:20} product: {}",
            device.address,
            device.guid.as_deref().unwrap_or("-"),
            device.product_id.as_deref().unwrap_or("-"),
        );
    }

    Ok(())
}
