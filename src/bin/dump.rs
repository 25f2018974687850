use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use arctic_spa::{protocol::type_key::TypeKey, Error, MessageKind, Packet, Record, SpaClient, TcpTransport};
use clap::Parser;
use colored::{ColoredString, Colorize};
use tracing::info;
use tracing_subscriber::EnvFilter;
use url::Url;


/// Print every frame a controller sends
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// URL of the controller to connect to
    ///
    /// tcp://host[:port] URLs supported, the port defaults to 65534
    #[arg(env = "ARCTIC_SPA_URL")]
    url: Url,

    /// Print the decoded record of each frame
    #[arg(short, long)]
    records: bool,
}


fn delta_ms(time: Option<Instant>) -> u128 {
    time.map_or(0, |time| time.elapsed().as_millis())
}

fn coloured(packet: &Packet, line: String) -> ColoredString {
    match packet.record.kind() {
        MessageKind::Live => line.on_green().bright_white(),
        MessageKind::OnzenLive => line.on_cyan().bright_white(),
        MessageKind::Config => line.on_purple().bright_white(),
        MessageKind::Info => line.on_magenta().bright_white(),
        MessageKind::Unknown(code) if code == TypeKey::Error.code() => line.on_red().bright_white(),
        MessageKind::Unknown(_) => line.on_black(),
    }
}


#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let args = Args::parse();

    let transport = TcpTransport::open(&args.url).await
        .with_context(|| format!("failed to connect to {}", args.url))?;

    let mut client = SpaClient::new(transport);

    client.request(&[MessageKind::Live, MessageKind::OnzenLive]).await
        .context("failed to send request")?;

    let start_time = Instant::now();
    let mut last_frame_time: Option<Instant> = None;

    loop {
        let packets = match client.read_packets(Duration::from_secs(60)).await {
            Ok(packets) => packets,
            Err(Error::Closed) => {
                info!("connection closed by the controller");
                break;
            },
            Err(err) => return Err(err.into()),
        };

        for packet in packets {
            let start_delta_ms = delta_ms(Some(start_time));
            let last_frame_delta_ms = delta_ms(last_frame_time);

            let kind = TypeKey::describe(packet.type_code);
            let line = format!("[{start_delta_ms:8}, {last_frame_delta_ms:8}] {kind: <20} #{:<8} {:02x?}", packet.counter, packet.checksum);

            println!("{}", coloured(&packet, line));

            if args.records {
                match &packet.record {
                    Record::Unknown { payload, .. } => println!("{payload:02x?}"),
                    record => println!("{record:#?}"),
                }
            }

            last_frame_time = Some(Instant::now());
        }
    }

    Ok(())
}
