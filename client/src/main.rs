use clap::Parser;
use client::network::Client;
use log::info;
use shared::{AircraftKind, ControlInputs};

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Server address to connect to
    #[arg(short = 's', long, default_value = "127.0.0.1:8080")]
    server: String,

    /// Authentication token identifying this pilot
    #[arg(short = 't', long, default_value = "guest")]
    auth_token: String,

    /// Simulate network latency in milliseconds
    #[arg(short = 'l', long, default_value = "0")]
    fake_ping: u64,

    /// Stop after this many seconds (runs until Ctrl+C when omitted)
    #[arg(long)]
    run_seconds: Option<u64>,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::init();

    if std::env::var("RUST_LOG").is_err() {
        eprintln!("Set RUST_LOG=info for detailed logging");
    }

    let args = Args::parse();

    info!("Starting client...");
    info!("Connecting to: {}", args.server);
    if args.fake_ping > 0 {
        info!("Simulating {}ms latency", args.fake_ping);
    }

    let mut client = Client::new(
        &args.server,
        args.auth_token,
        AircraftKind::Fighter,
        args.fake_ping,
    )
    .await?;

    // Headless autopilot: gentle banking pattern exercising every axis.
    // A real presentation layer supplies stick state here instead.
    let autopilot = |t: f32| ControlInputs {
        throttle: 0.7 + 0.2 * (t * 0.3).sin(),
        pitch: 0.1 * (t * 0.5).sin(),
        roll: 0.3 * (t * 0.4).cos(),
        yaw: 0.0,
    };

    client.run(autopilot, args.run_seconds).await?;

    Ok(())
}
