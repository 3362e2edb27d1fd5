use clap::Parser;
use server::match_state::GameModePolicy;
use server::network::Server;
use std::time::Duration;

/// Authoritative match server for the flight sync core.
#[derive(Parser, Debug)]
#[clap(author, version, about)]
struct Args {
    /// Server IP address to bind to
    #[clap(short = 'H', long, default_value = "127.0.0.1")]
    host: String,

    /// Server port to listen on
    #[clap(short, long, default_value = "8080")]
    port: u16,

    /// Simulation tick rate in Hz
    #[clap(short, long, default_value = "60")]
    tick_rate: u32,

    /// Snapshot broadcast rate in Hz
    #[clap(short, long, default_value = "20")]
    broadcast_rate: u32,

    /// Maximum concurrent connections
    #[clap(short, long, default_value = "16")]
    max_clients: usize,

    /// Minimum players for the match to count as running
    #[clap(long, default_value = "2")]
    min_players: usize,

    /// Reconnection grace window in seconds (0 disables reconnection)
    #[clap(long, default_value = "30")]
    reconnect_timeout: u64,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::init();

    let args = Args::parse();
    let policy = GameModePolicy {
        min_players: args.min_players,
        allow_reconnection: args.reconnect_timeout > 0,
        reconnect_timeout: Duration::from_secs(args.reconnect_timeout),
        tick_rate_hz: args.tick_rate,
        broadcast_rate_hz: args.broadcast_rate,
    };

    let address = format!("{}:{}", args.host, args.port);
    let mut server = Server::new(&address, policy, args.max_clients).await?;
    server.run().await
}
