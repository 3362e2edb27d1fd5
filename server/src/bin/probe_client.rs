//! Minimal diagnostic client: connects, joins, streams a fixed input for a
//! few seconds and prints every correction the server sends back. Useful
//! for poking at a running server without the full prediction stack.

use bincode::{deserialize, serialize};
use shared::{now_millis, AircraftKind, ControlInputs, Packet, StateDelta, PROTOCOL_VERSION};
use std::net::SocketAddr;
use std::time::Duration;
use tokio::net::UdpSocket;
use tokio::time::{sleep, timeout};

async fn send(socket: &UdpSocket, addr: SocketAddr, packet: &Packet) -> std::io::Result<()> {
    let data = serialize(packet).map_err(|e| std::io::Error::new(std::io::ErrorKind::Other, e))?;
    socket.send_to(&data, addr).await?;
    Ok(())
}

async fn recv(socket: &UdpSocket) -> Option<Packet> {
    let mut buffer = [0u8; 2048];
    let result = timeout(Duration::from_secs(2), socket.recv_from(&mut buffer)).await;
    match result {
        Ok(Ok((len, _))) => deserialize(&buffer[0..len]).ok(),
        _ => None,
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let server_addr: SocketAddr = std::env::args()
        .nth(1)
        .unwrap_or_else(|| "127.0.0.1:8080".to_string())
        .parse()?;

    let socket = UdpSocket::bind("0.0.0.0:0").await?;
    println!("probe bound to {}", socket.local_addr()?);

    send(
        &socket,
        server_addr,
        &Packet::Connect {
            client_version: PROTOCOL_VERSION,
            auth_token: "probe".to_string(),
        },
    )
    .await?;

    let Some(Packet::Connected { connection_id }) = recv(&socket).await else {
        println!("no Connected reply, giving up");
        return Ok(());
    };
    println!("connected as connection {}", connection_id);

    send(
        &socket,
        server_addr,
        &Packet::Join {
            aircraft: AircraftKind::Fighter,
        },
    )
    .await?;

    let Some(Packet::JoinAccepted {
        entity_id,
        tick_rate_hz,
        state,
    }) = recv(&socket).await
    else {
        println!("no JoinAccepted reply, giving up");
        return Ok(());
    };
    println!(
        "joined as entity {} at tick rate {}Hz, spawn {:?}",
        entity_id, tick_rate_hz, state.position
    );

    // Stream a gentle climb for five seconds and report corrections.
    let inputs = ControlInputs {
        throttle: 0.8,
        pitch: 0.2,
        roll: 0.0,
        yaw: 0.0,
    };
    let mut sequence = 0u32;
    for _ in 0..100 {
        sequence += 1;
        let delta = StateDelta {
            entity_id,
            sequence,
            timestamp: now_millis(),
            inputs: Some(inputs),
            ..Default::default()
        };
        send(&socket, server_addr, &Packet::Input { delta }).await?;

        if let Some(Packet::Correction {
            acked_sequence,
            state,
        }) = recv(&socket).await
        {
            println!(
                "correction: acked {} position {:?} speed {:.1}",
                acked_sequence,
                state.position,
                state.linear_velocity.length()
            );
        }
        sleep(Duration::from_millis(50)).await;
    }

    send(&socket, server_addr, &Packet::Disconnect).await?;
    println!("disconnected");
    Ok(())
}
