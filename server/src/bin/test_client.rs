use clap::Parser;
use futures_util::{SinkExt, StreamExt};
use rand::Rng;
use shared::{ClientMessage, PlayerMove, ServerMessage, DEFAULT_PORT};
use std::time::Duration;
use tokio::time::interval;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message;

/// Headless client that joins the relay and sends random moves
#[derive(Parser, Debug)]
#[clap(author, version, about)]
struct Args {
    /// Relay host
    #[clap(short = 'H', long, default_value = "127.0.0.1")]
    host: String,
    /// Relay port
    #[clap(short, long, default_value_t = DEFAULT_PORT)]
    port: u16,
    /// Number of moves to send before disconnecting
    #[clap(short, long, default_value_t = 10)]
    moves: u32,
    /// Delay between moves in milliseconds
    #[clap(short, long, default_value_t = 2000)]
    interval_ms: u64,
}

fn describe(message: &ServerMessage) -> String {
    match message {
        ServerMessage::Connected { player_id, .. } => format!("connected as {}", player_id),
        ServerMessage::PlayerJoined { player_id } => format!("player {} joined", player_id),
        ServerMessage::PlayerLeft { player_id } => format!("player {} left", player_id),
        ServerMessage::PlayerMove(mv) => {
            format!("player {} moved to ({}, {})", mv.player_id, mv.x, mv.y)
        }
        ServerMessage::PlayersList { players } => format!("{} player(s) online", players.len()),
        ServerMessage::Error { message } => format!("error: {}", message),
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();
    let url = format!("ws://{}:{}", args.host, args.port);

    println!("Connecting to {}", url);
    let (ws_stream, _) = connect_async(url.as_str()).await?;
    let (mut write, mut read) = ws_stream.split();

    // Wait for the confirmation to learn our id
    let player_id = loop {
        match read.next().await {
            Some(Ok(Message::Text(text))) => match ServerMessage::parse(&text) {
                Ok(ServerMessage::Connected { player_id, message }) => {
                    println!("{} (player id {})", message, player_id);
                    break player_id;
                }
                Ok(other) => println!("Received: {}", describe(&other)),
                Err(e) => println!("Failed to decode message: {}", e),
            },
            Some(Ok(_)) => {}
            Some(Err(e)) => return Err(e.into()),
            None => return Err("connection closed before confirmation".into()),
        }
    };

    write
        .send(Message::Text(ClientMessage::GetPlayers.to_text()?))
        .await?;

    let mut ticker = interval(Duration::from_millis(args.interval_ms.max(1)));
    let mut sent = 0;

    while sent < args.moves {
        tokio::select! {
            _ = ticker.tick() => {
                let (x, y) = {
                    let mut rng = rand::thread_rng();
                    (rng.gen_range(0..1000), rng.gen_range(0..1000))
                };
                let mv = ClientMessage::PlayerMove(PlayerMove::new(player_id.as_str(), x, y));
                println!("Sending move to ({}, {})", x, y);
                write.send(Message::Text(mv.to_text()?)).await?;
                sent += 1;
            }
            frame = read.next() => match frame {
                Some(Ok(Message::Text(text))) => match ServerMessage::parse(&text) {
                    Ok(message) => println!("Received: {}", describe(&message)),
                    Err(e) => println!("Failed to decode message: {}", e),
                },
                Some(Ok(_)) => {}
                Some(Err(e)) => return Err(e.into()),
                None => {
                    println!("Server closed the connection");
                    return Ok(());
                }
            }
        }
    }

    println!("Sent {} moves, disconnecting", sent);
    write.send(Message::Close(None)).await?;
    println!("Test client finished");

    Ok(())
}
