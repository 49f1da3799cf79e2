use clap::Parser;
use futures_util::{SinkExt, StreamExt};
use log::{debug, info, warn};
use rand::Rng;
use shared::protocol::{decode_state_frame, encode_input_frame, ERROR_PREFIX};
use shared::MovementInput;
use std::time::{Duration, Instant};
use tokio::time::{sleep, timeout};
use tokio_tungstenite::{connect_async, tungstenite::Message};

/// Sends randomized movement input to an arena server and logs the replies
#[derive(Parser, Debug)]
#[clap(author, version, about)]
struct Args {
    /// Server URL
    #[clap(short, long, default_value = "ws://127.0.0.1:8080/")]
    url: String,
    /// Player id to drive
    #[clap(short, long, default_value = "tester")]
    player: String,
    /// Number of input frames to send
    #[clap(short, long, default_value = "10")]
    count: u64,
    /// Input frames per second
    #[clap(short, long, default_value = "10")]
    rate: f64,
}

fn random_input(rng: &mut impl Rng, sequence: u64) -> MovementInput {
    let angle: f64 = rng.gen_range(-std::f64::consts::PI..std::f64::consts::PI);
    MovementInput {
        up: rng.gen_bool(0.5),
        down: rng.gen_bool(0.5),
        left: rng.gen_bool(0.5),
        right: rng.gen_bool(0.5),
        sequence,
        mouse_x: angle.cos(),
        mouse_y: angle.sin(),
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let args = Args::parse();
    if !(args.rate.is_finite() && args.rate > 0.0) {
        return Err(format!("rate must be positive, got {}", args.rate).into());
    }
    let interval = Duration::from_secs_f64(1.0 / args.rate);

    let (ws, _) = connect_async(args.url.as_str()).await?;
    info!("Connected to {} as {}", args.url, args.player);
    let (mut sink, mut stream) = ws.split();
    let mut rng = rand::thread_rng();
    let mut broadcasts = 0u64;

    for sequence in 1..=args.count {
        let line = encode_input_frame(&args.player, &random_input(&mut rng, sequence));
        debug!("Sending: {}", line);
        let sent_at = Instant::now();
        sink.send(Message::text(line)).await?;

        // Skip tick broadcasts until the reply to this input arrives
        loop {
            let message = match timeout(Duration::from_secs(2), stream.next()).await {
                Ok(Some(message)) => message?,
                Ok(None) => {
                    warn!("Server closed the connection");
                    return Ok(());
                }
                Err(_) => {
                    warn!("No reply to input {}", sequence);
                    break;
                }
            };
            let Message::Text(text) = message else {
                continue;
            };

            if text.starts_with(ERROR_PREFIX) {
                warn!("Input {} rejected: {}", sequence, text);
                break;
            }
            match decode_state_frame(&text) {
                Ok(frame) if frame.tick.is_some() => broadcasts += 1,
                Ok(frame) => {
                    for player in frame.players {
                        info!(
                            "Input {} -> {} at ({:.3}, {:.3}) facing {:.3} rad, seq {} ({:.1?})",
                            sequence,
                            player.player_id,
                            player.x,
                            player.y,
                            player.facing_radians,
                            player.last_sequence,
                            sent_at.elapsed()
                        );
                    }
                    break;
                }
                Err(e) => warn!("Unreadable frame: {}", e),
            }
        }

        sleep(interval).await;
    }

    info!("Sent {} inputs, saw {} broadcasts", args.count, broadcasts);
    sink.send(Message::Close(None)).await?;
    Ok(())
}
