// Send a navigation goal (or clear it) and print navigation events
//
// Usage: cargo run --example goal_publisher -- --x 30 --y 20
//        cargo run --example goal_publisher -- --clear

use clap::Parser;
use omnibase_zenoh_runtime::config::{TOPIC_CMD_GOAL, TOPIC_CMD_MODE, TOPIC_NAV, TOPIC_PREFIX};
use omnibase_zenoh_runtime::messages::{GoalCommand, ModeCommand, NavEvent};
use std::time::Duration;
use tracing::{info, warn};

#[derive(Parser, Debug)]
#[command(about = "Publish a grid goal to the base runtime")]
struct Args {
    /// Goal cell column
    #[arg(long, allow_negative_numbers = true, required_unless_present = "clear")]
    x: Option<i32>,

    /// Goal cell row
    #[arg(long, allow_negative_numbers = true, required_unless_present = "clear")]
    y: Option<i32>,

    /// Clear the active goal instead
    #[arg(long, conflicts_with_all = ["x", "y"])]
    clear: bool,

    /// Also switch the runtime to autonomous mode
    #[arg(long)]
    auto: bool,

    /// Topic prefix
    #[arg(long, default_value = TOPIC_PREFIX)]
    prefix: String,

    /// Seconds to wait for navigation events
    #[arg(long, default_value_t = 2)]
    wait: u64,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    tracing_subscriber::fmt().with_env_filter("info").init();
    let args = Args::parse();

    let cmd = match (args.clear, args.x, args.y) {
        (true, _, _) => GoalCommand::Clear,
        (false, Some(x), Some(y)) => GoalCommand::Set { x, y },
        _ => return Err("both --x and --y are required".into()),
    };

    let session = zenoh::open(zenoh::Config::default()).await?;
    let key = |topic: &str| format!("{}/{}", args.prefix, topic);
    let events = session.declare_subscriber(key(TOPIC_NAV)).await?;

    if args.auto {
        let mode = ModeCommand { autonomous: true };
        session.put(key(TOPIC_CMD_MODE), serde_json::to_string(&mode)?).await?;
        info!("Requested autonomous mode");
    }

    session.put(key(TOPIC_CMD_GOAL), serde_json::to_string(&cmd)?).await?;
    info!("Sent {:?}", cmd);

    let deadline = tokio::time::sleep(Duration::from_secs(args.wait));
    tokio::pin!(deadline);
    loop {
        tokio::select! {
            _ = &mut deadline => break,
            Ok(sample) = events.recv_async() => {
                let payload = sample.payload().to_bytes();
                match serde_json::from_slice::<NavEvent>(&payload) {
                    Ok(event) => info!("{:?}", event),
                    Err(e) => warn!("Unrecognized nav event: {}", e),
                }
            }
        }
    }

    Ok(())
}
