// Keyboard teleop: WASD strafe/drive, Z/X rotate, T turbo, R/F speed,
// M toggle autonomous, Space brake, Q quit
use crossterm::{
    event::{self, Event, KeyCode, KeyEvent, KeyEventKind},
    terminal::{disable_raw_mode, enable_raw_mode},
};
use omnibase_zenoh_runtime::config::{
    TOPIC_CMD_BRAKE, TOPIC_CMD_DISCONNECT, TOPIC_CMD_MODE, TOPIC_CMD_TELEOP, TOPIC_PREFIX,
};
use omnibase_zenoh_runtime::messages::{ModeCommand, TeleopCommand};
use std::time::{Duration, Instant};
use tracing::info;
use zenoh::pubsub::Publisher;

const SPEEDS: [f32; 3] = [0.25, 0.5, 1.0]; // translation multiplier
const INPUT_TIMEOUT_MS: u64 = 100; // Release axes after this much time with no input

type BoxError = Box<dyn std::error::Error + Send + Sync>;

struct Publishers {
    teleop: Publisher<'static>,
    mode: Publisher<'static>,
    brake: Publisher<'static>,
    disconnect: Publisher<'static>,
}

#[tokio::main]
async fn main() -> Result<(), BoxError> {
    tracing_subscriber::fmt().with_env_filter("info").init();

    info!("Opening Zenoh session...");
    let session = zenoh::open(zenoh::Config::default()).await?;
    let key = |topic: &str| format!("{}/{}", TOPIC_PREFIX, topic);
    let publishers = Publishers {
        teleop: session.declare_publisher(key(TOPIC_CMD_TELEOP)).await?,
        mode: session.declare_publisher(key(TOPIC_CMD_MODE)).await?,
        brake: session.declare_publisher(key(TOPIC_CMD_BRAKE)).await?,
        disconnect: session.declare_publisher(key(TOPIC_CMD_DISCONNECT)).await?,
    };

    info!("Controls: WASD=move, Z/X=rotate, T=turbo, R/F=speed, M=autonomous, Space=brake, Q=quit");
    info!("Speed: LOW");

    enable_raw_mode()?;
    let result = run_teleop(&publishers).await;
    disable_raw_mode()?;

    // Let the runtime stop right away instead of waiting for the watchdog
    publishers.disconnect.put("{}".to_string()).await?;
    result
}

async fn run_teleop(publishers: &Publishers) -> Result<(), BoxError> {
    let mut speed_idx: usize = 0;
    let mut autonomous = false;
    let mut turbo = false;

    let mut ax = 0.0;
    let mut ay = 0.0;
    let mut rot = 0.0;
    let mut last_movement_input = Instant::now();

    loop {
        // Poll for key with 20ms timeout (50Hz effective rate)
        if event::poll(Duration::from_millis(20))? {
            if let Event::Key(KeyEvent { code, kind, .. }) = event::read()? {
                let pressed = kind == KeyEventKind::Press || kind == KeyEventKind::Repeat;

                match code {
                    // Axes use gamepad convention: negative ay drives forward
                    KeyCode::Char('w') if pressed => {
                        ay = -1.0;
                        last_movement_input = Instant::now();
                    }
                    KeyCode::Char('s') if pressed => {
                        ay = 1.0;
                        last_movement_input = Instant::now();
                    }
                    KeyCode::Char('a') if pressed => {
                        ax = -1.0;
                        last_movement_input = Instant::now();
                    }
                    KeyCode::Char('d') if pressed => {
                        ax = 1.0;
                        last_movement_input = Instant::now();
                    }
                    KeyCode::Char('z') if pressed => {
                        rot = 1.0;
                        last_movement_input = Instant::now();
                    }
                    KeyCode::Char('x') if pressed => {
                        rot = -1.0;
                        last_movement_input = Instant::now();
                    }

                    KeyCode::Char('t') if pressed => {
                        turbo = !turbo;
                        info!("Turbo: {}", if turbo { "ON" } else { "OFF" });
                    }
                    KeyCode::Char('r') if pressed => {
                        speed_idx = (speed_idx + 1).min(SPEEDS.len() - 1);
                        print_speed(speed_idx);
                    }
                    KeyCode::Char('f') if pressed => {
                        speed_idx = speed_idx.saturating_sub(1);
                        print_speed(speed_idx);
                    }

                    KeyCode::Char('m') if pressed => {
                        autonomous = !autonomous;
                        let cmd = ModeCommand { autonomous };
                        publishers.mode.put(serde_json::to_string(&cmd)?).await?;
                        info!("Autonomous: {}", if autonomous { "ON" } else { "OFF" });
                    }
                    KeyCode::Char(' ') if pressed => {
                        publishers.brake.put("{}".to_string()).await?;
                        autonomous = false;
                        info!("Brake");
                    }

                    KeyCode::Char('q') | KeyCode::Esc if pressed => break,

                    _ => {}
                }
            }
        }

        if last_movement_input.elapsed() > Duration::from_millis(INPUT_TIMEOUT_MS) {
            ax = 0.0;
            ay = 0.0;
            rot = 0.0;
        }

        // Always publish at ~50Hz; the runtime ignores it while autonomous
        let cmd = TeleopCommand {
            ax,
            ay,
            rot,
            turbo,
            speed: Some(SPEEDS[speed_idx]),
        };
        publishers.teleop.put(serde_json::to_string(&cmd)?).await?;
    }

    Ok(())
}

fn print_speed(idx: usize) {
    let label = ["LOW", "MED", "HIGH"][idx];
    info!("Speed: {}", label);
}
