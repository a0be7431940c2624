// Fixed-rate control loop plus a request handler over Zenoh
//
// Request handler: decodes operator commands and mutates intent only
// (arbiter, navigator). Goal planning runs on a blocking worker so neither the
// tick nor other requests wait on it.
// Tick loop: sole writer of the actuator; publishes actuation, telemetry,
// health and navigation events.

use std::sync::Arc;
use std::time::Instant;

use serde::Serialize;
use serde::de::DeserializeOwned;
use tokio::sync::{Notify, mpsc};
use tokio::task::{JoinHandle, block_in_place};
use tokio::time::{MissedTickBehavior, interval};
use tracing::{debug, info, warn};
use zenoh::pubsub::{Publisher, Subscriber};
use zenoh::handlers::FifoChannelHandler;
use zenoh::sample::Sample;

use crate::config::{
    RuntimeConfig, TOPIC_CMD_BRAKE, TOPIC_CMD_DISCONNECT, TOPIC_CMD_GOAL, TOPIC_CMD_MODE,
    TOPIC_CMD_PID, TOPIC_CMD_POSE, TOPIC_CMD_TELEOP, TOPIC_HEALTH, TOPIC_NAV, TOPIC_PID_ACK,
    TOPIC_RT_ACTUATION, TOPIC_RT_TELEMETRY,
};
use crate::control::{ControlLoop, ModeArbiter};
use crate::messages::{
    GoalCommand, HealthReport, ModeCommand, NavEvent, PidAck, PidGainsCommand, PoseCommand,
    TeleopCommand,
};
use crate::motor::{Actuator, BridgeActuator, BridgeError, SimActuator, VehicleGeometry};
use crate::nav::{GoalRequest, Navigator};
use crate::teleop::TeleopSource;

type BoxError = Box<dyn std::error::Error + Send + Sync>;
type Inbox = Subscriber<FifoChannelHandler<Sample>>;

/// Operator command subscriptions
struct Inboxes {
    teleop: Inbox,
    mode: Inbox,
    goal: Inbox,
    brake: Inbox,
    disconnect: Inbox,
    pid: Inbox,
    pose: Inbox,
}

/// Pick the actuator once at startup
pub fn build_actuator(config: &RuntimeConfig, sim: bool) -> Result<Box<dyn Actuator>, BridgeError> {
    let motor = &config.motor;
    match (&motor.port, sim) {
        (Some(port), false) => {
            let actuator = BridgeActuator::open(port, motor.baudrate, motor.bridge_id, motor.read_encoders)?;
            Ok(Box::new(actuator))
        }
        _ => {
            info!("No motor bridge configured, using simulated actuator");
            let sim = if motor.sim_encoders {
                SimActuator::with_encoders(config.geometry.max_wheel_rps)
            } else {
                SimActuator::new()
            };
            Ok(Box::new(sim))
        }
    }
}

pub async fn run(config: RuntimeConfig, sim: bool) -> Result<(), BoxError> {
    let actuator = build_actuator(&config, sim)?;
    info!("Actuator: {}", actuator.name());

    let arbiter = Arc::new(ModeArbiter::new(
        TeleopSource::from(&config.teleop),
        config.control.cmd_timeout(),
    ));
    let navigator = Arc::new(Navigator::new(
        config.nav.grid()?,
        config.nav.params(&config.teleop),
        config.nav.start_pose(),
    ));
    let period = config.control.period();
    let mut control = ControlLoop::new(
        arbiter.clone(),
        navigator.clone(),
        VehicleGeometry::from(&config.geometry),
        config.pid.gains(),
        config.control.closed_loop,
        actuator,
        period,
    );

    info!("Opening Zenoh session...");
    let session = zenoh::open(zenoh::Config::default()).await?;
    let topics = &config.transport;

    info!("Setting up publishers and subscribers...");
    let inboxes = Inboxes {
        teleop: session.declare_subscriber(topics.key(TOPIC_CMD_TELEOP)).await?,
        mode: session.declare_subscriber(topics.key(TOPIC_CMD_MODE)).await?,
        goal: session.declare_subscriber(topics.key(TOPIC_CMD_GOAL)).await?,
        brake: session.declare_subscriber(topics.key(TOPIC_CMD_BRAKE)).await?,
        disconnect: session.declare_subscriber(topics.key(TOPIC_CMD_DISCONNECT)).await?,
        pid: session.declare_subscriber(topics.key(TOPIC_CMD_PID)).await?,
        pose: session.declare_subscriber(topics.key(TOPIC_CMD_POSE)).await?,
    };
    let pub_actuation = session.declare_publisher(topics.key(TOPIC_RT_ACTUATION)).await?;
    let pub_telemetry = session.declare_publisher(topics.key(TOPIC_RT_TELEMETRY)).await?;
    let pub_health = session.declare_publisher(topics.key(TOPIC_HEALTH)).await?;
    let pub_nav = session.declare_publisher(topics.key(TOPIC_NAV)).await?;
    let pub_pid_ack = session.declare_publisher(topics.key(TOPIC_PID_ACK)).await?;

    let brake = Arc::new(Notify::new());
    let (nav_tx, mut nav_rx) = mpsc::channel::<NavEvent>(16);

    tokio::spawn(handle_requests(
        inboxes,
        arbiter.clone(),
        navigator.clone(),
        brake.clone(),
        nav_tx,
        pub_pid_ack,
    ));

    let mut tick = interval(period);
    tick.set_missed_tick_behavior(MissedTickBehavior::Skip);
    let shutdown = tokio::signal::ctrl_c();
    tokio::pin!(shutdown);

    info!(
        "Runtime started: {}Hz loop, watchdog {:?}, closed loop {}",
        config.control.loop_hz,
        config.control.cmd_timeout(),
        config.control.closed_loop
    );
    info!("Subscribed under: {}/cmd/*", topics.prefix);

    let mut last_health: Option<HealthReport> = None;
    loop {
        tokio::select! {
            _ = tick.tick() => {}
            // Brake is applied without waiting for the next period
            _ = brake.notified() => {}
            Some(event) = nav_rx.recv() => {
                publish(&pub_nav, &event).await?;
                continue;
            }
            _ = &mut shutdown => {
                info!("Shutting down");
                break;
            }
        }

        // 1. Tick: select -> kinematics -> PID -> actuate
        // Serial I/O blocks, so keep it off the async workers
        let out = block_in_place(|| control.tick());

        // 2. Publish actuation and telemetry
        publish(&pub_actuation, &out.actuation).await?;
        publish(&pub_telemetry, &out.telemetry).await?;

        // 3. Publish health, logging transitions
        if last_health.map(|h| h.status) != Some(out.health.status) {
            info!("Health: {:?}", out.health.status);
        }
        last_health = Some(out.health);
        publish(&pub_health, &out.health).await?;

        // 4. Navigation progress
        if let Some(event) = out.nav_event {
            publish(&pub_nav, &event).await?;
        }
    }

    block_in_place(|| control.shutdown());
    Ok(())
}

async fn handle_requests(
    inboxes: Inboxes,
    arbiter: Arc<ModeArbiter>,
    navigator: Arc<Navigator>,
    brake: Arc<Notify>,
    nav_tx: mpsc::Sender<NavEvent>,
    pub_pid_ack: Publisher<'static>,
) {
    loop {
        tokio::select! {
            Ok(sample) = inboxes.teleop.recv_async() => {
                if let Some(cmd) = decode::<TeleopCommand>(&sample, "teleop") {
                    arbiter.on_teleop(&cmd, Instant::now());
                }
            }
            Ok(sample) = inboxes.mode.recv_async() => {
                if let Some(cmd) = decode::<ModeCommand>(&sample, "mode") {
                    arbiter.set_autonomous(cmd.autonomous);
                }
            }
            Ok(sample) = inboxes.goal.recv_async() => {
                if let Some(cmd) = decode::<GoalCommand>(&sample, "goal") {
                    dispatch_goal(&navigator, cmd, &nav_tx);
                }
            }
            Ok(_) = inboxes.brake.recv_async() => {
                arbiter.brake();
                brake.notify_one();
            }
            Ok(_) = inboxes.disconnect.recv_async() => {
                arbiter.disconnect();
            }
            Ok(sample) = inboxes.pid.recv_async() => {
                if let Some(cmd) = decode::<PidGainsCommand>(&sample, "pid") {
                    // Acknowledged for the dashboard; live controllers keep their configured gains
                    info!(
                        "Received PID gains kp={} ki={} kd={} (wheel {:?}), not applied",
                        cmd.kp, cmd.ki, cmd.kd, cmd.wheel
                    );
                    let ack = PidAck { ok: true, applied: false };
                    if let Err(e) = publish(&pub_pid_ack, &ack).await {
                        warn!("Failed to publish PID ack: {}", e);
                    }
                }
            }
            Ok(sample) = inboxes.pose.recv_async() => {
                if let Some(cmd) = decode::<PoseCommand>(&sample, "pose") {
                    navigator.set_pose((&cmd).into());
                }
            }
            else => {
                warn!("All command subscriptions closed");
                break;
            }
        }
    }
}

/// Record the goal change in arrival order, then plan on a blocking worker
///
/// Returns the planning task, if one was started.
fn dispatch_goal(
    navigator: &Arc<Navigator>,
    cmd: GoalCommand,
    nav_tx: &mpsc::Sender<NavEvent>,
) -> Option<JoinHandle<()>> {
    let ticket = match navigator.request_goal(cmd.target()) {
        GoalRequest::Cleared => {
            if nav_tx.try_send(NavEvent::GoalCleared).is_err() {
                debug!("Goal cleared event dropped");
            }
            return None;
        }
        GoalRequest::Plan(ticket) => ticket,
    };

    let navigator = navigator.clone();
    let nav_tx = nav_tx.clone();
    Some(tokio::spawn(async move {
        let goal = ticket.goal();
        match tokio::task::spawn_blocking(move || navigator.complete_plan(ticket)).await {
            Ok(Some(event)) => {
                if nav_tx.send(event).await.is_err() {
                    debug!("Navigation event dropped, tick loop gone");
                }
            }
            Ok(None) => {}
            Err(e) => warn!("Planning task for {:?} failed: {}", goal, e),
        }
    }))
}

fn decode<T: DeserializeOwned>(sample: &Sample, what: &str) -> Option<T> {
    let payload = sample.payload().to_bytes();
    match serde_json::from_slice::<T>(&payload) {
        Ok(cmd) => Some(cmd),
        Err(e) => {
            warn!("Failed to parse {} command: {}", what, e);
            None
        }
    }
}

async fn publish<T: Serialize>(publisher: &Publisher<'_>, value: &T) -> Result<(), BoxError> {
    let json = serde_json::to_string(value)?;
    publisher.put(json).await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::nav::{Cell, NavParams, NavState, OccupancyGrid, Pose};

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_clear_after_set_always_wins() {
        let (nav_tx, mut nav_rx) = mpsc::channel::<NavEvent>(1024);
        for _ in 0..200 {
            let navigator = Arc::new(Navigator::new(
                OccupancyGrid::new(40, 30),
                NavParams::default(),
                Pose::new(20.0, 15.0, 0.0),
            ));
            let planning = dispatch_goal(&navigator, GoalCommand::Set { x: 39, y: 29 }, &nav_tx);
            assert!(dispatch_goal(&navigator, GoalCommand::Clear, &nav_tx).is_none());
            if let Some(task) = planning {
                task.await.unwrap();
            }

            assert_eq!(navigator.state(), NavState::Idle);
            assert_eq!(navigator.goal(), None);
            assert!(navigator.remaining().is_empty());
            while nav_rx.try_recv().is_ok() {}
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_goal_dispatch_reports_plan() {
        let (nav_tx, mut nav_rx) = mpsc::channel::<NavEvent>(4);
        let navigator = Arc::new(Navigator::new(
            OccupancyGrid::new(5, 5),
            NavParams::default(),
            Pose::default(),
        ));
        let task = dispatch_goal(&navigator, GoalCommand::Set { x: 4, y: 4 }, &nav_tx).unwrap();
        task.await.unwrap();
        assert_eq!(
            nav_rx.recv().await,
            Some(NavEvent::PathPlanned {
                goal: Cell::new(4, 4),
                waypoints: 9
            })
        );
        assert_eq!(navigator.state(), NavState::Following);
    }

    #[test]
    fn test_no_port_selects_sim() {
        let config = RuntimeConfig::default();
        let actuator = build_actuator(&config, false).unwrap();
        assert_eq!(actuator.name(), "sim");
    }

    #[test]
    fn test_sim_flag_overrides_port() {
        let mut config = RuntimeConfig::default();
        config.motor.port = Some("/dev/does-not-exist".to_string());
        config.motor.sim_encoders = true;
        let mut actuator = build_actuator(&config, true).unwrap();
        assert_eq!(actuator.name(), "sim");
        assert!(actuator.read_wheel_rates().is_some());
    }
}
