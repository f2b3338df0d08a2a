use anyhow::Result;
use plc_command::arguments::{ArgumentValue, CommandArguments};
use plc_command::command::{CommandInvoker, CommandStateChanged, InvocationConfig, InvocationLockRegistry};
use plc_command::connection::{CommandBehaviour, DeviceConnection, SimulatedPlc, SimulatedPlcConfig};
use plc_command_shared::ResultCodeTranslator;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc::UnboundedReceiver;
use tokio_util::sync::CancellationToken;

use tracing::{error, info, warn};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(EnvFilter::from_default_env().add_directive(tracing::Level::INFO.into()))
        .init();

    let plc = SimulatedPlc::new(SimulatedPlcConfig {
        // Reproduce a backend losing the first notification
        swallow_initial_events: 1,
        ..Default::default()
    });
    let connection: Arc<dyn DeviceConnection> = Arc::new(plc.clone());
    info!("Simulated controller at {}", connection.address());

    plc.add_command(
        "MAIN.fbHome",
        CommandBehaviour::Completes {
            steps: 4,
            step_interval: Duration::from_millis(100),
            result_code: 2,
        },
    );
    plc.add_command(
        "MAIN.fbMove",
        CommandBehaviour::Completes {
            steps: 5,
            step_interval: Duration::from_millis(80),
            result_code: 0,
        },
    );
    plc.add_command(
        "MAIN.fbClamp",
        CommandBehaviour::Completes {
            steps: 2,
            step_interval: Duration::from_millis(50),
            result_code: 101,
        },
    );
    plc.add_command("MAIN.fbCalibrate", CommandBehaviour::Hangs);
    plc.add_symbol("MAIN.fbMove.stInput.fTarget", ArgumentValue::Real64(0.0).encode());
    plc.add_symbol("MAIN.fbMove.stOutput.nSteps", ArgumentValue::UInt16(420).encode());

    let locks = Arc::new(InvocationLockRegistry::new());
    let config = InvocationConfig {
        max_wait_for_initial_event: Duration::from_millis(200),
        ..Default::default()
    };

    let home = Arc::new(
        CommandInvoker::new("MAIN.fbHome", connection.clone(), locks.clone())
            .with_config(config.clone()),
    );
    let move_axis =
        CommandInvoker::new("MAIN.fbMove", connection.clone(), locks.clone()).with_config(config.clone());
    let clamp = CommandInvoker::new("MAIN.fbClamp", connection.clone(), locks.clone())
        .with_config(config.clone())
        .with_translator(ResultCodeTranslator::with_messages([(101, "Clamp pressure too low")])?);
    let calibrate = CommandInvoker::new("MAIN.fbCalibrate", connection.clone(), locks.clone())
        .with_config(InvocationConfig {
            timeout: Duration::from_millis(500),
            ..config
        });

    tokio::spawn(log_progress(home.subscribe()));
    tokio::spawn(log_progress(move_axis.subscribe()));

    let cancel = CancellationToken::new();

    // Two homing requests race for the same command; the second waits
    let homing = futures::future::join_all([
        home.execute_detached(cancel.clone(), None, None),
        home.execute_detached(cancel.clone(), None, None),
    ]);

    let input = CommandArguments::new().with("fTarget", ArgumentValue::Real64(125.0));
    let mut output = CommandArguments::new().with("nSteps", ArgumentValue::UInt16(0));
    let moving = move_axis.execute(&cancel, Some(&input), Some(&mut output));

    let clamping = clamp.execute(&cancel, None, None);
    let calibrating = calibrate.execute(&cancel, None, None);

    let (homing, moved, clamped, calibrated) = tokio::join!(homing, moving, clamping, calibrating);

    for result in homing {
        match result? {
            Ok(done) => info!("Homing finished at {}", done.completed_at),
            Err(e) => error!("Homing failed: {}", e),
        }
    }
    match moved {
        Ok(at) => info!("Move finished at {}, output {:?}", at, output.get("nSteps")),
        Err(e) => error!("Move failed: {}", e),
    }
    if let Err(e) = clamped {
        warn!("Clamp failed as expected: {}", e);
    }
    if let Err(e) = calibrated {
        warn!("Calibration failed as expected: {}", e);
    }

    // Cancel a running command
    let token = CancellationToken::new();
    let running = move_axis.execute(&token, Some(&input), None);
    let canceller = async {
        tokio::time::sleep(Duration::from_millis(150)).await;
        info!("Requesting cancel of MAIN.fbMove");
        token.cancel();
    };
    let (cancelled, _) = tokio::join!(running, canceller);
    match cancelled {
        Ok(_) => warn!("Move completed before the cancel arrived"),
        Err(e) => info!("Move ended: {}", e),
    }

    info!("Demo finished, {} locks held", locks.held_count());
    Ok(())
}

/// Log progress observations of one command
async fn log_progress(mut changes: UnboundedReceiver<CommandStateChanged>) {
    while let Some(change) = changes.recv().await {
        if change.timed_out {
            warn!("[{}] timed out at {}%", change.command_path, change.progress);
        } else if change.cancelled {
            info!("[{}] cancelled at {}%", change.command_path, change.progress);
        } else if change.finished {
            info!("[{}] finished", change.command_path);
        } else {
            info!(
                "[{}] {}% (sub task {})",
                change.command_path, change.progress, change.sub_task
            );
        }
    }
}
