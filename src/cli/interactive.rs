use std::{path::Path, sync::Arc};

use anyhow::Context;
use clap::{Parser, Subcommand};
use futures::{AsyncWriteExt, FutureExt};
use rustyline_async::{Readline, SharedWriter};
use tello_system::{
    faces::FaceEncodingStore, Axis, Command, CommandHandle, Drone, FlipDirection, Point3,
    RcVector, RotateDirection,
};
use tokio::select;
use tokio_util::sync::CancellationToken;

#[derive(Parser, Debug)]
#[clap(setting(clap::AppSettings::NoBinaryName))]
#[clap(rename_all = "kebab-case")]
enum Commands {
    Takeoff,
    Land,
    /// stop the motors immediately
    Emergency,
    /// move in a straight line: up, down, left, right, forward, back
    Move { axis: Axis, distance: u32 },
    /// rotate in place: cw or ccw
    Rotate {
        direction: RotateDirection,
        degrees: u32,
    },
    /// flip: l, r, f or b
    Flip { direction: FlipDirection },
    /// fly to a point relative to the current position
    #[clap(allow_negative_numbers = true)]
    Go { x: i32, y: i32, z: i32, speed: u32 },
    /// fly along an arc through two points relative to the current position
    #[clap(allow_negative_numbers = true)]
    Curve {
        x1: i32,
        y1: i32,
        z1: i32,
        x2: i32,
        y2: i32,
        z2: i32,
        speed: u32,
    },
    /// set the default speed in cm/s
    Speed { speed: u32 },
    /// turn the video stream on or off
    #[clap(subcommand)]
    Stream(StreamRequest),
    /// set stick positions, each in -100..=100
    #[clap(allow_negative_numbers = true)]
    Rc {
        left_right: i32,
        forward_backward: i32,
        up_down: i32,
        yaw: i32,
    },
    /// wait until every issued command has finished
    Wait,
    /// show connection state, stream health and the latest telemetry
    Status,
    Exit,
}

#[derive(Subcommand, Debug)]
enum StreamRequest {
    On,
    Off,
}

/// What to do with a command once it is issued.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Completion {
    /// report the outcome in the background and keep reading input
    Detach,
    /// wait for the outcome before the next line
    Await,
}

pub async fn run_interactive_cli(
    mut editor: Readline,
    mut stdout: SharedWriter,
    drone: Arc<Drone>,
    faces: Option<Arc<FaceEncodingStore>>,
    cancellation_token: CancellationToken,
) -> anyhow::Result<()> {
    loop {
        select! {
            _ = cancellation_token.cancelled() => {
                break;
            }
            result = editor.readline().fuse() => {
                match result {
                    Ok(line) => {
                        stdout.write_all(format!("tello> {}\n", line).as_bytes()).await?;

                        let request: Result<Commands, _> = Parser::try_parse_from(line.split_ascii_whitespace());

                        let request = match request {
                            Ok(request) => request,
                            Err(err) => {
                                stdout.write_all(err.to_string().as_bytes()).await?;
                                continue;
                            },
                        };

                        editor.add_history_entry(line);

                        if let Commands::Exit = request {
                            info!("exiting");
                            break;
                        }

                        select! {
                            _ = cancellation_token.cancelled() => break,
                            res = execute(request, &drone, faces.as_deref(), &mut stdout, Completion::Detach) => res?,
                        }
                    }
                    Err(err) => {
                        error!("interactive error: {:#?}", err);
                        break;
                    }
                };
            }
        }
    }

    cancellation_token.cancel();

    Ok(())
}

/// Runs each line of `path` in order, waiting for every command to finish
/// before sending the next. Blank lines and lines starting with `#` are
/// skipped.
pub async fn run_script(
    path: &Path,
    mut stdout: SharedWriter,
    drone: Arc<Drone>,
    cancellation_token: CancellationToken,
) -> anyhow::Result<()> {
    let script = tokio::fs::read_to_string(path)
        .await
        .with_context(|| format!("failed to read script {}", path.display()))?;

    for (n, line) in script.lines().enumerate() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }

        let request = Commands::try_parse_from(line.split_ascii_whitespace())
            .with_context(|| format!("invalid command on line {}", n + 1))?;

        if let Commands::Exit = request {
            break;
        }

        info!("script line {}: {}", n + 1, line);

        select! {
            _ = cancellation_token.cancelled() => break,
            res = execute(request, &drone, None, &mut stdout, Completion::Await) => res?,
        }
    }

    cancellation_token.cancel();

    Ok(())
}

async fn execute(
    request: Commands,
    drone: &Drone,
    faces: Option<&FaceEncodingStore>,
    stdout: &mut SharedWriter,
    completion: Completion,
) -> anyhow::Result<()> {
    let command = match request {
        Commands::Takeoff => Command::Takeoff,
        Commands::Land => Command::Land,
        Commands::Emergency => Command::Emergency,
        Commands::Move { axis, distance } => Command::Move { axis, distance },
        Commands::Rotate { direction, degrees } => Command::Rotate { direction, degrees },
        Commands::Flip { direction } => Command::Flip { direction },
        Commands::Go { x, y, z, speed } => Command::GoTo { x, y, z, speed },
        Commands::Curve {
            x1,
            y1,
            z1,
            x2,
            y2,
            z2,
            speed,
        } => Command::Curve {
            p1: Point3::new(x1, y1, z1),
            p2: Point3::new(x2, y2, z2),
            speed,
        },
        Commands::Speed { speed } => Command::SetSpeed { speed },
        Commands::Stream(StreamRequest::On) => Command::StreamOn,
        Commands::Stream(StreamRequest::Off) => Command::StreamOff,

        Commands::Rc {
            left_right,
            forward_backward,
            up_down,
            yaw,
        } => {
            let rc = RcVector::new(left_right, forward_backward, up_down, yaw);
            if let Err(err) = drone.rc(rc).await {
                error!("{}", err);
            }
            return Ok(());
        }

        Commands::Wait => {
            match drone.complete().await {
                Ok(()) => info!("all commands finished"),
                Err(err) => warn!("{}", err),
            }
            return Ok(());
        }

        Commands::Status => {
            stdout.write_all(status(drone, faces)?.as_bytes()).await?;
            return Ok(());
        }

        Commands::Exit => return Ok(()),
    };

    let handle = match drone.issue(command) {
        Ok(handle) => handle,
        Err(err) => {
            error!("{}", err);
            return Ok(());
        }
    };

    match completion {
        Completion::Detach => {
            tokio::spawn(report(handle));
        }
        Completion::Await => report(handle).await,
    }

    Ok(())
}

async fn report(handle: CommandHandle) {
    let seq = handle.seq();

    match handle.await {
        Ok(ack) => info!("#{}: {} after {} attempt(s)", seq, ack.reply, ack.attempts),
        Err(err) => error!("#{}: {}", seq, err),
    }
}

fn status(drone: &Drone, faces: Option<&FaceEncodingStore>) -> anyhow::Result<String> {
    let mut out = format!(
        "state: {:?}\nhealth: {}\n",
        drone.state(),
        serde_json::to_string(&drone.health())?
    );

    match drone.latest_telemetry() {
        Some(telem) => out += &format!("telemetry: {}\n", serde_json::to_string_pretty(&*telem)?),
        None => out += "telemetry: none\n",
    }

    match drone.latest_frame() {
        Some(frame) => {
            out += &format!(
                "video: frame #{} ({}x{}, {} bytes{})\n",
                frame.seq,
                frame.image.width,
                frame.image.height,
                frame.image.data.len(),
                if frame.keyframe { ", keyframe" } else { "" }
            )
        }
        None => out += "video: none\n",
    }

    if let Some(faces) = faces {
        out += &format!("known faces: {}\n", faces.names().collect::<Vec<_>>().join(", "));
    }

    Ok(out)
}
