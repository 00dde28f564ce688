use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use rustyline_async::{Readline, SharedWriter};
use tello_system::{faces::FaceEncodingStore, ConnectionState, Drone, TelloSystemConfig};
use tokio::{select, task::JoinSet};
use tokio_util::sync::CancellationToken;
use tracing::metadata::LevelFilter;
use tracing_subscriber::{filter::Targets, layer::SubscriberExt, util::SubscriberInitExt, Layer};

use crate::cli::{
    args::MainArgs,
    interactive::{run_interactive_cli, run_script},
};

#[macro_use]
extern crate tracing;

mod cli;

#[tokio::main(flavor = "multi_thread")]
async fn main() -> anyhow::Result<()> {
    // setup colorful backtraces
    color_backtrace::install();

    // set up logging and interactive line editor
    let (editor, stdout) =
        Readline::new("tello> ".into()).context("failed to create interactive editor")?;

    let mut targets = tracing_subscriber::filter::Targets::new();

    if let Ok(directives) = std::env::var("RUST_LOG") {
        for directive in directives.split(',') {
            if let Some((target, level)) = directive.split_once('=') {
                targets = targets.with_target(
                    target,
                    level.parse::<LevelFilter>().context("invalid log level")?,
                );
            } else {
                targets = targets.with_default(
                    directive
                        .parse::<LevelFilter>()
                        .context("invalid log level")?,
                );
            }
        }
    } else {
        targets = targets.with_default(LevelFilter::INFO);
    }

    let (writer, _guard) =
        tracing_appender::non_blocking(tracing_appender::rolling::hourly("logs", "tello-system"));

    let reg = tracing_subscriber::registry();

    #[cfg(tokio_unstable)]
    let reg = reg.with(console_subscriber::spawn());

    reg
        // writer that outputs to console
        .with(
            tracing_subscriber::fmt::layer()
                .with_writer({
                    let stdout = stdout.clone();
                    move || stdout.clone()
                })
                .with_filter(targets),
        )
        // writer that outputs to files
        .with(
            tracing_subscriber::fmt::layer()
                .with_ansi(false)
                .with_writer(writer)
                .with_filter(
                    Targets::new().with_targets(vec![("tello_system", LevelFilter::DEBUG)]),
                ),
        )
        .init();

    let main_args = MainArgs::parse();

    debug!("reading config from {:?}", &main_args.config);
    let config = TelloSystemConfig::read_from_path(main_args.config.clone())
        .context("failed to read config file")?;

    run(config, main_args, editor, stdout).await
}

async fn run(
    config: TelloSystemConfig,
    args: MainArgs,
    editor: Readline,
    stdout: SharedWriter,
) -> anyhow::Result<()> {
    let cancellation_token = CancellationToken::new();

    ctrlc::set_handler({
        let cancellation_token = cancellation_token.clone();
        move || {
            info!("received interrupt, shutting down");
            cancellation_token.cancel();
        }
    })
    .context("could not set ctrl+c handler")?;

    let faces = match &config.faces.store {
        Some(path) => {
            let store = FaceEncodingStore::load(path).context("failed to load face store")?;
            info!("loaded {} known faces", store.names().count());
            Some(Arc::new(store))
        }
        None => None,
    };

    let mut drone = Drone::new(config.drone.clone());
    if let Some(dir) = &config.journal.dir {
        drone = drone.journal_dir(dir);
    }
    let drone = Arc::new(drone);

    drone.connect().await.context("failed to connect to drone")?;

    let mut join_set = JoinSet::new();

    match args.script {
        Some(path) => {
            join_set.spawn({
                let drone = drone.clone();
                let cancellation_token = cancellation_token.clone();
                async move { run_script(&path, stdout, drone, cancellation_token).await }
            });
        }
        None => {
            join_set.spawn(run_interactive_cli(
                editor,
                stdout,
                drone.clone(),
                faces,
                cancellation_token.clone(),
            ));
        }
    }

    // a session that dies on its own takes the cli down with it
    join_set.spawn({
        let mut state_rx = drone.subscribe_state();
        let cancellation_token = cancellation_token.clone();
        async move {
            select! {
                _ = cancellation_token.cancelled() => {}
                _ = state_rx.wait_for(|s| *s == ConnectionState::Closed) => {
                    error!("lost connection to drone");
                    cancellation_token.cancel();
                }
            }
            Ok(())
        }
    });

    let mut result = Ok(());

    while let Some(res) = join_set.join_next().await {
        // if task panicked, then will be Some(Err)
        // if task terminated w/ error, then will be Some(Ok(Err))
        // need to propagate errors in both cases

        match res {
            Err(err) => {
                cancellation_token.cancel();
                result = Err(err).context("task failed");
            }
            Ok(Err(err)) => {
                cancellation_token.cancel();
                result = Err(err).context("task terminated with error");
            }
            _ => {
                debug!("exited task");
            }
        }
    }

    drone.close().await;

    result
}
