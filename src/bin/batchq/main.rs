mod args;
mod client;

use std::path::Path;
use std::process::ExitCode;
use std::sync::Arc;

use anyhow::{Context, Result};
use batchq::config::Settings;
use batchq::engine::Engine;
use batchq::executor::{BatchExecutor, CommandExecutor, SimulatedExecutor};
use batchq::intake::Intake;
use batchq::recovery::Janitor;
use batchq::server;
use batchq::store::{MemoryStore, RedisStore, Store};
use batchq::sweeper::Requeuer;
use batchq::types::job::JobId;
use batchq::types::protocol::Command as Request;
use batchq::worker::Worker;
use clap::Parser;
use tokio::net::TcpListener;
use tokio::signal;
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn, Level};

use crate::args::{Args, Command, ListenArgs, StoreArgs, WorkerArgs};
use crate::client::Reply;

#[tokio::main]
async fn main() -> ExitCode {
    let args = Args::parse();

    // Logging
    if args.debug {
        tracing_subscriber::fmt()
            .with_max_level(Level::TRACE)
            .init();
    } else {
        tracing_subscriber::fmt().json().init();
    }

    // Cancellation and termination channel.
    let cancel = CancellationToken::new();
    {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            if let Err(error) = signal::ctrl_c().await {
                warn!(%error, "something strange with ctrl-c handling!");
            };
            cancel.cancel();
        });
    }

    let (shutdown_hold, mut shutdown_wait) = mpsc::channel::<()>(1);

    let exit_code = match begin(args.command, cancel, shutdown_hold).await {
        Ok(code) => code,
        Err(error) => {
            error!(error = %format!("{error:#}"), "encountered runtime error");
            ExitCode::FAILURE
        },
    };

    // Open connections each hold a sender; wait for them to close.
    shutdown_wait.recv().await;

    exit_code
}

async fn begin(
    command: Command,
    cancel: CancellationToken,
    shutdown_hold: mpsc::Sender<()>,
) -> Result<ExitCode> {
    match command {
        Command::Serve { store, listen } => {
            let engine = shared_engine(&store).await?;
            let listener = bind(&listen).await?;
            server::serve(listener, Intake::new(engine), cancel, shutdown_hold)
                .await?;
        },
        Command::Worker { store, worker } => {
            let engine = shared_engine(&store).await?;
            let worker = build_worker(engine, &worker, None);
            worker.run(&cancel).await;
        },
        Command::Requeuer { store } => {
            let engine = shared_engine(&store).await?;
            Requeuer::new(engine).run(&cancel).await;
        },
        Command::Janitor { store } => {
            let engine = shared_engine(&store).await?;
            Janitor::new(engine).run(&cancel).await;
        },
        Command::Standalone {
            config,
            listen,
            workers,
            worker: worker_args,
        } => {
            let settings = settings(config.as_deref())?;
            let store: Arc<dyn Store> = Arc::new(MemoryStore::new());
            let engine = Engine::new(store, settings);
            let listener = bind(&listen).await?;
            info!(workers, "running standalone with an in-memory store");

            let mut tasks = JoinSet::new();
            {
                let intake = Intake::new(engine.clone());
                let cancel = cancel.clone();
                tasks.spawn(async move {
                    if let Err(error) =
                        server::serve(listener, intake, cancel, shutdown_hold)
                            .await
                    {
                        error!(%error, "front end failed");
                    }
                });
            }
            for n in 0..workers {
                let worker = build_worker(engine.clone(), &worker_args, Some(n));
                let cancel = cancel.clone();
                tasks.spawn(async move { worker.run(&cancel).await });
            }
            {
                let requeuer = Requeuer::new(engine.clone());
                let cancel = cancel.clone();
                tasks.spawn(async move { requeuer.run(&cancel).await });
            }
            {
                let janitor = Janitor::new(engine);
                let cancel = cancel.clone();
                tasks.spawn(async move { janitor.run(&cancel).await });
            }

            while let Some(joined) = tasks.join_next().await {
                if let Err(error) = joined {
                    error!(%error, "task failed");
                }
            }
        },
        Command::Submit {
            server,
            org_id,
            app_version_id,
            test,
            target,
            priority,
            max_retries,
        } => {
            let request = Request::Submit {
                org_id,
                app_version_id,
                test_path: test,
                target,
                priority,
                max_retries,
            };
            return print_reply(client::request(&server.server, &request).await?);
        },
        Command::Status { server, job_id } => {
            let id: JobId = job_id
                .parse()
                .with_context(|| format!("{job_id:?} is not a job ID"))?;
            let request = Request::Status { id };
            return print_reply(client::request(&server.server, &request).await?);
        },
    }

    Ok(ExitCode::SUCCESS)
}

fn settings(config: Option<&Path>) -> Result<Settings> {
    match config {
        Some(path) => Settings::load(path)
            .with_context(|| format!("loading settings from {}", path.display())),
        None => Ok(Settings::default()),
    }
}

async fn shared_engine(args: &StoreArgs) -> Result<Engine> {
    let settings = settings(args.config.as_deref())?;
    let store = RedisStore::connect(&args.redis_url)
        .await
        .with_context(|| format!("connecting to {}", args.redis_url))?;
    Ok(Engine::new(Arc::new(store), settings))
}

async fn bind(args: &ListenArgs) -> Result<TcpListener> {
    TcpListener::bind((args.listen, args.port))
        .await
        .with_context(|| format!("binding {}:{}", args.listen, args.port))
}

/// `index` tells apart several workers sharing one set of arguments.
fn build_worker(
    engine: Engine,
    args: &WorkerArgs,
    index: Option<usize>,
) -> Worker {
    let executor: Arc<dyn BatchExecutor> = match &args.executor {
        Some(program) => Arc::new(CommandExecutor::new(
            program.clone(),
            args.executor_args.clone(),
        )),
        None => Arc::new(SimulatedExecutor {
            failure_rate: args.failure_rate,
            ..SimulatedExecutor::default()
        }),
    };
    match (&args.worker_id, index) {
        (Some(id), Some(n)) => Worker::with_id(engine, executor, format!("{id}-{n}")),
        (Some(id), None) => Worker::with_id(engine, executor, id.clone()),
        (None, _) => Worker::new(engine, executor),
    }
}

fn print_reply(reply: Reply) -> Result<ExitCode> {
    match reply {
        Reply::Success(text) => {
            println!("{}", text.trim_end());
            Ok(ExitCode::SUCCESS)
        },
        Reply::Refused(line) => {
            eprintln!("{line}");
            Ok(ExitCode::FAILURE)
        },
    }
}
