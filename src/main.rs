mod cli;

use anyhow::{bail, Context, Result};
use cli::{Cli, Commands};
use dock::config::{ClientConfig, Config, ServerConfig};
use dock::reconnect::{LinkStatus, ReconnectController};
use dock::server::Server;
use dock::transfer::event_channel;
use dock::tui::{self, ProgressView};
use std::future::Future;
use std::path::PathBuf;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse_args();
    init_logging(cli.verbose);

    let mut config = Config::load(cli.config.as_deref())?;
    if let Some(server) = cli.server {
        config.client.server = server;
    }
    if let Some(max) = cli.max_backoff {
        config.client.backoff.max = max;
        config.client.backoff.initial = config.client.backoff.initial.min(max);
    }
    let bars = !cli.no_progress;

    match cli.command {
        Commands::Serve {
            dir,
            listen,
            max_file_size,
        } => {
            if let Some(dir) = dir {
                config.server.root = dir;
            }
            if let Some(listen) = listen {
                config.server.listen = listen;
            }
            if max_file_size.is_some() {
                config.server.max_file_size = max_file_size;
            }
            serve(config.server).await
        }
        Commands::List { json } => list(&config.client, json).await,
        Commands::Upload { paths } => upload(&config.client, paths, bars).await,
        Commands::Download { name, output } => download(&config.client, name, output, bars).await,
    }
}

fn init_logging(verbose: bool) {
    let default = if verbose { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .init();
}

async fn serve(config: ServerConfig) -> Result<()> {
    let server = Server::bind(&config).await?;
    let shutdown = CancellationToken::new();

    let token = shutdown.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("Shutting down");
            token.cancel();
        }
    });

    server.run(shutdown).await
}

/// Controller plus a task echoing link changes to stderr
fn connect(config: &ClientConfig) -> Result<Arc<ReconnectController>> {
    config.validate().context("Invalid client configuration")?;
    let controller = Arc::new(ReconnectController::new(config));

    let mut status = controller.subscribe();
    let addr = controller.addr().to_string();
    tokio::spawn(async move {
        while status.changed().await.is_ok() {
            let current = *status.borrow_and_update();
            let retrying = match current {
                LinkStatus::Waiting { .. } => true,
                LinkStatus::Connecting { attempt } => attempt > 1,
                _ => false,
            };
            if retrying {
                eprintln!("{}: {}", addr, tui::describe_link(current));
            }
        }
    });
    Ok(controller)
}

/// Run `fut`, giving up on Ctrl+C
async fn until_interrupted<T>(
    controller: &ReconnectController,
    fut: impl Future<Output = T>,
) -> Result<T> {
    tokio::select! {
        result = fut => Ok(result),
        _ = tokio::signal::ctrl_c() => {
            controller.cancel();
            bail!("Interrupted")
        }
    }
}

async fn list(config: &ClientConfig, json: bool) -> Result<()> {
    let controller = connect(config)?;
    let files = until_interrupted(&controller, controller.list_files()).await??;
    controller.close().await;

    if json {
        tui::print_listing_json(&files)?;
    } else {
        tui::print_listing(&files);
    }
    Ok(())
}

async fn upload(config: &ClientConfig, paths: Vec<PathBuf>, bars: bool) -> Result<()> {
    let controller = connect(config)?;
    let total = paths.len();
    let (handle, events) = controller.spawn_upload_batch(paths);

    let mut view = ProgressView::new(bars);
    let outcomes = until_interrupted(&controller, async {
        view.drain(events).await;
        handle.await
    })
    .await??
    .context("Upload batch failed")?;
    controller.close().await;

    let failed = outcomes.iter().filter(|o| o.result.is_err()).count();
    if failed > 0 {
        bail!("{} of {} uploads failed", failed, total);
    }
    Ok(())
}

async fn download(
    config: &ClientConfig,
    name: String,
    output: Option<PathBuf>,
    bars: bool,
) -> Result<()> {
    let dest = match output {
        Some(path) if path.is_dir() => path.join(&name),
        Some(path) => path,
        None => PathBuf::from(&name),
    };

    let controller = connect(config)?;
    let (events, stream) = event_channel();
    let mut view = ProgressView::new(bars);
    let transfer = async {
        let events = events;
        controller.download(&name, &dest, &events).await
    };

    let (result, ()) = until_interrupted(&controller, async {
        tokio::join!(transfer, view.drain(stream))
    })
    .await?;
    controller.close().await;

    let bytes = result.with_context(|| format!("Failed to download {}", name))?;
    info!("Saved {} ({} bytes)", dest.display(), bytes);
    Ok(())
}
