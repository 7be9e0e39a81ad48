//! Wires the whole daemon together: single-instance lock, persistence, the
//! configured queue variant, the chat client, the reactor and the ingestion
//! cadence.

use std::sync::Arc;
use std::thread;

use anyhow::{
    Context,
    Result,
    anyhow,
};
use thiserror::Error;
use tracing::{
    error,
    info,
};

use crate::analyzer::DemoAnalyzer;
use crate::chat::{
    ChatClient,
    DiscordRestClient,
};
use crate::ingest::{
    ChannelDirectory,
    Ingestor,
};
use crate::local_queue::{
    HttpDemoFetcher,
    LocalRenderingQueue,
};
use crate::queue::{
    RenderingQueue,
    Shutdown,
};
use crate::reactor::Reactor;
use crate::registry::RenderedDemoRegistry;
use crate::remote_queue::{
    IgmdbClient,
    PollingRemoteQueue,
};
use crate::renderer::OdfeDemoRenderer;
use crate::settings::{
    RenderingProvider,
    Settings,
};
use crate::single_instance;
use crate::uploader::ExternalVideoUploader;

/// How a daemon run ended, mapped onto the process exit codes.
#[derive(Debug, Error)]
pub enum RunError {
    /// Startup or pipeline failure; exit code 1.
    #[error("{0:#}")]
    Fatal(anyhow::Error),
    /// Unrecoverable chat-transport failure; exit code 2.
    #[error("chat transport failed: {0:#}")]
    Chat(anyhow::Error),
}

pub fn run(settings: Settings) -> Result<(), RunError> {
    let settings = Arc::new(settings);
    run_inner(settings)
}

fn run_inner(settings: Arc<Settings>) -> Result<(), RunError> {
    std::fs::create_dir_all(&settings.state_directory)
        .with_context(|| {
            format!(
                "failed to create state directory {}",
                settings.state_directory.display()
            )
        })
        .map_err(RunError::Fatal)?;

    let _lock = single_instance::acquire(
        &settings.state_directory.join("run.lock"),
        settings.lock_timeout(),
    )
    .map_err(RunError::Fatal)?;

    let registry = Arc::new(
        RenderedDemoRegistry::open(&settings.state_directory.join("db.sqlite"))
            .map_err(RunError::Fatal)?,
    );
    let queue = build_queue(&settings).map_err(RunError::Fatal)?;

    let client: Arc<dyn ChatClient> = Arc::new(
        DiscordRestClient::new(settings.discord_token.clone()).map_err(RunError::Fatal)?,
    );
    info!("connecting to the chat platform");
    let channels = client.list_channels().map_err(RunError::Chat)?;
    let directory = ChannelDirectory::build(channels, &settings).map_err(RunError::Fatal)?;

    let reactor = Arc::new(Reactor::new(
        client.clone(),
        settings.clone(),
        directory.clone(),
        registry.clone(),
        queue.clone(),
    ));
    reactor.install(queue.as_ref());

    let ingestor = Ingestor::new(
        client,
        settings.clone(),
        directory,
        Box::new(DemoAnalyzer::new(&settings.democleaner_exe)),
        registry,
        queue.clone(),
    )
    .map_err(RunError::Fatal)?;

    let shutdown = Arc::new(Shutdown::new());
    let queue_handle = {
        let queue = queue.clone();
        let shutdown = shutdown.clone();
        thread::Builder::new()
            .name("demoflow-queue".to_string())
            .spawn(move || queue.run(shutdown))
            .context("failed to spawn queue thread")
            .map_err(RunError::Fatal)?
    };

    let result = drive_ingest(&ingestor, &shutdown, &queue_handle, &settings);

    shutdown.trigger();
    let queue_result = queue_handle
        .join()
        .unwrap_or_else(|_| Err(anyhow!("queue thread panicked")));
    if let Err(err) = queue.close() {
        error!(error = %format!("{err:#}"), "failed to flush queue state");
    }

    result?;
    queue_result.map_err(RunError::Fatal)?;
    info!("shut down cleanly");
    Ok(())
}

fn drive_ingest(
    ingestor: &Ingestor,
    shutdown: &Arc<Shutdown>,
    queue_handle: &thread::JoinHandle<Result<()>>,
    settings: &Settings,
) -> Result<(), RunError> {
    // Initial bulk replay: repeat until a pass finds nothing new, so
    // messages arriving while the backlog drains are still picked up.
    loop {
        let processed = ingestor.replay_all().map_err(RunError::Chat)?;
        info!(processed, "bulk history replay pass finished");
        if processed == 0 {
            break;
        }
    }

    // Steady state: poll the channels on a cadence until the queue stops.
    loop {
        if queue_handle.is_finished() {
            return Ok(());
        }
        if shutdown.sleep(settings.ingest_poll_interval()) {
            return Ok(());
        }
        ingestor.replay_all().map_err(RunError::Chat)?;
    }
}

fn build_queue(settings: &Arc<Settings>) -> Result<Arc<dyn RenderingQueue>> {
    match settings.demo_rendering_provider {
        RenderingProvider::Igmdb => {
            let token = settings
                .igmdb_token
                .clone()
                .context("igmdb provider requires a token")?;
            let service = Arc::new(IgmdbClient::new(token)?);
            let queue = PollingRemoteQueue::open(
                &settings.state_directory.join("igmdb-upload-queue.json"),
                service,
                settings.igmdb_polling_interval(),
            )?;
            Ok(Arc::new(queue))
        }
        RenderingProvider::LocalRendering => {
            let local = settings
                .local_rendering
                .clone()
                .context("local-rendering provider requires its settings section")?;
            let renderer = OdfeDemoRenderer::new(
                local.odfe_dir,
                local.odfe_executable,
                local.config_dir,
                local.demo_dir,
                local.video_dir,
                local.defrag_config,
            );
            let uploader = ExternalVideoUploader::new(local.uploader_executable, local.uploader_args);
            let queue = LocalRenderingQueue::open(
                &settings.state_directory.join("local-rendering-queue.json"),
                Box::new(HttpDemoFetcher::new()?),
                Box::new(renderer),
                Box::new(uploader),
                std::time::Duration::from_secs(local.publishing_delay_secs),
            )?;
            Ok(Arc::new(queue))
        }
    }
}
