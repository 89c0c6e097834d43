use crate::backend::MemoryBackend;
use crate::cache::{FileMirror, RequestCache};
use crate::cli::{Command, SourceArgs};
use crate::config::Config;
use crate::data::RawDataset;
use crate::data::changes::ChangeEvent;
use crate::provider::{ChangeOutcome, Provider};
use crate::utils::fmt_duration;
use anyhow::Context;
use std::io::Write;
use std::path::Path;
use std::process::ExitCode;
use std::sync::Arc;
use tracing::{error, info, warn};

/// Main application struct: configuration plus the shared cache.
pub struct App {
    config: Config,
    cache: RequestCache<RawDataset>,
}

impl App {
    pub fn new(config: Config) -> Self {
        let settings = config.cache_settings();
        let cache = match &config.mirror_dir {
            Some(dir) => {
                info!(dir = %dir.display(), prefix = %config.mirror_prefix, "durable mirror enabled");
                RequestCache::with_mirror(
                    settings,
                    Arc::new(FileMirror::new(dir, config.mirror_prefix.clone())),
                )
            }
            None => RequestCache::new(settings),
        };

        info!(
            ttl = fmt_duration(settings.ttl),
            wait_timeout = fmt_duration(settings.wait_timeout),
            debounce_delay = fmt_duration(settings.debounce_delay),
            "request cache configured"
        );
        Self { config, cache }
    }

    /// Run one command to completion and map the result to an exit code.
    pub async fn run(self, command: Command) -> ExitCode {
        let result = match &command {
            Command::Snapshot { source } => self.snapshot(source).await,
            Command::Replay { source, events } => self.replay(source, events).await,
        };
        self.cache.shutdown().await;

        match result {
            Ok(()) => ExitCode::SUCCESS,
            Err(e) => {
                error!(error = ?e, "command failed");
                ExitCode::FAILURE
            }
        }
    }

    async fn provider(
        &self,
        source: &SourceArgs,
    ) -> anyhow::Result<(Arc<MemoryBackend>, Provider)> {
        let backend = Arc::new(MemoryBackend::from_fixture(&source.fixture).await?);
        let provider = Provider::new(
            backend.clone(),
            self.cache.clone(),
            source.actor(),
            self.config.provider_settings(),
        );
        provider
            .load(source.force)
            .await
            .context("Failed to load data")?;
        Ok((backend, provider))
    }

    async fn snapshot(&self, source: &SourceArgs) -> anyhow::Result<()> {
        let (_, provider) = self.provider(source).await?;
        print_json(&*provider.snapshot())
    }

    /// Replay events as if another client wrote them: each lands in the
    /// backend first, then reaches this provider.
    async fn replay(&self, source: &SourceArgs, events: &Path) -> anyhow::Result<()> {
        let (backend, provider) = self.provider(source).await?;
        let events = read_events(events).await?;

        let mut patched = 0usize;
        let mut ignored = 0usize;
        for event in &events {
            if let Err(e) = backend.apply_external(event.clone()).await {
                warn!(table = %event.table, error = %e, "backend rejected event");
                ignored += 1;
                continue;
            }
            match provider.apply_change(event).await {
                ChangeOutcome::Patched => patched += 1,
                ChangeOutcome::RefetchScheduled => {}
                ChangeOutcome::Ignored => ignored += 1,
            }
        }
        let refetched = provider.flush_refetch().await;
        info!(
            events = events.len(),
            patched, ignored, refetched, "replay finished"
        );

        print_json(&*provider.snapshot())
    }
}

/// Parse a JSON-lines file of change events. Blank lines are skipped; a bad
/// line is logged and skipped.
async fn read_events(path: &Path) -> anyhow::Result<Vec<ChangeEvent>> {
    let text = tokio::fs::read_to_string(path)
        .await
        .with_context(|| format!("Failed to read events from {}", path.display()))?;

    let mut events = Vec::new();
    for (index, line) in text.lines().enumerate() {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        match serde_json::from_str::<ChangeEvent>(line) {
            Ok(event) => events.push(event),
            Err(e) => warn!(line = index + 1, error = %e, "skipping unparseable event"),
        }
    }
    Ok(events)
}

fn print_json<T: serde::Serialize>(value: &T) -> anyhow::Result<()> {
    let stdout = std::io::stdout();
    let mut out = stdout.lock();
    serde_json::to_writer_pretty(&mut out, value).context("Failed to write output")?;
    writeln!(out)?;
    Ok(())
}
