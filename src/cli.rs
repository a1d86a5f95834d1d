use crate::api::{ArtifactBody, CitylensClient, RunSource, Sources};
use crate::artifacts::{normalize, CanonicalArtifact, CanonicalArtifacts};
use crate::config::{default_settings_path, Settings, DEFAULT_BASE_URL};
use crate::credentials::Credentials;
use crate::events::{EventBus, Subscription, Topic};
use crate::model::{ClientConfig, Mode, Run};
use crate::poller::policy::{select_mode, DEFAULT_POLL_INTERVAL};
use crate::poller::{
    run_poller, Notice, PollCommand, PollPolicy, PollerDeps, PollerEvent, SettleReason,
};
use crate::storage::{record_seen, FileRunHistory, MemoryRunHistory, RunHistory};
use crate::text_summary;
use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use serde_json::json;
use std::future::Future;
use std::io::Write;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, warn};

/// Output line routing for stdout/stderr writer.
enum OutputLine {
    Stdout(String),
    Stderr(String),
}

/// Spawn a blocking writer for stdout/stderr to avoid blocking async tasks.
fn spawn_output_writer() -> (
    mpsc::UnboundedSender<OutputLine>,
    tokio::task::JoinHandle<()>,
) {
    let (tx, mut rx) = mpsc::unbounded_channel::<OutputLine>();
    let handle = tokio::task::spawn_blocking(move || {
        let stdout = std::io::stdout();
        let stderr = std::io::stderr();
        let mut out = std::io::LineWriter::new(stdout.lock());
        let mut err = std::io::LineWriter::new(stderr.lock());

        while let Some(line) = rx.blocking_recv() {
            match line {
                OutputLine::Stdout(msg) => {
                    let _ = writeln!(out, "{}", msg);
                }
                OutputLine::Stderr(msg) => {
                    let _ = writeln!(err, "{}", msg);
                }
            }
        }

        let _ = out.flush();
        let _ = err.flush();
    });
    (tx, handle)
}

#[derive(Debug, Parser, Clone)]
#[command(
    name = "citylens",
    version,
    about = "Track CityLens runs and resolve their artifacts"
)]
pub struct Cli {
    /// Base URL of the CityLens API
    #[arg(long, env = "CITYLENS_API_BASE", default_value = DEFAULT_BASE_URL, global = true)]
    pub base_url: String,

    /// API key for this invocation (overrides the stored key)
    #[arg(long, env = "CITYLENS_API_KEY", hide_env_values = true, global = true)]
    pub api_key: Option<String>,

    /// Settings file (defaults to the user config dir)
    #[arg(long, global = true)]
    pub settings: Option<PathBuf>,

    /// Print JSON instead of text
    #[arg(long, global = true)]
    pub json: bool,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Debug, Subcommand, Clone)]
pub enum Command {
    /// Poll a run until it settles
    Watch {
        run_id: String,
        /// Read from the precomputed demo endpoint even when a key is set
        #[arg(long)]
        demo: bool,
        /// Poll interval while the run is queued or running
        #[arg(long)]
        interval: Option<humantime::Duration>,
        /// Skip fetching change.geojson to compute the map viewport
        #[arg(long)]
        no_bounds: bool,
    },
    /// Fetch a run once and show its status and artifacts
    Show {
        run_id: String,
        #[arg(long)]
        demo: bool,
    },
    /// Print a run's run_summary.json
    Summary {
        run_id: String,
        #[arg(long)]
        demo: bool,
    },
    /// Compute the map viewport of a local GeoJSON file
    Bounds { file: PathBuf },
    /// Submit a prepared run payload (JSON file)
    Submit { payload: PathBuf },
    /// List recently viewed runs
    Runs,
    /// Manage the stored API key
    Key {
        #[command(subcommand)]
        action: KeyAction,
    },
    /// Check that the API is reachable
    Health,
}

#[derive(Debug, Subcommand, Clone)]
pub enum KeyAction {
    /// Store a key
    Set { key: String },
    /// Remove the stored key
    Clear,
    /// Show whether a key is configured (never prints it)
    Status,
}

/// Build a `ClientConfig` from CLI arguments and stored settings.
pub fn build_config(args: &Cli, settings: &Settings) -> ClientConfig {
    let (force_demo, interval) = match &args.command {
        Command::Watch { demo, interval, .. } => (*demo, (*interval).map(Duration::from)),
        Command::Show { demo, .. } | Command::Summary { demo, .. } => (*demo, None),
        _ => (false, None),
    };
    ClientConfig {
        base_url: args.base_url.trim_end_matches('/').to_string(),
        user_agent: format!("citylens-cli/{}", env!("CARGO_PKG_VERSION")),
        poll_interval: interval
            .or(settings.poll_interval)
            .unwrap_or(DEFAULT_POLL_INTERVAL),
        force_demo,
        api_key_override: args.api_key.clone(),
        settings_path: args.settings.clone().or_else(default_settings_path),
    }
}

/// Shared state every subcommand starts from.
struct App {
    cfg: ClientConfig,
    credentials: Arc<Credentials>,
    client: Arc<CitylensClient>,
    out: mpsc::UnboundedSender<OutputLine>,
    json: bool,
}

impl App {
    fn stdout(&self, line: impl Into<String>) {
        let _ = self.out.send(OutputLine::Stdout(line.into()));
    }

    fn stderr(&self, line: impl Into<String>) {
        let _ = self.out.send(OutputLine::Stderr(line.into()));
    }

    fn print_lines(&self, summary: text_summary::TextSummary) {
        for line in summary.lines {
            self.stdout(line);
        }
    }

    fn print_json(&self, value: &serde_json::Value) -> Result<()> {
        self.stdout(serde_json::to_string_pretty(value)?);
        Ok(())
    }

    fn mode(&self) -> Mode {
        select_mode(self.cfg.force_demo, self.credentials.is_present())
    }
}

pub async fn run(args: Cli) -> Result<()> {
    let bus = EventBus::new();
    let settings_path = args.settings.clone().or_else(default_settings_path);
    let settings = match settings_path.as_deref() {
        Some(p) => Settings::load(p)?,
        None => Settings::default(),
    };
    let cfg = build_config(&args, &settings);
    let credentials = Arc::new(match cfg.settings_path.clone() {
        Some(p) => Credentials::load(p, cfg.api_key_override.clone(), bus)?,
        None => Credentials::in_memory(cfg.api_key_override.clone(), bus),
    });
    debug!(
        base_url = %cfg.base_url,
        mode = %select_mode(cfg.force_demo, credentials.is_present()),
        "client configured"
    );
    let client = Arc::new(CitylensClient::new(&cfg, credentials.clone())?);
    let (out, out_handle) = spawn_output_writer();

    let app = App {
        cfg,
        credentials,
        client,
        out,
        json: args.json,
    };

    let res = dispatch(&app, args.command).await;

    drop(app);
    let _ = out_handle.await;
    res
}

async fn dispatch(app: &App, command: Command) -> Result<()> {
    match command {
        Command::Watch {
            run_id, no_bounds, ..
        } => watch(app, run_id, !no_bounds).await,
        Command::Show { run_id, .. } => show(app, &run_id).await,
        Command::Summary { run_id, .. } => summary(app, &run_id).await,
        Command::Bounds { file } => bounds_file(app, &file),
        Command::Submit { payload } => submit(app, &payload).await,
        Command::Runs => runs(app),
        Command::Key { action } => key(app, action),
        Command::Health => {
            let v = app.client.health().await?;
            app.print_json(&v)
        }
    }
}

fn open_history() -> Arc<dyn RunHistory> {
    match FileRunHistory::open_default() {
        Ok(h) => Arc::new(h),
        Err(e) => {
            warn!("run history unavailable, keeping it in memory: {e:#}");
            Arc::new(MemoryRunHistory::default())
        }
    }
}

/// SIGHUP reloads the stored key so another shell's `citylens key set` takes effect.
/// SIGUSR1 drops the current session and fetches again right away.
/// SIGUSR2 toggles forcing the demo source.
fn spawn_signal_handlers(
    credentials: Arc<Credentials>,
    cmd_tx: mpsc::UnboundedSender<PollCommand>,
    force_demo: bool,
) -> Option<tokio::task::JoinHandle<()>> {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let installed = (
            signal(SignalKind::hangup()),
            signal(SignalKind::user_defined1()),
            signal(SignalKind::user_defined2()),
        );
        let (mut hup, mut usr1, mut usr2) = match installed {
            (Ok(h), Ok(u1), Ok(u2)) => (h, u1, u2),
            (Err(e), _, _) | (_, Err(e), _) | (_, _, Err(e)) => {
                warn!("cannot install signal handlers: {e}");
                return None;
            }
        };
        Some(tokio::spawn(async move {
            let mut force_demo = force_demo;
            loop {
                let cmd = tokio::select! {
                    Some(()) = hup.recv() => {
                        if let Err(e) = credentials.reload() {
                            warn!("reloading API key failed: {e:#}");
                        }
                        continue;
                    }
                    Some(()) = usr1.recv() => PollCommand::Restart,
                    Some(()) = usr2.recv() => {
                        force_demo = !force_demo;
                        PollCommand::ForceDemo(force_demo)
                    }
                    else => break,
                };
                if cmd_tx.send(cmd).is_err() {
                    break;
                }
            }
        }))
    }
    #[cfg(not(unix))]
    {
        let _ = (credentials, cmd_tx, force_demo);
        None
    }
}

/// What `watch` saw before the poller stopped.
struct WatchOutcome {
    last: Option<(Mode, Run)>,
    settled_ok: bool,
}

/// Render poller events until the poller exits. `quit` is polled as one pinned future
/// so a signal that fires while another event is being handled is not lost.
async fn follow_events(
    app: &App,
    run_id: &str,
    poller: impl Future<Output = Result<()>>,
    mut event_rx: mpsc::UnboundedReceiver<PollerEvent>,
    cmd_tx: &mpsc::UnboundedSender<PollCommand>,
    mut open_settings: Subscription,
    quit: impl Future,
) -> Result<WatchOutcome> {
    tokio::pin!(poller);
    tokio::pin!(quit);

    let mut outcome = WatchOutcome {
        last: None,
        settled_ok: true,
    };
    let mut poller_done = false;
    let mut quit_requested = false;

    loop {
        tokio::select! {
            res = &mut poller, if !poller_done => {
                poller_done = true;
                res?;
                break;
            }
            ev = event_rx.recv() => {
                let Some(ev) = ev else { break };
                match ev {
                    PollerEvent::SessionStarted { run_id, mode } => {
                        app.stderr(format!("== tracking {run_id} ({mode}) =="));
                    }
                    PollerEvent::Fetching { mode } => {
                        debug!(%mode, "fetching run");
                    }
                    PollerEvent::ModeChanged { from, to } => {
                        app.stderr(format!("Switching from {from} to {to}"));
                    }
                    PollerEvent::Updated { mode, run } => {
                        if app.json {
                            app.stderr(format!("{}: {}", run.run_id, run.status));
                        } else {
                            app.print_lines(text_summary::build_status_lines(run_id, mode, &run));
                        }
                        outcome.last = Some((mode, *run));
                    }
                    PollerEvent::Failed { mode, error, notice, retry_in } => {
                        debug!(%mode, ?notice, "fetch failed");
                        for line in text_summary::build_error_lines(&error, notice).lines {
                            app.stderr(line);
                        }
                        if let Some(d) = retry_in.filter(|_| !notice.is_persistent()) {
                            app.stderr(format!("  retrying in {}", humantime::format_duration(d)));
                        }
                    }
                    PollerEvent::Settled { mode, reason } => {
                        debug!(%mode, ?reason, "session settled");
                        outcome.settled_ok = !matches!(reason, SettleReason::Halted(_));
                        if reason == SettleReason::Halted(Notice::Unauthorized) {
                            // A replaced key restarts the session; keep listening for it.
                            app.stderr("Waiting for a new key, Ctrl-C to quit.");
                        } else {
                            let _ = cmd_tx.send(PollCommand::Quit);
                        }
                    }
                }
            }
            Some(()) = open_settings.recv() => {
                app.stderr("Hint: set a key with `citylens key set <KEY>` and send SIGHUP to pick it up.");
            }
            _ = &mut quit, if !quit_requested => {
                quit_requested = true;
                let _ = cmd_tx.send(PollCommand::Quit);
            }
        }
    }
    if !poller_done {
        poller.await?;
    }
    Ok(outcome)
}

async fn watch(app: &App, run_id: String, with_bounds: bool) -> Result<()> {
    let deps = PollerDeps {
        sources: Sources::http(app.client.clone()),
        history: open_history(),
        credentials: app.credentials.clone(),
        policy: PollPolicy::with_interval(app.cfg.poll_interval),
    };
    let (event_tx, event_rx) = mpsc::unbounded_channel::<PollerEvent>();
    let (cmd_tx, cmd_rx) = mpsc::unbounded_channel::<PollCommand>();
    let open_settings = app.credentials.bus().subscribe(Topic::OpenSettings);
    let signals =
        spawn_signal_handlers(app.credentials.clone(), cmd_tx.clone(), app.cfg.force_demo);

    let poller = run_poller(&deps, run_id.clone(), app.cfg.force_demo, event_tx, cmd_rx);
    let outcome = follow_events(
        app,
        &run_id,
        poller,
        event_rx,
        &cmd_tx,
        open_settings,
        tokio::signal::ctrl_c(),
    )
    .await;
    if let Some(h) = signals {
        h.abort();
    }
    let WatchOutcome { last, settled_ok } = outcome?;

    let Some((mode, run)) = last else {
        if settled_ok {
            return Ok(());
        }
        anyhow::bail!("run {run_id} could not be loaded");
    };
    let artifacts = normalize(&run);
    report_artifacts(app, mode, &run, &artifacts, with_bounds).await?;
    if !settled_ok {
        anyhow::bail!("polling stopped before run {run_id} settled");
    }
    Ok(())
}

async fn report_artifacts(
    app: &App,
    mode: Mode,
    run: &Run,
    artifacts: &CanonicalArtifacts,
    with_bounds: bool,
) -> Result<()> {
    let bounds = match (with_bounds, artifacts.url(CanonicalArtifact::Change)) {
        (true, Some(url)) => match app.client.fetch_geojson(url).await {
            Ok(geojson) => Some(crate::geo::bounds_of(&geojson)),
            Err(e) => {
                app.stderr(format!("change.geojson: {e:#}"));
                None
            }
        },
        _ => None,
    };

    if app.json {
        return app.print_json(&json!({
            "mode": mode,
            "run": run,
            "artifacts": artifacts,
            "bounds": bounds.flatten(),
        }));
    }
    app.print_lines(text_summary::build_artifact_lines(artifacts));
    if let Some(b) = bounds {
        app.stdout(text_summary::build_bounds_line(b.as_ref()));
    }
    Ok(())
}

async fn fetch_once(app: &App, run_id: &str) -> Result<(Mode, Run)> {
    let mode = app.mode();
    let sources = Sources::http(app.client.clone());
    let run = sources
        .for_mode(mode)
        .fetch_run(run_id)
        .await
        .with_context(|| format!("fetch run {run_id} ({mode})"))?;
    record_seen(
        open_history(),
        run_id.to_string(),
        run.status.reported_label().map(str::to_string),
    )
    .await;
    Ok((mode, run))
}

async fn show(app: &App, run_id: &str) -> Result<()> {
    let (mode, run) = fetch_once(app, run_id).await?;
    let artifacts = normalize(&run);
    if !app.json {
        app.print_lines(text_summary::build_status_lines(run_id, mode, &run));
    }
    report_artifacts(app, mode, &run, &artifacts, false).await
}

async fn summary(app: &App, run_id: &str) -> Result<()> {
    let (_, run) = fetch_once(app, run_id).await?;
    let artifacts = normalize(&run);
    let Some(url) = artifacts.url(CanonicalArtifact::Summary) else {
        anyhow::bail!("no signed_url available for run_summary.json yet");
    };
    match app.client.fetch_artifact(url).await? {
        ArtifactBody::Json(v) => app.print_json(&v)?,
        ArtifactBody::Text(t) => app.stdout(t),
    }
    Ok(())
}

fn bounds_file(app: &App, file: &std::path::Path) -> Result<()> {
    let data = std::fs::read_to_string(file)
        .with_context(|| format!("read {}", file.display()))?;
    let geojson: serde_json::Value =
        serde_json::from_str(&data).with_context(|| format!("parse {}", file.display()))?;
    let bounds = crate::geo::bounds_of(&geojson);
    if app.json {
        return app.print_json(&json!({ "bounds": bounds }));
    }
    app.stdout(text_summary::build_bounds_line(bounds.as_ref()));
    Ok(())
}

async fn submit(app: &App, payload: &std::path::Path) -> Result<()> {
    let data = std::fs::read_to_string(payload)
        .with_context(|| format!("read {}", payload.display()))?;
    let body: serde_json::Value =
        serde_json::from_str(&data).with_context(|| format!("parse {}", payload.display()))?;
    let (run_id, raw) = app.client.create_run(&body).await?;
    record_seen(open_history(), run_id.clone(), None).await;
    if app.json {
        return app.print_json(&json!({ "run_id": run_id, "response": raw }));
    }
    app.stdout(run_id.clone());
    app.stderr(format!("Track it with `citylens watch {run_id}`"));
    Ok(())
}

fn runs(app: &App) -> Result<()> {
    let list = open_history().list()?;
    if app.json {
        return app.print_json(&serde_json::to_value(&list)?);
    }
    app.print_lines(text_summary::build_history_lines(&list));
    Ok(())
}

fn key(app: &App, action: KeyAction) -> Result<()> {
    match action {
        KeyAction::Set { key } => {
            if key.trim().is_empty() {
                anyhow::bail!("API key must not be empty");
            }
            app.credentials.set(&key)?;
            app.stderr("API key saved.");
        }
        KeyAction::Clear => {
            app.credentials.clear()?;
            app.stderr("API key cleared.");
        }
        KeyAction::Status => {
            let present = app.credentials.is_present();
            if app.json {
                return app.print_json(&json!({ "api_key_set": present, "mode": app.mode() }));
            }
            if present {
                app.stdout("API key set (live mode)");
            } else {
                app.stdout("No API key (demo mode). Set one to run new jobs.");
            }
        }
    }
    Ok(())
}
