//! Run tracking controller.
//!
//! Owns mode selection and the lifetime of the current session, and turns session
//! messages into events for presentation layers.

use crate::api::Sources;
use crate::credentials::Credentials;
use crate::error::FetchError;
use crate::events::Topic;
use crate::model::{Mode, Run};
use crate::poller::policy::{select_mode, FailureAction, Notice, PollPolicy};
use crate::poller::session::{
    spawn_session, SessionCtx, SessionEvent, SessionHandle, SessionKey, SessionMsg, SettleReason,
};
use crate::storage::RunHistory;
use anyhow::Result;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};
use tracing::{debug, info};

/// Commands from presentation layers.
#[derive(Debug, Clone)]
pub enum PollCommand {
    /// Force (true) or stop forcing (false) the demo source.
    ForceDemo(bool),
    /// Drop the current session and start over with a fresh fetch.
    Restart,
    Quit,
}

/// Everything a presentation layer needs to render the run.
#[derive(Debug, Clone)]
pub enum PollerEvent {
    SessionStarted {
        run_id: String,
        mode: Mode,
    },
    Fetching {
        mode: Mode,
    },
    Updated {
        mode: Mode,
        run: Box<Run>,
    },
    Failed {
        mode: Mode,
        error: FetchError,
        notice: Notice,
        retry_in: Option<Duration>,
    },
    ModeChanged {
        from: Mode,
        to: Mode,
    },
    Settled {
        mode: Mode,
        reason: SettleReason,
    },
}

pub struct PollerDeps {
    pub sources: Sources,
    pub history: Arc<dyn RunHistory>,
    pub credentials: Arc<Credentials>,
    pub policy: PollPolicy,
}

struct Tracker<'a> {
    deps: &'a PollerDeps,
    run_id: String,
    force_demo: bool,
    generation: u64,
    session: Option<SessionHandle>,
    /// The current session stopped on a 401; a replaced key deserves another try.
    rejected_key: bool,
    /// Demo 404 held back until the mode check shows no other source will take over.
    pending_not_found: Option<FetchError>,
    session_tx: UnboundedSender<SessionMsg>,
    event_tx: UnboundedSender<PollerEvent>,
}

impl Tracker<'_> {
    fn desired_mode(&self) -> Mode {
        select_mode(self.force_demo, self.deps.credentials.is_present())
    }

    fn current_mode(&self) -> Option<Mode> {
        self.session.as_ref().map(|s| s.key.mode)
    }

    /// Tear down whatever runs now and start a fresh session in `mode`.
    fn start(&mut self, mode: Mode) {
        self.stop();
        self.rejected_key = false;
        self.pending_not_found = None;
        self.generation += 1;
        let key = SessionKey {
            run_id: self.run_id.clone(),
            mode,
            generation: self.generation,
        };
        let ctx = SessionCtx {
            source: self.deps.sources.for_mode(mode),
            history: self.deps.history.clone(),
            credentials: self.deps.credentials.clone(),
            policy: self.deps.policy,
        };
        info!(run_id = %self.run_id, %mode, "starting poll session");
        self.session = Some(spawn_session(key, ctx, self.session_tx.clone()));
        let _ = self.event_tx.send(PollerEvent::SessionStarted {
            run_id: self.run_id.clone(),
            mode,
        });
    }

    fn stop(&mut self) {
        if let Some(s) = self.session.take() {
            // The task exits by itself once it notices; nothing to wait for.
            drop(s.teardown());
        }
    }

    /// Re-run mode selection; a different mode means a brand-new session.
    /// Returns whether the mode changed.
    fn reevaluate(&mut self) -> bool {
        let want = self.desired_mode();
        match self.current_mode() {
            Some(have) if have == want => false,
            have => {
                if let Some(from) = have {
                    info!(%from, to = %want, "switching run source");
                    let _ = self.event_tx.send(PollerEvent::ModeChanged { from, to: want });
                }
                self.start(want);
                true
            }
        }
    }

    fn on_session_msg(&mut self, msg: SessionMsg) {
        let Some(mode) = self
            .session
            .as_ref()
            .filter(|s| s.key.generation == msg.generation)
            .map(|s| s.key.mode)
        else {
            debug!(generation = msg.generation, "dropping message from stale session");
            return;
        };

        match msg.event {
            SessionEvent::Fetching => {
                let _ = self.event_tx.send(PollerEvent::Fetching { mode });
            }
            SessionEvent::Updated(run) => {
                let _ = self.event_tx.send(PollerEvent::Updated {
                    mode,
                    run: Box::new(run),
                });
            }
            SessionEvent::Failed {
                error,
                action,
                retry_in,
            } => {
                let notice = match action {
                    FailureAction::Halt(n) => n,
                    FailureAction::Retry => Notice::Transient,
                    FailureAction::RecheckMode => {
                        self.pending_not_found = Some(error);
                        return;
                    }
                };
                if notice == Notice::Unauthorized {
                    self.deps.credentials.bus().publish(Topic::OpenSettings);
                }
                let _ = self.event_tx.send(PollerEvent::Failed {
                    mode,
                    error,
                    notice,
                    retry_in,
                });
            }
            SessionEvent::Settled(SettleReason::AwaitingModeCheck) => {
                let not_found = self.pending_not_found.take();
                if !self.reevaluate() {
                    if let Some(error) = not_found {
                        let _ = self.event_tx.send(PollerEvent::Failed {
                            mode,
                            error,
                            notice: Notice::NotFoundInDemo,
                            retry_in: None,
                        });
                    }
                    let _ = self.event_tx.send(PollerEvent::Settled {
                        mode,
                        reason: SettleReason::Halted(Notice::NotFoundInDemo),
                    });
                }
            }
            SessionEvent::Settled(reason) => {
                self.rejected_key = reason == SettleReason::Halted(Notice::Unauthorized);
                let _ = self.event_tx.send(PollerEvent::Settled { mode, reason });
            }
        }
    }
}

/// Track `run_id` until told to quit (or until the command channel closes).
pub async fn run_poller(
    deps: &PollerDeps,
    run_id: String,
    force_demo: bool,
    event_tx: UnboundedSender<PollerEvent>,
    mut cmd_rx: UnboundedReceiver<PollCommand>,
) -> Result<()> {
    let (session_tx, mut session_rx) = mpsc::unbounded_channel::<SessionMsg>();
    let mut credential_changes = deps.credentials.bus().subscribe(Topic::CredentialChanged);
    let mut bus_open = true;

    let mut tracker = Tracker {
        deps,
        run_id,
        force_demo,
        generation: 0,
        session: None,
        rejected_key: false,
        pending_not_found: None,
        session_tx,
        event_tx,
    };
    tracker.reevaluate();

    loop {
        tokio::select! {
            cmd = cmd_rx.recv() => {
                match cmd {
                    Some(PollCommand::ForceDemo(v)) => {
                        tracker.force_demo = v;
                        tracker.reevaluate();
                    }
                    Some(PollCommand::Restart) => {
                        let mode = tracker.desired_mode();
                        tracker.start(mode);
                    }
                    Some(PollCommand::Quit) | None => {
                        tracker.stop();
                        break;
                    }
                }
            }
            changed = credential_changes.recv(), if bus_open => {
                match changed {
                    Some(()) => {
                        debug!("credential changed; re-evaluating mode");
                        if !tracker.reevaluate() && tracker.rejected_key {
                            let mode = tracker.desired_mode();
                            tracker.start(mode);
                        }
                    }
                    None => bus_open = false,
                }
            }
            Some(msg) = session_rx.recv() => {
                tracker.on_session_msg(msg);
            }
        }
    }

    Ok(())
}
