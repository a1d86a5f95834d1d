//! One polling session: a `(run_id, mode)` pair, its state machine and the task driving it.

use crate::api::RunSource;
use crate::credentials::Credentials;
use crate::error::FetchError;
use crate::model::{Mode, Run, RunStatus};
use crate::poller::policy::{classify, Cadence, FailureAction, Notice, PollPolicy};
use crate::storage::{record_seen, RunHistory};
use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc,
};
use std::time::Duration;
use tokio::sync::{mpsc::UnboundedSender, Notify};
use tokio::task::JoinHandle;
use tracing::{debug, info};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionKey {
    pub run_id: String,
    pub mode: Mode,
    /// Bumped for every new session so late messages from older ones can be told apart.
    pub generation: u64,
}

#[derive(Debug, Clone, PartialEq)]
pub enum SettleReason {
    /// The run reached a status that is not polled further.
    Terminal(RunStatus),
    /// An unretryable error.
    Halted(Notice),
    /// Waiting for the controller to decide whether another mode should take over.
    AwaitingModeCheck,
}

#[derive(Debug, Clone, PartialEq)]
pub enum SessionState {
    Idle,
    Polling,
    Settled(SettleReason),
}

/// What the driver should do next.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Step {
    FetchAfter(Duration),
    Stop,
    RecheckMode,
}

/// Session bookkeeping with no timers and no I/O.
#[derive(Debug)]
pub struct SessionMachine {
    mode: Mode,
    policy: PollPolicy,
    state: SessionState,
    in_flight: bool,
    consecutive_failures: u32,
    last_run: Option<Run>,
    last_error: Option<FetchError>,
}

impl SessionMachine {
    pub fn new(mode: Mode, policy: PollPolicy) -> Self {
        Self {
            mode,
            policy,
            state: SessionState::Idle,
            in_flight: false,
            consecutive_failures: 0,
            last_run: None,
            last_error: None,
        }
    }

    pub fn state(&self) -> &SessionState {
        &self.state
    }

    pub fn is_settled(&self) -> bool {
        matches!(self.state, SessionState::Settled(_))
    }

    pub fn last_run(&self) -> Option<&Run> {
        self.last_run.as_ref()
    }

    pub fn last_error(&self) -> Option<&FetchError> {
        self.last_error.as_ref()
    }

    /// Claim the next fetch. Refused while one is in flight or once the session has settled.
    pub fn begin_fetch(&mut self) -> bool {
        if self.in_flight || self.is_settled() {
            return false;
        }
        self.in_flight = true;
        self.state = SessionState::Polling;
        true
    }

    pub fn on_success(&mut self, run: Run) -> Step {
        self.in_flight = false;
        self.consecutive_failures = 0;
        self.last_error = None;
        let step = match self.policy.next_interval(&run.status) {
            Cadence::After(d) => Step::FetchAfter(d),
            Cadence::Stop => {
                self.state = SessionState::Settled(SettleReason::Terminal(run.status.clone()));
                Step::Stop
            }
        };
        self.last_run = Some(run);
        step
    }

    pub fn on_failure(&mut self, err: FetchError, credential_present: bool) -> (FailureAction, Step) {
        self.in_flight = false;
        let action = classify(&err, self.mode, credential_present);
        self.last_error = Some(err);
        let step = match action {
            FailureAction::Retry => {
                self.consecutive_failures = self.consecutive_failures.saturating_add(1);
                Step::FetchAfter(self.policy.retry_delay(self.consecutive_failures))
            }
            FailureAction::Halt(notice) => {
                self.state = SessionState::Settled(SettleReason::Halted(notice));
                Step::Stop
            }
            FailureAction::RecheckMode => {
                self.state = SessionState::Settled(SettleReason::AwaitingModeCheck);
                Step::RecheckMode
            }
        };
        (action, step)
    }
}

#[derive(Debug, Clone)]
pub(crate) enum SessionEvent {
    Fetching,
    Updated(Run),
    Failed {
        error: FetchError,
        action: FailureAction,
        retry_in: Option<Duration>,
    },
    Settled(SettleReason),
}

#[derive(Debug, Clone)]
pub(crate) struct SessionMsg {
    pub generation: u64,
    pub event: SessionEvent,
}

/// Collaborators a session needs; cloned into every session task.
#[derive(Clone)]
pub(crate) struct SessionCtx {
    pub source: Arc<dyn RunSource>,
    pub history: Arc<dyn RunHistory>,
    pub credentials: Arc<Credentials>,
    pub policy: PollPolicy,
}

/// Owner's handle on a running session task.
pub(crate) struct SessionHandle {
    pub key: SessionKey,
    alive: Arc<AtomicBool>,
    wake: Arc<Notify>,
    join: JoinHandle<()>,
}

impl SessionHandle {
    /// Stop scheduling. A fetch already in flight is left to finish and its result is dropped.
    pub fn teardown(self) -> JoinHandle<()> {
        self.alive.store(false, Ordering::SeqCst);
        self.wake.notify_one();
        self.join
    }
}

pub(crate) fn spawn_session(
    key: SessionKey,
    ctx: SessionCtx,
    tx: UnboundedSender<SessionMsg>,
) -> SessionHandle {
    let alive = Arc::new(AtomicBool::new(true));
    let wake = Arc::new(Notify::new());
    let join = tokio::spawn(drive(key.clone(), ctx, alive.clone(), wake.clone(), tx));
    SessionHandle {
        key,
        alive,
        wake,
        join,
    }
}

async fn drive(
    key: SessionKey,
    ctx: SessionCtx,
    alive: Arc<AtomicBool>,
    wake: Arc<Notify>,
    tx: UnboundedSender<SessionMsg>,
) {
    let is_alive = || alive.load(Ordering::SeqCst);
    let emit = |event: SessionEvent| {
        if is_alive() {
            let _ = tx.send(SessionMsg {
                generation: key.generation,
                event,
            });
        }
    };

    let mut machine = SessionMachine::new(key.mode, ctx.policy);
    loop {
        if !is_alive() || !machine.begin_fetch() {
            return;
        }
        emit(SessionEvent::Fetching);
        debug!(run_id = %key.run_id, mode = %key.mode, "fetching run");

        let result = ctx.source.fetch_run(&key.run_id).await;
        if !is_alive() {
            debug!(run_id = %key.run_id, "dropping response for torn-down session");
            return;
        }

        let step = match result {
            Ok(run) => {
                record_seen(
                    ctx.history.clone(),
                    key.run_id.clone(),
                    run.status.reported_label().map(str::to_string),
                )
                .await;
                emit(SessionEvent::Updated(run.clone()));
                machine.on_success(run)
            }
            Err(error) => {
                let (action, step) = machine.on_failure(error.clone(), ctx.credentials.is_present());
                let retry_in = match step {
                    Step::FetchAfter(d) => Some(d),
                    _ => None,
                };
                emit(SessionEvent::Failed {
                    error,
                    action,
                    retry_in,
                });
                step
            }
        };

        match step {
            Step::FetchAfter(delay) => {
                tokio::select! {
                    _ = tokio::time::sleep(delay) => {}
                    _ = wake.notified() => {}
                }
            }
            Step::Stop | Step::RecheckMode => {
                if let Some(err) = machine.last_error() {
                    info!(run_id = %key.run_id, mode = %key.mode, "polling stopped: {err}");
                } else if let Some(run) = machine.last_run() {
                    info!(run_id = %key.run_id, status = %run.status, "run settled");
                }
                if let SessionState::Settled(reason) = machine.state() {
                    emit(SessionEvent::Settled(reason.clone()));
                }
                return;
            }
        }
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::error::ApiBody;
    use crate::events::EventBus;
    use crate::storage::MemoryRunHistory;
    use async_trait::async_trait;
    use std::collections::VecDeque;
    use std::sync::Mutex;
    use tokio::sync::mpsc;
    use tokio::time::Instant;

    pub(crate) fn run_with(status: &str) -> Run {
        Run::from_value("r1", &serde_json::json!({ "run_id": "r1", "status": status }))
    }

    pub(crate) fn api_err(status: u16) -> FetchError {
        FetchError::api("/v1/runs/r1", status, "", ApiBody::Text(String::new()))
    }

    /// Replays scripted responses; repeats the last one when the script runs out.
    pub(crate) struct ScriptedSource {
        script: Mutex<VecDeque<Result<Run, FetchError>>>,
        last: Mutex<Option<Result<Run, FetchError>>>,
        pub calls: Mutex<Vec<Instant>>,
        gate: Option<Arc<Notify>>,
    }

    impl ScriptedSource {
        pub(crate) fn new(script: Vec<Result<Run, FetchError>>) -> Self {
            Self {
                script: Mutex::new(script.into()),
                last: Mutex::new(None),
                calls: Mutex::new(Vec::new()),
                gate: None,
            }
        }

        /// Every fetch waits for `gate` to be notified before answering.
        pub(crate) fn gated(script: Vec<Result<Run, FetchError>>, gate: Arc<Notify>) -> Self {
            Self {
                gate: Some(gate),
                ..Self::new(script)
            }
        }

        pub(crate) fn call_count(&self) -> usize {
            self.calls.lock().unwrap().len()
        }
    }

    #[async_trait]
    impl RunSource for ScriptedSource {
        async fn fetch_run(&self, _run_id: &str) -> Result<Run, FetchError> {
            self.calls.lock().unwrap().push(Instant::now());
            if let Some(gate) = &self.gate {
                gate.notified().await;
            }
            let next = self.script.lock().unwrap().pop_front();
            let mut last = self.last.lock().unwrap();
            match next {
                Some(r) => {
                    *last = Some(r.clone());
                    r
                }
                None => last.clone().unwrap_or_else(|| Err(api_err(500))),
            }
        }
    }

    fn ctx(
        source: Arc<ScriptedSource>,
        history: Arc<MemoryRunHistory>,
        key: Option<&str>,
    ) -> SessionCtx {
        SessionCtx {
            source,
            history,
            credentials: Arc::new(Credentials::in_memory(key.map(str::to_string), EventBus::new())),
            policy: PollPolicy::default(),
        }
    }

    fn key(mode: Mode) -> SessionKey {
        SessionKey {
            run_id: "r1".into(),
            mode,
            generation: 7,
        }
    }

    #[test]
    fn running_schedules_one_fetch_succeeded_none() {
        let mut m = SessionMachine::new(Mode::Live, PollPolicy::default());
        assert!(m.begin_fetch());
        assert_eq!(
            m.on_success(run_with("running")),
            Step::FetchAfter(Duration::from_millis(2500))
        );
        assert!(!m.is_settled());
        assert!(m.begin_fetch());
        assert_eq!(m.on_success(run_with("succeeded")), Step::Stop);
        assert_eq!(
            m.state(),
            &SessionState::Settled(SettleReason::Terminal(RunStatus::Succeeded))
        );
        assert!(!m.begin_fetch());
    }

    #[test]
    fn one_fetch_in_flight_at_a_time() {
        let mut m = SessionMachine::new(Mode::Live, PollPolicy::default());
        assert!(m.begin_fetch());
        assert!(!m.begin_fetch());
    }

    #[test]
    fn unauthorized_halts_and_refuses_further_ticks() {
        let mut m = SessionMachine::new(Mode::Live, PollPolicy::default());
        assert!(m.begin_fetch());
        let (action, step) = m.on_failure(api_err(401), true);
        assert_eq!(action, FailureAction::Halt(Notice::Unauthorized));
        assert_eq!(step, Step::Stop);
        assert!(!m.begin_fetch());
        assert!(!m.begin_fetch());
        assert_eq!(m.last_error().and_then(FetchError::status), Some(401));
    }

    #[test]
    fn transient_errors_back_off_and_reset_on_success() {
        let mut m = SessionMachine::new(Mode::Live, PollPolicy::default());
        m.begin_fetch();
        assert_eq!(m.on_failure(api_err(502), true).1, Step::FetchAfter(Duration::from_secs(5)));
        m.begin_fetch();
        assert_eq!(m.on_failure(api_err(502), true).1, Step::FetchAfter(Duration::from_secs(10)));
        m.begin_fetch();
        m.on_success(run_with("running"));
        assert!(m.last_error().is_none());
        m.begin_fetch();
        assert_eq!(m.on_failure(api_err(502), true).1, Step::FetchAfter(Duration::from_secs(5)));
        assert_eq!(m.last_run().map(|r| r.status.clone()), Some(RunStatus::Running));
    }

    #[tokio::test(start_paused = true)]
    async fn running_then_succeeded_fetches_exactly_twice() {
        let source = Arc::new(ScriptedSource::new(vec![
            Ok(run_with("running")),
            Ok(run_with("succeeded")),
        ]));
        let history = Arc::new(MemoryRunHistory::default());
        let (tx, mut rx) = mpsc::unbounded_channel();
        let start = Instant::now();
        let handle = spawn_session(key(Mode::Live), ctx(source.clone(), history.clone(), Some("k")), tx);

        let mut settled = None;
        while let Some(msg) = rx.recv().await {
            assert_eq!(msg.generation, 7);
            if let SessionEvent::Settled(reason) = msg.event {
                settled = Some(reason);
            }
        }
        assert_eq!(settled, Some(SettleReason::Terminal(RunStatus::Succeeded)));

        let calls = source.calls.lock().unwrap().clone();
        assert_eq!(calls.len(), 2);
        assert_eq!(calls[0] - start, Duration::ZERO);
        assert_eq!(calls[1] - calls[0], Duration::from_millis(2500));

        tokio::time::sleep(Duration::from_secs(60)).await;
        assert_eq!(source.call_count(), 2);

        let recent = history.list().unwrap();
        assert_eq!(recent[0].run_id, "r1");
        assert_eq!(recent[0].last_known_status.as_deref(), Some("succeeded"));
        let _ = handle.teardown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn missing_status_does_not_overwrite_cached_status() {
        let source = Arc::new(ScriptedSource::new(vec![
            Ok(run_with("running")),
            Ok(Run::from_value("r1", &serde_json::json!({ "run_id": "r1" }))),
        ]));
        let history = Arc::new(MemoryRunHistory::default());
        let (tx, mut rx) = mpsc::unbounded_channel();
        let _handle = spawn_session(key(Mode::Live), ctx(source.clone(), history.clone(), Some("k")), tx);

        let mut settled = None;
        while let Some(msg) = rx.recv().await {
            if let SessionEvent::Settled(reason) = msg.event {
                settled = Some(reason);
            }
        }
        assert_eq!(settled, Some(SettleReason::Terminal(RunStatus::Unknown(None))));
        assert_eq!(source.call_count(), 2);
        let recent = history.list().unwrap();
        assert_eq!(recent[0].last_known_status.as_deref(), Some("running"));
    }

    #[tokio::test(start_paused = true)]
    async fn unauthorized_stops_the_cadence() {
        let source = Arc::new(ScriptedSource::new(vec![Err(api_err(401))]));
        let (tx, mut rx) = mpsc::unbounded_channel();
        let _handle = spawn_session(
            key(Mode::Live),
            ctx(source.clone(), Arc::new(MemoryRunHistory::default()), Some("k")),
            tx,
        );

        let mut events = Vec::new();
        while let Some(msg) = rx.recv().await {
            events.push(msg.event);
        }
        assert!(matches!(
            events.last(),
            Some(SessionEvent::Settled(SettleReason::Halted(Notice::Unauthorized)))
        ));
        tokio::time::sleep(Duration::from_secs(120)).await;
        assert_eq!(source.call_count(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn demo_not_found_with_key_asks_for_mode_check_without_refetching() {
        let source = Arc::new(ScriptedSource::new(vec![Err(api_err(404))]));
        let (tx, mut rx) = mpsc::unbounded_channel();
        let _handle = spawn_session(
            key(Mode::Demo),
            ctx(source.clone(), Arc::new(MemoryRunHistory::default()), Some("k")),
            tx,
        );

        let mut saw_recheck = false;
        while let Some(msg) = rx.recv().await {
            if let SessionEvent::Failed { action, retry_in, .. } = &msg.event {
                assert_eq!(*action, FailureAction::RecheckMode);
                assert_eq!(*retry_in, None);
                saw_recheck = true;
            }
        }
        assert!(saw_recheck);
        tokio::time::sleep(Duration::from_secs(120)).await;
        assert_eq!(source.call_count(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn transient_errors_keep_polling() {
        let source = Arc::new(ScriptedSource::new(vec![
            Err(api_err(503)),
            Ok(run_with("failed")),
        ]));
        let (tx, mut rx) = mpsc::unbounded_channel();
        let _handle = spawn_session(
            key(Mode::Live),
            ctx(source.clone(), Arc::new(MemoryRunHistory::default()), Some("k")),
            tx,
        );
        let mut last = None;
        while let Some(msg) = rx.recv().await {
            last = Some(msg.event);
        }
        assert!(matches!(
            last,
            Some(SessionEvent::Settled(SettleReason::Terminal(RunStatus::Failed)))
        ));
        let calls = source.calls.lock().unwrap().clone();
        assert_eq!(calls[1] - calls[0], Duration::from_secs(5));
    }

    #[tokio::test(start_paused = true)]
    async fn teardown_drops_in_flight_response() {
        let gate = Arc::new(Notify::new());
        let source = Arc::new(ScriptedSource::gated(vec![Ok(run_with("running"))], gate.clone()));
        let history = Arc::new(MemoryRunHistory::default());
        let (tx, mut rx) = mpsc::unbounded_channel();
        let handle = spawn_session(key(Mode::Live), ctx(source.clone(), history.clone(), Some("k")), tx);

        let first = rx.recv().await.unwrap();
        assert!(matches!(first.event, SessionEvent::Fetching));

        let join = handle.teardown();
        gate.notify_one();
        join.await.unwrap();

        assert!(rx.recv().await.is_none());
        assert!(history.list().unwrap().is_empty());
        assert_eq!(source.call_count(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn teardown_cancels_pending_timer() {
        let source = Arc::new(ScriptedSource::new(vec![Ok(run_with("queued"))]));
        let (tx, mut rx) = mpsc::unbounded_channel();
        let handle = spawn_session(
            key(Mode::Live),
            ctx(source.clone(), Arc::new(MemoryRunHistory::default()), Some("k")),
            tx,
        );

        loop {
            let msg = rx.recv().await.unwrap();
            if matches!(msg.event, SessionEvent::Updated(_)) {
                break;
            }
        }
        handle.teardown().await.unwrap();
        tokio::time::sleep(Duration::from_secs(30)).await;
        assert_eq!(source.call_count(), 1);
        assert!(rx.recv().await.is_none());
    }
}
