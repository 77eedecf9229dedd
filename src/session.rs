//! Streaming chat sessions.
//!
//! A session owns one in-flight request. It connects through a [`ChannelConnector`],
//! sends the serialized request exactly once, and folds inbound fragments into callbacks
//! on a [`SessionObserver`] in arrival order until a terminal fragment arrives, the
//! channel drops, or the caller invokes [`SessionHandle::close`].
//!
//! Callers serialize sends per conversation; opening a second session for the same turn
//! is not prevented here.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use tokio::sync::Notify;
use tokio::task::{AbortHandle, JoinHandle};

use crate::channel::{ChannelConnector, DuplexChannel, DynChannelConnector, Frame};
use crate::error::LLMError;
use crate::ledger::CostLedger;
use crate::types::{ChatRequest, StreamFragment, UsageStats};

/// Message passed to [`SessionObserver::on_error`] when a frame is not a valid fragment.
pub const MALFORMED_FRAGMENT_MESSAGE: &str = "received a malformed fragment from the server";

/// Receives the outcome of a streaming session.
///
/// Callbacks run on the session's driver task, one at a time, in arrival order. After
/// `on_complete` or `on_error` for a terminal fragment nothing else is delivered.
/// `on_error` may also fire for a malformed frame, in which case the session stays open.
pub trait SessionObserver: Send + 'static {
    fn on_content(&mut self, text: &str);
    fn on_complete(&mut self, usage: Option<&UsageStats>);
    fn on_error(&mut self, message: &str);
}

/// Lifecycle of a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// Waiting for the channel handshake.
    Connecting,
    /// Request sent, fragments flowing.
    Open,
    /// A `done` fragment arrived.
    Completed,
    /// A terminal error was delivered.
    Errored,
    /// [`SessionHandle::close`] ran before any terminal state.
    Cancelled,
}

impl SessionState {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            SessionState::Completed | SessionState::Errored | SessionState::Cancelled
        )
    }
}

#[derive(Debug)]
struct Progress {
    state: SessionState,
    content: String,
}

/// Pending `close_after` timer; cleared once the driver stops.
#[derive(Debug, Default)]
struct Deadline {
    driver_done: bool,
    timer: Option<AbortHandle>,
}

#[derive(Debug)]
struct Shared {
    closed: AtomicBool,
    close_signal: Notify,
    progress: Mutex<Progress>,
    deadline: Mutex<Deadline>,
}

impl Shared {
    fn new() -> Self {
        Self {
            closed: AtomicBool::new(false),
            close_signal: Notify::new(),
            progress: Mutex::new(Progress {
                state: SessionState::Connecting,
                content: String::new(),
            }),
            deadline: Mutex::new(Deadline::default()),
        }
    }

    fn deadline(&self) -> MutexGuard<'_, Deadline> {
        self.deadline.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Called when the driver exits; drops any pending timer.
    fn driver_finished(&self) {
        let mut deadline = self.deadline();
        deadline.driver_done = true;
        if let Some(timer) = deadline.timer.take() {
            timer.abort();
        }
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    fn progress(&self) -> MutexGuard<'_, Progress> {
        self.progress.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn state(&self) -> SessionState {
        self.progress().state
    }

    fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        {
            let mut progress = self.progress();
            if !progress.state.is_terminal() {
                progress.state = SessionState::Cancelled;
            }
        }
        // `notify_one` stores a permit, so a driver that is not waiting yet still sees it.
        self.close_signal.notify_one();
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Flow {
    Continue,
    Finished,
}

/// Turns raw frames into observer callbacks and enforces terminal-state exclusivity.
pub(crate) struct FragmentDispatcher<O> {
    observer: O,
    shared: Arc<Shared>,
    provider: String,
    model: String,
    ledger: Option<Arc<CostLedger>>,
}

impl<O: SessionObserver> FragmentDispatcher<O> {
    fn new(
        observer: O,
        shared: Arc<Shared>,
        request: &ChatRequest,
        ledger: Option<Arc<CostLedger>>,
    ) -> Self {
        Self {
            observer,
            shared,
            provider: request.provider.clone(),
            model: request.model.clone(),
            ledger,
        }
    }

    /// Whether callbacks may still be delivered.
    fn is_live(&self) -> bool {
        !self.shared.is_closed() && !self.shared.state().is_terminal()
    }

    fn mark_open(&self) {
        let mut progress = self.shared.progress();
        if progress.state == SessionState::Connecting {
            progress.state = SessionState::Open;
        }
    }

    /// Sets a terminal state unless `close()` got there first.
    fn finish(&self, state: SessionState) -> bool {
        let mut progress = self.shared.progress();
        if progress.state.is_terminal() {
            return false;
        }
        progress.state = state;
        true
    }

    pub(crate) fn handle_frame(&mut self, text: &str) -> Flow {
        if !self.is_live() {
            return Flow::Finished;
        }

        let fragment = match serde_json::from_str::<StreamFragment>(text) {
            Ok(fragment) => fragment,
            Err(err) => return self.malformed(&err.to_string()),
        };

        match fragment {
            StreamFragment::Content(text) => {
                self.shared.progress().content.push_str(&text);
                self.observer.on_content(&text);
                Flow::Continue
            }
            StreamFragment::Error(message) => {
                if self.finish(SessionState::Errored) {
                    tracing::info!(
                        provider = %self.provider,
                        model = %self.model,
                        error = %message,
                        "stream reported an error"
                    );
                    self.observer.on_error(&message);
                }
                Flow::Finished
            }
            StreamFragment::Done { usage } => {
                if !self.finish(SessionState::Completed) {
                    return Flow::Finished;
                }
                if let (Some(ledger), Some(usage)) = (&self.ledger, &usage) {
                    // Rejections are logged by the ledger; completion is delivered regardless.
                    let _ = ledger.record(usage, &self.provider, &self.model);
                }
                tracing::debug!(provider = %self.provider, model = %self.model, "stream completed");
                self.observer.on_complete(usage.as_ref());
                Flow::Finished
            }
        }
    }

    /// Reports an undecodable frame without ending the session.
    pub(crate) fn malformed(&mut self, reason: &str) -> Flow {
        if !self.is_live() {
            return Flow::Finished;
        }
        tracing::debug!(error = %reason, "dropping malformed fragment");
        self.observer.on_error(MALFORMED_FRAGMENT_MESSAGE);
        Flow::Continue
    }

    /// Reports a transport-level failure as a terminal error.
    pub(crate) fn fail(&mut self, message: &str) {
        if self.shared.is_closed() {
            return;
        }
        if self.finish(SessionState::Errored) {
            tracing::warn!(
                provider = %self.provider,
                model = %self.model,
                error = %message,
                "stream failed"
            );
            self.observer.on_error(message);
        }
    }
}

/// Opens streaming sessions against one endpoint.
#[derive(Clone)]
pub struct StreamingSession {
    connector: DynChannelConnector,
    url: String,
    ledger: Option<Arc<CostLedger>>,
}

impl StreamingSession {
    pub fn new(connector: DynChannelConnector, url: impl Into<String>) -> Self {
        Self {
            connector,
            url: url.into(),
            ledger: None,
        }
    }

    /// Records the usage of every completed session into `ledger`.
    pub fn with_ledger(mut self, ledger: Arc<CostLedger>) -> Self {
        self.ledger = Some(ledger);
        self
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    /// Validates `request` and starts the session on the current tokio runtime.
    ///
    /// # Errors
    ///
    /// Returns [`LLMError::Validation`] for a malformed request; nothing is sent in that
    /// case. Every later failure is delivered through `observer`.
    ///
    /// # Panics
    ///
    /// Panics when called outside a tokio runtime.
    pub fn open<O: SessionObserver>(
        &self,
        request: ChatRequest,
        observer: O,
    ) -> Result<SessionHandle, LLMError> {
        request.validate()?;
        let payload = serde_json::to_string(&request)
            .map_err(|err| LLMError::validation(format!("failed to serialize request: {err}")))?;

        let shared = Arc::new(Shared::new());
        let dispatcher =
            FragmentDispatcher::new(observer, Arc::clone(&shared), &request, self.ledger.clone());
        tracing::debug!(
            url = %self.url,
            provider = %request.provider,
            model = %request.model,
            messages = request.messages.len(),
            "opening stream"
        );

        let task = tokio::spawn(drive(
            Arc::clone(&self.connector),
            self.url.clone(),
            payload,
            dispatcher,
        ));
        Ok(SessionHandle {
            shared,
            task: Some(task),
        })
    }
}

async fn drive<O: SessionObserver>(
    connector: DynChannelConnector,
    url: String,
    payload: String,
    dispatcher: FragmentDispatcher<O>,
) {
    let shared = Arc::clone(&dispatcher.shared);
    run(connector, url, payload, dispatcher).await;
    shared.driver_finished();
}

async fn run<O: SessionObserver>(
    connector: DynChannelConnector,
    url: String,
    payload: String,
    mut dispatcher: FragmentDispatcher<O>,
) {
    let shared = Arc::clone(&dispatcher.shared);

    let connected = tokio::select! {
        biased;
        _ = shared.close_signal.notified() => return,
        result = connector.connect(&url) => result,
    };
    let mut channel = match connected {
        Ok(channel) => channel,
        Err(err) => {
            dispatcher.fail(&err.to_string());
            return;
        }
    };

    if shared.is_closed() {
        close_channel(channel.as_mut()).await;
        return;
    }
    dispatcher.mark_open();

    if let Err(err) = channel.send_text(payload).await {
        dispatcher.fail(&err.to_string());
        close_channel(channel.as_mut()).await;
        return;
    }
    tracing::debug!(%url, "request sent");

    loop {
        let frame = tokio::select! {
            biased;
            _ = shared.close_signal.notified() => break,
            frame = channel.next_frame() => frame,
        };
        match frame {
            Some(Ok(Frame::Text(text))) => {
                if dispatcher.handle_frame(&text) == Flow::Finished {
                    break;
                }
            }
            Some(Ok(Frame::Malformed(reason))) => {
                if dispatcher.malformed(&reason) == Flow::Finished {
                    break;
                }
            }
            Some(Ok(Frame::Close)) | None => {
                let err = LLMError::StreamClosed {
                    message: "connection closed before the response completed".to_string(),
                };
                dispatcher.fail(&err.to_string());
                break;
            }
            Some(Err(err)) => {
                dispatcher.fail(&err.to_string());
                break;
            }
        }
    }

    close_channel(channel.as_mut()).await;
}

async fn close_channel(channel: &mut dyn DuplexChannel) {
    if let Err(err) = channel.close().await {
        tracing::debug!(error = %err, "failed to close stream channel");
    }
}

/// Caller-side view of a running session.
///
/// Dropping the handle does not cancel the session; call [`SessionHandle::close`].
#[derive(Debug)]
pub struct SessionHandle {
    shared: Arc<Shared>,
    task: Option<JoinHandle<()>>,
}

impl SessionHandle {
    /// Stops the session silently. Safe to call repeatedly and from any state.
    ///
    /// A callback already running may finish, but no new callback starts afterwards,
    /// including errors caused by tearing down the channel.
    pub fn close(&self) {
        if !self.shared.is_closed() {
            tracing::debug!("closing stream");
        }
        self.shared.close();
    }

    /// Closes the session after `timeout` unless it ended first.
    ///
    /// A later call replaces the earlier deadline. The timer is dropped as soon as the
    /// session stops.
    pub fn close_after(&self, timeout: Duration) {
        let mut deadline = self.shared.deadline();
        if deadline.driver_done {
            return;
        }
        let shared = Arc::clone(&self.shared);
        let timer = tokio::spawn(async move {
            tokio::time::sleep(timeout).await;
            if !shared.state().is_terminal() {
                tracing::debug!(?timeout, "stream timed out");
            }
            shared.close();
        });
        if let Some(previous) = deadline.timer.replace(timer.abort_handle()) {
            previous.abort();
        }
    }

    pub fn state(&self) -> SessionState {
        self.shared.state()
    }

    pub fn is_closed(&self) -> bool {
        self.shared.is_closed()
    }

    /// Content accumulated from every delivered `content` fragment.
    pub fn content(&self) -> String {
        self.shared.progress().content.clone()
    }

    /// Waits for the driver task to stop and returns the final state.
    pub async fn join(mut self) -> SessionState {
        if let Some(task) = self.task.take() {
            if let Err(err) = task.await {
                tracing::warn!(error = %err, "stream task ended abnormally");
            }
        }
        self.shared.state()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::ChatMessage;

    #[derive(Debug, Clone, PartialEq)]
    enum Event {
        Content(String),
        Complete(Option<UsageStats>),
        Error(String),
    }

    #[derive(Clone, Default)]
    struct Recorder {
        events: Arc<Mutex<Vec<Event>>>,
    }

    impl Recorder {
        fn events(&self) -> Vec<Event> {
            self.events.lock().unwrap().clone()
        }
    }

    impl SessionObserver for Recorder {
        fn on_content(&mut self, text: &str) {
            self.events.lock().unwrap().push(Event::Content(text.to_string()));
        }

        fn on_complete(&mut self, usage: Option<&UsageStats>) {
            self.events.lock().unwrap().push(Event::Complete(usage.cloned()));
        }

        fn on_error(&mut self, message: &str) {
            self.events.lock().unwrap().push(Event::Error(message.to_string()));
        }
    }

    fn request() -> ChatRequest {
        ChatRequest::builder("openai", "gpt-4.1-mini")
            .message(ChatMessage::user("hello"))
            .build()
            .expect("request")
    }

    fn dispatcher(
        recorder: &Recorder,
        ledger: Option<Arc<CostLedger>>,
    ) -> (FragmentDispatcher<Recorder>, Arc<Shared>) {
        let shared = Arc::new(Shared::new());
        let dispatcher =
            FragmentDispatcher::new(recorder.clone(), Arc::clone(&shared), &request(), ledger);
        dispatcher.mark_open();
        (dispatcher, shared)
    }

    #[test]
    fn content_then_done_accumulates_and_completes_once() {
        let recorder = Recorder::default();
        let (mut dispatcher, shared) = dispatcher(&recorder, None);

        assert_eq!(dispatcher.handle_frame(r#"{"content":"Hel"}"#), Flow::Continue);
        assert_eq!(dispatcher.handle_frame(r#"{"content":"lo"}"#), Flow::Continue);
        assert_eq!(
            dispatcher.handle_frame(
                r#"{"done":true,"usage":{"prompt_tokens":5,"completion_tokens":2,"total_tokens":7,"cost_usd":0.0001}}"#
            ),
            Flow::Finished
        );

        assert_eq!(shared.progress().content, "Hello");
        assert_eq!(shared.state(), SessionState::Completed);
        assert_eq!(
            recorder.events(),
            vec![
                Event::Content("Hel".into()),
                Event::Content("lo".into()),
                Event::Complete(Some(UsageStats::new(5, 2, 0.0001))),
            ]
        );
    }

    #[test]
    fn fragments_after_terminal_are_not_forwarded() {
        let recorder = Recorder::default();
        let (mut dispatcher, shared) = dispatcher(&recorder, None);

        dispatcher.handle_frame(r#"{"error":"invalid api key"}"#);
        assert_eq!(dispatcher.handle_frame(r#"{"content":"late"}"#), Flow::Finished);
        assert_eq!(dispatcher.handle_frame(r#"{"done":true}"#), Flow::Finished);
        dispatcher.fail("transport dropped");

        assert_eq!(shared.state(), SessionState::Errored);
        assert_eq!(recorder.events(), vec![Event::Error("invalid api key".into())]);
    }

    #[test]
    fn malformed_frame_reports_error_and_keeps_session_open() {
        let recorder = Recorder::default();
        let (mut dispatcher, shared) = dispatcher(&recorder, None);

        assert_eq!(dispatcher.handle_frame("{not json"), Flow::Continue);
        assert_eq!(dispatcher.handle_frame(r#"{"content":"still here"}"#), Flow::Continue);

        assert_eq!(shared.state(), SessionState::Open);
        assert_eq!(
            recorder.events(),
            vec![
                Event::Error(MALFORMED_FRAGMENT_MESSAGE.into()),
                Event::Content("still here".into()),
            ]
        );
    }

    #[test]
    fn close_suppresses_every_later_callback() {
        let recorder = Recorder::default();
        let (mut dispatcher, shared) = dispatcher(&recorder, None);

        dispatcher.handle_frame(r#"{"content":"a"}"#);
        shared.close();
        shared.close();
        dispatcher.handle_frame(r#"{"content":"b"}"#);
        dispatcher.handle_frame("garbage");
        dispatcher.fail("connection reset");

        assert_eq!(shared.state(), SessionState::Cancelled);
        assert_eq!(recorder.events(), vec![Event::Content("a".into())]);
    }

    #[test]
    fn close_after_completion_keeps_completed_state() {
        let recorder = Recorder::default();
        let (mut dispatcher, shared) = dispatcher(&recorder, None);
        dispatcher.handle_frame(r#"{"done":true}"#);
        shared.close();
        assert_eq!(shared.state(), SessionState::Completed);
        assert_eq!(recorder.events(), vec![Event::Complete(None)]);
    }

    #[test]
    fn completion_records_usage_into_ledger() {
        let recorder = Recorder::default();
        let ledger = Arc::new(CostLedger::new());
        let (mut dispatcher, _shared) = dispatcher(&recorder, Some(Arc::clone(&ledger)));

        dispatcher.handle_frame(
            r#"{"done":true,"usage":{"prompt_tokens":5,"completion_tokens":2,"total_tokens":7,"cost_usd":0.5}}"#,
        );

        let summary = ledger.summarize();
        assert_eq!(summary.total_calls, 1);
        assert_eq!(summary.total_tokens, 7);
        assert_eq!(summary.by_provider["openai"].cost, 0.5);
        assert_eq!(summary.by_model["gpt-4.1-mini"].calls, 1);
    }

    #[test]
    fn rejected_usage_still_completes() {
        let recorder = Recorder::default();
        let ledger = Arc::new(CostLedger::new());
        let (mut dispatcher, _shared) = dispatcher(&recorder, Some(Arc::clone(&ledger)));

        dispatcher.handle_frame(
            r#"{"done":true,"usage":{"prompt_tokens":-5,"completion_tokens":2,"total_tokens":-3,"cost_usd":0.5}}"#,
        );

        assert_eq!(ledger.summarize().total_calls, 0);
        assert!(matches!(recorder.events().as_slice(), [Event::Complete(Some(_))]));
    }

    #[test]
    fn undecodable_frame_keeps_session_open() {
        let recorder = Recorder::default();
        let (mut dispatcher, shared) = dispatcher(&recorder, None);

        assert_eq!(
            dispatcher.malformed("binary frame is not UTF-8"),
            Flow::Continue
        );
        assert_eq!(dispatcher.handle_frame(r#"{"content":"ok"}"#), Flow::Continue);
        assert_eq!(dispatcher.handle_frame(r#"{"done":true}"#), Flow::Finished);
        assert_eq!(dispatcher.malformed("late"), Flow::Finished);

        assert_eq!(shared.state(), SessionState::Completed);
        assert_eq!(
            recorder.events(),
            vec![
                Event::Error(MALFORMED_FRAGMENT_MESSAGE.into()),
                Event::Content("ok".into()),
                Event::Complete(None),
            ]
        );
    }

    async fn settle(shared: &Arc<Shared>, expected: usize) -> usize {
        for _ in 0..100 {
            if Arc::strong_count(shared) == expected {
                break;
            }
            tokio::task::yield_now().await;
        }
        Arc::strong_count(shared)
    }

    #[tokio::test]
    async fn deadline_timer_is_dropped_when_driver_stops() {
        let shared = Arc::new(Shared::new());
        let handle = SessionHandle {
            shared: Arc::clone(&shared),
            task: None,
        };

        handle.close_after(Duration::from_secs(3600));
        handle.close_after(Duration::from_secs(7200));
        assert_eq!(settle(&shared, 3).await, 3, "only the latest timer is kept");

        shared.driver_finished();
        assert_eq!(settle(&shared, 2).await, 2, "timer released its reference");
        assert!(!handle.is_closed());

        handle.close_after(Duration::from_secs(3600));
        assert_eq!(Arc::strong_count(&shared), 2, "no timer after the driver stopped");
    }
}
