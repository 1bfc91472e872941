//! Request/response over broadcast channels
//!
//! The hubs answer an invocation `Request<X>(id)` by broadcasting
//! `<X>Loading` (zero or more times), then either `Receive<X>` or `<X>Error`
//! to every listener on the channel. A call here registers one listener,
//! sends the invocation and settles on the first terminal event, the
//! invocation's own failed completion, channel teardown or the deadline,
//! whichever comes first. Settling consumes the listener, so anything arriving
//! later is never observed.
//!
//! Broadcasts carry no reply-to address. Under `CorrelationPolicy::AnyEvent`
//! every pending call on a channel accepts the first terminal event it sees,
//! even one meant for a sibling call. `CorrelationPolicy::PayloadField` only
//! accepts events whose first argument names the call's id.

use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::watch;
use tokio::time::Instant;
use tracing::{debug, instrument, warn};
use uuid::Uuid;

use crate::channel::HubEvent;
use crate::error::{Error, Result};
use crate::manager::ChannelManager;
use crate::state::ChannelState;

/// Which broadcasts may settle a pending call.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum CorrelationPolicy {
    /// Any event with the right name settles the call.
    #[default]
    AnyEvent,
    /// Only events whose first argument is an object with `field == arg_id`.
    PayloadField(String),
}

impl CorrelationPolicy {
    fn accepts(&self, arg_id: &str, arguments: &[Value]) -> bool {
        match self {
            CorrelationPolicy::AnyEvent => true,
            CorrelationPolicy::PayloadField(field) => {
                match arguments.first().and_then(|payload| payload.get(field)) {
                    Some(Value::String(id)) => id == arg_id,
                    Some(Value::Number(id)) => id.to_string() == arg_id,
                    _ => false,
                }
            }
        }
    }
}

/// Broadcast names belonging to one hub method.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EventNames {
    pub loading: String,
    pub content: String,
    pub error: String,
}

impl EventNames {
    /// `RequestLessonContent` maps to `LessonContentLoading`,
    /// `ReceiveLessonContent` and `LessonContentError`.
    pub fn for_method(method: &str) -> Self {
        let stem = method.strip_prefix("Request").unwrap_or(method);
        Self {
            loading: format!("{stem}Loading"),
            content: format!("Receive{stem}"),
            error: format!("{stem}Error"),
        }
    }
}

/// Progress callback, given the first argument of each loading event.
pub type LoadingCallback = Box<dyn FnMut(&Value) + Send>;

/// Per-call options.
#[derive(Default)]
pub struct InvokeOptions {
    /// Overrides the correlator's default deadline.
    pub timeout: Option<Duration>,
    /// Best effort: a call that lags the channel's event buffer skips progress.
    pub on_loading: Option<LoadingCallback>,
}

impl InvokeOptions {
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn on_loading(mut self, callback: impl FnMut(&Value) + Send + 'static) -> Self {
        self.on_loading = Some(Box::new(callback));
        self
    }
}

impl std::fmt::Debug for InvokeOptions {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InvokeOptions")
            .field("timeout", &self.timeout)
            .field("on_loading", &self.on_loading.is_some())
            .finish()
    }
}

/// Generated content served by the hubs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContentKind {
    Lesson,
    Chapter,
}

impl ContentKind {
    pub fn channel(&self) -> &'static str {
        match self {
            ContentKind::Lesson => "lesson",
            ContentKind::Chapter => "chapter",
        }
    }

    pub fn method(&self) -> &'static str {
        match self {
            ContentKind::Lesson => "RequestLessonContent",
            ContentKind::Chapter => "RequestChapterContent",
        }
    }
}

#[derive(Clone)]
pub struct Correlator {
    channels: Arc<ChannelManager>,
    policy: CorrelationPolicy,
    default_timeout: Duration,
}

impl Correlator {
    pub fn new(
        channels: Arc<ChannelManager>,
        policy: CorrelationPolicy,
        default_timeout: Duration,
    ) -> Self {
        Self {
            channels,
            policy,
            default_timeout,
        }
    }

    pub fn channels(&self) -> &Arc<ChannelManager> {
        &self.channels
    }

    pub fn policy(&self) -> &CorrelationPolicy {
        &self.policy
    }

    /// Invoke `method(arg_id)` on `channel` and wait for its terminal event.
    ///
    /// Resolves with the first argument of `Receive<X>` (null when absent).
    #[instrument(skip(self, options), fields(request_id = %Uuid::new_v4()))]
    pub async fn invoke(
        &self,
        channel: &str,
        method: &str,
        arg_id: &str,
        options: InvokeOptions,
    ) -> Result<Value> {
        let timeout = options.timeout.unwrap_or(self.default_timeout);
        let deadline = Instant::now() + timeout;

        let outcome = match tokio::time::timeout_at(
            deadline,
            self.exchange(channel, method, arg_id, options.on_loading),
        )
        .await
        {
            Ok(outcome) => outcome,
            Err(_) => {
                warn!(timeout_ms = timeout.as_millis() as u64, "no terminal event before deadline");
                Err(Error::CorrelationTimeout {
                    method: method.to_string(),
                    arg_id: arg_id.to_string(),
                    timeout,
                })
            }
        };

        let label = match &outcome {
            Ok(_) => "content",
            Err(Error::CorrelationTimeout { .. }) => "timeout",
            Err(Error::ChannelUnavailable(_)) => "unavailable",
            Err(_) => "error",
        };
        metrics::counter!(
            "access_correlation_total",
            "method" => method.to_string(),
            "outcome" => label
        )
        .increment(1);
        debug!(outcome = label, "invocation settled");
        outcome
    }

    /// Fetch generated lesson or chapter content by id.
    pub async fn request_content(&self, kind: ContentKind, id: &str) -> Result<Value> {
        self.invoke(kind.channel(), kind.method(), id, InvokeOptions::default())
            .await
    }

    async fn exchange(
        &self,
        channel: &str,
        method: &str,
        arg_id: &str,
        mut on_loading: Option<LoadingCallback>,
    ) -> Result<Value> {
        let hub = self.channels.get(channel).await?;

        // Listen before sending so no reply can slip past
        let mut events = hub.subscribe();
        let mut state = hub.watch_state();
        if self.policy == CorrelationPolicy::AnyEvent && hub.listener_count() > 1 {
            warn!(
                channel,
                listeners = hub.listener_count(),
                "concurrent calls share a channel without payload correlation; events may settle the wrong call"
            );
        }

        let names = EventNames::for_method(method);
        let invocation_id = hub.send(method, vec![Value::from(arg_id)]).await?;

        loop {
            tokio::select! {
                event = events.recv() => match event {
                    Ok(HubEvent::Broadcast { target, arguments }) => {
                        if !self.policy.accepts(arg_id, &arguments) {
                            continue;
                        }
                        if target == names.content {
                            return Ok(arguments.into_iter().next().unwrap_or(Value::Null));
                        }
                        if target == names.error {
                            return Err(Error::CorrelationError(error_message(arguments.first())));
                        }
                        if target == names.loading {
                            if let Some(callback) = on_loading.as_mut() {
                                callback(arguments.first().unwrap_or(&Value::Null));
                            }
                        }
                    }
                    Ok(HubEvent::Completion { invocation_id: id, error: Some(error) })
                        if id == invocation_id =>
                    {
                        return Err(Error::CorrelationError(error));
                    }
                    Ok(HubEvent::Completion { .. }) => {}
                    Err(RecvError::Lagged(skipped)) => {
                        warn!(channel, skipped, "listener lagged; events dropped");
                    }
                    Err(RecvError::Closed) => {
                        return Err(Error::ChannelUnavailable(format!("{channel} channel closed")));
                    }
                },
                _ = disconnected(&mut state) => {
                    return Err(Error::ChannelUnavailable(format!("{channel} channel disconnected")));
                }
            }
        }
    }
}

async fn disconnected(state: &mut watch::Receiver<ChannelState>) {
    let _ = state.wait_for(|s| *s == ChannelState::Disconnected).await;
}

/// Human-readable reason from an error event payload.
fn error_message(payload: Option<&Value>) -> String {
    match payload {
        None | Some(Value::Null) => "content generation failed".to_string(),
        Some(Value::String(message)) => message.clone(),
        Some(value) => ["message", "error"]
            .iter()
            .find_map(|key| value.get(key).and_then(Value::as_str))
            .map(str::to_string)
            .unwrap_or_else(|| value.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::{ConnectFuture, Connection, ConnectionFactory, Peer};
    use crate::protocol::HubMessage;
    use crate::state::BackoffPolicy;
    use serde_json::json;
    use session_auth::{Credential, MemoryTokenStore};
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use tokio::sync::mpsc;

    struct HubFactory {
        peers: mpsc::UnboundedSender<Peer>,
        refuse: AtomicBool,
    }

    impl ConnectionFactory for HubFactory {
        fn connect<'a>(&'a self, _channel: &'a str, _token: Option<Credential>) -> ConnectFuture<'a> {
            Box::pin(async move {
                if self.refuse.load(Ordering::SeqCst) {
                    return Err(Error::ChannelUnavailable("connection refused".into()));
                }
                let (conn, peer) = Connection::in_memory(16);
                let _ = self.peers.send(peer);
                Ok(conn)
            })
        }
    }

    fn setup(policy: CorrelationPolicy) -> (Correlator, Arc<HubFactory>, mpsc::UnboundedReceiver<Peer>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let factory = Arc::new(HubFactory {
            peers: tx,
            refuse: AtomicBool::new(false),
        });
        let manager = Arc::new(ChannelManager::new(
            factory.clone(),
            Arc::new(MemoryTokenStore::new()),
            BackoffPolicy::default(),
        ));
        (
            Correlator::new(manager, policy, Duration::from_secs(120)),
            factory,
            rx,
        )
    }

    fn spawn_invoke(
        correlator: &Correlator,
        arg_id: &str,
        options: InvokeOptions,
    ) -> tokio::task::JoinHandle<Result<Value>> {
        let correlator = correlator.clone();
        let arg_id = arg_id.to_string();
        tokio::spawn(async move {
            correlator
                .invoke("lesson", "RequestLessonContent", &arg_id, options)
                .await
        })
    }

    /// Next invocation the client sent: (invocation id, target, arguments).
    async fn next_invocation(peer: &mut Peer) -> (String, String, Vec<Value>) {
        match peer.from_client.recv().await.unwrap() {
            HubMessage::Invocation {
                invocation_id,
                target,
                arguments,
            } => (invocation_id.unwrap(), target, arguments),
            other => panic!("expected invocation, got {other:?}"),
        }
    }

    async fn broadcast(peer: &Peer, target: &str, payload: Value) {
        peer.to_client
            .send(HubMessage::Invocation {
                invocation_id: None,
                target: target.into(),
                arguments: vec![payload],
            })
            .await
            .unwrap();
    }

    #[test]
    fn event_names_derive_from_method() {
        assert_eq!(
            EventNames::for_method("RequestChapterContent"),
            EventNames {
                loading: "ChapterContentLoading".into(),
                content: "ReceiveChapterContent".into(),
                error: "ChapterContentError".into(),
            }
        );
    }

    #[test]
    fn content_kinds_map_to_hubs() {
        assert_eq!(ContentKind::Lesson.channel(), "lesson");
        assert_eq!(ContentKind::Lesson.method(), "RequestLessonContent");
        assert_eq!(ContentKind::Chapter.channel(), "chapter");
        assert_eq!(ContentKind::Chapter.method(), "RequestChapterContent");
    }

    #[test]
    fn payload_field_policy_matches_strings_and_numbers() {
        let policy = CorrelationPolicy::PayloadField("lessonId".into());
        assert!(policy.accepts("L1", &[json!({"lessonId": "L1"})]));
        assert!(policy.accepts("42", &[json!({"lessonId": 42})]));
        assert!(!policy.accepts("L1", &[json!({"lessonId": "L2"})]));
        assert!(!policy.accepts("L1", &[json!("L1")]));
        assert!(!policy.accepts("L1", &[]));
        assert!(CorrelationPolicy::AnyEvent.accepts("L1", &[]));
    }

    #[test]
    fn error_messages_are_extracted_from_payloads() {
        assert_eq!(error_message(Some(&json!("quota exceeded"))), "quota exceeded");
        assert_eq!(error_message(Some(&json!({"message": "bad id"}))), "bad id");
        assert_eq!(error_message(Some(&json!({"error": "boom"}))), "boom");
        assert_eq!(error_message(Some(&json!({"code": 7}))), "{\"code\":7}");
        assert_eq!(error_message(None), "content generation failed");
    }

    #[tokio::test(start_paused = true)]
    async fn silent_hub_times_out_and_detaches_listener() {
        let (correlator, _factory, mut peers) = setup(CorrelationPolicy::AnyEvent);
        let started = Instant::now();
        let call = spawn_invoke(
            &correlator,
            "L1",
            InvokeOptions::default().with_timeout(Duration::from_millis(50)),
        );

        let mut peer = peers.recv().await.unwrap();
        let (_, target, arguments) = next_invocation(&mut peer).await;
        assert_eq!(target, "RequestLessonContent");
        assert_eq!(arguments, vec![json!("L1")]);

        let err = call.await.unwrap().unwrap_err();
        assert_eq!(
            err,
            Error::CorrelationTimeout {
                method: "RequestLessonContent".into(),
                arg_id: "L1".into(),
                timeout: Duration::from_millis(50),
            }
        );
        let elapsed = started.elapsed();
        assert!(elapsed >= Duration::from_millis(50) && elapsed < Duration::from_millis(60));

        let channel = correlator.channels().get("lesson").await.unwrap();
        assert_eq!(channel.listener_count(), 0);

        // A reply after the deadline has nowhere to go
        broadcast(&peer, "ReceiveLessonContent", json!({"lessonId": "L1"})).await;
        tokio::task::yield_now().await;
        assert_eq!(channel.listener_count(), 0);
        assert_eq!(channel.state(), ChannelState::Connected);
    }

    #[tokio::test(start_paused = true)]
    async fn first_terminal_event_wins() {
        let (correlator, _factory, mut peers) = setup(CorrelationPolicy::AnyEvent);
        let call = spawn_invoke(&correlator, "L1", InvokeOptions::default());

        let mut peer = peers.recv().await.unwrap();
        next_invocation(&mut peer).await;
        broadcast(&peer, "ReceiveLessonContent", json!({"lessonId": "L1", "body": "intro"})).await;
        broadcast(&peer, "LessonContentError", json!("duplicate")).await;

        let content = call.await.unwrap().unwrap();
        assert_eq!(content, json!({"lessonId": "L1", "body": "intro"}));

        let channel = correlator.channels().get("lesson").await.unwrap();
        assert_eq!(channel.listener_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn error_event_rejects_with_server_message() {
        let (correlator, _factory, mut peers) = setup(CorrelationPolicy::AnyEvent);
        let call = spawn_invoke(&correlator, "L1", InvokeOptions::default());

        let mut peer = peers.recv().await.unwrap();
        next_invocation(&mut peer).await;
        broadcast(&peer, "LessonContentError", json!({"message": "lesson not found"})).await;

        let err = call.await.unwrap().unwrap_err();
        assert_eq!(err, Error::CorrelationError("lesson not found".into()));
    }

    #[tokio::test(start_paused = true)]
    async fn loading_callback_runs_only_before_settlement() {
        let (correlator, _factory, mut peers) = setup(CorrelationPolicy::AnyEvent);
        let seen = Arc::new(AtomicUsize::new(0));
        let counter = seen.clone();
        let options = InvokeOptions::default().on_loading(move |payload| {
            assert_eq!(payload, &json!("generating"));
            counter.fetch_add(1, Ordering::SeqCst);
        });
        let call = spawn_invoke(&correlator, "L1", options);

        let mut peer = peers.recv().await.unwrap();
        next_invocation(&mut peer).await;
        broadcast(&peer, "LessonContentLoading", json!("generating")).await;
        broadcast(&peer, "LessonContentLoading", json!("generating")).await;
        broadcast(&peer, "ReceiveLessonContent", json!({"lessonId": "L1"})).await;
        broadcast(&peer, "LessonContentLoading", json!("generating")).await;

        call.await.unwrap().unwrap();
        tokio::task::yield_now().await;
        assert_eq!(seen.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn failed_completion_rejects() {
        let (correlator, _factory, mut peers) = setup(CorrelationPolicy::AnyEvent);
        let call = spawn_invoke(&correlator, "L404", InvokeOptions::default());

        let mut peer = peers.recv().await.unwrap();
        let (invocation_id, _, _) = next_invocation(&mut peer).await;
        peer.to_client
            .send(HubMessage::Completion {
                invocation_id,
                result: None,
                error: Some("Lesson L404 does not exist".into()),
            })
            .await
            .unwrap();

        let err = call.await.unwrap().unwrap_err();
        assert_eq!(err, Error::CorrelationError("Lesson L404 does not exist".into()));
    }

    #[tokio::test(start_paused = true)]
    async fn successful_completion_keeps_waiting_for_content() {
        let (correlator, _factory, mut peers) = setup(CorrelationPolicy::AnyEvent);
        let call = spawn_invoke(&correlator, "L1", InvokeOptions::default());

        let mut peer = peers.recv().await.unwrap();
        let (invocation_id, _, _) = next_invocation(&mut peer).await;
        peer.to_client
            .send(HubMessage::Completion {
                invocation_id,
                result: None,
                error: None,
            })
            .await
            .unwrap();
        broadcast(&peer, "ReceiveLessonContent", json!({"lessonId": "L1"})).await;

        assert_eq!(call.await.unwrap().unwrap(), json!({"lessonId": "L1"}));
    }

    #[tokio::test(start_paused = true)]
    async fn disconnect_all_rejects_pending_calls() {
        let (correlator, _factory, mut peers) = setup(CorrelationPolicy::AnyEvent);
        let call = spawn_invoke(&correlator, "L1", InvokeOptions::default());

        let mut peer = peers.recv().await.unwrap();
        next_invocation(&mut peer).await;
        correlator.channels().disconnect_all().await;

        let err = call.await.unwrap().unwrap_err();
        assert!(matches!(err, Error::ChannelUnavailable(_)));
    }

    #[tokio::test(start_paused = true)]
    async fn call_spanning_reconnect_is_not_resent() {
        let (correlator, _factory, mut peers) = setup(CorrelationPolicy::AnyEvent);
        let call = spawn_invoke(
            &correlator,
            "L1",
            InvokeOptions::default().with_timeout(Duration::from_secs(5)),
        );

        let mut peer = peers.recv().await.unwrap();
        next_invocation(&mut peer).await;
        drop(peer);

        // The channel comes back on a new connection after its backoff
        let mut replacement = peers.recv().await.unwrap();
        let channel = correlator.channels().get("lesson").await.unwrap();
        let mut state = channel.watch_state();
        state.wait_for(|s| *s == ChannelState::Connected).await.unwrap();

        let err = call.await.unwrap().unwrap_err();
        assert!(matches!(err, Error::CorrelationTimeout { ref arg_id, .. } if arg_id == "L1"));
        assert_eq!(channel.listener_count(), 0);

        // Nothing was replayed on the new connection
        assert!(matches!(
            replacement.from_client.try_recv(),
            Err(mpsc::error::TryRecvError::Empty)
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn unreachable_hub_is_unavailable() {
        let (correlator, factory, _peers) = setup(CorrelationPolicy::AnyEvent);
        factory.refuse.store(true, Ordering::SeqCst);

        let err = correlator
            .request_content(ContentKind::Lesson, "L1")
            .await
            .unwrap_err();
        assert_eq!(err, Error::ChannelUnavailable("connection refused".into()));
    }

    #[tokio::test(start_paused = true)]
    async fn payload_field_keeps_concurrent_calls_apart() {
        let (correlator, _factory, mut peers) =
            setup(CorrelationPolicy::PayloadField("lessonId".into()));
        let first = spawn_invoke(&correlator, "L1", InvokeOptions::default());
        let mut peer = peers.recv().await.unwrap();
        next_invocation(&mut peer).await;

        let second = spawn_invoke(&correlator, "L2", InvokeOptions::default());
        next_invocation(&mut peer).await;

        broadcast(&peer, "ReceiveLessonContent", json!({"lessonId": "L2", "n": 2})).await;
        broadcast(&peer, "ReceiveLessonContent", json!({"lessonId": "L1", "n": 1})).await;

        assert_eq!(first.await.unwrap().unwrap(), json!({"lessonId": "L1", "n": 1}));
        assert_eq!(second.await.unwrap().unwrap(), json!({"lessonId": "L2", "n": 2}));
    }

    #[tokio::test(start_paused = true)]
    async fn any_event_lets_siblings_share_a_reply() {
        let (correlator, _factory, mut peers) = setup(CorrelationPolicy::AnyEvent);
        let first = spawn_invoke(&correlator, "L1", InvokeOptions::default());
        let mut peer = peers.recv().await.unwrap();
        next_invocation(&mut peer).await;

        let second = spawn_invoke(&correlator, "L2", InvokeOptions::default());
        next_invocation(&mut peer).await;

        broadcast(&peer, "ReceiveLessonContent", json!({"lessonId": "L2"})).await;

        // Both calls settle on the one reply, which is the known cross-talk
        assert_eq!(first.await.unwrap().unwrap(), json!({"lessonId": "L2"}));
        assert_eq!(second.await.unwrap().unwrap(), json!({"lessonId": "L2"}));
    }

    #[tokio::test(start_paused = true)]
    async fn unrelated_events_are_ignored() {
        let (correlator, _factory, mut peers) = setup(CorrelationPolicy::AnyEvent);
        let call = spawn_invoke(
            &correlator,
            "L1",
            InvokeOptions::default().with_timeout(Duration::from_millis(100)),
        );

        let mut peer = peers.recv().await.unwrap();
        next_invocation(&mut peer).await;
        broadcast(&peer, "ReceiveChapterContent", json!({"chapterId": "C1"})).await;

        let err = call.await.unwrap().unwrap_err();
        assert!(matches!(err, Error::CorrelationTimeout { .. }));
    }
}
