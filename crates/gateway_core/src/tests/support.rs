use std::{
    collections::{HashMap, VecDeque},
    future::Future,
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc, Mutex,
    },
    time::Duration,
};

use async_trait::async_trait;
use remote_api::{Args, RemoteApi, LONG_POLL_SERVER_METHOD};
use serde_json::{json, Value};
use shared::{
    domain::SessionKey,
    error::{CaptchaChallenge, RemoteError},
    protocol::{LongPollEndpoint, OutboundStanza},
};
use storage::Storage;
use tokio::{
    sync::{mpsc, Notify},
    time::{sleep, timeout},
};

use crate::{
    relay::RelayPipeline,
    session::{
        Credentials, Session, SessionContext, SessionSettings, SessionSignal, TaggedSignal,
    },
    transport::{Transport, TransportError},
};

pub const ALICE: &str = "alice@xmpp.test";

type Scripted<T> = Mutex<VecDeque<Result<T, RemoteError>>>;

/// Scripted stand-in for the remote API. Unscripted calls fall back to
/// harmless defaults; unscripted long polls hang like an idle server.
#[derive(Default)]
pub struct FakeRemote {
    responses: Mutex<HashMap<String, VecDeque<Result<Value, RemoteError>>>>,
    calls: Mutex<Vec<(String, Args)>>,
    retries: Mutex<Vec<Option<CaptchaChallenge>>>,
    retry_results: Scripted<Value>,
    login_results: Scripted<String>,
    poll_results: Scripted<Vec<u8>>,
    polls: AtomicUsize,
    blocked: Mutex<HashMap<String, (Arc<Notify>, Arc<Notify>)>>,
    token: Mutex<Option<String>>,
}

impl FakeRemote {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn script(&self, method: &str, result: Result<Value, RemoteError>) {
        self.responses
            .lock()
            .expect("responses")
            .entry(method.to_string())
            .or_default()
            .push_back(result);
    }

    pub fn script_retry(&self, result: Result<Value, RemoteError>) {
        self.retry_results.lock().expect("retry").push_back(result);
    }

    pub fn script_login(&self, result: Result<String, RemoteError>) {
        self.login_results.lock().expect("login").push_back(result);
    }

    pub fn script_poll(&self, result: Result<Vec<u8>, RemoteError>) {
        self.poll_results.lock().expect("poll").push_back(result);
    }

    /// Makes calls to `method` park until released. Returns (entered, release).
    pub fn block(&self, method: &str) -> (Arc<Notify>, Arc<Notify>) {
        let pair = (Arc::new(Notify::new()), Arc::new(Notify::new()));
        self.blocked
            .lock()
            .expect("blocked")
            .insert(method.to_string(), pair.clone());
        pair
    }

    pub fn calls(&self) -> Vec<(String, Args)> {
        self.calls.lock().expect("calls").clone()
    }

    pub fn call_count(&self, method: &str) -> usize {
        self.calls
            .lock()
            .expect("calls")
            .iter()
            .filter(|(name, _)| name == method)
            .count()
    }

    pub fn last_args(&self, method: &str) -> Option<Args> {
        self.calls
            .lock()
            .expect("calls")
            .iter()
            .rev()
            .find(|(name, _)| name == method)
            .map(|(_, args)| args.clone())
    }

    pub fn retries(&self) -> Vec<Option<CaptchaChallenge>> {
        self.retries.lock().expect("retries").clone()
    }

    pub fn poll_count(&self) -> usize {
        self.polls.load(Ordering::SeqCst)
    }

    pub fn token(&self) -> Option<String> {
        self.token.lock().expect("token").clone()
    }

    fn default_response(method: &str) -> Value {
        match method {
            "messages.get" | "friends.get" => json!({ "count": 0, "items": [] }),
            LONG_POLL_SERVER_METHOD => json!({ "server": "poll.test/im", "key": "k", "ts": 100 }),
            _ => json!(1),
        }
    }
}

#[async_trait]
impl RemoteApi for FakeRemote {
    async fn call(&self, method: &str, args: Args) -> Result<Value, RemoteError> {
        self.calls
            .lock()
            .expect("calls")
            .push((method.to_string(), args));
        let gate = self.blocked.lock().expect("blocked").get(method).cloned();
        if let Some((entered, release)) = gate {
            entered.notify_one();
            release.notified().await;
        }
        let scripted = self
            .responses
            .lock()
            .expect("responses")
            .get_mut(method)
            .and_then(VecDeque::pop_front);
        scripted.unwrap_or_else(|| Ok(Self::default_response(method)))
    }

    async fn retry(&self, captcha: Option<&CaptchaChallenge>) -> Result<Value, RemoteError> {
        self.retries.lock().expect("retries").push(captcha.cloned());
        self.retry_results
            .lock()
            .expect("retry")
            .pop_front()
            .unwrap_or(Ok(json!(1)))
    }

    async fn login_with_password(
        &self,
        _username: &str,
        _password: &str,
        _captcha: Option<&CaptchaChallenge>,
    ) -> Result<String, RemoteError> {
        self.login_results
            .lock()
            .expect("login")
            .pop_front()
            .unwrap_or_else(|| Ok("issued-token".to_string()))
    }

    async fn long_poll(&self, _endpoint: &LongPollEndpoint) -> Result<Vec<u8>, RemoteError> {
        self.polls.fetch_add(1, Ordering::SeqCst);
        let scripted = self.poll_results.lock().expect("poll").pop_front();
        match scripted {
            Some(result) => result,
            None => std::future::pending().await,
        }
    }

    async fn fetch_bytes(&self, _url: &str) -> Result<Vec<u8>, RemoteError> {
        Ok(b"png-bytes".to_vec())
    }

    async fn set_token(&self, token: String) {
        *self.token.lock().expect("token") = Some(token);
    }
}

#[derive(Default)]
pub struct RecordingTransport {
    sent: Mutex<Vec<OutboundStanza>>,
}

impl RecordingTransport {
    pub fn take(&self) -> Vec<OutboundStanza> {
        std::mem::take(&mut *self.sent.lock().expect("sent"))
    }

    /// Bodies of relayed contact messages, in send order.
    pub fn bodies(&self) -> Vec<String> {
        self.sent
            .lock()
            .expect("sent")
            .iter()
            .filter_map(|stanza| match stanza {
                OutboundStanza::Message {
                    from: Some(_), body, ..
                } => Some(body.clone()),
                _ => None,
            })
            .collect()
    }

    pub fn snapshot(&self) -> Vec<OutboundStanza> {
        self.sent.lock().expect("sent").clone()
    }
}

#[async_trait]
impl Transport for RecordingTransport {
    async fn send(&self, stanza: OutboundStanza) -> Result<(), TransportError> {
        self.sent.lock().expect("sent").push(stanza);
        Ok(())
    }
}

pub struct Harness {
    pub remote: Arc<FakeRemote>,
    pub transport: Arc<RecordingTransport>,
    pub storage: Storage,
    pub signals: mpsc::UnboundedReceiver<TaggedSignal>,
    pub ctx: SessionContext,
    pub session: Arc<Session>,
}

impl Harness {
    pub fn drain_signals(&mut self) -> Vec<SessionSignal> {
        let mut drained = Vec::new();
        while let Ok(tagged) = self.signals.try_recv() {
            assert_eq!(tagged.instance, self.session.instance());
            drained.push(tagged.signal);
        }
        drained
    }
}

pub async fn harness_with(pipeline: RelayPipeline, settings: SessionSettings) -> Harness {
    let remote = FakeRemote::new();
    let transport = Arc::new(RecordingTransport::default());
    let storage = Storage::new("sqlite::memory:").await.expect("db");
    let (signals_tx, signals) = mpsc::unbounded_channel();
    let ctx = SessionContext {
        transport: transport.clone(),
        storage: storage.clone(),
        pipeline: Arc::new(pipeline),
        signals: signals_tx,
        settings,
    };
    let session = Session::new(SessionKey::new(ALICE), "alice", remote.clone(), ctx.clone());
    Harness {
        remote,
        transport,
        storage,
        signals,
        ctx,
        session,
    }
}

pub async fn harness() -> Harness {
    harness_with(RelayPipeline::default(), SessionSettings::default()).await
}

/// A session that authenticated with a token and has a long-poll endpoint.
/// Stanzas and signals produced on the way are discarded.
pub async fn online_harness_with(pipeline: RelayPipeline, settings: SessionSettings) -> Harness {
    let mut harness = harness_with(pipeline, settings).await;
    harness
        .session
        .authenticate(token_credentials())
        .await
        .expect("authenticate");
    harness
        .session
        .acquire_poll_endpoint()
        .await
        .expect("endpoint");
    harness.transport.take();
    harness.drain_signals();
    harness
}

pub async fn online_harness() -> Harness {
    online_harness_with(RelayPipeline::default(), SessionSettings::default()).await
}

pub fn token_credentials() -> Credentials {
    Credentials {
        username: "alice".to_string(),
        token: Some("token-1".to_string()),
        password: None,
    }
}

pub fn message(id: Option<i64>, user_id: i64, out: u8, body: &str) -> Value {
    let mut value = json!({ "user_id": user_id, "out": out, "body": body, "date": 0 });
    if let Some(id) = id {
        value["id"] = json!(id);
    }
    value
}

pub fn batch(items: Vec<Value>) -> Value {
    json!({ "count": items.len(), "items": items })
}

pub fn challenge(sid: &str) -> CaptchaChallenge {
    CaptchaChallenge {
        sid: sid.to_string(),
        image_url: format!("https://captcha.test/{sid}.png"),
        answer: None,
    }
}

/// Polls `check` until it holds, failing the test after five seconds.
pub async fn wait_for<F, Fut>(what: &str, mut check: F)
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    let reached = timeout(Duration::from_secs(5), async {
        while !check().await {
            sleep(Duration::from_millis(10)).await;
        }
    })
    .await;
    assert!(reached.is_ok(), "timed out waiting for {what}");
}
