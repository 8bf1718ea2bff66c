use std::{sync::Arc, time::Duration};

use remote_api::RemoteApi;
use shared::{
    domain::{ContactId, MessageId, PollState, SessionKey, SessionState, SubscriptionKind},
    error::RemoteError,
    protocol::{InboundStanza, OutboundStanza},
};
use storage::Storage;

use crate::{
    gateway::{Gateway, GatewaySettings, RemoteFactory},
    multiplexer::MultiplexerSettings,
    relay::RelayPipeline,
    session::SessionSettings,
    support::*,
};

struct SharedRemote(Arc<FakeRemote>);

impl RemoteFactory for SharedRemote {
    fn create(&self) -> Arc<dyn RemoteApi> {
        self.0.clone()
    }
}

struct Fixture {
    gateway: Arc<Gateway>,
    remote: Arc<FakeRemote>,
    transport: Arc<RecordingTransport>,
    storage: Storage,
}

async fn fixture() -> Fixture {
    let remote = FakeRemote::new();
    let transport = Arc::new(RecordingTransport::default());
    let storage = Storage::new("sqlite::memory:").await.expect("db");
    let settings = GatewaySettings {
        session: SessionSettings::default(),
        multiplexer: MultiplexerSettings {
            readiness_timeout: Duration::from_millis(50),
            idle_sleep: Duration::from_millis(10),
            reinit_attempts: 3,
            reinit_delay: Duration::from_millis(10),
        },
        housekeeping_interval: Duration::from_millis(20),
    };
    let gateway = Gateway::new(
        storage.clone(),
        transport.clone(),
        Arc::new(SharedRemote(remote.clone())),
        RelayPipeline::default(),
        settings,
    );
    Fixture {
        gateway,
        remote,
        transport,
        storage,
    }
}

fn alice() -> SessionKey {
    SessionKey::new(ALICE)
}

fn login() -> InboundStanza {
    InboundStanza::Login {
        from: alice(),
        resource: "laptop".to_string(),
        username: "alice".to_string(),
        token: Some("token-1".to_string()),
        password: None,
    }
}

async fn wait_until_polling(gateway: &Arc<Gateway>) {
    let key = &alice();
    wait_for("session online and registered", move || async move {
        gateway.session_status(key).await.is_some_and(|status| {
            status.state == SessionState::Online && status.poll_state == PollState::Registered
        })
    })
    .await;
}

#[tokio::test]
async fn login_authenticates_persists_and_registers() {
    let f = fixture().await;
    let tasks = f.gateway.start().await.expect("start");

    f.gateway.dispatch(login()).await;

    wait_until_polling(&f.gateway).await;
    let status = f
        .gateway
        .session_status(&alice())
        .await
        .expect("status");
    assert_eq!(status.resources, 1);
    assert_eq!(status.username, "alice");
    let record = f
        .storage
        .load_credentials(&alice())
        .await
        .expect("load")
        .expect("record");
    assert_eq!(record.token, "token-1");
    tasks.abort();
}

#[tokio::test]
async fn start_restores_persisted_sessions() {
    let f = fixture().await;
    f.storage
        .upsert_credentials(&alice(), "alice", "stored-token")
        .await
        .expect("seed");
    f.storage
        .update_cursor(&alice(), MessageId(40))
        .await
        .expect("cursor");

    let tasks = f.gateway.start().await.expect("start");

    wait_until_polling(&f.gateway).await;
    let statuses = f.gateway.sessions().await;
    assert_eq!(statuses.len(), 1);
    assert_eq!(statuses[0].cursor, MessageId(40));
    assert_eq!(f.remote.token().as_deref(), Some("stored-token"));
    tasks.abort();
}

#[tokio::test]
async fn start_twice_is_rejected() {
    let f = fixture().await;
    let tasks = f.gateway.start().await.expect("start");

    assert!(f.gateway.start().await.is_err());
    tasks.abort();
}

#[tokio::test]
async fn unregister_removes_session_and_credentials() {
    let f = fixture().await;
    let tasks = f.gateway.start().await.expect("start");
    f.gateway.dispatch(login()).await;
    wait_until_polling(&f.gateway).await;
    f.transport.take();

    f.gateway
        .dispatch(InboundStanza::Unregister { from: alice() })
        .await;

    assert!(f.gateway.session_status(&alice()).await.is_none());
    assert!(f
        .storage
        .load_credentials(&alice())
        .await
        .expect("load")
        .is_none());
    assert_eq!(
        f.gateway.multiplexer().state(&alice()).await,
        PollState::Unregistered
    );
    assert!(f.transport.take().contains(&OutboundStanza::Subscription {
        to: alice(),
        contact: None,
        kind: SubscriptionKind::Unsubscribe,
        nick: None,
    }));
    tasks.abort();
}

#[tokio::test]
async fn revoked_credentials_tear_the_user_down() {
    let f = fixture().await;
    f.remote
        .script_poll(Ok(br#"{"ts":101,"updates":[[4,5,1,2]]}"#.to_vec()));
    f.remote.script(
        "messages.get",
        Err(RemoteError::CredentialsRevoked("user revoke access".to_string())),
    );
    let tasks = f.gateway.start().await.expect("start");

    f.gateway.dispatch(login()).await;

    let (gateway, storage, key) = (&f.gateway, &f.storage, &alice());
    wait_for("teardown", move || async move {
        gateway.session_status(key).await.is_none()
            && matches!(storage.load_credentials(key).await, Ok(None))
    })
    .await;
    assert_eq!(
        f.gateway.multiplexer().state(&alice()).await,
        PollState::Unregistered
    );
    tasks.abort();
}

#[tokio::test]
async fn last_resource_leaving_closes_the_session_but_keeps_credentials() {
    let f = fixture().await;
    let tasks = f.gateway.start().await.expect("start");
    f.gateway.dispatch(login()).await;
    wait_until_polling(&f.gateway).await;

    f.gateway
        .dispatch(InboundStanza::Unavailable {
            from: alice(),
            resource: "laptop".to_string(),
        })
        .await;

    assert!(f.gateway.session_status(&alice()).await.is_none());
    assert_eq!(
        f.gateway.multiplexer().state(&alice()).await,
        PollState::Unregistered
    );
    assert!(f
        .storage
        .load_credentials(&alice())
        .await
        .expect("load")
        .is_some());
    tasks.abort();
}

#[tokio::test]
async fn presence_from_known_user_restores_the_session() {
    let f = fixture().await;
    let tasks = f.gateway.start().await.expect("start");
    f.storage
        .upsert_credentials(&alice(), "alice", "stored-token")
        .await
        .expect("seed");

    f.gateway
        .dispatch(InboundStanza::Available {
            from: alice(),
            resource: "phone".to_string(),
        })
        .await;

    wait_until_polling(&f.gateway).await;
    let status = f
        .gateway
        .session_status(&alice())
        .await
        .expect("status");
    assert_eq!(status.resources, 1);
    tasks.abort();
}

#[tokio::test]
async fn presence_from_unknown_user_is_ignored() {
    let f = fixture().await;
    let tasks = f.gateway.start().await.expect("start");

    f.gateway
        .dispatch(InboundStanza::Available {
            from: SessionKey::new("stranger@xmpp.test"),
            resource: "pc".to_string(),
        })
        .await;

    assert!(f.gateway.sessions().await.is_empty());
    assert!(f.remote.calls().is_empty());
    tasks.abort();
}

#[tokio::test]
async fn user_messages_are_sent_to_the_remote_contact() {
    let f = fixture().await;
    let tasks = f.gateway.start().await.expect("start");
    f.gateway.dispatch(login()).await;
    wait_until_polling(&f.gateway).await;

    f.gateway
        .dispatch(InboundStanza::Message {
            from: alice(),
            to: ContactId(5),
            body: "hi bob".to_string(),
        })
        .await;

    let remote = &f.remote;
    wait_for("messages.send", move || async move {
        remote.call_count("messages.send") == 1
    })
    .await;
    let request = f.remote.last_args("messages.send").expect("sent");
    assert!(request.contains(&("message".to_string(), "hi bob".to_string())));
    tasks.abort();
}

#[tokio::test]
async fn captcha_answer_resumes_polling() {
    let f = fixture().await;
    f.remote
        .script("users.get", Err(RemoteError::CaptchaRequired(challenge("g1"))));
    let tasks = f.gateway.start().await.expect("start");
    f.gateway.dispatch(login()).await;
    let (gateway, key) = (&f.gateway, &alice());
    wait_for("captcha pending", move || async move {
        gateway
            .session_status(key)
            .await
            .is_some_and(|status| status.state == SessionState::CaptchaPending)
    })
    .await;

    f.gateway
        .dispatch(InboundStanza::CaptchaAnswer {
            from: alice(),
            answer: "x1y2".to_string(),
        })
        .await;

    wait_until_polling(&f.gateway).await;
    assert_eq!(f.remote.retries().len(), 1);
    tasks.abort();
}

#[tokio::test]
async fn shutdown_forgets_sessions_but_keeps_records() {
    let f = fixture().await;
    let tasks = f.gateway.start().await.expect("start");
    f.gateway.dispatch(login()).await;
    wait_until_polling(&f.gateway).await;
    tasks.abort();

    f.gateway.shutdown().await;

    assert!(f.gateway.sessions().await.is_empty());
    assert_eq!(
        f.gateway.multiplexer().state(&alice()).await,
        PollState::Unregistered
    );
    assert_eq!(
        f.storage.list_credentials().await.expect("list").len(),
        1
    );
}

#[tokio::test]
async fn failure_of_a_replaced_session_leaves_its_successor_alone() {
    let f = fixture().await;
    let (entered, release) = f.remote.block("users.get");
    f.remote.script(
        "users.get",
        Err(RemoteError::CredentialsInvalid("token expired".to_string())),
    );
    let tasks = f.gateway.start().await.expect("start");

    f.gateway.dispatch(login()).await;
    tokio::time::timeout(Duration::from_secs(5), entered.notified())
        .await
        .expect("token validation started");
    f.gateway
        .dispatch(InboundStanza::Login {
            from: alice(),
            resource: "phone".to_string(),
            username: "alice".to_string(),
            token: None,
            password: Some("hunter2".to_string()),
        })
        .await;
    wait_until_polling(&f.gateway).await;

    release.notify_one();
    tokio::time::sleep(Duration::from_millis(200)).await;

    let status = f
        .gateway
        .session_status(&alice())
        .await
        .expect("successor still registered");
    assert_eq!(status.state, SessionState::Online);
    assert_eq!(status.poll_state, PollState::Registered);
    let record = f
        .storage
        .load_credentials(&alice())
        .await
        .expect("load")
        .expect("successor's record kept");
    assert_eq!(record.token, "issued-token");
    tasks.abort();
}
