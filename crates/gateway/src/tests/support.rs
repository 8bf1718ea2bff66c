use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use gateway_core::{BroadcastTransport, Gateway, GatewaySettings, RelayPipeline, RemoteFactory};
use remote_api::{Args, RemoteApi, LONG_POLL_SERVER_METHOD};
use serde_json::{json, Value};
use shared::{
    error::{CaptchaChallenge, RemoteError},
    protocol::LongPollEndpoint,
};
use storage::Storage;

/// Remote that accepts every call and never delivers a long-poll result.
#[derive(Default)]
pub struct StubRemote {
    calls: Mutex<Vec<(String, Args)>>,
}

impl StubRemote {
    pub fn calls_to(&self, method: &str) -> Vec<Args> {
        self.calls
            .lock()
            .expect("calls")
            .iter()
            .filter(|(name, _)| name == method)
            .map(|(_, args)| args.clone())
            .collect()
    }
}

#[async_trait]
impl RemoteApi for StubRemote {
    async fn call(&self, method: &str, args: Args) -> Result<Value, RemoteError> {
        self.calls
            .lock()
            .expect("calls")
            .push((method.to_string(), args));
        Ok(match method {
            "messages.get" | "friends.get" => json!({ "count": 0, "items": [] }),
            LONG_POLL_SERVER_METHOD => json!({ "server": "poll.test/im", "key": "k", "ts": 1 }),
            _ => json!(1),
        })
    }

    async fn retry(&self, _captcha: Option<&CaptchaChallenge>) -> Result<Value, RemoteError> {
        Ok(json!(1))
    }

    async fn login_with_password(
        &self,
        _username: &str,
        _password: &str,
        _captcha: Option<&CaptchaChallenge>,
    ) -> Result<String, RemoteError> {
        Ok("issued-token".to_string())
    }

    async fn long_poll(&self, _endpoint: &LongPollEndpoint) -> Result<Vec<u8>, RemoteError> {
        std::future::pending().await
    }

    async fn fetch_bytes(&self, _url: &str) -> Result<Vec<u8>, RemoteError> {
        Ok(Vec::new())
    }

    async fn set_token(&self, _token: String) {}
}

pub struct StubFactory(pub Arc<StubRemote>);

impl RemoteFactory for StubFactory {
    fn create(&self) -> Arc<dyn RemoteApi> {
        self.0.clone()
    }
}

pub struct TestGateway {
    pub gateway: Arc<Gateway>,
    pub remote: Arc<StubRemote>,
    pub transport: Arc<BroadcastTransport>,
    pub storage: Storage,
}

pub async fn test_gateway() -> TestGateway {
    let storage = Storage::new("sqlite::memory:").await.expect("db");
    let remote = Arc::new(StubRemote::default());
    let transport = Arc::new(BroadcastTransport::new(64));
    let gateway = Gateway::new(
        storage.clone(),
        transport.clone(),
        Arc::new(StubFactory(remote.clone())),
        RelayPipeline::default(),
        GatewaySettings::default(),
    );
    TestGateway {
        gateway,
        remote,
        transport,
        storage,
    }
}
