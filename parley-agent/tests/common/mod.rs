#![allow(dead_code)]

use async_trait::async_trait;
use futures::stream;
use parley_agent::{ChatEvent, SessionLifecycle};
use parley_core::bus::{event_channel, EventReceiver};
use parley_core::config::ChatConfig;
use parley_core::session::{MemorySessionStore, Session, SessionStore, UserProfile};
use parley_core::{Error, Result};
use parley_providers::{
    Fragment, FragmentStream, GenerateRequest, GenerationProvider, ProviderError, ProviderResult,
    RetryPolicy, StreamingExecutor,
};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::Notify;
use uuid::Uuid;

pub const WELCOME: &str = "Welcome to parley!";

/// One step of a scripted reply
pub enum Step {
    Fragment(Fragment),
    Fail(ProviderError),
    /// Pause the reply until the gate is notified
    Wait(Arc<Notify>),
}

/// What one `stream_generate` call does
pub enum Reply {
    OpenError(ProviderError),
    Steps(Vec<Step>),
}

pub fn text(text: &str) -> Step {
    Step::Fragment(Fragment::text(text))
}

/// Provider that plays back one scripted reply per call
#[derive(Default)]
pub struct ScriptedProvider {
    replies: Mutex<VecDeque<Reply>>,
    requests: Mutex<Vec<GenerateRequest>>,
    calls: AtomicUsize,
}

impl ScriptedProvider {
    pub fn new(replies: Vec<Reply>) -> Arc<Self> {
        Arc::new(Self {
            replies: Mutex::new(replies.into()),
            ..Default::default()
        })
    }

    pub fn push(&self, reply: Reply) {
        self.replies.lock().unwrap().push_back(reply);
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn requests(&self) -> Vec<GenerateRequest> {
        self.requests.lock().unwrap().clone()
    }
}

#[async_trait]
impl GenerationProvider for ScriptedProvider {
    async fn stream_generate(&self, request: GenerateRequest) -> ProviderResult<FragmentStream> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.requests.lock().unwrap().push(request);
        let reply = self.replies.lock().unwrap().pop_front();
        match reply {
            Some(Reply::OpenError(err)) => Err(err),
            Some(Reply::Steps(steps)) => Ok(Box::pin(stream::unfold(
                steps.into_iter(),
                |mut steps| async move {
                    loop {
                        match steps.next()? {
                            Step::Fragment(fragment) => return Some((Ok(fragment), steps)),
                            Step::Fail(err) => return Some((Err(err), steps)),
                            Step::Wait(gate) => gate.notified().await,
                        }
                    }
                },
            ))),
            None => Err(ProviderError::InvalidResponse("no scripted reply".into())),
        }
    }

    fn default_model(&self) -> String {
        "scripted-model".to_string()
    }
}

/// Store whose writes can be switched off
#[derive(Default)]
pub struct FlakyStore {
    pub inner: MemorySessionStore,
    failing: AtomicBool,
}

impl FlakyStore {
    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    fn check(&self) -> Result<()> {
        if self.failing.load(Ordering::SeqCst) {
            Err(Error::Storage("store offline".to_string()))
        } else {
            Ok(())
        }
    }
}

#[async_trait]
impl SessionStore for FlakyStore {
    async fn get(&self, id: Uuid) -> Result<Option<Session>> {
        self.inner.get(id).await
    }

    async fn put(&self, session: &Session) -> Result<()> {
        self.check()?;
        self.inner.put(session).await
    }

    async fn delete(&self, id: Uuid) -> Result<()> {
        self.check()?;
        self.inner.delete(id).await
    }

    async fn list_by_owner(&self, owner_id: &str) -> Result<Vec<Session>> {
        self.inner.list_by_owner(owner_id).await
    }

    async fn get_user(&self, id: &str) -> Result<Option<UserProfile>> {
        self.inner.get_user(id).await
    }

    async fn put_user(&self, profile: &UserProfile) -> Result<()> {
        self.check()?;
        self.inner.put_user(profile).await
    }
}

pub fn chat_config() -> ChatConfig {
    ChatConfig {
        welcome_message: WELCOME.to_string(),
        ..ChatConfig::default()
    }
}

pub fn profile() -> UserProfile {
    UserProfile::new("user-1", "Test User")
}

pub fn executor(provider: Arc<ScriptedProvider>) -> StreamingExecutor {
    StreamingExecutor::new(provider, RetryPolicy::default())
}

pub async fn sign_in_with(
    provider: Arc<ScriptedProvider>,
    store: Arc<dyn SessionStore>,
) -> (SessionLifecycle, EventReceiver) {
    let (tx, rx) = event_channel();
    let lifecycle = SessionLifecycle::sign_in(
        profile(),
        store,
        executor(provider),
        chat_config(),
        Some(tx),
    )
    .await
    .unwrap();
    (lifecycle, rx)
}

pub async fn sign_in(provider: Arc<ScriptedProvider>) -> (SessionLifecycle, EventReceiver) {
    sign_in_with(provider, Arc::new(MemorySessionStore::new())).await
}

/// Receive events until one matches `pred`
pub async fn wait_for(rx: &mut EventReceiver, pred: impl Fn(&ChatEvent) -> bool) -> ChatEvent {
    loop {
        let event = rx.recv().await.expect("event channel closed");
        if pred(&event) {
            return event;
        }
    }
}

/// Everything currently buffered on the channel
pub fn drain(rx: &mut EventReceiver) -> Vec<ChatEvent> {
    let mut events = Vec::new();
    while let Ok(event) = rx.try_recv() {
        events.push(event);
    }
    events
}
