//! In-process collaborators for tests that need no broker.

use doc_fanout::auth::{AuthError, AuthFuture, Authenticator};
use doc_fanout::bridge::{Bridge, BridgeInbound};
use doc_fanout::envelope::{EditEvent, Envelope, Identity};
use doc_fanout::ingest::EditLog;
use doc_fanout::Result;
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;

/// Accepts exactly the tokens it was given.
#[derive(Default)]
pub struct StaticAuthenticator {
    tokens: HashMap<String, Identity>,
    calls: AtomicUsize,
}

impl StaticAuthenticator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_token(mut self, token: &str, identity: Identity) -> Self {
        self.tokens.insert(token.to_string(), identity);
        self
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

impl Authenticator for StaticAuthenticator {
    fn authenticate<'a>(&'a self, token: &'a str) -> AuthFuture<'a> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let result = self.tokens.get(token).cloned().ok_or(AuthError::Rejected);
        Box::pin(async move { result })
    }
}

/// Edit log that keeps every appended event.
#[derive(Default)]
pub struct RecordingEditLog {
    events: Mutex<Vec<EditEvent>>,
}

impl RecordingEditLog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<EditEvent> {
        self.events.lock().unwrap().clone()
    }
}

impl EditLog for RecordingEditLog {
    fn append(&self, event: EditEvent) -> Result<()> {
        self.events.lock().unwrap().push(event);
        Ok(())
    }
}

type Subscriptions = Arc<Mutex<HashMap<String, Vec<(usize, BridgeInbound)>>>>;

/// Ordered in-memory pub/sub shared by several hubs.
///
/// Like Redis, a publisher subscribed to the document receives its own
/// message back; the echo filter in [`BridgeInbound`] drops it.
pub struct InMemoryMedium {
    tx: mpsc::UnboundedSender<Envelope>,
    subscriptions: Subscriptions,
    next_member: AtomicUsize,
    published: AtomicUsize,
}

impl InMemoryMedium {
    pub fn new() -> Arc<Self> {
        let (tx, mut rx) = mpsc::unbounded_channel::<Envelope>();
        let subscriptions: Subscriptions = Arc::new(Mutex::new(HashMap::new()));

        let subs = subscriptions.clone();
        tokio::spawn(async move {
            while let Some(envelope) = rx.recv().await {
                let targets: Vec<BridgeInbound> = subs
                    .lock()
                    .unwrap()
                    .get(&envelope.document_id)
                    .map(|members| members.iter().map(|(_, inbound)| inbound.clone()).collect())
                    .unwrap_or_default();
                for target in targets {
                    target.deliver(envelope.clone()).await;
                }
            }
        });

        Arc::new(Self {
            tx,
            subscriptions,
            next_member: AtomicUsize::new(0),
            published: AtomicUsize::new(0),
        })
    }

    /// A bridge for one hub, relaying into `inbound`.
    pub fn attach(self: &Arc<Self>, inbound: BridgeInbound) -> MediumBridge {
        MediumBridge {
            medium: self.clone(),
            member: self.next_member.fetch_add(1, Ordering::SeqCst),
            inbound,
        }
    }

    pub fn published(&self) -> usize {
        self.published.load(Ordering::SeqCst)
    }

    pub fn subscribers(&self, document_id: &str) -> usize {
        self.subscriptions
            .lock()
            .unwrap()
            .get(document_id)
            .map(Vec::len)
            .unwrap_or(0)
    }
}

pub struct MediumBridge {
    medium: Arc<InMemoryMedium>,
    member: usize,
    inbound: BridgeInbound,
}

impl Bridge for MediumBridge {
    fn subscribe_document(&self, document_id: &str) {
        let mut subs = self.medium.subscriptions.lock().unwrap();
        let members = subs.entry(document_id.to_string()).or_default();
        if !members.iter().any(|(m, _)| *m == self.member) {
            members.push((self.member, self.inbound.clone()));
        }
    }

    fn unsubscribe_document(&self, document_id: &str) {
        let mut subs = self.medium.subscriptions.lock().unwrap();
        if let Some(members) = subs.get_mut(document_id) {
            members.retain(|(m, _)| *m != self.member);
            if members.is_empty() {
                subs.remove(document_id);
            }
        }
    }

    fn publish(&self, envelope: &Envelope) {
        self.medium.published.fetch_add(1, Ordering::SeqCst);
        let _ = self.medium.tx.send(envelope.clone());
    }

    fn is_connected(&self) -> bool {
        true
    }
}
