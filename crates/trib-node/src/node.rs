//! Node orchestration: routing ops to per-object sessions.
//!
//! A [`ReplicationNode`] owns the log store, the transport, the node
//! clock, and one spawned task per active object. Each task runs its
//! [`ObjectSession`] serially over a bounded mailbox, commits every
//! step's saves as one batch, and only then flushes the step's sends.
//! A failed commit produces a single `.error` back at whoever sent
//! the triggering op and nothing else, so peers retry instead of
//! diverging.

use crate::error::{NodeError, Result};
use crate::session::{ObjectSession, Reaction, SessionCtx};
use crate::transport::{PeerId, Transport};
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, warn};
use trib_proto::Op;
use trib_store::{dedup_batch, Key, LogStore, StoreError};
use trib_time::{base64, Clock};

/// Mailbox depth per object task. Senders queue behind it, which is
/// the node's backpressure.
const MAILBOX: usize = 64;

#[derive(Clone)]
enum Envelope {
    Deliver { source: PeerId, op: Op },
    Resubscribe,
    PeerClosed(PeerId),
}

struct SessionHandle {
    tx: mpsc::Sender<Envelope>,
}

struct NodeShared {
    store: Arc<dyn LogStore>,
    transport: Arc<dyn Transport>,
    upstream: RwLock<Option<PeerId>>,
    clock: Arc<Mutex<Clock>>,
}

/// The node-level record persisted under the node meta key.
#[derive(Debug, Default, Serialize, Deserialize)]
struct NodeMeta {
    /// Session ids granted so far.
    granted: u64,
}

/// One replica in the replication tree.
pub struct ReplicationNode {
    own_id: String,
    shared: Arc<NodeShared>,
    sessions: Mutex<HashMap<String, SessionHandle>>,
    /// Serializes session id grants against the node meta record.
    grant: tokio::sync::Mutex<()>,
}

impl ReplicationNode {
    /// A node stamping with calendar time.
    pub fn new(
        own_id: impl Into<String>,
        store: Arc<dyn LogStore>,
        transport: Arc<dyn Transport>,
    ) -> Self {
        let own_id = own_id.into();
        let clock = Clock::new(own_id.clone());
        Self::with_clock(own_id, store, transport, clock)
    }

    /// A node stamping with a pure Lamport counter, for tests and
    /// deterministic replays.
    pub fn logical(
        own_id: impl Into<String>,
        store: Arc<dyn LogStore>,
        transport: Arc<dyn Transport>,
    ) -> Self {
        let own_id = own_id.into();
        let clock = Clock::logical(own_id.clone());
        Self::with_clock(own_id, store, transport, clock)
    }

    fn with_clock(
        own_id: String,
        store: Arc<dyn LogStore>,
        transport: Arc<dyn Transport>,
        clock: Clock,
    ) -> Self {
        ReplicationNode {
            own_id,
            shared: Arc::new(NodeShared {
                store,
                transport,
                upstream: RwLock::new(None),
                clock: Arc::new(Mutex::new(clock)),
            }),
            sessions: Mutex::new(HashMap::new()),
            grant: tokio::sync::Mutex::new(()),
        }
    }

    pub fn own_id(&self) -> &str {
        &self.own_id
    }

    pub fn upstream(&self) -> Option<PeerId> {
        self.shared.upstream.read().clone()
    }

    /// Point the node at a (new) upstream. Every active session
    /// replays its subscription toward it.
    pub async fn set_upstream(&self, peer: Option<PeerId>) {
        *self.shared.upstream.write() = peer;
        self.broadcast(Envelope::Resubscribe).await;
    }

    /// A peer connection died: forget its subscriptions everywhere,
    /// and drop it as upstream if it was one.
    pub async fn peer_closed(&self, peer: &PeerId) {
        {
            let mut up = self.shared.upstream.write();
            if up.as_ref() == Some(peer) {
                *up = None;
            }
        }
        self.broadcast(Envelope::PeerClosed(peer.clone())).await;
    }

    /// Grant a fresh origin id to a connecting client: the node's own
    /// id, a separator, and a durably monotone counter. Survives
    /// restart, so no two grants ever collide.
    pub async fn grant_session_id(&self) -> Result<String> {
        let _guard = self.grant.lock().await;
        let key = Key::node();
        let mut meta = match self.shared.store.get(&key).await? {
            Some(text) => serde_json::from_str::<NodeMeta>(&text)
                .map_err(|err| StoreError::MalformedRecord(format!("node meta: {}", err)))?,
            None => NodeMeta::default(),
        };
        meta.granted += 1;
        let record = serde_json::to_string(&meta)?;
        self.shared.store.batch_put(vec![(key, record)]).await?;
        Ok(format!("{}~{}", self.own_id, base64::encode_int(meta.granted)))
    }

    /// Deliver one incoming op from a peer. Recoverable problems
    /// become `.error` replies over the transport; `Err` means the
    /// node itself is unhealthy.
    pub async fn write(&self, source: &PeerId, op: Op) -> Result<()> {
        if let Err(e) = op.validate() {
            self.shared
                .transport
                .send(source, op.error_reply(e.to_string()))
                .await?;
            return Ok(());
        }
        let tx = match self.route(&op).await? {
            Some(tx) => tx,
            None => {
                self.shared
                    .transport
                    .send(source, op.error_reply("unknown object"))
                    .await?;
                return Ok(());
            }
        };
        tx.send(Envelope::Deliver {
            source: source.clone(),
            op,
        })
        .await
        .map_err(|_| NodeError::SessionClosed(source.as_str().to_string()))
    }

    /// Deliver one incoming op in its one-line text form, for hosts
    /// that frame peer traffic as lines rather than structured
    /// records. A line that does not parse is a host-side framing
    /// defect and surfaces as `Err`, not as an `.error` reply.
    pub async fn write_line(&self, source: &PeerId, line: &str) -> Result<()> {
        let op = Op::parse_line(line)?;
        self.write(source, op).await
    }

    /// Find the object's mailbox. Sessions spin up lazily, and only a
    /// subscription may spin one up; anything else for an unknown
    /// object routes nowhere.
    async fn route(&self, op: &Op) -> Result<Option<mpsc::Sender<Envelope>>> {
        if let Some(handle) = self.sessions.lock().get(&op.object) {
            return Ok(Some(handle.tx.clone()));
        }
        if !op.is_on() {
            return Ok(None);
        }
        let session = ObjectSession::load(&op.object, self.shared.store.as_ref()).await?;
        let (tx, rx) = mpsc::channel(MAILBOX);
        let mut map = self.sessions.lock();
        if let Some(handle) = map.get(&op.object) {
            // lost the race while loading
            return Ok(Some(handle.tx.clone()));
        }
        debug!(object = %op.object, "session started");
        tokio::spawn(run_session(session, rx, Arc::clone(&self.shared)));
        map.insert(op.object.clone(), SessionHandle { tx: tx.clone() });
        Ok(Some(tx))
    }

    async fn broadcast(&self, env: Envelope) {
        let mailboxes: Vec<_> = self
            .sessions
            .lock()
            .values()
            .map(|h| h.tx.clone())
            .collect();
        for tx in mailboxes {
            let _ = tx.send(env.clone()).await;
        }
    }
}

/// The per-object loop: one envelope, one session step, one batch
/// commit, then the sends.
async fn run_session(
    mut session: ObjectSession,
    mut rx: mpsc::Receiver<Envelope>,
    shared: Arc<NodeShared>,
) {
    while let Some(env) = rx.recv().await {
        let ctx = SessionCtx {
            upstream: shared.upstream.read().clone(),
            clock: Arc::clone(&shared.clock),
        };
        let (result, origin) = match env {
            Envelope::Deliver { source, op } => {
                let keyed = (source.clone(), op.clone());
                let step = session
                    .process(&source, op, shared.store.as_ref(), &ctx)
                    .await;
                (step, Some(keyed))
            }
            Envelope::Resubscribe => {
                (session.resubscribe(shared.store.as_ref(), &ctx).await, None)
            }
            Envelope::PeerClosed(peer) => {
                let mut out = Reaction::default();
                (session.drop_peer(&peer, &mut out).map(|_| out), None)
            }
        };
        let out = match result {
            Ok(out) => out,
            Err(e) => {
                warn!(object = %session.typeid(), "session step failed: {e}");
                reply_failure(&shared, &origin, &e).await;
                continue;
            }
        };
        // durable first; if the commit fails, nothing was said
        let batch = dedup_batch(out.saves);
        if let Err(e) = shared.store.batch_put(batch).await {
            warn!(object = %session.typeid(), "batch commit failed: {e}");
            reply_failure(&shared, &origin, &NodeError::from(e)).await;
            continue;
        }
        for (to, op) in out.sends {
            if let Err(e) = shared.transport.send(&to, op).await {
                warn!(object = %session.typeid(), peer = %to, "send failed: {e}");
            }
        }
    }
    debug!(object = %session.typeid(), "session retired");
}

/// The single `.error` a failed step produces, addressed at whoever
/// triggered it.
async fn reply_failure(shared: &NodeShared, origin: &Option<(PeerId, Op)>, err: &NodeError) {
    if let Some((source, op)) = origin {
        let reply = op.error_reply(format!("write failed: {err}"));
        if let Err(e) = shared.transport.send(source, reply).await {
            warn!(peer = %source, "error reply failed: {e}");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::MemoryTransport;
    use std::time::Duration;
    use trib_proto::OpName;
    use trib_store::MemoryLogStore;
    use trib_time::Stamp;

    fn node(id: &str) -> (ReplicationNode, Arc<MemoryLogStore>, Arc<MemoryTransport>) {
        let store = Arc::new(MemoryLogStore::new());
        let transport = Arc::new(MemoryTransport::new());
        let node = ReplicationNode::logical(
            id,
            Arc::clone(&store) as Arc<dyn LogStore>,
            Arc::clone(&transport) as Arc<dyn Transport>,
        );
        (node, store, transport)
    }

    fn peer(id: &str) -> PeerId {
        PeerId::new(id)
    }

    fn on(object: &str, stamp: &str, bookmark: &str) -> Op {
        Op::new(object, Stamp::parse(stamp), OpName::On, bookmark)
    }

    fn mutation(object: &str, stamp: &str, value: &str) -> Op {
        Op::new(object, Stamp::parse(stamp), OpName::Mutation("set".into()), value)
    }

    /// Poll the peer's queue until the spawned session task has
    /// flushed something.
    async fn drain(transport: &MemoryTransport, peer: &PeerId) -> Vec<Op> {
        for _ in 0..100 {
            let ops = transport.take(peer);
            if !ops.is_empty() {
                return ops;
            }
            tokio::time::sleep(Duration::from_millis(2)).await;
        }
        Vec::new()
    }

    async fn settle() {
        tokio::time::sleep(Duration::from_millis(20)).await;
    }

    #[tokio::test]
    async fn subscribe_then_write_relays_to_other_subscribers() {
        let (node, _store, transport) = node("srv");
        let (a, b) = (peer("a"), peer("b"));

        node.write(&a, on("chat#1", "1+a", "0")).await.unwrap();
        let got = drain(&transport, &a).await;
        assert_eq!(got.len(), 1);
        assert_eq!(got[0].name, OpName::On);

        node.write(&b, on("chat#1", "2+b", "0")).await.unwrap();
        drain(&transport, &b).await;

        node.write(&b, mutation("chat#1", "3+b", "x=1")).await.unwrap();
        let got = drain(&transport, &a).await;
        assert_eq!(got.len(), 1);
        assert_eq!(got[0].value, "x=1");
        // the writer itself gets no echo for a new op
        settle().await;
        assert!(transport.take(&b).is_empty());
    }

    #[tokio::test]
    async fn writes_to_unknown_objects_are_errors() {
        let (node, _store, transport) = node("srv");
        let a = peer("a");

        node.write(&a, mutation("chat#9", "1+a", "x=1")).await.unwrap();
        let got = drain(&transport, &a).await;
        assert_eq!(got.len(), 1);
        assert_eq!(got[0].name, OpName::Error);
        assert_eq!(got[0].value, "unknown object");
        // no session spun up for it
        assert!(node.sessions.lock().is_empty());
    }

    #[tokio::test]
    async fn invalid_ops_are_bounced_before_routing() {
        let (node, _store, transport) = node("srv");
        let a = peer("a");

        let bad = Op::new("", Stamp::parse("1+a"), OpName::Mutation("set".into()), "");
        node.write(&a, bad).await.unwrap();
        let got = drain(&transport, &a).await;
        assert_eq!(got.len(), 1);
        assert_eq!(got[0].name, OpName::Error);
    }

    #[tokio::test]
    async fn granted_session_ids_are_monotone_and_durable() {
        let (node, store, _transport) = node("srv");

        let first = node.grant_session_id().await.unwrap();
        let second = node.grant_session_id().await.unwrap();
        assert_eq!(first, "srv~1");
        assert_eq!(second, "srv~2");
        assert!(second > first);

        // a restarted node continues the sequence
        let transport2 = Arc::new(MemoryTransport::new());
        let node2 = ReplicationNode::logical(
            "srv",
            Arc::clone(&store) as Arc<dyn LogStore>,
            transport2 as Arc<dyn Transport>,
        );
        let third = node2.grant_session_id().await.unwrap();
        assert_eq!(third, "srv~3");
    }

    #[tokio::test]
    async fn setting_an_upstream_resubscribes_active_sessions() {
        let (node, _store, transport) = node("srv");
        let a = peer("a");

        node.write(&a, on("chat#1", "1+a", "0")).await.unwrap();
        drain(&transport, &a).await;
        node.write(&a, mutation("chat#1", "2+a", "x=1")).await.unwrap();
        settle().await;

        let up = peer("up");
        node.set_upstream(Some(up.clone())).await;
        let got = drain(&transport, &up).await;
        assert_eq!(got.len(), 1);
        assert_eq!(got[0].name, OpName::On);
        // our unacked op rides along
        assert_eq!(got[0].patch.as_ref().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn closed_peers_stop_receiving_relays() {
        let (node, _store, transport) = node("srv");
        let (a, b) = (peer("a"), peer("b"));

        node.write(&a, on("chat#1", "1+a", "0")).await.unwrap();
        drain(&transport, &a).await;
        node.write(&b, on("chat#1", "2+b", "0")).await.unwrap();
        drain(&transport, &b).await;

        node.peer_closed(&a).await;
        settle().await;
        node.write(&b, mutation("chat#1", "3+b", "x=1")).await.unwrap();
        settle().await;
        assert!(transport.take(&a).is_empty());
    }

    #[tokio::test]
    async fn closing_the_upstream_peer_clears_it() {
        let (node, _store, _transport) = node("srv");
        let up = peer("up");
        node.set_upstream(Some(up.clone())).await;
        assert_eq!(node.upstream(), Some(up.clone()));
        node.peer_closed(&up).await;
        assert_eq!(node.upstream(), None);
    }

    #[tokio::test]
    async fn failed_commit_yields_one_error_and_no_relay() {
        let (node, store, transport) = node("srv");
        let (a, b) = (peer("a"), peer("b"));

        node.write(&a, on("chat#1", "1+a", "0")).await.unwrap();
        drain(&transport, &a).await;
        node.write(&b, on("chat#1", "2+b", "0")).await.unwrap();
        drain(&transport, &b).await;

        store.fail_next_batch();
        node.write(&b, mutation("chat#1", "3+b", "x=1")).await.unwrap();
        let got = drain(&transport, &b).await;
        assert_eq!(got.len(), 1);
        assert_eq!(got[0].name, OpName::Error);
        assert!(got[0].value.contains("write failed"));
        // nothing leaked to the other subscriber
        assert!(transport.take(&a).is_empty());
    }

    #[tokio::test]
    async fn a_failed_send_skips_only_that_peer() {
        let (node, _store, transport) = node("srv");
        let (a, b, c) = (peer("a"), peer("b"), peer("c"));

        node.write(&a, on("chat#1", "1+a", "0")).await.unwrap();
        drain(&transport, &a).await;
        node.write(&b, on("chat#1", "2+b", "0")).await.unwrap();
        drain(&transport, &b).await;
        node.write(&c, on("chat#1", "3+c", "0")).await.unwrap();
        drain(&transport, &c).await;

        // sends are fire-and-forget: a dead connection loses its
        // relay, the rest of the step still goes through
        transport.fail_next_send();
        node.write(&c, mutation("chat#1", "4+c", "x=1")).await.unwrap();
        let got = drain(&transport, &b).await;
        assert_eq!(got.len(), 1);
        assert_eq!(got[0].value, "x=1");
        settle().await;
        assert!(transport.take(&a).is_empty());
    }

    #[tokio::test]
    async fn text_framed_writes_route_like_structured_ones() {
        let (node, _store, transport) = node("srv");
        let a = peer("a");

        node.write_line(&a, "chat#1!1+a..on 0").await.unwrap();
        let got = drain(&transport, &a).await;
        assert_eq!(got.len(), 1);
        assert_eq!(got[0].name, OpName::On);

        node.write_line(&a, "chat#1!2+a.set x=1").await.unwrap();
        settle().await;
        // sole subscriber wrote it, so nothing comes back
        assert!(transport.take(&a).is_empty());

        assert!(node.write_line(&a, "not an op line").await.is_err());
    }
}
