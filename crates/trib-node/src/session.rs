//! The per-object reconciliation state machine.
//!
//! One [`ObjectSession`] exists per replicated object. It classifies,
//! validates, and answers every incoming op for that object against a
//! locally cached window of the object's history, and emits two
//! queues per processing step: records to save durably and ops to
//! send to peers. The node commits the saves before flushing the
//! sends, so an op is never acknowledged or relayed before the state
//! it depends on is durable.
//!
//! All state mutation for an object happens inside `process`, one op
//! (or one op bundle) at a time. The only suspension points are log
//! store reads when the cached window has to reach further back.

use crate::error::Result;
use crate::transport::PeerId;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{debug, warn};
use trib_proto::{Op, OpName, ProtoError};
use trib_store::{Key, LogStore, StoreError};
use trib_time::{AnchoredVv, Clock, Stamp, TipStack, VersionVector};

/// Window floor sentinel: above every flattened tip position, so a
/// freshly loaded session starts with nothing cached.
const WINDOW_NONE: &str = "~~~~~~~~~~~";

/// What one processing step wants done, in order: commit the saves as
/// one batch, then flush the sends.
#[derive(Debug, Default)]
pub struct Reaction {
    pub saves: Vec<(Key, String)>,
    pub sends: Vec<(PeerId, Op)>,
}

/// Node-side context a step runs under: who the upstream is right
/// now, and the node's clock for issuing stamps.
#[derive(Clone)]
pub struct SessionCtx {
    pub upstream: Option<PeerId>,
    pub clock: Arc<Mutex<Clock>>,
}

/// The session record persisted under the object's meta key.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
struct SessionMeta {
    /// Stamp of the newest op this session has stored.
    last: Stamp,
    /// Arrival-order marker (see `trib_time::tip`).
    tip: TipStack,
    /// The upstream's known position, from our perspective.
    avv: AnchoredVv,
    /// Position of the last full snapshot, zero if none.
    state: Stamp,
    /// Peers currently subscribed to this object.
    subscribers: Vec<PeerId>,
}

/// One cached op record: its storage position, the stamp it carries,
/// and the stored value.
#[derive(Clone, Debug)]
struct Record {
    position: String,
    stamp: Stamp,
    name: OpName,
    value: String,
}

impl Record {
    fn to_op(&self, object: &str) -> Op {
        Op::new(object, self.stamp.clone(), self.name.clone(), self.value.clone())
    }
}

/// Outcome of offering one regular op to the session.
#[derive(Debug, PartialEq, Eq)]
enum Applied {
    New,
    Replay,
    Rejected,
}

/// Per-object session state machine.
pub struct ObjectSession {
    typeid: String,
    meta: SessionMeta,
    /// Cached records, in arrival order. Contiguous: every stored
    /// record at or past `window_from` is present.
    window: Vec<Record>,
    window_from: String,
}

impl ObjectSession {
    /// A session for an object with no prior record.
    pub fn fresh(typeid: impl Into<String>) -> Self {
        ObjectSession {
            typeid: typeid.into(),
            meta: SessionMeta::default(),
            window: Vec::new(),
            window_from: "0".to_string(),
        }
    }

    /// Load the session record from the store, or start fresh.
    pub async fn load(typeid: &str, store: &dyn LogStore) -> Result<Self> {
        match store.get(&Key::meta(typeid)).await? {
            Some(json) => {
                let meta = serde_json::from_str(&json).map_err(|err| {
                    StoreError::MalformedRecord(format!("{} meta: {}", typeid, err))
                })?;
                Ok(ObjectSession {
                    typeid: typeid.to_string(),
                    meta,
                    window: Vec::new(),
                    window_from: WINDOW_NONE.to_string(),
                })
            }
            None => Ok(ObjectSession::fresh(typeid)),
        }
    }

    pub fn typeid(&self) -> &str {
        &self.typeid
    }

    pub fn subscribers(&self) -> &[PeerId] {
        &self.meta.subscribers
    }

    pub fn has_subscribers(&self) -> bool {
        !self.meta.subscribers.is_empty()
    }

    /// The flattened arrival position of this object.
    pub fn position(&self) -> String {
        self.meta.tip.position()
    }

    /// One processing step: classify and answer one op (bundles count
    /// as one step). Everything recoverable becomes a `.error` send;
    /// `Err` is reserved for storage and codec failures.
    pub async fn process(
        &mut self,
        source: &PeerId,
        op: Op,
        store: &dyn LogStore,
        ctx: &SessionCtx,
    ) -> Result<Reaction> {
        let mut out = Reaction::default();
        debug!(source = %source, op = %op, "processing");
        ctx.clock.lock().observe(&op.stamp);
        let from_upstream = ctx.upstream.as_ref() == Some(source);

        match &op.name {
            OpName::On => self.subscribe(source, &op, from_upstream, store, ctx, &mut out).await?,
            OpName::Off => self.unsubscribe(source, &op, &mut out),
            OpName::State => {
                self.snapshot_push(source, &op, from_upstream, store, &mut out).await?;
                if let Some(patch) = &op.patch {
                    for p in patch {
                        self.apply(source, p, from_upstream, store, ctx, &mut out).await?;
                    }
                }
            }
            OpName::Error => {
                warn!(object = %self.typeid, source = %source, "peer reported error: {}", op.value);
            }
            OpName::Mutation(_) => {
                self.apply(source, &op, from_upstream, store, ctx, &mut out).await?;
                if let Some(patch) = &op.patch {
                    for p in patch {
                        self.apply(source, p, from_upstream, store, ctx, &mut out).await?;
                    }
                }
            }
        }

        self.queue_meta(&mut out)?;
        Ok(out)
    }

    /// Replay our upstream subscription, used when the upstream
    /// connection is (re)established.
    pub async fn resubscribe(
        &mut self,
        store: &dyn LogStore,
        ctx: &SessionCtx,
    ) -> Result<Reaction> {
        let mut out = Reaction::default();
        if let Some(up) = ctx.upstream.clone() {
            if self.has_subscribers() {
                self.patch_upstream(&up, store, ctx, &mut out).await?;
                self.queue_meta(&mut out)?;
            }
        }
        Ok(out)
    }

    /// Forget a dead peer connection.
    pub fn drop_peer(&mut self, peer: &PeerId, out: &mut Reaction) -> Result<()> {
        if let Some(i) = self.meta.subscribers.iter().position(|s| s == peer) {
            self.meta.subscribers.remove(i);
            self.queue_meta(out)?;
        }
        Ok(())
    }

    // --- subscription -------------------------------------------------

    async fn subscribe(
        &mut self,
        source: &PeerId,
        op: &Op,
        from_upstream: bool,
        store: &dyn LogStore,
        ctx: &SessionCtx,
        out: &mut Reaction,
    ) -> Result<()> {
        if from_upstream {
            // reciprocal on: pure bookkeeping, no reply
            let ack = parse_ack(&op.value);
            self.meta.avv.merge(&ack);
            if let Some(patch) = &op.patch {
                for p in patch {
                    self.apply(source, p, true, store, ctx, &mut *out).await?;
                }
            }
            self.absorb_acks();
            return Ok(());
        }

        // attached ops first: the subscriber pushing what it already
        // has; their stamps double as its acknowledgement vector
        let mut ack = VersionVector::new();
        if let Some(patch) = &op.patch {
            for p in patch {
                ack.add(&p.stamp);
                self.apply(source, p, false, store, ctx, &mut *out).await?;
            }
        }

        let (bookmark_text, extra_ack) = match op.value.split_once(';') {
            Some((pos, vv)) => (pos, VersionVector::parse(vv)),
            None => (op.value.as_str(), VersionVector::new()),
        };
        ack.merge(&extra_ack);

        let bookmark = match TipStack::parse(bookmark_text.trim()) {
            Some(b) => b,
            None => {
                let err = ProtoError::MalformedBookmark(bookmark_text.trim().to_string());
                out.sends.push((source.clone(), op.error_reply(err.to_string())));
                return Ok(());
            }
        };
        if bookmark.position() > self.meta.tip.position() {
            out.sends.push((source.clone(), op.error_reply("bookmark is ahead")));
            return Ok(());
        }

        // a zero bookmark resolves to the snapshot, bracketing the
        // patch with the full state
        let (base, base_inclusive) = if bookmark.is_empty() && !self.meta.state.is_zero() {
            (self.meta.state.to_string(), true)
        } else {
            (bookmark.position(), bookmark.is_empty())
        };
        self.ensure_window(store, &base).await?;

        let mut patch = Vec::new();
        for rec in &self.window {
            let past = if base_inclusive {
                rec.position.as_str() >= base.as_str()
            } else {
                rec.position.as_str() > base.as_str()
            };
            if past && !ack.covers(&rec.stamp) {
                patch.push(rec.to_op(&self.typeid));
            }
        }

        let mut known = ack;
        for stamp in bookmark.iter() {
            known.add(stamp);
        }
        debug!(object = %self.typeid, source = %source, ops = patch.len(), "subscription patch");
        let reply = Op::new(&self.typeid, op.stamp.clone(), OpName::On, known.to_string())
            .with_patch(patch);
        out.sends.push((source.clone(), reply));

        let first = self.meta.subscribers.is_empty();
        if !self.meta.subscribers.contains(source) {
            self.meta.subscribers.push(source.clone());
        }
        if first {
            if let Some(up) = ctx.upstream.clone() {
                if up != *source {
                    self.patch_upstream(&up, store, ctx, out).await?;
                }
            }
        }
        Ok(())
    }

    /// Synthesize our own subscription toward the upstream, anchored
    /// at what it has acknowledged so far and carrying everything it
    /// has not.
    async fn patch_upstream(
        &mut self,
        up: &PeerId,
        store: &dyn LogStore,
        ctx: &SessionCtx,
        out: &mut Reaction,
    ) -> Result<()> {
        let anchored_at_state = self.meta.avv.anchor() == "0" && !self.meta.state.is_zero();
        let base = if anchored_at_state {
            self.meta.state.to_string()
        } else {
            self.meta.avv.anchor().to_string()
        };
        self.ensure_window(store, &base).await?;

        let mut pending: Vec<Op> = Vec::new();
        let mut contiguous = true;
        let mut absorbed: Vec<(String, Stamp)> = Vec::new();
        for rec in &self.window {
            let past = if anchored_at_state {
                rec.position.as_str() >= base.as_str()
            } else {
                rec.position.as_str() > base.as_str()
            };
            if !past {
                continue;
            }
            if self.meta.avv.covers(&rec.position, &rec.stamp) {
                if contiguous {
                    absorbed.push((rec.position.clone(), rec.stamp.clone()));
                }
            } else {
                contiguous = false;
                pending.push(rec.to_op(&self.typeid));
            }
        }
        for (position, stamp) in &absorbed {
            self.meta.avv.advance(position, stamp);
        }

        let value = if anchored_at_state && self.meta.avv.anchor() == "0" {
            // nothing acked yet: anchor the request at our snapshot
            self.meta.state.to_string()
        } else {
            self.meta.avv.to_string()
        };
        let stamp = ctx.clock.lock().issue();
        let on = Op::new(&self.typeid, stamp, OpName::On, value).with_patch(pending);
        out.sends.push((up.clone(), on));
        Ok(())
    }

    fn unsubscribe(&mut self, source: &PeerId, op: &Op, out: &mut Reaction) {
        match self.meta.subscribers.iter().position(|s| s == source) {
            Some(i) => {
                self.meta.subscribers.remove(i);
                out.sends.push((source.clone(), op.stripped()));
            }
            None => {
                out.sends.push((source.clone(), op.error_reply("not subscribed")));
            }
        }
    }

    // --- snapshots ----------------------------------------------------

    async fn snapshot_push(
        &mut self,
        source: &PeerId,
        op: &Op,
        from_upstream: bool,
        store: &dyn LogStore,
        out: &mut Reaction,
    ) -> Result<()> {
        let no_history = self.meta.tip.is_empty() && self.meta.state.is_zero();
        if no_history {
            self.append(op, out);
            self.meta.state = op.stamp.clone();
            if from_upstream {
                self.note_upstream_ack(&op.stamp);
            }
            self.relay(source, op, out);
            return Ok(());
        }

        if !from_upstream {
            out.sends.push((
                source.clone(),
                op.error_reply("state push rejected: object has history"),
            ));
            return Ok(());
        }

        // a baseline replacement must not discard unacknowledged ops
        self.ensure_window(store, "0").await?;
        let unacked = self
            .window
            .iter()
            .any(|rec| rec.name.is_mutation() && !self.meta.avv.covers(&rec.position, &rec.stamp));
        if unacked {
            out.sends.push((
                source.clone(),
                op.error_reply("state push rejected: unacknowledged ops pending"),
            ));
            return Ok(());
        }

        self.append(op, out);
        self.meta.state = op.stamp.clone();
        self.note_upstream_ack(&op.stamp);
        self.relay(source, op, out);
        Ok(())
    }

    // --- regular ops --------------------------------------------------

    /// Offer one regular op: classify against the tip, store and relay
    /// if new, acknowledge if replayed, reject on causality violation.
    async fn apply(
        &mut self,
        source: &PeerId,
        op: &Op,
        from_upstream: bool,
        store: &dyn LogStore,
        ctx: &SessionCtx,
        out: &mut Reaction,
    ) -> Result<Applied> {
        if !op.name.is_mutation() && op.name != OpName::State {
            out.sends.push((source.clone(), op.error_reply("invalid op pattern")));
            return Ok(Applied::Rejected);
        }
        if op.stamp.is_zero() || op.stamp.is_error() {
            out.sends.push((source.clone(), op.error_reply("malformed stamp")));
            return Ok(Applied::Rejected);
        }

        let newest = self.meta.tip.max().map_or(true, |max| op.stamp > *max);
        let at_top = self.meta.tip.top().map_or(false, |top| op.stamp == *top);
        let known = if newest {
            Applied::New
        } else if at_top {
            Applied::Replay
        } else {
            self.scan(&op.stamp, store).await?
        };

        match known {
            Applied::New => {
                self.append(op, out);
                if from_upstream {
                    self.note_upstream_ack(&op.stamp);
                }
                self.relay(source, op, out);
                if !from_upstream {
                    if let Some(up) = &ctx.upstream {
                        if up != source {
                            out.sends.push((up.clone(), op.stripped()));
                        }
                    }
                }
                Ok(Applied::New)
            }
            Applied::Replay => {
                if from_upstream {
                    // pure acknowledgement
                    self.note_upstream_ack(&op.stamp);
                } else {
                    // re-acknowledge so a lossy downstream converges
                    out.sends.push((source.clone(), op.stripped()));
                }
                Ok(Applied::Replay)
            }
            Applied::Rejected => {
                debug!(object = %self.typeid, stamp = %op.stamp, "causality violation");
                out.sends.push((source.clone(), op.error_reply("causality violation")));
                Ok(Applied::Rejected)
            }
        }
    }

    /// Scan cached history back to `stamp`, loading older windows as
    /// needed. Distinguishes replay (the exact stamp is stored) from a
    /// legitimate out-of-order arrival, and detects an origin whose
    /// stamps run backward.
    async fn scan(&mut self, stamp: &Stamp, store: &dyn LogStore) -> Result<Applied> {
        let bound = stamp.to_string();
        self.ensure_window(store, &bound).await?;
        for rec in self.window.iter().rev() {
            if rec.position.as_str() < bound.as_str() {
                break;
            }
            if rec.stamp == *stamp {
                return Ok(Applied::Replay);
            }
            if rec.stamp.origin() == stamp.origin() && rec.stamp > *stamp {
                // an origin's stamps must be monotone in arrival order
                return Ok(Applied::Rejected);
            }
        }
        Ok(Applied::New)
    }

    // --- internals ----------------------------------------------------

    /// Append a new op at the arrival tip and queue its durable save.
    fn append(&mut self, op: &Op, out: &mut Reaction) {
        self.meta.tip.insert(&op.stamp);
        let position = self.meta.tip.position();
        out.saves
            .push((Key::op(&self.typeid, &position, &op.name), op.value.clone()));
        if self.window_from.as_str() > position.as_str() {
            self.window_from = position.clone();
        }
        self.window.push(Record {
            position,
            stamp: op.stamp.clone(),
            name: op.name.clone(),
            value: op.value.clone(),
        });
        if op.stamp > self.meta.last {
            self.meta.last = op.stamp.clone();
        }
    }

    /// Relay an op to every subscriber except its source.
    fn relay(&self, source: &PeerId, op: &Op, out: &mut Reaction) {
        for sub in &self.meta.subscribers {
            if sub != source {
                out.sends.push((sub.clone(), op.stripped()));
            }
        }
    }

    /// Record an upstream acknowledgement and absorb whatever became
    /// contiguous with the anchor.
    fn note_upstream_ack(&mut self, stamp: &Stamp) {
        self.meta.avv.note(stamp);
        self.absorb_acks();
    }

    /// Advance the anchor over acked records, in arrival order, while
    /// the cached window actually reaches back to the anchor.
    fn absorb_acks(&mut self) {
        let anchor_pos = self.meta.avv.anchor().to_string();
        if self.window_from.as_str() > anchor_pos.as_str() {
            return;
        }
        let mut advanced = Vec::new();
        for rec in &self.window {
            if rec.position.as_str() <= anchor_pos.as_str() {
                continue;
            }
            if self.meta.avv.covers(&rec.position, &rec.stamp) {
                advanced.push((rec.position.clone(), rec.stamp.clone()));
            } else {
                break;
            }
        }
        for (position, stamp) in advanced {
            self.meta.avv.advance(&position, &stamp);
        }
    }

    /// Make the cached window reach back to `bound` (a flattened
    /// position), loading the missing range from the store. The one
    /// legitimate suspension point besides the final batch commit.
    async fn ensure_window(&mut self, store: &dyn LogStore, bound: &str) -> Result<()> {
        if self.window_from.as_str() <= bound {
            return Ok(());
        }
        let from = Key::scan_from(&self.typeid, bound);
        let to = Key::scan_from(&self.typeid, &self.window_from);
        let rows = store.scan_range(&from, &to, false).await?;
        debug!(object = %self.typeid, rows = rows.len(), "history window load");
        let mut older = Vec::with_capacity(rows.len() + self.window.len());
        for (key, value) in rows {
            let (_, position, name) = key.parse_op()?;
            let stamp = position.top().cloned().unwrap_or_default();
            older.push(Record {
                position: position.position(),
                stamp,
                name,
                value,
            });
        }
        older.append(&mut self.window);
        self.window = older;
        self.window_from = bound.to_string();
        Ok(())
    }

    fn queue_meta(&self, out: &mut Reaction) -> Result<()> {
        out.saves
            .push((Key::meta(&self.typeid), serde_json::to_string(&self.meta)?));
        Ok(())
    }
}

/// Parse the ack-vector value of a reciprocal `.on`: either a flat
/// vector or an `anchor;vector` pair.
fn parse_ack(value: &str) -> VersionVector {
    match value.split_once(';') {
        Some((anchor, vv)) => {
            let mut ack = VersionVector::parse(vv);
            if let Some(position) = TipStack::parse(anchor) {
                for stamp in position.iter() {
                    ack.add(stamp);
                }
            }
            ack
        }
        None => {
            let mut ack = VersionVector::parse(value);
            if let Some(position) = TipStack::parse(value) {
                for stamp in position.iter() {
                    ack.add(stamp);
                }
            }
            ack
        }
    }
}
