//! A pool of Connections for one remote site: owns the Tape, decides
//! queue/spool/flush policy, adjusts pool size.
//!
//! Structural analogue of the teacher's `TorrentStateLive` owning a
//! `PeerStates` map of many peer connections for one torrent; here a `Peer`
//! owns a small fixed-size array of NNTP `Connection`s instead, sized to
//! `absolute_max` (spec.md §3) rather than an arbitrary-cardinality map,
//! since the pool is capped (typically ≤ 50, the original's
//! `MAX_CONNECTION_COUNT`).

pub mod pool_sizing;

use std::collections::VecDeque;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use bitvec::vec::BitVec;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::article::{Article, ArticleSource, ArticleTable, WireCache};
use crate::nntp::{ConnCommand, ConnEvent, Connection, ConnectionConfig, ConnectionState};
use crate::tape::{DroppedLog, Tape, TapeConfig};
use pool_sizing::{PoolSizer, Resize, SizingMethod};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DispatchPolicy {
    /// Scan active Connections in slot order; first with queue space wins.
    Default,
    /// Choose the active Connection with the smallest pending queue.
    MinQueue,
}

pub struct PeerConfig {
    pub name: String,
    pub host: String,
    pub port: u16,

    pub initial_connections: usize,
    pub absolute_max: usize,
    pub max_queue_size: usize,
    pub queue_highwater: usize,

    pub dispatch_policy: DispatchPolicy,
    pub sizing_method: SizingMethod,
    pub resize_period: Duration,

    pub wants_streaming: bool,
    pub drop_deferred: bool,
    pub article_timeout: Duration,
    pub response_timeout: Duration,
    pub flush_period: Duration,
    pub initial_reconnect: Duration,
    pub max_reconnect: Duration,
    pub no_check_high: f64,
    pub no_check_low: f64,
    pub no_check_filter: f64,
    pub log_missing_articles: bool,

    pub deferred_retry: Duration,
    pub tape: TapeConfig,
}

/// Messages the dispatcher hands into a running Peer: article offers plus
/// the handful of process-wide control actions that apply per-peer
/// (spec.md §5's `SIGIOT` "flush all tapes now").
pub enum PeerMsg {
    Offer(Article),
    FlushTape,
}

struct ArticleHolder {
    article: Article,
    requeue_at: Option<Instant>,
}

struct Slot {
    cmd_tx: Option<mpsc::UnboundedSender<ConnCommand>>,
    pending: usize,
}

impl Slot {
    fn empty() -> Self {
        Self {
            cmd_tx: None,
            pending: 0,
        }
    }
}

pub struct Peer {
    cfg: PeerConfig,
    max_connections: usize,
    slots: Vec<Slot>,
    /// Whether slot `i`'s Connection is usable right now, and whether it's
    /// backed off waiting to reconnect (spec.md §3: parallel bitsets over
    /// the connection-slot array rather than a field on each slot, grounded
    /// on the teacher's `BF` bitfield-per-piece representation).
    active: BitVec,
    sleeping: BitVec,
    queued: VecDeque<ArticleHolder>,
    deferred: VecDeque<ArticleHolder>,
    spool_mode: bool,
    sizer: PoolSizer,
    articles_this_period: u64,
    accepted_this_period: u64,
    tape: Arc<Tape>,
    article_table: Arc<ArticleTable>,
    article_source: Arc<dyn ArticleSource>,
    wire_cache: Arc<WireCache>,
    events_tx: mpsc::UnboundedSender<(usize, ConnEvent)>,
    events_rx: mpsc::UnboundedReceiver<(usize, ConnEvent)>,
    cancel: CancellationToken,
    draining: bool,
}

impl Peer {
    pub fn new(
        cfg: PeerConfig,
        dropped_log: Arc<DroppedLog>,
        article_table: Arc<ArticleTable>,
        article_source: Arc<dyn ArticleSource>,
        wire_cache: Arc<WireCache>,
        cancel: CancellationToken,
    ) -> crate::error::Result<Self> {
        let tape = Arc::new(Tape::open(
            TapeConfig {
                backlog_dir: cfg.tape.backlog_dir.clone(),
                rotate_period: cfg.tape.rotate_period,
                checkpoint_period: cfg.tape.checkpoint_period,
                low_water: cfg.tape.low_water,
                high_water: cfg.tape.high_water,
                disabled: cfg.tape.disabled,
            },
            &cfg.name,
            dropped_log,
        )?);

        let absolute_max = cfg.absolute_max.max(1);
        let slots = (0..absolute_max).map(|_| Slot::empty()).collect();
        let sizer = PoolSizer::new(cfg.sizing_method, 0.5, 0.8, 0.2, 1.0);
        let (events_tx, events_rx) = mpsc::unbounded_channel();

        Ok(Self {
            max_connections: cfg.initial_connections.clamp(1, absolute_max),
            slots,
            active: BitVec::repeat(false, absolute_max),
            sleeping: BitVec::repeat(false, absolute_max),
            queued: VecDeque::new(),
            deferred: VecDeque::new(),
            spool_mode: false,
            sizer,
            articles_this_period: 0,
            accepted_this_period: 0,
            tape,
            article_table,
            article_source,
            wire_cache,
            events_tx,
            events_rx,
            cancel,
            draining: false,
            cfg,
        })
    }

    fn connection_config(&self) -> ConnectionConfig {
        ConnectionConfig {
            peer_name: self.cfg.name.clone(),
            addr: self.cfg.host.clone(),
            port: self.cfg.port,
            max_queue_size: self.cfg.max_queue_size,
            wants_streaming: self.cfg.wants_streaming,
            article_timeout: self.cfg.article_timeout,
            response_timeout: self.cfg.response_timeout,
            flush_period: crate::nntp::connection::jittered(self.cfg.flush_period),
            initial_reconnect: self.cfg.initial_reconnect,
            max_reconnect: self.cfg.max_reconnect,
            no_check_high: self.cfg.no_check_high,
            no_check_low: self.cfg.no_check_low,
            no_check_filter: self.cfg.no_check_filter,
            drop_deferred: self.cfg.drop_deferred,
            log_missing_articles: self.cfg.log_missing_articles,
        }
    }

    fn spawn_slot(&mut self, idx: usize) {
        let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
        let conn = Connection::new(
            self.connection_config(),
            self.article_source.clone(),
            self.wire_cache.clone(),
        );
        let events_tx = self.events_tx.clone();
        let cancel = self.cancel.child_token();
        let (tagged_tx, mut tagged_rx) = mpsc::unbounded_channel::<ConnEvent>();
        let peer_name = self.cfg.name.clone();
        crate::spawn_utils::spawn(
            tracing::info_span!("connection", peer = %peer_name, slot = idx),
            async move {
                conn.run(cmd_rx, tagged_tx, cancel).await;
                Ok(())
            },
        );
        crate::spawn_utils::spawn(
            tracing::info_span!("connection-events", peer = %peer_name, slot = idx),
            async move {
                while let Some(ev) = tagged_rx.recv().await {
                    if events_tx.send((idx, ev)).is_err() {
                        break;
                    }
                }
                Ok(())
            },
        );
        self.slots[idx] = Slot {
            cmd_tx: Some(cmd_tx),
            pending: 0,
        };
        self.active.set(idx, true);
        self.sleeping.set(idx, false);
    }

    fn ensure_initial_pool(&mut self) {
        for idx in 0..self.max_connections {
            if self.slots[idx].cmd_tx.is_none() {
                self.spawn_slot(idx);
            }
        }
    }

    /// Hands one Article to this Peer: picks a Connection, queues it, or
    /// spools it to the Tape, per spec.md §4.2's dispatch policy.
    pub async fn offer(&mut self, article: Article) {
        self.articles_this_period += 1;

        if self.spool_mode {
            self.spool(article).await;
            return;
        }

        if let Some(idx) = self.pick_connection() {
            self.slots[idx].pending += 1;
            if let Some(tx) = &self.slots[idx].cmd_tx {
                let _ = tx.send(ConnCommand::Offer(article));
            }
            return;
        }

        self.queued.push_back(ArticleHolder {
            article,
            requeue_at: None,
        });
        if self.queued.len() > self.cfg.queue_highwater {
            if let Some(holder) = self.queued.pop_front() {
                tracing::warn!(peer = %self.cfg.name, "queue overflow, spilling oldest article to tape");
                self.spool(holder.article).await;
            }
        }
    }

    fn usable(&self, idx: usize) -> bool {
        self.active[idx] && !self.sleeping[idx]
    }

    fn pick_connection(&self) -> Option<usize> {
        match self.cfg.dispatch_policy {
            DispatchPolicy::Default => (0..self.max_connections)
                .find(|&i| self.usable(i) && self.slots[i].pending < self.cfg.max_queue_size),
            DispatchPolicy::MinQueue => (0..self.max_connections)
                .filter(|&i| self.usable(i) && self.slots[i].pending < self.cfg.max_queue_size)
                .min_by_key(|&i| self.slots[i].pending),
        }
    }

    async fn spool(&self, article: Article) {
        let tape = self.tape.clone();
        let filename = article.filename.clone();
        let message_id = article.message_id.clone();
        let peer = self.cfg.name.clone();
        let res = tokio::task::spawn_blocking(move || tape.append(&filename, &message_id)).await;
        match res {
            Ok(Ok(())) => {}
            _ => tracing::error!(peer = %peer, "failed to spool article to tape"),
        }
    }

    fn any_connection_usable(&self) -> bool {
        (0..self.max_connections).any(|i| self.usable(i))
    }

    /// Drains `queued` first, then the Tape, into a newly-idle Connection.
    async fn feed_idle_connection(&mut self, idx: usize) {
        if let Some(holder) = self.queued.pop_front() {
            self.slots[idx].pending += 1;
            if let Some(tx) = &self.slots[idx].cmd_tx {
                let _ = tx.send(ConnCommand::Offer(holder.article));
            }
            return;
        }

        let tape = self.tape.clone();
        let next = tokio::task::spawn_blocking(move || tape.read_next())
            .await
            .unwrap_or(Ok(None));
        if let Ok(Some((filename, message_id))) = next {
            let article = self.article_table.intern(filename, message_id);
            self.slots[idx].pending += 1;
            if let Some(tx) = &self.slots[idx].cmd_tx {
                let _ = tx.send(ConnCommand::Offer(article));
            }
        }
    }

    fn recent_accept_ratio(&self) -> f64 {
        if self.articles_this_period == 0 {
            1.0
        } else {
            self.accepted_this_period as f64 / self.articles_this_period as f64
        }
    }

    fn apply_resize(&mut self, resize: Resize) {
        match resize {
            Resize::Unchanged => {}
            Resize::Grow if self.max_connections < self.cfg.absolute_max => {
                let new_idx = self.max_connections;
                self.max_connections += 1;
                self.spawn_slot(new_idx);
            }
            Resize::Shrink if self.max_connections > 1 => {
                let idx = self.max_connections - 1;
                self.max_connections -= 1;
                if let Some(tx) = self.slots[idx].cmd_tx.take() {
                    let _ = tx.send(ConnCommand::Shutdown);
                }
                self.active.set(idx, false);
            }
            _ => {}
        }
    }

    /// Runs this Peer's management loop until cancelled. `offer_rx` carries
    /// Articles and control messages handed in from the dispatcher.
    pub async fn run(mut self, mut offer_rx: mpsc::UnboundedReceiver<PeerMsg>) {
        self.ensure_initial_pool();

        let mut resize_timer = tokio::time::interval(self.cfg.resize_period);
        let mut deferred_timer = tokio::time::interval(Duration::from_secs(5));
        let mut tape_timer = tokio::time::interval(Duration::from_secs(10));

        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => break,

                msg = offer_rx.recv(), if !self.draining => {
                    match msg {
                        Some(PeerMsg::Offer(article)) => self.offer(article).await,
                        Some(PeerMsg::FlushTape) => self.flush_tape_now().await,
                        None => {
                            self.draining = true;
                            for slot in &self.slots {
                                if let Some(tx) = &slot.cmd_tx {
                                    let _ = tx.send(ConnCommand::Flush);
                                }
                            }
                        }
                    }
                }

                _ = resize_timer.tick() => {
                    let resize = self.sizer.decide(
                        self.queued.len(),
                        self.cfg.queue_highwater,
                        self.articles_this_period,
                        self.recent_accept_ratio(),
                    );
                    self.apply_resize(resize);
                    self.articles_this_period = 0;
                    self.accepted_this_period = 0;
                }

                _ = deferred_timer.tick() => {
                    let now = Instant::now();
                    let mut ready = Vec::new();
                    while matches!(self.deferred.front(), Some(h) if h.requeue_at.map(|t| t <= now).unwrap_or(true)) {
                        if let Some(h) = self.deferred.pop_front() {
                            ready.push(h.article);
                        }
                    }
                    for article in ready {
                        self.offer(article).await;
                    }
                }

                _ = tape_timer.tick() => {
                    let tape = self.tape.clone();
                    let _ = tokio::task::spawn_blocking(move || {
                        let _ = tape.maybe_rotate();
                        if tape.should_checkpoint() {
                            let _ = tape.checkpoint();
                            tape.mark_checkpointed();
                        }
                    }).await;
                }

                ev = self.events_rx.recv() => {
                    let Some((idx, ev)) = ev else { break };
                    self.handle_event(idx, ev).await;
                }
            }

            if self.draining && self.fully_drained() {
                break;
            }
        }
    }

    /// `SIGIOT` handling (spec.md §5 "flush all tapes now"): force a
    /// checkpoint regardless of `checkpoint_period`.
    async fn flush_tape_now(&self) {
        let tape = self.tape.clone();
        let res = tokio::task::spawn_blocking(move || tape.checkpoint()).await;
        match res {
            Ok(Ok(())) => self.tape.mark_checkpointed(),
            Ok(Err(e)) => tracing::warn!(peer = %self.cfg.name, error = %e, "forced tape checkpoint failed"),
            Err(e) => tracing::warn!(peer = %self.cfg.name, error = %e, "forced tape checkpoint task panicked"),
        }
    }

    fn fully_drained(&self) -> bool {
        self.queued.is_empty()
            && self.deferred.is_empty()
            && self.slots.iter().all(|s| s.cmd_tx.is_none() || s.pending == 0)
    }

    async fn handle_event(&mut self, idx: usize, ev: ConnEvent) {
        match ev {
            ConnEvent::Accepted(_) => {
                self.accepted_this_period += 1;
                self.slots[idx].pending = self.slots[idx].pending.saturating_sub(1);
            }
            ConnEvent::Refused(_) | ConnEvent::Rejected(_) | ConnEvent::Missing(_) => {
                self.slots[idx].pending = self.slots[idx].pending.saturating_sub(1);
            }
            ConnEvent::Defer(article) => {
                self.slots[idx].pending = self.slots[idx].pending.saturating_sub(1);
                if self.cfg.drop_deferred {
                    return;
                }
                self.deferred.push_back(ArticleHolder {
                    article,
                    requeue_at: Some(Instant::now() + self.cfg.deferred_retry),
                });
            }
            ConnEvent::StateChanged(state) => {
                match state {
                    ConnectionState::Sleeping => {
                        self.active.set(idx, false);
                        self.sleeping.set(idx, true);
                        if !self.any_connection_usable() {
                            self.spool_mode = true;
                        }
                    }
                    ConnectionState::Idle => {
                        self.active.set(idx, true);
                        self.sleeping.set(idx, false);
                        if self.spool_mode {
                            self.spool_mode = false;
                        }
                        self.feed_idle_connection(idx).await;
                    }
                    ConnectionState::Feeding | ConnectionState::Connecting => {
                        self.active.set(idx, true);
                        self.sleeping.set(idx, false);
                    }
                    _ => {}
                }
            }
            ConnEvent::WentIdleTimeout => {}
            ConnEvent::StreamingChanged(_) | ConnEvent::NoCheckChanged(_) => {}
            ConnEvent::Dead => {
                self.slots[idx].cmd_tx = None;
                self.active.set(idx, false);
                self.sleeping.set(idx, false);
                if idx < self.max_connections && !self.draining {
                    self.spawn_slot(idx);
                }
            }
        }
    }

    pub fn name(&self) -> &str {
        &self.cfg.name
    }

    pub fn tape_path(&self) -> PathBuf {
        self.cfg.tape.backlog_dir.join(&self.cfg.name)
    }
}
