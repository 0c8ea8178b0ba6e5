//! One NNTP session: TCP socket, protocol state machine, four article
//! queues, per-connection statistics.
//!
//! The reader and writer halves run as two branches of one `tokio::select!`
//! loop within `Connection::run`, directly grounded on the teacher's
//! `manage_peer` in `peer_connection.rs`: a reader future parses response
//! lines, a writer future drains an outgoing command queue, and whichever
//! finishes first (error or close) ends the task.

use std::collections::VecDeque;
use std::time::Duration;

use backon::{BackoffBuilder, ExponentialBackoff, ExponentialBuilder};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;

use crate::article::{Article, ArticleSource, WireCache};
use crate::nntp::protocol::{self, Response, ResponseOutcome};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Starting,
    Waiting,
    Connecting,
    Idle,
    IdleTimeout,
    Feeding,
    Sleeping,
    Flushing,
    Closing,
    Dead,
}

#[derive(Clone)]
pub struct ConnectionConfig {
    pub peer_name: String,
    pub addr: String,
    pub port: u16,
    pub max_queue_size: usize,
    pub wants_streaming: bool,
    pub article_timeout: Duration,
    pub response_timeout: Duration,
    pub flush_period: Duration,
    pub initial_reconnect: Duration,
    pub max_reconnect: Duration,
    pub no_check_high: f64,
    pub no_check_low: f64,
    pub no_check_filter: f64,
    pub drop_deferred: bool,
    pub log_missing_articles: bool,
}

/// What the Connection reports back to its owning Peer about one article.
pub enum ConnEvent {
    Accepted(Article),
    Refused(Article),
    Rejected(Article),
    Missing(Article),
    /// Peer asked us to try later (431/436, unless `drop-deferred`), or we
    /// are tearing down with articles still in flight.
    Defer(Article),
    StreamingChanged(bool),
    NoCheckChanged(bool),
    StateChanged(ConnectionState),
    /// No queued work and the article-timeout has fired; owner may recycle
    /// the underlying socket.
    WentIdleTimeout,
    Dead,
}

/// Commands the Peer sends down into a running Connection.
pub enum ConnCommand {
    Offer(Article),
    /// Begin an orderly QUIT once queues drain (pool flush / recycle).
    Flush,
    /// Close immediately regardless of state (pool shrink).
    Shutdown,
}

struct Counters {
    offered: u64,
    accepted: u64,
    refused: u64,
    rejected: u64,
    accepted_bytes: u64,
}

impl Default for Counters {
    fn default() -> Self {
        Self {
            offered: 0,
            accepted: 0,
            refused: 0,
            rejected: 0,
            accepted_bytes: 0,
        }
    }
}

/// The four per-connection article queues, in their spec.md §4.1 order.
#[derive(Default)]
struct Queues {
    check: VecDeque<Article>,
    check_response: VecDeque<Article>,
    take: VecDeque<Article>,
    take_response: VecDeque<Article>,
}

impl Queues {
    fn total_len(&self) -> usize {
        self.check.len() + self.check_response.len() + self.take.len() + self.take_response.len()
    }
}

pub struct Connection {
    cfg: ConnectionConfig,
    state: ConnectionState,
    queues: Queues,
    does_streaming: bool,
    /// When true, TAKETHIS is sent without a preceding CHECK (the
    /// "no-CHECK" optimisation, spec.md §4.1).
    no_check_mode: bool,
    filter_f: f64,
    backoff: ExponentialBackoff,
    counters: Counters,
    article_source: std::sync::Arc<dyn ArticleSource>,
    wire_cache: std::sync::Arc<WireCache>,
}

impl Connection {
    pub fn new(
        cfg: ConnectionConfig,
        article_source: std::sync::Arc<dyn ArticleSource>,
        wire_cache: std::sync::Arc<WireCache>,
    ) -> Self {
        let backoff = reconnect_backoff(&cfg);
        Self {
            cfg,
            state: ConnectionState::Starting,
            queues: Queues::default(),
            does_streaming: false,
            no_check_mode: false,
            filter_f: 0.0,
            backoff,
            counters: Counters::default(),
            article_source,
            wire_cache,
        }
    }

    fn f_on(&self) -> f64 {
        self.cfg.no_check_high * self.cfg.no_check_filter / 100.0
    }

    fn f_off(&self) -> f64 {
        self.cfg.no_check_low * self.cfg.no_check_filter / 100.0
    }

    /// Drives this Connection until told to shut down or it dies of a
    /// protocol/network error. `cmd_rx` carries article offers and pool
    /// control from the owning Peer; `events_tx` reports outcomes back.
    pub async fn run(
        mut self,
        mut cmd_rx: mpsc::UnboundedReceiver<ConnCommand>,
        events_tx: mpsc::UnboundedSender<ConnEvent>,
        cancel: CancellationToken,
    ) {
        self.transition(ConnectionState::Waiting, &events_tx);

        'reconnect: loop {
            if cancel.is_cancelled() {
                break;
            }

            // Waiting: block until the Peer offers something or we're torn
            // down, exactly as spec.md's Waiting->Connecting transition.
            // Skip the wait if a retried article is already queued (stashed
            // by sleep_and_backoff) — otherwise it would sit forever until
            // some unrelated command happened to arrive.
            if self.queues.total_len() == 0 {
                let first = tokio::select! {
                    _ = cancel.cancelled() => break 'reconnect,
                    cmd = cmd_rx.recv() => cmd,
                };
                let Some(cmd) = first else { break };
                match cmd {
                    ConnCommand::Shutdown => break,
                    ConnCommand::Flush => continue 'reconnect,
                    ConnCommand::Offer(article) => self.queues.check.push_back(article),
                }
            }

            self.transition(ConnectionState::Connecting, &events_tx);
            let stream = match tokio::select! {
                _ = cancel.cancelled() => break 'reconnect,
                res = with_timeout(Duration::from_secs(30), TcpStream::connect((self.cfg.addr.as_str(), self.cfg.port))) => res,
            } {
                Some(Ok(s)) => {
                    match crate::limits::enforce_fd_discipline(s, crate::limits::DEFAULT_LOW_FD_RESERVATION) {
                        Ok(s) => s,
                        Err(e) => {
                            tracing::warn!(peer = %self.cfg.peer_name, error = %e, "refusing connection, fd discipline violated");
                            self.sleep_and_backoff(&events_tx, &mut cmd_rx).await;
                            continue 'reconnect;
                        }
                    }
                }
                _ => {
                    self.sleep_and_backoff(&events_tx, &mut cmd_rx).await;
                    continue 'reconnect;
                }
            };

            let (read_half, mut write_half) = stream.into_split();
            let mut reader = BufReader::new(read_half);

            // Greeting.
            let greeting = match read_response(&mut reader, self.cfg.response_timeout).await {
                Some(r) => r,
                None => {
                    self.sleep_and_backoff(&events_tx, &mut cmd_rx).await;
                    continue 'reconnect;
                }
            };
            if !matches!(protocol::classify(greeting.code), ResponseOutcome::Greeting) {
                tracing::warn!(peer = %self.cfg.peer_name, code = greeting.code, "bad greeting");
                self.sleep_and_backoff(&events_tx, &mut cmd_rx).await;
                continue 'reconnect;
            }

            if self.cfg.wants_streaming {
                let _ = write_half.write_all(protocol::fmt_mode_stream().as_bytes()).await;
                match read_response(&mut reader, self.cfg.response_timeout).await {
                    Some(r) if r.code == protocol::CODE_STREAMING_OK => {
                        self.does_streaming = true;
                        let _ = events_tx.send(ConnEvent::StreamingChanged(true));
                    }
                    // spec.md §4.2: a 400/480/502 on any command, MODE
                    // STREAM included, puts the peer into spool mode — not
                    // merely "this peer doesn't support streaming".
                    Some(r)
                        if matches!(
                            protocol::classify(r.code),
                            ResponseOutcome::PeerRefusing
                                | ResponseOutcome::PermissionDenied
                                | ResponseOutcome::NoTalk
                        ) =>
                    {
                        tracing::warn!(peer = %self.cfg.peer_name, code = r.code, "peer refused MODE STREAM, sleeping connection");
                        self.sleep_and_backoff(&events_tx, &mut cmd_rx).await;
                        continue 'reconnect;
                    }
                    _ => self.does_streaming = false,
                }
            }

            self.transition(ConnectionState::Feeding, &events_tx);
            self.backoff = reconnect_backoff(&self.cfg); // successful connect resets backoff

            let outcome = self
                .feed_loop(&mut reader, &mut write_half, &mut cmd_rx, &events_tx, &cancel)
                .await;

            // Whatever remains queued goes back to the Peer as deferred —
            // "Cancellation" in spec.md §4.1.
            self.drain_all_as_deferred(&events_tx);

            match outcome {
                FeedOutcome::Shutdown => break,
                FeedOutcome::Died => {
                    self.sleep_and_backoff(&events_tx, &mut cmd_rx).await;
                }
            }
        }

        self.transition(ConnectionState::Dead, &events_tx);
        let _ = events_tx.send(ConnEvent::Dead);
    }

    async fn feed_loop(
        &mut self,
        reader: &mut BufReader<tokio::net::tcp::OwnedReadHalf>,
        writer: &mut tokio::net::tcp::OwnedWriteHalf,
        cmd_rx: &mut mpsc::UnboundedReceiver<ConnCommand>,
        events_tx: &mpsc::UnboundedSender<ConnEvent>,
        cancel: &CancellationToken,
    ) -> FeedOutcome {
        let mut flush_requested = false;

        loop {
            if let Err(()) = self.flush_writes(writer).await {
                return FeedOutcome::Died;
            }

            if self.queues.total_len() == 0 {
                if flush_requested {
                    let _ = writer.write_all(protocol::fmt_quit().as_bytes()).await;
                    let _ = read_response(reader, self.cfg.response_timeout).await;
                    return FeedOutcome::Died;
                }
                self.transition(ConnectionState::Idle, events_tx);
            }

            tokio::select! {
                _ = cancel.cancelled() => return FeedOutcome::Shutdown,

                _ = sleep(self.cfg.flush_period) => {
                    flush_requested = true;
                }

                _ = sleep(self.cfg.article_timeout), if self.queues.total_len() == 0 && !flush_requested => {
                    self.transition(ConnectionState::IdleTimeout, events_tx);
                    let _ = events_tx.send(ConnEvent::WentIdleTimeout);
                    let _ = writer.write_all(protocol::fmt_quit().as_bytes()).await;
                    let _ = read_response(reader, self.cfg.response_timeout).await;
                    return FeedOutcome::Died;
                }

                cmd = cmd_rx.recv() => match cmd {
                    Some(ConnCommand::Offer(article)) => {
                        if self.does_streaming || self.queues.total_len() < self.cfg.max_queue_size {
                            self.queues.check.push_back(article);
                            self.transition(ConnectionState::Feeding, events_tx);
                        } else {
                            let _ = events_tx.send(ConnEvent::Defer(article));
                        }
                    }
                    Some(ConnCommand::Flush) => flush_requested = true,
                    Some(ConnCommand::Shutdown) | None => return FeedOutcome::Shutdown,
                },

                resp = read_response(reader, self.cfg.response_timeout) => {
                    match resp {
                        Some(r) => {
                            if let Err(()) = self.handle_response(r, events_tx) {
                                return FeedOutcome::Died;
                            }
                        }
                        None => return FeedOutcome::Died,
                    }
                }
            }
        }
    }

    fn handle_response(
        &mut self,
        resp: Response,
        events_tx: &mpsc::UnboundedSender<ConnEvent>,
    ) -> Result<(), ()> {
        // Invariant 3: streaming response codes only arrive on streaming
        // connections and vice versa; a mismatch is a protocol error.
        let mode_ok = if protocol::is_streaming_only(resp.code) {
            self.does_streaming
        } else if protocol::is_non_streaming_only(resp.code) {
            !self.does_streaming
        } else {
            true
        };
        if !mode_ok {
            tracing::error!(peer = %self.cfg.peer_name, code = resp.code, "response mode mismatch, protocol error");
            return Err(());
        }

        let outcome = protocol::classify(resp.code);
        match outcome {
            // 238/335: CHECK or IHAVE's initial response said "send it" —
            // move 2 (check-response) -> 3 (take).
            ResponseOutcome::SendIt => {
                if let Some(article) = pop_head_matching(&mut self.queues.check_response, &resp) {
                    self.queues.take.push_back(article);
                } else {
                    return Err(());
                }
            }
            // 235/239: TAKETHIS or IHAVE-body accepted — move 4 -> gone.
            ResponseOutcome::Accepted => {
                if let Some(article) = pop_head_matching(&mut self.queues.take_response, &resp) {
                    self.counters.accepted += 1;
                    self.bump_filter_accept();
                    let _ = events_tx.send(ConnEvent::Accepted(article));
                } else {
                    return Err(());
                }
            }
            // 435/438: CHECK/IHAVE said "not wanted" — move 2 -> gone.
            ResponseOutcome::Refused => {
                if let Some(article) = pop_head_matching(&mut self.queues.check_response, &resp) {
                    self.counters.refused += 1;
                    self.bump_filter_refuse();
                    let _ = events_tx.send(ConnEvent::Refused(article));
                } else {
                    return Err(());
                }
            }
            // 437/439: body rejected — move 4 -> gone.
            ResponseOutcome::Rejected => {
                if let Some(article) = pop_head_matching(&mut self.queues.take_response, &resp) {
                    self.counters.rejected += 1;
                    let _ = events_tx.send(ConnEvent::Rejected(article));
                } else {
                    return Err(());
                }
            }
            // 431/436: "try later" — move 2 -> gone, deferred back to the
            // Peer unless `drop-deferred` is set (435 is never affected by
            // `drop-deferred`; it is always a permanent refusal, see
            // spec.md §9's explicit resolution of this).
            ResponseOutcome::Defer => {
                if let Some(article) = pop_head_matching(&mut self.queues.check_response, &resp) {
                    if self.cfg.drop_deferred {
                        // counted, not re-queued — spec.md §4.2.
                    } else {
                        let _ = events_tx.send(ConnEvent::Defer(article));
                    }
                } else {
                    return Err(());
                }
            }
            ResponseOutcome::PeerRefusing | ResponseOutcome::PermissionDenied | ResponseOutcome::NoTalk => {
                tracing::warn!(peer = %self.cfg.peer_name, code = resp.code, "peer refusing, sleeping connection");
                return Err(());
            }
            ResponseOutcome::Goodbye => {}
            ResponseOutcome::Greeting | ResponseOutcome::StreamingAccepted => {}
            ResponseOutcome::Unknown => {
                tracing::error!(peer = %self.cfg.peer_name, code = resp.code, "unrecognised response code");
                return Err(());
            }
        }

        self.maybe_toggle_no_check(events_tx);
        Ok(())
    }

    fn bump_filter_accept(&mut self) {
        self.filter_f += 1.0;
    }

    fn bump_filter_refuse(&mut self) {
        let tau = self.cfg.no_check_filter.max(1.0);
        self.filter_f *= 1.0 - 1.0 / tau;
    }

    fn maybe_toggle_no_check(&mut self, events_tx: &mpsc::UnboundedSender<ConnEvent>) {
        if !self.no_check_mode && self.filter_f > self.f_on() {
            self.no_check_mode = true;
            let _ = events_tx.send(ConnEvent::NoCheckChanged(true));
        } else if self.no_check_mode && self.filter_f < self.f_off() {
            self.no_check_mode = false;
            let _ = events_tx.send(ConnEvent::NoCheckChanged(false));
        }
    }

    async fn flush_writes(&mut self, writer: &mut tokio::net::tcp::OwnedWriteHalf) -> Result<(), ()> {
        while let Some(article) = self.queues.check.pop_front() {
            self.counters.offered += 1;
            let cmd = if self.does_streaming {
                if self.no_check_mode {
                    self.queues.take.push_back(article);
                    continue;
                }
                protocol::fmt_check(&article.message_id)
            } else {
                protocol::fmt_ihave(&article.message_id)
            };
            if writer.write_all(cmd.as_bytes()).await.is_err() {
                return Err(());
            }
            self.queues.check_response.push_back(article);
        }

        while let Some(article) = self.queues.take.pop_front() {
            let body = match article.wire_format(self.article_source.as_ref(), &self.wire_cache) {
                Ok(b) => b,
                Err(_) => {
                    if self.cfg.log_missing_articles {
                        tracing::warn!(peer = %self.cfg.peer_name, message_id = %article.message_id, "article missing or unreadable, dropping");
                    } else {
                        tracing::debug!(peer = %self.cfg.peer_name, message_id = %article.message_id, "article missing or unreadable, dropping");
                    }
                    continue;
                }
            };
            let cmd = protocol::fmt_takethis(&article.message_id);
            if writer.write_all(cmd.as_bytes()).await.is_err()
                || writer.write_all(&body).await.is_err()
            {
                return Err(());
            }
            self.counters.accepted_bytes += body.len() as u64;
            self.queues.take_response.push_back(article);
        }

        writer.flush().await.map_err(|_| ())
    }

    async fn sleep_and_backoff(
        &mut self,
        events_tx: &mpsc::UnboundedSender<ConnEvent>,
        cmd_rx: &mut mpsc::UnboundedReceiver<ConnCommand>,
    ) {
        self.transition(ConnectionState::Sleeping, events_tx);
        let delay = self.backoff.next().unwrap_or(self.cfg.max_reconnect);

        tokio::select! {
            _ = sleep(delay) => {}
            cmd = cmd_rx.recv() => {
                if let Some(ConnCommand::Offer(article)) = cmd {
                    self.queues.check.push_back(article);
                }
            }
        }
    }

    fn drain_all_as_deferred(&mut self, events_tx: &mpsc::UnboundedSender<ConnEvent>) {
        for q in [
            &mut self.queues.check,
            &mut self.queues.check_response,
            &mut self.queues.take,
            &mut self.queues.take_response,
        ] {
            while let Some(article) = q.pop_front() {
                let _ = events_tx.send(ConnEvent::Defer(article));
            }
        }
    }

    fn transition(&mut self, to: ConnectionState, events_tx: &mpsc::UnboundedSender<ConnEvent>) {
        self.state = to;
        let _ = events_tx.send(ConnEvent::StateChanged(to));
    }
}

enum FeedOutcome {
    Shutdown,
    Died,
}

fn pop_head_matching(queue: &mut VecDeque<Article>, resp: &Response) -> Option<Article> {
    let head = queue.front()?;
    match &resp.message_id {
        Some(id) if *id == head.message_id => queue.pop_front(),
        Some(_) => None, // mismatch: protocol error, surfaced by the caller returning Err
        None => queue.pop_front(),
    }
}

/// Reconnect backoff policy, grounded on the teacher's `backoff()` helper in
/// `torrent_state/live/peer/stats/atomic.rs`: same `ExponentialBuilder`
/// shape, parameters taken from the Connection's own configured bounds
/// instead of the torrent client's hardcoded ones. Doubles on every
/// successive failure (spec.md §4.1) up to `max_reconnect`, resetting on the
/// next successful connect.
fn reconnect_backoff(cfg: &ConnectionConfig) -> ExponentialBackoff {
    ExponentialBuilder::new()
        .with_min_delay(cfg.initial_reconnect)
        .with_factor(2.)
        .with_max_delay(cfg.max_reconnect)
        .without_max_times()
        .build()
}

/// The teacher's `with_timeout` helper (`peer_connection.rs`), generalised:
/// races `fut` against a deadline and returns `None` on timeout.
async fn with_timeout<T>(dur: Duration, fut: impl std::future::Future<Output = T>) -> Option<T> {
    tokio::select! {
        res = fut => Some(res),
        _ = sleep(dur) => None,
    }
}

async fn read_response(
    reader: &mut BufReader<tokio::net::tcp::OwnedReadHalf>,
    timeout: Duration,
) -> Option<Response> {
    let mut line = String::new();
    match with_timeout(timeout, reader.read_line(&mut line)).await {
        Some(Ok(0)) | None => None,
        Some(Ok(_)) => Response::parse(&line),
        Some(Err(_)) => None,
    }
}

/// Jittered flush-period helper so many connections to one peer don't all
/// recycle at once (spec.md §4.1 "Flush" timer).
pub fn jittered(period: Duration) -> Duration {
    let jitter_ms = (period.as_millis() as u64 / 20).max(1);
    let nanos = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.subsec_nanos() as u64)
        .unwrap_or(0);
    period + Duration::from_millis(nanos % jitter_ms)
}
