use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;

use crate::article::{ArticleSource, ArticleTable, WireCache};
use crate::nntp::{ConnCommand, ConnEvent, Connection, ConnectionConfig};
use crate::peer::{DispatchPolicy, Peer, PeerConfig};
use crate::peer::pool_sizing::SizingMethod;
use crate::tape::{DroppedLog, TapeConfig};

struct FixedArticleSource;

impl ArticleSource for FixedArticleSource {
    fn read_body(&self, _filename: &Path) -> std::io::Result<Vec<u8>> {
        Ok(b"line one\nline two\n".to_vec())
    }
}

fn connection_config(port: u16, max_queue_size: usize) -> ConnectionConfig {
    ConnectionConfig {
        peer_name: "peerX".to_string(),
        addr: "127.0.0.1".to_string(),
        port,
        max_queue_size,
        wants_streaming: true,
        article_timeout: Duration::from_secs(5),
        response_timeout: Duration::from_secs(5),
        flush_period: Duration::from_secs(3600),
        initial_reconnect: Duration::from_millis(20),
        max_reconnect: Duration::from_millis(200),
        no_check_high: 95.0,
        no_check_low: 90.0,
        no_check_filter: 50.0,
        drop_deferred: false,
        log_missing_articles: true,
    }
}

async fn read_line(reader: &mut BufReader<tokio::net::tcp::OwnedReadHalf>) -> String {
    let mut line = String::new();
    reader.read_line(&mut line).await.unwrap();
    line
}

/// End-to-end scenario 1: a streaming peer accepting one article sees
/// MODE STREAM, CHECK, then TAKETHIS plus its dot-terminated body.
#[tokio::test]
async fn straight_streaming_accept() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();

    let server = tokio::spawn(async move {
        let (sock, _) = listener.accept().await.unwrap();
        let (read_half, mut write_half) = sock.into_split();
        let mut reader = BufReader::new(read_half);

        write_half.write_all(b"200 ready\r\n").await.unwrap();
        assert_eq!(read_line(&mut reader).await, "MODE STREAM\r\n");
        write_half.write_all(b"203 streaming ok\r\n").await.unwrap();

        assert_eq!(read_line(&mut reader).await, "CHECK <m1@a>\r\n");
        write_half.write_all(b"238 <m1@a>\r\n").await.unwrap();

        assert_eq!(read_line(&mut reader).await, "TAKETHIS <m1@a>\r\n");
        assert_eq!(read_line(&mut reader).await, "line one\r\n");
        assert_eq!(read_line(&mut reader).await, "line two\r\n");
        assert_eq!(read_line(&mut reader).await, ".\r\n");
        write_half.write_all(b"239 <m1@a>\r\n").await.unwrap();
    });

    let article_table = ArticleTable::new();
    let article = article_table.intern(
        "art1".into(),
        crate::article::MessageId::parse("<m1@a>").unwrap(),
    );

    let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
    let (events_tx, mut events_rx) = mpsc::unbounded_channel();
    let cancel = CancellationToken::new();

    let conn = Connection::new(
        connection_config(port, 2),
        Arc::new(FixedArticleSource),
        Arc::new(WireCache::new(1 << 20)),
    );
    let run = tokio::spawn(conn.run(cmd_rx, events_tx, cancel.clone()));

    cmd_tx.send(ConnCommand::Offer(article)).unwrap();

    let mut accepted = false;
    let outcome = timeout(Duration::from_secs(2), async {
        while let Some(ev) = events_rx.recv().await {
            if let ConnEvent::Accepted(_) = ev {
                accepted = true;
                break;
            }
        }
    })
    .await;
    assert!(outcome.is_ok(), "timed out waiting for acceptance");
    assert!(accepted);

    cancel.cancel();
    let _ = run.await;
    server.await.unwrap();
}

/// End-to-end scenario 2: a CHECK refusal never produces a TAKETHIS.
#[tokio::test]
async fn check_refusal_skips_takethis() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();

    let server = tokio::spawn(async move {
        let (sock, _) = listener.accept().await.unwrap();
        let (read_half, mut write_half) = sock.into_split();
        let mut reader = BufReader::new(read_half);

        write_half.write_all(b"200 ready\r\n").await.unwrap();
        assert_eq!(read_line(&mut reader).await, "MODE STREAM\r\n");
        write_half.write_all(b"203 streaming ok\r\n").await.unwrap();

        assert_eq!(read_line(&mut reader).await, "CHECK <m1@a>\r\n");
        write_half.write_all(b"438 <m1@a>\r\n").await.unwrap();

        // Nothing else should ever arrive; read_line blocking forever (until
        // the socket closes) with no further command proves no TAKETHIS was
        // sent.
        let mut buf = [0u8; 16];
        let n = read_half_closed(&mut reader.into_inner(), &mut buf).await;
        assert_eq!(n, 0);
    });

    let article_table = ArticleTable::new();
    let article = article_table.intern(
        "art1".into(),
        crate::article::MessageId::parse("<m1@a>").unwrap(),
    );

    let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
    let (events_tx, mut events_rx) = mpsc::unbounded_channel();
    let cancel = CancellationToken::new();

    let conn = Connection::new(
        connection_config(port, 2),
        Arc::new(FixedArticleSource),
        Arc::new(WireCache::new(1 << 20)),
    );
    let run = tokio::spawn(conn.run(cmd_rx, events_tx, cancel.clone()));
    cmd_tx.send(ConnCommand::Offer(article)).unwrap();

    let mut refused = false;
    let outcome = timeout(Duration::from_secs(2), async {
        while let Some(ev) = events_rx.recv().await {
            if let ConnEvent::Refused(_) = ev {
                refused = true;
                break;
            }
        }
    })
    .await;
    assert!(outcome.is_ok(), "timed out waiting for refusal");
    assert!(refused);

    cancel.cancel();
    let _ = run.await;
    server.await.unwrap();
}

async fn read_half_closed(
    stream: &mut tokio::net::tcp::OwnedReadHalf,
    buf: &mut [u8],
) -> usize {
    timeout(Duration::from_millis(500), stream.read(buf))
        .await
        .unwrap_or(Ok(0))
        .unwrap_or(0)
}

/// End-to-end scenario 3 (queue side): once the in-memory `queued` backlog
/// exceeds `queue-highwater`, the oldest articles spill onto the Tape rather
/// than being dropped, and FIFO order is preserved.
#[tokio::test]
async fn queue_overflow_spills_to_tape_fifo() {
    let dir = tempfile::tempdir().unwrap();
    let dropped_log = Arc::new(DroppedLog::open(&dir.path().join("dropped.log")).unwrap());

    let cfg = PeerConfig {
        name: "testpeer".to_string(),
        host: "127.0.0.1".to_string(),
        port: 1, // never dialed: the pool is never started in this test.
        initial_connections: 1,
        absolute_max: 1,
        max_queue_size: 5,
        queue_highwater: 3,
        dispatch_policy: DispatchPolicy::Default,
        sizing_method: SizingMethod::Static,
        resize_period: Duration::from_secs(30),
        wants_streaming: true,
        drop_deferred: false,
        article_timeout: Duration::from_secs(600),
        response_timeout: Duration::from_secs(300),
        flush_period: Duration::from_secs(86400),
        initial_reconnect: Duration::from_secs(30),
        max_reconnect: Duration::from_secs(3600),
        no_check_high: 95.0,
        no_check_low: 90.0,
        no_check_filter: 50.0,
        log_missing_articles: false,
        deferred_retry: Duration::from_secs(60),
        tape: TapeConfig {
            backlog_dir: dir.path().to_path_buf(),
            rotate_period: Duration::from_secs(3600),
            checkpoint_period: Duration::from_secs(3600),
            low_water: 1 << 20,
            high_water: 2 << 20,
            disabled: false,
        },
    };

    let article_table = Arc::new(ArticleTable::new());
    let mut peer = Peer::new(
        cfg,
        dropped_log,
        article_table.clone(),
        Arc::new(FixedArticleSource),
        Arc::new(WireCache::new(1 << 20)),
        CancellationToken::new(),
    )
    .unwrap();

    // No Connections are ever spawned (ensure_initial_pool is never called),
    // so every offer() queues in memory until the highwater mark spills it.
    for i in 1..=5 {
        let id = crate::article::MessageId::parse(&format!("<m{i}@a>")).unwrap();
        let article = article_table.intern(format!("art{i}").into(), id);
        peer.offer(article).await;
    }

    let spooled = std::fs::read_to_string(dir.path().join("testpeer.output")).unwrap();
    let lines: Vec<&str> = spooled.lines().collect();
    assert_eq!(lines.len(), 2, "only the oldest two articles should spill");
    assert!(lines[0].starts_with("art1 "));
    assert!(lines[1].starts_with("art2 "));
}

/// End-to-end scenario 5: once the low-pass accept filter crosses `f_on`,
/// the connection stops sending CHECK and goes straight to TAKETHIS.
#[tokio::test]
async fn no_check_mode_engages_after_threshold() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();

    let server = tokio::spawn(async move {
        let (sock, _) = listener.accept().await.unwrap();
        let (read_half, mut write_half) = sock.into_split();
        let mut reader = BufReader::new(read_half);

        write_half.write_all(b"200 ready\r\n").await.unwrap();
        assert_eq!(read_line(&mut reader).await, "MODE STREAM\r\n");
        write_half.write_all(b"203 streaming ok\r\n").await.unwrap();

        // Two full CHECK/TAKETHIS round trips, each accepted, to push the
        // filter over f_on.
        for n in 1..=2 {
            assert_eq!(read_line(&mut reader).await, format!("CHECK <m{n}@a>\r\n"));
            write_half
                .write_all(format!("238 <m{n}@a>\r\n").as_bytes())
                .await
                .unwrap();
            assert_eq!(read_line(&mut reader).await, format!("TAKETHIS <m{n}@a>\r\n"));
            assert_eq!(read_line(&mut reader).await, "line one\r\n");
            assert_eq!(read_line(&mut reader).await, "line two\r\n");
            assert_eq!(read_line(&mut reader).await, ".\r\n");
            write_half
                .write_all(format!("239 <m{n}@a>\r\n").as_bytes())
                .await
                .unwrap();
        }

        // Third article: no-CHECK mode should now be active, so the very
        // next line on the wire is TAKETHIS, not CHECK.
        assert_eq!(read_line(&mut reader).await, "TAKETHIS <m3@a>\r\n");
        assert_eq!(read_line(&mut reader).await, "line one\r\n");
        assert_eq!(read_line(&mut reader).await, "line two\r\n");
        assert_eq!(read_line(&mut reader).await, ".\r\n");
        write_half.write_all(b"239 <m3@a>\r\n").await.unwrap();
    });

    let article_table = ArticleTable::new();
    let mut cfg = connection_config(port, 4);
    cfg.no_check_high = 50.0;
    cfg.no_check_low = 10.0;
    cfg.no_check_filter = 2.0;

    let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
    let (events_tx, mut events_rx) = mpsc::unbounded_channel();
    let cancel = CancellationToken::new();

    let conn = Connection::new(cfg, Arc::new(FixedArticleSource), Arc::new(WireCache::new(1 << 20)));
    let run = tokio::spawn(conn.run(cmd_rx, events_tx, cancel.clone()));

    let offer_nth = |n: u32| {
        let id = crate::article::MessageId::parse(&format!("<m{n}@a>")).unwrap();
        article_table.intern(format!("art{n}").into(), id)
    };
    cmd_tx.send(ConnCommand::Offer(offer_nth(1))).unwrap();

    // Feed article 2 only once article 1 is actually accepted, and article 3
    // only once no-check mode has engaged, so the wire order the mock server
    // expects can never race ahead of the filter's own state transitions.
    let mut no_check_seen = false;
    let mut accepted = 0;
    let outcome = timeout(Duration::from_secs(2), async {
        while let Some(ev) = events_rx.recv().await {
            match ev {
                ConnEvent::NoCheckChanged(true) => {
                    no_check_seen = true;
                    cmd_tx.send(ConnCommand::Offer(offer_nth(3))).unwrap();
                }
                ConnEvent::Accepted(_) => {
                    accepted += 1;
                    if accepted == 1 {
                        cmd_tx.send(ConnCommand::Offer(offer_nth(2))).unwrap();
                    } else if accepted == 3 {
                        break;
                    }
                }
                _ => {}
            }
        }
    })
    .await;
    assert!(outcome.is_ok(), "timed out waiting for all three acceptances");
    assert!(no_check_seen, "no-check mode never engaged");
    assert_eq!(accepted, 3);

    cancel.cancel();
    let _ = run.await;
    server.await.unwrap();
}

/// End-to-end scenario 6: the peer closes the socket mid-TAKETHIS (no
/// response ever arrives), so the connection dies, defers the article, backs
/// off, and on reconnect resends it exactly once.
#[tokio::test]
async fn dead_mid_takethis_retries_once_on_reconnect() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();

    let server = tokio::spawn(async move {
        // First attempt: accept, negotiate streaming, read CHECK, answer it,
        // read TAKETHIS and its body, then vanish without a response.
        let (sock1, _) = listener.accept().await.unwrap();
        let (read_half1, mut write_half1) = sock1.into_split();
        let mut reader1 = BufReader::new(read_half1);

        write_half1.write_all(b"200 ready\r\n").await.unwrap();
        assert_eq!(read_line(&mut reader1).await, "MODE STREAM\r\n");
        write_half1.write_all(b"203 streaming ok\r\n").await.unwrap();

        assert_eq!(read_line(&mut reader1).await, "CHECK <m1@a>\r\n");
        write_half1.write_all(b"238 <m1@a>\r\n").await.unwrap();

        assert_eq!(read_line(&mut reader1).await, "TAKETHIS <m1@a>\r\n");
        assert_eq!(read_line(&mut reader1).await, "line one\r\n");
        assert_eq!(read_line(&mut reader1).await, "line two\r\n");
        assert_eq!(read_line(&mut reader1).await, ".\r\n");
        drop(write_half1);
        drop(reader1);

        // Second attempt, after the connection backs off and is re-offered
        // the same (deferred) article: it must appear on the wire again,
        // and exactly once.
        let (sock2, _) = listener.accept().await.unwrap();
        let (read_half2, mut write_half2) = sock2.into_split();
        let mut reader2 = BufReader::new(read_half2);

        write_half2.write_all(b"200 ready\r\n").await.unwrap();
        assert_eq!(read_line(&mut reader2).await, "MODE STREAM\r\n");
        write_half2.write_all(b"203 streaming ok\r\n").await.unwrap();

        assert_eq!(read_line(&mut reader2).await, "CHECK <m1@a>\r\n");
        write_half2.write_all(b"238 <m1@a>\r\n").await.unwrap();
        assert_eq!(read_line(&mut reader2).await, "TAKETHIS <m1@a>\r\n");
        assert_eq!(read_line(&mut reader2).await, "line one\r\n");
        assert_eq!(read_line(&mut reader2).await, "line two\r\n");
        assert_eq!(read_line(&mut reader2).await, ".\r\n");
        write_half2.write_all(b"239 <m1@a>\r\n").await.unwrap();
    });

    let article_table = ArticleTable::new();
    let mut cfg = connection_config(port, 4);
    cfg.initial_reconnect = Duration::from_millis(10);
    cfg.max_reconnect = Duration::from_millis(50);

    let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
    let (events_tx, mut events_rx) = mpsc::unbounded_channel();
    let cancel = CancellationToken::new();

    let conn = Connection::new(cfg, Arc::new(FixedArticleSource), Arc::new(WireCache::new(1 << 20)));
    let run = tokio::spawn(conn.run(cmd_rx, events_tx, cancel.clone()));

    let id = crate::article::MessageId::parse("<m1@a>").unwrap();
    let article = article_table.intern("art1".into(), id);
    cmd_tx.send(ConnCommand::Offer(article)).unwrap();

    // Drive the event stream: the first death shows up as a Defer; re-offer
    // the same article (simulating the owning Peer's retry), then wait for
    // a single Accepted.
    let mut deferred = 0;
    let mut accepted = 0;
    let outcome = timeout(Duration::from_secs(3), async {
        while let Some(ev) = events_rx.recv().await {
            match ev {
                ConnEvent::Defer(article) => {
                    deferred += 1;
                    cmd_tx.send(ConnCommand::Offer(article)).unwrap();
                }
                ConnEvent::Accepted(_) => {
                    accepted += 1;
                    break;
                }
                _ => {}
            }
        }
    })
    .await;
    assert!(outcome.is_ok(), "timed out waiting for reconnect-and-accept");
    assert_eq!(deferred, 1, "article should have been deferred exactly once");
    assert_eq!(accepted, 1, "article should have been accepted exactly once");

    cancel.cancel();
    let _ = run.await;
    server.await.unwrap();
}
