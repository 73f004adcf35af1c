//! End-to-end scenarios: channel backend serving, bounded concurrency,
//! graceful shutdown, codec pipelines, and multi-source weighted fairness.

use std::{
    io::Write as _,
    sync::{
        Arc,
        atomic::{AtomicBool, AtomicUsize, Ordering},
    },
    time::Duration,
};

use fairway::{
    Message, MessageWriter as _, MultiServer, ReceiveError, ServeError, Server as _, ServerWeight,
    Topic as _,
    backend::mem,
    decorate::{base64 as b64, lz4},
    dump_body, receiver_fn, sched,
};
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;

const TIMEOUT: Duration = Duration::from_secs(10);

async fn wait_for(counter: &AtomicUsize, target: usize) {
    timeout(TIMEOUT, async {
        while counter.load(Ordering::SeqCst) < target {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .unwrap_or_else(|_| {
        panic!(
            "timed out waiting for {target} completions, saw {}",
            counter.load(Ordering::SeqCst)
        )
    });
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn serve_counts_every_message() {
    let (topic, queue) = mem::channel(8);
    for body in ["a", "b", "c"] {
        topic.send(Message::from_bytes(body)).await.unwrap();
    }

    let srv = Arc::new(mem::Server::new(queue, 1));
    let calls = Arc::new(AtomicUsize::new(0));

    let c = calls.clone();
    let receiver = Arc::new(receiver_fn(move |_ctx, _msg| {
        let calls = c.clone();
        async move {
            calls.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }));

    let worker = {
        let srv = srv.clone();
        tokio::spawn(async move { srv.serve(receiver).await })
    };

    wait_for(&calls, 3).await;
    assert_eq!(calls.load(Ordering::SeqCst), 3);

    let err = timeout(TIMEOUT, srv.shutdown(CancellationToken::new()))
        .await
        .unwrap()
        .unwrap_err();
    assert!(matches!(err, ServeError::Closed));

    let err = timeout(TIMEOUT, worker).await.unwrap().unwrap().unwrap_err();
    assert!(matches!(err, ServeError::Closed));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 8)]
async fn concurrency_never_exceeds_configured_limit() {
    const MESSAGES: usize = 10_000;
    const CONCURRENCY: usize = 10;

    let (topic, queue) = mem::channel(MESSAGES);
    for i in 0..MESSAGES {
        topic
            .send(Message::from_bytes(format!("this is a test message #{i}")))
            .await
            .unwrap();
    }

    let srv = Arc::new(mem::Server::new(queue, CONCURRENCY));
    let current = Arc::new(AtomicUsize::new(0));
    let high_water = Arc::new(AtomicUsize::new(0));
    let total = Arc::new(AtomicUsize::new(0));

    let (cur, high, tot) = (current.clone(), high_water.clone(), total.clone());
    let receiver = Arc::new(receiver_fn(move |_ctx, _msg| {
        let (cur, high, tot) = (cur.clone(), high.clone(), tot.clone());
        async move {
            let now = cur.fetch_add(1, Ordering::SeqCst) + 1;
            high.fetch_max(now, Ordering::SeqCst);
            tokio::task::yield_now().await;
            cur.fetch_sub(1, Ordering::SeqCst);
            tot.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }));

    let srv2 = srv.clone();
    tokio::spawn(async move { srv2.serve(receiver).await });

    wait_for(&total, MESSAGES).await;
    assert_eq!(total.load(Ordering::SeqCst), MESSAGES);
    assert!(
        high_water.load(Ordering::SeqCst) <= CONCURRENCY,
        "observed concurrency {} exceeds limit {CONCURRENCY}",
        high_water.load(Ordering::SeqCst)
    );

    srv.shutdown(CancellationToken::new()).await.unwrap_err();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn failed_deliveries_are_retried_until_success() {
    let (topic, queue) = mem::channel(4);
    topic.send(Message::from_bytes("flaky")).await.unwrap();

    let srv = Arc::new(mem::Server::new(queue, 1));
    let calls = Arc::new(AtomicUsize::new(0));
    let done = Arc::new(AtomicUsize::new(0));

    let (c, d) = (calls.clone(), done.clone());
    let receiver = Arc::new(receiver_fn(move |_ctx, _msg| {
        let (calls, done) = (c.clone(), d.clone());
        async move {
            if calls.fetch_add(1, Ordering::SeqCst) < 10 {
                return Err(ReceiveError::Handler(anyhow::anyhow!(
                    "could not complete transaction"
                )));
            }
            done.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }));

    let srv2 = srv.clone();
    tokio::spawn(async move { srv2.serve(receiver).await });

    wait_for(&done, 1).await;
    assert_eq!(calls.load(Ordering::SeqCst), 11);

    srv.shutdown(CancellationToken::new()).await.unwrap_err();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn shutdown_deadline_hard_cancels_receivers() {
    let (topic, queue) = mem::channel(1);
    topic.send(Message::from_bytes("long job")).await.unwrap();

    let srv = Arc::new(mem::Server::new(queue, 1));
    let started = Arc::new(AtomicUsize::new(0));
    let observed_cancel = Arc::new(AtomicBool::new(false));

    let (s, o) = (started.clone(), observed_cancel.clone());
    let receiver = Arc::new(receiver_fn(move |ctx: CancellationToken, _msg| {
        let (started, observed) = (s.clone(), o.clone());
        async move {
            started.fetch_add(1, Ordering::SeqCst);
            tokio::select! {
                _ = tokio::time::sleep(Duration::from_secs(10)) => Ok(()),
                _ = ctx.cancelled() => {
                    observed.store(true, Ordering::SeqCst);
                    Err(ReceiveError::Cancelled)
                }
            }
        }
    }));

    let srv2 = srv.clone();
    tokio::spawn(async move { srv2.serve(receiver).await });
    wait_for(&started, 1).await;

    // Grace period of one second, far shorter than the receiver's work.
    let deadline = CancellationToken::new();
    let d = deadline.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_secs(1)).await;
        d.cancel();
    });

    let begin = std::time::Instant::now();
    let err = timeout(TIMEOUT, srv.shutdown(deadline))
        .await
        .unwrap()
        .unwrap_err();
    assert!(matches!(err, ServeError::DeadlineExceeded));
    assert!(begin.elapsed() < Duration::from_secs(5));

    timeout(TIMEOUT, async {
        while !observed_cancel.load(Ordering::SeqCst) {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("receiver observed the hard cancellation");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn base64_pipeline_roundtrip() {
    // Wire form: the encoded payload plus the transfer-encoding attribute.
    let (topic, queue) = mem::channel(1);
    let encoded = b64::encoder(topic);

    let mut w = encoded.new_writer(CancellationToken::new()).await;
    w.write(b"hello,world!").await.unwrap();
    w.close().await.unwrap();

    let mut wire = queue.recv().await.unwrap();
    assert_eq!(wire.attributes.get("Content-Transfer-Encoding"), "base64");
    assert_eq!(dump_body(&mut wire).unwrap(), b"aGVsbG8sd29ybGQh");

    // Received form: a decoding server delivers the original bytes.
    let (topic, queue) = mem::channel(1);
    let encoded = b64::encoder(topic);
    let mut w = encoded.new_writer(CancellationToken::new()).await;
    w.write(b"hello,world!").await.unwrap();
    w.close().await.unwrap();

    let srv = Arc::new(mem::Server::new(queue, 1));
    let delivered = Arc::new(AtomicUsize::new(0));

    let d = delivered.clone();
    let receiver = Arc::new(b64::decoder(receiver_fn(move |_ctx, mut msg: Message| {
        let delivered = d.clone();
        async move {
            assert_eq!(dump_body(&mut msg)?, b"hello,world!");
            delivered.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    })));

    let srv2 = srv.clone();
    tokio::spawn(async move { srv2.serve(receiver).await });

    wait_for(&delivered, 1).await;
    srv.shutdown(CancellationToken::new()).await.unwrap_err();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn mislabelled_compression_is_left_undecoded() {
    let mut encoder = lz4_flex::frame::FrameEncoder::new(Vec::new());
    encoder.write_all(b"hello, world!").unwrap();
    let compressed = encoder.finish().unwrap();

    let mut msg = Message::from_bytes(compressed.clone());
    msg.attributes.set("Content-Encoding", "gzip");

    let (topic, queue) = mem::channel(1);
    topic.send(msg).await.unwrap();

    let srv = Arc::new(mem::Server::new(queue, 1));
    let delivered = Arc::new(AtomicUsize::new(0));

    let d = delivered.clone();
    let receiver = Arc::new(lz4::decoder(receiver_fn(move |_ctx, mut msg: Message| {
        let (delivered, compressed) = (d.clone(), compressed.clone());
        async move {
            // The encoding header does not match: the receiver sees the raw
            // compressed bytes, not the original text.
            let body = dump_body(&mut msg)?;
            assert_eq!(body, compressed);
            assert_ne!(body, b"hello, world!");
            delivered.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    })));

    let srv2 = srv.clone();
    tokio::spawn(async move { srv2.serve(receiver).await });

    wait_for(&delivered, 1).await;
    srv.shutdown(CancellationToken::new()).await.unwrap_err();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 8)]
async fn weighted_fairness_tracks_configured_shares() {
    const WEIGHTS: [f64; 3] = [1.0, 2.0, 3.0];
    const CONCURRENCY: usize = 10;
    const RUN_FOR: Duration = Duration::from_secs(4);

    let mut sources = Vec::new();
    let mut feeders = Vec::new();
    let feed = CancellationToken::new();

    for &weight in &WEIGHTS {
        let (topic, queue) = mem::channel(100);
        sources.push(ServerWeight {
            server: Arc::new(mem::Server::new(queue, CONCURRENCY)) as Arc<dyn fairway::Server>,
            weight,
        });

        // Keep the source saturated for the whole run.
        let stop = feed.clone();
        feeders.push(tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = stop.cancelled() => return,
                    res = topic.send(Message::from_bytes("hello world")) => {
                        if res.is_err() {
                            return;
                        }
                    }
                }
            }
        }));
    }

    let mserver = Arc::new(MultiServer::new(CONCURRENCY, sources).unwrap());

    let counts: Arc<[AtomicUsize; 3]> = Arc::new(std::array::from_fn(|_| AtomicUsize::new(0)));
    let c = counts.clone();
    let receiver = Arc::new(receiver_fn(move |_ctx, msg: Message| {
        let counts = c.clone();
        async move {
            // Every dispatched message carries its class index.
            let priority = msg.attributes.get(sched::PRIORITY_ATTRIBUTE);
            let p: usize = priority.parse().expect("priority attribute present");
            counts[p].fetch_add(1, Ordering::SeqCst);
            tokio::time::sleep(Duration::from_millis(1)).await;
            Ok(())
        }
    }));

    let m2 = mserver.clone();
    tokio::spawn(async move { m2.serve(receiver).await });

    tokio::time::sleep(RUN_FOR).await;
    feed.cancel();
    mserver.shutdown(CancellationToken::new()).await.unwrap_err();

    let observed: Vec<usize> = counts.iter().map(|c| c.load(Ordering::SeqCst)).collect();
    let total: usize = observed.iter().sum();
    let total_weight: f64 = WEIGHTS.iter().sum();
    assert!(total >= 300, "too few completions to judge fairness: {total}");

    let tolerance = total as f64 * 0.10;
    for (p, &count) in observed.iter().enumerate() {
        let expected = total as f64 * WEIGHTS[p] / total_weight;
        let diff = (count as f64 - expected).abs();
        assert!(
            diff <= tolerance,
            "class {p}: expected ~{expected:.0} of {total}, got {count} (tolerance {tolerance:.0})"
        );
    }

    for feeder in feeders {
        feeder.abort();
    }
}
