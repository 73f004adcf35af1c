//! Three message sources multiplexed into one receiver with weighted-fair
//! scheduling: completions track the 1:2:3 weight ratio, not the offered
//! load.
//!
//! Run with: `cargo run --example fair`

use std::{
    sync::{
        Arc,
        atomic::{AtomicUsize, Ordering},
    },
    time::Duration,
};

use fairway::{Message, MultiServer, Server as _, ServerWeight, backend::mem, receiver_fn, sched};
use tokio_util::sync::CancellationToken;

#[tokio::main(flavor = "multi_thread")]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_max_level(tracing::Level::INFO)
        .init();

    let weights = [1.0, 2.0, 3.0];
    let feed = CancellationToken::new();

    let mut sources = Vec::new();
    for &weight in &weights {
        let (topic, queue) = mem::channel(100);
        sources.push(ServerWeight {
            server: Arc::new(mem::Server::new(queue, 10)) as Arc<dyn fairway::Server>,
            weight,
        });

        let stop = feed.clone();
        tokio::spawn(async move {
            while !stop.is_cancelled() {
                if topic.send(Message::from_bytes("hello world")).await.is_err() {
                    return;
                }
            }
        });
    }

    let mserver = Arc::new(MultiServer::new(10, sources)?);

    let counts: Arc<[AtomicUsize; 3]> = Arc::new(std::array::from_fn(|_| AtomicUsize::new(0)));
    let c = counts.clone();
    let receiver = Arc::new(receiver_fn(move |_ctx, msg: Message| {
        let counts = c.clone();
        async move {
            let p: usize = msg
                .attributes
                .get(sched::PRIORITY_ATTRIBUTE)
                .parse()
                .expect("dispatcher stamps every message");
            counts[p].fetch_add(1, Ordering::SeqCst);
            tokio::time::sleep(Duration::from_millis(2)).await;
            Ok(())
        }
    }));

    let m2 = mserver.clone();
    tokio::spawn(async move { m2.serve(receiver).await });

    tokio::time::sleep(Duration::from_secs(5)).await;
    feed.cancel();
    mserver.shutdown(CancellationToken::new()).await.ok();

    let total: usize = counts.iter().map(|c| c.load(Ordering::SeqCst)).sum();
    println!("total completions: {total}");
    for (p, count) in counts.iter().enumerate() {
        let count = count.load(Ordering::SeqCst);
        println!(
            "class {p} (weight {}): {count} completions, {:.1}% of total",
            weights[p],
            100.0 * count as f64 / total as f64
        );
    }
    Ok(())
}
