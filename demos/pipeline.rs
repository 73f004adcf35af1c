//! Publish through a compress-then-encode topic chain and consume through
//! the mirrored decode-then-decompress receiver chain.
//!
//! Run with: `cargo run --example pipeline`

use std::sync::Arc;

use fairway::{
    MessageWriter as _, Server as _, Topic as _,
    backend::mem,
    decorate::{base64, lz4},
    dump_body, receiver_fn,
};
use tokio_util::sync::CancellationToken;

#[tokio::main(flavor = "multi_thread")]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_max_level(tracing::Level::DEBUG)
        .init();

    let (topic, queue) = mem::channel(64);
    let server = Arc::new(mem::Server::new(queue, 4));

    // The outermost writer's transform runs first on close, so this stack
    // puts base64(lz4(payload)) on the wire; the receive stack below strips
    // base64 first, then decompresses.
    let publisher = lz4::compressor(base64::encoder(topic));

    for i in 0..8 {
        let mut w = publisher.new_writer(CancellationToken::new()).await;
        w.write(format!("message #{i}: the quick brown fox jumps over the lazy dog").as_bytes())
            .await?;
        w.close().await?;
    }

    let receiver = Arc::new(base64::decoder(lz4::decoder(receiver_fn(
        |_ctx, mut msg| async move {
            let body = dump_body(&mut msg)?;
            println!("received: {}", String::from_utf8_lossy(&body));
            Ok(())
        },
    ))));

    let worker = {
        let server = server.clone();
        tokio::spawn(async move { server.serve(receiver).await })
    };

    tokio::time::sleep(std::time::Duration::from_millis(500)).await;
    server.shutdown(CancellationToken::new()).await.ok();
    worker.await?.ok();
    Ok(())
}
