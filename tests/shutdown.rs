//! Graceful and immediate shutdown with exchanges in flight.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use airway::{handler_fn, Engine, PathRouter};
use tokio::sync::Notify;

mod common;

fn slow_route(delay: Duration, started: Arc<Notify>, released: Arc<AtomicBool>) -> PathRouter {
    let mut router = PathRouter::new();
    router
        .get(
            "/slow",
            handler_fn(move |_req, res| {
                let started = started.clone();
                let released = released.clone();
                Box::pin(async move {
                    res.defer(move || released.store(true, Ordering::SeqCst));
                    started.notify_one();
                    tokio::time::sleep(delay).await;
                    res.write_string("done");
                    Ok(())
                })
            }),
        )
        .unwrap();
    router
}

#[tokio::test]
async fn graceful_shutdown_lets_in_flight_exchange_finish() {
    let started = Arc::new(Notify::new());
    let released = Arc::new(AtomicBool::new(false));
    let router = slow_route(Duration::from_millis(300), started.clone(), released.clone());

    let engine = Engine::builder(common::test_config()).router(router).build();
    let (server, addr) = common::start(engine).await;

    let request = tokio::spawn(async move {
        let res = common::client()
            .get(format!("http://{}/slow", addr))
            .send()
            .await?;
        let status = res.status();
        res.text().await.map(|body| (status, body))
    });

    started.notified().await;
    server.shutdown(Duration::from_secs(10)).await;
    assert!(released.load(Ordering::SeqCst), "exchange released before shutdown returned");

    let (status, body) = request.await.unwrap().unwrap();
    assert_eq!(status, 200);
    assert_eq!(body, "done");

    // No longer accepting.
    assert!(common::client()
        .get(format!("http://{}/slow", addr))
        .send()
        .await
        .is_err());
}

#[tokio::test]
async fn near_zero_deadline_force_closes() {
    let started = Arc::new(Notify::new());
    let released = Arc::new(AtomicBool::new(false));
    let router = slow_route(Duration::from_secs(30), started.clone(), released.clone());

    let engine = Engine::builder(common::test_config()).router(router).build();
    let (server, addr) = common::start(engine).await;

    let request = tokio::spawn(async move {
        common::client()
            .get(format!("http://{}/slow", addr))
            .send()
            .await
    });

    started.notified().await;
    let begun = Instant::now();
    server.shutdown(Duration::from_millis(10)).await;
    assert!(begun.elapsed() < Duration::from_secs(5));

    assert!(request.await.unwrap().is_err());
}

#[tokio::test]
async fn close_and_shutdown_are_idempotent() {
    let mut router = PathRouter::new();
    router.get("/", common::text("ok")).unwrap();
    let engine = Engine::builder(common::test_config()).router(router).build();
    let (server, _addr) = common::start(engine).await;

    server.close();
    server.close();
    server.shutdown(Duration::from_millis(50)).await;
    server.shutdown(Duration::from_millis(50)).await;
}
