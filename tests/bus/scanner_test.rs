//! Tests for the background deadline scanner.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;

use straylight::{
    run_timeout_scanner, Bus, Connection, Destination, Limits, MessageSpec, Namespace,
    Notification,
};

fn test_bus() -> (Arc<Namespace>, Arc<Bus>) {
    let ns = Namespace::root();
    let bus = ns
        .create_bus("test", Limits::default())
        .expect("should create bus");
    (ns, bus)
}

fn active(bus: &Arc<Bus>, uid: u32) -> Arc<Connection> {
    let conn = bus.default_endpoint().connect(uid).expect("should attach");
    conn.hello().expect("should activate");
    conn
}

#[tokio::test(start_paused = true)]
async fn scanner_expires_overdue_replies_and_honors_shutdown() {
    let (_ns, bus) = test_bus();
    let a = active(&bus, 1000);
    let b = active(&bus, 1000);

    let deadline = chrono::Utc::now() - chrono::Duration::seconds(1);
    let id = a
        .send(
            MessageSpec::to(Destination::Id(b.id()), b"req".to_vec())
                .cookie(5)
                .expect_reply(deadline),
        )
        .expect("request should send");

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let handle = tokio::spawn(run_timeout_scanner(
        Arc::clone(&bus),
        Duration::from_secs(1),
        shutdown_rx,
    ));

    // The first tick fires as soon as the scanner task runs.
    tokio::time::advance(Duration::from_millis(1100)).await;
    tokio::task::yield_now().await;

    assert_eq!(a.pending_reply_count(), 0, "the scanner expired the entry");
    let env = a.try_recv().expect("the timeout notification is queued");
    assert_eq!(
        env.notification(),
        Some(&Notification::ReplyTimeout {
            message_id: id,
            cookie: 5,
        })
    );

    shutdown_tx.send(true).expect("receiver is alive");
    handle.await.expect("scanner should stop cleanly");
}
