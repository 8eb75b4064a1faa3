//! Tests for disconnect — name hand-over, queue cleanup, waker behavior.

use std::sync::Arc;

use straylight::{
    Bus, ConnState, Connection, Effect, Error, IdEvent, Limits, NameFlags, Namespace,
    Notification, PolicyDb, PolicyRule, Subject, Verb,
};

fn test_bus() -> (Arc<Namespace>, Arc<Bus>) {
    let ns = Namespace::root();
    let bus = ns
        .create_bus("test", Limits::default())
        .expect("should create bus");
    bus.default_endpoint().set_policy(Some(PolicyDb::new(vec![PolicyRule {
        subject: Subject::Name("org.test.*".to_owned()),
        verb: Verb::Own,
        effect: Effect::Allow,
    }])));
    (ns, bus)
}

fn active(bus: &Arc<Bus>, uid: u32) -> Arc<Connection> {
    let conn = bus.default_endpoint().connect(uid).expect("should attach");
    conn.hello().expect("should activate");
    conn
}

fn drain_notifications(conn: &Connection) -> Vec<Notification> {
    let mut out = Vec::new();
    while let Ok(env) = conn.try_recv() {
        if let Some(n) = env.notification() {
            out.push(n.clone());
        }
    }
    out
}

#[test]
fn disconnect_releases_names_and_promotes_the_waiter() {
    let (_ns, bus) = test_bus();
    let a = active(&bus, 1000);
    let b = active(&bus, 1000);

    a.acquire_name("org.test.Service", NameFlags::empty())
        .expect("a should own");
    b.acquire_name("org.test.Service", NameFlags::QUEUE)
        .expect("b should queue");

    a.disconnect();

    assert_eq!(a.state(), ConnState::Disconnected);
    let info = b.query_name("org.test.Service").expect("should query");
    assert_eq!(info.owner, b.id());
    assert_eq!(b.owned_names(), vec!["org.test.Service".to_owned()]);
}

#[test]
fn disconnect_of_a_sole_owner_notifies_watchers() {
    let (_ns, bus) = test_bus();
    let a = active(&bus, 1000);
    let w = active(&bus, 1000);
    w.watch_name("org.test.Service").expect("should watch");

    a.acquire_name("org.test.Service", NameFlags::empty())
        .expect("a should own");
    let _ = drain_notifications(&w);

    a.disconnect();

    let notes = drain_notifications(&w);
    assert_eq!(
        notes,
        vec![Notification::NameOwnerChanged {
            name: "org.test.Service".to_owned(),
            old_owner: Some(a.id()),
            new_owner: None,
        }]
    );
}

#[test]
fn disconnected_waiter_is_skipped_on_hand_over() {
    let (_ns, bus) = test_bus();
    let a = active(&bus, 1000);
    let b = active(&bus, 1000);
    let c = active(&bus, 1000);

    a.acquire_name("org.test.Service", NameFlags::empty())
        .expect("a should own");
    b.acquire_name("org.test.Service", NameFlags::QUEUE)
        .expect("b should queue");
    c.acquire_name("org.test.Service", NameFlags::QUEUE)
        .expect("c should queue");

    b.disconnect();
    a.release_name("org.test.Service").expect("a should release");

    let info = c.query_name("org.test.Service").expect("should query");
    assert_eq!(info.owner, c.id(), "hand-over skips the departed waiter");
}

#[test]
fn disconnect_restores_the_connection_count() {
    let (_ns, bus) = test_bus();
    let a = active(&bus, 1000);
    let _b = active(&bus, 1000);
    assert_eq!(bus.connection_count(), 2);

    a.disconnect();
    assert_eq!(bus.connection_count(), 1);
    assert!(bus.connection(a.id()).is_none());
}

#[test]
fn disconnect_is_idempotent() {
    let (_ns, bus) = test_bus();
    let a = active(&bus, 1000);
    let w = active(&bus, 1000);
    w.watch_id_changes(true);

    a.disconnect();
    a.disconnect();

    assert_eq!(bus.connection_count(), 1);
    let notes = drain_notifications(&w);
    assert_eq!(
        notes,
        vec![Notification::IdChanged {
            id: a.id(),
            event: IdEvent::Removed,
        }],
        "a repeated disconnect must not re-announce the departure"
    );
}

#[test]
fn id_watcher_sees_arrivals_and_departures() {
    let (_ns, bus) = test_bus();
    let w = active(&bus, 1000);
    w.watch_id_changes(true);

    let x = active(&bus, 1000);
    x.disconnect();

    let notes = drain_notifications(&w);
    assert_eq!(
        notes,
        vec![
            Notification::IdChanged {
                id: x.id(),
                event: IdEvent::Added,
            },
            Notification::IdChanged {
                id: x.id(),
                event: IdEvent::Removed,
            },
        ]
    );
}

#[tokio::test]
async fn disconnect_wakes_a_blocked_receiver() {
    let (_ns, bus) = test_bus();
    let a = active(&bus, 1000);

    let receiver = Arc::clone(&a);
    let handle = tokio::spawn(async move { receiver.recv().await });
    tokio::task::yield_now().await;

    a.disconnect();

    let result = handle.await.expect("task should not panic");
    assert_eq!(
        result.expect_err("recv should fail after disconnect"),
        Error::ConnectionGone(a.id())
    );
}
