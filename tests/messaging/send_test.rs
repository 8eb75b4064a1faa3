//! Tests for message sending — resolution, ordering, policy, capacity.

use std::sync::Arc;

use straylight::{
    Body, Bus, Connection, Destination, Effect, Error, Limits, MessageFlags, MessageSpec,
    NameFlags, Namespace, PolicyDb, PolicyRule, Subject, Verb,
};

fn test_bus() -> (Arc<Namespace>, Arc<Bus>) {
    test_bus_with(Limits::default())
}

fn test_bus_with(limits: Limits) -> (Arc<Namespace>, Arc<Bus>) {
    let ns = Namespace::root();
    let bus = ns.create_bus("test", limits).expect("should create bus");
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

fn drain(conn: &Connection) {
    while conn.try_recv().is_ok() {}
}

#[test]
fn send_by_id_delivers_in_order() {
    let (_ns, bus) = test_bus();
    let a = active(&bus, 1000);
    let b = active(&bus, 1000);

    for cookie in 1..=3 {
        a.send(MessageSpec::to(Destination::Id(b.id()), vec![]).cookie(cookie))
            .expect("send should succeed");
    }

    for expected in 1..=3 {
        let env = b.try_recv().expect("queue should hold the message");
        assert_eq!(env.cookie, expected, "delivery preserves send order");
        assert_eq!(env.src_id, a.id());
    }
}

#[test]
fn send_to_an_unowned_name_fails_not_found() {
    let (_ns, bus) = test_bus();
    let a = active(&bus, 1000);

    let err = a
        .send(MessageSpec::to(
            Destination::Name("org.test.Nobody".to_owned()),
            vec![],
        ))
        .expect_err("unowned name should not resolve");
    assert!(matches!(err, Error::NotFound { kind: "name", .. }));
}

#[test]
fn send_by_name_reaches_the_current_owner() {
    let (_ns, bus) = test_bus();
    let a = active(&bus, 1000);
    let b = active(&bus, 1000);

    b.acquire_name("org.test.Service", NameFlags::empty())
        .expect("b should own");
    drain(&b);

    a.send(
        MessageSpec::to(
            Destination::Name("org.test.Service".to_owned()),
            b"ping".to_vec(),
        )
        .cookie(7),
    )
    .expect("send should succeed");

    let env = b.try_recv().expect("owner should receive the message");
    assert_eq!(env.cookie, 7);
    assert_eq!(env.body, Body::User(b"ping".to_vec()));
}

#[test]
fn broadcast_reaches_every_active_connection_except_the_sender() {
    let (_ns, bus) = test_bus();
    let a = active(&bus, 1000);
    let b = active(&bus, 1000);
    let c = active(&bus, 1000);
    let idle = bus.default_endpoint().connect(1000).expect("should attach");

    a.send(MessageSpec::to(Destination::Broadcast, b"all".to_vec()).cookie(9))
        .expect("broadcast should succeed");

    for conn in [&b, &c] {
        let env = conn.try_recv().expect("active peer should receive");
        assert_eq!(env.cookie, 9);
        assert_eq!(env.destination, Destination::Broadcast);
    }
    assert_eq!(a.queue_len(), 0, "sender is excluded");
    assert_eq!(idle.queue_len(), 0, "unactivated connections are excluded");
}

#[test]
fn cross_uid_send_is_denied_by_default() {
    let (_ns, bus) = test_bus();
    let a = active(&bus, 1000);
    let b = active(&bus, 2000);

    let err = a
        .send(MessageSpec::to(Destination::Id(b.id()), vec![]))
        .expect_err("uid boundary should block the send");
    assert!(matches!(err, Error::PermissionDenied { verb: "send", .. }));
    assert_eq!(b.queue_len(), 0);
}

#[test]
fn an_allow_rule_opens_a_cross_uid_send() {
    let (_ns, bus) = test_bus();
    bus.default_endpoint().set_policy(Some(PolicyDb::new(vec![PolicyRule {
        subject: Subject::Uid(1000),
        verb: Verb::Send,
        effect: Effect::Allow,
    }])));
    let a = active(&bus, 1000);
    let b = active(&bus, 2000);

    a.send(MessageSpec::to(Destination::Id(b.id()), vec![]))
        .expect("rule should allow the send");
    assert_eq!(b.queue_len(), 1);
}

#[test]
fn a_full_queue_rejects_the_send() {
    let (_ns, bus) = test_bus_with(Limits {
        max_queue_len: 2,
        max_names_per_connection: 256,
    });
    let a = active(&bus, 1000);
    let b = active(&bus, 1000);

    a.send(MessageSpec::to(Destination::Id(b.id()), vec![]))
        .expect("first send should fit");
    a.send(MessageSpec::to(Destination::Id(b.id()), vec![]))
        .expect("second send should fit");
    let err = a
        .send(MessageSpec::to(Destination::Id(b.id()), vec![]))
        .expect_err("third send should overflow");
    assert!(matches!(err, Error::OutOfResources(_)));
    assert_eq!(b.queue_len(), 2);
}

#[test]
fn no_auto_start_refuses_a_starter_owned_name() {
    let (_ns, bus) = test_bus();
    let starter = bus.default_endpoint().connect(1000).expect("should attach");
    starter
        .register_starter("org.test.Service")
        .expect("should register starter");
    let a = active(&bus, 1000);

    let mut spec = MessageSpec::to(
        Destination::Name("org.test.Service".to_owned()),
        b"wake".to_vec(),
    );
    spec.flags = MessageFlags::NO_AUTO_START;
    let err = a.send(spec).expect_err("starter owner should not count");
    assert!(matches!(err, Error::NotFound { kind: "name", .. }));

    // Without the flag the message parks in the starter's queue for the
    // service that will replace it.
    a.send(MessageSpec::to(
        Destination::Name("org.test.Service".to_owned()),
        b"wake".to_vec(),
    ))
    .expect("send without the flag should queue at the starter");
    assert_eq!(starter.queue_len(), 1);
}

#[test]
fn a_replacing_service_inherits_messages_parked_at_the_starter() {
    let (_ns, bus) = test_bus();
    let starter = bus.default_endpoint().connect(1000).expect("should attach");
    starter
        .register_starter("org.test.Service")
        .expect("should register starter");
    let a = active(&bus, 1000);

    a.send(
        MessageSpec::to(
            Destination::Name("org.test.Service".to_owned()),
            b"early".to_vec(),
        )
        .cookie(13),
    )
    .expect("send should park at the starter");
    assert_eq!(starter.queue_len(), 1);

    let service = active(&bus, 1000);
    service
        .acquire_name("org.test.Service", NameFlags::REPLACE_EXISTING)
        .expect("service should displace the starter");

    assert_eq!(starter.queue_len(), 0, "the starter hands its queue over");
    let env = service
        .try_recv()
        .expect("the parked message reaches the new owner");
    assert_eq!(env.cookie, 13);
    assert_eq!(env.body, Body::User(b"early".to_vec()));
    assert_eq!(env.src_id, a.id());
}

#[test]
fn send_requires_an_activated_connection() {
    let (_ns, bus) = test_bus();
    let a = bus.default_endpoint().connect(1000).expect("should attach");
    let b = active(&bus, 1000);

    let err = a
        .send(MessageSpec::to(Destination::Id(b.id()), vec![]))
        .expect_err("send before hello should fail");
    assert_eq!(err, Error::ConnectionGone(a.id()));
}

#[test]
fn send_to_a_departed_connection_fails_not_found() {
    let (_ns, bus) = test_bus();
    let a = active(&bus, 1000);
    let b = active(&bus, 1000);
    let gone = b.id();
    b.disconnect();

    let err = a
        .send(MessageSpec::to(Destination::Id(gone), vec![]))
        .expect_err("departed id should not resolve");
    assert!(matches!(err, Error::NotFound { kind: "connection", .. }));
}
