//! Tests for name acquisition — grants, queueing, replacement, budgets.

use std::sync::Arc;

use straylight::{
    AcquireOutcome, Bus, ConnState, Connection, Effect, Error, Limits, NameFlags, Namespace,
    PolicyDb, PolicyRule, Subject, Verb,
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

#[test]
fn first_acquire_grants_ownership() {
    let (_ns, bus) = test_bus();
    let conn = active(&bus, 1000);

    let outcome = conn
        .acquire_name("org.test.Service", NameFlags::empty())
        .expect("should acquire");

    assert_eq!(outcome, AcquireOutcome::Owner);
    let info = conn.query_name("org.test.Service").expect("should query");
    assert_eq!(info.owner, conn.id());
    assert_eq!(conn.owned_names(), vec!["org.test.Service".to_owned()]);
}

#[test]
fn owner_reacquire_refreshes_flags_without_a_second_grant() {
    let (_ns, bus) = test_bus();
    let a = active(&bus, 1000);
    let b = active(&bus, 1000);

    a.acquire_name("org.test.Service", NameFlags::empty())
        .expect("should acquire");
    let outcome = a
        .acquire_name("org.test.Service", NameFlags::ALLOW_REPLACEMENT)
        .expect("reacquire should succeed");
    assert_eq!(outcome, AcquireOutcome::Owner);

    // The refreshed ALLOW_REPLACEMENT now lets another connection take over.
    let outcome = b
        .acquire_name("org.test.Service", NameFlags::REPLACE_EXISTING)
        .expect("replacement should succeed");
    assert_eq!(outcome, AcquireOutcome::Owner);
}

#[test]
fn acquire_of_taken_name_fails_name_in_use() {
    let (_ns, bus) = test_bus();
    let a = active(&bus, 1000);
    let b = active(&bus, 1000);

    a.acquire_name("org.test.Service", NameFlags::empty())
        .expect("should acquire");
    let err = b
        .acquire_name("org.test.Service", NameFlags::empty())
        .expect_err("second acquire should fail");
    assert_eq!(err, Error::NameInUse("org.test.Service".to_owned()));
}

#[test]
fn invalid_name_is_rejected_without_side_effects() {
    let (_ns, bus) = test_bus();
    let conn = active(&bus, 1000);

    let err = conn
        .acquire_name("123.bad", NameFlags::empty())
        .expect_err("leading digit should be rejected");
    assert_eq!(err, Error::InvalidName("123.bad".to_owned()));

    assert!(conn.owned_names().is_empty());
    assert!(conn.list_names().expect("should list").is_empty());
    assert_eq!(conn.try_recv().expect_err("queue should be empty"), Error::WouldBlock);
}

#[test]
fn queue_flag_parks_the_requester() {
    let (_ns, bus) = test_bus();
    let a = active(&bus, 1000);
    let b = active(&bus, 1000);

    a.acquire_name("org.test.Service", NameFlags::empty())
        .expect("should acquire");
    let outcome = b
        .acquire_name("org.test.Service", NameFlags::QUEUE)
        .expect("queued acquire should succeed");

    assert_eq!(outcome, AcquireOutcome::Queued);
    assert_eq!(b.queued_names(), vec!["org.test.Service".to_owned()]);
    assert!(b.owned_names().is_empty());
    // The owner is unchanged.
    let info = b.query_name("org.test.Service").expect("should query");
    assert_eq!(info.owner, a.id());
}

#[test]
fn replace_existing_takes_over_when_the_owner_allows() {
    let (_ns, bus) = test_bus();
    let a = active(&bus, 1000);
    let b = active(&bus, 1000);

    a.acquire_name("org.test.Service", NameFlags::ALLOW_REPLACEMENT)
        .expect("should acquire");
    let outcome = b
        .acquire_name("org.test.Service", NameFlags::REPLACE_EXISTING)
        .expect("replacement should succeed");

    assert_eq!(outcome, AcquireOutcome::Owner);
    assert!(a.owned_names().is_empty());
    assert_eq!(b.owned_names(), vec!["org.test.Service".to_owned()]);
}

#[test]
fn replace_existing_fails_against_an_unwilling_owner() {
    let (_ns, bus) = test_bus();
    let a = active(&bus, 1000);
    let b = active(&bus, 1000);

    a.acquire_name("org.test.Service", NameFlags::empty())
        .expect("should acquire");
    let err = b
        .acquire_name("org.test.Service", NameFlags::REPLACE_EXISTING)
        .expect_err("replacement should fail");
    assert_eq!(err, Error::NameInUse("org.test.Service".to_owned()));
    assert_eq!(a.owned_names(), vec!["org.test.Service".to_owned()]);
}

#[test]
fn starter_placeholder_is_always_replaceable() {
    let (_ns, bus) = test_bus();
    let starter = bus
        .default_endpoint()
        .connect(1000)
        .expect("should attach");
    starter
        .register_starter("org.test.Service")
        .expect("should register starter");

    let service = active(&bus, 1000);
    let outcome = service
        .acquire_name("org.test.Service", NameFlags::REPLACE_EXISTING)
        .expect("service should displace the starter");
    assert_eq!(outcome, AcquireOutcome::Owner);
}

#[test]
fn own_is_denied_without_a_matching_rule() {
    let (_ns, bus) = test_bus();
    let conn = active(&bus, 1000);

    let err = conn
        .acquire_name("com.other.Service", NameFlags::empty())
        .expect_err("own outside the allowed prefix should fail");
    assert!(matches!(err, Error::PermissionDenied { verb: "own", .. }));
}

#[test]
fn a_failed_starter_registration_leaves_the_connection_unconnected() {
    let (_ns, bus) = test_bus_with(Limits {
        max_queue_len: 1024,
        max_names_per_connection: 0,
    });
    let conn = bus.default_endpoint().connect(1000).expect("should attach");

    let err = conn
        .register_starter("org.test.Service")
        .expect_err("a zero name budget rejects the registration");
    assert!(matches!(err, Error::OutOfResources(_)));

    assert_eq!(conn.state(), ConnState::Unconnected);
    conn.hello()
        .expect("the connection can still activate normally");
}

#[test]
fn per_connection_name_budget_is_enforced() {
    let (_ns, bus) = test_bus_with(Limits {
        max_queue_len: 1024,
        max_names_per_connection: 2,
    });
    let conn = active(&bus, 1000);

    conn.acquire_name("org.test.A", NameFlags::empty())
        .expect("first name should fit");
    conn.acquire_name("org.test.B", NameFlags::empty())
        .expect("second name should fit");
    let err = conn
        .acquire_name("org.test.C", NameFlags::empty())
        .expect_err("third name should exceed the budget");
    assert!(matches!(err, Error::OutOfResources(_)));
}
