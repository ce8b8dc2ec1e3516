//! End-to-end router scenarios: request/response correlation, shared-object
//! events, share/forget lifecycle, and forced close.

mod common;

use std::cell::Cell;
use std::rc::Rc;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use serde_json::{json, Value};
use weft::{CloseOutcome, RouterError, SharedObject, WorkerContext};

#[test]
fn ping_pong_request_response() {
    let context = WorkerContext::new();
    let router = common::init_parent(&context);

    let (parent_end, handle) = common::spawn_child(
        |options| {
            options.on_message(|message| {
                if message["type"] == "ping" {
                    Ok(json!("pong"))
                } else {
                    Err(format!("unexpected message: {message}"))
                }
            })
        },
        |_, _| {},
        true,
    );
    router.register_worker("child", Box::new(parent_end));

    let reply = router.send_async("child", json!({ "type": "ping" })).unwrap();
    let value = router
        .wait_for(&reply, Some(Duration::from_secs(2)))
        .unwrap();
    assert_eq!(value, json!("pong"));

    assert_eq!(
        router
            .close_worker("child", Duration::from_secs(2))
            .unwrap(),
        CloseOutcome::Graceful
    );
    handle.join().unwrap();
}

#[test]
fn handler_errors_reject_the_awaiting_caller() {
    let context = WorkerContext::new();
    let router = common::init_parent(&context);

    let (parent_end, handle) = common::spawn_child(
        |options| options.on_message(|_message| Err("nope".to_string())),
        |_, _| {},
        true,
    );
    router.register_worker("child", Box::new(parent_end));

    let reply = router.send_async("child", json!({ "type": "ping" })).unwrap();
    let outcome = router.wait_for(&reply, Some(Duration::from_secs(2)));
    assert!(matches!(
        outcome,
        Err(RouterError::RequestRejected { message }) if message == "nope"
    ));

    router
        .close_worker("child", Duration::from_secs(2))
        .unwrap();
    handle.join().unwrap();
}

#[test]
fn event_round_trip_on_a_shared_object() {
    let context = WorkerContext::new();
    let router = common::init_parent(&context);

    let (parent_end, handle) = common::spawn_child(
        move |options| {
            let schema = common::demo_schema();
            options
                .shared_object_factory(move |buffer| SharedObject::adopt(&schema, buffer).ok())
                .on_object_shared(|object| {
                    object.on("ping", |object, data| {
                        object.emit("pong", json!({ "echo": data.clone() }));
                    });
                })
        },
        |_, _| {},
        true,
    );
    router.register_worker("child", Box::new(parent_end));

    let object = SharedObject::create(&common::demo_schema(), vec![]).unwrap();
    let reply = router.share_objects("child", &[object.clone()]).unwrap();
    router
        .wait_for(&reply, Some(Duration::from_secs(2)))
        .unwrap();

    let pongs: Rc<Cell<u32>> = Rc::new(Cell::new(0));
    let counter = pongs.clone();
    object.on("pong", move |_object, data| {
        assert_eq!(data["echo"], json!("marco"));
        counter.set(counter.get() + 1);
    });
    object.emit("ping", json!("marco"));

    let arrived = context.run_until(|| pongs.get() == 1, Some(Duration::from_secs(2)));
    assert!(arrived, "pong never arrived");

    // exactly once: no echo loops
    context.run_until(|| false, Some(Duration::from_millis(100)));
    assert_eq!(pongs.get(), 1);

    router
        .close_worker("child", Duration::from_secs(2))
        .unwrap();
    handle.join().unwrap();
}

#[test]
fn emits_before_share_confirmation_are_queued_not_lost() {
    let context = WorkerContext::new();
    let router = common::init_parent(&context);

    let (parent_end, handle) = common::spawn_child(
        move |options| {
            let schema = common::demo_schema();
            options
                .shared_object_factory(move |buffer| SharedObject::adopt(&schema, buffer).ok())
                .on_object_shared(|object| {
                    object.on("ping", |object, _data| object.emit("pong", Value::Null));
                })
        },
        |_, _| {},
        true,
    );
    router.register_worker("child", Box::new(parent_end));

    let object = SharedObject::create(&common::demo_schema(), vec![]).unwrap();
    let pongs: Rc<Cell<u32>> = Rc::new(Cell::new(0));
    let counter = pongs.clone();
    object.on("pong", move |_object, _data| counter.set(counter.get() + 1));

    // share and emit immediately, without waiting for confirmation
    let _reply = router.share_objects("child", &[object.clone()]).unwrap();
    object.emit("ping", Value::Null);

    let arrived = context.run_until(|| pongs.get() == 1, Some(Duration::from_secs(2)));
    assert!(arrived, "queued emit never reached the child");

    router
        .close_worker("child", Duration::from_secs(2))
        .unwrap();
    handle.join().unwrap();
}

#[test]
fn forgetting_objects_destroys_peer_copies_but_not_local_ones() {
    let context = WorkerContext::new();
    let router = common::init_parent(&context);

    let forgotten: Arc<AtomicU32> = Arc::new(AtomicU32::new(0));
    let child_forgotten = forgotten.clone();
    let child_lookup: Arc<Mutex<Vec<u64>>> = Arc::new(Mutex::new(Vec::new()));
    let lookup_sink = child_lookup.clone();
    let (parent_end, handle) = common::spawn_child(
        move |options| {
            let schema = common::demo_schema();
            options
                .shared_object_factory(move |buffer| SharedObject::adopt(&schema, buffer).ok())
                .on_before_object_forgotten(move |object| {
                    child_forgotten.fetch_add(1, Ordering::SeqCst);
                    lookup_sink.lock().unwrap().push(object.id());
                })
        },
        |_, _| {},
        true,
    );
    router.register_worker("child", Box::new(parent_end));

    let first = SharedObject::create(&common::demo_schema(), vec![]).unwrap();
    let second = SharedObject::create(&common::demo_schema(), vec![]).unwrap();
    let reply = router
        .share_objects("child", &[first.clone(), second.clone()])
        .unwrap();
    router
        .wait_for(&reply, Some(Duration::from_secs(2)))
        .unwrap();

    router.forget_objects(&[first.clone(), second.clone()], false);

    let both_forgotten = context.run_until(
        || forgotten.load(Ordering::SeqCst) == 2,
        Some(Duration::from_secs(2)),
    );
    assert!(both_forgotten);

    // no longer resolvable on the sharer's side either
    assert!(router.get_shared_object_by_id(first.id()).is_none());
    assert!(router.get_shared_object_by_id(second.id()).is_none());

    // local copies survive untouched
    assert!(!first.is_destroyed());
    assert!(!second.is_destroyed());
    assert!(first.set("num_a", 1.0).is_ok());

    let ids = child_lookup.lock().unwrap().clone();
    assert!(ids.contains(&first.id()) && ids.contains(&second.id()));

    router
        .close_worker("child", Duration::from_secs(2))
        .unwrap();
    handle.join().unwrap();
}

#[test]
fn re_sharing_an_object_is_refused() {
    let context = WorkerContext::new();
    let router = common::init_parent(&context);

    let (parent_end, handle) = common::spawn_child(
        move |options| {
            let schema = common::demo_schema();
            options.shared_object_factory(move |buffer| SharedObject::adopt(&schema, buffer).ok())
        },
        |_, _| {},
        true,
    );
    router.register_worker("child", Box::new(parent_end));

    let object = SharedObject::create(&common::demo_schema(), vec![]).unwrap();
    let reply = router.share_objects("child", &[object.clone()]).unwrap();
    router
        .wait_for(&reply, Some(Duration::from_secs(2)))
        .unwrap();

    // a duplicate share skips the object and resolves trivially
    let duplicate = router.share_objects("child", &[object.clone()]).unwrap();
    assert!(duplicate.is_settled());

    router
        .close_worker("child", Duration::from_secs(2))
        .unwrap();
    handle.join().unwrap();
}

#[test]
fn force_close_of_a_busy_worker() {
    let context = WorkerContext::new();
    let router = common::init_parent(&context);

    let (parent_end, handle) = common::spawn_child(
        |options| options,
        |_, _| {
            // simulate a worker stuck in CPU work: never reach the loop
            // until well past the close timeout
            let until = Instant::now() + Duration::from_millis(1000);
            while Instant::now() < until {
                std::hint::spin_loop();
            }
        },
        false,
    );
    router.register_worker("child", Box::new(parent_end));

    let started = Instant::now();
    let outcome = router
        .close_worker("child", Duration::from_millis(100))
        .unwrap();
    assert_eq!(outcome, CloseOutcome::Forced);
    assert!(started.elapsed() < Duration::from_millis(800));

    // the peer is gone from the registry either way
    assert!(matches!(
        router.send("child", json!(1)),
        Err(RouterError::UnknownWorker { .. })
    ));
    handle.join().unwrap();
}

#[test]
fn sends_queue_until_the_peer_is_ready() {
    let context = WorkerContext::new();
    let router = common::init_parent(&context);

    let received: Arc<Mutex<Vec<Value>>> = Arc::new(Mutex::new(Vec::new()));
    let sink = received.clone();
    let (parent_end, handle) = common::spawn_child(
        move |options| {
            options.on_message(move |message| {
                sink.lock().unwrap().push(message);
                Ok(Value::Null)
            })
        },
        |_, _| {
            // delay readiness processing so the parent's sends queue first
            thread::sleep(Duration::from_millis(50));
        },
        true,
    );
    router.register_worker("child", Box::new(parent_end));

    router.send("child", json!({ "n": 1 })).unwrap();
    router.send("child", json!({ "n": 2 })).unwrap();

    let delivered = context.run_until(
        || received.lock().unwrap().len() == 2,
        Some(Duration::from_secs(2)),
    );
    assert!(delivered);
    let messages = received.lock().unwrap().clone();
    assert_eq!(messages[0]["n"], 1);
    assert_eq!(messages[1]["n"], 2);

    router
        .close_worker("child", Duration::from_secs(2))
        .unwrap();
    handle.join().unwrap();
}
