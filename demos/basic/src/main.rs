//! Parent/child walkthrough of the runtime: a ping/pong request, a shared
//! object converging across workers, and an event round-trip.

use std::sync::Arc;
use std::time::Duration;

use serde_json::json;
use weft::{
    ChannelTransport, CloseOutcome, PropertyDef, PropertyType, PropertyValue, Router,
    RouterOptions, SharedObject, StructSchema, WorkerContext,
};

fn counter_schema() -> Arc<StructSchema> {
    StructSchema::build(
        "CNTR",
        vec![
            PropertyDef::new("count", PropertyType::Number),
            PropertyDef::new("label", PropertyType::Str),
        ],
    )
    .expect("schema builds")
}

fn main() {
    let (parent_end, child_end) = ChannelTransport::pair();

    let child = std::thread::spawn(move || {
        let context = WorkerContext::new();
        let schema = counter_schema();
        let options = RouterOptions::new(2, "child")
            .shared_object_factory(move |buffer| SharedObject::adopt(&schema, buffer).ok())
            .on_object_shared(|object| {
                object.set_on_property_change(|_object, name, new, old| {
                    println!("[child] {name}: {old:?} -> {new:?}");
                });
                object.on("ping", |object, _data| {
                    println!("[child] ping received, answering");
                    object.emit("pong", json!("hello back"));
                });
            })
            .on_message(|message| {
                println!("[child] message: {message}");
                Ok(json!("pong"))
            });
        let router = Router::init(&context, options).expect("child router");
        router.register_parent(Box::new(child_end));
        context.run();
        println!("[child] closed");
    });

    let context = WorkerContext::new();
    let router = Router::init(&context, RouterOptions::new(1, "parent")).expect("parent router");
    router.register_worker("child", Box::new(parent_end));

    // request/response
    let reply = router
        .send_async("child", json!({ "type": "ping" }))
        .expect("send");
    let answer = router
        .wait_for(&reply, Some(Duration::from_secs(2)))
        .expect("response");
    println!("[parent] child answered: {answer}");

    // shared object
    let object = SharedObject::create(
        &counter_schema(),
        vec![("label", PropertyValue::Str("demo".into()))],
    )
    .expect("object");
    let shared = router
        .share_objects("child", &[object.clone()])
        .expect("share");
    router
        .wait_for(&shared, Some(Duration::from_secs(2)))
        .expect("share confirmed");

    for count in 1..=5 {
        object.set("count", f64::from(count)).expect("set");
        context.run_until(|| false, Some(Duration::from_millis(20)));
    }

    // event round-trip
    object.on("pong", |_object, data| {
        println!("[parent] pong received: {data}");
    });
    object.emit("ping", json!("hello"));
    context.run_until(|| false, Some(Duration::from_millis(100)));

    match router
        .close_worker("child", Duration::from_secs(2))
        .expect("close")
    {
        CloseOutcome::Graceful => println!("[parent] child closed gracefully"),
        CloseOutcome::Forced => println!("[parent] child had to be terminated"),
    }
    child.join().expect("child thread");
}
