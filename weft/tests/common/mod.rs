//! Two-worker test harness: spawns a child worker thread wired to the
//! calling test through an in-process transport pair.

#![allow(dead_code)]

use std::sync::Arc;
use std::thread::JoinHandle;

use weft::{
    ChannelTransport, PropertyDef, PropertyType, Router, RouterOptions, StructSchema,
    WorkerContext,
};

pub const PARENT_WORKER_ID: u32 = 1;
pub const CHILD_WORKER_ID: u32 = 2;

/// The schema used across the scenario tests
pub fn demo_schema() -> Arc<StructSchema> {
    StructSchema::build(
        "DEMO",
        vec![
            PropertyDef::new("num_a", PropertyType::Number),
            PropertyDef::new("num_b", PropertyType::Number),
            PropertyDef::new("text_a", PropertyType::Str),
            PropertyDef::new("text_b", PropertyType::Str),
            PropertyDef::nullable("bonus", PropertyType::Number),
        ],
    )
    .expect("demo schema builds")
}

/// Initializes a parent-side router on the calling (test) thread. Clears
/// any instance left behind when tests share a thread.
pub fn init_parent(context: &WorkerContext) -> Router {
    if Router::try_instance().is_ok() {
        Router::destroy();
    }
    Router::init(context, RouterOptions::new(PARENT_WORKER_ID, "parent"))
        .expect("parent router init")
}

/// Spawns a child worker thread.
///
/// `configure` extends the child's router options (hooks close over `Send`
/// state such as `Arc<Mutex<_>>`); `body` runs after the parent channel is
/// registered; when `run_loop` is set the child then serves its event loop
/// until a `close` message arrives.
pub fn spawn_child(
    configure: impl FnOnce(RouterOptions) -> RouterOptions + Send + 'static,
    body: impl FnOnce(&WorkerContext, &Router) + Send + 'static,
    run_loop: bool,
) -> (ChannelTransport, JoinHandle<()>) {
    let (parent_end, child_end) = ChannelTransport::pair();
    let handle = std::thread::spawn(move || {
        let context = WorkerContext::new();
        let options = configure(RouterOptions::new(CHILD_WORKER_ID, "child"));
        let router = Router::init(&context, options).expect("child router init");
        router.register_parent(Box::new(child_end));
        body(&context, &router);
        if run_loop {
            context.run();
        }
    });
    (parent_end, handle)
}
