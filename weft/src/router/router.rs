//! The per-worker coordinator.
//!
//! Exactly one router exists per worker, stored in a worker-global slot. It
//! owns the peer registry and ready handshake, frames and correlates
//! messages, and tracks the shared objects this worker has handed to (or
//! received from) each peer.

use std::cell::RefCell;
use std::collections::HashMap;
use std::rc::Rc;
use std::time::Duration;

use log::{info, warn};
use serde_json::Value;

use crate::backends::SharedBuffer;
use crate::buffer::BufferStruct;
use crate::object::SharedObject;
use crate::transport::Transport;
use crate::worker::WorkerContext;

use super::error::RouterError;
use super::message::{ControlMessage, Envelope, MessageBody};
use super::peer::PeerRecord;
use super::reply::{AsyncReply, ReplyState};

/// The peer name a spawned worker registers its parent channel under
pub const PARENT_WORKER_NAME: &str = "parent";

/// Worker ids partition the unique-id space in spans of this size
const UNIQUE_ID_SPAN: u64 = 10_000_000_000_000;

/// Largest worker id that keeps `worker_id * span + counter` inside f64's
/// exactly-representable integer range
const MAX_WORKER_ID: u32 = 899;

/// Default patience of `close_worker`
pub const DEFAULT_CLOSE_TIMEOUT: Duration = Duration::from_secs(5);

/// How `close_worker` ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseOutcome {
    /// The peer acknowledged the close request in time
    Graceful,
    /// The peer stayed silent; its transport was terminated
    Forced,
}

type SharedObjectFactory = dyn Fn(SharedBuffer) -> Option<SharedObject>;
type ObjectHook = dyn FnMut(&SharedObject);
type MessageHandler = dyn FnMut(Value) -> Result<Value, String>;
type SettleFn = Box<dyn FnOnce(&Router, bool)>;

/// Configuration for `Router::init`
pub struct RouterOptions {
    worker_id: u32,
    worker_name: String,
    shared_object_factory: Option<Box<SharedObjectFactory>>,
    on_object_shared: Option<Box<ObjectHook>>,
    on_before_object_forgotten: Option<Box<ObjectHook>>,
    on_message: Option<Box<MessageHandler>>,
}

impl RouterOptions {
    pub fn new(worker_id: u32, worker_name: &str) -> Self {
        Self {
            worker_id,
            worker_name: worker_name.to_string(),
            shared_object_factory: None,
            on_object_shared: None,
            on_before_object_forgotten: None,
            on_message: None,
        }
    }

    /// Builds the worker-local instance for a buffer arriving in
    /// `shareObjects`; returning `None` fails the share
    pub fn shared_object_factory(
        mut self,
        factory: impl Fn(SharedBuffer) -> Option<SharedObject> + 'static,
    ) -> Self {
        self.shared_object_factory = Some(Box::new(factory));
        self
    }

    /// Invoked after an incoming shared object has been registered
    pub fn on_object_shared(mut self, hook: impl FnMut(&SharedObject) + 'static) -> Self {
        self.on_object_shared = Some(Box::new(hook));
        self
    }

    /// Invoked before a peer-forgotten object is removed and destroyed
    pub fn on_before_object_forgotten(mut self, hook: impl FnMut(&SharedObject) + 'static) -> Self {
        self.on_before_object_forgotten = Some(Box::new(hook));
        self
    }

    /// Handles every inbound message that is not a control message; the
    /// return value answers correlated requests
    pub fn on_message(
        mut self,
        handler: impl FnMut(Value) -> Result<Value, String> + 'static,
    ) -> Self {
        self.on_message = Some(Box::new(handler));
        self
    }
}

struct ObjectRecord {
    peer: String,
    share_confirmed: bool,
    emit_queue: Option<Vec<(String, Value)>>,
}

struct PendingRequest {
    reply: AsyncReply,
    on_settle: Option<SettleFn>,
}

struct RouterInner {
    worker_id: u32,
    worker_name: String,
    peers: HashMap<String, PeerRecord>,
    shared_objects: HashMap<u64, SharedObject>,
    object_records: HashMap<u64, ObjectRecord>,
    pending: HashMap<u64, PendingRequest>,
    next_async_msg_id: u64,
    next_unique_id: u64,
    /// Set while an inbound remote emit is being delivered; identifies the
    /// exact (object, event) whose outbound echo must be swallowed
    suppress_shared_object_emit: Option<(u64, String)>,
    factory: Option<Box<SharedObjectFactory>>,
    on_object_shared: Option<Box<ObjectHook>>,
    on_before_object_forgotten: Option<Box<ObjectHook>>,
    on_message: Option<Box<MessageHandler>>,
}

thread_local! {
    static INSTANCE: RefCell<Option<Router>> = const { RefCell::new(None) };
}

/// Handle to this worker's router. Clones refer to the same instance.
#[derive(Clone)]
pub struct Router {
    inner: Rc<RefCell<RouterInner>>,
    context: WorkerContext,
}

impl Router {
    /// Creates and installs this worker's router
    pub fn init(context: &WorkerContext, options: RouterOptions) -> Result<Router, RouterError> {
        if !(1..=MAX_WORKER_ID).contains(&options.worker_id) {
            return Err(RouterError::InvalidWorkerId {
                got: options.worker_id,
            });
        }
        let occupied = INSTANCE.with(|slot| slot.borrow().is_some());
        if occupied {
            return Err(RouterError::AlreadyInitialized);
        }

        let router = Router {
            inner: Rc::new(RefCell::new(RouterInner {
                worker_id: options.worker_id,
                worker_name: options.worker_name.clone(),
                peers: HashMap::new(),
                shared_objects: HashMap::new(),
                object_records: HashMap::new(),
                pending: HashMap::new(),
                next_async_msg_id: 1,
                next_unique_id: u64::from(options.worker_id) * UNIQUE_ID_SPAN + 1,
                suppress_shared_object_emit: None,
                factory: options.shared_object_factory,
                on_object_shared: options.on_object_shared,
                on_before_object_forgotten: options.on_before_object_forgotten,
                on_message: options.on_message,
            })),
            context: context.clone(),
        };
        let dispatcher = router.clone();
        context.set_frame_handler(move |peer, envelope| dispatcher.handle_frame(&peer, envelope));
        INSTANCE.with(|slot| *slot.borrow_mut() = Some(router.clone()));
        info!(
            "worker router '{}' (id {}) initialized",
            options.worker_name, options.worker_id
        );
        Ok(router)
    }

    /// Tears down this worker's router; a no-op (with a warning) when none
    /// is installed
    pub fn destroy() {
        let taken = INSTANCE.with(|slot| slot.borrow_mut().take());
        match taken {
            Some(router) => {
                router.context.clear_frame_handler();
                let mut inner = router.inner.borrow_mut();
                inner.peers.clear();
                inner.shared_objects.clear();
                inner.object_records.clear();
                inner.pending.clear();
                info!("worker router '{}' destroyed", inner.worker_name);
            }
            None => warn!("worker router destroy: no instance on this worker"),
        }
    }

    /// This worker's router.
    ///
    /// # Panics
    ///
    /// Panics when no router is installed; use `try_instance` to handle
    /// that case.
    pub fn instance() -> Router {
        Self::try_instance().expect("worker router is not initialized on this worker")
    }

    pub fn try_instance() -> Result<Router, RouterError> {
        INSTANCE.with(|slot| slot.borrow().clone().ok_or(RouterError::NotInitialized))
    }

    pub fn worker_id(&self) -> u32 {
        self.inner.borrow().worker_id
    }

    pub fn worker_name(&self) -> String {
        self.inner.borrow().worker_name.clone()
    }

    pub fn context(&self) -> &WorkerContext {
        &self.context
    }

    /// Mints an id no other worker can mint, from this worker's span
    pub fn generate_unique_id(&self) -> u64 {
        let mut inner = self.inner.borrow_mut();
        let id = inner.next_unique_id;
        inner.next_unique_id += 1;
        id
    }

    // Peer registry

    /// Registers a peer worker and starts listening on its transport. The
    /// peer becomes sendable once its `ready` message arrives.
    pub fn register_worker(&self, name: &str, transport: Box<dyn Transport>) {
        transport.start_listening(name, self.context.task_sender());
        let mut inner = self.inner.borrow_mut();
        if inner
            .peers
            .insert(name.to_string(), PeerRecord::new(transport, false))
            .is_some()
        {
            warn!("replacing previously registered worker '{name}'");
        }
        info!("registered worker '{name}'");
    }

    /// Registers the parent channel of a spawned worker: ready immediately,
    /// and announces this worker's readiness over it
    pub fn register_parent(&self, transport: Box<dyn Transport>) {
        transport.start_listening(PARENT_WORKER_NAME, self.context.task_sender());
        if let Err(err) = transport.post(Envelope::control(ControlMessage::Ready)) {
            warn!("could not announce readiness to parent: {err}");
        }
        self.inner.borrow_mut().peers.insert(
            PARENT_WORKER_NAME.to_string(),
            PeerRecord::new(transport, true),
        );
        info!("registered parent channel");
    }

    pub fn is_worker_ready(&self, name: &str) -> bool {
        self.inner
            .borrow()
            .peers
            .get(name)
            .map(|peer| peer.ready)
            .unwrap_or(false)
    }

    // Sending

    /// Fire-and-forget send; queued until the peer is ready
    pub fn send(&self, name: &str, message: Value) -> Result<(), RouterError> {
        self.post_or_queue(name, Envelope::user(message))
    }

    /// Correlated send; the reply settles when the peer's response arrives
    pub fn send_async(&self, name: &str, message: Value) -> Result<AsyncReply, RouterError> {
        self.send_request(name, Envelope::user(message), None)
    }

    /// Correlated send without a registered reply: the peer still receives
    /// an async message id and produces a response, which is dropped here
    pub fn send_async_untracked(&self, name: &str, message: Value) -> Result<u64, RouterError> {
        let id = self.next_async_msg_id();
        self.post_or_queue(name, Envelope::user(message).with_async_id(id))?;
        Ok(id)
    }

    /// Pumps this worker's loop until the reply settles or the timeout
    /// elapses
    pub fn wait_for(
        &self,
        reply: &AsyncReply,
        timeout: Option<Duration>,
    ) -> Result<Value, RouterError> {
        let settled = self.context.run_until(|| reply.is_settled(), timeout);
        if !settled {
            return Err(RouterError::ReplyTimedOut);
        }
        match reply.state() {
            ReplyState::Resolved(value) => Ok(value),
            ReplyState::Rejected(message) => Err(RouterError::RequestRejected { message }),
            ReplyState::Pending => unreachable!("reply settled"),
        }
    }

    fn next_async_msg_id(&self) -> u64 {
        let mut inner = self.inner.borrow_mut();
        let id = inner.next_async_msg_id;
        inner.next_async_msg_id += 1;
        id
    }

    fn send_request(
        &self,
        name: &str,
        envelope: Envelope,
        on_settle: Option<SettleFn>,
    ) -> Result<AsyncReply, RouterError> {
        let id = self.next_async_msg_id();
        let reply = AsyncReply::pending();
        self.inner.borrow_mut().pending.insert(
            id,
            PendingRequest {
                reply: reply.clone(),
                on_settle,
            },
        );
        if let Err(err) = self.post_or_queue(name, envelope.with_async_id(id)) {
            self.inner.borrow_mut().pending.remove(&id);
            return Err(err);
        }
        Ok(reply)
    }

    fn post_or_queue(&self, name: &str, envelope: Envelope) -> Result<(), RouterError> {
        let mut inner = self.inner.borrow_mut();
        let Some(peer) = inner.peers.get_mut(name) else {
            return Err(RouterError::UnknownWorker {
                name: name.to_string(),
            });
        };
        if peer.ready {
            if let Err(err) = peer.transport.post(envelope) {
                warn!("post to '{name}' failed: {err}");
            }
        } else {
            peer.outbox.push(envelope);
        }
        Ok(())
    }

    // Shared-object lifecycle

    /// Hands objects to a peer. Objects already tracked for a peer are
    /// skipped with a warning; the reply settles when the peer confirms, at
    /// which point queued emits drain.
    pub fn share_objects(
        &self,
        peer_name: &str,
        objects: &[SharedObject],
    ) -> Result<AsyncReply, RouterError> {
        if !self.inner.borrow().peers.contains_key(peer_name) {
            return Err(RouterError::UnknownWorker {
                name: peer_name.to_string(),
            });
        }

        let mut buffers = Vec::new();
        let mut ids = Vec::new();
        for object in objects {
            if self
                .inner
                .borrow()
                .object_records
                .contains_key(&object.id())
            {
                warn!("object {} is already shared; skipping re-share", object.id());
                continue;
            }
            let buffer = object
                .extract_buffer()
                .map_err(|source| RouterError::ShareFailed {
                    id: object.id(),
                    source,
                })?;
            let mut inner = self.inner.borrow_mut();
            inner.shared_objects.insert(object.id(), object.clone());
            inner.object_records.insert(
                object.id(),
                ObjectRecord {
                    peer: peer_name.to_string(),
                    share_confirmed: false,
                    emit_queue: None,
                },
            );
            drop(inner);
            ids.push(object.id());
            buffers.push(buffer);
        }

        if buffers.is_empty() {
            return Ok(AsyncReply::resolved(Value::Null));
        }
        let peer = peer_name.to_string();
        self.send_request(
            peer_name,
            Envelope::control(ControlMessage::ShareObjects { buffers }),
            Some(Box::new(move |router, ok| {
                if ok {
                    router.confirm_shared(&ids);
                } else {
                    warn!("peer '{peer}' rejected shareObjects for {ids:?}");
                }
            })),
        )
    }

    fn confirm_shared(&self, ids: &[u64]) {
        for id in ids {
            let queued = {
                let mut inner = self.inner.borrow_mut();
                let Some(record) = inner.object_records.get_mut(id) else {
                    continue; // forgotten while the share was in flight
                };
                record.share_confirmed = true;
                record.emit_queue.take()
            };
            let Some(queued) = queued else { continue };
            let object = self.inner.borrow().shared_objects.get(id).cloned();
            if let Some(object) = object {
                for (event, data) in queued {
                    self.shared_object_emit(&object, &event, &data);
                }
            }
        }
    }

    /// Stops tracking objects and tells their peers to drop (and destroy)
    /// their copies. Local instances stay intact.
    pub fn forget_objects(&self, objects: &[SharedObject], silent: bool) {
        let mut by_peer: HashMap<String, Vec<u64>> = HashMap::new();
        for object in objects {
            let record = self.inner.borrow_mut().object_records.remove(&object.id());
            match record {
                Some(record) => {
                    self.inner.borrow_mut().shared_objects.remove(&object.id());
                    by_peer.entry(record.peer).or_default().push(object.id());
                }
                None => {
                    if !silent {
                        warn!("forget_objects: object {} is not shared", object.id());
                    }
                }
            }
        }
        for (peer, object_ids) in by_peer {
            let envelope = Envelope::control(ControlMessage::ForgetObjects { object_ids });
            if let Err(err) = self.post_or_queue(&peer, envelope) {
                warn!("forget_objects toward '{peer}': {err}");
            }
        }
    }

    pub fn get_shared_object_by_id(&self, id: u64) -> Option<SharedObject> {
        self.inner.borrow().shared_objects.get(&id).cloned()
    }

    /// Asks a peer worker to shut down. Waits up to `timeout` for the
    /// acknowledgement, then terminates the transport; the peer is removed
    /// from the registry either way.
    pub fn close_worker(
        &self,
        name: &str,
        timeout: Duration,
    ) -> Result<CloseOutcome, RouterError> {
        if !self.inner.borrow().peers.contains_key(name) {
            return Err(RouterError::UnknownWorker {
                name: name.to_string(),
            });
        }
        let reply = self.send_request(name, Envelope::control(ControlMessage::Close), None)?;
        let settled = self.context.run_until(|| reply.is_settled(), Some(timeout));
        let outcome = if settled {
            CloseOutcome::Graceful
        } else {
            warn!("worker '{name}' did not acknowledge close within {timeout:?}; terminating");
            let terminated = self
                .inner
                .borrow()
                .peers
                .get(name)
                .map(|peer| peer.transport.terminate())
                .unwrap_or(false);
            if !terminated {
                warn!("transport for '{name}' does not support termination");
            }
            CloseOutcome::Forced
        };
        self.inner.borrow_mut().peers.remove(name);
        Ok(outcome)
    }

    /// The outbound half of the shared-object event path. Suppressed while
    /// a remote emit is being delivered, queued until the share confirms,
    /// posted to the object's peer otherwise.
    pub(crate) fn shared_object_emit(&self, object: &SharedObject, event: &str, data: &Value) {
        let peer = {
            let mut inner = self.inner.borrow_mut();
            if let Some((suppressed_id, suppressed_event)) = &inner.suppress_shared_object_emit {
                // the echo of the inbound emit; anything else a listener
                // emits still travels
                if *suppressed_id == object.id() && suppressed_event == event {
                    return;
                }
            }
            let Some(record) = inner.object_records.get_mut(&object.id()) else {
                return; // never shared
            };
            if !record.share_confirmed {
                record
                    .emit_queue
                    .get_or_insert_with(Vec::new)
                    .push((event.to_string(), data.clone()));
                return;
            }
            record.peer.clone()
        };
        let envelope = Envelope::control(ControlMessage::SharedObjectEmit {
            shared_object_id: object.id(),
            event_name: event.to_string(),
            data: data.clone(),
        });
        if let Err(err) = self.post_or_queue(&peer, envelope) {
            warn!("sharedObjectEmit toward '{peer}' failed: {err}");
        }
    }

    // Receiving

    fn handle_frame(&self, peer: &str, envelope: Envelope) {
        let async_id = envelope.async_msg_id;
        let outcome = match envelope.body {
            MessageBody::Control(ControlMessage::Ready) => {
                self.handle_ready(peer);
                Ok(Value::Null)
            }
            MessageBody::Control(ControlMessage::Response {
                async_msg_id,
                error,
                data,
            }) => {
                self.handle_response(async_msg_id, error, data);
                return;
            }
            MessageBody::Control(ControlMessage::Close) => {
                if let Some(id) = async_id {
                    self.respond(peer, id, Ok(Value::Null));
                }
                info!("close requested by '{peer}'; shutting down this worker");
                self.context.request_shutdown();
                return;
            }
            MessageBody::Control(ControlMessage::ShareObjects { buffers }) => {
                self.handle_share_objects(peer, buffers)
            }
            MessageBody::Control(ControlMessage::ForgetObjects { object_ids }) => {
                self.handle_forget_objects(object_ids)
            }
            MessageBody::Control(ControlMessage::SharedObjectEmit {
                shared_object_id,
                event_name,
                data,
            }) => self.handle_remote_emit(shared_object_id, &event_name, data),
            MessageBody::User(value) => self.handle_user_message(value),
        };
        match (async_id, outcome) {
            (Some(id), outcome) => self.respond(peer, id, outcome),
            (None, Err(message)) => {
                warn!("uncorrelated message from '{peer}' failed: {message}")
            }
            (None, Ok(_)) => {}
        }
    }

    fn respond(&self, peer: &str, async_msg_id: u64, outcome: Result<Value, String>) {
        let (error, data) = match outcome {
            Ok(value) => (false, value),
            Err(message) => (true, Value::String(message)),
        };
        let envelope = Envelope::control(ControlMessage::Response {
            async_msg_id,
            error,
            data,
        });
        if let Err(err) = self.post_or_queue(peer, envelope) {
            warn!("response toward '{peer}' failed: {err}");
        }
    }

    fn handle_ready(&self, peer: &str) {
        let mut inner = self.inner.borrow_mut();
        let Some(record) = inner.peers.get_mut(peer) else {
            warn!("ready from unregistered worker '{peer}'");
            return;
        };
        record.ready = true;
        let outbox = std::mem::take(&mut record.outbox);
        for envelope in outbox {
            if let Err(err) = record.transport.post(envelope) {
                warn!("draining outbox toward '{peer}' failed: {err}");
            }
        }
    }

    fn handle_response(&self, async_msg_id: u64, error: bool, data: Value) {
        let pending = self.inner.borrow_mut().pending.remove(&async_msg_id);
        let Some(pending) = pending else {
            panic!("received response for unknown async message id {async_msg_id}");
        };
        if error {
            let message = data
                .as_str()
                .map(str::to_string)
                .unwrap_or_else(|| data.to_string());
            pending.reply.reject(message);
        } else {
            pending.reply.resolve(data);
        }
        if let Some(on_settle) = pending.on_settle {
            on_settle(self, !error);
        }
    }

    fn handle_share_objects(
        &self,
        peer: &str,
        buffers: Vec<SharedBuffer>,
    ) -> Result<Value, String> {
        let factory = self.inner.borrow_mut().factory.take();
        let outcome = (|| {
            let Some(factory) = factory.as_ref() else {
                return Err(RouterError::FactoryFailure {
                    type_id: buffers
                        .first()
                        .map(BufferStruct::extract_type_id)
                        .unwrap_or(0),
                });
            };
            for buffer in &buffers {
                let type_id = BufferStruct::extract_type_id(buffer);
                let Some(object) = factory(buffer.clone()) else {
                    return Err(RouterError::FactoryFailure { type_id });
                };
                {
                    let mut inner = self.inner.borrow_mut();
                    inner.shared_objects.insert(object.id(), object.clone());
                    inner.object_records.insert(
                        object.id(),
                        ObjectRecord {
                            peer: peer.to_string(),
                            share_confirmed: true,
                            emit_queue: None,
                        },
                    );
                }
                self.run_shared_hook(&object);
            }
            Ok(Value::Null)
        })();
        let mut inner = self.inner.borrow_mut();
        if inner.factory.is_none() {
            inner.factory = factory;
        }
        drop(inner);
        outcome.map_err(|err| err.to_string())
    }

    fn handle_forget_objects(&self, object_ids: Vec<u64>) -> Result<Value, String> {
        for id in object_ids {
            let object = self.inner.borrow().shared_objects.get(&id).cloned();
            let Some(object) = object else {
                continue; // unknown ids are ignored
            };
            self.run_forgotten_hook(&object);
            {
                let mut inner = self.inner.borrow_mut();
                inner.shared_objects.remove(&id);
                inner.object_records.remove(&id);
            }
            object.destroy();
        }
        Ok(Value::Null)
    }

    fn handle_remote_emit(&self, id: u64, event_name: &str, data: Value) -> Result<Value, String> {
        let object = self.inner.borrow().shared_objects.get(&id).cloned();
        let Some(object) = object else {
            return Ok(Value::Null); // raced a forget; ignore
        };
        self.inner.borrow_mut().suppress_shared_object_emit =
            Some((id, event_name.to_string()));
        object.emit(event_name, data);
        self.inner.borrow_mut().suppress_shared_object_emit = None;
        Ok(Value::Null)
    }

    fn handle_user_message(&self, value: Value) -> Result<Value, String> {
        let handler = self.inner.borrow_mut().on_message.take();
        match handler {
            Some(mut handler) => {
                let outcome = handler(value);
                let mut inner = self.inner.borrow_mut();
                if inner.on_message.is_none() {
                    inner.on_message = Some(handler);
                }
                outcome
            }
            None => Err(format!(
                "worker '{}' has no message handler",
                self.worker_name()
            )),
        }
    }

    fn run_shared_hook(&self, object: &SharedObject) {
        let hook = self.inner.borrow_mut().on_object_shared.take();
        if let Some(mut hook) = hook {
            hook(object);
            let mut inner = self.inner.borrow_mut();
            if inner.on_object_shared.is_none() {
                inner.on_object_shared = Some(hook);
            }
        }
    }

    fn run_forgotten_hook(&self, object: &SharedObject) {
        let hook = self.inner.borrow_mut().on_before_object_forgotten.take();
        if let Some(mut hook) = hook {
            hook(object);
            let mut inner = self.inner.borrow_mut();
            if inner.on_before_object_forgotten.is_none() {
                inner.on_before_object_forgotten = Some(hook);
            }
        }
    }
}

impl std::fmt::Debug for Router {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let inner = self.inner.borrow();
        f.debug_struct("Router")
            .field("worker_id", &inner.worker_id)
            .field("worker_name", &inner.worker_name)
            .field("peers", &inner.peers.len())
            .field("shared_objects", &inner.shared_objects.len())
            .finish()
    }
}
