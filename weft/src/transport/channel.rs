//! In-process transport: a pair of linked endpoints, one per worker.
//!
//! Envelopes posted before the receiving side listens are buffered in
//! arrival order and drained when the listener attaches, so a parent can
//! post at a freshly spawned worker immediately.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use crate::router::Envelope;
use crate::worker::{TaskSender, WorkerEvent};

use super::error::TransportError;
use super::Transport;

#[derive(Default)]
struct EndpointState {
    listener: Option<(String, TaskSender)>,
    backlog: Vec<Envelope>,
}

struct Link {
    ends: [Mutex<EndpointState>; 2],
    alive: AtomicBool,
}

/// One side of an in-process transport pair
pub struct ChannelTransport {
    link: Arc<Link>,
    side: usize,
}

impl ChannelTransport {
    /// Creates two linked endpoints; give one to each worker
    pub fn pair() -> (ChannelTransport, ChannelTransport) {
        let link = Arc::new(Link {
            ends: [
                Mutex::new(EndpointState::default()),
                Mutex::new(EndpointState::default()),
            ],
            alive: AtomicBool::new(true),
        });
        (
            ChannelTransport {
                link: link.clone(),
                side: 0,
            },
            ChannelTransport { link, side: 1 },
        )
    }

    fn peer_end(&self) -> &Mutex<EndpointState> {
        &self.link.ends[1 - self.side]
    }

    fn own_end(&self) -> &Mutex<EndpointState> {
        &self.link.ends[self.side]
    }
}

impl Transport for ChannelTransport {
    fn post(&self, envelope: Envelope) -> Result<(), TransportError> {
        if !self.link.alive.load(Ordering::SeqCst) {
            return Err(TransportError::Closed);
        }
        let mut peer = self.peer_end().lock().expect("transport endpoint poisoned");
        match &peer.listener {
            Some((peer_name, sender)) => {
                let delivered = sender.send(WorkerEvent::Frame {
                    peer: peer_name.clone(),
                    envelope,
                });
                if delivered {
                    Ok(())
                } else {
                    Err(TransportError::Closed)
                }
            }
            None => {
                peer.backlog.push(envelope);
                Ok(())
            }
        }
    }

    fn start_listening(&self, peer_name: &str, sender: TaskSender) {
        let mut own = self.own_end().lock().expect("transport endpoint poisoned");
        for envelope in own.backlog.drain(..) {
            sender.send(WorkerEvent::Frame {
                peer: peer_name.to_string(),
                envelope,
            });
        }
        own.listener = Some((peer_name.to_string(), sender));
    }

    fn terminate(&self) -> bool {
        self.link.alive.store(false, Ordering::SeqCst);
        for end in &self.link.ends {
            let mut end = end.lock().expect("transport endpoint poisoned");
            end.listener = None;
            end.backlog.clear();
        }
        true
    }
}
