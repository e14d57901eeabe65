//! Phone-home event bus.
//!
//! A booting VM confirms it came up by calling back to the daemon with its
//! secret token. Every call is fanned out to every registered subscriber;
//! subscribers match the token they wait for and discard the rest.
//!
//! # Architecture
//!
//! ```text
//! receive_call ──▶ PhoneHomeBus::broadcast ──▶ dispatch task ──▶ [sub 1, sub 2, ...]
//!                                                  ▲
//!                          register / unregister ──┘
//! ```
//!
//! The client map is owned by the dispatch task and only changes through
//! commands on its channel. Each subscriber has its own unbounded queue, so a
//! slow subscriber never holds up delivery to the others.

use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::atomic::{AtomicU64, Ordering};

use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, trace};
use vmfleet_core::SecretUuid;

/// A boot confirmation from a VM.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PhoneCall {
    /// Token the VM was provisioned with.
    pub secret_uuid: SecretUuid,
    /// Address the call came from.
    pub remote_ip: IpAddr,
    /// Whether the call was made by the first-boot payload.
    pub cloud_init: bool,
}

enum Command {
    Register {
        id: u64,
        tx: mpsc::UnboundedSender<PhoneCall>,
    },
    Unregister {
        id: u64,
    },
    Broadcast(PhoneCall),
    Count(oneshot::Sender<usize>),
}

/// Process-wide broadcaster of phone-home calls.
pub struct PhoneHomeBus {
    commands: mpsc::UnboundedSender<Command>,
    next_id: AtomicU64,
}

impl PhoneHomeBus {
    /// Create the bus and spawn its dispatch task.
    ///
    /// Must be called from within a tokio runtime. The task exits once the bus
    /// and every subscription have been dropped.
    #[must_use]
    pub fn new() -> Self {
        let (commands, rx) = mpsc::unbounded_channel();
        tokio::spawn(dispatch(rx));
        Self {
            commands,
            next_id: AtomicU64::new(0),
        }
    }

    /// Register a new subscriber.
    ///
    /// The subscription receives every call broadcast after this returns and
    /// unregisters itself when dropped.
    #[must_use]
    pub fn register(&self) -> PhoneHomeSubscription {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = mpsc::unbounded_channel();
        // The dispatch task outlives every sender, so this cannot fail.
        let _ = self.commands.send(Command::Register { id, tx });
        PhoneHomeSubscription {
            id,
            rx,
            commands: self.commands.clone(),
        }
    }

    /// Deliver a call to every current subscriber.
    pub fn broadcast(&self, call: PhoneCall) {
        let _ = self.commands.send(Command::Broadcast(call));
    }

    /// Number of registered subscribers.
    pub async fn subscriber_count(&self) -> usize {
        let (tx, rx) = oneshot::channel();
        if self.commands.send(Command::Count(tx)).is_err() {
            return 0;
        }
        rx.await.unwrap_or(0)
    }
}

impl Default for PhoneHomeBus {
    fn default() -> Self {
        Self::new()
    }
}

async fn dispatch(mut commands: mpsc::UnboundedReceiver<Command>) {
    let mut clients: HashMap<u64, mpsc::UnboundedSender<PhoneCall>> = HashMap::new();

    while let Some(command) = commands.recv().await {
        match command {
            Command::Register { id, tx } => {
                clients.insert(id, tx);
            }
            Command::Unregister { id } => {
                clients.remove(&id);
            }
            Command::Broadcast(call) => {
                debug!(
                    remote_ip = %call.remote_ip,
                    cloud_init = call.cloud_init,
                    subscribers = clients.len(),
                    "Broadcasting phone-home call"
                );
                clients.retain(|_, tx| tx.send(call.clone()).is_ok());
            }
            Command::Count(reply) => {
                let _ = reply.send(clients.len());
            }
        }
    }

    trace!("Phone-home dispatch task exiting");
}

/// A registered receiver of phone-home calls.
pub struct PhoneHomeSubscription {
    id: u64,
    rx: mpsc::UnboundedReceiver<PhoneCall>,
    commands: mpsc::UnboundedSender<Command>,
}

impl PhoneHomeSubscription {
    /// Receive the next call, whatever its token.
    ///
    /// Returns `None` if the bus has shut down.
    pub async fn recv(&mut self) -> Option<PhoneCall> {
        self.rx.recv().await
    }

    /// Receive the next call carrying `secret`, discarding all others.
    pub async fn recv_for(&mut self, secret: &SecretUuid) -> Option<PhoneCall> {
        loop {
            let call = self.rx.recv().await?;
            if call.secret_uuid == *secret {
                return Some(call);
            }
        }
    }
}

impl Drop for PhoneHomeSubscription {
    fn drop(&mut self) {
        let _ = self.commands.send(Command::Unregister { id: self.id });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;
    use std::time::Duration;

    fn call(secret: SecretUuid, last_octet: u8) -> PhoneCall {
        PhoneCall {
            secret_uuid: secret,
            remote_ip: IpAddr::V4(Ipv4Addr::new(10, 104, 0, last_octet)),
            cloud_init: true,
        }
    }

    #[tokio::test]
    async fn broadcast_reaches_every_subscriber() {
        let bus = PhoneHomeBus::new();
        let mut a = bus.register();
        let mut b = bus.register();

        let secret = SecretUuid::generate();
        bus.broadcast(call(secret, 10));

        assert_eq!(a.recv().await.unwrap().secret_uuid, secret);
        assert_eq!(b.recv().await.unwrap().secret_uuid, secret);
    }

    #[tokio::test(start_paused = true)]
    async fn only_matching_waiter_is_unblocked() {
        let bus = PhoneHomeBus::new();
        let x = SecretUuid::generate();
        let y = SecretUuid::generate();

        let mut waiting_for_x = bus.register();
        let mut waiting_for_y = bus.register();

        bus.broadcast(call(x, 10));

        let got = waiting_for_x.recv_for(&x).await.unwrap();
        assert_eq!(got.remote_ip, IpAddr::V4(Ipv4Addr::new(10, 104, 0, 10)));

        let blocked =
            tokio::time::timeout(Duration::from_secs(5), waiting_for_y.recv_for(&y)).await;
        assert!(blocked.is_err());
    }

    #[tokio::test]
    async fn dropped_subscriptions_unregister() {
        let bus = PhoneHomeBus::new();
        let a = bus.register();
        let b = bus.register();
        assert_eq!(bus.subscriber_count().await, 2);

        drop(a);
        assert_eq!(bus.subscriber_count().await, 1);
        drop(b);
        assert_eq!(bus.subscriber_count().await, 0);
    }

    #[tokio::test]
    async fn late_subscriber_misses_earlier_calls() {
        let bus = PhoneHomeBus::new();
        let secret = SecretUuid::generate();
        bus.broadcast(call(secret, 10));

        let mut late = bus.register();
        bus.broadcast(call(secret, 11));

        let got = late.recv().await.unwrap();
        assert_eq!(got.remote_ip, IpAddr::V4(Ipv4Addr::new(10, 104, 0, 11)));
    }
}
