//! Cross-thread wake-up channel and broadcast delivery.
//!
//! The manager owns the receiving side; [`WakeHandle`] is the only part of
//! the API that may be used from other threads. A broadcast enqueues one
//! record and wakes the poller; the dispatcher drains the queue when it
//! observes the wake-up and invokes the record's callback once per live
//! connection, in list order.

use std::io;
use std::sync::Arc;

use crossbeam_channel::Sender;
use mio::Waker;

use crate::connection::ConnToken;
use crate::manager::Manager;

/// The callback carried by a broadcast record.
pub type BroadcastFn = Box<dyn FnMut(&mut Manager, ConnToken, &[u8]) + Send>;

/// One broadcast record: a callback and the bytes it is handed.
pub(crate) struct Broadcast {
    pub func: BroadcastFn,
    pub data: Vec<u8>,
}

/// Thread-safe handle for waking the manager and broadcasting to its
/// connections. Cloneable; every clone addresses the same manager.
#[derive(Clone)]
pub struct WakeHandle {
    pub(crate) tx: Sender<Broadcast>,
    pub(crate) waker: Arc<Waker>,
}

impl WakeHandle {
    /// Enqueue a broadcast and wake the poller.
    ///
    /// During the next `poll` iteration, `func` is invoked once per live
    /// connection with the connection's token and `data`. The channel is
    /// unbounded, so this never blocks the sender.
    pub fn broadcast<F>(&self, func: F, data: impl Into<Vec<u8>>) -> io::Result<()>
    where
        F: FnMut(&mut Manager, ConnToken, &[u8]) + Send + 'static,
    {
        // A send error means the manager is gone; the wake below will not
        // reach anything either, so drop the record silently.
        let _ = self.tx.send(Broadcast {
            func: Box::new(func),
            data: data.into(),
        });
        self.waker.wake()
    }
}
