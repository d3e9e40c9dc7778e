//! In-process channel pair with a bounded buffer per direction.

use std::cell::{Cell, RefCell};
use std::collections::VecDeque;
use std::rc::Rc;

use tokio::sync::Notify;

use super::{LocalChannel, LocalMessage, WriteError};
use crate::status::Status;

struct Pipe {
    queue: RefCell<VecDeque<LocalMessage<MemoryChannel>>>,
    closed: Cell<bool>,
    readable: Notify,
    writable: Notify,
}

impl Pipe {
    fn new() -> Rc<Self> {
        Rc::new(Self {
            queue: RefCell::new(VecDeque::new()),
            closed: Cell::new(false),
            readable: Notify::new(),
            writable: Notify::new(),
        })
    }

    fn close(&self) {
        self.closed.set(true);
        self.readable.notify_waiters();
        self.writable.notify_waiters();
    }
}

/// One end of a message channel. Closing or dropping either end closes both
/// directions; messages already queued can still be read.
pub struct MemoryChannel {
    inbox: Rc<Pipe>,
    outbox: Rc<Pipe>,
    capacity: usize,
}

impl MemoryChannel {
    pub fn pair(capacity: usize) -> (MemoryChannel, MemoryChannel) {
        let capacity = capacity.max(1);
        let ab = Pipe::new();
        let ba = Pipe::new();
        (
            MemoryChannel {
                inbox: ba.clone(),
                outbox: ab.clone(),
                capacity,
            },
            MemoryChannel {
                inbox: ab,
                outbox: ba,
                capacity,
            },
        )
    }

    /// Messages waiting to be read on this end.
    pub fn pending(&self) -> usize {
        self.inbox.queue.borrow().len()
    }

    /// Messages written here that the other end has not read yet.
    pub fn unread_by_peer(&self) -> usize {
        self.outbox.queue.borrow().len()
    }

    /// Write, waiting while the other end's buffer is full.
    pub async fn write(&self, mut message: LocalMessage<MemoryChannel>) -> Result<(), Status> {
        loop {
            match self.try_write(message) {
                Ok(()) => return Ok(()),
                Err(WriteError::Closed(status)) => return Err(status),
                Err(WriteError::ShouldWait(back)) => {
                    message = back;
                    self.writable().await;
                }
            }
        }
    }
}

impl LocalChannel for MemoryChannel {
    async fn read(&self) -> Result<Option<LocalMessage<Self>>, Status> {
        loop {
            let notified = self.inbox.readable.notified();
            let next = self.inbox.queue.borrow_mut().pop_front();
            if let Some(message) = next {
                self.inbox.writable.notify_waiters();
                return Ok(Some(message));
            }
            if self.inbox.closed.get() {
                return Ok(None);
            }
            notified.await;
        }
    }

    fn try_write(&self, message: LocalMessage<Self>) -> Result<(), WriteError<Self>> {
        if self.outbox.closed.get() {
            return Err(WriteError::Closed(Status::unavailable("channel closed")));
        }
        let mut queue = self.outbox.queue.borrow_mut();
        if queue.len() >= self.capacity {
            return Err(WriteError::ShouldWait(message));
        }
        queue.push_back(message);
        drop(queue);
        self.outbox.readable.notify_waiters();
        Ok(())
    }

    async fn writable(&self) {
        loop {
            let notified = self.outbox.writable.notified();
            if self.outbox.closed.get() || self.outbox.queue.borrow().len() < self.capacity {
                return;
            }
            notified.await;
        }
    }

    fn create_pair(&self) -> Result<(Self, Self), Status> {
        Ok(MemoryChannel::pair(self.capacity))
    }

    fn close(&self, _status: &Status) {
        self.inbox.close();
        self.outbox.close();
    }
}

impl Drop for MemoryChannel {
    fn drop(&mut self) {
        self.inbox.close();
        self.outbox.close();
    }
}
