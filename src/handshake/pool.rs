//! Process-pool primitives the handshake runs on, plus in-process
//! implementations.
//!
//! A [`ProcessPool`] spans every process that may take part in any stream;
//! a [`LocalGroup`] is the subset forming one application (all writers or
//! all readers of one program).

use crate::error::{Result, StreamError};
use bytes::Bytes;
use crossbeam_channel::{unbounded, Receiver, Sender};
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard};

/// An outstanding non-blocking receive.
pub trait PendingReceive: Send {
    /// Completed message, or `None` while still pending.
    fn test(&mut self) -> Result<Option<Bytes>>;

    fn cancel(&mut self);
}

pub trait ProcessPool: Send + Sync {
    fn rank(&self) -> u32;

    fn size(&self) -> u32;

    /// Non-blocking point-to-point send.
    fn isend(&self, dest: u32, tag: u32, message: Bytes) -> Result<()>;

    /// Post a receive for one message from `source` carrying `tag`.
    fn post_receive(&self, source: u32, tag: u32) -> Result<Box<dyn PendingReceive>>;
}

pub trait LocalGroup: Send + Sync {
    fn rank(&self) -> u32;

    fn size(&self) -> u32;

    /// Collective: every member receives `root`'s value.
    fn broadcast_u32(&self, value: u32, root: u32) -> Result<u32>;
}

// =============================================================================
// In-process pool
// =============================================================================

/// (dest, source, tag)
type MailboxKey = (u32, u32, u32);

#[derive(Debug, Default)]
struct Mailbox {
    queues: HashMap<MailboxKey, VecDeque<Bytes>>,
}

fn lock(mailbox: &Mutex<Mailbox>) -> MutexGuard<'_, Mailbox> {
    mailbox.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// One member of a pool of in-process "processes" (usually threads).
#[derive(Debug, Clone)]
pub struct MemoryPool {
    rank: u32,
    size: u32,
    mailbox: Arc<Mutex<Mailbox>>,
}

impl MemoryPool {
    /// Handles for every rank of a pool of `size` members.
    pub fn create(size: u32) -> Vec<MemoryPool> {
        let mailbox = Arc::new(Mutex::new(Mailbox::default()));
        (0..size)
            .map(|rank| MemoryPool {
                rank,
                size,
                mailbox: mailbox.clone(),
            })
            .collect()
    }
}

impl ProcessPool for MemoryPool {
    fn rank(&self) -> u32 {
        self.rank
    }

    fn size(&self) -> u32 {
        self.size
    }

    fn isend(&self, dest: u32, tag: u32, message: Bytes) -> Result<()> {
        if dest >= self.size {
            return Err(StreamError::invalid(format!(
                "rank {} outside pool of {}",
                dest, self.size
            )));
        }
        lock(&self.mailbox)
            .queues
            .entry((dest, self.rank, tag))
            .or_default()
            .push_back(message);
        Ok(())
    }

    fn post_receive(&self, source: u32, tag: u32) -> Result<Box<dyn PendingReceive>> {
        if source >= self.size {
            return Err(StreamError::invalid(format!(
                "rank {} outside pool of {}",
                source, self.size
            )));
        }
        Ok(Box::new(MemoryReceive {
            key: (self.rank, source, tag),
            mailbox: self.mailbox.clone(),
            done: false,
        }))
    }
}

struct MemoryReceive {
    key: MailboxKey,
    mailbox: Arc<Mutex<Mailbox>>,
    done: bool,
}

impl PendingReceive for MemoryReceive {
    fn test(&mut self) -> Result<Option<Bytes>> {
        if self.done {
            return Ok(None);
        }
        let message = lock(&self.mailbox)
            .queues
            .get_mut(&self.key)
            .and_then(VecDeque::pop_front);
        if message.is_some() {
            self.done = true;
        }
        Ok(message)
    }

    fn cancel(&mut self) {
        self.done = true;
    }
}

// =============================================================================
// In-process local group
// =============================================================================

/// One member of an in-process local group.
#[derive(Debug, Clone)]
pub struct MemoryGroup {
    rank: u32,
    peers: Arc<Vec<Sender<u32>>>,
    inbox: Receiver<u32>,
}

impl MemoryGroup {
    /// Handles for every member of a group of `size`.
    pub fn create(size: u32) -> Vec<MemoryGroup> {
        let (senders, receivers): (Vec<_>, Vec<_>) = (0..size).map(|_| unbounded()).unzip();
        let peers = Arc::new(senders);
        receivers
            .into_iter()
            .enumerate()
            .map(|(rank, inbox)| MemoryGroup {
                rank: rank as u32,
                peers: peers.clone(),
                inbox,
            })
            .collect()
    }
}

impl LocalGroup for MemoryGroup {
    fn rank(&self) -> u32 {
        self.rank
    }

    fn size(&self) -> u32 {
        self.peers.len() as u32
    }

    fn broadcast_u32(&self, value: u32, root: u32) -> Result<u32> {
        if root >= self.size() {
            return Err(StreamError::invalid(format!(
                "broadcast root {} outside group of {}",
                root,
                self.size()
            )));
        }
        if self.rank == root {
            for (rank, peer) in self.peers.iter().enumerate() {
                if rank as u32 != root {
                    peer.send(value)
                        .map_err(|_| StreamError::transport("group member went away"))?;
                }
            }
            Ok(value)
        } else {
            self.inbox
                .recv()
                .map_err(|_| StreamError::transport("group root went away"))
        }
    }
}
