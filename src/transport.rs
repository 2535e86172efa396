//! Point-to-point message passing between ranks of a process group.
//!
//! [`Communicator`] is the seam the protocol is written against. [`LocalWorld`]
//! provides an in-process implementation where every rank is a thread and
//! messages travel over crossbeam channels.

use crate::MergeError;
use crossbeam_channel::{Receiver, Sender};
use rustc_hash::FxHashMap;
use std::collections::VecDeque;
use std::sync::{Arc, Barrier, Mutex, MutexGuard};

/// What `probe` reveals about the next pending message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Status {
    pub source: usize,
    pub tag: i32,
    pub count: usize,
}

/// Completion handle of a non-blocking send.
pub trait SendRequest: Send {
    /// Block until the receiver has consumed the message.
    fn wait(self) -> Result<(), MergeError>;
}

pub trait Communicator: Send + Sized {
    type Request: SendRequest;

    fn rank(&self) -> usize;
    fn size(&self) -> usize;

    /// Start a send; the payload is owned by the transport until the request completes.
    fn isend(&self, dest: usize, tag: i32, payload: Vec<u8>) -> Result<Self::Request, MergeError>;

    fn send(&self, dest: usize, tag: i32, payload: Vec<u8>) -> Result<(), MergeError> {
        self.isend(dest, tag, payload)?.wait()
    }

    /// Block until a message from any source with any tag is pending, without consuming it.
    fn probe(&mut self) -> Result<Status, MergeError>;

    /// Consume the next message from `source` with `tag`, which must be exactly `count` bytes.
    fn recv(&mut self, source: usize, tag: i32, count: usize) -> Result<Vec<u8>, MergeError>;

    /// Collective: ranks passing the same color form a new group, ordered by `key`.
    fn split(&self, color: u32, key: usize) -> Result<Self, MergeError>;
}

struct Envelope {
    source: usize,
    tag: i32,
    payload: Vec<u8>,
    ack: Sender<()>,
}

impl Envelope {
    fn status(&self) -> Status {
        Status {
            source: self.source,
            tag: self.tag,
            count: self.payload.len(),
        }
    }
}

pub struct LocalRequest {
    ack: Receiver<()>,
    dest: usize,
}

impl SendRequest for LocalRequest {
    fn wait(self) -> Result<(), MergeError> {
        self.ack.recv().map_err(|_| {
            MergeError::Transport(format!("rank {} dropped a message without consuming it", self.dest))
        })
    }
}

struct SplitState {
    requests: Vec<Option<(u32, usize)>>,
    fabrics: FxHashMap<u32, Arc<Fabric>>,
}

/// Rendezvous shared by all members of one communicator for `split`.
struct SplitBoard {
    barrier: Barrier,
    state: Mutex<SplitState>,
}

impl SplitBoard {
    fn new(size: usize) -> Arc<Self> {
        Arc::new(Self {
            barrier: Barrier::new(size),
            state: Mutex::new(SplitState {
                requests: vec![None; size],
                fabrics: FxHashMap::default(),
            }),
        })
    }
}

/// Channels of one group: a sender per member, and each member's inbox until claimed.
struct Fabric {
    senders: Arc<Vec<Sender<Envelope>>>,
    inboxes: Mutex<Vec<Option<Receiver<Envelope>>>>,
    board: Arc<SplitBoard>,
}

impl Fabric {
    fn new(size: usize) -> Self {
        let (senders, inboxes): (Vec<_>, Vec<_>) = (0..size)
            .map(|_| {
                let (tx, rx) = crossbeam_channel::unbounded();
                (tx, Some(rx))
            })
            .unzip();
        Self {
            senders: Arc::new(senders),
            inboxes: Mutex::new(inboxes),
            board: SplitBoard::new(size),
        }
    }

    fn claim(&self, rank: usize) -> Result<LocalComm, MergeError> {
        let inbox = lock(&self.inboxes)?
            .get_mut(rank)
            .and_then(Option::take)
            .ok_or_else(|| MergeError::Transport(format!("inbox of rank {} already claimed", rank)))?;
        Ok(LocalComm {
            rank,
            peers: self.senders.clone(),
            inbox,
            pending: VecDeque::new(),
            board: self.board.clone(),
        })
    }
}

fn lock<T>(mutex: &Mutex<T>) -> Result<MutexGuard<'_, T>, MergeError> {
    mutex
        .lock()
        .map_err(|_| MergeError::Transport("rank panicked while holding transport state".to_string()))
}

/// Factory for a group of in-process ranks.
pub struct LocalWorld;

impl LocalWorld {
    /// One communicator per rank; move each into its own thread.
    pub fn new(size: usize) -> Result<Vec<LocalComm>, MergeError> {
        if size == 0 {
            return Err(MergeError::Configuration("world size must be at least 1".to_string()));
        }
        let fabric = Fabric::new(size);
        (0..size).map(|rank| fabric.claim(rank)).collect()
    }
}

pub struct LocalComm {
    rank: usize,
    peers: Arc<Vec<Sender<Envelope>>>,
    inbox: Receiver<Envelope>,
    /// Probed or out-of-order messages not yet consumed.
    pending: VecDeque<Envelope>,
    board: Arc<SplitBoard>,
}

impl LocalComm {
    fn next_envelope(&self) -> Result<Envelope, MergeError> {
        self.inbox
            .recv()
            .map_err(|_| MergeError::Transport(format!("rank {} inbox disconnected", self.rank)))
    }

    fn deliver(envelope: Envelope, count: usize) -> Result<Vec<u8>, MergeError> {
        if envelope.payload.len() != count {
            return Err(MergeError::Transport(format!(
                "message from rank {} has {} bytes, receiver expected {}",
                envelope.source,
                envelope.payload.len(),
                count
            )));
        }
        // The sender may have dropped its request; nothing to acknowledge then.
        let _ = envelope.ack.send(());
        Ok(envelope.payload)
    }
}

impl Communicator for LocalComm {
    type Request = LocalRequest;

    fn rank(&self) -> usize {
        self.rank
    }

    fn size(&self) -> usize {
        self.peers.len()
    }

    fn isend(&self, dest: usize, tag: i32, payload: Vec<u8>) -> Result<LocalRequest, MergeError> {
        let peer = self
            .peers
            .get(dest)
            .ok_or_else(|| MergeError::Transport(format!("rank {} outside group of {}", dest, self.peers.len())))?;
        let (ack_tx, ack_rx) = crossbeam_channel::bounded(1);
        peer.send(Envelope {
            source: self.rank,
            tag,
            payload,
            ack: ack_tx,
        })
        .map_err(|_| MergeError::Transport(format!("rank {} is gone", dest)))?;
        Ok(LocalRequest { ack: ack_rx, dest })
    }

    fn probe(&mut self) -> Result<Status, MergeError> {
        if let Some(front) = self.pending.front() {
            return Ok(front.status());
        }
        let envelope = self.next_envelope()?;
        let status = envelope.status();
        self.pending.push_back(envelope);
        Ok(status)
    }

    fn recv(&mut self, source: usize, tag: i32, count: usize) -> Result<Vec<u8>, MergeError> {
        if let Some(pos) = self.pending.iter().position(|e| e.source == source && e.tag == tag) {
            if let Some(envelope) = self.pending.remove(pos) {
                return Self::deliver(envelope, count);
            }
        }
        loop {
            let envelope = self.next_envelope()?;
            if envelope.source == source && envelope.tag == tag {
                return Self::deliver(envelope, count);
            }
            self.pending.push_back(envelope);
        }
    }

    fn split(&self, color: u32, key: usize) -> Result<LocalComm, MergeError> {
        let board = &self.board;
        lock(&board.state)?.requests[self.rank] = Some((color, key));
        board.barrier.wait();

        let claimed = {
            let mut state = lock(&board.state)?;
            let mut members: Vec<(usize, usize)> = state
                .requests
                .iter()
                .enumerate()
                .filter_map(|(rank, req)| match req {
                    Some((c, k)) if *c == color => Some((*k, rank)),
                    _ => None,
                })
                .collect();
            members.sort_unstable();
            let new_rank = members.iter().position(|&(_, rank)| rank == self.rank);
            let fabric = state
                .fabrics
                .entry(color)
                .or_insert_with(|| Arc::new(Fabric::new(members.len())))
                .clone();
            new_rank
                .ok_or_else(|| MergeError::Transport(format!("rank {} missing from its own split", self.rank)))
                .and_then(|r| fabric.claim(r))
        };

        if board.barrier.wait().is_leader() {
            let mut state = lock(&board.state)?;
            state.requests.iter_mut().for_each(|r| *r = None);
            state.fabrics.clear();
        }
        board.barrier.wait();
        claimed
    }
}
