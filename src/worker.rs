use crate::container::{Compression, Container};
use crate::partition::{RowContext, COLLECTOR_RANK};
use crate::transport::{Communicator, SendRequest};
use crate::MergeError;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

/// Ownership state of the worker's outgoing snapshot.
pub enum SendSlot<R> {
    Released,
    Pending { request: R, bytes: usize, issued_at: Instant },
}

impl<R> SendSlot<R> {
    pub fn is_pending(&self) -> bool {
        matches!(self, SendSlot::Pending { .. })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SyncReport {
    pub sequence: u64,
    pub bytes: usize,
    /// Time blocked on the previous snapshot's acknowledgment.
    pub waited: Duration,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WorkerSummary {
    pub syncs: u64,
    pub bytes_sent: u64,
}

/// Worker side of a row: accumulates into a container and ships snapshots
/// to the collector with at most one send in flight.
pub struct WorkerSyncClient<C: Communicator> {
    row: RowContext<C>,
    container: Container,
    slot: SendSlot<C::Request>,
    syncs: u64,
    bytes_sent: u64,
    closed: bool,
}

impl<C: Communicator> WorkerSyncClient<C> {
    pub fn new(row: RowContext<C>, compression: Compression) -> Result<Self, MergeError> {
        if row.is_collector() {
            return Err(MergeError::Configuration(format!(
                "global rank {} is the collector of row {} and cannot send snapshots",
                row.global_rank(),
                row.color()
            )));
        }
        Ok(Self {
            row,
            container: Container::new(compression),
            slot: SendSlot::Released,
            syncs: 0,
            bytes_sent: 0,
            closed: false,
        })
    }

    pub fn row(&self) -> &RowContext<C> {
        &self.row
    }

    pub fn container(&self) -> &Container {
        &self.container
    }

    pub fn container_mut(&mut self) -> &mut Container {
        &mut self.container
    }

    pub fn has_pending_send(&self) -> bool {
        self.slot.is_pending()
    }

    fn release_pending(&mut self) -> Result<Duration, MergeError> {
        match std::mem::replace(&mut self.slot, SendSlot::Released) {
            SendSlot::Released => Ok(Duration::ZERO),
            SendSlot::Pending { request, bytes, issued_at } => {
                let start = Instant::now();
                request.wait()?;
                let waited = start.elapsed();
                debug!(
                    "[worker {}] wait time: {:.6}s for {} bytes in flight {:.3}s",
                    self.row.global_rank(),
                    waited.as_secs_f64(),
                    bytes,
                    issued_at.elapsed().as_secs_f64()
                );
                Ok(waited)
            }
        }
    }

    /// Ship the current state and start a fresh accumulation round.
    ///
    /// Blocks only if the previous snapshot has not been consumed yet.
    pub fn sync(&mut self) -> Result<SyncReport, MergeError> {
        let waited = self.release_pending()?;
        let snapshot = self.container.to_bytes()?;
        let bytes = snapshot.len();
        let request = self.row.comm().isend(COLLECTOR_RANK, self.row.tag(), snapshot)?;
        self.slot = SendSlot::Pending {
            request,
            bytes,
            issued_at: Instant::now(),
        };
        self.container.reset_resettable();
        self.syncs += 1;
        self.bytes_sent += bytes as u64;
        Ok(SyncReport {
            sequence: self.syncs,
            bytes,
            waited,
        })
    }

    /// Drain the in-flight snapshot and send the end-of-stream marker.
    pub fn close(mut self) -> Result<WorkerSummary, MergeError> {
        self.release_pending()?;
        self.row.comm().send(COLLECTOR_RANK, self.row.tag(), Vec::new())?;
        self.closed = true;
        info!(
            "[worker {}] closed after {} sync(s), {} bytes",
            self.row.global_rank(),
            self.syncs,
            self.bytes_sent
        );
        Ok(WorkerSummary {
            syncs: self.syncs,
            bytes_sent: self.bytes_sent,
        })
    }
}

impl<C: Communicator> Drop for WorkerSyncClient<C> {
    fn drop(&mut self) {
        if !self.closed {
            warn!(
                "[worker {}] dropped without close; collector of row {} will wait forever",
                self.row.global_rank(),
                self.row.color()
            );
        }
    }
}
