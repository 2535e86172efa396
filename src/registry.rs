use crate::container::{Container, StripMode};
use crate::MergeError;
use fixedbitset::FixedBitSet;
use lru::LruCache;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};
use tracing::debug;

pub type ClientId = u32;

/// What the collector remembers about one worker.
#[derive(Debug)]
pub struct ClientRecord {
    id: ClientId,
    container: Option<Container>,
    last_contact: Instant,
    time_since_prev_contact: Duration,
    contacts: u64,
    backup_path: PathBuf,
}

impl ClientRecord {
    pub fn id(&self) -> ClientId {
        self.id
    }

    /// `None` while the container lives in the backup file.
    pub fn container(&self) -> Option<&Container> {
        self.container.as_ref()
    }

    pub fn is_evicted(&self) -> bool {
        self.container.is_none()
    }

    pub fn last_contact(&self) -> Instant {
        self.last_contact
    }

    pub fn time_since_prev_contact(&self) -> Duration {
        self.time_since_prev_contact
    }

    pub fn contacts(&self) -> u64 {
        self.contacts
    }

    pub fn backup_path(&self) -> &Path {
        &self.backup_path
    }
}

/// Per-output bookkeeping of every client that contributed to it.
///
/// Client ids are dense and assigned by the caller in arrival order. The
/// round state (contact bitmap and counter) is cleared by [`reset_round`]
/// after each merge sweep.
///
/// [`reset_round`]: ClientRegistry::reset_round
pub struct ClientRegistry {
    clients: Vec<ClientRecord>,
    contacted: FixedBitSet,
    round_contacts: u32,
    last_merge: Instant,
    backup_base: PathBuf,
    memory_limit: Option<usize>,
    resident: LruCache<ClientId, usize>,
    resident_bytes: usize,
}

impl ClientRegistry {
    /// `output` names the merged file; client backups are written next to it.
    pub fn new(output: &Path, memory_limit: Option<usize>, now: Instant) -> Self {
        Self {
            clients: Vec::new(),
            contacted: FixedBitSet::with_capacity(64),
            round_contacts: 0,
            last_merge: now,
            backup_base: output.to_path_buf(),
            memory_limit,
            resident: LruCache::unbounded(),
            resident_bytes: 0,
        }
    }

    pub fn len(&self) -> usize {
        self.clients.len()
    }

    pub fn is_empty(&self) -> bool {
        self.clients.is_empty()
    }

    pub fn clients(&self) -> &[ClientRecord] {
        &self.clients
    }

    pub fn get(&self, id: ClientId) -> Option<&ClientRecord> {
        self.clients.get(id as usize)
    }

    pub fn round_contacts(&self) -> u32 {
        self.round_contacts
    }

    pub fn distinct_round_contacts(&self) -> usize {
        self.contacted.count_ones(..)
    }

    pub fn last_merge(&self) -> Instant {
        self.last_merge
    }

    pub fn resident_bytes(&self) -> usize {
        self.resident_bytes
    }

    fn backup_path_for(&self, id: ClientId) -> PathBuf {
        let stem = self
            .backup_base
            .file_stem()
            .map(|s| s.to_string_lossy().to_string())
            .unwrap_or_else(|| "output".to_string());
        self.backup_base.with_file_name(format!("{}.client{}.bak", stem, id))
    }

    /// Record a contact from `id` carrying `container`.
    pub fn register_client(&mut self, id: ClientId, container: Container, now: Instant) -> Result<(), MergeError> {
        let idx = id as usize;
        if idx > self.clients.len() {
            return Err(MergeError::Other(format!(
                "client id {} skips ahead of {} registered clients",
                id,
                self.clients.len()
            )));
        }

        self.round_contacts += 1;
        self.contacted.grow(idx + 1);
        self.contacted.insert(idx);

        let footprint = container.footprint();
        if idx == self.clients.len() {
            let backup_path = self.backup_path_for(id);
            self.clients.push(ClientRecord {
                id,
                container: Some(container),
                last_contact: now,
                time_since_prev_contact: Duration::ZERO,
                contacts: 1,
                backup_path,
            });
        } else {
            let record = &mut self.clients[idx];
            record.time_since_prev_contact = now.saturating_duration_since(record.last_contact);
            record.last_contact = now;
            record.contacts += 1;
            if record.container.replace(container).is_none() {
                // The backup held an older state that this contact supersedes.
                remove_if_exists(&record.backup_path)?;
            }
        }

        if let Some(old) = self.resident.put(id, footprint) {
            self.resident_bytes -= old;
        }
        self.resident_bytes += footprint;
        self.evict_over_limit()
    }

    /// Move least recently contacted containers to disk until under the limit.
    fn evict_over_limit(&mut self) -> Result<(), MergeError> {
        let Some(limit) = self.memory_limit else {
            return Ok(());
        };
        while self.resident_bytes > limit && self.resident.len() > 1 {
            let Some((id, bytes)) = self.resident.pop_lru() else {
                break;
            };
            let record = &mut self.clients[id as usize];
            if let Some(container) = record.container.take() {
                container.persist(&record.backup_path)?;
                debug!(
                    "[registry] evicted client {} ({} bytes) to {}",
                    id,
                    bytes,
                    record.backup_path.display()
                );
            }
            self.resident_bytes -= bytes;
        }
        Ok(())
    }

    /// Containers of evicted clients, read back from their backups.
    pub fn load_evicted(&self) -> Result<Vec<(ClientId, Container)>, MergeError> {
        self.clients
            .iter()
            .filter(|r| r.is_evicted())
            .map(|r| Container::load(&r.backup_path).map(|c| (r.id, c)))
            .collect()
    }

    /// Containers currently held in memory.
    pub fn resident_containers(&self) -> impl Iterator<Item = &Container> {
        self.clients.iter().filter_map(|r| r.container.as_ref())
    }

    /// Strip `mode` entries from every client: in memory, or in the backup
    /// file for evicted clients (`evicted` as returned by [`load_evicted`]).
    ///
    /// [`load_evicted`]: ClientRegistry::load_evicted
    pub fn strip_all(&mut self, mode: StripMode, evicted: Vec<(ClientId, Container)>) -> Result<usize, MergeError> {
        let mut removed = 0;
        for record in self.clients.iter_mut() {
            let Some(container) = record.container.as_mut() else {
                continue;
            };
            let stripped = container.strip(mode);
            if stripped == 0 {
                continue;
            }
            removed += stripped;
            if let Some(bytes) = self.resident.peek_mut(&record.id) {
                let footprint = container.footprint();
                self.resident_bytes = self.resident_bytes - *bytes + footprint;
                *bytes = footprint;
            }
        }
        for (id, mut container) in evicted {
            let stripped = container.strip(mode);
            if stripped > 0 {
                container.persist(&self.clients[id as usize].backup_path)?;
            }
            removed += stripped;
        }
        Ok(removed)
    }

    /// Mean plus two standard deviations of the clients' inter-contact intervals, in seconds.
    pub fn contact_interval_target(&self) -> f64 {
        if self.clients.is_empty() {
            return 0.0;
        }
        let n = self.clients.len() as f64;
        let (sum, sum2) = self.clients.iter().fold((0.0, 0.0), |(s, s2), r| {
            let t = r.time_since_prev_contact.as_secs_f64();
            (s + t, s2 + t * t)
        });
        let avg = sum / n;
        let sigma = if sum2 > 0.0 { (sum2 / n - avg * avg).max(0.0).sqrt() } else { 0.0 };
        avg + 2.0 * sigma
    }

    /// Whether enough has arrived since the last sweep to justify a merge.
    pub fn need_merge(&self, client_threshold: f32, now: Instant) -> bool {
        if self.clients.is_empty() {
            return false;
        }
        let elapsed = now.saturating_duration_since(self.last_merge).as_secs_f64();
        if elapsed > self.contact_interval_target() {
            return true;
        }
        let cut = client_threshold as f64 * self.clients.len() as f64;
        self.distinct_round_contacts() as f64 > cut || self.round_contacts as f64 > 2.0 * cut
    }

    /// Whether any client contacted since the last sweep.
    pub fn need_final_merge(&self) -> bool {
        self.contacted.count_ones(..) > 0
    }

    pub fn reset_round(&mut self, now: Instant) {
        self.last_merge = now;
        self.round_contacts = 0;
        self.contacted.clear();
    }

    /// Delete every backup file; called once the output is final.
    pub fn remove_backups(&self) -> Result<(), MergeError> {
        for record in &self.clients {
            remove_if_exists(&record.backup_path)?;
        }
        Ok(())
    }
}

fn remove_if_exists(path: &Path) -> Result<(), MergeError> {
    match fs::remove_file(path) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(MergeError::Io(e)),
    }
}
