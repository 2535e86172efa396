use crate::container::{self, Compression, Container, MergeOptions, MergeReport, StripMode};
use crate::registry::{ClientId, ClientRegistry};
use crate::MergeError;
use rustc_hash::FxHashMap;
use std::path::{Path, PathBuf};
use std::time::Instant;
use tracing::debug;

/// Stable identity of a merged output: its file path.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct OutputKey(PathBuf);

impl OutputKey {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self(path.into())
    }

    pub fn path(&self) -> &Path {
        &self.0
    }
}

/// When the collector runs a full merge pass.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum MergeTrigger {
    EveryMessage,
    /// Merge when [`ClientRegistry::need_merge`] says so for this client threshold.
    Threshold(f32),
}

impl MergeTrigger {
    pub fn should_merge(&self, registry: &ClientRegistry, now: Instant) -> bool {
        match self {
            MergeTrigger::EveryMessage => true,
            MergeTrigger::Threshold(threshold) => registry.need_merge(*threshold, now),
        }
    }
}

/// Incremental merge state of one output file.
///
/// Resettable content is folded into the output once per arrival by
/// [`initial_merge`]. Additive content is derived state: every [`merge`]
/// drops it from the output and re-folds each client's latest container.
///
/// A snapshot that cannot be merged is rejected by [`accept`] before it
/// touches the output or the registry.
///
/// [`initial_merge`]: ParallelMerger::initial_merge
/// [`merge`]: ParallelMerger::merge
/// [`accept`]: ParallelMerger::accept
pub struct ParallelMerger {
    key: OutputKey,
    output: Container,
    registry: ClientRegistry,
    senders: FxHashMap<usize, ClientId>,
    merges: u64,
}

impl ParallelMerger {
    /// Creates (or truncates) the output file immediately so an unwritable
    /// destination fails before any snapshot is consumed.
    pub fn new(key: OutputKey, compression: Compression, memory_limit: Option<usize>, now: Instant) -> Result<Self, MergeError> {
        let output = Container::new(compression);
        output.persist(key.path()).map_err(|e| {
            MergeError::Configuration(format!("cannot create output {}: {}", key.path().display(), e))
        })?;
        let registry = ClientRegistry::new(key.path(), memory_limit, now);
        Ok(Self {
            key,
            output,
            registry,
            senders: FxHashMap::default(),
            merges: 0,
        })
    }

    pub fn key(&self) -> &OutputKey {
        &self.key
    }

    pub fn output(&self) -> &Container {
        &self.output
    }

    pub fn registry(&self) -> &ClientRegistry {
        &self.registry
    }

    pub fn merges(&self) -> u64 {
        self.merges
    }

    /// Fold `input`'s resettable entries into the output and strip them from `input`.
    pub fn initial_merge(&mut self, input: &mut Container) -> Result<MergeReport, MergeError> {
        let report = container::merge_into(&mut self.output, &[&*input], MergeOptions::resettable_only())?;
        input.strip(StripMode::Resettable);
        Ok(report)
    }

    pub fn register_client(&mut self, id: ClientId, container: Container, now: Instant) -> Result<(), MergeError> {
        self.registry.register_client(id, container, now)
    }

    /// Client id of row rank `source`: the one it registered with, or the next free one.
    pub fn client_for(&self, source: usize) -> ClientId {
        self.senders
            .get(&source)
            .copied()
            .unwrap_or(self.registry.len() as ClientId)
    }

    /// Fails if `input`, replacing client `id`'s container, would make the
    /// next merge pass fail.
    pub fn check_snapshot(&self, id: ClientId, input: &Container) -> Result<(), MergeError> {
        let evicted = self.registry.load_evicted()?;
        let mut sources: Vec<&Container> = self
            .registry
            .clients()
            .iter()
            .filter(|r| r.id() != id)
            .filter_map(|r| r.container())
            .collect();
        sources.extend(evicted.iter().filter(|(other, _)| *other != id).map(|(_, c)| c));
        sources.push(input);
        container::check_merge(&self.output, &sources, MergeOptions::rebuild())
    }

    /// Take one snapshot from row rank `source`. Returns whether a merge pass ran.
    ///
    /// On `MergeError::Merge` nothing was folded or registered and the sender
    /// keeps its previous contribution.
    pub fn accept(&mut self, source: usize, mut input: Container, trigger: MergeTrigger, now: Instant) -> Result<bool, MergeError> {
        let id = self.client_for(source);
        self.check_snapshot(id, &input)?;
        if container::needs_initial_merge(&input) {
            self.initial_merge(&mut input)?;
        }
        self.register_client(id, input, now)?;
        self.senders.insert(source, id);
        if trigger.should_merge(&self.registry, now) {
            self.merge(now)?;
            return Ok(true);
        }
        Ok(false)
    }

    /// Full pass: rebuild additive entries from every client, strip what must
    /// never be folded again, close the round and persist the output.
    pub fn merge(&mut self, now: Instant) -> Result<MergeReport, MergeError> {
        let evicted = self.registry.load_evicted()?;
        let report = {
            let mut sources: Vec<&Container> = self.registry.resident_containers().collect();
            sources.extend(evicted.iter().map(|(_, c)| c));
            container::merge_into(&mut self.output, &sources, MergeOptions::rebuild())?
        };
        let stripped = self.registry.strip_all(StripMode::Resettable, evicted)?;
        self.registry.reset_round(now);
        self.output.persist(self.key.path())?;
        self.merges += 1;
        debug!(
            "[merger] {} pass {}: {} sources, {} folded, {} created, {} stripped",
            self.key.path().display(),
            self.merges,
            report.sources,
            report.entries_folded,
            report.entries_created,
            stripped
        );
        Ok(report)
    }

    pub fn need_final_merge(&self) -> bool {
        self.registry.need_final_merge()
    }

    /// Run the last pass if needed, persist and drop client backups.
    pub fn finish(mut self, now: Instant) -> Result<(PathBuf, u64), MergeError> {
        if self.need_final_merge() {
            self.merge(now)?;
        } else {
            self.output.persist(self.key.path())?;
        }
        self.registry.remove_backups()?;
        Ok((self.key.0, self.merges))
    }
}
