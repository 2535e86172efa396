//! Hierarchical named-entry container used as the snapshot and output format.
//!
//! A container is a tree of directories whose leaves are [`Entry`] values.
//! Every entry is either *resettable* (cleared in the producer after each
//! shipment, so each snapshot carries only fresh content) or *additive*
//! (cumulative in the producer; the merged value is the sum of each
//! producer's latest value). The class is a property of the payload type and
//! is queried through [`is_resettable`].
//!
//! Wire format: `RMC1` magic, one compression byte, then the bincode-encoded
//! root directory (lz4 block when compression is enabled).

use crate::MergeError;
use bincode::{Decode, Encode};
use serde::Serialize;
use std::collections::BTreeMap;
use std::fs;
use std::path::Path;

pub const MAGIC: [u8; 4] = *b"RMC1";
const HEADER_LEN: usize = 5;
// lz4 cannot expand a block by more than this factor.
const MAX_LZ4_RATIO: usize = 255;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub enum Compression {
    #[default]
    None,
    Lz4,
}

impl Compression {
    fn flag(self) -> u8 {
        match self {
            Compression::None => 0,
            Compression::Lz4 => 1,
        }
    }

    fn from_flag(flag: u8) -> Option<Self> {
        match flag {
            0 => Some(Compression::None),
            1 => Some(Compression::Lz4),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum EntryKind {
    Resettable,
    Additive,
}

/// Append-only rows of numeric columns.
#[derive(Debug, Clone, PartialEq, Encode, Decode, Serialize)]
pub struct Table {
    pub columns: Vec<String>,
    pub rows: Vec<Vec<f64>>,
}

impl Table {
    pub fn new(columns: &[&str]) -> Self {
        Self {
            columns: columns.iter().map(|c| c.to_string()).collect(),
            rows: Vec::new(),
        }
    }

    pub fn push(&mut self, row: Vec<f64>) -> Result<(), MergeError> {
        if row.len() != self.columns.len() {
            return Err(MergeError::Other(format!(
                "row has {} values, table has {} columns",
                row.len(),
                self.columns.len()
            )));
        }
        self.rows.push(row);
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }
}

/// Fixed-binning histogram with under/overflow counters.
#[derive(Debug, Clone, PartialEq, Encode, Decode, Serialize)]
pub struct Histogram {
    pub low: f64,
    pub high: f64,
    pub bins: Vec<u64>,
    pub underflow: u64,
    pub overflow: u64,
}

impl Histogram {
    pub fn new(bins: usize, low: f64, high: f64) -> Self {
        Self {
            low,
            high,
            bins: vec![0; bins.max(1)],
            underflow: 0,
            overflow: 0,
        }
    }

    pub fn fill(&mut self, value: f64) {
        if value < self.low {
            self.underflow += 1;
        } else if value >= self.high {
            self.overflow += 1;
        } else {
            let width = (self.high - self.low) / self.bins.len() as f64;
            let idx = (((value - self.low) / width) as usize).min(self.bins.len() - 1);
            self.bins[idx] += 1;
        }
    }

    pub fn entries(&self) -> u64 {
        self.bins.iter().sum::<u64>() + self.underflow + self.overflow
    }

    fn same_binning(&self, other: &Histogram) -> bool {
        self.bins.len() == other.bins.len() && self.low == other.low && self.high == other.high
    }
}

/// Running summary of observed values.
#[derive(Debug, Clone, PartialEq, Encode, Decode, Serialize)]
pub struct Gauge {
    pub count: u64,
    pub sum: f64,
    pub min: f64,
    pub max: f64,
}

impl Gauge {
    pub fn new() -> Self {
        Self {
            count: 0,
            sum: 0.0,
            min: f64::INFINITY,
            max: f64::NEG_INFINITY,
        }
    }

    pub fn observe(&mut self, value: f64) {
        self.count += 1;
        self.sum += value;
        self.min = self.min.min(value);
        self.max = self.max.max(value);
    }
}

impl Default for Gauge {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug, Clone, PartialEq, Encode, Decode, Serialize)]
pub enum Payload {
    Table(Table),
    Counter(u64),
    Histogram(Histogram),
    Gauge(Gauge),
}

impl Payload {
    pub fn kind(&self) -> EntryKind {
        match self {
            Payload::Table(_) | Payload::Counter(_) => EntryKind::Resettable,
            Payload::Histogram(_) | Payload::Gauge(_) => EntryKind::Additive,
        }
    }

    fn type_name(&self) -> &'static str {
        match self {
            Payload::Table(_) => "table",
            Payload::Counter(_) => "counter",
            Payload::Histogram(_) => "histogram",
            Payload::Gauge(_) => "gauge",
        }
    }

    fn check_compatible(&self, other: &Payload) -> Result<(), String> {
        match (self, other) {
            (Payload::Table(a), Payload::Table(b)) if a.columns != b.columns => Err(format!(
                "table columns differ: {:?} vs {:?}",
                a.columns, b.columns
            )),
            (Payload::Histogram(a), Payload::Histogram(b)) if !a.same_binning(b) => Err(format!(
                "histogram binning differs: {}x[{}, {}) vs {}x[{}, {})",
                a.bins.len(),
                a.low,
                a.high,
                b.bins.len(),
                b.low,
                b.high
            )),
            (a, b) if std::mem::discriminant(a) != std::mem::discriminant(b) => Err(format!(
                "cannot merge {} into {}",
                b.type_name(),
                a.type_name()
            )),
            _ => Ok(()),
        }
    }

    /// Caller must have checked compatibility.
    fn absorb(&mut self, other: &Payload) {
        match (self, other) {
            (Payload::Table(a), Payload::Table(b)) => a.rows.extend(b.rows.iter().cloned()),
            (Payload::Counter(a), Payload::Counter(b)) => *a += *b,
            (Payload::Histogram(a), Payload::Histogram(b)) => {
                for (dst, src) in a.bins.iter_mut().zip(&b.bins) {
                    *dst += *src;
                }
                a.underflow += b.underflow;
                a.overflow += b.overflow;
            }
            (Payload::Gauge(a), Payload::Gauge(b)) => {
                a.count += b.count;
                a.sum += b.sum;
                a.min = a.min.min(b.min);
                a.max = a.max.max(b.max);
            }
            _ => {}
        }
    }

    fn footprint(&self) -> usize {
        let data = match self {
            Payload::Table(t) => t.rows.len() * t.columns.len() * 8 + t.columns.iter().map(String::len).sum::<usize>(),
            Payload::Counter(_) => 8,
            Payload::Histogram(h) => h.bins.len() * 8 + 32,
            Payload::Gauge(_) => 32,
        };
        data + std::mem::size_of::<Payload>()
    }

    fn reset(&mut self) {
        match self {
            Payload::Table(t) => t.rows.clear(),
            Payload::Counter(c) => *c = 0,
            Payload::Histogram(h) => {
                h.bins.iter_mut().for_each(|b| *b = 0);
                h.underflow = 0;
                h.overflow = 0;
            }
            Payload::Gauge(g) => *g = Gauge::new(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Encode, Decode, Serialize)]
pub struct Entry {
    pub title: String,
    pub payload: Payload,
}

impl Entry {
    pub fn new(title: &str, payload: Payload) -> Self {
        Self {
            title: title.to_string(),
            payload,
        }
    }

    pub fn kind(&self) -> EntryKind {
        self.payload.kind()
    }
}

/// Whether `entry` is cleared by its producer after every shipment.
pub fn is_resettable(entry: &Entry) -> bool {
    entry.kind() == EntryKind::Resettable
}

#[derive(Debug, Clone, PartialEq, Encode, Decode, Serialize)]
pub enum Node {
    Dir(Directory),
    Entry(Entry),
}

#[derive(Debug, Clone, Default, PartialEq, Encode, Decode, Serialize)]
pub struct Directory {
    nodes: BTreeMap<String, Node>,
}

impl Directory {
    pub fn nodes(&self) -> impl Iterator<Item = (&String, &Node)> {
        self.nodes.iter()
    }

    fn find(&self, parts: &[&str]) -> Option<&Node> {
        let (first, rest) = parts.split_first()?;
        let node = self.nodes.get(*first)?;
        if rest.is_empty() {
            return Some(node);
        }
        match node {
            Node::Dir(dir) => dir.find(rest),
            Node::Entry(_) => None,
        }
    }

    fn find_mut(&mut self, parts: &[&str]) -> Option<&mut Node> {
        let (first, rest) = parts.split_first()?;
        let node = self.nodes.get_mut(*first)?;
        if rest.is_empty() {
            return Some(node);
        }
        match node {
            Node::Dir(dir) => dir.find_mut(rest),
            Node::Entry(_) => None,
        }
    }

    fn ensure_dir(&mut self, parts: &[&str]) -> Result<&mut Directory, MergeError> {
        let Some((first, rest)) = parts.split_first() else {
            return Ok(self);
        };
        let node = self
            .nodes
            .entry(first.to_string())
            .or_insert_with(|| Node::Dir(Directory::default()));
        match node {
            Node::Dir(dir) => dir.ensure_dir(rest),
            Node::Entry(_) => Err(MergeError::Other(format!("'{}' is an entry, not a directory", first))),
        }
    }

    fn visit<'a>(&'a self, prefix: &str, f: &mut dyn FnMut(String, &'a Entry)) {
        for (name, node) in &self.nodes {
            let path = join(prefix, name);
            match node {
                Node::Dir(dir) => dir.visit(&path, f),
                Node::Entry(entry) => f(path, entry),
            }
        }
    }

    fn any(&self, pred: &dyn Fn(&Entry) -> bool) -> bool {
        self.nodes.values().any(|node| match node {
            Node::Dir(dir) => dir.any(pred),
            Node::Entry(entry) => pred(entry),
        })
    }

    fn remove_where(&mut self, pred: &dyn Fn(&Entry) -> bool) -> usize {
        let mut removed = 0;
        self.nodes.retain(|_, node| match node {
            Node::Dir(dir) => {
                removed += dir.remove_where(pred);
                true
            }
            Node::Entry(entry) => {
                if pred(entry) {
                    removed += 1;
                    false
                } else {
                    true
                }
            }
        });
        removed
    }

    fn for_each_entry_mut(&mut self, f: &mut dyn FnMut(&mut Entry)) {
        for node in self.nodes.values_mut() {
            match node {
                Node::Dir(dir) => dir.for_each_entry_mut(f),
                Node::Entry(entry) => f(entry),
            }
        }
    }
}

fn join(prefix: &str, name: &str) -> String {
    if prefix.is_empty() {
        name.to_string()
    } else {
        format!("{}/{}", prefix, name)
    }
}

fn split_path(path: &str) -> Vec<&str> {
    path.split('/').filter(|p| !p.is_empty()).collect()
}

/// Which entries a merge folds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MergeScope {
    ResettableOnly,
    AdditiveOnly,
    AllIncremental,
}

impl MergeScope {
    fn includes(self, entry: &Entry) -> bool {
        match self {
            MergeScope::ResettableOnly => is_resettable(entry),
            MergeScope::AdditiveOnly => !is_resettable(entry),
            MergeScope::AllIncremental => true,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MergeOptions {
    pub scope: MergeScope,
    /// Destination keeps its own compression instead of adopting the first source's.
    pub keep_compression: bool,
    /// Drop the destination's additive entries before folding, once the
    /// merge is known to succeed.
    pub rebuild_additive: bool,
}

impl MergeOptions {
    pub fn resettable_only() -> Self {
        Self {
            scope: MergeScope::ResettableOnly,
            keep_compression: true,
            rebuild_additive: false,
        }
    }

    pub fn all_incremental() -> Self {
        Self {
            scope: MergeScope::AllIncremental,
            keep_compression: true,
            rebuild_additive: false,
        }
    }

    /// A full pass: additive entries are recomputed from the sources.
    pub fn rebuild() -> Self {
        Self {
            rebuild_additive: true,
            ..Self::all_incremental()
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MergeReport {
    pub sources: usize,
    pub entries_folded: usize,
    pub entries_created: usize,
}

/// Which class of entries [`Container::strip`] removes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StripMode {
    Resettable,
    Additive,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct Container {
    root: Directory,
    compression: Compression,
}

impl Container {
    pub fn new(compression: Compression) -> Self {
        Self {
            root: Directory::default(),
            compression,
        }
    }

    pub fn compression(&self) -> Compression {
        self.compression
    }

    pub fn set_compression(&mut self, compression: Compression) {
        self.compression = compression;
    }

    pub fn root(&self) -> &Directory {
        &self.root
    }

    /// Insert or replace the entry at `path`, creating parent directories.
    pub fn put(&mut self, path: &str, entry: Entry) -> Result<(), MergeError> {
        let parts = split_path(path);
        let Some((name, parents)) = parts.split_last() else {
            return Err(MergeError::Other("empty entry path".to_string()));
        };
        let dir = self.root.ensure_dir(parents)?;
        if let Some(Node::Dir(_)) = dir.nodes.get(*name) {
            return Err(MergeError::Other(format!("'{}' is a directory", path)));
        }
        dir.nodes.insert(name.to_string(), Node::Entry(entry));
        Ok(())
    }

    pub fn mkdir(&mut self, path: &str) -> Result<(), MergeError> {
        self.root.ensure_dir(&split_path(path)).map(|_| ())
    }

    pub fn get(&self, path: &str) -> Option<&Entry> {
        match self.root.find(&split_path(path))? {
            Node::Entry(entry) => Some(entry),
            Node::Dir(_) => None,
        }
    }

    pub fn get_mut(&mut self, path: &str) -> Option<&mut Entry> {
        match self.root.find_mut(&split_path(path))? {
            Node::Entry(entry) => Some(entry),
            Node::Dir(_) => None,
        }
    }

    pub fn remove(&mut self, path: &str) -> Option<Entry> {
        let parts = split_path(path);
        let (name, parents) = parts.split_last()?;
        let dir = if parents.is_empty() {
            &mut self.root
        } else {
            match self.root.find_mut(parents)? {
                Node::Dir(dir) => dir,
                Node::Entry(_) => return None,
            }
        };
        if !matches!(dir.nodes.get(*name)?, Node::Entry(_)) {
            return None;
        }
        match dir.nodes.remove(*name)? {
            Node::Entry(entry) => Some(entry),
            Node::Dir(_) => None,
        }
    }

    /// All entries with their slash-separated paths, depth first in name order.
    pub fn entries(&self) -> Vec<(String, &Entry)> {
        let mut out = Vec::new();
        self.root.visit("", &mut |path, entry| out.push((path, entry)));
        out
    }

    pub fn len(&self) -> usize {
        self.entries().len()
    }

    pub fn is_empty(&self) -> bool {
        !self.root.any(&|_| true)
    }

    /// Approximate in-memory size of the entry data.
    pub fn footprint(&self) -> usize {
        self.entries()
            .iter()
            .map(|(path, entry)| path.len() + entry.title.len() + entry.payload.footprint())
            .sum()
    }

    pub fn has_resettable(&self) -> bool {
        self.root.any(&is_resettable)
    }

    /// Remove every entry of the given class; returns how many were removed.
    pub fn strip(&mut self, mode: StripMode) -> usize {
        match mode {
            StripMode::Resettable => self.root.remove_where(&is_resettable),
            StripMode::Additive => self.root.remove_where(&|e| !is_resettable(e)),
        }
    }

    /// Clear the content of resettable entries, keeping the entries themselves.
    pub fn reset_resettable(&mut self) {
        self.root.for_each_entry_mut(&mut |entry| {
            if is_resettable(entry) {
                entry.payload.reset();
            }
        });
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>, MergeError> {
        let body = bincode::encode_to_vec(&self.root, bincode::config::standard())?;
        let body = match self.compression {
            Compression::None => body,
            Compression::Lz4 => lz4_flex::compress_prepend_size(&body),
        };
        let mut out = Vec::with_capacity(HEADER_LEN + body.len());
        out.extend_from_slice(&MAGIC);
        out.push(self.compression.flag());
        out.extend_from_slice(&body);
        Ok(out)
    }

    /// Open a serialized container; any structural problem is an error.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, MergeError> {
        if bytes.len() < HEADER_LEN || bytes[..4] != MAGIC {
            return Err(MergeError::Other("missing container magic".to_string()));
        }
        let compression = Compression::from_flag(bytes[4])
            .ok_or_else(|| MergeError::Other(format!("unknown compression flag {}", bytes[4])))?;
        let body = &bytes[HEADER_LEN..];
        let decompressed;
        let body = match compression {
            Compression::None => body,
            Compression::Lz4 => {
                check_lz4_size(body)?;
                decompressed = lz4_flex::decompress_size_prepended(body)
                    .map_err(|e| MergeError::Other(format!("lz4: {}", e)))?;
                &decompressed[..]
            }
        };
        let (root, read): (Directory, usize) = bincode::decode_from_slice(body, bincode::config::standard())?;
        if read != body.len() {
            return Err(MergeError::Other(format!(
                "{} trailing bytes after container body",
                body.len() - read
            )));
        }
        Ok(Self { root, compression })
    }

    /// Write atomically: temp file in the same directory, then rename.
    pub fn persist(&self, path: &Path) -> Result<(), MergeError> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)?;
            }
        }
        let mut tmp = path.as_os_str().to_owned();
        tmp.push(".tmp");
        fs::write(&tmp, self.to_bytes()?)?;
        fs::rename(&tmp, path)?;
        Ok(())
    }

    pub fn load(path: &Path) -> Result<Self, MergeError> {
        let bytes = fs::read(path)?;
        Self::from_bytes(&bytes)
    }
}

fn check_lz4_size(body: &[u8]) -> Result<(), MergeError> {
    if body.len() < 4 {
        return Err(MergeError::Other("truncated lz4 block".to_string()));
    }
    let declared = u32::from_le_bytes([body[0], body[1], body[2], body[3]]) as usize;
    if declared > (body.len() - 4).saturating_mul(MAX_LZ4_RATIO) + 64 {
        return Err(MergeError::Other(format!("implausible lz4 size {}", declared)));
    }
    Ok(())
}

/// Whether `container` holds resettable entries that have not been folded yet.
pub fn needs_initial_merge(container: &Container) -> bool {
    container.has_resettable()
}

fn conflict(path: &str, reason: impl std::fmt::Display) -> MergeError {
    MergeError::Merge(format!("{}: {}", path, reason))
}

/// Check that folding `sources` into `dest` with `options` cannot fail.
///
/// With `rebuild_additive`, the destination's additive entries are treated
/// as already dropped.
pub fn check_merge(dest: &Container, sources: &[&Container], options: MergeOptions) -> Result<(), MergeError> {
    let ignored = |entry: &Entry| options.rebuild_additive && !is_resettable(entry);
    let mut templates: BTreeMap<String, &Payload> = BTreeMap::new();
    for source in sources {
        for (path, entry) in source.entries() {
            if !options.scope.includes(entry) {
                continue;
            }
            if let Some(template) = templates.get(&path) {
                template.check_compatible(&entry.payload).map_err(|e| conflict(&path, e))?;
                continue;
            }

            let parts = split_path(&path);
            for depth in 1..parts.len() {
                let parent = parts[..depth].join("/");
                if templates.contains_key(&parent) {
                    return Err(conflict(&path, format!("'{}' is an entry in another source", parent)));
                }
                if let Some(Node::Entry(existing)) = dest.root.find(&parts[..depth]) {
                    if !ignored(existing) {
                        return Err(conflict(&path, format!("'{}' is an entry in the destination", parent)));
                    }
                }
            }
            let below = format!("{}/", path);
            if let Some((child, _)) = templates.range(below.clone()..).next() {
                if child.starts_with(&below) {
                    return Err(conflict(&path, format!("'{}' needs it as a directory", child)));
                }
            }

            match dest.root.find(&parts) {
                Some(Node::Entry(existing)) if !ignored(existing) => {
                    existing.payload.check_compatible(&entry.payload).map_err(|e| conflict(&path, e))?;
                }
                Some(Node::Dir(_)) => return Err(conflict(&path, "directory in destination")),
                _ => {}
            }
            templates.insert(path, &entry.payload);
        }
    }
    Ok(())
}

/// Fold the in-scope entries of `sources` into `dest`.
///
/// Everything is validated by [`check_merge`] before `dest` is touched, so a
/// failed merge leaves it exactly as it was.
pub fn merge_into(dest: &mut Container, sources: &[&Container], options: MergeOptions) -> Result<MergeReport, MergeError> {
    check_merge(dest, sources, options)?;
    if options.rebuild_additive {
        dest.strip(StripMode::Additive);
    }

    let mut report = MergeReport {
        sources: sources.len(),
        ..MergeReport::default()
    };
    for source in sources {
        for (path, entry) in source.entries() {
            if !options.scope.includes(entry) {
                continue;
            }
            match dest.get_mut(&path) {
                Some(existing) => {
                    existing.payload.absorb(&entry.payload);
                    report.entries_folded += 1;
                }
                None => {
                    dest.put(&path, entry.clone()).map_err(|e| MergeError::Merge(e.to_string()))?;
                    report.entries_created += 1;
                }
            }
        }
    }

    if !options.keep_compression {
        if let Some(first) = sources.first() {
            dest.compression = first.compression;
        }
    }
    Ok(report)
}
