use crate::container::{Compression, Container, EntryKind, Payload};
use crate::MergeError;
use serde::Serialize;
use std::fmt::Write as _;
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, Serialize)]
pub struct EntrySummary {
    pub path: String,
    pub title: String,
    pub kind: EntryKind,
    pub detail: String,
}

/// Human and JSON view of a container file.
#[derive(Debug, Clone, Serialize)]
pub struct InspectReport {
    pub file: PathBuf,
    pub compression: Compression,
    pub entries: Vec<EntrySummary>,
}

pub fn inspect(path: &Path) -> Result<InspectReport, MergeError> {
    let container = Container::load(path)?;
    Ok(InspectReport::from_container(path, &container))
}

fn describe(payload: &Payload) -> String {
    match payload {
        Payload::Table(t) => format!("{} rows x {} columns {:?}", t.len(), t.columns.len(), t.columns),
        Payload::Counter(n) => format!("count {}", n),
        Payload::Histogram(h) => format!(
            "{} bins [{}, {}) entries {} (under {}, over {})",
            h.bins.len(),
            h.low,
            h.high,
            h.entries(),
            h.underflow,
            h.overflow
        ),
        Payload::Gauge(g) if g.count == 0 => "empty".to_string(),
        Payload::Gauge(g) => format!(
            "n {} mean {:.4} min {:.4} max {:.4}",
            g.count,
            g.sum / g.count as f64,
            g.min,
            g.max
        ),
    }
}

impl InspectReport {
    pub fn from_container(path: &Path, container: &Container) -> Self {
        let entries = container
            .entries()
            .into_iter()
            .map(|(path, entry)| EntrySummary {
                path,
                title: entry.title.clone(),
                kind: entry.kind(),
                detail: describe(&entry.payload),
            })
            .collect();
        Self {
            file: path.to_path_buf(),
            compression: container.compression(),
            entries,
        }
    }

    pub fn to_text(&self) -> String {
        let mut out = format!(
            "{} ({:?}, {} entries)\n",
            self.file.display(),
            self.compression,
            self.entries.len()
        );
        for e in &self.entries {
            let kind = format!("{:?}", e.kind);
            let _ = writeln!(out, "  {:<24} {:<10} {:<12} {}", e.path, kind, e.title, e.detail);
        }
        out
    }

    pub fn to_json(&self) -> Result<String, MergeError> {
        serde_json::to_string_pretty(self).map_err(|e| MergeError::Other(format!("json: {}", e)))
    }
}
