use crate::transport::Communicator;
use crate::MergeError;
use std::ops::Range;
use std::path::{Path, PathBuf};
use tracing::info;

/// Row rank of the collector in every row.
pub const COLLECTOR_RANK: usize = 0;

/// Assignment of global ranks to rows.
///
/// With `split == 0` the whole world is one row. Otherwise the world is cut
/// into `split` contiguous rows whose sizes differ by at most one; the first
/// `global_size % split` rows carry the extra rank.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RowLayout {
    global_size: usize,
    rows: usize,
    base: usize,
    larger: usize,
}

impl RowLayout {
    pub fn compute(global_size: usize, split: usize) -> Result<Self, MergeError> {
        if global_size == 0 {
            return Err(MergeError::Configuration("process group is empty".to_string()));
        }
        if split == 0 {
            return Ok(Self {
                global_size,
                rows: 1,
                base: global_size,
                larger: 0,
            });
        }
        if 2 * split > global_size {
            return Err(MergeError::Configuration(format!(
                "{} outputs need at least {} processes (one collector and one worker each), got {}",
                split,
                2 * split,
                global_size
            )));
        }
        Ok(Self {
            global_size,
            rows: split,
            base: global_size / split,
            larger: global_size % split,
        })
    }

    pub fn global_size(&self) -> usize {
        self.global_size
    }

    pub fn row_count(&self) -> usize {
        self.rows
    }

    pub fn color_of(&self, global_rank: usize) -> u32 {
        let big_span = self.larger * (self.base + 1);
        let color = if global_rank < big_span {
            global_rank / (self.base + 1)
        } else {
            self.larger + (global_rank - big_span) / self.base
        };
        color as u32
    }

    /// Global ranks belonging to `color`.
    pub fn members(&self, color: u32) -> Range<usize> {
        let color = color as usize;
        let start = color * self.base + color.min(self.larger);
        let len = self.base + usize::from(color < self.larger);
        start..(start + len).min(self.global_size)
    }

    pub fn row_size_of(&self, color: u32) -> usize {
        self.members(color).len()
    }
}

/// One rank's view of its row. Passed explicitly to every protocol operation.
pub struct RowContext<C: Communicator> {
    comm: C,
    color: u32,
    global_rank: usize,
    global_size: usize,
}

impl<C: Communicator> RowContext<C> {
    pub fn new(comm: C, color: u32, global_rank: usize, global_size: usize) -> Self {
        Self {
            comm,
            color,
            global_rank,
            global_size,
        }
    }

    pub fn comm(&self) -> &C {
        &self.comm
    }

    pub fn comm_mut(&mut self) -> &mut C {
        &mut self.comm
    }

    pub fn color(&self) -> u32 {
        self.color
    }

    pub fn row_rank(&self) -> usize {
        self.comm.rank()
    }

    pub fn row_size(&self) -> usize {
        self.comm.size()
    }

    pub fn worker_count(&self) -> usize {
        self.row_size().saturating_sub(1)
    }

    pub fn global_rank(&self) -> usize {
        self.global_rank
    }

    pub fn global_size(&self) -> usize {
        self.global_size
    }

    pub fn is_collector(&self) -> bool {
        self.row_rank() == COLLECTOR_RANK
    }

    /// Send tag used by workers of this row.
    pub fn tag(&self) -> i32 {
        self.color as i32
    }

    /// Output file of this row: `<stem>_<color>.<ext>` next to `pattern`.
    pub fn output_path(&self, pattern: &Path) -> PathBuf {
        output_path_for(pattern, self.color)
    }
}

pub fn output_path_for(pattern: &Path, color: u32) -> PathBuf {
    let stem = pattern
        .file_stem()
        .map(|s| s.to_string_lossy().to_string())
        .unwrap_or_else(|| "output".to_string());
    let name = match pattern.extension() {
        Some(ext) => format!("{}_{}.{}", stem, color, ext.to_string_lossy()),
        None => format!("{}_{}", stem, color),
    };
    pattern.with_file_name(name)
}

/// Collective over `world`: every rank must call this once with the same `split`.
pub fn partition<C: Communicator>(world: &C, split: usize) -> Result<RowContext<C>, MergeError> {
    let layout = RowLayout::compute(world.size(), split)?;
    let global_rank = world.rank();
    let color = layout.color_of(global_rank);
    let row = world.split(color, global_rank)?;
    if global_rank == 0 {
        info!(
            "[partition] {} ranks into {} row(s), row sizes {}..={}",
            layout.global_size(),
            layout.row_count(),
            layout.row_size_of(layout.row_count() as u32 - 1),
            layout.row_size_of(0)
        );
    }
    Ok(RowContext::new(row, color, global_rank, world.size()))
}
