//! Thread enumeration via `/proc/self/task`
//!
//! The scheduler walks threads through the [`ThreadCursor`] trait so its
//! scan logic can be exercised with a synthetic cursor in tests.

use std::fs;
use std::io;

use crate::domain::Tid;

/// Restartable iteration over the threads of interest.
///
/// `rewind` restarts iteration and is allowed to refresh the underlying
/// snapshot; `size` reports the current snapshot's cardinality and is only
/// an estimate of the live thread count.
pub trait ThreadCursor {
    fn next(&mut self) -> Option<Tid>;
    fn rewind(&mut self);
    fn size(&self) -> usize;
}

/// All threads of the current process, snapshotted from `/proc/self/task`.
///
/// Entries can go stale immediately (threads exit at any time); consumers
/// must treat every tid as possibly dead.
pub struct ProcessThreads {
    tids: Vec<Tid>,
    pos: usize,
}

impl ProcessThreads {
    /// Snapshot the current thread list.
    ///
    /// # Errors
    /// Returns an error if `/proc/self/task` cannot be read.
    pub fn new() -> io::Result<Self> {
        Ok(Self { tids: load_tids()?, pos: 0 })
    }
}

impl ThreadCursor for ProcessThreads {
    fn next(&mut self) -> Option<Tid> {
        let tid = self.tids.get(self.pos).copied();
        if tid.is_some() {
            self.pos += 1;
        }
        tid
    }

    /// Restart iteration over a fresh snapshot.
    ///
    /// Threads spawned since the last snapshot become visible here; on a
    /// read error the previous snapshot is kept rather than going empty.
    fn rewind(&mut self) {
        if let Ok(tids) = load_tids() {
            self.tids = tids;
        }
        self.pos = 0;
    }

    fn size(&self) -> usize {
        self.tids.len()
    }
}

fn load_tids() -> io::Result<Vec<Tid>> {
    let entries = fs::read_dir("/proc/self/task")?;
    let tids = entries
        .filter_map(|entry| {
            let entry = entry.ok()?;
            let tid = entry.file_name().to_string_lossy().parse::<i32>().ok()?;
            Some(Tid(tid))
        })
        .collect();
    Ok(tids)
}
