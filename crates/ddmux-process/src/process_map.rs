use std::collections::BTreeMap;
use std::sync::Arc;

use crate::device::ProcessIdList;
use crate::handle::ProcessHandle;

/// Pids that left and joined between two snapshots, both ascending.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct ProcessIdDelta {
    pub removed: Vec<u32>,
    pub added: Vec<u32>,
}

impl ProcessIdDelta {
    pub fn is_empty(&self) -> bool {
        self.removed.is_empty() && self.added.is_empty()
    }
}

/// Live process handles of one device, ordered by pid.
#[derive(Default)]
pub struct ProcessMap {
    handles: BTreeMap<u32, Arc<ProcessHandle>>,
}

impl ProcessMap {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.handles.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handles.is_empty()
    }

    pub fn contains(&self, pid: u32) -> bool {
        self.handles.contains_key(&pid)
    }

    pub fn get(&self, pid: u32) -> Option<&Arc<ProcessHandle>> {
        self.handles.get(&pid)
    }

    pub fn insert(&mut self, handle: Arc<ProcessHandle>) -> Option<Arc<ProcessHandle>> {
        self.handles.insert(handle.pid(), handle)
    }

    pub fn remove(&mut self, pid: u32) -> Option<Arc<ProcessHandle>> {
        self.handles.remove(&pid)
    }

    pub fn pids(&self) -> ProcessIdList {
        self.handles.keys().copied().collect()
    }

    pub fn delta(&self, next: &ProcessIdList) -> ProcessIdDelta {
        ProcessIdDelta {
            removed: self
                .handles
                .keys()
                .filter(|pid| !next.contains(pid))
                .copied()
                .collect(),
            added: next
                .iter()
                .filter(|pid| !self.handles.contains_key(pid))
                .copied()
                .collect(),
        }
    }

    /// Ordered snapshot for consumers.
    pub fn snapshot(&self) -> Vec<Arc<ProcessHandle>> {
        self.handles.values().cloned().collect()
    }
}
