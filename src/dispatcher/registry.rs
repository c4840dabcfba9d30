//! Registry of live machine handles
//!
//! Handles are owned exclusively here. They are stored by id (start order)
//! and indexed by the canonical key of their configuration path, so two
//! spellings of the same file find the same machine.

use std::collections::{BTreeMap, HashMap};
use std::path::{Component, Path, PathBuf};

use crate::machine::{Machine, MachineId};

/// Canonical form of a machine configuration path
///
/// Existing files are canonicalized (symlinks resolved). Paths that do not
/// exist are made absolute and normalized lexically.
pub fn machine_key(path: &Path) -> PathBuf {
    if let Ok(canonical) = std::fs::canonicalize(path) {
        return canonical;
    }

    let absolute = if path.is_absolute() {
        path.to_path_buf()
    } else {
        std::env::current_dir()
            .map(|cwd| cwd.join(path))
            .unwrap_or_else(|_| path.to_path_buf())
    };

    let mut normalized = PathBuf::new();
    for component in absolute.components() {
        match component {
            Component::CurDir => {}
            Component::ParentDir => {
                normalized.pop();
            }
            other => normalized.push(other),
        }
    }
    normalized
}

struct Entry {
    key: PathBuf,
    machine: Box<dyn Machine>,
    started_at: chrono::DateTime<chrono::Local>,
}

#[derive(Default)]
pub struct Registry {
    machines: BTreeMap<MachineId, Entry>,
    by_key: HashMap<PathBuf, Vec<MachineId>>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.machines.len()
    }

    pub fn is_empty(&self) -> bool {
        self.machines.is_empty()
    }

    pub fn insert(&mut self, id: MachineId, key: PathBuf, machine: Box<dyn Machine>) {
        self.by_key.entry(key.clone()).or_default().push(id);
        let entry = Entry {
            key,
            machine,
            started_at: chrono::Local::now(),
        };
        if self.machines.insert(id, entry).is_some() {
            log::warn!("machine {} registered twice", id);
        }
    }

    /// Remove a handle and hand it back to the caller
    pub fn remove(&mut self, id: MachineId) -> Option<Box<dyn Machine>> {
        let entry = self.machines.remove(&id)?;
        if let Some(ids) = self.by_key.get_mut(&entry.key) {
            ids.retain(|other| *other != id);
            if ids.is_empty() {
                self.by_key.remove(&entry.key);
            }
        }
        Some(entry.machine)
    }

    /// Earliest-started handle for a canonical key
    pub fn find(&self, key: &Path) -> Option<MachineId> {
        self.by_key.get(key).and_then(|ids| ids.first().copied())
    }

    /// Number of handles sharing a canonical key
    pub fn count_key(&self, key: &Path) -> usize {
        self.by_key.get(key).map_or(0, Vec::len)
    }

    pub fn get(&self, id: MachineId) -> Option<&dyn Machine> {
        self.machines.get(&id).map(|e| e.machine.as_ref())
    }

    pub fn get_mut(&mut self, id: MachineId) -> Option<&mut (dyn Machine + 'static)> {
        self.machines.get_mut(&id).map(|e| e.machine.as_mut())
    }

    pub fn started_at(&self, id: MachineId) -> Option<chrono::DateTime<chrono::Local>> {
        self.machines.get(&id).map(|e| e.started_at)
    }

    /// Handles in start order
    pub fn iter(&self) -> impl Iterator<Item = (MachineId, &dyn Machine)> {
        self.machines.iter().map(|(id, e)| (*id, e.machine.as_ref()))
    }

    /// Remove every handle, in start order
    pub fn drain(&mut self) -> Vec<(MachineId, Box<dyn Machine>)> {
        self.by_key.clear();
        std::mem::take(&mut self.machines)
            .into_iter()
            .map(|(id, e)| (id, e.machine))
            .collect()
    }
}
