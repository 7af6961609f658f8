//! Active-runtime table: data root name to the runtime serving it.
//!
//! A name is either free, reserved by an in-flight launch, or running.
//! [`RuntimeTable::begin_launch`] is the only way to reserve a name, so two
//! launches for the same data root can never both spawn.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use serde::Serialize;
use tracing::{debug, info};

use crate::admin::{AdminApi, InstalledApp};
use crate::data_root::{DataRoot, RuntimeMode};
use crate::error::{LauncherError, LauncherResult};
use crate::supervisor::Supervisor;

/// Public description of a runtime that reached readiness.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RunningRuntime {
    pub mode: RuntimeMode,
    pub data_root: DataRoot,
    pub admin_port: u16,
    pub endpoint: String,
}

/// Everything the table owns for one running data root.
pub struct RuntimeEntry {
    pub info: RunningRuntime,
    /// `None` when the runtime is run by someone else.
    pub supervisor: Option<Supervisor>,
    pub admin: Arc<dyn AdminApi>,
    pub apps: Vec<InstalledApp>,
}

impl std::fmt::Debug for RuntimeEntry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RuntimeEntry")
            .field("info", &self.info)
            .field("supervisor", &self.supervisor)
            .field("apps", &self.apps.len())
            .finish()
    }
}

enum Slot {
    Launching,
    Running(RuntimeEntry),
}

type Slots = Mutex<BTreeMap<String, Slot>>;

fn lock(slots: &Slots) -> MutexGuard<'_, BTreeMap<String, Slot>> {
    slots.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Drop the entry for `name` if the process it owns has exited.
fn evict_exited(slots: &mut BTreeMap<String, Slot>, name: &str) {
    let exited = match slots.get_mut(name) {
        Some(Slot::Running(entry)) => entry
            .supervisor
            .as_mut()
            .is_some_and(|supervisor| !supervisor.is_running()),
        _ => false,
    };
    if exited {
        slots.remove(name);
        info!(data_root = name, "runtime exited, entry evicted");
    }
}

/// Shared handle to the table; clones see the same entries.
#[derive(Clone, Default)]
pub struct RuntimeTable {
    slots: Arc<Slots>,
}

impl std::fmt::Debug for RuntimeTable {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RuntimeTable")
            .field("names", &self.names())
            .finish()
    }
}

impl RuntimeTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Reserve `name` for a launch.
    ///
    /// Fails with [`LauncherError::AlreadyLaunching`] while another launch
    /// holds the name and [`LauncherError::AlreadyRunning`] while its
    /// process is alive. An entry whose process has exited is replaced.
    pub fn begin_launch(&self, name: &str) -> LauncherResult<LaunchTicket> {
        let mut slots = lock(&self.slots);
        evict_exited(&mut slots, name);
        match slots.get(name) {
            Some(Slot::Launching) => return Err(LauncherError::AlreadyLaunching(name.to_string())),
            Some(Slot::Running(_)) => return Err(LauncherError::AlreadyRunning(name.to_string())),
            None => {}
        }
        slots.insert(name.to_string(), Slot::Launching);
        debug!(data_root = name, "launch reserved");
        Ok(LaunchTicket {
            name: name.to_string(),
            slots: Arc::clone(&self.slots),
            completed: false,
        })
    }

    pub fn get(&self, name: &str) -> Option<RunningRuntime> {
        let mut slots = lock(&self.slots);
        evict_exited(&mut slots, name);
        match slots.get(name) {
            Some(Slot::Running(entry)) => Some(entry.info.clone()),
            _ => None,
        }
    }

    pub fn is_launching(&self, name: &str) -> bool {
        matches!(lock(&self.slots).get(name), Some(Slot::Launching))
    }

    /// Admin client of a running data root.
    pub fn admin(&self, name: &str) -> LauncherResult<Arc<dyn AdminApi>> {
        let mut slots = lock(&self.slots);
        evict_exited(&mut slots, name);
        match slots.get(name) {
            Some(Slot::Running(entry)) => Ok(Arc::clone(&entry.admin)),
            _ => Err(LauncherError::UnknownDataRoot(name.to_string())),
        }
    }

    /// Names of running data roots, sorted.
    pub fn names(&self) -> Vec<String> {
        lock(&self.slots)
            .iter()
            .filter(|(_, slot)| matches!(slot, Slot::Running(_)))
            .map(|(name, _)| name.clone())
            .collect()
    }

    pub fn running(&self) -> Vec<RunningRuntime> {
        lock(&self.slots)
            .values()
            .filter_map(|slot| match slot {
                Slot::Running(entry) => Some(entry.info.clone()),
                Slot::Launching => None,
            })
            .collect()
    }

    /// Take a running entry out of the table. The caller owns its process.
    pub fn remove(&self, name: &str) -> Option<RuntimeEntry> {
        let mut slots = lock(&self.slots);
        if !matches!(slots.get(name), Some(Slot::Running(_))) {
            return None;
        }
        match slots.remove(name) {
            Some(Slot::Running(entry)) => Some(entry),
            _ => None,
        }
    }

    /// Replace the cached app list of a running root.
    pub fn update_apps(&self, name: &str, apps: Vec<InstalledApp>) -> LauncherResult<()> {
        match lock(&self.slots).get_mut(name) {
            Some(Slot::Running(entry)) => {
                debug!(data_root = name, apps = apps.len(), "app cache refreshed");
                entry.apps = apps;
                Ok(())
            }
            _ => Err(LauncherError::UnknownDataRoot(name.to_string())),
        }
    }

    pub fn apps(&self, name: &str) -> LauncherResult<Vec<InstalledApp>> {
        match lock(&self.slots).get(name) {
            Some(Slot::Running(entry)) => Ok(entry.apps.clone()),
            _ => Err(LauncherError::UnknownDataRoot(name.to_string())),
        }
    }

    /// Every cached app with the runtime hosting it, ordered by root name.
    pub fn all_apps(&self) -> Vec<(RunningRuntime, InstalledApp)> {
        lock(&self.slots)
            .values()
            .filter_map(|slot| match slot {
                Slot::Running(entry) => Some(entry),
                Slot::Launching => None,
            })
            .flat_map(|entry| entry.apps.iter().map(|app| (entry.info.clone(), app.clone())))
            .collect()
    }

    /// Signal one root's runtime process and unregister it.
    pub fn terminate(&self, name: &str) -> LauncherResult<bool> {
        let mut entry = self
            .remove(name)
            .ok_or_else(|| LauncherError::UnknownDataRoot(name.to_string()))?;
        let signalled = entry.supervisor.as_mut().is_some_and(Supervisor::terminate);
        info!(data_root = name, signalled, "runtime terminated");
        Ok(signalled)
    }

    /// Empty the table, signalling every owned runtime. Returns how many
    /// processes were signalled.
    pub fn terminate_all(&self) -> usize {
        let drained: Vec<(String, Slot)> = std::mem::take(&mut *lock(&self.slots)).into_iter().collect();
        let mut signalled = 0;
        for (name, slot) in drained {
            let Slot::Running(mut entry) = slot else {
                continue;
            };
            if entry.supervisor.as_mut().is_some_and(Supervisor::terminate) {
                info!(data_root = %name, "runtime terminated");
                signalled += 1;
            }
        }
        signalled
    }
}

/// Reservation of a data root name for one launch.
///
/// Dropping the ticket without calling [`LaunchTicket::complete`] frees
/// the name again.
#[must_use = "dropping the ticket releases the reservation"]
pub struct LaunchTicket {
    name: String,
    slots: Arc<Slots>,
    completed: bool,
}

impl LaunchTicket {
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Register the launched runtime under the reserved name.
    pub fn complete(mut self, entry: RuntimeEntry) -> RunningRuntime {
        let info = entry.info.clone();
        lock(&self.slots).insert(self.name.clone(), Slot::Running(entry));
        self.completed = true;
        info!(data_root = %self.name, endpoint = %info.endpoint, "runtime registered");
        info
    }
}

impl Drop for LaunchTicket {
    fn drop(&mut self) {
        if self.completed {
            return;
        }
        let mut slots = lock(&self.slots);
        if matches!(slots.get(&self.name), Some(Slot::Launching)) {
            slots.remove(&self.name);
            debug!(data_root = %self.name, "launch reservation released");
        }
    }
}
