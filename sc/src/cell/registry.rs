//! Name registry for cells
//!
//! Maps a name to a live cell. Entries hold weak handles, so a registered
//! linked cell still terminates once its last handle is dropped.

use std::any::Any;
use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, OnceLock, PoisonError};

use tokio::sync::watch;
use tracing::debug;

use super::core::CellStatus;
use super::handle::{CellId, StateCell, WeakCell};
use super::messages::StartError;

struct Entry {
    id: CellId,
    status: watch::Receiver<CellStatus>,
    /// A `WeakCell<S>` for the cell's state type
    cell: Box<dyn Any + Send + Sync>,
}

impl Entry {
    fn is_live(&self) -> bool {
        !self.status.borrow().is_terminated()
    }
}

/// Name to cell map shared by clones
#[derive(Clone, Default)]
pub struct Registry {
    entries: Arc<Mutex<HashMap<String, Entry>>>,
}

impl fmt::Debug for Registry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Registry").field("names", &self.names()).finish()
    }
}

static GLOBAL: OnceLock<Registry> = OnceLock::new();

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    /// The process-wide registry used when options name none
    pub fn global() -> &'static Registry {
        GLOBAL.get_or_init(Registry::new)
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, Entry>> {
        self.entries.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Claim `name` for `cell`
    ///
    /// Entries whose cell has terminated (or whose linked cell lost every
    /// handle) are replaced.
    pub(crate) fn register<S: 'static>(&self, name: &str, cell: &StateCell<S>) -> Result<(), StartError<S>> {
        debug!(%name, cell = %cell.id(), "Registry::register: called");
        let mut entries = self.lock();

        if let Some(entry) = entries.get(name)
            && entry.is_live()
        {
            match entry.cell.downcast_ref::<WeakCell<S>>() {
                Some(weak) => {
                    if let Some(existing) = weak.upgrade() {
                        return Err(StartError::AlreadyStarted(existing));
                    }
                }
                None => {
                    return Err(StartError::NameInUse {
                        name: name.to_string(),
                        id: entry.id,
                    });
                }
            }
        }

        entries.insert(
            name.to_string(),
            Entry {
                id: cell.id(),
                status: cell.status_receiver(),
                cell: Box::new(cell.downgrade()),
            },
        );
        Ok(())
    }

    /// Release `name` if it still belongs to cell `id`
    pub(crate) fn unregister(&self, name: &str, id: CellId) -> bool {
        debug!(%name, %id, "Registry::unregister: called");
        let mut entries = self.lock();
        match entries.get(name) {
            Some(entry) if entry.id == id => {
                entries.remove(name);
                true
            }
            _ => false,
        }
    }

    /// Resolve a live cell registered under `name`
    ///
    /// Returns `None` when the name is free, the cell is gone, or the cell
    /// holds a different state type.
    pub fn whereis<S: 'static>(&self, name: &str) -> Option<StateCell<S>> {
        debug!(%name, "Registry::whereis: called");
        let entries = self.lock();
        let entry = entries.get(name)?;
        if !entry.is_live() {
            return None;
        }
        entry.cell.downcast_ref::<WeakCell<S>>()?.upgrade()
    }

    /// Names currently registered, sorted
    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.lock().keys().cloned().collect();
        names.sort();
        names
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cell::CellOptions;

    #[tokio::test]
    async fn test_register_and_whereis() {
        let registry = Registry::new();
        let cell = StateCell::start(|| 1u32, CellOptions::new().name("one").registry(registry.clone()))
            .await
            .unwrap();

        let found = registry.whereis::<u32>("one").expect("registered");
        assert_eq!(found, cell);
        assert_eq!(registry.names(), vec!["one".to_string()]);
        assert!(registry.whereis::<u32>("two").is_none());
    }

    #[tokio::test]
    async fn test_whereis_wrong_type_is_none() {
        let registry = Registry::new();
        let _cell = StateCell::start(|| 1u32, CellOptions::new().name("typed").registry(registry.clone()))
            .await
            .unwrap();

        assert!(registry.whereis::<String>("typed").is_none());
    }

    #[tokio::test]
    async fn test_conflict_with_other_state_type() {
        let registry = Registry::new();
        let cell = StateCell::start(|| 1u32, CellOptions::new().name("shared").registry(registry.clone()))
            .await
            .unwrap();

        let err = StateCell::start(String::new, CellOptions::new().name("shared").registry(registry.clone()))
            .await
            .unwrap_err();
        match err {
            StartError::NameInUse { name, id } => {
                assert_eq!(name, "shared");
                assert_eq!(id, cell.id());
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_unregister_checks_owner() {
        let registry = Registry::new();
        let cell = StateCell::start(|| 0u8, CellOptions::new().name("owned").registry(registry.clone()))
            .await
            .unwrap();

        assert!(!registry.unregister("owned", CellId::new()));
        assert!(registry.whereis::<u8>("owned").is_some());

        assert!(registry.unregister("owned", cell.id()));
        assert!(registry.whereis::<u8>("owned").is_none());
    }

    #[tokio::test]
    async fn test_stopped_cell_releases_name() {
        let registry = Registry::new();
        let cell = StateCell::start(|| 0u8, CellOptions::new().name("temp").registry(registry.clone()))
            .await
            .unwrap();

        cell.stop().await.unwrap();
        assert!(registry.names().is_empty());

        let again = StateCell::start(|| 5u8, CellOptions::new().name("temp").registry(registry.clone()))
            .await
            .unwrap();
        assert_eq!(again.get(|n| *n).await.unwrap(), 5);
    }
}
