//! Single-Flight Guard
//!
//! Collapses concurrent identical computations into one: the first caller
//! to miss installs a pending cell in a keyed wait-map; subsequent callers
//! await the same cell instead of running their own compute. This prevents
//! thundering herds on expensive embeddings and pipeline runs.

use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, Mutex};

use tokio::sync::OnceCell;

/// Keyed single-flight wait-map
pub struct SingleFlight<V: Clone> {
    cells: Mutex<HashMap<String, Arc<OnceCell<V>>>>,
}

impl<V: Clone> SingleFlight<V> {
    pub fn new() -> Self {
        Self {
            cells: Mutex::new(HashMap::new()),
        }
    }

    /// Run `compute` for `key`, coalescing with concurrent callers.
    ///
    /// Exactly one compute runs per observed miss; joiners receive a clone
    /// of its value. If the leader's compute fails, the error is returned to
    /// it and the next waiter becomes the leader (a failed compute caches
    /// nothing).
    pub async fn run<F, Fut, E>(&self, key: &str, compute: F) -> Result<V, E>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<V, E>>,
    {
        let cell = {
            let mut cells = self.cells.lock().unwrap_or_else(|e| e.into_inner());
            cells
                .entry(key.to_string())
                .or_insert_with(|| Arc::new(OnceCell::new()))
                .clone()
        };

        let result = cell.get_or_try_init(compute).await.cloned();

        // Retire the cell so completed keys do not pin memory. A racing
        // caller holding the old Arc still resolves against it.
        {
            let mut cells = self.cells.lock().unwrap_or_else(|e| e.into_inner());
            if let Some(current) = cells.get(key) {
                if Arc::ptr_eq(current, &cell) {
                    cells.remove(key);
                }
            }
        }

        result
    }

    /// Number of in-flight keys (diagnostics)
    pub fn in_flight(&self) -> usize {
        self.cells.lock().unwrap_or_else(|e| e.into_inner()).len()
    }
}

impl<V: Clone> Default for SingleFlight<V> {
    fn default() -> Self {
        Self::new()
    }
}

// ============================================================================
// TESTS
// ============================================================================
