//! The periodic maintenance pass: persist dirty columns, then evict the
//! ones nobody cares about. Failures leave a column dirty for the next
//! pass; a panic in here is escalated by the scheduling layer, never
//! swallowed.

use ember::logging;
use std::sync::atomic::Ordering;
use std::time::Instant;

use super::World;

#[derive(Debug, Default, Copy, Clone, Eq, PartialEq)]
pub struct MaintenanceStats {
    /// Columns examined this pass.
    pub examined: usize,
    /// Dirty columns written to the backing store.
    pub saved: usize,
    /// Idle, clean columns removed from the cache.
    pub unloaded: usize,
}

impl World {
    /// One maintenance pass over a snapshot of the loaded columns.
    ///
    /// Per column: under its lock, save if dirty (clearing the flag only on
    /// success); then, under the world lock and the column lock, remove it
    /// when it has no subscribers, no interest and no unsaved data.
    pub fn maintain(&self) -> MaintenanceStats {
        let start = Instant::now();
        let snapshot = self.columns_snapshot();

        let mut stats = MaintenanceStats {
            examined: snapshot.len(),
            ..MaintenanceStats::default()
        };

        for column in snapshot {
            let id = column.id();

            {
                let mut data = column.lock();
                if data.dirty {
                    let bytes = column.storage_bytes(&data);
                    match self
                        .data_provider()
                        .save_column(id.dimension, id.x, id.z, &bytes)
                    {
                        Ok(()) => {
                            data.dirty = false;
                            stats.saved += 1;
                        }
                        Err(err) => {
                            // Stays dirty; the next pass retries.
                            logging::warn!(self.log(), "column save failed";
                                           "column" => %id,
                                           "error" => %err);
                        }
                    }
                }
            }

            if self.evict_if_idle(&column) {
                stats.unloaded += 1;
                logging::debug!(self.log(), "column unloaded"; "column" => %id);
            }
        }

        self.saved.fetch_add(stats.saved as u64, Ordering::Relaxed);
        self.unloaded
            .fetch_add(stats.unloaded as u64, Ordering::Relaxed);
        self.maintenances.fetch_add(1, Ordering::Relaxed);

        logging::debug!(self.log(), "maintenance pass finished";
                        "examined" => stats.examined,
                        "saved" => stats.saved,
                        "unloaded" => stats.unloaded,
                        "elapsed_us" => start.elapsed().as_micros() as u64);
        stats
    }
}
