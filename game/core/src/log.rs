//! The log hub: `write_log` fans a line out to every subscriber and writes
//! through to the data provider, on top of the structured logger. It must
//! never panic, whatever a subscriber does. Verbose keys gate the chatty
//! diagnostics; the fast path is one atomic read.

use ember::logging::{self, Level, Logger};
use ember::store::DataProvider;
use hashbrown::HashSet;
use parking_lot::RwLock;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

pub type LogSubscriber = Arc<dyn Fn(Level, &str) + Send + Sync>;

pub struct LogHub {
    log: Logger,
    data: Arc<dyn DataProvider>,
    subscribers: RwLock<Vec<LogSubscriber>>,
    verbose: RwLock<HashSet<String>>,
    verbose_any: AtomicBool,
}

impl LogHub {
    pub fn new(data: Arc<dyn DataProvider>, log: Logger) -> LogHub {
        LogHub {
            log,
            data,
            subscribers: RwLock::new(Vec::new()),
            verbose: RwLock::new(HashSet::new()),
            verbose_any: AtomicBool::new(false),
        }
    }

    /// Emits one line: structured log, then subscribers, then the provider
    /// sink. Subscriber panics are swallowed.
    pub fn write_log(&self, level: Level, text: &str) {
        match level {
            Level::Critical => logging::crit!(self.log, "{}", text),
            Level::Error => logging::error!(self.log, "{}", text),
            Level::Warning => logging::warn!(self.log, "{}", text),
            Level::Info => logging::info!(self.log, "{}", text),
            Level::Debug => logging::debug!(self.log, "{}", text),
            Level::Trace => logging::trace!(self.log, "{}", text),
        }

        let subscribers = self.subscribers.read().clone();
        for subscriber in subscribers {
            drop(panic::catch_unwind(AssertUnwindSafe(|| {
                subscriber(level, text)
            })));
        }

        drop(panic::catch_unwind(AssertUnwindSafe(|| {
            self.data.write_log(level, text)
        })));
    }

    pub fn subscribe(&self, subscriber: LogSubscriber) {
        self.subscribers.write().push(subscriber);
    }

    /// Enables or disables a verbose key.
    pub fn set_verbose(&self, key: &str, enabled: bool) {
        let mut verbose = self.verbose.write();
        if enabled {
            verbose.insert(key.to_owned());
        } else {
            verbose.remove(key);
        }
        self.verbose_any.store(!verbose.is_empty(), Ordering::Relaxed);
    }

    /// Cheap probe used by components before assembling verbose output.
    #[inline]
    pub fn is_verbose(&self, key: &str) -> bool {
        self.verbose_any.load(Ordering::Relaxed) && self.verbose.read().contains(key)
    }
}
