//! Process-wide pool registry.
//!
//! Pools are keyed by configuration identity; asking for the same
//! configuration twice returns the same pool. A single shared scheduler
//! thread drives every pool's sweeper and shuts down when the last pool is
//! removed.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, OnceLock, Weak};
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};

use crate::config::Configuration;
use crate::pool::Pool;

static REGISTRY: OnceLock<Mutex<Registry>> = OnceLock::new();

fn registry() -> &'static Mutex<Registry> {
    REGISTRY.get_or_init(|| Mutex::new(Registry::default()))
}

#[derive(Default)]
struct Registry {
    pools: HashMap<String, Arc<Pool>>,
    scheduler: Option<Scheduler>,
    pool_index: usize,
}

/// Fetch (or lazily create) the pool for this configuration.
pub fn get_pool(conf: &Arc<Configuration>) -> Arc<Pool> {
    let key = conf.pool_key();
    let mut reg = registry().lock();

    if let Some(pool) = reg.pools.get(&key) {
        return pool.clone();
    }

    reg.pool_index += 1;
    let tag = match &conf.pool_name {
        Some(name) => format!("{name}-{}", reg.pool_index),
        None => format!("marlin-pool-{}", reg.pool_index),
    };
    let pool = Pool::new(conf.clone(), tag);

    reg.scheduler
        .get_or_insert_with(Scheduler::start)
        .schedule(Arc::downgrade(&pool), pool.sweep_interval());
    reg.pools.insert(key, pool.clone());
    pool
}

/// Close and deregister the pool for this configuration. The last pool's
/// removal stops the shared scheduler.
pub fn remove_pool(conf: &Configuration) {
    let key = conf.pool_key();
    let removed = {
        let mut reg = registry().lock();
        let removed = reg.pools.remove(&key);
        if reg.pools.is_empty() {
            if let Some(scheduler) = reg.scheduler.take() {
                scheduler.stop();
            }
        }
        removed
    };
    if let Some(pool) = removed {
        pool.close();
    }
}

/// Snapshot of every live pool's tag, for diagnostics.
pub fn pool_tags() -> Vec<String> {
    registry()
        .lock()
        .pools
        .values()
        .map(|p| p.tag().to_owned())
        .collect()
}

struct ScheduledTask {
    pool: Weak<Pool>,
    interval: Duration,
    next_run: Instant,
}

struct SchedulerShared {
    tasks: Mutex<Vec<ScheduledTask>>,
    wakeup: Condvar,
    shutdown: AtomicBool,
}

/// The sweeper thread shared by all pools.
struct Scheduler {
    shared: Arc<SchedulerShared>,
    thread: Option<std::thread::JoinHandle<()>>,
}

impl Scheduler {
    fn start() -> Self {
        let shared = Arc::new(SchedulerShared {
            tasks: Mutex::new(Vec::new()),
            wakeup: Condvar::new(),
            shutdown: AtomicBool::new(false),
        });
        let thread_shared = shared.clone();
        let thread = std::thread::Builder::new()
            .name("marlin-pool-sweeper".into())
            .spawn(move || run_scheduler(&thread_shared))
            .expect("spawn pool sweeper thread");
        Self {
            shared,
            thread: Some(thread),
        }
    }

    fn schedule(&self, pool: Weak<Pool>, interval: Duration) {
        let mut tasks = self.shared.tasks.lock();
        tasks.push(ScheduledTask {
            pool,
            interval,
            next_run: Instant::now() + interval,
        });
        self.shared.wakeup.notify_one();
    }

    fn stop(self) {
        self.shared.shutdown.store(true, Ordering::Release);
        self.shared.wakeup.notify_one();
        // Joining happens in Drop so a panicking pool cannot wedge removal.
    }
}

impl Drop for Scheduler {
    fn drop(&mut self) {
        self.shared.shutdown.store(true, Ordering::Release);
        self.shared.wakeup.notify_one();
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
    }
}

fn run_scheduler(shared: &SchedulerShared) {
    let mut tasks = shared.tasks.lock();
    loop {
        if shared.shutdown.load(Ordering::Acquire) {
            return;
        }

        let now = Instant::now();
        let mut due = Vec::new();
        tasks.retain_mut(|task| {
            if task.pool.strong_count() == 0 {
                return false;
            }
            if task.next_run <= now {
                due.push(task.pool.clone());
                task.next_run = now + task.interval;
            }
            true
        });

        if !due.is_empty() {
            // Sweeps run without the task lock: a slow sweep must not block
            // registration.
            parking_lot::MutexGuard::unlocked(&mut tasks, || {
                for weak in due {
                    if let Some(pool) = weak.upgrade() {
                        pool.sweep();
                    }
                }
            });
            continue;
        }

        let wait_until = tasks
            .iter()
            .map(|t| t.next_run)
            .min()
            .unwrap_or_else(|| Instant::now() + Duration::from_secs(1));
        shared.wakeup.wait_until(&mut tasks, wait_until);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn conf(db: &str) -> Arc<Configuration> {
        Arc::new(
            Configuration::builder()
                .host("127.0.0.1")
                .port(9)
                .user("app")
                .database(db)
                .connect_timeout(Duration::from_millis(100))
                .min_pool_size(0)
                .max_pool_size(2)
                .build(),
        )
    }

    #[test]
    fn same_configuration_shares_a_pool() {
        let a = conf("registry_share");
        let pool1 = get_pool(&a);
        let pool2 = get_pool(&a);
        assert_eq!(pool1.tag(), pool2.tag());
        assert!(Arc::ptr_eq(&pool1, &pool2));
        remove_pool(&a);
        assert!(!pool_tags().contains(&pool1.tag().to_owned()));
    }

    #[test]
    fn different_configurations_get_distinct_pools() {
        let a = conf("registry_a");
        let b = conf("registry_b");
        let pool_a = get_pool(&a);
        let pool_b = get_pool(&b);
        assert_ne!(pool_a.tag(), pool_b.tag());
        remove_pool(&a);
        remove_pool(&b);
    }

    #[test]
    fn removal_is_idempotent() {
        let a = conf("registry_remove");
        let _pool = get_pool(&a);
        remove_pool(&a);
        remove_pool(&a);
    }
}
