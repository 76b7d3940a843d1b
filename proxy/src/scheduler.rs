use std::{
    cell::Cell,
    fmt::{Debug, Formatter},
    sync::{
        atomic::{AtomicBool, AtomicU64, Ordering},
        Arc,
        Mutex,
        PoisonError,
        RwLock,
    },
    time::Duration,
};

use tokio::{
    runtime::Handle,
    task::JoinHandle,
    time::{self, Instant, MissedTickBehavior},
};
use tracing::*;

/// period of the stale share response correction pass
pub const STALE_CHECK_INTERVAL: Duration = Duration::from_secs(30);

pub type Tick = Arc<dyn Fn() + Send + Sync>;

/// A named callback fired every `period`, the first time one period after start.
#[derive(Clone)]
pub struct Periodic {
    pub name: &'static str,
    pub period: Duration,
    pub tick: Tick,
}

impl Periodic {
    pub fn new<F>(name: &'static str, period: Duration, tick: F) -> Self
    where
        F: Fn() + Send + Sync + 'static, {
        Self { name, period, tick: Arc::new(tick) }
    }
}

impl Debug for Periodic {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Periodic").field("name", &self.name).field("period", &self.period).finish()
    }
}

/// The three jobs that keep a pool session productive while it is connected.
#[derive(Debug, Clone)]
pub struct MaintenanceTasks {
    pub work_poll: Periodic,
    pub status_report: Periodic,
    pub response_check: Periodic,
}

impl MaintenanceTasks {
    fn into_array(self) -> [Periodic; 3] {
        [self.work_poll, self.status_report, self.response_check]
    }
}

static NEXT_GATE_ID: AtomicU64 = AtomicU64::new(1);

thread_local! {
    // (gate id, task slot) of the tick executing on this thread
    static ACTIVE_TICK: Cell<Option<(u64, usize)>> = const { Cell::new(None) };
}

/// Shared by the tasks of one start/stop cycle. Each task ticks under the
/// read side of its own lock, closing takes every write side to wait the
/// ticks out.
struct Gate {
    id: u64,
    stopped: AtomicBool,
    ticks: [RwLock<()>; 3],
}

struct ActiveTick {
    previous: Option<(u64, usize)>,
}

impl ActiveTick {
    fn enter(id: u64, slot: usize) -> Self {
        Self { previous: ACTIVE_TICK.with(|active| active.replace(Some((id, slot)))) }
    }
}

impl Drop for ActiveTick {
    fn drop(&mut self) {
        ACTIVE_TICK.with(|active| active.set(self.previous));
    }
}

impl Gate {
    fn new() -> Self {
        Self {
            id: NEXT_GATE_ID.fetch_add(1, Ordering::Relaxed),
            stopped: AtomicBool::new(false),
            ticks: [RwLock::new(()), RwLock::new(()), RwLock::new(())],
        }
    }

    /// Runs one tick of the task in `slot` unless the gate is closed.
    /// Returns `false` once closed.
    fn run(&self, slot: usize, task: &Periodic) -> bool {
        let _guard = self.ticks[slot].read().unwrap_or_else(PoisonError::into_inner);
        if self.stopped.load(Ordering::SeqCst) {
            return false;
        }
        let _active = ActiveTick::enter(self.id, slot);
        trace!("maintenance tick: {}", task.name);
        (task.tick)();
        true
    }

    fn close(&self) {
        self.stopped.store(true, Ordering::SeqCst);

        // a tick closing its own gate holds the read side of its slot
        let own = ACTIVE_TICK
            .with(|active| active.get())
            .and_then(|(id, slot)| (id == self.id).then_some(slot));

        for (slot, ticks) in self.ticks.iter().enumerate() {
            if own == Some(slot) {
                continue;
            }
            drop(ticks.write().unwrap_or_else(PoisonError::into_inner));
        }
    }
}

struct Running {
    generation: u64,
    gate: Arc<Gate>,
    handles: Vec<JoinHandle<()>>,
}

impl Running {
    fn shutdown(self) {
        self.gate.close();
        for handle in self.handles {
            handle.abort();
        }
    }
}

/// Starts and stops the maintenance tasks as one unit. Every run is tagged
/// with the session generation it serves.
pub struct MaintenanceScheduler {
    runtime: Handle,
    running: Mutex<Option<Running>>,
}

impl MaintenanceScheduler {
    pub fn new(runtime: Handle) -> Self {
        Self { runtime, running: Mutex::new(None) }
    }

    /// Spawns the tasks for `generation`, replacing any older run. Returns
    /// `false` and spawns nothing when a newer generation is already running.
    pub fn start(&self, generation: u64, tasks: MaintenanceTasks) -> bool {
        let previous = {
            let mut running = self.running.lock().unwrap();
            if let Some(current) = running.as_ref() {
                if current.generation > generation {
                    debug!(
                        "maintenance start for generation {generation} ignored, {} is running",
                        current.generation
                    );
                    return false;
                }
            }

            let gate = Arc::new(Gate::new());
            let handles = tasks
                .into_array()
                .into_iter()
                .enumerate()
                .map(|(slot, task)| self.runtime.spawn(run_periodic(gate.clone(), slot, task)))
                .collect();
            running.replace(Running { generation, gate, handles })
        };

        match previous {
            Some(previous) => {
                debug!("maintenance tasks restarted for generation {generation}");
                previous.shutdown();
            }
            None => debug!("maintenance tasks started for generation {generation}"),
        }
        true
    }

    /// Stops the running tasks if they serve `generation` or an older one.
    pub fn stop_up_to(&self, generation: u64) {
        let running = {
            let mut running = self.running.lock().unwrap();
            match running.as_ref() {
                Some(current) if current.generation <= generation => running.take(),
                _ => None,
            }
        };
        if let Some(running) = running {
            running.shutdown();
            debug!("maintenance tasks stopped");
        }
    }

    /// Once this returns no tick begins and none is still executing, except
    /// the caller's own tick when invoked from inside one. Idempotent.
    pub fn stop(&self) {
        self.stop_up_to(u64::MAX);
    }

    pub fn is_running(&self) -> bool {
        self.running.lock().unwrap().is_some()
    }

    pub fn running_generation(&self) -> Option<u64> {
        self.running.lock().unwrap().as_ref().map(|running| running.generation)
    }
}

impl Drop for MaintenanceScheduler {
    fn drop(&mut self) {
        self.stop();
    }
}

async fn run_periodic(gate: Arc<Gate>, slot: usize, task: Periodic) {
    let mut interval = time::interval_at(Instant::now() + task.period, task.period);
    interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        interval.tick().await;
        if !gate.run(slot, &task) {
            break;
        }
    }
    trace!("maintenance task {} exited", task.name);
}

#[cfg(test)]
mod tests {
    use std::sync::{atomic::AtomicUsize, Weak};

    use super::*;

    fn counting(name: &'static str, period: Duration, counter: &Arc<AtomicUsize>) -> Periodic {
        let counter = counter.clone();
        Periodic::new(name, period, move || {
            counter.fetch_add(1, Ordering::SeqCst);
        })
    }

    struct Counters {
        work: Arc<AtomicUsize>,
        status: Arc<AtomicUsize>,
        check: Arc<AtomicUsize>,
    }

    impl Counters {
        fn new() -> Self {
            Self {
                work: Arc::new(AtomicUsize::new(0)),
                status: Arc::new(AtomicUsize::new(0)),
                check: Arc::new(AtomicUsize::new(0)),
            }
        }

        fn tasks(&self, work: u64, status: u64, check: u64) -> MaintenanceTasks {
            MaintenanceTasks {
                work_poll: counting("work", Duration::from_millis(work), &self.work),
                status_report: counting("status", Duration::from_millis(status), &self.status),
                response_check: counting("check", Duration::from_millis(check), &self.check),
            }
        }

        fn total(&self) -> usize {
            self.work.load(Ordering::SeqCst)
                + self.status.load(Ordering::SeqCst)
                + self.check.load(Ordering::SeqCst)
        }
    }

    #[tokio::test(start_paused = true)]
    async fn tasks_tick_independently() {
        let counters = Counters::new();
        let scheduler = MaintenanceScheduler::new(Handle::current());
        scheduler.start(1, counters.tasks(10, 25, 1000));

        time::sleep(Duration::from_millis(105)).await;

        assert!((9..=10).contains(&counters.work.load(Ordering::SeqCst)));
        assert!((3..=4).contains(&counters.status.load(Ordering::SeqCst)));
        assert_eq!(counters.check.load(Ordering::SeqCst), 0);
        scheduler.stop();
    }

    #[tokio::test(start_paused = true)]
    async fn first_tick_waits_one_period() {
        let counters = Counters::new();
        let scheduler = MaintenanceScheduler::new(Handle::current());
        scheduler.start(1, counters.tasks(50, 50, 50));

        time::sleep(Duration::from_millis(40)).await;
        assert_eq!(counters.total(), 0);
        scheduler.stop();
    }

    #[tokio::test(start_paused = true)]
    async fn no_tick_after_stop() {
        let counters = Counters::new();
        let scheduler = MaintenanceScheduler::new(Handle::current());
        scheduler.start(1, counters.tasks(10, 10, 10));

        time::sleep(Duration::from_millis(35)).await;
        scheduler.stop();
        assert!(!scheduler.is_running());
        let seen = counters.total();
        assert!(seen > 0);

        time::sleep(Duration::from_millis(200)).await;
        assert_eq!(counters.total(), seen);

        // idempotent
        scheduler.stop();
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn stop_waits_for_in_flight_tick() {
        let entered = Arc::new(AtomicBool::new(false));
        let finished = Arc::new(AtomicBool::new(false));
        let calls = Arc::new(AtomicUsize::new(0));

        let slow = {
            let entered = entered.clone();
            let finished = finished.clone();
            let calls = calls.clone();
            Periodic::new("slow", Duration::from_millis(5), move || {
                calls.fetch_add(1, Ordering::SeqCst);
                entered.store(true, Ordering::SeqCst);
                std::thread::sleep(Duration::from_millis(100));
                finished.store(true, Ordering::SeqCst);
            })
        };
        let idle = Counters::new();
        let mut tasks = idle.tasks(3_600_000, 3_600_000, 3_600_000);
        tasks.work_poll = slow;

        let scheduler = Arc::new(MaintenanceScheduler::new(Handle::current()));
        scheduler.start(1, tasks);

        while !entered.load(Ordering::SeqCst) {
            time::sleep(Duration::from_millis(1)).await;
        }

        let stopper = scheduler.clone();
        tokio::task::spawn_blocking(move || stopper.stop()).await.unwrap();
        assert!(finished.load(Ordering::SeqCst));

        let seen = calls.load(Ordering::SeqCst);
        time::sleep(Duration::from_millis(50)).await;
        assert_eq!(calls.load(Ordering::SeqCst), seen);
    }

    #[tokio::test(start_paused = true)]
    async fn stop_from_inside_a_tick() {
        let calls = Arc::new(AtomicUsize::new(0));
        let scheduler = Arc::new(MaintenanceScheduler::new(Handle::current()));

        let weak: Weak<MaintenanceScheduler> = Arc::downgrade(&scheduler);
        let teardown = {
            let calls = calls.clone();
            Periodic::new("teardown", Duration::from_millis(10), move || {
                calls.fetch_add(1, Ordering::SeqCst);
                if let Some(scheduler) = weak.upgrade() {
                    scheduler.stop();
                }
            })
        };
        let idle = Counters::new();
        let mut tasks = idle.tasks(3_600_000, 3_600_000, 3_600_000);
        tasks.status_report = teardown;
        scheduler.start(1, tasks);

        time::sleep(Duration::from_millis(100)).await;
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert!(!scheduler.is_running());
    }

    #[tokio::test(start_paused = true)]
    async fn restart_replaces_previous_tasks() {
        let first = Counters::new();
        let second = Counters::new();
        let scheduler = MaintenanceScheduler::new(Handle::current());

        scheduler.start(1, first.tasks(10, 10, 10));
        scheduler.start(2, second.tasks(10, 3_600_000, 3_600_000));

        time::sleep(Duration::from_millis(55)).await;
        assert_eq!(first.total(), 0);
        assert!(second.work.load(Ordering::SeqCst) >= 4);
        scheduler.stop();
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn stop_from_one_tick_waits_for_the_others() {
        let work_in_flight = Arc::new(AtomicBool::new(false));
        let seen_after_stop: Arc<Mutex<Option<bool>>> = Arc::new(Mutex::new(None));
        let scheduler = Arc::new(MaintenanceScheduler::new(Handle::current()));

        let work = {
            let in_flight = work_in_flight.clone();
            Periodic::new("work", Duration::from_millis(100), move || {
                in_flight.store(true, Ordering::SeqCst);
                std::thread::sleep(Duration::from_millis(400));
                in_flight.store(false, Ordering::SeqCst);
            })
        };
        let status = {
            let in_flight = work_in_flight.clone();
            let seen_after_stop = seen_after_stop.clone();
            let weak = Arc::downgrade(&scheduler);
            Periodic::new("status", Duration::from_millis(100), move || {
                if !in_flight.load(Ordering::SeqCst) {
                    return;
                }
                if let Some(scheduler) = weak.upgrade() {
                    scheduler.stop();
                    seen_after_stop.lock().unwrap().replace(in_flight.load(Ordering::SeqCst));
                }
            })
        };
        let idle = Counters::new();
        let mut tasks = idle.tasks(3_600_000, 3_600_000, 3_600_000);
        tasks.work_poll = work;
        tasks.status_report = status;
        scheduler.start(1, tasks);

        let deadline = Instant::now() + Duration::from_secs(5);
        let work_running = loop {
            if let Some(seen) = *seen_after_stop.lock().unwrap() {
                break seen;
            }
            assert!(Instant::now() < deadline, "status tick never stopped the scheduler");
            time::sleep(Duration::from_millis(10)).await;
        };
        assert!(!work_running);
        assert!(!scheduler.is_running());
    }

    #[tokio::test(start_paused = true)]
    async fn older_generation_leaves_newer_run_alone() {
        let older = Counters::new();
        let newer = Counters::new();
        let scheduler = MaintenanceScheduler::new(Handle::current());

        assert!(scheduler.start(2, newer.tasks(10, 3_600_000, 3_600_000)));
        assert!(!scheduler.start(1, older.tasks(10, 10, 10)));
        scheduler.stop_up_to(1);
        assert_eq!(scheduler.running_generation(), Some(2));

        time::sleep(Duration::from_millis(55)).await;
        assert_eq!(older.total(), 0);
        assert!(newer.work.load(Ordering::SeqCst) >= 4);

        scheduler.stop_up_to(2);
        assert!(!scheduler.is_running());
    }
}
