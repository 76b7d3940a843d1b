use std::{
    fmt::{Display, Formatter},
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
        Mutex,
        Weak,
    },
    time::{Duration, Instant},
};

use bytes::Bytes;
use chrono::{DateTime, Local};
use colored::Colorize;
use shared::types::{MinerId, WorkerName};
use tokio::runtime::Handle;
use tracing::*;

use crate::{
    config::{Endpoint, Protocol, ProxyConfig},
    endpoint::EndpointSet,
    error::{ProxyError, TransportError},
    handler::{HandlerContext, MinerHandler, MinerListener, MinerRegistry, PoolHandler},
    ledger::SubmissionLedger,
    scheduler::{MaintenanceScheduler, MaintenanceTasks, Periodic, STALE_CHECK_INTERVAL},
    transport::{Transport, TransportEvents},
    work::PoolWork,
};

/// delay between a transport error and the next connection attempt
pub const RECONNECT_BACKOFF: Duration = Duration::from_secs(1);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Disconnected,
    Connecting,
    Connected { since: Instant, at: DateTime<Local> },
}

/// Outcome of checking the attached miners against the session state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Requirement {
    /// connected with nobody to serve
    Teardown,
    /// not connected and nobody to serve
    Idle,
    /// miners attached and a session is up or on its way
    Keep,
    /// miners attached and no session
    Connect,
}

impl Requirement {
    fn evaluate(state: &SessionState, miners: usize) -> Self {
        match (state, miners) {
            (SessionState::Connected { .. }, 0) => Requirement::Teardown,
            (_, 0) => Requirement::Idle,
            (SessionState::Disconnected, _) => Requirement::Connect,
            _ => Requirement::Keep,
        }
    }

    fn is_required(self) -> bool {
        matches!(self, Requirement::Keep | Requirement::Connect)
    }
}

struct Session {
    state: SessionState,
    // bumped on every transition into Connected
    generation: u64,
    endpoints: EndpointSet,
    work: Option<PoolWork>,
    target: Option<String>,
}

/// Session side of a teardown, taken under the session lock.
struct Teardown {
    previous: SessionState,
    generation: u64,
    endpoint: String,
}

/// Transition claimed by a requirement check.
enum Transition {
    Teardown(Teardown),
    Connect(Endpoint),
}

impl Session {
    fn begin_teardown(&mut self) -> Teardown {
        let previous = std::mem::replace(&mut self.state, SessionState::Disconnected);
        self.work = None;
        self.target = None;
        Teardown {
            previous,
            generation: self.generation,
            endpoint: self.endpoints.current().to_string(),
        }
    }

    /// Moves Disconnected to Connecting, `None` from any other state.
    fn begin_connect(&mut self) -> Option<Endpoint> {
        if self.state != SessionState::Disconnected {
            return None;
        }
        self.state = SessionState::Connecting;
        Some(self.endpoints.current().clone())
    }
}

#[derive(Default)]
struct PoolStats {
    submitted: AtomicU64,
    accepted: AtomicU64,
    rejected: AtomicU64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StatsSnapshot {
    pub submitted: u64,
    pub accepted: u64,
    pub rejected: u64,
}

/// One status line, composed on every status tick.
#[derive(Debug, Clone)]
pub struct StatusReport {
    pub worker: WorkerName,
    pub connected_for: Duration,
    pub miners: usize,
    pub shares: StatsSnapshot,
    pub hashrate: f64,
}

impl Display for StatusReport {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        let minutes = self.connected_for.as_secs() / 60;
        write!(
            f,
            "[{}] {:02}:{:02} Miners: {} Shares: {}/{}/{}",
            self.worker,
            minutes / 60,
            minutes % 60,
            self.miners,
            self.shares.submitted,
            self.shares.accepted,
            self.shares.rejected
        )?;
        let hashrate = format_hashrate(self.hashrate);
        if !hashrate.is_empty() {
            write!(f, " Hashrate: {hashrate}")?;
        }
        Ok(())
    }
}

pub fn format_hashrate(hashrate: f64) -> String {
    const UNITS: [&str; 6] = ["H/s", "KH/s", "MH/s", "GH/s", "TH/s", "PH/s"];

    if hashrate.is_nan() || hashrate <= 0.0 {
        return String::new();
    }
    let mut value = hashrate;
    let mut unit = 0;
    while value >= 1000.0 && unit < UNITS.len() - 1 {
        value /= 1000.0;
        unit += 1;
    }
    format!("{value:.2} {}", UNITS[unit])
}

/// Everything the supervisor talks to.
pub struct Collaborators {
    pub transport: Arc<dyn Transport>,
    pub pool_handler: Arc<dyn PoolHandler>,
    pub miner_handler: Arc<dyn MinerHandler>,
    pub miners: Arc<dyn MinerRegistry>,
    pub listener: Arc<dyn MinerListener>,
}

/// Owns the single upstream pool session: connects when miners need it,
/// tears down when they leave, fails over between endpoints and keeps the
/// session fed through the maintenance tasks.
pub struct PoolSupervisor {
    me: Weak<PoolSupervisor>,
    config: ProxyConfig,
    runtime: Handle,
    session: Mutex<Session>,
    ledger: SubmissionLedger,
    stats: PoolStats,
    scheduler: MaintenanceScheduler,
    transport: Arc<dyn Transport>,
    pool_handler: Arc<dyn PoolHandler>,
    miner_handler: Arc<dyn MinerHandler>,
    miners: Arc<dyn MinerRegistry>,
    listener: Arc<dyn MinerListener>,
}

impl PoolSupervisor {
    /// Must be called from within a tokio runtime.
    pub fn new(config: ProxyConfig, parts: Collaborators) -> Result<Arc<Self>, ProxyError> {
        config.validate()?;
        let endpoints = EndpointSet::new(config.pools.clone())?;
        let runtime = Handle::try_current().map_err(|_| ProxyError::NoRuntime)?;

        let Collaborators { transport, pool_handler, miner_handler, miners, listener } = parts;

        let pool = Arc::new_cyclic(|me| {
            Self {
                me: me.clone(),
                scheduler: MaintenanceScheduler::new(runtime.clone()),
                runtime,
                session: Mutex::new(Session {
                    state: SessionState::Disconnected,
                    generation: 0,
                    endpoints,
                    work: None,
                    target: None,
                }),
                ledger: SubmissionLedger::new(),
                stats: PoolStats::default(),
                config,
                transport,
                pool_handler,
                miner_handler,
                miners,
                listener,
            }
        });

        let ctx = HandlerContext {
            pool: Arc::downgrade(&pool),
            miners: pool.miners.clone(),
            listener: pool.listener.clone(),
        };
        pool.pool_handler.attach(ctx.clone());
        pool.miner_handler.attach(ctx);

        let port = pool.config.local_port;
        pool.listener.listen(port).map_err(|source| ProxyError::Listen { port, source })?;

        info!(
            "[{}] proxy {} listening on {port}, waiting for miners before connecting to pool..",
            pool.worker_name(),
            crate::VERSION
        );
        Ok(pool)
    }

    pub fn state(&self) -> SessionState {
        self.session.lock().unwrap().state
    }

    pub fn is_connected(&self) -> bool {
        matches!(self.state(), SessionState::Connected { .. })
    }

    pub fn connected_since(&self) -> Option<DateTime<Local>> {
        match self.state() {
            SessionState::Connected { at, .. } => Some(at),
            _ => None,
        }
    }

    pub fn current_endpoint(&self) -> Endpoint {
        self.session.lock().unwrap().endpoints.current().clone()
    }

    pub fn endpoint_index(&self) -> usize {
        self.session.lock().unwrap().endpoints.index()
    }

    pub fn failures(&self) -> u32 {
        self.session.lock().unwrap().endpoints.failures()
    }

    pub fn protocol(&self) -> Protocol {
        self.config.protocol
    }

    pub fn worker_name(&self) -> WorkerName {
        self.session.lock().unwrap().endpoints.current().worker.clone()
    }

    pub fn wallet(&self) -> String {
        self.session.lock().unwrap().endpoints.current().wallet.clone()
    }

    pub fn password(&self) -> String {
        self.session.lock().unwrap().endpoints.current().password.clone()
    }

    /// falls back to the worker name when the pool has no dedicated id
    pub fn hashrate_id(&self) -> String {
        let session = self.session.lock().unwrap();
        let endpoint = session.endpoints.current();
        endpoint.hashrate_id.clone().unwrap_or_else(|| endpoint.worker.to_string())
    }

    pub fn config(&self) -> &ProxyConfig {
        &self.config
    }

    /// Connects to the selected endpoint. No-op unless disconnected.
    pub fn start(&self) {
        let endpoint = self.session.lock().unwrap().begin_connect();
        if let Some(endpoint) = endpoint {
            self.connect(endpoint);
        }
    }

    fn connect(&self, endpoint: Endpoint) {
        let Some(events) = self.me.upgrade() else {
            return;
        };
        info!("[{}] connecting to {}", endpoint.worker, endpoint);
        self.transport.connect(&endpoint, events);
    }

    /// Full teardown: maintenance stopped, session data cleared, transport
    /// closed and share history forgotten. Idempotent.
    pub fn stop(&self) {
        let teardown = self.session.lock().unwrap().begin_teardown();
        self.finish_teardown(teardown);
    }

    fn finish_teardown(&self, teardown: Teardown) {
        self.scheduler.stop_up_to(teardown.generation);

        if teardown.previous != SessionState::Disconnected {
            info!("disconnecting from {}", teardown.endpoint);
            self.transport.close();
        }
        self.ledger.clear();
    }

    /// Whether the pool session is needed right now, acting on the answer:
    /// idle sessions are torn down, needed ones are started. The decision and
    /// the state change it implies are made under one lock.
    pub fn connection_required(&self) -> bool {
        let miners = self.listener.connection_count();
        let (requirement, transition) = {
            let mut session = self.session.lock().unwrap();
            let requirement = Requirement::evaluate(&session.state, miners);
            let transition = match requirement {
                Requirement::Teardown => Some(Transition::Teardown(session.begin_teardown())),
                Requirement::Connect => session.begin_connect().map(Transition::Connect),
                Requirement::Idle | Requirement::Keep => None,
            };
            (requirement, transition)
        };
        trace!("miner connections: {miners}, requirement: {requirement:?}");

        match transition {
            Some(Transition::Teardown(teardown)) => {
                self.finish_teardown(teardown);
                info!("[{}] waiting for miners..", self.worker_name());
            }
            Some(Transition::Connect(endpoint)) => self.connect(endpoint),
            None => {}
        }
        requirement.is_required()
    }

    fn is_current_session(&self, generation: u64) -> bool {
        let session = self.session.lock().unwrap();
        session.generation == generation && matches!(session.state, SessionState::Connected { .. })
    }

    fn schedule_retry(&self) {
        let me = self.me.clone();
        self.runtime.spawn(async move {
            tokio::time::sleep(RECONNECT_BACKOFF).await;
            if let Some(pool) = me.upgrade() {
                pool.connection_required();
            }
        });
    }

    fn maintenance_tasks(&self) -> MaintenanceTasks {
        let work = self.me.clone();
        let status = self.me.clone();
        let check = self.me.clone();

        MaintenanceTasks {
            work_poll: Periodic::new("work poll", self.config.get_work_interval(), move || {
                if let Some(pool) = work.upgrade() {
                    pool.request_work();
                }
            }),
            status_report: Periodic::new("status report", self.config.stats_interval(), move || {
                if let Some(pool) = status.upgrade() {
                    pool.status_tick();
                }
            }),
            response_check: Periodic::new("response check", STALE_CHECK_INTERVAL, move || {
                if let Some(pool) = check.upgrade() {
                    pool.miners.correct_response_times();
                }
            }),
        }
    }

    pub fn send_to_pool(&self, data: Bytes) {
        self.transport.send(data);
    }

    /// Forwards a share unless identical content was submitted before.
    /// Returns whether it was forwarded.
    pub fn submit_share(&self, share: Bytes, miner: &MinerId) -> bool {
        trace!("{miner} submitting share");
        if self.ledger.check_and_record(&share) {
            warn!("{miner}: share already submitted, not sending to pool");
            return false;
        }
        self.stats.submitted.fetch_add(1, Ordering::Relaxed);
        self.miners.record_submission(miner);
        self.pool_handler.submit_share(share, self);
        true
    }

    /// out of cycle get-work
    pub fn request_work(&self) {
        self.pool_handler.request_work(self);
    }

    /// Replaces the current work and pushes it to the miners. Work for another
    /// protocol, or arriving while no session is up, is dropped.
    pub fn set_work(&self, work: PoolWork) -> bool {
        if work.protocol() != self.config.protocol {
            warn!("dropping {} work, pool protocol is {}", work.protocol(), self.config.protocol);
            return false;
        }
        {
            let mut session = self.session.lock().unwrap();
            if !matches!(session.state, SessionState::Connected { .. }) {
                debug!("dropping work {} received while not connected", work.job_id());
                return false;
            }
            session.work = Some(work.clone());
        }
        self.miner_handler.broadcast_work(&work);
        true
    }

    pub fn current_work(&self) -> Option<PoolWork> {
        self.session.lock().unwrap().work.clone()
    }

    pub fn set_target(&self, target: String) {
        self.session.lock().unwrap().target = Some(target);
    }

    pub fn target(&self) -> Option<String> {
        self.session.lock().unwrap().target.clone()
    }

    pub fn record_accepted(&self) {
        self.stats.accepted.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_rejected(&self) {
        self.stats.rejected.fetch_add(1, Ordering::Relaxed);
    }

    pub fn stats(&self) -> StatsSnapshot {
        StatsSnapshot {
            submitted: self.stats.submitted.load(Ordering::Relaxed),
            accepted: self.stats.accepted.load(Ordering::Relaxed),
            rejected: self.stats.rejected.load(Ordering::Relaxed),
        }
    }

    /// Runs the requirement check first; `None` when the session is not
    /// needed (and has possibly just been torn down).
    pub fn report_status(&self) -> Option<StatusReport> {
        if !self.connection_required() {
            return None;
        }
        let (worker, connected_for) = {
            let session = self.session.lock().unwrap();
            let connected_for = match session.state {
                SessionState::Connected { since, .. } => since.elapsed(),
                _ => Duration::ZERO,
            };
            (session.endpoints.current().worker.clone(), connected_for)
        };
        Some(StatusReport {
            worker,
            connected_for,
            miners: self.miners.connected_miners(),
            shares: self.stats(),
            hashrate: self.miners.hashrate(),
        })
    }

    fn status_tick(&self) {
        let Some(report) = self.report_status() else {
            return;
        };
        info!("{report}");
        for miner in self.miners.summaries() {
            debug!(
                "[{}] {:<21} {:>6} {:>6} {:>6} {}",
                report.worker,
                miner.id,
                miner.submitted,
                miner.accepted,
                miner.rejected,
                format_hashrate(miner.hashrate)
            );
        }
        self.pool_handler.report_hashrate(self);
    }
}

impl TransportEvents for PoolSupervisor {
    fn on_connected(&self) {
        let (generation, endpoint) = {
            let mut session = self.session.lock().unwrap();
            let state = session.state;
            match state {
                SessionState::Connecting => {}
                SessionState::Connected { .. } => {
                    debug!("duplicate connected event ignored");
                    return;
                }
                SessionState::Disconnected => {
                    drop(session);
                    debug!("connection completed after teardown, closing it");
                    self.transport.close();
                    return;
                }
            }
            session.state = SessionState::Connected { since: Instant::now(), at: Local::now() };
            session.generation += 1;
            session.endpoints.reset_failures();
            (session.generation, session.endpoints.current().clone())
        };

        info!("[{}] connected to {}", endpoint.worker, endpoint.to_string().green());
        if !self.scheduler.start(generation, self.maintenance_tasks()) {
            debug!("session {generation} superseded before its maintenance started");
            return;
        }

        // a disconnect may have slipped in before the tasks were running
        if !self.is_current_session(generation) {
            self.scheduler.stop_up_to(generation);
            return;
        }

        self.pool_handler.login(self);
        self.pool_handler.request_work(self);
    }

    fn on_data(&self, data: Bytes) {
        self.pool_handler.data_received(data, self);
    }

    fn on_disconnected(&self) {
        let (generation, endpoint) = {
            let mut session = self.session.lock().unwrap();
            if session.state == SessionState::Disconnected {
                debug!("disconnected event while already disconnected");
                return;
            }
            session.state = SessionState::Disconnected;
            session.work = None;
            session.target = None;
            (session.generation, session.endpoints.current().to_string())
        };

        self.scheduler.stop_up_to(generation);
        warn!("pool {endpoint} disconnected");
        self.connection_required();
    }

    fn on_error(&self, err: TransportError) {
        let (generation, endpoint, failures, failover) = {
            let mut session = self.session.lock().unwrap();
            session.state = SessionState::Disconnected;
            session.work = None;
            session.target = None;
            let endpoint = session.endpoints.current().to_string();
            let failover = session.endpoints.record_failure().cloned();
            (session.generation, endpoint, session.endpoints.failures(), failover)
        };

        self.scheduler.stop_up_to(generation);
        error!("pool {endpoint} error: {err} (consecutive failures: {failures})");
        if let Some(next) = failover {
            warn!("{}", format!("failing over from {endpoint} to {next}").yellow());
        }
        self.schedule_retry();
    }
}
