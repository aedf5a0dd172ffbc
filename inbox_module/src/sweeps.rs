//! Periodic maintenance: inactivity escalation, reassignment away from
//! unreachable agents, and draining the escalation queue.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use tracing::{error, info, warn};

use crate::directory::ConversationDirectory;
use crate::escalation::{EscalationEngine, EscalationRequest, EscalationType};
use crate::pipeline::SYSTEM_ACTOR;
use crate::store::{Database, StoreError};

const STOP_POLL_INTERVAL: Duration = Duration::from_millis(200);

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SweepReport {
    pub inactive_escalated: usize,
    pub reassigned: usize,
    pub drained: usize,
}

#[derive(Debug, Clone)]
pub struct Sweeper {
    directory: ConversationDirectory,
    engine: EscalationEngine,
}

impl Sweeper {
    pub fn new(db: Database, engine: EscalationEngine) -> Self {
        Self {
            directory: ConversationDirectory::new(db),
            engine,
        }
    }

    pub fn run_once(&self, now: DateTime<Utc>) -> SweepReport {
        let mut report = SweepReport::default();
        match self.escalate_inactive(now) {
            Ok(count) => report.inactive_escalated = count,
            Err(err) => error!("inactivity sweep failed: {}", err),
        }
        match self.reassign_unreachable(now) {
            Ok(count) => report.reassigned = count,
            Err(err) => error!("reassignment sweep failed: {}", err),
        }
        match self.engine.drain_queue(now) {
            Ok(count) => report.drained = count,
            Err(err) => error!("queue drain failed: {}", err),
        }
        if report != SweepReport::default() {
            info!(
                "sweep done inactive_escalated={} reassigned={} drained={}",
                report.inactive_escalated, report.reassigned, report.drained
            );
        }
        report
    }

    /// Escalates idle, unowned conversations to the supervisors.
    pub fn escalate_inactive(&self, now: DateTime<Utc>) -> Result<usize, StoreError> {
        let settings = self.engine.settings();
        let cutoff = now - chrono::Duration::hours(settings.inactivity_hours.max(1));
        let mut escalated = 0;
        for conversation in self.directory.list_inactive(cutoff)? {
            let idle_hours = (now - conversation.last_activity()).num_hours();
            let request = EscalationRequest::new(
                &conversation.id,
                EscalationType::Inactivity,
                format!("no activity for {} hours", idle_hours),
            )
            .with_department(settings.supervisor_department.clone())
            .with_actor(SYSTEM_ACTOR);
            match self.engine.escalate_at(&request, now) {
                Ok(_) => escalated += 1,
                Err(err) => warn!(
                    "inactivity escalation failed conversation_id={}: {}",
                    conversation.id, err
                ),
            }
        }
        Ok(escalated)
    }

    /// Moves conversations off agents who went offline, left their shift,
    /// or were disabled.
    pub fn reassign_unreachable(&self, now: DateTime<Utc>) -> Result<usize, StoreError> {
        let mut reassigned = 0;
        for conversation in self.directory.list_assigned_open()? {
            let Some(agent_id) = conversation.assigned_agent.as_deref() else {
                continue;
            };
            let reachable = self
                .engine
                .agents()
                .get(agent_id)?
                .is_some_and(|agent| agent.is_reachable(now));
            if reachable {
                continue;
            }
            let reason = format!("agent {} unavailable", agent_id);
            match self.engine.reassign(&conversation.id, &reason, now) {
                Ok(Some(_)) => reassigned += 1,
                Ok(None) => {}
                Err(err) => warn!(
                    "reassignment failed conversation_id={}: {}",
                    conversation.id, err
                ),
            }
        }
        Ok(reassigned)
    }
}

pub struct SweepControl {
    stop: Arc<AtomicBool>,
    handle: Option<thread::JoinHandle<()>>,
}

impl SweepControl {
    pub fn stop(&self) {
        self.stop.store(true, Ordering::Relaxed);
    }

    pub fn stop_and_join(&mut self) {
        self.stop();
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

/// Runs `run_once` every `interval` until stopped.
pub fn start_sweeps(sweeper: Sweeper, interval: Duration) -> SweepControl {
    let stop = Arc::new(AtomicBool::new(false));
    let thread_stop = stop.clone();
    let handle = thread::spawn(move || {
        info!("sweeps started interval_secs={}", interval.as_secs());
        let mut next_run = Instant::now();
        while !thread_stop.load(Ordering::Relaxed) {
            if Instant::now() >= next_run {
                sweeper.run_once(Utc::now());
                next_run = Instant::now() + interval;
            }
            thread::sleep(STOP_POLL_INTERVAL);
        }
        info!("sweeps stopped");
    });
    SweepControl {
        stop,
        handle: Some(handle),
    }
}
