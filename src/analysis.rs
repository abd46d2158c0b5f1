//! Bot/fraud analysis workflow
//!
//! Starts a backend analysis job for one target and polls its status on a
//! fixed interval until a verdict arrives or the job is cancelled. At most one
//! job is live; every result carries the job number it was issued under and is
//! dropped if that job is no longer current.

use crate::api::ChatBackend;
use crate::config::DEFAULT_ANALYSIS_POLL_MS;
use crate::credential::Credential;
use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tracing::{debug, info, warn};

/// Status reported by the analysis endpoint
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AnalysisStatus {
    Pending,
    Genuine,
    NotGenuine,
    NoAnalysisFound,
}

/// One poll response
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AnalysisReport {
    pub status: AnalysisStatus,
    #[serde(default)]
    pub verdict: Option<String>,
}

impl AnalysisReport {
    /// A verdict is present and the backend has an analysis on file
    pub fn is_terminal(&self) -> bool {
        self.status != AnalysisStatus::NoAnalysisFound && self.verdict.is_some()
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum AnalysisState {
    Idle,
    Pending {
        target: String,
        polls: u32,
    },
    Resolved {
        target: String,
        status: AnalysisStatus,
        verdict: String,
    },
}

/// Progress surfaced to the caller
#[derive(Debug, Clone, PartialEq)]
pub enum AnalysisUpdate {
    Polled {
        target: String,
        attempt: u32,
        status: AnalysisStatus,
    },
    PollFailed {
        target: String,
        attempt: u32,
        reason: String,
    },
    Resolved {
        target: String,
        status: AnalysisStatus,
        verdict: String,
    },
    Failed {
        target: String,
        reason: String,
    },
    GaveUp {
        target: String,
        attempts: u32,
    },
}

#[derive(Debug)]
enum JobEventKind {
    StartFailed(String),
    Polled { attempt: u32, report: AnalysisReport },
    PollFailed { attempt: u32, reason: String },
    Exhausted { attempts: u32 },
}

#[derive(Debug)]
struct JobEvent {
    job: u64,
    kind: JobEventKind,
}

/// Cancellable polling state machine
pub struct AnalysisWorkflow {
    backend: Arc<dyn ChatBackend>,
    interval: Duration,
    max_polls: Option<u32>,
    state: AnalysisState,
    job: u64,
    task: Option<JoinHandle<()>>,
    tx: mpsc::UnboundedSender<JobEvent>,
    rx: mpsc::UnboundedReceiver<JobEvent>,
}

impl AnalysisWorkflow {
    /// A zero `interval` falls back to the default poll interval
    pub fn new(backend: Arc<dyn ChatBackend>, interval: Duration, max_polls: Option<u32>) -> Self {
        let interval = if interval.is_zero() {
            warn!("Analysis poll interval of zero, using {}ms", DEFAULT_ANALYSIS_POLL_MS);
            Duration::from_millis(DEFAULT_ANALYSIS_POLL_MS)
        } else {
            interval
        };
        let (tx, rx) = mpsc::unbounded_channel();
        Self {
            backend,
            interval,
            max_polls,
            state: AnalysisState::Idle,
            job: 0,
            task: None,
            tx,
            rx,
        }
    }

    pub fn state(&self) -> &AnalysisState {
        &self.state
    }

    /// Target of the in-flight job, if any
    pub fn pending_target(&self) -> Option<&str> {
        match &self.state {
            AnalysisState::Pending { target, .. } => Some(target),
            _ => None,
        }
    }

    /// Kick off analysis of `target`.
    ///
    /// Already pending for the same target: no-op. Pending for another target:
    /// `Error::AnalysisBusy`, the caller must `cancel` first.
    pub fn start(&mut self, target: &str, credential: Credential) -> Result<()> {
        if let Some(pending) = self.pending_target() {
            if pending == target {
                debug!("Analysis already pending for {}", target);
                return Ok(());
            }
            return Err(Error::AnalysisBusy {
                pending: pending.to_string(),
                requested: target.to_string(),
            });
        }

        self.stop_task();
        self.job += 1;

        let job = self.job;
        let backend = Arc::clone(&self.backend);
        let tx = self.tx.clone();
        let owned_target = target.to_string();
        let interval = self.interval;
        let max_polls = self.max_polls;

        self.task = Some(tokio::spawn(async move {
            run_job(backend, credential, owned_target, interval, max_polls, job, tx).await;
        }));

        self.state = AnalysisState::Pending {
            target: target.to_string(),
            polls: 0,
        };
        info!("Started analysis for {} (job {})", target, job);
        Ok(())
    }

    /// Stop polling and forget any result still in flight
    pub fn cancel(&mut self) {
        self.stop_task();
        self.job += 1;
        if let AnalysisState::Pending { target, polls } = &self.state {
            info!("Cancelled analysis for {} after {} polls", target, polls);
        }
        self.state = AnalysisState::Idle;
    }

    /// Wait for the next result that belongs to the current job
    pub async fn next_update(&mut self) -> AnalysisUpdate {
        loop {
            let Some(event) = self.rx.recv().await else {
                return std::future::pending().await;
            };
            if let Some(update) = self.apply(event) {
                return update;
            }
        }
    }

    fn apply(&mut self, event: JobEvent) -> Option<AnalysisUpdate> {
        if event.job != self.job {
            debug!("Discarding stale analysis result from job {}", event.job);
            return None;
        }

        let target = self.pending_target()?.to_string();

        match event.kind {
            JobEventKind::StartFailed(reason) => {
                warn!("Analysis start failed for {}: {}", target, reason);
                self.finish(AnalysisState::Idle);
                Some(AnalysisUpdate::Failed { target, reason })
            }
            JobEventKind::Polled { attempt, report } => match report.verdict {
                Some(verdict) if report.status != AnalysisStatus::NoAnalysisFound => {
                    info!(
                        "Analysis for {} resolved after {} polls: {:?}",
                        target, attempt, report.status
                    );
                    self.finish(AnalysisState::Resolved {
                        target: target.clone(),
                        status: report.status,
                        verdict: verdict.clone(),
                    });
                    Some(AnalysisUpdate::Resolved {
                        target,
                        status: report.status,
                        verdict,
                    })
                }
                _ => {
                    self.record_poll(attempt);
                    Some(AnalysisUpdate::Polled {
                        target,
                        attempt,
                        status: report.status,
                    })
                }
            },
            JobEventKind::PollFailed { attempt, reason } => {
                warn!("Analysis poll {} for {} failed: {}", attempt, target, reason);
                self.record_poll(attempt);
                Some(AnalysisUpdate::PollFailed {
                    target,
                    attempt,
                    reason,
                })
            }
            JobEventKind::Exhausted { attempts } => {
                warn!("Giving up on analysis for {} after {} polls", target, attempts);
                self.finish(AnalysisState::Idle);
                Some(AnalysisUpdate::GaveUp { target, attempts })
            }
        }
    }

    fn record_poll(&mut self, attempt: u32) {
        if let AnalysisState::Pending { polls, .. } = &mut self.state {
            *polls = attempt;
        }
    }

    fn finish(&mut self, next: AnalysisState) {
        self.stop_task();
        self.state = next;
    }

    fn stop_task(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }
}

impl Drop for AnalysisWorkflow {
    fn drop(&mut self) {
        self.stop_task();
    }
}

async fn run_job(
    backend: Arc<dyn ChatBackend>,
    credential: Credential,
    target: String,
    interval: Duration,
    max_polls: Option<u32>,
    job: u64,
    tx: mpsc::UnboundedSender<JobEvent>,
) {
    let send = |kind: JobEventKind| tx.send(JobEvent { job, kind }).is_ok();

    if let Err(e) = backend.start_analysis(&credential, &target).await {
        send(JobEventKind::StartFailed(e.to_string()));
        return;
    }

    // First poll one interval after the start call, like a browser setInterval
    let mut ticker = interval_at(Instant::now() + interval, interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    let mut attempt = 0;
    loop {
        ticker.tick().await;
        attempt += 1;

        let delivered = match backend.poll_analysis(&credential, &target).await {
            Ok(report) => {
                let terminal = report.is_terminal();
                let delivered = send(JobEventKind::Polled { attempt, report });
                if terminal {
                    return;
                }
                delivered
            }
            Err(e) => send(JobEventKind::PollFailed {
                attempt,
                reason: e.to_string(),
            }),
        };

        if !delivered {
            return;
        }

        if max_polls.is_some_and(|max| attempt >= max) {
            send(JobEventKind::Exhausted { attempts: attempt });
            return;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn report(status: AnalysisStatus, verdict: Option<&str>) -> AnalysisReport {
        AnalysisReport {
            status,
            verdict: verdict.map(str::to_string),
        }
    }

    #[test]
    fn test_terminal_condition() {
        assert!(report(AnalysisStatus::Genuine, Some("yes")).is_terminal());
        assert!(report(AnalysisStatus::NotGenuine, Some("no")).is_terminal());
        // Pending with a verdict already attached still counts
        assert!(report(AnalysisStatus::Pending, Some("yes")).is_terminal());
        assert!(!report(AnalysisStatus::Pending, None).is_terminal());
        assert!(!report(AnalysisStatus::NoAnalysisFound, Some("stale")).is_terminal());
        assert!(!report(AnalysisStatus::Genuine, None).is_terminal());
    }

    #[test]
    fn test_status_wire_names() {
        assert_eq!(
            serde_json::to_string(&AnalysisStatus::NoAnalysisFound).unwrap(),
            r#""no_analysis_found""#
        );
        assert_eq!(
            serde_json::from_str::<AnalysisStatus>(r#""not_genuine""#).unwrap(),
            AnalysisStatus::NotGenuine
        );
        assert!(serde_json::from_str::<AnalysisStatus>(r#""maybe""#).is_err());
    }
}
