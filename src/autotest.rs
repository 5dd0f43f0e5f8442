//! Startup self-test.
//!
//! Every query that is not already failed and whose policy is not `ignore` is
//! executed once with its `#test` parameters. A fixed pool of workers pulls
//! from a bounded queue; the supervisor hands out one proceed permit per
//! expected outcome and applies outcomes in dispatch order, whatever order the
//! workers finish in.

use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use tokio::sync::{mpsc, Mutex, Semaphore};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::error::{Error, Result};
use crate::executor::{QueryExecutor, QueryOutput};
use crate::loader::QueryTable;
use crate::metrics;
use crate::template::{Query, TestPass, TestReport};

/// Row cap for every test execution.
pub const TEST_MAX_ROWS: usize = 10;

#[derive(Debug, Clone)]
pub struct AutotestSettings {
    pub workers: usize,
    /// Record failures on the query instead of aborting the run.
    pub ignore_errors: bool,
}

impl Default for AutotestSettings {
    fn default() -> Self {
        Self {
            workers: 1,
            ignore_errors: false,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct AutotestSummary {
    pub passed: usize,
    pub failed: usize,
    pub skipped: usize,
}

struct Job {
    seq: usize,
    query: Arc<Query>,
}

struct Outcome {
    seq: usize,
    name: String,
    started_at: DateTime<Utc>,
    finished_at: DateTime<Utc>,
    verdict: std::result::Result<QueryOutput, String>,
}

pub async fn run(
    table: &mut QueryTable,
    executor: &QueryExecutor,
    settings: &AutotestSettings,
) -> Result<AutotestSummary> {
    let mut names: Vec<&String> = table
        .iter()
        .filter(|(_, q)| !q.is_failed() && q.test_pass != TestPass::Ignore)
        .map(|(name, _)| name)
        .collect();
    names.sort();
    let jobs: Vec<Job> = names
        .into_iter()
        .enumerate()
        .map(|(seq, name)| Job {
            seq,
            query: Arc::new(table[name].clone()),
        })
        .collect();

    let mut summary = AutotestSummary {
        skipped: table.len() - jobs.len(),
        ..Default::default()
    };
    if jobs.is_empty() {
        info!(skipped = summary.skipped, "No queries to self-test");
        return Ok(summary);
    }

    let expected = jobs.len();
    let workers = settings.workers.max(1).min(expected);
    info!(queries = expected, workers, "Starting autotest");

    let (job_tx, job_rx) = mpsc::channel(expected);
    for job in jobs {
        job_tx
            .try_send(job)
            .map_err(|_| Error::Internal("Autotest queue rejected a job".to_string()))?;
    }
    drop(job_tx);

    let job_rx = Arc::new(Mutex::new(job_rx));
    let (result_tx, mut result_rx) = mpsc::channel(1);
    let proceed = Arc::new(Semaphore::new(0));
    let cancel = CancellationToken::new();

    let mut pool = JoinSet::new();
    for id in 0..workers {
        pool.spawn(worker(
            id,
            executor.clone(),
            Arc::clone(&job_rx),
            Arc::clone(&proceed),
            result_tx.clone(),
            cancel.clone(),
        ));
    }
    drop(result_tx);

    let mut pending = BTreeMap::new();
    let mut next_seq = 0;
    let mut failure = None;

    'collect: for _ in 0..expected {
        proceed.add_permits(1);
        let Some(outcome) = result_rx.recv().await else {
            failure = Some(Error::Internal("Autotest workers exited early".to_string()));
            break;
        };
        pending.insert(outcome.seq, outcome);

        while let Some(outcome) = pending.remove(&next_seq) {
            next_seq += 1;
            if let Err(err) = apply(table, outcome, settings, &mut summary) {
                failure = Some(err);
                break 'collect;
            }
        }
    }

    cancel.cancel();
    proceed.close();
    while pool.join_next().await.is_some() {}

    match failure {
        Some(err) => Err(err),
        None => {
            info!(
                passed = summary.passed,
                failed = summary.failed,
                skipped = summary.skipped,
                "Autotest finished"
            );
            Ok(summary)
        }
    }
}

async fn worker(
    id: usize,
    executor: QueryExecutor,
    jobs: Arc<Mutex<mpsc::Receiver<Job>>>,
    proceed: Arc<Semaphore>,
    results: mpsc::Sender<Outcome>,
    cancel: CancellationToken,
) {
    debug!(worker = id, "Autotest worker started");

    loop {
        let job = {
            let mut rx = jobs.lock().await;
            tokio::select! {
                biased;
                _ = cancel.cancelled() => None,
                job = rx.recv() => job,
            }
        };
        let Some(job) = job else {
            break;
        };

        let started_at = Utc::now();
        let params = job.query.test_params.to_request_params();
        let result = executor
            .execute(&job.query, params, TEST_MAX_ROWS, &cancel)
            .await;
        let outcome = Outcome {
            seq: job.seq,
            name: job.query.name.clone(),
            started_at,
            finished_at: Utc::now(),
            verdict: classify(job.query.test_pass, result),
        };

        tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            permit = proceed.acquire() => {
                match permit {
                    Ok(permit) => permit.forget(),
                    Err(_) => break,
                }
                if results.send(outcome).await.is_err() {
                    break;
                }
            }
        }
    }

    debug!(worker = id, "Autotest worker stopped");
}

fn classify(
    test_pass: TestPass,
    result: Result<QueryOutput>,
) -> std::result::Result<QueryOutput, String> {
    let output = result.map_err(|e| e.to_string())?;
    match test_pass {
        TestPass::Rows if output.rows == 0 => Err(format!(
            "Failed test scenario \"rows\". Result rows: {}",
            output.rows
        )),
        TestPass::OneRowOnly if output.rows != 1 => Err(format!(
            "Failed test scenario \"onerowonly\". Result rows: {}",
            output.rows
        )),
        _ => Ok(output),
    }
}

fn apply(
    table: &mut QueryTable,
    outcome: Outcome,
    settings: &AutotestSettings,
    summary: &mut AutotestSummary,
) -> Result<()> {
    let Some(query) = table.get_mut(&outcome.name) else {
        return Ok(());
    };

    match outcome.verdict {
        Ok(output) => {
            info!(query = %outcome.name, rows = output.rows, "Autotest passed");
            metrics::record_autotest_passed();
            summary.passed += 1;
            query.test_report = Some(TestReport {
                started_at: outcome.started_at,
                finished_at: outcome.finished_at,
                result: output.json,
            });
            Ok(())
        }
        Err(message) => {
            warn!(query = %outcome.name, error = %message, "Autotest failed");
            metrics::record_autotest_failed();
            summary.failed += 1;
            if settings.ignore_errors {
                query.error = Some(Error::Autotest(message));
                Ok(())
            } else {
                Err(Error::Autotest(format!("[query={}] {}", outcome.name, message)))
            }
        }
    }
}
