//! Reporting agent: samples this process and pushes the samples to a
//! collector.
//!
//! Every poll tick records the latest gauges and counts one poll; every
//! report tick sends what has accumulated as one batch. Polls are only
//! forgotten once a send succeeds, so the collector's `PollCount` ends up
//! equal to the number of polls even across failed reports.

use std::collections::BTreeMap;
use std::error::Error;
use std::time::{Duration, Instant};

use tally::reporter::{Reporter, ReporterConfig};
use tally::{Context, Metric};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::AgentArgs;

/// Name of the counter incremented on every poll.
pub const POLL_COUNT: &str = "PollCount";

/// Reads process statistics.
#[derive(Debug)]
pub struct ProcessSampler {
    started: Instant,
}

impl Default for ProcessSampler {
    fn default() -> Self {
        Self::new()
    }
}

impl ProcessSampler {
    /// Starts the uptime clock.
    pub fn new() -> Self {
        Self {
            started: Instant::now(),
        }
    }

    /// Takes one sample of gauges.
    ///
    /// Statistics the platform does not expose are skipped.
    pub async fn sample(&self) -> Vec<(&'static str, f64)> {
        let mut gauges = vec![("UptimeSeconds", self.started.elapsed().as_secs_f64())];

        match tokio::fs::read_to_string("/proc/self/status").await {
            Ok(status) => gauges.extend(parse_status(&status)),
            Err(e) => debug!(error = %e, "process status unavailable"),
        }

        match count_entries("/proc/self/fd").await {
            #[allow(clippy::cast_precision_loss)] // fd counts are far below 2^52
            Ok(open) => gauges.push(("OpenFiles", open as f64)),
            Err(e) => debug!(error = %e, "open file count unavailable"),
        }

        gauges
    }
}

async fn count_entries(dir: &str) -> std::io::Result<usize> {
    let mut entries = tokio::fs::read_dir(dir).await?;
    let mut count = 0;
    while entries.next_entry().await?.is_some() {
        count += 1;
    }
    Ok(count)
}

/// Extracts memory and thread gauges from `/proc/<pid>/status` text.
///
/// Memory sizes are reported by the kernel in kB and converted to bytes.
fn parse_status(status: &str) -> Vec<(&'static str, f64)> {
    let mut gauges = Vec::new();

    for line in status.lines() {
        let Some((key, rest)) = line.split_once(':') else {
            continue;
        };
        let (name, scale) = match key {
            "VmRSS" => ("ResidentMemoryBytes", 1024.0),
            "VmSize" => ("VirtualMemoryBytes", 1024.0),
            "Threads" => ("Threads", 1.0),
            _ => continue,
        };
        if let Some(value) = rest
            .split_whitespace()
            .next()
            .and_then(|v| v.parse::<f64>().ok())
        {
            gauges.push((name, value * scale));
        }
    }

    gauges
}

/// Samples accumulated between reports.
#[derive(Debug, Default)]
pub struct Pending {
    gauges: BTreeMap<&'static str, f64>,
    polls: i64,
}

impl Pending {
    /// Records one poll.
    pub fn record(&mut self, gauges: Vec<(&'static str, f64)>) {
        self.gauges.extend(gauges);
        self.polls += 1;
    }

    /// Builds the batch to send: the latest gauges plus the unsent polls.
    pub fn batch(&self) -> Vec<Metric> {
        let mut batch: Vec<Metric> = self
            .gauges
            .iter()
            .map(|(&name, &value)| Metric::gauge(name, value))
            .collect();
        if self.polls > 0 {
            batch.push(Metric::counter(POLL_COUNT, self.polls));
        }
        batch
    }

    /// Forgets `polls` polls after they were delivered.
    pub fn acknowledge(&mut self, polls: i64) {
        self.polls -= polls;
    }

    /// Polls not yet delivered.
    pub fn polls(&self) -> i64 {
        self.polls
    }
}

/// Sends the pending batch once; on success the sent polls are forgotten.
///
/// # Errors
///
/// Returns the reporter's error; nothing is forgotten in that case.
pub async fn report(
    reporter: &Reporter,
    ctx: &Context,
    pending: &mut Pending,
) -> tally::Result<usize> {
    let batch = pending.batch();
    let polls = pending.polls();
    let sent = reporter.send_batch(ctx, &batch).await?;
    pending.acknowledge(polls);
    Ok(sent)
}

/// Polls and reports until `shutdown` fires.
pub async fn run_loop(
    reporter: Reporter,
    sampler: ProcessSampler,
    poll_interval: Duration,
    report_interval: Duration,
    shutdown: CancellationToken,
) {
    let mut pending = Pending::default();
    let mut poll = tokio::time::interval(poll_interval);
    let mut report_tick = tokio::time::interval(report_interval);
    report_tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    // The first report tick completes immediately; skip it.
    report_tick.tick().await;

    loop {
        tokio::select! {
            () = shutdown.cancelled() => break,
            _ = poll.tick() => pending.record(sampler.sample().await),
            _ = report_tick.tick() => {
                let ctx = Context::with_token(shutdown.child_token());
                match report(&reporter, &ctx, &mut pending).await {
                    Ok(sent) => debug!(sent, "report delivered"),
                    Err(e) => warn!(error = %e, pending_polls = pending.polls(), "report failed"),
                }
            }
        }
    }
    info!("agent stopped");
}

/// Implements `tally agent`.
///
/// # Errors
///
/// Returns an error if the HTTP client cannot be created.
pub async fn run(args: AgentArgs) -> Result<(), Box<dyn Error>> {
    let config = ReporterConfig::new(&args.address).with_compression(!args.no_compress);
    let reporter = Reporter::new(config)?;
    let shutdown = CancellationToken::new();

    info!(
        collector = %reporter.config().base_url,
        poll_interval = args.poll_interval,
        report_interval = args.report_interval,
        "agent started"
    );

    let worker = tokio::spawn(run_loop(
        reporter,
        ProcessSampler::new(),
        Duration::from_secs(args.poll_interval.max(1)),
        Duration::from_secs(args.report_interval.max(1)),
        shutdown.clone(),
    ));

    tokio::signal::ctrl_c().await?;
    info!("received SIGINT");
    shutdown.cancel();
    worker.await?;
    Ok(())
}
