//! Request replay against a simulated downstream

use std::collections::BTreeMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

use anyhow::Context;
use bulwark_resilience::{
    FallbackStrategy, FunctionFallback, PolicySet, ResilienceError, ResilienceManager, Retryable,
};
use clap::{Args, ValueEnum};
use thiserror::Error;
use tokio::sync::broadcast::error::RecvError;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{info, warn};

/// Caller-facing endpoints of the demo service
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum Endpoint {
    /// Unguarded, always succeeds
    Ok,
    /// Breaker and retry, fails with `--fail-rate` probability
    Flaky,
    /// Breaker with slow-call detection behind a time limit
    Slow,
    /// First bulkhead
    BulkheadX,
    /// Second, independently sized bulkhead
    BulkheadY,
    /// Rate limited
    Limited,
}

impl Endpoint {
    /// Protected name guarding the endpoint, `None` for the unguarded path
    fn policy(self) -> Option<&'static str> {
        match self {
            Self::Ok => None,
            Self::Flaky => Some("backendB"),
            Self::Limited => Some("rateLimiterB"),
            Self::Slow => Some("timeoutBreaker"),
            Self::BulkheadX => Some("bhX"),
            Self::BulkheadY => Some("bhY"),
        }
    }

    fn fallback_prefix(self) -> &'static str {
        match self {
            Self::Flaky => "circuit-breaker-fallback",
            Self::Slow => "timeout-circuit-breaker-fallback",
            Self::BulkheadX | Self::BulkheadY => "bulkhead-fallback",
            Self::Ok | Self::Limited => "fallback-default",
        }
    }

    fn default_delay(self) -> Duration {
        match self {
            Self::Slow => Duration::from_secs(3),
            Self::BulkheadX | Self::BulkheadY => Duration::from_secs(1),
            Self::Ok | Self::Flaky | Self::Limited => Duration::ZERO,
        }
    }
}

#[derive(Debug, Args)]
pub struct SimulateArgs {
    /// Endpoint to call
    #[arg(value_enum)]
    endpoint: Endpoint,

    /// Total requests to send
    #[arg(short = 'n', long, default_value_t = 20)]
    requests: u32,

    /// Requests in flight at once
    #[arg(short = 'j', long, default_value_t = 1, value_parser = clap::value_parser!(u32).range(1..))]
    concurrency: u32,

    /// Downstream failure probability in percent (flaky only)
    #[arg(long, default_value_t = 50, value_parser = clap::value_parser!(u8).range(0..=100))]
    fail_rate: u8,

    /// Downstream response delay in milliseconds [default: 3000 for slow, 1000 for bulkheads]
    #[arg(long)]
    delay_ms: Option<u64>,

    /// Print every policy event as a JSON line
    #[arg(long)]
    events: bool,
}

#[derive(Debug, Error)]
enum DownstreamError {
    #[error("downstream returned HTTP 500")]
    ServerError,
}

impl Retryable for DownstreamError {}

/// Stand-in for the backend service
#[derive(Debug, Clone, Copy)]
struct Downstream {
    fail_rate: u8,
    delay: Duration,
}

impl Downstream {
    async fn call(self) -> Result<String, DownstreamError> {
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        if fastrand::u8(0..100) < self.fail_rate {
            return Err(DownstreamError::ServerError);
        }
        Ok("b-ok".to_string())
    }
}

fn error_kind(error: &ResilienceError) -> &'static str {
    match error {
        ResilienceError::CircuitOpen { .. } => "CircuitOpen",
        ResilienceError::BulkheadFull { .. } => "BulkheadFull",
        ResilienceError::RateLimitExceeded { .. } => "RateLimitExceeded",
        ResilienceError::OperationFailed { .. } => "OperationFailed",
        ResilienceError::Timeout { .. } => "Timeout",
        ResilienceError::Cancelled { .. } => "Cancelled",
        ResilienceError::InvalidConfig(_) => "InvalidConfig",
    }
}

pub async fn run(policies: PolicySet, args: SimulateArgs) -> anyhow::Result<()> {
    let manager = Arc::new(ResilienceManager::new(policies).context("invalid policy set")?);
    manager.initialize().context("building policy chains")?;

    let endpoint = args.endpoint;
    let downstream = Downstream {
        fail_rate: if endpoint == Endpoint::Flaky { args.fail_rate } else { 0 },
        delay: args
            .delay_ms
            .map_or_else(|| endpoint.default_delay(), Duration::from_millis),
    };
    info!(
        ?endpoint,
        policy = ?endpoint.policy(),
        ?downstream,
        requests = args.requests,
        "starting simulation"
    );

    let printer = args.events.then(|| print_events(&manager));
    let started = Instant::now();
    let next = Arc::new(AtomicU32::new(0));
    let workers: Vec<_> = (0..args.concurrency)
        .map(|_| {
            let manager = Arc::clone(&manager);
            let next = Arc::clone(&next);
            let total = args.requests;
            tokio::spawn(async move { worker(&manager, endpoint, downstream, &next, total).await })
        })
        .collect();

    let mut tally = BTreeMap::<String, u32>::new();
    for worker in workers {
        for (response, count) in worker.await.context("request worker panicked")? {
            *tally.entry(response).or_default() += count;
        }
    }
    let elapsed = started.elapsed();

    let snapshot = endpoint.policy().and_then(|name| manager.snapshot(name));
    // Closing the bus lets the printer drain and finish.
    drop(manager);
    if let Some(printer) = printer {
        printer.await.context("event printer panicked")?;
    }

    println!(
        "{endpoint:?} via {}: {} requests in {elapsed:?}",
        endpoint.policy().unwrap_or("no policy"),
        args.requests
    );
    for (response, count) in &tally {
        println!("{count:>6}  {response}");
    }
    if let Some(snapshot) = snapshot {
        println!("{}", serde_json::to_string_pretty(&snapshot)?);
    }
    Ok(())
}

async fn worker(
    manager: &ResilienceManager,
    endpoint: Endpoint,
    downstream: Downstream,
    next: &AtomicU32,
    total: u32,
) -> BTreeMap<String, u32> {
    let prefix = endpoint.fallback_prefix();
    let fallback = FunctionFallback::new(move |error: &ResilienceError| {
        format!("{prefix}: {}", error_kind(error))
    });
    let mut tally = BTreeMap::new();

    while next.fetch_add(1, Ordering::Relaxed) < total {
        let response = match endpoint.policy() {
            None => fallback.recover(
                downstream
                    .call()
                    .await
                    .map_err(|e| ResilienceError::operation_failed(1, e.is_retryable(), e)),
            ),
            Some(name) => {
                manager
                    .execute_with_fallback(name, move || downstream.call(), &fallback)
                    .await
            }
        };
        let line = response.unwrap_or_else(|error| format!("error: {error}"));
        *tally.entry(line).or_default() += 1;
    }
    tally
}

fn print_events(manager: &ResilienceManager) -> JoinHandle<()> {
    let mut events = manager.subscribe();
    tokio::spawn(async move {
        loop {
            match events.recv().await {
                Ok(event) => match serde_json::to_string(&event) {
                    Ok(line) => println!("{line}"),
                    Err(error) => warn!(%error, "failed to serialize event"),
                },
                Err(RecvError::Lagged(skipped)) => warn!(skipped, "event printer fell behind"),
                Err(RecvError::Closed) => break,
            }
        }
    })
}
