use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::{Args, Parser, Subcommand};
use parking_lot::Mutex;
use rand::Rng;
use tokio_stream::StreamExt;
use tracing::{debug, info, warn};
use tracing_subscriber::EnvFilter;

use ratequeue::clock::{Clock, SystemClock};
use ratequeue::ratelimit::{
    interval_label, normalize_endpoint, IntervalUnit, Method, RuleCategory, WindowClock,
};
use ratequeue::{
    AppConfig, Dispatched, LimiterEvent, RateLimiter, RequestConfig, RequestQueue, ResponseInfo,
};

#[derive(Parser, Debug)]
#[command(name = "ratequeue", version, about = "Client-side rate limit admission control")]
struct Cli {
    /// Emit logs as JSON lines
    #[arg(long, global = true)]
    json_logs: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Push synthetic requests through a queue against a simulated server
    Simulate(SimulateArgs),
}

#[derive(Args, Debug)]
struct SimulateArgs {
    /// YAML application config; the spot preset is used when absent
    #[arg(long)]
    config: Option<String>,

    /// Number of requests to send
    #[arg(long, default_value_t = 50)]
    requests: usize,

    #[arg(long, default_value = "GET")]
    method: Method,

    #[arg(long, default_value = "/api/v3/exchangeInfo")]
    endpoint: String,

    /// Mean simulated server latency
    #[arg(long, default_value_t = 100)]
    latency_ms: u64,

    /// Overrides the configured concurrency cap
    #[arg(long)]
    max_concurrent: Option<usize>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.json_logs);

    info!("Version: {}", env!("CARGO_PKG_VERSION"));

    match cli.command {
        Command::Simulate(args) => simulate(args).await,
    }
}

fn init_tracing(json: bool) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let builder = tracing_subscriber::fmt().with_env_filter(filter).with_target(false);
    if json {
        builder.json().init();
    } else {
        builder.init();
    }
}

/// Server that tracks request weight per minute and reports it like the exchange does.
struct SimulatedServer {
    limiter: Arc<RateLimiter>,
    window: WindowClock,
    used: Mutex<HashMap<u64, u64>>,
    latency_ms: u64,
}

impl SimulatedServer {
    async fn handle(&self, config: RequestConfig) -> Result<Dispatched<u64>, std::io::Error> {
        let latency = if self.latency_ms == 0 {
            0
        } else {
            let jitter = self.latency_ms / 2;
            rand::thread_rng().gen_range(self.latency_ms - jitter..=self.latency_ms + jitter)
        };
        tokio::time::sleep(Duration::from_millis(latency)).await;

        let weight = self.weight(&config);
        let now = SystemClock.now_millis();
        let used = {
            let mut used = self.used.lock();
            let entry = used.entry(self.window.window_id(now)).or_insert(0);
            *entry += weight;
            *entry
        };

        let header = format!("x-mbx-used-weight-{}", interval_label(IntervalUnit::Minute, 1));
        let response = ResponseInfo::new(200)
            .header("date", chrono::Utc::now().to_rfc2822())
            .header(header, used.to_string());
        debug!(
            endpoint = %config.request.endpoint,
            weight,
            used,
            latency_ms = latency,
            "Served request"
        );
        Ok(Dispatched::new(response, used))
    }

    fn weight(&self, config: &RequestConfig) -> u64 {
        let endpoint = normalize_endpoint(&config.request.endpoint);
        self.limiter
            .categories()
            .find(|(category, _)| **category == RuleCategory::RequestWeight)
            .and_then(|(_, category)| {
                category
                    .weight_for(config.request.method, &endpoint, &config.request.params)
                    .ok()
                    .flatten()
            })
            .unwrap_or(1)
    }
}

async fn simulate(args: SimulateArgs) -> anyhow::Result<()> {
    let app = match &args.config {
        Some(path) => AppConfig::from_file(path)
            .with_context(|| format!("Failed to load config from {}", path))?,
        None => AppConfig::default(),
    };

    let limiter_config = app.limiter_config().context("Failed to load limiter config")?;
    let limiter = Arc::new(RateLimiter::new(limiter_config));
    if !app.limiter.safety_buffers.is_empty() {
        limiter.set_safety_buffers(app.limiter.safety_buffers.clone());
    }

    let mut options = app.queue_options();
    if let Some(max) = args.max_concurrent {
        options = options.max_concurrent_requests(max);
    }
    info!(
        requests = args.requests,
        method = %args.method,
        endpoint = %args.endpoint,
        max_concurrent = options.max_concurrent_requests,
        "Starting simulation"
    );
    let queue = RequestQueue::new(limiter.clone(), options);

    let mut events = limiter.events();
    tokio::spawn(async move {
        while let Some(event) = events.next().await {
            match event {
                Ok(LimiterEvent::RetryIn { retry_in_ms }) => {
                    warn!(retry_in_ms, "Server ban; holding requests")
                }
                Ok(LimiterEvent::RetryElapsed) => info!("Ban elapsed; resuming"),
                Err(err) => warn!(error = %err, "Missed limiter events"),
            }
        }
    });

    let server = Arc::new(SimulatedServer {
        limiter: limiter.clone(),
        window: WindowClock::new(IntervalUnit::Minute, 1),
        used: Mutex::new(HashMap::new()),
        latency_ms: args.latency_ms,
    });

    let started = tokio::time::Instant::now();
    let handles: Vec<_> = (0..args.requests)
        .map(|_| {
            let server = server.clone();
            let config = RequestConfig::new(args.method, args.endpoint.clone());
            queue.enqueue(config, move |config| async move { server.handle(config).await })
        })
        .collect();

    let mut succeeded = 0usize;
    let mut failed = 0usize;
    for (i, handle) in handles.into_iter().enumerate() {
        match handle.await {
            Ok(used) => {
                succeeded += 1;
                debug!(request = i, used, "Request settled");
            }
            Err(err) => {
                failed += 1;
                warn!(request = i, error = %err, "Request failed");
            }
        }
    }

    info!(
        succeeded,
        failed,
        elapsed_ms = started.elapsed().as_millis() as u64,
        "Simulation finished"
    );
    println!("Processed {} requests ({} succeeded, {} failed)", args.requests, succeeded, failed);
    for (key, usage) in limiter.current_usage() {
        println!("  {:<28} {}", key, usage);
    }
    Ok(())
}
