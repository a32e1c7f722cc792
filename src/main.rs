// Copyright 2026 Machine Price Monitor Contributors
// SPDX-License-Identifier: Apache-2.0

use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{CommandFactory, Parser, Subcommand};
use clap_complete::Shell;
use uuid::Uuid;

use price_monitor::acquisition::http_client::HttpClient;
use price_monitor::batch::{BatchConfig, BatchOrchestrator};
use price_monitor::config::AppConfig;
use price_monitor::events::{EventBus, ExtractionEvent};
use price_monitor::extract::llm_tier::{LlmClient, LlmRate};
use price_monitor::extract::vendor_llm::HttpLlmClient;
use price_monitor::model::{BatchStatus, ValidationStatus};
use price_monitor::orchestrator::Orchestrator;
use price_monitor::renderer::chromium::ChromiumRenderer;
use price_monitor::renderer::Renderer;
use price_monitor::rules::SiteRuleTable;
use price_monitor::server::{self, AppState};
use price_monitor::store::{SqliteStore, Store};

/// Process exit codes, per spec.md §6.1.
const EXIT_SUCCESS: i32 = 0;
const EXIT_NEEDS_REVIEW: i32 = 2;
const EXIT_EXTRACTION_FAILED: i32 = 3;
const EXIT_NOT_FOUND: i32 = 4;

#[derive(Parser)]
#[command(
    name = "price-monitor",
    about = "Multi-tier price extraction engine for a curated machine catalog",
    version
)]
struct Cli {
    /// Path to the TOML config file.
    #[arg(long, global = true, default_value = "price-monitor.toml")]
    config: String,

    /// Emit logs as JSON lines instead of human-readable text.
    #[arg(long, global = true)]
    json_logs: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Extract the current price for a single machine and print the result.
    Extract {
        /// Machine id to extract.
        machine_id: String,
    },
    /// Run a batch extraction over a list of machine ids.
    Batch {
        /// Machine ids to include in the batch.
        machine_ids: Vec<String>,
    },
    /// Show a batch's current status snapshot.
    BatchStatus {
        /// Batch id (as printed by `batch`).
        batch_id: Uuid,
    },
    /// Approve or reject a pending price-history row.
    Approval {
        /// Price-history row id.
        history_id: Uuid,
        /// "approve" commits the held price; "reject" clears the flag without writing it.
        decision: ApprovalDecision,
    },
    /// Run the HTTP control surface (spec.md §6.1).
    Serve,
    /// Generate shell completion scripts.
    Completions {
        shell: Shell,
    },
}

#[derive(Clone, Copy, clap::ValueEnum)]
enum ApprovalDecision {
    Approve,
    Reject,
}

fn init_tracing(json: bool) {
    use tracing_subscriber::{fmt, EnvFilter};
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let subscriber = fmt().with_env_filter(filter);
    if json {
        subscriber.json().init();
    } else {
        subscriber.init();
    }
}

struct Runtime {
    orchestrator: Arc<Orchestrator>,
    batch_orchestrator: Arc<BatchOrchestrator>,
    store: Arc<dyn Store>,
    http: HttpClient,
    config: AppConfig,
    events: Arc<EventBus>,
}

/// Forward every lifecycle event to `tracing` so the CLI and `serve`
/// paths get the same structured log trail without each call site
/// re-subscribing.
fn spawn_log_sink(events: &Arc<EventBus>) {
    let mut rx = events.subscribe();
    tokio::spawn(async move {
        while let Ok(event) = rx.recv().await {
            tracing::debug!(event = ?event, "extraction event");
        }
    });
}

async fn build_runtime(config: AppConfig) -> Result<Runtime> {
    let store: Arc<dyn Store> =
        Arc::new(SqliteStore::open(&config.db_path).context("opening price-history store")?);
    let events = Arc::new(EventBus::new(config.event_bus_capacity));
    spawn_log_sink(&events);
    let http = HttpClient::new(config.fetch_timeout_ms);
    let rules = SiteRuleTable::new(config.site_rules.clone());

    let renderer: Option<Arc<dyn Renderer>> = match ChromiumRenderer::new().await {
        Ok(r) => Some(Arc::new(r)),
        Err(e) => {
            tracing::warn!("chromium renderer unavailable, dynamic tier disabled: {e:#}");
            None
        }
    };

    let (llm, llm_rate) = match &config.llm {
        Some(llm_cfg) => {
            let api_key = std::env::var(&llm_cfg.api_key_ref).unwrap_or_default();
            let client: Arc<dyn LlmClient> = Arc::new(HttpLlmClient::new(
                llm_cfg.endpoint.clone(),
                api_key,
                llm_cfg.model.clone(),
                llm_cfg.llm_timeout_ms,
            ));
            let rate = LlmRate {
                model_id: llm_cfg.model.clone(),
                cost_per_1m_prompt: llm_cfg.cost_per_1m_prompt,
                cost_per_1m_completion: llm_cfg.cost_per_1m_completion,
                max_payload_chars: llm_cfg.max_payload_chars,
            };
            (Some(client), rate)
        }
        None => (
            None,
            LlmRate {
                model_id: "disabled".to_string(),
                cost_per_1m_prompt: rust_decimal::Decimal::ZERO,
                cost_per_1m_completion: rust_decimal::Decimal::ZERO,
                max_payload_chars: 0,
            },
        ),
    };

    let orchestrator = Arc::new(Orchestrator::new(
        http.clone(),
        renderer,
        llm,
        llm_rate,
        rules,
        store.clone(),
        events.clone(),
        config.fetch_timeout_ms,
        config.render_timeout_ms,
    ));

    let batch_orchestrator = Arc::new(BatchOrchestrator::new(
        orchestrator.clone(),
        store.clone(),
        events.clone(),
        BatchConfig {
            max_concurrency: config.max_concurrency,
            per_domain_concurrency: config.per_domain_concurrency,
            requests_per_second_per_domain: config.requests_per_second_per_domain,
            llm_batch_budget_usd: config.llm_batch_budget_usd,
        },
    ));

    Ok(Runtime {
        orchestrator,
        batch_orchestrator,
        store,
        http,
        config,
        events,
    })
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.json_logs);

    if let Commands::Completions { shell } = cli.command {
        let mut cmd = Cli::command();
        clap_complete::generate(shell, &mut cmd, "price-monitor", &mut std::io::stdout());
        return Ok(());
    }

    let config = AppConfig::load(&cli.config).unwrap_or_else(|e| {
        tracing::warn!("failed to load config at {}: {e:#}; using defaults", cli.config);
        AppConfig::default()
    });

    let runtime = build_runtime(config).await?;

    let exit_code = match cli.command {
        Commands::Extract { machine_id } => run_extract(&runtime, &machine_id).await,
        Commands::Batch { machine_ids } => run_batch(&runtime, machine_ids).await,
        Commands::BatchStatus { batch_id } => run_batch_status(&runtime, batch_id).await,
        Commands::Approval { history_id, decision } => run_approval(&runtime, history_id, decision).await,
        Commands::Serve => run_serve(runtime).await,
        Commands::Completions { .. } => unreachable!("handled above"),
    };

    let code = match exit_code {
        Ok(code) => code,
        Err(e) => {
            eprintln!("error: {e:#}");
            EXIT_EXTRACTION_FAILED
        }
    };

    std::process::exit(code);
}

async fn run_extract(runtime: &Runtime, machine_id: &str) -> Result<i32> {
    match runtime.orchestrator.extract_machine(machine_id, None, None).await {
        Ok(run) => {
            println!(
                "{}",
                serde_json::json!({
                    "machine_id": machine_id,
                    "success": run.history.price.is_some() && run.history.validation_status == ValidationStatus::Pass,
                    "new_price": run.history.price,
                    "old_price": run.history.previous_price,
                    "tier_used": run.history.tier_used,
                    "requires_approval": run.history.requires_approval,
                    "reason": run.reason,
                })
            );
            Ok(match run.history.validation_status {
                ValidationStatus::NeedsReview => EXIT_NEEDS_REVIEW,
                ValidationStatus::Pass => EXIT_SUCCESS,
                _ if run.history.price.is_none() => EXIT_EXTRACTION_FAILED,
                _ => EXIT_NEEDS_REVIEW,
            })
        }
        Err(e) => {
            eprintln!("extraction failed: {e}");
            Ok(if e.to_string().contains("not found") {
                EXIT_NOT_FOUND
            } else {
                EXIT_EXTRACTION_FAILED
            })
        }
    }
}

async fn run_batch(runtime: &Runtime, machine_ids: Vec<String>) -> Result<i32> {
    if machine_ids.is_empty() {
        eprintln!("no machine ids given");
        return Ok(EXIT_NOT_FOUND);
    }

    let bar = indicatif::ProgressBar::new(machine_ids.len() as u64);
    bar.set_style(
        indicatif::ProgressStyle::with_template(
            "{spinner} [{elapsed_precise}] {bar:40.cyan/blue} {pos}/{len} ({msg})",
        )
        .unwrap_or_else(|_| indicatif::ProgressStyle::default_bar()),
    );
    let mut progress_rx = runtime.events.subscribe();
    let progress_bar = bar.clone();
    let progress_task = tokio::spawn(async move {
        while let Ok(event) = progress_rx.recv().await {
            if let ExtractionEvent::BatchProgress {
                completed, succeeded, failed, ..
            } = event
            {
                progress_bar.set_position(completed as u64);
                progress_bar.set_message(format!("{succeeded} ok, {failed} failed"));
            }
        }
    });

    let batch_id = runtime.batch_orchestrator.run_batch(machine_ids).await?;
    bar.finish_and_clear();
    progress_task.abort();

    println!("{}", serde_json::json!({ "batch_id": batch_id }));
    Ok(EXIT_SUCCESS)
}

async fn run_batch_status(runtime: &Runtime, batch_id: Uuid) -> Result<i32> {
    match runtime.store.get_batch(batch_id).await {
        Ok(batch) => {
            println!("{}", serde_json::to_string_pretty(&batch)?);
            Ok(if batch.status == BatchStatus::Completed {
                EXIT_SUCCESS
            } else {
                EXIT_EXTRACTION_FAILED
            })
        }
        Err(_) => {
            eprintln!("batch not found: {batch_id}");
            Ok(EXIT_NOT_FOUND)
        }
    }
}

async fn run_approval(runtime: &Runtime, history_id: Uuid, decision: ApprovalDecision) -> Result<i32> {
    let history = match runtime.store.get_price_history(history_id).await {
        Ok(h) => h,
        Err(_) => {
            eprintln!("price history row not found: {history_id}");
            return Ok(EXIT_NOT_FOUND);
        }
    };

    if matches!(decision, ApprovalDecision::Approve) {
        if let Some(price) = history.price {
            runtime
                .store
                .update_machine_price(&history.machine_id, price, chrono::Utc::now())
                .await?;
        }
    }
    runtime.store.resolve_price_history_approval(history_id).await?;
    println!(
        "{}",
        serde_json::json!({
            "history_id": history_id,
            "approved": matches!(decision, ApprovalDecision::Approve),
        })
    );
    Ok(EXIT_SUCCESS)
}

async fn run_serve(runtime: Runtime) -> Result<i32> {
    let state = Arc::new(AppState {
        orchestrator: runtime.orchestrator,
        batch_orchestrator: runtime.batch_orchestrator,
        store: runtime.store,
        http: runtime.http,
        fetch_timeout_ms: runtime.config.fetch_timeout_ms,
    });
    server::serve(&runtime.config.http_addr, state).await?;
    Ok(EXIT_SUCCESS)
}
