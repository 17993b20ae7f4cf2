//! Ralph Healer - self-healing supervisor for the Ralph automation loop.

use clap::{Parser, Subcommand, ValueEnum};
use colored::Colorize;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tracing::warn;

use ralph_healer::analyzer::AnalysisSource;
use ralph_healer::verify::CheckSpec;
use ralph_healer::{
    hash_error, normalize_error, AdmissionController, AnalysisCache, ClaudeClient, HealerConfig,
    LlmAnalyzer, Monitor, MonitorEvent, MonitorState, PatternClassifier, PauseController,
    StatePaths, VerificationEngine, WisdomStore,
};

#[derive(Parser)]
#[command(name = "ralph-healer")]
#[command(version)]
#[command(about = "Self-healing supervisor for Ralph automation loops", long_about = None)]
#[command(propagate_version = true)]
struct Cli {
    /// Project directory (defaults to current directory)
    #[arg(short, long, global = true, default_value = ".")]
    project: PathBuf,

    /// Verbose output
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Log output format
    #[arg(long, global = true, value_enum, default_value = "text")]
    log_format: LogFormat,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum LogFormat {
    Text,
    Json,
}

#[derive(Subcommand)]
enum Commands {
    /// Tail a loop log and heal failures until interrupted
    Watch {
        /// Log file to tail
        log: PathBuf,

        /// Print every monitor event as a JSON line on stdout
        #[arg(long)]
        events: bool,
    },

    /// Classify a single log line
    Classify {
        line: String,

        /// Output JSON
        #[arg(long)]
        json: bool,
    },

    /// Print the normalized hash of an error message
    Hash {
        message: String,

        /// Also print the normalized form
        #[arg(long)]
        normalized: bool,
    },

    /// Diagnose an error message (cache, rules, then LLM)
    Analyze {
        message: String,

        /// Output JSON
        #[arg(long)]
        json: bool,
    },

    /// Run verification checks
    Verify {
        /// Claim being verified
        #[arg(long, default_value = "manual verification")]
        claim: String,

        /// Log file scanned by the ERROR_FREE check
        #[arg(long)]
        log: Option<PathBuf>,

        /// Checks to run, comma separated (e.g. build,test)
        #[arg(long, value_delimiter = ',')]
        checks: Vec<String>,

        /// Output JSON
        #[arg(long)]
        json: bool,
    },

    /// Show session, wisdom, cache and pause state
    Status {
        /// Output JSON
        #[arg(long)]
        json: bool,
    },

    /// Remove expired cache entries and wisdom patterns
    CachePrune,

    /// Clear an active pause
    Resume,
}

fn init_tracing(verbose: bool, format: LogFormat) {
    let filter = if verbose {
        "ralph_healer=debug,info"
    } else {
        "ralph_healer=info,warn"
    };
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(filter));

    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr);
    match format {
        LogFormat::Text => builder.init(),
        LogFormat::Json => builder.json().init(),
    }
}

fn load_config(project: &Path) -> HealerConfig {
    let config = match HealerConfig::load(project) {
        Ok(config) => config,
        Err(e) => {
            warn!("[healer] {}. Using default configuration.", e);
            HealerConfig::default()
        }
    };
    if let Err(e) = config.validate() {
        eprintln!("{} Invalid configuration: {}", "Error:".red().bold(), e);
        std::process::exit(7);
    }
    config
}

fn claude_client(project: &Path, config: &HealerConfig) -> Arc<ClaudeClient> {
    if !ClaudeClient::is_available() {
        warn!("[healer] claude CLI not found on PATH; LLM analysis will fall back to rules");
    }
    Arc::new(
        ClaudeClient::new(project)
            .with_model(&config.llm.model)
            .with_timeout(Duration::from_secs(config.llm.timeout_secs)),
    )
}

fn print_json<T: serde::Serialize>(value: &T) -> anyhow::Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.verbose, cli.log_format);

    let project = cli.project.canonicalize().unwrap_or(cli.project.clone());
    if !project.exists() {
        eprintln!(
            "{} Project directory does not exist: {}",
            "Error:".red().bold(),
            project.display()
        );
        std::process::exit(1);
    }
    let paths = StatePaths::for_project(&project);

    match cli.command {
        Commands::Watch { log, events } => {
            let config = load_config(&project);
            let log = if log.is_absolute() { log } else { project.join(log) };
            let client = claude_client(&project, &config);
            let monitor = Arc::new(
                Monitor::new(&project, paths, config, client).with_log(&log),
            );

            let printer = events.then(|| {
                let mut rx = monitor.subscribe();
                tokio::spawn(async move {
                    while let Ok(event) = rx.recv().await {
                        if let Ok(line) = serde_json::to_string(&event) {
                            println!("{line}");
                        }
                        if matches!(event, MonitorEvent::Stopped { .. }) {
                            break;
                        }
                    }
                })
            });

            let handle = match monitor.clone().watch(&log) {
                Ok(handle) => handle,
                Err(e) => {
                    eprintln!("{} {}", "Error:".red().bold(), e);
                    std::process::exit(e.exit_code());
                }
            };
            eprintln!(
                "{} Watching {} (Ctrl-C to stop)",
                "▶".green().bold(),
                log.display()
            );

            let interrupt = monitor.clone();
            tokio::spawn(async move {
                if tokio::signal::ctrl_c().await.is_ok() {
                    interrupt.stop("interrupted");
                }
            });

            let reason = handle.wait().await;
            if let Some(printer) = printer {
                let _ = tokio::time::timeout(Duration::from_secs(1), printer).await;
            }
            let health = monitor.health();
            eprintln!(
                "{} Monitor stopped ({}): {} actions, {} blocked, circuit {}",
                "■".yellow().bold(),
                reason,
                health.actions.total,
                health.actions.blocked,
                health.circuit_state
            );
        }

        Commands::Classify { line, json } => {
            let classifier = PatternClassifier::new();
            match classifier.classify(&line) {
                Some(m) if json => print_json(&m)?,
                Some(m) => {
                    println!("{} [{}]", m.kind.as_str().bold(), m.severity);
                    for (key, value) in &m.context {
                        println!("  {}: {}", key, value);
                    }
                }
                None if json => println!("null"),
                None if classifier.is_unknown_error_candidate(&line) => {
                    println!("{}", "unknown error".yellow());
                }
                None => println!("{}", "no match".dimmed()),
            }
        }

        Commands::Hash {
            message,
            normalized,
        } => {
            println!("{}", hash_error(&message));
            if normalized {
                println!("{}", normalize_error(&message));
            }
        }

        Commands::Analyze { message, json } => {
            let config = load_config(&project);
            let client = claude_client(&project, &config);
            let analyzer = LlmAnalyzer::new(
                client,
                Arc::new(AdmissionController::new(config.concurrency.clone())),
                Duration::from_millis(config.concurrency.acquire_timeout_ms),
                config.llm.clone(),
                &config.cache,
                AnalysisCache::load(&paths.cache_file, config.cache.ttl_ms),
            );

            // Paid calls count against the current session.
            let mut state =
                MonitorState::resume_or_start(&paths.monitor_state_file, &config, chrono::Utc::now());
            analyzer.restore_throttle(state.throttle());

            let analysis = analyzer.analyze(&message).await;

            if analysis.source == AnalysisSource::Llm {
                state.set_throttle(analyzer.throttle_snapshot());
                if let Err(e) = state.save(&paths.monitor_state_file) {
                    warn!("[healer] Failed to save monitor state: {}", e);
                }
            }

            if json {
                print_json(&serde_json::json!({
                    "analysis": analysis,
                    "source": analysis.source.to_string(),
                    "cached": analysis.cached,
                }))?;
            } else {
                println!("{} {}", "Root cause:".bold(), analysis.root_cause);
                println!(
                    "{} {:.2} ({}{})",
                    "Confidence:".bold(),
                    analysis.confidence,
                    analysis.source,
                    if analysis.cached { ", cached" } else { "" }
                );
                for fix in &analysis.suggested_fixes {
                    println!("  - {}", fix);
                }
            }
        }

        Commands::Verify {
            claim,
            log,
            checks,
            json,
        } => {
            let mut config = load_config(&project);
            if !checks.is_empty() {
                let mut specs = Vec::with_capacity(checks.len());
                for name in &checks {
                    let check = serde_json::from_value(serde_json::Value::String(
                        name.trim().to_uppercase(),
                    ))
                    .map_err(|_| anyhow::anyhow!("unknown check '{}'", name))?;
                    specs.push(CheckSpec::required(check));
                }
                config.verification.checks = specs;
            }

            let mut engine = VerificationEngine::new(&project, config.verification.clone());
            if let Some(log) = log {
                engine = engine.with_log(log);
            }
            let result = engine.verify(&claim).await;

            if json {
                print_json(&result)?;
            } else {
                for check in &result.checks {
                    let mark = if check.skipped {
                        "-".dimmed()
                    } else if check.passed {
                        "✓".green()
                    } else {
                        "✗".red()
                    };
                    println!(
                        "{} {} ({}ms){}",
                        mark,
                        check.check,
                        check.duration_ms,
                        if check.required { "" } else { " [optional]" }
                    );
                    if !check.passed {
                        let lines: Vec<&str> = check.output.lines().collect();
                        for line in &lines[lines.len().saturating_sub(10)..] {
                            println!("    {}", line.dimmed());
                        }
                    }
                }
                println!("{}", result.summary());
            }

            if !result.passed {
                std::process::exit(1);
            }
        }

        Commands::Status { json } => {
            let config = load_config(&project);
            let state = MonitorState::load(&paths.monitor_state_file);
            let wisdom = WisdomStore::load(&paths.wisdom_file, config.wisdom.clone()).stats();
            let cache = AnalysisCache::load(&paths.cache_file, config.cache.ttl_ms);
            let pause =
                PauseController::new(&paths.pause_file, config.pause.max_pause_ms).state();

            if json {
                print_json(&serde_json::json!({
                    "session": state,
                    "wisdom": wisdom,
                    "cacheEntries": cache.len(),
                    "pause": pause,
                }))?;
                return Ok(());
            }

            println!("{}", "Session".bold());
            match &state {
                Some(s) => {
                    println!("  id:            {}", s.session_id);
                    println!("  started:       {}", s.start_time.to_rfc3339());
                    println!("  last activity: {}", s.last_activity.to_rfc3339());
                    println!("  circuit:       {}", s.circuit_breaker.state());
                    println!(
                        "  llm calls:     {}/{}",
                        s.llm_calls_count, config.llm.max_per_session
                    );
                    println!(
                        "  recoveries:    {} attempted, {} succeeded, {} failed",
                        s.recovery_attempts, s.recovery_successes, s.recovery_failures
                    );
                    for (pattern, count) in &s.detected_patterns {
                        println!("    {:<20} {}", pattern, count);
                    }
                }
                None => println!("  {}", "no session recorded".dimmed()),
            }

            println!("{}", "Wisdom".bold());
            println!(
                "  {} patterns ({} trusted), {} sessions, {} heals, {} failures",
                wisdom.patterns,
                wisdom.trusted,
                wisdom.session_count,
                wisdom.total_heals,
                wisdom.total_failures
            );

            println!("{}", "Cache".bold());
            println!("  {} entries", cache.len());

            println!("{}", "Pause".bold());
            match pause {
                Some(p) => println!(
                    "  {} until {} ({})",
                    "paused".yellow(),
                    p.resume_at.to_rfc3339(),
                    p.reason
                ),
                None => println!("  {}", "not paused".green()),
            }
        }

        Commands::CachePrune => {
            let config = load_config(&project);
            let mut cache = AnalysisCache::load(&paths.cache_file, config.cache.ttl_ms);
            let removed = cache.cleanup();
            // Loading the store drops expired patterns.
            let wisdom = WisdomStore::load(&paths.wisdom_file, config.wisdom.clone()).stats();
            println!(
                "{} Removed {} expired cache entries ({} left), {} wisdom patterns kept",
                "✓".green().bold(),
                removed,
                cache.len(),
                wisdom.patterns
            );
        }

        Commands::Resume => {
            let config = load_config(&project);
            let pause = PauseController::new(&paths.pause_file, config.pause.max_pause_ms);
            if pause.is_paused() {
                pause.resume();
                println!("{} Pause cleared", "✓".green().bold());
            } else {
                println!("{}", "Not paused".dimmed());
            }
        }
    }

    Ok(())
}
