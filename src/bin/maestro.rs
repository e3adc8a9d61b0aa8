//! The `maestro` CLI: knowledge-index lookups, memory operations, and
//! session/run state management for the orchestration runtime.
//!
//! Every command prints formatted text by default and JSON with `--json`.
//! Exit codes: 0 success, 1 generic failure (including missing sessions
//! and empty search results), 5 configuration error.

use clap::{Parser, Subcommand};
use maestro::maestro::memory::SessionDraft;
use maestro::maestro::paths::{AccessMode, ArtifactKind};
use maestro::maestro::router;
use maestro::maestro::state::{run_summary, RunStatus, StateStore};
use maestro::maestro::knowledge::{Domain, KnowledgeIndex};
use maestro::maestro::memory::MemoryStore;
use maestro::maestro::paths::Resolver;
use serde_json::json;
use std::io::Read;
use std::process::ExitCode;
use std::sync::Arc;

#[derive(Parser)]
#[command(name = "maestro", version, about = "Multi-agent orchestration runtime")]
struct Cli {
    /// Emit JSON instead of formatted text.
    #[arg(long, global = true)]
    json: bool,
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Query the knowledge index.
    Kb {
        /// Search query (ignored with --get or --stats).
        query: Option<String>,
        /// Restrict results to one domain (skill|agent|workflow).
        #[arg(long)]
        domain: Option<String>,
        /// Comma-separated tags, AND semantics.
        #[arg(long)]
        tags: Option<String>,
        /// Fetch a single entry by name or alias.
        #[arg(long)]
        get: Option<String>,
        /// Print index statistics.
        #[arg(long)]
        stats: bool,
    },
    /// Persistent memory operations.
    Memory {
        #[command(subcommand)]
        command: MemoryCommand,
    },
    /// Session and run state operations.
    State {
        #[command(subcommand)]
        command: StateCommand,
    },
}

#[derive(Subcommand)]
enum MemoryCommand {
    /// Record a gotcha (deduplicated).
    RecordGotcha { text: String },
    /// Record a reusable pattern (deduplicated).
    RecordPattern { text: String },
    /// Record a codebase discovery.
    RecordDiscovery {
        path: String,
        description: String,
        category: String,
    },
    /// Print the truncated context view.
    Load,
    /// Print per-category counts and sizes.
    Stats,
    /// Save a session record; the draft is read as JSON from stdin.
    SaveSession,
}

#[derive(Subcommand)]
enum StateCommand {
    /// Initialize a router session.
    Init { session_id: String, role: String },
    /// Reset a router session to its initial state.
    Reset { session_id: String },
    /// Summarize a run.
    Summary { run_id: String },
    /// Delete a router session.
    Clear { session_id: String },
    /// List runs on disk.
    List,
    /// Purge completed and failed runs.
    Cleanup,
    /// Print accumulated costs for a session.
    Costs { session_id: String },
    /// Print routing metrics for a session.
    Metrics { session_id: String },
}

fn main() -> ExitCode {
    env_logger::init();
    let cli = Cli::parse();

    let resolver = match Resolver::discover() {
        Ok(resolver) => Arc::new(resolver),
        Err(_) => match std::env::current_dir() {
            Ok(cwd) => Arc::new(Resolver::new(cwd)),
            Err(err) => {
                eprintln!("cannot determine working directory: {}", err);
                return ExitCode::from(5);
            }
        },
    };

    match cli.command {
        Command::Kb {
            query,
            domain,
            tags,
            get,
            stats,
        } => run_kb(&resolver, cli.json, query, domain, tags, get, stats),
        Command::Memory { command } => run_memory(&resolver, cli.json, command),
        Command::State { command } => run_state(&resolver, cli.json, command),
    }
}

fn run_kb(
    resolver: &Arc<Resolver>,
    json: bool,
    query: Option<String>,
    domain: Option<String>,
    tags: Option<String>,
    get: Option<String>,
    stats: bool,
) -> ExitCode {
    let csv_path = match resolver.resolve_artifact(ArtifactKind::Reference, "knowledge-index.csv") {
        Ok(path) => path,
        Err(err) => {
            eprintln!("cannot resolve the knowledge index: {}", err);
            return ExitCode::from(5);
        }
    };
    let index = KnowledgeIndex::open(csv_path);

    if stats {
        let stats = index.stats();
        if json {
            println!("{}", json!(stats));
        } else {
            println!(
                "{} entries ({} skills, {} agents, {} workflows, {} deprecated)",
                stats.total, stats.skills, stats.agents, stats.workflows, stats.deprecated
            );
        }
        return ExitCode::SUCCESS;
    }

    if let Some(name) = get {
        return match index.get(&name) {
            Some(row) => {
                if json {
                    println!("{}", json!(row));
                } else {
                    println!("{} [{}] {} - {}", row.name, row.domain.as_str(), row.path, row.description);
                }
                ExitCode::SUCCESS
            }
            None => {
                eprintln!("no entry named {}", name);
                ExitCode::FAILURE
            }
        };
    }

    let mut rows = match &query {
        Some(query) => index.search(query),
        None => index.list_all(),
    };
    if let Some(domain) = domain.as_deref().and_then(Domain::parse) {
        rows.retain(|row| row.domain == domain);
    }
    if let Some(tags) = tags {
        let tags: Vec<String> = tags.split(',').map(|t| t.trim().to_string()).collect();
        let tagged = index.filter_by_tags(&tags);
        rows.retain(|row| tagged.iter().any(|t| t.name == row.name));
    }

    if rows.is_empty() {
        eprintln!("no results");
        return ExitCode::FAILURE;
    }
    if json {
        println!("{}", json!(rows));
    } else {
        for row in rows {
            println!("{} [{}] - {}", row.name, row.domain.as_str(), row.description);
        }
    }
    ExitCode::SUCCESS
}

fn run_memory(resolver: &Arc<Resolver>, json: bool, command: MemoryCommand) -> ExitCode {
    let store = MemoryStore::new(Arc::clone(resolver));
    let result = match command {
        MemoryCommand::RecordGotcha { text } => store.record_gotcha(&text).map(|added| {
            if json {
                println!("{}", json!({"recorded": added}));
            } else if added {
                println!("gotcha recorded");
            } else {
                println!("duplicate, skipped");
            }
        }),
        MemoryCommand::RecordPattern { text } => store.record_pattern(&text).map(|added| {
            if json {
                println!("{}", json!({"recorded": added}));
            } else if added {
                println!("pattern recorded");
            } else {
                println!("duplicate, skipped");
            }
        }),
        MemoryCommand::RecordDiscovery {
            path,
            description,
            category,
        } => store.record_discovery(&path, &description, &category).map(|_| {
            if json {
                println!("{}", json!({"recorded": true}));
            } else {
                println!("discovery recorded");
            }
        }),
        MemoryCommand::Load => {
            let context = store.load_memory_for_context();
            if json {
                println!("{}", json!(context));
            } else {
                println!(
                    "{} gotchas, {} patterns, {} discoveries, {} recent sessions",
                    context.gotchas.len(),
                    context.patterns.len(),
                    context.discoveries.len(),
                    context.recent_sessions.len()
                );
            }
            Ok(())
        }
        MemoryCommand::Stats => {
            let stats = store.stats();
            if json {
                println!("{}", json!(stats));
            } else {
                println!(
                    "{} gotchas, {} patterns, {} discoveries, {} sessions, {} bytes",
                    stats.gotcha_count,
                    stats.pattern_count,
                    stats.discovery_count,
                    stats.session_count,
                    stats.total_bytes
                );
            }
            Ok(())
        }
        MemoryCommand::SaveSession => {
            let mut raw = String::new();
            if let Err(err) = std::io::stdin().read_to_string(&mut raw) {
                eprintln!("cannot read stdin: {}", err);
                return ExitCode::FAILURE;
            }
            let draft: SessionDraft = match serde_json::from_str(&raw) {
                Ok(draft) => draft,
                Err(err) => {
                    eprintln!("invalid session draft: {}", err);
                    return ExitCode::FAILURE;
                }
            };
            store.save_session(&draft).map(|sequence| {
                if json {
                    println!("{}", json!({"sequence_number": sequence}));
                } else {
                    println!("saved session {:03}", sequence);
                }
            })
        }
    };
    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            eprintln!("{}", err);
            ExitCode::FAILURE
        }
    }
}

fn run_state(resolver: &Arc<Resolver>, json: bool, command: StateCommand) -> ExitCode {
    let state = StateStore::new(Arc::clone(resolver));
    match command {
        StateCommand::Init { session_id, role } => {
            match router::init_session_state(resolver, &session_id, &role, "haiku-fast") {
                Ok(session) => {
                    if json {
                        println!("{}", json!({"session_id": session.session_id}));
                    } else {
                        println!("initialized session {}", session.session_id);
                    }
                    ExitCode::SUCCESS
                }
                Err(err) => {
                    eprintln!("{}", err);
                    ExitCode::FAILURE
                }
            }
        }
        StateCommand::Reset { session_id } => {
            match router::load_session_state(resolver, &session_id) {
                Ok(Some(existing)) => {
                    match router::init_session_state(resolver, &session_id, &existing.agent_role, &existing.model)
                    {
                        Ok(_) => {
                            if json {
                                println!("{}", json!({"reset": session_id}));
                            } else {
                                println!("reset session {}", session_id);
                            }
                            ExitCode::SUCCESS
                        }
                        Err(err) => {
                            eprintln!("{}", err);
                            ExitCode::FAILURE
                        }
                    }
                }
                Ok(None) => {
                    eprintln!("no session {}", session_id);
                    ExitCode::FAILURE
                }
                Err(err) => {
                    eprintln!("{}", err);
                    ExitCode::FAILURE
                }
            }
        }
        StateCommand::Summary { run_id } => match state.load_run(&run_id) {
            Ok(run) => {
                let summary = run_summary(&run);
                if json {
                    println!("{}", summary);
                } else {
                    println!(
                        "run {} [{:?}] step {} of workflow {}",
                        run.id, run.status, run.current_step, run.workflow
                    );
                }
                ExitCode::SUCCESS
            }
            Err(err) => {
                eprintln!("{}", err);
                ExitCode::FAILURE
            }
        },
        StateCommand::Clear { session_id } => {
            let path = match resolver
                .resolve_runtime(&format!("sessions/{}.json", session_id), AccessMode::Read)
            {
                Ok(path) => path,
                Err(err) => {
                    eprintln!("{}", err);
                    return ExitCode::FAILURE;
                }
            };
            if !path.exists() {
                eprintln!("no session {}", session_id);
                return ExitCode::FAILURE;
            }
            match std::fs::remove_file(&path) {
                Ok(()) => {
                    if json {
                        println!("{}", json!({"cleared": session_id}));
                    } else {
                        println!("cleared session {}", session_id);
                    }
                    ExitCode::SUCCESS
                }
                Err(err) => {
                    eprintln!("{}", err);
                    ExitCode::FAILURE
                }
            }
        }
        StateCommand::List => match state.list_runs() {
            Ok(runs) => {
                if json {
                    println!("{}", json!(runs));
                } else {
                    for run in runs {
                        println!("{}", run);
                    }
                }
                ExitCode::SUCCESS
            }
            Err(err) => {
                eprintln!("{}", err);
                ExitCode::FAILURE
            }
        },
        StateCommand::Cleanup => match state.list_runs() {
            Ok(runs) => {
                let mut purged = 0usize;
                for run_id in runs {
                    let Ok(run) = state.load_run(&run_id) else {
                        continue;
                    };
                    if matches!(run.status, RunStatus::Completed | RunStatus::Failed) {
                        if state.purge_run(&run_id).is_ok() {
                            purged += 1;
                        }
                    }
                }
                if json {
                    println!("{}", json!({"purged": purged}));
                } else {
                    println!("purged {} runs", purged);
                }
                ExitCode::SUCCESS
            }
            Err(err) => {
                eprintln!("{}", err);
                ExitCode::FAILURE
            }
        },
        StateCommand::Costs { session_id } => {
            match router::load_session_state(resolver, &session_id) {
                Ok(Some(session)) => {
                    if json {
                        println!("{}", json!(session.costs));
                    } else {
                        println!(
                            "session {} total ${:.5} across {} invocations",
                            session_id,
                            session.costs.total_usd,
                            session.costs.model_usage.len()
                        );
                    }
                    ExitCode::SUCCESS
                }
                Ok(None) => {
                    eprintln!("no session {}", session_id);
                    ExitCode::FAILURE
                }
                Err(err) => {
                    eprintln!("{}", err);
                    ExitCode::FAILURE
                }
            }
        }
        StateCommand::Metrics { session_id } => {
            match router::load_session_state(resolver, &session_id) {
                Ok(Some(session)) => {
                    if json {
                        println!("{}", json!(session.routing_decisions));
                    } else {
                        let m = &session.routing_decisions;
                        println!(
                            "{} decisions ({} simple, {} routed), avg complexity {:.2}, avg confidence {:.2}",
                            m.total, m.simple_handled, m.routed_to_orchestrator, m.avg_complexity, m.avg_confidence
                        );
                    }
                    ExitCode::SUCCESS
                }
                Ok(None) => {
                    eprintln!("no session {}", session_id);
                    ExitCode::FAILURE
                }
                Err(err) => {
                    eprintln!("{}", err);
                    ExitCode::FAILURE
                }
            }
        }
    }
}
