//! GTM Factory - multi-agent research orchestration
//!
//! Main entry point for the `gtm` CLI.

use clap::{Parser, Subcommand};
use gtm_factory::budget::compaction_hint;
use gtm_factory::config::{validate_config_result, FactoryConfig};
use gtm_factory::drop::{DropPlan, DropStateMachine};
use gtm_factory::hq::{DropInterrupts, Headquarters};
use gtm_factory::integrations::{
    AnthropicAgent, ConversationalAgent, HttpResearchEngine, ResearchEngine,
};
use gtm_factory::metadata::MetadataIndex;
use gtm_factory::session::{generate_session_id, ConversationSession, ResearchMode};
use gtm_factory::storage::{DurableStore, ProjectLayout};
use gtm_factory::GtmError;
use std::io::{self, BufRead, Write};
use std::path::PathBuf;
use std::process;
use std::sync::Arc;
use tokio::runtime::Runtime;

/// GTM Factory - research drops driven by a strategy conversation
#[derive(Parser, Debug)]
#[command(name = "gtm")]
#[command(version, about, long_about = None)]
struct Cli {
    /// Path to config file (default: ~/.config/gtm-factory/config.yaml)
    #[arg(short, long, env = "GTM_FACTORY_CONFIG")]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Write a default configuration file
    Init,

    /// List sessions in a project
    Sessions { project: String },

    /// Show a session's summary
    Status { project: String, session: String },

    /// List interrupted drops and how each would resume
    Recover {
        project: String,
        session: String,

        /// Resume them now instead of only listing
        #[arg(long)]
        resume: bool,
    },

    /// Mark an interrupted drop as failed
    MarkFailed {
        project: String,
        session: String,
        drop: String,

        #[arg(short, long, default_value = "marked failed by operator")]
        reason: String,
    },

    /// Regenerate a session's metadata index
    Metadata { project: String, session: String },

    /// Interactive session: type messages, /plan, /run, /context, /budget, /quit
    Chat {
        project: String,

        /// Continue an existing session
        #[arg(short, long)]
        session: Option<String>,

        /// Research mode (general, icp-validation, gtm-execution, competitive-intel)
        #[arg(short, long)]
        mode: Option<ResearchMode>,
    },
}

fn main() {
    if let Err(e) = gtm_factory::logging::init() {
        eprintln!("Failed to initialize logging: {}", e);
    }

    let cli = Cli::parse();

    if let Err(e) = run(cli) {
        eprintln!("Error: {}", e);
        process::exit(1);
    }
}

fn run(cli: Cli) -> gtm_factory::Result<()> {
    if let Commands::Init = cli.command {
        return handle_init_command(cli.config);
    }

    let config = FactoryConfig::load_or_default(cli.config.as_deref())?;
    validate_config_result(&config, false)?;
    let store = DurableStore::open(&config.projects_root)?;
    tracing::info!(root = %config.projects_root.display(), "Configuration loaded");

    match cli.command {
        Commands::Init => Ok(()),
        Commands::Sessions { project } => {
            let project = ProjectLayout::new(&project)?;
            let sessions = store.list_dirs(project.sessions_dir())?;
            if sessions.is_empty() {
                println!("No sessions in {}", project.name());
            }
            for id in sessions {
                println!("{}", id);
            }
            Ok(())
        }
        Commands::Status { project, session } => {
            let layout = ProjectLayout::new(&project)?.session(&session)?;
            let summary = MetadataIndex::new(store, layout).summarize_session()?;
            println!("Session: {}", summary.session_id);
            if let Some(mode) = &summary.mode {
                println!("Mode:    {}", mode);
            }
            println!(
                "Drops:   {} ({} researchers, {} tokens, ${:.2})",
                summary.total_drops,
                summary.total_researchers,
                summary.total_tokens,
                summary.total_cost
            );
            println!();
            for drop in &summary.drops {
                println!(
                    "  {:<8} {:<13} {} researchers  ${:.2}",
                    drop.drop_id, drop.state.as_str(), drop.researchers_count, drop.total_cost
                );
            }
            Ok(())
        }
        Commands::Recover {
            project,
            session,
            resume,
        } => handle_recover_command(&config, store, &project, &session, resume),
        Commands::MarkFailed {
            project,
            session,
            drop,
            reason,
        } => {
            let layout = ProjectLayout::new(&project)?.session(&session)?;
            let record = DropStateMachine::new(store.clone(), layout.clone()).fail(&drop, &reason)?;
            if let Err(e) = MetadataIndex::new(store, layout).refresh(&drop) {
                tracing::warn!(error = %e, "Metadata refresh failed");
            }
            println!("✓ {} is now {}", record.drop_id, record.state);
            Ok(())
        }
        Commands::Metadata { project, session } => {
            let layout = ProjectLayout::new(&project)?.session(&session)?;
            let machine = DropStateMachine::new(store.clone(), layout.clone());
            let index = MetadataIndex::new(store, layout);
            for drop_id in machine.list_drops()? {
                index.write_drop_summary(&drop_id)?;
            }
            let summary = index.write_session_summary()?;
            println!(
                "✓ Regenerated metadata for {} drops in {}",
                summary.total_drops, summary.session_id
            );
            Ok(())
        }
        Commands::Chat {
            project,
            session,
            mode,
        } => handle_chat_command(&config, store, &project, session, mode),
    }
}

fn handle_init_command(config_path: Option<PathBuf>) -> gtm_factory::Result<()> {
    let config_file = config_path.unwrap_or_else(FactoryConfig::default_path);

    if config_file.exists() {
        println!("Configuration already exists at {}", config_file.display());
        return Ok(());
    }

    let config = FactoryConfig::default();
    config.save(&config_file)?;

    println!("✓ Created configuration at {}", config_file.display());
    println!();
    println!("Next steps:");
    println!("  1. Export {}", config.agent.api_key_env);
    println!("  2. Start a session:");
    println!("     gtm chat myproject");
    Ok(())
}

fn build_services(
    config: &FactoryConfig,
) -> gtm_factory::Result<(Arc<dyn ConversationalAgent>, Arc<dyn ResearchEngine>)> {
    validate_config_result(config, true)?;
    let agent: Arc<dyn ConversationalAgent> = Arc::new(AnthropicAgent::from_settings(&config.agent)?);
    let engine: Arc<dyn ResearchEngine> =
        Arc::new(HttpResearchEngine::from_settings(&config.research)?);
    Ok((agent, engine))
}

fn open_headquarters(
    config: &FactoryConfig,
    store: DurableStore,
    project: &str,
    session_id: &str,
    mode: ResearchMode,
) -> gtm_factory::Result<Headquarters> {
    let (agent, engine) = build_services(config)?;
    let project = ProjectLayout::new(project)?;
    let session = ConversationSession::open(store, &project, session_id, mode, agent.clone())?
        .with_budget(config.context.tracker());
    Ok(Headquarters::from_config(config, session, agent, engine))
}

/// One Ctrl-C listener for the whole command
///
/// Ctrl-C cancels the running drop; with no drop running it exits.
fn install_interrupts(rt: &Runtime) -> DropInterrupts {
    let interrupts = DropInterrupts::new();
    let listener = interrupts.clone();
    rt.spawn(async move {
        while tokio::signal::ctrl_c().await.is_ok() {
            if !listener.interrupt() {
                process::exit(130);
            }
            eprintln!("\nCancelling...");
        }
    });
    interrupts
}

fn handle_recover_command(
    config: &FactoryConfig,
    store: DurableStore,
    project: &str,
    session: &str,
    resume: bool,
) -> gtm_factory::Result<()> {
    let layout = ProjectLayout::new(project)?.session(session)?;
    let machine = DropStateMachine::new(store.clone(), layout);
    let incomplete = machine.find_incomplete()?;
    if incomplete.is_empty() {
        println!("No interrupted drops");
        return Ok(());
    }

    for record in &incomplete {
        let plan = machine.recovery_plan(&record.drop_id)?;
        println!(
            "{:<8} {:<13} {} done, {} missing -> {}",
            plan.drop_id,
            plan.state.as_str(),
            plan.completed.len(),
            plan.missing.len(),
            plan.next_step
        );
    }
    if !resume {
        println!();
        println!("Run with --resume to continue, or mark-failed to abandon a drop.");
        return Ok(());
    }

    let rt = Runtime::new()?;
    let mut hq = open_headquarters(config, store, project, session, config.default_mode)?;
    let interrupts = install_interrupts(&rt);
    let cancel = interrupts.begin();
    let results = rt.block_on(hq.recover_all(&cancel));
    interrupts.end();
    for (drop_id, outcome) in results? {
        match outcome {
            Ok(outcome) => println!(
                "✓ {} complete ({} succeeded, {} failed)",
                drop_id,
                outcome.succeeded.len(),
                outcome.failed.len()
            ),
            Err(e) => println!("✗ {}: {}", drop_id, e),
        }
    }
    Ok(())
}

fn print_plan(plan: &DropPlan) {
    println!("Proposed {}: {}", plan.drop_id, plan.hypothesis);
    for assignment in &plan.assignments {
        println!("  {} - {}", assignment.id, assignment.focus_question);
    }
    println!("Type /run to start it.");
}

fn handle_chat_command(
    config: &FactoryConfig,
    store: DurableStore,
    project: &str,
    session: Option<String>,
    mode: Option<ResearchMode>,
) -> gtm_factory::Result<()> {
    let rt = Runtime::new()?;
    let stdin = io::stdin();
    let mut lines = stdin.lock().lines();
    let mode = mode.unwrap_or(config.default_mode);

    let mut pending_line = None;
    let session_id = match session {
        Some(id) => id,
        None => {
            print!("> ");
            io::stdout().flush()?;
            let Some(first) = lines.next().transpose()? else {
                return Ok(());
            };
            let id = generate_session_id(&first);
            pending_line = Some(first);
            id
        }
    };

    let mut hq = open_headquarters(config, store, project, &session_id, mode)?;
    let interrupts = install_interrupts(&rt);
    println!("Session {} ({})", hq.session().session_id(), hq.session().mode());
    let mut proposed: Option<DropPlan> = None;

    loop {
        let line = match pending_line.take() {
            Some(line) => line,
            None => {
                print!("> ");
                io::stdout().flush()?;
                match lines.next().transpose()? {
                    Some(line) => line,
                    None => break,
                }
            }
        };
        let line = line.trim();
        if line.is_empty() {
            continue;
        }

        let result = match line {
            "/quit" | "/exit" => break,
            "/budget" => {
                println!("Context: {}", hq.session().budget().format_display());
                if let Some(hint) =
                    compaction_hint(hq.session().messages(), config.context.keep_recent)
                {
                    println!("{}", hint);
                }
                Ok(())
            }
            "/context" => rt.block_on(hq.extract_user_context()).map(|ctx| {
                println!("{}", ctx.to_markdown());
            }),
            "/plan" => rt.block_on(hq.propose_drop()).map(|plan| match plan {
                Some(plan) => {
                    print_plan(&plan);
                    proposed = Some(plan);
                }
                None => println!("The agent needs more context before proposing a drop."),
            }),
            "/run" => match proposed.take() {
                Some(plan) => {
                    let cancel = interrupts.begin();
                    let result = rt.block_on(hq.run_drop(&plan, &cancel));
                    interrupts.end();
                    result.map(|outcome| {
                        println!(
                            "✓ {} complete: {} succeeded, {} failed",
                            outcome.drop_id,
                            outcome.succeeded.len(),
                            outcome.failed.len()
                        );
                        println!();
                        println!("{}", outcome.latest);
                    })
                }
                None => Err(GtmError::Other("no proposed drop; use /plan first".to_string())),
            },
            text => {
                let mut print_chunk = |chunk: &str| {
                    print!("{}", chunk);
                    let _ = io::stdout().flush();
                };
                rt.block_on(hq.session_mut().send_streaming(text, &mut print_chunk))
                    .map(|_| println!())
            }
        };

        if let Err(e) = result {
            eprintln!("Error: {}", e);
        }
    }
    Ok(())
}
