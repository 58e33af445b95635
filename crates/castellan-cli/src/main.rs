use anyhow::{Context, Result, anyhow};
use castellan_agent::AgentLoop;
use castellan_agent::tool_loop::TurnStatus;
use castellan_core::{AppConfig, ConversationMode, NullRetriever};
use castellan_llm::HttpLlmClient;
use castellan_observe::Observer;
use castellan_policy::Sandbox;
use castellan_store::TranscriptStore;
use castellan_tools::ToolHost;
use castellan_web::{RateLimiter, SafeUrlChecker, WebClient};
use clap::{Parser, Subcommand};
use std::io::{self, BufRead, Write};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

#[derive(Parser)]
#[command(name = "castellan")]
#[command(about = "Castellan autonomous coding agent", long_about = None)]
struct Cli {
    /// Project directory the agent works inside.
    #[arg(long, global = true, default_value = ".")]
    project: PathBuf,

    /// Conversation mode: phased or siege.
    #[arg(long, global = true)]
    mode: Option<String>,

    /// Echo runtime log lines to stderr.
    #[arg(long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Interactive chat session.
    Chat,
    /// Run a single prompt and exit.
    Run {
        prompt: String,
    },
    /// List saved conversations for this project.
    Conversations,
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    match cli.command {
        Command::Chat => run_chat(&cli),
        Command::Run { ref prompt } => run_once(&cli, prompt),
        Command::Conversations => list_conversations(&cli),
    }
}

fn build_agent(cli: &Cli) -> Result<AgentLoop> {
    let config = AppConfig::load(&cli.project)?;
    let mode = match &cli.mode {
        Some(raw) => raw
            .parse::<ConversationMode>()
            .map_err(|_| anyhow!("unknown mode '{raw}', expected 'phased' or 'siege'"))?,
        None => config.agent.mode,
    };

    let sandbox = Sandbox::new(&cli.project)
        .with_context(|| format!("cannot open project directory {}", cli.project.display()))?;
    let tools = ToolHost::new(sandbox, config.tools.clone());
    let limiter = Arc::new(RateLimiter::new(
        config.web.max_requests_per_minute,
        Duration::from_secs(60),
    ));
    let web = WebClient::new(&config.web, Arc::new(SafeUrlChecker::new()), limiter)?;
    let llm = HttpLlmClient::new(config.llm.clone())?;
    let store = TranscriptStore::new(&cli.project)?;
    let mut observer = Observer::new(&cli.project)?;
    observer.set_verbose(cli.verbose);

    Ok(AgentLoop::new(
        Box::new(llm),
        tools,
        web,
        Box::new(NullRetriever),
        store,
        observer,
        mode,
        config.agent.history_window,
    ))
}

fn run_once(cli: &Cli, prompt: &str) -> Result<()> {
    let mut agent = build_agent(cli)?;
    let outcome = agent.run_turn(prompt, &print_chunk)?;
    finish_line(outcome.status);
    Ok(())
}

fn run_chat(cli: &Cli) -> Result<()> {
    let mut agent = build_agent(cli)?;
    println!("castellan chat. Empty line or 'exit' to quit.");
    let stdin = io::stdin();
    loop {
        print!("> ");
        io::stdout().flush()?;
        let mut line = String::new();
        if stdin.lock().read_line(&mut line)? == 0 {
            break;
        }
        let prompt = line.trim();
        if prompt.is_empty() || prompt == "exit" {
            break;
        }
        let outcome = agent.run_turn(prompt, &print_chunk)?;
        finish_line(outcome.status);
    }
    Ok(())
}

fn list_conversations(cli: &Cli) -> Result<()> {
    let store = TranscriptStore::new(&cli.project)?;
    let ids = store.list()?;
    if ids.is_empty() {
        println!("No saved conversations.");
        return Ok(());
    }
    for id in ids {
        println!("{id}");
    }
    Ok(())
}

fn print_chunk(chunk: &str) {
    print!("{chunk}");
    let _ = io::stdout().flush();
}

fn finish_line(status: TurnStatus) {
    match status {
        TurnStatus::Completed => println!(),
        TurnStatus::PhaseGated => println!("\n[phase limit reached; reply to continue]"),
        TurnStatus::Interrupted => println!("\n[interrupted]"),
    }
}
