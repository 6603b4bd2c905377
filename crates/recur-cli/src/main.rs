use std::process::ExitCode;
use std::sync::Arc;

use anyhow::{Context, Result, bail};
use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use recur::{
    AgentConfig, AgentRunner, AnthropicProvider, CompletionOptions, Engine, JsonlSink,
    RetryingProvider, ToolRegistry, code_tools,
};

// Exit statuses for script embedding.
const EXIT_BUDGET: u8 = 2;
const EXIT_CANCELLED: u8 = 3;

#[derive(Parser)]
#[command(name = "recur", about = "Recursive completion engine")]
struct Cli {
    /// Model id passed to the provider
    #[arg(long, global = true, default_value = "claude-3-5-haiku-20241022")]
    model: String,

    /// Directory for append-only trajectory logs (JSONL, one file per run)
    #[arg(long, global = true)]
    log_dir: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run a single recursive completion
    Complete {
        /// The prompt to complete
        #[arg(trailing_var_arg = true)]
        prompt: Vec<String>,

        /// Optional system prompt
        #[arg(long)]
        system: Option<String>,

        /// Combined input+output token budget
        #[arg(long, default_value_t = 100_000)]
        token_budget: u64,

        /// Cost budget in dollars
        #[arg(long)]
        cost_budget: Option<f64>,

        /// Recursion depth cap
        #[arg(long, default_value_t = 3)]
        max_depth: u32,

        /// Wallclock deadline in seconds
        #[arg(long, default_value_t = 120)]
        timeout: u64,

        /// Dispatch a turn's tool calls concurrently
        #[arg(long)]
        parallel_tools: bool,
    },
    /// Run an autonomous agent until FINAL/FINAL_VAR or a limit
    Agent {
        /// The task to solve
        #[arg(trailing_var_arg = true)]
        task: Vec<String>,

        /// Iteration cap (hard-clamped to 50)
        #[arg(long, default_value_t = 10)]
        max_iterations: u32,

        /// Token budget across all iterations
        #[arg(long, default_value_t = 50_000)]
        token_budget: u64,

        /// Cost limit in dollars (hard-clamped to 10.00)
        #[arg(long, default_value_t = 2.0)]
        cost_limit: f64,

        /// Wallclock deadline in seconds (hard-clamped to 600)
        #[arg(long, default_value_t = 120)]
        timeout: u64,
    },
    /// List live interpreter sessions
    Sessions,
}

fn init_tracing() {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();
}

fn build_engine(cli: &Cli) -> Result<Engine<RetryingProvider<AnthropicProvider>>> {
    let api_key = std::env::var("ANTHROPIC_API_KEY")
        .context("ANTHROPIC_API_KEY environment variable is not set")?;
    let provider = RetryingProvider::with_defaults(AnthropicProvider::new(api_key, &cli.model));

    let registry = Arc::new(ToolRegistry::new());
    let mut builder = Engine::builder(Arc::new(provider)).registry(registry);
    if let Some(dir) = &cli.log_dir {
        builder = builder.sink(Arc::new(JsonlSink::new(dir)));
    }
    let engine = builder.build();

    for tool in code_tools(engine.sandbox().clone()) {
        engine.registry().register(tool)?;
    }
    Ok(engine)
}

#[tokio::main]
async fn main() -> ExitCode {
    match run().await {
        Ok(code) => code,
        Err(e) => {
            eprintln!("error: {e:#}");
            ExitCode::FAILURE
        }
    }
}

async fn run() -> Result<ExitCode> {
    let cli = Cli::parse();
    init_tracing();

    match &cli.command {
        Commands::Complete {
            prompt,
            system,
            token_budget,
            cost_budget,
            max_depth,
            timeout,
            parallel_tools,
        } => {
            let prompt = prompt.join(" ");
            if prompt.is_empty() {
                bail!("usage: recur complete <prompt>");
            }
            let engine = build_engine(&cli)?;
            let options = CompletionOptions {
                token_budget: *token_budget,
                cost_budget: *cost_budget,
                max_depth: *max_depth,
                timeout_seconds: *timeout,
                parallel_tools: *parallel_tools,
                ..Default::default()
            };

            let result = engine.complete(&prompt, system.as_deref(), options).await?;
            println!("{}", result.response);
            eprintln!(
                "[{} calls, {} tokens, {} tool calls, {}ms, cost {}]",
                result.total_calls,
                result.total_tokens,
                result.total_tool_calls,
                result.duration_ms,
                recur::format_cost(result.total_cost),
            );

            if let Some(violation) = result.violation {
                eprintln!("budget violated: {violation}");
                return Ok(ExitCode::from(EXIT_BUDGET));
            }
            Ok(ExitCode::SUCCESS)
        }
        Commands::Agent {
            task,
            max_iterations,
            token_budget,
            cost_limit,
            timeout,
        } => {
            let task = task.join(" ");
            if task.is_empty() {
                bail!("usage: recur agent <task>");
            }
            let engine = build_engine(&cli)?;
            let config = AgentConfig {
                max_iterations: *max_iterations,
                token_budget: *token_budget,
                cost_limit: *cost_limit,
                timeout_seconds: *timeout,
                ..Default::default()
            };
            let runner = AgentRunner::new(engine, config);

            let result = runner.run(&task).await;
            println!("{}", result.answer);
            eprintln!(
                "[{} iterations, {} tokens, {}ms, terminal {:?}]",
                result.iterations, result.total_tokens, result.duration_ms, result.terminal,
            );

            match result.terminal {
                recur::TerminalKind::Cancelled => Ok(ExitCode::from(EXIT_CANCELLED)),
                recur::TerminalKind::Error => Ok(ExitCode::FAILURE),
                kind if kind.is_forced() => Ok(ExitCode::from(EXIT_BUDGET)),
                _ => Ok(ExitCode::SUCCESS),
            }
        }
        Commands::Sessions => {
            let engine = build_engine(&cli)?;
            let sessions = engine.sandbox().sessions().list().await;
            if sessions.is_empty() {
                println!("no live sessions");
            } else {
                for info in sessions {
                    println!(
                        "{}\tcreated {}\tlast used {}\t{} variables",
                        info.id, info.created_at, info.last_access, info.variable_count
                    );
                }
            }
            Ok(ExitCode::SUCCESS)
        }
    }
}
