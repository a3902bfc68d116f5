//! Neura application binary - composition root.
//!
//! 1. Parse the command line and load configuration from TOML
//! 2. Initialize tracing on stderr
//! 3. Build the inference engine (llama.cpp with the `llama` feature, mock otherwise)
//! 4. Run the chat session on a blocking thread until exit or end of input
//!
//! Ctrl-C cancels the reply being generated; it does not end the session.

mod cli;
mod terminal;

use clap::Parser;

use neura_chat::{CancelFlag, ChatSession, SessionSummary};
use neura_core::NeuraConfig;

use crate::cli::CliArgs;
use crate::terminal::ConsoleOperator;

type BoxError = Box<dyn std::error::Error + Send + Sync>;

#[cfg(feature = "llama")]
fn run_session(config: NeuraConfig, cancel: CancelFlag) -> Result<SessionSummary, BoxError> {
    use neura_engine::LlamaRuntime;

    let runtime = LlamaRuntime::load(&config.model)?;
    let engine = runtime.engine(&config.sampling)?;
    tracing::info!(model = %config.model.path, "Model loaded");

    let mut session = ChatSession::new(engine, &config.chat).with_cancel_flag(cancel);
    let mut operator = ConsoleOperator::new(config.chat.stream);
    operator.greet(&config.chat.exit_command)?;
    Ok(session.run(&mut operator)?)
}

#[cfg(not(feature = "llama"))]
fn run_session(config: NeuraConfig, cancel: CancelFlag) -> Result<SessionSummary, BoxError> {
    use neura_engine::{ChatTemplate, MockEngine};

    tracing::warn!("Built without the llama backend; replies come from the mock engine");
    let template =
        ChatTemplate::preset(&config.model.template).unwrap_or_else(ChatTemplate::mistral);
    let engine = MockEngine::new(template, config.model.context_size as usize);

    let mut session = ChatSession::new(engine, &config.chat).with_cancel_flag(cancel);
    let mut operator = ConsoleOperator::new(config.chat.stream);
    operator.greet(&config.chat.exit_command)?;
    Ok(session.run(&mut operator)?)
}

#[tokio::main]
async fn main() -> Result<(), BoxError> {
    let args = CliArgs::parse();

    // Config is read first for its log level; the outcome is logged below.
    let (config_file, config, config_load) = args.load_config();

    // Tracing. RUST_LOG overrides the configured level.
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(&config.general.log_level)),
        )
        .with_writer(std::io::stderr)
        .init();

    tracing::info!("Starting Neura v{}", env!("CARGO_PKG_VERSION"));
    config_load.log(&config_file);

    if let Err(e) = config.validate() {
        tracing::error!(error = %e, "Invalid configuration");
        return Err(e.into());
    }

    // Ctrl-C interrupts the current reply only.
    let cancel = CancelFlag::new();
    let signal_flag = cancel.clone();
    tokio::spawn(async move {
        while tokio::signal::ctrl_c().await.is_ok() {
            tracing::debug!("Interrupt received, cancelling generation");
            signal_flag.cancel();
        }
    });

    let summary = tokio::task::spawn_blocking(move || run_session(config, cancel)).await??;

    tracing::info!(
        session_id = %summary.id,
        turns = summary.turns_completed,
        failed = summary.turns_failed,
        "Goodbye"
    );
    Ok(())
}
