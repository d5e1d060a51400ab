use ates_ledger::application::engine::LedgerEngine;
use ates_ledger::application::identity::Authorizer;
use ates_ledger::application::retry::RetryPolicy;
use ates_ledger::config::{Cli, Command, ReplayArgs, ServeArgs};
use ates_ledger::domain::event::topics;
use ates_ledger::infrastructure::auth::HttpIdentityVerifier;
use ates_ledger::infrastructure::in_memory::InMemoryBus;
use ates_ledger::infrastructure::log_sink::TracingSink;
use ates_ledger::interfaces::csv::account_writer::AccountWriter;
use ates_ledger::interfaces::http::{self, AppState};
use ates_ledger::interfaces::messaging::consumer::{ConsumerConfig, EventConsumer};
use ates_ledger::interfaces::messaging::outbox::OutboxRelay;
use ates_ledger::interfaces::replay::Replayer;
use clap::Parser;
use miette::{IntoDiagnostic, Result};
use std::fs::File;
use std::io;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<()> {
    // Logs go to stderr so replay output on stdout stays machine-readable.
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_writer(io::stderr)
        .init();

    let cli = Cli::parse();
    match cli.command {
        Command::Serve(args) => serve(args).await,
        Command::Replay(args) => replay(args).await,
    }
}

async fn serve(args: ServeArgs) -> Result<()> {
    let store = args.storage.open().into_diagnostic()?;
    let engine = Arc::new(LedgerEngine::new(
        store.clone(),
        args.pricing.policy(),
        RetryPolicy::default(),
    ));
    let verifier = Arc::new(HttpIdentityVerifier::new(&args.auth_server));
    let authorizer = Arc::new(Authorizer::new(verifier, engine.identity()));

    let bus = InMemoryBus::new();
    let consumer = EventConsumer::new(
        Arc::new(bus.subscribe(&[topics::USER_LIFECYCLE, topics::TASK_LIFECYCLE])),
        engine.clone(),
        ConsumerConfig {
            workers: args.workers,
            ..ConsumerConfig::default()
        },
    );
    let relay = Arc::new(OutboxRelay::new(
        store,
        Arc::new(TracingSink),
        Duration::from_millis(args.outbox_interval_ms),
    ));

    let mut state = AppState::new(engine, authorizer);
    if let Some(token) = args.producer_token {
        state = state.with_ingress(Arc::new(bus.clone()), token);
    }

    let shutdown = CancellationToken::new();
    let consuming = tokio::spawn(consumer.run(shutdown.clone()));
    let relaying = tokio::spawn(relay.run(shutdown.clone()));

    {
        let shutdown = shutdown.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                tracing::info!("Shutdown requested");
            }
            shutdown.cancel();
        });
    }

    let served = http::serve(args.bind, state, shutdown.clone()).await;
    shutdown.cancel();
    consuming.await.into_diagnostic()?.into_diagnostic()?;
    relaying.await.into_diagnostic()?;
    served.into_diagnostic()
}

async fn replay(args: ReplayArgs) -> Result<()> {
    let store = args.storage.open().into_diagnostic()?;
    let engine = Arc::new(LedgerEngine::new(
        store,
        args.pricing.policy(),
        RetryPolicy::default(),
    ));
    let replayer = Replayer::new(
        engine.clone(),
        ConsumerConfig {
            workers: args.workers,
            poll_timeout: Duration::from_millis(50),
            retry: RetryPolicy::new(8, Duration::from_millis(5), Duration::from_millis(200)),
            ..ConsumerConfig::default()
        },
    );

    let file = File::open(&args.input).into_diagnostic()?;
    let summary = replayer.run(file, args.close_cycle).await.into_diagnostic()?;
    tracing::info!(
        skipped = summary.rows_skipped,
        cycles = summary.cycles_closed,
        dead_letters = summary.dead_letters,
        stats = ?summary.consumer,
        "Replay finished"
    );

    let statement = engine.statement().await.into_diagnostic()?;
    let stdout = io::stdout();
    let mut writer = AccountWriter::new(stdout.lock());
    writer.write_statement(statement).into_diagnostic()?;

    Ok(())
}
