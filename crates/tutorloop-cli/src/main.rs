use clap::{Parser, Subcommand};
use std::io::Write;
use std::path::PathBuf;
use std::sync::Arc;
use tutorloop_core::config::Settings;
use tutorloop_core::logging::init_logging;
use tutorloop_core::{Datastore, FileStore, PromptRecord, ResponseWatcher, WatchEvent};
use tutorloop_inference::{
    GenerationEngine, GenerationParams, Poller, PromptFormatter, ScriptedEngine, ServerEngine,
    Worker,
};

#[derive(Parser)]
#[command(
    name = "tutorloop",
    about = "Datastore-polling chat backend with streamed responses"
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Path to .tutorloop data directory
    #[arg(long, default_value = ".tutorloop")]
    data_dir: PathBuf,
}

#[derive(Subcommand)]
enum Commands {
    /// Start polling for prompts until interrupted
    Start {
        /// Reply with a canned response instead of calling the model server
        #[arg(long)]
        dry_run: bool,
    },
    /// Show configuration and queue status
    Status,
    /// Run interactive setup wizard
    Setup,
    /// Queue a prompt for a user and stream the response
    Send {
        /// User the prompt belongs to
        user: String,
        /// The message to send
        message: String,
    },
    /// Stream the response for an already queued prompt
    Watch {
        prompt_id: String,
    },
    /// Print a user's conversation history
    History {
        user: String,
    },
    /// Clear a user's conversation history
    Reset {
        user: String,
    },
    /// Show or switch the model
    Model {
        /// Model name served by the inference server
        name: Option<String>,
    },
}

fn settings_path(cli: &Cli) -> PathBuf {
    cli.data_dir.join("settings.json")
}

/// Settings for commands that work without a setup run.
fn settings_or_default(cli: &Cli) -> anyhow::Result<Settings> {
    let path = settings_path(cli);
    if path.exists() {
        Settings::load(&path)
    } else {
        Ok(Settings::default())
    }
}

async fn open_store(cli: &Cli, settings: &Settings) -> anyhow::Result<Arc<FileStore>> {
    let store = FileStore::open(settings.store_dir(&cli.data_dir)).await?;
    Ok(Arc::new(store))
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    match &cli.command {
        Commands::Start { dry_run } => cmd_start(&cli, *dry_run).await,
        Commands::Status => cmd_status(&cli).await,
        Commands::Setup => cmd_setup(&cli).await,
        Commands::Send { user, message } => cmd_send(&cli, user, message).await,
        Commands::Watch { prompt_id } => cmd_watch(&cli, prompt_id).await,
        Commands::History { user } => cmd_history(&cli, user).await,
        Commands::Reset { user } => cmd_reset(&cli, user).await,
        Commands::Model { name } => cmd_model(&cli, name.as_deref()).await,
    }
}

async fn cmd_start(cli: &Cli, dry_run: bool) -> anyhow::Result<()> {
    let settings = match Settings::load(&settings_path(cli)) {
        Ok(s) => s,
        Err(e) => {
            eprintln!("Could not load configuration: {}", e);
            eprintln!("Run 'tutorloop setup' first.");
            std::process::exit(1);
        }
    };

    let _guard = init_logging(&cli.data_dir.join("logs"), &settings.logging)?;

    tracing::info!("Starting tutorloop...");

    let store: Arc<dyn Datastore> = open_store(cli, &settings).await?;

    let engine: Arc<dyn GenerationEngine> = if dry_run {
        tracing::warn!("Dry run: replies are canned, no model server is used");
        Arc::new(ScriptedEngine::new(["Nice", " try!", " (dry run)"]))
    } else {
        Arc::new(ServerEngine::new(&settings.engine).await?)
    };

    let worker = Arc::new(Worker::new(
        store.clone(),
        engine.clone(),
        PromptFormatter::from_settings(&settings.prompt),
        GenerationParams::from_settings(&settings.engine),
        &settings.worker,
    ));

    let (shutdown_tx, _) = tokio::sync::broadcast::channel::<()>(1);
    let poller = Poller::new(store.clone(), worker, &settings.poller);
    let poller_handle = tokio::spawn(poller.run(shutdown_tx.subscribe()));

    println!("tutorloop started. Press Ctrl+C to stop.");
    println!();
    println!("Engine: {}", engine.name());
    println!(
        "Store: {}",
        settings.store_dir(&cli.data_dir).display()
    );

    wait_for_shutdown_signal().await?;
    tracing::info!("Shutting down...");
    let _ = shutdown_tx.send(());

    match poller_handle.await {
        Ok(Err(e)) => tracing::error!(error = %e, "Poller exited with error"),
        Err(e) => tracing::error!(error = %e, "Poller task failed"),
        Ok(Ok(())) => {}
    }

    engine.shutdown().await;
    store.close().await?;
    tracing::info!("tutorloop stopped");

    Ok(())
}

async fn wait_for_shutdown_signal() -> anyhow::Result<()> {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut terminate = signal(SignalKind::terminate())?;
        tokio::select! {
            res = tokio::signal::ctrl_c() => res?,
            _ = terminate.recv() => {}
        }
    }

    #[cfg(not(unix))]
    {
        tokio::signal::ctrl_c().await?;
    }

    Ok(())
}

async fn cmd_status(cli: &Cli) -> anyhow::Result<()> {
    println!("tutorloop Status");
    println!("================");
    println!();

    let settings = match Settings::load(&settings_path(cli)) {
        Ok(settings) => {
            println!("Configuration: Found");
            settings
        }
        Err(_) => {
            println!("Configuration: Not found (using defaults)");
            println!("  Run 'tutorloop setup' to configure");
            Settings::default()
        }
    };

    println!("  Server: {}", settings.engine.server_url);
    println!("  Model: {}", settings.engine.model);
    println!(
        "  Generation: max {} tokens, temperature {}",
        settings.engine.max_new_tokens, settings.engine.temperature
    );
    println!("  Poll interval: {}ms", settings.poller.interval_ms);
    println!("  Max workers: {}", settings.poller.max_workers);

    let store = open_store(cli, &settings).await?;
    let pending = store.pending_prompts().await?;
    let in_flight = pending.iter().filter(|p| p.processing).count();
    println!();
    println!("Store: {}", settings.store_dir(&cli.data_dir).display());
    println!("  Waiting prompts: {}", pending.len() - in_flight);
    println!("  In-flight prompts: {}", in_flight);

    Ok(())
}

async fn cmd_setup(cli: &Cli) -> anyhow::Result<()> {
    std::fs::create_dir_all(&cli.data_dir)?;

    println!();
    println!("tutorloop - Setup Wizard");
    println!("========================");
    println!();

    let mut settings = settings_or_default(cli)?;

    settings.engine.server_url = dialoguer::Input::<String>::new()
        .with_prompt("Inference server URL")
        .default(settings.engine.server_url.clone())
        .interact_text()?;

    settings.engine.model = dialoguer::Input::<String>::new()
        .with_prompt("Model")
        .default(settings.engine.model.clone())
        .interact_text()?;

    settings.engine.launch_server = dialoguer::Confirm::new()
        .with_prompt("Launch the inference server on start?")
        .default(settings.engine.launch_server)
        .interact()?;

    if settings.engine.launch_server {
        settings.engine.launch_command = dialoguer::Input::<String>::new()
            .with_prompt("Server command")
            .default(settings.engine.launch_command.clone())
            .interact_text()?;
    }

    println!();
    settings.poller.max_workers = dialoguer::Input::new()
        .with_prompt("Maximum concurrent prompts")
        .default(settings.poller.max_workers)
        .interact_text()?;

    settings.worker.typing_delay_ms = dialoguer::Input::new()
        .with_prompt("Delay between streamed fragments (ms)")
        .default(settings.worker.typing_delay_ms)
        .interact_text()?;

    settings.validate()?;
    settings.save(&settings_path(cli))?;

    println!();
    println!("Configuration saved to {}", settings_path(cli).display());
    println!();
    println!("Start with: tutorloop start");
    println!();

    Ok(())
}

async fn cmd_send(cli: &Cli, user: &str, message: &str) -> anyhow::Result<()> {
    let settings = settings_or_default(cli)?;
    let store = open_store(cli, &settings).await?;

    let prompt = PromptRecord::new(user, message);
    store.insert_prompt(&prompt).await?;
    println!("Prompt queued: {}", prompt.id);

    follow(store, &prompt.id).await
}

async fn cmd_watch(cli: &Cli, prompt_id: &str) -> anyhow::Result<()> {
    let settings = settings_or_default(cli)?;
    let store = open_store(cli, &settings).await?;
    follow(store, prompt_id).await
}

async fn follow(store: Arc<FileStore>, prompt_id: &str) -> anyhow::Result<()> {
    let watcher = ResponseWatcher::new(store);
    let mut stdout = std::io::stdout();

    println!();
    let last = watcher
        .follow(prompt_id, |event| {
            if let WatchEvent::Tokens(tokens) = event {
                for token in tokens {
                    print!("{}", token);
                }
                let _ = stdout.flush();
            }
        })
        .await?;
    println!();

    match last {
        WatchEvent::Failed(error) => {
            eprintln!("Error: {}", error);
            std::process::exit(1);
        }
        WatchEvent::Completed(full) => {
            tracing::debug!(len = full.len(), "Response complete");
        }
        WatchEvent::Tokens(_) => {}
    }

    Ok(())
}

async fn cmd_history(cli: &Cli, user: &str) -> anyhow::Result<()> {
    let settings = settings_or_default(cli)?;
    let store = open_store(cli, &settings).await?;
    let history = match store.get_history(user).await? {
        Some(history) if !history.messages.is_empty() => history,
        _ => {
            println!("No conversation history for {}", user);
            return Ok(());
        }
    };

    for message in &history.messages {
        println!(
            "[{}] {}: {}",
            message.timestamp.format("%Y-%m-%d %H:%M:%S"),
            message.role,
            message.content
        );
    }

    Ok(())
}

async fn cmd_reset(cli: &Cli, user: &str) -> anyhow::Result<()> {
    let settings = settings_or_default(cli)?;
    let store = open_store(cli, &settings).await?;

    if store.clear_history(user).await? {
        println!("Conversation history cleared for {}.", user);
        println!("The next message starts a fresh conversation.");
    } else {
        println!("No conversation history for {}.", user);
    }
    Ok(())
}

async fn cmd_model(cli: &Cli, name: Option<&str>) -> anyhow::Result<()> {
    let path = settings_path(cli);

    match name {
        Some(model_name) => {
            let mut settings = settings_or_default(cli)?;
            settings.engine.model = model_name.to_string();
            settings.save(&path)?;
            println!("Model switched to: {}", model_name);
            println!("Restart tutorloop for the change to take effect.");
        }
        None => {
            let settings = settings_or_default(cli)?;
            println!("Current model: {}", settings.engine.model);
            println!("Server: {}", settings.engine.server_url);
            println!();
            println!("Switch with: tutorloop model <name>");
        }
    }

    Ok(())
}
