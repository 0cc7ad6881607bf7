//! Entry point for the `carmatch` CLI.
//!
//! ```sh
//! carmatch init
//! carmatch import listings.json
//! carmatch search "picape diesel 4x4"
//! carmatch chat
//! ```

use carmatch::{
    assistant::{Assistant, TurnEvent, TurnOutcome},
    chat::HttpChatBackend,
    commands::{Cli, Commands},
    config::{self, CarmatchConfig},
    config_dir,
    embedding::{EmbeddingGenerator, build_embedder},
    prompts::{self, AssistantPrompts},
    search::{SearchResult, SearchService},
    session::{AssistantSession, SessionStore},
    sqlite_store::SqliteVehicleStore,
    stream::{Interrupt, Interrupts, StreamEnd},
    sync::{EmbeddingSync, SyncReport},
    vehicle::VehicleRecord,
};
use clap::Parser;
use crossterm::{
    ExecutableCommand,
    style::{Attribute, Color, Print, ResetColor, SetAttribute, SetForegroundColor},
};
use indicatif::{ProgressBar, ProgressStyle};
use once_cell::sync::OnceCell;
use std::{
    error::Error,
    fs,
    io::{self, BufRead, Write},
    path::PathBuf,
    sync::Arc,
};
use tracing::{debug, info, warn};

static TRACING: OnceCell<()> = OnceCell::new();

fn main() -> Result<(), Box<dyn Error>> {
    TRACING.get_or_init(|| {
        tracing_subscriber::fmt::init();
    });
    let runtime = tokio::runtime::Runtime::new()?;
    runtime.block_on(run())
}

struct Services {
    store: Arc<SqliteVehicleStore>,
    sync: Arc<EmbeddingSync>,
    search: SearchService,
}

impl Services {
    fn open(config: &CarmatchConfig) -> Result<Self, Box<dyn Error>> {
        let store = Arc::new(SqliteVehicleStore::open(&config.vehicle_db_url)?);
        let embedder = build_embedder(config)?;
        let sync = Arc::new(EmbeddingSync::new(
            EmbeddingGenerator::new(embedder.clone()),
            store.clone(),
        ));
        let search = SearchService::new(embedder, store.clone(), &config.search);
        Ok(Self {
            store,
            sync,
            search,
        })
    }
}

async fn run() -> Result<(), Box<dyn Error>> {
    let cli = Cli::parse();

    if let Commands::Init = cli.command {
        debug!("Initializing configuration");
        return init();
    }

    let config_path = match cli.config {
        Some(path) => path,
        None => config_dir()?.join("config.yaml"),
    };
    let config = config::load_config(&config_path)?;
    debug!(
        db = %config.vehicle_db_url,
        model = %config.embedding.model,
        "Config loaded from {}",
        config_path.display()
    );
    let services = Services::open(&config)?;

    match cli.command {
        Commands::Init => Ok(()),
        Commands::Import { file, no_sync } => import(&services, file, no_sync).await,
        Commands::Sync { ids, all, force } => {
            let report = if all {
                let ids = services.store.vehicle_ids().await?;
                sync_with_progress(&services.sync, &ids, force).await
            } else {
                services.sync.sync_all(&ids, force).await
            };
            print_report(&report)
        }
        Commands::Search { query, k, json } => {
            let k = k.unwrap_or(config.search.default_results);
            let results = services.search.search(&query, k).await?;
            if json {
                println!("{}", serde_json::to_string_pretty(&results)?);
            } else {
                print_results(&results);
            }
            Ok(())
        }
        Commands::Remove { id } => {
            services.sync.remove(&id).await?;
            if services.store.remove_vehicle(&id).await? {
                println!("Removed {id}");
            } else {
                println!("No vehicle with id {id}");
            }
            Ok(())
        }
        Commands::Chat { email, name } => chat(&config, services, email, name).await,
    }
}

async fn import(services: &Services, file: PathBuf, no_sync: bool) -> Result<(), Box<dyn Error>> {
    let content = fs::read_to_string(&file)?;
    let vehicles: Vec<VehicleRecord> = serde_json::from_str(&content)?;
    for vehicle in &vehicles {
        services.store.upsert_vehicle(vehicle).await?;
    }
    info!(count = vehicles.len(), "Imported listings from {}", file.display());

    if no_sync {
        println!("Stored {} listings; run `carmatch sync --all` to embed them.", vehicles.len());
        return Ok(());
    }
    let ids: Vec<String> = vehicles.into_iter().map(|v| v.id).collect();
    let report = sync_with_progress(&services.sync, &ids, false).await;
    print_report(&report)
}

async fn sync_with_progress(sync: &EmbeddingSync, ids: &[String], force: bool) -> SyncReport {
    let pb = ProgressBar::new(ids.len() as u64);
    pb.set_style(
        ProgressStyle::default_bar()
            .template("{spinner:.green} [{elapsed_precise}] [{bar:40.cyan/blue}] {pos}/{len} {msg}")
            .unwrap_or_else(|_| ProgressStyle::default_bar())
            .progress_chars("#>-"),
    );

    let mut report = SyncReport::default();
    for id in ids {
        pb.set_message(id.clone());
        let result = if force {
            sync.sync_forced(id).await
        } else {
            sync.sync(id).await
        };
        if let Err(err) = &result {
            pb.println(format!("{id}: {err}"));
        }
        report.record(id, &result);
        pb.inc(1);
    }
    pb.finish_and_clear();
    report
}

fn print_report(report: &SyncReport) -> Result<(), Box<dyn Error>> {
    println!("{report}");
    for id in &report.missing {
        println!("  missing: {id}");
    }
    for (id, reason) in &report.failed {
        println!("  failed: {id}: {reason}");
    }
    if report.failed.is_empty() {
        Ok(())
    } else {
        Err(format!("{} vehicles failed to sync", report.failed.len()).into())
    }
}

fn print_results(results: &[SearchResult]) {
    if results.is_empty() {
        println!("Nenhum veículo encontrado.");
        return;
    }
    for (rank, result) in results.iter().enumerate() {
        println!("{}. {}  [{:.3}]", rank + 1, result.title, result.score);
        if !result.summary.is_empty() {
            println!("   {}", result.summary);
        }
        println!("   id: {}", result.vehicle_id);
    }
}

fn colored(stdout: &mut io::Stdout, color: Color, text: &str) -> io::Result<()> {
    stdout
        .execute(SetForegroundColor(color))?
        .execute(Print(text))?
        .execute(ResetColor)?;
    Ok(())
}

/// Interactive assistant session. `/new` starts a fresh conversation, `exit` quits.
/// Ctrl-C stops the reply being streamed, or quits when nothing is streaming.
async fn chat(
    config: &CarmatchConfig,
    services: Services,
    email: Option<String>,
    name: Option<String>,
) -> Result<(), Box<dyn Error>> {
    let prompts = match &config.prompts_path {
        Some(path) => prompts::load_prompts(path)?,
        None => AssistantPrompts::default(),
    };
    let backend = Arc::new(HttpChatBackend::new(&config.chat)?);
    let assistant = Assistant::new(backend, prompts, config.chat.assistant_name.clone())
        .with_inventory(
            services.search,
            config.search.default_results,
            config.search.inventory_context_tokens,
        );

    let mut session = match email {
        Some(email) => AssistantSession::authenticated(email),
        None => AssistantSession::guest(),
    };
    if let Some(name) = name {
        session = session.with_display_name(name);
    }
    let sessions = SessionStore::new();
    let (mut session_id, handle) = sessions.open(session);
    debug!(session_id = %session_id, "Chat session opened");

    let mut stdout = io::stdout();
    stdout
        .execute(SetAttribute(Attribute::Bold))?
        .execute(Print(format!(
            "{} | /new para recomeçar, exit para sair\n",
            config.chat.assistant_name
        )))?
        .execute(SetAttribute(Attribute::Reset))?;

    let interrupts = Arc::new(Interrupts::new());
    let listener = {
        let interrupts = Arc::clone(&interrupts);
        tokio::spawn(async move {
            while tokio::signal::ctrl_c().await.is_ok() {
                if interrupts.interrupt() == Interrupt::Idle {
                    let _ = io::stdout().execute(ResetColor);
                    println!();
                    std::process::exit(130);
                }
            }
        })
    };

    let stdin = io::stdin();
    loop {
        colored(&mut stdout, Color::Green, "\nVocê: ")?;
        stdout.flush()?;

        let mut line = String::new();
        if stdin.lock().read_line(&mut line)? == 0 {
            break;
        }
        let input = line.trim();
        if input.is_empty() {
            continue;
        }
        if input.eq_ignore_ascii_case("exit") {
            break;
        }
        if input == "/new" {
            session_id = sessions.reset(&session_id).await?;
            colored(&mut stdout, Color::DarkGrey, "Nova conversa iniciada.\n")?;
            continue;
        }

        let signal = interrupts.arm();
        colored(
            &mut stdout,
            Color::Blue,
            &format!("{}: ", config.chat.assistant_name),
        )?;
        stdout.flush()?;
        let outcome = assistant
            .send(&handle, input, signal, |event| {
                let mut out = io::stdout();
                let printed = match event {
                    TurnEvent::Notice(text) => colored(&mut out, Color::Yellow, &format!("{text}\n")),
                    TurnEvent::Delta(delta) => colored(&mut out, Color::Blue, delta),
                };
                if printed.and_then(|_| out.flush()).is_err() {
                    warn!("Failed to write to terminal");
                }
            })
            .await;
        interrupts.disarm();

        match outcome {
            Ok(TurnOutcome::Local(text)) => colored(&mut stdout, Color::Yellow, &format!("{text}\n"))?,
            Ok(TurnOutcome::Streamed { summary, .. }) => {
                if summary.end == StreamEnd::Cancelled {
                    colored(&mut stdout, Color::DarkGrey, " [interrompido]")?;
                }
                println!();
            }
            Err(err) => {
                debug!(session_id = %session_id, "Turn failed: {err}");
                colored(
                    &mut stdout,
                    Color::Red,
                    &format!("{}\n", assistant.prompts().apology),
                )?;
            }
        }
    }

    listener.abort();
    sessions.remove(&session_id);
    Ok(())
}

/// Write a default `config.yaml` and `prompts.yaml` to the config directory. Existing
/// files are left alone.
fn init() -> Result<(), Box<dyn Error>> {
    let dir = config_dir()?;
    info!("Creating config directory: {}", dir.display());
    fs::create_dir_all(&dir)?;

    let prompts_path = dir.join("prompts.yaml");
    if prompts_path.exists() {
        info!("Keeping existing prompts: {}", prompts_path.display());
    } else {
        info!("Creating prompts file: {}", prompts_path.display());
        fs::write(&prompts_path, serde_yaml::to_string(&AssistantPrompts::default())?)?;
    }

    let config_path = dir.join("config.yaml");
    if config_path.exists() {
        info!("Keeping existing config: {}", config_path.display());
    } else {
        info!("Creating config file: {}", config_path.display());
        let config = CarmatchConfig {
            api_key: "CHANGEME".to_string(),
            vehicle_db_url: dir.join("carmatch.db").to_string_lossy().into_owned(),
            prompts_path: Some(prompts_path.to_string_lossy().into_owned()),
            ..CarmatchConfig::default()
        };
        fs::write(&config_path, serde_yaml::to_string(&config)?)?;
    }

    println!("Config: {}", config_path.display());
    Ok(())
}
