//! Orion daemon - runs the session engine against a sidecar process
//!
//! Starts one sidecar, routes its events into the session manager, and reads
//! commands from stdin. Streaming output of the active session is printed as
//! it arrives; background sessions stream silently.

mod repl;

use std::error::Error;
use std::io::Write;
use std::path::PathBuf;
use std::sync::{Arc, Mutex, PoisonError};

use clap::Parser;
use orion_core::config::EngineConfig;
use orion_core::paths;
use orion_core::persistence::JsonlMessageStore;
use orion_core::protocol::codes;
use orion_core::session::{LocalSessionCreator, SessionError, SessionManager, SessionSnapshot};
use orion_core::sidecar::{ProcessLauncher, SidecarAdapter};
use orion_core::{Event, SessionId};
use tokio::io::{AsyncBufReadExt, BufReader};

use repl::Input;

#[derive(Parser, Debug)]
#[command(name = "orion-daemon")]
#[command(about = "Multi-session assistant engine over one sidecar process", long_about = None)]
struct Args {
    /// Config file (JSON). Defaults to ~/.orion/config.json
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Sidecar binary to launch
    #[arg(long)]
    sidecar: Option<String>,

    /// Argument passed to the sidecar (repeatable)
    #[arg(long = "arg", allow_hyphen_values = true)]
    sidecar_args: Vec<String>,

    /// Working directory for the sidecar
    #[arg(long)]
    working_dir: Option<String>,

    /// Data directory holding the message store
    #[arg(long)]
    data_dir: Option<PathBuf>,

    /// Write a wire transcript of the sidecar into this directory
    #[arg(long)]
    transcript_dir: Option<PathBuf>,

    /// Idle sessions kept in memory
    #[arg(long)]
    max_resident: Option<usize>,

    /// Restarts attempted after the sidecar dies
    #[arg(long)]
    max_restarts: Option<u32>,
}

impl Args {
    fn load_config(&self) -> Result<EngineConfig, Box<dyn Error>> {
        let path = self
            .config
            .clone()
            .unwrap_or_else(|| paths::default_data_dir().join("config.json"));
        let mut config = EngineConfig::load(&path)?;

        if let Some(sidecar) = &self.sidecar {
            config.sidecar.binary_path = sidecar.clone();
        }
        if !self.sidecar_args.is_empty() {
            config.sidecar.args = self.sidecar_args.clone();
        }
        if let Some(dir) = &self.working_dir {
            config.sidecar.working_dir = Some(dir.clone());
        }
        if let Some(dir) = &self.data_dir {
            config.data_dir = Some(dir.clone());
        }
        if let Some(dir) = &self.transcript_dir {
            config.transcript_dir = Some(dir.clone());
        }
        if let Some(max) = self.max_resident {
            config.retention.max_resident_sessions = Some(max);
        }
        if let Some(max) = self.max_restarts {
            config.restart.max_restarts = max;
        }
        Ok(config)
    }
}

type SharedManager = Arc<Mutex<SessionManager>>;

fn lock(manager: &SharedManager) -> std::sync::MutexGuard<'_, SessionManager> {
    manager.lock().unwrap_or_else(PoisonError::into_inner)
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn Error>> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let args = Args::parse();
    let config = args.load_config()?;

    let launcher = Arc::new(ProcessLauncher::new(config.spawn_config()));
    let adapter = SidecarAdapter::start(launcher, config.adapter_options())?;

    let store = JsonlMessageStore::new(config.messages_dir());
    log::info!("Message store: {}", store.dir().display());

    let creator = LocalSessionCreator::new(config.namespace.as_str())?;
    let manager = SessionManager::new(Arc::new(creator), Arc::new(adapter.clone()), Arc::new(store))
        .with_retention(config.retention_policy())
        .with_default_options(config.default_options.clone());
    let manager: SharedManager = Arc::new(Mutex::new(manager));

    let pump = tokio::spawn(pump_events(adapter.clone(), manager.clone()));

    println!("{}", repl::HELP);
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        tokio::select! {
            line = lines.next_line() => {
                let Some(line) = line? else { break };
                match repl::parse(&line) {
                    Ok(Some(Input::Quit)) => break,
                    Ok(Some(input)) => {
                        if let Err(e) = handle(input, &adapter, &manager) {
                            eprintln!("error: {e}");
                        }
                    }
                    Ok(None) => {}
                    Err(message) => eprintln!("{message}"),
                }
            }
            _ = tokio::signal::ctrl_c() => {
                log::info!("Interrupted");
                break;
            }
        }
    }

    adapter.shutdown();
    pump.abort();
    Ok(())
}

/// Feed every sidecar event to the manager and echo the active session.
async fn pump_events(adapter: SidecarAdapter, manager: SharedManager) {
    let mut events = adapter.events();
    while let Some(event) = events.recv().await {
        if event == Event::Pong {
            println!("pong");
            continue;
        }

        let mut manager = lock(&manager);
        let shown = event
            .request_id()
            .and_then(|id| manager.request_owner(id))
            .is_some_and(|owner| Some(owner) == manager.active_session_id());
        manager.route_event(&event);
        if shown {
            echo(&event);
        }
    }
    log::debug!("Event pump finished");
}

fn echo(event: &Event) {
    match event {
        Event::Text { content, .. } => {
            print!("{content}");
            let _ = std::io::stdout().flush();
        }
        Event::ToolStart { name, .. } => println!("\n[tool] {name}"),
        Event::Complete {
            cost_usd,
            token_count,
            ..
        } => println!("\n[complete] {token_count} tokens, ${cost_usd:.4}"),
        Event::Error {
            code,
            message,
            recoverable,
            ..
        } => {
            println!("\n[error] {code}: {message}");
            if *recoverable {
                let hint = if codes::is_transient(code) {
                    "try `retry`"
                } else {
                    "`retry` may help"
                };
                println!("        {hint}");
            }
        }
        _ => {}
    }
}

fn active(manager: &SessionManager) -> Result<SessionId, String> {
    manager
        .active_session_id()
        .cloned()
        .ok_or_else(|| "no active session, use `new` or `switch`".to_string())
}

fn handle(input: Input, adapter: &SidecarAdapter, manager: &SharedManager) -> Result<(), Box<dyn Error>> {
    let mut manager = lock(manager);
    match input {
        Input::New {
            session_type,
            project,
        } => {
            let record = manager.create_new_session(session_type, project.as_deref())?;
            println!("{} ({})", record.session_id, record.display_name);
        }
        Input::Switch(session_id) => {
            let snapshot = manager.switch_session(&session_id)?;
            print_snapshot(&snapshot);
        }
        Input::Send(text) => {
            let session_id = active(&manager)?;
            match manager.send_message(&session_id, &text) {
                Ok(request_id) => log::debug!("Sent {request_id}"),
                Err(SessionError::Submit(e)) => println!("[error] submit failed: {e}"),
                Err(e) => return Err(e.into()),
            }
        }
        Input::Cancel => {
            let session_id = active(&manager)?;
            if !manager.cancel(&session_id)? {
                println!("nothing to cancel");
            }
        }
        Input::Retry => {
            let session_id = active(&manager)?;
            manager.retry(&session_id)?;
        }
        Input::Reset => {
            let session_id = active(&manager)?;
            let snapshot = manager.reset(&session_id)?;
            print_snapshot(&snapshot);
        }
        Input::List => {
            for summary in manager.list_sessions() {
                println!(
                    "{} {:<40} {:<10} {}",
                    if summary.is_active { "*" } else { " " },
                    summary.session_id,
                    summary.state,
                    summary.display_name.unwrap_or_default()
                );
            }
        }
        Input::Recent(limit) => {
            for recent in manager.list_recent_sessions(limit) {
                let entry = recent.entry;
                println!(
                    "{} {:<40} {:>4} msgs  {}  {}",
                    if recent.is_active { "*" } else { " " },
                    entry.session_id,
                    entry.message_count,
                    entry.last_active.format("%Y-%m-%d %H:%M"),
                    entry.display_name.unwrap_or_default()
                );
            }
        }
        Input::Show => match manager.active_snapshot() {
            Some(snapshot) => println!("{}", serde_json::to_string_pretty(&snapshot)?),
            None => println!("no active session"),
        },
        Input::Ping => {
            adapter.ping()?;
            if let Some(at) = adapter.last_pong() {
                log::debug!("Previous pong at {at}");
            }
        }
        Input::Help => println!("{}", repl::HELP),
        Input::Quit => {}
    }
    Ok(())
}

fn print_snapshot(snapshot: &SessionSnapshot) {
    println!(
        "== {} [{}]{}",
        snapshot.session_id,
        snapshot.state,
        snapshot
            .display_name
            .as_deref()
            .map(|name| format!(" {name}"))
            .unwrap_or_default()
    );
    for message in &snapshot.messages {
        println!("{:?}: {}", message.role, message.content);
    }
}
