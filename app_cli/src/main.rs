//! CLI application for the room mesh
//!
//! Runs either a rendezvous relay (`--serve`) or a headless participant
//! driven by line commands on stdin.

mod input;

use anyhow::{Context, Result};
use clap::Parser;
use input::{describe, parse_line, LineCommand, HELP};
use log::{debug, info, warn};
use network::{parse_join_address, RelayConnector, RelayServer};
use room::{spawn_session, SessionConfig, SessionHandle};
use room_core::{PeerId, SessionSnapshot};
use settings_manager::{CanvasCache, ConfigManager};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, BufReader};

/// room mesh - shared room with avatars and canvases
#[derive(Parser, Debug)]
#[clap(author, version, about)]
struct Args {
    /// Enable debug logging
    #[clap(short, long)]
    debug: bool,

    /// Run a rendezvous relay on this address instead of joining a room
    #[clap(long, value_name = "ADDR")]
    serve: Option<String>,

    /// Join address handed out by someone already in the room
    #[clap(short, long)]
    join: Option<String>,

    /// Display name (overrides the config file)
    #[clap(short, long)]
    name: Option<String>,

    /// Relay address (overrides the config file)
    #[clap(short, long)]
    relay: Option<String>,

    /// Settings file to use instead of the default one
    #[clap(short, long, value_name = "FILE")]
    config: Option<PathBuf>,
}

/// Frame rate of the pose tick
const TICK_RATE: Duration = Duration::from_millis(33);

/// App state
struct App {
    /// Whether the app should exit
    should_quit: bool,
    session: SessionHandle,
}

impl App {
    fn new(session: SessionHandle) -> Self {
        Self {
            should_quit: false,
            session,
        }
    }

    /// Handle one line typed by the user, returning what to print
    async fn handle_line(&mut self, line: &str) -> Result<Vec<String>> {
        let Some(command) = parse_line(line)? else {
            return Ok(Vec::new());
        };
        debug!("Line command: {:?}", command);

        let output = match command {
            LineCommand::Move { position, heading } => {
                self.session.update_pose(position, heading)?;
                Vec::new()
            }
            LineCommand::Draw { canvas_id, text } => {
                self.session.request_draw(canvas_id.clone()).await?;
                self.session
                    .commit_draw(canvas_id.clone(), text.into_bytes())
                    .await?;
                vec![format!("# {} committed", canvas_id)]
            }
            LineCommand::Show => render(&self.session.snapshot().await?),
            LineCommand::Link => match self.session.join_address().await? {
                Some(address) => vec![address],
                None => vec!["not started yet".to_string()],
            },
            LineCommand::Reconnect => {
                let id = self.session.force_reconnect().await?;
                vec![format!("* rejoined as {}", id)]
            }
            LineCommand::Help => HELP.lines().map(str::to_string).collect(),
            LineCommand::Quit => {
                self.should_quit = true;
                Vec::new()
            }
        };
        Ok(output)
    }
}

fn render(snapshot: &SessionSnapshot) -> Vec<String> {
    let mut lines = Vec::new();
    if let Some(local) = &snapshot.local {
        lines.push(format!(
            "you: {} ({}) at ({:.1}, {:.1}, {:.1})",
            local.display_name, local.peer_id, local.position.x, local.position.y, local.position.z
        ));
    }
    lines.push(format!("status: {}", snapshot.status));
    lines.push(format!("connected to {} peer(s)", snapshot.open_peers.len()));
    for avatar in &snapshot.peers {
        lines.push(format!(
            "  {} ({}) at ({:.1}, {:.1}, {:.1})",
            avatar.display_name,
            avatar.peer_id,
            avatar.position.x,
            avatar.position.y,
            avatar.position.z
        ));
    }
    for canvas in snapshot.canvases.iter().filter(|c| !c.is_blank()) {
        lines.push(format!(
            "  [{}] {}",
            canvas.canvas_id,
            String::from_utf8_lossy(&canvas.image)
        ));
    }
    lines
}

async fn serve(address: &str) -> Result<()> {
    let server = RelayServer::bind(address)
        .await
        .with_context(|| format!("Failed to start relay on {}", address))?;
    info!("Relay listening on {}", server.local_addr()?);

    tokio::select! {
        result = server.run() => result?,
        _ = tokio::signal::ctrl_c() => info!("Relay shutting down"),
    }
    Ok(())
}

async fn participate(args: Args) -> Result<()> {
    let config = match &args.config {
        Some(path) => ConfigManager::with_file(path),
        None => ConfigManager::new(),
    }
    .context("Failed to load config")?;
    let settings = config.settings();
    debug!("Using settings from {}", config.config_file().display());

    let bootstrap: Vec<PeerId> = match &args.join {
        Some(address) => parse_join_address(address)?,
        None => Vec::new(),
    };
    let relay = args
        .relay
        .clone()
        .unwrap_or_else(|| settings.relay_address.clone());
    let name = args
        .name
        .clone()
        .unwrap_or_else(|| settings.username.clone());
    let cache = settings.canvas_cache_dir().map(CanvasCache::new);

    let session_config = SessionConfig {
        bootstrap,
        slots_per_wall: settings.slots_per_wall,
        join_base_url: settings.join_base_url.clone(),
    };
    let (handle, mut events, task) =
        spawn_session(Arc::new(RelayConnector::new(relay)), cache, session_config);

    let id = handle.start(name).await?;
    info!("Joined as {}", id);
    if let Some(address) = handle.join_address().await? {
        println!("Invite others with: {}", address);
    }
    println!("Type 'help' for commands");

    let mut app = App::new(handle.clone());
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut ticker = tokio::time::interval(TICK_RATE);

    while !app.should_quit {
        tokio::select! {
            _ = ticker.tick() => app.session.tick()?,
            Some(event) = events.recv() => println!("{}", describe(&event)),
            line = lines.next_line() => match line? {
                Some(line) => match app.handle_line(&line).await {
                    Ok(output) => output.iter().for_each(|line| println!("{}", line)),
                    Err(e) => println!("error: {}", e),
                },
                None => app.should_quit = true,
            },
            _ = tokio::signal::ctrl_c() => app.should_quit = true,
        }
    }

    if let Err(e) = handle.shutdown() {
        warn!("Session already stopped: {}", e);
    }
    task.await?;
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // Configure logging based on debug flag
    if args.debug {
        env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("debug")).init();
        debug!("Debug logging enabled");
    } else {
        env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    }

    match args.serve.clone() {
        Some(address) => serve(&address).await,
        None => {
            info!("Starting room mesh CLI");
            let result = participate(args).await;
            info!("Exiting room mesh CLI");
            result
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use network::MemoryNetwork;
    use room_core::CanvasId;

    async fn app() -> App {
        let (handle, _events, _task) =
            spawn_session(Arc::new(MemoryNetwork::new()), None, SessionConfig::default());
        handle.start("Ada").await.unwrap();
        App::new(handle)
    }

    #[test]
    fn args_parse_serve_and_join() {
        let args = Args::parse_from(["app_cli", "--serve", "0.0.0.0:7878"]);
        assert_eq!(args.serve.as_deref(), Some("0.0.0.0:7878"));
        assert!(!args.debug);

        let args = Args::parse_from(["app_cli", "-d", "-n", "Ada", "--join", "room://join?peer=a"]);
        assert!(args.debug);
        assert_eq!(args.name.as_deref(), Some("Ada"));
        assert_eq!(args.join.as_deref(), Some("room://join?peer=a"));
    }

    #[test_log::test(tokio::test)]
    async fn quit_stops_the_app() {
        let mut app = app().await;
        assert!(!app.should_quit);
        app.handle_line("quit").await.unwrap();
        assert!(app.should_quit);
    }

    #[test_log::test(tokio::test)]
    async fn draw_then_show_lists_the_canvas() {
        let mut app = app().await;
        let output = app.handle_line("draw north-0 a tree").await.unwrap();
        assert_eq!(output, vec!["# north-0 committed".to_string()]);

        let snapshot = app.session.snapshot().await.unwrap();
        assert_eq!(
            snapshot.canvas(&CanvasId::new("north-0")).unwrap().image,
            b"a tree".to_vec()
        );
        let shown = app.handle_line("show").await.unwrap();
        assert!(shown.iter().any(|line| line == "  [north-0] a tree"));
    }

    #[test_log::test(tokio::test)]
    async fn bad_lines_are_errors_not_exits() {
        let mut app = app().await;
        assert!(app.handle_line("draw ceiling-9 nope").await.is_err());
        assert!(app.handle_line("fly").await.is_err());
        assert!(app.handle_line("").await.unwrap().is_empty());
        assert!(!app.should_quit);
    }

    #[test_log::test(tokio::test)]
    async fn link_prints_the_join_address() {
        let mut app = app().await;
        let output = app.handle_line("link").await.unwrap();
        assert_eq!(output.len(), 1);
        assert!(output[0].starts_with("room://join?peer="));
    }
}
