//! Terminal front end: login, room list, and one room at a time.

use chrono::Utc;
use std::io::Write;
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::task::JoinHandle;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use partyroom::config::ClientConfig;
use partyroom::connection::{connection, Connection};
use partyroom::identity::IdentityStore;
use partyroom::mirror::{DeviceStorage, Tab};
use partyroom::room::{
    format_remaining, AssignOutcome, Chime, RoomContext, RoomSession, PRESET_MINUTES,
};
use partyroom::routes::{fixed_rooms, guard, Route};
use partyroom::types::Level;
use partyroom::words::{HttpWords, StaticWords, WordSource};

const HELP: &str = "\
/login NAME        choose a display name
/logout            forget the display name
/rooms             list rooms
/join ROOM         enter a room
/leave             leave the room
/members           who is here
/score NAME +1|-1  adjust a score
/timer             show the timer
/start [MIN [SEC]] start from the inputs
/preset 3|6|10     start a preset
/pause             pause the timer
/assign            deal roles
/reveal            reveal roles
/role              show your role
/topic [LEVEL]     show the topic, or pick one (normal, hard, expert)
/messages          show the chat
/quit              exit
anything else is sent to the chat";

/// Terminal bell
struct BellChime;

impl Chime for BellChime {
    fn ring(&self) {
        let mut out = std::io::stdout();
        let _ = out.write_all(b"\x07").and_then(|_| out.flush());
    }
}

struct Room {
    session: RoomSession,
    chat_printer: JoinHandle<()>,
}

struct App {
    config: ClientConfig,
    tab: Tab,
    identity: IdentityStore,
    connection: &'static Connection,
    words: Arc<dyn WordSource>,
    route: Route,
    room: Option<Room>,
}

fn word_source(connection: &Connection, config: &ClientConfig) -> Arc<dyn WordSource> {
    if let Some(base_url) = connection.base_url() {
        match HttpWords::new(base_url) {
            Ok(words) => return Arc::new(words),
            Err(e) => tracing::warn!("Falling back to local word lists: {}", e),
        }
    }
    Arc::new(StaticWords::new(config.static_dir.clone()))
}

fn print_rooms() {
    println!("Rooms:");
    for room in fixed_rooms() {
        println!("  {:<8} {}", room.id, room.label);
    }
}

impl App {
    async fn navigate(&mut self, target: Route) {
        let Some(route) = guard(&target, &self.identity) else {
            return;
        };
        if route != target {
            println!("Please /login first.");
        }

        if !matches!(route, Route::Room(_)) {
            self.leave_room().await;
        }
        match &route {
            Route::Login => println!("Enter /login NAME to continue."),
            Route::Rooms => print_rooms(),
            Route::Room(room_id) => {
                let room_id = room_id.clone();
                self.enter_room(&room_id).await;
            }
        }
        self.route = route;
    }

    async fn enter_room(&mut self, room_id: &str) {
        if self.room.as_ref().is_some_and(|room| room.session.room_id() == room_id) {
            return;
        }
        self.leave_room().await;
        let Some(username) = self.identity.get() else {
            return;
        };

        let context = RoomContext {
            room_id: room_id.to_string(),
            username,
            backend: self.connection.backend_for(&self.tab, room_id),
            timings: self.config.timings,
        };
        let session = RoomSession::join(context, self.words.clone(), Arc::new(BellChime)).await;

        let mut messages = session.chat.watch();
        let me = session.username().to_string();
        let mut seen = messages.borrow_and_update().last().map(|m| m.id);
        let chat_printer = tokio::spawn(async move {
            while messages.changed().await.is_ok() {
                let fresh: Vec<_> = messages
                    .borrow_and_update()
                    .iter()
                    .filter(|m| seen.map_or(true, |id| m.id > id))
                    .cloned()
                    .collect();
                for message in fresh {
                    seen = Some(message.id);
                    if message.username != me {
                        println!("[{}] {}", message.username, message.body);
                    }
                }
            }
        });

        println!("Joined {} as {}. /help for commands.", session.room_id(), session.username());
        self.room = Some(Room {
            session,
            chat_printer,
        });
        self.show_members();
        self.show_timer();
    }

    async fn leave_room(&mut self) {
        if let Some(room) = self.room.take() {
            room.chat_printer.abort();
            room.session.leave().await;
        }
    }

    fn session(&self) -> Option<&RoomSession> {
        match &self.room {
            Some(room) => Some(&room.session),
            None => {
                println!("Join a room first (/rooms, /join ROOM).");
                None
            }
        }
    }

    fn show_members(&self) {
        let Some(session) = self.session() else {
            return;
        };
        let now = Utc::now();
        for member in session.presence.members() {
            let dot = if member.is_online_at(now) { "●" } else { "○" };
            println!("  {} {:<16} {:>4}  {}", dot, member.username, member.score, member.role);
        }
    }

    fn show_timer(&self) {
        let Some(session) = self.session() else {
            return;
        };
        let inputs = session.timer.inputs();
        let running = session.timer.state().is_some_and(|s| s.running);
        println!(
            "Timer {} {}  (inputs {}:{})",
            format_remaining(session.timer.remaining_ms()),
            if running { "running" } else { "paused" },
            inputs.minutes(),
            inputs.seconds()
        );
    }

    fn show_messages(&self) {
        let Some(session) = self.session() else {
            return;
        };
        for message in session.chat.messages() {
            println!(
                "  {} [{}] {}",
                message.created_at.format("%H:%M:%S"),
                message.username,
                message.body
            );
        }
    }

    /// Returns false to quit
    async fn handle(&mut self, line: &str) -> bool {
        let line = line.trim();
        if line.is_empty() {
            return true;
        }
        let (command, rest) = match line.split_once(char::is_whitespace) {
            Some((command, rest)) => (command, rest.trim()),
            None => (line, ""),
        };

        match command {
            "/quit" | "/exit" => return false,
            "/help" => println!("{}", HELP),
            "/login" => match self.identity.set(rest) {
                Ok(name) => {
                    println!("Hello, {}.", name);
                    self.navigate(Route::Rooms).await;
                }
                Err(e) => println!("{}", e),
            },
            "/logout" => {
                self.leave_room().await;
                self.identity.clear();
                self.navigate(Route::Login).await;
            }
            "/rooms" => self.navigate(Route::Rooms).await,
            "/join" => {
                let room_id = if rest.is_empty() { "room1" } else { rest };
                self.navigate(Route::Room(room_id.to_string())).await;
            }
            "/leave" => self.navigate(Route::Rooms).await,
            "/members" => self.show_members(),
            "/messages" => self.show_messages(),
            "/timer" => self.show_timer(),
            "/score" => {
                let Some(session) = self.session() else {
                    return true;
                };
                let mut parts = rest.split_whitespace();
                let (Some(name), Some(delta)) = (parts.next(), parts.next()) else {
                    println!("Usage: /score NAME +1|-1");
                    return true;
                };
                let delta = match delta {
                    "+" | "+1" => 1,
                    "-" | "-1" => -1,
                    _ => {
                        println!("Usage: /score NAME +1|-1");
                        return true;
                    }
                };
                if let Err(e) = session.presence.adjust(name, delta).await {
                    tracing::warn!("Score change failed: {}", e);
                }
            }
            "/start" => {
                let Some(session) = self.session() else {
                    return true;
                };
                let mut parts = rest.split_whitespace();
                if let Some(minutes) = parts.next() {
                    session.timer.set_minutes(minutes);
                    session.timer.set_seconds(parts.next().unwrap_or("00"));
                }
                if let Err(e) = session.timer.start_from_inputs().await {
                    tracing::warn!("Timer start failed: {}", e);
                }
                self.show_timer();
            }
            "/preset" => {
                let Some(session) = self.session() else {
                    return true;
                };
                match rest.parse::<u64>() {
                    Ok(minutes) if PRESET_MINUTES.contains(&minutes) => {
                        if let Err(e) = session.timer.apply_preset(minutes).await {
                            tracing::warn!("Timer start failed: {}", e);
                        }
                        self.show_timer();
                    }
                    _ => println!("Presets: {:?}", PRESET_MINUTES),
                }
            }
            "/pause" => {
                let Some(session) = self.session() else {
                    return true;
                };
                if let Err(e) = session.timer.pause().await {
                    tracing::warn!("Timer pause failed: {}", e);
                }
                self.show_timer();
            }
            "/assign" => {
                let Some(session) = self.session() else {
                    return true;
                };
                match session.roles.assign().await {
                    Ok(AssignOutcome::Assigned { .. }) => println!("Roles dealt."),
                    Ok(AssignOutcome::TooFewOnline(n)) => {
                        println!("Need at least 2 members online ({} now).", n)
                    }
                    Err(e) => tracing::warn!("Role assignment failed: {}", e),
                }
            }
            "/reveal" => {
                let Some(session) = self.session() else {
                    return true;
                };
                if let Err(e) = session.roles.reveal().await {
                    tracing::warn!("Reveal failed: {}", e);
                }
            }
            "/role" => {
                let Some(session) = self.session() else {
                    return true;
                };
                let revealed = if session.roles.revealed() { "（全体に開示中）" } else { "" };
                println!("あなたの役割：{}{}", session.my_role(), revealed);
            }
            "/topic" => {
                let Some(session) = self.session() else {
                    return true;
                };
                if !rest.is_empty() {
                    let Some(level) = Level::parse(rest) else {
                        println!("Levels: normal, hard, expert");
                        return true;
                    };
                    if let Err(e) = session.topic.pick(level).await {
                        tracing::warn!("Topic pick failed: {}", e);
                    }
                }
                println!("{}", session.topic_line());
            }
            _ if command.starts_with('/') => println!("Unknown command. /help lists them."),
            _ => {
                let Some(session) = self.session() else {
                    return true;
                };
                if let Err(e) = session.chat.send(line).await {
                    tracing::warn!("Message not sent: {}", e);
                }
            }
        }
        true
    }
}

#[tokio::main]
async fn main() {
    if let Err(e) = dotenvy::dotenv() {
        if !matches!(e, dotenvy::Error::Io(_)) {
            eprintln!("Warning: Failed to load .env file: {}", e);
        }
    }

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "partyroom=info".into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    let config = ClientConfig::from_env();
    let storage = match DeviceStorage::open(&config.data_dir) {
        Ok(storage) => storage,
        Err(e) => {
            tracing::warn!("Device storage not persisted: {}", e);
            DeviceStorage::in_memory()
        }
    };
    let tab = storage.tab();
    let identity = IdentityStore::new(tab.clone());
    identity.load();

    let connection = connection();
    let words = word_source(connection, &config);

    let mut app = App {
        config,
        tab,
        identity,
        connection,
        words,
        route: Route::Login,
        room: None,
    };
    // optional start path, e.g. `partyroom-client /room/room3`
    let start = match std::env::args().nth(1) {
        Some(path) => Route::parse(&path).unwrap_or_else(|| {
            tracing::warn!("Unknown path {}; showing the room list", path);
            Route::Rooms
        }),
        None => Route::Rooms,
    };
    app.navigate(start).await;

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let shutdown = shutdown_signal();
    tokio::pin!(shutdown);
    loop {
        tokio::select! {
            line = lines.next_line() => match line {
                Ok(Some(line)) => {
                    if !app.handle(&line).await {
                        break;
                    }
                }
                Ok(None) => break,
                Err(e) => {
                    tracing::warn!("Cannot read input: {}", e);
                    break;
                }
            },
            _ = &mut shutdown => break,
        }
    }

    // the room is left on every way out, signals included
    app.leave_room().await;
    if let Err(e) = storage.flush().await {
        tracing::warn!("Device storage not saved: {}", e);
    }
    tracing::debug!("Exited from {}", app.route);
}

async fn shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};

        match signal(SignalKind::terminate()) {
            Ok(mut term) => {
                tokio::select! {
                    _ = tokio::signal::ctrl_c() => tracing::info!("Received Ctrl+C, leaving..."),
                    _ = term.recv() => tracing::info!("Received SIGTERM, leaving..."),
                }
            }
            Err(e) => {
                tracing::warn!("Cannot watch SIGTERM: {}", e);
                let _ = tokio::signal::ctrl_c().await;
            }
        }
    }

    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
    }
}
