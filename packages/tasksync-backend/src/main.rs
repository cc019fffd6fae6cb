//! `tasksync` command line: run the relay server, or join a room as an
//! interactive replica.
use std::path::PathBuf;

use clap::{Parser, Subcommand};
use tasksync_backend::config::{default_config_path, load_relay_config, load_replica_config};
use tasksync_backend::log_bridge;
use tasksync_backend::replica::ReplicaSession;
use tasksync_backend::server::spawn_server;
use tasksync_core::types::Task;
use tokio::io::{AsyncBufReadExt, BufReader};

#[derive(Parser, Debug)]
#[command(name = "tasksync")]
#[command(about = "Shared task lists that converge without a central database")]
struct Args {
    /// Append log records to this file as well
    #[arg(long, value_name = "PATH", global = true)]
    log_file: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run the relay + discovery server
    Serve {
        /// Config file (default: <config_dir>/tasksync/relay.json)
        #[arg(short, long, value_name = "PATH")]
        config: Option<PathBuf>,

        #[arg(short, long)]
        port: Option<u16>,

        #[arg(short, long, value_name = "ADDR")]
        bind: Option<String>,
    },
    /// Join a room as an interactive replica. Creates a room when none is given.
    Join {
        room: Option<String>,

        /// Config file (default: <config_dir>/tasksync/replica.json)
        #[arg(short, long, value_name = "PATH")]
        config: Option<PathBuf>,

        /// Discovery/relay base URL, e.g. http://10.0.0.2:8787
        #[arg(short, long, value_name = "URL")]
        server: Option<String>,

        /// Never open direct peer channels
        #[arg(long)]
        no_direct: bool,
    },
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();
    if let Err(e) = log_bridge::init(args.log_file.clone()) {
        eprintln!("failed to initialize logger: {}", e);
    }

    match args.command {
        Command::Serve { config, port, bind } => {
            let path = config.unwrap_or_else(|| default_config_path("relay"));
            let mut config = load_relay_config(&path);
            if let Some(port) = port {
                config.port = port;
            }
            if let Some(bind) = bind {
                config.bind_address = bind;
            }
            serve(config).await
        }
        Command::Join {
            room,
            config,
            server,
            no_direct,
        } => {
            let path = config.unwrap_or_else(|| default_config_path("replica"));
            let mut config = load_replica_config(&path);
            if let Some(server) = server {
                config.server_url = server.trim_end_matches('/').to_string();
            }
            if no_direct {
                config.direct.enabled = false;
            }
            join(ReplicaSession::new(config), room).await
        }
    }
}

async fn serve(
    config: tasksync_core::config::RelayConfig,
) -> Result<(), Box<dyn std::error::Error>> {
    let server = spawn_server(config).await?;
    tokio::signal::ctrl_c().await?;
    log::info!(target: "tasksync.relay", "[server] Shutting down");
    server.shutdown().await;
    Ok(())
}

fn print_tasks(tasks: &[Task]) {
    if tasks.is_empty() {
        println!("  (no tasks)");
    }
    for (i, task) in tasks.iter().enumerate() {
        let mark = if task.done { "x" } else { " " };
        println!("  #{} [{}] {}  ({})", i + 1, mark, task.text, task.id);
    }
}

/// `#n` picks the n-th task of the current list, anything else is an id.
fn resolve_task_ref(reference: &str, tasks: &[Task]) -> Option<String> {
    match reference.strip_prefix('#') {
        Some(n) => n
            .parse::<usize>()
            .ok()
            .and_then(|n| n.checked_sub(1))
            .and_then(|i| tasks.get(i))
            .map(|t| t.id.clone()),
        None => Some(reference.to_string()),
    }
}

async fn join(
    mut session: ReplicaSession,
    room: Option<String>,
) -> Result<(), Box<dyn std::error::Error>> {
    let room = match room {
        Some(room) => room,
        None => session.create_room().await?,
    };
    session.connect(&room).await?;
    println!("Joined room {} as {}", room, session.peer_id());
    println!("Commands: add <text> | toggle <id|#n> | list | status | quit");

    let mut status_rx = session.subscribe_status();
    let mut tasks_rx = session.subscribe_tasks();
    let mut lines = BufReader::new(tokio::io::stdin()).lines();

    loop {
        tokio::select! {
            line = lines.next_line() => {
                let Some(line) = line? else { break };
                let line = line.trim();
                let (cmd, rest) = line.split_once(' ').unwrap_or((line, ""));
                match cmd {
                    "" => {}
                    "add" if !rest.trim().is_empty() => {
                        let task = session.add_task(rest.trim())?;
                        println!("added {}", task.id);
                    }
                    "toggle" => {
                        let toggled = match resolve_task_ref(rest.trim(), &session.tasks()) {
                            Some(id) => session.toggle_task(&id)?,
                            None => false,
                        };
                        if !toggled {
                            println!("no such task: {}", rest.trim());
                        }
                    }
                    "list" => print_tasks(&session.tasks()),
                    "status" => {
                        let status = session.status();
                        println!(
                            "{} | peers: {} (direct: {}){}",
                            status.state,
                            status.peer_count,
                            status.direct_peers,
                            status.message.map(|m| format!(" | {}", m)).unwrap_or_default()
                        );
                    }
                    "quit" | "exit" => break,
                    _ => println!("unknown command: {}", line),
                }
            }
            changed = status_rx.changed() => {
                if changed.is_err() {
                    break;
                }
                let state = status_rx.borrow_and_update().state;
                log::debug!(target: "tasksync.replica", "[replica] State is now {}", state);
            }
            changed = tasks_rx.changed() => {
                if changed.is_err() {
                    break;
                }
                let tasks = tasks_rx.borrow_and_update().clone();
                print_tasks(&tasks);
            }
        }
    }

    session.disconnect().await;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn task(id: &str) -> Task {
        Task {
            id: id.to_string(),
            text: format!("task {}", id),
            done: false,
        }
    }

    #[test]
    fn task_refs_resolve_by_position_or_id() {
        let tasks = vec![task("a"), task("b")];
        assert_eq!(resolve_task_ref("#2", &tasks), Some("b".to_string()));
        assert_eq!(resolve_task_ref("#0", &tasks), None);
        assert_eq!(resolve_task_ref("#9", &tasks), None);
        assert_eq!(resolve_task_ref("abc", &tasks), Some("abc".to_string()));
    }

    #[test]
    fn cli_parses_join_flags() {
        let args = Args::parse_from(["tasksync", "join", "room-1", "--no-direct", "-s", "http://h:1"]);
        match args.command {
            Command::Join {
                room,
                server,
                no_direct,
                ..
            } => {
                assert_eq!(room.as_deref(), Some("room-1"));
                assert_eq!(server.as_deref(), Some("http://h:1"));
                assert!(no_direct);
            }
            other => panic!("unexpected command {:?}", other),
        }
    }
}
