//! cowrite CLI Client
//!
//! Interactive terminal client for a cowrite document.
//!
//! # Usage
//!
//! ```bash
//! # Join a document
//! cowrite --url ws://127.0.0.1:7070 --token "$TOKEN" notes
//!
//! # Replace the content once and exit when acknowledged
//! cowrite --token "$TOKEN" notes --set "Hello world"
//! ```

use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Result};
use clap::Parser;
use colored::*;
use parking_lot::Mutex;
use rustyline::error::ReadlineError;
use rustyline::DefaultEditor;
use tokio::sync::mpsc;

use cowrite_client::{DeliveryPolicy, SyncConfig, SyncEvent, SyncHandle, WebSocketConnector};
use cowrite_protocol::PresenceUser;

/// cowrite Command Line Interface
#[derive(Parser, Debug)]
#[command(name = "cowrite")]
#[command(author, version, about = "cowrite CLI - edit a shared document from the terminal")]
struct Args {
    /// Document to open
    document: String,

    /// Server URL
    #[arg(short, long, default_value = "ws://127.0.0.1:7070", env = "COWRITE_URL")]
    url: String,

    /// Session token
    #[arg(short, long, env = "COWRITE_TOKEN")]
    token: String,

    /// Resend unacknowledged edits after a reconnect
    #[arg(long)]
    at_least_once: bool,

    /// Replace the content, wait for the acknowledgement and exit
    #[arg(short, long)]
    set: Option<String>,

    /// Quiet mode (no banner, no event output)
    #[arg(short, long)]
    quiet: bool,

    /// Client log filter
    #[arg(long, env = "COWRITE_LOG", default_value = "warn")]
    log_level: String,
}

/// A line typed at the prompt
#[derive(Debug, PartialEq, Eq)]
enum Input {
    Replace(String),
    Append(String),
    Show,
    Who,
    Status,
    Help,
    Clear,
    Quit,
    Unknown(String),
}

impl Input {
    fn parse(line: &str) -> Self {
        let Some(command) = line.strip_prefix(':') else {
            return Input::Replace(line.to_string());
        };
        let (name, rest) = command.split_once(' ').unwrap_or((command, ""));
        match name {
            "append" | "a" => Input::Append(rest.to_string()),
            "show" | "s" => Input::Show,
            "who" | "w" => Input::Who,
            "status" => Input::Status,
            "help" | "h" => Input::Help,
            "clear" => Input::Clear,
            "quit" | "q" | "exit" => Input::Quit,
            // `::text` replaces the content with `:text`
            _ if command.starts_with(':') => Input::Replace(command.to_string()),
            _ => Input::Unknown(name.to_string()),
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    tracing_subscriber::fmt()
        .with_env_filter(args.log_level.as_str())
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    let delivery = if args.at_least_once {
        DeliveryPolicy::AtLeastOnce
    } else {
        DeliveryPolicy::AtMostOnce
    };
    let config = SyncConfig::new(&args.url, &args.document, &args.token).with_delivery(delivery);
    let connector = Arc::new(WebSocketConnector::new(&args.url));
    let (handle, events) = cowrite_client::spawn(connector, config);

    if let Some(content) = args.set {
        return set_once(&handle, events, content).await;
    }

    if !args.quiet {
        println!(
            "{}",
            format!(
                r#"
  cowrite CLI
  Document '{}' on {}
  Type a line to replace the content, ':help' for commands
"#,
                args.document, args.url
            )
            .cyan()
        );
    }

    let presence = Arc::new(Mutex::new(Vec::new()));
    tokio::spawn(print_events(events, presence.clone(), args.quiet));

    let (lines_tx, mut lines) = mpsc::unbounded_channel();
    std::thread::spawn(move || read_lines(lines_tx));

    while let Some(line) = lines.recv().await {
        match Input::parse(&line) {
            Input::Replace(content) => edit(&handle, content),
            Input::Append(text) => {
                let mut content = handle.view().content;
                content.push_str(&text);
                edit(&handle, content);
            }
            Input::Show => {
                let view = handle.view();
                println!("{}", format!("rev {} ({} pending)", view.revision, view.pending).dimmed());
                println!("{}", view.content);
            }
            Input::Who => print_presence(&presence.lock()),
            Input::Status => println!("{}", format!("{:?}", handle.state()).yellow()),
            Input::Help => print_help(),
            Input::Clear => print!("\x1B[2J\x1B[1;1H"),
            Input::Quit => break,
            Input::Unknown(name) => eprintln!("{} unknown command ':{}'", "Error:".red(), name),
        }
    }

    handle.close().await;
    Ok(())
}

fn edit(handle: &SyncHandle, content: String) {
    if handle.edit(content).is_err() {
        eprintln!("{}", "Session closed.".red());
    }
}

async fn set_once(
    handle: &SyncHandle,
    mut events: mpsc::UnboundedReceiver<SyncEvent>,
    content: String,
) -> Result<()> {
    // Attach failures end the session with a Closed event
    let result =
        tokio::time::timeout(Duration::from_secs(30), wait_for_ack(handle, &mut events, content)).await;
    handle.close().await;
    match result {
        Ok(Ok(revision)) => {
            println!("{}", format!("OK rev {}", revision).green());
            Ok(())
        }
        Ok(Err(e)) => Err(e),
        Err(_) => bail!("timed out waiting for the server"),
    }
}

async fn wait_for_ack(
    handle: &SyncHandle,
    events: &mut mpsc::UnboundedReceiver<SyncEvent>,
    content: String,
) -> Result<u64> {
    loop {
        match events.recv().await {
            Some(SyncEvent::Attached { .. }) => break,
            Some(SyncEvent::Closed { reason }) => bail!("{}", reason),
            Some(_) => {}
            None => bail!("session ended"),
        }
    }

    handle.edit(content)?;
    while let Some(event) = events.recv().await {
        match event {
            SyncEvent::Acked { revision, .. } => return Ok(revision),
            SyncEvent::Rejected { message, .. } => bail!("edit rejected: {}", message),
            SyncEvent::Closed { reason } => bail!("{}", reason),
            _ => {}
        }
    }
    bail!("session ended")
}

/// Blocking prompt loop; ends the session when the sender drops
fn read_lines(lines: mpsc::UnboundedSender<String>) {
    let mut rl = match DefaultEditor::new() {
        Ok(rl) => rl,
        Err(e) => {
            eprintln!("Error: {:?}", e);
            return;
        }
    };
    let history_path = std::env::var_os("HOME")
        .map(|home| std::path::PathBuf::from(home).join(".cowrite_history"))
        .unwrap_or_default();
    let _ = rl.load_history(&history_path);

    loop {
        let prompt = format!("{}> ", "cowrite".green());
        match rl.readline(&prompt) {
            Ok(line) => {
                if line.trim().is_empty() {
                    continue;
                }
                let _ = rl.add_history_entry(line.as_str());
                let quit = Input::parse(&line) == Input::Quit;
                if lines.send(line).is_err() || quit {
                    break;
                }
            }
            Err(ReadlineError::Interrupted) => {
                println!("^C");
                continue;
            }
            Err(ReadlineError::Eof) => {
                println!("^D");
                break;
            }
            Err(err) => {
                eprintln!("Error: {:?}", err);
                break;
            }
        }
    }

    let _ = rl.save_history(&history_path);
}

async fn print_events(
    mut events: mpsc::UnboundedReceiver<SyncEvent>,
    presence: Arc<Mutex<Vec<PresenceUser>>>,
    quiet: bool,
) {
    while let Some(event) = events.recv().await {
        if let SyncEvent::Presence(users) = &event {
            *presence.lock() = users.clone();
        }
        if quiet {
            continue;
        }
        match event {
            SyncEvent::StateChanged(state) => println!("{}", format!("[{:?}]", state).dimmed()),
            SyncEvent::Attached { revision, color, .. } => {
                println!("{}", format!("Attached at rev {} as {}", revision, color).green())
            }
            SyncEvent::Remote {
                revision,
                content,
                from_user,
                overwrite,
            } => {
                let tag = if overwrite { " (overwrite)" } else { "" };
                println!("{}", format!("{} -> rev {}{}", from_user, revision, tag).blue());
                println!("{}", content);
            }
            SyncEvent::Acked { revision, .. } => println!("{}", format!("rev {}", revision).dimmed()),
            SyncEvent::Overwritten { revision, from_user } => println!(
                "{}",
                format!("Your unsent edit was replaced by {} at rev {}", from_user, revision).yellow()
            ),
            SyncEvent::Rejected { code, message, .. } => {
                println!("{} {} {}", "Rejected:".red(), code, message)
            }
            SyncEvent::Presence(users) => print_presence(&users),
            SyncEvent::SaveStatus {
                persisted_revision,
                pending,
            } => {
                let saved = persisted_revision.map_or("never".to_string(), |r| format!("rev {}", r));
                let state = if pending { "saving" } else { "saved" };
                println!("{}", format!("[{}: {}]", state, saved).dimmed());
            }
            SyncEvent::Discarded { count } => println!(
                "{}",
                format!("{} unsent edit(s) discarded after reconnect", count).yellow()
            ),
            SyncEvent::Closed { reason } => println!("{} {}", "Closed:".red(), reason),
        }
    }
}

fn print_presence(users: &[PresenceUser]) {
    if users.is_empty() {
        println!("{}", "(nobody)".dimmed());
        return;
    }
    for user in users {
        println!("  {} {} ({})", "●".bold(), user.display_name, user.color);
    }
}

fn print_help() {
    println!(
        r#"
{}

{}
  <text>                                 Replace the content with <text>
  ::<text>                               Replace the content with :<text>
  :append <text>                         Append <text> to the content

{}
  :show                                  Print the current content
  :who                                   List connected users
  :status                                Connection state

{}
  :help                                  Show this help
  :clear                                 Clear screen
  :quit                                  Exit
"#,
        "cowrite Commands".cyan().bold(),
        "Editing".yellow().bold(),
        "Viewing".yellow().bold(),
        "Local".yellow().bold(),
    );
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_input() {
        assert_eq!(Input::parse("Hello"), Input::Replace("Hello".into()));
        assert_eq!(Input::parse(":append  world"), Input::Append(" world".into()));
        assert_eq!(Input::parse(":q"), Input::Quit);
        assert_eq!(Input::parse("::smile:"), Input::Replace(":smile:".into()));
        assert_eq!(Input::parse(":nope"), Input::Unknown("nope".into()));
    }
}
