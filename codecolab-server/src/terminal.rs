//! Line-oriented terminal client.
//!
//! Plain lines are sent as chat; lines starting with `/` are commands.
//! A local mirror of the document follows joins, remote edits and the
//! user's own edits. The relay never acknowledges an edit, so an error
//! after a local edit re-fetches the document.

use codecolab_core::{apply_patch, CollabError, EditOperation, Result};
use codecolab_sync::{ClientEvent, CollabClient};
use tokio::io::{AsyncBufReadExt, BufReader};

use crate::config::Cli;

const HELP: &str = "\
Commands:
  /insert <pos> <text>   insert text at a character position
  /delete <pos> <len>    delete characters
  /cursor <pos>          share your caret position
  /show                  print the local copy of the document
  /content               re-fetch the document from the relay
  /users                 list members of the document
  /join <document>       join another document (after /leave)
  /leave                 leave the current document
  /quit                  disconnect and exit
Anything else is sent as chat.";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    Chat(String),
    Insert { position: usize, text: String },
    Delete { position: usize, length: usize },
    Cursor(usize),
    Show,
    Content,
    Users,
    Join(String),
    Leave,
    Quit,
    Help,
}

/// Parse one input line. Blank lines yield `Ok(None)`.
pub fn parse_command(line: &str) -> std::result::Result<Option<Command>, String> {
    let line = line.trim_end_matches(['\r', '\n']);
    if line.trim().is_empty() {
        return Ok(None);
    }
    let Some(rest) = line.strip_prefix('/') else {
        return Ok(Some(Command::Chat(line.to_string())));
    };

    let (name, args) = rest.split_once(' ').unwrap_or((rest, ""));
    let command = match name {
        "insert" => {
            let (pos, text) = args
                .split_once(' ')
                .ok_or_else(|| "usage: /insert <pos> <text>".to_string())?;
            Command::Insert { position: parse_number(pos)?, text: text.to_string() }
        }
        "delete" => {
            let mut parts = args.split_whitespace();
            match (parts.next(), parts.next()) {
                (Some(pos), Some(len)) => Command::Delete {
                    position: parse_number(pos)?,
                    length: parse_number(len)?,
                },
                _ => return Err("usage: /delete <pos> <len>".to_string()),
            }
        }
        "cursor" => Command::Cursor(parse_number(args.trim())?),
        "join" if !args.trim().is_empty() => Command::Join(args.trim().to_string()),
        "join" => return Err("usage: /join <document>".to_string()),
        "show" => Command::Show,
        "content" => Command::Content,
        "users" => Command::Users,
        "leave" => Command::Leave,
        "quit" | "exit" => Command::Quit,
        "help" => Command::Help,
        other => return Err(format!("unknown command /{other}, try /help")),
    };
    Ok(Some(command))
}

fn parse_number(text: &str) -> std::result::Result<usize, String> {
    text.parse()
        .map_err(|_| format!("expected a non-negative number, got {text:?}"))
}

/// Local copy of the joined document.
#[derive(Debug, Default)]
pub struct Mirror {
    content: String,
    /// Local edits applied since the relay last sent the full content
    unconfirmed: bool,
}

impl Mirror {
    pub fn content(&self) -> &str {
        &self.content
    }

    /// Replace the content with the relay's copy.
    pub fn reset(&mut self, content: impl Into<String>) {
        self.content = content.into();
        self.unconfirmed = false;
    }

    /// Adopt the result of an edit this user sent.
    pub fn apply_local(&mut self, content: impl Into<String>) {
        self.content = content.into();
        self.unconfirmed = true;
    }

    /// Whether an error may have rejected a local edit. Answers `true` once
    /// per batch of local edits.
    pub fn take_unconfirmed(&mut self) -> bool {
        std::mem::take(&mut self.unconfirmed)
    }

    pub fn apply(&mut self, op: &EditOperation) -> Result<()> {
        self.content = apply_patch(&self.content, op)?.content;
        Ok(())
    }
}

/// Connect, join `cli.document`, and run until `/quit`, end of input, or
/// connection loss.
pub async fn run(cli: &Cli) -> Result<()> {
    let mut client =
        CollabClient::with_config(cli.user_id(), cli.display_name(), cli.client_config());
    let mut events = client
        .take_event_rx()
        .ok_or_else(|| CollabError::connection("event stream unavailable"))?;

    client.connect(&cli.server).await?;
    client.join_document(&cli.document)?;

    let mut mirror = Mirror::default();
    let mut lines = BufReader::new(tokio::io::stdin()).lines();

    loop {
        tokio::select! {
            event = events.recv() => match event {
                Some(ClientEvent::Disconnected) | None => {
                    println!("* connection lost");
                    break;
                }
                Some(event) => {
                    if show_event(&event, &mut mirror) {
                        println!("* re-fetching the document");
                        if let Err(e) = client.request_content() {
                            println!("! {e}, use /content");
                        }
                    }
                }
            },

            line = lines.next_line() => match line {
                Ok(Some(line)) => match parse_command(&line) {
                    Ok(Some(Command::Quit)) => break,
                    Ok(Some(command)) => {
                        if let Err(e) = execute(&client, command, &mut mirror) {
                            println!("! {e}");
                        }
                    }
                    Ok(None) => {}
                    Err(message) => println!("! {message}"),
                },
                Ok(None) => break,
                Err(e) => {
                    log::warn!("Failed to read stdin: {e}");
                    break;
                }
            },
        }
    }

    client.disconnect();
    Ok(())
}

fn execute(client: &CollabClient, command: Command, mirror: &mut Mirror) -> Result<()> {
    match command {
        Command::Chat(message) => client.send_chat_message(message),
        Command::Insert { position, text } => {
            let op = EditOperation::insert(client.user_id(), "", position, text);
            send_local_edit(client, mirror, op)
        }
        Command::Delete { position, length } => {
            let op = EditOperation::delete(client.user_id(), "", position, length);
            send_local_edit(client, mirror, op)
        }
        Command::Cursor(position) => client.send_cursor_position(position),
        Command::Show => {
            println!("{}", mirror.content());
            Ok(())
        }
        Command::Content => client.request_content(),
        Command::Users => {
            println!("* you: {} ({})", client.username(), client.user_id());
            for entry in client.roster() {
                println!("* {} ({})", entry.username, entry.user_id);
            }
            Ok(())
        }
        Command::Join(document_id) => client.join_document(&document_id),
        Command::Leave => client.leave_document(),
        Command::Help => {
            println!("{HELP}");
            Ok(())
        }
        Command::Quit => Ok(()),
    }
}

/// Apply an edit to the mirror only once it is both valid and sent.
fn send_local_edit(client: &CollabClient, mirror: &mut Mirror, op: EditOperation) -> Result<()> {
    let patched = apply_patch(mirror.content(), &op)?.content;
    client.send_edit(op.position, op.insertion, op.deletion_length)?;
    mirror.apply_local(patched);
    Ok(())
}

/// Print `event` and update the mirror. Returns `true` when the mirror
/// should be re-fetched from the relay.
fn show_event(event: &ClientEvent, mirror: &mut Mirror) -> bool {
    match event {
        ClientEvent::Connected => println!("* connected"),
        ClientEvent::Disconnected => println!("* disconnected"),
        ClientEvent::DocumentJoined { document_id, content, users } => {
            mirror.reset(content.as_str());
            println!(
                "* joined {document_id} ({} chars, {} online), /help for commands",
                content.chars().count(),
                users.len()
            );
        }
        ClientEvent::DocumentLeft(document_id) => {
            mirror.reset("");
            println!("* left {document_id}");
        }
        ClientEvent::EditReceived(op) => match mirror.apply(op) {
            Ok(()) => println!("* {} edited at {}", op.user_id, op.position),
            Err(e) => {
                log::warn!("Local copy diverged: {e}");
                println!("* local copy out of sync, use /content");
            }
        },
        ClientEvent::CursorPositionReceived { username, position, .. } => {
            println!("* {username} moved to {position}");
        }
        ClientEvent::ChatMessageReceived { username, message, .. } => {
            println!("<{username}> {message}");
        }
        ClientEvent::UserConnected { username, .. } => println!("* {username} joined"),
        ClientEvent::UserDisconnected(user_id) => println!("* {user_id} left"),
        ClientEvent::ContentReceived(content) => {
            mirror.reset(content.as_str());
            println!("{content}");
        }
        ClientEvent::Error { code, message } => {
            println!("! {code}: {message}");
            return mirror.take_unconfirmed();
        }
    }
    false
}
