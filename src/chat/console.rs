//! Console chat transport — line-oriented development stand-in.
//!
//! Prompts are printed to stdout with their handle and button payloads;
//! the local operator replies on stdin:
//!
//! ```text
//! approve <request-id> [once|24h|forever]
//! deny <request-id>
//! reply <handle> <text>
//! /add_secret <name> <value>     (and /status, /help, /ping)
//! ```
//!
//! The process owner at the terminal *is* the operator principal, so no
//! further sender filtering applies here.

use std::sync::atomic::{AtomicU64, Ordering};

use anyhow::Result;
use async_trait::async_trait;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::debug;

use super::{Button, ChatApi, ChatEvent};
use crate::request::TrustScope;

pub struct ConsoleChat {
    counter: AtomicU64,
}

impl ConsoleChat {
    pub fn new() -> Self {
        Self {
            counter: AtomicU64::new(1),
        }
    }

    fn print_block(&self, handle: &str, text: &str, keyboard: &[Button], edited: bool) {
        let tag = if edited { "edit" } else { "msg" };
        println!("── [{handle}] ({tag}) ──────────────────────────");
        for line in text.lines() {
            println!("  {line}");
        }
        for button in keyboard {
            println!("  [{}]  →  {}", button.label, button.payload);
        }
        println!("──────────────────────────────────────────");
    }
}

impl Default for ConsoleChat {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ChatApi for ConsoleChat {
    async fn send(&self, text: &str, keyboard: &[Button]) -> Result<String> {
        let handle = format!("console-{}", self.counter.fetch_add(1, Ordering::Relaxed));
        self.print_block(&handle, text, keyboard, false);
        Ok(handle)
    }

    async fn edit(&self, handle: &str, text: &str, keyboard: Option<&[Button]>) -> Result<()> {
        self.print_block(handle, text, keyboard.unwrap_or(&[]), true);
        Ok(())
    }

    async fn delete(&self, handle: &str) -> Result<()> {
        println!("── [{handle}] (deleted)");
        Ok(())
    }
}

/// Parses one operator input line into a [`ChatEvent`].
/// Returns `None` for blank or unintelligible lines.
pub fn parse_line(line: &str, event_handle: String) -> Option<ChatEvent> {
    let line = line.trim();
    if line.is_empty() {
        return None;
    }
    if line.starts_with('/') {
        return Some(ChatEvent::TextMessage {
            handle: event_handle,
            reply_to: None,
            text: line.to_string(),
        });
    }
    let mut parts = line.splitn(3, ' ');
    match parts.next()? {
        "approve" => {
            let id = parts.next()?;
            let scope = match parts.next() {
                Some(s) => TrustScope::parse(s)?,
                None => TrustScope::Once,
            };
            Some(ChatEvent::ButtonClick {
                handle: event_handle,
                payload: super::approve_payload(id, scope),
            })
        }
        "deny" => Some(ChatEvent::ButtonClick {
            handle: event_handle,
            payload: super::deny_payload(parts.next()?),
        }),
        "reply" => {
            let target = parts.next()?.to_string();
            let text = parts.next()?.to_string();
            Some(ChatEvent::TextMessage {
                handle: event_handle,
                reply_to: Some(target),
                text,
            })
        }
        _ => None,
    }
}

/// Spawns the stdin reader that turns operator lines into chat events.
/// Ends when stdin closes or the receiver is dropped.
pub fn spawn_stdin_reader(tx: mpsc::Sender<ChatEvent>) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut lines = BufReader::new(tokio::io::stdin()).lines();
        let mut n = 0u64;
        while let Ok(Some(line)) = lines.next_line().await {
            n += 1;
            match parse_line(&line, format!("stdin-{n}")) {
                Some(event) => {
                    if tx.send(event).await.is_err() {
                        break;
                    }
                }
                None => {
                    if !line.trim().is_empty() {
                        println!(
                            "? unrecognized — try: approve <id> [scope] | deny <id> | reply <handle> <text> | /help"
                        );
                    }
                }
            }
        }
        debug!("Console input closed");
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_approve_default_scope() {
        let event = parse_line("approve ab12", "stdin-1".to_string()).unwrap();
        match event {
            ChatEvent::ButtonClick { payload, .. } => {
                assert_eq!(payload, "approve:ab12:once");
            }
            other => panic!("unexpected event: {other:?}"),
        }
    }

    #[test]
    fn test_parse_approve_explicit_scope() {
        let event = parse_line("approve ab12 forever", "stdin-1".to_string()).unwrap();
        match event {
            ChatEvent::ButtonClick { payload, .. } => {
                assert_eq!(payload, "approve:ab12:forever");
            }
            other => panic!("unexpected event: {other:?}"),
        }
    }

    #[test]
    fn test_parse_deny() {
        let event = parse_line("deny r7", "stdin-2".to_string()).unwrap();
        match event {
            ChatEvent::ButtonClick { payload, .. } => assert_eq!(payload, "deny:r7"),
            other => panic!("unexpected event: {other:?}"),
        }
    }

    #[test]
    fn test_parse_reply_keeps_full_text() {
        let event = parse_line("reply console-3 my secret value", "stdin-3".to_string()).unwrap();
        match event {
            ChatEvent::TextMessage {
                reply_to, text, ..
            } => {
                assert_eq!(reply_to.as_deref(), Some("console-3"));
                assert_eq!(text, "my secret value");
            }
            other => panic!("unexpected event: {other:?}"),
        }
    }

    #[test]
    fn test_parse_slash_command() {
        let event = parse_line("/add_secret K v1", "stdin-4".to_string()).unwrap();
        match event {
            ChatEvent::TextMessage {
                reply_to, text, ..
            } => {
                assert!(reply_to.is_none());
                assert_eq!(text, "/add_secret K v1");
            }
            other => panic!("unexpected event: {other:?}"),
        }
    }

    #[test]
    fn test_parse_noise_ignored() {
        assert!(parse_line("", "h".to_string()).is_none());
        assert!(parse_line("what is this", "h".to_string()).is_none());
        assert!(parse_line("approve", "h".to_string()).is_none());
        assert!(parse_line("approve r1 weekly", "h".to_string()).is_none());
    }

    #[tokio::test]
    async fn test_console_handles_increment() {
        let chat = ConsoleChat::new();
        let a = chat.send("one", &[]).await.unwrap();
        let b = chat.send("two", &[]).await.unwrap();
        assert_ne!(a, b);
        assert!(a.starts_with("console-"));
        chat.edit(&a, "edited", None).await.unwrap();
        chat.delete(&b).await.unwrap();
    }
}
