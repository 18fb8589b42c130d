//! Approval coordinator — the state machine driver.
//!
//! Runs as a long-lived task consuming one queue of [`BrokerEvent`]s: new
//! requests from ingress, operator activity from the chat transport, and
//! sandbox completions. All lifecycle mutation goes through the store's
//! compare-and-swap, so duplicate button clicks and racing approve/deny
//! events resolve to a single winner and the losers become no-ops.
//!
//! Chat-send failures are logged and never revert a store transition; a
//! prompt that failed to send leaves the row `pending` until acted on.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;

use chrono::Utc;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

use crate::chat::{self, Action, Button, ChatApi, ChatEvent};
use crate::request::{
    ExecutionResult, FailureKind, Request, RequestState, TrustScope, TIMEOUT_EXIT_CODE,
};
use crate::sandbox::{Invocation, SandboxError, SandboxExecutor};
use crate::notify::Notifier;
use crate::store::{RequestStore, StoreError};
use crate::trust::TrustCache;
use crate::vault::SecretVault;

/// Characters of stdout shown in the in-chat result summary.
const SUMMARY_OUTPUT_CHARS: usize = 300;

/// Events consumed by the coordinator.
#[derive(Debug)]
pub enum BrokerEvent {
    /// Ingress persisted a new `pending` request.
    NewRequest { id: String },
    /// Operator activity relayed by the chat transport.
    Chat(ChatEvent),
    /// A spawned sandbox run finished (or failed to launch).
    SandboxFinished {
        id: String,
        outcome: Result<ExecutionResult, SandboxError>,
    },
}

/// An in-flight secret sub-dialogue: prompt handle → what it asked for.
struct PendingSecret {
    request_id: String,
    name: String,
}

pub struct Coordinator {
    store: Arc<RequestStore>,
    trust: TrustCache,
    vault: Arc<SecretVault>,
    sandbox: Arc<SandboxExecutor>,
    chat: Arc<dyn ChatApi>,
    notifier: Arc<Notifier>,
    /// Base URL for code-view links in prompts.
    base_url: String,
    /// For feeding `SandboxFinished` back from spawned runs.
    event_tx: mpsc::Sender<BrokerEvent>,
    /// Process-local; destroyed when the secret arrives or the request ends.
    pending_secrets: HashMap<String, PendingSecret>,
    start_time: Instant,
}

impl Coordinator {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        store: Arc<RequestStore>,
        trust: TrustCache,
        vault: Arc<SecretVault>,
        sandbox: Arc<SandboxExecutor>,
        chat: Arc<dyn ChatApi>,
        notifier: Arc<Notifier>,
        base_url: String,
        event_tx: mpsc::Sender<BrokerEvent>,
    ) -> Self {
        Self {
            store,
            trust,
            vault,
            sandbox,
            chat,
            notifier,
            base_url,
            event_tx,
            pending_secrets: HashMap::new(),
            start_time: Instant::now(),
        }
    }

    /// Main coordinator loop. Ends when every sender is dropped.
    pub async fn run(mut self, mut rx: mpsc::Receiver<BrokerEvent>) {
        info!("Approval coordinator started");
        while let Some(event) = rx.recv().await {
            match event {
                BrokerEvent::NewRequest { id } => self.handle_new_request(&id).await,
                BrokerEvent::Chat(ChatEvent::ButtonClick { handle, payload }) => {
                    self.handle_button(&handle, &payload).await;
                }
                BrokerEvent::Chat(ChatEvent::TextMessage {
                    handle,
                    reply_to,
                    text,
                }) => {
                    self.handle_text(&handle, reply_to.as_deref(), &text).await;
                }
                BrokerEvent::SandboxFinished { id, outcome } => {
                    self.handle_sandbox_finished(&id, outcome).await;
                }
            }
        }
        info!("Approval coordinator stopped (event queue closed)");
    }

    // ── New request → operator prompt ─────────────────────

    async fn handle_new_request(&mut self, id: &str) {
        let request = match self.store.get(id) {
            Ok(Some(request)) => request,
            Ok(None) => {
                warn!("New-request event for unknown id {id}");
                return;
            }
            Err(e) => {
                error!("Store read failed for {id}: {e}");
                return;
            }
        };

        let trusted = match self
            .trust
            .lookup(&request.source, &request.fingerprint, Utc::now())
        {
            Ok(record) => record,
            Err(e) => {
                warn!("Trust lookup failed for {id}: {e}");
                None
            }
        };

        let text = self.prompt_text(&request, trusted.is_some());
        let keyboard = prompt_keyboard(&request.id, trusted.is_some());
        match self.chat.send(&text, &keyboard).await {
            Ok(handle) => {
                if let Err(e) = self.store.attach_chat_handle(&request.id, &handle) {
                    warn!("Failed to attach chat handle to {id}: {e}");
                }
            }
            Err(e) => {
                // Transient: the row stays pending until the operator acts
                warn!("Chat send failed for request {id}: {e}");
            }
        }
    }

    /// Prompt body shown to the operator. Secret *names* only — values
    /// never appear on the chat surface.
    fn prompt_text(&self, request: &Request, trusted: bool) -> String {
        let mut text = format!("Execution request {}\n", request.id);
        text.push_str(&format!("Skill: {}", request.skill_name));
        if request.skill_id != request.skill_name {
            text.push_str(&format!(" (submitted as {})", request.skill_id));
        }
        text.push('\n');
        text.push_str(&format!(
            "Fingerprint: {}{}\n",
            request.fingerprint_prefix(),
            if trusted { " (trusted)" } else { "" }
        ));
        text.push_str(&format!("Code: {}/view/{}\n", self.base_url, request.id));

        if request.secrets.is_empty() {
            text.push_str("Secrets: none\n");
        } else {
            let listed: Vec<String> = request
                .secrets
                .iter()
                .map(|name| {
                    let mark = if self.vault.contains(name) {
                        "have"
                    } else {
                        "missing"
                    };
                    format!("{name} ({mark})")
                })
                .collect();
            text.push_str(&format!("Secrets: {}\n", listed.join(", ")));
        }

        if request.network.is_empty() {
            text.push_str("Network: none\n");
        } else {
            text.push_str(&format!("Network: {}\n", request.network.join(", ")));
        }
        text.push_str(&format!("Timeout: {}s\n", request.timeout_secs));

        if request.args.is_empty() {
            text.push_str("Args: none");
        } else {
            let args: Vec<String> = request
                .args
                .iter()
                .map(|(k, v)| format!("{k}={v}"))
                .collect();
            text.push_str(&format!("Args: {}", args.join(", ")));
        }
        text
    }

    // ── Operator events ───────────────────────────────────

    async fn handle_button(&mut self, _handle: &str, payload: &str) {
        match chat::parse_payload(payload) {
            Some(Action::Approve { request_id, scope }) => {
                self.approve(&request_id, scope).await;
            }
            Some(Action::Deny { request_id }) => {
                self.deny(&request_id).await;
            }
            Some(Action::AddSecret { name, request_id }) => {
                self.send_secret_prompt_by_name(&name, request_id.as_deref())
                    .await;
            }
            None => {
                debug!("Ignoring unknown button payload: {payload}");
            }
        }
    }

    async fn handle_text(&mut self, handle: &str, reply_to: Option<&str>, text: &str) {
        if let Some(prompt_handle) = reply_to {
            if self.pending_secrets.contains_key(prompt_handle) {
                self.secret_supplied(prompt_handle.to_string(), handle, text)
                    .await;
                return;
            }
        }
        if text.starts_with('/') {
            self.handle_command(handle, text).await;
        } else {
            debug!("Ignoring chat text with no pending dialogue");
        }
    }

    async fn approve(&mut self, id: &str, scope: TrustScope) {
        let Some(request) = self.get_or_log(id) else {
            return;
        };

        // trust-code decomposes into a grant plus a one-shot approval
        if scope != TrustScope::Once {
            if let Err(e) = self
                .trust
                .grant(&request.source, &request.fingerprint, scope, Utc::now())
            {
                warn!("Trust grant failed for {id}: {e}");
            }
        }

        let approved = match self.store.transition(
            id,
            RequestState::Pending,
            RequestState::Approved,
            Utc::now(),
        ) {
            Ok(row) => row,
            Err(StoreError::WrongState { actual }) => {
                // Duplicate or racing click: acknowledged, no effect
                debug!("Approve on {id} ignored (state {actual})");
                return;
            }
            Err(e) => {
                error!("Approve transition failed for {id}: {e}");
                return;
            }
        };
        info!("Request {id} approved ({scope})");

        let missing = self.vault.missing_of(&approved.secrets);
        if missing.is_empty() {
            self.begin_execution(approved, RequestState::Approved).await;
        } else {
            match self.store.transition(
                id,
                RequestState::Approved,
                RequestState::AwaitingSecrets,
                Utc::now(),
            ) {
                Ok(_) => {
                    self.edit_prompt(&approved, &format!("Approved — awaiting secret {}", missing[0]))
                        .await;
                    self.send_secret_prompt(&approved, &missing[0]).await;
                }
                Err(e) => error!("Transition to awaiting_secrets failed for {id}: {e}"),
            }
        }
    }

    async fn deny(&mut self, id: &str) {
        // Deny is legal from any pre-execution state; first CAS wins
        let denied = [
            RequestState::Pending,
            RequestState::Approved,
            RequestState::AwaitingSecrets,
        ]
        .iter()
        .find_map(|from| {
            self.store
                .transition(id, *from, RequestState::Denied, Utc::now())
                .ok()
        });

        let Some(row) = denied else {
            debug!("Deny on {id} ignored (not deniable)");
            return;
        };
        info!("Request {id} denied by operator");

        self.drop_dialogues_for(id).await;
        self.edit_prompt(&row, "Denied").await;
        self.notifier
            .emit(id, RequestState::Denied, "denied by operator");
    }

    // ── Secret sub-dialogue ───────────────────────────────

    async fn send_secret_prompt(&mut self, request: &Request, name: &str) {
        let text = format!(
            "Secret required for {} ({}): {name}\nReply to this message with the value.",
            request.skill_name, request.id
        );
        match self.chat.send(&text, &[]).await {
            Ok(handle) => {
                self.pending_secrets.insert(
                    handle,
                    PendingSecret {
                        request_id: request.id.clone(),
                        name: name.to_string(),
                    },
                );
            }
            Err(e) => {
                // The row stays awaiting_secrets; /add_secret still unblocks it
                warn!("Secret prompt send failed for {}: {e}", request.id);
            }
        }
    }

    /// `add_secret:<name>[:<req_id>]` button — opens the same dialogue.
    async fn send_secret_prompt_by_name(&mut self, name: &str, request_id: Option<&str>) {
        match request_id.and_then(|id| self.store.get(id).ok().flatten()) {
            Some(request) => self.send_secret_prompt(&request, name).await,
            None => {
                let text = format!("Secret: {name}\nReply to this message with the value.");
                if let Ok(handle) = self.chat.send(&text, &[]).await {
                    self.pending_secrets.insert(
                        handle,
                        PendingSecret {
                            request_id: String::new(),
                            name: name.to_string(),
                        },
                    );
                }
            }
        }
    }

    async fn secret_supplied(&mut self, prompt_handle: String, reply_handle: &str, value: &str) {
        let Some(pending) = self.pending_secrets.remove(&prompt_handle) else {
            return;
        };
        if let Err(e) = self.vault.put(&pending.name, value.as_bytes()) {
            error!("Vault write failed for '{}': {e}", pending.name);
            self.pending_secrets.insert(prompt_handle, pending);
            return;
        }

        // Scrub the dialogue from the chat surface (best-effort)
        if let Err(e) = self.chat.delete(&prompt_handle).await {
            debug!("Could not delete secret prompt: {e}");
        }
        if let Err(e) = self.chat.delete(reply_handle).await {
            debug!("Could not delete secret reply: {e}");
        }

        if pending.request_id.is_empty() {
            return; // out-of-band secret, no request to resume
        }
        let Some(request) = self.get_or_log(&pending.request_id) else {
            return;
        };
        if request.state != RequestState::AwaitingSecrets {
            debug!(
                "Secret for {} arrived in state {}; vault write stands",
                request.id, request.state
            );
            return;
        }

        let missing = self.vault.missing_of(&request.secrets);
        if missing.is_empty() {
            self.begin_execution(request, RequestState::AwaitingSecrets)
                .await;
        } else {
            self.send_secret_prompt(&request, &missing[0]).await;
        }
    }

    // ── Execution ─────────────────────────────────────────

    /// Transitions `from → executing` and spawns the sandbox run. The run
    /// feeds `SandboxFinished` back through the event queue.
    async fn begin_execution(&mut self, request: Request, from: RequestState) {
        let id = request.id.clone();
        if let Err(e) =
            self.store
                .transition(&id, from, RequestState::Executing, Utc::now())
        {
            error!("Transition to executing failed for {id}: {e}");
            return;
        }

        // Hash-to-execute binding: only the pinned bytes are ever run
        let code = match self.store.load_code(&id) {
            Ok(Some(code)) => code,
            Ok(None) => {
                self.fail_internal(&id, "stored code missing").await;
                return;
            }
            Err(e) => {
                self.fail_internal(&id, &format!("code load failed: {e}")).await;
                return;
            }
        };

        let mut secrets = std::collections::BTreeMap::new();
        for name in &request.secrets {
            match self.vault.get(name) {
                Some(value) => {
                    secrets.insert(name.clone(), value);
                }
                None => {
                    self.fail_internal(&id, &format!("secret '{name}' vanished before launch"))
                        .await;
                    return;
                }
            }
        }

        self.edit_prompt(&request, "Executing…").await;

        let invocation = Invocation {
            code,
            secrets,
            args: request.args.clone(),
            timeout_secs: request.timeout_secs,
            network: request.network.clone(),
        };
        let sandbox = Arc::clone(&self.sandbox);
        let tx = self.event_tx.clone();
        let fingerprint = request.fingerprint.clone();
        tokio::spawn(async move {
            let outcome = sandbox.execute(&fingerprint, invocation).await;
            if tx
                .send(BrokerEvent::SandboxFinished { id, outcome })
                .await
                .is_err()
            {
                error!("Coordinator gone; sandbox result dropped");
            }
        });
    }

    async fn handle_sandbox_finished(
        &mut self,
        id: &str,
        outcome: Result<ExecutionResult, SandboxError>,
    ) {
        let (terminal, result, failure) = match outcome {
            Ok(mut result) => {
                // Vault values must not reach the status endpoint or chat,
                // even when a skill echoes them
                result.stdout = self.redact(&result.stdout);
                result.stderr = self.redact(&result.stderr);
                if result.success {
                    (RequestState::Completed, Some(result), None)
                } else if result.exit_code == TIMEOUT_EXIT_CODE {
                    (RequestState::Failed, Some(result), Some(FailureKind::Timeout))
                } else {
                    (RequestState::Failed, Some(result), Some(FailureKind::NonZero))
                }
            }
            Err(e) => (
                RequestState::Failed,
                None,
                Some(FailureKind::Launch {
                    message: e.to_string(),
                }),
            ),
        };

        let row = match self
            .store
            .set_result(id, terminal, result, failure, Utc::now())
        {
            Ok(row) => row,
            Err(e) => {
                // e.g. denied while executing — the terminal state stands
                warn!("set_result for {id} rejected: {e}");
                return;
            }
        };
        info!("Request {id} {terminal}");

        let summary = result_summary(&row);
        self.edit_prompt(&row, &summary).await;
        self.notifier.emit(id, terminal, &notification_summary(&row));
    }

    async fn fail_internal(&mut self, id: &str, message: &str) {
        error!("Request {id}: {message}");
        match self.store.set_result(
            id,
            RequestState::Failed,
            None,
            Some(FailureKind::Internal {
                message: message.to_string(),
            }),
            Utc::now(),
        ) {
            Ok(row) => {
                self.edit_prompt(&row, &format!("Failed: {message}")).await;
                self.notifier.emit(id, RequestState::Failed, message);
            }
            Err(e) => warn!("set_result for {id} rejected: {e}"),
        }
    }

    // ── Slash commands ────────────────────────────────────

    /// Operator commands arriving outside any dialogue. `/add_secret` is a
    /// vault write with no approval side effect.
    async fn handle_command(&mut self, handle: &str, text: &str) {
        let mut parts = text.split_whitespace();
        let command = parts.next().unwrap_or("").to_lowercase();
        let response = match command.as_str() {
            "/add_secret" => match (parts.next(), parts.next()) {
                (Some(name), Some(value)) => {
                    // The operator's message contains the value — scrub it
                    if let Err(e) = self.chat.delete(handle).await {
                        debug!("Could not delete /add_secret message: {e}");
                    }
                    match self.vault.put(name, value.as_bytes()) {
                        Ok(()) => format!("Secret '{name}' stored."),
                        Err(e) => format!("Failed to store secret: {e}"),
                    }
                }
                _ => "Usage: /add_secret NAME VALUE".to_string(),
            },
            "/status" => self.cmd_status(),
            "/ping" => "pong".to_string(),
            "/help" => "\
Commands:\n\
  /add_secret NAME VALUE — store a secret in the vault\n\
  /status — request counts, vault size, uptime\n\
  /ping — check the broker is alive\n\
  /help — this message"
                .to_string(),
            other => format!("Unknown command: {other}\nType /help for available commands."),
        };
        if let Err(e) = self.chat.send(&response, &[]).await {
            warn!("Command response send failed: {e}");
        }
    }

    fn cmd_status(&self) -> String {
        let uptime = self.start_time.elapsed();
        let hours = uptime.as_secs() / 3600;
        let minutes = (uptime.as_secs() % 3600) / 60;

        let mut counts: HashMap<RequestState, usize> = HashMap::new();
        let total = match self.store.list_requests() {
            Ok(rows) => {
                for row in &rows {
                    *counts.entry(row.state).or_default() += 1;
                }
                rows.len()
            }
            Err(_) => 0,
        };
        let count = |s: RequestState| counts.get(&s).copied().unwrap_or(0);

        format!(
            "skillgate — status\n\
             Uptime: {hours}h {minutes}m\n\
             Requests: {total} total, {} pending, {} awaiting secrets, {} executing\n\
             Terminal: {} completed, {} failed, {} denied\n\
             Vault: {} secret(s)\n\
             Pending dialogues: {}",
            count(RequestState::Pending),
            count(RequestState::AwaitingSecrets),
            count(RequestState::Executing),
            count(RequestState::Completed),
            count(RequestState::Failed),
            count(RequestState::Denied),
            self.vault.list_names().len(),
            self.pending_secrets.len(),
        )
    }

    // ── Helpers ───────────────────────────────────────────

    fn get_or_log(&self, id: &str) -> Option<Request> {
        match self.store.get(id) {
            Ok(Some(request)) => Some(request),
            Ok(None) => {
                debug!("Event for unknown request {id}");
                None
            }
            Err(e) => {
                error!("Store read failed for {id}: {e}");
                None
            }
        }
    }

    /// Edits the request's prompt message in place (UX affordance only).
    async fn edit_prompt(&self, request: &Request, status_line: &str) {
        let Some(handle) = request.chat_handle.as_deref() else {
            return;
        };
        let text = format!(
            "Execution request {} — {}\nSkill: {}\nFingerprint: {}",
            request.id,
            status_line,
            request.skill_name,
            request.fingerprint_prefix()
        );
        if let Err(e) = self.chat.edit(handle, &text, Some(&[])).await {
            debug!("Prompt edit failed for {}: {e}", request.id);
        }
    }

    /// Drops (and scrubs) any secret prompts belonging to `id`.
    async fn drop_dialogues_for(&mut self, id: &str) {
        let handles: Vec<String> = self
            .pending_secrets
            .iter()
            .filter(|(_, p)| p.request_id == id)
            .map(|(h, _)| h.clone())
            .collect();
        for handle in handles {
            self.pending_secrets.remove(&handle);
            let _ = self.chat.delete(&handle).await;
        }
    }

    /// Replaces every vault value occurring in `text` with a marker.
    fn redact(&self, text: &str) -> String {
        let mut out = text.to_string();
        for name in self.vault.list_names() {
            if let Some(value) = self.vault.get(&name) {
                let needle = String::from_utf8_lossy(&value).into_owned();
                if !needle.is_empty() && out.contains(&needle) {
                    out = out.replace(&needle, "[redacted]");
                }
            }
        }
        out
    }
}

/// Offer set by trust: a trusted fingerprint gets the lightweight pair,
/// everything else the full set with the trust-code grant.
fn prompt_keyboard(request_id: &str, trusted: bool) -> Vec<Button> {
    let mut keyboard = vec![Button::new(
        "Approve once",
        chat::approve_payload(request_id, TrustScope::Once),
    )];
    if !trusted {
        keyboard.push(Button::new(
            "Trust code",
            chat::approve_payload(request_id, TrustScope::Forever),
        ));
    }
    keyboard.push(Button::new("Deny", chat::deny_payload(request_id)));
    keyboard
}

/// Compact in-chat summary of a terminal row.
fn result_summary(row: &Request) -> String {
    match (&row.result, &row.failure) {
        (Some(result), None) => {
            let mut text = format!(
                "Completed in {} ms (exit {})",
                result.duration_ms, result.exit_code
            );
            if !result.stdout.is_empty() {
                text.push('\n');
                text.push_str(&truncate_chars(&result.stdout, SUMMARY_OUTPUT_CHARS));
            }
            text
        }
        (result, Some(failure)) => {
            let mut text = format!("Failed: {failure}");
            if let Some(result) = result {
                text.push_str(&format!(" ({} ms)", result.duration_ms));
                if !result.stderr.is_empty() {
                    text.push('\n');
                    text.push_str(&truncate_chars(&result.stderr, SUMMARY_OUTPUT_CHARS));
                }
            }
            text
        }
        (None, None) => format!("{}", row.state),
    }
}

fn notification_summary(row: &Request) -> String {
    match (&row.result, &row.failure) {
        (Some(result), None) => format!("exit {} in {} ms", result.exit_code, result.duration_ms),
        (_, Some(failure)) => failure.to_string(),
        (None, None) => row.state.to_string(),
    }
}

fn truncate_chars(text: &str, max: usize) -> String {
    if text.chars().count() <= max {
        text.to_string()
    } else {
        let cut: String = text.chars().take(max).collect();
        format!("{cut}…")
    }
}
