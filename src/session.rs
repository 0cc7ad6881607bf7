//! # Assistant sessions
//!
//! An [`AssistantSession`] is the state of one conversation with the sales assistant.
//! It owns the transcript and the identity gate:
//!
//! ```text
//! AwaitingFirstMessage ──(identity known)──────────────▶ Active
//!        │
//!        └─(anonymous: hold message, ask for email)──▶ AwaitingEmail
//!                                                       │  ▲
//!                             (not an email: retry) ────┘  │
//!                                                       │
//!                     (valid email: confirm, replay) ───▶ Active
//! ```
//!
//! [`AssistantSession::receive`] applies one user input and says what to do next: either
//! the session already answered locally ([`SessionAction::Reply`]), or the transcript now
//! ends with a user turn for the chat backend ([`SessionAction::Dispatch`]).
//!
//! Invariants:
//! - `pending_message` is only set while the stage is `AwaitingEmail`, and holds at most
//!   the first message; later inputs in that stage are identity attempts.
//! - Once an identity is captured the stage stays `Active` until [`AssistantSession::reset`].
//! - The transcript is append-only and is exactly what the chat backend sees.
//!
//! [`SessionStore`] keeps sessions by id, each behind its own async mutex so a session
//! has at most one chat request in flight.

use async_openai::types::chat::{
    ChatCompletionRequestAssistantMessage, ChatCompletionRequestAssistantMessageContent,
    ChatCompletionRequestMessage, ChatCompletionRequestUserMessage,
    ChatCompletionRequestUserMessageContent, Role,
};
use chrono::{DateTime, Utc};
use once_cell::sync::Lazy;
use regex::Regex;
use serde::Serialize;
use std::{
    collections::HashMap,
    sync::{Arc, Mutex},
};
use tokio::sync::Mutex as AsyncMutex;
use tracing::{debug, info};
use ulid::Ulid;

use crate::{
    error::{MatchError, Result},
    prompts::AssistantPrompts,
};

static EMAIL: Lazy<Option<Regex>> = Lazy::new(|| Regex::new(r"^[^\s@]+@[^\s@]+\.[^\s@]+$").ok());

/// Syntactic email check; no delivery is attempted.
pub fn is_valid_email(candidate: &str) -> bool {
    EMAIL
        .as_ref()
        .is_some_and(|re| re.is_match(candidate.trim()))
}

/// `joao@example.com` → `j***@example.com`, for logs.
pub fn mask_email(email: &str) -> String {
    match email.split_once('@') {
        Some((local, domain)) => {
            let first: String = local.chars().take(1).collect();
            format!("{first}***@{domain}")
        }
        None => "***".to_string(),
    }
}

fn new_session_id() -> String {
    Ulid::new().to_string()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum Stage {
    AwaitingFirstMessage,
    AwaitingEmail,
    Active,
}

#[derive(Debug, Clone, PartialEq)]
pub struct TranscriptEntry {
    pub role: Role,
    pub content: String,
    pub created_at: DateTime<Utc>,
    /// False while an assistant reply is still streaming in.
    pub finished: bool,
}

impl TranscriptEntry {
    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            content: content.into(),
            created_at: Utc::now(),
            finished: true,
        }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: Role::Assistant,
            content: content.into(),
            created_at: Utc::now(),
            finished: true,
        }
    }

    fn streaming() -> Self {
        Self {
            finished: false,
            ..Self::assistant(String::new())
        }
    }

    pub fn is_streaming(&self) -> bool {
        matches!(self.role, Role::Assistant) && !self.finished
    }

    /// Request message for the chat backend.
    #[allow(deprecated)]
    pub fn to_request_message(&self) -> ChatCompletionRequestMessage {
        match self.role {
            Role::Assistant => {
                ChatCompletionRequestMessage::Assistant(ChatCompletionRequestAssistantMessage {
                    content: Some(ChatCompletionRequestAssistantMessageContent::Text(
                        self.content.clone(),
                    )),
                    name: None,
                    refusal: None,
                    audio: None,
                    tool_calls: None,
                    function_call: None,
                })
            }
            _ => ChatCompletionRequestMessage::User(ChatCompletionRequestUserMessage {
                content: ChatCompletionRequestUserMessageContent::Text(self.content.clone()),
                name: None,
            }),
        }
    }
}

/// Ordered, append-only conversation log.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Transcript {
    entries: Vec<TranscriptEntry>,
}

impl Transcript {
    pub fn push(&mut self, entry: TranscriptEntry) {
        self.entries.push(entry);
    }

    /// Extend the in-progress assistant reply, starting one if the last entry is not
    /// streaming. Returns the index of the entry that was updated.
    pub fn append_delta(&mut self, delta: &str) -> usize {
        let streaming = self.entries.last().is_some_and(TranscriptEntry::is_streaming);
        if !streaming {
            self.entries.push(TranscriptEntry::streaming());
        }
        let index = self.entries.len() - 1;
        self.entries[index].content.push_str(delta);
        index
    }

    /// Close the in-progress assistant reply, if any, keeping what arrived.
    pub fn finish_streaming(&mut self) {
        if let Some(last) = self.entries.last_mut() {
            if last.is_streaming() {
                last.finished = true;
            }
        }
    }

    pub fn entries(&self) -> &[TranscriptEntry] {
        &self.entries
    }

    pub fn last(&self) -> Option<&TranscriptEntry> {
        self.entries.last()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn to_request_messages(&self) -> Vec<ChatCompletionRequestMessage> {
        self.entries
            .iter()
            .map(TranscriptEntry::to_request_message)
            .collect()
    }
}

/// What the caller should do after [`AssistantSession::receive`].
#[derive(Debug, Clone, PartialEq)]
pub enum SessionAction {
    /// The session answered on its own (gate prompt); it is already in the transcript.
    Reply(String),
    /// The transcript ends with `message` as a user turn; send it to the chat backend.
    /// `notice` is a local message appended just before it (the email confirmation when
    /// a held message is replayed).
    Dispatch {
        message: String,
        notice: Option<String>,
    },
}

#[derive(Debug, Clone)]
pub struct AssistantSession {
    session_id: String,
    stage: Stage,
    identity: Option<String>,
    authenticated: bool,
    display_name: Option<String>,
    pending_message: Option<String>,
    transcript: Transcript,
    email_attempts: u32,
}

impl Default for AssistantSession {
    fn default() -> Self {
        Self::guest()
    }
}

impl AssistantSession {
    /// Anonymous visitor: the first message is held until an email is given.
    pub fn guest() -> Self {
        Self {
            session_id: new_session_id(),
            stage: Stage::AwaitingFirstMessage,
            identity: None,
            authenticated: false,
            display_name: None,
            pending_message: None,
            transcript: Transcript::default(),
            email_attempts: 0,
        }
    }

    /// Signed-in user whose email is already known. Never gated, and keeps its identity
    /// across resets.
    pub fn authenticated(email: impl Into<String>) -> Self {
        Self {
            identity: Some(email.into()),
            authenticated: true,
            ..Self::guest()
        }
    }

    pub fn with_display_name(mut self, name: impl Into<String>) -> Self {
        self.display_name = Some(name.into());
        self
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    pub fn stage(&self) -> Stage {
        self.stage
    }

    pub fn identity(&self) -> Option<&str> {
        self.identity.as_deref()
    }

    pub fn is_authenticated(&self) -> bool {
        self.authenticated
    }

    pub fn display_name(&self) -> Option<&str> {
        self.display_name.as_deref()
    }

    pub fn pending_message(&self) -> Option<&str> {
        self.pending_message.as_deref()
    }

    pub fn transcript(&self) -> &Transcript {
        &self.transcript
    }

    pub fn transcript_mut(&mut self) -> &mut Transcript {
        &mut self.transcript
    }

    /// Rejected identity attempts since the gate opened. Not capped.
    pub fn email_attempts(&self) -> u32 {
        self.email_attempts
    }

    /// Apply one user input.
    ///
    /// # Errors
    /// [`MatchError::InvalidArgument`] for a blank input; the session is left untouched.
    pub fn receive(&mut self, input: &str, prompts: &AssistantPrompts) -> Result<SessionAction> {
        let input = input.trim();
        if input.is_empty() {
            return Err(MatchError::InvalidArgument("message must not be empty".into()));
        }

        self.transcript.push(TranscriptEntry::user(input));

        match self.stage {
            Stage::AwaitingFirstMessage if self.identity.is_some() => {
                self.stage = Stage::Active;
                debug!(session_id = %self.session_id, "Known identity, session active");
                Ok(self.dispatch(input, None))
            }
            Stage::AwaitingFirstMessage => {
                self.pending_message = Some(input.to_string());
                self.stage = Stage::AwaitingEmail;
                info!(session_id = %self.session_id, "Holding first message until an email is given");
                Ok(self.reply(&prompts.email_request))
            }
            Stage::AwaitingEmail if is_valid_email(input) => {
                self.identity = Some(input.to_string());
                self.stage = Stage::Active;
                info!(
                    session_id = %self.session_id,
                    email = %mask_email(input),
                    attempts = self.email_attempts,
                    "Email captured"
                );

                let confirmation = prompts.confirmation_for(input);
                self.transcript
                    .push(TranscriptEntry::assistant(confirmation.clone()));

                match self.pending_message.take() {
                    Some(held) => {
                        self.transcript.push(TranscriptEntry::user(held.clone()));
                        Ok(self.dispatch(&held, Some(confirmation)))
                    }
                    None => Ok(SessionAction::Reply(confirmation)),
                }
            }
            Stage::AwaitingEmail => {
                self.email_attempts += 1;
                debug!(session_id = %self.session_id, attempts = self.email_attempts, "Identity attempt rejected");
                Ok(self.reply(&prompts.email_retry))
            }
            Stage::Active => Ok(self.dispatch(input, None)),
        }
    }

    fn reply(&mut self, text: &str) -> SessionAction {
        self.transcript.push(TranscriptEntry::assistant(text));
        SessionAction::Reply(text.to_string())
    }

    fn dispatch(&self, message: &str, notice: Option<String>) -> SessionAction {
        SessionAction::Dispatch {
            message: message.to_string(),
            notice,
        }
    }

    /// Record a failed turn: close any partial reply and append the apology once.
    pub fn record_failure(&mut self, apology: &str) {
        self.transcript.finish_streaming();
        let already = self
            .transcript
            .last()
            .is_some_and(|e| matches!(e.role, Role::Assistant) && e.content == apology);
        if !already {
            self.transcript.push(TranscriptEntry::assistant(apology));
        }
    }

    /// Start a new conversation: new id, empty transcript, no held message. A guest
    /// also loses the captured email.
    pub fn reset(&mut self) {
        let previous = std::mem::replace(&mut self.session_id, new_session_id());
        self.stage = Stage::AwaitingFirstMessage;
        self.pending_message = None;
        self.transcript = Transcript::default();
        self.email_attempts = 0;
        if !self.authenticated {
            self.identity = None;
        }
        info!(previous = %previous, session_id = %self.session_id, "Session reset");
    }
}

pub type SessionHandle = Arc<AsyncMutex<AssistantSession>>;

/// In-memory sessions keyed by session id.
#[derive(Default)]
pub struct SessionStore {
    sessions: Mutex<HashMap<String, SessionHandle>>,
}

impl SessionStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn map(&self) -> std::sync::MutexGuard<'_, HashMap<String, SessionHandle>> {
        self.sessions.lock().unwrap_or_else(|p| p.into_inner())
    }

    /// Register a session and return its id and handle.
    pub fn open(&self, session: AssistantSession) -> (String, SessionHandle) {
        let id = session.session_id().to_string();
        let handle = Arc::new(AsyncMutex::new(session));
        self.map().insert(id.clone(), Arc::clone(&handle));
        (id, handle)
    }

    pub fn get(&self, session_id: &str) -> Option<SessionHandle> {
        self.map().get(session_id).cloned()
    }

    /// Reset a session and re-key it under its new id, which is returned. Waits for any
    /// in-flight turn on that session to finish first.
    pub async fn reset(&self, session_id: &str) -> Result<String> {
        let handle = self
            .get(session_id)
            .ok_or_else(|| MatchError::NotFound(format!("session {session_id}")))?;

        let new_id = {
            let mut session = handle.lock().await;
            session.reset();
            session.session_id().to_string()
        };

        let mut map = self.map();
        map.remove(session_id);
        map.insert(new_id.clone(), handle);
        Ok(new_id)
    }

    /// Client gone; forget the session.
    pub fn remove(&self, session_id: &str) -> bool {
        self.map().remove(session_id).is_some()
    }

    pub fn len(&self) -> usize {
        self.map().len()
    }

    pub fn is_empty(&self) -> bool {
        self.map().is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn prompts() -> AssistantPrompts {
        AssistantPrompts::default()
    }

    #[test]
    fn test_email_validation() {
        assert!(is_valid_email("joao@example.com"));
        assert!(is_valid_email("  maria.silva+ofertas@loja.com.br "));
        assert!(!is_valid_email("não tenho email"));
        assert!(!is_valid_email("joao@example"));
        assert!(!is_valid_email("joao example@x.com"));
        assert!(!is_valid_email("@example.com"));
    }

    #[test]
    fn test_mask_email() {
        assert_eq!(mask_email("joao@example.com"), "j***@example.com");
        assert_eq!(mask_email("nope"), "***");
    }

    #[test]
    fn test_guest_gating_scenario() {
        let prompts = prompts();
        let mut session = AssistantSession::guest();
        assert_eq!(session.stage(), Stage::AwaitingFirstMessage);

        let action = session.receive("Quero um SUV até 50 mil", &prompts).unwrap();
        assert_eq!(action, SessionAction::Reply(prompts.email_request.clone()));
        assert_eq!(session.stage(), Stage::AwaitingEmail);
        assert_eq!(session.pending_message(), Some("Quero um SUV até 50 mil"));

        let action = session.receive("não tenho email", &prompts).unwrap();
        assert_eq!(action, SessionAction::Reply(prompts.email_retry.clone()));
        assert_eq!(session.stage(), Stage::AwaitingEmail);
        assert_eq!(session.pending_message(), Some("Quero um SUV até 50 mil"));
        assert_eq!(session.email_attempts(), 1);

        let action = session.receive("joao@example.com", &prompts).unwrap();
        let confirmation = prompts.confirmation_for("joao@example.com");
        assert_eq!(
            action,
            SessionAction::Dispatch {
                message: "Quero um SUV até 50 mil".into(),
                notice: Some(confirmation.clone()),
            }
        );
        assert_eq!(session.stage(), Stage::Active);
        assert_eq!(session.identity(), Some("joao@example.com"));
        assert_eq!(session.pending_message(), None);

        let contents: Vec<&str> = session
            .transcript()
            .entries()
            .iter()
            .map(|e| e.content.as_str())
            .collect();
        assert_eq!(
            contents,
            vec![
                "Quero um SUV até 50 mil",
                prompts.email_request.as_str(),
                "não tenho email",
                prompts.email_retry.as_str(),
                "joao@example.com",
                confirmation.as_str(),
                "Quero um SUV até 50 mil",
            ]
        );
        let last = session.transcript().last().unwrap();
        assert!(matches!(last.role, Role::User));
    }

    #[test]
    fn test_only_first_message_is_held() {
        let prompts = prompts();
        let mut session = AssistantSession::guest();
        session.receive("Tem Hilux?", &prompts).unwrap();
        session.receive("E Ranger?", &prompts).unwrap();
        session.receive("oi??", &prompts).unwrap();

        assert_eq!(session.pending_message(), Some("Tem Hilux?"));
        assert_eq!(session.email_attempts(), 2);
        assert_eq!(session.stage(), Stage::AwaitingEmail);
    }

    #[test]
    fn test_active_session_is_never_gated_again() {
        let prompts = prompts();
        let mut session = AssistantSession::guest();
        session.receive("Oi", &prompts).unwrap();
        session.receive("ana@example.com", &prompts).unwrap();

        let action = session.receive("outra.pessoa@example.com", &prompts).unwrap();
        assert!(matches!(action, SessionAction::Dispatch { notice: None, .. }));
        assert_eq!(session.identity(), Some("ana@example.com"));
    }

    #[test]
    fn test_authenticated_user_skips_gate_and_keeps_identity_on_reset() {
        let prompts = prompts();
        let mut session = AssistantSession::authenticated("ana@example.com").with_display_name("Ana");

        let action = session.receive("Quero um SUV", &prompts).unwrap();
        assert_eq!(
            action,
            SessionAction::Dispatch {
                message: "Quero um SUV".into(),
                notice: None
            }
        );
        assert_eq!(session.stage(), Stage::Active);

        let old_id = session.session_id().to_string();
        session.reset();
        assert_ne!(session.session_id(), old_id);
        assert_eq!(session.identity(), Some("ana@example.com"));
        assert_eq!(session.display_name(), Some("Ana"));
        assert_eq!(session.stage(), Stage::AwaitingFirstMessage);
        assert!(session.transcript().is_empty());
    }

    #[test]
    fn test_guest_reset_clears_everything() {
        let prompts = prompts();
        let mut session = AssistantSession::guest();
        session.receive("Quero um SUV até 50 mil", &prompts).unwrap();
        session.receive("não tenho email", &prompts).unwrap();

        let old_id = session.session_id().to_string();
        session.reset();
        assert!(session.transcript().is_empty());
        assert_eq!(session.pending_message(), None);
        assert_eq!(session.identity(), None);
        assert_eq!(session.email_attempts(), 0);
        assert_eq!(session.stage(), Stage::AwaitingFirstMessage);
        assert_ne!(session.session_id(), old_id);

        // and after a captured email too
        session.receive("Oi", &prompts).unwrap();
        session.receive("joao@example.com", &prompts).unwrap();
        session.reset();
        assert_eq!(session.identity(), None);
    }

    #[test]
    fn test_blank_input_leaves_session_untouched() {
        let prompts = prompts();
        let mut session = AssistantSession::guest();
        assert!(matches!(
            session.receive("   ", &prompts),
            Err(MatchError::InvalidArgument(_))
        ));
        assert!(session.transcript().is_empty());
        assert_eq!(session.stage(), Stage::AwaitingFirstMessage);
    }

    #[test]
    fn test_transcript_streaming_updates_in_place() {
        let mut transcript = Transcript::default();
        transcript.push(TranscriptEntry::user("Oi"));

        assert_eq!(transcript.append_delta("Ol"), 1);
        assert_eq!(transcript.append_delta("á!"), 1);
        assert!(transcript.last().unwrap().is_streaming());

        transcript.finish_streaming();
        assert_eq!(transcript.len(), 2);
        assert_eq!(transcript.last().unwrap().content, "Olá!");
        assert!(transcript.last().unwrap().finished);

        // a finished reply is never extended
        assert_eq!(transcript.append_delta("Nova"), 2);
    }

    #[test]
    fn test_record_failure_appends_single_apology() {
        let mut session = AssistantSession::authenticated("ana@example.com");
        session.transcript_mut().append_delta("Tenho um");
        session.record_failure("Desculpe");
        session.record_failure("Desculpe");

        let entries = session.transcript().entries();
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].content, "Tenho um");
        assert!(entries[0].finished);
        assert_eq!(entries[1].content, "Desculpe");
    }

    #[tokio::test]
    async fn test_store_reset_rekeys_session() {
        let store = SessionStore::new();
        let (id, handle) = store.open(AssistantSession::guest());
        handle
            .lock()
            .await
            .receive("Oi", &prompts())
            .unwrap();

        let new_id = store.reset(&id).await.unwrap();
        assert_ne!(id, new_id);
        assert!(store.get(&id).is_none());
        let session = store.get(&new_id).unwrap();
        assert!(session.lock().await.transcript().is_empty());
        assert_eq!(store.len(), 1);

        assert!(matches!(store.reset(&id).await, Err(MatchError::NotFound(_))));
        assert!(store.remove(&new_id));
        assert!(store.is_empty());
    }
}
