//! # Sales assistant
//!
//! [`Assistant`] runs one user turn end to end:
//!
//! 1. The session applies the input ([`AssistantSession::receive`]). Gate prompts are
//!    answered locally and never reach the backend.
//! 2. For a dispatched turn, the request is built from the system prompt, an optional
//!    inventory block (semantic search over the user's message, trimmed to a token
//!    budget) and the full transcript.
//! 3. The backend stream is consumed into the transcript.
//! 4. On failure the session gets a single apology entry and keeps its stage; the
//!    error is returned so the caller can offer a retry.
//!
//! Progress is reported through a [`TurnEvent`] callback: the local notice (if any)
//! first, then each streamed delta.
//!
//! [`Assistant::send`] holds the session's lock for the whole turn, so a second send
//! on the same session waits for the first stream to finish.

use async_openai::types::chat::{
    ChatCompletionRequestMessage, ChatCompletionRequestSystemMessage,
    ChatCompletionRequestSystemMessageContent,
};
use std::sync::Arc;
use tracing::{error, info, warn};

use crate::{
    chat::{ChatBackend, ChatRequest},
    error::{MatchError, Result},
    prompts::AssistantPrompts,
    search::{SearchService, render_inventory},
    session::{AssistantSession, SessionAction, SessionHandle},
    stream::{CancelSignal, StreamEnd, StreamSummary, consume_stream},
};

#[derive(Debug, Clone, PartialEq)]
pub enum TurnOutcome {
    /// Answered by the session itself (identity gate).
    Local(String),
    /// The backend streamed a reply into the transcript. `notice` is the local message
    /// shown before it, if any.
    Streamed {
        notice: Option<String>,
        summary: StreamSummary,
    },
}

/// Progress of a dispatched turn, in order.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum TurnEvent<'a> {
    /// Local message shown before the reply (the email confirmation on replay).
    Notice(&'a str),
    /// Next piece of the streamed reply.
    Delta(&'a str),
}

struct Grounding {
    search: SearchService,
    results: usize,
    max_tokens: usize,
}

pub struct Assistant {
    backend: Arc<dyn ChatBackend>,
    prompts: AssistantPrompts,
    assistant_name: String,
    grounding: Option<Grounding>,
}

fn system_message(content: String) -> ChatCompletionRequestMessage {
    ChatCompletionRequestMessage::System(ChatCompletionRequestSystemMessage {
        content: ChatCompletionRequestSystemMessageContent::Text(content),
        name: None,
    })
}

impl Assistant {
    pub fn new(
        backend: Arc<dyn ChatBackend>,
        prompts: AssistantPrompts,
        assistant_name: impl Into<String>,
    ) -> Self {
        Self {
            backend,
            prompts,
            assistant_name: assistant_name.into(),
            grounding: None,
        }
    }

    /// Ground dispatched turns in inventory: up to `results` matches, in at most
    /// `max_tokens` tokens.
    pub fn with_inventory(mut self, search: SearchService, results: usize, max_tokens: usize) -> Self {
        self.grounding = Some(Grounding {
            search,
            results,
            max_tokens,
        });
        self
    }

    pub fn prompts(&self) -> &AssistantPrompts {
        &self.prompts
    }

    /// Run one turn on a shared session, waiting for any turn already in flight.
    pub async fn send(
        &self,
        session: &SessionHandle,
        input: &str,
        cancel: CancelSignal,
        on_event: impl FnMut(TurnEvent<'_>) + Send,
    ) -> Result<TurnOutcome> {
        let mut session = session.lock().await;
        self.handle(&mut session, input, cancel, on_event).await
    }

    /// Run one turn on a session the caller already holds.
    ///
    /// # Errors
    /// - [`MatchError::InvalidArgument`] for a blank input (nothing is recorded).
    /// - Any backend or stream error of a dispatched turn, after the apology was
    ///   appended.
    pub async fn handle(
        &self,
        session: &mut AssistantSession,
        input: &str,
        cancel: CancelSignal,
        mut on_event: impl FnMut(TurnEvent<'_>) + Send,
    ) -> Result<TurnOutcome> {
        match session.receive(input, &self.prompts)? {
            SessionAction::Reply(text) => Ok(TurnOutcome::Local(text)),
            SessionAction::Dispatch { message, notice } => {
                if let Some(notice) = notice.as_deref() {
                    on_event(TurnEvent::Notice(notice));
                }
                let on_delta = |delta: &str| on_event(TurnEvent::Delta(delta));
                match self.dispatch(session, &message, cancel, on_delta).await {
                    Ok(summary) => Ok(TurnOutcome::Streamed { notice, summary }),
                    Err(err) => {
                        error!(
                            session_id = %session.session_id(),
                            retryable = err.is_retryable(),
                            "Assistant turn failed: {err}"
                        );
                        session.record_failure(&self.prompts.apology);
                        Err(err)
                    }
                }
            }
        }
    }

    async fn dispatch(
        &self,
        session: &mut AssistantSession,
        message: &str,
        cancel: CancelSignal,
        on_delta: impl FnMut(&str) + Send,
    ) -> Result<StreamSummary> {
        let request = self.build_request(session, message).await;
        let chunks = self.backend.open_stream(&request).await?;
        let summary = consume_stream(chunks, session.transcript_mut(), cancel, on_delta).await?;

        if summary.content.is_empty() && summary.end != StreamEnd::Cancelled {
            return Err(MatchError::StreamUnavailable(
                "chat backend sent no content".into(),
            ));
        }
        info!(
            session_id = %session.session_id(),
            chars = summary.content.len(),
            end = ?summary.end,
            "Assistant reply received"
        );
        Ok(summary)
    }

    async fn build_request(&self, session: &AssistantSession, message: &str) -> ChatRequest {
        let mut messages = vec![system_message(
            self.prompts.system_prompt_for(&self.assistant_name),
        )];
        if let Some(inventory) = self.inventory_for(message).await {
            messages.push(system_message(inventory));
        }
        messages.extend(session.transcript().to_request_messages());

        ChatRequest {
            messages,
            session_id: session.session_id().to_string(),
            display_name: session.display_name().map(str::to_string),
            email: session.identity().map(str::to_string),
            stream: true,
        }
    }

    /// Inventory block for `message`. Failures only cost the grounding, never the turn.
    async fn inventory_for(&self, message: &str) -> Option<String> {
        let grounding = self.grounding.as_ref()?;
        let results = match grounding.search.search(message, grounding.results).await {
            Ok(results) => results,
            Err(err) => {
                warn!("Inventory search failed, answering without it: {err}");
                return None;
            }
        };
        if results.is_empty() {
            return None;
        }
        match render_inventory(&self.prompts.inventory_header, &results, grounding.max_tokens) {
            Ok(block) => block,
            Err(err) => {
                warn!("Could not render inventory: {err}");
                None
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        chat::tests::ScriptedBackend,
        config::SearchConfig,
        embedding::{
            EmbeddingGenerator,
            tests::{DownEmbedder, KeywordEmbedder},
        },
        session::{SessionStore, Stage},
        stream::cancel_pair,
        sync::EmbeddingSync,
        vector_store::InMemoryVehicleStore,
        vehicle::tests::corolla,
    };
    use async_openai::types::chat::{
        ChatCompletionRequestAssistantMessageContent, ChatCompletionRequestUserMessageContent,
    };
    use tokio::sync::Mutex as AsyncMutex;

    const HELLO: &[&str] = &[
        "data: {\"choices\":[{\"delta\":{\"content\":\"Hello\"}}]}\n",
        "\ndata: {\"choices\":[{\"delta\":{\"content\":\" world\"}}]}\n\ndata: {\"choices\":[{\"delta\":{\"con",
        "tent\":\"!\"}}]}\n\ndata: [DONE]\n\n",
    ];

    fn hello() -> Result<Vec<&'static str>> {
        Ok(HELLO.to_vec())
    }

    fn text(message: &ChatCompletionRequestMessage) -> (&'static str, String) {
        match message {
            ChatCompletionRequestMessage::System(m) => match &m.content {
                ChatCompletionRequestSystemMessageContent::Text(t) => ("system", t.clone()),
                _ => ("system", String::new()),
            },
            ChatCompletionRequestMessage::User(m) => match &m.content {
                ChatCompletionRequestUserMessageContent::Text(t) => ("user", t.clone()),
                _ => ("user", String::new()),
            },
            ChatCompletionRequestMessage::Assistant(m) => match &m.content {
                Some(ChatCompletionRequestAssistantMessageContent::Text(t)) => {
                    ("assistant", t.clone())
                }
                _ => ("assistant", String::new()),
            },
            _ => ("other", String::new()),
        }
    }

    fn assistant(backend: Arc<ScriptedBackend>) -> Assistant {
        let _ = tracing_subscriber::fmt::try_init();
        Assistant::new(backend, AssistantPrompts::default(), "Lia")
    }

    async fn say(assistant: &Assistant, session: &mut AssistantSession, input: &str) -> Result<TurnOutcome> {
        assistant
            .handle(session, input, CancelSignal::never(), |_| {})
            .await
    }

    #[tokio::test]
    async fn test_notice_is_reported_before_deltas() {
        let backend = Arc::new(ScriptedBackend::new(vec![hello()]));
        let assistant = assistant(backend);
        let mut session = AssistantSession::guest();
        say(&assistant, &mut session, "Tem Compass?").await.unwrap();

        let mut events = Vec::new();
        assistant
            .handle(&mut session, "ana@example.com", CancelSignal::never(), |event| {
                events.push(match event {
                    TurnEvent::Notice(_) => "notice".to_string(),
                    TurnEvent::Delta(delta) => delta.to_string(),
                })
            })
            .await
            .unwrap();
        assert_eq!(events, vec!["notice", "Hello", " world", "!"]);
    }

    #[tokio::test]
    async fn test_gated_message_is_replayed_after_email() {
        let backend = Arc::new(ScriptedBackend::new(vec![hello()]));
        let assistant = assistant(backend.clone());
        let prompts = assistant.prompts().clone();
        let mut session = AssistantSession::guest();

        let outcome = say(&assistant, &mut session, "Quero um SUV até 50 mil").await.unwrap();
        assert_eq!(outcome, TurnOutcome::Local(prompts.email_request.clone()));
        assert_eq!(session.stage(), Stage::AwaitingEmail);

        let outcome = say(&assistant, &mut session, "não tenho email").await.unwrap();
        assert_eq!(outcome, TurnOutcome::Local(prompts.email_retry.clone()));
        assert!(backend.requests().is_empty());

        let outcome = say(&assistant, &mut session, "joao@example.com").await.unwrap();
        let TurnOutcome::Streamed { notice, summary } = outcome else {
            panic!("expected a streamed reply");
        };
        assert_eq!(notice, Some(prompts.confirmation_for("joao@example.com")));
        assert_eq!(summary.content, "Hello world!");
        assert_eq!(summary.end, StreamEnd::Done);

        let requests = backend.requests();
        assert_eq!(requests.len(), 1);
        let request = &requests[0];
        assert_eq!(request.session_id, session.session_id());
        assert_eq!(request.email.as_deref(), Some("joao@example.com"));
        assert!(request.stream);

        let first = text(&request.messages[0]);
        assert_eq!(first.0, "system");
        assert!(first.1.contains("Lia"));
        let last = text(request.messages.last().unwrap());
        assert_eq!(last, ("user", "Quero um SUV até 50 mil".to_string()));

        assert_eq!(session.stage(), Stage::Active);
        assert_eq!(session.pending_message(), None);
        let reply = session.transcript().last().unwrap();
        assert_eq!(reply.content, "Hello world!");
        assert!(reply.finished);
    }

    #[tokio::test]
    async fn test_failure_appends_apology_and_keeps_stage() {
        let backend = Arc::new(ScriptedBackend::new(vec![
            Err(MatchError::Upstream {
                status: 503,
                detail: Some("maintenance".into()),
            }),
            hello(),
        ]));
        let assistant = assistant(backend.clone());
        let mut session = AssistantSession::authenticated("ana@example.com");

        let err = say(&assistant, &mut session, "Tem Hilux?").await.unwrap_err();
        assert!(err.is_retryable());
        assert_eq!(session.stage(), Stage::Active);
        assert_eq!(
            session.transcript().last().unwrap().content,
            assistant.prompts().apology
        );
        assert_eq!(session.transcript().len(), 2);

        // the session keeps working
        say(&assistant, &mut session, "Tem Hilux?").await.unwrap();
        assert_eq!(session.transcript().last().unwrap().content, "Hello world!");
    }

    #[tokio::test]
    async fn test_blank_input_while_gated_changes_nothing() {
        let backend = Arc::new(ScriptedBackend::new(vec![]));
        let assistant = assistant(backend);
        let mut session = AssistantSession::guest();
        say(&assistant, &mut session, "Oi").await.unwrap();

        // blank input is rejected before reaching the state machine
        assert!(matches!(
            say(&assistant, &mut session, "  ").await,
            Err(MatchError::InvalidArgument(_))
        ));
        assert_eq!(session.stage(), Stage::AwaitingEmail);
        assert_eq!(session.pending_message(), Some("Oi"));
    }

    #[tokio::test]
    async fn test_empty_reply_is_an_error() {
        let backend = Arc::new(ScriptedBackend::new(vec![Ok(vec!["data: [DONE]\n\n"])]));
        let assistant = assistant(backend);
        let mut session = AssistantSession::authenticated("ana@example.com");

        let err = say(&assistant, &mut session, "Oi").await.unwrap_err();
        assert!(matches!(err, MatchError::StreamUnavailable(_)));
        assert_eq!(
            session.transcript().last().unwrap().content,
            assistant.prompts().apology
        );
    }

    #[tokio::test]
    async fn test_cancelled_turn_keeps_partial_reply() {
        let backend = Arc::new(ScriptedBackend::new(vec![hello()]));
        let assistant = assistant(backend);
        let mut session = AssistantSession::authenticated("ana@example.com");
        let (handle, signal) = cancel_pair();

        let outcome = assistant
            .handle(&mut session, "Oi", signal, |_| handle.cancel())
            .await
            .unwrap();
        let TurnOutcome::Streamed { summary, .. } = outcome else {
            panic!("expected a streamed reply");
        };
        assert_eq!(summary.end, StreamEnd::Cancelled);
        assert_eq!(summary.content, "Hello");
        assert_eq!(session.transcript().last().unwrap().content, "Hello");
    }

    #[tokio::test]
    async fn test_second_send_waits_for_first() {
        let backend = Arc::new(ScriptedBackend::new(vec![hello(), hello()]));
        let assistant = assistant(backend.clone());
        let store = SessionStore::new();
        let (_id, handle) = store.open(AssistantSession::authenticated("ana@example.com"));

        let (first, second) = tokio::join!(
            assistant.send(&handle, "Primeira", CancelSignal::never(), |_| {}),
            assistant.send(&handle, "Segunda", CancelSignal::never(), |_| {}),
        );
        first.unwrap();
        second.unwrap();

        let requests = backend.requests();
        let roles: Vec<Vec<(&str, String)>> = requests
            .iter()
            .map(|r| r.messages.iter().map(text).collect())
            .collect();
        assert_eq!(roles[0].len(), 2);
        assert_eq!(
            roles[1][1..].to_vec(),
            vec![
                ("user", "Primeira".to_string()),
                ("assistant", "Hello world!".to_string()),
                ("user", "Segunda".to_string()),
            ]
        );
        assert_eq!(handle.lock().await.transcript().len(), 4);
    }

    async fn grounded(embedder: Arc<dyn crate::embedding::Embedder>, backend: Arc<ScriptedBackend>) -> Assistant {
        let keywords = Arc::new(KeywordEmbedder::new(32));
        let store = Arc::new(InMemoryVehicleStore::new());
        store.insert_vehicle(corolla()).await;
        EmbeddingSync::new(EmbeddingGenerator::new(keywords), store.clone())
            .sync("v-corolla")
            .await
            .unwrap();

        let search = SearchService::new(embedder, store, &SearchConfig::default());
        assistant(backend).with_inventory(search, 5, 1200)
    }

    #[tokio::test]
    async fn test_inventory_grounds_request_but_not_transcript() {
        let backend = Arc::new(ScriptedBackend::new(vec![hello()]));
        let assistant = grounded(Arc::new(KeywordEmbedder::new(32)), backend.clone()).await;
        let session = Arc::new(AsyncMutex::new(AssistantSession::authenticated("ana@example.com")));

        assistant
            .send(&session, "sedã prata único dono Campinas", CancelSignal::never(), |_| {})
            .await
            .unwrap();

        let request = &backend.requests()[0];
        let inventory = text(&request.messages[1]);
        assert_eq!(inventory.0, "system");
        assert!(inventory.1.starts_with(&assistant.prompts().inventory_header));
        assert!(inventory.1.contains("Toyota Corolla XEi 2022/2023"));

        let session = session.lock().await;
        assert!(
            session
                .transcript()
                .entries()
                .iter()
                .all(|e| !e.content.contains("Toyota Corolla"))
        );
    }

    #[tokio::test]
    async fn test_grounding_failure_does_not_fail_turn() {
        let backend = Arc::new(ScriptedBackend::new(vec![hello()]));
        let assistant = grounded(Arc::new(DownEmbedder), backend.clone()).await;
        let mut session = AssistantSession::authenticated("ana@example.com");

        say(&assistant, &mut session, "SUV").await.unwrap();
        let request = &backend.requests()[0];
        assert_eq!(request.messages.len(), 2);
    }
}
