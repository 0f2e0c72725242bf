//! Conversation controller: drives one turn from submission to a finished
//! model message

use futures::StreamExt;
use parley_core::bus::{ChatEvent, EventSender};
use parley_core::grounding::GroundingSet;
use parley_core::session::{Attachment, Citation, Message};
use parley_core::utils::truncate_chars;
use parley_core::{Error, Result};
use parley_providers::{Fragment, ProviderResult, StreamingExecutor};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::context::ContextBuilder;
use crate::failure::FailureCategory;
use crate::persist::Persister;
use crate::state::{SessionRegistry, TurnToken};

/// Longest title taken verbatim from the first user input
pub const TITLE_MAX_CHARS: usize = 40;
/// Title used when the first turn carries only attachments
pub const ATTACHMENT_TITLE: &str = "Attachment";

/// How a submitted turn ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TurnOutcome {
    /// The reply streamed to completion
    Completed,
    /// The reply ended with a failure annotation
    Failed { category: FailureCategory },
    /// The session was cleared or deleted while the reply was streaming
    Discarded,
}

/// Title derived from a session's first submission
pub fn derive_title(text: &str, has_attachments: bool) -> Option<String> {
    let text = text.trim();
    if !text.is_empty() {
        Some(truncate_chars(text, TITLE_MAX_CHARS))
    } else if has_attachments {
        Some(ATTACHMENT_TITLE.to_string())
    } else {
        None
    }
}

/// State captured when a turn is accepted
struct AcceptedTurn {
    token: TurnToken,
    user_message_id: Uuid,
    model_message_id: Uuid,
    title: Option<String>,
    history: Vec<parley_providers::Content>,
    config: parley_providers::GenerationConfig,
}

/// Fails the turn if the submitting future is dropped before it finishes.
///
/// `finish` only applies once per token, so a turn that already ended is
/// left untouched.
struct CancelGuard<'a> {
    controller: &'a ConversationController,
    token: TurnToken,
    message_id: Uuid,
}

impl Drop for CancelGuard<'_> {
    fn drop(&mut self) {
        let category = FailureCategory::Network;
        let explanation = category.explanation();
        let applied = self
            .controller
            .finish(&self.token, self.message_id, |message| message.mark_failed(explanation));
        if !applied {
            return;
        }

        warn!(
            "Turn {} on session {} cancelled before it finished",
            self.token.turn_id, self.token.session_id
        );
        self.controller.emit(ChatEvent::TurnFailed {
            session_id: self.token.session_id,
            message_id: self.message_id,
            explanation: explanation.to_string(),
        });
        if let Ok(handle) = tokio::runtime::Handle::try_current() {
            let persister = self.controller.persister.clone();
            let session_id = self.token.session_id;
            handle.spawn(async move { persister.persist(session_id).await });
        }
    }
}

/// Applies streamed replies to sessions in the shared registry.
///
/// Each turn is the single consumer of its fragment channel; the lock on the
/// registry is only taken to apply one change at a time.
#[derive(Clone)]
pub struct ConversationController {
    registry: SessionRegistry,
    executor: StreamingExecutor,
    context: ContextBuilder,
    persister: Persister,
    events: Option<EventSender>,
}

impl ConversationController {
    pub fn new(
        registry: SessionRegistry,
        executor: StreamingExecutor,
        context: ContextBuilder,
        persister: Persister,
        events: Option<EventSender>,
    ) -> Self {
        Self {
            registry,
            executor,
            context,
            persister,
            events,
        }
    }

    pub fn context(&self) -> &ContextBuilder {
        &self.context
    }

    fn emit(&self, event: ChatEvent) {
        if let Some(tx) = &self.events {
            let _ = tx.send(event);
        }
    }

    /// Run one turn on `session_id`.
    ///
    /// Returns `Err` only when the submission is rejected: the session is
    /// unknown, the input is empty, or another turn is still in flight.
    /// Every failure after acceptance ends as a failed model message.
    pub async fn submit_turn(
        &self,
        session_id: Uuid,
        text: &str,
        attachments: Vec<Attachment>,
    ) -> Result<TurnOutcome> {
        if text.trim().is_empty() && attachments.is_empty() {
            return Err(Error::Validation(
                "a turn needs text or at least one attachment".to_string(),
            ));
        }

        let new_turn = self.context.new_turn(text, &attachments);
        let turn = self.accept(session_id, text, attachments)?;
        let token = turn.token;
        let _cancel = CancelGuard {
            controller: self,
            token,
            message_id: turn.model_message_id,
        };

        info!(
            "Turn {} accepted on session {} ({} prior messages)",
            token.turn_id,
            session_id,
            turn.history.len()
        );
        self.emit(ChatEvent::UserMessageAppended {
            session_id,
            message_id: turn.user_message_id,
            text: text.to_string(),
        });
        if let Some(title) = turn.title {
            self.emit(ChatEvent::TitleChanged { session_id, title });
        }
        self.emit(ChatEvent::ModelMessageStarted {
            session_id,
            message_id: turn.model_message_id,
        });
        self.persister.persist(session_id).await;

        // Capacity one: the pump never runs more than a fragment ahead.
        let (tx, mut rx) = mpsc::channel::<ProviderResult<Fragment>>(1);
        let executor = self.executor.clone();
        let history = turn.history;
        let config = turn.config;
        tokio::spawn(async move {
            let mut stream = tokio::select! {
                _ = tx.closed() => return,
                stream = executor.execute(history, new_turn, config) => stream,
            };
            while let Some(item) = stream.next().await {
                if tx.send(item).await.is_err() {
                    debug!("Turn {} abandoned; dropping reply stream", token.turn_id);
                    return;
                }
            }
        });

        let mut grounding = GroundingSet::new();
        while let Some(item) = rx.recv().await {
            match item {
                Ok(fragment) => {
                    if !self.apply_fragment(&token, turn.model_message_id, fragment, &mut grounding)
                    {
                        return Ok(self.discard(&token));
                    }
                }
                Err(err) => {
                    let category = FailureCategory::classify(&err);
                    warn!(
                        "Turn {} on session {} failed ({}): {}",
                        token.turn_id, session_id, category, err
                    );
                    return Ok(self.finish_failed(&token, turn.model_message_id, category).await);
                }
            }
        }

        Ok(self.finish_completed(&token, turn.model_message_id).await)
    }

    /// Drafting: append the user message and the placeholder in one step
    fn accept(
        &self,
        session_id: Uuid,
        text: &str,
        attachments: Vec<Attachment>,
    ) -> Result<AcceptedTurn> {
        let has_attachments = !attachments.is_empty();
        let accepted = self.registry.with_slot(session_id, |slot| {
            if slot.in_flight.is_some() {
                return Err(Error::TurnInProgress(session_id));
            }

            let history = self.context.history_view(&slot.session.messages);
            let config = self.context.turn_config(slot.session.mode);

            let user = Message::user(text, attachments);
            let user_message_id = user.id;
            slot.session.push(user);

            let title = if slot.session.has_placeholder_title() {
                derive_title(text, has_attachments)
            } else {
                None
            };
            if let Some(title) = &title {
                slot.session.title = title.clone();
            }

            let placeholder = Message::placeholder();
            let model_message_id = placeholder.id;
            slot.session.push(placeholder);

            let turn_id = Uuid::new_v4();
            slot.in_flight = Some(turn_id);

            Ok(AcceptedTurn {
                token: TurnToken {
                    session_id,
                    generation: slot.generation,
                    turn_id,
                },
                user_message_id,
                model_message_id,
                title,
                history,
                config,
            })
        });

        accepted.unwrap_or_else(|| Err(Error::NotFound(format!("session {}", session_id))))
    }

    /// Streaming: concatenate one fragment; false when the turn is stale
    fn apply_fragment(
        &self,
        token: &TurnToken,
        message_id: Uuid,
        fragment: Fragment,
        grounding: &mut GroundingSet,
    ) -> bool {
        let new_citations: Option<Vec<Citation>> = self
            .registry
            .with_slot(token.session_id, |slot| {
                if !slot.accepts(token) {
                    return None;
                }
                let before = grounding.len();
                grounding.accumulate(fragment.citations);
                let added = grounding.as_slice()[before..].to_vec();

                let message = slot.session.message_mut(message_id)?;
                message.text.push_str(&fragment.text_delta);
                message.citations.extend(added.iter().cloned());
                slot.session.touch();
                Some(added)
            })
            .flatten();

        let Some(citations) = new_citations else {
            return false;
        };
        self.emit(ChatEvent::ModelDelta {
            session_id: token.session_id,
            message_id,
            text_delta: fragment.text_delta,
            citations,
        });
        true
    }

    async fn finish_completed(&self, token: &TurnToken, message_id: Uuid) -> TurnOutcome {
        let applied = self.finish(token, message_id, |message| message.mark_completed());
        if !applied {
            return self.discard(token);
        }
        info!("Turn {} completed", token.turn_id);
        self.emit(ChatEvent::TurnCompleted {
            session_id: token.session_id,
            message_id,
        });
        self.persister.persist(token.session_id).await;
        TurnOutcome::Completed
    }

    async fn finish_failed(
        &self,
        token: &TurnToken,
        message_id: Uuid,
        category: FailureCategory,
    ) -> TurnOutcome {
        let explanation = category.explanation();
        let applied = self.finish(token, message_id, |message| message.mark_failed(explanation));
        if !applied {
            return self.discard(token);
        }
        self.emit(ChatEvent::TurnFailed {
            session_id: token.session_id,
            message_id,
            explanation: explanation.to_string(),
        });
        self.persister.persist(token.session_id).await;
        TurnOutcome::Failed { category }
    }

    /// Apply a terminal transition and release the session for new turns
    fn finish(
        &self,
        token: &TurnToken,
        message_id: Uuid,
        transition: impl FnOnce(&mut Message),
    ) -> bool {
        self.registry
            .with_slot(token.session_id, |slot| {
                if !slot.accepts(token) {
                    return false;
                }
                slot.in_flight = None;
                let Some(message) = slot.session.message_mut(message_id) else {
                    return false;
                };
                transition(message);
                slot.session.touch();
                true
            })
            .unwrap_or(false)
    }

    fn discard(&self, token: &TurnToken) -> TurnOutcome {
        debug!(
            "Turn {} on session {} is stale; discarding remaining fragments",
            token.turn_id, token.session_id
        );
        TurnOutcome::Discarded
    }
}
