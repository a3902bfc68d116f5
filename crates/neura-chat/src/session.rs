//! Session controller: owns the conversation and runs the turn loop.
//!
//! A turn appends the user's text, renders the whole history through the
//! engine's template, submits only the part past the prompt cursor, and on
//! success records the reply and moves the cursor. Failed turns leave the
//! user entry in place and add nothing else.

use chrono::{DateTime, Utc};
use uuid::Uuid;

use neura_core::config::{ChatConfig, CursorPolicy};
use neura_core::types::ConversationEntry;
use neura_engine::InferenceEngine;

use crate::error::ChatError;
use crate::formatter::TurnFormatter;
use crate::generation::{CancelFlag, GenerationLoop, SanitizePolicy, TerminationReason};
use crate::operator::Operator;
use crate::state::{SessionState, StateMachine};
use crate::tracker::PromptCursor;

// =============================================================================
// ConversationHistory
// =============================================================================

/// Ordered conversation, opened by exactly one system entry.
///
/// Entries can only be appended, and only as user or assistant turns.
#[derive(Debug, Clone)]
pub struct ConversationHistory {
    entries: Vec<ConversationEntry>,
}

impl ConversationHistory {
    pub fn new(system_prompt: impl Into<String>) -> Self {
        Self {
            entries: vec![ConversationEntry::system(system_prompt)],
        }
    }

    pub fn entries(&self) -> &[ConversationEntry] {
        &self.entries
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn last(&self) -> Option<&ConversationEntry> {
        self.entries.last()
    }

    fn push_user(&mut self, content: &str) {
        self.entries.push(ConversationEntry::user(content));
    }

    fn push_assistant(&mut self, content: String) {
        self.entries.push(ConversationEntry::assistant(content));
    }
}

// =============================================================================
// Outcomes
// =============================================================================

/// Result of handing one input line to the session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TurnOutcome {
    /// The assistant answered; the reply is now part of the history.
    Reply {
        text: String,
        reason: TerminationReason,
    },
    /// The exit command was entered; the session is terminated.
    Exit,
}

/// Snapshot of a session's progress.
#[derive(Debug, Clone)]
pub struct SessionSummary {
    pub id: Uuid,
    pub started_at: DateTime<Utc>,
    pub turns_completed: usize,
    pub turns_failed: usize,
    pub history_len: usize,
    pub cursor: usize,
}

// =============================================================================
// ChatSession
// =============================================================================

/// One interactive chat session bound to an exclusively owned engine.
///
/// The engine is released when the session is dropped.
pub struct ChatSession<E: InferenceEngine> {
    id: Uuid,
    started_at: DateTime<Utc>,
    engine: E,
    history: ConversationHistory,
    cursor: PromptCursor,
    formatter: TurnFormatter,
    generation: GenerationLoop,
    cursor_policy: CursorPolicy,
    exit_command: String,
    state: StateMachine,
    turns_completed: usize,
    turns_failed: usize,
}

impl<E: InferenceEngine> ChatSession<E> {
    /// Start a session on `engine` using the chat settings in `config`.
    pub fn new(engine: E, config: &ChatConfig) -> Self {
        let sanitize = if config.sanitize {
            SanitizePolicy::Placeholder(config.placeholder)
        } else {
            SanitizePolicy::Verbatim
        };
        let generation = GenerationLoop::new()
            .with_max_tokens(config.token_limit())
            .with_sanitize(sanitize);
        let formatter = TurnFormatter::with_capacity(engine.capacity());

        let session = Self {
            id: Uuid::new_v4(),
            started_at: Utc::now(),
            engine,
            history: ConversationHistory::new(config.system_prompt.clone()),
            cursor: PromptCursor::new(),
            formatter,
            generation,
            cursor_policy: config.cursor_policy,
            exit_command: config.exit_command.clone(),
            state: StateMachine::new(),
            turns_completed: 0,
            turns_failed: 0,
        };
        tracing::info!(
            session_id = %session.id,
            capacity = session.engine.capacity(),
            policy = ?session.cursor_policy,
            "Chat session started"
        );
        session
    }

    /// Replace the cancellation flag, e.g. with one shared with a signal handler.
    pub fn with_cancel_flag(mut self, cancel: CancelFlag) -> Self {
        self.generation = self.generation.with_cancel_flag(cancel);
        self
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn state(&self) -> SessionState {
        self.state.current()
    }

    pub fn history(&self) -> &ConversationHistory {
        &self.history
    }

    /// Bytes of the rendered transcript already consumed by the engine.
    pub fn cursor_position(&self) -> usize {
        self.cursor.position()
    }

    pub fn engine(&self) -> &E {
        &self.engine
    }

    pub fn engine_mut(&mut self) -> &mut E {
        &mut self.engine
    }

    pub fn cancel_flag(&self) -> CancelFlag {
        self.generation.cancel_flag().clone()
    }

    pub fn summary(&self) -> SessionSummary {
        SessionSummary {
            id: self.id,
            started_at: self.started_at,
            turns_completed: self.turns_completed,
            turns_failed: self.turns_failed,
            history_len: self.history.len(),
            cursor: self.cursor.position(),
        }
    }

    /// Handle one input line without streaming.
    pub fn submit(&mut self, line: &str) -> Result<TurnOutcome, ChatError> {
        self.handle_input(line, &mut |_: &str| {})
    }

    /// Handle one input line, reporting reply pieces to `on_piece`.
    ///
    /// # Errors
    /// `ChatError::SessionClosed` once the session is terminated; otherwise
    /// the error that aborted this turn, after which the session is ready
    /// for the next line.
    pub fn handle_input(
        &mut self,
        line: &str,
        on_piece: &mut dyn FnMut(&str),
    ) -> Result<TurnOutcome, ChatError> {
        if self.state.current() == SessionState::Terminated {
            return Err(ChatError::SessionClosed);
        }

        if line == self.exit_command {
            self.state.transition(SessionState::Terminated)?;
            tracing::info!(session_id = %self.id, "Exit command received");
            return Ok(TurnOutcome::Exit);
        }

        self.state.transition(SessionState::Formatting)?;
        self.history.push_user(line);
        self.run_turn(on_piece)
    }

    /// Terminate the session without an exit command (end of input).
    pub fn close(&mut self) {
        if self.state.current() == SessionState::AwaitingInput {
            let _ = self.state.transition(SessionState::Terminated);
        }
    }

    /// Read-eval loop: take lines from `operator` until the exit command or
    /// end of input. Per-turn errors are reported and the loop continues.
    ///
    /// # Errors
    /// Operator I/O failures and unrecoverable session errors.
    pub fn run<O: Operator>(&mut self, operator: &mut O) -> Result<SessionSummary, ChatError> {
        loop {
            let Some(line) = operator.read_line()? else {
                tracing::debug!(session_id = %self.id, "End of input");
                self.close();
                break;
            };

            let outcome = self.handle_input(&line, &mut |piece: &str| operator.on_piece(piece));
            match outcome {
                Ok(TurnOutcome::Reply { text, .. }) => operator.respond(&text)?,
                Ok(TurnOutcome::Exit) => break,
                Err(e) if e.is_recoverable() => operator.report(&e)?,
                Err(e) => return Err(e),
            }
        }

        let summary = self.summary();
        tracing::info!(
            session_id = %summary.id,
            turns = summary.turns_completed,
            failed = summary.turns_failed,
            elapsed_secs = (Utc::now() - summary.started_at).num_seconds(),
            "Chat session ended"
        );
        Ok(summary)
    }

    // -- Private helpers --

    fn run_turn(&mut self, on_piece: &mut dyn FnMut(&str)) -> Result<TurnOutcome, ChatError> {
        let rendered = match self
            .formatter
            .render(&self.engine, self.history.entries(), true)
        {
            Ok(rendered) => rendered,
            Err(e) => return Err(self.abort(e)),
        };
        let suffix = match self.cursor.pending(&rendered) {
            Ok(suffix) => suffix,
            Err(e) => return Err(self.abort(e)),
        };

        tracing::debug!(
            session_id = %self.id,
            turn = self.turns_completed + self.turns_failed + 1,
            rendered = rendered.len(),
            cursor = self.cursor.position(),
            pending = suffix.len(),
            "Submitting turn"
        );

        self.state.transition(SessionState::Generating)?;
        let result = match self.generation.generate(&mut self.engine, suffix, on_piece) {
            Ok(result) => result,
            Err(e) => return Err(self.abort(e)),
        };
        let reason = result.reason;
        let text = match result.into_reply() {
            Ok(text) => text,
            Err(e) => return Err(self.abort(e)),
        };

        self.state.transition(SessionState::Responding)?;
        let consumed = rendered.len() + text.len();
        self.record_reply(text.clone(), consumed);
        self.state.transition(SessionState::AwaitingInput)?;
        self.turns_completed += 1;

        Ok(TurnOutcome::Reply { text, reason })
    }

    /// Append the reply and move the cursor per the configured policy.
    ///
    /// `consumed` is the length of this turn's render plus the reply: what the
    /// engine actually holds. The reply's closing marker is not part of it,
    /// since the end-of-generation token is sampled but never advanced.
    fn record_reply(&mut self, text: String, consumed: usize) {
        let before_reply = match self.cursor_policy {
            CursorPolicy::ReplayReply => Some(self.render_len_without_prompt()),
            CursorPolicy::AssumeResident => None,
        };

        self.history.push_assistant(text);

        let target = match before_reply {
            Some(len) => len,
            None => self.resident_len(consumed),
        };
        match target.and_then(|len| self.cursor.advance_to(len)) {
            Ok(()) => {}
            Err(e) => tracing::warn!(
                session_id = %self.id,
                error = %e,
                cursor = self.cursor.position(),
                "Prompt cursor left in place"
            ),
        }
    }

    /// Cursor for `AssumeResident`: `consumed`, provided the full render
    /// really extends what the engine consumed. Templates whose generation
    /// prompt differs from the assistant prefix fall back to replaying the
    /// reply.
    fn resident_len(&mut self, consumed: usize) -> Result<usize, ChatError> {
        let entries = self.history.entries();
        let (last, earlier) = entries
            .split_last()
            .ok_or_else(|| ChatError::Template("history is empty".to_string()))?;
        let with_prompt = self.formatter.render(&self.engine, earlier, true)?;
        let full = self.formatter.render(&self.engine, entries, false)?;

        let resident = format!("{}{}", with_prompt, last.content());
        if resident.len() == consumed && full.starts_with(&resident) {
            return Ok(consumed);
        }
        tracing::warn!(
            session_id = %self.id,
            template_prefix = with_prompt.len(),
            "Generation prompt does not open the assistant entry, replaying reply"
        );
        self.formatter
            .render(&self.engine, earlier, false)
            .map(|r| r.len())
    }

    fn render_len_without_prompt(&mut self) -> Result<usize, ChatError> {
        self.formatter
            .render(&self.engine, self.history.entries(), false)
            .map(|r| r.len())
    }

    fn abort(&mut self, error: ChatError) -> ChatError {
        tracing::warn!(
            session_id = %self.id,
            state = %self.state.current(),
            error = %error,
            "Turn aborted"
        );
        self.turns_failed += 1;
        self.state.reset();
        error
    }
}
