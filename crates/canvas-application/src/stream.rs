//! Stream session lifecycle.
//!
//! A session is `Open` while chunks arrive, `Finalizing` once the producer has
//! announced the durable id, and ends `Closed` or `Aborted`. Terminal session
//! ids are remembered (bounded) so a reused id is rejected instead of silently
//! reopening a finished stream.

use canvas_core::config::StreamConfig;
use canvas_core::directive::{
    DIRECTIVE_CLOSE, DIRECTIVE_OPEN, DirectiveState, PAYLOAD_CLOSE, PAYLOAD_OPEN, Segment,
    classify, directive_state,
};
use canvas_core::message::ScopeKey;
use canvas_core::{CanvasError, Result};
use serde::Serialize;
use std::collections::{HashMap, VecDeque};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, strum::Display)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
#[strum(serialize_all = "SCREAMING_SNAKE_CASE")]
pub enum StreamState {
    Open,
    Finalizing,
    Closed,
    Aborted,
}

impl StreamState {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Closed | Self::Aborted)
    }
}

/// Renderer-facing snapshot of an in-flight stream.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LiveStream {
    pub session_id: String,
    pub scope: ScopeKey,
    pub state: StreamState,
    pub buffer: String,
    pub segments: Vec<Segment>,
    pub directive_state: DirectiveState,
    /// Every distinct directive state the buffer has passed through, including
    /// states crossed inside a single chunk.
    pub directive_history: Vec<DirectiveState>,
    /// Durable id announced by the producer, once known.
    pub message_id: Option<String>,
}

/// Accumulated output of a stream that reached `Closed`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FinalizedStream {
    pub session_id: String,
    pub message_id: String,
    pub scope: ScopeKey,
    pub content: String,
}

#[derive(Debug)]
struct StreamSession {
    live: LiveStream,
}

impl StreamSession {
    fn new(session_id: &str, scope: ScopeKey) -> Self {
        Self {
            live: LiveStream {
                session_id: session_id.to_string(),
                scope,
                state: StreamState::Open,
                buffer: String::new(),
                segments: Vec::new(),
                directive_state: DirectiveState::None,
                directive_history: vec![DirectiveState::None],
                message_id: None,
            },
        }
    }

    fn append(&mut self, text: &str) {
        let live = &mut self.live;
        let previous_len = live.buffer.len();
        live.buffer.push_str(text);

        // Re-evaluate at every marker that ended inside the new text, so a chunk
        // carrying several markers still records each intermediate state.
        let mut checkpoints: Vec<usize> = [DIRECTIVE_OPEN, PAYLOAD_OPEN, PAYLOAD_CLOSE, DIRECTIVE_CLOSE]
            .iter()
            .flat_map(|marker| {
                live.buffer
                    .match_indices(marker)
                    .map(move |(start, _)| start + marker.len())
            })
            .filter(|end| *end > previous_len)
            .collect();
        checkpoints.sort_unstable();
        checkpoints.push(live.buffer.len());

        for end in checkpoints {
            let state = directive_state(&live.buffer[..end]);
            if live.directive_history.last() != Some(&state) {
                live.directive_history.push(state);
            }
        }

        live.directive_state = directive_state(&live.buffer);
        live.segments = classify(&live.buffer);
    }
}

/// Tracks every stream session of one conversation.
#[derive(Debug)]
pub struct StreamSessionTracker {
    sessions: HashMap<String, StreamSession>,
    terminal: HashMap<String, StreamState>,
    terminal_order: VecDeque<String>,
    retained_terminal: usize,
}

impl StreamSessionTracker {
    pub fn new(config: &StreamConfig) -> Self {
        Self {
            sessions: HashMap::new(),
            terminal: HashMap::new(),
            terminal_order: VecDeque::new(),
            retained_terminal: config.retained_terminal_sessions.max(1),
        }
    }

    /// Creates a session in `Open`.
    ///
    /// # Errors
    ///
    /// Returns `InvalidState` if the id is in use or belongs to a recently
    /// finished session.
    pub fn open(&mut self, session_id: &str, scope: ScopeKey) -> Result<LiveStream> {
        if let Some(state) = self.state(session_id) {
            return Err(CanvasError::invalid_state(format!(
                "stream session '{}' already exists ({})",
                session_id, state
            )));
        }
        let session = StreamSession::new(session_id, scope);
        let live = session.live.clone();
        self.sessions.insert(session_id.to_string(), session);
        tracing::debug!("[StreamSessionTracker] opened '{}'", session_id);
        Ok(live)
    }

    /// Appends a chunk and returns the refreshed live view.
    ///
    /// # Errors
    ///
    /// Returns `NotFound` for an unknown session and `InvalidState` once the
    /// session has left `Open`.
    pub fn append_chunk(&mut self, session_id: &str, text: &str) -> Result<LiveStream> {
        let session = self.open_session(session_id)?;
        let before = session.live.directive_state;
        session.append(text);

        let live = &session.live;
        if live.directive_state == DirectiveState::Malformed && before != DirectiveState::Malformed {
            tracing::warn!(
                "[StreamSessionTracker] malformed directive in stream '{}'",
                session_id
            );
        }
        Ok(live.clone())
    }

    /// Moves the session to `Finalizing`; no further chunks are accepted.
    pub fn begin_finalizing(&mut self, session_id: &str, message_id: &str) -> Result<LiveStream> {
        let session = self.open_session(session_id)?;
        session.live.state = StreamState::Finalizing;
        session.live.message_id = Some(message_id.to_string());
        Ok(session.live.clone())
    }

    /// Closes the session and hands back its buffer.
    ///
    /// Accepts a session in `Open` or `Finalizing`.
    pub fn finalize(&mut self, session_id: &str, message_id: &str) -> Result<FinalizedStream> {
        self.ensure_active(session_id)?;
        let Some(session) = self.sessions.remove(session_id) else {
            return Err(CanvasError::not_found("StreamSession", session_id));
        };
        self.remember_terminal(session_id, StreamState::Closed);

        let live = session.live;
        if let Some(announced) = live.message_id.as_deref().filter(|id| *id != message_id) {
            tracing::warn!(
                "[StreamSessionTracker] '{}' announced '{}' but finalized as '{}'",
                session_id,
                announced,
                message_id
            );
        }
        tracing::debug!(
            "[StreamSessionTracker] closed '{}' as '{}' ({} bytes)",
            session_id,
            message_id,
            live.buffer.len()
        );
        Ok(FinalizedStream {
            session_id: live.session_id,
            message_id: message_id.to_string(),
            scope: live.scope,
            content: live.buffer,
        })
    }

    /// Aborts the session and discards its buffer.
    ///
    /// Aborting an already aborted session is a no-op.
    pub fn abort(&mut self, session_id: &str, reason: &str) -> Result<()> {
        if self.terminal.get(session_id) == Some(&StreamState::Aborted) {
            return Ok(());
        }
        self.ensure_active(session_id)?;
        self.sessions.remove(session_id);
        self.remember_terminal(session_id, StreamState::Aborted);
        tracing::info!("[StreamSessionTracker] aborted '{}': {}", session_id, reason);
        Ok(())
    }

    pub fn state(&self, session_id: &str) -> Option<StreamState> {
        self.sessions
            .get(session_id)
            .map(|s| s.live.state)
            .or_else(|| self.terminal.get(session_id).copied())
    }

    pub fn live(&self, session_id: &str) -> Option<&LiveStream> {
        self.sessions.get(session_id).map(|s| &s.live)
    }

    /// Snapshots of every session that has not reached a terminal state.
    pub fn live_streams(&self) -> Vec<LiveStream> {
        let mut streams: Vec<LiveStream> = self.sessions.values().map(|s| s.live.clone()).collect();
        streams.sort_by(|a, b| a.session_id.cmp(&b.session_id));
        streams
    }

    pub fn active_count(&self) -> usize {
        self.sessions.len()
    }

    fn open_session(&mut self, session_id: &str) -> Result<&mut StreamSession> {
        match self.state(session_id) {
            Some(StreamState::Open) => {}
            Some(state) => {
                return Err(CanvasError::invalid_state(format!(
                    "stream session '{}' is {}, not accepting chunks",
                    session_id, state
                )));
            }
            None => return Err(CanvasError::not_found("StreamSession", session_id)),
        }
        self.sessions
            .get_mut(session_id)
            .ok_or_else(|| CanvasError::not_found("StreamSession", session_id))
    }

    fn ensure_active(&self, session_id: &str) -> Result<()> {
        match self.state(session_id) {
            Some(StreamState::Open | StreamState::Finalizing) => Ok(()),
            Some(state) => Err(CanvasError::invalid_state(format!(
                "stream session '{}' is already {}",
                session_id, state
            ))),
            None => Err(CanvasError::not_found("StreamSession", session_id)),
        }
    }

    fn remember_terminal(&mut self, session_id: &str, state: StreamState) {
        if self.terminal.insert(session_id.to_string(), state).is_none() {
            self.terminal_order.push_back(session_id.to_string());
        }
        while self.terminal_order.len() > self.retained_terminal {
            if let Some(evicted) = self.terminal_order.pop_front() {
                self.terminal.remove(&evicted);
            }
        }
    }
}
