//! Session phase machine and suspension buffer.
//!
//! The same machine runs on both roles. Every transition is named after
//! the operation that causes it; anything else is an error, except dispose,
//! which is legal from everywhere and idempotent.
//!
//! While a session sits in `Suspended` the host keeps feeding chat-engine
//! events into a bounded drop-oldest buffer, so a quick reconnect resumes
//! delivery without loss for small outages.

use std::collections::VecDeque;

use thiserror::Error;

use tether_proto::ChatResponse;

use crate::errors::SatelliteError;

/// Default capacity of the suspension event buffer.
pub const EVENT_BUFFER_CAPACITY: usize = 256;

#[derive(Debug, Error)]
#[error("cannot {op} a session in {phase:?}")]
pub struct TransitionError {
    pub phase: SessionPhase,
    pub op: &'static str,
}

impl From<TransitionError> for SatelliteError {
    fn from(e: TransitionError) -> Self {
        match e.phase {
            SessionPhase::Disposed => SatelliteError::SessionDisposed,
            SessionPhase::Suspended => SatelliteError::SessionSuspended,
            _ => SatelliteError::InvalidTransition(e.to_string()),
        }
    }
}

/// Lifecycle phase of a session.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SessionPhase {
    Idle,
    Pairing,
    Active,
    Suspended,
    Disposed,
}

/// The phase machine itself. Owns nothing but the phase; channel handles
/// and buffers live with the role-specific session objects.
#[derive(Clone, Copy, Debug)]
pub struct SessionState {
    phase: SessionPhase,
}

impl SessionState {
    pub fn new() -> Self {
        Self { phase: SessionPhase::Idle }
    }

    pub fn phase(&self) -> SessionPhase {
        self.phase
    }

    pub fn is_live(&self) -> bool {
        matches!(self.phase, SessionPhase::Active | SessionPhase::Suspended)
    }

    fn transition(
        &mut self,
        op: &'static str,
        from: &[SessionPhase],
        to: SessionPhase,
    ) -> Result<(), TransitionError> {
        if from.contains(&self.phase) {
            self.phase = to;
            Ok(())
        } else {
            Err(TransitionError { phase: self.phase, op })
        }
    }

    /// Idle → Pairing, on the satellite's identity request.
    pub fn request_identity(&mut self) -> Result<(), TransitionError> {
        self.transition("request identity on", &[SessionPhase::Idle], SessionPhase::Pairing)
    }

    /// Pairing → Active, on the host user's approval.
    pub fn identity_confirm(&mut self) -> Result<(), TransitionError> {
        self.transition("confirm", &[SessionPhase::Pairing], SessionPhase::Active)
    }

    /// Pairing → Idle, on the host user's refusal.
    pub fn identity_reject(&mut self) -> Result<(), TransitionError> {
        self.transition("reject", &[SessionPhase::Pairing], SessionPhase::Idle)
    }

    /// Active → Suspended, when the host UI takes the foreground.
    pub fn takeover(&mut self) -> Result<(), TransitionError> {
        self.transition("take over", &[SessionPhase::Active], SessionPhase::Suspended)
    }

    /// Active → Suspended, when the transport drops.
    pub fn channel_broken(&mut self) -> Result<(), TransitionError> {
        self.transition("break the channel of", &[SessionPhase::Active], SessionPhase::Suspended)
    }

    /// Suspended → Active, after reconnect or resume.
    pub fn reconnect(&mut self) -> Result<(), TransitionError> {
        self.transition("reconnect", &[SessionPhase::Suspended], SessionPhase::Active)
    }

    /// Any phase → Disposed. Returns whether anything changed; disposing a
    /// disposed session is a successful no-op.
    pub fn dispose(&mut self) -> bool {
        if self.phase == SessionPhase::Disposed {
            return false;
        }
        self.phase = SessionPhase::Disposed;
        true
    }
}

impl Default for SessionState {
    fn default() -> Self {
        Self::new()
    }
}

/// Bounded drop-oldest buffer of chat-engine events.
pub struct EventBuffer {
    buf: VecDeque<ChatResponse>,
    capacity: usize,
    dropped: u64,
}

impl EventBuffer {
    pub fn new(capacity: usize) -> Self {
        Self { buf: VecDeque::with_capacity(capacity.min(64)), capacity, dropped: 0 }
    }

    /// Append an event, evicting the oldest when full.
    pub fn push(&mut self, event: ChatResponse) {
        if self.buf.len() == self.capacity {
            self.buf.pop_front();
            self.dropped += 1;
        }
        self.buf.push_back(event);
    }

    /// Take every buffered event in arrival order.
    pub fn drain(&mut self) -> Vec<ChatResponse> {
        self.buf.drain(..).collect()
    }

    pub fn len(&self) -> usize {
        self.buf.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    /// Events evicted since creation.
    pub fn dropped(&self) -> u64 {
        self.dropped
    }
}

impl Default for EventBuffer {
    fn default() -> Self {
        Self::new(EVENT_BUFFER_CAPACITY)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn active() -> SessionState {
        let mut s = SessionState::new();
        s.request_identity().unwrap();
        s.identity_confirm().unwrap();
        s
    }

    #[test]
    fn happy_path_reaches_active() {
        let s = active();
        assert_eq!(s.phase(), SessionPhase::Active);
        assert!(s.is_live());
    }

    #[test]
    fn rejection_returns_to_idle() {
        let mut s = SessionState::new();
        s.request_identity().unwrap();
        s.identity_reject().unwrap();
        assert_eq!(s.phase(), SessionPhase::Idle);
        // The machine is reusable after rejection.
        s.request_identity().unwrap();
    }

    #[test]
    fn takeover_then_resume() {
        let mut s = active();
        s.takeover().unwrap();
        assert_eq!(s.phase(), SessionPhase::Suspended);
        s.reconnect().unwrap();
        assert_eq!(s.phase(), SessionPhase::Active);
    }

    #[test]
    fn broken_channel_suspends() {
        let mut s = active();
        s.channel_broken().unwrap();
        assert_eq!(s.phase(), SessionPhase::Suspended);
    }

    #[test]
    fn dispose_is_terminal_and_idempotent() {
        let mut s = active();
        assert!(s.dispose());
        assert!(!s.dispose());
        assert_eq!(s.phase(), SessionPhase::Disposed);

        assert!(s.request_identity().is_err());
        assert!(s.reconnect().is_err());
        assert!(s.takeover().is_err());
    }

    #[test]
    fn dispose_works_from_every_phase() {
        let setups: [fn(&mut SessionState); 4] = [
            |_| {},
            |s| s.request_identity().unwrap(),
            |s| {
                s.request_identity().unwrap();
                s.identity_confirm().unwrap();
            },
            |s| {
                s.request_identity().unwrap();
                s.identity_confirm().unwrap();
                s.takeover().unwrap();
            },
        ];
        for setup in setups {
            let mut s = SessionState::new();
            setup(&mut s);
            assert!(s.dispose());
            assert_eq!(s.phase(), SessionPhase::Disposed);
        }
    }

    #[test]
    fn illegal_transitions_name_the_phase() {
        let mut s = SessionState::new();
        let err = s.identity_confirm().unwrap_err();
        assert_eq!(err.phase, SessionPhase::Idle);

        let mut s = active();
        let err = s.reconnect().unwrap_err();
        assert_eq!(err.phase, SessionPhase::Active);
    }

    #[test]
    fn transition_errors_map_to_boundary_kinds() {
        let mut s = active();
        s.takeover().unwrap();
        let err: SatelliteError = s.takeover().unwrap_err().into();
        assert!(matches!(err, SatelliteError::SessionSuspended));

        s.dispose();
        let err: SatelliteError = s.reconnect().unwrap_err().into();
        assert!(matches!(err, SatelliteError::SessionDisposed));
    }

    #[test]
    fn event_buffer_preserves_order() {
        let mut buf = EventBuffer::new(8);
        for i in 0..5 {
            buf.push(ChatResponse::tagged(&format!("e{i}")));
        }
        let tags: Vec<_> = buf.drain().iter().map(|e| e.tag().unwrap().to_string()).collect();
        assert_eq!(tags, vec!["e0", "e1", "e2", "e3", "e4"]);
        assert!(buf.is_empty());
    }

    #[test]
    fn event_buffer_drops_oldest_when_full() {
        let mut buf = EventBuffer::new(3);
        for i in 0..5 {
            buf.push(ChatResponse::tagged(&format!("e{i}")));
        }
        assert_eq!(buf.dropped(), 2);
        let tags: Vec<_> = buf.drain().iter().map(|e| e.tag().unwrap().to_string()).collect();
        assert_eq!(tags, vec!["e2", "e3", "e4"]);
    }
}
