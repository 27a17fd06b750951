//! Satellite-side session bookkeeping.
//!
//! UI commands get a correlation id and a oneshot the caller awaits; the
//! link task sends the frame when the session is active and queues it (in
//! a bounded FIFO) while suspended. Incoming replies resolve their pending
//! entry; orphans are logged and dropped. Dispose fails everything still
//! outstanding with `SessionDisposed`.

use std::collections::{HashMap, VecDeque};
use std::time::Duration;

use tokio::sync::oneshot;
use tracing::{debug, warn};

use tether_proto::{ChatCommand, ChatResponse, Frame};

use crate::errors::SatelliteError;
use crate::session::{SessionPhase, SessionState, TransitionError};

/// Default cap on commands held while suspended.
pub const COMMAND_QUEUE_CAPACITY: usize = 64;

/// Default time a pending command waits for its reply.
pub const COMMAND_TIMEOUT: Duration = Duration::from_secs(30);

type ReplySender = oneshot::Sender<Result<ChatResponse, SatelliteError>>;

/// Receiver half handed to the UI caller.
pub type ReplyFuture = oneshot::Receiver<Result<ChatResponse, SatelliteError>>;

/// What the link task should do with a freshly submitted command.
#[derive(Debug, PartialEq)]
pub enum SubmitAction {
    /// Session active: put this frame on the channel now.
    Send(Frame),
    /// Session suspended or still pairing: held for the resume flush.
    Queued,
}

/// Per-session satellite state: phase machine, pending replies and the
/// suspension command queue.
pub struct SatelliteSession {
    state: SessionState,
    next_id: u64,
    pending: HashMap<u64, ReplySender>,
    queue: VecDeque<(u64, ChatCommand)>,
    queue_capacity: usize,
    orphan_replies: u64,
}

impl SatelliteSession {
    pub fn new() -> Self {
        Self::with_queue_capacity(COMMAND_QUEUE_CAPACITY)
    }

    pub fn with_queue_capacity(queue_capacity: usize) -> Self {
        Self {
            state: SessionState::new(),
            next_id: 1,
            pending: HashMap::new(),
            queue: VecDeque::new(),
            queue_capacity,
            orphan_replies: 0,
        }
    }

    pub fn phase(&self) -> SessionPhase {
        self.state.phase()
    }

    pub fn state_mut(&mut self) -> &mut SessionState {
        &mut self.state
    }

    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }

    pub fn queued_count(&self) -> usize {
        self.queue.len()
    }

    /// Orphan replies seen so far (reply id with no pending entry).
    pub fn orphan_replies(&self) -> u64 {
        self.orphan_replies
    }

    /// Register a UI command. Returns the correlation id, the reply future
    /// and what the link task must do with the frame.
    pub fn submit(
        &mut self,
        cmd: ChatCommand,
    ) -> Result<(u64, ReplyFuture, SubmitAction), SatelliteError> {
        match self.state.phase() {
            SessionPhase::Disposed => return Err(SatelliteError::SessionDisposed),
            SessionPhase::Idle => return Err(SatelliteError::SessionSuspended),
            _ => {}
        }

        let id = self.next_id;
        self.next_id += 1;
        let (tx, rx) = oneshot::channel();

        if self.state.phase() == SessionPhase::Active {
            self.pending.insert(id, tx);
            let frame = Frame::Cmd { id, cmd: cmd.0 };
            Ok((id, rx, SubmitAction::Send(frame)))
        } else {
            if self.queue.len() >= self.queue_capacity {
                return Err(SatelliteError::SessionSuspended);
            }
            self.pending.insert(id, tx);
            self.queue.push_back((id, cmd));
            debug!(id, queued = self.queue.len(), "command queued while suspended");
            Ok((id, rx, SubmitAction::Queued))
        }
    }

    /// Resolve a pending command with the host's reply.
    pub fn take_reply(&mut self, id: u64, resp: ChatResponse) {
        match self.pending.remove(&id) {
            Some(tx) => {
                // A closed receiver means the caller timed out already.
                if tx.send(Ok(resp)).is_err() {
                    debug!(id, "reply arrived after caller gave up");
                }
            }
            None => {
                self.orphan_replies += 1;
                warn!(id, "orphan reply dropped");
            }
        }
    }

    /// Resolve a pending command with a local failure (timeout, dispose).
    pub fn fail_pending(&mut self, id: u64, err: SatelliteError) {
        if let Some(tx) = self.pending.remove(&id) {
            let _ = tx.send(Err(err));
        }
        self.queue.retain(|(queued_id, _)| *queued_id != id);
    }

    /// On resume, hand back every queued command as frames in insertion
    /// order for the link task to send.
    pub fn flush_queue(&mut self) -> Vec<Frame> {
        self.queue
            .drain(..)
            .map(|(id, cmd)| Frame::Cmd { id, cmd: cmd.0 })
            .collect()
    }

    /// Suspend on takeover or transport loss.
    pub fn suspend(&mut self) -> Result<(), TransitionError> {
        self.state.channel_broken()
    }

    /// Resume after reconnect; caller sends the frames returned by
    /// [`Self::flush_queue`].
    pub fn resume(&mut self) -> Result<(), TransitionError> {
        self.state.reconnect()
    }

    /// Dispose the session, failing all queued and in-flight commands.
    /// Idempotent.
    pub fn dispose(&mut self) {
        if !self.state.dispose() {
            return;
        }
        for (_, cmd) in self.queue.drain(..) {
            debug!(tag = cmd.tag().unwrap_or("?"), "queued command failed by dispose");
        }
        for (_, tx) in self.pending.drain() {
            let _ = tx.send(Err(SatelliteError::SessionDisposed));
        }
    }
}

impl Default for SatelliteSession {
    fn default() -> Self {
        Self::new()
    }
}
