//! Host-side command router and response mirror.
//!
//! Every `cmd` frame from the satellite is classified against a closed
//! denylist: destructive categories are answered with an error reply and
//! never reach the engine; everything else is injected into the engine's
//! input queue under the frame's correlation id. Replies and events coming
//! back out of the engine are mirrored through the active channel, or into
//! the suspension buffer while the satellite is away.

use std::collections::HashSet;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use tracing::{debug, warn};

use tether_proto::{ChatCommand, ChatResponse, Frame};

use crate::engine::{EngineHandle, EngineOutput};
use crate::errors::SatelliteError;
use crate::session::SessionPhase;

/// Command tags that control the engine process itself.
pub const PROCESS_LIFECYCLE: &[&str] = &["apiStopChat", "apiSuspendChat", "apiActivateChat"];

/// Storage administration, including raw SQL access.
pub const STORAGE_ADMIN: &[&str] = &[
    "apiExportArchive",
    "apiImportArchive",
    "apiDeleteStorage",
    "apiStorageEncryption",
    "apiExecChatStoreSql",
    "apiExecAgentStoreSql",
    "apiSlowSqlQueries",
];

/// Credential changes that would orphan the satellite itself.
pub const USER_CREDENTIALS: &[&str] = &["apiDeleteUser", "apiHideUser", "apiUnhideUser"];

/// Network reconfiguration.
pub const NETWORK_CONFIG: &[&str] = &["apiSetNetworkConfig", "reconnectAllServers"];

/// Push-notification token management.
pub const TOKEN_MANAGEMENT: &[&str] = &["apiRegisterToken", "apiVerifyToken", "apiDeleteToken"];

/// Commands whose effect must also land on the host's own chat view.
pub const MIRRORED_LOCALLY: &[&str] = &["apiChatRead", "apiChatItemReaction"];

/// Router decision for one command tag. Total: every tag maps to exactly
/// one variant.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Disposition {
    Forward,
    Denied { category: &'static str },
}

/// Classify a command tag. Tags outside the denied categories forward;
/// whether the engine understands them is the engine's concern.
pub fn classify(tag: &str) -> Disposition {
    for (category, tags) in [
        ("process-lifecycle", PROCESS_LIFECYCLE),
        ("storage-admin", STORAGE_ADMIN),
        ("user-credentials", USER_CREDENTIALS),
        ("network-config", NETWORK_CONFIG),
        ("token-management", TOKEN_MANAGEMENT),
    ] {
        if tags.contains(&tag) {
            return Disposition::Denied { category };
        }
    }
    Disposition::Forward
}

/// Applies satellite-driven state changes to the host's own chat view.
#[async_trait]
pub trait HostMirror: Send + Sync {
    async fn apply(&self, cmd: &ChatCommand);
}

/// Atomic counters over router activity.
#[derive(Debug, Default)]
pub struct RouterStats {
    pub forwarded: AtomicU64,
    pub denied: AtomicU64,
    pub mirrored_local: AtomicU64,
    pub replies: AtomicU64,
    pub events: AtomicU64,
    pub buffered_events: AtomicU64,
    pub dropped_replies: AtomicU64,
}

/// Point-in-time copy of [`RouterStats`].
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct RouterStatsSnapshot {
    pub forwarded: u64,
    pub denied: u64,
    pub mirrored_local: u64,
    pub replies: u64,
    pub events: u64,
    pub buffered_events: u64,
    pub dropped_replies: u64,
}

impl RouterStats {
    pub fn snapshot(&self) -> RouterStatsSnapshot {
        RouterStatsSnapshot {
            forwarded: self.forwarded.load(Ordering::Relaxed),
            denied: self.denied.load(Ordering::Relaxed),
            mirrored_local: self.mirrored_local.load(Ordering::Relaxed),
            replies: self.replies.load(Ordering::Relaxed),
            events: self.events.load(Ordering::Relaxed),
            buffered_events: self.buffered_events.load(Ordering::Relaxed),
            dropped_replies: self.dropped_replies.load(Ordering::Relaxed),
        }
    }
}

/// What to do with one piece of engine output.
#[derive(Clone, Debug, PartialEq)]
pub enum OutputAction {
    /// Mirror through the active channel.
    Send(Frame),
    /// Session suspended: hold the event for the reconnect flush.
    Buffer(ChatResponse),
    /// Not for the satellite (filtered tag, foreign reply, dead session).
    Ignore,
}

/// Host-side router state for one session.
pub struct HostRouter {
    engine: EngineHandle,
    mirror: Option<Arc<dyn HostMirror>>,
    /// Correlation ids injected on behalf of the satellite. Engine replies
    /// to the host's own UI commands are recognized by their absence here.
    pending_remote: HashSet<u64>,
    /// Response tags that never cross the channel (local log sinks etc.).
    unmirrored_tags: HashSet<String>,
    stats: Arc<RouterStats>,
}

impl HostRouter {
    pub fn new(engine: EngineHandle) -> Self {
        Self {
            engine,
            mirror: None,
            pending_remote: HashSet::new(),
            unmirrored_tags: HashSet::new(),
            stats: Arc::new(RouterStats::default()),
        }
    }

    pub fn with_mirror(mut self, mirror: Arc<dyn HostMirror>) -> Self {
        self.mirror = Some(mirror);
        self
    }

    /// Exclude a response tag from channel mirroring.
    pub fn suppress_tag(&mut self, tag: &str) {
        self.unmirrored_tags.insert(tag.to_string());
    }

    pub fn stats(&self) -> Arc<RouterStats> {
        Arc::clone(&self.stats)
    }

    pub fn pending_remote(&self) -> usize {
        self.pending_remote.len()
    }

    /// Handle a satellite `cmd` frame.
    ///
    /// Returns an immediate reply frame for denied or refused commands;
    /// forwarded commands answer later through [`Self::route_output`].
    pub async fn handle_cmd(
        &mut self,
        phase: SessionPhase,
        id: u64,
        cmd: ChatCommand,
    ) -> Result<Option<Frame>, SatelliteError> {
        if phase != SessionPhase::Active {
            debug!(id, ?phase, "command refused outside Active");
            return Ok(Some(Frame::Reply {
                id,
                resp: ChatResponse::session_unavailable("session is not active").0,
            }));
        }

        let Some(tag) = cmd.tag().map(str::to_string) else {
            self.stats.denied.fetch_add(1, Ordering::Relaxed);
            return Ok(Some(Frame::Reply {
                id,
                resp: ChatResponse::command_denied("", "untagged").0,
            }));
        };

        match classify(&tag) {
            Disposition::Denied { category } => {
                self.stats.denied.fetch_add(1, Ordering::Relaxed);
                warn!(id, tag, category, "satellite command denied");
                Ok(Some(Frame::Reply {
                    id,
                    resp: ChatResponse::command_denied(&tag, category).0,
                }))
            }
            Disposition::Forward => {
                if MIRRORED_LOCALLY.contains(&tag.as_str()) {
                    if let Some(mirror) = &self.mirror {
                        mirror.apply(&cmd).await;
                        self.stats.mirrored_local.fetch_add(1, Ordering::Relaxed);
                    }
                }
                self.pending_remote.insert(id);
                self.engine.submit(id, cmd).await?;
                self.stats.forwarded.fetch_add(1, Ordering::Relaxed);
                Ok(None)
            }
        }
    }

    /// Decide the fate of one piece of engine output given the session
    /// phase. Pure with respect to the channel, so the link task stays in
    /// charge of IO.
    pub fn route_output(&mut self, output: EngineOutput, phase: SessionPhase) -> OutputAction {
        match output {
            EngineOutput::Reply { corr_id, resp } => {
                if !self.pending_remote.remove(&corr_id) {
                    // Host-UI reply, not ours to mirror.
                    return OutputAction::Ignore;
                }
                match phase {
                    SessionPhase::Active => {
                        self.stats.replies.fetch_add(1, Ordering::Relaxed);
                        OutputAction::Send(Frame::Reply { id: corr_id, resp: resp.0 })
                    }
                    _ => {
                        // The satellite's pending entry resolves by timeout;
                        // replaying a stale reply after resume would violate
                        // single-reply correlation.
                        self.stats.dropped_replies.fetch_add(1, Ordering::Relaxed);
                        OutputAction::Ignore
                    }
                }
            }
            EngineOutput::Event { resp } => {
                if let Some(tag) = resp.tag() {
                    if self.unmirrored_tags.contains(tag) {
                        return OutputAction::Ignore;
                    }
                }
                match phase {
                    SessionPhase::Active => {
                        self.stats.events.fetch_add(1, Ordering::Relaxed);
                        OutputAction::Send(Frame::Event { resp: resp.0 })
                    }
                    SessionPhase::Suspended => {
                        self.stats.buffered_events.fetch_add(1, Ordering::Relaxed);
                        OutputAction::Buffer(resp)
                    }
                    _ => OutputAction::Ignore,
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::engine_channel;
    use parking_lot::Mutex;

    struct RecordingMirror {
        seen: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl HostMirror for RecordingMirror {
        async fn apply(&self, cmd: &ChatCommand) {
            self.seen.lock().push(cmd.tag().unwrap_or("?").to_string());
        }
    }

    fn router() -> (HostRouter, tokio::sync::mpsc::Receiver<crate::engine::EngineCommand>) {
        let (handle, rx) = engine_channel(16);
        (HostRouter::new(handle), rx)
    }

    #[test]
    fn every_denied_tag_is_denied_and_the_rest_forward() {
        for tags in [
            PROCESS_LIFECYCLE,
            STORAGE_ADMIN,
            USER_CREDENTIALS,
            NETWORK_CONFIG,
            TOKEN_MANAGEMENT,
        ] {
            for tag in tags {
                assert!(matches!(classify(tag), Disposition::Denied { .. }), "{tag}");
            }
        }
        for tag in ["apiSendMessage", "apiChatRead", "apiCreateChatItem", "unknownFutureCmd", ""] {
            assert_eq!(classify(tag), Disposition::Forward, "{tag}");
        }
    }

    #[tokio::test]
    async fn denied_command_gets_an_error_reply_and_never_reaches_the_engine() {
        let (mut router, mut engine_rx) = router();
        let frame = router
            .handle_cmd(SessionPhase::Active, 1, ChatCommand::tagged("apiDeleteStorage"))
            .await
            .unwrap()
            .expect("immediate reply");

        match frame {
            Frame::Reply { id, resp } => {
                assert_eq!(id, 1);
                assert_eq!(resp["error"]["type"], "deniedCommand");
                assert_eq!(resp["error"]["category"], "storage-admin");
            }
            other => panic!("unexpected frame: {other:?}"),
        }
        assert!(engine_rx.try_recv().is_err());
        assert_eq!(router.stats().snapshot().denied, 1);
    }

    #[tokio::test]
    async fn forwarded_command_reaches_the_engine_under_its_corr_id() {
        let (mut router, mut engine_rx) = router();
        let none = router
            .handle_cmd(SessionPhase::Active, 42, ChatCommand::tagged("apiSendMessage"))
            .await
            .unwrap();
        assert!(none.is_none());

        let injected = engine_rx.try_recv().unwrap();
        assert_eq!(injected.corr_id, 42);
        assert_eq!(injected.cmd.tag(), Some("apiSendMessage"));
        assert_eq!(router.pending_remote(), 1);
    }

    #[tokio::test]
    async fn chat_read_is_applied_to_the_host_view_too() {
        let (handle, mut engine_rx) = engine_channel(16);
        let mirror = Arc::new(RecordingMirror { seen: Mutex::new(Vec::new()) });
        let mut router = HostRouter::new(handle).with_mirror(mirror.clone());

        router
            .handle_cmd(SessionPhase::Active, 1, ChatCommand::tagged("apiChatRead"))
            .await
            .unwrap();
        router
            .handle_cmd(SessionPhase::Active, 2, ChatCommand::tagged("apiSendMessage"))
            .await
            .unwrap();

        assert_eq!(*mirror.seen.lock(), vec!["apiChatRead".to_string()]);
        assert_eq!(engine_rx.try_recv().unwrap().corr_id, 1);
        assert_eq!(engine_rx.try_recv().unwrap().corr_id, 2);
    }

    #[tokio::test]
    async fn commands_refused_while_suspended() {
        let (mut router, mut engine_rx) = router();
        let frame = router
            .handle_cmd(SessionPhase::Suspended, 5, ChatCommand::tagged("apiSendMessage"))
            .await
            .unwrap()
            .expect("immediate refusal");
        match frame {
            Frame::Reply { id, resp } => {
                assert_eq!(id, 5);
                assert_eq!(resp["error"]["type"], "sessionUnavailable");
            }
            other => panic!("unexpected frame: {other:?}"),
        }
        assert!(engine_rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn untagged_command_is_denied() {
        let (mut router, _engine_rx) = router();
        let frame = router
            .handle_cmd(
                SessionPhase::Active,
                3,
                ChatCommand(serde_json::json!({"no": "type"})),
            )
            .await
            .unwrap()
            .expect("immediate reply");
        assert!(matches!(frame, Frame::Reply { id: 3, .. }));
    }

    #[tokio::test]
    async fn remote_replies_are_mirrored_and_host_replies_ignored() {
        let (mut router, _engine_rx) = router();
        router
            .handle_cmd(SessionPhase::Active, 7, ChatCommand::tagged("apiSendMessage"))
            .await
            .unwrap();

        let remote = router.route_output(
            EngineOutput::Reply { corr_id: 7, resp: ChatResponse::tagged("messageSent") },
            SessionPhase::Active,
        );
        assert!(matches!(remote, OutputAction::Send(Frame::Reply { id: 7, .. })));

        let foreign = router.route_output(
            EngineOutput::Reply { corr_id: 100, resp: ChatResponse::tagged("messageSent") },
            SessionPhase::Active,
        );
        assert_eq!(foreign, OutputAction::Ignore);
    }

    #[tokio::test]
    async fn each_corr_id_is_answered_at_most_once() {
        let (mut router, _engine_rx) = router();
        router
            .handle_cmd(SessionPhase::Active, 8, ChatCommand::tagged("apiSendMessage"))
            .await
            .unwrap();

        let first = router.route_output(
            EngineOutput::Reply { corr_id: 8, resp: ChatResponse::tagged("ok") },
            SessionPhase::Active,
        );
        assert!(matches!(first, OutputAction::Send(_)));

        let second = router.route_output(
            EngineOutput::Reply { corr_id: 8, resp: ChatResponse::tagged("ok") },
            SessionPhase::Active,
        );
        assert_eq!(second, OutputAction::Ignore);
    }

    #[tokio::test]
    async fn events_buffer_while_suspended_and_send_while_active() {
        let (mut router, _engine_rx) = router();

        let live = router.route_output(
            EngineOutput::Event { resp: ChatResponse::tagged("newChatItem") },
            SessionPhase::Active,
        );
        assert!(matches!(live, OutputAction::Send(Frame::Event { .. })));

        let held = router.route_output(
            EngineOutput::Event { resp: ChatResponse::tagged("newChatItem") },
            SessionPhase::Suspended,
        );
        assert!(matches!(held, OutputAction::Buffer(_)));

        let dead = router.route_output(
            EngineOutput::Event { resp: ChatResponse::tagged("newChatItem") },
            SessionPhase::Disposed,
        );
        assert_eq!(dead, OutputAction::Ignore);
    }

    #[tokio::test]
    async fn stale_replies_are_dropped_after_suspension() {
        let (mut router, _engine_rx) = router();
        router
            .handle_cmd(SessionPhase::Active, 9, ChatCommand::tagged("apiSendMessage"))
            .await
            .unwrap();

        let action = router.route_output(
            EngineOutput::Reply { corr_id: 9, resp: ChatResponse::tagged("ok") },
            SessionPhase::Suspended,
        );
        assert_eq!(action, OutputAction::Ignore);
        assert_eq!(router.stats().snapshot().dropped_replies, 1);
    }

    #[tokio::test]
    async fn suppressed_tags_never_cross_the_channel() {
        let (mut router, _engine_rx) = router();
        router.suppress_tag("terminalLog");

        let action = router.route_output(
            EngineOutput::Event { resp: ChatResponse::tagged("terminalLog") },
            SessionPhase::Active,
        );
        assert_eq!(action, OutputAction::Ignore);
    }
}
