//! Declared interface to the chat engine.
//!
//! The engine itself is an external collaborator: it accepts JSON commands
//! on an input queue and emits JSON responses and events on an output
//! queue. This module pins down those two queues and provides a scripted
//! stand-in for tests.

use tokio::sync::mpsc;
use tracing::warn;

use tether_proto::{ChatCommand, ChatResponse};

use crate::errors::SatelliteError;

/// Depth of both engine queues.
pub const ENGINE_QUEUE_DEPTH: usize = 64;

/// A command on its way into the engine, tagged for reply correlation.
#[derive(Clone, Debug)]
pub struct EngineCommand {
    pub corr_id: u64,
    pub cmd: ChatCommand,
}

/// What comes back out of the engine.
#[derive(Clone, Debug)]
pub enum EngineOutput {
    /// Answer to a submitted command.
    Reply { corr_id: u64, resp: ChatResponse },
    /// Spontaneous event.
    Event { resp: ChatResponse },
}

/// Sending half of the engine input queue.
#[derive(Clone)]
pub struct EngineHandle {
    tx: mpsc::Sender<EngineCommand>,
}

impl EngineHandle {
    /// Queue a command for the engine.
    ///
    /// Fails as a broken channel when the engine has gone away; the session
    /// above decides whether that is fatal.
    pub async fn submit(&self, corr_id: u64, cmd: ChatCommand) -> Result<(), SatelliteError> {
        self.tx
            .send(EngineCommand { corr_id, cmd })
            .await
            .map_err(|_| SatelliteError::ChannelBroken)
    }
}

/// Create the engine input queue.
pub fn engine_channel(depth: usize) -> (EngineHandle, mpsc::Receiver<EngineCommand>) {
    let (tx, rx) = mpsc::channel(depth);
    (EngineHandle { tx }, rx)
}

/// Scripted engine for tests: answers every command through a closure and
/// lets the test inject spontaneous events.
pub struct ScriptedEngine {
    output_tx: mpsc::Sender<EngineOutput>,
}

impl ScriptedEngine {
    /// Spawn the engine task. The closure produces the reply for each
    /// submitted command.
    pub fn spawn<F>(
        mut commands: mpsc::Receiver<EngineCommand>,
        output_tx: mpsc::Sender<EngineOutput>,
        mut respond: F,
    ) -> Self
    where
        F: FnMut(&ChatCommand) -> ChatResponse + Send + 'static,
    {
        let tx = output_tx.clone();
        tokio::spawn(async move {
            while let Some(EngineCommand { corr_id, cmd }) = commands.recv().await {
                let resp = respond(&cmd);
                if tx.send(EngineOutput::Reply { corr_id, resp }).await.is_err() {
                    warn!("engine output queue closed, stopping scripted engine");
                    break;
                }
            }
        });
        Self { output_tx }
    }

    /// Emit a spontaneous event, as the real engine does for incoming
    /// messages, receipts and the like.
    pub async fn emit_event(&self, resp: ChatResponse) {
        let _ = self.output_tx.send(EngineOutput::Event { resp }).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn scripted_engine_replies_with_matching_corr_id() {
        let (handle, cmd_rx) = engine_channel(ENGINE_QUEUE_DEPTH);
        let (out_tx, mut out_rx) = mpsc::channel(ENGINE_QUEUE_DEPTH);
        let _engine = ScriptedEngine::spawn(cmd_rx, out_tx, |cmd| {
            ChatResponse::tagged(&format!("ok:{}", cmd.tag().unwrap_or("?")))
        });

        handle.submit(9, ChatCommand::tagged("apiSendMessage")).await.unwrap();

        match out_rx.recv().await.unwrap() {
            EngineOutput::Reply { corr_id, resp } => {
                assert_eq!(corr_id, 9);
                assert_eq!(resp.tag(), Some("ok:apiSendMessage"));
            }
            other => panic!("unexpected output: {other:?}"),
        }
    }

    #[tokio::test]
    async fn events_flow_alongside_replies() {
        let (_handle, cmd_rx) = engine_channel(ENGINE_QUEUE_DEPTH);
        let (out_tx, mut out_rx) = mpsc::channel(ENGINE_QUEUE_DEPTH);
        let engine = ScriptedEngine::spawn(cmd_rx, out_tx, |_| ChatResponse::tagged("ok"));

        engine.emit_event(ChatResponse::tagged("newChatItem")).await;
        match out_rx.recv().await.unwrap() {
            EngineOutput::Event { resp } => assert_eq!(resp.tag(), Some("newChatItem")),
            other => panic!("unexpected output: {other:?}"),
        }
    }

    #[tokio::test]
    async fn submit_after_engine_shutdown_is_channel_broken() {
        let (handle, cmd_rx) = engine_channel(4);
        drop(cmd_rx);
        let err = handle.submit(1, ChatCommand::tagged("apiSendMessage")).await.unwrap_err();
        assert!(matches!(err, SatelliteError::ChannelBroken));
    }
}
