//! Live wiring between a secure channel and the session machinery.
//!
//! One task per transport owns the socket; everything stateful stays with
//! the controller (host) or the shared [`SatelliteSession`] (satellite),
//! reached through bounded queues so the transport reader never blocks on
//! the engine.

use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::{mpsc, Mutex};
use tokio::time::{interval, sleep, timeout, MissedTickBehavior};
use tracing::{debug, info, warn};

use tether_proto::{ChatCommand, ChatResponse, Frame, PairingMsg};
use tether_transport::{ChannelConfig, ChannelError, Keepalive, ReconnectPolicy, SecureChannel};

use crate::controller::SatelliteController;
use crate::errors::SatelliteError;
use crate::satellite::{SatelliteSession, SubmitAction, COMMAND_TIMEOUT};
use crate::session::SessionPhase;

/// Depth of the outbound frame queue between session logic and the socket.
pub const OUTBOUND_DEPTH: usize = 64;

/// Drive one host-side channel until it breaks or the session ends.
///
/// Returns `Ok(())` when the outage is ordinary (peer gone, bye, keepalive
/// lapse); the satellite is expected to reconnect. Fatal protocol errors
/// bubble up after the session has been suspended.
pub async fn run_host_link<S>(
    controller: SatelliteController,
    mut channel: SecureChannel<S>,
    sat_identity_id: u64,
    config: &ChannelConfig,
) -> Result<(), SatelliteError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let (out_tx, mut out_rx) = mpsc::channel(OUTBOUND_DEPTH);
    controller.attach_channel(sat_identity_id, out_tx).await?;

    let mut keepalive = Keepalive::new(config.ping_interval, config.missed_intervals, Instant::now());
    let mut ticker = interval(config.ping_interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        // Resolve the select first so the recv future releases the channel
        // before any branch writes to it.
        let step = tokio::select! {
            received = channel.recv() => Step::Received(received),
            outbound = out_rx.recv() => Step::Outbound(outbound),
            _ = ticker.tick() => Step::Tick,
        };

        match step {
            Step::Received(Ok(frame)) => {
                keepalive.on_rx(Instant::now());
                let ending = matches!(frame, Frame::Bye { .. });
                controller.handle_frame(frame).await?;
                if ending {
                    return Ok(());
                }
            }
            Step::Received(Err(e)) if e.is_fatal() => {
                warn!(error = %e, "host channel failed");
                controller.on_channel_broken().await;
                return Err(e.into());
            }
            Step::Received(Err(e)) => {
                debug!(error = %e, "host channel lost");
                controller.on_channel_broken().await;
                return Ok(());
            }
            Step::Outbound(Some(frame)) => {
                let ending = matches!(frame, Frame::Bye { .. });
                if let Err(e) = channel.send(&frame).await {
                    debug!(error = %e, "host channel send failed");
                    controller.on_channel_broken().await;
                    return if e.is_fatal() { Err(e.into()) } else { Ok(()) };
                }
                keepalive.on_tx(Instant::now());
                if ending {
                    return Ok(());
                }
            }
            // Controller dropped the outbound handle: session is gone.
            Step::Outbound(None) => {
                channel.close("session ended").await;
                return Ok(());
            }
            Step::Tick => {
                let now = Instant::now();
                if keepalive.broken(now) {
                    info!("keepalive lapsed, suspending session");
                    controller.on_channel_broken().await;
                    return Ok(());
                }
                if keepalive.ping_due(now) {
                    if channel.send(&Frame::Ping).await.is_err() {
                        controller.on_channel_broken().await;
                        return Ok(());
                    }
                    keepalive.on_tx(Instant::now());
                }
            }
        }
    }
}

/// One resolved iteration of a channel pump.
enum Step {
    Received(Result<Frame, ChannelError>),
    Outbound(Option<Frame>),
    Tick,
}

/// Events the satellite link surfaces to its local UI.
#[derive(Clone, Debug, PartialEq)]
pub enum SatelliteUiEvent {
    /// Chat-engine event mirrored from the host, presented as if a local
    /// engine emitted it.
    Engine(ChatResponse),
    IdentityRecorded { sat_identity_id: u64 },
    Confirmed { sat_identity_id: u64 },
    Rejected { sat_identity_id: u64 },
    TookOver,
    Resumed,
    Disposed,
}

/// UI-facing handle onto a running satellite link.
#[derive(Clone)]
pub struct SatelliteHandle {
    session: Arc<Mutex<SatelliteSession>>,
    out_tx: mpsc::Sender<Frame>,
    command_timeout: Duration,
}

impl SatelliteHandle {
    /// Issue a command and await its single reply.
    ///
    /// Active sessions send immediately; suspended ones queue (bounded)
    /// for the resume flush. Exactly one of reply or timeout resolves the
    /// pending entry.
    pub async fn request(&self, cmd: ChatCommand) -> Result<ChatResponse, SatelliteError> {
        let (id, reply, action) = self.session.lock().await.submit(cmd)?;
        if let SubmitAction::Send(frame) = action {
            if self.out_tx.send(frame).await.is_err() {
                self.session.lock().await.fail_pending(id, SatelliteError::ChannelBroken);
                return Err(SatelliteError::ChannelBroken);
            }
        }
        match timeout(self.command_timeout, reply).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(SatelliteError::SessionDisposed),
            Err(_) => {
                self.session.lock().await.fail_pending(id, SatelliteError::Timeout);
                Err(SatelliteError::Timeout)
            }
        }
    }

    /// Walk away from the binding: tell the host, then dispose locally.
    pub async fn terminate(&self, sat_identity_id: u64) {
        let _ = self
            .out_tx
            .send(Frame::Cmd {
                id: 0,
                cmd: PairingMsg::SatTerminateIdentity { sat_identity_id }.to_value(),
            })
            .await;
        self.session.lock().await.dispose();
    }
}

/// Everything a satellite link needs beyond the connector.
pub struct SatelliteLinkConfig {
    pub channel: ChannelConfig,
    pub reconnect: ReconnectPolicy,
    pub command_timeout: Duration,
}

impl Default for SatelliteLinkConfig {
    fn default() -> Self {
        Self {
            channel: ChannelConfig::default(),
            reconnect: ReconnectPolicy::default(),
            command_timeout: COMMAND_TIMEOUT,
        }
    }
}

/// How one channel's drive loop ended.
enum DriveEnd {
    /// Transport outage; the backoff loop takes over.
    Broken,
    /// Session over; the task exits.
    Disposed,
}

/// Spawn the satellite link task.
///
/// `connector` dials (or re-dials) the host and completes the handshake;
/// it runs once immediately and again from the backoff loop after every
/// outage, while the session above holds `Suspended`. When the reconnect
/// budget runs dry the session is disposed and the task ends.
pub fn spawn_satellite_link<S, C, Fut>(
    session: Arc<Mutex<SatelliteSession>>,
    connector: C,
    config: SatelliteLinkConfig,
) -> (SatelliteHandle, mpsc::Receiver<SatelliteUiEvent>, tokio::task::JoinHandle<()>)
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    C: FnMut() -> Fut + Send + 'static,
    Fut: std::future::Future<Output = Result<SecureChannel<S>, ChannelError>> + Send + 'static,
{
    let (out_tx, out_rx) = mpsc::channel(OUTBOUND_DEPTH);
    let (ui_tx, ui_rx) = mpsc::channel(OUTBOUND_DEPTH);
    let handle = SatelliteHandle {
        session: Arc::clone(&session),
        out_tx,
        command_timeout: config.command_timeout,
    };
    let task = tokio::spawn(satellite_loop(session, connector, ui_tx, out_rx, config));
    (handle, ui_rx, task)
}

async fn satellite_loop<S, C, Fut>(
    session: Arc<Mutex<SatelliteSession>>,
    mut connector: C,
    ui_tx: mpsc::Sender<SatelliteUiEvent>,
    mut out_rx: mpsc::Receiver<Frame>,
    config: SatelliteLinkConfig,
) where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    C: FnMut() -> Fut + Send + 'static,
    Fut: std::future::Future<Output = Result<SecureChannel<S>, ChannelError>> + Send + 'static,
{
    let mut channel = match connector().await {
        Ok(channel) => channel,
        Err(e) => {
            debug!(error = %e, "initial connect failed, entering backoff");
            match reconnect(&mut connector, &session, &ui_tx, &config).await {
                Some(channel) => channel,
                None => return,
            }
        }
    };

    // A fresh session starts pairing over this channel; a resumed one is
    // already past it.
    {
        let mut s = session.lock().await;
        if s.phase() == SessionPhase::Idle {
            let _ = s.state_mut().request_identity();
        }
    }

    loop {
        match drive(&mut channel, &session, &ui_tx, &mut out_rx, &config.channel).await {
            DriveEnd::Disposed => {
                channel.close("terminated").await;
                let _ = ui_tx.send(SatelliteUiEvent::Disposed).await;
                return;
            }
            DriveEnd::Broken => {
                {
                    let mut s = session.lock().await;
                    if s.phase() == SessionPhase::Active {
                        let _ = s.suspend();
                    }
                }
                match reconnect(&mut connector, &session, &ui_tx, &config).await {
                    Some(fresh) => channel = fresh,
                    None => return,
                }
            }
        }
    }
}

/// Backoff loop: retry the connector until it succeeds or the budget runs
/// out. On success the session resumes and queued commands flush in order.
async fn reconnect<S, C, Fut>(
    connector: &mut C,
    session: &Arc<Mutex<SatelliteSession>>,
    ui_tx: &mpsc::Sender<SatelliteUiEvent>,
    config: &SatelliteLinkConfig,
) -> Option<SecureChannel<S>>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    C: FnMut() -> Fut + Send,
    Fut: std::future::Future<Output = Result<SecureChannel<S>, ChannelError>> + Send + 'static,
{
    let mut schedule = config.reconnect.schedule();
    loop {
        let Some(delay) = schedule.next() else {
            info!("reconnect budget exhausted, disposing session");
            session.lock().await.dispose();
            let _ = ui_tx.send(SatelliteUiEvent::Disposed).await;
            return None;
        };
        sleep(delay).await;

        match connector().await {
            Ok(mut channel) => {
                let flush = {
                    let mut s = session.lock().await;
                    if s.phase() == SessionPhase::Suspended {
                        let _ = s.resume();
                    }
                    s.flush_queue()
                };
                let mut flush_failed = false;
                for frame in flush {
                    if let Err(e) = channel.send(&frame).await {
                        debug!(error = %e, "queue flush failed, retrying reconnect");
                        flush_failed = true;
                        break;
                    }
                }
                if flush_failed {
                    continue;
                }
                info!(attempts = schedule.attempts(), "reconnected");
                let _ = ui_tx.send(SatelliteUiEvent::Resumed).await;
                return Some(channel);
            }
            Err(e) => {
                debug!(error = %e, attempts = schedule.attempts(), "reconnect attempt failed");
            }
        }
    }
}

/// Pump one channel until it breaks or the session ends.
async fn drive<S>(
    channel: &mut SecureChannel<S>,
    session: &Arc<Mutex<SatelliteSession>>,
    ui_tx: &mpsc::Sender<SatelliteUiEvent>,
    out_rx: &mut mpsc::Receiver<Frame>,
    config: &ChannelConfig,
) -> DriveEnd
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let mut keepalive = Keepalive::new(config.ping_interval, config.missed_intervals, Instant::now());
    let mut ticker = interval(config.ping_interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        let step = tokio::select! {
            received = channel.recv() => Step::Received(received),
            outbound = out_rx.recv() => Step::Outbound(outbound),
            _ = ticker.tick() => Step::Tick,
        };

        match step {
            Step::Received(Ok(frame)) => {
                keepalive.on_rx(Instant::now());
                if let Some(end) = handle_incoming(frame, session, ui_tx, channel).await {
                    return end;
                }
            }
            Step::Received(Err(e)) => {
                debug!(error = %e, "satellite channel lost");
                return DriveEnd::Broken;
            }
            Step::Outbound(Some(frame)) => {
                if channel.send(&frame).await.is_err() {
                    return DriveEnd::Broken;
                }
                keepalive.on_tx(Instant::now());
                if session.lock().await.phase() == SessionPhase::Disposed {
                    return DriveEnd::Disposed;
                }
            }
            Step::Outbound(None) => return DriveEnd::Disposed,
            Step::Tick => {
                let now = Instant::now();
                if keepalive.broken(now) {
                    info!("keepalive lapsed on satellite channel");
                    return DriveEnd::Broken;
                }
                if keepalive.ping_due(now) {
                    if channel.send(&Frame::Ping).await.is_err() {
                        return DriveEnd::Broken;
                    }
                    keepalive.on_tx(Instant::now());
                }
            }
        }
    }
}

/// Interpret one frame from the host.
async fn handle_incoming<S>(
    frame: Frame,
    session: &Arc<Mutex<SatelliteSession>>,
    ui_tx: &mpsc::Sender<SatelliteUiEvent>,
    channel: &mut SecureChannel<S>,
) -> Option<DriveEnd>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    match frame {
        Frame::Reply { id, resp } => {
            session.lock().await.take_reply(id, ChatResponse(resp));
            None
        }
        Frame::Event { resp } => match PairingMsg::from_value(&resp) {
            Some(msg) => handle_control(msg, session, ui_tx, channel).await,
            None => {
                let _ = ui_tx.send(SatelliteUiEvent::Engine(ChatResponse(resp))).await;
                None
            }
        },
        Frame::Ping => {
            if channel.send(&Frame::Pong).await.is_err() {
                return Some(DriveEnd::Broken);
            }
            None
        }
        Frame::Pong => None,
        Frame::Bye { reason } => {
            debug!(reason, "host said bye");
            if session.lock().await.phase() == SessionPhase::Disposed {
                Some(DriveEnd::Disposed)
            } else {
                Some(DriveEnd::Broken)
            }
        }
        Frame::Cmd { .. } => {
            warn!("host sent a cmd frame, dropped");
            None
        }
    }
}

/// React to a host-originated control message.
async fn handle_control<S>(
    msg: PairingMsg,
    session: &Arc<Mutex<SatelliteSession>>,
    ui_tx: &mpsc::Sender<SatelliteUiEvent>,
    channel: &mut SecureChannel<S>,
) -> Option<DriveEnd>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    match msg {
        PairingMsg::SatIdentityRecord { sat_identity_id, .. } => {
            let _ = ui_tx.send(SatelliteUiEvent::IdentityRecorded { sat_identity_id }).await;
            None
        }
        PairingMsg::SatIdentityConfirm { sat_identity_id } => {
            let _ = session.lock().await.state_mut().identity_confirm();
            let _ = ui_tx.send(SatelliteUiEvent::Confirmed { sat_identity_id }).await;
            None
        }
        PairingMsg::SatIdentityReject { sat_identity_id } => {
            let _ = session.lock().await.state_mut().identity_reject();
            let _ = ui_tx.send(SatelliteUiEvent::Rejected { sat_identity_id }).await;
            None
        }
        PairingMsg::SatTakeover => {
            {
                let mut s = session.lock().await;
                if s.phase() == SessionPhase::Active {
                    let _ = s.suspend();
                }
            }
            let _ = ui_tx.send(SatelliteUiEvent::TookOver).await;
            None
        }
        PairingMsg::SatResume => {
            let flush = {
                let mut s = session.lock().await;
                if s.phase() == SessionPhase::Suspended {
                    let _ = s.resume();
                }
                s.flush_queue()
            };
            for frame in flush {
                if channel.send(&frame).await.is_err() {
                    return Some(DriveEnd::Broken);
                }
            }
            let _ = ui_tx.send(SatelliteUiEvent::Resumed).await;
            None
        }
        PairingMsg::SatIdentityDeregister { .. } => {
            session.lock().await.dispose();
            Some(DriveEnd::Disposed)
        }
        other => {
            warn!(?other, "satellite-bound control message ignored");
            None
        }
    }
}
