//! Process-wide controller.
//!
//! One controller per chat client process. It owns exactly one optional
//! satellite identity slot and one optional session object, and every
//! transition runs under the same lock that serializes chat-store writes,
//! so registry updates and phase changes are atomic with respect to chat
//! activity.
//!
//! The controller never touches sockets. Link tasks attach an outbound
//! frame queue and feed received frames in; the embedding client pumps the
//! engine output queue through [`SatelliteController::on_engine_output`].

use std::sync::Arc;
use std::time::Instant;

use tokio::sync::{mpsc, Mutex};
use tracing::{debug, info, warn};

use tether_crypto::PublicIdentity;
use tether_proto::{ChatCommand, Frame, PairingMsg, PairingToken, SatelliteEvent};

use crate::engine::{EngineHandle, EngineOutput};
use crate::errors::SatelliteError;
use crate::pairing::{HostPairing, IdentityStatus, SatelliteIdentity, SatellitePairing};
use crate::registry::{DeviceRegistry, RegistryError};
use crate::router::{HostRouter, OutputAction};
use crate::session::{EventBuffer, SessionPhase, SessionState, EVENT_BUFFER_CAPACITY};
use crate::store::{DeviceId, DeviceStatus};

/// Controller tuning. Defaults match the protocol constants.
#[derive(Clone, Debug)]
pub struct ControllerConfig {
    /// Capacity of the per-session suspension event buffer.
    pub event_buffer: usize,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self { event_buffer: EVENT_BUFFER_CAPACITY }
    }
}

/// Host-side session object, the single occupant of the session slot.
struct HostSession {
    identity: SatelliteIdentity,
    device_id: DeviceId,
    state: SessionState,
    events: EventBuffer,
    router: HostRouter,
    /// Channel writer handle; present while a transport is attached.
    outbound: Option<mpsc::Sender<Frame>>,
    last_activity: Instant,
}

impl HostSession {
    fn touch(&mut self) {
        self.last_activity = Instant::now();
    }

    fn send_frame(&self, frame: Frame) {
        match &self.outbound {
            Some(tx) => {
                if tx.try_send(frame).is_err() {
                    warn!("outbound queue unavailable, frame dropped");
                }
            }
            None => debug!("no channel attached, frame dropped"),
        }
    }
}

struct Inner {
    registry: DeviceRegistry,
    pairing: HostPairing,
    /// Satellite-role pairing state, present after `begin_pairing`.
    sat_pairing: Option<SatellitePairing>,
    next_identity: u64,
    session: Option<HostSession>,
}

/// The coordinator gluing registry, pairing, session and router to the
/// existing chat controller.
#[derive(Clone)]
pub struct SatelliteController {
    inner: Arc<Mutex<Inner>>,
    engine: EngineHandle,
    output: mpsc::Sender<EngineOutput>,
    config: ControllerConfig,
}

impl SatelliteController {
    pub fn new(
        registry: DeviceRegistry,
        engine: EngineHandle,
        output: mpsc::Sender<EngineOutput>,
        config: ControllerConfig,
    ) -> Self {
        Self {
            inner: Arc::new(Mutex::new(Inner {
                registry,
                pairing: HostPairing::default(),
                sat_pairing: None,
                next_identity: 0,
                session: None,
            })),
            engine,
            output,
            config,
        }
    }

    fn emit(&self, event: SatelliteEvent) {
        if self
            .output
            .try_send(EngineOutput::Event { resp: event.into_response() })
            .is_err()
        {
            warn!("chat output queue full, controller event dropped");
        }
    }

    // ------------------------------------------------------------------
    // Satellite role
    // ------------------------------------------------------------------

    /// Mint a pairing token to show as a QR code. The satellite identity
    /// key persists across re-advertisements within this process.
    pub async fn begin_pairing(
        &self,
        host_hint: Option<String>,
        addr: Option<String>,
        now_unix: u64,
    ) -> Result<PairingToken, SatelliteError> {
        let mut inner = self.inner.lock().await;
        let sat = inner
            .sat_pairing
            .get_or_insert_with(|| SatellitePairing::new(tether_crypto::IdentityKey::generate()));
        let token = sat.advertise(host_hint, addr, now_unix)?;
        info!("pairing token minted");
        Ok(token)
    }

    /// The satellite identity advertised by [`Self::begin_pairing`].
    pub async fn satellite_identity(&self) -> Option<PublicIdentity> {
        let inner = self.inner.lock().await;
        inner.sat_pairing.as_ref().map(|p| p.identity().public())
    }

    // ------------------------------------------------------------------
    // Host role: pairing
    // ------------------------------------------------------------------

    /// Consume a scanned token: vet it, register the device in `pending`
    /// status and stage a session in `Pairing` phase. The returned id
    /// appears in the `SatIdentityRecord` surfaced to the host UI.
    pub async fn accept_pairing_answer(
        &self,
        answer: &str,
        device_name: &str,
        now_unix: u64,
    ) -> Result<u64, SatelliteError> {
        let mut inner = self.inner.lock().await;
        if let Some(session) = &inner.session {
            if session.state.is_live() || session.state.phase() == SessionPhase::Pairing {
                return Err(SatelliteError::HandshakeReject(
                    "another satellite is already bound".into(),
                ));
            }
        }

        let accepted = inner.pairing.accept_answer(answer, now_unix)?;
        let registration = inner
            .registry
            .register(device_name, &accepted.sat_public_key)
            .await?;

        inner.next_identity += 1;
        let sat_identity_id = inner.next_identity;
        let identity_text = accepted.token.render();

        let mut state = SessionState::new();
        state.request_identity().map_err(SatelliteError::from)?;

        inner.session = Some(HostSession {
            identity: SatelliteIdentity {
                sat_identity_id,
                identity: identity_text.clone(),
                status: IdentityStatus::Recorded,
            },
            device_id: registration.device_id,
            state,
            events: EventBuffer::new(self.config.event_buffer),
            router: HostRouter::new(self.engine.clone()),
            outbound: None,
            last_activity: Instant::now(),
        });

        self.emit(SatelliteEvent::SatRequestIdentity { identity: identity_text.clone() });
        self.emit(SatelliteEvent::SatIdentityRecord { sat_identity_id, identity: identity_text });
        info!(sat_identity_id, device_id = registration.device_id, "satellite identity recorded");
        Ok(sat_identity_id)
    }

    /// Host user approved the pairing.
    pub async fn confirm_pairing(&self, sat_identity_id: u64) -> Result<(), SatelliteError> {
        let mut inner = self.inner.lock().await;
        let Inner { registry, session, .. } = &mut *inner;
        let session = current_session(session, sat_identity_id)?;

        session.state.identity_confirm().map_err(SatelliteError::from)?;
        registry.confirm(session.device_id).await?;
        session.identity.status = IdentityStatus::Confirmed;
        session.touch();
        session.send_frame(Frame::Event {
            resp: PairingMsg::SatIdentityConfirm { sat_identity_id }.to_value(),
        });

        self.emit(SatelliteEvent::SatIdentityConfirmed { sat_identity_id });
        info!(sat_identity_id, "pairing confirmed");
        Ok(())
    }

    /// Host user refused the pairing; the device row disappears.
    pub async fn reject_pairing(&self, sat_identity_id: u64) -> Result<(), SatelliteError> {
        let mut inner = self.inner.lock().await;
        let Inner { registry, session, .. } = &mut *inner;
        let current = current_session(session, sat_identity_id)?;

        current.state.identity_reject().map_err(SatelliteError::from)?;
        current.identity.status = IdentityStatus::Rejected;
        current.send_frame(Frame::Event {
            resp: PairingMsg::SatIdentityReject { sat_identity_id }.to_value(),
        });
        registry.reject(current.device_id).await?;
        *session = None;

        self.emit(SatelliteEvent::SatIdentityRejected { sat_identity_id });
        info!(sat_identity_id, "pairing rejected");
        Ok(())
    }

    // ------------------------------------------------------------------
    // Host role: reconnect
    // ------------------------------------------------------------------

    /// Admit a reconnecting satellite authenticated by its long-lived key.
    ///
    /// With a suspended session for the same device the existing identity
    /// is reused; otherwise (say, after a host restart) a fresh session is
    /// staged directly in `Active`.
    pub async fn accept_reconnect(
        &self,
        device_public_key: &[u8],
    ) -> Result<u64, SatelliteError> {
        let mut inner = self.inner.lock().await;
        let device = inner.registry.lookup(device_public_key).await?;

        if let Some(session) = &mut inner.session {
            if session.device_id == device.id && session.state.is_live() {
                session.touch();
                return Ok(session.identity.sat_identity_id);
            }
            if session.state.is_live() {
                return Err(SatelliteError::HandshakeReject(
                    "another satellite is already bound".into(),
                ));
            }
        }

        inner.next_identity += 1;
        let sat_identity_id = inner.next_identity;

        let mut state = SessionState::new();
        state.request_identity().map_err(SatelliteError::from)?;
        state.identity_confirm().map_err(SatelliteError::from)?;

        inner.session = Some(HostSession {
            identity: SatelliteIdentity {
                sat_identity_id,
                identity: String::new(),
                status: IdentityStatus::Confirmed,
            },
            device_id: device.id,
            state,
            events: EventBuffer::new(self.config.event_buffer),
            router: HostRouter::new(self.engine.clone()),
            outbound: None,
            last_activity: Instant::now(),
        });
        info!(sat_identity_id, device_id = device.id, "satellite session resumed from registry");
        Ok(sat_identity_id)
    }

    // ------------------------------------------------------------------
    // Host role: lifecycle
    // ------------------------------------------------------------------

    /// Host UI takes the foreground. The channel stays up but events stop
    /// flowing until [`Self::resume`].
    pub async fn takeover(&self) -> Result<(), SatelliteError> {
        let mut inner = self.inner.lock().await;
        let session = live_session(&mut inner.session)?;
        session.state.takeover().map_err(SatelliteError::from)?;
        session.identity.status = IdentityStatus::TookOver;
        let sat_identity_id = session.identity.sat_identity_id;
        session.send_frame(Frame::Event { resp: PairingMsg::SatTakeover.to_value() });

        self.emit(SatelliteEvent::SatTookOver { sat_identity_id });
        info!(sat_identity_id, "host took over");
        Ok(())
    }

    /// Hand the session back to the satellite, flushing buffered events in
    /// their original order.
    pub async fn resume(&self) -> Result<(), SatelliteError> {
        let mut inner = self.inner.lock().await;
        let session = live_session(&mut inner.session)?;
        session.state.reconnect().map_err(SatelliteError::from)?;
        session.identity.status = IdentityStatus::Confirmed;
        session.touch();
        session.send_frame(Frame::Event { resp: PairingMsg::SatResume.to_value() });
        for event in session.events.drain() {
            session.send_frame(Frame::Event { resp: event.0 });
        }
        info!(sat_identity_id = session.identity.sat_identity_id, "session resumed");
        Ok(())
    }

    /// Dispose the session, keeping the device binding for later
    /// reconnects. A no-op when nothing matches: dispose is idempotent.
    pub async fn dispose(&self, sat_identity_id: u64) -> Result<(), SatelliteError> {
        let mut inner = self.inner.lock().await;
        let Some(session) = &mut inner.session else {
            return Ok(());
        };
        if session.identity.sat_identity_id != sat_identity_id {
            return Ok(());
        }

        if session.state.dispose() {
            session.identity.status = IdentityStatus::Disposed;
            session.send_frame(Frame::Bye { reason: "disposed".into() });
            self.emit(SatelliteEvent::SatIdentityDisposed { sat_identity_id });
            info!(sat_identity_id, "session disposed");
        }
        inner.session = None;
        Ok(())
    }

    /// Dispose and additionally revoke the device binding, so future
    /// handshakes from its key fail as revoked.
    pub async fn deregister(&self, sat_identity_id: u64) -> Result<(), SatelliteError> {
        let device_id = {
            let inner = self.inner.lock().await;
            match &inner.session {
                Some(s) if s.identity.sat_identity_id == sat_identity_id => Some(s.device_id),
                _ => None,
            }
        };
        let Some(device_id) = device_id else {
            debug!(sat_identity_id, "deregister without a matching session");
            return Ok(());
        };

        {
            let inner = self.inner.lock().await;
            inner.registry.revoke(device_id).await?;
        }
        self.dispose(sat_identity_id).await
    }

    // ------------------------------------------------------------------
    // Link task interface
    // ------------------------------------------------------------------

    /// Attach a transport's outbound queue to the current session.
    pub async fn attach_channel(
        &self,
        sat_identity_id: u64,
        outbound: mpsc::Sender<Frame>,
    ) -> Result<(), SatelliteError> {
        let mut inner = self.inner.lock().await;
        let session = current_session(&mut inner.session, sat_identity_id)?;
        session.outbound = Some(outbound);
        session.touch();
        Ok(())
    }

    /// Feed one received frame through the router. Runs under the
    /// controller lock; the link task's reader stays drainable because
    /// outbound frames go through a bounded queue, never the socket.
    pub async fn handle_frame(&self, frame: Frame) -> Result<(), SatelliteError> {
        match frame {
            Frame::Cmd { id, cmd } => {
                if let Some(msg) = PairingMsg::from_value(&cmd) {
                    return self.handle_control(msg).await;
                }
                let mut inner = self.inner.lock().await;
                let session = live_session(&mut inner.session)?;
                session.touch();
                let phase = session.state.phase();
                let reply = session.router.handle_cmd(phase, id, ChatCommand(cmd)).await?;
                if let Some(reply) = reply {
                    session.send_frame(reply);
                }
                Ok(())
            }
            Frame::Ping => {
                // Keepalive doubles as the revocation tick: a binding
                // revoked while the channel was up is torn down here.
                let mut inner = self.inner.lock().await;
                let Inner { registry, session: slot, .. } = &mut *inner;
                let session = live_session(slot)?;
                session.touch();

                let status = match registry.device(session.device_id).await {
                    Ok(device) => Some(device.status),
                    Err(RegistryError::NotFound) => None,
                    Err(e) => return Err(e.into()),
                };
                match status {
                    Some(DeviceStatus::Revoked) | None => {
                        let sat_identity_id = session.identity.sat_identity_id;
                        if session.state.dispose() {
                            session.send_frame(Frame::Bye { reason: "device revoked".into() });
                            self.emit(SatelliteEvent::SatIdentityDisposed { sat_identity_id });
                            info!(sat_identity_id, "session torn down for revoked device");
                        }
                        *slot = None;
                        Err(SatelliteError::DeviceRevoked)
                    }
                    Some(_) => {
                        session.send_frame(Frame::Pong);
                        Ok(())
                    }
                }
            }
            Frame::Pong => {
                let mut inner = self.inner.lock().await;
                if let Ok(session) = live_session(&mut inner.session) {
                    session.touch();
                }
                Ok(())
            }
            Frame::Bye { reason } => {
                debug!(reason, "peer said bye");
                self.on_channel_broken().await;
                Ok(())
            }
            other => {
                warn!(kind = other.kind(), "unexpected frame from satellite dropped");
                Ok(())
            }
        }
    }

    async fn handle_control(&self, msg: PairingMsg) -> Result<(), SatelliteError> {
        match msg {
            PairingMsg::SatRequestIdentity { .. } => {
                // OOB answers arrive through `accept_pairing_answer`; a
                // channel-borne request is only acknowledged.
                Ok(())
            }
            PairingMsg::SatTerminateIdentity { sat_identity_id } => {
                self.dispose(sat_identity_id).await
            }
            other => {
                warn!(?other, "host-bound control message ignored");
                Ok(())
            }
        }
    }

    /// Mirror one piece of engine output to the satellite (or buffer it).
    pub async fn on_engine_output(&self, output: EngineOutput) {
        let mut inner = self.inner.lock().await;
        let Some(session) = &mut inner.session else {
            return;
        };
        let phase = session.state.phase();
        match session.router.route_output(output, phase) {
            OutputAction::Send(frame) => session.send_frame(frame),
            OutputAction::Buffer(event) => session.events.push(event),
            OutputAction::Ignore => {}
        }
    }

    /// Transport loss: suspend the session and release the channel handle.
    pub async fn on_channel_broken(&self) {
        let mut inner = self.inner.lock().await;
        let Some(session) = &mut inner.session else {
            return;
        };
        if session.state.phase() == SessionPhase::Active {
            let _ = session.state.channel_broken();
            info!(
                sat_identity_id = session.identity.sat_identity_id,
                "channel broken, session suspended"
            );
        }
        session.outbound = None;
    }

    /// Reconnect-ceiling expiry on the satellite side, or any other caller
    /// deciding the outage is final.
    pub async fn on_reconnect_exhausted(&self) {
        let id = {
            let inner = self.inner.lock().await;
            inner.session.as_ref().map(|s| s.identity.sat_identity_id)
        };
        if let Some(id) = id {
            let _ = self.dispose(id).await;
        }
    }

    // ------------------------------------------------------------------
    // Introspection
    // ------------------------------------------------------------------

    pub async fn session_phase(&self) -> Option<SessionPhase> {
        let inner = self.inner.lock().await;
        inner.session.as_ref().map(|s| s.state.phase())
    }

    pub async fn current_identity(&self) -> Option<SatelliteIdentity> {
        let inner = self.inner.lock().await;
        inner.session.as_ref().map(|s| s.identity.clone())
    }

    pub async fn registry_device_id(&self) -> Option<DeviceId> {
        let inner = self.inner.lock().await;
        inner.session.as_ref().map(|s| s.device_id)
    }

    pub async fn channel_attached(&self) -> bool {
        let inner = self.inner.lock().await;
        inner.session.as_ref().is_some_and(|s| s.outbound.is_some())
    }

    pub async fn buffered_events(&self) -> usize {
        let inner = self.inner.lock().await;
        inner.session.as_ref().map(|s| s.events.len()).unwrap_or(0)
    }

    pub async fn idle_for(&self) -> Option<std::time::Duration> {
        let inner = self.inner.lock().await;
        inner.session.as_ref().map(|s| s.last_activity.elapsed())
    }
}

fn current_session<'a>(
    slot: &'a mut Option<HostSession>,
    sat_identity_id: u64,
) -> Result<&'a mut HostSession, SatelliteError> {
    match slot {
        Some(session) if session.identity.sat_identity_id == sat_identity_id => Ok(session),
        Some(_) => Err(SatelliteError::HandshakeReject("unknown satellite identity".into())),
        None => Err(SatelliteError::SessionDisposed),
    }
}

fn live_session(slot: &mut Option<HostSession>) -> Result<&mut HostSession, SatelliteError> {
    match slot {
        Some(session) if session.state.phase() != SessionPhase::Disposed => Ok(session),
        _ => Err(SatelliteError::SessionDisposed),
    }
}
