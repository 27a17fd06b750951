//! End-to-end flows: pairing, command routing, takeover, reconnect and
//! deregistration over in-memory duplex transports.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use tokio::io::{duplex, DuplexStream};
use tokio::sync::{mpsc, Mutex};

use tether_core::controller::{ControllerConfig, SatelliteController};
use tether_core::engine::{engine_channel, EngineOutput, ScriptedEngine, ENGINE_QUEUE_DEPTH};
use tether_core::errors::SatelliteError;
use tether_core::link::{
    run_host_link, spawn_satellite_link, SatelliteLinkConfig, SatelliteUiEvent,
};
use tether_core::pairing::SatellitePairing;
use tether_core::registry::DeviceRegistry;
use tether_core::satellite::SatelliteSession;
use tether_core::session::SessionPhase;
use tether_core::store::{DeviceStatus, InMemoryStore, RegistryStore};
use tether_crypto::{IdentityKey, PublicIdentity};
use tether_proto::{ChatCommand, ChatResponse, Frame, PairingToken};
use tether_transport::{ChannelConfig, ChannelError, ReconnectPolicy, SecureChannel};

fn now_unix() -> u64 {
    SystemTime::now().duration_since(UNIX_EPOCH).unwrap().as_secs()
}

struct HostFixture {
    controller: SatelliteController,
    engine: ScriptedEngine,
    /// Controller-surfaced responses, as the host UI would see them.
    ui_rx: mpsc::Receiver<EngineOutput>,
    store: Arc<InMemoryStore>,
}

async fn host_fixture() -> HostFixture {
    let store = Arc::new(InMemoryStore::new());
    let registry = DeviceRegistry::new(store.clone());

    let (engine_handle, cmd_rx) = engine_channel(ENGINE_QUEUE_DEPTH);
    let (engine_out_tx, mut engine_out_rx) = mpsc::channel(ENGINE_QUEUE_DEPTH);
    let engine = ScriptedEngine::spawn(cmd_rx, engine_out_tx, |cmd| {
        ChatResponse::tagged(&format!("done:{}", cmd.tag().unwrap_or("?")))
    });

    let (ui_tx, ui_rx) = mpsc::channel(ENGINE_QUEUE_DEPTH);
    let controller =
        SatelliteController::new(registry, engine_handle, ui_tx, ControllerConfig::default());

    // The embedding client pumps every engine output through the mirror.
    let pump = controller.clone();
    tokio::spawn(async move {
        while let Some(output) = engine_out_rx.recv().await {
            pump.on_engine_output(output).await;
        }
    });

    HostFixture { controller, engine, ui_rx, store }
}

async fn next_ui_tag(ui_rx: &mut mpsc::Receiver<EngineOutput>) -> String {
    match ui_rx.recv().await.expect("host ui queue open") {
        EngineOutput::Event { resp } => resp.tag().unwrap_or("?").to_string(),
        EngineOutput::Reply { .. } => panic!("unexpected reply on host ui queue"),
    }
}

struct WireSatellite {
    sat_identity_id: u64,
    session: Arc<Mutex<SatelliteSession>>,
    handle: tether_core::link::SatelliteHandle,
    ui_rx: mpsc::Receiver<SatelliteUiEvent>,
}

/// Scan the token on the host, bring up a real secure channel over a
/// duplex pair and spawn both link tasks.
async fn establish(host: &HostFixture, pairing: &SatellitePairing, token: &PairingToken) -> WireSatellite {
    let answer = token.render();
    let sat_identity_id = host
        .controller
        .accept_pairing_answer(&answer, "Desk", now_unix())
        .await
        .unwrap();

    let (sat_io, host_io) = duplex(256 * 1024);
    let config = ChannelConfig::default();

    // Host side: complete the handshake with the binding's own key pair,
    // pinned to the key the token advertised.
    let device_id = host.controller.registry_device_id().await.unwrap();
    let device = host.store.device_by_id(device_id).await.unwrap().unwrap();
    let host_identity = IdentityKey::from_bytes(&device.local_private_key).unwrap();
    let expected = PublicIdentity::from_bytes(&device.device_public_key).unwrap();
    let host_controller = host.controller.clone();
    let host_config = config.clone();
    tokio::spawn(async move {
        let incoming = SecureChannel::read_hello(host_io, &host_config).await.unwrap();
        assert!(incoming.pairing_nonce().unwrap().is_some());
        assert_eq!(incoming.claimed_peer().unwrap(), expected);
        let channel = incoming.accept(&host_identity, Some(&expected)).await.unwrap();
        let _ = run_host_link(host_controller, channel, sat_identity_id, &host_config).await;
    });

    // Satellite side: single-shot connector over the prepared stream.
    let sat_identity = pairing.identity().clone();
    let nonce = token.nonce_bytes().unwrap();
    let mut io_slot = Some(sat_io);
    let connector = move || {
        let io = io_slot.take();
        let identity = sat_identity.clone();
        let nonce = nonce.clone();
        async move {
            let io: DuplexStream = io.ok_or(ChannelError::Closed)?;
            SecureChannel::connect(io, &identity, Some(nonce.as_slice()), None, &ChannelConfig::default())
                .await
        }
    };

    let session = Arc::new(Mutex::new(SatelliteSession::new()));
    let (handle, ui_rx, _task) =
        spawn_satellite_link(Arc::clone(&session), connector, SatelliteLinkConfig::default());

    // Wait for the host link to attach before the UI may confirm.
    while !host.controller.channel_attached().await {
        tokio::time::sleep(Duration::from_millis(5)).await;
    }

    WireSatellite { sat_identity_id, session, handle, ui_rx }
}

#[tokio::test]
async fn pairing_happy_path() {
    let mut host = host_fixture().await;
    let mut pairing = SatellitePairing::new(IdentityKey::generate());
    let token = pairing.advertise(Some("my phone".into()), None, now_unix()).unwrap();

    let mut sat = establish(&host, &pairing, &token).await;

    // Host UI saw the request and the recorded identity, in that order.
    assert_eq!(next_ui_tag(&mut host.ui_rx).await, "satRequestIdentity");
    assert_eq!(next_ui_tag(&mut host.ui_rx).await, "satIdentityRecord");

    host.controller.confirm_pairing(sat.sat_identity_id).await.unwrap();
    assert_eq!(next_ui_tag(&mut host.ui_rx).await, "satIdentityConfirmed");

    // The satellite observed the confirmation and went active.
    assert_eq!(
        sat.ui_rx.recv().await,
        Some(SatelliteUiEvent::Confirmed { sat_identity_id: sat.sat_identity_id })
    );
    assert_eq!(sat.session.lock().await.phase(), SessionPhase::Active);

    // Registry row is active.
    let device_id = host.controller.registry_device_id().await.unwrap();
    let device = host.store.device_by_id(device_id).await.unwrap().unwrap();
    assert_eq!(device.status, DeviceStatus::Active);

    // Commands now round-trip through the engine.
    let resp = sat.handle.request(ChatCommand::tagged("apiSendMessage")).await.unwrap();
    assert_eq!(resp.tag(), Some("done:apiSendMessage"));
}

#[tokio::test]
async fn denied_command_gets_error_reply_and_spares_the_store() {
    let mut host = host_fixture().await;
    let mut pairing = SatellitePairing::new(IdentityKey::generate());
    let token = pairing.advertise(None, None, now_unix()).unwrap();
    let mut sat = establish(&host, &pairing, &token).await;
    host.controller.confirm_pairing(sat.sat_identity_id).await.unwrap();
    let _ = sat.ui_rx.recv().await;

    let resp = sat.handle.request(ChatCommand::tagged("apiDeleteStorage")).await.unwrap();
    assert!(resp.is_error());
    assert_eq!(resp.0["error"]["type"], "deniedCommand");
    assert_eq!(resp.0["error"]["command"], "apiDeleteStorage");

    // A permitted command still works: the denial never reached the engine
    // or poisoned the session.
    let resp = sat.handle.request(ChatCommand::tagged("apiSendMessage")).await.unwrap();
    assert_eq!(resp.tag(), Some("done:apiSendMessage"));
}

#[tokio::test]
async fn takeover_queues_commands_until_resume() {
    let mut host = host_fixture().await;
    let mut pairing = SatellitePairing::new(IdentityKey::generate());
    let token = pairing.advertise(None, None, now_unix()).unwrap();
    let mut sat = establish(&host, &pairing, &token).await;
    host.controller.confirm_pairing(sat.sat_identity_id).await.unwrap();
    let _ = sat.ui_rx.recv().await;

    host.controller.takeover().await.unwrap();
    assert_eq!(sat.ui_rx.recv().await, Some(SatelliteUiEvent::TookOver));
    assert_eq!(sat.session.lock().await.phase(), SessionPhase::Suspended);
    assert_eq!(host.controller.session_phase().await, Some(SessionPhase::Suspended));

    // The command issued during suspension parks in the queue.
    let handle = sat.handle.clone();
    let pending = tokio::spawn(async move {
        handle.request(ChatCommand::tagged("apiSendMessage")).await
    });
    tokio::time::sleep(Duration::from_millis(20)).await;
    assert_eq!(sat.session.lock().await.queued_count(), 1);

    host.controller.resume().await.unwrap();
    assert_eq!(sat.ui_rx.recv().await, Some(SatelliteUiEvent::Resumed));

    let resp = pending.await.unwrap().unwrap();
    assert_eq!(resp.tag(), Some("done:apiSendMessage"));
}

#[tokio::test]
async fn suspension_buffers_events_and_resume_flushes_in_order() {
    let mut host = host_fixture().await;
    let mut pairing = SatellitePairing::new(IdentityKey::generate());
    let token = pairing.advertise(None, None, now_unix()).unwrap();
    let mut sat = establish(&host, &pairing, &token).await;
    host.controller.confirm_pairing(sat.sat_identity_id).await.unwrap();
    let _ = sat.ui_rx.recv().await;

    host.controller.takeover().await.unwrap();
    assert_eq!(sat.ui_rx.recv().await, Some(SatelliteUiEvent::TookOver));

    // Engine activity while the satellite is away.
    for i in 0..3 {
        host.engine.emit_event(ChatResponse::tagged(&format!("newChatItem{i}"))).await;
    }
    // Wait for the pump to land the events in the buffer.
    while host.controller.buffered_events().await < 3 {
        tokio::time::sleep(Duration::from_millis(5)).await;
    }

    host.controller.resume().await.unwrap();

    let mut seen = Vec::new();
    while seen.len() < 3 {
        match sat.ui_rx.recv().await.unwrap() {
            SatelliteUiEvent::Engine(resp) => seen.push(resp.tag().unwrap().to_string()),
            SatelliteUiEvent::Resumed => {}
            other => panic!("unexpected ui event: {other:?}"),
        }
    }
    assert_eq!(seen, vec!["newChatItem0", "newChatItem1", "newChatItem2"]);
}

#[tokio::test]
async fn deregister_revokes_the_binding() {
    let mut host = host_fixture().await;
    let mut pairing = SatellitePairing::new(IdentityKey::generate());
    let token = pairing.advertise(None, None, now_unix()).unwrap();
    let sat = establish(&host, &pairing, &token).await;
    host.controller.confirm_pairing(sat.sat_identity_id).await.unwrap();

    let device_id = host.controller.registry_device_id().await.unwrap();
    host.controller.deregister(sat.sat_identity_id).await.unwrap();

    let device = host.store.device_by_id(device_id).await.unwrap().unwrap();
    assert_eq!(device.status, DeviceStatus::Revoked);
    assert_eq!(host.controller.session_phase().await, None);

    // A later handshake from the same satellite key is refused as revoked.
    let err = host
        .controller
        .accept_reconnect(&device.device_public_key)
        .await
        .unwrap_err();
    assert!(matches!(err, SatelliteError::DeviceRevoked));
}

#[tokio::test]
async fn dispose_is_idempotent_and_emits_once() {
    let mut host = host_fixture().await;
    let mut pairing = SatellitePairing::new(IdentityKey::generate());
    let token = pairing.advertise(None, None, now_unix()).unwrap();
    let sat_id = host
        .controller
        .accept_pairing_answer(&token.render(), "Desk", now_unix())
        .await
        .unwrap();
    host.controller.confirm_pairing(sat_id).await.unwrap();

    host.controller.dispose(sat_id).await.unwrap();
    host.controller.dispose(sat_id).await.unwrap();
    host.controller.dispose(9999).await.unwrap();

    let mut disposed = 0;
    while let Ok(event) = host.ui_rx.try_recv() {
        if let EngineOutput::Event { resp } = event {
            if resp.tag() == Some("satIdentityDisposed") {
                disposed += 1;
            }
        }
    }
    assert_eq!(disposed, 1);
}

#[tokio::test]
async fn replayed_token_is_rejected() {
    let host = host_fixture().await;
    let mut pairing = SatellitePairing::new(IdentityKey::generate());
    let token = pairing.advertise(None, None, now_unix()).unwrap();
    let answer = token.render();

    let sat_id = host
        .controller
        .accept_pairing_answer(&answer, "Desk", now_unix())
        .await
        .unwrap();
    host.controller.reject_pairing(sat_id).await.unwrap();

    let err = host
        .controller
        .accept_pairing_answer(&answer, "Desk again", now_unix())
        .await
        .unwrap_err();
    assert!(matches!(err, SatelliteError::PairingReplay));
}

#[tokio::test]
async fn second_satellite_is_refused_while_one_is_bound() {
    let host = host_fixture().await;
    let mut first = SatellitePairing::new(IdentityKey::generate());
    let token = first.advertise(None, None, now_unix()).unwrap();
    let sat_id = host
        .controller
        .accept_pairing_answer(&token.render(), "Desk", now_unix())
        .await
        .unwrap();
    host.controller.confirm_pairing(sat_id).await.unwrap();

    let mut second = SatellitePairing::new(IdentityKey::generate());
    let other = second.advertise(None, None, now_unix()).unwrap();
    let err = host
        .controller
        .accept_pairing_answer(&other.render(), "Laptop", now_unix())
        .await
        .unwrap_err();
    assert!(matches!(err, SatelliteError::HandshakeReject(_)));
}

#[tokio::test]
async fn revocation_tears_down_the_session_on_the_next_keepalive() {
    let host = host_fixture().await;
    let mut pairing = SatellitePairing::new(IdentityKey::generate());
    let token = pairing.advertise(None, None, now_unix()).unwrap();
    let sat_id = host
        .controller
        .accept_pairing_answer(&token.render(), "Desk", now_unix())
        .await
        .unwrap();
    host.controller.confirm_pairing(sat_id).await.unwrap();

    // Revoked behind the session's back, as `revoke` from a settings
    // screen would do.
    let device_id = host.controller.registry_device_id().await.unwrap();
    host.store
        .set_device_status(device_id, DeviceStatus::Revoked)
        .await
        .unwrap();

    let err = host.controller.handle_frame(Frame::Ping).await.unwrap_err();
    assert!(matches!(err, SatelliteError::DeviceRevoked));
    assert_eq!(host.controller.session_phase().await, None);
}

/// Host side of a reconnect: accept the handshake, then answer every cmd
/// by echoing its payload back as the reply.
fn spawn_echo_host(host_io: DuplexStream, host_key: IdentityKey) {
    tokio::spawn(async move {
        let config = ChannelConfig::default();
        let incoming = match SecureChannel::read_hello(host_io, &config).await {
            Ok(incoming) => incoming,
            Err(_) => return,
        };
        let mut channel = match incoming.accept(&host_key, None).await {
            Ok(channel) => channel,
            Err(_) => return,
        };
        loop {
            match channel.recv().await {
                Ok(Frame::Cmd { id, cmd }) => {
                    if channel.send(&Frame::Reply { id, resp: cmd }).await.is_err() {
                        break;
                    }
                }
                Ok(_) => {}
                Err(_) => break,
            }
        }
    });
}

#[tokio::test]
async fn reconnect_within_budget_flushes_queued_commands_in_order() {
    // A session that was active, lost its transport, and queued two
    // commands while suspended.
    let session = Arc::new(Mutex::new(SatelliteSession::new()));
    let (rx_first, rx_second) = {
        let mut s = session.lock().await;
        s.state_mut().request_identity().unwrap();
        s.state_mut().identity_confirm().unwrap();
        s.suspend().unwrap();
        let (_, rx_first, _) = s.submit(ChatCommand::tagged("first")).unwrap();
        let (_, rx_second, _) = s.submit(ChatCommand::tagged("second")).unwrap();
        (rx_first, rx_second)
    };

    // The first two dials fail; the third lands on a live host.
    let sat_key = IdentityKey::generate();
    let attempts = Arc::new(AtomicU32::new(0));
    let attempts_in_connector = Arc::clone(&attempts);
    let connector = move || {
        let attempt = attempts_in_connector.fetch_add(1, Ordering::SeqCst);
        let sat_key = sat_key.clone();
        async move {
            if attempt < 2 {
                return Err(ChannelError::Closed);
            }
            let (sat_io, host_io) = duplex(256 * 1024);
            spawn_echo_host(host_io, IdentityKey::generate());
            SecureChannel::connect(sat_io, &sat_key, None, None, &ChannelConfig::default()).await
        }
    };

    let config = SatelliteLinkConfig {
        reconnect: ReconnectPolicy {
            initial: Duration::from_millis(10),
            cap: Duration::from_millis(20),
            ceiling: Duration::from_secs(2),
        },
        ..Default::default()
    };
    let (_handle, mut ui_rx, _task) = spawn_satellite_link(Arc::clone(&session), connector, config);

    // Queued commands flush in insertion order once reconnected.
    let first = rx_first.await.unwrap().unwrap();
    let second = rx_second.await.unwrap().unwrap();
    assert_eq!(first.tag(), Some("first"));
    assert_eq!(second.tag(), Some("second"));
    assert!(attempts.load(Ordering::SeqCst) >= 3);

    assert_eq!(ui_rx.recv().await, Some(SatelliteUiEvent::Resumed));
    assert_eq!(session.lock().await.phase(), SessionPhase::Active);
}

#[tokio::test]
async fn reconnect_ceiling_disposes_the_session() {
    let session = Arc::new(Mutex::new(SatelliteSession::new()));
    let rx = {
        let mut s = session.lock().await;
        s.state_mut().request_identity().unwrap();
        s.state_mut().identity_confirm().unwrap();
        s.suspend().unwrap();
        let (_, rx, _) = s.submit(ChatCommand::tagged("doomed")).unwrap();
        rx
    };

    let connector = move || async move { Err::<SecureChannel<DuplexStream>, _>(ChannelError::Closed) };
    let config = SatelliteLinkConfig {
        reconnect: ReconnectPolicy {
            initial: Duration::from_millis(5),
            cap: Duration::from_millis(10),
            ceiling: Duration::from_millis(30),
        },
        ..Default::default()
    };
    let (_handle, mut ui_rx, task) = spawn_satellite_link(Arc::clone(&session), connector, config);

    assert_eq!(ui_rx.recv().await, Some(SatelliteUiEvent::Disposed));
    task.await.unwrap();

    assert_eq!(session.lock().await.phase(), SessionPhase::Disposed);
    assert!(matches!(rx.await.unwrap(), Err(SatelliteError::SessionDisposed)));
}

#[cfg(feature = "sqlite")]
#[tokio::test]
async fn sqlite_backed_pairing_persists_the_binding() {
    use tether_core::sqlite::SqliteStore;

    let store = Arc::new(SqliteStore::open_in_memory().unwrap());
    let registry = DeviceRegistry::new(store.clone());
    let (engine_handle, _cmd_rx) = engine_channel(8);
    let (ui_tx, _ui_rx) = mpsc::channel(8);
    let controller =
        SatelliteController::new(registry, engine_handle, ui_tx, ControllerConfig::default());

    let mut pairing = SatellitePairing::new(IdentityKey::generate());
    let token = pairing.advertise(None, None, now_unix()).unwrap();
    let sat_id = controller
        .accept_pairing_answer(&token.render(), "Desk", now_unix())
        .await
        .unwrap();
    controller.confirm_pairing(sat_id).await.unwrap();

    let device = store
        .device_by_public_key(token.sat_public_key().unwrap().as_slice())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(device.status, DeviceStatus::Active);
    assert_eq!(device.name, "Desk");
}
