mod common;

use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::task::JoinHandle;

use common::{contact_node, link_config, node, wait_until, FakeRadio};
use meshcitadel::error::TransportError;
use meshcitadel::meshcore::nodes::NodeDirectory;
use meshcitadel::meshcore::protocol::codes::{CMD_RESET_PATH, PUSH_NEW_ADVERT};
use meshcitadel::meshcore::{LinkSupervisor, NodeId};
use meshcitadel::transport::envelope::{INACTIVITY_TEXT, PROCESSING_ERROR_TEXT};
use meshcitadel::transport::{
    Authenticator, BindingRegistry, CommandProcessor, EngineConfig, EngineHandle, InboundEnvelope,
    MemorySessionManager, OutboundEnvelope, PayloadKind, SessionManager, TransportEngine,
};

/// Stand-in for the board: canned answers keyed on the command text.
#[derive(Default)]
struct Board {
    seen: Mutex<Vec<InboundEnvelope>>,
    logins: Mutex<Vec<InboundEnvelope>>,
}

impl Board {
    fn seen(&self) -> Vec<InboundEnvelope> {
        self.seen.lock().unwrap().clone()
    }
}

fn paragraph(sentences: usize) -> String {
    (1..=sentences)
        .map(|i| format!("Bulletin line {:02} reports the weather on the ridge is clear and calm tonight.", i))
        .collect::<Vec<_>>()
        .join(" ")
}

impl CommandProcessor for Board {
    async fn process(&self, env: InboundEnvelope) -> anyhow::Result<Vec<OutboundEnvelope>> {
        self.seen.lock().unwrap().push(env.clone());
        let session = env.session.clone();
        match env.text.as_str() {
            "menu" => Ok(vec![
                OutboundEnvelope::text(session.clone(), "[M]essages"),
                OutboundEnvelope::text(session, "[G]oodbye"),
            ]),
            // Three and five chunks at 140 bytes.
            "read 1" => Ok(vec![OutboundEnvelope::text(session, paragraph(4))]),
            "read 2" => Ok(vec![OutboundEnvelope::text(session, paragraph(8))]),
            "boom" => anyhow::bail!("message store offline"),
            other => Ok(vec![OutboundEnvelope::text(session, format!("ok: {}", other))]),
        }
    }
}

impl Authenticator for Board {
    async fn login(&self, env: InboundEnvelope) -> anyhow::Result<Vec<OutboundEnvelope>> {
        self.logins.lock().unwrap().push(env.clone());
        Ok(vec![OutboundEnvelope::text(env.session, "Welcome back.")])
    }
}

struct Rig {
    radio: FakeRadio,
    board: Arc<Board>,
    sessions: Arc<MemorySessionManager>,
    registry: Arc<BindingRegistry>,
    engine: EngineHandle,
    task: JoinHandle<Result<(), TransportError>>,
}

fn engine_config() -> EngineConfig {
    let mut cfg = EngineConfig::default();
    cfg.outbox.inter_packet_delay = Duration::from_millis(100);
    cfg.outbox.policy.ack_timeout = Duration::from_secs(2);
    cfg.outbox.policy.max_retries = 2;
    cfg.outbox.policy.max_backoff = Duration::from_secs(10);
    cfg.session_sweep = Duration::from_secs(5);
    cfg
}

fn start(radio: FakeRadio, cfg: EngineConfig, session_timeout: Duration) -> Rig {
    let (supervisor, link, events) = LinkSupervisor::new(radio.clone(), link_config());
    tokio::spawn(supervisor.run());
    let board = Arc::new(Board::default());
    let sessions = Arc::new(MemorySessionManager::new(session_timeout));
    let engine = TransportEngine::new(cfg, link, board.clone(), sessions.clone(), board.clone());
    let registry = engine.registry();
    let handle = engine.handle();
    let task = tokio::spawn(engine.run(events));
    Rig {
        radio,
        board,
        sessions,
        registry,
        engine: handle,
        task,
    }
}

fn rig() -> Rig {
    start(FakeRadio::new(), engine_config(), Duration::from_secs(1800))
}

const ALICE: &str = "a1a1a1a1a1a1";
const BOB: &str = "b0b0b0b0b0b0";

fn texts_to(radio: &FakeRadio, dest: NodeId) -> Vec<String> {
    radio
        .sent()
        .into_iter()
        .filter(|s| s.destination == dest)
        .map(|s| s.text)
        .collect()
}

fn distinct(mut texts: Vec<String>) -> Vec<String> {
    texts.dedup();
    texts
}

#[tokio::test(start_paused = true)]
async fn reply_returns_to_the_sending_node() {
    let rig = rig();
    let alice = node(ALICE);
    rig.radio.queue_message(alice, 1000, 0, "who");

    assert!(wait_until(Duration::from_secs(10), || texts_to(&rig.radio, alice) == vec!["ok: who"]).await);
    let seen = rig.board.seen();
    assert_eq!(seen.len(), 1);
    assert!(seen[0].fresh_session);
    assert_eq!(seen[0].kind, PayloadKind::Chat);
    assert_eq!(seen[0].quality.hops, Some(1));
    assert_eq!(rig.registry.binding(&alice).map(|b| b.session), Some(seen[0].session.clone()));

    rig.radio.queue_message(alice, 1001, 0, "again");
    assert!(wait_until(Duration::from_secs(10), || rig.board.seen().len() == 2).await);
    let second = &rig.board.seen()[1];
    assert!(!second.fresh_session);
    assert_eq!(second.session, seen[0].session);

    rig.engine.shutdown();
    assert!(rig.task.await.unwrap().is_ok());
}

#[tokio::test(start_paused = true)]
async fn retransmitted_unit_is_processed_once() {
    let rig = rig();
    let alice = node(ALICE);
    rig.radio.queue_message(alice, 1000, 0, "post hello");
    rig.radio.queue_message(alice, 1000, 0, "post hello");
    assert!(wait_until(Duration::from_secs(10), || !texts_to(&rig.radio, alice).is_empty()).await);
    tokio::time::sleep(Duration::from_secs(3)).await;
    assert_eq!(rig.board.seen().len(), 1);
    assert_eq!(texts_to(&rig.radio, alice), vec!["ok: post hello"]);

    // A different timestamp is a different unit.
    rig.radio.queue_message(alice, 1031, 0, "post hello");
    assert!(wait_until(Duration::from_secs(10), || rig.board.seen().len() == 2).await);

    // Once the window has passed the same unit is accepted again.
    tokio::time::sleep(Duration::from_secs(31)).await;
    rig.radio.queue_message(alice, 1000, 0, "post hello");
    assert!(wait_until(Duration::from_secs(10), || rig.board.seen().len() == 3).await);
}

#[tokio::test(start_paused = true)]
async fn multi_reply_is_announced_and_kept_in_order() {
    let rig = rig();
    let alice = node(ALICE);
    rig.radio.queue_message(alice, 1000, 0, "menu");

    assert!(wait_until(Duration::from_secs(10), || texts_to(&rig.radio, alice).len() == 3).await);
    assert_eq!(
        texts_to(&rig.radio, alice),
        vec![
            "Displaying 2 messages. Send 'stop' to stop.".to_string(),
            "[M]essages".to_string(),
            "[G]oodbye".to_string(),
        ]
    );
}

#[tokio::test(start_paused = true)]
async fn long_reply_waits_for_each_acknowledgment() {
    let radio = FakeRadio::new();
    radio.set_auto_confirm(false);
    let rig = start(radio, engine_config(), Duration::from_secs(1800));
    let alice = node(ALICE);
    rig.radio.queue_message(alice, 1000, 0, "read 1");

    assert!(wait_until(Duration::from_secs(10), || rig.radio.sent().len() == 1).await);
    // Less than the ack timeout: nothing else may go out.
    tokio::time::sleep(Duration::from_secs(1)).await;
    assert_eq!(rig.radio.sent().len(), 1);

    rig.radio.confirm_last();
    assert!(wait_until(Duration::from_secs(1), || rig.radio.sent().len() == 2).await);
    rig.radio.confirm_last();
    assert!(wait_until(Duration::from_secs(1), || rig.radio.sent().len() == 3).await);
    rig.radio.confirm_last();
    tokio::time::sleep(Duration::from_secs(10)).await;

    let chunks = texts_to(&rig.radio, alice);
    assert_eq!(chunks.len(), 3, "no retransmissions once acknowledged: {:?}", chunks);
    assert!(chunks.iter().all(|c| c.len() <= 140));
    assert_eq!(chunks.join(" "), paragraph(4));
}

#[tokio::test(start_paused = true)]
async fn cancel_keyword_drops_the_rest_of_the_reply() {
    let radio = FakeRadio::new();
    radio.set_auto_confirm(false);
    let rig = start(radio, engine_config(), Duration::from_secs(1800));
    let alice = node(ALICE);
    rig.radio.queue_message(alice, 1000, 0, "read 2");

    assert!(wait_until(Duration::from_secs(10), || rig.radio.sent().len() == 1).await);
    rig.radio.confirm_last();
    assert!(wait_until(Duration::from_secs(1), || rig.radio.sent().len() == 2).await);

    // Chunk 2 of 5 is in flight.
    rig.radio.queue_message(alice, 1001, 0, " STOP ");
    tokio::time::sleep(Duration::from_millis(500)).await;
    rig.radio.confirm_last();
    tokio::time::sleep(Duration::from_secs(20)).await;

    let chunks = distinct(texts_to(&rig.radio, alice));
    assert_eq!(chunks.len(), 2, "only the first two chunks go out: {:?}", chunks);
    // The keyword is handled by the transport, not the board.
    assert_eq!(rig.board.seen().len(), 1);

    // The session survives and takes new commands.
    rig.radio.set_auto_confirm(true);
    rig.radio.queue_message(alice, 1002, 0, "who");
    assert!(wait_until(Duration::from_secs(10), || texts_to(&rig.radio, alice).contains(&"ok: who".to_string())).await);
    assert!(!rig.board.seen()[1].fresh_session);
}

#[tokio::test(start_paused = true)]
async fn credential_packets_go_to_the_authenticator() {
    let rig = rig();
    let bob = node(BOB);
    rig.radio.queue_message(bob, 2000, 1, "hunter2");

    assert!(wait_until(Duration::from_secs(10), || texts_to(&rig.radio, bob) == vec!["Welcome back."]).await);
    assert!(rig.board.seen().is_empty());
    let logins = rig.board.logins.lock().unwrap().clone();
    assert_eq!(logins.len(), 1);
    assert_eq!(logins[0].kind, PayloadKind::Credential);
    assert_eq!(logins[0].text, "hunter2");
}

#[tokio::test(start_paused = true)]
async fn processor_failure_is_reported_generically() {
    let rig = rig();
    let alice = node(ALICE);
    rig.radio.queue_message(alice, 1000, 0, "boom");

    assert!(wait_until(Duration::from_secs(10), || !texts_to(&rig.radio, alice).is_empty()).await);
    let texts = texts_to(&rig.radio, alice);
    assert_eq!(texts, vec![PROCESSING_ERROR_TEXT.to_string()]);
    assert!(!texts[0].contains("offline"));
}

#[tokio::test(start_paused = true)]
async fn unacknowledged_delivery_tears_the_session_down() {
    let radio = FakeRadio::new();
    radio.set_auto_confirm(false);
    let rig = start(radio, engine_config(), Duration::from_secs(1800));
    let alice = node(ALICE);
    rig.radio.queue_message(alice, 1000, 0, "who");

    assert!(wait_until(Duration::from_secs(10), || rig.registry.binding(&alice).is_some()).await);
    let first = rig.registry.binding(&alice).map(|b| b.session).unwrap();
    assert!(wait_until(Duration::from_secs(60), || rig.registry.binding(&alice).is_none()).await);

    // One transmission plus two retries, attempt numbers counting up.
    let attempts: Vec<u8> = rig.radio.sent().iter().map(|s| s.attempt).collect();
    assert_eq!(attempts, vec![0, 1, 2]);
    assert!(!rig.sessions.is_active(&first));
    assert_eq!(rig.sessions.active_count(), 0);

    // The next unit from the node starts over.
    rig.radio.set_auto_confirm(true);
    rig.radio.queue_message(alice, 1100, 0, "hello?");
    assert!(wait_until(Duration::from_secs(10), || rig.board.seen().len() == 2).await);
    let second = &rig.board.seen()[1];
    assert!(second.fresh_session);
    assert_ne!(second.session, first);
    assert!(wait_until(Duration::from_secs(10), || texts_to(&rig.radio, alice).contains(&"ok: hello?".to_string())).await);
}

#[tokio::test(start_paused = true)]
async fn silent_contact_is_flooded_with_the_original_timestamp() {
    let radio = FakeRadio::new();
    radio.set_auto_confirm(false);
    radio.add_contact(0xa1, 1, "Alice", 100);
    let rig = start(radio, engine_config(), Duration::from_secs(1800));
    let alice = contact_node(0xa1);
    assert_eq!(alice, node(ALICE));
    rig.radio.queue_message(alice, 1000, 0, "who");

    assert!(wait_until(Duration::from_secs(10), || rig.registry.binding(&alice).is_some()).await);
    assert!(wait_until(Duration::from_secs(60), || rig.registry.binding(&alice).is_none()).await);

    let sent = rig.radio.sent();
    let floods: Vec<bool> = sent.iter().map(|s| s.flood).collect();
    assert_eq!(floods, vec![false, false, true]);
    assert!(sent.iter().all(|s| s.timestamp == sent[0].timestamp));
    assert_eq!(
        rig.radio.commands().iter().filter(|c| **c == CMD_RESET_PATH).count(),
        1
    );
}

#[tokio::test(start_paused = true)]
async fn idle_session_gets_a_farewell() {
    let rig = start(FakeRadio::new(), engine_config(), Duration::from_secs(60));
    let alice = node(ALICE);
    rig.radio.queue_message(alice, 1000, 0, "who");
    assert!(wait_until(Duration::from_secs(10), || !texts_to(&rig.radio, alice).is_empty()).await);

    tokio::time::sleep(Duration::from_secs(61)).await;
    assert!(wait_until(Duration::from_secs(20), || {
        texts_to(&rig.radio, alice).contains(&INACTIVITY_TEXT.to_string())
    })
    .await);
    assert!(rig.registry.binding(&alice).is_none());
    assert_eq!(rig.sessions.active_count(), 0);
}

#[tokio::test(start_paused = true)]
async fn logout_releases_every_node_of_the_session() {
    let rig = rig();
    let alice = node(ALICE);
    let bob = node(BOB);
    rig.radio.queue_message(alice, 1000, 0, "who");
    assert!(wait_until(Duration::from_secs(10), || rig.registry.binding(&alice).is_some()).await);
    let session = rig.registry.binding(&alice).map(|b| b.session).unwrap();
    rig.registry.bind(bob, session.clone());
    assert_eq!(rig.registry.nodes_for(&session).len(), 2);

    rig.engine.logout(session.clone());
    assert!(wait_until(Duration::from_secs(5), || rig.registry.binding_count() == 0).await);
    assert!(!rig.sessions.is_active(&session));

    // Output for a session that no longer exists goes nowhere.
    let before = rig.radio.sent().len();
    rig.engine.deliver(OutboundEnvelope::text(session, "late"));
    tokio::time::sleep(Duration::from_secs(5)).await;
    assert_eq!(rig.radio.sent().len(), before);
}

#[tokio::test(start_paused = true)]
async fn fatal_link_failure_stops_the_engine() {
    let radio = FakeRadio::new();
    radio.refuse_connects(u32::MAX);
    let rig = start(radio, engine_config(), Duration::from_secs(1800));
    let result = tokio::time::timeout(Duration::from_secs(120), rig.task)
        .await
        .expect("engine stops")
        .unwrap();
    assert!(matches!(result, Err(TransportError::Fatal { attempts: 3, .. })), "{:?}", result);
}

#[tokio::test(start_paused = true)]
async fn node_directory_is_saved_on_shutdown() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("nodes.json");
    let mut cfg = engine_config();
    cfg.node_cache = Some(path.clone());
    let rig = start(FakeRadio::new(), cfg, Duration::from_secs(1800));

    let mut advert = vec![PUSH_NEW_ADVERT];
    let key: Vec<u8> = (0..32u8).map(|i| 0x10 + i).collect();
    advert.extend_from_slice(&key);
    advert.extend_from_slice(&[1, 0, 0xff]);
    advert.extend(std::iter::repeat(0).take(64));
    let mut name = b"Ridge Repeater".to_vec();
    name.resize(32, 0);
    advert.extend_from_slice(&name);
    advert.extend_from_slice(&1_700_000_000u32.to_le_bytes());

    // Wait for the handshake before pushing.
    assert!(wait_until(Duration::from_secs(5), || rig.radio.connects() == 1).await);
    tokio::time::sleep(Duration::from_secs(1)).await;
    rig.radio.push_raw(common::device_frame(&advert));
    let advertised = NodeId::from_public_key(&key).unwrap();
    assert!(wait_until(Duration::from_secs(5), || {
        rig.registry.with_directory_mut(|d| d.get(&advertised).is_some())
    })
    .await);

    rig.engine.shutdown();
    assert!(rig.task.await.unwrap().is_ok());
    let saved = NodeDirectory::load_from_file(&path).unwrap();
    let known = saved.get(&advertised).expect("node persisted");
    assert_eq!(known.name, "Ridge Repeater");
    assert_eq!(known.kind, 1);
}
