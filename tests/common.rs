//! Test utilities & fixtures.
//! Provides a scripted companion radio that speaks the framed serial
//! protocol over in-memory channels, so link and engine tests run without
//! hardware.
#![allow(dead_code)]

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use bytes::Bytes;
use tokio::sync::mpsc;

use meshcitadel::error::TransportError;
use meshcitadel::meshcore::framer::{encode_frame, Decoded, Direction, FrameDecoder, MAX_FRAME_PAYLOAD};
use meshcitadel::meshcore::protocol::codes::*;
use meshcitadel::meshcore::{AckCode, Connector, LinkConfig, LinkEvent, LinkIo, NodeId};
use meshcitadel::config::MeshCoreConfig;

pub const RADIO_NAME: &str = "Citadel Radio";

#[derive(Clone, Debug, PartialEq)]
pub struct SentText {
    pub destination: NodeId,
    pub attempt: u8,
    pub text: String,
    pub timestamp: u32,
    /// Sent after the route to this destination was reset.
    pub flood: bool,
    pub ack: AckCode,
}

#[derive(Default)]
pub struct RadioState {
    /// Encoded message payloads waiting for `SyncNextMessage`.
    pub inbox: VecDeque<Vec<u8>>,
    pub sent: Vec<SentText>,
    /// Command codes in the order they arrived.
    pub commands: Vec<u8>,
    /// Push a confirmation right after each `Sent`.
    pub auto_confirm: bool,
    /// Ignore every command (a wedged device).
    pub silent: bool,
    /// Command codes answered with ERR.
    pub reject: Vec<u8>,
    /// Reject this many further connection attempts.
    pub refuse_connects: u32,
    pub connects: u32,
    /// Contact table entries in the listing layout (key first).
    pub contacts: Vec<Vec<u8>>,
    /// Destinations whose route was reset.
    pub flooding: Vec<NodeId>,
    pub manual_add: bool,
    /// Command codes whose next answer is cut to two bytes.
    pub truncate: Vec<u8>,
    next_ack: u32,
    live: Option<mpsc::UnboundedSender<std::io::Result<Vec<u8>>>>,
}

#[derive(Clone)]
pub struct FakeRadio {
    pub state: Arc<Mutex<RadioState>>,
}

impl FakeRadio {
    pub fn new() -> Self {
        let state = RadioState {
            auto_confirm: true,
            ..Default::default()
        };
        Self {
            state: Arc::new(Mutex::new(state)),
        }
    }

    /// Queue a direct message and tell the host it is waiting.
    pub fn queue_message(&self, from: NodeId, timestamp: u32, text_type: u8, text: &str) {
        let mut payload = vec![RESP_CONTACT_MSG_RECV_V3, 24, 0, 0];
        payload.extend_from_slice(from.as_bytes());
        payload.push(1); // path length
        payload.push(text_type);
        payload.extend_from_slice(&timestamp.to_le_bytes());
        payload.extend_from_slice(text.as_bytes());
        let mut st = self.state.lock().unwrap();
        st.inbox.push_back(payload);
        if let Some(live) = &st.live {
            let _ = live.send(Ok(device_frame(&[PUSH_MSG_WAITING])));
        }
    }

    /// Confirm the most recent transmission.
    pub fn confirm_last(&self) {
        let st = self.state.lock().unwrap();
        if let (Some(last), Some(live)) = (st.sent.last(), &st.live) {
            let _ = live.send(Ok(device_frame(&confirmation(last.ack))));
        }
    }

    pub fn push_raw(&self, bytes: Vec<u8>) {
        let st = self.state.lock().unwrap();
        if let Some(live) = &st.live {
            let _ = live.send(Ok(bytes));
        }
    }

    pub fn set_auto_confirm(&self, on: bool) {
        self.state.lock().unwrap().auto_confirm = on;
    }

    pub fn set_silent(&self, on: bool) {
        self.state.lock().unwrap().silent = on;
    }

    pub fn reject(&self, code: u8) {
        self.state.lock().unwrap().reject.push(code);
    }

    /// Cut the next answer to `code` short, as a garbled serial line would.
    pub fn truncate_reply(&self, code: u8) {
        self.state.lock().unwrap().truncate.push(code);
    }

    pub fn add_contact(&self, tag: u8, kind: u8, name: &str, last_advert: u32) {
        self.state
            .lock()
            .unwrap()
            .contacts
            .push(contact_body(tag, kind, name, last_advert));
    }

    pub fn contact_nodes(&self) -> Vec<NodeId> {
        let st = self.state.lock().unwrap();
        st.contacts.iter().map(|c| NodeId::from_public_key(c).unwrap()).collect()
    }

    pub fn manual_add(&self) -> bool {
        self.state.lock().unwrap().manual_add
    }

    /// Report an advertiser the device does not hold.
    pub fn push_new_advert(&self, tag: u8, kind: u8, name: &str, last_advert: u32) {
        let mut payload = vec![PUSH_NEW_ADVERT];
        payload.extend(contact_body(tag, kind, name, last_advert));
        self.push_raw(device_frame(&payload));
    }

    pub fn refuse_connects(&self, n: u32) {
        self.state.lock().unwrap().refuse_connects = n;
    }

    pub fn sent(&self) -> Vec<SentText> {
        self.state.lock().unwrap().sent.clone()
    }

    pub fn sent_texts(&self) -> Vec<String> {
        self.sent().into_iter().map(|s| s.text).collect()
    }

    pub fn commands(&self) -> Vec<u8> {
        self.state.lock().unwrap().commands.clone()
    }

    pub fn connects(&self) -> u32 {
        self.state.lock().unwrap().connects
    }
}

impl Connector for FakeRadio {
    async fn connect(&mut self) -> Result<LinkIo, TransportError> {
        let (in_tx, incoming) = mpsc::unbounded_channel();
        let (outgoing, mut out_rx) = mpsc::unbounded_channel::<Bytes>();
        {
            let mut st = self.state.lock().unwrap();
            st.connects += 1;
            if st.refuse_connects > 0 {
                st.refuse_connects -= 1;
                return Err(TransportError::Link("no such device".into()));
            }
            st.live = Some(in_tx.clone());
        }

        let state = self.state.clone();
        tokio::spawn(async move {
            let mut decoder = FrameDecoder::new(Direction::ToDevice, MAX_FRAME_PAYLOAD);
            while let Some(bytes) = out_rx.recv().await {
                decoder.push(&bytes);
                while let Ok(Decoded::Frame(frame)) = decoder.decode() {
                    for reply in respond(&state, &frame) {
                        let _ = in_tx.send(Ok(device_frame(&reply)));
                    }
                }
            }
        });
        Ok(LinkIo { incoming, outgoing })
    }
}

fn respond(state: &Arc<Mutex<RadioState>>, frame: &[u8]) -> Vec<Vec<u8>> {
    let mut st = state.lock().unwrap();
    let code = frame[0];
    st.commands.push(code);
    if st.silent {
        return Vec::new();
    }
    if st.reject.contains(&code) {
        return vec![vec![RESP_ERR, 2]];
    }
    let mut replies = answer(&mut st, frame);
    if let Some(at) = st.truncate.iter().position(|&c| c == code) {
        st.truncate.remove(at);
        if let Some(first) = replies.first_mut() {
            first.truncate(2);
        }
    }
    replies
}

fn answer(st: &mut RadioState, frame: &[u8]) -> Vec<Vec<u8>> {
    let code = frame[0];
    match code {
        CMD_APP_START => vec![self_info()],
        CMD_DEVICE_QUERY => vec![device_info()],
        CMD_SET_DEVICE_TIME | CMD_SET_ADVERT_NAME | CMD_SEND_SELF_ADVERT => vec![vec![RESP_OK]],
        CMD_GET_CONTACTS => {
            let mut start = vec![RESP_CONTACTS_START];
            start.extend_from_slice(&(st.contacts.len() as u32).to_le_bytes());
            let mut out = vec![start];
            for body in &st.contacts {
                let mut rec = vec![RESP_CONTACT];
                rec.extend_from_slice(body);
                out.push(rec);
            }
            out.push(vec![RESP_END_OF_CONTACTS]);
            out
        }
        CMD_ADD_UPDATE_CONTACT => {
            let body = frame[1..].to_vec();
            st.contacts.retain(|c| c[..32] != body[..32]);
            st.contacts.push(body);
            vec![vec![RESP_OK]]
        }
        CMD_REMOVE_CONTACT => {
            let before = st.contacts.len();
            st.contacts.retain(|c| c[..32] != frame[1..33]);
            if st.contacts.len() < before {
                vec![vec![RESP_OK]]
            } else {
                vec![vec![RESP_ERR, 2]]
            }
        }
        CMD_RESET_PATH => {
            if st.contacts.iter().any(|c| c[..32] == frame[1..33]) {
                let node = NodeId::from_public_key(&frame[1..33]).unwrap();
                st.flooding.push(node);
                vec![vec![RESP_OK]]
            } else {
                vec![vec![RESP_ERR, 2]]
            }
        }
        CMD_SET_OTHER_PARAMS => {
            st.manual_add = frame[1] == 1;
            vec![vec![RESP_OK]]
        }
        CMD_GET_DEVICE_TIME => {
            let mut out = vec![RESP_CURR_TIME];
            out.extend_from_slice(&1_700_000_000u32.to_le_bytes());
            vec![out]
        }
        CMD_SYNC_NEXT_MESSAGE => match st.inbox.pop_front() {
            Some(msg) => vec![msg],
            None => vec![vec![RESP_NO_MORE_MESSAGES]],
        },
        CMD_SEND_TXT_MSG => {
            let attempt = frame[2];
            let timestamp = u32::from_le_bytes([frame[3], frame[4], frame[5], frame[6]]);
            let mut prefix = [0u8; 6];
            prefix.copy_from_slice(&frame[7..13]);
            let destination = NodeId::new(prefix);
            let text = String::from_utf8_lossy(&frame[13..]).to_string();
            let flood = st.flooding.contains(&destination);
            st.next_ack += 1;
            let ack = AckCode(st.next_ack.to_le_bytes());
            st.sent.push(SentText {
                destination,
                attempt,
                text,
                timestamp,
                flood,
                ack,
            });
            let mut sent = vec![RESP_SENT, u8::from(flood)];
            sent.extend_from_slice(&ack.0);
            sent.extend_from_slice(&3000u32.to_le_bytes());
            let mut out = vec![sent];
            if st.auto_confirm {
                out.push(confirmation(ack));
            }
            out
        }
        _ => vec![vec![RESP_ERR, 1]],
    }
}

fn confirmation(ack: AckCode) -> Vec<u8> {
    let mut out = vec![PUSH_SEND_CONFIRMED];
    out.extend_from_slice(&ack.0);
    out.extend_from_slice(&250u32.to_le_bytes());
    out
}

fn fixed(s: &str, width: usize) -> Vec<u8> {
    let mut out = s.as_bytes().to_vec();
    out.resize(width, 0);
    out
}

/// Contact layout shared by listings, adverts and adds: key, type, flags,
/// path length, path, name, last advert.
pub fn contact_body(tag: u8, kind: u8, name: &str, last_advert: u32) -> Vec<u8> {
    let mut out = vec![tag; 32];
    out.extend_from_slice(&[kind, 0, 0xff]);
    out.extend(std::iter::repeat(0).take(64));
    out.extend(fixed(name, 32));
    out.extend_from_slice(&last_advert.to_le_bytes());
    out
}

/// Node id of a contact built by [`contact_body`].
pub fn contact_node(tag: u8) -> NodeId {
    NodeId::new([tag; 6])
}

fn self_info() -> Vec<u8> {
    let mut out = vec![RESP_SELF_INFO, 1, 22, 30];
    out.extend((0..32u8).map(|i| 0xa0 ^ i));
    out.extend(std::iter::repeat(0).take(22));
    out.extend_from_slice(RADIO_NAME.as_bytes());
    out
}

fn device_info() -> Vec<u8> {
    let mut out = vec![RESP_DEVICE_INFO, 3, 50, 8, 0, 0, 0, 0];
    out.extend(fixed("12 Oct 2025", 12));
    out.extend(fixed("Heltec V3", 40));
    out.extend(fixed("v1.9.1", 20));
    out
}

pub fn device_frame(payload: &[u8]) -> Vec<u8> {
    encode_frame(Direction::FromDevice, payload, MAX_FRAME_PAYLOAD)
        .expect("fixture frame fits")
        .to_vec()
}

pub fn node(hex: &str) -> NodeId {
    hex.parse().expect("node id")
}

/// Link settings scaled down for tests.
pub fn link_config() -> LinkConfig {
    let mut cfg = LinkConfig::from(&MeshCoreConfig::default());
    cfg.handshake_timeout = Duration::from_secs(2);
    cfg.command_timeout = Duration::from_secs(5);
    cfg.watchdog_interval = Duration::from_secs(20);
    cfg.keepalive_interval = Duration::from_secs(5);
    cfg.reconnect_base = Duration::from_secs(1);
    cfg.reconnect_max = Duration::from_secs(4);
    cfg.max_reconnect_attempts = 3;
    cfg.advert_interval = None;
    cfg
}

/// Wait for an event matching `pred`, discarding others.
pub async fn next_event(
    events: &mut mpsc::UnboundedReceiver<LinkEvent>,
    within: Duration,
    mut pred: impl FnMut(&LinkEvent) -> bool,
) -> Option<LinkEvent> {
    tokio::time::timeout(within, async {
        while let Some(event) = events.recv().await {
            if pred(&event) {
                return Some(event);
            }
        }
        None
    })
    .await
    .ok()
    .flatten()
}

/// Poll `cond` until it holds or `within` elapses.
pub async fn wait_until(within: Duration, mut cond: impl FnMut() -> bool) -> bool {
    let deadline = tokio::time::Instant::now() + within;
    loop {
        if cond() {
            return true;
        }
        if tokio::time::Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
}
