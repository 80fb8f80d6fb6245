//! MeshCore companion protocol: command encoding and typed inbound units.
//!
//! Byte 0 of every frame payload is a code. Host commands use small codes,
//! device responses use codes below `0x80` and unsolicited pushes use codes
//! at or above `0x80`. All multi-byte integers are little-endian.
//!
//! Inbound frames decode into one [`InboundUnit`] variant each; the link
//! classifies units with [`InboundUnit::category`] in a single place rather
//! than dispatching through per-event callbacks.
use std::time::Duration;

use crate::error::FramingError;
use crate::meshcore::{AckCode, NodeId, NODE_PREFIX_LEN};

pub mod codes {
    pub const CMD_APP_START: u8 = 1;
    pub const CMD_SEND_TXT_MSG: u8 = 2;
    pub const CMD_GET_CONTACTS: u8 = 4;
    pub const CMD_GET_DEVICE_TIME: u8 = 5;
    pub const CMD_SET_DEVICE_TIME: u8 = 6;
    pub const CMD_SEND_SELF_ADVERT: u8 = 7;
    pub const CMD_SET_ADVERT_NAME: u8 = 8;
    pub const CMD_ADD_UPDATE_CONTACT: u8 = 9;
    pub const CMD_SYNC_NEXT_MESSAGE: u8 = 10;
    pub const CMD_RESET_PATH: u8 = 13;
    pub const CMD_REMOVE_CONTACT: u8 = 15;
    pub const CMD_DEVICE_QUERY: u8 = 22;
    pub const CMD_SET_OTHER_PARAMS: u8 = 38;

    pub const RESP_OK: u8 = 0;
    pub const RESP_ERR: u8 = 1;
    pub const RESP_CONTACTS_START: u8 = 2;
    pub const RESP_CONTACT: u8 = 3;
    pub const RESP_END_OF_CONTACTS: u8 = 4;
    pub const RESP_SELF_INFO: u8 = 5;
    pub const RESP_SENT: u8 = 6;
    pub const RESP_CONTACT_MSG_RECV: u8 = 7;
    pub const RESP_CURR_TIME: u8 = 9;
    pub const RESP_NO_MORE_MESSAGES: u8 = 10;
    pub const RESP_DEVICE_INFO: u8 = 13;
    pub const RESP_CONTACT_MSG_RECV_V3: u8 = 16;

    pub const PUSH_ADVERT: u8 = 0x80;
    pub const PUSH_PATH_UPDATED: u8 = 0x81;
    pub const PUSH_SEND_CONFIRMED: u8 = 0x82;
    pub const PUSH_MSG_WAITING: u8 = 0x83;
    pub const PUSH_NEW_ADVERT: u8 = 0x8A;
}

use codes::*;

/// Bytes a `SendText` command spends before the text itself
/// (code, text type, attempt, timestamp, destination prefix).
pub const SEND_TEXT_OVERHEAD: usize = 1 + 1 + 1 + 4 + NODE_PREFIX_LEN;

pub const PUBLIC_KEY_LEN: usize = 32;
const SIGNATURE_LEN: usize = 4;
const CONTACT_PATH_LEN: usize = 64;
const CONTACT_NAME_LEN: usize = 32;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TextType {
    /// Ordinary chat text.
    Plain,
    /// Command-line data; carries credential submissions.
    CliData,
    /// Chat text preceded by a 4-byte signature.
    SignedPlain,
    Other(u8),
}

impl TextType {
    pub fn from_u8(v: u8) -> Self {
        match v {
            0 => TextType::Plain,
            1 => TextType::CliData,
            2 => TextType::SignedPlain,
            other => TextType::Other(other),
        }
    }

    pub fn as_u8(self) -> u8 {
        match self {
            TextType::Plain => 0,
            TextType::CliData => 1,
            TextType::SignedPlain => 2,
            TextType::Other(v) => v,
        }
    }
}

/// Host → device commands.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    AppStart { app_version: u8, app_name: String },
    DeviceQuery { app_target_version: u8 },
    SendText {
        text_type: TextType,
        attempt: u8,
        timestamp: u32,
        destination: NodeId,
        text: String,
    },
    GetContacts { since: Option<u32> },
    GetDeviceTime,
    SetDeviceTime { epoch_secs: u32 },
    SendSelfAdvert { flood: bool },
    SetAdvertName { name: String },
    SyncNextMessage,
    /// Write a contact into the device's table, replacing any entry with
    /// the same key.
    AddUpdateContact(ContactRecord),
    RemoveContact { public_key: Vec<u8> },
    /// Forget the learned route so the next send to this contact floods.
    ResetPath { public_key: Vec<u8> },
    /// With manual add on, the device reports unknown advertisers as
    /// `NewAdvert` instead of storing them.
    SetManualAddContacts(bool),
}

impl Command {
    pub fn code(&self) -> u8 {
        match self {
            Command::AppStart { .. } => CMD_APP_START,
            Command::DeviceQuery { .. } => CMD_DEVICE_QUERY,
            Command::SendText { .. } => CMD_SEND_TXT_MSG,
            Command::GetContacts { .. } => CMD_GET_CONTACTS,
            Command::GetDeviceTime => CMD_GET_DEVICE_TIME,
            Command::SetDeviceTime { .. } => CMD_SET_DEVICE_TIME,
            Command::SendSelfAdvert { .. } => CMD_SEND_SELF_ADVERT,
            Command::SetAdvertName { .. } => CMD_SET_ADVERT_NAME,
            Command::SyncNextMessage => CMD_SYNC_NEXT_MESSAGE,
            Command::AddUpdateContact(_) => CMD_ADD_UPDATE_CONTACT,
            Command::RemoveContact { .. } => CMD_REMOVE_CONTACT,
            Command::ResetPath { .. } => CMD_RESET_PATH,
            Command::SetManualAddContacts(_) => CMD_SET_OTHER_PARAMS,
        }
    }

    /// Short name for logs and error messages.
    pub fn name(&self) -> &'static str {
        match self {
            Command::AppStart { .. } => "app start",
            Command::DeviceQuery { .. } => "device query",
            Command::SendText { .. } => "send text",
            Command::GetContacts { .. } => "get contacts",
            Command::GetDeviceTime => "get device time",
            Command::SetDeviceTime { .. } => "set device time",
            Command::SendSelfAdvert { .. } => "self advert",
            Command::SetAdvertName { .. } => "set advert name",
            Command::SyncNextMessage => "sync next message",
            Command::AddUpdateContact(_) => "add contact",
            Command::RemoveContact { .. } => "remove contact",
            Command::ResetPath { .. } => "reset path",
            Command::SetManualAddContacts(_) => "set other params",
        }
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut out = vec![self.code()];
        match self {
            Command::AppStart { app_version, app_name } => {
                out.push(*app_version);
                out.extend_from_slice(&[b' '; 6]);
                out.extend_from_slice(app_name.as_bytes());
            }
            Command::DeviceQuery { app_target_version } => out.push(*app_target_version),
            Command::SendText {
                text_type,
                attempt,
                timestamp,
                destination,
                text,
            } => {
                out.push(text_type.as_u8());
                out.push(*attempt);
                out.extend_from_slice(&timestamp.to_le_bytes());
                out.extend_from_slice(destination.as_bytes());
                out.extend_from_slice(text.as_bytes());
            }
            Command::GetContacts { since } => {
                if let Some(since) = since {
                    out.extend_from_slice(&since.to_le_bytes());
                }
            }
            Command::SetDeviceTime { epoch_secs } => out.extend_from_slice(&epoch_secs.to_le_bytes()),
            Command::SendSelfAdvert { flood } => {
                if *flood {
                    out.push(1);
                }
            }
            Command::SetAdvertName { name } => out.extend_from_slice(name.as_bytes()),
            Command::AddUpdateContact(rec) => {
                out.extend_from_slice(&fixed(&rec.public_key, PUBLIC_KEY_LEN));
                out.push(rec.kind);
                out.push(rec.flags);
                out.push(rec.out_path_len as u8);
                out.extend_from_slice(&fixed(&rec.out_path, CONTACT_PATH_LEN));
                out.extend_from_slice(&fixed(rec.name.as_bytes(), CONTACT_NAME_LEN));
                out.extend_from_slice(&rec.last_advert.to_le_bytes());
            }
            Command::RemoveContact { public_key } | Command::ResetPath { public_key } => {
                out.extend_from_slice(&fixed(public_key, PUBLIC_KEY_LEN))
            }
            Command::SetManualAddContacts(on) => out.push(u8::from(*on)),
            Command::GetDeviceTime | Command::SyncNextMessage => {}
        }
        out
    }
}

/// A direct text message retrieved from the device.
#[derive(Debug, Clone, PartialEq)]
pub struct ContactMessage {
    pub origin: NodeId,
    /// Hops travelled; 0xff means the message was flooded.
    pub path_len: u8,
    pub text_type: TextType,
    pub sender_timestamp: u32,
    pub text: String,
    /// Signal-to-noise ratio in dB (newer firmware only).
    pub snr: Option<f32>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct SelfInfo {
    pub advert_type: u8,
    pub tx_power: u8,
    pub max_tx_power: u8,
    pub public_key: Vec<u8>,
    pub name: String,
}

#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize)]
pub struct DeviceInfo {
    pub firmware_version: u8,
    pub max_contacts: Option<u16>,
    pub firmware_build: String,
    pub model: String,
    pub version: String,
}

/// A contact table entry, as sent for contact listings and new adverts.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContactRecord {
    pub public_key: Vec<u8>,
    pub node: NodeId,
    pub kind: u8,
    pub flags: u8,
    /// Hops on the learned route; -1 when no route is known.
    pub out_path_len: i8,
    pub out_path: Vec<u8>,
    pub name: String,
    pub last_advert: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SentReceipt {
    pub flood: bool,
    pub ack: AckCode,
    pub suggested_timeout: Duration,
}

/// One decoded device → host frame.
#[derive(Debug, Clone, PartialEq)]
pub enum InboundUnit {
    Ok,
    Error { code: Option<u8> },
    ContactsStart { count: u32 },
    Contact(ContactRecord),
    EndOfContacts,
    SelfInfo(SelfInfo),
    Sent(SentReceipt),
    Message(ContactMessage),
    CurrentTime(u32),
    NoMoreMessages,
    DeviceInfo(DeviceInfo),
    Advert { node: NodeId, public_key: Vec<u8> },
    NewAdvert(ContactRecord),
    PathUpdated { node: NodeId },
    SendConfirmed { ack: AckCode, round_trip: Duration },
    MessageWaiting,
    Unknown { code: u8, len: usize },
}

/// Coarse classification used by the link's single dispatch step.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnitCategory {
    Message,
    Advert,
    DeliveryConfirmation,
    Error,
    /// Command answers and bookkeeping pushes.
    Control,
}

impl InboundUnit {
    pub fn decode(payload: &[u8]) -> Result<Self, FramingError> {
        let Some((&code, body)) = payload.split_first() else {
            return Err(FramingError::Empty);
        };
        let mut f = Fields { data: body, pos: 0, code };
        let unit = match code {
            RESP_OK => InboundUnit::Ok,
            RESP_ERR => InboundUnit::Error { code: body.first().copied() },
            RESP_CONTACTS_START => InboundUnit::ContactsStart {
                count: f.u32().unwrap_or(0),
            },
            RESP_CONTACT => InboundUnit::Contact(decode_contact(&mut f)?),
            RESP_END_OF_CONTACTS => InboundUnit::EndOfContacts,
            RESP_SELF_INFO => {
                let advert_type = f.u8()?;
                let tx_power = f.u8()?;
                let max_tx_power = f.u8()?;
                let public_key = f.take(PUBLIC_KEY_LEN)?.to_vec();
                // lat, lon, flag bytes, radio params
                let name = if f.skip(4 + 4 + 4 + 4 + 4 + 2).is_ok() {
                    c_string(f.rest())
                } else {
                    String::new()
                };
                InboundUnit::SelfInfo(SelfInfo {
                    advert_type,
                    tx_power,
                    max_tx_power,
                    public_key,
                    name,
                })
            }
            RESP_SENT => {
                let flood = f.u8()? == 1;
                let ack = AckCode(f.array()?);
                let suggested_timeout = Duration::from_millis(u64::from(f.u32()?));
                InboundUnit::Sent(SentReceipt {
                    flood,
                    ack,
                    suggested_timeout,
                })
            }
            RESP_CONTACT_MSG_RECV => InboundUnit::Message(decode_message(&mut f, None)?),
            RESP_CONTACT_MSG_RECV_V3 => {
                let snr = f.u8()? as i8;
                f.skip(2)?;
                InboundUnit::Message(decode_message(&mut f, Some(f32::from(snr) / 4.0))?)
            }
            RESP_CURR_TIME => InboundUnit::CurrentTime(f.u32()?),
            RESP_NO_MORE_MESSAGES => InboundUnit::NoMoreMessages,
            RESP_DEVICE_INFO => {
                let firmware_version = f.u8()?;
                let mut info = DeviceInfo {
                    firmware_version,
                    max_contacts: None,
                    firmware_build: String::new(),
                    model: String::new(),
                    version: String::new(),
                };
                if firmware_version >= 3 {
                    if let Ok(max) = f.u8() {
                        info.max_contacts = Some(u16::from(max) * 2);
                    }
                    // max channels, ble pin
                    if f.skip(1 + 4).is_ok() {
                        info.firmware_build = f.take(12).map(c_string).unwrap_or_default();
                        info.model = f.take(40).map(c_string).unwrap_or_default();
                        info.version = f.take(20).map(c_string).unwrap_or_default();
                    }
                }
                InboundUnit::DeviceInfo(info)
            }
            PUSH_ADVERT => {
                let key = f.take(PUBLIC_KEY_LEN)?;
                InboundUnit::Advert {
                    node: node_from_key(key, code)?,
                    public_key: key.to_vec(),
                }
            }
            PUSH_NEW_ADVERT => InboundUnit::NewAdvert(decode_contact(&mut f)?),
            PUSH_PATH_UPDATED => InboundUnit::PathUpdated {
                node: node_from_key(f.take(PUBLIC_KEY_LEN)?, code)?,
            },
            PUSH_SEND_CONFIRMED => {
                let ack = AckCode(f.array()?);
                let round_trip = Duration::from_millis(u64::from(f.u32().unwrap_or(0)));
                InboundUnit::SendConfirmed { ack, round_trip }
            }
            PUSH_MSG_WAITING => InboundUnit::MessageWaiting,
            other => InboundUnit::Unknown {
                code: other,
                len: payload.len(),
            },
        };
        Ok(unit)
    }

    /// Unsolicited frames do not answer a pending command.
    pub fn is_push(&self) -> bool {
        match self {
            InboundUnit::Unknown { code, .. } => *code >= 0x80,
            InboundUnit::Advert { .. }
            | InboundUnit::NewAdvert(_)
            | InboundUnit::PathUpdated { .. }
            | InboundUnit::SendConfirmed { .. }
            | InboundUnit::MessageWaiting => true,
            _ => false,
        }
    }

    /// Whether this unit can be the device's answer to command `code`.
    /// An error answers anything.
    pub fn answers(&self, code: u8) -> bool {
        match self {
            InboundUnit::Error { .. } => true,
            InboundUnit::Ok => matches!(
                code,
                CMD_SET_DEVICE_TIME
                    | CMD_SEND_SELF_ADVERT
                    | CMD_SET_ADVERT_NAME
                    | CMD_ADD_UPDATE_CONTACT
                    | CMD_REMOVE_CONTACT
                    | CMD_RESET_PATH
                    | CMD_SET_OTHER_PARAMS
            ),
            InboundUnit::SelfInfo(_) => code == CMD_APP_START,
            InboundUnit::DeviceInfo(_) => code == CMD_DEVICE_QUERY,
            InboundUnit::Sent(_) => code == CMD_SEND_TXT_MSG,
            InboundUnit::CurrentTime(_) => code == CMD_GET_DEVICE_TIME,
            InboundUnit::Message(_) | InboundUnit::NoMoreMessages => code == CMD_SYNC_NEXT_MESSAGE,
            InboundUnit::EndOfContacts => code == CMD_GET_CONTACTS,
            _ => false,
        }
    }

    pub fn category(&self) -> UnitCategory {
        match self {
            InboundUnit::Message(_) => UnitCategory::Message,
            InboundUnit::Advert { .. } | InboundUnit::NewAdvert(_) => UnitCategory::Advert,
            InboundUnit::SendConfirmed { .. } => UnitCategory::DeliveryConfirmation,
            InboundUnit::Error { .. } => UnitCategory::Error,
            _ => UnitCategory::Control,
        }
    }
}

fn decode_message(f: &mut Fields<'_>, snr: Option<f32>) -> Result<ContactMessage, FramingError> {
    let origin = NodeId::new(f.array()?);
    let path_len = f.u8()?;
    let text_type = TextType::from_u8(f.u8()?);
    let sender_timestamp = f.u32()?;
    if text_type == TextType::SignedPlain {
        f.skip(SIGNATURE_LEN)?;
    }
    let text = String::from_utf8_lossy(f.rest())
        .trim_end_matches('\0')
        .to_string();
    Ok(ContactMessage {
        origin,
        path_len,
        text_type,
        sender_timestamp,
        text,
        snr,
    })
}

fn decode_contact(f: &mut Fields<'_>) -> Result<ContactRecord, FramingError> {
    let key = f.take(PUBLIC_KEY_LEN)?;
    let node = node_from_key(key, f.code)?;
    let kind = f.u8()?;
    let flags = f.u8()?;
    let out_path_len = f.u8()? as i8;
    let path = f.take(CONTACT_PATH_LEN)?;
    let hops = usize::try_from(out_path_len).unwrap_or(0).min(CONTACT_PATH_LEN);
    let out_path = path[..hops].to_vec();
    let name = c_string(f.take(CONTACT_NAME_LEN)?);
    let last_advert = f.u32().unwrap_or(0);
    Ok(ContactRecord {
        public_key: key.to_vec(),
        node,
        kind,
        flags,
        out_path_len,
        out_path,
        name,
        last_advert,
    })
}

fn node_from_key(key: &[u8], code: u8) -> Result<NodeId, FramingError> {
    NodeId::from_public_key(key).ok_or(FramingError::Truncated { code, len: key.len() })
}

/// `data` cut or zero-padded to exactly `width` bytes.
fn fixed(data: &[u8], width: usize) -> Vec<u8> {
    let mut out = data[..data.len().min(width)].to_vec();
    out.resize(width, 0);
    out
}

/// NUL-padded fixed-width string field.
fn c_string(raw: &[u8]) -> String {
    let end = raw.iter().position(|&b| b == 0).unwrap_or(raw.len());
    String::from_utf8_lossy(&raw[..end]).trim().to_string()
}

struct Fields<'a> {
    data: &'a [u8],
    pos: usize,
    code: u8,
}

impl<'a> Fields<'a> {
    fn truncated(&self) -> FramingError {
        FramingError::Truncated {
            code: self.code,
            len: self.data.len() + 1,
        }
    }

    fn take(&mut self, n: usize) -> Result<&'a [u8], FramingError> {
        let end = self.pos + n;
        let data: &'a [u8] = self.data;
        let slice = data.get(self.pos..end).ok_or_else(|| self.truncated())?;
        self.pos = end;
        Ok(slice)
    }

    fn skip(&mut self, n: usize) -> Result<(), FramingError> {
        self.take(n).map(|_| ())
    }

    fn u8(&mut self) -> Result<u8, FramingError> {
        Ok(self.take(1)?[0])
    }

    fn u32(&mut self) -> Result<u32, FramingError> {
        Ok(u32::from_le_bytes(self.array()?))
    }

    fn array<const N: usize>(&mut self) -> Result<[u8; N], FramingError> {
        let slice = self.take(N)?;
        let mut out = [0u8; N];
        out.copy_from_slice(slice);
        Ok(out)
    }

    fn rest(&mut self) -> &'a [u8] {
        let data: &'a [u8] = self.data;
        let rest = data.get(self.pos..).unwrap_or(&[]);
        self.pos = self.data.len();
        rest
    }
}
