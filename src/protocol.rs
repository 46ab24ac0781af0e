//! Wire protocol for broker connections
//!
//! Client-side NSQ frame layer: line-oriented commands out, size-prefixed
//! frames in. Responses carry no correlation id; a connection matches them
//! to pending commands in FIFO order.

use crate::entity::MessageId;
use crate::error::NsqError;
use bytes::{Buf, BufMut, Bytes, BytesMut};
use serde::Deserialize;

/// Protocol magic sent once per connection before any command.
pub const MAGIC_V2: &[u8; 4] = b"  V2";

pub const FRAME_TYPE_RESPONSE: i32 = 0;
pub const FRAME_TYPE_ERROR: i32 = 1;
pub const FRAME_TYPE_MESSAGE: i32 = 2;

/// In-band keepalive from the broker; answered with NOP, consumes no credit.
pub const HEARTBEAT: &[u8] = b"_heartbeat_";
pub const OK: &[u8] = b"OK";
pub const CLOSE_WAIT: &[u8] = b"CLOSE_WAIT";

/// Version byte of the message extension header.
pub const EXT_VERSION: u8 = 1;

/// JSON key carrying the dispatch tag inside the extension header.
pub const EXT_TAG_KEY: &str = "##client_dispatch_tag";

/// Commands sent to a broker.
#[derive(Debug, Clone)]
pub enum Command {
    /// Protocol magic, first bytes on the wire
    Magic,
    /// Identify handshake with serialized JSON body
    Identify(Bytes),
    Subscribe {
        topic: String,
        partition: i32,
        channel: String,
        ordered: bool,
        tag: Option<String>,
    },
    Publish {
        topic: String,
        partition: i32,
        body: Bytes,
        tag: Option<String>,
    },
    /// Grant the broker `n` units of delivery credit
    Rdy(u32),
    /// Acknowledge a message
    Fin(MessageId),
    /// Requeue a message with a delay in milliseconds
    Requeue(MessageId, u64),
    Nop,
    /// Graceful disconnect; broker answers CLOSE_WAIT
    Close,
}

impl Command {
    /// Whether the broker answers this command with a response frame.
    pub fn expects_response(&self) -> bool {
        matches!(
            self,
            Command::Identify(_) | Command::Subscribe { .. } | Command::Publish { .. } | Command::Close
        )
    }

    /// Command verb for diagnostics.
    pub fn name(&self) -> &'static str {
        match self {
            Command::Magic => "MAGIC",
            Command::Identify(_) => "IDENTIFY",
            Command::Subscribe { ordered: false, .. } => "SUB",
            Command::Subscribe { ordered: true, .. } => "SUB_ORDERED",
            Command::Publish { tag: None, .. } => "PUB",
            Command::Publish { tag: Some(_), .. } => "PUB_EXT",
            Command::Rdy(_) => "RDY",
            Command::Fin(_) => "FIN",
            Command::Requeue(..) => "REQ",
            Command::Nop => "NOP",
            Command::Close => "CLS",
        }
    }
}

/// Frames received from a broker.
#[derive(Debug, Clone)]
pub enum Frame {
    Response(Bytes),
    Error(String),
    Message(MessageFrame),
}

/// A decoded message frame.
#[derive(Debug, Clone)]
pub struct MessageFrame {
    pub timestamp: i64,
    pub attempts: u16,
    pub id: MessageId,
    pub tag: Option<String>,
    pub body: Bytes,
}

/// Identify response returned by a feature-negotiating broker.
#[derive(Debug, Clone, Deserialize)]
pub struct IdentifyResponse {
    #[serde(default = "default_max_rdy")]
    pub max_rdy_count: u32,
    #[serde(default)]
    pub extend_support: bool,
}

fn default_max_rdy() -> u32 {
    2500
}

impl Default for IdentifyResponse {
    fn default() -> Self {
        Self {
            max_rdy_count: default_max_rdy(),
            extend_support: false,
        }
    }
}

/// Serialize the extension header for a tagged publish.
fn ext_header(tag: &str) -> Vec<u8> {
    let mut header = serde_json::Map::new();
    header.insert(
        EXT_TAG_KEY.to_string(),
        serde_json::Value::String(tag.to_string()),
    );
    serde_json::to_vec(&serde_json::Value::Object(header)).expect("tag header serializes")
}

/// Parse a tag out of an extension header, tolerating extra keys.
fn parse_ext_header(raw: &[u8]) -> Result<Option<String>, NsqError> {
    if raw.is_empty() {
        return Ok(None);
    }
    let value: serde_json::Value = serde_json::from_slice(raw)
        .map_err(|e| NsqError::protocol(format!("malformed extension header: {}", e)))?;
    Ok(value
        .get(EXT_TAG_KEY)
        .and_then(|v| v.as_str())
        .map(|s| s.to_string()))
}

/// Stateful codec for one broker connection.
///
/// `extended` flips after the identify handshake when the broker echoes
/// extension support; it changes how message frame payloads are parsed.
#[derive(Debug, Default)]
pub struct NsqCodec {
    extended: bool,
}

impl NsqCodec {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_extended(&mut self, extended: bool) {
        self.extended = extended;
    }

    pub fn is_extended(&self) -> bool {
        self.extended
    }

    fn decode_message(&self, mut data: Bytes) -> Result<MessageFrame, NsqError> {
        if data.len() < 26 {
            return Err(NsqError::protocol("message frame too short"));
        }
        let timestamp = data.get_i64();
        let attempts = data.get_u16();
        let mut id = [0u8; 16];
        data.copy_to_slice(&mut id);

        let tag = if self.extended {
            if data.len() < 3 {
                return Err(NsqError::protocol("truncated extension header"));
            }
            let version = data.get_u8();
            if version != EXT_VERSION {
                return Err(NsqError::protocol(format!(
                    "unsupported extension version {}",
                    version
                )));
            }
            let header_len = data.get_u16() as usize;
            if data.len() < header_len {
                return Err(NsqError::protocol("truncated extension header"));
            }
            let header = data.split_to(header_len);
            parse_ext_header(&header)?
        } else {
            None
        };

        Ok(MessageFrame {
            timestamp,
            attempts,
            id: MessageId(id),
            tag,
            body: data,
        })
    }
}

impl tokio_util::codec::Encoder<Command> for NsqCodec {
    type Error = NsqError;

    fn encode(&mut self, item: Command, dst: &mut BytesMut) -> Result<(), Self::Error> {
        match item {
            Command::Magic => dst.put_slice(MAGIC_V2),
            Command::Identify(body) => {
                dst.put_slice(b"IDENTIFY\n");
                dst.put_u32(body.len() as u32);
                dst.put_slice(&body);
            }
            Command::Subscribe {
                topic,
                partition,
                channel,
                ordered,
                tag,
            } => {
                let verb = if ordered { "SUB_ORDERED" } else { "SUB" };
                match tag {
                    Some(tag) => dst.put_slice(
                        format!("{} {} {} {} {}\n", verb, topic, partition, channel, tag).as_bytes(),
                    ),
                    None => dst.put_slice(
                        format!("{} {} {} {}\n", verb, topic, partition, channel).as_bytes(),
                    ),
                }
            }
            Command::Publish {
                topic,
                partition,
                body,
                tag,
            } => match tag {
                Some(tag) => {
                    dst.put_slice(format!("PUB_EXT {} {}\n", topic, partition).as_bytes());
                    let header = ext_header(&tag);
                    let total = 1 + 2 + header.len() + body.len();
                    dst.put_u32(total as u32);
                    dst.put_u8(EXT_VERSION);
                    dst.put_u16(header.len() as u16);
                    dst.put_slice(&header);
                    dst.put_slice(&body);
                }
                None => {
                    dst.put_slice(format!("PUB {} {}\n", topic, partition).as_bytes());
                    dst.put_u32(body.len() as u32);
                    dst.put_slice(&body);
                }
            },
            Command::Rdy(count) => dst.put_slice(format!("RDY {}\n", count).as_bytes()),
            Command::Fin(id) => {
                dst.put_slice(b"FIN ");
                dst.put_slice(id.as_bytes());
                dst.put_u8(b'\n');
            }
            Command::Requeue(id, delay_ms) => {
                dst.put_slice(b"REQ ");
                dst.put_slice(id.as_bytes());
                dst.put_slice(format!(" {}\n", delay_ms).as_bytes());
            }
            Command::Nop => dst.put_slice(b"NOP\n"),
            Command::Close => dst.put_slice(b"CLS\n"),
        }
        Ok(())
    }
}

impl tokio_util::codec::Decoder for NsqCodec {
    type Item = Frame;
    type Error = NsqError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        if src.len() < 4 {
            return Ok(None);
        }
        let size = (&src[0..4]).get_u32() as usize;
        if size < 4 {
            return Err(NsqError::protocol("frame size below frame type width"));
        }
        if src.len() < 4 + size {
            src.reserve(4 + size - src.len());
            return Ok(None);
        }
        src.advance(4);
        let mut payload = src.split_to(size).freeze();
        let frame_type = payload.get_i32();
        match frame_type {
            FRAME_TYPE_RESPONSE => Ok(Some(Frame::Response(payload))),
            FRAME_TYPE_ERROR => Ok(Some(Frame::Error(
                String::from_utf8_lossy(&payload).into_owned(),
            ))),
            FRAME_TYPE_MESSAGE => Ok(Some(Frame::Message(self.decode_message(payload)?))),
            other => Err(NsqError::protocol(format!("unknown frame type {}", other))),
        }
    }
}
