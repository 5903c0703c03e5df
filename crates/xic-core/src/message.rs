//! Message framing.
//!
//! Every message starts with a fixed 8-byte header:
//!
//! ```text
//! ['X']['!'][type][flags][bodySize: i32 BE]
//! ```
//!
//! followed by `bodySize` bytes of codec-encoded payload. Hello and Bye carry
//! no payload. `flags = 1` marks a body sealed by the secure channel.
//!
//! Payload layouts, in order:
//! - Quest: `txid, service, method, context, arguments`
//! - Answer: `txid, status, arguments`
//! - Check: `command, arguments`

use crate::codec::{patch_txid, Arguments, Context, Decoder, Encoder};
use crate::config::ProtocolConfig;
use crate::error::Fault;
use crate::{Result, XicError};
use bytes::{BufMut, Bytes, BytesMut};

/// The five message kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MessageType {
    Quest,
    Answer,
    Hello,
    Bye,
    Check,
}

impl MessageType {
    pub fn as_byte(self) -> u8 {
        match self {
            MessageType::Quest => b'Q',
            MessageType::Answer => b'A',
            MessageType::Hello => b'H',
            MessageType::Bye => b'B',
            MessageType::Check => b'C',
        }
    }

    pub fn from_byte(byte: u8) -> Option<Self> {
        match byte {
            b'Q' => Some(MessageType::Quest),
            b'A' => Some(MessageType::Answer),
            b'H' => Some(MessageType::Hello),
            b'B' => Some(MessageType::Bye),
            b'C' => Some(MessageType::Check),
            _ => None,
        }
    }

    fn carries_body(self) -> bool {
        !matches!(self, MessageType::Hello | MessageType::Bye)
    }
}

/// Fixed message header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Header {
    pub kind: MessageType,
    pub flags: u8,
    pub body_size: u32,
}

impl Header {
    pub const FLAG_SEALED: u8 = 1;

    pub fn new(kind: MessageType, flags: u8, body_size: u32) -> Self {
        Self {
            kind,
            flags,
            body_size,
        }
    }

    pub fn encode(&self) -> [u8; ProtocolConfig::HEADER_SIZE] {
        let size = (self.body_size as i32).to_be_bytes();
        [
            ProtocolConfig::MAGIC,
            ProtocolConfig::VERSION,
            self.kind.as_byte(),
            self.flags,
            size[0],
            size[1],
            size[2],
            size[3],
        ]
    }

    /// Parse and validate a header.
    pub fn parse(buf: &[u8; ProtocolConfig::HEADER_SIZE], max_message_size: usize) -> Result<Self> {
        if buf[0] != ProtocolConfig::MAGIC {
            return Err(XicError::protocol(format!("bad magic {:#04x}", buf[0])));
        }
        if buf[1] != ProtocolConfig::VERSION {
            return Err(XicError::protocol(format!("bad version {:#04x}", buf[1])));
        }
        let kind = MessageType::from_byte(buf[2])
            .ok_or_else(|| XicError::protocol(format!("unknown message type {:#04x}", buf[2])))?;
        let flags = buf[3];
        if flags > Self::FLAG_SEALED {
            return Err(XicError::protocol(format!("invalid flags {:#04x}", flags)));
        }
        let size = i32::from_be_bytes([buf[4], buf[5], buf[6], buf[7]]);
        if size < 0 {
            return Err(XicError::protocol(format!("negative body size {}", size)));
        }

        if !kind.carries_body() {
            if flags != 0 || size != 0 {
                return Err(XicError::protocol(format!(
                    "{:?} must have flags 0 and no body",
                    kind
                )));
            }
        } else if size as usize > max_message_size {
            return Err(XicError::protocol(format!(
                "body size {} exceeds maximum {}",
                size, max_message_size
            )));
        }

        Ok(Self {
            kind,
            flags,
            body_size: size as u32,
        })
    }

    pub fn is_sealed(&self) -> bool {
        self.flags == Self::FLAG_SEALED
    }
}

/// Build a complete frame: header followed by `payload`.
pub fn encode_frame(kind: MessageType, flags: u8, payload: &[u8]) -> Result<Bytes> {
    if payload.len() > i32::MAX as usize {
        return Err(XicError::protocol(format!(
            "payload of {} bytes does not fit a frame",
            payload.len()
        )));
    }
    let header = Header::new(kind, flags, payload.len() as u32);
    let mut frame = BytesMut::with_capacity(ProtocolConfig::HEADER_SIZE + payload.len());
    frame.put_slice(&header.encode());
    frame.put_slice(payload);
    Ok(frame.freeze())
}

pub fn hello_frame() -> [u8; ProtocolConfig::HEADER_SIZE] {
    Header::new(MessageType::Hello, 0, 0).encode()
}

pub fn bye_frame() -> [u8; ProtocolConfig::HEADER_SIZE] {
    Header::new(MessageType::Bye, 0, 0).encode()
}

/// An outgoing Quest whose txid is assigned late, by the sending connection.
#[derive(Debug, Clone)]
pub struct OutQuest {
    service: String,
    method: String,
    payload: Vec<u8>,
    txid_offset: usize,
    txid: i64,
}

impl OutQuest {
    pub fn new(service: &str, method: &str, context: &Context, args: &Arguments) -> Result<Self> {
        let mut enc = Encoder::new();
        let txid_offset = enc.reserve_txid_slot();
        enc.encode(service)?;
        enc.encode(method)?;
        enc.encode(context)?;
        enc.encode(args)?;
        let mut payload = enc.into_bytes();
        patch_txid(&mut payload, txid_offset, 0);
        Ok(Self {
            service: service.to_string(),
            method: method.to_string(),
            payload,
            txid_offset,
            txid: 0,
        })
    }

    pub fn set_txid(&mut self, txid: i64) {
        patch_txid(&mut self.payload, self.txid_offset, txid);
        self.txid = txid;
    }

    pub fn txid(&self) -> i64 {
        self.txid
    }

    pub fn service(&self) -> &str {
        &self.service
    }

    pub fn method(&self) -> &str {
        &self.method
    }

    pub fn payload(&self) -> &[u8] {
        &self.payload
    }
}

/// A decoded incoming Quest.
#[derive(Debug, Clone, PartialEq)]
pub struct Quest {
    pub txid: i64,
    pub service: String,
    pub method: String,
    pub context: Context,
    pub arguments: Arguments,
}

impl Quest {
    pub fn decode(body: &[u8]) -> Result<Self> {
        match Self::decode_routed(body)? {
            (quest, None) => Ok(quest),
            (_, Some(err)) => Err(err),
        }
    }

    /// Decode the routing fields strictly and the rest leniently.
    ///
    /// A context or arguments value that does not decode leaves both empty and
    /// comes back as an `InvalidParams` error next to the routed Quest, so the
    /// receiver can answer it without dropping the connection.
    pub fn decode_routed(body: &[u8]) -> Result<(Self, Option<XicError>)> {
        let mut dec = Decoder::new(body);
        let mut quest = Self {
            txid: dec.decode()?,
            service: dec.decode()?,
            method: dec.decode()?,
            context: Context::default(),
            arguments: Arguments::default(),
        };
        let rest = dec
            .decode::<Context>()
            .and_then(|context| Ok((context, dec.decode::<Arguments>()?)));
        match rest {
            Ok((context, arguments)) => {
                quest.context = context;
                quest.arguments = arguments;
                Ok((quest, None))
            }
            Err(e) => Ok((
                quest,
                Some(XicError::InvalidParams {
                    message: e.to_string(),
                }),
            )),
        }
    }

    pub fn is_oneway(&self) -> bool {
        self.txid == 0
    }
}

/// A normal or exceptional reply.
#[derive(Debug, Clone, PartialEq)]
pub struct Answer {
    pub txid: i64,
    pub status: i32,
    pub arguments: Arguments,
}

impl Answer {
    pub const STATUS_NORMAL: i32 = 0;
    pub const STATUS_EXCEPTION: i32 = -1;

    pub fn normal(txid: i64, arguments: Arguments) -> Self {
        Self {
            txid,
            status: Self::STATUS_NORMAL,
            arguments,
        }
    }

    pub fn fault(txid: i64, fault: &Fault) -> Self {
        // A Fault always serializes to a map.
        let arguments = Arguments::from_record(fault).unwrap_or_default();
        Self {
            txid,
            status: Self::STATUS_EXCEPTION,
            arguments,
        }
    }

    pub fn encode(&self) -> Result<Vec<u8>> {
        let mut enc = Encoder::new();
        enc.encode(&self.txid)?;
        enc.encode(&self.status)?;
        enc.encode(&self.arguments)?;
        Ok(enc.into_bytes())
    }

    pub fn decode(body: &[u8]) -> Result<Self> {
        let mut dec = Decoder::new(body);
        Ok(Self {
            txid: dec.decode()?,
            status: dec.decode()?,
            arguments: dec.decode()?,
        })
    }

    /// Normal arguments, or the carried fault as an error.
    pub fn into_result(self) -> Result<Arguments> {
        if self.status == Self::STATUS_NORMAL {
            return Ok(self.arguments);
        }
        let fault = self
            .arguments
            .into_record::<Fault>()
            .unwrap_or_else(|e| Fault::new(Fault::REMOTE, format!("malformed exception: {}", e)));
        Err(XicError::Remote(fault))
    }
}

/// Handshake-phase message.
#[derive(Debug, Clone, PartialEq)]
pub struct Check {
    pub command: String,
    pub arguments: Arguments,
}

impl Check {
    pub fn new(command: impl Into<String>, arguments: Arguments) -> Self {
        Self {
            command: command.into(),
            arguments,
        }
    }

    pub fn encode(&self) -> Result<Vec<u8>> {
        let mut enc = Encoder::new();
        enc.encode(&self.command)?;
        enc.encode(&self.arguments)?;
        Ok(enc.into_bytes())
    }

    pub fn decode(body: &[u8]) -> Result<Self> {
        let mut dec = Decoder::new(body);
        Ok(Self {
            command: dec.decode()?,
            arguments: dec.decode()?,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    const MAX: usize = ProtocolConfig::MAX_MESSAGE_SIZE;

    fn header_of(frame: &[u8]) -> [u8; 8] {
        let mut buf = [0u8; 8];
        buf.copy_from_slice(&frame[..8]);
        buf
    }

    #[test]
    fn test_header_round_trip() {
        let cases = [
            (MessageType::Quest, 0, 0),
            (MessageType::Quest, 1, 12345),
            (MessageType::Answer, 0, 1),
            (MessageType::Answer, 1, 77),
            (MessageType::Check, 0, 300),
            (MessageType::Hello, 0, 0),
            (MessageType::Bye, 0, 0),
        ];
        for (kind, flags, size) in cases {
            let header = Header::new(kind, flags, size);
            assert_eq!(Header::parse(&header.encode(), MAX).unwrap(), header);
        }

        let frame = encode_frame(MessageType::Quest, 0, b"abc").unwrap();
        let header = Header::parse(&header_of(&frame), MAX).unwrap();
        assert_eq!(header, Header::new(MessageType::Quest, 0, 3));
        assert_eq!(&frame[8..], b"abc");
    }

    #[test]
    fn test_header_wire_layout() {
        let bytes = Header::new(MessageType::Answer, 0, 0x0102_0304).encode();
        assert_eq!(bytes, [b'X', b'!', b'A', 0, 1, 2, 3, 4]);
        assert_eq!(hello_frame(), [b'X', b'!', b'H', 0, 0, 0, 0, 0]);
        assert_eq!(bye_frame(), [b'X', b'!', b'B', 0, 0, 0, 0, 0]);
    }

    #[test]
    fn test_header_rejects_violations() {
        let good = Header::new(MessageType::Quest, 0, 4).encode();

        let mut bad_magic = good;
        bad_magic[0] = b'Y';
        let mut bad_version = good;
        bad_version[1] = b'?';
        let mut bad_type = good;
        bad_type[2] = b'Z';
        let mut bad_flags = good;
        bad_flags[3] = 2;
        let mut negative = good;
        negative[4] = 0x80;
        let hello_with_body = Header::new(MessageType::Hello, 0, 1).encode();
        let bye_with_flags = Header::new(MessageType::Bye, 1, 0).encode();

        for buf in [
            bad_magic,
            bad_version,
            bad_type,
            bad_flags,
            negative,
            hello_with_body,
            bye_with_flags,
        ] {
            assert!(matches!(
                Header::parse(&buf, MAX),
                Err(XicError::Protocol { .. })
            ));
        }

        let oversized = Header::new(MessageType::Quest, 0, 1025).encode();
        assert!(Header::parse(&oversized, 1024).is_err());
        assert!(Header::parse(&oversized, 1025).is_ok());
    }

    #[test]
    fn test_quest_late_txid() {
        let ctx = Context::new().with("user", "u1");
        let args = Arguments::new().with("a", 1);
        let mut out = OutQuest::new("Echo", "echo", &ctx, &args).unwrap();

        let oneway = Quest::decode(out.payload()).unwrap();
        assert!(oneway.is_oneway());

        out.set_txid(9_000_000_000);
        let quest = Quest::decode(out.payload()).unwrap();
        assert_eq!(quest.txid, 9_000_000_000);
        assert_eq!(quest.service, "Echo");
        assert_eq!(quest.method, "echo");
        assert_eq!(quest.context, ctx);
        assert_eq!(quest.arguments, args);
    }

    #[test]
    fn test_answer_normal_and_fault() {
        let normal = Answer::normal(5, Arguments::new().with("a", json!(1)));
        let decoded = Answer::decode(&normal.encode().unwrap()).unwrap();
        assert_eq!(decoded, normal);
        assert_eq!(decoded.into_result().unwrap().get("a"), Some(&json!(1)));

        let fault = Fault::new(Fault::METHOD_NOT_FOUND, "no such method").with_tag("Echo");
        let exceptional = Answer::fault(6, &fault);
        let decoded = Answer::decode(&exceptional.encode().unwrap()).unwrap();
        assert_eq!(decoded.status, Answer::STATUS_EXCEPTION);
        match decoded.into_result() {
            Err(XicError::Remote(got)) => assert_eq!(got, fault),
            other => panic!("expected remote fault, got {:?}", other),
        }
    }

    #[test]
    fn test_check_round_trip() {
        let check = Check::new("AUTHENTICATE", Arguments::new().with("identity", "alice"));
        assert_eq!(Check::decode(&check.encode().unwrap()).unwrap(), check);
    }

    #[test]
    fn test_truncated_body_is_error() {
        let answer = Answer::normal(1, Arguments::new()).encode().unwrap();
        assert!(Answer::decode(&answer[..2]).is_err());
        assert!(Quest::decode(b"1 ").is_err());
    }

    #[test]
    fn test_bad_arguments_keep_the_route() {
        let (quest, err) = Quest::decode_routed(br#"5 "Echo" "echo" {} [1]"#).unwrap();
        assert_eq!(quest.txid, 5);
        assert_eq!(quest.service, "Echo");
        assert_eq!(quest.method, "echo");
        assert_eq!(quest.arguments, Arguments::new());
        assert!(matches!(err, Some(XicError::InvalidParams { .. })));

        assert!(Quest::decode(br#"5 "Echo" "echo" {} [1]"#).is_err());
        assert!(Quest::decode_routed(br#"5 "Echo""#).is_err());
    }
}
