//! Frame protocol shared by every DroneGrid process.
//!
//! Every channel carries the same unit: a native `i32` type code followed by
//! an 80-byte NUL-padded ASCII payload. OBSTACLES and TARGETS frames announce
//! a record count in their payload and are immediately followed by that many
//! raw `{i32 x, i32 y}` point records:
//!
//! ```text
//! ┌──────────┬──────────────────────────────┬────────────────────────────┐
//! │ type i32 │ data [u8; 80]  e.g. "3\0\0.." │ 3 × Point { x i32, y i32 } │
//! └──────────┴──────────────────────────────┴────────────────────────────┘
//! ```
//!
//! [`FrameCodec`] only yields a [`Frame`] once the header AND its whole bulk
//! body are buffered, so a reader can never observe a count without its
//! points. Parsing the ASCII payload into a [`Message`] is a second step: a
//! payload that fails to parse costs one message, never the stream.

use crate::error::{CoreError, FrameError};

use bytes::{Buf, BufMut, BytesMut};
use dronegrid_env::{Pid, Point};
use serde::Serialize;
use std::fmt;
use tokio_util::codec::{Decoder, Encoder};
use tracing::warn;

/// Size of the ASCII payload in every frame header.
pub const FRAME_DATA_LEN: usize = 80;

/// Size of a frame header on the wire.
pub const FRAME_HEADER_LEN: usize = 4 + FRAME_DATA_LEN;

/// Largest bulk count a peer may announce.
pub const MAX_BULK_RECORDS: usize = 65_536;

// =============================================================================
// FRAME KINDS
// =============================================================================

/// Frame type codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(i32)]
pub enum FrameKind {
    Size = 1,
    Obstacles = 2,
    Input = 3,
    Exit = 4,
    Position = 6,
    Targets = 8,
    Force = 9,
    Pid = 10,
    /// Liveness probe from the supervisor, payload is a sequence number
    Ping = 11,
    /// Answer to a probe, echoing its sequence number
    Pong = 12,
}

impl FrameKind {
    pub fn code(self) -> i32 {
        self as i32
    }

    pub fn from_code(code: i32) -> Option<Self> {
        Some(match code {
            1 => Self::Size,
            2 => Self::Obstacles,
            3 => Self::Input,
            4 => Self::Exit,
            6 => Self::Position,
            8 => Self::Targets,
            9 => Self::Force,
            10 => Self::Pid,
            11 => Self::Ping,
            12 => Self::Pong,
            _ => return None,
        })
    }

    /// Whether frames of this kind are followed by point records.
    pub fn carries_bulk(self) -> bool {
        matches!(self, Self::Obstacles | Self::Targets)
    }

    pub fn name(self) -> &'static str {
        match self {
            Self::Size => "SIZE",
            Self::Obstacles => "OBSTACLES",
            Self::Input => "INPUT",
            Self::Exit => "EXIT",
            Self::Position => "POSITION",
            Self::Targets => "TARGETS",
            Self::Force => "FORCE",
            Self::Pid => "PID",
            Self::Ping => "PING",
            Self::Pong => "PONG",
        }
    }
}

impl fmt::Display for FrameKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

// =============================================================================
// RAW FRAME
// =============================================================================

/// One frame exactly as it travels, header plus bulk body.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub code: i32,
    pub data: [u8; FRAME_DATA_LEN],
    pub bulk: Vec<Point>,
}

impl Frame {
    /// Builds a frame, truncating `text` at a char boundary to leave room
    /// for a NUL terminator.
    pub fn new(kind: FrameKind, text: &str, bulk: Vec<Point>) -> Self {
        let mut data = [0u8; FRAME_DATA_LEN];
        let mut len = text.len().min(FRAME_DATA_LEN - 1);
        while !text.is_char_boundary(len) {
            len -= 1;
        }
        if len < text.len() {
            warn!(%kind, dropped = text.len() - len, "Frame payload truncated");
        }
        data[..len].copy_from_slice(&text.as_bytes()[..len]);
        Self {
            code: kind.code(),
            data,
            bulk,
        }
    }

    pub fn kind(&self) -> Option<FrameKind> {
        FrameKind::from_code(self.code)
    }

    /// Payload text up to the first NUL.
    #[cfg(test)]
    pub fn text(&self) -> Result<&str, CoreError> {
        payload_text(&self.data)
            .ok_or_else(|| CoreError::payload(self.kind().map_or("UNKNOWN", FrameKind::name), "not ASCII"))
    }

    /// Parses the payload according to the frame type.
    pub fn into_message(self) -> Result<Message, CoreError> {
        let kind = self.kind().ok_or(CoreError::UnknownKind(self.code))?;
        let Frame { data, bulk, .. } = self;
        let text = payload_text(&data).ok_or_else(|| CoreError::payload(kind.name(), "not ASCII"))?;
        let mut fields = text.split_whitespace();

        let message = match kind {
            FrameKind::Size => {
                let width = next_field::<i32>(&mut fields, kind)?;
                let height = next_field::<i32>(&mut fields, kind)?;
                if width <= 0 || height <= 0 {
                    return Err(CoreError::payload(kind.name(), format!("non-positive size '{}'", text)));
                }
                Message::Size { width, height }
            }
            FrameKind::Obstacles => Message::Obstacles(bulk),
            FrameKind::Targets => Message::Targets(bulk),
            FrameKind::Input => {
                let key = text
                    .chars()
                    .next()
                    .ok_or_else(|| CoreError::payload(kind.name(), "empty key"))?;
                Message::Input(key)
            }
            FrameKind::Exit => Message::Exit,
            FrameKind::Position => {
                let x = next_field::<f32>(&mut fields, kind)?;
                let y = next_field::<f32>(&mut fields, kind)?;
                Message::Position { x, y }
            }
            FrameKind::Force => Message::Force(ForceReport::parse(text)?),
            FrameKind::Pid => Message::Pid(next_field::<Pid>(&mut fields, kind)?),
            FrameKind::Ping => Message::Ping(next_field::<u64>(&mut fields, kind)?),
            FrameKind::Pong => Message::Pong(next_field::<u64>(&mut fields, kind)?),
        };
        Ok(message)
    }
}

/// Joins floats into a payload, shedding decimals until the text fits.
///
/// Magnitudes too large for fixed notation fall back to three significant
/// digits in scientific notation, which always fits eight values.
fn fit_floats(values: &[f32]) -> String {
    for precision in (0..=6).rev() {
        let text = values
            .iter()
            .map(|v| format!("{:.*}", precision, v))
            .collect::<Vec<_>>()
            .join(" ");
        if text.len() < FRAME_DATA_LEN {
            return text;
        }
    }
    values
        .iter()
        .map(|v| format!("{:.2e}", v))
        .collect::<Vec<_>>()
        .join(" ")
}

fn payload_text(data: &[u8; FRAME_DATA_LEN]) -> Option<&str> {
    let end = data.iter().position(|b| *b == 0).unwrap_or(FRAME_DATA_LEN);
    std::str::from_utf8(&data[..end]).ok()
}

fn next_field<'a, T: std::str::FromStr>(
    fields: &mut impl Iterator<Item = &'a str>,
    kind: FrameKind,
) -> Result<T, CoreError> {
    let field = fields
        .next()
        .ok_or_else(|| CoreError::payload(kind.name(), "missing field"))?;
    field
        .parse()
        .map_err(|_| CoreError::payload(kind.name(), format!("unparseable field '{}'", field)))
}

// =============================================================================
// TYPED MESSAGES
// =============================================================================

/// Force components reported by the physics integrator.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize)]
pub struct ForceReport {
    /// Commanded force from keyboard input
    pub drone: [f32; 2],
    /// Repulsion from obstacles
    pub obstacle: [f32; 2],
    /// Repulsion from the walls
    pub wall: [f32; 2],
    /// Attraction towards targets
    pub target: [f32; 2],
}

impl ForceReport {
    /// Parses up to eight floats; absent trailing components are zero.
    pub fn parse(text: &str) -> Result<Self, CoreError> {
        let mut values = [0.0f32; 8];
        let mut count = 0;
        for field in text.split_whitespace() {
            if count == values.len() {
                return Err(CoreError::payload("FORCE", "more than eight components"));
            }
            values[count] = field
                .parse()
                .map_err(|_| CoreError::payload("FORCE", format!("unparseable component '{}'", field)))?;
            count += 1;
        }
        if count == 0 {
            return Err(CoreError::payload("FORCE", "no components"));
        }
        Ok(Self {
            drone: [values[0], values[1]],
            obstacle: [values[2], values[3]],
            wall: [values[4], values[5]],
            target: [values[6], values[7]],
        })
    }

    fn to_text(self) -> String {
        fit_floats(&[
            self.drone[0],
            self.drone[1],
            self.obstacle[0],
            self.obstacle[1],
            self.wall[0],
            self.wall[1],
            self.target[0],
            self.target[1],
        ])
    }
}

/// A parsed frame.
#[derive(Debug, Clone, PartialEq)]
pub enum Message {
    Size { width: i32, height: i32 },
    Obstacles(Vec<Point>),
    Input(char),
    Exit,
    Position { x: f32, y: f32 },
    Targets(Vec<Point>),
    Force(ForceReport),
    Pid(Pid),
    Ping(u64),
    Pong(u64),
}

impl Message {
    pub fn kind(&self) -> FrameKind {
        match self {
            Message::Size { .. } => FrameKind::Size,
            Message::Obstacles(_) => FrameKind::Obstacles,
            Message::Input(_) => FrameKind::Input,
            Message::Exit => FrameKind::Exit,
            Message::Position { .. } => FrameKind::Position,
            Message::Targets(_) => FrameKind::Targets,
            Message::Force(_) => FrameKind::Force,
            Message::Pid(_) => FrameKind::Pid,
            Message::Ping(_) => FrameKind::Ping,
            Message::Pong(_) => FrameKind::Pong,
        }
    }

    /// Encodes the message into its wire frame.
    pub fn to_frame(&self) -> Frame {
        let kind = self.kind();
        match self {
            Message::Size { width, height } => Frame::new(kind, &format!("{} {}", width, height), Vec::new()),
            Message::Obstacles(points) | Message::Targets(points) => {
                Frame::new(kind, &points.len().to_string(), points.clone())
            }
            Message::Input(key) => Frame::new(kind, &key.to_string(), Vec::new()),
            Message::Exit => Frame::new(kind, "", Vec::new()),
            Message::Position { x, y } => Frame::new(kind, &fit_floats(&[*x, *y]), Vec::new()),
            Message::Force(report) => Frame::new(kind, &report.to_text(), Vec::new()),
            Message::Pid(pid) => Frame::new(kind, &pid.to_string(), Vec::new()),
            Message::Ping(seq) | Message::Pong(seq) => Frame::new(kind, &seq.to_string(), Vec::new()),
        }
    }
}

impl From<&Message> for Frame {
    fn from(message: &Message) -> Self {
        message.to_frame()
    }
}

// =============================================================================
// CODEC
// =============================================================================

/// Length-aware codec for DroneGrid frames.
#[derive(Debug, Clone, Copy, Default)]
pub struct FrameCodec;

/// Reads the announced record count out of a bulk frame header.
///
/// Negative counts mean "no records".
fn bulk_count(data: &[u8; FRAME_DATA_LEN]) -> Result<usize, FrameError> {
    let text = match payload_text(data) {
        Some(text) => text,
        None => return Err(FrameError::BadCount(String::from_utf8_lossy(data).into_owned())),
    };
    let first = text.split_whitespace().next().unwrap_or("");
    let count: i64 = first
        .parse()
        .map_err(|_| FrameError::BadCount(text.trim().to_string()))?;
    if count <= 0 {
        return Ok(0);
    }
    let count = usize::try_from(count).map_err(|_| FrameError::BulkTooLarge(usize::MAX))?;
    if count > MAX_BULK_RECORDS {
        return Err(FrameError::BulkTooLarge(count));
    }
    Ok(count)
}

impl Decoder for FrameCodec {
    type Item = Frame;
    type Error = FrameError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Frame>, FrameError> {
        if src.len() < FRAME_HEADER_LEN {
            src.reserve(FRAME_HEADER_LEN - src.len());
            return Ok(None);
        }

        let mut code = [0u8; 4];
        code.copy_from_slice(&src[..4]);
        let code = i32::from_ne_bytes(code);
        let mut data = [0u8; FRAME_DATA_LEN];
        data.copy_from_slice(&src[4..FRAME_HEADER_LEN]);

        let count = match FrameKind::from_code(code) {
            Some(kind) if kind.carries_bulk() => bulk_count(&data)?,
            _ => 0,
        };
        let total = FRAME_HEADER_LEN + count * Point::WIRE_SIZE;
        if src.len() < total {
            src.reserve(total - src.len());
            return Ok(None);
        }

        src.advance(FRAME_HEADER_LEN);
        let bulk = (0..count)
            .map(|_| {
                let x = src.get_i32_ne();
                let y = src.get_i32_ne();
                Point::new(x, y)
            })
            .collect();

        Ok(Some(Frame { code, data, bulk }))
    }
}

impl Encoder<Frame> for FrameCodec {
    type Error = FrameError;

    fn encode(&mut self, frame: Frame, dst: &mut BytesMut) -> Result<(), FrameError> {
        encode_frame(&frame, dst);
        Ok(())
    }
}

impl Encoder<&Frame> for FrameCodec {
    type Error = FrameError;

    fn encode(&mut self, frame: &Frame, dst: &mut BytesMut) -> Result<(), FrameError> {
        encode_frame(frame, dst);
        Ok(())
    }
}

impl Encoder<Message> for FrameCodec {
    type Error = FrameError;

    fn encode(&mut self, message: Message, dst: &mut BytesMut) -> Result<(), FrameError> {
        encode_frame(&message.to_frame(), dst);
        Ok(())
    }
}

fn encode_frame(frame: &Frame, dst: &mut BytesMut) {
    dst.reserve(FRAME_HEADER_LEN + frame.bulk.len() * Point::WIRE_SIZE);
    dst.put_i32_ne(frame.code);
    dst.put_slice(&frame.data);
    for point in &frame.bulk {
        dst.put_i32_ne(point.x);
        dst.put_i32_ne(point.y);
    }
}
