//! Framed channel endpoints.
//!
//! Links are boxed so the same coordinator and detector code runs over OS
//! pipes in production and `tokio::io::duplex` pairs in tests.

use crate::error::FrameError;
use crate::protocol::{Frame, FrameCodec, Message};

use futures::SinkExt;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio_util::codec::{FramedRead, FramedWrite};

pub type BoxedReader = Box<dyn AsyncRead + Send + Unpin>;
pub type BoxedWriter = Box<dyn AsyncWrite + Send + Unpin>;

/// Inbound half of a channel, yielding whole frames.
pub type FrameReader = FramedRead<BoxedReader, FrameCodec>;

/// Outbound half of a channel.
pub type FrameWriter = FramedWrite<BoxedWriter, FrameCodec>;

pub fn frame_reader<R>(reader: R) -> FrameReader
where
    R: AsyncRead + Send + Unpin + 'static,
{
    FramedRead::new(Box::new(reader) as BoxedReader, FrameCodec)
}

pub fn frame_writer<W>(writer: W) -> FrameWriter
where
    W: AsyncWrite + Send + Unpin + 'static,
{
    FramedWrite::new(Box::new(writer) as BoxedWriter, FrameCodec)
}

/// Writes and flushes one message.
pub async fn send(writer: &mut FrameWriter, message: Message) -> Result<(), FrameError> {
    writer.send(message).await
}

/// Writes and flushes one frame unchanged.
pub async fn forward(writer: &mut FrameWriter, frame: &Frame) -> Result<(), FrameError> {
    writer.send(frame).await
}
