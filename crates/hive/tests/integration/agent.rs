//! Fake agent on the far side of an in-memory transport

use anyhow::{Context, Result};
use hive::proto::{Envelope, EnvelopeCodec, MsgType};
use std::time::Duration;
use tokio::io::{duplex, split, DuplexStream, ReadHalf, WriteHalf};
use tokio::time::timeout;

/// Server-side halves of the transport, handed to the pump
pub type ServerHalves = (ReadHalf<DuplexStream>, WriteHalf<DuplexStream>);

/// Agent endpoint of an in-memory connection
pub struct FakeAgent {
    reader: ReadHalf<DuplexStream>,
    writer: WriteHalf<DuplexStream>,
    codec: EnvelopeCodec,
}

impl FakeAgent {
    /// Create a connected agent and the server's transport halves
    pub fn connect() -> (Self, ServerHalves) {
        let (agent_side, server_side) = duplex(64 * 1024);
        let (reader, writer) = split(agent_side);
        let agent = Self {
            reader,
            writer,
            codec: EnvelopeCodec::new(),
        };
        (agent, split(server_side))
    }

    /// Read the next envelope written by the server
    pub async fn recv(&mut self) -> Result<Envelope> {
        let envelope = timeout(Duration::from_secs(2), self.codec.read_envelope(&mut self.reader))
            .await
            .context("Timed out waiting for envelope")??
            .context("Server closed the connection")?;
        Ok(envelope)
    }

    /// Read until an envelope of `msg_type` arrives
    ///
    /// Returns it along with everything read before it.
    pub async fn recv_of(&mut self, msg_type: MsgType) -> Result<(Envelope, Vec<Envelope>)> {
        let mut skipped = Vec::new();
        loop {
            let envelope = self.recv().await?;
            if envelope.msg_type == msg_type {
                return Ok((envelope, skipped));
            }
            skipped.push(envelope);
        }
    }

    /// Write an envelope to the server
    pub async fn send(&mut self, envelope: &Envelope) -> Result<()> {
        self.codec.write_envelope(&mut self.writer, envelope).await?;
        Ok(())
    }

    /// Answer the next request with `data`
    pub async fn answer_next(&mut self, data: &'static [u8]) -> Result<Envelope> {
        let request = self.recv().await?;
        self.send(&request.reply(data)).await?;
        Ok(request)
    }
}
