//! Length-prefixed framing for TCP frames.
//!
//! Wire format: `[u32 length (big-endian)][UTF-8 JSON payload]`. One frame
//! carries one envelope.

use std::io::{self, Read, Write};

use virgil_types::Envelope;

/// Sanity bound: frames larger than this are treated as stream corruption.
pub const MAX_FRAME_LEN: usize = 16 * 1024 * 1024;

/// Serialize an envelope into one frame buffer (header + payload).
pub fn encode_frame(envelope: &Envelope) -> io::Result<Vec<u8>> {
    let payload = serde_json::to_vec(envelope)
        .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
    let mut frame = Vec::with_capacity(4 + payload.len());
    frame.extend_from_slice(&(payload.len() as u32).to_be_bytes());
    frame.extend_from_slice(&payload);
    Ok(frame)
}

/// Write one envelope as a single frame. Header and payload go out in one
/// write so a frame is never interleaved with another.
pub fn write_frame<W: Write>(writer: &mut W, envelope: &Envelope) -> io::Result<()> {
    let frame = encode_frame(envelope)?;
    writer.write_all(&frame)?;
    writer.flush()
}

/// Blocking read of one complete frame payload. Used on the acceptor path
/// to pick up the handshake frame before a session exists.
pub fn read_frame<R: Read>(reader: &mut R) -> io::Result<Vec<u8>> {
    let mut header = [0u8; 4];
    reader.read_exact(&mut header)?;
    let len = u32::from_be_bytes(header) as usize;
    if len > MAX_FRAME_LEN {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            format!("frame too large: {len} bytes"),
        ));
    }
    let mut payload = vec![0u8; len];
    reader.read_exact(&mut payload)?;
    Ok(payload)
}

/// Streaming reassembler for the non-blocking receive path. Bytes go in
/// as they arrive; complete frame payloads come out. Partial frames stay
/// buffered across reads.
#[derive(Debug, Default)]
pub struct FrameBuffer {
    buf: Vec<u8>,
}

impl FrameBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn extend(&mut self, data: &[u8]) {
        self.buf.extend_from_slice(data);
    }

    /// Extract the next complete frame payload, if one is buffered.
    pub fn next_frame(&mut self) -> io::Result<Option<Vec<u8>>> {
        if self.buf.len() < 4 {
            return Ok(None);
        }
        let len = u32::from_be_bytes([self.buf[0], self.buf[1], self.buf[2], self.buf[3]]) as usize;
        if len > MAX_FRAME_LEN {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                format!("frame too large: {len} bytes"),
            ));
        }
        if self.buf.len() < 4 + len {
            // Wait for the full payload.
            return Ok(None);
        }
        let payload = self.buf[4..4 + len].to_vec();
        self.buf.drain(..4 + len);
        Ok(Some(payload))
    }
}
