//! Serial framing: ASCII packets carrying base64 payloads.
//!
//! A packet opens with `0x06 0x09` (or `0x04 0x14` for continuations),
//! carries up to 124 base64 characters, and ends with a newline. The
//! decoded stream is a big-endian length prefix, the management packet, and
//! a trailing CRC16-CCITT over the packet.

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use crc::{Crc, CRC_16_XMODEM};

use crate::error::{Error, Result};
use crate::hal::serial::Write;

/// Start of a new packet.
pub const PKT_START: [u8; 2] = [0x06, 0x09];
/// Continuation of the current packet.
pub const PKT_CONT: [u8; 2] = [0x04, 0x14];

/// Base64 characters per frame line, chosen so marker + payload + newline
/// stay within the classic 127-byte console line.
pub const FRAME_B64_MAX: usize = 124;

/// Largest decoded management packet (length prefix and CRC included).
pub const PACKET_MAX: usize = 520;

const B64_MAX: usize = (PACKET_MAX / 3 + 1) * 4;

const CRC16: Crc<u16> = Crc::<u16>::new(&CRC_16_XMODEM);

enum State {
    Idle,
    /// Saw the first marker byte; the value tells which.
    Marker(u8),
    Collecting,
}

/// Reassembles framed base64 lines into verified packets.
pub struct FrameAssembler {
    state: State,
    b64: [u8; FRAME_B64_MAX],
    b64_len: usize,
    packet: [u8; PACKET_MAX],
    packet_len: usize,
}

impl Default for FrameAssembler {
    fn default() -> Self {
        FrameAssembler {
            state: State::Idle,
            b64: [0; FRAME_B64_MAX],
            b64_len: 0,
            packet: [0; PACKET_MAX],
            packet_len: 0,
        }
    }
}

impl FrameAssembler {
    fn reset_line(&mut self) {
        self.b64_len = 0;
    }

    fn reset_packet(&mut self) {
        self.packet_len = 0;
    }

    /// Feeds one received byte. Returns the verified packet body (header
    /// plus CBOR, length prefix and CRC stripped) once complete.
    pub fn push(&mut self, byte: u8) -> Result<Option<&[u8]>> {
        match self.state {
            State::Idle => {
                if byte == PKT_START[0] || byte == PKT_CONT[0] {
                    self.state = State::Marker(byte);
                }
                Ok(None)
            }
            State::Marker(first) => {
                let starts = first == PKT_START[0] && byte == PKT_START[1];
                let continues = first == PKT_CONT[0] && byte == PKT_CONT[1];
                if starts {
                    self.reset_packet();
                }
                if starts || continues {
                    self.reset_line();
                    self.state = State::Collecting;
                } else {
                    self.state = State::Idle;
                }
                Ok(None)
            }
            State::Collecting => {
                if byte == b'\n' {
                    self.state = State::Idle;
                    return self.end_of_line();
                }
                if byte == b'\r' {
                    return Ok(None);
                }
                if self.b64_len == FRAME_B64_MAX {
                    self.state = State::Idle;
                    return Err(Error::Decode("frame too long"));
                }
                self.b64[self.b64_len] = byte;
                self.b64_len += 1;
                Ok(None)
            }
        }
    }

    fn end_of_line(&mut self) -> Result<Option<&[u8]>> {
        let mut decoded = [0u8; FRAME_B64_MAX];
        let n = STANDARD
            .decode_slice(&self.b64[..self.b64_len], &mut decoded)
            .map_err(|_| Error::Decode("bad base64"))?;
        if self.packet_len + n > PACKET_MAX {
            self.reset_packet();
            return Err(Error::Decode("packet too long"));
        }
        self.packet[self.packet_len..self.packet_len + n].copy_from_slice(&decoded[..n]);
        self.packet_len += n;

        if self.packet_len < 2 {
            return Ok(None);
        }
        let total = usize::from(u16::from_be_bytes([self.packet[0], self.packet[1]]));
        if self.packet_len - 2 < total {
            // more continuation frames to come
            return Ok(None);
        }
        if total < 2 {
            self.reset_packet();
            return Err(Error::Decode("short packet"));
        }
        let body = &self.packet[2..2 + total - 2];
        let wire_crc = u16::from_be_bytes([self.packet[total], self.packet[total + 1]]);
        if CRC16.checksum(body) != wire_crc {
            self.reset_packet();
            return Err(Error::Decode("bad checksum"));
        }
        let body_len = body.len();
        self.packet_len = 0;
        Ok(Some(&self.packet[2..2 + body_len]))
    }
}

/// Frames and sends one packet body.
pub fn write_packet<S: Write>(serial: &mut S, body: &[u8]) -> Result<()> {
    if body.len() + 4 > PACKET_MAX {
        return Err(Error::Decode("packet too long"));
    }
    let mut raw = [0u8; PACKET_MAX];
    let total = body.len() + 2;
    raw[..2].copy_from_slice(&(total as u16).to_be_bytes());
    raw[2..2 + body.len()].copy_from_slice(body);
    raw[2 + body.len()..4 + body.len()].copy_from_slice(&CRC16.checksum(body).to_be_bytes());

    let mut b64 = [0u8; B64_MAX];
    let n = STANDARD
        .encode_slice(&raw[..body.len() + 4], &mut b64)
        .map_err(|_| Error::Decode("encode overflow"))?;

    let mut sent = 0usize;
    let mut first = true;
    while sent < n || first {
        let marker = if first { PKT_START } else { PKT_CONT };
        let chunk = (n - sent).min(FRAME_B64_MAX);
        serial.write_all(&marker).map_err(|_| Error::Flash("serial write"))?;
        serial.write_all(&b64[sent..sent + chunk]).map_err(|_| Error::Flash("serial write"))?;
        serial.write_all(b"\n").map_err(|_| Error::Flash("serial write"))?;
        sent += chunk;
        first = false;
    }
    Ok(())
}
