//! Management packet header and CBOR plumbing.
//!
//! The 8-byte header is big-endian on the wire; bodies are CBOR maps with
//! text keys, decoded into explicit request structs with bounded,
//! stack-only state.

use minicbor::Decoder;

use crate::error::{Error, Result};

/// Header operations.
pub const OP_READ: u8 = 0;
pub const OP_READ_RSP: u8 = 1;
pub const OP_WRITE: u8 = 2;
pub const OP_WRITE_RSP: u8 = 3;

/// Command groups.
pub const GROUP_DEFAULT: u16 = 0;
pub const GROUP_IMAGE: u16 = 1;

/// Default-group command identifiers.
pub const ID_ECHO: u8 = 0;
pub const ID_CONS_ECHO_CTRL: u8 = 1;
pub const ID_RESET: u8 = 5;

/// Image-group command identifiers.
pub const ID_STATE: u8 = 0;
pub const ID_UPLOAD: u8 = 1;
pub const ID_SLOT_INFO: u8 = 6;

/// Handler result codes surfaced as `{rc: <code>}`.
pub mod rc {
    pub const OK: u32 = 0;
    pub const UNKNOWN: u32 = 1;
    pub const NOMEM: u32 = 2;
    pub const EINVAL: u32 = 3;
    pub const ENOENT: u32 = 5;
    pub const ENOTSUP: u32 = 8;
    pub const EBUSY: u32 = 10;
}

pub const HDR_LEN: usize = 8;

/// Decoded management header.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct NmgrHdr {
    pub op: u8,
    pub flags: u8,
    pub len: u16,
    pub group: u16,
    pub seq: u8,
    pub id: u8,
}

impl NmgrHdr {
    pub fn parse(bytes: &[u8]) -> Result<NmgrHdr> {
        if bytes.len() < HDR_LEN {
            return Err(Error::Decode("short header"));
        }
        Ok(NmgrHdr {
            op: bytes[0] & 0x07,
            flags: bytes[1],
            len: u16::from_be_bytes([bytes[2], bytes[3]]),
            group: u16::from_be_bytes([bytes[4], bytes[5]]),
            seq: bytes[6],
            id: bytes[7],
        })
    }

    /// The response header for this request, body length patched in.
    pub fn response(&self, body_len: usize) -> [u8; HDR_LEN] {
        let mut bytes = [0u8; HDR_LEN];
        bytes[0] = self.op + 1;
        bytes[1] = self.flags;
        bytes[2..4].copy_from_slice(&(body_len as u16).to_be_bytes());
        bytes[4..6].copy_from_slice(&self.group.to_be_bytes());
        bytes[6] = self.seq;
        bytes[7] = self.id;
        bytes
    }
}

/// Image-upload request body.
#[derive(Debug, Default)]
pub struct UploadReq<'a> {
    pub image: u8,
    pub off: Option<u32>,
    /// Total image length; present on the first chunk.
    pub len: Option<u32>,
    pub data: Option<&'a [u8]>,
}

fn decode_err(_: minicbor::decode::Error) -> Error {
    Error::Decode("bad CBOR structure")
}

/// Walks a definite-length CBOR map, handing each key to `field`. Unknown
/// keys are skipped.
fn walk_map<'b>(
    decoder: &mut Decoder<'b>,
    mut field: impl FnMut(&str, &mut Decoder<'b>) -> Result<()>,
) -> Result<()> {
    let entries = decoder
        .map()
        .map_err(decode_err)?
        .ok_or(Error::Decode("indefinite map"))?;
    for _ in 0..entries {
        let key = decoder.str().map_err(decode_err)?;
        field(key, decoder)?;
    }
    Ok(())
}

impl<'a> UploadReq<'a> {
    pub fn parse(body: &'a [u8]) -> Result<UploadReq<'a>> {
        let mut req = UploadReq::default();
        let mut decoder = Decoder::new(body);
        walk_map(&mut decoder, |key, dec| {
            match key {
                "image" => req.image = dec.u32().map_err(decode_err)? as u8,
                "off" => req.off = Some(dec.u32().map_err(decode_err)?),
                "len" => req.len = Some(dec.u32().map_err(decode_err)?),
                "data" => req.data = Some(dec.bytes().map_err(decode_err)?),
                _ => dec.skip().map_err(decode_err)?,
            }
            Ok(())
        })?;
        Ok(req)
    }
}

/// Image state-write request body.
#[derive(Debug, Default)]
pub struct StateReq {
    pub confirm: bool,
}

impl StateReq {
    pub fn parse(body: &[u8]) -> Result<StateReq> {
        let mut req = StateReq::default();
        let mut decoder = Decoder::new(body);
        walk_map(&mut decoder, |key, dec| {
            match key {
                "confirm" => req.confirm = dec.bool().map_err(decode_err)?,
                _ => dec.skip().map_err(decode_err)?,
            }
            Ok(())
        })?;
        Ok(req)
    }
}

/// Echo request body.
pub fn parse_echo(body: &[u8]) -> Result<&str> {
    let mut message = "";
    let mut decoder = Decoder::new(body);
    walk_map(&mut decoder, |key, dec| {
        match key {
            "d" => message = dec.str().map_err(decode_err)?,
            _ => dec.skip().map_err(decode_err)?,
        }
        Ok(())
    })?;
    Ok(message)
}

/// Reset request body; `force` defaults off.
pub fn parse_reset(body: &[u8]) -> Result<bool> {
    if body.is_empty() {
        return Ok(false);
    }
    let mut force = false;
    let mut decoder = Decoder::new(body);
    walk_map(&mut decoder, |key, dec| {
        match key {
            "force" => force = dec.bool().map_err(decode_err)?,
            _ => dec.skip().map_err(decode_err)?,
        }
        Ok(())
    })?;
    Ok(force)
}

/// `minicbor` writer over a fixed slice.
pub struct SliceWriter<'a> {
    buf: &'a mut [u8],
    len: usize,
}

#[derive(Debug)]
pub struct BufferFull;

impl<'a> SliceWriter<'a> {
    pub fn new(buf: &'a mut [u8]) -> Self {
        SliceWriter { buf, len: 0 }
    }

    pub fn len(&self) -> usize {
        self.len
    }
}

impl minicbor::encode::Write for SliceWriter<'_> {
    type Error = BufferFull;

    fn write_all(&mut self, data: &[u8]) -> core::result::Result<(), BufferFull> {
        if self.len + data.len() > self.buf.len() {
            return Err(BufferFull);
        }
        self.buf[self.len..self.len + data.len()].copy_from_slice(data);
        self.len += data.len();
        Ok(())
    }
}
