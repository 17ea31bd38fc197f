//! Serial recovery: an out-of-band uploader and management endpoint.
//!
//! Speaks the framed CBOR management protocol over a UART. The upload
//! session owns its progressive-erase cursor so concurrent-session clobber
//! bugs cannot exist by construction; every other command is stateless.

pub mod frame;
pub mod protocol;

use core::fmt::Write as _;

use crate::area::{AreaId, FlashArea, FlashMap};
use crate::bootloader;
use crate::enc::{ImageCipher, UnwrapKind};
use crate::error::{Error, Result};
use crate::hal::flash::Flash;
use crate::hal::serial::{TimeoutRead, Write};
use crate::hal::time::{Milliseconds, Now};
use crate::image::hash::DigestKind;
use crate::image::tlv::TlvCursor;
use crate::image::ImageHeader;
use crate::swap::trailer::{FlagState, MagicState, TrailerLayout};
use crate::swap::SwapPolicy;
use crate::keys::EncPrivateKey;

use frame::FrameAssembler;
use minicbor::Encoder;
use protocol::{rc, NmgrHdr, SliceWriter, StateReq, UploadReq};

/// Why the handler returned.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum RecoveryOutcome {
    /// A reset was requested; the caller should reboot.
    Reset,
    /// The wait-for-client window elapsed with no traffic.
    TimedOut,
}

/// Per-upload state. Dropped whole when a new upload begins at offset 0.
#[derive(Default)]
struct UploadSession {
    active: bool,
    image: u8,
    expected_off: u32,
    total_len: u32,
    /// Progressive-erase cursor: everything below it is known erased.
    not_yet_erased: u32,
}

/// The recovery handler. Borrows the same flash the boot core owns; the
/// two never run concurrently.
pub struct Recovery<'a, F: Flash, S: TimeoutRead + Write, T: Now> {
    pub flash: &'a mut F,
    pub map: FlashMap,
    pub policy: SwapPolicy,
    pub enc_key: Option<EncPrivateKey<'a>>,
    pub unwrap: UnwrapKind,
    pub serial: &'a mut S,
    pub clock: &'a mut T,
    upload: UploadSession,
    console_echo: bool,
}

const READ_SLICE: Milliseconds = Milliseconds(50);
const DRAIN: Milliseconds = Milliseconds(250);
const RSP_BUF: usize = 464;

struct VersionString {
    bytes: [u8; 24],
    len: usize,
}

impl core::fmt::Write for VersionString {
    fn write_str(&mut self, s: &str) -> core::fmt::Result {
        if self.len + s.len() > self.bytes.len() {
            return Err(core::fmt::Error);
        }
        self.bytes[self.len..self.len + s.len()].copy_from_slice(s.as_bytes());
        self.len += s.len();
        Ok(())
    }
}

fn version_string(header: &ImageHeader) -> VersionString {
    let mut out = VersionString { bytes: [0; 24], len: 0 };
    let v = header.version;
    let _ = write!(out, "{}.{}.{}.{}", v.major, v.minor, v.revision, v.build);
    out
}

fn encode_err(_: minicbor::encode::Error<protocol::BufferFull>) -> Error {
    Error::Decode("response overflow")
}

impl<'a, F: Flash, S: TimeoutRead + Write, T: Now> Recovery<'a, F, S, T> {
    pub fn new(
        flash: &'a mut F,
        map: FlashMap,
        policy: SwapPolicy,
        enc_key: Option<EncPrivateKey<'a>>,
        unwrap: UnwrapKind,
        serial: &'a mut S,
        clock: &'a mut T,
    ) -> Self {
        Recovery {
            flash,
            map,
            policy,
            enc_key,
            unwrap,
            serial,
            clock,
            upload: UploadSession::default(),
            console_echo: true,
        }
    }

    /// Serves clients until a reset is requested or `window` elapses with
    /// no traffic.
    pub fn run(&mut self, window: Milliseconds) -> Result<RecoveryOutcome> {
        let mut assembler = FrameAssembler::default();
        let mut last_traffic = self.clock.now();
        loop {
            match self.serial.read(READ_SLICE) {
                Ok(byte) => {
                    last_traffic = self.clock.now();
                    match assembler.push(byte) {
                        Ok(Some(body)) => {
                            // the packet borrows the assembler; copy it out
                            // so the dispatch may borrow self
                            let mut packet = [0u8; frame::PACKET_MAX];
                            let len = body.len();
                            packet[..len].copy_from_slice(body);
                            if let Some(outcome) = self.dispatch(&packet[..len])? {
                                return Ok(outcome);
                            }
                        }
                        Ok(None) => {}
                        Err(_) => debug!("dropping malformed frame"),
                    }
                }
                Err(_) => {
                    if self.clock.now() - last_traffic >= window {
                        return Ok(RecoveryOutcome::TimedOut);
                    }
                }
            }
        }
    }

    fn dispatch(&mut self, packet: &[u8]) -> Result<Option<RecoveryOutcome>> {
        let header = match NmgrHdr::parse(packet) {
            Ok(header) => header,
            Err(_) => return Ok(None),
        };
        let body = &packet[protocol::HDR_LEN..];
        let mut rsp = [0u8; RSP_BUF];
        let mut outcome = None;

        let len = match (header.group, header.op, header.id) {
            (protocol::GROUP_DEFAULT, protocol::OP_WRITE, protocol::ID_ECHO) => {
                self.echo(body, &mut rsp)
            }
            (protocol::GROUP_DEFAULT, protocol::OP_WRITE, protocol::ID_CONS_ECHO_CTRL) => {
                self.console_echo = !self.console_echo;
                rc_only(&mut rsp, rc::OK)
            }
            (protocol::GROUP_DEFAULT, protocol::OP_WRITE, protocol::ID_RESET) => {
                let (len, reset) = self.reset(body, &mut rsp)?;
                if reset {
                    outcome = Some(RecoveryOutcome::Reset);
                }
                Ok(len)
            }
            (protocol::GROUP_IMAGE, protocol::OP_READ, protocol::ID_STATE) => {
                self.state_read(&mut rsp)
            }
            (protocol::GROUP_IMAGE, protocol::OP_WRITE, protocol::ID_STATE) => {
                self.state_write(body, &mut rsp)
            }
            (protocol::GROUP_IMAGE, protocol::OP_WRITE, protocol::ID_UPLOAD) => {
                self.upload(body, &mut rsp)
            }
            (protocol::GROUP_IMAGE, protocol::OP_READ, protocol::ID_SLOT_INFO) => {
                self.slot_info(&mut rsp)
            }
            _ => rc_only(&mut rsp, rc::ENOTSUP),
        }
        .or_else(|_| rc_only(&mut rsp, rc::UNKNOWN))?;

        let mut out = [0u8; RSP_BUF + protocol::HDR_LEN];
        out[..protocol::HDR_LEN].copy_from_slice(&header.response(len));
        out[protocol::HDR_LEN..protocol::HDR_LEN + len].copy_from_slice(&rsp[..len]);
        frame::write_packet(self.serial, &out[..protocol::HDR_LEN + len])?;

        if outcome == Some(RecoveryOutcome::Reset) {
            self.drain();
        }
        Ok(outcome)
    }

    /// Absorbs late client bytes so the reset does not truncate the
    /// response mid-frame on the wire.
    fn drain(&mut self) {
        let start = self.clock.now();
        while self.clock.now() - start < DRAIN {
            if self.serial.read(READ_SLICE).is_err() {
                break;
            }
        }
    }

    fn echo(&mut self, body: &[u8], rsp: &mut [u8]) -> Result<usize> {
        let Ok(message) = protocol::parse_echo(body) else {
            return rc_only(rsp, rc::EINVAL);
        };
        let mut enc = Encoder::new(SliceWriter::new(rsp));
        enc.map(1)
            .and_then(|e| e.str("r"))
            .and_then(|e| e.str(message))
            .map_err(encode_err)?;
        Ok(enc.into_writer().len())
    }

    fn reset(&mut self, body: &[u8], rsp: &mut [u8]) -> Result<(usize, bool)> {
        let Ok(force) = protocol::parse_reset(body) else {
            return Ok((rc_only(rsp, rc::EINVAL)?, false));
        };
        if self.upload.active && !force {
            return Ok((rc_only(rsp, rc::EBUSY)?, false));
        }
        Ok((rc_only(rsp, rc::OK)?, true))
    }

    fn upload(&mut self, body: &[u8], rsp: &mut [u8]) -> Result<usize> {
        let Ok(req) = UploadReq::parse(body) else {
            return rc_only(rsp, rc::EINVAL);
        };
        let (Some(off), Some(data)) = (req.off, req.data) else {
            return rc_only(rsp, rc::EINVAL);
        };

        if off == 0 {
            let Some(total) = req.len else {
                return rc_only(rsp, rc::EINVAL);
            };
            let Ok(area) = self.map.open(AreaId::primary(req.image)) else {
                return rc_only(rsp, rc::ENOENT);
            };
            let layout = TrailerLayout::new(self.flash, self.enc_key.is_some());
            if total > layout.status_off(&area, false) {
                return rc_only(rsp, rc::NOMEM);
            }
            self.upload = UploadSession {
                active: true,
                image: req.image,
                expected_off: 0,
                total_len: total,
                not_yet_erased: 0,
            };
            info!("upload started: image {=u8}, {=u32} bytes", req.image, total);
        } else if !self.upload.active || req.image != self.upload.image {
            return rc_only(rsp, rc::EINVAL);
        }

        if off != self.upload.expected_off {
            // out-of-step chunk; tell the client where to continue
            return rc_off(rsp, rc::OK, self.upload.expected_off);
        }
        if off + data.len() as u32 > self.upload.total_len {
            return rc_only(rsp, rc::EINVAL);
        }

        let area = self.map.open(AreaId::primary(self.upload.image))?;
        let align = self.flash.align();
        let is_final = off + data.len() as u32 >= self.upload.total_len;
        let aligned_len = data.len() - data.len() % align as usize;

        let write_len = if is_final { data.len() } else { aligned_len };
        if write_len > 0 {
            let write_end = off + write_len as u32;
            while self.upload.not_yet_erased < write_end {
                let sector = area.sector_at(self.flash, self.upload.not_yet_erased)?;
                area.erase(self.flash, sector.off, sector.size)?;
                self.upload.not_yet_erased = sector.end();
            }
            if is_final && write_len % align as usize != 0 {
                // pad the tail up to the write block with erased bytes
                let mut tail = [0u8; frame::PACKET_MAX];
                let padded = write_len.next_multiple_of(align as usize);
                tail[..write_len].copy_from_slice(data);
                for byte in &mut tail[write_len..padded] {
                    *byte = self.flash.erased_val();
                }
                area.write(self.flash, off, &tail[..padded])?;
            } else {
                area.write(self.flash, off, &data[..write_len])?;
            }
        }
        self.upload.expected_off += write_len as u32;

        if self.upload.expected_off >= self.upload.total_len {
            self.upload.active = false;
            info!("upload complete");
            self.post_upload(area)?;
        }
        rc_off(rsp, rc::OK, self.upload.expected_off)
    }

    /// After the terminal chunk: decrypt an encrypted upload in place by
    /// bouncing each payload sector through scratch. Skipped (the image
    /// stays sealed) when no scratch area is configured.
    fn post_upload(&mut self, area: FlashArea) -> Result<()> {
        let header = ImageHeader::read_from(self.flash, &area, 0)?;
        if header.encryption().is_none() {
            return Ok(());
        }
        let Some(scratch) = self.map.scratch() else {
            warning!("encrypted upload left sealed: no scratch area");
            return Ok(());
        };
        let Some(cipher) =
            bootloader::load_cipher(self.flash, &area, &header, 0, self.unwrap, &self.enc_key)?
        else {
            return Ok(());
        };

        let pay_start = u32::from(header.hdr_size);
        let pay_end = pay_start + header.img_size;
        let mut off = 0u32;
        while off < pay_end {
            let sector = area.sector_at(self.flash, off)?;
            if sector.size > scratch.size {
                warning!("encrypted upload left sealed: scratch smaller than sector");
                return Ok(());
            }
            if sector.end() > pay_start {
                self.rewrite_sector_decrypted(
                    &area,
                    &scratch,
                    sector.off,
                    sector.size,
                    &cipher,
                    pay_start,
                    pay_end,
                )?;
            }
            off = sector.end();
        }
        Ok(())
    }

    #[allow(clippy::too_many_arguments)]
    fn rewrite_sector_decrypted(
        &mut self,
        area: &FlashArea,
        scratch: &FlashArea,
        sector_off: u32,
        sector_size: u32,
        cipher: &ImageCipher,
        pay_start: u32,
        pay_end: u32,
    ) -> Result<()> {
        scratch.erase_region(self.flash, 0, sector_size.min(scratch.size))?;
        let mut buf = [0u8; crate::config::SCRATCH_BUF_SIZE];
        // park the sector in scratch
        let mut done = 0;
        while done < sector_size {
            let chunk = (sector_size - done).min(buf.len() as u32);
            area.read(self.flash, sector_off + done, &mut buf[..chunk as usize])?;
            scratch.write(self.flash, done, &buf[..chunk as usize])?;
            done += chunk;
        }
        area.erase(self.flash, sector_off, sector_size)?;
        // restore it, decrypting the payload intersection
        let mut done = 0;
        while done < sector_size {
            let chunk = (sector_size - done).min(buf.len() as u32);
            let slice = &mut buf[..chunk as usize];
            scratch.read(self.flash, done, slice)?;
            let abs = sector_off + done;
            let lo = abs.max(pay_start);
            let hi = (abs + chunk).min(pay_end);
            if lo < hi {
                cipher.decrypt(lo - pay_start, &mut slice[(lo - abs) as usize..(hi - abs) as usize]);
            }
            area.write(self.flash, abs, slice)?;
            done += chunk;
        }
        Ok(())
    }

    fn state_write(&mut self, body: &[u8], rsp: &mut [u8]) -> Result<usize> {
        let Ok(req) = StateReq::parse(body) else {
            return rc_only(rsp, rc::EINVAL);
        };
        let result = if req.confirm {
            bootloader::set_confirmed(self.flash, &self.map, 0)
        } else {
            bootloader::set_pending(self.flash, &self.map, 0, false)
        };
        if result.is_err() {
            return rc_only(rsp, rc::UNKNOWN);
        }
        self.state_read(rsp)
    }

    fn state_read(&mut self, rsp: &mut [u8]) -> Result<usize> {
        let layout = TrailerLayout::new(self.flash, self.enc_key.is_some());
        // count the populated slots first; the array is definite-length
        let mut present = [[false; 2]; crate::config::MAX_IMAGES];
        let mut count = 0u64;
        for image in 0..self.map.image_count {
            for slot in 0..2u8 {
                if let Some((area, data_off)) = self.slot_area(image, slot) {
                    if let Ok(header) = ImageHeader::read_from(self.flash, &area, data_off) {
                        if !header.is_erased(self.flash.erased_val())
                            && header.is_sane(area.size - data_off)
                        {
                            present[image as usize][slot as usize] = true;
                            count += 1;
                        }
                    }
                }
            }
        }

        let mut enc = Encoder::new(SliceWriter::new(rsp));
        enc.map(1)
            .and_then(|e| e.str("images"))
            .and_then(|e| e.array(count))
            .map_err(encode_err)?;
        for image in 0..self.map.image_count {
            for slot in 0..2u8 {
                if !present[image as usize][slot as usize] {
                    continue;
                }
                self.encode_slot(&mut enc, &layout, image, slot)?;
            }
        }
        Ok(enc.into_writer().len())
    }

    fn slot_area(&self, image: u8, slot: u8) -> Option<(FlashArea, u32)> {
        let id = if slot == 0 { AreaId::primary(image) } else { AreaId::secondary(image) };
        let area = self.map.open(id).ok()?;
        let data_off = if slot == 1 && self.policy == SwapPolicy::Offset {
            // sector 0 of the secondary holds bookkeeping, not the image
            self.flash.sector_at(area.off).map(|s| s.size).unwrap_or(0)
        } else {
            0
        };
        Some((area, data_off))
    }

    fn encode_slot(
        &mut self,
        enc: &mut Encoder<SliceWriter>,
        layout: &TrailerLayout,
        image: u8,
        slot: u8,
    ) -> Result<()> {
        let (area, data_off) = self.slot_area(image, slot).ok_or(Error::NoPayload)?;
        let header = ImageHeader::read_from(self.flash, &area, data_off)?;
        let state = crate::swap::trailer::read_swap_state(self.flash, &area, layout)
            .unwrap_or(crate::swap::trailer::SwapState {
                magic: MagicState::Unset,
                swap_type: crate::swap::trailer::SwapType::None,
                image_num: 0,
                copy_done: FlagState::Unset,
                image_ok: FlagState::Unset,
            });

        let mut hash = [0u8; 32];
        let have_hash = self.read_hash_record(&area, &header, data_off, &mut hash)?;

        let version = version_string(&header);
        let version = core::str::from_utf8(&version.bytes[..version.len])
            .map_err(|_| Error::Decode("version"))?;

        let active = slot == 0;
        let confirmed = active && (state.image_ok == FlagState::Set || state.magic == MagicState::Unset);
        let pending = slot == 1 && state.magic == MagicState::Good;
        let permanent = pending && state.image_ok == FlagState::Set;

        let fields = 8 + u64::from(have_hash);
        enc.map(fields).map_err(encode_err)?;
        enc.str("image").and_then(|e| e.u32(u32::from(image))).map_err(encode_err)?;
        enc.str("slot").and_then(|e| e.u32(u32::from(slot))).map_err(encode_err)?;
        enc.str("version").and_then(|e| e.str(version)).map_err(encode_err)?;
        if have_hash {
            enc.str("hash").and_then(|e| e.bytes(&hash)).map_err(encode_err)?;
        }
        enc.str("bootable").and_then(|e| e.bool(header.is_bootable())).map_err(encode_err)?;
        enc.str("confirmed").and_then(|e| e.bool(confirmed)).map_err(encode_err)?;
        enc.str("active").and_then(|e| e.bool(active)).map_err(encode_err)?;
        enc.str("pending").and_then(|e| e.bool(pending)).map_err(encode_err)?;
        enc.str("permanent").and_then(|e| e.bool(permanent)).map_err(encode_err)?;
        Ok(())
    }

    /// The stored SHA-256 record, used by clients to identify images.
    fn read_hash_record(
        &mut self,
        area: &FlashArea,
        header: &ImageHeader,
        data_off: u32,
        out: &mut [u8; 32],
    ) -> Result<bool> {
        let Ok(mut cursor) =
            TlvCursor::begin(self.flash, area, header, data_off, DigestKind::Sha256.tlv_kind(), false)
        else {
            return Ok(false);
        };
        match cursor.next(self.flash, area) {
            Ok(Some(entry)) if entry.len == 32 => {
                area.read(self.flash, entry.off, out)?;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    fn slot_info(&mut self, rsp: &mut [u8]) -> Result<usize> {
        let layout = TrailerLayout::new(self.flash, self.enc_key.is_some());
        let mut enc = Encoder::new(SliceWriter::new(rsp));
        enc.map(1)
            .and_then(|e| e.str("images"))
            .and_then(|e| e.array(u64::from(self.map.image_count)))
            .map_err(encode_err)?;
        for image in 0..self.map.image_count {
            let primary = self.map.open(AreaId::primary(image))?;
            let secondary = self.map.open(AreaId::secondary(image))?;
            let max = layout.status_off(&primary, false);
            enc.map(3).map_err(encode_err)?;
            enc.str("image").and_then(|e| e.u32(u32::from(image))).map_err(encode_err)?;
            enc.str("slots").and_then(|e| e.array(2)).map_err(encode_err)?;
            for (slot, area) in [(0u32, &primary), (1u32, &secondary)] {
                enc.map(2).map_err(encode_err)?;
                enc.str("slot").and_then(|e| e.u32(slot)).map_err(encode_err)?;
                enc.str("size").and_then(|e| e.u32(area.size)).map_err(encode_err)?;
            }
            enc.str("max_image_size").and_then(|e| e.u32(max)).map_err(encode_err)?;
        }
        Ok(enc.into_writer().len())
    }

    #[cfg(test)]
    fn upload_cursor(&self) -> u32 {
        self.upload.expected_off
    }
}

fn rc_only(rsp: &mut [u8], code: u32) -> Result<usize> {
    let mut enc = Encoder::new(SliceWriter::new(rsp));
    enc.map(1)
        .and_then(|e| e.str("rc"))
        .and_then(|e| e.u32(code))
        .map_err(encode_err)?;
    Ok(enc.into_writer().len())
}

fn rc_off(rsp: &mut [u8], code: u32, off: u32) -> Result<usize> {
    let mut enc = Encoder::new(SliceWriter::new(rsp));
    enc.map(2)
        .and_then(|e| e.str("rc"))
        .and_then(|e| e.u32(code))
        .and_then(|e| e.str("off"))
        .and_then(|e| e.u32(off))
        .map_err(encode_err)?;
    Ok(enc.into_writer().len())
}
