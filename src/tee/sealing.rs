//! Sealing: AES-256-GCM under session keys, plus the on-disk frame format
//!
//! A sealed frame is laid out as
//!
//! ```text
//! magic "PSF1" | flags u8 | iv (12) | ciphertext_len u32 LE | ciphertext | mac (16)
//! ```
//!
//! The length field locates the MAC without scanning the ciphertext. The AAD
//! covers the key id, the logical file name, the byte offset and the flags, so
//! a frame copied to another file, position or key slot fails to open, and a
//! cleared `FINAL` flag is detected. A sealed file is a run of frames whose
//! last one, and only that one, carries `FINAL`.

use crate::error::{EngineError, Result};
use crate::storage::FileHandle;
use aes_gcm::{
    aead::{AeadInPlace, KeyInit},
    Aes256Gcm, Nonce, Tag,
};
use rand::rngs::OsRng;
use rand::RngCore;
use serde::{Deserialize, Serialize};
use zeroize::{Zeroize, ZeroizeOnDrop, Zeroizing};

pub const KEY_LEN: usize = 32;
pub const IV_LEN: usize = 12;
pub const MAC_LEN: usize = 16;
pub const FRAME_MAGIC: &[u8; 4] = b"PSF1";
pub const FRAME_HEADER_LEN: usize = 4 + 1 + IV_LEN + 4;

/// Set on the last frame of a sealed file
pub const FLAG_FINAL: u8 = 0x01;

/// Symmetric key held inside an enclave session. Wiped on drop.
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub struct SessionKey {
    bytes: [u8; KEY_LEN],
}

impl SessionKey {
    pub fn generate() -> Self {
        let mut bytes = [0u8; KEY_LEN];
        OsRng.fill_bytes(&mut bytes);
        Self { bytes }
    }

    pub fn from_bytes(bytes: [u8; KEY_LEN]) -> Self {
        Self { bytes }
    }

    pub fn from_slice(bytes: &[u8]) -> Result<Self> {
        let bytes: [u8; KEY_LEN] = bytes.try_into().map_err(|_| {
            EngineError::KeyExchangeFailure(format!("key must be {} bytes", KEY_LEN))
        })?;
        Ok(Self { bytes })
    }

    pub(crate) fn as_bytes(&self) -> &[u8; KEY_LEN] {
        &self.bytes
    }

    /// True once the key material has been wiped
    pub fn is_cleared(&self) -> bool {
        self.bytes.iter().all(|b| *b == 0)
    }

    fn cipher(&self) -> Result<Aes256Gcm> {
        Aes256Gcm::new_from_slice(&self.bytes)
            .map_err(|e| EngineError::CryptoFailure(format!("cipher init: {}", e)))
    }
}

impl std::fmt::Debug for SessionKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("SessionKey(<redacted>)")
    }
}

/// Detached AEAD output
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Sealed {
    pub ciphertext: Vec<u8>,
    pub iv: [u8; IV_LEN],
    pub mac: [u8; MAC_LEN],
}

/// Encrypt `plaintext` with a fresh random IV
pub fn seal(key: &SessionKey, plaintext: &[u8], aad: &[u8]) -> Result<Sealed> {
    let mut iv = [0u8; IV_LEN];
    OsRng.fill_bytes(&mut iv);

    let mut buffer = plaintext.to_vec();
    let tag = key
        .cipher()?
        .encrypt_in_place_detached(Nonce::from_slice(&iv), aad, &mut buffer)
        .map_err(|e| {
            buffer.zeroize();
            EngineError::CryptoFailure(format!("encryption failed: {}", e))
        })?;

    let mut mac = [0u8; MAC_LEN];
    mac.copy_from_slice(tag.as_slice());
    Ok(Sealed {
        ciphertext: buffer,
        iv,
        mac,
    })
}

/// Decrypt and authenticate. On tag mismatch nothing is returned.
pub fn open(key: &SessionKey, sealed: &Sealed, aad: &[u8]) -> Result<Zeroizing<Vec<u8>>> {
    let mut buffer = Zeroizing::new(sealed.ciphertext.clone());
    key.cipher()?
        .decrypt_in_place_detached(
            Nonce::from_slice(&sealed.iv),
            aad,
            buffer.as_mut_slice(),
            Tag::from_slice(&sealed.mac),
        )
        .map_err(|_| EngineError::AuthenticationFailure)?;
    Ok(buffer)
}

/// Where a frame lives: key slot, logical file name and byte offset
#[derive(Debug, Clone, Copy)]
pub struct FrameSlot<'a> {
    pub key_id: &'a str,
    /// File name as the caller passed it, before store resolution
    pub file: &'a str,
    pub offset: u64,
}

impl<'a> FrameSlot<'a> {
    pub fn new(key_id: &'a str, file: &'a str, offset: u64) -> Self {
        Self {
            key_id,
            file,
            offset,
        }
    }

    pub fn at(self, offset: u64) -> Self {
        Self { offset, ..self }
    }

    /// AAD binding a frame to this slot and its flags
    pub fn aad(&self, flags: u8) -> Vec<u8> {
        let mut aad = Vec::with_capacity(self.key_id.len() + self.file.len() + 11);
        aad.extend_from_slice(self.key_id.as_bytes());
        aad.push(0);
        aad.extend_from_slice(self.file.as_bytes());
        aad.push(0);
        aad.extend_from_slice(&self.offset.to_le_bytes());
        aad.push(flags);
        aad
    }
}

/// Serialize a sealed payload as one frame
pub fn encode_frame(sealed: &Sealed, flags: u8) -> Result<Vec<u8>> {
    let len = u32::try_from(sealed.ciphertext.len())
        .map_err(|_| EngineError::CryptoFailure("frame larger than 4 GiB".into()))?;
    let mut out = Vec::with_capacity(FRAME_HEADER_LEN + sealed.ciphertext.len() + MAC_LEN);
    out.extend_from_slice(FRAME_MAGIC);
    out.push(flags);
    out.extend_from_slice(&sealed.iv);
    out.extend_from_slice(&len.to_le_bytes());
    out.extend_from_slice(&sealed.ciphertext);
    out.extend_from_slice(&sealed.mac);
    Ok(out)
}

/// Parsed frame header
#[derive(Debug, Clone, Copy)]
pub struct FrameHeader {
    pub flags: u8,
    pub iv: [u8; IV_LEN],
    pub ciphertext_len: usize,
}

impl FrameHeader {
    pub fn parse(bytes: &[u8]) -> Result<Self> {
        if bytes.len() < FRAME_HEADER_LEN {
            return Err(EngineError::Malformed("truncated frame header".into()));
        }
        if &bytes[..4] != FRAME_MAGIC {
            return Err(EngineError::Malformed("bad frame magic".into()));
        }
        let flags = bytes[4];
        if flags & !FLAG_FINAL != 0 {
            return Err(EngineError::Malformed(format!("unknown frame flags {:#04x}", flags)));
        }
        let mut iv = [0u8; IV_LEN];
        iv.copy_from_slice(&bytes[5..5 + IV_LEN]);
        let mut len = [0u8; 4];
        len.copy_from_slice(&bytes[5 + IV_LEN..FRAME_HEADER_LEN]);
        Ok(Self {
            flags,
            iv,
            ciphertext_len: u32::from_le_bytes(len) as usize,
        })
    }

    /// Total bytes the frame occupies on disk
    pub fn frame_len(&self) -> usize {
        FRAME_HEADER_LEN + self.ciphertext_len + MAC_LEN
    }

    pub fn is_final(&self) -> bool {
        self.flags & FLAG_FINAL != 0
    }
}

/// An authenticated frame read back from disk
pub struct OpenedFrame {
    pub plaintext: Zeroizing<Vec<u8>>,
    /// Bytes the frame occupies on disk
    pub frame_len: usize,
    pub is_final: bool,
}

/// Seal `plaintext` and write it as one frame at `slot`. Returns the frame length.
pub fn write_frame(
    handle: &mut FileHandle,
    key: &SessionKey,
    slot: FrameSlot<'_>,
    plaintext: &[u8],
    is_final: bool,
) -> Result<usize> {
    let flags = if is_final { FLAG_FINAL } else { 0 };
    let sealed = seal(key, plaintext, &slot.aad(flags))?;
    let frame = encode_frame(&sealed, flags)?;
    handle.write_at(&frame, slot.offset)?;
    Ok(frame.len())
}

/// Read and authenticate the frame at `slot`
pub fn read_frame(
    handle: &mut FileHandle,
    key: &SessionKey,
    slot: FrameSlot<'_>,
) -> Result<OpenedFrame> {
    let offset = slot.offset;
    let mut header_bytes = [0u8; FRAME_HEADER_LEN];
    let n = handle.read_at(&mut header_bytes, offset)?;
    let header = FrameHeader::parse(&header_bytes[..n])?;

    // The length field is untrusted until the MAC checks out.
    let size = handle.size()?;
    let available = size.saturating_sub(offset);
    if header.frame_len() as u64 > available {
        return Err(EngineError::Malformed(format!(
            "frame at {} truncated: declares {} bytes, {} left in file",
            offset,
            header.frame_len(),
            available
        )));
    }

    let mut body = vec![0u8; header.ciphertext_len + MAC_LEN];
    let n = handle.read_at(&mut body, offset + FRAME_HEADER_LEN as u64)?;
    if n != body.len() {
        return Err(EngineError::Malformed(format!(
            "frame at {} truncated: expected {} bytes, found {}",
            offset,
            body.len(),
            n
        )));
    }

    let mut mac = [0u8; MAC_LEN];
    mac.copy_from_slice(&body[header.ciphertext_len..]);
    body.truncate(header.ciphertext_len);
    let sealed = Sealed {
        ciphertext: body,
        iv: header.iv,
        mac,
    };
    let plaintext = open(key, &sealed, &slot.aad(header.flags))?;
    Ok(OpenedFrame {
        plaintext,
        frame_len: header.frame_len(),
        is_final: header.is_final(),
    })
}

/// Write `data` as consecutive frames of at most `chunk_size` bytes starting
/// at offset 0. The last frame is marked final; empty data becomes one empty
/// final frame. Returns bytes written.
pub fn write_stream(
    handle: &mut FileHandle,
    key: &SessionKey,
    key_id: &str,
    file: &str,
    data: &[u8],
    chunk_size: usize,
) -> Result<u64> {
    let chunks: Vec<&[u8]> = if data.is_empty() {
        vec![data]
    } else {
        data.chunks(chunk_size.max(1)).collect()
    };
    let last = chunks.len() - 1;
    let slot = FrameSlot::new(key_id, file, 0);
    let mut offset = 0u64;
    for (i, chunk) in chunks.into_iter().enumerate() {
        offset += write_frame(handle, key, slot.at(offset), chunk, i == last)? as u64;
    }
    Ok(offset)
}

/// Open every frame of a sealed file written by [`write_stream`].
///
/// The file must end exactly at a final frame: a missing final frame means
/// the tail was cut off, bytes after it mean something was appended.
pub fn read_stream(
    handle: &mut FileHandle,
    key: &SessionKey,
    key_id: &str,
    file: &str,
) -> Result<Zeroizing<Vec<u8>>> {
    let size = handle.size()?;
    let slot = FrameSlot::new(key_id, file, 0);
    let mut out = Zeroizing::new(Vec::new());
    let mut offset = 0u64;
    loop {
        if offset >= size {
            return Err(EngineError::Malformed(format!(
                "{} ends at {} without a final frame",
                file, offset
            )));
        }
        let frame = read_frame(handle, key, slot.at(offset))?;
        out.extend_from_slice(&frame.plaintext);
        offset += frame.frame_len as u64;
        if frame.is_final {
            break;
        }
    }
    if offset != size {
        return Err(EngineError::Malformed(format!(
            "{} has {} bytes after its final frame",
            file,
            size - offset
        )));
    }
    Ok(out)
}
