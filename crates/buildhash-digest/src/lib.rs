//! Content digest (`Sig`) computation and the low-level byte encodings it
//! builds on: minimal two's-complement integers and the `hcat`/`hsplit`
//! concatenation format used to combine sub-digests into a compound digest.
//!
//! A [`Sig`] is 1-32 bytes: a one-byte header followed by a body. The header
//! encodes two flags and, for short digests, the total length:
//!
//! - bit 7 (`LONG`): body lives in the CAS keyed by this digest (32-byte
//!   SHA-256, header byte replaced in place); clear means the body is
//!   inline, immediately following the header.
//! - bit 6 (`COMPOUND`): body is a concatenation of sub-digests rather than
//!   opaque bytes.
//! - bits 0-5: for short digests, `header & 0x3F == total length`.

#![deny(unsafe_code)]

use std::io::{self, Read};

use sha2::{Digest, Sha256};
use thiserror::Error;

/// Digest is 32 bytes and its body lives in the CAS.
pub const HFLAG_LONG: u8 = 0x80;
/// Digest's body is a concatenation of sub-digests, not opaque bytes.
pub const HFLAG_COMPOUND: u8 = 0x40;
/// Mask isolating the short-form length bits of the header byte.
pub const HFLAG_MASK: u8 = 0x3F;
/// Fixed length of a long-form digest, header included.
pub const HASH_SIZE: usize = 32;

/// Block size used by [`hash_stream`] to decide whether to take the
/// in-memory short-body path or the incremental SHA-256 path.
const STREAM_BLOCK: usize = 65536;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum DigestError {
    #[error("digest shape invariant violated: {0}")]
    Assertion(&'static str),
}

/// A content digest: 1-32 bytes, header byte first.
///
/// Short digests (header's LONG bit clear) self-identify: the digest alone
/// contains the whole serialized body. Long digests are exactly 32 bytes and
/// point into the CAS.
#[derive(Clone, PartialEq, Eq, Hash)]
pub struct Sig(Box<[u8]>);

impl Sig {
    /// Construct a `Sig` from its raw encoded bytes, validating the shape
    /// invariants from the data model: length in 1..=32, and for short
    /// digests the header's length bits must match the actual length.
    pub fn from_raw(bytes: Vec<u8>) -> Result<Self, DigestError> {
        if bytes.is_empty() || bytes.len() > HASH_SIZE {
            return Err(DigestError::Assertion("sig length must be 1..=32"));
        }
        let header = bytes[0];
        if header & HFLAG_LONG != 0 {
            if bytes.len() != HASH_SIZE {
                return Err(DigestError::Assertion("long sig must be exactly 32 bytes"));
            }
        } else if (header & HFLAG_MASK) as usize != bytes.len() {
            return Err(DigestError::Assertion(
                "short sig header length must match byte length",
            ));
        }
        Ok(Sig(bytes.into_boxed_slice()))
    }

    /// The raw encoded bytes: header byte followed by body.
    #[must_use]
    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    #[must_use]
    pub fn header(&self) -> u8 {
        self.0[0]
    }

    #[must_use]
    pub fn is_long(&self) -> bool {
        self.header() & HFLAG_LONG != 0
    }

    #[must_use]
    pub fn is_compound(&self) -> bool {
        self.header() & HFLAG_COMPOUND != 0
    }

    /// The body bytes inlined in the digest itself. Only meaningful for
    /// short digests; for long digests the body lives in the CAS.
    #[must_use]
    pub fn inline_body(&self) -> &[u8] {
        &self.0[1..]
    }

    #[must_use]
    pub fn to_hex(&self) -> String {
        self.0.iter().map(|b| format!("{b:02x}")).collect()
    }
}

impl std::fmt::Debug for Sig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Sig({})", self.to_hex())
    }
}

/// Hash a byte string into a `Sig`, taking the short-body path for inputs of
/// 31 bytes or fewer and the SHA-256 long-form path otherwise.
#[must_use]
pub fn hash_bytes(data: &[u8], flags: u8) -> Sig {
    if data.len() <= 31 {
        let header = (data.len() as u8 + 1) | flags;
        let mut out = Vec::with_capacity(1 + data.len());
        out.push(header);
        out.extend_from_slice(data);
        Sig(out.into_boxed_slice())
    } else {
        let digest = Sha256::digest(data);
        let mut out = [0u8; HASH_SIZE];
        out.copy_from_slice(&digest);
        out[0] = HFLAG_LONG | flags | (out[0] & HFLAG_MASK);
        Sig(Box::new(out))
    }
}

/// Hash a stream, taking the short-body in-memory path when the entire
/// stream is smaller than `STREAM_BLOCK`, else hashing incrementally.
pub fn hash_stream<R: Read>(mut reader: R, flags: u8) -> io::Result<Sig> {
    let mut first = vec![0u8; STREAM_BLOCK];
    let filled = read_fill(&mut reader, &mut first)?;
    if filled < STREAM_BLOCK {
        first.truncate(filled);
        return Ok(hash_bytes(&first, flags));
    }

    let mut hasher = Sha256::new();
    hasher.update(&first[..filled]);
    let mut chunk = vec![0u8; STREAM_BLOCK];
    loop {
        let n = read_fill(&mut reader, &mut chunk)?;
        if n == 0 {
            break;
        }
        hasher.update(&chunk[..n]);
        if n < STREAM_BLOCK {
            break;
        }
    }
    let digest = hasher.finalize();
    let mut out = [0u8; HASH_SIZE];
    out.copy_from_slice(&digest);
    out[0] = HFLAG_LONG | flags | (out[0] & HFLAG_MASK);
    Ok(Sig(Box::new(out)))
}

/// Read until `buf` is full or the stream is exhausted, returning the
/// number of bytes actually read. Needed because `Read::read` may return
/// short reads before EOF.
fn read_fill<R: Read>(reader: &mut R, buf: &mut [u8]) -> io::Result<usize> {
    let mut filled = 0;
    while filled < buf.len() {
        match reader.read(&mut buf[filled..])? {
            0 => break,
            n => filled += n,
        }
    }
    Ok(filled)
}

/// Concatenate the raw encoded bytes of several digests and hash the
/// result with the `COMPOUND` flag set, returning both the concatenated
/// bytes (for CAS storage) and the resulting digest.
#[must_use]
pub fn hcat(sigs: &[Sig]) -> (Vec<u8>, Sig) {
    let mut buf = Vec::new();
    for s in sigs {
        buf.extend_from_slice(s.as_bytes());
    }
    let sig = hash_bytes(&buf, HFLAG_COMPOUND);
    (buf, sig)
}

/// Inverse of [`hcat`]: split a concatenated-digest byte string back into
/// its component `Sig`s.
pub fn hsplit(bytes: &[u8]) -> Result<Vec<Sig>, DigestError> {
    let mut out = Vec::new();
    let mut i = 0;
    while i < bytes.len() {
        let b0 = bytes[i];
        if b0 == 0 {
            // pad byte
            i += 1;
            continue;
        }
        let n = if b0 & HFLAG_LONG != 0 {
            HASH_SIZE
        } else {
            (b0 & HFLAG_MASK) as usize
        };
        if i + n > bytes.len() {
            return Err(DigestError::Assertion("hsplit: truncated sub-digest"));
        }
        out.push(Sig::from_raw(bytes[i..i + n].to_vec())?);
        i += n;
    }
    Ok(out)
}

/// Number of bytes needed for the minimal little-endian two's-complement
/// encoding of `i`: zero bytes for zero, else enough bytes to preserve sign.
#[must_use]
pub fn int_byte_length(i: i128) -> usize {
    if i == 0 {
        0
    } else if i > 0 {
        (bit_length(i) / 8 + 1) as usize
    } else {
        (bit_length(i + 1) / 8 + 1) as usize
    }
}

fn bit_length(n: i128) -> u32 {
    if n == 0 {
        0
    } else {
        128 - n.unsigned_abs().leading_zeros()
    }
}

/// Encode an integer as minimal little-endian two's complement.
#[must_use]
pub fn encode_int(i: i128) -> Vec<u8> {
    let n = int_byte_length(i);
    i.to_le_bytes()[..n].to_vec()
}

/// Decode a minimal little-endian two's complement integer.
#[must_use]
pub fn decode_int(bytes: &[u8]) -> i128 {
    if bytes.is_empty() {
        return 0;
    }
    let mut buf = [0u8; 16];
    buf[..bytes.len()].copy_from_slice(bytes);
    if bytes[bytes.len() - 1] & 0x80 != 0 {
        for b in buf.iter_mut().skip(bytes.len()) {
            *b = 0xFF;
        }
    }
    i128::from_le_bytes(buf)
}
