//! Content-defined chunking of build contexts.
//!
//! A Rabin fingerprint over a sliding 64-byte window decides chunk
//! boundaries, so cut points depend on content rather than offsets: inserting
//! bytes near the start of a stream only moves the boundaries around the
//! edit. Client and server share [`SPLIT_POLYNOMIAL`]. A [`ChunkManifest`]
//! is the ordered list of chunk digests, encoded as a flat concatenation of
//! 32-byte SHA-256 values.

use std::fmt;

use bytes::{Bytes, BytesMut};
use sha2::{Digest, Sha256};

use crate::error::{FerryError, Result};

/// Header marking a build request whose body is a chunk manifest.
pub const MANIFEST_HEADER: &str = "X-Ferry-Chunked";

/// Irreducible polynomial of degree 53 used for the rolling fingerprint.
pub const SPLIT_POLYNOMIAL: u64 = 0x3DA3_358B_4DC1_73;

/// Size of the sliding window in bytes.
pub const WINDOW_SIZE: usize = 64;

/// Width of one manifest entry.
pub const DIGEST_LEN: usize = 32;

/// Chunk size bounds and the boundary mask.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChunkerConfig {
    /// No cut before this many bytes.
    pub min_size: usize,
    /// Forced cut at this many bytes.
    pub max_size: usize,
    /// Number of low fingerprint bits that must be zero at a cut point;
    /// the average chunk size is about `2^mask_bits`.
    pub mask_bits: u32,
}

impl Default for ChunkerConfig {
    fn default() -> Self {
        Self {
            min_size: 512 * 1024,
            max_size: 8 * 1024 * 1024,
            mask_bits: 20,
        }
    }
}

impl ChunkerConfig {
    fn validate(&self) -> Result<()> {
        if self.min_size <= WINDOW_SIZE {
            return Err(FerryError::Config(format!(
                "chunk min_size must exceed the {} byte window",
                WINDOW_SIZE
            )));
        }
        if self.max_size < self.min_size {
            return Err(FerryError::Config(format!(
                "chunk max_size ({}) is below min_size ({})",
                self.max_size, self.min_size
            )));
        }
        if self.mask_bits == 0 || self.mask_bits >= 48 {
            return Err(FerryError::Config(format!(
                "chunk mask_bits must be in 1..48, got {}",
                self.mask_bits
            )));
        }
        Ok(())
    }
}

/// SHA-256 digest identifying a chunk.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ChunkDigest([u8; DIGEST_LEN]);

impl ChunkDigest {
    /// Digest of `data`.
    pub fn of(data: &[u8]) -> Self {
        Self(Sha256::digest(data).into())
    }

    /// Parse a lowercase or uppercase hex digest.
    pub fn from_hex(hex_digest: &str) -> Result<Self> {
        let mut raw = [0u8; DIGEST_LEN];
        hex::decode_to_slice(hex_digest, &mut raw).map_err(|e| {
            FerryError::invalid_parameter("hash", hex_digest, format!("not a sha256 hex digest: {}", e))
        })?;
        Ok(Self(raw))
    }

    /// Lowercase hex form, the chunk's key in the store.
    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    /// Raw digest bytes.
    pub fn as_bytes(&self) -> &[u8; DIGEST_LEN] {
        &self.0
    }
}

impl fmt::Display for ChunkDigest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

impl fmt::Debug for ChunkDigest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ChunkDigest({})", self.to_hex())
    }
}

/// Ordered digests reproducing one stream.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ChunkManifest {
    digests: Vec<ChunkDigest>,
}

impl ChunkManifest {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, digest: ChunkDigest) {
        self.digests.push(digest);
    }

    pub fn digests(&self) -> &[ChunkDigest] {
        &self.digests
    }

    pub fn len(&self) -> usize {
        self.digests.len()
    }

    pub fn is_empty(&self) -> bool {
        self.digests.is_empty()
    }

    /// Flat concatenation of the raw digests.
    pub fn encode(&self) -> Bytes {
        let mut out = BytesMut::with_capacity(self.digests.len() * DIGEST_LEN);
        for digest in &self.digests {
            out.extend_from_slice(digest.as_bytes());
        }
        out.freeze()
    }

    /// Decode a manifest body. The length must be a multiple of the digest width.
    pub fn decode(body: &[u8]) -> Result<Self> {
        if body.len() % DIGEST_LEN != 0 {
            return Err(FerryError::Transfer(format!(
                "chunk manifest length {} is not a multiple of {}",
                body.len(),
                DIGEST_LEN
            )));
        }
        let digests = body
            .chunks_exact(DIGEST_LEN)
            .map(|entry| {
                let mut raw = [0u8; DIGEST_LEN];
                raw.copy_from_slice(entry);
                ChunkDigest(raw)
            })
            .collect();
        Ok(Self { digests })
    }
}

impl FromIterator<ChunkDigest> for ChunkManifest {
    fn from_iter<I: IntoIterator<Item = ChunkDigest>>(iter: I) -> Self {
        Self {
            digests: iter.into_iter().collect(),
        }
    }
}

/// Lookup tables derived from the polynomial.
struct Tables {
    out: [u64; 256],
    modulo: [u64; 256],
    shift: u32,
}

fn degree(p: u64) -> i32 {
    63 - p.leading_zeros() as i32
}

fn poly_mod(mut x: u64, d: u64) -> u64 {
    let dd = degree(d);
    while x != 0 && degree(x) >= dd {
        x ^= d << (degree(x) - dd);
    }
    x
}

fn append_byte(hash: u64, b: u8, pol: u64) -> u64 {
    poly_mod((hash << 8) | b as u64, pol)
}

impl Tables {
    fn new(pol: u64) -> Self {
        let k = degree(pol) as u32;
        let mut out = [0u64; 256];
        let mut modulo = [0u64; 256];
        for b in 0..256usize {
            let mut h = append_byte(0, b as u8, pol);
            for _ in 0..WINDOW_SIZE - 1 {
                h = append_byte(h, 0, pol);
            }
            out[b] = h;
            modulo[b] = poly_mod((b as u64) << k, pol) | ((b as u64) << k);
        }
        Self {
            out,
            modulo,
            shift: k - 8,
        }
    }
}

/// Incremental content-defined chunker.
///
/// Feed arbitrary slices with [`Chunker::feed`]; completed chunks are
/// returned as soon as their cut point is seen. [`Chunker::finish`] returns
/// the trailing partial chunk.
pub struct Chunker {
    config: ChunkerConfig,
    tables: Tables,
    mask: u64,
    window: [u8; WINDOW_SIZE],
    wpos: usize,
    digest: u64,
    current: BytesMut,
}

impl Chunker {
    /// Create a chunker using the shared polynomial.
    pub fn new(config: ChunkerConfig) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            config,
            tables: Tables::new(SPLIT_POLYNOMIAL),
            mask: (1u64 << config.mask_bits) - 1,
            window: [0; WINDOW_SIZE],
            wpos: 0,
            digest: 0,
            current: BytesMut::new(),
        })
    }

    fn reset(&mut self) {
        self.window = [0; WINDOW_SIZE];
        self.wpos = 0;
        self.digest = 0;
    }

    fn slide(&mut self, b: u8) {
        let out = self.window[self.wpos];
        self.window[self.wpos] = b;
        self.digest ^= self.tables.out[out as usize];
        self.wpos = (self.wpos + 1) % WINDOW_SIZE;

        let index = (self.digest >> self.tables.shift) as usize & 0xff;
        self.digest = (self.digest << 8) | b as u64;
        self.digest ^= self.tables.modulo[index];
    }

    /// Consume `data`, returning every chunk completed by it.
    pub fn feed(&mut self, data: &[u8]) -> Vec<Bytes> {
        let mut chunks = Vec::new();
        let mut start = 0;
        let skip = self.config.min_size - WINDOW_SIZE;

        for (i, &b) in data.iter().enumerate() {
            let len = self.current.len() + (i - start) + 1;
            if len <= skip {
                continue;
            }
            self.slide(b);

            let boundary = len >= self.config.min_size && self.digest & self.mask == 0;
            if boundary || len >= self.config.max_size {
                self.current.extend_from_slice(&data[start..=i]);
                chunks.push(self.current.split().freeze());
                start = i + 1;
                self.reset();
            }
        }

        self.current.extend_from_slice(&data[start..]);
        chunks
    }

    /// Return the trailing bytes as a final chunk, if any.
    pub fn finish(mut self) -> Option<Bytes> {
        if self.current.is_empty() {
            None
        } else {
            Some(self.current.split().freeze())
        }
    }

    /// Chunk a complete buffer.
    pub fn split_all(config: ChunkerConfig, data: &[u8]) -> Result<Vec<Bytes>> {
        let mut chunker = Self::new(config)?;
        let mut chunks = chunker.feed(data);
        chunks.extend(chunker.finish());
        Ok(chunks)
    }
}
