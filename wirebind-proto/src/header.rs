//! Fixed-size message header.

use crate::message::CodecError;

/// Size of the encoded [`MessageHeader`] in bytes.
pub const HEADER_SIZE: usize = 16;

/// Magic number identifying the current wire format revision.
pub const MAGIC_NUMBER_INITIAL: u8 = 1;

/// Ordinal reserved for epitaph messages.
pub const EPITAPH_ORDINAL: u64 = u64::MAX;

/// Dynamic flag in `flags[2]`: the call targets a flexible method, one the
/// receiver may not know without that being a protocol error.
pub const FLEXIBLE_METHOD: u8 = 0x80;

/// Header prepended to every message.
///
/// Layout (little-endian):
///
/// | offset | size | field     |
/// |--------|------|-----------|
/// | 0      | 4    | `txid`    |
/// | 4      | 3    | `flags`   |
/// | 7      | 1    | `magic`   |
/// | 8      | 8    | `ordinal` |
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MessageHeader {
    /// Transaction ID. Zero for events and one-way calls.
    pub txid: u32,
    /// Flag bytes. `flags[2]` holds the dynamic flags, see
    /// [`FLEXIBLE_METHOD`]; the others are zero on send.
    pub flags: [u8; 3],
    /// Wire format magic number.
    pub magic: u8,
    /// Method ordinal.
    pub ordinal: u64,
}

impl MessageHeader {
    /// Creates a header for `ordinal` using the current magic number.
    pub const fn new(txid: u32, ordinal: u64) -> Self {
        Self {
            txid,
            flags: [0; 3],
            magic: MAGIC_NUMBER_INITIAL,
            ordinal,
        }
    }

    /// Marks the header as belonging to a flexible method.
    #[must_use]
    pub const fn flexible(mut self) -> Self {
        self.flags[2] |= FLEXIBLE_METHOD;
        self
    }

    /// `true` if the sender marked the method flexible.
    pub const fn is_flexible(&self) -> bool {
        self.flags[2] & FLEXIBLE_METHOD != 0
    }

    /// Returns `true` if this header belongs to an epitaph.
    pub const fn is_epitaph(&self) -> bool {
        self.ordinal == EPITAPH_ORDINAL
    }

    /// Serializes the header into its 16-byte wire form.
    pub fn to_bytes(&self) -> [u8; HEADER_SIZE] {
        let mut out = [0u8; HEADER_SIZE];
        out[0..4].copy_from_slice(&self.txid.to_le_bytes());
        out[4..7].copy_from_slice(&self.flags);
        out[7] = self.magic;
        out[8..16].copy_from_slice(&self.ordinal.to_le_bytes());
        out
    }

    /// Parses a header from the front of `bytes`.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, CodecError> {
        let raw: &[u8; HEADER_SIZE] = bytes
            .get(..HEADER_SIZE)
            .and_then(|b| b.try_into().ok())
            .ok_or(CodecError::Header("message shorter than header"))?;
        let magic = raw[7];
        if magic != MAGIC_NUMBER_INITIAL {
            return Err(CodecError::Header("unsupported magic number"));
        }
        let mut txid = [0u8; 4];
        txid.copy_from_slice(&raw[0..4]);
        let mut ordinal = [0u8; 8];
        ordinal.copy_from_slice(&raw[8..16]);
        Ok(Self {
            txid: u32::from_le_bytes(txid),
            flags: [raw[4], raw[5], raw[6]],
            magic,
            ordinal: u64::from_le_bytes(ordinal),
        })
    }

    /// Overwrites the transaction ID in an already encoded message.
    ///
    /// Used by clients, which only learn the ID after encoding.
    pub fn set_txid(bytes: &mut [u8], txid: u32) {
        if let Some(field) = bytes.get_mut(0..4) {
            field.copy_from_slice(&txid.to_le_bytes());
        }
    }
}
