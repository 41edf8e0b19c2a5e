//! Wire format for trade messages
//!
//! Fixed 96-byte little-endian layout with a CRC32 trailer. Prices use
//! fixed-point arithmetic so the payload is byte-stable across hosts.

use chrono::{TimeZone, Utc};
use uuid::Uuid;

use crate::models::{DecodedTrade, Side};

/// Magic bytes: 0x7E4D ("trade msg")
pub const TRADE_MAGIC: u16 = 0x7E4D;

/// Current format version
pub const TRADE_VERSION: u8 = 1;

/// Total message size in bytes
pub const TRADE_MSG_SIZE: usize = 96;

/// Price multiplier for fixed-point (8 decimal places)
pub const FIXED_POINT_SCALE: f64 = 100_000_000.0;

/// Maximum symbol length on the wire
pub const SYMBOL_LEN: usize = 12;

// Field offsets within the 96-byte frame
const OFF_MAGIC: usize = 0;
const OFF_VERSION: usize = 2;
const OFF_SIDE: usize = 3;
const OFF_PORTFOLIO: usize = 4;
const OFF_TRADE: usize = 20;
const OFF_SYMBOL: usize = 36;
const OFF_PRICE: usize = 48;
const OFF_QUANTITY: usize = 56;
const OFF_EVENT_TS: usize = 64;
const OFF_CHECKSUM: usize = 92;

/// Errors during wire decoding
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WireError {
    InvalidSize(usize),
    InvalidMagic(u16),
    UnsupportedVersion(u8),
    InvalidSide(u8),
    InvalidSymbol,
    InvalidTimestamp(i64),
    ChecksumMismatch,
}

impl std::fmt::Display for WireError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::InvalidSize(s) => {
                write!(f, "invalid message size: {} (expected {})", s, TRADE_MSG_SIZE)
            }
            Self::InvalidMagic(m) => {
                write!(f, "invalid magic: 0x{:04X} (expected 0x{:04X})", m, TRADE_MAGIC)
            }
            Self::UnsupportedVersion(v) => {
                write!(f, "unsupported version: {} (expected {})", v, TRADE_VERSION)
            }
            Self::InvalidSide(v) => write!(f, "invalid side byte: {}", v),
            Self::InvalidSymbol => write!(f, "symbol is not printable ASCII"),
            Self::InvalidTimestamp(ts) => write!(f, "event timestamp out of range: {}", ts),
            Self::ChecksumMismatch => write!(f, "checksum mismatch"),
        }
    }
}

impl std::error::Error for WireError {}

/// Serialize a trade into the wire frame.
///
/// Fails only when the symbol cannot be represented (longer than
/// [`SYMBOL_LEN`] or not printable ASCII).
pub fn encode(trade: &DecodedTrade) -> Result<Vec<u8>, WireError> {
    let sym = trade.symbol.as_bytes();
    if sym.len() > SYMBOL_LEN || !sym.iter().all(|b| b.is_ascii_graphic()) {
        return Err(WireError::InvalidSymbol);
    }

    let mut buf = vec![0u8; TRADE_MSG_SIZE];
    buf[OFF_MAGIC..OFF_MAGIC + 2].copy_from_slice(&TRADE_MAGIC.to_le_bytes());
    buf[OFF_VERSION] = TRADE_VERSION;
    buf[OFF_SIDE] = match trade.side {
        Side::Buy => 0,
        Side::Sell => 1,
    };
    buf[OFF_PORTFOLIO..OFF_PORTFOLIO + 16].copy_from_slice(trade.portfolio_id.as_bytes());
    buf[OFF_TRADE..OFF_TRADE + 16].copy_from_slice(trade.trade_id.as_bytes());
    buf[OFF_SYMBOL..OFF_SYMBOL + sym.len()].copy_from_slice(sym);

    let price = (trade.price_per_stock * FIXED_POINT_SCALE).round() as i64;
    buf[OFF_PRICE..OFF_PRICE + 8].copy_from_slice(&price.to_le_bytes());
    buf[OFF_QUANTITY..OFF_QUANTITY + 8].copy_from_slice(&trade.quantity.to_le_bytes());
    buf[OFF_EVENT_TS..OFF_EVENT_TS + 8]
        .copy_from_slice(&trade.event_timestamp.timestamp_millis().to_le_bytes());

    let crc = crc32(&buf[..OFF_CHECKSUM]);
    buf[OFF_CHECKSUM..].copy_from_slice(&crc.to_le_bytes());
    Ok(buf)
}

/// Decode a wire frame, validating size, magic, version and checksum in that
/// order before any field is interpreted.
pub fn decode(buf: &[u8]) -> Result<DecodedTrade, WireError> {
    if buf.len() != TRADE_MSG_SIZE {
        return Err(WireError::InvalidSize(buf.len()));
    }

    let magic = u16::from_le_bytes([buf[OFF_MAGIC], buf[OFF_MAGIC + 1]]);
    if magic != TRADE_MAGIC {
        return Err(WireError::InvalidMagic(magic));
    }

    if buf[OFF_VERSION] != TRADE_VERSION {
        return Err(WireError::UnsupportedVersion(buf[OFF_VERSION]));
    }

    let stored = u32::from_le_bytes(buf[OFF_CHECKSUM..].try_into().unwrap());
    if stored != crc32(&buf[..OFF_CHECKSUM]) {
        return Err(WireError::ChecksumMismatch);
    }

    let side = Side::from_u8(buf[OFF_SIDE]).ok_or(WireError::InvalidSide(buf[OFF_SIDE]))?;

    let sym_field = &buf[OFF_SYMBOL..OFF_SYMBOL + SYMBOL_LEN];
    let sym_end = sym_field.iter().position(|&b| b == 0).unwrap_or(SYMBOL_LEN);
    let sym = &sym_field[..sym_end];
    if !sym.iter().all(|b| b.is_ascii_graphic()) || sym_field[sym_end..].iter().any(|&b| b != 0) {
        return Err(WireError::InvalidSymbol);
    }
    let symbol = String::from_utf8(sym.to_vec()).map_err(|_| WireError::InvalidSymbol)?;

    let price = i64::from_le_bytes(buf[OFF_PRICE..OFF_PRICE + 8].try_into().unwrap());
    let quantity = i64::from_le_bytes(buf[OFF_QUANTITY..OFF_QUANTITY + 8].try_into().unwrap());
    let ts_ms = i64::from_le_bytes(buf[OFF_EVENT_TS..OFF_EVENT_TS + 8].try_into().unwrap());
    let event_timestamp = Utc
        .timestamp_millis_opt(ts_ms)
        .single()
        .ok_or(WireError::InvalidTimestamp(ts_ms))?;

    Ok(DecodedTrade {
        portfolio_id: Uuid::from_bytes(buf[OFF_PORTFOLIO..OFF_PORTFOLIO + 16].try_into().unwrap()),
        trade_id: Uuid::from_bytes(buf[OFF_TRADE..OFF_TRADE + 16].try_into().unwrap()),
        symbol,
        side,
        price_per_stock: price as f64 / FIXED_POINT_SCALE,
        quantity,
        event_timestamp,
    })
}

/// CRC32 (IEEE polynomial) with a compile-time lookup table
fn crc32(data: &[u8]) -> u32 {
    const CRC32_TABLE: [u32; 256] = generate_crc32_table();

    let mut crc = 0xFFFFFFFF_u32;
    for &byte in data {
        let idx = ((crc ^ byte as u32) & 0xFF) as usize;
        crc = CRC32_TABLE[idx] ^ (crc >> 8);
    }
    !crc
}

const fn generate_crc32_table() -> [u32; 256] {
    let mut table = [0u32; 256];
    let mut i = 0usize;
    while i < 256 {
        let mut crc = i as u32;
        let mut j = 0;
        while j < 8 {
            if crc & 1 != 0 {
                crc = 0xEDB88320 ^ (crc >> 1);
            } else {
                crc >>= 1;
            }
            j += 1;
        }
        table[i] = crc;
        i += 1;
    }
    table
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn sample_trade() -> DecodedTrade {
        DecodedTrade {
            portfolio_id: Uuid::new_v4(),
            trade_id: Uuid::new_v4(),
            symbol: "MSFT".into(),
            side: Side::Sell,
            price_per_stock: 412.33,
            quantity: 250,
            event_timestamp: Utc.timestamp_millis_opt(1_700_000_000_123).unwrap(),
        }
    }

    #[test]
    fn trade_round_trips() {
        let trade = sample_trade();
        let bytes = encode(&trade).unwrap();
        assert_eq!(bytes.len(), TRADE_MSG_SIZE);

        let restored = decode(&bytes).unwrap();
        assert_eq!(restored.portfolio_id, trade.portfolio_id);
        assert_eq!(restored.trade_id, trade.trade_id);
        assert_eq!(restored.symbol, "MSFT");
        assert_eq!(restored.side, Side::Sell);
        assert!((restored.price_per_stock - 412.33).abs() < 1e-7);
        assert_eq!(restored.quantity, 250);
        assert_eq!(restored.event_timestamp, trade.event_timestamp);
    }

    #[test]
    fn checksum_detects_corruption() {
        let mut bytes = encode(&sample_trade()).unwrap();
        bytes[OFF_PRICE] ^= 0xFF;
        assert_eq!(decode(&bytes), Err(WireError::ChecksumMismatch));
    }

    #[test]
    fn wrong_magic_is_rejected_before_fields() {
        let mut bytes = encode(&sample_trade()).unwrap();
        bytes[0] = 0x00;
        assert!(matches!(decode(&bytes), Err(WireError::InvalidMagic(_))));
    }

    #[test]
    fn truncated_frame_is_rejected() {
        let bytes = encode(&sample_trade()).unwrap();
        assert_eq!(
            decode(&bytes[..TRADE_MSG_SIZE - 1]),
            Err(WireError::InvalidSize(TRADE_MSG_SIZE - 1))
        );
    }

    #[test]
    fn oversized_symbol_fails_encode() {
        let mut trade = sample_trade();
        trade.symbol = "WAYTOOLONGSYMBOL".into();
        assert_eq!(encode(&trade), Err(WireError::InvalidSymbol));
    }
}
