//! External collaborator contracts: decoding raw bytes into routable packets.

use std::fmt;

/// A decoded, routable unit of work.
///
/// Implementations are free to recycle instances after a handler returns;
/// the core never assumes a `Packet` outlives the call it's handed to.
pub trait Packet: Send + 'static {
    /// Stable routing key used by handler resolution.
    fn opcode(&self) -> u16;

    /// Type identity for logging. Defaults to the Rust type name.
    fn type_name(&self) -> &'static str {
        std::any::type_name::<Self>()
    }
}

/// Decodes raw bytes into a [`Packet`].
///
/// `try_deserialize` must not mutate its input and must return `None` for any
/// invalid framing, unknown magic, truncated payload, or checksum failure —
/// the dispatcher only ever observes the boolean outcome, never a partial
/// decode.
pub trait PacketCatalog: Send + Sync + 'static {
    /// The packet type this catalog produces.
    type Output: Packet;

    /// Attempts to decode `bytes`. Returns `None` on any framing failure.
    fn try_deserialize(&self, bytes: &[u8]) -> Option<Self::Output>;
}

/// Renders a bounded hex preview of `bytes` (at most 16 bytes) for
/// deserialize-failure log lines.
pub fn hex_preview(bytes: &[u8]) -> String {
    let take = bytes.len().min(16);
    let mut out = String::with_capacity(take * 2);
    for b in &bytes[..take] {
        use fmt::Write;
        let _ = write!(out, "{b:02x}");
    }
    out
}

/// Reads the first four bytes of `bytes` as a little-endian magic number, for
/// logging only. Returns `None` if fewer than four bytes are available.
pub fn leading_magic(bytes: &[u8]) -> Option<u32> {
    let word: [u8; 4] = bytes.get(..4)?.try_into().ok()?;
    Some(u32::from_le_bytes(word))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hex_preview_truncates_to_sixteen_bytes() {
        let bytes = vec![0xABu8; 32];
        assert_eq!(hex_preview(&bytes).len(), 32);
        let bytes = vec![0xABu8; 8];
        assert_eq!(hex_preview(&bytes).len(), 16);
    }

    #[test]
    fn leading_magic_reads_little_endian() {
        let bytes = 0xCAFEBABEu32.to_le_bytes();
        assert_eq!(leading_magic(&bytes), Some(0xCAFEBABE));
    }

    #[test]
    fn leading_magic_none_on_short_input() {
        assert_eq!(leading_magic(&[1, 2, 3]), None);
    }
}
