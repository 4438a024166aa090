//! Receive-side timestamping
//!
//! Turns the raw receive stream into display text where every line starts with
//! a `[HH:MM:SS.mmm] ` prefix. Chunks arrive with arbitrary boundaries, so the
//! stamper carries two bits of state between calls: whether the next character
//! opens a new line, and any incomplete UTF-8 sequence left at the end of the
//! previous chunk.

use chrono::{Local, NaiveTime};

/// Format used for line prefixes
pub const TIMESTAMP_FORMAT: &str = "[%H:%M:%S%.3f] ";

/// Longest UTF-8 sequence minus one; the most a chunk can leave dangling
const MAX_PENDING_BYTES: usize = 3;

type Clock = Box<dyn Fn() -> NaiveTime + Send>;

/// Stateful byte-stream to display-text transform
pub struct ReceiveStamper {
    pending_timestamp: bool,
    partial: Vec<u8>,
    clock: Clock,
}

impl Default for ReceiveStamper {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for ReceiveStamper {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReceiveStamper")
            .field("pending_timestamp", &self.pending_timestamp)
            .field("partial", &self.partial)
            .finish()
    }
}

impl ReceiveStamper {
    /// Stamper using local wall-clock time
    pub fn new() -> Self {
        Self::with_clock(|| Local::now().time())
    }

    /// Stamper reading the time from `clock`
    pub fn with_clock<F>(clock: F) -> Self
    where
        F: Fn() -> NaiveTime + Send + 'static,
    {
        Self {
            pending_timestamp: true,
            partial: Vec::new(),
            clock: Box::new(clock),
        }
    }

    /// Whether the next character will be prefixed with a timestamp
    pub fn pending_timestamp(&self) -> bool {
        self.pending_timestamp
    }

    /// Reset after the display was cleared: the next character is stamped
    pub fn clear(&mut self) {
        self.pending_timestamp = true;
        self.partial.clear();
    }

    /// Decode a raw chunk and stamp it
    ///
    /// Invalid UTF-8 becomes U+FFFD. A multi-byte character split across two
    /// chunks is reassembled instead of being replaced.
    pub fn push_bytes(&mut self, bytes: &[u8]) -> String {
        let text = self.decode(bytes);
        self.stamp(&text)
    }

    /// Emit whatever is still held back from an incomplete sequence
    pub fn flush(&mut self) -> String {
        if self.partial.is_empty() {
            return String::new();
        }
        let tail = String::from_utf8_lossy(&self.partial).into_owned();
        self.partial.clear();
        self.stamp(&tail)
    }

    /// Stamp already-decoded text
    pub fn stamp(&mut self, text: &str) -> String {
        let mut out = String::with_capacity(text.len() + 16);
        for ch in text.chars() {
            if self.pending_timestamp {
                out.push_str(&format_timestamp((self.clock)()));
                self.pending_timestamp = false;
            }
            out.push(ch);
            if ch == '\n' {
                self.pending_timestamp = true;
            }
        }
        out
    }

    fn decode(&mut self, bytes: &[u8]) -> String {
        let mut buf = std::mem::take(&mut self.partial);
        buf.extend_from_slice(bytes);

        let keep = incomplete_tail_len(&buf);
        let tail = buf.split_off(buf.len() - keep);
        self.partial = tail;
        String::from_utf8_lossy(&buf).into_owned()
    }
}

/// Render `time` as a line prefix
pub fn format_timestamp(time: NaiveTime) -> String {
    time.format(TIMESTAMP_FORMAT).to_string()
}

/// Length of a trailing sequence that is a valid-but-unfinished UTF-8 prefix
fn incomplete_tail_len(buf: &[u8]) -> usize {
    let start = buf.len().saturating_sub(MAX_PENDING_BYTES);
    for i in (start..buf.len()).rev() {
        let b = buf[i];
        if b & 0b1100_0000 == 0b1000_0000 {
            // continuation byte, keep looking for the lead byte
            continue;
        }
        let needed = match b {
            0xC2..=0xDF => 2,
            0xE0..=0xEF => 3,
            0xF0..=0xF4 => 4,
            _ => return 0,
        };
        let have = buf.len() - i;
        if have >= needed {
            return 0;
        }
        // Only hold back a prefix that could still become valid
        return match std::str::from_utf8(&buf[i..]) {
            Err(e) if e.error_len().is_none() => have,
            _ => 0,
        };
    }
    0
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn fixed() -> ReceiveStamper {
        ReceiveStamper::with_clock(|| NaiveTime::from_hms_milli_opt(9, 5, 7, 42).unwrap())
    }

    #[test]
    fn test_format_timestamp() {
        let t = NaiveTime::from_hms_milli_opt(23, 59, 1, 7).unwrap();
        assert_eq!(format_timestamp(t), "[23:59:01.007] ");
    }

    #[test]
    fn test_first_character_is_stamped() {
        let mut s = fixed();
        assert_eq!(s.stamp("OK"), "[09:05:07.042] OK");
        assert!(!s.pending_timestamp());
    }

    #[test]
    fn test_newline_stamps_next_character_not_itself() {
        let mut s = fixed();
        assert_eq!(
            s.stamp("a\nb\n"),
            "[09:05:07.042] a\n[09:05:07.042] b\n"
        );
        assert!(s.pending_timestamp());
    }

    #[test]
    fn test_state_carries_across_chunks() {
        let mut s = fixed();
        assert_eq!(s.stamp("hel"), "[09:05:07.042] hel");
        assert_eq!(s.stamp("lo\n"), "lo\n");
        assert_eq!(s.stamp(""), "");
        assert_eq!(s.stamp("x"), "[09:05:07.042] x");
    }

    #[test]
    fn test_carriage_return_does_not_stamp() {
        let mut s = fixed();
        assert_eq!(s.stamp("a\r"), "[09:05:07.042] a\r");
        assert_eq!(s.stamp("\nb"), "\n[09:05:07.042] b");
    }

    #[test]
    fn test_clear_restamps() {
        let mut s = fixed();
        s.stamp("partial line");
        s.clear();
        assert_eq!(s.stamp("X"), "[09:05:07.042] X");
    }

    #[test]
    fn test_invalid_bytes_are_replaced() {
        let mut s = fixed();
        assert_eq!(s.push_bytes(b"a\xFFb"), "[09:05:07.042] a\u{FFFD}b");
    }

    #[test]
    fn test_split_multibyte_is_reassembled() {
        let mut s = fixed();
        let bytes = "°C\n".as_bytes();
        assert_eq!(s.push_bytes(&bytes[..1]), "");
        assert_eq!(s.push_bytes(&bytes[1..]), "[09:05:07.042] °C\n");
    }

    #[test]
    fn test_flush_replaces_dangling_sequence() {
        let mut s = fixed();
        assert_eq!(s.push_bytes(&[b'z', 0xE2, 0x82]), "[09:05:07.042] z");
        assert_eq!(s.flush(), "\u{FFFD}");
        assert_eq!(s.flush(), "");
    }

    #[test]
    fn test_clear_drops_dangling_sequence() {
        let mut s = fixed();
        s.push_bytes(&[0xF0, 0x9F]);
        s.clear();
        assert_eq!(s.push_bytes(b"ok"), "[09:05:07.042] ok");
    }

    #[test]
    fn test_incomplete_tail_len() {
        assert_eq!(incomplete_tail_len(b"abc"), 0);
        assert_eq!(incomplete_tail_len(&[b'a', 0xC3]), 1);
        assert_eq!(incomplete_tail_len(&[0xE2, 0x82]), 2);
        assert_eq!(incomplete_tail_len(&[0xE2, 0x82, 0xAC]), 0);
        assert_eq!(incomplete_tail_len(&[0xF0, 0x9F, 0x98]), 3);
        // 0xFF can never start a sequence
        assert_eq!(incomplete_tail_len(&[b'a', 0xFF]), 0);
        // 0xE0 0x80 is an overlong prefix that can never complete
        assert_eq!(incomplete_tail_len(&[0xE0, 0x80]), 0);
    }
}
