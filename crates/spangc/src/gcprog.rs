//! GC programs.
//!
//! A GC program is a compact byte code describing a 1-bit pointer mask. It
//! is used for types whose mask would be large or very repetitive.
//!
//! Layout: a little-endian `u32` byte length followed by that many bytes of
//! instructions.
//!
//! | opcode       | meaning                                                  |
//! |--------------|----------------------------------------------------------|
//! | `0x00`       | end of program                                           |
//! | `0x01..0x7f` | `n` literal bits follow in `ceil(n / 8)` bytes, LSB first |
//! | `0x80 \| n`   | repeat the previous `n` bits (`n == 0`: varint follows), then varint repeat count |
//!
//! Varints are unsigned LEB128.

use crate::fatal::{throw, FatalKind};

/// Destination of interpreted bits.
pub trait BitSink {
    /// Appends one bit.
    fn push(&mut self, bit: bool);

    /// Reads back an already written bit.
    fn get(&self, index: usize) -> bool;

    /// Number of bits written.
    fn len(&self) -> usize;

    /// `true` once the sink accepts no more bits. The interpreter stops
    /// early when this happens.
    fn is_full(&self) -> bool {
        false
    }
}

/// A growable bit vector sink.
#[derive(Debug, Default, Clone)]
pub struct MaskSink {
    bytes: Vec<u8>,
    len: usize,
}

impl MaskSink {
    /// Empty sink.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            bytes: Vec::new(),
            len: 0,
        }
    }

    /// Bytes written so far and the number of valid bits.
    #[must_use]
    pub fn into_parts(self) -> (Vec<u8>, usize) {
        (self.bytes, self.len)
    }
}

impl BitSink for MaskSink {
    fn push(&mut self, bit: bool) {
        if self.len % 8 == 0 {
            self.bytes.push(0);
        }
        if bit {
            self.bytes[self.len / 8] |= 1 << (self.len % 8);
        }
        self.len += 1;
    }

    fn get(&self, index: usize) -> bool {
        self.bytes[index / 8] >> (index % 8) & 1 != 0
    }

    fn len(&self) -> usize {
        self.len
    }
}

struct Reader<'a> {
    code: &'a [u8],
    pos: usize,
}

impl Reader<'_> {
    fn byte(&mut self) -> u8 {
        let Some(&b) = self.code.get(self.pos) else {
            throw(FatalKind::InvariantViolation, "GC program runs past its length");
        };
        self.pos += 1;
        b
    }

    fn varint(&mut self) -> usize {
        let mut value = 0usize;
        let mut shift = 0u32;
        loop {
            let b = self.byte();
            if shift >= usize::BITS {
                throw(FatalKind::InvariantViolation, "GC program varint overflow");
            }
            value |= usize::from(b & 0x7f) << shift;
            if b & 0x80 == 0 {
                return value;
            }
            shift += 7;
        }
    }
}

/// Interprets `program` into `sink`.
///
/// # Panics
///
/// Panics on a malformed program: missing length prefix, truncated body,
/// or a repeat reaching back before the first bit.
pub fn run(program: &[u8], sink: &mut impl BitSink) {
    if program.len() < 4 {
        throw(FatalKind::InvariantViolation, "GC program without length prefix");
    }
    let len = u32::from_le_bytes([program[0], program[1], program[2], program[3]]) as usize;
    let Some(code) = program.get(4..4 + len) else {
        throw(FatalKind::InvariantViolation, "GC program shorter than its length prefix");
    };
    let mut r = Reader { code, pos: 0 };

    while !sink.is_full() {
        let op = r.byte();
        if op == 0 {
            return;
        }
        if op & 0x80 == 0 {
            let n = usize::from(op);
            let mut bits = 0u8;
            for i in 0..n {
                if i % 8 == 0 {
                    bits = r.byte();
                }
                if sink.is_full() {
                    return;
                }
                sink.push(bits >> (i % 8) & 1 != 0);
            }
            continue;
        }

        let mut n = usize::from(op & 0x7f);
        if n == 0 {
            n = r.varint();
        }
        let count = r.varint();
        if n == 0 || n > sink.len() {
            throw(FatalKind::InvariantViolation, "GC program repeat before start");
        }
        for _ in 0..count {
            for _ in 0..n {
                if sink.is_full() {
                    return;
                }
                let bit = sink.get(sink.len() - n);
                sink.push(bit);
            }
        }
    }
}

/// Expands `program` and returns the mask bytes and bit count.
#[must_use]
pub fn expand(program: &[u8]) -> (Vec<u8>, usize) {
    let mut sink = MaskSink::new();
    run(program, &mut sink);
    sink.into_parts()
}

/// Expands `program` into a 1-bit pointer mask, least significant bit first.
#[must_use]
pub fn expand_pointer_mask(program: &[u8]) -> Vec<u8> {
    expand(program).0
}

// ============================================================================
// Builder
// ============================================================================

/// Assembles GC programs.
///
/// ```
/// use spangc::gcprog::{expand_pointer_mask, ProgramBuilder};
///
/// let mut b = ProgramBuilder::new();
/// b.literal(&[true, false, false]).repeat(3, 2);
/// assert_eq!(expand_pointer_mask(&b.finish()), vec![0b0100_1001, 0b0]);
/// ```
#[derive(Debug, Default, Clone)]
pub struct ProgramBuilder {
    code: Vec<u8>,
}

impl ProgramBuilder {
    /// Empty program.
    #[must_use]
    pub const fn new() -> Self {
        Self { code: Vec::new() }
    }

    /// Emits `bits` literally.
    pub fn literal(&mut self, bits: &[bool]) -> &mut Self {
        for chunk in bits.chunks(0x7f) {
            #[allow(clippy::cast_possible_truncation)]
            self.code.push(chunk.len() as u8);
            for byte in chunk.chunks(8) {
                let mut b = 0u8;
                for (i, &bit) in byte.iter().enumerate() {
                    b |= u8::from(bit) << i;
                }
                self.code.push(b);
            }
        }
        self
    }

    /// Repeats the last `n` emitted bits `count` more times.
    pub fn repeat(&mut self, n: usize, count: usize) -> &mut Self {
        if (1..0x80).contains(&n) {
            #[allow(clippy::cast_possible_truncation)]
            self.code.push(0x80 | n as u8);
        } else {
            self.code.push(0x80);
            self.varint(n);
        }
        self.varint(count);
        self
    }

    fn varint(&mut self, mut v: usize) {
        while v >= 0x80 {
            #[allow(clippy::cast_possible_truncation)]
            self.code.push((v as u8) | 0x80);
            v >>= 7;
        }
        #[allow(clippy::cast_possible_truncation)]
        self.code.push(v as u8);
    }

    /// Terminates the program and adds the length prefix.
    #[must_use]
    pub fn finish(&self) -> Vec<u8> {
        let body_len = self.code.len() + 1;
        let Ok(prefix) = u32::try_from(body_len) else {
            throw(FatalKind::Misuse, "GC program too long");
        };
        let mut out = Vec::with_capacity(4 + body_len);
        out.extend_from_slice(&prefix.to_le_bytes());
        out.extend_from_slice(&self.code);
        out.push(0);
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn bits(mask: &[u8], n: usize) -> Vec<bool> {
        (0..n).map(|i| mask[i / 8] >> (i % 8) & 1 != 0).collect()
    }

    #[test]
    fn test_literal_only() {
        let mut b = ProgramBuilder::new();
        b.literal(&[true, true, false, true]);
        let (mask, n) = expand(&b.finish());
        assert_eq!(n, 4);
        assert_eq!(bits(&mask, 4), vec![true, true, false, true]);
    }

    #[test]
    fn test_repeat_matches_literal() {
        let unit = [true, false, false];
        let mut b = ProgramBuilder::new();
        b.literal(&unit).repeat(3, 99);
        let (mask, n) = expand(&b.finish());
        assert_eq!(n, 300);

        let literal: Vec<bool> = unit.iter().copied().cycle().take(300).collect();
        let mut lb = ProgramBuilder::new();
        lb.literal(&literal);
        assert_eq!(expand(&lb.finish()), (mask, n));
    }

    #[test]
    fn test_long_repeat_unit_uses_varint() {
        let unit: Vec<bool> = (0..200).map(|i| i % 7 == 0).collect();
        let mut b = ProgramBuilder::new();
        b.literal(&unit).repeat(200, 2);
        let prog = b.finish();
        let (mask, n) = expand(&prog);
        assert_eq!(n, 600);
        for (i, bit) in bits(&mask, 600).into_iter().enumerate() {
            assert_eq!(bit, i % 200 % 7 == 0, "bit {i}");
        }
    }

    #[test]
    fn test_empty_program() {
        let (mask, n) = expand(&ProgramBuilder::new().finish());
        assert!(mask.is_empty());
        assert_eq!(n, 0);
    }

    #[test]
    #[should_panic(expected = "GC program runs past its length")]
    fn test_unterminated_program() {
        let _ = expand(&[1, 0, 0, 0, 0x03]);
    }

    #[test]
    #[should_panic(expected = "GC program repeat before start")]
    fn test_repeat_before_start() {
        let _ = expand(&[3, 0, 0, 0, 0x82, 0x01, 0x00]);
    }

    #[test]
    fn test_full_sink_stops_early() {
        struct Capped(MaskSink, usize);
        impl BitSink for Capped {
            fn push(&mut self, bit: bool) {
                self.0.push(bit);
            }
            fn get(&self, index: usize) -> bool {
                self.0.get(index)
            }
            fn len(&self) -> usize {
                self.0.len()
            }
            fn is_full(&self) -> bool {
                self.0.len() >= self.1
            }
        }

        let mut b = ProgramBuilder::new();
        b.literal(&[true]).repeat(1, 1_000_000);
        let mut sink = Capped(MaskSink::new(), 10);
        run(&b.finish(), &mut sink);
        assert_eq!(sink.len(), 10);
    }
}
