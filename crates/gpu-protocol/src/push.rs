//! Pushbuffer method-header encoding.
//!
//! Every header dword has the layout:
//!
//! ```text
//! 31..29  opcode   (1 = incrementing, 3 = non-incrementing, 4 = immediate, 5 = increment-once)
//! 28..16  count    (payload dwords, or the immediate value for opcode 4)
//! 15..13  subchannel
//! 12..0   method address >> 2
//! ```
//!
//! Payload dwords follow the header. The count field is patched in place as
//! payload is appended, so a header is always written before its data.

use thiserror::Error;

/// Subchannel bound to the 3D class.
pub const SUBC_3D: u8 = 0;
/// Subchannel bound to the compute class.
pub const SUBC_COMPUTE: u8 = 1;
/// Subchannel bound to the 2D class.
pub const SUBC_2D: u8 = 3;
/// Subchannel bound to the copy-engine class.
pub const SUBC_COPY: u8 = 4;

/// Largest count representable in a header.
pub const MAX_COUNT: u32 = 0x1fff;
/// Values strictly below this fit in an immediate header.
pub const IMMD_LIMIT: u32 = 0x2000;
/// Largest byte length of a single push range handed to the kernel.
pub const MAX_PUSH_BYTES: u64 = 1 << 23;

const COUNT_SHIFT: u32 = 16;
const COUNT_MASK: u32 = 0x1fff << COUNT_SHIFT;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u32)]
pub enum Opcode {
    Incrementing = 1,
    NonIncrementing = 3,
    Immediate = 4,
    IncrementOnce = 5,
}

impl Opcode {
    pub fn from_u32(v: u32) -> Option<Self> {
        match v {
            1 => Some(Self::Incrementing),
            3 => Some(Self::NonIncrementing),
            4 => Some(Self::Immediate),
            5 => Some(Self::IncrementOnce),
            _ => None,
        }
    }
}

#[inline]
const fn header(op: Opcode, subc: u8, mthd: u32, count: u32) -> u32 {
    ((op as u32) << 29)
        | ((count & MAX_COUNT) << COUNT_SHIFT)
        | (((subc as u32) & 7) << 13)
        | ((mthd >> 2) & 0x1fff)
}

/// Incrementing header: payload dword `i` writes method `mthd + 4 * i`.
pub const fn mthd_header(subc: u8, mthd: u32, count: u32) -> u32 {
    header(Opcode::Incrementing, subc, mthd, count)
}

/// Non-incrementing header: every payload dword writes `mthd`.
pub const fn ninc_header(subc: u8, mthd: u32, count: u32) -> u32 {
    header(Opcode::NonIncrementing, subc, mthd, count)
}

/// Increment-once header: the first dword writes `mthd`, the rest `mthd + 4`.
pub const fn one_inc_header(subc: u8, mthd: u32, count: u32) -> u32 {
    header(Opcode::IncrementOnce, subc, mthd, count)
}

/// Immediate header carrying `data` in the count field. `data` must be below
/// [`IMMD_LIMIT`].
pub const fn immd_header(subc: u8, mthd: u32, data: u32) -> u32 {
    header(Opcode::Immediate, subc, mthd, data)
}

/// Returns `hdr` with its count field replaced.
#[inline]
pub const fn with_count(hdr: u32, count: u32) -> u32 {
    (hdr & !COUNT_MASK) | ((count & MAX_COUNT) << COUNT_SHIFT)
}

#[inline]
pub const fn header_count(hdr: u32) -> u32 {
    (hdr & COUNT_MASK) >> COUNT_SHIFT
}

/// One decoded register write.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct MethodWrite {
    pub subc: u8,
    pub mthd: u32,
    pub data: u32,
}

impl MethodWrite {
    pub const fn new(subc: u8, mthd: u32, data: u32) -> Self {
        Self { subc, mthd, data }
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum PushDecodeError {
    #[error("unknown header opcode {opcode} at dword {index}")]
    UnknownOpcode { index: usize, opcode: u32 },

    #[error("header at dword {index} announces {count} dwords but only {available} remain")]
    Truncated {
        index: usize,
        count: u32,
        available: usize,
    },
}

/// Expand a method stream into individual register writes.
pub fn decode(dwords: &[u32]) -> Result<Vec<MethodWrite>, PushDecodeError> {
    PushReader::new(dwords).collect()
}

/// Iterator over the register writes encoded in a method stream.
pub struct PushReader<'a> {
    dwords: &'a [u32],
    pos: usize,
    // (opcode, subc, next method, remaining payload dwords)
    pending: Option<(Opcode, u8, u32, u32)>,
}

impl<'a> PushReader<'a> {
    pub fn new(dwords: &'a [u32]) -> Self {
        Self {
            dwords,
            pos: 0,
            pending: None,
        }
    }
}

impl Iterator for PushReader<'_> {
    type Item = Result<MethodWrite, PushDecodeError>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            if let Some((op, subc, mthd, remaining)) = self.pending {
                if remaining == 0 {
                    self.pending = None;
                    continue;
                }
                let data = self.dwords[self.pos];
                self.pos += 1;
                let next_mthd = match op {
                    Opcode::Incrementing | Opcode::IncrementOnce => mthd + 4,
                    _ => mthd,
                };
                // Increment-once degrades to non-incrementing after one dword.
                let next_op = if op == Opcode::IncrementOnce {
                    Opcode::NonIncrementing
                } else {
                    op
                };
                self.pending = Some((next_op, subc, next_mthd, remaining - 1));
                return Some(Ok(MethodWrite::new(subc, mthd, data)));
            }

            let index = self.pos;
            let hdr = *self.dwords.get(index)?;
            self.pos += 1;

            let raw_op = hdr >> 29;
            let Some(op) = Opcode::from_u32(raw_op) else {
                self.pos = self.dwords.len();
                return Some(Err(PushDecodeError::UnknownOpcode {
                    index,
                    opcode: raw_op,
                }));
            };
            let subc = ((hdr >> 13) & 7) as u8;
            let mthd = (hdr & 0x1fff) << 2;
            let count = header_count(hdr);

            if op == Opcode::Immediate {
                return Some(Ok(MethodWrite::new(subc, mthd, count)));
            }

            let available = self.dwords.len() - self.pos;
            if count as usize > available {
                self.pos = self.dwords.len();
                return Some(Err(PushDecodeError::Truncated {
                    index,
                    count,
                    available,
                }));
            }
            self.pending = Some((op, subc, mthd, count));
        }
    }
}
