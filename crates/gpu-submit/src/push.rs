//! Method-stream builder.
//!
//! A [`PushBuilder`] accumulates headers and payload in host memory. The
//! owning command buffer copies the finished dwords into a push chunk BO, so
//! the builder itself never touches GPU memory. The dword budget mirrors the
//! space left in that chunk; emitting past it is a recording bug and is
//! reported by [`PushBuilder::check_fits`].

use gpu_protocol::push::{
    header_count, immd_header, mthd_header, ninc_header, one_inc_header, with_count, IMMD_LIMIT,
    MAX_COUNT,
};
use gpu_protocol::split_addr;

use crate::{Error, Result};

#[derive(Clone, Debug)]
pub struct PushBuilder {
    dwords: Vec<u32>,
    limit: usize,
    /// Index of the header currently receiving payload.
    open: Option<usize>,
}

impl Default for PushBuilder {
    fn default() -> Self {
        Self::with_limit(usize::MAX)
    }
}

impl PushBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Builder for at most `limit` dwords.
    pub fn with_limit(limit: usize) -> Self {
        Self {
            dwords: Vec::new(),
            limit,
            open: None,
        }
    }

    pub fn dwords(&self) -> &[u32] {
        &self.dwords
    }

    pub fn len(&self) -> usize {
        self.dwords.len()
    }

    pub fn is_empty(&self) -> bool {
        self.dwords.is_empty()
    }

    pub fn limit(&self) -> usize {
        self.limit
    }

    pub fn remaining(&self) -> usize {
        self.limit.saturating_sub(self.dwords.len())
    }

    pub fn fits(&self, dwords: usize) -> bool {
        dwords <= self.remaining()
    }

    /// Errors if the stream has outgrown its budget.
    pub fn check_fits(&self) -> Result<()> {
        if self.dwords.len() > self.limit {
            return Err(Error::invalid(format!(
                "push overflow: {} dwords emitted into a {} dword chunk",
                self.dwords.len(),
                self.limit
            )));
        }
        Ok(())
    }

    pub fn finish(self) -> Vec<u32> {
        self.dwords
    }

    /// Hand out the recorded dwords and start over with the same budget.
    pub fn take(&mut self) -> Vec<u32> {
        self.open = None;
        std::mem::take(&mut self.dwords)
    }

    pub(crate) fn set_limit(&mut self, limit: usize) {
        self.limit = limit;
    }

    fn begin(&mut self, hdr: u32) -> &mut Self {
        self.open = Some(self.dwords.len());
        self.dwords.push(hdr);
        self
    }

    /// Start an incrementing sequence at `mthd`. Follow with
    /// [`inline_data`](Self::inline_data).
    pub fn mthd(&mut self, subc: u8, mthd: u32) -> &mut Self {
        self.begin(mthd_header(subc, mthd, 0))
    }

    /// Every following payload dword writes `mthd`.
    pub fn ninc(&mut self, subc: u8, mthd: u32) -> &mut Self {
        self.begin(ninc_header(subc, mthd, 0))
    }

    /// First payload dword writes `mthd`, the rest `mthd + 4`.
    pub fn one_inc(&mut self, subc: u8, mthd: u32) -> &mut Self {
        self.begin(one_inc_header(subc, mthd, 0))
    }

    /// Single method write. Uses an immediate header when `value` fits.
    pub fn immd(&mut self, subc: u8, mthd: u32, value: u32) -> &mut Self {
        if value < IMMD_LIMIT {
            self.open = None;
            self.dwords.push(immd_header(subc, mthd, value));
            self
        } else {
            self.mthd(subc, mthd).inline_data(value)
        }
    }

    /// Append one payload dword to the open sequence.
    pub fn inline_data(&mut self, value: u32) -> &mut Self {
        let Some(at) = self.open else {
            debug_assert!(false, "inline data without an open method");
            return self;
        };
        let count = header_count(self.dwords[at]);
        if count == MAX_COUNT {
            // Re-open at the method the next dword would have reached.
            let hdr = self.dwords[at];
            let next = continuation(hdr, count);
            self.begin(with_count(next, 0));
            return self.inline_data(value);
        }
        self.dwords[at] = with_count(self.dwords[at], count + 1);
        self.dwords.push(value);
        self
    }

    pub fn inline_array(&mut self, values: &[u32]) -> &mut Self {
        for &v in values {
            self.inline_data(v);
        }
        self
    }

    /// Upper then lower dword of `addr`.
    pub fn inline_addr(&mut self, addr: u64) -> &mut Self {
        let (hi, lo) = split_addr(addr);
        self.inline_data(hi).inline_data(lo)
    }

    /// `mthd` followed by `values`, as one incrementing sequence.
    pub fn mthd_data(&mut self, subc: u8, mthd: u32, values: &[u32]) -> &mut Self {
        self.mthd(subc, mthd).inline_array(values)
    }

    /// Append an already encoded stream verbatim.
    pub fn append_raw(&mut self, dwords: &[u32]) -> &mut Self {
        self.open = None;
        self.dwords.extend_from_slice(dwords);
        self
    }
}

/// Header that continues `hdr` after `count` payload dwords.
fn continuation(hdr: u32, count: u32) -> u32 {
    let op = hdr >> 29;
    let addr_field = hdr & 0x1fff;
    let advanced = match op {
        // Incrementing.
        1 => (addr_field + count) & 0x1fff,
        // Increment-once: everything after the first dword hits mthd + 4.
        5 => (addr_field + 1) & 0x1fff,
        _ => addr_field,
    };
    let op = if op == 5 { 3 } else { op };
    (op << 29) | (hdr & 0x0000_e000) | advanced
}
