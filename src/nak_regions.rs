use std::fmt::{Debug, Display, Formatter};

use crate::error::{Error, Result};

/// A half-open byte range `[start, end_ex)`.
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct Region {
    pub start: i64,
    pub end_ex: i64,
}

impl Region {
    pub fn new(start: i64, end_ex: i64) -> Region {
        Region { start, end_ex }
    }

    pub fn len(&self) -> i64 {
        self.end_ex - self.start
    }

    pub fn is_empty(&self) -> bool {
        self.end_ex <= self.start
    }
}

impl Debug for Region {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "[{}, {})", self.start, self.end_ex)
    }
}
impl Display for Region {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        Debug::fmt(self, f)
    }
}

/// The set of not-yet-acknowledged byte ranges of a stream of `size` bytes.
///
/// Invariants on the stored intervals:
/// * sorted ascending, non-empty, non-overlapping, non-adjacent
/// * contained in `[0, size)`
/// * the set is empty iff everything is acknowledged
///
/// A receiver starts fully NAK'ed (one interval covering the whole stream)
/// and acknowledges ranges as data arrives; a sender starts fully ACK'ed and
/// re-NAKs whatever receivers report as missing.
pub struct NakRegions {
    naks: Vec<Region>,
    size: i64,
}

impl NakRegions {
    /// A fully-NAK'ed set over `[0, size)`. A zero-sized stream has nothing
    /// to transfer, so its set starts out empty.
    pub fn new(size: i64) -> NakRegions {
        let naks = if size > 0 {
            vec![Region::new(0, size)]
        } else {
            Vec::new()
        };
        NakRegions { naks, size }
    }

    pub fn size(&self) -> i64 {
        self.size
    }

    /// NAK'ed intervals in ascending order.
    pub fn naks(&self) -> &[Region] {
        &self.naks
    }

    /// The complement of `naks()` over `[0, size)`, in ascending order.
    pub fn acks(&self) -> Vec<Region> {
        let mut out = Vec::with_capacity(self.naks.len() + 1);
        let mut mark = 0;
        for k in &self.naks {
            if k.start > mark {
                out.push(Region::new(mark, k.start));
            }
            mark = k.end_ex;
        }
        if mark < self.size {
            out.push(Region::new(mark, self.size));
        }
        out
    }

    pub fn is_all_acked(&self) -> bool {
        self.naks.is_empty()
    }

    /// True iff no byte of `[start, end_ex)` is NAK'ed. An empty range is
    /// trivially acknowledged.
    pub fn is_acked(&self, start: i64, end_ex: i64) -> bool {
        if start >= end_ex {
            return true;
        }
        !self
            .naks
            .iter()
            .any(|k| k.start < end_ex && start < k.end_ex)
    }

    /// The smallest NAK'ed position `>= p`, wrapping around to the first
    /// interval if there is none at or after `p`. `None` iff the set is empty.
    pub fn next_nak(&self, p: i64) -> Option<i64> {
        for k in &self.naks {
            if k.end_ex > p {
                return Some(k.start.max(p));
            }
        }
        self.naks.first().map(|k| k.start)
    }

    /// Remove `[start, end_ex)` from the set, splitting or shrinking any
    /// intervals it overlaps. `start == end_ex` is a no-op.
    pub fn ack(&mut self, start: i64, end_ex: i64) -> Result<()> {
        self.check_range(start, end_ex)?;
        if start == end_ex {
            return Ok(());
        }

        let mut out = Vec::with_capacity(self.naks.len() + 1);
        for k in &self.naks {
            if k.end_ex <= start || k.start >= end_ex {
                out.push(*k);
                continue;
            }
            // overlap: keep whatever sticks out on either side
            if k.start < start {
                out.push(Region::new(k.start, start));
            }
            if k.end_ex > end_ex {
                out.push(Region::new(end_ex, k.end_ex));
            }
        }
        self.naks = out;
        Ok(())
    }

    /// Add `[start, end_ex)` to the set, coalescing with any overlapping or
    /// adjacent intervals. `start == end_ex` is a no-op.
    pub fn nak(&mut self, start: i64, end_ex: i64) -> Result<()> {
        self.check_range(start, end_ex)?;
        if start == end_ex {
            return Ok(());
        }

        let mut out = Vec::with_capacity(self.naks.len() + 1);
        let mut merged = Region::new(start, end_ex);
        let mut placed = false;
        for k in &self.naks {
            if k.end_ex < merged.start {
                out.push(*k);
            } else if k.start > merged.end_ex {
                if !placed {
                    out.push(merged);
                    placed = true;
                }
                out.push(*k);
            } else {
                // touching counts as mergeable - intervals stay non-adjacent
                merged.start = merged.start.min(k.start);
                merged.end_ex = merged.end_ex.max(k.end_ex);
            }
        }
        if !placed {
            out.push(merged);
        }
        self.naks = out;
        Ok(())
    }

    fn check_range(&self, start: i64, end_ex: i64) -> Result<()> {
        if start < 0 || end_ex > self.size || start > end_ex {
            return Err(Error::AckOutOfRange {
                start,
                end_ex,
                size: self.size,
            });
        }
        Ok(())
    }

    /// Fixed-width progress depiction: `#` for acknowledged cells, `.` for
    /// NAK'ed cells, `:` where an interval boundary falls inside a cell.
    pub fn ascii_meter(&self, width: usize) -> String {
        let mut meter = vec![b'#'; width];
        self.render_meter(&mut meter);
        String::from_utf8(meter).expect("meter is ASCII")
    }

    /// Like `ascii_meter`, with a `|` cursor overlayed at byte position `pos`.
    pub fn ascii_meter_at(&self, width: usize, pos: i64) -> String {
        let mut meter = vec![b'#'; width];
        self.render_meter(&mut meter);

        if self.size > 0 {
            let cell = self.size as f64 / width as f64;
            let i = (pos as f64 / cell).floor() as usize;
            let j = ((pos + 1) as f64 / cell).floor() as usize;
            for n in i..=j {
                if n < width {
                    meter[n] = b'|';
                }
            }
        }
        String::from_utf8(meter).expect("meter is ASCII")
    }

    fn render_meter(&self, meter: &mut [u8]) {
        if self.size == 0 || meter.is_empty() {
            return;
        }
        let cell = self.size as f64 / meter.len() as f64;
        for k in &self.naks {
            let i = (k.start as f64 / cell).floor() as usize;
            let ir = (k.start as f64 / cell).ceil() as usize;
            let j = (k.end_ex as f64 / cell).floor() as usize;
            let jr = (k.end_ex as f64 / cell).ceil() as usize;

            for n in i..j.min(meter.len()) {
                meter[n] = b'.';
            }

            if cell > 1.0 {
                // boundary lands mid-cell: mark the cell as partial
                if i != ir && i < meter.len() {
                    meter[i] = b':';
                }
                if j != jr && j < meter.len() {
                    meter[j] = b':';
                }
            }
        }
    }
}

impl Debug for NakRegions {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "NakRegions(size={}, naks={:?})", self.size, self.naks)
    }
}
