//! Extent lists for block-status queries.
//!
//! An [`ExtentList`] is an append-only description of a byte range as a
//! sequence of contiguous `{offset, length, flags}` records. Layers answering
//! an extents query add records in strictly ascending, contiguous order; the
//! list clips records to its range, coalesces neighbours of equal type, and
//! detects out-of-order additions.

use tracing::error;

use crate::chain::Next;
use crate::error::Errno;
use crate::layer::FLAG_REQ_ONE;

/// Cap on records per reply, to bound reply size and to stop a layer with
/// frequent type alternations from consuming unbounded memory.
pub const MAX_EXTENTS: usize = 1024 * 1024;

/// The range reads as zeroes but may or may not be allocated.
pub const EXTENT_HOLE: u32 = 1 << 0;
/// The range is known to read as zeroes.
pub const EXTENT_ZERO: u32 = 1 << 1;

/// One contiguous region of an export.
///
/// `flags == 0` means allocated data, which is the safe answer when nothing
/// better is known. Future flag bits are chosen so that the bitwise-AND of
/// two answers covering the same bytes is still correct.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Extent {
    pub offset: u64,
    pub length: u64,
    pub flags: u32,
}

/// Appendable list of extents covering `[start, end)`.
#[derive(Debug)]
pub struct ExtentList {
    records: Vec<Extent>,
    start: u64,
    /// One byte beyond the end of the range.
    end: u64,
    /// Where the next record must begin. Updated even when a record is
    /// dropped, so that out-of-order additions fail deterministically.
    next: Option<u64>,
}

impl ExtentList {
    /// Create a list for the range `[start, end)`.
    ///
    /// Zero-length ranges are legal; `start > end` or either bound above
    /// `i64::MAX` is not.
    pub fn new(start: u64, end: u64) -> Result<Self, Errno> {
        if start > i64::MAX as u64 || end > i64::MAX as u64 {
            error!(start, end, "extent range bound exceeds i64::MAX");
            return Err(Errno::Range);
        }
        if start > end {
            error!(start, end, "extent range start exceeds end");
            return Err(Errno::Range);
        }
        Ok(Self {
            records: Vec::new(),
            start,
            end,
            next: None,
        })
    }

    /// Start of the covered range.
    pub fn start(&self) -> u64 {
        self.start
    }

    /// One byte beyond the end of the covered range.
    pub fn end(&self) -> u64 {
        self.end
    }

    pub fn count(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn get(&self, i: usize) -> Extent {
        self.records[i]
    }

    pub fn records(&self) -> &[Extent] {
        &self.records
    }

    /// Append a record.
    ///
    /// Records must be contiguous: after the first `add`, `offset` must equal
    /// the previous record's `offset + length` or the call fails with
    /// `Range`. Zero-length records, records wholly past the end of the
    /// range, and records added once the list is full are silently dropped.
    /// Records straddling either bound are clipped; a first record that
    /// begins past `start` is a bug in the calling layer.
    pub fn add(&mut self, offset: u64, length: u64, flags: u32) -> Result<(), Errno> {
        if let Some(next) = self.next {
            if next != offset {
                error!(
                    expected = next,
                    offset, "extents must be added in ascending, contiguous order"
                );
                return Err(Errno::Range);
            }
        }
        self.next = Some(offset.saturating_add(length));

        // Ignore zero-length extents.
        if length == 0 {
            return Ok(());
        }

        // Ignore extents beyond the end of the range, or if the list is full.
        if offset >= self.end || self.records.len() >= MAX_EXTENTS {
            return Ok(());
        }

        // Shorten extents that overlap the end of the range.
        let mut offset = offset;
        let mut length = length.min(self.end - offset);

        if self.records.is_empty() {
            // A first extent entirely before start carries no information.
            if offset + length <= self.start {
                return Ok(());
            }

            // A first extent beginning past start is a bug in the layer.
            if offset > self.start {
                error!(
                    offset,
                    start = self.start,
                    "first extent must not begin past the range start"
                );
                return Err(Errno::Range);
            }

            // Truncate the head so the first extent begins at start.
            let overlap = self.start - offset;
            length -= overlap;
            offset += overlap;
        }

        if let Some(last) = self.records.last_mut() {
            if last.flags == flags {
                // Coalesce with the previous extent.
                last.length += length;
                return Ok(());
            }
        }
        self.records.push(Extent {
            offset,
            length,
            flags,
        });
        Ok(())
    }
}

/// Query the inner layer's extents re-bucketised to multiples of `align`.
///
/// On return `exts` holds either a run of records whose lengths are all
/// multiples of `align`, or exactly one record of `align` bytes whose flags
/// are the bitwise-AND of every contributor — the correct summary, since all
/// extent flag bits only hold for a range if they hold for every byte of it.
///
/// `count` and `offset` must already be aligned.
pub async fn extents_aligned(
    next: &Next<'_>,
    count: u32,
    offset: u64,
    flags: u32,
    align: u32,
    exts: &mut ExtentList,
) -> Result<(), Errno> {
    debug_assert_eq!((count as u64 | offset) % align as u64, 0);
    let align = align as u64;

    // Perform an initial query, then scan for the first unaligned extent.
    next.extents(count, offset, flags, exts).await?;
    let mut i = 0;
    while i < exts.records.len() {
        let e = exts.records[i];
        if e.length % align != 0 {
            // If the unalignment is past align, just truncate and return early.
            if e.offset + e.length > offset + align {
                let length = e.length - e.length % align;
                exts.records[i].length = length;
                exts.records.truncate(i + usize::from(length != 0));
                exts.next = Some(e.offset + length);
                return Ok(());
            }

            // Otherwise, coalesce until we have at least align bytes, which
            // may require further queries.
            debug_assert_eq!(i, 0);
            while exts.records[0].length < align {
                if exts.records.len() > 1 {
                    let succ = exts.records.remove(1);
                    exts.records[0].length += succ.length;
                    exts.records[0].flags &= succ.flags;
                } else {
                    // The inner layer needs a fresh list each time; merge the
                    // answer back into the caller's list.
                    let head = exts.records[0];
                    let queried = head.offset + head.length;
                    let mut fresh = ExtentList::new(queried, offset + align)?;
                    next.extents(
                        (align - head.length) as u32,
                        queried,
                        flags & !FLAG_REQ_ONE,
                        &mut fresh,
                    )
                    .await?;
                    if fresh.records.is_empty() {
                        error!(offset = queried, "inner layer returned no extents");
                        return Err(Errno::Io);
                    }
                    debug_assert_eq!(fresh.records[0].offset, queried);
                    fresh.records[0].offset = head.offset;
                    fresh.records[0].length += head.length;
                    fresh.records[0].flags &= head.flags;
                    exts.records = fresh.records;
                }
            }
            exts.records[0].length = align;
            exts.records.truncate(1);
            exts.next = Some(exts.records[0].offset + align);
            return Ok(());
        }
        i += 1;
    }
    // Once we get here, all extents are aligned.
    Ok(())
}
