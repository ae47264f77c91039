//! Clipping of write runs against programmable memory regions.

use super::memory_map::{DeviceMemoryMap, MemoryRegion};

/// A byte range that lies entirely inside one enabled region.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Span {
    pub address: u32,
    pub length: u32,
}

impl Span {
    fn end(&self) -> u64 {
        u64::from(self.address) + u64::from(self.length)
    }
}

/// Intersect `[address, address + length)` with every region in `regions`.
///
/// Callers pass only the regions that may be written. The result is in ascending address order, covers each byte at most once
/// and may be empty when the range lies outside all regions (the device
/// cannot write there, so those bytes are skipped). A range crossing several
/// region boundaries yields one span per region it touches.
pub fn clip<'r>(
    regions: impl IntoIterator<Item = &'r MemoryRegion>,
    address: u32,
    length: u32,
) -> Vec<Span> {
    let start = u64::from(address);
    let end = start + u64::from(length);

    let mut spans: Vec<Span> = regions
        .into_iter()
        .filter_map(|r| {
            let region_start = u64::from(r.address);
            let region_end = region_start + u64::from(r.length);
            let lo = start.max(region_start);
            let hi = end.min(region_end);
            (lo < hi).then(|| Span {
                address: lo as u32,
                length: (hi - lo) as u32,
            })
        })
        .collect();

    spans.sort_by_key(|s| s.address);

    // Region byte ranges may overlap on word-addressed parts; never send a
    // byte twice.
    let mut merged: Vec<Span> = Vec::with_capacity(spans.len());
    for span in spans {
        match merged.last() {
            Some(prev) if span.end() <= prev.end() => {}
            Some(prev) if u64::from(span.address) < prev.end() => {
                let cut = prev.end() as u32;
                merged.push(Span {
                    address: cut,
                    length: span.length - (cut - span.address),
                });
            }
            _ => merged.push(span),
        }
    }
    merged
}

impl DeviceMemoryMap {
    /// Clip a run against this map's enabled regions. See [`clip`].
    pub fn clip(&self, address: u32, length: u32) -> Vec<Span> {
        clip(self.enabled_regions(), address, length)
    }
}
