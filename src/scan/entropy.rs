//! Shannon entropy over byte ranges.

use crate::pe::region::{DataRegion, RegionKind};
use std::collections::BTreeMap;

/// Calculates the Shannon entropy of a byte slice in bits per byte.
///
/// Returns a value between 0.0 and 8.0, where:
/// - 0.0 represents no randomness (empty input or a single distinct byte)
/// - 8.0 represents maximum randomness (uniform distribution)
#[inline]
pub fn shannon_entropy(data: &[u8]) -> f64 {
    if data.is_empty() {
        return 0.0;
    }

    // Single-pass 256-bucket histogram.
    let mut histogram = [0usize; 256];
    for &byte in data {
        histogram[byte as usize] += 1;
    }

    let len = data.len() as f64;
    let mut entropy = 0.0;
    for &count in &histogram {
        if count == 0 {
            continue;
        }
        let p = (count as f64) / len;
        entropy -= p * p.log2();
    }
    entropy
}

/// Entropy of each `Code` or `Data` region whose byte interval lies
/// entirely inside `data`, keyed by region label.
pub fn entropy_by_region(data: &[u8], regions: &[DataRegion]) -> BTreeMap<String, f64> {
    let mut out = BTreeMap::new();
    for region in regions {
        if !matches!(region.kind, RegionKind::Code | RegionKind::Data) {
            continue;
        }
        let start = region.offset as usize;
        let Some(end) = region.offset.checked_add(region.size).map(|e| e as usize) else {
            continue;
        };
        if end > data.len() {
            continue;
        }
        out.insert(region.label(), shannon_entropy(&data[start..end]));
    }
    out
}

/// Entropy of consecutive fixed-size windows. The final window may be
/// shorter than `window`.
pub fn entropy_windows(data: &[u8], window: usize) -> Vec<f64> {
    if window == 0 {
        return Vec::new();
    }
    data.chunks(window).map(shannon_entropy).collect()
}
