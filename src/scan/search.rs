//! Byte search over slices and byte sources.
//!
//! Wildcard-free patterns use a plain literal search (memmem); patterns
//! with wildcards use Boyer-Moore-Horspool with a 256-entry shift table
//! in which a wildcard position caps the skip for every byte value.
//! Source-level variants scan chunk-by-chunk with an overlap of
//! `pattern_len - 1` so matches straddling chunk boundaries are not lost.

use crate::io::ByteSource;
use crate::scan::pattern::{self, PatternByte};
use crate::scan::SignatureMatch;

/// Tuning for source-level scans.
#[derive(Debug, Clone)]
pub struct ScanConfig {
    /// Bytes read per chunk when scanning a `ByteSource`.
    pub chunk_size: usize,
}

impl Default for ScanConfig {
    fn default() -> Self {
        Self {
            chunk_size: 64 * 1024,
        }
    }
}

#[inline]
fn matches_at(data: &[u8], at: usize, pattern: &[PatternByte]) -> bool {
    pattern
        .iter()
        .enumerate()
        .all(|(j, p)| p.matches(data[at + j]))
}

/// Bad-character shift table. A wildcard at position `i` caps every
/// entry at `m - 1 - i`, since any byte can match there.
fn bmh_shift_table(pattern: &[PatternByte]) -> [usize; 256] {
    let m = pattern.len();
    let mut shift = [m; 256];
    for (i, p) in pattern.iter().enumerate().take(m - 1) {
        let skip = m - 1 - i;
        match p {
            PatternByte::Literal(b) => shift[*b as usize] = skip,
            PatternByte::Any => {
                for entry in shift.iter_mut() {
                    if *entry > skip {
                        *entry = skip;
                    }
                }
            }
        }
    }
    shift
}

fn bmh_find_from(data: &[u8], from: usize, pattern: &[PatternByte], shift: &[usize; 256]) -> Option<usize> {
    let m = pattern.len();
    let n = data.len();
    let mut i = from;
    while i + m <= n {
        if matches_at(data, i, pattern) {
            return Some(i);
        }
        i += shift[data[i + m - 1] as usize];
    }
    None
}

fn find_from(data: &[u8], from: usize, pattern: &[PatternByte]) -> Option<usize> {
    if pattern.is_empty() || from + pattern.len() > data.len() {
        return None;
    }
    if let Some(needle) = pattern::literal_bytes(pattern) {
        return memchr::memmem::find(&data[from..], &needle).map(|i| from + i);
    }
    let shift = bmh_shift_table(pattern);
    bmh_find_from(data, from, pattern, &shift)
}

/// First match position in `data`, or none.
pub fn find_first(data: &[u8], pattern: &[PatternByte]) -> Option<u64> {
    find_from(data, 0, pattern).map(|i| i as u64)
}

/// Every match position in `data`, overlapping matches included.
pub fn find_all(data: &[u8], pattern: &[PatternByte], name: &str) -> Vec<SignatureMatch> {
    let mut out = Vec::new();
    if pattern.is_empty() {
        return out;
    }
    let text = pattern::render(pattern);

    if let Some(needle) = pattern::literal_bytes(pattern) {
        let mut from = 0usize;
        while let Some(i) = memchr::memmem::find(&data[from..], &needle) {
            let at = from + i;
            out.push(SignatureMatch::new(at as u64, name, &text, pattern.len()));
            from = at + 1;
        }
        return out;
    }

    let shift = bmh_shift_table(pattern);
    let mut from = 0usize;
    while let Some(at) = bmh_find_from(data, from, pattern, &shift) {
        out.push(SignatureMatch::new(at as u64, name, &text, pattern.len()));
        from = at + 1;
    }
    out
}

/// Search the slice `[offset, offset + size)` of `data`, reporting match
/// offsets in absolute file coordinates.
pub fn find_in_range(
    data: &[u8],
    offset: u64,
    size: u64,
    pattern: &[PatternByte],
    name: &str,
) -> Vec<SignatureMatch> {
    let start = (offset as usize).min(data.len());
    let end = (offset.saturating_add(size) as usize).min(data.len());
    let mut matches = find_all(&data[start..end], pattern, name);
    for m in &mut matches {
        m.offset += start as u64;
    }
    matches
}

/// First match across a whole `ByteSource`, scanning in chunks.
pub fn find_first_in_source(
    src: &dyn ByteSource,
    pattern: &[PatternByte],
    cfg: &ScanConfig,
) -> Option<u64> {
    let mut first = None;
    scan_source(src, pattern, cfg, &mut |at| {
        first = Some(at);
        false
    });
    first
}

/// Every match across a whole `ByteSource`, overlapping matches included.
pub fn find_all_in_source(
    src: &dyn ByteSource,
    pattern: &[PatternByte],
    name: &str,
    cfg: &ScanConfig,
) -> Vec<SignatureMatch> {
    let text = pattern::render(pattern);
    let mut out = Vec::new();
    scan_source(src, pattern, cfg, &mut |at| {
        out.push(SignatureMatch::new(at, name, &text, pattern.len()));
        true
    });
    out
}

/// Chunked scan driver. Invokes `visit` with each absolute match offset
/// in ascending order; a `false` return stops the scan. Consecutive
/// chunks overlap by `pattern_len - 1` bytes; matches inside the overlap
/// are reported by the earlier chunk only.
fn scan_source(
    src: &dyn ByteSource,
    pattern: &[PatternByte],
    cfg: &ScanConfig,
    visit: &mut dyn FnMut(u64) -> bool,
) {
    let m = pattern.len();
    let total = src.len();
    if m == 0 || total < m as u64 {
        return;
    }

    let chunk = cfg.chunk_size.max(m * 2);
    let mut buf = vec![0u8; chunk];
    let mut base = 0u64;

    loop {
        let take = (total - base).min(chunk as u64) as usize;
        let window = &mut buf[..take];
        src.read_into(base, window);

        let last_chunk = base + take as u64 >= total;
        // On non-final chunks, matches starting inside the trailing
        // overlap belong to the next window.
        let fresh_limit = if last_chunk { take } else { take - (m - 1) };

        let mut from = 0usize;
        while let Some(at) = find_from(window, from, pattern) {
            if at >= fresh_limit {
                break;
            }
            if !visit(base + at as u64) {
                return;
            }
            from = at + 1;
        }

        if last_chunk {
            return;
        }
        base += (take - (m - 1)) as u64;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::io::VecByteSource;
    use crate::scan::parse_pattern;

    #[test]
    fn test_find_first_literal() {
        let data = b"xxDEADBEEFxxDEADBEEF";
        let pat = parse_pattern("44 45 41 44").unwrap(); // "DEAD"
        assert_eq!(find_first(data, &pat), Some(2));
    }

    #[test]
    fn test_find_first_is_smallest_index() {
        let data = [0u8, 1, 2, 1, 2, 3, 1, 2, 3];
        let pat = parse_pattern("01 02 03").unwrap();
        assert_eq!(find_first(&data, &pat), Some(3));
    }

    #[test]
    fn test_find_all_overlapping() {
        let data = [0xAA, 0xAA, 0xAA, 0xAA];
        let pat = parse_pattern("AA AA").unwrap();
        let matches = find_all(&data, &pat, "aa");
        assert_eq!(
            matches.iter().map(|m| m.offset).collect::<Vec<_>>(),
            vec![0, 1, 2]
        );
        assert_eq!(matches[0].length, 2);
        assert_eq!(matches[0].pattern, "AA AA");
    }

    #[test]
    fn test_wildcard_match() {
        let data = [0x55, 0x50, 0x58, 0x21, 0x00, 0x55, 0x50, 0x11, 0x21];
        let pat = parse_pattern("55 50 ?? 21").unwrap();
        let matches = find_all(&data, &pat, "upx");
        assert_eq!(
            matches.iter().map(|m| m.offset).collect::<Vec<_>>(),
            vec![0, 5]
        );
    }

    #[test]
    fn test_wildcard_only_positions_unconstrained() {
        let data = [9u8, 8, 7];
        let pat = parse_pattern("?? ??").unwrap();
        let matches = find_all(&data, &pat, "any");
        assert_eq!(matches.len(), 2);
    }

    #[test]
    fn test_empty_pattern_matches_nothing() {
        let data = [1u8, 2, 3];
        let pat = parse_pattern("").unwrap();
        assert_eq!(find_first(&data, &pat), None);
        assert!(find_all(&data, &pat, "x").is_empty());
    }

    #[test]
    fn test_find_in_range_absolute_offsets() {
        let mut data = vec![0u8; 32];
        data[10] = 0xCA;
        data[11] = 0xFE;
        data[20] = 0xCA;
        data[21] = 0xFE;
        let pat = parse_pattern("CA FE").unwrap();

        let matches = find_in_range(&data, 8, 8, &pat, "cafe");
        assert_eq!(matches.len(), 1);
        assert_eq!(matches[0].offset, 10);

        // Clamped range past the end of the data.
        let matches = find_in_range(&data, 16, 1000, &pat, "cafe");
        assert_eq!(matches.len(), 1);
        assert_eq!(matches[0].offset, 20);
    }

    #[test]
    fn test_chunked_scan_straddles_boundary() {
        // Place the needle right across the chunk boundary.
        let mut data = vec![0u8; 300];
        data[126] = 0x11;
        data[127] = 0x22;
        data[128] = 0x33;
        let src = VecByteSource::new(data);
        let pat = parse_pattern("11 22 33").unwrap();
        let cfg = ScanConfig { chunk_size: 128 };

        assert_eq!(find_first_in_source(&src, &pat, &cfg), Some(126));
        let all = find_all_in_source(&src, &pat, "straddle", &cfg);
        assert_eq!(all.len(), 1);
        assert_eq!(all[0].offset, 126);
    }

    #[test]
    fn test_chunked_scan_no_duplicates_in_overlap() {
        let mut data = vec![0u8; 256];
        for at in [0usize, 126, 127, 200] {
            data[at] = 0xAB;
            data[at + 1] = 0xCD;
        }
        let src = VecByteSource::new(data);
        let pat = parse_pattern("AB CD").unwrap();
        let cfg = ScanConfig { chunk_size: 128 };

        let all = find_all_in_source(&src, &pat, "dup", &cfg);
        assert_eq!(
            all.iter().map(|m| m.offset).collect::<Vec<_>>(),
            vec![0, 126, 127, 200]
        );
    }

    #[test]
    fn test_exact_search_misses_nothing_exhaustive() {
        // Every aligned and unaligned occurrence must be reported.
        let data: Vec<u8> = (0..=255u8).cycle().take(1024).collect();
        let pat = parse_pattern("10 11 12").unwrap();
        let matches = find_all(&data, &pat, "seq");
        assert_eq!(matches.len(), 4);
        for m in matches {
            assert_eq!(data[m.offset as usize], 0x10);
        }
    }
}
