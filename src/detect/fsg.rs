//! FSG (Fast Small Good) packer detection.

use crate::detect::{entropy_metadata, DetectionKind, DetectionResult, Detector};
use crate::pe::structure::BinaryStructure;
use crate::pe::{import_rva, section_raw_sizes};
use crate::scan::{find_first, parse_pattern, shannon_entropy, PatternByte};
use once_cell::sync::Lazy;
use std::collections::BTreeMap;
use std::sync::Arc;

// Loader stubs by release; the wildcards cover the relocated source
// address embedded in each build.
const VERSION_TEXT: &[(&str, &str)] = &[
    ("1.00", "BB D0 01 40 00 BF 00 10 40 00 BE ?? ?? ?? ?? 53 E8"),
    ("1.33", "BE A4 01 40 00 AD 93 AD 97 AD 56 B2 80"),
    ("2.00", "87 25 ?? ?? ?? ?? 61 94 55 A4 B6 80 FF 13"),
];

static VERSIONS: Lazy<Vec<(&'static str, Vec<PatternByte>)>> = Lazy::new(|| {
    VERSION_TEXT
        .iter()
        .filter_map(|(version, text)| parse_pattern(text).ok().map(|p| (*version, p)))
        .collect()
});

pub struct FsgDetector;

impl Detector for FsgDetector {
    fn name(&self) -> &str {
        "FSG"
    }

    fn version(&self) -> &str {
        "1.0"
    }

    fn priority(&self) -> i32 {
        15
    }

    fn can_analyze(&self, structure: &Arc<BinaryStructure>) -> bool {
        structure.child("DOS Header").is_some()
    }

    fn detect(&self, data: &[u8], structure: &Arc<BinaryStructure>) -> Option<DetectionResult> {
        let mut confidence = 0.0f64;
        let mut version = None;
        let mut matches = Vec::new();

        for (release, pattern) in VERSIONS.iter() {
            if let Some(offset) = find_first(data, pattern) {
                confidence += 0.60;
                version = Some(release.to_string());
                matches.push(crate::scan::SignatureMatch::new(
                    offset,
                    &format!("FSG {release} stub"),
                    &crate::scan::pattern::render(pattern),
                    pattern.len(),
                ));
                break;
            }
        }

        let sizes = section_raw_sizes(structure);
        if sizes.iter().any(|&s| s < 1024) {
            confidence += 0.10;
        }
        if sizes.first().is_some_and(|&s| s < 512) {
            confidence += 0.15;
        }

        let entropy = shannon_entropy(data);
        if entropy > 7.0 {
            confidence += 0.15;
        }
        if import_rva(structure).unwrap_or(0) == 0 {
            confidence += 0.10;
        }

        if confidence <= 0.0 {
            return None;
        }

        let mut metadata = BTreeMap::new();
        metadata.insert("Entropy".to_string(), entropy_metadata(entropy));
        metadata.insert("SignaturesFound".to_string(), matches.len().to_string());

        Some(DetectionResult::new(
            "FSG",
            version,
            DetectionKind::Packer,
            confidence,
            matches,
            metadata,
            "fsg",
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pe::structure::{BinaryStructure, Value};

    fn tree(raw_sizes: &[u64], import: Option<u64>) -> Arc<BinaryStructure> {
        let root = BinaryStructure::new("PE File", "Root");
        root.attach_child(BinaryStructure::span("DOS Header", "IMAGE_DOS_HEADER", 0, 64));
        let sections = BinaryStructure::new("Sections", "SECTION_TABLE");
        for (i, &size) in raw_sizes.iter().enumerate() {
            let section = BinaryStructure::new(format!(".s{i}"), "IMAGE_SECTION_HEADER");
            section.attach_child(BinaryStructure::field(
                "SizeOfRawData",
                "DWORD",
                0,
                4,
                Value::U64(size),
                size.to_string(),
            ));
            sections.attach_child(section);
        }
        root.attach_child(sections);
        if let Some(rva) = import {
            let dirs = BinaryStructure::new("Data Directories", "DATA_DIRECTORIES");
            let entry = BinaryStructure::new("Import Directory", "IMAGE_DATA_DIRECTORY");
            entry.attach_child(BinaryStructure::field(
                "RVA",
                "DWORD",
                0,
                4,
                Value::U64(rva),
                format!("0x{rva:08X}"),
            ));
            dirs.attach_child(entry);
            root.attach_child(dirs);
        }
        root
    }

    #[test]
    fn test_version_stub_detected() {
        let mut data = vec![0u8; 1024];
        let stub = [
            0xBEu8, 0xA4, 0x01, 0x40, 0x00, 0xAD, 0x93, 0xAD, 0x97, 0xAD, 0x56, 0xB2, 0x80,
        ];
        data[200..200 + stub.len()].copy_from_slice(&stub);
        let root = tree(&[4096, 4096], Some(0x4000));

        let result = FsgDetector.detect(&data, &root).unwrap();
        assert_eq!(result.version.as_deref(), Some("1.33"));
        assert!((result.confidence - 0.60).abs() < 1e-9);
        assert_eq!(result.signatures.len(), 1);
        assert_eq!(result.signatures[0].offset, 200);
    }

    #[test]
    fn test_tiny_section_heuristics() {
        let data = vec![0u8; 256];
        // First section under 512 also counts as "any under 1024", and
        // the missing import directory adds its own signal.
        let root = tree(&[300, 4096], None);
        let result = FsgDetector.detect(&data, &root).unwrap();
        assert!((result.confidence - 0.35).abs() < 1e-9);
        assert!(result.version.is_none());
    }

    #[test]
    fn test_clean_file_yields_nothing() {
        let data = vec![0u8; 256];
        let root = tree(&[4096, 8192], Some(0x4000));
        assert!(FsgDetector.detect(&data, &root).is_none());
    }
}
