//! UPX packer detection.

use crate::detect::{entropy_metadata, DetectionKind, DetectionResult, Detector};
use crate::pe::section_names;
use crate::pe::structure::BinaryStructure;
use crate::scan::{find_all, parse_pattern, shannon_entropy, PatternByte};
use once_cell::sync::Lazy;
use std::collections::BTreeMap;
use std::sync::Arc;

const UPX_MAGIC_NAME: &str = "UPX! magic";

const SIGNATURE_TEXT: &[(&str, &str)] = &[
    ("UPX0 marker", "55 50 58 30"),
    ("UPX1 marker", "55 50 58 31"),
    (UPX_MAGIC_NAME, "55 50 58 21"),
    // pushad; mov esi, src; lea edi, [esi+disp]; push edi; or ebp, -1
    ("UPX entry stub", "60 BE ?? ?? ?? ?? 8D BE ?? ?? ?? ?? 57 83 CD FF"),
    // mov ebx, [esi]; sub esi, -4; adc ebx, ebx; jb ...
    ("UPX decompressor", "8B 1E 83 EE FC 11 DB 72"),
];

static SIGNATURES: Lazy<Vec<(&'static str, Vec<PatternByte>)>> = Lazy::new(|| {
    SIGNATURE_TEXT
        .iter()
        .filter_map(|(name, text)| parse_pattern(text).ok().map(|p| (*name, p)))
        .collect()
});

/// Signature- and heuristic-based UPX detection.
pub struct UpxDetector;

impl Detector for UpxDetector {
    fn name(&self) -> &str {
        "UPX"
    }

    fn version(&self) -> &str {
        "1.0"
    }

    fn priority(&self) -> i32 {
        10
    }

    fn can_analyze(&self, structure: &Arc<BinaryStructure>) -> bool {
        structure.child("DOS Header").is_some()
    }

    fn detect(&self, data: &[u8], structure: &Arc<BinaryStructure>) -> Option<DetectionResult> {
        let mut matches = Vec::new();
        for (name, pattern) in SIGNATURES.iter() {
            matches.extend(find_all(data, pattern, name));
        }

        let mut confidence = 0.0f64;
        if !matches.is_empty() {
            confidence += 0.40;
        }

        let names = section_names(structure);
        if names.iter().any(|n| n == "UPX0" || n == "UPX1") {
            confidence += 0.40;
        }
        if names.iter().any(|n| n == ".UPX0" || n == ".UPX1") {
            confidence += 0.30;
        }

        let entropy = shannon_entropy(data);
        if entropy > 7.0 {
            confidence += 0.20;
        }

        if confidence <= 0.0 {
            return None;
        }

        let version = matches
            .iter()
            .any(|m| m.name == UPX_MAGIC_NAME)
            .then(|| "3.x+".to_string());

        let mut metadata = BTreeMap::new();
        metadata.insert("Entropy".to_string(), entropy_metadata(entropy));
        metadata.insert("SignaturesFound".to_string(), matches.len().to_string());

        Some(DetectionResult::new(
            "UPX",
            version,
            DetectionKind::Packer,
            confidence,
            matches,
            metadata,
            "upx",
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pe::structure::BinaryStructure;

    fn tree_with_sections(names: &[&str]) -> Arc<BinaryStructure> {
        let root = BinaryStructure::new("PE File", "Root");
        root.attach_child(BinaryStructure::span("DOS Header", "IMAGE_DOS_HEADER", 0, 64));
        let sections = BinaryStructure::new("Sections", "SECTION_TABLE");
        for name in names {
            sections.attach_child(BinaryStructure::new(*name, "IMAGE_SECTION_HEADER"));
        }
        root.attach_child(sections);
        root
    }

    #[test]
    fn test_full_confidence_detection() {
        // UPX! magic + UPX0/UPX1 sections + high entropy.
        let mut data: Vec<u8> = (0..=255u8).cycle().take(8192).collect();
        data[100..104].copy_from_slice(&[0x55, 0x50, 0x58, 0x21]);
        let root = tree_with_sections(&["UPX0", "UPX1", ".rsrc"]);

        let result = UpxDetector.detect(&data, &root).unwrap();
        assert_eq!(result.name, "UPX");
        assert_eq!(result.version.as_deref(), Some("3.x+"));
        assert_eq!(result.kind, DetectionKind::Packer);
        assert_eq!(result.confidence, 1.0);
        assert!(result.metadata.contains_key("Entropy"));
        assert_eq!(
            result.metadata.get("SignaturesFound").map(String::as_str),
            Some("1")
        );
    }

    #[test]
    fn test_dotted_section_names_score_lower() {
        let data = vec![0u8; 1024];
        let root = tree_with_sections(&[".UPX0", ".UPX1"]);
        let result = UpxDetector.detect(&data, &root).unwrap();
        assert!((result.confidence - 0.30).abs() < 1e-9);
        assert!(result.version.is_none());
    }

    #[test]
    fn test_clean_file_yields_nothing() {
        let data = vec![0u8; 1024];
        let root = tree_with_sections(&[".text", ".data"]);
        assert!(UpxDetector.detect(&data, &root).is_none());
    }
}
