//! Themida / WinLicense protector detection.

use crate::detect::{entropy_metadata, DetectionKind, DetectionResult, Detector};
use crate::pe::structure::BinaryStructure;
use crate::pe::{import_rva, section_names};
use crate::scan::{find_all, parse_pattern, shannon_entropy, PatternByte};
use once_cell::sync::Lazy;
use std::collections::BTreeMap;
use std::sync::Arc;

// Entry stub variants across 2.x/3.x builds.
const SIGNATURE_TEXT: &[(&str, &str)] = &[
    ("Themida entry stub A", "B8 ?? ?? ?? ?? 60 0B C0 74 68"),
    ("Themida entry stub B", "B8 ?? ?? ?? ?? 60 0B C0 74 58"),
    ("Themida entry stub C", "8B C5 8B D4 60 E8 00 00 00 00 5D 81 ED"),
    ("Themida entry stub D", "55 8B EC 83 C4 D8 60 E8 00 00 00 00 5D"),
];

static SIGNATURES: Lazy<Vec<(&'static str, Vec<PatternByte>)>> = Lazy::new(|| {
    SIGNATURE_TEXT
        .iter()
        .filter_map(|(name, text)| parse_pattern(text).ok().map(|p| (*name, p)))
        .collect()
});

/// Import table RVAs this far outside the usual image range are a
/// protector tell.
const ANOMALOUS_IMPORT_RVA: u64 = 0x100000;

pub struct ThemidaDetector;

impl Detector for ThemidaDetector {
    fn name(&self) -> &str {
        "Themida/WinLicense"
    }

    fn version(&self) -> &str {
        "1.0"
    }

    fn priority(&self) -> i32 {
        20
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
            confidence += 0.30;
        }

        let names = section_names(structure);
        let winlicense = names.iter().any(|n| n == ".WINLICE");
        if winlicense || names.iter().any(|n| n == ".THEMIDA") {
            confidence += 0.50;
        }
        if names.len() > 8 {
            confidence += 0.10;
        }

        // A stripped import directory reads back as RVA 0.
        let rva = import_rva(structure).unwrap_or(0);
        if rva == 0 || rva > ANOMALOUS_IMPORT_RVA {
            confidence += 0.20;
        }

        let entropy = shannon_entropy(data);
        if entropy > 7.5 {
            confidence += 0.30;
        }

        if confidence <= 0.0 {
            return None;
        }

        let mut metadata = BTreeMap::new();
        metadata.insert("Entropy".to_string(), entropy_metadata(entropy));
        metadata.insert("SignaturesFound".to_string(), matches.len().to_string());
        metadata.insert(
            "Type".to_string(),
            if winlicense { "WinLicense" } else { "Themida" }.to_string(),
        );

        Some(DetectionResult::new(
            "Themida/WinLicense",
            None,
            DetectionKind::Protector,
            confidence,
            matches,
            metadata,
            "themida",
        ))
    }
}
