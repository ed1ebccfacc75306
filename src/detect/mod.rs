//! Packer and protector detection.
//!
//! Detectors are registered with a priority, filtered by `can_analyze`,
//! and run off the caller's thread; each reports an optional
//! [`DetectionResult`] with an additive confidence that is clamped at
//! 1.0. Progress is streamed through an mpsc channel, one message per
//! detector start; results are delivered confidence-descending after
//! every detector has finished.

pub mod fsg;
pub mod themida;
pub mod upx;

use crate::error::Result;
use crate::pe::structure::BinaryStructure;
use crate::scan::SignatureMatch;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::mpsc::Sender;
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use tracing::{debug, warn};

pub use fsg::FsgDetector;
pub use themida::ThemidaDetector;
pub use upx::UpxDetector;

/// What a detection identifies the file as.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DetectionKind {
    Packer,
    Protector,
    Cryptor,
    Virtualizer,
    Compiler,
    Unknown,
}

/// One positive detection. Absence of a result means "nothing found";
/// detectors never emit zero-confidence records.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DetectionResult {
    pub name: String,
    pub version: Option<String>,
    pub kind: DetectionKind,
    /// In `[0.0, 1.0]`; clamped at construction.
    pub confidence: f64,
    pub signatures: Vec<SignatureMatch>,
    pub metadata: BTreeMap<String, String>,
    /// Identifier of the detector that produced this result.
    pub detector: String,
}

impl DetectionResult {
    pub fn new(
        name: impl Into<String>,
        version: Option<String>,
        kind: DetectionKind,
        confidence: f64,
        signatures: Vec<SignatureMatch>,
        metadata: BTreeMap<String, String>,
        detector: impl Into<String>,
    ) -> Self {
        Self {
            name: name.into(),
            version,
            kind,
            confidence: confidence.clamp(0.0, 1.0),
            signatures,
            metadata,
            detector: detector.into(),
        }
    }
}

/// Progress events emitted while an analysis runs.
#[derive(Debug, Clone)]
pub enum Progress {
    Started {
        detector: String,
        index: usize,
        total: usize,
    },
}

/// One detection strategy.
pub trait Detector: Send + Sync {
    fn name(&self) -> &str;
    fn version(&self) -> &str;
    /// Lower priorities run first.
    fn priority(&self) -> i32;
    /// Cheap structural gate before the byte-level pass.
    fn can_analyze(&self, structure: &Arc<BinaryStructure>) -> bool;
    /// Full detection pass. `None` means nothing found.
    fn detect(&self, data: &[u8], structure: &Arc<BinaryStructure>) -> Option<DetectionResult>;
}

/// Ordered collection of detectors.
#[derive(Default)]
pub struct DetectorRegistry {
    detectors: Vec<Arc<dyn Detector>>,
}

impl DetectorRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry preloaded with the built-in detectors.
    pub fn with_builtins() -> Self {
        let mut registry = Self::new();
        registry.register(Arc::new(UpxDetector));
        registry.register(Arc::new(FsgDetector));
        registry.register(Arc::new(ThemidaDetector));
        registry
    }

    /// Append a detector and re-sort by ascending priority. The sort is
    /// stable, so same-priority detectors keep registration order.
    pub fn register(&mut self, detector: Arc<dyn Detector>) {
        self.detectors.push(detector);
        self.detectors.sort_by_key(|d| d.priority());
    }

    pub fn len(&self) -> usize {
        self.detectors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.detectors.is_empty()
    }

    /// Run every eligible detector against the loaded file.
    ///
    /// One `Progress::Started` is sent per detector before it runs; a
    /// detector that panics is suppressed, results with non-positive
    /// confidence are dropped, and the remainder comes back sorted by
    /// confidence descending.
    pub fn analyze(
        &self,
        data: &[u8],
        structure: &Arc<BinaryStructure>,
        progress: Option<Sender<Progress>>,
    ) -> Vec<DetectionResult> {
        let eligible: Vec<_> = self
            .detectors
            .iter()
            .filter(|d| d.can_analyze(structure))
            .collect();
        let total = eligible.len();

        let mut results = Vec::new();
        for (index, detector) in eligible.into_iter().enumerate() {
            if let Some(tx) = &progress {
                let _ = tx.send(Progress::Started {
                    detector: detector.name().to_string(),
                    index,
                    total,
                });
            }
            debug!(detector = detector.name(), "running detector");
            match catch_unwind(AssertUnwindSafe(|| detector.detect(data, structure))) {
                Ok(Some(result)) if result.confidence > 0.0 => results.push(result),
                Ok(_) => {}
                Err(_) => warn!(detector = detector.name(), "detector failed; suppressed"),
            }
        }

        results.sort_by(|a, b| {
            b.confidence
                .partial_cmp(&a.confidence)
                .unwrap_or(std::cmp::Ordering::Equal)
        });
        results
    }

    /// Run [`analyze`](Self::analyze) on a worker thread.
    ///
    /// Fails when the worker thread cannot be spawned.
    pub fn analyze_detached(
        self: Arc<Self>,
        data: Arc<Vec<u8>>,
        structure: Arc<BinaryStructure>,
        progress: Option<Sender<Progress>>,
    ) -> Result<JoinHandle<Vec<DetectionResult>>> {
        let handle = thread::Builder::new()
            .name("detector-analysis".into())
            .spawn(move || self.analyze(&data, &structure, progress))?;
        Ok(handle)
    }
}

/// First element of a confidence-descending ordering; the earliest
/// result wins ties.
pub fn best(results: &[DetectionResult]) -> Option<&DetectionResult> {
    results
        .iter()
        .reduce(|best, r| if r.confidence > best.confidence { r } else { best })
}

/// Format an entropy value the way result metadata carries it.
pub(crate) fn entropy_metadata(entropy: f64) -> String {
    format!("{entropy:.2}")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pe::structure::BinaryStructure;

    struct FixedDetector {
        name: &'static str,
        priority: i32,
        confidence: f64,
        eligible: bool,
        panics: bool,
    }

    impl Detector for FixedDetector {
        fn name(&self) -> &str {
            self.name
        }
        fn version(&self) -> &str {
            "1.0"
        }
        fn priority(&self) -> i32 {
            self.priority
        }
        fn can_analyze(&self, _structure: &Arc<BinaryStructure>) -> bool {
            self.eligible
        }
        fn detect(
            &self,
            _data: &[u8],
            _structure: &Arc<BinaryStructure>,
        ) -> Option<DetectionResult> {
            if self.panics {
                panic!("detector bug");
            }
            if self.confidence <= 0.0 {
                return None;
            }
            Some(DetectionResult::new(
                self.name,
                None,
                DetectionKind::Packer,
                self.confidence,
                Vec::new(),
                BTreeMap::new(),
                self.name,
            ))
        }
    }

    fn registry_of(detectors: Vec<FixedDetector>) -> DetectorRegistry {
        let mut registry = DetectorRegistry::new();
        for d in detectors {
            registry.register(Arc::new(d));
        }
        registry
    }

    #[test]
    fn test_priority_order_and_progress() {
        let registry = registry_of(vec![
            FixedDetector {
                name: "late",
                priority: 20,
                confidence: 0.2,
                eligible: true,
                panics: false,
            },
            FixedDetector {
                name: "early",
                priority: 5,
                confidence: 0.9,
                eligible: true,
                panics: false,
            },
            FixedDetector {
                name: "filtered",
                priority: 1,
                confidence: 0.9,
                eligible: false,
                panics: false,
            },
        ]);

        let (tx, rx) = std::sync::mpsc::channel();
        let root = BinaryStructure::new("PE File", "Root");
        let results = registry.analyze(&[], &root, Some(tx));

        // Progress arrives in start order: priority ascending, gated on
        // can_analyze.
        let starts: Vec<String> = rx
            .iter()
            .map(|p| match p {
                Progress::Started { detector, .. } => detector,
            })
            .collect();
        assert_eq!(starts, vec!["early".to_string(), "late".to_string()]);

        // Results come back confidence-descending.
        let names: Vec<&str> = results.iter().map(|r| r.name.as_str()).collect();
        assert_eq!(names, vec!["early", "late"]);
    }

    #[test]
    fn test_panicking_detector_suppressed() {
        let registry = registry_of(vec![
            FixedDetector {
                name: "bad",
                priority: 1,
                confidence: 0.5,
                eligible: true,
                panics: true,
            },
            FixedDetector {
                name: "good",
                priority: 2,
                confidence: 0.5,
                eligible: true,
                panics: false,
            },
        ]);
        let root = BinaryStructure::new("PE File", "Root");
        let results = registry.analyze(&[], &root, None);
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].name, "good");
    }

    #[test]
    fn test_confidence_clamped() {
        let result = DetectionResult::new(
            "X",
            None,
            DetectionKind::Packer,
            1.7,
            Vec::new(),
            BTreeMap::new(),
            "x",
        );
        assert_eq!(result.confidence, 1.0);
    }

    #[test]
    fn test_best_prefers_first_on_ties() {
        let make = |name: &str, confidence| {
            DetectionResult::new(
                name,
                None,
                DetectionKind::Packer,
                confidence,
                Vec::new(),
                BTreeMap::new(),
                name,
            )
        };
        let results = vec![make("a", 0.5), make("b", 0.9), make("c", 0.9)];
        assert_eq!(best(&results).unwrap().name, "b");
        assert!(best(&[]).is_none());
    }

    #[test]
    fn test_detached_analysis() {
        let registry = Arc::new(registry_of(vec![FixedDetector {
            name: "only",
            priority: 0,
            confidence: 0.4,
            eligible: true,
            panics: false,
        }]));
        let root = BinaryStructure::new("PE File", "Root");
        let handle = registry
            .analyze_detached(Arc::new(vec![0u8; 4]), root, None)
            .unwrap();
        let results = handle.join().unwrap();
        assert_eq!(results.len(), 1);
    }
}
