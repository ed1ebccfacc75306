//! Byte-interval region map over the file.

use crate::error::Result;
use crate::pe::structure::BinaryStructure;
use serde::{Deserialize, Serialize};
use std::sync::{Arc, Weak};

/// Classification of a mapped byte interval.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum RegionKind {
    Header,
    Code,
    Data,
    Import,
    Export,
    Resource,
    Relocation,
    Debug,
    Overlay,
    Signature,
    Unknown,
}

/// Region highlight colors, packed 0xRRGGBB. The values are opaque to the
/// engine; hosts translate them to their own palette.
pub mod colors {
    pub const GREEN: u32 = 0x2E_A0_43;
    pub const BLUE: u32 = 0x2B_6C_B0;
    pub const GRAY: u32 = 0x80_80_80;
    pub const YELLOW: u32 = 0xC8_A4_1B;
    pub const PURPLE: u32 = 0x7C_3A_ED;
}

/// A byte interval `[offset, offset + size)` with a kind, a highlight
/// color, a stacking layer, and an optional link to the structure node
/// that produced it. Regions may overlap; the highest layer wins ties.
#[derive(Clone, Serialize, Deserialize)]
pub struct DataRegion {
    pub offset: u64,
    pub size: u64,
    pub kind: RegionKind,
    pub highlight_color: u32,
    pub layer: i32,
    #[serde(skip)]
    pub structure: Option<Weak<BinaryStructure>>,
}

impl DataRegion {
    pub fn new(offset: u64, size: u64, kind: RegionKind, highlight_color: u32, layer: i32) -> Self {
        Self {
            offset,
            size,
            kind,
            highlight_color,
            layer,
            structure: None,
        }
    }

    /// Attach the structure node this region describes. The region holds
    /// only a weak link and takes no lifecycle responsibility.
    pub fn with_structure(mut self, node: &Arc<BinaryStructure>) -> Self {
        self.structure = Some(Arc::downgrade(node));
        self
    }

    #[inline]
    pub fn contains(&self, offset: u64) -> bool {
        offset >= self.offset && offset < self.offset.saturating_add(self.size)
    }

    pub fn end(&self) -> u64 {
        self.offset.saturating_add(self.size)
    }

    /// Label for display and entropy maps: the linked node's name when it
    /// is still alive, otherwise a synthesized `kind@offset` form.
    pub fn label(&self) -> String {
        if let Some(node) = self.structure.as_ref().and_then(Weak::upgrade) {
            return node.name.clone();
        }
        format!("{:?}@{:#x}", self.kind, self.offset)
    }
}

impl std::fmt::Debug for DataRegion {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DataRegion")
            .field("offset", &self.offset)
            .field("size", &self.size)
            .field("kind", &self.kind)
            .field("layer", &self.layer)
            .finish()
    }
}

/// The region covering `offset`, preferring the highest layer among
/// overlapping candidates.
pub fn region_at(regions: &[DataRegion], offset: u64) -> Option<&DataRegion> {
    regions
        .iter()
        .filter(|r| r.contains(offset))
        .max_by_key(|r| r.layer)
}

/// Externally supplied source of extra regions, run after native mapping.
pub trait RegionProvider: Send + Sync {
    fn name(&self) -> &str;

    /// Produce additional regions for the mapped file. Errors are
    /// recorded on the tree and do not stop later providers.
    fn provide(&self, data: &[u8], root: &Arc<BinaryStructure>) -> Result<Vec<DataRegion>>;
}
