//! PE structure mapping.
//!
//! [`PeMapper`] parses the DOS header, NT headers, section table, and the
//! export/import directory entries of a loaded file into a
//! [`BinaryStructure`] tree plus a list of [`DataRegion`] records. It
//! never fails: a parse error becomes a "Parse Error" child on the root
//! and whatever was decoded before the error stays in the tree.

pub mod region;
pub mod structure;
pub mod types;
pub mod utils;

use crate::error::{EngineError, Result};
use crate::inspect::{decode_dos_date, decode_dos_time};
use crate::pe::region::{colors, DataRegion, RegionKind, RegionProvider};
use crate::pe::structure::{BinaryStructure, Value};
use crate::pe::types::*;
use crate::pe::utils::{section_name_to_string, ReadExt};
use chrono::DateTime;
use std::sync::Arc;
use tracing::{debug, error, warn};

/// Callback receiving file offsets the engine wants the host to show.
pub type OffsetCallback = Box<dyn Fn(u64) + Send + Sync>;

/// Result of a mapping pass.
pub struct PeMap {
    pub root: Arc<BinaryStructure>,
    pub regions: Vec<DataRegion>,
}

/// Parses PE headers into a structure tree and region map.
#[derive(Default)]
pub struct PeMapper {
    providers: Vec<Box<dyn RegionProvider>>,
    on_offset: Option<OffsetCallback>,
}

impl PeMapper {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an external region provider, run after native parsing.
    pub fn add_provider(&mut self, provider: Box<dyn RegionProvider>) {
        self.providers.push(provider);
    }

    /// Receive the entry-point file offset when the mapper resolves it.
    pub fn on_offset_selected(&mut self, callback: OffsetCallback) {
        self.on_offset = Some(callback);
    }

    /// Map `data` into a tree and region list. Always returns a tree.
    pub fn map(&self, data: &[u8]) -> PeMap {
        let root = BinaryStructure::new("PE File", "Root");
        let mut regions = Vec::new();

        if let Err(e) = parse_native(data, &root, &mut regions) {
            error!(error = %e, "PE parse failed");
            let node = BinaryStructure::note("Parse Error", "Error", e.to_string());
            node.set_metadata("message", e.to_string());
            root.attach_child(node);
        } else if let Some(callback) = &self.on_offset {
            if let Some(offset) = entry_point_offset(&root) {
                callback(offset);
            }
        }

        for provider in &self.providers {
            match provider.provide(data, &root) {
                Ok(extra) => {
                    debug!(provider = provider.name(), regions = extra.len(), "provider regions");
                    regions.extend(extra);
                }
                Err(e) => {
                    warn!(provider = provider.name(), error = %e, "region provider failed");
                    root.set_metadata(
                        format!("provider_error.{}", provider.name()),
                        e.to_string(),
                    );
                }
            }
        }

        PeMap { root, regions }
    }
}

fn parse_err(msg: impl Into<String>) -> EngineError {
    EngineError::Parse(msg.into())
}

fn hex8(v: u32) -> String {
    format!("0x{v:08X}")
}

fn unix_timestamp_display(ts: u32) -> String {
    if ts == 0 {
        return "0".to_string();
    }
    match DateTime::from_timestamp(i64::from(ts), 0) {
        Some(dt) => dt.format("%Y-%m-%d %H:%M:%S UTC").to_string(),
        None => format!("{ts:#010x}"),
    }
}

fn parse_native(
    data: &[u8],
    root: &Arc<BinaryStructure>,
    regions: &mut Vec<DataRegion>,
) -> Result<()> {
    // DOS header.
    let e_magic = data
        .read_u16_le_at(0)
        .ok_or_else(|| parse_err("file too small for a DOS header"))?;
    if e_magic != DOS_SIGNATURE {
        return Err(parse_err(format!(
            "invalid DOS signature {e_magic:#06x}, expected 0x5a4d"
        )));
    }
    let e_lfanew = data
        .read_u32_le_at(0x3C)
        .ok_or_else(|| parse_err("file too small for e_lfanew"))?;

    let dos = BinaryStructure::span("DOS Header", "IMAGE_DOS_HEADER", 0, 64);
    dos.attach_child(BinaryStructure::field(
        "e_magic",
        "WORD",
        0,
        2,
        Value::U64(u64::from(e_magic)),
        "0x5A4D (MZ)",
    ));
    let e_cblp = data.read_u16_le_at(2).unwrap_or(0);
    dos.attach_child(BinaryStructure::field(
        "e_cblp",
        "WORD",
        2,
        2,
        Value::U64(u64::from(e_cblp)),
        e_cblp.to_string(),
    ));
    let e_cp = data.read_u16_le_at(4).unwrap_or(0);
    dos.attach_child(BinaryStructure::field(
        "e_cp",
        "WORD",
        4,
        2,
        Value::U64(u64::from(e_cp)),
        e_cp.to_string(),
    ));
    dos.attach_child(BinaryStructure::field(
        "e_lfanew",
        "DWORD",
        0x3C,
        4,
        Value::U64(u64::from(e_lfanew)),
        hex8(e_lfanew),
    ));
    regions.push(
        DataRegion::new(0, 64, RegionKind::Header, colors::PURPLE, 1).with_structure(&dos),
    );
    root.attach_child(dos);

    // NT headers.
    let nt_offset = u64::from(e_lfanew);
    let signature = data
        .read_u32_le_at(nt_offset as usize)
        .ok_or_else(|| parse_err(format!("e_lfanew {e_lfanew:#x} beyond end of file")))?;
    if signature != PE_SIGNATURE {
        return Err(parse_err(format!(
            "invalid PE signature {signature:#010x} at {nt_offset:#x}"
        )));
    }

    let nt = BinaryStructure::span("NT Headers", "IMAGE_NT_HEADERS", nt_offset, NT_HEADERS_SIZE);
    nt.attach_child(BinaryStructure::field(
        "Signature",
        "DWORD",
        nt_offset,
        4,
        Value::U64(u64::from(signature)),
        "0x00004550 (PE)",
    ));

    // File header.
    let fh = nt_offset + 4;
    let fh_usize = fh as usize;
    let machine = data
        .read_u16_le_at(fh_usize)
        .ok_or_else(|| parse_err("file header truncated"))?;
    let number_of_sections = data
        .read_u16_le_at(fh_usize + 2)
        .ok_or_else(|| parse_err("file header truncated"))?;
    let time_date_stamp = data.read_u32_le_at(fh_usize + 4).unwrap_or(0);
    let size_of_optional_header = data
        .read_u16_le_at(fh_usize + 16)
        .ok_or_else(|| parse_err("file header truncated"))?;
    let characteristics = data.read_u16_le_at(fh_usize + 18).unwrap_or(0);

    let file_header = BinaryStructure::span("File Header", "IMAGE_FILE_HEADER", fh, FILE_HEADER_SIZE);
    file_header.attach_child(BinaryStructure::field(
        "Machine",
        "WORD",
        fh,
        2,
        Value::U64(u64::from(machine)),
        machine_name(machine),
    ));
    file_header.attach_child(BinaryStructure::field(
        "NumberOfSections",
        "WORD",
        fh + 2,
        2,
        Value::U64(u64::from(number_of_sections)),
        number_of_sections.to_string(),
    ));
    file_header.attach_child(BinaryStructure::field(
        "TimeDateStamp",
        "DWORD",
        fh + 4,
        4,
        Value::U64(u64::from(time_date_stamp)),
        unix_timestamp_display(time_date_stamp),
    ));
    file_header.attach_child(BinaryStructure::field(
        "Characteristics",
        "WORD",
        fh + 18,
        2,
        Value::U64(u64::from(characteristics)),
        characteristics_names(characteristics),
    ));
    nt.attach_child(file_header);

    // Optional header.
    let oh = fh + FILE_HEADER_SIZE;
    let oh_usize = oh as usize;
    let magic = data
        .read_u16_le_at(oh_usize)
        .ok_or_else(|| parse_err("optional header truncated"))?;
    let is_plus = match magic {
        PE32_MAGIC => false,
        PE32PLUS_MAGIC => true,
        other => return Err(parse_err(format!("invalid optional header magic {other:#06x}"))),
    };

    let optional = BinaryStructure::span(
        "Optional Header",
        if is_plus {
            "IMAGE_OPTIONAL_HEADER64"
        } else {
            "IMAGE_OPTIONAL_HEADER32"
        },
        oh,
        u64::from(size_of_optional_header),
    );
    optional.attach_child(BinaryStructure::field(
        "Magic",
        "WORD",
        oh,
        2,
        Value::U64(u64::from(magic)),
        if is_plus { "PE32+" } else { "PE32" },
    ));
    let entry_point = data.read_u32_le_at(oh_usize + 16).unwrap_or(0);
    optional.attach_child(BinaryStructure::field(
        "AddressOfEntryPoint",
        "DWORD",
        oh + 16,
        4,
        Value::U64(u64::from(entry_point)),
        hex8(entry_point),
    ));
    if is_plus {
        let image_base = data.read_u64_le_at(oh_usize + 24).unwrap_or(0);
        optional.attach_child(BinaryStructure::field(
            "ImageBase",
            "QWORD",
            oh + 24,
            8,
            Value::U64(image_base),
            format!("0x{image_base:016X}"),
        ));
    } else {
        let image_base = data.read_u32_le_at(oh_usize + 28).unwrap_or(0);
        optional.attach_child(BinaryStructure::field(
            "ImageBase",
            "DWORD",
            oh + 28,
            4,
            Value::U64(u64::from(image_base)),
            hex8(image_base),
        ));
    }
    for (name, rel) in [("SectionAlignment", 32u64), ("FileAlignment", 36)] {
        let value = data.read_u32_le_at(oh_usize + rel as usize).unwrap_or(0);
        optional.attach_child(BinaryStructure::field(
            name,
            "DWORD",
            oh + rel,
            4,
            Value::U64(u64::from(value)),
            hex8(value),
        ));
    }
    for (name, rel) in [("SizeOfImage", 56u64), ("SizeOfHeaders", 60)] {
        let value = data.read_u32_le_at(oh_usize + rel as usize).unwrap_or(0);
        optional.attach_child(BinaryStructure::field(
            name,
            "DWORD",
            oh + rel,
            4,
            Value::U64(u64::from(value)),
            hex8(value),
        ));
    }
    nt.attach_child(optional);
    regions.push(
        DataRegion::new(nt_offset, NT_HEADERS_SIZE, RegionKind::Header, colors::PURPLE, 1)
            .with_structure(&nt),
    );
    root.attach_child(nt);

    // Section table.
    let sections_offset = oh + u64::from(size_of_optional_header);
    let sections_size = u64::from(number_of_sections) * SECTION_HEADER_SIZE;
    let sections = BinaryStructure::span("Sections", "SECTION_TABLE", sections_offset, sections_size);
    let mut raw_end = 0u64;

    for index in 0..number_of_sections {
        let entry = sections_offset + u64::from(index) * SECTION_HEADER_SIZE;
        let entry_usize = entry as usize;
        let name_bytes = data
            .read_slice_at(entry_usize, 8)
            .ok_or_else(|| parse_err(format!("section table truncated at entry {index}")))?;
        let mut name = section_name_to_string(name_bytes);
        if name.is_empty() {
            name = format!("Section {index}");
        }

        let virtual_size = data.read_u32_le_at(entry_usize + 8).unwrap_or(0);
        let virtual_address = data.read_u32_le_at(entry_usize + 12).unwrap_or(0);
        let size_of_raw_data = data.read_u32_le_at(entry_usize + 16).unwrap_or(0);
        let pointer_to_raw_data = data.read_u32_le_at(entry_usize + 20).unwrap_or(0);
        let section_characteristics = data.read_u32_le_at(entry_usize + 36).unwrap_or(0);

        let section =
            BinaryStructure::span(name.clone(), "IMAGE_SECTION_HEADER", entry, SECTION_HEADER_SIZE);
        for (field, rel, value) in [
            ("VirtualSize", 8u64, virtual_size),
            ("VirtualAddress", 12, virtual_address),
            ("SizeOfRawData", 16, size_of_raw_data),
            ("PointerToRawData", 20, pointer_to_raw_data),
            ("Characteristics", 36, section_characteristics),
        ] {
            section.attach_child(BinaryStructure::field(
                field,
                "DWORD",
                entry + rel,
                4,
                Value::U64(u64::from(value)),
                hex8(value),
            ));
        }

        if size_of_raw_data > 0 {
            regions.push(
                DataRegion::new(
                    u64::from(pointer_to_raw_data),
                    u64::from(size_of_raw_data),
                    RegionKind::Code,
                    section_color(section_characteristics),
                    0,
                )
                .with_structure(&section),
            );
            raw_end = raw_end.max(u64::from(pointer_to_raw_data) + u64::from(size_of_raw_data));
        }

        sections.attach_child(section);
    }
    root.attach_child(sections);

    // Data directories: export and import entries when present.
    let (count_rel, dirs_rel) = if is_plus { (108usize, 112u64) } else { (92, 96) };
    let directory_count = data.read_u32_le_at(oh_usize + count_rel).unwrap_or(0);
    let dirs_offset = oh + dirs_rel;
    let directories = BinaryStructure::span(
        "Data Directories",
        "DATA_DIRECTORIES",
        dirs_offset,
        u64::from(directory_count.min(16)) * 8,
    );
    for (index, name) in [
        (DIRECTORY_EXPORT, "Export Directory"),
        (DIRECTORY_IMPORT, "Import Directory"),
    ] {
        if (index as u32) >= directory_count {
            continue;
        }
        let entry = dirs_offset + (index as u64) * 8;
        let rva = data.read_u32_le_at(entry as usize).unwrap_or(0);
        let size = data.read_u32_le_at(entry as usize + 4).unwrap_or(0);
        if rva == 0 {
            continue;
        }
        let directory = BinaryStructure::span(name, "IMAGE_DATA_DIRECTORY", entry, 8);
        directory.attach_child(BinaryStructure::field(
            "RVA",
            "DWORD",
            entry,
            4,
            Value::U64(u64::from(rva)),
            hex8(rva),
        ));
        directory.attach_child(BinaryStructure::field(
            "Size",
            "DWORD",
            entry + 4,
            4,
            Value::U64(u64::from(size)),
            hex8(size),
        ));
        directories.attach_child(directory);
    }
    root.attach_child(directories);

    // Overlay: trailing bytes past every section's raw data.
    let headers_end = sections_offset + sections_size;
    let overlay_start = raw_end.max(headers_end);
    if overlay_start < data.len() as u64 {
        let overlay_size = data.len() as u64 - overlay_start;
        let overlay = BinaryStructure::span("Overlay", "OVERLAY", overlay_start, overlay_size);
        annotate_overlay(data, overlay_start as usize, &overlay);
        regions.push(
            DataRegion::new(overlay_start, overlay_size, RegionKind::Overlay, colors::GRAY, 0)
                .with_structure(&overlay),
        );
        root.attach_child(overlay);
    }

    Ok(())
}

/// Section highlight color from its characteristics flags.
fn section_color(characteristics: u32) -> u32 {
    if characteristics & (IMAGE_SCN_CNT_CODE | IMAGE_SCN_MEM_EXECUTE) != 0 {
        colors::GREEN
    } else if characteristics & IMAGE_SCN_CNT_INITIALIZED_DATA != 0 {
        colors::BLUE
    } else if characteristics & IMAGE_SCN_CNT_UNINITIALIZED_DATA != 0 {
        colors::GRAY
    } else {
        colors::YELLOW
    }
}

/// Probe the overlay for an embedded ZIP local file header and record
/// its DOS timestamp on the node.
fn annotate_overlay(data: &[u8], start: usize, node: &Arc<BinaryStructure>) {
    let Some(magic) = data.read_u32_le_at(start) else {
        return;
    };
    if magic != 0x0403_4B50 {
        // "PK\x03\x04"
        return;
    }
    node.set_metadata("Embedded", "ZIP archive");
    if let (Some(time_raw), Some(date_raw)) = (
        data.read_u16_le_at(start + 10),
        data.read_u16_le_at(start + 12),
    ) {
        let (hour, minute, second) = decode_dos_time(time_raw);
        let (year, month, day) = decode_dos_date(date_raw);
        node.set_metadata(
            "ZipTimestamp",
            format!("{year:04}-{month:02}-{day:02} {hour:02}:{minute:02}:{second:02}"),
        );
    }
}

// Candidate field paths tolerated when probing the tree. Parsers differ
// on nesting and naming; the first hit wins.
const IMPORT_RVA_PATHS: &[&str] = &[
    "Data Directories.Import Directory.RVA",
    "Import Directory.RVA",
    "NT Headers.Optional Header.ImportTableRVA",
];
const ENTRY_POINT_PATHS: &[&str] = &[
    "NT Headers.Optional Header.AddressOfEntryPoint",
    "Optional Header.AddressOfEntryPoint",
    "AddressOfEntryPoint",
];
const SECTION_RAW_SIZE_PATHS: &[&str] = &["SizeOfRawData", "Header.SizeOfRawData", "RawSize"];
const SECTION_RAW_PTR_PATHS: &[&str] =
    &["PointerToRawData", "Header.PointerToRawData", "Offset"];
const SECTION_VA_PATHS: &[&str] = &["VirtualAddress", "Header.VirtualAddress", "RVA"];

/// Names of the mapped sections, in table order.
pub fn section_names(root: &Arc<BinaryStructure>) -> Vec<String> {
    root.find_by_path(&["Sections"])
        .map(|sections| sections.children().iter().map(|s| s.name.clone()).collect())
        .unwrap_or_default()
}

/// Raw sizes of the mapped sections, in table order.
pub fn section_raw_sizes(root: &Arc<BinaryStructure>) -> Vec<u64> {
    root.find_by_path(&["Sections"])
        .map(|sections| {
            sections
                .children()
                .iter()
                .filter_map(|s| s.resolve_u64(SECTION_RAW_SIZE_PATHS))
                .collect()
        })
        .unwrap_or_default()
}

/// Import directory RVA, when the tree has one.
pub fn import_rva(root: &Arc<BinaryStructure>) -> Option<u64> {
    root.resolve_u64(IMPORT_RVA_PATHS)
}

/// File offset of the entry point, resolved through the section table.
pub fn entry_point_offset(root: &Arc<BinaryStructure>) -> Option<u64> {
    let rva = root.resolve_u64(ENTRY_POINT_PATHS)?;
    if rva == 0 {
        return None;
    }
    let sections = root.find_by_path(&["Sections"])?;
    for section in sections.children() {
        let (Some(va), Some(raw_size)) = (
            section.resolve_u64(SECTION_VA_PATHS),
            section.resolve_u64(SECTION_RAW_SIZE_PATHS),
        ) else {
            continue;
        };
        let virtual_size = section.resolve_u64(&["VirtualSize"]).unwrap_or(raw_size);
        let span = raw_size.max(virtual_size);
        if rva >= va && rva < va + span {
            let raw_ptr = section.resolve_u64(SECTION_RAW_PTR_PATHS)?;
            return Some(raw_ptr + (rva - va));
        }
    }
    None
}
