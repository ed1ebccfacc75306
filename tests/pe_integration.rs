//! Mapping a well-formed PE32 into the structure tree and region map.

mod common;

use common::{PeBuilder, SectionSpec};
use peforge::pe::region::{colors, region_at, RegionKind};
use peforge::pe::structure::Value;
use peforge::pe::{entry_point_offset, import_rva, section_names, PeMapper};
use peforge::scan::entropy_by_region;

fn two_section_pe() -> Vec<u8> {
    PeBuilder::new()
        .total_size(0x1000)
        .section(SectionSpec::code(".text", 0x1000, 0x400, 0x400))
        .section(SectionSpec {
            name: ".data",
            virtual_size: 0x200,
            virtual_address: 0x2000,
            raw_size: 0x200,
            raw_pointer: 0x800,
            characteristics: 0xC000_0040, // INITIALIZED_DATA | READ | WRITE
        })
        .build()
}

#[test]
fn mz_header_fields_display_correctly() {
    let data = two_section_pe();
    let map = PeMapper::new().map(&data);
    let root = &map.root;

    let dos = root.child("DOS Header").unwrap();
    assert_eq!(dos.offset, Some(0));
    assert_eq!(dos.size, Some(64));
    assert_eq!(dos.tag, "IMAGE_DOS_HEADER");

    let magic = dos.child("e_magic").unwrap();
    assert_eq!(magic.display_value.as_deref(), Some("0x5A4D (MZ)"));
    assert_eq!(magic.value.as_ref().and_then(Value::as_u64), Some(0x5A4D));

    let lfanew = dos.child("e_lfanew").unwrap();
    assert_eq!(lfanew.display_value.as_deref(), Some("0x00000080"));
    assert_eq!(lfanew.offset, Some(0x3C));
    assert_eq!(lfanew.size, Some(4));
}

#[test]
fn tree_covers_headers_sections_and_directories() {
    let data = two_section_pe();
    let map = PeMapper::new().map(&data);
    let root = &map.root;

    assert!(root.child("Parse Error").is_none());

    let nt = root.child("NT Headers").unwrap();
    assert_eq!(nt.offset, Some(0x80));
    assert_eq!(nt.size, Some(248));

    let machine = nt.find_by_path(&["File Header", "Machine"]).unwrap();
    assert_eq!(machine.display_value.as_deref(), Some("I386"));

    let optional = nt.child("Optional Header").unwrap();
    assert_eq!(optional.child("Magic").unwrap().display_value.as_deref(), Some("PE32"));
    assert_eq!(
        optional
            .child("ImageBase")
            .unwrap()
            .value
            .as_ref()
            .and_then(Value::as_u64),
        Some(0x0040_0000)
    );

    assert_eq!(section_names(root), vec![".text".to_string(), ".data".to_string()]);
    assert_eq!(import_rva(root), Some(0x1800));
    assert_eq!(entry_point_offset(root), Some(0x400));

    // The section table node spans both 40-byte entries.
    let sections = root.child("Sections").unwrap();
    assert_eq!(sections.size, Some(80));
}

#[test]
fn regions_follow_section_characteristics() {
    let data = two_section_pe();
    let map = PeMapper::new().map(&data);

    let text = map.regions.iter().find(|r| r.label() == ".text").unwrap();
    assert_eq!(text.highlight_color, colors::GREEN);
    assert_eq!(text.kind, RegionKind::Code);
    assert!(text.contains(0x400) && !text.contains(0x800));

    let data_region = map.regions.iter().find(|r| r.label() == ".data").unwrap();
    assert_eq!(data_region.highlight_color, colors::BLUE);

    // Header regions sit on a higher layer than section content.
    let at_zero = region_at(&map.regions, 0).unwrap();
    assert_eq!(at_zero.kind, RegionKind::Header);
}

#[test]
fn entropy_per_region_uses_section_labels() {
    let mut data = two_section_pe();
    common::fill_uniform(&mut data, 0x400);
    let map = PeMapper::new().map(&data);

    let by_region = entropy_by_region(&data, &map.regions);
    let text_entropy = by_region.get(".text").copied().unwrap();
    assert!(text_entropy > 7.9, "uniform fill should max out entropy");
}

#[test]
fn truncated_file_keeps_partial_tree() {
    // Valid DOS header pointing at NT headers that never arrive.
    let mut data = vec![0u8; 0x90];
    data[0] = 0x4D;
    data[1] = 0x5A;
    data[0x3C] = 0x80;
    data[0x80..0x84].copy_from_slice(b"PE\0\0");
    // File header cut off mid-way.

    let map = PeMapper::new().map(&data);
    assert!(map.root.child("DOS Header").is_some());
    assert!(map.root.child("Parse Error").is_some());
    assert!(map.root.child("Sections").is_none());
}

#[test]
fn tree_json_round_trips_through_serde() {
    let data = two_section_pe();
    let map = PeMapper::new().map(&data);
    let json = map.root.to_json();

    let text = serde_json::to_string(&json).unwrap();
    let back: serde_json::Value = serde_json::from_str(&text).unwrap();
    assert_eq!(back["name"], "PE File");
    assert_eq!(back["children"][0]["name"], "DOS Header");
}
