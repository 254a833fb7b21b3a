//! Loading, relocation, and page-permission scenarios.

mod common;

use common::builder::PeBuilder;
use common::RecordingProtection;

use bootgate::loader::{self, MemAttrs, NoProtection};
use bootgate::status::Status;
use bootgate::verify::{hash_only, VerifiedImage, VerifyPolicy};

fn verified(image: &[u8]) -> VerifiedImage {
    let (context, digest) = hash_only(image).expect("image should parse");
    VerifiedImage { context, digest }
}

/// Code body with an absolute 64-bit address slot at offset 0x10.
fn text_with_pointer_slot(image_base: u64) -> Vec<u8> {
    let mut body = vec![0x90u8; 0x40];
    body[0x10..0x18].copy_from_slice(&(image_base + 0x1020).to_le_bytes());
    body
}

#[test]
fn load_copies_sections_and_finds_entry_point() {
    let body = b"entry point body with recognizable bytes".to_vec();
    let image = PeBuilder::new()
        .text(&body)
        .reloc_block(0x1000, &[])
        .build();
    let verified = verified(&image);

    let loaded = loader::load(&image, &verified, VerifyPolicy::empty(), &NoProtection)
        .expect("image should load");

    assert_eq!(loaded.loaded_size(), verified.context.image_size as usize);
    assert_eq!(loaded.entry_offset(), 0x1000);
    assert_eq!(loaded.entry_point(), loaded.loaded_base() + 0x1000);
    // Section alignment carried through to the load address.
    assert_eq!(loaded.loaded_base() % 0x1000, 0);
    // The section bytes landed at their virtual address.
    assert_eq!(&loaded.as_slice()[0x1000..0x1000 + body.len()], &body[..]);
    // Header copy is verbatim.
    assert_eq!(&loaded.as_slice()[..4], &image[..4]);
}

#[test]
fn dir64_relocation_rebases_pointer_slot() {
    let image_base = 0x1_4000_0000u64;
    let body = text_with_pointer_slot(image_base);
    // One DIR64 fixup at page 0x1000, offset 0x10.
    let entry: u16 = (10 << 12) | 0x10;
    let image = PeBuilder::new()
        .image_base(image_base)
        .text(&body)
        .reloc_block(0x1000, &[entry, 0])
        .build();
    let verified = verified(&image);

    let loaded = loader::load(&image, &verified, VerifyPolicy::empty(), &NoProtection)
        .expect("image should load");

    let delta = (loaded.loaded_base() as u64).wrapping_sub(image_base);
    let mut slot = [0u8; 8];
    slot.copy_from_slice(&loaded.as_slice()[0x1010..0x1018]);
    assert_eq!(
        u64::from_le_bytes(slot),
        (image_base + 0x1020).wrapping_add(delta)
    );
    // Unrelocated neighbors are untouched.
    assert_eq!(loaded.as_slice()[0x1000], 0x90);
}

#[test]
fn uninitialized_section_is_zero_filled() {
    let image = PeBuilder::new()
        .text(b"code")
        .bss(b".bss\0\0\0\0", 0x180)
        .reloc_block(0x1000, &[])
        .build();
    let verified = verified(&image);

    let loaded = loader::load(&image, &verified, VerifyPolicy::empty(), &NoProtection)
        .expect("image should load");

    // .bss sits in the second section page.
    assert!(loaded.as_slice()[0x2000..0x2180].iter().all(|&b| b == 0));
}

#[test]
fn entry_point_outside_every_section_is_rejected() {
    let image = PeBuilder::new()
        .text(b"short")
        .entry(0x1800) // inside the image, inside no section
        .reloc_block(0x1000, &[])
        .build();
    let verified = verified(&image);

    assert_eq!(
        loader::load(&image, &verified, VerifyPolicy::empty(), &NoProtection).err(),
        Some(Status::Unsupported)
    );
}

#[test]
fn entry_point_outside_image_is_rejected() {
    let image = PeBuilder::new()
        .text(b"short")
        .entry(0x80_0000)
        .reloc_block(0x1000, &[])
        .build();
    let verified = verified(&image);

    assert_eq!(
        loader::load(&image, &verified, VerifyPolicy::empty(), &NoProtection).err(),
        Some(Status::Unsupported)
    );
}

#[test]
fn writable_executable_section_rejected_under_nx_policy() {
    use bootgate::pe::section_characteristics::*;
    let characteristics =
        IMAGE_SCN_CNT_CODE | IMAGE_SCN_MEM_READ | IMAGE_SCN_MEM_WRITE | IMAGE_SCN_MEM_EXECUTE;
    let image = PeBuilder::new()
        .section(b".wx\0\0\0\0\0", b"self-modifying", characteristics)
        .reloc_block(0x1000, &[])
        .build();
    let verified = verified(&image);

    assert_eq!(
        loader::load(&image, &verified, VerifyPolicy::REQUIRE_NX, &NoProtection).err(),
        Some(Status::Unsupported)
    );
    // Without the policy bit the same image loads.
    assert!(loader::load(&image, &verified, VerifyPolicy::empty(), &NoProtection).is_ok());
}

#[test]
fn page_permissions_follow_section_characteristics() {
    use bootgate::pe::section_characteristics::*;
    let image = PeBuilder::new()
        .text(b"code bytes")
        .section(
            b".data\0\0\0",
            b"mutable data",
            IMAGE_SCN_CNT_INITIALIZED_DATA | IMAGE_SCN_MEM_READ | IMAGE_SCN_MEM_WRITE,
        )
        .reloc_block(0x1000, &[])
        .build();
    let verified = verified(&image);

    let protection = RecordingProtection::new();
    let loaded = loader::load(&image, &verified, VerifyPolicy::empty(), &protection)
        .expect("image should load");
    assert!(loaded.protection_applied);

    let calls = protection.calls.borrow();
    // First call opens the whole allocation read-write.
    let (_, _, set, clear) = calls[0];
    assert_eq!(set, MemAttrs::READ | MemAttrs::WRITE);
    assert_eq!(clear, MemAttrs::EXEC);

    // .text: read + execute, write cleared.
    let text = calls
        .iter()
        .find(|(addr, _, _, _)| *addr == loaded.loaded_base() + 0x1000)
        .expect("permission call for .text");
    assert_eq!(text.2, MemAttrs::READ | MemAttrs::EXEC);
    assert_eq!(text.3, MemAttrs::WRITE);

    // .data: read + write, execute cleared.
    let data = calls
        .iter()
        .find(|(addr, _, _, _)| *addr == loaded.loaded_base() + 0x2000)
        .expect("permission call for .data");
    assert_eq!(data.2, MemAttrs::READ | MemAttrs::WRITE);
    assert_eq!(data.3, MemAttrs::EXEC);
}

#[test]
fn reloc_section_must_coincide_with_directory() {
    // Build a valid image, then point the relocation directory somewhere
    // else: the .reloc section no longer matches it.
    let mut image = PeBuilder::new()
        .text(b"code")
        .reloc_block(0x1000, &[0])
        .build();
    let dir_entry = common::builder::OPT + 112 + 5 * 8;
    image[dir_entry..dir_entry + 4].copy_from_slice(&0x1000u32.to_le_bytes());
    let verified = verified(&image);

    assert_eq!(
        loader::load(&image, &verified, VerifyPolicy::empty(), &NoProtection).err(),
        Some(Status::Unsupported)
    );
}

#[test]
fn image_without_reloc_section_loads_when_directory_is_empty() {
    let image = PeBuilder::new().text(b"plain body").build();
    let verified = verified(&image);
    let loaded = loader::load(&image, &verified, VerifyPolicy::empty(), &NoProtection)
        .expect("image should load without relocations");
    assert_eq!(loaded.entry_offset(), 0x1000);
}
