//! Image loading: mapping, base relocation, page permissions.
//!
//! Loading happens strictly after verification: [`load`] consumes the
//! [`VerifiedImage`] produced by [`crate::verify`] and never re-derives
//! trust decisions. Fresh pages are allocated with alignment slack, the
//! headers and sections are copied (or zero-filled) with every extent
//! re-validated, base-relocation fixups are applied for the delta between
//! the preferred and actual load address, and a final pass sets page
//! permissions per section — read-only unless a section declares
//! otherwise.

use alloc::vec;
use alloc::vec::Vec;
use bitflags::bitflags;
use log::{debug, warn};

use crate::mem;
use crate::pe::{self, relocation_type, ImageBaseRelocation, ImageSectionHeader};
use crate::status::{Result, Status};
use crate::verify::{VerifiedImage, VerifyPolicy};

bitflags! {
    /// Page attributes, translated to whatever the platform protection
    /// service understands.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct MemAttrs: u64 {
        const READ = 1 << 0;
        const WRITE = 1 << 1;
        const EXEC = 1 << 2;
    }
}

/// Best-effort platform page-permission service.
///
/// Pre-boot platforms are not required to provide one; failures here are
/// recorded, never fatal to the load.
pub trait MemoryProtection {
    /// Set and clear attributes on `[addr, addr + size)`.
    fn update(&self, addr: usize, size: usize, set: MemAttrs, clear: MemAttrs) -> Result<()>;

    /// Invalidate the instruction cache for a freshly written range.
    fn flush_icache(&self, _addr: usize, _size: usize) {}
}

/// Protection service for hosts without one.
pub struct NoProtection;

impl MemoryProtection for NoProtection {
    fn update(&self, _addr: usize, _size: usize, _set: MemAttrs, _clear: MemAttrs) -> Result<()> {
        Ok(())
    }
}

/// A relocated, mapped image ready to run.
pub struct LoadedImage {
    buffer: Vec<u8>,
    load_offset: usize,
    image_size: usize,
    entry_offset: usize,
    /// Whether every page-permission request was honored. Informational;
    /// the platform service is best-effort.
    pub protection_applied: bool,
}

impl LoadedImage {
    /// Base address the image was loaded at.
    pub fn loaded_base(&self) -> usize {
        self.buffer.as_ptr() as usize + self.load_offset
    }

    /// Size of the loaded image in memory.
    pub fn loaded_size(&self) -> usize {
        self.image_size
    }

    /// Absolute entry-point address.
    pub fn entry_point(&self) -> usize {
        self.loaded_base() + self.entry_offset
    }

    /// Entry-point offset relative to the load base.
    pub fn entry_offset(&self) -> usize {
        self.entry_offset
    }

    /// The loaded image bytes.
    pub fn as_slice(&self) -> &[u8] {
        &self.buffer[self.load_offset..self.load_offset + self.image_size]
    }
}

/// Map, relocate, and protect a verified image.
pub fn load(
    image: &[u8],
    verified: &VerifiedImage,
    policy: VerifyPolicy,
    protection: &dyn MemoryProtection,
) -> Result<LoadedImage> {
    let context = &verified.context;
    let image_size = context.image_size;
    let alignment = context.section_alignment as u64;

    // Alignment slack: the allocation is byte-aligned, the image wants
    // section alignment.
    let alloc_size = image_size
        .checked_add(alignment)
        .and_then(|v| mem::align_up(v, pe::PAGE_SIZE))
        .ok_or(Status::OutOfResources)?;
    let mut buffer = vec![0u8; alloc_size as usize];

    let base_addr = buffer.as_ptr() as u64;
    let aligned = mem::align_up(base_addr, alignment).ok_or(Status::OutOfResources)?;
    let load_offset = (aligned - base_addr) as usize;
    let image_size_usize = image_size as usize;
    if load_offset + image_size_usize > buffer.len() {
        return Err(Status::OutOfResources);
    }
    let dest_addr = buffer.as_ptr() as usize + load_offset;
    debug!("loading 0x{:x} bytes at 0x{:x}", image_size, dest_addr);

    // Writable while we populate it; permissions tighten afterwards.
    if let Err(status) = protection.update(
        dest_addr,
        alloc_size as usize,
        MemAttrs::READ | MemAttrs::WRITE,
        MemAttrs::EXEC,
    ) {
        debug!("pre-load permission update failed: {}", status);
    }

    let headers = mem::image_region(image, 0, context.size_of_headers as u64)
        .ok_or(Status::Unsupported)?;
    buffer[load_offset..load_offset + headers.len()].copy_from_slice(headers);

    protection.flush_icache(dest_addr, image_size_usize);

    let entry_offset =
        mem_offset_in_image(context.entry_point as u64, image_size).ok_or_else(|| {
            warn!("entry point is invalid");
            Status::Unsupported
        })?;

    // Virtual placement the relocation directory claims; compared against
    // the .reloc section below.
    let reloc_dir_va = { context.reloc_dir.virtual_address } as u64;
    let reloc_dir_size = { context.reloc_dir.size } as u64;
    let reloc_dir_base = mem_offset_in_image(reloc_dir_va, image_size);
    let reloc_dir_last = reloc_dir_va
        .checked_add(reloc_dir_size)
        .and_then(|v| v.checked_sub(1))
        .and_then(|last| mem_offset_in_image(last, image_size));

    let sections = context.section_headers(image)?;
    let mut reloc_section: Option<ImageSectionHeader> = None;
    let mut found_entry_point = 0usize;

    for (index, section) in sections.iter().enumerate() {
        let virtual_address = { section.virtual_address } as u64;
        let virtual_size = { section.virtual_size } as u64;
        let raw_size = { section.size_of_raw_data } as u64;
        let raw_offset = { section.pointer_to_raw_data } as u64;

        // Zero-size discardable sections carry nothing.
        if section.is_discardable() && virtual_size == 0 {
            continue;
        }
        // Sections not marked readable are not mapped at all.
        if !section.is_readable() {
            continue;
        }

        if !section.is_discardable()
            && section.is_writable()
            && section.is_executable()
            && policy.contains(VerifyPolicy::REQUIRE_NX)
        {
            warn!("section {} is writable and executable", index);
            return Err(Status::Unsupported);
        }

        let base = mem_offset_in_image(virtual_address, image_size);
        let last = virtual_address
            .checked_add(virtual_size)
            .and_then(|v| v.checked_sub(1))
            .and_then(|last| mem_offset_in_image(last, image_size));

        if let (Some(base), Some(last)) = (base, last) {
            if last < base {
                warn!("section {} has negative size", index);
                return Err(Status::Unsupported);
            }
        }

        if virtual_address <= context.entry_point as u64 {
            if let Some(last) = virtual_address
                .checked_add(virtual_size)
                .and_then(|v| v.checked_sub(1))
            {
                if last > context.entry_point as u64 {
                    found_entry_point += 1;
                }
            }
        }

        // .reloc is often discardable, so it is recognized before the
        // discardable skip; it is trusted only when it coincides with the
        // relocation directory.
        if section.name_is(&pe::RELOC_SECTION_NAME) {
            if reloc_section.is_some() {
                warn!("image has multiple relocation sections");
                return Err(Status::Unsupported);
            }
            let coincides = raw_size != 0
                && virtual_size != 0
                && base.is_some()
                && last.is_some()
                && reloc_dir_base == base
                && reloc_dir_last.is_some()
                && reloc_dir_last <= last;
            if coincides {
                reloc_section = Some(*section);
            } else {
                warn!("relocation section is invalid");
                return Err(Status::Unsupported);
            }
        }

        if section.is_discardable() {
            continue;
        }

        let base = match base {
            Some(base) => base,
            None => {
                warn!("section {} has invalid base address", index);
                return Err(Status::Unsupported);
            }
        };
        let last = match last {
            Some(last) => last,
            None => {
                warn!("section {} has zero size", index);
                return Err(Status::Unsupported);
            }
        };

        if !section.is_uninitialized()
            && (virtual_address < context.size_of_headers as u64
                || raw_offset < context.size_of_headers as u64)
        {
            warn!("section {} is inside image headers", index);
            return Err(Status::Unsupported);
        }

        let dest = &mut buffer[load_offset + base..=load_offset + last];
        if section.is_uninitialized() {
            dest.fill(0);
        } else {
            let copy_size = virtual_size.min(raw_size) as usize;
            if copy_size > 0 {
                // Both extents re-validated: the file range through
                // image_region, the virtual range through base/last above.
                let src = mem::image_region(image, raw_offset, copy_size as u64)
                    .ok_or(Status::Unsupported)?;
                dest[..copy_size].copy_from_slice(src);
            }
            if copy_size < dest.len() {
                dest[copy_size..].fill(0);
            }
        }
    }

    if context.number_of_rva_and_sizes as usize
        <= pe::directory_entry::IMAGE_DIRECTORY_ENTRY_BASERELOC
    {
        warn!("image has no relocation entry");
        return Err(Status::Unsupported);
    }

    if reloc_dir_size != 0 {
        if let Some(reloc_section) = &reloc_section {
            let delta = (dest_addr as u64).wrapping_sub(context.image_base);
            let dest = &mut buffer[load_offset..load_offset + image_size_usize];
            apply_relocations(dest, image, reloc_dir_size, reloc_section, delta)?;
        }
    }

    // Final permissions: read-only unless declared otherwise.
    let mut protection_applied = true;
    for section in &sections {
        let virtual_address = { section.virtual_address } as u64;
        let virtual_size = { section.virtual_size } as u64;
        if section.is_discardable() && virtual_size == 0 {
            continue;
        }
        if !section.is_readable() {
            continue;
        }
        let base = match mem_offset_in_image(virtual_address, image_size) {
            Some(base) => base,
            None => continue,
        };
        let last = match virtual_address
            .checked_add(virtual_size)
            .and_then(|v| v.checked_sub(1))
            .and_then(|last| mem_offset_in_image(last, image_size))
        {
            Some(last) => last,
            None => continue,
        };

        let mut set = MemAttrs::READ;
        let mut clear = MemAttrs::WRITE | MemAttrs::EXEC;
        if section.is_writable() {
            set |= MemAttrs::WRITE;
            clear &= !MemAttrs::WRITE;
        }
        if section.is_executable() {
            set |= MemAttrs::EXEC;
            clear &= !MemAttrs::EXEC;
        }
        // Attribute calls work at page granularity; the length is padded,
        // the base is already section-aligned.
        let length = match mem::align_up((last - base + 1) as u64, pe::PAGE_SIZE) {
            Some(length) => length as usize,
            None => continue,
        };
        if let Err(status) = protection.update(dest_addr + base, length, set, clear) {
            debug!("section permission update failed: {}", status);
            protection_applied = false;
        }
    }

    if found_entry_point == 0 {
        warn!("entry point is not within sections");
        return Err(Status::Unsupported);
    }
    if found_entry_point > 1 {
        warn!("{} sections contain entry point", found_entry_point);
        return Err(Status::Unsupported);
    }

    Ok(LoadedImage {
        buffer,
        load_offset,
        image_size: image_size_usize,
        entry_offset,
        protection_applied,
    })
}

/// Offset of a virtual address within the loaded image, if it is inside.
fn mem_offset_in_image(address: u64, image_size: u64) -> Option<usize> {
    if address >= image_size {
        return None;
    }
    Some(address as usize)
}

/// Apply base-relocation fixups to `dest` for a load-address `delta`.
///
/// The relocation blocks are read from the original file buffer at the
/// `.reloc` section's raw data; fixups land in the loaded image at each
/// block's virtual address. A zero delta applies nothing.
pub fn apply_relocations(
    dest: &mut [u8],
    orig: &[u8],
    reloc_dir_size: u64,
    reloc_section: &ImageSectionHeader,
    delta: u64,
) -> Result<()> {
    let raw_offset = { reloc_section.pointer_to_raw_data } as u64;

    let base_ok = mem::image_address(orig, raw_offset).is_some();
    let last_ok = raw_offset
        .checked_add(reloc_dir_size)
        .and_then(|v| v.checked_sub(1))
        .and_then(|last| mem::image_address(orig, last))
        .is_some();
    match (base_ok, last_ok) {
        (false, false) => return Ok(()),
        (true, true) => {}
        _ => {
            warn!("reloc table overflows binary");
            return Err(Status::Unsupported);
        }
    }

    if delta == 0 {
        return Ok(());
    }

    let table_end = raw_offset + reloc_dir_size;
    let mut offset = raw_offset;
    let mut block_index = 0usize;

    while offset < table_end {
        let block = mem::read_struct::<ImageBaseRelocation>(orig, offset as usize)
            .ok_or(Status::Unsupported)?;
        let size_of_block = { block.size_of_block } as u64;

        if size_of_block == 0 {
            warn!("reloc {} block size 0 is invalid", block_index);
            return Err(Status::Unsupported);
        }
        if size_of_block > reloc_dir_size {
            warn!(
                "reloc {} block size 0x{:x} greater than reloc dir size 0x{:x}",
                block_index, size_of_block, reloc_dir_size
            );
            return Err(Status::Unsupported);
        }
        let block_end = offset.checked_add(size_of_block).ok_or(Status::Unsupported)?;
        if block_end > orig.len() as u64 {
            warn!("reloc {} entry overflows binary", block_index);
            return Err(Status::Unsupported);
        }
        let entry_bytes = size_of_block
            .checked_sub(pe::IMAGE_SIZEOF_BASE_RELOCATION as u64)
            .ok_or(Status::Unsupported)?;

        let fixup_base = { block.virtual_address } as u64;
        if fixup_base >= dest.len() as u64 {
            warn!("reloc {} invalid fixup base", block_index);
            return Err(Status::Unsupported);
        }

        let mut entry_offset = offset + pe::IMAGE_SIZEOF_BASE_RELOCATION as u64;
        for _ in 0..entry_bytes / 2 {
            let entry =
                mem::read_u16(orig, entry_offset as usize).ok_or(Status::Unsupported)?;
            let target = fixup_base + pe::reloc_offset(entry) as u64;

            match pe::reloc_type(entry) {
                relocation_type::IMAGE_REL_BASED_ABSOLUTE => {}
                relocation_type::IMAGE_REL_BASED_HIGH => {
                    let value = read_fixup_u16(dest, target)?;
                    let adjust = ((delta as u32) >> 16) as u16;
                    write_fixup_u16(dest, target, value.wrapping_add(adjust))?;
                }
                relocation_type::IMAGE_REL_BASED_LOW => {
                    let value = read_fixup_u16(dest, target)?;
                    write_fixup_u16(dest, target, value.wrapping_add(delta as u16))?;
                }
                relocation_type::IMAGE_REL_BASED_HIGHLOW => {
                    let value = read_fixup_u32(dest, target)?;
                    write_fixup_u32(dest, target, value.wrapping_add(delta as u32))?;
                }
                relocation_type::IMAGE_REL_BASED_DIR64 => {
                    let value = read_fixup_u64(dest, target)?;
                    write_fixup_u64(dest, target, value.wrapping_add(delta))?;
                }
                unknown => {
                    warn!("reloc {} unknown relocation type {}", block_index, unknown);
                    return Err(Status::Unsupported);
                }
            }
            entry_offset += 2;
        }
        offset = block_end;
        block_index += 1;
    }

    Ok(())
}

fn fixup_range(dest: &[u8], target: u64, width: usize) -> Result<core::ops::Range<usize>> {
    let end = target.checked_add(width as u64).ok_or(Status::Unsupported)?;
    if end > dest.len() as u64 {
        warn!("fixup at 0x{:x} overflows image", target);
        return Err(Status::Unsupported);
    }
    Ok(target as usize..end as usize)
}

fn read_fixup_u16(dest: &[u8], target: u64) -> Result<u16> {
    let range = fixup_range(dest, target, 2)?;
    Ok(u16::from_le_bytes([dest[range.start], dest[range.start + 1]]))
}

fn write_fixup_u16(dest: &mut [u8], target: u64, value: u16) -> Result<()> {
    let range = fixup_range(dest, target, 2)?;
    dest[range].copy_from_slice(&value.to_le_bytes());
    Ok(())
}

fn read_fixup_u32(dest: &[u8], target: u64) -> Result<u32> {
    let range = fixup_range(dest, target, 4)?;
    let mut bytes = [0u8; 4];
    bytes.copy_from_slice(&dest[range]);
    Ok(u32::from_le_bytes(bytes))
}

fn write_fixup_u32(dest: &mut [u8], target: u64, value: u32) -> Result<()> {
    let range = fixup_range(dest, target, 4)?;
    dest[range].copy_from_slice(&value.to_le_bytes());
    Ok(())
}

fn read_fixup_u64(dest: &[u8], target: u64) -> Result<u64> {
    let range = fixup_range(dest, target, 8)?;
    let mut bytes = [0u8; 8];
    bytes.copy_from_slice(&dest[range]);
    Ok(u64::from_le_bytes(bytes))
}

fn write_fixup_u64(dest: &mut [u8], target: u64, value: u64) -> Result<()> {
    let range = fixup_range(dest, target, 8)?;
    dest[range].copy_from_slice(&value.to_le_bytes());
    Ok(())
}
