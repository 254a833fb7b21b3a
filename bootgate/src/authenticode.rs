//! Authenticode digest computation.
//!
//! Calculates the SHA-256 and SHA-1 hashes of a PE binary over the
//! partition Authenticode prescribes: everything except the optional-header
//! checksum field, the security data-directory entry, and the certificate
//! table itself. Appending or replacing a signature therefore never changes
//! the digest.
//!
//! Sections are hashed in ascending file-offset order over a freshly
//! built, sorted copy of the section table, so a maliciously reordered
//! on-disk table cannot desynchronize what gets hashed from what gets
//! mapped.

use alloc::vec::Vec;
use log::{debug, warn};
use sha1::Sha1;
use sha2::{Digest, Sha256};

use crate::mem;
use crate::pe::{ImageDosHeader, ImageFileHeader, ImageSectionHeader, IMAGE_SIZEOF_SECTION_HEADER};
use crate::pe::parser::ImageContext;
use crate::status::{Result, Status};

/// SHA-256 digest size in bytes
pub const SHA256_DIGEST_SIZE: usize = 32;

/// SHA-1 digest size in bytes
pub const SHA1_DIGEST_SIZE: usize = 20;

/// Both Authenticode digests of one image.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ImageDigest {
    pub sha256: [u8; SHA256_DIGEST_SIZE],
    pub sha1: [u8; SHA1_DIGEST_SIZE],
}

/// Calculate the SHA-256 and SHA-1 Authenticode hashes of a binary.
pub fn generate_hash(image: &[u8], context: &ImageContext) -> Result<ImageDigest> {
    let datasize = image.len() as u64;
    let mut sha256 = Sha256::new();
    let mut sha1 = Sha1::new();

    let mut hash = |offset: u64, size: u64| -> Result<()> {
        let region = mem::image_region(image, offset, size).ok_or_else(|| {
            warn!("hash region 0x{:x}+0x{:x} outside image", offset, size);
            Status::InvalidParameter
        })?;
        sha256.update(region);
        sha1.update(region);
        Ok(())
    };

    // Start of file up to the checksum field
    hash(0, context.checksum_offset)?;

    // Post-checksum up to the security directory entry
    let post_checksum = context.checksum_offset + 4;
    let size = context
        .sec_dir_entry_offset
        .checked_sub(post_checksum)
        .ok_or(Status::InvalidParameter)?;
    hash(post_checksum, size)?;

    // Past the security directory entry up to the end of the headers
    let post_sec_entry = context.sec_dir_entry_offset + 8;
    let size = (context.size_of_headers as u64)
        .checked_sub(post_sec_entry)
        .ok_or(Status::InvalidParameter)?;
    hash(post_sec_entry, size)?;

    let mut sum_of_bytes_hashed = context.size_of_headers as u64;

    // Fresh sorted copy of the section table; the on-disk order is
    // attacker-controlled.
    let sections = sorted_section_table(image, context, sum_of_bytes_hashed)?;

    for (index, section) in sections.iter().enumerate() {
        let raw_size = { section.size_of_raw_data } as u64;
        if raw_size == 0 {
            continue;
        }
        let raw_offset = { section.pointer_to_raw_data } as u64;
        if mem::image_address(image, raw_offset).is_none() {
            warn!("malformed section header {}", index);
            return Err(Status::InvalidParameter);
        }
        if raw_size > datasize - raw_offset {
            warn!("malformed section {} raw size", index);
            return Err(Status::InvalidParameter);
        }
        hash(raw_offset, raw_size)?;
        sum_of_bytes_hashed += raw_size;
    }

    // Whatever sits between the section data and the certificate table is
    // hashed too, but only if the certificate table is the final thing in
    // the file.
    let sec_size = { context.sec_dir.size } as u64;
    let sec_va = { context.sec_dir.virtual_address } as u64;
    if datasize > sum_of_bytes_hashed && sec_size != 0 {
        let remaining = datasize - sum_of_bytes_hashed;
        if remaining < sec_size {
            warn!("malformed binary after attribute certificate table");
            return Err(Status::InvalidParameter);
        }
        let trailer = remaining - sec_size;
        if sum_of_bytes_hashed + trailer != sec_va {
            warn!(
                "certificate table at 0x{:x} does not close the file (expected 0x{:x})",
                sec_va,
                sum_of_bytes_hashed + trailer
            );
            return Err(Status::InvalidParameter);
        }
        hash(sum_of_bytes_hashed, trailer)?;
    }

    let digest = ImageDigest {
        sha256: sha256.finalize().into(),
        sha1: sha1.finalize().into(),
    };
    debug!("sha256 authenticode hash: {}", hex::encode(digest.sha256));
    debug!("sha1 authenticode hash: {}", hex::encode(digest.sha1));
    Ok(digest)
}

/// Build the sorted section table, re-deriving it from the raw headers if
/// the context does not carry one (a direct re-hash request).
fn sorted_section_table(
    image: &[u8],
    context: &ImageContext,
    size_of_headers: u64,
) -> Result<Vec<ImageSectionHeader>> {
    let datasize = image.len() as u64;
    let (first_section_offset, count) =
        if context.number_of_sections == 0 || context.first_section_offset == 0 {
            rederive_section_table(image)?
        } else {
            (context.first_section_offset, context.number_of_sections)
        };

    let mut sections = Vec::with_capacity(count as usize);
    let mut sum_of_section_bytes = 0u64;
    for index in 0..count {
        let offset = first_section_offset
            .checked_add(index as u64 * IMAGE_SIZEOF_SECTION_HEADER as u64)
            .ok_or(Status::InvalidParameter)?;
        let section = mem::read_struct::<ImageSectionHeader>(image, offset as usize)
            .ok_or(Status::InvalidParameter)?;

        section_virtual_sanity(&section, context, index)?;

        // The raw sizes must collectively fit what is left of the file.
        let budget = datasize
            .checked_sub(size_of_headers)
            .and_then(|v| v.checked_sub(sum_of_section_bytes))
            .ok_or(Status::InvalidParameter)?;
        let raw_size = { section.size_of_raw_data } as u64;
        if raw_size > budget {
            warn!("malformed section {} size", index);
            return Err(Status::InvalidParameter);
        }
        sum_of_section_bytes += raw_size;
        sections.push(section);
    }

    sections.sort_by_key(|section| {
        let offset = { section.pointer_to_raw_data };
        offset
    });
    Ok(sections)
}

/// Placement checks shared with the loader: a section's virtual extent has
/// to fit the declared image, and initialized data cannot claim to live
/// inside the headers.
fn section_virtual_sanity(
    section: &ImageSectionHeader,
    context: &ImageContext,
    index: u16,
) -> Result<()> {
    let va = { section.virtual_address } as u64;
    let virtual_size = { section.virtual_size } as u64;
    if !section.is_discardable() {
        if va >= context.image_size {
            warn!("section {} has invalid base address", index);
            return Err(Status::InvalidParameter);
        }
        let last = va
            .checked_add(virtual_size)
            .and_then(|v| v.checked_sub(1))
            .ok_or(Status::InvalidParameter)?;
        if last >= context.image_size || last < va {
            warn!("section {} has invalid size", index);
            return Err(Status::InvalidParameter);
        }
    }
    if !section.is_uninitialized() {
        let raw_offset = { section.pointer_to_raw_data } as u64;
        if va < context.size_of_headers as u64 || raw_offset < context.size_of_headers as u64 {
            warn!("section {} is inside image headers", index);
            return Err(Status::InvalidParameter);
        }
    }
    Ok(())
}

fn rederive_section_table(image: &[u8]) -> Result<(u64, u16)> {
    let dos = mem::read_struct::<ImageDosHeader>(image, 0).ok_or(Status::InvalidParameter)?;
    if !dos.is_valid() {
        warn!("invalid signature");
        return Err(Status::InvalidParameter);
    }
    let pe_offset = dos.e_lfanew as u64;
    let file_header = mem::read_struct::<ImageFileHeader>(image, (pe_offset + 4) as usize)
        .ok_or(Status::InvalidParameter)?;
    let count = file_header.number_of_sections;
    let opt_size = { file_header.size_of_optional_header } as u64;

    let first = pe_offset
        .checked_add(4)
        .and_then(|v| v.checked_add(core::mem::size_of::<ImageFileHeader>() as u64))
        .and_then(|v| v.checked_add(opt_size))
        .ok_or(Status::InvalidParameter)?;
    if mem::image_address(image, first).is_none() {
        warn!("malformed file header: section table outside image");
        return Err(Status::InvalidParameter);
    }
    let last = first
        .checked_add((count as u64).saturating_sub(1) * IMAGE_SIZEOF_SECTION_HEADER as u64)
        .ok_or(Status::InvalidParameter)?;
    if mem::image_address(image, last).is_none() {
        warn!("malformed file header: section {} outside image", count.saturating_sub(1));
        return Err(Status::InvalidParameter);
    }
    Ok((first, count))
}
