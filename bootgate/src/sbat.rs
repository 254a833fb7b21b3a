//! SBAT anti-rollback metadata.
//!
//! `.sbat` is a newline-separated list of
//! `component,generation,vendor-name,vendor-package,vendor-version,vendor-url`
//! records carried by the image. The platform keeps a revocation list of
//! minimum generations per component; any component whose generation falls
//! below its minimum is refused, independent of signature validity. This
//! lets a whole class of vulnerable loaders be revoked without rotating
//! keys.

use alloc::string::String;
use alloc::vec::Vec;
use log::{debug, warn};

use crate::status::{Result, Status};

/// One record from an image's `.sbat` section, borrowed from the section
/// data.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SbatEntry<'a> {
    pub component_name: &'a str,
    pub component_generation: &'a str,
    pub vendor_name: &'a str,
    pub vendor_package_name: &'a str,
    pub vendor_version: &'a str,
    pub vendor_url: &'a str,
}

/// One record from the platform revocation list: the minimum acceptable
/// generation for a component.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SbatRevocation {
    pub component_name: String,
    pub component_generation: u16,
}

/// Generation strings convert the way `atoi` does: leading digits, zero on
/// no digits. A record with garbage in its generation field is therefore
/// treated as generation zero, which can only ever make revocation
/// stricter.
pub fn parse_generation(text: &str) -> u16 {
    let mut value: u16 = 0;
    for c in text.bytes() {
        if !c.is_ascii_digit() {
            break;
        }
        value = value.saturating_mul(10).saturating_add((c - b'0') as u16);
    }
    value
}

fn trim_padding(data: &[u8]) -> &[u8] {
    let end = data
        .iter()
        .rposition(|&b| b != 0)
        .map(|p| p + 1)
        .unwrap_or(0);
    &data[..end]
}

/// Parse the raw bytes of a `.sbat` section.
///
/// The section is zero-padded to its on-disk size; padding is stripped
/// before parsing. Every line must carry at least six comma-separated
/// fields; extra fields are ignored. A final newline is optional.
pub fn parse_sbat_section(data: &[u8]) -> Result<Vec<SbatEntry<'_>>> {
    let data = trim_padding(data);
    if data.is_empty() {
        return Err(Status::InvalidParameter);
    }
    let text = core::str::from_utf8(data).map_err(|_| {
        warn!("sbat section is not valid UTF-8");
        Status::InvalidParameter
    })?;

    let mut entries = Vec::new();
    for line in text.split('\n') {
        let line = line.trim_end_matches('\r');
        if line.is_empty() {
            continue;
        }
        let mut fields = line.split(',');
        let entry = SbatEntry {
            component_name: fields.next().ok_or(Status::InvalidParameter)?,
            component_generation: fields.next().ok_or(Status::InvalidParameter)?,
            vendor_name: fields.next().ok_or(Status::InvalidParameter)?,
            vendor_package_name: fields.next().ok_or(Status::InvalidParameter)?,
            vendor_version: fields.next().ok_or(Status::InvalidParameter)?,
            vendor_url: fields.next().ok_or(Status::InvalidParameter)?,
        };
        if entry.component_name.is_empty() {
            return Err(Status::InvalidParameter);
        }
        entries.push(entry);
    }

    if entries.is_empty() {
        return Err(Status::InvalidParameter);
    }
    Ok(entries)
}

/// Parse the platform revocation list (the persisted `SBAT` variable).
///
/// Lines are `component,generation[,datestamp]`; a UTF-8 byte-order mark
/// and blank lines are tolerated, trailing fields are ignored.
pub fn parse_revocations(data: &[u8]) -> Result<Vec<SbatRevocation>> {
    let data = trim_padding(data);
    let data = match data {
        [0xEF, 0xBB, 0xBF, rest @ ..] => rest,
        _ => data,
    };
    let text = core::str::from_utf8(data).map_err(|_| {
        warn!("revocation list is not valid UTF-8");
        Status::InvalidParameter
    })?;

    let mut revocations = Vec::new();
    for line in text.split('\n') {
        let line = line.trim_end_matches('\r');
        if line.is_empty() {
            continue;
        }
        let mut fields = line.split(',');
        let name = fields.next().ok_or(Status::InvalidParameter)?;
        let generation = fields.next().ok_or(Status::InvalidParameter)?;
        if name.is_empty() {
            return Err(Status::InvalidParameter);
        }
        revocations.push(SbatRevocation {
            component_name: String::from(name),
            component_generation: parse_generation(generation),
        });
    }
    Ok(revocations)
}

fn verify_single_entry(entry: &SbatEntry<'_>, revocation: &SbatRevocation) -> Result<()> {
    if entry.component_name != revocation.component_name {
        return Ok(());
    }
    debug!(
        "component {} has a matching revocation entry, verifying",
        entry.component_name
    );
    let generation = parse_generation(entry.component_generation);
    if generation < revocation.component_generation {
        warn!(
            "component {}, generation {}, was revoked (minimum {})",
            entry.component_name, generation, revocation.component_generation
        );
        return Err(Status::SecurityViolation);
    }
    Ok(())
}

/// Check every image record against every revocation record.
///
/// An empty revocation list accepts everything; an image record whose
/// component has been revoked below its minimum generation rejects the
/// image even though its signature verified.
pub fn verify_sbat(entries: &[SbatEntry<'_>], revocations: &[SbatRevocation]) -> Result<()> {
    for entry in entries {
        for revocation in revocations {
            verify_single_entry(entry, revocation)?;
        }
    }
    debug!("all sbat entries verified");
    Ok(())
}
