//! Shared fixtures: an in-memory variable store, stub crypto, and a
//! recording page-protection service.

// Each test binary uses a different slice of these fixtures.
#![allow(dead_code)]

pub mod builder;

use std::cell::RefCell;
use std::collections::HashMap;

use bootgate::loader::{MemAttrs, MemoryProtection};
use bootgate::status::Result;
use bootgate::trust::{AuthenticodeVerifier, Guid, VariableStore};

/// Variable store over a hash map.
#[derive(Default)]
pub struct MapStore {
    vars: HashMap<(String, [u8; 16]), Vec<u8>>,
}

impl MapStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&mut self, name: &str, owner: &Guid, data: &[u8]) {
        self.vars
            .insert((name.to_string(), owner.to_bytes_le()), data.to_vec());
    }

    /// Flip secure boot on.
    pub fn enable_secure_boot(&mut self) {
        self.set(
            bootgate::trust::store_names::SECURE_BOOT,
            &bootgate::trust::EFI_GLOBAL_VARIABLE_GUID,
            &[1],
        );
    }
}

impl VariableStore for MapStore {
    fn get(&self, name: &str, owner: &Guid) -> Option<Vec<u8>> {
        self.vars
            .get(&(name.to_string(), owner.to_bytes_le()))
            .cloned()
    }
}

/// Stand-in for the Authenticode primitive: a signature blob verifies iff
/// it is byte-identical to the candidate certificate.
pub struct MatchVerifier;

impl AuthenticodeVerifier for MatchVerifier {
    fn verify(&self, pkcs7: &[u8], certificate: &[u8], _digest: &[u8; 32]) -> bool {
        pkcs7 == certificate
    }
}

/// Records every permission request instead of applying one.
#[derive(Default)]
pub struct RecordingProtection {
    pub calls: RefCell<Vec<(usize, usize, MemAttrs, MemAttrs)>>,
}

impl RecordingProtection {
    pub fn new() -> Self {
        Self::default()
    }
}

impl MemoryProtection for RecordingProtection {
    fn update(&self, addr: usize, size: usize, set: MemAttrs, clear: MemAttrs) -> Result<()> {
        self.calls.borrow_mut().push((addr, size, set, clear));
        Ok(())
    }
}

/// A structurally plausible DER certificate: SEQUENCE tag, two length
/// bytes, payload.
pub fn fake_cert(payload: &[u8]) -> Vec<u8> {
    let mut cert = vec![0x30, 0x82];
    cert.extend_from_slice(&(payload.len() as u16).to_be_bytes());
    cert.extend_from_slice(payload);
    cert
}

/// Serialize one EFI_SIGNATURE_LIST holding `payloads` of equal size.
pub fn signature_list(signature_type: &Guid, owner: &Guid, payloads: &[&[u8]]) -> Vec<u8> {
    let signature_size = 16 + payloads.first().map(|p| p.len()).unwrap_or(0);
    let list_size = 28 + signature_size * payloads.len();
    let mut blob = Vec::with_capacity(list_size);
    blob.extend_from_slice(&signature_type.to_bytes_le());
    blob.extend_from_slice(&(list_size as u32).to_le_bytes());
    blob.extend_from_slice(&0u32.to_le_bytes());
    blob.extend_from_slice(&(signature_size as u32).to_le_bytes());
    for payload in payloads {
        blob.extend_from_slice(&owner.to_bytes_le());
        blob.extend_from_slice(payload);
    }
    blob
}
