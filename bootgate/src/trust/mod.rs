//! Trust stores and the GUID-typed signature-list format.
//!
//! A store is a named collection of hash digests and X.509 certificates in
//! the EFI_SIGNATURE_LIST wire format, backed either by a persisted
//! platform variable (firmware/administrator/OS owned) or by a blob
//! compiled into the gate. Both backings answer the same two questions —
//! "is this digest listed?" and "does any listed certificate verify this
//! signature?" — through the [`TrustStore`] trait, so the orchestrator
//! iterates stores in one fixed order without caring where each lives.

use alloc::vec::Vec;
use log::{debug, warn};

// ============================================================================
// GUIDs
// ============================================================================

/// A 128-bit GUID in the platform's mixed-endian variable format.
#[derive(Clone, Copy, PartialEq, Eq)]
#[repr(C)]
pub struct Guid {
    /// First 32 bits
    pub data1: u32,
    /// Next 16 bits
    pub data2: u16,
    /// Next 16 bits
    pub data3: u16,
    /// Final 64 bits
    pub data4: [u8; 8],
}

impl Guid {
    /// Create a GUID from components
    pub const fn new(data1: u32, data2: u16, data3: u16, data4: [u8; 8]) -> Self {
        Self { data1, data2, data3, data4 }
    }

    /// Create a GUID from its 16-byte on-disk (little-endian) form
    pub fn from_bytes_le(bytes: [u8; 16]) -> Self {
        Self {
            data1: u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]),
            data2: u16::from_le_bytes([bytes[4], bytes[5]]),
            data3: u16::from_le_bytes([bytes[6], bytes[7]]),
            data4: [
                bytes[8], bytes[9], bytes[10], bytes[11], bytes[12], bytes[13], bytes[14],
                bytes[15],
            ],
        }
    }

    /// Convert to the 16-byte on-disk (little-endian) form
    pub fn to_bytes_le(&self) -> [u8; 16] {
        let mut bytes = [0u8; 16];
        bytes[0..4].copy_from_slice(&self.data1.to_le_bytes());
        bytes[4..6].copy_from_slice(&self.data2.to_le_bytes());
        bytes[6..8].copy_from_slice(&self.data3.to_le_bytes());
        bytes[8..16].copy_from_slice(&self.data4);
        bytes
    }
}

impl core::fmt::Debug for Guid {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(
            f,
            "{:08x}-{:04x}-{:04x}-{:02x}{:02x}-{:02x}{:02x}{:02x}{:02x}{:02x}{:02x}",
            self.data1,
            self.data2,
            self.data3,
            self.data4[0],
            self.data4[1],
            self.data4[2],
            self.data4[3],
            self.data4[4],
            self.data4[5],
            self.data4[6],
            self.data4[7]
        )
    }
}

/// EFI_GLOBAL_VARIABLE — owner of `SecureBoot`/`SetupMode`
pub const EFI_GLOBAL_VARIABLE_GUID: Guid = Guid::new(
    0x8be4df61,
    0x93ca,
    0x11d2,
    [0xaa, 0x0d, 0x00, 0xe0, 0x98, 0x03, 0x2b, 0x8c],
);

/// EFI_IMAGE_SECURITY_DATABASE — owner of `db`/`dbx`
pub const EFI_IMAGE_SECURITY_DATABASE_GUID: Guid = Guid::new(
    0xd719b2cb,
    0x3d3a,
    0x4596,
    [0xa3, 0xbc, 0xda, 0xd0, 0x0e, 0x67, 0x65, 0x6f],
);

/// Owner of the machine-owner-key variables (`MokListRT`, `MokListX`,
/// policy toggles, the revocation list)
pub const MOK_VARIABLE_GUID: Guid = Guid::new(
    0x605dab50,
    0xe046,
    0x4300,
    [0xab, 0xb6, 0x3d, 0xd8, 0x10, 0xdd, 0x8b, 0x23],
);

/// EFI_CERT_SHA256 signature type
pub const EFI_CERT_SHA256_GUID: Guid = Guid::new(
    0xc1c41626,
    0x504c,
    0x4092,
    [0xac, 0xa9, 0x41, 0xf9, 0x36, 0x93, 0x43, 0x28],
);

/// EFI_CERT_SHA1 signature type
pub const EFI_CERT_SHA1_GUID: Guid = Guid::new(
    0x826ca512,
    0xcf10,
    0x4ac9,
    [0xb1, 0x87, 0xbe, 0x01, 0x49, 0x66, 0x31, 0xbd],
);

/// EFI_CERT_X509 signature type
pub const EFI_CERT_X509_GUID: Guid = Guid::new(
    0xa5c059a1,
    0x94e4,
    0x4aa7,
    [0x87, 0xb5, 0xab, 0x15, 0x5c, 0x2b, 0xf0, 0x72],
);

// ============================================================================
// Signature Lists
// ============================================================================

/// Size of the EFI_SIGNATURE_LIST header
const SIGNATURE_LIST_HEADER_SIZE: usize = 28;

/// Size of the owner GUID prefixing each EFI_SIGNATURE_DATA entry
const SIGNATURE_OWNER_SIZE: usize = 16;

/// One EFI_SIGNATURE_DATA entry, borrowed from its containing list.
#[derive(Debug, Clone, Copy)]
pub struct SignatureEntry<'a> {
    /// Type GUID of the containing list
    pub signature_type: Guid,
    /// Entry owner
    pub owner: Guid,
    /// Entry payload (digest bytes or DER certificate)
    pub data: &'a [u8],
}

/// Walk every entry of every EFI_SIGNATURE_LIST in `blob`.
///
/// A malformed list terminates the walk; whatever was parsed before it is
/// still returned. Stores are read-only here, so the worst a corrupt blob
/// can do is hide its own entries.
pub fn parse_signature_lists(blob: &[u8]) -> Vec<SignatureEntry<'_>> {
    let mut entries = Vec::new();
    let mut offset = 0usize;

    while blob.len() - offset >= SIGNATURE_LIST_HEADER_SIZE {
        let header = &blob[offset..offset + SIGNATURE_LIST_HEADER_SIZE];
        let mut type_bytes = [0u8; 16];
        type_bytes.copy_from_slice(&header[0..16]);
        let signature_type = Guid::from_bytes_le(type_bytes);
        let list_size = u32::from_le_bytes([header[16], header[17], header[18], header[19]]) as usize;
        let header_size = u32::from_le_bytes([header[20], header[21], header[22], header[23]]) as usize;
        let signature_size = u32::from_le_bytes([header[24], header[25], header[26], header[27]]) as usize;

        if list_size < SIGNATURE_LIST_HEADER_SIZE || list_size > blob.len() - offset {
            warn!("malformed signature list at offset {}", offset);
            break;
        }
        let body = match list_size
            .checked_sub(SIGNATURE_LIST_HEADER_SIZE)
            .and_then(|v| v.checked_sub(header_size))
        {
            Some(body) => body,
            None => {
                warn!("signature list header size overflows list at offset {}", offset);
                break;
            }
        };
        if signature_size < SIGNATURE_OWNER_SIZE || signature_size > body {
            // An empty list is legal; anything else here is malformed.
            if body != 0 {
                warn!("signature size {} invalid at offset {}", signature_size, offset);
                break;
            }
            offset += list_size;
            continue;
        }

        let count = body / signature_size;
        let mut entry_offset = offset + SIGNATURE_LIST_HEADER_SIZE + header_size;
        for _ in 0..count {
            let entry = &blob[entry_offset..entry_offset + signature_size];
            let mut owner_bytes = [0u8; 16];
            owner_bytes.copy_from_slice(&entry[0..SIGNATURE_OWNER_SIZE]);
            entries.push(SignatureEntry {
                signature_type,
                owner: Guid::from_bytes_le(owner_bytes),
                data: &entry[SIGNATURE_OWNER_SIZE..],
            });
            entry_offset += signature_size;
        }
        offset += list_size;
    }

    entries
}

// ============================================================================
// Collaborator traits
// ============================================================================

/// Read access to named persisted variables. The storage itself lives
/// outside the gate; unreadable and absent variables look the same here.
pub trait VariableStore {
    /// Fetch the contents of `name` under `owner`, if present.
    fn get(&self, name: &str, owner: &Guid) -> Option<Vec<u8>>;
}

/// The external Authenticode primitive.
///
/// Verifies a PKCS#7 SignedData blob over a precomputed digest against one
/// candidate certificate. Chain building, if any, is the primitive's
/// business; the gate only hands it candidates from its stores.
pub trait AuthenticodeVerifier {
    /// Does `pkcs7` constitute a valid signature of `digest` under
    /// `certificate`?
    fn verify(&self, pkcs7: &[u8], certificate: &[u8], digest: &[u8; 32]) -> bool;

    /// Drop whatever has accumulated in the library's error queue, so one
    /// attempt's failures are never blamed on the next.
    fn drain_errors(&self) {}
}

// ============================================================================
// Hash and certificate lookup
// ============================================================================

/// Digest algorithms a store can hold.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HashAlgorithm {
    Sha256,
    Sha1,
}

impl HashAlgorithm {
    /// Signature-type GUID for entries of this algorithm
    pub fn signature_type(&self) -> Guid {
        match self {
            HashAlgorithm::Sha256 => EFI_CERT_SHA256_GUID,
            HashAlgorithm::Sha1 => EFI_CERT_SHA1_GUID,
        }
    }

    /// Digest size in bytes
    pub fn digest_size(&self) -> usize {
        match self {
            HashAlgorithm::Sha256 => 32,
            HashAlgorithm::Sha1 => 20,
        }
    }
}

/// Store lookup outcome. `StoreAbsent` is not an error: the search chain
/// simply continues with the next store.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Lookup {
    Found,
    NotFound,
    StoreAbsent,
}

/// Uniform lookup over one named signature store.
pub trait TrustStore {
    /// Store name, for logs and measurement records
    fn name(&self) -> &str;

    /// Owner GUID the store's records are measured under
    fn owner(&self) -> Guid;

    /// Exact byte-compare of `digest` against the store's hash entries.
    fn lookup_hash(&self, algorithm: HashAlgorithm, digest: &[u8]) -> Lookup;

    /// Try every X.509 entry in the store as the trust anchor for the
    /// attached `pkcs7` signature over `sha256`.
    fn lookup_cert(
        &self,
        verifier: &dyn AuthenticodeVerifier,
        pkcs7: &[u8],
        sha256: &[u8; 32],
    ) -> Lookup;
}

fn blob_has_hash(blob: &[u8], name: &str, algorithm: HashAlgorithm, digest: &[u8]) -> bool {
    if digest.len() != algorithm.digest_size() {
        return false;
    }
    let wanted = algorithm.signature_type();
    for entry in parse_signature_lists(blob) {
        if entry.signature_type == wanted && entry.data == digest {
            debug!("digest found in {}", name);
            return true;
        }
    }
    false
}

fn blob_cert_verifies(
    blob: &[u8],
    name: &str,
    verifier: &dyn AuthenticodeVerifier,
    pkcs7: &[u8],
    sha256: &[u8; 32],
) -> bool {
    for (index, entry) in parse_signature_lists(blob)
        .iter()
        .filter(|entry| entry.signature_type == EFI_CERT_X509_GUID)
        .enumerate()
    {
        debug!("trying to verify cert {} ({})", index, name);
        if !verify_x509(entry.data) {
            debug!("entry {} in {} is not a DER encoded x.509 certificate", index, name);
            continue;
        }
        if cert_excludes_boot_signing(entry.data) {
            debug!("cert {} in {} excludes the boot-signing purpose", index, name);
            continue;
        }
        verifier.drain_errors();
        if verifier.verify(pkcs7, entry.data, sha256) {
            debug!("signature verified against cert {} in {}", index, name);
            verifier.drain_errors();
            return true;
        }
    }
    false
}

/// A store backed by a persisted platform variable.
pub struct VariableBackedStore<'a> {
    name: &'static str,
    owner: Guid,
    variables: &'a dyn VariableStore,
}

impl<'a> VariableBackedStore<'a> {
    pub fn new(name: &'static str, owner: Guid, variables: &'a dyn VariableStore) -> Self {
        Self { name, owner, variables }
    }
}

impl TrustStore for VariableBackedStore<'_> {
    fn name(&self) -> &str {
        self.name
    }

    fn owner(&self) -> Guid {
        self.owner
    }

    fn lookup_hash(&self, algorithm: HashAlgorithm, digest: &[u8]) -> Lookup {
        match self.variables.get(self.name, &self.owner) {
            None => Lookup::StoreAbsent,
            Some(blob) => {
                if blob_has_hash(&blob, self.name, algorithm, digest) {
                    Lookup::Found
                } else {
                    Lookup::NotFound
                }
            }
        }
    }

    fn lookup_cert(
        &self,
        verifier: &dyn AuthenticodeVerifier,
        pkcs7: &[u8],
        sha256: &[u8; 32],
    ) -> Lookup {
        match self.variables.get(self.name, &self.owner) {
            None => Lookup::StoreAbsent,
            Some(blob) => {
                if blob_cert_verifies(&blob, self.name, verifier, pkcs7, sha256) {
                    Lookup::Found
                } else {
                    Lookup::NotFound
                }
            }
        }
    }
}

/// A store compiled into the gate. `None` models a build without that
/// blob, which behaves exactly like an absent variable.
pub struct BuiltinStore<'a> {
    name: &'static str,
    owner: Guid,
    blob: Option<&'a [u8]>,
}

impl<'a> BuiltinStore<'a> {
    pub fn new(name: &'static str, owner: Guid, blob: Option<&'a [u8]>) -> Self {
        Self { name, owner, blob }
    }
}

impl TrustStore for BuiltinStore<'_> {
    fn name(&self) -> &str {
        self.name
    }

    fn owner(&self) -> Guid {
        self.owner
    }

    fn lookup_hash(&self, algorithm: HashAlgorithm, digest: &[u8]) -> Lookup {
        match self.blob {
            None => Lookup::StoreAbsent,
            Some(blob) => {
                if blob_has_hash(blob, self.name, algorithm, digest) {
                    Lookup::Found
                } else {
                    Lookup::NotFound
                }
            }
        }
    }

    fn lookup_cert(
        &self,
        verifier: &dyn AuthenticodeVerifier,
        pkcs7: &[u8],
        sha256: &[u8; 32],
    ) -> Lookup {
        match self.blob {
            None => Lookup::StoreAbsent,
            Some(blob) => {
                if blob_cert_verifies(blob, self.name, verifier, pkcs7, sha256) {
                    Lookup::Found
                } else {
                    Lookup::NotFound
                }
            }
        }
    }
}

// ============================================================================
// Certificate sanity
// ============================================================================

/// Structural sanity check on a DER certificate: SEQUENCE tag, long-form
/// two-byte length, and the length closing the buffer exactly. Certificates
/// below 128 bytes or above 64K do not occur in practice.
pub fn verify_x509(cert: &[u8]) -> bool {
    if cert.len() < 4 {
        return false;
    }
    if cert[0] != 0x30 || cert[1] != 0x82 {
        debug!(
            "cert[0:1] is [{:02x}{:02x}], should be [3082]",
            cert[0], cert[1]
        );
        return false;
    }
    let length = ((cert[2] as usize) << 8) | cert[3] as usize;
    if length != cert.len() - 4 {
        debug!("cert length is {}, expecting {}", length, cert.len() - 4);
        return false;
    }
    true
}

/// DER encoding of the extended-key-usage OID that marks a certificate as
/// module-signing only, which excludes it from authorizing boot loaders.
const EXCLUDED_EKU_OID: [u8; 12] = [
    0x06, 0x0a, 0x2b, 0x06, 0x01, 0x04, 0x01, 0x92, 0x08, 0x10, 0x01, 0x02,
];

/// Does this certificate carry the excluded extended-key-usage purpose?
///
/// A full X.509 parse is the crypto primitive's business; scanning for the
/// encoded OID can only ever exclude a candidate, never admit one.
pub fn cert_excludes_boot_signing(cert: &[u8]) -> bool {
    cert.windows(EXCLUDED_EKU_OID.len())
        .any(|window| window == EXCLUDED_EKU_OID)
}

impl Lookup {
    /// True only for a positive match.
    pub fn found(&self) -> bool {
        *self == Lookup::Found
    }
}

/// Variable names of the persisted stores the gate consults.
pub mod store_names {
    /// Firmware allow list
    pub const DB: &str = "db";
    /// Firmware deny list
    pub const DBX: &str = "dbx";
    /// Machine-owner allow list (runtime mirror)
    pub const MOK_LIST: &str = "MokListRT";
    /// Machine-owner deny list
    pub const MOK_LIST_X: &str = "MokListX";
    /// Anti-rollback revocation list
    pub const SBAT_LEVEL: &str = "SBAT";
    /// Secure-boot enable flag
    pub const SECURE_BOOT: &str = "SecureBoot";
    /// Setup-mode flag
    pub const SETUP_MODE: &str = "SetupMode";
    /// Machine-owner secure-boot override
    pub const MOK_SB_STATE: &str = "MokSBState";
    /// Machine-owner db-ignore toggle
    pub const MOK_IGNORE_DB: &str = "MokIgnoreDB";
    /// Machine-owner policy bits
    pub const MOK_POLICY: &str = "MokPolicy";
}
