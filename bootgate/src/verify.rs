//! Verification orchestration.
//!
//! Combines digest, attached signatures, trust stores, and anti-rollback
//! metadata into one accept/deny decision:
//!
//! 1. compute the Authenticode digests and measure the image;
//! 2. sweep the deny stores with the digests and with every attached
//!    certificate — a single match anywhere is final and cannot be
//!    overridden by any allow result;
//! 3. search the allow stores (skipped entirely when a parent in the load
//!    chain already established trust — inherited trust never skips the
//!    deny sweep or the rollback check);
//! 4. check `.sbat` generations against the platform revocation list.
//!
//! All state for one boot lives in an explicit [`VerifySession`]; the only
//! mutable piece is the write-once record of which mechanism first
//! authorized an image.

use alloc::vec::Vec;
use bitflags::bitflags;
use log::{debug, info, warn};
use spin::Once;

use crate::authenticode::{self, ImageDigest};
use crate::mem;
use crate::pe::{self, parser::{read_header, ImageContext, ParseFlags}, WinCertificateHeader};
use crate::sbat::{self, SbatRevocation};
use crate::status::{Result, Status};
use crate::tpm::MeasurementSink;
use crate::trust::{
    store_names, AuthenticodeVerifier, BuiltinStore, HashAlgorithm, TrustStore,
    VariableBackedStore, VariableStore, EFI_GLOBAL_VARIABLE_GUID,
    EFI_IMAGE_SECURITY_DATABASE_GUID, MOK_VARIABLE_GUID,
};

bitflags! {
    /// Administrative policy toggles, loadable from the machine-owner
    /// variables.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct VerifyPolicy: u32 {
        /// Refuse images without NX support and sections that are both
        /// writable and executable
        const REQUIRE_NX = 1 << 0;
        /// Skip the firmware `db` allow list
        const IGNORE_DB = 1 << 1;
    }
}

/// Which mechanism first authorized an image in this session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VerificationMethod {
    /// Digest matched an allow-list hash entry
    Hash,
    /// A store certificate verified the attached signature
    Cert,
}

/// Trust anchors compiled into the gate at build time.
#[derive(Default, Clone, Copy)]
pub struct BuiltinAnchors<'a> {
    /// Vendor allow list (EFI_SIGNATURE_LIST blob)
    pub vendor_authorized: Option<&'a [u8]>,
    /// Vendor deny list (EFI_SIGNATURE_LIST blob)
    pub vendor_deauthorized: Option<&'a [u8]>,
    /// Vendor certificate (DER)
    pub vendor_cert: Option<&'a [u8]>,
    /// Ephemeral build-time certificate (DER)
    pub build_cert: Option<&'a [u8]>,
}

/// Baseline revocation list compiled into the gate, used when the
/// platform variable is absent or unreadable.
const BASELINE_REVOCATIONS: &[u8] = b"sbat,1,2021030218\n";

/// Everything one verification pass needs, created once per boot.
pub struct VerifySession<'a> {
    /// Administrative policy
    pub policy: VerifyPolicy,
    /// Secure-boot enforcement; with this off, images are measured and
    /// accepted
    pub enforce: bool,
    variables: &'a dyn VariableStore,
    verifier: &'a dyn AuthenticodeVerifier,
    tpm: &'a dyn MeasurementSink,
    anchors: BuiltinAnchors<'a>,
    revocations: Vec<SbatRevocation>,
    method: Once<VerificationMethod>,
}

impl<'a> VerifySession<'a> {
    /// Build a session from platform state: enforcement from the
    /// secure-boot variables, policy and revocations from the
    /// machine-owner variables.
    pub fn new(
        variables: &'a dyn VariableStore,
        verifier: &'a dyn AuthenticodeVerifier,
        tpm: &'a dyn MeasurementSink,
        anchors: BuiltinAnchors<'a>,
    ) -> Self {
        let policy = load_policy(variables);
        let enforce = secure_mode(variables);
        let revocations = load_revocations(variables);
        Self {
            policy,
            enforce,
            variables,
            verifier,
            tpm,
            anchors,
            revocations,
            method: Once::new(),
        }
    }

    /// Replace the revocation list (tests, or hosts that source it
    /// elsewhere).
    pub fn set_revocations(&mut self, revocations: Vec<SbatRevocation>) {
        self.revocations = revocations;
    }

    /// The mechanism that first authorized an image, if any did yet.
    pub fn verification_method(&self) -> Option<VerificationMethod> {
        self.method.get().copied()
    }

    fn record_method(&self, method: VerificationMethod) {
        // First write wins; later images never overwrite it.
        self.method.call_once(|| method);
    }

    fn parse_flags(&self, in_protocol: bool) -> ParseFlags {
        ParseFlags {
            validate_security_dir: true,
            require_nx: self.policy.contains(VerifyPolicy::REQUIRE_NX),
            in_protocol,
        }
    }

    /// Check whether the digests or any attached certificate are present
    /// in a deny store. A match is final.
    fn check_denylist(&self, signatures: &[&[u8]], digest: &ImageDigest) -> Result<()> {
        let vendor_dbx = BuiltinStore::new(
            "vendor_dbx",
            EFI_IMAGE_SECURITY_DATABASE_GUID,
            self.anchors.vendor_deauthorized,
        );
        let dbx = VariableBackedStore::new(
            store_names::DBX,
            EFI_IMAGE_SECURITY_DATABASE_GUID,
            self.variables,
        );
        let mok_dbx =
            VariableBackedStore::new(store_names::MOK_LIST_X, MOK_VARIABLE_GUID, self.variables);
        let stores: [&dyn TrustStore; 3] = [&vendor_dbx, &dbx, &mok_dbx];

        for store in stores {
            self.verifier.drain_errors();
            if store.lookup_hash(HashAlgorithm::Sha256, &digest.sha256).found() {
                warn!("binary sha256hash found in {}", store.name());
                return Err(Status::SecurityViolation);
            }
            if store.lookup_hash(HashAlgorithm::Sha1, &digest.sha1).found() {
                warn!("binary sha1hash found in {}", store.name());
                return Err(Status::SecurityViolation);
            }
            for pkcs7 in signatures {
                if store
                    .lookup_cert(self.verifier, pkcs7, &digest.sha256)
                    .found()
                {
                    warn!("certificate found in {}", store.name());
                    return Err(Status::SecurityViolation);
                }
            }
            self.verifier.drain_errors();
        }
        Ok(())
    }

    /// Search the allow stores, hash first and then every attached
    /// signature, in the fixed store order. `NotFound` means no store had
    /// an opinion.
    fn check_allowlist(&self, signatures: &[&[u8]], digest: &ImageDigest) -> Result<()> {
        let db = VariableBackedStore::new(
            store_names::DB,
            EFI_IMAGE_SECURITY_DATABASE_GUID,
            self.variables,
        );
        let vendor_db = BuiltinStore::new(
            "vendor_db",
            EFI_IMAGE_SECURITY_DATABASE_GUID,
            self.anchors.vendor_authorized,
        );
        let mok =
            VariableBackedStore::new(store_names::MOK_LIST, MOK_VARIABLE_GUID, self.variables);

        let mut stores: Vec<&dyn TrustStore> = Vec::with_capacity(3);
        if !self.policy.contains(VerifyPolicy::IGNORE_DB) {
            stores.push(&db);
        }
        stores.push(&vendor_db);
        stores.push(&mok);

        for store in stores {
            self.verifier.drain_errors();
            if store.lookup_hash(HashAlgorithm::Sha256, &digest.sha256).found() {
                self.record_method(VerificationMethod::Hash);
                self.measure_match(store.name(), store.owner(), &digest.sha256);
                return Ok(());
            }
            if store.lookup_hash(HashAlgorithm::Sha1, &digest.sha1).found() {
                self.record_method(VerificationMethod::Hash);
                self.measure_match(store.name(), store.owner(), &digest.sha1);
                return Ok(());
            }
            for pkcs7 in signatures {
                if store
                    .lookup_cert(self.verifier, pkcs7, &digest.sha256)
                    .found()
                {
                    self.record_method(VerificationMethod::Cert);
                    self.measure_match(store.name(), store.owner(), pkcs7);
                    return Ok(());
                }
            }
            self.verifier.drain_errors();
        }

        // Last resort: the build-time and vendor certificates, verified
        // directly against each attached signature.
        let direct: [(&str, Option<&[u8]>); 2] = [
            ("build_cert", self.anchors.build_cert),
            ("vendor_cert", self.anchors.vendor_cert),
        ];
        for (name, cert) in direct {
            let cert = match cert {
                Some(cert) => cert,
                None => continue,
            };
            debug!("verifying against {}", name);
            for pkcs7 in signatures {
                self.verifier.drain_errors();
                if self.verifier.verify(pkcs7, cert, &digest.sha256) {
                    debug!("signature verified against {}", name);
                    self.record_method(VerificationMethod::Cert);
                    self.measure_match(name, MOK_VARIABLE_GUID, cert);
                    self.verifier.drain_errors();
                    return Ok(());
                }
            }
            self.verifier.drain_errors();
        }

        Err(Status::NotFound)
    }

    fn measure_match(&self, name: &str, owner: crate::trust::Guid, data: &[u8]) {
        if let Err(status) = self.tpm.measure_variable(name, &owner, data) {
            warn!("measuring {} record failed: {}", name, status);
        }
    }

    /// Signature and store verdict for one image.
    fn verify_buffer_authenticode(
        &self,
        image: &[u8],
        context: &ImageContext,
        digest: &ImageDigest,
        parent_verified: bool,
    ) -> Result<()> {
        self.verifier.drain_errors();
        let signatures = parse_signature_blobs(image, context)?;

        self.check_denylist(&signatures, digest)?;

        if parent_verified {
            return Ok(());
        }

        match self.check_allowlist(&signatures, digest) {
            Ok(()) => {
                self.verifier.drain_errors();
                Ok(())
            }
            Err(Status::NotFound) => {
                if { context.sec_dir.size } == 0 {
                    debug!("no signatures found");
                }
                warn!("binary is not authorized");
                self.verifier.drain_errors();
                Err(Status::SecurityViolation)
            }
            Err(status) => Err(status),
        }
    }

    /// Anti-rollback verdict for one image.
    fn verify_buffer_sbat(
        &self,
        image: &[u8],
        context: &ImageContext,
        in_protocol: bool,
    ) -> Result<()> {
        let mut sbat_data: Option<&[u8]> = None;

        for index in 0..context.number_of_sections {
            let section = context.section(image, index)?;
            if !section.name_is(&pe::SBAT_SECTION_NAME) {
                continue;
            }
            if sbat_data.is_some() {
                warn!("image has multiple sbat sections");
                return Err(Status::Unsupported);
            }
            if { section.number_of_relocations } != 0 || { section.pointer_to_relocations } != 0 {
                warn!("sbat section has relocations");
                return Err(Status::Unsupported);
            }
            // The virtual size is the metadata size; the raw size is
            // file-alignment padded. A raw size smaller than the virtual
            // size cannot hold the metadata, so such a section is ignored.
            let raw_size = { section.size_of_raw_data } as u64;
            let virtual_size = { section.virtual_size } as u64;
            if raw_size != 0 && raw_size >= virtual_size {
                let raw_offset = { section.pointer_to_raw_data } as u64;
                let data = mem::image_region(image, raw_offset, raw_size).ok_or_else(|| {
                    warn!("sbat section exceeds bounds of image");
                    Status::Unsupported
                })?;
                debug!("sbat section at 0x{:x}, size 0x{:x}", raw_offset, raw_size);
                sbat_data = Some(data);
            }
        }

        self.verify_sbat_section(sbat_data, in_protocol)
    }

    fn verify_sbat_section(&self, sbat_data: Option<&[u8]>, in_protocol: bool) -> Result<()> {
        if self.revocations.is_empty() {
            return Ok(());
        }

        let data = match sbat_data {
            Some(data) => data,
            None => {
                debug!("no .sbat section data");
                // Mandatory for directly loaded images, optional for
                // buffers verified through the external protocol.
                return if in_protocol {
                    Ok(())
                } else {
                    Err(Status::SecurityViolation)
                };
            }
        };

        let entries = sbat::parse_sbat_section(data).map_err(|status| {
            warn!("could not parse .sbat section data: {}", status);
            status
        })?;
        for entry in &entries {
            debug!(
                "{}, {}, {}, {}, {}, {}",
                entry.component_name,
                entry.component_generation,
                entry.vendor_name,
                entry.vendor_package_name,
                entry.vendor_version,
                entry.vendor_url
            );
        }

        sbat::verify_sbat(&entries, &self.revocations)
    }

    /// Full verdict: signature verification and anti-rollback, in that
    /// order; acceptance requires both.
    fn verify_buffer(
        &self,
        image: &[u8],
        context: &ImageContext,
        digest: &ImageDigest,
        parent_verified: bool,
        in_protocol: bool,
    ) -> Result<()> {
        self.verify_buffer_authenticode(image, context, digest, parent_verified)?;
        self.verify_buffer_sbat(image, context, in_protocol)
    }
}

/// Output of a successful verification, consumed by the loader. The
/// context and digests are frozen here; nothing downstream re-parses the
/// headers.
#[derive(Debug, Clone)]
pub struct VerifiedImage {
    pub context: ImageContext,
    pub digest: ImageDigest,
}

fn verify_common(
    image: &[u8],
    session: &VerifySession<'_>,
    parent_verified: bool,
    in_protocol: bool,
) -> Result<VerifiedImage> {
    let context = read_header(image, session.parse_flags(in_protocol))?;
    let digest = authenticode::generate_hash(image, &context)?;

    // Measure before the verdict: denied images appear in the event log
    // too.
    if let Err(status) = session.tpm.measure_image(image, &digest.sha1, "second-stage image") {
        warn!("image measurement failed: {}", status);
    }

    if !session.enforce {
        info!("verification not enforced; accepting image");
        return Ok(VerifiedImage { context, digest });
    }

    match session.verify_buffer(image, &context, &digest, parent_verified, in_protocol) {
        Ok(()) => {
            info!("verification succeeded");
            Ok(VerifiedImage { context, digest })
        }
        Err(status) => {
            warn!("verification failed: {}", status);
            Err(status)
        }
    }
}

/// Verify a directly loaded second-stage image.
pub fn verify(image: &[u8], session: &VerifySession<'_>) -> Result<VerifiedImage> {
    verify_common(image, session, false, false)
}

/// Verify an image whose trust was already established by a parent in the
/// load chain. Inherited trust skips only the allow search — the deny
/// sweep and the rollback check still run.
pub fn verify_inherited(image: &[u8], session: &VerifySession<'_>) -> Result<VerifiedImage> {
    verify_common(image, session, true, false)
}

/// Verify a buffer on behalf of an external protocol caller. The `.sbat`
/// section becomes optional and the 64-on-32 machine exception applies.
pub fn verify_in_protocol(image: &[u8], session: &VerifySession<'_>) -> Result<VerifiedImage> {
    verify_common(image, session, false, true)
}

/// Parse and hash a buffer without a trust verdict (protocol surface).
pub fn hash_only(image: &[u8]) -> Result<(ImageContext, ImageDigest)> {
    let context = read_header(
        image,
        ParseFlags { validate_security_dir: true, require_nx: false, in_protocol: true },
    )?;
    let digest = authenticode::generate_hash(image, &context)?;
    Ok((context, digest))
}

/// Parse a buffer's headers without a trust verdict (protocol surface).
pub fn read_header_only(image: &[u8]) -> Result<ImageContext> {
    read_header(
        image,
        ParseFlags { validate_security_dir: true, require_nx: false, in_protocol: true },
    )
}

/// Walk the security directory and collect every attached PKCS#7 blob.
///
/// Entries are `WIN_CERTIFICATE` wrapped, laid end to end with 8-byte
/// alignment. Entries of other certificate types are skipped; structural
/// inconsistencies reject the image.
pub(crate) fn parse_signature_blobs<'i>(
    image: &'i [u8],
    context: &ImageContext,
) -> Result<Vec<&'i [u8]>> {
    let sec_va = { context.sec_dir.virtual_address } as u64;
    let sec_size = { context.sec_dir.size } as u64;
    let datasize = image.len() as u64;

    let end = sec_va.checked_add(sec_size).ok_or(Status::InvalidParameter)?;
    if end > datasize {
        warn!("certificate table too large for image");
        return Err(Status::InvalidParameter);
    }

    let mut blobs = Vec::new();
    let mut offset = 0u64;
    while offset < sec_size {
        if sec_size - offset < pe::WIN_CERT_HEADER_SIZE as u64 {
            warn!("certificate entry header too large for certificate table");
            return Err(Status::InvalidParameter);
        }
        let entry_offset = sec_va + offset;
        let header = mem::read_struct::<WinCertificateHeader>(image, entry_offset as usize)
            .ok_or(Status::InvalidParameter)?;
        let length = { header.length } as u64;
        if length > sec_size - offset {
            warn!("certificate entry too large for certificate table");
            return Err(Status::InvalidParameter);
        }
        if length < pe::WIN_CERT_HEADER_SIZE as u64 {
            warn!("certificate entry too small for certificate data");
            return Err(Status::InvalidParameter);
        }
        if { header.certificate_type } == pe::WIN_CERT_TYPE_PKCS_SIGNED_DATA {
            let data = mem::image_region(
                image,
                entry_offset + pe::WIN_CERT_HEADER_SIZE as u64,
                length - pe::WIN_CERT_HEADER_SIZE as u64,
            )
            .ok_or(Status::InvalidParameter)?;
            blobs.push(data);
        } else {
            warn!("unsupported certificate type 0x{:x}", { header.certificate_type });
        }
        let advanced = offset
            .checked_add(length)
            .and_then(|v| mem::align_up(v, pe::WIN_CERT_ALIGNMENT))
            .ok_or(Status::InvalidParameter)?;
        offset = advanced;
    }
    Ok(blobs)
}

/// Is the platform enforcing verification? Machine-owner opt-out first,
/// then the firmware secure-boot and setup-mode flags.
pub fn secure_mode(variables: &dyn VariableStore) -> bool {
    if let Some(state) = variables.get(store_names::MOK_SB_STATE, &MOK_VARIABLE_GUID) {
        if state.first() == Some(&1) {
            info!("verification disabled by machine owner");
            return false;
        }
    }
    match variables.get(store_names::SECURE_BOOT, &EFI_GLOBAL_VARIABLE_GUID) {
        Some(data) if data.first() == Some(&1) => {}
        _ => return false,
    }
    if let Some(setup) = variables.get(store_names::SETUP_MODE, &EFI_GLOBAL_VARIABLE_GUID) {
        if setup.first() == Some(&1) {
            return false;
        }
    }
    true
}

/// Load the administrative policy toggles from the machine-owner
/// variables.
pub fn load_policy(variables: &dyn VariableStore) -> VerifyPolicy {
    let mut policy = VerifyPolicy::empty();
    if variables
        .get(store_names::MOK_IGNORE_DB, &MOK_VARIABLE_GUID)
        .is_some()
    {
        policy |= VerifyPolicy::IGNORE_DB;
    }
    if let Some(bits) = variables.get(store_names::MOK_POLICY, &MOK_VARIABLE_GUID) {
        if bits.first().map(|b| b & 1 != 0).unwrap_or(false) {
            policy |= VerifyPolicy::REQUIRE_NX;
        }
    }
    policy
}

/// Load the anti-rollback revocation list, falling back to the compiled-in
/// baseline when the variable is absent or unusable.
pub fn load_revocations(variables: &dyn VariableStore) -> Vec<SbatRevocation> {
    let data = variables.get(store_names::SBAT_LEVEL, &MOK_VARIABLE_GUID);
    let parsed = match &data {
        Some(data) => sbat::parse_revocations(data),
        None => Err(Status::NotFound),
    };
    match parsed {
        Ok(revocations) => revocations,
        Err(status) => {
            warn!("revocation variable unusable ({}); using baseline", status);
            sbat::parse_revocations(BASELINE_REVOCATIONS).unwrap_or_default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tpm::NullSink;
    use crate::trust::Guid;
    use alloc::collections::BTreeMap;
    use alloc::string::String;
    use alloc::vec;
    use alloc::vec::Vec;

    struct MapStore {
        vars: BTreeMap<(String, [u8; 16]), Vec<u8>>,
    }

    impl MapStore {
        fn new() -> Self {
            Self { vars: BTreeMap::new() }
        }

        fn set(&mut self, name: &str, owner: &Guid, data: &[u8]) {
            self.vars
                .insert((String::from(name), owner.to_bytes_le()), data.to_vec());
        }
    }

    impl VariableStore for MapStore {
        fn get(&self, name: &str, owner: &Guid) -> Option<Vec<u8>> {
            self.vars
                .get(&(String::from(name), owner.to_bytes_le()))
                .cloned()
        }
    }

    struct RejectAll;

    impl AuthenticodeVerifier for RejectAll {
        fn verify(&self, _pkcs7: &[u8], _certificate: &[u8], _digest: &[u8; 32]) -> bool {
            false
        }
    }

    #[test]
    fn test_secure_mode_flags() {
        let mut store = MapStore::new();
        assert!(!secure_mode(&store));

        store.set(store_names::SECURE_BOOT, &EFI_GLOBAL_VARIABLE_GUID, &[1]);
        assert!(secure_mode(&store));

        store.set(store_names::SETUP_MODE, &EFI_GLOBAL_VARIABLE_GUID, &[1]);
        assert!(!secure_mode(&store));

        store.set(store_names::SETUP_MODE, &EFI_GLOBAL_VARIABLE_GUID, &[0]);
        assert!(secure_mode(&store));

        store.set(store_names::MOK_SB_STATE, &MOK_VARIABLE_GUID, &[1]);
        assert!(!secure_mode(&store));
    }

    #[test]
    fn test_load_policy_variables() {
        let mut store = MapStore::new();
        assert_eq!(load_policy(&store), VerifyPolicy::empty());

        store.set(store_names::MOK_IGNORE_DB, &MOK_VARIABLE_GUID, &[1]);
        store.set(store_names::MOK_POLICY, &MOK_VARIABLE_GUID, &[1]);
        let policy = load_policy(&store);
        assert!(policy.contains(VerifyPolicy::IGNORE_DB));
        assert!(policy.contains(VerifyPolicy::REQUIRE_NX));
    }

    #[test]
    fn test_load_revocations_baseline_fallback() {
        let store = MapStore::new();
        let revocations = load_revocations(&store);
        assert_eq!(revocations.len(), 1);
        assert_eq!(revocations[0].component_name, "sbat");
        assert_eq!(revocations[0].component_generation, 1);
    }

    #[test]
    fn test_load_revocations_from_variable() {
        let mut store = MapStore::new();
        store.set(store_names::SBAT_LEVEL, &MOK_VARIABLE_GUID, b"sbat,1\nloader,2\n");
        let revocations = load_revocations(&store);
        assert_eq!(revocations.len(), 2);
        assert_eq!(revocations[1].component_name, "loader");
    }

    #[test]
    fn test_verification_method_first_write_wins() {
        let store = MapStore::new();
        let session = VerifySession::new(&store, &RejectAll, &NullSink, BuiltinAnchors::default());
        assert_eq!(session.verification_method(), None);
        session.record_method(VerificationMethod::Hash);
        session.record_method(VerificationMethod::Cert);
        assert_eq!(session.verification_method(), Some(VerificationMethod::Hash));
    }

    #[test]
    fn test_sbat_section_verdicts() {
        let store = MapStore::new();
        let mut session =
            VerifySession::new(&store, &RejectAll, &NullSink, BuiltinAnchors::default());
        session.set_revocations(vec![SbatRevocation {
            component_name: String::from("demo"),
            component_generation: 2,
        }]);

        // Missing section: fatal when loading directly, fine in protocol.
        assert_eq!(
            session.verify_sbat_section(None, false),
            Err(Status::SecurityViolation)
        );
        assert!(session.verify_sbat_section(None, true).is_ok());

        let current = b"demo,2,Demo,demo-pkg,1.0,https://example.invalid\n";
        assert!(session.verify_sbat_section(Some(&current[..]), false).is_ok());

        let revoked = b"demo,1,Demo,demo-pkg,1.0,https://example.invalid\n";
        assert_eq!(
            session.verify_sbat_section(Some(&revoked[..]), false),
            Err(Status::SecurityViolation)
        );

        // With no revocations at all, everything passes.
        session.set_revocations(Vec::new());
        assert!(session.verify_sbat_section(None, false).is_ok());
    }
}
