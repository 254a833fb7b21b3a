//! Measurement trigger points.
//!
//! The gate measures every candidate image (and every store record that
//! granted trust) into the platform's event log right after digesting,
//! before the accept/deny decision is finalized. Event-log formatting and
//! the TPM itself live outside the gate; only the trigger points are here.

use crate::status::Result;
use crate::trust::Guid;

/// Sink for measurement events. Implementations talk to the platform
/// measurement protocol; failures are the caller's policy to ignore or
/// escalate.
pub trait MeasurementSink {
    /// Record a candidate image, identified by its SHA-1 Authenticode
    /// digest, into the boot-services PCR.
    fn measure_image(&self, image: &[u8], sha1: &[u8; 20], description: &str) -> Result<()>;

    /// Record the store entry that granted (or denied) trust.
    fn measure_variable(&self, name: &str, owner: &Guid, data: &[u8]) -> Result<()>;
}

/// Sink for platforms without a measurement protocol.
pub struct NullSink;

impl MeasurementSink for NullSink {
    fn measure_image(&self, _image: &[u8], _sha1: &[u8; 20], _description: &str) -> Result<()> {
        Ok(())
    }

    fn measure_variable(&self, _name: &str, _owner: &Guid, _data: &[u8]) -> Result<()> {
        Ok(())
    }
}
