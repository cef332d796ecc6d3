//! Record integrity checks.
//!
//! Two independent checks compose into one verdict:
//!
//! 1. a structural / proof-of-work check over the record's required fields and
//!    content hash, and
//! 2. a keyed HMAC-SHA256 signature over a canonical projection of the record.
//!
//! The keyed check only runs once the structural check has passed.

use crate::error::ValidationFailure;
use crate::models::{Location, Record, SensorSnapshot};
use base64::{engine::general_purpose::STANDARD, Engine};
use chrono::Utc;
use hmac::{Hmac, Mac};
use sha2::{Digest, Sha256};
use std::fmt;
use std::sync::Arc;
use subtle::ConstantTimeEq;

#[cfg(test)]
use mockall::automock;

/// Location hash placeholder when a record has no location
pub const NO_LOCATION: &str = "sem_localizacao";
/// Location hash placeholder when the location lookup failed
pub const LOCATION_ERROR: &str = "erro_localizacao";
/// Sensor digest placeholder when a record has no sensor snapshot
pub const NO_SENSORS: &str = "sem_sensores";
/// Media hash placeholder when a record has no photo or video
pub const NO_MEDIA: &str = "sem_midia";

type HmacSha256 = Hmac<Sha256>;

/// Lowercase hex SHA-256 digest
pub fn sha256_hex(data: impl AsRef<[u8]>) -> String {
    hex::encode(Sha256::digest(data.as_ref()))
}

/// `^[0-9a-f]{64}$`
pub fn is_well_formed_hash(hash: &str) -> bool {
    hash.len() == 64 && hash.bytes().all(|b| matches!(b, b'0'..=b'9' | b'a'..=b'f'))
}

/// Hash of a location fix over latitude, longitude, heading and speed
pub fn location_hash(location: &Location) -> String {
    fn component(value: Option<f64>) -> String {
        value.map_or_else(|| "null".to_string(), |v| v.to_string())
    }

    sha256_hex(format!(
        "{},{},{},{}",
        location.latitude,
        location.longitude,
        component(location.heading),
        component(location.speed)
    ))
}

/// First 16 hex characters of the SHA-256 of the snapshot's JSON form
pub fn sensor_digest(snapshot: &SensorSnapshot) -> String {
    // Only string keys and numbers: serialization cannot fail.
    let json = serde_json::to_string(snapshot).unwrap_or_default();
    sha256_hex(json)[..16].to_string()
}

/// Content hash of a media file.
///
/// Digest of the base64 encoding, so hashes agree with those computed by the
/// mobile client on the file's base64 representation.
pub fn media_content_hash(bytes: &[u8]) -> String {
    sha256_hex(STANDARD.encode(bytes))
}

/// Difficulty policy for content hashes
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProofOfWork {
    difficulty_prefix: String,
}

impl ProofOfWork {
    pub fn new(difficulty_prefix: impl Into<String>) -> Self {
        Self {
            difficulty_prefix: difficulty_prefix.into(),
        }
    }

    pub fn difficulty_prefix(&self) -> &str {
        &self.difficulty_prefix
    }

    pub fn is_satisfied(&self, hash: &str) -> bool {
        hash.starts_with(&self.difficulty_prefix)
    }

    /// Search nonces until `sha256("{seed}_{nonce}")` meets the difficulty
    pub fn solve(&self, seed: &str, max_iterations: u64) -> Option<(u64, String)> {
        (0..max_iterations).find_map(|nonce| {
            let hash = sha256_hex(format!("{}_{}", seed, nonce));
            self.is_satisfied(&hash).then_some((nonce, hash))
        })
    }
}

impl Default for ProofOfWork {
    fn default() -> Self {
        Self::new("00")
    }
}

/// Produces the keyed integrity signature of a canonical message
#[cfg_attr(test, automock)]
pub trait RecordSigner: Send + Sync {
    fn sign(&self, message: &str) -> String;
}

/// HMAC-SHA256 signer keyed with the configured secret
#[derive(Clone)]
pub struct HmacSigner {
    mac: HmacSha256,
}

impl HmacSigner {
    pub fn new(secret: impl AsRef<[u8]>) -> Result<Self, hmac::digest::InvalidLength> {
        Ok(Self {
            mac: HmacSha256::new_from_slice(secret.as_ref())?,
        })
    }
}

impl fmt::Debug for HmacSigner {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("HmacSigner(<redacted>)")
    }
}

impl RecordSigner for HmacSigner {
    fn sign(&self, message: &str) -> String {
        let mut mac = self.mac.clone();
        mac.update(message.as_bytes());
        hex::encode(mac.finalize().into_bytes())
    }
}

/// Canonical JSON of the signed fields. Keys are emitted in sorted order.
pub fn canonical_projection(record: &Record) -> String {
    let location_hash = record
        .location
        .as_ref()
        .map_or_else(|| NO_LOCATION.to_string(), location_hash);
    let sensor_digest = record
        .sensor_snapshot
        .as_ref()
        .map_or_else(|| NO_SENSORS.to_string(), sensor_digest);

    serde_json::json!({
        "subject_label": record.subject_label,
        "category_id": record.category_id,
        "captured_at_millis": record.captured_at_millis,
        "context_id": record.context_id,
        "media_hash": record.media_hash().unwrap_or(NO_MEDIA),
        "location_hash": location_hash,
        "sensor_digest": sensor_digest,
        "collection_mode": record.collection_mode.as_str(),
    })
    .to_string()
}

/// Outcome of the structural / proof-of-work check
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CheckOutcome {
    pub valid: bool,
    pub reason: String,
    pub failure: Option<ValidationFailure>,
}

impl CheckOutcome {
    fn failed(failure: ValidationFailure) -> Self {
        Self {
            valid: false,
            reason: failure.to_string(),
            failure: Some(failure),
        }
    }
}

/// Outcome of the keyed signature check
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SignatureCheck {
    pub valid: bool,
    pub reason: String,
    pub computed: String,
    /// The record carried no signature; `computed` is its first one
    pub first_assignment: bool,
}

/// Combined verdict of both checks
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Verdict {
    pub valid: bool,
    pub reason: String,
    pub failure: Option<ValidationFailure>,
    /// Set when the keyed check ran
    pub computed_signature: Option<String>,
}

/// Shared validator for every capture path and audit pass
#[derive(Clone)]
pub struct IntegrityValidator {
    signer: Arc<dyn RecordSigner>,
    proof_of_work: ProofOfWork,
}

impl IntegrityValidator {
    pub fn new(signer: Arc<dyn RecordSigner>, proof_of_work: ProofOfWork) -> Self {
        Self {
            signer,
            proof_of_work,
        }
    }

    pub fn proof_of_work(&self) -> &ProofOfWork {
        &self.proof_of_work
    }

    /// Required fields, hash shape, then difficulty prefix
    pub fn check_structure(&self, record: &Record) -> CheckOutcome {
        let mut missing = Vec::new();
        if record.subject_label.is_empty() {
            missing.push("subject_label");
        }
        if record.category_id.is_empty() {
            missing.push("category_id");
        }
        if record.captured_at_millis == 0 {
            missing.push("captured_at_millis");
        }
        if record.content_hash.is_empty() {
            missing.push("content_hash");
        }
        if !missing.is_empty() {
            return CheckOutcome::failed(ValidationFailure::MissingFields(missing));
        }

        if !is_well_formed_hash(&record.content_hash) {
            return CheckOutcome::failed(ValidationFailure::MalformedHash);
        }

        if !self.proof_of_work.is_satisfied(&record.content_hash) {
            return CheckOutcome::failed(ValidationFailure::ProofOfWorkUnmet {
                prefix: self.proof_of_work.difficulty_prefix.clone(),
            });
        }

        CheckOutcome {
            valid: true,
            reason: "proof-of-work valid".to_string(),
            failure: None,
        }
    }

    /// Compare against the stored signature, or report the first one.
    ///
    /// Never mutates the record.
    pub fn check_signature(&self, record: &Record) -> SignatureCheck {
        let computed = self.signer.sign(&canonical_projection(record));

        match record.integrity_signature.as_deref() {
            Some(stored) => {
                let valid = stored.len() == computed.len()
                    && bool::from(stored.as_bytes().ct_eq(computed.as_bytes()));
                SignatureCheck {
                    valid,
                    reason: if valid {
                        "signature valid".to_string()
                    } else {
                        ValidationFailure::SignatureMismatch.to_string()
                    },
                    computed,
                    first_assignment: false,
                }
            }
            // TODO: reject unsigned records once every client signs on capture.
            None => SignatureCheck {
                valid: true,
                reason: "signature assigned".to_string(),
                computed,
                first_assignment: true,
            },
        }
    }

    /// Structural check first; the signer is only consulted when it passes
    pub fn validate(&self, record: &Record) -> Verdict {
        let structure = self.check_structure(record);
        if !structure.valid {
            return Verdict {
                valid: false,
                reason: structure.reason,
                failure: structure.failure,
                computed_signature: None,
            };
        }

        let signature = self.check_signature(record);
        if !signature.valid {
            return Verdict {
                valid: false,
                reason: signature.reason,
                failure: Some(ValidationFailure::SignatureMismatch),
                computed_signature: Some(signature.computed),
            };
        }

        Verdict {
            valid: true,
            reason: format!("{}; {}", structure.reason, signature.reason),
            failure: None,
            computed_signature: Some(signature.computed),
        }
    }

    /// Write a verdict onto a record.
    ///
    /// A signature is only assigned when the record has none; a failed
    /// verdict marks the record invalid for good.
    pub fn apply(record: &mut Record, verdict: &Verdict) {
        record.validated_at = Some(Utc::now());

        if verdict.valid {
            if record.integrity_signature.is_none() {
                record.integrity_signature = verdict.computed_signature.clone();
            }
            record.integrity_verified = true;
        } else {
            record.integrity_verified = false;
            record.invalid = true;
            record.invalid_reason = Some(verdict.reason.clone());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{CollectionMode, MediaKind};

    fn hmac_validator() -> IntegrityValidator {
        let signer = HmacSigner::new("field-secret").unwrap();
        IntegrityValidator::new(Arc::new(signer), ProofOfWork::default())
    }

    fn complete_record(hash: &str) -> Record {
        Record {
            id: "rec-1".to_string(),
            subject_label: "Operator".to_string(),
            category_id: "manual-collection".to_string(),
            category_name: "Manual sensor collection".to_string(),
            context_id: "manual-monitoring".to_string(),
            captured_at_millis: 1_714_564_800_000,
            content_hash: hash.to_string(),
            ..Default::default()
        }
    }

    fn pow_hash() -> String {
        format!("00{}", "a".repeat(62))
    }

    #[test]
    fn test_leading_zero_hash_passes_proof_of_work() {
        let validator = hmac_validator();
        let outcome = validator.check_structure(&complete_record(&pow_hash()));

        assert!(outcome.valid);
        assert_eq!(outcome.reason, "proof-of-work valid");
        assert_eq!(outcome.failure, None);
    }

    #[test]
    fn test_unmet_difficulty_fails() {
        let validator = hmac_validator();
        let hash = format!("ff{}", "a".repeat(62));
        let outcome = validator.check_structure(&complete_record(&hash));

        assert!(!outcome.valid);
        assert_eq!(
            outcome.failure,
            Some(ValidationFailure::ProofOfWorkUnmet {
                prefix: "00".to_string()
            })
        );
    }

    #[test]
    fn test_malformed_hashes_rejected() {
        let validator = hmac_validator();
        let malformed = [
            "00abc".to_string(),
            format!("00{}", "A".repeat(62)),
            format!("00{}", "g".repeat(62)),
            format!("00{}", "a".repeat(63)),
            format!(" 00{}", "a".repeat(61)),
        ];

        for hash in malformed {
            let outcome = validator.check_structure(&complete_record(&hash));
            assert_eq!(
                outcome.failure,
                Some(ValidationFailure::MalformedHash),
                "hash {:?}",
                hash
            );
        }
    }

    #[test]
    fn test_missing_fields_skip_signer() {
        let mut signer = MockRecordSigner::new();
        signer.expect_sign().times(0);
        let validator = IntegrityValidator::new(Arc::new(signer), ProofOfWork::default());

        let mut record = complete_record(&pow_hash());
        record.subject_label.clear();
        record.captured_at_millis = 0;

        let verdict = validator.validate(&record);
        assert!(!verdict.valid);
        assert_eq!(
            verdict.failure,
            Some(ValidationFailure::MissingFields(vec![
                "subject_label",
                "captured_at_millis"
            ]))
        );
        assert_eq!(verdict.computed_signature, None);
    }

    #[test]
    fn test_structural_failure_never_signs() {
        let mut signer = MockRecordSigner::new();
        signer.expect_sign().times(0);
        let validator = IntegrityValidator::new(Arc::new(signer), ProofOfWork::default());

        let verdict = validator.validate(&complete_record(&format!("ff{}", "a".repeat(62))));
        assert!(!verdict.valid);
    }

    #[test]
    fn test_valid_record_signs_once() {
        let mut signer = MockRecordSigner::new();
        signer
            .expect_sign()
            .times(1)
            .returning(|_| "sig".to_string());
        let validator = IntegrityValidator::new(Arc::new(signer), ProofOfWork::default());

        let verdict = validator.validate(&complete_record(&pow_hash()));
        assert!(verdict.valid);
        assert_eq!(verdict.computed_signature.as_deref(), Some("sig"));
    }

    #[test]
    fn test_first_signature_is_assigned_not_rejected() {
        let validator = hmac_validator();
        let record = complete_record(&pow_hash());

        let check = validator.check_signature(&record);
        assert!(check.valid);
        assert!(check.first_assignment);
        assert_eq!(check.computed.len(), 64);
    }

    #[test]
    fn test_signature_check_is_idempotent_and_read_only() {
        let validator = hmac_validator();
        let mut record = complete_record(&pow_hash());
        record.integrity_signature = Some(validator.check_signature(&record).computed);
        let before = record.clone();

        let first = validator.check_signature(&record);
        let second = validator.check_signature(&record);

        assert_eq!(first, second);
        assert!(first.valid);
        assert_eq!(record, before);
    }

    #[test]
    fn test_tampered_record_fails_signature() {
        let validator = hmac_validator();
        let mut record = complete_record(&pow_hash());
        let verdict = validator.validate(&record);
        IntegrityValidator::apply(&mut record, &verdict);

        record.subject_label = "Someone else".to_string();
        let verdict = validator.validate(&record);

        assert!(!verdict.valid);
        assert_eq!(verdict.failure, Some(ValidationFailure::SignatureMismatch));
    }

    #[test]
    fn test_different_secret_produces_mismatch() {
        let validator = hmac_validator();
        let mut record = complete_record(&pow_hash());
        let verdict = validator.validate(&record);
        IntegrityValidator::apply(&mut record, &verdict);

        let other = IntegrityValidator::new(
            Arc::new(HmacSigner::new("another-secret").unwrap()),
            ProofOfWork::default(),
        );
        assert!(!other.check_signature(&record).valid);
    }

    #[test]
    fn test_apply_keeps_existing_signature() {
        let validator = hmac_validator();
        let mut record = complete_record(&pow_hash());
        let verdict = validator.validate(&record);
        IntegrityValidator::apply(&mut record, &verdict);
        let signature = record.integrity_signature.clone();
        assert!(record.integrity_verified);

        let verdict = validator.validate(&record);
        IntegrityValidator::apply(&mut record, &verdict);
        assert_eq!(record.integrity_signature, signature);
    }

    #[test]
    fn test_apply_failure_marks_invalid() {
        let validator = hmac_validator();
        let mut record = complete_record("not-a-hash");
        let verdict = validator.validate(&record);
        IntegrityValidator::apply(&mut record, &verdict);

        assert!(record.invalid);
        assert!(!record.integrity_verified);
        assert!(record.integrity_signature.is_none());
        assert!(record.invalid_reason.unwrap().contains("64 lowercase hex"));
    }

    #[test]
    fn test_canonical_projection_uses_placeholders() {
        let record = complete_record(&pow_hash());
        let projection = canonical_projection(&record);

        assert!(projection.contains(NO_LOCATION));
        assert!(projection.contains(NO_SENSORS));
        assert!(projection.contains(NO_MEDIA));
        assert!(projection.contains("\"collection_mode\":\"manual\""));
    }

    #[test]
    fn test_canonical_projection_covers_media_and_mode() {
        let mut record = complete_record(&pow_hash());
        let base = canonical_projection(&record);

        record.collection_mode = CollectionMode::Continuous;
        assert_ne!(canonical_projection(&record), base);

        record.media.kind = MediaKind::Video;
        record.media.content_hash = Some("abc123".to_string());
        assert!(canonical_projection(&record).contains("abc123"));
    }

    #[test]
    fn test_location_hash_depends_on_heading_and_speed() {
        let mut location = Location {
            latitude: -23.55,
            longitude: -46.63,
            accuracy: Some(5.0),
            altitude: None,
            heading: None,
            speed: None,
        };
        let still = location_hash(&location);
        assert_eq!(still, sha256_hex("-23.55,-46.63,null,null"));

        location.speed = Some(1.5);
        assert_ne!(location_hash(&location), still);

        location.accuracy = Some(50.0);
        assert_eq!(location_hash(&location), sha256_hex("-23.55,-46.63,null,1.5"));
    }

    #[test]
    fn test_sensor_digest_is_sixteen_hex() {
        let digest = sensor_digest(&SensorSnapshot::default());
        assert_eq!(digest.len(), 16);
        assert!(digest.bytes().all(|b| b.is_ascii_hexdigit()));
    }

    #[test]
    fn test_proof_of_work_solve() {
        let pow = ProofOfWork::default();
        let (nonce, hash) = pow.solve("manual_1714564800000", 1_000_000).unwrap();

        assert!(hash.starts_with("00"));
        assert_eq!(hash, sha256_hex(format!("manual_1714564800000_{}", nonce)));
    }

    #[test]
    fn test_proof_of_work_gives_up() {
        let pow = ProofOfWork::new("0000000000");
        assert!(pow.solve("seed", 10).is_none());
    }

    #[test]
    fn test_media_content_hash_digests_base64() {
        assert_eq!(media_content_hash(b"hello"), sha256_hex("aGVsbG8="));
    }

    #[test]
    fn test_hmac_known_vector() {
        // RFC 4231 test case 2
        let signer = HmacSigner::new("Jefe").unwrap();
        assert_eq!(
            signer.sign("what do ya want for nothing?"),
            "5bdcc146bf60754e6a042426089575c75a003f089d2739839dec58b964ec3843"
        );
    }
}
