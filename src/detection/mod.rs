//! Magic-byte detection
//!
//! - `signatures`: append-only registry with copy-on-read snapshots
//! - `detector`: format, polyglot and active-content detection over a prefix window

pub mod detector;
pub mod signatures;

pub use detector::{detect, Detection, DetectionReason, DetectorConfig, FormatDetector};
pub use signatures::{
    default_signatures, FormatMatch, Signature, SignatureError, SignatureRegistry, SignatureSet,
};
