//! Job instance fingerprinting.
//!
//! A job instance is identified by its job name plus a fingerprint of its
//! identifying parameters. The fingerprint must be deterministic and must not
//! depend on the order in which parameters were added.

use sha2::{Digest, Sha256};

use crate::parameters::JobParameters;

/// Strategy computing the identity key of a parameter set.
pub trait JobKeyGenerator: Send + Sync {
    fn generate_key(&self, parameters: &JobParameters) -> String;
}

/// SHA-256 over the identifying parameters, in key order.
///
/// Each parameter contributes its length-prefixed key, its type name and its
/// length-prefixed canonical value, so separators inside a value and a LONG
/// `5` versus a STRING `"5"` cannot produce the same input.
///
/// Non-identifying parameters are ignored, so relaunching with a different
/// informational parameter resolves to the same instance.
#[derive(Debug, Default, Clone, Copy)]
pub struct DefaultJobKeyGenerator;

impl JobKeyGenerator for DefaultJobKeyGenerator {
    fn generate_key(&self, parameters: &JobParameters) -> String {
        let mut hasher = Sha256::new();
        for (key, parameter) in parameters.iter().filter(|(_, p)| p.identifying) {
            let value = parameter.value.canonical_string();
            update_length_prefixed(&mut hasher, key.as_bytes());
            update_length_prefixed(&mut hasher, parameter.value.parameter_type().as_str().as_bytes());
            update_length_prefixed(&mut hasher, value.as_bytes());
        }
        format!("{:x}", hasher.finalize())
    }
}

fn update_length_prefixed(hasher: &mut Sha256, bytes: &[u8]) {
    hasher.update((bytes.len() as u64).to_be_bytes());
    hasher.update(bytes);
}
