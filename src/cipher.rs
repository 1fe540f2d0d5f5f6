//! Payload sealing for wire fields marked as encrypted.
//!
//! The control plane treats encryption as an opaque primitive: it only needs
//! `seal` and `open`. [`EncodingCipher`] is the transparent default. It wraps
//! JSON in base64 so the wire shape matches a real cipher's output.

use anyhow::{Context, Result};
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use serde_json::Value;

pub trait PayloadCipher: Send + Sync {
	fn seal(&self, value: &Value) -> Result<String>;
	fn open(&self, sealed: &str) -> Result<Value>;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct EncodingCipher;

impl PayloadCipher for EncodingCipher {
	fn seal(&self, value: &Value) -> Result<String> {
		let bytes = serde_json::to_vec(value).context("failed to serialize payload")?;
		Ok(STANDARD.encode(bytes))
	}

	fn open(&self, sealed: &str) -> Result<Value> {
		let bytes = STANDARD
			.decode(sealed.trim())
			.context("sealed payload is not valid base64")?;
		serde_json::from_slice(&bytes).context("sealed payload is not valid JSON")
	}
}

/// Accept either a sealed string or an already-plain object.
pub fn open_or_plain(cipher: &dyn PayloadCipher, value: Value) -> Result<Value> {
	match value {
		Value::String(sealed) => cipher.open(&sealed),
		other => Ok(other),
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use serde_json::json;

	#[test]
	fn test_sealed_payload_is_opaque_text() {
		let sealed = EncodingCipher.seal(&json!({"directory": "/tmp"})).unwrap();
		assert!(!sealed.contains("directory"));
		assert_eq!(EncodingCipher.open(&sealed).unwrap()["directory"], "/tmp");
	}

	#[test]
	fn test_open_or_plain_passes_objects_through() {
		let plain = open_or_plain(&EncodingCipher, json!({"a": 1})).unwrap();
		assert_eq!(plain["a"], 1);
		assert!(open_or_plain(&EncodingCipher, json!("%%%")).is_err());
	}
}
