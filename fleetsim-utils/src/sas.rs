use crate::url_encoder::encode_url_component;
use base64::{engine::general_purpose::STANDARD, Engine};
use chrono::Utc;
use fleetsim_error::{provision::ProvisionError, ProvisionResult};
use hmac::{Hmac, Mac};
use sha2::Sha256;
use std::time::Duration;

type HmacSha256 = Hmac<Sha256>;

/// Key name used when signing registration tokens.
pub const REGISTRATION_KEY_NAME: &str = "registration";

/// Compute a base64 HMAC-SHA256 of `data` keyed by a base64 encoded secret.
///
/// # Example
/// ```
/// use fleetsim_utils::sas::compute_hmac;
///
/// let sig = compute_hmac("c2VjcmV0", "payload").unwrap();
/// assert_eq!(sig.len(), 44);
/// ```
pub fn compute_hmac(secret: &str, data: &str) -> ProvisionResult<String> {
    let key = STANDARD
        .decode(secret.trim())
        .map_err(|e| ProvisionError::KeyDerivation(format!("secret is not valid base64: {e}")))?;
    let mut mac = HmacSha256::new_from_slice(&key)
        .map_err(|e| ProvisionError::KeyDerivation(e.to_string()))?;
    mac.update(data.as_bytes());
    Ok(STANDARD.encode(mac.finalize().into_bytes()))
}

/// Derive the per-device symmetric key from a group enrollment key.
pub fn derive_device_key(master_key: &str, device_id: &str) -> ProvisionResult<String> {
    compute_hmac(master_key, device_id)
}

/// Unix timestamp `ttl` from now.
#[inline]
pub fn expiry_after(ttl: Duration) -> i64 {
    Utc::now().timestamp() + ttl.as_secs() as i64
}

/// Build a `SharedAccessSignature` token for `resource` expiring at `expiry` (unix seconds).
///
/// The signed string is the encoded resource and the expiry joined by a newline.
pub fn create_sas_token(
    key: &str,
    resource: &str,
    key_name: Option<&str>,
    expiry: i64,
) -> ProvisionResult<String> {
    let sr = encode_url_component(resource);
    let se = expiry.to_string();
    let sig = compute_hmac(key, &format!("{sr}\n{se}"))
        .map_err(|e| ProvisionError::Token(e.to_string()))?;
    let mut token = format!(
        "SharedAccessSignature sr={sr}&sig={}&se={se}",
        encode_url_component(&sig)
    );
    if let Some(name) = key_name {
        token.push_str("&skn=");
        token.push_str(&encode_url_component(name));
    }
    Ok(token)
}

#[cfg(test)]
mod tests {
    use super::*;

    const MASTER: &str = "dGhpcyBpcyBhIHRlc3QgbWFzdGVyIGtleSBmb3IgZmxlZXRzaW0=";

    #[test]
    fn test_device_key_is_stable_and_device_specific() {
        let a = derive_device_key(MASTER, "dev-1").unwrap();
        let b = derive_device_key(MASTER, "dev-1").unwrap();
        let c = derive_device_key(MASTER, "dev-2").unwrap();
        assert_eq!(a, b);
        assert_ne!(a, c);
        assert!(STANDARD.decode(&a).is_ok());
    }

    #[test]
    fn test_known_vector() {
        // HMAC-SHA256(key = "key", "The quick brown fox jumps over the lazy dog")
        let sig = compute_hmac("a2V5", "The quick brown fox jumps over the lazy dog").unwrap();
        assert_eq!(sig, "97yD9DBThCSxMpjmqm+xQ+9NWaFJRhdZl0edvC0aPNg=");
    }

    #[test]
    fn test_invalid_master_key() {
        let err = derive_device_key("not base64!!", "dev").unwrap_err();
        assert!(matches!(err, ProvisionError::KeyDerivation(_)));
    }

    #[test]
    fn test_sas_token_shape() {
        let key = derive_device_key(MASTER, "dev-1").unwrap();
        let token = create_sas_token(
            &key,
            "0ne00000/registrations/dev-1",
            Some(REGISTRATION_KEY_NAME),
            1_700_000_000,
        )
        .unwrap();
        assert!(token.starts_with("SharedAccessSignature sr=0ne00000%2Fregistrations%2Fdev-1&sig="));
        assert!(token.ends_with("&se=1700000000&skn=registration"));

        let expected_sig =
            compute_hmac(&key, "0ne00000%2Fregistrations%2Fdev-1\n1700000000").unwrap();
        assert!(token.contains(&format!("sig={}", encode_url_component(&expected_sig))));
    }

    #[test]
    fn test_sas_token_without_key_name() {
        let token = create_sas_token(MASTER, "hub/devices/d", None, 1).unwrap();
        assert!(!token.contains("skn="));
    }
}
