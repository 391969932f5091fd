use aes_gcm::{
    aead::{Aead, KeyInit, OsRng},
    Aes256Gcm, Nonce,
};
use anyhow::{Context, Result};
use hkdf::Hkdf;
use rand::RngCore;
use sha2::Sha256;
use uuid::Uuid;

/// Derive the per-tenant encryption key for outbound-mail credentials from a
/// versioned process-level master key.
pub fn derive_tenant_key(master_key: &[u8; 32], tenant_id: Uuid) -> Result<[u8; 32]> {
    let hk = Hkdf::<Sha256>::new(None, master_key);
    let info = format!("gatehouse-mail-{tenant_id}");
    let mut tenant_key = [0u8; 32];
    hk.expand(info.as_bytes(), &mut tenant_key)
        .map_err(|_| anyhow::anyhow!("failed to derive tenant key"))?;
    Ok(tenant_key)
}

/// Encrypt a secret with AES-256-GCM. Returns (ciphertext-with-tag, nonce).
pub fn encrypt_secret(plaintext: &[u8], key: &[u8; 32]) -> Result<(Vec<u8>, Vec<u8>)> {
    let cipher = Aes256Gcm::new_from_slice(key).context("failed to create cipher")?;

    // 96-bit random nonce, the recommended size for GCM.
    let mut nonce_bytes = vec![0u8; 12];
    OsRng.fill_bytes(&mut nonce_bytes);
    let nonce = Nonce::from_slice(&nonce_bytes);

    let ciphertext = cipher
        .encrypt(nonce, plaintext)
        .map_err(|e| anyhow::anyhow!("encryption failed: {e}"))?;

    Ok((ciphertext, nonce_bytes))
}

/// Decrypt and authenticate. The plaintext exists only in memory at the call
/// site; callers must not log it.
pub fn decrypt_secret(ciphertext: &[u8], nonce: &[u8], key: &[u8; 32]) -> Result<Vec<u8>> {
    if nonce.len() != 12 {
        anyhow::bail!("nonce must be exactly 12 bytes");
    }
    let cipher = Aes256Gcm::new_from_slice(key).context("failed to create cipher")?;
    cipher
        .decrypt(Nonce::from_slice(nonce), ciphertext)
        .map_err(|_| anyhow::anyhow!("decryption failed (wrong key version or corrupted data)"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn derived_keys_are_deterministic_and_distinct() {
        let master = [0u8; 32];
        let a = Uuid::new_v4();
        let b = Uuid::new_v4();
        let key_a = derive_tenant_key(&master, a).unwrap();
        let key_b = derive_tenant_key(&master, b).unwrap();
        assert_eq!(key_a, derive_tenant_key(&master, a).unwrap());
        assert_ne!(key_a, key_b);
    }

    #[test]
    fn encrypt_decrypt_round_trip() {
        let key = [42u8; 32];
        let plaintext = b"smtp-relay-password";
        let (ciphertext, nonce) = encrypt_secret(plaintext, &key).unwrap();
        assert_ne!(&ciphertext[..plaintext.len().min(ciphertext.len())], &plaintext[..]);
        let decrypted = decrypt_secret(&ciphertext, &nonce, &key).unwrap();
        assert_eq!(&decrypted[..], &plaintext[..]);
    }

    #[test]
    fn wrong_key_fails() {
        let (ciphertext, nonce) = encrypt_secret(b"secret", &[1u8; 32]).unwrap();
        assert!(decrypt_secret(&ciphertext, &nonce, &[2u8; 32]).is_err());
    }

    #[test]
    fn tampered_ciphertext_fails() {
        let key = [7u8; 32];
        let (mut ciphertext, nonce) = encrypt_secret(b"secret", &key).unwrap();
        ciphertext[0] ^= 1;
        assert!(decrypt_secret(&ciphertext, &nonce, &key).is_err());
    }
}
