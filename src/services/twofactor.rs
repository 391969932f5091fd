use anyhow::Context;
use rand::Rng;
use totp_rs::{Algorithm, Secret, TOTP};

/// 32-symbol alphabet with the ambiguous I/O/0/1 removed.
const RECOVERY_ALPHABET: &[u8] = b"ABCDEFGHJKLMNPQRSTUVWXYZ23456789";
pub const RECOVERY_CODE_COUNT: usize = 10;
/// Recovery codes are high-entropy, so a moderate work factor is enough.
const RECOVERY_HASH_COST: u32 = 8;

pub struct Enrolment {
    /// Base32 secret for manual entry.
    pub secret: String,
    /// PNG enrolment image, base64-encoded.
    pub qr_png: String,
    /// Cleartext recovery codes — shown exactly once.
    pub backup_codes: Vec<String>,
}

pub struct TwoFactorService;

impl TwoFactorService {
    /// Generate a fresh time-based secret, its enrolment QR and the one-shot
    /// recovery codes. Nothing is persisted here; activation happens only
    /// after the caller proves possession with a valid code.
    pub fn begin_enrolment(issuer: &str, account: &str) -> anyhow::Result<Enrolment> {
        let bytes = Secret::generate_secret()
            .to_bytes()
            .map_err(|e| anyhow::anyhow!("failed to generate TOTP secret: {e:?}"))?;
        let issuer_opt = (!issuer.is_empty()).then(|| issuer.to_string());
        let totp = TOTP::new(Algorithm::SHA1, 6, 1, 30, bytes, issuer_opt, account.to_string())
            .map_err(|e| anyhow::anyhow!("invalid TOTP parameters: {e}"))?;

        let qr_png = totp
            .get_qr_base64()
            .map_err(|e| anyhow::anyhow!("failed to render enrolment QR: {e}"))?;

        Ok(Enrolment {
            secret: totp.get_secret_base32(),
            qr_png,
            backup_codes: Self::generate_backup_codes(),
        })
    }

    /// Validate a submitted 6-digit code with a ±1 period skew window.
    pub fn verify_code(secret_b32: &str, code: &str) -> bool {
        let Ok(totp) = Self::build(secret_b32, "", "") else {
            return false;
        };
        totp.check_current(code.trim()).unwrap_or(false)
    }

    fn build(secret_b32: &str, issuer: &str, account: &str) -> anyhow::Result<TOTP> {
        let bytes = Secret::Encoded(secret_b32.to_string())
            .to_bytes()
            .map_err(|e| anyhow::anyhow!("invalid TOTP secret: {e:?}"))?;
        let issuer = (!issuer.is_empty()).then(|| issuer.to_string());
        TOTP::new(Algorithm::SHA1, 6, 1, 30, bytes, issuer, account.to_string())
            .map_err(|e| anyhow::anyhow!("invalid TOTP parameters: {e}"))
    }

    /// Ten codes, two 4-character groups from the unambiguous alphabet.
    pub fn generate_backup_codes() -> Vec<String> {
        let mut rng = rand::thread_rng();
        (0..RECOVERY_CODE_COUNT)
            .map(|_| {
                let chunk = |rng: &mut rand::rngs::ThreadRng| -> String {
                    (0..4)
                        .map(|_| RECOVERY_ALPHABET[rng.gen_range(0..RECOVERY_ALPHABET.len())] as char)
                        .collect()
                };
                format!("{}-{}", chunk(&mut rng), chunk(&mut rng))
            })
            .collect()
    }

    pub fn hash_backup_code(code: &str) -> anyhow::Result<String> {
        bcrypt::hash(normalise_code(code), RECOVERY_HASH_COST).context("failed to hash recovery code")
    }

    pub fn verify_backup_code(code: &str, hash: &str) -> bool {
        bcrypt::verify(normalise_code(code), hash).unwrap_or(false)
    }
}

fn normalise_code(code: &str) -> String {
    code.trim().to_ascii_uppercase()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backup_codes_use_the_unambiguous_alphabet() {
        for code in TwoFactorService::generate_backup_codes() {
            let (a, b) = code.split_once('-').expect("two groups");
            assert_eq!(a.len(), 4);
            assert_eq!(b.len(), 4);
            for c in a.chars().chain(b.chars()) {
                assert!(RECOVERY_ALPHABET.contains(&(c as u8)), "bad symbol {c} in {code}");
                assert!(!"IO01".contains(c));
            }
        }
    }

    #[test]
    fn ten_distinct_codes_per_enrolment() {
        let codes = TwoFactorService::generate_backup_codes();
        assert_eq!(codes.len(), RECOVERY_CODE_COUNT);
        let unique: std::collections::HashSet<_> = codes.iter().collect();
        assert_eq!(unique.len(), codes.len());
    }

    #[test]
    fn backup_code_hash_round_trip() {
        let code = "ABCD-EF23";
        let hash = TwoFactorService::hash_backup_code(code).unwrap();
        assert!(TwoFactorService::verify_backup_code(code, &hash));
        // Case and whitespace are normalised away.
        assert!(TwoFactorService::verify_backup_code(" abcd-ef23 ", &hash));
        assert!(!TwoFactorService::verify_backup_code("ABCD-EF24", &hash));
    }

    #[test]
    fn totp_round_trip() {
        let enrolment = TwoFactorService::begin_enrolment("gatehouse", "u@example.com").unwrap();
        let totp = TwoFactorService::build(&enrolment.secret, "", "").unwrap();
        let current = totp.generate_current().unwrap();
        assert!(TwoFactorService::verify_code(&enrolment.secret, &current));
        assert!(!TwoFactorService::verify_code(&enrolment.secret, "000000"));
    }

    #[test]
    fn malformed_secret_never_verifies() {
        assert!(!TwoFactorService::verify_code("not base32 at all!!!", "123456"));
    }
}
