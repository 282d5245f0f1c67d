//! Authentication primitives: session tokens and password credentials.

use anyhow::{bail, Result};

use rand::Rng;
use rand_distr::Alphanumeric;
use serde::{Deserialize, Serialize};

use std::str::FromStr;
use std::time::SystemTime;

#[derive(Clone, PartialEq, Eq, Hash, Serialize, Deserialize, Debug)]
pub struct AuthTokenValue(pub String);

#[derive(Clone, Serialize, Deserialize, Debug)]
pub struct AuthToken {
    pub user_id: i64,
    pub created: SystemTime,
    pub last_used: Option<SystemTime>,
    pub value: AuthTokenValue,
}

impl AuthTokenValue {
    pub fn generate() -> AuthTokenValue {
        let rng = rand::rng();
        let random_string: String = rng
            .sample_iter(&Alphanumeric)
            .take(64)
            .map(char::from)
            .collect();
        AuthTokenValue(random_string)
    }
}

mod docsmith_argon2 {
    use anyhow::{anyhow, Result};
    use argon2::{
        password_hash::{
            rand_core::OsRng, PasswordHash, PasswordHasher, PasswordVerifier, SaltString,
        },
        Argon2,
    };

    pub fn generate_b64_salt() -> String {
        SaltString::generate(&mut OsRng).to_string()
    }

    pub fn hash<T: AsRef<str>>(plain: &[u8], b64_salt: T) -> Result<String> {
        let argon2 = Argon2::default();
        let salt = SaltString::from_b64(b64_salt.as_ref()).map_err(|err| anyhow!("{}", err))?;
        let hash_string = argon2
            .hash_password(plain, &salt)
            .map_err(|err| anyhow!("{}", err))?
            .to_string();
        Ok(hash_string)
    }

    pub fn verify<T: AsRef<str>>(plain_pw: &[u8], target_hash: T) -> Result<bool> {
        let argon2 = Argon2::default();
        let password_hash =
            PasswordHash::new(target_hash.as_ref()).map_err(|err| anyhow!("{}", err))?;
        Ok(argon2.verify_password(plain_pw, &password_hash).is_ok())
    }
}

// Fast hasher for tests only: a single unsalted sha256 round. Orders of
// magnitude faster than argon2, completely unsuitable for production.
#[cfg(feature = "test-fast-hasher")]
mod fast_sha256 {
    use sha2::{Digest, Sha256};

    pub fn hash(plain: &[u8], b64_salt: &str) -> String {
        let mut hasher = Sha256::new();
        hasher.update(b64_salt.as_bytes());
        hasher.update(plain);
        hasher
            .finalize()
            .iter()
            .map(|b| format!("{:02x}", b))
            .collect()
    }
}

#[derive(Clone, Serialize, Deserialize, Debug)]
pub enum DocsmithHasher {
    Argon2,
    #[cfg(feature = "test-fast-hasher")]
    FastSha256,
}

impl DocsmithHasher {
    /// The hasher new credentials are created with.
    pub fn default_hasher() -> Self {
        #[cfg(feature = "test-fast-hasher")]
        return DocsmithHasher::FastSha256;

        #[cfg(not(feature = "test-fast-hasher"))]
        DocsmithHasher::Argon2
    }
}

impl FromStr for DocsmithHasher {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "argon2" => Ok(DocsmithHasher::Argon2),
            #[cfg(feature = "test-fast-hasher")]
            "fast-sha256" => Ok(DocsmithHasher::FastSha256),
            _ => bail!("Unknown hasher {}", s),
        }
    }
}

impl std::fmt::Display for DocsmithHasher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DocsmithHasher::Argon2 => write!(f, "argon2"),
            #[cfg(feature = "test-fast-hasher")]
            DocsmithHasher::FastSha256 => write!(f, "fast-sha256"),
        }
    }
}

impl DocsmithHasher {
    pub fn generate_b64_salt(&self) -> String {
        match self {
            DocsmithHasher::Argon2 => docsmith_argon2::generate_b64_salt(),
            #[cfg(feature = "test-fast-hasher")]
            DocsmithHasher::FastSha256 => "fastsalt".to_string(),
        }
    }

    pub fn hash<T: AsRef<str>>(&self, plain: &[u8], b64_salt: T) -> Result<String> {
        match self {
            DocsmithHasher::Argon2 => docsmith_argon2::hash(plain, b64_salt),
            #[cfg(feature = "test-fast-hasher")]
            DocsmithHasher::FastSha256 => Ok(fast_sha256::hash(plain, b64_salt.as_ref())),
        }
    }

    pub fn verify<T: AsRef<str>>(&self, plain_pw: T, target_hash: T, salt: T) -> Result<bool> {
        match self {
            DocsmithHasher::Argon2 => {
                // The salt is embedded in the PHC hash string
                let _ = salt;
                docsmith_argon2::verify(plain_pw.as_ref().as_bytes(), target_hash)
            }
            #[cfg(feature = "test-fast-hasher")]
            DocsmithHasher::FastSha256 => Ok(fast_sha256::hash(
                plain_pw.as_ref().as_bytes(),
                salt.as_ref(),
            ) == target_hash.as_ref()),
        }
    }
}

#[derive(Clone, Serialize, Deserialize, Debug)]
pub struct UsernamePasswordCredentials {
    pub user_id: i64,
    pub salt: String,
    pub hash: String,
    pub hasher: DocsmithHasher,

    pub created: SystemTime,
    pub last_used: Option<SystemTime>,
}

#[derive(Clone, Serialize, Deserialize, Debug)]
pub struct UserAuthCredentials {
    pub user_id: i64,
    pub username_password: Option<UsernamePasswordCredentials>,
}

#[cfg(test)]
mod tests {

    use super::*;

    #[test]
    fn argon2_hash_roundtrip() {
        let pw = "123mypw";
        let b64_salt = DocsmithHasher::Argon2.generate_b64_salt();

        let hash1 = DocsmithHasher::Argon2.hash(pw.as_bytes(), &b64_salt).unwrap();
        let hash2 = DocsmithHasher::Argon2.hash(b"123mypw", &b64_salt).unwrap();
        assert_eq!(hash1, hash2);

        assert!(DocsmithHasher::Argon2
            .verify("123mypw", &hash1, "unused")
            .unwrap());
        assert!(!DocsmithHasher::Argon2
            .verify("not the pw", &hash1, "unused")
            .unwrap());
    }

    #[test]
    fn token_values_are_unique_and_long() {
        let a = AuthTokenValue::generate();
        let b = AuthTokenValue::generate();

        assert_eq!(a.0.len(), 64);
        assert_ne!(a, b);
        assert!(a.0.chars().all(|c| c.is_ascii_alphanumeric()));
    }

    #[test]
    fn hasher_name_roundtrip() {
        let hasher = DocsmithHasher::Argon2;
        assert!(matches!(
            DocsmithHasher::from_str(&hasher.to_string()),
            Ok(DocsmithHasher::Argon2)
        ));
        assert!(DocsmithHasher::from_str("md5").is_err());
    }
}
