//! RSA keypair provisioning and session-JWT signing
//!
//! The controller owns one RSA-2048 keypair, persisted under the `auth/`
//! directory next to the rest of the persistent state. The private key is
//! PKCS#8 PEM at mode 0600, the public key SPKI PEM at 0644. Agents receive
//! the public PEM inside auth-proxy config and use it to verify session JWTs
//! without a controller round-trip.

use std::fs;
use std::path::Path;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use jsonwebtoken::{encode, Algorithm, EncodingKey, Header};
use rsa::pkcs8::{EncodePrivateKey, EncodePublicKey, LineEnding};
use rsa::{RsaPrivateKey, RsaPublicKey};
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Private key file name under the auth directory.
pub const PRIVATE_KEY_FILE: &str = "jwt_private.pem";

/// Public key file name under the auth directory.
pub const PUBLIC_KEY_FILE: &str = "jwt_public.pem";

const KEY_BITS: usize = 2048;

/// Claims carried by a signed session JWT.
#[derive(Debug, Serialize, Deserialize)]
pub struct SessionClaims {
    pub sub: String,
    pub email: String,
    pub iat: i64,
    pub exp: i64,
}

/// The controller's signing keypair, cached in memory after first load.
///
/// Built once at startup before anything else can observe it; reads are
/// lock-free thereafter.
#[derive(Clone)]
pub struct JwtKeys {
    private_pem: String,
    public_pem: String,
    encoding_key: Arc<EncodingKey>,
}

impl JwtKeys {
    /// Load the keypair from `auth_dir`, generating both files if either is
    /// missing.
    pub fn ensure(auth_dir: &Path) -> Result<Self> {
        fs::create_dir_all(auth_dir)?;
        restrict_mode(auth_dir, 0o700)?;

        let private_path = auth_dir.join(PRIVATE_KEY_FILE);
        let public_path = auth_dir.join(PUBLIC_KEY_FILE);

        let (private_pem, public_pem) = if private_path.exists() && public_path.exists() {
            (
                fs::read_to_string(&private_path)?,
                fs::read_to_string(&public_path)?,
            )
        } else {
            tracing::info!(dir = %auth_dir.display(), "generating JWT signing keypair");
            let (private_pem, public_pem) = generate_keypair()?;

            fs::write(&private_path, &private_pem)?;
            restrict_mode(&private_path, 0o600)?;
            fs::write(&public_path, &public_pem)?;
            restrict_mode(&public_path, 0o644)?;

            (private_pem, public_pem)
        };

        let encoding_key = Arc::new(EncodingKey::from_rsa_pem(private_pem.as_bytes())?);

        Ok(Self {
            private_pem,
            public_pem,
            encoding_key,
        })
    }

    /// Cached public key, SPKI PEM.
    pub fn public_key_pem(&self) -> &str {
        &self.public_pem
    }

    /// Cached private key, PKCS#8 PEM.
    pub fn private_key_pem(&self) -> &str {
        &self.private_pem
    }

    /// Sign an RS256 session JWT for a validated user.
    pub fn sign_session(
        &self,
        user_id: &str,
        email: &str,
        expires_at: DateTime<Utc>,
    ) -> Result<String> {
        let claims = SessionClaims {
            sub: user_id.to_string(),
            email: email.to_string(),
            iat: Utc::now().timestamp(),
            exp: expires_at.timestamp(),
        };
        let header = Header::new(Algorithm::RS256);
        Ok(encode(&header, &claims, &self.encoding_key)?)
    }
}

fn generate_keypair() -> Result<(String, String)> {
    let mut rng = rand::rngs::OsRng;
    let private_key =
        RsaPrivateKey::new(&mut rng, KEY_BITS).map_err(|e| Error::Keys(e.to_string()))?;
    let public_key = RsaPublicKey::from(&private_key);

    let private_pem = private_key
        .to_pkcs8_pem(LineEnding::LF)
        .map_err(|e| Error::Keys(e.to_string()))?
        .to_string();
    let public_pem = public_key
        .to_public_key_pem(LineEnding::LF)
        .map_err(|e| Error::Keys(e.to_string()))?;

    Ok((private_pem, public_pem))
}

#[cfg(unix)]
fn restrict_mode(path: &Path, mode: u32) -> Result<()> {
    use std::os::unix::fs::PermissionsExt;
    fs::set_permissions(path, fs::Permissions::from_mode(mode))?;
    Ok(())
}

#[cfg(not(unix))]
fn restrict_mode(_path: &Path, _mode: u32) -> Result<()> {
    Ok(())
}
