/*
 * SPDX-FileCopyrightText: 2026 Tanzaku Contributors
 * SPDX-License-Identifier: AGPL-3.0-only
 */

use anyhow::{Context, Result};
use directories::ProjectDirs;
use rand::rngs::OsRng;
use rsa::{
    pkcs8::{DecodePrivateKey, EncodePrivateKey, EncodePublicKey, LineEnding},
    RsaPrivateKey, RsaPublicKey,
};
use std::{
    fs,
    path::{Path, PathBuf},
};

/// A local signing identity: the keypair used to sign outgoing activities
/// and authenticated fetches.
#[derive(Clone)]
pub struct Identity {
    pub private_key: RsaPrivateKey,
    pub public_key: RsaPublicKey,
    pub public_key_pem: String,
    pub private_key_pem: String,
}

pub fn default_data_dir() -> Result<PathBuf> {
    if let Ok(v) = std::env::var("TANZAKU_DATA_DIR") {
        return Ok(PathBuf::from(v));
    }
    let proj = ProjectDirs::from("net", "tanzaku", "Tanzaku")
        .context("unable to determine platform data dir")?;
    Ok(proj.data_local_dir().to_path_buf())
}

/// Load the named keypair from the data dir, generating and persisting a
/// fresh 2048-bit one on first use. `name` distinguishes per-user keys from
/// the instance proxy actor key used for signed fetch.
pub fn load_or_generate_identity(dir: impl AsRef<Path>, name: &str) -> Result<Identity> {
    let dir = dir.as_ref();
    fs::create_dir_all(dir).with_context(|| format!("create data dir: {}", dir.display()))?;

    let priv_path = dir.join(format!("{name}_private_key.pem"));
    let priv_pem = if priv_path.exists() {
        fs::read_to_string(&priv_path).with_context(|| format!("read {}", priv_path.display()))?
    } else {
        let mut rng = OsRng;
        let priv_key = RsaPrivateKey::new(&mut rng, 2048)?;
        let priv_pem = priv_key.to_pkcs8_pem(LineEnding::LF)?.to_string();
        fs::write(&priv_path, &priv_pem)
            .with_context(|| format!("write {}", priv_path.display()))?;
        priv_pem
    };

    identity_from_private_pem(&priv_pem)
}

pub fn identity_from_private_pem(priv_pem: &str) -> Result<Identity> {
    let private_key =
        RsaPrivateKey::from_pkcs8_pem(priv_pem).context("parse private key pem")?;
    let public_key = RsaPublicKey::from(&private_key);
    let public_key_pem = public_key.to_public_key_pem(LineEnding::LF)?.to_string();

    Ok(Identity {
        private_key,
        public_key,
        public_key_pem,
        private_key_pem: priv_pem.to_string(),
    })
}
