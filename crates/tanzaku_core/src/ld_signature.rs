/*
 * SPDX-FileCopyrightText: 2026 Tanzaku Contributors
 * SPDX-License-Identifier: AGPL-3.0-only
 */

//! Linked-data signatures (`RsaSignature2017` shape) over activities.
//! Canonicalization is deterministic sorted-key JSON; both signer and
//! verifier here use the same form, and the signature proves origin to
//! consumers that apply the matching scheme.

use crate::http_sig::sign_bytes_rsa_sha256;
use anyhow::{anyhow, Context, Result};
use base64::{engine::general_purpose::STANDARD as B64, Engine as _};
use rsa::{
    pkcs1v15::VerifyingKey,
    pkcs8::DecodePublicKey,
    signature::Verifier,
    RsaPublicKey,
};
use serde_json::{Map, Value};
use sha2::{Digest, Sha256};

/// Signs `activity` in place with the actor's key. Failure is fatal to the
/// delivery attempt that wanted the signature, never to note creation.
pub fn sign_rsa_signature_2017(
    activity: &mut Value,
    private_key_pem: &str,
    creator_key_id: &str,
) -> Result<()> {
    let created = crate::renderer::ms_to_rfc3339(crate::id::now_ms())
        .ok_or_else(|| anyhow!("format created timestamp"))?;
    let mut options = Map::new();
    options.insert("type".into(), Value::String("RsaSignature2017".into()));
    options.insert("creator".into(), Value::String(creator_key_id.into()));
    options.insert("created".into(), Value::String(created));

    let to_sign = signing_input(&Value::Object(options.clone()), activity)?;
    let signature = sign_bytes_rsa_sha256(private_key_pem, to_sign.as_bytes())?;

    options.insert(
        "signatureValue".into(),
        Value::String(B64.encode(signature)),
    );
    let map = activity
        .as_object_mut()
        .ok_or_else(|| anyhow!("activity is not an object"))?;
    map.insert("signature".into(), Value::Object(options));
    Ok(())
}

pub fn verify_rsa_signature_2017(activity: &Value, public_key_pem: &str) -> Result<()> {
    let sig = activity
        .get("signature")
        .and_then(|v| v.as_object())
        .ok_or_else(|| anyhow!("activity has no signature"))?;
    let sig_value = sig
        .get("signatureValue")
        .and_then(|v| v.as_str())
        .ok_or_else(|| anyhow!("signature missing signatureValue"))?;
    let signature = B64.decode(sig_value).context("decode signatureValue")?;

    let mut options = sig.clone();
    options.remove("signatureValue");
    options.remove("id");

    let mut doc = activity.clone();
    if let Some(map) = doc.as_object_mut() {
        map.remove("signature");
    }

    let signed = signing_input(&Value::Object(options), &doc)?;
    let public_key =
        RsaPublicKey::from_public_key_pem(public_key_pem).context("parse public key pem")?;
    let verifying_key = VerifyingKey::<Sha256>::new(public_key);
    let sig = rsa::pkcs1v15::Signature::try_from(signature.as_slice())
        .context("invalid rsa signature bytes")?;
    verifying_key
        .verify(signed.as_bytes(), &sig)
        .context("ld signature verify failed")?;
    Ok(())
}

/// hex(sha256(canonical options)) ++ hex(sha256(canonical document)), with
/// any pre-existing `signature` member excluded from the document side.
fn signing_input(options: &Value, document: &Value) -> Result<String> {
    let mut doc = document.clone();
    if let Some(map) = doc.as_object_mut() {
        map.remove("signature");
    }
    let options_hash = hex::encode(Sha256::digest(canonicalize(options).as_bytes()));
    let doc_hash = hex::encode(Sha256::digest(canonicalize(&doc).as_bytes()));
    Ok(format!("{options_hash}{doc_hash}"))
}

/// Deterministic JSON: object keys sorted recursively, no whitespace.
pub fn canonicalize(v: &Value) -> String {
    fn write(v: &Value, out: &mut String) {
        match v {
            Value::Object(map) => {
                let mut keys: Vec<&String> = map.keys().collect();
                keys.sort();
                out.push('{');
                for (i, k) in keys.iter().enumerate() {
                    if i > 0 {
                        out.push(',');
                    }
                    out.push_str(&serde_json::to_string(k).expect("string serializes"));
                    out.push(':');
                    write(&map[*k], out);
                }
                out.push('}');
            }
            Value::Array(arr) => {
                out.push('[');
                for (i, item) in arr.iter().enumerate() {
                    if i > 0 {
                        out.push(',');
                    }
                    write(item, out);
                }
                out.push(']');
            }
            other => {
                out.push_str(&serde_json::to_string(other).expect("scalar serializes"));
            }
        }
    }
    let mut out = String::new();
    write(v, &mut out);
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::OsRng;
    use rsa::pkcs8::{EncodePrivateKey, EncodePublicKey, LineEnding};
    use rsa::RsaPrivateKey;
    use serde_json::json;

    #[test]
    fn canonical_form_sorts_keys() {
        let v = json!({"b": 1, "a": {"z": [1, 2], "y": "s"}});
        assert_eq!(canonicalize(&v), r#"{"a":{"y":"s","z":[1,2]},"b":1}"#);
    }

    #[test]
    fn sign_then_verify_roundtrip() {
        let key = RsaPrivateKey::new(&mut OsRng, 2048).unwrap();
        let priv_pem = key.to_pkcs8_pem(LineEnding::LF).unwrap().to_string();
        let pub_pem = key
            .to_public_key()
            .to_public_key_pem(LineEnding::LF)
            .unwrap();

        let mut activity = json!({
            "id": "https://tanzaku.example/abc",
            "type": "Create",
            "actor": "https://tanzaku.example/users/u1",
        });
        sign_rsa_signature_2017(
            &mut activity,
            &priv_pem,
            "https://tanzaku.example/users/u1#main-key",
        )
        .unwrap();

        assert_eq!(activity["signature"]["type"], "RsaSignature2017");
        verify_rsa_signature_2017(&activity, &pub_pem).unwrap();

        // Tampering breaks it.
        activity["actor"] = json!("https://evil.example/users/x");
        assert!(verify_rsa_signature_2017(&activity, &pub_pem).is_err());
    }
}
