//! X3DH asynchronous key agreement.
//!
//! Alice (initiator) fetches Bob's published prekey bundle:
//!   IK_B  (identity, Ed25519 public → converted to X25519)
//!   SPK_B (signed prekey, X25519) + IK_B's signature over SPK_B
//!   OPK_B (optional one-time prekey, X25519)
//!
//! Alice generates one ephemeral keypair EK_A and computes:
//!   DH1 = DH(IK_A, SPK_B)   — mutual authentication
//!   DH2 = DH(EK_A, IK_B)    — forward secrecy
//!   DH3 = DH(EK_A, SPK_B)   — replay protection
//!   DH4 = DH(EK_A, OPK_B)   — one-time forward secrecy [optional]
//!
//! SK = HKDF(ikm = 0xFF*32 ‖ DH1 ‖ DH2 ‖ DH3 [‖ DH4], info = "dl-x3dh-v1")
//!
//! Alice MUST verify the SPK signature before computing any DH.

use rand_core::OsRng;
use serde::{Deserialize, Serialize};
use x25519_dalek::{PublicKey as X25519Public, StaticSecret};
use zeroize::Zeroize;

use crate::{
    error::CryptoError,
    identity::{ed25519_pub_to_x25519, ed25519_secret_to_x25519, IdentityKeyPair, PublicKeyBytes},
    kdf,
};

/// Published by each device to the registry; consumed by session initiators.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PrekeyBundle {
    pub identity_key: PublicKeyBytes,
    pub signed_prekey: [u8; 32],
    pub signed_prekey_signature: Vec<u8>,
    pub one_time_prekey: Option<[u8; 32]>,
    pub one_time_prekey_id: Option<String>,
}

/// A signed prekey: an X25519 keypair whose public half is signed by the
/// owning identity key.
pub fn generate_signed_prekey(identity: &IdentityKeyPair) -> (StaticSecret, [u8; 32], Vec<u8>) {
    let secret = StaticSecret::random_from_rng(OsRng);
    let public = X25519Public::from(&secret);
    let signature = identity.sign(public.as_bytes());
    (secret, *public.as_bytes(), signature)
}

pub fn generate_one_time_prekeys(count: usize) -> Vec<(StaticSecret, [u8; 32])> {
    (0..count)
        .map(|_| {
            let secret = StaticSecret::random_from_rng(OsRng);
            let public = X25519Public::from(&secret);
            (secret, *public.as_bytes())
        })
        .collect()
}

/// Sent alongside the first ratchet message so the responder can rederive SK.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct X3dhInitHeader {
    pub session_id: uuid::Uuid,
    pub sender_identity_key: PublicKeyBytes,
    pub ephemeral_key: [u8; 32],
    pub one_time_prekey_id: Option<String>,
}

pub struct X3dhResult {
    pub shared_secret: [u8; 32],
    pub header: X3dhInitHeader,
}

/// Alice's side: verify, derive the ephemeral key, compute SK.
pub fn initiate(my_identity: &IdentityKeyPair, bundle: &PrekeyBundle) -> Result<X3dhResult, CryptoError> {
    IdentityKeyPair::verify(
        &bundle.identity_key,
        &bundle.signed_prekey,
        &bundle.signed_prekey_signature,
    )?;

    let ik_a_x = my_identity.to_x25519_secret();
    let ik_b_x = ed25519_pub_to_x25519(&bundle.identity_key)?;
    let spk_b = X25519Public::from(bundle.signed_prekey);

    let ek_a = StaticSecret::random_from_rng(OsRng);
    let ek_a_pub = X25519Public::from(&ek_a);

    let dh1 = ik_a_x.diffie_hellman(&spk_b);
    let dh2 = ek_a.diffie_hellman(&ik_b_x);
    let dh3 = ek_a.diffie_hellman(&spk_b);

    let mut ikm = vec![0xFFu8; 32];
    ikm.extend_from_slice(dh1.as_bytes());
    ikm.extend_from_slice(dh2.as_bytes());
    ikm.extend_from_slice(dh3.as_bytes());

    let mut opk_id = None;
    if let Some(opk_bytes) = bundle.one_time_prekey {
        let opk_b = X25519Public::from(opk_bytes);
        let dh4 = ek_a.diffie_hellman(&opk_b);
        ikm.extend_from_slice(dh4.as_bytes());
        opk_id = bundle.one_time_prekey_id.clone();
    }

    let mut shared_secret = [0u8; 32];
    kdf_x3dh(&ikm, &mut shared_secret)?;
    ikm.zeroize();

    Ok(X3dhResult {
        shared_secret,
        header: X3dhInitHeader {
            session_id: uuid::Uuid::new_v4(),
            sender_identity_key: my_identity.public.clone(),
            ephemeral_key: *ek_a_pub.as_bytes(),
            one_time_prekey_id: opk_id,
        },
    })
}

/// Bob's side: mirror Alice's DH order using the identity key she named in
/// the header, verified by the caller before this is invoked.
pub fn respond(
    my_identity: &IdentityKeyPair,
    my_signed_prekey_secret: &StaticSecret,
    my_one_time_prekey_secret: Option<&StaticSecret>,
    sender_identity_key: &PublicKeyBytes,
    header: &X3dhInitHeader,
) -> Result<[u8; 32], CryptoError> {
    let ek_a = X25519Public::from(header.ephemeral_key);
    let sender_ik_x = ed25519_pub_to_x25519(sender_identity_key)?;
    let ik_b_x = ed25519_secret_to_x25519(my_identity.secret_bytes());

    let dh1 = my_signed_prekey_secret.diffie_hellman(&sender_ik_x);
    let dh2 = ik_b_x.diffie_hellman(&ek_a);
    let dh3 = my_signed_prekey_secret.diffie_hellman(&ek_a);

    let mut ikm = vec![0xFFu8; 32];
    ikm.extend_from_slice(dh1.as_bytes());
    ikm.extend_from_slice(dh2.as_bytes());
    ikm.extend_from_slice(dh3.as_bytes());

    if let Some(opk_secret) = my_one_time_prekey_secret {
        let dh4 = opk_secret.diffie_hellman(&ek_a);
        ikm.extend_from_slice(dh4.as_bytes());
    }

    let mut shared_secret = [0u8; 32];
    kdf_x3dh(&ikm, &mut shared_secret)?;
    ikm.zeroize();
    Ok(shared_secret)
}

fn kdf_x3dh(ikm: &[u8], out: &mut [u8; 32]) -> Result<(), CryptoError> {
    kdf::hkdf_expand_sha512(ikm, Some(&[0u8; 64]), b"dl-x3dh-v1", out)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn x3dh_roundtrip_without_opk() {
        let alice = IdentityKeyPair::generate().unwrap();
        let bob = IdentityKeyPair::generate().unwrap();
        let (bob_spk_secret, bob_spk_pub, bob_spk_sig) = generate_signed_prekey(&bob);

        let bundle = PrekeyBundle {
            identity_key: bob.public.clone(),
            signed_prekey: bob_spk_pub,
            signed_prekey_signature: bob_spk_sig,
            one_time_prekey: None,
            one_time_prekey_id: None,
        };

        let result = initiate(&alice, &bundle).unwrap();
        let bob_secret = respond(&bob, &bob_spk_secret, None, &alice.public, &result.header).unwrap();

        assert_eq!(result.shared_secret, bob_secret);
    }

    #[test]
    fn x3dh_roundtrip_with_opk() {
        let alice = IdentityKeyPair::generate().unwrap();
        let bob = IdentityKeyPair::generate().unwrap();
        let (bob_spk_secret, bob_spk_pub, bob_spk_sig) = generate_signed_prekey(&bob);
        let opks = generate_one_time_prekeys(1);
        let (ref bob_opk_secret, bob_opk_pub) = opks[0];

        let bundle = PrekeyBundle {
            identity_key: bob.public.clone(),
            signed_prekey: bob_spk_pub,
            signed_prekey_signature: bob_spk_sig,
            one_time_prekey: Some(bob_opk_pub),
            one_time_prekey_id: Some("opk-0".into()),
        };

        let result = initiate(&alice, &bundle).unwrap();
        let bob_secret = respond(
            &bob,
            &bob_spk_secret,
            Some(bob_opk_secret),
            &alice.public,
            &result.header,
        )
        .unwrap();

        assert_eq!(result.shared_secret, bob_secret);
        assert_eq!(result.header.one_time_prekey_id.as_deref(), Some("opk-0"));
    }

    #[test]
    fn rejects_invalid_spk_signature() {
        let alice = IdentityKeyPair::generate().unwrap();
        let bob = IdentityKeyPair::generate().unwrap();
        let evil = IdentityKeyPair::generate().unwrap();
        let (_secret, spk_pub, _good_sig) = generate_signed_prekey(&bob);
        let evil_sig = evil.sign(&spk_pub);

        let bundle = PrekeyBundle {
            identity_key: bob.public.clone(),
            signed_prekey: spk_pub,
            signed_prekey_signature: evil_sig,
            one_time_prekey: None,
            one_time_prekey_id: None,
        };

        assert!(initiate(&alice, &bundle).is_err());
    }
}
