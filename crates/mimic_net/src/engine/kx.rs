use ml_kem::{kem::Decapsulate, EncodedSizeUser, KemCore, MlKem768};
use pqcrypto_kyber::kyber768;
use pqcrypto_traits::kem::{Ciphertext as _, PublicKey as _, SharedSecret as _};
use ring::agreement::{self, EphemeralPrivateKey, UnparsedPublicKey};
use ring::rand::SystemRandom;
use zeroize::Zeroizing;

use super::crypto::Secret;
use super::HandshakeError;

pub const X25519: u16 = 0x001d;
pub const SECP256R1: u16 = 0x0017;
pub const SECP384R1: u16 = 0x0018;
/// X25519 followed by Kyber-768 round 3, as Chrome shipped it before ML-KEM.
pub const X25519_KYBER768_DRAFT00: u16 = 0x6399;
/// ML-KEM-768 followed by X25519.
pub const X25519_MLKEM768: u16 = 0x11ec;

const X25519_LEN: usize = 32;
const MLKEM768_CIPHERTEXT_LEN: usize = 1088;

type MlKemDecapsulationKey = <MlKem768 as KemCore>::DecapsulationKey;

fn ecdh_algorithm(group: u16) -> Option<&'static agreement::Algorithm> {
    match group {
        X25519 => Some(&agreement::X25519),
        SECP256R1 => Some(&agreement::ECDH_P256),
        SECP384R1 => Some(&agreement::ECDH_P384),
        _ => None,
    }
}

pub fn is_supported(group: u16) -> bool {
    ecdh_algorithm(group).is_some() || is_hybrid(group)
}

/// KEM hybrids; only valid in TLS 1.3 key shares.
pub fn is_hybrid(group: u16) -> bool {
    matches!(group, X25519_KYBER768_DRAFT00 | X25519_MLKEM768)
}

fn keygen_failed() -> HandshakeError {
    HandshakeError::ProtocolViolation("key generation failed".into())
}

fn invalid_share() -> HandshakeError {
    HandshakeError::ProtocolViolation("invalid peer key share".into())
}

fn ecdh_keypair(
    alg: &'static agreement::Algorithm,
) -> Result<(EphemeralPrivateKey, Vec<u8>), HandshakeError> {
    let rng = SystemRandom::new();
    let private = EphemeralPrivateKey::generate(alg, &rng).map_err(|_| keygen_failed())?;
    let public = private
        .compute_public_key()
        .map_err(|_| keygen_failed())?
        .as_ref()
        .to_vec();
    Ok((private, public))
}

fn ecdh_agree(private: EphemeralPrivateKey, peer: &[u8]) -> Result<Secret, HandshakeError> {
    let alg = private.algorithm();
    agreement::agree_ephemeral(private, &UnparsedPublicKey::new(alg, peer), |shared| {
        Secret::new(shared.to_vec())
    })
    .map_err(|_| invalid_share())
}

enum Exchange {
    Ecdh(EphemeralPrivateKey),
    Kyber768Draft {
        x25519: EphemeralPrivateKey,
        kyber: kyber768::SecretKey,
    },
    MlKem768 {
        x25519: EphemeralPrivateKey,
        decap: Box<MlKemDecapsulationKey>,
    },
}

/// An ephemeral key for one named group, consumed by the agreement.
pub struct EphemeralKey {
    group: u16,
    exchange: Exchange,
    public: Vec<u8>,
}

impl EphemeralKey {
    pub fn generate(group: u16) -> Result<Self, HandshakeError> {
        let (exchange, public) = match group {
            X25519_KYBER768_DRAFT00 => {
                let (x25519, x_public) = ecdh_keypair(&agreement::X25519)?;
                let (kyber_public, kyber) = kyber768::keypair();
                let public = [x_public.as_slice(), kyber_public.as_bytes()].concat();
                (Exchange::Kyber768Draft { x25519, kyber }, public)
            }
            X25519_MLKEM768 => {
                let (x25519, x_public) = ecdh_keypair(&agreement::X25519)?;
                let (decap, encap) = MlKem768::generate(&mut rand::thread_rng());
                let public = [encap.as_bytes().as_slice(), x_public.as_slice()].concat();
                let decap = Box::new(decap);
                (Exchange::MlKem768 { x25519, decap }, public)
            }
            _ => {
                let alg = ecdh_algorithm(group).ok_or_else(|| {
                    HandshakeError::Unsupported(format!("key exchange group 0x{group:04x}"))
                })?;
                let (private, public) = ecdh_keypair(alg)?;
                (Exchange::Ecdh(private), public)
            }
        };
        Ok(Self {
            group,
            exchange,
            public,
        })
    }

    pub fn group(&self) -> u16 {
        self.group
    }

    pub fn public_key(&self) -> &[u8] {
        &self.public
    }

    /// Shared secret from the server's share. Hybrids concatenate both
    /// secrets in the same order as their shares.
    pub fn agree(self, peer: &[u8]) -> Result<Secret, HandshakeError> {
        match self.exchange {
            Exchange::Ecdh(private) => ecdh_agree(private, peer),
            Exchange::Kyber768Draft { x25519, kyber } => {
                if peer.len() != X25519_LEN + kyber768::ciphertext_bytes() {
                    return Err(invalid_share());
                }
                let (x_peer, ciphertext) = peer.split_at(X25519_LEN);
                let ciphertext =
                    kyber768::Ciphertext::from_bytes(ciphertext).map_err(|_| invalid_share())?;
                let kyber_secret = kyber768::decapsulate(&ciphertext, &kyber);
                let x_secret = ecdh_agree(x25519, x_peer)?;
                Ok(Zeroizing::new(
                    [x_secret.as_slice(), kyber_secret.as_bytes()].concat(),
                ))
            }
            Exchange::MlKem768 { x25519, decap } => {
                if peer.len() != MLKEM768_CIPHERTEXT_LEN + X25519_LEN {
                    return Err(invalid_share());
                }
                let (ciphertext, x_peer) = peer.split_at(MLKEM768_CIPHERTEXT_LEN);
                let ciphertext = ml_kem::Ciphertext::<MlKem768>::try_from(ciphertext)
                    .map_err(|_| invalid_share())?;
                let kem_secret = decap.decapsulate(&ciphertext).map_err(|_| invalid_share())?;
                let x_secret = ecdh_agree(x25519, x_peer)?;
                Ok(Zeroizing::new(
                    [kem_secret.as_slice(), x_secret.as_slice()].concat(),
                ))
            }
        }
    }
}

impl std::fmt::Debug for EphemeralKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EphemeralKey")
            .field("group", &format_args!("0x{:04x}", self.group))
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ml_kem::{kem::Encapsulate, Encoded};

    type MlKemEncapsulationKey = <MlKem768 as KemCore>::EncapsulationKey;

    /// Server half of an X25519 exchange: (our public, shared secret).
    fn x25519_respond(client_public: &[u8]) -> (Vec<u8>, Vec<u8>) {
        let (private, public) = ecdh_keypair(&agreement::X25519).unwrap();
        (public, ecdh_agree(private, client_public).unwrap().to_vec())
    }

    #[test]
    fn both_sides_agree() {
        for group in [X25519, SECP256R1, SECP384R1] {
            let a = EphemeralKey::generate(group).unwrap();
            let b = EphemeralKey::generate(group).unwrap();
            let a_pub = a.public_key().to_vec();
            let b_pub = b.public_key().to_vec();
            assert_eq!(a.agree(&b_pub).unwrap(), b.agree(&a_pub).unwrap());
        }
    }

    #[test]
    fn public_key_sizes() {
        assert_eq!(EphemeralKey::generate(X25519).unwrap().public_key().len(), 32);
        assert_eq!(EphemeralKey::generate(SECP256R1).unwrap().public_key().len(), 65);
        assert_eq!(EphemeralKey::generate(SECP384R1).unwrap().public_key().len(), 97);
        let kyber = EphemeralKey::generate(X25519_KYBER768_DRAFT00).unwrap();
        assert_eq!(kyber.public_key().len(), 32 + 1184);
        let mlkem = EphemeralKey::generate(X25519_MLKEM768).unwrap();
        assert_eq!(mlkem.public_key().len(), 1184 + 32);
    }

    #[test]
    fn kyber_draft_hybrid_agrees_with_server() {
        let client = EphemeralKey::generate(X25519_KYBER768_DRAFT00).unwrap();
        let (x_client, kyber_client) = client.public_key().split_at(X25519_LEN);

        let (x_server, x_secret) = x25519_respond(x_client);
        let kyber_public = kyber768::PublicKey::from_bytes(kyber_client).unwrap();
        let (kyber_secret, ciphertext) = kyber768::encapsulate(&kyber_public);
        let share = [x_server.as_slice(), ciphertext.as_bytes()].concat();
        assert_eq!(share.len(), 32 + 1088);

        let expected = [x_secret.as_slice(), kyber_secret.as_bytes()].concat();
        assert_eq!(client.agree(&share).unwrap().as_slice(), expected.as_slice());
    }

    #[test]
    fn mlkem_hybrid_agrees_with_server() {
        let client = EphemeralKey::generate(X25519_MLKEM768).unwrap();
        let (encap, x_client) = client.public_key().split_at(1184);

        let (x_server, x_secret) = x25519_respond(x_client);
        let encoded = Encoded::<MlKemEncapsulationKey>::try_from(encap).unwrap();
        let encap = MlKemEncapsulationKey::from_bytes(&encoded);
        let (ciphertext, kem_secret) = encap.encapsulate(&mut rand::thread_rng()).unwrap();
        let share = [ciphertext.as_slice(), x_server.as_slice()].concat();

        let expected = [kem_secret.as_slice(), x_secret.as_slice()].concat();
        assert_eq!(client.agree(&share).unwrap().as_slice(), expected.as_slice());
    }

    #[test]
    fn hybrid_share_of_wrong_length_is_rejected() {
        for group in [X25519_KYBER768_DRAFT00, X25519_MLKEM768] {
            let client = EphemeralKey::generate(group).unwrap();
            assert!(matches!(
                client.agree(&[7u8; 32]),
                Err(HandshakeError::ProtocolViolation(_))
            ));
        }
    }

    #[test]
    fn other_groups_are_unsupported() {
        assert!(is_supported(X25519_KYBER768_DRAFT00));
        assert!(is_supported(X25519_MLKEM768));
        // secp521r1 and ffdhe2048
        for group in [0x0019, 0x0100] {
            assert!(!is_supported(group));
            assert!(matches!(
                EphemeralKey::generate(group),
                Err(HandshakeError::Unsupported(_))
            ));
        }
    }
}
