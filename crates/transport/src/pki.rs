//! The per-runner private CA and the leaf credentials it issues.

use std::fmt;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};
use std::str::FromStr;

use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use rand::Rng;
use rcgen::{
    BasicConstraints, Certificate, CertificateParams, DistinguishedName, DnType,
    ExtendedKeyUsagePurpose, IsCa, KeyPair, KeyUsagePurpose, SanType, SerialNumber,
};
use rsa::pkcs8::EncodePrivateKey;
use rsa::RsaPrivateKey;
use serde::{Deserialize, Serialize};
use time::{Duration, OffsetDateTime};
use tracing::debug;

use crate::error::TransportError;

const RSA_KEY_BITS: usize = 2048;
const CERT_VALIDITY_DAYS: i64 = 365;
const ORG_NAME: &str = "gantry";
const MAX_SERIAL: u64 = 1_000_000;

/// Which side of the channel a leaf credential authenticates.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    Server,
    Client,
}

impl Role {
    fn extended_key_usage(self) -> ExtendedKeyUsagePurpose {
        match self {
            Role::Server => ExtendedKeyUsagePurpose::ServerAuth,
            Role::Client => ExtendedKeyUsagePurpose::ClientAuth,
        }
    }
}

impl FromStr for Role {
    type Err = TransportError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "server" => Ok(Role::Server),
            "client" => Ok(Role::Client),
            other => Err(TransportError::InvalidRole(other.to_string())),
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Role::Server => f.write_str("server"),
            Role::Client => f.write_str("client"),
        }
    }
}

/// Generate a fresh 2048-bit RSA key and hand it to rcgen as PKCS#8.
///
/// rcgen's signing backend can sign with RSA keys but cannot generate them,
/// so generation goes through the `rsa` crate.
fn generate_rsa_key_pair() -> Result<KeyPair, TransportError> {
    let mut rng = rand::thread_rng();
    let private_key = RsaPrivateKey::new(&mut rng, RSA_KEY_BITS)
        .map_err(|error| TransportError::KeyGeneration(error.to_string()))?;
    let document = private_key
        .to_pkcs8_der()
        .map_err(|error| TransportError::KeyGeneration(error.to_string()))?;
    KeyPair::from_der(document.as_bytes()).map_err(TransportError::CertificateGeneration)
}

fn validity_window() -> (OffsetDateTime, OffsetDateTime) {
    let now = OffsetDateTime::now_utc();
    // Backdate one second so a freshly issued certificate is valid on a
    // clock that is marginally behind ours.
    (now - Duration::seconds(1), now + Duration::days(CERT_VALIDITY_DAYS))
}

/// The self-signed certificate authority owned by one registry instance.
///
/// The CA key never leaves this process; plugins only ever see the CA
/// certificate (embedded in their credential) and a leaf signed by it.
pub struct PrivateCa {
    cert: Certificate,
    cert_der: Vec<u8>,
}

impl PrivateCa {
    /// Generate a fresh CA: 2048-bit RSA key, self-signed certificate valid
    /// for one year, marked as a certificate authority for both server and
    /// client authentication.
    pub fn generate() -> Result<Self, TransportError> {
        debug!("generating private CA");

        let key_pair = generate_rsa_key_pair()?;
        let (not_before, not_after) = validity_window();

        let mut params = CertificateParams::default();
        params.alg = &rcgen::PKCS_RSA_SHA256;
        params.key_pair = Some(key_pair);
        params.distinguished_name = DistinguishedName::new();
        params
            .distinguished_name
            .push(DnType::OrganizationName, ORG_NAME);
        params.not_before = not_before;
        params.not_after = not_after;
        params.serial_number = Some(SerialNumber::from(1u64));
        params.is_ca = IsCa::Ca(BasicConstraints::Unconstrained);
        params.key_usages = vec![
            KeyUsagePurpose::KeyCertSign,
            KeyUsagePurpose::DigitalSignature,
        ];
        params.extended_key_usages = vec![
            ExtendedKeyUsagePurpose::ServerAuth,
            ExtendedKeyUsagePurpose::ClientAuth,
        ];

        let cert = Certificate::from_params(params)?;
        let cert_der = cert.serialize_der()?;

        debug!("private CA generated");
        Ok(Self { cert, cert_der })
    }

    /// DER bytes of the CA certificate, as embedded in issued credentials.
    pub fn cert_der(&self) -> &[u8] {
        &self.cert_der
    }

    /// Issue a leaf credential signed by this CA.
    ///
    /// The leaf carries the role's extended key usage, a random sub-10^6
    /// serial number, and subject alternative names for `localhost` and both
    /// loopback addresses; the loopback interface is the only place these
    /// credentials are ever presented.
    pub fn issue(&self, common_name: &str, role: Role) -> Result<LeafCredential, TransportError> {
        debug!(subject = common_name, %role, "issuing leaf credential");

        let key_pair = generate_rsa_key_pair()?;
        let key_der = key_pair.serialize_der();
        let (not_before, not_after) = validity_window();
        let serial: u64 = rand::thread_rng().gen_range(0..MAX_SERIAL);

        let mut params = CertificateParams::default();
        params.alg = &rcgen::PKCS_RSA_SHA256;
        params.key_pair = Some(key_pair);
        params.distinguished_name = DistinguishedName::new();
        params
            .distinguished_name
            .push(DnType::CommonName, common_name);
        params
            .distinguished_name
            .push(DnType::OrganizationName, ORG_NAME);
        params.not_before = not_before;
        params.not_after = not_after;
        params.serial_number = Some(SerialNumber::from(serial));
        params.key_usages = vec![KeyUsagePurpose::DigitalSignature];
        params.extended_key_usages = vec![role.extended_key_usage()];
        params.subject_alt_names = vec![
            SanType::DnsName("localhost".to_string()),
            SanType::IpAddress(IpAddr::V4(Ipv4Addr::LOCALHOST)),
            SanType::IpAddress(IpAddr::V6(Ipv6Addr::LOCALHOST)),
        ];

        let cert = Certificate::from_params(params)?;
        let cert_der = cert.serialize_der_with_signer(&self.cert)?;

        debug!(subject = common_name, %role, "leaf credential issued");
        Ok(LeafCredential {
            common_name: common_name.to_string(),
            role,
            key_der,
            cert_der,
            ca_cert_der: self.cert_der.clone(),
        })
    }
}

/// A leaf key-and-certificate pair, bound to one CA and one role.
#[derive(Clone)]
pub struct LeafCredential {
    common_name: String,
    role: Role,
    /// PKCS#8 DER private key.
    key_der: Vec<u8>,
    cert_der: Vec<u8>,
    ca_cert_der: Vec<u8>,
}

/// Wire form of a credential: base64 DER fields inside a JSON object. The
/// runner writes this into the child's argument vector; the plugin stub
/// parses it back.
#[derive(Serialize, Deserialize)]
struct SerializedCredential {
    cert_bytes: String,
    ca_cert_bytes: String,
    private_key_pkcs8: String,
    cn: String,
    role: Role,
}

impl LeafCredential {
    pub fn common_name(&self) -> &str {
        &self.common_name
    }

    pub fn role(&self) -> Role {
        self.role
    }

    pub fn cert_der(&self) -> &[u8] {
        &self.cert_der
    }

    pub fn ca_cert_der(&self) -> &[u8] {
        &self.ca_cert_der
    }

    pub fn key_der(&self) -> &[u8] {
        &self.key_der
    }

    /// Serialize for injection into a plugin subprocess.
    pub fn serialize(&self) -> Result<String, TransportError> {
        let wire = SerializedCredential {
            cert_bytes: BASE64.encode(&self.cert_der),
            ca_cert_bytes: BASE64.encode(&self.ca_cert_der),
            private_key_pkcs8: BASE64.encode(&self.key_der),
            cn: self.common_name.clone(),
            role: self.role,
        };
        serde_json::to_string(&wire)
            .map_err(|error| TransportError::CredentialDecode(error.to_string()))
    }

    /// Parse a credential from its wire form, re-validating the embedded key
    /// and CA certificate.
    pub fn deserialize(raw: &str) -> Result<Self, TransportError> {
        let wire: SerializedCredential = serde_json::from_str(raw)
            .map_err(|error| TransportError::CredentialDecode(error.to_string()))?;

        let cert_der = BASE64
            .decode(&wire.cert_bytes)
            .map_err(|error| TransportError::CredentialDecode(error.to_string()))?;
        let ca_cert_der = BASE64
            .decode(&wire.ca_cert_bytes)
            .map_err(|error| TransportError::CredentialDecode(error.to_string()))?;
        let key_der = BASE64
            .decode(&wire.private_key_pkcs8)
            .map_err(|error| TransportError::CredentialDecode(error.to_string()))?;

        // The key must parse back into a usable signing key.
        KeyPair::from_der(&key_der)
            .map_err(|error| TransportError::CredentialDecode(error.to_string()))?;

        // The CA certificate must parse as a trust anchor; the leaf is
        // validated when a TLS config is built from it.
        let mut roots = rustls::RootCertStore::empty();
        roots
            .add(rustls::pki_types::CertificateDer::from(ca_cert_der.clone()))
            .map_err(|error| TransportError::CredentialDecode(error.to_string()))?;

        debug!(cn = %wire.cn, "credential deserialized");
        Ok(Self {
            common_name: wire.cn,
            role: wire.role,
            key_der,
            cert_der,
            ca_cert_der,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_ca() -> &'static PrivateCa {
        use std::sync::OnceLock;
        static CA: OnceLock<PrivateCa> = OnceLock::new();
        CA.get_or_init(|| PrivateCa::generate().expect("generate CA"))
    }

    #[test]
    fn role_parses_known_values_only() {
        assert_eq!(Role::from_str("server").unwrap(), Role::Server);
        assert_eq!(Role::from_str("client").unwrap(), Role::Client);
        match Role::from_str("peer") {
            Err(TransportError::InvalidRole(role)) => assert_eq!(role, "peer"),
            other => panic!("expected invalid role error, got {other:?}"),
        }
    }

    #[test]
    fn issued_leaf_carries_subject_and_ca() {
        let leaf = test_ca().issue("alpha", Role::Server).unwrap();
        assert_eq!(leaf.common_name(), "alpha");
        assert_eq!(leaf.role(), Role::Server);
        assert_eq!(leaf.ca_cert_der(), test_ca().cert_der());
        assert!(!leaf.cert_der().is_empty());
    }

    #[test]
    fn serialize_deserialize_round_trip() {
        let leaf = test_ca().issue("alpha", Role::Server).unwrap();
        let restored = LeafCredential::deserialize(&leaf.serialize().unwrap()).unwrap();

        assert_eq!(restored.common_name(), leaf.common_name());
        assert_eq!(restored.role(), leaf.role());
        assert_eq!(restored.cert_der(), leaf.cert_der());
        assert_eq!(restored.ca_cert_der(), leaf.ca_cert_der());
        assert_eq!(restored.key_der(), leaf.key_der());
    }

    #[test]
    fn deserialize_rejects_garbage() {
        assert!(matches!(
            LeafCredential::deserialize("{}"),
            Err(TransportError::CredentialDecode(_))
        ));
        assert!(matches!(
            LeafCredential::deserialize("not json"),
            Err(TransportError::CredentialDecode(_))
        ));
    }

    #[test]
    fn deserialize_rejects_corrupted_key() {
        let leaf = test_ca().issue("alpha", Role::Server).unwrap();
        let mut wire: serde_json::Value =
            serde_json::from_str(&leaf.serialize().unwrap()).unwrap();
        wire["private_key_pkcs8"] = serde_json::json!(BASE64.encode(b"not a key"));
        assert!(matches!(
            LeafCredential::deserialize(&wire.to_string()),
            Err(TransportError::CredentialDecode(_))
        ));
    }
}
