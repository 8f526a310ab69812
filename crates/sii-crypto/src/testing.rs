//! In-process test certificates. Compiled for tests and the `test-util` feature.

use openssl::asn1::Asn1Time;
use openssl::bn::BigNum;
use openssl::hash::MessageDigest;
use openssl::nid::Nid;
use openssl::pkcs12::Pkcs12;
use openssl::pkey::{PKey, Private};
use openssl::rsa::Rsa;
use openssl::x509::{X509Name, X509};
use zeroize::Zeroizing;

use crate::certificate::Certificate;

const DAY_SECS: i64 = 86_400;

/// Subject and validity of a generated certificate. Offsets are days from now.
#[derive(Debug, Clone)]
pub struct TestCertificateSpec {
    /// Subject CN.
    pub common_name: String,
    /// Subject serialNumber, usually a RUT.
    pub rut: Option<String>,
    /// Subject emailAddress.
    pub email: Option<String>,
    /// `notBefore` offset in days.
    pub not_before_days: i64,
    /// `notAfter` offset in days.
    pub not_after_days: i64,
}

impl Default for TestCertificateSpec {
    fn default() -> Self {
        Self {
            common_name: "Test Signer".into(),
            rut: Some("11111111-1".into()),
            email: Some("signer@example.cl".into()),
            not_before_days: -1,
            not_after_days: 365,
        }
    }
}

/// A generated key and self-signed certificate.
pub struct TestCertificate {
    /// Private key.
    pub key: PKey<Private>,
    /// Self-signed certificate.
    pub cert: X509,
}

/// Fresh 2048-bit RSA key.
pub fn rsa_key() -> PKey<Private> {
    let rsa = Rsa::generate(2048).expect("RSA key generation");
    PKey::from_rsa(rsa).expect("wrap RSA key")
}

fn self_signed(key: &PKey<Private>, spec: &TestCertificateSpec) -> X509 {
    let mut name = X509Name::builder().expect("name builder");
    name.append_entry_by_nid(Nid::COMMONNAME, &spec.common_name)
        .expect("CN");
    if let Some(rut) = &spec.rut {
        name.append_entry_by_nid(Nid::SERIALNUMBER, rut)
            .expect("serialNumber");
    }
    if let Some(email) = &spec.email {
        name.append_entry_by_nid(Nid::PKCS9_EMAILADDRESS, email)
            .expect("emailAddress");
    }
    name.append_entry_by_nid(Nid::COUNTRYNAME, "CL").expect("C");
    let name = name.build();

    let now = chrono::Utc::now().timestamp();
    let not_before =
        Asn1Time::from_unix(now + spec.not_before_days * DAY_SECS).expect("notBefore");
    let not_after = Asn1Time::from_unix(now + spec.not_after_days * DAY_SECS).expect("notAfter");
    let serial = BigNum::from_u32(1)
        .and_then(|bn| bn.to_asn1_integer())
        .expect("serial");

    let mut builder = X509::builder().expect("x509 builder");
    builder.set_version(2).expect("version");
    builder.set_serial_number(&serial).expect("serial");
    builder.set_subject_name(&name).expect("subject");
    builder.set_issuer_name(&name).expect("issuer");
    builder.set_not_before(&not_before).expect("notBefore");
    builder.set_not_after(&not_after).expect("notAfter");
    builder.set_pubkey(key).expect("pubkey");
    builder.sign(key, MessageDigest::sha256()).expect("self-sign");
    builder.build()
}

impl TestCertificate {
    /// RSA certificate matching `spec`.
    pub fn generate(spec: &TestCertificateSpec) -> Self {
        let key = rsa_key();
        let cert = self_signed(&key, spec);
        Self { key, cert }
    }

    /// Certificate over a P-256 key, for rejection tests.
    pub fn generate_ec() -> Self {
        let group = openssl::ec::EcGroup::from_curve_name(Nid::X9_62_PRIME256V1).expect("curve");
        let ec = openssl::ec::EcKey::generate(&group).expect("EC key");
        let key = PKey::from_ec_key(ec).expect("wrap EC key");
        let cert = self_signed(&key, &TestCertificateSpec::default());
        Self { key, cert }
    }

    /// PKCS#12 bundle protected by `password`.
    pub fn pkcs12(&self, password: &str) -> Vec<u8> {
        Pkcs12::builder()
            .name("sii-test")
            .pkey(&self.key)
            .cert(&self.cert)
            .build2(password)
            .and_then(|p12| p12.to_der())
            .expect("PKCS#12 bundle")
    }

    /// Loaded [`Certificate`].
    pub fn certificate(&self) -> Certificate {
        Certificate::from_parts(
            self.cert.clone(),
            self.key.clone(),
            Vec::new(),
            Zeroizing::new(Vec::new()),
        )
        .expect("valid test certificate")
    }
}
