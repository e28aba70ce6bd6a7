//! Development certificate generation for the `tls init` CLI command.
//!
//! `rcgen`-backed helpers producing a self-signed CA plus server and client
//! leaf certificates, written in the directory layout the TLS resolver reads
//! (`tls-ca.pem`, `tls-cert.pem`, `tls-key.pem`). Not intended for
//! production use - bring real certificates there.

use std::fs;
use std::path::Path;

use rcgen::string::Ia5String;
use rcgen::{
    BasicConstraints, CertificateParams, DistinguishedName, DnType, IsCa, Issuer, KeyPair, SanType,
};

use crate::tls::{TLS_CA_FILE, TLS_CERT_FILE, TLS_KEY_FILE};
use crate::{Error, Result};

/// Generated certificate and key pair in PEM format.
#[derive(Debug)]
pub struct GeneratedCert {
    /// PEM-encoded certificate.
    pub cert_pem: String,
    /// PEM-encoded private key.
    pub key_pem: String,
}

/// Generate a self-signed CA certificate.
pub fn generate_ca(cn: &str) -> Result<GeneratedCert> {
    let key_pair =
        KeyPair::generate().map_err(|e| Error::Tls(format!("failed to generate CA key: {e}")))?;

    let mut params = CertificateParams::default();
    let mut dn = DistinguishedName::new();
    dn.push(DnType::CommonName, cn);
    params.distinguished_name = dn;
    params.is_ca = IsCa::Ca(BasicConstraints::Unconstrained);

    let cert = params
        .self_signed(&key_pair)
        .map_err(|e| Error::Tls(format!("CA cert generation failed: {e}")))?;

    Ok(GeneratedCert {
        cert_pem: cert.pem(),
        key_pem: key_pair.serialize_pem(),
    })
}

/// Issue a server certificate for the given DNS names, signed by `ca`.
pub fn generate_server_cert(ca: &GeneratedCert, dns_names: &[String]) -> Result<GeneratedCert> {
    let mut params = CertificateParams::default();
    let mut dn = DistinguishedName::new();
    dn.push(
        DnType::CommonName,
        dns_names.first().map_or("localhost", String::as_str),
    );
    params.distinguished_name = dn;

    let mut sans = Vec::new();
    for name in dns_names {
        let ia5 = Ia5String::try_from(name.as_str())
            .map_err(|e| Error::Tls(format!("invalid DNS SAN '{name}': {e}")))?;
        sans.push(SanType::DnsName(ia5));
    }
    params.subject_alt_names = sans;

    issue_leaf(params, ca)
}

/// Issue a client certificate with the given Common Name, signed by `ca`.
pub fn generate_client_cert(ca: &GeneratedCert, cn: &str) -> Result<GeneratedCert> {
    let mut params = CertificateParams::default();
    let mut dn = DistinguishedName::new();
    dn.push(DnType::CommonName, cn);
    params.distinguished_name = dn;

    issue_leaf(params, ca)
}

fn issue_leaf(params: CertificateParams, ca: &GeneratedCert) -> Result<GeneratedCert> {
    let ca_key = KeyPair::from_pem(&ca.key_pem)
        .map_err(|e| Error::Tls(format!("failed to parse CA key: {e}")))?;

    let issuer = Issuer::from_ca_cert_pem(&ca.cert_pem, ca_key)
        .map_err(|e| Error::Tls(format!("failed to parse CA cert: {e}")))?;

    let leaf_key =
        KeyPair::generate().map_err(|e| Error::Tls(format!("failed to generate leaf key: {e}")))?;

    let leaf_cert = params
        .signed_by(&leaf_key, &issuer)
        .map_err(|e| Error::Tls(format!("leaf cert signing failed: {e}")))?;

    Ok(GeneratedCert {
        cert_pem: leaf_cert.pem(),
        key_pem: leaf_key.serialize_pem(),
    })
}

/// Generate a CA and server pair and write them in the layout the TLS
/// resolver reads: `tls-ca.pem`, `tls-cert.pem`, `tls-key.pem`.
///
/// The CA key is written alongside as `tls-ca.key` so client certificates
/// can be issued later.
pub fn write_dev_certs(dir: &Path, hostnames: &[String]) -> Result<()> {
    fs::create_dir_all(dir)
        .map_err(|e| Error::Tls(format!("cannot create dir '{}': {e}", dir.display())))?;

    let ca = generate_ca("authgate development CA")?;
    let server = generate_server_cert(&ca, hostnames)?;

    let write = |name: &str, contents: &str| -> Result<()> {
        fs::write(dir.join(name), contents)
            .map_err(|e| Error::Tls(format!("cannot write '{name}': {e}")))
    };

    write(TLS_CA_FILE, &ca.cert_pem)?;
    write("tls-ca.key", &ca.key_pem)?;
    write(TLS_CERT_FILE, &server.cert_pem)?;
    write(TLS_KEY_FILE, &server.key_pem)?;

    Ok(())
}
