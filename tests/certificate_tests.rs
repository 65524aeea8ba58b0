//! Tests for the generated HTTPS identity

use reserver::certificate::{GENERATED_VALIDITY_DAYS, ServerIdentity};
use reserver::config::SslMode;
use reserver::error::ProxyError;
use std::io::Write;
use x509_parser::extensions::GeneralName;
use x509_parser::prelude::*;
use x509_parser::public_key::PublicKey;

#[test]
fn test_generated_certificate_properties() {
    let identity = ServerIdentity::generate("reserver.proxy").unwrap();
    let der = identity.cert_chain[0].as_ref().to_vec();
    let (_, cert) = X509Certificate::from_der(&der).unwrap();

    let validity = cert.validity();
    let seconds = validity.not_after.timestamp() - validity.not_before.timestamp();
    assert_eq!(seconds, GENERATED_VALIDITY_DAYS * 24 * 60 * 60);
    assert_eq!(GENERATED_VALIDITY_DAYS, 365);

    let common_name = cert
        .subject()
        .iter_common_name()
        .next()
        .and_then(|cn| cn.as_str().ok())
        .unwrap();
    assert_eq!(common_name, "*.reserver.proxy");

    let san = cert.subject_alternative_name().unwrap().unwrap();
    let names: Vec<&str> = san
        .value
        .general_names
        .iter()
        .filter_map(|name| match name {
            GeneralName::DNSName(dns) => Some(*dns),
            _ => None,
        })
        .collect();
    assert!(names.contains(&"*.reserver.proxy"));
    assert!(names.contains(&"reserver.proxy"));

    let constraints = cert.basic_constraints().unwrap().unwrap();
    assert!(!constraints.value.ca);

    let usage = cert.key_usage().unwrap().unwrap();
    assert!(usage.value.digital_signature());
    assert!(usage.value.key_encipherment());

    let eku = cert.extended_key_usage().unwrap().unwrap();
    assert!(eku.value.server_auth);

    match cert.public_key().parsed().unwrap() {
        PublicKey::RSA(rsa) => assert_eq!(rsa.key_size(), 2048),
        _ => panic!("expected an RSA key"),
    }
}

#[test]
fn test_generated_certificate_for_custom_domain() {
    let identity = ServerIdentity::for_mode(SslMode::Generate, None, None, "lab.internal")
        .unwrap()
        .unwrap();
    let der = identity.cert_chain[0].as_ref().to_vec();
    let (_, cert) = X509Certificate::from_der(&der).unwrap();
    let san = cert.subject_alternative_name().unwrap().unwrap();
    assert!(san
        .value
        .general_names
        .iter()
        .any(|name| matches!(name, GeneralName::DNSName("*.lab.internal"))));
}

#[test]
fn test_pem_files_round_into_server_config() {
    let key_pair = rcgen::KeyPair::generate().unwrap();
    let params = rcgen::CertificateParams::new(vec!["files.test".to_string()]).unwrap();
    let cert = params.self_signed(&key_pair).unwrap();

    let mut cert_file = tempfile::NamedTempFile::new().unwrap();
    cert_file.write_all(cert.pem().as_bytes()).unwrap();
    let mut key_file = tempfile::NamedTempFile::new().unwrap();
    key_file.write_all(key_pair.serialize_pem().as_bytes()).unwrap();

    let identity = ServerIdentity::for_mode(
        SslMode::On,
        cert_file.path().to_str(),
        key_file.path().to_str(),
        "ignored.test",
    )
    .unwrap()
    .unwrap();
    assert_eq!(identity.cert_chain.len(), 1);
    assert!(identity.into_server_config().is_ok());
}

#[test]
fn test_pem_file_without_certificate() {
    let mut empty = tempfile::NamedTempFile::new().unwrap();
    empty.write_all(b"not a pem file\n").unwrap();
    let path = empty.path().to_str().unwrap();

    let result = ServerIdentity::from_pem_files(path, path);
    assert!(matches!(result, Err(ProxyError::Certificate(_))));
}
