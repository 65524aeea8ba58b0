use crate::config::SslMode;
use crate::error::ProxyError;
use crate::tls;
use log::info;
use rcgen::{
    CertificateParams, DistinguishedName, DnType, ExtendedKeyUsagePurpose, IsCa, KeyPair,
    KeyUsagePurpose, SerialNumber,
};
use rustls::ServerConfig;
use rustls::pki_types::{CertificateDer, PrivateKeyDer, PrivatePkcs8KeyDer};
use time::{Duration, OffsetDateTime};

/// Days a generated certificate stays valid.
pub const GENERATED_VALIDITY_DAYS: i64 = 365;

pub struct ServerIdentity {
    pub cert_chain: Vec<CertificateDer<'static>>,
    pub key: PrivateKeyDer<'static>,
}

impl ServerIdentity {
    /// Identity for the given `--ssl` mode; `None` when HTTPS is disabled.
    pub fn for_mode(
        mode: SslMode,
        cert_path: Option<&str>,
        key_path: Option<&str>,
        domain: &str,
    ) -> Result<Option<Self>, ProxyError> {
        match mode {
            SslMode::None => Ok(None),
            SslMode::Generate => {
                info!("Generating self-signed certificate for *.{}", domain);
                Self::generate(domain).map(Some)
            }
            SslMode::On => {
                let (cert, key) = match (cert_path, key_path) {
                    (Some(cert), Some(key)) => (cert, key),
                    _ => {
                        return Err(ProxyError::Config(
                            "--ssl-crt and --ssl-key are required when --ssl=on".to_string(),
                        ));
                    }
                };
                Self::from_pem_files(cert, key).map(Some)
            }
        }
    }

    pub fn from_pem_files(cert_path: &str, key_path: &str) -> Result<Self, ProxyError> {
        let (cert_chain, key) = tls::load_pem_files(cert_path, key_path)?;
        Ok(Self { cert_chain, key })
    }

    /// Self-signed RSA-2048 certificate for `*.domain` and `domain`, valid for a year.
    pub fn generate(domain: &str) -> Result<Self, ProxyError> {
        let wildcard = format!("*.{}", domain);
        let key_pair = KeyPair::generate_for(&rcgen::PKCS_RSA_SHA256).map_err(cert_error)?;

        let mut params =
            CertificateParams::new(vec![wildcard.clone(), domain.to_string()]).map_err(cert_error)?;
        let mut name = DistinguishedName::new();
        name.push(DnType::CommonName, wildcard);
        params.distinguished_name = name;

        let now = OffsetDateTime::now_utc();
        params.not_before = now;
        params.not_after = now + Duration::days(GENERATED_VALIDITY_DAYS);
        let serial = now.unix_timestamp_nanos() as u64;
        params.serial_number = Some(SerialNumber::from(serial.to_be_bytes().to_vec()));
        params.is_ca = IsCa::ExplicitNoCa;
        params.key_usages = vec![KeyUsagePurpose::DigitalSignature, KeyUsagePurpose::KeyEncipherment];
        params.extended_key_usages = vec![ExtendedKeyUsagePurpose::ServerAuth];

        let cert = params.self_signed(&key_pair).map_err(cert_error)?;

        Ok(Self {
            cert_chain: vec![cert.der().clone()],
            key: PrivateKeyDer::Pkcs8(PrivatePkcs8KeyDer::from(key_pair.serialize_der())),
        })
    }

    pub fn into_server_config(self) -> Result<ServerConfig, ProxyError> {
        tls::server_config(self.cert_chain, self.key)
    }
}

fn cert_error(e: rcgen::Error) -> ProxyError {
    ProxyError::Certificate(e.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_none_mode_has_no_identity() {
        let identity = ServerIdentity::for_mode(SslMode::None, None, None, "reserver.proxy").unwrap();
        assert!(identity.is_none());
    }

    #[test]
    fn test_on_mode_requires_paths() {
        let result = ServerIdentity::for_mode(SslMode::On, Some("cert.pem"), None, "reserver.proxy");
        assert!(matches!(result, Err(ProxyError::Config(_))));
    }

    #[test]
    fn test_generated_identity_builds_server_config() {
        let identity = ServerIdentity::generate("reserver.proxy").unwrap();
        assert_eq!(identity.cert_chain.len(), 1);
        let config = identity.into_server_config().unwrap();
        assert_eq!(config.alpn_protocols, vec![b"http/1.1".to_vec()]);
    }
}
