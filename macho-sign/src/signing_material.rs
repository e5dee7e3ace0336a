// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

/*! Signing material and configuration.

[SigningMaterial] describes *who* signs: an optional key and certificate
pair with its chain, plus the knobs that influence the signature content
such as the identifier, digest type, entitlements and time-stamp server.
A material without a key produces ad-hoc signatures.

[SigningConfig] pairs material with the path of the binary being signed.
*/

use {
    crate::{
        cryptography::{
            certificate_matches_key, parse_pem_certificates, parse_pem_private_key,
            parse_pfx_data,
        },
        embedded_signature::DigestType,
        error::MachOSignError,
    },
    log::{info, warn},
    reqwest::Url,
    std::{
        path::{Path, PathBuf},
        time::Duration,
    },
    x509_certificate::{CapturedX509Certificate, InMemorySigningKeyPair},
};

/// Sentinel accepted by [SigningMaterial::with_timestamp_server] to disable time-stamping.
pub const NO_TIMESTAMP_SERVER: &str = "none";

/// Retry policy for time-stamp authority requests.
///
/// Each request is bounded by the HTTP client's own timeout. Failed attempts are
/// retried after a delay that starts at `initial_backoff` and doubles.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct TimestampPolicy {
    pub attempts: u32,
    pub initial_backoff: Duration,
}

impl Default for TimestampPolicy {
    fn default() -> Self {
        Self {
            attempts: 3,
            initial_backoff: Duration::from_secs(1),
        }
    }
}

impl TimestampPolicy {
    /// Delay to wait after the given zero-based failed attempt.
    pub fn backoff_after(&self, attempt: u32) -> Duration {
        self.initial_backoff
            .checked_mul(2u32.saturating_pow(attempt))
            .unwrap_or(Duration::MAX)
    }
}

/// Certificates, keys and content settings for producing a signature.
pub struct SigningMaterial {
    identity: Option<String>,
    signing_key: Option<(InMemorySigningKeyPair, CapturedX509Certificate)>,
    certificate_chain: Vec<CapturedX509Certificate>,
    timestamp_url: Option<Url>,
    timestamp_policy: TimestampPolicy,
    digest_type: DigestType,
    entitlements: Option<String>,
}

impl std::fmt::Debug for SigningMaterial {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SigningMaterial")
            .field("identity", &self.identity)
            .field("ad_hoc", &self.is_ad_hoc())
            .field("chain_length", &self.certificate_chain.len())
            .field("timestamp_url", &self.timestamp_url)
            .field("digest_type", &self.digest_type)
            .field("entitlements", &self.entitlements.is_some())
            .finish()
    }
}

impl SigningMaterial {
    /// Material that produces ad-hoc signatures.
    pub fn ad_hoc() -> Self {
        Self {
            identity: None,
            signing_key: None,
            certificate_chain: vec![],
            timestamp_url: None,
            timestamp_policy: TimestampPolicy::default(),
            digest_type: DigestType::default(),
            entitlements: None,
        }
    }

    /// Construct from PEM encoded certificates and a PEM encoded private key.
    ///
    /// The first certificate is the signing certificate. Any that follow form
    /// the chain, ordered towards the root. Empty certificate data yields ad-hoc
    /// material and the key is not consulted.
    pub fn from_pems(
        cert_pem: impl AsRef<[u8]>,
        key_pem: impl AsRef<[u8]>,
        password: Option<&str>,
    ) -> Result<Self, MachOSignError> {
        if cert_pem.as_ref().iter().all(|b| b.is_ascii_whitespace()) {
            return Ok(Self::ad_hoc());
        }

        let mut certificates = parse_pem_certificates(cert_pem)?;
        let key = parse_pem_private_key(key_pem, password)?;

        let leaf = certificates.remove(0);
        if !certificate_matches_key(&leaf, &key) {
            return Err(MachOSignError::SigningMaterial(
                "private key does not match the signing certificate".to_string(),
            ));
        }

        Ok(Self {
            signing_key: Some((key, leaf)),
            certificate_chain: certificates,
            ..Self::ad_hoc()
        })
    }

    /// Construct from PKCS#12 (`.p12`) data.
    pub fn from_p12(data: impl AsRef<[u8]>, password: &str) -> Result<Self, MachOSignError> {
        let (cert, key, chain) = parse_pfx_data(data.as_ref(), password)?;

        Ok(Self {
            signing_key: Some((key, cert)),
            certificate_chain: chain,
            ..Self::ad_hoc()
        })
    }

    /// Set the code directory identifier. Empty values are ignored.
    #[must_use]
    pub fn with_identity(mut self, identity: impl Into<String>) -> Self {
        let identity = identity.into();
        if !identity.is_empty() {
            self.identity = Some(identity);
        }

        self
    }

    /// Set the RFC 3161 time-stamp server, or clear it with `"none"`.
    pub fn with_timestamp_server(mut self, url: &str) -> Result<Self, MachOSignError> {
        if url.is_empty() || url == NO_TIMESTAMP_SERVER {
            self.timestamp_url = None;
        } else {
            self.timestamp_url = Some(Url::parse(url).map_err(|e| {
                MachOSignError::SigningMaterial(format!(
                    "invalid time-stamp server URL {}: {}",
                    url, e
                ))
            })?);
        }

        Ok(self)
    }

    #[must_use]
    pub fn with_timestamp_policy(mut self, policy: TimestampPolicy) -> Self {
        self.timestamp_policy = policy;
        self
    }

    /// Embed entitlements, given as an XML plist holding a dictionary.
    pub fn with_entitlements(mut self, xml: impl Into<String>) -> Result<Self, MachOSignError> {
        let xml = xml.into();

        let value = plist::Value::from_reader_xml(xml.as_bytes()).map_err(|e| {
            MachOSignError::SigningMaterial(format!("entitlements are not a valid plist: {}", e))
        })?;
        if value.as_dictionary().is_none() {
            return Err(MachOSignError::SigningMaterial(
                "entitlements plist must be a dictionary".to_string(),
            ));
        }

        self.entitlements = Some(xml);

        Ok(self)
    }

    pub fn with_digest_type(mut self, digest_type: DigestType) -> Result<Self, MachOSignError> {
        if let DigestType::Unknown(_) = digest_type {
            return Err(MachOSignError::DigestUnknownAlgorithm);
        }
        self.digest_type = digest_type;

        Ok(self)
    }

    pub fn identity(&self) -> Option<&str> {
        self.identity.as_deref()
    }

    /// The signing key and its certificate, if not ad-hoc.
    pub fn signing_key(&self) -> Option<(&InMemorySigningKeyPair, &CapturedX509Certificate)> {
        self.signing_key.as_ref().map(|(key, cert)| (key, cert))
    }

    /// Certificates beyond the signing certificate, ordered towards the root.
    pub fn certificate_chain(&self) -> &[CapturedX509Certificate] {
        &self.certificate_chain
    }

    pub fn timestamp_url(&self) -> Option<&Url> {
        self.timestamp_url.as_ref()
    }

    pub fn timestamp_policy(&self) -> &TimestampPolicy {
        &self.timestamp_policy
    }

    pub fn digest_type(&self) -> DigestType {
        self.digest_type
    }

    pub fn entitlements(&self) -> Option<&str> {
        self.entitlements.as_deref()
    }

    pub fn is_ad_hoc(&self) -> bool {
        self.signing_key.is_none()
    }

    /// Sanity check the key material before any binary is modified.
    ///
    /// Only verifies that the key and certificate are present and paired.
    /// Chain of trust and extended key usage are not evaluated.
    pub fn validate_certificate_material(&self) -> Result<(), MachOSignError> {
        match &self.signing_key {
            Some((key, cert)) => {
                if !certificate_matches_key(cert, key) {
                    return Err(MachOSignError::SigningMaterial(
                        "private key does not match the signing certificate".to_string(),
                    ));
                }

                if let Ok(subject) = cert.subject_name().user_friendly_str() {
                    info!("signing with certificate {}", subject);
                }
                warn!("certificate chain of trust and extended key usage are not verified");
            }
            None => {
                warn!("no signing certificate configured; producing an ad-hoc signature");
            }
        }

        Ok(())
    }
}

/// A binary path plus the material to sign it with.
#[derive(Debug)]
pub struct SigningConfig {
    path: PathBuf,
    material: SigningMaterial,
}

impl SigningConfig {
    pub fn new(path: impl AsRef<Path>, material: SigningMaterial) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
            material,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn material(&self) -> &SigningMaterial {
        &self.material
    }

    /// The code directory identifier.
    ///
    /// Defaults to the file name of the binary.
    pub fn identity(&self) -> String {
        match self.material.identity() {
            Some(identity) => identity.to_string(),
            None => self
                .path
                .file_name()
                .map(|name| name.to_string_lossy().to_string())
                .unwrap_or_default(),
        }
    }

    #[must_use]
    pub fn with_identity(mut self, identity: impl Into<String>) -> Self {
        self.material = self.material.with_identity(identity);
        self
    }

    pub fn with_timestamp_server(mut self, url: &str) -> Result<Self, MachOSignError> {
        self.material = self.material.with_timestamp_server(url)?;
        Ok(self)
    }
}
