// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

/*! Signing of code directories.

A [CodeDirectorySigner] turns a code directory into the payload of the
signature slot. Ad-hoc signing produces nothing. CMS signing produces a
detached `SignedData` over the serialized code directory carrying Apple's
CDHash attributes and optionally a time-stamp token.
*/

use {
    crate::{
        code_directory::CodeDirectoryBlob,
        embedded_signature::{Blob, DigestType},
        error::MachOSignError,
        signing_material::{SigningMaterial, TimestampPolicy},
    },
    bcder::{
        encode::{self, PrimitiveContent},
        Captured, Mode, OctetString, Oid,
    },
    cryptographic_message_syntax::{asn1::rfc5652::OID_ID_DATA, SignedDataBuilder, SignerBuilder},
    log::{info, warn},
    reqwest::Url,
    x509_certificate::{rfc5652::AttributeValue, CapturedX509Certificate, InMemorySigningKeyPair},
};

/// OID 1.2.840.113635.100.9.1. A plist listing code directory hashes.
const CDHASH_PLIST_OID: &[u8] = &[0x2a, 0x86, 0x48, 0x86, 0xf7, 0x63, 0x64, 0x09, 0x01];

/// OID 1.2.840.113635.100.9.2. Digest algorithm plus full code directory hash.
const CDHASH_DIGEST_OID: &[u8] = &[0x2a, 0x86, 0x48, 0x86, 0xf7, 0x63, 0x64, 0x09, 0x02];

const OID_SHA1: &[u8] = &[0x2b, 0x0e, 0x03, 0x02, 0x1a];
const OID_SHA256: &[u8] = &[0x60, 0x86, 0x48, 0x01, 0x65, 0x03, 0x04, 0x02, 0x01];
const OID_SHA384: &[u8] = &[0x60, 0x86, 0x48, 0x01, 0x65, 0x03, 0x04, 0x02, 0x02];

/// Extra reservation for time-stamped signatures.
const TIMESTAMP_SIZE_SLACK: usize = 1024;

/// Hashes in the CDHash plist are truncated to this length.
const CDHASH_PLIST_DIGEST_LENGTH: usize = 20;

/// Produces the signature slot payload for a code directory.
pub trait CodeDirectorySigner {
    /// Sign a code directory.
    ///
    /// Returns `None` when the signature slot should hold an empty wrapper.
    fn sign(&self, code_directory: &CodeDirectoryBlob) -> Result<Option<Vec<u8>>, MachOSignError>;

    /// Extra bytes to reserve beyond the first size estimate.
    ///
    /// Covers variance between two signing passes, such as differing
    /// time-stamp token sizes.
    fn size_slack(&self) -> usize;

    /// Whether signatures from this signer are ad-hoc.
    fn is_ad_hoc(&self) -> bool;
}

/// Signer for ad-hoc signatures.
#[derive(Clone, Copy, Debug, Default)]
pub struct AdHocSigner;

impl CodeDirectorySigner for AdHocSigner {
    fn sign(&self, _: &CodeDirectoryBlob) -> Result<Option<Vec<u8>>, MachOSignError> {
        Ok(None)
    }

    fn size_slack(&self) -> usize {
        0
    }

    fn is_ad_hoc(&self) -> bool {
        true
    }
}

/// Certificate backed CMS signer.
pub struct CmsSigner<'a> {
    signing_key: &'a InMemorySigningKeyPair,
    signing_cert: &'a CapturedX509Certificate,
    certificate_chain: &'a [CapturedX509Certificate],
    timestamp_url: Option<&'a Url>,
    timestamp_policy: TimestampPolicy,
}

/// Select the signer implementation for signing material.
pub fn signer_for_material(material: &SigningMaterial) -> Box<dyn CodeDirectorySigner + '_> {
    match material.signing_key() {
        Some((signing_key, signing_cert)) => Box::new(CmsSigner {
            signing_key,
            signing_cert,
            certificate_chain: material.certificate_chain(),
            timestamp_url: material.timestamp_url(),
            timestamp_policy: *material.timestamp_policy(),
        }),
        None => Box::new(AdHocSigner),
    }
}

fn digest_oid(digest_type: DigestType) -> Result<&'static [u8], MachOSignError> {
    match digest_type {
        DigestType::Sha1 => Ok(OID_SHA1),
        DigestType::Sha256 => Ok(OID_SHA256),
        DigestType::Sha384 => Ok(OID_SHA384),
        DigestType::Unknown(_) => Err(MachOSignError::DigestUnknownAlgorithm),
    }
}

/// The XML plist `{ cdhashes: [<data>] }` with the truncated code directory hash.
pub fn cdhash_plist(cdhash: &[u8]) -> Result<Vec<u8>, MachOSignError> {
    let truncated = &cdhash[..cdhash.len().min(CDHASH_PLIST_DIGEST_LENGTH)];

    let mut dict = plist::Dictionary::new();
    dict.insert(
        "cdhashes".to_string(),
        plist::Value::Array(vec![plist::Value::Data(truncated.to_vec())]),
    );

    let mut data = Vec::new();
    plist::Value::Dictionary(dict)
        .to_writer_xml(&mut data)
        .map_err(|e| MachOSignError::SigningMaterial(format!("plist encoding failed: {}", e)))?;
    data.push(b'\n');

    Ok(data)
}

/// DER `SEQUENCE { OBJECT IDENTIFIER, OCTET STRING }` for the CDHash digest attribute.
fn cdhash_digest_attribute(
    digest_type: DigestType,
    cdhash: &[u8],
) -> Result<AttributeValue, MachOSignError> {
    let oid: Oid = Oid(digest_oid(digest_type)?.into());

    Ok(AttributeValue::new(Captured::from_values(
        Mode::Der,
        encode::sequence((oid.encode_ref(), OctetString::encode_slice(cdhash))),
    )))
}

impl<'a> CmsSigner<'a> {
    fn signer_builder(
        &self,
        code_directory: &CodeDirectoryBlob,
    ) -> Result<SignerBuilder<'a>, MachOSignError> {
        let cd_data = code_directory.to_blob_bytes()?;
        let cdhash = code_directory.digest_with(code_directory.hash_type)?;

        Ok(SignerBuilder::new(self.signing_key, self.signing_cert.clone())
            .message_id_content(cd_data)
            .signed_attribute_octet_string(
                Oid(CDHASH_PLIST_OID.into()),
                &cdhash_plist(&cdhash)?,
            )
            .signed_attribute(
                Oid(CDHASH_DIGEST_OID.into()),
                vec![cdhash_digest_attribute(code_directory.hash_type, &cdhash)?],
            ))
    }

    fn build(&self, signer: SignerBuilder<'a>) -> Result<Vec<u8>, cryptographic_message_syntax::CmsError> {
        SignedDataBuilder::default()
            .content_type(Oid(OID_ID_DATA.as_ref().into()))
            .signer(signer)
            .certificates(self.certificate_chain.iter().cloned())
            .build_der()
    }

    fn sign_with_timestamp(
        &self,
        signer: SignerBuilder<'a>,
        url: &Url,
    ) -> Result<Vec<u8>, MachOSignError> {
        let signer = signer.time_stamp_url(url.clone()).map_err(|e| {
            MachOSignError::Timestamp(format!("bad time-stamp server {}: {}", url, e))
        })?;

        let attempts = self.timestamp_policy.attempts.max(1);
        let mut last_error = String::new();

        for attempt in 0..attempts {
            match self.build(signer.clone()) {
                Ok(data) => return Ok(data),
                Err(e) => {
                    last_error = e.to_string();

                    if attempt + 1 < attempts {
                        let delay = self.timestamp_policy.backoff_after(attempt);
                        warn!(
                            "time-stamp request to {} failed ({}); retrying in {:?}",
                            url, last_error, delay
                        );
                        std::thread::sleep(delay);
                    }
                }
            }
        }

        Err(MachOSignError::Timestamp(format!(
            "{} after {} attempts: {}",
            url, attempts, last_error
        )))
    }
}

impl<'a> CodeDirectorySigner for CmsSigner<'a> {
    fn sign(&self, code_directory: &CodeDirectoryBlob) -> Result<Option<Vec<u8>>, MachOSignError> {
        let signer = self.signer_builder(code_directory)?;

        // A build without time-stamping isolates key and certificate problems
        // from time-stamp server failures.
        let data = self.build(signer.clone()).map_err(|e| {
            MachOSignError::SigningMaterial(format!("CMS signing failed: {}", e))
        })?;

        match self.timestamp_url {
            Some(url) => {
                info!("using time-stamp server {}", url);
                Ok(Some(self.sign_with_timestamp(signer, url)?))
            }
            None => Ok(Some(data)),
        }
    }

    /// Time-stamp tokens vary in size between requests. Without one the
    /// CMS size is stable across passes.
    fn size_slack(&self) -> usize {
        if self.timestamp_url.is_some() {
            TIMESTAMP_SIZE_SLACK
        } else {
            0
        }
    }

    fn is_ad_hoc(&self) -> bool {
        false
    }
}
