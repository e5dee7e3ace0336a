// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Loading of certificates and private keys from PEM and PKCS#12 data.

use {
    crate::error::MachOSignError,
    pkcs1::DecodeRsaPrivateKey,
    rsa::pkcs8::EncodePrivateKey,
    x509_certificate::{CapturedX509Certificate, InMemorySigningKeyPair, Sign},
};

fn bmp_string(s: &str) -> Vec<u8> {
    let utf16: Vec<u16> = s.encode_utf16().collect();

    let mut bytes = Vec::with_capacity(utf16.len() * 2 + 2);
    for c in utf16 {
        bytes.push((c / 256) as u8);
        bytes.push((c % 256) as u8);
    }
    bytes.push(0x00);
    bytes.push(0x00);

    bytes
}

fn pfx_error(message: impl std::fmt::Display) -> MachOSignError {
    MachOSignError::SigningMaterial(format!("PKCS#12 error: {}", message))
}

/// Whether a certificate holds the public half of a signing key.
pub fn certificate_matches_key(
    cert: &CapturedX509Certificate,
    key: &InMemorySigningKeyPair,
) -> bool {
    cert.public_key_data() == key.public_key_data()
}

/// Split certificates into the one matching `key` and the remainder.
///
/// The remainder keeps its original order.
fn partition_leaf(
    certificates: Vec<CapturedX509Certificate>,
    key: &InMemorySigningKeyPair,
) -> Result<(CapturedX509Certificate, Vec<CapturedX509Certificate>), MachOSignError> {
    let position = certificates
        .iter()
        .position(|cert| certificate_matches_key(cert, key))
        .ok_or_else(|| {
            MachOSignError::SigningMaterial(
                "no certificate matches the private key".to_string(),
            )
        })?;

    let mut chain = certificates;
    let leaf = chain.remove(position);

    Ok((leaf, chain))
}

/// Parse PFX data into a signing certificate, key pair and certificate chain.
///
/// Keychain exports and most CA tooling produce this format. Files exported
/// without a password still need the empty string here.
pub fn parse_pfx_data(
    data: &[u8],
    password: &str,
) -> Result<
    (
        CapturedX509Certificate,
        InMemorySigningKeyPair,
        Vec<CapturedX509Certificate>,
    ),
    MachOSignError,
> {
    let pfx = p12::PFX::parse(data)
        .map_err(|e| pfx_error(format!("data does not appear to be PFX: {:?}", e)))?;

    if !pfx.verify_mac(password) {
        return Err(MachOSignError::PfxBadPassword);
    }

    let data = match pfx.auth_safe {
        p12::ContentInfo::Data(data) => data,
        _ => {
            return Err(pfx_error("unexpected PFX content info"));
        }
    };

    let content_infos = yasna::parse_der(&data, |reader| {
        reader.collect_sequence_of(p12::ContentInfo::parse)
    })
    .map_err(|e| pfx_error(format!("failed parsing inner ContentInfo: {:?}", e)))?;

    let bmp_password = bmp_string(password);

    let mut certificates = vec![];
    let mut signing_key = None;

    for content in content_infos {
        let bags_data = match content {
            p12::ContentInfo::Data(inner) => inner,
            p12::ContentInfo::EncryptedData(encrypted) => encrypted
                .data(&bmp_password)
                .ok_or_else(|| pfx_error("failed decrypting inner EncryptedData"))?,
            p12::ContentInfo::OtherContext(_) => {
                return Err(pfx_error("unexpected OtherContent content in inner PFX data"));
            }
        };

        let bags = yasna::parse_ber(&bags_data, |reader| {
            reader.collect_sequence_of(p12::SafeBag::parse)
        })
        .map_err(|e| pfx_error(format!("failed parsing SafeBag within inner Data: {:?}", e)))?;

        for bag in bags {
            match bag.bag {
                p12::SafeBagKind::CertBag(p12::CertBag::X509(cert_data)) => {
                    certificates.push(CapturedX509Certificate::from_der(cert_data)?);
                }
                p12::SafeBagKind::CertBag(p12::CertBag::SDSI(_)) => {
                    return Err(pfx_error("unexpected SDSI certificate data"));
                }
                p12::SafeBagKind::Pkcs8ShroudedKeyBag(key_bag) => {
                    let decrypted = key_bag.decrypt(&bmp_password).ok_or_else(|| {
                        pfx_error("error decrypting PKCS8 shrouded key bag; is the password correct?")
                    })?;

                    signing_key = Some(InMemorySigningKeyPair::from_pkcs8_der(&decrypted)?);
                }
                p12::SafeBagKind::OtherBagKind(_) => {
                    return Err(pfx_error("unexpected bag type in inner PFX content"));
                }
            }
        }
    }

    let signing_key = signing_key.ok_or_else(|| pfx_error("failed to find signing key"))?;

    if certificates.is_empty() {
        return Err(pfx_error("failed to find x509 certificate"));
    }

    let (leaf, chain) = partition_leaf(certificates, &signing_key)?;

    Ok((leaf, signing_key, chain))
}

/// Parse all `CERTIFICATE` blocks from PEM data, in order of appearance.
pub fn parse_pem_certificates(
    data: impl AsRef<[u8]>,
) -> Result<Vec<CapturedX509Certificate>, MachOSignError> {
    let certificates = CapturedX509Certificate::from_pem_multiple(data)?;

    if certificates.is_empty() {
        Err(MachOSignError::SigningMaterial(
            "no CERTIFICATE blocks found in PEM data".to_string(),
        ))
    } else {
        Ok(certificates)
    }
}

/// Parse a private key from PEM data.
///
/// Supported encodings are unencrypted PKCS#8 (`PRIVATE KEY`), password
/// protected PKCS#8 (`ENCRYPTED PRIVATE KEY`) and PKCS#1 RSA keys
/// (`RSA PRIVATE KEY`).
pub fn parse_pem_private_key(
    data: impl AsRef<[u8]>,
    password: Option<&str>,
) -> Result<InMemorySigningKeyPair, MachOSignError> {
    let doc = pem::parse(data.as_ref())?;

    match doc.tag.as_str() {
        "PRIVATE KEY" => Ok(InMemorySigningKeyPair::from_pkcs8_der(&doc.contents)?),
        "ENCRYPTED PRIVATE KEY" => {
            let password = password.ok_or_else(|| {
                MachOSignError::SigningMaterial(
                    "encrypted private key requires a password".to_string(),
                )
            })?;

            let info = pkcs8::EncryptedPrivateKeyInfo::try_from(doc.contents.as_slice())
                .map_err(|e| {
                    MachOSignError::SigningMaterial(format!(
                        "malformed encrypted private key: {}",
                        e
                    ))
                })?;
            let decrypted = info.decrypt(password).map_err(|e| {
                MachOSignError::SigningMaterial(format!(
                    "unable to decrypt private key; is the password correct? ({})",
                    e
                ))
            })?;

            Ok(InMemorySigningKeyPair::from_pkcs8_der(decrypted.as_ref())?)
        }
        "RSA PRIVATE KEY" => {
            let key = rsa::RsaPrivateKey::from_pkcs1_der(&doc.contents).map_err(|e| {
                MachOSignError::SigningMaterial(format!("malformed PKCS#1 RSA key: {}", e))
            })?;
            let der = key.to_pkcs8_der().map_err(|e| {
                MachOSignError::SigningMaterial(format!("unable to convert RSA key: {}", e))
            })?;

            Ok(InMemorySigningKeyPair::from_pkcs8_der(der.as_ref())?)
        }
        tag => Err(MachOSignError::SigningMaterial(format!(
            "unsupported PEM private key type: {}",
            tag
        ))),
    }
}
