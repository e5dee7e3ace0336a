// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

use thiserror::Error;

/// Unified error type for Mach-O signing.
///
/// Variants fall into a small taxonomy: malformed input (`Format`), structural
/// edits that would break the binary's layout (`Layout` and friends), failures
/// writing bytes (`Patch` and `Io`), bad certificates or keys
/// (`SigningMaterial`) and time-stamp authority failures (`Timestamp`).
#[derive(Debug, Error)]
pub enum MachOSignError {
    #[error("unknown command")]
    CliUnknownCommand,

    #[error("bad argument: {0}")]
    CliBadArgument(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("binary data error: {0}")]
    Scroll(#[from] scroll::Error),

    #[error("invalid Mach-O binary: {0}")]
    Format(String),

    #[error("invalid binary layout: {0}")]
    Layout(String),

    #[error("insufficient room to write code signature load command")]
    LoadCommandNoRoom,

    #[error("__LINKEDIT segment not found")]
    MissingLinkedit,

    #[error("signature data ({size} bytes) exceeds reserved space ({reserved} bytes)")]
    SignatureDataTooLarge { size: usize, reserved: usize },

    #[error("failed to patch {length} bytes at offset {offset}: {reason}")]
    Patch {
        offset: usize,
        length: usize,
        reason: &'static str,
    },

    #[error("{0} not found")]
    NotFound(&'static str),

    #[error("signing material error: {0}")]
    SigningMaterial(String),

    #[error("bad PKCS#12 password")]
    PfxBadPassword,

    #[error("time-stamp authority error: {0}")]
    Timestamp(String),

    #[error("unknown digest algorithm")]
    DigestUnknownAlgorithm,

    #[error("bad magic value in {0}")]
    BadMagic(&'static str),

    #[error("SuperBlob data is malformed")]
    SuperblobMalformed,

    #[error("code directory identifier is malformed")]
    CodeDirectoryMalformedIdentifier,
}

impl MachOSignError {
    /// Whether this error means the input was not a usable Mach-O binary.
    pub fn is_format(&self) -> bool {
        matches!(self, Self::Format(_))
    }

    /// Whether this error came from a structural edit violating layout invariants.
    pub fn is_layout(&self) -> bool {
        matches!(
            self,
            Self::Layout(_)
                | Self::LoadCommandNoRoom
                | Self::MissingLinkedit
                | Self::SignatureDataTooLarge { .. }
        )
    }

    /// Whether this error came from the certificate or key material.
    pub fn is_signing_material(&self) -> bool {
        matches!(self, Self::SigningMaterial(_) | Self::PfxBadPassword)
    }
}

impl From<x509_certificate::X509CertificateError> for MachOSignError {
    fn from(e: x509_certificate::X509CertificateError) -> Self {
        Self::SigningMaterial(format!("X.509 certificate error: {}", e))
    }
}

impl From<pem::PemError> for MachOSignError {
    fn from(e: pem::PemError) -> Self {
        Self::SigningMaterial(format!("PEM error: {}", e))
    }
}
