// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

/*! High level signing of Mach-O binaries.

Signing has a circular dependency. The code directory digests the load
commands, but `LC_CODE_SIGNATURE` and `__LINKEDIT` must describe the size of
the signature containing that code directory. We break the cycle with two
passes. The first pass measures a signature built against a placeholder
command. Space for that size plus signer specific slack is then reserved,
and the second pass builds the final signature against the finalized load
commands and pads it to the reservation.

[MachOSigner] walks through these steps as an explicit state machine. Every
step operates on an in-memory copy of the binary. Nothing is written to
disk until [MachOSigner::save].
*/

use {
    crate::{
        cms::{signer_for_material, CodeDirectorySigner},
        error::MachOSignError,
        macho::MachOBinary,
        signing_material::SigningConfig,
        superblob_builder::SuperBlobBuilder,
    },
    log::{debug, info, warn},
    std::path::Path,
};

/// Progress of a [MachOSigner] session.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum SigningState {
    /// Binary is loaded and untouched.
    Unsigned,
    /// Any prior signature and its load command are gone.
    SignatureStripped,
    /// A zeroed `LC_CODE_SIGNATURE` command exists.
    PlaceholderInserted,
    /// The first pass signature size is known.
    Sized,
    /// `LC_CODE_SIGNATURE` and `__LINKEDIT` describe the reserved range.
    OffsetsFinalized,
    /// The final signature is built and padded.
    Sealed,
    /// The signature is written into the in-memory binary.
    Patched,
    /// The binary is saved.
    Done,
}

impl std::fmt::Display for SigningState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            Self::Unsigned => "unsigned",
            Self::SignatureStripped => "signature stripped",
            Self::PlaceholderInserted => "placeholder inserted",
            Self::Sized => "sized",
            Self::OffsetsFinalized => "offsets finalized",
            Self::Sealed => "sealed",
            Self::Patched => "patched",
            Self::Done => "done",
        })
    }
}

/// A signing session for a single Mach-O binary.
pub struct MachOSigner<'a> {
    config: &'a SigningConfig,
    identity: String,
    signer: Box<dyn CodeDirectorySigner + 'a>,
    binary: MachOBinary,
    state: SigningState,
    estimated_size: usize,
    reserved_size: usize,
    signature_size: usize,
    signature: Vec<u8>,
}

impl<'a> MachOSigner<'a> {
    /// Begin a session by loading the binary at the configured path.
    ///
    /// Signing material is validated before the binary is read.
    pub fn new(config: &'a SigningConfig) -> Result<Self, MachOSignError> {
        config.material().validate_certificate_material()?;

        info!("loading Mach-O binary {}", config.path().display());
        let binary = MachOBinary::load(config.path())?;

        Ok(Self::from_parts(config, binary))
    }

    fn from_parts(config: &'a SigningConfig, binary: MachOBinary) -> Self {
        Self {
            config,
            identity: config.identity(),
            signer: signer_for_material(config.material()),
            binary,
            state: SigningState::Unsigned,
            estimated_size: 0,
            reserved_size: 0,
            signature_size: 0,
            signature: vec![],
        }
    }

    pub fn state(&self) -> SigningState {
        self.state
    }

    pub fn binary(&self) -> &MachOBinary {
        &self.binary
    }

    /// The code directory identifier in use.
    pub fn identity(&self) -> &str {
        &self.identity
    }

    /// Signature size measured by the first pass.
    pub fn estimated_size(&self) -> usize {
        self.estimated_size
    }

    /// Bytes reserved for the signature in the binary.
    pub fn reserved_size(&self) -> usize {
        self.reserved_size
    }

    /// Unpadded size of the final signature.
    pub fn signature_size(&self) -> usize {
        self.signature_size
    }

    fn require(&self, step: &str, allowed: &[SigningState]) -> Result<(), MachOSignError> {
        if allowed.contains(&self.state) {
            Ok(())
        } else {
            Err(MachOSignError::Layout(format!(
                "cannot {} when {}",
                step, self.state
            )))
        }
    }

    fn advance(&mut self, next: SigningState) {
        debug!("signing state {} -> {}", self.state, next);
        self.state = next;
    }

    /// Remove any existing signature and its load command.
    pub fn strip_signature(&mut self) -> Result<(), MachOSignError> {
        self.require("strip signature", &[SigningState::Unsigned])?;

        if self.binary.has_code_signature() {
            info!("removing existing code signature");
        }
        let original_len = self.binary.data().len();
        self.binary.remove_existing_signature()?;
        debug!(
            "binary is {} bytes after strip ({} before)",
            self.binary.data().len(),
            original_len
        );

        self.advance(SigningState::SignatureStripped);
        Ok(())
    }

    /// Add a zeroed `LC_CODE_SIGNATURE` command.
    ///
    /// May directly follow loading when the binary carries no signature.
    pub fn insert_placeholder(&mut self) -> Result<(), MachOSignError> {
        if self.binary.has_code_signature() {
            self.require("insert placeholder", &[SigningState::SignatureStripped])?;
        } else {
            self.require(
                "insert placeholder",
                &[SigningState::Unsigned, SigningState::SignatureStripped],
            )?;
        }

        self.binary.insert_empty_code_signature_command()?;

        self.advance(SigningState::PlaceholderInserted);
        Ok(())
    }

    /// First pass: measure the signature against the placeholder command.
    pub fn estimate(&mut self) -> Result<usize, MachOSignError> {
        self.require("estimate signature size", &[SigningState::PlaceholderInserted])?;

        let (size, _) = SuperBlobBuilder::build(
            &self.identity,
            &self.binary,
            self.config.material(),
            0,
        )?;
        info!("estimated signature size: {} bytes", size);
        self.estimated_size = size;

        self.advance(SigningState::Sized);

        Ok(size)
    }

    /// Reserve space at end of file and point the load commands at it.
    pub fn finalize_offsets(&mut self) -> Result<(), MachOSignError> {
        self.require("finalize offsets", &[SigningState::Sized])?;

        let reserved = self.estimated_size + self.signer.size_slack();
        let dataoff = self.binary.data().len();

        let to_u32 = |value: usize, what: &str| {
            u32::try_from(value).map_err(|_| {
                MachOSignError::Layout(format!("{} {} does not fit in 32 bits", what, value))
            })
        };

        debug!(
            "reserving {} bytes for signature at offset {}",
            reserved, dataoff
        );
        self.binary.set_code_signature_offsets(
            to_u32(dataoff, "signature offset")?,
            to_u32(reserved, "signature size")?,
        )?;
        self.reserved_size = reserved;

        self.advance(SigningState::OffsetsFinalized);
        Ok(())
    }

    /// Second pass: build the final signature padded to the reservation.
    pub fn seal(&mut self) -> Result<(), MachOSignError> {
        self.require("seal signature", &[SigningState::OffsetsFinalized])?;

        let (size, data) = SuperBlobBuilder::build(
            &self.identity,
            &self.binary,
            self.config.material(),
            self.reserved_size,
        )?;
        info!("total signature size: {} bytes", size);
        if size != self.estimated_size {
            debug!(
                "final signature size differs from estimate by {} bytes",
                size as isize - self.estimated_size as isize
            );
        }

        self.signature_size = size;
        self.signature = data;

        self.advance(SigningState::Sealed);
        Ok(())
    }

    /// Write the sealed signature into the reserved range.
    pub fn patch(&mut self) -> Result<(), MachOSignError> {
        self.require("patch signature", &[SigningState::Sealed])?;

        let (command, _) = self.binary.code_signature_command()?;
        let signature = std::mem::take(&mut self.signature);
        self.binary
            .patch_bytes(&signature, command.dataoff as usize)?;

        self.advance(SigningState::Patched);
        Ok(())
    }

    /// Write the signed binary to `path`.
    pub fn save(&mut self, path: impl AsRef<Path>) -> Result<(), MachOSignError> {
        self.require("save binary", &[SigningState::Patched])?;

        let path = path.as_ref();
        info!("writing signed binary to {}", path.display());
        self.binary.save(path)?;

        self.advance(SigningState::Done);
        Ok(())
    }

    /// Run every step, writing to `output` or back to the input path.
    pub fn sign(&mut self, output: Option<&Path>) -> Result<(), MachOSignError> {
        if self.binary.has_code_signature() {
            self.strip_signature()?;
        }
        self.insert_placeholder()?;
        self.estimate()?;
        self.finalize_offsets()?;
        self.seal()?;
        self.patch()?;

        let config = self.config;
        self.save(output.unwrap_or_else(|| config.path()))
    }
}

/// Sign the binary described by `config`.
///
/// The result is written to `output` when given, else in place.
pub fn sign_path(config: &SigningConfig, output: Option<&Path>) -> Result<(), MachOSignError> {
    if config.material().is_ad_hoc() && config.material().timestamp_url().is_some() {
        warn!("time-stamp server ignored for ad-hoc signature");
    }

    MachOSigner::new(config)?.sign(output)
}
