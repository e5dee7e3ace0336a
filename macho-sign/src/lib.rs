// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Embedded code signatures for Mach-O binaries.
//!
//! This crate attaches an Apple code signature to a single-architecture
//! Mach-O binary without relying on Apple tooling. It can run on Linux,
//! Windows or any other platform Rust targets.
//!
//! # Features and Capabilities
//!
//! This crate can:
//!
//! * Parse Mach-O load commands and perform the structural edits signing
//!   needs: stripping an existing signature, inserting `LC_CODE_SIGNATURE`,
//!   and growing `__LINKEDIT`. (See [MachOBinary].)
//! * Build the embedded signature SuperBlob: a code directory of page
//!   hashes, an empty requirements set, optional entitlements and a signature
//!   blob. (See [SuperBlobBuilder] and [CodeDirectoryBlob].)
//! * Produce ad-hoc signatures or RFC 5652 CMS signatures carrying Apple's
//!   CDHash attributes, optionally time-stamped through an RFC 3161 server.
//!   (See [CodeDirectorySigner].)
//! * Load signing certificates and keys from PEM or PKCS#12 (`.p12`) data.
//!   (See [SigningMaterial].)
//! * Parse existing embedded signatures. (See [EmbeddedSignature].)
//!
//! Fat (universal) binaries, bundles, notarization and validation of the
//! certificate's chain of trust are not supported.
//!
//! # Getting Started
//!
//! The [MachOSigner] type drives signing of a binary described by a
//! [SigningConfig]. [sign_path] runs every step at once.

mod cms;
pub use cms::*;
mod code_directory;
pub use code_directory::*;
mod code_hash;
pub use code_hash::*;
mod cryptography;
pub use cryptography::*;
pub mod embedded_signature;
pub use embedded_signature::*;
mod error;
pub use error::*;
mod macho;
pub use macho::*;
mod signing;
pub use signing::*;
mod signing_material;
pub use signing_material::*;
mod superblob_builder;
pub use superblob_builder::*;

#[cfg(test)]
mod testutil;
