// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

/*! Construction of embedded signature data.

The embedded signature is a SuperBlob holding a code directory, the special
blobs it digests (requirements and optionally entitlements) and a blob
wrapper carrying the CMS signature over the code directory.

Blobs are registered in a fixed order. Special blobs come first so their
digests can be recorded in the code directory. The code directory follows,
and the signature over it comes last.
*/

use {
    crate::{
        cms::{signer_for_material, CodeDirectorySigner},
        code_directory::{
            CodeDirectoryBlob, CodeDirectoryVersion, CodeSignatureFlags, ExecutableSegmentFlags,
        },
        code_hash::{paged_digests, CODE_PAGE_SIZE},
        embedded_signature::{
            create_superblob, Blob, BlobWrapperBlob, CodeSigningMagic, CodeSigningSlot,
            EntitlementsBlob, RequirementSetBlob,
        },
        error::MachOSignError,
        macho::MachOBinary,
        signing_material::SigningMaterial,
    },
    log::{debug, info},
    std::collections::{BTreeMap, HashMap},
};

#[derive(Clone, Copy, Debug, PartialEq)]
enum BlobsState {
    Empty,
    SpecialAdded,
    CodeDirectoryAdded,
    SignatureAdded,
}

impl Default for BlobsState {
    fn default() -> Self {
        Self::Empty
    }
}

/// Incrementally assembles the blobs of an embedded signature.
#[derive(Debug, Default)]
pub struct SuperBlobBuilder {
    state: BlobsState,
    blobs: BTreeMap<CodeSigningSlot, Vec<u8>>,
    code_directory: Option<CodeDirectoryBlob>,
}

impl SuperBlobBuilder {
    /// Build the embedded signature for a binary.
    ///
    /// Code pages over `[0, binary.code_limit())` are hashed. When `size_hint`
    /// is 0 the SuperBlob is returned at its exact size. Otherwise it is zero
    /// padded to exactly `size_hint` bytes, or rejected if it does not fit.
    ///
    /// Returns the unpadded SuperBlob size alongside the (possibly padded)
    /// bytes.
    pub fn build(
        identity: &str,
        binary: &MachOBinary,
        material: &SigningMaterial,
        size_hint: usize,
    ) -> Result<(usize, Vec<u8>), MachOSignError> {
        let signer = signer_for_material(material);

        let mut builder = Self::default();

        builder.add_blob(
            CodeSigningSlot::RequirementSet,
            RequirementSetBlob::empty().to_blob_bytes()?,
        )?;

        if let Some(xml) = material.entitlements() {
            builder.add_blob(
                CodeSigningSlot::Entitlements,
                EntitlementsBlob::from_string(xml).to_blob_bytes()?,
            )?;
        }

        let code_directory = create_code_directory(identity, binary, material, signer.as_ref())?;
        let code_directory = builder.add_code_directory(code_directory)?;
        debug!(
            "code directory for {} covers {} pages",
            code_directory.ident,
            code_directory.code_hashes.len()
        );

        let signature = signer.sign(code_directory)?.unwrap_or_default();
        if !signature.is_empty() {
            info!("CMS signature is {} bytes", signature.len());
        }
        builder.add_signature(signature)?;

        let mut data = builder.create_superblob()?;
        let size = data.len();

        if size_hint != 0 {
            if size > size_hint {
                return Err(MachOSignError::SignatureDataTooLarge {
                    size,
                    reserved: size_hint,
                });
            }

            data.resize(size_hint, 0);
        }

        Ok((size, data))
    }

    /// The registered code directory, if any.
    pub fn code_directory(&self) -> Option<&CodeDirectoryBlob> {
        self.code_directory.as_ref()
    }

    /// Register serialized blob data into a special slot.
    ///
    /// Last write wins. Blobs cannot be added once a code directory exists,
    /// since its special slot digests would go stale.
    pub fn add_blob(&mut self, slot: CodeSigningSlot, data: Vec<u8>) -> Result<(), MachOSignError> {
        match self.state {
            BlobsState::Empty | BlobsState::SpecialAdded => {}
            BlobsState::CodeDirectoryAdded | BlobsState::SignatureAdded => {
                return Err(MachOSignError::Format(
                    "cannot add blobs after the code directory is registered".into(),
                ));
            }
        }

        if matches!(
            slot,
            CodeSigningSlot::CodeDirectory | CodeSigningSlot::Signature
        ) {
            return Err(MachOSignError::Format(format!(
                "slot {:?} cannot be registered as a special blob",
                slot
            )));
        }

        self.blobs.insert(slot, data);
        self.state = BlobsState::SpecialAdded;

        Ok(())
    }

    /// Register the code directory.
    ///
    /// Digests of previously registered blobs are written to the code
    /// directory's special slots.
    pub fn add_code_directory(
        &mut self,
        mut cd: CodeDirectoryBlob,
    ) -> Result<&CodeDirectoryBlob, MachOSignError> {
        if matches!(self.state, BlobsState::SignatureAdded) {
            return Err(MachOSignError::Format(
                "cannot add code directory after signature data".into(),
            ));
        }

        for (slot, data) in &self.blobs {
            cd.special_hashes
                .insert(*slot, cd.hash_type.digest_data(data)?);
        }

        self.state = BlobsState::CodeDirectoryAdded;

        Ok(self.code_directory.insert(cd))
    }

    /// Register the signature slot payload.
    ///
    /// Empty data produces an empty wrapper, as used by ad-hoc signatures.
    pub fn add_signature(&mut self, der_data: Vec<u8>) -> Result<(), MachOSignError> {
        if !matches!(self.state, BlobsState::CodeDirectoryAdded) {
            return Err(MachOSignError::Format(
                "signature requires a code directory".into(),
            ));
        }

        self.blobs.insert(
            CodeSigningSlot::Signature,
            BlobWrapperBlob::from_data_owned(der_data).to_blob_bytes()?,
        );
        self.state = BlobsState::SignatureAdded;

        Ok(())
    }

    /// Serialize the SuperBlob with blobs ordered by slot.
    pub fn create_superblob(&self) -> Result<Vec<u8>, MachOSignError> {
        let code_directory = match (&self.code_directory, self.state) {
            (Some(cd), BlobsState::CodeDirectoryAdded | BlobsState::SignatureAdded) => cd,
            _ => {
                return Err(MachOSignError::Format(
                    "code directory required in order to materialize superblob".into(),
                ));
            }
        };

        let mut blobs = self
            .blobs
            .iter()
            .map(|(slot, data)| (*slot, data.clone()))
            .collect::<Vec<_>>();
        blobs.push((
            CodeSigningSlot::CodeDirectory,
            code_directory.to_blob_bytes()?,
        ));
        blobs.sort_by_key(|(slot, _)| *slot);

        create_superblob(CodeSigningMagic::EmbeddedSignature, blobs.iter())
    }
}

/// Create the code directory for the binary in its current state.
///
/// Special slot digests are filled in when the directory is registered with
/// a [SuperBlobBuilder].
pub fn create_code_directory(
    identity: &str,
    binary: &MachOBinary,
    material: &SigningMaterial,
    signer: &dyn CodeDirectorySigner,
) -> Result<CodeDirectoryBlob, MachOSignError> {
    let digest_type = material.digest_type();
    let code_limit = binary.code_limit();

    let code = binary.data().get(..code_limit).ok_or_else(|| {
        MachOSignError::Layout(format!(
            "code limit {} is past the end of the {} byte binary",
            code_limit,
            binary.data().len()
        ))
    })?;
    let code_hashes = paged_digests(code, digest_type, CODE_PAGE_SIZE)?;

    let code_limit = u32::try_from(code_limit).map_err(|_| {
        MachOSignError::Layout(format!(
            "code limit {} does not fit in 32 bits",
            code_limit
        ))
    })?;

    let text = binary.text_segment_range()?;

    let flags = if signer.is_ad_hoc() {
        CodeSignatureFlags::ADHOC
    } else {
        CodeSignatureFlags::empty()
    };

    let exec_seg_flags = if binary.is_executable() {
        ExecutableSegmentFlags::MAIN_BINARY
    } else {
        ExecutableSegmentFlags::empty()
    };

    Ok(CodeDirectoryBlob {
        version: CodeDirectoryVersion::SupportsExecutableSegment as u32,
        flags,
        code_limit,
        hash_size: digest_type.hash_len()? as u8,
        hash_type: digest_type,
        platform: 0,
        page_size: CODE_PAGE_SIZE as u32,
        spare2: 0,
        scatter_offset: None,
        spare3: None,
        code_limit_64: None,
        exec_seg_base: Some(text.start),
        exec_seg_limit: Some(text.end - text.start),
        exec_seg_flags: Some(exec_seg_flags),
        ident: identity.to_string(),
        team_name: None,
        code_hashes,
        special_hashes: HashMap::new(),
    })
}

#[cfg(test)]
mod tests {
    use {
        super::*,
        crate::{
            cms::AdHocSigner,
            embedded_signature::{DigestType, EmbeddedSignature},
            testutil::synthetic_executable,
        },
        scroll::Pread,
    };

    fn prepared_binary(text_size: usize, total_size: usize) -> MachOBinary {
        let mut binary = MachOBinary::from_bytes(synthetic_executable(text_size, total_size))
            .unwrap();
        binary.insert_empty_code_signature_command().unwrap();

        binary
    }

    #[test]
    fn code_limit_past_end_rejected() -> Result<(), MachOSignError> {
        let mut binary = prepared_binary(16384, 20000);
        let (_, index) = binary.code_signature_command()?;
        let command_offset = binary.load_commands()[index].offset;

        // dataoff sits after cmd and cmdsize.
        binary.patch_bytes(&30000u32.to_le_bytes(), command_offset + 8)?;
        binary.patch_bytes(&100u32.to_le_bytes(), command_offset + 12)?;
        assert_eq!(binary.code_limit(), 30000);

        assert!(matches!(
            SuperBlobBuilder::build("hello", &binary, &SigningMaterial::ad_hoc(), 0),
            Err(MachOSignError::Layout(_))
        ));

        Ok(())
    }

    #[test]
    fn ad_hoc_layout() -> Result<(), MachOSignError> {
        let binary = prepared_binary(16384, 20000);
        let (size, data) = SuperBlobBuilder::build("hello", &binary, &SigningMaterial::ad_hoc(), 0)?;

        assert_eq!(size, data.len());
        assert_eq!(data.pread_with::<u32>(0, scroll::BE)?, 0xfade0cc0);
        assert_eq!(data.pread_with::<u32>(4, scroll::BE)?, size as u32);

        let sig = EmbeddedSignature::from_bytes(&data)?;
        let slots = sig.blobs.iter().map(|b| b.slot).collect::<Vec<_>>();
        assert_eq!(
            slots,
            vec![
                CodeSigningSlot::CodeDirectory,
                CodeSigningSlot::RequirementSet,
                CodeSigningSlot::Signature
            ]
        );

        let requirements = sig.find_slot(CodeSigningSlot::RequirementSet).unwrap();
        assert_eq!(requirements.data, &[0xfa, 0xde, 0x0c, 0x01, 0, 0, 0, 12, 0, 0, 0, 0]);

        let wrapper = sig.find_slot(CodeSigningSlot::Signature).unwrap();
        assert_eq!(wrapper.data, &[0xfa, 0xde, 0x0b, 0x01, 0, 0, 0, 8]);
        assert_eq!(sig.signature_data()?, Some(&[][..]));

        let cd = sig.code_directory()?.unwrap();
        assert_eq!(cd.ident, "hello");
        assert_eq!(cd.version, 0x20400);
        assert!(cd.flags.contains(CodeSignatureFlags::ADHOC));
        assert_eq!(cd.hash_type, DigestType::Sha256);
        assert_eq!(cd.page_size, 4096);
        assert_eq!(cd.code_limit, 20000);
        assert_eq!(cd.code_hashes.len(), 5);
        assert_eq!(cd.exec_seg_base, Some(0));
        assert_eq!(cd.exec_seg_limit, Some(16384));
        assert_eq!(cd.exec_seg_flags, Some(ExecutableSegmentFlags::MAIN_BINARY));

        // Info slot is zero-filled, requirements slot holds the blob digest.
        assert_eq!(
            cd.special_hashes.get(&CodeSigningSlot::Info),
            Some(&vec![0u8; 32])
        );
        assert_eq!(
            cd.special_hashes.get(&CodeSigningSlot::RequirementSet),
            Some(&requirements.digest_with(DigestType::Sha256)?)
        );

        Ok(())
    }

    #[test]
    fn hashes_match_content() -> Result<(), MachOSignError> {
        let binary = prepared_binary(16384, 30000);
        let (_, data) = SuperBlobBuilder::build("hello", &binary, &SigningMaterial::ad_hoc(), 0)?;

        let cd = EmbeddedSignature::from_bytes(&data)?
            .code_directory()?
            .unwrap();

        for (i, chunk) in binary.data().chunks(4096).enumerate() {
            assert_eq!(cd.code_hashes[i], DigestType::Sha256.digest_data(chunk)?);
        }

        Ok(())
    }

    #[test]
    fn one_mebibyte_page_count() -> Result<(), MachOSignError> {
        let binary = prepared_binary(1 << 19, 1 << 20);
        let (_, data) = SuperBlobBuilder::build("big", &binary, &SigningMaterial::ad_hoc(), 0)?;

        let cd = EmbeddedSignature::from_bytes(&data)?
            .code_directory()?
            .unwrap();
        assert_eq!(cd.code_hashes.len(), 256);

        Ok(())
    }

    #[test]
    fn size_hint_pads_or_rejects() -> Result<(), MachOSignError> {
        let binary = prepared_binary(16384, 20000);
        let material = SigningMaterial::ad_hoc();

        let (exact, exact_data) = SuperBlobBuilder::build("hello", &binary, &material, 0)?;

        let (size, padded) = SuperBlobBuilder::build("hello", &binary, &material, exact + 100)?;
        assert_eq!(size, exact);
        assert_eq!(padded.len(), exact + 100);
        assert_eq!(&padded[..exact], exact_data.as_slice());
        assert!(padded[exact..].iter().all(|b| *b == 0));
        assert_eq!(padded.pread_with::<u32>(4, scroll::BE)?, exact as u32);

        let err = SuperBlobBuilder::build("hello", &binary, &material, exact - 1).unwrap_err();
        assert!(matches!(
            err,
            MachOSignError::SignatureDataTooLarge { size, reserved } if size == exact && reserved == exact - 1
        ));
        assert!(err.is_layout());

        Ok(())
    }

    #[test]
    fn entitlements_slot() -> Result<(), MachOSignError> {
        let xml = indoc::indoc! {r#"
            <?xml version="1.0" encoding="UTF-8"?>
            <!DOCTYPE plist PUBLIC "-//Apple//DTD PLIST 1.0//EN" "http://www.apple.com/DTDs/PropertyList-1.0.dtd">
            <plist version="1.0">
            <dict>
                <key>com.apple.security.get-task-allow</key>
                <true/>
            </dict>
            </plist>
        "#};

        let material = SigningMaterial::ad_hoc()
            .with_entitlements(xml)?
            .with_digest_type(DigestType::Sha384)?;
        let binary = prepared_binary(16384, 20000);
        let (_, data) = SuperBlobBuilder::build("ent", &binary, &material, 0)?;

        let sig = EmbeddedSignature::from_bytes(&data)?;
        assert_eq!(sig.entitlements()?.unwrap().as_str(), xml);

        let cd = sig.code_directory()?.unwrap();
        assert_eq!(cd.hash_type, DigestType::Sha384);
        assert_eq!(cd.hash_size, 48);
        assert_eq!(
            cd.special_hashes.get(&CodeSigningSlot::Entitlements),
            Some(
                &sig.find_slot(CodeSigningSlot::Entitlements)
                    .unwrap()
                    .digest_with(DigestType::Sha384)?
            )
        );
        // Slots 1, 3 and 4 are zero-filled.
        assert_eq!(cd.special_hashes.len(), 5);

        Ok(())
    }

    #[test]
    fn builder_ordering_enforced() -> Result<(), MachOSignError> {
        let binary = prepared_binary(16384, 20000);
        let material = SigningMaterial::ad_hoc();

        let mut builder = SuperBlobBuilder::default();
        assert!(builder.create_superblob().is_err());
        assert!(builder.add_signature(vec![]).is_err());
        assert!(builder
            .add_blob(CodeSigningSlot::CodeDirectory, vec![])
            .is_err());

        builder.add_code_directory(create_code_directory(
            "x",
            &binary,
            &material,
            &AdHocSigner,
        )?)?;
        assert!(builder
            .add_blob(CodeSigningSlot::RequirementSet, vec![])
            .is_err());
        assert!(builder.code_directory().is_some());
        assert!(builder.create_superblob().is_ok());

        Ok(())
    }
}
