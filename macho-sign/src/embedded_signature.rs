// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Embedded signature data structures (superblobs, blobs, magic values).
//!
//! The embedded code signature of a Mach-O binary lives at the end of the
//! `__LINKEDIT` segment, at the file range advertised by the
//! `LC_CODE_SIGNATURE` load command. Its high-level format is:
//!
//! * A `SuperBlob` header holding a magic, the total length and the number
//!   of *blob* sections that follow.
//! * An array of `BlobIndex` entries describing the *slot* and offset of each
//!   blob. Entries are sorted by slot.
//! * N blob sections. Every blob begins with its own u32 magic and u32 length
//!   (inclusive of the 8 byte header).
//!
//! All integers are big-endian, regardless of the endianness of the Mach-O
//! binary holding them.

use {
    crate::{code_directory::CodeDirectoryBlob, error::MachOSignError},
    scroll::{IOwrite, Pread},
    std::{
        borrow::Cow,
        cmp::Ordering,
        fmt::{Display, Formatter},
        io::Write,
    },
};

/// Magic values opening each blob.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum CodeSigningMagic {
    RequirementSet,
    CodeDirectory,
    /// The SuperBlob itself.
    EmbeddedSignature,
    /// XML plist entitlements.
    Entitlements,
    EntitlementsDer,
    /// Opaque payload. Holds the CMS signature.
    BlobWrapper,
    Unknown(u32),
}

const MAGIC_VALUES: [(CodeSigningMagic, u32); 6] = [
    (CodeSigningMagic::RequirementSet, 0xfade0c01),
    (CodeSigningMagic::CodeDirectory, 0xfade0c02),
    (CodeSigningMagic::EmbeddedSignature, 0xfade0cc0),
    (CodeSigningMagic::Entitlements, 0xfade7171),
    (CodeSigningMagic::EntitlementsDer, 0xfade7172),
    (CodeSigningMagic::BlobWrapper, 0xfade0b01),
];

impl From<u32> for CodeSigningMagic {
    fn from(value: u32) -> Self {
        MAGIC_VALUES
            .iter()
            .find(|(_, v)| *v == value)
            .map(|(magic, _)| *magic)
            .unwrap_or(Self::Unknown(value))
    }
}

impl From<CodeSigningMagic> for u32 {
    fn from(magic: CodeSigningMagic) -> u32 {
        match magic {
            CodeSigningMagic::Unknown(value) => value,
            known => MAGIC_VALUES
                .iter()
                .find(|(m, _)| *m == known)
                .map(|(_, v)| *v)
                .unwrap_or_default(),
        }
    }
}

/// Index of a blob within a SuperBlob.
///
/// Slots 1 through 7 are "special" slots whose digests the code directory
/// records at negative hash indices.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub enum CodeSigningSlot {
    CodeDirectory,
    Info,
    RequirementSet,
    ResourceDir,
    Application,
    Entitlements,
    RepSpecific,
    EntitlementsDer,
    AlternateCodeDirectory0,
    Signature,
    Unknown(u32),
}

const SLOT_VALUES: [(CodeSigningSlot, u32, &str); 10] = [
    (CodeSigningSlot::CodeDirectory, 0, "CodeDirectory"),
    (CodeSigningSlot::Info, 1, "Info"),
    (CodeSigningSlot::RequirementSet, 2, "RequirementSet"),
    (CodeSigningSlot::ResourceDir, 3, "Resources"),
    (CodeSigningSlot::Application, 4, "Application"),
    (CodeSigningSlot::Entitlements, 5, "Entitlements"),
    (CodeSigningSlot::RepSpecific, 6, "RepSpecific"),
    (CodeSigningSlot::EntitlementsDer, 7, "EntitlementsDer"),
    (CodeSigningSlot::AlternateCodeDirectory0, 0x1000, "AlternateCodeDirectory0"),
    (CodeSigningSlot::Signature, 0x10000, "Signature"),
];

impl CodeSigningSlot {
    fn name(&self) -> &'static str {
        SLOT_VALUES
            .iter()
            .find(|(slot, _, _)| slot == self)
            .map(|(_, _, name)| *name)
            .unwrap_or("Unknown")
    }

    /// Whether this slot can have a digest recorded in the code directory's special slots.
    pub fn is_code_directory_specials_expressible(&self) -> bool {
        (1..=7).contains(&u32::from(*self))
    }
}

impl std::fmt::Debug for CodeSigningSlot {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} ({:#x})", self.name(), u32::from(*self))
    }
}

impl From<u32> for CodeSigningSlot {
    fn from(value: u32) -> Self {
        SLOT_VALUES
            .iter()
            .find(|(_, v, _)| *v == value)
            .map(|(slot, _, _)| *slot)
            .unwrap_or(Self::Unknown(value))
    }
}

impl From<CodeSigningSlot> for u32 {
    fn from(slot: CodeSigningSlot) -> Self {
        match slot {
            CodeSigningSlot::Unknown(value) => value,
            known => SLOT_VALUES
                .iter()
                .find(|(s, _, _)| *s == known)
                .map(|(_, v, _)| *v)
                .unwrap_or_default(),
        }
    }
}

impl PartialOrd for CodeSigningSlot {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

/// Slots sort by their numeric value, which is the SuperBlob index order.
impl Ord for CodeSigningSlot {
    fn cmp(&self, other: &Self) -> Ordering {
        u32::from(*self).cmp(&u32::from(*other))
    }
}

/// Hash algorithm used by a code directory.
///
/// The numeric value is the `hashType` field of the code directory.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum DigestType {
    Sha1,
    Sha256,
    Sha384,
    Unknown(u8),
}

impl Default for DigestType {
    fn default() -> Self {
        Self::Sha256
    }
}

impl From<u8> for DigestType {
    fn from(value: u8) -> Self {
        match value {
            1 => Self::Sha1,
            2 => Self::Sha256,
            4 => Self::Sha384,
            _ => Self::Unknown(value),
        }
    }
}

impl From<DigestType> for u8 {
    fn from(digest: DigestType) -> u8 {
        match digest {
            DigestType::Sha1 => 1,
            DigestType::Sha256 => 2,
            DigestType::Sha384 => 4,
            DigestType::Unknown(value) => value,
        }
    }
}

impl Display for DigestType {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Sha1 => f.write_str("sha1"),
            Self::Sha256 => f.write_str("sha256"),
            Self::Sha384 => f.write_str("sha384"),
            Self::Unknown(value) => write!(f, "unknown ({})", value),
        }
    }
}

impl TryFrom<&str> for DigestType {
    type Error = MachOSignError;

    fn try_from(name: &str) -> Result<Self, Self::Error> {
        [Self::Sha1, Self::Sha256, Self::Sha384]
            .into_iter()
            .find(|d| d.to_string() == name)
            .ok_or(MachOSignError::DigestUnknownAlgorithm)
    }
}

impl DigestType {
    fn algorithm(&self) -> Result<&'static ring::digest::Algorithm, MachOSignError> {
        match self {
            Self::Sha1 => Ok(&ring::digest::SHA1_FOR_LEGACY_USE_ONLY),
            Self::Sha256 => Ok(&ring::digest::SHA256),
            Self::Sha384 => Ok(&ring::digest::SHA384),
            Self::Unknown(_) => Err(MachOSignError::DigestUnknownAlgorithm),
        }
    }

    /// Length in bytes of digests of this type.
    pub fn hash_len(&self) -> Result<usize, MachOSignError> {
        Ok(self.algorithm()?.output_len)
    }

    /// Digest `data` in one shot.
    pub fn digest_data(&self, data: &[u8]) -> Result<Vec<u8>, MachOSignError> {
        Ok(ring::digest::digest(self.algorithm()?, data)
            .as_ref()
            .to_vec())
    }
}

/// Split a blob into its magic, its advertised length and the bytes after the header.
fn split_blob_header(data: &[u8]) -> Result<(u32, usize, &[u8]), scroll::Error> {
    let magic = data.pread_with::<u32>(0, scroll::BE)?;
    let length = data.pread_with::<u32>(4, scroll::BE)?;

    Ok((magic, length as usize, data.get(8..).unwrap_or_default()))
}

/// Payload of a blob after checking that it opens with `expected_magic`.
///
/// `what` names the blob in the error.
pub(crate) fn read_and_validate_blob_header<'a>(
    data: &'a [u8],
    expected_magic: u32,
    what: &'static str,
) -> Result<&'a [u8], MachOSignError> {
    match split_blob_header(data)? {
        (magic, _, payload) if magic == expected_magic => Ok(payload),
        _ => Err(MachOSignError::BadMagic(what)),
    }
}

/// A typed blob that can be parsed from and serialized to its wire form.
pub trait Blob<'a>: Sized {
    /// Magic written in the blob header.
    fn magic() -> u32;

    /// Parse from bytes beginning at the blob header.
    fn from_blob_bytes(data: &'a [u8]) -> Result<Self, MachOSignError>;

    /// Bytes following the 8 byte header.
    fn serialize_payload(&self) -> Result<Vec<u8>, MachOSignError>;

    /// Full blob bytes, header included.
    fn to_blob_bytes(&self) -> Result<Vec<u8>, MachOSignError> {
        let payload = self.serialize_payload()?;
        let length = u32::try_from(payload.len() + 8)
            .map_err(|_| MachOSignError::Layout("blob exceeds 4 GiB".into()))?;

        let mut res = Vec::with_capacity(length as usize);
        res.iowrite_with(Self::magic(), scroll::BE)?;
        res.iowrite_with(length, scroll::BE)?;
        res.extend(payload);

        Ok(res)
    }

    /// Digest of [Blob::to_blob_bytes].
    fn digest_with(&self, hash_type: DigestType) -> Result<Vec<u8>, MachOSignError> {
        hash_type.digest_data(&self.to_blob_bytes()?)
    }
}

/// Code requirements (slot 2).
///
/// Only the empty set is ever written. Parsed sets keep their raw payload.
#[derive(Debug)]
pub struct RequirementSetBlob<'a> {
    payload: Cow<'a, [u8]>,
}

impl<'a> Blob<'a> for RequirementSetBlob<'a> {
    fn magic() -> u32 {
        u32::from(CodeSigningMagic::RequirementSet)
    }

    fn from_blob_bytes(data: &'a [u8]) -> Result<Self, MachOSignError> {
        read_and_validate_blob_header(data, Self::magic(), "requirement set blob").map(|payload| {
            Self {
                payload: Cow::Borrowed(payload),
            }
        })
    }

    fn serialize_payload(&self) -> Result<Vec<u8>, MachOSignError> {
        Ok(self.payload.to_vec())
    }
}

impl RequirementSetBlob<'static> {
    /// A requirement set with zero entries.
    pub fn empty() -> Self {
        Self {
            payload: Cow::Owned(0u32.to_be_bytes().to_vec()),
        }
    }
}

impl<'a> RequirementSetBlob<'a> {
    /// Number of requirements in the set.
    pub fn count(&self) -> Result<u32, MachOSignError> {
        Ok(self.payload.pread_with(0, scroll::BE)?)
    }
}

/// Entitlements (slot 5), an XML plist dict stored verbatim.
#[derive(Debug)]
pub struct EntitlementsBlob<'a> {
    xml: Cow<'a, str>,
}

impl<'a> Blob<'a> for EntitlementsBlob<'a> {
    fn magic() -> u32 {
        u32::from(CodeSigningMagic::Entitlements)
    }

    fn from_blob_bytes(data: &'a [u8]) -> Result<Self, MachOSignError> {
        let payload = read_and_validate_blob_header(data, Self::magic(), "entitlements blob")?;

        std::str::from_utf8(payload)
            .map(|xml| Self { xml: xml.into() })
            .map_err(|e| MachOSignError::Format(format!("entitlements are not UTF-8: {}", e)))
    }

    fn serialize_payload(&self) -> Result<Vec<u8>, MachOSignError> {
        Ok(self.xml.as_bytes().to_vec())
    }
}

impl<'a> EntitlementsBlob<'a> {
    /// Wraps `xml` without validating it.
    pub fn from_string(xml: &(impl ToString + ?Sized)) -> Self {
        Self {
            xml: Cow::Owned(xml.to_string()),
        }
    }

    pub fn as_str(&self) -> &str {
        &self.xml
    }
}

/// Opaque wrapper (slot 0x10000) holding the CMS signature.
///
/// Empty for ad-hoc signatures.
pub struct BlobWrapperBlob<'a> {
    wrapped: Cow<'a, [u8]>,
}

impl<'a> Blob<'a> for BlobWrapperBlob<'a> {
    fn magic() -> u32 {
        u32::from(CodeSigningMagic::BlobWrapper)
    }

    fn from_blob_bytes(data: &'a [u8]) -> Result<Self, MachOSignError> {
        let wrapped = read_and_validate_blob_header(data, Self::magic(), "blob wrapper blob")?;

        Ok(Self {
            wrapped: Cow::Borrowed(wrapped),
        })
    }

    fn serialize_payload(&self) -> Result<Vec<u8>, MachOSignError> {
        Ok(self.wrapped.to_vec())
    }
}

impl<'a> std::fmt::Debug for BlobWrapperBlob<'a> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "BlobWrapper({} bytes)", self.wrapped.len())
    }
}

impl<'a> BlobWrapperBlob<'a> {
    pub fn data(&self) -> &[u8] {
        &self.wrapped
    }
}

impl BlobWrapperBlob<'static> {
    pub fn from_data_owned(data: Vec<u8>) -> BlobWrapperBlob<'static> {
        Self {
            wrapped: Cow::Owned(data),
        }
    }
}

/// Serialize a SuperBlob holding `blobs` in iteration order.
///
/// Index entries follow iteration order too, so pass blobs sorted by slot.
pub fn create_superblob<'a>(
    magic: CodeSigningMagic,
    blobs: impl Iterator<Item = &'a (CodeSigningSlot, Vec<u8>)>,
) -> Result<Vec<u8>, MachOSignError> {
    let blobs = blobs.collect::<Vec<_>>();

    let header_len = 12 + 8 * blobs.len();
    let total_len = header_len + blobs.iter().map(|(_, data)| data.len()).sum::<usize>();
    let total_len = u32::try_from(total_len)
        .map_err(|_| MachOSignError::Layout("superblob exceeds 4 GiB".into()))?;

    let mut out = Vec::with_capacity(total_len as usize);
    out.iowrite_with(u32::from(magic), scroll::BE)?;
    out.iowrite_with(total_len, scroll::BE)?;
    out.iowrite_with(blobs.len() as u32, scroll::BE)?;

    let mut offset = header_len as u32;
    for (slot, data) in &blobs {
        out.iowrite_with(u32::from(*slot), scroll::BE)?;
        out.iowrite_with(offset, scroll::BE)?;
        offset += data.len() as u32;
    }

    for (_, data) in blobs {
        out.write_all(data)?;
    }

    Ok(out)
}

/// One blob of a parsed SuperBlob.
#[derive(Clone)]
pub struct BlobEntry<'a> {
    /// Position in the index table.
    pub index: usize,
    pub slot: CodeSigningSlot,
    /// Offset of the blob header from the start of the SuperBlob.
    pub offset: usize,
    pub magic: CodeSigningMagic,
    /// Advertised length, header included.
    pub length: usize,
    /// Blob bytes, header included.
    pub data: &'a [u8],
}

impl<'a> std::fmt::Debug for BlobEntry<'a> {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(
            f,
            "#{} {:?} {:?} @{} ({} bytes)",
            self.index, self.slot, self.magic, self.offset, self.length
        )
    }
}

impl<'a> BlobEntry<'a> {
    /// Blob bytes without the 8 byte header.
    pub fn payload(&self) -> Result<&'a [u8], MachOSignError> {
        Ok(split_blob_header(self.data)?.2)
    }

    /// Digest of the whole blob. For the code directory this is the CDHash.
    pub fn digest_with(&self, hash: DigestType) -> Result<Vec<u8>, MachOSignError> {
        hash.digest_data(self.data)
    }

    fn parse_as<B: Blob<'a>>(&self) -> Result<B, MachOSignError> {
        B::from_blob_bytes(self.data)
    }
}

/// An embedded signature SuperBlob, parsed down to its index.
///
/// Individual blobs are decoded on request.
pub struct EmbeddedSignature<'a> {
    pub magic: CodeSigningMagic,
    /// SuperBlob length from its header.
    pub length: u32,
    /// Index entry count from its header.
    pub count: u32,
    /// SuperBlob bytes, trimmed to `length`.
    pub data: &'a [u8],
    pub blobs: Vec<BlobEntry<'a>>,
}

impl<'a> std::fmt::Debug for EmbeddedSignature<'a> {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        writeln!(f, "{:?} ({} bytes, {} blobs)", self.magic, self.length, self.count)?;
        for blob in &self.blobs {
            writeln!(f, "  {:?}", blob)?;
        }

        Ok(())
    }
}

impl<'a> EmbeddedSignature<'a> {
    /// Parse the SuperBlob at the start of `data`.
    ///
    /// `data` is the file range advertised by `LC_CODE_SIGNATURE`. Trailing
    /// zero padding after the SuperBlob is ignored.
    pub fn from_bytes(data: &'a [u8]) -> Result<Self, MachOSignError> {
        let (magic, length, _) = split_blob_header(data)?;
        let magic = CodeSigningMagic::from(magic);

        if magic != CodeSigningMagic::EmbeddedSignature {
            return Err(MachOSignError::BadMagic("embedded signature super blob"));
        }

        let count = data.pread_with::<u32>(8, scroll::BE)?;
        let data = data.get(..length).ok_or(MachOSignError::SuperblobMalformed)?;

        let index_end = 12 + 8 * count as usize;
        let table = data
            .get(12..index_end)
            .ok_or(MachOSignError::SuperblobMalformed)?;

        let entries = table
            .chunks_exact(8)
            .map(|entry| {
                Ok((
                    entry.pread_with::<u32>(0, scroll::BE)?,
                    entry.pread_with::<u32>(4, scroll::BE)? as usize,
                ))
            })
            .collect::<Result<Vec<_>, MachOSignError>>()?;

        let blobs = entries
            .iter()
            .enumerate()
            .map(|(index, (slot, offset))| {
                // A blob may not run into the one after it.
                let bound = entries
                    .get(index + 1)
                    .map(|(_, next)| *next)
                    .unwrap_or(data.len());

                let window = data
                    .get(*offset..bound)
                    .ok_or(MachOSignError::SuperblobMalformed)?;
                let (magic, blob_length, _) = split_blob_header(window)?;
                let blob = window
                    .get(..blob_length)
                    .ok_or(MachOSignError::SuperblobMalformed)?;

                Ok(BlobEntry {
                    index,
                    slot: CodeSigningSlot::from(*slot),
                    offset: *offset,
                    magic: CodeSigningMagic::from(magic),
                    length: blob_length,
                    data: blob,
                })
            })
            .collect::<Result<Vec<_>, MachOSignError>>()?;

        Ok(Self {
            magic,
            length: length as u32,
            count,
            data,
            blobs,
        })
    }

    /// First blob occupying `slot`.
    pub fn find_slot(&self, slot: CodeSigningSlot) -> Option<&BlobEntry<'a>> {
        self.blobs.iter().find(|e| e.slot == slot)
    }

    fn parse_slot<B: Blob<'a>>(&self, slot: CodeSigningSlot) -> Result<Option<B>, MachOSignError> {
        self.find_slot(slot)
            .map(|entry| entry.parse_as::<B>())
            .transpose()
    }

    /// The code directory in slot 0, if any.
    pub fn code_directory(&self) -> Result<Option<CodeDirectoryBlob>, MachOSignError> {
        self.parse_slot(CodeSigningSlot::CodeDirectory)
    }

    pub fn entitlements(&self) -> Result<Option<EntitlementsBlob<'a>>, MachOSignError> {
        self.parse_slot(CodeSigningSlot::Entitlements)
    }

    pub fn code_requirements(&self) -> Result<Option<RequirementSetBlob<'a>>, MachOSignError> {
        self.parse_slot(CodeSigningSlot::RequirementSet)
    }

    /// CMS bytes from the signature slot.
    ///
    /// Ad-hoc signatures yield `Some` with an empty slice.
    pub fn signature_data(&self) -> Result<Option<&'a [u8]>, MachOSignError> {
        self.find_slot(CodeSigningSlot::Signature)
            .map(|entry| {
                read_and_validate_blob_header(entry.data, BlobWrapperBlob::magic(), "blob wrapper")
            })
            .transpose()
    }
}
