// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Code directory data structure and related types.

use {
    crate::{
        embedded_signature::{
            read_and_validate_blob_header, Blob, CodeSigningMagic, CodeSigningSlot, DigestType,
        },
        error::MachOSignError,
    },
    scroll::{IOwrite, Pread},
    std::{collections::HashMap, io::Write},
};

bitflags::bitflags! {
    /// `CS_*` flags stored in the code directory.
    pub struct CodeSignatureFlags: u32 {
        const HOST = 0x0001;
        /// Signed without an identity.
        const ADHOC = 0x0002;
        const FORCE_HARD = 0x0100;
        const FORCE_KILL = 0x0200;
        const FORCE_EXPIRATION = 0x0400;
        const RESTRICT = 0x0800;
        const ENFORCEMENT = 0x1000;
        const LIBRARY_VALIDATION = 0x2000;
        /// Hardened runtime.
        const RUNTIME = 0x10000;
        const LINKER_SIGNED = 0x20000;
    }
}

bitflags::bitflags! {
    /// `CS_EXECSEG_*` flags describing the executable segment.
    pub struct ExecutableSegmentFlags: u64 {
        const MAIN_BINARY = 0x0001;
        const ALLOW_UNSIGNED = 0x0010;
        const DEBUGGER = 0x0020;
        const JIT = 0x0040;
    }
}

/// Code directory format revisions. Each adds trailing header fields.
#[derive(Clone, Copy, Debug, PartialEq)]
#[repr(u32)]
pub enum CodeDirectoryVersion {
    Initial = 0x20000,
    SupportsScatter = 0x20100,
    SupportsTeamId = 0x20200,
    SupportsCodeLimit64 = 0x20300,
    SupportsExecutableSegment = 0x20400,
}

impl CodeDirectoryVersion {
    fn is_met_by(self, version: u32) -> bool {
        version >= self as u32
    }
}

/// Size of the fixed header of a version 0x20400 code directory, blob header included.
pub const CODE_DIRECTORY_HEADER_SIZE: usize = 88;

/// Length of the fixed header for a given version, blob header included.
fn header_size(version: u32) -> usize {
    let mut size = 44;

    if CodeDirectoryVersion::SupportsScatter.is_met_by(version) {
        size += 4;
    }
    if CodeDirectoryVersion::SupportsTeamId.is_met_by(version) {
        size += 4;
    }
    if CodeDirectoryVersion::SupportsCodeLimit64.is_met_by(version) {
        size += 12;
    }
    if CodeDirectoryVersion::SupportsExecutableSegment.is_met_by(version) {
        size += 24;
    }

    size
}

/// Sequential big-endian reader over the fixed header.
struct FieldReader<'a> {
    data: &'a [u8],
    offset: usize,
}

impl<'a> FieldReader<'a> {
    fn u8(&mut self) -> Result<u8, MachOSignError> {
        Ok(self.data.gread_with(&mut self.offset, scroll::BE)?)
    }

    fn u32(&mut self) -> Result<u32, MachOSignError> {
        Ok(self.data.gread_with(&mut self.offset, scroll::BE)?)
    }

    fn u64(&mut self) -> Result<u64, MachOSignError> {
        Ok(self.data.gread_with(&mut self.offset, scroll::BE)?)
    }

    /// Reads a field only present from `since` onwards.
    fn u32_since(
        &mut self,
        version: u32,
        since: CodeDirectoryVersion,
    ) -> Result<Option<u32>, MachOSignError> {
        if since.is_met_by(version) {
            Ok(Some(self.u32()?))
        } else {
            Ok(None)
        }
    }

    fn u64_since(
        &mut self,
        version: u32,
        since: CodeDirectoryVersion,
    ) -> Result<Option<u64>, MachOSignError> {
        if since.is_met_by(version) {
            Ok(Some(self.u64()?))
        } else {
            Ok(None)
        }
    }
}

fn digest_run(
    data: &[u8],
    start: usize,
    count: usize,
    hash_size: usize,
) -> Result<Vec<Vec<u8>>, MachOSignError> {
    let end = count
        .checked_mul(hash_size)
        .and_then(|len| len.checked_add(start))
        .ok_or_else(|| MachOSignError::Format("code directory hash count overflows".into()))?;

    match data.get(start..end) {
        Some(run) if hash_size > 0 => Ok(run.chunks(hash_size).map(<[u8]>::to_vec).collect()),
        Some(_) => Ok(vec![vec![]; count]),
        None => Err(MachOSignError::Format(format!(
            "code directory hashes at {}..{} exceed blob length {}",
            start,
            end,
            data.len()
        ))),
    }
}

fn nul_terminated(data: &[u8], offset: usize) -> Option<String> {
    let tail = data.get(offset..)?;
    let end = tail.iter().position(|b| *b == 0)?;

    String::from_utf8(tail[..end].to_vec()).ok()
}

/// A parsed or to-be-written code directory.
///
/// Versions up to 0x20400 are understood. Fields a given version lacks are
/// `None`.
#[derive(Clone, Debug)]
pub struct CodeDirectoryBlob {
    pub version: u32,
    pub flags: CodeSignatureFlags,
    /// File offset where page hashing stops. This is where the signature data begins.
    pub code_limit: u32,
    pub hash_size: u8,
    pub hash_type: DigestType,
    pub platform: u8,
    /// In bytes. Serialized as its base 2 logarithm.
    pub page_size: u32,
    pub spare2: u32,
    pub scatter_offset: Option<u32>,
    pub spare3: Option<u32>,
    pub code_limit_64: Option<u64>,
    pub exec_seg_base: Option<u64>,
    pub exec_seg_limit: Option<u64>,
    pub exec_seg_flags: Option<ExecutableSegmentFlags>,
    pub ident: String,
    pub team_name: Option<String>,
    /// One digest per page of `0..code_limit`.
    pub code_hashes: Vec<Vec<u8>>,
    /// Digests of other blobs, keyed by the slot they occupy.
    pub special_hashes: HashMap<CodeSigningSlot, Vec<u8>>,
}

impl<'a> Blob<'a> for CodeDirectoryBlob {
    fn magic() -> u32 {
        u32::from(CodeSigningMagic::CodeDirectory)
    }

    fn from_blob_bytes(data: &'a [u8]) -> Result<Self, MachOSignError> {
        read_and_validate_blob_header(data, Self::magic(), "code directory blob")?;

        let mut r = FieldReader { data, offset: 8 };

        let version = r.u32()?;
        let flags = CodeSignatureFlags::from_bits_truncate(r.u32()?);
        let hash_offset = r.u32()? as usize;
        let ident_offset = r.u32()? as usize;
        let special_count = r.u32()?;
        let code_count = r.u32()? as usize;
        let code_limit = r.u32()?;
        let hash_size = r.u8()?;
        let hash_type = DigestType::from(r.u8()?);
        let platform = r.u8()?;
        let page_shift = r.u8()?;
        let spare2 = r.u32()?;

        let page_size = 1u32.checked_shl(page_shift as u32).ok_or_else(|| {
            MachOSignError::Format(format!("page size shift {} too large", page_shift))
        })?;

        let scatter_offset = r
            .u32_since(version, CodeDirectoryVersion::SupportsScatter)?
            .filter(|v| *v != 0);
        let team_offset = r
            .u32_since(version, CodeDirectoryVersion::SupportsTeamId)?
            .filter(|v| *v != 0);
        let spare3 = r.u32_since(version, CodeDirectoryVersion::SupportsCodeLimit64)?;
        let code_limit_64 = r.u64_since(version, CodeDirectoryVersion::SupportsCodeLimit64)?;
        let exec_seg_base = r.u64_since(version, CodeDirectoryVersion::SupportsExecutableSegment)?;
        let exec_seg_limit =
            r.u64_since(version, CodeDirectoryVersion::SupportsExecutableSegment)?;
        let exec_seg_flags = r
            .u64_since(version, CodeDirectoryVersion::SupportsExecutableSegment)?
            .map(ExecutableSegmentFlags::from_bits_truncate);

        let ident = nul_terminated(data, ident_offset)
            .ok_or(MachOSignError::CodeDirectoryMalformedIdentifier)?;

        let team_name = team_offset
            .map(|offset| {
                nul_terminated(data, offset as usize).ok_or_else(|| {
                    MachOSignError::Format("code directory team name is malformed".into())
                })
            })
            .transpose()?;

        let code_hashes = digest_run(data, hash_offset, code_count, hash_size as usize)?;

        let specials_start = hash_offset
            .checked_sub(hash_size as usize * special_count as usize)
            .ok_or_else(|| {
                MachOSignError::Format("code directory special slots underflow".into())
            })?;

        // Stored highest slot first, ending just before the code hashes.
        let special_hashes = digest_run(
            data,
            specials_start,
            special_count as usize,
            hash_size as usize,
        )?
        .into_iter()
        .zip((1..=special_count).rev())
        .map(|(digest, slot)| (CodeSigningSlot::from(slot), digest))
        .collect();

        Ok(Self {
            version,
            flags,
            code_limit,
            hash_size,
            hash_type,
            platform,
            page_size,
            spare2,
            scatter_offset,
            spare3,
            code_limit_64,
            exec_seg_base,
            exec_seg_limit,
            exec_seg_flags,
            ident,
            team_name,
            code_hashes,
            special_hashes,
        })
    }

    fn serialize_payload(&self) -> Result<Vec<u8>, MachOSignError> {
        if self.scatter_offset.is_some() {
            return Err(MachOSignError::Format(
                "scatter vectors are not supported".into(),
            ));
        }

        let special_count = self
            .special_hashes
            .keys()
            .map(|slot| u32::from(*slot))
            .max()
            .unwrap_or(0);

        if let Some(slot) = (1..=special_count)
            .map(CodeSigningSlot::from)
            .find(|slot| !slot.is_code_directory_specials_expressible())
        {
            return Err(MachOSignError::Format(format!(
                "slot {:?} cannot be recorded in code directory",
                slot
            )));
        }

        let has_team = self.team_name.is_some()
            && CodeDirectoryVersion::SupportsTeamId.is_met_by(self.version);

        // Offsets are from the start of the blob, header included.
        let ident_offset = header_size(self.version);
        let team_offset = ident_offset + self.ident.len() + 1;
        let specials_offset = match (&self.team_name, has_team) {
            (Some(team), true) => team_offset + team.len() + 1,
            _ => team_offset,
        };
        let hash_offset = specials_offset + special_count as usize * self.hash_size as usize;

        let to_u32 = |value: usize| {
            u32::try_from(value)
                .map_err(|_| MachOSignError::Layout("code directory exceeds 4 GiB".into()))
        };

        let mut out = Vec::new();
        out.iowrite_with(self.version, scroll::BE)?;
        out.iowrite_with(self.flags.bits(), scroll::BE)?;
        out.iowrite_with(to_u32(hash_offset)?, scroll::BE)?;
        out.iowrite_with(to_u32(ident_offset)?, scroll::BE)?;
        out.iowrite_with(special_count, scroll::BE)?;
        out.iowrite_with(to_u32(self.code_hashes.len())?, scroll::BE)?;
        out.iowrite_with(self.code_limit, scroll::BE)?;
        out.iowrite_with(self.hash_size, scroll::BE)?;
        out.iowrite_with(u8::from(self.hash_type), scroll::BE)?;
        out.iowrite_with(self.platform, scroll::BE)?;
        out.iowrite_with(self.page_size.trailing_zeros() as u8, scroll::BE)?;
        out.iowrite_with(self.spare2, scroll::BE)?;

        if CodeDirectoryVersion::SupportsScatter.is_met_by(self.version) {
            out.iowrite_with(0u32, scroll::BE)?;
        }
        if CodeDirectoryVersion::SupportsTeamId.is_met_by(self.version) {
            let offset = if has_team { to_u32(team_offset)? } else { 0 };
            out.iowrite_with(offset, scroll::BE)?;
        }
        if CodeDirectoryVersion::SupportsCodeLimit64.is_met_by(self.version) {
            out.iowrite_with(self.spare3.unwrap_or(0), scroll::BE)?;
            out.iowrite_with(self.code_limit_64.unwrap_or(0), scroll::BE)?;
        }
        if CodeDirectoryVersion::SupportsExecutableSegment.is_met_by(self.version) {
            let exec_flags = self.exec_seg_flags.unwrap_or_else(ExecutableSegmentFlags::empty);
            out.iowrite_with(self.exec_seg_base.unwrap_or(0), scroll::BE)?;
            out.iowrite_with(self.exec_seg_limit.unwrap_or(0), scroll::BE)?;
            out.iowrite_with(exec_flags.bits(), scroll::BE)?;
        }

        out.write_all(self.ident.as_bytes())?;
        out.push(0);

        if let (Some(team), true) = (&self.team_name, has_team) {
            out.write_all(team.as_bytes())?;
            out.push(0);
        }

        // Absent specials below the highest one are zero filled.
        let zero = vec![0u8; self.hash_size as usize];
        for slot in (1..=special_count).rev().map(CodeSigningSlot::from) {
            out.write_all(self.special_hashes.get(&slot).unwrap_or(&zero))?;
        }

        for digest in &self.code_hashes {
            out.write_all(digest)?;
        }

        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample(code_hashes: usize) -> CodeDirectoryBlob {
        let mut special_hashes = HashMap::new();
        special_hashes.insert(CodeSigningSlot::RequirementSet, vec![0x22; 32]);

        CodeDirectoryBlob {
            version: CodeDirectoryVersion::SupportsExecutableSegment as u32,
            flags: CodeSignatureFlags::ADHOC,
            code_limit: 8000,
            hash_size: 32,
            hash_type: DigestType::Sha256,
            platform: 0,
            page_size: 4096,
            spare2: 0,
            scatter_offset: None,
            spare3: None,
            code_limit_64: None,
            exec_seg_base: Some(0),
            exec_seg_limit: Some(4096),
            exec_seg_flags: Some(ExecutableSegmentFlags::MAIN_BINARY),
            ident: "hello".into(),
            team_name: None,
            code_hashes: (0..code_hashes).map(|i| vec![i as u8; 32]).collect(),
            special_hashes,
        }
    }

    #[test]
    fn header_layout() -> Result<(), MachOSignError> {
        let data = sample(2).to_blob_bytes()?;

        // header + "hello\0" + 2 special slots + 2 code hashes
        assert_eq!(data.len(), CODE_DIRECTORY_HEADER_SIZE + 6 + 64 + 64);
        assert_eq!(data.pread_with::<u32>(0, scroll::BE)?, 0xfade0c02);
        assert_eq!(data.pread_with::<u32>(4, scroll::BE)?, data.len() as u32);
        assert_eq!(data.pread_with::<u32>(8, scroll::BE)?, 0x20400);
        assert_eq!(data.pread_with::<u32>(12, scroll::BE)?, 2);
        // hash offset, identifier offset
        assert_eq!(data.pread_with::<u32>(16, scroll::BE)?, 88 + 6 + 64);
        assert_eq!(data.pread_with::<u32>(20, scroll::BE)?, 88);
        // special and code slot counts
        assert_eq!(data.pread_with::<u32>(24, scroll::BE)?, 2);
        assert_eq!(data.pread_with::<u32>(28, scroll::BE)?, 2);
        assert_eq!(data.pread_with::<u32>(32, scroll::BE)?, 8000);
        assert_eq!(data[36], 32);
        assert_eq!(data[37], 2);
        assert_eq!(data[39], 12);
        assert_eq!(data.pread_with::<u64>(72, scroll::BE)?, 4096);
        assert_eq!(data.pread_with::<u64>(80, scroll::BE)?, 1);
        assert_eq!(&data[88..94], b"hello\0");

        // Info slot (-1) is zero filled, requirements slot (-2) precedes it.
        assert_eq!(&data[94..126], &[0x22; 32]);
        assert_eq!(&data[126..158], &[0u8; 32]);

        Ok(())
    }

    #[test]
    fn parse_serialized() -> Result<(), MachOSignError> {
        let original = sample(3);
        let data = original.to_blob_bytes()?;

        let parsed = CodeDirectoryBlob::from_blob_bytes(&data)?;
        assert_eq!(parsed.ident, "hello");
        assert_eq!(parsed.flags, CodeSignatureFlags::ADHOC);
        assert_eq!(parsed.code_limit, 8000);
        assert_eq!(parsed.page_size, 4096);
        assert_eq!(parsed.hash_type, DigestType::Sha256);
        assert_eq!(parsed.code_hashes, original.code_hashes);
        assert_eq!(
            parsed.special_hashes.get(&CodeSigningSlot::RequirementSet),
            Some(&vec![0x22; 32])
        );
        assert_eq!(
            parsed.special_hashes.get(&CodeSigningSlot::Info),
            Some(&vec![0u8; 32])
        );
        assert_eq!(
            parsed.exec_seg_flags,
            Some(ExecutableSegmentFlags::MAIN_BINARY)
        );

        Ok(())
    }

    #[test]
    fn team_name_written() -> Result<(), MachOSignError> {
        let mut cd = sample(1);
        cd.team_name = Some("TEAM".into());

        let data = cd.to_blob_bytes()?;
        let team_offset = data.pread_with::<u32>(48, scroll::BE)? as usize;
        assert_eq!(&data[team_offset..team_offset + 5], b"TEAM\0");

        let parsed = CodeDirectoryBlob::from_blob_bytes(&data)?;
        assert_eq!(parsed.team_name.as_deref(), Some("TEAM"));

        Ok(())
    }
}
