// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

/*! Mutable Mach-O document used for signing.

Code signing data is embedded within the named `__LINKEDIT` segment of
the Mach-O binary. An `LC_CODE_SIGNATURE` load command in the Mach-O header
points at this data.

[MachOBinary] holds the raw file bytes plus an index of load commands
keyed by their offset within the command area. Every structural edit goes
through a typed helper which writes the command back in the binary's own
endianness and re-indexes. The index is built with `scroll` rather than
goblin's full parser because edits made mid-signing (a zeroed signature
command, a `__LINKEDIT` pointing past EOF) are transiently outside what
goblin will accept.
*/

use {
    crate::{embedded_signature::EmbeddedSignature, error::MachOSignError},
    goblin::{
        container::Ctx,
        mach::{
            constants::{SEG_LINKEDIT, SEG_TEXT},
            cputype::get_arch_name_from_types,
            header::{Header, MH_EXECUTE, SIZEOF_HEADER_32, SIZEOF_HEADER_64},
            load_command::{
                LinkeditDataCommand, Section32, Section64, SegmentCommand32, SegmentCommand64,
                LC_CODE_SIGNATURE, LC_SEGMENT, LC_SEGMENT_64, SIZEOF_LINKEDIT_DATA_COMMAND,
                SIZEOF_SECTION_32, SIZEOF_SECTION_64, SIZEOF_SEGMENT_COMMAND_32,
                SIZEOF_SEGMENT_COMMAND_64,
            },
            parse_magic_and_ctx, Mach,
        },
    },
    log::debug,
    scroll::{Pread, Pwrite},
    std::{fs::Permissions, io::Write, ops::Range, path::Path},
};

/// `codesign` rounds the `__LINKEDIT` vmsize up to this boundary.
const LINKEDIT_VM_ALIGNMENT: u64 = 16384;

/// Offset of `ncmds` within the Mach-O header. `sizeofcmds` follows it.
const HEADER_NCMDS_OFFSET: usize = 16;
const HEADER_SIZEOFCMDS_OFFSET: usize = 20;

/// Classification of an indexed load command.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum LoadCommandKind {
    Segment32,
    Segment64,
    CodeSignature,
    Other,
}

/// A load command as addressed by the command index.
#[derive(Clone, Copy, Debug)]
pub struct LoadCommandEntry {
    /// Absolute file offset of the command.
    pub offset: usize,
    pub cmd: u32,
    pub cmdsize: u32,
    pub kind: LoadCommandKind,
}

/// Summary of a segment load command.
#[derive(Clone, Debug)]
pub struct SegmentInfo {
    pub name: String,
    /// Index into the load command table.
    pub command_index: usize,
    pub fileoff: u64,
    pub filesize: u64,
    pub vmsize: u64,
}

impl SegmentInfo {
    /// The file range covered by this segment.
    pub fn file_range(&self) -> Range<u64> {
        self.fileoff..self.fileoff + self.filesize
    }
}

fn round_up(value: u64, alignment: u64) -> u64 {
    match value % alignment {
        0 => value,
        remainder => value + alignment - remainder,
    }
}

fn segment_name(raw: &[u8; 16]) -> String {
    String::from_utf8_lossy(raw)
        .trim_end_matches('\0')
        .to_string()
}

fn read_header(data: &[u8], ctx: Ctx) -> Result<Header, MachOSignError> {
    data.pread_with::<Header>(0, ctx)
        .map_err(|e| MachOSignError::Format(format!("truncated Mach-O header: {}", e)))
}

/// An in-memory, editable thin Mach-O binary.
pub struct MachOBinary {
    data: Vec<u8>,
    ctx: Ctx,
    header: Header,
    header_size: usize,
    commands: Vec<LoadCommandEntry>,
    segments: Vec<SegmentInfo>,
    /// File offset of the first section or segment content following the
    /// command area. Load commands may not grow past it.
    first_content_offset: usize,
    permissions: Option<Permissions>,
}

impl std::fmt::Debug for MachOBinary {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MachOBinary")
            .field("length", &self.data.len())
            .field("cputype", &self.header.cputype)
            .field("filetype", &self.header.filetype)
            .field("commands", &self.commands)
            .field("segments", &self.segments)
            .finish()
    }
}

impl MachOBinary {
    /// Read and parse a Mach-O file from the filesystem.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, MachOSignError> {
        let path = path.as_ref();
        let data = std::fs::read(path)?;
        let permissions = std::fs::metadata(path)?.permissions();

        let mut binary = Self::from_bytes(data)?;
        binary.permissions = Some(permissions);

        Ok(binary)
    }

    /// Parse a Mach-O binary from owned bytes.
    pub fn from_bytes(data: Vec<u8>) -> Result<Self, MachOSignError> {
        match Mach::parse(&data)
            .map_err(|e| MachOSignError::Format(format!("unable to parse Mach-O: {}", e)))?
        {
            Mach::Fat(multi) => {
                let arches = multi
                    .arches()
                    .map_err(|e| MachOSignError::Format(format!("bad fat header: {}", e)))?
                    .iter()
                    .map(|arch| {
                        get_arch_name_from_types(arch.cputype, arch.cpusubtype)
                            .map(|name| name.to_string())
                            .unwrap_or_else(|| format!("cputype {:#x}", arch.cputype))
                    })
                    .collect::<Vec<_>>();

                return Err(MachOSignError::Format(format!(
                    "fat binaries are not supported (contains {})",
                    arches.join(", ")
                )));
            }
            Mach::Binary(_) => {}
        }

        let ctx = parse_magic_and_ctx(&data, 0)
            .map_err(|e| MachOSignError::Format(format!("bad Mach-O magic: {}", e)))?
            .1
            .ok_or_else(|| MachOSignError::Format("bad Mach-O magic".into()))?;

        let header = read_header(&data, ctx)?;
        let header_size = if ctx.is_big() {
            SIZEOF_HEADER_64
        } else {
            SIZEOF_HEADER_32
        };

        let mut binary = Self {
            data,
            ctx,
            header,
            header_size,
            commands: vec![],
            segments: vec![],
            first_content_offset: 0,
            permissions: None,
        };
        binary.reindex()?;

        Ok(binary)
    }

    fn ncmds(&self) -> Result<u32, MachOSignError> {
        Ok(self.data.pread_with(HEADER_NCMDS_OFFSET, self.ctx.le)?)
    }

    fn sizeofcmds(&self) -> Result<u32, MachOSignError> {
        Ok(self.data.pread_with(HEADER_SIZEOFCMDS_OFFSET, self.ctx.le)?)
    }

    fn write_command_counts(&mut self, ncmds: u32, sizeofcmds: u32) -> Result<(), MachOSignError> {
        let le = self.ctx.le;
        self.data.pwrite_with(ncmds, HEADER_NCMDS_OFFSET, le)?;
        self.data.pwrite_with(sizeofcmds, HEADER_SIZEOFCMDS_OFFSET, le)?;

        Ok(())
    }

    /// Rebuild the load command index from the raw bytes.
    fn reindex(&mut self) -> Result<(), MachOSignError> {
        let le = self.ctx.le;
        self.header = read_header(&self.data, self.ctx)?;

        let ncmds = self.ncmds()?;
        let sizeofcmds = self.sizeofcmds()? as usize;
        let commands_end = self.header_size + sizeofcmds;

        if commands_end > self.data.len() {
            return Err(MachOSignError::Format(format!(
                "load commands end at {} beyond file length {}",
                commands_end,
                self.data.len()
            )));
        }

        let mut commands = Vec::with_capacity(ncmds as usize);
        let mut segments = vec![];
        let mut first_content_offset = self.data.len();
        let mut offset = self.header_size;

        for index in 0..ncmds as usize {
            let cmd = self.data.pread_with::<u32>(offset, le)?;
            let cmdsize = self.data.pread_with::<u32>(offset + 4, le)?;

            if cmdsize < 8 || offset + cmdsize as usize > commands_end {
                return Err(MachOSignError::Format(format!(
                    "load command {} at offset {} has bad size {}",
                    index, offset, cmdsize
                )));
            }

            let kind = match cmd {
                LC_SEGMENT => LoadCommandKind::Segment32,
                LC_SEGMENT_64 => LoadCommandKind::Segment64,
                LC_CODE_SIGNATURE => LoadCommandKind::CodeSignature,
                _ => LoadCommandKind::Other,
            };

            // Section headers trail the segment command.
            let mut section_offsets = vec![];

            match kind {
                LoadCommandKind::Segment64 => {
                    let segment = self.data.pread_with::<SegmentCommand64>(offset, le)?;
                    for i in 0..segment.nsects as usize {
                        let section = self.data.pread_with::<Section64>(
                            offset + SIZEOF_SEGMENT_COMMAND_64 + i * SIZEOF_SECTION_64,
                            le,
                        )?;
                        section_offsets.push(section.offset as u64);
                    }
                    if segment.filesize > 0 && segment.fileoff > 0 {
                        section_offsets.push(segment.fileoff);
                    }

                    segments.push(SegmentInfo {
                        name: segment_name(&segment.segname),
                        command_index: index,
                        fileoff: segment.fileoff,
                        filesize: segment.filesize,
                        vmsize: segment.vmsize,
                    });
                }
                LoadCommandKind::Segment32 => {
                    let segment = self.data.pread_with::<SegmentCommand32>(offset, le)?;
                    for i in 0..segment.nsects as usize {
                        let section = self.data.pread_with::<Section32>(
                            offset + SIZEOF_SEGMENT_COMMAND_32 + i * SIZEOF_SECTION_32,
                            le,
                        )?;
                        section_offsets.push(section.offset as u64);
                    }
                    if segment.filesize > 0 && segment.fileoff > 0 {
                        section_offsets.push(segment.fileoff as u64);
                    }

                    segments.push(SegmentInfo {
                        name: segment_name(&segment.segname),
                        command_index: index,
                        fileoff: segment.fileoff as u64,
                        filesize: segment.filesize as u64,
                        vmsize: segment.vmsize as u64,
                    });
                }
                LoadCommandKind::CodeSignature => {
                    if (cmdsize as usize) < SIZEOF_LINKEDIT_DATA_COMMAND {
                        return Err(MachOSignError::Format(
                            "LC_CODE_SIGNATURE command is truncated".into(),
                        ));
                    }
                }
                LoadCommandKind::Other => {}
            }

            // Zero offsets denote zerofill sections or segments with no file data.
            for content_offset in section_offsets.into_iter().filter(|o| *o != 0) {
                first_content_offset = first_content_offset.min(content_offset as usize);
            }

            commands.push(LoadCommandEntry {
                offset,
                cmd,
                cmdsize,
                kind,
            });

            offset += cmdsize as usize;
        }

        if offset != commands_end {
            return Err(MachOSignError::Format(format!(
                "load command sizes sum to {} but header declares {}",
                offset - self.header_size,
                sizeofcmds
            )));
        }

        self.commands = commands;
        self.segments = segments;
        self.first_content_offset = first_content_offset;

        Ok(())
    }

    /// Raw bytes of the binary in its current state.
    pub fn data(&self) -> &[u8] {
        &self.data
    }

    /// The indexed load commands, in file order.
    pub fn load_commands(&self) -> &[LoadCommandEntry] {
        &self.commands
    }

    pub fn segments(&self) -> &[SegmentInfo] {
        &self.segments
    }

    pub fn cpu_type(&self) -> u32 {
        self.header.cputype
    }

    pub fn is_64bit(&self) -> bool {
        self.ctx.is_big()
    }

    /// Whether this is a main executable (`MH_EXECUTE`).
    pub fn is_executable(&self) -> bool {
        self.header.filetype == MH_EXECUTE
    }

    /// File offset where the load command area ends.
    pub fn load_commands_end(&self) -> Result<usize, MachOSignError> {
        Ok(self.header_size + self.sizeofcmds()? as usize)
    }

    /// File offset of the first segment or section content.
    pub fn first_content_offset(&self) -> usize {
        self.first_content_offset
    }

    pub fn has_code_signature(&self) -> bool {
        self.commands
            .iter()
            .any(|c| c.kind == LoadCommandKind::CodeSignature)
    }

    /// Resolve the `LC_CODE_SIGNATURE` command and its index in the command table.
    pub fn code_signature_command(&self) -> Result<(LinkeditDataCommand, usize), MachOSignError> {
        let (index, entry) = self
            .commands
            .iter()
            .enumerate()
            .find(|(_, c)| c.kind == LoadCommandKind::CodeSignature)
            .ok_or(MachOSignError::NotFound("code signature load command"))?;

        Ok((
            self.data
                .pread_with::<LinkeditDataCommand>(entry.offset, self.ctx.le)?,
            index,
        ))
    }

    /// The `__LINKEDIT` segment.
    pub fn linkedit_segment(&self) -> Result<&SegmentInfo, MachOSignError> {
        self.segments
            .iter()
            .find(|s| s.name == SEG_LINKEDIT)
            .ok_or(MachOSignError::MissingLinkedit)
    }

    /// File range of the `__TEXT` segment.
    pub fn text_segment_range(&self) -> Result<Range<u64>, MachOSignError> {
        self.segments
            .iter()
            .find(|s| s.name == SEG_TEXT)
            .map(|s| s.file_range())
            .ok_or(MachOSignError::NotFound("__TEXT segment"))
    }

    /// The file offset at which code hashing stops.
    ///
    /// This is the signature data offset when one is set, else the file length.
    pub fn code_limit(&self) -> usize {
        match self.code_signature_command() {
            Ok((command, _)) if command.dataoff != 0 => command.dataoff as usize,
            _ => self.data.len(),
        }
    }

    /// Raw bytes advertised by `LC_CODE_SIGNATURE`, if any.
    pub fn code_signature_data(&self) -> Result<Option<&[u8]>, MachOSignError> {
        let command = match self.code_signature_command() {
            Ok((command, _)) => command,
            Err(MachOSignError::NotFound(_)) => return Ok(None),
            Err(e) => return Err(e),
        };

        if command.dataoff == 0 {
            return Ok(None);
        }

        let start = command.dataoff as usize;
        let end = start + command.datasize as usize;

        self.data
            .get(start..end)
            .map(Some)
            .ok_or(MachOSignError::Patch {
                offset: start,
                length: command.datasize as usize,
                reason: "signature data extends beyond end of file",
            })
    }

    /// Parse the embedded signature, if present.
    pub fn embedded_signature(&self) -> Result<Option<EmbeddedSignature<'_>>, MachOSignError> {
        match self.code_signature_data()? {
            Some(data) => Ok(Some(EmbeddedSignature::from_bytes(data)?)),
            None => Ok(None),
        }
    }

    /// Set `__LINKEDIT`'s filesize and derive its vmsize.
    fn resize_linkedit(&mut self, filesize: u64) -> Result<(), MachOSignError> {
        let segment = self.linkedit_segment()?;
        let entry = self.commands[segment.command_index];
        let vmsize = round_up(filesize, LINKEDIT_VM_ALIGNMENT);
        let le = self.ctx.le;

        debug!(
            "resizing __LINKEDIT to filesize {} vmsize {}",
            filesize, vmsize
        );

        match entry.kind {
            LoadCommandKind::Segment64 => {
                let mut segment = self.data.pread_with::<SegmentCommand64>(entry.offset, le)?;
                segment.filesize = filesize;
                segment.vmsize = vmsize;
                self.data.pwrite_with(segment, entry.offset, le)?;
            }
            LoadCommandKind::Segment32 => {
                let mut segment = self.data.pread_with::<SegmentCommand32>(entry.offset, le)?;
                segment.filesize = u32::try_from(filesize).map_err(|_| {
                    MachOSignError::Layout("__LINKEDIT size exceeds 32-bit range".into())
                })?;
                segment.vmsize = u32::try_from(vmsize).map_err(|_| {
                    MachOSignError::Layout("__LINKEDIT vmsize exceeds 32-bit range".into())
                })?;
                self.data.pwrite_with(segment, entry.offset, le)?;
            }
            _ => return Err(MachOSignError::MissingLinkedit),
        }

        self.reindex()
    }

    /// Delete the `LC_CODE_SIGNATURE` command and the signature data it references.
    ///
    /// Commands following the removed one are shifted down and the vacated tail
    /// of the command area is zeroed. The file is truncated to the former
    /// signature offset and `__LINKEDIT` shrinks to match. This is a no-op when
    /// no signature command exists.
    pub fn remove_existing_signature(&mut self) -> Result<(), MachOSignError> {
        let (command, index) = match self.code_signature_command() {
            Ok(v) => v,
            Err(MachOSignError::NotFound(_)) => return Ok(()),
            Err(e) => return Err(e),
        };

        let dataoff = command.dataoff as usize;
        let datasize = command.datasize as usize;

        // A zeroed placeholder has no data to remove.
        if dataoff != 0 {
            if dataoff + datasize != self.data.len() {
                return Err(MachOSignError::Patch {
                    offset: dataoff,
                    length: datasize,
                    reason: "signature data does not end at end of file",
                });
            }

            let linkedit = self.linkedit_segment()?.file_range();
            if (dataoff as u64) < linkedit.start || ((dataoff + datasize) as u64) > linkedit.end {
                return Err(MachOSignError::Patch {
                    offset: dataoff,
                    length: datasize,
                    reason: "signature data lies outside __LINKEDIT",
                });
            }
        }

        let entry = self.commands[index];
        let commands_end = self.load_commands_end()?;
        let command_start = entry.offset;
        let command_end = command_start + entry.cmdsize as usize;

        self.data
            .copy_within(command_end..commands_end, command_start);
        self.data[commands_end - entry.cmdsize as usize..commands_end].fill(0);

        let ncmds = self.ncmds()? - 1;
        let sizeofcmds = self.sizeofcmds()? - entry.cmdsize;
        self.write_command_counts(ncmds, sizeofcmds)?;
        self.reindex()?;

        if dataoff != 0 {
            debug!(
                "removing {} bytes of signature data at offset {}",
                datasize, dataoff
            );
            self.data.truncate(dataoff);
            let fileoff = self.linkedit_segment()?.fileoff;
            self.resize_linkedit(dataoff as u64 - fileoff)?;
        }

        Ok(())
    }

    /// Append a zeroed `LC_CODE_SIGNATURE` command to the command area.
    pub fn insert_empty_code_signature_command(&mut self) -> Result<(), MachOSignError> {
        if self.has_code_signature() {
            return Err(MachOSignError::Layout(
                "binary already has a code signature load command".into(),
            ));
        }

        self.linkedit_segment()?;

        let commands_end = self.load_commands_end()?;
        let new_end = commands_end + SIZEOF_LINKEDIT_DATA_COMMAND;

        if new_end > self.first_content_offset {
            return Err(MachOSignError::LoadCommandNoRoom);
        }

        let command = LinkeditDataCommand {
            cmd: LC_CODE_SIGNATURE,
            cmdsize: SIZEOF_LINKEDIT_DATA_COMMAND as u32,
            dataoff: 0,
            datasize: 0,
        };

        let le = self.ctx.le;
        self.data.pwrite_with(command, commands_end, le)?;

        let ncmds = self.ncmds()? + 1;
        let sizeofcmds = self.sizeofcmds()? + SIZEOF_LINKEDIT_DATA_COMMAND as u32;
        self.write_command_counts(ncmds, sizeofcmds)?;

        self.reindex()
    }

    /// Point `LC_CODE_SIGNATURE` at a file range and grow `__LINKEDIT` to cover it.
    ///
    /// Only the in-memory header is changed. The signature bytes are written later
    /// with [Self::patch_bytes].
    pub fn set_code_signature_offsets(
        &mut self,
        dataoff: u32,
        datasize: u32,
    ) -> Result<(), MachOSignError> {
        let (mut command, index) = self.code_signature_command()?;
        let linkedit_fileoff = self.linkedit_segment()?.fileoff;

        if dataoff as usize > self.data.len() {
            return Err(MachOSignError::Layout(format!(
                "signature offset {} is past the end of the {} byte binary",
                dataoff,
                self.data.len()
            )));
        }

        if (dataoff as u64) < linkedit_fileoff {
            return Err(MachOSignError::Layout(format!(
                "signature offset {} precedes __LINKEDIT at {}",
                dataoff, linkedit_fileoff
            )));
        }

        command.dataoff = dataoff;
        command.datasize = datasize;

        let offset = self.commands[index].offset;
        let le = self.ctx.le;
        self.data.pwrite_with(command, offset, le)?;

        self.resize_linkedit(dataoff as u64 + datasize as u64 - linkedit_fileoff)
    }

    /// Write bytes at an absolute offset, zero extending the buffer as needed.
    pub fn patch_bytes(&mut self, data: &[u8], offset: usize) -> Result<(), MachOSignError> {
        let end = offset
            .checked_add(data.len())
            .filter(|end| *end <= u32::MAX as usize)
            .ok_or(MachOSignError::Patch {
                offset,
                length: data.len(),
                reason: "range exceeds addressable file offsets",
            })?;

        if end > self.data.len() {
            self.data.resize(end, 0);
        }

        self.data[offset..end].copy_from_slice(data);

        Ok(())
    }

    /// Atomically write the binary to `path`.
    ///
    /// Data is written to a temporary file in the destination directory which is
    /// then renamed over the destination. Permissions of an existing destination
    /// are retained, else those of the loaded source file are used.
    pub fn save(&self, path: impl AsRef<Path>) -> Result<(), MachOSignError> {
        let path = path.as_ref();
        let dir = match path.parent() {
            Some(p) if !p.as_os_str().is_empty() => p,
            _ => Path::new("."),
        };

        let permissions = match std::fs::metadata(path) {
            Ok(metadata) => Some(metadata.permissions()),
            Err(_) => self.permissions.clone(),
        };

        let mut temp = tempfile::NamedTempFile::new_in(dir)?;
        temp.write_all(&self.data)?;
        temp.as_file().sync_all()?;

        if let Some(permissions) = permissions {
            temp.as_file().set_permissions(permissions)?;
        }

        temp.persist(path).map_err(|e| MachOSignError::Io(e.error))?;

        Ok(())
    }
}
