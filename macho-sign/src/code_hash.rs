// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

/*! Functionality related to hashing code.

The Mach-O signature data contains cryptographic hashes of the content
of the thing being signed. The binary is split into pages of 4096 bytes
and the hash of each page is written to the code directory. When a page
is loaded by the kernel, its hash is verified against that record.
*/

use crate::{embedded_signature::DigestType, error::MachOSignError};

/// Page size used for code hashes.
pub const CODE_PAGE_SIZE: usize = 4096;

/// Compute paged hashes.
///
/// `data` is split into chunks of `page_size` and each chunk is hashed.
/// The final chunk is hashed over its actual length, without padding.
pub fn paged_digests(
    data: &[u8],
    hash: DigestType,
    page_size: usize,
) -> Result<Vec<Vec<u8>>, MachOSignError> {
    data.chunks(page_size)
        .map(|chunk| hash.digest_data(chunk))
        .collect::<Result<Vec<_>, MachOSignError>>()
}

/// Number of pages needed to cover `length` bytes.
pub fn page_count(length: usize, page_size: usize) -> usize {
    (length + page_size - 1) / page_size
}
