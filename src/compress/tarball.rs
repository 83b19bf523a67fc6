//! Gzip-wrapped tar archiving.

use super::ArchiveMember;
use crate::error::Error;
use crate::Result;
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use std::io::Read;

pub fn pack(members: &[ArchiveMember]) -> Result<Vec<u8>> {
    let encoder = GzEncoder::new(Vec::new(), Compression::default());
    let mut builder = tar::Builder::new(encoder);

    for member in members {
        let mut header = tar::Header::new_gnu();
        header.set_size(member.data.len() as u64);
        header.set_mode(0o644);
        header.set_mtime(0);
        builder
            .append_data(&mut header, member.name.as_str(), member.data.as_slice())
            .map_err(|e| Error::CorruptArchive(format!("tar write {}: {}", member.name, e)))?;
    }

    let encoder = builder
        .into_inner()
        .map_err(|e| Error::CorruptArchive(format!("tar finish: {}", e)))?;
    encoder
        .finish()
        .map_err(|e| Error::CorruptArchive(format!("gzip finish: {}", e)))
}

pub fn unpack(bytes: &[u8]) -> Result<Vec<ArchiveMember>> {
    let mut archive = tar::Archive::new(GzDecoder::new(bytes));
    let mut members = Vec::new();

    let entries = archive
        .entries()
        .map_err(|e| Error::CorruptArchive(format!("tar open: {}", e)))?;
    for entry in entries {
        let mut entry = entry.map_err(|e| Error::CorruptArchive(format!("tar entry: {}", e)))?;
        let name = entry
            .path()
            .map_err(|e| Error::CorruptArchive(format!("tar entry name: {}", e)))?
            .to_string_lossy()
            .into_owned();
        let mut data = Vec::with_capacity(entry.size() as usize);
        entry
            .read_to_end(&mut data)
            .map_err(|e| Error::CorruptArchive(format!("tar entry {}: {}", name, e)))?;
        members.push(ArchiveMember { name, data });
    }
    Ok(members)
}
