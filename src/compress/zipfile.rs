//! Zip archiving with deflated members.

use super::ArchiveMember;
use crate::error::Error;
use crate::Result;
use std::io::{Cursor, Read, Write};
use zip::write::SimpleFileOptions;
use zip::{CompressionMethod, ZipArchive, ZipWriter};

pub fn pack(members: &[ArchiveMember]) -> Result<Vec<u8>> {
    let mut writer = ZipWriter::new(Cursor::new(Vec::new()));
    // Pinned metadata keeps the archive byte-identical across runs.
    let options = SimpleFileOptions::default()
        .compression_method(CompressionMethod::Deflated)
        .last_modified_time(zip::DateTime::default())
        .unix_permissions(0o644);

    for member in members {
        writer
            .start_file(member.name.as_str(), options)
            .map_err(|e| Error::CorruptArchive(format!("zip write: {}", e)))?;
        writer.write_all(&member.data)?;
    }

    let cursor = writer
        .finish()
        .map_err(|e| Error::CorruptArchive(format!("zip finish: {}", e)))?;
    Ok(cursor.into_inner())
}

pub fn unpack(bytes: &[u8]) -> Result<Vec<ArchiveMember>> {
    let mut archive = ZipArchive::new(Cursor::new(bytes))
        .map_err(|e| Error::CorruptArchive(format!("zip open: {}", e)))?;

    let mut members = Vec::with_capacity(archive.len());
    for i in 0..archive.len() {
        let mut file = archive
            .by_index(i)
            .map_err(|e| Error::CorruptArchive(format!("zip entry {}: {}", i, e)))?;
        let name = file.name().to_string();
        let mut data = Vec::with_capacity(file.size() as usize);
        file.read_to_end(&mut data)
            .map_err(|e| Error::CorruptArchive(format!("zip entry {}: {}", name, e)))?;
        members.push(ArchiveMember { name, data });
    }
    Ok(members)
}
