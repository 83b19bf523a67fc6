//! Reversible archiving of artifact streams.
//!
//! Two formats: `zip` (deflated members) and `tar` (gzip-wrapped archive).
//! Member metadata is pinned (zero mtime, 0644 mode) so identical inputs
//! produce identical archives.

mod tarball;
mod zipfile;

use crate::config::CompressionType;
use crate::Result;

/// One named entry inside an archive.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArchiveMember {
    pub name: String,
    pub data: Vec<u8>,
}

/// Build an archive holding the given members, in order.
pub fn compress(kind: CompressionType, members: &[ArchiveMember]) -> Result<Vec<u8>> {
    match kind {
        CompressionType::Zip => zipfile::pack(members),
        CompressionType::Tar => tarball::pack(members),
    }
}

/// Extract every member of an archive, preserving order.
pub fn extract(kind: CompressionType, bytes: &[u8]) -> Result<Vec<ArchiveMember>> {
    match kind {
        CompressionType::Zip => zipfile::unpack(bytes),
        CompressionType::Tar => tarball::unpack(bytes),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn members() -> Vec<ArchiveMember> {
        vec![
            ArchiveMember {
                name: "tables.sql".into(),
                data: b"CREATE TABLE a (id INT);\n".to_vec(),
            },
            ArchiveMember {
                name: "data.sql".into(),
                data: b"INSERT INTO a VALUES (1);\n".to_vec(),
            },
        ]
    }

    #[test]
    fn zip_round_trip_preserves_members() {
        let archive = compress(CompressionType::Zip, &members()).unwrap();
        let out = extract(CompressionType::Zip, &archive).unwrap();
        assert_eq!(out, members());
    }

    #[test]
    fn tar_round_trip_preserves_members() {
        let archive = compress(CompressionType::Tar, &members()).unwrap();
        let out = extract(CompressionType::Tar, &archive).unwrap();
        assert_eq!(out, members());
    }

    #[test]
    fn archives_are_deterministic() {
        for kind in [CompressionType::Zip, CompressionType::Tar] {
            let a = compress(kind, &members()).unwrap();
            let b = compress(kind, &members()).unwrap();
            assert_eq!(a, b, "{:?} archive differs between runs", kind);
        }
    }

    #[test]
    fn garbage_input_is_a_corrupt_archive() {
        for kind in [CompressionType::Zip, CompressionType::Tar] {
            let err = extract(kind, b"definitely not an archive").unwrap_err();
            assert!(matches!(err, crate::Error::CorruptArchive(_)));
        }
    }

    #[test]
    fn truncated_zip_is_detected() {
        let archive = compress(CompressionType::Zip, &members()).unwrap();
        let err = extract(CompressionType::Zip, &archive[..archive.len() / 2]).unwrap_err();
        assert!(matches!(err, crate::Error::CorruptArchive(_)));
    }
}
