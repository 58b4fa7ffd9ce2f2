//! Root filesystem archives produced by firmware extraction.
//!
//! Extraction itself is an external collaborator; the image builder only
//! needs "unpack every entry, preserving permissions, into this directory".
//! Device nodes are skipped: creating them needs root, and the guest fix-up
//! script recreates the ones the firmware expects.

use crate::process::Cmd;
use anyhow::{bail, Context, Result};
use log::debug;
use std::fs::File;
use std::io::{BufReader, Read};
use std::path::{Path, PathBuf};
use std::process::Stdio;

pub trait RootfsArchive {
    /// Unpack every entry into `dest`, preserving permissions.
    fn extract_to(&self, dest: &Path) -> Result<()>;

    /// Location of the archive, for messages.
    fn source(&self) -> &Path;
}

const ZSTD_MAGIC: &[u8] = &[0x28, 0xb5, 0x2f, 0xfd];
const GZIP_MAGIC: &[u8] = &[0x1f, 0x8b];
const BZIP2_MAGIC: &[u8] = b"BZh";
const XZ_MAGIC: &[u8] = &[0xfd, b'7', b'z', b'X', b'Z', 0x00];
const USTAR_OFFSET: usize = 257;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ArchiveFormat {
    Tar,
    TarZst,
    /// Decompressed by a host tool (`gzip`, `bzip2`, `xz`).
    Piped(&'static str),
}

/// A tar archive on disk, optionally compressed.
#[derive(Debug, Clone)]
pub struct TarArchive {
    path: PathBuf,
}

impl TarArchive {
    pub fn open(path: &Path) -> Result<Self> {
        if !path.is_file() {
            bail!("rootfs archive not found: {}", path.display());
        }
        Ok(Self {
            path: path.to_path_buf(),
        })
    }

    fn format(&self) -> Result<ArchiveFormat> {
        let mut header = [0u8; 512];
        let mut file = File::open(&self.path)
            .with_context(|| format!("Failed to open {}", self.path.display()))?;
        let mut filled = 0;
        while filled < header.len() {
            let n = file.read(&mut header[filled..])?;
            if n == 0 {
                break;
            }
            filled += n;
        }
        let header = &header[..filled];

        let format = if header.starts_with(ZSTD_MAGIC) {
            ArchiveFormat::TarZst
        } else if header.starts_with(GZIP_MAGIC) {
            ArchiveFormat::Piped("gzip")
        } else if header.starts_with(BZIP2_MAGIC) {
            ArchiveFormat::Piped("bzip2")
        } else if header.starts_with(XZ_MAGIC) {
            ArchiveFormat::Piped("xz")
        } else if header.get(USTAR_OFFSET..USTAR_OFFSET + 5) == Some(&b"ustar"[..]) {
            ArchiveFormat::Tar
        } else {
            bail!("{} is not a tar archive", self.path.display());
        };
        Ok(format)
    }

    fn unpack<R: Read>(reader: R, dest: &Path) -> Result<()> {
        let mut archive = tar::Archive::new(reader);
        archive.set_preserve_permissions(true);
        archive.set_overwrite(true);

        // directories last, so a read-only directory cannot block its children
        let mut directories = Vec::new();
        let mut skipped = 0;
        for entry in archive.entries()? {
            let mut entry = entry?;
            let kind = entry.header().entry_type();
            if kind.is_character_special() || kind.is_block_special() || kind.is_fifo() {
                skipped += 1;
                continue;
            }
            if kind.is_dir() {
                directories.push(entry);
            } else {
                entry.unpack_in(dest)?;
            }
        }
        for mut dir in directories {
            dir.unpack_in(dest)?;
        }

        if skipped > 0 {
            debug!("skipped {} device and fifo entries", skipped);
        }
        Ok(())
    }

    fn unpack_piped(&self, tool: &str, dest: &Path) -> Result<()> {
        let cmd = Cmd::new(tool).arg("-dc").arg_path(&self.path);
        cmd.validate()?;
        let mut child = cmd
            .to_command()
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .spawn()
            .with_context(|| format!("Failed to execute {}", tool))?;
        let Some(stdout) = child.stdout.take() else {
            bail!("{} produced no output stream", tool);
        };

        let unpacked = Self::unpack(BufReader::new(stdout), dest);
        let status = child.wait()?;
        unpacked?;
        if !status.success() {
            bail!("{} -dc {} failed: {}", tool, self.path.display(), status);
        }
        Ok(())
    }
}

impl RootfsArchive for TarArchive {
    fn extract_to(&self, dest: &Path) -> Result<()> {
        let format = self.format()?;
        debug!("extracting {} ({:?}) into {}", self.path.display(), format, dest.display());

        let result = match format {
            ArchiveFormat::Tar => {
                let file = File::open(&self.path)?;
                Self::unpack(BufReader::new(file), dest)
            }
            ArchiveFormat::TarZst => {
                let file = File::open(&self.path)?;
                let decoder = zstd::stream::Decoder::new(file)?;
                Self::unpack(decoder, dest)
            }
            ArchiveFormat::Piped(tool) => self.unpack_piped(tool, dest),
        };
        result.with_context(|| format!("Failed to unpack {}", self.path.display()))
    }

    fn source(&self) -> &Path {
        &self.path
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use std::os::unix::fs::PermissionsExt;
    use tempfile::TempDir;

    fn write_tar(path: &Path) {
        let file = File::create(path).unwrap();
        let mut builder = tar::Builder::new(file);

        let data = b"#!/bin/sh\necho hi\n";
        let mut header = tar::Header::new_gnu();
        header.set_size(data.len() as u64);
        header.set_mode(0o755);
        header.set_cksum();
        builder
            .append_data(&mut header, "bin/hello.sh", &data[..])
            .unwrap();
        builder.finish().unwrap();
    }

    #[test]
    fn test_plain_tar_preserves_mode() {
        let temp = TempDir::new().unwrap();
        let tar_path = temp.path().join("rootfs.tar");
        write_tar(&tar_path);

        let dest = temp.path().join("out");
        fs::create_dir_all(&dest).unwrap();
        let archive = TarArchive::open(&tar_path).unwrap();
        assert_eq!(archive.format().unwrap(), ArchiveFormat::Tar);
        archive.extract_to(&dest).unwrap();

        let script = dest.join("bin/hello.sh");
        assert!(script.is_file());
        let mode = fs::metadata(&script).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o755);
    }

    #[test]
    fn test_zstd_tar() {
        let temp = TempDir::new().unwrap();
        let tar_path = temp.path().join("rootfs.tar");
        write_tar(&tar_path);

        let zst_path = temp.path().join("rootfs.tar.zst");
        let raw = fs::read(&tar_path).unwrap();
        let compressed = zstd::stream::encode_all(&raw[..], 3).unwrap();
        fs::write(&zst_path, compressed).unwrap();

        let dest = temp.path().join("out");
        fs::create_dir_all(&dest).unwrap();
        let archive = TarArchive::open(&zst_path).unwrap();
        assert_eq!(archive.format().unwrap(), ArchiveFormat::TarZst);
        archive.extract_to(&dest).unwrap();
        assert!(dest.join("bin/hello.sh").is_file());
    }

    #[test]
    fn test_gzip_tar_through_host_tool() {
        let temp = TempDir::new().unwrap();
        let tar_path = temp.path().join("rootfs.tar");
        write_tar(&tar_path);
        Cmd::new("gzip").arg_path(&tar_path).run().unwrap();

        let dest = temp.path().join("out");
        fs::create_dir_all(&dest).unwrap();
        let archive = TarArchive::open(&temp.path().join("rootfs.tar.gz")).unwrap();
        assert_eq!(archive.format().unwrap(), ArchiveFormat::Piped("gzip"));
        archive.extract_to(&dest).unwrap();
        assert!(dest.join("bin/hello.sh").is_file());
    }

    #[test]
    fn test_device_nodes_are_skipped() {
        let temp = TempDir::new().unwrap();
        let tar_path = temp.path().join("rootfs.tar");
        let mut builder = tar::Builder::new(File::create(&tar_path).unwrap());
        let mut dev = tar::Header::new_gnu();
        dev.set_entry_type(tar::EntryType::Char);
        dev.set_size(0);
        dev.set_mode(0o600);
        dev.set_device_major(5).unwrap();
        dev.set_device_minor(1).unwrap();
        dev.set_cksum();
        builder.append_data(&mut dev, "dev/console", &[][..]).unwrap();
        let mut dir = tar::Header::new_gnu();
        dir.set_entry_type(tar::EntryType::Directory);
        dir.set_size(0);
        dir.set_mode(0o555);
        dir.set_cksum();
        builder.append_data(&mut dir, "etc", &[][..]).unwrap();
        let mut file = tar::Header::new_gnu();
        file.set_size(3);
        file.set_mode(0o644);
        file.set_cksum();
        builder.append_data(&mut file, "etc/TZ", &b"UTC"[..]).unwrap();
        builder.finish().unwrap();
        drop(builder);

        let dest = temp.path().join("out");
        fs::create_dir_all(&dest).unwrap();
        TarArchive::open(&tar_path).unwrap().extract_to(&dest).unwrap();

        assert!(fs::symlink_metadata(dest.join("dev/console")).is_err());
        assert_eq!(fs::read_to_string(dest.join("etc/TZ")).unwrap(), "UTC");
        let mode = fs::metadata(dest.join("etc")).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o555);
        fs::set_permissions(dest.join("etc"), fs::Permissions::from_mode(0o755)).unwrap();
    }

    #[test]
    fn test_unknown_format_rejected() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("rootfs.bin");
        fs::write(&path, b"not an archive").unwrap();
        assert!(TarArchive::open(&path).unwrap().format().is_err());
    }

    #[test]
    fn test_missing_archive() {
        assert!(TarArchive::open(Path::new("/nonexistent/rootfs.tar.gz")).is_err());
    }
}
