//! Raw image creation, partitioning and formatting.

use crate::process::Cmd;
use anyhow::{Context, Result};
use std::fs;
use std::path::Path;

/// fdisk dialogue: new DOS label, one primary partition spanning the disk.
pub const FDISK_SCRIPT: &[u8] = b"o\nn\np\n1\n\n\nw\n";

/// Create a sparse raw image of `size_bytes`.
pub fn create_image(path: &Path, size_bytes: u64) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    let file = fs::File::create(path)
        .with_context(|| format!("Failed to create image {}", path.display()))?;
    file.set_len(size_bytes)?;
    Ok(())
}

pub fn partition(image: &Path) -> Result<()> {
    Cmd::new("fdisk")
        .arg_path(image)
        .stdin_bytes(FDISK_SCRIPT)
        .error_msg("Make partition table failed")
        .run()?;
    Ok(())
}

/// Journal-free ext2 on the mapped partition.
pub fn format_partition(device: &Path) -> Result<()> {
    Cmd::new("mkfs.ext2")
        .arg_path(device)
        .sudo()
        .error_msg("mkfs.ext2 failed")
        .run()?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::os::unix::fs::MetadataExt;
    use tempfile::TempDir;

    #[test]
    fn test_create_image_is_sparse() {
        let temp = TempDir::new().unwrap();
        let image = temp.path().join("work/image.raw");

        create_image(&image, 64 * 1024 * 1024).unwrap();

        let meta = fs::metadata(&image).unwrap();
        assert_eq!(meta.len(), 64 * 1024 * 1024);
        assert!(meta.blocks() * 512 < meta.len(), "image should be sparse");
    }

    #[test]
    fn test_fdisk_script_writes_one_primary_partition() {
        let script = std::str::from_utf8(FDISK_SCRIPT).unwrap();
        let answers: Vec<&str> = script.split('\n').collect();
        assert_eq!(&answers[..4], &["o", "n", "p", "1"]);
        assert!(script.trim_end().ends_with('w'));
    }
}
