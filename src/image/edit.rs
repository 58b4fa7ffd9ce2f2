//! Post-build edits to a mounted image.
//!
//! All paths passed in are guest paths; a leading `/` is ignored and `..`
//! components are rejected so edits stay inside the image.

use super::populate::{install_executable, PRE_INIT_GUEST_PATH};
use crate::error::Error;
use anyhow::{bail, Context, Result};
use log::debug;
use std::fs;
use std::io::Write;
use std::os::unix::fs::symlink;
use std::path::{Component, Path, PathBuf};
use walkdir::WalkDir;

pub const FORCE_NETWORK_GUEST_PATH: &str = "firmadyne/force_network.sh";
const FORCE_NETWORK_LINE: &str = "\n/bin/sh /firmadyne/force_network.sh &\n";

const ROOT_PASSWD_LINE: &str = "root::0:0:root:/:/bin/sh";
const ROOT_SHADOW_LINE: &str = "root::::::::";
const TTY_SHELL_LINE: &str = "ttyS0::respawn:/bin/sh";

/// Resolve a guest path under `root`.
pub fn guest_path(root: &Path, path: &str) -> Result<PathBuf> {
    let relative = Path::new(path.trim_start_matches('/'));
    if relative.as_os_str().is_empty() {
        bail!("refusing to operate on the image root");
    }
    if relative
        .components()
        .any(|c| matches!(c, Component::ParentDir))
    {
        bail!("guest path '{}' escapes the image", path);
    }
    Ok(root.join(relative))
}

/// Copy a host file or directory into the image.
pub fn add_file(root: &Path, local: &Path, target: &str) -> Result<PathBuf> {
    if !local.exists() {
        return Err(Error::MissingLocalFile(local.to_path_buf()).into());
    }
    let dst = guest_path(root, target)?;
    if let Some(parent) = dst.parent() {
        fs::create_dir_all(parent)?;
    }

    if local.is_dir() {
        copy_dir_recursive(local, &dst)?;
    } else {
        fs::copy(local, &dst)
            .with_context(|| format!("Failed to copy {} into image", local.display()))?;
    }
    debug!("added {} as {}", local.display(), dst.display());
    Ok(dst)
}

/// Remove a file, symlink (dangling or not) or directory from the image.
pub fn del_file(root: &Path, target: &str) -> Result<()> {
    let path = guest_path(root, target)?;
    let meta = match fs::symlink_metadata(&path) {
        Ok(meta) => meta,
        Err(_) => return Err(Error::TargetNotFound(target.to_string()).into()),
    };

    if meta.is_dir() {
        fs::remove_dir_all(&path)?;
    } else {
        fs::remove_file(&path)?;
    }
    debug!("deleted {}", path.display());
    Ok(())
}

fn copy_dir_recursive(src: &Path, dst: &Path) -> Result<()> {
    fs::create_dir_all(dst)?;

    for entry in fs::read_dir(src)? {
        let entry = entry?;
        let src_path = entry.path();
        let dst_path = dst.join(entry.file_name());

        if src_path.is_symlink() {
            let target = fs::read_link(&src_path)?;
            symlink(target, &dst_path)?;
        } else if src_path.is_dir() {
            copy_dir_recursive(&src_path, &dst_path)?;
        } else {
            fs::copy(&src_path, &dst_path)?;
        }
    }

    Ok(())
}

/// Regular text files under `root` whose name satisfies `wanted`.
///
/// Symlinks are not followed; the guest's absolute links would point at the
/// host.
fn text_files<F>(root: &Path, wanted: F) -> Vec<(PathBuf, String)>
where
    F: Fn(&str) -> bool,
{
    WalkDir::new(root)
        .follow_links(false)
        .into_iter()
        .filter_map(|e| e.ok())
        .filter(|e| e.file_type().is_file())
        .filter(|e| e.file_name().to_str().is_some_and(&wanted))
        .filter_map(|e| {
            let bytes = fs::read(e.path()).ok()?;
            if bytes.contains(&0) {
                return None;
            }
            let text = String::from_utf8(bytes).ok()?;
            Some((e.into_path(), text))
        })
        .collect()
}

fn rewrite_lines<F>(path: &Path, text: &str, replace: F) -> Result<bool>
where
    F: Fn(&str) -> Option<&'static str>,
{
    let mut changed = false;
    let mut out = String::with_capacity(text.len());
    for line in text.split_inclusive('\n') {
        match replace(line) {
            Some(new) => {
                out.push_str(new);
                out.push('\n');
                changed = true;
            }
            None => out.push_str(line),
        }
    }
    if changed {
        fs::write(path, out).with_context(|| format!("Failed to rewrite {}", path.display()))?;
    }
    Ok(changed)
}

/// Blank root's password in every passwd/shadow style file. Returns the
/// number of files rewritten.
pub fn remove_root_passwd(root: &Path) -> Result<usize> {
    let mut count = 0;
    for (path, text) in text_files(root, |name| name.contains("passwd") || name.contains("shadow")) {
        let shadow = path
            .file_name()
            .and_then(|n| n.to_str())
            .is_some_and(|n| n.contains("shadow"));
        let line = if shadow { ROOT_SHADOW_LINE } else { ROOT_PASSWD_LINE };
        if rewrite_lines(&path, &text, |l| l.contains("root:").then_some(line))? {
            debug!("cleared root password in {}", path.display());
            count += 1;
        }
    }
    Ok(count)
}

/// Replace the serial console login with a shell in every inittab.
pub fn replace_tty_login(root: &Path) -> Result<usize> {
    let mut count = 0;
    for (path, text) in text_files(root, |name| name == "inittab") {
        if rewrite_lines(&path, &text, |l| l.contains("ttyS0").then_some(TTY_SHELL_LINE))? {
            debug!("ttyS0 now spawns a shell in {}", path.display());
            count += 1;
        }
    }
    Ok(count)
}

fn append(path: &Path, text: &str) -> Result<()> {
    let mut file = fs::OpenOptions::new()
        .append(true)
        .open(path)
        .with_context(|| format!("Failed to open {} for append", path.display()))?;
    file.write_all(text.as_bytes())?;
    Ok(())
}

/// Install the network forcing script and launch it from pre-init and
/// every text `rcS`. Returns the number of `rcS` files touched.
pub fn force_networking(root: &Path, script: &Path) -> Result<usize> {
    install_executable(root, script, FORCE_NETWORK_GUEST_PATH)?;
    append(&root.join(PRE_INIT_GUEST_PATH), FORCE_NETWORK_LINE)?;

    let mut count = 0;
    for (path, _) in text_files(root, |name| name == "rcS") {
        append(&path, FORCE_NETWORK_LINE)?;
        count += 1;
    }
    Ok(count)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::{kind_of, ErrorKind};
    use tempfile::TempDir;

    fn guest_root() -> (TempDir, PathBuf) {
        let temp = TempDir::new().unwrap();
        let root = temp.path().join("root");
        fs::create_dir_all(root.join("etc/init.d")).unwrap();
        fs::create_dir_all(root.join("firmadyne")).unwrap();
        (temp, root)
    }

    #[test]
    fn test_guest_path_rejects_escape() {
        let root = Path::new("/mnt/fs");
        assert_eq!(
            guest_path(root, "/etc/passwd").unwrap(),
            PathBuf::from("/mnt/fs/etc/passwd")
        );
        assert!(guest_path(root, "../../etc/shadow").is_err());
        assert!(guest_path(root, "/").is_err());
    }

    #[test]
    fn test_add_file_and_directory() {
        let (temp, root) = guest_root();
        let local = temp.path().join("payload");
        fs::write(&local, "data").unwrap();
        add_file(&root, &local, "/usr/bin/payload").unwrap();
        assert_eq!(fs::read_to_string(root.join("usr/bin/payload")).unwrap(), "data");

        let dir = temp.path().join("www");
        fs::create_dir_all(dir.join("cgi")).unwrap();
        fs::write(dir.join("cgi/index.cgi"), "cgi").unwrap();
        add_file(&root, &dir, "/www").unwrap();
        assert!(root.join("www/cgi/index.cgi").is_file());
    }

    #[test]
    fn test_add_missing_local_file_is_operator_input() {
        let (temp, root) = guest_root();
        let err = add_file(&root, &temp.path().join("nope"), "/nope").unwrap_err();
        assert_eq!(kind_of(&err), ErrorKind::OperatorInput);
    }

    #[test]
    fn test_del_file_handles_dangling_symlink() {
        let (_temp, root) = guest_root();
        symlink("/does/not/exist", root.join("sbin_reboot")).unwrap();
        del_file(&root, "/sbin_reboot").unwrap();
        assert!(fs::symlink_metadata(root.join("sbin_reboot")).is_err());

        let err = del_file(&root, "/sbin/reboot").unwrap_err();
        assert_eq!(kind_of(&err), ErrorKind::OperatorInput);
    }

    #[test]
    fn test_remove_root_passwd() {
        let (_temp, root) = guest_root();
        fs::write(
            root.join("etc/passwd"),
            "root:x:0:0:root:/root:/bin/sh\nadmin:x:1:1::/:/bin/sh\n",
        )
        .unwrap();
        fs::write(root.join("etc/shadow"), "root:$1$abc:10933:0:99999:7:::\n").unwrap();
        fs::write(root.join("etc/passwd.bin"), b"root:\0binary").unwrap();

        assert_eq!(remove_root_passwd(&root).unwrap(), 2);
        assert_eq!(
            fs::read_to_string(root.join("etc/passwd")).unwrap(),
            "root::0:0:root:/:/bin/sh\nadmin:x:1:1::/:/bin/sh\n"
        );
        assert_eq!(
            fs::read_to_string(root.join("etc/shadow")).unwrap(),
            "root::::::::\n"
        );
        assert_eq!(fs::read(root.join("etc/passwd.bin")).unwrap(), b"root:\0binary");
    }

    #[test]
    fn test_replace_tty_login() {
        let (_temp, root) = guest_root();
        fs::write(
            root.join("etc/inittab"),
            "::sysinit:/etc/init.d/rcS\nttyS0::respawn:/sbin/getty -L ttyS0 115200\n",
        )
        .unwrap();

        assert_eq!(replace_tty_login(&root).unwrap(), 1);
        assert_eq!(
            fs::read_to_string(root.join("etc/inittab")).unwrap(),
            "::sysinit:/etc/init.d/rcS\nttyS0::respawn:/bin/sh\n"
        );
    }

    #[test]
    fn test_force_networking_appends_launcher() {
        let (temp, root) = guest_root();
        fs::write(root.join(PRE_INIT_GUEST_PATH), "#!/bin/sh\n").unwrap();
        fs::write(root.join("etc/init.d/rcS"), "#!/bin/sh\nmount -a\n").unwrap();
        let script = temp.path().join("force_network.sh");
        fs::write(&script, "#!/bin/sh\nifconfig eth0 up\n").unwrap();

        assert_eq!(force_networking(&root, &script).unwrap(), 1);

        assert!(root.join(FORCE_NETWORK_GUEST_PATH).is_file());
        let pre_init = fs::read_to_string(root.join(PRE_INIT_GUEST_PATH)).unwrap();
        assert!(pre_init.ends_with("/bin/sh /firmadyne/force_network.sh &\n"));
        let rcs = fs::read_to_string(root.join("etc/init.d/rcS")).unwrap();
        assert!(rcs.contains("mount -a\n\n/bin/sh /firmadyne/force_network.sh &\n"));
    }
}
