//! Persistent mount declaration handling.
//!
//! Before the wipe sequencer unmounts the vault it must remove the fstab
//! entry that would let the automounter race a remount. The rewrite keeps
//! comments and unrelated entries byte-for-byte and replaces the file
//! atomically.

use crate::error::{VigilError, VigilResult};
use std::fs;
use std::io::Write;
use std::path::Path;
use tempfile::NamedTempFile;

/// Strip every entry whose mount point matches `mount_point`.
///
/// Returns the rewritten document and the number of entries removed.
/// Comments and malformed lines pass through untouched.
pub fn strip_mount_point(contents: &str, mount_point: &Path) -> (String, usize) {
    let target = mount_point.to_string_lossy();
    let mut kept = String::with_capacity(contents.len());
    let mut removed = 0usize;

    for line in contents.lines() {
        let trimmed = line.trim();
        if !trimmed.is_empty() && !trimmed.starts_with('#') {
            let mut fields = trimmed.split_whitespace();
            let _device = fields.next();
            if let Some(point) = fields.next() {
                if unescape_field(point) == target {
                    removed += 1;
                    continue;
                }
            }
        }
        kept.push_str(line);
        kept.push('\n');
    }

    (kept, removed)
}

/// Rewrite `fstab_path` without entries for `mount_point`, atomically.
///
/// A missing fstab counts as "nothing to remove".
pub fn remove_mount_point(fstab_path: &Path, mount_point: &Path) -> VigilResult<usize> {
    let contents = match fs::read_to_string(fstab_path) {
        Ok(contents) => contents,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(0),
        Err(err) => return Err(err.into()),
    };
    let (rewritten, removed) = strip_mount_point(&contents, mount_point);
    if removed == 0 {
        return Ok(0);
    }

    let parent = fstab_path
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .unwrap_or_else(|| Path::new("."));
    let mut temp = NamedTempFile::new_in(parent)?;
    temp.as_file_mut().write_all(rewritten.as_bytes())?;
    temp.as_file_mut().flush()?;
    let _ = temp.as_file().sync_all();
    temp.persist(fstab_path)
        .map_err(|err| VigilError::System(format!(
            "failed to replace {}: {}",
            fstab_path.display(),
            err.error
        )))?;
    Ok(removed)
}

/// Decode the octal escapes mount tables use for whitespace (`\040` etc.).
pub(crate) fn unescape_field(input: &str) -> String {
    let mut chars = input.chars().peekable();
    let mut output = String::with_capacity(input.len());

    while let Some(ch) = chars.next() {
        if ch == '\\' {
            let mut oct = String::new();
            for _ in 0..3 {
                if let Some(next) = chars.peek() {
                    if !next.is_ascii_digit() {
                        break;
                    }
                }
                if let Some(next) = chars.next() {
                    oct.push(next);
                }
            }
            if oct.len() == 3 {
                if let Ok(value) = u8::from_str_radix(&oct, 8) {
                    output.push(value as char);
                    continue;
                }
            }
            output.push('\\');
            output.push_str(&oct);
        } else {
            output.push(ch);
        }
    }

    output
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;
    use tempfile::tempdir;

    const SAMPLE: &str = "\
# /etc/fstab: static file system information
UUID=abcd-1234 / ext4 errors=remount-ro 0 1
/dev/mapper/vault_crypt /srv/vault ext4 defaults,nofail 0 2
/dev/sdc1 /media/backup ext4 defaults 0 2
";

    #[test]
    fn strips_only_the_target_mount_point() {
        let (rewritten, removed) = strip_mount_point(SAMPLE, Path::new("/srv/vault"));
        assert_eq!(removed, 1);
        assert!(!rewritten.contains("/srv/vault"));
        assert!(rewritten.contains("/media/backup"));
        assert!(rewritten.contains("# /etc/fstab"));
    }

    #[test]
    fn untouched_when_no_entry_matches() {
        let (rewritten, removed) = strip_mount_point(SAMPLE, Path::new("/srv/other"));
        assert_eq!(removed, 0);
        assert_eq!(rewritten, SAMPLE);
    }

    #[test]
    fn matches_escaped_mount_points() {
        let doc = "/dev/sdb1 /srv/secret\\040vault ext4 defaults 0 2\n";
        let (rewritten, removed) = strip_mount_point(doc, Path::new("/srv/secret vault"));
        assert_eq!(removed, 1);
        assert!(rewritten.trim().is_empty());
    }

    #[test]
    fn remove_mount_point_rewrites_the_file() {
        let dir = tempdir().unwrap();
        let fstab = dir.path().join("fstab");
        std::fs::write(&fstab, SAMPLE).unwrap();

        let removed = remove_mount_point(&fstab, Path::new("/srv/vault")).unwrap();
        assert_eq!(removed, 1);
        let contents = std::fs::read_to_string(&fstab).unwrap();
        assert!(!contents.contains("vault_crypt"));
        assert!(contents.contains("/media/backup"));
    }

    #[test]
    fn remove_mount_point_skips_rewrite_when_absent() {
        let dir = tempdir().unwrap();
        let fstab = dir.path().join("fstab");
        std::fs::write(&fstab, SAMPLE).unwrap();

        let removed = remove_mount_point(&fstab, PathBuf::from("/srv/none").as_path()).unwrap();
        assert_eq!(removed, 0);
        assert_eq!(std::fs::read_to_string(&fstab).unwrap(), SAMPLE);
    }

    #[test]
    fn remove_mount_point_tolerates_missing_fstab() {
        let dir = tempdir().unwrap();
        let removed =
            remove_mount_point(&dir.path().join("fstab"), Path::new("/srv/vault")).unwrap();
        assert_eq!(removed, 0);
    }

    #[test]
    fn unescape_decodes_octal_sequences() {
        assert_eq!(unescape_field("/srv/secret\\040vault"), "/srv/secret vault");
        assert_eq!(unescape_field("/srv/plain"), "/srv/plain");
    }
}
