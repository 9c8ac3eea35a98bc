//! Revision-control reference lookup.
//!
//! Knowledge versions record the commit the project was at when a file was
//! learned. The value is opaque to ward; it is read straight from `.git`
//! without shelling out.

use std::fs;
use std::path::Path;

fn is_commit_hash(s: &str) -> bool {
    (s.len() == 40 || s.len() == 64) && s.chars().all(|c| c.is_ascii_hexdigit())
}

/// Current commit of the git checkout at `root`, if any.
///
/// Follows a symbolic `HEAD` through loose refs and then `packed-refs`.
/// Returns `None` for non-git projects, unborn branches, and unknown formats.
pub fn current_revision(root: &Path) -> Option<String> {
    let git_dir = root.join(".git");
    let head = fs::read_to_string(git_dir.join("HEAD")).ok()?;
    let head = head.trim();

    let Some(reference) = head.strip_prefix("ref: ") else {
        if is_commit_hash(head) {
            tracing::debug!("Detached HEAD at {}", &head[..8]);
            return Some(head.to_string());
        }
        tracing::warn!("Unknown .git/HEAD format: {}", head);
        return None;
    };

    if let Ok(loose) = fs::read_to_string(git_dir.join(reference)) {
        let loose = loose.trim();
        if is_commit_hash(loose) {
            return Some(loose.to_string());
        }
    }

    let packed = fs::read_to_string(git_dir.join("packed-refs")).ok()?;
    packed
        .lines()
        .filter(|line| !line.starts_with('#') && !line.starts_with('^'))
        .filter_map(|line| line.split_once(' '))
        .find(|(_, name)| *name == reference)
        .map(|(hash, _)| hash.to_string())
        .filter(|hash| is_commit_hash(hash))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    const HASH: &str = "0123456789abcdef0123456789abcdef01234567";

    #[test]
    fn test_no_git_dir() {
        let temp = TempDir::new().unwrap();
        assert_eq!(current_revision(temp.path()), None);
    }

    #[test]
    fn test_loose_ref() {
        let temp = TempDir::new().unwrap();
        let git = temp.path().join(".git");
        fs::create_dir_all(git.join("refs/heads")).unwrap();
        fs::write(git.join("HEAD"), "ref: refs/heads/main\n").unwrap();
        fs::write(git.join("refs/heads/main"), format!("{}\n", HASH)).unwrap();

        assert_eq!(current_revision(temp.path()).as_deref(), Some(HASH));
    }

    #[test]
    fn test_packed_ref() {
        let temp = TempDir::new().unwrap();
        let git = temp.path().join(".git");
        fs::create_dir_all(&git).unwrap();
        fs::write(git.join("HEAD"), "ref: refs/heads/dev\n").unwrap();
        fs::write(
            git.join("packed-refs"),
            format!("# pack-refs with: peeled\n{} refs/heads/dev\n", HASH),
        )
        .unwrap();

        assert_eq!(current_revision(temp.path()).as_deref(), Some(HASH));
    }

    #[test]
    fn test_detached_head() {
        let temp = TempDir::new().unwrap();
        let git = temp.path().join(".git");
        fs::create_dir_all(&git).unwrap();
        fs::write(git.join("HEAD"), HASH).unwrap();

        assert_eq!(current_revision(temp.path()).as_deref(), Some(HASH));
    }

    #[test]
    fn test_unborn_branch() {
        let temp = TempDir::new().unwrap();
        let git = temp.path().join(".git");
        fs::create_dir_all(&git).unwrap();
        fs::write(git.join("HEAD"), "ref: refs/heads/main\n").unwrap();

        assert_eq!(current_revision(temp.path()), None);
    }
}
