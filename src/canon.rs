//! Lexical path normalization.

use std::path::{Component, Path, PathBuf};

/// Lexically normalize a path, removing redundant components like
/// "foo/./bar" and "foo/../bar".  Does not access the disk, so symlinks
/// are not resolved; two spellings of the same file normalize to the same
/// string, which is what path interning needs.
pub fn normalize(path: &Path) -> PathBuf {
    let mut out = PathBuf::new();
    for component in path.components() {
        match component {
            Component::CurDir => {}
            Component::ParentDir => match out.components().next_back() {
                Some(Component::Normal(_)) => {
                    out.pop();
                }
                // "/.." is just "/".
                Some(Component::RootDir) | Some(Component::Prefix(_)) => {}
                // Leading "..", keep it.
                _ => out.push(".."),
            },
            c => out.push(c.as_os_str()),
        }
    }
    out
}

/// Resolve a possibly-relative path against a working directory and
/// normalize the result.
pub fn absolutize(path: &Path, working_dir: &Path) -> PathBuf {
    if path.is_absolute() {
        normalize(path)
    } else {
        normalize(&working_dir.join(path))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn norm(path: &str) -> PathBuf {
        normalize(Path::new(path))
    }

    #[test]
    fn noop() {
        assert_eq!(norm("foo"), Path::new("foo"));
        assert_eq!(norm("foo/bar"), Path::new("foo/bar"));
    }

    #[test]
    fn dot() {
        assert_eq!(norm("./foo"), Path::new("foo"));
        assert_eq!(norm("foo/."), Path::new("foo"));
        assert_eq!(norm("foo/./bar"), Path::new("foo/bar"));
    }

    #[test]
    fn slash() {
        assert_eq!(norm("/foo"), Path::new("/foo"));
        assert_eq!(norm("foo//bar"), Path::new("foo/bar"));
    }

    #[test]
    fn parent() {
        assert_eq!(norm("foo/../bar"), Path::new("bar"));
        assert_eq!(norm("/foo/../bar"), Path::new("/bar"));
        assert_eq!(norm("../foo"), Path::new("../foo"));
        assert_eq!(norm("../foo/../bar"), Path::new("../bar"));
        assert_eq!(norm("../../bar"), Path::new("../../bar"));
        assert_eq!(norm("/../foo"), Path::new("/foo"));
    }

    #[test]
    fn absolutize_relative() {
        assert_eq!(
            absolutize(Path::new("obj/foo.o"), Path::new("/work")),
            Path::new("/work/obj/foo.o")
        );
        assert_eq!(
            absolutize(Path::new("../foo"), Path::new("/work/sub")),
            Path::new("/work/foo")
        );
    }

    #[test]
    fn absolutize_absolute() {
        assert_eq!(
            absolutize(Path::new("/other/foo"), Path::new("/work")),
            Path::new("/other/foo")
        );
    }
}
