//-
// Copyright (c) 2026, Jason Lingle
//
// This file is part of Mailfold.
//
// Mailfold is free software: you can  redistribute it and/or modify it under
// the terms of  the GNU General Public  License as published  by the Free
// Software Foundation, either version 3 of the License, or (at your option)
// any later version.
//
// Mailfold is distributed  in the hope that it  will be useful,  but WITHOUT
// ANY WARRANTY; without  even the implied warranty  of MERCHANTABILITY or
// FITNESS FOR A PARTICULAR PURPOSE.  See the GNU General Public License for
// more details.
//
// You should have received a copy of the GNU General Public License along
// with Mailfold. If not, see <http://www.gnu.org/licenses/>.

//! Miscellaneous functions for working with files.

use std::fs;
use std::io;
use std::path::Path;
use std::time::SystemTime;

use crate::support::error::Error;

/// Rename `src` to `dst` without clobbering anything already at `dst`.
///
/// This is done by hard-linking `src` to `dst` and then removing `src`, so
/// that a concurrent process racing for the same destination name loses with
/// `AlreadyExists` instead of silently replacing the winner's file.
///
/// Both paths must be on the same filesystem.
pub fn safe_rename(
    src: impl AsRef<Path>,
    dst: impl AsRef<Path>,
) -> io::Result<()> {
    fs::hard_link(&src, &dst)?;
    fs::remove_file(&src)?;
    Ok(())
}

/// Return the modification time of `path`, or `None` if it cannot be
/// determined.
pub fn mtime(path: impl AsRef<Path>) -> Option<SystemTime> {
    fs::metadata(path).and_then(|md| md.modified()).ok()
}

/// Return the size of the file at `path`, or 0 if it cannot be determined.
pub fn file_size(path: impl AsRef<Path>) -> u64 {
    fs::metadata(path).map(|md| md.len()).unwrap_or(0)
}

/// Extension trait to simplify turning specific kinds of `io::Error` into
/// successful results.
pub trait IgnoreKinds {
    /// If `self` is an `io::Error` of kind `NotFound`, replace it with a
    /// default success value.
    fn ignore_not_found(self) -> Self;
}

impl IgnoreKinds for io::Result<()> {
    fn ignore_not_found(self) -> Self {
        match self {
            Err(e) if io::ErrorKind::NotFound == e.kind() => Ok(()),
            r => r,
        }
    }
}

/// Extension trait to simplify mapping specific kinds of `io::Error` to
/// semantic `Error` values.
pub trait ErrorTransforms<T> {
    /// If `self` is an `io::Error` of kind `AlreadyExists`, replace the
    /// error with `err`.
    fn on_exists(self, err: Error) -> Result<T, Error>;
}

impl<T> ErrorTransforms<T> for io::Result<T> {
    fn on_exists(self, err: Error) -> Result<T, Error> {
        self.map_err(|e| {
            if io::ErrorKind::AlreadyExists == e.kind() {
                err
            } else {
                e.into()
            }
        })
    }
}

#[cfg(test)]
mod test {
    use tempfile::TempDir;

    use super::*;

    #[test]
    fn safe_rename_refuses_to_clobber() {
        let root = TempDir::new().unwrap();
        let a = root.path().join("a");
        let b = root.path().join("b");

        fs::write(&a, b"a").unwrap();
        fs::write(&b, b"b").unwrap();

        let err = safe_rename(&a, &b).unwrap_err();
        assert_eq!(io::ErrorKind::AlreadyExists, err.kind());
        assert_eq!(b"b".to_vec(), fs::read(&b).unwrap());

        fs::remove_file(&b).unwrap();
        safe_rename(&a, &b).unwrap();
        assert!(!a.exists());
        assert_eq!(b"a".to_vec(), fs::read(&b).unwrap());
    }

    #[test]
    fn ignore_not_found_swallows_only_enoent() {
        let root = TempDir::new().unwrap();
        let missing = root.path().join("missing");

        assert!(fs::remove_file(&missing).ignore_not_found().is_ok());

        let not_a_dir = root.path().join("file");
        fs::write(&not_a_dir, b"x").unwrap();
        assert!(fs::remove_file(not_a_dir.join("below"))
            .ignore_not_found()
            .is_err());
    }
}
