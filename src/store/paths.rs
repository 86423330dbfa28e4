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

//! Folder probing and mailbox path manipulation.

use std::fs;
use std::path::{Component, Path, PathBuf};

use crate::store::compress::CompressHooks;
use crate::store::model::MailboxKind;
use crate::support::error::Error;

/// Whether `path` looks like a maildir folder: it must have a `cur`
/// subdirectory.
pub fn maildir_path_probe(path: &Path) -> bool {
    path.join("cur").is_dir()
}

/// Marker files whose presence identifies an MH folder. The later entries
/// are caches left behind by other MH-speaking agents; `.overview` lets MH
/// mode read a news spool.
const MH_MARKERS: &[&str] = &[
    ".mh_sequences",
    ".xmhcache",
    ".mew_cache",
    ".mew-cache",
    ".sylpheed_cache",
    ".overview",
];

/// Whether `path` looks like an MH folder.
pub fn mh_path_probe(path: &Path) -> bool {
    MH_MARKERS.iter().any(|marker| path.join(marker).exists())
}

/// Probe a directory for one of the plain (uncompressed) folder formats.
pub(crate) fn probe_plain(path: &Path) -> Option<MailboxKind> {
    let md = fs::metadata(path).ok()?;
    if !md.is_dir() {
        return None;
    }

    if maildir_path_probe(path) {
        Some(MailboxKind::Maildir)
    } else if mh_path_probe(path) {
        Some(MailboxKind::Mh)
    } else {
        None
    }
}

/// Identify the folder format at `path`.
///
/// A regular file is only a mailbox if the host has compress hooks whose
/// pattern matched it, which is why they are threaded in here rather than
/// discovered.
pub fn path_probe(
    path: &Path,
    compress_hooks: Option<&CompressHooks>,
) -> Option<MailboxKind> {
    let md = fs::metadata(path).ok()?;

    if md.is_file() && compress_hooks.is_some() {
        return Some(MailboxKind::Compressed);
    }

    probe_plain(path)
}

fn home_dir() -> Option<PathBuf> {
    std::env::var_os("HOME").map(PathBuf::from)
}

/// Resolve `.` and `..` components lexically, without touching the
/// filesystem.
fn normalize(path: &Path) -> PathBuf {
    let mut out = PathBuf::new();
    for component in path.components() {
        match component {
            Component::CurDir => (),
            Component::ParentDir => {
                if !out.pop() {
                    out.push(component.as_os_str());
                }
            },
            c => out.push(c.as_os_str()),
        }
    }
    out
}

/// Canonicalise a user-supplied mailbox path.
///
/// `+name` and `=name` refer to a folder under `folder`; `~` refers to the
/// home directory. The result is absolute and lexically normalised;
/// symlinks are deliberately left alone (resolution is the mailbox's
/// `realpath`, not its name).
pub fn path_canon(
    path: &str,
    folder: Option<&Path>,
) -> Result<PathBuf, Error> {
    let expanded = if let Some(rest) =
        path.strip_prefix('+').or_else(|| path.strip_prefix('='))
    {
        folder.ok_or(Error::NxMailbox)?.join(rest)
    } else if "~" == path {
        home_dir().ok_or(Error::NxMailbox)?
    } else if let Some(rest) = path.strip_prefix("~/") {
        home_dir().ok_or(Error::NxMailbox)?.join(rest)
    } else {
        PathBuf::from(path)
    };

    let absolute = if expanded.is_absolute() {
        expanded
    } else {
        std::env::current_dir()?.join(expanded)
    };

    Ok(normalize(&absolute))
}

/// Abbreviate an absolute mailbox path for display: `+` for the folder
/// root, `~` for the home directory.
pub fn path_pretty(path: &Path, folder: Option<&Path>) -> Option<String> {
    if let Some(folder) = folder {
        if let Ok(rest) = path.strip_prefix(folder) {
            if !rest.as_os_str().is_empty() {
                return Some(format!("+{}", rest.display()));
            }
        }
    }

    if let Some(home) = home_dir() {
        if let Ok(rest) = path.strip_prefix(&home) {
            if !rest.as_os_str().is_empty() {
                return Some(format!("~/{}", rest.display()));
            }
        }
    }

    None
}

/// The directory containing `path`, after canonicalisation.
pub fn path_parent(path: &str) -> Result<PathBuf, Error> {
    let canon = path_canon(path, None)?;
    Ok(canon
        .parent()
        .map(Path::to_path_buf)
        .unwrap_or(canon))
}

#[cfg(test)]
mod test {
    use tempfile::TempDir;

    use super::*;

    #[test]
    fn probe_recognises_formats() {
        let root = TempDir::new().unwrap();

        let maildir = root.path().join("md");
        fs::create_dir_all(maildir.join("cur")).unwrap();
        assert_eq!(Some(MailboxKind::Maildir), probe_plain(&maildir));

        let mh = root.path().join("mh");
        fs::create_dir(&mh).unwrap();
        fs::write(mh.join(".mh_sequences"), b"").unwrap();
        assert_eq!(Some(MailboxKind::Mh), probe_plain(&mh));

        let news = root.path().join("news");
        fs::create_dir(&news).unwrap();
        fs::write(news.join(".overview"), b"").unwrap();
        assert_eq!(Some(MailboxKind::Mh), probe_plain(&news));

        let plain = root.path().join("plain");
        fs::create_dir(&plain).unwrap();
        assert_eq!(None, probe_plain(&plain));

        let file = root.path().join("file.gz");
        fs::write(&file, b"x").unwrap();
        assert_eq!(None, probe_plain(&file));
        let hooks = CompressHooks::new(
            "gzip -cd '%f' > '%t'",
            None,
            None,
        )
        .unwrap();
        assert_eq!(
            Some(MailboxKind::Compressed),
            path_probe(&file, Some(&hooks))
        );
        assert_eq!(None, path_probe(&file, None));
    }

    #[test]
    fn canon_expands_shortcuts() {
        let folder = Path::new("/var/mail/folders");
        assert_eq!(
            PathBuf::from("/var/mail/folders/work"),
            path_canon("+work", Some(folder)).unwrap()
        );
        assert_eq!(
            PathBuf::from("/var/mail/folders/work"),
            path_canon("=work", Some(folder)).unwrap()
        );
        assert!(path_canon("+work", None).is_err());

        assert_eq!(
            PathBuf::from("/a/c"),
            path_canon("/a/b/../c/.", None).unwrap()
        );
    }

    #[test]
    fn pretty_abbreviates() {
        let folder = Path::new("/var/mail/folders");
        assert_eq!(
            Some("+work".to_owned()),
            path_pretty(Path::new("/var/mail/folders/work"), Some(folder))
        );
        assert_eq!(
            None,
            path_pretty(Path::new("/elsewhere"), Some(folder))
        );
    }

    #[test]
    fn parent_of_canonical_path() {
        assert_eq!(
            PathBuf::from("/a"),
            path_parent("/a/b/../b/c").unwrap()
        );
    }
}
