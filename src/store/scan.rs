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

//! Directory scanning and the delayed content-parsing pass.
//!
//! Reading a folder happens in two passes. The first pass walks the
//! directory and records one entry per candidate file: the relative path,
//! the flags recoverable from the name alone, and the directory entry's
//! inode. The second pass opens the files, in inode order to minimise seek
//! cost on spinning media, consulting the header cache before paying for a
//! full parse.

use std::fs::{self, File};
use std::os::unix::fs::DirEntryExt;

use chrono::offset::Utc;
use log::{debug, warn};

use crate::store::filename;
use crate::store::hcache;
use crate::store::model::{Email, Mailbox, MailboxKind, StoreContext};
use crate::support::error::Error;

/// One candidate file discovered by the first pass.
pub struct ScanEntry {
    /// The message record being built up; `None` once the entry has been
    /// consumed (or discarded) by reconciliation or a failed parse.
    pub email: Option<Email>,
    /// Canonical flag-less filename, filled in lazily by the incremental
    /// check.
    pub canon: Option<String>,
    /// Inode of the directory entry, for I/O-ordering the second pass.
    pub inode: u64,
    /// Whether the content pass has run for this entry.
    pub header_parsed: bool,
}

/// A valid MH message name consists only of digits. Tombstones (leading
/// `,`) and anything else are ignored garbage.
pub(crate) fn valid_mh_name(name: &str) -> bool {
    !name.is_empty() && name.bytes().all(|b| b.is_ascii_digit())
}

/// First pass: enumerate `subdir` (or the folder root for MH), appending
/// one entry per candidate file to `out` in discovery order.
pub(crate) fn scan_dir(
    mailbox: &Mailbox,
    subdir: Option<&str>,
    ctx: &StoreContext,
    out: &mut Vec<ScanEntry>,
) -> Result<(), Error> {
    let dir = match subdir {
        Some(subdir) => mailbox.path.join(subdir),
        None => mailbox.path.clone(),
    };
    let is_old =
        ctx.config.mark_old && Some("cur") == subdir;

    for entry in fs::read_dir(&dir)? {
        ctx.cancel.check()?;

        let entry = entry?;
        let name = match entry.file_name().into_string() {
            Ok(name) => name,
            Err(name) => {
                warn!("skipping non-UTF-8 entry {:?} in {}", name, dir.display());
                continue;
            },
        };

        match mailbox.kind {
            MailboxKind::Mh if !valid_mh_name(&name) => continue,
            MailboxKind::Maildir if name.starts_with('.') => continue,
            _ => (),
        }

        debug!("queueing {}", name);

        let mut email = Email::new();
        email.old = is_old;
        if MailboxKind::Maildir == mailbox.kind {
            filename::parse_flags(&mut email, &name, ctx.config.flag_safe);
        }
        email.path = match subdir {
            Some(subdir) => format!("{}/{}", subdir, name),
            None => name,
        };

        out.push(ScanEntry {
            email: Some(email),
            canon: None,
            inode: entry.ino(),
            header_parsed: false,
        });
    }

    Ok(())
}

fn mtime_secs(path: &std::path::Path) -> Option<i64> {
    fs::metadata(path)
        .and_then(|md| md.modified())
        .ok()
        .map(|t| chrono::DateTime::<Utc>::from(t).timestamp())
}

/// Second pass: fill in content geometry and envelope identity for every
/// entry the first pass queued.
///
/// On the first entry that actually needs parsing, the remainder of the
/// list is sorted by inode so subsequent opens walk the disk in allocation
/// order. Entries whose email has already been taken by reconciliation are
/// skipped but kept in the list.
pub(crate) fn delayed_parse(
    mailbox: &Mailbox,
    list: &mut Vec<ScanEntry>,
    ctx: &StoreContext,
) -> Result<(), Error> {
    let mut hc = ctx.hcache.and_then(|store| store.open(&mailbox.path));
    let mut sorted = false;

    let mut ix = 0;
    while ix < list.len() {
        ctx.cancel.check()?;

        let needs_parse =
            list[ix].email.is_some() && !list[ix].header_parsed;
        if !needs_parse {
            ix += 1;
            continue;
        }

        if !sorted {
            debug!("sorting {} by inode", mailbox.path.display());
            list[ix..].sort_by_key(|entry| entry.inode);
            sorted = true;
            // the entry now at this position may already be parsed
            continue;
        }

        let rel = list[ix].email.as_ref().expect("checked above").path.clone();
        let full = mailbox.full_path(&rel);
        let key = hcache::cache_key(mailbox.kind, &rel);

        let mut restored = false;
        if let Some(hc) = hc.as_deref_mut() {
            // With verification enabled, an unstattable file can never
            // validate a cached entry.
            let last_changed = if ctx.config.header_cache_verify {
                mtime_secs(&full)
            } else {
                Some(0)
            };

            if let (Some(last_changed), Some(blob)) =
                (last_changed, hc.fetch(&key))
            {
                if let Some(cached) = hcache::decode(&blob) {
                    if last_changed <= cached.timestamp {
                        let old = list[ix].email.as_ref().unwrap().old;
                        let mut email = cached.email;
                        email.active = true;
                        email.old = old;
                        email.path = rel.clone();
                        if MailboxKind::Maildir == mailbox.kind {
                            filename::parse_flags(
                                &mut email,
                                &rel,
                                ctx.config.flag_safe,
                            );
                        }
                        list[ix].email = Some(email);
                        list[ix].header_parsed = true;
                        restored = true;
                    }
                }
            }
        }

        if !restored {
            match parse_one(mailbox, &full, &rel, list[ix].email.as_mut().unwrap(), ctx)
            {
                Ok(()) => {
                    list[ix].header_parsed = true;
                    if let Some(hc) = hc.as_deref_mut() {
                        let email = list[ix].email.as_ref().unwrap();
                        match hcache::encode(email, Utc::now().timestamp()) {
                            Ok(blob) => hc.store(&key, &blob),
                            Err(e) => {
                                warn!("unable to serialise {}: {}", rel, e)
                            },
                        }
                    }
                },
                Err(e) => {
                    warn!("unable to parse {}: {}", full.display(), e);
                    list[ix].email = None;
                },
            }
        }

        ix += 1;
    }

    drop(hc);

    if MailboxKind::Mh == mailbox.kind && ctx.config.sort_natural {
        debug!(
            "sorting {} into natural order",
            mailbox.path.display()
        );
        list.sort_by_key(|entry| {
            entry
                .email
                .as_ref()
                .and_then(|e| e.path.parse::<u64>().ok())
        });
    }

    Ok(())
}

/// Open and parse one message file, refreshing the length from the actual
/// file size.
fn parse_one(
    mailbox: &Mailbox,
    full: &std::path::Path,
    rel: &str,
    email: &mut Email,
    ctx: &StoreContext,
) -> Result<(), Error> {
    let mut file = File::open(full)?;
    ctx.parser.parse_headers(&mut file, email)?;

    let size = file.metadata()?.len();
    email.content.length = size.saturating_sub(email.content.offset);

    if 0 == email.received {
        email.received = email.date_sent;
    }

    if MailboxKind::Maildir == mailbox.kind {
        // flags live in the filename, never in the message contents
        let old = email.old;
        filename::parse_flags(email, rel, ctx.config.flag_safe);
        email.old = old;
    }

    Ok(())
}

/// Transfer ownership of every surviving scanned email into the mailbox's
/// array, updating the tallies. Returns whether anything was added.
pub(crate) fn promote(mailbox: &mut Mailbox, list: Vec<ScanEntry>) -> bool {
    let old_count = mailbox.msg_count;

    for entry in list {
        if let Some(mut email) = entry.email {
            email.active = true;
            email.index = mailbox.msg_count;
            mailbox.size += email.content.length + email.content.offset
                - email.content.hdr_offset;
            if !email.read {
                mailbox.msg_unread += 1;
            }
            if email.flagged {
                mailbox.msg_flagged += 1;
            }
            if email.deleted {
                mailbox.msg_deleted += 1;
            }
            mailbox.emails.push(email);
            mailbox.msg_count += 1;
        }
    }

    mailbox.msg_count > old_count
}

#[cfg(test)]
mod test {
    use std::fs;

    use tempfile::TempDir;

    use super::*;
    use crate::support::config::StoreConfig;

    struct Setup {
        root: TempDir,
        config: StoreConfig,
    }

    fn set_up() -> Setup {
        Setup {
            root: TempDir::new().unwrap(),
            config: StoreConfig::default(),
        }
    }

    fn write_message(path: &std::path::Path, body: &str) {
        fs::write(
            path,
            format!(
                "Message-ID: <{}@test>\nSubject: t\n\n{}\n",
                path.file_name().unwrap().to_str().unwrap(),
                body
            ),
        )
        .unwrap();
    }

    #[test]
    fn mh_names_must_be_all_digits() {
        assert!(valid_mh_name("1"));
        assert!(valid_mh_name("94107"));
        assert!(!valid_mh_name(""));
        assert!(!valid_mh_name(",5"));
        assert!(!valid_mh_name(".mh_sequences"));
        assert!(!valid_mh_name("5a"));
    }

    #[test]
    fn maildir_scan_decodes_flags_and_skips_dotfiles() {
        let setup = set_up();
        let cur = setup.root.path().join("cur");
        fs::create_dir(&cur).unwrap();
        write_message(&cur.join("u1:2,FS"), "one");
        write_message(&cur.join(".hidden"), "nope");

        let mailbox =
            Mailbox::new(setup.root.path(), MailboxKind::Maildir);
        let ctx = StoreContext::new(&setup.config);
        let mut list = Vec::new();
        scan_dir(&mailbox, Some("cur"), &ctx, &mut list).unwrap();

        assert_eq!(1, list.len());
        let email = list[0].email.as_ref().unwrap();
        assert_eq!("cur/u1:2,FS", email.path);
        assert!(email.flagged && email.read);
        assert!(email.old, "cur entries are old when mark_old is set");
        assert!(!list[0].header_parsed);
        assert!(0 != list[0].inode);
    }

    #[test]
    fn mh_scan_skips_tombstones_and_garbage() {
        let setup = set_up();
        for name in ["1", "3", ",2", "notmail", ".mh_sequences"] {
            write_message(&setup.root.path().join(name), name);
        }

        let mailbox = Mailbox::new(setup.root.path(), MailboxKind::Mh);
        let ctx = StoreContext::new(&setup.config);
        let mut list = Vec::new();
        scan_dir(&mailbox, None, &ctx, &mut list).unwrap();

        let mut paths: Vec<_> = list
            .iter()
            .map(|e| e.email.as_ref().unwrap().path.clone())
            .collect();
        paths.sort();
        assert_eq!(vec!["1", "3"], paths);
    }

    #[test]
    fn delayed_parse_fills_content_and_sorts_naturally() {
        let setup = set_up();
        for name in ["10", "2", "1"] {
            write_message(&setup.root.path().join(name), "body");
        }

        let mailbox = Mailbox::new(setup.root.path(), MailboxKind::Mh);
        let ctx = StoreContext::new(&setup.config);
        let mut list = Vec::new();
        scan_dir(&mailbox, None, &ctx, &mut list).unwrap();
        delayed_parse(&mailbox, &mut list, &ctx).unwrap();

        let paths: Vec<_> = list
            .iter()
            .map(|e| e.email.as_ref().unwrap().path.clone())
            .collect();
        assert_eq!(vec!["1", "2", "10"], paths);

        for entry in &list {
            assert!(entry.header_parsed);
            let email = entry.email.as_ref().unwrap();
            assert!(email.content.offset > 0);
            assert!(email.content.length > 0);
            assert!(email.message_id.is_some());
        }
    }

    #[test]
    fn unreadable_entries_are_dropped_not_fatal() {
        let setup = set_up();
        write_message(&setup.root.path().join("1"), "ok");

        let mailbox = Mailbox::new(setup.root.path(), MailboxKind::Mh);
        let ctx = StoreContext::new(&setup.config);
        let mut list = Vec::new();
        scan_dir(&mailbox, None, &ctx, &mut list).unwrap();
        // simulate a file vanishing between the passes
        fs::remove_file(setup.root.path().join("1")).unwrap();
        delayed_parse(&mailbox, &mut list, &ctx).unwrap();

        assert_eq!(1, list.len());
        assert!(list[0].email.is_none());

        let mut mailbox = mailbox;
        assert!(!promote(&mut mailbox, list));
        assert_eq!(0, mailbox.msg_count);
    }

    #[test]
    fn header_cache_round_trip_and_staleness() {
        let setup = set_up();
        let cur = setup.root.path().join("cur");
        fs::create_dir(&cur).unwrap();
        write_message(&cur.join("u1:2,S"), "cached body");

        let cache = hcache::MemoryCacheStore::new();
        let mailbox =
            Mailbox::new(setup.root.path(), MailboxKind::Maildir);
        let ctx = StoreContext::new(&setup.config).with_hcache(&cache);

        let mut list = Vec::new();
        scan_dir(&mailbox, Some("cur"), &ctx, &mut list).unwrap();
        delayed_parse(&mailbox, &mut list, &ctx).unwrap();
        assert!(cache.contains(&mailbox.path, "u1"));
        let parsed_offset =
            list[0].email.as_ref().unwrap().content.offset;

        // a second scan must restore from the cache even after the file
        // was renamed for a flag change
        fs::rename(cur.join("u1:2,S"), cur.join("u1:2,FS")).unwrap();
        let mut list = Vec::new();
        scan_dir(&mailbox, Some("cur"), &ctx, &mut list).unwrap();
        delayed_parse(&mailbox, &mut list, &ctx).unwrap();

        let email = list[0].email.as_ref().unwrap();
        assert_eq!(parsed_offset, email.content.offset);
        assert_eq!("cur/u1:2,FS", email.path);
        assert!(email.flagged, "flags come from the current filename");
    }

    #[test]
    fn cancellation_aborts_the_scan() {
        let setup = set_up();
        let cur = setup.root.path().join("cur");
        fs::create_dir(&cur).unwrap();
        write_message(&cur.join("u1"), "one");

        let mailbox =
            Mailbox::new(setup.root.path(), MailboxKind::Maildir);
        let ctx = StoreContext::new(&setup.config);
        ctx.cancel.cancel();

        let mut list = Vec::new();
        assert_matches!(
            Err(Error::Aborted),
            scan_dir(&mailbox, Some("cur"), &ctx, &mut list)
        );
    }
}
