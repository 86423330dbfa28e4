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

//! Writing in-memory changes back to disk.
//!
//! Sync walks the messages in index order and applies, per message:
//! deletion (unlink, or a `,`-prefixed tombstone for MH without purge), a
//! full rewrite when the content itself changed (attachment deletion,
//! label or reference edits), or a flag-encoding rename for maildir. A
//! sync never runs over a folder that changed on disk since the last
//! check; the pending check result is handed back to the caller instead.

use std::fs;
use std::io;

use log::{debug, warn};

use crate::store::check;
use crate::store::filename;
use crate::store::hcache::{self, HeaderCache};
use crate::store::message;
use crate::store::model::{
    CheckOutcome, Mailbox, MailboxKind, StoreContext,
};
use crate::store::open;
use crate::store::sequences::{self, SeqFlag, SequenceSet};
use crate::support::error::Error;
use crate::support::file_ops::IgnoreKinds;

fn is_exdev(e: &io::Error) -> bool {
    Some(nix::libc::EXDEV) == e.raw_os_error()
}

/// Sync a directory-backed folder. Shared between maildir and MH; the
/// per-message work branches on the folder kind.
pub(crate) fn folder_sync(
    mailbox: &mut Mailbox,
    ctx: &StoreContext,
    mut index_hint: Option<&mut usize>,
) -> Result<CheckOutcome, Error> {
    let pending = match mailbox.kind {
        MailboxKind::Mh => {
            check::mh_check(mailbox, ctx, index_hint.as_deref_mut())?
        },
        _ => check::maildir_check(mailbox, ctx, index_hint.as_deref_mut())?,
    };
    if CheckOutcome::Unchanged != pending {
        return Ok(pending);
    }

    let mut hc = ctx.hcache.and_then(|store| store.open(&mailbox.path));

    for msgno in 0..mailbox.msg_count {
        sync_message(
            mailbox,
            msgno,
            match hc.as_deref_mut() {
                Some(b) => Some(b),
                None => None,
            },
            ctx,
        )?;
    }

    drop(hc);

    if MailboxKind::Mh == mailbox.kind {
        update_sequences(mailbox, ctx)?;
    }

    open::update_mtime(mailbox);

    // adjust indices over the survivors
    if mailbox.msg_deleted > 0 {
        let keep_deleted = MailboxKind::Maildir == mailbox.kind
            && ctx.config.maildir_trash;
        let mut next = 0;
        for email in &mut mailbox.emails {
            if !email.deleted || keep_deleted {
                email.index = next;
                next += 1;
            }
        }
    }

    for email in &mut mailbox.emails {
        email.changed = false;
    }
    mailbox.changed = false;

    Ok(CheckOutcome::Unchanged)
}

/// Apply the per-message sync policy.
fn sync_message(
    mailbox: &mut Mailbox,
    msgno: usize,
    mut hc: Option<&mut dyn HeaderCache>,
    ctx: &StoreContext,
) -> Result<(), Error> {
    let kind = mailbox.kind;
    let key = hcache::cache_key(kind, &mailbox.emails[msgno].path);

    let email = &mailbox.emails[msgno];
    if email.deleted
        && (MailboxKind::Maildir != kind || !ctx.config.maildir_trash)
    {
        let full = mailbox.full_path(&email.path);

        if MailboxKind::Maildir == kind
            || (MailboxKind::Mh == kind && ctx.config.mh_purge)
        {
            if let Some(hc) = hc.as_deref_mut() {
                hc.delete(&key);
            }
            fs::remove_file(&full).ignore_not_found()?;
        } else if MailboxKind::Mh == kind {
            // MH just moves files out of the way when you delete them
            if !email.path.starts_with(',') {
                let tomb = mailbox.path.join(format!(",{}", email.path));
                let _ = fs::remove_file(&tomb);
                if let Err(e) = fs::rename(&full, &tomb) {
                    warn!(
                        "unable to tombstone {}: {}",
                        full.display(),
                        e
                    );
                }
            }
        }
    } else if email.changed
        || email.needs_rewrite()
        || (MailboxKind::Maildir == kind
            && (ctx.config.maildir_trash || email.trash)
            && email.deleted != email.trash)
    {
        match kind {
            MailboxKind::Maildir => maildir_sync_message(mailbox, msgno, ctx)?,
            _ => mh_sync_message(mailbox, msgno, ctx)?,
        }
    }

    if let Some(hc) = hc {
        let email = &mailbox.emails[msgno];
        if email.changed {
            let key = hcache::cache_key(kind, &email.path);
            match hcache::encode(
                email,
                chrono::offset::Utc::now().timestamp(),
            ) {
                Ok(blob) => hc.store(&key, &blob),
                Err(e) => warn!("unable to serialise {}: {}", email.path, e),
            }
        }
    }

    Ok(())
}

fn mh_sync_message(
    mailbox: &mut Mailbox,
    msgno: usize,
    ctx: &StoreContext,
) -> Result<(), Error> {
    if mailbox.emails[msgno].needs_rewrite() {
        rewrite_message(mailbox, msgno, ctx)?;
    }
    // a pure flag change is carried entirely by the sequence rewrite
    Ok(())
}

fn maildir_sync_message(
    mailbox: &mut Mailbox,
    msgno: usize,
    ctx: &StoreContext,
) -> Result<(), Error> {
    if mailbox.emails[msgno].needs_rewrite() {
        // attachment deletion and rethreading fall back to a rewrite
        return rewrite_message(mailbox, msgno, ctx);
    }

    // we just have to rename the file
    let email = &mailbox.emails[msgno];
    let base = email.basename();
    if base == email.path {
        warn!("{}: unable to find subdir", email.path);
        return Err(Error::NxMessage);
    }

    // kill the previous flags
    let uniq = base.find(':').map(|ix| &base[..ix]).unwrap_or(base);

    let part = format!(
        "{}/{}{}",
        if email.read || email.old { "cur" } else { "new" },
        uniq,
        filename::flag_suffix(email)
    );

    if part == email.path {
        // message hasn't really changed
        return Ok(());
    }

    let old_full = mailbox.full_path(&email.path);
    let new_full = mailbox.full_path(&part);

    // record that the message is possibly marked as trashed on disk
    mailbox.emails[msgno].trash = mailbox.emails[msgno].deleted;

    match fs::rename(&old_full, &new_full) {
        Ok(()) => {
            debug!(
                "renamed {} to {}",
                old_full.display(),
                new_full.display()
            );
            mailbox.emails[msgno].path = part;
            Ok(())
        },
        Err(e) if is_exdev(&e) => Err(Error::RenameAcrossFilesystems),
        Err(e) => Err(e.into()),
    }
}

/// Rewrite a message into a freshly committed file, then retire the old
/// one.
///
/// For MH, the new file is renamed back over the old numeric name so the
/// message keeps its number; if that final rename fails the message simply
/// stays under its new number and a concurrently running reader loses
/// nothing but flag history.
fn rewrite_message(
    mailbox: &mut Mailbox,
    msgno: usize,
    ctx: &StoreContext,
) -> Result<(), Error> {
    let mut email = mailbox.emails[msgno].clone();
    let old_part = email.path.clone();
    let old_full = mailbox.full_path(&old_part);
    let old_content = email.content;
    let old_lines = email.lines;

    let mut dest = match mailbox.kind {
        MailboxKind::Maildir => {
            message::maildir_open_new(mailbox, Some(&email))?
        },
        _ => message::mh_open_new(mailbox, Some(&email))?,
    };

    let mut result = ctx.copier.copy_message(
        dest.file.as_mut().expect("fresh staging file"),
        mailbox,
        &mut email,
    );
    if result.is_ok() {
        result = match mailbox.kind {
            MailboxKind::Maildir => {
                message::maildir_commit(mailbox, &mut dest, Some(&mut email))
            },
            _ => message::mh_commit(
                mailbox,
                &mut dest,
                Some(&mut email),
                false,
                ctx,
            ),
        };
    }

    if let Err(e) = result {
        // restore the offsets and drop the staging file
        email.content = old_content;
        email.lines = old_lines;
        let _ = fs::remove_file(&dest.path);
        mailbox.emails[msgno] = email;
        return Err(e);
    }

    fs::remove_file(&old_full)?;

    // Try to move the new message to the old place (MH only); important
    // when we are just updating flags. There is a race against programs
    // which reuse the first free slot instead of the maximum message
    // number; if the rename fails the message is still in the folder and
    // all that happens is that a concurrent reader loses flag changes.
    if MailboxKind::Mh == mailbox.kind {
        let new_full = mailbox.full_path(&email.path);
        match fs::rename(&new_full, &old_full) {
            Ok(()) => email.path = old_part,
            Err(e) => {
                debug!(
                    "unable to restore {} to {}: {}",
                    new_full.display(),
                    old_full.display(),
                    e
                );
            },
        }
    }

    email.attach_del = false;
    email.xlabel_changed = false;
    email.refs_changed = false;
    email.irt_changed = false;
    mailbox.emails[msgno] = email;

    Ok(())
}

/// Rebuild the three configured sequences from the surviving messages and
/// rewrite the sidecar.
///
/// Deleted messages simply drop out of the rebuilt sequences. Unknown
/// sequences are copied through untouched, including any numbers that now
/// refer to deleted messages; cleaning them is someone else's policy
/// decision.
fn update_sequences(
    mailbox: &Mailbox,
    ctx: &StoreContext,
) -> Result<(), Error> {
    let mut set = SequenceSet::new();

    for email in &mailbox.emails {
        if email.deleted {
            continue;
        }
        let number = match email.mh_number() {
            Some(n) => n,
            None => continue,
        };

        if !email.read {
            set.set(number, SeqFlag::UNSEEN);
        }
        if email.flagged {
            set.set(number, SeqFlag::FLAGGED);
        }
        if email.replied {
            set.set(number, SeqFlag::REPLIED);
        }
    }

    sequences::write_sequences(mailbox, &set, ctx.config)
}

#[cfg(test)]
mod test {
    use std::time::{Duration, SystemTime};

    use tempfile::TempDir;

    use super::*;
    use crate::store::hcache::MemoryCacheStore;
    use crate::store::model::Flag;
    use crate::support::config::StoreConfig;

    struct Setup {
        root: TempDir,
        config: StoreConfig,
    }

    fn set_up_maildir() -> (Setup, Mailbox) {
        let root = TempDir::new().unwrap();
        for subdir in ["tmp", "new", "cur"] {
            fs::create_dir(root.path().join(subdir)).unwrap();
        }
        let mailbox = Mailbox::new(root.path(), MailboxKind::Maildir);
        (
            Setup {
                root,
                config: StoreConfig::default(),
            },
            mailbox,
        )
    }

    fn set_up_mh(names: &[&str], sequences: &str) -> (Setup, Mailbox) {
        let root = TempDir::new().unwrap();
        for name in names {
            write_message(&root.path().join(name));
        }
        fs::write(root.path().join(".mh_sequences"), sequences).unwrap();
        let mailbox = Mailbox::new(root.path(), MailboxKind::Mh);
        (
            Setup {
                root,
                config: StoreConfig::default(),
            },
            mailbox,
        )
    }

    fn write_message(path: &std::path::Path) {
        fs::write(
            path,
            format!(
                "Message-ID: <{}@t>\nSubject: s\n\nbody\n",
                filename::canon_name(
                    path.file_name().unwrap().to_str().unwrap()
                )
            ),
        )
        .unwrap();
    }

    #[test]
    fn trash_flag_rename() {
        let (setup, mut mailbox) = set_up_maildir();
        write_message(&setup.root.path().join("cur/u1:2,S"));

        let ctx = StoreContext::new(&setup.config);
        open::maildir_open(&mut mailbox, &ctx).unwrap();

        let mut config = setup.config.clone();
        config.maildir_trash = true;
        let ctx = StoreContext::new(&config);

        mailbox.set_flag(0, Flag::Deleted, true);
        assert_eq!(
            CheckOutcome::Unchanged,
            folder_sync(&mut mailbox, &ctx, None).unwrap()
        );

        assert!(setup.root.path().join("cur/u1:2,ST").is_file());
        assert!(!setup.root.path().join("cur/u1:2,S").exists());
        assert!(mailbox.emails[0].trash);
        assert!(!mailbox.emails[0].changed);
        assert_eq!("cur/u1:2,ST", mailbox.emails[0].path);
    }

    #[test]
    fn unread_flag_moves_message_to_new() {
        let (setup, mut mailbox) = set_up_maildir();
        write_message(&setup.root.path().join("cur/u1:2,S"));

        let ctx = StoreContext::new(&setup.config);
        open::maildir_open(&mut mailbox, &ctx).unwrap();

        mailbox.set_flag(0, Flag::Read, false);
        mailbox.set_flag(0, Flag::Old, false);
        folder_sync(&mut mailbox, &ctx, None).unwrap();

        assert!(setup.root.path().join("new/u1").is_file());
        assert_eq!("new/u1", mailbox.emails[0].path);
    }

    #[test]
    fn maildir_delete_unlinks_and_purges_cache() {
        let (setup, mut mailbox) = set_up_maildir();
        write_message(&setup.root.path().join("cur/u1:2,S"));

        let cache = MemoryCacheStore::new();
        let ctx =
            StoreContext::new(&setup.config).with_hcache(&cache);
        open::maildir_open(&mut mailbox, &ctx).unwrap();
        assert!(cache.contains(&mailbox.path, "u1"));

        mailbox.set_flag(0, Flag::Deleted, true);
        folder_sync(&mut mailbox, &ctx, None).unwrap();

        assert!(!setup.root.path().join("cur/u1:2,S").exists());
        assert!(!cache.contains(&mailbox.path, "u1"));
    }

    #[test]
    fn mh_delete_tombstones_without_purge() {
        let (setup, mut mailbox) =
            set_up_mh(&["4", "5"], "unseen: 4\n");
        let ctx = StoreContext::new(&setup.config);
        open::mh_open(&mut mailbox, &ctx).unwrap();

        let five = mailbox
            .emails
            .iter()
            .position(|e| "5" == e.path)
            .unwrap();
        mailbox.set_flag(five, Flag::Deleted, true);
        folder_sync(&mut mailbox, &ctx, None).unwrap();

        assert!(setup.root.path().join(",5").is_file());
        assert!(!setup.root.path().join("5").exists());

        // the tombstone still reserves its number for allocation
        let mut msg = message::mh_open_new(&mailbox, None).unwrap();
        use std::io::Write;
        msg.file.as_mut().unwrap().write_all(b"x").unwrap();
        let mut email = crate::store::model::Email::new();
        message::mh_commit(&mailbox, &mut msg, Some(&mut email), false, &ctx)
            .unwrap();
        assert_eq!("6", email.path);
    }

    #[test]
    fn mh_delete_purges_when_configured() {
        let (setup, mut mailbox) = set_up_mh(&["5"], "");
        let mut config = setup.config.clone();
        config.mh_purge = true;

        let cache = MemoryCacheStore::new();
        let ctx = StoreContext::new(&config).with_hcache(&cache);
        open::mh_open(&mut mailbox, &ctx).unwrap();
        assert!(cache.contains(&mailbox.path, "5"));

        mailbox.set_flag(0, Flag::Deleted, true);
        folder_sync(&mut mailbox, &ctx, None).unwrap();

        assert!(!setup.root.path().join("5").exists());
        assert!(!setup.root.path().join(",5").exists());
        assert!(!cache.contains(&mailbox.path, "5"));
    }

    #[test]
    fn mh_sync_rewrites_sequences() {
        let (setup, mut mailbox) =
            set_up_mh(&["2", "3", "4"], "unseen: 2-4\nreplied: 3\ncur: 2\n");
        let ctx = StoreContext::new(&setup.config);
        open::mh_open(&mut mailbox, &ctx).unwrap();

        let three = mailbox
            .emails
            .iter()
            .position(|e| "3" == e.path)
            .unwrap();
        mailbox.set_flag(three, Flag::Replied, false);
        folder_sync(&mut mailbox, &ctx, None).unwrap();

        let contents = fs::read_to_string(
            setup.root.path().join(".mh_sequences"),
        )
        .unwrap();
        assert!(contents.contains("unseen: 2-4"));
        assert!(!contents.contains("replied"));
        assert!(contents.contains("cur: 2"), "unknown sequence preserved");
    }

    #[test]
    fn attachment_delete_rewrites_in_place() {
        let (setup, mut mailbox) =
            set_up_mh(&["7"], "unseen: 7\n");
        let ctx = StoreContext::new(&setup.config);
        open::mh_open(&mut mailbox, &ctx).unwrap();

        mailbox.emails[0].attach_del = true;
        mailbox.emails[0].changed = true;
        mailbox.changed = true;
        folder_sync(&mut mailbox, &ctx, None).unwrap();

        // the message keeps its number and its change bits are clear
        assert_eq!("7", mailbox.emails[0].path);
        assert!(setup.root.path().join("7").is_file());
        assert!(!mailbox.emails[0].attach_del);
        assert!(!mailbox.emails[0].changed);
        assert!(!mailbox.changed);
    }

    #[test]
    fn maildir_attachment_delete_allocates_fresh_uniq() {
        let (setup, mut mailbox) = set_up_maildir();
        write_message(&setup.root.path().join("cur/u1:2,S"));

        let ctx = StoreContext::new(&setup.config);
        open::maildir_open(&mut mailbox, &ctx).unwrap();

        let old_len = mailbox.emails[0].content.length;
        mailbox.emails[0].attach_del = true;
        mailbox.emails[0].changed = true;
        folder_sync(&mut mailbox, &ctx, None).unwrap();

        assert!(!setup.root.path().join("cur/u1:2,S").exists());
        assert_ne!("cur/u1:2,S", mailbox.emails[0].path);
        assert!(mailbox.emails[0].path.starts_with("cur/"));
        assert!(mailbox
            .full_path(&mailbox.emails[0].path)
            .is_file());
        assert_eq!(old_len, mailbox.emails[0].content.length);
        assert!(!mailbox.emails[0].changed);
    }

    #[test]
    fn sync_defers_to_pending_check() {
        let (setup, mut mailbox) = set_up_maildir();
        write_message(&setup.root.path().join("cur/u1:2,S"));

        let ctx = StoreContext::new(&setup.config);
        open::maildir_open(&mut mailbox, &ctx).unwrap();

        mailbox.set_flag(0, Flag::Deleted, true);

        // new mail arrives before the sync runs
        write_message(&setup.root.path().join("new/u2"));
        let past = SystemTime::UNIX_EPOCH + Duration::from_secs(1);
        mailbox.mtime = Some(past);
        mailbox.dir_state.mtime_cur = Some(past);

        assert_eq!(
            CheckOutcome::NewMail,
            folder_sync(&mut mailbox, &ctx, None).unwrap()
        );
        // nothing was deleted: the caller must see the new mail first
        assert!(setup.root.path().join("cur/u1:2,S").is_file());
    }
}
