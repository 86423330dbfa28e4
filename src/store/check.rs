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

//! Incremental folder checks.
//!
//! Arrival of new mail and external modification are detected from the
//! mtimes of the watched nodes. Only the subdirectories that actually
//! changed are rescanned; the fresh scan is then reconciled against the
//! in-memory view through a hash keyed by canonical filename, merging
//! on-disk flag changes into messages the user has not touched and
//! simulating a reopen when messages vanished.
//!
//! There is no well-defined "mailbox order" on disk, so the reconciliation
//! must not assume any relationship between scan order and the email
//! array; do not change this code unless you really understand what
//! happens.

use std::collections::HashMap;
use std::fs;
use std::time::SystemTime;

use log::debug;

use crate::store::filename;
use crate::store::message;
use crate::store::model::{
    CheckOutcome, Email, Flag, Mailbox, StoreContext, StoreHooks,
};
use crate::store::open::apply_sequences;
use crate::store::scan::{self, valid_mh_name};
use crate::store::sequences::{self, SeqFlag};
use crate::support::config::StoreConfig;
use crate::support::error::Error;
use crate::support::file_ops;

fn newer(t: Option<SystemTime>, recorded: Option<SystemTime>) -> bool {
    match (t, recorded) {
        (Some(t), Some(recorded)) => t > recorded,
        (Some(_), None) => true,
        (None, _) => false,
    }
}

/// Merge on-disk flags into a message the user has not modified.
///
/// Returns whether anything actually changed. The folder's global
/// `changed` bit is preserved: merging detected state is not something
/// that needs to be written back.
pub(crate) fn update_flags(
    mailbox: &mut Mailbox,
    msgno: usize,
    discovered: &Email,
    hooks: &dyn StoreHooks,
) -> bool {
    let context_changed = mailbox.changed;

    let old = &mailbox.emails[msgno];
    let (was_flagged, was_replied, was_read, was_old) =
        (old.flagged, old.replied, old.read, old.old);

    if was_flagged != discovered.flagged {
        mailbox.set_flag(msgno, Flag::Flagged, discovered.flagged);
    }
    if was_replied != discovered.replied {
        mailbox.set_flag(msgno, Flag::Replied, discovered.replied);
    }
    if was_read != discovered.read {
        mailbox.set_flag(msgno, Flag::Read, discovered.read);
    }
    if was_old != discovered.old {
        mailbox.set_flag(msgno, Flag::Old, discovered.old);
    }

    let header_changed = mailbox.emails[msgno].changed;
    mailbox.emails[msgno].changed = false;
    if header_changed {
        hooks.flags_merged(mailbox, msgno);
    }
    if !context_changed {
        mailbox.changed = false;
    }

    header_changed
}

/// Incremental check for a maildir folder.
///
/// We check whether either of the `new`/`cur` subdirectories changed and
/// scan only those. The subdirectories are not treated differently
/// otherwise: mail can be copied straight into `cur/` by another agent.
pub(crate) fn maildir_check(
    mailbox: &mut Mailbox,
    ctx: &StoreContext,
    mut index_hint: Option<&mut usize>,
) -> Result<CheckOutcome, Error> {
    if !ctx.config.check_new {
        return Ok(CheckOutcome::Unchanged);
    }

    let st_new = fs::metadata(mailbox.path.join("new"))?.modified()?;
    let st_cur = fs::metadata(mailbox.path.join("cur"))?.modified()?;

    // bit 0 = new, bit 1 = cur
    let mut changed = 0u8;
    if newer(Some(st_new), mailbox.mtime) {
        changed |= 1;
    }
    if newer(Some(st_cur), mailbox.dir_state.mtime_cur) {
        changed |= 2;
    }
    if 0 == changed {
        return Ok(CheckOutcome::Unchanged);
    }

    // A monitor event can fire before a batch of writes has finished; if
    // we recorded the new mtimes now, the rest of the batch could land in
    // the same mtime tick and never be noticed.
    if mailbox.monitor_event {
        mailbox.monitor_event = false;
    } else {
        mailbox.dir_state.mtime_cur = Some(st_cur);
        mailbox.mtime = Some(st_new);
    }

    // fast scan of just the filenames in the changed subdirectories
    let mut list = Vec::new();
    if 0 != changed & 1 {
        scan::scan_dir(mailbox, Some("new"), ctx, &mut list)?;
    }
    if 0 != changed & 2 {
        scan::scan_dir(mailbox, Some("cur"), ctx, &mut list)?;
    }

    let mut names: HashMap<String, usize> =
        HashMap::with_capacity(list.len());
    for (ix, entry) in list.iter_mut().enumerate() {
        let canon = filename::canon_name(
            &entry.email.as_ref().expect("fresh scan entry").path,
        )
        .to_owned();
        entry.canon = Some(canon.clone());
        names.insert(canon, ix);
    }

    let mut occult = false;
    let mut flags_changed = false;

    for msgno in 0..mailbox.msg_count {
        mailbox.emails[msgno].active = false;
        let canon =
            filename::canon_name(&mailbox.emails[msgno].path).to_owned();

        let found = names
            .get(&canon)
            .copied()
            .filter(|&ix| list[ix].email.is_some());

        if let Some(ix) = found {
            // message still exists, merge flags
            mailbox.emails[msgno].active = true;

            let discovered = list[ix].email.take().expect("filtered above");

            // the message may have moved to a different subdirectory
            if mailbox.emails[msgno].path != discovered.path {
                mailbox.emails[msgno].path = discovered.path.clone();
            }

            if !mailbox.emails[msgno].changed
                && update_flags(mailbox, msgno, &discovered, ctx.hooks)
            {
                flags_changed = true;
            }

            // Once deleted and trash diverge the user has expressed an
            // intent we must not overwrite.
            if mailbox.emails[msgno].deleted == mailbox.emails[msgno].trash
                && mailbox.emails[msgno].deleted != discovered.deleted
            {
                if discovered.deleted {
                    mailbox.msg_deleted += 1;
                } else {
                    mailbox.msg_deleted -= 1;
                }
                mailbox.emails[msgno].deleted = discovered.deleted;
                flags_changed = true;
            }
            mailbox.emails[msgno].trash = discovered.trash;
        } else if (0 != changed & 1
            && mailbox.emails[msgno].path.starts_with("new/"))
            || (0 != changed & 2
                && mailbox.emails[msgno].path.starts_with("cur/"))
        {
            // We just scanned the subdirectory this message lived in, so
            // its absence means it is really gone.
            occult = true;
        } else {
            // Resides in a subdirectory which was not scanned; assume it
            // is still present and unchanged.
            mailbox.emails[msgno].active = true;
        }
    }

    if occult {
        mailbox.update_tables(ctx.hooks, index_hint.as_deref_mut());
    }

    scan::delayed_parse(mailbox, &mut list, ctx)?;
    let have_new = scan::promote(mailbox, list);

    Ok(if occult {
        CheckOutcome::Reopened
    } else if have_new {
        CheckOutcome::NewMail
    } else if flags_changed {
        CheckOutcome::FlagsChanged
    } else {
        CheckOutcome::Unchanged
    })
}

/// Incremental check for an MH folder.
///
/// The shape matches the maildir check, but the watched nodes are the
/// folder root and the sequence sidecar, the whole root is rescanned, and
/// matching by numeric name is not enough: another writer may have reused
/// a number for a different message, so candidates are confirmed with a
/// strict content comparison.
pub(crate) fn mh_check(
    mailbox: &mut Mailbox,
    ctx: &StoreContext,
    mut index_hint: Option<&mut usize>,
) -> Result<CheckOutcome, Error> {
    if !ctx.config.check_new {
        return Ok(CheckOutcome::Unchanged);
    }

    let st = fs::metadata(&mailbox.path)?.modified()?;

    let seq_path = sequences::sequences_path(&mailbox.path);
    let mut modified = false;
    let st_cur = match file_ops::mtime(&seq_path) {
        Some(t) => Some(t),
        None => {
            // create .mh_sequences when there isn't one
            if let Ok((file, tmp)) = message::folder_tempfile(mailbox) {
                drop(file);
                if file_ops::safe_rename(&tmp, &seq_path).is_err() {
                    let _ = fs::remove_file(&tmp);
                }
            }
            let t = file_ops::mtime(&seq_path);
            if t.is_none() {
                modified = true;
            }
            t
        },
    };

    if newer(Some(st), mailbox.mtime)
        || newer(st_cur, mailbox.dir_state.mtime_cur)
    {
        modified = true;
    }
    if !modified {
        return Ok(CheckOutcome::Unchanged);
    }

    if mailbox.monitor_event {
        mailbox.monitor_event = false;
    } else {
        if st_cur.is_some() {
            mailbox.dir_state.mtime_cur = st_cur;
        }
        mailbox.mtime = Some(st);
    }

    let mut list = Vec::new();
    scan::scan_dir(mailbox, None, ctx, &mut list)?;
    scan::delayed_parse(mailbox, &mut list, ctx)?;

    let set = sequences::read_sequences(&mailbox.path, ctx.config)?;
    apply_sequences(&mut list, &set);

    let mut names: HashMap<String, usize> =
        HashMap::with_capacity(list.len());
    for (ix, entry) in list.iter_mut().enumerate() {
        if let Some(email) = entry.email.as_ref() {
            entry.canon = Some(email.path.clone());
            names.insert(email.path.clone(), ix);
        }
    }

    let mut occult = false;
    let mut flags_changed = false;

    for msgno in 0..mailbox.msg_count {
        mailbox.emails[msgno].active = false;

        let found = names
            .get(&mailbox.emails[msgno].path)
            .copied()
            .filter(|&ix| {
                list[ix].email.as_ref().map_or(false, |discovered| {
                    mailbox.emails[msgno].cmp_strict(discovered)
                })
            });

        if let Some(ix) = found {
            // found the right message
            mailbox.emails[msgno].active = true;
            let discovered = list[ix].email.take().expect("filtered above");

            if !mailbox.emails[msgno].changed
                && update_flags(mailbox, msgno, &discovered, ctx.hooks)
            {
                flags_changed = true;
            }
        } else {
            // message has disappeared (or was replaced by a different
            // message with the same number)
            occult = true;
        }
    }

    if occult {
        mailbox.update_tables(ctx.hooks, index_hint.as_deref_mut());
    }

    let have_new = scan::promote(mailbox, list);

    Ok(if occult {
        CheckOutcome::Reopened
    } else if have_new {
        CheckOutcome::NewMail
    } else if flags_changed {
        CheckOutcome::FlagsChanged
    } else {
        CheckOutcome::Unchanged
    })
}

/// Whether the message file for `msgno` predates the last visit to the
/// folder.
fn already_notified(mailbox: &Mailbox, number: usize) -> Option<bool> {
    let t = file_ops::mtime(mailbox.path.join(number.to_string()))?;
    Some(match mailbox.last_visited {
        Some(visited) => t <= visited,
        None => false,
    })
}

/// Lightweight new-mail poll for an MH folder that is not open: answers
/// from the sequence sidecar alone, optionally refreshing the message
/// tallies.
///
/// Returns whether the folder should be reported as having new mail.
pub fn mh_stats(
    mailbox: &mut Mailbox,
    config: &StoreConfig,
    check_stats: bool,
) -> Result<bool, Error> {
    let mut check_new = true;
    let mut has_new = false;

    // When mail_check_recent is set and the sidecar has not changed since
    // the last visit, there is no "new mail".
    if config.mail_check_recent {
        let seq_changed =
            file_ops::mtime(sequences::sequences_path(&mailbox.path))
                .map(|t| newer(Some(t), mailbox.last_visited));
        if !seq_changed.unwrap_or(false) {
            check_new = false;
        }
    }

    if !(check_new || check_stats) {
        return Ok(false);
    }

    let set = sequences::read_sequences(&mailbox.path, config)?;

    if check_stats {
        mailbox.msg_count = 0;
        mailbox.msg_unread = 0;
        mailbox.msg_flagged = 0;
    }

    for number in (1..=set.max()).rev() {
        let flags = set.get(number);
        if check_stats && flags.intersects(SeqFlag::FLAGGED) {
            mailbox.msg_flagged += 1;
        }
        if flags.intersects(SeqFlag::UNSEEN) {
            if check_stats {
                mailbox.msg_unread += 1;
            }
            if check_new {
                // if the first unseen message we encounter was already in
                // the mailbox during the last visit, don't notify
                if !config.mail_check_recent
                    || Some(false) == already_notified(mailbox, number)
                {
                    mailbox.has_new = true;
                    has_new = true;
                }
                // Traversing from high to low, the first unseen message
                // settles the question either way.
                check_new = false;
                if !check_stats {
                    break;
                }
            }
        }
    }

    if check_stats {
        for entry in fs::read_dir(&mailbox.path)? {
            let entry = entry?;
            if let Ok(name) = entry.file_name().into_string() {
                if valid_mh_name(&name) {
                    mailbox.msg_count += 1;
                }
            }
        }
    }

    debug!(
        "{}: new={} unread={} flagged={}",
        mailbox.path.display(),
        has_new,
        mailbox.msg_unread,
        mailbox.msg_flagged
    );

    Ok(has_new)
}
