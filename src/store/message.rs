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

//! Message allocation and commit.
//!
//! New messages are staged in a private file (`tmp/` for maildir, a hidden
//! dot-file for MH) and moved to their final name with a link-then-unlink
//! rename that loses gracefully when another writer claims the same name
//! first: the committer retries with a fresh timestamp/random pair
//! (maildir) or the next message number (MH).

use std::fs::{self, File, OpenOptions};
use std::io;
use std::os::unix::fs::OpenOptionsExt;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU32, Ordering};

use chrono::offset::Utc;
use log::{debug, warn};
use rand::{rngs::OsRng, Rng};

use crate::store::filename;
use crate::store::model::{Email, Mailbox, Message, StoreContext};
use crate::store::open::folder_umask;
use crate::store::scan::valid_mh_name;
use crate::store::sequences;
use crate::support::error::Error;
use crate::support::file_ops;
use crate::support::hostname::SHORT_HOSTNAME;

fn is_exdev(e: &io::Error) -> bool {
    Some(nix::libc::EXDEV) == e.raw_os_error()
}

/// Create a uniquely named hidden file directly inside the folder,
/// retrying only on name collisions.
///
/// Used for MH message staging and for `.mh_sequences` rewrites.
pub(crate) fn folder_tempfile(
    mailbox: &Mailbox,
) -> Result<(File, PathBuf), Error> {
    let mode = 0o666 & !folder_umask(mailbox);

    loop {
        let path = mailbox.path.join(format!(
            ".mailfold-{}-{}-{}",
            *SHORT_HOSTNAME,
            std::process::id(),
            OsRng.gen::<u64>()
        ));
        match OpenOptions::new()
            .write(true)
            .create_new(true)
            .mode(mode)
            .open(&path)
        {
            Ok(file) => return Ok((file, path)),
            Err(e) if io::ErrorKind::AlreadyExists == e.kind() => continue,
            Err(e) => return Err(e.into()),
        }
    }
}

fn flags_from(msg: &mut Message, email: &Email) {
    msg.read = email.read;
    msg.flagged = email.flagged;
    msg.replied = email.replied;
    if 0 != email.received {
        msg.received = Some(email.received);
    }
}

/// Open a new message staged under `tmp/`.
///
/// The staging name carries the destination subdirectory and the flag
/// suffix so that commit can construct the final name without the email.
/// `deleted` is cleared while generating the suffix so a `T` never leaks
/// into `tmp/`.
pub(crate) fn maildir_open_new(
    mailbox: &Mailbox,
    email: Option<&Email>,
) -> Result<Message, Error> {
    let (subdir, suffix) = match email {
        Some(email) => {
            let mut undeleted = email.clone();
            undeleted.deleted = false;
            (
                if email.read || email.old { "cur" } else { "new" },
                filename::flag_suffix(&undeleted),
            )
        },
        None => ("new", String::new()),
    };

    let mode = 0o666 & !folder_umask(mailbox);
    loop {
        let path = mailbox.path.join("tmp").join(format!(
            "{}.{}.R{}.{}{}",
            subdir,
            Utc::now().timestamp(),
            OsRng.gen::<u64>(),
            *SHORT_HOSTNAME,
            suffix
        ));
        debug!("trying {}", path.display());

        match OpenOptions::new()
            .write(true)
            .create_new(true)
            .mode(mode)
            .open(&path)
        {
            Ok(file) => {
                let mut msg = Message::staged(file, path);
                if let Some(email) = email {
                    flags_from(&mut msg, email);
                }
                return Ok(msg);
            },
            Err(e) if io::ErrorKind::AlreadyExists == e.kind() => continue,
            Err(e) => return Err(e.into()),
        }
    }
}

/// Open a new message staged directly in an MH folder.
pub(crate) fn mh_open_new(
    mailbox: &Mailbox,
    email: Option<&Email>,
) -> Result<Message, Error> {
    let (file, path) = folder_tempfile(mailbox)?;
    let mut msg = Message::staged(file, path);
    if let Some(email) = email {
        flags_from(&mut msg, email);
    }
    Ok(msg)
}

fn flush_staging(msg: &mut Message) -> Result<(), Error> {
    match msg.file.take() {
        Some(file) => {
            file.sync_all()?;
            Ok(())
        },
        None => Ok(()),
    }
}

fn apply_received(path: &Path, received: i64) -> Result<(), Error> {
    let t = nix::sys::time::TimeVal::new(
        received as nix::libc::time_t,
        0,
    );
    nix::sys::stat::utimes(path, &t, &t)?;
    Ok(())
}

/// Commit a staged maildir message to its `new/` or `cur/` destination.
///
/// The staging name looks like `tmp/{cur,new}.<ts>.R<rand>.<host><suffix>`;
/// the destination drops the subdirectory prefix into an actual directory
/// component. Collisions regenerate the timestamp/random pair.
pub(crate) fn maildir_commit(
    mailbox: &Mailbox,
    msg: &mut Message,
    mut email: Option<&mut Email>,
) -> Result<(), Error> {
    flush_staging(msg)?;

    let staging = msg
        .path
        .file_name()
        .and_then(|n| n.to_str())
        .ok_or(Error::NxMessage)?
        .to_owned();
    let subdir = staging.split('.').next().unwrap_or("new").to_owned();
    let suffix = staging
        .find(':')
        .map(|ix| &staging[ix..])
        .unwrap_or("")
        .to_owned();

    loop {
        let part = format!(
            "{}/{}.R{}.{}{}",
            subdir,
            Utc::now().timestamp(),
            OsRng.gen::<u64>(),
            *SHORT_HOSTNAME,
            suffix
        );
        let full = mailbox.path.join(&part);
        debug!("renaming {} to {}", msg.path.display(), full.display());

        match file_ops::safe_rename(&msg.path, &full) {
            Ok(()) => {
                // Adjust the mtime on the file to match the time at which
                // the message was received. This is only set when copying
                // messages between mailboxes.
                if let Some(received) = msg.received {
                    apply_received(&full, received)?;
                }

                if let Some(email) = email.as_deref_mut() {
                    email.path = part;
                }
                msg.committed_path = Some(full);
                return Ok(());
            },
            Err(e) if io::ErrorKind::AlreadyExists == e.kind() => continue,
            Err(e) if is_exdev(&e) => {
                return Err(Error::RenameAcrossFilesystems)
            },
            Err(e) => return Err(e.into()),
        }
    }
}

/// The highest message number currently present in an MH folder.
///
/// Tombstones count with their comma stripped, so a deleted `5` still
/// reserves numbers up to 5.
fn mh_highest_number(root: &Path) -> Result<usize, Error> {
    let mut hi = 0;
    for entry in fs::read_dir(root)? {
        let entry = entry?;
        if let Ok(name) = entry.file_name().into_string() {
            let name = name.strip_prefix(',').unwrap_or(&name);
            if valid_mh_name(name) {
                if let Ok(n) = name.parse::<usize>() {
                    hi = hi.max(n);
                }
            }
        }
    }
    Ok(hi)
}

/// Commit a staged MH message under the next free message number.
///
/// With `update_sequences` set, the new number is also appended to the
/// folder's unseen/flagged/replied sequences as the message's flags
/// dictate.
pub(crate) fn mh_commit(
    mailbox: &Mailbox,
    msg: &mut Message,
    mut email: Option<&mut Email>,
    update_sequences: bool,
    ctx: &StoreContext,
) -> Result<(), Error> {
    flush_staging(msg)?;

    let mut hi = mh_highest_number(&mailbox.path)?;

    loop {
        hi += 1;
        let name = hi.to_string();
        let full = mailbox.path.join(&name);

        match file_ops::safe_rename(&msg.path, &full) {
            Ok(()) => {
                if let Some(email) = email.as_deref_mut() {
                    email.path = name;
                }
                msg.committed_path = Some(full);
                break;
            },
            Err(e) if io::ErrorKind::AlreadyExists == e.kind() => continue,
            Err(e) if is_exdev(&e) => {
                return Err(Error::RenameAcrossFilesystems)
            },
            Err(e) => return Err(e.into()),
        }
    }

    if update_sequences {
        sequences::add_one(
            mailbox,
            hi,
            !msg.read,
            msg.flagged,
            msg.replied,
            ctx.config,
        )?;
    }

    Ok(())
}

/// Open an existing message by index.
///
/// For maildir, ENOENT falls back to re-locating the message by canonical
/// name, since a concurrent writer may have renamed it for a flag change.
pub(crate) fn open_message(
    mailbox: &Mailbox,
    msgno: usize,
    is_maildir: bool,
) -> Result<Message, Error> {
    let email = mailbox.emails.get(msgno).ok_or(Error::NxMessage)?;
    let full = mailbox.full_path(&email.path);

    let (file, path) = match File::open(&full) {
        Ok(file) => (file, full),
        Err(e) if io::ErrorKind::NotFound == e.kind() && is_maildir => {
            find_message(&mailbox.path, &email.path)
                .ok_or(Error::NxMessage)?
        },
        Err(e) => return Err(e.into()),
    };

    let mut msg = Message::staged(file, path);
    flags_from(&mut msg, email);
    Ok(msg)
}

// Simple dynamic optimisation: search first wherever we found moved
// messages before.
static NEW_HITS: AtomicU32 = AtomicU32::new(0);
static CUR_HITS: AtomicU32 = AtomicU32::new(0);

fn find_in_subdir(
    folder: &Path,
    canon: &str,
    subdir: &str,
) -> Option<(File, PathBuf)> {
    let dir = fs::read_dir(folder.join(subdir)).ok()?;
    for entry in dir.flatten() {
        let name = match entry.file_name().into_string() {
            Ok(name) => name,
            Err(_) => continue,
        };
        if filename::canon_name(&name) == canon {
            let path = folder.join(subdir).join(&name);
            if let Ok(file) = File::open(&path) {
                return Some((file, path));
            }
        }
    }
    None
}

/// Re-locate a maildir message that moved under our feet, scanning both
/// subdirectories for a file with the same canonical name. Expensive, but
/// called rarely.
pub(crate) fn find_message(
    folder: &Path,
    msg_rel: &str,
) -> Option<(File, PathBuf)> {
    let canon = filename::canon_name(msg_rel).to_owned();

    let new_first =
        NEW_HITS.load(Ordering::Relaxed) > CUR_HITS.load(Ordering::Relaxed);
    let order = if new_first {
        ["new", "cur"]
    } else {
        ["cur", "new"]
    };

    for subdir in order {
        if let Some(found) = find_in_subdir(folder, &canon, subdir) {
            let counter =
                if "new" == subdir { &NEW_HITS } else { &CUR_HITS };
            counter.fetch_add(1, Ordering::Relaxed);
            return Some(found);
        }
    }

    warn!("unable to find {} anywhere under {}", canon, folder.display());
    None
}

/// Whether a maildir folder contains no messages. Looks at `cur/` first
/// since long-lived folders usually have old mail.
pub fn maildir_check_empty(path: &Path) -> Result<bool, Error> {
    for subdir in ["cur", "new"] {
        for entry in fs::read_dir(path.join(subdir))? {
            let entry = entry?;
            if !entry.file_name().to_string_lossy().starts_with('.') {
                return Ok(false);
            }
        }
    }
    Ok(true)
}

/// Whether an MH folder contains no messages.
pub fn mh_check_empty(path: &Path) -> Result<bool, Error> {
    for entry in fs::read_dir(path)? {
        let entry = entry?;
        if let Ok(name) = entry.file_name().into_string() {
            if valid_mh_name(&name) {
                return Ok(false);
            }
        }
    }
    Ok(true)
}
