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

//! Opening folders: the full two-pass load, and append-mode creation of
//! folders that do not exist yet.

use std::fs;
use std::os::unix::fs::{DirBuilderExt, MetadataExt, OpenOptionsExt};

use log::debug;

use crate::store::model::{Mailbox, MailboxKind, StoreContext};
use crate::store::scan::{self, ScanEntry};
use crate::store::sequences::{self, SeqFlag, SequenceSet};
use crate::support::error::Error;
use crate::support::file_ops::{self, ErrorTransforms};

/// Refresh the recorded modification times of the watched nodes.
///
/// For maildir the primary node is `new/` with `cur/` tracked separately;
/// for MH the primary node is the folder root with `.mh_sequences` tracked
/// separately.
pub(crate) fn update_mtime(mailbox: &mut Mailbox) {
    let (secondary, primary) = match mailbox.kind {
        MailboxKind::Maildir => {
            (mailbox.path.join("cur"), mailbox.path.join("new"))
        },
        _ => (
            sequences::sequences_path(&mailbox.path),
            mailbox.path.clone(),
        ),
    };

    if let Some(t) = file_ops::mtime(&secondary) {
        mailbox.dir_state.mtime_cur = Some(t);
    }
    if let Some(t) = file_ops::mtime(&primary) {
        mailbox.mtime = Some(t);
    }
}

/// Permission mask for files created inside the folder, derived from the
/// folder directory's own mode.
pub(crate) fn folder_umask(mailbox: &Mailbox) -> u32 {
    if let Some(umask) = mailbox.dir_state.mh_umask {
        return umask;
    }

    match fs::metadata(&mailbox.path) {
        Ok(md) => 0o777 & !md.mode(),
        Err(_) => {
            debug!("stat failed on {}", mailbox.path.display());
            0o077
        },
    }
}

/// Copy the sequence-file flags onto each scanned entry, keyed by the
/// numeric filename.
pub(crate) fn apply_sequences(list: &mut [ScanEntry], set: &SequenceSet) {
    for entry in list {
        let email = match entry.email.as_mut() {
            Some(email) => email,
            None => continue,
        };
        let number = match email.basename().parse::<usize>() {
            Ok(n) => n,
            Err(_) => continue,
        };

        let flags = set.get(number);
        email.read = !flags.intersects(SeqFlag::UNSEEN);
        email.flagged = flags.intersects(SeqFlag::FLAGGED);
        email.replied = flags.intersects(SeqFlag::REPLIED);
    }
}

/// Load one subdirectory (or, for MH, the folder root) into the mailbox.
fn read_dir(
    mailbox: &mut Mailbox,
    subdir: Option<&str>,
    ctx: &StoreContext,
) -> Result<(), Error> {
    debug!("scanning {}", mailbox.path.display());

    update_mtime(mailbox);

    let mut list = Vec::new();
    scan::scan_dir(mailbox, subdir, ctx, &mut list)?;
    scan::delayed_parse(mailbox, &mut list, ctx)?;

    if MailboxKind::Mh == mailbox.kind {
        let set = sequences::read_sequences(&mailbox.path, ctx.config)?;
        apply_sequences(&mut list, &set);
    }

    scan::promote(mailbox, list);

    if mailbox.dir_state.mh_umask.is_none() {
        mailbox.dir_state.mh_umask = Some(folder_umask(mailbox));
    }

    Ok(())
}

/// Read a maildir folder: two subdirectories of the root hold the actual
/// messages.
pub(crate) fn maildir_open(
    mailbox: &mut Mailbox,
    ctx: &StoreContext,
) -> Result<(), Error> {
    read_dir(mailbox, Some("new"), ctx)?;
    read_dir(mailbox, Some("cur"), ctx)
}

pub(crate) fn mh_open(
    mailbox: &mut Mailbox,
    ctx: &StoreContext,
) -> Result<(), Error> {
    read_dir(mailbox, None, ctx)
}

/// Create the `{tmp,new,cur}` triple for a fresh maildir folder, removing
/// whatever was created if any step fails.
pub(crate) fn maildir_open_append(
    mailbox: &mut Mailbox,
    create: bool,
) -> Result<(), Error> {
    mailbox.append = true;
    if !create {
        return Ok(());
    }

    fs::DirBuilder::new()
        .mode(0o700)
        .create(&mailbox.path)
        .on_exists(Error::MailboxExists)?;

    let mut created = Vec::new();
    for subdir in ["cur", "new", "tmp"] {
        let path = mailbox.path.join(subdir);
        if let Err(e) = fs::DirBuilder::new().mode(0o700).create(&path) {
            for dir in created.iter().rev() {
                let _ = fs::remove_dir(dir);
            }
            let _ = fs::remove_dir(&mailbox.path);
            return Err(e.into());
        }
        created.push(path);
    }

    Ok(())
}

/// Create a fresh MH folder: the directory plus an empty `.mh_sequences`.
pub(crate) fn mh_open_append(
    mailbox: &mut Mailbox,
    create: bool,
) -> Result<(), Error> {
    mailbox.append = true;
    if !create {
        return Ok(());
    }

    fs::DirBuilder::new()
        .mode(0o700)
        .create(&mailbox.path)
        .on_exists(Error::MailboxExists)?;

    let sidecar = sequences::sequences_path(&mailbox.path);
    if let Err(e) = fs::OpenOptions::new()
        .mode(0o600)
        .create_new(true)
        .write(true)
        .open(&sidecar)
    {
        let _ = fs::remove_dir(&mailbox.path);
        return Err(e.into());
    }

    Ok(())
}
