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

//! The folder storage engine.
//!
//! Each supported format exposes the same operation table,
//! [`MailboxOps`]; hosts hold a `&'static dyn MailboxOps` and never need
//! to know which format is behind it. The compressed wrapper implements
//! the same table by delegating to the engine of whatever format its
//! plaintext working copy turns out to be.

use std::path::Path;
use std::time::SystemTime;

pub mod check;
pub mod compress;
pub mod filename;
pub mod hcache;
pub mod message;
pub mod model;
pub mod open;
pub mod paths;
pub mod scan;
pub mod sequences;
pub mod sync;

pub use self::check::mh_stats;
pub use self::compress::{CompressHooks, ShellRunner, SystemShell};
pub use self::hcache::{HeaderCache, HeaderCacheStore, MemoryCacheStore};
pub use self::message::{maildir_check_empty, mh_check_empty};
pub use self::model::{
    CheckOutcome, Content, Email, Flag, HeaderParser, Mailbox,
    MailboxKind, Message, MessageCopier, NoHooks, PlainParser, RawCopier,
    StoreContext, StoreHooks,
};
pub use self::sequences::{SeqFlag, SequenceSet};

use crate::support::error::Error;

/// The operation table every folder format implements.
pub trait MailboxOps: Sync {
    fn kind(&self) -> MailboxKind;

    /// Load the folder into the mailbox.
    fn mbox_open(
        &self,
        mailbox: &mut Mailbox,
        ctx: &StoreContext,
    ) -> Result<(), Error>;

    /// Prepare the folder for appending; with `create`, bring a fresh
    /// folder into existence first.
    fn mbox_open_append(
        &self,
        mailbox: &mut Mailbox,
        create: bool,
        ctx: &StoreContext,
    ) -> Result<(), Error>;

    /// Reconcile the in-memory view with whatever changed on disk.
    fn mbox_check(
        &self,
        mailbox: &mut Mailbox,
        ctx: &StoreContext,
        index_hint: Option<&mut usize>,
    ) -> Result<CheckOutcome, Error>;

    /// Write pending changes back to disk. If the folder changed on disk
    /// since the last check, nothing is written and the check result is
    /// returned for the caller to deal with first.
    fn mbox_sync(
        &self,
        mailbox: &mut Mailbox,
        ctx: &StoreContext,
        index_hint: Option<&mut usize>,
    ) -> Result<CheckOutcome, Error>;

    fn mbox_close(
        &self,
        mailbox: &mut Mailbox,
        ctx: &StoreContext,
    ) -> Result<(), Error>;

    /// Open an existing message for reading.
    fn msg_open(
        &self,
        mailbox: &Mailbox,
        msgno: usize,
    ) -> Result<Message, Error>;

    /// Stage a new message for writing. `email`, when given, seeds the
    /// flags and the destination subdirectory.
    fn msg_open_new(
        &self,
        mailbox: &Mailbox,
        email: Option<&Email>,
        ctx: &StoreContext,
    ) -> Result<Message, Error>;

    /// Move a staged message to its final, uniquely named location.
    fn msg_commit(
        &self,
        mailbox: &Mailbox,
        msg: &mut Message,
        email: Option<&mut Email>,
        ctx: &StoreContext,
    ) -> Result<(), Error>;

    fn msg_close(&self, msg: &mut Message) -> Result<(), Error>;

    /// Whether `path` looks like a folder of this format.
    fn path_probe(&self, path: &Path) -> bool;
}

pub struct MaildirOps;
pub struct MhOps;
pub struct CompressOps;

pub static MAILDIR_OPS: MaildirOps = MaildirOps;
pub static MH_OPS: MhOps = MhOps;
pub static COMPRESS_OPS: CompressOps = CompressOps;

/// The operation table for a plain folder format.
pub fn ops_for(kind: MailboxKind) -> &'static dyn MailboxOps {
    match kind {
        MailboxKind::Maildir => &MAILDIR_OPS,
        MailboxKind::Mh => &MH_OPS,
        MailboxKind::Compressed => &COMPRESS_OPS,
    }
}

/// The operation table for an open mailbox. A mailbox with compress state
/// keeps routing through the wrapper even after its `kind` was rewritten
/// to the probed plaintext format.
pub fn ops(mailbox: &Mailbox) -> &'static dyn MailboxOps {
    if mailbox.compress.is_some() {
        &COMPRESS_OPS
    } else {
        ops_for(mailbox.kind)
    }
}

impl MailboxOps for MaildirOps {
    fn kind(&self) -> MailboxKind {
        MailboxKind::Maildir
    }

    fn mbox_open(
        &self,
        mailbox: &mut Mailbox,
        ctx: &StoreContext,
    ) -> Result<(), Error> {
        open::maildir_open(mailbox, ctx)
    }

    fn mbox_open_append(
        &self,
        mailbox: &mut Mailbox,
        create: bool,
        _ctx: &StoreContext,
    ) -> Result<(), Error> {
        open::maildir_open_append(mailbox, create)
    }

    fn mbox_check(
        &self,
        mailbox: &mut Mailbox,
        ctx: &StoreContext,
        index_hint: Option<&mut usize>,
    ) -> Result<CheckOutcome, Error> {
        check::maildir_check(mailbox, ctx, index_hint)
    }

    fn mbox_sync(
        &self,
        mailbox: &mut Mailbox,
        ctx: &StoreContext,
        index_hint: Option<&mut usize>,
    ) -> Result<CheckOutcome, Error> {
        sync::folder_sync(mailbox, ctx, index_hint)
    }

    fn mbox_close(
        &self,
        mailbox: &mut Mailbox,
        _ctx: &StoreContext,
    ) -> Result<(), Error> {
        mailbox.last_visited = Some(SystemTime::now());
        Ok(())
    }

    fn msg_open(
        &self,
        mailbox: &Mailbox,
        msgno: usize,
    ) -> Result<Message, Error> {
        message::open_message(mailbox, msgno, true)
    }

    fn msg_open_new(
        &self,
        mailbox: &Mailbox,
        email: Option<&Email>,
        _ctx: &StoreContext,
    ) -> Result<Message, Error> {
        message::maildir_open_new(mailbox, email)
    }

    fn msg_commit(
        &self,
        mailbox: &Mailbox,
        msg: &mut Message,
        email: Option<&mut Email>,
        _ctx: &StoreContext,
    ) -> Result<(), Error> {
        message::maildir_commit(mailbox, msg, email)
    }

    fn msg_close(&self, msg: &mut Message) -> Result<(), Error> {
        msg.file.take();
        Ok(())
    }

    fn path_probe(&self, path: &Path) -> bool {
        paths::maildir_path_probe(path)
    }
}

impl MailboxOps for MhOps {
    fn kind(&self) -> MailboxKind {
        MailboxKind::Mh
    }

    fn mbox_open(
        &self,
        mailbox: &mut Mailbox,
        ctx: &StoreContext,
    ) -> Result<(), Error> {
        open::mh_open(mailbox, ctx)
    }

    fn mbox_open_append(
        &self,
        mailbox: &mut Mailbox,
        create: bool,
        _ctx: &StoreContext,
    ) -> Result<(), Error> {
        open::mh_open_append(mailbox, create)
    }

    fn mbox_check(
        &self,
        mailbox: &mut Mailbox,
        ctx: &StoreContext,
        index_hint: Option<&mut usize>,
    ) -> Result<CheckOutcome, Error> {
        check::mh_check(mailbox, ctx, index_hint)
    }

    fn mbox_sync(
        &self,
        mailbox: &mut Mailbox,
        ctx: &StoreContext,
        index_hint: Option<&mut usize>,
    ) -> Result<CheckOutcome, Error> {
        sync::folder_sync(mailbox, ctx, index_hint)
    }

    fn mbox_close(
        &self,
        mailbox: &mut Mailbox,
        _ctx: &StoreContext,
    ) -> Result<(), Error> {
        mailbox.last_visited = Some(SystemTime::now());
        Ok(())
    }

    fn msg_open(
        &self,
        mailbox: &Mailbox,
        msgno: usize,
    ) -> Result<Message, Error> {
        message::open_message(mailbox, msgno, false)
    }

    fn msg_open_new(
        &self,
        mailbox: &Mailbox,
        email: Option<&Email>,
        _ctx: &StoreContext,
    ) -> Result<Message, Error> {
        message::mh_open_new(mailbox, email)
    }

    fn msg_commit(
        &self,
        mailbox: &Mailbox,
        msg: &mut Message,
        email: Option<&mut Email>,
        ctx: &StoreContext,
    ) -> Result<(), Error> {
        message::mh_commit(mailbox, msg, email, true, ctx)
    }

    fn msg_close(&self, msg: &mut Message) -> Result<(), Error> {
        msg.file.take();
        Ok(())
    }

    fn path_probe(&self, path: &Path) -> bool {
        paths::mh_path_probe(path)
    }
}

impl MailboxOps for CompressOps {
    fn kind(&self) -> MailboxKind {
        MailboxKind::Compressed
    }

    fn mbox_open(
        &self,
        mailbox: &mut Mailbox,
        ctx: &StoreContext,
    ) -> Result<(), Error> {
        compress::comp_open(mailbox, ctx)
    }

    fn mbox_open_append(
        &self,
        mailbox: &mut Mailbox,
        create: bool,
        ctx: &StoreContext,
    ) -> Result<(), Error> {
        compress::comp_open_append(mailbox, create, ctx)
    }

    fn mbox_check(
        &self,
        mailbox: &mut Mailbox,
        ctx: &StoreContext,
        index_hint: Option<&mut usize>,
    ) -> Result<CheckOutcome, Error> {
        compress::comp_check(mailbox, ctx, index_hint)
    }

    fn mbox_sync(
        &self,
        mailbox: &mut Mailbox,
        ctx: &StoreContext,
        index_hint: Option<&mut usize>,
    ) -> Result<CheckOutcome, Error> {
        compress::comp_sync(mailbox, ctx, index_hint)
    }

    fn mbox_close(
        &self,
        mailbox: &mut Mailbox,
        ctx: &StoreContext,
    ) -> Result<(), Error> {
        compress::comp_close(mailbox, ctx)
    }

    fn msg_open(
        &self,
        mailbox: &Mailbox,
        msgno: usize,
    ) -> Result<Message, Error> {
        compress::child_ops(mailbox)?.msg_open(mailbox, msgno)
    }

    fn msg_open_new(
        &self,
        mailbox: &Mailbox,
        email: Option<&Email>,
        ctx: &StoreContext,
    ) -> Result<Message, Error> {
        compress::child_ops(mailbox)?.msg_open_new(mailbox, email, ctx)
    }

    fn msg_commit(
        &self,
        mailbox: &Mailbox,
        msg: &mut Message,
        email: Option<&mut Email>,
        ctx: &StoreContext,
    ) -> Result<(), Error> {
        compress::child_ops(mailbox)?.msg_commit(mailbox, msg, email, ctx)
    }

    fn msg_close(&self, msg: &mut Message) -> Result<(), Error> {
        msg.file.take();
        Ok(())
    }

    fn path_probe(&self, path: &Path) -> bool {
        path.is_file()
    }
}

#[cfg(test)]
mod test {
    use std::fs;
    use std::io::{Read, Write};
    use std::time::{Duration, SystemTime};

    use tempfile::TempDir;

    use super::*;
    use crate::support::config::StoreConfig;

    #[test]
    fn full_maildir_session_through_the_ops_table() {
        let root = TempDir::new().unwrap();
        let config = StoreConfig::default();
        let ctx = StoreContext::new(&config);

        // create a brand new folder by opening it for append
        let mut writer = Mailbox::new(
            root.path().join("box"),
            MailboxKind::Maildir,
        );
        let ops = ops_for(MailboxKind::Maildir);
        ops.mbox_open_append(&mut writer, true, &ctx).unwrap();

        // deliver a message
        let mut msg = ops.msg_open_new(&mut writer, None, &ctx).unwrap();
        msg.file
            .as_mut()
            .unwrap()
            .write_all(b"Message-ID: <m1@t>\nSubject: hi\n\nhello\n")
            .unwrap();
        ops.msg_commit(&mut writer, &mut msg, None, &ctx).unwrap();
        ops.msg_close(&mut msg).unwrap();
        ops.mbox_close(&mut writer, &ctx).unwrap();

        // a reader sees it arrive
        let mut reader = Mailbox::new(
            root.path().join("box"),
            MailboxKind::Maildir,
        );
        assert!(ops.path_probe(&reader.path));
        ops.mbox_open(&mut reader, &ctx).unwrap();
        assert_eq!(1, reader.msg_count);
        assert_eq!(1, reader.msg_unread);

        let mut msg = ops.msg_open(&reader, 0).unwrap();
        let mut contents = String::new();
        msg.file
            .as_mut()
            .unwrap()
            .read_to_string(&mut contents)
            .unwrap();
        assert!(contents.ends_with("hello\n"));
        ops.msg_close(&mut msg).unwrap();

        // read it, sync, and confirm the rename to cur/
        reader.set_flag(0, Flag::Read, true);
        assert_eq!(
            CheckOutcome::Unchanged,
            ops.mbox_sync(&mut reader, &ctx, None).unwrap()
        );
        assert!(reader.emails[0].path.starts_with("cur/"));
        assert!(reader.emails[0].path.ends_with(":2,S"));

        // idempotent check afterwards
        assert_eq!(
            CheckOutcome::Unchanged,
            ops.mbox_check(&mut reader, &ctx, None).unwrap()
        );
        ops.mbox_close(&mut reader, &ctx).unwrap();
        assert!(reader.last_visited.is_some());
    }

    #[test]
    fn delivery_into_open_mh_folder_is_detected() {
        let root = TempDir::new().unwrap();
        let config = StoreConfig::default();
        let ctx = StoreContext::new(&config);
        let ops = ops_for(MailboxKind::Mh);

        let mut writer =
            Mailbox::new(root.path().join("mh"), MailboxKind::Mh);
        ops.mbox_open_append(&mut writer, true, &ctx).unwrap();

        let mut reader =
            Mailbox::new(root.path().join("mh"), MailboxKind::Mh);
        ops.mbox_open(&mut reader, &ctx).unwrap();
        assert_eq!(0, reader.msg_count);

        let mut msg = ops.msg_open_new(&writer, None, &ctx).unwrap();
        msg.file
            .as_mut()
            .unwrap()
            .write_all(b"Message-ID: <d@t>\nSubject: x\n\nnew\n")
            .unwrap();
        ops.msg_commit(&writer, &mut msg, None, &ctx).unwrap();

        let past = SystemTime::UNIX_EPOCH + Duration::from_secs(1);
        reader.mtime = Some(past);
        reader.dir_state.mtime_cur = Some(past);
        assert_eq!(
            CheckOutcome::NewMail,
            ops.mbox_check(&mut reader, &ctx, None).unwrap()
        );
        assert_eq!(1, reader.msg_count);
        assert_eq!("1", reader.emails[0].path);
        assert!(!reader.emails[0].read, "committed into unseen sequence");

        let sidecar = fs::read_to_string(
            root.path().join("mh/.mh_sequences"),
        )
        .unwrap();
        assert!(sidecar.contains("unseen: 1"));
    }
}
