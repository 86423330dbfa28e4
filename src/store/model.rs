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

//! Core data types shared by every folder format.
//!
//! The `Email` here is deliberately thin: it carries the flag bits and the
//! content geometry the storage engine needs to rewrite files, not a parsed
//! message. Full header/MIME interpretation belongs to the host application
//! and reaches the engine only through the [`HeaderParser`] seam.

use std::fs::File;
use std::io::{BufRead, BufReader, Read, Seek, SeekFrom};
use std::path::PathBuf;
use std::time::SystemTime;

use serde::{Deserialize, Serialize};

use crate::store::compress::{CompressState, ShellRunner, SystemShell};
use crate::store::hcache::HeaderCacheStore;
use crate::support::cancel::CancelToken;
use crate::support::config::StoreConfig;
use crate::support::error::Error;

/// The folder formats this engine understands.
#[derive(
    Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize,
)]
pub enum MailboxKind {
    /// qmail-style folder: `tmp/`, `new/`, `cur/`, flags in filenames.
    Maildir,
    /// MH-style folder: numbered files plus a `.mh_sequences` sidecar.
    Mh,
    /// A compressed container staged through a plaintext working copy of
    /// one of the other formats.
    Compressed,
}

/// Byte geometry of a message on disk.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Content {
    /// Offset of the start of the headers.
    pub hdr_offset: u64,
    /// Offset of the start of the body.
    pub offset: u64,
    /// Length of the body.
    pub length: u64,
}

/// One message as the storage engine sees it.
///
/// Fields marked `#[serde(skip)]` are session state and are never persisted
/// into the header cache.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct Email {
    /// Path of the message file relative to the mailbox root, e.g.
    /// `cur/1500000000.R42.host:2,S` or `17`.
    pub path: String,
    pub read: bool,
    pub flagged: bool,
    pub replied: bool,
    pub deleted: bool,
    pub old: bool,
    /// Whether the on-disk file currently carries the `T` flag. `deleted`
    /// records the user's intent; `trash` records what the last scan or
    /// sync saw on disk.
    pub trash: bool,
    /// Maildir flag letters we do not interpret, preserved across renames.
    pub maildir_flags: Option<String>,
    pub content: Content,
    /// Unix time the message was received, falling back to the sent date.
    pub received: i64,
    pub date_sent: i64,
    /// Number of lines in the body.
    pub lines: usize,
    pub message_id: Option<String>,
    pub subject: Option<String>,
    #[serde(skip)]
    pub changed: bool,
    #[serde(skip)]
    pub active: bool,
    #[serde(skip)]
    pub attach_del: bool,
    #[serde(skip)]
    pub xlabel_changed: bool,
    #[serde(skip)]
    pub refs_changed: bool,
    #[serde(skip)]
    pub irt_changed: bool,
    #[serde(skip)]
    pub index: usize,
}

impl Email {
    pub fn new() -> Self {
        Email {
            active: true,
            ..Email::default()
        }
    }

    /// The final path component of `path`.
    pub fn basename(&self) -> &str {
        self.path
            .rsplit_once('/')
            .map(|(_, base)| base)
            .unwrap_or(&self.path)
    }

    /// Parse the basename as an MH message number. Tombstoned (`,`-prefixed)
    /// and non-numeric names yield `None`.
    pub fn mh_number(&self) -> Option<usize> {
        self.basename().parse().ok()
    }

    /// Whether this message needs a full rewrite (not just a rename) on
    /// sync.
    pub fn needs_rewrite(&self) -> bool {
        self.attach_del
            || self.xlabel_changed
            || self.refs_changed
            || self.irt_changed
    }

    /// Strict identity comparison used when reconciling MH folders, where
    /// a message number can be silently reused by another writer.
    pub fn cmp_strict(&self, other: &Email) -> bool {
        self.message_id == other.message_id
            && self.subject == other.subject
            && self.received == other.received
            && self.content.length == other.content.length
    }
}

/// A message flag addressable through [`Mailbox::set_flag`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Flag {
    Read,
    Flagged,
    Replied,
    Old,
    Deleted,
}

/// Result of an incremental folder check.
///
/// The variants are ordered by reporting precedence; when several conditions
/// hold at once, the largest wins.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub enum CheckOutcome {
    Unchanged,
    FlagsChanged,
    NewMail,
    /// Messages vanished from the folder; the in-memory view was compacted.
    Reopened,
}

/// Per-format private state for directory-backed folders.
#[derive(Clone, Debug, Default)]
pub(crate) struct DirState {
    /// For maildir, the mtime of `cur/` at the last scan; for MH, the mtime
    /// of `.mh_sequences`.
    pub(crate) mtime_cur: Option<SystemTime>,
    /// Permission mask cached from the mailbox directory's mode.
    pub(crate) mh_umask: Option<u32>,
}

/// An open mail folder.
pub struct Mailbox {
    /// Directory (or, while a compressed folder is open, the plaintext
    /// working copy) holding the messages.
    pub path: PathBuf,
    /// The on-disk location after symlink resolution; for compressed
    /// folders, the container itself.
    pub realpath: PathBuf,
    pub kind: MailboxKind,
    pub readonly: bool,
    /// Whether this mailbox was opened for appending.
    pub append: bool,
    /// Whether any message carries unsynced changes.
    pub changed: bool,
    /// mtime of the primary watched node (`new/` for maildir, the root
    /// directory for MH) at the last scan.
    pub mtime: Option<SystemTime>,
    pub last_visited: Option<SystemTime>,
    pub emails: Vec<Email>,
    pub msg_count: usize,
    pub msg_unread: usize,
    pub msg_flagged: usize,
    pub msg_deleted: usize,
    pub has_new: bool,
    pub notified: bool,
    /// Total byte size of the loaded messages.
    pub size: u64,
    /// Set by the host when the pending check was triggered by a filesystem
    /// monitor event; suppresses the mtime update so a concurrent write
    /// cannot slip between the event and the scan.
    pub monitor_event: bool,
    pub(crate) dir_state: DirState,
    pub(crate) compress: Option<CompressState>,
}

impl Mailbox {
    /// Open a handle on a directory-backed folder of the given format.
    ///
    /// No I/O beyond symlink resolution happens here; the folder is read by
    /// `mbox_open`.
    pub fn new(path: impl Into<PathBuf>, kind: MailboxKind) -> Self {
        let path = path.into();
        let realpath =
            std::fs::canonicalize(&path).unwrap_or_else(|_| path.clone());
        Mailbox {
            path,
            realpath,
            kind,
            readonly: false,
            append: false,
            changed: false,
            mtime: None,
            last_visited: None,
            emails: Vec::new(),
            msg_count: 0,
            msg_unread: 0,
            msg_flagged: 0,
            msg_deleted: 0,
            has_new: false,
            notified: false,
            size: 0,
            monitor_event: false,
            dir_state: DirState::default(),
            compress: None,
        }
    }

    /// Open a handle on a compressed container. `hooks` supplies the
    /// open/close/append command templates; the plaintext working copy is
    /// allocated by `mbox_open`.
    pub fn compressed(
        path: impl Into<PathBuf>,
        hooks: crate::store::compress::CompressHooks,
    ) -> Self {
        let mut mbx = Mailbox::new(path, MailboxKind::Compressed);
        mbx.compress = Some(CompressState::new(hooks));
        mbx
    }

    /// The absolute path of a message stored at `rel`.
    pub fn full_path(&self, rel: &str) -> PathBuf {
        self.path.join(rel)
    }

    /// Set one flag on one message, keeping the folder tallies and change
    /// bits consistent.
    pub fn set_flag(&mut self, msgno: usize, flag: Flag, value: bool) {
        let email = &mut self.emails[msgno];
        let changed = match flag {
            Flag::Read => {
                if email.read != value {
                    if value {
                        self.msg_unread -= 1;
                    } else {
                        self.msg_unread += 1;
                    }
                    email.read = value;
                    true
                } else {
                    false
                }
            },
            Flag::Flagged => {
                if email.flagged != value {
                    if value {
                        self.msg_flagged += 1;
                    } else {
                        self.msg_flagged -= 1;
                    }
                    email.flagged = value;
                    true
                } else {
                    false
                }
            },
            Flag::Replied => {
                if email.replied != value {
                    email.replied = value;
                    true
                } else {
                    false
                }
            },
            Flag::Old => {
                if email.old != value {
                    email.old = value;
                    true
                } else {
                    false
                }
            },
            Flag::Deleted => {
                if email.deleted != value {
                    if value {
                        self.msg_deleted += 1;
                    } else {
                        self.msg_deleted -= 1;
                    }
                    email.deleted = value;
                    true
                } else {
                    false
                }
            },
        };

        if changed {
            self.emails[msgno].changed = true;
            self.changed = true;
        }
    }

    /// Recompute every tally from the email array.
    pub(crate) fn recount(&mut self) {
        self.msg_count = self.emails.len();
        self.msg_unread = self.emails.iter().filter(|e| !e.read).count();
        self.msg_flagged = self.emails.iter().filter(|e| e.flagged).count();
        self.msg_deleted = self.emails.iter().filter(|e| e.deleted).count();
        self.size = self
            .emails
            .iter()
            .map(|e| e.content.length + e.content.offset - e.content.hdr_offset)
            .sum();
    }

    /// Compact the email array after messages vanished: restore natural
    /// order, renumber the survivors, drop the rest, and invalidate any
    /// thread state the host holds.
    ///
    /// `index_hint`, if supplied, is remapped from an old index to the
    /// corresponding new one.
    pub(crate) fn update_tables(
        &mut self,
        hooks: &dyn StoreHooks,
        mut index_hint: Option<&mut usize>,
    ) {
        self.emails.sort_by_key(|e| e.index);

        let mut next = 0;
        for email in &mut self.emails {
            if email.active {
                if let Some(hint) = index_hint.as_deref_mut() {
                    if *hint == email.index {
                        *hint = next;
                    }
                }
                email.index = next;
                next += 1;
            }
        }

        self.emails.retain(|e| e.active);
        self.recount();

        hooks.tables_updated(self);
        hooks.threads_cleared(self);
    }
}

/// A message file opened for reading or staged for writing.
pub struct Message {
    pub file: Option<File>,
    /// Absolute path of the open or staged file.
    pub path: PathBuf,
    /// Absolute path the message was committed to, once `msg_commit`
    /// succeeds.
    pub committed_path: Option<PathBuf>,
    pub read: bool,
    pub flagged: bool,
    pub replied: bool,
    /// If set, applied to the committed file's timestamps.
    pub received: Option<i64>,
}

impl Message {
    pub(crate) fn staged(file: File, path: PathBuf) -> Self {
        Message {
            file: Some(file),
            path,
            committed_path: None,
            read: false,
            flagged: false,
            replied: false,
            received: None,
        }
    }
}

/// Seam through which message contents are interpreted.
///
/// The engine hands over an open file positioned at the start and expects
/// `email.content` and the envelope identity fields to be filled in.
pub trait HeaderParser: Sync {
    fn parse_headers(
        &self,
        file: &mut File,
        email: &mut Email,
    ) -> Result<(), Error>;
}

/// Seam through which rewrite-on-sync re-emits a message.
///
/// Implementations must write the complete updated message to `dst` and
/// refresh `email.content` to describe what was written.
pub trait MessageCopier: Sync {
    fn copy_message(
        &self,
        dst: &mut File,
        mailbox: &Mailbox,
        email: &mut Email,
    ) -> Result<(), Error>;
}

/// Notifications the host can use to keep derived state (index display,
/// threading) in step with the engine. All methods default to no-ops.
pub trait StoreHooks: Sync {
    /// Flags on `msgno` were merged from on-disk state.
    fn flags_merged(&self, _mailbox: &Mailbox, _msgno: usize) {}
    /// The email array was compacted and renumbered.
    fn tables_updated(&self, _mailbox: &Mailbox) {}
    /// Thread state derived from the email array is no longer valid.
    fn threads_cleared(&self, _mailbox: &Mailbox) {}
}

/// Default no-op [`StoreHooks`].
pub struct NoHooks;

impl StoreHooks for NoHooks {}

/// Minimal built-in [`HeaderParser`]: locates the header/body boundary and
/// lifts out the envelope identity headers. Hosts with a real RFC 822
/// parser will substitute their own.
pub struct PlainParser;

impl HeaderParser for PlainParser {
    fn parse_headers(
        &self,
        file: &mut File,
        email: &mut Email,
    ) -> Result<(), Error> {
        file.seek(SeekFrom::Start(0))?;
        let mut reader = BufReader::new(file);
        let mut line = Vec::new();
        let mut offset = 0u64;

        loop {
            line.clear();
            let n = reader.read_until(b'\n', &mut line)?;
            if 0 == n {
                break;
            }
            offset += n as u64;

            let text = String::from_utf8_lossy(&line);
            let text = text.trim_end_matches(['\r', '\n']);
            if text.is_empty() {
                break;
            }

            if let Some((name, value)) = text.split_once(':') {
                let value = value.trim();
                if name.eq_ignore_ascii_case("message-id") {
                    email.message_id = Some(value.to_owned());
                } else if name.eq_ignore_ascii_case("subject") {
                    email.subject = Some(value.to_owned());
                } else if name.eq_ignore_ascii_case("date") {
                    if let Ok(date) =
                        chrono::DateTime::parse_from_rfc2822(value)
                    {
                        email.date_sent = date.timestamp();
                    }
                }
            }
        }

        email.content.hdr_offset = 0;
        email.content.offset = offset;

        let mut lines = 0;
        loop {
            line.clear();
            let n = reader.read_until(b'\n', &mut line)?;
            if 0 == n {
                break;
            }
            lines += 1;
        }
        email.lines = lines;

        Ok(())
    }
}

/// Default [`MessageCopier`]: re-emits the stored bytes unmodified and
/// refreshes the content geometry from what was written.
pub struct RawCopier;

impl MessageCopier for RawCopier {
    fn copy_message(
        &self,
        dst: &mut File,
        mailbox: &Mailbox,
        email: &mut Email,
    ) -> Result<(), Error> {
        let mut src = File::open(mailbox.full_path(&email.path))?;
        let mut buf = Vec::new();
        src.read_to_end(&mut buf)?;
        std::io::Write::write_all(dst, &buf)?;

        let total = buf.len() as u64;
        email.content.hdr_offset = 0;
        email.content.offset = email.content.offset.min(total);
        email.content.length = total - email.content.offset;
        Ok(())
    }
}

static PLAIN_PARSER: PlainParser = PlainParser;
static RAW_COPIER: RawCopier = RawCopier;
static NO_HOOKS: NoHooks = NoHooks;
static SYSTEM_SHELL: SystemShell = SystemShell;

/// Everything an operation needs besides the mailbox itself: settings and
/// the collaborator seams.
pub struct StoreContext<'a> {
    pub config: &'a StoreConfig,
    pub parser: &'a dyn HeaderParser,
    pub copier: &'a dyn MessageCopier,
    pub hooks: &'a dyn StoreHooks,
    pub hcache: Option<&'a dyn HeaderCacheStore>,
    pub shell: &'a dyn ShellRunner,
    pub cancel: CancelToken,
}

impl<'a> StoreContext<'a> {
    /// A context using the built-in collaborators and no header cache.
    pub fn new(config: &'a StoreConfig) -> Self {
        StoreContext {
            config,
            parser: &PLAIN_PARSER,
            copier: &RAW_COPIER,
            hooks: &NO_HOOKS,
            hcache: None,
            shell: &SYSTEM_SHELL,
            cancel: CancelToken::new(),
        }
    }

    pub fn with_parser(mut self, parser: &'a dyn HeaderParser) -> Self {
        self.parser = parser;
        self
    }

    pub fn with_copier(mut self, copier: &'a dyn MessageCopier) -> Self {
        self.copier = copier;
        self
    }

    pub fn with_hooks(mut self, hooks: &'a dyn StoreHooks) -> Self {
        self.hooks = hooks;
        self
    }

    pub fn with_hcache(mut self, hcache: &'a dyn HeaderCacheStore) -> Self {
        self.hcache = Some(hcache);
        self
    }

    pub fn with_shell(mut self, shell: &'a dyn ShellRunner) -> Self {
        self.shell = shell;
        self
    }

    pub fn with_cancel(mut self, cancel: CancelToken) -> Self {
        self.cancel = cancel;
        self
    }
}
