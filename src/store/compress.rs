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

//! Transparent access to compressed (or otherwise encoded) containers.
//!
//! A compressed folder is described by up to three command templates:
//! `open` (container to plaintext), `close` (plaintext back to container),
//! and `append`. `%f` expands to the shell-quoted container path and `%t`
//! to the plaintext working path. The wrapper stages the container through
//! a private working copy, delegates every message operation to the engine
//! of whatever format the plaintext probes as, and recompresses on sync
//! and close. The container itself is serialised between processes with an
//! advisory fcntl lock.
//!
//! `mailbox.path` is the plaintext working copy; `mailbox.realpath` is the
//! container.

use std::fs::{self, File, OpenOptions};
use std::io;
use std::os::unix::fs::OpenOptionsExt;
use std::os::unix::io::{AsRawFd, RawFd};
use std::path::Path;

use log::{debug, error, info, warn};
use rand::{rngs::OsRng, Rng};

use crate::store::model::{CheckOutcome, Mailbox, StoreContext};
use crate::store::paths;
use crate::store::MailboxOps;
use crate::support::error::Error;
use crate::support::file_ops;
use crate::support::hostname::SHORT_HOSTNAME;

/// Seam through which the wrapper's command templates are executed.
pub trait ShellRunner: Sync {
    /// Run `cmd` through the shell and return its exit status.
    fn run(&self, cmd: &str) -> i32;
}

/// Default [`ShellRunner`]: `sh -c`.
pub struct SystemShell;

impl ShellRunner for SystemShell {
    fn run(&self, cmd: &str) -> i32 {
        std::process::Command::new("/bin/sh")
            .arg("-c")
            .arg(cmd)
            .status()
            .ok()
            .and_then(|status| status.code())
            .unwrap_or(-1)
    }
}

/// A valid template references both the container and the working copy.
pub fn valid_template(cmd: &str) -> bool {
    cmd.contains("%f") && cmd.contains("%t")
}

/// The command templates attached to a compressed folder.
#[derive(Clone, Debug)]
pub struct CompressHooks {
    pub(crate) open: String,
    pub(crate) close: Option<String>,
    pub(crate) append: Option<String>,
}

impl CompressHooks {
    /// Validate and bundle the templates. `open` is compulsory; reading
    /// needs nothing else, appending needs `append` or `close`, syncing
    /// needs `close`.
    pub fn new(
        open: impl Into<String>,
        close: Option<String>,
        append: Option<String>,
    ) -> Result<Self, Error> {
        let open = open.into();
        for cmd in [Some(&open), close.as_ref(), append.as_ref()]
            .into_iter()
            .flatten()
        {
            if !valid_template(cmd) {
                return Err(Error::BadCommandTemplate(cmd.clone()));
            }
        }
        Ok(CompressHooks {
            open,
            close,
            append,
        })
    }

    /// Whether these hooks permit appending.
    pub fn can_append(&self) -> bool {
        self.append.is_some() || self.close.is_some()
    }
}

/// Wrapper state attached to the mailbox.
pub(crate) struct CompressState {
    pub(crate) hooks: CompressHooks,
    /// Size of the container at the last (de)compression, for cheap
    /// change detection.
    pub(crate) size: u64,
    lock: Option<File>,
    locked: bool,
    /// Engine of the plaintext's actual format, once probed.
    pub(crate) child: Option<&'static dyn MailboxOps>,
}

impl CompressState {
    pub(crate) fn new(hooks: CompressHooks) -> Self {
        CompressState {
            hooks,
            size: 0,
            lock: None,
            locked: false,
            child: None,
        }
    }
}

/// Escape a path for interpolation between single quotes: `'` becomes
/// `'\''`.
fn escape_path(path: &Path) -> String {
    path.to_string_lossy().replace('\'', "'\\''")
}

/// Expand `%f`/`%t` placeholders in a command template.
fn expand_template(template: &str, mailbox: &Mailbox) -> String {
    template
        .replace("%f", &escape_path(&mailbox.realpath))
        .replace("%t", &escape_path(&mailbox.path))
}

/// Run one expanded hook; a non-zero exit is fatal for the enclosing
/// operation.
fn execute(
    mailbox: &Mailbox,
    ctx: &StoreContext,
    template: &str,
) -> Result<(), Error> {
    let cmd = expand_template(template, mailbox);
    info!("running \"{}\"", cmd);

    let status = ctx.shell.run(&cmd);
    if 0 != status {
        error!("error running \"{}\": status {}", cmd, status);
        return Err(Error::CommandFailed(status));
    }
    Ok(())
}

fn lock_fd(fd: RawFd, excl: bool) -> nix::Result<()> {
    let lock_type =
        if excl { nix::libc::F_WRLCK } else { nix::libc::F_RDLCK };

    let mut fl: nix::libc::flock = unsafe { std::mem::zeroed() };
    fl.l_type = lock_type as _;
    fl.l_whence = nix::libc::SEEK_SET as _;
    nix::fcntl::fcntl(fd, nix::fcntl::FcntlArg::F_SETLK(&fl)).map(|_| ())
}

fn unlock_fd(fd: RawFd) {
    let mut fl: nix::libc::flock = unsafe { std::mem::zeroed() };
    fl.l_type = nix::libc::F_UNLCK as _;
    fl.l_whence = nix::libc::SEEK_SET as _;
    let _ = nix::fcntl::fcntl(fd, nix::fcntl::FcntlArg::F_SETLK(&fl));
}

/// Take the advisory lock on the container.
///
/// Returns whether this call acquired the lock (false when it was already
/// held, so nested operations do not release their caller's lock). A
/// failed exclusive request downgrades the mailbox to read-only instead of
/// failing; a failed shared request is an error.
fn lock_realpath(mailbox: &mut Mailbox, excl: bool) -> Result<bool, Error> {
    if mailbox.compress.as_ref().map_or(false, |s| s.locked) {
        return Ok(false);
    }

    let opened = if excl {
        OpenOptions::new()
            .append(true)
            .create(true)
            .mode(0o600)
            .open(&mailbox.realpath)
    } else {
        File::open(&mailbox.realpath)
    };
    let file = opened?;

    match lock_fd(file.as_raw_fd(), excl) {
        Ok(()) => {
            let state =
                mailbox.compress.as_mut().expect("compress state");
            state.lock = Some(file);
            state.locked = true;
            Ok(true)
        },
        Err(_) if excl => {
            warn!(
                "unable to lock {} exclusively, downgrading to read-only",
                mailbox.realpath.display()
            );
            mailbox.readonly = true;
            Ok(true)
        },
        Err(_) => Err(Error::LockFailed),
    }
}

fn unlock_realpath(mailbox: &mut Mailbox) {
    if let Some(state) = mailbox.compress.as_mut() {
        if state.locked {
            if let Some(file) = state.lock.take() {
                unlock_fd(file.as_raw_fd());
            }
            state.locked = false;
        }
    }
}

fn store_size(mailbox: &mut Mailbox) {
    let size = file_ops::file_size(&mailbox.realpath);
    if let Some(state) = mailbox.compress.as_mut() {
        state.size = size;
    }
}

/// Allocate the private plaintext working copy and swap it in as
/// `mailbox.path`.
///
/// The file is created empty with mode 0600 before any hook runs, so a
/// symlink planted at a predictable name cannot redirect the
/// decompression.
fn setup_paths(mailbox: &mut Mailbox) -> Result<(), Error> {
    let tmpdir = std::env::temp_dir();
    loop {
        let path = tmpdir.join(format!(
            "mailfold-{}-{}-{}",
            *SHORT_HOSTNAME,
            std::process::id(),
            OsRng.gen::<u64>()
        ));
        match OpenOptions::new()
            .write(true)
            .create_new(true)
            .mode(0o600)
            .open(&path)
        {
            Ok(_) => {
                mailbox.path = path;
                return Ok(());
            },
            Err(e) if io::ErrorKind::AlreadyExists == e.kind() => continue,
            Err(e) => return Err(e.into()),
        }
    }
}

/// Remove the plaintext working copy, whatever shape the open hook gave
/// it.
fn remove_working(mailbox: &Mailbox) {
    let path = &mailbox.path;
    if path.is_dir() {
        let _ = fs::remove_dir_all(path);
    } else {
        let _ = fs::remove_file(path);
    }
}

pub(crate) fn child_ops(
    mailbox: &Mailbox,
) -> Result<&'static dyn MailboxOps, Error> {
    mailbox
        .compress
        .as_ref()
        .and_then(|s| s.child)
        .ok_or(Error::UnknownMailboxFormat)
}

fn is_writable(path: &Path) -> bool {
    nix::unistd::access(path, nix::unistd::AccessFlags::W_OK).is_ok()
}

/// Open a compressed folder for reading: decompress into the working copy
/// under a shared lock, probe what came out, and let that format's engine
/// take over.
pub(crate) fn comp_open(
    mailbox: &mut Mailbox,
    ctx: &StoreContext,
) -> Result<(), Error> {
    let state =
        mailbox.compress.as_ref().ok_or(Error::UnknownMailboxFormat)?;
    let open_cmd = state.hooks.open.clone();

    // Without a close hook there is no way to write changes back
    if state.hooks.close.is_none() || !is_writable(&mailbox.realpath) {
        mailbox.readonly = true;
    }

    setup_paths(mailbox)?;
    store_size(mailbox);

    let result = (|| {
        let we_locked = lock_realpath(mailbox, false)?;
        let run = execute(mailbox, ctx, &open_cmd);
        if we_locked {
            unlock_realpath(mailbox);
        }
        run?;

        let kind = paths::probe_plain(&mailbox.path)
            .ok_or(Error::UnknownMailboxFormat)?;
        debug!(
            "{} decompressed to a {:?} folder",
            mailbox.realpath.display(),
            kind
        );

        let child = crate::store::ops_for(kind);
        mailbox.kind = kind;
        mailbox
            .compress
            .as_mut()
            .expect("compress state")
            .child = Some(child);

        child.mbox_open(mailbox, ctx)
    })();

    if result.is_err() {
        // remove the partial plaintext
        remove_working(mailbox);
    }
    result
}

/// Open a compressed folder for appending. The exclusive lock taken here
/// is held until `mbox_close`.
pub(crate) fn comp_open_append(
    mailbox: &mut Mailbox,
    create: bool,
    ctx: &StoreContext,
) -> Result<(), Error> {
    let state =
        mailbox.compress.as_ref().ok_or(Error::UnknownMailboxFormat)?;
    if !state.hooks.can_append() {
        error!(
            "cannot append to {} without an append or close command",
            mailbox.realpath.display()
        );
        return Err(Error::MailboxReadOnly);
    }
    let open_cmd = state.hooks.open.clone();
    let has_append = state.hooks.append.is_some();

    mailbox.append = true;
    setup_paths(mailbox)?;
    lock_realpath(mailbox, true)?;

    let result = (|| {
        // Open the existing container, unless the append hook lets us skip
        // the round trip (or there is nothing to decompress yet).
        let kind = if !has_append
            && file_ops::file_size(&mailbox.realpath) > 0
        {
            execute(mailbox, ctx, &open_cmd)?;
            paths::probe_plain(&mailbox.path)
                .ok_or(Error::UnknownMailboxFormat)?
        } else {
            // A fresh plaintext folder of the configured format
            let _ = fs::remove_file(&mailbox.path);
            ctx.config.compress_append_kind
        };

        let child = crate::store::ops_for(kind);
        mailbox.kind = kind;
        mailbox
            .compress
            .as_mut()
            .expect("compress state")
            .child = Some(child);

        let fresh = !mailbox.path.exists();
        child.mbox_open_append(mailbox, create || fresh, ctx)
    })();

    if result.is_err() {
        remove_working(mailbox);
        unlock_realpath(mailbox);
    }
    result
}

/// Cheap change detection: if the container's size moved, re-run the open
/// hook and delegate a real check against the fresh plaintext.
pub(crate) fn comp_check(
    mailbox: &mut Mailbox,
    ctx: &StoreContext,
    index_hint: Option<&mut usize>,
) -> Result<CheckOutcome, Error> {
    let state =
        mailbox.compress.as_ref().ok_or(Error::UnknownMailboxFormat)?;
    let open_cmd = state.hooks.open.clone();

    if file_ops::file_size(&mailbox.realpath) == state.size {
        return Ok(CheckOutcome::Unchanged);
    }

    let we_locked = lock_realpath(mailbox, false)?;
    let run = execute(mailbox, ctx, &open_cmd);
    store_size(mailbox);
    if we_locked {
        unlock_realpath(mailbox);
    }
    run?;

    child_ops(mailbox)?.mbox_check(mailbox, ctx, index_hint)
}

/// Sync: changes so far only touched the working copy; commit them there,
/// then recompress, all under the exclusive lock.
pub(crate) fn comp_sync(
    mailbox: &mut Mailbox,
    ctx: &StoreContext,
    mut index_hint: Option<&mut usize>,
) -> Result<CheckOutcome, Error> {
    let state =
        mailbox.compress.as_ref().ok_or(Error::UnknownMailboxFormat)?;
    let close_cmd = match state.hooks.close.clone() {
        Some(cmd) => cmd,
        None => {
            error!(
                "cannot sync {} without a close command",
                mailbox.realpath.display()
            );
            return Err(Error::MailboxReadOnly);
        },
    };

    let we_locked = lock_realpath(mailbox, true)?;

    let result = (|| {
        let pending =
            comp_check(mailbox, ctx, index_hint.as_deref_mut())?;
        if CheckOutcome::Unchanged != pending {
            return Ok(pending);
        }

        let outcome = child_ops(mailbox)?.mbox_sync(
            mailbox,
            ctx,
            index_hint.as_deref_mut(),
        )?;
        if CheckOutcome::Unchanged != outcome {
            return Ok(outcome);
        }

        execute(mailbox, ctx, &close_cmd)?;
        Ok(CheckOutcome::Unchanged)
    })();

    store_size(mailbox);
    if we_locked {
        unlock_realpath(mailbox);
    }
    result
}

/// Close the folder. In append mode the container is rebuilt through the
/// append hook (or the close hook when no dedicated append hook exists);
/// otherwise sync has already recompressed and only the working copy needs
/// to be cleaned up.
pub(crate) fn comp_close(
    mailbox: &mut Mailbox,
    ctx: &StoreContext,
) -> Result<(), Error> {
    let state = match mailbox.compress.as_ref() {
        Some(state) => state,
        None => return Ok(()),
    };
    let append_cmd = state.hooks.append.clone();
    let close_cmd = state.hooks.close.clone();

    if let Some(child) = mailbox.compress.as_ref().and_then(|s| s.child) {
        child.mbox_close(mailbox, ctx)?;
    }

    if !mailbox.append {
        if !mailbox.path.exists() && !ctx.config.save_empty {
            // the working copy was removed, so retire the container too
            let _ = fs::remove_file(&mailbox.realpath);
        } else {
            remove_working(mailbox);
        }
        unlock_realpath(mailbox);
        return Ok(());
    }

    let cmd = if mailbox.realpath.exists() && append_cmd.is_some() {
        append_cmd
    } else {
        close_cmd
    };

    let result = match cmd {
        Some(cmd) => execute(mailbox, ctx, &cmd),
        None => Err(Error::MailboxReadOnly),
    };

    match result {
        Ok(()) => {
            remove_working(mailbox);
            store_size(mailbox);
            unlock_realpath(mailbox);
            Ok(())
        },
        Err(e) => {
            // leave the plaintext in place so the user can recover
            error!(
                "error compressing; preserving temporary file {}",
                mailbox.path.display()
            );
            unlock_realpath(mailbox);
            Err(e)
        },
    }
}

#[cfg(test)]
mod test {
    use std::fs;
    use std::time::{Duration, SystemTime};

    use tempfile::TempDir;

    use super::*;
    use crate::store::model::{Flag, MailboxKind};
    use crate::support::config::StoreConfig;

    const OPEN_TAR: &str =
        "rm -rf '%t' && mkdir -p '%t' && tar -xzf '%f' -C '%t'";
    const CLOSE_TAR: &str = "tar -czf '%f' -C '%t' .";

    struct Setup {
        _root: TempDir,
        container: std::path::PathBuf,
        config: StoreConfig,
    }

    /// Build an MH folder, then pack it into a tar.gz container.
    fn set_up() -> Setup {
        let root = TempDir::new().unwrap();
        let src = root.path().join("src");
        fs::create_dir(&src).unwrap();
        for name in ["1", "2"] {
            fs::write(
                src.join(name),
                format!("Message-ID: <{}@t>\nSubject: s\n\nbody\n", name),
            )
            .unwrap();
        }
        fs::write(src.join(".mh_sequences"), "unseen: 1-2\n").unwrap();

        let container = root.path().join("folder.tar.gz");
        let status = std::process::Command::new("/bin/sh")
            .arg("-c")
            .arg(format!(
                "tar -czf '{}' -C '{}' .",
                container.display(),
                src.display()
            ))
            .status()
            .unwrap();
        assert!(status.success());

        Setup {
            _root: root,
            container,
            config: StoreConfig::default(),
        }
    }

    fn hooks() -> CompressHooks {
        CompressHooks::new(OPEN_TAR, Some(CLOSE_TAR.to_owned()), None)
            .unwrap()
    }

    #[test]
    fn template_validation() {
        assert!(valid_template("gzip -cd '%f' > '%t'"));
        assert!(!valid_template("gzip -cd '%f'"));
        assert!(!valid_template("cat"));

        assert_matches!(
            Err(Error::BadCommandTemplate(..)),
            CompressHooks::new("cat", None, None)
        );
        assert_matches!(
            Err(Error::BadCommandTemplate(..)),
            CompressHooks::new(
                "gzip -cd '%f' > '%t'",
                Some("true".to_owned()),
                None
            )
        );
    }

    #[test]
    fn quotes_are_escaped() {
        let mut mailbox = Mailbox::compressed("/mail/it's.gz", hooks());
        mailbox.realpath = "/mail/it's.gz".into();
        mailbox.path = "/tmp/work".into();
        assert_eq!(
            "ls '/mail/it'\\''s.gz' '/tmp/work'",
            expand_template("ls '%f' '%t'", &mailbox)
        );
    }

    #[test]
    fn open_probes_and_loads_the_plaintext() {
        let setup = set_up();
        let mut mailbox =
            Mailbox::compressed(&setup.container, hooks());
        let ctx = StoreContext::new(&setup.config);

        comp_open(&mut mailbox, &ctx).unwrap();
        assert_eq!(MailboxKind::Mh, mailbox.kind);
        assert_eq!(2, mailbox.msg_count);
        assert_eq!(2, mailbox.msg_unread);
        assert_ne!(mailbox.path, mailbox.realpath);
        assert!(
            mailbox.compress.as_ref().unwrap().size > 0,
            "container size recorded"
        );

        comp_close(&mut mailbox, &ctx).unwrap();
        assert!(!mailbox.path.exists(), "working copy cleaned up");
        assert!(setup.container.exists());
    }

    #[test]
    fn open_failure_removes_working_copy() {
        let setup = set_up();
        let bad = CompressHooks::new(
            "test -f '%f' && false && cat '%t'",
            None,
            None,
        )
        .unwrap();
        let mut mailbox = Mailbox::compressed(&setup.container, bad);
        let ctx = StoreContext::new(&setup.config);

        assert_matches!(
            Err(Error::CommandFailed(..)),
            comp_open(&mut mailbox, &ctx)
        );
        assert!(!mailbox.path.exists());
    }

    #[test]
    fn sync_recompresses_and_reopen_sees_the_change() {
        let setup = set_up();
        let mut mailbox =
            Mailbox::compressed(&setup.container, hooks());
        let ctx = StoreContext::new(&setup.config);
        comp_open(&mut mailbox, &ctx).unwrap();

        let before = fs::metadata(&setup.container).unwrap();
        let before_mtime = before.modified().unwrap();
        let before_size = before.len();
        // make sure the recompressed mtime can visibly advance
        let t = nix::sys::time::TimeVal::new(1500000000, 0);
        nix::sys::stat::utimes(setup.container.as_path(), &t, &t)
            .unwrap();
        let _ = before_mtime;

        mailbox.set_flag(0, Flag::Read, true);
        assert_eq!(
            CheckOutcome::Unchanged,
            comp_sync(&mut mailbox, &ctx, None).unwrap()
        );

        let after = fs::metadata(&setup.container).unwrap();
        assert!(
            after.modified().unwrap()
                > SystemTime::UNIX_EPOCH + Duration::from_secs(1500000000),
            "container was rewritten"
        );
        assert_ne!(before_size, after.len());
        comp_close(&mut mailbox, &ctx).unwrap();

        // a fresh open must see the new flag state
        let mut reopened =
            Mailbox::compressed(&setup.container, hooks());
        comp_open(&mut reopened, &ctx).unwrap();
        assert_eq!(1, reopened.msg_unread);
        assert!(reopened
            .emails
            .iter()
            .find(|e| "1" == e.path)
            .unwrap()
            .read);
        comp_close(&mut reopened, &ctx).unwrap();
    }

    #[test]
    fn check_detects_container_growth() {
        let setup = set_up();
        let mut mailbox =
            Mailbox::compressed(&setup.container, hooks());
        let ctx = StoreContext::new(&setup.config);
        comp_open(&mut mailbox, &ctx).unwrap();

        assert_eq!(
            CheckOutcome::Unchanged,
            comp_check(&mut mailbox, &ctx, None).unwrap()
        );

        // an external writer replaces the container with a bigger one
        let extra = mailbox.path.join("3");
        fs::write(&extra, "Message-ID: <3@t>\nSubject: s\n\nmore body\n")
            .unwrap();
        let status = std::process::Command::new("/bin/sh")
            .arg("-c")
            .arg(format!(
                "tar -czf '{}' -C '{}' .",
                setup.container.display(),
                mailbox.path.display()
            ))
            .status()
            .unwrap();
        assert!(status.success());
        fs::remove_file(&extra).unwrap();
        // rewind so the rescan sees the new file
        let past = SystemTime::UNIX_EPOCH + Duration::from_secs(1);
        mailbox.mtime = Some(past);
        mailbox.dir_state.mtime_cur = Some(past);

        assert_eq!(
            CheckOutcome::NewMail,
            comp_check(&mut mailbox, &ctx, None).unwrap()
        );
        assert_eq!(3, mailbox.msg_count);
        comp_close(&mut mailbox, &ctx).unwrap();
    }

    #[test]
    fn missing_close_hook_forces_readonly() {
        let setup = set_up();
        let read_only =
            CompressHooks::new(OPEN_TAR, None, None).unwrap();
        let mut mailbox =
            Mailbox::compressed(&setup.container, read_only);
        let ctx = StoreContext::new(&setup.config);

        comp_open(&mut mailbox, &ctx).unwrap();
        assert!(mailbox.readonly);
        assert_matches!(
            Err(Error::MailboxReadOnly),
            comp_sync(&mut mailbox, &ctx, None)
        );
        comp_close(&mut mailbox, &ctx).unwrap();
    }
}
