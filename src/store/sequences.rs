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

//! The MH sequence table and the `.mh_sequences` sidecar codec.
//!
//! An MH folder keeps its per-message flags in a line-oriented sidecar:
//!
//! ```text
//! unseen: 3 7-9 12
//! flagged: 5
//! cur: 7
//! ```
//!
//! Only the three configured sequence names are interpreted; everything
//! else (`cur` above) is carried through a rewrite byte-for-byte. Rewrites
//! stage a sibling temp file and rename it over the original so concurrent
//! readers see either the old or the new contents, never a mixture.

use std::fs;
use std::io::{BufRead, BufReader};
use std::path::{Path, PathBuf};

use bitflags::bitflags;
use log::warn;

use crate::store::message;
use crate::store::model::Mailbox;
use crate::support::config::StoreConfig;
use crate::support::error::Error;

bitflags! {
    /// Flags representable in an MH sequence file.
    #[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
    pub struct SeqFlag: u8 {
        const UNSEEN = 1 << 0;
        const REPLIED = 1 << 1;
        const FLAGGED = 1 << 2;
    }
}

/// Growth increment for the backing store.
const ALLOC_BLOCK: usize = 128;

/// A growable table of [`SeqFlag`]s indexed by MH message number.
///
/// The table is dense; its size is bounded by the largest message number in
/// the folder and it is never compacted. Out-of-range reads yield the empty
/// flag set.
#[derive(Clone, Debug, Default)]
pub struct SequenceSet {
    flags: Vec<SeqFlag>,
}

impl SequenceSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Return the flags for message number `i`.
    pub fn get(&self, i: usize) -> SeqFlag {
        self.flags.get(i).copied().unwrap_or_default()
    }

    /// Add `f` to the flags for message number `i`, growing the table as
    /// needed, and return the resulting flag set.
    pub fn set(&mut self, i: usize, f: SeqFlag) -> SeqFlag {
        if i >= self.flags.len() {
            self.flags.resize(i + ALLOC_BLOCK, SeqFlag::empty());
        }
        self.flags[i] |= f;
        self.flags[i]
    }

    /// The largest addressable message number.
    pub fn max(&self) -> usize {
        self.flags.len().saturating_sub(1)
    }

    pub fn clear_all(&mut self) {
        self.flags.clear();
    }

    /// Whether `f` is set anywhere in the table.
    pub fn any(&self, f: SeqFlag) -> bool {
        self.flags.iter().any(|&slot| slot.intersects(f))
    }
}

/// Path of the sequence sidecar under `root`.
pub fn sequences_path(root: &Path) -> PathBuf {
    root.join(".mh_sequences")
}

fn seq_flag_for(config: &StoreConfig, name: &str) -> Option<SeqFlag> {
    if name == config.seq_unseen {
        Some(SeqFlag::UNSEEN)
    } else if name == config.seq_flagged {
        Some(SeqFlag::FLAGGED)
    } else if name == config.seq_replied {
        Some(SeqFlag::REPLIED)
    } else {
        None
    }
}

/// Parse one `N` or `N-M` range token.
fn read_token(token: &str) -> Result<(usize, usize), Error> {
    let parse = |s: &str| {
        s.parse::<usize>()
            .map_err(|_| Error::BadSequenceFile(token.to_owned()))
    };

    match token.split_once('-') {
        Some((first, last)) => Ok((parse(first)?, parse(last)?)),
        None => {
            let n = parse(token)?;
            Ok((n, n))
        },
    }
}

/// Read the sequence sidecar under `root` into a fresh table.
///
/// A missing sidecar is not an error; it reads as an empty table. A
/// malformed range aborts the whole load.
pub fn read_sequences(
    root: &Path,
    config: &StoreConfig,
) -> Result<SequenceSet, Error> {
    let mut set = SequenceSet::new();

    let file = match fs::File::open(sequences_path(root)) {
        Ok(f) => f,
        Err(_) => return Ok(set),
    };

    for line in BufReader::new(file).split(b'\n') {
        let line = line?;
        let line = String::from_utf8_lossy(&line);
        let mut tokens =
            line.split(|c| ' ' == c || '\t' == c || ':' == c)
                .filter(|t| !t.is_empty());

        let flag = match tokens.next().and_then(|n| seq_flag_for(config, n)) {
            Some(f) => f,
            // unknown sequence
            None => continue,
        };

        for token in tokens {
            let (first, last) = read_token(token)?;
            for i in first..=last {
                set.set(i, flag);
            }
        }
    }

    Ok(set)
}

/// Append the ranges of `flag` in `set` to `out` as `NAME: N N-M ...`.
fn write_one_sequence(
    out: &mut String,
    set: &SequenceSet,
    flag: SeqFlag,
    name: &str,
) {
    out.push_str(name);
    out.push(':');

    let mut first: Option<usize> = None;
    let mut last: Option<usize> = None;

    fn flush(out: &mut String, first: usize, last: Option<usize>) {
        match last {
            None => out.push_str(&format!(" {}", first)),
            Some(last) => out.push_str(&format!(" {}-{}", first, last)),
        }
    }

    for i in 0..=set.max() {
        if set.get(i).intersects(flag) {
            if first.is_none() {
                first = Some(i);
            } else {
                last = Some(i);
            }
        } else if let Some(f) = first.take() {
            flush(out, f, last.take());
        }
    }

    if let Some(f) = first {
        flush(out, f, last);
    }

    out.push('\n');
}

/// Lines whose first token is one of the configured sequence names are
/// ours to rewrite; everything else must survive verbatim.
fn is_known_prefix(line: &str, config: &StoreConfig) -> bool {
    [&config.seq_unseen, &config.seq_flagged, &config.seq_replied]
        .iter()
        .any(|name| {
            line.strip_prefix(name.as_str())
                .map_or(false, |rest| rest.starts_with(':'))
        })
}

/// Rewrite the sequence sidecar from `set`, preserving unknown sequences.
///
/// Sequences with no member are omitted entirely. The new contents are
/// staged in a temp file created with the folder's umask and renamed over
/// the sidecar; a failed rename removes the temp and leaves the old file
/// intact.
pub fn write_sequences(
    mailbox: &Mailbox,
    set: &SequenceSet,
    config: &StoreConfig,
) -> Result<(), Error> {
    let mut out = String::new();

    // first, copy unknown sequences
    if let Ok(old) = fs::File::open(sequences_path(&mailbox.path)) {
        for line in BufReader::new(old).split(b'\n') {
            let line = line?;
            let line = String::from_utf8_lossy(&line);
            if !is_known_prefix(&line, config) {
                out.push_str(&line);
                out.push('\n');
            }
        }
    }

    for (flag, name) in [
        (SeqFlag::UNSEEN, &config.seq_unseen),
        (SeqFlag::FLAGGED, &config.seq_flagged),
        (SeqFlag::REPLIED, &config.seq_replied),
    ] {
        if set.any(flag) {
            write_one_sequence(&mut out, set, flag, name);
        }
    }

    commit_sequences(mailbox, out.as_bytes())
}

/// Fast path used when committing a single new message: append ` <n>` to
/// each requested sequence's existing line, or emit a fresh line for a
/// requested sequence that has none.
pub fn add_one(
    mailbox: &Mailbox,
    n: usize,
    unseen: bool,
    flagged: bool,
    replied: bool,
    config: &StoreConfig,
) -> Result<(), Error> {
    let mut todo = [
        (unseen, &config.seq_unseen),
        (flagged, &config.seq_flagged),
        (replied, &config.seq_replied),
    ];

    let mut out = String::new();

    if let Ok(old) = fs::File::open(sequences_path(&mailbox.path)) {
        for line in BufReader::new(old).split(b'\n') {
            let line = line?;
            let line = String::from_utf8_lossy(&line);
            let mut appended = false;

            for (wanted, name) in todo.iter_mut() {
                let matches = line
                    .strip_prefix(name.as_str())
                    .map_or(false, |rest| rest.starts_with(':'));
                if *wanted && matches {
                    out.push_str(&format!("{} {}\n", line, n));
                    *wanted = false;
                    appended = true;
                    break;
                }
            }

            if !appended {
                out.push_str(&line);
                out.push('\n');
            }
        }
    }

    for (wanted, name) in todo {
        if wanted {
            out.push_str(&format!("{}: {}\n", name, n));
        }
    }

    commit_sequences(mailbox, out.as_bytes())
}

/// Stage `data` in a temp file inside the folder and rename it over the
/// sidecar.
fn commit_sequences(mailbox: &Mailbox, data: &[u8]) -> Result<(), Error> {
    let (file, tmp_path) = message::folder_tempfile(mailbox)?;
    {
        use std::io::Write;
        let mut file = file;
        file.write_all(data)?;
        file.sync_all()?;
    }

    let target = sequences_path(&mailbox.path);
    if let Err(e) = fs::rename(&tmp_path, &target) {
        warn!(
            "unable to rename {} over {}: {}",
            tmp_path.display(),
            target.display(),
            e
        );
        let _ = fs::remove_file(&tmp_path);
        return Err(e.into());
    }

    Ok(())
}
