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

use std::io;

use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("Mailbox read-only")]
    MailboxReadOnly,
    #[error("Mailbox already exists")]
    MailboxExists,
    #[error("No such mailbox")]
    NxMailbox,
    #[error("Non-existent message")]
    NxMessage,
    #[error("Unable to identify the mailbox format")]
    UnknownMailboxFormat,
    #[error("Gave up atomic insertion after too many retries")]
    GaveUpInsertion,
    #[error("Malformed sequence file: {0}")]
    BadSequenceFile(String),
    #[error("Invalid command template: {0}")]
    BadCommandTemplate(String),
    #[error("Command exited with status {0}")]
    CommandFailed(i32),
    #[error("Unable to lock mailbox")]
    LockFailed,
    #[error("Rename would cross filesystems")]
    RenameAcrossFilesystems,
    #[error("Operation aborted")]
    Aborted,
    #[error(transparent)]
    Io(#[from] io::Error),
    #[error(transparent)]
    Nix(#[from] nix::Error),
    #[error(transparent)]
    Cbor(#[from] serde_cbor::error::Error),
}
