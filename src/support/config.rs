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

use serde::{Deserialize, Serialize};

/// Settings governing how folders are scanned, checked, and written back.
///
/// The host application constructs this once from its own configuration
/// machinery and passes it down the call tree; nothing in the engine reads
/// process-global state.
#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct StoreConfig {
    /// Check for new mail while a mailbox is open.
    #[serde(default = "default_true")]
    pub check_new: bool,
    /// In maildir folders, mark deleted messages with the `T` flag instead
    /// of unlinking them on sync.
    #[serde(default)]
    pub maildir_trash: bool,
    /// Really delete files in MH mailboxes instead of renaming them to a
    /// `,`-prefixed tombstone.
    #[serde(default)]
    pub mh_purge: bool,
    /// Compare file modification times against header-cache timestamps
    /// before trusting a cached entry.
    #[serde(default = "default_true")]
    pub header_cache_verify: bool,
    /// Never trash a message that is both flagged and marked `T` on disk.
    #[serde(default)]
    pub flag_safe: bool,
    /// Treat messages found in `cur/` as old.
    #[serde(default = "default_true")]
    pub mark_old: bool,
    /// Keep MH folders sorted in their natural (numeric) order.
    #[serde(default = "default_true")]
    pub sort_natural: bool,
    /// Keep the compressed container around even when the working copy has
    /// been emptied out.
    #[serde(default = "default_true")]
    pub save_empty: bool,
    /// Only report new mail if the folder changed since it was last visited.
    #[serde(default = "default_true")]
    pub mail_check_recent: bool,
    /// Format assumed for a compressed container that is appended to
    /// without ever being decompressed.
    #[serde(default = "default_append_kind")]
    pub compress_append_kind: crate::store::model::MailboxKind,
    /// Name of the MH sequence holding unseen messages.
    #[serde(default = "default_seq_unseen")]
    pub seq_unseen: String,
    /// Name of the MH sequence holding flagged messages.
    #[serde(default = "default_seq_flagged")]
    pub seq_flagged: String,
    /// Name of the MH sequence holding replied-to messages.
    #[serde(default = "default_seq_replied")]
    pub seq_replied: String,
}

impl Default for StoreConfig {
    fn default() -> Self {
        StoreConfig {
            check_new: true,
            maildir_trash: false,
            mh_purge: false,
            header_cache_verify: true,
            flag_safe: false,
            mark_old: true,
            sort_natural: true,
            save_empty: true,
            mail_check_recent: true,
            compress_append_kind: default_append_kind(),
            seq_unseen: default_seq_unseen(),
            seq_flagged: default_seq_flagged(),
            seq_replied: default_seq_replied(),
        }
    }
}

fn default_true() -> bool {
    true
}

fn default_append_kind() -> crate::store::model::MailboxKind {
    crate::store::model::MailboxKind::Mh
}

fn default_seq_unseen() -> String {
    "unseen".to_owned()
}

fn default_seq_flagged() -> String {
    "flagged".to_owned()
}

fn default_seq_replied() -> String {
    "replied".to_owned()
}
