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

//! Encoding and decoding of maildir flag suffixes.
//!
//! A message in `cur/` is named `<uniq>:2,<flags>`. `<uniq>` never changes
//! for the lifetime of the message; every flag change is a rename that
//! replaces the suffix. Letters we do not interpret are preserved in
//! `Email::maildir_flags` and re-emitted, sorted, on encode.

use crate::store::model::Email;

/// Reset the flag bits on `email` and re-derive them from the maildir
/// filename `name`.
///
/// With `flag_safe` enabled, a `T` on a flagged message is ignored so that
/// flagging a message protects it from an external trash pass.
pub fn parse_flags(email: &mut Email, name: &str, flag_safe: bool) {
    email.flagged = false;
    email.read = false;
    email.replied = false;

    let mut preserved = String::new();

    if let Some(suffix) =
        name.rfind(':').map(|ix| &name[ix + 1..])
    {
        if let Some(flags) = suffix.strip_prefix("2,") {
            for c in flags.chars() {
                match c {
                    'F' => email.flagged = true,
                    'R' => email.replied = true,
                    'S' => email.read = true,
                    'T' => {
                        if !email.flagged || !flag_safe {
                            email.trash = true;
                            email.deleted = true;
                        }
                    },
                    c => preserved.push(c),
                }
            }
        }
    }

    email.maildir_flags =
        if preserved.is_empty() { None } else { Some(preserved) };
}

/// Generate the `:2,<flags>` suffix encoding the state of `email`.
///
/// Returns the empty string when no flag, no preserved letter, and no `old`
/// bit forces a suffix. Preserved letters are merged in and the whole flag
/// string is kept in ASCII order.
pub fn flag_suffix(email: &Email) -> String {
    let preserved = email.maildir_flags.as_deref().unwrap_or("");

    if !email.flagged
        && !email.replied
        && !email.read
        && !email.deleted
        && !email.old
        && preserved.is_empty()
    {
        return String::new();
    }

    let mut flags = String::new();
    if email.flagged {
        flags.push('F');
    }
    if email.replied {
        flags.push('R');
    }
    if email.read {
        flags.push('S');
    }
    if email.deleted {
        flags.push('T');
    }
    flags.push_str(preserved);

    if !preserved.is_empty() {
        let mut bytes: Vec<u8> = flags.into_bytes();
        bytes.sort_unstable();
        flags = String::from_utf8(bytes)
            .expect("sorting ASCII flags broke UTF-8");
    }

    format!(":2,{}", flags)
}

/// Canonical identity of a maildir message: the basename with everything
/// from the last `:` onward removed. Two filenames differing only in flags
/// canonicalise to the same key.
pub fn canon_name(path: &str) -> &str {
    let base = path
        .rsplit_once('/')
        .map(|(_, base)| base)
        .unwrap_or(path);
    base.rfind(':').map(|ix| &base[..ix]).unwrap_or(base)
}

#[cfg(test)]
mod test {
    use super::*;

    fn decode(name: &str) -> Email {
        let mut email = Email::new();
        parse_flags(&mut email, name, false);
        email
    }

    #[test]
    fn parse_plain_flags() {
        let email = decode("1500000000.R1.host:2,FS");
        assert!(email.flagged);
        assert!(email.read);
        assert!(!email.replied);
        assert!(!email.deleted);
        assert_eq!(None, email.maildir_flags);
    }

    #[test]
    fn parse_trash_implies_deleted() {
        let email = decode("u:2,ST");
        assert!(email.deleted);
        assert!(email.trash);
    }

    #[test]
    fn flag_safe_shields_flagged_messages() {
        let mut email = Email::new();
        parse_flags(&mut email, "u:2,FT", true);
        assert!(email.flagged);
        assert!(!email.deleted);

        // Without flag_safe the T wins
        let mut email = Email::new();
        parse_flags(&mut email, "u:2,FT", false);
        assert!(email.deleted);
    }

    #[test]
    fn unknown_letters_are_preserved() {
        let email = decode("u:2,SXa");
        assert!(email.read);
        assert_eq!(Some("Xa".to_owned()), email.maildir_flags);
    }

    #[test]
    fn no_suffix_means_no_flags() {
        let email = decode("1500000000.R1.host");
        assert!(!email.read && !email.flagged && !email.replied);
        assert_eq!(None, email.maildir_flags);
    }

    #[test]
    fn encode_sorts_with_preserved_letters() {
        let mut email = Email::new();
        email.flagged = true;
        email.read = true;
        email.maildir_flags = Some("X".to_owned());
        assert_eq!(":2,FSX", flag_suffix(&email));

        let mut email = Email::new();
        email.read = true;
        email.maildir_flags = Some("A".to_owned());
        assert_eq!(":2,AS", flag_suffix(&email));
    }

    #[test]
    fn encode_empty_when_nothing_set() {
        let email = Email::new();
        assert_eq!("", flag_suffix(&email));

        let mut email = Email::new();
        email.old = true;
        // old has no letter but still forces the suffix so the file lands
        // in cur/ with a well-formed name
        assert_eq!(":2,", flag_suffix(&email));
    }

    #[test]
    fn round_trip_all_flag_combinations() {
        for bits in 0..16u32 {
            for preserved in [None, Some("ab".to_owned())] {
                let mut email = Email::new();
                email.flagged = 0 != bits & 1;
                email.replied = 0 != bits & 2;
                email.read = 0 != bits & 4;
                email.deleted = 0 != bits & 8;
                email.maildir_flags = preserved.clone();

                let name = format!("uniq{}", flag_suffix(&email));
                let mut reread = Email::new();
                parse_flags(&mut reread, &name, false);

                assert_eq!(email.flagged, reread.flagged, "bits {}", bits);
                assert_eq!(email.replied, reread.replied, "bits {}", bits);
                assert_eq!(email.read, reread.read, "bits {}", bits);
                assert_eq!(email.deleted, reread.deleted, "bits {}", bits);
                assert_eq!(preserved, reread.maildir_flags, "bits {}", bits);
            }
        }
    }

    #[test]
    fn canonical_name_strips_flags_and_directory() {
        assert_eq!("u1", canon_name("cur/u1:2,S"));
        assert_eq!("u1", canon_name("new/u1"));
        assert_eq!("u1", canon_name("u1:2,FRS"));
        assert_eq!("u1", canon_name("u1"));
        assert_eq!(
            canon_name("cur/u1:2,S"),
            canon_name("new/u1:2,FST")
        );
    }
}
