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

use lazy_static::lazy_static;

lazy_static! {
    /// The unqualified name of this host, sanitised for use inside maildir
    /// unique filenames. `/` and `:` are reserved by the naming scheme and
    /// are replaced following the usual maildir convention.
    pub static ref SHORT_HOSTNAME: String = short_hostname();
}

fn short_hostname() -> String {
    let name = nix::unistd::gethostname()
        .ok()
        .and_then(|h| h.into_string().ok())
        .unwrap_or_default();
    let short: String = name
        .split('.')
        .next()
        .unwrap_or("")
        .chars()
        .map(|c| match c {
            '/' => '\\',
            ':' => '_',
            c => c,
        })
        .collect();

    if short.is_empty() {
        "localhost".to_owned()
    } else {
        short
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn hostname_is_usable_in_filenames() {
        assert!(!SHORT_HOSTNAME.is_empty());
        assert!(!SHORT_HOSTNAME.contains('/'));
        assert!(!SHORT_HOSTNAME.contains(':'));
        assert!(!SHORT_HOSTNAME.contains('.'));
    }
}
