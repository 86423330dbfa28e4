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

//! Mailfold is a storage engine for local mail folders in the maildir and
//! MH formats, plus transparent access to compressed containers holding
//! either.
//!
//! The engine deliberately stops at the storage boundary: it scans,
//! reconciles, and rewrites folders crash-safely, while header parsing,
//! threading, display, and configuration sourcing are seams the host
//! application plugs into (see [`store::StoreContext`]).

#[cfg(test)]
macro_rules! assert_matches {
    ($expected:pat, $actual:expr) => {
        match $actual {
            $expected => (),
            unexpected => panic!(
                "Expected {} matches {}, got {:?}",
                stringify!($expected),
                stringify!($actual),
                unexpected
            ),
        }
    };
}

pub mod store;
pub mod support;
