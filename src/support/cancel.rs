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

//! Cooperative cancellation for long-running folder operations.
//!
//! A `CancelToken` is cloned into directory scans and the delayed parsing
//! pass, both of which poll it at loop boundaries. A sync in progress never
//! observes the token; interrupting a half-done rewrite would leave the
//! folder inconsistent.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use crate::support::error::Error;

/// A shared flag requesting that in-progress scans stop early.
#[derive(Clone, Debug, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    /// Request cancellation. All clones of this token observe the request.
    pub fn cancel(&self) {
        self.0.store(true, Ordering::Relaxed);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::Relaxed)
    }

    /// Return `Err(Error::Aborted)` if cancellation has been requested.
    pub fn check(&self) -> Result<(), Error> {
        if self.is_cancelled() {
            Err(Error::Aborted)
        } else {
            Ok(())
        }
    }

    /// Clear a previously observed cancellation request so the token can be
    /// reused for the next operation.
    pub fn reset(&self) {
        self.0.store(false, Ordering::Relaxed);
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn shared_between_clones() {
        let a = CancelToken::new();
        let b = a.clone();

        assert!(a.check().is_ok());
        b.cancel();
        assert!(a.is_cancelled());
        assert_matches!(Err(Error::Aborted), a.check());

        a.reset();
        assert!(b.check().is_ok());
    }
}
