//! Filesystem manipulation operations.
//!
//! This module contains additional operations which are not present in
//! `std::fs` and `std::os::$platform`.

use std::io;
use std::path::Path;

use nix::unistd;

use crate::error::SvnOperatorError;

/// User identifier
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct Uid(unistd::Uid);

impl Uid {
    /// Gets a Uid by user name.
    ///
    /// If no user with the given `user_name` exists then `Ok(None)` is returned.
    pub fn from_name(user_name: &str) -> Result<Option<Uid>, SvnOperatorError> {
        unistd::User::from_name(user_name)
            .map(|maybe_user| maybe_user.map(|user| Uid(user.uid)))
            .map_err(|err| {
                io::Error::new(
                    io::ErrorKind::Other,
                    format!("Could not retrieve user [{}]. {}", user_name, err),
                )
                .into()
            })
    }

    /// Looks up the user or fails if there is no such user.
    pub fn require(user_name: &str) -> Result<Uid, SvnOperatorError> {
        Uid::from_name(user_name)?.ok_or_else(|| SvnOperatorError::UnknownUser {
            name: user_name.to_string(),
        })
    }

    pub fn current() -> Uid {
        Uid(unistd::Uid::current())
    }
}

/// Returns true if anything exists at `path`, following symlinks.
pub fn exists(path: &Path) -> bool {
    path.metadata().is_ok()
}

/// Changes the ownership of the file or directory at `path` to be owned by the
/// given `uid`.
pub fn change_owner(path: &Path, uid: &Uid) -> Result<(), SvnOperatorError> {
    unistd::chown(path, Some(uid.0), None).map_err(|err| {
        io::Error::new(
            io::ErrorKind::Other,
            format!("Could not change owner of [{}]. {}", path.display(), err),
        )
        .into()
    })
}

/// Changes the ownership of the file or directory at `path` recursively to be
/// owned by the given `uid`.
pub fn change_owner_recursively(root_path: &Path, uid: &Uid) -> Result<(), SvnOperatorError> {
    visit_recursively(root_path, &|path| change_owner(path, uid))
}

/// Calls the function `cb` on the given `path` and its contents recursively.
fn visit_recursively<F>(path: &Path, cb: &F) -> Result<(), SvnOperatorError>
where
    F: Fn(&Path) -> Result<(), SvnOperatorError>,
{
    cb(path)?;
    if path.is_dir() {
        for entry in path.read_dir()? {
            visit_recursively(entry?.path().as_path(), cb)?;
        }
    }
    Ok(())
}
