//! Core error kinds
//!
//! Mirrors the policy table of the runtime's error design: most kinds are handled
//! internally (logged and swallowed) and never reach a caller. The variants here
//! exist for the handful of places that *do* propagate outward — construction and
//! `Listener::activate`.

use std::{fmt, io};

/// Errors that can propagate out of the public API.
///
/// Everything else (transient accept errors, rejected connections, deserialize
/// failures, handler panics, pool overflow) is handled at the point it occurs and
/// never surfaces as a `CoreError` — see each component's module docs.
#[derive(Debug)]
pub enum CoreError {
    /// The listener could not bind its socket during `activate`.
    Bind(io::Error),
    /// `activate` was called with an invalid configuration (e.g. `max_parallel == 0`).
    InvalidConfig(&'static str),
    /// A required collaborator (catalog, protocol, handler table) was never supplied.
    MissingCollaborator(&'static str),
    /// The buffer pool's memory budget was exceeded and no fallback was available.
    BudgetExceeded,
}

impl fmt::Display for CoreError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Bind(err) => write!(f, "failed to bind listener socket: {err}"),
            Self::InvalidConfig(msg) => write!(f, "invalid configuration: {msg}"),
            Self::MissingCollaborator(name) => {
                write!(f, "missing required collaborator: {name}")
            }
            Self::BudgetExceeded => write!(f, "buffer pool memory budget exceeded"),
        }
    }
}

impl std::error::Error for CoreError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Bind(err) => Some(err),
            _ => None,
        }
    }
}

impl From<io::Error> for CoreError {
    fn from(err: io::Error) -> Self {
        Self::Bind(err)
    }
}

pub(crate) type CoreResult<T> = Result<T, CoreError>;
