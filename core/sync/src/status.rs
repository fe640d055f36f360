//! Interpretation of remote response statuses.

use strata_storage::Status;

use crate::events::FailureKind;

/// What a response status means for the synchronizer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Interpretation {
    pub status_code: Option<u16>,
    /// The server gave a usable answer (2xx, 304, 404, 412).
    pub successful: bool,
    /// 412: the precondition revision no longer matches.
    pub conflict: bool,
    pub un_auth: bool,
    pub not_found: bool,
    /// Anything but 304.
    pub changed: bool,
    /// The request never got an answer.
    pub network_problems: bool,
    pub timed_out: bool,
}

impl Interpretation {
    /// Failure category for responses that are not successful.
    pub fn failure_kind(&self) -> Option<FailureKind> {
        if self.successful {
            None
        } else if self.timed_out {
            Some(FailureKind::Timeout)
        } else if self.network_problems {
            Some(FailureKind::Network)
        } else if self.un_auth {
            Some(FailureKind::Unauthorized)
        } else {
            Some(FailureKind::Http(self.status_code.unwrap_or_default()))
        }
    }
}

/// Classify a response status.
///
/// A 401 is not an authorization failure when the transport implies
/// authorization.
pub fn interpret_status(status: Status, implied_auth: bool) -> Interpretation {
    let code = match status {
        Status::Offline | Status::Timeout => {
            return Interpretation {
                network_problems: true,
                timed_out: matches!(status, Status::Timeout),
                ..Interpretation::default()
            };
        }
        Status::Http(code) => code,
    };

    let series = code / 100;
    Interpretation {
        status_code: Some(code),
        successful: series == 2 || code == 304 || code == 412 || code == 404,
        conflict: code == 412,
        un_auth: (code == 401 && !implied_auth) || code == 402 || code == 403,
        not_found: code == 404,
        changed: code != 304,
        network_problems: false,
        timed_out: false,
    }
}
