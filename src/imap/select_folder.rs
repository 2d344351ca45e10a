//! # IMAP folder selection module.

use super::session::Session;
use crate::context::Context;

type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("got a NO response when trying to select {0}, usually this means that it doesn't exist: {1}")]
    NoFolder(String, String),

    #[error("IMAP other error: {0}")]
    Other(String),
}

/// Remote folder coordinates observed in a SELECT dialogue.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct SelectInfo {
    pub uid_validity: u32,
    pub uid_next: u32,
    pub exists: u32,
    pub highest_modseq: Option<u64>,
}

impl Session {
    /// Selects a folder and returns its coordinates.
    ///
    /// Uses `SELECT (CONDSTORE)` where the server supports it so that the
    /// response carries HIGHESTMODSEQ. If the SELECT response lacks UIDNEXT,
    /// falls back to a STATUS command; a few servers omit it despite
    /// RFC 3501 requiring it.
    pub(crate) async fn select_folder(
        &mut self,
        context: &Context,
        folder: &str,
    ) -> Result<SelectInfo> {
        let res = if self.can_condstore() {
            self.inner.select_condstore(folder).await
        } else {
            self.inner.select(folder).await
        };

        // <https://tools.ietf.org/html/rfc3501#section-6.3.1>
        // says that if the server reports select failure we are in
        // authenticated (not-select) state.
        let mailbox = match res {
            Ok(mailbox) => mailbox,
            Err(async_imap::error::Error::No(response)) => {
                self.selected_folder = None;
                self.selected_mailbox = None;
                return Err(Error::NoFolder(folder.to_string(), response));
            }
            Err(err) => {
                self.selected_folder = None;
                self.selected_mailbox = None;
                return Err(Error::Other(err.to_string()));
            }
        };

        let uid_validity = match mailbox.uid_validity {
            Some(v) => v,
            None => {
                return Err(Error::Other(format!(
                    "no UIDVALIDITY for folder {folder:?}"
                )))
            }
        };

        let uid_next = if let Some(uid_next) = mailbox.uid_next {
            uid_next
        } else {
            warn!(
                context,
                "SELECT response for IMAP folder {folder:?} has no UIDNEXT, fall back to STATUS command."
            );
            let status = self
                .inner
                .status(folder, "(UIDNEXT)")
                .await
                .map_err(|err| Error::Other(err.to_string()))?;
            match status.uid_next {
                Some(uid_next) => uid_next,
                None => {
                    return Err(Error::Other(format!(
                        "cannot determine UIDNEXT for folder {folder:?}"
                    )))
                }
            }
        };

        let info = SelectInfo {
            uid_validity,
            uid_next,
            exists: mailbox.exists,
            highest_modseq: mailbox.highest_modseq,
        };
        self.selected_folder = Some(folder.to_string());
        self.selected_mailbox = Some(mailbox);
        Ok(info)
    }
}
