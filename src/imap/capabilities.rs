//! # IMAP capabilities
//!
//! IMAP server capabilities are determined with a `CAPABILITY` command after
//! login; callers gate feature use on them.

#[derive(Debug, Clone, Default)]
pub(crate) struct Capabilities {
    /// True if the server has IDLE capability as defined in
    /// <https://tools.ietf.org/html/rfc2177>
    pub can_idle: bool,

    /// True if the server has CONDSTORE capability as defined in
    /// <https://tools.ietf.org/html/rfc7162>
    pub can_condstore: bool,

    /// True if the server has MOVE capability as defined in
    /// <https://tools.ietf.org/html/rfc6851>
    pub can_move: bool,

    /// True if the server has UIDPLUS capability as defined in
    /// <https://tools.ietf.org/html/rfc4315>
    pub can_uidplus: bool,
}
