/// # Transaction Identification
///
/// RFC 3261 Sections 17.1.3 and 17.2.3 match messages to transactions by the
/// branch parameter of the topmost Via plus the method. The method matters on
/// both sides: a CANCEL reuses the branch of the INVITE it cancels but is a
/// separate transaction, while an ACK for a non-2xx final response belongs to
/// the INVITE server transaction it acknowledges.
///
/// Requests from RFC 2543 implementations carry no magic-cookie branch. They
/// get a derived key built from Call-ID, From tag, CSeq number and sent-by,
/// which is stable across retransmissions of the same request.
use std::fmt;

use sipstack_sip_core::{HeaderAccess, Method, Request, Response};

use crate::errors::Result;

/// Prefix of derived branches for requests without an RFC 3261 branch.
const LEGACY_BRANCH_PREFIX: &str = "legacy;";

/// Uniquely identifies a SIP transaction within one provider.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct TransactionKey {
    pub branch: String,
    /// Method of the request that created the transaction
    pub method: Method,
    pub is_server: bool,
}

impl TransactionKey {
    pub fn new(branch: impl Into<String>, method: Method, is_server: bool) -> Self {
        Self {
            branch: branch.into(),
            method,
            is_server,
        }
    }

    /// Key of the transaction a request belongs to.
    ///
    /// ACK is mapped to INVITE so it reaches the INVITE server transaction
    /// whose non-2xx response it acknowledges.
    pub fn from_request(request: &Request, is_server: bool) -> Result<Self> {
        let via = request.top_via()?;
        let method = match request.method {
            Method::Ack => Method::Invite,
            ref other => other.clone(),
        };

        let branch = if via.has_rfc3261_branch() {
            via.branch().unwrap_or_default().to_string()
        } else {
            let cseq = request.cseq()?;
            format!(
                "{}{}|{}|{}|{}",
                LEGACY_BRANCH_PREFIX,
                request.call_id().unwrap_or_default(),
                request.from_tag().unwrap_or_default(),
                cseq.seq,
                via.sent_by()
            )
        };

        Ok(Self::new(branch, method, is_server))
    }

    /// Key of the client transaction a response belongs to. The method is
    /// taken from CSeq.
    pub fn from_response(response: &Response) -> Result<Self> {
        let via = response.top_via()?;
        let cseq = response.cseq()?;
        Ok(Self::new(
            via.branch().unwrap_or_default(),
            cseq.method,
            false,
        ))
    }

    /// Same branch and side with a different method (INVITE key for a CANCEL).
    pub fn with_method(&self, method: Method) -> Self {
        Self::new(self.branch.clone(), method, self.is_server)
    }

    pub fn is_legacy(&self) -> bool {
        self.branch.starts_with(LEGACY_BRANCH_PREFIX)
    }
}

impl fmt::Display for TransactionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let side = if self.is_server { "server" } else { "client" };
        write!(f, "{}:{}:{}", self.branch, self.method, side)
    }
}
