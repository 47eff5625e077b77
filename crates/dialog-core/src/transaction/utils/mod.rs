//! Request and response helpers shared by the transaction, dialog and
//! provider layers.

use std::io;
use std::net::{IpAddr, SocketAddr};
use std::time::Duration;

use sipstack_sip_core::builder::{generate_tag, ResponseBuilder};
use sipstack_sip_core::{
    CSeq, HeaderAccess, HeaderName, Method, Request, Response, StatusCode, Uri,
};
use sipstack_sip_transport::Error as TransportError;

use crate::errors::{Error, Result};

/// Builds the ACK a client INVITE transaction sends for a 300-699 response
/// (RFC 3261 Section 17.1.1.3). Request-URI, Call-ID, From, the top Via and
/// Route come from the INVITE; To comes from the response.
pub fn create_ack_for_failure(invite: &Request, response: &Response) -> Result<Request> {
    let mut ack = Request::new(Method::Ack, invite.uri.clone());
    let via = invite.top_via()?;
    ack.headers.push(HeaderName::Via, via.to_string());
    if let Some(max_forwards) = invite.max_forwards() {
        ack.headers.push(HeaderName::MaxForwards, max_forwards.to_string());
    }
    copy_header(invite, &mut ack, HeaderName::From)?;
    copy_header(response, &mut ack, HeaderName::To)?;
    copy_header(invite, &mut ack, HeaderName::CallId)?;
    let cseq = invite.cseq()?;
    ack.headers
        .push(HeaderName::CSeq, CSeq::new(cseq.seq, Method::Ack).to_string());
    for route in invite.headers.get_all(&HeaderName::Route) {
        ack.headers.push(HeaderName::Route, route);
    }
    Ok(ack)
}

/// Builds a CANCEL for an INVITE (RFC 3261 Section 9.1): same Request-URI,
/// Call-ID, From, To, top Via and Route; CSeq number of the INVITE.
pub fn create_cancel(invite: &Request) -> Result<Request> {
    let mut cancel = Request::new(Method::Cancel, invite.uri.clone());
    let via = invite.top_via()?;
    cancel.headers.push(HeaderName::Via, via.to_string());
    if let Some(max_forwards) = invite.max_forwards() {
        cancel
            .headers
            .push(HeaderName::MaxForwards, max_forwards.to_string());
    }
    copy_header(invite, &mut cancel, HeaderName::From)?;
    copy_header(invite, &mut cancel, HeaderName::To)?;
    copy_header(invite, &mut cancel, HeaderName::CallId)?;
    let cseq = invite.cseq()?;
    cancel
        .headers
        .push(HeaderName::CSeq, CSeq::new(cseq.seq, Method::Cancel).to_string());
    for route in invite.headers.get_all(&HeaderName::Route) {
        cancel.headers.push(HeaderName::Route, route);
    }
    Ok(cancel)
}

fn copy_header(from: &impl HeaderAccess, to: &mut Request, name: HeaderName) -> Result<()> {
    let value = from
        .header(&name)
        .ok_or_else(|| sipstack_sip_core::Error::MissingHeader(name.to_string()))?
        .to_string();
    to.headers.push(name, value);
    Ok(())
}

/// Response sent without a transaction (481, 482, 500 from the dispatcher).
/// A To tag is added when the request has none.
pub fn create_stateless_response(request: &Request, status: StatusCode) -> Response {
    ResponseBuilder::from_request(request, status)
        .to_tag(&generate_tag())
        .build()
}

/// Records where a request really came from in its top Via (RFC 3261
/// Section 18.2.1 `received`, RFC 3581 `rport`).
pub fn apply_via_fixups(request: &mut Request, source: SocketAddr) -> Result<()> {
    let mut via = request.top_via()?;
    let source_ip = source.ip().to_string();
    let rport_requested = via.rport().is_some();

    if via.host.trim_start_matches('[').trim_end_matches(']') != source_ip || rport_requested {
        via.set_received(source_ip);
    }
    if rport_requested {
        via.set_rport(Some(source.port()));
    }
    request.set_top_via(&via);
    Ok(())
}

/// Next hop for a request: the first Route when it is a loose router,
/// otherwise the Request-URI (RFC 3261 Section 8.1.2).
pub async fn resolve_request_destination(request: &Request) -> Result<SocketAddr> {
    let routes = request.routes()?;
    match routes.first() {
        Some(route) if route.uri.is_loose_route() => resolve_uri(&route.uri).await,
        _ => resolve_uri(&request.uri).await,
    }
}

/// Where a response goes: `received`/`rport` of the top Via when present,
/// otherwise its sent-by (RFC 3261 Section 18.2.2).
pub async fn resolve_response_destination(response: &Response) -> Result<SocketAddr> {
    let via = response.top_via()?;
    let host = via.received().unwrap_or(&via.host).to_string();
    let port = via.rport().flatten().or(via.port).unwrap_or(5060);
    resolve_host(host.trim_start_matches('[').trim_end_matches(']'), port).await
}

pub async fn resolve_uri(uri: &Uri) -> Result<SocketAddr> {
    resolve_host(uri.host_unbracketed(), uri.port_or_default()).await
}

/// Longest a host name lookup may take before the send fails.
pub const RESOLVE_TIMEOUT: Duration = Duration::from_secs(5);

pub async fn resolve_host(host: &str, port: u16) -> Result<SocketAddr> {
    if let Ok(ip) = host.parse::<IpAddr>() {
        return Ok(SocketAddr::new(ip, port));
    }

    let mut addresses = tokio::time::timeout(RESOLVE_TIMEOUT, tokio::net::lookup_host((host, port)))
        .await
        .map_err(|_| Error::Timeout(format!("resolving {}", host)))?
        .map_err(TransportError::from)?;
    addresses.next().ok_or_else(|| {
        Error::Transport(TransportError::Io(io::Error::new(
            io::ErrorKind::NotFound,
            format!("no address found for {}", host),
        )))
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use sipstack_sip_core::builder::RequestBuilder;
    use sipstack_sip_core::Via;

    fn invite() -> Request {
        RequestBuilder::new(Method::Invite, "sip:bob@192.0.2.4")
            .unwrap()
            .via(Via::new("UDP", "10.0.0.1", Some(5060)).with_branch("z9hG4bKinv"))
            .max_forwards(70)
            .from_address("<sip:alice@atlanta.com>;tag=a1".parse().unwrap())
            .to_address("<sip:bob@biloxi.com>".parse().unwrap())
            .call_id("utils-call")
            .cseq(4)
            .route("<sip:p1.example.com;lr>".parse().unwrap())
            .build()
    }

    #[test]
    fn test_failure_ack_copies_invite_identity() {
        let invite = invite();
        let busy = ResponseBuilder::from_request(&invite, StatusCode::BUSY_HERE)
            .to_tag("b2")
            .build();
        let ack = create_ack_for_failure(&invite, &busy).unwrap();

        assert_eq!(ack.method, Method::Ack);
        assert_eq!(ack.uri, invite.uri);
        assert_eq!(ack.top_via().unwrap().branch(), Some("z9hG4bKinv"));
        assert_eq!(ack.to_tag().as_deref(), Some("b2"));
        assert_eq!(ack.cseq().unwrap(), CSeq::new(4, Method::Ack));
        assert_eq!(ack.routes().unwrap().len(), 1);
        assert!(ack.validate().is_ok());
    }

    #[test]
    fn test_cancel_matches_invite() {
        let invite = invite();
        let cancel = create_cancel(&invite).unwrap();
        assert_eq!(cancel.top_via().unwrap(), invite.top_via().unwrap());
        assert_eq!(cancel.cseq().unwrap(), CSeq::new(4, Method::Cancel));
        assert_eq!(cancel.to_tag(), None);
        assert!(cancel.validate().is_ok());
    }

    #[test]
    fn test_via_fixups() {
        let mut request = invite();
        let mut via = request.top_via().unwrap();
        via.set_rport(None);
        request.set_top_via(&via);

        apply_via_fixups(&mut request, "192.0.2.9:40000".parse().unwrap()).unwrap();
        let via = request.top_via().unwrap();
        assert_eq!(via.received(), Some("192.0.2.9"));
        assert_eq!(via.rport(), Some(Some(40000)));

        let mut same_host = invite();
        apply_via_fixups(&mut same_host, "10.0.0.1:5060".parse().unwrap()).unwrap();
        assert_eq!(same_host.top_via().unwrap().received(), None);
    }

    #[test]
    fn test_stateless_response_gets_to_tag() {
        let response = create_stateless_response(&invite(), StatusCode::LOOP_DETECTED);
        assert_eq!(response.status, StatusCode::LOOP_DETECTED);
        assert!(response.to_tag().is_some());
    }

    #[tokio::test]
    async fn test_destination_resolution() {
        let request = invite();
        // Loose route wins, but p1.example.com is not an IP; use a literal route instead.
        let mut routed = request.clone();
        routed.headers.remove_all(&HeaderName::Route);
        routed.headers.push(HeaderName::Route, "<sip:192.0.2.7:5070;lr>");
        assert_eq!(
            resolve_request_destination(&routed).await.unwrap(),
            "192.0.2.7:5070".parse::<SocketAddr>().unwrap()
        );

        let mut direct = request;
        direct.headers.remove_all(&HeaderName::Route);
        assert_eq!(
            resolve_request_destination(&direct).await.unwrap(),
            "192.0.2.4:5060".parse::<SocketAddr>().unwrap()
        );

        let mut response = ResponseBuilder::from_request(&direct, StatusCode::OK).build();
        let mut via = response.top_via().unwrap();
        via.set_received("192.0.2.9");
        via.set_rport(Some(40000));
        response.set_top_via(&via);
        assert_eq!(
            resolve_response_destination(&response).await.unwrap(),
            "192.0.2.9:40000".parse::<SocketAddr>().unwrap()
        );
    }
}
