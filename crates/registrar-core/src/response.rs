//! Response construction for requests handled by the registrar

use rsip::{Header, Headers};

/// Build a response to `request` with `status`.
///
/// The dialog-identifying headers (Via, From, To, Call-ID, CSeq) are copied
/// from the request so the peer can match the response to its transaction.
pub fn reply(request: &rsip::Request, status: rsip::StatusCode) -> rsip::Response {
    let mut headers = Headers::default();
    for header in request.headers.iter() {
        match header {
            Header::Via(_)
            | Header::From(_)
            | Header::To(_)
            | Header::CallId(_)
            | Header::CSeq(_) => {
                headers.push(header.clone());
            }
            _ => {}
        }
    }

    rsip::Response {
        status_code: status,
        version: rsip::Version::V2,
        headers,
        body: Vec::new(),
    }
}
