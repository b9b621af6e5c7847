//! HTML error page returned when the backend cannot be reached

use crate::proxy::ProxyBody;
use http_body_util::{BodyExt, Full};
use hyper::body::Bytes;
use hyper::{Response, StatusCode};
use std::error::Error;

/// Render an error and its sources as one line: `outer: inner: root`
pub fn error_chain(err: &(dyn Error + 'static)) -> String {
    let mut message = err.to_string();
    let mut source = err.source();
    while let Some(cause) = source {
        let cause_text = cause.to_string();
        // Some errors already embed their source in their own message
        if !message.ends_with(&cause_text) {
            message.push_str(": ");
            message.push_str(&cause_text);
        }
        source = cause.source();
    }
    message
}

/// Body of the bad gateway page, with `message` escaped for HTML text and
/// attribute contexts
pub fn render_error_page(message: &str) -> String {
    format!(
        "<h1>Bad Gateway</h1><p>{}</p>",
        html_escape::encode_quoted_attribute(message)
    )
}

/// Create the 502 response for a failed backend request
pub fn bad_gateway_response(err: &(dyn Error + 'static)) -> Response<ProxyBody> {
    let body = render_error_page(&error_chain(err));

    Response::builder()
        .status(StatusCode::BAD_GATEWAY)
        .header(hyper::header::CONTENT_TYPE, "text/html")
        .body(Full::new(Bytes::from(body)).map_err(|never| match never {}).boxed())
        .expect("valid response with StatusCode enum and static headers")
}
