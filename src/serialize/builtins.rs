//! Converters for recognised built-in shapes that need more than a field copy.

use super::node::{RequestSnapshot, ResponseSnapshot, SerializedNode, TypedValue, UrlParts};
use crate::value::{HttpBody, HttpRequest, HttpResponse, TypedArray};
use chrono::{DateTime, SecondsFormat, Utc};
use reqwest::Url;

pub(super) fn date(millis: Option<i64>) -> SerializedNode {
    let iso = millis
        .and_then(DateTime::<Utc>::from_timestamp_millis)
        .map(|dt| dt.to_rfc3339_opts(SecondsFormat::Millis, true));
    SerializedNode::Typed(TypedValue::Date(iso))
}

pub(super) fn typed_array(view: &TypedArray) -> SerializedNode {
    SerializedNode::Typed(TypedValue::TypedArray {
        type_name: view.kind.name().to_string(),
        length: view.len(),
        data: view.buffer.clone(),
    })
}

pub(super) fn url_parts(url: &Url) -> UrlParts {
    let hostname = url.host_str().unwrap_or_default().to_string();
    let port = url.port().map(|p| p.to_string()).unwrap_or_default();
    let host = if port.is_empty() {
        hostname.clone()
    } else {
        format!("{}:{}", hostname, port)
    };
    UrlParts {
        href: url.as_str().to_string(),
        protocol: format!("{}:", url.scheme()),
        host,
        hostname,
        port,
        pathname: url.path().to_string(),
        search: url.query().map(|q| format!("?{}", q)).unwrap_or_default(),
        hash: url.fragment().map(|f| format!("#{}", f)).unwrap_or_default(),
        origin: url.origin().ascii_serialization(),
    }
}

pub(super) fn url(url: &Url) -> SerializedNode {
    SerializedNode::Typed(TypedValue::Url(url_parts(url)))
}

/// `application/x-www-form-urlencoded` rendering of ordered pairs.
pub(crate) fn encode_query(pairs: &[(String, String)]) -> String {
    pairs
        .iter()
        .map(|(k, v)| format!("{}={}", urlencoding::encode(k), urlencoding::encode(v)))
        .collect::<Vec<_>>()
        .join("&")
}

/// Header names are case-insensitive; they are emitted lowercased.
pub(super) fn normalize_headers(headers: &[(String, String)]) -> Vec<(String, String)> {
    headers
        .iter()
        .map(|(name, value)| (name.to_ascii_lowercase(), value.clone()))
        .collect()
}

fn content_type(headers: &[(String, String)]) -> Option<String> {
    headers
        .iter()
        .find(|(name, _)| name.eq_ignore_ascii_case("content-type"))
        .map(|(_, value)| value.to_ascii_lowercase())
}

fn is_textual(content_type: &str) -> bool {
    content_type.starts_with("text/")
        || content_type.contains("xml")
        || content_type.contains("x-www-form-urlencoded")
        || content_type.contains("javascript")
}

/// Best-effort body snapshot. Returns `(body_used, body)`; a consumed stream
/// is never read again. A JSON body sits one level below its message.
fn body(
    headers: &[(String, String)],
    body: &Option<HttpBody>,
    depth: usize,
    max_depth: usize,
) -> (bool, Option<Box<SerializedNode>>) {
    let body = match body {
        Some(body) => body,
        None => return (false, None),
    };
    if body.used {
        return (true, None);
    }
    let bytes = match &body.content {
        Ok(bytes) => bytes,
        Err(reason) => {
            let node = SerializedNode::access_error(format!("failed to read body: {}", reason));
            return (false, Some(Box::new(node)));
        }
    };
    if bytes.is_empty() {
        return (false, None);
    }

    let content_type = content_type(headers).unwrap_or_default();
    let node = if content_type.contains("json") {
        match serde_json::from_slice::<serde_json::Value>(bytes) {
            Ok(json) => SerializedNode::from_json_within(&json, depth + 1, max_depth),
            Err(_) => SerializedNode::String(String::from_utf8_lossy(bytes).into_owned()),
        }
    } else if is_textual(&content_type) {
        SerializedNode::String(String::from_utf8_lossy(bytes).into_owned())
    } else {
        SerializedNode::Typed(TypedValue::ArrayBuffer(bytes.clone()))
    };
    (false, Some(Box::new(node)))
}

pub(super) fn request(request: &HttpRequest, depth: usize, max_depth: usize) -> SerializedNode {
    let (body_used, body) = body(&request.headers, &request.body, depth, max_depth);
    SerializedNode::Typed(TypedValue::Request(RequestSnapshot {
        method: request.method.to_ascii_uppercase(),
        url: request.url.clone(),
        headers: normalize_headers(&request.headers),
        body_used,
        body,
    }))
}

pub(super) fn response(response: &HttpResponse, depth: usize, max_depth: usize) -> SerializedNode {
    let (body_used, body) = body(&response.headers, &response.body, depth, max_depth);
    SerializedNode::Typed(TypedValue::Response(ResponseSnapshot {
        status: response.status,
        status_text: response.status_text.clone(),
        url: response.url.clone(),
        headers: normalize_headers(&response.headers),
        body_used,
        body,
    }))
}
