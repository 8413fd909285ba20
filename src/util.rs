use std::collections::BTreeMap;
use std::sync::Mutex;
use std::time::{Duration, SystemTime};

use http::header::{HeaderName, HeaderValue, RETRY_AFTER};
use http::{HeaderMap, Uri};

use crate::error::Error;

const MAX_ERROR_BODY_LEN: usize = 2048;

pub(crate) fn lock_unpoisoned<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

pub(crate) fn merge_headers(default_headers: &HeaderMap, request_headers: &HeaderMap) -> HeaderMap {
    let mut merged = default_headers.clone();
    for name in request_headers.keys() {
        merged.remove(name);
    }
    for (name, value) in request_headers {
        merged.append(name.clone(), value.clone());
    }
    merged
}

pub(crate) fn merge_params(
    default_params: &BTreeMap<String, String>,
    request_params: &BTreeMap<String, String>,
) -> BTreeMap<String, String> {
    let mut merged = default_params.clone();
    for (name, value) in request_params {
        merged.insert(name.clone(), value.clone());
    }
    merged
}

pub(crate) fn join_base_path(base_url: &str, path: &str) -> String {
    let base = base_url.trim_end_matches('/');
    let relative = path.trim_start_matches('/');
    match (base.is_empty(), relative.is_empty()) {
        (true, true) => String::new(),
        (true, false) => relative.to_owned(),
        (false, true) => base.to_owned(),
        (false, false) => format!("{base}/{relative}"),
    }
}

fn is_absolute_http(path: &str) -> bool {
    let Some((scheme, rest)) = path.split_once("://") else {
        return false;
    };
    !rest.is_empty()
        && (scheme.eq_ignore_ascii_case("http") || scheme.eq_ignore_ascii_case("https"))
}

/// Joins `path` onto `base_url` unless `path` is already an absolute http(s) URL.
pub(crate) fn resolve_url(base_url: &str, path: &str) -> Result<String, Error> {
    let url_text = if is_absolute_http(path) {
        path.to_owned()
    } else if path.contains("://") {
        return Err(Error::InvalidUri {
            uri: path.to_owned(),
        });
    } else {
        join_base_path(base_url, path)
    };
    if url_text.is_empty() {
        return Err(Error::InvalidUri { uri: url_text });
    }
    url_text
        .parse::<Uri>()
        .map_err(|_| Error::InvalidUri {
            uri: url_text.clone(),
        })?;
    Ok(url_text)
}

pub(crate) fn validate_base_url(base_url: &str) -> Result<(), Error> {
    if base_url.is_empty() {
        return Ok(());
    }
    let parsed = url::Url::parse(base_url).map_err(|_| Error::InvalidUri {
        uri: base_url.to_owned(),
    })?;
    if !matches!(parsed.scheme(), "http" | "https") || parsed.host_str().is_none() {
        return Err(Error::InvalidUri {
            uri: base_url.to_owned(),
        });
    }
    if parsed.query().is_some() || parsed.fragment().is_some() {
        return Err(Error::InvalidUri {
            uri: base_url.to_owned(),
        });
    }
    Ok(())
}

pub(crate) fn append_query_pairs(url: &str, params: &BTreeMap<String, String>) -> String {
    if params.is_empty() {
        return url.to_owned();
    }

    let (without_fragment, fragment) = match url.split_once('#') {
        Some((left, right)) => (left, Some(right)),
        None => (url, None),
    };
    let (base, existing_query) = match without_fragment.split_once('?') {
        Some((left, right)) => (left, Some(right)),
        None => (without_fragment, None),
    };

    let mut serializer = url::form_urlencoded::Serializer::new(String::new());
    if let Some(existing_query) = existing_query {
        for (name, value) in url::form_urlencoded::parse(existing_query.as_bytes()) {
            if !params.contains_key(name.as_ref()) {
                serializer.append_pair(&name, &value);
            }
        }
    }
    for (name, value) in params {
        serializer.append_pair(name, value);
    }

    let mut merged = format!("{base}?{}", serializer.finish());
    if let Some(fragment) = fragment {
        merged.push('#');
        merged.push_str(fragment);
    }
    merged
}

pub(crate) fn redact_uri_for_logs(uri_text: &str) -> String {
    let Ok(mut parsed) = url::Url::parse(uri_text) else {
        return uri_text.split('?').next().unwrap_or(uri_text).to_owned();
    };

    let _ = parsed.set_username("");
    let _ = parsed.set_password(None);
    parsed.set_query(None);
    parsed.set_fragment(None);
    parsed.to_string()
}

pub(crate) fn default_port(uri: &Uri) -> Option<u16> {
    uri.port_u16().or_else(|| match uri.scheme_str() {
        Some(scheme) if scheme.eq_ignore_ascii_case("https") => Some(443),
        Some(scheme) if scheme.eq_ignore_ascii_case("http") => Some(80),
        _ => None,
    })
}

/// `host:port` key the logical connection pool tracks slots under.
pub(crate) fn host_key(url_text: &str) -> Option<String> {
    let uri = url_text.parse::<Uri>().ok()?;
    let host = uri.host()?.to_ascii_lowercase();
    let Some(port) = default_port(&uri) else {
        return Some(host);
    };
    Some(format!("{host}:{port}"))
}

pub(crate) fn parse_header_name(name: &str) -> Result<HeaderName, Error> {
    name.parse().map_err(|_| Error::InvalidHeaderName {
        name: name.to_owned(),
    })
}

pub(crate) fn parse_header_value(name: &str, value: &str) -> Result<HeaderValue, Error> {
    value.parse().map_err(|_| Error::InvalidHeaderValue {
        name: name.to_owned(),
    })
}

pub(crate) fn parse_retry_after(headers: &HeaderMap, now: SystemTime) -> Option<Duration> {
    let value = headers.get(RETRY_AFTER)?;
    let raw_value = value.to_str().ok()?.trim();
    if let Ok(seconds) = raw_value.parse::<u64>() {
        return Some(Duration::from_secs(seconds));
    }

    let date = httpdate::parse_http_date(raw_value).ok()?;
    match date.duration_since(now) {
        Ok(duration) => Some(duration),
        Err(_) => Some(Duration::ZERO),
    }
}

pub(crate) fn truncate_body(body: &[u8]) -> String {
    let text = String::from_utf8_lossy(body);
    if text.chars().count() <= MAX_ERROR_BODY_LEN {
        return text.into_owned();
    }

    let truncated: String = text.chars().take(MAX_ERROR_BODY_LEN).collect();
    format!("{truncated}...(truncated)")
}

pub(crate) fn saturating_millis(duration: Duration) -> u64 {
    duration.as_millis().min(u64::MAX as u128) as u64
}
