//! Request fingerprints shared by the cache and the deduplication gate.

use std::sync::Arc;

use http::HeaderName;
use sha2::{Digest, Sha256};

use crate::request::Request;

/// Deterministic identity of a request: two requests with equal fingerprints
/// are interchangeable for caching and deduplication.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Fingerprint(Arc<str>);

impl Fingerprint {
    /// Digest over method, URL, sorted params, body bytes and the values of
    /// `header_names` (in the order given, missing headers hashed as empty).
    pub fn of(request: &Request, header_names: &[HeaderName]) -> Self {
        let mut hasher = Sha256::new();
        update_field(&mut hasher, request.method().as_str().as_bytes());
        update_field(&mut hasher, request.url().as_bytes());

        hasher.update((request.params().len() as u64).to_be_bytes());
        for (name, value) in request.params() {
            update_field(&mut hasher, name.as_bytes());
            update_field(&mut hasher, value.as_bytes());
        }

        hasher.update((header_names.len() as u64).to_be_bytes());
        for name in header_names {
            update_field(&mut hasher, name.as_str().as_bytes());
            let mut values = request
                .headers()
                .get_all(name)
                .iter()
                .map(|value| value.as_bytes())
                .collect::<Vec<_>>();
            values.sort_unstable();
            hasher.update((values.len() as u64).to_be_bytes());
            for value in values {
                update_field(&mut hasher, value);
            }
        }

        update_field(&mut hasher, &request.body().to_bytes());

        let digest = hasher.finalize();
        let mut hex = String::with_capacity(digest.len() * 2);
        for byte in digest {
            hex.push(char::from_digit(u32::from(byte >> 4), 16).unwrap_or('0'));
            hex.push(char::from_digit(u32::from(byte & 0x0f), 16).unwrap_or('0'));
        }
        Self(Arc::from(hex))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for Fingerprint {
    fn fmt(&self, formatter: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        formatter.write_str(&self.0)
    }
}

fn update_field(hasher: &mut Sha256, bytes: &[u8]) {
    hasher.update((bytes.len() as u64).to_be_bytes());
    hasher.update(bytes);
}

#[cfg(test)]
mod tests {
    use http::header::{ACCEPT_LANGUAGE, AUTHORIZATION, HeaderValue};

    use super::Fingerprint;
    use crate::request::{Body, Request};

    #[test]
    fn identical_requests_share_a_fingerprint_regardless_of_param_insertion_order() {
        let left = Request::get("https://api.example.com/users")
            .with_param("page", "2")
            .with_param("sort", "name");
        let right = Request::get("https://api.example.com/users")
            .with_param("sort", "name")
            .with_param("page", "2");
        assert_eq!(Fingerprint::of(&left, &[]), Fingerprint::of(&right, &[]));
        assert_eq!(Fingerprint::of(&left, &[]).as_str().len(), 64);
    }

    #[test]
    fn method_body_and_selected_headers_change_the_fingerprint() {
        let base = Request::post("https://api.example.com/orders")
            .with_body(Body::Json(serde_json::json!({"sku": "a-1"})));
        let other_body = Request::post("https://api.example.com/orders")
            .with_body(Body::Json(serde_json::json!({"sku": "b-2"})));
        let other_method = Request::get("https://api.example.com/orders")
            .with_body(Body::Json(serde_json::json!({"sku": "a-1"})));
        assert_ne!(Fingerprint::of(&base, &[]), Fingerprint::of(&other_body, &[]));
        assert_ne!(Fingerprint::of(&base, &[]), Fingerprint::of(&other_method, &[]));

        let with_auth = base
            .clone()
            .with_header(AUTHORIZATION, HeaderValue::from_static("Bearer t"));
        assert_eq!(Fingerprint::of(&base, &[]), Fingerprint::of(&with_auth, &[]));
        assert_ne!(
            Fingerprint::of(&base, &[AUTHORIZATION]),
            Fingerprint::of(&with_auth, &[AUTHORIZATION])
        );
        assert_eq!(
            Fingerprint::of(&base, &[ACCEPT_LANGUAGE]),
            Fingerprint::of(&with_auth, &[ACCEPT_LANGUAGE])
        );
    }
}
