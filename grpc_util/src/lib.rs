// Copyright 2024 Pants project contributors (see CONTRIBUTORS.md).
// Licensed under the Apache License, Version 2.0 (see LICENSE).

use std::collections::BTreeMap;

use http::header::{HeaderMap, HeaderName, HeaderValue};
use itertools::{Either, Itertools};
use tonic::transport::{Channel, ClientTlsConfig, Endpoint};

pub mod headers;
pub mod prost;
pub mod retry;

pub use crate::headers::SetRequestHeaders;

/// The type of a gRPC service stack with request headers applied: this is the `T` our generated
/// clients are instantiated with.
pub type LayeredService = SetRequestHeaders<Channel>;

pub fn layered_service(
    channel: Channel,
    headers: &BTreeMap<String, String>,
) -> Result<LayeredService, String> {
    Ok(SetRequestHeaders::new(
        channel,
        headers_to_http_header_map(headers)?,
    ))
}

///
/// Create a Channel to the given address. The address must include a scheme: `http://` addresses
/// are plaintext, and `https://` addresses use TLS (with the given root CA certificates, or the
/// system roots if none are provided).
///
pub async fn create_channel(
    address: &str,
    root_ca_certs: Option<&[u8]>,
) -> Result<Channel, String> {
    let mut endpoint = Endpoint::from_shared(address.to_owned())
        .map_err(|err| format!("Invalid address `{address}`: {err}"))?;

    if address.starts_with("https://") {
        let mut tls_config = ClientTlsConfig::new().with_enabled_roots();
        if let Some(pem_bytes) = root_ca_certs {
            let certificate = tonic::transport::Certificate::from_pem(pem_bytes);
            tls_config = tls_config.ca_certificate(certificate);
        }
        endpoint = endpoint
            .tls_config(tls_config)
            .map_err(|err| format!("TLS setup error for `{address}`: {err}"))?;
    }

    endpoint
        .connect()
        .await
        .map_err(|err| format!("Failed to connect to `{address}`: {err}"))
}

pub fn headers_to_http_header_map(
    headers: &BTreeMap<String, String>,
) -> Result<HeaderMap, String> {
    let (http_headers, errors): (Vec<(HeaderName, HeaderValue)>, Vec<String>) = headers
        .iter()
        .map(|(key, value)| {
            let header_name = HeaderName::from_bytes(key.as_bytes())
                .map_err(|err| format!("Invalid header name {key}: {err}"))?;
            let header_value = HeaderValue::from_str(value)
                .map_err(|err| format!("Invalid header value {value}: {err}"))?;
            Ok((header_name, header_value))
        })
        .partition_map(|result: Result<(HeaderName, HeaderValue), String>| match result {
            Ok(v) => Either::Left(v),
            Err(err) => Either::Right(err),
        });

    if !errors.is_empty() {
        return Err(format!("header conversion errors: {}", errors.join("; ")));
    }

    Ok(HeaderMap::from_iter(http_headers))
}

pub fn status_to_str(status: tonic::Status) -> String {
    format!("{:?}: {:?}", status.code(), status.message())
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use crate::headers_to_http_header_map;

    #[test]
    fn header_conversion() {
        let mut headers = BTreeMap::new();
        headers.insert("authorization".to_owned(), "Bearer xyz".to_owned());
        headers.insert("x-custom".to_owned(), "value".to_owned());

        let header_map = headers_to_http_header_map(&headers).unwrap();
        assert_eq!(header_map.get("authorization").unwrap(), "Bearer xyz");
        assert_eq!(header_map.get("x-custom").unwrap(), "value");
    }

    #[test]
    fn invalid_header_name_is_rejected() {
        let mut headers = BTreeMap::new();
        headers.insert("spaces are invalid".to_owned(), "v".to_owned());
        headers_to_http_header_map(&headers).expect_err("want err");
    }
}
