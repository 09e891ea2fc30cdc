// Copyright 2024 Pants project contributors (see CONTRIBUTORS.md).
// Licensed under the Apache License, Version 2.0 (see LICENSE).

use std::task::{Context, Poll};

use http::header::HeaderMap;
use http::Request;
use tower_layer::Layer;
use tower_service::Service;

///
/// A tower `Layer` which sets the given headers on every request passing through it, used to
/// apply instance names and authorization headers to all outgoing gRPC calls.
///
#[derive(Clone, Debug)]
pub struct SetRequestHeadersLayer {
    headers: HeaderMap,
}

impl SetRequestHeadersLayer {
    pub fn new(headers: HeaderMap) -> Self {
        SetRequestHeadersLayer { headers }
    }
}

impl<S> Layer<S> for SetRequestHeadersLayer {
    type Service = SetRequestHeaders<S>;

    fn layer(&self, inner: S) -> Self::Service {
        SetRequestHeaders {
            inner,
            headers: self.headers.clone(),
        }
    }
}

#[derive(Clone, Debug)]
pub struct SetRequestHeaders<S> {
    inner: S,
    headers: HeaderMap,
}

impl<S> SetRequestHeaders<S> {
    pub fn new(inner: S, headers: HeaderMap) -> Self {
        SetRequestHeaders { inner, headers }
    }
}

impl<S, ReqBody> Service<Request<ReqBody>> for SetRequestHeaders<S>
where
    S: Service<Request<ReqBody>>,
{
    type Response = S::Response;
    type Error = S::Error;
    type Future = S::Future;

    fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        self.inner.poll_ready(cx)
    }

    fn call(&mut self, mut req: Request<ReqBody>) -> Self::Future {
        if !self.headers.is_empty() {
            let headers = req.headers_mut();
            for (name, value) in &self.headers {
                headers.insert(name, value.clone());
            }
        }
        self.inner.call(req)
    }
}
