// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # OpenTelemetry Integration
//!
//! Trace context travels in message headers. Publishing injects the current
//! context and every delivery gets a consumer span parented on the context
//! extracted from its headers.

use crate::message::{HeaderValue, Headers};
use opentelemetry::{
    global::{BoxedSpan, BoxedTracer},
    propagation::{Extractor, Injector},
    trace::{SpanKind, Tracer},
    Context,
};
use std::borrow::Cow;

/// Adapter exposing message headers to OpenTelemetry propagators.
pub(crate) struct HeadersPropagator<'a> {
    headers: &'a mut Headers,
}

impl<'a> HeadersPropagator<'a> {
    pub(crate) fn new(headers: &'a mut Headers) -> Self {
        Self { headers }
    }
}

impl Injector for HeadersPropagator<'_> {
    fn set(&mut self, key: &str, value: String) {
        self.headers
            .insert(key.to_lowercase(), HeaderValue::String(value));
    }
}

impl Extractor for HeadersPropagator<'_> {
    fn get(&self, key: &str) -> Option<&str> {
        self.headers.get(key).and_then(HeaderValue::as_str)
    }

    fn keys(&self) -> Vec<&str> {
        self.headers.keys().map(String::as_str).collect()
    }
}

/// Writes the trace context of `ctx` into `headers`.
pub(crate) fn inject(ctx: &Context, headers: &mut Headers) {
    opentelemetry::global::get_text_map_propagator(|propagator| {
        propagator.inject_context(ctx, &mut HeadersPropagator::new(headers))
    });
}

/// Creates a consumer span named `name`, parented on the context found in
/// `headers`.
pub(crate) fn new_span(headers: &Headers, tracer: &BoxedTracer, name: &str) -> (Context, BoxedSpan) {
    let mut headers = headers.clone();
    let ctx = opentelemetry::global::get_text_map_propagator(|propagator| {
        propagator.extract(&HeadersPropagator::new(&mut headers))
    });

    let span = tracer
        .span_builder(Cow::from(name.to_owned()))
        .with_kind(SpanKind::Consumer)
        .start_with_context(tracer, &ctx);

    (ctx, span)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn injects_lowercased_string_headers() {
        let mut headers = Headers::new();
        HeadersPropagator::new(&mut headers).set("TraceParent", "00-abc-def-01".to_owned());

        assert_eq!(
            headers.get("traceparent"),
            Some(&HeaderValue::from("00-abc-def-01"))
        );
    }

    #[test]
    fn extracts_only_string_values() {
        let mut headers = Headers::new();
        headers.insert("traceparent".into(), HeaderValue::from("00-abc-def-01"));
        headers.insert("x-backoff-sec".into(), HeaderValue::Int(1000));

        let propagator = HeadersPropagator::new(&mut headers);
        assert_eq!(propagator.get("traceparent"), Some("00-abc-def-01"));
        assert_eq!(propagator.get("x-backoff-sec"), None);
        assert_eq!(propagator.keys(), vec!["traceparent", "x-backoff-sec"]);
    }
}
