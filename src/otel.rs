// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # OpenTelemetry Integration
//!
//! Propagates trace context through message headers: the publisher injects
//! the caller's context into outgoing headers, and the consumer extracts it
//! to parent the span it opens for each delivery.

use opentelemetry::{
    global::{BoxedSpan, BoxedTracer},
    propagation::{Extractor, Injector},
    trace::{SpanKind, Tracer},
    Context,
};
use std::{borrow::Cow, collections::HashMap};

/// Writes trace context entries into outgoing message headers.
pub(crate) struct HeaderInjector<'a> {
    headers: &'a mut HashMap<String, String>,
}

impl<'a> HeaderInjector<'a> {
    pub(crate) fn new(headers: &'a mut HashMap<String, String>) -> Self {
        Self { headers }
    }
}

impl Injector for HeaderInjector<'_> {
    fn set(&mut self, key: &str, value: String) {
        self.headers.insert(key.to_lowercase(), value);
    }
}

/// Reads trace context entries from the headers of a delivery.
pub(crate) struct HeaderExtractor<'a> {
    headers: &'a HashMap<String, String>,
}

impl<'a> HeaderExtractor<'a> {
    pub(crate) fn new(headers: &'a HashMap<String, String>) -> Self {
        Self { headers }
    }
}

impl Extractor for HeaderExtractor<'_> {
    fn get(&self, key: &str) -> Option<&str> {
        self.headers.get(key).map(String::as_str)
    }

    fn keys(&self) -> Vec<&str> {
        self.headers.keys().map(String::as_str).collect()
    }
}

/// Injects `ctx` into a fresh header map using the global propagator.
pub(crate) fn inject_context(ctx: &Context) -> HashMap<String, String> {
    let mut headers = HashMap::new();
    opentelemetry::global::get_text_map_propagator(|propagator| {
        propagator.inject_context(ctx, &mut HeaderInjector::new(&mut headers))
    });
    headers
}

/// Creates a consumer span for a delivery, parented on the context carried
/// in its headers.
pub(crate) fn new_span(
    headers: &HashMap<String, String>,
    tracer: &BoxedTracer,
    name: &str,
) -> (Context, BoxedSpan) {
    let ctx = opentelemetry::global::get_text_map_propagator(|propagator| {
        propagator.extract(&HeaderExtractor::new(headers))
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
    fn test_injector_lowercases_keys() {
        let mut headers = HashMap::new();
        HeaderInjector::new(&mut headers).set("TraceParent", "00-abc".to_owned());

        assert_eq!(headers.get("traceparent").map(String::as_str), Some("00-abc"));
    }

    #[test]
    fn test_extractor_reads_headers() {
        let mut headers = HashMap::new();
        headers.insert("tracestate".to_owned(), "k=v".to_owned());

        let extractor = HeaderExtractor::new(&headers);
        assert_eq!(extractor.get("tracestate"), Some("k=v"));
        assert_eq!(extractor.keys(), vec!["tracestate"]);
    }
}
