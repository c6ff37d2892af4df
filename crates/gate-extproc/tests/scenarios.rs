//! End-to-end protocol scenarios: datastore + scheduler + handler assembled
//! the way the runner wires them, driven message by message.

use gate_backend::Datastore;
use gate_core::{
    Criticality, Error, InferenceModel, InferencePool, Metrics, Pod, SchedulerConfig, TargetModel,
};
use gate_extproc::{ExtProcService, RequestContext};
use gate_proto::{
    body_mutation, processing_request, processing_response, CommonResponse, HeaderMap,
    HeaderValue, HttpBody, HttpHeaders, ProcessingRequest, ProcessingResponse,
};
use gate_sched::Scheduler;
use rand::rngs::StdRng;
use rand::SeedableRng;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;

const ENDPOINT_KEY: &str = "x-gateway-destination-endpoint";

struct PodSpec {
    name: &'static str,
    address: &'static str,
    queue: u32,
    kv: f64,
    adapters: &'static [&'static str],
    max_adapters: u32,
}

fn fixture(models: Vec<InferenceModel>, pods: &[PodSpec]) -> (Arc<Datastore>, ExtProcService) {
    let datastore = Arc::new(Datastore::new());
    datastore.set_pool(InferencePool {
        name: "pool".to_string(),
        namespace: "default".to_string(),
        target_port: 8000,
        selector: HashMap::from([("app".to_string(), "vllm".to_string())]),
    });
    for model in models {
        datastore.upsert_model(model);
    }
    for spec in pods {
        datastore.add_or_update_pod(Pod::new(spec.name, spec.address));
        datastore.update_pod_metrics(
            spec.name,
            Metrics {
                waiting_queue_size: spec.queue,
                kv_cache_usage_percent: spec.kv,
                active_models: spec
                    .adapters
                    .iter()
                    .map(|s| s.to_string())
                    .collect::<HashSet<_>>(),
                max_active_models: spec.max_adapters,
                ..Metrics::default()
            },
        );
    }

    let scheduler = Arc::new(Scheduler::with_rng(
        datastore.clone(),
        SchedulerConfig::default(),
        StdRng::seed_from_u64(7),
    ));
    let service = ExtProcService::new(datastore.clone(), scheduler, ENDPOINT_KEY);
    (datastore, service)
}

fn model(name: &str, criticality: Option<Criticality>, targets: Vec<(&str, u32)>) -> InferenceModel {
    InferenceModel {
        name: format!("{name}-object"),
        model_name: name.to_string(),
        criticality,
        target_models: targets
            .into_iter()
            .map(|(n, w)| TargetModel {
                name: n.to_string(),
                weight: w,
            })
            .collect(),
        pool_name: "pool".to_string(),
    }
}

fn headers_msg(pairs: &[(&str, &str)]) -> ProcessingRequest {
    ProcessingRequest {
        async_mode: false,
        request: Some(processing_request::Request::RequestHeaders(HttpHeaders {
            headers: Some(HeaderMap {
                headers: pairs
                    .iter()
                    .map(|(k, v)| HeaderValue {
                        key: k.to_string(),
                        value: v.to_string(),
                        raw_value: Vec::new(),
                    })
                    .collect(),
            }),
            end_of_stream: false,
        })),
    }
}

fn body_msg(body: &[u8]) -> ProcessingRequest {
    ProcessingRequest {
        async_mode: false,
        request: Some(processing_request::Request::RequestBody(HttpBody {
            body: body.to_vec(),
            end_of_stream: true,
        })),
    }
}

fn response_headers_msg(pairs: &[(&str, &str)]) -> ProcessingRequest {
    let ProcessingRequest { request, .. } = headers_msg(pairs);
    let Some(processing_request::Request::RequestHeaders(headers)) = request else {
        unreachable!();
    };
    ProcessingRequest {
        async_mode: false,
        request: Some(processing_request::Request::ResponseHeaders(headers)),
    }
}

fn response_body_msg(body: &[u8], end_of_stream: bool) -> ProcessingRequest {
    ProcessingRequest {
        async_mode: false,
        request: Some(processing_request::Request::ResponseBody(HttpBody {
            body: body.to_vec(),
            end_of_stream,
        })),
    }
}

fn body_common(resp: &ProcessingResponse) -> &CommonResponse {
    match resp.response.as_ref().unwrap() {
        processing_response::Response::RequestBody(body) => body.response.as_ref().unwrap(),
        other => panic!("expected a request-body response, got {other:?}"),
    }
}

fn mutated_body(common: &CommonResponse) -> &[u8] {
    match common
        .body_mutation
        .as_ref()
        .unwrap()
        .mutation
        .as_ref()
        .unwrap()
    {
        body_mutation::Mutation::Body(bytes) => bytes,
        other => panic!("expected a body mutation, got {other:?}"),
    }
}

fn set_header<'a>(common: &'a CommonResponse, key: &str) -> &'a [u8] {
    common
        .header_mutation
        .as_ref()
        .unwrap()
        .set_headers
        .iter()
        .find_map(|opt| {
            let header = opt.header.as_ref().unwrap();
            (header.key == key).then_some(header.raw_value.as_slice())
        })
        .unwrap_or_else(|| panic!("header {key} not set"))
}

#[test]
fn simple_passthrough_routes_to_the_only_pod() {
    let (_datastore, service) = fixture(
        vec![model("m1", None, vec![])],
        &[PodSpec {
            name: "p1",
            address: "10.0.0.1:8000",
            queue: 0,
            kv: 0.1,
            adapters: &[],
            max_adapters: 0,
        }],
    );
    let mut ctx = RequestContext::new();

    let headers_resp = service
        .handle_message(&mut ctx, headers_msg(&[("x-request-id", "req-1")]))
        .unwrap();
    match headers_resp.response.unwrap() {
        processing_response::Response::RequestHeaders(h) => {
            let common = h.response.unwrap();
            assert!(common.clear_route_cache);
            assert!(common.header_mutation.is_none());
        }
        other => panic!("expected a request-headers response, got {other:?}"),
    }
    assert_eq!(ctx.correlation_id, "req-1");

    let body = br#"{"model":"m1","prompt":"hi"}"#;
    let resp = service.handle_message(&mut ctx, body_msg(body)).unwrap();
    let common = body_common(&resp);

    // Body passes through byte-identical
    assert_eq!(mutated_body(common), body);
    assert_eq!(set_header(common, ENDPOINT_KEY), b"10.0.0.1:8000");
    assert_eq!(
        set_header(common, "Content-Length"),
        body.len().to_string().as_bytes()
    );

    let metadata = resp.dynamic_metadata.unwrap();
    match metadata.fields.get(ENDPOINT_KEY).unwrap().kind.as_ref() {
        Some(prost_types::value::Kind::StringValue(v)) => assert_eq!(v, "10.0.0.1:8000"),
        other => panic!("expected string metadata, got {other:?}"),
    }

    assert_eq!(ctx.target_pod.as_ref().unwrap().name, "p1");
    assert_eq!(ctx.request_size, body.len());
}

#[test]
fn weighted_rewrite_always_picks_the_weighted_target() {
    let (_datastore, service) = fixture(
        vec![model("m1", None, vec![("m1-a", 0), ("m1-b", 10)])],
        &[PodSpec {
            name: "p1",
            address: "10.0.0.1:8000",
            queue: 0,
            kv: 0.1,
            adapters: &[],
            max_adapters: 0,
        }],
    );

    for _ in 0..20 {
        let mut ctx = RequestContext::new();
        let resp = service
            .handle_message(&mut ctx, body_msg(br#"{"model":"m1"}"#))
            .unwrap();
        let common = body_common(&resp);

        let outgoing = mutated_body(common);
        let parsed: serde_json::Value = serde_json::from_slice(outgoing).unwrap();
        assert_eq!(parsed["model"], "m1-b");
        assert_eq!(ctx.resolved_target_model, "m1-b");

        // Content-Length tracks the rewritten body
        assert_eq!(
            set_header(common, "Content-Length"),
            outgoing.len().to_string().as_bytes()
        );
    }
}

#[test]
fn lora_affinity_prefers_the_pod_with_the_adapter() {
    let (_datastore, service) = fixture(
        vec![model(
            "m1",
            Some(Criticality::Critical),
            vec![("m1-b", 1)],
        )],
        &[
            PodSpec {
                name: "p1",
                address: "10.0.0.1:8000",
                queue: 0,
                kv: 0.1,
                adapters: &["m1-b"],
                max_adapters: 2,
            },
            PodSpec {
                name: "p2",
                address: "10.0.0.2:8000",
                queue: 0,
                kv: 0.1,
                adapters: &[],
                max_adapters: 2,
            },
        ],
    );

    let mut ctx = RequestContext::new();
    let resp = service
        .handle_message(&mut ctx, body_msg(br#"{"model":"m1"}"#))
        .unwrap();
    let common = body_common(&resp);
    assert_eq!(set_header(common, ENDPOINT_KEY), b"10.0.0.1:8000");
}

#[test]
fn sheddable_request_is_dropped_when_fleet_is_saturated() {
    let (_datastore, service) = fixture(
        vec![model("m1", Some(Criticality::Sheddable), vec![])],
        &[
            PodSpec {
                name: "p1",
                address: "10.0.0.1:8000",
                queue: 6,
                kv: 0.1,
                adapters: &[],
                max_adapters: 0,
            },
            PodSpec {
                name: "p2",
                address: "10.0.0.2:8000",
                queue: 0,
                kv: 0.85,
                adapters: &[],
                max_adapters: 0,
            },
        ],
    );

    let mut ctx = RequestContext::new();
    let err = service
        .handle_message(&mut ctx, body_msg(br#"{"model":"m1"}"#))
        .unwrap_err();
    assert!(matches!(err, Error::ResourceExhausted(_)));
    // No pod was chosen, so no mutation was emitted
    assert!(ctx.target_pod.is_none());
}

#[test]
fn unknown_model_is_rejected_without_counting_a_request() {
    let (_datastore, service) = fixture(
        vec![model("m1", None, vec![])],
        &[PodSpec {
            name: "p1",
            address: "10.0.0.1:8000",
            queue: 0,
            kv: 0.1,
            adapters: &[],
            max_adapters: 0,
        }],
    );

    let mut ctx = RequestContext::new();
    let err = service
        .handle_message(&mut ctx, body_msg(br#"{"model":"m-xyz"}"#))
        .unwrap_err();
    assert!(matches!(err, Error::NotFound(_)));

    service.finalize(&mut ctx);

    // The success-path counter must not carry this model
    let counted = prometheus::default_registry()
        .gather()
        .iter()
        .filter(|mf| mf.get_name() == "inference_model_request_total")
        .flat_map(|mf| mf.get_metric().iter())
        .any(|m| {
            m.get_label()
                .iter()
                .any(|l| l.get_name() == "model_name" && l.get_value() == "m-xyz")
        });
    assert!(!counted, "request_total must not count unknown models");
}

#[test]
fn malformed_bodies_are_invalid_argument() {
    let (_datastore, service) = fixture(
        vec![model("m1", None, vec![])],
        &[PodSpec {
            name: "p1",
            address: "10.0.0.1:8000",
            queue: 0,
            kv: 0.1,
            adapters: &[],
            max_adapters: 0,
        }],
    );

    let mut ctx = RequestContext::new();
    let err = service
        .handle_message(&mut ctx, body_msg(b"not json"))
        .unwrap_err();
    assert!(matches!(err, Error::InvalidRequest(_)));

    // Top-level array
    let err = service
        .handle_message(&mut ctx, body_msg(b"[1,2,3]"))
        .unwrap_err();
    assert!(matches!(err, Error::InvalidRequest(_)));

    // Missing model field
    let err = service
        .handle_message(&mut ctx, body_msg(br#"{"prompt":"hi"}"#))
        .unwrap_err();
    assert!(matches!(err, Error::InvalidRequest(_)));

    // Non-string model field
    let err = service
        .handle_message(&mut ctx, body_msg(br#"{"model":7}"#))
        .unwrap_err();
    assert!(matches!(err, Error::InvalidRequest(_)));
}

#[test]
fn response_side_collects_sizes_and_tokens() {
    let (_datastore, service) = fixture(
        vec![model("stream-m", None, vec![])],
        &[PodSpec {
            name: "p1",
            address: "10.0.0.1:8000",
            queue: 0,
            kv: 0.1,
            adapters: &[],
            max_adapters: 0,
        }],
    );

    let mut ctx = RequestContext::new();
    service
        .handle_message(&mut ctx, headers_msg(&[]))
        .unwrap();
    service
        .handle_message(&mut ctx, body_msg(br#"{"model":"stream-m"}"#))
        .unwrap();
    service
        .handle_message(&mut ctx, response_headers_msg(&[]))
        .unwrap();

    let chunk = br#"{"usage":{"prompt_tokens":9,"completion_tokens":41}}"#;
    let (first, second) = chunk.split_at(10);
    service
        .handle_message(&mut ctx, response_body_msg(first, false))
        .unwrap();
    service
        .handle_message(&mut ctx, response_body_msg(second, true))
        .unwrap();

    assert_eq!(ctx.response_size, chunk.len());
    assert_eq!(ctx.input_tokens, 9);
    assert_eq!(ctx.output_tokens, 41);
}

#[test]
fn token_headers_take_precedence_over_body_usage() {
    let (_datastore, service) = fixture(
        vec![model("header-m", None, vec![])],
        &[PodSpec {
            name: "p1",
            address: "10.0.0.1:8000",
            queue: 0,
            kv: 0.1,
            adapters: &[],
            max_adapters: 0,
        }],
    );

    let mut ctx = RequestContext::new();
    service
        .handle_message(&mut ctx, body_msg(br#"{"model":"header-m"}"#))
        .unwrap();
    service
        .handle_message(
            &mut ctx,
            response_headers_msg(&[
                ("x-gateway-input-tokens", "100"),
                ("x-gateway-output-tokens", "200"),
            ]),
        )
        .unwrap();
    service
        .handle_message(
            &mut ctx,
            response_body_msg(br#"{"usage":{"prompt_tokens":1,"completion_tokens":2}}"#, true),
        )
        .unwrap();

    assert_eq!(ctx.input_tokens, 100);
    assert_eq!(ctx.output_tokens, 200);
}
