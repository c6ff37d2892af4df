//! Per-stream protocol handling
//!
//! Each ext-proc stream carries one HTTP request. The proxy sends the
//! request headers, then the buffered request body, then the response side;
//! the handler answers every message and picks the target pod at the body
//! step. Stream order is guaranteed by the proxy: headers, body,
//! response-headers, response-body chunks, end.

use gate_backend::Datastore;
use gate_core::{Error, LlmRequest, Pod, Result};
use gate_proto::{
    body_mutation, headers, metadata, processing_request, processing_response, BodyMutation,
    BodyResponse, CommonResponse, HeaderMutation, HeadersResponse, HttpBody, HttpHeaders,
    ProcessingRequest, ProcessingResponse, TrailersResponse,
};
use gate_sched::Scheduler;
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, info};
use uuid::Uuid;

/// Request header used as the correlation id when the client sends one.
pub const REQUEST_ID_HEADER: &str = "x-request-id";

/// Response headers some gateways use to surface token usage.
pub const INPUT_TOKENS_HEADER: &str = "x-gateway-input-tokens";
pub const OUTPUT_TOKENS_HEADER: &str = "x-gateway-output-tokens";

/// Mutable state carried across the messages of one stream.
#[derive(Debug)]
pub struct RequestContext {
    /// Correlation id: the client's `x-request-id` or a fresh UUID
    pub correlation_id: String,
    /// Model name as requested
    pub model: String,
    /// Target model after weighted resolution
    pub resolved_target_model: String,
    /// Pod chosen by the scheduler
    pub target_pod: Option<Pod>,
    /// When the stream began, for the latency histogram
    pub request_received: Instant,
    /// Raw request body size in bytes
    pub request_size: usize,
    /// Accumulated response body size in bytes
    pub response_size: usize,
    /// Token counts observed on the response side
    pub input_tokens: u64,
    pub output_tokens: u64,
    response_buffer: Vec<u8>,
    recorded: bool,
}

impl RequestContext {
    pub fn new() -> Self {
        Self {
            correlation_id: Uuid::new_v4().to_string(),
            model: String::new(),
            resolved_target_model: String::new(),
            target_pod: None,
            request_received: Instant::now(),
            request_size: 0,
            response_size: 0,
            input_tokens: 0,
            output_tokens: 0,
            response_buffer: Vec::new(),
            recorded: false,
        }
    }
}

impl Default for RequestContext {
    fn default() -> Self {
        Self::new()
    }
}

/// The external-processor service: parses bodies, consults the scheduler,
/// and produces the mutations the proxy expects.
#[derive(Clone)]
pub struct ExtProcService {
    inner: Arc<Inner>,
}

struct Inner {
    datastore: Arc<Datastore>,
    scheduler: Arc<Scheduler>,
    target_endpoint_key: String,
}

impl ExtProcService {
    pub fn new(
        datastore: Arc<Datastore>,
        scheduler: Arc<Scheduler>,
        target_endpoint_key: impl Into<String>,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                datastore,
                scheduler,
                target_endpoint_key: target_endpoint_key.into(),
            }),
        }
    }

    /// Handle one message of the stream, producing the answer the proxy
    /// waits for. Errors terminate the stream with a gRPC status.
    pub fn handle_message(
        &self,
        ctx: &mut RequestContext,
        msg: ProcessingRequest,
    ) -> Result<ProcessingResponse> {
        use processing_request::Request;
        match msg.request {
            Some(Request::RequestHeaders(h)) => Ok(self.handle_request_headers(ctx, &h)),
            Some(Request::RequestBody(b)) => self.handle_request_body(ctx, &b),
            Some(Request::ResponseHeaders(h)) => Ok(self.handle_response_headers(ctx, &h)),
            Some(Request::ResponseBody(b)) => Ok(self.handle_response_body(ctx, &b)),
            Some(Request::RequestTrailers(_)) => Ok(ProcessingResponse {
                response: Some(processing_response::Response::RequestTrailers(
                    TrailersResponse::default(),
                )),
                dynamic_metadata: None,
            }),
            Some(Request::ResponseTrailers(_)) => Ok(ProcessingResponse {
                response: Some(processing_response::Response::ResponseTrailers(
                    TrailersResponse::default(),
                )),
                dynamic_metadata: None,
            }),
            None => Err(Error::invalid_request("empty processing request")),
        }
    }

    /// Headers pass through; the proxy is told to recompute the route after
    /// the body step sets the target-endpoint header.
    fn handle_request_headers(
        &self,
        ctx: &mut RequestContext,
        msg: &HttpHeaders,
    ) -> ProcessingResponse {
        if let Some(id) = headers::find(msg.headers.as_ref(), REQUEST_ID_HEADER) {
            ctx.correlation_id = id;
        }
        debug!(request = %ctx.correlation_id, "Handling request headers");

        ProcessingResponse {
            response: Some(processing_response::Response::RequestHeaders(
                HeadersResponse {
                    response: Some(CommonResponse {
                        clear_route_cache: true,
                        ..Default::default()
                    }),
                },
            )),
            dynamic_metadata: None,
        }
    }

    /// Parse the body, resolve the target model, schedule a pod, and emit
    /// the mutations routing the request there.
    fn handle_request_body(
        &self,
        ctx: &mut RequestContext,
        msg: &HttpBody,
    ) -> Result<ProcessingResponse> {
        debug!(request = %ctx.correlation_id, bytes = msg.body.len(), "Handling request body");

        let parsed: serde_json::Value = serde_json::from_slice(&msg.body)
            .map_err(|e| Error::invalid_request(format!("request body is not valid JSON: {e}")))?;
        if !parsed.is_object() {
            return Err(Error::invalid_request("request body must be a JSON object"));
        }
        let requested = parsed
            .get("model")
            .and_then(serde_json::Value::as_str)
            .ok_or_else(|| Error::invalid_request("model not found in request"))?
            .to_string();

        let model = self.inner.datastore.fetch_model(&requested).ok_or_else(|| {
            Error::not_found(format!("no model registered for input {requested}"))
        })?;

        let resolved = if model.target_models.is_empty() {
            model.model_name.clone()
        } else {
            model
                .weighted_draw(&mut rand::thread_rng())
                .ok_or_else(|| {
                    Error::internal(format!(
                        "error getting target model name for model {}",
                        model.model_name
                    ))
                })?
                .to_string()
        };

        let llm_req = LlmRequest {
            model: requested.clone(),
            resolved_target_model: resolved.clone(),
            critical: model.is_critical(),
        };

        // Rewrite the body only when resolution changed the model; a
        // passthrough stays byte-identical.
        let outgoing = if llm_req.resolved_target_model != llm_req.model {
            let mut mutated = parsed;
            mutated["model"] = serde_json::Value::String(resolved.clone());
            serde_json::to_vec(&mutated)?
        } else {
            msg.body.clone()
        };

        let pod = self.inner.scheduler.schedule(&llm_req)?;
        info!(
            request = %ctx.correlation_id,
            model = %llm_req.model,
            target_model = %llm_req.resolved_target_model,
            endpoint = %pod.address,
            "Request handled"
        );

        ctx.model = requested;
        ctx.resolved_target_model = resolved;
        ctx.request_size = msg.body.len();
        ctx.target_pod = Some(pod.clone());

        // The Content-Length header must track the mutated body.
        let set_headers = vec![
            headers::set(
                self.inner.target_endpoint_key.clone(),
                pod.address.clone().into_bytes(),
            ),
            headers::set("Content-Length", outgoing.len().to_string().into_bytes()),
        ];

        Ok(ProcessingResponse {
            response: Some(processing_response::Response::RequestBody(BodyResponse {
                response: Some(CommonResponse {
                    header_mutation: Some(HeaderMutation {
                        set_headers,
                        remove_headers: Vec::new(),
                    }),
                    body_mutation: Some(BodyMutation {
                        mutation: Some(body_mutation::Mutation::Body(outgoing)),
                    }),
                    ..Default::default()
                }),
            })),
            dynamic_metadata: Some(metadata::string_entry(
                self.inner.target_endpoint_key.clone(),
                pod.address,
            )),
        })
    }

    /// Response headers are observed for token counts only.
    fn handle_response_headers(
        &self,
        ctx: &mut RequestContext,
        msg: &HttpHeaders,
    ) -> ProcessingResponse {
        let map = msg.headers.as_ref();
        if let Some(count) = headers::find(map, INPUT_TOKENS_HEADER) {
            ctx.input_tokens = count.parse().unwrap_or(0);
        }
        if let Some(count) = headers::find(map, OUTPUT_TOKENS_HEADER) {
            ctx.output_tokens = count.parse().unwrap_or(0);
        }

        ProcessingResponse {
            response: Some(processing_response::Response::ResponseHeaders(
                HeadersResponse {
                    response: Some(CommonResponse::default()),
                },
            )),
            dynamic_metadata: None,
        }
    }

    /// Response body chunks accumulate size; the final chunk yields token
    /// usage and triggers metric recording.
    fn handle_response_body(
        &self,
        ctx: &mut RequestContext,
        msg: &HttpBody,
    ) -> ProcessingResponse {
        ctx.response_size += msg.body.len();
        ctx.response_buffer.extend_from_slice(&msg.body);

        if msg.end_of_stream {
            observe_usage(ctx);
            self.finalize(ctx);
        }

        ProcessingResponse {
            response: Some(processing_response::Response::ResponseBody(BodyResponse {
                response: Some(CommonResponse::default()),
            })),
            dynamic_metadata: None,
        }
    }

    /// Record the stream's metrics exactly once, with the best-known labels.
    /// Called at stream end, whether the request succeeded or not.
    pub fn finalize(&self, ctx: &mut RequestContext) {
        if ctx.recorded {
            return;
        }
        ctx.recorded = true;

        let metrics = gate_metrics::registered();
        let model = ctx.model.as_str();
        let target = if ctx.resolved_target_model.is_empty() {
            model
        } else {
            ctx.resolved_target_model.as_str()
        };

        if ctx.target_pod.is_some() {
            metrics.record_request(model, target);
        }
        if ctx.request_size > 0 {
            metrics.record_request_size(model, target, ctx.request_size);
        }
        if let Err(e) =
            metrics.record_request_latency(model, target, ctx.request_received, Instant::now())
        {
            debug!(request = %ctx.correlation_id, error = %e, "Skipping latency sample");
        }
        if ctx.response_size > 0 {
            metrics.record_response_size(model, target, ctx.response_size);
        }
        metrics.record_input_tokens(model, target, ctx.input_tokens);
        metrics.record_output_tokens(model, target, ctx.output_tokens);
    }
}

/// Fill token counts from the OpenAI-style `usage` object when the response
/// headers did not already carry them.
fn observe_usage(ctx: &mut RequestContext) {
    if ctx.input_tokens > 0 && ctx.output_tokens > 0 {
        return;
    }
    let Ok(value) = serde_json::from_slice::<serde_json::Value>(&ctx.response_buffer) else {
        return;
    };
    let Some(usage) = value.get("usage") else {
        return;
    };
    if ctx.input_tokens == 0 {
        ctx.input_tokens = usage
            .get("prompt_tokens")
            .and_then(serde_json::Value::as_u64)
            .unwrap_or(0);
    }
    if ctx.output_tokens == 0 {
        ctx.output_tokens = usage
            .get("completion_tokens")
            .and_then(serde_json::Value::as_u64)
            .unwrap_or(0);
    }
}
