//! # gate-proto
//!
//! Protocol buffer definitions and generated gRPC bindings for infergate.
//!
//! This crate provides the Envoy `ExternalProcessor` streaming service and
//! the `envoy.config.core.v3` header types it exchanges, generated by
//! tonic-build from a wire-compatible subset of the published protos.

// Generated protobuf code
pub mod envoy {
    pub mod config {
        pub mod core {
            pub mod v3 {
                tonic::include_proto!("envoy.config.core.v3");
            }
        }
    }

    pub mod service {
        pub mod ext_proc {
            pub mod v3 {
                tonic::include_proto!("envoy.service.ext_proc.v3");
            }
        }
    }
}

// Re-export commonly used types for convenience (both server and client)
pub use envoy::config::core::v3::{HeaderMap, HeaderValue, HeaderValueOption};
pub use envoy::service::ext_proc::v3::{
    external_processor_client::ExternalProcessorClient,
    external_processor_server::{ExternalProcessor, ExternalProcessorServer},
    processing_request, processing_response, body_mutation, BodyMutation, BodyResponse,
    CommonResponse, HeaderMutation, HeadersResponse, HttpBody, HttpHeaders, HttpTrailers,
    ProcessingRequest, ProcessingResponse, TrailersResponse,
};

/// Utility functions for working with Envoy header maps
pub mod headers {
    use super::{HeaderMap, HeaderValue, HeaderValueOption};

    /// Look up a header by case-insensitive key, decoding either the string
    /// or the raw-bytes representation Envoy may send.
    pub fn find(map: Option<&HeaderMap>, key: &str) -> Option<String> {
        let map = map?;
        map.headers
            .iter()
            .find(|h| h.key.eq_ignore_ascii_case(key))
            .map(value_of)
    }

    /// Decode a header's value, preferring the string field and falling back
    /// to the raw-bytes field.
    pub fn value_of(header: &HeaderValue) -> String {
        if !header.value.is_empty() {
            header.value.clone()
        } else {
            String::from_utf8_lossy(&header.raw_value).into_owned()
        }
    }

    /// Build a set-header instruction carrying the value as raw bytes, the
    /// form the proxy accepts for mutations.
    pub fn set(key: impl Into<String>, value: impl Into<Vec<u8>>) -> HeaderValueOption {
        HeaderValueOption {
            header: Some(HeaderValue {
                key: key.into(),
                value: String::new(),
                raw_value: value.into(),
            }),
        }
    }
}

/// Utility functions for building dynamic-metadata structs
pub mod metadata {
    use prost_types::{value::Kind, Struct, Value};

    /// A one-entry string struct, the shape used to mirror the chosen
    /// endpoint into dynamic metadata.
    pub fn string_entry(key: impl Into<String>, value: impl Into<String>) -> Struct {
        let mut fields = std::collections::BTreeMap::new();
        fields.insert(
            key.into(),
            Value {
                kind: Some(Kind::StringValue(value.into())),
            },
        );
        Struct { fields }
    }
}
