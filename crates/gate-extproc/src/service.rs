//! tonic service implementation driving the ext-proc stream

use crate::handler::{ExtProcService, RequestContext};
use gate_core::Error;
use gate_proto::{ExternalProcessor, ProcessingRequest, ProcessingResponse};
use tokio_stream::wrappers::ReceiverStream;
use tonic::{Request, Response, Status, Streaming};
use tracing::{debug, warn};

/// Map a handler error onto the gRPC status terminating the stream. The
/// correlation id rides along so gateway logs line up with client reports.
pub fn status_for(err: &Error, correlation_id: &str) -> Status {
    let message = format!("{err} (request {correlation_id})");
    match err {
        Error::InvalidRequest(_) | Error::Json(_) => Status::invalid_argument(message),
        Error::NotFound(_) => Status::not_found(message),
        Error::ResourceExhausted(_) => Status::resource_exhausted(message),
        Error::NotReady(_) | Error::Timeout(_) => Status::unavailable(message),
        _ => Status::internal(message),
    }
}

#[tonic::async_trait]
impl ExternalProcessor for ExtProcService {
    type ProcessStream = ReceiverStream<Result<ProcessingResponse, Status>>;

    async fn process(
        &self,
        request: Request<Streaming<ProcessingRequest>>,
    ) -> Result<Response<Self::ProcessStream>, Status> {
        let mut stream = request.into_inner();
        let (tx, rx) = tokio::sync::mpsc::channel(16);
        let service = self.clone();

        tokio::spawn(async move {
            let mut ctx = RequestContext::new();
            loop {
                match stream.message().await {
                    Ok(Some(msg)) => match service.handle_message(&mut ctx, msg) {
                        Ok(response) => {
                            if tx.send(Ok(response)).await.is_err() {
                                // Proxy went away; metrics still get recorded.
                                break;
                            }
                        }
                        Err(e) => {
                            warn!(
                                request = %ctx.correlation_id,
                                error = %e,
                                "Terminating stream"
                            );
                            let _ = tx.send(Err(status_for(&e, &ctx.correlation_id))).await;
                            break;
                        }
                    },
                    Ok(None) => {
                        debug!(request = %ctx.correlation_id, "Stream closed by proxy");
                        break;
                    }
                    Err(status) => {
                        debug!(
                            request = %ctx.correlation_id,
                            status = %status,
                            "Stream read failed"
                        );
                        break;
                    }
                }
            }
            service.finalize(&mut ctx);
        });

        Ok(Response::new(ReceiverStream::new(rx)))
    }
}
