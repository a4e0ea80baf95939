//! Requests backed by the service's transport

use super::{RequestCompletionHandler, RequestDelegate, RequestProgress, ResponseInfo};
use crate::entity::Entity;
use crate::error::{Cause, RequestError};
use crate::resource::Resource;
use crate::transport::{TransportError, TransportRequest, TransportResponse, TransportTask};
use http::{Method, StatusCode};
use std::cell::RefCell;
use std::rc::Rc;
use std::time::Duration;
use tokio::sync::oneshot;

/// Builds the transport request; re-run for every repeat
pub(crate) type RequestBuilder = Rc<dyn Fn() -> TransportRequest>;

pub(crate) struct NetworkRequestDelegate {
    resource: Resource,
    builder: RequestBuilder,
    underlying: TransportRequest,
    progress: RefCell<RequestProgress>,
    task: RefCell<Option<Box<dyn TransportTask>>>,
    reporting_interval: Duration,
}

impl NetworkRequestDelegate {
    pub(crate) fn new(resource: Resource, builder: RequestBuilder) -> Self {
        let underlying = builder();
        let reporting_interval = resource
            .configuration_for(&underlying.method)
            .progress_reporting_interval;
        Self {
            progress: RefCell::new(RequestProgress::new(underlying.method == Method::GET)),
            resource,
            builder,
            underlying,
            task: RefCell::new(None),
            reporting_interval,
        }
    }

    /// The request as it will be sent, after every mutation
    pub(crate) fn underlying(&self) -> &TransportRequest {
        &self.underlying
    }
}

impl RequestDelegate for NetworkRequestDelegate {
    fn start_underlying_operation(&self, completion_handler: RequestCompletionHandler) {
        tracing::debug!("{} {}", self.underlying.method, self.underlying.url);

        let (tx, rx) = oneshot::channel();
        let transport = self.resource.transport();
        let task = transport.start_request(
            self.underlying.clone(),
            Box::new(move |result| {
                let _ = tx.send(result);
            }),
        );
        *self.task.borrow_mut() = Some(task);

        let resource = self.resource.clone();
        let method = self.underlying.method.clone();
        let description = self.request_description();
        tokio::task::spawn_local(async move {
            let result = rx.await.unwrap_or_else(|_| {
                Err(TransportError::Internal(
                    "Transport dropped the request without completing it".to_string(),
                ))
            });
            handle_response(resource, method, description, completion_handler, result).await;
        });
    }

    fn cancel_underlying_operation(&self) {
        if let Some(task) = self.task.borrow().as_ref() {
            task.cancel();
        }
    }

    fn repeated(&self) -> Rc<dyn RequestDelegate> {
        Rc::new(NetworkRequestDelegate::new(
            self.resource.clone(),
            self.builder.clone(),
        ))
    }

    fn request_description(&self) -> String {
        format!("{} {}", self.underlying.method, self.underlying.url)
    }

    fn compute_progress(&self) -> f64 {
        let task = self.task.borrow();
        let Some(task) = task.as_ref() else {
            return 0.0;
        };
        let mut progress = self.progress.borrow_mut();
        progress.update(task.transfer_metrics());
        progress.fraction_done()
    }

    fn progress_reporting_interval(&self) -> Duration {
        self.reporting_interval
    }
}

async fn handle_response(
    resource: Resource,
    method: Method,
    description: String,
    completion_handler: RequestCompletionHandler,
    result: Result<TransportResponse, TransportError>,
) {
    match &result {
        Ok(response) => tracing::debug!("{} ← {}", response.status, description),
        Err(error) => tracing::debug!("{} ← {}", error, description),
    }

    let raw = interpret_response(&resource, result);
    if completion_handler.will_ignore(&raw) {
        return;
    }
    if !raw.is_new {
        completion_handler.broadcast_response(raw);
        return;
    }

    // the pipeline follows the method actually sent, which mutations may have changed
    let processor = resource
        .configuration_for(&method)
        .pipeline
        .make_processor(raw.response, &resource);
    let processed = match tokio::task::spawn_blocking(processor).await {
        Ok(processed) => processed,
        Err(error) => {
            tracing::warn!("Response processing for {} failed: {}", description, error);
            Err(RequestError::with_message("Cannot parse server response", None))
        }
    };

    let info = ResponseInfo::new(processed);
    if completion_handler.will_ignore(&info) {
        return;
    }
    completion_handler.broadcast_response(info);
}

fn interpret_response(
    resource: &Resource,
    result: Result<TransportResponse, TransportError>,
) -> ResponseInfo {
    let response = match result {
        Ok(response) => response,
        Err(error) => return ResponseInfo::failure(RequestError::from(error)),
    };

    if response.status == StatusCode::NOT_MODIFIED {
        return match resource.latest_data() {
            Some(entity) => ResponseInfo::not_modified(entity),
            None => ResponseInfo::failure(RequestError::new(
                None,
                Some(response.status),
                None,
                Some(Cause::NoLocalDataFor304),
            )),
        };
    }

    let entity = Entity::from_response(response.headers, response.body);
    if response.status.as_u16() >= 400 {
        ResponseInfo::failure(RequestError::from_status(response.status, Some(entity)))
    } else {
        ResponseInfo::new(Ok(entity))
    }
}
