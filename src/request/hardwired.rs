use super::{RequestCompletionHandler, RequestDelegate, ResponseInfo};
use std::rc::Rc;

/// Completes immediately with a fixed outcome
pub(super) struct HardWiredRequestDelegate {
    response: ResponseInfo,
}

impl HardWiredRequestDelegate {
    pub(super) fn new(response: ResponseInfo) -> Self {
        Self { response }
    }
}

impl RequestDelegate for HardWiredRequestDelegate {
    fn start_underlying_operation(&self, completion_handler: RequestCompletionHandler) {
        completion_handler.broadcast_response(self.response.clone());
    }

    fn cancel_underlying_operation(&self) {}

    fn repeated(&self) -> Rc<dyn RequestDelegate> {
        Rc::new(Self::new(self.response.clone()))
    }

    fn request_description(&self) -> String {
        match &self.response.response {
            Ok(_) => "Hard-wired success".to_string(),
            Err(error) => format!("Hard-wired failure: {}", error.user_message),
        }
    }
}
