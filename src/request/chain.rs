use super::{Request, RequestCompletionHandler, RequestDelegate, RequestState, ResponseInfo};
use std::cell::RefCell;
use std::rc::Rc;

/// What a chained request does once the request it wraps completes
pub enum RequestChainAction {
    /// Hand control to another request; its outcome becomes the chain's
    PassTo(Request),
    /// Finish the chain with this outcome
    UseResponse(ResponseInfo),
    /// Finish the chain with the wrapped request's own outcome
    UseThisResponse,
}

type Decision = Rc<dyn Fn(&ResponseInfo) -> RequestChainAction>;

pub(super) struct RequestChainDelegate {
    wrapped: Request,
    when_completed: Decision,
    active: Rc<RefCell<Request>>,
}

impl RequestChainDelegate {
    pub(super) fn new(wrapped: Request, when_completed: Decision) -> Self {
        Self {
            active: Rc::new(RefCell::new(wrapped.clone())),
            wrapped,
            when_completed,
        }
    }
}

fn start_if_needed(request: &Request) {
    if request.state() == RequestState::NotStarted {
        request.start();
    }
}

impl RequestDelegate for RequestChainDelegate {
    fn start_underlying_operation(&self, completion_handler: RequestCompletionHandler) {
        let when_completed = self.when_completed.clone();
        let active = self.active.clone();

        start_if_needed(&self.wrapped);
        self.wrapped.on_completion(move |info| {
            if completion_handler.will_ignore(info) {
                return;
            }

            match when_completed(info) {
                RequestChainAction::UseThisResponse => {
                    completion_handler.broadcast_response(info.clone())
                }
                RequestChainAction::UseResponse(response) => {
                    completion_handler.broadcast_response(response)
                }
                RequestChainAction::PassTo(next) => {
                    *active.borrow_mut() = next.clone();
                    start_if_needed(&next);
                    next.on_completion(move |info| {
                        completion_handler.broadcast_response(info.clone())
                    });
                }
            }
        });
    }

    fn cancel_underlying_operation(&self) {
        let active = self.active.borrow().clone();
        active.cancel();
    }

    fn repeated(&self) -> Rc<dyn RequestDelegate> {
        Rc::new(RequestChainDelegate::new(
            self.wrapped.repeated(),
            self.when_completed.clone(),
        ))
    }

    fn request_description(&self) -> String {
        format!("Chain[{}]", self.wrapped.description())
    }

    fn compute_progress(&self) -> f64 {
        let active = self.active.borrow().clone();
        active.progress()
    }
}
