use crate::config::Settings;
use crate::frontend::{ErrorKind, ErrorReport, Frontend, Notice};
use crate::readiness::{Ready, ReadinessSet};
use crate::task::TaskFailure;

/// What every state machine needs while it is being ticked.
pub struct Ctx<'a> {
    pub frontend: &'a mut dyn Frontend,
    pub readiness: &'a mut ReadinessSet,
    pub ready: &'a Ready,
    pub settings: &'a Settings,
}

impl<'a> Ctx<'a> {
    pub fn info(&mut self, message: impl Into<String>) {
        self.frontend.notify(&Notice::new(message));
    }

    pub fn error(&mut self, kind: ErrorKind, message: impl Into<String>) {
        self.frontend.error(&ErrorReport::new(kind, message));
    }

    pub fn io_error(&mut self, kind: ErrorKind, op: &'static str, err: &std::io::Error) {
        self.frontend
            .error(&ErrorReport::new(kind, err.to_string()).with_op(op, err.raw_os_error()));
    }

    pub fn failure(&mut self, context: &str, failure: &TaskFailure) {
        self.frontend.error(&ErrorReport::from_failure(context, failure));
    }
}
