use crate::search::{Coverage, DispatchResult, ErrorMessage};

/// Never touches the network; answers with a prepared error.
pub(crate) struct ErrorInvoker {
    message: ErrorMessage,
    coverage: Coverage,
}

impl ErrorInvoker {
    pub(crate) fn new(message: ErrorMessage, nodes_tried: u32) -> Self {
        Self {
            message,
            coverage: Coverage::none_answered(nodes_tried),
        }
    }

    pub(crate) fn result(&self) -> DispatchResult {
        DispatchResult::from_error(self.message.clone(), self.coverage)
    }
}
