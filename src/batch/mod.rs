mod dispatcher;
mod status;
pub mod tracker;

pub use dispatcher::{submit_batch, BatchSubmission, SubmitBatchRequest};
pub use status::get_batch_status;
