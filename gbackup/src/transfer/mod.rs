//! Transfer bookkeeping shared by the remote stores.

pub mod progress;

pub use progress::ProgressCallback;
