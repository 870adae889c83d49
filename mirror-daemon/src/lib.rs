//! trackmirror daemon: ftrack HTTP adapter, control socket, and the runtime
//! that drives the sync dispatcher.

mod error;
pub mod http;
pub mod paths;
pub mod protocol;
mod runtime;

pub use error::DaemonError;
pub use http::FtrackHttpAdapter;
pub use protocol::{
    request_status, request_stop, send_request, ControlClient, DaemonCommand, DaemonRequest,
    DaemonResponse,
};
pub use runtime::{init_tracing, run, start_blocking, Backend};
