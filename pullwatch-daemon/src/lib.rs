//! pullwatch agent runtime: delivery loop + ticker + control socket.

pub mod delivery;
mod error;
pub mod paths;
pub mod protocol;
mod runtime;
pub mod ticker;

pub use delivery::{
    CategoryReport, CategoryStatus, DeliveryEvent, DeliveryLoop, LoopOptions, TickReport,
    DEFAULT_INTERVAL,
};
pub use error::DaemonError;
pub use protocol::{
    request_poll, request_status, request_stop, ControlClient, ControlCommand, DaemonRequest,
    DaemonResponse,
};
pub use runtime::{build_loop, run, run_once, serve, start_blocking, RunOptions};
pub use ticker::{Tick, TickCause, Ticker};
