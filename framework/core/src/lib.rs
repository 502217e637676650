mod context;
mod poll;
mod shutdown;

pub mod prelude {
    pub use crate::context::{ContextDone, RunContext};
    pub use crate::poll::{
        Converged, ConvergenceTimeout, PollStatus, Poller, DEFAULT_POLL_INTERVAL,
    };
    pub use crate::shutdown::{DelegatedShutdownListener, ShutdownHandle};
}
