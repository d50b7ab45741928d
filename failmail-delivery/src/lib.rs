//! The upstream side of the pipeline: the composable sink chain rendered
//! summaries are forwarded through, and the pump that drives it with a
//! failure spool.

pub mod pump;
pub mod upstream;

pub use pump::pump;
pub use upstream::{
    build_upstream, DebugUpstream, ExecUpstream, LiveUpstream, MaildirUpstream, MultiUpstream,
    RecordingUpstream, Upstream, UpstreamError,
};
