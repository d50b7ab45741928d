pub mod harness;

pub use harness::PipelineHarness;
