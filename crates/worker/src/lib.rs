// Sample orchestrations hosted by the taskhub worker binary
// Decision: Samples are typed Orchestrator/Activity impls so they double as API usage docs

pub mod samples;

pub use samples::register_samples;
