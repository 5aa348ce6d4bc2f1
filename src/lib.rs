//! Device lifecycle daemon: bootstrap of the tracing stack, configuration,
//! adapter wiring and the periodic ensure loop.

pub mod bootstrap;
