//! End-to-end tests over the in-memory stores and the test provider.

mod engine_scenarios;
mod support;
