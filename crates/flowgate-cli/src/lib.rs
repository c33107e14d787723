//! Flowgate CLI — command implementations shared by the `flowgate` binary
//! and its integration tests.

pub mod commands;
