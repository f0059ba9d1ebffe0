//! Collection of mocks used to test `pbft`.

pub mod application;
pub mod mutator;
pub mod network;
