//! Inter-process communication.

pub mod pipe;
