//! Core Fusion Engine Modules

pub mod fusion;
