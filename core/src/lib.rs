//! Adaptive preheat control: learns how fast the house warms and decides
//! when heating has to start to reach the comfort temperature on time.

pub mod arrival;
pub mod config;
pub mod controller;
pub mod cycle;
pub mod host;
pub mod model;
pub mod schedule;
pub mod slope;
pub mod window;
