//! ChainKVM robot edge agent.
//!
//! The agent sits between the gateway's signaling channel and the robot
//! hardware. Its job is narrow and adversarial: no control message moves the
//! robot unless a signed capability token says it may, and any of five
//! independent failure signals drives the hardware to a safe stop exactly
//! once, however many of them fire at the same time.

pub mod agent;
pub mod config;
pub mod control;
pub mod safety;
pub mod session;
pub mod signaling;
