//! Instrument command vocabularies.
//!
//! These modules only build and parse messages. Transport lives in
//! [`crate::gateway`], sequencing in [`crate::sequencer`].

pub mod mux;
pub mod picoscope;
pub mod pulser;

pub use mux::MuxChannel;
pub use picoscope::PulseParameters;
pub use pulser::{PulserProperties, PulserSetup};
