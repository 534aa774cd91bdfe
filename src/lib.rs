#[macro_use]
extern crate log;
extern crate bincode;
extern crate ndarray;
extern crate rayon;
extern crate serde;

pub mod accel;
pub mod bits;
pub mod conv;
pub mod error;
pub mod image2d;
pub mod network;
pub mod params;
pub mod quantize;
pub mod session;
pub mod shape;
pub mod topology;

pub use crate::accel::{Accelerator, FnAccelerator};
pub use crate::bits::{pack, unpack, ActivationBits, PackedLayout};
pub use crate::error::{QnnError, Result};
pub use crate::network::{Classifier, Detector};
pub use crate::session::{AcceleratorSession, SessionConfig, SessionState};
