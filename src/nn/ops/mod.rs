pub mod activations;
pub mod afno;
pub mod fft;
pub mod instancenorm;
pub mod linear;
pub mod utils;

pub use afno::Afno2d;
pub use instancenorm::InstanceNorm2d;
pub use linear::Conv1x1;
pub use utils::{normal_, randn};
