/*!
 * Built-in device families.
 */
pub mod arduino;
pub mod esp32;
pub mod riorand;

pub use arduino::{ArduinoCommand, ArduinoDecoder, ArduinoDriver, ArduinoProtocol};
pub use esp32::{Esp32Command, Esp32Decoder, Esp32Driver, Esp32Protocol};
pub use riorand::{RelayCommand, RioRandDecoder, RioRandDriver, RioRandProtocol};
