//! Board wiring the transceiver needs beyond the SPI bus itself.

use embedded_hal::delay::DelayNs;

/// SPI baud-rate classes of the transceiver.
///
/// The chip must be probed below 3 MHz while its clock PLL is still
/// settling; once configured it accepts the full rate.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Baudrate {
	/// Probe rate, safe before the clock PLL has locked.
	Low,
	/// Full operating rate.
	High,
}

/// Out-of-band wiring of the transceiver: reset line, wake-up line and the
/// bus clock. These are board specifics that the SPI device abstraction
/// does not model, so the board support code supplies them.
pub trait Board: DelayNs {
	/// Pulse the RESET line and wait for the chip to come back up.
	fn hard_reset(&mut self);

	/// Issue a hardware wake-up, either via the WAKEUP pin or by holding
	/// chip select low for the required period.
	fn wakeup(&mut self);

	/// Reconfigure the SPI clock for the given rate class.
	fn set_baudrate(&mut self, baudrate: Baudrate);
}
