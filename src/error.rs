use thiserror::Error;

/// Errors surfaced by the driver core.
///
/// Hardware-reported conditions (receive errors, timeouts) are additionally
/// latched in the device status word so that completion handlers can
/// inspect them after the fact.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum Error<E> {
	/// The SPI transfer itself failed.
	#[error("SPI transfer failed")]
	Spi(E),
	/// The device id probe missed on every attempt.
	#[error("device id probe timed out")]
	Timeout,
	/// The transceiver rejected the transmit start.
	#[error("transmit start rejected")]
	StartTx,
	/// An exchange is already in flight on this device.
	#[error("exchange already in flight")]
	Busy,
	/// The addressed subsystem has not been initialized.
	#[error("subsystem not initialized")]
	Uninitialized,
	/// A register access violated the 6-bit record / 15-bit sub-index bounds.
	#[error("register access out of bounds")]
	InvalidOperand,
}
