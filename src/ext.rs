//! Extension-callback registry.
//!
//! Subsystems that want to see traffic the ranging engine does not own
//! register an entry here. Entries are dispatched in insertion order and
//! the registry is structurally unchanged after every dispatch, so no
//! handler can observe a half-walked chain.

use alloc::boxed::Box;
use alloc::vec::Vec;

use embedded_hal::spi::SpiDevice;

use crate::dev::Device;
use crate::hal::Board;

/// Per-subsystem event handlers.
///
/// Every method defaults to a no-op; an extension overrides what it cares
/// about. Handlers receive the device handle so they can read buffers or
/// re-arm the receiver, but not the engine state of other subsystems.
pub trait Callbacks<SPI: SpiDevice, B: Board> {
	/// A good frame not owned by the ranging engine arrived.
	fn rx_complete(&mut self, _dev: &mut Device<SPI, B>) {}
	/// A transmission completed.
	fn tx_complete(&mut self, _dev: &mut Device<SPI, B>) {}
	/// The receive watchdog expired.
	fn rx_timeout(&mut self, _dev: &mut Device<SPI, B>) {}
	/// The receiver reported a CRC or PHY failure.
	fn rx_error(&mut self, _dev: &mut Device<SPI, B>) {}
	/// A transmit start was rejected.
	fn tx_error(&mut self, _dev: &mut Device<SPI, B>) {}
}

pub(crate) struct Entry<SPI: SpiDevice, B: Board> {
	pub id: u16,
	pub cbs: Box<dyn Callbacks<SPI, B>>,
}

/// Ordered registry of extension entries, keyed by a stable 16-bit id.
pub(crate) struct Registry<SPI: SpiDevice, B: Board> {
	pub entries: Vec<Entry<SPI, B>>,
}

impl<SPI: SpiDevice, B: Board> Registry<SPI, B> {
	pub const fn new() -> Self {
		Self { entries: Vec::new() }
	}

	/// Appends an entry at the tail of the chain.
	pub fn add(&mut self, id: u16, cbs: Box<dyn Callbacks<SPI, B>>) {
		self.entries.push(Entry { id, cbs });
	}

	/// Unlinks the first entry with a matching id; absent ids are a no-op.
	pub fn remove(&mut self, id: u16) {
		if let Some(pos) = self.position(id) {
			self.entries.remove(pos);
		}
	}

	/// Index of the first entry with a matching id.
	pub fn position(&self, id: u16) -> Option<usize> {
		self.entries.iter().position(|entry| entry.id == id)
	}

	pub fn is_empty(&self) -> bool {
		self.entries.is_empty()
	}
}
