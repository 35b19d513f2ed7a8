//! Driver core for an SPI-attached ultra-wideband transceiver.
//!
//! The crate owns the register transport, the device lifecycle and the
//! two-way-ranging machinery of the radio:
//!
//! - [`Device`] frames SPI command headers and moves bytes to and from the
//!   memory-mapped register file, including the TX/RX buffers and the
//!   40-bit timestamps.
//! - the ranging engine ([`rng`]) runs the single-sided and double-sided
//!   exchange state machines with on-device timed responses.
//! - the scheduler ([`range`], feature `range`) ranges round-robin against
//!   a peer list and hands completed rounds to a post-processor.
//! - the glue layer ([`lowpan`], feature `lowpan`) is the
//!   packet-in/packet-out seam towards an IPv6-over-UWB stack.
//!
//! The driver is event-driven: wire the radio IRQ to
//! [`Dw1000::handle_interrupt`] and drive periodic work from the
//! application timer. PHY and MAC parameter programming, board wiring and
//! provisioning live outside this crate; the [`Board`] trait is the seam
//! towards the board support code.

#![cfg_attr(not(test), no_std)]

extern crate alloc;

mod dev;
mod error;
pub mod ext;
mod hal;
#[cfg(feature = "lowpan")]
pub mod lowpan;
#[cfg(feature = "range")]
pub mod range;
pub mod regs;
pub mod rng;
mod synch;
pub mod time;

use alloc::boxed::Box;

use embedded_hal::spi::SpiDevice;

pub use crate::dev::{Control, Device, DeviceStatus, SleepMode, WakeMode};
pub use crate::error::Error;
pub use crate::ext::Callbacks;
pub use crate::hal::{Baudrate, Board};
#[cfg(feature = "lowpan")]
pub use crate::lowpan::{Lowpan, NetStatus};
#[cfg(feature = "range")]
pub use crate::range::Range;
use crate::regs::SysStatus;
pub use crate::rng::{RngConfig, RngMode, Twr, TwrFrame};
pub use crate::synch::Semaphore;

/// One UWB transceiver with its ranging subsystems.
///
/// The handle exclusively owns the device plus the engine, scheduler and
/// glue sub-instances, so the interrupt dispatch can walk all of them
/// without shared state.
pub struct Dw1000<SPI: SpiDevice, B: Board> {
	pub(crate) dev: Device<SPI, B>,
	pub(crate) twr: Option<Twr>,
	#[cfg(feature = "range")]
	pub(crate) range: Option<Range>,
	#[cfg(feature = "lowpan")]
	pub(crate) lowpan: Option<Lowpan>,
	pub(crate) ext: ext::Registry<SPI, B>,
	pub(crate) rng_complete_cb: Option<Box<dyn FnMut(&Twr)>>,
	pub(crate) tx_final_cb: Option<Box<dyn FnMut(&mut TwrFrame)>>,
	pub(crate) range_bias_cb: Option<fn(f32) -> f32>,
	#[cfg(feature = "range")]
	pub(crate) postprocess_cb: Option<Box<dyn FnMut(&Range)>>,
	#[cfg(feature = "lowpan")]
	pub(crate) lowpan_input: Option<Box<dyn FnMut(&[u8])>>,
}

impl<SPI, B> Dw1000<SPI, B>
where
	SPI: SpiDevice,
	B: Board,
{
	/// Creates the driver from the bus and the board wiring.
	pub fn new(spi: SPI, board: B) -> Self {
		Self {
			dev: Device::new(spi, board),
			twr: None,
			#[cfg(feature = "range")]
			range: None,
			#[cfg(feature = "lowpan")]
			lowpan: None,
			ext: ext::Registry::new(),
			rng_complete_cb: None,
			tx_final_cb: None,
			range_bias_cb: None,
			#[cfg(feature = "range")]
			postprocess_cb: None,
			#[cfg(feature = "lowpan")]
			lowpan_input: None,
		}
	}

	/// Probes and configures the transceiver.
	pub fn config(&mut self) -> Result<(), Error<SPI::Error>> {
		self.dev.config()
	}

	/// Tears the driver down, returning the bus and board.
	pub fn free(self) -> (SPI, B) {
		self.dev.free()
	}

	/// Device handle.
	pub fn dev(&self) -> &Device<SPI, B> {
		&self.dev
	}

	/// Device handle, mutable.
	pub fn dev_mut(&mut self) -> &mut Device<SPI, B> {
		&mut self.dev
	}

	/// Installs the hook fired when a ranging exchange completes.
	pub fn on_rng_complete(&mut self, cb: impl FnMut(&Twr) + 'static) {
		self.rng_complete_cb = Some(Box::new(cb));
	}

	/// Installs the hook that fills the extended final payload right
	/// before it is transmitted.
	pub fn on_tx_final(&mut self, cb: impl FnMut(&mut TwrFrame) + 'static) {
		self.tx_final_cb = Some(Box::new(cb));
	}

	/// Appends an extension-callback entry with a stable id at the tail
	/// of the chain.
	pub fn add_callbacks(&mut self, id: u16, cbs: impl Callbacks<SPI, B> + 'static) {
		self.ext.add(id, Box::new(cbs));
	}

	/// Removes the first extension entry with a matching id; unknown ids
	/// are a no-op.
	pub fn remove_callbacks(&mut self, id: u16) {
		self.ext.remove(id);
	}

	/// Position of an extension entry in the dispatch order.
	pub fn callbacks_position(&self, id: u16) -> Option<usize> {
		self.ext.position(id)
	}

	/// Drains the device status word and dispatches the pending events.
	///
	/// Call this from the radio IRQ (or an event loop polling it). Good
	/// ranging frames drive the engine state machines; everything else
	/// goes to the glue layer and down the extension chain.
	pub fn handle_interrupt(&mut self) -> Result<(), Error<SPI::Error>> {
		loop {
			let status = self.dev.read_status()?;
			let events = status
				& (SysStatus::TXFRS
					| SysStatus::RXFCG
					| SysStatus::RXRFTO
					| SysStatus::ALL_RX_ERR);
			if events.is_empty() {
				return Ok(());
			}
			if events.contains(SysStatus::TXFRS) {
				self.dev.clear_events(SysStatus::TXFRS)?;
				self.rng_tx_complete();
			}
			if events.contains(SysStatus::RXFCG) {
				self.dev.clear_events(SysStatus::RXFCG | SysStatus::RXDFR)?;
				self.dev.fetch_rx_info()?;
				self.rng_rx_complete()?;
			}
			if events.contains(SysStatus::RXRFTO) {
				self.dev.clear_events(SysStatus::RXRFTO)?;
				self.dev.status.insert(DeviceStatus::RX_TIMEOUT_ERROR);
				self.rng_rx_timeout()?;
			}
			if events.intersects(SysStatus::ALL_RX_ERR) {
				self.dev.clear_events(SysStatus::ALL_RX_ERR)?;
				self.dev.status.insert(DeviceStatus::RX_ERROR);
				self.rng_rx_error()?;
			}
		}
	}

	/// Routes a frame the ranging engine does not own: the glue layer
	/// first, then the extension chain; with no consumer at all the
	/// receiver is re-armed from the saved control snapshot.
	pub(crate) fn forward_rx_complete(&mut self) -> Result<(), Error<SPI::Error>> {
		let consumed = self.lowpan_rx_deliver()?;
		let had_extensions = !self.ext.is_empty();
		self.ext_rx_complete();
		if !consumed && !had_extensions && self.dev.restart_rx().is_err() {
			self.rng_rx_error()?;
		}
		Ok(())
	}

	// The extension chain is dispatched over a temporarily detached entry
	// vector; entries get the device handle, never the registry, so the
	// chain is structurally unchanged when the walk returns.

	pub(crate) fn ext_rx_complete(&mut self) {
		let mut entries = core::mem::take(&mut self.ext.entries);
		for entry in &mut entries {
			entry.cbs.rx_complete(&mut self.dev);
		}
		self.ext.entries = entries;
	}

	pub(crate) fn ext_tx_complete(&mut self) {
		let mut entries = core::mem::take(&mut self.ext.entries);
		for entry in &mut entries {
			entry.cbs.tx_complete(&mut self.dev);
		}
		self.ext.entries = entries;
	}

	pub(crate) fn ext_rx_timeout(&mut self) {
		let mut entries = core::mem::take(&mut self.ext.entries);
		for entry in &mut entries {
			entry.cbs.rx_timeout(&mut self.dev);
		}
		self.ext.entries = entries;
	}

	pub(crate) fn ext_rx_error(&mut self) {
		let mut entries = core::mem::take(&mut self.ext.entries);
		for entry in &mut entries {
			entry.cbs.rx_error(&mut self.dev);
		}
		self.ext.entries = entries;
	}

	pub(crate) fn ext_tx_error(&mut self) {
		let mut entries = core::mem::take(&mut self.ext.entries);
		for entry in &mut entries {
			entry.cbs.tx_error(&mut self.dev);
		}
		self.ext.entries = entries;
	}
}

#[cfg(not(feature = "range"))]
impl<SPI, B> Dw1000<SPI, B>
where
	SPI: SpiDevice,
	B: Board,
{
	pub(crate) fn range_on_rng_complete(&mut self) {}
	pub(crate) fn range_on_rng_error(&mut self) {}
}

#[cfg(not(feature = "lowpan"))]
impl<SPI, B> Dw1000<SPI, B>
where
	SPI: SpiDevice,
	B: Board,
{
	pub(crate) fn lowpan_rx_deliver(&mut self) -> Result<bool, Error<SPI::Error>> {
		Ok(false)
	}
	pub(crate) fn lowpan_on_tx_complete(&mut self) {}
	pub(crate) fn lowpan_on_rx_timeout(&mut self) {}
	pub(crate) fn lowpan_on_rx_error(&mut self) {}
}
