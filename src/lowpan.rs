//! Packet glue towards a 6LoWPAN-like upper layer.
//!
//! The crate does not implement the network stack; it exposes the
//! downward [`Dw1000::ll_output`] path into the transmit buffer and stages
//! received frames into a bounded ring for the upward input hook. A
//! counting semaphore sized to the ring provides backpressure against a
//! slow consumer.

use alloc::vec;
use alloc::vec::Vec;

use embedded_hal::spi::SpiDevice;
use log::trace;

use crate::error::Error;
use crate::hal::Board;
use crate::synch::Semaphore;
use crate::Dw1000;

/// Status set the upper layer understands.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NetStatus {
	/// The packet was handed to the radio.
	Ok,
	/// A receive operation ran into its timeout.
	Timeout,
	/// The previous transmission has not confirmed yet.
	InProgress,
}

bitflags::bitflags! {
	/// Status word of the glue layer.
	#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
	pub struct LowpanStatus: u8 {
		const START_TX_ERROR = 1 << 0;
		const RX_ERROR = 1 << 1;
		const RX_TIMEOUT_ERROR = 1 << 2;
		const REQUEST_TIMEOUT = 1 << 3;
	}
}

/// Glue-layer instance: the staging ring and its bookkeeping.
pub struct Lowpan {
	nframes: u16,
	buf_len: u16,
	buf_idx: u16,
	bufs: Vec<Vec<u8>>,
	/// Serializes writers; released by the TX confirmation.
	sem: Semaphore,
	/// Backpressure permits, one per staging buffer.
	data_sem: Semaphore,
	pub(crate) status: LowpanStatus,
	tx_in_flight: bool,
	rx_pending: bool,
}

impl Lowpan {
	fn new(nframes: u16, buf_len: u16) -> Self {
		assert!(nframes > 0);
		Self {
			nframes,
			buf_len,
			buf_idx: 0,
			bufs: vec![vec![0; usize::from(buf_len)]; usize::from(nframes)],
			sem: Semaphore::new(1),
			data_sem: Semaphore::new(nframes),
			status: LowpanStatus::empty(),
			tx_in_flight: false,
			rx_pending: false,
		}
	}

	/// Glue status word.
	pub fn status(&self) -> LowpanStatus {
		self.status
	}

	/// Free backpressure permits.
	pub fn free_buffers(&self) -> u16 {
		self.data_sem.available()
	}
}

impl<SPI, B> Dw1000<SPI, B>
where
	SPI: SpiDevice,
	B: Board,
{
	/// Initializes the glue layer with `nframes` staging buffers of
	/// `buf_len` bytes each.
	pub fn lowpan_init(&mut self, nframes: u16, buf_len: u16) {
		self.lowpan = Some(Lowpan::new(nframes, buf_len));
	}

	/// Glue-layer instance, if initialized.
	pub fn lowpan(&self) -> Option<&Lowpan> {
		self.lowpan.as_ref()
	}

	/// Installs the upward input hook receiving staged frames.
	pub fn on_lowpan_input(&mut self, cb: impl FnMut(&[u8]) + 'static) {
		self.lowpan_input = Some(alloc::boxed::Box::new(cb));
	}

	/// Downward output path: serialize `packet` into the transmit buffer
	/// and start the radio.
	///
	/// The driver conditions collapse onto the upper layer's status set: a
	/// write overtaking the previous confirmation reports
	/// [`NetStatus::InProgress`], an expired receive watchdog
	/// [`NetStatus::Timeout`].
	pub fn ll_output(&mut self, packet: &[u8]) -> Result<NetStatus, Error<SPI::Error>> {
		let lowpan = self.lowpan.as_mut().ok_or(Error::Uninitialized)?;
		if !lowpan.sem.try_acquire() {
			lowpan.status.insert(LowpanStatus::REQUEST_TIMEOUT);
		} else {
			lowpan
				.status
				.remove(LowpanStatus::REQUEST_TIMEOUT | LowpanStatus::START_TX_ERROR);
			self.dev.write_tx(packet, 0)?;
			self.dev.write_tx_fctrl(packet.len() as u16, 0, false)?;
			match self.dev.start_tx() {
				Ok(()) => {
					let lowpan = self.lowpan.as_mut().unwrap();
					lowpan.tx_in_flight = true;
					trace!("ll_output, {} bytes", packet.len());
				}
				Err(Error::StartTx) => {
					let lowpan = self.lowpan.as_mut().unwrap();
					lowpan.status.insert(LowpanStatus::START_TX_ERROR);
					lowpan.sem.release();
				}
				Err(err) => return Err(err),
			}
		}
		let lowpan = self.lowpan.as_ref().unwrap();
		let mut status = NetStatus::Ok;
		if lowpan.status.contains(LowpanStatus::REQUEST_TIMEOUT) {
			status = NetStatus::InProgress;
		}
		if lowpan.status.contains(LowpanStatus::RX_TIMEOUT_ERROR) {
			status = NetStatus::Timeout;
		}
		Ok(status)
	}

	/// Puts the radio into receive for the upper layer, taking one
	/// backpressure permit.
	pub fn lowpan_start_rx(&mut self, timeout: u16) -> Result<(), Error<SPI::Error>> {
		let lowpan = self.lowpan.as_mut().ok_or(Error::Uninitialized)?;
		if !lowpan.data_sem.try_acquire() {
			return Err(Error::Busy);
		}
		lowpan.rx_pending = true;
		self.dev.set_rx_timeout(timeout)?;
		self.dev.start_rx()
	}

	/// Stages a received frame and hands it upward unchanged. Returns
	/// whether the glue layer consumed the frame.
	pub(crate) fn lowpan_rx_deliver(&mut self) -> Result<bool, Error<SPI::Error>> {
		let Some(lowpan) = self.lowpan.as_mut() else {
			return Ok(false);
		};
		if !lowpan.rx_pending {
			return Ok(false);
		}
		let slot = usize::from(lowpan.buf_idx % lowpan.nframes);
		lowpan.buf_idx = lowpan.buf_idx.wrapping_add(1);
		let length = usize::from(self.dev.frame_len.min(lowpan.buf_len));
		self.dev.read_rx(&mut lowpan.bufs[slot][..length], 0)?;
		lowpan.rx_pending = false;
		if let Some(cb) = self.lowpan_input.as_mut() {
			cb(&lowpan.bufs[slot][..length]);
		}
		lowpan.data_sem.release();
		Ok(true)
	}

	pub(crate) fn lowpan_on_tx_complete(&mut self) {
		if let Some(lowpan) = self.lowpan.as_mut()
			&& lowpan.tx_in_flight
		{
			lowpan.tx_in_flight = false;
			lowpan.sem.release();
		}
	}

	pub(crate) fn lowpan_on_rx_timeout(&mut self) {
		if let Some(lowpan) = self.lowpan.as_mut()
			&& lowpan.rx_pending
		{
			lowpan.rx_pending = false;
			lowpan.status.insert(LowpanStatus::RX_TIMEOUT_ERROR);
			lowpan.data_sem.release();
		}
	}

	pub(crate) fn lowpan_on_rx_error(&mut self) {
		if let Some(lowpan) = self.lowpan.as_mut()
			&& lowpan.rx_pending
		{
			lowpan.rx_pending = false;
			lowpan.status.insert(LowpanStatus::RX_ERROR);
			lowpan.data_sem.release();
		}
	}
}
