//! Two-way-ranging engine.
//!
//! Three state machines share one frame format and one semaphore:
//! single-sided (SS), double-sided (DS) and double-sided with an extended
//! final payload (DS-EXT). The flavour of an exchange is picked by the
//! initiator through the code of the first frame; every later step is
//! driven purely by the code of the frame that arrived.
//!
//! The engine is event-driven. [`Dw1000::rng_request`] fires the first
//! frame and returns; the interrupt path walks the exchange forward and
//! releases the exchange semaphore on completion, timeout or error.

use alloc::vec;
use alloc::vec::Vec;

use embedded_hal::spi::SpiDevice;
use log::{debug, trace};

use crate::dev::DeviceStatus;
use crate::error::Error;
use crate::hal::Board;
use crate::synch::Semaphore;
use crate::time::MASK_40;
use crate::Dw1000;

/// Frame control of every ranging frame: IEEE 802.15.4 data frame with
/// 16-bit addresses.
pub const FCNTL_IEEE_RANGE_16: u16 = 0x8841;

// The code ranges are contiguous so that a flavour can be matched without
// enumerating its members.
pub const SS_TWR: u16 = 0x0000;
pub const SS_TWR_T1: u16 = 0x0001;
pub const SS_TWR_FINAL: u16 = 0x0002;
pub const SS_TWR_END: u16 = 0x000F;
pub const DS_TWR: u16 = 0x0010;
pub const DS_TWR_T1: u16 = 0x0011;
pub const DS_TWR_T2: u16 = 0x0012;
pub const DS_TWR_FINAL: u16 = 0x0013;
pub const DS_TWR_END: u16 = 0x001F;
pub const DS_TWR_EXT: u16 = 0x0020;
pub const DS_TWR_EXT_T1: u16 = 0x0021;
pub const DS_TWR_EXT_T2: u16 = 0x0022;
pub const DS_TWR_EXT_FINAL: u16 = 0x0023;
pub const DS_TWR_EXT_END: u16 = 0x002F;

pub(crate) fn is_ss(code: u16) -> bool {
	(SS_TWR..=SS_TWR_END).contains(&code)
}

pub(crate) fn is_ds(code: u16) -> bool {
	(DS_TWR..=DS_TWR_END).contains(&code)
}

pub(crate) fn is_ds_ext(code: u16) -> bool {
	(DS_TWR_EXT..=DS_TWR_EXT_END).contains(&code)
}

/// Exchange flavours an initiator can request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, num_enum::IntoPrimitive, num_enum::TryFromPrimitive)]
#[repr(u16)]
pub enum RngMode {
	/// Single-sided two-way ranging.
	SsTwr = SS_TWR,
	/// Double-sided two-way ranging, cancels linear clock drift.
	DsTwr = DS_TWR,
	/// Double-sided with an application payload in the final frames.
	DsTwrExt = DS_TWR_EXT,
}

/// Cartesian position payload of the extended final frame.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct Cartesian {
	pub x: f32,
	pub y: f32,
	pub z: f32,
}

/// Spherical coordinate payload of the extended final frame.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct Spherical {
	pub range: f32,
	pub azimuth: f32,
	pub zenith: f32,
}

/// One ranging frame slot.
///
/// The header layout is identical for every code; the trailing timestamp
/// and payload fields are only on the wire for the longer codes. The four
/// timestamp fields hold 40-bit device time, except that
/// `request_timestamp`/`response_timestamp` are stamped from the low-32-bit
/// reads on the initiator turnarounds.
#[derive(Debug, Clone, PartialEq)]
pub struct TwrFrame {
	pub fctrl: u16,
	pub seq_num: u8,
	pub pan_id: u16,
	pub dst_address: u16,
	pub src_address: u16,
	pub code: u16,
	/// When the request of this half-exchange arrived (responder role).
	pub reception_timestamp: u64,
	/// When the pinned response left (responder role).
	pub transmission_timestamp: u64,
	/// When the request of this half-exchange actually left (initiator role).
	pub request_timestamp: u64,
	/// When the response to it arrived (initiator role).
	pub response_timestamp: u64,
	pub cartesian: Cartesian,
	pub spherical: Spherical,
	pub spherical_variance: Spherical,
	/// Application timestamp in microseconds.
	pub utime: u32,
}

/// Wire length of a ranging request frame.
pub const REQUEST_LEN: usize = 11;
/// Wire length of a response frame: request plus the responder stamps.
pub const RESPONSE_LEN: usize = 27;
/// Wire length of a final frame: response plus the initiator stamps.
pub const FINAL_LEN: usize = 43;
/// Wire length of an extended final frame.
pub const EXT_LEN: usize = 83;

impl Default for TwrFrame {
	fn default() -> Self {
		Self {
			fctrl: FCNTL_IEEE_RANGE_16,
			seq_num: 0,
			pan_id: 0xDECA,
			dst_address: 0,
			src_address: 0,
			code: 0,
			reception_timestamp: 0,
			transmission_timestamp: 0,
			request_timestamp: 0,
			response_timestamp: 0,
			cartesian: Cartesian::default(),
			spherical: Spherical::default(),
			spherical_variance: Spherical::default(),
			utime: 0,
		}
	}
}

impl TwrFrame {
	/// Serializes the frame, little endian. Callers slice the result down
	/// to the wire length of the code being sent.
	pub fn as_bytes(&self) -> [u8; EXT_LEN] {
		let mut bytes = [0u8; EXT_LEN];
		bytes[0..2].copy_from_slice(&self.fctrl.to_le_bytes());
		bytes[2] = self.seq_num;
		bytes[3..5].copy_from_slice(&self.pan_id.to_le_bytes());
		bytes[5..7].copy_from_slice(&self.dst_address.to_le_bytes());
		bytes[7..9].copy_from_slice(&self.src_address.to_le_bytes());
		bytes[9..11].copy_from_slice(&self.code.to_le_bytes());
		bytes[11..19].copy_from_slice(&self.reception_timestamp.to_le_bytes());
		bytes[19..27].copy_from_slice(&self.transmission_timestamp.to_le_bytes());
		bytes[27..35].copy_from_slice(&self.request_timestamp.to_le_bytes());
		bytes[35..43].copy_from_slice(&self.response_timestamp.to_le_bytes());
		bytes[43..47].copy_from_slice(&self.cartesian.x.to_le_bytes());
		bytes[47..51].copy_from_slice(&self.cartesian.y.to_le_bytes());
		bytes[51..55].copy_from_slice(&self.cartesian.z.to_le_bytes());
		bytes[55..59].copy_from_slice(&self.spherical.range.to_le_bytes());
		bytes[59..63].copy_from_slice(&self.spherical.azimuth.to_le_bytes());
		bytes[63..67].copy_from_slice(&self.spherical.zenith.to_le_bytes());
		bytes[67..71].copy_from_slice(&self.spherical_variance.range.to_le_bytes());
		bytes[71..75].copy_from_slice(&self.spherical_variance.azimuth.to_le_bytes());
		bytes[75..79].copy_from_slice(&self.spherical_variance.zenith.to_le_bytes());
		bytes[79..83].copy_from_slice(&self.utime.to_le_bytes());
		bytes
	}

	/// Deserializes as many whole sections as `bytes` covers, leaving the
	/// remaining fields untouched. A received request must not clobber the
	/// local timestamps of the slot it lands in.
	pub fn read_from(&mut self, bytes: &[u8]) {
		let word = |range: core::ops::Range<usize>| -> [u8; 2] {
			bytes[range].try_into().unwrap()
		};
		if bytes.len() >= REQUEST_LEN {
			self.fctrl = u16::from_le_bytes(word(0..2));
			self.seq_num = bytes[2];
			self.pan_id = u16::from_le_bytes(word(3..5));
			self.dst_address = u16::from_le_bytes(word(5..7));
			self.src_address = u16::from_le_bytes(word(7..9));
			self.code = u16::from_le_bytes(word(9..11));
		}
		if bytes.len() >= RESPONSE_LEN {
			self.reception_timestamp = u64::from_le_bytes(bytes[11..19].try_into().unwrap());
			self.transmission_timestamp = u64::from_le_bytes(bytes[19..27].try_into().unwrap());
		}
		if bytes.len() >= FINAL_LEN {
			self.request_timestamp = u64::from_le_bytes(bytes[27..35].try_into().unwrap());
			self.response_timestamp = u64::from_le_bytes(bytes[35..43].try_into().unwrap());
		}
		if bytes.len() >= EXT_LEN {
			let float =
				|at: usize| -> f32 { f32::from_le_bytes(bytes[at..at + 4].try_into().unwrap()) };
			self.cartesian = Cartesian { x: float(43), y: float(47), z: float(51) };
			self.spherical = Spherical {
				range: float(55),
				azimuth: float(59),
				zenith: float(63),
			};
			self.spherical_variance = Spherical {
				range: float(67),
				azimuth: float(71),
				zenith: float(75),
			};
			self.utime = u32::from_le_bytes(bytes[79..83].try_into().unwrap());
		}
	}
}

/// Delay parameters of the ranging engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RngConfig {
	/// Per-exchange receive wait budget in UWB microseconds.
	pub rx_timeout_period: u16,
	/// Responder turnaround padding, upper 16 bits of a 40-bit delay.
	pub tx_holdoff_delay: u16,
	/// Apply the range-bias hook to computed ranges.
	pub bias_correction_enable: bool,
}

impl Default for RngConfig {
	fn default() -> Self {
		Self {
			rx_timeout_period: 0xFFFF,
			tx_holdoff_delay: 0x0800,
			bias_correction_enable: false,
		}
	}
}

/// One-shot control record for delayed request starts.
#[derive(Debug, Clone, Copy, Default)]
pub(crate) struct RngControl {
	pub delay_start_enabled: bool,
	pub delay: u64,
}

/// Ranging engine instance: a ring of frame slots plus the exchange
/// semaphore.
pub struct Twr {
	pub(crate) frames: Vec<TwrFrame>,
	/// Monotonically advancing slot cursor; all indexing is mod `nframes`.
	pub(crate) idx: u16,
	nframes: u16,
	pub(crate) sem: Semaphore,
	pub(crate) config: RngConfig,
	pub(crate) control: RngControl,
}

impl Twr {
	pub(crate) fn new(config: RngConfig, nframes: u16) -> Self {
		assert!(nframes > 0);
		Self {
			frames: vec![TwrFrame::default(); usize::from(nframes)],
			// The first advance lands on slot zero.
			idx: 0xFFFF,
			nframes,
			sem: Semaphore::new(1),
			config,
			control: RngControl::default(),
		}
	}

	/// Number of frame slots in the ring.
	pub fn nframes(&self) -> u16 {
		self.nframes
	}

	/// Current value of the slot cursor.
	pub fn idx(&self) -> u16 {
		self.idx
	}

	pub(crate) fn slot_at(&self, idx: u16) -> usize {
		usize::from(idx % self.nframes)
	}

	/// Frame slot the cursor points at.
	pub fn current_frame(&self) -> &TwrFrame {
		&self.frames[self.slot_at(self.idx)]
	}

	/// Frame slot before the cursor, the first half of a double-sided
	/// exchange.
	pub fn previous_frame(&self) -> &TwrFrame {
		&self.frames[self.slot_at(self.idx.wrapping_sub(1))]
	}

	/// Frame slot by raw ring index.
	pub fn frame(&self, slot: u16) -> &TwrFrame {
		&self.frames[usize::from(slot % self.nframes)]
	}

	/// Whether no exchange is in flight.
	pub fn is_idle(&self) -> bool {
		self.sem.available() > 0
	}

	/// Engine configuration.
	pub fn config(&self) -> &RngConfig {
		&self.config
	}

	/// Time of flight of the last completed exchange in device ticks.
	///
	/// Single-sided exchanges keep both halves in one record; double-sided
	/// ones span the current and the previous slot.
	pub fn tof(&self) -> f32 {
		let current = self.current_frame();
		if is_ss(current.code) {
			crate::time::twr_to_tof(current, current)
		} else {
			crate::time::twr_to_tof(self.previous_frame(), current)
		}
	}
}

impl<SPI, B> Dw1000<SPI, B>
where
	SPI: SpiDevice,
	B: Board,
{
	/// Initializes the ranging engine with `nframes` frame slots.
	pub fn rng_init(&mut self, config: RngConfig, nframes: u16) {
		self.twr = Some(Twr::new(config, nframes));
	}

	/// Replaces the engine configuration.
	pub fn rng_config(&mut self, config: RngConfig) -> Result<(), Error<SPI::Error>> {
		self.twr.as_mut().ok_or(Error::Uninitialized)?.config = config;
		Ok(())
	}

	/// Resizes the frame ring and rewinds the slot cursor.
	pub fn rng_reset_frames(&mut self, nframes: u16) -> Result<(), Error<SPI::Error>> {
		let twr = self.twr.as_mut().ok_or(Error::Uninitialized)?;
		assert!(nframes > 0);
		twr.frames.resize(usize::from(nframes), TwrFrame::default());
		twr.nframes = nframes;
		twr.idx = 0xFFFF;
		Ok(())
	}

	/// Ranging engine instance, if initialized.
	pub fn rng(&self) -> Option<&Twr> {
		self.twr.as_ref()
	}

	/// Installs the path-loss bias corrector applied to computed ranges
	/// when the engine configuration enables bias correction. The
	/// polynomial itself is the caller's business.
	pub fn set_range_bias(&mut self, cb: fn(f32) -> f32) {
		self.range_bias_cb = Some(cb);
	}

	/// Range of the last completed exchange in meters, bias-corrected when
	/// configured.
	pub fn rng_range_meters(&self) -> Result<f32, Error<SPI::Error>> {
		let twr = self.twr.as_ref().ok_or(Error::Uninitialized)?;
		let mut range = crate::time::tof_to_meters(twr.tof());
		if twr.config.bias_correction_enable
			&& let Some(bias) = self.range_bias_cb
		{
			range -= bias(range);
		}
		Ok(range)
	}

	/// Initiates a ranging exchange with `dst_address`.
	///
	/// Acquires the exchange semaphore, composes the request into the next
	/// ring slot and fires it with wait-for-response armed. Completion is
	/// reported through the ranging-complete hook; a second request while
	/// one is in flight fails with [`Error::Busy`].
	pub fn rng_request(&mut self, dst_address: u16, mode: RngMode) -> Result<(), Error<SPI::Error>> {
		{
			let twr = self.twr.as_mut().ok_or(Error::Uninitialized)?;
			if !twr.sem.try_acquire() {
				return Err(Error::Busy);
			}
		}
		// A fresh exchange starts clean of the previous one's errors.
		self.dev.status.remove(DeviceStatus::ALL_EXCHANGE_ERR);
		match self.rng_send_request(dst_address, mode) {
			Ok(()) => Ok(()),
			Err(err) => {
				if matches!(err, Error::StartTx) {
					self.ext_tx_error();
				}
				if let Some(twr) = self.twr.as_mut() {
					twr.sem.release();
				}
				Err(err)
			}
		}
	}

	/// Initiates a ranging exchange whose request fires when the device
	/// clock crosses `delay`.
	pub fn rng_request_delay_start(
		&mut self,
		dst_address: u16,
		delay: u64,
		mode: RngMode,
	) -> Result<(), Error<SPI::Error>> {
		self.twr.as_mut().ok_or(Error::Uninitialized)?.control = RngControl {
			delay_start_enabled: true,
			delay,
		};
		let result = self.rng_request(dst_address, mode);
		if let Some(twr) = self.twr.as_mut() {
			twr.control.delay_start_enabled = false;
		}
		result
	}

	fn rng_send_request(
		&mut self,
		dst_address: u16,
		mode: RngMode,
	) -> Result<(), Error<SPI::Error>> {
		let twr = self.twr.as_mut().ok_or(Error::Uninitialized)?;
		twr.idx = twr.idx.wrapping_add(1);
		let slot = twr.slot_at(twr.idx);
		let frame = &mut twr.frames[slot];
		frame.seq_num = frame.seq_num.wrapping_add(1);
		frame.code = mode.into();
		frame.src_address = self.dev.short_address();
		frame.dst_address = dst_address;
		let bytes = frame.as_bytes();
		let rx_timeout = twr.config.rx_timeout_period;
		let delay = twr.control.delay_start_enabled.then_some(twr.control.delay);
		trace!("rng request to {dst_address:#06x}, code {:#06x}", u16::from(mode));
		self.dev.write_tx(&bytes[..REQUEST_LEN], 0)?;
		self.dev.write_tx_fctrl(REQUEST_LEN as u16, 0, true)?;
		self.dev.set_wait4resp(true);
		self.dev.set_rx_timeout(rx_timeout)?;
		if let Some(delay) = delay {
			self.dev.set_delay_start(delay)?;
		}
		self.dev.start_tx()
	}

	/// RX-complete entry of the engine. Ranging traffic drives the state
	/// machines; anything else is forwarded down the extension chain.
	pub(crate) fn rng_rx_complete(&mut self) -> Result<(), Error<SPI::Error>> {
		if self.dev.fctrl != FCNTL_IEEE_RANGE_16 || self.twr.is_none() {
			return self.forward_rx_complete();
		}

		let mut field = [0u8; 2];
		self.dev.read_rx(&mut field, 9)?;
		let code = u16::from_le_bytes(field);
		self.dev.read_rx(&mut field, 5)?;
		let dst_address = u16::from_le_bytes(field);

		// Software MAC filtering of standard ranging frames.
		if dst_address != self.dev.short_address() {
			if self.dev.restart_rx().is_err() {
				self.rng_rx_error()?;
			}
			return Ok(());
		}

		match code {
			SS_TWR => self.rng_respond_first(SS_TWR_T1),
			SS_TWR_T1 => self.rng_ss_t1(),
			SS_TWR_FINAL => self.rng_ss_final(),
			DS_TWR => self.rng_respond_first(DS_TWR_T1),
			DS_TWR_T1 => self.rng_ds_t1(false),
			DS_TWR_T2 => self.rng_ds_t2(false),
			DS_TWR_FINAL => self.rng_ds_final(false),
			DS_TWR_EXT => self.rng_respond_first(DS_TWR_EXT_T1),
			DS_TWR_EXT_T1 => self.rng_ds_t1(true),
			DS_TWR_EXT_T2 => self.rng_ds_t2(true),
			DS_TWR_EXT_FINAL => self.rng_ds_final(true),
			_ => {
				// In-range but unknown: drop, the timeout clears the
				// exchange.
				debug!("dropping ranging frame with unknown code {code:#06x}");
				Ok(())
			}
		}
	}

	/// First frame of any flavour, executed on the responding device:
	/// stamp the arrival, pin the response to a device time and fire it
	/// with wait-for-response armed.
	fn rng_respond_first(&mut self, response_code: u16) -> Result<(), Error<SPI::Error>> {
		if usize::from(self.dev.frame_len) < REQUEST_LEN {
			return Ok(());
		}
		let mut buffer = [0u8; REQUEST_LEN];
		self.dev.read_rx(&mut buffer, 0)?;
		let request_timestamp = self.dev.read_rxtime()?;
		let tx_antenna_delay = u64::from(self.dev.tx_antenna_delay());
		let short_address = self.dev.short_address();

		let twr = self.twr.as_mut().unwrap();
		twr.idx = twr.idx.wrapping_add(1);
		let slot = twr.slot_at(twr.idx);
		let holdoff = u64::from(twr.config.tx_holdoff_delay);
		let rx_timeout = twr.config.rx_timeout_period;

		let response_tx_delay = (request_timestamp + (holdoff << 16)) & MASK_40;
		// The masked form is the scheduled-on-air instant; the antenna
		// delay corrected form is what goes on the wire.
		let response_timestamp = ((response_tx_delay & 0xFF_FFFF_FE00) + tx_antenna_delay) & MASK_40;

		let frame = &mut twr.frames[slot];
		frame.read_from(&buffer);
		frame.reception_timestamp = request_timestamp;
		frame.transmission_timestamp = response_timestamp;
		frame.dst_address = frame.src_address;
		frame.src_address = short_address;
		frame.code = response_code;
		let bytes = frame.as_bytes();

		self.dev.write_tx(&bytes[..RESPONSE_LEN], 0)?;
		self.dev.write_tx_fctrl(RESPONSE_LEN as u16, 0, true)?;
		self.dev.set_wait4resp(true);
		self.dev.set_delay_start(response_tx_delay)?;
		self.dev.set_rx_timeout(rx_timeout)?;
		if self.dev.start_tx().is_err() {
			self.twr.as_mut().unwrap().sem.release();
		}
		Ok(())
	}

	/// Single-sided response arrived back at the initiator: stamp both
	/// ends of the round trip and report them in the final frame.
	fn rng_ss_t1(&mut self) -> Result<(), Error<SPI::Error>> {
		if usize::from(self.dev.frame_len) < RESPONSE_LEN {
			return Ok(());
		}
		let mut buffer = [0u8; RESPONSE_LEN];
		self.dev.read_rx(&mut buffer, 0)?;
		// When the original request actually left, and when the response
		// just came in.
		let request_timestamp = u64::from(self.dev.read_txtime_lo()?);
		let response_timestamp = u64::from(self.dev.read_rxtime_lo()?);
		let short_address = self.dev.short_address();

		let twr = self.twr.as_mut().unwrap();
		let slot = twr.slot_at(twr.idx);
		let frame = &mut twr.frames[slot];
		frame.read_from(&buffer);
		frame.request_timestamp = request_timestamp;
		frame.response_timestamp = response_timestamp;
		frame.dst_address = frame.src_address;
		frame.src_address = short_address;
		frame.code = SS_TWR_FINAL;
		let bytes = frame.as_bytes();

		self.dev.write_tx(&bytes[..FINAL_LEN], 0)?;
		self.dev.write_tx_fctrl(FINAL_LEN as u16, 0, true)?;
		if self.dev.start_tx().is_err() {
			self.twr.as_mut().unwrap().sem.release();
		}
		self.range_on_rng_complete();
		self.ext_rx_complete();
		Ok(())
	}

	/// Final timestamp report arrived at the responder; the single-sided
	/// exchange is complete on both ends.
	fn rng_ss_final(&mut self) -> Result<(), Error<SPI::Error>> {
		if usize::from(self.dev.frame_len) < FINAL_LEN {
			return Ok(());
		}
		let mut buffer = [0u8; FINAL_LEN];
		self.dev.read_rx(&mut buffer, 0)?;
		let twr = self.twr.as_mut().unwrap();
		let slot = twr.slot_at(twr.idx);
		twr.frames[slot].read_from(&buffer);
		twr.sem.release();
		self.fire_rng_complete();
		self.range_on_rng_complete();
		self.ext_rx_complete();
		Ok(())
	}

	/// Double-sided response arrived at the initiator. The current slot
	/// becomes the record of the first half; the engine advances to the
	/// next slot and turns right around with a pinned T2.
	fn rng_ds_t1(&mut self, ext: bool) -> Result<(), Error<SPI::Error>> {
		if usize::from(self.dev.frame_len) < RESPONSE_LEN {
			return Ok(());
		}
		let mut buffer = [0u8; RESPONSE_LEN];
		self.dev.read_rx(&mut buffer, 0)?;
		let request_lo = u64::from(self.dev.read_txtime_lo()?);
		let response_lo = u64::from(self.dev.read_rxtime_lo()?);
		let reception_timestamp = self.dev.read_rxtime()?;
		let tx_antenna_delay = u64::from(self.dev.tx_antenna_delay());
		let short_address = self.dev.short_address();

		let twr = self.twr.as_mut().unwrap();
		let holdoff = u64::from(twr.config.tx_holdoff_delay);
		let rx_timeout = twr.config.rx_timeout_period;
		let slot = twr.slot_at(twr.idx);
		let frame = &mut twr.frames[slot];
		frame.read_from(&buffer);
		frame.request_timestamp = request_lo;
		frame.response_timestamp = response_lo;
		let peer = frame.src_address;
		let seq_num = frame.seq_num;

		// Advance so the two halves of the double-sided scheme keep
		// independent records.
		twr.idx = twr.idx.wrapping_add(1);
		let next_slot = twr.slot_at(twr.idx);

		let response_tx_delay = (reception_timestamp + (holdoff << 16)) & MASK_40;
		let response_timestamp = ((response_tx_delay & 0xFF_FFFF_FE00) + tx_antenna_delay) & MASK_40;

		let next = &mut twr.frames[next_slot];
		next.request_timestamp = request_lo;
		next.response_timestamp = response_lo;
		next.dst_address = peer;
		next.src_address = short_address;
		next.seq_num = seq_num.wrapping_add(1);
		next.code = if ext { DS_TWR_EXT_T2 } else { DS_TWR_T2 };
		next.reception_timestamp = reception_timestamp;
		next.transmission_timestamp = response_timestamp;
		if ext && let Some(cb) = self.tx_final_cb.as_mut() {
			cb(next);
		}
		let bytes = next.as_bytes();
		let length = if ext { EXT_LEN } else { FINAL_LEN };

		self.dev.write_tx(&bytes[..length], 0)?;
		self.dev.write_tx_fctrl(length as u16, 0, true)?;
		self.dev.set_wait4resp(true);
		self.dev.set_delay_start(response_tx_delay)?;
		self.dev.set_rx_timeout(rx_timeout)?;
		if self.dev.start_tx().is_err() {
			self.ext_tx_error();
			self.twr.as_mut().unwrap().sem.release();
		}
		Ok(())
	}

	/// T2 arrived back at the responder: file the first-half round in the
	/// previous record, stamp the second half and send the final report.
	fn rng_ds_t2(&mut self, ext: bool) -> Result<(), Error<SPI::Error>> {
		let length = if ext { EXT_LEN } else { FINAL_LEN };
		if usize::from(self.dev.frame_len) < length {
			return Ok(());
		}
		let mut buffer = [0u8; EXT_LEN];
		self.dev.read_rx(&mut buffer[..length], 0)?;
		let request_lo = u64::from(self.dev.read_txtime_lo()?);
		let response_lo = u64::from(self.dev.read_rxtime_lo()?);
		let short_address = self.dev.short_address();

		let twr = self.twr.as_mut().unwrap();
		let previous_slot = twr.slot_at(twr.idx);
		twr.idx = twr.idx.wrapping_add(1);
		let slot = twr.slot_at(twr.idx);

		let frame = &mut twr.frames[slot];
		frame.read_from(&buffer[..length]);
		// The T2 frame carries the initiator's first-half round; it
		// belongs to the previous record.
		let first_request = frame.request_timestamp;
		let first_response = frame.response_timestamp;
		frame.request_timestamp = request_lo;
		frame.response_timestamp = response_lo;
		frame.dst_address = frame.src_address;
		frame.src_address = short_address;
		frame.code = if ext { DS_TWR_EXT_FINAL } else { DS_TWR_FINAL };
		if ext && let Some(cb) = self.tx_final_cb.as_mut() {
			cb(frame);
		}
		let bytes = twr.frames[slot].as_bytes();
		twr.frames[previous_slot].request_timestamp = first_request;
		twr.frames[previous_slot].response_timestamp = first_response;

		self.dev.write_tx(&bytes[..length], 0)?;
		self.dev.write_tx_fctrl(length as u16, 0, true)?;
		if self.dev.start_tx().is_err() {
			self.twr.as_mut().unwrap().sem.release();
		}
		self.fire_rng_complete();
		Ok(())
	}

	/// Final report arrived at the initiator; the double-sided exchange is
	/// complete.
	fn rng_ds_final(&mut self, ext: bool) -> Result<(), Error<SPI::Error>> {
		let length = if ext { EXT_LEN } else { FINAL_LEN };
		if usize::from(self.dev.frame_len) < length {
			return Ok(());
		}
		let mut buffer = [0u8; EXT_LEN];
		self.dev.read_rx(&mut buffer[..length], 0)?;
		let twr = self.twr.as_mut().unwrap();
		let slot = twr.slot_at(twr.idx);
		twr.frames[slot].read_from(&buffer[..length]);
		twr.sem.release();
		self.range_on_rng_complete();
		self.fire_rng_complete();
		self.ext_rx_complete();
		Ok(())
	}

	/// TX-confirmation entry of the engine.
	pub(crate) fn rng_tx_complete(&mut self) {
		if self.dev.fctrl == FCNTL_IEEE_RANGE_16
			&& let Some(twr) = self.twr.as_mut()
		{
			let code = twr.current_frame().code;
			// The last transmission of the single-sided flavour ends the
			// exchange for the sender.
			if code == SS_TWR_FINAL || code == SS_TWR_T1 {
				twr.sem.release();
			}
		}
		self.lowpan_on_tx_complete();
		self.ext_tx_complete();
	}

	/// Receive-watchdog entry of the engine.
	pub(crate) fn rng_rx_timeout(&mut self) -> Result<(), Error<SPI::Error>> {
		self.lowpan_on_rx_timeout();
		self.ext_rx_timeout();
		if self.dev.fctrl == FCNTL_IEEE_RANGE_16 {
			if let Some(twr) = self.twr.as_mut() {
				twr.sem.release();
			}
			self.range_on_rng_error();
		}
		Ok(())
	}

	/// Receive-error entry of the engine.
	pub(crate) fn rng_rx_error(&mut self) -> Result<(), Error<SPI::Error>> {
		self.lowpan_on_rx_error();
		self.ext_rx_error();
		if self.dev.fctrl == FCNTL_IEEE_RANGE_16 {
			if let Some(twr) = self.twr.as_mut() {
				twr.sem.release();
			}
			self.range_on_rng_error();
		}
		Ok(())
	}

	pub(crate) fn fire_rng_complete(&mut self) {
		if let Some(cb) = self.rng_complete_cb.as_mut()
			&& let Some(twr) = self.twr.as_ref()
		{
			cb(twr);
		}
	}
}
