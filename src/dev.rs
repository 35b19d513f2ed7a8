//! Device handle: register transport, lifecycle and frame I/O.
//!
//! The transceiver hangs off an SPI bus and is addressed through 1–3 byte
//! command headers followed by the payload, all inside one chip-select
//! assertion. Everything else in the driver funnels through
//! [`Device::read`] and [`Device::write`].

use embedded_hal::spi::{Operation, SpiDevice};
use log::{debug, info, trace};

use crate::error::Error;
use crate::hal::{Baudrate, Board};
use crate::regs;
use crate::regs::{SysCtrl, SysStatus};

bitflags::bitflags! {
	/// Driver-level status word.
	///
	/// Error bits are latched by the operation that observed the condition
	/// and stay set until the next exchange starts.
	#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
	pub struct DeviceStatus: u16 {
		/// device probe succeeded and the handle is usable
		const INITIALIZED = 1 << 0;
		/// the device is in (deep) sleep
		const SLEEPING = 1 << 1;
		/// the transceiver rejected a transmit start
		const START_TX_ERROR = 1 << 2;
		/// the receiver could not be (re)started
		const START_RX_ERROR = 1 << 3;
		/// the transceiver aborted a transmission
		const TX_FRAME_ERROR = 1 << 4;
		/// the receiver reported a CRC or PHY failure
		const RX_ERROR = 1 << 5;
		/// the receive watchdog expired
		const RX_TIMEOUT_ERROR = 1 << 6;
		/// a scheduled request found the previous one still in flight
		const REQUEST_TIMEOUT = 1 << 7;

		/// everything an exchange must start clean of
		const ALL_EXCHANGE_ERR = Self::START_TX_ERROR.bits()
			| Self::START_RX_ERROR.bits()
			| Self::TX_FRAME_ERROR.bits()
			| Self::RX_ERROR.bits()
			| Self::RX_TIMEOUT_ERROR.bits();
	}
}

bitflags::bitflags! {
	/// On-wake configuration programmed into the always-on array.
	#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
	pub struct SleepMode: u16 {
		/// load the LDO tune value from OTP
		const LOADLDO = 0x1000;
		/// load the leading-edge microcode from OTP
		const LOADUCODE = 0x0800;
		/// preserve the sleep configuration across wake-ups
		const PRESERVE_SLEEP = 0x0100;
		/// load the operating parameter set on wake-up
		const LOADOPSET = 0x0080;
		/// download the AON array into the host interface
		const CONFIG = 0x0040;
		/// reload the extended unique identifier
		const LOADEUI = 0x0008;
		/// enter receive mode directly after wake-up
		const GOTORX = 0x0002;
		/// run the temperature and voltage sensors on wake-up
		const TANDV = 0x0001;
	}
}

bitflags::bitflags! {
	/// Wake-up sources and the sleep enable itself.
	#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
	pub struct WakeMode: u8 {
		/// keep the crystal running during sleep
		const XTAL_EN = 0x10;
		/// wake after the sleep counter expires
		const WAKE_SLPCNT = 0x08;
		/// wake on chip select
		const WAKE_CS = 0x04;
		/// wake on the WAKEUP pin
		const WAKE_WK = 0x02;
		/// enable the sleep/deep-sleep function
		const SLP_EN = 0x01;
	}
}

/// Pending transceiver control state, consumed by the next start operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Control {
	/// arm the receiver automatically after the transmission
	pub wait4resp: bool,
	/// the next transmit fires when the device clock crosses `DX_TIME`
	pub delay_start: bool,
	/// the receive frame wait timeout is armed
	pub rx_timeout: bool,
}

/// Handle of one transceiver on the bus.
pub struct Device<SPI, B> {
	spi: SPI,
	board: B,
	/// Driver status word, also mutated from the interrupt path.
	pub status: DeviceStatus,
	device_id: u32,
	/// 40-bit system time sampled during [`config`](Self::config).
	pub timestamp: u64,
	pan_id: u16,
	short_address: u16,
	tx_antenna_delay: u16,
	rx_antenna_delay: u16,
	sleep_mode: SleepMode,
	/// Frame control field of the last frame moved through the device,
	/// transmitted or received. Timeout and error handlers use it to
	/// attribute the event when no frame is available.
	pub(crate) fctrl: u16,
	/// Payload length of the last received frame, CRC stripped.
	pub frame_len: u16,
	control: Control,
	rx_context: Control,
	rx_timeout_period: u16,
}

impl<SPI, B> Device<SPI, B>
where
	SPI: SpiDevice,
	B: Board,
{
	/// Creates a device handle from the bus and board wiring.
	///
	/// The handle is inert until [`config`](Self::config) has probed the
	/// chip.
	pub fn new(spi: SPI, board: B) -> Self {
		Self {
			spi,
			board,
			status: DeviceStatus::empty(),
			device_id: 0,
			timestamp: 0,
			pan_id: 0,
			short_address: 0,
			tx_antenna_delay: 0,
			rx_antenna_delay: 0,
			sleep_mode: SleepMode::empty(),
			fctrl: 0,
			frame_len: 0,
			control: Control::default(),
			rx_context: Control::default(),
			rx_timeout_period: 0,
		}
	}

	/// Tears the handle down and returns the bus and board to the caller.
	pub fn free(mut self) -> (SPI, B) {
		self.status.remove(DeviceStatus::INITIALIZED);
		(self.spi, self.board)
	}

	fn validate(reg: u8, sub: u16, len: usize) -> Result<(), Error<SPI::Error>> {
		// Record ids are 6 bits, the sub-addressable area is 15 bits.
		if reg > 0x3F || sub > 0x7FFF || usize::from(sub) + len > 0x7FFF {
			return Err(Error::InvalidOperand);
		}
		Ok(())
	}

	/// Builds the SPI command header for a register access.
	///
	/// Byte 0 carries the operation, the sub-index presence flag and the
	/// record id; byte 1 the extension flag and the low seven sub-index
	/// bits; byte 2 the upper eight.
	fn cmd_header(write: bool, reg: u8, sub: u16) -> ([u8; 3], usize) {
		let mut header = [0u8; 3];
		header[0] = (u8::from(write) << 7) | (u8::from(sub != 0) << 6) | (reg & 0x3F);
		if sub == 0 {
			return (header, 1);
		}
		let extended = sub > 128;
		header[1] = (u8::from(extended) << 7) | (sub as u8 & 0x7F);
		if !extended {
			return (header, 2);
		}
		header[2] = (sub >> 7) as u8;
		(header, 3)
	}

	/// Reads `buffer.len()` bytes from the register file.
	pub fn read(&mut self, reg: u8, sub: u16, buffer: &mut [u8]) -> Result<(), Error<SPI::Error>> {
		Self::validate(reg, sub, buffer.len())?;
		let (header, hlen) = Self::cmd_header(false, reg, sub);
		self.spi
			.transaction(&mut [Operation::Write(&header[..hlen]), Operation::Read(buffer)])
			.map_err(|err| {
				self.status.insert(DeviceStatus::RX_ERROR);
				Error::Spi(err)
			})
	}

	/// Writes `buffer` into the register file.
	pub fn write(&mut self, reg: u8, sub: u16, buffer: &[u8]) -> Result<(), Error<SPI::Error>> {
		Self::validate(reg, sub, buffer.len())?;
		let (header, hlen) = Self::cmd_header(true, reg, sub);
		self.spi
			.transaction(&mut [Operation::Write(&header[..hlen]), Operation::Write(buffer)])
			.map_err(|err| {
				self.status.insert(DeviceStatus::START_TX_ERROR);
				Error::Spi(err)
			})
	}

	/// Reads an up to 8 byte register, little endian.
	pub fn read_reg(&mut self, reg: u8, sub: u16, nbytes: usize) -> Result<u64, Error<SPI::Error>> {
		debug_assert!(nbytes <= 8);
		let mut buffer = [0u8; 8];
		self.read(reg, sub, &mut buffer[..nbytes])?;
		Ok(u64::from_le_bytes(buffer))
	}

	/// Writes an up to 8 byte register, little endian.
	pub fn write_reg(
		&mut self,
		reg: u8,
		sub: u16,
		value: u64,
		nbytes: usize,
	) -> Result<(), Error<SPI::Error>> {
		debug_assert!(nbytes <= 8);
		let buffer = value.to_le_bytes();
		self.write(reg, sub, &buffer[..nbytes])
	}

	/// Probes and configures the device.
	///
	/// Drops to the low probe baud rate, pulses RESET and reads the device
	/// id. A sleeping chip misses the first probe, so up to three attempts
	/// are made with an intervening wake-up. On success the bus is raised
	/// to the full rate and the current 40-bit system time is sampled.
	pub fn config(&mut self) -> Result<(), Error<SPI::Error>> {
		let mut timeout = 3;
		loop {
			self.board.set_baudrate(Baudrate::Low);
			self.board.hard_reset();
			self.device_id = self.read_reg(regs::DEV_ID, 0, 4)? as u32;
			if self.device_id == regs::DEVICE_ID {
				break;
			}
			timeout -= 1;
			if timeout == 0 {
				return Err(Error::Timeout);
			}
			// In case the chip was asleep.
			self.wakeup()?;
		}
		self.status.insert(DeviceStatus::INITIALIZED);
		self.timestamp = self.read_systime()?;
		self.board.set_baudrate(Baudrate::High);
		info!("device {:#010x} up, system time {:#x}", self.device_id, self.timestamp);
		Ok(())
	}

	/// Soft-resets the chip through the power management block.
	pub fn softreset(&mut self) -> Result<(), Error<SPI::Error>> {
		// Put the system clock onto the crystal so the reset does not race
		// the PLL.
		let ctrl0 = self.read_reg(regs::PMSC, regs::PMSC_CTRL0_OFFSET, 4)? as u32;
		let ctrl0 = (ctrl0 & !regs::PMSC_CTRL0_SYSCLKS_MASK) | regs::PMSC_CTRL0_SYSCLKS_19M;
		self.write_reg(regs::PMSC, regs::PMSC_CTRL0_OFFSET, u64::from(ctrl0), 4)?;
		// Disable PMSC control of the RF and RX clock blocks.
		self.write_reg(
			regs::PMSC,
			regs::PMSC_CTRL1_OFFSET,
			u64::from(regs::PMSC_CTRL1_PKTSEQ_DISABLE),
			2,
		)?;
		// Clear any AON auto-download and wake-up configuration, the reset
		// below triggers an AON download.
		self.write_reg(regs::AON, regs::AON_WCFG_OFFSET, 0, 2)?;
		self.write_reg(regs::AON, regs::AON_CFG0_OFFSET, 0, 1)?;
		self.write_reg(regs::AON, regs::AON_CTRL_OFFSET, 0, 1)?;
		self.write_reg(regs::AON, regs::AON_CTRL_OFFSET, u64::from(regs::AON_CTRL_SAVE), 1)?;
		self.write_reg(
			regs::PMSC,
			regs::PMSC_CTRL0_SOFTRESET_OFFSET,
			u64::from(regs::PMSC_CTRL0_RESET_ALL),
			1,
		)?;
		// The clock PLL locks within 10 us of the reset.
		self.board.delay_us(10);
		self.write_reg(
			regs::PMSC,
			regs::PMSC_CTRL0_SOFTRESET_OFFSET,
			u64::from(regs::PMSC_CTRL0_RESET_CLEAR),
			1,
		)
	}

	/// Programs the on-wake behaviour and the wake-up sources.
	///
	/// The device should be configured for its post-wake action (TX or RX)
	/// before entering sleep; the AON array preserves that configuration.
	pub fn configure_sleep(
		&mut self,
		mode: SleepMode,
		wake: WakeMode,
	) -> Result<(), Error<SPI::Error>> {
		self.sleep_mode = mode;
		self.write_reg(regs::AON, regs::AON_WCFG_OFFSET, u64::from(mode.bits()), 2)?;
		self.write_reg(regs::AON, regs::AON_CFG0_OFFSET, u64::from(wake.bits()), 2)
	}

	/// Uploads the always-on array and enters sleep.
	pub fn enter_sleep(&mut self) -> Result<(), Error<SPI::Error>> {
		self.write_reg(regs::AON, regs::AON_CTRL_OFFSET, 0, 2)?;
		self.write_reg(regs::AON, regs::AON_CTRL_OFFSET, u64::from(regs::AON_CTRL_SAVE), 2)?;
		self.status.insert(DeviceStatus::SLEEPING);
		debug!("entering sleep");
		Ok(())
	}

	/// Wakes the device back into the init state.
	///
	/// Polls the device id up to five times, issuing a hardware wake signal
	/// between probes. Antenna delays are lost across deep sleep and are
	/// re-applied here.
	pub fn wakeup(&mut self) -> Result<(), Error<SPI::Error>> {
		let mut timeout = 5;
		let mut devid = self.read_reg(regs::DEV_ID, 0, 4)? as u32;
		while devid != regs::DEVICE_ID && timeout > 1 {
			self.board.wakeup();
			devid = self.read_reg(regs::DEV_ID, 0, 4)? as u32;
			timeout -= 1;
		}
		self.status.set(DeviceStatus::SLEEPING, devid != regs::DEVICE_ID);
		self.write_reg(regs::SYS_STATUS, 0, u64::from(SysStatus::SLP2INIT.bits()), 4)?;
		self.write_reg(regs::SYS_STATUS, 0, u64::from(SysStatus::ALL_RX_ERR.bits()), 4)?;
		self.set_rx_antenna_delay(self.rx_antenna_delay)?;
		self.set_tx_antenna_delay(self.tx_antenna_delay)?;
		debug!("wakeup, devid {devid:#010x}");
		Ok(())
	}

	/// Sets the auto "TX then sleep" bit.
	///
	/// After a frame transmission the device enters deep sleep on its own;
	/// [`configure_sleep`](Self::configure_sleep) must have been called
	/// before. The IRQ line has to be inactive when enabling this.
	pub fn enter_sleep_after_tx(&mut self, enable: bool) -> Result<(), Error<SPI::Error>> {
		let mut reg = self.read_reg(regs::PMSC, regs::PMSC_CTRL1_OFFSET, 4)? as u32;
		if enable {
			reg |= regs::PMSC_CTRL1_ATXSLP;
		} else {
			reg &= !regs::PMSC_CTRL1_ATXSLP;
		}
		self.write_reg(regs::PMSC, regs::PMSC_CTRL1_OFFSET, u64::from(reg), 4)
	}

	/// Sets the PAN id and the local 16-bit short address.
	pub fn set_address(&mut self, pan_id: u16, short_address: u16) -> Result<(), Error<SPI::Error>> {
		self.pan_id = pan_id;
		self.short_address = short_address;
		let panadr = (u32::from(pan_id) << 16) | u32::from(short_address);
		self.write_reg(regs::PANADR, 0, u64::from(panadr), 4)
	}

	/// Local 16-bit short address.
	pub fn short_address(&self) -> u16 {
		self.short_address
	}

	/// PAN identifier.
	pub fn pan_id(&self) -> u16 {
		self.pan_id
	}

	/// On-wake configuration of the last sleep programming.
	pub fn sleep_mode(&self) -> SleepMode {
		self.sleep_mode
	}

	/// Programs the transmit antenna delay added to the stamped send time.
	pub fn set_tx_antenna_delay(&mut self, delay: u16) -> Result<(), Error<SPI::Error>> {
		self.tx_antenna_delay = delay;
		self.write_reg(regs::TX_ANTD, 0, u64::from(delay), 2)
	}

	/// Programs the receive antenna delay used by the leading-edge
	/// algorithm.
	pub fn set_rx_antenna_delay(&mut self, delay: u16) -> Result<(), Error<SPI::Error>> {
		self.rx_antenna_delay = delay;
		self.write_reg(regs::LDE_IF, regs::LDE_RXANTD_OFFSET, u64::from(delay), 2)
	}

	/// Transmit antenna delay in device ticks.
	pub fn tx_antenna_delay(&self) -> u16 {
		self.tx_antenna_delay
	}

	/// Receive antenna delay in device ticks.
	pub fn rx_antenna_delay(&self) -> u16 {
		self.rx_antenna_delay
	}

	/// Reads the free-running 40-bit system time.
	pub fn read_systime(&mut self) -> Result<u64, Error<SPI::Error>> {
		self.read_reg(regs::SYS_TIME, 0, regs::SYS_TIME_LEN)
	}

	/// Copies a frame into the transmit buffer.
	///
	/// A write at offset zero also records the outgoing frame control so
	/// that timeout and error handlers can attribute later events.
	pub fn write_tx(&mut self, buffer: &[u8], offset: u16) -> Result<(), Error<SPI::Error>> {
		if offset == 0 && buffer.len() >= 2 {
			self.fctrl = u16::from_le_bytes([buffer[0], buffer[1]]);
		}
		self.write(regs::TX_BUFFER, offset, buffer)
	}

	/// Programs the transmit frame control for a `length` byte frame.
	///
	/// The two CRC octets the transceiver appends are accounted for here.
	pub fn write_tx_fctrl(
		&mut self,
		length: u16,
		offset: u16,
		ranging: bool,
	) -> Result<(), Error<SPI::Error>> {
		let mut fctrl = u32::from(length + 2) & regs::TX_FCTRL_TFLEN_MASK;
		fctrl |= u32::from(offset & 0x3FF) << regs::TX_FCTRL_TXBOFFS_SHIFT;
		if ranging {
			fctrl |= regs::TX_FCTRL_TR;
		}
		self.write_reg(regs::TX_FCTRL, 0, u64::from(fctrl), 4)
	}

	/// Starts the transmission armed by the preceding control calls.
	///
	/// A delayed start that already missed its send time raises the
	/// half-period warning; the transceiver is forced off and the start is
	/// reported as rejected.
	pub fn start_tx(&mut self) -> Result<(), Error<SPI::Error>> {
		let mut ctrl = SysCtrl::TXSTRT;
		if self.control.wait4resp {
			ctrl |= SysCtrl::WAIT4RESP;
		}
		let delayed = self.control.delay_start;
		if delayed {
			ctrl |= SysCtrl::TXDLYS;
		}
		self.write_reg(regs::SYS_CTRL, 0, u64::from(ctrl.bits()), 4)?;
		if delayed {
			let status =
				SysStatus::from_bits_truncate(self.read_reg(regs::SYS_STATUS, 0, 4)? as u32);
			if status.contains(SysStatus::HPDWARN) {
				self.write_reg(regs::SYS_CTRL, 0, u64::from(SysCtrl::TRXOFF.bits()), 4)?;
				self.control = Control::default();
				self.status.insert(DeviceStatus::START_TX_ERROR);
				debug!("delayed send time missed");
				return Err(Error::StartTx);
			}
		}
		self.control = Control::default();
		Ok(())
	}

	/// Pins the next transmission to a 40-bit device time.
	///
	/// The transceiver ignores the low nine bits of the programmed time.
	pub fn set_delay_start(&mut self, time: u64) -> Result<(), Error<SPI::Error>> {
		self.control.delay_start = true;
		self.write_reg(regs::DX_TIME, 0, time & crate::time::MASK_40, regs::DX_TIME_LEN)
	}

	/// Arms the automatic receiver turn-on after the next transmission.
	pub fn set_wait4resp(&mut self, enable: bool) {
		self.control.wait4resp = enable;
	}

	/// Programs the receive frame wait timeout in UWB microseconds; zero
	/// disables the watchdog.
	pub fn set_rx_timeout(&mut self, period: u16) -> Result<(), Error<SPI::Error>> {
		let mut cfg = self.read_reg(regs::SYS_CFG, 0, 4)? as u32;
		if period > 0 {
			self.write_reg(regs::RX_FWTO, 0, u64::from(period), 2)?;
			cfg |= regs::SYS_CFG_RXWTOE;
		} else {
			cfg &= !regs::SYS_CFG_RXWTOE;
		}
		self.rx_timeout_period = period;
		self.control.rx_timeout = period > 0;
		self.write_reg(regs::SYS_CFG, 0, u64::from(cfg), 4)
	}

	/// Enables the receiver, saving the control snapshot for
	/// [`restart_rx`](Self::restart_rx).
	pub fn start_rx(&mut self) -> Result<(), Error<SPI::Error>> {
		self.rx_context = self.control;
		self.control = Control::default();
		self.write_reg(regs::SYS_CTRL, 0, u64::from(SysCtrl::RXENAB.bits()), 4)
			.inspect_err(|_| self.status.insert(DeviceStatus::START_RX_ERROR))
	}

	/// Forces the transceiver off and re-arms the receiver with the saved
	/// control snapshot.
	pub fn restart_rx(&mut self) -> Result<(), Error<SPI::Error>> {
		self.write_reg(regs::SYS_CTRL, 0, u64::from(SysCtrl::TRXOFF.bits()), 4)?;
		self.control = self.rx_context;
		self.write_reg(regs::SYS_CTRL, 0, u64::from(SysCtrl::RXENAB.bits()), 4)
			.inspect_err(|_| self.status.insert(DeviceStatus::START_RX_ERROR))
	}

	/// Copies `buffer.len()` bytes out of the receive buffer.
	pub fn read_rx(&mut self, buffer: &mut [u8], offset: u16) -> Result<(), Error<SPI::Error>> {
		self.read(regs::RX_BUFFER, offset, buffer)
	}

	/// Full 40-bit adjusted receive timestamp.
	pub fn read_rxtime(&mut self) -> Result<u64, Error<SPI::Error>> {
		self.read_reg(regs::RX_TIME, 0, regs::SYS_TIME_LEN)
	}

	/// Low 32 bits of the receive timestamp.
	pub fn read_rxtime_lo(&mut self) -> Result<u32, Error<SPI::Error>> {
		Ok(self.read_reg(regs::RX_TIME, 0, 4)? as u32)
	}

	/// Full 40-bit adjusted transmit timestamp.
	pub fn read_txtime(&mut self) -> Result<u64, Error<SPI::Error>> {
		self.read_reg(regs::TX_TIME, 0, regs::SYS_TIME_LEN)
	}

	/// Low 32 bits of the transmit timestamp.
	pub fn read_txtime_lo(&mut self) -> Result<u32, Error<SPI::Error>> {
		Ok(self.read_reg(regs::TX_TIME, 0, 4)? as u32)
	}

	/// Configured receive frame wait timeout in UWB microseconds.
	pub fn rx_timeout_period(&self) -> u16 {
		self.rx_timeout_period
	}

	pub(crate) fn read_status(&mut self) -> Result<SysStatus, Error<SPI::Error>> {
		Ok(SysStatus::from_bits_truncate(self.read_reg(regs::SYS_STATUS, 0, 4)? as u32))
	}

	pub(crate) fn clear_events(&mut self, events: SysStatus) -> Result<(), Error<SPI::Error>> {
		// The status register is write-1-to-clear.
		self.write_reg(regs::SYS_STATUS, 0, u64::from(events.bits()), 4)
	}

	/// Fetches the length of the frame sitting in the receive buffer, CRC
	/// stripped, and latches it together with the frame control field.
	pub(crate) fn fetch_rx_info(&mut self) -> Result<(), Error<SPI::Error>> {
		let finfo = self.read_reg(regs::RX_FINFO, 0, 4)? as u32;
		self.frame_len = ((finfo & regs::RX_FINFO_RXFLEN_MASK).saturating_sub(2)) as u16;
		let mut fctrl = [0u8; 2];
		if self.frame_len >= 2 {
			self.read_rx(&mut fctrl, 0)?;
		}
		self.fctrl = u16::from_le_bytes(fctrl);
		trace!("rx frame, fctrl {:#06x}, {} bytes", self.fctrl, self.frame_len);
		Ok(())
	}
}
