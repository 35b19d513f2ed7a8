//! Behavioural model of the transceiver and a simulated wire.
//!
//! The chip model decodes the SPI command headers against a real register
//! file and implements the side effects the driver relies on: transmit
//! start (immediate and delayed with the half-period warning), automatic
//! receiver turn-on, the receive frame wait timeout, write-1-to-clear
//! event status, the 40-bit clock and AON deep sleep wiping everything
//! outside the always-on block.
//!
//! `Net` connects any number of chips with a propagation delay in device
//! ticks and replays events in time order; `run` pumps events into the
//! drivers until the wire is idle.

#![allow(dead_code)]

use std::cell::{Cell, RefCell};
use std::rc::Rc;

use embedded_hal::delay::DelayNs;
use embedded_hal::spi::{Operation, SpiDevice};
use uwb_dw1000::{Baudrate, Board, Dw1000};

pub const MASK_40: u64 = 0xFF_FFFF_FFFF;
/// Device ticks per UWB microsecond as the driver's turnaround shift
/// implies (a 16-bit hold-off maps to the upper half of a 32-bit tick
/// field).
pub const TICKS_PER_UUS: u64 = 65_536;

const DEVICE_ID: u32 = 0xDECA_0130;

// Record ids the model acts on.
const DEV_ID: u8 = 0x00;
const SYS_CFG: u8 = 0x04;
const SYS_TIME: u8 = 0x06;
const TX_FCTRL: u8 = 0x08;
const TX_BUFFER: u8 = 0x09;
const DX_TIME: u8 = 0x0A;
const RX_FWTO: u8 = 0x0C;
const SYS_CTRL: u8 = 0x0D;
const SYS_STATUS: u8 = 0x0F;
const RX_FINFO: u8 = 0x10;
const RX_BUFFER: u8 = 0x11;
const RX_TIME: u8 = 0x15;
const TX_TIME: u8 = 0x17;
const TX_ANTD: u8 = 0x18;
const AON: u8 = 0x2C;

const SYS_CTRL_TXSTRT: u32 = 1 << 1;
const SYS_CTRL_TXDLYS: u32 = 1 << 2;
const SYS_CTRL_TRXOFF: u32 = 1 << 6;
const SYS_CTRL_WAIT4RESP: u32 = 1 << 7;
const SYS_CTRL_RXENAB: u32 = 1 << 8;
const SYS_STATUS_TXFRS: u32 = 1 << 7;
const SYS_STATUS_RXDFR: u32 = 1 << 13;
const SYS_STATUS_RXFCG: u32 = 1 << 14;
const SYS_STATUS_RXRFTO: u32 = 1 << 17;
const SYS_STATUS_SLP2INIT: u32 = 1 << 23;
const SYS_STATUS_HPDWARN: u32 = 1 << 27;
const SYS_CFG_RXWTOE: u32 = 0x1000_0000;
const AON_CTRL_OFFSET: usize = 0x02;
const AON_CFG0_OFFSET: usize = 0x06;
const AON_CTRL_SAVE: u8 = 0x02;
const WAKE_SLP_EN: u8 = 0x01;

const RECORD_LEN: usize = 0x8000;

struct PendingTx {
	at: u64,
	frame: Vec<u8>,
	wait4resp: bool,
}

pub struct Chip {
	regs: Vec<Vec<u8>>,
	pub device_id: u32,
	pub asleep: bool,
	rx_enabled: bool,
	rx_armed_at: u64,
	pending_tx: Option<PendingTx>,
}

impl Chip {
	fn new() -> Self {
		let mut chip = Self {
			regs: (0..0x40).map(|_| vec![0u8; RECORD_LEN]).collect(),
			device_id: DEVICE_ID,
			asleep: false,
			rx_enabled: false,
			rx_armed_at: 0,
			pending_tx: None,
		};
		chip.load_defaults();
		chip
	}

	fn load_defaults(&mut self) {
		let devid = self.device_id;
		self.regs[DEV_ID as usize][..4].copy_from_slice(&devid.to_le_bytes());
	}

	fn reset(&mut self) {
		// The reset line has no effect while the chip is in deep sleep;
		// it takes a wake-up signal to get out.
		if self.asleep {
			return;
		}
		for record in &mut self.regs {
			record.fill(0);
		}
		self.rx_enabled = false;
		self.pending_tx = None;
		self.load_defaults();
	}

	fn wake(&mut self) {
		if !self.asleep {
			return;
		}
		self.asleep = false;
		self.load_defaults();
		self.status_set(SYS_STATUS_SLP2INIT);
	}

	fn reg_u32(&self, reg: u8) -> u32 {
		u32::from_le_bytes(self.regs[reg as usize][..4].try_into().unwrap())
	}

	fn reg_u40(&self, reg: u8) -> u64 {
		let mut bytes = [0u8; 8];
		bytes[..5].copy_from_slice(&self.regs[reg as usize][..5]);
		u64::from_le_bytes(bytes)
	}

	fn set_reg_u40(&mut self, reg: u8, value: u64) {
		self.regs[reg as usize][..5].copy_from_slice(&value.to_le_bytes()[..5]);
	}

	fn status_set(&mut self, bits: u32) {
		let status = self.reg_u32(SYS_STATUS) | bits;
		self.regs[SYS_STATUS as usize][..4].copy_from_slice(&status.to_le_bytes());
	}

	pub fn rx_enabled(&self) -> bool {
		self.rx_enabled
	}

	/// Raw register bytes, for assertions that bypass the driver.
	pub fn reg_bytes(&self, reg: u8, sub: usize, len: usize) -> Vec<u8> {
		self.regs[reg as usize][sub..sub + len].to_vec()
	}

	fn read(&self, reg: u8, sub: u16, buffer: &mut [u8], now: u64) {
		if self.asleep {
			buffer.fill(0);
			return;
		}
		if reg == SYS_TIME && sub == 0 {
			let time = (now & MASK_40).to_le_bytes();
			for (index, byte) in buffer.iter_mut().enumerate() {
				*byte = *time.get(index).unwrap_or(&0);
			}
			return;
		}
		let record = &self.regs[reg as usize];
		buffer.copy_from_slice(&record[usize::from(sub)..usize::from(sub) + buffer.len()]);
	}

	fn write(&mut self, reg: u8, sub: u16, data: &[u8], now: u64) {
		if self.asleep {
			return;
		}
		if reg == SYS_STATUS {
			// Write-1-to-clear.
			let mut written = [0u8; 4];
			for (index, byte) in data.iter().enumerate().take(4) {
				written[index] = *byte;
			}
			let status = self.reg_u32(SYS_STATUS) & !u32::from_le_bytes(written);
			self.regs[SYS_STATUS as usize][..4].copy_from_slice(&status.to_le_bytes());
			return;
		}
		let at = usize::from(sub);
		self.regs[reg as usize][at..at + data.len()].copy_from_slice(data);
		match reg {
			SYS_CTRL if sub == 0 => self.sys_ctrl(now),
			AON => self.aon_written(at, data.len()),
			_ => {}
		}
	}

	fn sys_ctrl(&mut self, now: u64) {
		let ctrl = self.reg_u32(SYS_CTRL);
		if ctrl & SYS_CTRL_TRXOFF != 0 {
			self.rx_enabled = false;
			self.pending_tx = None;
		}
		if ctrl & SYS_CTRL_TXSTRT != 0 {
			let length = usize::try_from(self.reg_u32(TX_FCTRL) & 0x3FF)
				.unwrap()
				.saturating_sub(2);
			let frame = self.regs[TX_BUFFER as usize][..length].to_vec();
			let wait4resp = ctrl & SYS_CTRL_WAIT4RESP != 0;
			let at = if ctrl & SYS_CTRL_TXDLYS != 0 {
				// The transceiver ignores the low nine bits of the
				// programmed send time.
				let on_air = self.reg_u40(DX_TIME) & 0xFF_FFFF_FE00;
				let ahead = on_air.wrapping_sub(now) & MASK_40;
				if ahead > 1 << 39 {
					// Send time already passed.
					self.status_set(SYS_STATUS_HPDWARN);
					return;
				}
				now + ahead
			} else {
				now
			};
			self.pending_tx = Some(PendingTx { at, frame, wait4resp });
		}
		if ctrl & SYS_CTRL_RXENAB != 0 {
			self.rx_enabled = true;
			self.rx_armed_at = now;
		}
	}

	fn aon_written(&mut self, at: usize, len: usize) {
		// Entering sleep takes an AON upload with the sleep enable armed
		// in the wake configuration.
		if at <= AON_CTRL_OFFSET && AON_CTRL_OFFSET < at + len {
			let ctrl = self.regs[AON as usize][AON_CTRL_OFFSET];
			let cfg0 = self.regs[AON as usize][AON_CFG0_OFFSET];
			if ctrl & AON_CTRL_SAVE != 0 && cfg0 & WAKE_SLP_EN != 0 {
				self.enter_sleep();
			}
		}
	}

	fn enter_sleep(&mut self) {
		self.asleep = true;
		self.rx_enabled = false;
		self.pending_tx = None;
		// Everything outside the always-on block is lost.
		let aon = std::mem::take(&mut self.regs[AON as usize]);
		for record in &mut self.regs {
			record.fill(0);
		}
		self.regs[AON as usize] = aon;
	}

	fn rx_deadline(&self) -> Option<u64> {
		if !self.rx_enabled || self.reg_u32(SYS_CFG) & SYS_CFG_RXWTOE == 0 {
			return None;
		}
		let fwto = u64::from(u16::from_le_bytes(
			self.regs[RX_FWTO as usize][..2].try_into().unwrap(),
		));
		if fwto == 0 {
			return None;
		}
		Some(self.rx_armed_at + fwto * TICKS_PER_UUS)
	}

	fn deliver(&mut self, frame: &[u8], at: u64) -> bool {
		if self.asleep || !self.rx_enabled {
			return false;
		}
		self.regs[RX_BUFFER as usize][..frame.len()].copy_from_slice(frame);
		let finfo = (frame.len() as u32 + 2) & 0x3FF;
		self.regs[RX_FINFO as usize][..4].copy_from_slice(&finfo.to_le_bytes());
		self.set_reg_u40(RX_TIME, at & MASK_40);
		self.status_set(SYS_STATUS_RXFCG | SYS_STATUS_RXDFR);
		self.rx_enabled = false;
		true
	}
}

fn decode_header(header: &[u8]) -> (bool, u8, u16) {
	let write = header[0] >> 7 == 1;
	let reg = header[0] & 0x3F;
	if (header[0] >> 6) & 1 == 0 {
		assert_eq!(header.len(), 1, "sub-index flag clear but header has {} bytes", header.len());
		return (write, reg, 0);
	}
	let mut sub = u16::from(header[1] & 0x7F);
	if header[1] >> 7 == 1 {
		assert_eq!(header.len(), 3);
		sub |= u16::from(header[2]) << 7;
	} else {
		assert_eq!(header.len(), 2);
	}
	(write, reg, sub)
}

/// SPI bus endpoint of one simulated chip.
pub struct SimSpi {
	chip: Rc<RefCell<Chip>>,
	now: Rc<Cell<u64>>,
}

impl embedded_hal::spi::ErrorType for SimSpi {
	type Error = core::convert::Infallible;
}

impl SpiDevice for SimSpi {
	fn transaction(&mut self, operations: &mut [Operation<'_, u8>]) -> Result<(), Self::Error> {
		let mut chip = self.chip.borrow_mut();
		let now = self.now.get();
		let (write, reg, sub) = match &operations[0] {
			Operation::Write(header) => decode_header(header),
			_ => panic!("transaction must lead with the command header"),
		};
		for operation in &mut operations[1..] {
			match operation {
				Operation::Read(buffer) => {
					assert!(!write, "read payload after a write header");
					chip.read(reg, sub, buffer, now);
				}
				Operation::Write(data) => {
					assert!(write, "write payload after a read header");
					chip.write(reg, sub, data, now);
				}
				_ => panic!("unsupported SPI operation"),
			}
		}
		Ok(())
	}
}

/// Board wiring of one simulated chip.
pub struct SimBoard {
	chip: Rc<RefCell<Chip>>,
	now: Rc<Cell<u64>>,
}

impl DelayNs for SimBoard {
	fn delay_ns(&mut self, ns: u32) {
		// One tick is roughly 15.65 ps.
		self.now.set(self.now.get() + u64::from(ns) * 64);
	}
}

impl Board for SimBoard {
	fn hard_reset(&mut self) {
		self.chip.borrow_mut().reset();
	}

	fn wakeup(&mut self) {
		self.chip.borrow_mut().wake();
	}

	fn set_baudrate(&mut self, _baudrate: Baudrate) {}
}

struct Delivery {
	to: usize,
	at: u64,
	frame: Vec<u8>,
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum Event {
	Delivery(usize),
	TxFire(usize),
	RxTimeout(usize),
}

/// A wire connecting the chips with a fixed propagation delay.
pub struct Net {
	pub now: Rc<Cell<u64>>,
	pub chips: Vec<Rc<RefCell<Chip>>>,
	pub delay: u64,
	deliveries: Vec<Delivery>,
	/// Ranging codes observed on the air, in transmit order.
	pub tx_log: Vec<u16>,
}

impl Net {
	pub fn new(nchips: usize, delay: u64) -> Self {
		Self {
			now: Rc::new(Cell::new(0)),
			chips: (0..nchips).map(|_| Rc::new(RefCell::new(Chip::new()))).collect(),
			delay,
			deliveries: Vec::new(),
			tx_log: Vec::new(),
		}
	}

	/// Creates the driver for chip `index`.
	pub fn node(&self, index: usize) -> Dw1000<SimSpi, SimBoard> {
		Dw1000::new(
			SimSpi {
				chip: self.chips[index].clone(),
				now: self.now.clone(),
			},
			SimBoard {
				chip: self.chips[index].clone(),
				now: self.now.clone(),
			},
		)
	}

	pub fn advance(&self, ticks: u64) {
		self.now.set(self.now.get() + ticks);
	}

	fn next_event(&self) -> Option<(u64, Event)> {
		let mut best: Option<(u64, Event)> = None;
		let mut consider = |candidate: (u64, Event)| {
			// Deliveries beat timeouts at the same instant.
			let better = match best {
				None => true,
				Some((at, Event::RxTimeout(_))) => {
					candidate.0 < at
						|| (candidate.0 == at && !matches!(candidate.1, Event::RxTimeout(_)))
				}
				Some((at, _)) => candidate.0 < at,
			};
			if better {
				best = Some(candidate);
			}
		};
		for (index, delivery) in self.deliveries.iter().enumerate() {
			consider((delivery.at, Event::Delivery(index)));
		}
		for (index, chip) in self.chips.iter().enumerate() {
			let chip = chip.borrow();
			if let Some(tx) = &chip.pending_tx {
				consider((tx.at, Event::TxFire(index)));
			}
			if let Some(deadline) = chip.rx_deadline() {
				consider((deadline, Event::RxTimeout(index)));
			}
		}
		best
	}

	/// Replays the earliest pending event; returns the chip whose IRQ
	/// line went active, if any.
	pub fn pump(&mut self) -> Option<usize> {
		loop {
			let (at, event) = self.next_event()?;
			if at > self.now.get() {
				self.now.set(at);
			}
			match event {
				Event::TxFire(index) => {
					let (frame, emitted) = {
						let mut chip = self.chips[index].borrow_mut();
						let tx = chip.pending_tx.take().unwrap();
						let antenna = u64::from(u16::from_le_bytes(
							chip.reg_bytes(TX_ANTD, 0, 2).try_into().unwrap(),
						));
						let emitted = tx.at + antenna;
						chip.set_reg_u40(TX_TIME, emitted & MASK_40);
						chip.status_set(SYS_STATUS_TXFRS);
						if tx.wait4resp {
							chip.rx_enabled = true;
							chip.rx_armed_at = tx.at;
						}
						(tx.frame, emitted)
					};
					if frame.len() >= 11 && u16::from_le_bytes([frame[0], frame[1]]) == 0x8841 {
						self.tx_log.push(u16::from_le_bytes([frame[9], frame[10]]));
					}
					for to in 0..self.chips.len() {
						if to != index {
							self.deliveries.push(Delivery {
								to,
								at: emitted + self.delay,
								frame: frame.clone(),
							});
						}
					}
					return Some(index);
				}
				Event::Delivery(at_index) => {
					let delivery = self.deliveries.remove(at_index);
					let accepted = self.chips[delivery.to]
						.borrow_mut()
						.deliver(&delivery.frame, delivery.at);
					if accepted {
						return Some(delivery.to);
					}
					// Nobody was listening; replay the next event.
				}
				Event::RxTimeout(index) => {
					let mut chip = self.chips[index].borrow_mut();
					chip.rx_enabled = false;
					chip.status_set(SYS_STATUS_RXRFTO);
					return Some(index);
				}
			}
		}
	}

	/// Pumps events into the drivers until the wire is idle.
	pub fn run(&mut self, nodes: &mut [&mut Dw1000<SimSpi, SimBoard>]) {
		while let Some(index) = self.pump() {
			nodes[index].handle_interrupt().unwrap();
		}
	}
}

/// A configured two-chip network with addressed, ranging-ready drivers.
pub fn twr_pair(
	delay: u64,
	nframes: u16,
	config: uwb_dw1000::RngConfig,
) -> (Net, Dw1000<SimSpi, SimBoard>, Dw1000<SimSpi, SimBoard>) {
	let net = Net::new(2, delay);
	let mut initiator = net.node(0);
	let mut responder = net.node(1);
	initiator.config().unwrap();
	responder.config().unwrap();
	initiator.dev_mut().set_address(0xDECA, 0x0001).unwrap();
	responder.dev_mut().set_address(0xDECA, 0x0002).unwrap();
	initiator.rng_init(config, nframes);
	responder.rng_init(config, nframes);
	(net, initiator, responder)
}
