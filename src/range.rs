//! Multi-node range scheduler.
//!
//! Drives round-robin ranging against a list of peer short addresses. The
//! application timer calls [`Dw1000::range_tick`] once per period; engine
//! completions append ring indices to the working list, and a finished
//! round swaps the two index lists and queues the post-process hand-off
//! for [`Dw1000::process_events`]. A counting semaphore sized to the node
//! count keeps the scheduler from overtaking post-processing.

use alloc::vec;
use alloc::vec::Vec;

use embedded_hal::spi::SpiDevice;
use log::{debug, trace};

use crate::dev::DeviceStatus;
use crate::error::Error;
use crate::hal::Board;
use crate::rng::RngMode;
use crate::synch::Semaphore;
use crate::Dw1000;

/// Scheduling slack subtracted from the period when re-arming the tick
/// timer, in microseconds.
pub const SCHEDULE_LATENCY_US: u32 = 500;

/// Default tick period in microseconds.
pub const DEFAULT_PERIOD_US: u32 = 200_000;

/// Scheduler configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RangeConfig {
	/// Hand completed rounds to the post-process hook.
	pub postprocess: bool,
	/// Exchange flavour the scheduler requests.
	pub code: RngMode,
}

impl Default for RangeConfig {
	fn default() -> Self {
		Self {
			postprocess: true,
			code: RngMode::DsTwr,
		}
	}
}

/// Scheduler status bits.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct RangeStatus {
	pub started: bool,
	pub valid: bool,
	pub timer_enabled: bool,
}

/// Scheduler instance.
pub struct Range {
	node_addr: Vec<u16>,
	// Two index lists swapped per generation: one fills while the other is
	// post-processed.
	rng_idx_list: Vec<u16>,
	pp_idx_list: Vec<u16>,
	rng_idx_cnt: u16,
	pp_idx_cnt: u16,
	idx: u16,
	nnodes: u16,
	period_us: u32,
	pub(crate) config: RangeConfig,
	pub(crate) status: RangeStatus,
	pub(crate) sem: Semaphore,
	pp_pending: bool,
}

impl Range {
	fn new(node_addr: &[u16]) -> Self {
		let nnodes = node_addr.len() as u16;
		assert!(nnodes > 0);
		Self {
			node_addr: node_addr.to_vec(),
			rng_idx_list: vec![0; node_addr.len()],
			pp_idx_list: vec![0; node_addr.len()],
			rng_idx_cnt: 0,
			pp_idx_cnt: 0,
			idx: 0,
			nnodes,
			period_us: DEFAULT_PERIOD_US,
			config: RangeConfig::default(),
			status: RangeStatus::default(),
			sem: Semaphore::new(nnodes),
			pp_pending: false,
		}
	}

	/// Peer short addresses in scheduling order.
	pub fn nodes(&self) -> &[u16] {
		&self.node_addr
	}

	/// Number of peers in the round.
	pub fn nnodes(&self) -> u16 {
		self.nnodes
	}

	/// Ring indices of the last completed round, valid until the next
	/// swap.
	pub fn pp_indices(&self) -> &[u16] {
		&self.pp_idx_list[..usize::from(self.pp_idx_cnt)]
	}

	/// Number of completions collected in the current round so far.
	pub fn rng_idx_cnt(&self) -> u16 {
		self.rng_idx_cnt
	}

	/// Current tick cursor.
	pub fn idx(&self) -> u16 {
		self.idx
	}

	/// Scheduler status.
	pub fn status(&self) -> RangeStatus {
		self.status
	}

	/// Free round permits.
	pub fn permits(&self) -> u16 {
		self.sem.available()
	}

	/// Tick period in microseconds.
	pub fn period_us(&self) -> u32 {
		self.period_us
	}

	/// Delay until the next tick: the period minus the scheduling slack.
	pub fn tick_delay_us(&self) -> u32 {
		self.period_us.saturating_sub(SCHEDULE_LATENCY_US)
	}

	fn swap_generations(&mut self) {
		core::mem::swap(&mut self.rng_idx_list, &mut self.pp_idx_list);
		self.pp_idx_cnt = self.rng_idx_cnt;
		self.rng_idx_cnt = 0;
		self.pp_pending = true;
	}
}

impl<SPI, B> Dw1000<SPI, B>
where
	SPI: SpiDevice,
	B: Board,
{
	/// Initializes the scheduler with the peers to range against.
	pub fn range_init(&mut self, node_addr: &[u16]) {
		self.range = Some(Range::new(node_addr));
	}

	/// Scheduler instance, if initialized.
	pub fn range(&self) -> Option<&Range> {
		self.range.as_ref()
	}

	/// Sets the tick period in microseconds.
	pub fn range_set_period(&mut self, period_us: u32) -> Result<(), Error<SPI::Error>> {
		self.range.as_mut().ok_or(Error::Uninitialized)?.period_us = period_us;
		Ok(())
	}

	/// Starts scheduling with the given exchange flavour. The application
	/// timer must call [`range_tick`](Self::range_tick) every
	/// [`tick_delay_us`](Range::tick_delay_us) microseconds from now on.
	pub fn range_start(&mut self, code: RngMode) -> Result<(), Error<SPI::Error>> {
		let range = self.range.as_mut().ok_or(Error::Uninitialized)?;
		range.status.valid = false;
		range.config.code = code;
		range.status.started = true;
		range.status.timer_enabled = true;
		debug!("range scheduler started, {} nodes", range.nnodes);
		Ok(())
	}

	/// Stops scheduling; a tick after this is a no-op.
	pub fn range_stop(&mut self) -> Result<(), Error<SPI::Error>> {
		let range = self.range.as_mut().ok_or(Error::Uninitialized)?;
		range.status.started = false;
		range.status.timer_enabled = false;
		Ok(())
	}

	/// One scheduler tick: take a round permit and fire a ranging request
	/// at the next peer.
	///
	/// Without a free permit the scheduler has overrun post-processing;
	/// the tick then records a request timeout and skips. A tick that
	/// finds the engine still busy with the previous exchange does the
	/// same and returns its permit.
	pub fn range_tick(&mut self) -> Result<(), Error<SPI::Error>> {
		let range = self.range.as_mut().ok_or(Error::Uninitialized)?;
		if !range.status.started {
			return Ok(());
		}
		if !range.sem.try_acquire() {
			self.dev.status.insert(DeviceStatus::REQUEST_TIMEOUT);
			return Err(Error::Busy);
		}
		let node = range.node_addr[usize::from(range.idx % range.nnodes)];
		range.idx = range.idx.wrapping_add(1);
		let code = range.config.code;
		trace!("range tick -> {node:#06x}");
		match self.rng_request(node, code) {
			Err(Error::Busy) => {
				self.dev.status.insert(DeviceStatus::REQUEST_TIMEOUT);
				self.range.as_mut().unwrap().sem.release();
				Err(Error::Busy)
			}
			result => result,
		}
	}

	/// Installs the post-process hook handed every completed round.
	pub fn on_range_postprocess(&mut self, cb: impl FnMut(&Range) + 'static) {
		self.postprocess_cb = Some(alloc::boxed::Box::new(cb));
		if let Some(range) = self.range.as_mut() {
			range.config.postprocess = true;
		}
	}

	/// Event-loop poll: runs a queued post-process hand-off.
	///
	/// The hook observes the swapped index list; afterwards the round
	/// permits go back to the scheduler.
	pub fn process_events(&mut self) {
		let Some(range) = self.range.as_mut() else {
			return;
		};
		if !range.pp_pending {
			return;
		}
		range.pp_pending = false;
		if let Some(cb) = self.postprocess_cb.as_mut() {
			cb(self.range.as_ref().unwrap());
		}
		let range = self.range.as_mut().unwrap();
		for _ in 0..range.nnodes {
			range.sem.release();
		}
	}

	/// Re-initializes the peer list and the round bookkeeping.
	///
	/// The round semaphore is re-armed to the node count so that the
	/// scheduler invariant (at most one outstanding round per peer slot)
	/// holds for the new list.
	pub fn range_reset_nodes(&mut self, node_addr: &[u16]) -> Result<(), Error<SPI::Error>> {
		let range = self.range.as_mut().ok_or(Error::Uninitialized)?;
		assert!(!node_addr.is_empty());
		let nnodes = node_addr.len() as u16;
		range.node_addr.clear();
		range.node_addr.extend_from_slice(node_addr);
		range.rng_idx_list.resize(node_addr.len(), 0);
		range.pp_idx_list.resize(node_addr.len(), 0);
		range.idx = 0;
		range.nnodes = nnodes;
		range.rng_idx_cnt = 0;
		range.pp_idx_cnt = 0;
		range.pp_pending = false;
		range.sem.reinit(nnodes);
		Ok(())
	}

	/// Engine completion hook: file the ring index of the finished
	/// exchange and swap generations at the round boundary.
	pub(crate) fn range_on_rng_complete(&mut self) {
		let Some(range) = self.range.as_mut() else {
			return;
		};
		if !range.status.started {
			return;
		}
		let Some(twr) = self.twr.as_ref() else {
			return;
		};
		let slot = (twr.idx() % twr.nframes()) as u16;
		let at = usize::from(range.rng_idx_cnt % range.nnodes);
		range.rng_idx_list[at] = slot;
		range.rng_idx_cnt += 1;
		if range.config.postprocess && range.idx % range.nnodes == 0 {
			range.swap_generations();
		}
	}

	/// Engine error hook: completion will not come for this slot, but the
	/// round boundary must still swap so callers observe every scheduled
	/// slot.
	pub(crate) fn range_on_rng_error(&mut self) {
		let Some(range) = self.range.as_mut() else {
			return;
		};
		if !range.status.started {
			return;
		}
		if range.config.postprocess && range.idx % range.nnodes == 0 {
			range.swap_generations();
		}
	}
}
