//! Arithmetic on 40-bit device timestamps and time-of-flight extraction.
//!
//! The device clock is a free-running 40-bit counter. Differences are
//! computed in the natural integer width and masked back, so a wrap across
//! the counter boundary yields the correct distance. Request/response
//! stamps are taken from the low-32-bit timestamp reads and wrap at 32
//! bits instead.

use crate::rng::{self, TwrFrame};

/// Mask of the 40-bit device time.
pub const MASK_40: u64 = 0xFF_FFFF_FFFF;

/// Duration of one device tick in seconds, 1/(128 · 499.2 MHz).
pub const TICK_SECONDS: f32 = 1.0 / (128.0 * 499.2e6);

/// Speed of light in air, m/s.
pub const SPEED_OF_LIGHT: f32 = 299_702_547.0;

/// Difference `a - b` of two 40-bit timestamps, modulo 2⁴⁰.
pub fn delta40(a: u64, b: u64) -> u64 {
	a.wrapping_sub(b) & MASK_40
}

/// Difference `a - b` of two low-32-bit timestamps, modulo 2³².
pub fn delta32(a: u64, b: u64) -> u64 {
	u64::from((a as u32).wrapping_sub(b as u32))
}

/// Extracts the time of flight from two consecutive frame records.
///
/// `first` carries the first half of the exchange, `next` the second; for
/// a single-sided exchange both halves live in one record and the same
/// frame is passed twice. The flavour is selected by `next.code`. Unknown
/// codes yield zero.
///
/// The result is a time of flight in device ticks; see
/// [`tof_to_meters`] for the conversion downstream.
pub fn twr_to_tof(first: &TwrFrame, next: &TwrFrame) -> f32 {
	if rng::is_ss(next.code) {
		let round = delta32(first.response_timestamp, first.request_timestamp) as i64;
		let hold = delta40(first.transmission_timestamp, first.reception_timestamp) as i64;
		(round - hold) as f32 / 2.0
	} else if rng::is_ds(next.code) || rng::is_ds_ext(next.code) {
		let t1_round = delta32(first.response_timestamp, first.request_timestamp) as i64;
		let t1_hold = delta40(first.transmission_timestamp, first.reception_timestamp) as i64;
		let t2_round = delta32(next.response_timestamp, next.request_timestamp) as i64;
		let t2_hold = delta40(next.transmission_timestamp, next.reception_timestamp) as i64;
		let nom = t1_round * t2_round - t1_hold * t2_hold;
		let denom = t1_round + t2_round + t1_hold + t2_hold;
		nom as f32 / denom as f32
	} else {
		0.0
	}
}

/// Integer time of flight for symmetric exchanges.
///
/// Valid when both sides use the same turnaround delay; the double-sided
/// form then reduces to an average of the two half-round differences.
pub fn twr_to_tof_sym(twr: &[TwrFrame], code: u16) -> u32 {
	match code {
		rng::SS_TWR => {
			let round = delta32(twr[0].response_timestamp, twr[0].request_timestamp);
			let hold = delta40(twr[0].transmission_timestamp, twr[0].reception_timestamp);
			(round.wrapping_sub(hold) / 2) as u32
		}
		rng::DS_TWR => {
			let t1_round = delta32(twr[0].response_timestamp, twr[0].request_timestamp);
			let t1_hold = delta40(twr[0].transmission_timestamp, twr[0].reception_timestamp);
			let t2_round = delta32(twr[1].response_timestamp, twr[1].request_timestamp);
			let t2_hold = delta40(twr[1].transmission_timestamp, twr[1].reception_timestamp);
			((t1_round
				.wrapping_sub(t1_hold)
				.wrapping_add(t2_round)
				.wrapping_sub(t2_hold)) >> 2) as u32
		}
		_ => 0,
	}
}

/// Converts a time of flight in device ticks to a distance in meters.
pub fn tof_to_meters(tof: f32) -> f32 {
	tof * TICK_SECONDS * SPEED_OF_LIGHT
}

#[cfg(test)]
mod tests {
	use float_cmp::assert_approx_eq;

	use super::*;

	fn ss_record(request: u64, response: u64, reception: u64, transmission: u64) -> TwrFrame {
		let mut frame = TwrFrame::default();
		frame.code = rng::SS_TWR;
		frame.request_timestamp = request;
		frame.response_timestamp = response;
		frame.reception_timestamp = reception;
		frame.transmission_timestamp = transmission;
		frame
	}

	#[test]
	fn single_sided_flight_time() {
		// Initiator sends at 1000 and hears back at 3000; the responder
		// held the frame from 1500 to 2500. Half of the remaining slack is
		// the one-way flight time.
		let frame = ss_record(1000, 3000, 1500, 2500);
		assert_approx_eq!(f32, twr_to_tof(&frame, &frame), 500.0);
	}

	#[test]
	fn double_sided_flight_time() {
		let mut first = ss_record(0, 1000, 0, 500);
		first.code = rng::DS_TWR;
		let mut next = ss_record(0, 1200, 0, 500);
		next.code = rng::DS_TWR_FINAL;
		// (1000·1200 - 500·500) / (1000 + 1200 + 500 + 500)
		assert_approx_eq!(f32, twr_to_tof(&first, &next), 296.875);
	}

	#[test]
	fn flight_time_survives_counter_wrap() {
		let base = MASK_40 - 999;
		let frame = ss_record(
			base & 0xFFFF_FFFF,
			(base + 2000) & 0xFFFF_FFFF,
			(base + 500) & MASK_40,
			(base + 1500) & MASK_40,
		);
		assert_approx_eq!(f32, twr_to_tof(&frame, &frame), 500.0);
	}

	#[test]
	fn symmetric_variants_match_the_float_forms() {
		let frame = ss_record(1000, 3000, 1500, 2500);
		assert_eq!(twr_to_tof_sym(core::slice::from_ref(&frame), rng::SS_TWR), 500);

		let mut first = ss_record(0, 1000, 0, 500);
		first.code = rng::DS_TWR;
		let mut next = ss_record(0, 1200, 0, 500);
		next.code = rng::DS_TWR_FINAL;
		let frames = [first, next];
		assert_eq!(twr_to_tof_sym(&frames, rng::DS_TWR), 300);
	}

	#[test]
	fn unknown_codes_yield_zero() {
		let mut frame = ss_record(1000, 3000, 1500, 2500);
		frame.code = 0x0100;
		assert_approx_eq!(f32, twr_to_tof(&frame, &frame), 0.0);
	}

	#[test]
	fn tick_to_meter_conversion() {
		// 500 ticks of flight are roughly 2.35 m.
		assert_approx_eq!(f32, tof_to_meters(500.0), 2.3446, epsilon = 0.001);
	}
}
