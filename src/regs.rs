//! Register file map of the transceiver.
//!
//! The device exposes a memory-mapped register file addressed by a 6-bit
//! record id plus a 15-bit sub-index. Only the records the driver core
//! touches are listed here.

use bitflags::bitflags;

/// device identifier, read-only (4 bytes)
pub const DEV_ID: u8 = 0x00;
/// PAN identifier and short address (4 bytes)
pub const PANADR: u8 = 0x03;
/// system configuration (4 bytes)
pub const SYS_CFG: u8 = 0x04;
/// free-running system time counter (5 bytes)
pub const SYS_TIME: u8 = 0x06;
/// transmit frame control (5 bytes)
pub const TX_FCTRL: u8 = 0x08;
/// transmit data buffer (1024 bytes)
pub const TX_BUFFER: u8 = 0x09;
/// delayed send/receive time (5 bytes)
pub const DX_TIME: u8 = 0x0A;
/// receive frame wait timeout period (2 bytes)
pub const RX_FWTO: u8 = 0x0C;
/// system control register (4 bytes)
pub const SYS_CTRL: u8 = 0x0D;
/// system event mask (4 bytes)
pub const SYS_MASK: u8 = 0x0E;
/// system event status, write-1-to-clear (5 bytes)
pub const SYS_STATUS: u8 = 0x0F;
/// receive frame information (4 bytes)
pub const RX_FINFO: u8 = 0x10;
/// receive data buffer (1024 bytes)
pub const RX_BUFFER: u8 = 0x11;
/// receive time of arrival (14 bytes, adjusted stamp first)
pub const RX_TIME: u8 = 0x15;
/// transmit time of sending (10 bytes, adjusted stamp first)
pub const TX_TIME: u8 = 0x17;
/// transmit antenna delay (2 bytes)
pub const TX_ANTD: u8 = 0x18;
/// always-on domain control block
pub const AON: u8 = 0x2C;
/// leading-edge detection interface block
pub const LDE_IF: u8 = 0x2E;
/// power management and system control block
pub const PMSC: u8 = 0x36;

/// Expected value of [`DEV_ID`].
pub const DEVICE_ID: u32 = 0xDECA_0130;

/// Length of the system time and timestamp registers.
pub const SYS_TIME_LEN: usize = 5;

/// Length of the delayed send time register.
pub const DX_TIME_LEN: usize = 5;

/// Frame length field of [`RX_FINFO`].
pub const RX_FINFO_RXFLEN_MASK: u32 = 0x0000_03FF;

/// Frame length field of [`TX_FCTRL`], including the extension bits.
pub const TX_FCTRL_TFLEN_MASK: u32 = 0x0000_03FF;
/// Ranging bit of [`TX_FCTRL`].
pub const TX_FCTRL_TR: u32 = 0x0000_8000;
/// Transmit buffer offset field position in [`TX_FCTRL`].
pub const TX_FCTRL_TXBOFFS_SHIFT: u32 = 22;

// AON sub-register offsets. The wake configuration survives deep sleep,
// everything outside the AON block does not.
/// on-wake configuration (2 bytes)
pub const AON_WCFG_OFFSET: u16 = 0x00;
/// AON control (1 byte)
pub const AON_CTRL_OFFSET: u16 = 0x02;
/// wake-up configuration (2 bytes)
pub const AON_CFG0_OFFSET: u16 = 0x06;
/// upload the AON array into the host interface
pub const AON_CTRL_SAVE: u8 = 0x02;

// LDE sub-register offsets.
/// receive antenna delay applied by the leading-edge algorithm (2 bytes)
pub const LDE_RXANTD_OFFSET: u16 = 0x1804;

// PMSC sub-register offsets and values.
/// PMSC control register 0 (4 bytes)
pub const PMSC_CTRL0_OFFSET: u16 = 0x00;
/// soft-reset nibble inside PMSC_CTRL0 (byte 3)
pub const PMSC_CTRL0_SOFTRESET_OFFSET: u16 = 0x03;
/// PMSC control register 1 (4 bytes)
pub const PMSC_CTRL1_OFFSET: u16 = 0x04;
/// force the system clock onto the 19.2 MHz crystal
pub const PMSC_CTRL0_SYSCLKS_19M: u32 = 0x0000_0001;
/// system clock selection field
pub const PMSC_CTRL0_SYSCLKS_MASK: u32 = 0x0000_0003;
/// assert reset of HIF, TX, RX and PMSC
pub const PMSC_CTRL0_RESET_ALL: u8 = 0x00;
/// release all reset lines
pub const PMSC_CTRL0_RESET_CLEAR: u8 = 0xF0;
/// disable PMSC control of the packet sequencing
pub const PMSC_CTRL1_PKTSEQ_DISABLE: u16 = 0x0000;
/// automatic transition to sleep after transmission
pub const PMSC_CTRL1_ATXSLP: u32 = 0x0000_0800;

/// enable the receive frame wait timeout in [`SYS_CFG`]
pub const SYS_CFG_RXWTOE: u32 = 0x1000_0000;

bitflags! {
	/// System control register bits.
	#[derive(Debug, Clone, Copy, PartialEq, Eq)]
	pub struct SysCtrl: u32 {
		/// suppress auto-FCS transmission
		const SFCST = 1 << 0;
		/// start transmission
		const TXSTRT = 1 << 1;
		/// transmitter delayed sending
		const TXDLYS = 1 << 2;
		/// force transceiver off
		const TRXOFF = 1 << 6;
		/// wait for response after transmission
		const WAIT4RESP = 1 << 7;
		/// enable receiver
		const RXENAB = 1 << 8;
		/// receiver delayed enable
		const RXDLYE = 1 << 9;
	}
}

bitflags! {
	/// System event status bits. The register is write-1-to-clear.
	#[derive(Debug, Clone, Copy, PartialEq, Eq)]
	pub struct SysStatus: u32 {
		/// interrupt request active
		const IRQS = 1 << 0;
		/// transmit frame sent
		const TXFRS = 1 << 7;
		/// receiver PHY header error
		const RXPHE = 1 << 12;
		/// receiver data frame ready
		const RXDFR = 1 << 13;
		/// receiver FCS good
		const RXFCG = 1 << 14;
		/// receiver FCS error
		const RXFCE = 1 << 15;
		/// receiver Reed-Solomon frame sync loss
		const RXRFSL = 1 << 16;
		/// receive frame wait timeout
		const RXRFTO = 1 << 17;
		/// leading-edge detection processing error
		const LDEERR = 1 << 18;
		/// sleep-to-init transition happened
		const SLP2INIT = 1 << 23;
		/// RF PLL losing lock
		const RFPLL_LL = 1 << 24;
		/// clock PLL losing lock
		const CLKPLL_LL = 1 << 25;
		/// receive SFD timeout
		const RXSFDTO = 1 << 26;
		/// half-period delay warning, the delayed send time was missed
		const HPDWARN = 1 << 27;
		/// automatic frame filtering rejection
		const AFFREJ = 1 << 29;

		/// any receive error condition
		const ALL_RX_ERR = Self::RXPHE.bits()
			| Self::RXFCE.bits()
			| Self::RXRFSL.bits()
			| Self::RXSFDTO.bits()
			| Self::AFFREJ.bits()
			| Self::LDEERR.bits();
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn rx_error_summary_covers_every_error_source() {
		for bit in [
			SysStatus::RXPHE,
			SysStatus::RXFCE,
			SysStatus::RXRFSL,
			SysStatus::RXSFDTO,
			SysStatus::AFFREJ,
			SysStatus::LDEERR,
		] {
			assert!(SysStatus::ALL_RX_ERR.contains(bit));
		}
		assert!(!SysStatus::ALL_RX_ERR.contains(SysStatus::RXRFTO));
		assert!(!SysStatus::ALL_RX_ERR.contains(SysStatus::RXFCG));
	}
}
