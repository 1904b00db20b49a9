//! CC1101 SPI transceiver, byte FIFO oriented. The chip raises GDO2 on
//! sync word detection and GDO0 as the FIFO threshold line; the receive
//! loop drains the FIFO byte-wise and switches the chip to fixed packet
//! length once the frame size is known.

use std::collections::VecDeque;

use embedded_hal::digital::InputPin;
use embedded_hal::spi::SpiDevice;
use log::{debug, warn};

use super::{IrqLine, RadioError, Transceiver};

// SPI access mode bits
#[allow(dead_code)]
const WRITE_BURST: u8 = 0x40;
const READ_SINGLE: u8 = 0x80;
const READ_BURST: u8 = 0xC0;

// Strobe commands
const SRES: u8 = 0x30;
const SCAL: u8 = 0x33;
const SRX: u8 = 0x34;
const SIDLE: u8 = 0x36;
const SFRX: u8 = 0x3A;
const SFTX: u8 = 0x3B;

// Status registers (read with the burst bit)
const PARTNUM: u8 = 0x30;
const VERSION: u8 = 0x31;
const MARCSTATE: u8 = 0x35;
const RSSI: u8 = 0x34;
const RXBYTES: u8 = 0x3B;

const FIFO: u8 = 0x3F;

// MARCSTATE values
const MARC_IDLE: u8 = 0x01;
const MARC_RX: u8 = 0x0D;

// Config register addresses
#[allow(dead_code)]
mod reg {
    pub const IOCFG2: u8 = 0x00;
    pub const IOCFG1: u8 = 0x01;
    pub const IOCFG0: u8 = 0x02;
    pub const FIFOTHR: u8 = 0x03;
    pub const SYNC1: u8 = 0x04;
    pub const SYNC0: u8 = 0x05;
    pub const PKTLEN: u8 = 0x06;
    pub const PKTCTRL1: u8 = 0x07;
    pub const PKTCTRL0: u8 = 0x08;
    pub const ADDR: u8 = 0x09;
    pub const CHANNR: u8 = 0x0A;
    pub const FSCTRL1: u8 = 0x0B;
    pub const FSCTRL0: u8 = 0x0C;
    pub const FREQ2: u8 = 0x0D;
    pub const FREQ1: u8 = 0x0E;
    pub const FREQ0: u8 = 0x0F;
    pub const MDMCFG4: u8 = 0x10;
    pub const MDMCFG3: u8 = 0x11;
    pub const MDMCFG2: u8 = 0x12;
    pub const MDMCFG1: u8 = 0x13;
    pub const MDMCFG0: u8 = 0x14;
    pub const DEVIATN: u8 = 0x15;
    pub const MCSM2: u8 = 0x16;
    pub const MCSM1: u8 = 0x17;
    pub const MCSM0: u8 = 0x18;
    pub const FOCCFG: u8 = 0x19;
    pub const BSCFG: u8 = 0x1A;
    pub const AGCCTRL2: u8 = 0x1B;
    pub const AGCCTRL1: u8 = 0x1C;
    pub const AGCCTRL0: u8 = 0x1D;
    pub const WOREVT1: u8 = 0x1E;
    pub const WOREVT0: u8 = 0x1F;
    pub const WORCTRL: u8 = 0x20;
    pub const FREND1: u8 = 0x21;
    pub const FREND0: u8 = 0x22;
    pub const FSCAL3: u8 = 0x23;
    pub const FSCAL2: u8 = 0x24;
    pub const FSCAL1: u8 = 0x25;
    pub const FSCAL0: u8 = 0x26;
    pub const RCCTRL1: u8 = 0x27;
    pub const RCCTRL0: u8 = 0x28;
    pub const FSTEST: u8 = 0x29;
    pub const PTEST: u8 = 0x2A;
    pub const AGCTEST: u8 = 0x2B;
    pub const TEST2: u8 = 0x2C;
    pub const TEST1: u8 = 0x2D;
    pub const TEST0: u8 = 0x2E;
}

/* Calibration blob for wM-Bus T/C reception at 868.95 MHz, 103 kBaud
   2-FSK, sync word 0x543D, infinite packet length. */
const WMBUS_RF_SETTINGS: [(u8, u8); 47] = [
    (reg::IOCFG2, 0x06),
    (reg::IOCFG1, 0x2E),
    (reg::IOCFG0, 0x00),
    (reg::FIFOTHR, 0x0A),
    (reg::SYNC1, 0x54),
    (reg::SYNC0, 0x3D),
    (reg::PKTLEN, 0xFF),
    (reg::PKTCTRL1, 0x00),
    (reg::PKTCTRL0, 0x00),
    (reg::ADDR, 0x00),
    (reg::CHANNR, 0x00),
    (reg::FSCTRL1, 0x08),
    (reg::FSCTRL0, 0x00),
    (reg::FREQ2, 0x21),
    (reg::FREQ1, 0x6B),
    (reg::FREQ0, 0xD0),
    (reg::MDMCFG4, 0x5C),
    (reg::MDMCFG3, 0x04),
    (reg::MDMCFG2, 0x06),
    (reg::MDMCFG1, 0x22),
    (reg::MDMCFG0, 0xF8),
    (reg::DEVIATN, 0x44),
    (reg::MCSM2, 0x07),
    (reg::MCSM1, 0x00),
    (reg::MCSM0, 0x18),
    (reg::FOCCFG, 0x2E),
    (reg::BSCFG, 0xBF),
    (reg::AGCCTRL2, 0x43),
    (reg::AGCCTRL1, 0x09),
    (reg::AGCCTRL0, 0xB5),
    (reg::WOREVT1, 0x87),
    (reg::WOREVT0, 0x6B),
    (reg::WORCTRL, 0xFB),
    (reg::FREND1, 0xB6),
    (reg::FREND0, 0x10),
    (reg::FSCAL3, 0xEA),
    (reg::FSCAL2, 0x2A),
    (reg::FSCAL1, 0x00),
    (reg::FSCAL0, 0x1F),
    (reg::RCCTRL1, 0x41),
    (reg::RCCTRL0, 0x00),
    (reg::FSTEST, 0x59),
    (reg::PTEST, 0x7F),
    (reg::AGCTEST, 0x3F),
    (reg::TEST2, 0x81),
    (reg::TEST1, 0x35),
    (reg::TEST0, 0x09),
];

/* Keep the FIFO threshold low, the FIFO is only 64 bytes deep. */
const RX_FIFO_THRESHOLD: u8 = 0x07;
const MAX_FIXED_LENGTH: usize = 0xFF;

pub struct Cc1101<SPI, IN> {
    spi: SPI,
    gdo0: IN,
    gdo2: IN,
    fifo: VecDeque<u8>,
    expected: Option<usize>,
    delivered: usize,
    overflowed: bool,
}

impl<SPI: SpiDevice, IN: InputPin> Cc1101<SPI, IN> {
    pub fn new(spi: SPI, gdo0: IN, gdo2: IN) -> Cc1101<SPI, IN> {
        Cc1101 {
            spi,
            gdo0,
            gdo2,
            fifo: VecDeque::new(),
            expected: None,
            delivered: 0,
            overflowed: false,
        }
    }

    /// The FIFO threshold line, exposed for platform interrupt glue.
    pub fn gdo0_pin(&mut self) -> &mut IN {
        &mut self.gdo0
    }

    fn write_register(&mut self, addr: u8, value: u8) -> Result<(), RadioError> {
        let mut buf = [addr, value];
        self.spi.transfer_in_place(&mut buf).map_err(|_| RadioError::Spi)
    }

    #[allow(dead_code)]
    fn read_register(&mut self, addr: u8) -> Result<u8, RadioError> {
        let mut buf = [addr | READ_SINGLE, 0x00];
        self.spi.transfer_in_place(&mut buf).map_err(|_| RadioError::Spi)?;
        Ok(buf[1])
    }

    fn read_status(&mut self, addr: u8) -> Result<u8, RadioError> {
        let mut buf = [addr | READ_BURST, 0x00];
        self.spi.transfer_in_place(&mut buf).map_err(|_| RadioError::Spi)?;
        Ok(buf[1])
    }

    fn strobe(&mut self, cmd: u8) -> Result<(), RadioError> {
        let mut buf = [cmd];
        self.spi.transfer_in_place(&mut buf).map_err(|_| RadioError::Spi)
    }

    fn read_rx_fifo(&mut self, n: usize) -> Result<(), RadioError> {
        if n == 0 {
            return Ok(());
        }
        let mut buf = vec![0u8; n + 1];
        buf[0] = FIFO | READ_BURST;
        self.spi.transfer_in_place(&mut buf).map_err(|_| RadioError::Spi)?;
        self.fifo.extend(buf[1..].iter().copied());
        Ok(())
    }

    fn wait_for_marcstate(&mut self, wanted: u8) -> Result<(), RadioError> {
        for _ in 0..10 {
            if self.read_status(MARCSTATE)? == wanted {
                return Ok(());
            }
            std::thread::sleep(std::time::Duration::from_millis(1));
        }
        Err(RadioError::BadChipState)
    }

    fn set_idle(&mut self) -> Result<(), RadioError> {
        self.strobe(SIDLE)?;
        self.wait_for_marcstate(MARC_IDLE)
    }

    /* Pull bytes from the chip FIFO into the local queue. The chip errata
       forbids emptying the FIFO while a packet is still arriving, so one
       byte stays behind until the expected count is in reach. */
    fn refill(&mut self) -> Result<(), RadioError> {
        let rxbytes = self.read_status(RXBYTES)?;
        if rxbytes & 0x80 != 0 {
            warn!("cc1101 rx fifo overflow, flushing");
            self.overflowed = true;
            return Err(RadioError::FifoOverflow);
        }
        let in_fifo = (rxbytes & 0x7F) as usize;
        if in_fifo == 0 {
            return Ok(());
        }
        let buffered = self.delivered + self.fifo.len();
        let take = match self.expected {
            Some(e) if buffered + in_fifo >= e => std::cmp::min(in_fifo, e - buffered),
            _ => in_fifo.saturating_sub(1),
        };
        self.read_rx_fifo(take)
    }
}

impl<SPI: SpiDevice + Send, IN: InputPin + Send> Transceiver for Cc1101<SPI, IN> {
    fn name(&self) -> &'static str {
        "CC1101"
    }

    fn setup(&mut self) -> Result<(), RadioError> {
        self.strobe(SRES)?;
        std::thread::sleep(std::time::Duration::from_millis(10));

        let partnum = self.read_status(PARTNUM)?;
        let version = self.read_status(VERSION)?;
        if version == 0x00 || version == 0xFF {
            warn!("cc1101 not detected, check wiring (version {:02x})", version);
            return Err(RadioError::BadChipState);
        }
        if partnum != 0x00 {
            warn!("unexpected cc1101 partnum {:02x}", partnum);
        }
        debug!("cc1101 detected, partnum {:02x} version {:02x}", partnum, version);

        for (addr, value) in WMBUS_RF_SETTINGS {
            self.write_register(addr, value)?;
        }

        self.strobe(SCAL)?;
        std::thread::sleep(std::time::Duration::from_millis(4));
        self.restart_rx()
    }

    fn restart_rx(&mut self) -> Result<(), RadioError> {
        self.set_idle()?;
        self.strobe(SFTX)?;
        self.strobe(SFRX)?;
        self.write_register(reg::FIFOTHR, 0x0A)?;
        /* Infinite packet length until the frame size is known. */
        self.write_register(reg::PKTCTRL0, 0x02)?;
        self.fifo.clear();
        self.expected = None;
        self.delivered = 0;
        self.overflowed = false;
        self.strobe(SRX)?;
        self.wait_for_marcstate(MARC_RX)
    }

    fn read(&mut self) -> Option<u8> {
        if self.fifo.is_empty() && self.refill().is_err() {
            return None;
        }
        let b = self.fifo.pop_front();
        if b.is_some() {
            self.delivered += 1;
        }
        b
    }

    fn uses_fifo_reading(&self) -> bool {
        true
    }

    fn get_rssi(&mut self) -> i8 {
        let raw = self.read_status(RSSI).unwrap_or(0) as i16;
        let dbm = if raw >= 128 { (raw - 256) / 2 - 74 } else { raw / 2 - 74 };
        dbm as i8
    }

    fn sync_asserted(&mut self) -> bool {
        self.gdo2.is_high().unwrap_or(false)
    }

    fn set_expected_length(&mut self, len: usize) -> Result<(), RadioError> {
        self.expected = Some(len);
        if len < MAX_FIXED_LENGTH {
            self.write_register(reg::PKTLEN, len as u8)?;
            self.write_register(reg::PKTCTRL0, 0x00)?;
        }
        self.write_register(reg::FIFOTHR, RX_FIFO_THRESHOLD)
    }

    fn attach_data_interrupt(&mut self, line: IrqLine) {
        /* Platform glue wires the GDO0 edge to line.fire(); the driver
           itself only polls the pins. */
        debug!("cc1101 data interrupt armed on pin {}", line.pin);
    }
}

#[cfg(test)]
mod cc1101_tests {
    use super::*;
    use embedded_hal_mock::eh1::digital::{
        Mock as PinMock, State as PinState, Transaction as PinTransaction,
    };
    use embedded_hal_mock::eh1::spi::{Mock as SpiMock, Transaction as SpiTransaction};

    fn xfer(write: Vec<u8>, read: Vec<u8>) -> Vec<SpiTransaction<u8>> {
        vec![
            SpiTransaction::transaction_start(),
            SpiTransaction::transfer_in_place(write, read),
            SpiTransaction::transaction_end(),
        ]
    }

    #[test]
    fn refill_honors_fifo_errata() {
        /* 10 bytes in the FIFO, no expected length known yet: only nine
           may be drained. */
        let mut expectations = Vec::new();
        expectations.extend(xfer(vec![RXBYTES | READ_BURST, 0x00], vec![0x00, 10]));
        let mut fifo_read = vec![0u8; 10];
        fifo_read[0] = FIFO | READ_BURST;
        let mut fifo_resp = vec![0u8; 10];
        for (i, b) in fifo_resp.iter_mut().enumerate().skip(1) {
            *b = i as u8;
        }
        expectations.extend(xfer(fifo_read, fifo_resp));

        let spi = SpiMock::new(&expectations);
        let gdo0 = PinMock::new(&[] as &[PinTransaction]);
        let gdo2 = PinMock::new(&[] as &[PinTransaction]);
        let mut radio = Cc1101::new(spi, gdo0, gdo2);

        radio.refill().unwrap();
        assert_eq!(radio.fifo.len(), 9);

        radio.spi.done();
        radio.gdo0.done();
        radio.gdo2.done();
    }

    #[test]
    fn refill_drains_fully_when_frame_completes() {
        let mut expectations = Vec::new();
        expectations.extend(xfer(vec![RXBYTES | READ_BURST, 0x00], vec![0x00, 4]));
        let mut fifo_read = vec![0u8; 5];
        fifo_read[0] = FIFO | READ_BURST;
        expectations.extend(xfer(fifo_read, vec![0x00, 0xAA, 0xBB, 0xCC, 0xDD]));

        let spi = SpiMock::new(&expectations);
        let gdo0 = PinMock::new(&[] as &[PinTransaction]);
        let gdo2 = PinMock::new(&[] as &[PinTransaction]);
        let mut radio = Cc1101::new(spi, gdo0, gdo2);
        radio.expected = Some(4);

        radio.refill().unwrap();
        assert_eq!(radio.fifo.iter().copied().collect::<Vec<u8>>(), vec![0xAA, 0xBB, 0xCC, 0xDD]);

        radio.spi.done();
        radio.gdo0.done();
        radio.gdo2.done();
    }

    #[test]
    fn overflow_flag_aborts_refill() {
        let expectations = xfer(vec![RXBYTES | READ_BURST, 0x00], vec![0x00, 0x85]);
        let spi = SpiMock::new(&expectations);
        let gdo0 = PinMock::new(&[] as &[PinTransaction]);
        let gdo2 = PinMock::new(&[] as &[PinTransaction]);
        let mut radio = Cc1101::new(spi, gdo0, gdo2);

        assert_eq!(radio.refill(), Err(RadioError::FifoOverflow));
        assert!(radio.overflowed);

        radio.spi.done();
        radio.gdo0.done();
        radio.gdo2.done();
    }

    #[test]
    fn sync_line_reads_gdo2() {
        let spi = SpiMock::new(&[] as &[SpiTransaction<u8>]);
        let gdo0 = PinMock::new(&[] as &[PinTransaction]);
        let gdo2 = PinMock::new(&[PinTransaction::get(PinState::High)]);
        let mut radio = Cc1101::new(spi, gdo0, gdo2);
        assert!(radio.sync_asserted());

        radio.spi.done();
        radio.gdo0.done();
        radio.gdo2.done();
    }
}
