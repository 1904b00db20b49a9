//! SX1262 SPI transceiver, packet oriented. The chip fires DIO1 once a
//! whole packet sits in its buffer; the receive loop copies it out in one
//! bulk read.

use embedded_hal::digital::InputPin;
use embedded_hal::spi::SpiDevice;
use log::{debug, warn};

use super::{IrqLine, RadioError, Transceiver};

// Command opcodes
const SET_STANDBY: u8 = 0x80;
const SET_RX: u8 = 0x82;
const SET_PACKET_TYPE: u8 = 0x8A;
const SET_RF_FREQUENCY: u8 = 0x86;
const SET_BUFFER_BASE_ADDRESS: u8 = 0x8F;
const SET_MODULATION_PARAMS: u8 = 0x8B;
const SET_PACKET_PARAMS: u8 = 0x8C;
const SET_DIO_IRQ_PARAMS: u8 = 0x08;
const WRITE_REGISTER: u8 = 0x0D;
const READ_BUFFER: u8 = 0x1E;
const GET_IRQ_STATUS: u8 = 0x12;
const CLEAR_IRQ_STATUS: u8 = 0x02;
const GET_RX_BUFFER_STATUS: u8 = 0x13;
const GET_PACKET_STATUS: u8 = 0x14;

const IRQ_RX_DONE: u16 = 1 << 1;

// Sync word registers
const REG_SYNC_WORD_0: u16 = 0x06C0;

/* Calibration blob: GFSK 100 kbit/s, 868.95 MHz, sync on the wM-Bus
   preamble 0x54 0x3D, infinite preamble tolerance, no CRC engine (the
   link layer validates the block CRCs itself). */
const SETUP_COMMANDS: &[&[u8]] = &[
    &[SET_STANDBY, 0x00],
    &[SET_PACKET_TYPE, 0x00], // GFSK
    /* 868.95 MHz: freq * 2^25 / 32 MHz */
    &[SET_RF_FREQUENCY, 0x36, 0x4C, 0xCC, 0xCD],
    &[SET_BUFFER_BASE_ADDRESS, 0x00, 0x00],
    /* 100 kbit/s, BT off, 120 kHz rx bandwidth, 50 kHz deviation */
    &[SET_MODULATION_PARAMS, 0x00, 0x05, 0x00, 0x00, 0x09, 0x19, 0x00, 0x0C, 0xCD],
    /* 16 bit preamble detect, 16 bit sync, variable length up to 255 */
    &[SET_PACKET_PARAMS, 0x00, 0x10, 0x04, 0x10, 0x00, 0x00, 0xFF, 0x01, 0x00],
    /* Route RxDone to DIO1 */
    &[SET_DIO_IRQ_PARAMS, 0x02, 0x62, 0x00, 0x02, 0x00, 0x00, 0x00, 0x00],
];

pub struct Sx1262<SPI, IN> {
    spi: SPI,
    busy: IN,
    dio1: IN,
}

impl<SPI: SpiDevice, IN: InputPin> Sx1262<SPI, IN> {
    pub fn new(spi: SPI, busy: IN, dio1: IN) -> Sx1262<SPI, IN> {
        Sx1262 { spi, busy, dio1 }
    }

    /// The packet interrupt line, exposed for platform interrupt glue.
    pub fn dio1_pin(&mut self) -> &mut IN {
        &mut self.dio1
    }

    fn wait_busy(&mut self) -> Result<(), RadioError> {
        for _ in 0..100 {
            if !self.busy.is_high().map_err(|_| RadioError::Spi)? {
                return Ok(());
            }
            std::thread::sleep(std::time::Duration::from_millis(1));
        }
        Err(RadioError::BadChipState)
    }

    fn command(&mut self, bytes: &[u8]) -> Result<(), RadioError> {
        self.wait_busy()?;
        self.spi.write(bytes).map_err(|_| RadioError::Spi)
    }

    fn command_read(&mut self, cmd: &[u8], response: &mut [u8]) -> Result<(), RadioError> {
        self.wait_busy()?;
        self.spi
            .transaction(&mut [
                embedded_hal::spi::Operation::Write(cmd),
                embedded_hal::spi::Operation::Read(response),
            ])
            .map_err(|_| RadioError::Spi)
    }

    fn write_chip_register(&mut self, addr: u16, value: u8) -> Result<(), RadioError> {
        self.command(&[WRITE_REGISTER, (addr >> 8) as u8, (addr & 0xFF) as u8, value])
    }

    fn irq_status(&mut self) -> Result<u16, RadioError> {
        let mut resp = [0u8; 3];
        self.command_read(&[GET_IRQ_STATUS], &mut resp)?;
        Ok(u16::from_be_bytes([resp[1], resp[2]]))
    }

    fn clear_irq(&mut self) -> Result<(), RadioError> {
        self.command(&[CLEAR_IRQ_STATUS, 0x03, 0xFF])
    }
}

impl<SPI: SpiDevice + Send, IN: InputPin + Send> Transceiver for Sx1262<SPI, IN> {
    fn name(&self) -> &'static str {
        "SX1262"
    }

    fn setup(&mut self) -> Result<(), RadioError> {
        for cmd in SETUP_COMMANDS {
            self.command(cmd)?;
        }
        self.write_chip_register(REG_SYNC_WORD_0, 0x54)?;
        self.write_chip_register(REG_SYNC_WORD_0 + 1, 0x3D)?;
        debug!("sx1262 configured for wM-Bus reception");
        self.restart_rx()
    }

    fn restart_rx(&mut self) -> Result<(), RadioError> {
        self.clear_irq()?;
        /* Continuous RX. */
        self.command(&[SET_RX, 0xFF, 0xFF, 0xFF])
    }

    fn uses_fifo_reading(&self) -> bool {
        false
    }

    fn get_frame(&mut self, buf: &mut [u8], offset: usize) -> usize {
        match self.irq_status() {
            Ok(irq) if irq & IRQ_RX_DONE != 0 => {}
            Ok(_) => return 0,
            Err(e) => {
                warn!("sx1262 irq read failed: {}", e);
                return 0;
            }
        }

        let mut status = [0u8; 3];
        if self.command_read(&[GET_RX_BUFFER_STATUS], &mut status).is_err() {
            return 0;
        }
        let len = status[1] as usize;
        let start = status[2];
        if len == 0 || offset + len > buf.len() {
            let _ = self.clear_irq();
            return 0;
        }

        let mut ok = true;
        {
            let target = &mut buf[offset..offset + len];
            /* ReadBuffer: opcode, start offset, one NOP, then the data. */
            if self
                .command_read(&[READ_BUFFER, start, 0x00], target)
                .is_err()
            {
                ok = false;
            }
        }
        let _ = self.clear_irq();
        if ok {
            len
        } else {
            0
        }
    }

    fn get_rssi(&mut self) -> i8 {
        let mut resp = [0u8; 4];
        if self.command_read(&[GET_PACKET_STATUS], &mut resp).is_err() {
            return 0;
        }
        /* RssiSync is -value/2 dBm. */
        -((resp[2] / 2) as i8)
    }

    fn sync_asserted(&mut self) -> bool {
        self.dio1.is_high().unwrap_or(false)
    }

    fn attach_data_interrupt(&mut self, line: IrqLine) {
        debug!("sx1262 packet interrupt armed on pin {}", line.pin);
    }
}

#[cfg(test)]
mod sx1262_tests {
    use super::*;
    use embedded_hal_mock::eh1::digital::{
        Mock as PinMock, State as PinState, Transaction as PinTransaction,
    };
    use embedded_hal_mock::eh1::spi::{Mock as SpiMock, Transaction as SpiTransaction};

    #[test]
    fn get_frame_returns_zero_without_rx_done() {
        let expectations = vec![
            SpiTransaction::transaction_start(),
            SpiTransaction::write_vec(vec![GET_IRQ_STATUS]),
            SpiTransaction::read_vec(vec![0x00, 0x00, 0x00]),
            SpiTransaction::transaction_end(),
        ];
        let spi = SpiMock::new(&expectations);
        let busy = PinMock::new(&[PinTransaction::get(PinState::Low)]);
        let dio1 = PinMock::new(&[] as &[PinTransaction]);
        let mut radio = Sx1262::new(spi, busy, dio1);

        let mut buf = [0u8; 64];
        assert_eq!(radio.get_frame(&mut buf, 0), 0);

        radio.spi.done();
        radio.busy.done();
        radio.dio1.done();
    }

    #[test]
    fn get_frame_copies_packet_on_rx_done() {
        let payload = vec![0x54, 0xCD, 0x0A, 0x01, 0x02];
        let mut expectations = vec![
            SpiTransaction::transaction_start(),
            SpiTransaction::write_vec(vec![GET_IRQ_STATUS]),
            SpiTransaction::read_vec(vec![0x00, 0x00, 0x02]),
            SpiTransaction::transaction_end(),
            SpiTransaction::transaction_start(),
            SpiTransaction::write_vec(vec![GET_RX_BUFFER_STATUS]),
            SpiTransaction::read_vec(vec![0x00, payload.len() as u8, 0x00]),
            SpiTransaction::transaction_end(),
            SpiTransaction::transaction_start(),
            SpiTransaction::write_vec(vec![READ_BUFFER, 0x00, 0x00]),
            SpiTransaction::read_vec(payload.clone()),
            SpiTransaction::transaction_end(),
        ];
        expectations.extend(vec![
            SpiTransaction::transaction_start(),
            SpiTransaction::write_vec(vec![CLEAR_IRQ_STATUS, 0x03, 0xFF]),
            SpiTransaction::transaction_end(),
        ]);
        let spi = SpiMock::new(&expectations);
        let busy = PinMock::new(&[
            PinTransaction::get(PinState::Low),
            PinTransaction::get(PinState::Low),
            PinTransaction::get(PinState::Low),
            PinTransaction::get(PinState::Low),
        ]);
        let dio1 = PinMock::new(&[] as &[PinTransaction]);
        let mut radio = Sx1262::new(spi, busy, dio1);

        let mut buf = [0u8; 64];
        let n = radio.get_frame(&mut buf, 0);
        assert_eq!(n, payload.len());
        assert_eq!(&buf[..n], &payload[..]);

        radio.spi.done();
        radio.busy.done();
        radio.dio1.done();
    }
}
