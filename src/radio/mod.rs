//! Transceiver abstraction and the receive loop: a radio task drives an
//! explicit state machine over a byte FIFO or a packet buffer and pushes
//! complete raw frames onto a small bounded queue.

use std::sync::Arc;
use std::time::Duration;

use log::{debug, info, warn};
use thiserror::Error;
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, Notify};
use tokio::time::{timeout, Instant};

use crate::link;

#[cfg(feature = "cc1101")]
pub mod cc1101;
#[cfg(feature = "sx1262")]
pub mod sx1262;

/// Custom error types for the radio layer
#[derive(Error, Debug, Clone, PartialEq)]
pub enum RadioError {
    #[error("no sync or no progress within the configured window")]
    Timeout,
    #[error("rx fifo overflow")]
    FifoOverflow,
    #[error("chip did not reach the expected state")]
    BadChipState,
    #[error("spi transfer failed")]
    Spi,
    #[error("frame header could not be decoded")]
    BadHeader,
}

/// One received radio frame, before link-layer validation.
#[derive(Debug, Clone)]
pub struct RawPacket {
    pub data: Vec<u8>,
    pub rssi_dbm: i8,
}

/// Typed payload of the data interrupt. The ISR side only releases the
/// notify, it must not touch SPI, logging or the allocator.
#[derive(Clone)]
pub struct IrqLine {
    pub pin: u8,
    pub inverted: bool,
    notify: Arc<Notify>,
}

impl IrqLine {
    pub fn new(pin: u8, inverted: bool) -> IrqLine {
        IrqLine { pin, inverted, notify: Arc::new(Notify::new()) }
    }

    /// Callable from interrupt context.
    pub fn fire(&self) {
        self.notify.notify_one();
    }

    pub async fn wait(&self) {
        self.notify.notified().await;
    }
}

/// The narrow contract a chip driver offers to the receive loop.
pub trait Transceiver: Send {
    fn name(&self) -> &'static str;

    /// One-time calibration, idempotent on reset.
    fn setup(&mut self) -> Result<(), RadioError>;

    /// Enter RX and flush FIFOs.
    fn restart_rx(&mut self) -> Result<(), RadioError>;

    /// Byte oriented chips pop one FIFO byte, non blocking.
    fn read(&mut self) -> Option<u8> {
        None
    }

    /// Packet oriented chips copy a whole packet out, starting at
    /// `offset` in `buf`. 0 while waiting.
    fn get_frame(&mut self, _buf: &mut [u8], _offset: usize) -> usize {
        0
    }

    /// Selects between the two receive paths.
    fn uses_fifo_reading(&self) -> bool;

    fn get_rssi(&mut self) -> i8;

    /// Sync word detected line (GDO2/DIO style).
    fn sync_asserted(&mut self) -> bool {
        false
    }

    /// Once the expected byte count is known the loop switches FIFO chips
    /// from infinite to fixed length mode.
    fn set_expected_length(&mut self, _len: usize) -> Result<(), RadioError> {
        Ok(())
    }

    /// Install the edge interrupt payload.
    fn attach_data_interrupt(&mut self, _line: IrqLine) {}

    /// How often packet oriented chips are polled.
    fn polling_interval(&self) -> Duration {
        Duration::from_millis(2)
    }
}

/* Longest possible frame on the wire: a 255 byte mode T telegram with all
   block CRCs, 3-of-6 encoded. */
const MAX_WIRE_FRAME: usize = 512;

/* No-progress window after sync, extended a little on each progress
   event. */
const INITIAL_MAX_WAIT: Duration = Duration::from_millis(150);
const PROGRESS_EXTENSION: Duration = Duration::from_millis(50);
const MAX_WAIT_CAP: Duration = Duration::from_millis(1000);

/* Interrupt driven chips may sleep this long between wakeups. */
const SYNC_WAIT: Duration = Duration::from_secs(60);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RxState {
    InitRx,
    WaitForSync,
    WaitForData,
    ReadData,
}

/// The radio task: owns the transceiver after setup and feeds the packet
/// queue. One frame per `receive_frame` invocation.
pub struct Receiver<T: Transceiver> {
    radio: T,
    queue: mpsc::Sender<RawPacket>,
    irq: IrqLine,
    state: RxState,
    buf: Vec<u8>,
    expected: usize,
}

/// Bounded queue between the radio task and the main task. Three packets
/// deep; a full queue drops the newest frame.
pub fn packet_channel() -> (mpsc::Sender<RawPacket>, mpsc::Receiver<RawPacket>) {
    mpsc::channel(3)
}

impl<T: Transceiver> Receiver<T> {
    pub fn new(mut radio: T, queue: mpsc::Sender<RawPacket>) -> Receiver<T> {
        let irq = IrqLine::new(0, false);
        radio.attach_data_interrupt(irq.clone());
        Receiver { radio, queue, irq, state: RxState::InitRx, buf: Vec::new(), expected: 0 }
    }

    pub async fn run(mut self) {
        if let Err(e) = self.radio.setup() {
            warn!("radio setup failed: {}", e);
            return;
        }
        info!("{} receiver task running", self.radio.name());
        loop {
            if let Err(e) = self.receive_frame().await {
                debug!("receive aborted: {}, re-entering rx", e);
                let _ = self.radio.restart_rx();
                self.state = RxState::InitRx;
            }
        }
    }

    async fn receive_frame(&mut self) -> Result<(), RadioError> {
        if self.radio.uses_fifo_reading() {
            self.receive_fifo().await
        } else {
            self.receive_packet().await
        }
    }

    /* Byte FIFO path, e.g. CC1101. */
    async fn receive_fifo(&mut self) -> Result<(), RadioError> {
        let irq = self.irq.clone();

        self.radio.restart_rx()?;
        self.buf.clear();
        self.expected = 0;
        self.state = RxState::WaitForSync;

        /* Sleep until the sync edge fires, or poll slowly without one. */
        while !self.radio.sync_asserted() {
            if timeout(SYNC_WAIT, irq.wait()).await.is_err() {
                debug!("radio interrupt timeout");
                return Ok(());
            }
        }
        self.state = RxState::WaitForData;
        debug!("sync detected");

        let mut deadline = Instant::now() + INITIAL_MAX_WAIT;
        loop {
            let mut progressed = false;
            while let Some(b) = self.radio.read() {
                self.buf.push(b);
                progressed = true;
                if self.buf.len() >= MAX_WIRE_FRAME {
                    return Err(RadioError::BadHeader);
                }
            }
            if progressed {
                deadline = std::cmp::min(
                    deadline + PROGRESS_EXTENSION,
                    Instant::now() + MAX_WAIT_CAP,
                );
            }

            if self.state == RxState::WaitForData && self.buf.len() >= 3 {
                match link::expected_wire_size(&self.buf) {
                    Some((n, mode)) => {
                        debug!("expecting {} bytes ({:?})", n, mode);
                        self.expected = n;
                        self.radio.set_expected_length(n)?;
                        self.state = RxState::ReadData;
                    }
                    None => return Err(RadioError::BadHeader),
                }
            }

            if self.state == RxState::ReadData && self.buf.len() >= self.expected {
                self.buf.truncate(self.expected);
                self.frame_ready();
                return Ok(());
            }

            match timeout_at(deadline, irq.wait()).await {
                Ok(_) => {}
                Err(_) => {
                    /* One final drain, the last bytes may have landed
                       between the poll and the timeout. */
                    if self.radio.read().is_none() {
                        return Err(RadioError::Timeout);
                    }
                }
            }
        }
    }

    /* Packet buffer path, e.g. SX1262. */
    async fn receive_packet(&mut self) -> Result<(), RadioError> {
        let irq = self.irq.clone();
        let _ = timeout(self.radio.polling_interval(), irq.wait()).await;

        let mut buf = vec![0u8; MAX_WIRE_FRAME];
        let n = self.radio.get_frame(&mut buf, 0);
        if n == 0 {
            return Ok(());
        }
        buf.truncate(n);
        self.buf = buf;
        self.frame_ready();
        self.radio.restart_rx()?;
        Ok(())
    }

    /* FRAME_READY: hand the bytes to the main task. The queue keeps the
       oldest packets, a full queue drops the new frame. */
    fn frame_ready(&mut self) {
        let rssi_dbm = self.radio.get_rssi();
        let data = std::mem::take(&mut self.buf);
        debug!("have frame ({} bytes, rssi {} dBm)", data.len(), rssi_dbm);
        match self.queue.try_send(RawPacket { data, rssi_dbm }) {
            Ok(()) => {}
            Err(TrySendError::Full(_)) => warn!("packet queue full, dropping new frame"),
            Err(TrySendError::Closed(_)) => warn!("packet queue closed"),
        }
        self.state = RxState::InitRx;
    }
}

async fn timeout_at<F: std::future::Future>(
    deadline: Instant,
    fut: F,
) -> Result<F::Output, tokio::time::error::Elapsed> {
    tokio::time::timeout_at(deadline, fut).await
}

#[cfg(test)]
mod radio_tests {
    use super::*;
    use crate::link::threeof6;

    /* In-memory transceiver scripted with wire bytes. */
    struct FakeFifoRadio {
        bytes: Vec<u8>,
        pos: usize,
        synced: bool,
        fixed_length: Option<usize>,
        restarts: usize,
    }

    impl FakeFifoRadio {
        fn new(bytes: Vec<u8>) -> FakeFifoRadio {
            FakeFifoRadio { bytes, pos: 0, synced: true, fixed_length: None, restarts: 0 }
        }
    }

    impl Transceiver for FakeFifoRadio {
        fn name(&self) -> &'static str {
            "fake"
        }
        fn setup(&mut self) -> Result<(), RadioError> {
            Ok(())
        }
        fn restart_rx(&mut self) -> Result<(), RadioError> {
            self.restarts += 1;
            Ok(())
        }
        fn read(&mut self) -> Option<u8> {
            if self.pos < self.bytes.len() {
                let b = self.bytes[self.pos];
                self.pos += 1;
                Some(b)
            } else {
                None
            }
        }
        fn uses_fifo_reading(&self) -> bool {
            true
        }
        fn get_rssi(&mut self) -> i8 {
            -72
        }
        fn sync_asserted(&mut self) -> bool {
            self.synced
        }
        fn set_expected_length(&mut self, len: usize) -> Result<(), RadioError> {
            self.fixed_length = Some(len);
            Ok(())
        }
    }

    const ANNEX_N_WITH_CRC: &str = "2E44931578563412330333637A2A0020255923C95AAA26D1B2E7493BC2AD013EC4A6F6D3529B520EDFF0EA6DEFC955B29D6D69EBF3EC8A";

    #[tokio::test]
    async fn fifo_path_assembles_mode_t_frame() {
        let wire = threeof6::encode(&hex::decode(ANNEX_N_WITH_CRC).unwrap());
        let expected_len = wire.len();

        let (tx, mut rx) = packet_channel();
        let mut receiver = Receiver::new(FakeFifoRadio::new(wire.clone()), tx);
        receiver.receive_frame().await.unwrap();

        let packet = rx.try_recv().unwrap();
        assert_eq!(packet.data, wire);
        assert_eq!(packet.rssi_dbm, -72);
        assert_eq!(receiver.radio.fixed_length, Some(expected_len));

        /* And the frame decodes through the link layer. */
        let frame = crate::link::decode(packet.data, packet.rssi_dbm).unwrap();
        assert_eq!(frame.link_mode, crate::link::LinkMode::T1);
        assert_eq!(frame.data[0] as usize, frame.data.len() - 1);
    }

    #[tokio::test]
    async fn fifo_path_times_out_without_data() {
        tokio::time::pause();
        let radio = FakeFifoRadio { bytes: vec![0x54], pos: 0, synced: true, fixed_length: None, restarts: 0 };
        let (tx, mut rx) = packet_channel();
        let mut receiver = Receiver::new(radio, tx);
        let err = receiver.receive_frame().await.unwrap_err();
        assert_eq!(err, RadioError::Timeout);
        assert_eq!(receiver.radio.restarts, 1);
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn queue_drops_new_frames_when_full() {
        let wire = threeof6::encode(&hex::decode(ANNEX_N_WITH_CRC).unwrap());
        let (tx, mut rx) = packet_channel();
        let mut receiver = Receiver::new(FakeFifoRadio::new(wire.clone()), tx);

        for _ in 0..5 {
            receiver.radio.pos = 0;
            receiver.receive_frame().await.unwrap();
        }
        /* Capacity is three, the fourth and fifth were dropped. */
        let mut received = 0;
        while rx.try_recv().is_ok() {
            received += 1;
        }
        assert_eq!(received, 3);
    }

    struct FakePacketRadio {
        frame: Vec<u8>,
        armed: bool,
    }

    impl Transceiver for FakePacketRadio {
        fn name(&self) -> &'static str {
            "fake-packet"
        }
        fn setup(&mut self) -> Result<(), RadioError> {
            Ok(())
        }
        fn restart_rx(&mut self) -> Result<(), RadioError> {
            Ok(())
        }
        fn uses_fifo_reading(&self) -> bool {
            false
        }
        fn get_frame(&mut self, buf: &mut [u8], offset: usize) -> usize {
            if !self.armed {
                return 0;
            }
            self.armed = false;
            buf[offset..offset + self.frame.len()].copy_from_slice(&self.frame);
            self.frame.len()
        }
        fn get_rssi(&mut self) -> i8 {
            -85
        }
    }

    #[tokio::test]
    async fn packet_path_hands_over_whole_buffer() {
        let mut wire = vec![0x54, 0xCD];
        wire.extend(hex::decode(ANNEX_N_WITH_CRC).unwrap());

        let (tx, mut rx) = packet_channel();
        let mut receiver = Receiver::new(FakePacketRadio { frame: wire.clone(), armed: true }, tx);
        receiver.receive_frame().await.unwrap();

        let packet = rx.try_recv().unwrap();
        assert_eq!(packet.data, wire);
        let frame = crate::link::decode(packet.data, packet.rssi_dbm).unwrap();
        assert_eq!(frame.link_mode, crate::link::LinkMode::C1);
    }
}
