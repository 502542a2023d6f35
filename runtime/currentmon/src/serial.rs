// SPDX-License-Identifier: GPL-3.0-or-later
// Copyright (c) 2024 Takashi Sakamoto

//! Serial I/O worker owning the CDC ACM port.
//!
//! One thread reads the port and unstuffs frames, a second drains the
//! outbound queue. Deframed frames are handed over a bounded channel so
//! CBOR work never runs on the I/O thread.

use {
    std::{
        io::{self, Write},
        sync::{
            atomic::{AtomicBool, Ordering},
            mpsc, Arc,
        },
        thread,
        time::Duration,
    },
    tracing::{debug, error, info},
    cdc_currentmon_protocols::{cobs, mux},
    crate::{Error, FrameSink},
};

/// Nominal rate; CDC ACM ignores the line coding.
const BAUD_RATE: u32 = 115_200;

const READ_CHUNK: usize = 4096;

/// Bytes requested by the blocking read when nothing is pending.
const SHORT_READ: usize = 20;

const READ_TIMEOUT: Duration = Duration::from_millis(10);

/// Poll interval of the writer thread on its outbound queue.
const WRITE_POLL: Duration = Duration::from_millis(40);

/// Deframed frames buffered towards the pump thread.
const INBOUND_QUEUE_DEPTH: usize = 256;

/// USB DMA on the device requires writes padded to 4 byte multiples.
fn pad_block(block: &mut Vec<u8>) {
    let rem = block.len() % 4;
    if rem > 0 {
        block.resize(block.len() + 4 - rem, 0);
    }
}

/// Owns the serial port and its reader and writer threads.
pub struct SerialWorker {
    alive: Arc<AtomicBool>,
    running: Arc<AtomicBool>,
    outbound: mpsc::Sender<Vec<u8>>,
    reader: Option<thread::JoinHandle<()>>,
    writer: Option<thread::JoinHandle<()>>,
}

impl Drop for SerialWorker {
    fn drop(&mut self) {
        self.shutdown();
    }
}

impl SerialWorker {
    /// Open the port and launch both threads.
    ///
    /// The returned receiver yields every unstuffed frame in arrival
    /// order.
    pub fn open(path: &str) -> Result<(Self, mpsc::Receiver<Vec<u8>>), Error> {
        let port = serialport::new(path, BAUD_RATE)
            .timeout(READ_TIMEOUT)
            .open()?;
        let writer_port = port.try_clone()?;
        info!("opened serial port {}", path);

        let (frame_tx, frame_rx) = mpsc::sync_channel(INBOUND_QUEUE_DEPTH);
        let (out_tx, out_rx) = mpsc::channel::<Vec<u8>>();

        let alive = Arc::new(AtomicBool::new(true));
        let running = Arc::new(AtomicBool::new(true));

        let reader = thread::Builder::new()
            .name("serial reader".to_string())
            .spawn({
                let alive = Arc::clone(&alive);
                let running = Arc::clone(&running);
                move || reader_loop(port, &alive, &running, &frame_tx)
            })?;

        let writer = thread::Builder::new()
            .name("serial writer".to_string())
            .spawn({
                let alive = Arc::clone(&alive);
                move || writer_loop(writer_port, &alive, &out_rx)
            })?;

        let worker = SerialWorker {
            alive,
            running,
            outbound: out_tx,
            reader: Some(reader),
            writer: Some(writer),
        };

        Ok((worker, frame_rx))
    }

    /// Whether the reader still services the port.
    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Cloneable handle queueing outbound frames to the writer thread.
    pub fn sink(&self) -> SerialSink {
        SerialSink {
            outbound: self.outbound.clone(),
            running: Arc::clone(&self.running),
        }
    }

    /// Stop both threads and release the port. Idempotent.
    pub fn shutdown(&mut self) {
        if !self.alive.swap(false, Ordering::SeqCst) {
            return;
        }

        if let Some(th) = self.reader.take() {
            if th.join().is_err() {
                error!("serial reader thread panicked");
            }
        }
        if let Some(th) = self.writer.take() {
            if th.join().is_err() {
                error!("serial writer thread panicked");
            }
        }
        self.running.store(false, Ordering::SeqCst);
        info!("serial worker shut down");
    }
}

fn reader_loop(
    mut port: Box<dyn serialport::SerialPort>,
    alive: &AtomicBool,
    running: &AtomicBool,
    frames: &mpsc::SyncSender<Vec<u8>>,
) {
    info!("serial reader started");

    let mut deframer = cobs::Deframer::default();
    let mut buf = [0u8; READ_CHUNK];
    let mut dropped = 0;
    while alive.load(Ordering::SeqCst) {
        let n = match read_chunk(port.as_mut(), &mut buf) {
            Ok(n) => n,
            Err(e) => {
                error!("serial connection lost: {}", e);
                break;
            }
        };
        if n == 0 {
            continue;
        }

        let mut delivered = Ok(());
        deframer.feed(&buf[..n], |frame| {
            if delivered.is_ok() {
                delivered = frames.send(frame);
            }
        });
        if delivered.is_err() {
            // The pump dropped its receiver; nothing left to feed.
            break;
        }
        if deframer.dropped() > dropped {
            debug!("skipped {} undecodable frames", deframer.dropped() - dropped);
            dropped = deframer.dropped();
        }
    }

    running.store(false, Ordering::SeqCst);
    info!("serial reader stopped");
}

/// Read whatever is available, or block briefly for up to a handful of
/// bytes and then drain the rest.
fn read_chunk(
    port: &mut dyn serialport::SerialPort,
    buf: &mut [u8],
) -> Result<usize, Error> {
    let pending = port.bytes_to_read()? as usize;
    if pending > 0 {
        let want = pending.min(buf.len());
        return match port.read(&mut buf[..want]) {
            Ok(n) => Ok(n),
            Err(e) if e.kind() == io::ErrorKind::TimedOut => Ok(0),
            Err(e) => Err(Error::Io(e)),
        };
    }

    let mut n = match port.read(&mut buf[..SHORT_READ]) {
        Ok(n) => n,
        Err(e) if e.kind() == io::ErrorKind::TimedOut => 0,
        Err(e) => return Err(Error::Io(e)),
    };
    if n > 0 {
        let more = (port.bytes_to_read()? as usize).min(buf.len() - n);
        if more > 0 {
            match port.read(&mut buf[n..n + more]) {
                Ok(m) => n += m,
                Err(e) if e.kind() == io::ErrorKind::TimedOut => (),
                Err(e) => return Err(Error::Io(e)),
            }
        }
    }

    Ok(n)
}

fn writer_loop(
    mut port: Box<dyn serialport::SerialPort>,
    alive: &AtomicBool,
    outbound: &mpsc::Receiver<Vec<u8>>,
) {
    info!("serial writer started");

    while alive.load(Ordering::SeqCst) {
        let mut block = match outbound.recv_timeout(WRITE_POLL) {
            Ok(block) => block,
            Err(mpsc::RecvTimeoutError::Timeout) => continue,
            Err(mpsc::RecvTimeoutError::Disconnected) => break,
        };
        pad_block(&mut block);
        if let Err(e) = port.write_all(&block) {
            error!("serial write failed: {}", e);
            break;
        }
    }

    info!("serial writer stopped");
}

/// Cloneable handle queueing stuffed frames to the writer thread.
#[derive(Clone)]
pub struct SerialSink {
    outbound: mpsc::Sender<Vec<u8>>,
    running: Arc<AtomicBool>,
}

impl FrameSink for SerialSink {
    fn send_frame(&self, port: u8, payload: &[u8]) -> Result<(), Error> {
        if !self.running.load(Ordering::SeqCst) {
            return Err(Error::NotRunning);
        }
        let block = cobs::encode_delimited(&mux::encode(port, payload));
        self.outbound.send(block).map_err(|_| Error::NotRunning)
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn blocks_are_padded_to_dma_multiples() {
        let mut block = vec![1, 2, 3];
        pad_block(&mut block);
        assert_eq!(block, vec![1, 2, 3, 0]);

        let mut block = vec![1, 2, 3, 4];
        pad_block(&mut block);
        assert_eq!(block.len(), 4);

        let mut block = vec![9; 5];
        pad_block(&mut block);
        assert_eq!(block.len(), 8);

        let mut block = Vec::new();
        pad_block(&mut block);
        assert!(block.is_empty());
    }
}
