// SPDX-License-Identifier: GPL-3.0-or-later
// Copyright (c) 2024 Takashi Sakamoto

//! Public control surface of the driver.
//!
//! `Instrument` owns the serial worker, the pump thread routing inbound
//! frames to their handlers, the command/response matcher and the trigger
//! engine. Command methods are blocking and safe to call from several
//! threads; one command is in flight at a time.

use {
    std::{
        sync::{
            atomic::{AtomicBool, Ordering},
            mpsc, Arc, Mutex,
        },
        thread,
        time::Duration,
    },
    tracing::{debug, error, info, warn},
    cdc_currentmon_protocols::{
        command::Response,
        mux::{self, MuxFrame},
        params::{AcquireMode, CalLoad, TimebaseSpan, TriggerConfig, TriggerSource},
        port,
        value::Value,
    },
    crate::{
        matcher::{CommandReply, ResponseMatcher},
        serial::{SerialSink, SerialWorker},
        stream::AdcStream,
        trigger::{AcquisitionCallback, AcquisitionData, TriggerEngine},
        Error,
    },
};

/// Hardware revision whose input stage needs the peaking-compensation
/// filter.
const FILTERED_HWVER: &str = "A0431100";

/// Poll interval while waiting for self calibration to finish.
const CAL_POLL_DELAY: Duration = Duration::from_secs(1);

/// Poll budget for a blocking calibration.
const CAL_POLL_RETRIES: u32 = 60;

/// Firmware image reported by `cmd_ping`.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum DeviceApp {
    Bootloader,
    Application,
    Unknown,
}

/// Identity reported by `ping`.
#[derive(Debug, Clone, PartialEq)]
pub struct PingInfo {
    /// Success flag of the response.
    pub success: bool,
    pub app: DeviceApp,
    pub version: Option<String>,
    /// Formatted device serial number.
    pub serial: Option<String>,
    /// Hardware revision as eight hex digits.
    pub hwver: Option<String>,
    /// Whether the link enumerated at USB high speed.
    pub high_speed: bool,
    /// Raw responses for fields not lifted here.
    pub responses: Vec<Response>,
}

/// One record from the firmware logger, passed through undecoded.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogRecord {
    /// Symbol table digit from the record address.
    pub target: u8,
    pub addr: u32,
    pub payload: Vec<u8>,
}

/// Handlers for the pass-through ports.
///
/// All callbacks run inline on the pump thread and must return quickly;
/// copy or hand off to your own queue.
#[derive(Default)]
pub struct Callbacks {
    /// Completed acquisition windows.
    pub acquisition: Option<AcquisitionCallback>,
    /// Decoded asynchronous notification maps from port 1.
    pub notification: Option<Box<dyn FnMut(Value) + Send>>,
    /// Raw debug plot frames from port 2.
    pub plot: Option<Box<dyn FnMut(Vec<u8>) + Send>>,
    /// Firmware log records.
    pub device_log: Option<Box<dyn FnMut(LogRecord) + Send>>,
}

/// State shared between the pump thread and the command surface.
struct StreamShared {
    /// Gates the trigger engine; the stream decoder always runs so the
    /// packet counter stays continuous.
    acquire: AtomicBool,
    core: Mutex<StreamCore>,
}

struct StreamCore {
    adc: AdcStream,
    engine: TriggerEngine,
}

impl StreamShared {
    fn new(acquisition: Option<AcquisitionCallback>) -> Self {
        let mut engine = TriggerEngine::default();
        engine.set_callback(acquisition);
        StreamShared {
            acquire: AtomicBool::new(false),
            core: Mutex::new(StreamCore {
                adc: AdcStream::default(),
                engine,
            }),
        }
    }

    fn ingest(&self, frame: &[u8]) {
        let mut core = self.core.lock().unwrap();
        let packet = match core.adc.ingest(frame) {
            Ok(packet) => packet,
            Err(e) => {
                error!("sample packet decode failed: {}", e);
                return;
            }
        };
        if self.acquire.load(Ordering::SeqCst) {
            core.engine.on_packet(&packet);
        }
    }
}

/// Handle to one instrument on a CDC ACM serial port.
pub struct Instrument {
    cmd_lock: Mutex<()>,
    matcher: Arc<ResponseMatcher>,
    sink: SerialSink,
    stream: Arc<StreamShared>,
    worker: Option<SerialWorker>,
    pump: Option<thread::JoinHandle<()>>,
    hwver: Mutex<Option<String>>,
}

impl Drop for Instrument {
    fn drop(&mut self) {
        self.close();
    }
}

impl Instrument {
    /// Open the serial port and launch the receive pipeline.
    pub fn connect(path: &str, callbacks: Callbacks) -> Result<Self, Error> {
        let (worker, frames) = SerialWorker::open(path)?;
        let sink = worker.sink();
        let matcher = Arc::new(ResponseMatcher::default());

        let Callbacks {
            acquisition,
            notification,
            plot,
            device_log,
        } = callbacks;
        let stream = Arc::new(StreamShared::new(acquisition));

        let pump = thread::Builder::new()
            .name("frame pump".to_string())
            .spawn({
                let matcher = Arc::clone(&matcher);
                let stream = Arc::clone(&stream);
                move || pump_loop(frames, &matcher, &stream, notification, plot, device_log)
            })?;

        Ok(Instrument {
            cmd_lock: Mutex::new(()),
            matcher,
            sink,
            stream,
            worker: Some(worker),
            pump: Some(pump),
            hwver: Mutex::new(None),
        })
    }

    /// Whether the serial worker still services the port.
    pub fn is_connected(&self) -> bool {
        self.worker.as_ref().map_or(false, SerialWorker::is_running)
    }

    /// Stop the worker and the pump. Idempotent.
    pub fn close(&mut self) {
        if let Some(mut worker) = self.worker.take() {
            worker.shutdown();
        }
        if let Some(pump) = self.pump.take() {
            if pump.join().is_err() {
                error!("frame pump thread panicked");
            }
            info!("closed");
        }
    }

    fn command(&self, f: &str, args: &[(&str, Value)]) -> Result<CommandReply, Error> {
        let _guard = self.cmd_lock.lock().unwrap();
        self.matcher.transaction(&self.sink, f, args)
    }

    /// Status snapshot including calibration, probe and error state.
    pub fn status(&self) -> Result<CommandReply, Error> {
        self.command("cmd_status", &[])
    }

    /// Output voltage range and step supported by the hardware.
    pub fn vout_metrics(&self) -> Result<CommandReply, Error> {
        self.command("cmd_vout_metrics", &[])
    }

    /// Set the output voltage in mV.
    pub fn set_vout(&self, value_mv: u32) -> Result<CommandReply, Error> {
        self.command("cmd_vout", &[("mv", Value::from(value_mv))])
    }

    /// Enable pseudo remote sense on the output.
    pub fn set_vout_remote_sense(&self, enable: bool) -> Result<CommandReply, Error> {
        self.command("cmd_vout_rs", &[("en", Value::from(enable))])
    }

    /// Set the over-current threshold in mA.
    pub fn set_ovc(&self, value_ma: u32) -> Result<CommandReply, Error> {
        self.command("cmd_ovrcur", &[("ma", Value::from(value_ma))])
    }

    /// Engage or disengage the probe.
    ///
    /// `hard` bypasses the soft-start ramp, `rs_comp` enables source
    /// resistance compensation on the output.
    pub fn probe(&self, connect: bool, hard: bool, rs_comp: bool) -> Result<CommandReply, Error> {
        self.command(
            "cmd_probe",
            &[
                ("v", Value::from(connect)),
                ("hard", Value::from(hard)),
                ("comp", Value::from(rs_comp)),
            ],
        )
    }

    /// Engage internal calibration loads; an empty list disengages all.
    pub fn set_cal_load(&self, loads: &[CalLoad]) -> Result<CommandReply, Error> {
        self.command("cmd_iload", &[("set", Value::from(CalLoad::mask(loads)))])
    }

    /// Run the internal calibration loads in a sweep pattern.
    pub fn set_cal_sweep(&self, enable: bool) -> Result<CommandReply, Error> {
        self.command("cmd_iload_sweep", &[("en", Value::from(enable))])
    }

    /// Progress and result of the self calibration.
    pub fn cal_status(&self) -> Result<CommandReply, Error> {
        self.command("cmd_cal_status", &[])
    }

    /// Trigger a temperature conversion.
    pub fn temperature_update(&self) -> Result<CommandReply, Error> {
        self.command("cmd_temp102_trigger", &[])
    }

    /// Clear a latched device error.
    pub fn clear_error(&self) -> Result<CommandReply, Error> {
        self.command("cmd_error_clear", &[])
    }

    /// Blink the front LED to identify this unit among several.
    pub fn led_blink(&self) -> Result<CommandReply, Error> {
        self.command("cmd_led_blink", &[])
    }

    /// Send an arbitrary command map.
    pub fn raw_command(&self, f: &str, args: &[(&str, Value)]) -> Result<CommandReply, Error> {
        self.command(f, args)
    }

    /// Run the self calibration.
    ///
    /// Checks first whether calibration is already done and skips it
    /// unless `force` is set. With `blocking` the call polls once per
    /// second until the device reports completion.
    pub fn calibrate(&self, force: bool, blocking: bool) -> Result<CommandReply, Error> {
        let _guard = self.cmd_lock.lock().unwrap();

        let status = self.matcher.transaction(&self.sink, "cmd_cal_status", &[])?;
        if !status.success {
            return Ok(status);
        }
        if cal_done(&status)? && !force {
            return Ok(status);
        }

        info!("calibrating, this takes a while");
        let started =
            self.matcher
                .transaction(&self.sink, "cmd_cal", &[("force", Value::from(force))])?;
        if !started.success || !blocking {
            return Ok(started);
        }

        for _ in 0..CAL_POLL_RETRIES {
            thread::sleep(CAL_POLL_DELAY);
            let poll = self.matcher.transaction(&self.sink, "cmd_cal_status", &[])?;
            if !poll.success || cal_done(&poll)? {
                return Ok(poll);
            }
            debug!("calibration at {:?}", poll.last().and_then(|r| r.get("progress")));
        }

        error!("calibration still running after {} polls", CAL_POLL_RETRIES);
        Err(Error::CalibrationIncomplete)
    }

    /// Identify the device and configure revision-dependent behavior.
    pub fn ping(&self) -> Result<PingInfo, Error> {
        let _guard = self.cmd_lock.lock().unwrap();
        let reply = self.matcher.transaction(&self.sink, "cmd_ping", &[])?;
        let info = parse_ping(&reply);

        if let Some(hwver) = info.hwver.as_deref() {
            *self.hwver.lock().unwrap() = Some(hwver.to_string());
            if hwver == FILTERED_HWVER {
                // Compensate input stage peaking on this revision.
                let mut core = self.stream.core.lock().unwrap();
                core.adc.set_filter(true);
            }
        }

        info!(
            "ping: app {:?}, hwver {:?}, serial {:?}",
            info.app, info.hwver, info.serial
        );
        Ok(info)
    }

    /// Hardware revision learned from the last `ping`.
    pub fn hardware_version(&self) -> Option<String> {
        self.hwver.lock().unwrap().clone()
    }

    /// Start the bootloader upload; the response carries the block MTU.
    pub fn bootloader_init(&self) -> Result<CommandReply, Error> {
        self.command("bl_init", &[])
    }

    /// Upload one firmware block of at most the reported MTU.
    pub fn bootloader_block(&self, data: &[u8]) -> Result<CommandReply, Error> {
        self.command("bl_block", &[("data", Value::from(data))])
    }

    /// Finish the bootloader upload; the device reboots afterwards.
    pub fn bootloader_done(&self) -> Result<CommandReply, Error> {
        self.command("bl_done", &[])
    }

    /// Change the timebase; the window in progress is aborted.
    pub fn set_timebase(&self, span: TimebaseSpan) {
        let mut core = self.stream.core.lock().unwrap();
        core.engine.set_span(span);
    }

    pub fn timebase(&self) -> TimebaseSpan {
        self.stream.core.lock().unwrap().engine.span()
    }

    /// Change the trigger setup.
    ///
    /// Digital sources compare against the fixed presentation threshold,
    /// so the given level is overridden for them. Moving the trigger
    /// position aborts the window in progress.
    pub fn set_trigger(&self, mut config: TriggerConfig) {
        let mut core = self.stream.core.lock().unwrap();
        if matches!(config.source, TriggerSource::D0 | TriggerSource::D1) {
            config.level = core.adc.levels().digital_threshold();
        }
        info!(
            "trigger source {:?}, position {:?}, slope {:?}, level {}",
            config.source, config.position, config.slope, config.level
        );
        core.engine.set_trigger(config);
    }

    pub fn trigger(&self) -> TriggerConfig {
        *self.stream.core.lock().unwrap().engine.config()
    }

    /// Arm the engine and enable streaming on the device.
    ///
    /// While an acquisition is already running this only re-issues the
    /// stream enable.
    pub fn acquisition_start(&self, mode: AcquireMode) -> Result<CommandReply, Error> {
        let _guard = self.cmd_lock.lock().unwrap();
        if !self.stream.acquire.load(Ordering::SeqCst) {
            {
                let mut core = self.stream.core.lock().unwrap();
                core.engine.arm(mode);
                core.adc.reset();
            }
            self.stream.acquire.store(true, Ordering::SeqCst);
        }
        self.matcher
            .transaction(&self.sink, "cmd_adc", &[("en", Value::from(true))])
    }

    /// Disarm the engine and disable streaming on the device.
    pub fn acquisition_stop(&self) -> Result<CommandReply, Error> {
        let _guard = self.cmd_lock.lock().unwrap();
        self.stream.acquire.store(false, Ordering::SeqCst);
        {
            let mut core = self.stream.core.lock().unwrap();
            core.engine.clear();
            core.adc.reset();
        }
        self.matcher
            .transaction(&self.sink, "cmd_adc", &[("en", Value::from(false))])
    }

    /// Whether a completed window waits to be collected.
    pub fn acquisition_complete(&self) -> bool {
        self.stream.core.lock().unwrap().engine.data_ready()
    }

    /// Collect the completed window, rearming the engine.
    pub fn acquisition_get_data(&self) -> Result<AcquisitionData, Error> {
        let mut core = self.stream.core.lock().unwrap();
        core.engine.take_data().ok_or_else(|| {
            error!("no acquisition data to get");
            Error::NotReady
        })
    }

    /// Counter discontinuities seen on the sample stream.
    pub fn counter_gaps(&self) -> u64 {
        self.stream.core.lock().unwrap().adc.counter_gaps()
    }

    /// Samples lost to consumer back-pressure.
    pub fn dropped_samples(&self) -> u64 {
        self.stream.core.lock().unwrap().engine.dropped_samples()
    }
}

fn pump_loop(
    frames: mpsc::Receiver<Vec<u8>>,
    matcher: &ResponseMatcher,
    stream: &StreamShared,
    mut notification: Option<Box<dyn FnMut(Value) + Send>>,
    mut plot: Option<Box<dyn FnMut(Vec<u8>) + Send>>,
    mut device_log: Option<Box<dyn FnMut(LogRecord) + Send>>,
) {
    info!("frame pump started");

    while let Ok(frame) = frames.recv() {
        match mux::decode(&frame) {
            Ok(MuxFrame::Port {
                port: port::CONTROL,
                payload,
            }) => matcher.deliver(payload),
            Ok(MuxFrame::Port {
                port: port::ASYNC,
                payload,
            }) => match Value::from_bytes(payload) {
                Ok(item) => {
                    if let Some(cb) = notification.as_mut() {
                        cb(item);
                    }
                }
                Err(e) => error!("notification decode failed: {}", e),
            },
            Ok(MuxFrame::Port {
                port: port::PLOT,
                payload,
            }) => {
                if let Some(cb) = plot.as_mut() {
                    cb(payload.to_vec());
                }
            }
            Ok(MuxFrame::Port {
                port: port::ADC,
                payload,
            }) => stream.ingest(payload),
            Ok(MuxFrame::Port { port, .. }) => debug!("frame for unused stream {}", port),
            Ok(MuxFrame::Log {
                target,
                addr,
                payload,
            }) => {
                if let Some(cb) = device_log.as_mut() {
                    cb(LogRecord {
                        target,
                        addr,
                        payload: payload.to_vec(),
                    });
                }
            }
            Err(e) => warn!("undecodable frame: {}", e),
        }
    }

    info!("frame pump stopped");
}

fn cal_done(reply: &CommandReply) -> Result<bool, Error> {
    let response = reply
        .responses
        .first()
        .ok_or(cdc_currentmon_protocols::Error::MissingField("cal_done"))?;
    Ok(response.bool_field("cal_done")?)
}

fn parse_ping(reply: &CommandReply) -> PingInfo {
    // Responses are a list and nearly always hold a single item; the last
    // one carries the result.
    let last = reply.responses.last();

    let app = match last.and_then(|r| r.get("app")).and_then(Value::as_str) {
        Some("a51") => DeviceApp::Bootloader,
        Some("a43") => DeviceApp::Application,
        Some(other) => {
            warn!("unknown application id {:?}", other);
            DeviceApp::Unknown
        }
        None => DeviceApp::Unknown,
    };

    let version = last
        .and_then(|r| r.get("version"))
        .and_then(Value::as_str)
        .map(str::to_string);
    let serial = last
        .and_then(|r| r.get("serial"))
        .and_then(Value::as_bytes)
        .and_then(format_serial);
    let hwver = last
        .and_then(|r| r.get("hwver"))
        .and_then(Value::as_u64)
        .map(|v| format!("{:08X}", v));
    let high_speed = last
        .and_then(|r| r.get("hs"))
        .and_then(Value::as_bool)
        .unwrap_or(false);

    PingInfo {
        success: reply.success,
        app,
        version,
        serial,
        hwver,
        high_speed,
        responses: reply.responses.clone(),
    }
}

/// Format the serial field, three little-endian words most significant
/// first.
fn format_serial(raw: &[u8]) -> Option<String> {
    if raw.len() != 12 {
        warn!("serial field has {} bytes", raw.len());
        return None;
    }
    let word = |k: usize| u32::from_le_bytes([raw[k], raw[k + 1], raw[k + 2], raw[k + 3]]);
    Some(format!(
        "{:08X}-{:08X}-{:08X}",
        word(8),
        word(4),
        word(0)
    ))
}
