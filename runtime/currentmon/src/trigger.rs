// SPDX-License-Identifier: GPL-3.0-or-later
// Copyright (c) 2024 Takashi Sakamoto

//! Oscilloscope style trigger engine over the sample stream.
//!
//! Samples accumulate in a window sized for the timebase span. Once the
//! window is full it behaves as a FIFO and every arriving sample is tested
//! against the trigger setup at the configured window index. A completed
//! window is either pushed to the registered consumer callback or held
//! until the caller collects it; packets arriving while a window waits are
//! parked in a bounded overflow buffer so the stream never stalls.

use {
    std::{collections::VecDeque, sync::Arc},
    tracing::{debug, error, info, warn},
    cdc_currentmon_protocols::params::{
        AcquireMode, TimebaseSpan, TriggerConfig, TriggerSlope, TriggerSource, SAMPLE_RATE,
    },
    crate::stream::SamplePacket,
};

/// Samples per channel the overflow buffer holds while a window waits.
const OVERFLOW_CAPACITY: usize = 12_500;

/// Overflow fill level above which pressure is reported.
const OVERFLOW_WARN: usize = OVERFLOW_CAPACITY * 4 / 5;

/// Completed window handed to the consumer.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct AcquisitionData {
    /// Time of each sample relative to the trigger point, in seconds.
    pub t: Vec<f64>,
    /// Source current in mA.
    pub i: Vec<f64>,
    /// Sink current in mA.
    pub isnk: Vec<f64>,
    /// Auxiliary analog input.
    pub a0: Vec<f64>,
    /// Digital line 0 as presentation voltage.
    pub d0: Vec<f64>,
    /// Digital line 1 as presentation voltage.
    pub d1: Vec<f64>,
}

/// Consumer callback receiving each completed window.
pub type AcquisitionCallback = Box<dyn FnMut(AcquisitionData) + Send>;

#[derive(Copy, Clone)]
struct Sample {
    i: f64,
    isnk: f64,
    a0: f64,
    d0: f64,
    d1: f64,
}

fn sample_at(packet: &SamplePacket, k: usize) -> Sample {
    Sample {
        i: packet.i[k],
        isnk: packet.isnk[k],
        a0: packet.a0[k],
        d0: packet.d0[k],
        d1: packet.d1[k],
    }
}

/// Ring of the most recent window of samples per channel.
#[derive(Debug, Default)]
struct Window {
    i: VecDeque<f64>,
    isnk: VecDeque<f64>,
    a0: VecDeque<f64>,
    d0: VecDeque<f64>,
    d1: VecDeque<f64>,
}

impl Window {
    fn with_capacity(n: usize) -> Self {
        Window {
            i: VecDeque::with_capacity(n),
            isnk: VecDeque::with_capacity(n),
            a0: VecDeque::with_capacity(n),
            d0: VecDeque::with_capacity(n),
            d1: VecDeque::with_capacity(n),
        }
    }

    fn len(&self) -> usize {
        self.i.len()
    }

    /// Append one sample, dropping the oldest once the capacity is
    /// reached.
    fn push(&mut self, capacity: usize, s: Sample) {
        if self.i.len() == capacity {
            let _ = self.i.pop_front();
            let _ = self.isnk.pop_front();
            let _ = self.a0.pop_front();
            let _ = self.d0.pop_front();
            let _ = self.d1.pop_front();
        }
        self.i.push_back(s.i);
        self.isnk.push_back(s.isnk);
        self.a0.push_back(s.a0);
        self.d0.push_back(s.d0);
        self.d1.push_back(s.d1);
    }

    fn source_channel(&self, source: TriggerSource) -> &VecDeque<f64> {
        match source {
            TriggerSource::Current | TriggerSource::None => &self.i,
            TriggerSource::A0 => &self.a0,
            TriggerSource::D0 => &self.d0,
            TriggerSource::D1 => &self.d1,
        }
    }
}

/// Holding buffer for packets arriving while a window waits to be read.
#[derive(Debug, Default)]
struct Overflow {
    i: Vec<f64>,
    isnk: Vec<f64>,
    a0: Vec<f64>,
    d0: Vec<f64>,
    d1: Vec<f64>,
    warned: bool,
}

impl Overflow {
    fn len(&self) -> usize {
        self.i.len()
    }

    fn clear(&mut self) {
        self.i.clear();
        self.isnk.clear();
        self.a0.clear();
        self.d0.clear();
        self.d1.clear();
        self.warned = false;
    }
}

/// Trigger state machine and windowed ring buffer.
pub struct TriggerEngine {
    mode: AcquireMode,
    trigger: TriggerConfig,
    span: TimebaseSpan,
    num_samples: usize,
    trigger_idx: usize,
    precond: bool,
    triggered: bool,
    data_ready: bool,
    window: Window,
    overflow: Overflow,
    time_axis: Arc<Vec<f64>>,
    time_axis_stale: bool,
    dropped_samples: u64,
    callback: Option<AcquisitionCallback>,
}

impl Default for TriggerEngine {
    fn default() -> Self {
        Self::new(Default::default(), Default::default(), Default::default())
    }
}

impl TriggerEngine {
    pub fn new(span: TimebaseSpan, trigger: TriggerConfig, mode: AcquireMode) -> Self {
        let mut engine = TriggerEngine {
            mode,
            trigger,
            span,
            num_samples: 0,
            trigger_idx: 0,
            precond: false,
            triggered: false,
            data_ready: false,
            window: Default::default(),
            overflow: Default::default(),
            time_axis: Arc::new(Vec::new()),
            time_axis_stale: true,
            dropped_samples: 0,
            callback: None,
        };
        engine.rebuild();
        engine
    }

    pub fn span(&self) -> TimebaseSpan {
        self.span
    }

    pub fn config(&self) -> &TriggerConfig {
        &self.trigger
    }

    pub fn mode(&self) -> AcquireMode {
        self.mode
    }

    pub fn num_samples(&self) -> usize {
        self.num_samples
    }

    pub fn data_ready(&self) -> bool {
        self.data_ready
    }

    /// Samples parked while the previous window waited.
    pub fn buffered_samples(&self) -> usize {
        self.overflow.len()
    }

    /// Samples lost to overflow pressure since the last clear.
    pub fn dropped_samples(&self) -> u64 {
        self.dropped_samples
    }

    /// Register or remove the consumer callback.
    pub fn set_callback(&mut self, callback: Option<AcquisitionCallback>) {
        self.callback = callback;
    }

    /// Change the timebase, aborting the window in progress.
    pub fn set_span(&mut self, span: TimebaseSpan) {
        self.span = span;
        self.rebuild();
    }

    /// Change the trigger setup; moving the trigger position aborts the
    /// window in progress.
    pub fn set_trigger(&mut self, trigger: TriggerConfig) {
        let moved = trigger.position != self.trigger.position;
        self.trigger = trigger;
        if moved {
            self.rebuild();
        }
    }

    /// Arm for a fresh acquisition in the given mode.
    pub fn arm(&mut self, mode: AcquireMode) {
        self.mode = mode;
        self.rebuild();
    }

    /// Abort: drop window, overflow and loss accounting.
    pub fn clear(&mut self) {
        self.rebuild();
        self.overflow.clear();
        self.dropped_samples = 0;
    }

    /// Recompute the geometry and restart the window from empty.
    fn rebuild(&mut self) {
        self.num_samples = self.span.num_samples();
        self.trigger_idx = self.trigger.position.index(self.num_samples);
        self.time_axis_stale = true;
        self.reset_window();
    }

    /// Restart the window from empty, keeping geometry and time axis.
    fn reset_window(&mut self) {
        self.window = Window::with_capacity(self.num_samples);
        self.triggered = false;
        self.data_ready = false;
        self.precond = false;
    }

    /// Feed one decoded packet through the state machine.
    pub fn on_packet(&mut self, packet: &SamplePacket) {
        if self.data_ready {
            self.stash(packet);
            return;
        }

        if self.overflow.len() > 0 {
            self.drain();
        }

        if self.window.len() < self.num_samples {
            let take = packet.i.len().min(self.num_samples - self.window.len());
            for k in 0..take {
                self.window.push(self.num_samples, sample_at(packet, k));
            }
            if self.window.len() < self.num_samples {
                return;
            }
        }

        match self.mode {
            AcquireMode::Run | AcquireMode::Single => {
                if self.trigger.source == TriggerSource::None {
                    self.triggered = true;
                } else if !self.triggered {
                    self.scan(packet);
                }
            }
            AcquireMode::Logger => {
                if !self.triggered {
                    info!("window full at packet {}", packet.count);
                    self.triggered = true;
                }
            }
        }

        if self.triggered && !self.data_ready {
            self.finish();
        }
    }

    /// Push the packet through the FIFO, testing the trigger condition
    /// after every sample.
    fn scan(&mut self, packet: &SamplePacket) {
        let level = self.trigger.level;
        let rising = match self.trigger.slope {
            TriggerSlope::Rise => true,
            TriggerSlope::Fall => false,
            // Resolved once per packet from the current state of the
            // signal at the trigger point.
            TriggerSlope::Either => {
                self.window.source_channel(self.trigger.source)[self.trigger_idx] < level
            }
        };

        for k in 0..packet.i.len() {
            self.window.push(self.num_samples, sample_at(packet, k));
            let val = self.window.source_channel(self.trigger.source)[self.trigger_idx];
            let (armed, fired) = if rising {
                (val < level, val > level)
            } else {
                (val > level, val < level)
            };
            if !self.precond {
                if armed {
                    self.precond = true;
                }
            } else if fired {
                self.triggered = true;
                break;
            }
        }
    }

    /// Mark the window complete and deliver it.
    fn finish(&mut self) {
        if self.time_axis_stale {
            let t_start = self.trigger.position.start_time(self.span.seconds());
            let t = (0..self.num_samples)
                .map(|k| t_start + k as f64 / SAMPLE_RATE)
                .collect();
            self.time_axis = Arc::new(t);
            self.time_axis_stale = false;
        }

        self.data_ready = true;
        self.precond = false;

        if self.callback.is_some() {
            let data = self.snapshot();
            if let Some(cb) = self.callback.as_mut() {
                cb(data);
            }
            self.reset_window();
        }
    }

    fn snapshot(&self) -> AcquisitionData {
        AcquisitionData {
            t: self.time_axis.as_ref().clone(),
            i: self.window.i.iter().copied().collect(),
            isnk: self.window.isnk.iter().copied().collect(),
            a0: self.window.a0.iter().copied().collect(),
            d0: self.window.d0.iter().copied().collect(),
            d1: self.window.d1.iter().copied().collect(),
        }
    }

    /// Collect the completed window, rearming the engine.
    pub fn take_data(&mut self) -> Option<AcquisitionData> {
        if !self.data_ready {
            return None;
        }
        let data = self.snapshot();
        self.reset_window();
        Some(data)
    }

    fn stash(&mut self, packet: &SamplePacket) {
        let n = packet.i.len();
        if self.overflow.len() + n > OVERFLOW_CAPACITY {
            self.dropped_samples += n as u64;
            error!(
                "overflow buffer exhausted, dropped {} samples so far",
                self.dropped_samples
            );
            return;
        }

        self.overflow.i.extend_from_slice(&packet.i);
        self.overflow.isnk.extend_from_slice(&packet.isnk);
        self.overflow.a0.extend_from_slice(&packet.a0);
        self.overflow.d0.extend_from_slice(&packet.d0);
        self.overflow.d1.extend_from_slice(&packet.d1);

        if !self.overflow.warned && self.overflow.len() >= OVERFLOW_WARN {
            warn!(
                "overflow buffer at {} of {} samples",
                self.overflow.len(),
                OVERFLOW_CAPACITY
            );
            self.overflow.warned = true;
        }
    }

    fn drain(&mut self) {
        for k in 0..self.overflow.len() {
            self.window.push(
                self.num_samples,
                Sample {
                    i: self.overflow.i[k],
                    isnk: self.overflow.isnk[k],
                    a0: self.overflow.a0[k],
                    d0: self.overflow.d0[k],
                    d1: self.overflow.d1[k],
                },
            );
        }
        debug!("drained {} buffered samples into the window", self.overflow.len());
        self.overflow.clear();
    }
}
