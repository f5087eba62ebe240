//! High/low watermark flow control for the row pipeline.
//!
//! The controller tracks two counters, remote operations (lookups and
//! downloads) and buffered manifest writes. It asks the row source to pause
//! once either counter exceeds the high watermark and to resume once both
//! drop below the low watermark, or once nothing is in flight at all. Between
//! the two marks nothing changes, so a burst hovering around the high mark
//! does not toggle the source on every operation.

/// What the row source should do after a counter change
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlowSignal {
    Pause,
    Resume,
    NoAction,
}

/// Kind of in-flight work being counted
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Operation {
    Remote,
    Write,
}

#[derive(Debug)]
pub struct BackpressureController {
    high_watermark: usize,
    low_watermark: usize,
    active_remote: usize,
    active_writes: usize,
    paused: bool,
}

impl BackpressureController {
    pub fn new(high_watermark: usize, low_watermark: usize) -> Self {
        Self {
            high_watermark,
            low_watermark,
            active_remote: 0,
            active_writes: 0,
            paused: false,
        }
    }

    pub fn on_start(&mut self, op: Operation) -> FlowSignal {
        match op {
            Operation::Remote => self.active_remote = self.active_remote.saturating_add(1),
            Operation::Write => self.active_writes = self.active_writes.saturating_add(1),
        }
        self.evaluate()
    }

    pub fn on_finish(&mut self, op: Operation) -> FlowSignal {
        match op {
            Operation::Remote => self.active_remote = self.active_remote.saturating_sub(1),
            Operation::Write => self.active_writes = self.active_writes.saturating_sub(1),
        }
        self.evaluate()
    }

    fn evaluate(&mut self) -> FlowSignal {
        let over_high =
            self.active_remote > self.high_watermark || self.active_writes > self.high_watermark;
        let under_low = self.is_idle()
            || (self.active_remote < self.low_watermark && self.active_writes < self.low_watermark);

        if !self.paused && over_high {
            self.paused = true;
            FlowSignal::Pause
        } else if self.paused && under_low {
            self.paused = false;
            FlowSignal::Resume
        } else {
            FlowSignal::NoAction
        }
    }

    pub fn is_paused(&self) -> bool {
        self.paused
    }

    pub fn active_remote(&self) -> usize {
        self.active_remote
    }

    pub fn active_writes(&self) -> usize {
        self.active_writes
    }

    /// No operation of either kind is in flight
    pub fn is_idle(&self) -> bool {
        self.active_remote == 0 && self.active_writes == 0
    }
}
