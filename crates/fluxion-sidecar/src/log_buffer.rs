// Copyright (c) 2025 SOLARE S.R.O.
//
// This file is part of FluxION.
//
// Licensed under the Creative Commons Attribution-NonCommercial-NoDerivatives 4.0 International
// (CC BY-NC-ND 4.0). You may use and share this file for non-commercial purposes only and you may not
// create derivatives. See <https://creativecommons.org/licenses/by-nc-nd/4.0/>.
//
// This software is provided "AS IS", without warranty of any kind.
//
// For commercial licensing, please contact: info@solare.cz

//! Bounded FIFO buffer of captured child-process output lines

use ringbuffer::{AllocRingBuffer, RingBuffer};

pub const DEFAULT_LOG_CAPACITY: usize = 500;

#[derive(Debug)]
pub struct LogBuffer {
    lines: AllocRingBuffer<String>,
    /// Lines ever pushed, survives `clear`
    total: u64,
}

impl LogBuffer {
    /// A capacity of zero is raised to one line.
    pub fn new(capacity: usize) -> Self {
        Self {
            lines: AllocRingBuffer::new(capacity.max(1)),
            total: 0,
        }
    }

    pub fn capacity(&self) -> usize {
        self.lines.capacity()
    }

    pub fn len(&self) -> usize {
        self.lines.len()
    }

    pub fn is_empty(&self) -> bool {
        self.lines.is_empty()
    }

    /// Append one line, evicting the oldest when full.
    pub fn push(&mut self, line: impl Into<String>) {
        let _ = self.lines.enqueue(line.into());
        self.total += 1;
    }

    /// Sequence number of the next line to be pushed
    pub fn total(&self) -> u64 {
        self.total
    }

    /// Split decoded output on line breaks and append the non-empty lines.
    pub fn push_text(&mut self, text: &str) {
        for line in text.split(['\n', '\r']) {
            if !line.trim().is_empty() {
                self.push(line);
            }
        }
    }

    pub fn clear(&mut self) {
        self.lines.clear();
    }

    /// Owned copy of the buffered lines, oldest first
    pub fn snapshot(&self) -> Vec<String> {
        self.lines.iter().cloned().collect()
    }

    /// Buffered lines pushed after `seen` lines, with the new sequence
    /// number. Lines already evicted are skipped.
    pub fn since(&self, seen: u64) -> (Vec<String>, u64) {
        let buffered = u64::try_from(self.lines.len()).unwrap_or(u64::MAX);
        let first = self.total.saturating_sub(buffered);
        let skip = usize::try_from(seen.saturating_sub(first)).unwrap_or(usize::MAX);
        let lines = self.lines.iter().skip(skip).cloned().collect();
        (lines, self.total)
    }
}

impl Default for LogBuffer {
    fn default() -> Self {
        Self::new(DEFAULT_LOG_CAPACITY)
    }
}
