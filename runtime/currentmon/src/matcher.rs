// SPDX-License-Identifier: GPL-3.0-or-later
// Copyright (c) 2024 Takashi Sakamoto

//! Request/response correlation on the control port.
//!
//! Responses are matched to the in-flight request by their `f` field, not
//! by arrival order. The public command surface serializes requests, so a
//! single correlation key is outstanding at any time, but the matching
//! itself would support several.

use {
    std::{
        collections::HashMap,
        sync::{Condvar, Mutex},
        time::Duration,
    },
    tracing::{error, warn},
    cdc_currentmon_protocols::{command, command::Response, port, value::Value},
    crate::{Error, FrameSink},
};

/// One wait slice on the response condition.
const WAIT_SLICE: Duration = Duration::from_millis(100);

/// Wait slices granted to one transaction.
const WAIT_SLICES: u32 = 8;

/// Remaining slice count below which timeouts are logged.
const WARN_SLICES: u32 = 3;

/// Result of one command transaction.
#[derive(Debug, Clone, PartialEq)]
pub struct CommandReply {
    /// Success flag of the last response.
    pub success: bool,
    /// Every response observed for the correlation key, in arrival order.
    pub responses: Vec<Response>,
}

impl CommandReply {
    /// The response carrying the result, which is always the last one.
    pub fn last(&self) -> Option<&Response> {
        self.responses.last()
    }
}

/// Matches control-port responses to the request awaiting them.
#[derive(Default)]
pub struct ResponseMatcher {
    pending: Mutex<HashMap<String, Vec<Response>>>,
    arrival: Condvar,
}

impl ResponseMatcher {
    /// Send a request and block until its responses arrive.
    ///
    /// The wait budget is eight slices of 100 ms. A response list left by
    /// an earlier request with the same name is discarded before sending.
    pub fn transaction(
        &self,
        sink: &dyn FrameSink,
        f: &str,
        args: &[(&str, Value)],
    ) -> Result<CommandReply, Error> {
        let payload = command::encode_request(f, args)?;
        {
            let mut pending = self.pending.lock().unwrap();
            pending.insert(f.to_string(), Vec::new());
            if let Err(e) = sink.send_frame(port::CONTROL, &payload) {
                pending.remove(f);
                return Err(e);
            }
        }

        for remaining in (0..WAIT_SLICES).rev() {
            let guard = self.pending.lock().unwrap();
            let (mut pending, _) = self.arrival.wait_timeout(guard, WAIT_SLICE).unwrap();
            if pending.get(f).map_or(false, |list| !list.is_empty()) {
                let responses = pending.remove(f).unwrap_or_default();
                let success = match responses.last().map(Response::success) {
                    Some(Ok(success)) => success,
                    _ => {
                        warn!("{}: response carries no success flag", f);
                        false
                    }
                };
                return Ok(CommandReply { success, responses });
            }
            drop(pending);
            if (1..=WARN_SLICES).contains(&remaining) {
                warn!("{}: no response yet, {} retries left", f, remaining);
            }
        }

        self.pending.lock().unwrap().remove(f);
        error!("{}: timed out waiting for response", f);
        Err(Error::Timeout(f.to_string()))
    }

    /// Deliver a control-port frame from the pump thread.
    ///
    /// Frames for a key nobody reserved are kept for diagnosis but wake no
    /// caller; the next transaction with that name discards them.
    pub fn deliver(&self, frame: &[u8]) {
        let response = match Response::from_bytes(frame) {
            Ok(response) => response,
            Err(e) => {
                error!("control frame decode failed: {}", e);
                return;
            }
        };
        let f = match response.function() {
            Ok(f) => f.to_string(),
            Err(_) => {
                error!("control response without function key");
                return;
            }
        };

        let mut pending = self.pending.lock().unwrap();
        match pending.get_mut(&f) {
            Some(list) => {
                list.push(response);
                self.arrival.notify_all();
            }
            None => {
                warn!("unexpected response for {:?}", f);
                pending.insert(f, vec![response]);
            }
        }
    }

    /// Responses currently parked for a key, for diagnosis in tests and
    /// logs.
    pub fn parked(&self, f: &str) -> usize {
        self.pending
            .lock()
            .unwrap()
            .get(f)
            .map_or(0, |list| list.len())
    }
}
